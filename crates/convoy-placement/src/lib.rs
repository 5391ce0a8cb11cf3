//! Convoy host picking — which hosts receive a job, and in what order.
//!
//! A [`HostPickingStrategy`] is plain configuration; [`HostPickingStrategy::build`]
//! turns it into a [`HostPicker`] that answers `pick_host` and `order`
//! queries over a candidate set.
//!
//! # Components
//!
//! - **`strategy`** — the four strategies and the picker they build

pub mod strategy;

pub use strategy::{
    deterministic, deterministic_one_host, random, random_one_host, HostPicker,
    HostPickingStrategy,
};
