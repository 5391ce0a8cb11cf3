//! Host picking strategies.
//!
//! Candidates are always sorted and de-duplicated first, so the result
//! depends only on the candidate *set*, never on the order it was
//! supplied in.
//!
//! - `DeterministicOneHost(seed)` — the same host for the same seed and
//!   set, in every process.
//! - `Deterministic(seed)` — a seeded shuffle; two pickers with the same
//!   seed produce identical sequences.
//! - `RandomOneHost` — one host chosen at random when the picker is built.
//! - `Random` — a shuffle from a fresh random source per picker.
//!
//! Pickers draw from ChaCha8, whose output stream is fixed for a given
//! seed, so seeded orders hold across releases as well as processes.

use std::collections::VecDeque;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// How a rollout chooses and orders its target hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostPickingStrategy {
    DeterministicOneHost { seed: String },
    Deterministic { seed: String },
    RandomOneHost,
    Random,
}

impl Default for HostPickingStrategy {
    fn default() -> Self {
        Self::Random
    }
}

impl HostPickingStrategy {
    /// Build a picker for this strategy.
    pub fn build(&self) -> HostPicker {
        match self {
            Self::DeterministicOneHost { seed } => deterministic_one_host(seed),
            Self::Deterministic { seed } => deterministic(seed),
            Self::RandomOneHost => random_one_host(),
            Self::Random => random(),
        }
    }

    /// Whether the strategy selects a single host rather than ordering all.
    pub fn is_one_host(&self) -> bool {
        matches!(self, Self::DeterministicOneHost { .. } | Self::RandomOneHost)
    }
}

pub fn deterministic_one_host(seed: &str) -> HostPicker {
    let digest = seed_digest(seed);
    let mut choice = [0u8; 8];
    choice.copy_from_slice(&digest[..8]);
    HostPicker::new(
        Mode::OneHost {
            choice: u64::from_be_bytes(choice),
        },
        ChaCha8Rng::from_seed(digest),
    )
}

pub fn deterministic(seed: &str) -> HostPicker {
    HostPicker::new(Mode::Permute, ChaCha8Rng::from_seed(seed_digest(seed)))
}

pub fn random_one_host() -> HostPicker {
    let mut rng = ChaCha8Rng::from_rng(&mut rand::rng());
    let choice = rng.random::<u64>();
    HostPicker::new(Mode::OneHost { choice }, rng)
}

pub fn random() -> HostPicker {
    HostPicker::new(Mode::Permute, ChaCha8Rng::from_rng(&mut rand::rng()))
}

fn seed_digest(seed: &str) -> [u8; 32] {
    Sha256::digest(seed.as_bytes()).into()
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    /// Always `sorted[choice % len]`.
    OneHost { choice: u64 },
    /// Successive shuffled passes over the candidate set.
    Permute,
}

/// Stateful picker built from a [`HostPickingStrategy`].
///
/// `pick_host` hands out hosts one at a time; for ordering strategies
/// every run of `|candidates|` consecutive picks (aligned to a pass) is
/// a permutation of the candidate set, so no host is starved.
#[derive(Debug)]
pub struct HostPicker {
    mode: Mode,
    rng: ChaCha8Rng,
    /// Remaining hosts of the current pass.
    pending: VecDeque<String>,
    /// Candidate set the current pass was drawn from.
    pass_of: Vec<String>,
}

impl HostPicker {
    fn new(mode: Mode, rng: ChaCha8Rng) -> Self {
        Self {
            mode,
            rng,
            pending: VecDeque::new(),
            pass_of: Vec::new(),
        }
    }

    /// Pick the next host, or `None` for an empty candidate set.
    pub fn pick_host<S: AsRef<str>>(&mut self, candidates: &[S]) -> Option<String> {
        let sorted = normalize(candidates);
        if sorted.is_empty() {
            return None;
        }
        match self.mode {
            Mode::OneHost { choice } => Some(sorted[index(choice, sorted.len())].clone()),
            Mode::Permute => {
                if self.pass_of != sorted {
                    self.pending.clear();
                }
                if self.pending.is_empty() {
                    let pass = self.shuffle(&sorted);
                    self.pending.extend(pass);
                    self.pass_of = sorted;
                }
                self.pending.pop_front()
            }
        }
    }

    /// Order the candidates for a rollout: a full permutation for ordering
    /// strategies, a single host for one-host strategies.
    pub fn order<S: AsRef<str>>(&mut self, candidates: &[S]) -> Vec<String> {
        match self.mode {
            Mode::OneHost { .. } => self.pick_host(candidates).into_iter().collect(),
            Mode::Permute => {
                let sorted = normalize(candidates);
                let order = self.shuffle(&sorted);
                debug!(hosts = order.len(), "host order computed");
                order
            }
        }
    }

    fn shuffle(&mut self, sorted: &[String]) -> Vec<String> {
        let mut pass = sorted.to_vec();
        pass.shuffle(&mut self.rng);
        pass
    }
}

fn normalize<S: AsRef<str>>(candidates: &[S]) -> Vec<String> {
    let mut sorted: Vec<String> = candidates.iter().map(|c| c.as_ref().to_string()).collect();
    sorted.sort();
    sorted.dedup();
    sorted
}

fn index(choice: u64, len: usize) -> usize {
    // len > 0 and fits in u64; the remainder is < len.
    usize::try_from(choice % len as u64).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const NUM_ITERATIONS: usize = 1000;
    const HOSTS: [&str; 4] = ["hosta", "hostb", "hostc", "hostd"];

    #[test]
    fn deterministic_one_host_always_same_host() {
        let mut chosen = HashSet::new();
        let mut picker1 = deterministic_one_host("");
        for _ in 0..NUM_ITERATIONS {
            chosen.insert(picker1.pick_host(&HOSTS).unwrap());
        }
        let mut picker2 = deterministic_one_host("");
        for _ in 0..NUM_ITERATIONS {
            chosen.insert(picker2.pick_host(&HOSTS).unwrap());
        }
        assert_eq!(chosen.len(), 1);
    }

    #[test]
    fn deterministic_one_host_ignores_candidate_order() {
        let mut shuffled = HOSTS;
        shuffled.reverse();
        let a = deterministic_one_host("group-a").pick_host(&HOSTS);
        let b = deterministic_one_host("group-a").pick_host(&shuffled);
        assert_eq!(a, b);
        assert_eq!(deterministic_one_host("group-a").order(&HOSTS), vec![a.unwrap()]);
    }

    #[test]
    fn deterministic_reproduces_sequence() {
        let mut order = Vec::new();
        let mut chosen = HashSet::new();
        let mut picker1 = deterministic("");
        for _ in 0..NUM_ITERATIONS {
            let picked = picker1.pick_host(&HOSTS).unwrap();
            order.push(picked.clone());
            chosen.insert(picked);
        }
        // should've hit them all
        assert_eq!(chosen.len(), HOSTS.len());

        let mut picker2 = deterministic("");
        for (i, expected) in order.iter().enumerate() {
            assert_eq!(&picker2.pick_host(&HOSTS).unwrap(), expected, "at index {i}");
        }
    }

    #[test]
    fn deterministic_order_is_reproducible_permutation() {
        let a = deterministic("canary").order(&HOSTS);
        let b = deterministic("canary").order(&HOSTS);
        assert_eq!(a, b);

        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, HOSTS);
    }

    #[test]
    fn deterministic_order_is_a_chacha8_shuffle_of_the_seed_digest() {
        let mut expected: Vec<String> = HOSTS.iter().map(|h| h.to_string()).collect();
        let mut rng = ChaCha8Rng::from_seed(Sha256::digest(b"canary").into());
        expected.shuffle(&mut rng);
        assert_eq!(deterministic("canary").order(&HOSTS), expected);
    }

    #[test]
    fn deterministic_covers_all_within_one_pass() {
        let mut picker = deterministic("pass");
        for _ in 0..10 {
            let pass: HashSet<String> =
                (0..HOSTS.len()).map(|_| picker.pick_host(&HOSTS).unwrap()).collect();
            assert_eq!(pass.len(), HOSTS.len());
        }
    }

    #[test]
    fn random_one_host_is_stable_per_picker() {
        let mut chosen = HashSet::new();
        let mut picker = random_one_host();
        for _ in 0..NUM_ITERATIONS {
            chosen.insert(picker.pick_host(&HOSTS).unwrap());
        }
        assert_eq!(chosen.len(), 1);
    }

    #[test]
    fn random_one_host_diverges_across_pickers() {
        let chosen: HashSet<String> = (0..64)
            .map(|_| random_one_host().pick_host(&HOSTS).unwrap())
            .collect();
        assert!(chosen.len() > 1);
    }

    #[test]
    fn random_covers_all_and_diverges() {
        let mut order = Vec::new();
        let mut chosen = HashSet::new();
        let mut picker1 = random();
        for _ in 0..NUM_ITERATIONS {
            let picked = picker1.pick_host(&HOSTS).unwrap();
            order.push(picked.clone());
            chosen.insert(picked);
        }
        // should've hit them all
        assert_eq!(chosen.len(), HOSTS.len());

        let mut picker2 = random();
        let different = order
            .iter()
            .any(|expected| picker2.pick_host(&HOSTS).as_ref() != Some(expected));
        assert!(different);
    }

    #[test]
    fn orderings_have_no_duplicates_or_strangers() {
        let with_dupes = ["hostb", "hosta", "hostb", "hostc", "hostd", "hosta"];
        for mut picker in [deterministic("x"), random()] {
            let order = picker.order(&with_dupes);
            assert_eq!(order.len(), 4);
            let set: HashSet<&String> = order.iter().collect();
            assert_eq!(set.len(), 4);
            assert!(order.iter().all(|h| HOSTS.contains(&h.as_str())));
        }
    }

    #[test]
    fn changing_candidates_starts_a_new_pass() {
        let mut picker = deterministic("shrink");
        picker.pick_host(&HOSTS);
        for _ in 0..20 {
            let host = picker.pick_host(&["hosta", "hostb"]).unwrap();
            assert!(host == "hosta" || host == "hostb");
        }
    }

    #[test]
    fn empty_candidates() {
        let empty: [&str; 0] = [];
        assert_eq!(random().pick_host(&empty), None);
        assert!(deterministic("x").order(&empty).is_empty());
        assert!(deterministic_one_host("x").order(&empty).is_empty());
    }

    #[test]
    fn strategy_config_roundtrip() {
        let s: HostPickingStrategy =
            serde_json::from_str(r#"{"type":"deterministic","seed":"g1"}"#).unwrap();
        assert_eq!(
            s,
            HostPickingStrategy::Deterministic {
                seed: "g1".to_string()
            }
        );
        assert!(!s.is_one_host());
        assert!(HostPickingStrategy::RandomOneHost.is_one_host());
        assert_eq!(HostPickingStrategy::default(), HostPickingStrategy::Random);
    }
}
