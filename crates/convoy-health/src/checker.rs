//! Single-attempt health probes.
//!
//! Each probe is bounded by a timeout and never returns an error: a
//! refused connection, a non-2xx response or a non-zero exit code are all
//! just failed attempts.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::debug;

/// Boxed future returned by the [`Exec`] seam.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// 2xx response, established connection, or exit code 0.
    Healthy,
    /// The check ran and reported failure.
    Unhealthy,
    /// The probe could not be executed (connection error, timeout).
    Failed,
}

impl ProbeResult {
    pub fn passed(self) -> bool {
        self == Self::Healthy
    }
}

/// Runs a command inside a running instance and yields its exit code.
pub trait Exec: Send + Sync {
    fn exec<'a>(&'a self, command: &'a [String]) -> BoxFuture<'a, anyhow::Result<i32>>;
}

/// Runs exec checks as processes on the local host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExec;

impl Exec for LocalExec {
    fn exec<'a>(&'a self, command: &'a [String]) -> BoxFuture<'a, anyhow::Result<i32>> {
        Box::pin(async move {
            let (program, args) = command
                .split_first()
                .ok_or_else(|| anyhow::anyhow!("empty exec command"))?;
            let status = tokio::process::Command::new(program)
                .args(args)
                .kill_on_drop(true)
                .status()
                .await?;
            Ok(status.code().unwrap_or(-1))
        })
    }
}

/// Perform an HTTP GET probe against `address` (`host:port`).
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "http probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "http probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "convoy-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "http probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "http probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "http probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "http probe timed out");
        ProbeResult::Failed
    })
}

/// Attempt a TCP connection to `address` (`host:port`).
pub async fn tcp_probe(address: &str, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(address)).await {
        Ok(Ok(_)) => ProbeResult::Healthy,
        Ok(Err(e)) => {
            debug!(error = %e, %address, "tcp probe connection failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(%address, "tcp probe timed out");
            ProbeResult::Failed
        }
    }
}

/// Run `command` through `exec`; exit code 0 passes.
pub async fn exec_probe(exec: &dyn Exec, command: &[String], timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, exec.exec(command)).await {
        Ok(Ok(0)) => ProbeResult::Healthy,
        Ok(Ok(code)) => {
            debug!(code, ?command, "exec probe non-zero exit");
            ProbeResult::Unhealthy
        }
        Ok(Err(e)) => {
            debug!(error = %e, ?command, "exec probe could not run");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(?command, "exec probe timed out");
            ProbeResult::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use http_body_util::Full;
    use hyper::service::service_fn;
    use hyper::{Response, StatusCode};
    use tokio::net::TcpListener;

    /// Serve every request with `status` on an ephemeral port.
    async fn serve(status: StatusCode) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let service = service_fn(move |_req| async move {
                        let mut resp = Response::new(Full::new(bytes::Bytes::from_static(b"ok")));
                        *resp.status_mut() = status;
                        Ok::<_, Infallible>(resp)
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(hyper_util::rt::TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    struct FixedExit(i32);

    impl Exec for FixedExit {
        fn exec<'a>(&'a self, _command: &'a [String]) -> BoxFuture<'a, anyhow::Result<i32>> {
            let code = self.0;
            Box::pin(async move { Ok(code) })
        }
    }

    struct Hangs;

    impl Exec for Hangs {
        fn exec<'a>(&'a self, _command: &'a [String]) -> BoxFuture<'a, anyhow::Result<i32>> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn http_probe_2xx_is_healthy() {
        let addr = serve(StatusCode::OK).await;
        let result = http_probe(&addr, "/healthz", Duration::from_secs(1)).await;
        assert_eq!(result, ProbeResult::Healthy);
    }

    #[tokio::test]
    async fn http_probe_5xx_is_unhealthy() {
        let addr = serve(StatusCode::SERVICE_UNAVAILABLE).await;
        let result = http_probe(&addr, "/healthz", Duration::from_secs(1)).await;
        assert_eq!(result, ProbeResult::Unhealthy);
    }

    #[tokio::test]
    async fn http_probe_to_closed_port_returns_failed() {
        let result = http_probe("127.0.0.1:1", "/healthz", Duration::from_millis(100)).await;
        assert_eq!(result, ProbeResult::Failed);
    }

    #[tokio::test]
    async fn tcp_probe_open_and_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert_eq!(
            tcp_probe(&addr, Duration::from_secs(1)).await,
            ProbeResult::Healthy
        );
        drop(listener);
        assert_eq!(
            tcp_probe("127.0.0.1:1", Duration::from_millis(100)).await,
            ProbeResult::Failed
        );
    }

    #[tokio::test]
    async fn exec_probe_maps_exit_codes() {
        let cmd = vec!["check".to_string()];
        let timeout = Duration::from_millis(100);
        assert_eq!(exec_probe(&FixedExit(0), &cmd, timeout).await, ProbeResult::Healthy);
        assert_eq!(exec_probe(&FixedExit(2), &cmd, timeout).await, ProbeResult::Unhealthy);
        assert_eq!(exec_probe(&Hangs, &cmd, timeout).await, ProbeResult::Failed);
    }

    #[tokio::test]
    async fn local_exec_rejects_empty_command() {
        assert!(LocalExec.exec(&[]).await.is_err());
    }
}
