//! HTTP readiness probe for freshly started engines.

use std::time::Duration;

use bytes::Bytes;
use http::{Request, StatusCode};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use scanfleet_core::{ConfigResult, ProbeConfig};

/// Result of a single readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint returned 2xx.
    Ready,
    /// The endpoint answered with a non-2xx status.
    NotReady,
    /// No answer: connection error or timeout.
    Failed,
}

/// Why a probe got no HTTP answer.
#[derive(Debug, Error)]
enum ProbeError {
    #[error("connect: {0}")]
    Connect(#[from] std::io::Error),

    #[error("http: {0}")]
    Http(#[from] hyper::Error),

    #[error("request: {0}")]
    Request(#[from] http::Error),

    #[error("no answer within {0:?}")]
    Timeout(Duration),
}

/// Probes `GET {path}` on an engine host.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    path: String,
    timeout: Duration,
}

impl ReadinessProbe {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') { path } else { format!("/{path}") };
        Self { path, timeout }
    }

    pub fn from_config(config: &ProbeConfig) -> ConfigResult<Self> {
        Ok(Self::new(config.path.clone(), config.timeout()?))
    }

    /// Ready on 2xx, not ready on any other status, failed on no answer.
    pub async fn check(&self, host: &str) -> ProbeResult {
        let answer = tokio::time::timeout(self.timeout, self.status(host))
            .await
            .unwrap_or(Err(ProbeError::Timeout(self.timeout)));

        match answer {
            Ok(status) if status.is_success() => ProbeResult::Ready,
            Ok(status) => {
                debug!(%host, path = %self.path, %status, "engine answered but is not ready");
                ProbeResult::NotReady
            }
            Err(e) => {
                debug!(%host, path = %self.path, error = %e, "readiness probe got no answer");
                ProbeResult::Failed
            }
        }
    }

    /// One HTTP/1 exchange on a fresh connection.
    async fn status(&self, host: &str) -> Result<StatusCode, ProbeError> {
        let stream = TcpStream::connect(host).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let request = Request::get(format!("http://{host}{}", self.path))
            .header(http::header::HOST, host)
            .header(http::header::USER_AGENT, "scanfleet-readiness/0.1")
            .body(Empty::<Bytes>::new())?;
        Ok(sender.send_request(request).await?.status())
    }
}
