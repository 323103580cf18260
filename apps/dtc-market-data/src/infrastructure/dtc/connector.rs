//! TCP transport for DTC sessions.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::application::ports::{BoxedStream, ConnectionError, Connector};

/// Default time allowed for the TCP handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens plain TCP connections to a DTC server.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpConnector {
    /// Connector for `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the connect timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `host:port`.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedStream, ConnectionError> {
        let addr = self.addr();
        tracing::debug!(addr = %addr, "Opening TCP connection");

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectionError::Timeout {
                addr: addr.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| ConnectionError::Connect {
                addr: addr.clone(),
                source,
            })?;

        // DTC frames are small and latency matters more than throughput.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(addr = %addr, error = %e, "Could not set TCP_NODELAY");
        }
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        self.addr()
    }
}
