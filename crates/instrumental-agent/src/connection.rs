// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line-protocol connection to the collector.
//!
//! Every failure leaving this module is a [`ConnectionError`] with an
//! [`crate::errors::ErrorKind`], so the sender never inspects raw io errors.

use crate::errors::ConnectionError;
use crate::tls;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub const AGENT_VERSION: &str = concat!("rust/instrumental_agent/", env!("CARGO_PKG_VERSION"));

pub trait CollectorStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> CollectorStream for T {}

/// Identification sent in the `hello` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: String,
    pub hostname: String,
    pub pid: u32,
    pub runtime: String,
    pub platform: String,
}

impl Hello {
    #[must_use]
    pub fn for_current_process() -> Self {
        Self {
            version: AGENT_VERSION.to_string(),
            hostname: crate::util::get_hostname(),
            pid: std::process::id(),
            runtime: "rust".to_string(),
            platform: crate::util::platform(),
        }
    }

    #[must_use]
    pub fn line(&self) -> String {
        format!(
            "hello version {} hostname {} pid {} runtime {} platform {}",
            self.version, self.hostname, self.pid, self.runtime, self.platform
        )
    }
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub secure: bool,
    pub verify_cert: bool,
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
}

pub struct Connection {
    stream: BufStream<Box<dyn CollectorStream>>,
    peer: SocketAddr,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

impl Connection {
    /// Opens a plain or TLS stream to `addr` within the connect timeout.
    pub async fn open(addr: SocketAddr, options: &ConnectOptions) -> Result<Self, ConnectionError> {
        let tcp = timeout(options.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectionError::timeout("connect"))??;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let stream: Box<dyn CollectorStream> = if options.secure {
            let config = tls::client_config(options.verify_cert)?;
            let tls_stream = timeout(
                options.connect_timeout,
                tls::connect(config, &options.host, tcp),
            )
            .await
            .map_err(|_| ConnectionError::timeout("TLS handshake"))??;
            Box::new(tls_stream)
        } else {
            Box::new(tcp)
        };

        Ok(Self::from_stream(stream, addr))
    }

    pub fn from_stream(stream: Box<dyn CollectorStream>, peer: SocketAddr) -> Self {
        Self {
            stream: BufStream::new(stream),
            peer,
        }
    }

    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Sends `hello` and `authenticate`, each of which must be acknowledged.
    pub async fn handshake(
        &mut self,
        hello: &Hello,
        api_key: &str,
        reply_timeout: Duration,
    ) -> Result<(), ConnectionError> {
        self.send_with_reply(&hello.line(), reply_timeout).await?;
        self.send_with_reply(&format!("authenticate {api_key}"), reply_timeout)
            .await
    }

    async fn send_with_reply(
        &mut self,
        line: &str,
        reply_timeout: Duration,
    ) -> Result<(), ConnectionError> {
        self.write_line(line).await?;
        self.flush().await?;

        let mut response = String::new();
        let read = timeout(reply_timeout, self.stream.read_line(&mut response))
            .await
            .map_err(|_| ConnectionError::timeout("collector reply"))??;
        if read == 0 {
            return Err(ConnectionError::closed(format!(
                "collector hung up before replying to {}",
                command_name(line)
            )));
        }
        if response.trim_end() != "ok" {
            return Err(ConnectionError::protocol(format!(
                "Bad response {:?} to {}",
                response.trim_end(),
                command_name(line)
            )));
        }
        Ok(())
    }

    /// Non-blocking check for a collector-side hangup before writing.
    ///
    /// Anything the collector sent unprompted is discarded.
    pub async fn probe(&mut self) -> Result<(), ConnectionError> {
        let unsolicited = match timeout(Duration::ZERO, self.stream.fill_buf()).await {
            Err(_) => return Ok(()),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(buf)) if buf.is_empty() => {
                return Err(ConnectionError::closed("collector closed the connection"))
            }
            Ok(Ok(buf)) => buf.len(),
        };
        debug!("Discarding {} unsolicited bytes from collector", unsolicited);
        self.stream.consume(unsolicited);
        Ok(())
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), ConnectionError> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Best-effort flush and shutdown, bounded by `limit`. Errors are swallowed.
    pub async fn close(mut self, limit: Duration) {
        let result = timeout(limit, async {
            self.stream.flush().await?;
            self.stream.shutdown().await
        })
        .await;
        match result {
            Ok(Ok(())) => debug!("Disconnected from {}", self.peer),
            Ok(Err(e)) => debug!("Error while disconnecting from {}: {}", self.peer, e),
            Err(_) => debug!("Timed out disconnecting from {}", self.peer),
        }
    }
}

fn command_name(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or_default()
}
