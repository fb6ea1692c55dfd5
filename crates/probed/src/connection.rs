//! Byte-stream connection to the target service.
//!
//! Reads distinguish "nothing arrived within the read timeout" from "the
//! connection is gone"; only the latter sends the scheduler back to the
//! reconnect loop.

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Bytes requested per read.
const READ_CHUNK: usize = 4096;

/// Bound on connect and on each send.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

static ESCAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("escape sequence regex is valid")
});

/// Outcome of one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Text(String),
    /// Nothing arrived before the read timeout.
    Empty,
    /// Closed by the peer or failed; the connection has been dropped.
    Lost,
}

#[async_trait]
pub trait Connection: Send {
    async fn connect(&mut self) -> bool;

    /// Send one line. On failure the connection is dropped and false returned.
    async fn send(&mut self, text: &str) -> bool;

    async fn receive(&mut self) -> Received;

    /// Idempotent.
    async fn disconnect(&mut self);
}

/// Plain TCP client with newline-terminated sends.
#[derive(Debug)]
pub struct TcpConnection {
    addr: String,
    read_timeout: Duration,
    stream: Option<TcpStream>,
    /// Trailing bytes of a UTF-8 sequence split across reads.
    partial: Vec<u8>,
}

impl TcpConnection {
    pub fn new(addr: impl Into<String>, read_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            read_timeout,
            stream: None,
            partial: Vec::new(),
        }
    }

    /// Decode what we have, keeping an incomplete trailing sequence for the
    /// next read. Invalid bytes are dropped.
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.partial.extend_from_slice(bytes);
        let buf = std::mem::take(&mut self.partial);

        let mut out = String::new();
        let mut rest = buf.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => rest = &after[len..],
                        None => {
                            self.partial = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn connect(&mut self) -> bool {
        self.disconnect().await;
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => {
                info!(addr = %self.addr, "connected");
                self.stream = Some(stream);
                true
            }
            Ok(Err(err)) => {
                warn!(addr = %self.addr, error = %err, "connect failed");
                false
            }
            Err(_) => {
                warn!(addr = %self.addr, "connect timed out");
                false
            }
        }
    }

    async fn send(&mut self, text: &str) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        let line = format!("{text}\n");
        match tokio::time::timeout(CONNECT_TIMEOUT, stream.write_all(line.as_bytes())).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(error = %err, "send failed, dropping connection");
                self.disconnect().await;
                false
            }
            Err(_) => {
                warn!("send timed out, dropping connection");
                self.disconnect().await;
                false
            }
        }
    }

    async fn receive(&mut self) -> Received {
        let Some(stream) = self.stream.as_mut() else {
            return Received::Lost;
        };
        let mut buf = [0u8; READ_CHUNK];
        match tokio::time::timeout(self.read_timeout, stream.read(&mut buf)).await {
            Err(_) => Received::Empty,
            Ok(Ok(0)) => {
                warn!("server closed the connection");
                self.disconnect().await;
                Received::Lost
            }
            Ok(Ok(n)) => {
                let text = self.decode(&buf[..n]);
                let text = text.trim();
                if text.is_empty() {
                    Received::Empty
                } else {
                    Received::Text(text.to_string())
                }
            }
            Ok(Err(err)) => {
                warn!(error = %err, "read failed, dropping connection");
                self.disconnect().await;
                Received::Lost
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.shutdown().await {
                debug!(addr = %self.addr, error = %err, "socket shutdown failed");
            }
            debug!(addr = %self.addr, "disconnected");
        }
        self.partial.clear();
    }
}

/// Compiled noise patterns; a line matching any of them is dropped.
#[derive(Debug, Clone, Default)]
pub struct NoiseFilter {
    patterns: Vec<Regex>,
}

impl NoiseFilter {
    pub fn new(patterns: &[String]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    fn is_noise(&self, line: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(line))
    }
}

/// Strip escape sequences and control characters, then drop noise lines.
pub fn clean(text: &str, noise: &NoiseFilter) -> String {
    let stripped = ESCAPE_RE.replace_all(text, "");
    let printable: String = stripped
        .chars()
        .filter(|&c| c == '\n' || (c >= ' ' && c != '\u{7f}'))
        .collect();
    printable
        .lines()
        .filter(|line| !noise.is_noise(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
