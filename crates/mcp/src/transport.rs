//! MCP transport layer: newline-delimited JSON over split stream halves.
//!
//! The peer reads and writes concurrently on the same stream (a fire may
//! be awaiting a sampling response while the client sends a new tool call),
//! so the transport is modeled as independent read and write halves rather
//! than a single send/receive object.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::McpError;

/// Read half of a transport: yields one JSON message line at a time.
#[async_trait]
pub trait TransportRead: Send {
    /// Next message line, with the trailing newline stripped.
    /// Returns `None` when the stream is closed.
    async fn receive(&mut self) -> Result<Option<String>, McpError>;
}

/// Write half of a transport: sends one JSON message line at a time.
#[async_trait]
pub trait TransportWrite: Send {
    async fn send(&mut self, message: &str) -> Result<(), McpError>;
}

// ── Stdio ───────────────────────────────────────────────────────────

/// Process-stdio transport. stdin carries inbound messages, stdout carries
/// outbound ones; diagnostics must therefore go to stderr.
pub struct StdioTransport;

impl StdioTransport {
    /// Split the process stdio into transport halves.
    pub fn split() -> (StdioReader, StdioWriter) {
        (
            StdioReader {
                reader: BufReader::new(tokio::io::stdin()),
            },
            StdioWriter {
                writer: tokio::io::stdout(),
            },
        )
    }
}

pub struct StdioReader {
    reader: BufReader<tokio::io::Stdin>,
}

pub struct StdioWriter {
    writer: tokio::io::Stdout,
}

#[async_trait]
impl TransportRead for StdioReader {
    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        loop {
            let mut line = String::new();
            let bytes_read = self.reader.read_line(&mut line).await?;
            if bytes_read == 0 {
                return Ok(None); // EOF
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }
}

#[async_trait]
impl TransportWrite for StdioWriter {
    async fn send(&mut self, message: &str) -> Result<(), McpError> {
        self.writer.write_all(message.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

// ── In-memory channels (tests) ──────────────────────────────────────

/// In-memory transport for tests, backed by channel pairs.
pub struct ChannelTransport;

impl ChannelTransport {
    /// Create two connected endpoints; what one side sends, the other receives.
    pub fn pair() -> (
        (ChannelReader, ChannelWriter),
        (ChannelReader, ChannelWriter),
    ) {
        let (tx_a, rx_b) = mpsc::channel(64);
        let (tx_b, rx_a) = mpsc::channel(64);
        (
            (ChannelReader { rx: rx_a }, ChannelWriter { tx: tx_a }),
            (ChannelReader { rx: rx_b }, ChannelWriter { tx: tx_b }),
        )
    }
}

pub struct ChannelReader {
    rx: mpsc::Receiver<String>,
}

pub struct ChannelWriter {
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl TransportRead for ChannelReader {
    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        Ok(self.rx.recv().await)
    }
}

#[async_trait]
impl TransportWrite for ChannelWriter {
    async fn send(&mut self, message: &str) -> Result<(), McpError> {
        self.tx.send(message.to_string()).await.map_err(|e| {
            McpError::Transport(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_pair_crosses_over() {
        let ((mut rx_a, mut tx_a), (mut rx_b, mut tx_b)) = ChannelTransport::pair();

        tx_a.send("from a").await.unwrap();
        assert_eq!(rx_b.receive().await.unwrap(), Some("from a".to_string()));

        tx_b.send("from b").await.unwrap();
        assert_eq!(rx_a.receive().await.unwrap(), Some("from b".to_string()));
    }

    #[tokio::test]
    async fn test_channel_reader_closed() {
        let ((mut rx_a, _tx_a), (_rx_b, tx_b)) = ChannelTransport::pair();
        drop(tx_b);
        assert_eq!(rx_a.receive().await.unwrap(), None);
    }
}
