//! Line-delimited PING/PONG exchange over an established connection.
//!
//! Wire contract: the client writes `PING\n` and the server answers `PONG\n`.
//! `STOP\n` asks the server to hang up without answering.

use std::io;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time;

pub const PING: &str = "PING";
pub const PONG: &str = "PONG";
pub const STOP: &str = "STOP";

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("write probe: {0}")]
    Write(#[source] io::Error),
    #[error("read reply: {0}")]
    Read(#[source] io::Error),
    #[error("connection closed by peer")]
    CleanClose,
    #[error("unexpected reply {0:?}")]
    UnexpectedReply(String),
}

impl ProbeError {
    pub fn is_timeout(&self) -> bool {
        match self {
            ProbeError::Write(e) | ProbeError::Read(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

/// Exclusive owner of one connection and its read buffer.
///
/// Every write and every read is bounded by `deadline`, so a silent peer turns
/// into a [`ProbeError`] instead of a stuck worker.
#[derive(Debug)]
pub struct Prober {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    deadline: Duration,
    line: String,
}

/// A probe that has been written and not yet answered.
///
/// Holds the [`Prober`] mutably, so a second probe cannot be sent on the
/// same connection until this one is resolved.
#[must_use = "a sent probe must be awaited"]
#[derive(Debug)]
pub struct Pending<'a> {
    prober: &'a mut Prober,
    sent_at: Instant,
}

impl Prober {
    pub fn new(stream: TcpStream, deadline: Duration) -> Self {
        let (read, writer) = stream.into_split();
        Prober {
            reader: BufReader::new(read),
            writer,
            deadline,
            line: String::with_capacity(8),
        }
    }

    pub async fn send(&mut self) -> Result<Pending<'_>, ProbeError> {
        let sent_at = Instant::now();
        self.write_line(PING).await?;
        Ok(Pending {
            prober: self,
            sent_at,
        })
    }

    /// Sends one probe and waits for its reply, returning the round-trip time.
    pub async fn exchange(&mut self) -> Result<Duration, ProbeError> {
        self.send().await?.reply().await
    }

    /// Asks the peer to hang up, then closes the connection.
    ///
    /// Best effort: errors are ignored since the connection is going away.
    pub async fn stop(mut self) {
        if self.write_line(STOP).await.is_ok() {
            let _ = time::timeout(self.deadline, self.writer.shutdown()).await;
        }
    }

    async fn write_line(&mut self, token: &str) -> Result<(), ProbeError> {
        let mut buf = Vec::with_capacity(token.len() + 1);
        buf.extend_from_slice(token.as_bytes());
        buf.push(b'\n');

        match time::timeout(self.deadline, self.writer.write_all(&buf)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProbeError::Write(e)),
            Err(_) => Err(ProbeError::Write(deadline_elapsed("write"))),
        }
    }

    async fn read_reply(&mut self) -> Result<(), ProbeError> {
        self.line.clear();
        let n = match time::timeout(self.deadline, self.reader.read_line(&mut self.line)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(ProbeError::Read(e)),
            Err(_) => return Err(ProbeError::Read(deadline_elapsed("read"))),
        };

        if n == 0 {
            return Err(ProbeError::CleanClose);
        }
        if !self.line.ends_with('\n') {
            return Err(ProbeError::Read(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "reply truncated by close",
            )));
        }
        match self.line.trim() {
            PONG => Ok(()),
            other => Err(ProbeError::UnexpectedReply(other.to_string())),
        }
    }
}

impl Pending<'_> {
    /// Waits for the reply to this probe and returns the round-trip time.
    pub async fn reply(self) -> Result<Duration, ProbeError> {
        self.prober.read_reply().await?;
        Ok(self.sent_at.elapsed())
    }
}

fn deadline_elapsed(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{op} deadline elapsed"))
}
