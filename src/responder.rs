//! The PING/PONG service a load run is pointed at.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::probe::{PING, PONG, STOP};

/// Longest request line accepted before the connection is dropped.
const MAX_LINE: usize = 64;

#[derive(Debug, Default)]
struct Pings {
    interval: AtomicU64,
    total: AtomicU64,
}

pub struct Responder {
    listener: TcpListener,
    pings: Arc<Pings>,
    report_interval: Duration,
}

impl Responder {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Responder {
            listener: TcpListener::bind(addr).await?,
            pings: Arc::default(),
            report_interval: Duration::from_secs(1),
        })
    }

    /// Binds and serves in the background until the returned handle is dropped.
    pub async fn spawn(addr: SocketAddr) -> io::Result<RunningResponder> {
        let responder = Self::bind(addr).await?;
        let addr = responder.local_addr()?;
        let pings = Arc::clone(&responder.pings);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(responder.serve(shutdown.clone()));

        Ok(RunningResponder {
            addr,
            pings,
            guard: shutdown.drop_guard(),
            task,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("Starting TCP responder on {}", addr);
        }
        let reporter = tokio::spawn(report_pings(
            Arc::clone(&self.pings),
            self.report_interval,
            shutdown.clone(),
        ));

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(stream, peer, Arc::clone(&self.pings)));
                }
                Err(e) => {
                    tracing::warn!("accept error: {}", e);
                    // Usually fd exhaustion; give in-flight connections a moment to close.
                    time::sleep(Duration::from_millis(10)).await;
                }
            }
        }

        let _ = reporter.await;
        tracing::info!("responder stopped");
    }
}

/// Handle to a responder serving in the background.
pub struct RunningResponder {
    addr: SocketAddr,
    pings: Arc<Pings>,
    guard: DropGuard,
    task: JoinHandle<()>,
}

impl RunningResponder {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// PINGs answered since start.
    pub fn pings_total(&self) -> u64 {
        self.pings.total.load(Ordering::Relaxed)
    }

    pub async fn shutdown(self) {
        drop(self.guard);
        let _ = self.task.await;
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, pings: Arc<Pings>) {
    let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::debug!(%peer, "request line too long, closing");
                return;
            }
            Err(LinesCodecError::Io(e)) => {
                tracing::debug!(%peer, "connection error: {}", e);
                return;
            }
        };

        match line.trim() {
            STOP => {
                tracing::debug!(%peer, "peer sent STOP, closing");
                return;
            }
            PING => {
                pings.interval.fetch_add(1, Ordering::Relaxed);
                pings.total.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = lines.send(PONG).await {
                    tracing::debug!(%peer, "write error: {}", e);
                    return;
                }
            }
            _ => {}
        }
    }
}

async fn report_pings(pings: Arc<Pings>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = time::interval_at(time::Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let count = pings.interval.swap(0, Ordering::AcqRel);
        tracing::info!("PING requests received in last {:?}: {}", every, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    async fn responder() -> RunningResponder {
        Responder::spawn("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn answers_each_ping_on_one_connection() {
        let responder = responder().await;
        let stream = TcpStream::connect(responder.local_addr()).await.unwrap();
        let mut stream = BufReader::new(stream);

        for _ in 0..3 {
            stream.get_mut().write_all(b"PING\n").await.unwrap();
            let mut reply = String::new();
            stream.read_line(&mut reply).await.unwrap();
            assert_eq!(reply, "PONG\n");
        }
        assert_eq!(responder.pings_total(), 3);
        responder.shutdown().await;
    }

    #[tokio::test]
    async fn stop_closes_without_reply() {
        let responder = responder().await;
        let mut stream = TcpStream::connect(responder.local_addr()).await.unwrap();

        stream.write_all(b"STOP\n").await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(responder.pings_total(), 0);
    }

    #[tokio::test]
    async fn unknown_lines_are_ignored() {
        let responder = responder().await;
        let stream = TcpStream::connect(responder.local_addr()).await.unwrap();
        let mut stream = BufReader::new(stream);

        stream
            .get_mut()
            .write_all(b"HELLO\r\nPING\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        stream.read_line(&mut reply).await.unwrap();
        assert_eq!(reply, "PONG\n");
    }

    #[tokio::test]
    async fn overlong_line_drops_connection() {
        let responder = responder().await;
        let mut stream = TcpStream::connect(responder.local_addr()).await.unwrap();

        stream.write_all(&[b'x'; 4 * MAX_LINE]).await.unwrap();
        let mut rest = Vec::new();
        // Closed by the server; a reset is as good as EOF here.
        let _ = stream.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn stops_accepting_after_shutdown() {
        let responder = responder().await;
        let addr = responder.local_addr();
        responder.shutdown().await;

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ping_counter_is_reset_every_interval() {
        let pings = Arc::new(Pings::default());
        pings.interval.store(5, Ordering::Relaxed);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(report_pings(
            Arc::clone(&pings),
            Duration::from_secs(1),
            shutdown.clone(),
        ));

        time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(pings.interval.load(Ordering::Relaxed), 0);

        shutdown.cancel();
        task.await.unwrap();
    }
}
