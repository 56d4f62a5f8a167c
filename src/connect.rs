use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time;

use crate::config::Target;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("dial {addr} timed out after {after:?}")]
    Timeout { addr: SocketAddr, after: Duration },
    #[error("dial {addr} failed: {source}")]
    RefusedOrUnreachable {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("local socket setup failed (bind {local:?}): {source}")]
    BindFailure {
        local: Option<IpAddr>,
        #[source]
        source: io::Error,
    },
}

/// Opens one TCP connection to `target`. Never retries.
pub async fn dial(target: &Target) -> Result<TcpStream, DialError> {
    let bind_err = |source| DialError::BindFailure {
        local: target.bind,
        source,
    };

    let socket = if target.addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    if let Some(ip) = target.bind {
        socket.bind(SocketAddr::new(ip, 0)).map_err(bind_err)?;
    }

    let stream = match time::timeout(target.dial_timeout, socket.connect(target.addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
            return Err(DialError::Timeout {
                addr: target.addr,
                after: target.dial_timeout,
            })
        }
        Ok(Err(source)) => {
            return Err(DialError::RefusedOrUnreachable {
                addr: target.addr,
                source,
            })
        }
        Err(_) => {
            return Err(DialError::Timeout {
                addr: target.addr,
                after: target.dial_timeout,
            })
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set TCP_NODELAY on {}: {}", target.addr, e);
    }
    let keepalive = TcpKeepalive::new().with_time(target.keepalive);
    if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!("set keep-alive on {}: {}", target.addr, e);
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dials_listener_from_bound_source() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let target = Target::new(addr).bound_to(Some("127.0.0.1".parse().unwrap()));

        let stream = dial(&target).await.unwrap();
        let (_accepted, peer) = listener.accept().await.unwrap();

        assert_eq!(stream.peer_addr().unwrap(), addr);
        assert_eq!(stream.local_addr().unwrap(), peer);
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }

    #[tokio::test]
    async fn closed_port_is_refused() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let err = dial(&Target::new(addr)).await.unwrap_err();
        assert!(
            matches!(err, DialError::RefusedOrUnreachable { .. }),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn foreign_source_address_is_bind_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        // TEST-NET-1, never assigned to a local interface.
        let target = Target::new(listener.local_addr().unwrap())
            .bound_to(Some("192.0.2.1".parse().unwrap()));

        let err = dial(&target).await.unwrap_err();
        assert!(matches!(err, DialError::BindFailure { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn unroutable_dial_gives_up_within_timeout() {
        let mut target = Target::new("10.255.255.1:2002".parse().unwrap());
        target.dial_timeout = Duration::from_millis(100);

        let started = std::time::Instant::now();
        assert!(dial(&target).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
