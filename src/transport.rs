use crate::scheduler::Event;
use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const RECV_BUFFER: usize = 65535;

#[derive(Error, Debug)]
pub enum BindError {
    #[error("unable to listen for probes at {addr}: {source}")]
    Probe {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },
}

/// Opens the probe socket on an interface broadcast address.
///
/// The address is not reused: two interfaces sharing a broadcast address
/// make the second bind fail.
pub fn bind_broadcast(addr: SocketAddrV4) -> Result<UdpSocket, BindError> {
    open_broadcast(addr).map_err(|source| BindError::Probe { addr, source })
}

fn open_broadcast(addr: SocketAddrV4) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Transport resources of one active interface period. Dropping it stops
/// every task started for the period.
#[derive(Debug)]
pub struct Binding {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    cancel: CancellationToken,
}

impl Binding {
    pub fn new(socket: Arc<UdpSocket>, target: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            socket,
            target,
            cancel,
        }
    }

    /// Broadcasts one probe with a plain non-blocking `sendto`, so a socket
    /// the reactor has not polled yet can send. Never waits: only a full
    /// send buffer loses the probe.
    pub fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        SockRef::from(&*self.socket).send_to(datagram, &SockAddr::from(self.target))
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Forwards every datagram on `socket` to the scheduler loop, tagged with
/// the interface and generation it was received for.
pub fn spawn_receiver(
    socket: Arc<UdpSocket>,
    if_name: String,
    generation: u64,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = socket.recv_from(&mut buf) => match res {
                    Ok((n, from)) => {
                        let event = Event::Datagram {
                            if_name: if_name.clone(),
                            generation,
                            from,
                            payload: Bytes::copy_from_slice(&buf[..n]),
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("{}: probe receive error: {}", if_name, e),
                },
            }
        }
        debug!("{}: probe receiver for generation {} stopped", if_name, generation);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_bind_on_same_address_conflicts() {
        let first = bind_broadcast(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let taken = match first.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };
        let err = bind_broadcast(taken).unwrap_err();
        assert!(err.to_string().contains(&taken.to_string()));
    }

    #[tokio::test]
    async fn test_receiver_forwards_tagged_datagrams() {
        let socket = Arc::new(bind_broadcast(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap());
        let target = socket.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        spawn_receiver(socket.clone(), "lo".into(), 3, tx, cancel.clone());

        let binding = Binding::new(socket, target, cancel);
        binding.send(b"hello").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            Event::Datagram {
                if_name,
                generation,
                payload,
                ..
            } => {
                assert_eq!(if_name, "lo");
                assert_eq!(generation, 3);
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_send_after_bind_is_delivered() {
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let socket = Arc::new(bind_broadcast(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap());
        let binding = Binding::new(socket, peer.local_addr().unwrap(), CancellationToken::new());

        // no await between bind and send
        assert_eq!(binding.send(b"first").unwrap(), 5);

        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"first");
    }

    #[tokio::test]
    async fn test_dropping_binding_stops_receiver() {
        let socket = Arc::new(bind_broadcast(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap());
        let target = socket.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        spawn_receiver(socket.clone(), "lo".into(), 1, tx, cancel.clone());

        drop(Binding::new(socket, target, cancel));

        // the receiver exits and drops its sender
        let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
    }
}
