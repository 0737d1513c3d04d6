//! Sockets behind the engine.
//!
//! Listeners and stream sessions push [`TransportEvent`]s into one channel
//! that the network loop drains. Sending goes through [`Transports::send`],
//! which picks the UDP socket, the HTTP tunnel or a TCP connection from the
//! slot table (connecting on demand).

mod stream;
pub mod tunnel;
mod udp;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use sipua_sip_core::{Destination, Outgoing, Transport};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket, lookup_host};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

pub use stream::{MAX_STREAM_BUFFER, Received, drain_sip_frames, take_read};
use stream::{SlotTable, spawn_session};

use crate::errors::{Error, Result};
use crate::logging::WIRE_TARGET;

/// Keep-alive payload sent to registrars over UDP
pub const KEEP_ALIVE: &[u8; 4] = b"jaK\0";

const DEFAULT_CHANNEL_CAPACITY: usize = 256;
const LISTEN_BACKLOG: i32 = 128;

/// What the sockets report to the network loop
#[derive(Debug)]
pub enum TransportEvent {
    MessageReceived {
        data: Bytes,
        source: SocketAddr,
        transport: Transport,
    },
    /// A stream connection went away
    Closed { peer: SocketAddr, transport: Transport },
    Error { error: String },
}

/// Tunnel settings taken from the network options
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub port: u16,
    pub proxy: String,
    pub outbound_proxy: String,
}

#[derive(Debug, Default)]
struct Bound {
    udp: Option<Arc<UdpSocket>>,
    /// Writer of the HTTP tunnel; replaces the UDP socket when set
    tunnel: Option<mpsc::Sender<Bytes>>,
    tunnel_task: Option<AbortHandle>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct Transports {
    bound: Mutex<Bound>,
    slots: Arc<Mutex<SlotTable>>,
    events: mpsc::Sender<TransportEvent>,
}

impl Transports {
    /// Transports with at most `max_sockets` TCP connections, plus the
    /// receiving end of their events.
    pub fn new(max_sockets: usize) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let transports = Transports {
            bound: Mutex::new(Bound::default()),
            slots: SlotTable::new(max_sockets),
            events,
        };
        (transports, rx)
    }

    /// Listen for UDP on `addr`, or open the HTTP tunnel when `tunnel` is
    /// given. Returns the local address.
    pub async fn listen_udp(&self, addr: SocketAddr, tunnel: Option<TunnelSettings>) -> Result<SocketAddr> {
        if let Some(settings) = tunnel {
            let (stream, proxy) = tunnel::open(&settings.proxy, settings.port, &settings.outbound_proxy).await?;
            let local = stream.local_addr()?;
            let (writer, task) = spawn_session(stream, proxy, Transport::Udp, self.events.clone(), move || {
                warn!("HTTP tunnel through {} closed", proxy);
            });
            let mut bound = self.bound.lock();
            bound.tunnel = Some(writer);
            if let Some(old) = bound.tunnel_task.replace(task) {
                old.abort();
            }
            return Ok(local);
        }

        let socket = Arc::new(udp::bind(addr)?);
        let local = socket.local_addr()?;
        let task = tokio::spawn(udp::receive_loop(socket.clone(), self.events.clone()));
        let mut bound = self.bound.lock();
        bound.udp = Some(socket);
        bound.tasks.push(task);
        Ok(local)
    }

    /// Accept TCP connections on `addr`. Returns the local address.
    pub async fn listen_tcp(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        let listener = TcpListener::from_std(socket.into())?;
        let local = listener.local_addr()?;
        info!("listening on tcp {}", local);

        let slots = self.slots.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if !slots.lock().has_room(&peer) {
                            debug!("no free connection slot, dropping {}", peer);
                            continue;
                        }
                        debug!("accepted tcp connection from {}", peer);
                        register_stream(&slots, stream, peer, &events);
                    }
                    Err(e) => {
                        warn!("tcp accept failed: {}", e);
                        let _ = events.send(TransportEvent::Error { error: e.to_string() }).await;
                    }
                }
            }
        });
        self.bound.lock().tasks.push(task);
        Ok(local)
    }

    /// Ship one message from the engine's outbox.
    ///
    /// A refused connection comes back as [`Error::Io`] with
    /// [`io::ErrorKind::ConnectionRefused`].
    pub async fn send(&self, outgoing: &Outgoing) -> Result<()> {
        let data = Bytes::from(outgoing.message.to_bytes());
        let dest = &outgoing.destination;
        trace!("sending {} bytes to {}", data.len(), dest);
        trace!(target: WIRE_TARGET, "-> {}\n{}", dest, String::from_utf8_lossy(&data));
        match dest.transport {
            Transport::Udp => {
                let tunnel = self.bound.lock().tunnel.clone();
                if let Some(tunnel) = tunnel {
                    return tunnel
                        .send(data)
                        .await
                        .map_err(|_| Error::Transport("HTTP tunnel closed".into()));
                }
                let addr = resolve(dest).await?;
                self.send_datagram(&data, addr).await
            }
            Transport::Tcp => {
                let addr = resolve(dest).await?;
                self.send_stream(data, addr).await
            }
            other => Err(Error::UnsupportedTransport(other.to_string())),
        }
    }

    /// Send the keep-alive datagram to every target.
    pub async fn keep_alive(&self, targets: &[SocketAddr]) {
        for target in targets {
            match self.send_datagram(KEEP_ALIVE, *target).await {
                Ok(()) => trace!("keep-alive sent to {}", target),
                Err(e) => debug!("keep-alive to {} failed: {}", target, e),
            }
        }
    }

    async fn send_datagram(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        let socket = self
            .bound
            .lock()
            .udp
            .clone()
            .ok_or_else(|| Error::Transport("no UDP socket".into()))?;
        socket.send_to(data, addr).await?;
        Ok(())
    }

    async fn send_stream(&self, data: Bytes, addr: SocketAddr) -> Result<()> {
        let existing = self.slots.lock().writer(&addr);
        let writer = match existing {
            Some(writer) => writer,
            None => {
                if !self.slots.lock().has_room(&addr) {
                    return Err(Error::Transport(format!("no free connection slot for {}", addr)));
                }
                let stream = TcpStream::connect(addr).await?;
                debug!("connected to {}", addr);
                register_stream(&self.slots, stream, addr, &self.events)
                    .ok_or_else(|| Error::Transport(format!("no free connection slot for {}", addr)))?
            }
        };
        writer
            .send(data)
            .await
            .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")))
    }

    pub fn connection_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Stop every listener and close every connection.
    pub fn shutdown(&self) {
        let mut bound = self.bound.lock();
        for task in bound.tasks.drain(..) {
            task.abort();
        }
        bound.udp = None;
        bound.tunnel = None;
        if let Some(task) = bound.tunnel_task.take() {
            task.abort();
        }
        self.slots.lock().close_all();
        debug!("transports shut down");
    }
}

/// Start a session for `stream` and give it a slot. `None` when the
/// table filled up in the meantime; the session is then aborted.
fn register_stream(
    slots: &Arc<Mutex<SlotTable>>,
    stream: TcpStream,
    peer: SocketAddr,
    events: &mpsc::Sender<TransportEvent>,
) -> Option<mpsc::Sender<Bytes>> {
    let serial = slots.lock().next_serial();
    let table = slots.clone();
    let (writer, task) = spawn_session(stream, peer, Transport::Tcp, events.clone(), move || {
        table.lock().release(&peer, serial);
    });
    slots
        .lock()
        .insert(peer, writer.clone(), task, serial)
        .then_some(writer)
}

async fn resolve(dest: &Destination) -> Result<SocketAddr> {
    if let Ok(ip) = dest.host.trim_matches(['[', ']']).parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, dest.port));
    }
    lookup_host((dest.host.as_str(), dest.port))
        .await?
        .next()
        .ok_or_else(|| Error::Transport(format!("cannot resolve {}", dest.host)))
}

/// True for failures the retry and refresh cycle recovers from by itself.
pub fn is_transient(error: &Error) -> bool {
    matches!(error, Error::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sipua_sip_core::Message;

    use super::*;

    fn options() -> Message {
        Message::parse(
            b"OPTIONS sip:bob@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKt1\r\n\
From: <sip:alice@127.0.0.1>;tag=1\r\n\
To: <sip:bob@127.0.0.1>\r\n\
Call-ID: t1@127.0.0.1\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\
\r\n",
        )
        .unwrap()
    }

    async fn next_message(rx: &mut mpsc::Receiver<TransportEvent>) -> (Bytes, Transport) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            if let TransportEvent::MessageReceived { data, transport, .. } = event {
                return (data, transport);
            }
        }
    }

    #[tokio::test]
    async fn test_udp_send_and_receive() {
        let (a, _rx_a) = Transports::new(4);
        let (b, mut rx_b) = Transports::new(4);
        a.listen_udp("127.0.0.1:0".parse().unwrap(), None).await.unwrap();
        let b_addr = b.listen_udp("127.0.0.1:0".parse().unwrap(), None).await.unwrap();

        let out = Outgoing {
            tid: None,
            message: options(),
            destination: Destination::new("127.0.0.1", b_addr.port(), Transport::Udp),
        };
        a.send(&out).await.unwrap();
        let (data, transport) = next_message(&mut rx_b).await;
        assert_eq!(transport, Transport::Udp);
        assert!(data.starts_with(b"OPTIONS sip:bob@127.0.0.1"));
    }

    #[tokio::test]
    async fn test_keep_alive_is_not_delivered_as_sip() {
        let (a, _rx_a) = Transports::new(4);
        let (b, mut rx_b) = Transports::new(4);
        a.listen_udp("127.0.0.1:0".parse().unwrap(), None).await.unwrap();
        let b_addr = b.listen_udp("127.0.0.1:0".parse().unwrap(), None).await.unwrap();
        a.keep_alive(&[b_addr]).await;
        let got = tokio::time::timeout(Duration::from_millis(200), rx_b.recv()).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn test_tcp_connects_on_demand_and_reuses() {
        let (a, _rx_a) = Transports::new(4);
        let (b, mut rx_b) = Transports::new(4);
        let b_addr = b.listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let out = Outgoing {
            tid: None,
            message: options(),
            destination: Destination::new("127.0.0.1", b_addr.port(), Transport::Tcp),
        };
        a.send(&out).await.unwrap();
        a.send(&out).await.unwrap();
        for _ in 0..2 {
            let (data, transport) = next_message(&mut rx_b).await;
            assert_eq!(transport, Transport::Tcp);
            assert!(data.ends_with(b"\r\n\r\n"));
        }
        assert_eq!(a.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_full_listener_drops_extra_connection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (b, mut rx_b) = Transports::new(1);
        let b_addr = b.listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut first = tokio::net::TcpStream::connect(b_addr).await.unwrap();
        first.write_all(&options().to_bytes()).await.unwrap();
        next_message(&mut rx_b).await;
        assert_eq!(b.connection_count(), 1);

        let mut second = tokio::net::TcpStream::connect(b_addr).await.unwrap();
        let mut byte = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), second.read(&mut byte))
            .await
            .expect("timed out")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(b.connection_count(), 1);

        // the first connection still works
        first.write_all(&options().to_bytes()).await.unwrap();
        next_message(&mut rx_b).await;
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        let (a, _rx) = Transports::new(4);
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let out = Outgoing {
            tid: None,
            message: options(),
            destination: Destination::new("127.0.0.1", port, Transport::Tcp),
        };
        let err = a.send(&out).await.unwrap_err();
        assert!(is_transient(&err), "{}", err);
    }

    #[test]
    fn test_tls_unsupported() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (a, _rx) = Transports::new(1);
        let out = Outgoing {
            tid: None,
            message: options(),
            destination: Destination::new("127.0.0.1", 5061, Transport::Tls),
        };
        let err = rt.block_on(a.send(&out)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedTransport(_)));
    }
}
