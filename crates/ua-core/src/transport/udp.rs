use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use sipua_sip_core::Transport;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::TransportEvent;
use crate::errors::Result;

const MAX_DATAGRAM: usize = 65_535;

/// Datagrams shorter than this are keep-alives or noise
const MIN_SIP_DATAGRAM: usize = 8;

/// Bind a UDP socket with address reuse.
pub(crate) fn bind(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Forward every datagram to `events` until the receiver goes away.
pub(crate) async fn receive_loop(socket: Arc<UdpSocket>, events: mpsc::Sender<TransportEvent>) {
    if let Ok(local) = socket.local_addr() {
        info!("listening on udp {}", local);
    }
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, source)) if n < MIN_SIP_DATAGRAM => {
                debug!("ignoring {} byte datagram from {}", n, source);
            }
            Ok((n, source)) => {
                let event = TransportEvent::MessageReceived {
                    data: Bytes::copy_from_slice(&buf[..n]),
                    source,
                    transport: Transport::Udp,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                // ICMP port unreachable shows up here on some platforms
                error!("udp receive failed: {}", e);
                let _ = events.send(TransportEvent::Error { error: e.to_string() }).await;
            }
        }
    }
    debug!("udp receive loop terminated");
}
