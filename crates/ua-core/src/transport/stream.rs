//! Stream sessions (TCP and the HTTP tunnel) and the bounded connection
//! table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use sipua_sip_core::Transport;
use sipua_sip_core::message::frame_length;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use super::TransportEvent;

const WRITER_QUEUE: usize = 32;

/// Most a stream peer may leave buffered before its session is closed
pub const MAX_STREAM_BUFFER: usize = 65_535;

/// Reads shorter than this arriving on an empty buffer are noise
const MIN_READ: usize = 5;

/// What one read left in a session buffer
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Frames(Vec<Bytes>),
    /// More than [`MAX_STREAM_BUFFER`] bytes without a complete message
    Overflow,
}

/// Take the `n` bytes just read into `buf`.
///
/// A short read on an empty buffer is dropped instead of being glued to
/// the front of the next message.
pub fn take_read(buf: &mut BytesMut, n: usize) -> Received {
    if n < MIN_READ && buf.len() == n {
        buf.clear();
        return Received::Frames(Vec::new());
    }
    let frames = drain_sip_frames(buf);
    if buf.len() > MAX_STREAM_BUFFER {
        return Received::Overflow;
    }
    Received::Frames(frames)
}

/// Split buffered stream data into complete SIP messages.
///
/// Leading CRLF keep-alives are consumed; an incomplete message stays in
/// `buf`.
pub fn drain_sip_frames(buf: &mut BytesMut) -> Vec<Bytes> {
    let mut frames = Vec::new();
    loop {
        let pings = buf.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
        buf.advance(pings);
        match frame_length(&buf[..]) {
            Some(len) => frames.push(buf.split_to(len).freeze()),
            None => break,
        }
    }
    frames
}

/// Read frames from `stream` into `events` and write whatever arrives on
/// the returned sender. The session ends when the peer closes or a write
/// fails; `on_close` runs once it has.
pub(crate) fn spawn_session<S, F>(
    stream: S,
    peer: SocketAddr,
    transport: Transport,
    events: mpsc::Sender<TransportEvent>,
    on_close: F,
) -> (mpsc::Sender<Bytes>, AbortHandle)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(WRITER_QUEUE);

    let task = tokio::spawn(async move {
        let writer_task = tokio::spawn(async move {
            while let Some(data) = writer_rx.recv().await {
                if let Err(e) = writer.write_all(&data).await {
                    warn!("write to {} failed: {}", peer, e);
                    break;
                }
            }
        });

        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match reader.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    trace!("{} bytes from {}", n, peer);
                    let frames = match take_read(&mut buf, n) {
                        Received::Frames(frames) => frames,
                        Received::Overflow => {
                            warn!("{} buffered {} bytes without a message, closing", peer, buf.len());
                            break;
                        }
                    };
                    for data in frames {
                        let event = TransportEvent::MessageReceived { data, source: peer, transport };
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    debug!("read from {} failed: {}", peer, e);
                    break;
                }
            }
        }
        writer_task.abort();
        on_close();
        let _ = events.send(TransportEvent::Closed { peer, transport }).await;
    });
    (writer_tx, task.abort_handle())
}

#[derive(Debug)]
struct Slot {
    writer: mpsc::Sender<Bytes>,
    task: AbortHandle,
    serial: u64,
}

/// Open TCP connections keyed by peer address, at most `max` of them.
#[derive(Debug)]
pub(crate) struct SlotTable {
    slots: HashMap<SocketAddr, Slot>,
    max: usize,
    next_serial: u64,
}

impl SlotTable {
    pub(crate) fn new(max: usize) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(SlotTable {
            slots: HashMap::new(),
            max: max.max(1),
            next_serial: 1,
        }))
    }

    pub(crate) fn writer(&self, peer: &SocketAddr) -> Option<mpsc::Sender<Bytes>> {
        self.slots
            .get(peer)
            .filter(|s| !s.writer.is_closed())
            .map(|s| s.writer.clone())
    }

    /// Reserve a serial for the next connection.
    pub(crate) fn next_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    /// True when a connection from `peer` would get a slot: the table has
    /// a free one or `peer` already holds one.
    pub(crate) fn has_room(&self, peer: &SocketAddr) -> bool {
        self.slots.len() < self.max || self.slots.contains_key(peer)
    }

    /// Store a connection, replacing an older one from the same peer.
    ///
    /// Without a free slot the new connection is aborted and `false`
    /// returned; the connections already open are kept.
    pub(crate) fn insert(&mut self, peer: SocketAddr, writer: mpsc::Sender<Bytes>, task: AbortHandle, serial: u64) -> bool {
        if !self.has_room(&peer) {
            debug!("connection table full, refusing {}", peer);
            task.abort();
            return false;
        }
        if let Some(old) = self.slots.remove(&peer) {
            old.task.abort();
        }
        self.slots.insert(peer, Slot { writer, task, serial });
        true
    }

    /// Forget `peer` if it is still the connection numbered `serial`.
    pub(crate) fn release(&mut self, peer: &SocketAddr, serial: u64) {
        if self.slots.get(peer).is_some_and(|s| s.serial == serial) {
            self.slots.remove(peer);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn close_all(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_with_and_without_body() {
        let first = b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 5\r\n\r\nhello";
        let second = b"SIP/2.0 200 OK\r\nl: 0\r\n\r\n";
        let mut buf = BytesMut::from(&[first.as_slice(), second.as_slice()].concat()[..]);
        let frames = drain_sip_frames(&mut buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref(), first);
        assert_eq!(frames[1].as_ref(), second);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_body_waits() {
        let data = b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 10\r\n\r\nhel";
        let mut buf = BytesMut::from(&data[..]);
        assert!(drain_sip_frames(&mut buf).is_empty());
        assert_eq!(buf.len(), data.len());
    }

    #[test]
    fn test_keep_alive_pings_skipped() {
        let mut buf = BytesMut::from(&b"\r\n\r\nSIP/2.0 200 OK\r\n\r\n"[..]);
        let frames = drain_sip_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with(b"SIP/2.0"));
    }

    #[test]
    fn test_short_read_on_empty_buffer_dropped() {
        let mut buf = BytesMut::from(&b"ping"[..]);
        assert_eq!(take_read(&mut buf, 4), Received::Frames(Vec::new()));
        assert!(buf.is_empty());

        let options = b"OPTIONS sip:a@b SIP/2.0\r\nContent-Length: 0\r\n\r\n";
        buf.extend_from_slice(options);
        let Received::Frames(frames) = take_read(&mut buf, options.len()) else {
            panic!("overflow");
        };
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with(b"OPTIONS"));
    }

    #[test]
    fn test_short_read_completing_a_message_kept() {
        let head = b"SIP/2.0 200 OK\r\nContent-Length: 2\r\n\r\n";
        let mut buf = BytesMut::from(&head[..]);
        assert_eq!(take_read(&mut buf, head.len()), Received::Frames(Vec::new()));
        buf.extend_from_slice(b"ok");
        let Received::Frames(frames) = take_read(&mut buf, 2) else {
            panic!("overflow");
        };
        assert_eq!(frames.len(), 1);
        assert!(frames[0].ends_with(b"ok"));
    }

    #[test]
    fn test_unterminated_head_overflows() {
        let mut buf = BytesMut::from(&vec![b'a'; MAX_STREAM_BUFFER + 1][..]);
        let n = buf.len();
        assert_eq!(take_read(&mut buf, n), Received::Overflow);
    }

    #[test]
    fn test_huge_content_length_overflows() {
        let mut data = b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 10000000\r\n\r\n".to_vec();
        data.extend(std::iter::repeat_n(b'x', MAX_STREAM_BUFFER));
        let mut buf = BytesMut::from(&data[..]);
        assert_eq!(take_read(&mut buf, data.len()), Received::Overflow);
    }

    #[tokio::test]
    async fn test_full_table_refuses_new_peer() {
        let table = SlotTable::new(2);
        let addrs: Vec<SocketAddr> = (1..=3).map(|i| format!("10.0.0.{}:5060", i).parse().unwrap()).collect();
        let mut kept = Vec::new();
        for addr in &addrs {
            let (tx, _rx) = mpsc::channel(1);
            let task = tokio::spawn(std::future::pending::<()>());
            let mut t = table.lock();
            let serial = t.next_serial();
            kept.push(t.insert(*addr, tx, task.abort_handle(), serial));
        }
        assert_eq!(kept, vec![true, true, false]);
        let t = table.lock();
        assert_eq!(t.len(), 2);
        assert!(t.slots.contains_key(&addrs[0]));
        assert!(!t.slots.contains_key(&addrs[2]));
        assert!(!t.has_room(&addrs[2]));
        // a peer already holding a slot may reconnect
        assert!(t.has_room(&addrs[0]));
    }

    #[tokio::test]
    async fn test_release_ignores_replaced_connection() {
        let table = SlotTable::new(4);
        let addr: SocketAddr = "10.0.0.1:5060".parse().unwrap();
        let mut t = table.lock();
        for _ in 0..2 {
            let (tx, _rx) = mpsc::channel(1);
            let task = tokio::spawn(std::future::pending::<()>());
            let serial = t.next_serial();
            t.insert(addr, tx, task.abort_handle(), serial);
        }
        t.release(&addr, 1);
        assert_eq!(t.len(), 1);
        t.release(&addr, 2);
        assert_eq!(t.len(), 0);
    }
}
