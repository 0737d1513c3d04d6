//! The running user agent.
//!
//! [`UserAgent`] puts a [`Context`] behind a lock and drives it from one
//! tokio task: read the sockets, run [`Context::execute`], flush the outbox,
//! send keep-alives. Every API call made through [`UserAgent::lock`] wakes
//! that task when the guard is dropped, so new requests leave immediately.
//!
//! ```no_run
//! use sipua_ua_core::{UaConfig, UserAgent};
//! use sipua_sip_core::Transport;
//!
//! # async fn run() -> sipua_ua_core::Result<()> {
//! let ua = UserAgent::new(UaConfig::default())?;
//! ua.listen("0.0.0.0:5060".parse().unwrap(), Transport::Udp).await?;
//!
//! let rid = ua.lock().register_init("sip:alice@example.com", "sip:example.com", None)?;
//! ua.lock().register_send(rid, 3600)?;
//!
//! let event = ua.next_event().await;
//! println!("{}", event.textinfo);
//! ua.quit().await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use sipua_sip_core::Transport;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{UaConfig, UaOption};
use crate::context::Context;
use crate::errors::{Error, Result};
use crate::events::{Event, EventQueue};
use crate::transport::{TransportEvent, Transports, TunnelSettings, is_transient};

#[derive(Debug, Default)]
struct Shared {
    stop: AtomicBool,
    wake: Notify,
}

/// Exclusive access to the engine. Dropping it wakes the network loop.
pub struct ContextGuard<'a> {
    guard: MutexGuard<'a, Context>,
    wake: &'a Notify,
}

impl Deref for ContextGuard<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.guard
    }
}

impl DerefMut for ContextGuard<'_> {
    fn deref_mut(&mut self) -> &mut Context {
        &mut self.guard
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.wake.notify_one();
    }
}

pub struct UserAgent {
    context: Arc<Mutex<Context>>,
    events: EventQueue,
    transports: Arc<Transports>,
    receiver: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl UserAgent {
    pub fn new(config: UaConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: UaConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let events = EventQueue::new();
        let (transports, receiver) = Transports::new(config.max_sockets);
        let context = Context::with_events(config, clock, events.clone())?;
        Ok(UserAgent {
            context: Arc::new(Mutex::new(context)),
            events,
            transports: Arc::new(transports),
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
            shared: Arc::new(Shared::default()),
        })
    }

    /// Lock the engine for one or more API calls.
    pub fn lock(&self) -> ContextGuard<'_> {
        ContextGuard {
            guard: self.context.lock(),
            wake: &self.shared.wake,
        }
    }

    /// Bind `addr` for `transport` and start the network loop if it is not
    /// running yet. Port 0 picks a free port; the bound address is returned.
    pub async fn listen(&self, addr: SocketAddr, transport: Transport) -> Result<SocketAddr> {
        if self.shared.stop.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        let local = match transport {
            Transport::Udp => {
                let tunnel = {
                    let ctx = self.context.lock();
                    let net = &ctx.config().network;
                    (net.http_tunnel_port > 0).then(|| TunnelSettings {
                        port: net.http_tunnel_port,
                        proxy: net.http_proxy.clone(),
                        outbound_proxy: net.http_outbound_proxy.clone(),
                    })
                };
                self.transports.listen_udp(addr, tunnel).await?
            }
            Transport::Tcp => self.transports.listen_tcp(addr).await?,
            other => return Err(Error::UnsupportedTransport(other.to_string())),
        };
        self.context.lock().set_local_port(transport, local.port());
        info!("user agent listening on {} over {}", local, transport);
        self.start();
        Ok(local)
    }

    fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let Some(receiver) = self.receiver.lock().take() else {
            return;
        };
        let task = tokio::spawn(run(
            self.context.clone(),
            self.transports.clone(),
            receiver,
            self.shared.clone(),
        ));
        *worker = Some(task);
    }

    /// Stop the network loop, close every socket and release every call,
    /// subscription and registration.
    pub async fn quit(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("network loop ended abnormally: {}", e);
            }
        }
        self.transports.shutdown();
        self.context.lock().clear();
        info!("user agent stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some() && !self.shared.stop.load(Ordering::SeqCst)
    }

    pub fn set_option(&self, option: UaOption) {
        self.lock().set_option(option);
    }

    pub fn masquerade_contact(&self, ip: &str, port: u16) {
        self.lock().masquerade_contact(ip, port);
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    /// Next event, waiting up to `timeout` (zero never blocks).
    pub fn event_wait(&self, timeout: Duration) -> Option<Event> {
        self.events.wait(timeout)
    }

    /// Next event, blocking the calling thread.
    pub fn event_get(&self) -> Event {
        self.events.get()
    }

    pub async fn next_event(&self) -> Event {
        self.events.next().await
    }
}

impl Drop for UserAgent {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
        self.transports.shutdown();
    }
}

/// The network loop: one iteration per socket event, wake-up or timer.
async fn run(
    context: Arc<Mutex<Context>>,
    transports: Arc<Transports>,
    mut receiver: mpsc::Receiver<TransportEvent>,
    shared: Arc<Shared>,
) {
    debug!("network loop started");
    let mut next_keep_alive: Option<Instant> = None;
    while !shared.stop.load(Ordering::SeqCst) {
        let wait = context.lock().next_wait();
        tokio::select! {
            event = receiver.recv() => match event {
                Some(TransportEvent::MessageReceived { data, source, transport }) => {
                    context.lock().handle_datagram(&data, source, transport);
                }
                Some(TransportEvent::Closed { peer, transport }) => {
                    debug!("{} connection to {} closed", transport, peer);
                }
                Some(TransportEvent::Error { error }) => warn!("transport: {}", error),
                None => {
                    warn!("transport channel closed");
                    break;
                }
            },
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        let (outgoing, keep_alive_ms) = {
            let mut ctx = context.lock();
            ctx.execute();
            (ctx.drain_outbox(), ctx.config().network.keep_alive_ms)
        };
        for out in outgoing {
            if let Err(e) = transports.send(&out).await {
                if is_transient(&e) {
                    debug!("{} unreachable, left to the retry cycle", out.destination);
                } else if let Some(tid) = out.tid {
                    warn!("{} to {} failed: {}", tid, out.destination, e);
                    context.lock().transport_error(tid);
                } else {
                    warn!("stateless send to {} failed: {}", out.destination, e);
                }
            }
        }

        if keep_alive_ms == 0 {
            next_keep_alive = None;
            continue;
        }
        let now = Instant::now();
        let period = Duration::from_millis(keep_alive_ms);
        match next_keep_alive {
            Some(at) if at > now => {}
            Some(_) => {
                let targets = context.lock().keep_alive_targets();
                transports.keep_alive(&targets).await;
                next_keep_alive = Some(now + period);
            }
            None => next_keep_alive = Some(now + period),
        }
    }
    debug!("network loop terminated");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> UaConfig {
        UaConfig::default().with_local_ip("127.0.0.1")
    }

    #[tokio::test]
    async fn test_listen_binds_and_records_port() {
        let ua = UserAgent::new(config()).unwrap();
        let local = ua.listen("127.0.0.1:0".parse().unwrap(), Transport::Udp).await.unwrap();
        assert_ne!(local.port(), 0);
        assert_eq!(ua.lock().network().port(Transport::Udp), local.port());
        assert!(ua.is_running());
        ua.quit().await;
        assert!(!ua.is_running());
    }

    #[tokio::test]
    async fn test_listen_after_quit_fails() {
        let ua = UserAgent::new(config()).unwrap();
        ua.quit().await;
        let err = ua.listen("127.0.0.1:0".parse().unwrap(), Transport::Udp).await.unwrap_err();
        assert!(matches!(err, Error::Stopped));
    }

    #[tokio::test]
    async fn test_tls_listen_rejected() {
        let ua = UserAgent::new(config()).unwrap();
        let err = ua.listen("127.0.0.1:0".parse().unwrap(), Transport::Tls).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedTransport(_)));
    }

    #[tokio::test]
    async fn test_quit_releases_registrations() {
        let ua = UserAgent::new(config()).unwrap();
        ua.listen("127.0.0.1:0".parse().unwrap(), Transport::Udp).await.unwrap();
        ua.lock()
            .register_init("sip:alice@example.com", "sip:127.0.0.1:5999", None)
            .unwrap();
        assert_eq!(ua.lock().registrations().len(), 1);
        ua.quit().await;
        assert!(ua.lock().registrations().is_empty());
    }
}
