//! Timer configuration and per-transaction timer bookkeeping.
//!
//! RFC 3261 groups its transaction timers in three families:
//!
//! - **Retransmission** (A, E, G): resend over unreliable transports,
//!   starting at T1 and doubling (capped at T2 for E and G).
//! - **Timeout** (B, F, H): give up on the peer after 64*T1.
//! - **Wait** (D, I, J, K): linger after completion to absorb
//!   retransmissions. Zero on reliable transports.
//!
//! Deadlines are plain milliseconds on the caller's clock so the layer can
//! be driven by a manual clock in tests.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Specifies the type of a SIP transaction timer (RFC 3261 section 17).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerType {
    /// ICT request retransmission
    A,
    /// ICT timeout
    B,
    /// ICT wait for response retransmissions
    D,
    /// NICT request retransmission
    E,
    /// NICT timeout
    F,
    /// IST response retransmission
    G,
    /// IST wait for ACK
    H,
    /// IST wait for ACK retransmissions
    I,
    /// NIST wait for request retransmissions
    J,
    /// NICT wait for response retransmissions
    K,
}

impl fmt::Display for TimerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerType::A => "A",
            TimerType::B => "B",
            TimerType::D => "D",
            TimerType::E => "E",
            TimerType::F => "F",
            TimerType::G => "G",
            TimerType::H => "H",
            TimerType::I => "I",
            TimerType::J => "J",
            TimerType::K => "K",
        };
        write!(f, "Timer{}", name)
    }
}

/// Timer base values. Defaults follow RFC 3261.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSettings {
    /// RTT estimate
    #[serde(with = "millis")]
    pub t1: Duration,
    /// Maximum retransmission interval for non-INVITE requests and INVITE responses
    #[serde(with = "millis")]
    pub t2: Duration,
    /// Maximum duration a message remains in the network
    #[serde(with = "millis")]
    pub t4: Duration,
    /// Timer D on unreliable transports
    #[serde(with = "millis")]
    pub wait_time_d: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            wait_time_d: Duration::from_secs(32),
        }
    }
}

impl TimerSettings {
    /// 64*T1, used by timers B, F, H and J
    pub fn transaction_timeout(&self) -> Duration {
        self.t1 * 64
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Pending deadlines of one transaction, in clock milliseconds.
#[derive(Debug, Clone, Default)]
pub(crate) struct Timers {
    /// A, E or G
    pub retransmit: Option<(TimerType, u64)>,
    pub retransmit_interval: u64,
    /// B, F or H
    pub timeout: Option<(TimerType, u64)>,
    /// D, I, J or K
    pub wait: Option<(TimerType, u64)>,
}

impl Timers {
    pub fn next_deadline(&self) -> Option<u64> {
        [self.retransmit, self.timeout, self.wait]
            .iter()
            .flatten()
            .map(|(_, at)| *at)
            .min()
    }

    pub fn clear(&mut self) {
        *self = Timers::default();
    }
}
