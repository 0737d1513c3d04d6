use std::net::SocketAddr;

use sipua_sip_core::{TransactionId, Transport};

/// Shortest and longest registration period we ask for
pub const MIN_REGISTER_PERIOD: u32 = 200;
pub const MAX_REGISTER_PERIOD: u32 = 3600;

/// One account's REGISTER lifecycle
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: i32,
    /// Address of record (From/To)
    pub aor: String,
    /// Registrar URI (Request-URI)
    pub registrar: String,
    pub contact: Option<String>,
    /// Seconds; 0 means un-register and stops refreshing
    pub period: u32,
    pub last_tr: Option<TransactionId>,
    pub retry: u32,
    pub transport: Transport,
    /// Where UDP keep-alives go, learned from the first REGISTER sent
    pub keep_alive_addr: Option<SocketAddr>,
}

impl Registration {
    pub fn new(id: i32, aor: impl Into<String>, registrar: impl Into<String>, contact: Option<String>) -> Self {
        Registration {
            id,
            aor: aor.into(),
            registrar: registrar.into(),
            contact,
            period: MAX_REGISTER_PERIOD,
            last_tr: None,
            retry: 0,
            transport: Transport::Udp,
            keep_alive_addr: None,
        }
    }

    /// Apply a requested expiry: 0 stays 0, anything else is clamped.
    pub fn set_period(&mut self, expires: u32) {
        self.period = clamp_period(expires);
    }
}

pub fn clamp_period(expires: u32) -> u32 {
    if expires == 0 {
        0
    } else {
        expires.clamp(MIN_REGISTER_PERIOD, MAX_REGISTER_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_clamped() {
        assert_eq!(clamp_period(0), 0);
        assert_eq!(clamp_period(30), 200);
        assert_eq!(clamp_period(1800), 1800);
        assert_eq!(clamp_period(86_400), 3600);
    }
}
