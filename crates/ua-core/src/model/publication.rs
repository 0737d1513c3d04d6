use sipua_sip_core::TransactionId;

/// PUBLISH state for one address of record
#[derive(Debug, Clone)]
pub struct Publication {
    pub aor: String,
    /// Epoch second the published state expires
    pub expires_at: u64,
    /// Seconds requested in the last PUBLISH
    pub period: u32,
    /// `SIP-ETag` from the last 2xx
    pub etag: Option<String>,
    pub last_tr: Option<TransactionId>,
}

impl Publication {
    pub fn new(aor: impl Into<String>, period: u32) -> Self {
        Publication {
            aor: aor.into(),
            expires_at: 0,
            period,
            etag: None,
            last_tr: None,
        }
    }

    /// An ETag is only worth sending while the published state is alive.
    pub fn live_etag(&self, now_secs: u64) -> Option<&str> {
        if now_secs < self.expires_at {
            self.etag.as_deref()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_expires() {
        let mut p = Publication::new("sip:alice@example.com", 60);
        p.etag = Some("abc".into());
        p.expires_at = 100;
        assert_eq!(p.live_etag(99), Some("abc"));
        assert_eq!(p.live_etag(100), None);
    }
}
