/// Represents the state of a SIP transaction, aligned with the state machines
/// defined in RFC 3261 (Section 17).
///
/// Which states a transaction passes through depends on its
/// [`TransactionKind`](super::TransactionKind):
///
/// - ICT: `Calling` -> `Proceeding` -> `Completed` -> `Terminated`
/// - NICT: `Trying` -> `Proceeding` -> `Completed` -> `Terminated`
/// - IST: `Proceeding` -> `Completed` -> `Confirmed` -> `Terminated`
/// - NIST: `Trying` -> `Proceeding` -> `Completed` -> `Terminated`
///
/// A 2xx moves both INVITE machines straight to `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// **Client INVITE only.** The INVITE has been sent and nothing has
    /// come back yet.
    Calling,

    /// **Non-INVITE client and server.** Request sent (client) or received
    /// (server), no provisional response yet.
    Trying,

    /// A provisional response has been received (client) or sent (server).
    Proceeding,

    /// A final response has been received (client) or sent (server). The
    /// transaction lingers here to absorb retransmissions.
    Completed,

    /// **Server INVITE only.** The ACK for a non-2xx final response arrived.
    Confirmed,

    /// Finished. The transaction no longer matches messages but stays in the
    /// layer until its owner removes it.
    Terminated,
}

impl TransactionState {
    /// Checks if the transaction state is `Terminated`.
    pub fn is_terminated(&self) -> bool {
        *self == TransactionState::Terminated
    }

    /// `Completed` or `Terminated`: a final response has been exchanged
    /// (or the transaction died without one).
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TransactionState::Completed | TransactionState::Confirmed | TransactionState::Terminated
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionState::Calling => "Calling",
            TransactionState::Trying => "Trying",
            TransactionState::Proceeding => "Proceeding",
            TransactionState::Completed => "Completed",
            TransactionState::Confirmed => "Confirmed",
            TransactionState::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}
