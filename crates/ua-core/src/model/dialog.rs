use sipua_sip_core::{DialogState, Message, Result, SipDialog, TransactionId};

use super::Key;

/// Progress of a dialog as seen by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialogStatus {
    Empty,
    Initialized,
    Trying,
    Queued,
    Ringing,
    Established,
    Redirected,
    AuthRequired,
    ClientError,
    ServerError,
    GlobalFailure,
    Terminated,
}

/// One RFC 3261 dialog inside a call, subscribe or notify.
///
/// `sip` is `None` once the underlying dialog was dropped (abandoned early
/// dialog, BYE sent); the entry then only waits for its pending
/// transactions to be collected.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub(crate) key: Key,
    /// Assigned by `Context::update`; `-1` when `sip` is gone
    pub id: i32,
    pub status: DialogStatus,
    pub sip: Option<SipDialog>,
    /// Credentialed retries issued for this dialog
    pub retry: u32,
    /// Incoming transactions, newest first
    pub inc_trs: Vec<TransactionId>,
    /// Outgoing transactions, newest first
    pub out_trs: Vec<TransactionId>,
    /// Last 2xx sent or received for the dialog-creating request
    pub ok200: Option<Message>,
    /// Last ACK sent for a 2xx
    pub ack: Option<Message>,
}

impl Dialog {
    fn with_sip(key: Key, sip: SipDialog) -> Self {
        Dialog {
            key,
            id: 0,
            status: DialogStatus::Initialized,
            sip: Some(sip),
            retry: 0,
            inc_trs: Vec::new(),
            out_trs: Vec::new(),
            ok200: None,
            ack: None,
        }
    }

    /// Caller side, from a 1xx/2xx to our request.
    pub fn init_as_uac(key: Key, response: &Message) -> Result<Self> {
        Ok(Self::with_sip(key, SipDialog::init_as_uac(response)?))
    }

    /// Callee side, from the request and the tagged answer we send.
    pub fn init_as_uas(key: Key, request: &Message, response: &Message) -> Result<Self> {
        Ok(Self::with_sip(key, SipDialog::init_as_uas(request, response)?))
    }

    /// Subscriber side, from a NOTIFY that beat the SUBSCRIBE's 2xx.
    pub fn init_as_uac_with_remote_request(key: Key, request: &Message, local_cseq: u32) -> Result<Self> {
        Ok(Self::with_sip(
            key,
            SipDialog::init_as_uac_with_remote_request(request, local_cseq)?,
        ))
    }

    pub fn is_confirmed(&self) -> bool {
        self.sip
            .as_ref()
            .is_some_and(|d| d.state == DialogState::Confirmed)
    }

    pub fn is_early(&self) -> bool {
        self.sip.as_ref().is_some_and(|d| d.state == DialogState::Early)
    }

    pub fn last_out_tr(&self) -> Option<TransactionId> {
        self.out_trs.first().copied()
    }

    pub fn last_inc_tr(&self) -> Option<TransactionId> {
        self.inc_trs.first().copied()
    }

    pub fn push_out_tr(&mut self, tid: TransactionId) {
        self.out_trs.insert(0, tid);
    }

    pub fn push_inc_tr(&mut self, tid: TransactionId) {
        self.inc_trs.insert(0, tid);
    }

    /// Drop the underlying dialog if it never got confirmed.
    ///
    /// Returns true when something was dropped.
    pub fn delete_if_early(&mut self) -> bool {
        if self.is_early() {
            self.sip = None;
            self.status = DialogStatus::Terminated;
            true
        } else {
            false
        }
    }

    pub fn set_200ok(&mut self, response: &Message) {
        self.ok200 = Some(response.clone());
    }

    pub fn forget_transaction(&mut self, tid: TransactionId) {
        self.inc_trs.retain(|t| *t != tid);
        self.out_trs.retain(|t| *t != tid);
    }
}
