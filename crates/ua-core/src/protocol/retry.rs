//! The automatic-action sweep.
//!
//! Runs once per [`Context::execute`]. It never waits for anything: it
//! looks at the newest finished client transaction of every aggregate and
//! decides whether a follow-up request is due.
//!
//! | last answer      | condition                         | follow-up              |
//! |------------------|-----------------------------------|------------------------|
//! | 401 / 407        | younger than the retry window,    | same request with      |
//! |                  | retry counter below the cap       | credentials            |
//! | 3xx (calls)      | younger than the retry window     | request to the Contact |
//! | 2xx (SUBSCRIBE)  | refresh interval nearly elapsed   | in-dialog SUBSCRIBE    |
//! | any (REGISTER)   | period, ceiling or pending timers | REGISTER again         |

use sipua_sip_core::{CSeq, Method, TransactionId, TransactionState};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::errors::Result;
use crate::model::{Key, Owner, Parent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Followup {
    Credentials,
    Redirect,
}

/// Which retry counter a credentialed resend charges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Counter {
    Aggregate,
    Dialog,
}

#[derive(Debug, Clone, Copy)]
struct Resend {
    parent: Parent,
    dialog: Option<Key>,
    old: TransactionId,
    followup: Followup,
    counter: Counter,
}

fn followup(status: u16, retry: u32, max: u32, redirects: bool) -> Option<Followup> {
    match status {
        401 | 407 if retry < max => Some(Followup::Credentials),
        300..=399 if redirects => Some(Followup::Redirect),
        _ => None,
    }
}

/// Age after which a subscription or registration of `period` seconds is
/// refreshed. Short periods are refreshed at half time.
pub(crate) fn refresh_threshold(period: u64, margin: u64) -> u64 {
    if period > margin {
        period - margin
    } else {
        period / 2
    }
}

impl Context {
    /// Final status of a finished client transaction still young enough to
    /// be acted upon.
    fn actionable_status(&self, tid: TransactionId) -> Option<u16> {
        let tr = self.layer.get(tid)?;
        if !matches!(tr.state, TransactionState::Completed | TransactionState::Terminated) {
            return None;
        }
        if tr.age(self.now_secs()) >= self.config.timing.auth_retry_window {
            return None;
        }
        tr.last_status()
    }

    pub(crate) fn automatic_action(&mut self) {
        let mut work = self.call_followups();
        work.extend(self.subscribe_followups());
        work.extend(self.notify_followups());
        for item in work {
            if let Err(e) = self.resend(item) {
                debug!("{} cannot be retried: {}", item.old, e);
            }
        }
        self.refresh_subscriptions();
        self.refresh_registrations();
    }

    fn call_followups(&self) -> Vec<Resend> {
        let max = self.config.timing.max_retries;
        let mut work: Vec<Resend> = Vec::new();
        for call in self.calls.iter().filter(|c| c.id >= 1) {
            let parent = Parent::Call(call.key);
            let first = call.dialogs.first();
            if first.is_none_or(|d| d.sip.is_none()) {
                if let Some(old) = call.out_tr {
                    if let Some(f) = self
                        .actionable_status(old)
                        .and_then(|s| followup(s, call.retry, max, true))
                    {
                        work.push(Resend {
                            parent,
                            dialog: first.map(|d| d.key),
                            old,
                            followup: f,
                            counter: Counter::Aggregate,
                        });
                    }
                }
            }
            for dialog in call.dialogs.iter().filter(|d| d.sip.is_some()) {
                let Some(old) = dialog.last_out_tr().or(call.out_tr) else {
                    continue;
                };
                if work.iter().any(|w| w.old == old) {
                    continue;
                }
                if let Some(f) = self
                    .actionable_status(old)
                    .and_then(|s| followup(s, dialog.retry, max, true))
                {
                    work.push(Resend {
                        parent,
                        dialog: Some(dialog.key),
                        old,
                        followup: f,
                        counter: Counter::Dialog,
                    });
                }
            }
        }
        work
    }

    fn subscribe_followups(&self) -> Vec<Resend> {
        let max = self.config.timing.max_retries;
        let mut work = Vec::new();
        for sub in self.subscribes.iter().filter(|s| s.id >= 1) {
            let parent = Parent::Subscribe(sub.key);
            if sub.dialogs.is_empty() {
                if let Some(old) = sub.out_tr {
                    if let Some(f) = self
                        .actionable_status(old)
                        .and_then(|s| followup(s, sub.retry, max, false))
                    {
                        work.push(Resend {
                            parent,
                            dialog: None,
                            old,
                            followup: f,
                            counter: Counter::Aggregate,
                        });
                    }
                }
                continue;
            }
            for dialog in sub.dialogs.iter().filter(|d| d.sip.is_some() && d.id >= 1) {
                let Some(old) = dialog.last_out_tr().or(sub.out_tr) else {
                    continue;
                };
                if let Some(f) = self
                    .actionable_status(old)
                    .and_then(|s| followup(s, dialog.retry, max, false))
                {
                    work.push(Resend {
                        parent,
                        dialog: Some(dialog.key),
                        old,
                        followup: f,
                        counter: Counter::Dialog,
                    });
                }
            }
        }
        work
    }

    fn notify_followups(&self) -> Vec<Resend> {
        let max = self.config.timing.max_retries;
        let mut work = Vec::new();
        for notify in self.notifies.iter().filter(|n| n.id >= 1) {
            for dialog in notify.dialogs.iter().filter(|d| d.sip.is_some()) {
                let Some(old) = self.last_out_of(dialog, &Method::Notify) else {
                    continue;
                };
                if let Some(f) = self
                    .actionable_status(old)
                    .and_then(|s| followup(s, dialog.retry, max, false))
                {
                    work.push(Resend {
                        parent: Parent::Notify(notify.key),
                        dialog: Some(dialog.key),
                        old,
                        followup: f,
                        counter: Counter::Dialog,
                    });
                }
            }
        }
        work
    }

    fn charge_retry(&mut self, item: Resend) {
        let owner = Owner::new(item.parent, item.dialog);
        match item.counter {
            Counter::Dialog => {
                if let Some(dialog) = self.dialog_mut(owner) {
                    dialog.retry += 1;
                }
            }
            Counter::Aggregate => match item.parent {
                Parent::Call(k) => {
                    if let Some(c) = self.call_by_key_mut(k) {
                        c.retry += 1;
                    }
                }
                Parent::Subscribe(k) => {
                    if let Some(s) = self.subscribe_by_key_mut(k) {
                        s.retry += 1;
                    }
                }
                Parent::Notify(k) => {
                    if let Some(n) = self.notify_by_key_mut(k) {
                        n.retry += 1;
                    }
                }
            },
        }
    }

    /// Replace `old` with a rebuilt request in the same aggregate.
    fn resend(&mut self, item: Resend) -> Result<()> {
        let Some((orig, answer)) = self
            .layer
            .get(item.old)
            .and_then(|t| Some((t.orig_request.clone(), t.last_response.clone()?)))
        else {
            return Ok(());
        };
        if item.followup == Followup::Credentials {
            self.charge_retry(item);
        }

        let builder = self.builder();
        let mut request = match item.followup {
            Followup::Credentials => builder.rebuild_with_credentials(&orig, &answer, &self.auth)?,
            Followup::Redirect => builder.rebuild_for_redirect(&orig, &answer)?,
        };

        let owner = Owner::new(item.parent, item.dialog);
        let live_dialog = self.dialog(owner).is_some_and(|d| d.sip.is_some());
        if let Some(sip) = self.dialog_mut(owner).and_then(|d| d.sip.as_mut()) {
            if let Some(cseq) = request.cseq() {
                let seq = (sip.local_cseq + 1).max(cseq.seq);
                sip.local_cseq = seq;
                request.set_cseq(&CSeq {
                    seq,
                    method: cseq.method,
                });
            }
        }

        let new_owner = Owner::new(item.parent, item.dialog.filter(|_| live_dialog));
        let tid = self.start_client(request, Some(new_owner))?;
        info!(
            "{} {} after {}",
            tid,
            match item.followup {
                Followup::Credentials => "retried with credentials",
                Followup::Redirect => "redirected",
            },
            item.old
        );

        let replaced = match item.parent {
            Parent::Call(k) => self
                .call_by_key_mut(k)
                .filter(|c| c.out_tr == Some(item.old))
                .map(|c| c.out_tr = Some(tid))
                .is_some(),
            Parent::Subscribe(k) => self
                .subscribe_by_key_mut(k)
                .filter(|s| s.out_tr == Some(item.old))
                .map(|s| s.out_tr = Some(tid))
                .is_some(),
            Parent::Notify(k) => self
                .notify_by_key_mut(k)
                .filter(|n| n.out_tr == Some(item.old))
                .map(|n| n.out_tr = Some(tid))
                .is_some(),
        };

        if replaced {
            self.discard(item.old);
            if item.followup == Followup::Redirect {
                let removed = item
                    .dialog
                    .and_then(|dk| self.parent_mut(item.parent)?.remove_dialog(dk));
                if let Some(dialog) = removed {
                    for old in dialog.inc_trs.iter().chain(dialog.out_trs.iter()) {
                        self.discard(*old);
                    }
                }
            }
        } else if let Some(dialog) = self.dialog_mut(owner) {
            dialog.push_out_tr(tid);
        }
        self.update();
        Ok(())
    }

    /// Refresh in-dialog SUBSCRIBEs whose interval is about to run out.
    fn refresh_subscriptions(&mut self) {
        let now = self.now_secs();
        let margin = self.config.timing.refresh_margin;
        let mut due = Vec::new();
        for sub in self.subscribes.iter().filter(|s| s.id >= 1 && s.refresh_interval != 0) {
            let threshold = refresh_threshold(u64::from(sub.refresh_interval), margin);
            for dialog in sub.dialogs.iter().filter(|d| d.sip.is_some() && d.id >= 1) {
                let Some(last) = dialog.last_out_tr().or(sub.out_tr) else {
                    continue;
                };
                let Some(tr) = self.layer.get(last) else {
                    continue;
                };
                // a challenged refresh is the credential path's business
                if matches!(tr.last_status(), Some(401 | 407)) {
                    continue;
                }
                if tr.age(now) > threshold {
                    due.push(Owner::new(Parent::Subscribe(sub.key), Some(dialog.key)));
                }
            }
        }
        for owner in due {
            if let Err(e) = self.send_subscribe_refresh(owner, None) {
                warn!("subscription refresh failed: {}", e);
            }
        }
    }

    fn refresh_registrations(&mut self) {
        let now = self.now_secs();
        let timing = self.config.timing;
        let mut due: Vec<(i32, bool)> = Vec::new();
        for reg in self.registrations.iter().filter(|r| r.id >= 1 && r.period != 0) {
            let Some(tr) = reg.last_tr.and_then(|t| self.layer.get(t)) else {
                continue;
            };
            let age = tr.age(now);
            let status = tr.last_status();
            let answered = status.is_some_and(|s| (200..300).contains(&s));
            let challenged = matches!(status, Some(401 | 407))
                && matches!(tr.state, TransactionState::Completed | TransactionState::Terminated);

            if age > timing.registration_ceiling
                || age > refresh_threshold(u64::from(reg.period), timing.refresh_margin)
            {
                due.push((reg.id, false));
            } else if age > timing.pending_retry_after && !answered {
                due.push((reg.id, false));
            } else if age < timing.pending_retry_after && challenged && reg.retry < timing.max_retries {
                due.push((reg.id, true));
            }
        }
        for (rid, counts) in due {
            if counts {
                if let Some(reg) = self.registrations.iter_mut().find(|r| r.id == rid) {
                    reg.retry += 1;
                }
            }
            debug!("registration {} sent again", rid);
            if let Err(e) = self.register_resend(rid) {
                warn!("registration {} refresh failed: {}", rid, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_followup_respects_cap() {
        assert_eq!(followup(401, 0, 3, true), Some(Followup::Credentials));
        assert_eq!(followup(407, 2, 3, false), Some(Followup::Credentials));
        assert_eq!(followup(407, 3, 3, true), None);
        assert_eq!(followup(302, 9, 3, true), Some(Followup::Redirect));
        assert_eq!(followup(302, 0, 3, false), None);
        assert_eq!(followup(486, 0, 3, true), None);
    }

    #[test]
    fn test_refresh_threshold() {
        assert_eq!(refresh_threshold(3600, 60), 3540);
        assert_eq!(refresh_threshold(60, 60), 30);
        assert_eq!(refresh_threshold(0, 60), 0);
    }
}
