//! Release of finished aggregates and orphaned transactions.
//!
//! A transaction younger than the abandon window that has not terminated
//! keeps its aggregate alive. Past the window it is reclaimed whatever its
//! state.

use sipua_sip_core::{Method, TransactionId};
use tracing::{debug, info};

use crate::context::Context;
use crate::events::EventType;
use crate::model::{Call, Dialog, Key, Owner, Parent, SubscriptionStatus};

#[derive(Debug, Clone, Copy)]
enum CallAction {
    /// Pending transaction past the window, dropped from its dialog
    Forget(Key, TransactionId),
    RemoveDialog { dialog: Key, no_answer: bool },
    Release,
}

fn is_failure(status: Option<u16>) -> bool {
    status.is_some_and(|s| s >= 300)
}

impl Context {
    fn is_abandoned(&self, tid: TransactionId, now: u64) -> bool {
        self.layer
            .get(tid)
            .is_some_and(|t| t.age(now) >= self.config.timing.abandon_window)
    }

    /// Whether `dialog` still waits on a BYE, REFER or INVITE. Transactions
    /// past the window are reported in `stale` instead of blocking.
    fn dialog_is_busy(&self, call: &Call, dialog: &Dialog, now: u64, stale: &mut Vec<TransactionId>) -> bool {
        let mut busy = false;
        for method in [Method::Bye, Method::Refer] {
            for tid in [self.last_inc_of(dialog, &method), self.last_out_of(dialog, &method)]
                .into_iter()
                .flatten()
            {
                if self.is_terminated(tid) {
                    continue;
                }
                if self.is_abandoned(tid, now) {
                    stale.push(tid);
                } else {
                    busy = true;
                }
            }
        }
        let invite = self
            .last_inc_of(dialog, &Method::Invite)
            .or_else(|| self.last_out_of(dialog, &Method::Invite))
            .or(call.inc_tr)
            .or(call.out_tr);
        if invite.is_some_and(|t| !self.is_terminated(t) && !self.is_abandoned(t, now)) {
            busy = true;
        }
        busy
    }

    fn judge_call(&self, call: &Call, now: u64) -> Vec<CallAction> {
        if call.dialogs.is_empty() {
            return self.judge_dialogless_call(call, now).into_iter().collect();
        }

        let mut actions = Vec::new();
        for dialog in &call.dialogs {
            let mut stale = Vec::new();
            let busy = self.dialog_is_busy(call, dialog, now, &mut stale);
            actions.extend(stale.into_iter().map(|t| CallAction::Forget(dialog.key, t)));
            if busy {
                continue;
            }

            let bye_done = [self.last_inc_of(dialog, &Method::Bye), self.last_out_of(dialog, &Method::Bye)]
                .into_iter()
                .flatten()
                .any(|t| self.is_terminated(t));
            if bye_done || dialog.sip.is_none() {
                actions.push(CallAction::RemoveDialog {
                    dialog: dialog.key,
                    no_answer: false,
                });
                continue;
            }

            let Some(tid) = call.inc_tr.or(call.out_tr) else {
                actions.push(CallAction::RemoveDialog {
                    dialog: dialog.key,
                    no_answer: false,
                });
                continue;
            };
            let Some(tr) = self.layer.get(tid) else {
                continue;
            };
            if !tr.is_terminated() {
                if tr.age(now) >= self.config.timing.abandon_window {
                    actions.push(CallAction::RemoveDialog {
                        dialog: dialog.key,
                        no_answer: true,
                    });
                }
                continue;
            }
            let incoming = call.inc_tr == Some(tid);
            let failed = is_failure(tr.last_status());
            if (incoming && failed) || (!incoming && (tr.last_response.is_none() || failed)) {
                actions.push(CallAction::Release);
                break;
            }
        }
        actions
    }

    fn judge_dialogless_call(&self, call: &Call, now: u64) -> Option<CallAction> {
        let options = [call.out_tr, call.inc_tr]
            .into_iter()
            .flatten()
            .find(|t| self.method_of(*t) == Some(Method::Options));
        if let Some(tid) = options {
            return (self.is_terminated(tid) || self.is_abandoned(tid, now)).then_some(CallAction::Release);
        }

        let pending = [call.inc_tr, call.out_tr]
            .into_iter()
            .flatten()
            .find(|t| self.method_of(*t) == Some(Method::Invite) && !self.is_terminated(*t));
        match pending {
            Some(tid) if !self.is_abandoned(tid, now) => None,
            _ => Some(CallAction::Release),
        }
    }

    pub(crate) fn release_terminated_calls(&mut self) {
        let now = self.now_secs();
        let verdicts: Vec<(Key, Vec<CallAction>)> = self
            .calls
            .iter()
            .map(|c| (c.key, self.judge_call(c, now)))
            .filter(|(_, a)| !a.is_empty())
            .collect();

        let mut changed = false;
        for (ck, actions) in verdicts {
            let parent = Parent::Call(ck);
            let mut released = false;
            for action in actions {
                match action {
                    CallAction::Forget(dk, tid) => {
                        if let Some(dialog) = self.dialog_mut(Owner::new(parent, Some(dk))) {
                            dialog.forget_transaction(tid);
                        }
                        self.discard(tid);
                    }
                    CallAction::RemoveDialog { dialog, no_answer } => {
                        if no_answer {
                            info!("call abandoned without answer");
                            self.report(EventType::CallNoAnswer, None, Some(Owner::new(parent, Some(dialog))));
                        }
                        let removed = self.parent_mut(parent).and_then(|p| p.remove_dialog(dialog));
                        if let Some(removed) = removed {
                            for tid in removed.inc_trs.iter().chain(removed.out_trs.iter()) {
                                self.discard(*tid);
                            }
                        }
                        changed = true;
                    }
                    CallAction::Release => {
                        self.release_call(ck);
                        released = true;
                        changed = true;
                        break;
                    }
                }
            }
            // the last dialog just went away: judge the bare call now
            let emptied = !released
                && self.call_by_key(ck).is_some_and(|c| {
                    c.dialogs.is_empty() && matches!(self.judge_dialogless_call(c, now), Some(CallAction::Release))
                });
            if emptied {
                self.release_call(ck);
                changed = true;
            }
        }
        if changed {
            self.update();
        }
    }

    fn release_call(&mut self, ck: Key) {
        let tid = self.call_by_key(ck).and_then(|c| c.inc_tr.or(c.out_tr));
        self.report(EventType::CallReleased, tid, Some(Owner::new(Parent::Call(ck), None)));
        self.free_call(ck);
    }

    /// Every one of `tids` has terminated
    fn is_quiet(&self, tids: impl IntoIterator<Item = TransactionId>) -> bool {
        tids.into_iter().all(|t| self.is_terminated(t))
    }

    pub(crate) fn release_terminated_subscriptions(&mut self) {
        let timing = self.config.timing;
        let mut released = Vec::new();
        for sub in &self.subscribes {
            let quiet = self.is_quiet(sub.transactions());
            let no_live_dialog = sub.dialogs.iter().all(|d| d.sip.is_none());
            let finished = sub.ss_status == SubscriptionStatus::Terminated && quiet;
            // a failed initial SUBSCRIBE the sweep will not retry
            let failed = no_live_dialog
                && quiet
                && sub.out_tr.is_none_or(|t| {
                    self.layer.get(t).is_none_or(|tr| {
                        let challenged = matches!(tr.last_status(), Some(401 | 407));
                        !(challenged
                            && sub.retry < timing.max_retries
                            && tr.age(self.now_secs()) < timing.auth_retry_window)
                    })
                });
            if finished || failed {
                released.push(sub.key);
            }
        }
        for key in released {
            debug!("subscription finished");
            self.report(EventType::SubscriptionReleased, None, Some(Owner::new(Parent::Subscribe(key), None)));
            self.free_subscribe(key);
        }

        let mut released = Vec::new();
        for notify in &self.notifies {
            if !self.is_quiet(notify.transactions()) {
                continue;
            }
            if notify.ss_status == SubscriptionStatus::Terminated {
                released.push((notify.key, true));
            } else if notify.dialogs.iter().all(|d| d.sip.is_none()) {
                // rejected by the application
                released.push((notify.key, false));
            }
        }
        for (key, announce) in released {
            if announce {
                self.report(EventType::InSubscriptionReleased, None, Some(Owner::new(Parent::Notify(key), None)));
            }
            self.free_notify(key);
        }
    }

    pub(crate) fn release_terminated_registrations(&mut self) {
        let now = self.now_secs();
        let linger = self.config.timing.unregister_linger;
        let done: Vec<i32> = self
            .registrations
            .iter()
            .filter(|r| r.period == 0)
            .filter(|r| {
                r.last_tr.and_then(|t| self.layer.get(t)).is_some_and(|tr| {
                    tr.age(now) > linger || tr.last_status().is_some_and(|s| (200..300).contains(&s))
                })
            })
            .map(|r| r.id)
            .collect();
        for rid in done {
            self.free_registration(rid);
        }
    }

    /// Drop garbage transactions that terminated or outlived the window.
    pub(crate) fn collect_garbage(&mut self) {
        let now = self.now_secs();
        let window = self.config.timing.abandon_window;
        let mut kept = Vec::with_capacity(self.garbage.len());
        for tid in std::mem::take(&mut self.garbage) {
            match self.layer.get(tid) {
                None => {}
                Some(tr) if tr.is_terminated() || tr.age(now) >= window => {
                    self.layer.remove(tid);
                    self.owners.remove(&tid);
                }
                Some(_) => kept.push(tid),
            }
        }
        self.garbage = kept;
    }
}
