//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mimeseal.
//
// Mimeseal is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mimeseal is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mimeseal. If not, see <http://www.gnu.org/licenses/>.

//! What happens on each send event.
//!
//! Each message lives in a `MessageCell`. Its lock is always taken before
//! the engine-wide crypto lock, and the crypto lock is never held while
//! waiting for a message lock. An asynchronous crypto pass runs on a worker
//! thread holding only a weak reference to the cell; it re-checks that the
//! message still exists and is still on the same attempt before it touches
//! anything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use crossbeam::channel::RecvTimeoutError;
use log::{debug, error, info};

use super::send::{
    apply_to_store, check_before_send, serialize_for_send,
    update_compose_view, MimeBlob, SendInput,
};
use super::state::{
    next_state, ExecMode, SendCryptoState, SendDecision, SendEvent,
};
use super::{Completion, CompletionStatus, MessageId, Shared};
use crate::crypt::backend::{CryptOperation, KeyResolver};
use crate::crypt::naked::SessionKey;
use crate::mime::boundary::RandomBoundary;
use crate::store::{AttachmentHandle, NativeStore};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

pub(super) struct MessageCell {
    pub(super) id: MessageId,
    pub(super) log_prefix: LogPrefix,
    pub(super) state: Mutex<MessageState>,
}

pub(super) struct MessageState {
    pub(super) store: Box<dyn NativeStore>,
    pub(super) destroyed: bool,
    pub(super) send: SendCrypt,
    /// Keys of the attachments protected by receive passes.
    pub(super) protected: Vec<(AttachmentHandle, SessionKey)>,
}

impl MessageCell {
    pub(super) fn new(id: MessageId, store: Box<dyn NativeStore>) -> Self {
        MessageCell {
            id,
            log_prefix: LogPrefix::new("send", id.0),
            state: Mutex::new(MessageState {
                store,
                destroyed: false,
                send: SendCrypt::new(),
                protected: Vec::new(),
            }),
        }
    }
}

/// The send-time crypto state of one message.
pub(super) struct SendCrypt {
    state: SendCryptoState,
    operation: Option<CryptOperation>,
    /// Set by `RequestCrypto`; only `Revert` and `Sent` clear it.
    requested: bool,
    inline: bool,
    mode: Option<ExecMode>,
    input: Option<SendInput>,
    result: Option<MimeBlob>,
    /// Crypto passes completed since the last return to `NoCryptMail`.
    successes: u32,
    /// Bumped whenever the current attempt is abandoned.
    generation: u64,
    /// The cancellation flag of the in-flight worker, if any.
    worker: Option<Arc<AtomicBool>>,
    blocked: Option<String>,
    history: Vec<SendCryptoState>,
}

impl SendCrypt {
    fn new() -> Self {
        SendCrypt {
            state: SendCryptoState::NoCryptMail,
            operation: None,
            requested: false,
            inline: false,
            mode: None,
            input: None,
            result: None,
            successes: 0,
            generation: 0,
            worker: None,
            blocked: None,
            history: vec![SendCryptoState::NoCryptMail],
        }
    }

    pub(super) fn state(&self) -> SendCryptoState {
        self.state
    }

    pub(super) fn history(&self) -> &[SendCryptoState] {
        &self.history
    }

    fn enter(&mut self, state: SendCryptoState) {
        self.state = state;
        self.history.push(state);
    }

    fn violation(&self, operation: &'static str) -> Error {
        Error::StateViolation {
            operation,
            state: self.state.to_string(),
        }
    }

    pub(super) fn cancel_worker(&mut self) {
        if let Some(cancel) = self.worker.take() {
            cancel.store(true, Ordering::SeqCst);
        }
    }

    /// Abandon the current attempt.
    fn reset(&mut self) {
        self.cancel_worker();
        self.generation += 1;
        self.operation = None;
        self.input = None;
        self.result = None;
        self.successes = 0;
        if SendCryptoState::NoCryptMail != self.state {
            self.enter(SendCryptoState::NoCryptMail);
        }
    }

    /// Reset after `e` and return it.
    fn fail(&mut self, log_prefix: &LogPrefix, e: Error) -> Error {
        if e.is_cancellation() {
            info!("{} Cancelled in state {}", log_prefix, self.state);
        } else {
            error!("{} Failed in state {}: {}", log_prefix, self.state, e);
        }

        if let Error::SendBlocked(ref reason) = e {
            self.blocked = Some(reason.clone());
        }
        self.reset();
        e
    }

    pub(super) fn decision(&self) -> Result<SendDecision, Error> {
        if let Some(ref reason) = self.blocked {
            return Err(Error::SendBlocked(reason.clone()));
        }

        match self.state {
            SendCryptoState::WantsSendMime => Ok(SendDecision::Mime),
            SendCryptoState::WantsSendInline => Ok(SendDecision::Inline),
            SendCryptoState::NoCryptMail if !self.requested => {
                Ok(SendDecision::Plain)
            }
            SendCryptoState::NoCryptMail => Err(Error::SendBlocked(
                "Protection was requested but did not complete".to_owned(),
            )),
            _ => Err(self.violation("can_send")),
        }
    }
}

/// Decide whether the message may be sent.
///
/// The stored message is checked against the crypto result again, since the
/// host may have changed it after the last event.
pub(super) fn can_send(
    cell: &MessageCell,
    message: &mut MessageState,
) -> Result<SendDecision, Error> {
    let decision = message.send.decision()?;
    let check = match message.send.result {
        Some(ref blob) if SendDecision::Plain != decision => {
            check_before_send(&*message.store, blob)
        }
        _ => Ok(()),
    };

    check
        .map(|()| decision)
        .map_err(|e| message.send.fail(&cell.log_prefix, e))
}

/// Apply `event` to the message in `cell`.
pub(super) fn advance(
    cell: &Arc<MessageCell>,
    shared: &Arc<Shared>,
    resolver: &dyn KeyResolver,
    event: SendEvent,
) -> Result<SendCryptoState, Error> {
    let mut guard = cell.state.lock().unwrap();
    if guard.destroyed {
        return Err(Error::MessageGone);
    }
    let message = &mut *guard;
    let store = &mut message.store;
    let send = &mut message.send;

    let current = send.state;
    if SendEvent::DoCrypt == event && send.worker.is_some() {
        return Err(send.violation(event.name()));
    }
    let next = next_state(current, &event, send.mode, send.inline)
        .ok_or_else(|| send.violation(event.name()))?;
    debug!("{} {} in state {}", cell.log_prefix, event.name(), current);

    let result = match event {
        SendEvent::RequestCrypto(op) => {
            send.operation = Some(op);
            send.requested = true;
            send.blocked = None;
            Ok(next)
        }

        SendEvent::AfterWrite
            if SendCryptoState::NeedsFirstAfterWrite == current =>
        {
            collect(cell, shared, &mut **store, send).map(|()| next)
        }

        SendEvent::AfterWrite => Ok(next),

        SendEvent::DoCrypt => do_crypt(cell, shared, resolver, send, next),

        SendEvent::UpdateMapi => send
            .result
            .as_ref()
            .ok_or_else(|| send.violation("UpdateMAPI"))
            .and_then(|blob| {
                apply_to_store(&mut **store, blob)?;
                if next.wants_send() {
                    check_before_send(&**store, blob)?;
                }
                Ok(next)
            }),

        SendEvent::UpdateOom => send
            .result
            .as_ref()
            .ok_or_else(|| send.violation("UpdateOOM"))
            .and_then(|blob| {
                if next.wants_send() {
                    check_before_send(&**store, blob)?;
                } else {
                    update_compose_view(&mut **store, blob)?;
                }
                Ok(next)
            }),

        SendEvent::Revert | SendEvent::Sent => {
            info!("{} Back to a plain message", cell.log_prefix);
            send.reset();
            send.requested = false;
            send.blocked = None;
            Ok(next)
        }
    };

    match result {
        Ok(state) if state.wants_send() && 1 != send.successes => {
            let successes = send.successes;
            Err(send.fail(
                &cell.log_prefix,
                Error::StateViolation {
                    operation: "send",
                    state: format!("{} completed crypto passes", successes),
                },
            ))
        }
        Ok(state) => {
            if state != send.state {
                send.enter(state);
            }
            Ok(state)
        }
        Err(e) => Err(send.fail(&cell.log_prefix, e)),
    }
}

/// Collect the message content and, the first time, fix the execution mode.
fn collect(
    cell: &MessageCell,
    shared: &Shared,
    store: &mut dyn NativeStore,
    send: &mut SendCrypt,
) -> Result<(), Error> {
    let input = SendInput::collect(store)?;

    if send.mode.is_none() {
        // The host cannot save some messages from a background thread
        let sync = shared.config.send.force_sync
            || store.subject()?.trim().is_empty()
            || !input.attachments.is_empty()
            || store.is_inline_response();
        let mode = if sync { ExecMode::Sync } else { ExecMode::Async };
        debug!("{} Crypto will run {:?}", cell.log_prefix, mode);
        send.mode = Some(mode);
    }

    send.input = Some(input);
    Ok(())
}

fn do_crypt(
    cell: &Arc<MessageCell>,
    shared: &Arc<Shared>,
    resolver: &dyn KeyResolver,
    send: &mut SendCrypt,
    next: SendCryptoState,
) -> Result<SendCryptoState, Error> {
    // Consumed here, whatever the outcome
    let op = send
        .operation
        .take()
        .ok_or_else(|| send.violation("DoCrypt"))?;
    let input = send.input.take().ok_or_else(|| send.violation("DoCrypt"))?;

    let op = resolver.resolve(&op)?;
    cell.log_prefix.set_protocol(op.protocol);
    send.inline = op.inline;

    if Some(ExecMode::Async) == send.mode {
        spawn_worker(cell, shared, send, op, input);
        return Ok(SendCryptoState::NeedsActualCrypt);
    }

    let blob = run_sync(shared, op, input)?;
    send.result = Some(blob);
    send.successes += 1;
    Ok(next)
}

fn crypt(
    shared: &Shared,
    op: &CryptOperation,
    input: &SendInput,
) -> Result<MimeBlob, Error> {
    let _flight = shared.crypto_lock.lock().unwrap();
    serialize_for_send(
        input,
        Some(op),
        &*shared.backend,
        &shared.config.send,
        &mut RandomBoundary,
    )
}

/// Run the crypto pass on the calling thread's behalf, giving up after the
/// configured timeout.
fn run_sync(
    shared: &Arc<Shared>,
    op: CryptOperation,
    input: SendInput,
) -> Result<MimeBlob, Error> {
    let timeout = match shared.config.crypto_timeout() {
        None => return crypt(shared, &op, &input),
        Some(timeout) => timeout,
    };

    let (tx, rx) = crossbeam::channel::bounded(1);
    let helper = Arc::clone(shared);
    thread::spawn(move || {
        let _ = tx.send(crypt(&helper, &op, &input));
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
        Err(RecvTimeoutError::Disconnected) => Err(Error::CryptoBackend(
            "Crypto thread exited without a result".to_owned(),
        )),
    }
}

fn spawn_worker(
    cell: &Arc<MessageCell>,
    shared: &Arc<Shared>,
    send: &mut SendCrypt,
    op: CryptOperation,
    input: SendInput,
) {
    let cancel = Arc::new(AtomicBool::new(false));
    send.worker = Some(Arc::clone(&cancel));

    let job = Job {
        cell: Arc::downgrade(cell),
        shared: Arc::clone(shared),
        id: cell.id,
        log_prefix: cell.log_prefix.clone(),
        generation: send.generation,
        cancel,
        op,
        input,
    };
    thread::spawn(move || job.run());
}

/// An asynchronous crypto pass.
struct Job {
    cell: Weak<MessageCell>,
    shared: Arc<Shared>,
    id: MessageId,
    log_prefix: LogPrefix,
    generation: u64,
    cancel: Arc<AtomicBool>,
    op: CryptOperation,
    input: SendInput,
}

impl Job {
    fn run(self) {
        if !self.still_wanted() {
            debug!("{} Worker abandoned before starting", self.log_prefix);
            return;
        }

        let result = {
            let _flight = self.shared.crypto_lock.lock().unwrap();
            if self.cancel.load(Ordering::SeqCst) {
                debug!("{} Worker cancelled while waiting", self.log_prefix);
                return;
            }
            serialize_for_send(
                &self.input,
                Some(&self.op),
                &*self.shared.backend,
                &self.shared.config.send,
                &mut RandomBoundary,
            )
        };

        let cell = match self.cell.upgrade() {
            Some(cell) => cell,
            None => {
                debug!("{} Message destroyed during crypto", self.log_prefix);
                return;
            }
        };

        let mut guard = cell.state.lock().unwrap();
        if guard.destroyed
            || guard.send.generation != self.generation
            || self.cancel.load(Ordering::SeqCst)
        {
            debug!("{} Discarding stale crypto result", self.log_prefix);
            return;
        }

        let send = &mut guard.send;
        send.worker = None;
        let next = next_state(
            send.state,
            &SendEvent::DoCrypt,
            send.mode,
            send.inline,
        );
        let status = match (result, next) {
            (Ok(blob), Some(next)) => {
                send.result = Some(blob);
                send.successes += 1;
                send.enter(next);
                info!("{} Crypto finished", self.log_prefix);
                CompletionStatus::Done(next)
            }
            (Ok(_), None) => {
                let e = send.violation("DoCrypt");
                let e = send.fail(&self.log_prefix, e);
                CompletionStatus::Failed(e.to_string())
            }
            (Err(e), _) => {
                let status = if e.is_cancellation() {
                    CompletionStatus::Cancelled
                } else {
                    CompletionStatus::Failed(e.to_string())
                };
                send.fail(&self.log_prefix, e);
                status
            }
        };
        drop(guard);

        let _ = self.shared.completions.send(Completion {
            message: self.id,
            status,
        });
    }

    fn still_wanted(&self) -> bool {
        match self.cell.upgrade() {
            None => false,
            Some(cell) => {
                let guard = cell.state.lock().unwrap();
                !guard.destroyed
                    && guard.send.generation == self.generation
                    && !self.cancel.load(Ordering::SeqCst)
            }
        }
    }
}
