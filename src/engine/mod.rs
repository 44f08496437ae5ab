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

//! The engine which hosts talk to.
//!
//! An `Engine` owns every open message, keyed by `MessageId`. Outgoing
//! messages move through the send state machine in `state`/`machine`;
//! incoming messages are reconstructed by `receive`. All backend calls, from
//! any message or thread, are serialised through one crypto lock.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender};
use log::info;

use self::machine::MessageCell;
use crate::crypt::backend::{CryptoBackend, KeyResolver};
use crate::store::{AttachmentHandle, NativeStore};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::EngineConfig;

mod machine;
pub mod receive;
pub mod send;
pub mod state;

pub use self::receive::{Incoming, Problem, ReceiveMode, ReceiveStatus};
pub use self::send::{serialize_for_send, MimeBlob, SendInput};
pub use self::state::{ExecMode, SendCryptoState, SendDecision, SendEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The pass finished and the message moved to this state.
    Done(SendCryptoState),
    /// The pass failed and the message was reset.
    Failed(String),
    /// The user cancelled and the message was reset.
    Cancelled,
}

/// Posted when an asynchronous crypto pass ends.
///
/// Passes whose message was destroyed or reverted in the meantime post
/// nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub message: MessageId,
    pub status: CompletionStatus,
}

/// What messages and their workers share.
struct Shared {
    config: EngineConfig,
    backend: Arc<dyn CryptoBackend>,
    crypto_lock: Mutex<()>,
    completions: Sender<Completion>,
}

pub struct Engine {
    shared: Arc<Shared>,
    resolver: Arc<dyn KeyResolver>,
    messages: Mutex<HashMap<MessageId, Arc<MessageCell>>>,
    next_id: AtomicU64,
    completions: Receiver<Completion>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn CryptoBackend>,
        resolver: Arc<dyn KeyResolver>,
    ) -> Self {
        let (tx, rx) = crossbeam::channel::unbounded();
        Engine {
            shared: Arc::new(Shared {
                config,
                backend,
                crypto_lock: Mutex::new(()),
                completions: tx,
            }),
            resolver,
            messages: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            completions: rx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Start tracking the message in `store`.
    pub fn open_message(&self, store: Box<dyn NativeStore>) -> MessageId {
        let id = MessageId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.messages
            .lock()
            .unwrap()
            .insert(id, Arc::new(MessageCell::new(id, store)));
        id
    }

    /// Stop tracking `id`.
    ///
    /// A crypto pass in flight for the message is abandoned, and its result
    /// is discarded when it finishes.
    pub fn destroy(&self, id: MessageId) -> Result<(), Error> {
        let cell = self
            .messages
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(Error::NoSuchMessage)?;

        let mut guard = cell.state.lock().unwrap();
        guard.destroyed = true;
        guard.send.cancel_worker();
        info!("{} Destroyed", cell.log_prefix);
        Ok(())
    }

    fn cell(&self, id: MessageId) -> Result<Arc<MessageCell>, Error> {
        self.messages
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::NoSuchMessage)
    }

    /// Feed one event of the host's save/send lifecycle to message `id`.
    ///
    /// Returns the state the message is in afterwards. An event that is not
    /// valid in the current state fails with `StateViolation` and changes
    /// nothing. Any other failure resets the message to `NoCryptMail` and
    /// drops its pending operation.
    pub fn advance_state(
        &self,
        id: MessageId,
        event: SendEvent,
    ) -> Result<SendCryptoState, Error> {
        let cell = self.cell(id)?;
        machine::advance(&cell, &self.shared, &*self.resolver, event)
    }

    pub fn state(&self, id: MessageId) -> Result<SendCryptoState, Error> {
        self.with_message(id, |state| Ok(state.send.state()))
    }

    /// Every state message `id` has been in, oldest first.
    pub fn history(
        &self,
        id: MessageId,
    ) -> Result<Vec<SendCryptoState>, Error> {
        self.with_message(id, |state| Ok(state.send.history().to_vec()))
    }

    /// Whether, and how, the host may send message `id` now.
    pub fn can_send(&self, id: MessageId) -> Result<SendDecision, Error> {
        let cell = self.cell(id)?;
        let mut guard = cell.state.lock().unwrap();
        if guard.destroyed {
            return Err(Error::MessageGone);
        }
        machine::can_send(&cell, &mut *guard)
    }

    /// Where asynchronous crypto passes report back.
    pub fn completions(&self) -> &Receiver<Completion> {
        &self.completions
    }

    /// Reconstruct the MIME message read from `input` into message `id`'s
    /// store.
    pub fn parse_incoming(
        &self,
        id: MessageId,
        input: impl Read,
        mode: ReceiveMode,
    ) -> Result<Incoming, Error> {
        let log_prefix = LogPrefix::new("recv", id.0);
        self.with_message(id, |state| {
            let mut receive = receive::Receive {
                backend: &*self.shared.backend,
                crypto_lock: &self.shared.crypto_lock,
                config: &self.shared.config,
                log_prefix: &log_prefix,
                protected: Vec::new(),
            };
            let incoming = receive.run(&mut *state.store, input, mode)?;
            state.protected.extend(receive.protected);
            Ok(incoming)
        })
    }

    /// Read an attachment of message `id`, undoing session protection.
    pub fn read_attachment(
        &self,
        id: MessageId,
        handle: AttachmentHandle,
    ) -> Result<Vec<u8>, Error> {
        self.with_message(id, |state| {
            let key = state
                .protected
                .iter()
                .find(|&&(h, _)| h == handle)
                .map(|&(_, ref key)| key);
            receive::read_attachment(&*state.store, handle, key)
        })
    }

    fn with_message<T>(
        &self,
        id: MessageId,
        f: impl FnOnce(&mut machine::MessageState) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let cell = self.cell(id)?;
        let mut guard = cell.state.lock().unwrap();
        if guard.destroyed {
            return Err(Error::MessageGone);
        }
        f(&mut *guard)
    }
}
