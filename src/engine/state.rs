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

//! States and events of the send-time crypto state machine.
//!
//! The machine is linear with two branches, chosen once per message before
//! the first crypto attempt:
//!
//! ```text
//! NoCryptMail -> NeedsFirstAfterWrite -> NeedsActualCrypt -+
//!   sync:  -> NeedsUpdateInMapi -> NeedsUpdateInOom --------+-> WantsSend
//!   async: -> NeedsUpdateInOom -> NeedsSecondAfterWrite     |
//!             -> NeedsUpdateInMapi -------------------------+
//! ```
//!
//! This module only knows which transitions exist. What happens on each is
//! in `machine`.

use std::fmt;

use crate::crypt::backend::CryptOperation;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SendCryptoState {
    NoCryptMail,
    NeedsFirstAfterWrite,
    NeedsActualCrypt,
    NeedsUpdateInMapi,
    NeedsUpdateInOom,
    NeedsSecondAfterWrite,
    WantsSendMime,
    WantsSendInline,
}

impl SendCryptoState {
    pub fn wants_send(self) -> bool {
        match self {
            SendCryptoState::WantsSendMime
            | SendCryptoState::WantsSendInline => true,
            _ => false,
        }
    }
}

impl fmt::Display for SendCryptoState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            SendCryptoState::NoCryptMail => "NoCryptMail",
            SendCryptoState::NeedsFirstAfterWrite => "NeedsFirstAfterWrite",
            SendCryptoState::NeedsActualCrypt => "NeedsActualCrypt",
            SendCryptoState::NeedsUpdateInMapi => "NeedsUpdateInMAPI",
            SendCryptoState::NeedsUpdateInOom => "NeedsUpdateInOOM",
            SendCryptoState::NeedsSecondAfterWrite => "NeedsSecondAfterWrite",
            SendCryptoState::WantsSendMime => "WantsSendMIME",
            SendCryptoState::WantsSendInline => "WantsSendInline",
        };
        f.write_str(s)
    }
}

/// Where the crypto pass of a message runs. Fixed once per message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecMode {
    Sync,
    Async,
}

/// An event from the host's save/send lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendEvent {
    /// The user asked for the message to be protected.
    RequestCrypto(CryptOperation),
    /// The host finished writing the message to the store.
    AfterWrite,
    /// Run (or, asynchronously, start) the crypto pass.
    DoCrypt,
    /// Replace the stored message with the crypto result.
    UpdateMapi,
    /// Apply the second-pass transforms to the compose window.
    UpdateOom,
    /// Drop everything and return to a plain message.
    Revert,
    /// The host handed the message to its send pipeline.
    Sent,
}

impl SendEvent {
    pub fn name(&self) -> &'static str {
        match *self {
            SendEvent::RequestCrypto(..) => "RequestCrypto",
            SendEvent::AfterWrite => "AfterWrite",
            SendEvent::DoCrypt => "DoCrypt",
            SendEvent::UpdateMapi => "UpdateMAPI",
            SendEvent::UpdateOom => "UpdateOOM",
            SendEvent::Revert => "Revert",
            SendEvent::Sent => "Sent",
        }
    }
}

/// What the host may do when it asks whether it can send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendDecision {
    /// Send the stored MIME container.
    Mime,
    /// Send the message with its inline-protected body.
    Inline,
    /// Nothing was requested; send the message as it is.
    Plain,
}

/// The state a successful, non-terminal step leads to.
///
/// `inline` only matters for the step into a terminal state. Returns `None`
/// for events which are not handled by a simple table lookup or are not
/// allowed in `state`.
pub fn next_state(
    state: SendCryptoState,
    event: &SendEvent,
    mode: Option<ExecMode>,
    inline: bool,
) -> Option<SendCryptoState> {
    use self::SendCryptoState::*;

    let terminal = if inline { WantsSendInline } else { WantsSendMime };

    match (state, event, mode) {
        (NoCryptMail, &SendEvent::RequestCrypto(..), _) => {
            Some(NeedsFirstAfterWrite)
        }
        (NeedsFirstAfterWrite, &SendEvent::AfterWrite, _) => {
            Some(NeedsActualCrypt)
        }
        (NeedsActualCrypt, &SendEvent::DoCrypt, Some(ExecMode::Sync)) => {
            Some(NeedsUpdateInMapi)
        }
        (NeedsActualCrypt, &SendEvent::DoCrypt, Some(ExecMode::Async)) => {
            Some(NeedsUpdateInOom)
        }
        (NeedsUpdateInMapi, &SendEvent::UpdateMapi, Some(ExecMode::Sync)) => {
            Some(NeedsUpdateInOom)
        }
        (NeedsUpdateInMapi, &SendEvent::UpdateMapi, Some(ExecMode::Async)) => {
            Some(terminal)
        }
        (NeedsUpdateInOom, &SendEvent::UpdateOom, Some(ExecMode::Sync)) => {
            Some(terminal)
        }
        (NeedsUpdateInOom, &SendEvent::UpdateOom, Some(ExecMode::Async)) => {
            Some(NeedsSecondAfterWrite)
        }
        (NeedsSecondAfterWrite, &SendEvent::AfterWrite, _) => {
            Some(NeedsUpdateInMapi)
        }
        (_, &SendEvent::Revert, _) => Some(NoCryptMail),
        (WantsSendMime, &SendEvent::Sent, _)
        | (WantsSendInline, &SendEvent::Sent, _) => Some(NoCryptMail),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::SendCryptoState::*;
    use super::*;

    fn walk(
        events: &[SendEvent],
        mode: ExecMode,
    ) -> Vec<SendCryptoState> {
        let mut state = NoCryptMail;
        let mut seen = vec![state];
        for event in events {
            state = next_state(state, event, Some(mode), false).unwrap();
            seen.push(state);
        }
        seen
    }

    fn request() -> SendEvent {
        use crate::crypt::backend::*;
        SendEvent::RequestCrypto(CryptOperation {
            mode: CryptMode::Sign,
            protocol: Protocol::OpenPgp,
            inline: false,
            recipients: vec![],
            signer: Some(KeyRef("alice".to_owned())),
        })
    }

    #[test]
    fn sync_branch() {
        assert_eq!(
            vec![
                NoCryptMail,
                NeedsFirstAfterWrite,
                NeedsActualCrypt,
                NeedsUpdateInMapi,
                NeedsUpdateInOom,
                WantsSendMime,
                NoCryptMail,
            ],
            walk(
                &[
                    request(),
                    SendEvent::AfterWrite,
                    SendEvent::DoCrypt,
                    SendEvent::UpdateMapi,
                    SendEvent::UpdateOom,
                    SendEvent::Sent,
                ],
                ExecMode::Sync
            )
        );
    }

    #[test]
    fn async_branch() {
        assert_eq!(
            vec![
                NoCryptMail,
                NeedsFirstAfterWrite,
                NeedsActualCrypt,
                NeedsUpdateInOom,
                NeedsSecondAfterWrite,
                NeedsUpdateInMapi,
                WantsSendMime,
            ],
            walk(
                &[
                    request(),
                    SendEvent::AfterWrite,
                    SendEvent::DoCrypt,
                    SendEvent::UpdateOom,
                    SendEvent::AfterWrite,
                    SendEvent::UpdateMapi,
                ],
                ExecMode::Async
            )
        );
    }

    #[test]
    fn invalid_transitions() {
        assert_eq!(
            None,
            next_state(NoCryptMail, &SendEvent::DoCrypt, None, false)
        );
        assert_eq!(
            None,
            next_state(NeedsActualCrypt, &SendEvent::DoCrypt, None, false)
        );
        assert_eq!(
            None,
            next_state(NeedsFirstAfterWrite, &request(), None, false)
        );
        assert_eq!(
            None,
            next_state(NeedsUpdateInOom, &SendEvent::Sent, None, false)
        );
        assert_eq!(
            Some(WantsSendInline),
            next_state(
                NeedsUpdateInOom,
                &SendEvent::UpdateOom,
                Some(ExecMode::Sync),
                true
            )
        );
        assert_eq!(
            Some(NoCryptMail),
            next_state(NeedsSecondAfterWrite, &SendEvent::Revert, None, false)
        );
    }
}
