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

//! The native mail store collaborator.
//!
//! The host's message store (body text, attachment table, message class) is
//! only reached through `NativeStore`.

use std::fmt;
use std::io::Read;

use crate::mime::model::AttachmentItem;
use crate::mime::sink::Sink;
use crate::support::error::Error;

pub mod memory;

pub use self::memory::MemoryStore;

/// Identifies one attachment within one store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttachmentHandle(pub u64);

impl fmt::Display for AttachmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Access to one native message.
pub trait NativeStore: Send {
    /// The plain-text body and, if the message has one, its HTML form.
    fn read_body(&self) -> Result<(String, Option<String>), Error>;

    fn subject(&self) -> Result<String, Error>;

    fn list_attachments(
        &self,
    ) -> Result<Vec<(AttachmentHandle, AttachmentItem)>, Error>;

    fn open_attachment_stream(
        &self,
        handle: AttachmentHandle,
    ) -> Result<Box<dyn Read + Send>, Error>;

    /// Create a new attachment described by `item`.
    ///
    /// The attachment only becomes part of the message once the returned
    /// sink is finished; dropping the sink unfinished discards it.
    fn create_attachment(
        &mut self,
        item: &AttachmentItem,
    ) -> Result<(AttachmentHandle, Box<dyn Sink + Send>), Error>;

    fn delete_attachment(&mut self, handle: AttachmentHandle)
        -> Result<(), Error>;

    /// Replace the body with `text`, dropping any HTML form.
    fn replace_body(&mut self, text: &str) -> Result<(), Error>;

    fn set_message_class(&mut self, class: &str) -> Result<(), Error>;

    /// Save the diagnostic "mime-info" descriptor of the last parse.
    fn store_mime_info(&mut self, info: &str) -> Result<(), Error>;

    /// Make all changes durable.
    fn commit(&mut self) -> Result<(), Error>;

    /// Whether the message is being composed as an in-line reply, which the
    /// host cannot save from a background thread.
    fn is_inline_response(&self) -> bool {
        false
    }
}
