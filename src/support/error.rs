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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error("Malformed MIME: {0}")]
    Parse(String),
    #[error("Line longer than {0} bytes")]
    EncodingOverflow(usize),
    #[error("Crypto backend failed: {0}")]
    CryptoBackend(String),
    #[error("Operation cancelled by user")]
    Cancelled,
    #[error("{operation} is not allowed in state {state}")]
    StateViolation {
        operation: &'static str,
        state: String,
    },
    #[error("Sending blocked: {0}")]
    SendBlocked(String),
    #[error("Timed out waiting for the crypto backend")]
    Timeout,
    #[error("No such message")]
    NoSuchMessage,
    #[error("Message was destroyed")]
    MessageGone,
}

impl Error {
    /// Whether this is a malformed-input error, which incoming mail handles
    /// by rendering a placeholder.
    pub fn is_parse_error(&self) -> bool {
        matches!(*self, Error::Parse(..) | Error::EncodingOverflow(..))
    }

    /// Whether the user asked for the operation to stop.
    ///
    /// Cancellation resets state like any other failure but is never shown
    /// as an error.
    pub fn is_cancellation(&self) -> bool {
        matches!(*self, Error::Cancelled)
    }
}
