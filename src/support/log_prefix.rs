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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// concerning one message.
///
/// Clones of a `LogPrefix` share the same underlying data, so a worker thread
/// holding a clone sees the protocol once the UI thread has resolved it.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    direction: &'static str,
    message: u64,
    protocol: Option<String>,
}

impl LogPrefix {
    pub fn new(direction: &'static str, message: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                direction,
                message,
                protocol: None,
            })),
        }
    }

    pub fn set_protocol(&self, protocol: impl fmt::Display) {
        self.inner.lock().unwrap().protocol =
            Some(sanitise(protocol.to_string()));
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}[{}", inner.direction, inner.message)?;
        if let Some(ref protocol) = inner.protocol {
            write!(f, " {}", protocol)?;
        }
        write!(f, "]")
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(32) {
        s.truncate(truncate_len);
    }

    s
}
