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

//! Byte sinks which MIME output is written into.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use openssl::symm::Crypter;

use crate::crypt::naked::{self, SessionKey};
use crate::support::buffer::BufferWriter;
use crate::support::error::Error;

/// A destination for bytes.
///
/// Writing an empty slice is a no-op. `finish` must be called once all data
/// has been written; data written to a sink which is dropped unfinished may
/// be discarded.
pub trait Sink {
    fn write(&mut self, data: &[u8]) -> Result<(), Error>;
    fn finish(&mut self) -> Result<(), Error>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        (**self).write(data)
    }

    fn finish(&mut self) -> Result<(), Error> {
        (**self).finish()
    }
}

/// A sink which accumulates into memory.
///
/// Unlike the other sinks, it supports rewriting already-written bytes, which
/// is how values only known once the content has passed are filled in.
#[derive(Debug, Default)]
pub struct MemorySink {
    data: Vec<u8>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of bytes written so far.
    pub fn position(&self) -> usize {
        self.data.len()
    }

    /// Overwrite bytes at `offset` with `data`.
    ///
    /// Fails if the range extends past what has been written.
    pub fn overwrite_at(
        &mut self,
        offset: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "overwrite past end of sink",
                ))
            })?;
        self.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl Sink for MemorySink {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// A sink writing to a file.
pub struct FileSink {
    out: BufWriter<fs::File>,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<Self, Error> {
        Ok(FileSink {
            out: BufWriter::new(fs::File::create(path)?),
        })
    }
}

impl Sink for FileSink {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.out.write_all(data)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        Ok(())
    }
}

impl Sink for BufferWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.write_all(data)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Encrypts everything passing through with a session key before handing it
/// to the inner sink.
pub struct ProtectedSink<S> {
    inner: S,
    crypter: Crypter,
}

impl<S: Sink> ProtectedSink<S> {
    pub fn new(inner: S, key: &SessionKey) -> Result<Self, Error> {
        Ok(ProtectedSink {
            inner,
            crypter: key.encryptor()?,
        })
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Sink> Sink for ProtectedSink<S> {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        let encrypted = naked::apply(&mut self.crypter, data)?;
        self.inner.write(&encrypted)
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.inner.finish()
    }
}
