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

use openssl::symm::{Cipher, Crypter, Mode};
use rand::{rngs::OsRng, Rng};

use super::AES_BLOCK;
use crate::support::error::Error;

/// A context for reading and writing "naked" encrypted streams.
///
/// Naked encrypted streams have no associated metadata, so they are unreadable
/// without this context object. They are used for spilled buffers and for the
/// decrypted attachment cache written back to the native store, which must
/// not be readable once the process which wrote it is gone. Internally, this
/// operates with AES-128-CTR, allowing it to operate on a 1:1 basis.
///
/// Each context has a unique key and IV, and never leaves memory.
#[derive(Clone, Copy)]
pub struct SessionKey {
    key: [u8; AES_BLOCK],
    iv: [u8; AES_BLOCK],
}

impl SessionKey {
    pub fn new() -> Self {
        SessionKey {
            key: OsRng.gen(),
            iv: OsRng.gen(),
        }
    }

    /// Derive the key for the `n`th protected item written in this session.
    ///
    /// Items share the key but never a keystream.
    pub fn for_item(&self, n: u64) -> Self {
        let mut derived = *self;
        for (dst, src) in derived.iv[..8].iter_mut().zip(&n.to_be_bytes()) {
            *dst ^= src;
        }
        derived
    }

    pub fn encryptor(&self) -> Result<Crypter, Error> {
        self.crypter(Mode::Encrypt)
    }

    pub fn decryptor(&self) -> Result<Crypter, Error> {
        self.crypter(Mode::Decrypt)
    }

    fn crypter(&self, mode: Mode) -> Result<Crypter, Error> {
        let mut c = Crypter::new(
            Cipher::aes_128_ctr(),
            mode,
            &self.key,
            Some(&self.iv),
        )?;
        c.pad(false);
        Ok(c)
    }
}

impl Default for SessionKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("SessionKey(<secret>)")
    }
}

/// Run `data` through `crypter` in place of a separate output buffer.
///
/// CTR mode never changes the length, so the output always fits.
pub fn apply(crypter: &mut Crypter, data: &[u8]) -> Result<Vec<u8>, Error> {
    // Crypter::update() wants room for one extra block even in CTR mode
    let mut out = vec![0u8; data.len() + AES_BLOCK];
    let n = crypter.update(data, &mut out)?;
    out.truncate(n);
    Ok(out)
}
