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

//! Support for "buffers", which are write-once-read-once values that spill to
//! disk (encrypted) if they exceed a maximum size.
//!
//! Signed data captured while parsing and MIME blobs produced while sending
//! go through these, so that large attachments do not have to sit in memory
//! and plaintext never reaches the disk unencrypted.

use std::fs;
use std::io::{self, Read, Seek, Write};
use std::mem;
use std::path::PathBuf;

use openssl::symm::Crypter;

use crate::crypt::naked::SessionKey;

const MAX_BUFFER: usize = 65536;

pub struct BufferWriter {
    tmp: PathBuf,
    buf: Vec<u8>,
    len: u64,
    on_disk: Option<OnDiskInfo>,
}

pub struct BufferReader {
    buf: Vec<u8>,
    off: usize,
    len: u64,
    on_disk: Option<OnDiskInfo>,
}

struct OnDiskInfo {
    key: SessionKey,
    cryptor: Crypter,
    file: fs::File,
}

impl BufferWriter {
    /// Create a new, empty buffer which spills into `tmp`.
    pub fn new(tmp: PathBuf) -> Self {
        BufferWriter {
            tmp,
            buf: Vec::new(),
            len: 0,
            on_disk: None,
        }
    }

    /// Returns the length, in bytes, of the buffer.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len
    }

    /// Whether the buffer has spilled to disk.
    pub fn is_spilled(&self) -> bool {
        self.on_disk.is_some()
    }

    /// "Flips" the buffer, making it usable for rereading.
    pub fn flip(mut self) -> io::Result<BufferReader> {
        if let Some(on_disk) = self.on_disk.as_mut() {
            on_disk.file.seek(io::SeekFrom::Start(0))?;
            on_disk.cryptor = on_disk.key.decryptor().map_err(to_ioerr)?;
        }

        Ok(BufferReader {
            buf: self.buf,
            off: 0,
            len: self.len,
            on_disk: self.on_disk,
        })
    }
}

impl Write for BufferWriter {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        if self.on_disk.is_none() && src.len() + self.buf.len() > MAX_BUFFER {
            let spill = mem::take(&mut self.buf);
            let key = SessionKey::new();
            let cryptor = key.encryptor().map_err(to_ioerr)?;
            let file = tempfile::tempfile_in(&self.tmp)?;
            self.on_disk = Some(OnDiskInfo { key, cryptor, file });
            self.len = 0;
            self.write_all(&spill)?;
        }

        if let Some(on_disk) = self.on_disk.as_mut() {
            let needed = src.len() + crate::crypt::AES_BLOCK;
            if needed > self.buf.len() {
                self.buf.resize(needed, 0);
            }
            let n = on_disk
                .cryptor
                .update(src, &mut self.buf)
                .map_err(to_ioerr)?;
            on_disk.file.write_all(&self.buf[..n])?;
        } else {
            self.buf.extend_from_slice(src);
        }

        self.len += src.len() as u64;

        Ok(src.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BufferReader {
    /// Directly create a `BufferReader` from the given data.
    pub fn new(data: Vec<u8>) -> Self {
        BufferReader {
            len: data.len() as u64,
            buf: data,
            off: 0,
            on_disk: None,
        }
    }

    /// Returns the length, in bytes, of the buffer.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len
    }

    /// Read the whole remaining buffer into memory.
    pub fn into_vec(mut self) -> io::Result<Vec<u8>> {
        if self.on_disk.is_none() && 0 == self.off {
            return Ok(self.buf);
        }

        let mut ret = Vec::with_capacity(self.len as usize);
        self.read_to_end(&mut ret)?;
        Ok(ret)
    }
}

impl Read for BufferReader {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if let Some(on_disk) = self.on_disk.as_mut() {
            let max = dst.len().min(MAX_BUFFER);
            if max + crate::crypt::AES_BLOCK > self.buf.len() {
                self.buf.resize(max + crate::crypt::AES_BLOCK, 0);
            }

            let nread = on_disk.file.read(&mut self.buf[..max])?;
            if 0 == nread {
                return Ok(0);
            }

            let mut out = vec![0u8; nread + crate::crypt::AES_BLOCK];
            let n = on_disk
                .cryptor
                .update(&self.buf[..nread], &mut out)
                .map_err(to_ioerr)?;
            dst[..n].copy_from_slice(&out[..n]);
            Ok(n)
        } else {
            let len = dst.len().min(self.buf.len() - self.off);
            dst[..len].copy_from_slice(&self.buf[self.off..self.off + len]);
            self.off += len;
            Ok(len)
        }
    }
}

fn to_ioerr(e: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_read_and_write(copy_buf: &mut [u8], expected: &[u8]) {
        let mut writer = BufferWriter::new(std::env::temp_dir());

        let mut in_reader = expected;
        loop {
            let nread = in_reader.read(copy_buf).unwrap();
            if 0 == nread {
                break;
            }

            writer.write_all(&copy_buf[..nread]).unwrap();
        }

        assert_eq!(expected.len() as u64, writer.len());
        let mut reader = writer.flip().unwrap();
        assert_eq!(expected.len() as u64, reader.len());

        let mut actual = Vec::new();
        loop {
            let nread = reader.read(copy_buf).unwrap();
            if 0 == nread {
                break;
            }

            actual.extend_from_slice(&copy_buf[..nread]);
        }

        assert_eq!(expected.len(), actual.len());
        for i in 0..expected.len() {
            assert_eq!(expected[i], actual[i], "Difference at index {}", i);
        }
    }

    #[test]
    fn small() {
        test_read_and_write(&mut [0; 4], b"hello world");
    }

    #[test]
    fn large_with_small_ops() {
        test_read_and_write(
            &mut [0; 17],
            "hello world".repeat(10000).as_bytes(),
        );
    }

    #[test]
    fn large_with_large_ops() {
        test_read_and_write(
            &mut [0; 70000],
            "hello world".repeat(10000).as_bytes(),
        );
    }

    #[test]
    fn spilled_into_vec() {
        let mut writer = BufferWriter::new(std::env::temp_dir());
        let data = "0123456789".repeat(10000);
        writer.write_all(data.as_bytes()).unwrap();
        assert!(writer.is_spilled());
        let read = writer.flip().unwrap().into_vec().unwrap();
        assert_eq!(data.as_bytes(), &read[..]);
    }
}
