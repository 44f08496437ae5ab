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

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::Error;
use crate::crypt::backend::Protocol;

/// The configuration for the transcoding engine.
///
/// This is typically stored in a file named `mimeseal.toml`. Every field has
/// a default, so an empty file is a valid configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// The longest line, in bytes, the tokenizer will buffer.
    ///
    /// Longer lines are a hard parse error rather than being split, since
    /// splitting could turn binary data into something that looks like a
    /// boundary.
    pub max_line_length: usize,

    /// If true, attachments re-stored after decryption are encrypted with the
    /// per-process session key so that the cache is unreadable outside of
    /// this run.
    pub protect_attachments: bool,

    /// How long to wait for the crypto backend before giving up, in seconds.
    ///
    /// 0 means to wait forever, which matches the synchronous send contract
    /// of most hosts.
    pub crypto_timeout_secs: u64,

    /// Directory in which large buffers are spilled, encrypted.
    ///
    /// If unset, the system temporary directory is used.
    pub tmp: Option<PathBuf>,

    /// Path to a log4rs configuration file, relative to the configuration
    /// file.
    pub logging: Option<PathBuf>,

    /// Options which only affect outgoing mail.
    pub send: SendConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SendConfig {
    /// The protocol to use when an operation says "auto" and the key
    /// resolver does not decide.
    pub default_protocol: Protocol,

    /// If true, sign-only S/MIME produces opaque signed-data instead of
    /// `multipart/signed`.
    pub smime_opaque_sign: bool,

    /// If true, crypto always runs on the calling thread.
    pub force_sync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_line_length: 8192,
            protect_attachments: true,
            crypto_timeout_secs: 0,
            tmp: None,
            logging: None,
            send: SendConfig::default(),
        }
    }
}

impl Default for SendConfig {
    fn default() -> Self {
        SendConfig {
            default_protocol: Protocol::OpenPgp,
            smime_opaque_sign: false,
            force_sync: false,
        }
    }
}

impl EngineConfig {
    /// Load the configuration from the TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read(path)?;
        toml::from_slice(&data).map_err(|e| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: {}", path.display(), e),
            ))
        })
    }

    pub fn crypto_timeout(&self) -> Option<Duration> {
        if 0 == self.crypto_timeout_secs {
            None
        } else {
            Some(Duration::from_secs(self.crypto_timeout_secs))
        }
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp.clone().unwrap_or_else(std::env::temp_dir)
    }
}
