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

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use log::warn;

use super::main::{backend, read_input, ParseSubcommand};
use crate::crypt::backend::{CryptoBackend, Protocol, StaticResolver};
use crate::engine::{Engine, Incoming, MessageId, Problem, ReceiveMode};
use crate::mime::model::AttachmentItem;
use crate::store::MemoryStore;
use crate::support::error::Error;
use crate::support::sysexits::*;
use crate::support::system_config::EngineConfig;

pub(super) fn parse(config: EngineConfig, cmd: ParseSubcommand) {
    let mode = if cmd.decrypt {
        ReceiveMode::Decrypt
    } else if cmd.verify {
        ReceiveMode::Verify
    } else {
        ReceiveMode::Display
    };

    if cmd.decrypt && cmd.common.cert.is_none() {
        die!(EX_USAGE, "--cert and --key are needed to decrypt");
    }

    let backend = backend(&cmd.common, &[], &cmd.trust);
    let input = read_input(&cmd.input);
    let (engine, id, incoming) =
        match reconstruct(config, Arc::new(backend), &input, mode) {
            Ok(r) => r,
            Err(e) => die!(Sysexit::from(&e), "Failed to parse: {}", e),
        };

    print!("{}", incoming.structure.to_info_string());
    println!();
    print!("{}", incoming.body);
    if !incoming.body.ends_with('\n') {
        println!();
    }

    if incoming.status.decrypted {
        eprintln!("Decrypted");
    }
    if let Some(ref verification) = incoming.status.verification {
        eprintln!(
            "Signature {}: {}",
            if verification.valid { "good" } else { "BAD" },
            verification.text
        );
    }

    if let Some(ref dir) = cmd.extract {
        for (ix, &(handle, ref item)) in
            incoming.attachments.iter().enumerate()
        {
            let data = match engine.read_attachment(id, handle) {
                Ok(data) => data,
                Err(e) => die!(
                    Sysexit::from(&e),
                    "Failed to read attachment {}: {}",
                    handle,
                    e
                ),
            };
            extract(dir, ix, item, &data);
        }
    }

    match incoming.status.problem {
        None => (),
        Some(Problem::Unreadable(ref why)) => die!(EX_DATAERR, "{}", why),
        Some(Problem::Crypto(ref why)) => die!(EX_UNAVAILABLE, "{}", why),
        Some(Problem::Cancelled) => die!(EX_TEMPFAIL, "Cancelled"),
        Some(Problem::UnknownCms) => {
            warn!("S/MIME payload is neither signed nor enveloped");
        }
    }
}

/// Parse `input` into a fresh in-memory message.
fn reconstruct(
    config: EngineConfig,
    backend: Arc<dyn CryptoBackend>,
    input: &[u8],
    mode: ReceiveMode,
) -> Result<(Engine, MessageId, Incoming), Error> {
    let engine = Engine::new(
        config,
        backend,
        Arc::new(StaticResolver(Protocol::Smime)),
    );
    let id = engine.open_message(Box::new(MemoryStore::new()));
    let incoming = engine.parse_incoming(id, input, mode)?;
    Ok((engine, id, incoming))
}

/// The name to extract attachment number `ix` as.
///
/// Only the last path component of the declared name is used.
fn file_name(ix: usize, item: &AttachmentItem) -> String {
    item.filename
        .as_deref()
        .and_then(|name| Path::new(name).file_name())
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("attachment-{}", ix + 1))
}

fn extract(dir: &Path, ix: usize, item: &AttachmentItem, data: &[u8]) {
    let path = dir.join(file_name(ix, item));
    let result = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .and_then(|mut f| f.write_all(data));

    match result {
        Ok(()) => eprintln!("Extracted {}", path.display()),
        Err(e) => die!(
            EX_CANTCREAT,
            "Failed to create '{}': {}",
            path.display(),
            e
        ),
    }
}
