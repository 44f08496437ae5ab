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

//! Reconstructing incoming messages, decrypting and verifying on the way.
//!
//! A received entity is parsed into the store as-is first. If the result
//! turns out to be an encrypted or opaque-signed envelope and the mode asks
//! for it, the payload is run through the backend and the plaintext is
//! parsed again in its place. Envelopes may nest, up to `MAX_DEPTH`.

use std::io::Read;
use std::sync::Mutex;

use log::{info, warn};

use crate::crypt::backend::{
    run_filter, CryptoBackend, FilterOutcome, Protocol, Verification,
};
use crate::crypt::naked::{self, SessionKey};
use crate::mime::cms::{self, CmsKind};
use crate::mime::model::{AttachmentItem, ContentType, MimeStructure};
use crate::mime::parser::{parse, DetachedSignature, ParseOptions, ParseOutput};
use crate::store::{AttachmentHandle, NativeStore};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::EngineConfig;

/// How many envelopes deep a message is unwrapped.
pub const MAX_DEPTH: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Reconstruct the message without involving the backend.
    Display,
    /// Also check signatures.
    Verify,
    /// Also decrypt.
    Decrypt,
}

/// Something which kept a message from being shown as it was sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Problem {
    /// The MIME structure could not be parsed.
    Unreadable(String),
    /// The backend failed; this is its diagnostic.
    Crypto(String),
    Cancelled,
    /// An S/MIME payload that is neither signed nor enveloped data. It is
    /// left as an ordinary attachment.
    UnknownCms,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceiveStatus {
    /// At least one envelope was decrypted.
    pub decrypted: bool,
    pub verification: Option<Verification>,
    pub problem: Option<Problem>,
}

/// A reconstructed incoming message.
#[derive(Debug)]
pub struct Incoming {
    pub body: String,
    pub html: Option<String>,
    pub attachments: Vec<(AttachmentHandle, AttachmentItem)>,
    pub structure: MimeStructure,
    pub signature: Option<DetachedSignature>,
    pub status: ReceiveStatus,
}

/// One receive pass over one message.
pub struct Receive<'a> {
    pub backend: &'a dyn CryptoBackend,
    /// Held across every backend call.
    pub crypto_lock: &'a Mutex<()>,
    pub config: &'a EngineConfig,
    pub log_prefix: &'a LogPrefix,
    /// The keys of the protected attachments written by this pass.
    pub protected: Vec<(AttachmentHandle, SessionKey)>,
}

enum Envelope {
    PgpEncrypted(AttachmentHandle),
    Cms(AttachmentHandle, Option<ContentType>),
    Signed,
    Plain,
}

impl Receive<'_> {
    /// Reconstruct the message read from `input` into `store`.
    ///
    /// Malformed input and backend failures do not fail the call; they leave
    /// a placeholder body and are reported in the status. Only store and I/O
    /// errors are returned.
    pub fn run(
        &mut self,
        store: &mut dyn NativeStore,
        input: impl Read,
        mode: ReceiveMode,
    ) -> Result<Incoming, Error> {
        let problem = match self.level(store, input, mode, 0, false) {
            Ok(incoming) => {
                store.commit()?;
                return Ok(incoming);
            }
            Err(e) if e.is_parse_error() => Problem::Unreadable(e.to_string()),
            Err(Error::Cancelled) => Problem::Cancelled,
            Err(Error::CryptoBackend(text)) => Problem::Crypto(text),
            Err(Error::Timeout) => Problem::Crypto(Error::Timeout.to_string()),
            Err(e) => return Err(e),
        };

        let body = match problem {
            Problem::Unreadable(ref why) => {
                warn!("{} Unreadable message: {}", self.log_prefix, why);
                format!("[This message could not be displayed: {}]", why)
            }
            Problem::Crypto(ref why) => {
                warn!("{} Backend failed: {}", self.log_prefix, why);
                format!("[This message could not be decrypted: {}]", why)
            }
            _ => {
                info!("{} Cancelled by user", self.log_prefix);
                "[Decryption was cancelled]".to_owned()
            }
        };

        store.replace_body(&body)?;
        store.commit()?;
        Ok(Incoming {
            body,
            html: None,
            attachments: store.list_attachments()?,
            structure: MimeStructure::default(),
            signature: None,
            status: ReceiveStatus {
                problem: Some(problem),
                ..ReceiveStatus::default()
            },
        })
    }

    fn level(
        &mut self,
        store: &mut dyn NativeStore,
        input: impl Read,
        mode: ReceiveMode,
        depth: u32,
        decrypted: bool,
    ) -> Result<Incoming, Error> {
        let protect = if decrypted && self.config.protect_attachments {
            Some(SessionKey::new())
        } else {
            None
        };
        let options = ParseOptions {
            verify: ReceiveMode::Display != mode,
            protect,
            tmp: self.config.tmp_dir(),
            max_line_length: self.config.max_line_length,
        };

        let mut output = parse(input, store, &options)?;
        if let Some(key) = protect {
            for (ix, &(handle, ref item)) in
                output.attachments.iter().enumerate()
            {
                if item.protected {
                    self.protected
                        .push((handle, key.for_item(ix as u64 + 1)));
                }
            }
        }

        if depth >= MAX_DEPTH {
            warn!(
                "{} Envelopes nested deeper than {}, not unwrapping",
                self.log_prefix, MAX_DEPTH
            );
            return self.finish(store, output);
        }

        match envelope(&output) {
            Envelope::PgpEncrypted(handle) if ReceiveMode::Decrypt == mode => {
                let payload = self.read(store, handle)?;
                let outcome = self.crypto(|backend| {
                    run_filter(
                        backend.decrypt_start(Protocol::OpenPgp)?,
                        &payload,
                    )
                })?;
                self.unwrap(store, output, outcome, mode, depth, true)
            }

            Envelope::Cms(handle, ct) if ReceiveMode::Display != mode => {
                let der = self.read(store, handle)?;
                match cms::classify(ct.as_ref(), &der) {
                    CmsKind::EnvelopedData if ReceiveMode::Decrypt == mode => {
                        let outcome = self.crypto(|backend| {
                            run_filter(
                                backend.decrypt_start(Protocol::Smime)?,
                                &der,
                            )
                        })?;
                        self.unwrap(store, output, outcome, mode, depth, true)
                    }
                    CmsKind::EnvelopedData => self.finish(store, output),
                    CmsKind::SignedData => {
                        let outcome = self.crypto(|backend| {
                            run_filter(
                                backend.verify_start(Protocol::Smime, None)?,
                                &der,
                            )
                        })?;
                        self.unwrap(
                            store, output, outcome, mode, depth, decrypted,
                        )
                    }
                    CmsKind::Unknown => {
                        info!(
                            "{} Unrecognised S/MIME payload left as is",
                            self.log_prefix
                        );
                        let mut incoming = self.finish(store, output)?;
                        incoming.status.problem = Some(Problem::UnknownCms);
                        Ok(incoming)
                    }
                }
            }

            Envelope::Signed => {
                let signature = output.signature.take();
                let signed_data = output.signed_data.take();
                let mut incoming = self.finish(store, output)?;
                if let (Some(sig), Some(signed_data)) =
                    (signature, signed_data)
                {
                    let data = signed_data.into_vec()?;
                    match self.crypto(|backend| {
                        let filter = backend
                            .verify_start(sig.protocol, Some(&sig.data))?;
                        run_filter(filter, &data)
                    }) {
                        Ok(outcome) => {
                            incoming.status.verification =
                                Some(outcome.verification.unwrap_or_else(
                                    || Verification {
                                        valid: false,
                                        text: "No verification result"
                                            .to_owned(),
                                    },
                                ));
                        }
                        // The body stays readable when only the signature
                        // check failed
                        Err(Error::CryptoBackend(text)) => {
                            incoming.status.problem =
                                Some(Problem::Crypto(text));
                        }
                        Err(Error::Cancelled) => {
                            incoming.status.problem = Some(Problem::Cancelled);
                        }
                        Err(e) => return Err(e),
                    }
                    incoming.signature = Some(sig);
                }
                Ok(incoming)
            }

            _ => self.finish(store, output),
        }
    }

    /// Replace the envelope in `output` with the plaintext in `outcome`.
    ///
    /// The envelope's attachments are only removed once the plaintext parsed.
    fn unwrap(
        &mut self,
        store: &mut dyn NativeStore,
        output: ParseOutput,
        outcome: FilterOutcome,
        mode: ReceiveMode,
        depth: u32,
        decrypted: bool,
    ) -> Result<Incoming, Error> {
        let plaintext = &outcome.output[..];
        let mut inner =
            self.level(store, plaintext, mode, depth + 1, decrypted)?;

        for &(handle, _) in &output.attachments {
            store.delete_attachment(handle)?;
            self.protected.retain(|&(h, _)| h != handle);
        }

        inner.status.decrypted |= decrypted;
        if inner.status.verification.is_none() {
            inner.status.verification = outcome.verification;
        }
        Ok(inner)
    }

    fn finish(
        &self,
        store: &mut dyn NativeStore,
        output: ParseOutput,
    ) -> Result<Incoming, Error> {
        let body = output.body.unwrap_or_default();
        store.replace_body(&body)?;
        Ok(Incoming {
            body,
            html: output.html,
            attachments: output.attachments,
            structure: output.structure,
            signature: output.signature,
            status: ReceiveStatus::default(),
        })
    }

    fn read(
        &self,
        store: &dyn NativeStore,
        handle: AttachmentHandle,
    ) -> Result<Vec<u8>, Error> {
        let key = self
            .protected
            .iter()
            .find(|&&(h, _)| h == handle)
            .map(|&(_, ref key)| key);
        read_attachment(store, handle, key)
    }

    fn crypto<T>(
        &self,
        f: impl FnOnce(&dyn CryptoBackend) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let _flight = self.crypto_lock.lock().unwrap();
        f(self.backend)
    }
}

fn envelope(output: &ParseOutput) -> Envelope {
    let ct = output.content_type.as_ref();

    if ct.map_or(false, |ct| ct.is("multipart", "encrypted")) {
        if let Some(&(handle, _)) =
            output.attachments.iter().find(|&&(_, ref item)| {
                item.content_type.as_deref()
                    == Some("application/octet-stream")
            })
        {
            return Envelope::PgpEncrypted(handle);
        }
    }

    if ct.map_or(false, |ct| ct.is("application", "pkcs7-mime")) {
        if let Some(&(handle, _)) = output.attachments.first() {
            return Envelope::Cms(handle, ct.cloned());
        }
    }

    // Some agents send the S/MIME payload as a lone attachment
    let body_empty =
        output.body.as_deref().map_or(true, |b| b.trim().is_empty());
    if let [(handle, ref item)] = output.attachments[..] {
        let named_p7m = item
            .filename
            .as_deref()
            .map_or(false, |f| f.eq_ignore_ascii_case("smime.p7m"));
        let typed_p7m = item.content_type.as_deref().map_or(false, |t| {
            t.eq_ignore_ascii_case("application/pkcs7-mime")
                || t.eq_ignore_ascii_case("application/x-pkcs7-mime")
        });
        if body_empty && (named_p7m || typed_p7m) {
            return Envelope::Cms(handle, None);
        }
    }

    if output.signature.is_some() && output.signed_data.is_some() {
        return Envelope::Signed;
    }

    Envelope::Plain
}

/// Read the content of an attachment, undoing session protection if `key` is
/// given.
pub fn read_attachment(
    store: &dyn NativeStore,
    handle: AttachmentHandle,
    key: Option<&SessionKey>,
) -> Result<Vec<u8>, Error> {
    let mut data = Vec::new();
    store.open_attachment_stream(handle)?.read_to_end(&mut data)?;
    match key {
        Some(key) => naked::apply(&mut key.decryptor()?, &data),
        None => Ok(data),
    }
}
