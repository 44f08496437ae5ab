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

//! Reconstruction of body, attachments and signature from a MIME entity.

use std::io::{Read, Write};
use std::mem;
use std::path::PathBuf;

use log::{debug, warn};

use super::content_encoding::ContentDecoder;
use super::header::{
    decode_filename, parse_content_disposition,
    parse_content_transfer_encoding, parse_content_type, ContentDisposition,
    ContentTransferEncoding,
};
use super::model::{
    AttachKind, AttachMethod, AttachmentItem, ContentType, MimePart,
    MimeStructure,
};
use super::sink::{ProtectedSink, Sink};
use super::tokenizer::{Handler, Tokenizer};
use crate::crypt::backend::Protocol;
use crate::crypt::naked::SessionKey;
use crate::store::{AttachmentHandle, NativeStore};
use crate::support::buffer::{BufferReader, BufferWriter};
use crate::support::error::Error;

const READ_CHUNK: usize = 8192;

#[derive(Clone, Debug)]
pub struct ParseOptions {
    /// Capture the signed data and detached signature of a
    /// `multipart/signed` entity.
    pub verify: bool,
    /// If set, attachments are encrypted with keys derived from this one
    /// before they reach the store.
    pub protect: Option<SessionKey>,
    /// Where the signed-data buffer spills.
    pub tmp: PathBuf,
    pub max_line_length: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions {
            verify: false,
            protect: None,
            tmp: std::env::temp_dir(),
            max_line_length: 8192,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetachedSignature {
    pub protocol: Protocol,
    pub data: Vec<u8>,
}

/// Everything a parse produced.
pub struct ParseOutput {
    /// The plain-text body, if there was one.
    pub body: Option<String>,
    pub html: Option<String>,
    /// The attachments written to the store, in document order.
    pub attachments: Vec<(AttachmentHandle, AttachmentItem)>,
    pub structure: MimeStructure,
    /// The full content type of the top-level entity, parameters included.
    pub content_type: Option<ContentType>,
    pub signature: Option<DetachedSignature>,
    /// The exact bytes covered by `signature`.
    pub signed_data: Option<BufferReader>,
}

impl ParseOutput {
    /// The content type of the top-level entity.
    pub fn top_level_type(&self) -> Option<(&str, &str)> {
        self.structure
            .parts
            .first()
            .map(|p| (p.content_type.0.as_str(), p.content_type.1.as_str()))
    }
}

/// Parse the MIME entity read from `input`.
///
/// Attachments are created in `store` as they are encountered. If parsing
/// fails, every attachment created by this call is removed again.
pub fn parse(
    mut input: impl Read,
    store: &mut dyn NativeStore,
    options: &ParseOptions,
) -> Result<ParseOutput, Error> {
    let mut tokenizer = Tokenizer::new(
        Deserializer::new(store, options),
        options.max_line_length,
    );

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let nread = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if std::io::ErrorKind::Interrupted == e.kind() => continue,
            Err(e) => {
                tokenizer.cancel();
                return Err(e.into());
            }
        };

        tokenizer.feed(&buf[..nread])?;
    }

    tokenizer.finish()?.into_output()
}

/// Collects the text of one body alternative, possibly split over several
/// parts.
enum BodyCollector {
    Idle,
    Open { charset: String, data: Vec<u8> },
}

impl BodyCollector {
    fn into_text(self) -> Option<String> {
        match self {
            BodyCollector::Idle => None,
            BodyCollector::Open { charset, data } => {
                let encoding =
                    encoding_rs::Encoding::for_label(charset.as_bytes())
                        .unwrap_or(encoding_rs::UTF_8);
                Some(encoding.decode(&data).0.into_owned())
            }
        }
    }
}

/// Where the content of the current leaf part goes.
enum Target {
    Discard,
    Body {
        html: bool,
        decoder: ContentDecoder,
    },
    Attachment {
        handle: AttachmentHandle,
        item: AttachmentItem,
        sink: Box<dyn Sink + Send>,
        decoder: ContentDecoder,
    },
    Signature {
        protocol: Protocol,
        decoder: ContentDecoder,
        data: Vec<u8>,
    },
}

/// Progress of signed-data capture.
///
/// Only a top-level `multipart/signed` is captured, so `level` is always
/// 1, the level of its children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Hashing {
    Idle,
    /// A `multipart/signed` was entered; capture begins after its first
    /// boundary.
    Armed { level: u32 },
    /// The next raw line is the first boundary itself.
    Started { level: u32 },
    /// Lines are being captured. The line ending of the last line is held
    /// back since it belongs to the next boundary if one follows.
    Active {
        level: u32,
        pending: &'static [u8],
    },
    Done { level: u32 },
}

/// Headers of the current part which the parser cares about.
#[derive(Default)]
struct PartHeaders {
    cte: ContentTransferEncoding,
    disposition: Option<ContentDisposition>,
    content_id: Option<String>,
}

struct Deserializer<'a> {
    store: &'a mut dyn NativeStore,
    verify: bool,
    protect: Option<SessionKey>,
    tmp: PathBuf,

    headers: PartHeaders,
    target: Target,
    plain: BodyCollector,
    html: BodyCollector,
    attachments: Vec<(AttachmentHandle, AttachmentItem)>,
    /// How many attachments were created, for deriving protection keys.
    created: u64,
    structure: MimeStructure,
    top_level: Option<ContentType>,

    hashing: Hashing,
    signed: Option<BufferWriter>,
    signature: Option<DetachedSignature>,
}

impl<'a> Deserializer<'a> {
    fn new(store: &'a mut dyn NativeStore, options: &ParseOptions) -> Self {
        Deserializer {
            store,
            verify: options.verify,
            protect: options.protect,
            tmp: options.tmp.clone(),

            headers: PartHeaders::default(),
            target: Target::Discard,
            plain: BodyCollector::Idle,
            html: BodyCollector::Idle,
            attachments: Vec::new(),
            created: 0,
            structure: MimeStructure::default(),
            top_level: None,

            hashing: Hashing::Idle,
            signed: None,
            signature: None,
        }
    }

    fn into_output(mut self) -> Result<ParseOutput, Error> {
        let closed = self.close_target();
        self.or_cancel(closed)?;

        let stored =
            self.store.store_mime_info(&self.structure.to_info_string());
        self.or_cancel(stored)?;

        let signed_data = match (self.hashing, self.signed.take()) {
            (Hashing::Done { .. }, Some(signed)) => {
                let flipped = signed.flip();
                Some(self.or_cancel(flipped)?)
            }
            _ => None,
        };

        debug!(
            "Parsed {} parts, {} attachments, signature: {}",
            self.structure.len(),
            self.attachments.len(),
            self.signature.is_some()
        );

        Ok(ParseOutput {
            body: mem::replace(&mut self.plain, BodyCollector::Idle)
                .into_text(),
            html: mem::replace(&mut self.html, BodyCollector::Idle)
                .into_text(),
            attachments: mem::take(&mut self.attachments),
            structure: mem::take(&mut self.structure),
            content_type: self.top_level.take(),
            signature: self.signature.take(),
            signed_data,
        })
    }

    /// Pass `result` through, discarding everything created so far if it is
    /// an error.
    fn or_cancel<T, E: Into<Error>>(
        &mut self,
        result: Result<T, E>,
    ) -> Result<T, Error> {
        result.map_err(|e| {
            self.cancel();
            e.into()
        })
    }

    /// Finish whatever the current part was being written to.
    fn close_target(&mut self) -> Result<(), Error> {
        match mem::replace(&mut self.target, Target::Discard) {
            Target::Discard => (),
            Target::Body { html, mut decoder } => {
                let decoded = decoder.finish()?;
                let collector =
                    if html { &mut self.html } else { &mut self.plain };
                if let BodyCollector::Open { ref mut data, .. } = *collector {
                    data.extend_from_slice(decoded);
                }
            }
            Target::Attachment {
                handle,
                item,
                mut sink,
                mut decoder,
            } => {
                sink.write(decoder.finish()?)?;
                sink.finish()?;
                self.attachments.push((handle, item));
            }
            Target::Signature {
                protocol,
                mut decoder,
                mut data,
            } => {
                data.extend_from_slice(decoder.finish()?);
                self.signature = Some(DetachedSignature { protocol, data });
            }
        }
        Ok(())
    }

    fn open_attachment(
        &mut self,
        ct: &ContentType,
        filename: Option<String>,
    ) -> Result<Target, Error> {
        let item = AttachmentItem {
            position: None,
            method: AttachMethod::ByValue,
            filename,
            content_type: Some(ct.mime_type()),
            content_id: self.headers.content_id.clone(),
            kind: AttachKind::User,
            protected: self.protect.is_some(),
        };

        let (handle, sink) = self.store.create_attachment(&item)?;
        self.created += 1;
        let sink: Box<dyn Sink + Send> = match self.protect {
            Some(ref key) => Box::new(ProtectedSink::new(
                sink,
                &key.for_item(self.created),
            )?),
            None => sink,
        };

        Ok(Target::Attachment {
            handle,
            item,
            sink,
            decoder: ContentDecoder::new(self.headers.cte),
        })
    }

    /// Decide whether a text part continues the body.
    ///
    /// A body alternative that is already open with a different charset
    /// cannot take more data, so the part becomes an attachment instead.
    fn continue_body(&mut self, ct: &ContentType) -> Option<Target> {
        let html = ct.is_subtype("html");
        let charset = ct
            .parm("charset")
            .unwrap_or("us-ascii")
            .to_ascii_lowercase();

        let collector = if html { &mut self.html } else { &mut self.plain };
        match *collector {
            BodyCollector::Idle => {
                *collector = BodyCollector::Open {
                    charset,
                    data: Vec::new(),
                };
            }
            BodyCollector::Open {
                charset: ref open, ..
            } if *open == charset => (),
            BodyCollector::Open { .. } => return None,
        }

        Some(Target::Body {
            html,
            decoder: ContentDecoder::new(self.headers.cte),
        })
    }

    fn is_signature_part(&self, level: u32, ct: &ContentType) -> bool {
        self.signature.is_none()
            && ct.signature_protocol().is_some()
            && Hashing::Done { level } == self.hashing
    }
}

impl Handler for Deserializer<'_> {
    fn begin_header(&mut self, _level: u32) -> Result<(), Error> {
        self.headers = PartHeaders::default();
        Ok(())
    }

    fn header(&mut self, name: &str, value: &[u8]) -> Result<(), Error> {
        if name.eq_ignore_ascii_case("Content-Transfer-Encoding") {
            self.headers.cte = parse_content_transfer_encoding(value)
                .unwrap_or_default();
        } else if name.eq_ignore_ascii_case("Content-Disposition") {
            self.headers.disposition = parse_content_disposition(value);
        } else if name.eq_ignore_ascii_case("Content-ID") {
            let cid = String::from_utf8_lossy(value);
            let cid = cid.trim().trim_start_matches('<').trim_end_matches('>');
            if !cid.is_empty() {
                self.headers.content_id = Some(cid.to_owned());
            }
        }
        Ok(())
    }

    fn transition_to_body(
        &mut self,
        level: u32,
        ct: &ContentType,
    ) -> Result<(), Error> {
        self.close_target()?;

        let filename = self
            .headers
            .disposition
            .as_ref()
            .and_then(|d| d.parm("filename"))
            .or_else(|| ct.parm("name"))
            .map(decode_filename);

        if 0 == level && self.top_level.is_none() {
            self.top_level = Some(ct.clone());
        }

        self.structure.push(MimePart {
            level,
            content_type: (ct.typ.clone(), ct.subtype.clone()),
            charset: ct.parm("charset").map(str::to_owned),
            filename: filename.clone(),
            content_id: self.headers.content_id.clone(),
        });

        if ct.is_type("multipart") {
            let signed_protocol = ct
                .parm("protocol")
                .and_then(|p| parse_content_type(p.as_bytes()))
                .and_then(|p| p.signature_protocol());
            if self.verify
                && 0 == level
                && ct.is_subtype("signed")
                && signed_protocol.is_some()
                && Hashing::Idle == self.hashing
            {
                self.hashing = Hashing::Armed { level: level + 1 };
            }
            return Ok(());
        }

        if self.is_signature_part(level, ct) {
            if let Some(protocol) = ct.signature_protocol() {
                self.target = Target::Signature {
                    protocol,
                    decoder: ContentDecoder::new(self.headers.cte),
                    data: Vec::new(),
                };
                return Ok(());
            }
        }

        let is_attachment = self
            .headers
            .disposition
            .as_ref()
            .map_or(false, ContentDisposition::is_attachment);
        if !is_attachment
            && (ct.is("text", "plain") || ct.is("text", "html"))
        {
            if let Some(target) = self.continue_body(ct) {
                self.target = target;
                return Ok(());
            }
            warn!("Body part with a different charset stored as attachment");
        }

        self.target = self.open_attachment(ct, filename)?;
        Ok(())
    }

    fn level_down(&mut self, level: u32) -> Result<(), Error> {
        self.close_target()?;
        self.hashing = match self.hashing {
            Hashing::Active { level: l, .. } if level < l => {
                Hashing::Done { level: l }
            }
            Hashing::Armed { level: l } | Hashing::Started { level: l }
                if level < l =>
            {
                self.signed = None;
                Hashing::Idle
            }
            h => h,
        };
        Ok(())
    }

    fn boundary(&mut self, level: u32) -> Result<(), Error> {
        self.close_target()?;
        match self.hashing {
            Hashing::Armed { level: l } if l == level => {
                self.signed = Some(BufferWriter::new(self.tmp.clone()));
                self.hashing = Hashing::Started { level: l };
            }
            Hashing::Active { level: l, .. } if l == level => {
                self.hashing = Hashing::Done { level: l };
            }
            _ => (),
        }
        Ok(())
    }

    fn last_boundary(&mut self, level: u32) -> Result<(), Error> {
        self.close_target()?;
        if let Hashing::Active { level: l, .. } = self.hashing {
            if l == level {
                self.hashing = Hashing::Done { level: l };
            }
        }
        Ok(())
    }

    fn data(&mut self, data: &[u8]) -> Result<(), Error> {
        match self.target {
            Target::Discard => (),
            Target::Body {
                html,
                ref mut decoder,
            } => {
                let decoded = decoder.push(data)?;
                let collector =
                    if html { &mut self.html } else { &mut self.plain };
                if let BodyCollector::Open { ref mut data, .. } = *collector {
                    data.extend_from_slice(decoded);
                }
            }
            Target::Attachment {
                ref mut sink,
                ref mut decoder,
                ..
            } => {
                let decoded = decoder.push(data)?;
                sink.write(decoded)?;
            }
            Target::Signature {
                ref mut decoder,
                data: ref mut captured,
                ..
            } => {
                let decoded = decoder.push(data)?;
                captured.extend_from_slice(decoded);
            }
        }
        Ok(())
    }

    fn raw_line(&mut self, line: &[u8]) -> Result<(), Error> {
        match self.hashing {
            Hashing::Started { level } => {
                self.hashing = Hashing::Active {
                    level,
                    pending: b"",
                };
            }
            Hashing::Active { level, pending } => {
                let (content, ending) = if line.ends_with(b"\r\n") {
                    (&line[..line.len() - 2], &b"\r\n"[..])
                } else if line.ends_with(b"\n") {
                    (&line[..line.len() - 1], &b"\n"[..])
                } else {
                    (line, &b""[..])
                };

                if let Some(ref mut signed) = self.signed {
                    signed.write_all(pending)?;
                    signed.write_all(content)?;
                }
                self.hashing = Hashing::Active {
                    level,
                    pending: ending,
                };
            }
            _ => (),
        }
        Ok(())
    }

    fn cancel(&mut self) {
        // Dropping an unfinished sink discards its attachment
        self.target = Target::Discard;
        self.signed = None;
        for (handle, _) in mem::take(&mut self.attachments) {
            if let Err(e) = self.store.delete_attachment(handle) {
                warn!("Failed to remove attachment {}: {}", handle, e);
            }
        }
    }
}
