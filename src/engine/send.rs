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

//! Producing the protected form of an outgoing message and putting it back
//! into the store.

use std::io::Read;

use log::{debug, info};

use crate::crypt::backend::{
    run_filter, CryptMode, CryptOperation, CryptoBackend, KeyRef, Protocol,
    SignStyle,
};
use crate::crypt::filter::{FilterSink, SigningSink};
use crate::mime::boundary::{BoundaryGen, BoundaryPool};
use crate::mime::builder::{
    canonicalize_line_endings, serialize, OutgoingAttachment,
};
use crate::mime::content_encoding::encode_b64;
use crate::mime::model::{AttachKind, AttachMethod, AttachmentItem};
use crate::mime::sink::{MemorySink, Sink};
use crate::store::NativeStore;
use crate::support::error::Error;
use crate::support::system_config::SendConfig;

pub const CLASS_NOTE: &str = "IPM.Note";
pub const CLASS_SMIME: &str = "IPM.Note.SMIME";
pub const CLASS_MULTIPART_SIGNED: &str = "IPM.Note.SMIME.MultipartSigned";

const MIME_VERSION: &[u8] = b"MIME-Version: 1.0\r\n";
/// Room left in the `multipart/signed` header for the `micalg` value.
const MICALG_RESERVE: usize = 32;

const PGP_SIGNED_PREAMBLE: &str =
    "This is an OpenPGP/MIME signed message (RFC 4880 and 3156)";
const PGP_ENCRYPTED_PREAMBLE: &str =
    "This is an OpenPGP/MIME encrypted message (RFC 4880 and 3156)";
const SMIME_SIGNED_PREAMBLE: &str =
    "This is a cryptographically signed message in MIME format.";

/// The body and attachments of a message, as collected from the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendInput {
    pub body: String,
    pub html: Option<String>,
    pub attachments: Vec<OutgoingAttachment>,
}

impl SendInput {
    /// Read everything needed to serialise the message in `store`.
    ///
    /// Leftover containers from an earlier attempt are not user content and
    /// are skipped.
    pub fn collect(store: &dyn NativeStore) -> Result<Self, Error> {
        let (body, html) = store.read_body()?;
        let mut attachments = Vec::new();
        for (handle, item) in store.list_attachments()? {
            match item.kind {
                AttachKind::User | AttachKind::Body => (),
                AttachKind::MimeBlob | AttachKind::Synthetic => continue,
            }

            let mut data = Vec::new();
            store.open_attachment_stream(handle)?.read_to_end(&mut data)?;
            attachments.push(OutgoingAttachment::new(item, data));
        }

        Ok(SendInput {
            body,
            html,
            attachments,
        })
    }
}

/// The result of serialising a message for sending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MimeBlob {
    /// A complete MIME message which replaces the whole native message.
    Mime {
        data: Vec<u8>,
        /// The bare type of the top-level entity.
        content_type: String,
        class: &'static str,
    },
    /// Inline OpenPGP: only the body and attachments change.
    Inline {
        body: String,
        attachments: Vec<OutgoingAttachment>,
    },
}

/// Serialise `input`, protected as described by `operation`.
///
/// `operation` must already be resolved. With no operation, the output is
/// the plain MIME form of the message.
pub fn serialize_for_send(
    input: &SendInput,
    operation: Option<&CryptOperation>,
    backend: &dyn CryptoBackend,
    config: &SendConfig,
    gen: &mut dyn BoundaryGen,
) -> Result<MimeBlob, Error> {
    let mut pool = BoundaryPool::new(gen);
    let op = match operation {
        None => {
            let mut out = MemorySink::new();
            out.write(MIME_VERSION)?;
            write_entity(input, &mut out, &mut pool)?;
            return Ok(mime_blob(out, CLASS_NOTE));
        }
        Some(op) => op,
    };

    if Protocol::Auto == op.protocol {
        return Err(Error::StateViolation {
            operation: "serialize_for_send",
            state: "unresolved protocol".to_owned(),
        });
    }

    if op.inline {
        return serialize_inline(input, op, backend);
    }

    let mut out = MemorySink::new();
    out.write(MIME_VERSION)?;

    let (out, class) = match (op.protocol, op.mode) {
        (Protocol::Smime, CryptMode::Sign) if config.smime_opaque_sign => {
            let filter = backend.sign_start(
                Protocol::Smime,
                signer(op)?,
                SignStyle::Opaque,
            )?;
            let mut opaque = FilterSink::new(filter);
            write_entity(input, &mut opaque, &mut pool)?;
            opaque.finish()?;
            let outcome = opaque.into_outcome()?;
            write_pkcs7_mime(&mut out, "signed-data", &outcome.output)?;
            (out, CLASS_SMIME)
        }

        (protocol, CryptMode::Sign) => {
            let signer = signer(op)?;
            let out = write_signed(
                out, input, protocol, signer, backend, &mut pool,
            )?;
            (out, CLASS_MULTIPART_SIGNED)
        }

        (Protocol::Smime, mode) => {
            // S/MIME has no combined pass; encrypt the signed entity
            let signed = if mode.signs() {
                Some(write_signed(
                    MemorySink::new(),
                    input,
                    Protocol::Smime,
                    signer(op)?,
                    backend,
                    &mut pool,
                )?)
            } else {
                None
            };

            let filter =
                backend.encrypt_start(Protocol::Smime, &op.recipients, None)?;
            let mut encrypting = FilterSink::new(filter);
            match signed {
                Some(signed) => encrypting.write(signed.as_slice())?,
                None => write_entity(input, &mut encrypting, &mut pool)?,
            }
            encrypting.finish()?;
            let outcome = encrypting.into_outcome()?;
            write_pkcs7_mime(&mut out, "enveloped-data", &outcome.output)?;
            (out, CLASS_SMIME)
        }

        (_, mode) => {
            let signer = if mode.signs() { Some(signer(op)?) } else { None };
            let filter = backend.encrypt_start(
                Protocol::OpenPgp,
                &op.recipients,
                signer,
            )?;
            let mut encrypting = FilterSink::new(filter);
            write_entity(input, &mut encrypting, &mut pool)?;
            encrypting.finish()?;
            let outcome = encrypting.into_outcome()?;
            write_pgp_encrypted(&mut out, &outcome.output, &mut pool)?;
            (out, CLASS_SMIME)
        }
    };

    debug!(
        "Serialised {} {:?} message, {} bytes",
        op.protocol,
        op.mode,
        out.position()
    );
    Ok(mime_blob(out, class))
}

fn signer(op: &CryptOperation) -> Result<&KeyRef, Error> {
    op.signer
        .as_ref()
        .ok_or_else(|| Error::CryptoBackend("No signing key selected".into()))
}

fn write_entity(
    input: &SendInput,
    sink: &mut dyn Sink,
    gen: &mut dyn BoundaryGen,
) -> Result<(), Error> {
    serialize(
        &input.body,
        input.html.as_deref(),
        &input.attachments,
        sink,
        gen,
    )
}

fn mime_blob(out: MemorySink, class: &'static str) -> MimeBlob {
    let data = out.into_inner();
    let content_type = leading_content_type(&data);
    MimeBlob::Mime {
        data,
        content_type,
        class,
    }
}

/// Extract the bare type of the first `Content-Type` header in `data`.
fn leading_content_type(data: &[u8]) -> String {
    const PREFIX: &[u8] = b"Content-Type: ";

    data.windows(PREFIX.len())
        .position(|w| w == PREFIX)
        .map(|start| {
            let value = &data[start + PREFIX.len()..];
            let end = value
                .iter()
                .position(|&b| b';' == b || b'\r' == b)
                .unwrap_or(value.len());
            String::from_utf8_lossy(&value[..end]).trim().to_owned()
        })
        .unwrap_or_else(|| "text/plain".to_owned())
}

/// Write a `multipart/signed` entity to `out`.
///
/// The signed part is written to `out` and hashed at the same time. The hash
/// algorithm is only known once signing completes, so room for it is
/// reserved in the header and filled in afterwards.
fn write_signed(
    mut out: MemorySink,
    input: &SendInput,
    protocol: Protocol,
    signer: &KeyRef,
    backend: &dyn CryptoBackend,
    gen: &mut dyn BoundaryGen,
) -> Result<MemorySink, Error> {
    let (sig_type, preamble) = if Protocol::Smime == protocol {
        ("application/pkcs7-signature", SMIME_SIGNED_PREAMBLE)
    } else {
        ("application/pgp-signature", PGP_SIGNED_PREAMBLE)
    };

    let boundary = gen.next_boundary();
    out.write(b"Content-Type: multipart/signed; micalg=")?;
    let micalg_at = out.position();
    out.write(&[b' '; MICALG_RESERVE])?;
    out.write(
        format!(
            ";\r\n\tprotocol=\"{}\";\r\n\tboundary=\"{}\"\r\n\r\n\
             {}\r\n--{}\r\n",
            sig_type, boundary, preamble, boundary
        )
        .as_bytes(),
    )?;

    let filter = backend.sign_start(protocol, signer, SignStyle::Detached)?;
    let mut signing = SigningSink::new(out, filter);
    write_entity(input, &mut signing, gen)?;
    signing.finish()?;
    let (mut out, outcome) = signing.into_parts()?;

    let micalg = outcome.micalg.unwrap_or_else(|| {
        if Protocol::Smime == protocol {
            "sha-256".to_owned()
        } else {
            "pgp-sha256".to_owned()
        }
    });
    let mut reserved = format!("\"{}\"", micalg).into_bytes();
    if reserved.len() > MICALG_RESERVE
        || !micalg.bytes().all(|b| b.is_ascii_alphanumeric() || b'-' == b)
    {
        return Err(Error::CryptoBackend(format!(
            "Unusable micalg from backend: {:?}",
            micalg
        )));
    }
    reserved.resize(MICALG_RESERVE, b' ');
    out.overwrite_at(micalg_at, &reserved)?;

    out.write(format!("\r\n--{}\r\n", boundary).as_bytes())?;
    if Protocol::Smime == protocol {
        out.write(
            b"Content-Type: application/pkcs7-signature; \
              name=\"smime.p7s\"\r\n\
              Content-Transfer-Encoding: base64\r\n\
              Content-Disposition: attachment; filename=\"smime.p7s\"\r\n\
              \r\n",
        )?;
        out.write(&encode_b64(&outcome.output))?;
    } else {
        out.write(
            b"Content-Type: application/pgp-signature; \
              name=\"signature.asc\"\r\n\
              Content-Description: OpenPGP digital signature\r\n\
              Content-Disposition: attachment; filename=\"signature.asc\"\r\n\
              \r\n",
        )?;
        out.write(armor_text(&outcome.output).as_bytes())?;
    }
    out.write(format!("\r\n--{}--", boundary).as_bytes())?;

    Ok(out)
}

/// Normalise ASCII armour from the backend for embedding in a part.
fn armor_text(armor: &[u8]) -> String {
    let text = String::from_utf8_lossy(armor);
    canonicalize_line_endings(text.trim_end()).into_owned()
}

fn write_pgp_encrypted(
    out: &mut MemorySink,
    armored: &[u8],
    gen: &mut dyn BoundaryGen,
) -> Result<(), Error> {
    let boundary = gen.next_boundary();
    out.write(
        format!(
            "Content-Type: multipart/encrypted;\r\n\
             \tprotocol=\"application/pgp-encrypted\";\r\n\
             \tboundary=\"{b}\"\r\n\
             \r\n\
             {preamble}\r\n\
             --{b}\r\n\
             Content-Type: application/pgp-encrypted\r\n\
             Content-Description: PGP/MIME version identification\r\n\
             \r\n\
             Version: 1\r\n\
             --{b}\r\n\
             Content-Type: application/octet-stream; \
             name=\"encrypted.asc\"\r\n\
             Content-Description: OpenPGP encrypted message\r\n\
             Content-Disposition: inline; filename=\"encrypted.asc\"\r\n\
             \r\n",
            b = boundary,
            preamble = PGP_ENCRYPTED_PREAMBLE,
        )
        .as_bytes(),
    )?;
    out.write(armor_text(armored).as_bytes())?;
    out.write(format!("\r\n--{}--", boundary).as_bytes())?;
    Ok(())
}

fn write_pkcs7_mime(
    out: &mut MemorySink,
    smime_type: &str,
    der: &[u8],
) -> Result<(), Error> {
    out.write(
        format!(
            "Content-Type: application/pkcs7-mime; smime-type={};\r\n\
             \tname=\"smime.p7m\"\r\n\
             Content-Transfer-Encoding: base64\r\n\
             Content-Disposition: attachment; filename=\"smime.p7m\"\r\n\
             \r\n",
            smime_type
        )
        .as_bytes(),
    )?;
    out.write(&encode_b64(der))?;
    Ok(())
}

fn serialize_inline(
    input: &SendInput,
    op: &CryptOperation,
    backend: &dyn CryptoBackend,
) -> Result<MimeBlob, Error> {
    if Protocol::OpenPgp != op.protocol {
        return Err(Error::CryptoBackend(
            "Inline mode is only available for OpenPGP".to_owned(),
        ));
    }

    let text = canonicalize_line_endings(&input.body);
    if CryptMode::Sign == op.mode {
        let outcome = run_filter(
            backend.sign_start(
                Protocol::OpenPgp,
                signer(op)?,
                SignStyle::Clear,
            )?,
            text.as_bytes(),
        )?;
        return Ok(MimeBlob::Inline {
            body: armor_text(&outcome.output),
            attachments: input.attachments.clone(),
        });
    }

    let signer = if op.mode.signs() {
        Some(signer(op)?)
    } else {
        None
    };
    let encrypt = |data: &[u8]| -> Result<Vec<u8>, Error> {
        let filter =
            backend.encrypt_start(Protocol::OpenPgp, &op.recipients, signer)?;
        Ok(run_filter(filter, data)?.output)
    };

    let body = armor_text(&encrypt(text.as_bytes())?);
    let mut attachments = Vec::with_capacity(input.attachments.len());
    for att in &input.attachments {
        let name = att.item.filename.as_deref().unwrap_or("attachment");
        let item = AttachmentItem {
            position: att.item.position,
            method: AttachMethod::ByValue,
            filename: Some(format!("{}.pgp", name)),
            content_type: Some("application/octet-stream".to_owned()),
            content_id: None,
            kind: AttachKind::User,
            protected: false,
        };
        attachments.push(OutgoingAttachment::new(item, encrypt(&att.data)?));
    }

    Ok(MimeBlob::Inline { body, attachments })
}

/// Replace the stored message with `blob`.
///
/// Every existing attachment is deleted first, so in MIME mode exactly one
/// attachment, the container, survives.
pub fn apply_to_store(
    store: &mut dyn NativeStore,
    blob: &MimeBlob,
) -> Result<(), Error> {
    for (handle, _) in store.list_attachments()? {
        store.delete_attachment(handle)?;
    }

    match *blob {
        MimeBlob::Mime {
            ref data,
            ref content_type,
            class,
        } => {
            let item = AttachmentItem {
                position: None,
                method: AttachMethod::ByValue,
                filename: None,
                content_type: Some(content_type.clone()),
                content_id: None,
                kind: AttachKind::MimeBlob,
                protected: false,
            };
            write_attachment(store, &item, data)?;
            store.replace_body("")?;
            store.set_message_class(class)?;
        }

        MimeBlob::Inline {
            ref body,
            ref attachments,
        } => {
            store.replace_body(body)?;
            for att in attachments {
                write_attachment(store, &att.item, &att.data)?;
            }
        }
    }

    store.commit()
}

fn write_attachment(
    store: &mut dyn NativeStore,
    item: &AttachmentItem,
    data: &[u8],
) -> Result<(), Error> {
    let (_, mut sink) = store.create_attachment(item)?;
    sink.write(data)?;
    sink.finish()
}

/// Show the result in the compose window before the host saves again.
///
/// Only inline mode has anything to show; the body is updated without a
/// commit.
pub fn update_compose_view(
    store: &mut dyn NativeStore,
    blob: &MimeBlob,
) -> Result<(), Error> {
    if let MimeBlob::Inline { ref body, .. } = *blob {
        store.replace_body(body)?;
    }
    Ok(())
}

/// Check that the stored message really is the protected form of `blob`.
pub fn check_before_send(
    store: &dyn NativeStore,
    blob: &MimeBlob,
) -> Result<(), Error> {
    let (plain, html) = store.read_body()?;
    let attachments = store.list_attachments()?;

    match *blob {
        MimeBlob::Mime { .. } => {
            if !plain.trim().is_empty() || html.is_some() {
                return Err(blocked("The message body still holds plaintext"));
            }
            if 1 != attachments.len()
                || AttachKind::MimeBlob != attachments[0].1.kind
            {
                return Err(blocked("The protected MIME container is missing"));
            }
        }

        MimeBlob::Inline {
            ref body,
            attachments: ref expected,
        } => {
            if plain.trim().is_empty() {
                return Err(blocked("The message body is empty"));
            }
            if !plain.contains("-----BEGIN PGP ") || plain != *body {
                return Err(blocked(
                    "The message body is not the OpenPGP protected text",
                ));
            }
            if attachments.len() != expected.len() {
                return Err(blocked("Unprotected attachments were added"));
            }
        }
    }

    info!("Message passed the pre-send check");
    Ok(())
}

fn blocked(reason: &str) -> Error {
    Error::SendBlocked(reason.to_owned())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypt::backend::test_backend::{Failure, MockBackend};
    use crate::crypt::backend::Verification;
    use crate::mime::boundary::SequentialBoundary;
    use crate::mime::parser::{parse, ParseOptions, ParseOutput};
    use crate::store::MemoryStore;

    fn input(body: &str, attachments: &[(&str, &[u8])]) -> SendInput {
        SendInput {
            body: body.to_owned(),
            html: None,
            attachments: attachments
                .iter()
                .map(|&(name, data)| {
                    OutgoingAttachment::new(
                        AttachmentItem::user(name),
                        data.to_vec(),
                    )
                })
                .collect(),
        }
    }

    fn op(mode: CryptMode, protocol: Protocol) -> CryptOperation {
        CryptOperation {
            mode,
            protocol,
            inline: false,
            recipients: vec![KeyRef("bob".to_owned())],
            signer: Some(KeyRef("alice".to_owned())),
        }
    }

    fn build(
        input: &SendInput,
        op: Option<&CryptOperation>,
        backend: &MockBackend,
        config: &SendConfig,
    ) -> MimeBlob {
        serialize_for_send(
            input,
            op,
            backend,
            config,
            &mut SequentialBoundary::default(),
        )
        .unwrap()
    }

    fn mime_data(blob: MimeBlob) -> (Vec<u8>, String, &'static str) {
        match blob {
            MimeBlob::Mime {
                data,
                content_type,
                class,
            } => (data, content_type, class),
            MimeBlob::Inline { .. } => panic!("Unexpected inline blob"),
        }
    }

    fn reparse(data: &[u8], verify: bool) -> (MemoryStore, ParseOutput) {
        let store = MemoryStore::new();
        let mut handle = store.clone();
        let options = ParseOptions {
            verify,
            ..ParseOptions::default()
        };
        let output = parse(data, &mut handle, &options).unwrap();
        (store, output)
    }

    #[test]
    fn plain_message_round_trips() {
        let backend = MockBackend::new();
        let input = input("Hello\r\nworld", &[("a.bin", b"\0\x01\x02")]);
        let (data, content_type, class) =
            mime_data(build(&input, None, &backend, &SendConfig::default()));
        assert!(data.starts_with(b"MIME-Version: 1.0\r\n"));
        assert_eq!("multipart/mixed", content_type);
        assert_eq!(CLASS_NOTE, class);
        assert_eq!(0, backend.calls());

        let (store, output) = reparse(&data, false);
        assert_eq!(Some("Hello\r\nworld"), output.body.as_deref());
        let stored = store.attachments();
        assert_eq!(1, stored.len());
        assert_eq!(Some("a.bin"), stored[0].0.filename.as_deref());
        assert_eq!(b"\0\x01\x02" as &[u8], &stored[0].1[..]);
    }

    #[test]
    fn openpgp_sign_is_multipart_signed() {
        let backend = MockBackend::new();
        let (data, content_type, class) = mime_data(build(
            &input("Hello", &[]),
            Some(&op(CryptMode::Sign, Protocol::OpenPgp)),
            &backend,
            &SendConfig::default(),
        ));
        assert_eq!("multipart/signed", content_type);
        assert_eq!(CLASS_MULTIPART_SIGNED, class);

        let text = String::from_utf8(data.clone()).unwrap();
        assert!(text.contains("micalg=\"pgp-sha256\""));
        assert!(text.contains("protocol=\"application/pgp-signature\""));

        let (_, output) = reparse(&data, true);
        assert_eq!(Some(("multipart", "signed")), output.top_level_type());
        assert_eq!(
            vec![
                "text/plain".to_owned(),
                "application/pgp-signature".to_owned()
            ],
            output.structure.types_at(1)
        );
        assert_eq!(2, output.structure.len() - 1);

        let signature = output.signature.unwrap();
        assert_eq!(Protocol::OpenPgp, signature.protocol);
        let signed = output.signed_data.unwrap().into_vec().unwrap();
        assert!(signed.starts_with(b"Content-Type: text/plain"));
        assert!(signed.ends_with(b"\r\n\r\nHello"));

        let verified = run_filter(
            backend
                .verify_start(Protocol::OpenPgp, Some(&signature.data))
                .unwrap(),
            &signed,
        )
        .unwrap();
        assert_matches!(
            Some(Verification { valid: true, .. }),
            verified.verification
        );
    }

    #[test]
    fn openpgp_encrypt_is_multipart_encrypted() {
        let backend = MockBackend::new();
        let (data, content_type, _) = mime_data(build(
            &input("Hi", &[("report.pdf", b"%PDF-1.4 binary \xff")]),
            Some(&op(CryptMode::Encrypt, Protocol::OpenPgp)),
            &backend,
            &SendConfig::default(),
        ));
        assert_eq!("multipart/encrypted", content_type);
        assert!(!String::from_utf8_lossy(&data).contains("%PDF"));

        let (store, output) = reparse(&data, false);
        assert_eq!(
            vec![
                "application/pgp-encrypted".to_owned(),
                "application/octet-stream".to_owned()
            ],
            output.structure.types_at(1)
        );

        let stored = store.attachments();
        assert_eq!(b"Version: 1" as &[u8], &stored[0].1[..]);
        assert_eq!(Some("encrypted.asc"), stored[1].0.filename.as_deref());

        let decrypted = run_filter(
            backend.decrypt_start(Protocol::OpenPgp).unwrap(),
            &stored[1].1,
        )
        .unwrap();
        let inner = String::from_utf8(decrypted.output.clone()).unwrap();
        assert!(inner.contains(
            "Content-Type: application/pdf; name=\"report.pdf\"\r\n\
             Content-Transfer-Encoding: base64\r\n"
        ));

        let (inner_store, inner_output) =
            reparse(&decrypted.output, false);
        assert_eq!(
            Some(("multipart", "mixed")),
            inner_output.top_level_type()
        );
        assert_eq!(
            vec!["text/plain".to_owned(), "application/pdf".to_owned()],
            inner_output.structure.types_at(1)
        );
        assert_eq!(Some("Hi"), inner_output.body.as_deref());
        let inner_atts = inner_store.attachments();
        assert_eq!(Some("report.pdf"), inner_atts[0].0.filename.as_deref());
        assert_eq!(b"%PDF-1.4 binary \xff" as &[u8], &inner_atts[0].1[..]);
    }

    #[test]
    fn openpgp_sign_and_encrypt_is_one_pass() {
        let backend = MockBackend::new();
        let (data, _, _) = mime_data(build(
            &input("Hi", &[]),
            Some(&op(CryptMode::SignAndEncrypt, Protocol::OpenPgp)),
            &backend,
            &SendConfig::default(),
        ));
        assert_eq!(1, backend.calls());

        let (store, _) = reparse(&data, false);
        let decrypted = run_filter(
            backend.decrypt_start(Protocol::OpenPgp).unwrap(),
            &store.attachments()[1].1,
        )
        .unwrap();
        assert!(decrypted.verification.unwrap().valid);
    }

    #[test]
    fn smime_variants() {
        let backend = MockBackend::new();
        let (data, content_type, class) = mime_data(build(
            &input("Hi", &[]),
            Some(&op(CryptMode::Sign, Protocol::Smime)),
            &backend,
            &SendConfig::default(),
        ));
        assert_eq!("multipart/signed", content_type);
        assert_eq!(CLASS_MULTIPART_SIGNED, class);
        let text = String::from_utf8(data).unwrap();
        assert!(text.contains("micalg=\"sha-256\""));
        assert!(text.contains("filename=\"smime.p7s\""));

        let opaque = SendConfig {
            smime_opaque_sign: true,
            ..SendConfig::default()
        };
        let (data, content_type, class) = mime_data(build(
            &input("Hi", &[]),
            Some(&op(CryptMode::Sign, Protocol::Smime)),
            &backend,
            &opaque,
        ));
        assert_eq!("application/pkcs7-mime", content_type);
        assert_eq!(CLASS_SMIME, class);
        assert!(String::from_utf8(data)
            .unwrap()
            .contains("smime-type=signed-data"));

        let calls = backend.calls();
        let (data, content_type, _) = mime_data(build(
            &input("Hi", &[]),
            Some(&op(CryptMode::SignAndEncrypt, Protocol::Smime)),
            &backend,
            &SendConfig::default(),
        ));
        assert_eq!(calls + 2, backend.calls());
        assert_eq!("application/pkcs7-mime", content_type);
        let (store, _) = reparse(&data, false);
        let decrypted = run_filter(
            backend.decrypt_start(Protocol::Smime).unwrap(),
            &store.attachments()[0].1,
        )
        .unwrap();
        assert!(decrypted
            .output
            .starts_with(b"Content-Type: multipart/signed; micalg="));
    }

    #[test]
    fn inline_openpgp() {
        let backend = MockBackend::new();
        let mut operation = op(CryptMode::Encrypt, Protocol::OpenPgp);
        operation.inline = true;

        let blob = build(
            &input("secret\nbody", &[("plan.txt", b"the plan")]),
            Some(&operation),
            &backend,
            &SendConfig::default(),
        );
        let (body, attachments) = match blob {
            MimeBlob::Inline { body, attachments } => (body, attachments),
            MimeBlob::Mime { .. } => panic!("Expected inline blob"),
        };
        assert!(body.starts_with("-----BEGIN PGP MESSAGE-----"));
        assert!(!body.contains("secret"));
        assert_eq!(1, attachments.len());
        assert_eq!(
            Some("plan.txt.pgp"),
            attachments[0].item.filename.as_deref()
        );

        let decrypted = run_filter(
            backend.decrypt_start(Protocol::OpenPgp).unwrap(),
            body.as_bytes(),
        )
        .unwrap();
        assert_eq!(b"secret\r\nbody" as &[u8], &decrypted.output[..]);

        operation.mode = CryptMode::Sign;
        match build(
            &input("hello", &[]),
            Some(&operation),
            &backend,
            &SendConfig::default(),
        ) {
            MimeBlob::Inline { body, .. } => {
                assert!(body.starts_with("-----BEGIN PGP SIGNED MESSAGE-----"))
            }
            MimeBlob::Mime { .. } => panic!("Expected inline blob"),
        }

        operation.protocol = Protocol::Smime;
        assert_matches!(
            Some(Error::CryptoBackend(..)),
            serialize_for_send(
                &input("x", &[]),
                Some(&operation),
                &backend,
                &SendConfig::default(),
                &mut SequentialBoundary::default(),
            )
            .err()
        );
    }

    #[test]
    fn backend_failure_propagates() {
        let backend = MockBackend::new();
        backend.fail_next(Failure::Error("no key".to_owned()));
        let result = serialize_for_send(
            &input("x", &[]),
            Some(&op(CryptMode::Sign, Protocol::OpenPgp)),
            &backend,
            &SendConfig::default(),
            &mut SequentialBoundary::default(),
        );
        assert_matches!(Some(Error::CryptoBackend(..)), result.err());
    }

    #[test]
    fn store_update_and_check() {
        let backend = MockBackend::new();
        let store = MemoryStore::new().with_body("Hello", Some("<p>Hello"));
        store.add_attachment(AttachmentItem::user("a.txt"), b"a");
        let mut handle = store.clone();

        let input = SendInput::collect(&store).unwrap();
        assert_eq!("Hello", input.body);
        assert_eq!(1, input.attachments.len());

        let blob = build(
            &input,
            Some(&op(CryptMode::Encrypt, Protocol::OpenPgp)),
            &backend,
            &SendConfig::default(),
        );
        assert_matches!(
            Some(Error::SendBlocked(..)),
            check_before_send(&store, &blob).err()
        );

        apply_to_store(&mut handle, &blob).unwrap();
        check_before_send(&store, &blob).unwrap();
        assert_eq!(("".to_owned(), None), store.body());
        assert_eq!(Some(CLASS_SMIME.to_owned()), store.message_class());
        assert_eq!(1, store.commits());
        let stored = store.attachments();
        assert_eq!(1, stored.len());
        assert_eq!(AttachKind::MimeBlob, stored[0].0.kind);
        assert_eq!(
            Some("multipart/encrypted"),
            stored[0].0.content_type.as_deref()
        );

        // A second collection skips the container
        assert!(SendInput::collect(&store).unwrap().attachments.is_empty());

        handle.replace_body("leaked plaintext").unwrap();
        assert_matches!(
            Some(Error::SendBlocked(..)),
            check_before_send(&store, &blob).err()
        );
    }
}
