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

//! The crypto backend collaborator.
//!
//! Mimeseal never implements OpenPGP or CMS itself. Instead, every signing,
//! encryption, decryption and verification pass is handed to a
//! `CryptoBackend`, which returns a streaming `Filter`. The MIME layers push
//! bytes into the filter and collect the result when it finishes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::support::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    OpenPgp,
    Smime,
    /// Let the key resolver decide.
    Auto,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Protocol::OpenPgp => f.write_str("OpenPGP"),
            Protocol::Smime => f.write_str("S/MIME"),
            Protocol::Auto => f.write_str("auto"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CryptMode {
    Sign,
    Encrypt,
    SignAndEncrypt,
}

impl CryptMode {
    pub fn signs(self) -> bool {
        CryptMode::Encrypt != self
    }

    pub fn encrypts(self) -> bool {
        CryptMode::Sign != self
    }
}

/// An opaque reference to a key, understood only by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyRef(pub String);

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request to protect one outgoing message.
///
/// An operation is consumed by exactly one attempt. Retrying requires
/// building a new one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CryptOperation {
    pub mode: CryptMode,
    pub protocol: Protocol,
    pub inline: bool,
    pub recipients: Vec<KeyRef>,
    pub signer: Option<KeyRef>,
}

/// How a signature relates to the data it signs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignStyle {
    /// Only the signature is output.
    Detached,
    /// The data is output in the clear with the signature wrapped around it
    /// (inline OpenPGP).
    Clear,
    /// The data is embedded inside the signature object (S/MIME
    /// signed-data).
    Opaque,
}

/// The result of checking a signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verification {
    pub valid: bool,
    /// Human-readable diagnostic from the backend.
    pub text: String,
}

/// What a filter produced once the input was finished.
#[derive(Clone, Debug, Default)]
pub struct FilterOutcome {
    /// The transformed data. For a detached signature, this is the signature
    /// itself.
    pub output: Vec<u8>,
    /// The hash algorithm name to declare in `multipart/signed`, if this was
    /// a signing pass.
    pub micalg: Option<String>,
    /// Set by verification, and by decryption of signed-and-encrypted data.
    pub verification: Option<Verification>,
}

/// A streaming crypto operation in progress.
///
/// Dropping a filter without finishing it abandons the operation.
pub trait Filter: Send {
    /// Feed more data into the filter. An empty slice is a no-op.
    fn write(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Signal end of input and wait for the backend to complete.
    fn finish(self: Box<Self>) -> Result<FilterOutcome, Error>;
}

pub trait CryptoBackend: Send + Sync {
    fn sign_start(
        &self,
        protocol: Protocol,
        signer: &KeyRef,
        style: SignStyle,
    ) -> Result<Box<dyn Filter>, Error>;

    /// Start encrypting to `recipients`.
    ///
    /// If `signer` is given, the backend signs and encrypts in one pass. Not
    /// every protocol supports this.
    fn encrypt_start(
        &self,
        protocol: Protocol,
        recipients: &[KeyRef],
        signer: Option<&KeyRef>,
    ) -> Result<Box<dyn Filter>, Error>;

    fn decrypt_start(&self, protocol: Protocol)
        -> Result<Box<dyn Filter>, Error>;

    /// Start verifying a signature.
    ///
    /// With `detached_sig`, the data written is the signed content and the
    /// output is empty. Without, the data written is an opaque signed object
    /// and the output is the content it embeds.
    fn verify_start(
        &self,
        protocol: Protocol,
        detached_sig: Option<&[u8]>,
    ) -> Result<Box<dyn Filter>, Error>;
}

/// The address-resolution/key-lookup collaborator.
pub trait KeyResolver: Send + Sync {
    /// Resolve `op` into a concrete operation.
    ///
    /// The result never has `Protocol::Auto`. Returns `Error::Cancelled` if
    /// the user backed out of a key selection prompt.
    fn resolve(&self, op: &CryptOperation) -> Result<CryptOperation, Error>;
}

/// A resolver which takes every key reference at face value and maps
/// `Protocol::Auto` to a fixed protocol.
#[derive(Clone, Copy, Debug)]
pub struct StaticResolver(pub Protocol);

impl KeyResolver for StaticResolver {
    fn resolve(&self, op: &CryptOperation) -> Result<CryptOperation, Error> {
        let mut op = op.clone();
        if Protocol::Auto == op.protocol {
            op.protocol = if Protocol::Auto == self.0 {
                Protocol::OpenPgp
            } else {
                self.0
            };
        }

        if op.mode.signs() && op.signer.is_none() {
            return Err(Error::CryptoBackend(
                "No signing key selected".to_owned(),
            ));
        }

        if op.mode.encrypts() && op.recipients.is_empty() {
            return Err(Error::CryptoBackend("No recipients".to_owned()));
        }

        Ok(op)
    }
}

/// Push the whole of `data` through a new filter and finish it.
pub fn run_filter(
    mut filter: Box<dyn Filter>,
    data: &[u8],
) -> Result<FilterOutcome, Error> {
    filter.write(data)?;
    filter.finish()
}

#[cfg(test)]
pub mod test_backend {
    //! A backend which does no real cryptography but behaves enough like one
    //! to exercise everything around it.
    //!
    //! "Encryption" XORs the data with a constant and wraps it in ASCII
    //! armour (or a fake CMS header for S/MIME). "Signatures" are the hex
    //! SHA-256 of the signed data. Every call is counted and the maximum
    //! number of filters alive at once is tracked.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::mime::cms::{OID_ENVELOPED_DATA, OID_SIGNED_DATA};

    const XOR: u8 = 0x5A;
    pub const PGP_MESSAGE_BEGIN: &str = "-----BEGIN PGP MESSAGE-----";
    pub const PGP_MESSAGE_END: &str = "-----END PGP MESSAGE-----";
    const PGP_SIGNATURE_BEGIN: &str = "-----BEGIN PGP SIGNATURE-----";
    const PGP_SIGNATURE_END: &str = "-----END PGP SIGNATURE-----";
    const SIGNED_BY: &[u8] = b"SIGNED-BY:";

    #[derive(Clone, Debug)]
    pub enum Failure {
        Error(String),
        Cancel,
    }

    #[derive(Default)]
    pub struct Counters {
        pub calls: AtomicUsize,
        pub active: AtomicUsize,
        pub max_active: AtomicUsize,
    }

    #[derive(Default)]
    pub struct MockBackend {
        pub counters: Arc<Counters>,
        /// How long `finish()` takes.
        pub delay: Duration,
        /// If set, the next filter to finish fails this way.
        pub fail_next: Mutex<Option<Failure>>,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(delay: Duration) -> Self {
            MockBackend {
                delay,
                ..Self::default()
            }
        }

        pub fn fail_next(&self, failure: Failure) {
            *self.fail_next.lock().unwrap() = Some(failure);
        }

        pub fn calls(&self) -> usize {
            self.counters.calls.load(Ordering::SeqCst)
        }

        pub fn max_active(&self) -> usize {
            self.counters.max_active.load(Ordering::SeqCst)
        }

        fn start(&self, kind: Kind) -> Result<Box<dyn Filter>, Error> {
            self.counters.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_active.fetch_max(now, Ordering::SeqCst);

            Ok(Box::new(MockFilter {
                counters: Arc::clone(&self.counters),
                delay: self.delay,
                failure: self.fail_next.lock().unwrap().take(),
                kind,
                data: Vec::new(),
            }))
        }
    }

    enum Kind {
        Sign(Protocol, KeyRef, SignStyle),
        Encrypt(Protocol, Option<KeyRef>),
        Decrypt(Protocol),
        Verify(Protocol, Option<Vec<u8>>),
    }

    struct MockFilter {
        counters: Arc<Counters>,
        delay: Duration,
        failure: Option<Failure>,
        kind: Kind,
        data: Vec<u8>,
    }

    impl Drop for MockFilter {
        fn drop(&mut self) {
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl Filter for MockFilter {
        fn write(&mut self, data: &[u8]) -> Result<(), Error> {
            self.data.extend_from_slice(data);
            Ok(())
        }

        fn finish(mut self: Box<Self>) -> Result<FilterOutcome, Error> {
            thread::sleep(self.delay);

            match self.failure.take() {
                Some(Failure::Error(msg)) => {
                    return Err(Error::CryptoBackend(msg))
                }
                Some(Failure::Cancel) => return Err(Error::Cancelled),
                None => (),
            }

            let data = std::mem::take(&mut self.data);
            match self.kind {
                Kind::Sign(protocol, ref signer, style) => {
                    Ok(sign(protocol, signer, style, &data))
                }
                Kind::Encrypt(protocol, ref signer) => {
                    Ok(encrypt(protocol, signer.as_ref(), &data))
                }
                Kind::Decrypt(protocol) => decrypt(protocol, &data),
                Kind::Verify(protocol, ref sig) => {
                    verify(protocol, sig.as_deref(), &data)
                }
            }
        }
    }

    impl CryptoBackend for MockBackend {
        fn sign_start(
            &self,
            protocol: Protocol,
            signer: &KeyRef,
            style: SignStyle,
        ) -> Result<Box<dyn Filter>, Error> {
            self.start(Kind::Sign(protocol, signer.clone(), style))
        }

        fn encrypt_start(
            &self,
            protocol: Protocol,
            recipients: &[KeyRef],
            signer: Option<&KeyRef>,
        ) -> Result<Box<dyn Filter>, Error> {
            assert!(!recipients.is_empty());
            self.start(Kind::Encrypt(protocol, signer.cloned()))
        }

        fn decrypt_start(
            &self,
            protocol: Protocol,
        ) -> Result<Box<dyn Filter>, Error> {
            self.start(Kind::Decrypt(protocol))
        }

        fn verify_start(
            &self,
            protocol: Protocol,
            detached_sig: Option<&[u8]>,
        ) -> Result<Box<dyn Filter>, Error> {
            let detached_sig = detached_sig.map(<[u8]>::to_vec);
            self.start(Kind::Verify(protocol, detached_sig))
        }
    }

    pub fn hash_hex(data: &[u8]) -> String {
        openssl::sha::sha256(data)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    fn cms_header(oid: &[u8]) -> Vec<u8> {
        let mut header = vec![0x30, 0x80, 0x06, oid.len() as u8];
        header.extend_from_slice(oid);
        header.extend_from_slice(&[0xA0, 0x80]);
        header
    }

    fn xor(data: &[u8]) -> Vec<u8> {
        data.iter().map(|&b| b ^ XOR).collect()
    }

    fn armor(begin: &str, end: &str, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(begin.as_bytes());
        out.extend_from_slice(b"\r\n\r\n");
        out.extend_from_slice(&crate::mime::content_encoding::encode_b64(
            data,
        ));
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(end.as_bytes());
        out
    }

    fn dearmor(data: &[u8]) -> Option<Vec<u8>> {
        let text = std::str::from_utf8(data).ok()?;
        let start = text.find(PGP_MESSAGE_BEGIN)? + PGP_MESSAGE_BEGIN.len();
        let end = text.find(PGP_MESSAGE_END)?;
        crate::mime::content_encoding::decode_b64(
            text.get(start..end)?.as_bytes(),
        )
        .ok()
    }

    fn signature(signer: &KeyRef, data: &[u8]) -> String {
        format!("{}:{}", signer, hash_hex(data))
    }

    fn sign(
        protocol: Protocol,
        signer: &KeyRef,
        style: SignStyle,
        data: &[u8],
    ) -> FilterOutcome {
        let sig = signature(signer, data);
        let (output, micalg) = match (protocol, style) {
            (Protocol::Smime, SignStyle::Opaque) => {
                let mut out = cms_header(OID_SIGNED_DATA);
                out.extend_from_slice(sig.as_bytes());
                out.push(b'\n');
                out.extend_from_slice(data);
                (out, "sha-256")
            }
            (Protocol::Smime, _) => {
                let mut out = cms_header(OID_SIGNED_DATA);
                out.extend_from_slice(sig.as_bytes());
                (out, "sha-256")
            }
            (_, SignStyle::Clear) => {
                let mut out = Vec::new();
                out.extend_from_slice(
                    b"-----BEGIN PGP SIGNED MESSAGE-----\r\nHash: SHA256\r\n\r\n",
                );
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(PGP_SIGNATURE_BEGIN.as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(sig.as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(PGP_SIGNATURE_END.as_bytes());
                (out, "pgp-sha256")
            }
            _ => (
                format!(
                    "{}\r\n\r\n{}\r\n{}",
                    PGP_SIGNATURE_BEGIN, sig, PGP_SIGNATURE_END
                )
                .into_bytes(),
                "pgp-sha256",
            ),
        };

        FilterOutcome {
            output,
            micalg: Some(micalg.to_owned()),
            verification: None,
        }
    }

    fn encrypt(
        protocol: Protocol,
        signer: Option<&KeyRef>,
        data: &[u8],
    ) -> FilterOutcome {
        let mut payload = Vec::new();
        if let Some(signer) = signer {
            payload.extend_from_slice(SIGNED_BY);
            payload.extend_from_slice(signature(signer, data).as_bytes());
            payload.push(b'\n');
        }
        payload.extend_from_slice(data);

        let output = if Protocol::Smime == protocol {
            let mut out = cms_header(OID_ENVELOPED_DATA);
            out.extend(xor(&payload));
            out
        } else {
            armor(PGP_MESSAGE_BEGIN, PGP_MESSAGE_END, &xor(&payload))
        };

        FilterOutcome {
            output,
            micalg: None,
            verification: None,
        }
    }

    fn decrypt(
        protocol: Protocol,
        data: &[u8],
    ) -> Result<FilterOutcome, Error> {
        let payload = if Protocol::Smime == protocol {
            let header = cms_header(OID_ENVELOPED_DATA);
            if !data.starts_with(&header) {
                return Err(Error::CryptoBackend(
                    "Not enveloped data".to_owned(),
                ));
            }
            xor(&data[header.len()..])
        } else {
            xor(&dearmor(data).ok_or_else(|| {
                Error::CryptoBackend("No OpenPGP message found".to_owned())
            })?)
        };

        if payload.starts_with(SIGNED_BY) {
            let nl = payload
                .iter()
                .position(|&b| b'\n' == b)
                .unwrap_or(payload.len());
            let sig = String::from_utf8_lossy(&payload[SIGNED_BY.len()..nl])
                .into_owned();
            let content = payload[(nl + 1).min(payload.len())..].to_vec();
            let verification = check(&sig, &content);
            Ok(FilterOutcome {
                output: content,
                micalg: None,
                verification: Some(verification),
            })
        } else {
            Ok(FilterOutcome {
                output: payload,
                micalg: None,
                verification: None,
            })
        }
    }

    fn check(sig: &str, data: &[u8]) -> Verification {
        let mut split = sig.splitn(2, ':');
        let signer = split.next().unwrap_or("");
        let hash = split.next().unwrap_or("");
        if hash == hash_hex(data) {
            Verification {
                valid: true,
                text: format!("Good signature from {}", signer),
            }
        } else {
            Verification {
                valid: false,
                text: format!("BAD signature from {}", signer),
            }
        }
    }

    fn verify(
        protocol: Protocol,
        sig: Option<&[u8]>,
        data: &[u8],
    ) -> Result<FilterOutcome, Error> {
        match sig {
            Some(sig) => {
                let sig = if Protocol::Smime == protocol {
                    let header = cms_header(OID_SIGNED_DATA);
                    String::from_utf8_lossy(
                        sig.get(header.len()..).unwrap_or(&[]),
                    )
                    .into_owned()
                } else {
                    String::from_utf8_lossy(sig)
                        .lines()
                        .map(str::trim)
                        .find(|l| l.contains(':'))
                        .unwrap_or("")
                        .to_owned()
                };

                Ok(FilterOutcome {
                    output: Vec::new(),
                    micalg: None,
                    verification: Some(check(&sig, data)),
                })
            }

            None => {
                let header = cms_header(OID_SIGNED_DATA);
                if !data.starts_with(&header) {
                    return Err(Error::CryptoBackend(
                        "Not signed data".to_owned(),
                    ));
                }
                let rest = &data[header.len()..];
                let nl = rest
                    .iter()
                    .position(|&b| b'\n' == b)
                    .unwrap_or(rest.len());
                let sig = String::from_utf8_lossy(&rest[..nl]).into_owned();
                let content = rest[(nl + 1).min(rest.len())..].to_vec();
                let verification = check(&sig, &content);
                Ok(FilterOutcome {
                    output: content,
                    micalg: None,
                    verification: Some(verification),
                })
            }
        }
    }

    #[test]
    fn mock_round_trips() {
        let backend = MockBackend::new();
        let signer = KeyRef("alice".to_owned());
        let recipients = vec![KeyRef("bob".to_owned())];

        let encrypted = run_filter(
            backend
                .encrypt_start(Protocol::OpenPgp, &recipients, Some(&signer))
                .unwrap(),
            b"secret",
        )
        .unwrap();
        let decrypted = run_filter(
            backend.decrypt_start(Protocol::OpenPgp).unwrap(),
            &encrypted.output,
        )
        .unwrap();
        assert_eq!(b"secret", &decrypted.output[..]);
        assert!(decrypted.verification.unwrap().valid);

        let sig = run_filter(
            backend
                .sign_start(Protocol::OpenPgp, &signer, SignStyle::Detached)
                .unwrap(),
            b"signed",
        )
        .unwrap();
        let good = run_filter(
            backend
                .verify_start(Protocol::OpenPgp, Some(&sig.output))
                .unwrap(),
            b"signed",
        )
        .unwrap();
        assert!(good.verification.unwrap().valid);
        let bad = run_filter(
            backend
                .verify_start(Protocol::OpenPgp, Some(&sig.output))
                .unwrap(),
            b"tampered",
        )
        .unwrap();
        assert!(!bad.verification.unwrap().valid);

        assert_eq!(5, backend.calls());
        assert_eq!(1, backend.max_active());
    }
}
