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

//! An S/MIME `CryptoBackend` on top of OpenSSL's PKCS#7 support.
//!
//! OpenSSL has no incremental PKCS#7 interface, so every filter collects its
//! input and does the real work in `finish()`.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::symm::Cipher;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::X509;

use super::backend::*;
use crate::support::error::Error;

/// The only digest OpenSSL uses by default for RSA signers.
const MICALG: &str = "sha-256";

#[derive(Clone)]
struct Identity {
    name: KeyRef,
    cert: X509,
    key: PKey<Private>,
}

#[derive(Clone, Default)]
struct Keys {
    identity: Option<Identity>,
    recipients: HashMap<KeyRef, X509>,
    trusted: Vec<X509>,
}

/// A backend holding at most one private identity plus any number of
/// recipient certificates.
///
/// Without trusted certificates, signatures are checked but the signer's
/// chain is not.
#[derive(Clone, Default)]
pub struct SmimeBackend {
    keys: Arc<Keys>,
}

impl SmimeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the identity used for signing and decryption.
    ///
    /// The identity's own certificate is also usable as a recipient under
    /// `name`.
    pub fn with_identity(
        mut self,
        name: KeyRef,
        cert: X509,
        key: PKey<Private>,
    ) -> Self {
        let keys = self.keys_mut();
        keys.recipients.insert(name.clone(), cert.clone());
        keys.identity = Some(Identity { name, cert, key });
        self
    }

    /// Load the identity from a PEM certificate and PEM private key.
    pub fn with_pem_identity(
        self,
        name: KeyRef,
        cert_pem: &[u8],
        key_pem: &[u8],
    ) -> Result<Self, Error> {
        let cert = X509::from_pem(cert_pem)?;
        let key = PKey::private_key_from_pem(key_pem)?;
        Ok(self.with_identity(name, cert, key))
    }

    pub fn with_recipient(mut self, name: KeyRef, cert: X509) -> Self {
        self.keys_mut().recipients.insert(name, cert);
        self
    }

    pub fn with_trusted(mut self, cert: X509) -> Self {
        self.keys_mut().trusted.push(cert);
        self
    }

    fn keys_mut(&mut self) -> &mut Keys {
        Arc::make_mut(&mut self.keys)
    }
}

fn openpgp_unsupported() -> Error {
    Error::CryptoBackend(
        "OpenPGP is not supported by the S/MIME backend".to_owned(),
    )
}

fn check_protocol(protocol: Protocol) -> Result<(), Error> {
    if Protocol::OpenPgp == protocol {
        Err(openpgp_unsupported())
    } else {
        Ok(())
    }
}

enum Op {
    Sign { detached: bool },
    Encrypt(Vec<X509>),
    Decrypt,
    Verify(Option<Vec<u8>>),
}

struct SmimeFilter {
    keys: Arc<Keys>,
    op: Op,
    data: Vec<u8>,
}

impl CryptoBackend for SmimeBackend {
    fn sign_start(
        &self,
        protocol: Protocol,
        signer: &KeyRef,
        style: SignStyle,
    ) -> Result<Box<dyn Filter>, Error> {
        check_protocol(protocol)?;
        self.identity(signer)?;

        let detached = match style {
            SignStyle::Detached => true,
            SignStyle::Opaque => false,
            SignStyle::Clear => {
                return Err(Error::CryptoBackend(
                    "S/MIME has no clear-signed form".to_owned(),
                ))
            }
        };

        Ok(self.filter(Op::Sign { detached }))
    }

    fn encrypt_start(
        &self,
        protocol: Protocol,
        recipients: &[KeyRef],
        signer: Option<&KeyRef>,
    ) -> Result<Box<dyn Filter>, Error> {
        check_protocol(protocol)?;
        if signer.is_some() {
            return Err(Error::CryptoBackend(
                "S/MIME signs and encrypts in separate passes".to_owned(),
            ));
        }
        if recipients.is_empty() {
            return Err(Error::CryptoBackend("No recipients".to_owned()));
        }

        let certs = recipients
            .iter()
            .map(|r| {
                self.keys.recipients.get(r).cloned().ok_or_else(|| {
                    Error::CryptoBackend(format!(
                        "No S/MIME certificate for {}",
                        r
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(self.filter(Op::Encrypt(certs)))
    }

    fn decrypt_start(
        &self,
        protocol: Protocol,
    ) -> Result<Box<dyn Filter>, Error> {
        check_protocol(protocol)?;
        if self.keys.identity.is_none() {
            return Err(Error::CryptoBackend(
                "No S/MIME identity to decrypt with".to_owned(),
            ));
        }
        Ok(self.filter(Op::Decrypt))
    }

    fn verify_start(
        &self,
        protocol: Protocol,
        detached_sig: Option<&[u8]>,
    ) -> Result<Box<dyn Filter>, Error> {
        check_protocol(protocol)?;
        Ok(self.filter(Op::Verify(detached_sig.map(<[u8]>::to_vec))))
    }
}

impl SmimeBackend {
    fn identity(&self, name: &KeyRef) -> Result<&Identity, Error> {
        self.keys
            .identity
            .as_ref()
            .filter(|i| i.name == *name)
            .ok_or_else(|| {
                Error::CryptoBackend(format!("No S/MIME key for {}", name))
            })
    }

    fn filter(&self, op: Op) -> Box<dyn Filter> {
        Box::new(SmimeFilter {
            keys: Arc::clone(&self.keys),
            op,
            data: Vec::new(),
        })
    }
}

impl Filter for SmimeFilter {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<FilterOutcome, Error> {
        let SmimeFilter { keys, op, data } = *self;

        match op {
            Op::Sign { detached } => {
                let identity =
                    keys.identity.as_ref().ok_or_else(no_identity)?;
                let mut flags = Pkcs7Flags::BINARY;
                if detached {
                    flags |= Pkcs7Flags::DETACHED;
                }
                let extra = Stack::new()?;
                let signed = Pkcs7::sign(
                    &identity.cert,
                    &identity.key,
                    &extra,
                    &data,
                    flags,
                )?;
                debug!(
                    "Signed {} bytes (detached: {})",
                    data.len(),
                    detached
                );
                Ok(FilterOutcome {
                    output: signed.to_der()?,
                    micalg: Some(MICALG.to_owned()),
                    verification: None,
                })
            }

            Op::Encrypt(certs) => {
                let mut stack = Stack::new()?;
                for cert in certs {
                    stack.push(cert)?;
                }
                let encrypted = Pkcs7::encrypt(
                    &stack,
                    &data,
                    Cipher::aes_256_cbc(),
                    Pkcs7Flags::BINARY,
                )?;
                Ok(FilterOutcome {
                    output: encrypted.to_der()?,
                    micalg: None,
                    verification: None,
                })
            }

            Op::Decrypt => {
                let identity =
                    keys.identity.as_ref().ok_or_else(no_identity)?;
                let enveloped = Pkcs7::from_der(&data)?;
                let output = enveloped
                    .decrypt(
                        &identity.key,
                        &identity.cert,
                        Pkcs7Flags::BINARY,
                    )
                    .map_err(|e| {
                        Error::CryptoBackend(format!(
                            "Decryption failed: {}",
                            e
                        ))
                    })?;
                Ok(FilterOutcome {
                    output,
                    micalg: None,
                    verification: None,
                })
            }

            Op::Verify(detached_sig) => verify(&keys, detached_sig, &data),
        }
    }
}

fn no_identity() -> Error {
    Error::CryptoBackend("No S/MIME identity".to_owned())
}

fn verify(
    keys: &Keys,
    detached_sig: Option<Vec<u8>>,
    data: &[u8],
) -> Result<FilterOutcome, Error> {
    let mut store = X509StoreBuilder::new()?;
    for cert in &keys.trusted {
        store.add_cert(cert.clone())?;
    }
    let store = store.build();
    let extra = Stack::new()?;

    let mut flags = Pkcs7Flags::BINARY;
    if keys.trusted.is_empty() {
        flags |= Pkcs7Flags::NOVERIFY;
    }

    let mut output = Vec::new();
    let result = match detached_sig {
        Some(ref sig) => Pkcs7::from_der(sig)
            .and_then(|p| p.verify(&extra, &store, Some(data), None, flags)),
        None => Pkcs7::from_der(data).and_then(|p| {
            p.verify(&extra, &store, None, Some(&mut output), flags)
        }),
    };

    let verification = match result {
        Ok(()) => Verification {
            valid: true,
            text: "Good S/MIME signature".to_owned(),
        },
        Err(e) => {
            warn!("S/MIME signature did not verify: {}", e);
            Verification {
                valid: false,
                text: format!("BAD S/MIME signature: {}", e),
            }
        }
    };

    Ok(FilterOutcome {
        output,
        micalg: None,
        verification: Some(verification),
    })
}
