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

//! Classification of opaque S/MIME payloads.
//!
//! Some agents send `smime.p7m` without the `smime-type` parameter, or even
//! as `application/octet-stream`. In those cases the only way to tell
//! signed-data from enveloped-data is to look at the content type object
//! identifier at the start of the DER-encoded `ContentInfo`.

use super::model::ContentType;

/// The body of the OID 1.2.840.113549.1.7.2 (`id-signedData`).
pub const OID_SIGNED_DATA: &[u8] =
    &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x02];
/// The body of the OID 1.2.840.113549.1.7.3 (`id-envelopedData`).
pub const OID_ENVELOPED_DATA: &[u8] =
    &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x03];

/// How much of the payload is examined.
const SNIFF_LEN: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmsKind {
    SignedData,
    EnvelopedData,
    /// Neither; the payload is left alone.
    Unknown,
}

/// Classify an S/MIME part from its `smime-type` parameter, falling back to
/// sniffing the DER.
///
/// The parameter wins when present and recognised.
pub fn classify(ct: Option<&ContentType>, der: &[u8]) -> CmsKind {
    if let Some(smime_type) = ct.and_then(|ct| ct.parm("smime-type")) {
        if smime_type.eq_ignore_ascii_case("signed-data") {
            return CmsKind::SignedData;
        } else if smime_type.eq_ignore_ascii_case("enveloped-data") {
            return CmsKind::EnvelopedData;
        }
    }

    sniff(der)
}

/// Look at the first few bytes of `der` for a `ContentInfo` sequence.
pub fn sniff(der: &[u8]) -> CmsKind {
    let der = &der[..der.len().min(SNIFF_LEN)];

    // ContentInfo ::= SEQUENCE { contentType OBJECT IDENTIFIER, ... }
    let rest = match der.split_first() {
        Some((&0x30, rest)) => rest,
        _ => return CmsKind::Unknown,
    };
    let rest = match skip_length(rest) {
        Some(rest) => rest,
        None => return CmsKind::Unknown,
    };
    let rest = match rest.split_first() {
        Some((&0x06, rest)) => rest,
        _ => return CmsKind::Unknown,
    };
    let (&oid_len, rest) = match rest.split_first() {
        Some(v) => v,
        None => return CmsKind::Unknown,
    };

    let oid = match rest.get(..usize::from(oid_len)) {
        Some(oid) => oid,
        None => return CmsKind::Unknown,
    };

    if OID_SIGNED_DATA == oid {
        CmsKind::SignedData
    } else if OID_ENVELOPED_DATA == oid {
        CmsKind::EnvelopedData
    } else {
        CmsKind::Unknown
    }
}

/// Skip a DER/BER length, including the indefinite form.
fn skip_length(data: &[u8]) -> Option<&[u8]> {
    let (&first, rest) = data.split_first()?;
    if first < 0x80 || 0x80 == first {
        Some(rest)
    } else {
        let n = usize::from(first & 0x7F);
        if n > 4 {
            None
        } else {
            rest.get(n..)
        }
    }
}
