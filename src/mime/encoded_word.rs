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

//! RFC 2047 encoded words, as found in attachment filenames.

use std::borrow::Cow;
use std::fmt::Write as _;

use lazy_static::lazy_static;
use regex::Regex;

use super::content_encoding::{infer_encoding, Encoding};
use super::quoted_printable::qp_decode;

lazy_static! {
    static ref ENCODED_WORD: Regex =
        Regex::new(r"^=\?([!->@-~]*)\?([!->@-~]*)\?([!->@-~]*)\?=$").unwrap();
}

/// Test if `word` (in its entirety) is an RFC 2047 "encoded word".
///
/// If it is, decode it and return its decoded value.
///
/// Returns `None` if it is not an encoded word or if it could not be decoded.
/// Callers need the distinction since whitespace between two adjacent encoded
/// words is dropped, but kept everywhere else.
///
/// The 75-character limit of RFC 2047 is not enforced; several mailers
/// produce longer words for long filenames.
pub fn ew_decode(word: &str) -> Option<Cow<str>> {
    let captures = ENCODED_WORD.captures(word)?;

    let charset = captures.get(1)?.as_str();
    let transfer_encoding = captures.get(2)?.as_str();
    let mut content = Cow::Borrowed(captures.get(3)?.as_str().as_bytes());

    // `_` is a space no matter the charset
    if content.contains(&b'_') {
        for b in content.to_mut() {
            if b'_' == *b {
                *b = b' ';
            }
        }
    }

    // Once owned, stay owned, so the borrowed case only borrows `word`.
    let content = match content {
        Cow::Owned(content) => decode_xfer(transfer_encoding, &content)
            .map(Cow::into_owned)
            .map(Cow::Owned),
        Cow::Borrowed(content) => decode_xfer(transfer_encoding, content),
    }?;

    match content {
        Cow::Owned(content) => decode_charset(charset, &content)
            .map(Cow::into_owned)
            .map(Cow::Owned),
        Cow::Borrowed(content) => decode_charset(charset, content),
    }
}

fn decode_xfer<'a>(xfer: &str, content: &'a [u8]) -> Option<Cow<'a, [u8]>> {
    match xfer {
        "q" | "Q" => Some(qp_decode(content).0),
        "b" | "B" => base64::decode(content).ok().map(Cow::Owned),
        _ => None,
    }
}

fn decode_charset<'a>(
    charset: &str,
    content: &'a [u8],
) -> Option<Cow<'a, str>> {
    Some(
        encoding_rs::Encoding::for_label_no_replacement(charset.as_bytes())?
            .decode_with_bom_removal(content)
            .0,
    )
}

/// Encode `text` for use as a header parameter value, if it needs it.
///
/// Text that would pass as plain 7-bit content and contains nothing that
/// could be mistaken for quoting or an encoded word is returned unchanged.
/// Mostly-ASCII text becomes a `Q` word, anything else a `B` word, in both
/// cases with the UTF-8 charset.
pub fn ew_encode(text: &str) -> Cow<str> {
    let needs_quoting =
        text.contains('"') || text.contains('\\') || text.contains("=?");
    match infer_encoding(text.as_bytes()) {
        Encoding::Plain if !needs_quoting => Cow::Borrowed(text),
        Encoding::Base64 => Cow::Owned(format!(
            "=?utf-8?B?{}?=",
            base64::encode(text.as_bytes())
        )),
        _ => {
            let mut out = String::with_capacity(text.len() * 2 + 12);
            out.push_str("=?utf-8?Q?");
            for &b in text.as_bytes() {
                match b {
                    b' ' => out.push('_'),
                    b'0'..=b'9'
                    | b'a'..=b'z'
                    | b'A'..=b'Z'
                    | b'!'
                    | b'*'
                    | b'+'
                    | b'-'
                    | b'/'
                    | b'.' => out.push(char::from(b)),
                    _ => {
                        let _ = write!(out, "={:02X}", b);
                    }
                }
            }
            out.push_str("?=");
            Cow::Owned(out)
        }
    }
}
