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

//! Utilities for working with the handful of MIME headers the transcoder
//! needs to understand.

use std::borrow::Cow;
use std::str;

use nom::{
    branch::alt,
    bytes::complete::{is_not, take, take_while, take_while1},
    character::complete::char,
    combinator::map,
    multi::{fold_many0, many0},
    sequence::{delimited, preceded, tuple},
    IResult,
};

use super::encoded_word::ew_decode;
use super::model::ContentType;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentTransferEncoding {
    SevenBit,
    EightBit,
    Binary,
    QuotedPrintable,
    Base64,
}

impl Default for ContentTransferEncoding {
    fn default() -> Self {
        ContentTransferEncoding::SevenBit
    }
}

/// A parsed `Content-Disposition`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentDisposition {
    /// The disposition type, in lower case.
    pub disposition: String,
    pub parms: Vec<(String, String)>,
}

impl ContentDisposition {
    pub fn is_attachment(&self) -> bool {
        "attachment" == self.disposition
    }

    pub fn parm(&self, name: &str) -> Option<&str> {
        self.parms
            .iter()
            .find(|&&(ref n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, ref v)| v.as_str())
    }
}

// RFC 2045 "token": any CHAR except SPACE, CTLs, or tspecials. 8-bit bytes
// are accepted since some agents put raw UTF-8 filenames in unquoted.
fn is_token_char(ch: u8) -> bool {
    ch > b' ' && ch != 0x7F && !b"()<>@,;:\\\"/[]?=".contains(&ch)
}

// Line endings count as whitespace so that values which were not unfolded
// still parse.
fn ws(i: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while(|ch| b" \t\r\n".contains(&ch))(i)
}

fn token(i: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while1(is_token_char)(i)
}

fn quoted_pair(i: &[u8]) -> IResult<&[u8], &[u8]> {
    preceded(char('\\'), take(1usize))(i)
}

fn quoted_string(i: &[u8]) -> IResult<&[u8], Cow<[u8]>> {
    delimited(
        char('"'),
        fold_many0(
            alt((is_not("\\\""), quoted_pair)),
            Cow::Borrowed(&[] as &[u8]),
            |mut acc: Cow<[u8]>, item: &[u8]| {
                if acc.is_empty() {
                    acc = Cow::Borrowed(item);
                } else {
                    acc.to_mut().extend_from_slice(item);
                }
                acc
            },
        ),
        char('"'),
    )(i)
}

fn parm_value(i: &[u8]) -> IResult<&[u8], Cow<[u8]>> {
    alt((quoted_string, map(token, Cow::Borrowed)))(i)
}

fn parameter(i: &[u8]) -> IResult<&[u8], (&[u8], Cow<[u8]>)> {
    map(
        tuple((ws, char(';'), ws, token, ws, char('='), ws, parm_value)),
        |(_, _, _, name, _, _, _, value)| (name, value),
    )(i)
}

fn content_type_syntax(
    i: &[u8],
) -> IResult<&[u8], (&[u8], &[u8], Vec<(&[u8], Cow<[u8]>)>)> {
    map(
        tuple((ws, token, ws, char('/'), ws, token, many0(parameter))),
        |(_, typ, _, _, _, subtype, parms)| (typ, subtype, parms),
    )(i)
}

fn disposition_syntax(
    i: &[u8],
) -> IResult<&[u8], (&[u8], Vec<(&[u8], Cow<[u8]>)>)> {
    map(tuple((ws, token, many0(parameter))), |(_, disposition, parms)| {
        (disposition, parms)
    })(i)
}

/// Parse the value of a `Content-Type` header.
///
/// Anything after the last well-formed parameter is ignored.
pub fn parse_content_type(value: &[u8]) -> Option<ContentType> {
    let (_, (typ, subtype, parms)) = content_type_syntax(value).ok()?;
    Some(ContentType {
        typ: String::from_utf8_lossy(typ).to_ascii_lowercase(),
        subtype: String::from_utf8_lossy(subtype).to_ascii_lowercase(),
        parms: collect_parms(parms),
    })
}

/// Parse the value of a `Content-Disposition` header.
pub fn parse_content_disposition(value: &[u8]) -> Option<ContentDisposition> {
    let (_, (disposition, parms)) = disposition_syntax(value).ok()?;
    Some(ContentDisposition {
        disposition: String::from_utf8_lossy(disposition).to_ascii_lowercase(),
        parms: collect_parms(parms),
    })
}

/// Parse the value of a `Content-Transfer-Encoding` header.
///
/// Returns `None` for unknown encodings.
pub fn parse_content_transfer_encoding(
    value: &[u8],
) -> Option<ContentTransferEncoding> {
    use self::ContentTransferEncoding::*;

    let (_, cte) = delimited(ws, token, ws)(value).ok()?;
    let cte = str::from_utf8(cte).ok()?;
    if cte.eq_ignore_ascii_case("7bit") {
        Some(SevenBit)
    } else if cte.eq_ignore_ascii_case("8bit") {
        Some(EightBit)
    } else if cte.eq_ignore_ascii_case("binary") {
        Some(Binary)
    } else if cte.eq_ignore_ascii_case("quoted-printable") {
        Some(QuotedPrintable)
    } else if cte.eq_ignore_ascii_case("base64") {
        Some(Base64)
    } else {
        None
    }
}

/// Decode a filename taken from a parameter.
///
/// Many agents (including Outlook) put RFC 2047 encoded words into quoted
/// parameters even though RFC 2047 forbids it, so those are decoded here.
pub fn decode_filename(raw: &str) -> String {
    let mut out = String::new();
    let mut prev_ew = false;
    for (ix, word) in raw.split(' ').enumerate() {
        let decoded = ew_decode(word);
        // Whitespace between adjacent encoded words is not part of the text
        if ix > 0 && !(prev_ew && decoded.is_some()) {
            out.push(' ');
        }

        prev_ew = decoded.is_some();
        match decoded {
            Some(decoded) => out.push_str(&decoded),
            None => out.push_str(word),
        }
    }

    out
}

/// Convert raw parameters into their final form, including RFC 2231
/// extended values (`name*=utf-8''a%20b`) and continuations (`name*0=`,
/// `name*1*=`).
fn collect_parms(raw: Vec<(&[u8], Cow<[u8]>)>) -> Vec<(String, String)> {
    let mut plain: Vec<(String, String)> = Vec::new();
    let mut extended: Vec<(String, Vec<(u32, bool, Vec<u8>)>)> = Vec::new();

    for (name, value) in raw {
        let name = String::from_utf8_lossy(name).to_ascii_lowercase();
        let (base, index, encoded) = split_extended_name(&name);

        if index.is_none() && !encoded {
            plain.push((name, String::from_utf8_lossy(&value).into_owned()));
            continue;
        }

        let segment = (index.unwrap_or(0), encoded, value.into_owned());
        if let Some(entry) = extended.iter_mut().find(|e| e.0 == base) {
            entry.1.push(segment);
        } else {
            extended.push((base.to_owned(), vec![segment]));
        }
    }

    for (base, mut segments) in extended {
        segments.sort_by_key(|s| s.0);

        let mut charset: Option<String> = None;
        let mut bytes = Vec::new();
        for (ix, (_, encoded, value)) in segments.into_iter().enumerate() {
            if !encoded {
                bytes.extend_from_slice(&value);
                continue;
            }

            let mut value = &value[..];
            if 0 == ix {
                let mut split = value.splitn(3, |&b| b'\'' == b);
                if let (Some(cs), Some(_language), Some(rest)) =
                    (split.next(), split.next(), split.next())
                {
                    charset = Some(String::from_utf8_lossy(cs).into_owned());
                    value = rest;
                }
            }
            percent_decode(value, &mut bytes);
        }

        let decoded = decode_charset(charset.as_deref(), &bytes);
        // An extended value replaces any plain value of the same name
        plain.retain(|&(ref n, _)| *n != base);
        plain.push((base, decoded));
    }

    plain
}

fn split_extended_name(name: &str) -> (&str, Option<u32>, bool) {
    let (name, encoded) = match name.strip_suffix('*') {
        Some(stripped) => (stripped, true),
        None => (name, false),
    };

    if let Some(star) = name.rfind('*') {
        if let Ok(index) = name[star + 1..].parse::<u32>() {
            return (&name[..star], Some(index), encoded);
        }
    }

    (name, None, encoded)
}

fn percent_decode(src: &[u8], dst: &mut Vec<u8>) {
    let mut i = 0;
    while i < src.len() {
        if b'%' == src[i] {
            if let Some(byte) = src
                .get(i + 1..i + 3)
                .and_then(|hex| str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                dst.push(byte);
                i += 3;
                continue;
            }
        }

        dst.push(src[i]);
        i += 1;
    }
}

fn decode_charset(charset: Option<&str>, bytes: &[u8]) -> String {
    charset
        .and_then(|cs| encoding_rs::Encoding::for_label(cs.as_bytes()))
        .unwrap_or(encoding_rs::UTF_8)
        .decode_without_bom_handling(bytes)
        .0
        .into_owned()
}
