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

use std::borrow::Cow;

/// Decodes quoted-printable encoding, as described by RFC 2045.
///
/// Soft line breaks are dropped whether they end in CRLF or a bare LF. Any
/// `=` which does not start a valid escape is kept as it is, and so is 8-bit
/// data. Decoding never fails.
///
/// Returns the decoded bytes and the unfinished escape sequence at the end
/// of `s`, if any, which the caller should prepend to the next chunk.
pub fn qp_decode(s: &[u8]) -> (Cow<[u8]>, &[u8]) {
    let mut start = match memchr::memchr(b'=', s) {
        None => return (Cow::Borrowed(s), &[]),
        Some(ix) => ix,
    };

    let mut out = Vec::with_capacity(s.len());
    out.extend_from_slice(&s[..start]);

    loop {
        let rest = &s[start + 1..];
        let consumed = match rest {
            [] | [b'\r'] => return (Cow::Owned(out), &s[start..]),
            [b'\n', ..] => 2,
            [_] => return (Cow::Owned(out), &s[start..]),
            [b'\r', b'\n', ..] => 3,
            [hi, lo, ..] => match (hex_value(*hi), hex_value(*lo)) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    3
                }
                _ => {
                    out.push(b'=');
                    1
                }
            },
        };

        let next = start + consumed;
        match memchr::memchr(b'=', &s[next..]) {
            Some(ix) => {
                out.extend_from_slice(&s[next..next + ix]);
                start = next + ix;
            }
            None => {
                out.extend_from_slice(&s[next..]);
                return (Cow::Owned(out), &[]);
            }
        }
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

/// Encodes `s` with quoted-printable encoding, as described by RFC 2045.
///
/// Line breaks in the input must be CRLF to be preserved as hard line breaks;
/// bare CR and LF bytes are escaped. Output lines never exceed 76 characters
/// including the soft break marker, never end with whitespace, and never
/// start with `.` or `From ` so that the result survives SMTP transports
/// which mangle those.
pub fn qp_encode(s: &[u8]) -> Vec<u8> {
    const MAX_CONTENT: usize = 75;

    let mut out = Vec::with_capacity(s.len() + s.len() / 8);
    let mut col = 0;
    let mut i = 0;

    while i < s.len() {
        let b = s[i];
        if s[i..].starts_with(b"\r\n") {
            out.extend_from_slice(b"\r\n");
            col = 0;
            i += 2;
            continue;
        }

        let at_line_end =
            i + 1 == s.len() || s[i + 1..].starts_with(b"\r\n");
        let mut literal = match b {
            b' ' | b'\t' => !at_line_end,
            b'=' => false,
            33..=126 => true,
            _ => false,
        };

        let len = if literal { 1 } else { 3 };
        if col + len > MAX_CONTENT {
            out.extend_from_slice(b"=\r\n");
            col = 0;
        }

        if 0 == col && (b'.' == b || s[i..].starts_with(b"From ")) {
            literal = false;
        }

        if literal {
            out.push(b);
            col += 1;
        } else {
            out.extend_from_slice(format!("={:02X}", b).as_bytes());
            col += 3;
        }
        i += 1;
    }

    out
}
