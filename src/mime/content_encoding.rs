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

//! Choosing and applying content-transfer-encodings.

use std::borrow::Cow;
use std::mem;

use super::header::ContentTransferEncoding;
use super::model::ContentType;
use super::quoted_printable::{qp_decode, qp_encode};
use crate::support::error::Error;

/// The longest line a `Plain` encoded part may have.
const MAX_PLAIN_LINE: usize = 76;
const B64_LINE: usize = 76;

/// The encodings the builder chooses between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Plain,
    QuotedPrintable,
    Base64,
}

impl Encoding {
    /// The value for the `Content-Transfer-Encoding` header.
    pub fn header_value(self) -> &'static str {
        match self {
            Encoding::Plain => "7bit",
            Encoding::QuotedPrintable => "quoted-printable",
            Encoding::Base64 => "base64",
        }
    }

    pub fn encode(self, data: &[u8]) -> Cow<[u8]> {
        match self {
            Encoding::Plain => Cow::Borrowed(data),
            Encoding::QuotedPrintable => Cow::Owned(qp_encode(data)),
            Encoding::Base64 => Cow::Owned(encode_b64(data)),
        }
    }

    pub fn decode(self, data: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            Encoding::Plain => Ok(data.to_vec()),
            Encoding::QuotedPrintable => Ok(qp_decode(data).0.into_owned()),
            Encoding::Base64 => decode_b64(data),
        }
    }

    /// Choose the encoding for a part of the given type.
    ///
    /// Text is sniffed; everything else is always base64, which matches what
    /// mail clients expect for files.
    pub fn for_part(ct: &ContentType, data: &[u8]) -> Self {
        if ct.is_type("text") {
            infer_encoding(data)
        } else {
            Encoding::Base64
        }
    }
}

/// Decide which encoding `data` needs to survive transport unchanged.
///
/// `Plain` is only chosen when every line is CRLF-terminated, at most 76
/// bytes, 7-bit, free of control characters, and none of the lines would be
/// misinterpreted by a transport or MIME parser (a lone `.`, a leading
/// `From `, a leading `--` which could be taken for a boundary or a
/// signature delimiter, or trailing whitespace which signing canonicalises
/// away). Otherwise, `Base64` is used if more than a fifth of the bytes are
/// not printable, and `QuotedPrintable` if not.
pub fn infer_encoding(data: &[u8]) -> Encoding {
    let mut nonprintable = 0usize;
    let mut unsafe_bytes = false;
    let mut max_line = 0usize;
    let mut hazard = false;

    let mut check_line = |line: &[u8]| {
        max_line = max_line.max(line.len());
        hazard |= b"." == line
            || line.starts_with(b"From ")
            || line.starts_with(b"--")
            || line.ends_with(b" ")
            || line.ends_with(b"\t");
    };

    let mut line_start = 0;
    for (ix, &b) in data.iter().enumerate() {
        match b {
            b'\n' => {
                if 0 == ix || b'\r' != data[ix - 1] {
                    unsafe_bytes = true;
                    check_line(&data[line_start..ix]);
                } else {
                    check_line(&data[line_start..ix - 1]);
                }
                line_start = ix + 1;
            }
            b'\r' => {
                if Some(&b'\n') != data.get(ix + 1) {
                    unsafe_bytes = true;
                }
            }
            b'\t' => (),
            0..=31 | 127..=255 => {
                unsafe_bytes = true;
                nonprintable += 1;
            }
            _ => (),
        }
    }
    check_line(&data[line_start..]);

    if !unsafe_bytes && !hazard && max_line <= MAX_PLAIN_LINE {
        Encoding::Plain
    } else if nonprintable * 5 > data.len() {
        Encoding::Base64
    } else {
        Encoding::QuotedPrintable
    }
}

// (suffix, type, subtype)
static SUFFIXES: &[(&str, &str, &str)] = &[
    ("asc", "application", "pgp-signature"),
    ("bmp", "image", "bmp"),
    ("csv", "text", "csv"),
    ("doc", "application", "msword"),
    (
        "docx",
        "application",
        "vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    ("eml", "message", "rfc822"),
    ("gif", "image", "gif"),
    ("gz", "application", "gzip"),
    ("htm", "text", "html"),
    ("html", "text", "html"),
    ("ics", "text", "calendar"),
    ("jpeg", "image", "jpeg"),
    ("jpg", "image", "jpeg"),
    ("json", "application", "json"),
    ("mp3", "audio", "mpeg"),
    ("mp4", "video", "mp4"),
    ("odp", "application", "vnd.oasis.opendocument.presentation"),
    ("ods", "application", "vnd.oasis.opendocument.spreadsheet"),
    ("odt", "application", "vnd.oasis.opendocument.text"),
    ("p7m", "application", "pkcs7-mime"),
    ("p7s", "application", "pkcs7-signature"),
    ("pdf", "application", "pdf"),
    ("pgp", "application", "pgp-encrypted"),
    ("png", "image", "png"),
    ("ppt", "application", "vnd.ms-powerpoint"),
    (
        "pptx",
        "application",
        "vnd.openxmlformats-officedocument.presentationml.presentation",
    ),
    ("rtf", "application", "rtf"),
    ("sig", "application", "pgp-signature"),
    ("svg", "image", "svg+xml"),
    ("tar", "application", "x-tar"),
    ("tif", "image", "tiff"),
    ("tiff", "image", "tiff"),
    ("txt", "text", "plain"),
    ("vcf", "text", "vcard"),
    ("wav", "audio", "wav"),
    ("xls", "application", "vnd.ms-excel"),
    (
        "xlsx",
        "application",
        "vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ),
    ("xml", "application", "xml"),
    ("zip", "application", "zip"),
];

const SNIFF_LEN: usize = 512;

/// Decide the content type of a part.
///
/// A known filename suffix is authoritative. Without one, the content is
/// sniffed for an HTML opening tag; otherwise body parts are `text/plain`
/// and anything else `application/octet-stream`.
pub fn infer_content_type(
    filename: Option<&str>,
    body: &[u8],
    is_body: bool,
) -> ContentType {
    if let Some(suffix) = filename
        .and_then(|f| f.rsplit_once('.'))
        .map(|(_, suffix)| suffix.to_ascii_lowercase())
    {
        if let Some(&(_, typ, subtype)) =
            SUFFIXES.iter().find(|&&(s, _, _)| s == suffix)
        {
            return ContentType::new(typ, subtype);
        }
    }

    let head = &body[..body.len().min(SNIFF_LEN)];
    let start = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(head.len());
    let head = head[start..].to_ascii_lowercase();
    if head.starts_with(b"<html") || head.starts_with(b"<!doctype html") {
        ContentType::new("text", "html")
    } else if is_body {
        ContentType::new("text", "plain")
    } else {
        ContentType::new("application", "octet-stream")
    }
}

/// Base64-encode `data` into CRLF-separated lines of 76 characters.
///
/// There is no line ending after the final line.
pub fn encode_b64(data: &[u8]) -> Vec<u8> {
    let encoded = base64::encode_config(data, base64::STANDARD);
    let mut out = Vec::with_capacity(encoded.len() + encoded.len() / 38);
    for (ix, line) in encoded.as_bytes().chunks(B64_LINE).enumerate() {
        if ix > 0 {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(line);
    }
    out
}

/// Decode base64 data, ignoring line breaks and other characters outside
/// the alphabet.
pub fn decode_b64(data: &[u8]) -> Result<Vec<u8>, Error> {
    let filtered: Vec<u8> =
        data.iter().copied().filter(|&b| is_b64(b)).collect();
    base64::decode_config(&filtered, base64::STANDARD).map_err(bad_base64)
}

fn bad_base64(e: base64::DecodeError) -> Error {
    Error::Parse(format!("Bad base64: {}", e))
}

fn is_b64(b: u8) -> bool {
    match b {
        b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'+' | b'/' | b'=' => true,
        _ => false,
    }
}

/// Streaming decoder for transfer-encoded content fed in arbitrary pieces.
#[derive(Debug)]
pub struct ContentDecoder {
    content_transfer_encoding: ContentTransferEncoding,
    input_buffer: Vec<u8>,
    cte_buffer: Vec<u8>,
}

impl ContentDecoder {
    pub fn new(content_transfer_encoding: ContentTransferEncoding) -> Self {
        ContentDecoder {
            content_transfer_encoding,
            input_buffer: Vec::new(),
            cte_buffer: Vec::new(),
        }
    }

    /// Decode the next piece of content.
    ///
    /// Incomplete base64 quanta and QP escapes are held until the next call.
    pub fn push<'a, 'b: 'a>(
        &'b mut self,
        data: &'a [u8],
    ) -> Result<&'a [u8], Error> {
        use super::header::ContentTransferEncoding as CTE;

        match self.content_transfer_encoding {
            CTE::SevenBit | CTE::EightBit | CTE::Binary => Ok(data),
            CTE::Base64 => {
                self.decode_base64(data)?;
                Ok(&self.cte_buffer)
            }
            CTE::QuotedPrintable => {
                self.decode_qp(data);
                Ok(&self.cte_buffer)
            }
        }
    }

    /// Decode whatever is still held back at the end of the content.
    ///
    /// A base64 tail missing its padding is decoded as if it were padded. A
    /// single leftover base64 character cannot encode anything and is an
    /// error. An unfinished QP escape is passed through as it is.
    pub fn finish(&mut self) -> Result<&[u8], Error> {
        use super::header::ContentTransferEncoding as CTE;

        self.cte_buffer.clear();
        let tail = mem::take(&mut self.input_buffer);
        match self.content_transfer_encoding {
            CTE::SevenBit | CTE::EightBit | CTE::Binary => (),
            CTE::QuotedPrintable => self.cte_buffer = tail,
            CTE::Base64 if tail.is_empty() => (),
            CTE::Base64 if 1 == tail.len() % 4 => {
                return Err(Error::Parse(
                    "Truncated base64 content".to_owned(),
                ));
            }
            CTE::Base64 => {
                let mut padded = tail;
                while 0 != padded.len() % 4 {
                    padded.push(b'=');
                }
                base64::decode_config_buf(
                    &padded,
                    base64::STANDARD,
                    &mut self.cte_buffer,
                )
                .map_err(bad_base64)?;
            }
        }

        Ok(&self.cte_buffer)
    }

    fn decode_base64(&mut self, data: &[u8]) -> Result<(), Error> {
        self.cte_buffer.clear();

        let mut pushed_any = false;
        for &byte in data {
            if is_b64(byte) {
                self.input_buffer.push(byte);
                pushed_any = true;
            }
        }

        if pushed_any {
            let usable_length = self.input_buffer.len() / 4 * 4;
            base64::decode_config_buf(
                &self.input_buffer[..usable_length],
                base64::STANDARD,
                &mut self.cte_buffer,
            )
            .map_err(bad_base64)?;

            self.input_buffer.copy_within(usable_length.., 0);
            self.input_buffer
                .truncate(self.input_buffer.len() - usable_length);
        }

        Ok(())
    }

    fn decode_qp(&mut self, data: &[u8]) {
        self.cte_buffer.clear();

        if self.input_buffer.is_empty() {
            let (decoded, dangling) = qp_decode(data);
            self.input_buffer.extend_from_slice(dangling);

            match decoded {
                Cow::Owned(v) => self.cte_buffer = v,
                Cow::Borrowed(v) => self.cte_buffer.extend_from_slice(v),
            }
        } else {
            self.input_buffer.extend_from_slice(data);
            let consumed_len = {
                let (decoded, dangling) = qp_decode(&self.input_buffer);
                match decoded {
                    Cow::Owned(v) => self.cte_buffer = v,
                    Cow::Borrowed(v) => self.cte_buffer.extend_from_slice(v),
                }
                self.input_buffer.len() - dangling.len()
            };

            self.input_buffer.copy_within(consumed_len.., 0);
            self.input_buffer
                .truncate(self.input_buffer.len() - consumed_len);
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn plain_text_stays_plain() {
        assert_eq!(Encoding::Plain, infer_encoding(b""));
        assert_eq!(Encoding::Plain, infer_encoding(b"Hello"));
        assert_eq!(
            Encoding::Plain,
            infer_encoding(b"Hello\r\nWorld\r\n\r\n-Someone\r\n")
        );
    }

    #[test]
    fn hazards_force_qp() {
        for &text in &[
            &b"."[..],
            b"Hello\r\n.\r\nWorld",
            b"From here",
            b"x\r\nFrom here",
            b"-- \r\nsig",
            b"--=-=boundary",
            b"trailing \r\nspace",
            b"trailing\t",
            b"bare\nlf",
            b"bare\rcr",
            "café au lait".as_bytes(),
        ] {
            assert_eq!(
                Encoding::QuotedPrintable,
                infer_encoding(text),
                "{:?}",
                String::from_utf8_lossy(text)
            );
        }

        assert_eq!(
            Encoding::QuotedPrintable,
            infer_encoding("x".repeat(77).as_bytes())
        );
        assert_eq!(Encoding::Plain, infer_encoding("x".repeat(76).as_bytes()));
    }

    #[test]
    fn binary_is_base64() {
        assert_eq!(Encoding::Base64, infer_encoding(b"\x00\x01\x02abc"));
        assert_eq!(
            Encoding::Base64,
            infer_encoding("日本語のテキスト".as_bytes())
        );
    }

    #[test]
    fn content_type_by_suffix() {
        assert_eq!(
            "application/pdf",
            infer_content_type(Some("report.PDF"), b"", false).mime_type()
        );
        assert_eq!(
            "text/plain",
            infer_content_type(Some("notes.txt"), b"<html>", false)
                .mime_type()
        );
        assert_eq!(
            "text/html",
            infer_content_type(Some("page"), b"  <!DOCTYPE HTML>", false)
                .mime_type()
        );
        assert_eq!(
            "text/html",
            infer_content_type(None, b"<html><body>", true).mime_type()
        );
        assert_eq!(
            "text/plain",
            infer_content_type(None, b"Hello", true).mime_type()
        );
        assert_eq!(
            "application/octet-stream",
            infer_content_type(Some("data.bin"), b"Hello", false).mime_type()
        );
    }

    #[test]
    fn base64_lines() {
        let encoded = encode_b64(&[0xAB; 200]);
        let lines: Vec<&[u8]> = encoded.split(|&b| b'\n' == b).collect();
        assert_eq!(4, lines.len());
        assert_eq!(77, lines[0].len());
        assert!(!encoded.ends_with(b"\r\n"));
        assert_eq!(vec![0xAB; 200], decode_b64(&encoded).unwrap());
    }

    #[test]
    fn streaming_decoder() {
        let mut decoder = ContentDecoder::new(ContentTransferEncoding::Base64);
        let mut out = Vec::new();
        for piece in &[&b"SGVsbG8s"[..], b"IHdv", b"c", b"mxkIQ==", b"\r\n"] {
            out.extend_from_slice(decoder.push(piece).unwrap());
        }
        assert!(decoder.finish().unwrap().is_empty());
        assert_eq!(b"Hello, world!" as &[u8], &out[..]);

        let mut decoder =
            ContentDecoder::new(ContentTransferEncoding::QuotedPrintable);
        let mut out = Vec::new();
        for piece in &[&b"caf=C"[..], b"3=A9 =", b"\r\n", b"ok"] {
            out.extend_from_slice(decoder.push(piece).unwrap());
        }
        out.extend_from_slice(decoder.finish().unwrap());
        assert_eq!("café ok".as_bytes(), &out[..]);
    }

    #[test]
    fn unpadded_base64_tail_is_kept() {
        let mut decoder = ContentDecoder::new(ContentTransferEncoding::Base64);
        let mut out = Vec::new();
        out.extend_from_slice(
            decoder.push(b"SGVsbG8sIHdvcmxkIQ\r\n").unwrap(),
        );
        out.extend_from_slice(decoder.finish().unwrap());
        assert_eq!(b"Hello, world!" as &[u8], &out[..]);

        let mut decoder = ContentDecoder::new(ContentTransferEncoding::Base64);
        let mut out = Vec::new();
        out.extend_from_slice(decoder.push(b"SGk").unwrap());
        out.extend_from_slice(decoder.finish().unwrap());
        assert_eq!(b"Hi" as &[u8], &out[..]);
    }

    proptest! {
        #[test]
        fn base64_decodes_across_any_split(
            content in prop::collection::vec(any::<u8>(), 0..64),
            split in 0usize..100,
        ) {
            let encoded = base64::encode_config(
                &content,
                base64::STANDARD_NO_PAD,
            );
            let split = split.min(encoded.len());

            let mut decoder =
                ContentDecoder::new(ContentTransferEncoding::Base64);
            let mut out = Vec::new();
            out.extend_from_slice(
                decoder.push(encoded[..split].as_bytes()).unwrap(),
            );
            out.extend_from_slice(
                decoder.push(encoded[split..].as_bytes()).unwrap(),
            );
            out.extend_from_slice(decoder.finish().unwrap());
            prop_assert_eq!(content, out);
        }
    }

    #[test]
    fn corrupt_base64_is_an_error() {
        let mut decoder = ContentDecoder::new(ContentTransferEncoding::Base64);
        assert_matches!(
            Some(Error::Parse(..)),
            decoder.push(b"SGVs=G8s\r\n").err()
        );

        let mut decoder = ContentDecoder::new(ContentTransferEncoding::Base64);
        decoder.push(b"SGVsbG8sI").unwrap();
        assert_matches!(Some(Error::Parse(..)), decoder.finish().err());
    }

    #[test]
    fn dangling_qp_escape_is_kept() {
        let mut decoder =
            ContentDecoder::new(ContentTransferEncoding::QuotedPrintable);
        let mut out = Vec::new();
        out.extend_from_slice(decoder.push(b"100%=").unwrap());
        out.extend_from_slice(decoder.finish().unwrap());
        assert_eq!(b"100%=" as &[u8], &out[..]);
    }

    proptest! {
        #[test]
        fn encoding_choice_is_stable(
            data in prop::collection::vec(prop::num::u8::ANY, 0..200)
        ) {
            prop_assert_eq!(infer_encoding(&data), infer_encoding(&data));
        }

        #[test]
        fn all_encodings_round_trip(
            data in prop::collection::vec(prop::num::u8::ANY, 0..500)
        ) {
            for &encoding in &[Encoding::QuotedPrintable, Encoding::Base64] {
                let encoded = encoding.encode(&data);
                prop_assert_eq!(&data, &encoding.decode(&encoded).unwrap());
            }

            let chosen = infer_encoding(&data);
            let encoded = chosen.encode(&data);
            prop_assert_eq!(&data, &chosen.decode(&encoded).unwrap());
        }

        #[test]
        fn plain_text_round_trips(s in "[ -~]{0,60}(\r\n[ -~]{0,60}){0,5}") {
            let encoding = infer_encoding(s.as_bytes());
            let encoded = encoding.encode(s.as_bytes());
            prop_assert_eq!(
                s.as_bytes(),
                &encoding.decode(&encoded).unwrap()[..]
            );
        }
    }
}
