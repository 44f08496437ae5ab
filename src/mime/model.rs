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

use std::fmt;

/// A parsed `Content-Type`.
///
/// The type, subtype and parameter names are stored in lower case.
/// Parameter values are already unquoted and, for RFC 2231 parameters,
/// decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentType {
    pub typ: String,
    pub subtype: String,
    pub parms: Vec<(String, String)>,
}

impl ContentType {
    pub fn new(typ: &str, subtype: &str) -> Self {
        ContentType {
            typ: typ.to_ascii_lowercase(),
            subtype: subtype.to_ascii_lowercase(),
            parms: vec![],
        }
    }

    pub fn with_parm(mut self, name: &str, value: &str) -> Self {
        self.parms
            .push((name.to_ascii_lowercase(), value.to_owned()));
        self
    }

    pub fn is_type(&self, typ: &str) -> bool {
        self.typ.eq_ignore_ascii_case(typ)
    }

    /// Whether the subtype is `subtype` or its experimental `x-` form.
    pub fn is_subtype(&self, subtype: &str) -> bool {
        self.subtype.eq_ignore_ascii_case(subtype)
            || (self.subtype.len() == subtype.len() + 2
                && self.subtype.as_bytes()[..2].eq_ignore_ascii_case(b"x-")
                && self.subtype.as_bytes()[2..]
                    .eq_ignore_ascii_case(subtype.as_bytes()))
    }

    pub fn is(&self, typ: &str, subtype: &str) -> bool {
        self.is_type(typ) && self.is_subtype(subtype)
    }

    pub fn parm(&self, name: &str) -> Option<&str> {
        self.parms
            .iter()
            .find(|&&(ref n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, ref v)| v.as_str())
    }

    /// The bare `type/subtype` string.
    pub fn mime_type(&self) -> String {
        format!("{}/{}", self.typ, self.subtype)
    }

    /// If this is the `Content-Type` of a detached signature, the protocol
    /// it belongs to.
    pub fn signature_protocol(
        &self,
    ) -> Option<crate::crypt::backend::Protocol> {
        use crate::crypt::backend::Protocol;

        if self.is("application", "pgp-signature") {
            Some(Protocol::OpenPgp)
        } else if self.is("application", "pkcs7-signature") {
            Some(Protocol::Smime)
        } else {
            None
        }
    }
}

impl Default for ContentType {
    fn default() -> Self {
        ContentType::new("text", "plain")
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.typ, self.subtype)?;
        for &(ref name, ref value) in &self.parms {
            write!(f, "; {}=\"", name)?;
            for ch in value.chars() {
                if '"' == ch || '\\' == ch {
                    write!(f, "\\")?;
                }
                write!(f, "{}", ch)?;
            }
            write!(f, "\"")?;
        }
        Ok(())
    }
}

/// One entry in the linear description of a parsed MIME tree.
///
/// Parts appear in document order. `level` encodes nesting: the top-level
/// entity is level 0, the children of a multipart at level `n` are at level
/// `n + 1`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MimePart {
    pub level: u32,
    pub content_type: (String, String),
    pub charset: Option<String>,
    pub filename: Option<String>,
    pub content_id: Option<String>,
}

impl MimePart {
    /// Format this part as one line of the "mime-info" descriptor.
    pub fn info_line(&self) -> String {
        format!(
            "{}:::{}/{}:{}:{}\n",
            self.level,
            self.content_type.0,
            self.content_type.1,
            self.charset.as_deref().unwrap_or(""),
            self.filename.as_deref().unwrap_or(""),
        )
    }
}

/// The ordered sequence of `MimePart`s of one parse.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MimeStructure {
    pub parts: Vec<MimePart>,
}

impl MimeStructure {
    pub fn push(&mut self, part: MimePart) {
        self.parts.push(part);
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// The parts directly below a container at `level`, as type/subtype.
    pub fn types_at(&self, level: u32) -> Vec<String> {
        self.parts
            .iter()
            .filter(|p| p.level == level)
            .map(|p| format!("{}/{}", p.content_type.0, p.content_type.1))
            .collect()
    }

    /// Produce the "mime-info" descriptor for this structure.
    pub fn to_info_string(&self) -> String {
        self.parts.iter().map(MimePart::info_line).collect()
    }
}

/// How an attachment is held by the native store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachMethod {
    ByValue,
    Ole,
    Embedded,
}

/// What an attachment is, as far as this crate is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachKind {
    /// An ordinary file the user attached.
    User,
    /// The complete signed or encrypted MIME blob of the message.
    MimeBlob,
    /// The message body stored as an attachment.
    Body,
    /// A container which only exists to rebuild the MIME structure.
    Synthetic,
}

/// A native-store attachment candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachmentItem {
    /// The rendering position within the body, if any.
    pub position: Option<u32>,
    pub method: AttachMethod,
    pub filename: Option<String>,
    /// The declared `type/subtype`, if known.
    pub content_type: Option<String>,
    pub content_id: Option<String>,
    pub kind: AttachKind,
    /// Whether the stored bytes are encrypted with the session key.
    pub protected: bool,
}

impl AttachmentItem {
    /// A by-value user attachment with the given name.
    pub fn user(filename: &str) -> Self {
        AttachmentItem {
            position: None,
            method: AttachMethod::ByValue,
            filename: Some(filename.to_owned()),
            content_type: None,
            content_id: None,
            kind: AttachKind::User,
            protected: false,
        }
    }

    pub fn with_content_id(mut self, cid: &str) -> Self {
        self.content_id = Some(cid.to_owned());
        self
    }

    pub fn with_content_type(mut self, ct: &str) -> Self {
        self.content_type = Some(ct.to_owned());
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn subtype_matching() {
        let ct = ContentType::new("Application", "X-PKCS7-Signature");
        assert!(ct.is_type("application"));
        assert!(ct.is_subtype("pkcs7-signature"));
        assert!(ct.is_subtype("x-pkcs7-signature"));
        assert!(!ct.is_subtype("pkcs7-mime"));
    }

    #[test]
    fn content_type_display() {
        let ct = ContentType::new("multipart", "mixed")
            .with_parm("boundary", "=-=abc")
            .with_parm("name", "a \"b\"");
        assert_eq!(
            "multipart/mixed; boundary=\"=-=abc\"; name=\"a \\\"b\\\"\"",
            ct.to_string()
        );
    }

    #[test]
    fn info_string() {
        let mut structure = MimeStructure::default();
        structure.push(MimePart {
            level: 0,
            content_type: ("multipart".to_owned(), "mixed".to_owned()),
            charset: None,
            filename: None,
            content_id: None,
        });
        structure.push(MimePart {
            level: 1,
            content_type: ("text".to_owned(), "plain".to_owned()),
            charset: Some("utf-8".to_owned()),
            filename: None,
            content_id: None,
        });
        structure.push(MimePart {
            level: 1,
            content_type: ("application".to_owned(), "pdf".to_owned()),
            charset: None,
            filename: Some("report.pdf".to_owned()),
            content_id: None,
        });

        assert_eq!(
            "0:::multipart/mixed::\n\
             1:::text/plain:utf-8:\n\
             1:::application/pdf::report.pdf\n",
            structure.to_info_string()
        );
        assert_eq!(
            vec!["text/plain".to_owned(), "application/pdf".to_owned()],
            structure.types_at(1)
        );
    }
}
