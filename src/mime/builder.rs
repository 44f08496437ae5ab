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

//! Serialisation of a native message into a MIME tree.

use std::borrow::Cow;

use super::boundary::{BoundaryGen, BoundaryPool};
use super::content_encoding::{infer_content_type, Encoding};
use super::encoded_word::ew_encode;
use super::header::parse_content_type;
use super::model::{AttachmentItem, ContentType};
use super::sink::Sink;
use crate::support::error::Error;

/// An attachment to be serialised, with its content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingAttachment {
    pub item: AttachmentItem,
    pub data: Vec<u8>,
}

impl OutgoingAttachment {
    pub fn new(item: AttachmentItem, data: Vec<u8>) -> Self {
        OutgoingAttachment { item, data }
    }

    /// The content type to declare for this attachment.
    pub fn content_type(&self) -> ContentType {
        self.item
            .content_type
            .as_deref()
            .and_then(|ct| parse_content_type(ct.as_bytes()))
            .unwrap_or_else(|| {
                infer_content_type(
                    self.item.filename.as_deref(),
                    &self.data,
                    false,
                )
            })
    }
}

/// Convert every line ending in `text` to CRLF.
pub fn canonicalize_line_endings(text: &str) -> Cow<str> {
    let bytes = text.as_bytes();
    let already_canonical = bytes.iter().enumerate().all(|(ix, &b)| match b {
        b'\r' => Some(&b'\n') == bytes.get(ix + 1),
        b'\n' => ix > 0 && b'\r' == bytes[ix - 1],
        _ => true,
    });
    if already_canonical {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len() + text.len() / 16);
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\r' => {
                if Some(&'\n') == chars.peek() {
                    chars.next();
                }
                out.push_str("\r\n");
            }
            '\n' => out.push_str("\r\n"),
            ch => out.push(ch),
        }
    }
    Cow::Owned(out)
}

enum Node<'a> {
    Leaf(Leaf<'a>),
    Multipart {
        subtype: &'static str,
        children: Vec<Node<'a>>,
    },
}

struct Leaf<'a> {
    content_type: ContentType,
    data: Cow<'a, [u8]>,
    disposition: Option<&'static str>,
    filename: Option<&'a str>,
    content_id: Option<&'a str>,
}

impl<'a> Leaf<'a> {
    fn text(subtype: &str, text: &'a str) -> Self {
        let data = match canonicalize_line_endings(text) {
            Cow::Borrowed(s) => Cow::Borrowed(s.as_bytes()),
            Cow::Owned(s) => Cow::Owned(s.into_bytes()),
        };

        Leaf {
            content_type: ContentType::new("text", subtype)
                .with_parm("charset", "utf-8"),
            data,
            disposition: None,
            filename: None,
            content_id: None,
        }
    }

    fn attachment(att: &'a OutgoingAttachment, related: bool) -> Self {
        let filename = att.item.filename.as_deref();
        let mut content_type = att.content_type();
        if let Some(filename) = filename {
            if content_type.parm("name").is_none() {
                content_type =
                    content_type.with_parm("name", &ew_encode(filename));
            }
        }

        Leaf {
            content_type,
            data: Cow::Borrowed(&att.data),
            disposition: Some(if related { "inline" } else { "attachment" }),
            filename,
            content_id: att.item.content_id.as_deref(),
        }
    }
}

/// Serialise a message into `sink`.
///
/// `attachments` carrying a content id are treated as related parts of the
/// HTML body when there is one. The output is one MIME entity, headers
/// included, without a line ending after its last line.
pub fn serialize(
    body: &str,
    html: Option<&str>,
    attachments: &[OutgoingAttachment],
    sink: &mut dyn Sink,
    gen: &mut dyn BoundaryGen,
) -> Result<(), Error> {
    let tree = shape(body, html, attachments);
    let mut pool = BoundaryPool::new(gen);
    write_node(&tree, sink, &mut pool)
}

fn shape<'a>(
    body: &'a str,
    html: Option<&'a str>,
    attachments: &'a [OutgoingAttachment],
) -> Node<'a> {
    let (related, ordinary): (Vec<_>, Vec<_>) = attachments
        .iter()
        .partition(|a| html.is_some() && a.item.content_id.is_some());

    let ordinary: Vec<Node<'a>> = ordinary
        .into_iter()
        .map(|a| Node::Leaf(Leaf::attachment(a, false)))
        .collect();

    if let Some(html) = html {
        let alternative = Node::Multipart {
            subtype: "alternative",
            children: vec![
                Node::Leaf(Leaf::text("plain", body)),
                Node::Leaf(Leaf::text("html", html)),
            ],
        };

        let inner = if related.is_empty() {
            alternative
        } else {
            let mut children = vec![alternative];
            children.extend(
                related
                    .into_iter()
                    .map(|a| Node::Leaf(Leaf::attachment(a, true))),
            );
            Node::Multipart {
                subtype: "related",
                children,
            }
        };

        if ordinary.is_empty() {
            inner
        } else {
            let mut children = vec![inner];
            children.extend(ordinary);
            Node::Multipart {
                subtype: "mixed",
                children,
            }
        }
    } else {
        let mut children = Vec::with_capacity(ordinary.len() + 1);
        if !body.is_empty() || ordinary.is_empty() {
            children.push(Node::Leaf(Leaf::text("plain", body)));
        }
        children.extend(ordinary);

        if 1 == children.len() {
            children.pop().unwrap_or_else(|| {
                Node::Leaf(Leaf::text("plain", body))
            })
        } else {
            Node::Multipart {
                subtype: "mixed",
                children,
            }
        }
    }
}

fn write_node(
    node: &Node<'_>,
    sink: &mut dyn Sink,
    gen: &mut dyn BoundaryGen,
) -> Result<(), Error> {
    match *node {
        Node::Leaf(ref leaf) => write_leaf(leaf, sink),
        Node::Multipart {
            subtype,
            ref children,
        } => {
            let boundary = gen.next_boundary();
            let ct = ContentType::new("multipart", subtype)
                .with_parm("boundary", &boundary);
            sink.write(format!("Content-Type: {}\r\n\r\n", ct).as_bytes())?;

            for (ix, child) in children.iter().enumerate() {
                if ix > 0 {
                    sink.write(b"\r\n")?;
                }
                sink.write(format!("--{}\r\n", boundary).as_bytes())?;
                write_node(child, sink, gen)?;
            }
            sink.write(format!("\r\n--{}--", boundary).as_bytes())?;
            Ok(())
        }
    }
}

fn write_leaf(leaf: &Leaf<'_>, sink: &mut dyn Sink) -> Result<(), Error> {
    let encoding = Encoding::for_part(&leaf.content_type, &leaf.data);

    let mut headers = format!(
        "Content-Type: {}\r\nContent-Transfer-Encoding: {}\r\n",
        leaf.content_type,
        encoding.header_value()
    );
    if let Some(disposition) = leaf.disposition {
        headers.push_str("Content-Disposition: ");
        headers.push_str(disposition);
        if let Some(filename) = leaf.filename {
            headers.push_str(&format!(
                "; filename=\"{}\"",
                ew_encode(filename)
            ));
        }
        headers.push_str("\r\n");
    }
    if let Some(content_id) = leaf.content_id {
        headers.push_str(&format!("Content-ID: <{}>\r\n", content_id));
    }
    headers.push_str("\r\n");

    sink.write(headers.as_bytes())?;
    sink.write(&encoding.encode(&leaf.data))?;
    Ok(())
}
