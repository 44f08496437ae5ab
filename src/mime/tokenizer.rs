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

//! A push tokenizer which splits a MIME entity into lines and reports its
//! structure.
//!
//! The tokenizer knows about headers, `Content-Type` and multipart
//! boundaries and nothing else. It does no transfer decoding and does not
//! interpret any other header; that is left to the `Handler`.

use std::mem;
use std::str;

use super::header::parse_content_type;
use super::model::ContentType;
use crate::support::error::Error;

/// Receives structural events from a `Tokenizer`.
///
/// Levels count nesting: the top-level entity is at level 0 and the children
/// of a multipart at level `n` are at level `n + 1`.
///
/// Any error returned aborts tokenisation; `cancel` is then called before the
/// error is returned to the feeder.
#[allow(unused_variables)]
pub trait Handler {
    /// The header block of a part at `level` begins.
    fn begin_header(&mut self, level: u32) -> Result<(), Error> {
        Ok(())
    }

    /// One unfolded header of the current part.
    ///
    /// `value` is the raw value with surrounding whitespace removed.
    fn header(&mut self, name: &str, value: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    /// The headers of the part at `level` are complete.
    ///
    /// If `ct` is a multipart type with a boundary, `level_up` follows
    /// immediately.
    fn transition_to_body(
        &mut self,
        level: u32,
        ct: &ContentType,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// A multipart was entered; its children are at `level`.
    fn level_up(&mut self, level: u32) -> Result<(), Error> {
        Ok(())
    }

    /// A multipart was left; nesting is back at `level`.
    fn level_down(&mut self, level: u32) -> Result<(), Error> {
        Ok(())
    }

    /// A boundary line which starts a new child at `level`.
    fn boundary(&mut self, level: u32) -> Result<(), Error> {
        Ok(())
    }

    /// The closing boundary of the multipart whose children are at `level`.
    ///
    /// `level_down` follows immediately.
    fn last_boundary(&mut self, level: u32) -> Result<(), Error> {
        Ok(())
    }

    /// Content of the current leaf part.
    ///
    /// The line ending before a boundary belongs to the boundary and is never
    /// passed here. Line endings are delivered as separate calls from the
    /// text of the lines.
    fn data(&mut self, data: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    /// Every input line in its raw form, including its line ending.
    ///
    /// This is called after the structural events caused by the line.
    fn raw_line(&mut self, line: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    /// Tokenisation was abandoned. Anything partially written should be
    /// discarded.
    fn cancel(&mut self) {}
}

const MAX_RECURSION: usize = 20;
/// Maximum length of a header after unfolding; longer headers are dropped.
const MAX_HEADER: usize = 65536;

/// A push tokenizer over one MIME entity.
///
/// Input may be fed in arbitrarily sized pieces. Lines are delimited by LF;
/// a CR before the LF is treated as part of the line ending.
pub struct Tokenizer<H> {
    handler: H,
    max_line: usize,

    /// The incomplete line carried over from the last `feed`.
    line: Vec<u8>,
    /// Whether `begin_header(0)` has been sent.
    started: bool,
    /// The current nesting level.
    level: u32,
    /// Whether we are reading the header block of a part.
    in_headers: bool,
    /// The header being unfolded.
    header: Vec<u8>,
    /// Set when the header in `header` became too long to keep.
    header_discarded: bool,
    /// The first Content-Type seen in the current header block.
    content_type: Option<ContentType>,
    /// Open multipart delimiters, outermost first, including the leading
    /// `--`.
    boundaries: Vec<Vec<u8>>,
    /// Whether lines which are not boundaries are content of a leaf part,
    /// rather than preamble or epilogue.
    in_data: bool,
    /// The line ending of the last data line, which is only content if
    /// another data line follows.
    pending_ending: &'static [u8],
    /// Set once the handler has been cancelled.
    dead: bool,
}

impl<H: Handler> Tokenizer<H> {
    pub fn new(handler: H, max_line: usize) -> Self {
        Tokenizer {
            handler,
            max_line,
            line: Vec::new(),
            started: false,
            level: 0,
            in_headers: true,
            header: Vec::new(),
            header_discarded: false,
            content_type: None,
            boundaries: Vec::new(),
            in_data: false,
            pending_ending: b"",
            dead: false,
        }
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Feed the next piece of input.
    pub fn feed(&mut self, mut data: &[u8]) -> Result<(), Error> {
        self.check_alive()?;

        while !data.is_empty() {
            match memchr::memchr(b'\n', data) {
                Some(lf) => {
                    let (line, rest) = data.split_at(lf + 1);
                    data = rest;

                    if self.line.is_empty() {
                        self.guard(|this| this.process_line(line))?;
                    } else {
                        self.line.extend_from_slice(line);
                        let buffered = mem::take(&mut self.line);
                        self.guard(|this| this.process_line(&buffered))?;
                        self.line = buffered;
                        self.line.clear();
                    }
                }

                None => {
                    self.line.extend_from_slice(data);
                    data = &[];

                    // Allow for a CR whose LF has not arrived yet
                    if self.line.len() > self.max_line + 1 {
                        let max_line = self.max_line;
                        return self
                            .guard(|_| Err(Error::EncodingOverflow(max_line)));
                    }
                }
            }
        }

        Ok(())
    }

    /// Abandon tokenisation, cancelling the handler.
    pub fn cancel(&mut self) {
        if !self.dead {
            self.dead = true;
            self.handler.cancel();
        }
    }

    /// Process the final, possibly unterminated line and check that every
    /// multipart was closed.
    pub fn finish(mut self) -> Result<H, Error> {
        self.check_alive()?;

        if !self.line.is_empty() {
            let last = mem::take(&mut self.line);
            self.guard(|this| this.process_line(&last))?;
        }

        self.guard(|this| {
            this.start()?;
            if this.in_headers {
                this.finish_headers(true)?;
            }

            if !this.boundaries.is_empty() {
                return Err(Error::Parse(format!(
                    "Unterminated multipart at level {}",
                    this.level
                )));
            }

            if this.in_data && !this.pending_ending.is_empty() {
                this.handler.data(this.pending_ending)?;
            }
            Ok(())
        })?;

        Ok(self.handler)
    }

    fn check_alive(&self) -> Result<(), Error> {
        if self.dead {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `f`, cancelling the handler if it fails.
    fn guard(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let result = f(self);
        if result.is_err() {
            self.cancel();
        }
        result
    }

    fn start(&mut self) -> Result<(), Error> {
        if !self.started {
            self.started = true;
            self.handler.begin_header(0)?;
        }
        Ok(())
    }

    fn process_line(&mut self, line: &[u8]) -> Result<(), Error> {
        self.start()?;

        let (content, ending) = split_ending(line);
        if content.len() > self.max_line {
            return Err(Error::EncodingOverflow(self.max_line));
        }

        if let Some((ix, last)) = self.match_boundary(content) {
            self.on_boundary(ix, last)?;
        } else if self.in_headers {
            self.header_line(content)?;
        } else if self.in_data {
            if !self.pending_ending.is_empty() {
                self.handler.data(self.pending_ending)?;
            }
            self.handler.data(content)?;
            self.pending_ending = ending;
        }

        self.handler.raw_line(line)
    }

    fn header_line(&mut self, content: &[u8]) -> Result<(), Error> {
        if content.is_empty() {
            return self.finish_headers(true);
        }

        if (b' ' == content[0] || b'\t' == content[0])
            && !self.header.is_empty()
        {
            if self.header.len() + content.len() > MAX_HEADER {
                self.header_discarded = true;
            } else {
                self.header.extend_from_slice(content);
            }
            return Ok(());
        }

        self.flush_header()?;
        self.header.extend_from_slice(content);
        Ok(())
    }

    fn flush_header(&mut self) -> Result<(), Error> {
        let header = mem::take(&mut self.header);
        let discarded = mem::replace(&mut self.header_discarded, false);
        if header.is_empty() || discarded {
            return Ok(());
        }

        let colon = match memchr::memchr(b':', &header) {
            Some(colon) => colon,
            None => return Ok(()),
        };

        let name = match str::from_utf8(&header[..colon]) {
            Ok(name) if !name.trim().is_empty() => name.trim(),
            _ => return Ok(()),
        };
        let value = trim_ws(&header[colon + 1..]);

        if self.content_type.is_none()
            && name.eq_ignore_ascii_case("Content-Type")
        {
            self.content_type = parse_content_type(value);
        }

        self.handler.header(name, value)
    }

    /// End the header block of the current part.
    ///
    /// If `allow_nesting` is false, a multipart is treated as a leaf since the
    /// part ended before any body.
    fn finish_headers(&mut self, allow_nesting: bool) -> Result<(), Error> {
        self.flush_header()?;
        self.in_headers = false;
        self.pending_ending = b"";

        let ct = self.content_type.take().unwrap_or_default();
        self.handler.transition_to_body(self.level, &ct)?;

        let boundary = if allow_nesting && ct.is_type("multipart") {
            ct.parm("boundary").filter(|b| !b.is_empty())
        } else {
            None
        };

        if let Some(boundary) = boundary {
            if self.boundaries.len() >= MAX_RECURSION {
                return Err(Error::Parse("MIME nesting too deep".to_owned()));
            }

            let mut delim = b"--".to_vec();
            delim.extend_from_slice(boundary.as_bytes());
            self.boundaries.push(delim);
            self.level += 1;
            self.in_data = false;
            self.handler.level_up(self.level)?;
        } else {
            self.in_data = true;
        }

        Ok(())
    }

    /// Find the innermost open boundary matching `content`.
    ///
    /// Returns its index in `boundaries` and whether it is the closing form.
    fn match_boundary(&self, content: &[u8]) -> Option<(usize, bool)> {
        if !content.starts_with(b"--") {
            return None;
        }

        let content = trim_trailing_ws(content);
        self.boundaries
            .iter()
            .enumerate()
            .rev()
            .find_map(|(ix, delim)| {
                if content == &delim[..] {
                    Some((ix, false))
                } else if content.len() == delim.len() + 2
                    && content.starts_with(delim)
                    && content.ends_with(b"--")
                {
                    Some((ix, true))
                } else {
                    None
                }
            })
    }

    fn on_boundary(&mut self, ix: usize, last: bool) -> Result<(), Error> {
        if self.in_headers {
            self.finish_headers(false)?;
        }
        self.pending_ending = b"";
        self.in_data = false;

        // An outer boundary implicitly closes anything nested inside
        while self.boundaries.len() > ix + 1 {
            self.boundaries.pop();
            self.level -= 1;
            self.handler.level_down(self.level)?;
        }

        if last {
            self.handler.last_boundary(self.level)?;
            self.boundaries.pop();
            self.level -= 1;
            self.handler.level_down(self.level)?;
        } else {
            self.handler.boundary(self.level)?;
            self.in_headers = true;
            self.content_type = None;
            self.handler.begin_header(self.level)?;
        }

        Ok(())
    }
}

fn split_ending(line: &[u8]) -> (&[u8], &'static [u8]) {
    if line.ends_with(b"\r\n") {
        (&line[..line.len() - 2], b"\r\n")
    } else if line.ends_with(b"\n") {
        (&line[..line.len() - 1], b"\n")
    } else {
        (line, b"")
    }
}

fn trim_trailing_ws(mut s: &[u8]) -> &[u8] {
    while let Some((&last, rest)) = s.split_last() {
        if b' ' == last || b'\t' == last || b'\r' == last {
            s = rest;
        } else {
            break;
        }
    }
    s
}

fn trim_ws(mut s: &[u8]) -> &[u8] {
    while let Some((&first, rest)) = s.split_first() {
        if b' ' == first || b'\t' == first {
            s = rest;
        } else {
            break;
        }
    }
    trim_trailing_ws(s)
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Default)]
    struct Recorder {
        events: Vec<String>,
        raw: Vec<u8>,
        cancelled: bool,
    }

    impl Recorder {
        fn push(&mut self, event: String) {
            self.events.push(event);
        }
    }

    impl Handler for Recorder {
        fn begin_header(&mut self, level: u32) -> Result<(), Error> {
            self.push(format!("begin {}", level));
            Ok(())
        }

        fn header(&mut self, name: &str, value: &[u8]) -> Result<(), Error> {
            self.push(format!(
                "header {}: {}",
                name,
                String::from_utf8_lossy(value)
            ));
            Ok(())
        }

        fn transition_to_body(
            &mut self,
            level: u32,
            ct: &ContentType,
        ) -> Result<(), Error> {
            self.push(format!("body {} {}", level, ct.mime_type()));
            Ok(())
        }

        fn level_up(&mut self, level: u32) -> Result<(), Error> {
            self.push(format!("up {}", level));
            Ok(())
        }

        fn level_down(&mut self, level: u32) -> Result<(), Error> {
            self.push(format!("down {}", level));
            Ok(())
        }

        fn boundary(&mut self, level: u32) -> Result<(), Error> {
            self.push(format!("boundary {}", level));
            Ok(())
        }

        fn last_boundary(&mut self, level: u32) -> Result<(), Error> {
            self.push(format!("last {}", level));
            Ok(())
        }

        fn data(&mut self, data: &[u8]) -> Result<(), Error> {
            let data = String::from_utf8_lossy(data);
            match self.events.last_mut() {
                Some(last) if last.starts_with("data ") => {
                    last.push_str(&data)
                }
                _ => self.push(format!("data {}", data)),
            }
            Ok(())
        }

        fn raw_line(&mut self, line: &[u8]) -> Result<(), Error> {
            self.raw.extend_from_slice(line);
            Ok(())
        }

        fn cancel(&mut self) {
            self.cancelled = true;
        }
    }

    fn tokenize(input: &[u8]) -> Recorder {
        let mut tokenizer = Tokenizer::new(Recorder::default(), 1000);
        tokenizer.feed(input).unwrap();
        let recorder = tokenizer.finish().unwrap();
        assert_eq!(input, &recorder.raw[..]);
        recorder
    }

    const NESTED: &str = "Content-Type: multipart/mixed;\r\n\
                          \tboundary=\"outer\"\r\n\
                          Subject: test\r\n\
                          \r\n\
                          preamble\r\n\
                          --outer\r\n\
                          Content-Type: multipart/alternative; boundary=inner\r\n\
                          \r\n\
                          --inner\r\n\
                          \r\n\
                          plain\r\n\
                          --inner\r\n\
                          Content-Type: text/html\r\n\
                          \r\n\
                          <p>html</p>\r\n\
                          --outer  \r\n\
                          Content-Type: application/pdf\r\n\
                          \r\n\
                          --fake\r\n\
                          JVBERi0=\r\n\
                          --outer--\r\n\
                          epilogue\r\n";

    #[test]
    fn single_part() {
        let recorder =
            tokenize(b"Subject: hi\r\n\r\nHello\r\nWorld\r\n");
        assert_eq!(
            vec![
                "begin 0",
                "header Subject: hi",
                "body 0 text/plain",
                "data Hello\r\nWorld\r\n",
            ],
            recorder.events
        );
    }

    #[test]
    fn unterminated_final_line_is_data() {
        let recorder = tokenize(b"\r\nno newline");
        assert_eq!(
            vec!["begin 0", "body 0 text/plain", "data no newline"],
            recorder.events
        );
    }

    #[test]
    fn nested_multipart() {
        let recorder = tokenize(NESTED.as_bytes());
        assert_eq!(
            vec![
                "begin 0",
                "header Content-Type: multipart/mixed;\tboundary=\"outer\"",
                "header Subject: test",
                "body 0 multipart/mixed",
                "up 1",
                "boundary 1",
                "begin 1",
                "header Content-Type: multipart/alternative; boundary=inner",
                "body 1 multipart/alternative",
                "up 2",
                "boundary 2",
                "begin 2",
                "body 2 text/plain",
                "data plain",
                "boundary 2",
                "begin 2",
                "header Content-Type: text/html",
                "body 2 text/html",
                "data <p>html</p>",
                "down 1",
                "boundary 1",
                "begin 1",
                "header Content-Type: application/pdf",
                "body 1 application/pdf",
                "data --fake\r\nJVBERi0=",
                "last 1",
                "down 0",
            ],
            recorder.events
        );
        assert!(!recorder.cancelled);
    }

    #[test]
    fn headers_without_body() {
        let recorder = tokenize(
            b"Content-Type: multipart/mixed; boundary=b\r\n\
              \r\n\
              --b\r\n\
              Content-Type: text/plain\r\n\
              --b--\r\n",
        );
        assert_eq!(
            vec![
                "begin 0",
                "header Content-Type: multipart/mixed; boundary=b",
                "body 0 multipart/mixed",
                "up 1",
                "boundary 1",
                "begin 1",
                "header Content-Type: text/plain",
                "body 1 text/plain",
                "last 1",
                "down 0",
            ],
            recorder.events
        );
    }

    #[test]
    fn overlong_line_is_fatal() {
        let mut tokenizer = Tokenizer::new(Recorder::default(), 10);
        tokenizer.feed(b"\r\nshort\r\n").unwrap();
        assert_matches!(
            Err(Error::EncodingOverflow(10)),
            tokenizer.feed(b"this line is much too long")
        );
        assert!(tokenizer.handler_mut().cancelled);
        assert_matches!(Err(Error::Cancelled), tokenizer.feed(b"more"));

        let mut tokenizer = Tokenizer::new(Recorder::default(), 10);
        assert_matches!(
            Err(Error::EncodingOverflow(10)),
            tokenizer.feed(b"\r\nthis line is much too long\r\n")
        );
    }

    #[test]
    fn unterminated_multipart() {
        let mut tokenizer = Tokenizer::new(Recorder::default(), 100);
        tokenizer
            .feed(
                b"Content-Type: multipart/mixed; boundary=b\r\n\
                  \r\n\
                  --b\r\n\
                  \r\n\
                  text\r\n",
            )
            .unwrap();
        assert_matches!(Err(Error::Parse(..)), tokenizer.finish());
    }

    #[test]
    fn recursion_limit() {
        let mut input = String::new();
        for i in 0..=MAX_RECURSION {
            input.push_str(&format!(
                "Content-Type: multipart/mixed; boundary=b{}\r\n\r\n--b{}\r\n",
                i, i
            ));
        }
        let mut tokenizer = Tokenizer::new(Recorder::default(), 100);
        assert_matches!(
            Err(Error::Parse(..)),
            tokenizer.feed(input.as_bytes())
        );
        assert!(tokenizer.handler_mut().cancelled);
    }

    #[test]
    fn explicit_cancel() {
        let mut tokenizer = Tokenizer::new(Recorder::default(), 100);
        tokenizer.feed(b"Subject: x\r\n").unwrap();
        tokenizer.cancel();
        assert!(tokenizer.handler_mut().cancelled);
        assert_matches!(Err(Error::Cancelled), tokenizer.finish());
    }

    proptest! {
        #[test]
        fn split_feeding_is_equivalent(
            splits in prop::collection::vec(0..NESTED.len(), 0..10)
        ) {
            let whole = tokenize(NESTED.as_bytes());

            let mut splits = splits;
            splits.sort();
            let mut tokenizer = Tokenizer::new(Recorder::default(), 1000);
            let mut start = 0;
            for split in splits {
                tokenizer.feed(&NESTED.as_bytes()[start..split]).unwrap();
                start = split;
            }
            tokenizer.feed(&NESTED.as_bytes()[start..]).unwrap();
            let pieces = tokenizer.finish().unwrap();

            prop_assert_eq!(whole.events, pieces.events);
            prop_assert_eq!(whole.raw, pieces.raw);
        }
    }
}
