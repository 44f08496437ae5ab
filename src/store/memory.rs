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

//! An in-memory `NativeStore`, used by the CLI and by tests.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read};
use std::sync::{Arc, Mutex};

use super::{AttachmentHandle, NativeStore};
use crate::mime::model::AttachmentItem;
use crate::mime::sink::Sink;
use crate::support::error::Error;

/// A message held entirely in memory.
///
/// Clones share the same message, so a test can keep one clone to inspect
/// what the engine did with another.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    subject: String,
    plain: String,
    html: Option<String>,
    attachments: BTreeMap<AttachmentHandle, Stored>,
    next_handle: u64,
    message_class: Option<String>,
    mime_info: Option<String>,
    commits: u32,
    inline_response: bool,
}

#[derive(Debug)]
struct Stored {
    item: AttachmentItem,
    data: Vec<u8>,
    /// Whether the creating sink has been finished.
    complete: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(self, plain: &str, html: Option<&str>) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.plain = plain.to_owned();
            inner.html = html.map(str::to_owned);
        }
        self
    }

    pub fn with_subject(self, subject: &str) -> Self {
        self.inner.lock().unwrap().subject = subject.to_owned();
        self
    }

    pub fn set_inline_response(&self, inline_response: bool) {
        self.inner.lock().unwrap().inline_response = inline_response;
    }

    /// Add a complete attachment directly.
    pub fn add_attachment(
        &self,
        item: AttachmentItem,
        data: &[u8],
    ) -> AttachmentHandle {
        let mut inner = self.inner.lock().unwrap();
        let handle = inner.allocate();
        inner.attachments.insert(
            handle,
            Stored {
                item,
                data: data.to_vec(),
                complete: true,
            },
        );
        handle
    }

    /// The finished attachments, in creation order.
    pub fn attachments(&self) -> Vec<(AttachmentItem, Vec<u8>)> {
        self.inner
            .lock()
            .unwrap()
            .attachments
            .values()
            .filter(|s| s.complete)
            .map(|s| (s.item.clone(), s.data.clone()))
            .collect()
    }

    pub fn body(&self) -> (String, Option<String>) {
        let inner = self.inner.lock().unwrap();
        (inner.plain.clone(), inner.html.clone())
    }

    pub fn message_class(&self) -> Option<String> {
        self.inner.lock().unwrap().message_class.clone()
    }

    pub fn mime_info(&self) -> Option<String> {
        self.inner.lock().unwrap().mime_info.clone()
    }

    pub fn commits(&self) -> u32 {
        self.inner.lock().unwrap().commits
    }
}

impl Inner {
    fn allocate(&mut self) -> AttachmentHandle {
        self.next_handle += 1;
        AttachmentHandle(self.next_handle)
    }

    fn get(&self, handle: AttachmentHandle) -> Result<&Stored, Error> {
        self.attachments
            .get(&handle)
            .filter(|s| s.complete)
            .ok_or_else(|| no_such_attachment(handle))
    }
}

fn no_such_attachment(handle: AttachmentHandle) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("No attachment {}", handle),
    ))
}

impl NativeStore for MemoryStore {
    fn read_body(&self) -> Result<(String, Option<String>), Error> {
        Ok(self.body())
    }

    fn subject(&self) -> Result<String, Error> {
        Ok(self.inner.lock().unwrap().subject.clone())
    }

    fn list_attachments(
        &self,
    ) -> Result<Vec<(AttachmentHandle, AttachmentItem)>, Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .attachments
            .iter()
            .filter(|&(_, s)| s.complete)
            .map(|(&h, s)| (h, s.item.clone()))
            .collect())
    }

    fn open_attachment_stream(
        &self,
        handle: AttachmentHandle,
    ) -> Result<Box<dyn Read + Send>, Error> {
        let data = self.inner.lock().unwrap().get(handle)?.data.clone();
        Ok(Box::new(Cursor::new(data)))
    }

    fn create_attachment(
        &mut self,
        item: &AttachmentItem,
    ) -> Result<(AttachmentHandle, Box<dyn Sink + Send>), Error> {
        let handle = {
            let mut inner = self.inner.lock().unwrap();
            let handle = inner.allocate();
            inner.attachments.insert(
                handle,
                Stored {
                    item: item.clone(),
                    data: Vec::new(),
                    complete: false,
                },
            );
            handle
        };

        Ok((
            handle,
            Box::new(AttachmentSink {
                store: Arc::clone(&self.inner),
                handle,
                data: Vec::new(),
                finished: false,
            }),
        ))
    }

    fn delete_attachment(
        &mut self,
        handle: AttachmentHandle,
    ) -> Result<(), Error> {
        self.inner
            .lock()
            .unwrap()
            .attachments
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| no_such_attachment(handle))
    }

    fn replace_body(&mut self, text: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.plain = text.to_owned();
        inner.html = None;
        Ok(())
    }

    fn set_message_class(&mut self, class: &str) -> Result<(), Error> {
        self.inner.lock().unwrap().message_class = Some(class.to_owned());
        Ok(())
    }

    fn store_mime_info(&mut self, info: &str) -> Result<(), Error> {
        self.inner.lock().unwrap().mime_info = Some(info.to_owned());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.inner.lock().unwrap().commits += 1;
        Ok(())
    }

    fn is_inline_response(&self) -> bool {
        self.inner.lock().unwrap().inline_response
    }
}

/// Writes a new attachment; the data lands in the store on `finish`.
struct AttachmentSink {
    store: Arc<Mutex<Inner>>,
    handle: AttachmentHandle,
    data: Vec<u8>,
    finished: bool,
}

impl Sink for AttachmentSink {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        if self.finished {
            return Ok(());
        }

        let mut inner = self.store.lock().unwrap();
        let stored = inner
            .attachments
            .get_mut(&self.handle)
            .ok_or_else(|| no_such_attachment(self.handle))?;
        stored.data = std::mem::take(&mut self.data);
        stored.complete = true;
        self.finished = true;
        Ok(())
    }
}

impl Drop for AttachmentSink {
    fn drop(&mut self) {
        if !self.finished {
            if let Ok(mut inner) = self.store.lock() {
                inner.attachments.remove(&self.handle);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mime::model::AttachKind;

    #[test]
    fn attachments_appear_when_finished() {
        let mut store = MemoryStore::new();
        let view = store.clone();

        let (handle, mut sink) = store
            .create_attachment(&AttachmentItem::user("a.txt"))
            .unwrap();
        sink.write(b"hello").unwrap();
        assert!(view.attachments().is_empty());
        assert!(store.open_attachment_stream(handle).is_err());

        sink.finish().unwrap();
        drop(sink);
        assert_eq!(1, view.attachments().len());

        let mut data = Vec::new();
        store
            .open_attachment_stream(handle)
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(b"hello" as &[u8], &data[..]);
    }

    #[test]
    fn unfinished_attachment_is_discarded() {
        let mut store = MemoryStore::new();
        let (_, mut sink) = store
            .create_attachment(&AttachmentItem::user("partial.bin"))
            .unwrap();
        sink.write(b"partial").unwrap();
        drop(sink);

        assert!(store.list_attachments().unwrap().is_empty());
        assert!(store.inner.lock().unwrap().attachments.is_empty());
    }

    #[test]
    fn delete_and_replace() {
        let mut store = MemoryStore::new().with_body("plain", Some("<p>"));
        let mut item = AttachmentItem::user("x");
        item.kind = AttachKind::Body;
        let handle = store.add_attachment(item, b"x");

        store.delete_attachment(handle).unwrap();
        assert!(store.delete_attachment(handle).is_err());
        store.replace_body("new").unwrap();
        store.set_message_class("IPM.Note.SMIME").unwrap();
        store.commit().unwrap();

        assert_eq!(("new".to_owned(), None), store.body());
        assert_eq!(Some("IPM.Note.SMIME".to_owned()), store.message_class());
        assert_eq!(1, store.commits());
    }
}
