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

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use log::info;

use super::main::{backend, read_input, BuildSubcommand, SELF};
use crate::crypt::backend::{
    CryptMode, CryptOperation, CryptoBackend, KeyRef, Protocol,
    StaticResolver,
};
use crate::crypt::smime::SmimeBackend;
use crate::engine::{
    serialize_for_send, Engine, MimeBlob, SendDecision, SendEvent, SendInput,
};
use crate::mime::boundary::RandomBoundary;
use crate::mime::model::{AttachKind, AttachmentItem};
use crate::store::MemoryStore;
use crate::support::error::Error;
use crate::support::sysexits::*;
use crate::support::system_config::EngineConfig;

pub(super) fn build(mut config: EngineConfig, cmd: BuildSubcommand) {
    if (cmd.sign || (cmd.encrypt && cmd.recipient.is_empty()))
        && cmd.common.cert.is_none()
    {
        die!(EX_USAGE, "--cert and --key are needed to sign or self-encrypt");
    }

    config.send.smime_opaque_sign |= cmd.opaque;
    // There is no compose window to come back to.
    config.send.force_sync = true;

    let body = text(&cmd.body);
    let html = cmd.html.as_deref().map(text);
    let store = MemoryStore::new()
        .with_subject("mimeseal build")
        .with_body(&body, html.as_deref());

    for path in &cmd.attach {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_owned());
        store.add_attachment(AttachmentItem::user(&name), &read_input(path));
    }

    let result = match operation(&cmd) {
        None => plain(&store, &config),
        Some(op) => {
            let backend = backend(&cmd.common, &cmd.recipient, &[]);
            protect(&store, config, op, Arc::new(backend))
        }
    };

    let data = match result {
        Ok(data) => data,
        Err(e) => die!(Sysexit::from(&e), "Failed to build message: {}", e),
    };

    let written = match cmd.output {
        None => {
            let stdout = io::stdout();
            let mut stdout = stdout.lock();
            stdout.write_all(&data).and_then(|_| stdout.flush())
        }
        Some(ref path) => fs::write(path, &data),
    };
    if let Err(e) = written {
        die!(EX_CANTCREAT, "Failed to write message: {}", e);
    }

    info!("Wrote {} byte message", data.len());
}

fn text(path: &Path) -> String {
    match String::from_utf8(read_input(path)) {
        Ok(text) => text,
        Err(_) => die!(EX_DATAERR, "'{}' is not UTF-8", path.display()),
    }
}

fn operation(cmd: &BuildSubcommand) -> Option<CryptOperation> {
    let mode = match (cmd.sign, cmd.encrypt) {
        (false, false) => return None,
        (true, false) => CryptMode::Sign,
        (false, true) => CryptMode::Encrypt,
        (true, true) => CryptMode::SignAndEncrypt,
    };

    let mut recipients: Vec<KeyRef> = cmd
        .recipient
        .iter()
        .map(|p| KeyRef(p.display().to_string()))
        .collect();
    if recipients.is_empty() {
        recipients.push(KeyRef(SELF.to_owned()));
    }

    Some(CryptOperation {
        mode,
        protocol: Protocol::Smime,
        inline: false,
        recipients,
        signer: if mode.signs() {
            Some(KeyRef(SELF.to_owned()))
        } else {
            None
        },
    })
}

/// The unprotected MIME form of the message in `store`.
fn plain(
    store: &MemoryStore,
    config: &EngineConfig,
) -> Result<Vec<u8>, Error> {
    let input = SendInput::collect(store)?;
    match serialize_for_send(
        &input,
        None,
        &SmimeBackend::new(),
        &config.send,
        &mut RandomBoundary,
    )? {
        MimeBlob::Mime { data, .. } => Ok(data),
        MimeBlob::Inline { .. } => Err(Error::StateViolation {
            operation: "build",
            state: "inline result without protection".to_owned(),
        }),
    }
}

/// Run the message in `store` through one synchronous send pass and return
/// the container it left behind.
fn protect(
    store: &MemoryStore,
    config: EngineConfig,
    op: CryptOperation,
    backend: Arc<dyn CryptoBackend>,
) -> Result<Vec<u8>, Error> {
    let engine = Engine::new(
        config,
        backend,
        Arc::new(StaticResolver(Protocol::Smime)),
    );
    let id = engine.open_message(Box::new(store.clone()));

    for event in vec![
        SendEvent::RequestCrypto(op),
        SendEvent::AfterWrite,
        SendEvent::DoCrypt,
        SendEvent::UpdateMapi,
        SendEvent::UpdateOom,
    ] {
        engine.advance_state(id, event)?;
    }

    if SendDecision::Mime != engine.can_send(id)? {
        return Err(Error::SendBlocked(
            "The message was not protected as MIME".to_owned(),
        ));
    }

    engine.destroy(id)?;
    store
        .attachments()
        .into_iter()
        .find(|&(ref item, _)| AttachKind::MimeBlob == item.kind)
        .map(|(_, data)| data)
        .ok_or_else(|| {
            Error::SendBlocked(
                "The protected MIME container is missing".to_owned(),
            )
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypt::backend::test_backend::{Failure, MockBackend};

    fn store() -> MemoryStore {
        let store = MemoryStore::new()
            .with_subject("hello")
            .with_body("Hello world\r\n", None);
        store.add_attachment(AttachmentItem::user("notes.txt"), b"notes\n");
        store
    }

    fn sign_op() -> CryptOperation {
        CryptOperation {
            mode: CryptMode::Sign,
            protocol: Protocol::Smime,
            inline: false,
            recipients: vec![],
            signer: Some(KeyRef(SELF.to_owned())),
        }
    }

    #[test]
    fn plain_build_is_multipart_mixed() {
        crate::init_test_log();

        let data = plain(&store(), &EngineConfig::default()).unwrap();
        let text = String::from_utf8(data).unwrap();
        assert!(text.starts_with("MIME-Version: 1.0\r\n"));
        assert!(text.contains("multipart/mixed"));
        assert!(text.contains("notes.txt"));
    }

    #[test]
    fn protected_build_is_multipart_signed() {
        crate::init_test_log();

        let mut config = EngineConfig::default();
        config.send.force_sync = true;
        let backend = Arc::new(MockBackend::new());
        let data = protect(&store(), config, sign_op(), backend.clone())
            .unwrap();
        let text = String::from_utf8(data).unwrap();
        assert!(text.contains("multipart/signed"));
        assert!(text.contains("application/pkcs7-signature"));
        assert_eq!(1, backend.calls());
    }

    #[test]
    fn backend_failure_is_reported() {
        crate::init_test_log();

        let backend = Arc::new(MockBackend::new());
        backend.fail_next(Failure::Error("no smartcard".to_owned()));
        let err = protect(
            &store(),
            EngineConfig::default(),
            sign_op(),
            backend,
        )
        .err();
        assert_matches!(Some(Error::CryptoBackend(..)), err);
    }

    #[test]
    fn encrypt_without_recipients_targets_self() {
        let cmd = BuildSubcommand {
            common: Default::default(),
            html: None,
            attach: vec![],
            sign: false,
            encrypt: true,
            recipient: vec![],
            opaque: false,
            output: None,
            body: "-".into(),
        };
        let op = operation(&cmd).unwrap();
        assert_eq!(CryptMode::Encrypt, op.mode);
        assert_eq!(vec![KeyRef(SELF.to_owned())], op.recipients);
        assert_eq!(None, op.signer);
    }
}
