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

//! Sinks which pass MIME output through a crypto backend filter.

use super::backend::{Filter, FilterOutcome};
use crate::mime::sink::Sink;
use crate::support::error::Error;

/// A sink that writes everything to `real` and also feeds it to a signing
/// filter.
///
/// Finishing the sink finishes the filter but not `real`, since the caller
/// still has the signature to append.
pub struct SigningSink<S> {
    real: S,
    filter: Option<Box<dyn Filter>>,
    outcome: Option<FilterOutcome>,
}

impl<S: Sink> SigningSink<S> {
    pub fn new(real: S, filter: Box<dyn Filter>) -> Self {
        SigningSink {
            real,
            filter: Some(filter),
            outcome: None,
        }
    }

    /// Return the real sink and the signing result.
    ///
    /// Fails if the sink was never finished.
    pub fn into_parts(self) -> Result<(S, FilterOutcome), Error> {
        match self.outcome {
            Some(outcome) => Ok((self.real, outcome)),
            None => Err(unfinished("SigningSink::into_parts")),
        }
    }
}

impl<S: Sink> Sink for SigningSink<S> {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        let filter = self
            .filter
            .as_mut()
            .ok_or_else(|| unfinished("SigningSink::write"))?;
        self.real.write(data)?;
        filter.write(data)
    }

    fn finish(&mut self) -> Result<(), Error> {
        if let Some(filter) = self.filter.take() {
            self.outcome = Some(filter.finish()?);
        }
        Ok(())
    }
}

/// A sink that hands everything directly to a filter whose output replaces
/// the content, such as encryption or opaque signing.
///
/// Nothing is retained locally; whatever the filter buffers is the filter's
/// business.
pub struct FilterSink {
    filter: Option<Box<dyn Filter>>,
    outcome: Option<FilterOutcome>,
}

impl FilterSink {
    pub fn new(filter: Box<dyn Filter>) -> Self {
        FilterSink {
            filter: Some(filter),
            outcome: None,
        }
    }

    pub fn into_outcome(self) -> Result<FilterOutcome, Error> {
        self.outcome
            .ok_or_else(|| unfinished("FilterSink::into_outcome"))
    }
}

impl Sink for FilterSink {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        self.filter
            .as_mut()
            .ok_or_else(|| unfinished("FilterSink::write"))?
            .write(data)
    }

    fn finish(&mut self) -> Result<(), Error> {
        if let Some(filter) = self.filter.take() {
            self.outcome = Some(filter.finish()?);
        }
        Ok(())
    }
}

fn unfinished(operation: &'static str) -> Error {
    Error::StateViolation {
        operation,
        state: "filter finished".to_owned(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypt::backend::test_backend::MockBackend;
    use crate::crypt::backend::{
        run_filter, CryptoBackend, KeyRef, Protocol, SignStyle,
    };
    use crate::mime::sink::MemorySink;

    #[test]
    fn signing_sink_mirrors_and_signs() {
        let backend = MockBackend::new();
        let signer = KeyRef("alice".to_owned());
        let filter = backend
            .sign_start(Protocol::OpenPgp, &signer, SignStyle::Detached)
            .unwrap();

        let mut sink = SigningSink::new(MemorySink::new(), filter);
        sink.write(b"Content-Type: text/plain\r\n\r\n").unwrap();
        sink.write(b"").unwrap();
        sink.write(b"Hello").unwrap();
        let unfinished = SigningSink::new(
            MemorySink::new(),
            backend
                .sign_start(Protocol::OpenPgp, &signer, SignStyle::Detached)
                .unwrap(),
        );
        assert_matches!(
            Err(Error::StateViolation { .. }),
            unfinished.into_parts()
        );
        sink.finish().unwrap();
        assert_matches!(
            Err(Error::StateViolation { .. }),
            sink.write(b"more")
        );

        let (real, outcome) = sink.into_parts().unwrap();
        let signed = real.into_inner();
        assert_eq!(
            b"Content-Type: text/plain\r\n\r\nHello" as &[u8],
            &signed[..]
        );
        assert_eq!(Some("pgp-sha256"), outcome.micalg.as_deref());

        let verified = run_filter(
            backend
                .verify_start(Protocol::OpenPgp, Some(&outcome.output))
                .unwrap(),
            &signed,
        )
        .unwrap();
        assert!(verified.verification.unwrap().valid);
    }

    #[test]
    fn encrypting_sink_forwards() {
        let backend = MockBackend::new();
        let recipients = [KeyRef("bob".to_owned())];
        let filter = backend
            .encrypt_start(Protocol::Smime, &recipients, None)
            .unwrap();

        let mut sink = FilterSink::new(filter);
        sink.write(b"part one, ").unwrap();
        sink.write(b"part two").unwrap();
        sink.finish().unwrap();
        let outcome = sink.into_outcome().unwrap();

        let decrypted = run_filter(
            backend.decrypt_start(Protocol::Smime).unwrap(),
            &outcome.output,
        )
        .unwrap();
        assert_eq!(b"part one, part two" as &[u8], &decrypted.output[..]);
        assert_eq!(
            0,
            backend
                .counters
                .active
                .load(std::sync::atomic::Ordering::SeqCst)
        );
    }

    #[test]
    fn filter_sink_signs_opaquely() {
        let backend = MockBackend::new();
        let signer = KeyRef("alice".to_owned());
        let filter = backend
            .sign_start(Protocol::Smime, &signer, SignStyle::Opaque)
            .unwrap();

        let mut sink = FilterSink::new(filter);
        sink.write(b"Content-Type: text/plain\r\n\r\nHi").unwrap();
        sink.finish().unwrap();
        let outcome = sink.into_outcome().unwrap();

        let verified = run_filter(
            backend.verify_start(Protocol::Smime, None).unwrap(),
            &outcome.output,
        )
        .unwrap();
        assert!(verified.verification.unwrap().valid);
        assert_eq!(
            b"Content-Type: text/plain\r\n\r\nHi" as &[u8],
            &verified.output[..]
        );
    }

    #[test]
    fn filter_failure_propagates() {
        use crate::crypt::backend::test_backend::Failure;

        let backend = MockBackend::new();
        backend.fail_next(Failure::Cancel);
        let recipients = [KeyRef("bob".to_owned())];
        let filter = backend
            .encrypt_start(Protocol::OpenPgp, &recipients, None)
            .unwrap();
        let mut sink = FilterSink::new(filter);
        sink.write(b"data").unwrap();
        assert_matches!(Err(Error::Cancelled), sink.finish());
    }
}
