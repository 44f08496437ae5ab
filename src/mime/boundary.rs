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

//! Multipart boundary generation.

use std::collections::HashSet;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// The number of random characters in a generated boundary.
const RANDOM_LEN: usize = 24;

/// A source of multipart boundaries.
///
/// Every boundary starts with `=-=`. `=` never appears literally in
/// quoted-printable output and `-` never appears in base64, so a
/// boundary line can never be produced by encoded content.
pub trait BoundaryGen {
    fn next_boundary(&mut self) -> String;
}

/// Boundaries from the thread RNG.
#[derive(Debug, Default)]
pub struct RandomBoundary;

impl BoundaryGen for RandomBoundary {
    fn next_boundary(&mut self) -> String {
        let mut boundary = String::with_capacity(3 + RANDOM_LEN);
        boundary.push_str("=-=");
        boundary.extend(
            rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(RANDOM_LEN),
        );
        boundary
    }
}

/// Wraps another generator to guarantee no boundary repeats within one tree.
pub struct BoundaryPool<'a> {
    inner: &'a mut dyn BoundaryGen,
    used: HashSet<String>,
}

impl<'a> BoundaryPool<'a> {
    pub fn new(inner: &'a mut dyn BoundaryGen) -> Self {
        BoundaryPool {
            inner,
            used: HashSet::new(),
        }
    }
}

impl BoundaryGen for BoundaryPool<'_> {
    fn next_boundary(&mut self) -> String {
        loop {
            let boundary = self.inner.next_boundary();
            if self.used.insert(boundary.clone()) {
                return boundary;
            }
        }
    }
}

/// Deterministic boundaries for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct SequentialBoundary(pub u32);

#[cfg(test)]
impl BoundaryGen for SequentialBoundary {
    fn next_boundary(&mut self) -> String {
        self.0 += 1;
        format!("=-=boundary{}", self.0)
    }
}
