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

use crate::support::error::Error;

/// An exit status from BSD `sysexits.h`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Sysexit(pub i32);

pub const EX_USAGE: Sysexit = Sysexit(64);
pub const EX_DATAERR: Sysexit = Sysexit(65);
pub const EX_NOINPUT: Sysexit = Sysexit(66);
pub const EX_UNAVAILABLE: Sysexit = Sysexit(69);
pub const EX_SOFTWARE: Sysexit = Sysexit(70);
pub const EX_CANTCREAT: Sysexit = Sysexit(73);
pub const EX_IOERR: Sysexit = Sysexit(74);
pub const EX_TEMPFAIL: Sysexit = Sysexit(75);
pub const EX_NOPERM: Sysexit = Sysexit(77);
pub const EX_CONFIG: Sysexit = Sysexit(78);

impl Sysexit {
    pub fn exit(self) -> ! {
        std::process::exit(self.0)
    }
}

impl From<&Error> for Sysexit {
    fn from(e: &Error) -> Self {
        match *e {
            Error::Io(..) => EX_IOERR,
            Error::Ssl(..) => EX_SOFTWARE,
            Error::Parse(..) | Error::EncodingOverflow(..) => EX_DATAERR,
            Error::CryptoBackend(..) => EX_UNAVAILABLE,
            Error::Cancelled | Error::Timeout => EX_TEMPFAIL,
            Error::SendBlocked(..) => EX_NOPERM,
            Error::StateViolation { .. }
            | Error::NoSuchMessage
            | Error::MessageGone => EX_SOFTWARE,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_exit_codes() {
        assert_eq!(
            EX_DATAERR,
            Sysexit::from(&Error::Parse("bad boundary".to_owned()))
        );
        assert_eq!(EX_DATAERR, Sysexit::from(&Error::EncodingOverflow(10)));
        assert_eq!(EX_TEMPFAIL, Sysexit::from(&Error::Timeout));
        assert_eq!(
            EX_UNAVAILABLE,
            Sysexit::from(&Error::CryptoBackend("no key".to_owned()))
        );
        assert_eq!(
            EX_IOERR,
            Sysexit::from(&Error::Io(std::io::ErrorKind::NotFound.into()))
        );
    }
}
