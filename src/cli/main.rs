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
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use openssl::x509::X509;
use structopt::StructOpt;

use crate::crypt::backend::KeyRef;
use crate::crypt::smime::SmimeBackend;
use crate::support::sysexits::*;
use crate::support::system_config::EngineConfig;

/// The name the PEM identity is known by within one run.
pub(super) const SELF: &str = "self";

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Serialise a body and attachments into one MIME message.
    ///
    /// The message is written to standard output unless `--output` is
    /// given. With `--sign` and/or `--encrypt`, the message is protected
    /// with S/MIME using the PEM identity and recipient certificates.
    Build(BuildSubcommand),
    /// Parse a MIME message and show what it contains.
    ///
    /// The "mime-info" descriptor of the message is printed first, one line
    /// per part, followed by the reconstructed body.
    Parse(ParseSubcommand),
}

#[derive(StructOpt, Default)]
pub(super) struct CommonOptions {
    /// Path to `mimeseal.toml`. Built-in defaults are used if not given.
    #[structopt(long, parse(from_os_str))]
    pub(super) config: Option<PathBuf>,

    /// Log at debug level to standard error, ignoring any logging
    /// configuration.
    #[structopt(short, long)]
    pub(super) verbose: bool,

    /// PEM certificate of your own S/MIME identity.
    #[structopt(long, parse(from_os_str), requires = "key")]
    pub(super) cert: Option<PathBuf>,

    /// PEM private key of your own S/MIME identity.
    #[structopt(long, parse(from_os_str), requires = "cert")]
    pub(super) key: Option<PathBuf>,
}

#[derive(StructOpt)]
pub(super) struct BuildSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// HTML form of the body.
    #[structopt(long, parse(from_os_str))]
    pub(super) html: Option<PathBuf>,

    /// Attach this file. Can be passed multiple times.
    #[structopt(short, long, parse(from_os_str), number_of_values(1))]
    pub(super) attach: Vec<PathBuf>,

    /// Sign the message with the identity given by `--cert` and `--key`.
    #[structopt(short, long)]
    pub(super) sign: bool,

    /// Encrypt the message to every `--recipient`, or to yourself if there
    /// are none.
    #[structopt(short, long)]
    pub(super) encrypt: bool,

    /// PEM certificate of a recipient. Can be passed multiple times.
    #[structopt(short, long, parse(from_os_str), number_of_values(1))]
    pub(super) recipient: Vec<PathBuf>,

    /// Produce opaque signed-data instead of `multipart/signed`.
    #[structopt(long)]
    pub(super) opaque: bool,

    /// Write the message here instead of standard output.
    #[structopt(short, long, parse(from_os_str))]
    pub(super) output: Option<PathBuf>,

    /// The plain-text body. "-" reads from stdin.
    #[structopt(parse(from_os_str), default_value = "-")]
    pub(super) body: PathBuf,
}

#[derive(StructOpt)]
pub(super) struct ParseSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// Check signatures.
    #[structopt(long)]
    pub(super) verify: bool,

    /// Decrypt (and check signatures). Requires `--cert` and `--key`.
    #[structopt(long)]
    pub(super) decrypt: bool,

    /// Trust this PEM certificate when checking signatures. Can be passed
    /// multiple times.
    #[structopt(long, parse(from_os_str), number_of_values(1))]
    pub(super) trust: Vec<PathBuf>,

    /// Write every attachment into this directory.
    #[structopt(short = "x", long, parse(from_os_str))]
    pub(super) extract: Option<PathBuf>,

    /// The message to parse. "-" will read from stdin.
    #[structopt(parse(from_os_str), default_value = "-")]
    pub(super) input: PathBuf,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    match cmd {
        Command::Build(cmd) => {
            let config = setup(&cmd.common);
            super::build::build(config, cmd);
        }
        Command::Parse(cmd) => {
            let config = setup(&cmd.common);
            super::parse::parse(config, cmd);
        }
    }
}

/// Load the configuration and start logging.
fn setup(common: &CommonOptions) -> EngineConfig {
    let (config, root) = match common.config {
        None => (EngineConfig::default(), PathBuf::from(".")),
        Some(ref path) => match EngineConfig::load(path) {
            Ok(config) => (
                config,
                path.parent()
                    .map(Path::to_owned)
                    .unwrap_or_else(|| PathBuf::from(".")),
            ),
            Err(e) => die!(EX_CONFIG, "Error in config file: {}", e),
        },
    };

    if common.verbose {
        crate::init_simple_log(log::LevelFilter::Debug);
    } else if let Some(ref logging) = config.logging {
        let log_config_file = root.join(logging);
        if let Err(e) =
            log4rs::init_file(&log_config_file, Default::default())
        {
            die!(
                EX_CONFIG,
                "Failed to load '{}': {}",
                log_config_file.display(),
                e
            );
        }
    } else {
        crate::init_simple_log(log::LevelFilter::Warn);
    }

    config
}

/// Read a file named on the command line, with "-" meaning stdin.
pub(super) fn read_input(path: &Path) -> Vec<u8> {
    let mut data = Vec::new();
    let result = if Path::new("-") == path {
        io::stdin().read_to_end(&mut data)
    } else {
        fs::File::open(path).and_then(|mut f| f.read_to_end(&mut data))
    };

    if let Err(e) = result {
        die!(EX_NOINPUT, "Error reading '{}': {}", path.display(), e);
    }
    data
}

fn read_cert(path: &Path) -> X509 {
    match X509::from_pem(&read_input(path)) {
        Ok(cert) => cert,
        Err(e) => die!(
            EX_DATAERR,
            "'{}' is not a PEM certificate: {}",
            path.display(),
            e
        ),
    }
}

/// Build the S/MIME backend described by the command line.
///
/// Recipient and trusted certificates are named by their path.
pub(super) fn backend(
    common: &CommonOptions,
    recipients: &[PathBuf],
    trusted: &[PathBuf],
) -> SmimeBackend {
    let mut backend = SmimeBackend::new();

    if let (Some(cert), Some(key)) = (&common.cert, &common.key) {
        backend = match backend.with_pem_identity(
            KeyRef(SELF.to_owned()),
            &read_input(cert),
            &read_input(key),
        ) {
            Ok(backend) => backend,
            Err(e) => die!(EX_DATAERR, "Bad S/MIME identity: {}", e),
        };
    }

    for path in recipients {
        backend = backend.with_recipient(
            KeyRef(path.display().to_string()),
            read_cert(path),
        );
    }

    for path in trusted {
        backend = backend.with_trusted(read_cert(path));
    }

    backend
}
