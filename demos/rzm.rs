// SPDX-License-Identifier: MIT OR Apache-2.0
//! `rzm`: a thin CLI wrapper around `zmodem_engine::session::receive`,
//! playing the receiver half of a ZMODEM exchange over stdin/stdout.

use clap::{App, Arg};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use zmodem_engine::session::{self, ReceivePolicy};

mod stdio_transport;
use stdio_transport::StdioTransport;

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Debug
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

fn main() {
    let matches = App::new("rzm")
        .about("Receives files over ZMODEM, reading stdin and writing stdout")
        .arg(
            Arg::with_name("dir")
                .help("Destination directory")
                .index(1),
        )
        .arg(
            Arg::with_name("restricted")
                .long("restricted")
                .help("Reject absolute paths and unlink partial files on abort"),
        )
        .arg(
            Arg::with_name("no-fallback")
                .long("no-fallback")
                .help("Disable the XMODEM/YMODEM fallback when no ZMODEM header ever arrives"),
        )
        .arg(
            Arg::with_name("min-bps")
                .long("min-bps")
                .takes_value(true)
                .help("Abort if throughput falls below this many bytes/sec"),
        )
        .arg(
            Arg::with_name("deadline-secs")
                .long("deadline-secs")
                .takes_value(true)
                .help("Abort the whole session after this many seconds"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log protocol trace to stderr"),
        )
        .get_matches();

    if matches.is_present("verbose") {
        log::set_logger(&StderrLogger).expect("logger already set");
        log::set_max_level(log::LevelFilter::Trace);
    }

    let dir = matches
        .value_of("dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut policy = ReceivePolicy {
        allow_legacy_fallback: !matches.is_present("no-fallback"),
        ..ReceivePolicy::default()
    };
    if matches.is_present("restricted") {
        policy.restricted = true;
    }
    if let Some(bps) = matches.value_of("min-bps").and_then(|s| s.parse().ok()) {
        policy.min_bps = Some(zmodem_engine::MinBps {
            threshold: bps,
            sustained_for: Duration::from_secs(2),
        });
    }
    if let Some(secs) = matches
        .value_of("deadline-secs")
        .and_then(|s| s.parse().ok())
    {
        policy.deadline = Some(Duration::from_secs(secs));
    }

    let mut transport = StdioTransport::new();
    let result = session::receive(
        &mut transport,
        &dir,
        &policy,
        |name, received, total, bps, eta_min, eta_sec| {
            eprintln!(
                "{name}: {received}/{total} bytes ({bps:.0} B/s, eta {eta_min}:{eta_sec:02})"
            );
            true
        },
        |name, error, size, _modtime| match error {
            Some(e) => eprintln!("{name}: failed: {e}"),
            None => eprintln!("{name}: {size} bytes received"),
        },
    );

    match result {
        Ok(total) => {
            eprintln!("done, {total} bytes total");
        }
        Err(e) => {
            eprintln!("rzm: {e}");
            std::process::exit(1);
        }
    }
}
