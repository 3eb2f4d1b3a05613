// SPDX-License-Identifier: MIT OR Apache-2.0
//! `szm`: a thin CLI wrapper around `zmodem_engine::session::send`, playing
//! the sender half of a ZMODEM exchange over stdin/stdout.

use clap::{App, Arg};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use zmodem_engine::session::{self, SendPolicy};

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
    let matches = App::new("szm")
        .about("Sends files over ZMODEM, reading stdin and writing stdout")
        .arg(
            Arg::with_name("file")
                .help("Files to send")
                .multiple(true)
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("deadline-secs")
                .long("deadline-secs")
                .takes_value(true)
                .help("Abort the whole session after this many seconds"),
        )
        .arg(
            Arg::with_name("block-size")
                .long("block-size")
                .takes_value(true)
                .help("Maximum data subpacket size"),
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

    let files: Vec<PathBuf> = matches
        .values_of("file")
        .expect("file is required")
        .map(PathBuf::from)
        .collect();

    let mut policy = SendPolicy::default();
    if let Some(secs) = matches
        .value_of("deadline-secs")
        .and_then(|s| s.parse().ok())
    {
        policy.deadline = Some(Duration::from_secs(secs));
    }
    if let Some(blklen) = matches.value_of("block-size").and_then(|s| s.parse().ok()) {
        policy.max_blklen = blklen;
    }

    let mut transport = StdioTransport::new();
    let result = session::send(
        &mut transport,
        &files,
        &policy,
        |name, sent, total, bps, eta_min, eta_sec| {
            eprintln!("{name}: {sent}/{total} bytes ({bps:.0} B/s, eta {eta_min}:{eta_sec:02})");
            true
        },
        |name, error, size, _modtime| match error {
            Some(e) => eprintln!("{name}: failed: {e}"),
            None => eprintln!("{name}: {size} bytes sent"),
        },
    );

    match result {
        Ok(total) => {
            eprintln!("done, {total} bytes total");
        }
        Err(e) => {
            eprintln!("szm: {e}");
            std::process::exit(1);
        }
    }
}
