// SPDX-License-Identifier: MIT OR Apache-2.0
//! Combines the process's stdin and stdout into one `Read + Write`
//! transport, the shape both `rzm` and `szm` drive the engine over.

use std::io::{self, Read, Stdin, Stdout, Write};

pub struct StdioTransport {
    stdin: Stdin,
    stdout: Stdout,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self {
            stdin: io::stdin(),
            stdout: io::stdout(),
        }
    }
}

impl Read for StdioTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdin.read(buf)
    }
}

impl Write for StdioTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stdout.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdout.flush()
    }
}
