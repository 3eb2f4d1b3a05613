//! Round-trips a file over a duplex channel that occasionally flips a bit,
//! proving the retry/resync machinery recovers instead of corrupting data.

use std::fs;
use std::io::{self, Read, Write};
use std::thread::spawn;

use tempfile::tempdir;
use zmodem_engine::session::{self, ReceivePolicy, SendPolicy};

/// Deterministic xorshift64 generator so a failing seed can be reproduced
/// without pulling in a PRNG crate's seeding API.
struct Xorshift64(u64);

impl Xorshift64 {
    fn new(seed: u64) -> Self {
        Xorshift64(if seed == 0 { 0xdead_beef_cafe_f00d } else { seed })
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

/// Wraps a transport and flips one bit in roughly one out of every
/// `corrupt_every` bytes it reads, simulating line noise on a duplex link.
struct LossyTransport<T> {
    inner: T,
    rng: Xorshift64,
    corrupt_every: u64,
}

impl<T> LossyTransport<T> {
    fn new(inner: T, seed: u64, corrupt_every: u64) -> Self {
        LossyTransport {
            inner,
            rng: Xorshift64::new(seed),
            corrupt_every,
        }
    }
}

impl<T: Read> Read for LossyTransport<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        for byte in &mut buf[..n] {
            if self.rng.next() % self.corrupt_every == 0 {
                let bit = (self.rng.next() % 8) as u8;
                *byte ^= 1 << bit;
            }
        }
        Ok(n)
    }
}

impl<T: Write> Write for LossyTransport<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[test]
fn recovers_from_sporadic_bit_flips() {
    let (in_rx, in_tx) = os_pipe::pipe().unwrap();
    let (out_rx, out_tx) = os_pipe::pipe().unwrap();

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

    let src_dir = tempdir().unwrap();
    let src_path = src_dir.path().join("noisy.bin");
    fs::write(&src_path, &payload).unwrap();

    let sender = spawn(move || {
        let mut transport = LossyTransport::new(
            InOut { r: out_rx, w: in_tx },
            0x5eed_1,
            4_000,
        );
        session::send(
            &mut transport,
            &[src_path],
            &SendPolicy::default(),
            |_, _, _, _, _, _| true,
            |_, _, _, _| {},
        )
        .unwrap();
    });

    let mut transport = LossyTransport::new(InOut { r: in_rx, w: out_tx }, 0x5eed_2, 4_000);
    let dest_dir = tempdir().unwrap();

    let total = session::receive(
        &mut transport,
        dest_dir.path(),
        &ReceivePolicy::default(),
        |_, _, _, _, _, _| true,
        |_, _, _, _| {},
    )
    .unwrap();

    sender.join().unwrap();

    assert_eq!(total, payload.len() as u64);
    let received = fs::read(dest_dir.path().join("noisy.bin")).unwrap();
    assert_eq!(received, payload);
}

struct InOut<R: Read, W: Write> {
    r: R,
    w: W,
}

impl<R: Read, W: Write> Read for InOut<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.r.read(buf)
    }
}

impl<R: Read, W: Write> Write for InOut<R, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.w.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}
