//! Framed Writer / Synchronous Reader.
//!
//! A fixed-capacity outbound staging buffer with append-and-flush
//! semantics, plus the two read-side helpers every synchronous command
//! needs: draining whatever the bridge has buffered, and blocking until
//! an exact byte count has arrived.

use std::thread::sleep;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::Bridge;

/// Outbound staging buffer capacity: a fixed 4 MiB buffer for outbound
/// MPSSE bytes.
pub const OUT_BUFFER_CAPACITY: usize = 4 * 1024 * 1024;

/// Scratch size used while draining unexpected inbound bytes.
const DRAIN_SCRATCH_SIZE: usize = 1024;

/// An append-only byte queue that batches MPSSE opcodes until [`flush`]
/// sends them all in one USB write.
///
/// The reference implementation's `outBufferPos` is an `int` index into a
/// fixed `uint8_t[OUT_BUFFER_SIZE]` array; here the buffer just grows a
/// `Vec` up to the same capacity, which keeps `out_buffer_pos` (`len()`)
/// and the 4 MiB invariant identical without unsafe fixed-size plumbing.
pub struct FramedWriter {
    buf: Vec<u8>,
}

impl FramedWriter {
    pub fn new() -> Self {
        FramedWriter {
            buf: Vec::with_capacity(OUT_BUFFER_CAPACITY),
        }
    }

    /// Number of bytes currently staged.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Appends a single byte to the staging buffer.
    pub fn enqueue(&mut self, byte: u8) {
        debug_assert!(
            self.buf.len() < OUT_BUFFER_CAPACITY,
            "out_buffer_pos must never exceed the 4 MiB staging capacity"
        );
        self.buf.push(byte);
    }

    /// Appends a sequence of bytes to the staging buffer.
    pub fn enqueue_slice(&mut self, bytes: &[u8]) {
        debug_assert!(
            self.buf.len() + bytes.len() <= OUT_BUFFER_CAPACITY,
            "out_buffer_pos must never exceed the 4 MiB staging capacity"
        );
        self.buf.extend_from_slice(bytes);
    }

    /// Writes the whole queue through `bridge`, sleeps one latency tick
    /// plus 1 ms to let the chip settle, and empties the queue.
    ///
    /// A flush with nothing staged is a no-op: callers are expected to
    /// only call this when there's something to send, but nothing bad
    /// happens if they don't.
    pub fn flush(&mut self, bridge: &mut impl Bridge) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        bridge.write(&self.buf)?;
        sleep(Duration::from_millis(bridge.latency_ms() as u64 + 1));
        self.buf.clear();
        Ok(())
    }
}

impl Default for FramedWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Performs non-blocking reads of up to 1 KiB into a scratch buffer until
/// a read returns zero bytes, returning the total number of bytes
/// drained.
///
/// The running total is a `usize`, wide enough for the 4 MiB staging
/// buffer; a narrower accumulator would silently wrap on a large drain.
pub fn drain_in(bridge: &mut impl Bridge) -> Result<usize> {
    let mut scratch = [0u8; DRAIN_SCRATCH_SIZE];
    let mut total = 0usize;
    loop {
        let n = bridge.read(&mut scratch)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Asserts that the inbound buffer is empty after a write-only command;
/// any drained byte is a fatal out-of-sync error.
pub fn assert_in_buffer_empty(bridge: &mut impl Bridge) -> Result<()> {
    let count = drain_in(bridge)?;
    if count != 0 {
        return Err(Error::OutOfSync { count });
    }
    Ok(())
}

/// Loops raw reads, advancing a cursor, until exactly `dst.len()` bytes
/// have arrived. No timeout beyond the transport's own: a stuck device
/// hangs here, which is acceptable for a CLI tool.
pub fn read_sync(bridge: &mut impl Bridge, dst: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < dst.len() {
        let n = bridge.read(&mut dst[filled..])?;
        filled += n;
    }
    Ok(())
}
