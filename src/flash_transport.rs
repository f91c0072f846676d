//! Flash Transport.
//!
//! Translates logical "write address/data" and "read address → data"
//! into MPSSE byte streams using the cartridge-specific 32-bit frame
//! layout: 1 write flag bit, 21 address bits, 8 data bits.

use crate::bitrev::reverse_bits;
use crate::error::Result;
use crate::mpsse::MpsseEngine;
use crate::transport::Bridge;

/// The bridge's receive FIFO is small; requests larger than this wedge
/// the write channel, so reads are always split into chunks at most this
/// size.
const MAX_READ_CHUNK: usize = 256;

/// Write-flag bit set in byte 0 of a write frame.
const WRITE_FLAG: u8 = 0x80;
/// Mask applied to the high address byte (21-bit address space).
const HIGH_ADDR_MASK: u32 = 0x1F;

impl<B: Bridge> MpsseEngine<B> {
    /// Enqueues the 4-byte write frame for `addr`/`data`:
    /// `{(addr>>16 & 0x1F) | 0x80, (addr>>8)&0xFF, addr&0xFF, data}`.
    ///
    /// Does not flush; callers batch a full command sequence (unlock
    /// cycles plus the command epilogue) before flushing once.
    pub fn enqueue_flash_write(&mut self, addr: u32, data: u8) {
        let frame = [
            (((addr >> 16) & HIGH_ADDR_MASK) as u8) | WRITE_FLAG,
            ((addr >> 8) & 0xFF) as u8,
            (addr & 0xFF) as u8,
            data,
        ];
        self.clock_out(&frame);
    }

    /// Enqueues the 3-byte read-address frame for `addr`, with the write
    /// flag clear: `{(addr>>16)&0x1F, (addr>>8)&0xFF, addr&0xFF}`.
    fn enqueue_flash_read_addr(&mut self, addr: u32) {
        let frame = [
            (((addr >> 16) & HIGH_ADDR_MASK) as u8),
            ((addr >> 8) & 0xFF) as u8,
            (addr & 0xFF) as u8,
        ];
        self.clock_out(&frame);
    }

    /// Reads `n` bytes starting at `addr` into `dst`, bracketing the
    /// whole burst with chip-select, splitting the burst into chunks of
    /// at most 256 bytes (one MPSSE round trip per chunk), and
    /// optionally bit-reversing each received byte to compensate for the
    /// cartridge's data-bus wiring.
    pub fn read_flash(
        &mut self,
        addr: u32,
        dst: &mut [u8],
        reverse: bool,
    ) -> Result<()> {
        assert!(dst.len() <= (1 << 21));

        self.set_cs(false)?;

        let mut offset = 0usize;
        while offset < dst.len() {
            let chunk_len = (dst.len() - offset).min(MAX_READ_CHUNK);

            for i in 0..chunk_len {
                self.enqueue_flash_read_addr(addr + (offset + i) as u32);
                self.clock_in(1);
            }
            self.force_send();
            self.flush()?;

            let chunk = &mut dst[offset..offset + chunk_len];
            self.read_sync(chunk)?;
            if reverse {
                for byte in chunk.iter_mut() {
                    *byte = reverse_bits(*byte);
                }
            }

            offset += chunk_len;
        }

        self.set_cs(true)?;
        Ok(())
    }
}
