//! ROM Engine.
//!
//! High-level read-all and write-all-with-verify loops, built on top of
//! the Flash Command Layer. Owns the in-memory ROM buffer and the
//! block plan derived from CFI geometry.

use log::info;

use crate::error::{Error, Result};
use crate::flash_commands::{BlockRegion, CfiQuery, EXPECTED_DEVICE, EXPECTED_MANUFACTURER};
use crate::mpsse::MpsseEngine;
use crate::transport::Bridge;

/// Upper bound on the in-memory ROM buffer in the current design.
pub const ROM_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Session lifecycle: `Closed -> Opened -> MpsseReady -> Powered ->
/// Identified -> Ready -> (Reading | Writing) -> Ready -> Powered ->
/// Closed`. Any error transitions to `Faulted`, which triggers a
/// best-effort `power_off` + `close` and stops further use of the
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    /// Transport opened but MPSSE bring-up not yet attempted. Not
    /// currently observable through [`CartridgeSession::open`], which
    /// performs transport-open and MPSSE bring-up as one constructor
    /// call; kept in the enum to match the full named lifecycle.
    #[allow(dead_code)]
    Opened,
    MpsseReady,
    Powered,
    Identified,
    Ready,
    Reading,
    Writing,
    Faulted,
}

/// A cartridge programming session: owns the MPSSE engine, the derived
/// chip geometry and the in-memory ROM buffer, and drives the session
/// state machine. Generic over the bridge implementation so the same
/// code path exercises either a real USB bridge or, in tests,
/// `MockBridge`.
pub struct CartridgeSession<B: Bridge> {
    engine: MpsseEngine<B>,
    chip_id: Option<(u8, u8, u8)>,
    cfi: Option<CfiQuery>,
    regions: Vec<BlockRegion>,
    biggest_block_size_bytes: u32,
    state: SessionState,
}

impl<B: Bridge> CartridgeSession<B> {
    /// Brings the bridge up into MPSSE mode and wraps it in a session at
    /// state [`SessionState::MpsseReady`].
    pub fn open(bridge: B) -> Result<Self> {
        let engine = MpsseEngine::bring_up(bridge)?;
        Ok(CartridgeSession {
            engine,
            chip_id: None,
            cfi: None,
            regions: Vec::new(),
            biggest_block_size_bytes: 0,
            state: SessionState::MpsseReady,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Powers the cartridge on (`MpsseReady -> Powered`).
    pub fn power_on(&mut self) -> Result<()> {
        self.run(SessionState::MpsseReady, SessionState::Powered, |s| {
            s.engine.power_on()
        })
    }

    /// Reads chip identity and validates it (`Powered -> Identified`).
    /// The manufacturer/device pair is required to match
    /// [`EXPECTED_MANUFACTURER`]/[`EXPECTED_DEVICE`]; any other pair is
    /// fatal.
    pub fn identify(&mut self) -> Result<()> {
        self.run(SessionState::Powered, SessionState::Identified, |s| {
            let id = s.engine.read_chip_id()?;
            s.engine.exit_to_read()?;
            s.chip_id = Some(id);
            info!(
                "chip identity: manufacturer 0x{:02x}, device 0x{:02x} (expected 0x{:02x}/0x{:02x})",
                id.0, id.1, EXPECTED_MANUFACTURER, EXPECTED_DEVICE
            );
            Ok(())
        })
    }

    /// Reads and validates CFI geometry (`Identified -> Ready`).
    pub fn query_cfi(&mut self) -> Result<()> {
        self.run(SessionState::Identified, SessionState::Ready, |s| {
            let geometry = s.engine.read_cfi()?;
            s.engine.exit_to_read()?;
            info!(
                "CFI geometry: {} bytes ({:.2} MiB), biggest block {} bytes, {} region(s)",
                1u64 << geometry.cfi.device_size,
                (1u64 << geometry.cfi.device_size) as f64 / (1024.0 * 1024.0),
                geometry.biggest_block_size_bytes,
                geometry.regions.len(),
            );
            s.biggest_block_size_bytes = geometry.biggest_block_size_bytes;
            s.regions = geometry.regions;
            s.cfi = Some(geometry.cfi);
            Ok(())
        })
    }

    fn device_size(&self) -> Result<u8> {
        self.cfi
            .as_ref()
            .map(|c| c.device_size)
            .ok_or_else(|| Error::CfiGeometryInvalid("CFI not queried yet".into()))
    }

    /// Reads the full chip image into a freshly allocated buffer
    /// (`Ready -> Reading -> Ready`).
    ///
    /// `total = 1 << device_size`, `block = biggest_block_size_bytes`;
    /// `total / block` contiguous blocks are read in sequence, progress
    /// logged per block.
    pub fn read_rom(&mut self) -> Result<Vec<u8>> {
        let device_size = self.device_size()?;
        let total = 1usize << device_size;
        if total > ROM_BUFFER_SIZE {
            return Err(Error::CfiGeometryInvalid(format!(
                "chip size {} exceeds the {} byte ROM buffer",
                total, ROM_BUFFER_SIZE
            )));
        }
        let block = self.biggest_block_size_bytes as usize;
        let mut rom = vec![0u8; total];

        let result = self.run(SessionState::Ready, SessionState::Ready, |s| {
            s.state = SessionState::Reading;
            let block_count = total / block;
            for i in 0..block_count {
                let addr = (i * block) as u32;
                let window = &mut rom[i * block..(i + 1) * block];
                s.engine.read_flash(addr, window, true)?;
                info!("read block {}/{} ({} bytes)", i + 1, block_count, block);
            }
            Ok(())
        });

        result.map(|()| rom)
    }

    /// Programs `src` into the chip, verifying every block as it is
    /// written (`Ready -> Writing -> Ready`).
    ///
    /// Preconditions: `src.len() <= ROM_BUFFER_SIZE` and
    /// `1 << device_size <= ROM_BUFFER_SIZE`. For each block-aligned
    /// window of up to `block` bytes: erase the sector, program every
    /// byte, then read the window back and compare it byte-exact
    /// against `src`. A verification mismatch aborts the remaining
    /// blocks and reports the first failing address.
    pub fn write_rom(&mut self, src: &[u8]) -> Result<()> {
        let device_size = self.device_size()?;
        let chip_size = 1usize << device_size;
        if src.len() > ROM_BUFFER_SIZE || chip_size > ROM_BUFFER_SIZE {
            return Err(Error::UsageError(format!(
                "image size {} exceeds the {} byte ROM buffer",
                src.len(),
                ROM_BUFFER_SIZE
            )));
        }

        let block = self.biggest_block_size_bytes as usize;

        self.run(SessionState::Ready, SessionState::Ready, |s| {
            s.state = SessionState::Writing;
            let block_count = (src.len() + block - 1) / block;
            let mut scratch = vec![0u8; block];

            for i in 0..block_count {
                let addr = (i * block) as u32;
                let window_start = i * block;
                let window_end = (window_start + block).min(src.len());
                let window = &src[window_start..window_end];

                s.engine.sector_erase(addr)?;

                for (j, &byte) in window.iter().enumerate() {
                    s.engine.program_byte(addr + j as u32, byte)?;
                }
                s.engine.flush()?;
                s.engine.assert_in_buffer_empty()?;

                let readback = &mut scratch[..window.len()];
                s.engine.read_flash(addr, readback, true)?;
                for (j, (&expected, &actual)) in window.iter().zip(readback.iter()).enumerate() {
                    if expected != actual {
                        return Err(Error::VerificationMismatch {
                            address: addr + j as u32,
                            expected,
                            actual,
                        });
                    }
                }

                info!(
                    "wrote + verified block {}/{} ({} bytes)",
                    i + 1,
                    block_count,
                    window.len()
                );
            }
            Ok(())
        })
    }

    /// Powers the cartridge off (`Ready -> Powered -> Closed`, or a
    /// best-effort attempt from any other state on the error path).
    pub fn close(mut self) -> Result<()> {
        self.engine.shutdown()?;
        self.state = SessionState::Closed;
        Ok(())
    }

    /// Runs `body`, checking the precondition state and advancing to
    /// `next` on success; any error transitions the session to
    /// [`SessionState::Faulted`] and attempts a best-effort power-off
    /// before propagating the error.
    fn run<F>(&mut self, expect: SessionState, next: SessionState, body: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        debug_assert_eq!(
            self.state, expect,
            "session state machine violated: expected {:?}, got {:?}",
            expect, self.state
        );
        match body(self) {
            Ok(()) => {
                self.state = next;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Faulted;
                let _ = self.engine.power_off();
                Err(e)
            }
        }
    }
}

impl<B: Bridge> Drop for CartridgeSession<B> {
    /// Best-effort cleanup: if the session is dropped without having
    /// gone through [`Self::close`], power off the cartridge so it is
    /// never left energized.
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            let _ = self.engine.power_off();
        }
    }
}
