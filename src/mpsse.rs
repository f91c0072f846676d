//! MPSSE Engine.
//!
//! Stateful controller that brings the bridge into a known MPSSE state,
//! manages the low-byte pin register, and exposes the clocked-byte
//! primitives the Flash Transport layer builds on.

use std::thread::sleep;
use std::time::Duration;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::framed_io::{assert_in_buffer_empty, read_sync, FramedWriter};
use crate::transport::{BitMode, Bridge};

/// USB vendor ID of the supported bridge (FTDI FT2232H-class).
pub const VENDOR_ID: u16 = 0x0403;
/// USB product ID of the supported bridge.
pub const PRODUCT_ID: u16 = 0x6010;

// MPSSE opcodes.
const OP_ENABLE_LOOPBACK: u8 = 0x84;
const OP_DISABLE_LOOPBACK: u8 = 0x85;
const OP_BAD_COMMAND_PROBE: u8 = 0xAB;
const OP_SET_CLOCK_DIVISOR: u8 = 0x86;
const OP_SET_LOW_BYTE: u8 = 0x80;
const OP_CLOCK_BYTES_OUT: u8 = 0x11;
const OP_CLOCK_BYTES_IN: u8 = 0x24;
const OP_FORCE_SEND: u8 = 0x87;

/// MPSSE bad-command response marker: a device that doesn't recognize an
/// opcode echoes `{0xFA, <offending opcode>}`.
const BAD_COMMAND_MARKER: u8 = 0xFA;

/// Low-byte (ADBUS) pin bitmap.
const PIN_CLK: u8 = 1 << 0;
const PIN_DO: u8 = 1 << 1;
#[allow(dead_code)]
const PIN_DI: u8 = 1 << 2;
const PIN_CS: u8 = 1 << 3;
const PIN_POWER_CTRL: u8 = 1 << 4;
#[allow(dead_code)]
const PIN_IS_POWER_ON: u8 = 1 << 7;

/// Direction mask for the low byte: CLK, DO, CS and POWER_CTRL are
/// outputs; everything else is an input.
const LOW_BYTE_DIRECTION_MASK: u8 = PIN_CLK | PIN_DO | PIN_CS | PIN_POWER_CTRL;

const DEFAULT_LATENCY_MS: u8 = 2;
/// `{0x01, 0x00}`: divisor 1, yielding ~3 MHz on a 12 MHz-base part.
const DEFAULT_CLOCK_DIVISOR: [u8; 2] = [0x01, 0x00];

/// Stateful MPSSE controller, generic over the [`Bridge`] it drives.
pub struct MpsseEngine<B: Bridge> {
    bridge: B,
    writer: FramedWriter,
    low_data_bits: u8,
    powered_on: bool,
    mpsse_ready: bool,
}

impl<B: Bridge> MpsseEngine<B> {
    /// Takes ownership of an already-opened bridge and performs the full
    /// bring-up sequence: reset, chunk sizes, latency, flow control,
    /// bitmode, bad-command sync, clock divisor. Every step is fatal on
    /// failure.
    pub fn bring_up(mut bridge: B) -> Result<Self> {
        debug!("mpsse bring-up: resetting bridge");
        bridge.reset()?;
        bridge.set_chunk_sizes(64 * 1024, 64 * 1024)?;
        bridge.set_event_char(false, 0)?;
        bridge.set_error_char(false, 0)?;
        bridge.set_latency(DEFAULT_LATENCY_MS)?;
        bridge.set_flow_control_rts_cts()?;
        bridge.set_bitmode(0x00, BitMode::Reset)?;
        bridge.set_bitmode(0x00, BitMode::Mpsse)?;

        let mut engine = MpsseEngine {
            bridge,
            writer: FramedWriter::new(),
            low_data_bits: 0,
            powered_on: false,
            mpsse_ready: false,
        };

        engine.synchronize()?;
        engine.set_clock_divisor(DEFAULT_CLOCK_DIVISOR)?;
        sleep(Duration::from_millis(10));
        engine.mpsse_ready = true;
        debug!("mpsse bring-up complete");

        Ok(engine)
    }

    /// The deliberate bad-command synchronization probe.
    fn synchronize(&mut self) -> Result<()> {
        trace!("mpsse sync: enabling loopback");
        self.writer.enqueue(OP_ENABLE_LOOPBACK);
        self.writer.flush(&mut self.bridge)?;
        assert_in_buffer_empty(&mut self.bridge)?;

        trace!("mpsse sync: sending bad command probe");
        self.writer.enqueue(OP_BAD_COMMAND_PROBE);
        self.writer.flush(&mut self.bridge)?;

        let mut response = [0u8; 2];
        read_sync(&mut self.bridge, &mut response)?;
        if response != [BAD_COMMAND_MARKER, OP_BAD_COMMAND_PROBE] {
            return Err(Error::MpsseSync(format!(
                "expected {{0xFA, 0xAB}}, got {:02x?}",
                response
            )));
        }

        trace!("mpsse sync: disabling loopback");
        self.writer.enqueue(OP_DISABLE_LOOPBACK);
        self.writer.flush(&mut self.bridge)?;
        assert_in_buffer_empty(&mut self.bridge)?;

        Ok(())
    }

    fn set_clock_divisor(&mut self, divisor: [u8; 2]) -> Result<()> {
        self.writer.enqueue(OP_SET_CLOCK_DIVISOR);
        self.writer.enqueue_slice(&divisor);
        self.writer.flush(&mut self.bridge)
    }

    /// Whether bring-up has completed and MPSSE is ready for commands.
    pub fn is_ready(&self) -> bool {
        self.mpsse_ready
    }

    /// Whether the cartridge is currently powered.
    pub fn is_powered_on(&self) -> bool {
        self.powered_on
    }

    /// Emits `{0x80, value, 0x1B}` and flushes, updating the pin shadow
    /// register.
    pub fn set_low_bits(&mut self, value: u8) -> Result<()> {
        self.writer.enqueue(OP_SET_LOW_BYTE);
        self.writer.enqueue(value);
        self.writer.enqueue(LOW_BYTE_DIRECTION_MASK);
        self.writer.flush(&mut self.bridge)?;
        self.low_data_bits = value;
        Ok(())
    }

    /// Toggles the chip-select bit and sleeps 1 ms to let it settle.
    pub fn set_cs(&mut self, high: bool) -> Result<()> {
        let value = if high {
            self.low_data_bits | PIN_CS
        } else {
            self.low_data_bits & !PIN_CS
        };
        self.set_low_bits(value)?;
        sleep(Duration::from_millis(1));
        Ok(())
    }

    /// Powers the cartridge on: CS high, then clear the active-low
    /// POWER_CTRL bit, then CS low.
    pub fn power_on(&mut self) -> Result<()> {
        if self.powered_on {
            return Ok(());
        }
        self.set_cs(true)?;
        let value = self.low_data_bits & !PIN_POWER_CTRL;
        self.set_low_bits(value)?;
        self.set_cs(false)?;
        self.powered_on = true;
        Ok(())
    }

    /// Powers the cartridge off by setting the active-low POWER_CTRL bit.
    pub fn power_off(&mut self) -> Result<()> {
        let value = self.low_data_bits | PIN_POWER_CTRL;
        self.set_low_bits(value)?;
        self.powered_on = false;
        Ok(())
    }

    /// Encodes the clocked-byte-out opcode (0x11) and enqueues `data`.
    /// Does not flush; callers batch several clocked operations before a
    /// single flush.
    pub fn clock_out(&mut self, data: &[u8]) {
        debug_assert!(!data.is_empty());
        let len_minus_one = (data.len() - 1) as u16;
        self.writer.enqueue(OP_CLOCK_BYTES_OUT);
        self.writer.enqueue_slice(&len_minus_one.to_le_bytes());
        self.writer.enqueue_slice(data);
    }

    /// Encodes the clocked-byte-in opcode (0x24) requesting `n` bytes.
    pub fn clock_in(&mut self, n: usize) {
        debug_assert!(n > 0);
        let len_minus_one = (n - 1) as u16;
        self.writer.enqueue(OP_CLOCK_BYTES_IN);
        self.writer.enqueue_slice(&len_minus_one.to_le_bytes());
    }

    /// Forces the bridge to transmit its current read FIFO upstream.
    pub fn force_send(&mut self) {
        self.writer.enqueue(OP_FORCE_SEND);
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush(&mut self.bridge)
    }

    pub fn assert_in_buffer_empty(&mut self) -> Result<()> {
        assert_in_buffer_empty(&mut self.bridge)
    }

    pub fn read_sync(&mut self, dst: &mut [u8]) -> Result<()> {
        read_sync(&mut self.bridge, dst)
    }

    /// Releases power and closes the underlying bridge. Safe to call
    /// more than once.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.powered_on {
            self.power_off()?;
        }
        self.bridge.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockBridge;
    use std::collections::VecDeque;

    /// Replies to the bad-command probe with the correct marker and
    /// otherwise just echoes (loopback) so the rest of bring-up sails
    /// through.
    fn bringup_bridge() -> MockBridge {
        MockBridge::new(Box::new(|bytes, inbox: &mut VecDeque<u8>| {
            if bytes == [OP_BAD_COMMAND_PROBE] {
                inbox.push_back(BAD_COMMAND_MARKER);
                inbox.push_back(OP_BAD_COMMAND_PROBE);
            }
        }))
    }

    #[test]
    fn bring_up_succeeds_on_valid_sync_response() {
        let bridge = bringup_bridge();
        let engine = MpsseEngine::bring_up(bridge).unwrap();
        assert!(engine.is_ready());
    }

    #[test]
    fn bring_up_fails_on_bad_sync_response() {
        let bridge = MockBridge::new(Box::new(|bytes, inbox: &mut VecDeque<u8>| {
            if bytes == [OP_BAD_COMMAND_PROBE] {
                inbox.push_back(0x00);
                inbox.push_back(OP_BAD_COMMAND_PROBE);
            }
        }));
        let err = MpsseEngine::bring_up(bridge).unwrap_err();
        assert!(matches!(err, Error::MpsseSync(_)));
    }

    #[test]
    fn power_on_then_off_round_trips_shadow_register() {
        let bridge = bringup_bridge();
        let mut engine = MpsseEngine::bring_up(bridge).unwrap();
        engine.power_on().unwrap();
        assert!(engine.is_powered_on());
        engine.power_off().unwrap();
        assert!(!engine.is_powered_on());
    }

    #[test]
    fn clock_out_then_in_encoding() {
        let bridge = bringup_bridge();
        let mut engine = MpsseEngine::bring_up(bridge).unwrap();
        engine.clock_out(&[0xAA, 0xBB, 0xCC]);
        engine.clock_in(4);
        // Just exercise the encode path; wire format is covered by
        // flash_transport.rs's frame-encoding tests.
        engine.flush().unwrap();
    }
}
