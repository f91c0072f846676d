//! Transport Adapter: a thin seam over the USB bridge driver.
//!
//! [`Bridge`] is the contract the rest of the crate programs against,
//! abstracting the USB bridge behind a small trait the way a
//! hardware-independent driver abstracts its transport. [`FtdiBridge`]
//! is the concrete implementation for the real FT2232H-class bridge
//! (vendor 0x0403 / product 0x6010), built directly on `nusb`. The
//! `mock` submodule provides a software stand-in used by the test suite.

use std::time::Duration;

use nusb::transfer::{Control, ControlType, Recipient};

use crate::error::{Error, Result};

/// Bitmode argument to `SIO_SET_BITMODE_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitMode {
    Reset = 0x00,
    Mpsse = 0x02,
}

/// The Transport Adapter contract: everything the MPSSE engine needs
/// from the USB bridge, and nothing more.
pub trait Bridge {
    /// Resets the bridge's internal state (`ftdi_usb_reset` equivalent).
    fn reset(&mut self) -> Result<()>;

    /// Sets the chunk sizes the adapter uses to split reads/writes.
    fn set_chunk_sizes(&mut self, read: usize, write: usize) -> Result<()>;

    /// Disables the special event character.
    fn set_event_char(&mut self, enable: bool, value: u8) -> Result<()>;

    /// Disables the special error character.
    fn set_error_char(&mut self, enable: bool, value: u8) -> Result<()>;

    /// Sets the latency timer, in milliseconds.
    fn set_latency(&mut self, ms: u8) -> Result<()>;

    /// Enables RTS/CTS hardware flow control.
    fn set_flow_control_rts_cts(&mut self) -> Result<()>;

    /// Sets the bridge's bit-mode (pin direction mask plus mode).
    fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<()>;

    /// Transmits `bytes` in full.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Reads whatever is currently available, up to `dst.len()` bytes,
    /// without blocking past the latency window. Returns the number of
    /// bytes actually placed into `dst`.
    fn read(&mut self, dst: &mut [u8]) -> Result<usize>;

    /// The currently configured latency timer, in milliseconds. Used by
    /// the framed writer to size its post-flush settling sleep.
    fn latency_ms(&self) -> u8;

    /// Releases the USB handle.
    fn close(&mut self) -> Result<()>;
}

// FTDI vendor control requests (see the FT232R/FT2232 programmer's
// guide). Values grounded on the FTDI-bridge reference driver in the
// retrieval pack, which implements the same requests over `nusb`.
const SIO_RESET_REQUEST: u8 = 0x00;
const SIO_RESET_SIO: u16 = 0x00;
const SIO_SET_EVENT_CHAR_REQUEST: u8 = 0x06;
const SIO_SET_ERROR_CHAR_REQUEST: u8 = 0x07;
const SIO_SET_LATENCY_TIMER_REQUEST: u8 = 0x09;
const SIO_SET_FLOW_CTRL_REQUEST: u8 = 0x02;
const SIO_RTS_CTS_HS: u16 = 0x0100;
const SIO_SET_BITMODE_REQUEST: u8 = 0x0B;

const FTDI_INTERFACE_INDEX: u16 = 1; // Interface A
const EP_WRITE: u8 = 0x02;
const EP_READ: u8 = 0x81;

/// Concrete [`Bridge`] driving a real FT2232H-class bridge over `nusb`.
pub struct FtdiBridge {
    interface: nusb::Interface,
    read_chunk_size: usize,
    write_chunk_size: usize,
    latency_ms: u8,
}

impl FtdiBridge {
    /// Opens the first USB device matching `vendor`/`product` and claims
    /// its first interface.
    ///
    /// Mirrors `cart_comm.cpp`'s `openDeviceAndSetupMPSSE`: only the
    /// "find and open" half lives here, the MPSSE bring-up sequence
    /// itself belongs to [`crate::mpsse::MpsseEngine::bring_up`].
    pub fn open(vendor: u16, product: u16) -> Result<Self> {
        let info = nusb::list_devices()
            .map_err(|e| Error::TransportOpen {
                vendor,
                product,
                reason: e.to_string(),
            })?
            .find(|d| d.vendor_id() == vendor && d.product_id() == product)
            .ok_or_else(|| Error::TransportOpen {
                vendor,
                product,
                reason: "no matching USB device found".into(),
            })?;

        let device = info.open().map_err(|e| Error::TransportOpen {
            vendor,
            product,
            reason: e.to_string(),
        })?;
        let interface = device.claim_interface(0).map_err(|e| Error::TransportOpen {
            vendor,
            product,
            reason: e.to_string(),
        })?;

        Ok(FtdiBridge {
            interface,
            read_chunk_size: 64 * 1024,
            write_chunk_size: 64 * 1024,
            latency_ms: 16,
        })
    }

    fn sio_write(&mut self, request: u8, value: u16) -> Result<()> {
        self.interface
            .control_out_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index: FTDI_INTERFACE_INDEX,
                },
                &[],
                Duration::from_secs(1),
            )
            .map_err(|e| Error::TransportIo(e.to_string()))?;
        Ok(())
    }
}

impl Bridge for FtdiBridge {
    fn reset(&mut self) -> Result<()> {
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_SIO)
    }

    fn set_chunk_sizes(&mut self, read: usize, write: usize) -> Result<()> {
        self.read_chunk_size = read;
        self.write_chunk_size = write;
        Ok(())
    }

    fn set_event_char(&mut self, enable: bool, value: u8) -> Result<()> {
        let v = u16::from_le_bytes([value, enable as u8]);
        self.sio_write(SIO_SET_EVENT_CHAR_REQUEST, v)
    }

    fn set_error_char(&mut self, enable: bool, value: u8) -> Result<()> {
        let v = u16::from_le_bytes([value, enable as u8]);
        self.sio_write(SIO_SET_ERROR_CHAR_REQUEST, v)
    }

    fn set_latency(&mut self, ms: u8) -> Result<()> {
        self.sio_write(SIO_SET_LATENCY_TIMER_REQUEST, ms as u16)?;
        self.latency_ms = ms;
        Ok(())
    }

    fn set_flow_control_rts_cts(&mut self) -> Result<()> {
        self.sio_write(SIO_SET_FLOW_CTRL_REQUEST, SIO_RTS_CTS_HS)
    }

    fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<()> {
        let v = u16::from_le_bytes([mask, mode as u8]);
        self.sio_write(SIO_SET_BITMODE_REQUEST, v)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        for chunk in bytes.chunks(self.write_chunk_size) {
            futures_lite::future::block_on(self.interface.bulk_out(EP_WRITE, chunk.to_vec()))
                .into_result()
                .map_err(|e| Error::TransportIo(e.to_string()))?;
        }
        Ok(())
    }

    fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let request_len = dst.len().min(self.read_chunk_size) + 2;
        let data = futures_lite::future::block_on(
            self.interface
                .bulk_in(EP_READ, nusb::transfer::RequestBuffer::new(request_len)),
        )
        .into_result()
        .map_err(|e| Error::TransportIo(e.to_string()))?;

        // Every bulk-IN packet from an FTDI bridge is prefixed with a
        // 2-byte modem status header; strip it before handing payload
        // bytes back to the caller.
        if data.len() <= 2 {
            return Ok(0);
        }
        let payload = &data[2..];
        let n = payload.len().min(dst.len());
        dst[..n].copy_from_slice(&payload[..n]);
        Ok(n)
    }

    fn latency_ms(&self) -> u8 {
        self.latency_ms
    }

    fn close(&mut self) -> Result<()> {
        // Dropping `nusb::Interface` releases the USB handle; nothing
        // further to do here.
        Ok(())
    }
}
