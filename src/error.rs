//! Crate-wide error type.
//!
//! Every fallible boundary operation in this crate returns [`Result`].
//! There is no panicking fallback and no silent retry: a failure aborts
//! the current command and the controller (see `main.rs`) is the only
//! place that turns an [`Error`] into a process exit code.

use thiserror::Error;

/// The error kinds produced by this crate, one variant per failure mode
/// the cartridge programming protocol can hit.
#[derive(Debug, Error)]
pub enum Error {
    /// Opening the USB bridge failed.
    #[error("failed to open USB bridge (vid=0x{vendor:04x}, pid=0x{product:04x}): {reason}")]
    TransportOpen {
        vendor: u16,
        product: u16,
        reason: String,
    },

    /// A USB transfer to or from the bridge failed.
    #[error("USB transport I/O error: {0}")]
    TransportIo(String),

    /// The MPSSE bad-command synchronization probe did not see the
    /// expected `{0xFA, 0xAB}` response.
    #[error("MPSSE synchronization failed: {0}")]
    MpsseSync(String),

    /// Bytes showed up in the inbound buffer after a write-only command,
    /// meaning the host and device have drifted out of sync.
    #[error("out of sync: {count} unexpected byte(s) in receive buffer")]
    OutOfSync { count: usize },

    /// The flash chip did not report the manufacturer/device pair this
    /// programmer supports.
    #[error(
        "chip identity mismatch: expected manufacturer 0x{expected_mfr:02x} / device \
         0x{expected_dev:02x}, got 0x{mfr:02x} / 0x{dev:02x}"
    )]
    ChipIdentityMismatch {
        expected_mfr: u8,
        expected_dev: u8,
        mfr: u8,
        dev: u8,
    },

    /// The CFI query structure did not start with the `"QRY"` sentinel.
    #[error("CFI magic mismatch: expected \"QRY\", got {0:?}")]
    CfiMagicMismatch([u8; 3]),

    /// The CFI query structure parsed but described an inconsistent or
    /// unsupported geometry.
    #[error("CFI geometry invalid: {0}")]
    CfiGeometryInvalid(String),

    /// A programmed byte read back differently than it was written.
    #[error(
        "verification mismatch at address 0x{address:06x}: expected 0x{expected:02x}, got \
         0x{actual:02x}"
    )]
    VerificationMismatch {
        address: u32,
        expected: u8,
        actual: u8,
    },

    /// The command line was malformed.
    #[error("usage error: {0}")]
    UsageError(String),

    /// Reading or writing the ROM image file failed.
    #[error("file I/O error: {0}")]
    FileIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
