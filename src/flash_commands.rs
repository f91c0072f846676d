//! Flash Command Layer.
//!
//! Issues SST unlock sequences followed by command opcodes, and parses
//! the CFI Query structure and Erase-Block-Region table. Field-by-field
//! parsing is used throughout (never a packed-struct cast), since target
//! platforms may not permit unaligned struct overlays.

use std::convert::TryInto;

use log::info;

use crate::bitrev::reverse_bits;
use crate::error::{Error, Result};
use crate::mpsse::MpsseEngine;
use crate::transport::Bridge;

const UNLOCK_ADDR_1: u32 = 0xAAA;
const UNLOCK_ADDR_2: u32 = 0x555;
const UNLOCK_BYTE_1: u8 = 0xAA;
const UNLOCK_BYTE_2: u8 = 0x55;

const CMD_CHIP_ID: u8 = 0x90;
const CMD_CFI_QUERY: u8 = 0x98;
const CMD_EXIT_TO_READ: u8 = 0xF0;
const CMD_PROGRAM: u8 = 0xA0;
const CMD_ERASE_SETUP: u8 = 0x80;
const CMD_SECTOR_ERASE: u8 = 0x30;

/// Required manufacturer/device identity for the supported part.
pub const EXPECTED_MANUFACTURER: u8 = 0xBF;
pub const EXPECTED_DEVICE: u8 = 0xC8;

const CFI_STRUCT_OFFSET: u32 = 0x10;
const CFI_REGION_TABLE_OFFSET: u32 = 0x2D;

/// CFI Query structure, field-by-field.
#[derive(Debug, Clone)]
pub struct CfiQuery {
    pub magic: [u8; 3],
    pub control_interface_id: u16,
    pub primary_ext_table: u16,
    pub alt_control_id: u16,
    pub alt_ext_table: u16,
    pub vcc_min: u8,
    pub vcc_max: u8,
    pub vpp_min: u8,
    pub vpp_max: u8,
    pub typical_timeouts: [u8; 8],
    pub device_size: u8,
    pub interface_code: u16,
    pub max_multibyte_program: u16,
    pub num_erase_block_regions: u8,
}

/// Size of the CFI Query structure on the wire, in bytes.
const CFI_QUERY_WIRE_SIZE: usize = 29;

impl CfiQuery {
    /// Parses a [`CfiQuery`] from a raw byte slice, field by field.
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < CFI_QUERY_WIRE_SIZE {
            return Err(Error::CfiGeometryInvalid(format!(
                "CFI buffer too short: got {} bytes, need {}",
                buf.len(),
                CFI_QUERY_WIRE_SIZE
            )));
        }

        let magic = [buf[0], buf[1], buf[2]];
        if &magic != b"QRY" {
            return Err(Error::CfiMagicMismatch(magic));
        }

        let u16_le = |hi: usize| u16::from_le_bytes([buf[hi], buf[hi + 1]]);

        Ok(CfiQuery {
            magic,
            control_interface_id: u16_le(3),
            primary_ext_table: u16_le(5),
            alt_control_id: u16_le(7),
            alt_ext_table: u16_le(9),
            vcc_min: buf[11],
            vcc_max: buf[12],
            vpp_min: buf[13],
            vpp_max: buf[14],
            typical_timeouts: buf[15..23].try_into().unwrap(),
            device_size: buf[23],
            interface_code: u16_le(24),
            max_multibyte_program: u16_le(26),
            num_erase_block_regions: buf[28],
        })
    }
}

/// Erase block region table entry.
#[derive(Debug, Clone, Copy)]
pub struct BlockRegion {
    pub n_blocks_minus_one: u16,
    pub block_size_code: u16,
}

impl BlockRegion {
    /// Block size in bytes: `code << 8`.
    pub fn size_bytes(&self) -> u32 {
        (self.block_size_code as u32) << 8
    }

    /// Number of blocks in this region.
    pub fn block_count(&self) -> u32 {
        self.n_blocks_minus_one as u32 + 1
    }

    fn parse(buf: &[u8]) -> Self {
        BlockRegion {
            n_blocks_minus_one: u16::from_le_bytes([buf[0], buf[1]]),
            block_size_code: u16::from_le_bytes([buf[2], buf[3]]),
        }
    }
}

/// Geometry derived from a parsed CFI structure plus block region table.
pub struct FlashGeometry {
    pub cfi: CfiQuery,
    pub regions: Vec<BlockRegion>,
    pub biggest_block_size_bytes: u32,
}

impl<B: Bridge> MpsseEngine<B> {
    /// Enqueues the two-cycle SST unlock sequence:
    /// `{0xAAA<-0xAA, 0x555<-0x55}`. Every command sequence in this
    /// layer begins with exactly this.
    fn enqueue_unlock(&mut self) {
        self.enqueue_flash_write(UNLOCK_ADDR_1, UNLOCK_BYTE_1);
        self.enqueue_flash_write(UNLOCK_ADDR_2, UNLOCK_BYTE_2);
    }

    /// Reads the 3-byte chip identity (manufacturer, device, extra byte)
    /// and validates it against the supported part. Must be followed by
    /// [`Self::exit_to_read`] before any further read-array operation.
    pub fn read_chip_id(&mut self) -> Result<(u8, u8, u8)> {
        self.enqueue_unlock();
        self.enqueue_flash_write(UNLOCK_ADDR_1, CMD_CHIP_ID);
        self.flush()?;
        self.assert_in_buffer_empty()?;
        std::thread::sleep(std::time::Duration::from_millis(1));

        let mut id = [0u8; 3];
        self.read_flash(0x00, &mut id, true)?;
        let (mfr, dev, extra) = (id[0], id[1], id[2]);

        if mfr != EXPECTED_MANUFACTURER || dev != EXPECTED_DEVICE {
            return Err(Error::ChipIdentityMismatch {
                expected_mfr: EXPECTED_MANUFACTURER,
                expected_dev: EXPECTED_DEVICE,
                mfr,
                dev,
            });
        }

        Ok((mfr, dev, extra))
    }

    /// Enters CFI query mode, reads and validates the CFI Query struct
    /// and its erase-block-region table, and computes
    /// `biggest_block_size_bytes`. Must be followed by
    /// [`Self::exit_to_read`].
    pub fn read_cfi(&mut self) -> Result<FlashGeometry> {
        self.enqueue_unlock();
        self.enqueue_flash_write(UNLOCK_ADDR_1, CMD_CFI_QUERY);
        self.flush()?;
        self.assert_in_buffer_empty()?;
        std::thread::sleep(std::time::Duration::from_millis(1));

        let mut raw = [0u8; CFI_QUERY_WIRE_SIZE];
        self.read_flash(CFI_STRUCT_OFFSET, &mut raw, true)?;
        let cfi = CfiQuery::parse(&raw)?;

        if cfi.num_erase_block_regions < 1 {
            return Err(Error::CfiGeometryInvalid(
                "num_erase_block_regions must be >= 1".into(),
            ));
        }

        let mut region_raw = vec![0u8; cfi.num_erase_block_regions as usize * 4];
        self.read_flash(CFI_REGION_TABLE_OFFSET, &mut region_raw, true)?;

        let regions: Vec<BlockRegion> = region_raw
            .chunks_exact(4)
            .map(BlockRegion::parse)
            .collect();

        let biggest_block_size_bytes = regions
            .iter()
            .map(|r| r.size_bytes())
            .max()
            .ok_or_else(|| Error::CfiGeometryInvalid("no erase block regions parsed".into()))?;

        let total_from_regions: u64 = regions
            .iter()
            .map(|r| r.block_count() as u64 * r.size_bytes() as u64)
            .sum();
        let total_from_device_size: u64 = 1u64 << cfi.device_size;
        if total_from_regions != total_from_device_size {
            return Err(Error::CfiGeometryInvalid(format!(
                "block region table sums to {} bytes, device_size implies {} bytes",
                total_from_regions, total_from_device_size
            )));
        }

        info!(
            "CFI geometry: {} bytes ({:.2} MiB), biggest block {} bytes, {} region(s)",
            total_from_device_size,
            total_from_device_size as f64 / (1024.0 * 1024.0),
            biggest_block_size_bytes,
            regions.len(),
        );

        Ok(FlashGeometry {
            cfi,
            regions,
            biggest_block_size_bytes,
        })
    }

    /// Exits query/ID mode and restores the normal read-array mode.
    pub fn exit_to_read(&mut self) -> Result<()> {
        self.enqueue_unlock();
        self.enqueue_flash_write(UNLOCK_ADDR_1, CMD_EXIT_TO_READ);
        self.flush()?;
        self.assert_in_buffer_empty()?;
        std::thread::sleep(std::time::Duration::from_millis(1));
        Ok(())
    }

    /// Programs a single byte at `addr`. The SST command epilogue
    /// bit-reverses `data` before it hits the wire; callers pass the
    /// natural (unreversed) byte.
    pub fn program_byte(&mut self, addr: u32, data: u8) -> Result<()> {
        self.enqueue_unlock();
        self.enqueue_flash_write(UNLOCK_ADDR_1, CMD_PROGRAM);
        self.enqueue_flash_write(addr, reverse_bits(data));
        self.flush()?;
        self.assert_in_buffer_empty()?;
        std::thread::sleep(std::time::Duration::from_millis(1));
        Ok(())
    }

    /// Erases the sector containing `addr`.
    pub fn sector_erase(&mut self, addr: u32) -> Result<()> {
        self.enqueue_unlock();
        self.enqueue_flash_write(UNLOCK_ADDR_1, CMD_ERASE_SETUP);
        self.enqueue_flash_write(UNLOCK_ADDR_1, UNLOCK_BYTE_1);
        self.enqueue_flash_write(UNLOCK_ADDR_2, UNLOCK_BYTE_2);
        self.enqueue_flash_write(addr, CMD_SECTOR_ERASE);
        self.flush()?;
        self.assert_in_buffer_empty()?;
        std::thread::sleep(std::time::Duration::from_millis(1));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockBridge;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    const BAD_COMMAND_MARKER: u8 = 0xFA;
    const BAD_COMMAND_PROBE: u8 = 0xAB;

    /// A simulated chip: identity bytes at 0x00..0x02, a CFI struct at
    /// 0x10 and a region table at 0x2D, all answerable through the
    /// clocked-byte-in/out framing used by `read_flash`.
    struct SimChip {
        id: [u8; 3],
        cfi: Vec<u8>,
        regions: Vec<u8>,
    }

    /// Scans an entire flushed byte buffer opcode by opcode — a single
    /// flush carries many clocked-byte frames back to back, so answering
    /// only `bytes[0]` would silently ignore every frame after the first
    /// and leave `read_sync` waiting forever for bytes that never arrive.
    fn drive_sim_chip(
        bytes: &[u8],
        inbox: &mut VecDeque<u8>,
        pending_addr: &mut Option<u32>,
        chip: &Rc<RefCell<SimChip>>,
    ) {
        let read_byte = |addr: u32| -> u8 {
            let chip = chip.borrow();
            if (addr as usize) < 3 {
                chip.id[addr as usize]
            } else if (0x10..0x10 + chip.cfi.len() as u32).contains(&addr) {
                chip.cfi[(addr - 0x10) as usize]
            } else if (0x2D..0x2D + chip.regions.len() as u32).contains(&addr) {
                chip.regions[(addr - 0x2D) as usize]
            } else {
                0
            }
        };

        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                BAD_COMMAND_PROBE if bytes.len() == 1 => {
                    inbox.push_back(BAD_COMMAND_MARKER);
                    inbox.push_back(BAD_COMMAND_PROBE);
                    i += 1;
                }
                0x84 | 0x85 | 0x87 => i += 1,
                0x80 | 0x86 => i += 3,
                0x11 => {
                    let len = u16::from_le_bytes([bytes[i + 1], bytes[i + 2]]) as usize + 1;
                    let data = &bytes[i + 3..i + 3 + len];
                    if len == 3 && data[0] & 0x80 == 0 {
                        let addr = ((data[0] as u32) << 16)
                            | ((data[1] as u32) << 8)
                            | data[2] as u32;
                        *pending_addr = Some(addr);
                    }
                    i += 3 + len;
                }
                0x24 => {
                    let len = u16::from_le_bytes([bytes[i + 1], bytes[i + 2]]) as usize + 1;
                    if let Some(addr) = *pending_addr {
                        for j in 0..len as u32 {
                            // The chip's bus wiring reverses every byte in
                            // transit; undo that here so
                            // `read_flash(reverse=true)` recovers the
                            // natural value.
                            inbox.push_back(reverse_bits(read_byte(addr + j)));
                        }
                    }
                    i += 3;
                }
                _ => break,
            }
        }
    }

    fn logged_chip_bridge(
        chip: Rc<RefCell<SimChip>>,
        log: Rc<RefCell<Vec<u8>>>,
    ) -> MockBridge {
        let mut pending_addr: Option<u32> = None;
        MockBridge::new(Box::new(move |bytes, inbox: &mut VecDeque<u8>| {
            log.borrow_mut().extend_from_slice(bytes);
            drive_sim_chip(bytes, inbox, &mut pending_addr, &chip);
        }))
    }

    fn single_region_chip() -> SimChip {
        // device_size = 21 -> 2 MiB; one region: 32 blocks of 64 KiB.
        let mut cfi = vec![0u8; CFI_QUERY_WIRE_SIZE];
        cfi[0..3].copy_from_slice(b"QRY");
        cfi[23] = 21; // device_size
        cfi[28] = 1; // num_erase_block_regions
        let regions = {
            let n_blocks_minus_one: u16 = 31;
            let block_size_code: u16 = 0x100;
            let mut v = n_blocks_minus_one.to_le_bytes().to_vec();
            v.extend_from_slice(&block_size_code.to_le_bytes());
            v
        };
        SimChip {
            id: [EXPECTED_MANUFACTURER, EXPECTED_DEVICE, 0x01],
            cfi,
            regions,
        }
    }

    #[test]
    fn unlock_prefix_property() {
        // Every command sequence begins with the 8-byte unlock sequence.
        let chip = Rc::new(RefCell::new(single_region_chip()));
        let log = Rc::new(RefCell::new(Vec::new()));
        let bridge = logged_chip_bridge(chip, log.clone());
        let mut engine = crate::mpsse::MpsseEngine::bring_up(bridge).unwrap();
        log.borrow_mut().clear();

        engine.exit_to_read().unwrap();

        let wire = log.borrow();
        // Two clocked-byte-out frames: unlock(0xAAA,0xAA), unlock(0x555,0x55).
        // addr=0xAAA -> frame {0x80, 0x0A, 0xAA, 0xAA}; addr=0x555 -> {0x80, 0x05, 0x55, 0x55}.
        let mut expected = vec![0x11, 0x03, 0x00, 0x80, 0x0A, 0xAA, 0xAA];
        expected.extend_from_slice(&[0x11, 0x03, 0x00, 0x80, 0x05, 0x55, 0x55]);
        assert_eq!(wire[..expected.len()], expected[..]);
    }

    #[test]
    fn reads_and_validates_chip_identity() {
        let chip = Rc::new(RefCell::new(single_region_chip()));
        let log = Rc::new(RefCell::new(Vec::new()));
        let bridge = logged_chip_bridge(chip, log);
        let mut engine = crate::mpsse::MpsseEngine::bring_up(bridge).unwrap();

        let (mfr, dev, extra) = engine.read_chip_id().unwrap();
        assert_eq!(mfr, EXPECTED_MANUFACTURER);
        assert_eq!(dev, EXPECTED_DEVICE);
        assert_eq!(extra, 0x01);

        engine.exit_to_read().unwrap();
    }

    #[test]
    fn chip_identity_mismatch_is_fatal() {
        let mut chip = single_region_chip();
        chip.id[0] = 0x01; // wrong manufacturer
        let chip = Rc::new(RefCell::new(chip));
        let log = Rc::new(RefCell::new(Vec::new()));
        let bridge = logged_chip_bridge(chip, log);
        let mut engine = crate::mpsse::MpsseEngine::bring_up(bridge).unwrap();

        let err = engine.read_chip_id().unwrap_err();
        assert!(matches!(err, Error::ChipIdentityMismatch { .. }));
    }

    #[test]
    fn reads_and_validates_cfi_geometry() {
        let chip = Rc::new(RefCell::new(single_region_chip()));
        let log = Rc::new(RefCell::new(Vec::new()));
        let bridge = logged_chip_bridge(chip, log);
        let mut engine = crate::mpsse::MpsseEngine::bring_up(bridge).unwrap();

        let geometry = engine.read_cfi().unwrap();
        engine.exit_to_read().unwrap();

        assert_eq!(&geometry.cfi.magic, b"QRY");
        assert_eq!(geometry.cfi.device_size, 21);
        assert_eq!(geometry.regions.len(), 1);
        assert_eq!(geometry.biggest_block_size_bytes, 65536);

        let total: u64 = geometry
            .regions
            .iter()
            .map(|r| r.block_count() as u64 * r.size_bytes() as u64)
            .sum();
        assert_eq!(total, 1u64 << 21);
        assert_eq!(total, 2 * 1024 * 1024);
    }

    #[test]
    fn cfi_magic_mismatch_is_fatal() {
        let mut chip = single_region_chip();
        chip.cfi[0] = b'X';
        let chip = Rc::new(RefCell::new(chip));
        let log = Rc::new(RefCell::new(Vec::new()));
        let bridge = logged_chip_bridge(chip, log);
        let mut engine = crate::mpsse::MpsseEngine::bring_up(bridge).unwrap();

        let err = engine.read_cfi().unwrap_err();
        assert!(matches!(err, Error::CfiMagicMismatch(_)));
    }
}
