//! ATA / ATAPI protocol vocabulary
//!
//! Command and status blocks in register-aligned order, the IDENTIFY
//! data view, transfer-mode encoding and the ATAPI packet constants
//! shared by the IDE and AHCI engines.

use alloc::boxed::Box;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Default command timeout shared by the engines, in microseconds.
pub const ATA_TIMEOUT_US: u64 = 3_000_000;

// ============================================================================
// ATA commands
// ============================================================================

pub const ATA_CMD_READ_SECTORS: u8 = 0x20;
pub const ATA_CMD_WRITE_SECTORS: u8 = 0x30;
pub const ATA_CMD_READ_DMA: u8 = 0xC8;
pub const ATA_CMD_WRITE_DMA: u8 = 0xCA;
pub const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
pub const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;
pub const ATA_CMD_EXECUTE_DIAGNOSTIC: u8 = 0x90;
pub const ATA_CMD_INIT_DRIVE_PARAM: u8 = 0x91;
pub const ATA_CMD_PACKET: u8 = 0xA0;
pub const ATA_CMD_IDENTIFY_PACKET: u8 = 0xA1;
pub const ATA_CMD_SMART: u8 = 0xB0;
pub const ATA_CMD_SET_MULTIPLE_MODE: u8 = 0xC6;
pub const ATA_CMD_IDENTIFY: u8 = 0xEC;
pub const ATA_CMD_SET_FEATURES: u8 = 0xEF;

/// SET FEATURES sub-command selecting the transfer mode.
pub const ATA_SUB_CMD_SET_TRANSFER_MODE: u8 = 0x03;

/// SMART sub-commands (features register).
pub const ATA_SMART_ENABLE_OPERATION: u8 = 0xD8;
pub const ATA_SMART_RETURN_STATUS: u8 = 0xDA;
pub const ATA_SMART_AUTOSAVE: u8 = 0xD2;
pub const ATA_SMART_AUTOSAVE_ENABLE: u8 = 0xF1;

/// Cylinder signature for SMART commands.
pub const ATA_SMART_CYL_LOW: u8 = 0x4F;
pub const ATA_SMART_CYL_HIGH: u8 = 0xC2;
/// Cylinder signature reported when an attribute crossed its threshold.
pub const ATA_SMART_THRESHOLD_CYL_LOW: u8 = 0xF4;
pub const ATA_SMART_THRESHOLD_CYL_HIGH: u8 = 0x2C;

// ============================================================================
// ATAPI (SCSI over ATA) commands
// ============================================================================

pub const ATAPI_CMD_TEST_UNIT_READY: u8 = 0x00;
pub const ATAPI_CMD_REQUEST_SENSE: u8 = 0x03;
pub const ATAPI_CMD_READ_CAPACITY: u8 = 0x25;
pub const ATAPI_CMD_READ_10: u8 = 0x28;

/// Per-drain byte-count ceiling programmed into the cylinder registers
/// of a PACKET command; the device picks its own count below this.
pub const ATAPI_MAX_BYTE_COUNT: u16 = 0xFFFE;

/// Length of one fixed-format sense data block.
pub const ATAPI_SENSE_BLOCK_LEN: usize = 18;

/// Sense key "no sense" terminating a REQUEST SENSE drain loop.
pub const SENSE_KEY_NO_SENSE: u8 = 0x00;

// ============================================================================
// Command / status blocks
// ============================================================================

/// ATA command block in the register-aligned order both engines consume:
/// serialized into the H2D FIS on AHCI, pushed into the per-register
/// FIFO on IDE, never reordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AtaCommandBlock {
    pub command: u8,
    pub features: u8,
    pub sector_number: u8,
    pub cylinder_low: u8,
    pub cylinder_high: u8,
    pub device_head: u8,
    pub sector_number_exp: u8,
    pub cylinder_low_exp: u8,
    pub cylinder_high_exp: u8,
    pub features_exp: u8,
    pub sector_count: u8,
    pub sector_count_exp: u8,
}

/// Device register mirror captured after the final poll of a transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AtaStatusBlock {
    pub status: u8,
    pub error: u8,
    pub sector_number: u8,
    pub cylinder_low: u8,
    pub cylinder_high: u8,
    pub device_head: u8,
    pub sector_number_exp: u8,
    pub cylinder_low_exp: u8,
    pub cylinder_high_exp: u8,
    pub sector_count: u8,
    pub sector_count_exp: u8,
}

/// Device status register bits.
pub mod status {
    pub const ERR: u8 = 1 << 0;
    pub const CORR: u8 = 1 << 2;
    pub const DRQ: u8 = 1 << 3;
    pub const DWF: u8 = 1 << 5;
    pub const DRDY: u8 = 1 << 6;
    pub const BSY: u8 = 1 << 7;
}

/// Device control register bits.
pub mod control {
    /// Interrupt-enable, active low.
    pub const IEN_L: u8 = 1 << 1;
    pub const SRST: u8 = 1 << 2;
}

// ============================================================================
// IDENTIFY data
// ============================================================================

/// Size of the IDENTIFY / IDENTIFY PACKET response.
pub const IDENTIFY_LEN: usize = 512;

/// 512-byte IDENTIFY (or IDENTIFY PACKET) response viewed as words.
///
/// Only the words the driver interprets have accessors; everything else
/// stays available to callers through `words`.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct IdentifyData {
    pub words: [u16; 256],
}

impl IdentifyData {
    pub fn zeroed() -> Self {
        IdentifyData { words: [0; 256] }
    }

    /// Word 0 bit 15 is set for ATAPI devices.
    pub fn is_atapi(&self) -> bool {
        self.words[0] & 0x8000 != 0
    }

    /// Default sectors per track (word 6) used by INIT DRIVE PARAMETERS.
    pub fn sectors_per_track(&self) -> u8 {
        self.words[6] as u8
    }

    /// Default head count (word 3).
    pub fn heads(&self) -> u8 {
        self.words[3] as u8
    }

    /// Maximum sectors per SET MULTIPLE MODE block (word 47 low byte).
    pub fn max_multiple_sector(&self) -> u8 {
        self.words[47] as u8
    }

    /// Word 83 bit 10 advertises the 48-bit address feature set.
    pub fn supports_48bit(&self) -> bool {
        // Word 83 is only valid when bit 14 is set and bit 15 clear.
        let w = self.words[83];
        (w & 0xC000) == 0x4000 && (w & (1 << 10)) != 0
    }

    /// 28-bit addressable capacity in sectors (words 60-61).
    pub fn capacity_lba28(&self) -> u32 {
        (self.words[60] as u32) | ((self.words[61] as u32) << 16)
    }

    /// 48-bit addressable capacity in sectors (words 100-103).
    pub fn capacity_lba48(&self) -> u64 {
        (self.words[100] as u64)
            | ((self.words[101] as u64) << 16)
            | ((self.words[102] as u64) << 32)
            | ((self.words[103] as u64) << 48)
    }

    /// Logical block size in bytes (words 106, 117-118), defaulting to
    /// 512 when the long-sector words are not reported.
    pub fn block_size(&self) -> u32 {
        let w106 = self.words[106];
        // Valid when bit 14 set, bit 15 clear and bit 12 flags a
        // logical sector longer than 256 words.
        if (w106 & 0xC000) == 0x4000 && (w106 & (1 << 12)) != 0 {
            let words = (self.words[117] as u32) | ((self.words[118] as u32) << 16);
            words * 2
        } else {
            512
        }
    }

    /// Word 82 bit 0 advertises the SMART feature set.
    pub fn supports_smart(&self) -> bool {
        let w = self.words[82];
        (w & 0xC000) == 0x4000 && (w & 1) != 0
    }

    /// Addressable sector count honoring the 48-bit feature set.
    pub fn capacity(&self) -> u64 {
        if self.supports_48bit() {
            self.capacity_lba48()
        } else {
            self.capacity_lba28() as u64
        }
    }

    /// Maximum sector count of one transfer: 0x100 for 28-bit devices,
    /// 0x10000 for 48-bit devices actually using the large space.
    pub fn max_transfer_sectors(&self) -> u32 {
        if self.supports_48bit() && self.capacity_lba28() > 0x0FFF_FFFF {
            0x10000
        } else {
            0x100
        }
    }
}

// ============================================================================
// Transfer modes
// ============================================================================

/// One negotiated transfer mode: the category nibble plus the mode
/// number, encoded into the SET FEATURES count register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferMode {
    pub mode_category: u8,
    pub mode_number: u8,
}

/// Transfer-mode categories (high bits of the SET FEATURES encoding).
pub mod transfer_mode {
    /// PIO default mode (modes 0-2).
    pub const DEFAULT_PIO: u8 = 0x00;
    /// PIO with flow control (modes 3+).
    pub const FLOW_PIO: u8 = 0x01;
    pub const SINGLE_WORD_DMA: u8 = 0x02;
    pub const MULTI_WORD_DMA: u8 = 0x04;
    pub const UDMA: u8 = 0x08;
}

impl TransferMode {
    /// Encoding written to the count register of SET FEATURES 0x03.
    pub fn encode(&self) -> u8 {
        (self.mode_category << 3) | (self.mode_number & 0x07)
    }
}

/// What answered on a port during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    HardDisk,
    CdRom,
    PortMultiplier,
    Unknown,
}

/// One discovered device, kept in insertion order by the pass-through
/// instance.
pub struct AttachedDevice {
    pub port: u16,
    pub pm_port: u16,
    pub kind: DeviceKind,
    pub identify: Box<IdentifyData>,
}

/// Protocol selector of one pass-through request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtaProtocol {
    NonData,
    PioIn,
    PioOut,
    UdmaIn,
    UdmaOut,
}

impl AtaProtocol {
    pub fn is_write(&self) -> bool {
        matches!(self, AtaProtocol::PioOut | AtaProtocol::UdmaOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identify_with(words: &[(usize, u16)]) -> IdentifyData {
        let mut id = IdentifyData::zeroed();
        for &(idx, w) in words {
            id.words[idx] = w;
        }
        id
    }

    #[test]
    fn atapi_flag_lives_in_word0_bit15() {
        assert!(identify_with(&[(0, 0x8580)]).is_atapi());
        assert!(!identify_with(&[(0, 0x0040)]).is_atapi());
    }

    #[test]
    fn small_disk_keeps_28bit_sector_ceiling() {
        // 48-bit support alone is not enough; the 28-bit capacity must
        // actually overflow before the larger ceiling applies.
        let id = identify_with(&[(83, 0x4400), (60, 0x1000)]);
        assert!(id.supports_48bit());
        assert_eq!(id.max_transfer_sectors(), 0x100);
    }

    #[test]
    fn large_disk_gets_48bit_sector_ceiling() {
        let id = identify_with(&[(83, 0x4400), (60, 0xFFFF), (61, 0x0FFF), (100, 1)]);
        assert_eq!(id.capacity_lba28(), 0x0FFF_FFFF);
        assert_eq!(id.max_transfer_sectors(), 0x100);

        let id = identify_with(&[(83, 0x4400), (60, 0x0000), (61, 0x1000), (100, 1)]);
        assert!(id.capacity_lba28() > 0x0FFF_FFFF);
        assert_eq!(id.max_transfer_sectors(), 0x10000);
    }

    #[test]
    fn block_size_defaults_to_512() {
        assert_eq!(identify_with(&[]).block_size(), 512);
        // 4K logical sectors via words 106/117/118.
        let id = identify_with(&[(106, 0x5000), (117, 0x0800), (118, 0)]);
        assert_eq!(id.block_size(), 4096);
    }

    #[test]
    fn transfer_mode_encoding_matches_set_features() {
        let udma5 = TransferMode { mode_category: transfer_mode::UDMA, mode_number: 5 };
        assert_eq!(udma5.encode(), 0x45);
        let pio4 = TransferMode { mode_category: transfer_mode::FLOW_PIO, mode_number: 4 };
        assert_eq!(pio4.encode(), 0x0C);
        let pio2 = TransferMode { mode_category: transfer_mode::DEFAULT_PIO, mode_number: 2 };
        assert_eq!(pio2.encode(), 0x02);
    }
}
