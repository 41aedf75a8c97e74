//! AHCI command structures
//!
//! The command list, command table and received-FIS area the HBA walks,
//! plus the software-built host-to-device register FIS.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::ata::AtaCommandBlock;

use super::regs::FIS_REGISTER_H2D;

/// One received-FIS region per port.
pub const RECEIVED_FIS_SIZE: usize = 0x100;

/// Deposit offsets inside the received-FIS region.
pub const RFIS_DMA_SETUP_OFFSET: usize = 0x00;
pub const RFIS_PIO_SETUP_OFFSET: usize = 0x20;
pub const RFIS_D2H_OFFSET: usize = 0x40;
pub const RFIS_SET_DEVICE_BITS_OFFSET: usize = 0x58;
pub const RFIS_UNKNOWN_OFFSET: usize = 0x60;

/// Command slots in the command list.
pub const COMMAND_SLOTS: usize = 32;

/// One PRD entry describes at most 4 MiB.
pub const MAX_DATA_PER_PRDT: usize = 0x40_0000;

/// Architectural ceiling on PRD entries per command table.
pub const PRDT_ARCH_MAX: usize = 65535;

/// Header of the command table before the PRD entries: command FIS
/// area (64 bytes), ATAPI command (16 bytes), reserved (48 bytes).
pub const COMMAND_TABLE_HEADER: usize = 0x80;
pub const COMMAND_TABLE_ACMD_OFFSET: usize = 0x40;
pub const COMMAND_TABLE_PRDT_OFFSET: usize = COMMAND_TABLE_HEADER;

/// Host-to-device register FIS (5 dwords).
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CommandFis {
    pub fis_type: u8,
    /// Port-multiplier port in bits 3:0, command indicator in bit 7.
    pub pm_and_c: u8,
    pub command: u8,
    pub features: u8,

    pub lba_low: u8,
    pub lba_mid: u8,
    pub lba_high: u8,
    pub device: u8,

    pub lba_low_exp: u8,
    pub lba_mid_exp: u8,
    pub lba_high_exp: u8,
    pub features_exp: u8,

    pub count: u8,
    pub count_exp: u8,
    pub icc: u8,
    pub control: u8,

    pub reserved: [u8; 4],
}

impl CommandFis {
    /// Serialize an ATA command block into a command FIS. The device
    /// register always carries the LBA bit.
    pub fn from_command_block(acb: &AtaCommandBlock) -> CommandFis {
        CommandFis {
            fis_type: FIS_REGISTER_H2D,
            pm_and_c: 1 << 7,
            command: acb.command,
            features: acb.features,
            lba_low: acb.sector_number,
            lba_mid: acb.cylinder_low,
            lba_high: acb.cylinder_high,
            device: acb.device_head | 0xE0,
            lba_low_exp: acb.sector_number_exp,
            lba_mid_exp: acb.cylinder_low_exp,
            lba_high_exp: acb.cylinder_high_exp,
            features_exp: acb.features_exp,
            count: acb.sector_count,
            count_exp: acb.sector_count_exp,
            icc: 0,
            control: 0,
            reserved: [0; 4],
        }
    }

    pub fn set_port_multiplier(&mut self, pm_port: u8) {
        self.pm_and_c = (self.pm_and_c & 0xF0) | (pm_port & 0x0F);
    }
}

/// Device-to-host register FIS as deposited in the received-FIS area.
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ReceivedFis {
    pub fis_type: u8,
    pub pm_and_i: u8,
    pub status: u8,
    pub error: u8,

    pub lba_low: u8,
    pub lba_mid: u8,
    pub lba_high: u8,
    pub device: u8,

    pub lba_low_exp: u8,
    pub lba_mid_exp: u8,
    pub lba_high_exp: u8,
    pub reserved0: u8,

    pub count: u8,
    pub count_exp: u8,
    pub reserved1: [u8; 6],
}

/// One command-list entry (command header, 8 dwords).
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CommandHeader {
    /// CFL in bits 4:0, A bit 5, W bit 6, P bit 7, R bit 8, B bit 9,
    /// C bit 10, PMP bits 15:12.
    pub flags: u16,
    /// Number of PRD entries in the command table.
    pub prdtl: u16,
    /// Bytes transferred, maintained by hardware.
    pub prdbc: u32,
    pub ctba: u32,
    pub ctbau: u32,
    pub reserved: [u32; 4],
}

impl CommandHeader {
    pub const FLAG_ATAPI: u16 = 1 << 5;
    pub const FLAG_WRITE: u16 = 1 << 6;
    pub const FLAG_PREFETCH: u16 = 1 << 7;
    pub const FLAG_CLEAR_BUSY: u16 = 1 << 10;

    pub fn set_cfl(&mut self, dwords: usize) {
        self.flags = (self.flags & !0x1F) | (dwords as u16 & 0x1F);
    }

    pub fn set_pm_port(&mut self, pm_port: u8) {
        self.flags = (self.flags & 0x0FFF) | ((pm_port as u16 & 0x0F) << 12);
    }
}

/// One physical region descriptor entry (4 dwords).
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PrdEntry {
    pub dba: u32,
    pub dbau: u32,
    pub reserved: u32,
    /// Byte count minus one in bits 21:0; interrupt-on-completion in
    /// bit 31, set only on the last entry of a table.
    pub dbc_ioc: u32,
}

impl PrdEntry {
    pub fn new(bus_addr: u64, len: usize, ioc: bool) -> PrdEntry {
        debug_assert!(len > 0 && len <= MAX_DATA_PER_PRDT);
        PrdEntry {
            dba: bus_addr as u32,
            dbau: (bus_addr >> 32) as u32,
            reserved: 0,
            dbc_ioc: (len as u32 - 1) | if ioc { 1 << 31 } else { 0 },
        }
    }

    pub fn byte_count(&self) -> usize {
        (self.dbc_ioc & 0x3F_FFFF) as usize + 1
    }

    pub fn interrupt_on_completion(&self) -> bool {
        self.dbc_ioc & (1 << 31) != 0
    }
}

/// PRD entries needed for `len` bytes of data.
pub fn prdt_count(len: usize) -> usize {
    len.div_ceil(MAX_DATA_PER_PRDT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_fis_serializes_register_order() {
        let acb = AtaCommandBlock {
            command: 0xEC,
            features: 0x01,
            sector_number: 0x11,
            cylinder_low: 0x22,
            cylinder_high: 0x33,
            device_head: 0x0F,
            sector_number_exp: 0x44,
            cylinder_low_exp: 0x55,
            cylinder_high_exp: 0x66,
            features_exp: 0x02,
            sector_count: 0x01,
            sector_count_exp: 0x00,
        };
        let fis = CommandFis::from_command_block(&acb);
        assert_eq!(fis.fis_type, FIS_REGISTER_H2D);
        assert_eq!(fis.pm_and_c, 0x80);
        assert_eq!(fis.command, 0xEC);
        assert_eq!(fis.device, 0xEF);
        assert_eq!(fis.lba_mid, 0x22);
        assert_eq!(fis.lba_mid_exp, 0x55);
        assert_eq!(core::mem::size_of::<CommandFis>(), 20);
    }

    #[test]
    fn prd_entry_encodes_count_minus_one() {
        let prd = PrdEntry::new(0x1000, 512, true);
        assert_eq!(prd.dbc_ioc & 0x3F_FFFF, 511);
        assert!(prd.interrupt_on_completion());
        assert_eq!(prd.byte_count(), 512);

        assert_eq!(prdt_count(512), 1);
        assert_eq!(prdt_count(MAX_DATA_PER_PRDT), 1);
        assert_eq!(prdt_count(MAX_DATA_PER_PRDT + 1), 2);
    }

    #[test]
    fn command_header_field_packing() {
        let mut hdr = CommandHeader::default();
        hdr.set_cfl(5);
        hdr.set_pm_port(3);
        hdr.flags |= CommandHeader::FLAG_ATAPI | CommandHeader::FLAG_WRITE;
        assert_eq!(hdr.flags & 0x1F, 5);
        assert_eq!(hdr.flags >> 12, 3);
        assert_eq!(core::mem::size_of::<CommandHeader>(), 32);
        assert_eq!(core::mem::size_of::<PrdEntry>(), 16);
    }
}
