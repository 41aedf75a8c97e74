//! IDE channel register blocks
//!
//! Each channel's command and control blocks live either in the legacy
//! fixed I/O ranges or behind the native-mode BARs, selected per
//! channel by the programming-interface bits of the class code. The
//! bus-master block always comes from BAR 4.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::pci::PciIo;

/// Channels per controller.
pub const CHANNEL_COUNT: u8 = 2;
/// Devices per channel (master, slave).
pub const DEVICES_PER_CHANNEL: u8 = 2;

/// Legacy command/control bases.
const PRIMARY_CMD_BASE: u16 = 0x1F0;
const PRIMARY_CTL: u16 = 0x3F6;
const SECONDARY_CMD_BASE: u16 = 0x170;
const SECONDARY_CTL: u16 = 0x376;

/// BAR offsets in configuration space.
const BAR0: u32 = 0x10;
const BAR1: u32 = 0x14;
const BAR2: u32 = 0x18;
const BAR3: u32 = 0x1C;
const BAR4: u32 = 0x20;

/// Bus-master register offsets from the channel's bus-master base.
pub const BMIC_OFFSET: u16 = 0x00;
pub const BMIS_OFFSET: u16 = 0x02;
pub const BMID_OFFSET: u16 = 0x04;

bitflags! {
    /// Bus-master command register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BusMasterCommand: u8 {
        const START = 1 << 0;
        /// Direction: set for device-to-memory.
        const NREAD = 1 << 3;
    }
}

bitflags! {
    /// Bus-master status register; ERROR and INTERRUPT are
    /// write-1-to-clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BusMasterStatus: u8 {
        const ACTIVE = 1 << 0;
        const ERROR = 1 << 1;
        const INTERRUPT = 1 << 2;
    }
}

/// Absolute I/O port numbers of one channel's register file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdeRegisters {
    pub data: u16,
    pub error_or_features: u16,
    pub sector_count: u16,
    pub sector_number: u16,
    pub cylinder_low: u16,
    pub cylinder_high: u16,
    pub device_head: u16,
    pub command_or_status: u16,
    /// Alternate status / device control.
    pub alt_or_control: u16,
    pub bus_master_base: u16,
}

impl IdeRegisters {
    fn from_bases(cmd_base: u16, ctl: u16, bus_master: u16) -> IdeRegisters {
        IdeRegisters {
            data: cmd_base,
            error_or_features: cmd_base + 1,
            sector_count: cmd_base + 2,
            sector_number: cmd_base + 3,
            cylinder_low: cmd_base + 4,
            cylinder_high: cmd_base + 5,
            device_head: cmd_base + 6,
            command_or_status: cmd_base + 7,
            alt_or_control: ctl,
            bus_master_base: bus_master,
        }
    }
}

/// Derive both channels' register blocks from the programming
/// interface and the BARs. Native-mode channels require I/O BARs.
pub fn ide_register_blocks(pci: &dyn PciIo) -> Result<[IdeRegisters; 2]> {
    let prog_if = pci.cfg_read8(crate::pci::PCI_CLASSCODE_OFFSET);

    let bus_master = (pci.cfg_read32(BAR4) & 0xFFF0) as u16;

    let primary = if prog_if & 0x01 == 0 {
        IdeRegisters::from_bases(PRIMARY_CMD_BASE, PRIMARY_CTL, bus_master)
    } else {
        let bar0 = pci.cfg_read32(BAR0);
        let bar1 = pci.cfg_read32(BAR1);
        // Native-mode BARs must decode I/O space.
        if bar0 & 1 == 0 || bar1 & 1 == 0 {
            return Err(Error::Unsupported);
        }
        let cmd = (bar0 & 0xFFF8) as u16;
        let ctl = ((bar1 & 0xFFFC) + 2) as u16;
        IdeRegisters::from_bases(cmd, ctl, bus_master)
    };

    let secondary = if prog_if & 0x04 == 0 {
        IdeRegisters::from_bases(SECONDARY_CMD_BASE, SECONDARY_CTL, bus_master + 8)
    } else {
        let bar2 = pci.cfg_read32(BAR2);
        let bar3 = pci.cfg_read32(BAR3);
        if bar2 & 1 == 0 || bar3 & 1 == 0 {
            return Err(Error::Unsupported);
        }
        let cmd = (bar2 & 0xFFF8) as u16;
        let ctl = ((bar3 & 0xFFFC) + 2) as u16;
        IdeRegisters::from_bases(cmd, ctl, bus_master + 8)
    };

    Ok([primary, secondary])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockPci;

    #[test]
    fn compatibility_mode_uses_legacy_ranges() {
        let pci = MockPci::new();
        pci.cfg_poke8(0x09, 0x00);
        pci.cfg_poke32(BAR4, 0xC001);

        let [primary, secondary] = ide_register_blocks(&pci).unwrap();
        assert_eq!(primary.data, 0x1F0);
        assert_eq!(primary.command_or_status, 0x1F7);
        assert_eq!(primary.alt_or_control, 0x3F6);
        assert_eq!(primary.bus_master_base, 0xC000);
        assert_eq!(secondary.data, 0x170);
        assert_eq!(secondary.alt_or_control, 0x376);
        assert_eq!(secondary.bus_master_base, 0xC008);
    }

    #[test]
    fn native_mode_decodes_bars() {
        let pci = MockPci::new();
        pci.cfg_poke8(0x09, 0x05); // both channels native
        pci.cfg_poke32(BAR0, 0x1F01);
        pci.cfg_poke32(BAR1, 0x3F05);
        pci.cfg_poke32(BAR2, 0x1701);
        pci.cfg_poke32(BAR3, 0x3705);
        pci.cfg_poke32(BAR4, 0xC001);

        let [primary, secondary] = ide_register_blocks(&pci).unwrap();
        assert_eq!(primary.data, 0x1F00);
        assert_eq!(primary.alt_or_control, 0x3F06);
        assert_eq!(secondary.data, 0x1700);
        assert_eq!(secondary.alt_or_control, 0x3706);
    }

    #[test]
    fn native_mode_requires_io_bars() {
        let pci = MockPci::new();
        pci.cfg_poke8(0x09, 0x01);
        pci.cfg_poke32(BAR0, 0x8000_0000); // memory BAR
        pci.cfg_poke32(BAR1, 0x3F05);
        assert_eq!(ide_register_blocks(&pci).unwrap_err(), Error::Unsupported);
    }
}
