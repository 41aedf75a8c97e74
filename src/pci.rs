//! PCI configuration, I/O and DMA services consumed by the engines
//!
//! The engines never touch the bus directly; everything goes through the
//! [`PciIo`] trait supplied at construction. A firmware embedder backs it
//! with its real PCI root-bridge services; the test suites back it with
//! in-memory models that complete device work inside [`PciIo::stall_us`].

use crate::error::Result;

/// Base Address Register index used with the I/O and MMIO accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bar(pub u8);

impl Bar {
    /// Pseudo-BAR addressing raw I/O port space; `offset` is the
    /// absolute port number. Used by the IDE engine whose register
    /// blocks may live in the legacy fixed ranges.
    pub const PASS_THROUGH: Bar = Bar(0xFF);
}

/// Direction of a bus-master mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMasterOp {
    /// Device reads from the buffer (host -> device).
    Read,
    /// Device writes into the buffer (device -> host).
    Write,
    /// Long-lived buffer read and written by both sides.
    CommonBuffer,
}

/// Opaque token returned by [`PciIo::map`] and consumed by
/// [`PciIo::unmap`].
#[derive(Debug, PartialEq, Eq)]
pub struct Mapping(pub usize);

/// PCI command-register attribute bits used by [`PciIo::set_attributes`].
pub mod attributes {
    pub const IO: u64 = 1 << 0;
    pub const MEMORY: u64 = 1 << 1;
    pub const BUS_MASTER: u64 = 1 << 2;

    /// Everything a bus-master device needs switched on.
    pub const DEVICE_ENABLE: u64 = IO | MEMORY | BUS_MASTER;
}

/// Offset of the class-code triple in configuration space.
pub const PCI_CLASSCODE_OFFSET: u32 = 0x09;

/// PCI class code triple `{programming interface, sub-class, base}` as
/// laid out in configuration space from offset 0x09.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassCode {
    pub prog_if: u8,
    pub sub_class: u8,
    pub base_class: u8,
}

/// Mass-storage base class.
pub const PCI_CLASS_MASS_STORAGE: u8 = 0x01;
/// Serial-bus base class (USB controllers).
pub const PCI_CLASS_SERIAL: u8 = 0x0C;

/// Mass-storage sub-classes the pass-through facade understands.
pub const PCI_SUBCLASS_IDE: u8 = 0x01;
pub const PCI_SUBCLASS_RAID: u8 = 0x04;
pub const PCI_SUBCLASS_AHCI: u8 = 0x06;

/// USB sub-class / programming interface for UHCI.
pub const PCI_SUBCLASS_USB: u8 = 0x03;
pub const PCI_PROGIF_UHCI: u8 = 0x00;

/// Bus services handle.
///
/// Reads return the raw register value; error signalling on the access
/// path itself is the embedder's concern. Allocation and mapping return
/// [`crate::error::Error::OutOfResources`] when the platform refuses.
pub trait PciIo {
    fn io_read8(&self, bar: Bar, offset: u64) -> u8;
    fn io_read16(&self, bar: Bar, offset: u64) -> u16;
    fn io_read32(&self, bar: Bar, offset: u64) -> u32;
    fn io_write8(&self, bar: Bar, offset: u64, value: u8);
    fn io_write16(&self, bar: Bar, offset: u64, value: u16);
    fn io_write32(&self, bar: Bar, offset: u64, value: u32);

    fn mem_read32(&self, bar: Bar, offset: u64) -> u32;
    fn mem_write32(&self, bar: Bar, offset: u64, value: u32);

    fn cfg_read8(&self, offset: u32) -> u8;
    fn cfg_read16(&self, offset: u32) -> u16;
    fn cfg_read32(&self, offset: u32) -> u32;
    fn cfg_write8(&self, offset: u32, value: u8);
    fn cfg_write16(&self, offset: u32, value: u16);
    fn cfg_write32(&self, offset: u32, value: u32);

    /// Allocate `pages` 4 KiB pages suitable for bus-master use. The
    /// returned region is page aligned.
    fn allocate_buffer(&self, pages: usize) -> Result<*mut u8>;
    fn free_buffer(&self, pages: usize, buffer: *mut u8);

    /// Map `len` bytes at `host` for bus-master access and return the
    /// device-visible address plus an unmap token. The mapping must be
    /// contiguous; embedders that would split the range refuse instead.
    fn map(&self, op: BusMasterOp, host: *mut u8, len: usize) -> Result<(u64, Mapping)>;
    fn unmap(&self, mapping: Mapping);

    /// Flush posted bus-master writes.
    fn flush(&self) {}

    /// Attribute bits currently in force (see [`attributes`]).
    fn attributes(&self) -> u64;
    fn set_attributes(&self, attrs: u64);
    /// Attribute bits the device supports.
    fn supported_attributes(&self) -> u64;

    /// Busy-wait for `us` microseconds. Polling loops in the engines
    /// never stall longer than 100 us per call, so a test embedder can
    /// advance its device models here.
    fn stall_us(&self, us: u64);
}

/// Read the class-code triple from configuration space.
pub fn read_class_code(pci: &dyn PciIo) -> ClassCode {
    ClassCode {
        prog_if: pci.cfg_read8(PCI_CLASSCODE_OFFSET),
        sub_class: pci.cfg_read8(PCI_CLASSCODE_OFFSET + 1),
        base_class: pci.cfg_read8(PCI_CLASSCODE_OFFSET + 2),
    }
}

/// Enable I/O, memory decode and bus mastering, returning the attribute
/// word that was in force beforehand so `stop` can restore it.
pub fn enable_device(pci: &dyn PciIo) -> u64 {
    let original = pci.attributes();
    let supported = pci.supported_attributes();
    pci.set_attributes(original | (attributes::DEVICE_ENABLE & supported));
    original
}
