//! Legacy IDE / ATAPI transport engine
//!
//! Register-driven PIO and bus-master UDMA data paths over the two
//! channels of a parallel-ATA controller, plus the ATAPI packet
//! command framing for CD-ROM devices.

pub mod regs;

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::ptr;

use crate::ata::{
    self, status, control, AtaCommandBlock, AtaStatusBlock, AttachedDevice, DeviceKind,
    IdentifyData, TransferMode, transfer_mode,
};
use crate::error::{Error, Result};
use crate::pci::{Bar, BusMasterOp, Mapping, PciIo};
use crate::policy::{IdeControllerInit, IdeInitPhase};
use crate::time::{self, POLL_GRANULARITY_US, STALL_1_MS};

use regs::{
    ide_register_blocks, BusMasterCommand, BusMasterStatus, IdeRegisters, BMIC_OFFSET,
    BMID_OFFSET, BMIS_OFFSET, CHANNEL_COUNT, DEVICES_PER_CHANNEL,
};

/// Command-register settle time after the command byte is written.
const COMMAND_SETTLE_US: u64 = 400;

/// Budget for EXECUTE DEVICE DIAGNOSTIC to release BSY.
const DIAGNOSTIC_TIMEOUT_US: u64 = 35_000_000;

/// Words moved per PIO turn (one sector).
const PIO_BLOCK_WORDS: usize = 256;

/// Inter-word settle while pushing an ATAPI command packet.
const CDB_WORD_STALL_US: u64 = 10;

/// One PRD entry: 32-bit address, 16-bit count (0 means 64 KiB) and an
/// end-of-table flag in the top bit of the last word.
#[derive(Clone, Copy)]
#[repr(C)]
struct PrdEntry {
    address: u32,
    byte_count: u16,
    flags: u16,
}

const PRD_END_OF_TABLE: u16 = 0x8000;
const SIZE_64K: usize = 0x10000;

/// Non-blocking context of one UDMA transfer in flight.
#[derive(Default)]
pub struct UdmaState {
    started: bool,
    buffer_mapping: Option<Mapping>,
    table_mapping: Option<Mapping>,
    table_cpu: Option<*mut u8>,
    table_pages: usize,
}

/// IDE engine instance.
pub struct IdeController {
    pci: Rc<dyn PciIo>,
    channels: [IdeRegisters; 2],
    enable_smart: bool,
}

impl IdeController {
    /// Decode the channel register blocks and remember the SMART
    /// policy toggle.
    pub fn new(pci: Rc<dyn PciIo>, enable_smart: bool) -> Result<Self> {
        let channels = ide_register_blocks(pci.as_ref())?;
        Ok(IdeController { pci, channels, enable_smart })
    }

    /// Re-derive the register blocks; BARs may have been reprogrammed
    /// between calls.
    pub fn refresh_registers(&mut self) -> Result<()> {
        self.channels = ide_register_blocks(self.pci.as_ref())?;
        Ok(())
    }

    fn ch(&self, channel: u8) -> &IdeRegisters {
        &self.channels[channel as usize]
    }

    // ------------------------------------------------------------------
    // Port I/O helpers
    // ------------------------------------------------------------------

    fn inb(&self, port: u16) -> u8 {
        self.pci.io_read8(Bar::PASS_THROUGH, port as u64)
    }

    fn outb(&self, port: u16, value: u8) {
        self.pci.io_write8(Bar::PASS_THROUGH, port as u64, value);
    }

    fn inw(&self, port: u16) -> u16 {
        self.pci.io_read16(Bar::PASS_THROUGH, port as u64)
    }

    fn outw(&self, port: u16, value: u16) {
        self.pci.io_write16(Bar::PASS_THROUGH, port as u64, value);
    }

    fn outdw(&self, port: u16, value: u32) {
        self.pci.io_write32(Bar::PASS_THROUGH, port as u64, value);
    }

    // ------------------------------------------------------------------
    // Status polling
    // ------------------------------------------------------------------

    /// Reading the status register also acknowledges a pending device
    /// interrupt; the alternate register does not.
    fn read_status(&self, channel: u8) -> u8 {
        self.inb(self.ch(channel).command_or_status)
    }

    fn read_alt_status(&self, channel: u8) -> u8 {
        self.inb(self.ch(channel).alt_or_control)
    }

    /// ERR/DWF/CORR only mean anything while BSY is clear.
    fn check_status(&self, channel: u8) -> Result<()> {
        let s = self.read_status(channel);
        if s & status::BSY == 0 && s & (status::ERR | status::DWF | status::CORR) != 0 {
            return Err(Error::DeviceError);
        }
        Ok(())
    }

    fn wait_bsy_clear(&self, channel: u8, timeout_us: u64) -> Result<()> {
        let port = self.ch(channel).command_or_status;
        time::wait_io8(self.pci.as_ref(), Bar::PASS_THROUGH, port as u64, status::BSY, 0, timeout_us)
    }

    fn wait_drq_clear(&self, channel: u8, timeout_us: u64) -> Result<()> {
        time::wait_cond(self.pci.as_ref(), timeout_us, || {
            self.read_status(channel) & (status::BSY | status::DRQ) == 0
        })
    }

    /// Wait on the alternate status until the device raises DRQ; an
    /// error latched with BSY clear fails the wait.
    fn wait_drq_ready_alt(&self, channel: u8, timeout_us: u64) -> Result<()> {
        let infinite = timeout_us == 0;
        let mut remaining = timeout_us;
        loop {
            let s = self.read_alt_status(channel);
            if s & status::BSY == 0 {
                if s & status::ERR != 0 {
                    return Err(Error::DeviceError);
                }
                if s & status::DRQ != 0 {
                    return Ok(());
                }
            }
            if !infinite {
                if remaining < POLL_GRANULARITY_US {
                    return Err(Error::Timeout);
                }
                remaining -= POLL_GRANULARITY_US;
            }
            self.pci.stall_us(POLL_GRANULARITY_US);
        }
    }

    // ------------------------------------------------------------------
    // Command issue
    // ------------------------------------------------------------------

    /// Common preamble: select the device, push the two-byte register
    /// FIFO expanded-first, write the command and let it settle.
    fn issue_command(&self, channel: u8, acb: &AtaCommandBlock, timeout_us: u64) -> Result<()> {
        let r = *self.ch(channel);

        self.wait_bsy_clear(channel, timeout_us)?;
        self.outb(r.device_head, 0xE0 | acb.device_head);
        self.wait_drq_clear(channel, timeout_us)?;

        self.outb(r.error_or_features, acb.features_exp);
        self.outb(r.error_or_features, acb.features);
        self.outb(r.sector_count, acb.sector_count_exp);
        self.outb(r.sector_count, acb.sector_count);
        self.outb(r.sector_number, acb.sector_number_exp);
        self.outb(r.sector_number, acb.sector_number);
        self.outb(r.cylinder_low, acb.cylinder_low_exp);
        self.outb(r.cylinder_low, acb.cylinder_low);
        self.outb(r.cylinder_high, acb.cylinder_high_exp);
        self.outb(r.cylinder_high, acb.cylinder_high);

        self.outb(r.command_or_status, acb.command);
        self.pci.stall_us(COMMAND_SETTLE_US);
        Ok(())
    }

    /// Mirror the device registers into the status block; the expanded
    /// values are fetched through the high-order-byte latch.
    fn dump_registers(&self, channel: u8, asb: &mut AtaStatusBlock) {
        let r = *self.ch(channel);

        asb.error = self.inb(r.error_or_features);
        asb.sector_count = self.inb(r.sector_count);
        asb.sector_number = self.inb(r.sector_number);
        asb.cylinder_low = self.inb(r.cylinder_low);
        asb.cylinder_high = self.inb(r.cylinder_high);
        asb.device_head = self.inb(r.device_head);

        self.outb(r.alt_or_control, 0x80);
        asb.sector_count_exp = self.inb(r.sector_count);
        asb.sector_number_exp = self.inb(r.sector_number);
        asb.cylinder_low_exp = self.inb(r.cylinder_low);
        asb.cylinder_high_exp = self.inb(r.cylinder_high);
        self.outb(r.alt_or_control, 0);

        asb.status = self.inb(r.command_or_status);
    }

    // ------------------------------------------------------------------
    // PIO data path
    // ------------------------------------------------------------------

    /// PIO transfer in blocks of at most one sector per DRQ period.
    /// The device dropping DRQ early ends the transfer without error.
    pub fn pio_data_in_out(
        &mut self,
        channel: u8,
        read: bool,
        acb: &AtaCommandBlock,
        asb: &mut AtaStatusBlock,
        data: &mut [u8],
        timeout_us: u64,
    ) -> Result<()> {
        if channel >= CHANNEL_COUNT {
            return Err(Error::InvalidParameter);
        }

        let outcome = (|| {
            self.issue_command(channel, acb, timeout_us)?;

            let data_port = self.ch(channel).data;
            let mut offset = 0;
            while offset < data.len() {
                match self.wait_drq_ready_alt(channel, timeout_us) {
                    Ok(()) => {}
                    // Short transfer: the device has nothing more to
                    // move.
                    Err(Error::Timeout) if offset > 0 => break,
                    Err(e) => return Err(e),
                }

                let block = (data.len() - offset).min(PIO_BLOCK_WORDS * 2);
                for chunk in 0..block / 2 {
                    let at = offset + chunk * 2;
                    if read {
                        let word = self.inw(data_port);
                        data[at..at + 2].copy_from_slice(&word.to_le_bytes());
                    } else {
                        let word = u16::from_le_bytes([data[at], data[at + 1]]);
                        self.outw(data_port, word);
                    }
                }
                offset += block;

                self.check_status(channel)?;
            }
            Ok(())
        })();

        self.dump_registers(channel, asb);
        outcome
    }

    /// Command with no data phase.
    pub fn non_data_command(
        &mut self,
        channel: u8,
        acb: &AtaCommandBlock,
        asb: &mut AtaStatusBlock,
        timeout_us: u64,
    ) -> Result<()> {
        if channel >= CHANNEL_COUNT {
            return Err(Error::InvalidParameter);
        }
        let outcome = (|| {
            self.issue_command(channel, acb, timeout_us)?;
            self.wait_bsy_clear(channel, timeout_us)?;
            self.check_status(channel)
        })();
        self.dump_registers(channel, asb);
        outcome
    }

    // ------------------------------------------------------------------
    // UDMA data path
    // ------------------------------------------------------------------

    /// Bus-master DMA transfer. With `state` supplied the call is
    /// non-blocking and reports `NotReady` until the bus master raises
    /// its interrupt bit.
    #[allow(clippy::too_many_arguments)]
    pub fn udma_in_out(
        &mut self,
        channel: u8,
        read: bool,
        acb: &AtaCommandBlock,
        asb: &mut AtaStatusBlock,
        data: &mut [u8],
        timeout_us: u64,
        mut state: Option<&mut UdmaState>,
    ) -> Result<()> {
        if channel >= CHANNEL_COUNT || data.is_empty() {
            return Err(Error::InvalidParameter);
        }
        if data.as_ptr() as usize & 1 != 0 || data.len() & 1 != 0 {
            return Err(Error::InvalidParameter);
        }

        let r = *self.ch(channel);
        let bmic_port = r.bus_master_base + BMIC_OFFSET;
        let bmis_port = r.bus_master_base + BMIS_OFFSET;
        let bmid_port = r.bus_master_base + BMID_OFFSET;

        let fresh = state.as_ref().map(|s| !s.started).unwrap_or(true);
        let mut local = UdmaState::default();

        if fresh {
            // One entry per started 64 KiB plus the terminator.
            let prd_count = (data.len() >> 16) + 1;
            let table_size = prd_count * core::mem::size_of::<PrdEntry>();
            if table_size > SIZE_64K {
                return Err(Error::InvalidParameter);
            }

            // Oversize by a full 64 KiB so the table can be realigned
            // below without ever crossing a 64 KiB boundary.
            let pages = table_size.div_ceil(4096);
            let real_pages = pages + SIZE_64K / 4096;

            let table_cpu = self.pci.allocate_buffer(real_pages)?;
            let (table_bus, table_mapping) =
                match self.pci.map(BusMasterOp::CommonBuffer, table_cpu, real_pages * 4096) {
                    Ok(v) => v,
                    Err(e) => {
                        self.pci.free_buffer(real_pages, table_cpu);
                        return Err(e);
                    }
                };
            unsafe { ptr::write_bytes(table_cpu, 0, real_pages * 4096) };

            let aligned_cpu =
                ((table_cpu as usize + SIZE_64K - 1) & !(SIZE_64K - 1)) as *mut PrdEntry;
            let aligned_bus = (table_bus + SIZE_64K as u64 - 1) & !(SIZE_64K as u64 - 1);
            debug_assert!(
                (aligned_bus as usize & (SIZE_64K - 1)) + table_size <= SIZE_64K,
                "PRD table crosses a 64 KiB boundary"
            );

            let op = if read { BusMasterOp::Write } else { BusMasterOp::Read };
            let (data_bus, buffer_mapping) = match self.pci.map(op, data.as_mut_ptr(), data.len())
            {
                Ok(v) => v,
                Err(e) => {
                    self.pci.unmap(table_mapping);
                    self.pci.free_buffer(real_pages, table_cpu);
                    return Err(e);
                }
            };

            // Fill the scatter entries; a byte count of zero encodes a
            // full 64 KiB region.
            let mut remaining = data.len();
            let mut addr = data_bus;
            let mut entry = aligned_cpu;
            loop {
                if remaining <= SIZE_64K {
                    unsafe {
                        ptr::write_volatile(
                            entry,
                            PrdEntry {
                                address: addr as u32,
                                byte_count: remaining as u16,
                                flags: PRD_END_OF_TABLE,
                            },
                        );
                    }
                    break;
                }
                unsafe {
                    ptr::write_volatile(
                        entry,
                        PrdEntry { address: addr as u32, byte_count: 0, flags: 0 },
                    );
                }
                remaining -= SIZE_64K;
                addr += SIZE_64K as u64;
                entry = unsafe { entry.add(1) };
            }

            // Program the bus master and arm the device.
            self.outb(r.device_head, 0xE0 | acb.device_head);
            self.outb(r.alt_or_control, 0);

            let bmis = self.inb(bmis_port);
            self.outb(
                bmis_port,
                bmis | (BusMasterStatus::INTERRUPT | BusMasterStatus::ERROR).bits(),
            );
            self.outdw(bmid_port, aligned_bus as u32);

            let mut bmic = BusMasterCommand::from_bits_retain(self.inb(bmic_port));
            bmic.set(BusMasterCommand::NREAD, read);
            self.outb(bmic_port, bmic.bits());

            let holder = state.as_deref_mut().unwrap_or(&mut local);
            holder.started = true;
            holder.buffer_mapping = Some(buffer_mapping);
            holder.table_mapping = Some(table_mapping);
            holder.table_cpu = Some(table_cpu);
            holder.table_pages = real_pages;

            let started = self
                .issue_command(channel, acb, timeout_us)
                .and_then(|()| self.check_status(channel));
            if let Err(e) = started {
                self.udma_cleanup(channel, state.as_deref_mut().unwrap_or(&mut local));
                self.dump_registers(channel, asb);
                return Err(e);
            }

            let bmic = BusMasterCommand::from_bits_retain(self.inb(bmic_port));
            self.outb(bmic_port, (bmic | BusMasterCommand::START).bits());
        }

        let outcome = if state.is_some() {
            // Single non-blocking peek.
            let bmis = BusMasterStatus::from_bits_retain(self.inb(bmis_port));
            if bmis.contains(BusMasterStatus::ERROR) {
                Err(Error::DeviceError)
            } else if bmis.contains(BusMasterStatus::INTERRUPT) {
                Ok(())
            } else {
                Err(Error::NotReady)
            }
        } else {
            time::wait_cond(self.pci.as_ref(), timeout_us, || {
                let bmis = BusMasterStatus::from_bits_retain(self.inb(bmis_port));
                bmis.intersects(BusMasterStatus::INTERRUPT | BusMasterStatus::ERROR)
            })
            .and_then(|()| {
                let bmis = BusMasterStatus::from_bits_retain(self.inb(bmis_port));
                if bmis.contains(BusMasterStatus::ERROR) {
                    Err(Error::DeviceError)
                } else {
                    Ok(())
                }
            })
        };

        if outcome == Err(Error::NotReady) {
            return Err(Error::NotReady);
        }

        self.udma_cleanup(channel, state.as_deref_mut().unwrap_or(&mut local));
        self.dump_registers(channel, asb);
        outcome
    }

    /// Termination sequence shared by success, error and timeout.
    fn udma_cleanup(&self, channel: u8, state: &mut UdmaState) {
        let r = *self.ch(channel);
        let bmic_port = r.bus_master_base + BMIC_OFFSET;
        let bmis_port = r.bus_master_base + BMIS_OFFSET;

        let bmis = self.inb(bmis_port);
        self.outb(
            bmis_port,
            bmis | (BusMasterStatus::INTERRUPT | BusMasterStatus::ERROR).bits(),
        );

        // Acknowledge the device interrupt.
        let _ = self.read_status(channel);

        let bmic = BusMasterCommand::from_bits_retain(self.inb(bmic_port));
        self.outb(bmic_port, (bmic - BusMasterCommand::START).bits());

        self.outb(r.alt_or_control, control::IEN_L);
        self.pci.stall_us(10 * STALL_1_MS);

        if let Some(mapping) = state.buffer_mapping.take() {
            self.pci.unmap(mapping);
        }
        if let Some(mapping) = state.table_mapping.take() {
            self.pci.unmap(mapping);
        }
        if let Some(cpu) = state.table_cpu.take() {
            self.pci.free_buffer(state.table_pages, cpu);
        }
        state.started = false;
    }

    // ------------------------------------------------------------------
    // ATAPI packet path
    // ------------------------------------------------------------------

    /// Issue one ATAPI packet and run its data turns. The device
    /// announces each drain's byte count through the cylinder
    /// registers.
    #[allow(clippy::too_many_arguments)]
    pub fn packet_command_execute(
        &mut self,
        channel: u8,
        device: u8,
        cdb: &[u8],
        read: bool,
        data: &mut [u8],
        asb: &mut AtaStatusBlock,
        timeout_us: u64,
    ) -> Result<()> {
        if channel >= CHANNEL_COUNT || cdb.len() != 12 {
            return Err(Error::InvalidParameter);
        }

        let acb = AtaCommandBlock {
            command: ata::ATA_CMD_PACKET,
            features: 0x00,
            cylinder_low: (ata::ATAPI_MAX_BYTE_COUNT & 0xFF) as u8,
            cylinder_high: (ata::ATAPI_MAX_BYTE_COUNT >> 8) as u8,
            device_head: device << 4,
            ..Default::default()
        };

        let outcome = (|| {
            self.issue_command(channel, &acb, timeout_us)?;
            self.wait_drq_ready_alt(channel, timeout_us)?;

            // The packet goes out as six words with a settle between.
            let data_port = self.ch(channel).data;
            for chunk in cdb.chunks_exact(2) {
                self.outw(data_port, u16::from_le_bytes([chunk[0], chunk[1]]));
                self.pci.stall_us(CDB_WORD_STALL_US);
            }

            self.packet_data_turns(channel, read, data, timeout_us)
        })();

        self.dump_registers(channel, asb);
        outcome
    }

    fn packet_data_turns(
        &self,
        channel: u8,
        read: bool,
        data: &mut [u8],
        timeout_us: u64,
    ) -> Result<()> {
        let r = *self.ch(channel);
        let required_words = data.len() / 2;
        let mut actual_words = 0;

        while actual_words < required_words {
            match self.wait_drq_ready_alt(channel, timeout_us) {
                Ok(()) => {}
                // The device moved less data than asked for; that can
                // still be a successful transfer.
                Err(Error::Timeout) => break,
                Err(e) => return Err(e),
            }

            // The device chose this drain's byte count.
            let low = self.inb(r.cylinder_low) as usize;
            let high = self.inb(r.cylinder_high) as usize;
            let drain_words = (((high << 8) | low) / 2).min(required_words - actual_words);

            for word_index in 0..drain_words {
                let at = (actual_words + word_index) * 2;
                if read {
                    let word = self.inw(r.data);
                    data[at..at + 2].copy_from_slice(&word.to_le_bytes());
                } else {
                    self.outw(r.data, u16::from_le_bytes([data[at], data[at + 1]]));
                }
            }
            actual_words += drain_words;

            self.check_status(channel)?;
        }

        if read {
            self.drain_pending_data(channel);
        }

        self.check_status(channel)?;
        self.wait_drq_clear(channel, timeout_us)
    }

    /// A drive wanting to send more than was read keeps DRQ asserted;
    /// pull and drop words until it lets go.
    fn drain_pending_data(&self, channel: u8) {
        let r = *self.ch(channel);
        let mut alt = self.read_alt_status(channel);
        if alt & status::BSY != 0 {
            return;
        }
        while alt & (status::BSY | status::DRQ) == status::DRQ {
            let _ = self.inw(r.data);
            alt = self.read_alt_status(channel);
        }
    }

    // ------------------------------------------------------------------
    // Device configuration commands
    // ------------------------------------------------------------------

    pub fn identify(
        &mut self,
        channel: u8,
        device: u8,
        identify: &mut IdentifyData,
        timeout_us: u64,
    ) -> Result<()> {
        use zerocopy::IntoBytes;
        let acb = AtaCommandBlock {
            command: ata::ATA_CMD_IDENTIFY,
            device_head: device << 4,
            ..Default::default()
        };
        let mut asb = AtaStatusBlock::default();
        self.pio_data_in_out(channel, true, &acb, &mut asb, identify.as_mut_bytes(), timeout_us)
    }

    pub fn identify_packet(
        &mut self,
        channel: u8,
        device: u8,
        identify: &mut IdentifyData,
        timeout_us: u64,
    ) -> Result<()> {
        use zerocopy::IntoBytes;
        let acb = AtaCommandBlock {
            command: ata::ATA_CMD_IDENTIFY_PACKET,
            device_head: device << 4,
            ..Default::default()
        };
        let mut asb = AtaStatusBlock::default();
        self.pio_data_in_out(channel, true, &acb, &mut asb, identify.as_mut_bytes(), timeout_us)
    }

    fn set_transfer_mode(
        &mut self,
        channel: u8,
        device: u8,
        mode: TransferMode,
        timeout_us: u64,
    ) -> Result<()> {
        let acb = AtaCommandBlock {
            command: ata::ATA_CMD_SET_FEATURES,
            features: ata::ATA_SUB_CMD_SET_TRANSFER_MODE,
            sector_count: mode.encode(),
            device_head: device << 4,
            ..Default::default()
        };
        let mut asb = AtaStatusBlock::default();
        self.non_data_command(channel, &acb, &mut asb, timeout_us)
    }

    /// INIT DRIVE PARAMETERS plus SET MULTIPLE MODE from the geometry
    /// words of IDENTIFY.
    fn set_drive_parameters(
        &mut self,
        channel: u8,
        device: u8,
        identify: &IdentifyData,
        timeout_us: u64,
    ) -> Result<()> {
        let acb = AtaCommandBlock {
            command: ata::ATA_CMD_INIT_DRIVE_PARAM,
            sector_count: identify.sectors_per_track(),
            device_head: (device << 4) | ((identify.heads().wrapping_sub(1)) & 0x0F),
            ..Default::default()
        };
        let mut asb = AtaStatusBlock::default();
        self.non_data_command(channel, &acb, &mut asb, timeout_us)?;

        let acb = AtaCommandBlock {
            command: ata::ATA_CMD_SET_MULTIPLE_MODE,
            sector_count: identify.max_multiple_sector(),
            device_head: device << 4,
            ..Default::default()
        };
        self.non_data_command(channel, &acb, &mut asb, timeout_us)
    }

    fn smart_command(
        &mut self,
        channel: u8,
        device: u8,
        feature: u8,
        count: u8,
        timeout_us: u64,
    ) -> Result<AtaStatusBlock> {
        let acb = AtaCommandBlock {
            command: ata::ATA_CMD_SMART,
            features: feature,
            sector_count: count,
            cylinder_low: ata::ATA_SMART_CYL_LOW,
            cylinder_high: ata::ATA_SMART_CYL_HIGH,
            device_head: device << 4,
            ..Default::default()
        };
        let mut asb = AtaStatusBlock::default();
        self.non_data_command(channel, &acb, &mut asb, timeout_us)?;
        Ok(asb)
    }

    /// Switch self-monitoring on and interpret the threshold report.
    fn engage_smart(&mut self, channel: u8, device: u8, timeout_us: u64) {
        if self
            .smart_command(channel, device, ata::ATA_SMART_ENABLE_OPERATION, 0, timeout_us)
            .is_err()
        {
            return;
        }
        let _ = self.smart_command(
            channel,
            device,
            ata::ATA_SMART_AUTOSAVE,
            ata::ATA_SMART_AUTOSAVE_ENABLE,
            timeout_us,
        );
        match self.smart_command(channel, device, ata::ATA_SMART_RETURN_STATUS, 0, timeout_us) {
            Ok(asb)
                if asb.cylinder_low == ata::ATA_SMART_THRESHOLD_CYL_LOW
                    && asb.cylinder_high == ata::ATA_SMART_THRESHOLD_CYL_HIGH =>
            {
                log::warn!(
                    "IDE {}:{}: SMART reports threshold exceeded",
                    channel,
                    device
                );
            }
            Ok(_) => log::debug!("IDE {}:{}: SMART below threshold", channel, device),
            Err(_) => {}
        }
    }

    // ------------------------------------------------------------------
    // Enumeration
    // ------------------------------------------------------------------

    /// Probe both devices of both channels and configure what answers.
    pub fn enumerate(
        &mut self,
        ide_init: &mut dyn IdeControllerInit,
        timeout_us: u64,
    ) -> Result<Vec<AttachedDevice>> {
        let mut devices = Vec::new();

        for channel in 0..CHANNEL_COUNT {
            ide_init.notify_phase(IdeInitPhase::BeforeChannelEnumeration, channel);

            for device in 0..DEVICES_PER_CHANNEL {
                ide_init.notify_phase(IdeInitPhase::BeforeDevicePresenceDetection, channel);
                if let Some(found) =
                    self.detect_and_config(channel, device, ide_init, timeout_us)
                {
                    devices.push(found);
                }
                ide_init.notify_phase(IdeInitPhase::AfterDevicePresenceDetection, channel);
            }

            ide_init.notify_phase(IdeInitPhase::AfterChannelEnumeration, channel);
        }

        Ok(devices)
    }

    fn detect_and_config(
        &mut self,
        channel: u8,
        device: u8,
        ide_init: &mut dyn IdeControllerInit,
        timeout_us: u64,
    ) -> Option<AttachedDevice> {
        let r = *self.ch(channel);

        // Diagnostic leaves its verdict in the signature registers.
        self.outb(r.device_head, 0xE0 | (device << 4));
        self.pci.stall_us(POLL_GRANULARITY_US);
        self.outb(r.command_or_status, ata::ATA_CMD_EXECUTE_DIAGNOSTIC);
        if self.wait_bsy_clear(channel, DIAGNOSTIC_TIMEOUT_US).is_err() {
            return None;
        }
        self.outb(r.device_head, 0xE0 | (device << 4));
        self.pci.stall_us(POLL_GRANULARITY_US);

        let count = self.inb(r.sector_count);
        let number = self.inb(r.sector_number);
        let cyl_low = self.inb(r.cylinder_low);
        let cyl_high = self.inb(r.cylinder_high);

        let mut kind = if count == 1 && number == 1 && cyl_low == 0 && cyl_high == 0 {
            DeviceKind::HardDisk
        } else if cyl_low == 0x14 && cyl_high == 0xEB {
            DeviceKind::CdRom
        } else {
            return None;
        };

        let mut identify = Box::new(IdentifyData::zeroed());
        let identified = match kind {
            DeviceKind::HardDisk => {
                self.identify(channel, device, &mut identify, timeout_us).or_else(|_| {
                    kind = DeviceKind::CdRom;
                    self.identify_packet(channel, device, &mut identify, timeout_us)
                })
            }
            _ => self.identify_packet(channel, device, &mut identify, timeout_us).or_else(|_| {
                kind = DeviceKind::HardDisk;
                self.identify(channel, device, &mut identify, timeout_us)
            }),
        };
        if identified.is_err() {
            return None;
        }

        if kind == DeviceKind::HardDisk && self.enable_smart && identify.supports_smart() {
            self.engage_smart(channel, device, timeout_us);
        }

        ide_init.submit_data(channel, device, &identify);
        let modes = ide_init.calculate_mode(channel, device).ok()?;

        if let Some(pio) = modes.pio {
            let category =
                if pio > 2 { transfer_mode::FLOW_PIO } else { transfer_mode::DEFAULT_PIO };
            let mode = TransferMode { mode_category: category, mode_number: pio };
            if self.set_transfer_mode(channel, device, mode, timeout_us).is_err() {
                return None;
            }
        }
        if let Some(udma) = modes.udma {
            let mode = TransferMode { mode_category: transfer_mode::UDMA, mode_number: udma };
            self.set_transfer_mode(channel, device, mode, timeout_us).ok()?;
        } else if let Some(mdma) = modes.multi_word_dma {
            let mode =
                TransferMode { mode_category: transfer_mode::MULTI_WORD_DMA, mode_number: mdma };
            self.set_transfer_mode(channel, device, mode, timeout_us).ok()?;
        }

        if kind == DeviceKind::HardDisk {
            let _ = self.set_drive_parameters(channel, device, &identify, timeout_us);
        }

        ide_init.set_timing(channel, device, &modes);

        log::info!("IDE {}:{}: {:?} attached", channel, device, kind);
        Some(AttachedDevice { port: channel as u16, pm_port: device as u16, kind, identify })
    }
}
