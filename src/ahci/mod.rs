//! AHCI SATA host-bus-adapter engine
//!
//! Implements the per-port command list / received-FIS machinery with a
//! single shared command table: one command is in flight at a time, in
//! slot 0. Every transfer follows the same pipeline: build the FIS,
//! build the command, start the port, wait for the completion FIS, stop
//! the port.

pub mod cmd;
pub mod regs;

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::ptr;

use tock_registers::LocalRegisterCopy;
use zerocopy::{FromBytes, IntoBytes};

use crate::ata::{
    self, AtaCommandBlock, AtaStatusBlock, DeviceKind, AttachedDevice, IdentifyData, TransferMode,
    transfer_mode,
};
use crate::error::{Error, Result};
use crate::pci::{BusMasterOp, Mapping, PciIo};
use crate::policy::{IdeControllerInit, IdeInitPhase};
use crate::time;

use cmd::{
    prdt_count, CommandFis, CommandHeader, PrdEntry, ReceivedFis, COMMAND_TABLE_ACMD_OFFSET,
    COMMAND_TABLE_PRDT_OFFSET, RECEIVED_FIS_SIZE, RFIS_D2H_OFFSET, RFIS_PIO_SETUP_OFFSET,
};
use regs::*;

/// Grace period after port bring-up before device detection.
const PORT_SETTLE_US: u64 = 100 * time::STALL_1_MS;

/// DET assertion time during a port reset.
const PORT_RESET_DET_US: u64 = 5 * time::STALL_1_MS;

/// One page backs the shared command table.
const COMMAND_TABLE_PAGES: usize = 1;

/// PRD entries that fit the one-page command table.
const PRDT_CAPACITY: usize = (4096 - COMMAND_TABLE_PRDT_OFFSET) / 16;

struct Region {
    cpu: *mut u8,
    bus: u64,
    pages: usize,
    mapping: Option<Mapping>,
}

struct AhciMemory {
    rfis: Region,
    cmd_list: Region,
    cmd_table: Region,
}

/// Non-blocking context of one DMA transfer in flight.
#[derive(Default)]
pub struct DmaState {
    started: bool,
    mapping: Option<Mapping>,
}

/// AHCI engine instance.
pub struct AhciController {
    pci: Rc<dyn PciIo>,
    max_ports: u8,
    command_slots: u8,
    supports_64bit: bool,
    supports_clo: bool,
    staggered_spinup: bool,
    ports_implemented: u32,
    mem: Option<AhciMemory>,
}

impl AhciController {
    pub fn new(pci: Rc<dyn PciIo>) -> Self {
        AhciController {
            pci,
            max_ports: 0,
            command_slots: 0,
            supports_64bit: false,
            supports_clo: false,
            staggered_spinup: false,
            ports_implemented: 0,
            mem: None,
        }
    }

    // ------------------------------------------------------------------
    // Register helpers
    // ------------------------------------------------------------------

    fn read(&self, offset: u64) -> u32 {
        self.pci.mem_read32(AHCI_BAR, offset)
    }

    fn write(&self, offset: u64, value: u32) {
        self.pci.mem_write32(AHCI_BAR, offset, value)
    }

    fn or(&self, offset: u64, bits: u32) {
        self.write(offset, self.read(offset) | bits);
    }

    fn and(&self, offset: u64, mask: u32) {
        self.write(offset, self.read(offset) & mask);
    }

    fn wait_set(&self, offset: u64, mask: u32, value: u32, timeout_us: u64) -> Result<()> {
        time::wait_mem32(self.pci.as_ref(), AHCI_BAR, offset, mask, value, timeout_us)
    }

    fn mem(&self) -> &AhciMemory {
        self.mem.as_ref().expect("AHCI engine not started")
    }

    fn rfis_base(&self, port: u8) -> *mut u8 {
        unsafe { self.mem().rfis.cpu.add(port as usize * RECEIVED_FIS_SIZE) }
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Reset and enable the HBA, size it from CAP/PI and allocate the
    /// shared descriptor memory.
    pub fn start(&mut self, timeout_us: u64) -> Result<()> {
        self.reset(timeout_us)?;
        self.or(HBA_GHC, GHC_ENABLE);

        let cap: LocalRegisterCopy<u32, CAP::Register> = LocalRegisterCopy::new(self.read(HBA_CAP));
        self.max_ports = cap.read(CAP::NP) as u8 + 1;
        self.command_slots = cap.read(CAP::NCS) as u8 + 1;
        self.supports_64bit = cap.read(CAP::S64A) != 0;
        self.supports_clo = cap.read(CAP::SCLO) != 0;
        self.staggered_spinup = cap.read(CAP::SSS) != 0;
        self.ports_implemented = self.read(HBA_PI);

        log::info!(
            "AHCI HBA: {} port(s), {} slot(s), 64-bit {}",
            self.max_ports,
            self.command_slots,
            if self.supports_64bit { "yes" } else { "no" }
        );

        let rfis_bytes = self.max_ports as usize * RECEIVED_FIS_SIZE;
        let rfis = self.alloc_region(rfis_bytes.div_ceil(4096))?;
        let cmd_list = match self.alloc_region(1) {
            Ok(r) => r,
            Err(e) => {
                self.free_region(rfis);
                return Err(e);
            }
        };
        let cmd_table = match self.alloc_region(COMMAND_TABLE_PAGES) {
            Ok(r) => r,
            Err(e) => {
                self.free_region(cmd_list);
                self.free_region(rfis);
                return Err(e);
            }
        };

        // A 32-bit HBA cannot chase descriptors above 4 GiB.
        if !self.supports_64bit {
            let over_4gib = [&rfis, &cmd_list, &cmd_table]
                .iter()
                .any(|region| region.bus + (region.pages as u64 * 4096) > u32::MAX as u64 + 1);
            if over_4gib {
                self.free_region(cmd_table);
                self.free_region(cmd_list);
                self.free_region(rfis);
                return Err(Error::DeviceError);
            }
        }

        self.mem = Some(AhciMemory { rfis, cmd_list, cmd_table });
        Ok(())
    }

    fn alloc_region(&self, pages: usize) -> Result<Region> {
        let cpu = self.pci.allocate_buffer(pages)?;
        match self.pci.map(BusMasterOp::CommonBuffer, cpu, pages * 4096) {
            Ok((bus, mapping)) => {
                unsafe { ptr::write_bytes(cpu, 0, pages * 4096) };
                Ok(Region { cpu, bus, pages, mapping: Some(mapping) })
            }
            Err(e) => {
                self.pci.free_buffer(pages, cpu);
                Err(e)
            }
        }
    }

    fn free_region(&self, mut region: Region) {
        if let Some(mapping) = region.mapping.take() {
            self.pci.unmap(mapping);
        }
        self.pci.free_buffer(region.pages, region.cpu);
    }

    /// HBA reset: set GHC.HR and wait for it to self-clear.
    pub fn reset(&mut self, timeout_us: u64) -> Result<()> {
        self.or(HBA_GHC, GHC_ENABLE);
        self.or(HBA_GHC, GHC_RESET);
        self.wait_set(HBA_GHC, GHC_RESET, 0, timeout_us)
    }

    fn port_implemented(&self, port: u8) -> bool {
        port < self.max_ports && self.ports_implemented & (1 << port) != 0
    }

    /// Program the descriptor pointers and power state of one port.
    fn init_port(&mut self, port: u8) {
        let mem = self.mem();
        let rfis_bus = mem.rfis.bus + port as u64 * RECEIVED_FIS_SIZE as u64;
        let list_bus = mem.cmd_list.bus;

        self.write(port_reg(port, PORT_FB), rfis_bus as u32);
        self.write(port_reg(port, PORT_FBU), (rfis_bus >> 32) as u32);
        self.write(port_reg(port, PORT_CLB), list_bus as u32);
        self.write(port_reg(port, PORT_CLBU), (list_bus >> 32) as u32);

        let cmd_offset = port_reg(port, PORT_CMD);
        if self.staggered_spinup {
            self.or(cmd_offset, PORT_CMD_SUD);
        }
        if self.read(cmd_offset) & PORT_CMD_CPD != 0 {
            self.or(cmd_offset, PORT_CMD_POD);
        }
        self.and(cmd_offset, !(PORT_CMD_ST | PORT_CMD_FRE | PORT_CMD_CLO));

        // Keep the link out of partial and slumber while enumerating.
        let sctl = port_reg(port, PORT_SCTL);
        self.and(sctl, !PORT_SCTL_IPM_PSUD);
        self.or(sctl, PORT_SCTL_IPM_PSUD);

        self.write(port_reg(port, PORT_IE), 0);
        self.write(port_reg(port, PORT_SERR), PORT_SERR_CLEAR);
    }

    // ------------------------------------------------------------------
    // Enumeration
    // ------------------------------------------------------------------

    /// Bring up every implemented port and identify what answers.
    pub fn enumerate(
        &mut self,
        ide_init: &mut dyn IdeControllerInit,
        timeout_us: u64,
    ) -> Result<Vec<AttachedDevice>> {
        for port in 0..self.max_ports {
            if self.port_implemented(port) {
                self.init_port(port);
            }
        }

        self.pci.stall_us(PORT_SETTLE_US);
        ide_init.notify_phase(IdeInitPhase::BeforeChannelEnumeration, 0);

        let mut devices = Vec::new();

        for port in 0..self.max_ports {
            if !self.port_implemented(port) {
                continue;
            }

            let det = self.read(port_reg(port, PORT_SSTS)) & PORT_SSTS_DET_MASK;
            if det == PORT_SSTS_DET_NONE {
                continue;
            }
            if det == PORT_SSTS_DET_PRESENT_COMM {
                // Device is talking; give it time to post its signature.
                if self
                    .wait_set(port_reg(port, PORT_SIG), SIG_READY_MASK, SIG_READY, timeout_us)
                    .is_err()
                {
                    continue;
                }
            }

            ide_init.notify_phase(IdeInitPhase::BeforeDevicePresenceDetection, port);

            let kind = match self.read(port_reg(port, PORT_SIG)) & SIG_MASK {
                SIG_ATAPI => DeviceKind::CdRom,
                SIG_ATA => DeviceKind::HardDisk,
                _ => continue,
            };

            let mut identify = Box::new(IdentifyData::zeroed());
            let status = match kind {
                DeviceKind::CdRom => self.identify_packet(port, 0, &mut identify, timeout_us),
                _ => self.identify(port, 0, &mut identify, timeout_us),
            };
            if let Err(e) = status {
                log::warn!("AHCI port {}: identify failed: {:?}", port, e);
                continue;
            }

            ide_init.submit_data(port, 0, &identify);
            let modes = match ide_init.calculate_mode(port, 0) {
                Ok(m) => m,
                Err(_) => continue,
            };

            // PIO first, then the best DMA flavor the device offers.
            let mut negotiated = false;
            if let Some(pio) = modes.pio {
                let category =
                    if pio > 2 { transfer_mode::FLOW_PIO } else { transfer_mode::DEFAULT_PIO };
                let mode = TransferMode { mode_category: category, mode_number: pio };
                negotiated = self.set_transfer_mode(port, 0, mode, timeout_us).is_ok();
            }
            if let Some(udma) = modes.udma {
                let mode =
                    TransferMode { mode_category: transfer_mode::UDMA, mode_number: udma };
                negotiated = self.set_transfer_mode(port, 0, mode, timeout_us).is_ok();
            } else if let Some(mdma) = modes.multi_word_dma {
                let mode = TransferMode {
                    mode_category: transfer_mode::MULTI_WORD_DMA,
                    mode_number: mdma,
                };
                negotiated = self.set_transfer_mode(port, 0, mode, timeout_us).is_ok();
            }
            if !negotiated {
                log::warn!("AHCI port {}: transfer mode negotiation failed", port);
                continue;
            }
            ide_init.set_timing(port, 0, &modes);

            log::info!("AHCI port {}: {:?} attached", port, kind);
            devices.push(AttachedDevice { port: port as u16, pm_port: 0xFFFF, kind, identify });
        }

        ide_init.notify_phase(IdeInitPhase::AfterChannelEnumeration, 0);
        Ok(devices)
    }

    // ------------------------------------------------------------------
    // Command pipeline
    // ------------------------------------------------------------------

    /// Fill the shared command table and slot 0 of the command list.
    #[allow(clippy::too_many_arguments)]
    fn build_command(
        &mut self,
        port: u8,
        pm_port: u8,
        cfis: &CommandFis,
        header_flags: u16,
        atapi: Option<&[u8]>,
        data_bus: u64,
        data_len: usize,
        slot: usize,
    ) -> Result<()> {
        let prdtl = prdt_count(data_len);
        if prdtl > PRDT_CAPACITY || prdtl > cmd::PRDT_ARCH_MAX {
            return Err(Error::OutOfResources);
        }

        // Fresh receive area and command table for every command.
        unsafe {
            ptr::write_bytes(self.rfis_base(port), 0, RECEIVED_FIS_SIZE);
            ptr::write_bytes(self.mem().cmd_table.cpu, 0, COMMAND_TABLE_PAGES * 4096);
        }

        let mut fis = *cfis;
        fis.set_port_multiplier(pm_port);
        unsafe {
            ptr::copy_nonoverlapping(
                fis.as_bytes().as_ptr(),
                self.mem().cmd_table.cpu,
                FIS_REGISTER_H2D_LEN,
            );
        }

        let mut flags = header_flags;
        let cmd_offset = port_reg(port, PORT_CMD);
        if let Some(cdb) = atapi {
            if cdb.len() < 12 || cdb.len() > 16 {
                return Err(Error::InvalidParameter);
            }
            unsafe {
                ptr::copy_nonoverlapping(
                    cdb.as_ptr(),
                    self.mem().cmd_table.cpu.add(COMMAND_TABLE_ACMD_OFFSET),
                    cdb.len(),
                );
            }
            flags |= CommandHeader::FLAG_ATAPI | CommandHeader::FLAG_PREFETCH;
            if data_len == 0 {
                flags |= CommandHeader::FLAG_CLEAR_BUSY;
            }
            self.or(cmd_offset, PORT_CMD_DLAE | PORT_CMD_ATAPI);
        } else {
            self.and(cmd_offset, !(PORT_CMD_DLAE | PORT_CMD_ATAPI));
        }

        // Scatter table: 4 MiB entries, interrupt raised by the last.
        let mut remaining = data_len;
        let mut addr = data_bus;
        for index in 0..prdtl {
            let chunk = remaining.min(cmd::MAX_DATA_PER_PRDT);
            let entry = PrdEntry::new(addr, chunk, index == prdtl - 1);
            unsafe {
                ptr::copy_nonoverlapping(
                    entry.as_bytes().as_ptr(),
                    self.mem().cmd_table.cpu.add(COMMAND_TABLE_PRDT_OFFSET + index * 16),
                    16,
                );
            }
            remaining -= chunk;
            addr += chunk as u64;
        }

        let mut header = CommandHeader {
            flags,
            prdtl: prdtl as u16,
            prdbc: 0,
            ctba: self.mem().cmd_table.bus as u32,
            ctbau: (self.mem().cmd_table.bus >> 32) as u32,
            reserved: [0; 4],
        };
        header.set_cfl(FIS_REGISTER_H2D_LEN / 4);
        header.set_pm_port(pm_port);
        unsafe {
            ptr::copy_nonoverlapping(
                header.as_bytes().as_ptr(),
                self.mem().cmd_list.cpu.add(slot * 32),
                32,
            );
        }
        self.pci.flush();
        Ok(())
    }

    fn clear_port_status(&self, port: u8) {
        self.write(port_reg(port, PORT_IS), self.read(port_reg(port, PORT_IS)));
        self.write(port_reg(port, PORT_SERR), PORT_SERR_CLEAR);
    }

    fn enable_fis_receive(&self, port: u8, timeout_us: u64) -> Result<()> {
        self.or(port_reg(port, PORT_CMD), PORT_CMD_FRE);
        self.wait_set(port_reg(port, PORT_CMD), PORT_CMD_FR, PORT_CMD_FR, timeout_us)
    }

    fn disable_fis_receive(&self, port: u8, timeout_us: u64) -> Result<()> {
        self.and(port_reg(port, PORT_CMD), !PORT_CMD_FRE);
        self.wait_set(port_reg(port, PORT_CMD), PORT_CMD_FR, 0, timeout_us)
    }

    fn start_command(&mut self, port: u8, slot: usize, timeout_us: u64) -> Result<()> {
        self.clear_port_status(port);
        self.enable_fis_receive(port, timeout_us)?;

        let slot_bit = 1u32 << slot;
        let sact = port_reg(port, PORT_SACT);
        self.and(sact, 0);
        self.or(sact, slot_bit);
        let ci = port_reg(port, PORT_CI);
        self.and(ci, 0);
        self.or(ci, slot_bit);

        let cmd_offset = port_reg(port, PORT_CMD);
        let port_cmd = self.read(cmd_offset);
        let mut start_bits = 0;
        if port_cmd & PORT_CMD_ALPE != 0 {
            start_bits = (port_cmd & !PORT_CMD_ICC_MASK) | PORT_CMD_ICC_ACTIVE;
        }

        // A device still holding BSY or DRQ needs a command-list
        // override before ST, when the HBA can do one.
        let tfd = self.read(port_reg(port, PORT_TFD));
        if tfd & (PORT_TFD_BSY | PORT_TFD_DRQ) != 0 && self.supports_clo {
            self.or(cmd_offset, PORT_CMD_CLO);
            let _ = self.wait_set(cmd_offset, PORT_CMD_CLO, 0, timeout_us);
        }

        self.or(cmd_offset, PORT_CMD_ST | start_bits);
        Ok(())
    }

    fn stop_command(&self, port: u8, timeout_us: u64) -> Result<()> {
        let cmd_offset = port_reg(port, PORT_CMD);
        let value = self.read(cmd_offset);
        if value & (PORT_CMD_ST | PORT_CMD_CR) == 0 {
            return Ok(());
        }
        if value & PORT_CMD_ST != 0 {
            self.and(cmd_offset, !PORT_CMD_ST);
        }
        self.wait_set(cmd_offset, PORT_CMD_CR, 0, timeout_us)
    }

    /// Latched task-file or host-bus errors turn into device-error.
    fn check_port_errors(&self, port: u8) -> Result<()> {
        if self.read(port_reg(port, PORT_IS)) & PORT_IS_FATAL != 0 {
            return Err(Error::DeviceError);
        }
        Ok(())
    }

    /// Wait until the receive area holds a FIS of `fis_type` at
    /// `offset`.
    fn wait_for_fis(&self, port: u8, offset: usize, fis_type: u8, timeout_us: u64) -> Result<()> {
        let base = self.rfis_base(port);
        time::wait_cond(self.pci.as_ref(), timeout_us, || {
            let word = unsafe { ptr::read_volatile(base.add(offset) as *const u32) };
            word & FIS_TYPE_MASK == fis_type as u32
        })
    }

    /// Copy the device-to-host register FIS into the status block.
    fn fill_status_block(&self, port: u8, asb: &mut AtaStatusBlock) {
        let mut raw = [0u8; core::mem::size_of::<ReceivedFis>()];
        unsafe {
            ptr::copy_nonoverlapping(
                self.rfis_base(port).add(RFIS_D2H_OFFSET),
                raw.as_mut_ptr(),
                raw.len(),
            );
        }
        let fis = ReceivedFis::read_from_bytes(&raw).unwrap_or_default();
        if fis.fis_type != FIS_REGISTER_D2H {
            return;
        }
        asb.status = fis.status;
        asb.error = fis.error;
        asb.sector_number = fis.lba_low;
        asb.cylinder_low = fis.lba_mid;
        asb.cylinder_high = fis.lba_high;
        asb.device_head = fis.device;
        asb.sector_number_exp = fis.lba_low_exp;
        asb.cylinder_low_exp = fis.lba_mid_exp;
        asb.cylinder_high_exp = fis.lba_high_exp;
        asb.sector_count = fis.count;
        asb.sector_count_exp = fis.count_exp;
    }

    fn teardown_command(&self, port: u8, timeout_us: u64) {
        let _ = self.stop_command(port, timeout_us);
        let _ = self.disable_fis_receive(port, timeout_us);
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    /// PIO data transfer; waits for the device's PIO setup FIS before
    /// watching the command-issue register.
    #[allow(clippy::too_many_arguments)]
    pub fn pio_transfer(
        &mut self,
        port: u8,
        pm_port: u8,
        atapi: Option<&[u8]>,
        read: bool,
        acb: &AtaCommandBlock,
        asb: &mut AtaStatusBlock,
        data: &mut [u8],
        timeout_us: u64,
    ) -> Result<()> {
        let op = if read { BusMasterOp::Write } else { BusMasterOp::Read };
        let (data_bus, mapping) = self.pci.map(op, data.as_mut_ptr(), data.len())?;

        let cfis = CommandFis::from_command_block(acb);
        let flags = if read { 0 } else { CommandHeader::FLAG_WRITE };

        let outcome = (|| {
            self.build_command(port, pm_port, &cfis, flags, atapi, data_bus, data.len(), 0)?;
            self.start_command(port, 0, timeout_us)?;

            self.wait_for_fis(port, RFIS_PIO_SETUP_OFFSET, FIS_PIO_SETUP, timeout_us)?;
            self.wait_set(port_reg(port, PORT_CI), 1 << 0, 0, timeout_us)?;
            self.wait_set(port_reg(port, PORT_IS), PORT_IS_PSS, PORT_IS_PSS, timeout_us)?;
            self.check_port_errors(port)
        })();

        self.teardown_command(port, timeout_us);
        self.fill_status_block(port, asb);
        self.pci.unmap(mapping);
        outcome
    }

    /// DMA transfer. With `state` supplied the call is non-blocking:
    /// the command is started on the first invocation and `NotReady` is
    /// reported until the descriptor-processed interrupt latches.
    #[allow(clippy::too_many_arguments)]
    pub fn dma_transfer(
        &mut self,
        port: u8,
        pm_port: u8,
        atapi: Option<&[u8]>,
        read: bool,
        acb: &AtaCommandBlock,
        asb: &mut AtaStatusBlock,
        data: &mut [u8],
        timeout_us: u64,
        mut state: Option<&mut DmaState>,
    ) -> Result<()> {
        let fresh = state.as_ref().map(|s| !s.started).unwrap_or(true);
        let mut local_mapping = None;

        if fresh {
            let op = if read { BusMasterOp::Write } else { BusMasterOp::Read };
            let (data_bus, mapping) = self.pci.map(op, data.as_mut_ptr(), data.len())?;

            let cfis = CommandFis::from_command_block(acb);
            let flags = if read { 0 } else { CommandHeader::FLAG_WRITE };

            let started = (|| {
                self.build_command(port, pm_port, &cfis, flags, atapi, data_bus, data.len(), 0)?;
                self.start_command(port, 0, timeout_us)
            })();

            if let Err(e) = started {
                self.teardown_command(port, timeout_us);
                self.pci.unmap(mapping);
                return Err(e);
            }

            match state.as_mut() {
                Some(s) => {
                    s.started = true;
                    s.mapping = Some(mapping);
                }
                None => local_mapping = Some(mapping),
            }
        }

        let outcome = if state.is_some() {
            // Non-blocking peek at the descriptor-processed latch.
            if self.read(port_reg(port, PORT_IS)) & PORT_IS_DPS == 0 {
                self.check_port_errors(port).and(Err(Error::NotReady))
            } else {
                self.wait_set(port_reg(port, PORT_CI), 1 << 0, 0, timeout_us)
                    .and_then(|()| {
                        self.wait_set(
                            port_reg(port, PORT_IS),
                            PORT_IS_DHRS,
                            PORT_IS_DHRS,
                            timeout_us,
                        )
                    })
                    .and_then(|()| self.check_port_errors(port))
            }
        } else {
            self.wait_set(port_reg(port, PORT_IS), PORT_IS_DPS, PORT_IS_DPS, timeout_us)
                .and_then(|()| self.wait_set(port_reg(port, PORT_CI), 1 << 0, 0, timeout_us))
                .and_then(|()| {
                    self.wait_set(port_reg(port, PORT_IS), PORT_IS_DHRS, PORT_IS_DHRS, timeout_us)
                })
                .and_then(|()| self.check_port_errors(port))
        };

        if outcome == Err(Error::NotReady) {
            return Err(Error::NotReady);
        }

        // Terminal: wind the port down and release the mapping.
        self.teardown_command(port, timeout_us);
        self.fill_status_block(port, asb);

        let mapping = match state.as_mut() {
            Some(s) => s.mapping.take(),
            None => local_mapping,
        };
        if let Some(mapping) = mapping {
            self.pci.unmap(mapping);
        }

        outcome
    }

    /// Command without a data phase; completion is the device-to-host
    /// register FIS.
    #[allow(clippy::too_many_arguments)]
    pub fn non_data_transfer(
        &mut self,
        port: u8,
        pm_port: u8,
        atapi: Option<&[u8]>,
        acb: &AtaCommandBlock,
        asb: &mut AtaStatusBlock,
        timeout_us: u64,
    ) -> Result<()> {
        let cfis = CommandFis::from_command_block(acb);

        let outcome = (|| {
            self.build_command(port, pm_port, &cfis, 0, atapi, 0, 0, 0)?;
            self.start_command(port, 0, timeout_us)?;

            self.wait_for_fis(port, RFIS_D2H_OFFSET, FIS_REGISTER_D2H, timeout_us)?;
            self.wait_set(port_reg(port, PORT_CI), 1 << 0, 0, timeout_us)?;
            self.wait_set(port_reg(port, PORT_IS), PORT_IS_DHRS, PORT_IS_DHRS, timeout_us)?;
            self.check_port_errors(port)
        })();

        self.teardown_command(port, timeout_us);
        self.fill_status_block(port, asb);
        outcome
    }

    // ------------------------------------------------------------------
    // Device commands
    // ------------------------------------------------------------------

    pub fn identify(
        &mut self,
        port: u8,
        pm_port: u8,
        identify: &mut IdentifyData,
        timeout_us: u64,
    ) -> Result<()> {
        let acb = AtaCommandBlock {
            command: ata::ATA_CMD_IDENTIFY,
            sector_count: 1,
            ..Default::default()
        };
        let mut asb = AtaStatusBlock::default();
        self.pio_transfer(port, pm_port, None, true, &acb, &mut asb, identify.as_mut_bytes(), timeout_us)
    }

    pub fn identify_packet(
        &mut self,
        port: u8,
        pm_port: u8,
        identify: &mut IdentifyData,
        timeout_us: u64,
    ) -> Result<()> {
        let acb = AtaCommandBlock {
            command: ata::ATA_CMD_IDENTIFY_PACKET,
            sector_count: 1,
            ..Default::default()
        };
        let mut asb = AtaStatusBlock::default();
        self.pio_transfer(port, pm_port, None, true, &acb, &mut asb, identify.as_mut_bytes(), timeout_us)
    }

    /// SET FEATURES with the given sub-command and value.
    pub fn device_set_feature(
        &mut self,
        port: u8,
        pm_port: u8,
        feature: u8,
        value: u8,
        timeout_us: u64,
    ) -> Result<()> {
        let acb = AtaCommandBlock {
            command: ata::ATA_CMD_SET_FEATURES,
            features: feature,
            sector_count: value,
            ..Default::default()
        };
        let mut asb = AtaStatusBlock::default();
        self.non_data_transfer(port, pm_port, None, &acb, &mut asb, timeout_us)
    }

    fn set_transfer_mode(
        &mut self,
        port: u8,
        pm_port: u8,
        mode: TransferMode,
        timeout_us: u64,
    ) -> Result<()> {
        self.device_set_feature(
            port,
            pm_port,
            ata::ATA_SUB_CMD_SET_TRANSFER_MODE,
            mode.encode(),
            timeout_us,
        )
    }

    /// Execute one ATAPI packet. The cylinder registers carry the
    /// per-drain byte-count ceiling; the device picks its own count.
    #[allow(clippy::too_many_arguments)]
    pub fn packet_execute(
        &mut self,
        port: u8,
        pm_port: u8,
        cdb: &[u8],
        read: bool,
        data: &mut [u8],
        asb: &mut AtaStatusBlock,
        timeout_us: u64,
    ) -> Result<()> {
        let acb = AtaCommandBlock {
            command: ata::ATA_CMD_PACKET,
            features: 0x00,
            cylinder_low: (ata::ATAPI_MAX_BYTE_COUNT & 0xFF) as u8,
            cylinder_high: (ata::ATAPI_MAX_BYTE_COUNT >> 8) as u8,
            ..Default::default()
        };
        if data.is_empty() {
            self.non_data_transfer(port, pm_port, Some(cdb), &acb, asb, timeout_us)
        } else {
            self.pio_transfer(port, pm_port, Some(cdb), read, &acb, asb, data, timeout_us)
        }
    }

    // ------------------------------------------------------------------
    // Port reset
    // ------------------------------------------------------------------

    /// Re-initialize the link of one port.
    pub fn port_reset(&mut self, port: u8, timeout_us: u64) -> Result<()> {
        if !self.port_implemented(port) {
            return Err(Error::InvalidParameter);
        }

        self.clear_port_status(port);
        self.stop_command(port, timeout_us)?;
        self.disable_fis_receive(port, timeout_us)?;
        self.enable_fis_receive(port, timeout_us)?;

        let sctl = port_reg(port, PORT_SCTL);
        self.or(sctl, PORT_SCTL_DET_INIT);
        self.pci.stall_us(PORT_RESET_DET_US);
        self.and(sctl, !PORT_SCTL_DET_MASK);
        self.pci.stall_us(PORT_RESET_DET_US);

        self.wait_set(
            port_reg(port, PORT_SSTS),
            PORT_SSTS_DET_MASK,
            PORT_SSTS_DET_PRESENT_COMM,
            timeout_us,
        )?;

        self.write(port_reg(port, PORT_SERR), PORT_SERR_CLEAR);
        Ok(())
    }

    /// Release the descriptor memory.
    pub fn stop(&mut self) {
        if let Some(mem) = self.mem.take() {
            self.free_region(mem.cmd_table);
            self.free_region(mem.cmd_list);
            self.free_region(mem.rfis);
        }
    }
}

impl Drop for AhciController {
    fn drop(&mut self) {
        self.stop();
    }
}
