//! AHCI engine integration tests against a functional HBA model that
//! walks the command list, command table and PRD entries in host
//! memory and deposits FISes into the receive area.

mod common;

use std::collections::HashMap;
use std::rc::Rc;

use common::{Harness, HwModel};
use hostctl::ahci::cmd::{
    COMMAND_TABLE_ACMD_OFFSET, COMMAND_TABLE_PRDT_OFFSET, RFIS_D2H_OFFSET, RFIS_PIO_SETUP_OFFSET,
};
use hostctl::ahci::regs::*;
use hostctl::ata::{self, AtaCommandBlock, AtaProtocol, DeviceKind};
use hostctl::passthru::task::AtaRequestPacket;
use hostctl::passthru::{DataDirection, EngineMode, PassThruConfig, PassThruInstance, ScsiRequestPacket};
use hostctl::policy::DefaultIdeInit;

const TIMEOUT: u64 = 1_000_000;

#[derive(Clone, Copy, PartialEq)]
enum Attached {
    Disk,
    CdRom,
}

struct AhciModel {
    regs: HashMap<u64, u32>,
    attached: Attached,
    identify: [u16; 256],
    disk: Vec<u8>,
    read_capacity_failures: u32,
    sense_key: u8,
    dma_delay_ticks: u32,
    prd_log: Vec<(u64, u32)>,
    command_log: Vec<u8>,
    sctl_det_log: Vec<u32>,
}

fn ahci_disk_identify() -> [u16; 256] {
    let mut id = [0u16; 256];
    id[0] = 0x0040;
    id[47] = 0x8010;
    id[53] = 1 << 2;
    id[61] = 0x0010;
    id[64] = 0x0003;
    id[88] = 0x003F;
    id
}

fn ahci_cdrom_identify() -> [u16; 256] {
    let mut id = [0u16; 256];
    id[0] = 0x8580;
    id[64] = 0x0003;
    id
}

impl AhciModel {
    fn new(attached: Attached) -> Self {
        let mut regs = HashMap::new();
        // Two ports, command-list override, 64-bit addressing.
        regs.insert(HBA_CAP, 1 | (1 << 24) | (1u32 << 31));
        regs.insert(HBA_PI, 0x1);
        regs.insert(port_reg(0, PORT_SSTS), PORT_SSTS_DET_PRESENT_COMM);
        regs.insert(
            port_reg(0, PORT_SIG),
            match attached {
                Attached::Disk => 0x0000_0101,
                Attached::CdRom => 0xEB14_0101,
            },
        );
        AhciModel {
            regs,
            attached,
            identify: match attached {
                Attached::Disk => ahci_disk_identify(),
                Attached::CdRom => ahci_cdrom_identify(),
            },
            disk: vec![0; 1024 * 1024],
            read_capacity_failures: 0,
            sense_key: 0,
            dma_delay_ticks: 0,
            prd_log: Vec::new(),
            command_log: Vec::new(),
            sctl_det_log: Vec::new(),
        }
    }

    fn reg(&self, offset: u64) -> u32 {
        *self.regs.get(&offset).unwrap_or(&0)
    }

    fn set_reg(&mut self, offset: u64, value: u32) {
        self.regs.insert(offset, value);
    }

    fn or_is(&mut self, bits: u32) {
        let is = self.reg(port_reg(0, PORT_IS));
        self.set_reg(port_reg(0, PORT_IS), is | bits);
    }

    fn rfis_base(&self) -> u64 {
        self.reg(port_reg(0, PORT_FB)) as u64
    }

    fn post_pio_setup_fis(&mut self, h: &Harness) {
        h.write_bus_u32(self.rfis_base() + RFIS_PIO_SETUP_OFFSET as u64, 0x5F);
    }

    fn post_d2h_fis(&mut self, h: &Harness, dev_status: u8, dev_error: u8) {
        let base = self.rfis_base() + RFIS_D2H_OFFSET as u64;
        h.write_bus_u32(base, 0x34 | ((dev_status as u32) << 16) | ((dev_error as u32) << 24));
    }

    /// Scatter `data` across the PRD entries of the active command
    /// table, logging each entry.
    fn scatter(&mut self, h: &Harness, ctba: u64, prdtl: usize, data: &[u8]) {
        self.prd_log.clear();
        let mut offset = 0;
        for index in 0..prdtl {
            let entry = ctba + COMMAND_TABLE_PRDT_OFFSET as u64 + index as u64 * 16;
            let dba =
                h.read_bus_u32(entry) as u64 | ((h.read_bus_u32(entry + 4) as u64) << 32);
            let dbc_ioc = h.read_bus_u32(entry + 12);
            self.prd_log.push((dba, dbc_ioc));

            let len = ((dbc_ioc & 0x3F_FFFF) as usize + 1).min(data.len() - offset);
            h.write_bus(dba, &data[offset..offset + len]);
            offset += len;
            if offset >= data.len() {
                break;
            }
        }
    }

    fn gather(&mut self, h: &Harness, ctba: u64, prdtl: usize, data: &mut [u8]) {
        self.prd_log.clear();
        let mut offset = 0;
        for index in 0..prdtl {
            let entry = ctba + COMMAND_TABLE_PRDT_OFFSET as u64 + index as u64 * 16;
            let dba =
                h.read_bus_u32(entry) as u64 | ((h.read_bus_u32(entry + 4) as u64) << 32);
            let dbc_ioc = h.read_bus_u32(entry + 12);
            self.prd_log.push((dba, dbc_ioc));

            let len = ((dbc_ioc & 0x3F_FFFF) as usize + 1).min(data.len() - offset);
            h.read_bus(dba, &mut data[offset..offset + len]);
            offset += len;
            if offset >= data.len() {
                break;
            }
        }
    }

    fn identify_bytes(&self) -> Vec<u8> {
        self.identify.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// One command-processing pass, as the HBA would do between frames.
    fn tick_once(&mut self, h: &Harness) {
        let cmd = self.reg(port_reg(0, PORT_CMD));
        let ci = self.reg(port_reg(0, PORT_CI));
        if cmd & PORT_CMD_ST == 0 || ci == 0 {
            return;
        }

        let clb = self.reg(port_reg(0, PORT_CLB)) as u64;
        let header0 = h.read_bus_u32(clb);
        let prdtl = (header0 >> 16) as usize;
        let ctba = h.read_bus_u32(clb + 8) as u64;

        let command = {
            let mut fis = [0u8; 4];
            h.read_bus(ctba, &mut fis);
            fis[2]
        };
        self.command_log.push(command);

        match command {
            ata::ATA_CMD_IDENTIFY | ata::ATA_CMD_IDENTIFY_PACKET => {
                let bytes = self.identify_bytes();
                self.scatter(h, ctba, prdtl, &bytes);
                self.post_pio_setup_fis(h);
                self.post_d2h_fis(h, 0x50, 0);
                self.or_is(PORT_IS_PSS | PORT_IS_DHRS);
            }
            ata::ATA_CMD_SET_FEATURES => {
                self.post_d2h_fis(h, 0x50, 0);
                self.or_is(PORT_IS_DHRS);
            }
            ata::ATA_CMD_PACKET => {
                let mut cdb = [0u8; 12];
                h.read_bus(ctba + COMMAND_TABLE_ACMD_OFFSET as u64, &mut cdb);
                self.packet(h, ctba, prdtl, &cdb);
            }
            ata::ATA_CMD_READ_DMA | ata::ATA_CMD_READ_DMA_EXT => {
                if self.dma_delay_ticks > 0 {
                    self.dma_delay_ticks -= 1;
                    self.command_log.pop();
                    return;
                }
                let disk = self.disk.clone();
                self.scatter(h, ctba, prdtl, &disk);
                self.post_d2h_fis(h, 0x50, 0);
                self.or_is(PORT_IS_DPS | PORT_IS_DHRS);
            }
            ata::ATA_CMD_WRITE_DMA | ata::ATA_CMD_WRITE_DMA_EXT => {
                if self.dma_delay_ticks > 0 {
                    self.dma_delay_ticks -= 1;
                    self.command_log.pop();
                    return;
                }
                let mut disk = std::mem::take(&mut self.disk);
                self.gather(h, ctba, prdtl, &mut disk);
                self.disk = disk;
                self.post_d2h_fis(h, 0x50, 0);
                self.or_is(PORT_IS_DPS | PORT_IS_DHRS);
            }
            _ => {
                self.post_d2h_fis(h, 0x51, 0x04);
                self.or_is(PORT_IS_DHRS | PORT_IS_TFES);
            }
        }

        self.set_reg(port_reg(0, PORT_CI), 0);
    }

    fn packet(&mut self, h: &Harness, ctba: u64, prdtl: usize, cdb: &[u8; 12]) {
        match cdb[0] {
            ata::ATAPI_CMD_READ_CAPACITY => {
                if self.read_capacity_failures > 0 {
                    self.read_capacity_failures -= 1;
                    self.sense_key = 0x03;
                    self.post_pio_setup_fis(h);
                    self.post_d2h_fis(h, 0x51, 0x40);
                    self.or_is(PORT_IS_PSS | PORT_IS_DHRS | PORT_IS_TFES);
                    return;
                }
                let response = [0u8, 0x03, 0x28, 0xFF, 0, 0, 0x08, 0];
                self.scatter(h, ctba, prdtl, &response);
                self.post_pio_setup_fis(h);
                self.post_d2h_fis(h, 0x50, 0);
                self.or_is(PORT_IS_PSS | PORT_IS_DHRS);
            }
            ata::ATAPI_CMD_REQUEST_SENSE => {
                let mut sense = [0u8; 18];
                sense[0] = 0x70;
                sense[2] = self.sense_key;
                sense[7] = 10;
                self.sense_key = 0;
                self.scatter(h, ctba, prdtl, &sense);
                self.post_pio_setup_fis(h);
                self.post_d2h_fis(h, 0x50, 0);
                self.or_is(PORT_IS_PSS | PORT_IS_DHRS);
            }
            ata::ATAPI_CMD_TEST_UNIT_READY => {
                self.post_d2h_fis(h, 0x50, 0);
                self.or_is(PORT_IS_DHRS);
            }
            _ => {
                self.post_pio_setup_fis(h);
                self.post_d2h_fis(h, 0x51, 0x04);
                self.or_is(PORT_IS_PSS | PORT_IS_DHRS | PORT_IS_TFES);
            }
        }
    }
}

impl HwModel for AhciModel {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn io_read(&mut self, _h: &Harness, _bar: u8, _offset: u64, _width: usize) -> u32 {
        0
    }

    fn io_write(&mut self, _h: &Harness, _bar: u8, _offset: u64, _width: usize, _value: u32) {}

    fn mem_read32(&mut self, _h: &Harness, _bar: u8, offset: u64) -> u32 {
        let mut value = self.reg(offset);
        if offset == port_reg(0, PORT_CMD) {
            // FIS-receive and command-list engines mirror their enable
            // bits.
            if value & PORT_CMD_FRE != 0 {
                value |= PORT_CMD_FR;
            }
            if value & PORT_CMD_ST != 0 {
                value |= PORT_CMD_CR;
            }
        }
        value
    }

    fn mem_write32(&mut self, _h: &Harness, _bar: u8, offset: u64, value: u32) {
        if offset == HBA_GHC {
            // HBA reset self-clears.
            self.set_reg(offset, value & !GHC_RESET);
            return;
        }
        if offset == port_reg(0, PORT_IS) || offset == port_reg(0, PORT_SERR) {
            let old = self.reg(offset);
            self.set_reg(offset, old & !value);
            return;
        }
        if offset == port_reg(0, PORT_SCTL) {
            self.sctl_det_log.push(value & PORT_SCTL_DET_MASK);
        }
        self.set_reg(offset, value);
    }

    fn tick(&mut self, h: &Harness, _us: u64) {
        self.tick_once(h);
    }
}

fn ahci_harness(attached: Attached) -> Rc<Harness> {
    let h = Harness::new();
    h.set_class_code(0x01, 0x06, 0x01);
    h.install_model(Box::new(AhciModel::new(attached)));
    h
}

fn start_instance(h: &Rc<Harness>) -> PassThruInstance {
    let mut ide_init = DefaultIdeInit::default();
    PassThruInstance::start(
        h.clone(),
        &mut ide_init,
        PassThruConfig { timeout_us: TIMEOUT, ..Default::default() },
    )
    .unwrap()
}

#[test]
fn identify_issues_one_slot_with_single_prd_entry() {
    let h = ahci_harness(Attached::Disk);
    let instance = start_instance(&h);

    assert_eq!(instance.mode(), EngineMode::Ahci);
    let devices = instance.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].kind, DeviceKind::HardDisk);
    assert_eq!(devices[0].pm_port, 0xFFFF);

    // IDENTIFY is not an ATAPI response: word 0 bit 15 clear.
    assert!(!devices[0].identify.is_atapi());

    // The 512-byte response used one PRD entry of byte count 511 with
    // interrupt-on-completion.
    let prd_log = h.with_model(|m: &mut AhciModel| m.prd_log.clone());
    assert_eq!(prd_log.len(), 1);
    let (_, dbc_ioc) = prd_log[0];
    assert_eq!(dbc_ioc & 0x3F_FFFF, 511);
    assert!(dbc_ioc & (1 << 31) != 0);

    // Mode negotiation reached the device.
    let log = h.with_model(|m: &mut AhciModel| m.command_log.clone());
    assert!(log.contains(&ata::ATA_CMD_SET_FEATURES));
}

#[test]
fn read_capacity_retries_then_reports_sense() {
    let h = ahci_harness(Attached::CdRom);
    let mut instance = start_instance(&h);

    // Always failing: the retry loop runs its full budget.
    h.with_model(|m: &mut AhciModel| m.read_capacity_failures = 100);

    let mut target = [0xFFu8; 16];
    let mut lun = 0;
    instance.get_next_target_lun(&mut target, &mut lun).unwrap();

    let mut packet = ScsiRequestPacket {
        timeout_us: TIMEOUT,
        cdb: vec![ata::ATAPI_CMD_READ_CAPACITY, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        data: vec![0u8; 8],
        data_direction: DataDirection::Read,
        sense_data: vec![0u8; 18],
        host_adapter_status: 0,
        target_status: 0,
    };
    assert!(instance.scsi_pass_thru(&target, 0, &mut packet).is_err());

    let spent = h.with_model(|m: &mut AhciModel| 100 - m.read_capacity_failures);
    assert_eq!(spent, 5);

    // One 18-byte sense block, key not no-sense.
    assert_eq!(packet.sense_data.len(), 18);
    assert_ne!(packet.sense_data[2] & 0x0F, 0);

    // A single transient failure is absorbed by the retry loop.
    h.with_model(|m: &mut AhciModel| m.read_capacity_failures = 1);
    let mut packet = ScsiRequestPacket {
        timeout_us: TIMEOUT,
        cdb: vec![ata::ATAPI_CMD_READ_CAPACITY, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        data: vec![0u8; 8],
        data_direction: DataDirection::Read,
        sense_data: vec![0u8; 18],
        host_adapter_status: 0,
        target_status: 0,
    };
    instance.scsi_pass_thru(&target, 0, &mut packet).unwrap();
    assert_eq!(&packet.data[4..8], &[0, 0, 0x08, 0]);
}

#[test]
fn port_reset_runs_the_det_sequence() {
    let h = ahci_harness(Attached::Disk);
    let mut instance = start_instance(&h);

    h.with_model(|m: &mut AhciModel| m.sctl_det_log.clear());
    instance.reset_port(0).unwrap();

    let det_log = h.with_model(|m: &mut AhciModel| m.sctl_det_log.clone());
    assert_eq!(det_log, vec![PORT_SCTL_DET_INIT, 0]);

    assert!(instance.reset_port(1).is_err());
}

#[test]
fn async_tasks_complete_in_fifo_order() {
    let h = ahci_harness(Attached::Disk);
    let mut instance = start_instance(&h);

    let completions = Rc::new(std::cell::RefCell::new(Vec::new()));

    for tag in 0..3u8 {
        let sink = completions.clone();
        let packet = AtaRequestPacket::non_data(
            AtaCommandBlock { command: ata::ATA_CMD_SET_FEATURES, ..Default::default() },
            TIMEOUT,
        );
        instance
            .ata_pass_thru_async(
                0,
                0xFFFF,
                packet,
                Box::new(move |done| sink.borrow_mut().push((tag, done.asb.status))),
            )
            .unwrap();
    }

    assert_eq!(instance.pending_tasks(), 3);
    instance.poll_async_tasks();
    assert_eq!(instance.pending_tasks(), 0);

    let done = completions.borrow().clone();
    assert_eq!(done, vec![(0, 0x50), (1, 0x50), (2, 0x50)]);
}

#[test]
fn failed_task_drains_the_whole_queue() {
    let h = ahci_harness(Attached::Disk);
    let mut instance = start_instance(&h);

    let completions = Rc::new(std::cell::RefCell::new(Vec::new()));

    // Second command is unknown to the model and fails with a task-file
    // error; the third must be aborted without reaching the hardware.
    let commands =
        [ata::ATA_CMD_SET_FEATURES, 0xDE, ata::ATA_CMD_SET_FEATURES];
    for (tag, &command) in commands.iter().enumerate() {
        let sink = completions.clone();
        let packet =
            AtaRequestPacket::non_data(AtaCommandBlock { command, ..Default::default() }, TIMEOUT);
        instance
            .ata_pass_thru_async(
                0,
                0xFFFF,
                packet,
                Box::new(move |done| sink.borrow_mut().push((tag, done.asb.status))),
            )
            .unwrap();
    }

    instance.poll_async_tasks();
    assert_eq!(instance.pending_tasks(), 0);

    let done = completions.borrow().clone();
    assert_eq!(done.len(), 3);
    assert_eq!(done[0], (0, 0x50));
    // Aborted status on the failing task and everything behind it.
    assert_eq!(done[1].1, 0x01);
    assert_eq!(done[2].1, 0x01);

    let log = h.with_model(|m: &mut AhciModel| m.command_log.clone());
    assert_eq!(log.iter().filter(|&&c| c == 0xDE).count(), 1);
}

#[test]
fn nonblocking_dma_stays_queued_until_descriptor_processed() {
    let h = ahci_harness(Attached::Disk);
    let mut instance = start_instance(&h);

    h.with_model(|m: &mut AhciModel| {
        m.dma_delay_ticks = u32::MAX; // hold the command until released
        m.disk[..4].copy_from_slice(&[0xCA, 0xFE, 0xBA, 0xBE]);
    });

    let completions = Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = completions.clone();
    let packet = AtaRequestPacket {
        protocol: AtaProtocol::UdmaIn,
        timeout_us: TIMEOUT,
        acb: AtaCommandBlock { command: ata::ATA_CMD_READ_DMA_EXT, ..Default::default() },
        asb: Default::default(),
        data: vec![0u8; 512],
    };
    instance
        .ata_pass_thru_async(
            0,
            0xFFFF,
            packet,
            Box::new(move |done| sink.borrow_mut().push(done)),
        )
        .unwrap();

    // Started but not finished: the task stays at the head.
    instance.poll_async_tasks();
    assert_eq!(instance.pending_tasks(), 1);
    assert!(completions.borrow().is_empty());

    // Release the device and let it complete the transfer.
    h.with_model(|m: &mut AhciModel| m.dma_delay_ticks = 0);
    h.with_model(|m: &mut AhciModel| m.tick_once(&h));

    instance.poll_async_tasks();
    assert_eq!(instance.pending_tasks(), 0);

    let done = completions.borrow();
    assert_eq!(done.len(), 1);
    assert_eq!(&done[0].data[..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
    assert_eq!(h.live_mappings(), 0);
}
