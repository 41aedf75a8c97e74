//! ATA/ATAPI pass-through facade
//!
//! The root object of the storage side: detects whether the controller
//! runs in IDE or AHCI mode, enumerates attached devices, and offers a
//! uniform submit/enumerate surface plus a SCSI-style surface for the
//! ATAPI devices. Non-blocking requests go through a FIFO served by the
//! periodic [`PassThruInstance::poll_async_tasks`] tick.

pub mod task;

use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::ahci::AhciController;
use crate::ata::{
    self, AtaProtocol, AtaStatusBlock, AttachedDevice, DeviceKind, IdentifyData,
};
use crate::devpath::{self, DevicePath};
use crate::error::{Error, Result};
use crate::ide::IdeController;
use crate::pci::{self, PciIo};
use crate::policy::{AtaAtapiPolicy, IdeControllerInit};
use crate::time::STALL_1_MS;

use task::{
    drain_with_error, AsyncEvent, AsyncTask, AtaRequestPacket, TaskQueue, TaskState,
    ABORTED_STATUS,
};

/// SCSI target identifiers are 16 opaque bytes; only the first two are
/// meaningful here.
pub const TARGET_MAX_BYTES: usize = 16;

/// Fixed SCSI status values reported through the SCSI surface.
pub const SCSI_STATUS_GOOD: u8 = 0x00;
pub const SCSI_STATUS_CHECK_CONDITION: u8 = 0x02;

/// READ CAPACITY attempts before the failure is surfaced.
const READ_CAPACITY_RETRIES: usize = 5;

/// Attribute bits advertised by [`PassThruInstance::attributes`].
pub mod mode {
    /// Commands may address physical devices.
    pub const PHYSICAL: u32 = 0x0001;
    /// Commands may address logical devices.
    pub const LOGICAL: u32 = 0x0002;
    /// Requests with a completion event are queued, not blocked on.
    pub const NON_BLOCKING: u32 = 0x0004;
}

/// Work mode the controller was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Ide,
    Ahci,
    Raid,
    Unknown,
}

/// Direction of the data phase of a SCSI request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    Read,
    Write,
    None,
}

/// One SCSI-style request against an ATAPI device.
pub struct ScsiRequestPacket {
    pub timeout_us: u64,
    pub cdb: Vec<u8>,
    pub data: Vec<u8>,
    pub data_direction: DataDirection,
    /// Pre-sized by the caller; truncated to the bytes actually
    /// gathered.
    pub sense_data: Vec<u8>,
    pub host_adapter_status: u8,
    pub target_status: u8,
}

enum Engine {
    Ide(IdeController),
    Ahci(AhciController),
}

/// Construction knobs of one pass-through instance.
pub struct PassThruConfig {
    pub policy: AtaAtapiPolicy,
    pub enable_smart: bool,
    pub timeout_us: u64,
}

impl Default for PassThruConfig {
    fn default() -> Self {
        PassThruConfig {
            policy: AtaAtapiPolicy::default(),
            enable_smart: true,
            timeout_us: ata::ATA_TIMEOUT_US,
        }
    }
}

/// The pass-through root object.
pub struct PassThruInstance {
    pci: Rc<dyn PciIo>,
    mode: EngineMode,
    engine: Engine,
    devices: Vec<AttachedDevice>,
    policy: AtaAtapiPolicy,
    io_align: u32,
    saved_attributes: u64,
    default_timeout_us: u64,

    previous_port: u16,
    previous_pm_port: u16,
    previous_target: (u8, u8),

    tasks: Mutex<TaskQueue>,
}

impl PassThruInstance {
    /// Attach to a mass-storage function, bring the engine up and
    /// enumerate what is connected.
    pub fn start(
        pci: Rc<dyn PciIo>,
        ide_init: &mut dyn IdeControllerInit,
        config: PassThruConfig,
    ) -> Result<Self> {
        let class = pci::read_class_code(pci.as_ref());
        if class.base_class != pci::PCI_CLASS_MASS_STORAGE {
            return Err(Error::Unsupported);
        }
        let mode = match class.sub_class {
            pci::PCI_SUBCLASS_IDE => EngineMode::Ide,
            pci::PCI_SUBCLASS_AHCI => EngineMode::Ahci,
            pci::PCI_SUBCLASS_RAID => EngineMode::Raid,
            _ => return Err(Error::Unsupported),
        };

        let saved_attributes = pci::enable_device(pci.as_ref());

        let (engine, devices) = match mode {
            EngineMode::Ide => {
                let mut ide = IdeController::new(pci.clone(), config.enable_smart)?;
                let devices = ide.enumerate(ide_init, config.timeout_us)?;
                (Engine::Ide(ide), devices)
            }
            // RAID-capable controllers are driven through their AHCI
            // register file.
            EngineMode::Ahci | EngineMode::Raid => {
                let mut ahci = AhciController::new(pci.clone());
                ahci.start(config.timeout_us)?;
                let devices = ahci.enumerate(ide_init, config.timeout_us)?;
                (Engine::Ahci(ahci), devices)
            }
            EngineMode::Unknown => return Err(Error::Unsupported),
        };

        log::info!(
            "pass-through instance in {:?} mode with {} device(s)",
            mode,
            devices.len()
        );

        Ok(PassThruInstance {
            pci,
            mode,
            engine,
            devices,
            policy: config.policy,
            io_align: core::mem::size_of::<usize>() as u32,
            saved_attributes,
            default_timeout_us: config.timeout_us,
            previous_port: 0xFFFF,
            previous_pm_port: 0xFFFF,
            previous_target: (0xFF, 0xFF),
            tasks: Mutex::new(TaskQueue::new()),
        })
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn io_align(&self) -> u32 {
        self.io_align
    }

    /// Capability set of both surfaces.
    pub fn attributes(&self) -> u32 {
        mode::PHYSICAL | mode::LOGICAL | mode::NON_BLOCKING
    }

    pub fn policy(&self) -> &AtaAtapiPolicy {
        &self.policy
    }

    pub fn devices(&self) -> &[AttachedDevice] {
        &self.devices
    }

    fn find_device(&self, port: u16, pm_port: u16) -> Option<&AttachedDevice> {
        self.devices.iter().find(|d| d.port == port && d.pm_port == pm_port)
    }

    // ------------------------------------------------------------------
    // ATA pass-through surface
    // ------------------------------------------------------------------

    fn validate_request(&self, port: u16, pm_port: u16, packet: &AtaRequestPacket) -> Result<()> {
        let device = self.find_device(port, pm_port).ok_or(Error::InvalidParameter)?;

        if !packet.data.is_empty() {
            if packet.data.as_ptr() as usize % self.io_align as usize != 0 {
                return Err(Error::InvalidParameter);
            }
            let max_bytes = device.identify.max_transfer_sectors() as u64
                * device.identify.block_size() as u64;
            if packet.data.len() as u64 > max_bytes {
                return Err(Error::BadBufferSize);
            }
        }

        match packet.protocol {
            AtaProtocol::NonData if !packet.data.is_empty() => Err(Error::InvalidParameter),
            _ => Ok(()),
        }
    }

    /// Run one request on the engine the instance was attached with.
    fn execute(
        &mut self,
        port: u16,
        pm_port: u16,
        packet: &mut AtaRequestPacket,
        state: Option<&mut TaskState>,
    ) -> Result<()> {
        let timeout = if packet.timeout_us == 0 {
            self.default_timeout_us
        } else {
            packet.timeout_us
        };

        match &mut self.engine {
            Engine::Ide(ide) => {
                // BARs can be reprogrammed between calls.
                ide.refresh_registers()?;
                let channel = port as u8;
                match packet.protocol {
                    AtaProtocol::NonData => {
                        ide.non_data_command(channel, &packet.acb, &mut packet.asb, timeout)
                    }
                    AtaProtocol::PioIn | AtaProtocol::PioOut => ide.pio_data_in_out(
                        channel,
                        packet.protocol == AtaProtocol::PioIn,
                        &packet.acb,
                        &mut packet.asb,
                        &mut packet.data,
                        timeout,
                    ),
                    AtaProtocol::UdmaIn | AtaProtocol::UdmaOut => {
                        let read = packet.protocol == AtaProtocol::UdmaIn;
                        let udma_state = match state {
                            Some(slot) => {
                                if matches!(slot, TaskState::Fresh) {
                                    *slot = TaskState::IdeUdma(Default::default());
                                }
                                match slot {
                                    TaskState::IdeUdma(s) => Some(s),
                                    _ => return Err(Error::InvalidParameter),
                                }
                            }
                            None => None,
                        };
                        ide.udma_in_out(
                            channel,
                            read,
                            &packet.acb,
                            &mut packet.asb,
                            &mut packet.data,
                            timeout,
                            udma_state,
                        )
                    }
                }
            }
            Engine::Ahci(ahci) => {
                // Devices directly on the HBA port are addressed with
                // the all-ones sentinel by the surface but port 0 on
                // the wire.
                let pm = if pm_port == 0xFFFF { 0 } else { pm_port as u8 };
                let port = port as u8;
                match packet.protocol {
                    AtaProtocol::NonData => ahci.non_data_transfer(
                        port,
                        pm,
                        None,
                        &packet.acb,
                        &mut packet.asb,
                        timeout,
                    ),
                    AtaProtocol::PioIn | AtaProtocol::PioOut => ahci.pio_transfer(
                        port,
                        pm,
                        None,
                        packet.protocol == AtaProtocol::PioIn,
                        &packet.acb,
                        &mut packet.asb,
                        &mut packet.data,
                        timeout,
                    ),
                    AtaProtocol::UdmaIn | AtaProtocol::UdmaOut => {
                        let read = packet.protocol == AtaProtocol::UdmaIn;
                        let dma_state = match state {
                            Some(slot) => {
                                if matches!(slot, TaskState::Fresh) {
                                    *slot = TaskState::AhciDma(Default::default());
                                }
                                match slot {
                                    TaskState::AhciDma(s) => Some(s),
                                    _ => return Err(Error::InvalidParameter),
                                }
                            }
                            None => None,
                        };
                        ahci.dma_transfer(
                            port,
                            pm,
                            None,
                            read,
                            &packet.acb,
                            &mut packet.asb,
                            &mut packet.data,
                            timeout,
                            dma_state,
                        )
                    }
                }
            }
        }
    }

    /// Blocking pass-through call. Outstanding non-blocking work is
    /// pushed to completion first so intermixed callers observe FIFO
    /// ordering.
    pub fn ata_pass_thru(
        &mut self,
        port: u16,
        pm_port: u16,
        packet: &mut AtaRequestPacket,
    ) -> Result<()> {
        self.validate_request(port, pm_port, packet)?;

        while !self.tasks.lock().is_empty() {
            self.poll_async_tasks();
            self.pci.stall_us(STALL_1_MS);
        }

        self.execute(port, pm_port, packet, None)
    }

    /// Queue a non-blocking pass-through request; `event` fires with
    /// the finished packet.
    pub fn ata_pass_thru_async(
        &mut self,
        port: u16,
        pm_port: u16,
        packet: AtaRequestPacket,
        event: AsyncEvent,
    ) -> Result<()> {
        self.validate_request(port, pm_port, &packet)?;

        let infinite_wait = packet.timeout_us == 0;
        let retries = packet.timeout_us / STALL_1_MS + 1;
        self.tasks.lock().push_back(AsyncTask {
            port,
            pm_port,
            packet,
            event,
            state: TaskState::Fresh,
            retries,
            infinite_wait,
        });
        Ok(())
    }

    /// The 1 ms dispatcher tick. Runs the head task; `NotReady` leaves
    /// it at the head for the next tick, any hard failure drains the
    /// whole queue with the aborted status.
    pub fn poll_async_tasks(&mut self) {
        loop {
            let mut current = match self.tasks.lock().pop_front() {
                Some(task) => task,
                None => return,
            };

            let outcome = self.execute(
                current.port,
                current.pm_port,
                &mut current.packet,
                Some(&mut current.state),
            );

            match outcome {
                Err(Error::NotReady) => {
                    if !current.infinite_wait {
                        current.retries -= 1;
                        if current.retries == 0 {
                            current.packet.asb.status = ABORTED_STATUS;
                            (current.event)(current.packet);
                            drain_with_error(&mut self.tasks.lock());
                            return;
                        }
                    }
                    self.tasks.lock().push_front(current);
                    return;
                }
                Ok(()) => {
                    (current.event)(current.packet);
                }
                Err(e) => {
                    log::debug!("non-blocking task failed: {:?}", e);
                    current.packet.asb.status = ABORTED_STATUS;
                    (current.event)(current.packet);
                    drain_with_error(&mut self.tasks.lock());
                    return;
                }
            }
        }
    }

    /// Queued non-blocking tasks.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    // ------------------------------------------------------------------
    // Enumeration cursors
    // ------------------------------------------------------------------

    /// Cursored port iteration in insertion order; `0xFFFF` restarts.
    pub fn get_next_port(&mut self, port: &mut u16) -> Result<()> {
        if *port == 0xFFFF {
            let first = self.devices.first().ok_or(Error::NotFound)?;
            *port = first.port;
            self.previous_port = first.port;
            return Ok(());
        }

        if *port != self.previous_port {
            return Err(Error::InvalidParameter);
        }

        let start = self
            .devices
            .iter()
            .position(|d| d.port == self.previous_port)
            .ok_or(Error::InvalidParameter)?;

        match self.devices[start..].iter().find(|d| d.port != self.previous_port) {
            Some(next) => {
                *port = next.port;
                self.previous_port = next.port;
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Cursored device iteration within one port.
    pub fn get_next_device(&mut self, port: u16, pm_port: &mut u16) -> Result<()> {
        if !self.devices.iter().any(|d| d.port == port) {
            return Err(Error::InvalidParameter);
        }

        if *pm_port == 0xFFFF {
            let first = self.devices.iter().find(|d| d.port == port).unwrap();
            *pm_port = first.pm_port;
            self.previous_pm_port = first.pm_port;
            return Ok(());
        }

        if *pm_port != self.previous_pm_port {
            return Err(Error::InvalidParameter);
        }

        let start = self
            .devices
            .iter()
            .position(|d| d.port == port && d.pm_port == self.previous_pm_port)
            .ok_or(Error::InvalidParameter)?;

        match self.devices[start + 1..].iter().find(|d| d.port == port) {
            Some(next) => {
                *pm_port = next.pm_port;
                self.previous_pm_port = next.pm_port;
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    fn scsi_targets(&self) -> impl Iterator<Item = &AttachedDevice> {
        self.devices.iter().filter(|d| d.kind == DeviceKind::CdRom)
    }

    fn target_bytes(device: &AttachedDevice) -> (u8, u8) {
        (device.port as u8, device.pm_port as u8)
    }

    /// SCSI-surface target+LUN iteration over the ATAPI devices. An
    /// all-ones target restarts; the LUN is always zero.
    pub fn get_next_target_lun(
        &mut self,
        target: &mut [u8; TARGET_MAX_BYTES],
        lun: &mut u64,
    ) -> Result<()> {
        let restart = target.iter().all(|&b| b == 0xFF);
        let next = if restart {
            self.scsi_targets().next().ok_or(Error::NotFound)?
        } else {
            if (target[0], target[1]) != self.previous_target {
                return Err(Error::InvalidParameter);
            }
            let previous = self.previous_target;
            let mut found = false;
            let mut result = None;
            for device in self.scsi_targets() {
                if found {
                    result = Some(device);
                    break;
                }
                if Self::target_bytes(device) == previous {
                    found = true;
                }
            }
            if !found {
                return Err(Error::InvalidParameter);
            }
            result.ok_or(Error::NotFound)?
        };

        let bytes = Self::target_bytes(next);
        target.fill(0);
        target[0] = bytes.0;
        target[1] = bytes.1;
        *lun = 0;
        self.previous_target = bytes;
        Ok(())
    }

    /// Target-only form of [`get_next_target_lun`].
    pub fn get_next_target(&mut self, target: &mut [u8; TARGET_MAX_BYTES]) -> Result<()> {
        let mut lun = 0;
        self.get_next_target_lun(target, &mut lun)
    }

    // ------------------------------------------------------------------
    // Device paths
    // ------------------------------------------------------------------

    /// Translate a `(port, port-multiplier)` pair to its device-path
    /// node.
    pub fn build_device_path(&self, port: u16, pm_port: u16) -> Result<DevicePath> {
        if self.find_device(port, pm_port).is_none() {
            return Err(Error::NotFound);
        }
        Ok(match self.mode {
            EngineMode::Ide => devpath::create_atapi_device_path(port as u8, pm_port as u8, 0),
            _ => {
                // A stored 0xFF port multiplier surfaces as 0xFFFF.
                let pm = if pm_port == 0xFF { 0xFFFF } else { pm_port };
                devpath::create_sata_device_path(port, pm, 0)
            }
        })
    }

    /// Translate a device path back to the pair that built it.
    pub fn get_device(&self, path: &DevicePath) -> Result<(u16, u16)> {
        let (port, pm_port) = path.port_and_pm()?;
        match (self.mode, path) {
            (EngineMode::Ide, DevicePath::Atapi(_)) => {}
            (EngineMode::Ahci | EngineMode::Raid, DevicePath::Sata(_)) => {}
            _ => return Err(Error::NotFound),
        }
        self.find_device(port, pm_port).ok_or(Error::NotFound)?;
        Ok((port, pm_port))
    }

    // ------------------------------------------------------------------
    // Resets
    // ------------------------------------------------------------------

    /// Port reset: a link re-initialization on AHCI, a silent success
    /// on IDE.
    pub fn reset_port(&mut self, port: u16) -> Result<()> {
        match &mut self.engine {
            Engine::Ide(_) => Ok(()),
            Engine::Ahci(ahci) => ahci.port_reset(port as u8, self.default_timeout_us),
        }
    }

    pub fn reset_device(&mut self, port: u16, pm_port: u16) -> Result<()> {
        if self.find_device(port, pm_port).is_none() {
            return Err(Error::InvalidParameter);
        }
        self.reset_port(port)
    }

    // ------------------------------------------------------------------
    // SCSI surface
    // ------------------------------------------------------------------

    /// Execute one SCSI request against an ATAPI device.
    pub fn scsi_pass_thru(
        &mut self,
        target: &[u8; TARGET_MAX_BYTES],
        lun: u64,
        packet: &mut ScsiRequestPacket,
    ) -> Result<()> {
        if lun != 0 {
            return Err(Error::InvalidParameter);
        }

        let port = target[0] as u16;
        let pm_port = match (self.mode, target[1]) {
            (EngineMode::Ide, pm) => pm as u16,
            (_, 0xFF) => 0xFFFF,
            (_, pm) => pm as u16,
        };

        let device = self.find_device(port, pm_port).ok_or(Error::InvalidParameter)?;
        if device.kind != DeviceKind::CdRom {
            return Err(Error::InvalidParameter);
        }

        let cdb_ok = match self.mode {
            EngineMode::Ide => packet.cdb.len() == 12,
            _ => packet.cdb.len() == 12 || packet.cdb.len() == 16,
        };
        if !cdb_ok {
            return Err(Error::InvalidParameter);
        }

        let read = packet.data_direction != DataDirection::Write;
        let timeout =
            if packet.timeout_us == 0 { self.default_timeout_us } else { packet.timeout_us };

        // READ CAPACITY gets a bounded retry before the failure is
        // surfaced to the caller.
        let attempts = if self.mode != EngineMode::Ide
            && packet.cdb.first() == Some(&ata::ATAPI_CMD_READ_CAPACITY)
        {
            READ_CAPACITY_RETRIES
        } else {
            1
        };

        let cdb = packet.cdb.clone();
        let mut outcome = Ok(());
        for attempt in 0..attempts {
            outcome =
                self.execute_packet(port, pm_port, &cdb, read, &mut packet.data, timeout);
            if outcome.is_ok() {
                break;
            }
            if attempt + 1 < attempts {
                log::debug!("retrying ATAPI command {:#04x}", packet.cdb[0]);
            }
        }

        match outcome {
            Ok(()) => {
                packet.host_adapter_status = 0;
                packet.target_status = SCSI_STATUS_GOOD;
                packet.sense_data.truncate(0);
                Ok(())
            }
            Err(e) => {
                packet.host_adapter_status = 0;
                packet.target_status = SCSI_STATUS_CHECK_CONDITION;
                if !packet.sense_data.is_empty() {
                    let mut sense = core::mem::take(&mut packet.sense_data);
                    let written = self.gather_sense_data(port, pm_port, &mut sense, timeout);
                    sense.truncate(written);
                    packet.sense_data = sense;
                }
                Err(e)
            }
        }
    }

    fn execute_packet(
        &mut self,
        port: u16,
        pm_port: u16,
        cdb: &[u8],
        read: bool,
        data: &mut [u8],
        timeout_us: u64,
    ) -> Result<()> {
        let mut asb = AtaStatusBlock::default();
        match &mut self.engine {
            Engine::Ide(ide) => {
                ide.refresh_registers()?;
                ide.packet_command_execute(
                    port as u8,
                    pm_port as u8,
                    cdb,
                    read,
                    data,
                    &mut asb,
                    timeout_us,
                )
            }
            Engine::Ahci(ahci) => {
                let pm = if pm_port == 0xFFFF { 0 } else { pm_port as u8 };
                ahci.packet_execute(port as u8, pm, cdb, read, data, &mut asb, timeout_us)
            }
        }
    }

    /// REQUEST SENSE drain: append fixed-format blocks until the device
    /// reports no-sense or the buffer is full. Returns the bytes
    /// gathered.
    fn gather_sense_data(
        &mut self,
        port: u16,
        pm_port: u16,
        sense: &mut [u8],
        timeout_us: u64,
    ) -> usize {
        let mut written = 0;

        while written + ata::ATAPI_SENSE_BLOCK_LEN <= sense.len() {
            let cdb = [
                ata::ATAPI_CMD_REQUEST_SENSE,
                0,
                0,
                0,
                ata::ATAPI_SENSE_BLOCK_LEN as u8,
                0,
                0,
                0,
                0,
                0,
                0,
                0,
            ];
            let mut block = vec![0u8; ata::ATAPI_SENSE_BLOCK_LEN];
            if self
                .execute_packet(port, pm_port, &cdb, true, &mut block, timeout_us)
                .is_err()
            {
                break;
            }

            sense[written..written + block.len()].copy_from_slice(&block);
            written += block.len();

            if block[2] & 0x0F == ata::SENSE_KEY_NO_SENSE {
                break;
            }
        }

        written
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Stop the instance: abort queued work, wind the engine down and
    /// restore the PCI attributes found at start.
    pub fn stop(mut self) {
        drain_with_error(&mut self.tasks.lock());
        match &mut self.engine {
            Engine::Ide(_) => {}
            Engine::Ahci(ahci) => ahci.stop(),
        }
        self.pci.set_attributes(self.saved_attributes);
        log::info!("pass-through instance stopped");
    }

    /// The cached IDENTIFY block of an enumerated device.
    pub fn identify_data(&self, port: u16, pm_port: u16) -> Option<&IdentifyData> {
        self.find_device(port, pm_port).map(|d| &*d.identify)
    }
}
