//! UHCI (USB 1.1) host-controller engine
//!
//! Drives the frame list, queue-head / transfer-descriptor schedule and
//! the root-hub ports of a UHCI controller. Control, bulk and
//! synchronous interrupt transfers run inline with polled completion;
//! asynchronous interrupt endpoints are serviced by a periodic monitor
//! pass the embedder invokes every 50 ms.
//!
//! # References
//! - UHCI Design Guide 1.1

pub mod regs;
pub mod schedule;

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;

use crate::dma::MemoryPool;
use crate::error::{Error, Result, UsbResult};
use crate::pci::{self, BusMasterOp, Mapping, PciIo};
use crate::time::{self, STALL_1_MS};

use regs::{Command, PortSc, Status, NUM_ROOT_PORTS, USBCMD, USBFLBASEADD, USBFRNUM, USBSTS};
use schedule::{
    check_chain, link_chain, ChainResult, FrameList, Qh, Td, TdEndpoint, PID_IN, PID_OUT,
};

/// Polling period of the completion loop in microseconds.
const EXEC_POLL_US: u64 = 50;

/// Monitor period the embedder is expected to honor, in milliseconds.
pub const INTERRUPT_MONITOR_PERIOD_MS: u64 = 50;

/// USB specification revision this engine implements.
pub const USB_MAJOR_REVISION: u8 = 1;
pub const USB_MINOR_REVISION: u8 = 1;

/// Hold time of a global reset and of a root-port reset.
const GLOBAL_RESET_HOLD_US: u64 = 50 * STALL_1_MS;
const RESET_RECOVERY_US: u64 = 10 * STALL_1_MS;
const FORCE_GLOBAL_RESUME_US: u64 = 20 * STALL_1_MS;

/// Transfer direction of the data stage of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    NoData,
}

/// Host-controller run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcState {
    Halt,
    Operational,
    Suspend,
}

/// Reset flavors of [`UhciController::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// GRESET held for 50 ms followed by 10 ms of recovery.
    Global,
    /// HCRESET, self-clearing within 10 ms.
    HostController,
}

/// Root-hub port features accepted by set/clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFeature {
    Enable,
    Suspend,
    Reset,
    /// UHCI has no port-power switch; accepted as a no-op.
    Power,
    ConnectChange,
    EnableChange,
}

/// Snapshot of one root-hub port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStatus {
    pub connected: bool,
    pub enabled: bool,
    pub suspended: bool,
    pub in_reset: bool,
    pub low_speed: bool,
    pub connect_change: bool,
    pub enable_change: bool,
}

/// Completion callback of an asynchronous interrupt endpoint. Receives
/// the freshly copied data on success, `None` on error.
pub type InterruptCallback = Box<dyn FnMut(Option<&[u8]>, UsbResult)>;

struct InterruptNode {
    device_address: u8,
    endpoint: u8,
    toggle: u8,
    data_len: usize,
    qhs: Vec<Qh>,
    tds: Vec<Td>,
    buffer: Vec<u8>,
    mapping: Option<Mapping>,
    callback: InterruptCallback,
}

/// Map the maximum packet length onto the frame-entry reclamation
/// factor from the UHCI design guide.
fn sector_factor(max_packet: usize) -> Result<usize> {
    match max_packet {
        8 => Ok(71),
        16 => Ok(51),
        32 => Ok(33),
        64 => Ok(19),
        _ => Err(Error::InvalidParameter),
    }
}

/// Number of schedule entries one bulk or interrupt chain occupies.
fn link_span(td_count: usize, max_packet: usize, base: usize) -> Result<usize> {
    Ok(td_count / sector_factor(max_packet)? + 1 + base)
}

/// UHCI host-controller instance.
pub struct UhciController {
    pci: Rc<dyn PciIo>,
    pool: MemoryPool,
    frames: Option<FrameList>,
    interrupt_list: Vec<InterruptNode>,
    saved_attributes: u64,
}

impl core::fmt::Debug for UhciController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UhciController")
            .field("frames_initialized", &self.frames.is_some())
            .field("interrupt_list_len", &self.interrupt_list.len())
            .field("saved_attributes", &self.saved_attributes)
            .finish()
    }
}

impl UhciController {
    /// Attach to a UHCI function: verify the class code, switch off the
    /// legacy keyboard/mouse emulation, enable bus mastering and build
    /// the empty schedule.
    pub fn new(pci_handle: Rc<dyn PciIo>) -> Result<Self> {
        let class = pci::read_class_code(pci_handle.as_ref());
        if class.base_class != pci::PCI_CLASS_SERIAL
            || class.sub_class != pci::PCI_SUBCLASS_USB
            || class.prog_if != pci::PCI_PROGIF_UHCI
        {
            return Err(Error::Unsupported);
        }

        pci_handle.cfg_write16(regs::USB_EMULATION, 0);
        let saved_attributes = pci::enable_device(pci_handle.as_ref());

        let pool = MemoryPool::new(pci_handle.clone())?;
        let frames = FrameList::new(pci_handle.as_ref())?;
        pci_handle.io_write32(regs::USB_BAR, USBFLBASEADD, frames.bus());

        log::info!("UHCI controller attached, frame list at {:#010x}", frames.bus());

        Ok(UhciController {
            pci: pci_handle,
            pool,
            frames: Some(frames),
            interrupt_list: Vec::new(),
            saved_attributes,
        })
    }

    fn frames(&self) -> &FrameList {
        self.frames.as_ref().expect("frame list released")
    }

    // ------------------------------------------------------------------
    // Register access helpers
    // ------------------------------------------------------------------

    fn command(&self) -> Command {
        Command::from_bits_retain(self.pci.io_read16(regs::USB_BAR, USBCMD))
    }

    fn write_command(&self, cmd: Command) {
        self.pci.io_write16(regs::USB_BAR, USBCMD, cmd.bits());
    }

    fn status(&self) -> Status {
        Status::from_bits_retain(self.pci.io_read16(regs::USB_BAR, USBSTS))
    }

    /// Status bits are write-1-to-clear; wipe everything latched.
    fn clear_status(&self) {
        self.pci.io_write16(regs::USB_BAR, USBSTS, Status::all().bits());
    }

    fn status_ok(&self) -> bool {
        !self.status().intersects(Status::FATAL | Status::HCH)
    }

    fn frame_number(&self) -> u16 {
        self.pci.io_read16(regs::USB_BAR, USBFRNUM) & 0x3FF
    }

    /// Advertise 64-byte max packet on full-speed transfers.
    fn enable_max_packet(&self) {
        let cmd = self.command();
        if !cmd.contains(Command::MAXP) {
            self.write_command(cmd | Command::MAXP);
        }
    }

    fn port_reg(&self, port: u8) -> PortSc {
        PortSc::from_bits_retain(self.pci.io_read16(regs::USB_BAR, regs::port_offset(port)))
    }

    /// Read-modify-write of a port register, masking the write-1-to-
    /// clear change bits so they survive.
    fn port_update(&self, port: u8, set: PortSc, clear: PortSc) {
        let value = (self.port_reg(port) & !PortSc::W1C & !clear) | set;
        self.pci.io_write16(regs::USB_BAR, regs::port_offset(port), value.bits());
    }

    // ------------------------------------------------------------------
    // Host-controller state machine
    // ------------------------------------------------------------------

    pub fn state(&self) -> HcState {
        if self.status().contains(Status::HCH) {
            HcState::Halt
        } else if self.command().contains(Command::EGSM) {
            HcState::Suspend
        } else {
            HcState::Operational
        }
    }

    /// Drive the controller into `target`.
    ///
    /// Refused with device-error while a host-system or process error
    /// is latched.
    pub fn set_state(&mut self, target: HcState) -> Result<()> {
        if self.status().intersects(Status::FATAL) {
            return Err(Error::DeviceError);
        }

        let current = self.state();
        match (current, target) {
            (_, t) if t == current => Ok(()),

            (HcState::Halt, HcState::Operational) => {
                self.enable_max_packet();
                let cmd = self.command();
                self.write_command((cmd | Command::RS | Command::MAXP) - Command::EGSM);
                Ok(())
            }

            (HcState::Operational, HcState::Halt) => {
                let cmd = self.command();
                self.write_command(cmd - Command::RS);
                time::wait_io16(
                    self.pci.as_ref(),
                    regs::USB_BAR,
                    USBSTS,
                    Status::HCH.bits(),
                    Status::HCH.bits(),
                    time::STALL_1_S,
                )
            }

            (HcState::Operational, HcState::Suspend) => {
                self.set_state(HcState::Halt)?;
                let cmd = self.command();
                self.write_command(cmd | Command::EGSM);
                Ok(())
            }

            (HcState::Suspend, HcState::Operational) => {
                let mut cmd = self.command();
                if !cmd.contains(Command::FGR) {
                    self.write_command(cmd | Command::FGR);
                }
                // Resume signalling must be held before the schedule
                // restarts.
                self.pci.stall_us(FORCE_GLOBAL_RESUME_US);
                cmd = self.command();
                self.write_command(
                    ((cmd - Command::FGR) - Command::EGSM) | Command::RS | Command::MAXP,
                );
                Ok(())
            }

            (HcState::Halt, HcState::Suspend) => {
                let cmd = self.command();
                self.write_command(cmd | Command::EGSM);
                Ok(())
            }

            (HcState::Suspend, HcState::Halt) => {
                let cmd = self.command();
                self.write_command((cmd - Command::EGSM) - Command::FGR);
                Ok(())
            }

            _ => Err(Error::InvalidParameter),
        }
    }

    /// Reset the controller and rebuild the (now empty) schedule.
    pub fn reset(&mut self, kind: ResetKind) -> Result<()> {
        match kind {
            ResetKind::Global => {
                let cmd = self.command();
                self.write_command(cmd | Command::GRESET);
                self.pci.stall_us(GLOBAL_RESET_HOLD_US);
                self.write_command(cmd - Command::GRESET);
                self.pci.stall_us(RESET_RECOVERY_US);
            }
            ResetKind::HostController => {
                let cmd = self.command();
                self.write_command(cmd | Command::HCRESET);
                time::wait_io16(
                    self.pci.as_ref(),
                    regs::USB_BAR,
                    USBCMD,
                    Command::HCRESET.bits(),
                    0,
                    RESET_RECOVERY_US,
                )?;
            }
        }

        // Reset wipes the frame-list base; start over from an empty
        // schedule.
        self.release_interrupt_list();
        self.frames().clear();
        self.pci.io_write32(regs::USB_BAR, USBFLBASEADD, self.frames().bus());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Root-hub port surface
    // ------------------------------------------------------------------

    pub fn root_port_count(&self) -> u8 {
        NUM_ROOT_PORTS
    }

    pub fn port_status(&self, port: u8) -> Result<PortStatus> {
        if port >= NUM_ROOT_PORTS {
            return Err(Error::InvalidParameter);
        }
        let sc = self.port_reg(port);
        Ok(PortStatus {
            connected: sc.contains(PortSc::CCS),
            enabled: sc.contains(PortSc::PED),
            suspended: sc.contains(PortSc::SUSP),
            in_reset: sc.contains(PortSc::PR),
            low_speed: sc.contains(PortSc::LSDA),
            connect_change: sc.contains(PortSc::CSC),
            enable_change: sc.contains(PortSc::PEDC),
        })
    }

    pub fn set_port_feature(&mut self, port: u8, feature: PortFeature) -> Result<()> {
        if port >= NUM_ROOT_PORTS {
            return Err(Error::InvalidParameter);
        }
        match feature {
            PortFeature::Enable => self.port_update(port, PortSc::PED, PortSc::empty()),
            PortFeature::Suspend => self.port_update(port, PortSc::SUSP, PortSc::empty()),
            PortFeature::Reset => self.port_update(port, PortSc::PR, PortSc::empty()),
            // No port-power control on UHCI.
            PortFeature::Power => {}
            _ => return Err(Error::InvalidParameter),
        }
        Ok(())
    }

    pub fn clear_port_feature(&mut self, port: u8, feature: PortFeature) -> Result<()> {
        if port >= NUM_ROOT_PORTS {
            return Err(Error::InvalidParameter);
        }
        match feature {
            PortFeature::Enable => self.port_update(port, PortSc::empty(), PortSc::PED),
            PortFeature::Suspend => self.port_update(port, PortSc::empty(), PortSc::SUSP),
            PortFeature::Reset => self.port_update(port, PortSc::empty(), PortSc::PR),
            PortFeature::Power => {}
            PortFeature::ConnectChange => self.port_update(port, PortSc::CSC, PortSc::empty()),
            PortFeature::EnableChange => self.port_update(port, PortSc::PEDC, PortSc::empty()),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Schedule plumbing
    // ------------------------------------------------------------------

    fn publish(&self, qh: Qh, start: u16, entries: usize) {
        for index in 0..entries {
            self.frames().link_qh(&self.pool, (start as usize + index) & 0x3FF, qh);
        }
    }

    fn unpublish(&self, qh: Qh, start: u16, entries: usize) {
        for index in 0..entries {
            self.frames().unlink_qh(&self.pool, (start as usize + index) & 0x3FF, qh);
        }
    }

    /// Poll a published chain every 50 us until it reaches a terminal
    /// state or the budget runs out.
    fn exec_chain(&self, tds: &[Td], required_len: usize, timeout_ms: u64) -> ChainResult {
        let mut passes = timeout_ms * 1000 / EXEC_POLL_US + 1;
        loop {
            let outcome = check_chain(tds, required_len);
            if outcome.finished || !outcome.result.contains(UsbResult::NOT_EXECUTE) {
                return outcome;
            }
            if passes == 0 {
                return outcome;
            }
            passes -= 1;
            self.pci.stall_us(EXEC_POLL_US);
        }
    }

    fn create_td_chain(
        &mut self,
        ep: TdEndpoint,
        pid: u8,
        toggle: &mut u8,
        max_packet: usize,
        buffer_bus: u64,
        len: usize,
        short_packet: bool,
    ) -> Result<Vec<Td>> {
        let mut tds = Vec::new();
        let mut offset = 0;
        while offset < len {
            let pkt = (len - offset).min(max_packet);
            let td = match Td::create(&mut self.pool) {
                Ok(td) => td,
                Err(e) => {
                    self.destroy_tds(&tds);
                    return Err(e);
                }
            };
            td.write_data(ep, pid, *toggle, pkt, (buffer_bus + offset as u64) as u32);
            if short_packet {
                td.set_short_packet_detect(true);
            }
            tds.push(td);
            *toggle ^= 1;
            offset += pkt;
        }
        Ok(tds)
    }

    fn destroy_tds(&mut self, tds: &[Td]) {
        for td in tds {
            td.destroy(&mut self.pool);
        }
    }

    /// Sum of the data moved by the descriptors in `tds`.
    fn completed_len(tds: &[Td]) -> usize {
        tds.iter().filter(|td| !td.is_active()).map(|td| td.actual_length()).sum()
    }

    /// Shared tail of every inline transfer: check for fatal controller
    /// state, clear latched status and translate the chain outcome.
    fn finish_transfer(&self, outcome: &ChainResult, result: &mut UsbResult) -> Result<()> {
        *result = outcome.result;

        if !self.status_ok() {
            self.clear_status();
            *result |= UsbResult::SYSTEM;
            return Err(Error::DeviceError);
        }
        self.clear_status();
        self.pci.flush();

        if outcome.result.is_empty() {
            Ok(())
        } else if outcome.result == UsbResult::NOT_EXECUTE
            || outcome.result == UsbResult::NOT_EXECUTE | UsbResult::NAK
        {
            Err(Error::Timeout)
        } else {
            Err(Error::DeviceError)
        }
    }

    // ------------------------------------------------------------------
    // Control transfer
    // ------------------------------------------------------------------

    /// Submit a control transfer and poll it to completion.
    ///
    /// Low-speed devices run the SETUP, DATA and STATUS stages as three
    /// separate submissions over 100 schedule entries each (500 for the
    /// DATA stage); full-speed devices run one combined chain over 500
    /// entries. Returns the number of data-stage bytes moved.
    #[allow(clippy::too_many_arguments)]
    pub fn control_transfer(
        &mut self,
        device_address: u8,
        low_speed: bool,
        max_packet: usize,
        request: &[u8; 8],
        direction: Direction,
        data: &mut [u8],
        timeout_ms: u64,
        result: &mut UsbResult,
    ) -> Result<usize> {
        sector_factor(max_packet)?;
        if low_speed && max_packet != 8 {
            return Err(Error::InvalidParameter);
        }
        if matches!(direction, Direction::NoData) != data.is_empty() {
            return Err(Error::InvalidParameter);
        }

        self.enable_max_packet();
        self.clear_status();

        let ep = TdEndpoint { device_address, endpoint: 0, low_speed };
        let data_pid = match direction {
            Direction::In => PID_IN,
            _ => PID_OUT,
        };
        let status_pid = if data_pid == PID_OUT { PID_IN } else { PID_OUT };

        // The request and data buffers are handed to the bus master.
        let (request_bus, request_mapping) =
            self.pci.map(BusMasterOp::Read, request.as_ptr() as *mut u8, request.len())?;

        let data_mapping = if data.is_empty() {
            None
        } else {
            let op = match direction {
                Direction::In => BusMasterOp::Write,
                _ => BusMasterOp::Read,
            };
            match self.pci.map(op, data.as_mut_ptr(), data.len()) {
                Ok(v) => Some(v),
                Err(e) => {
                    self.pci.unmap(request_mapping);
                    return Err(e);
                }
            }
        };
        let data_bus = data_mapping.as_ref().map(|m| m.0).unwrap_or(0);

        let outcome = self.run_control_stages(
            ep,
            request_bus,
            data_pid,
            status_pid,
            data_bus,
            data.len(),
            max_packet,
            timeout_ms,
        );

        if let Some((_, mapping)) = data_mapping {
            self.pci.unmap(mapping);
        }
        self.pci.unmap(request_mapping);

        let (chain, data_actual) = outcome?;
        self.finish_transfer(&chain, result).map(|()| data_actual)
    }

    /// Build and execute the control stages, returning the outcome of
    /// the last stage run plus the data-stage byte count.
    #[allow(clippy::too_many_arguments)]
    fn run_control_stages(
        &mut self,
        ep: TdEndpoint,
        request_bus: u64,
        data_pid: u8,
        status_pid: u8,
        data_bus: u64,
        data_len: usize,
        max_packet: usize,
        timeout_ms: u64,
    ) -> Result<(ChainResult, usize)> {
        let qh = Qh::create(&mut self.pool)?;

        let setup_td = match Td::create(&mut self.pool) {
            Ok(td) => td,
            Err(e) => {
                qh.destroy(&mut self.pool);
                return Err(e);
            }
        };
        setup_td.write_setup(ep, request_bus as u32);

        // Data-stage toggles start at 1 and alternate.
        let mut toggle = 1;
        let data_tds = match self.create_td_chain(
            ep,
            data_pid,
            &mut toggle,
            max_packet,
            data_bus,
            data_len,
            false,
        ) {
            Ok(tds) => tds,
            Err(e) => {
                setup_td.destroy(&mut self.pool);
                qh.destroy(&mut self.pool);
                return Err(e);
            }
        };

        let status_td = match Td::create(&mut self.pool) {
            Ok(td) => td,
            Err(e) => {
                self.destroy_tds(&data_tds);
                setup_td.destroy(&mut self.pool);
                qh.destroy(&mut self.pool);
                return Err(e);
            }
        };
        status_td.write_status(ep, status_pid);

        let outcome = if ep.low_speed {
            self.exec_staged_control(qh, setup_td, &data_tds, status_td, data_len, timeout_ms)
        } else {
            let mut chain = vec![setup_td];
            chain.extend_from_slice(&data_tds);
            chain.push(status_td);
            link_chain(qh, &chain);

            let start = self.frame_number();
            self.publish(qh, start, 500);
            let outcome = self.exec_chain(&chain, data_len, timeout_ms);
            self.unpublish(qh, start, 500);
            outcome
        };

        let data_actual = Self::completed_len(&data_tds);

        status_td.destroy(&mut self.pool);
        self.destroy_tds(&data_tds);
        setup_td.destroy(&mut self.pool);
        qh.destroy(&mut self.pool);

        Ok((outcome, data_actual))
    }

    /// Low-speed staging: each stage is linked, published, executed and
    /// unlinked completely before the next stage is considered.
    fn exec_staged_control(
        &mut self,
        qh: Qh,
        setup_td: Td,
        data_tds: &[Td],
        status_td: Td,
        data_len: usize,
        timeout_ms: u64,
    ) -> ChainResult {
        let setup_chain = [setup_td];
        link_chain(qh, &setup_chain);
        let start = self.frame_number();
        self.publish(qh, start, 100);
        let mut outcome = self.exec_chain(&setup_chain, data_len, timeout_ms);
        self.unpublish(qh, start, 100);

        if !outcome.result.is_empty() {
            return outcome;
        }

        if !data_tds.is_empty() {
            link_chain(qh, data_tds);
            let start = self.frame_number();
            self.publish(qh, start, 500);
            outcome = self.exec_chain(data_tds, data_len, timeout_ms);
            self.unpublish(qh, start, 500);

            if !outcome.result.is_empty() {
                return outcome;
            }
        }

        let status_chain = [status_td];
        link_chain(qh, &status_chain);
        let start = self.frame_number();
        self.publish(qh, start, 100);
        outcome = self.exec_chain(&status_chain, data_len, timeout_ms);
        self.unpublish(qh, start, 100);
        outcome
    }

    // ------------------------------------------------------------------
    // Bulk and synchronous interrupt transfers
    // ------------------------------------------------------------------

    /// Submit a bulk transfer on a full-speed endpoint. `endpoint`
    /// carries the direction in bit 7. The caller's data toggle is
    /// advanced to the value the next transfer must use.
    #[allow(clippy::too_many_arguments)]
    pub fn bulk_transfer(
        &mut self,
        device_address: u8,
        endpoint: u8,
        max_packet: usize,
        data: &mut [u8],
        toggle: &mut u8,
        timeout_ms: u64,
        result: &mut UsbResult,
    ) -> Result<usize> {
        self.bulk_like_transfer(device_address, endpoint, max_packet, data, toggle, timeout_ms, 500, false, result)
    }

    /// Submit a synchronous interrupt transfer; only IN endpoints are
    /// meaningful here.
    #[allow(clippy::too_many_arguments)]
    pub fn sync_interrupt_transfer(
        &mut self,
        device_address: u8,
        endpoint: u8,
        max_packet: usize,
        data: &mut [u8],
        toggle: &mut u8,
        timeout_ms: u64,
        result: &mut UsbResult,
    ) -> Result<usize> {
        if endpoint & 0x80 == 0 {
            return Err(Error::InvalidParameter);
        }
        self.bulk_like_transfer(device_address, endpoint, max_packet, data, toggle, timeout_ms, 100, true, result)
    }

    #[allow(clippy::too_many_arguments)]
    fn bulk_like_transfer(
        &mut self,
        device_address: u8,
        endpoint: u8,
        max_packet: usize,
        data: &mut [u8],
        toggle: &mut u8,
        timeout_ms: u64,
        span_base: usize,
        is_interrupt: bool,
        result: &mut UsbResult,
    ) -> Result<usize> {
        if data.is_empty() || *toggle > 1 {
            return Err(Error::InvalidParameter);
        }
        sector_factor(max_packet)?;

        self.enable_max_packet();
        self.clear_status();

        let is_in = endpoint & 0x80 != 0;
        let pid = if is_in { PID_IN } else { PID_OUT };
        let op = if is_in { BusMasterOp::Write } else { BusMasterOp::Read };
        let short_packet = is_in;

        let (data_bus, mapping) = self.pci.map(op, data.as_mut_ptr(), data.len())?;

        let ep = TdEndpoint { device_address, endpoint: endpoint & 0x0F, low_speed: false };

        let qh = match Qh::create(&mut self.pool) {
            Ok(qh) => qh,
            Err(e) => {
                self.pci.unmap(mapping);
                return Err(e);
            }
        };

        let tds = match self.create_td_chain(
            ep,
            pid,
            toggle,
            max_packet,
            data_bus,
            data.len(),
            short_packet,
        ) {
            Ok(tds) => tds,
            Err(e) => {
                qh.destroy(&mut self.pool);
                self.pci.unmap(mapping);
                return Err(e);
            }
        };

        link_chain(qh, &tds);

        let span = link_span(tds.len(), max_packet, span_base).expect("validated max packet");
        // The bulk loop is inclusive of its last index.
        let entries = if is_interrupt { span } else { span + 1 };

        let start = self.frame_number();
        self.publish(qh, start, entries);
        let outcome = self.exec_chain(&tds, data.len(), timeout_ms);
        self.unpublish(qh, start, entries);

        if !outcome.result.is_empty() {
            // Scroll the toggle back to the last descriptor that made
            // it onto the wire.
            let scroll = tds.len() - outcome.err_td_pos;
            if scroll % 2 != 0 {
                *toggle ^= 1;
            }
        }

        let actual = Self::completed_len(&tds);

        self.destroy_tds(&tds);
        qh.destroy(&mut self.pool);
        self.pci.unmap(mapping);

        self.finish_transfer(&outcome, result).map(|()| actual)
    }

    // ------------------------------------------------------------------
    // Asynchronous interrupt endpoints
    // ------------------------------------------------------------------

    /// Install a polled interrupt endpoint.
    ///
    /// One queue head is published per schedule slot spaced by the
    /// polling interval; the same TD chain hangs under every queue
    /// head. The node is inserted at the head of the monitor list so a
    /// fresh submission is not visited by the monitor pass that is
    /// currently walking the list.
    #[allow(clippy::too_many_arguments)]
    pub fn async_interrupt_submit(
        &mut self,
        device_address: u8,
        endpoint: u8,
        low_speed: bool,
        max_packet: usize,
        interval_ms: usize,
        data_len: usize,
        toggle: u8,
        callback: InterruptCallback,
    ) -> Result<()> {
        if !(1..=255).contains(&interval_ms) || data_len == 0 || max_packet == 0 {
            return Err(Error::InvalidParameter);
        }
        if endpoint & 0x80 == 0 || toggle > 1 {
            return Err(Error::InvalidParameter);
        }

        let mut buffer = vec![0u8; data_len];
        let (buffer_bus, mapping) =
            self.pci.map(BusMasterOp::Write, buffer.as_mut_ptr(), data_len)?;

        let ep = TdEndpoint { device_address, endpoint: endpoint & 0x0F, low_speed };

        let mut running_toggle = toggle;
        let tds = match self.create_td_chain(
            ep,
            PID_IN,
            &mut running_toggle,
            max_packet,
            buffer_bus,
            data_len,
            true,
        ) {
            Ok(tds) => tds,
            Err(e) => {
                self.pci.unmap(mapping);
                return Err(e);
            }
        };

        // ceil(1024 / interval) queue heads, one per occupied slot.
        let qh_count = FrameList::ENTRIES.div_ceil(interval_ms);
        let mut qhs = Vec::with_capacity(qh_count);
        for _ in 0..qh_count {
            match Qh::create(&mut self.pool) {
                Ok(qh) => {
                    link_chain(qh, &tds);
                    qhs.push(qh);
                }
                Err(e) => {
                    for qh in qhs {
                        qh.destroy(&mut self.pool);
                    }
                    self.destroy_tds(&tds);
                    self.pci.unmap(mapping);
                    return Err(e);
                }
            }
        }

        // The node remembers the toggle of the last descriptor; it is
        // refreshed on every completion edge.
        let node = InterruptNode {
            device_address,
            endpoint,
            toggle: running_toggle ^ 1,
            data_len,
            qhs,
            tds,
            buffer,
            mapping: Some(mapping),
            callback,
        };

        let start = self.frame_number() as usize;
        for (slot, qh) in node.qhs.iter().enumerate() {
            let index = (start + slot * interval_ms) & 0x3FF;
            self.frames().link_qh(&self.pool, index, *qh);
        }

        self.interrupt_list.insert(0, node);
        self.pci.flush();
        Ok(())
    }

    /// Cancel an asynchronous interrupt endpoint, returning the data
    /// toggle the endpoint will expect next.
    pub fn async_interrupt_cancel(&mut self, device_address: u8, endpoint: u8) -> Result<u8> {
        let position = self
            .interrupt_list
            .iter()
            .position(|n| {
                n.device_address == device_address && n.endpoint & 0x0F == endpoint & 0x0F
            })
            .ok_or(Error::InvalidParameter)?;

        let mut node = self.interrupt_list.remove(position);

        // Snapshot the toggle at the current completion edge before
        // tearing the schedule down.
        let outcome = check_chain(&node.tds, node.data_len);
        Self::update_node_toggle(&mut node, &outcome);
        let toggle = node.toggle;

        self.teardown_node(node);
        Ok(toggle)
    }

    fn update_node_toggle(node: &mut InterruptNode, outcome: &ChainResult) {
        if outcome.result.is_empty() {
            if let Some(last) = node.tds.last() {
                node.toggle = last.data_toggle();
            }
        } else if !outcome.result.intersects(UsbResult::NOT_EXECUTE | UsbResult::NAK) {
            let last_success = outcome.err_td_pos.checked_sub(1).unwrap_or(0);
            node.toggle = node.tds[last_success].data_toggle();
        }
    }

    fn teardown_node(&mut self, mut node: InterruptNode) {
        for qh in &node.qhs {
            self.frames().unlink_qh_everywhere(&self.pool, *qh);
        }
        for qh in node.qhs.drain(..) {
            qh.destroy(&mut self.pool);
        }
        self.destroy_tds(&node.tds);
        node.tds.clear();
        if let Some(mapping) = node.mapping.take() {
            self.pci.unmap(mapping);
        }
    }

    fn release_interrupt_list(&mut self) {
        while let Some(node) = self.interrupt_list.pop() {
            self.teardown_node(node);
        }
    }

    /// One monitor pass over the interrupt list, head to tail. The
    /// embedder calls this every [`INTERRUPT_MONITOR_PERIOD_MS`].
    pub fn monitor_tick(&mut self) {
        for index in 0..self.interrupt_list.len() {
            let node = &mut self.interrupt_list[index];

            let outcome = check_chain(&node.tds, node.data_len);

            // Still on the wire, or the endpoint had nothing to say.
            if outcome.result.intersects(UsbResult::NOT_EXECUTE | UsbResult::NAK) {
                continue;
            }

            if outcome.result.is_empty() {
                let copied: Vec<u8> = node.buffer[..outcome.actual_len.min(node.data_len)].to_vec();
                (node.callback)(Some(&copied), UsbResult::NO_ERROR);

                Self::update_node_toggle(node, &outcome);

                // Resubmission: flip the chain to continue the toggle
                // sequence, restore the vertical links and re-arm.
                let last_toggle = node.toggle;
                if node.tds.first().map(|td| td.data_toggle()) == Some(last_toggle) {
                    let mut t = last_toggle;
                    for td in &node.tds {
                        t ^= 1;
                        td.set_data_toggle(t);
                    }
                }
                for qh in &node.qhs {
                    link_chain(*qh, &node.tds);
                }
                for td in &node.tds {
                    td.set_active(true);
                }
            } else {
                log::debug!(
                    "interrupt endpoint {}:{:#04x} error {:?}",
                    node.device_address,
                    node.endpoint,
                    outcome.result
                );
                Self::update_node_toggle(node, &outcome);
                // The chain stays halted; recovery (typically cancel +
                // resubmit) is the device driver's business.
                (node.callback)(None, outcome.result);
            }
        }
    }

    /// Outstanding asynchronous interrupt endpoints.
    pub fn pending_interrupt_transfers(&self) -> usize {
        self.interrupt_list.len()
    }

    /// Halt the controller, tear down the schedule and hand the PCI
    /// attributes back the way they were found.
    pub fn stop(mut self) {
        let _ = self.set_state(HcState::Halt);
        self.release_interrupt_list();
        if let Some(frames) = self.frames.take() {
            frames.release(self.pci.as_ref());
        }
        self.pci.set_attributes(self.saved_attributes);
        log::info!("UHCI controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockPci;
    use regs::USB_BAR;
    use std::cell::RefCell;

    fn uhci_pci() -> Rc<MockPci> {
        let pci = Rc::new(MockPci::new());
        // serial / usb / uhci class triple.
        pci.cfg_poke8(0x09, 0x00);
        pci.cfg_poke8(0x0A, 0x03);
        pci.cfg_poke8(0x0B, 0x0C);
        pci
    }

    fn controller() -> (Rc<MockPci>, UhciController) {
        let pci = uhci_pci();
        let hc = UhciController::new(pci.clone()).unwrap();
        (pci, hc)
    }

    #[test]
    fn attach_refuses_non_uhci_class() {
        let pci = Rc::new(MockPci::new());
        pci.cfg_poke8(0x0B, 0x01);
        assert_eq!(UhciController::new(pci).unwrap_err(), Error::Unsupported);
    }

    #[test]
    fn attach_disables_legacy_emulation_and_publishes_frame_list() {
        let (pci, hc) = controller();
        assert_eq!(pci.cfg_read16(regs::USB_EMULATION), 0);
        let base = pci.io_peek16(USB_BAR, USBFLBASEADD) as u32
            | ((pci.io_peek16(USB_BAR, USBFLBASEADD + 2) as u32) << 16);
        assert_eq!(base, hc.frames().bus());
        assert_eq!(base % 4096, 0);
    }

    #[test]
    fn link_span_follows_reclamation_table() {
        // 512 bytes at 64-byte packets builds 8 descriptors.
        assert_eq!(link_span(8, 64, 500).unwrap(), 501);
        assert_eq!(link_span(8, 8, 100).unwrap(), 101);
        assert_eq!(link_span(142, 8, 500).unwrap(), 503);
        assert!(link_span(8, 100, 500).is_err());
    }

    #[test]
    fn state_machine_transitions() {
        let (pci, mut hc) = controller();

        // Fresh controller reads as halted.
        pci.io_poke16(USB_BAR, USBSTS, Status::HCH.bits());
        assert_eq!(hc.state(), HcState::Halt);

        // Halt -> Operational sets RS and MAXP; the model clears HCH.
        pci.set_stall_hook(|p, _| {
            let cmd = Command::from_bits_retain(p.io_peek16(USB_BAR, USBCMD));
            let mut sts = Status::from_bits_retain(p.io_peek16(USB_BAR, USBSTS));
            sts.set(Status::HCH, !cmd.contains(Command::RS));
            p.io_poke16(USB_BAR, USBSTS, sts.bits());
        });
        hc.set_state(HcState::Operational).unwrap();
        let cmd = Command::from_bits_retain(pci.io_peek16(USB_BAR, USBCMD));
        assert!(cmd.contains(Command::RS | Command::MAXP));
        pci.io_poke16(USB_BAR, USBSTS, 0);
        assert_eq!(hc.state(), HcState::Operational);

        // Operational -> Suspend goes through halt, then EGSM.
        hc.set_state(HcState::Suspend).unwrap();
        let cmd = Command::from_bits_retain(pci.io_peek16(USB_BAR, USBCMD));
        assert!(cmd.contains(Command::EGSM));
        assert!(!cmd.contains(Command::RS));

        // Fatal latched status refuses transitions.
        pci.io_poke16(USB_BAR, USBSTS, Status::HSE.bits());
        assert_eq!(hc.set_state(HcState::Operational).unwrap_err(), Error::DeviceError);
    }

    #[test]
    fn port_features_respect_write_one_to_clear_bits() {
        let (pci, mut hc) = controller();
        let port1 = regs::port_offset(1);

        pci.io_poke16(USB_BAR, port1, (PortSc::CCS | PortSc::CSC).bits());
        hc.set_port_feature(1, PortFeature::Enable).unwrap();

        // Setting PED must not have written CSC back as 1 (which would
        // clear the latched change).
        let written = PortSc::from_bits_retain(pci.io_peek16(USB_BAR, port1));
        assert!(written.contains(PortSc::PED));
        assert!(!written.contains(PortSc::CSC));

        pci.io_poke16(USB_BAR, port1, (PortSc::CCS | PortSc::PED | PortSc::CSC).bits());
        let st = hc.port_status(1).unwrap();
        assert!(st.connected && st.enabled && st.connect_change);

        hc.clear_port_feature(1, PortFeature::ConnectChange).unwrap();
        let written = PortSc::from_bits_retain(pci.io_peek16(USB_BAR, port1));
        assert!(written.contains(PortSc::CSC));

        assert!(hc.port_status(2).is_err());
    }

    #[test]
    fn async_interrupt_occupies_ceil_slots() {
        let (_pci, mut hc) = controller();

        hc.async_interrupt_submit(1, 0x81, false, 8, 10, 8, 0, Box::new(|_, _| {}))
            .unwrap();

        let node = &hc.interrupt_list[0];
        assert_eq!(node.qhs.len(), 103);
        let frames = hc.frames.as_ref().unwrap();
        let published: usize =
            node.qhs.iter().map(|qh| frames.entries_referencing(&hc.pool, *qh)).sum();
        assert_eq!(published, 103);

        // Cancelling returns the pool to its pre-submission state.
        let used_before_cancel = hc.pool.used_units();
        assert!(used_before_cancel > 0);
        let toggle = hc.async_interrupt_cancel(1, 0x81).unwrap();
        assert_eq!(toggle, 0);
        assert_eq!(hc.pool.used_units(), 0);
        assert_eq!(hc.pending_interrupt_transfers(), 0);
    }

    #[test]
    fn monitor_completes_node_and_rearms_chain() {
        let (_pci, mut hc) = controller();

        let seen: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        hc.async_interrupt_submit(
            1,
            0x81,
            false,
            8,
            10,
            8,
            0,
            Box::new(move |data, result| {
                assert_eq!(result, UsbResult::NO_ERROR);
                sink.borrow_mut().push(data.unwrap().to_vec());
            }),
        )
        .unwrap();

        // Nothing completed yet: monitor must stay quiet.
        hc.monitor_tick();
        assert!(seen.borrow().is_empty());

        // Play the device: fill the buffer and retire the descriptor.
        {
            let tds: Vec<Td> = hc.interrupt_list[0].tds.clone();
            hc.interrupt_list[0].buffer.copy_from_slice(&[0xA5; 8]);
            for td in &tds {
                td.set_active(false);
                // actual length 8 encoded as 7.
                let word = hc.pool.cpu_of_bus(td.bus() as u64 + 4).unwrap() as *mut u32;
                let s = unsafe { core::ptr::read_volatile(word) };
                unsafe { core::ptr::write_volatile(word, (s & !0x7FF) | 7) };
            }
        }

        hc.monitor_tick();
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0], vec![0xA5; 8]);

        // The chain was re-armed with the toggle sequence continuing.
        let node = &hc.interrupt_list[0];
        assert!(node.tds[0].is_active());
        assert_eq!(node.tds[0].data_toggle(), 1);
        assert_eq!(node.toggle, 0);

        // A second pass without fresh data stays quiet.
        hc.monitor_tick();
        assert_eq!(seen.borrow().len(), 1);
    }
}
