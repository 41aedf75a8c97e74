//! UHCI engine integration tests against a model that walks the frame
//! list, queue heads and transfer descriptors in host memory exactly
//! like the controller's schedule engine, one frame per stall tick.

mod common;

use std::rc::Rc;

use common::{Harness, HwModel};
use hostctl::error::UsbResult;
use hostctl::pci::PciIo;
use hostctl::uhci::{Direction, UhciController};

const TIMEOUT_MS: u64 = 100;

const PID_SETUP: u8 = 0x2D;
const PID_IN: u8 = 0x69;
const PID_OUT: u8 = 0xE1;

/// A full-speed device answering on the schedule: control requests fill
/// an IN pipeline, bulk endpoints stream whatever the test preloads.
struct UhciModel {
    command: u16,
    status: u16,
    frame_number: u16,
    frame_base: u32,
    portsc: [u16; 2],

    /// Bytes the device will answer with on IN tokens.
    in_data: Vec<u8>,
    in_offset: usize,
    /// Bytes collected from OUT tokens.
    out_data: Vec<u8>,
    /// Executed transactions: (pid, toggle, bytes moved).
    executed: Vec<(u8, u8, usize)>,
    /// Distinct frame indices that held work when visited.
    busy_frames: Vec<u16>,
}

impl UhciModel {
    fn new() -> Self {
        UhciModel {
            command: 0,
            status: 0,
            frame_number: 0,
            frame_base: 0,
            portsc: [0; 2],
            in_data: Vec::new(),
            in_offset: 0,
            out_data: Vec::new(),
            executed: Vec::new(),
            busy_frames: Vec::new(),
        }
    }

    fn process_frame(&mut self, h: &Harness) {
        let index = (self.frame_number & 0x3FF) as u64;
        let entry = h.read_bus_u32(self.frame_base as u64 + index * 4);
        if entry & 1 != 0 {
            return;
        }
        self.busy_frames.push(index as u16);

        // Walk the horizontal queue-head chain.
        let mut qh = (entry & !0xF) as u64;
        for _ in 0..64 {
            let vertical = h.read_bus_u32(qh + 4);
            if vertical & 1 == 0 {
                self.run_td_chain(h, (vertical & !0xF) as u64);
            }

            let horizontal = h.read_bus_u32(qh);
            if horizontal & 1 != 0 {
                break;
            }
            let next = (horizontal & !0xF) as u64;
            if next == qh {
                break;
            }
            qh = next;
        }
    }

    fn run_td_chain(&mut self, h: &Harness, first: u64) {
        let mut td = first;
        for _ in 0..64 {
            let status_word = h.read_bus_u32(td + 4);
            if status_word & (1 << 23) != 0 {
                let token = h.read_bus_u32(td + 8);
                let pid = token as u8;
                let toggle = ((token >> 19) & 1) as u8;
                let max_len = ((token >> 21) as usize + 1) & 0x7FF;
                let buffer = h.read_bus_u32(td + 12) as u64;

                let moved = match pid {
                    PID_SETUP => {
                        let mut request = [0u8; 8];
                        h.read_bus(buffer, &mut request);
                        self.handle_setup(&request);
                        8
                    }
                    PID_IN => {
                        let n = max_len.min(self.in_data.len() - self.in_offset);
                        h.write_bus(buffer, &self.in_data[self.in_offset..self.in_offset + n]);
                        self.in_offset += n;
                        n
                    }
                    PID_OUT => {
                        let mut chunk = vec![0u8; max_len];
                        h.read_bus(buffer, &mut chunk);
                        self.out_data.extend_from_slice(&chunk);
                        max_len
                    }
                    _ => 0,
                };

                self.executed.push((pid, toggle, moved));

                // Retire the descriptor: clear active, store N-1.
                let retired = (status_word & !(1 << 23) & !0x7FF)
                    | ((moved.wrapping_sub(1)) & 0x7FF) as u32;
                h.write_bus_u32(td + 4, retired);

                // A short IN packet ends the queue for this frame.
                if pid == PID_IN && moved < max_len {
                    break;
                }
            }

            let link = h.read_bus_u32(td);
            if link & 1 != 0 || link & 2 != 0 {
                break;
            }
            td = (link & !0xF) as u64;
        }
    }

    fn handle_setup(&mut self, request: &[u8; 8]) {
        // GET_DESCRIPTOR(DEVICE): answer with an 18-byte descriptor.
        if request[0] == 0x80 && request[1] == 0x06 && request[3] == 0x01 {
            let mut descriptor = vec![0u8; 18];
            descriptor[0] = 18;
            descriptor[1] = 0x01;
            descriptor[7] = 8;
            descriptor[8] = 0x34;
            descriptor[9] = 0x12;
            self.in_data = descriptor;
            self.in_offset = 0;
        }
    }
}

impl HwModel for UhciModel {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn io_read(&mut self, _h: &Harness, _bar: u8, offset: u64, _width: usize) -> u32 {
        match offset {
            0x00 => self.command as u32,
            0x02 => self.status as u32,
            0x06 => self.frame_number as u32,
            0x08 => self.frame_base,
            0x10 => self.portsc[0] as u32,
            0x12 => self.portsc[1] as u32,
            _ => 0,
        }
    }

    fn io_write(&mut self, _h: &Harness, _bar: u8, offset: u64, _width: usize, value: u32) {
        match offset {
            0x00 => self.command = value as u16,
            // Write-1-to-clear status.
            0x02 => self.status &= !(value as u16),
            0x06 => self.frame_number = value as u16,
            0x08 => self.frame_base = value,
            0x10 => self.portsc[0] = value as u16,
            0x12 => self.portsc[1] = value as u16,
            _ => {}
        }
    }

    fn tick(&mut self, h: &Harness, _us: u64) {
        self.process_frame(h);
        self.frame_number = (self.frame_number + 1) & 0x7FF;
    }
}

fn uhci_harness() -> Rc<Harness> {
    let h = Harness::new();
    h.set_class_code(0x00, 0x03, 0x0C);
    h.install_model(Box::new(UhciModel::new()));
    h
}

#[test]
fn attach_clears_legacy_emulation() {
    let h = uhci_harness();
    let _hc = UhciController::new(h.clone()).unwrap();
    assert_eq!(h.cfg_read16(0xC0), 0);

    let base = h.with_model(|m: &mut UhciModel| m.frame_base);
    assert_ne!(base, 0);
    assert_eq!(base % 4096, 0);
    // All 1024 entries start terminated.
    for index in 0..1024u64 {
        assert_eq!(h.read_bus_u32(base as u64 + index * 4) & 1, 1);
    }
}

#[test]
fn low_speed_control_in_runs_three_stages() {
    let h = uhci_harness();
    let mut hc = UhciController::new(h.clone()).unwrap();

    // GET_DESCRIPTOR(DEVICE) for 18 bytes at 8 bytes per packet.
    let request = [0x80u8, 0x06, 0x00, 0x01, 0x00, 0x00, 18, 0];
    let mut data = [0u8; 18];
    let mut result = UsbResult::NO_ERROR;

    let transferred = hc
        .control_transfer(1, true, 8, &request, Direction::In, &mut data, TIMEOUT_MS, &mut result)
        .unwrap();

    assert_eq!(transferred, 18);
    assert_eq!(result, UsbResult::NO_ERROR);
    assert_eq!(data[0], 18);
    assert_eq!(data[8], 0x34);

    // SETUP, then the data packets with toggles 1,0,1, then an OUT
    // status with toggle 1.
    let executed = h.with_model(|m: &mut UhciModel| m.executed.clone());
    assert_eq!(
        executed,
        vec![
            (PID_SETUP, 0, 8),
            (PID_IN, 1, 8),
            (PID_IN, 0, 8),
            (PID_IN, 1, 2),
            (PID_OUT, 1, 0),
        ]
    );

    // Each stage went over the wire in its own frame-list pass.
    let passes = h.with_model(|m: &mut UhciModel| m.busy_frames.len());
    assert_eq!(passes, 3);

    // Descriptor memory is fully returned to the arena and nothing
    // stays mapped.
    assert_eq!(h.live_mappings(), 0);
}

#[test]
fn full_speed_control_runs_as_one_chain() {
    let h = uhci_harness();
    let mut hc = UhciController::new(h.clone()).unwrap();

    let request = [0x80u8, 0x06, 0x00, 0x01, 0x00, 0x00, 18, 0];
    let mut data = [0u8; 18];
    let mut result = UsbResult::NO_ERROR;

    let transferred = hc
        .control_transfer(1, false, 64, &request, Direction::In, &mut data, TIMEOUT_MS, &mut result)
        .unwrap();

    // One 18-byte packet fits a 64-byte pipe; the short packet ends the
    // data stage.
    assert_eq!(transferred, 18);
    let executed = h.with_model(|m: &mut UhciModel| m.executed.clone());
    assert_eq!(executed[0].0, PID_SETUP);
    assert_eq!(executed[1], (PID_IN, 1, 18));
}

#[test]
fn bulk_in_streams_with_alternating_toggles() {
    let h = uhci_harness();
    let mut hc = UhciController::new(h.clone()).unwrap();

    let payload: Vec<u8> = (0..512u32).map(|i| (i % 241) as u8).collect();
    h.with_model(|m: &mut UhciModel| {
        m.in_data = payload.clone();
        m.in_offset = 0;
    });

    let mut data = vec![0u8; 512];
    let mut toggle = 0;
    let mut result = UsbResult::NO_ERROR;

    let transferred = hc
        .bulk_transfer(2, 0x81, 64, &mut data, &mut toggle, TIMEOUT_MS, &mut result)
        .unwrap();

    assert_eq!(transferred, 512);
    assert_eq!(data, payload);
    assert_eq!(result, UsbResult::NO_ERROR);

    // Eight 64-byte packets, toggles alternating from 0; the caller's
    // toggle ends where the next transfer must start.
    let executed = h.with_model(|m: &mut UhciModel| m.executed.clone());
    assert_eq!(executed.len(), 8);
    for (i, &(pid, tog, len)) in executed.iter().enumerate() {
        assert_eq!(pid, PID_IN);
        assert_eq!(tog, (i % 2) as u8);
        assert_eq!(len, 64);
    }
    assert_eq!(toggle, 0);

    assert_eq!(h.live_mappings(), 0);
}

#[test]
fn bulk_out_delivers_payload_to_device() {
    let h = uhci_harness();
    let mut hc = UhciController::new(h.clone()).unwrap();

    let mut data: Vec<u8> = (0..96u8).collect();
    let mut toggle = 1;
    let mut result = UsbResult::NO_ERROR;

    let transferred = hc
        .bulk_transfer(2, 0x02, 32, &mut data, &mut toggle, TIMEOUT_MS, &mut result)
        .unwrap();

    assert_eq!(transferred, 96);
    let out = h.with_model(|m: &mut UhciModel| m.out_data.clone());
    assert_eq!(out, data);
    // Three packets starting at toggle 1: 1,0,1 -> next is 0.
    assert_eq!(toggle, 0);
}
