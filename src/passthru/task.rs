//! Non-blocking transfer tasks
//!
//! Every pass-through request submitted with a completion event joins a
//! strict per-controller FIFO. The periodic tick revisits the head task
//! until its engine reports something other than `NotReady`; one hard
//! failure drains the whole queue, on the presumption that the queued
//! tasks belong to one logical caller.

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use crate::ahci::DmaState;
use crate::ata::{status, AtaCommandBlock, AtaProtocol, AtaStatusBlock};
use crate::ide::UdmaState;

use alloc::vec::Vec;

/// One pass-through request packet. The packet owns its data buffer so
/// a queued task stays valid after the submitting call returns.
pub struct AtaRequestPacket {
    pub protocol: AtaProtocol,
    pub timeout_us: u64,
    pub acb: AtaCommandBlock,
    pub asb: AtaStatusBlock,
    /// Payload: read target for the in-protocols, source for the
    /// out-protocols, empty for non-data.
    pub data: Vec<u8>,
}

impl AtaRequestPacket {
    pub fn non_data(acb: AtaCommandBlock, timeout_us: u64) -> Self {
        AtaRequestPacket {
            protocol: AtaProtocol::NonData,
            timeout_us,
            acb,
            asb: AtaStatusBlock::default(),
            data: Vec::new(),
        }
    }
}

/// Completion callback of a non-blocking request; receives the packet
/// back, with the status block describing the outcome.
pub type AsyncEvent = Box<dyn FnMut(AtaRequestPacket)>;

/// Engine-side context a started non-blocking transfer keeps between
/// ticks.
pub enum TaskState {
    Fresh,
    AhciDma(DmaState),
    IdeUdma(UdmaState),
}

pub struct AsyncTask {
    pub port: u16,
    pub pm_port: u16,
    pub packet: AtaRequestPacket,
    pub event: AsyncEvent,
    pub state: TaskState,
    /// Ticks left before the task is treated as timed out; unused when
    /// `infinite_wait` is set.
    pub retries: u64,
    pub infinite_wait: bool,
}

/// The task FIFO.
pub type TaskQueue = VecDeque<AsyncTask>;

/// Status-block value signalled on every event when the queue is
/// drained after a hard failure.
pub const ABORTED_STATUS: u8 = status::ERR;

/// Pop every queued task and signal its event with the aborted status.
pub fn drain_with_error(queue: &mut TaskQueue) {
    while let Some(mut task) = queue.pop_front() {
        task.packet.asb.status = ABORTED_STATUS;
        (task.event)(task.packet);
    }
}
