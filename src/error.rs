//! Error taxonomy shared by all host-controller engines
//!
//! Every hardware-facing operation in this crate reports one of the
//! variants below; engines never signal errors out of band.

use bitflags::bitflags;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Common error taxonomy for the IDE, AHCI and UHCI engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Caller-side error detected before any hardware contact: bad
    /// alignment, unknown port, unsupported CDB length, bad mode.
    InvalidParameter,
    /// A non-blocking task whose engine has not finished yet; the task
    /// stays queued.
    NotReady,
    /// Enumeration walked past the end of the device list, or a device
    /// path did not translate to a known device.
    NotFound,
    /// The transfer would exceed the device's maximum sector count; the
    /// caller must split and retry.
    BadBufferSize,
    /// A latched status-register error bit, or the queue-drained-on-
    /// failure case of the async dispatcher.
    DeviceError,
    /// A polled wait exceeded its budget.
    Timeout,
    /// The engine does not implement the requested operation.
    Unsupported,
    /// Arena expansion, PCI mapping or descriptor allocation refused.
    OutOfResources,
}

bitflags! {
    /// Detailed USB transfer result mask accumulated over a TD chain.
    ///
    /// `NOT_EXECUTE` marks a chain that still has active descriptors;
    /// it is cleared once the chain reaches a terminal state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbResult: u32 {
        const NOT_EXECUTE = 1 << 0;
        const STALL       = 1 << 1;
        const BUFFER      = 1 << 2;
        const BABBLE      = 1 << 3;
        const NAK         = 1 << 4;
        const CRC         = 1 << 5;
        const TIMEOUT     = 1 << 6;
        const BITSTUFF    = 1 << 7;
        const SYSTEM      = 1 << 8;
    }
}

impl UsbResult {
    /// A completed, error-free transfer.
    pub const NO_ERROR: UsbResult = UsbResult::empty();
}
