//! hostctl - host-controller driver core for storage and USB 1.1
//!
//! Three polled, descriptor-driven engines sharing one design idiom:
//!
//! - [`uhci`]: USB 1.1 host controller (frame list, queue-head /
//!   transfer-descriptor schedule, asynchronous interrupt monitor)
//! - [`ahci`]: SATA host bus adapter (per-port command list, received
//!   FIS area, PRD scatter tables)
//! - [`ide`]: legacy parallel ATA (PIO, bus-master UDMA, ATAPI packet
//!   framing)
//!
//! The [`passthru`] facade dispatches storage requests to whichever
//! engine matches the controller's work mode and adds cursored device
//! enumeration, device paths and a non-blocking request FIFO.
//!
//! All bus access, DMA mapping and time comes through the [`pci::PciIo`]
//! trait supplied at construction, so the engines run unchanged on real
//! hardware and under test harnesses driving virtual time.

#![cfg_attr(not(test), no_std)]
#![allow(dead_code)]
#![allow(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod ahci;
pub mod ata;
pub mod devpath;
pub mod dma;
pub mod error;
pub mod ide;
pub mod passthru;
pub mod pci;
pub mod policy;
pub mod time;
pub mod uhci;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result};
