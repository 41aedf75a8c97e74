//! Bounded polling helpers
//!
//! Every wait in the crate goes through these helpers so the stall
//! primitive injected via [`PciIo`] is the only source of time. One
//! polling iteration never blocks longer than 100 us; a timeout of zero
//! means "poll forever".

use crate::error::{Error, Result};
use crate::pci::{Bar, PciIo};

/// Granularity of one polling iteration in microseconds.
pub const POLL_GRANULARITY_US: u64 = 100;

pub const STALL_1_MS: u64 = 1_000;
pub const STALL_1_S: u64 = 1_000 * STALL_1_MS;

/// Poll `cond` every 100 us until it returns true or `timeout_us`
/// expires. `timeout_us == 0` polls without bound.
pub fn wait_cond(pci: &dyn PciIo, timeout_us: u64, mut cond: impl FnMut() -> bool) -> Result<()> {
    let infinite = timeout_us == 0;
    let mut remaining = timeout_us;

    loop {
        if cond() {
            return Ok(());
        }

        if !infinite {
            if remaining < POLL_GRANULARITY_US {
                return Err(Error::Timeout);
            }
            remaining -= POLL_GRANULARITY_US;
        }

        pci.stall_us(POLL_GRANULARITY_US);
    }
}

/// Wait until `(io_read16(bar, offset) & mask) == value`.
pub fn wait_io16(
    pci: &dyn PciIo,
    bar: Bar,
    offset: u64,
    mask: u16,
    value: u16,
    timeout_us: u64,
) -> Result<()> {
    wait_cond(pci, timeout_us, || pci.io_read16(bar, offset) & mask == value)
}

/// Wait until `(io_read8(bar, offset) & mask) == value`.
pub fn wait_io8(
    pci: &dyn PciIo,
    bar: Bar,
    offset: u64,
    mask: u8,
    value: u8,
    timeout_us: u64,
) -> Result<()> {
    wait_cond(pci, timeout_us, || pci.io_read8(bar, offset) & mask == value)
}

/// Wait until `(mem_read32(bar, offset) & mask) == value`.
pub fn wait_mem32(
    pci: &dyn PciIo,
    bar: Bar,
    offset: u64,
    mask: u32,
    value: u32,
    timeout_us: u64,
) -> Result<()> {
    wait_cond(pci, timeout_us, || pci.mem_read32(bar, offset) & mask == value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockPci;
    use std::cell::Cell;

    #[test]
    fn wait_cond_stalls_at_poll_granularity() {
        let pci = MockPci::new();
        let polls = Cell::new(0u32);
        let outcome = wait_cond(&pci, 1_000, || {
            polls.set(polls.get() + 1);
            false
        });
        assert_eq!(outcome.unwrap_err(), Error::Timeout);
        // Ten 100 us stalls fit the budget; the condition sees one
        // extra check before the timeout is declared.
        assert_eq!(pci.elapsed_us.get(), 1_000);
        assert_eq!(polls.get(), 11);
    }

    #[test]
    fn zero_timeout_waits_until_the_condition_holds() {
        let pci = MockPci::new();
        let polls = Cell::new(0u32);
        wait_cond(&pci, 0, || {
            polls.set(polls.get() + 1);
            polls.get() == 5
        })
        .unwrap();
        assert_eq!(polls.get(), 5);
        assert_eq!(pci.elapsed_us.get(), 4 * POLL_GRANULARITY_US);
    }

    #[test]
    fn satisfied_condition_returns_without_stalling() {
        let pci = MockPci::new();
        wait_cond(&pci, 100, || true).unwrap();
        assert_eq!(pci.elapsed_us.get(), 0);
    }
}
