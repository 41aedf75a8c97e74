//! UHCI frame list, queue heads and transfer descriptors
//!
//! The controller walks these structures autonomously through 32-bit
//! bus addresses; the driver authors them in pool memory and navigates
//! the same chains by translating bus addresses back through the pool.
//! All hardware words are accessed volatile.

use core::ptr;

use crate::dma::{MemoryPool, PoolPtr};
use crate::error::{Result, UsbResult};
use crate::pci::{BusMasterOp, Mapping, PciIo};

/// Pool footprint of one queue head. The hardware words occupy the
/// first 8 bytes; the rest is padding to the pool granule.
pub const QH_SIZE: usize = 32;

/// Pool footprint of one transfer descriptor; hardware words in the
/// first 16 bytes.
pub const TD_SIZE: usize = 32;

/// Packet identifiers.
pub const PID_SETUP: u8 = 0x2D;
pub const PID_IN: u8 = 0x69;
pub const PID_OUT: u8 = 0xE1;

/// Ceiling on the encoded max-length field (0x4FF + 1 bytes).
pub const TD_MAX_LENGTH: usize = 0x500;

// Link word encoding shared by frame-list entries and QH links:
// bit 0 terminate, bit 1 QH select, bits 31:4 target. TD links add
// bit 2 as the depth-first flag.
const LINK_TERMINATE: u32 = 1 << 0;
const LINK_QH_SELECT: u32 = 1 << 1;
const LINK_DEPTH_FIRST: u32 = 1 << 2;
const LINK_PTR_MASK: u32 = 0xFFFF_FFF0;

// TD control/status word.
const TD_STATUS_ACTUAL_LEN_MASK: u32 = 0x7FF;
const TD_STATUS_BITSTUFF: u32 = 1 << 17;
const TD_STATUS_CRC_TIMEOUT: u32 = 1 << 18;
const TD_STATUS_NAK: u32 = 1 << 19;
const TD_STATUS_BABBLE: u32 = 1 << 20;
const TD_STATUS_BUFFER_ERR: u32 = 1 << 21;
const TD_STATUS_STALLED: u32 = 1 << 22;
const TD_STATUS_ACTIVE: u32 = 1 << 23;
const TD_STATUS_IOC: u32 = 1 << 24;
const TD_STATUS_LOW_SPEED: u32 = 1 << 26;
const TD_STATUS_ERR_COUNT: u32 = 3 << 27;
const TD_STATUS_SPD: u32 = 1 << 29;

// TD token word.
const TD_TOKEN_DEVADDR_SHIFT: u32 = 8;
const TD_TOKEN_ENDPOINT_SHIFT: u32 = 15;
const TD_TOKEN_TOGGLE: u32 = 1 << 19;
const TD_TOKEN_MAXLEN_SHIFT: u32 = 21;

#[inline]
fn read_word(cpu: *mut u8, offset: usize) -> u32 {
    unsafe { ptr::read_volatile(cpu.add(offset) as *const u32) }
}

#[inline]
fn write_word(cpu: *mut u8, offset: usize, value: u32) {
    unsafe { ptr::write_volatile(cpu.add(offset) as *mut u32, value) }
}

// ============================================================================
// Queue head
// ============================================================================

/// Handle to a queue head record in pool memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qh {
    ptr: PoolPtr,
}

impl Qh {
    pub fn create(pool: &mut MemoryPool) -> Result<Qh> {
        let ptr = pool.alloc(QH_SIZE)?;
        let qh = Qh { ptr };
        qh.set_horizontal_terminate();
        qh.set_vertical_terminate();
        Ok(qh)
    }

    pub fn destroy(self, pool: &mut MemoryPool) {
        pool.free(self.ptr, QH_SIZE);
    }

    pub fn bus(&self) -> u32 {
        self.ptr.bus32()
    }

    fn from_bus(pool: &MemoryPool, bus: u32) -> Option<Qh> {
        let cpu = pool.cpu_of_bus(bus as u64)?;
        Some(Qh { ptr: PoolPtr { cpu, bus: bus as u64 } })
    }

    pub fn horizontal_raw(&self) -> u32 {
        read_word(self.ptr.cpu, 0)
    }

    pub fn horizontal_valid(&self) -> bool {
        self.horizontal_raw() & LINK_TERMINATE == 0
    }

    pub fn horizontal_target(&self) -> u32 {
        self.horizontal_raw() & LINK_PTR_MASK
    }

    /// Link the horizontal pointer at the next queue head.
    pub fn set_horizontal_qh(&self, qh_bus: u32) {
        write_word(self.ptr.cpu, 0, (qh_bus & LINK_PTR_MASK) | LINK_QH_SELECT);
    }

    pub fn set_horizontal_raw(&self, raw: u32) {
        write_word(self.ptr.cpu, 0, raw);
    }

    pub fn set_horizontal_terminate(&self) {
        write_word(self.ptr.cpu, 0, LINK_TERMINATE);
    }

    /// Link the vertical pointer at the first TD of a transfer.
    pub fn set_vertical_td(&self, td_bus: u32) {
        write_word(self.ptr.cpu, 4, td_bus & LINK_PTR_MASK);
    }

    pub fn set_vertical_terminate(&self) {
        write_word(self.ptr.cpu, 4, LINK_TERMINATE);
    }
}

// ============================================================================
// Transfer descriptor
// ============================================================================

/// Handle to a transfer descriptor record in pool memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Td {
    ptr: PoolPtr,
}

/// Parameters shared by every TD of one endpoint.
#[derive(Debug, Clone, Copy)]
pub struct TdEndpoint {
    pub device_address: u8,
    pub endpoint: u8,
    pub low_speed: bool,
}

impl Td {
    pub fn create(pool: &mut MemoryPool) -> Result<Td> {
        let ptr = pool.alloc(TD_SIZE)?;
        let td = Td { ptr };
        td.set_link_terminate();
        Ok(td)
    }

    pub fn destroy(self, pool: &mut MemoryPool) {
        pool.free(self.ptr, TD_SIZE);
    }

    pub fn bus(&self) -> u32 {
        self.ptr.bus32()
    }

    pub fn link_raw(&self) -> u32 {
        read_word(self.ptr.cpu, 0)
    }

    /// Point the link at the next TD, depth-first so the controller
    /// finishes one transfer before moving across the frame.
    pub fn set_link_td(&self, td_bus: u32) {
        write_word(self.ptr.cpu, 0, (td_bus & LINK_PTR_MASK) | LINK_DEPTH_FIRST);
    }

    pub fn set_link_qh(&self, qh_bus: u32) {
        write_word(self.ptr.cpu, 0, (qh_bus & LINK_PTR_MASK) | LINK_QH_SELECT);
    }

    pub fn set_link_terminate(&self) {
        write_word(self.ptr.cpu, 0, LINK_TERMINATE);
    }

    fn status_word(&self) -> u32 {
        read_word(self.ptr.cpu, 4)
    }

    fn set_status_word(&self, value: u32) {
        write_word(self.ptr.cpu, 4, value);
    }

    fn token_word(&self) -> u32 {
        read_word(self.ptr.cpu, 8)
    }

    fn set_token_word(&self, value: u32) {
        write_word(self.ptr.cpu, 8, value);
    }

    fn set_buffer(&self, bus: u32) {
        write_word(self.ptr.cpu, 12, bus);
    }

    /// Author a SETUP token carrying the 8-byte device request.
    pub fn write_setup(&self, ep: TdEndpoint, request_bus: u32) {
        // The actual-length field encodes N-1; 0x7FF is "nothing moved".
        let mut status = TD_STATUS_ACTIVE | TD_STATUS_ERR_COUNT | TD_STATUS_ACTUAL_LEN_MASK;
        if ep.low_speed {
            status |= TD_STATUS_LOW_SPEED;
        }
        self.set_status_word(status);
        self.set_token_word(token(PID_SETUP, ep.device_address, 0, 0, 8));
        self.set_buffer(request_bus);
    }

    /// Author a DATA token of up to one max packet.
    pub fn write_data(
        &self,
        ep: TdEndpoint,
        pid: u8,
        toggle: u8,
        len: usize,
        buffer_bus: u32,
    ) {
        debug_assert!(len <= TD_MAX_LENGTH);
        let mut status = TD_STATUS_ACTIVE | TD_STATUS_ERR_COUNT | TD_STATUS_ACTUAL_LEN_MASK;
        if ep.low_speed {
            status |= TD_STATUS_LOW_SPEED;
        }
        self.set_status_word(status);
        self.set_token_word(token(pid, ep.device_address, ep.endpoint, toggle, len));
        self.set_buffer(buffer_bus);
    }

    /// Author the zero-length STATUS token closing a control transfer;
    /// its toggle is always 1 and it raises IOC.
    pub fn write_status(&self, ep: TdEndpoint, pid: u8) {
        let mut status =
            TD_STATUS_ACTIVE | TD_STATUS_ERR_COUNT | TD_STATUS_IOC | TD_STATUS_ACTUAL_LEN_MASK;
        if ep.low_speed {
            status |= TD_STATUS_LOW_SPEED;
        }
        self.set_status_word(status);
        self.set_token_word(token(pid, ep.device_address, 0, 1, 0));
        self.set_buffer(0);
    }

    pub fn set_short_packet_detect(&self, enable: bool) {
        let s = self.status_word();
        self.set_status_word(if enable { s | TD_STATUS_SPD } else { s & !TD_STATUS_SPD });
    }

    pub fn set_ioc(&self, enable: bool) {
        let s = self.status_word();
        self.set_status_word(if enable { s | TD_STATUS_IOC } else { s & !TD_STATUS_IOC });
    }

    pub fn is_active(&self) -> bool {
        self.status_word() & TD_STATUS_ACTIVE != 0
    }

    /// Re-arm the descriptor for another pass of the schedule.
    pub fn set_active(&self, active: bool) {
        let s = self.status_word() & !TD_STATUS_ACTUAL_LEN_MASK;
        let s = s & !(TD_STATUS_BITSTUFF
            | TD_STATUS_CRC_TIMEOUT
            | TD_STATUS_NAK
            | TD_STATUS_BABBLE
            | TD_STATUS_BUFFER_ERR
            | TD_STATUS_STALLED);
        self.set_status_word(if active {
            s | TD_STATUS_ACTIVE | TD_STATUS_ERR_COUNT | TD_STATUS_ACTUAL_LEN_MASK
        } else {
            s & !TD_STATUS_ACTIVE
        });
    }

    /// Bytes the controller actually moved (field stores N-1).
    pub fn actual_length(&self) -> usize {
        let raw = self.status_word() & TD_STATUS_ACTUAL_LEN_MASK;
        // 0x7FF encodes zero bytes.
        ((raw as usize) + 1) & TD_STATUS_ACTUAL_LEN_MASK as usize
    }

    /// Encoded maximum length of this token in bytes.
    pub fn token_max_length(&self) -> usize {
        let raw = (self.token_word() >> TD_TOKEN_MAXLEN_SHIFT) & 0x7FF;
        ((raw as usize) + 1) & TD_STATUS_ACTUAL_LEN_MASK as usize
    }

    pub fn data_toggle(&self) -> u8 {
        ((self.token_word() & TD_TOKEN_TOGGLE) != 0) as u8
    }

    pub fn set_data_toggle(&self, toggle: u8) {
        let t = self.token_word();
        self.set_token_word(if toggle != 0 { t | TD_TOKEN_TOGGLE } else { t & !TD_TOKEN_TOGGLE });
    }

    /// Error bits of an inactive descriptor mapped to the result mask.
    pub fn error_mask(&self) -> UsbResult {
        let s = self.status_word();
        let mut r = UsbResult::empty();
        if s & TD_STATUS_ACTIVE != 0 {
            r |= UsbResult::NOT_EXECUTE;
        }
        if s & TD_STATUS_STALLED != 0 {
            r |= UsbResult::STALL;
        }
        if s & TD_STATUS_BUFFER_ERR != 0 {
            r |= UsbResult::BUFFER;
        }
        if s & TD_STATUS_BABBLE != 0 {
            r |= UsbResult::BABBLE;
        }
        if s & TD_STATUS_NAK != 0 {
            r |= UsbResult::NAK;
        }
        if s & TD_STATUS_CRC_TIMEOUT != 0 {
            r |= UsbResult::TIMEOUT;
        }
        if s & TD_STATUS_BITSTUFF != 0 {
            r |= UsbResult::BITSTUFF;
        }
        r
    }
}

fn token(pid: u8, device_address: u8, endpoint: u8, toggle: u8, len: usize) -> u32 {
    // Max length is encoded as N-1 in 11 bits; zero-length is 0x7FF.
    let encoded_len = (len.wrapping_sub(1) & 0x7FF) as u32;
    let mut t = pid as u32;
    t |= ((device_address & 0x7F) as u32) << TD_TOKEN_DEVADDR_SHIFT;
    t |= ((endpoint & 0x0F) as u32) << TD_TOKEN_ENDPOINT_SHIFT;
    if toggle != 0 {
        t |= TD_TOKEN_TOGGLE;
    }
    t | (encoded_len << TD_TOKEN_MAXLEN_SHIFT)
}

/// Chain `tds` vertically and hang the chain under `qh`.
pub fn link_chain(qh: Qh, tds: &[Td]) {
    for pair in tds.windows(2) {
        pair[0].set_link_td(pair[1].bus());
    }
    if let Some(last) = tds.last() {
        last.set_link_terminate();
    }
    match tds.first() {
        Some(first) => qh.set_vertical_td(first.bus()),
        None => qh.set_vertical_terminate(),
    }
}

// ============================================================================
// TD chain result scan
// ============================================================================

/// Outcome of one scan over a TD chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainResult {
    pub result: UsbResult,
    /// Zero-based position of the first descriptor that is still active
    /// or carries an error; equal to the count of descriptors that
    /// completed cleanly. Only meaningful when `result` is non-empty.
    pub err_td_pos: usize,
    pub actual_len: usize,
    pub finished: bool,
}

/// Walk the chain accumulating error bits and completed byte counts.
/// A short packet (actual below the token maximum) finishes the chain.
pub fn check_chain(tds: &[Td], required_len: usize) -> ChainResult {
    let mut out = ChainResult {
        result: UsbResult::empty(),
        err_td_pos: 0,
        actual_len: 0,
        finished: true,
    };

    for (pos, td) in tds.iter().enumerate() {
        out.result |= td.error_mask();

        if !out.result.is_empty() {
            out.err_td_pos = pos;
            out.finished = false;
            return out;
        }

        let len = td.actual_length();
        out.actual_len += len;

        if out.actual_len <= required_len && len < td.token_max_length() {
            break;
        }
    }

    out
}

// ============================================================================
// Frame list
// ============================================================================

/// The 1024-entry schedule the controller indexes once per millisecond.
pub struct FrameList {
    cpu: *mut u8,
    bus: u64,
    mapping: Option<Mapping>,
}

impl FrameList {
    pub const ENTRIES: usize = 1024;
    const PAGES: usize = 1;

    /// Allocate, map and terminate all 1024 entries.
    pub fn new(pci: &dyn PciIo) -> Result<FrameList> {
        let cpu = pci.allocate_buffer(Self::PAGES)?;
        let (bus, mapping) = match pci.map(BusMasterOp::CommonBuffer, cpu, 4096) {
            Ok(v) => v,
            Err(e) => {
                pci.free_buffer(Self::PAGES, cpu);
                return Err(e);
            }
        };
        let list = FrameList { cpu, bus, mapping: Some(mapping) };
        list.clear();
        Ok(list)
    }

    pub fn release(mut self, pci: &dyn PciIo) {
        if let Some(mapping) = self.mapping.take() {
            pci.unmap(mapping);
        }
        pci.free_buffer(Self::PAGES, self.cpu);
    }

    /// Bus address programmed into the frame-list base register.
    pub fn bus(&self) -> u32 {
        self.bus as u32
    }

    /// Mark every entry terminate.
    pub fn clear(&self) {
        for index in 0..Self::ENTRIES {
            self.write_entry(index, LINK_TERMINATE);
        }
    }

    fn read_entry(&self, index: usize) -> u32 {
        read_word(self.cpu, index * 4)
    }

    fn write_entry(&self, index: usize, value: u32) {
        write_word(self.cpu, index * 4, value);
    }

    /// Append `qh` to the horizontal chain rooted at `index`.
    ///
    /// A queue head already present in the chain is not linked twice,
    /// and a self-linked queue head ends the walk without linking.
    pub fn link_qh(&self, pool: &MemoryPool, index: usize, qh: Qh) {
        let entry = self.read_entry(index);

        if entry & LINK_TERMINATE != 0 {
            self.write_entry(index, (qh.bus() & LINK_PTR_MASK) | LINK_QH_SELECT);
            return;
        }

        let mut cursor = match Qh::from_bus(pool, entry & LINK_PTR_MASK) {
            Some(q) => q,
            None => return,
        };

        if cursor.bus() == qh.bus() {
            return;
        }

        while cursor.horizontal_valid() {
            let next_bus = cursor.horizontal_target();

            // A bulk queue head may be linked to itself; stop instead of
            // looping forever and leave the chain as it is.
            if next_bus == cursor.bus() {
                return;
            }

            cursor = match Qh::from_bus(pool, next_bus) {
                Some(q) => q,
                None => return,
            };

            if cursor.bus() == qh.bus() {
                return;
            }
        }

        cursor.set_horizontal_qh(qh.bus());
    }

    /// Remove `qh` from the horizontal chain rooted at `index`.
    pub fn unlink_qh(&self, pool: &MemoryPool, index: usize, qh: Qh) {
        let entry = self.read_entry(index);
        if entry & LINK_TERMINATE != 0 {
            return;
        }

        let successor = |q: Qh| -> u32 {
            // Carry the target's own horizontal link upward, breaking a
            // self-link into a terminate.
            if q.horizontal_valid() && q.horizontal_target() != q.bus() {
                q.horizontal_raw()
            } else {
                LINK_TERMINATE
            }
        };

        if entry & LINK_PTR_MASK == qh.bus() {
            self.write_entry(index, successor(qh));
            return;
        }

        let mut cursor = match Qh::from_bus(pool, entry & LINK_PTR_MASK) {
            Some(q) => q,
            None => return,
        };

        while cursor.horizontal_valid() {
            let next_bus = cursor.horizontal_target();
            if next_bus == cursor.bus() {
                return;
            }
            if next_bus == qh.bus() {
                cursor.set_horizontal_raw(successor(qh));
                return;
            }
            cursor = match Qh::from_bus(pool, next_bus) {
                Some(q) => q,
                None => return,
            };
        }
    }

    /// Remove `qh` from every entry of the schedule.
    pub fn unlink_qh_everywhere(&self, pool: &MemoryPool, qh: Qh) {
        for index in 0..Self::ENTRIES {
            self.unlink_qh(pool, index, qh);
        }
    }

    /// Count the entries whose chain reaches `qh`.
    #[cfg(test)]
    pub fn entries_referencing(&self, pool: &MemoryPool, qh: Qh) -> usize {
        let mut count = 0;
        'entries: for index in 0..Self::ENTRIES {
            let entry = self.read_entry(index);
            if entry & LINK_TERMINATE != 0 {
                continue;
            }
            let mut bus = entry & LINK_PTR_MASK;
            loop {
                if bus == qh.bus() {
                    count += 1;
                    continue 'entries;
                }
                let cursor = match Qh::from_bus(pool, bus) {
                    Some(q) => q,
                    None => continue 'entries,
                };
                if !cursor.horizontal_valid() || cursor.horizontal_target() == bus {
                    continue 'entries;
                }
                bus = cursor.horizontal_target();
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockPci;
    use alloc::rc::Rc;
    use alloc::vec::Vec;

    fn fixture() -> (Rc<MockPci>, MemoryPool, FrameList) {
        let pci = Rc::new(MockPci::new());
        let pool = MemoryPool::new(pci.clone()).unwrap();
        let frames = FrameList::new(pci.as_ref()).unwrap();
        (pci, pool, frames)
    }

    const FULL_SPEED_EP: TdEndpoint =
        TdEndpoint { device_address: 2, endpoint: 1, low_speed: false };

    #[test]
    fn token_encodes_length_minus_one() {
        let (_pci, mut pool, _frames) = fixture();
        let td = Td::create(&mut pool).unwrap();
        td.write_data(FULL_SPEED_EP, PID_IN, 1, 64, 0x1000);
        assert_eq!(td.token_max_length(), 64);
        assert_eq!(td.data_toggle(), 1);

        td.write_status(FULL_SPEED_EP, PID_OUT);
        assert_eq!(td.token_max_length(), 0);
        assert_eq!(td.data_toggle(), 1);
    }

    #[test]
    fn chain_scan_stops_on_active_descriptor() {
        let (_pci, mut pool, _frames) = fixture();
        let tds: Vec<Td> = (0..3).map(|_| Td::create(&mut pool).unwrap()).collect();
        for td in &tds {
            td.write_data(FULL_SPEED_EP, PID_IN, 0, 64, 0);
        }
        // First completed with a full packet, rest still active.
        tds[0].set_active(false);
        // Simulate 64 bytes moved: actual field stores N-1.
        let s = read_word(tds[0].ptr.cpu, 4) & !TD_STATUS_ACTUAL_LEN_MASK;
        write_word(tds[0].ptr.cpu, 4, s | 63);

        let r = check_chain(&tds, 192);
        assert!(!r.finished);
        assert!(r.result.contains(UsbResult::NOT_EXECUTE));
        assert_eq!(r.err_td_pos, 1);
        assert_eq!(r.actual_len, 64);
    }

    #[test]
    fn short_packet_finishes_chain_without_error() {
        let (_pci, mut pool, _frames) = fixture();
        let tds: Vec<Td> = (0..3).map(|_| Td::create(&mut pool).unwrap()).collect();
        for td in &tds {
            td.write_data(FULL_SPEED_EP, PID_IN, 0, 64, 0);
            td.set_active(false);
        }
        // 64 then 16 bytes; third untouched (would be an error if
        // reached, but the short packet ends the walk first).
        let s0 = read_word(tds[0].ptr.cpu, 4) & !TD_STATUS_ACTUAL_LEN_MASK;
        write_word(tds[0].ptr.cpu, 4, s0 | 63);
        let s1 = read_word(tds[1].ptr.cpu, 4) & !TD_STATUS_ACTUAL_LEN_MASK;
        write_word(tds[1].ptr.cpu, 4, s1 | 15);
        tds[2].set_active(true);

        let r = check_chain(&tds, 192);
        assert!(r.finished);
        assert_eq!(r.result, UsbResult::NO_ERROR);
        assert_eq!(r.actual_len, 80);
    }

    #[test]
    fn frame_link_appends_and_skips_duplicates() {
        let (_pci, mut pool, frames) = fixture();
        let a = Qh::create(&mut pool).unwrap();
        let b = Qh::create(&mut pool).unwrap();

        frames.link_qh(&pool, 7, a);
        frames.link_qh(&pool, 7, b);
        frames.link_qh(&pool, 7, b);

        assert_eq!(frames.read_entry(7) & LINK_PTR_MASK, a.bus());
        assert_eq!(a.horizontal_target(), b.bus());
        assert!(!b.horizontal_valid());

        frames.unlink_qh(&pool, 7, b);
        assert!(!a.horizontal_valid());
        frames.unlink_qh(&pool, 7, a);
        assert_eq!(frames.read_entry(7), LINK_TERMINATE);
    }

    #[test]
    fn self_linked_qh_breaks_the_walk() {
        let (_pci, mut pool, frames) = fixture();
        let a = Qh::create(&mut pool).unwrap();
        let b = Qh::create(&mut pool).unwrap();

        frames.link_qh(&pool, 3, a);
        a.set_horizontal_qh(a.bus());

        // Walk must terminate and must not link b.
        frames.link_qh(&pool, 3, b);
        assert_eq!(a.horizontal_target(), a.bus());

        // Unlinking the self-linked head leaves a terminated entry.
        frames.unlink_qh(&pool, 3, a);
        assert_eq!(frames.read_entry(3), LINK_TERMINATE);
    }
}
