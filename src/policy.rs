//! Per-instance configuration and the controller-init collaborator
//!
//! The platform's IDE controller-init services are modeled as a trait;
//! the engines only invoke its phase callbacks and consume the transfer
//! modes it proposes. [`DefaultIdeInit`] derives the modes straight
//! from IDENTIFY data for platforms without their own implementation.

use crate::ata::IdentifyData;
use crate::error::Result;

/// Platform ATA/ATAPI policy knobs, passed at construction instead of
/// living in module-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtaAtapiPolicy {
    pub version: u8,
    /// Power-up in standby: 0 disabled, 1 enabled, 2 leave as-is.
    pub puis_enable: u8,
    pub device_sleep_enable: u8,
    pub aggressive_device_sleep_enable: u8,
    pub reserved: u8,
}

impl Default for AtaAtapiPolicy {
    fn default() -> Self {
        AtaAtapiPolicy {
            version: 1,
            puis_enable: 2,
            device_sleep_enable: 0,
            aggressive_device_sleep_enable: 0,
            reserved: 0,
        }
    }
}

/// Enumeration phases reported to the collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdeInitPhase {
    BeforeChannelEnumeration,
    BeforeDevicePresenceDetection,
    AfterDevicePresenceDetection,
    AfterChannelEnumeration,
}

/// Transfer modes proposed by the collaborator for one device, by mode
/// number within each category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceModes {
    pub pio: Option<u8>,
    pub udma: Option<u8>,
    pub multi_word_dma: Option<u8>,
}

/// External IDE controller-init collaborator.
pub trait IdeControllerInit {
    fn notify_phase(&mut self, phase: IdeInitPhase, channel: u8);

    /// Hand over the raw IDENTIFY block of a discovered device.
    fn submit_data(&mut self, channel: u8, device: u8, identify: &IdentifyData);

    /// Compute the best modes the controller and device both support.
    fn calculate_mode(&mut self, channel: u8, device: u8) -> Result<DeviceModes>;

    /// Latch controller timing registers for the chosen modes.
    fn set_timing(&mut self, channel: u8, device: u8, modes: &DeviceModes);
}

/// Mode calculation straight from the IDENTIFY words, with no
/// controller-side restrictions.
#[derive(Default)]
pub struct DefaultIdeInit {
    submitted: [[Option<DeviceModes>; 2]; 32],
}

impl DefaultIdeInit {
    fn best_modes(identify: &IdentifyData) -> DeviceModes {
        // Word 64 low byte: advanced PIO modes (bit 0 = mode 3).
        let pio = match identify.words[64] & 0x03 {
            0b10 | 0b11 => 4,
            0b01 => 3,
            _ => 2,
        };

        // Word 88 low byte: supported UDMA modes, valid with word 53 bit 2.
        let udma = if identify.words[53] & (1 << 2) != 0 && identify.words[88] & 0xFF != 0 {
            Some((15 - (identify.words[88] & 0xFF).leading_zeros()) as u8)
        } else {
            None
        };

        // Word 63 low byte: supported multiword DMA modes.
        let multi_word_dma = if identify.words[63] & 0x07 != 0 {
            Some((15 - (identify.words[63] & 0x07).leading_zeros()) as u8)
        } else {
            None
        };

        DeviceModes { pio: Some(pio), udma, multi_word_dma }
    }
}

impl IdeControllerInit for DefaultIdeInit {
    fn notify_phase(&mut self, _phase: IdeInitPhase, _channel: u8) {}

    fn submit_data(&mut self, channel: u8, device: u8, identify: &IdentifyData) {
        if (channel as usize) < 32 && (device as usize) < 2 {
            self.submitted[channel as usize][device as usize] = Some(Self::best_modes(identify));
        }
    }

    fn calculate_mode(&mut self, channel: u8, device: u8) -> Result<DeviceModes> {
        Ok(self
            .submitted
            .get(channel as usize)
            .and_then(|c| c.get(device as usize))
            .and_then(|m| *m)
            .unwrap_or(DeviceModes { pio: Some(2), udma: None, multi_word_dma: None }))
    }

    fn set_timing(&mut self, _channel: u8, _device: u8, _modes: &DeviceModes) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_modes_from_identify_words() {
        let mut id = IdentifyData::zeroed();
        id.words[64] = 0x0003; // PIO 3 and 4
        id.words[53] = 1 << 2; // word 88 valid
        id.words[88] = 0x003F; // UDMA 0-5
        id.words[63] = 0x0007; // MDMA 0-2

        let m = DefaultIdeInit::best_modes(&id);
        assert_eq!(m.pio, Some(4));
        assert_eq!(m.udma, Some(5));
        assert_eq!(m.multi_word_dma, Some(2));
    }

    #[test]
    fn udma_requires_word53_validity() {
        let mut id = IdentifyData::zeroed();
        id.words[88] = 0x003F;
        let m = DefaultIdeInit::best_modes(&id);
        assert_eq!(m.udma, None);
        assert_eq!(m.pio, Some(2));
    }
}
