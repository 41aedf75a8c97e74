//! Device-path nodes for enumerated storage devices
//!
//! The pass-through surface names devices with a single messaging node:
//! ATAPI for devices behind an IDE controller, SATA for devices behind
//! an AHCI HBA. Each path is terminated by an End node.

use r_efi::protocols::device_path::{Protocol, TYPE_END};

use crate::error::{Error, Result};

/// Type for Messaging device paths.
const TYPE_MESSAGING: u8 = 0x03;
/// Sub-type for ATAPI device path nodes.
const SUBTYPE_ATAPI: u8 = 0x01;
/// Sub-type for SATA device path nodes.
const SUBTYPE_SATA: u8 = 0x12;
/// Sub-type for the end-of-entire-path node.
const SUBTYPE_END_ENTIRE: u8 = 0xFF;

/// ATAPI device path node (UEFI spec 10.3.4.1).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct AtapiDevicePathNode {
    pub header: Protocol,
    /// 0 primary, 1 secondary.
    pub primary_secondary: u8,
    /// 0 master, 1 slave.
    pub slave_master: u8,
    pub lun: u16,
}

/// SATA device path node (UEFI spec 10.3.4.6).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct SataDevicePathNode {
    pub header: Protocol,
    pub hba_port: u16,
    /// 0xFFFF when the device hangs directly off the HBA port.
    pub port_multiplier_port: u16,
    pub lun: u16,
}

/// A complete single-node device path for one attached device.
#[derive(Clone, Copy, Debug)]
pub enum DevicePath {
    Atapi(AtapiDevicePathNode),
    Sata(SataDevicePathNode),
}

fn end_node() -> Protocol {
    Protocol {
        r#type: TYPE_END,
        sub_type: SUBTYPE_END_ENTIRE,
        length: [core::mem::size_of::<Protocol>() as u8, 0],
    }
}

/// Build the ATAPI node for an IDE-attached device.
pub fn create_atapi_device_path(channel: u8, device: u8, lun: u16) -> DevicePath {
    DevicePath::Atapi(AtapiDevicePathNode {
        header: Protocol {
            r#type: TYPE_MESSAGING,
            sub_type: SUBTYPE_ATAPI,
            length: [core::mem::size_of::<AtapiDevicePathNode>() as u8, 0],
        },
        primary_secondary: channel,
        slave_master: device,
        lun,
    })
}

/// Build the SATA node for an AHCI-attached device.
pub fn create_sata_device_path(hba_port: u16, pm_port: u16, lun: u16) -> DevicePath {
    DevicePath::Sata(SataDevicePathNode {
        header: Protocol {
            r#type: TYPE_MESSAGING,
            sub_type: SUBTYPE_SATA,
            length: [core::mem::size_of::<SataDevicePathNode>() as u8, 0],
        },
        hba_port,
        port_multiplier_port: pm_port,
        lun,
    })
}

impl DevicePath {
    /// The end node that terminates this path when it is serialized.
    pub fn terminator(&self) -> Protocol {
        end_node()
    }

    /// Validate the node header and recover the `(port, port-multiplier)`
    /// pair it names.
    pub fn port_and_pm(&self) -> Result<(u16, u16)> {
        match self {
            DevicePath::Atapi(node) => {
                if node.header.r#type != TYPE_MESSAGING
                    || node.header.sub_type != SUBTYPE_ATAPI
                    || node.header.length[0] as usize != core::mem::size_of::<AtapiDevicePathNode>()
                {
                    return Err(Error::NotFound);
                }
                Ok((node.primary_secondary as u16, node.slave_master as u16))
            }
            DevicePath::Sata(node) => {
                if node.header.r#type != TYPE_MESSAGING
                    || node.header.sub_type != SUBTYPE_SATA
                    || node.header.length[0] as usize != core::mem::size_of::<SataDevicePathNode>()
                {
                    return Err(Error::NotFound);
                }
                Ok(({ node.hba_port }, { node.port_multiplier_port }))
            }
        }
    }
}
