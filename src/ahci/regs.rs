//! AHCI register definitions using tock-registers
//!
//! The HBA register file is reached through the memory accessors of the
//! bus handle rather than a direct MMIO overlay, so the bitfields below
//! are applied to read values with `LocalRegisterCopy`.

use tock_registers::register_bitfields;

use crate::pci::Bar;

/// AHCI base address register (ABAR).
pub const AHCI_BAR: Bar = Bar(5);

// ============================================================================
// Generic host control offsets
// ============================================================================

pub const HBA_CAP: u64 = 0x00;
pub const HBA_GHC: u64 = 0x04;
pub const HBA_IS: u64 = 0x08;
pub const HBA_PI: u64 = 0x0C;
pub const HBA_VS: u64 = 0x10;
pub const HBA_CAP2: u64 = 0x24;
pub const HBA_BOHC: u64 = 0x28;

/// First port register block and per-port stride.
pub const PORT_START: u64 = 0x100;
pub const PORT_REG_WIDTH: u64 = 0x80;

// Per-port register offsets.
pub const PORT_CLB: u64 = 0x00;
pub const PORT_CLBU: u64 = 0x04;
pub const PORT_FB: u64 = 0x08;
pub const PORT_FBU: u64 = 0x0C;
pub const PORT_IS: u64 = 0x10;
pub const PORT_IE: u64 = 0x14;
pub const PORT_CMD: u64 = 0x18;
pub const PORT_TFD: u64 = 0x20;
pub const PORT_SIG: u64 = 0x24;
pub const PORT_SSTS: u64 = 0x28;
pub const PORT_SCTL: u64 = 0x2C;
pub const PORT_SERR: u64 = 0x30;
pub const PORT_SACT: u64 = 0x34;
pub const PORT_CI: u64 = 0x38;
pub const PORT_SNTF: u64 = 0x3C;
pub const PORT_DEVSLP: u64 = 0x44;

/// Absolute offset of one port register.
pub fn port_reg(port: u8, reg: u64) -> u64 {
    PORT_START + port as u64 * PORT_REG_WIDTH + reg
}

register_bitfields![
    u32,
    /// Host Capabilities (CAP)
    pub CAP [
        /// Number of ports, zero based
        NP OFFSET(0) NUMBITS(5) [],
        /// Number of command slots, zero based
        NCS OFFSET(8) NUMBITS(5) [],
        /// Supports Command List Override
        SCLO OFFSET(24) NUMBITS(1) [],
        /// Supports Staggered Spin-up
        SSS OFFSET(27) NUMBITS(1) [],
        /// Supports Native Command Queuing
        SNCQ OFFSET(30) NUMBITS(1) [],
        /// Supports 64-bit Addressing
        S64A OFFSET(31) NUMBITS(1) []
    ],

    /// Global HBA Control (GHC)
    pub GHC [
        /// HBA Reset, self-clearing
        HR OFFSET(0) NUMBITS(1) [],
        /// Interrupt Enable
        IE OFFSET(1) NUMBITS(1) [],
        /// AHCI Enable
        AE OFFSET(31) NUMBITS(1) []
    ],

    /// Port Command and Status (PxCMD)
    pub PORT_CMD_BITS [
        /// Start processing the command list
        ST OFFSET(0) NUMBITS(1) [],
        /// Spin-Up Device
        SUD OFFSET(1) NUMBITS(1) [],
        /// Power On Device
        POD OFFSET(2) NUMBITS(1) [],
        /// Command List Override
        CLO OFFSET(3) NUMBITS(1) [],
        /// FIS Receive Enable
        FRE OFFSET(4) NUMBITS(1) [],
        /// FIS Receive Running
        FR OFFSET(14) NUMBITS(1) [],
        /// Command List Running
        CR OFFSET(15) NUMBITS(1) [],
        /// Cold Presence Detection
        CPD OFFSET(20) NUMBITS(1) [],
        /// Device is ATAPI
        ATAPI OFFSET(24) NUMBITS(1) [],
        /// Drive LED on ATAPI Enable
        DLAE OFFSET(25) NUMBITS(1) [],
        /// Aggressive Link Power Management Enable
        ALPE OFFSET(26) NUMBITS(1) [],
        /// Aggressive Slumber/Partial
        ASP OFFSET(27) NUMBITS(1) [],
        /// Interface Communication Control
        ICC OFFSET(28) NUMBITS(4) [
            NoOp = 0,
            Active = 1,
            Partial = 2,
            Slumber = 6
        ]
    ],

    /// Port Task File Data (PxTFD)
    pub PORT_TFD_BITS [
        /// Latched status: error
        STS_ERR OFFSET(0) NUMBITS(1) [],
        /// Latched status: data request
        STS_DRQ OFFSET(3) NUMBITS(1) [],
        /// Latched status: busy
        STS_BSY OFFSET(7) NUMBITS(1) [],
        /// Latched error register
        ERR OFFSET(8) NUMBITS(8) []
    ],

    /// Port Serial ATA Status (PxSSTS)
    pub PORT_SSTS_BITS [
        /// Device detection
        DET OFFSET(0) NUMBITS(4) [
            NotPresent = 0,
            PresentNoComm = 1,
            PresentComm = 3,
            PhyOffline = 4
        ],
        /// Interface power management
        IPM OFFSET(8) NUMBITS(4) []
    ],

    /// Port Serial ATA Control (PxSCTL)
    pub PORT_SCTL_BITS [
        /// Device detection initialization
        DET OFFSET(0) NUMBITS(4) [
            NoAction = 0,
            Comreset = 1,
            DisableSata = 4
        ],
        /// Power-management transitions disallowed: bit 0 partial,
        /// bit 1 slumber
        IPM OFFSET(8) NUMBITS(4) []
    ],

    /// Port Interrupt Status (PxIS)
    pub PORT_IS_BITS [
        /// Device to Host Register FIS received
        DHRS OFFSET(0) NUMBITS(1) [],
        /// PIO Setup FIS received
        PSS OFFSET(1) NUMBITS(1) [],
        /// Set Device Bits FIS received
        SDBS OFFSET(3) NUMBITS(1) [],
        /// Descriptor processed
        DPS OFFSET(5) NUMBITS(1) [],
        /// Interface fatal error
        IFS OFFSET(27) NUMBITS(1) [],
        /// Host bus data error
        HBDS OFFSET(28) NUMBITS(1) [],
        /// Host bus fatal error
        HBFS OFFSET(29) NUMBITS(1) [],
        /// Task file error
        TFES OFFSET(30) NUMBITS(1) []
    ]
];

// Raw masks for the polled waits, which work on plain u32 values.

pub const GHC_RESET: u32 = 1 << 0;
pub const GHC_ENABLE: u32 = 1 << 31;

pub const PORT_CMD_ST: u32 = 1 << 0;
pub const PORT_CMD_SUD: u32 = 1 << 1;
pub const PORT_CMD_POD: u32 = 1 << 2;
pub const PORT_CMD_CLO: u32 = 1 << 3;
pub const PORT_CMD_FRE: u32 = 1 << 4;
pub const PORT_CMD_FR: u32 = 1 << 14;
pub const PORT_CMD_CR: u32 = 1 << 15;
pub const PORT_CMD_CPD: u32 = 1 << 20;
pub const PORT_CMD_ATAPI: u32 = 1 << 24;
pub const PORT_CMD_DLAE: u32 = 1 << 25;
pub const PORT_CMD_ALPE: u32 = 1 << 26;
pub const PORT_CMD_ICC_MASK: u32 = 0xF << 28;
pub const PORT_CMD_ICC_ACTIVE: u32 = 1 << 28;

pub const PORT_TFD_BSY: u32 = 1 << 7;
pub const PORT_TFD_DRQ: u32 = 1 << 3;
pub const PORT_TFD_ERR: u32 = 1 << 0;

pub const PORT_IS_DHRS: u32 = 1 << 0;
pub const PORT_IS_PSS: u32 = 1 << 1;
pub const PORT_IS_DPS: u32 = 1 << 5;
pub const PORT_IS_IFS: u32 = 1 << 27;
pub const PORT_IS_HBDS: u32 = 1 << 28;
pub const PORT_IS_HBFS: u32 = 1 << 29;
pub const PORT_IS_TFES: u32 = 1 << 30;
pub const PORT_IS_FATAL: u32 = PORT_IS_IFS | PORT_IS_HBDS | PORT_IS_HBFS | PORT_IS_TFES;

pub const PORT_SSTS_DET_MASK: u32 = 0x0F;
pub const PORT_SSTS_DET_NONE: u32 = 0x00;
pub const PORT_SSTS_DET_PRESENT_COMM: u32 = 0x03;

pub const PORT_SCTL_DET_MASK: u32 = 0x0F;
pub const PORT_SCTL_DET_INIT: u32 = 0x01;
/// Disallow both partial and slumber transitions.
pub const PORT_SCTL_IPM_PSUD: u32 = 0x3 << 8;

/// All recorded SATA link errors; writing them back clears them.
pub const PORT_SERR_CLEAR: u32 = 0xFFFF_FFFF;

// ============================================================================
// Signatures and FIS framing
// ============================================================================

/// Upper half of PxSIG distinguishes device classes.
pub const SIG_MASK: u32 = 0xFFFF_0000;
pub const SIG_ATA: u32 = 0x0000_0000;
pub const SIG_ATAPI: u32 = 0xEB14_0000;

/// Low half of PxSIG observed once the device posted its signature.
pub const SIG_READY_MASK: u32 = 0x0000_FFFF;
pub const SIG_READY: u32 = 0x0000_0101;

pub const FIS_TYPE_MASK: u32 = 0xFF;
pub const FIS_REGISTER_H2D: u8 = 0x27;
pub const FIS_REGISTER_D2H: u8 = 0x34;
pub const FIS_PIO_SETUP: u8 = 0x5F;

/// Byte length of the H2D register FIS.
pub const FIS_REGISTER_H2D_LEN: usize = 20;
