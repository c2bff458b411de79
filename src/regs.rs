//! EHCI controller register banks.
//!
//! The capability bank is read-only and tells us where the operational bank
//! lives (`base + CAPLENGTH`); the operational bank carries the run/stop,
//! schedule-enable and interrupt plumbing the schedule engine drives.
//!
//! # References
//! - EHCI Specification 1.0, chapter 2

use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite};

register_bitfields! [
    u32,
    /// Capability Register Length and Interface Version (offset 0x00)
    pub CAPLENGTH_HCIVERSION [
        /// Offset from the register base to the operational registers
        CAPLENGTH OFFSET(0) NUMBITS(8) [],
        /// Interface version number (BCD)
        HCIVERSION OFFSET(16) NUMBITS(16) []
    ],

    /// Capability Parameters (HCCPARAMS) - offset 0x08
    pub HCCPARAMS [
        /// 64-bit Addressing Capability
        AC64 OFFSET(0) NUMBITS(1) [],
        /// Programmable Frame List Flag
        PFLF OFFSET(1) NUMBITS(1) [],
        /// Asynchronous Schedule Park Capability
        ASPC OFFSET(2) NUMBITS(1) []
    ]
];

register_bitfields! [
    u32,
    /// USB Command (USBCMD) - op offset 0x00
    pub USBCMD [
        /// Run/Stop
        RS OFFSET(0) NUMBITS(1) [],
        /// Host Controller Reset
        HCRESET OFFSET(1) NUMBITS(1) [],
        /// Frame List Size
        FLS OFFSET(2) NUMBITS(2) [
            Size1024 = 0,
            Size512 = 1,
            Size256 = 2,
            Size128 = 3
        ],
        /// Periodic Schedule Enable
        PSE OFFSET(4) NUMBITS(1) [],
        /// Asynchronous Schedule Enable
        ASE OFFSET(5) NUMBITS(1) [],
        /// Interrupt on Async Advance Doorbell
        IAAD OFFSET(6) NUMBITS(1) [],
        /// Light Host Controller Reset
        LHCRESET OFFSET(7) NUMBITS(1) []
    ],

    /// USB Status (USBSTS) - op offset 0x04
    pub USBSTS [
        /// USB Interrupt (transaction with IOC retired)
        USBINT OFFSET(0) NUMBITS(1) [],
        /// USB Error Interrupt
        USBERRINT OFFSET(1) NUMBITS(1) [],
        /// Port Change Detect
        PCD OFFSET(2) NUMBITS(1) [],
        /// Frame List Rollover
        FLR OFFSET(3) NUMBITS(1) [],
        /// Host System Error
        HSE OFFSET(4) NUMBITS(1) [],
        /// Interrupt on Async Advance
        IAA OFFSET(5) NUMBITS(1) [],
        /// HC Halted
        HCHALTED OFFSET(12) NUMBITS(1) [],
        /// Periodic Schedule Status
        PSS OFFSET(14) NUMBITS(1) [],
        /// Asynchronous Schedule Status
        ASS OFFSET(15) NUMBITS(1) []
    ],

    /// USB Interrupt Enable (USBINTR) - op offset 0x08
    pub USBINTR [
        /// USB Interrupt Enable
        USBIE OFFSET(0) NUMBITS(1) [],
        /// USB Error Interrupt Enable
        USBEIE OFFSET(1) NUMBITS(1) [],
        /// Port Change Interrupt Enable
        PCIE OFFSET(2) NUMBITS(1) [],
        /// Frame List Rollover Enable
        FLRE OFFSET(3) NUMBITS(1) [],
        /// Host System Error Enable
        HSEE OFFSET(4) NUMBITS(1) [],
        /// Interrupt on Async Advance Enable
        IAAE OFFSET(5) NUMBITS(1) []
    ],

    /// Configure Flag (CONFIGFLAG) - op offset 0x40
    pub CONFIGFLAG [
        /// Route ports to this controller instead of the companions
        CF OFFSET(0) NUMBITS(1) []
    ],

    /// USB Mode (USBMODE) - op offset 0x68, i.MX-style controllers only
    pub USBMODE [
        /// Controller Mode
        CM OFFSET(0) NUMBITS(2) [
            Idle = 0,
            Device = 2,
            Host = 3
        ]
    ]
];

/// EHCI Capability Registers (read-only)
#[repr(C)]
pub struct EhciCapRegs {
    /// Capability Register Length and Interface Version
    pub caplength_hciversion: ReadOnly<u32, CAPLENGTH_HCIVERSION::Register>,
    /// Structural Parameters (port counts; owned by the root hub layer)
    pub hcsparams: ReadOnly<u32>,
    /// Capability Parameters
    pub hccparams: ReadOnly<u32, HCCPARAMS::Register>,
}

/// EHCI Operational Registers
///
/// The PORTSC file at 0x44 belongs to the root hub collaborator and is left
/// as reserved space here.
#[repr(C)]
pub struct EhciOpRegs {
    /// USB Command
    pub usbcmd: ReadWrite<u32, USBCMD::Register>,
    /// USB Status
    pub usbsts: ReadWrite<u32, USBSTS::Register>,
    /// USB Interrupt Enable
    pub usbintr: ReadWrite<u32, USBINTR::Register>,
    /// USB Frame Index
    pub frindex: ReadWrite<u32>,
    /// 4G Segment Selector
    pub ctrldssegment: ReadWrite<u32>,
    /// Periodic Frame List Base Address
    pub periodiclistbase: ReadWrite<u32>,
    /// Current Asynchronous List Address
    pub asynclistaddr: ReadWrite<u32>,
    _reserved: [u32; 9],
    /// Configure Flag Register
    pub configflag: ReadWrite<u32, CONFIGFLAG::Register>,
    _reserved_portsc: [u32; 9],
    /// USB Mode (i.MX-style controllers; reserved elsewhere)
    pub usbmode: ReadWrite<u32, USBMODE::Register>,
}

/// USBCMD register offset
pub const OP_USBCMD: usize = 0x00;
/// USBSTS register offset
pub const OP_USBSTS: usize = 0x04;
/// USBINTR register offset
pub const OP_USBINTR: usize = 0x08;
/// CTRLDSSEGMENT register offset
pub const OP_CTRLDSSEGMENT: usize = 0x10;
/// PERIODICLISTBASE register offset
pub const OP_PERIODICLISTBASE: usize = 0x14;
/// ASYNCLISTADDR register offset
pub const OP_ASYNCLISTADDR: usize = 0x18;
/// CONFIGFLAG register offset
pub const OP_CONFIGFLAG: usize = 0x40;
/// USBMODE register offset (i.MX-style controllers)
pub const OP_USBMODE: usize = 0x68;
