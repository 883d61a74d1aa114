//! AT86RF215 register map and bit definitions.
//!
//! Only the registers the driver actually touches are listed. Addresses are
//! 14 bits wide; the two most significant bits of the SPI command word select
//! the access mode.

use bitfield_struct::bitfield;
use macro_bits::serializable_enum;

/// SPI command word. MODE[1:0] = COMMAND[15:14], ADDRESS[13:0] = COMMAND[13:0].
#[bitfield(u16)]
pub struct SpiCommand {
    #[bits(14)]
    pub addr: u16,
    #[bits(2)]
    pub mode: u8,
}

pub const SPI_MODE_READ: u8 = 0b00;
pub const SPI_MODE_WRITE: u8 = 0b10;

// Common register block.
pub const RF09_IRQS: u16 = 0x0000;
pub const RF24_IRQS: u16 = 0x0001;
pub const BBC0_IRQS: u16 = 0x0002;
pub const BBC1_IRQS: u16 = 0x0003;
pub const RF_CLKO: u16 = 0x0007;
pub const RF_PN: u16 = 0x000D;
pub const RF_VN: u16 = 0x000E;

// Per-transceiver register blocks (RF09 at 0x100, RF24 at 0x200).
pub const RF09_BASE: u16 = 0x0100;
pub const RF24_BASE: u16 = 0x0200;
pub const RFN_IRQM: u16 = 0x0000;
pub const RFN_AUXS: u16 = 0x0001;
pub const RFN_STATE: u16 = 0x0002;
pub const RFN_CMD: u16 = 0x0003;
pub const RFN_CS: u16 = 0x0004;
pub const RFN_CCF0L: u16 = 0x0005;
pub const RFN_CNL: u16 = 0x0007;

// Baseband core register blocks (BBC0 at 0x300, BBC1 at 0x400).
pub const BBC0_BASE: u16 = 0x0300;
pub const BBC1_BASE: u16 = 0x0400;
pub const BBCN_IRQM: u16 = 0x0000;
pub const BBCN_PC: u16 = 0x0001;
pub const BBCN_RXFLL: u16 = 0x0004;
pub const BBCN_TXFLL: u16 = 0x0006;
pub const BBCN_CNTC: u16 = 0x0090;

// Frame buffers.
pub const BBC0_FBRXS: u16 = 0x2000;
pub const BBC0_FBTXS: u16 = 0x2800;
pub const BBC1_FBRXS: u16 = 0x3000;
pub const BBC1_FBTXS: u16 = 0x3800;

/// Device part number read from `RF_PN`.
pub const PN_AT86RF215: u8 = 0x34;
/// Device version numbers read from `RF_VN`.
pub const VN_V1: u8 = 0x01;
pub const VN_V3: u8 = 0x03;

/// `RFn_IRQS` with only the WAKEUP bit set.
pub const IRQS_WAKEUP: u8 = 0x01;
/// Reserved bits 7:6 of `RFn_IRQS`, always read as zero.
pub const IRQS_RESERVED_MASK: u8 = 0xC0;

/// Radio IRQ status (`RFn_IRQS`). Bits 7:6 are reserved and always read zero.
#[bitfield(u8)]
pub struct RadioIrqs {
    pub wakeup: bool,
    pub trxrdy: bool,
    pub edc: bool,
    pub batlow: bool,
    pub trxerr: bool,
    pub iqifsf: bool,
    #[bits(2)]
    pub reserved: u8,
}

/// Baseband IRQ status (`BBCn_IRQS`).
#[bitfield(u8)]
pub struct BasebandIrqs {
    pub rxfs: bool,
    pub rxfe: bool,
    pub rxam: bool,
    pub rxem: bool,
    pub txfe: bool,
    pub agch: bool,
    pub agcr: bool,
    pub fbli: bool,
}

serializable_enum! {
    /// Transceiver command written to `RFn_CMD`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum TrxCommand: u8 {
        Nop => 0x00,
        Sleep => 0x01,
        TrxOff => 0x02,
        TxPrep => 0x03,
        Tx => 0x04,
        Rx => 0x05,
        Reset => 0x07
    }
}

/// `RF_CLKO.OS = 0`: clock output disabled, minimum drive strength.
pub const CLKO_OFF: u8 = 0x00;

/// `RFn_IRQM` mask enabling WAKEUP, TRXRDY, EDC and TRXERR interrupts.
pub const IRQM_DEFAULT: u8 = 0x17;

/// `RFn_AUXS`: AVEN=1 (fast state transitions), PAVC=2.4V.
pub const AUXS_DEFAULT: u8 = 0x22;

/// `BBCn_IRQM` mask enabling RXFS, RXFE and TXFE interrupts.
pub const BBC_IRQM_DEFAULT: u8 = 0x13;

/// `BBCn_PC`: FSK baseband, core enabled, FCS appended on TX.
pub const PC_DEFAULT: u8 = 0x15;

/// `BBCn_CNTC`: counter enabled, reset at RX frame start and TX start.
pub const CNTC_DEFAULT: u8 = 0x0B;

/// Register offset of the given transceiver block.
pub const fn rfn_base(trx: usize) -> u16 {
    if trx == 0 {
        RF09_BASE
    } else {
        RF24_BASE
    }
}

/// Register offset of the given baseband core block.
pub const fn bbcn_base(trx: usize) -> u16 {
    if trx == 0 {
        BBC0_BASE
    } else {
        BBC1_BASE
    }
}

/// Start of the TX frame buffer of the given baseband core.
pub const fn fbtxs(trx: usize) -> u16 {
    if trx == 0 {
        BBC0_FBTXS
    } else {
        BBC1_FBTXS
    }
}

/// Start of the RX frame buffer of the given baseband core.
pub const fn fbrxs(trx: usize) -> u16 {
    if trx == 0 {
        BBC0_FBRXS
    } else {
        BBC1_FBRXS
    }
}
