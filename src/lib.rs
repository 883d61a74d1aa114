//! # `g3-radio-pal`
//! Driver core for G3 hybrid PLC/RF nodes: the AT86RF215 sub-GHz transceiver
//! and the platform abstraction layer for the G3 MAC-RT powerline modem.
//! ## Hardware overview
//! This chapter gives a short overview of the two transceivers and how the
//! driver talks to them.
//!
//! ### RF215 bus access
//! The RF215 hangs off an SPI bus it shares with the PLC modem. Every
//! register or frame-buffer access is a 2-byte command header (access mode
//! plus 14-bit address) followed by the payload, clocked by a pair of DMA
//! channels. The driver serializes all accesses through a fixed pool of
//! transfer descriptors ([hal]); the DMA completion interrupt pops the
//! queue head, copies read data out and chains the next transfer. While a
//! transfer is in flight the PLC modem's interrupt source is masked, which
//! is the cooperative lock on the shared bus.
//!
//! ### RF215 initialization and interrupts
//! After the reset pin is pulsed, both transceivers raise their wake-up
//! interrupt simultaneously; that pattern (and a part-number read) is the
//! only accepted proof that the chip came out of reset. From then on the
//! board's external interrupt handler calls [Rf215Driver::radio_irq], which
//! queues a burst read of the three interrupt status registers and decodes
//! it on completion: frame start/end events drive the receive read-out and
//! the TX confirm path. Clients attach to a transceiver through
//! [Rf215Driver::open] and get every received frame fanned out to them.
//!
//! ### PLC MAC-RT modem
//! The powerline modem runs the G3 MAC real-time layer in firmware and is
//! driven through a vendor chip driver hidden behind the
//! [pal_plc::MacRtModem] trait. The PAL's job is surviving modem resets: it
//! mirrors every MIB write into a host-side snapshot and pushes the snapshot
//! back after a reinitialization, so chip exceptions stay invisible to the
//! upper MAC layer.

#![cfg_attr(not(test), no_std)]
pub(crate) mod fmt;

mod hal;
mod mib;
mod pal_plc;
mod phy;
mod regs;
mod rf215;

pub use hal::{DmaChannel, DmaEvent, SpiError, SpiHw, SpiQueueError};
pub use mib::{MacRtPib, MacRtPibObj, MacRtStatus, MibBackup, MAC_RT_PIB_MAX_VALUE_LENGTH, MIB_BACKUP_SIZE};
pub use pal_plc::*;
pub use phy::{PhyBandConfig, PhyStats};
pub use rf215::*;

/// Largest PSDU the sub-GHz transceiver can carry (FSK/OFDM frame buffer).
pub const MAX_PSDU_LEN: usize = 2047;

#[cfg(not(feature = "critical_section"))]
type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(feature = "critical_section")]
type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
