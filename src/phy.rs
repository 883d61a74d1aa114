//! Per-transceiver PHY state: channel programming, transmit scheduling and
//! frame read-out. The driver owns one [`TrxPhy`] per transceiver; the
//! operations that touch the bus live on the driver state so they can reach
//! the SPI queue.

use crate::{
    hal::{SpiHw, SpiQueueError},
    regs::*,
    rf215::{Inner, PibResult, Rf215Pib, SpiTag, TxResult, TxState},
    MAX_PSDU_LEN,
};

/// Frequency band the sub-GHz transceiver is configured for. Channel
/// frequencies are `ccf0 + channel * spacing`; the RF215 channel registers
/// work in 25 kHz steps.
#[derive(Clone, Debug)]
pub struct PhyBandConfig {
    /// Channel 0 center frequency in Hz.
    pub ccf0_hz: u32,
    /// Channel spacing in Hz.
    pub channel_spacing_hz: u32,
    pub channel_min: u16,
    pub channel_max: u16,
}

impl PhyBandConfig {
    pub fn contains(&self, channel: u16) -> bool {
        (self.channel_min..=self.channel_max).contains(&channel)
    }
}

/// TX/RX counters, readable through the PHY statistics PIBs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PhyStats {
    pub tx_total: u32,
    pub tx_err_busy: u32,
    pub rx_total: u32,
    pub rx_err: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PhyState {
    /// Not configured yet (pre chip reset).
    Off,
    /// In RX state, no frame in the air.
    Listen,
    /// Frame reception started (RXFS seen).
    Rx,
    /// Transmitting.
    Tx,
    Sleep,
}

pub(crate) struct TrxPhy {
    pub(crate) band: PhyBandConfig,
    pub(crate) channel_num: u16,
    pub(crate) cca_ed_threshold: i8,
    pub(crate) state: PhyState,
    /// Counter capture of the SPI transfer that read the RXFS status.
    pub(crate) rx_time: u64,
    pub(crate) rx_psdu_len: u16,
    /// TX buffer currently on the air.
    pub(crate) tx_in_progress: Option<u8>,
    pub(crate) stats: PhyStats,
}

impl TrxPhy {
    pub(crate) fn new(band: PhyBandConfig, channel_num: u16) -> Self {
        Self {
            band,
            channel_num,
            cca_ed_threshold: -85,
            state: PhyState::Off,
            rx_time: 0,
            rx_psdu_len: 0,
            tx_in_progress: None,
            stats: PhyStats::default(),
        }
    }

    pub(crate) fn channel_freq_hz(&self) -> u32 {
        self.band.ccf0_hz + self.band.channel_spacing_hz * self.channel_num as u32
    }

    /// `RFn_CS..RFn_CNM` register block for the configured channel.
    /// CNM is written last and latches the whole block.
    pub(crate) fn channel_regs(&self) -> [u8; 5] {
        let cs = (self.band.channel_spacing_hz / 25_000) as u8;
        let ccf0 = ((self.band.ccf0_hz / 25_000) as u16).to_le_bytes();
        let cn = self.channel_num.to_le_bytes();
        [cs, ccf0[0], ccf0[1], cn[0], cn[1] & 0x01]
    }

    /// PHY-level PIB reads. Driver-level attributes are handled before we
    /// get here.
    pub(crate) fn pib_get(&self, attr: Rf215Pib, data: &mut [u8]) -> PibResult {
        match attr {
            Rf215Pib::PhyChannelNum => data[..2].copy_from_slice(&self.channel_num.to_le_bytes()),
            Rf215Pib::PhyChannelFreqHz => {
                data[..4].copy_from_slice(&self.channel_freq_hz().to_le_bytes())
            }
            Rf215Pib::PhyCcaEdThreshold => data[0] = self.cca_ed_threshold as u8,
            Rf215Pib::PhyStatsTxTotal => data[..4].copy_from_slice(&self.stats.tx_total.to_le_bytes()),
            Rf215Pib::PhyStatsTxErrBusy => {
                data[..4].copy_from_slice(&self.stats.tx_err_busy.to_le_bytes())
            }
            Rf215Pib::PhyStatsRxTotal => data[..4].copy_from_slice(&self.stats.rx_total.to_le_bytes()),
            Rf215Pib::PhyStatsRxErr => data[..4].copy_from_slice(&self.stats.rx_err.to_le_bytes()),
            _ => return PibResult::InvalidParam,
        }
        PibResult::Success
    }
}

impl<'d, H: SpiHw> Inner<'d, H> {
    /// Program a transceiver from scratch: radio and baseband interrupt
    /// masks, analog frontend, channel block, frame-start counter, then
    /// enter RX. Used after the chip reset and to recover from TRXERR.
    pub(crate) fn configure_trx(&mut self, trx: usize) {
        let ch = self.phy[trx].channel_regs();
        let rf = rfn_base(trx);
        let bbc = bbcn_base(trx);
        let (engine, hw, mut slots) = self.split();
        let result = (|| {
            engine.write(hw, &mut slots, rf + RFN_CMD, &[TrxCommand::TrxOff.into_bits()])?;
            engine.write(hw, &mut slots, rf + RFN_IRQM, &[IRQM_DEFAULT])?;
            engine.write(hw, &mut slots, rf + RFN_AUXS, &[AUXS_DEFAULT])?;
            engine.write(hw, &mut slots, rf + RFN_CS, &ch)?;
            engine.write(hw, &mut slots, bbc + BBCN_IRQM, &[BBC_IRQM_DEFAULT])?;
            engine.write(hw, &mut slots, bbc + BBCN_PC, &[PC_DEFAULT])?;
            engine.write(hw, &mut slots, bbc + BBCN_CNTC, &[CNTC_DEFAULT])?;
            engine.write(hw, &mut slots, rf + RFN_CMD, &[TrxCommand::Rx.into_bits()])
        })();
        self.phy[trx].state = PhyState::Listen;
        self.phy[trx].tx_in_progress = None;
        self.check_spi(result);
    }

    /// Retune to another channel within the configured band.
    pub(crate) fn set_channel(&mut self, trx: usize, channel: u16) -> PibResult {
        if !self.phy[trx].band.contains(channel) {
            return PibResult::InvalidParam;
        }
        self.phy[trx].channel_num = channel;
        if self.phy[trx].state == PhyState::Sleep || self.phy[trx].state == PhyState::Off {
            // Applied by the next configure_trx.
            return PibResult::Success;
        }
        let ch = self.phy[trx].channel_regs();
        let rf = rfn_base(trx);
        let (engine, hw, mut slots) = self.split();
        let result = (|| {
            engine.write(hw, &mut slots, rf + RFN_CMD, &[TrxCommand::TrxOff.into_bits()])?;
            engine.write(hw, &mut slots, rf + RFN_CS, &ch)?;
            engine.write(hw, &mut slots, rf + RFN_CMD, &[TrxCommand::Rx.into_bits()])
        })();
        self.phy[trx].state = PhyState::Listen;
        self.check_spi(result);
        PibResult::Success
    }

    pub(crate) fn trx_sleep(&mut self, trx: usize, sleep: bool) -> PibResult {
        let rf = rfn_base(trx);
        if sleep {
            if self.phy[trx].state == PhyState::Sleep {
                return PibResult::Success;
            }
            self.abort_tx_in_progress(trx, TxResult::Aborted);
            self.phy[trx].state = PhyState::Sleep;
            let (engine, hw, mut slots) = self.split();
            let result = (|| {
                engine.write(hw, &mut slots, rf + RFN_CMD, &[TrxCommand::TrxOff.into_bits()])?;
                engine.write(hw, &mut slots, rf + RFN_CMD, &[TrxCommand::Sleep.into_bits()])
            })();
            self.check_spi(result);
        } else if self.phy[trx].state == PhyState::Sleep {
            // TRXOFF starts the wake; the WAKEUP interrupt that follows
            // reprograms the core, which loses its configuration in sleep.
            self.phy[trx].state = PhyState::Off;
            let (engine, hw, mut slots) = self.split();
            let result = engine.write(hw, &mut slots, rf + RFN_CMD, &[TrxCommand::TrxOff.into_bits()]);
            self.check_spi(result);
        }
        PibResult::Success
    }

    /// Kick a prepared TX buffer onto the air: frame length registers, frame
    /// buffer load, then TXPREP and TX commands. The TX command transfer is
    /// tagged so its capture timestamp becomes the frame start time.
    pub(crate) fn start_tx(&mut self, buf_idx: usize) -> TxResult {
        let trx = self.tx_bufs[buf_idx].trx as usize;
        match self.phy[trx].state {
            PhyState::Tx => {
                self.phy[trx].stats.tx_err_busy += 1;
                return TxResult::BusyTx;
            }
            PhyState::Rx => {
                self.phy[trx].stats.tx_err_busy += 1;
                return TxResult::BusyRx;
            }
            PhyState::Off | PhyState::Sleep => return TxResult::Error,
            PhyState::Listen => {}
        }

        let len = self.tx_bufs[buf_idx].len;
        self.tx_bufs[buf_idx].state = TxState::Transmitting;
        self.phy[trx].state = PhyState::Tx;
        self.phy[trx].tx_in_progress = Some(buf_idx as u8);

        let fll = [(len & 0xFF) as u8, (len >> 8) as u8];
        let rf = rfn_base(trx);
        let bbc = bbcn_base(trx);
        let buf = buf_idx as u8;
        let (engine, hw, mut slots) = self.split();
        let result: Result<(), SpiQueueError> = (|| {
            engine.write(hw, &mut slots, bbc + BBCN_TXFLL, &fll)?;
            engine.write_slot(hw, &mut slots, fbtxs(trx), len as usize, SpiTag::TxFrame { buf })?;
            engine.write(hw, &mut slots, rf + RFN_CMD, &[TrxCommand::TxPrep.into_bits()])?;
            engine.write_tagged(
                hw,
                &mut slots,
                rf + RFN_CMD,
                &[TrxCommand::Tx.into_bits()],
                SpiTag::TxCommand { buf },
            )
        })();
        if result.is_err() {
            self.phy[trx].state = PhyState::Listen;
            self.phy[trx].tx_in_progress = None;
            self.check_spi(result);
            return TxResult::Error;
        }
        TxResult::Success
    }

    pub(crate) fn baseband_irqs(&mut self, trx: usize, irqs: BasebandIrqs, timestamp: u64) {
        if irqs.rxfs() {
            self.rx_started(trx, timestamp);
        }
        if irqs.txfe() {
            self.tx_finished(trx, timestamp);
        }
        if irqs.rxfe() {
            self.rx_finished(trx);
        }
    }

    fn rx_started(&mut self, trx: usize, timestamp: u64) {
        if self.phy[trx].state == PhyState::Listen {
            self.phy[trx].state = PhyState::Rx;
        }
        self.phy[trx].rx_time = timestamp;
        // Transmissions deferred with cancel-by-rx lose to the incoming frame.
        for buf in self.tx_bufs.iter_mut() {
            if buf.in_use
                && buf.trx as usize == trx
                && buf.state == TxState::Scheduled
                && buf.cancel_by_rx
            {
                buf.state = TxState::Confirmed;
                buf.result = TxResult::AbortedByRx;
            }
        }
    }

    fn tx_finished(&mut self, trx: usize, timestamp: u64) {
        let Some(buf_idx) = self.phy[trx].tx_in_progress.take() else {
            return;
        };
        let buf = &mut self.tx_bufs[buf_idx as usize];
        buf.state = TxState::Confirmed;
        buf.result = TxResult::Success;
        buf.time_end = timestamp;
        self.phy[trx].stats.tx_total += 1;
        self.phy[trx].state = PhyState::Listen;

        // The transceiver parks in TXPREP after the frame end.
        let rf = rfn_base(trx);
        let (engine, hw, mut slots) = self.split();
        let result = engine.write(hw, &mut slots, rf + RFN_CMD, &[TrxCommand::Rx.into_bits()]);
        self.check_spi(result);
    }

    fn rx_finished(&mut self, trx: usize) {
        if self.phy[trx].state != PhyState::Rx {
            return;
        }
        let bbc = bbcn_base(trx);
        let (engine, hw, mut slots) = self.split();
        let result = engine.read(
            hw,
            &mut slots,
            bbc + BBCN_RXFLL,
            2,
            SpiTag::RxFrameLength { trx: trx as u8 },
        );
        self.check_spi(result);
    }

    /// Frame length registers read back after RXFE.
    pub(crate) fn rx_length_done(&mut self, trx: usize) {
        let len = u16::from_le_bytes(self.rx_bufs[trx].len_regs) & 0x07FF;
        if len == 0 || len as usize > MAX_PSDU_LEN {
            warn!("invalid RX frame length {}", len);
            self.phy[trx].stats.rx_err += 1;
            self.phy[trx].state = PhyState::Listen;
            return;
        }
        self.phy[trx].rx_psdu_len = len;
        let (engine, hw, mut slots) = self.split();
        let result = engine.read(
            hw,
            &mut slots,
            fbrxs(trx),
            len as usize,
            SpiTag::RxFrame { trx: trx as u8 },
        );
        self.check_spi(result);
    }

    pub(crate) fn abort_tx_in_progress(&mut self, trx: usize, result: TxResult) {
        if let Some(buf_idx) = self.phy[trx].tx_in_progress.take() {
            let buf = &mut self.tx_bufs[buf_idx as usize];
            buf.state = TxState::Confirmed;
            buf.result = result;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band() -> PhyBandConfig {
        // ETSI 863-870 MHz, 100 kHz spacing.
        PhyBandConfig {
            ccf0_hz: 863_100_000,
            channel_spacing_hz: 100_000,
            channel_min: 0,
            channel_max: 68,
        }
    }

    #[test]
    fn channel_frequency() {
        let phy = TrxPhy::new(band(), 10);
        assert_eq!(phy.channel_freq_hz(), 864_100_000);
    }

    #[test]
    fn channel_registers_in_25khz_steps() {
        let phy = TrxPhy::new(band(), 3);
        let regs = phy.channel_regs();
        assert_eq!(regs[0], 4); // 100 kHz / 25 kHz
        assert_eq!(u16::from_le_bytes([regs[1], regs[2]]), 34_524); // 863.1 MHz / 25 kHz
        assert_eq!(regs[3], 3);
        assert_eq!(regs[4], 0);
    }

    #[test]
    fn band_bounds() {
        let band = band();
        assert!(band.contains(0));
        assert!(band.contains(68));
        assert!(!band.contains(69));
    }

    #[test]
    fn pib_store_round_trip() {
        let mut phy = TrxPhy::new(band(), 5);
        phy.stats.rx_total = 7;

        let mut data = [0u8; 4];
        assert_eq!(phy.pib_get(Rf215Pib::PhyChannelNum, &mut data), PibResult::Success);
        assert_eq!(u16::from_le_bytes([data[0], data[1]]), 5);
        assert_eq!(phy.pib_get(Rf215Pib::PhyStatsRxTotal, &mut data), PibResult::Success);
        assert_eq!(u32::from_le_bytes(data), 7);
        assert_eq!(phy.pib_get(Rf215Pib::PhyCcaEdThreshold, &mut data), PibResult::Success);
        assert_eq!(data[0] as i8, -85);

        // Driver-level attribute, not ours.
        assert_eq!(phy.pib_get(Rf215Pib::DeviceId, &mut data), PibResult::InvalidParam);
    }
}
