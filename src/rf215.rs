//! RF215 transceiver driver: initialization state machine, interrupt status
//! decode, client handles and the TX buffer pool.
//!
//! The driver owns the SPI transaction engine and all per-transceiver state
//! behind one blocking mutex; `tasks`, the external interrupt entry point and
//! the DMA completion entry point all funnel through that lock. TX confirms
//! are recorded under the lock and dispatched from [`Rf215Driver::tasks`]
//! after it is released, so client callbacks run in thread context. RX
//! indications are dispatched directly from the DMA completion path and are
//! therefore subject to the interrupt-context contract on [`Rf215Events`].

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_time::Duration;
use macro_bits::serializable_enum;

use crate::{
    hal::{DmaChannel, DmaEvent, SpiEngine, SpiHw, SpiQueueError, SpiSlots},
    phy::{PhyBandConfig, PhyState, PhyStats, TrxPhy},
    regs::*,
    DefaultRawMutex, MAX_PSDU_LEN,
};

/// Transceivers on the chip. Only the sub-GHz one is operated; the 2.4 GHz
/// transceiver is put to sleep after reset.
pub const RF215_TRX_COUNT: usize = 2;
pub const TRX_RF09: u8 = 0;
pub const TRX_RF24: u8 = 1;

/// Client slots available through [`Rf215Driver::open`].
pub const RF215_CLIENTS: usize = 4;
/// Concurrent transmissions the driver can hold.
pub const RF215_TX_BUFFERS: usize = 4;

/// Both transceivers must report the wake-up interrupt within this window
/// after the reset pulse, otherwise the chip is declared absent.
const INIT_TIMEOUT: Duration = Duration::from_millis(5);

/// Consecutive all-zero IRQ status reads tolerated before the bus is
/// considered wedged (the IRQ pin said otherwise).
const MAX_ZERO_IRQ_READS: u8 = 3;

/// Driver version reported through [`Rf215Pib::FwVersion`].
const FW_VERSION: [u8; 3] = [2, 1, 0];
/// Device identifier reported through [`Rf215Pib::DeviceId`].
const DEVICE_ID: u16 = 0x0215;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Rf215Status {
    Uninitialized,
    /// Waiting for the chip reset event.
    Busy,
    Ready,
    /// Fatal; requires a new driver instance or a device reset PIB write.
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxResult {
    Success,
    InvalidHandle,
    InvalidParam,
    FullBuffers,
    BusyTx,
    BusyRx,
    Cancelled,
    Aborted,
    AbortedByRx,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PibResult {
    Success,
    InvalidParam,
    InvalidHandle,
    ReadOnly,
    WriteOnly,
    Denied,
    Error,
}

serializable_enum! {
    /// PIB attributes exposed by the driver. Driver-level attributes live in
    /// the 0x00xx range, transceiver controls at 0x008x, PHY attributes at
    /// 0x01xx.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum Rf215Pib: u16 {
        DeviceId => 0x0000,
        FwVersion => 0x0001,
        DeviceReset => 0x0002,
        TrxReset => 0x0080,
        TrxSleep => 0x0081,
        PhyChannelNum => 0x0120,
        PhyChannelFreqHz => 0x0121,
        PhyCcaEdThreshold => 0x0140,
        PhyStatsReset => 0x01C0,
        PhyStatsTxTotal => 0x01C1,
        PhyStatsTxErrBusy => 0x01C2,
        PhyStatsRxTotal => 0x01C3,
        PhyStatsRxErr => 0x01C4
    }
}

/// Client handle: pool index in the low half, allocation token in the high
/// half so a handle kept across a close cannot alias the reused slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Rf215Handle(u32);

/// In-flight transmission handle, same index + token scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Rf215TxHandle(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxTimeMode {
    /// Transmit as soon as the transceiver is free.
    Immediate,
    /// Transmit once the microsecond counter reaches this value.
    Absolute(u64),
}

pub struct TxRequest<'a> {
    pub psdu: &'a [u8],
    pub time_mode: TxTimeMode,
    /// Drop this transmission if a frame reception starts before it goes out.
    pub cancel_by_rx: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxConfirm {
    pub result: TxResult,
    /// Counter capture at the TX trigger command.
    pub time_ini: u64,
    /// Counter capture at the frame-end interrupt read.
    pub time_end: u64,
}

pub struct RxIndication<'a> {
    pub psdu: &'a [u8],
    /// Counter capture at the frame-start interrupt read.
    pub time_ini: u64,
}

/// Per-client event sink, registered at [`Rf215Driver::open`].
pub trait Rf215Events {
    /// Every received frame on the client's transceiver is broadcast to all
    /// clients opened on it. Runs with the driver lock held, potentially in
    /// interrupt context; do not call back into the driver from here.
    fn rx_indication(&self, ind: &RxIndication<'_>);
    /// Delivered from [`Rf215Driver::tasks`], outside the driver lock.
    fn tx_confirm(&self, tx: Rf215TxHandle, cfm: &TxConfirm);
}

/// Driver status notifications (ready / error), delivered from `tasks`.
pub trait Rf215StatusSink {
    fn on_status(&self, status: Rf215Status);
}

pub struct Rf215Config {
    pub band: PhyBandConfig,
    pub channel_num: u16,
}

/// Routing tag attached to every queued SPI transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SpiTag {
    None,
    IrqStatus,
    PartNumber,
    RxFrameLength { trx: u8 },
    RxFrame { trx: u8 },
    TxFrame { buf: u8 },
    TxCommand { buf: u8 },
}

struct ClientSlot<'d> {
    in_use: bool,
    trx: u8,
    token: u16,
    sink: Option<&'d dyn Rf215Events>,
}

impl<'d> ClientSlot<'d> {
    const EMPTY: ClientSlot<'d> = ClientSlot {
        in_use: false,
        trx: 0,
        token: 0,
        sink: None,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TxState {
    /// Waiting for its programmed time.
    Scheduled,
    Transmitting,
    /// Result produced, confirm not yet delivered.
    Confirmed,
}

pub(crate) struct TxBuffer {
    pub(crate) in_use: bool,
    pub(crate) state: TxState,
    pub(crate) client: u8,
    pub(crate) token: u16,
    pub(crate) trx: u8,
    pub(crate) len: u16,
    pub(crate) time: u64,
    pub(crate) cancel_by_rx: bool,
    pub(crate) result: TxResult,
    pub(crate) time_ini: u64,
    pub(crate) time_end: u64,
    pub(crate) psdu: [u8; MAX_PSDU_LEN],
}

impl TxBuffer {
    fn idle() -> Self {
        Self {
            in_use: false,
            state: TxState::Scheduled,
            client: 0,
            token: 0,
            trx: 0,
            len: 0,
            time: 0,
            cancel_by_rx: false,
            result: TxResult::Success,
            time_ini: 0,
            time_end: 0,
            psdu: [0; MAX_PSDU_LEN],
        }
    }
}

pub(crate) struct RxBuffer {
    pub(crate) len_regs: [u8; 2],
    pub(crate) frame: [u8; MAX_PSDU_LEN],
}

impl RxBuffer {
    fn new() -> Self {
        Self {
            len_regs: [0; 2],
            frame: [0; MAX_PSDU_LEN],
        }
    }
}

/// Buffer view handed to the SPI engine so completions can copy payloads
/// in and out by tag before the next transfer is chained.
pub(crate) struct Slots<'a> {
    irq_regs: &'a mut [u8; 3],
    pn_regs: &'a mut [u8; 2],
    scratch: &'a mut [u8; 4],
    rx_bufs: &'a mut [RxBuffer; RF215_TRX_COUNT],
    tx_bufs: &'a mut [TxBuffer; RF215_TX_BUFFERS],
}

impl SpiSlots<SpiTag> for Slots<'_> {
    fn write_source(&mut self, tag: SpiTag) -> &[u8] {
        match tag {
            SpiTag::TxFrame { buf } => {
                let buf = &self.tx_bufs[buf as usize];
                &buf.psdu[..buf.len as usize]
            }
            _ => &[],
        }
    }

    fn read_dest(&mut self, tag: SpiTag) -> &mut [u8] {
        match tag {
            SpiTag::IrqStatus => &mut self.irq_regs[..],
            SpiTag::PartNumber => &mut self.pn_regs[..],
            SpiTag::RxFrameLength { trx } => &mut self.rx_bufs[trx as usize].len_regs[..],
            SpiTag::RxFrame { trx } => &mut self.rx_bufs[trx as usize].frame[..],
            _ => &mut self.scratch[..],
        }
    }
}

pub(crate) struct Inner<'d, H: SpiHw> {
    pub(crate) hw: H,
    pub(crate) engine: SpiEngine<SpiTag>,
    pub(crate) status: Rf215Status,
    notified_status: Rf215Status,
    /// Hardware reset not yet issued (armed at construction and on device
    /// reset, consumed by the first `tasks` poll).
    reset_pending: bool,
    /// Chip reset event validated (wake-up pattern plus part number).
    reset_seen: bool,
    init_deadline: u64,
    zero_reads: u8,
    irq_regs: [u8; 3],
    pn_regs: [u8; 2],
    scratch: [u8; 4],
    pub(crate) phy: [TrxPhy; RF215_TRX_COUNT],
    pub(crate) rx_bufs: [RxBuffer; RF215_TRX_COUNT],
    pub(crate) tx_bufs: [TxBuffer; RF215_TX_BUFFERS],
    clients: [ClientSlot<'d>; RF215_CLIENTS],
}

type PendingConfirm<'d> = (&'d dyn Rf215Events, Rf215TxHandle, TxConfirm);

impl<'d, H: SpiHw> Inner<'d, H> {
    /// Disjoint borrows for the SPI engine entry points.
    pub(crate) fn split(&mut self) -> (&mut SpiEngine<SpiTag>, &mut H, Slots<'_>) {
        (
            &mut self.engine,
            &mut self.hw,
            Slots {
                irq_regs: &mut self.irq_regs,
                pn_regs: &mut self.pn_regs,
                scratch: &mut self.scratch,
                rx_bufs: &mut self.rx_bufs,
                tx_bufs: &mut self.tx_bufs,
            },
        )
    }

    pub(crate) fn fault(&mut self) {
        if self.status == Rf215Status::Error {
            return;
        }
        self.status = Rf215Status::Error;
        self.engine.shutdown(&mut self.hw);
    }

    pub(crate) fn check_spi(&mut self, result: Result<(), SpiQueueError>) {
        if let Err(err) = result {
            error!("SPI enqueue failed: {:?}", err);
            self.fault();
        }
    }

    fn busy_tasks(&mut self) {
        if self.reset_pending {
            self.reset_pending = false;
            self.init_deadline = self.hw.now() + INIT_TIMEOUT.as_micros();
            self.engine.reset(&mut self.hw);
        } else if !self.reset_seen && self.hw.now() > self.init_deadline {
            error!("no chip reset event within the init timeout");
            self.fault();
        }
    }

    fn enqueue_irq_read(&mut self) {
        let (engine, hw, mut slots) = self.split();
        let result = engine.read(hw, &mut slots, RF09_IRQS, 3, SpiTag::IrqStatus);
        self.check_spi(result);
    }

    fn count_zero_read(&mut self) {
        self.zero_reads += 1;
        if self.zero_reads >= MAX_ZERO_IRQ_READS {
            error!("three consecutive empty IRQ status reads");
            self.fault();
        }
    }

    /// `RF09_IRQS`/`RF24_IRQS`/`BBC0_IRQS` burst read back; `timestamp` is
    /// the capture of that SPI transfer.
    fn irq_status_done(&mut self, timestamp: u64) {
        let [rf09, rf24, bbc0] = self.irq_regs;
        trace!("IRQS {:#x} {:#x} {:#x}", rf09, rf24, bbc0);

        // Reserved bits read as zero on a healthy bus, before and after the
        // chip reset.
        if (rf09 | rf24) & IRQS_RESERVED_MASK != 0 {
            error!("reserved IRQ status bits set: {:#x} {:#x}", rf09, rf24);
            self.fault();
            return;
        }

        if !self.reset_seen {
            // Before the chip reset has been observed the only acceptable
            // non-zero pattern is both transceivers waking simultaneously.
            if rf09 == IRQS_WAKEUP && rf24 == IRQS_WAKEUP && bbc0 == 0 {
                self.zero_reads = 0;
                let (engine, hw, mut slots) = self.split();
                let result = engine.read(hw, &mut slots, RF_PN, 2, SpiTag::PartNumber);
                self.check_spi(result);
            } else if rf09 == 0 && rf24 == 0 && bbc0 == 0 {
                self.count_zero_read();
            } else {
                error!(
                    "malformed IRQ status before chip reset: {:#x} {:#x} {:#x}",
                    rf09, rf24, bbc0
                );
                self.fault();
            }
            return;
        }

        if rf09 == 0 && rf24 == 0 && bbc0 == 0 {
            self.count_zero_read();
            return;
        }
        self.zero_reads = 0;

        let radio = RadioIrqs::from_bits(rf09);
        if radio.wakeup() {
            let trx = TRX_RF09 as usize;
            if self.phy[trx].state == PhyState::Sleep {
                // Spurious wake while parked; put the transceiver back.
                let (engine, hw, mut slots) = self.split();
                let result = engine.write(
                    hw,
                    &mut slots,
                    rfn_base(trx) + RFN_CMD,
                    &[TrxCommand::Sleep.into_bits()],
                );
                self.check_spi(result);
            } else {
                // The core lost its configuration, either leaving sleep or
                // through an unexpected reset; reprogram it from scratch.
                warn!("transceiver wake-up, reconfiguring");
                self.abort_tx_in_progress(trx, TxResult::Aborted);
                self.configure_trx(trx);
            }
            return;
        }
        if radio.trxerr() {
            warn!("transceiver error reported, reprogramming");
            self.abort_tx_in_progress(TRX_RF09 as usize, TxResult::Aborted);
            self.configure_trx(TRX_RF09 as usize);
            return;
        }
        self.baseband_irqs(TRX_RF09 as usize, BasebandIrqs::from_bits(bbc0), timestamp);
    }

    fn part_number_done(&mut self) {
        let [pn, vn] = self.pn_regs;
        if pn != PN_AT86RF215 || !(vn == VN_V1 || vn == VN_V3) {
            error!("unexpected part/version number: {:#x} {:#x}", pn, vn);
            self.fault();
            return;
        }
        debug!("AT86RF215 v{} detected", vn);
        self.reset_seen = true;

        // One-time chip setup: clock output off, unused 2.4 GHz transceiver
        // to sleep, then full sub-GHz configuration.
        let (engine, hw, mut slots) = self.split();
        let result = (|| {
            engine.write(hw, &mut slots, RF_CLKO, &[CLKO_OFF])?;
            engine.write(
                hw,
                &mut slots,
                rfn_base(TRX_RF24 as usize) + RFN_CMD,
                &[TrxCommand::Sleep.into_bits()],
            )
        })();
        self.phy[TRX_RF24 as usize].state = PhyState::Sleep;
        self.check_spi(result);
        self.configure_trx(TRX_RF09 as usize);
        if self.status != Rf215Status::Error {
            self.status = Rf215Status::Ready;
            info!("RF215 ready");
        }
    }

    /// Completed RX frame read: count it and broadcast to every client
    /// opened on this transceiver.
    fn rx_frame_done(&mut self, trx: usize) {
        let len = self.phy[trx].rx_psdu_len as usize;
        self.phy[trx].stats.rx_total += 1;
        self.phy[trx].state = PhyState::Listen;

        let ind = RxIndication {
            psdu: &self.rx_bufs[trx].frame[..len],
            time_ini: self.phy[trx].rx_time,
        };
        for client in self.clients.iter() {
            if client.in_use && client.trx as usize == trx {
                if let Some(sink) = client.sink {
                    sink.rx_indication(&ind);
                }
            }
        }
    }

    fn tx_command_done(&mut self, buf: usize, timestamp: u64) {
        if self.tx_bufs[buf].in_use {
            self.tx_bufs[buf].time_ini = timestamp;
        }
    }

    fn spi_done(&mut self, tag: SpiTag, timestamp: u64, failed: bool) {
        if failed {
            error!("SPI bus failure");
            self.fault();
            return;
        }
        match tag {
            SpiTag::None | SpiTag::TxFrame { .. } => {}
            SpiTag::IrqStatus => self.irq_status_done(timestamp),
            SpiTag::PartNumber => self.part_number_done(),
            SpiTag::RxFrameLength { trx } => self.rx_length_done(trx as usize),
            SpiTag::RxFrame { trx } => self.rx_frame_done(trx as usize),
            SpiTag::TxCommand { buf } => self.tx_command_done(buf as usize, timestamp),
        }
    }

    fn client_index(&self, handle: Rf215Handle) -> Option<usize> {
        let idx = (handle.0 & 0xFFFF) as usize;
        let token = (handle.0 >> 16) as u16;
        let slot = self.clients.get(idx)?;
        (slot.in_use && slot.token == token).then_some(idx)
    }

    fn tx_buffer_index(&self, handle: Rf215TxHandle) -> Option<usize> {
        let idx = (handle.0 & 0xFFFF) as usize;
        let token = (handle.0 >> 16) as u16;
        let buf = self.tx_bufs.get(idx)?;
        (buf.in_use && buf.token == token).then_some(idx)
    }

    /// Start scheduled transmissions whose time has come, leading by the
    /// SPI backlog (roughly one microsecond per queued byte).
    fn start_due_transmissions(&mut self) {
        let lead = self.engine.queue_size() as u64;
        let now = self.hw.now();
        for idx in 0..RF215_TX_BUFFERS {
            let buf = &self.tx_bufs[idx];
            if buf.in_use && buf.state == TxState::Scheduled && buf.time <= now + lead {
                let result = self.start_tx(idx);
                if result != TxResult::Success {
                    // Client is not in the call stack; report via confirm.
                    let buf = &mut self.tx_bufs[idx];
                    buf.state = TxState::Confirmed;
                    buf.result = result;
                }
            }
        }
    }

    /// Check-and-clear of pending confirms, under the driver lock. Buffers
    /// are released here; dispatch happens after the lock is dropped.
    fn collect_confirms(&mut self, out: &mut [Option<PendingConfirm<'d>>; RF215_TX_BUFFERS]) {
        for (idx, slot) in out.iter_mut().enumerate() {
            let buf = &mut self.tx_bufs[idx];
            if !buf.in_use || buf.state != TxState::Confirmed {
                continue;
            }
            buf.in_use = false;
            let cfm = TxConfirm {
                result: buf.result,
                time_ini: buf.time_ini,
                time_end: buf.time_end,
            };
            let handle = Rf215TxHandle(((buf.token as u32) << 16) | idx as u32);
            let client = &self.clients[buf.client as usize];
            if client.in_use {
                if let Some(sink) = client.sink {
                    *slot = Some((sink, handle, cfm));
                }
            }
        }
    }

    /// Full device reset through the PIB path: flush in-flight transmissions
    /// with aborted confirms and rerun the init sequence.
    fn device_reset(&mut self) {
        warn!("device reset requested");
        for buf in self.tx_bufs.iter_mut() {
            if buf.in_use && buf.state != TxState::Confirmed {
                buf.state = TxState::Confirmed;
                buf.result = TxResult::Aborted;
            }
        }
        for phy in self.phy.iter_mut() {
            phy.state = PhyState::Off;
            phy.tx_in_progress = None;
        }
        self.reset_pending = true;
        self.reset_seen = false;
        self.zero_reads = 0;
        self.status = Rf215Status::Busy;
    }
}

/// Driver instance. One per RF215 chip; shared by reference between the
/// polling task and the board's interrupt glue.
pub struct Rf215Driver<'d, H: SpiHw> {
    inner: Mutex<DefaultRawMutex, RefCell<Inner<'d, H>>>,
    status_sink: Option<&'d dyn Rf215StatusSink>,
}

impl<'d, H: SpiHw> Rf215Driver<'d, H> {
    /// Takes ownership of the bus. The driver comes up `Busy`; the first
    /// `tasks` poll pulses the hardware reset and arms the init timeout.
    pub fn new(
        hw: H,
        config: Rf215Config,
        status_sink: Option<&'d dyn Rf215StatusSink>,
    ) -> Self {
        let mut status = Rf215Status::Busy;
        if !config.band.contains(config.channel_num) {
            error!("configured channel {} outside the band", config.channel_num);
            status = Rf215Status::Error;
        }
        let inner = Inner {
            hw,
            engine: SpiEngine::new(SpiTag::None),
            status,
            notified_status: Rf215Status::Uninitialized,
            reset_pending: true,
            reset_seen: false,
            init_deadline: 0,
            zero_reads: 0,
            irq_regs: [0; 3],
            pn_regs: [0; 2],
            scratch: [0; 4],
            phy: [
                TrxPhy::new(config.band.clone(), config.channel_num),
                TrxPhy::new(config.band, config.channel_num),
            ],
            rx_bufs: [RxBuffer::new(), RxBuffer::new()],
            tx_bufs: core::array::from_fn(|_| TxBuffer::idle()),
            clients: [ClientSlot::EMPTY; RF215_CLIENTS],
        };
        Self {
            inner: Mutex::new(RefCell::new(inner)),
            status_sink,
        }
    }

    pub fn status(&self) -> Rf215Status {
        self.inner.lock(|cell| cell.borrow().status)
    }

    /// Periodic poll. Drives initialization, starts due scheduled
    /// transmissions and delivers pending TX confirms and status changes.
    pub fn tasks(&self) {
        let mut notify = None;
        let mut confirms: [Option<PendingConfirm<'d>>; RF215_TX_BUFFERS] =
            [None; RF215_TX_BUFFERS];

        self.inner.lock(|cell| {
            let inner = &mut *cell.borrow_mut();
            match inner.status {
                Rf215Status::Busy => {
                    inner.busy_tasks();
                    inner.collect_confirms(&mut confirms);
                }
                Rf215Status::Ready => {
                    inner.start_due_transmissions();
                    inner.collect_confirms(&mut confirms);
                }
                Rf215Status::Uninitialized | Rf215Status::Error => {}
            }
            if inner.status != inner.notified_status {
                inner.notified_status = inner.status;
                notify = Some(inner.status);
            }
        });

        if let Some(status) = notify {
            if let Some(sink) = self.status_sink {
                sink.on_status(status);
            }
        }
        for (sink, handle, cfm) in confirms.iter().flatten() {
            sink.tx_confirm(*handle, cfm);
        }
    }

    /// External interrupt entry point (the chip's IRQ pin). Queues the
    /// three-register IRQ status burst; the decode runs at its completion.
    pub fn radio_irq(&self) {
        self.inner.lock(|cell| {
            let inner = &mut *cell.borrow_mut();
            if inner.reset_pending || inner.status == Rf215Status::Error {
                return;
            }
            inner.enqueue_irq_read();
        });
    }

    /// DMA interrupt entry point; the board glue forwards channel completion
    /// and error events here.
    pub fn dma_event(&self, channel: DmaChannel, event: DmaEvent) {
        self.inner.lock(|cell| {
            let inner = &mut *cell.borrow_mut();
            let done = {
                let (engine, hw, mut slots) = inner.split();
                engine.dma_event(hw, &mut slots, channel, event)
            };
            if let Some(done) = done {
                inner.spi_done(done.tag, done.timestamp, done.result.is_err());
            }
        });
    }

    /// Open a client on a transceiver. Fails when the transceiver is not
    /// operable, the driver is not ready or all client slots are taken.
    pub fn open(&self, trx: u8, sink: &'d dyn Rf215Events) -> Option<Rf215Handle> {
        if trx != TRX_RF09 {
            return None;
        }
        self.inner.lock(|cell| {
            let inner = &mut *cell.borrow_mut();
            if inner.status != Rf215Status::Ready {
                return None;
            }
            let idx = inner.clients.iter().position(|c| !c.in_use)?;
            let slot = &mut inner.clients[idx];
            slot.in_use = true;
            slot.trx = trx;
            slot.token = slot.token.wrapping_add(1);
            slot.sink = Some(sink);
            Some(Rf215Handle(((slot.token as u32) << 16) | idx as u32))
        })
    }

    pub fn close(&self, handle: Rf215Handle) -> bool {
        self.inner.lock(|cell| {
            let inner = &mut *cell.borrow_mut();
            let Some(idx) = inner.client_index(handle) else {
                return false;
            };
            inner.clients[idx].in_use = false;
            inner.clients[idx].sink = None;
            true
        })
    }

    /// Queue a transmission. The request parameters and the PSDU are copied
    /// into a driver-owned buffer before this returns.
    pub fn tx_request(
        &self,
        handle: Rf215Handle,
        request: &TxRequest<'_>,
    ) -> Result<Rf215TxHandle, TxResult> {
        self.inner.lock(|cell| {
            let inner = &mut *cell.borrow_mut();
            let Some(client_idx) = inner.client_index(handle) else {
                return Err(TxResult::InvalidHandle);
            };
            if inner.status != Rf215Status::Ready {
                return Err(TxResult::Error);
            }
            if request.psdu.is_empty() || request.psdu.len() > MAX_PSDU_LEN {
                return Err(TxResult::InvalidParam);
            }
            let Some(idx) = inner.tx_bufs.iter().position(|b| !b.in_use) else {
                debug!("TX buffer pool exhausted");
                return Err(TxResult::FullBuffers);
            };

            let trx = inner.clients[client_idx].trx;
            let buf = &mut inner.tx_bufs[idx];
            buf.in_use = true;
            buf.state = TxState::Scheduled;
            buf.client = client_idx as u8;
            buf.token = buf.token.wrapping_add(1);
            buf.trx = trx;
            buf.len = request.psdu.len() as u16;
            buf.cancel_by_rx = request.cancel_by_rx;
            buf.time_ini = 0;
            buf.time_end = 0;
            buf.psdu[..request.psdu.len()].copy_from_slice(request.psdu);
            let tx_handle = Rf215TxHandle(((buf.token as u32) << 16) | idx as u32);

            match request.time_mode {
                TxTimeMode::Absolute(time) => {
                    buf.time = time;
                }
                TxTimeMode::Immediate => {
                    let result = inner.start_tx(idx);
                    if result != TxResult::Success {
                        // Caller gets the error synchronously; free the slot.
                        inner.tx_bufs[idx].in_use = false;
                        return Err(result);
                    }
                }
            }
            Ok(tx_handle)
        })
    }

    /// Best-effort cancel. A no-op once the hardware has produced a result
    /// for this buffer.
    pub fn tx_cancel(&self, handle: Rf215Handle, tx: Rf215TxHandle) {
        self.inner.lock(|cell| {
            let inner = &mut *cell.borrow_mut();
            if inner.client_index(handle).is_none() {
                return;
            }
            let Some(idx) = inner.tx_buffer_index(tx) else {
                return;
            };
            match inner.tx_bufs[idx].state {
                TxState::Confirmed => {}
                TxState::Scheduled => {
                    inner.tx_bufs[idx].state = TxState::Confirmed;
                    inner.tx_bufs[idx].result = TxResult::Cancelled;
                }
                TxState::Transmitting => {
                    let trx = inner.tx_bufs[idx].trx as usize;
                    inner.abort_tx_in_progress(trx, TxResult::Cancelled);
                    inner.phy[trx].state = PhyState::Listen;
                    let (engine, hw, mut slots) = inner.split();
                    let result = engine.write(
                        hw,
                        &mut slots,
                        rfn_base(trx) + RFN_CMD,
                        &[TrxCommand::Rx.into_bits()],
                    );
                    inner.check_spi(result);
                }
            }
        });
    }

    pub fn pib_get(&self, handle: Rf215Handle, attr: Rf215Pib, data: &mut [u8]) -> PibResult {
        self.inner.lock(|cell| {
            let inner = &*cell.borrow();
            let Some(client_idx) = inner.client_index(handle) else {
                return PibResult::InvalidHandle;
            };
            if data.len() < Self::pib_size(attr) {
                return PibResult::InvalidParam;
            }
            let trx = inner.clients[client_idx].trx as usize;
            match attr {
                Rf215Pib::DeviceId => {
                    data[..2].copy_from_slice(&DEVICE_ID.to_le_bytes());
                    PibResult::Success
                }
                Rf215Pib::FwVersion => {
                    data[..3].copy_from_slice(&FW_VERSION);
                    PibResult::Success
                }
                Rf215Pib::DeviceReset
                | Rf215Pib::TrxReset
                | Rf215Pib::TrxSleep
                | Rf215Pib::PhyStatsReset => PibResult::WriteOnly,
                _ => inner.phy[trx].pib_get(attr, data),
            }
        })
    }

    pub fn pib_set(&self, handle: Rf215Handle, attr: Rf215Pib, data: &[u8]) -> PibResult {
        self.inner.lock(|cell| {
            let inner = &mut *cell.borrow_mut();
            let Some(client_idx) = inner.client_index(handle) else {
                return PibResult::InvalidHandle;
            };
            if data.len() < Self::pib_size(attr) {
                return PibResult::InvalidParam;
            }
            let trx = inner.clients[client_idx].trx as usize;
            match attr {
                Rf215Pib::DeviceReset => {
                    inner.device_reset();
                    PibResult::Success
                }
                Rf215Pib::TrxReset => {
                    inner.abort_tx_in_progress(trx, TxResult::Aborted);
                    inner.configure_trx(trx);
                    PibResult::Success
                }
                Rf215Pib::TrxSleep => inner.trx_sleep(trx, data[0] != 0),
                Rf215Pib::PhyStatsReset => {
                    inner.phy[trx].stats = PhyStats::default();
                    PibResult::Success
                }
                Rf215Pib::PhyChannelNum => {
                    let channel = u16::from_le_bytes([data[0], data[1]]);
                    inner.set_channel(trx, channel)
                }
                Rf215Pib::PhyCcaEdThreshold => {
                    inner.phy[trx].cca_ed_threshold = data[0] as i8;
                    PibResult::Success
                }
                _ => PibResult::ReadOnly,
            }
        })
    }

    /// Size in bytes of a PIB attribute's value.
    pub fn pib_size(attr: Rf215Pib) -> usize {
        match attr {
            Rf215Pib::DeviceId | Rf215Pib::PhyChannelNum => 2,
            Rf215Pib::FwVersion => 3,
            Rf215Pib::PhyChannelFreqHz
            | Rf215Pib::PhyStatsTxTotal
            | Rf215Pib::PhyStatsTxErrBusy
            | Rf215Pib::PhyStatsRxTotal
            | Rf215Pib::PhyStatsRxErr => 4,
            _ => 1,
        }
    }
}
