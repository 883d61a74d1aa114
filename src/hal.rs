//! SPI transaction engine.
//!
//! All register and frame-buffer access to the RF215 goes through a single
//! FIFO of transfer descriptors. The head of the queue is the transfer
//! currently being clocked out by the two DMA channels; everything behind it
//! waits for the RX-channel completion interrupt, which pops the head, copies
//! read data out and chains the next transfer. The descriptor pool has fixed
//! capacity and is scanned linearly for a free slot.
//!
//! The engine itself holds no lock. Its owner (the RF215 driver) keeps it
//! inside a `blocking_mutex` together with the rest of the driver state, so
//! every entry point - including the DMA completion handler - runs inside a
//! critical section. Bus arbitration against the PLC modem, which shares the
//! SPI peripheral, is still cooperative: the companion interrupt source is
//! masked for the duration of each transfer via [`SpiHw`].

use crate::regs::{SpiCommand, SPI_MODE_READ, SPI_MODE_WRITE};
use crate::MAX_PSDU_LEN;

/// Size of the command header prepended to every transfer.
pub const SPI_CMD_SIZE: usize = 2;

/// Staging buffer size: command header plus the largest frame-buffer access.
pub const SPI_BUF_SIZE: usize = SPI_CMD_SIZE + MAX_PSDU_LEN;

/// Maximum number of SPI transfers that can be queued.
pub const SPI_TRANSFER_POOL_SIZE: usize = 20;

/// Inline write payload capacity. Register-block writes larger than this are
/// split into multiple transfers; frame writes are sourced from a pool slot
/// instead.
pub const SPI_INLINE_DATA: usize = 8;

/// DMA TX-error retransmissions of one command before the transfer is failed.
const SPI_MAX_RETRIES: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpiMode {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaChannel {
    Tx,
    Rx,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaEvent {
    Complete,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiQueueError {
    /// No free transfer descriptor. The transfer was not enqueued.
    PoolExhausted,
    /// A previous transfer exhausted its DMA retries; the bus is considered
    /// broken until the engine is reset.
    BusFault,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiError {
    /// DMA reported errors on every retransmission attempt.
    DmaFault,
}

/// Access to the SPI peripheral, its two DMA channels and the RF215 board
/// signals. The peripheral is shared with the PLC modem, hence the companion
/// interrupt mask hooks.
///
/// DMA completion and error events are not polled; the board's DMA interrupt
/// handler must forward them to the driver's `dma_event` entry point.
pub trait SpiHw {
    /// True while the SPI peripheral or the RX DMA channel is still busy.
    fn is_busy(&mut self) -> bool;
    /// Assert the RF215 chip select on the shared bus.
    fn select_chip(&mut self);
    /// Program both DMA channels and trigger the transfer. `tx_frame` holds
    /// the command header followed by the write payload; `transfer_len` is
    /// the total number of bytes clocked in each direction.
    ///
    /// Returns the monotonic microsecond counter captured at the trigger
    /// instant. Implementations should read the counter with interrupts
    /// disabled to bound the capture jitter.
    fn start_dma(&mut self, tx_frame: &[u8], transfer_len: usize) -> u64;
    /// The RX DMA buffer of the transfer that just completed.
    fn rx_data(&mut self) -> &[u8];
    /// Abort both DMA channels.
    fn abort_dma(&mut self);
    /// Drive the RF215 reset pin (`true` = held in reset).
    fn set_reset_pin(&mut self, asserted: bool);
    /// Delay for at least the reset pulse width (tRST, min 625 ns).
    fn reset_pulse_delay(&mut self);
    /// Current value of the monotonic microsecond counter.
    fn now(&mut self) -> u64;
    /// Mask the PLC modem interrupt source, returning its previous state.
    fn mask_companion_irq(&mut self) -> bool;
    /// Restore the PLC modem interrupt source.
    fn restore_companion_irq(&mut self, was_enabled: bool);
}

/// Resolves transfer tags to the buffers they read into or write from.
/// Implemented by the driver state so payload copies happen before the next
/// queued transfer is chained.
pub(crate) trait SpiSlots<T> {
    /// Source bytes for a slot-sourced write with this tag.
    fn write_source(&mut self, tag: T) -> &[u8];
    /// Destination for a read with this tag.
    fn read_dest(&mut self, tag: T) -> &mut [u8];
}

/// Write payload location for [`SpiEngine::enqueue`].
pub(crate) enum SpiPayload<'a> {
    /// Read transfer, no payload.
    None,
    /// Payload copied into the descriptor (at most [`SPI_INLINE_DATA`] bytes).
    Inline(&'a [u8]),
    /// Payload resolved through [`SpiSlots::write_source`] at start time.
    Slot,
}

/// A completed transfer, handed back to the driver for tag dispatch.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SpiDone<T> {
    pub tag: T,
    /// Counter value captured when this transfer was triggered.
    pub timestamp: u64,
    pub result: Result<(), SpiError>,
}

struct SpiTransfer<T> {
    in_use: bool,
    mode: SpiMode,
    addr: u16,
    len: u16,
    tag: T,
    inline: [u8; SPI_INLINE_DATA],
    inline_len: u8,
    next: Option<u8>,
    retries: u8,
}

impl<T: Copy> SpiTransfer<T> {
    fn idle(tag: T) -> Self {
        Self {
            in_use: false,
            mode: SpiMode::Read,
            addr: 0,
            len: 0,
            tag,
            inline: [0; SPI_INLINE_DATA],
            inline_len: 0,
            next: None,
            retries: 0,
        }
    }
}

pub(crate) struct SpiEngine<T> {
    pool: [SpiTransfer<T>; SPI_TRANSFER_POOL_SIZE],
    queue_first: Option<u8>,
    queue_last: Option<u8>,
    dma_tx_error: bool,
    bus_fault: bool,
    /// Counter captured when the active transfer was triggered.
    transfer_timestamp: u64,
    /// Companion IRQ state saved by [`Self::lock`].
    lock_companion: Option<bool>,
    idle_tag: T,
    tx_stage: [u8; SPI_BUF_SIZE],
}

impl<T: Copy> SpiEngine<T> {
    pub fn new(idle_tag: T) -> Self {
        Self {
            pool: core::array::from_fn(|_| SpiTransfer::idle(idle_tag)),
            queue_first: None,
            queue_last: None,
            dma_tx_error: false,
            bus_fault: false,
            transfer_timestamp: 0,
            lock_companion: None,
            idle_tag,
            tx_stage: [0; SPI_BUF_SIZE],
        }
    }

    /// Enqueue a register/frame-buffer read. The destination buffer is
    /// resolved through the tag when the transfer completes.
    pub fn read<H: SpiHw, S: SpiSlots<T>>(
        &mut self,
        hw: &mut H,
        slots: &mut S,
        addr: u16,
        len: usize,
        tag: T,
    ) -> Result<(), SpiQueueError> {
        self.enqueue(hw, slots, SpiMode::Read, addr, len, SpiPayload::None, tag)
    }

    /// Enqueue a register write with an inline payload.
    pub fn write<H: SpiHw, S: SpiSlots<T>>(
        &mut self,
        hw: &mut H,
        slots: &mut S,
        addr: u16,
        data: &[u8],
    ) -> Result<(), SpiQueueError> {
        let tag = self.idle_tag;
        self.enqueue(
            hw,
            slots,
            SpiMode::Write,
            addr,
            data.len(),
            SpiPayload::Inline(data),
            tag,
        )
    }

    /// Enqueue a register write whose completion the driver wants to see
    /// (for example the TX trigger command, whose capture timestamp is the
    /// frame start time).
    pub fn write_tagged<H: SpiHw, S: SpiSlots<T>>(
        &mut self,
        hw: &mut H,
        slots: &mut S,
        addr: u16,
        data: &[u8],
        tag: T,
    ) -> Result<(), SpiQueueError> {
        self.enqueue(
            hw,
            slots,
            SpiMode::Write,
            addr,
            data.len(),
            SpiPayload::Inline(data),
            tag,
        )
    }

    /// Enqueue a slot-sourced write (frame buffer loads).
    pub fn write_slot<H: SpiHw, S: SpiSlots<T>>(
        &mut self,
        hw: &mut H,
        slots: &mut S,
        addr: u16,
        len: usize,
        tag: T,
    ) -> Result<(), SpiQueueError> {
        self.enqueue(hw, slots, SpiMode::Write, addr, len, SpiPayload::Slot, tag)
    }

    /// Write only the bytes of a register block that changed since the last
    /// write, updating `old` to the new values. Runs of more than
    /// [`SPI_CMD_SIZE`] unchanged bytes split the access into separate
    /// transfers, since retransmitting them costs more than a fresh header.
    pub fn write_update<H: SpiHw, S: SpiSlots<T>>(
        &mut self,
        hw: &mut H,
        slots: &mut S,
        addr: u16,
        new: &[u8],
        old: &mut [u8],
    ) -> Result<(), SpiQueueError> {
        let mut write_start = 0usize;
        let mut write_len = 0usize;
        let mut same_run = 0usize;

        for idx in 0..new.len() {
            if new[idx] != old[idx] {
                old[idx] = new[idx];

                if same_run > SPI_CMD_SIZE {
                    self.write_chunked(hw, slots, addr + write_start as u16, old, write_start, write_len)?;
                    write_len = 0;
                    same_run = 0;
                }

                if write_len == 0 {
                    write_start = idx;
                }

                write_len += same_run + 1;
                same_run = 0;
            } else if write_len != 0 {
                same_run += 1;
            }
        }

        if write_len != 0 {
            self.write_chunked(hw, slots, addr + write_start as u16, old, write_start, write_len)?;
        }

        Ok(())
    }

    fn write_chunked<H: SpiHw, S: SpiSlots<T>>(
        &mut self,
        hw: &mut H,
        slots: &mut S,
        mut addr: u16,
        data: &[u8],
        mut offset: usize,
        mut len: usize,
    ) -> Result<(), SpiQueueError> {
        while len > 0 {
            let chunk = len.min(SPI_INLINE_DATA);
            let inline = &data[offset..offset + chunk];
            let tag = self.idle_tag;
            self.enqueue(
                hw,
                slots,
                SpiMode::Write,
                addr,
                chunk,
                SpiPayload::Inline(inline),
                tag,
            )?;
            addr += chunk as u16;
            offset += chunk;
            len -= chunk;
        }
        Ok(())
    }

    fn enqueue<H: SpiHw, S: SpiSlots<T>>(
        &mut self,
        hw: &mut H,
        slots: &mut S,
        mode: SpiMode,
        addr: u16,
        len: usize,
        payload: SpiPayload<'_>,
        tag: T,
    ) -> Result<(), SpiQueueError> {
        if self.bus_fault {
            return Err(SpiQueueError::BusFault);
        }

        let Some(idx) = self.pool.iter().position(|t| !t.in_use) else {
            error!("SPI transfer pool exhausted, transfer to {:#x} dropped", addr);
            return Err(SpiQueueError::PoolExhausted);
        };

        let transfer = &mut self.pool[idx];
        transfer.in_use = true;
        transfer.mode = mode;
        transfer.addr = addr;
        transfer.len = len as u16;
        transfer.tag = tag;
        transfer.next = None;
        transfer.retries = 0;
        transfer.inline_len = 0;
        if let SpiPayload::Inline(data) = payload {
            transfer.inline[..data.len()].copy_from_slice(data);
            transfer.inline_len = data.len() as u8;
        }

        let idx = idx as u8;
        match self.queue_last {
            Some(last) => {
                self.pool[last as usize].next = Some(idx);
                self.queue_last = Some(idx);
            }
            None => {
                self.queue_first = Some(idx);
                self.queue_last = Some(idx);
                // Queue was idle; this transfer can start right away.
                self.start_transfer(hw, slots, idx);
            }
        }

        Ok(())
    }

    fn start_transfer<H: SpiHw, S: SpiSlots<T>>(&mut self, hw: &mut H, slots: &mut S, idx: u8) {
        let transfer = &self.pool[idx as usize];
        let mode_bits = match transfer.mode {
            SpiMode::Read => SPI_MODE_READ,
            SpiMode::Write => SPI_MODE_WRITE,
        };
        let cmd = SpiCommand::new()
            .with_addr(transfer.addr)
            .with_mode(mode_bits);
        let len = transfer.len as usize;
        let total = len + SPI_CMD_SIZE;

        self.tx_stage[..SPI_CMD_SIZE].copy_from_slice(&cmd.into_bits().to_be_bytes());
        if transfer.mode == SpiMode::Write {
            let dest = &mut self.tx_stage[SPI_CMD_SIZE..total];
            if transfer.inline_len > 0 {
                dest.copy_from_slice(&transfer.inline[..len]);
            } else {
                dest.copy_from_slice(&slots.write_source(transfer.tag)[..len]);
            }
        } else {
            // Dummy zero bytes clocked out while the chip shifts data in;
            // the staging buffer still holds the previous write payload.
            self.tx_stage[SPI_CMD_SIZE..total].fill(0);
        }

        // Keep the PLC modem off the bus while this transfer is in flight.
        let companion = hw.mask_companion_irq();
        while hw.is_busy() {}
        hw.select_chip();
        self.transfer_timestamp = hw.start_dma(&self.tx_stage[..total], total);
        hw.restore_companion_irq(companion);
    }

    /// DMA completion/error handler. The RX channel completion is
    /// authoritative; a TX channel error only latches a flag and the command
    /// is retransmitted when the RX side finishes. Returns the completed
    /// transfer (with its trigger timestamp) for tag dispatch, after the next
    /// queued transfer has been started.
    pub fn dma_event<H: SpiHw, S: SpiSlots<T>>(
        &mut self,
        hw: &mut H,
        slots: &mut S,
        channel: DmaChannel,
        event: DmaEvent,
    ) -> Option<SpiDone<T>> {
        // Empty queue: events raced with a reset, nothing to do.
        let head = self.queue_first?;

        match (event, channel) {
            (DmaEvent::Error, DmaChannel::Tx) => {
                self.dma_tx_error = true;
                None
            }
            (DmaEvent::Error, DmaChannel::Rx) => self.retry_or_fail(hw, slots, head),
            (DmaEvent::Complete, DmaChannel::Tx) => {
                self.dma_tx_error = false;
                None
            }
            (DmaEvent::Complete, DmaChannel::Rx) => {
                if self.dma_tx_error {
                    self.dma_tx_error = false;
                    return self.retry_or_fail(hw, slots, head);
                }
                self.complete_head(hw, slots, head)
            }
        }
    }

    fn retry_or_fail<H: SpiHw, S: SpiSlots<T>>(
        &mut self,
        hw: &mut H,
        slots: &mut S,
        head: u8,
    ) -> Option<SpiDone<T>> {
        let transfer = &mut self.pool[head as usize];
        if transfer.retries < SPI_MAX_RETRIES {
            transfer.retries += 1;
            debug!(
                "DMA error, retransmitting SPI command (attempt {})",
                transfer.retries
            );
            self.start_transfer(hw, slots, head);
            return None;
        }

        // Persistent DMA failure. Fail the transfer instead of retrying
        // forever; the driver tears the session down from here.
        error!("SPI transfer failed after {} retries", SPI_MAX_RETRIES);
        let tag = self.pool[head as usize].tag;
        let timestamp = self.transfer_timestamp;
        self.bus_fault = true;
        self.drop_queue();
        Some(SpiDone {
            tag,
            timestamp,
            result: Err(SpiError::DmaFault),
        })
    }

    fn complete_head<H: SpiHw, S: SpiSlots<T>>(
        &mut self,
        hw: &mut H,
        slots: &mut S,
        head: u8,
    ) -> Option<SpiDone<T>> {
        let (mode, len, tag) = {
            let t = &self.pool[head as usize];
            (t.mode, t.len as usize, t.tag)
        };

        if mode == SpiMode::Read {
            // Copy out before the next transfer reuses the DMA buffer.
            let rx = hw.rx_data();
            let dest = slots.read_dest(tag);
            let n = len.min(dest.len());
            dest[..n].copy_from_slice(&rx[SPI_CMD_SIZE..SPI_CMD_SIZE + n]);
        }

        let timestamp = self.transfer_timestamp;
        let next = self.pool[head as usize].next;
        self.pool[head as usize].in_use = false;

        self.queue_first = next;
        if next.is_none() {
            self.queue_last = None;
        }

        if let Some(next) = next {
            self.start_transfer(hw, slots, next);
        }

        Some(SpiDone {
            tag,
            timestamp,
            result: Ok(()),
        })
    }

    fn drop_queue(&mut self) {
        for transfer in self.pool.iter_mut() {
            transfer.in_use = false;
            transfer.next = None;
            transfer.retries = 0;
        }
        self.queue_first = None;
        self.queue_last = None;
    }

    /// Abort anything in flight and pulse the chip reset pin. Pending
    /// transfers are dropped without completion.
    pub fn reset<H: SpiHw>(&mut self, hw: &mut H) {
        if self.queue_first.is_some() {
            hw.abort_dma();
        }
        self.drop_queue();
        self.dma_tx_error = false;
        self.bus_fault = false;

        hw.set_reset_pin(true);
        hw.reset_pulse_delay();
        hw.set_reset_pin(false);
    }

    /// Stop the queue and drop pending transfers without touching the chip.
    pub fn shutdown<H: SpiHw>(&mut self, hw: &mut H) {
        if self.queue_first.is_some() {
            hw.abort_dma();
        }
        self.drop_queue();
        hw.set_reset_pin(true);
    }

    /// Coarse bus lock for direct peripheral access outside the queue.
    /// Masks the companion interrupt and reports whether the bus is idle.
    pub fn lock<H: SpiHw>(&mut self, hw: &mut H) -> bool {
        self.lock_companion = Some(hw.mask_companion_irq());
        self.queue_first.is_none() && !hw.is_busy()
    }

    pub fn unlock<H: SpiHw>(&mut self, hw: &mut H) {
        if let Some(was_enabled) = self.lock_companion.take() {
            hw.restore_companion_irq(was_enabled);
        }
    }

    /// Total bytes (headers included) still queued. Used by the PHY to
    /// account for SPI latency when scheduling transmissions.
    pub fn queue_size(&self) -> usize {
        let mut size = 0;
        let mut cursor = self.queue_first;
        while let Some(idx) = cursor {
            let transfer = &self.pool[idx as usize];
            size += transfer.len as usize + SPI_CMD_SIZE;
            cursor = transfer.next;
        }
        size
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue_first.is_none()
    }

    pub fn bus_fault(&self) -> bool {
        self.bus_fault
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum TestTag {
        None,
        Read(u8),
        Frame,
    }

    struct TestSlots {
        dest: [u8; 16],
        frame: [u8; 8],
    }

    impl SpiSlots<TestTag> for TestSlots {
        fn write_source(&mut self, tag: TestTag) -> &[u8] {
            assert_eq!(tag, TestTag::Frame);
            &self.frame
        }
        fn read_dest(&mut self, _tag: TestTag) -> &mut [u8] {
            &mut self.dest
        }
    }

    #[derive(Default)]
    struct MockBus {
        starts: Vec<Vec<u8>>,
        rx: Vec<u8>,
        active: bool,
        aborted: usize,
        reset_pin: bool,
        reset_pulses: usize,
        companion_masked: bool,
        time: u64,
    }

    impl SpiHw for MockBus {
        fn is_busy(&mut self) -> bool {
            false
        }
        fn select_chip(&mut self) {}
        fn start_dma(&mut self, tx_frame: &[u8], transfer_len: usize) -> u64 {
            assert!(!self.active, "second transfer started while one is active");
            assert_eq!(tx_frame.len(), transfer_len);
            self.active = true;
            self.starts.push(tx_frame.to_vec());
            self.time += 10;
            self.time
        }
        fn rx_data(&mut self) -> &[u8] {
            &self.rx
        }
        fn abort_dma(&mut self) {
            self.active = false;
            self.aborted += 1;
        }
        fn set_reset_pin(&mut self, asserted: bool) {
            self.reset_pin = asserted;
        }
        fn reset_pulse_delay(&mut self) {
            self.reset_pulses += 1;
        }
        fn now(&mut self) -> u64 {
            self.time
        }
        fn mask_companion_irq(&mut self) -> bool {
            let was = !self.companion_masked;
            self.companion_masked = true;
            was
        }
        fn restore_companion_irq(&mut self, was_enabled: bool) {
            self.companion_masked = !was_enabled;
        }
    }

    impl MockBus {
        fn finish_transfer<S: SpiSlots<TestTag>>(
            &mut self,
            engine: &mut SpiEngine<TestTag>,
            slots: &mut S,
        ) -> Option<SpiDone<TestTag>> {
            self.active = false;
            engine.dma_event(self, slots, DmaChannel::Tx, DmaEvent::Complete);
            engine.dma_event(self, slots, DmaChannel::Rx, DmaEvent::Complete)
        }
    }

    fn setup() -> (SpiEngine<TestTag>, MockBus, TestSlots) {
        let engine = SpiEngine::new(TestTag::None);
        let bus = MockBus {
            rx: vec![0; SPI_BUF_SIZE],
            ..Default::default()
        };
        let slots = TestSlots {
            dest: [0; 16],
            frame: *b"frame!!!",
        };
        (engine, bus, slots)
    }

    #[test]
    fn command_header_is_mode_and_address() {
        let (mut engine, mut bus, mut slots) = setup();
        engine
            .write(&mut bus, &mut slots, 0x0107, &[0xAB])
            .unwrap();
        // Write mode: COMMAND[15:14] = 0b10.
        assert_eq!(bus.starts[0], vec![0x81, 0x07, 0xAB]);

        bus.finish_transfer(&mut engine, &mut slots);
        engine
            .read(&mut bus, &mut slots, 0x0D, 2, TestTag::Read(0))
            .unwrap();
        assert_eq!(bus.starts[1], vec![0x00, 0x0D, 0x00, 0x00]);
    }

    #[test]
    fn transfers_complete_in_fifo_order() {
        let (mut engine, mut bus, mut slots) = setup();
        for i in 0..5 {
            engine
                .read(&mut bus, &mut slots, 0x100 + i as u16, 1, TestTag::Read(i))
                .unwrap();
        }
        // Only the head may be on the bus.
        assert_eq!(bus.starts.len(), 1);

        for i in 0..5 {
            let done = bus.finish_transfer(&mut engine, &mut slots).unwrap();
            assert_eq!(done.tag, TestTag::Read(i));
            assert!(done.result.is_ok());
        }
        assert!(engine.queue_is_empty());
        assert_eq!(bus.starts.len(), 5);
    }

    #[test]
    fn enqueue_while_active_does_not_start_second_transfer() {
        let (mut engine, mut bus, mut slots) = setup();
        engine
            .read(&mut bus, &mut slots, 0x00, 3, TestTag::Read(0))
            .unwrap();
        engine
            .read(&mut bus, &mut slots, 0x0D, 2, TestTag::Read(1))
            .unwrap();
        assert_eq!(bus.starts.len(), 1);
        bus.finish_transfer(&mut engine, &mut slots);
        assert_eq!(bus.starts.len(), 2);
    }

    #[test]
    fn read_payload_copied_to_slot() {
        let (mut engine, mut bus, mut slots) = setup();
        engine
            .read(&mut bus, &mut slots, 0x00, 3, TestTag::Read(0))
            .unwrap();
        bus.rx[SPI_CMD_SIZE..SPI_CMD_SIZE + 3].copy_from_slice(&[0x01, 0x01, 0x00]);
        bus.finish_transfer(&mut engine, &mut slots);
        assert_eq!(&slots.dest[..3], &[0x01, 0x01, 0x00]);
    }

    #[test]
    fn slot_sourced_write_reads_frame_at_start() {
        let (mut engine, mut bus, mut slots) = setup();
        engine
            .write_slot(&mut bus, &mut slots, 0x2800, 8, TestTag::Frame)
            .unwrap();
        assert_eq!(&bus.starts[0][SPI_CMD_SIZE..], b"frame!!!");
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let (mut engine, mut bus, mut slots) = setup();
        for i in 0..SPI_TRANSFER_POOL_SIZE {
            engine
                .read(&mut bus, &mut slots, i as u16, 1, TestTag::Read(i as u8))
                .unwrap();
        }
        assert_eq!(
            engine.read(&mut bus, &mut slots, 0xFF, 1, TestTag::Read(0xFF)),
            Err(SpiQueueError::PoolExhausted)
        );
        // Draining one slot makes room again.
        bus.finish_transfer(&mut engine, &mut slots);
        assert!(engine
            .read(&mut bus, &mut slots, 0xFF, 1, TestTag::Read(0xFF))
            .is_ok());
    }

    #[test]
    fn tx_dma_error_retransmits_same_command() {
        let (mut engine, mut bus, mut slots) = setup();
        engine
            .read(&mut bus, &mut slots, 0x00, 3, TestTag::Read(0))
            .unwrap();

        engine.dma_event(&mut bus, &mut slots, DmaChannel::Tx, DmaEvent::Error);
        bus.active = false;
        let done = engine.dma_event(&mut bus, &mut slots, DmaChannel::Rx, DmaEvent::Complete);
        assert!(done.is_none());
        // Same command clocked out again.
        assert_eq!(bus.starts.len(), 2);
        assert_eq!(bus.starts[0], bus.starts[1]);

        let done = bus.finish_transfer(&mut engine, &mut slots).unwrap();
        assert!(done.result.is_ok());
    }

    #[test]
    fn persistent_dma_error_fails_after_bounded_retries() {
        let (mut engine, mut bus, mut slots) = setup();
        engine
            .read(&mut bus, &mut slots, 0x00, 3, TestTag::Read(7))
            .unwrap();

        let mut done = None;
        for _ in 0..=SPI_MAX_RETRIES {
            engine.dma_event(&mut bus, &mut slots, DmaChannel::Tx, DmaEvent::Error);
            bus.active = false;
            done = engine.dma_event(&mut bus, &mut slots, DmaChannel::Rx, DmaEvent::Complete);
            if done.is_some() {
                break;
            }
        }
        let done = done.expect("transfer should fail after bounded retries");
        assert_eq!(done.tag, TestTag::Read(7));
        assert_eq!(done.result, Err(SpiError::DmaFault));
        assert!(engine.bus_fault());
        assert_eq!(
            engine.read(&mut bus, &mut slots, 0x00, 1, TestTag::Read(0)),
            Err(SpiQueueError::BusFault)
        );
    }

    #[test]
    fn reset_drops_pending_transfers_and_pulses_pin() {
        let (mut engine, mut bus, mut slots) = setup();
        engine
            .read(&mut bus, &mut slots, 0x00, 3, TestTag::Read(0))
            .unwrap();
        engine
            .read(&mut bus, &mut slots, 0x0D, 2, TestTag::Read(1))
            .unwrap();

        engine.reset(&mut bus);
        assert_eq!(bus.aborted, 1);
        assert_eq!(bus.reset_pulses, 1);
        assert!(!bus.reset_pin);
        assert!(engine.queue_is_empty());

        // Late DMA events for the aborted transfer are ignored.
        assert!(engine
            .dma_event(&mut bus, &mut slots, DmaChannel::Rx, DmaEvent::Complete)
            .is_none());
    }

    #[test]
    fn write_update_skips_unchanged_runs() {
        let (mut engine, mut bus, mut slots) = setup();
        let mut old = [0u8; 8];
        let new = [0xA1, 0, 0, 0, 0, 0, 0, 0xA8];
        engine
            .write_update(&mut bus, &mut slots, 0x300, &new, &mut old)
            .unwrap();
        assert_eq!(old, new);

        // Two separate writes: one for each changed byte, since the gap is
        // longer than a fresh command header.
        bus.finish_transfer(&mut engine, &mut slots);
        bus.finish_transfer(&mut engine, &mut slots);
        assert_eq!(bus.starts.len(), 2);
        assert_eq!(bus.starts[0], vec![0x83, 0x00, 0xA1]);
        assert_eq!(bus.starts[1], vec![0x83, 0x07, 0xA8]);
    }

    #[test]
    fn lock_reports_idle_bus() {
        let (mut engine, mut bus, mut slots) = setup();
        assert!(engine.lock(&mut bus));
        engine.unlock(&mut bus);
        assert!(!bus.companion_masked);

        engine
            .read(&mut bus, &mut slots, 0x00, 1, TestTag::Read(0))
            .unwrap();
        assert!(!engine.lock(&mut bus));
        engine.unlock(&mut bus);
        assert_eq!(engine.queue_size(), 1 + SPI_CMD_SIZE);
    }
}
