//! PLC MAC-RT platform abstraction layer.
//!
//! Sits between the G3 MAC layer and the vendor modem driver (behind
//! [`MacRtModem`]). Its main job is making modem resets invisible: every
//! successful MIB write is mirrored into a host-side [`MibBackup`] snapshot,
//! and after a reinitialization the snapshot is pushed back to the chip.
//! Only the very first initialization pulls the snapshot *from* the chip,
//! gated by the `restart_mib` flag.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use portable_atomic::{AtomicU32, Ordering};

use crate::{
    mib::{MacRtPib, MacRtPibObj, MacRtStatus, MibBackup, MIB_BACKUP_SIZE},
    DefaultRawMutex,
};

/// Largest MAC-RT frame the PAL forwards.
pub const PAL_PLC_MAX_DATA_LEN: usize = 512;

/// PHY parameter index disabling the TX impedance auto-detection.
pub const PHY_PARAM_CFG_AUTODETECT_IMPEDANCE: u16 = 0x010E;
/// PHY parameter index selecting the TX impedance branch.
pub const PHY_PARAM_CFG_IMPEDANCE: u16 = 0x010F;
/// Very low output impedance, the G3 recommendation for mains coupling.
pub const IMPEDANCE_VLO: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PalPlcStatus {
    Uninitialized,
    Busy,
    Ready,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PlcBand {
    CenelecA,
    CenelecB,
    Fcc,
    Arib,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CouplingBranch {
    Main,
    Auxiliary,
}

/// One analog frontend branch: its band, the modem firmware image built for
/// it and the coupling values written as PHY parameters after each init.
#[derive(Clone, Copy)]
pub struct CouplingConfig {
    pub band: PlcBand,
    pub firmware: &'static [u8],
    /// `(parameter index, value)` pairs, applied in order.
    pub phy_params: &'static [(u16, &'static [u8])],
}

#[derive(Clone, Copy)]
pub struct PalPlcConfig {
    /// Band the node operates in; selects the coupling branch.
    pub band: PlcBand,
    pub main: CouplingConfig,
    pub auxiliary: Option<CouplingConfig>,
}

/// Exceptions the modem firmware can raise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MacRtException {
    /// Security key the modem did not expect.
    UnexpectedKey,
    /// The modem restarted on its own.
    Reset,
}

/// RX metadata delivered alongside a data indication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MacRtRxParams {
    pub high_priority: bool,
    pub link_quality: u8,
    pub phase_differential: u8,
}

/// An owned MAC-RT frame, copied out of the modem driver's buffer.
#[derive(Clone)]
pub struct PlcFrame {
    len: u16,
    data: [u8; PAL_PLC_MAX_DATA_LEN],
}

impl PlcFrame {
    pub fn new(frame: &[u8]) -> Self {
        let len = frame.len().min(PAL_PLC_MAX_DATA_LEN);
        let mut data = [0; PAL_PLC_MAX_DATA_LEN];
        data[..len].copy_from_slice(&frame[..len]);
        Self {
            len: len as u16,
            data,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Events produced by the modem driver, drained by [`PalPlc::tasks`].
#[derive(Clone)]
pub enum MacRtEvent {
    InitDone { success: bool },
    TxConfirm {
        status: MacRtStatus,
        update_timestamp: bool,
    },
    DataIndication { frame: PlcFrame },
    CommStatus { frame: PlcFrame },
    RxParamsIndication { params: MacRtRxParams },
    Exception { kind: MacRtException },
}

/// The vendor G3 MAC-RT chip driver. Firmware download, the serial
/// transport and its interrupt handling all live behind this seam; events
/// they produce come back through [`MacRtModem::poll_event`].
pub trait MacRtModem {
    /// Bind a firmware image and start the modem boot. Completion arrives
    /// as [`MacRtEvent::InitDone`].
    fn initialize(&mut self, firmware: &'static [u8]);
    fn open(&mut self) -> bool;
    fn close(&mut self);
    fn pib_get(&mut self, obj: &mut MacRtPibObj) -> MacRtStatus;
    fn pib_set(&mut self, obj: &MacRtPibObj) -> MacRtStatus;
    fn tx_request(&mut self, data: &[u8]);
    fn enable_tx(&mut self, enable: bool);
    /// Grant PAN-coordinator capability to the modem.
    fn set_coordinator(&mut self);
    /// Modem-internal timer in microseconds.
    fn timer_reference(&mut self) -> u32;
    /// Next pending event, if any.
    fn poll_event(&mut self) -> Option<MacRtEvent>;
}

/// Upper-layer callbacks, one method per modem indication. Invoked from
/// [`PalPlc::tasks`] and [`PalPlc::tx_request`], outside the PAL lock.
pub trait PalPlcHandlers {
    fn data_indication(&self, data: &[u8]);
    fn comm_status_indication(&self, data: &[u8]);
    fn tx_confirm(&self, status: MacRtStatus, update_timestamp: bool);
    fn rx_params_indication(&self, params: &MacRtRxParams);
}

struct PalInner<'d, M: MacRtModem> {
    modem: M,
    config: PalPlcConfig,
    status: PalPlcStatus,
    handlers: &'d dyn PalPlcHandlers,
    branch: CouplingBranch,
    mib: MibBackup,
    /// Set: the next init pulls the MIB snapshot from the chip. Clear: the
    /// host snapshot is pushed back (restore).
    restart_mib: bool,
    /// A TX confirm is owed to the upper layer.
    waiting_tx_cfm: bool,
    coordinator: bool,
    /// PVDD monitor verdict; transmission stays disabled outside the window.
    pvdd_tx_enable: bool,
}

enum Dispatch {
    Data(PlcFrame),
    CommStatus(PlcFrame),
    TxConfirm(MacRtStatus, bool),
    RxParams(MacRtRxParams),
}

impl<'d, M: MacRtModem> PalInner<'d, M> {
    fn coupling(&self) -> &CouplingConfig {
        match self.branch {
            CouplingBranch::Main => &self.config.main,
            CouplingBranch::Auxiliary => {
                self.config.auxiliary.as_ref().unwrap_or(&self.config.main)
            }
        }
    }

    fn start_init(&mut self) {
        let band = self.config.band;
        let branch = if self.config.main.band == band {
            Some(CouplingBranch::Main)
        } else if self.config.auxiliary.map(|aux| aux.band) == Some(band) {
            Some(CouplingBranch::Auxiliary)
        } else {
            None
        };
        let Some(branch) = branch else {
            error!("no coupling branch matches the configured band");
            self.status = PalPlcStatus::Error;
            return;
        };
        self.branch = branch;

        let firmware = self.coupling().firmware;
        self.modem.initialize(firmware);
        if !self.modem.open() {
            error!("MAC-RT driver open failed");
            self.status = PalPlcStatus::Error;
            return;
        }
        self.status = PalPlcStatus::Busy;
    }

    fn init_complete(&mut self, success: bool) -> Option<Dispatch> {
        if !success {
            error!("MAC-RT modem initialization failed");
            self.status = PalPlcStatus::Error;
            return None;
        }

        // Coupling values for the selected branch, then a fixed VLO TX
        // impedance with auto-detection off.
        let params = self.coupling().phy_params;
        for (index, value) in params {
            let obj = MacRtPibObj::new(MacRtPib::ManufPhyParam, *index, value);
            if self.modem.pib_set(&obj) != MacRtStatus::Success {
                warn!("coupling parameter {:#x} rejected", *index);
            }
        }
        let _ = self.modem.pib_set(&MacRtPibObj::new(
            MacRtPib::ManufPhyParam,
            PHY_PARAM_CFG_AUTODETECT_IMPEDANCE,
            &[0],
        ));
        let _ = self.modem.pib_set(&MacRtPibObj::new(
            MacRtPib::ManufPhyParam,
            PHY_PARAM_CFG_IMPEDANCE,
            &[IMPEDANCE_VLO],
        ));

        // Coordinator capability does not survive a modem reset.
        if self.coordinator {
            self.modem.set_coordinator();
        }

        if self.restart_mib {
            // First init: no prior host state, learn the chip's defaults.
            let mut obj = MacRtPibObj::new(MacRtPib::GetSetAllMib, 0, &[]);
            obj.length = MIB_BACKUP_SIZE as u8;
            if self.modem.pib_get(&mut obj) == MacRtStatus::Success {
                self.mib = MibBackup::from_bytes(&obj.data[..MIB_BACKUP_SIZE]);
            }
            self.restart_mib = false;
        } else {
            // Reinit: the chip forgot everything, the snapshot has not.
            let snapshot = self.mib.to_bytes();
            let obj = MacRtPibObj::new(MacRtPib::GetSetAllMib, 0, &snapshot);
            if self.modem.pib_set(&obj) != MacRtStatus::Success {
                warn!("MIB restore rejected by the modem");
            }
        }

        self.modem.enable_tx(self.pvdd_tx_enable);
        self.status = PalPlcStatus::Ready;
        info!("PLC MAC-RT ready");

        if self.waiting_tx_cfm {
            self.waiting_tx_cfm = false;
            // The frame that was in flight across the reset is gone.
            return Some(Dispatch::TxConfirm(MacRtStatus::ChannelAccessFailure, true));
        }
        None
    }
}

/// PAL instance. Owns the modem driver; shared by reference between the
/// polling task and anything issuing requests.
pub struct PalPlc<'d, M: MacRtModem> {
    inner: Mutex<DefaultRawMutex, RefCell<PalInner<'d, M>>>,
    unexpected_key_count: AtomicU32,
    reset_count: AtomicU32,
}

impl<'d, M: MacRtModem> PalPlc<'d, M> {
    /// Selects the coupling branch for the configured band, binds that
    /// branch's firmware image and starts the modem boot. Returns with the
    /// PAL `Busy`; completion arrives through [`PalPlc::tasks`].
    pub fn new(modem: M, config: PalPlcConfig, handlers: &'d dyn PalPlcHandlers) -> Self {
        let mut inner = PalInner {
            modem,
            config,
            status: PalPlcStatus::Uninitialized,
            handlers,
            branch: CouplingBranch::Main,
            mib: MibBackup::default(),
            restart_mib: true,
            waiting_tx_cfm: false,
            coordinator: false,
            pvdd_tx_enable: true,
        };
        inner.start_init();
        Self {
            inner: Mutex::new(RefCell::new(inner)),
            unexpected_key_count: AtomicU32::new(0),
            reset_count: AtomicU32::new(0),
        }
    }

    pub fn status(&self) -> PalPlcStatus {
        self.inner.lock(|cell| cell.borrow().status)
    }

    /// Periodic poll: drains modem events and forwards indications to the
    /// registered handlers outside the PAL lock.
    pub fn tasks(&self) {
        loop {
            let mut dispatch = None;
            let handlers = self.inner.lock(|cell| {
                let inner = &mut *cell.borrow_mut();
                let event = inner.modem.poll_event()?;
                match event {
                    MacRtEvent::InitDone { success } => {
                        dispatch = inner.init_complete(success);
                    }
                    MacRtEvent::TxConfirm {
                        status,
                        update_timestamp,
                    } => {
                        inner.waiting_tx_cfm = false;
                        dispatch = Some(Dispatch::TxConfirm(status, update_timestamp));
                    }
                    MacRtEvent::DataIndication { frame } => {
                        dispatch = Some(Dispatch::Data(frame));
                    }
                    MacRtEvent::CommStatus { frame } => {
                        dispatch = Some(Dispatch::CommStatus(frame));
                    }
                    MacRtEvent::RxParamsIndication { params } => {
                        dispatch = Some(Dispatch::RxParams(params));
                    }
                    MacRtEvent::Exception { kind } => {
                        warn!("MAC-RT exception: {:?}", kind);
                        match kind {
                            MacRtException::UnexpectedKey => {
                                self.unexpected_key_count.fetch_add(1, Ordering::Relaxed);
                            }
                            MacRtException::Reset => {
                                self.reset_count.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        // The chip just lost its state; the host snapshot is
                        // the authoritative copy for the next init.
                        inner.restart_mib = false;
                        inner.status = PalPlcStatus::Error;
                    }
                }
                Some(inner.handlers)
            });
            let Some(handlers) = handlers else {
                break;
            };
            match dispatch {
                Some(Dispatch::Data(frame)) => handlers.data_indication(frame.as_slice()),
                Some(Dispatch::CommStatus(frame)) => {
                    handlers.comm_status_indication(frame.as_slice())
                }
                Some(Dispatch::TxConfirm(status, update)) => handlers.tx_confirm(status, update),
                Some(Dispatch::RxParams(params)) => handlers.rx_params_indication(&params),
                None => {}
            }
        }
    }

    /// Full teardown and rebuild with the captured configuration.
    /// `reset_mib` decides what happens when the init completes: `true`
    /// pulls a fresh MIB snapshot from the chip, `false` pushes the host
    /// snapshot back (restoring everything set before the reset).
    pub fn reset(&self, reset_mib: bool) {
        self.inner.lock(|cell| {
            let inner = &mut *cell.borrow_mut();
            inner.restart_mib = reset_mib;
            inner.modem.close();
            inner.status = PalPlcStatus::Uninitialized;
            inner.start_init();
        });
    }

    /// Hand a frame to the modem. A PAL that is not ready, or whose
    /// transmitter is disabled by the PVDD monitor, synthesizes an immediate
    /// denied confirm so the caller's completion path runs either way.
    pub fn tx_request(&self, data: &[u8]) {
        let (handlers, denied) = self.inner.lock(|cell| {
            let inner = &mut *cell.borrow_mut();
            if inner.status != PalPlcStatus::Ready
                || !inner.pvdd_tx_enable
                || data.is_empty()
                || data.len() > PAL_PLC_MAX_DATA_LEN
            {
                (inner.handlers, true)
            } else {
                inner.waiting_tx_cfm = true;
                inner.modem.tx_request(data);
                (inner.handlers, false)
            }
        });
        if denied {
            handlers.tx_confirm(MacRtStatus::Denied, false);
        }
    }

    /// Write a MAC-RT PIB. Successful writes are mirrored into the MIB
    /// snapshot so they survive a chip reset.
    pub fn set_mac_rt_pib(&self, obj: &MacRtPibObj) -> MacRtStatus {
        self.inner.lock(|cell| {
            let inner = &mut *cell.borrow_mut();
            if inner.status != PalPlcStatus::Ready {
                return MacRtStatus::Denied;
            }
            let status = inner.modem.pib_set(obj);
            if status == MacRtStatus::Success {
                inner.mib.update(obj);
            }
            status
        })
    }

    pub fn get_mac_rt_pib(&self, obj: &mut MacRtPibObj) -> MacRtStatus {
        self.inner.lock(|cell| {
            let inner = &mut *cell.borrow_mut();
            if inner.status != PalPlcStatus::Ready {
                return MacRtStatus::Denied;
            }
            inner.modem.pib_get(obj)
        })
    }

    /// Grant PAN-coordinator capability. Persists in the snapshot so it is
    /// re-asserted after every modem reset.
    pub fn set_coordinator(&self) {
        self.inner.lock(|cell| {
            let inner = &mut *cell.borrow_mut();
            inner.coordinator = true;
            inner.mib.coordinator = true;
            if inner.status == PalPlcStatus::Ready {
                inner.modem.set_coordinator();
            }
        });
    }

    /// Modem timer reference, 0 while the modem is not up.
    pub fn get_phy_time(&self) -> u32 {
        self.inner.lock(|cell| {
            let inner = &mut *cell.borrow_mut();
            if inner.status == PalPlcStatus::Ready {
                inner.modem.timer_reference()
            } else {
                0
            }
        })
    }

    /// PVDD monitor comparator callback: `in_window` is false while the
    /// supply is outside the safe transmission window.
    pub fn pvdd_event(&self, in_window: bool) {
        self.inner.lock(|cell| {
            let inner = &mut *cell.borrow_mut();
            inner.pvdd_tx_enable = in_window;
            if inner.status == PalPlcStatus::Ready {
                inner.modem.enable_tx(in_window);
            }
        });
    }

    /// Current host-side MIB snapshot.
    pub fn mib_snapshot(&self) -> MibBackup {
        self.inner.lock(|cell| cell.borrow().mib.clone())
    }

    pub fn unexpected_key_exceptions(&self) -> u32 {
        self.unexpected_key_count.load(Ordering::Relaxed)
    }

    pub fn reset_exceptions(&self) -> u32 {
        self.reset_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        cell::RefCell as StdRefCell, collections::HashMap, collections::VecDeque, rc::Rc,
        vec::Vec,
    };

    static FW_MAIN: [u8; 8] = [0xC5; 8];
    static FW_AUX: [u8; 16] = [0xFC; 16];
    static MAIN_PARAMS: [(u16, &[u8]); 2] = [(0x0001, &[0x10, 0x20]), (0x0002, &[0x30])];
    static AUX_PARAMS: [(u16, &[u8]); 1] = [(0x0001, &[0x99])];

    #[derive(Default)]
    struct ModemState {
        events: VecDeque<MacRtEvent>,
        store: HashMap<(MacRtPib, u16), Vec<u8>>,
        firmware_lens: Vec<usize>,
        open_calls: usize,
        close_calls: usize,
        tx_frames: Vec<Vec<u8>>,
        tx_enabled: Option<bool>,
        coordinator_calls: usize,
        timer: u32,
    }

    struct MockModem {
        state: Rc<StdRefCell<ModemState>>,
    }

    impl MacRtModem for MockModem {
        fn initialize(&mut self, firmware: &'static [u8]) {
            self.state.borrow_mut().firmware_lens.push(firmware.len());
        }
        fn open(&mut self) -> bool {
            self.state.borrow_mut().open_calls += 1;
            true
        }
        fn close(&mut self) {
            self.state.borrow_mut().close_calls += 1;
        }
        fn pib_get(&mut self, obj: &mut MacRtPibObj) -> MacRtStatus {
            let state = self.state.borrow();
            match state.store.get(&(obj.pib, obj.index)) {
                Some(value) => {
                    obj.data[..value.len()].copy_from_slice(value);
                    obj.length = value.len() as u8;
                    MacRtStatus::Success
                }
                None => MacRtStatus::NoData,
            }
        }
        fn pib_set(&mut self, obj: &MacRtPibObj) -> MacRtStatus {
            self.state
                .borrow_mut()
                .store
                .insert((obj.pib, obj.index), obj.value().to_vec());
            MacRtStatus::Success
        }
        fn tx_request(&mut self, data: &[u8]) {
            self.state.borrow_mut().tx_frames.push(data.to_vec());
        }
        fn enable_tx(&mut self, enable: bool) {
            self.state.borrow_mut().tx_enabled = Some(enable);
        }
        fn set_coordinator(&mut self) {
            self.state.borrow_mut().coordinator_calls += 1;
        }
        fn timer_reference(&mut self) -> u32 {
            self.state.borrow().timer
        }
        fn poll_event(&mut self) -> Option<MacRtEvent> {
            self.state.borrow_mut().events.pop_front()
        }
    }

    #[derive(Default)]
    struct RecHandlers {
        data: StdRefCell<Vec<Vec<u8>>>,
        comm: StdRefCell<Vec<Vec<u8>>>,
        cfm: StdRefCell<Vec<(MacRtStatus, bool)>>,
        rx_params: StdRefCell<Vec<MacRtRxParams>>,
    }

    impl PalPlcHandlers for RecHandlers {
        fn data_indication(&self, data: &[u8]) {
            self.data.borrow_mut().push(data.to_vec());
        }
        fn comm_status_indication(&self, data: &[u8]) {
            self.comm.borrow_mut().push(data.to_vec());
        }
        fn tx_confirm(&self, status: MacRtStatus, update_timestamp: bool) {
            self.cfm.borrow_mut().push((status, update_timestamp));
        }
        fn rx_params_indication(&self, params: &MacRtRxParams) {
            self.rx_params.borrow_mut().push(*params);
        }
    }

    fn config(band: PlcBand) -> PalPlcConfig {
        PalPlcConfig {
            band,
            main: CouplingConfig {
                band: PlcBand::CenelecA,
                firmware: &FW_MAIN,
                phy_params: &MAIN_PARAMS,
            },
            auxiliary: Some(CouplingConfig {
                band: PlcBand::Fcc,
                firmware: &FW_AUX,
                phy_params: &AUX_PARAMS,
            }),
        }
    }

    fn setup<'d>(
        handlers: &'d RecHandlers,
        band: PlcBand,
    ) -> (Rc<StdRefCell<ModemState>>, PalPlc<'d, MockModem>) {
        let state = Rc::new(StdRefCell::new(ModemState::default()));
        // Chip-side defaults for the first MIB pull.
        state.borrow_mut().store.insert(
            (MacRtPib::GetSetAllMib, 0),
            MibBackup::default().to_bytes().to_vec(),
        );
        let pal = PalPlc::new(
            MockModem {
                state: state.clone(),
            },
            config(band),
            handlers,
        );
        (state, pal)
    }

    fn boot(state: &Rc<StdRefCell<ModemState>>, pal: &PalPlc<'_, MockModem>) {
        state
            .borrow_mut()
            .events
            .push_back(MacRtEvent::InitDone { success: true });
        pal.tasks();
        assert_eq!(pal.status(), PalPlcStatus::Ready);
    }

    #[test]
    fn init_selects_branch_applies_coupling_and_pulls_mib() {
        let handlers = RecHandlers::default();
        let (state, pal) = setup(&handlers, PlcBand::CenelecA);
        assert_eq!(pal.status(), PalPlcStatus::Busy);
        assert_eq!(state.borrow().firmware_lens, vec![FW_MAIN.len()]);

        boot(&state, &pal);
        let s = state.borrow();
        assert_eq!(
            s.store.get(&(MacRtPib::ManufPhyParam, 0x0001)).unwrap(),
            &vec![0x10, 0x20]
        );
        assert_eq!(
            s.store
                .get(&(MacRtPib::ManufPhyParam, PHY_PARAM_CFG_IMPEDANCE))
                .unwrap(),
            &vec![IMPEDANCE_VLO]
        );
        assert_eq!(s.tx_enabled, Some(true));
        drop(s);
        assert_eq!(pal.mib_snapshot(), MibBackup::default());
    }

    #[test]
    fn auxiliary_branch_selected_by_band() {
        let handlers = RecHandlers::default();
        let (state, _pal) = setup(&handlers, PlcBand::Fcc);
        assert_eq!(state.borrow().firmware_lens, vec![FW_AUX.len()]);
    }

    #[test]
    fn unmatched_band_is_fatal() {
        let handlers = RecHandlers::default();
        let (_state, pal) = setup(&handlers, PlcBand::Arib);
        assert_eq!(pal.status(), PalPlcStatus::Error);
    }

    #[test]
    fn pib_writes_are_mirrored_and_restored_after_exception() {
        let handlers = RecHandlers::default();
        let (state, pal) = setup(&handlers, PlcBand::CenelecA);
        boot(&state, &pal);

        let obj = MacRtPibObj::new(MacRtPib::PanId, 0, &0xBEEFu16.to_le_bytes());
        assert_eq!(pal.set_mac_rt_pib(&obj), MacRtStatus::Success);
        assert_eq!(pal.mib_snapshot().pan_id, 0xBEEF);

        state
            .borrow_mut()
            .events
            .push_back(MacRtEvent::Exception {
                kind: MacRtException::Reset,
            });
        pal.tasks();
        assert_eq!(pal.status(), PalPlcStatus::Error);
        assert_eq!(pal.reset_exceptions(), 1);

        pal.reset(false);
        boot(&state, &pal);

        // The snapshot was pushed back without any upper-layer involvement.
        let s = state.borrow();
        let restored =
            MibBackup::from_bytes(s.store.get(&(MacRtPib::GetSetAllMib, 0)).unwrap());
        assert_eq!(restored.pan_id, 0xBEEF);
    }

    #[test]
    fn coordinator_persists_across_exception() {
        let handlers = RecHandlers::default();
        let (state, pal) = setup(&handlers, PlcBand::CenelecA);
        boot(&state, &pal);

        pal.set_coordinator();
        assert_eq!(state.borrow().coordinator_calls, 1);

        state
            .borrow_mut()
            .events
            .push_back(MacRtEvent::Exception {
                kind: MacRtException::UnexpectedKey,
            });
        pal.tasks();
        assert_eq!(pal.unexpected_key_exceptions(), 1);

        pal.reset(false);
        boot(&state, &pal);
        assert_eq!(state.borrow().coordinator_calls, 2);
    }

    #[test]
    fn tx_denied_while_not_ready() {
        let handlers = RecHandlers::default();
        let (state, pal) = setup(&handlers, PlcBand::CenelecA);

        pal.tx_request(&[1, 2, 3]);
        assert_eq!(
            handlers.cfm.borrow().as_slice(),
            &[(MacRtStatus::Denied, false)]
        );
        assert!(state.borrow().tx_frames.is_empty());
    }

    #[test]
    fn pvdd_out_of_window_gates_tx() {
        let handlers = RecHandlers::default();
        let (state, pal) = setup(&handlers, PlcBand::CenelecA);
        boot(&state, &pal);

        pal.pvdd_event(false);
        assert_eq!(state.borrow().tx_enabled, Some(false));
        pal.tx_request(&[0xAA]);
        assert_eq!(
            handlers.cfm.borrow().as_slice(),
            &[(MacRtStatus::Denied, false)]
        );
        assert!(state.borrow().tx_frames.is_empty());

        pal.pvdd_event(true);
        pal.tx_request(&[0xAA]);
        assert_eq!(state.borrow().tx_frames.len(), 1);

        state.borrow_mut().events.push_back(MacRtEvent::TxConfirm {
            status: MacRtStatus::Success,
            update_timestamp: true,
        });
        pal.tasks();
        assert_eq!(handlers.cfm.borrow().last(), Some(&(MacRtStatus::Success, true)));
    }

    #[test]
    fn tx_confirm_synthesized_when_reset_interrupts_transmission() {
        let handlers = RecHandlers::default();
        let (state, pal) = setup(&handlers, PlcBand::CenelecA);
        boot(&state, &pal);

        pal.tx_request(&[0x01, 0x02]);
        assert!(handlers.cfm.borrow().is_empty());

        pal.reset(false);
        boot(&state, &pal);
        assert_eq!(
            handlers.cfm.borrow().as_slice(),
            &[(MacRtStatus::ChannelAccessFailure, true)]
        );
    }

    #[test]
    fn indications_are_forwarded() {
        let handlers = RecHandlers::default();
        let (state, pal) = setup(&handlers, PlcBand::CenelecA);
        boot(&state, &pal);

        {
            let mut s = state.borrow_mut();
            s.events.push_back(MacRtEvent::DataIndication {
                frame: PlcFrame::new(&[0x11, 0x22, 0x33]),
            });
            s.events.push_back(MacRtEvent::RxParamsIndication {
                params: MacRtRxParams {
                    high_priority: true,
                    link_quality: 42,
                    phase_differential: 1,
                },
            });
            s.events.push_back(MacRtEvent::CommStatus {
                frame: PlcFrame::new(&[0x44]),
            });
        }
        pal.tasks();

        assert_eq!(handlers.data.borrow().as_slice(), &[vec![0x11, 0x22, 0x33]]);
        assert_eq!(handlers.rx_params.borrow()[0].link_quality, 42);
        assert_eq!(handlers.comm.borrow().as_slice(), &[vec![0x44]]);
    }

    #[test]
    fn phy_time_zero_until_ready() {
        let handlers = RecHandlers::default();
        let (state, pal) = setup(&handlers, PlcBand::CenelecA);
        state.borrow_mut().timer = 123_456;
        assert_eq!(pal.get_phy_time(), 0);
        boot(&state, &pal);
        assert_eq!(pal.get_phy_time(), 123_456);
    }

    #[test]
    fn pib_access_denied_while_not_ready() {
        let handlers = RecHandlers::default();
        let (_state, pal) = setup(&handlers, PlcBand::CenelecA);
        let mut obj = MacRtPibObj::new(MacRtPib::PanId, 0, &[]);
        assert_eq!(pal.get_mac_rt_pib(&mut obj), MacRtStatus::Denied);
        assert_eq!(pal.set_mac_rt_pib(&obj), MacRtStatus::Denied);
    }
}
