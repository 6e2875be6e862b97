use core::cell::RefCell;

use config::{Bus, ClockConfig, Mco, Mco1Source, Mco2Source, PllConfig, SysClkSource};
use critical_section::Mutex;
use periph_helpers::PeriphClockSource;
use rcc::{
    Reg, RccRegisters, APBDIVR, MCOCFGR, MCUDIVR, MSSCKSELR, OCEN, OCRDYR, PLL3CFGR1, PLL3CFGR2, PLL3CR, RCK3SELR,
};
use tock_registers::fields::FieldValue;
use tock_registers::LocalRegisterCopy;

use crate::time::Hertz;

pub mod config;
pub mod periph_helpers;
pub mod rcc;

#[cfg(test)]
mod tests;

static CLOCKS: Mutex<RefCell<Option<Clocks>>> = Mutex::new(RefCell::new(None));

/// `init` is the main entrypoint for configuring clocks.
///
/// This should be called once on startup, before interrupts or a scheduler are enabled.
///
/// The whole activation sequence runs inside a single critical section, so interrupts
/// are masked from the first oscillator enable until the MCU runs from its final
/// source, and restored afterwards.
///
/// Once this function has completed successfully, the MCU and APB clocks run as
/// specified in [`ClockConfig`] and are not reconfigurable. The resulting frequencies
/// are stored in a write-once static in this module, and can be later accessed via
/// [`with_clocks`], [`bus_frequency`] or [`periph_frequency`].
///
/// Every hardware acknowledgement is waited for without a timeout: a ready flag that
/// never asserts (for instance an HSE that is configured but not fitted) makes this
/// function never return.
pub fn init<R: RccRegisters>(mut rcc: R, config: &ClockConfig) -> Result<(), ClockError> {
    critical_section::with(|cs| {
        // Ensure we haven't already configured the clocks
        if CLOCKS.borrow_ref(cs).is_some() {
            return Err(ClockError::AlreadyConfigured);
        }

        let clocks = ClockOperator::new(config, &mut rcc).run()?;

        info!(
            "clocks: mcu {} Hz, apb1 {} Hz, apb2 {} Hz, apb3 {} Hz",
            clocks.mcu.0,
            clocks.apb1.0,
            clocks.apb2.0,
            clocks.apb3.0
        );

        // Store the configured clocks object statically so we can retrieve it later
        *CLOCKS.borrow_ref_mut(cs) = Some(clocks);
        Ok(())
    })
}

/// Clock tree as read back from the RCC once [`init`] has completed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Clocks {
    /// Internal high speed oscillator, always running
    pub hsi: Hertz,
    /// External high speed oscillator, if enabled
    pub hse: Option<Hertz>,
    /// 32.768 kHz crystal, if fitted. Its enable is owned by the backup domain and
    /// is not touched by [`init`].
    pub lse: Option<Hertz>,
    /// Source feeding the MCU divider
    pub sysclk: SysClkSource,
    /// PLL3 outputs, if the PLL is running
    pub pll3_p: Option<Hertz>,
    pub pll3_q: Option<Hertz>,
    pub pll3_r: Option<Hertz>,
    /// MCU core/AHB clock
    pub mcu: Hertz,
    pub apb1: Hertz,
    pub apb2: Hertz,
    pub apb3: Hertz,
    /// Frequencies present on the MCO pins, if enabled
    pub mco1: Option<Hertz>,
    pub mco2: Option<Hertz>,
}

impl Clocks {
    /// Frequency of the given bus.
    pub fn bus(&self, bus: Bus) -> Hertz {
        match bus {
            Bus::Mcu => self.mcu,
            Bus::Apb1 => self.apb1,
            Bus::Apb2 => self.apb2,
            Bus::Apb3 => self.apb3,
        }
    }

    fn ensure_hse(&self) -> Result<Hertz, ClockError> {
        self.hse.ok_or_else(|| ClockError::bad_config("hse needed but not enabled"))
    }

    fn ensure_lse(&self) -> Result<Hertz, ClockError> {
        self.lse.ok_or_else(|| ClockError::bad_config("lse needed but not present"))
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockError {
    /// The requested configuration was impossible or conflicting
    BadConfiguration { reason: &'static str },
    /// A programming error occurred. This should be impossible.
    Programming { reason: &'static str },
    /// Attempted to re-configure the clocks, calling `init` twice.
    AlreadyConfigured,
}

impl ClockError {
    fn bad_config(reason: &'static str) -> Self {
        Self::BadConfiguration { reason }
    }

    fn prog_err(reason: &'static str) -> Self {
        Self::Programming { reason }
    }
}

/// Progress of the activation sequence.
///
/// States only ever move forward, in declaration order. `HseEnabled` is skipped on
/// boards without an HSE, and the PLL states are replaced by `HsiActive` when the MCU
/// stays on the HSI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockState {
    Reset,
    HsiOnly,
    DividersSet,
    SourcePinned,
    ClocksReset,
    HseEnabled,
    PllConfigured,
    PllLocked,
    PllActive,
    HsiActive,
}

pub(crate) struct ClockOperator<'a, R: RccRegisters> {
    config: &'a ClockConfig,
    rcc: &'a mut R,
    state: ClockState,
}

impl<'a, R: RccRegisters> ClockOperator<'a, R> {
    pub(crate) fn new(config: &'a ClockConfig, rcc: &'a mut R) -> Self {
        Self {
            config,
            rcc,
            state: ClockState::Reset,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ClockState {
        self.state
    }

    fn advance(&mut self, next: ClockState) {
        debug_assert!(next > self.state);
        trace!("clock state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run the full sequence and read the resulting clock tree back.
    pub(crate) fn run(&mut self) -> Result<Clocks, ClockError> {
        self.enable_hsi();
        self.set_dividers();
        self.pin_hsi();
        self.reset_clocks();
        self.setup_mco();

        if self.config.oscillators().hse.is_some() {
            self.enable_hse();
        }

        match (self.config.sysclk(), self.config.pll()) {
            (SysClkSource::Pll3, Some(pll)) => {
                self.configure_pll(&pll)?;
                self.lock_pll(&pll);
                self.switch_to_pll();
            }
            (SysClkSource::Hsi, None) => {
                // Already running from the HSI since `pin_hsi`
                self.advance(ClockState::HsiActive);
            }
            _ => return Err(ClockError::prog_err("system clock source and pll config disagree")),
        }

        self.read_back()
    }

    /// Step 1: make sure a live clock exists before anything else is touched.
    fn enable_hsi(&mut self) {
        self.rcc.write_value(Reg::Ocensetr, OCEN::HSION::SET);
        self.rcc.wait_field(Reg::Ocrdyr, OCRDYR::HSIRDY, 1);
        self.advance(ClockState::HsiOnly);
    }

    /// Step 2: program the bus dividers while still on the HSI.
    fn set_dividers(&mut self) {
        let div = self.config.dividers();

        self.rcc.write_value(Reg::Mcudivr, MCUDIVR::MCUDIV.val(div.mcu as u32));
        self.rcc.wait_field(Reg::Mcudivr, MCUDIVR::MCUDIVRDY, 1);

        for (reg, apb) in [(Reg::Apb1divr, div.apb1), (Reg::Apb2divr, div.apb2), (Reg::Apb3divr, div.apb3)] {
            self.rcc.write_value(reg, APBDIVR::APBDIV.val(apb as u32));
            self.rcc.wait_field(reg, APBDIVR::APBDIVRDY, 1);
        }
        self.advance(ClockState::DividersSet);
    }

    /// Step 3: select the HSI explicitly, whatever a previous boot stage left selected.
    fn pin_hsi(&mut self) {
        self.rcc.write_value(Reg::Mssckselr, MSSCKSELR::MCUSSRC::Hsi);
        self.rcc.wait_field(Reg::Mssckselr, MSSCKSELR::MCUSSRCRDY, 1);
        self.advance(ClockState::SourcePinned);
    }

    /// Step 4: stop every oscillator but the HSI, and PLL3.
    fn reset_clocks(&mut self) {
        self.rcc.write(Reg::Ocenclrr, !OCEN::HSION::SET.value);
        self.rcc.write_field(Reg::Pll3cr, PLL3CR::PLLON, 0);
        self.rcc.modify(
            Reg::Pll3cr,
            PLL3CR::DIVPEN::CLEAR + PLL3CR::DIVQEN::CLEAR + PLL3CR::DIVREN::CLEAR,
        );
        self.rcc.wait_field(Reg::Pll3cr, PLL3CR::PLL3RDY, 0);
        self.advance(ClockState::ClocksReset);
    }

    fn setup_mco(&mut self) {
        if let Some(Mco { source, div }) = self.config.mco1() {
            self.rcc.write_value(Reg::Mco1cfgr, mco_cfg(source as u32, div));
        }
        if let Some(Mco { source, div }) = self.config.mco2() {
            self.rcc.write_value(Reg::Mco2cfgr, mco_cfg(source as u32, div));
        }
    }

    /// Step 5: only reached on boards with an HSE.
    fn enable_hse(&mut self) {
        self.rcc.write_value(Reg::Ocensetr, OCEN::HSEON::SET);
        self.rcc.wait_field(Reg::Ocrdyr, OCRDYR::HSERDY, 1);
        self.advance(ClockState::HseEnabled);
    }

    /// Step 6: static PLL3 factors. PLL3 is known to be off since `reset_clocks`.
    fn configure_pll(&mut self, pll: &PllConfig) -> Result<(), ClockError> {
        let input = pll
            .input_freq(&self.config.oscillators())
            .ok_or_else(|| ClockError::bad_config("pll3 source oscillator not present"))?;

        self.rcc.write_value(
            Reg::Pll3cfgr1,
            PLL3CFGR1::DIVN.val(pll.n as u32 - 1)
                + PLL3CFGR1::DIVM3.val(pll.m as u32 - 1)
                + PLL3CFGR1::IFRGE.val(pll.input_range(input)),
        );
        self.rcc.write_value(
            Reg::Pll3cfgr2,
            PLL3CFGR2::DIVP.val(pll.p as u32 - 1)
                + PLL3CFGR2::DIVQ.val(pll.q as u32 - 1)
                + PLL3CFGR2::DIVR.val(pll.r as u32 - 1),
        );
        self.advance(ClockState::PllConfigured);
        Ok(())
    }

    /// Step 7: latch the reference, then enable the outputs and wait for lock.
    fn lock_pll(&mut self, pll: &PllConfig) {
        self.rcc
            .write_value(Reg::Rck3selr, RCK3SELR::PLL3SRC.val(pll.source as u32));
        self.rcc.wait_field(Reg::Rck3selr, RCK3SELR::PLL3SRCRDY, 1);

        self.rcc.modify(
            Reg::Pll3cr,
            PLL3CR::DIVPEN::SET + PLL3CR::DIVQEN::SET + PLL3CR::DIVREN::SET,
        );
        self.rcc.write_field(Reg::Pll3cr, PLL3CR::PLLON, 1);
        self.rcc.wait_field(Reg::Pll3cr, PLL3CR::PLL3RDY, 1);
        self.advance(ClockState::PllLocked);
    }

    /// Step 8: the one frequency jump, only valid once PLL3 is locked.
    fn switch_to_pll(&mut self) {
        self.rcc.write_value(Reg::Mssckselr, MSSCKSELR::MCUSSRC::Pll3P);
        self.rcc.wait_field(Reg::Mssckselr, MSSCKSELR::MCUSSRCRDY, 1);
        self.advance(ClockState::PllActive);
    }

    /// Recompute every frequency from what the registers now hold.
    fn read_back(&mut self) -> Result<Clocks, ClockError> {
        let osc = self.config.oscillators();

        let ready = LocalRegisterCopy::<u32, OCRDYR::Register>::new(self.rcc.read(Reg::Ocrdyr));
        let hse = if ready.is_set(OCRDYR::HSERDY) { osc.hse } else { None };

        let pll_ctrl = LocalRegisterCopy::<u32, PLL3CR::Register>::new(self.rcc.read(Reg::Pll3cr));
        let (pll3_p, pll3_q, pll3_r) = if pll_ctrl.is_set(PLL3CR::PLL3RDY) {
            let sel = LocalRegisterCopy::<u32, RCK3SELR::Register>::new(self.rcc.read(Reg::Rck3selr));
            let input = match sel.read_as_enum(RCK3SELR::PLL3SRC) {
                Some(RCK3SELR::PLL3SRC::Value::Hsi) => osc.hsi,
                Some(RCK3SELR::PLL3SRC::Value::Hse) => {
                    hse.ok_or_else(|| ClockError::prog_err("pll3 runs from a stopped hse"))?
                }
                None => return Err(ClockError::prog_err("unexpected pll3 source")),
            };
            let cfgr1 = LocalRegisterCopy::<u32, PLL3CFGR1::Register>::new(self.rcc.read(Reg::Pll3cfgr1));
            let cfgr2 = LocalRegisterCopy::<u32, PLL3CFGR2::Register>::new(self.rcc.read(Reg::Pll3cfgr2));
            let m = cfgr1.read(PLL3CFGR1::DIVM3) as u64 + 1;
            let n = cfgr1.read(PLL3CFGR1::DIVN) as u64 + 1;
            let vco = input.0 as u64 * n / m;
            let out = |div: u32| Hertz((vco / (div as u64 + 1)) as u32);
            (
                Some(out(cfgr2.read(PLL3CFGR2::DIVP))),
                Some(out(cfgr2.read(PLL3CFGR2::DIVQ))),
                Some(out(cfgr2.read(PLL3CFGR2::DIVR))),
            )
        } else {
            (None, None, None)
        };

        let sel = LocalRegisterCopy::<u32, MSSCKSELR::Register>::new(self.rcc.read(Reg::Mssckselr));
        let (sysclk, source) = match sel.read_as_enum(MSSCKSELR::MCUSSRC) {
            Some(MSSCKSELR::MCUSSRC::Value::Hsi) => (SysClkSource::Hsi, osc.hsi),
            Some(MSSCKSELR::MCUSSRC::Value::Pll3P) => (
                SysClkSource::Pll3,
                pll3_p.ok_or_else(|| ClockError::prog_err("mcu runs from a stopped pll3"))?,
            ),
            _ => return Err(ClockError::prog_err("unexpected mcu clock source")),
        };

        let mcu = source / (1 << self.rcc.read_field(Reg::Mcudivr, MCUDIVR::MCUDIV).min(9));
        let apb1 = mcu / (1 << self.rcc.read_field(Reg::Apb1divr, APBDIVR::APBDIV).min(4));
        let apb2 = mcu / (1 << self.rcc.read_field(Reg::Apb2divr, APBDIVR::APBDIV).min(4));
        let apb3 = mcu / (1 << self.rcc.read_field(Reg::Apb3divr, APBDIVR::APBDIV).min(4));

        let mut clocks = Clocks {
            hsi: osc.hsi,
            hse,
            lse: osc.lse_freq(),
            sysclk,
            pll3_p,
            pll3_q,
            pll3_r,
            mcu,
            apb1,
            apb2,
            apb3,
            mco1: None,
            mco2: None,
        };
        clocks.mco1 = self.config.mco1().map(|mco| mco1_freq(&clocks, mco)).transpose()?;
        clocks.mco2 = self.config.mco2().map(|mco| mco2_freq(&clocks, mco)).transpose()?;

        debug!("clocks: sysclk {:?}, pll3_p {:?}", clocks.sysclk, clocks.pll3_p);
        Ok(clocks)
    }
}

fn mco_cfg(sel: u32, div: u8) -> FieldValue<u32, MCOCFGR::Register> {
    MCOCFGR::MCOSEL.val(sel) + MCOCFGR::MCODIV.val(div as u32 - 1) + MCOCFGR::MCOON::SET
}

fn mco1_freq(clocks: &Clocks, mco: Mco<Mco1Source>) -> Result<Hertz, ClockError> {
    let source = match mco.source {
        Mco1Source::Hsi => clocks.hsi,
        Mco1Source::Hse => clocks.ensure_hse()?,
        Mco1Source::Lse => clocks.ensure_lse()?,
    };
    Ok(source / mco.div as u32)
}

fn mco2_freq(clocks: &Clocks, mco: Mco<Mco2Source>) -> Result<Hertz, ClockError> {
    let source = match mco.source {
        Mco2Source::Mcu => clocks.mcu,
        Mco2Source::Hse => clocks.ensure_hse()?,
        Mco2Source::Hsi => clocks.hsi,
    };
    Ok(source / mco.div as u32)
}

/// Get a read-only view of the clock tree configured by [`init`].
///
/// In MOST cases, peripherals should determine their clock frequency by calling
/// [`periph_frequency`] or [`bus_frequency`].
///
/// This function runs the provided closure *inside of a critical section*, so move with
/// purpose! You can clone-out the Clocks struct if necessary, or perform a more directed
/// query and return that instead.
///
/// Returns `None` if the clocks have not yet been initialized.
pub fn with_clocks<F: FnOnce(&Clocks) -> R, R>(f: F) -> Option<R> {
    critical_section::with(|cs| {
        let c = CLOCKS.borrow_ref(cs);
        let c = c.as_ref()?;
        Some(f(c))
    })
}

/// Frequency of `bus`, or `None` if the clocks have not yet been initialized.
pub fn bus_frequency(bus: Bus) -> Option<Hertz> {
    with_clocks(|c| c.bus(bus))
}

/// Kernel clock frequency of a peripheral described by `cfg`.
pub fn periph_frequency<T: PeriphClockSource>(cfg: &T) -> Result<Hertz, ClockError> {
    critical_section::with(|cs| {
        let clocks = CLOCKS.borrow_ref(cs);
        let clocks = clocks.as_ref().ok_or(ClockError::prog_err("didn't call init"))?;
        cfg.source_frequency(clocks)
    })
}
