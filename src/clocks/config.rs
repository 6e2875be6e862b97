//! Clock configuration
//!
//! A board describes its oscillators and a target MCU frequency in a [`ClockSetup`],
//! optionally pinning individual values through [`Overrides`]. [`ClockSetup::resolve`]
//! turns that into a validated [`ClockConfig`]; it is a `const fn`, so boards resolve
//! their configuration into a constant with [`ClockSetup::checked`] and an invalid
//! combination stops the build:
//!
//! ```rust
//! use stm32mp1_rcc::clocks::config::{ClockConfig, ClockSetup, OscillatorSet};
//! use stm32mp1_rcc::time::Hertz;
//!
//! const OSC: OscillatorSet = OscillatorSet::new().with_hse(Hertz::mhz(24));
//! const CONFIG: ClockConfig = ClockSetup::new(OSC, Hertz::mhz(208)).checked();
//! ```
//!
//! ```text
//!            ┌─────┐       ┌─────────────────────┐  pll3_p   ┌─────┐      ┌──────┐
//!  hsi_ck ──▶│00   │ ref   │ ÷M  ×N        ÷P ──┼──────────▶│11   │ mcu  │÷MCUDIV│── mcu_ck ──┬──▶ ÷APB1DIV ─▶ pclk1
//!  hse_ck ──▶│01   │──────▶│  (VCO)        ÷Q ──┼─▶ pll3_q  │     │─────▶└──────┘            ├──▶ ÷APB2DIV ─▶ pclk2
//!            └─────┘       │               ÷R ──┼─▶ pll3_r  │00   │◀── hsi_ck                └──▶ ÷APB3DIV ─▶ pclk3
//!               ▲          └─────────────────────┘          └─────┘
//!               │                                              ▲
//!         RCK3SELR.PLL3SRC                              MSSCKSELR.MCUSSRC
//! ```

use core::fmt;

use crate::time::Hertz;

/// Nominal HSI frequency after reset (HSIDIV = 1).
pub const HSI_FREQ: Hertz = Hertz::mhz(64);
/// LSE crystal frequency, always 32.768 kHz.
pub const LSE_FREQ: Hertz = Hertz::hz(32_768);
/// Default target MCU frequency, and the one the built-in factor table is tuned for.
pub const DEFAULT_TARGET: Hertz = Hertz::mhz(208);

/// Absolute ceiling of the MCU clock.
pub const MCU_MAX: Hertz = Hertz::mhz(208);
/// Ceiling of each of the APB1, APB2 and APB3 clocks.
pub const APB_MAX: Hertz = Hertz::mhz(104);

/// PLL reference (input after ÷M) range.
pub const PLL_REF_MIN: Hertz = Hertz::mhz(4);
pub const PLL_REF_MAX: Hertz = Hertz::mhz(16);
/// Boundary between the two IFRGE input ranges.
const PLL_REF_IFRGE_SPLIT: Hertz = Hertz::mhz(8);
/// PLL3 VCO range (integer mode).
pub const VCO_MIN: Hertz = Hertz::mhz(400);
pub const VCO_MAX: Hertz = Hertz::mhz(800);
/// Ceiling of each PLL3 post-divider output.
pub const PLL_OUT_MAX: Hertz = Hertz::mhz(208);

const PLL_M_MIN: u32 = 1;
const PLL_M_MAX: u32 = 64;
const PLL_N_MIN: u32 = 25;
const PLL_N_MAX: u32 = 200;
const PLL_DIV_MIN: u32 = 1;
const PLL_DIV_MAX: u32 = 128;

/// Frequency the Q output is aimed at when the factors are searched.
const PLL_Q_TARGET: Hertz = Hertz::mhz(48);
/// Allowed deviation of a searched configuration from its target, in percent.
const TOLERANCE_PERCENT: u32 = 1;

/// Board oscillator facts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OscillatorSet {
    /// External high speed crystal, `None` if not fitted.
    pub hse: Option<Hertz>,
    /// Internal high speed oscillator. Always present.
    pub hsi: Hertz,
    /// Whether a 32.768 kHz LSE crystal is fitted.
    pub lse: bool,
}

impl Default for OscillatorSet {
    fn default() -> Self {
        Self::new()
    }
}

impl OscillatorSet {
    /// HSI only, at its nominal frequency.
    pub const fn new() -> Self {
        Self {
            hse: None,
            hsi: HSI_FREQ,
            lse: false,
        }
    }

    pub const fn with_hse(mut self, freq: Hertz) -> Self {
        self.hse = Some(freq);
        self
    }

    pub const fn with_hsi(mut self, freq: Hertz) -> Self {
        self.hsi = freq;
        self
    }

    pub const fn with_lse(mut self, lse: bool) -> Self {
        self.lse = lse;
        self
    }

    /// Frequency of the LSE, if fitted.
    pub const fn lse_freq(&self) -> Option<Hertz> {
        if self.lse {
            Some(LSE_FREQ)
        } else {
            None
        }
    }
}

/// PLL3 reference clock, encoded as `RCK3SELR.PLL3SRC`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PllSource {
    Hsi = 0,
    Hse = 1,
}

/// MCU subsystem clock, encoded as `MSSCKSELR.MCUSSRC`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SysClkSource {
    /// Run directly from the HSI, leaving PLL3 off.
    Hsi = 0,
    /// Run from the PLL3 P output.
    Pll3 = 3,
}

/// Resolved PLL3 factors.
///
/// Factors are stored as the actual divide/multiply ratios; the register encoding
/// (value minus one) is applied by the sequencer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PllConfig {
    pub source: PllSource,
    /// Input divider, `1..=64`
    pub m: u8,
    /// VCO multiplier, `25..=200`
    pub n: u16,
    /// P post-divider (MCU clock), `1..=128`
    pub p: u8,
    /// Q post-divider, `1..=128`
    pub q: u8,
    /// R post-divider, `1..=128`
    pub r: u8,
}

impl PllConfig {
    /// Frequency of the oscillator feeding the PLL, if it is fitted.
    pub const fn input_freq(&self, osc: &OscillatorSet) -> Option<Hertz> {
        match self.source {
            PllSource::Hsi => Some(osc.hsi),
            PllSource::Hse => osc.hse,
        }
    }

    pub const fn ref_freq(&self, input: Hertz) -> Hertz {
        Hertz(input.0 / self.m as u32)
    }

    pub const fn vco_freq(&self, input: Hertz) -> Hertz {
        Hertz((input.0 as u64 * self.n as u64 / self.m as u64) as u32)
    }

    pub const fn p_freq(&self, input: Hertz) -> Hertz {
        Hertz(self.vco_freq(input).0 / self.p as u32)
    }

    pub const fn q_freq(&self, input: Hertz) -> Hertz {
        Hertz(self.vco_freq(input).0 / self.q as u32)
    }

    pub const fn r_freq(&self, input: Hertz) -> Hertz {
        Hertz(self.vco_freq(input).0 / self.r as u32)
    }

    /// `PLL3CFGR1.IFRGE` value for the given input: 0 for a 4-8 MHz reference, 1 above.
    pub const fn input_range(&self, input: Hertz) -> u32 {
        if self.ref_freq(input).0 < PLL_REF_IFRGE_SPLIT.0 {
            0
        } else {
            1
        }
    }
}

/// MCU clock divider, encoded as `MCUDIVR.MCUDIV`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum McuDiv {
    Div1 = 0,
    Div2 = 1,
    Div4 = 2,
    Div8 = 3,
    Div16 = 4,
    Div32 = 5,
    Div64 = 6,
    Div128 = 7,
    Div256 = 8,
    Div512 = 9,
}

impl McuDiv {
    pub const fn divisor(self) -> u32 {
        1 << self as u32
    }
}

/// APB1/2/3 clock divider, encoded as `APBxDIVR.APBxDIV`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ApbDiv {
    Div1 = 0,
    Div2 = 1,
    Div4 = 2,
    Div8 = 3,
    Div16 = 4,
}

impl ApbDiv {
    pub const fn divisor(self) -> u32 {
        1 << self as u32
    }
}

/// The buses whose clocks are derived by [`BusDividers`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bus {
    Mcu,
    Apb1,
    Apb2,
    Apb3,
}

impl Bus {
    pub const ALL: [Bus; 4] = [Bus::Mcu, Bus::Apb1, Bus::Apb2, Bus::Apb3];

    /// Highest frequency the bus may run at.
    pub const fn ceiling(self) -> Hertz {
        match self {
            Bus::Mcu => MCU_MAX,
            Bus::Apb1 | Bus::Apb2 | Bus::Apb3 => APB_MAX,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusDividers {
    pub mcu: McuDiv,
    pub apb1: ApbDiv,
    pub apb2: ApbDiv,
    pub apb3: ApbDiv,
}

impl Default for BusDividers {
    fn default() -> Self {
        Self::new()
    }
}

impl BusDividers {
    /// MCU /1, every APB /2: 208 MHz, 104 MHz, 104 MHz, 104 MHz at the default target.
    pub const fn new() -> Self {
        Self {
            mcu: McuDiv::Div1,
            apb1: ApbDiv::Div2,
            apb2: ApbDiv::Div2,
            apb3: ApbDiv::Div2,
        }
    }

    /// Frequency of `bus` when the MCU divider is fed with `sysclk`.
    pub const fn bus_freq(&self, sysclk: Hertz, bus: Bus) -> Hertz {
        let mcu = sysclk.0 / self.mcu.divisor();
        match bus {
            Bus::Mcu => Hertz(mcu),
            Bus::Apb1 => Hertz(mcu / self.apb1.divisor()),
            Bus::Apb2 => Hertz(mcu / self.apb2.divisor()),
            Bus::Apb3 => Hertz(mcu / self.apb3.divisor()),
        }
    }
}

/// Source routed to the MCO1 pin, encoded as `MCO1CFGR.MCO1SEL`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mco1Source {
    Hsi = 0,
    Hse = 1,
    Lse = 4,
}

/// Source routed to the MCO2 pin, encoded as `MCO2CFGR.MCO2SEL`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mco2Source {
    Mcu = 2,
    Hse = 4,
    Hsi = 5,
}

/// Microcontroller clock output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Mco<S> {
    pub source: S,
    /// Output divider, `1..=16`
    pub div: u8,
}

/// Board overrides applied on top of the defaults.
///
/// Every `None` field falls back to the default chosen by [`ClockSetup::resolve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Overrides {
    /// Defaults to HSE when fitted, HSI otherwise
    pub pll_source: Option<PllSource>,
    /// Defaults to [`SysClkSource::Pll3`]
    pub sysclk: Option<SysClkSource>,
    pub pll_m: Option<u8>,
    pub pll_n: Option<u16>,
    pub pll_p: Option<u8>,
    pub pll_q: Option<u8>,
    pub pll_r: Option<u8>,
    pub mcu_div: Option<McuDiv>,
    pub apb1_div: Option<ApbDiv>,
    pub apb2_div: Option<ApbDiv>,
    pub apb3_div: Option<ApbDiv>,
    pub mco1: Option<Mco<Mco1Source>>,
    pub mco2: Option<Mco<Mco2Source>>,
}

impl Default for Overrides {
    fn default() -> Self {
        Self::new()
    }
}

impl Overrides {
    pub const fn new() -> Self {
        Self {
            pll_source: None,
            sysclk: None,
            pll_m: None,
            pll_n: None,
            pll_p: None,
            pll_q: None,
            pll_r: None,
            mcu_div: None,
            apb1_div: None,
            apb2_div: None,
            apb3_div: None,
            mco1: None,
            mco2: None,
        }
    }

    pub const fn with_pll_source(mut self, source: PllSource) -> Self {
        self.pll_source = Some(source);
        self
    }

    pub const fn with_sysclk(mut self, sysclk: SysClkSource) -> Self {
        self.sysclk = Some(sysclk);
        self
    }

    pub const fn with_pll_m(mut self, m: u8) -> Self {
        self.pll_m = Some(m);
        self
    }

    pub const fn with_pll_n(mut self, n: u16) -> Self {
        self.pll_n = Some(n);
        self
    }

    pub const fn with_pll_p(mut self, p: u8) -> Self {
        self.pll_p = Some(p);
        self
    }

    pub const fn with_pll_q(mut self, q: u8) -> Self {
        self.pll_q = Some(q);
        self
    }

    pub const fn with_pll_r(mut self, r: u8) -> Self {
        self.pll_r = Some(r);
        self
    }

    pub const fn with_mcu_div(mut self, div: McuDiv) -> Self {
        self.mcu_div = Some(div);
        self
    }

    pub const fn with_apb1_div(mut self, div: ApbDiv) -> Self {
        self.apb1_div = Some(div);
        self
    }

    pub const fn with_apb2_div(mut self, div: ApbDiv) -> Self {
        self.apb2_div = Some(div);
        self
    }

    pub const fn with_apb3_div(mut self, div: ApbDiv) -> Self {
        self.apb3_div = Some(div);
        self
    }

    pub const fn with_mco1(mut self, source: Mco1Source, div: u8) -> Self {
        self.mco1 = Some(Mco { source, div });
        self
    }

    pub const fn with_mco2(mut self, source: Mco2Source, div: u8) -> Self {
        self.mco2 = Some(Mco { source, div });
        self
    }

    const fn dividers(&self) -> BusDividers {
        let defaults = BusDividers::new();
        BusDividers {
            mcu: match self.mcu_div {
                Some(div) => div,
                None => defaults.mcu,
            },
            apb1: match self.apb1_div {
                Some(div) => div,
                None => defaults.apb1,
            },
            apb2: match self.apb2_div {
                Some(div) => div,
                None => defaults.apb2,
            },
            apb3: match self.apb3_div {
                Some(div) => div,
                None => defaults.apb3,
            },
        }
    }
}

/// Which PLL factor a [`ConfigError::FactorOutOfRange`] refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PllFactor {
    M,
    N,
    P,
    Q,
    R,
}

/// A clock setup that cannot be realised on this device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// The HSI frequency is zero
    MissingHsi,
    /// HSE is required by the configuration but the board has none
    MissingHse,
    /// LSE is required by the configuration but the board has none
    MissingLse,
    /// The target exceeds the absolute MCU clock maximum
    CoreClockTooHigh,
    /// No input divider brings the oscillator into the PLL reference range
    NoValidInputDivider,
    /// The VCO frequency falls outside its range
    VcoOutOfRange,
    /// A PLL factor is outside what the register can encode
    FactorOutOfRange { factor: PllFactor },
    /// A PLL output exceeds its maximum
    PllOutputTooHigh { factor: PllFactor },
    /// No factors reach the target within tolerance
    TargetUnreachable,
    /// A bus clock exceeds its ceiling
    BusCeilingExceeded { bus: Bus },
    /// An MCO divider is outside `1..=16`
    McoDividerOutOfRange,
    /// PLL overrides were given while the MCU runs from the HSI
    PllUnused,
}

impl ConfigError {
    /// Human readable name of the violated constraint.
    pub const fn message(&self) -> &'static str {
        match self {
            ConfigError::MissingHsi => "HSI frequency must not be zero",
            ConfigError::MissingHse => "configuration requires an HSE but the board provides none",
            ConfigError::MissingLse => "configuration requires an LSE but the board provides none",
            ConfigError::CoreClockTooHigh => "MCU clock cannot exceed 208 MHz",
            ConfigError::NoValidInputDivider => "no PLL M divider keeps the PLL reference within 4..16 MHz",
            ConfigError::VcoOutOfRange => "PLL VCO frequency must be within 400..800 MHz",
            ConfigError::FactorOutOfRange { factor } => match factor {
                PllFactor::M => "PLL M factor out of range (1..=64)",
                PllFactor::N => "PLL N factor out of range (25..=200)",
                PllFactor::P => "PLL P factor out of range (1..=128)",
                PllFactor::Q => "PLL Q factor out of range (1..=128)",
                PllFactor::R => "PLL R factor out of range (1..=128)",
            },
            ConfigError::PllOutputTooHigh { factor } => match factor {
                PllFactor::Q => "PLL Q output cannot exceed 208 MHz",
                PllFactor::R => "PLL R output cannot exceed 208 MHz",
                _ => "PLL P output cannot exceed 208 MHz",
            },
            ConfigError::TargetUnreachable => "no PLL factors reach the target MCU clock within 1%",
            ConfigError::BusCeilingExceeded { bus } => match bus {
                Bus::Mcu => "MCU clock cannot exceed 208 MHz",
                Bus::Apb1 => "APB1 clock cannot exceed 104 MHz",
                Bus::Apb2 => "APB2 clock cannot exceed 104 MHz",
                Bus::Apb3 => "APB3 clock cannot exceed 104 MHz",
            },
            ConfigError::McoDividerOutOfRange => "MCO divider out of range (1..=16)",
            ConfigError::PllUnused => "PLL overrides given but the MCU runs from the HSI",
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A fully resolved, validated clock tree.
///
/// Only produced by [`ClockSetup::resolve`]; the fields cannot be set from outside:
///
/// ```rust,compile_fail
/// use stm32mp1_rcc::boards::stm32mp157c_dk2::CLOCK_CONFIG;
///
/// let mut config = CLOCK_CONFIG;
/// config.pll = None;
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClockConfig {
    oscillators: OscillatorSet,
    sysclk: SysClkSource,
    sysclk_freq: Hertz,
    pll: Option<PllConfig>,
    dividers: BusDividers,
    mco1: Option<Mco<Mco1Source>>,
    mco2: Option<Mco<Mco2Source>>,
}

impl ClockConfig {
    pub const fn oscillators(&self) -> OscillatorSet {
        self.oscillators
    }

    pub const fn sysclk(&self) -> SysClkSource {
        self.sysclk
    }

    /// `None` when the MCU runs from the HSI and PLL3 stays off.
    pub const fn pll(&self) -> Option<PllConfig> {
        self.pll
    }

    pub const fn dividers(&self) -> BusDividers {
        self.dividers
    }

    pub const fn mco1(&self) -> Option<Mco<Mco1Source>> {
        self.mco1
    }

    pub const fn mco2(&self) -> Option<Mco<Mco2Source>> {
        self.mco2
    }

    /// Resulting MCU clock.
    pub const fn mcu(&self) -> Hertz {
        self.bus_freq(Bus::Mcu)
    }

    /// Frequency `bus` will run at once the configuration is active.
    pub const fn bus_freq(&self, bus: Bus) -> Hertz {
        self.dividers.bus_freq(self.sysclk_freq, bus)
    }
}

/// Board facts plus target frequency plus overrides: the input of the resolver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClockSetup {
    pub oscillators: OscillatorSet,
    /// Target MCU clock
    pub target: Hertz,
    pub overrides: Overrides,
}

impl ClockSetup {
    pub const fn new(oscillators: OscillatorSet, target: Hertz) -> Self {
        Self {
            oscillators,
            target,
            overrides: Overrides::new(),
        }
    }

    pub const fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Resolve into a [`ClockConfig`], panicking with the violated constraint otherwise.
    ///
    /// Use it to initialise a `const` so the check runs at compile time.
    pub const fn checked(&self) -> ClockConfig {
        match self.resolve() {
            Ok(config) => config,
            Err(e) => ::core::panic!("{}", e.message()),
        }
    }

    /// Compute PLL factors and bus dividers for the target MCU clock.
    ///
    /// For the default 208 MHz target, factors for well known oscillator frequencies
    /// come from a fixed table; anything else is searched for. Overridden factors are
    /// kept as given in both cases, and every hardware limit is checked on the result.
    /// Only an untouched table entry is exempt from the 1% target tolerance.
    ///
    /// PLL overrides are rejected when the MCU is set to run from the HSI.
    pub const fn resolve(&self) -> Result<ClockConfig, ConfigError> {
        let osc = &self.oscillators;
        let o = &self.overrides;

        if osc.hsi.0 == 0 {
            return Err(ConfigError::MissingHsi);
        }
        if self.target.0 > MCU_MAX.0 {
            return Err(ConfigError::CoreClockTooHigh);
        }
        if self.target.0 == 0 {
            return Err(ConfigError::TargetUnreachable);
        }
        if let Err(e) = check_overridden_factors(o) {
            return Err(e);
        }
        if let Err(e) = check_mco(osc, o) {
            return Err(e);
        }

        let dividers = o.dividers();

        let sysclk = match o.sysclk {
            Some(sysclk) => sysclk,
            None => SysClkSource::Pll3,
        };

        let (pll, sysclk_freq) = match sysclk {
            SysClkSource::Hsi => {
                if o.pll_source.is_some() || has_factor_overrides(o) {
                    return Err(ConfigError::PllUnused);
                }
                let mcu = dividers.bus_freq(osc.hsi, Bus::Mcu);
                if !within_tolerance(mcu, self.target) {
                    return Err(ConfigError::TargetUnreachable);
                }
                (None, osc.hsi)
            }
            SysClkSource::Pll3 => {
                let source = match o.pll_source {
                    Some(source) => source,
                    None => match osc.hse {
                        Some(_) => PllSource::Hse,
                        None => PllSource::Hsi,
                    },
                };
                let input = match source {
                    PllSource::Hsi => osc.hsi,
                    PllSource::Hse => match osc.hse {
                        Some(hse) => hse,
                        None => return Err(ConfigError::MissingHse),
                    },
                };

                // The P output feeds the MCU divider
                let p_target = self.target.0 as u64 * dividers.mcu.divisor() as u64;
                if p_target > PLL_OUT_MAX.0 as u64 {
                    return Err(ConfigError::TargetUnreachable);
                }
                let p_target = Hertz(p_target as u32);

                let (factors, exact_table) = match default_factors(source, input, self.target) {
                    Some(defaults) => (defaults.apply(o), !has_factor_overrides(o)),
                    None => match search(input, p_target, o) {
                        Ok(factors) => (factors, false),
                        Err(e) => return Err(e),
                    },
                };
                let pll = factors.with_source(source);
                if let Err(e) = check_pll(&pll, input) {
                    return Err(e);
                }
                let p_out = pll.p_freq(input);
                if !exact_table && !within_tolerance(p_out, p_target) {
                    return Err(ConfigError::TargetUnreachable);
                }
                (Some(pll), p_out)
            }
        };

        let mut i = 0;
        while i < Bus::ALL.len() {
            let bus = Bus::ALL[i];
            if dividers.bus_freq(sysclk_freq, bus).0 > bus.ceiling().0 {
                return Err(ConfigError::BusCeilingExceeded { bus });
            }
            i += 1;
        }

        Ok(ClockConfig {
            oscillators: *osc,
            sysclk,
            sysclk_freq,
            pll,
            dividers,
            mco1: o.mco1,
            mco2: o.mco2,
        })
    }
}

#[derive(Clone, Copy)]
struct Factors {
    m: u8,
    n: u16,
    p: u8,
    q: u8,
    r: u8,
}

impl Factors {
    const fn apply(self, o: &Overrides) -> Self {
        Self {
            m: match o.pll_m {
                Some(m) => m,
                None => self.m,
            },
            n: match o.pll_n {
                Some(n) => n,
                None => self.n,
            },
            p: match o.pll_p {
                Some(p) => p,
                None => self.p,
            },
            q: match o.pll_q {
                Some(q) => q,
                None => self.q,
            },
            r: match o.pll_r {
                Some(r) => r,
                None => self.r,
            },
        }
    }

    const fn with_source(self, source: PllSource) -> PllConfig {
        PllConfig {
            source,
            m: self.m,
            n: self.n,
            p: self.p,
            q: self.q,
            r: self.r,
        }
    }
}

const fn factors(m: u8, n: u16, p: u8, q: u8, r: u8) -> Factors {
    Factors { m, n, p, q, r }
}

/// Known-good 208 MHz factors, by PLL source and oscillator frequency.
const DEFAULT_FACTORS: [(PllSource, Hertz, Factors); 4] = [
    (PllSource::Hse, Hertz::mhz(24), factors(2, 52, 3, 13, 3)),
    (PllSource::Hse, Hertz::mhz(16), factors(1, 39, 3, 13, 3)),
    (PllSource::Hsi, Hertz::mhz(64), factors(4, 25, 2, 13, 37)),
    (PllSource::Hsi, Hertz::mhz(16), factors(1, 39, 3, 13, 3)),
];

const fn default_factors(source: PllSource, input: Hertz, target: Hertz) -> Option<Factors> {
    if target.0 != DEFAULT_TARGET.0 {
        return None;
    }
    let mut i = 0;
    while i < DEFAULT_FACTORS.len() {
        let (s, freq, f) = DEFAULT_FACTORS[i];
        if s as u8 == source as u8 && freq.0 == input.0 {
            return Some(f);
        }
        i += 1;
    }
    None
}

/// Exhaustive search for the M/N/P combination whose P output is closest to `target`.
///
/// Overridden factors are held fixed. Ties go to the smallest M, then the smallest N.
const fn search(input: Hertz, target: Hertz, o: &Overrides) -> Result<Factors, ConfigError> {
    let (m_lo, m_hi) = match o.pll_m {
        Some(m) => (m as u32, m as u32),
        None => (PLL_M_MIN, PLL_M_MAX),
    };
    let (n_lo, n_hi) = match o.pll_n {
        Some(n) => (n as u32, n as u32),
        None => (PLL_N_MIN, PLL_N_MAX),
    };

    let mut reference_ok = false;
    let mut best: Option<Factors> = None;
    let mut best_vco = 0u64;
    let mut best_err = u64::MAX;

    let mut m = m_lo;
    while m <= m_hi {
        let reference = input.0 / m;
        if reference >= PLL_REF_MIN.0 && reference <= PLL_REF_MAX.0 {
            reference_ok = true;
            let mut n = n_lo;
            while n <= n_hi {
                let vco = input.0 as u64 * n as u64 / m as u64;
                if vco >= VCO_MIN.0 as u64 && vco <= VCO_MAX.0 as u64 {
                    let p = match o.pll_p {
                        Some(p) => p as u64,
                        None => clamp_div((vco + target.0 as u64 / 2) / target.0 as u64),
                    };
                    let out = vco / p;
                    let err = out.abs_diff(target.0 as u64);
                    if out <= PLL_OUT_MAX.0 as u64 && err < best_err {
                        best_err = err;
                        best_vco = vco;
                        best = Some(factors(m as u8, n as u16, p as u8, 0, 0));
                    }
                }
                n += 1;
            }
        }
        m += 1;
    }

    if !reference_ok {
        return Err(ConfigError::NoValidInputDivider);
    }
    let Some(mut found) = best else {
        return Err(ConfigError::VcoOutOfRange);
    };

    found.q = match o.pll_q {
        Some(q) => q,
        None => {
            let q_target = PLL_Q_TARGET.0 as u64;
            clamp_div((best_vco + q_target - 1) / q_target) as u8
        }
    };
    found.r = match o.pll_r {
        Some(r) => r,
        None => found.p,
    };
    Ok(found)
}

const fn clamp_div(div: u64) -> u64 {
    if div < PLL_DIV_MIN as u64 {
        PLL_DIV_MIN as u64
    } else if div > PLL_DIV_MAX as u64 {
        PLL_DIV_MAX as u64
    } else {
        div
    }
}

const fn within_tolerance(actual: Hertz, target: Hertz) -> bool {
    (actual.0.abs_diff(target.0) as u64) * 100 <= target.0 as u64 * TOLERANCE_PERCENT as u64
}

const fn has_factor_overrides(o: &Overrides) -> bool {
    o.pll_m.is_some() || o.pll_n.is_some() || o.pll_p.is_some() || o.pll_q.is_some() || o.pll_r.is_some()
}

const fn div_in_range(div: Option<u8>) -> bool {
    match div {
        Some(d) => d as u32 >= PLL_DIV_MIN && d as u32 <= PLL_DIV_MAX,
        None => true,
    }
}

const fn check_overridden_factors(o: &Overrides) -> Result<(), ConfigError> {
    if let Some(m) = o.pll_m {
        if (m as u32) < PLL_M_MIN || m as u32 > PLL_M_MAX {
            return Err(ConfigError::FactorOutOfRange { factor: PllFactor::M });
        }
    }
    if let Some(n) = o.pll_n {
        if (n as u32) < PLL_N_MIN || n as u32 > PLL_N_MAX {
            return Err(ConfigError::FactorOutOfRange { factor: PllFactor::N });
        }
    }
    if !div_in_range(o.pll_p) {
        return Err(ConfigError::FactorOutOfRange { factor: PllFactor::P });
    }
    if !div_in_range(o.pll_q) {
        return Err(ConfigError::FactorOutOfRange { factor: PllFactor::Q });
    }
    if !div_in_range(o.pll_r) {
        return Err(ConfigError::FactorOutOfRange { factor: PllFactor::R });
    }
    Ok(())
}

const fn check_pll(pll: &PllConfig, input: Hertz) -> Result<(), ConfigError> {
    let reference = pll.ref_freq(input);
    if reference.0 < PLL_REF_MIN.0 || reference.0 > PLL_REF_MAX.0 {
        return Err(ConfigError::NoValidInputDivider);
    }
    let vco = pll.vco_freq(input);
    if vco.0 < VCO_MIN.0 || vco.0 > VCO_MAX.0 {
        return Err(ConfigError::VcoOutOfRange);
    }
    if pll.p_freq(input).0 > PLL_OUT_MAX.0 {
        return Err(ConfigError::PllOutputTooHigh { factor: PllFactor::P });
    }
    if pll.q_freq(input).0 > PLL_OUT_MAX.0 {
        return Err(ConfigError::PllOutputTooHigh { factor: PllFactor::Q });
    }
    if pll.r_freq(input).0 > PLL_OUT_MAX.0 {
        return Err(ConfigError::PllOutputTooHigh { factor: PllFactor::R });
    }
    Ok(())
}

const fn mco_div_in_range(div: u8) -> bool {
    div >= 1 && div <= 16
}

const fn check_mco(osc: &OscillatorSet, o: &Overrides) -> Result<(), ConfigError> {
    if let Some(mco) = o.mco1 {
        if !mco_div_in_range(mco.div) {
            return Err(ConfigError::McoDividerOutOfRange);
        }
        match mco.source {
            Mco1Source::Hse if osc.hse.is_none() => return Err(ConfigError::MissingHse),
            Mco1Source::Lse if !osc.lse => return Err(ConfigError::MissingLse),
            _ => {}
        }
    }
    if let Some(mco) = o.mco2 {
        if !mco_div_in_range(mco.div) {
            return Err(ConfigError::McoDividerOutOfRange);
        }
        if let Mco2Source::Hse = mco.source {
            if osc.hse.is_none() {
                return Err(ConfigError::MissingHse);
            }
        }
    }
    Ok(())
}
