//! Board clock descriptions

/// STM32MP157C-DK2 discovery kit
pub mod stm32mp157c_dk2 {
    use crate::clocks::config::{Bus, ClockConfig, ClockSetup, OscillatorSet, Overrides};
    use crate::clocks::periph_helpers::{UartClockConfig, UartClockSource};
    use crate::time::Hertz;

    /// 24 MHz HSE crystal, 32.768 kHz LSE crystal.
    pub const OSCILLATORS: OscillatorSet = OscillatorSet::new().with_hse(Hertz::mhz(24)).with_lse(true);

    pub const CORE_CLOCK: Hertz = Hertz::mhz(208);

    pub const OVERRIDES: Overrides = Overrides::new()
        .with_pll_m(2)
        .with_pll_n(52)
        .with_pll_p(3)
        .with_pll_q(13);

    pub const CLOCK_CONFIG: ClockConfig = ClockSetup::new(OSCILLATORS, CORE_CLOCK)
        .with_overrides(OVERRIDES)
        .checked();

    /// Console UART (ST-LINK virtual COM port)
    pub const USART3: UartClockConfig = UartClockConfig {
        bus: Bus::Apb1,
        source: UartClockSource::Hse,
    };

}
