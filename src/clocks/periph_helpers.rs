//! Peripheral kernel clock descriptors
//!
//! Peripheral drivers describe which bus they sit on and which kernel clock feeds
//! them; the descriptor turns that into a frequency once [`init`](super::init) has run.

use super::config::Bus;
use super::{ClockError, Clocks};
use crate::time::Hertz;

/// A peripheral clock description that can be resolved against the active clock tree.
pub trait PeriphClockSource {
    /// Frequency of the peripheral's kernel clock.
    fn source_frequency(&self, clocks: &Clocks) -> Result<Hertz, ClockError>;
}

/// USART/UART kernel clock selection (`UARTxxCKSELR`)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UartClockSource {
    /// Clock of the bus the UART sits on
    Pclk = 0,
    Pll4Q = 1,
    Hsi = 2,
    Csi = 3,
    Hse = 4,
}

/// Bus and kernel clock of one UART instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UartClockConfig {
    pub bus: Bus,
    pub source: UartClockSource,
}

impl PeriphClockSource for UartClockConfig {
    fn source_frequency(&self, clocks: &Clocks) -> Result<Hertz, ClockError> {
        match self.source {
            UartClockSource::Pclk => match self.bus {
                Bus::Mcu => Err(ClockError::bad_config("uart must sit on an apb bus")),
                bus => Ok(clocks.bus(bus)),
            },
            UartClockSource::Hsi => Ok(clocks.hsi),
            UartClockSource::Hse => clocks.ensure_hse(),
            // PLL4 and the CSI belong to the MPU side and are never started here
            UartClockSource::Pll4Q => Err(ClockError::bad_config("pll4 is not managed by the mcu")),
            UartClockSource::Csi => Err(ClockError::bad_config("csi is not enabled")),
        }
    }
}
