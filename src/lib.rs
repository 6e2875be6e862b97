#![cfg_attr(not(test), no_std)]
//! Boot-time clock tree bring-up for the STM32MP1 Cortex-M4 (MCU) side.
//!
//! The clock tree is described once as a `const` [`ClockConfig`](clocks::config::ClockConfig),
//! resolved from board facts at compile time, and activated exactly once at boot by
//! [`clocks::init`]. Drivers read the resulting bus frequencies afterwards through
//! [`clocks::with_clocks`] and friends.
//!
//! ## Feature flags
#![doc = document_features::document_features!(feature_label = r#"<span class="stab portability"><code>{feature}</code></span>"#)]

#[cfg(all(feature = "defmt", feature = "log"))]
compile_error!("You may not enable both `defmt` and `log` features.");

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod boards;
pub mod clocks;
pub mod time;
