use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::config::{
    ApbDiv, Bus, ClockConfig, ClockSetup, Mco1Source, Mco2Source, OscillatorSet, Overrides, PllSource, SysClkSource,
};
use super::rcc::{Reg, RccRegisters, MCUDIVR, MSSCKSELR, OCEN, OCRDYR, PLL3CR};
use super::*;
use crate::boards::stm32mp157c_dk2;
use crate::time::Hertz;

// Every mux and divider register acknowledges in bit 31
const RDY: u32 = MCUDIVR::MCUDIVRDY::SET.value;

const HSION: u32 = OCEN::HSION::SET.value;
const CSION: u32 = OCEN::CSION::SET.value;
const HSEON: u32 = OCEN::HSEON::SET.value;
const HSIRDY: u32 = OCRDYR::HSIRDY::SET.value;
const HSERDY: u32 = OCRDYR::HSERDY::SET.value;
const PLLON: u32 = PLL3CR::PLLON::SET.value;
const PLL3RDY: u32 = PLL3CR::PLL3RDY::SET.value;
const SRC_HSI: u32 = MSSCKSELR::MCUSSRC::Hsi.value;
const SRC_PLL3P: u32 = MSSCKSELR::MCUSSRC::Pll3P.value;

/// Polls a wait may spend before the mock declares the flag stuck.
const POLL_BUDGET: u32 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Write(Reg, u32),
    Wait(Reg, u32, u32),
}

/// Software model of the RCC registers used by the sequencer.
///
/// Ready flags follow their enables after `latency` polls. Flags listed in `stuck` never
/// assert, flags in `held` never drop, and writes listed in `ignored` are never
/// acknowledged. A wait on any of them panics once the poll budget is spent.
struct MockRcc {
    regs: BTreeMap<Reg, u32>,
    enabled: u32,
    pending: Vec<(Reg, u32, u32)>,
    stuck: Vec<(Reg, u32)>,
    held: Vec<(Reg, u32)>,
    ignored: Vec<(Reg, u32)>,
    latency: u32,
    log: Vec<Op>,
}

impl MockRcc {
    /// Reset state: HSI running and selected, every mux and divider acknowledged.
    fn new() -> Self {
        let mut regs = BTreeMap::new();
        regs.insert(Reg::Ocrdyr, HSIRDY);
        regs.insert(Reg::Mssckselr, RDY);
        regs.insert(Reg::Rck3selr, RDY);
        regs.insert(Reg::Mcudivr, RDY);
        regs.insert(Reg::Apb1divr, RDY);
        regs.insert(Reg::Apb2divr, RDY);
        regs.insert(Reg::Apb3divr, RDY);
        regs.insert(Reg::Pll3cr, 0);
        Self {
            regs,
            enabled: HSION,
            pending: Vec::new(),
            stuck: Vec::new(),
            held: Vec::new(),
            ignored: Vec::new(),
            latency: 0,
            log: Vec::new(),
        }
    }

    fn with_latency(mut self, polls: u32) -> Self {
        self.latency = polls;
        self
    }

    fn with_stuck(mut self, reg: Reg, bit: u32) -> Self {
        self.stuck.push((reg, bit));
        *self.reg(reg) &= !bit;
        self
    }

    fn with_held_high(mut self, reg: Reg, bit: u32) -> Self {
        self.held.push((reg, bit));
        *self.reg(reg) |= bit;
        self
    }

    fn with_unacknowledged(mut self, reg: Reg, value: u32) -> Self {
        self.ignored.push((reg, value));
        self
    }

    fn reg(&mut self, reg: Reg) -> &mut u32 {
        self.regs.entry(reg).or_insert(0)
    }

    fn set_later(&mut self, reg: Reg, bit: u32) {
        if self.stuck.contains(&(reg, bit)) {
            return;
        }
        if self.latency == 0 {
            *self.reg(reg) |= bit;
        } else {
            self.pending.retain(|&(r, b, _)| (r, b) != (reg, bit));
            self.pending.push((reg, bit, self.latency));
        }
    }

    fn clear_now(&mut self, reg: Reg, bit: u32) {
        let held = self
            .held
            .iter()
            .filter(|&&(r, _)| r == reg)
            .fold(0, |acc, &(_, b)| acc | b);
        let bit = bit & !held;
        self.pending.retain(|&(r, b, _)| !(r == reg && b & bit != 0));
        *self.reg(reg) &= !bit;
    }

    fn tick(&mut self) {
        let mut due = Vec::new();
        for (reg, bit, polls) in self.pending.iter_mut() {
            *polls -= 1;
            if *polls == 0 {
                due.push((*reg, *bit));
            }
        }
        self.pending.retain(|&(_, _, polls)| polls > 0);
        for (reg, bit) in due {
            *self.reg(reg) |= bit;
        }
    }

    fn writes_to(&self, reg: Reg) -> Vec<u32> {
        self.log
            .iter()
            .filter_map(|op| match *op {
                Op::Write(r, v) if r == reg => Some(v),
                _ => None,
            })
            .collect()
    }
}

impl RccRegisters for MockRcc {
    fn read(&mut self, reg: Reg) -> u32 {
        match reg {
            Reg::Ocensetr | Reg::Ocenclrr => self.enabled,
            _ => *self.reg(reg),
        }
    }

    fn write(&mut self, reg: Reg, value: u32) {
        self.log.push(Op::Write(reg, value));
        let oscillators = HSION | CSION | HSEON;
        match reg {
            Reg::Ocensetr => {
                self.enabled |= value & oscillators;
                // Ready flags sit on the same bits as their enables
                for bit in [HSION, CSION, HSEON] {
                    if value & bit != 0 {
                        self.set_later(Reg::Ocrdyr, bit);
                    }
                }
            }
            Reg::Ocenclrr => {
                self.enabled &= !(value & oscillators);
                self.clear_now(Reg::Ocrdyr, value & oscillators);
            }
            Reg::Mssckselr | Reg::Rck3selr | Reg::Mcudivr | Reg::Apb1divr | Reg::Apb2divr | Reg::Apb3divr => {
                *self.reg(reg) = value & !RDY;
                if !self.ignored.contains(&(reg, value & !RDY)) {
                    self.set_later(reg, RDY);
                }
            }
            Reg::Pll3cr => {
                let locked = *self.reg(reg) & PLL3RDY;
                *self.reg(reg) = (value & !PLL3RDY) | locked;
                if value & PLLON == 0 {
                    self.clear_now(reg, PLL3RDY);
                } else if locked == 0 {
                    self.set_later(reg, PLL3RDY);
                }
            }
            Reg::Ocrdyr => {}
            _ => *self.reg(reg) = value,
        }
    }

    fn wait_until(&mut self, reg: Reg, mask: u32, expected: u32) {
        self.log.push(Op::Wait(reg, mask, expected));
        for _ in 0..POLL_BUDGET {
            if self.read(reg) & mask == expected {
                return;
            }
            self.tick();
        }
        panic!("{:?} & {:#x} never became {:#x}", reg, mask, expected);
    }
}

fn run(config: &ClockConfig, rcc: &mut MockRcc) -> Clocks {
    ClockOperator::new(config, rcc).run().unwrap()
}

/// Run a sequence that is expected to hang, returning the state it hung in.
fn run_stuck(config: &ClockConfig, rcc: &mut MockRcc) -> ClockState {
    let mut op = ClockOperator::new(config, rcc);
    let result = catch_unwind(AssertUnwindSafe(|| op.run()));
    assert!(result.is_err(), "sequence completed despite a stuck flag");
    op.state()
}

fn wait_rdy(reg: Reg) -> Op {
    Op::Wait(reg, RDY, RDY)
}

#[test]
fn dk2_register_sequence() {
    let mut rcc = MockRcc::new();
    let mut op = ClockOperator::new(&stm32mp157c_dk2::CLOCK_CONFIG, &mut rcc);
    op.run().unwrap();
    assert_eq!(op.state(), ClockState::PllActive);

    let expected = [
        // HSI on
        Op::Write(Reg::Ocensetr, HSION),
        Op::Wait(Reg::Ocrdyr, HSIRDY, HSIRDY),
        // MCU /1, APBx /2
        Op::Write(Reg::Mcudivr, 0),
        wait_rdy(Reg::Mcudivr),
        Op::Write(Reg::Apb1divr, 1),
        wait_rdy(Reg::Apb1divr),
        Op::Write(Reg::Apb2divr, 1),
        wait_rdy(Reg::Apb2divr),
        Op::Write(Reg::Apb3divr, 1),
        wait_rdy(Reg::Apb3divr),
        // HSI pinned
        Op::Write(Reg::Mssckselr, SRC_HSI),
        wait_rdy(Reg::Mssckselr),
        // everything else off
        Op::Write(Reg::Ocenclrr, !HSION),
        Op::Write(Reg::Pll3cr, 0),
        Op::Write(Reg::Pll3cr, 0),
        Op::Wait(Reg::Pll3cr, PLL3RDY, 0),
        // HSE on
        Op::Write(Reg::Ocensetr, HSEON),
        Op::Wait(Reg::Ocrdyr, HSERDY, HSERDY),
        // M=2 N=52, 12 MHz reference; P=3 Q=13 R=3
        Op::Write(Reg::Pll3cfgr1, 51 | (1 << 16) | (1 << 24)),
        Op::Write(Reg::Pll3cfgr2, 2 | (12 << 8) | (2 << 16)),
        // source, outputs, lock
        Op::Write(Reg::Rck3selr, 1),
        wait_rdy(Reg::Rck3selr),
        Op::Write(Reg::Pll3cr, 0x70),
        Op::Write(Reg::Pll3cr, 0x71),
        Op::Wait(Reg::Pll3cr, PLL3RDY, PLL3RDY),
        // switch
        Op::Write(Reg::Mssckselr, SRC_PLL3P),
        wait_rdy(Reg::Mssckselr),
    ];
    assert_eq!(rcc.log, expected);
}

#[test]
fn dk2_clocks_read_back() {
    let mut rcc = MockRcc::new();
    let clocks = run(&stm32mp157c_dk2::CLOCK_CONFIG, &mut rcc);

    assert_eq!(clocks.sysclk, SysClkSource::Pll3);
    assert_eq!(clocks.hse, Some(Hertz::mhz(24)));
    assert_eq!(clocks.lse, Some(Hertz::hz(32_768)));
    assert_eq!(clocks.pll3_p, Some(Hertz::mhz(208)));
    assert_eq!(clocks.pll3_q, Some(Hertz::mhz(48)));
    assert_eq!(clocks.pll3_r, Some(Hertz::mhz(208)));

    assert_eq!(clocks.mcu, Hertz::mhz(208));
    assert_eq!(clocks.bus(Bus::Apb1), clocks.mcu / 2);
    assert_eq!(clocks.bus(Bus::Apb2), clocks.mcu / 2);
    assert_eq!(clocks.bus(Bus::Apb3), clocks.mcu / 2);
}

#[test]
fn hsi_only_board_skips_hse() {
    let config = ClockSetup::new(OscillatorSet::new(), Hertz::mhz(208)).checked();
    let mut rcc = MockRcc::new();
    let clocks = run(&config, &mut rcc);

    assert!(!rcc.log.contains(&Op::Write(Reg::Ocensetr, HSEON)));
    // M=4 N=25, 16 MHz reference; P=2 Q=13 R=37
    assert_eq!(rcc.writes_to(Reg::Pll3cfgr1), [24 | (3 << 16) | (1 << 24)]);
    assert_eq!(rcc.writes_to(Reg::Pll3cfgr2), [1 | (12 << 8) | (36 << 16)]);
    assert_eq!(rcc.writes_to(Reg::Rck3selr), [0]);

    assert_eq!(clocks.hse, None);
    assert_eq!(clocks.mcu, Hertz::mhz(200));
    assert_eq!(clocks.apb1, Hertz::mhz(100));
}

#[test]
fn hsi_system_clock_leaves_pll_off() {
    let config = ClockSetup::new(stm32mp157c_dk2::OSCILLATORS, Hertz::mhz(64))
        .with_overrides(Overrides::new().with_sysclk(SysClkSource::Hsi))
        .checked();
    let mut rcc = MockRcc::new();
    let mut op = ClockOperator::new(&config, &mut rcc);
    let clocks = op.run().unwrap();
    assert_eq!(op.state(), ClockState::HsiActive);

    assert!(rcc.writes_to(Reg::Pll3cfgr1).is_empty());
    assert!(rcc.writes_to(Reg::Rck3selr).is_empty());
    assert_eq!(rcc.writes_to(Reg::Mssckselr), [SRC_HSI]);

    assert_eq!(clocks.sysclk, SysClkSource::Hsi);
    assert_eq!(clocks.pll3_p, None);
    assert_eq!(clocks.mcu, Hertz::mhz(64));
    assert_eq!(clocks.apb3, Hertz::mhz(32));
}

#[test]
fn hsi_fed_pll_still_starts_fitted_hse() {
    let config = ClockSetup::new(stm32mp157c_dk2::OSCILLATORS, Hertz::mhz(208))
        .with_overrides(Overrides::new().with_pll_source(PllSource::Hsi))
        .checked();
    let mut rcc = MockRcc::new();
    let clocks = run(&config, &mut rcc);

    assert!(rcc.log.contains(&Op::Write(Reg::Ocensetr, HSEON)));
    assert_eq!(rcc.writes_to(Reg::Rck3selr), [0]);

    assert_eq!(clocks.hse, Some(Hertz::mhz(24)));
    assert_eq!(clocks.pll3_p, Some(Hertz::mhz(200)));
    assert_eq!(clocks.mcu, Hertz::mhz(200));
}

#[test]
fn slow_flags_are_waited_for() {
    let mut immediate = MockRcc::new();
    let expected = run(&stm32mp157c_dk2::CLOCK_CONFIG, &mut immediate);

    let mut slow = MockRcc::new().with_latency(25);
    let clocks = run(&stm32mp157c_dk2::CLOCK_CONFIG, &mut slow);

    assert_eq!(clocks, expected);
    assert_eq!(slow.log, immediate.log);
}

#[test]
fn mco_outputs_follow_reset() {
    let config = ClockSetup::new(stm32mp157c_dk2::OSCILLATORS, Hertz::mhz(208))
        .with_overrides(
            Overrides::new()
                .with_mco1(Mco1Source::Hse, 2)
                .with_mco2(Mco2Source::Mcu, 4),
        )
        .checked();
    let mut rcc = MockRcc::new();
    let clocks = run(&config, &mut rcc);

    let mco1 = Op::Write(Reg::Mco1cfgr, 1 | (1 << 4) | (1 << 12));
    let mco2 = Op::Write(Reg::Mco2cfgr, 2 | (3 << 4) | (1 << 12));
    let position = |op: Op| rcc.log.iter().position(|&o| o == op).unwrap();

    let reset_done = position(Op::Wait(Reg::Pll3cr, PLL3RDY, 0));
    let hse_on = position(Op::Write(Reg::Ocensetr, HSEON));
    assert!(reset_done < position(mco1) && position(mco1) < position(mco2) && position(mco2) < hse_on);

    assert_eq!(clocks.mco1, Some(Hertz::mhz(12)));
    assert_eq!(clocks.mco2, Some(Hertz::mhz(52)));
}

#[test]
fn stuck_hsi_never_leaves_reset() {
    let mut rcc = MockRcc::new().with_stuck(Reg::Ocrdyr, HSIRDY);
    let state = run_stuck(&stm32mp157c_dk2::CLOCK_CONFIG, &mut rcc);

    assert_eq!(state, ClockState::Reset);
    assert_eq!(rcc.log.last(), Some(&Op::Wait(Reg::Ocrdyr, HSIRDY, HSIRDY)));
    assert!(rcc.writes_to(Reg::Mcudivr).is_empty());
}

#[test]
fn stuck_mcu_divider_stops_before_apb_dividers() {
    let mut rcc = MockRcc::new().with_stuck(Reg::Mcudivr, RDY);
    let state = run_stuck(&stm32mp157c_dk2::CLOCK_CONFIG, &mut rcc);

    assert_eq!(state, ClockState::HsiOnly);
    assert_eq!(rcc.log.last(), Some(&wait_rdy(Reg::Mcudivr)));
    assert!(rcc.writes_to(Reg::Apb1divr).is_empty());
}

#[test]
fn stuck_divider_stops_before_next_divider() {
    let mut rcc = MockRcc::new().with_stuck(Reg::Apb2divr, RDY);
    let state = run_stuck(&stm32mp157c_dk2::CLOCK_CONFIG, &mut rcc);

    assert_eq!(state, ClockState::HsiOnly);
    assert!(rcc.writes_to(Reg::Apb3divr).is_empty());
    assert!(rcc.writes_to(Reg::Mssckselr).is_empty());
}

#[test]
fn unacknowledged_hsi_pin_keeps_oscillators_running() {
    let mut rcc = MockRcc::new().with_stuck(Reg::Mssckselr, RDY);
    let state = run_stuck(&stm32mp157c_dk2::CLOCK_CONFIG, &mut rcc);

    assert_eq!(state, ClockState::DividersSet);
    assert_eq!(rcc.log.last(), Some(&wait_rdy(Reg::Mssckselr)));
    assert!(rcc.writes_to(Reg::Ocenclrr).is_empty());
    assert!(rcc.writes_to(Reg::Pll3cr).is_empty());
}

#[test]
fn pll_that_never_stops_blocks_reset() {
    let mut rcc = MockRcc::new().with_held_high(Reg::Pll3cr, PLL3RDY);
    let state = run_stuck(&stm32mp157c_dk2::CLOCK_CONFIG, &mut rcc);

    assert_eq!(state, ClockState::SourcePinned);
    assert_eq!(rcc.log.last(), Some(&Op::Wait(Reg::Pll3cr, PLL3RDY, 0)));
    assert!(!rcc.log.contains(&Op::Write(Reg::Ocensetr, HSEON)));
    assert!(rcc.writes_to(Reg::Pll3cfgr1).is_empty());
}

#[test]
fn missing_hse_hangs_after_reset() {
    let mut rcc = MockRcc::new().with_stuck(Reg::Ocrdyr, HSERDY);
    let state = run_stuck(&stm32mp157c_dk2::CLOCK_CONFIG, &mut rcc);

    assert_eq!(state, ClockState::ClocksReset);
    assert!(rcc.writes_to(Reg::Pll3cfgr1).is_empty());
    assert!(rcc.writes_to(Reg::Rck3selr).is_empty());
}

#[test]
fn unlocked_pll_is_never_selected() {
    let mut rcc = MockRcc::new().with_stuck(Reg::Pll3cr, PLL3RDY);
    let state = run_stuck(&stm32mp157c_dk2::CLOCK_CONFIG, &mut rcc);

    assert_eq!(state, ClockState::PllConfigured);
    assert_eq!(rcc.writes_to(Reg::Mssckselr), [SRC_HSI]);
    assert_eq!(rcc.log.last(), Some(&Op::Wait(Reg::Pll3cr, PLL3RDY, PLL3RDY)));
}

#[test]
fn unacknowledged_switch_stays_locked() {
    let mut rcc = MockRcc::new().with_unacknowledged(Reg::Mssckselr, SRC_PLL3P);
    let state = run_stuck(&stm32mp157c_dk2::CLOCK_CONFIG, &mut rcc);

    assert_eq!(state, ClockState::PllLocked);
    let tail = &rcc.log[rcc.log.len() - 2..];
    assert_eq!(tail, [Op::Write(Reg::Mssckselr, SRC_PLL3P), wait_rdy(Reg::Mssckselr)]);
}

#[test]
fn unacknowledged_pll_source_blocks_enable() {
    let mut rcc = MockRcc::new().with_stuck(Reg::Rck3selr, RDY);
    let state = run_stuck(&stm32mp157c_dk2::CLOCK_CONFIG, &mut rcc);

    assert_eq!(state, ClockState::PllConfigured);
    assert_eq!(rcc.writes_to(Reg::Pll3cr), [0, 0]);
}

#[test]
fn readback_reflects_divider_registers() {
    let config = ClockSetup::new(stm32mp157c_dk2::OSCILLATORS, Hertz::mhz(208))
        .with_overrides(Overrides::new().with_apb2_div(ApbDiv::Div4))
        .checked();
    let mut rcc = MockRcc::new();
    let clocks = run(&config, &mut rcc);

    assert_eq!(rcc.read_field(Reg::Mcudivr, MCUDIVR::MCUDIV), 0);
    assert_eq!(clocks.apb1, Hertz::mhz(104));
    assert_eq!(clocks.apb2, Hertz::mhz(52));
}

// The only test touching the global clock snapshot
#[test]
fn init_stores_clocks_once() {
    assert_eq!(bus_frequency(Bus::Mcu), None);

    let mut rcc = MockRcc::new();
    init(&mut rcc, &stm32mp157c_dk2::CLOCK_CONFIG).unwrap();

    assert_eq!(bus_frequency(Bus::Mcu), Some(Hertz::mhz(208)));
    assert_eq!(bus_frequency(Bus::Apb1), Some(Hertz::mhz(104)));
    assert_eq!(with_clocks(|c| c.sysclk), Some(SysClkSource::Pll3));
    assert_eq!(periph_frequency(&stm32mp157c_dk2::USART3), Ok(Hertz::mhz(24)));

    let writes = rcc.log.len();
    let mut again = MockRcc::new();
    assert_eq!(
        init(&mut again, &stm32mp157c_dk2::CLOCK_CONFIG),
        Err(ClockError::AlreadyConfigured)
    );
    assert!(again.log.is_empty());
    assert_eq!(rcc.log.len(), writes);
}
