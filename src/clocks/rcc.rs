//! RCC register map and access
//!
//! Only the registers touched by the MCU clock bring-up are described here. Offsets
//! and bit positions follow the STM32MP15 reference manual (RM0436, "RCC registers").

use tock_registers::fields::{Field, FieldValue};
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs, RegisterLongName};

// MCU-side view of the RCC block
register_structs! {
    pub RccBlock {
        (0x000 => _reserved0),
        (0x00C => ocensetr: ReadWrite<u32, OCEN::Register>),
        (0x010 => ocenclrr: ReadWrite<u32, OCEN::Register>),
        (0x014 => _reserved1),
        (0x048 => mssckselr: ReadWrite<u32, MSSCKSELR::Register>),
        (0x04C => _reserved2),
        (0x800 => mco1cfgr: ReadWrite<u32, MCOCFGR::Register>),
        (0x804 => mco2cfgr: ReadWrite<u32, MCOCFGR::Register>),
        (0x808 => ocrdyr: ReadWrite<u32, OCRDYR::Register>),
        (0x80C => _reserved3),
        (0x820 => rck3selr: ReadWrite<u32, RCK3SELR::Register>),
        (0x824 => _reserved4),
        (0x830 => mcudivr: ReadWrite<u32, MCUDIVR::Register>),
        (0x834 => apb1divr: ReadWrite<u32, APBDIVR::Register>),
        (0x838 => apb2divr: ReadWrite<u32, APBDIVR::Register>),
        (0x83C => apb3divr: ReadWrite<u32, APBDIVR::Register>),
        (0x840 => _reserved5),
        (0x880 => pll3cr: ReadWrite<u32, PLL3CR::Register>),
        (0x884 => pll3cfgr1: ReadWrite<u32, PLL3CFGR1::Register>),
        (0x888 => pll3cfgr2: ReadWrite<u32, PLL3CFGR2::Register>),
        (0x88C => @END),
    }
}

register_bitfields![u32,
    // Oscillator enables. OCENSETR sets, OCENCLRR clears, both read back the enables.
    pub OCEN [
        HSION OFFSET(0) NUMBITS(1) [],
        CSION OFFSET(4) NUMBITS(1) [],
        HSEON OFFSET(8) NUMBITS(1) []
    ],
    pub OCRDYR [
        HSIRDY OFFSET(0) NUMBITS(1) [],
        CSIRDY OFFSET(4) NUMBITS(1) [],
        HSERDY OFFSET(8) NUMBITS(1) []
    ],
    pub MSSCKSELR [
        MCUSSRC OFFSET(0) NUMBITS(2) [
            Hsi = 0,
            Hse = 1,
            Csi = 2,
            Pll3P = 3
        ],
        MCUSSRCRDY OFFSET(31) NUMBITS(1) []
    ],
    // Shared by MCO1CFGR and MCO2CFGR
    pub MCOCFGR [
        MCOSEL OFFSET(0) NUMBITS(3) [],
        MCODIV OFFSET(4) NUMBITS(4) [],
        MCOON OFFSET(12) NUMBITS(1) []
    ],
    pub RCK3SELR [
        PLL3SRC OFFSET(0) NUMBITS(2) [
            Hsi = 0,
            Hse = 1
        ],
        PLL3SRCRDY OFFSET(31) NUMBITS(1) []
    ],
    pub MCUDIVR [
        MCUDIV OFFSET(0) NUMBITS(4) [],
        MCUDIVRDY OFFSET(31) NUMBITS(1) []
    ],
    // Shared by APB1DIVR, APB2DIVR and APB3DIVR
    pub APBDIVR [
        APBDIV OFFSET(0) NUMBITS(3) [],
        APBDIVRDY OFFSET(31) NUMBITS(1) []
    ],
    pub PLL3CR [
        PLLON OFFSET(0) NUMBITS(1) [],
        PLL3RDY OFFSET(1) NUMBITS(1) [],
        DIVPEN OFFSET(4) NUMBITS(1) [],
        DIVQEN OFFSET(5) NUMBITS(1) [],
        DIVREN OFFSET(6) NUMBITS(1) []
    ],
    // Factors are stored minus one
    pub PLL3CFGR1 [
        DIVN OFFSET(0) NUMBITS(9) [],
        DIVM3 OFFSET(16) NUMBITS(6) [],
        IFRGE OFFSET(24) NUMBITS(2) [
            Range4To8MHz = 0,
            Range8To16MHz = 1
        ]
    ],
    // Post-dividers are stored minus one
    pub PLL3CFGR2 [
        DIVP OFFSET(0) NUMBITS(7) [],
        DIVQ OFFSET(8) NUMBITS(7) [],
        DIVR OFFSET(16) NUMBITS(7) []
    ]
];

/// RCC registers used during clock bring-up, by byte offset from the RCC base.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(usize)]
pub enum Reg {
    Ocensetr = 0x00C,
    Ocenclrr = 0x010,
    Mssckselr = 0x048,
    Mco1cfgr = 0x800,
    Mco2cfgr = 0x804,
    Ocrdyr = 0x808,
    Rck3selr = 0x820,
    Mcudivr = 0x830,
    Apb1divr = 0x834,
    Apb2divr = 0x838,
    Apb3divr = 0x83C,
    Pll3cr = 0x880,
    Pll3cfgr1 = 0x884,
    Pll3cfgr2 = 0x888,
}

impl Reg {
    /// Byte offset from the RCC base address.
    pub const fn offset(self) -> usize {
        self as usize
    }
}

/// Access to the RCC register block.
///
/// The clock sequencer is generic over this trait so the memory-mapped block can be
/// replaced with a test double. Implementations assume exclusive access for the whole
/// sequencer run and do no locking of their own.
pub trait RccRegisters {
    /// Read a whole register.
    fn read(&mut self, reg: Reg) -> u32;

    /// Write a whole register.
    fn write(&mut self, reg: Reg, value: u32);

    /// Block until `read(reg) & mask == expected`.
    ///
    /// There is no timeout. A flag that never reaches the expected value stalls the
    /// caller forever, which is the only sane outcome halfway through a clock switch.
    fn wait_until(&mut self, reg: Reg, mask: u32, expected: u32);

    /// Read a single field.
    fn read_field<R: RegisterLongName>(&mut self, reg: Reg, field: Field<u32, R>) -> u32 {
        field.read(self.read(reg))
    }

    /// Overwrite the register with `value`, every other field reading as zero.
    fn write_value<R: RegisterLongName>(&mut self, reg: Reg, value: FieldValue<u32, R>) {
        self.write(reg, value.value)
    }

    /// Read-modify-write the fields in `value`, leaving the rest of the register untouched.
    fn modify<R: RegisterLongName>(&mut self, reg: Reg, value: FieldValue<u32, R>) {
        let raw = self.read(reg);
        self.write(reg, value.modify(raw));
    }

    /// Set a single field to `value`, leaving the rest of the register untouched.
    fn write_field<R: RegisterLongName>(&mut self, reg: Reg, field: Field<u32, R>, value: u32) {
        self.modify(reg, field.val(value))
    }

    /// Block until `field` reads as `value`.
    fn wait_field<R: RegisterLongName>(&mut self, reg: Reg, field: Field<u32, R>, value: u32) {
        self.wait_until(reg, field.mask << field.shift, field.val(value).value)
    }
}

impl<T: RccRegisters + ?Sized> RccRegisters for &mut T {
    fn read(&mut self, reg: Reg) -> u32 {
        T::read(self, reg)
    }

    fn write(&mut self, reg: Reg, value: u32) {
        T::write(self, reg, value)
    }

    fn wait_until(&mut self, reg: Reg, mask: u32, expected: u32) {
        T::wait_until(self, reg, mask, expected)
    }
}

/// The memory-mapped RCC block.
pub struct Rcc {
    registers: &'static RccBlock,
}

impl Rcc {
    /// RCC base address as seen from the Cortex-M4.
    pub const BASE: usize = 0x5000_0000;

    /// Bind to the RCC block at its fixed address.
    ///
    /// # Safety
    ///
    /// Only one `Rcc` may exist at a time, and nothing else may touch the RCC
    /// registers while the clock sequencer runs.
    pub unsafe fn steal() -> Self {
        Self::from_ptr(Self::BASE as *const RccBlock)
    }

    /// Bind to an RCC block at a custom address.
    ///
    /// # Safety
    ///
    /// `base` must point to a register block with the RCC layout that stays valid for
    /// the rest of the program, with the same exclusivity rules as [`Rcc::steal`].
    pub unsafe fn from_ptr(base: *const RccBlock) -> Self {
        Self { registers: &*base }
    }
}

impl RccRegisters for Rcc {
    fn read(&mut self, reg: Reg) -> u32 {
        let regs = self.registers;
        match reg {
            Reg::Ocensetr => regs.ocensetr.get(),
            Reg::Ocenclrr => regs.ocenclrr.get(),
            Reg::Mssckselr => regs.mssckselr.get(),
            Reg::Mco1cfgr => regs.mco1cfgr.get(),
            Reg::Mco2cfgr => regs.mco2cfgr.get(),
            Reg::Ocrdyr => regs.ocrdyr.get(),
            Reg::Rck3selr => regs.rck3selr.get(),
            Reg::Mcudivr => regs.mcudivr.get(),
            Reg::Apb1divr => regs.apb1divr.get(),
            Reg::Apb2divr => regs.apb2divr.get(),
            Reg::Apb3divr => regs.apb3divr.get(),
            Reg::Pll3cr => regs.pll3cr.get(),
            Reg::Pll3cfgr1 => regs.pll3cfgr1.get(),
            Reg::Pll3cfgr2 => regs.pll3cfgr2.get(),
        }
    }

    fn write(&mut self, reg: Reg, value: u32) {
        let regs = self.registers;
        match reg {
            Reg::Ocensetr => regs.ocensetr.set(value),
            Reg::Ocenclrr => regs.ocenclrr.set(value),
            Reg::Mssckselr => regs.mssckselr.set(value),
            Reg::Mco1cfgr => regs.mco1cfgr.set(value),
            Reg::Mco2cfgr => regs.mco2cfgr.set(value),
            Reg::Ocrdyr => regs.ocrdyr.set(value),
            Reg::Rck3selr => regs.rck3selr.set(value),
            Reg::Mcudivr => regs.mcudivr.set(value),
            Reg::Apb1divr => regs.apb1divr.set(value),
            Reg::Apb2divr => regs.apb2divr.set(value),
            Reg::Apb3divr => regs.apb3divr.set(value),
            Reg::Pll3cr => regs.pll3cr.set(value),
            Reg::Pll3cfgr1 => regs.pll3cfgr1.set(value),
            Reg::Pll3cfgr2 => regs.pll3cfgr2.set(value),
        }
    }

    fn wait_until(&mut self, reg: Reg, mask: u32, expected: u32) {
        while self.read(reg) & mask != expected {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use tock_registers::LocalRegisterCopy;

    use super::*;

    #[test]
    fn field_values_land_on_the_documented_bits() {
        let cfgr1 = PLL3CFGR1::DIVN.val(51) + PLL3CFGR1::DIVM3.val(1) + PLL3CFGR1::IFRGE::Range8To16MHz;
        assert_eq!(cfgr1.value, 0x0101_0033);
        let cfgr2 = PLL3CFGR2::DIVP.val(2) + PLL3CFGR2::DIVQ.val(12) + PLL3CFGR2::DIVR.val(2);
        assert_eq!(cfgr2.value, 0x0002_0c02);
        assert_eq!(MCOCFGR::MCOON::SET.value, 1 << 12);
        assert_eq!(PLL3CR::PLL3RDY::SET.value, 1 << 1);
        assert_eq!(MSSCKSELR::MCUSSRC::Pll3P.value, 3);
    }

    #[test]
    fn local_copy_decodes_fields() {
        let cfgr2 = LocalRegisterCopy::<u32, PLL3CFGR2::Register>::new(0x0002_0c02);
        assert_eq!(cfgr2.read(PLL3CFGR2::DIVQ), 12);
        assert_eq!(cfgr2.read(PLL3CFGR2::DIVR), 2);

        let sel = LocalRegisterCopy::<u32, MSSCKSELR::Register>::new(0x8000_0003);
        assert!(sel.is_set(MSSCKSELR::MCUSSRCRDY));
        assert_eq!(
            sel.read_as_enum(MSSCKSELR::MCUSSRC),
            Some(MSSCKSELR::MCUSSRC::Value::Pll3P)
        );
    }

    #[test]
    fn block_layout_matches_offsets() {
        assert_eq!(core::mem::size_of::<RccBlock>(), 0x88C);

        let block: &'static mut [u32; 0x88C / 4] = Box::leak(Box::new([0u32; 0x88C / 4]));
        let base = block.as_mut_ptr();
        let mut rcc = unsafe { Rcc::from_ptr(base as *const RccBlock) };

        rcc.write(Reg::Pll3cfgr1, 0x0100_0033);
        rcc.modify(Reg::Pll3cfgr1, PLL3CFGR1::DIVM3.val(1));
        assert_eq!(rcc.read(Reg::Pll3cfgr1), 0x0101_0033);
        assert_eq!(rcc.read_field(Reg::Pll3cfgr1, PLL3CFGR1::DIVN), 0x33);

        rcc.write_field(Reg::Pll3cfgr1, PLL3CFGR1::DIVN, 0x19);
        assert_eq!(rcc.read(Reg::Pll3cfgr1), 0x0101_0019);
        rcc.write_field(Reg::Pll3cfgr1, PLL3CFGR1::DIVN, 0x33);

        rcc.write_value(Reg::Mcudivr, MCUDIVR::MCUDIVRDY::SET);
        rcc.wait_field(Reg::Mcudivr, MCUDIVR::MCUDIVRDY, 1);

        drop(rcc);
        let words = unsafe { core::slice::from_raw_parts(base, 0x88C / 4) };
        assert_eq!(words[Reg::Pll3cfgr1.offset() / 4], 0x0101_0033);
        assert_eq!(words[Reg::Mcudivr.offset() / 4], 1 << 31);
    }
}
