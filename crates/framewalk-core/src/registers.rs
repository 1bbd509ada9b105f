//! # DWARF Register Tables
//!
//! Per-architecture mapping from a register name to its DWARF register number,
//! plus the aliases the unwinder cares about: the frame-pointer register, the
//! stack-pointer register and the (possibly pseudo) return-address register.
//!
//! ## References
//!
//! - [System V AMD64 psABI, Figure 3.36: DWARF Register Number Mapping](https://refspecs.linuxbase.org/elf/x86_64-abi-0.99.pdf)
//! - [DWARF for the Arm 64-bit Architecture, 4.1 DWARF register names](https://github.com/ARM-software/abi-aa/blob/main/aadwarf64/aadwarf64.rst)

use crate::types::Architecture;

/// One row of a register table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DwarfRegister
{
    pub name: &'static str,
    pub number: u16,
}

const fn reg(name: &'static str, number: u16) -> DwarfRegister
{
    DwarfRegister { name, number }
}

/// Static register-numbering table for one architecture.
#[derive(Debug)]
pub struct RegisterTable
{
    architecture: Architecture,
    registers: &'static [DwarfRegister],
    /// Registers that only exist in CFI (x86-64's return address column).
    pseudo: &'static [DwarfRegister],
    frame_pointer: u16,
    stack_pointer: u16,
    return_address: u16,
    /// Registers whose value survives a call when CFI says nothing about them.
    callee_saved: &'static [u16],
}

static X86_64_REGISTERS: [DwarfRegister; 16] = [
    reg("RAX", 0),
    reg("RDX", 1),
    reg("RCX", 2),
    reg("RBX", 3),
    reg("RSI", 4),
    reg("RDI", 5),
    reg("RBP", 6),
    reg("RSP", 7),
    reg("R8", 8),
    reg("R9", 9),
    reg("R10", 10),
    reg("R11", 11),
    reg("R12", 12),
    reg("R13", 13),
    reg("R14", 14),
    reg("R15", 15),
];

static X86_64_PSEUDO: [DwarfRegister; 1] = [reg("RA", 16)];

static AARCH64_REGISTERS: [DwarfRegister; 33] = [
    reg("R0", 0),
    reg("R1", 1),
    reg("R2", 2),
    reg("R3", 3),
    reg("R4", 4),
    reg("R5", 5),
    reg("R6", 6),
    reg("R7", 7),
    reg("R8", 8),
    reg("R9", 9),
    reg("R10", 10),
    reg("R11", 11),
    reg("R12", 12),
    reg("R13", 13),
    reg("R14", 14),
    reg("R15", 15),
    reg("R16", 16),
    reg("R17", 17),
    reg("R18", 18),
    reg("R19", 19),
    reg("R20", 20),
    reg("R21", 21),
    reg("R22", 22),
    reg("R23", 23),
    reg("R24", 24),
    reg("R25", 25),
    reg("R26", 26),
    reg("R27", 27),
    reg("R28", 28),
    reg("FP", 29),
    reg("LR", 30),
    reg("SP", 31),
    reg("PC", 32),
];

/// x86-64 DWARF register numbering.
pub static X86_64: RegisterTable = RegisterTable {
    architecture: Architecture::X86_64,
    registers: &X86_64_REGISTERS,
    pseudo: &X86_64_PSEUDO,
    frame_pointer: 6,
    stack_pointer: 7,
    return_address: 16,
    // RBX, RBP, R12-R15
    callee_saved: &[3, 6, 12, 13, 14, 15],
};

/// AArch64 DWARF register numbering. The return address lives in LR.
pub static AARCH64: RegisterTable = RegisterTable {
    architecture: Architecture::Arm64,
    registers: &AARCH64_REGISTERS,
    pseudo: &[],
    frame_pointer: 29,
    stack_pointer: 31,
    return_address: 30,
    // X19-X29
    callee_saved: &[19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29],
};

impl RegisterTable
{
    /// Table for the given architecture.
    pub fn for_architecture(architecture: Architecture) -> &'static RegisterTable
    {
        match architecture {
            Architecture::X86_64 => &X86_64,
            Architecture::Arm64 => &AARCH64,
        }
    }

    pub fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    pub fn word_size(&self) -> u8
    {
        self.architecture.word_size()
    }

    /// DWARF number of the frame-pointer register (RBP / X29).
    pub fn frame_pointer(&self) -> u16
    {
        self.frame_pointer
    }

    /// DWARF number of the stack-pointer register (RSP / SP).
    pub fn stack_pointer(&self) -> u16
    {
        self.stack_pointer
    }

    /// DWARF number of the return-address column (RA / LR).
    pub fn return_address(&self) -> u16
    {
        self.return_address
    }

    /// Every register, real ones first, then pseudo registers.
    pub fn iter(&self) -> impl Iterator<Item = &'static DwarfRegister>
    {
        self.registers.iter().chain(self.pseudo.iter())
    }

    /// Look a register up by name, ignoring case.
    ///
    /// ```rust
    /// use framewalk_core::registers::{AARCH64, X86_64};
    ///
    /// assert_eq!(X86_64.number("rbp"), Some(6));
    /// assert_eq!(AARCH64.number("LR"), Some(30));
    /// assert_eq!(X86_64.number("xmm0"), None);
    /// ```
    pub fn number(&self, name: &str) -> Option<u16>
    {
        self.iter()
            .find(|register| register.name.eq_ignore_ascii_case(name))
            .map(|register| register.number)
    }

    /// Name of a DWARF register number, if the table knows it.
    pub fn name(&self, number: u16) -> Option<&'static str>
    {
        self.iter()
            .find(|register| register.number == number)
            .map(|register| register.name)
    }

    /// Whether `number` is a register (or pseudo register) of this architecture.
    pub fn contains(&self, number: u16) -> bool
    {
        self.name(number).is_some()
    }

    pub fn is_callee_saved(&self, number: u16) -> bool
    {
        self.callee_saved.contains(&number)
    }

    /// Name for log messages; unknown numbers render as `r<number>`.
    pub fn display_name(&self, number: u16) -> String
    {
        self.name(number)
            .map_or_else(|| format!("r{number}"), str::to_string)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_x86_64_aliases()
    {
        assert_eq!(X86_64.frame_pointer(), X86_64.number("RBP").unwrap());
        assert_eq!(X86_64.stack_pointer(), X86_64.number("RSP").unwrap());
        assert_eq!(X86_64.return_address(), X86_64.number("RA").unwrap());
        assert_eq!(X86_64.word_size(), 8);
    }

    #[test]
    fn test_aarch64_aliases()
    {
        assert_eq!(AARCH64.frame_pointer(), 29);
        assert_eq!(AARCH64.return_address(), AARCH64.number("lr").unwrap());
        assert_eq!(AARCH64.name(32), Some("PC"));
        assert!(!AARCH64.contains(64));
    }

    #[test]
    fn test_numbers_are_unique()
    {
        for table in [&X86_64, &AARCH64] {
            let mut numbers: Vec<u16> = table.iter().map(|r| r.number).collect();
            let len = numbers.len();
            numbers.sort_unstable();
            numbers.dedup();
            assert_eq!(numbers.len(), len, "duplicate register number in {:?}", table.architecture());
        }
    }

    #[test]
    fn test_callee_saved_includes_frame_pointer()
    {
        assert!(X86_64.is_callee_saved(X86_64.frame_pointer()));
        assert!(AARCH64.is_callee_saved(AARCH64.frame_pointer()));
        assert!(!X86_64.is_callee_saved(X86_64.stack_pointer()));
    }

    #[test]
    fn test_display_name_unknown()
    {
        assert_eq!(X86_64.display_name(6), "RBP");
        assert_eq!(X86_64.display_name(99), "r99");
    }
}
