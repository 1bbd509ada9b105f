//! Tests for addresses, identifiers, architectures and register tables

use std::str::FromStr;

use framewalk_core::registers::{RegisterTable, AARCH64, X86_64};
use framewalk_core::types::{Address, Architecture, ProcessId, ThreadId};

#[test]
fn test_address_wrapping_offset()
{
    let bp = Address::from(0x1000);
    assert_eq!(bp.offset(16), Address::from(0x1010));
    assert_eq!(bp.offset(-8), Address::from(0x0ff8));
    assert_eq!(bp + (-8i64) as u64, Address::from(0x0ff8));
}

#[test]
fn test_address_words()
{
    let bp = Address::from(0x7ffe_0000);
    assert_eq!(bp.word(0, 8), bp);
    assert_eq!(bp.word(2, 8), Address::from(0x7ffe_0010));
}

#[test]
fn test_address_offset_from_base()
{
    let base = Address::from(0x7f00_0000_0000);
    assert_eq!(Address::from(0x7f00_0000_1234).offset_from(base), Some(0x1234));
    assert_eq!(Address::from(0x1000).offset_from(base), None);
}

#[test]
fn test_address_display()
{
    assert_eq!(Address::from(0xdead_beef).to_string(), "0x00000000deadbeef");
    assert!(Address::ZERO.is_zero());
}

#[test]
fn test_ids()
{
    let pid = ProcessId::from(4242);
    assert_eq!(pid.0, 4242);
    assert_eq!(pid.to_string(), "4242");
    let tid = ThreadId::from(4243);
    assert_eq!(tid.raw(), 4243);
}

#[test]
fn test_architecture_parse()
{
    assert_eq!(Architecture::from_str("amd64").unwrap(), Architecture::X86_64);
    assert_eq!(Architecture::from_str("ARM64").unwrap(), Architecture::Arm64);
    assert!(Architecture::from_str("riscv64").is_err());
    assert_eq!(Architecture::X86_64.word_size(), 8);
}

#[test]
fn test_x86_64_table()
{
    assert_eq!(X86_64.frame_pointer(), 6);
    assert_eq!(X86_64.stack_pointer(), 7);
    assert_eq!(X86_64.return_address(), 16);
    assert_eq!(X86_64.number("RA"), Some(16));
    assert_eq!(X86_64.name(12), Some("R12"));
    assert!(X86_64.is_callee_saved(3));
    assert!(!X86_64.is_callee_saved(0));
}

#[test]
fn test_aarch64_table()
{
    assert_eq!(AARCH64.frame_pointer(), 29);
    assert_eq!(AARCH64.stack_pointer(), 31);
    assert_eq!(AARCH64.return_address(), 30);
    assert_eq!(AARCH64.number("fp"), Some(29));
    assert_eq!(AARCH64.display_name(99), "r99");
}

#[test]
fn test_table_for_architecture()
{
    assert_eq!(RegisterTable::for_architecture(Architecture::Arm64).architecture(), Architecture::Arm64);
    assert_eq!(RegisterTable::for_architecture(Architecture::X86_64).word_size(), 8);
}
