//! Tests for CFA and saved-register evaluation

mod common;

use common::WordMemory;
use framewalk_core::dwarf::{DwarfLocation, DwarfOp, LocationEvaluator, RegisterLocation};
use framewalk_core::registers::X86_64;
use framewalk_core::types::Address;
use gimli::constants;

fn cfa_op() -> DwarfOp
{
    DwarfOp::new(constants::DW_OP_call_frame_cfa)
}

fn expression(ops: impl IntoIterator<Item = DwarfOp>) -> RegisterLocation
{
    RegisterLocation::Expression(DwarfLocation::from_ops(ops))
}

#[test]
fn test_cfa_frame_pointer_plus_offset()
{
    let memory = WordMemory::default();
    let evaluator = LocationEvaluator::new(&X86_64, &memory);
    let location = DwarfLocation::from_ops([DwarfOp::bregx(6, 16)]);
    let cfa = evaluator
        .compute_cfa(&location, Address::from(0x1000), Address::from(0x9000))
        .unwrap();
    assert_eq!(cfa, Address::from(0x1010));
}

#[test]
fn test_cfa_stack_pointer_zero_offset()
{
    let memory = WordMemory::default();
    let evaluator = LocationEvaluator::new(&X86_64, &memory);
    let location = DwarfLocation::from_ops([DwarfOp::bregx(7, 0)]);
    let cfa = evaluator
        .compute_cfa(&location, Address::from(0x1000), Address::from(0x2000))
        .unwrap();
    assert_eq!(cfa, Address::from(0x2000));
}

#[test]
fn test_cfa_compact_forms()
{
    let memory = WordMemory::default();
    let evaluator = LocationEvaluator::new(&X86_64, &memory);
    let bp = Address::from(0x1000);
    let sp = Address::from(0x2000);

    let via_bp = DwarfLocation::from_ops([DwarfOp::breg(6, 16).unwrap()]);
    assert_eq!(evaluator.compute_cfa(&via_bp, bp, sp).unwrap(), Address::from(0x1010));

    let via_sp = DwarfLocation::from_ops([DwarfOp::breg(7, 8).unwrap()]);
    assert_eq!(evaluator.compute_cfa(&via_sp, bp, sp).unwrap(), Address::from(0x2008));
}

#[test]
fn test_cfa_uses_first_operator_only()
{
    let memory = WordMemory::default();
    let evaluator = LocationEvaluator::new(&X86_64, &memory);
    let location = DwarfLocation::from_ops([
        DwarfOp::bregx(7, 8),
        DwarfOp::new(constants::DW_OP_deref),
        DwarfOp::new(constants::DW_OP_stack_value),
    ]);
    let cfa = evaluator
        .compute_cfa(&location, Address::from(0x1000), Address::from(0x2000))
        .unwrap();
    assert_eq!(cfa, Address::from(0x2008));
}

#[test]
fn test_cfa_unsupported_register()
{
    let memory = WordMemory::default();
    let evaluator = LocationEvaluator::new(&X86_64, &memory);
    let location = DwarfLocation::from_ops([DwarfOp::bregx(3, 16)]);
    let err = evaluator
        .compute_cfa(&location, Address::from(0x1000), Address::from(0x2000))
        .unwrap_err();
    assert!(err.to_string().contains("unsupported operation"));
}

#[test]
fn test_cfa_unsupported_operator()
{
    let memory = WordMemory::default();
    let evaluator = LocationEvaluator::new(&X86_64, &memory);
    let location = DwarfLocation::from_ops([cfa_op()]);
    let err = evaluator
        .compute_cfa(&location, Address::from(0x1000), Address::from(0x2000))
        .unwrap_err();
    assert!(err.to_string().contains("unsupported operation"));
    assert!(err.to_string().contains("DW_OP_call_frame_cfa"));
}

#[test]
fn test_register_read_at_cfa_offset()
{
    let memory = WordMemory::default().with(0x1008, 0xDEAD_BEEF);
    let evaluator = LocationEvaluator::new(&X86_64, &memory);
    let location = expression([cfa_op(), DwarfOp::with(constants::DW_OP_plus_uconst, (-8i64) as u64)]);
    let value = evaluator
        .compute_register(16, &location, Address::from(0x1010), Address::ZERO, Address::ZERO)
        .unwrap();
    assert_eq!(value, 0xDEAD_BEEF);
}

#[test]
fn test_register_read_at_cfa_offset_failure_is_error()
{
    let memory = WordMemory::default();
    let evaluator = LocationEvaluator::new(&X86_64, &memory);
    let location = expression([cfa_op(), DwarfOp::with(constants::DW_OP_plus_uconst, (-8i64) as u64)]);
    let err = evaluator
        .compute_register(16, &location, Address::from(0x1010), Address::ZERO, Address::ZERO)
        .unwrap_err();
    assert!(err.to_string().contains("could not read register value"));
}

#[test]
fn test_register_cfa_as_value()
{
    let memory = WordMemory::default();
    let evaluator = LocationEvaluator::new(&X86_64, &memory);
    let location = expression([cfa_op(), DwarfOp::new(constants::DW_OP_stack_value)]);
    let value = evaluator
        .compute_register(7, &location, Address::from(0x1010), Address::ZERO, Address::ZERO)
        .unwrap();
    assert_eq!(value, 0x1010);
}

#[test]
fn test_same_value_for_frame_and_stack_pointer()
{
    let memory = WordMemory::default();
    let evaluator = LocationEvaluator::new(&X86_64, &memory);
    let bp = Address::from(0x1000);
    let sp = Address::from(0x0f00);
    let cfa = Address::from(0x1010);
    assert_eq!(
        evaluator.compute_register(6, &RegisterLocation::SameValue, cfa, bp, sp).unwrap(),
        0x1000
    );
    assert_eq!(
        evaluator.compute_register(7, &RegisterLocation::SameValue, cfa, bp, sp).unwrap(),
        0x0f00
    );
}

#[test]
fn test_same_value_for_other_register_is_unsupported()
{
    let memory = WordMemory::default();
    let evaluator = LocationEvaluator::new(&X86_64, &memory);
    let err = evaluator
        .compute_register(16, &RegisterLocation::SameValue, Address::ZERO, Address::ZERO, Address::ZERO)
        .unwrap_err();
    assert!(err.to_string().contains("unsupported operation"));
}

#[test]
fn test_undefined_is_zero()
{
    let memory = WordMemory::default();
    let evaluator = LocationEvaluator::new(&X86_64, &memory);
    let value = evaluator
        .compute_register(16, &RegisterLocation::Undefined, Address::from(0x10), Address::ZERO, Address::ZERO)
        .unwrap();
    assert_eq!(value, 0);
}

#[test]
fn test_first_step_must_be_cfa()
{
    let memory = WordMemory::default().with(0x1000, 7);
    let evaluator = LocationEvaluator::new(&X86_64, &memory);
    let location = expression([DwarfOp::breg(6, 0).unwrap(), DwarfOp::new(constants::DW_OP_stack_value)]);
    let err = evaluator
        .compute_register(3, &location, Address::from(0x1010), Address::from(0x1000), Address::ZERO)
        .unwrap_err();
    assert!(err.to_string().contains("unsupported operation"));
}

#[test]
fn test_unsupported_second_step()
{
    let memory = WordMemory::default();
    let evaluator = LocationEvaluator::new(&X86_64, &memory);
    let location = expression([cfa_op(), DwarfOp::new(constants::DW_OP_deref)]);
    let err = evaluator
        .compute_register(3, &location, Address::from(0x1010), Address::ZERO, Address::ZERO)
        .unwrap_err();
    assert!(err.to_string().contains("unsupported operation"));
    assert!(err.to_string().contains("DW_OP_deref"));
}

#[test]
fn test_register_rule_lowered_from_expression_bytes()
{
    // DW_OP_breg7 8: the CFI expression form of "saved at sp + 8"
    let bytes = [0x77, 0x08];
    let parsed = DwarfLocation::parse(gimli::EndianSlice::new(&bytes, gimli::LittleEndian)).unwrap();
    let mut ops = vec![cfa_op()];
    ops.extend_from_slice(parsed.ops());

    let memory = WordMemory::default().with(0x2008, 0x55);
    let evaluator = LocationEvaluator::new(&X86_64, &memory);
    let value = evaluator
        .compute_register(3, &expression(ops), Address::from(0x2010), Address::from(0x3000), Address::from(0x2000))
        .unwrap();
    assert_eq!(value, 0x55);
}
