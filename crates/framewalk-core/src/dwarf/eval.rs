//! Evaluation of CFA and saved-register locations
//!
//! Only the location shapes that compilers emit for frame unwinding are
//! understood:
//!
//! | Purpose  | Program                               | Result                  |
//! |----------|---------------------------------------|-------------------------|
//! | CFA      | `DW_OP_bregx fp\|sp, n`               | `bp + n` / `sp + n`     |
//! | CFA      | `DW_OP_breg<fp\|sp> n`                | `bp + n` / `sp + n`     |
//! | register | `DW_OP_call_frame_cfa, DW_OP_stack_value` | `cfa`               |
//! | register | `DW_OP_call_frame_cfa, DW_OP_plus_uconst n` | word at `cfa + n` |
//! | register | `DW_OP_call_frame_cfa, DW_OP_breg<fp\|sp> n` | word at `bp/sp + n` |
//!
//! Everything else is an "unsupported operation" error. An unsupported
//! program never evaluates to a silent zero.

use gimli::constants;
use tracing::{debug, trace};

use super::ops::{DwarfLocation, DwarfOp, RegisterLocation};
use crate::error::{Result, UnwindError};
use crate::memory::TargetMemory;
use crate::registers::RegisterTable;
use crate::types::Address;

/// Evaluates location programs against one frame's known registers.
pub struct LocationEvaluator<'a, M: TargetMemory + ?Sized>
{
    table: &'static RegisterTable,
    memory: &'a M,
}

impl<'a, M: TargetMemory + ?Sized> LocationEvaluator<'a, M>
{
    pub fn new(table: &'static RegisterTable, memory: &'a M) -> Self
    {
        Self { table, memory }
    }

    pub fn table(&self) -> &'static RegisterTable
    {
        self.table
    }

    /// Compute the Canonical Frame Address
    ///
    /// Only the first operator of `location` is consulted; any trailing ones
    /// are reported at trace level and skipped.
    pub fn compute_cfa(&self, location: &DwarfLocation, bp: Address, sp: Address) -> Result<Address>
    {
        let op = location
            .first()
            .ok_or_else(|| UnwindError::Evaluation("unsupported operation: empty CFA location".to_string()))?;
        if let Some(ignored) = location.ops().get(1..).filter(|ops| !ops.is_empty()) {
            trace!(
                "CFA location {}: ignoring trailing {}",
                location.describe(),
                ignored.iter().map(DwarfOp::name).collect::<Vec<_>>().join(" ")
            );
        }

        if op.atom == constants::DW_OP_bregx {
            let register = u16::try_from(op.number).ok();
            return match register.and_then(|register| self.register_base(register, bp, sp)) {
                Some(base) => Ok(base.offset(op.number2 as i64)),
                None => {
                    debug!(
                        "unsupported DWARF register {} in CFA computation",
                        op.number
                    );
                    Err(UnwindError::Evaluation(format!(
                        "unsupported operation in CFA computation: DW_OP_bregx on register {}",
                        op.number
                    )))
                }
            };
        }

        if let Some(base) = op
            .compact_breg_register()
            .and_then(|register| self.register_base(register, bp, sp))
        {
            return Ok(base.offset(op.number as i64));
        }

        debug!("unsupported operation in CFA computation: {}", op.name());
        Err(UnwindError::Evaluation(format!(
            "unsupported operation in CFA computation: {}",
            op.name()
        )))
    }

    /// Compute the caller's value of `register`
    ///
    /// `cfa`, `bp` and `sp` are the values already known for the frame being
    /// unwound. [`RegisterLocation::Undefined`] yields `0`, which callers treat
    /// as a possible end of the chain.
    pub fn compute_register(
        &self,
        register: u16,
        location: &RegisterLocation,
        cfa: Address,
        bp: Address,
        sp: Address,
    ) -> Result<u64>
    {
        match location {
            RegisterLocation::Undefined => Ok(0),
            RegisterLocation::SameValue => self
                .register_base(register, bp, sp)
                .map(Address::value)
                .ok_or_else(|| {
                    debug!(
                        "same value rule is not supported for DWARF register {}",
                        self.table.display_name(register)
                    );
                    UnwindError::Evaluation(format!(
                        "unsupported operation: same value for register {}",
                        self.table.display_name(register)
                    ))
                }),
            RegisterLocation::Expression(location) => self.evaluate_cfa_relative(location, cfa, bp, sp),
        }
    }

    fn evaluate_cfa_relative(&self, location: &DwarfLocation, cfa: Address, bp: Address, sp: Address) -> Result<u64>
    {
        let [first, second] = location.ops() else {
            return Err(self.unknown_program(location));
        };
        if first.atom != constants::DW_OP_call_frame_cfa {
            return Err(self.unknown_program(location));
        }

        match second.atom {
            constants::DW_OP_stack_value => Ok(cfa.value()),
            constants::DW_OP_plus_uconst => {
                let slot = cfa + second.number;
                self.memory
                    .read_word(slot, self.table.word_size())
                    .map_err(|err| {
                        debug!("could not read saved register at {slot}: {err}");
                        UnwindError::Evaluation(format!("could not read register value at {slot}"))
                    })
            }
            _ => match self.breg_base(second, bp, sp) {
                Some(base) => {
                    let slot = base.offset(second.number as i64);
                    Ok(self.memory.read_word(slot, self.table.word_size()).unwrap_or_else(|err| {
                        debug!("best-effort read at {slot} failed: {err}");
                        0
                    }))
                }
                None => {
                    debug!("unsupported second operation: {}", second.name());
                    Err(UnwindError::Evaluation(format!(
                        "unsupported operation in second step: {}",
                        second.name()
                    )))
                }
            },
        }
    }

    fn unknown_program(&self, location: &DwarfLocation) -> UnwindError
    {
        debug!("unknown DWARF operations: {}", location.describe());
        UnwindError::Evaluation(format!("unsupported operation: {}", location.describe()))
    }

    /// Current value of the frame-pointer or stack-pointer register.
    fn register_base(&self, register: u16, bp: Address, sp: Address) -> Option<Address>
    {
        if register == self.table.frame_pointer() {
            Some(bp)
        } else if register == self.table.stack_pointer() {
            Some(sp)
        } else {
            None
        }
    }

    fn breg_base(&self, op: &DwarfOp, bp: Address, sp: Address) -> Option<Address>
    {
        op.compact_breg_register()
            .and_then(|register| self.register_base(register, bp, sp))
    }
}
