//! DWARF location operators and programs.

use gimli::constants::{self, DwOp};
use gimli::Reader;
use once_cell::sync::Lazy;
use smallvec::SmallVec;

use crate::error::{Result, UnwindError};

/// Name reported for operator codes DWARF does not define.
pub const UNKNOWN_OP: &str = "UNKNOWN";

static OP_NAMES: Lazy<[&'static str; 256]> = Lazy::new(|| {
    let mut names = [UNKNOWN_OP; 256];
    for (code, name) in (0..=u8::MAX).zip(names.iter_mut()) {
        if let Some(known) = DwOp(code).static_string() {
            *name = known;
        }
    }
    names
});

/// Name of a DWARF operator (`DW_OP_bregx`, ...), or [`UNKNOWN_OP`].
///
/// ```rust
/// use framewalk_core::dwarf::op_name;
///
/// assert_eq!(op_name(gimli::DW_OP_call_frame_cfa), "DW_OP_call_frame_cfa");
/// assert_eq!(op_name(gimli::constants::DwOp(0xee)), "UNKNOWN");
/// ```
pub fn op_name(op: DwOp) -> &'static str
{
    OP_NAMES[usize::from(op.0)]
}

/// One step of a location program
///
/// `number` and `number2` hold the operands in the order the operator
/// defines them. Signed operands are stored as their two's complement, so
/// address arithmetic with them must wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DwarfOp
{
    pub atom: DwOp,
    pub number: u64,
    pub number2: u64,
}

impl DwarfOp
{
    /// Operator without operands.
    pub const fn new(atom: DwOp) -> Self
    {
        Self {
            atom,
            number: 0,
            number2: 0,
        }
    }

    /// Operator with one operand.
    pub const fn with(atom: DwOp, number: u64) -> Self
    {
        Self {
            atom,
            number,
            number2: 0,
        }
    }

    /// Operator with two operands.
    pub const fn with2(atom: DwOp, number: u64, number2: u64) -> Self
    {
        Self { atom, number, number2 }
    }

    /// `DW_OP_breg<register> offset`, when `register` fits the compact form.
    pub fn breg(register: u16, offset: i64) -> Option<Self>
    {
        let register = u8::try_from(register).ok().filter(|&r| r < 32)?;
        Some(Self::with(DwOp(constants::DW_OP_breg0.0 + register), offset as u64))
    }

    /// `DW_OP_bregx register offset`.
    pub fn bregx(register: u16, offset: i64) -> Self
    {
        Self::with2(constants::DW_OP_bregx, u64::from(register), offset as u64)
    }

    /// Register number folded into a `DW_OP_breg0`..`DW_OP_breg31` opcode.
    pub fn compact_breg_register(&self) -> Option<u16>
    {
        let first = constants::DW_OP_breg0.0;
        let last = constants::DW_OP_breg31.0;
        (first..=last)
            .contains(&self.atom.0)
            .then(|| u16::from(self.atom.0 - first))
    }

    pub fn name(&self) -> &'static str
    {
        op_name(self.atom)
    }
}

/// A short location program: an ordered list of [`DwarfOp`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DwarfLocation
{
    ops: SmallVec<[DwarfOp; 3]>,
}

impl DwarfLocation
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn from_ops(ops: impl IntoIterator<Item = DwarfOp>) -> Self
    {
        Self {
            ops: ops.into_iter().collect(),
        }
    }

    pub fn push(&mut self, op: DwarfOp)
    {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[DwarfOp]
    {
        &self.ops
    }

    pub fn len(&self) -> usize
    {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.ops.is_empty()
    }

    pub fn first(&self) -> Option<&DwarfOp>
    {
        self.ops.first()
    }

    /// Operator names, space separated, for diagnostics.
    pub fn describe(&self) -> String
    {
        self.ops.iter().map(DwarfOp::name).collect::<Vec<_>>().join(" ")
    }

    /// Decode a raw DWARF expression
    ///
    /// Operands are decoded for the operators a CFI expression realistically
    /// uses. An operator whose operand layout we do not know ends decoding:
    /// it is kept (so the evaluator can name it in its error) and the rest of
    /// the bytes are dropped.
    pub fn parse<R: Reader>(mut bytes: R) -> Result<Self>
    {
        let mut location = Self::new();
        while !bytes.is_empty() {
            let atom = DwOp(bytes.read_u8().map_err(truncated)?);
            let op = match atom {
                _ if (constants::DW_OP_breg0.0..=constants::DW_OP_breg31.0).contains(&atom.0) => {
                    DwarfOp::with(atom, bytes.read_sleb128().map_err(truncated)? as u64)
                }
                _ if (constants::DW_OP_lit0.0..=constants::DW_OP_lit31.0).contains(&atom.0)
                    || (constants::DW_OP_reg0.0..=constants::DW_OP_reg31.0).contains(&atom.0) =>
                {
                    DwarfOp::new(atom)
                }
                constants::DW_OP_bregx => {
                    let register = bytes.read_uleb128().map_err(truncated)?;
                    let offset = bytes.read_sleb128().map_err(truncated)?;
                    DwarfOp::with2(atom, register, offset as u64)
                }
                constants::DW_OP_plus_uconst | constants::DW_OP_constu | constants::DW_OP_regx => {
                    DwarfOp::with(atom, bytes.read_uleb128().map_err(truncated)?)
                }
                constants::DW_OP_consts | constants::DW_OP_fbreg => {
                    DwarfOp::with(atom, bytes.read_sleb128().map_err(truncated)? as u64)
                }
                constants::DW_OP_call_frame_cfa
                | constants::DW_OP_stack_value
                | constants::DW_OP_deref
                | constants::DW_OP_plus
                | constants::DW_OP_minus
                | constants::DW_OP_nop => DwarfOp::new(atom),
                _ => {
                    location.push(DwarfOp::new(atom));
                    break;
                }
            };
            location.push(op);
        }
        Ok(location)
    }
}

impl FromIterator<DwarfOp> for DwarfLocation
{
    fn from_iter<I: IntoIterator<Item = DwarfOp>>(iter: I) -> Self
    {
        Self::from_ops(iter)
    }
}

fn truncated(err: gimli::Error) -> UnwindError
{
    UnwindError::Format(format!("truncated DWARF expression: {err}"))
}

/// How to recover one register's value in the caller's frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterLocation
{
    /// Nothing is known; evaluates to zero, which callers read as "end of chain".
    Undefined,
    /// The caller's value equals this frame's value.
    SameValue,
    /// Computed by a location program.
    Expression(DwarfLocation),
}
