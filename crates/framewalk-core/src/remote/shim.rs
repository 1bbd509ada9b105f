//! Register access for the external unwinder's first frame.
//!
//! The unwinder asks for the initial frame's registers through a callback.
//! Those values come from the debugger, not from a thread the unwinder could
//! read itself, so each session seeds a [`RegisterShim`] with them and the
//! callback answers from it.

use std::fmt;

use super::status::UnwindStatus;

/// The registers a session can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnwindRegister
{
    InstructionPointer,
    StackPointer,
    FramePointer,
}

impl fmt::Display for UnwindRegister
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            UnwindRegister::InstructionPointer => write!(f, "ip"),
            UnwindRegister::StackPointer => write!(f, "sp"),
            UnwindRegister::FramePointer => write!(f, "bp"),
        }
    }
}

/// Why the shim refused an access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShimError
{
    /// A write was attempted.
    ReadOnly,
    /// The register is not one the shim knows.
    BadRegister,
}

impl ShimError
{
    /// Value the callback hands back to the unwinder.
    pub fn code(self) -> i32
    {
        match self {
            ShimError::ReadOnly => -UnwindStatus::ReadOnlyRegister.code(),
            ShimError::BadRegister => -UnwindStatus::BadRegister.code(),
        }
    }
}

/// Initial `ip`/`sp`/`bp` of the frame being unwound
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterShim
{
    pub ip: u64,
    pub sp: u64,
    pub bp: u64,
}

impl RegisterShim
{
    pub fn new(ip: u64, sp: u64, bp: u64) -> Self
    {
        Self { ip, sp, bp }
    }

    /// Answer a register access
    ///
    /// `register` is `None` for anything outside the three seeded registers.
    /// Writes are always refused, even for known registers.
    pub fn access(&self, register: Option<UnwindRegister>, write: bool) -> Result<u64, ShimError>
    {
        if write {
            return Err(ShimError::ReadOnly);
        }
        match register {
            Some(UnwindRegister::InstructionPointer) => Ok(self.ip),
            Some(UnwindRegister::StackPointer) => Ok(self.sp),
            Some(UnwindRegister::FramePointer) => Ok(self.bp),
            None => Err(ShimError::BadRegister),
        }
    }
}
