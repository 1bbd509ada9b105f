//! Process, thread and architecture identifiers.

use std::fmt;
use std::str::FromStr;

/// Process identifier (PID) of a live target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier
///
/// On Linux this is the kernel thread id (LWP id). For core images it is the
/// `pr_pid` recorded in the thread's `NT_PRSTATUS` note, which is the same
/// number the thread had while the process was alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Raw `u64` representation of the thread identifier.
    pub fn raw(&self) -> u64
    {
        self.0
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// CPU architecture of the target
///
/// Both supported architectures are 64-bit little-endian; the word size is
/// still looked up through [`Architecture::word_size`] so that the unwinding
/// code never hard-codes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// 64-bit ARM (AArch64)
    Arm64,
    /// 64-bit x86 (Intel/AMD)
    X86_64,
}

impl Architecture
{
    /// Architecture of the running binary, used as the default target.
    ///
    /// Falls back to x86-64 on hosts that are neither, since register tables
    /// only exist for these two.
    pub const fn current() -> Self
    {
        #[cfg(target_arch = "aarch64")]
        {
            Architecture::Arm64
        }

        #[cfg(not(target_arch = "aarch64"))]
        {
            Architecture::X86_64
        }
    }

    /// Size of a machine word (and of a pointer) in bytes.
    #[must_use]
    pub const fn word_size(self) -> u8
    {
        match self {
            Architecture::Arm64 | Architecture::X86_64 => 8,
        }
    }

    /// Map an `object` architecture, if we have a register table for it.
    pub fn from_object(arch: object::Architecture) -> Option<Self>
    {
        match arch {
            object::Architecture::X86_64 => Some(Architecture::X86_64),
            object::Architecture::Aarch64 => Some(Architecture::Arm64),
            _ => None,
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Architecture::Arm64 => write!(f, "aarch64"),
            Architecture::X86_64 => write!(f, "x86_64"),
        }
    }
}

impl FromStr for Architecture
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "x86_64" | "x86-64" | "amd64" => Ok(Architecture::X86_64),
            "aarch64" | "arm64" => Ok(Architecture::Arm64),
            _ => Err(format!("Unknown architecture: {s}. Use 'x86_64' or 'aarch64'")),
        }
    }
}
