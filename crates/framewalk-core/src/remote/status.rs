//! Status codes of the external unwind library.
//!
//! libunwind reports failures as negated `UNW_E*` codes. [`UnwindStatus`]
//! names them and carries the fixed message a failed `step` or cursor
//! initialization surfaces.

use std::fmt;

/// A libunwind error code (`UNW_E*`), without the sign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnwindStatus
{
    Unspecified,
    NoMemory,
    BadRegister,
    ReadOnlyRegister,
    StopUnwind,
    InvalidIp,
    BadFrame,
    Invalid,
    BadVersion,
    NoInfo,
    Unknown(i32),
}

impl UnwindStatus
{
    /// Map a library return value (negative on failure) to a status.
    pub fn from_code(code: i32) -> Self
    {
        match code.checked_abs().unwrap_or(i32::MAX) {
            1 => Self::Unspecified,
            2 => Self::NoMemory,
            3 => Self::BadRegister,
            4 => Self::ReadOnlyRegister,
            5 => Self::StopUnwind,
            6 => Self::InvalidIp,
            7 => Self::BadFrame,
            8 => Self::Invalid,
            9 => Self::BadVersion,
            10 => Self::NoInfo,
            _ => Self::Unknown(code),
        }
    }

    /// Positive `UNW_E*` value; callbacks return its negation.
    pub fn code(self) -> i32
    {
        match self {
            Self::Unspecified => 1,
            Self::NoMemory => 2,
            Self::BadRegister => 3,
            Self::ReadOnlyRegister => 4,
            Self::StopUnwind => 5,
            Self::InvalidIp => 6,
            Self::BadFrame => 7,
            Self::Invalid => 8,
            Self::BadVersion => 9,
            Self::NoInfo => 10,
            Self::Unknown(code) => code.saturating_abs(),
        }
    }

    /// Message for a failed `step`.
    pub fn step_message(self) -> &'static str
    {
        match self {
            Self::Unspecified => "unwind: an unspecified error occurred",
            Self::NoInfo => "unwind: could not locate the unwind info needed to step",
            Self::BadVersion => "unwind: the unwind info has a version or format the unwinder does not understand",
            Self::InvalidIp => "unwind: the instruction pointer of the next frame is invalid (e.g. misaligned)",
            Self::BadFrame => "unwind: the next stack frame is invalid",
            Self::StopUnwind => "unwind: unwind info lookup asked to stop unwinding",
            Self::Invalid => "unwind: unsupported operation or bad value",
            _ => "unwind: unknown error",
        }
    }

    /// Message for a failed cursor initialization.
    pub fn init_message(self) -> &'static str
    {
        match self {
            Self::Invalid => "initialize unwinder: UNW_EINVAL",
            Self::Unspecified => "initialize unwinder: UNW_EUNSPEC",
            Self::BadRegister => "initialize unwinder: UNW_EBADREG",
            _ => "initialize unwinder: unknown error",
        }
    }
}

impl fmt::Display for UnwindStatus
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Unspecified => write!(f, "UNW_EUNSPEC"),
            Self::NoMemory => write!(f, "UNW_ENOMEM"),
            Self::BadRegister => write!(f, "UNW_EBADREG"),
            Self::ReadOnlyRegister => write!(f, "UNW_EREADONLYREG"),
            Self::StopUnwind => write!(f, "UNW_ESTOPUNWIND"),
            Self::InvalidIp => write!(f, "UNW_EINVALIDIP"),
            Self::BadFrame => write!(f, "UNW_EBADFRAME"),
            Self::Invalid => write!(f, "UNW_EINVAL"),
            Self::BadVersion => write!(f, "UNW_EBADVERSION"),
            Self::NoInfo => write!(f, "UNW_ENOINFO"),
            Self::Unknown(code) => write!(f, "unknown unwinder error {code}"),
        }
    }
}
