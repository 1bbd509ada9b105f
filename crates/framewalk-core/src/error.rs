//! # Error Types
//!
//! Error handling for the unwinder.
//!
//! We use `thiserror` to generate the `Error` implementations. Every variant
//! carries a specific, human-readable message; callers are expected to surface
//! the `Display` text as-is rather than replace it with a generic one.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::Address;

/// Main error type for unwinding operations
///
/// ## Error Categories
///
/// 1. **Open/format errors**: `Open`, `Format`. Non-fatal for the CFI path,
///    which falls back to frame-pointer chasing.
/// 2. **Evaluation errors**: `Evaluation`. Fatal to the current resolution.
/// 3. **Target setup errors**: `TargetSetup`. The session is not created.
/// 4. **Step errors**: `Step`. The session moves to its failed state.
/// 5. **Register read errors**: `RegisterRead`. Local to that read.
/// 6. **Memory errors**: `MemoryRead`.
/// 7. **I/O errors**: `Io`.
#[derive(Error, Debug)]
pub enum UnwindError
{
    /// The backing object of a library could not be opened
    #[error("could not open {}: {reason}", path.display())]
    Open
    {
        /// Path of the object we tried to open
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// The object was opened but is not something we can read CFI from
    ///
    /// Examples:
    /// - Not an ELF file
    /// - No `.eh_frame` or `.debug_frame` section
    /// - A malformed core image note
    #[error("{0}")]
    Format(String),

    /// A DWARF location could not be evaluated
    ///
    /// Raised for unsupported operators, CFA-relative memory that cannot be
    /// read, or a missing return-address register.
    #[error("{0}")]
    Evaluation(String),

    /// Setting up a remote unwind session failed
    #[error("{0}")]
    TargetSetup(String),

    /// Advancing the remote cursor failed
    #[error("{0}")]
    Step(String),

    /// The unwinding library refused to report a register value
    #[error("could not get register value from unwinder: {0}")]
    RegisterRead(String),

    /// A target memory read failed
    #[error("could not read {length} bytes of target memory at {address}")]
    MemoryRead
    {
        /// Start of the failed read
        address: Address,
        /// Number of bytes requested
        length: usize,
    },

    /// I/O error (reading `/proc`, core files, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse category of an [`UnwindError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind
{
    Open,
    Format,
    Evaluation,
    TargetSetup,
    Step,
    RegisterRead,
    Memory,
    Io,
}

impl UnwindError
{
    /// Category of this error, for callers that branch on the kind of failure.
    pub fn kind(&self) -> ErrorKind
    {
        match self {
            UnwindError::Open { .. } => ErrorKind::Open,
            UnwindError::Format(_) => ErrorKind::Format,
            UnwindError::Evaluation(_) => ErrorKind::Evaluation,
            UnwindError::TargetSetup(_) => ErrorKind::TargetSetup,
            UnwindError::Step(_) => ErrorKind::Step,
            UnwindError::RegisterRead(_) => ErrorKind::RegisterRead,
            UnwindError::MemoryRead { .. } => ErrorKind::Memory,
            UnwindError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the CFI resolver should degrade to frame-pointer chasing
    /// instead of failing.
    pub fn is_recoverable_by_fallback(&self) -> bool
    {
        matches!(self.kind(), ErrorKind::Open | ErrorKind::Format | ErrorKind::Io)
    }
}

/// Convenience type alias for `Result<T, UnwindError>`
///
/// ```rust
/// use framewalk_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, UnwindError>;
