//! Unwinder configuration.

use crate::registers::RegisterTable;
use crate::types::Architecture;

/// Default bound on the number of frames a walk may produce.
pub const DEFAULT_MAX_FRAMES: usize = 256;

/// What the CFI resolver does when no CFI record covers the instruction pointer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FallbackPolicy
{
    /// Chase the saved frame-pointer chain (`push bp; mov bp, sp` layout).
    #[default]
    FramePointer,
    /// Report "could not find PC in unwind info" instead of guessing.
    Disabled,
}

/// Settings shared by the resolver and the frame walker
///
/// ## Example
///
/// ```rust
/// use framewalk_core::{Architecture, FallbackPolicy, UnwindConfig};
///
/// let config = UnwindConfig::default()
///     .with_architecture(Architecture::Arm64)
///     .with_max_frames(64)
///     .with_fallback(FallbackPolicy::Disabled);
/// assert_eq!(config.max_frames, 64);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindConfig
{
    pub architecture: Architecture,
    pub max_frames: usize,
    pub fallback: FallbackPolicy,
}

impl Default for UnwindConfig
{
    fn default() -> Self
    {
        Self {
            architecture: Architecture::current(),
            max_frames: DEFAULT_MAX_FRAMES,
            fallback: FallbackPolicy::default(),
        }
    }
}

impl UnwindConfig
{
    #[must_use]
    pub fn with_architecture(mut self, architecture: Architecture) -> Self
    {
        self.architecture = architecture;
        self
    }

    #[must_use]
    pub fn with_max_frames(mut self, max_frames: usize) -> Self
    {
        self.max_frames = max_frames;
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self
    {
        self.fallback = fallback;
        self
    }

    pub fn register_table(&self) -> &'static RegisterTable
    {
        RegisterTable::for_architecture(self.architecture)
    }
}
