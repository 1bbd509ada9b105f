//! # Frame Walking
//!
//! [`FrameWalker`] repeats [`CfiFrameResolver`] resolution outward from an
//! initial `(ip, bp, sp)`: find the library that contains `ip`, resolve the
//! caller, continue with `(ra, bp, sp)`.
//!
//! A walk stops at a terminal frame, when `ip` is outside every known library
//! (managed or unknown code), when the stack pointer does not move toward the
//! stack base, after `max_frames` frames, or on an error. The frames gathered
//! before the stop are always kept, together with the reason.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use tracing::debug;

use crate::config::{FallbackPolicy, UnwindConfig};
use crate::dwarf::CallFrameInfo;
use crate::error::{Result, UnwindError};
use crate::library::{LibraryDirectory, LibraryImage};
use crate::memory::TargetMemory;
use crate::resolver::{CfiFrameResolver, FrameSource, UnwindFrame};
use crate::symbols::{Symbol, Symbolizer};
use crate::types::Address;

/// One frame of a walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFrame
{
    pub ip: Address,
    pub bp: Address,
    pub sp: Address,
    pub library: Option<PathBuf>,
    pub symbol: Option<Symbol>,
    /// How this frame's registers were recovered from its callee.
    pub source: Option<FrameSource>,
}

/// Why a walk stopped
#[derive(Debug)]
pub enum WalkTermination
{
    /// The outermost frame was reached.
    Terminal,
    /// `ip` is not inside any known native library.
    OutsideLibraries,
    /// The caller's stack pointer was not above the callee's.
    StackNotAdvancing,
    MaxFrames,
    Error(UnwindError),
}

impl fmt::Display for WalkTermination
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            WalkTermination::Terminal => write!(f, "reached outermost frame"),
            WalkTermination::OutsideLibraries => write!(f, "instruction pointer outside native libraries"),
            WalkTermination::StackNotAdvancing => write!(f, "stack pointer did not advance"),
            WalkTermination::MaxFrames => write!(f, "frame limit reached"),
            WalkTermination::Error(err) => write!(f, "{err}"),
        }
    }
}

/// Frames of a walk, innermost first
#[derive(Debug)]
pub struct FrameWalk
{
    pub frames: Vec<NativeFrame>,
    pub termination: WalkTermination,
}

/// Walks the native caller chain of one thread
pub struct FrameWalker<'a, M: TargetMemory + ?Sized, D: LibraryDirectory + ?Sized>
{
    resolver: CfiFrameResolver<'a, M>,
    libraries: &'a D,
    symbolizer: Option<&'a Symbolizer>,
    cfi: HashMap<PathBuf, Option<CallFrameInfo>>,
}

impl<'a, M: TargetMemory + ?Sized, D: LibraryDirectory + ?Sized> FrameWalker<'a, M, D>
{
    pub fn new(memory: &'a M, libraries: &'a D, config: UnwindConfig) -> Self
    {
        Self {
            resolver: CfiFrameResolver::new(memory, config),
            libraries,
            symbolizer: None,
            cfi: HashMap::new(),
        }
    }

    /// Attach symbol names to walked frames.
    #[must_use]
    pub fn with_symbolizer(mut self, symbolizer: &'a Symbolizer) -> Self
    {
        self.symbolizer = Some(symbolizer);
        self
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn walk(&mut self, ip: Address, bp: Address, sp: Address) -> FrameWalk
    {
        let max_frames = self.resolver.config().max_frames;
        let mut frames = Vec::new();
        let (mut ip, mut bp, mut sp) = (ip, bp, sp);
        let mut source = None;

        let termination = loop {
            if frames.len() >= max_frames {
                break WalkTermination::MaxFrames;
            }

            let library = self.libraries.find_by_address(ip);
            frames.push(NativeFrame {
                ip,
                bp,
                sp,
                library: library.as_ref().map(|library| library.path().to_path_buf()),
                symbol: library
                    .as_ref()
                    .and_then(|library| self.symbolizer?.symbolize(library, ip)),
                source,
            });

            let Some(library) = library else {
                break WalkTermination::OutsideLibraries;
            };
            let caller = match self.resolve(&library, ip, bp, sp) {
                Ok(caller) => caller,
                Err(err) => break WalkTermination::Error(err),
            };
            if caller.is_terminal() {
                break WalkTermination::Terminal;
            }
            if caller.sp() <= sp {
                debug!("caller sp {} is not above {sp}", caller.sp());
                break WalkTermination::StackNotAdvancing;
            }

            ip = caller.ra();
            bp = caller.bp();
            sp = caller.sp();
            source = Some(caller.source());
        };

        debug!("walked {} frames: {termination}", frames.len());
        FrameWalk { frames, termination }
    }

    fn resolve(&mut self, library: &LibraryImage, ip: Address, bp: Address, sp: Address) -> Result<UnwindFrame>
    {
        let path = library.path();
        if !self.cfi.contains_key(path) {
            let cfi = match CallFrameInfo::load(library) {
                Ok(cfi) => Some(cfi),
                Err(err)
                    if err.is_recoverable_by_fallback()
                        && matches!(self.resolver.config().fallback, FallbackPolicy::FramePointer) =>
                {
                    debug!("no usable CFI in {}: {err}", path.display());
                    None
                }
                Err(err) => return Err(err),
            };
            self.cfi.insert(path.to_path_buf(), cfi);
        }

        let cfi = self.cfi.get(path).and_then(Option::as_ref);
        self.resolver.resolve_with(cfi, library.base(), ip, bp, sp)
    }
}
