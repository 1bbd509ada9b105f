//! # CFI Frame Resolution
//!
//! [`CfiFrameResolver`] computes the caller's `(bp, sp, ra)` for one frame.
//!
//! 1. Load the CFI of the library that owns the instruction pointer.
//! 2. Find the CFI row for `ip - base`.
//! 3. Evaluate the CFA, then the saved frame pointer, stack pointer and return
//!    address from that row.
//!
//! When the library has no CFI, or none covers the address, the resolver falls
//! back to the frame-pointer chain: the three words at `bp` are taken as the
//! saved frame pointer, the return address and the caller's stack pointer,
//! which is the layout a `push bp; mov bp, sp` prologue leaves behind.
//! Architectures whose prologues save `fp`/`lr` in another order get a
//! best-effort answer at most.

use std::fmt;

use tracing::{debug, trace};

use crate::config::{FallbackPolicy, UnwindConfig};
use crate::dwarf::{CallFrameInfo, CfaRecord, LocationEvaluator};
use crate::error::{Result, UnwindError};
use crate::library::LibraryImage;
use crate::memory::TargetMemory;
use crate::types::Address;

/// How a frame was recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameSource
{
    /// From a CFI row.
    #[default]
    Cfi,
    /// From the saved frame-pointer chain.
    FramePointer,
}

/// The caller's registers, as recovered for one frame
///
/// A frame whose return address or stack pointer is zero is terminal; its
/// frame pointer is then reported as zero too, so a terminal frame is always
/// `(0, 0, 0)`. Frames are only built through [`UnwindFrame::new`] and
/// [`UnwindFrame::with_source`], which apply that rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnwindFrame
{
    bp: Address,
    sp: Address,
    ra: Address,
    source: FrameSource,
}

impl UnwindFrame
{
    pub fn new(bp: impl Into<Address>, sp: impl Into<Address>, ra: impl Into<Address>) -> Self
    {
        Self::with_source(bp, sp, ra, FrameSource::Cfi)
    }

    pub fn with_source(
        bp: impl Into<Address>,
        sp: impl Into<Address>,
        ra: impl Into<Address>,
        source: FrameSource,
    ) -> Self
    {
        let (bp, sp, ra) = (bp.into(), sp.into(), ra.into());
        if ra.is_zero() || sp.is_zero() {
            return Self {
                source,
                ..Self::default()
            };
        }
        Self { bp, sp, ra, source }
    }

    /// Caller's frame pointer.
    pub fn bp(&self) -> Address
    {
        self.bp
    }

    /// Caller's stack pointer.
    pub fn sp(&self) -> Address
    {
        self.sp
    }

    /// Return address, the caller's instruction pointer.
    pub fn ra(&self) -> Address
    {
        self.ra
    }

    pub fn source(&self) -> FrameSource
    {
        self.source
    }

    /// No caller frames remain.
    pub fn is_terminal(&self) -> bool
    {
        self.ra.is_zero() || self.sp.is_zero()
    }
}

impl fmt::Display for UnwindFrame
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "bp={} sp={} ra={}", self.bp, self.sp, self.ra)
    }
}

/// Resolves single frames through DWARF CFI
pub struct CfiFrameResolver<'a, M: TargetMemory + ?Sized>
{
    config: UnwindConfig,
    memory: &'a M,
}

impl<'a, M: TargetMemory + ?Sized> CfiFrameResolver<'a, M>
{
    pub fn new(memory: &'a M, config: UnwindConfig) -> Self
    {
        Self { config, memory }
    }

    pub fn config(&self) -> &UnwindConfig
    {
        &self.config
    }

    /// Resolve the caller of the frame at `ip` inside `library`
    ///
    /// Open and format failures of the library's object degrade to the
    /// frame-pointer fallback. Evaluation errors abort the resolution.
    #[tracing::instrument(level = "trace", skip_all, fields(library = %library.path().display(), ip = %ip))]
    pub fn resolve(&self, library: &LibraryImage, ip: Address, bp: Address, sp: Address) -> Result<UnwindFrame>
    {
        match CallFrameInfo::load(library) {
            Ok(cfi) => self.resolve_with(Some(&cfi), library.base(), ip, bp, sp),
            Err(err) if err.is_recoverable_by_fallback() => {
                debug!("no usable CFI in {}: {err}", library.path().display());
                match self.config.fallback {
                    FallbackPolicy::FramePointer => Ok(self.frame_pointer_fallback(bp)),
                    FallbackPolicy::Disabled => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Resolve against already-loaded CFI
    ///
    /// `cfi` is `None` when the library's object could not be read, which
    /// always takes the fallback path.
    pub fn resolve_with(
        &self,
        cfi: Option<&CallFrameInfo>,
        base: Address,
        ip: Address,
        bp: Address,
        sp: Address,
    ) -> Result<UnwindFrame>
    {
        let table = self.config.register_table();
        let record = match (cfi, ip.offset_from(base)) {
            (Some(cfi), Some(offset)) => {
                let address = offset.wrapping_add(cfi.vaddr_base());
                cfi.record_for(address, table).unwrap_or_else(|err| {
                    debug!("CFI lookup for offset {offset:#x} failed: {err}");
                    None
                })
            }
            _ => None,
        };

        match record {
            Some(record) => self.evaluate_record(&record, bp, sp),
            None => match self.config.fallback {
                FallbackPolicy::FramePointer => {
                    debug!("no CFI record for {ip}, following frame pointer {bp}");
                    Ok(self.frame_pointer_fallback(bp))
                }
                FallbackPolicy::Disabled => Err(UnwindError::Evaluation(
                    "could not find PC in unwind info".to_string(),
                )),
            },
        }
    }

    /// Compute the caller's registers from a CFI record.
    pub fn evaluate_record(&self, record: &CfaRecord, bp: Address, sp: Address) -> Result<UnwindFrame>
    {
        let table = self.config.register_table();
        let return_address = record.return_address_register();
        if !table.contains(return_address) {
            return Err(UnwindError::Evaluation(format!(
                "could not determine return address register (column {return_address})"
            )));
        }

        let evaluator = LocationEvaluator::new(table, self.memory);
        let cfa = evaluator.compute_cfa(record.cfa(), bp, sp)?;
        trace!("CFA = {cfa} ({})", record.cfa().describe());

        let fp = table.frame_pointer();
        let sp_register = table.stack_pointer();
        let caller_bp = evaluator.compute_register(fp, &record.register(fp), cfa, bp, sp)?;
        let caller_sp = evaluator.compute_register(sp_register, &record.register(sp_register), cfa, bp, sp)?;
        let ra = evaluator.compute_register(return_address, &record.register(return_address), cfa, bp, sp)?;

        Ok(UnwindFrame::with_source(caller_bp, caller_sp, ra, FrameSource::Cfi))
    }

    /// Read saved bp, return address and caller sp from the three words at `bp`.
    ///
    /// Each word that cannot be read is reported as zero on its own.
    pub fn frame_pointer_fallback(&self, bp: Address) -> UnwindFrame
    {
        let word_size = self.config.architecture.word_size();
        let read = |index: u64| {
            let address = bp.word(index, word_size);
            self.memory.read_word(address, word_size).unwrap_or_else(|err| {
                trace!("frame-pointer fallback read at {address} failed: {err}");
                0
            })
        };
        let saved_bp = read(0);
        let ra = read(1);
        let caller_sp = read(2);
        UnwindFrame::with_source(saved_bp, caller_sp, ra, FrameSource::FramePointer)
    }
}
