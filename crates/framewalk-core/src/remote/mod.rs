//! # Remote Unwind Sessions
//!
//! A [`RemoteUnwindSession`] drives the cursor of an external unwinding
//! library (libunwind) against a live process or a core image. The first
//! frame's registers come from the debugger through a [`RegisterShim`], since
//! the library cannot read them from the thread itself.
//!
//! The library is reached through the [`UnwindLibrary`] trait. The real
//! binding lives in [`libunwind`] behind the `libunwind` cargo feature; tests
//! drive the session with scripted backends.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized --init--> Ready --step (more)--> Ready
//!                           |--step (done)--> Terminal
//!                           `--step (error)--> Failed
//! ```
//!
//! Dropping the session (or calling [`RemoteUnwindSession::dispose`]) tears
//! down the backing target, then the address space, then the cursor. Handles
//! acquired by a failed `init` are released the same way before the error is
//! returned.

#[cfg(feature = "libunwind")]
pub mod libunwind;
pub mod shim;
pub mod status;
pub mod thread;

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

pub use shim::{RegisterShim, ShimError, UnwindRegister};
pub use status::UnwindStatus;
pub use thread::{select_thread, CoreThreads};

use crate::error::{Result, UnwindError};
use crate::library::LibraryDirectory;
use crate::types::{Address, ThreadId};

/// Which kind of backing target a session unwinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind
{
    LiveProcess,
    CoreImage,
}

impl fmt::Display for TargetKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            TargetKind::LiveProcess => write!(f, "live process"),
            TargetKind::CoreImage => write!(f, "core image"),
        }
    }
}

/// What a session unwinds: a live thread, or a thread recorded in a core file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwindTarget
{
    LiveProcess
    {
        thread: ThreadId,
    },
    CoreImage
    {
        path: PathBuf,
        thread: ThreadId,
    },
}

impl UnwindTarget
{
    pub fn kind(&self) -> TargetKind
    {
        match self {
            UnwindTarget::LiveProcess { .. } => TargetKind::LiveProcess,
            UnwindTarget::CoreImage { .. } => TargetKind::CoreImage,
        }
    }

    pub fn thread(&self) -> ThreadId
    {
        match self {
            UnwindTarget::LiveProcess { thread } | UnwindTarget::CoreImage { thread, .. } => *thread,
        }
    }
}

/// Binding to an external unwinding library
///
/// Constructors report failures as [`UnwindError::TargetSetup`]. Cursor
/// operations return the library's raw status (negative on failure) so the
/// session can map it to a fixed message with [`UnwindStatus`].
///
/// Each `destroy_*`/`free_*` method is called exactly once for every handle
/// the matching constructor returned.
pub trait UnwindLibrary
{
    type Target;
    type AddressSpace;
    type Cursor;

    /// Backing handle for a live thread, read through ptrace.
    fn create_live_target(&mut self, thread: ThreadId) -> Result<Self::Target>;

    /// Backing handle over a core file.
    fn create_core_target(&mut self, path: &Path) -> Result<Self::Target>;

    fn core_thread_count(&self, target: &Self::Target) -> usize;

    fn select_core_thread(&mut self, target: &mut Self::Target, index: usize) -> Result<()>;

    fn core_thread_id(&self, target: &Self::Target) -> Option<ThreadId>;

    /// Address space whose register accessor answers from `shim`.
    ///
    /// The accessor table is the library's standard one for `kind`, with the
    /// register accessor replaced; it belongs to this address space alone.
    fn create_address_space(
        &mut self,
        kind: TargetKind,
        target: &mut Self::Target,
        shim: RegisterShim,
    ) -> Result<Self::AddressSpace>;

    fn init_cursor(
        &mut self,
        space: &mut Self::AddressSpace,
        target: &mut Self::Target,
    ) -> std::result::Result<Self::Cursor, i32>;

    /// Map the file backing a library at its load base (core targets only).
    fn add_backing_file(
        &mut self,
        target: &mut Self::Target,
        base: Address,
        path: &Path,
    ) -> std::result::Result<(), i32>;

    /// Advance one frame: `> 0` more frames, `0` outermost frame, `< 0` error.
    fn step(&mut self, cursor: &mut Self::Cursor) -> i32;

    fn read_register(&mut self, cursor: &mut Self::Cursor, register: UnwindRegister) -> std::result::Result<u64, i32>;

    fn destroy_target(&mut self, kind: TargetKind, target: Self::Target);

    fn destroy_address_space(&mut self, space: Self::AddressSpace);

    fn free_cursor(&mut self, cursor: Self::Cursor);
}

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState
{
    Uninitialized,
    Ready,
    Terminal,
    Failed,
}

/// Recorded threads of a core target, seen through the library.
struct LibraryCore<'a, L: UnwindLibrary>
{
    library: &'a mut L,
    target: &'a mut L::Target,
}

impl<L: UnwindLibrary> CoreThreads for LibraryCore<'_, L>
{
    fn thread_count(&self) -> usize
    {
        self.library.core_thread_count(self.target)
    }

    fn select_thread(&mut self, index: usize) -> Result<()>
    {
        self.library.select_core_thread(self.target, index)
    }

    fn selected_thread_id(&self) -> Option<ThreadId>
    {
        self.library.core_thread_id(self.target)
    }
}

/// A steppable cursor over one thread of a live process or core image
pub struct RemoteUnwindSession<L: UnwindLibrary>
{
    library: L,
    kind: TargetKind,
    target: Option<L::Target>,
    address_space: Option<L::AddressSpace>,
    cursor: Option<L::Cursor>,
    state: SessionState,
    failure: Option<String>,
}

impl<L: UnwindLibrary> RemoteUnwindSession<L>
{
    /// Set up a session seeded with the frame's `ip`, `sp` and `bp`
    ///
    /// For core targets the requested thread is selected first, and every
    /// library in `libraries` is mapped at its load base once the cursor
    /// exists. Live targets ignore `libraries`.
    #[tracing::instrument(level = "debug", skip_all, fields(kind = %target.kind(), thread = %target.thread()))]
    pub fn init(
        library: L,
        target: &UnwindTarget,
        shim: RegisterShim,
        libraries: &(impl LibraryDirectory + ?Sized),
    ) -> Result<Self>
    {
        let mut session = Self {
            library,
            kind: target.kind(),
            target: None,
            address_space: None,
            cursor: None,
            state: SessionState::Uninitialized,
            failure: None,
        };
        session.setup(target, shim, libraries)?;
        session.state = SessionState::Ready;
        debug!("unwind session ready");
        Ok(session)
    }

    fn setup(
        &mut self,
        target: &UnwindTarget,
        shim: RegisterShim,
        libraries: &(impl LibraryDirectory + ?Sized),
    ) -> Result<()>
    {
        let backing = match target {
            UnwindTarget::LiveProcess { thread } => self.library.create_live_target(*thread)?,
            UnwindTarget::CoreImage { path, .. } => self.library.create_core_target(path)?,
        };
        let backing = self.target.insert(backing);

        if self.kind == TargetKind::CoreImage {
            let mut core = LibraryCore {
                library: &mut self.library,
                target: &mut *backing,
            };
            select_thread(&mut core, target.thread())?;
        }

        let space = self.library.create_address_space(self.kind, backing, shim)?;
        let space = self.address_space.insert(space);

        let cursor = self.library.init_cursor(space, backing).map_err(|code| {
            let status = UnwindStatus::from_code(code);
            debug!("cursor initialization failed: {status}");
            UnwindError::TargetSetup(status.init_message().to_string())
        })?;
        self.cursor = Some(cursor);

        if self.kind == TargetKind::CoreImage {
            for index in 0..libraries.count() {
                let (Some(base), Some(path)) = (libraries.base(index), libraries.name(index)) else {
                    continue;
                };
                self.library.add_backing_file(backing, base, path).map_err(|code| {
                    UnwindError::TargetSetup(format!(
                        "could not add backing file {} at {base}: {}",
                        path.display(),
                        UnwindStatus::from_code(code)
                    ))
                })?;
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> TargetKind
    {
        self.kind
    }

    pub fn state(&self) -> SessionState
    {
        self.state
    }

    /// Advance to the caller's frame
    ///
    /// `Ok(true)` while frames remain, `Ok(false)` once the outermost frame is
    /// reached. Stepping a terminal session keeps returning `Ok(false)`
    /// without touching the cursor; stepping a failed one repeats its error.
    pub fn step(&mut self) -> Result<bool>
    {
        match self.state {
            SessionState::Ready => {}
            SessionState::Terminal => return Ok(false),
            SessionState::Failed => {
                return Err(UnwindError::Step(self.failure.clone().unwrap_or_default()));
            }
            SessionState::Uninitialized => {
                return Err(UnwindError::Step("unwind session is not initialized".to_string()));
            }
        }
        let Some(cursor) = self.cursor.as_mut() else {
            return Err(UnwindError::Step("unwind session has no cursor".to_string()));
        };

        let result = self.library.step(cursor);
        if result < 0 {
            let status = UnwindStatus::from_code(result);
            let message = status.step_message().to_string();
            debug!("step failed with {status}");
            self.state = SessionState::Failed;
            self.failure = Some(message.clone());
            Err(UnwindError::Step(message))
        } else if result == 0 {
            self.state = SessionState::Terminal;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    pub fn read_register(&mut self, register: UnwindRegister) -> Result<u64>
    {
        let Some(cursor) = self.cursor.as_mut() else {
            return Err(UnwindError::RegisterRead(format!("no cursor to read {register} from")));
        };
        self.library.read_register(cursor, register).map_err(|code| {
            UnwindError::RegisterRead(format!("{register}: {}", UnwindStatus::from_code(code)))
        })
    }

    pub fn frame_pointer(&mut self) -> Result<u64>
    {
        self.read_register(UnwindRegister::FramePointer)
    }

    pub fn stack_pointer(&mut self) -> Result<u64>
    {
        self.read_register(UnwindRegister::StackPointer)
    }

    pub fn instruction_pointer(&mut self) -> Result<u64>
    {
        self.read_register(UnwindRegister::InstructionPointer)
    }

    /// Release every handle. Equivalent to dropping the session.
    pub fn dispose(self) {}

    fn release(&mut self)
    {
        if let Some(target) = self.target.take() {
            self.library.destroy_target(self.kind, target);
        }
        if let Some(space) = self.address_space.take() {
            self.library.destroy_address_space(space);
        }
        if let Some(cursor) = self.cursor.take() {
            self.library.free_cursor(cursor);
        }
    }
}

impl<L: UnwindLibrary> Drop for RemoteUnwindSession<L>
{
    fn drop(&mut self)
    {
        if self.state == SessionState::Uninitialized && self.target.is_some() {
            debug!("releasing handles of a partially initialized unwind session");
        }
        self.release();
    }
}
