//! # framewalk-core
//!
//! Native call-frame unwinding for a traced process or a post-mortem core image.
//!
//! Given an instruction pointer inside a loaded native library plus the current
//! frame and stack pointers, this crate produces the caller's frame pointer,
//! stack pointer and return address, one frame at a time, walking outward until
//! the outermost frame is reached.
//!
//! Two strategies are provided:
//!
//! - [`resolver::CfiFrameResolver`]: interprets the DWARF call frame information
//!   (`.eh_frame` / `.debug_frame`) of the library that owns the instruction
//!   pointer, falling back to frame-pointer chasing when no CFI record covers it.
//! - [`remote::RemoteUnwindSession`]: drives an external unwinding library's
//!   cursor, seeded with the register values the debugger already knows, against
//!   either a live process or a core image.
//!
//! The whole crate is read-only with respect to the target: it never writes
//! registers or memory.
//!
//! ## Why unsafe code is needed
//!
//! The optional `libunwind` feature binds the system unwinding library through
//! FFI. Everything else is safe Rust.

#![allow(unsafe_code)] // Required for the libunwind FFI backend

pub mod config;
pub mod core_image;
pub mod dwarf;
pub mod error;
pub mod library;
pub mod memory;
pub mod registers;
pub mod remote;
pub mod resolver;
pub mod symbols;
pub mod types;
pub mod walker;

pub use config::{FallbackPolicy, UnwindConfig};
pub use error::{ErrorKind, Result, UnwindError};
pub use library::{LibraryDirectory, LibraryImage};
pub use memory::TargetMemory;
pub use remote::{RemoteUnwindSession, TargetKind, UnwindLibrary, UnwindTarget};
pub use resolver::{CfiFrameResolver, UnwindFrame};
pub use types::{Address, Architecture, ProcessId, ThreadId};
pub use walker::{FrameWalk, FrameWalker, NativeFrame, WalkTermination};
