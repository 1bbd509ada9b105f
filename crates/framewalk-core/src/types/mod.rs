//! # Types
//!
//! Small value types shared by every unwinding strategy.

pub mod address;
pub mod process;

pub use address::Address;
pub use process::{Architecture, ProcessId, ThreadId};
