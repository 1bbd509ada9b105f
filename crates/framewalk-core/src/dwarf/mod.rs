//! # DWARF Call Frame Information
//!
//! The unwinder does not interpret CFI programs itself; `gimli` does that and
//! hands back, per instruction address, a rule for the Canonical Frame Address
//! (CFA) and a rule per register. We lower those rules into small DWARF
//! location programs ([`ops::DwarfLocation`]) and evaluate the handful of
//! shapes that real compilers emit ([`eval::LocationEvaluator`]).
//!
//! - [`ops`]: operators, location programs and the operator-name table
//! - [`eval`]: CFA and saved-register evaluation
//! - [`cfi`]: locating CFI in an object file and building a [`cfi::CfaRecord`]
//!
//! ## References
//!
//! - [DWARF 5, 6.4 Call Frame Information](https://dwarfstd.org/doc/DWARF5.pdf)
//! - [gimli crate documentation](https://docs.rs/gimli/latest/gimli/)

pub mod cfi;
pub mod eval;
pub mod ops;

pub use cfi::{CallFrameInfo, CfaRecord};
pub use eval::LocationEvaluator;
pub use ops::{op_name, DwarfLocation, DwarfOp, RegisterLocation};
