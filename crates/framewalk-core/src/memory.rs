//! # Target Memory
//!
//! The unwinder only ever needs one primitive from the debugger backend:
//! "read these bytes at this virtual address". Everything here is built on
//! [`TargetMemory::read_memory`].
//!
//! [`ProcessMemory`] implements it for a live Linux process through
//! `/proc/<pid>/mem`; [`crate::core_image::CoreImage`] implements it for
//! post-mortem core files.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use tracing::trace;

use crate::error::{Result, UnwindError};
use crate::types::{Address, ProcessId};

/// Read-only access to the target's address space.
///
/// Implementations should return an error (never panic) for unmapped or
/// partially mapped ranges. Reads may block, for example on core-file I/O.
pub trait TargetMemory
{
    /// Fill `buf` with the bytes at `address`.
    fn read_memory(&self, address: Address, buf: &mut [u8]) -> Result<()>;

    /// Read one little-endian machine word of `word_size` bytes (4 or 8).
    fn read_word(&self, address: Address, word_size: u8) -> Result<u64>
    {
        match word_size {
            4 => {
                let mut buf = [0u8; 4];
                self.read_memory(address, &mut buf)?;
                Ok(u64::from(u32::from_le_bytes(buf)))
            }
            _ => self.read_u64(address),
        }
    }

    /// Read a 64-bit little-endian value.
    fn read_u64(&self, address: Address) -> Result<u64>
    {
        let mut buf = [0u8; 8];
        self.read_memory(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl<T: TargetMemory + ?Sized> TargetMemory for &T
{
    fn read_memory(&self, address: Address, buf: &mut [u8]) -> Result<()>
    {
        (**self).read_memory(address, buf)
    }
}

impl<T: TargetMemory + ?Sized> TargetMemory for Box<T>
{
    fn read_memory(&self, address: Address, buf: &mut [u8]) -> Result<()>
    {
        (**self).read_memory(address, buf)
    }
}

/// Memory of a live process, read through `/proc/<pid>/mem`
///
/// The caller must already be allowed to trace the process (same user with a
/// permissive `ptrace_scope`, or attached), otherwise opening fails with
/// `EACCES`.
#[derive(Debug)]
pub struct ProcessMemory
{
    pid: ProcessId,
    mem: File,
}

impl ProcessMemory
{
    pub fn open(pid: ProcessId) -> Result<Self>
    {
        let path = PathBuf::from(format!("/proc/{pid}/mem"));
        let mem = File::open(&path).map_err(|err| UnwindError::Open {
            path,
            reason: err.to_string(),
        })?;
        Ok(Self { pid, mem })
    }

    pub fn pid(&self) -> ProcessId
    {
        self.pid
    }
}

impl TargetMemory for ProcessMemory
{
    fn read_memory(&self, address: Address, buf: &mut [u8]) -> Result<()>
    {
        self.mem.read_exact_at(buf, address.value()).map_err(|err| {
            trace!("read of {} bytes at {address} in pid {} failed: {err}", buf.len(), self.pid);
            UnwindError::MemoryRead {
                address,
                length: buf.len(),
            }
        })
    }
}
