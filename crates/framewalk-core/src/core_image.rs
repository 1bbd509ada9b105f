//! # Core Images
//!
//! Reader for Linux ELF core files, so everything that works against a live
//! process also works post-mortem:
//!
//! - `PT_LOAD` segments back [`TargetMemory`] reads.
//! - The `NT_FILE` note is the library directory (which file was mapped where).
//! - Every `NT_PRSTATUS` note is one recorded thread, with its id and the
//!   registers the unwinder starts from.
//!
//! ## References
//!
//! - [core(5) man page](https://man7.org/linux/man-pages/man5/core.5.html)
//! - `struct elf_prstatus` in `include/uapi/linux/elfcore.h`

use std::fs;
use std::path::{Path, PathBuf};

use object::elf::{FileHeader64, EM_AARCH64, EM_X86_64, ET_CORE, PT_LOAD, PT_NOTE};
use object::read::elf::{FileHeader, ProgramHeader};
use object::Endianness;
use tracing::{debug, trace};

use crate::error::{Result, UnwindError};
use crate::library::{group_mappings, LibraryDirectory, MappedFile};
use crate::memory::TargetMemory;
use crate::remote::thread::CoreThreads;
use crate::types::{Address, Architecture, ThreadId};

const NT_PRSTATUS: u32 = 1;
const NT_FILE: u32 = 0x4649_4c45;

/// Offset of `pr_pid` inside `struct elf_prstatus` on 64-bit Linux.
const PRSTATUS_PID_OFFSET: usize = 32;
/// Offset of `pr_reg` inside `struct elf_prstatus` on 64-bit Linux.
const PRSTATUS_REGS_OFFSET: usize = 112;

/// A thread recorded in the core, with the registers unwinding starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreThread
{
    pub id: ThreadId,
    pub ip: Address,
    pub sp: Address,
    pub bp: Address,
}

#[derive(Debug, Clone, Copy)]
struct LoadSegment
{
    vaddr: u64,
    offset: u64,
    filesz: u64,
}

/// A parsed ELF core file
pub struct CoreImage
{
    path: Option<PathBuf>,
    data: Vec<u8>,
    architecture: Architecture,
    segments: Vec<LoadSegment>,
    threads: Vec<CoreThread>,
    files: Vec<MappedFile>,
    selected: usize,
}

impl CoreImage
{
    /// Read and parse the core file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self>
    {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|err| UnwindError::Open {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let mut core = Self::parse(data)?;
        core.path = Some(path.to_path_buf());
        Ok(core)
    }

    /// Parse an in-memory core image.
    pub fn parse(data: Vec<u8>) -> Result<Self>
    {
        let header = FileHeader64::<Endianness>::parse(&*data).map_err(format_error)?;
        let endian = header.endian().map_err(format_error)?;
        if header.e_type(endian) != ET_CORE {
            return Err(UnwindError::Format("not an ELF core file".into()));
        }
        let architecture = match header.e_machine(endian) {
            EM_X86_64 => Architecture::X86_64,
            EM_AARCH64 => Architecture::Arm64,
            other => {
                return Err(UnwindError::Format(format!(
                    "unsupported core image machine type {other}"
                )))
            }
        };

        let mut segments = Vec::new();
        let mut threads = Vec::new();
        let mut files = Vec::new();

        for phdr in header.program_headers(endian, &*data).map_err(format_error)? {
            match phdr.p_type(endian) {
                PT_LOAD => segments.push(LoadSegment {
                    vaddr: phdr.p_vaddr(endian),
                    offset: phdr.p_offset(endian),
                    filesz: phdr.p_filesz(endian),
                }),
                PT_NOTE => {
                    let Some(mut notes) = phdr.notes(endian, &*data).map_err(format_error)? else {
                        continue;
                    };
                    while let Some(note) = notes.next().map_err(format_error)? {
                        match note.n_type(endian) {
                            NT_PRSTATUS => threads.push(parse_prstatus(architecture, note.desc())?),
                            NT_FILE => files = parse_nt_file(note.desc())?,
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        debug!(
            "core image: {architecture}, {} load segments, {} threads, {} mapped files",
            segments.len(),
            threads.len(),
            files.len()
        );

        Ok(Self {
            path: None,
            data,
            architecture,
            segments,
            threads,
            files,
            selected: 0,
        })
    }

    /// Path the core was read from, if it came from a file.
    pub fn path(&self) -> Option<&Path>
    {
        self.path.as_deref()
    }

    pub fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    /// Recorded threads, in note order.
    pub fn threads(&self) -> &[CoreThread]
    {
        &self.threads
    }

    /// Files mapped into the process, one entry per file.
    pub fn mapped_files(&self) -> &[MappedFile]
    {
        &self.files
    }

    /// Thread chosen with [`CoreThreads::select_thread`] (the first one by default).
    pub fn selected(&self) -> Option<&CoreThread>
    {
        self.threads.get(self.selected)
    }
}

impl TargetMemory for CoreImage
{
    fn read_memory(&self, address: Address, buf: &mut [u8]) -> Result<()>
    {
        let start = address.value();
        let len = buf.len() as u64;
        let segment = self.segments.iter().find(|segment| {
            start >= segment.vaddr
                && start
                    .checked_add(len)
                    .zip(segment.vaddr.checked_add(segment.filesz))
                    .is_some_and(|(end, segment_end)| end <= segment_end)
        });

        let bytes = segment.and_then(|segment| {
            let from = segment.offset.checked_add(start - segment.vaddr)?;
            let from = usize::try_from(from).ok()?;
            self.data.get(from..from.checked_add(buf.len())?)
        });

        match bytes {
            Some(bytes) => {
                buf.copy_from_slice(bytes);
                Ok(())
            }
            None => {
                trace!("address {address} (+{len}) is not captured in the core image");
                Err(UnwindError::MemoryRead {
                    address,
                    length: buf.len(),
                })
            }
        }
    }
}

impl LibraryDirectory for CoreImage
{
    fn count(&self) -> usize
    {
        self.files.len()
    }

    fn base(&self, index: usize) -> Option<Address>
    {
        self.files.base(index)
    }

    fn name(&self, index: usize) -> Option<&Path>
    {
        self.files.name(index)
    }

    fn end(&self, index: usize) -> Option<Address>
    {
        self.files.end(index)
    }
}

impl CoreThreads for CoreImage
{
    fn thread_count(&self) -> usize
    {
        self.threads.len()
    }

    fn select_thread(&mut self, index: usize) -> Result<()>
    {
        if index >= self.threads.len() {
            return Err(UnwindError::TargetSetup(format!(
                "thread index {index} out of range ({} threads recorded)",
                self.threads.len()
            )));
        }
        self.selected = index;
        Ok(())
    }

    fn selected_thread_id(&self) -> Option<ThreadId>
    {
        self.selected().map(|thread| thread.id)
    }
}

fn format_error(err: object::Error) -> UnwindError
{
    UnwindError::Format(format!("malformed core image: {err}"))
}

fn word_at(desc: &[u8], offset: usize) -> Option<u64>
{
    let bytes = desc.get(offset..offset + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

fn parse_prstatus(architecture: Architecture, desc: &[u8]) -> Result<CoreThread>
{
    let truncated = || UnwindError::Format("truncated NT_PRSTATUS note".into());

    let pid = desc
        .get(PRSTATUS_PID_OFFSET..PRSTATUS_PID_OFFSET + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(truncated)?;

    // Indices into `user_regs_struct` / `user_pt_regs`.
    let (ip, sp, bp) = match architecture {
        Architecture::X86_64 => (16, 19, 4),
        Architecture::Arm64 => (32, 31, 29),
    };
    let reg = |index: usize| word_at(desc, PRSTATUS_REGS_OFFSET + index * 8).ok_or_else(truncated);

    Ok(CoreThread {
        id: ThreadId(u64::from(pid)),
        ip: Address::from(reg(ip)?),
        sp: Address::from(reg(sp)?),
        bp: Address::from(reg(bp)?),
    })
}

fn parse_nt_file(desc: &[u8]) -> Result<Vec<MappedFile>>
{
    let truncated = || UnwindError::Format("truncated NT_FILE note".into());

    let count = usize::try_from(word_at(desc, 0).ok_or_else(truncated)?).map_err(|_| truncated())?;
    let page_size = word_at(desc, 8).ok_or_else(truncated)?;
    let names_start = count
        .checked_mul(24)
        .and_then(|table| table.checked_add(16))
        .ok_or_else(truncated)?;
    let names = desc.get(names_start..).ok_or_else(truncated)?;
    let mut names = names.split(|&byte| byte == 0);

    let mut segments = Vec::with_capacity(count);
    for index in 0..count {
        let entry = 16 + index * 24;
        let start = word_at(desc, entry).ok_or_else(truncated)?;
        let end = word_at(desc, entry + 8).ok_or_else(truncated)?;
        let page_offset = word_at(desc, entry + 16).ok_or_else(truncated)?;
        let name = names.next().ok_or_else(truncated)?;
        let path = PathBuf::from(String::from_utf8_lossy(name).into_owned());
        segments.push((start, end, page_offset.wrapping_mul(page_size), path));
    }

    Ok(group_mappings(segments))
}
