//! # Loaded Libraries
//!
//! A [`LibraryImage`] names one loaded native binary: where it was loaded and
//! where its backing file lives. The [`LibraryDirectory`] trait is the
//! debugger backend's list of loaded images; [`ProcMaps`] builds one from
//! `/proc/<pid>/maps`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, UnwindError};
use crate::types::{Address, ProcessId};

/// One loaded native binary
///
/// The resolver borrows a `LibraryImage` for a single resolution call. When
/// the backend already holds the file open, it can hand the descriptor over
/// with [`LibraryImage::with_handle`] so the resolver does not reopen the path.
#[derive(Debug, Clone)]
pub struct LibraryImage
{
    base: Address,
    path: PathBuf,
    handle: Option<Arc<File>>,
}

impl LibraryImage
{
    pub fn new(base: Address, path: impl Into<PathBuf>) -> Self
    {
        Self {
            base,
            path: path.into(),
            handle: None,
        }
    }

    /// Image whose backing file is already open.
    pub fn with_handle(base: Address, path: impl Into<PathBuf>, handle: Arc<File>) -> Self
    {
        Self {
            base,
            path: path.into(),
            handle: Some(handle),
        }
    }

    /// Load base address.
    pub fn base(&self) -> Address
    {
        self.base
    }

    pub fn path(&self) -> &Path
    {
        &self.path
    }

    pub fn handle(&self) -> Option<&File>
    {
        self.handle.as_deref()
    }
}

/// Directory of the images loaded in the target
///
/// `count`, `base` and `name` are what the backend must provide; `end` lets
/// callers map an arbitrary address back to the image that contains it.
pub trait LibraryDirectory
{
    /// Number of loaded images.
    fn count(&self) -> usize;

    /// Load base of image `index`.
    fn base(&self, index: usize) -> Option<Address>;

    /// Backing file of image `index`.
    fn name(&self, index: usize) -> Option<&Path>;

    /// One past the highest mapped address of image `index`.
    fn end(&self, index: usize) -> Option<Address>;

    /// Image `index` as a [`LibraryImage`].
    fn library(&self, index: usize) -> Option<LibraryImage>
    {
        Some(LibraryImage::new(self.base(index)?, self.name(index)?))
    }

    /// Image whose mapped range contains `address`.
    fn find_by_address(&self, address: Address) -> Option<LibraryImage>
    {
        (0..self.count())
            .find(|&index| match (self.base(index), self.end(index)) {
                (Some(base), Some(end)) => base <= address && address < end,
                _ => false,
            })
            .and_then(|index| self.library(index))
    }
}

/// A mapped file as recorded by a library directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedFile
{
    pub path: PathBuf,
    pub base: Address,
    pub end: Address,
}

impl LibraryDirectory for [MappedFile]
{
    fn count(&self) -> usize
    {
        self.len()
    }

    fn base(&self, index: usize) -> Option<Address>
    {
        self.get(index).map(|file| file.base)
    }

    fn name(&self, index: usize) -> Option<&Path>
    {
        self.get(index).map(|file| file.path.as_path())
    }

    fn end(&self, index: usize) -> Option<Address>
    {
        self.get(index).map(|file| file.end)
    }
}

impl LibraryDirectory for Vec<MappedFile>
{
    fn count(&self) -> usize
    {
        self.as_slice().count()
    }

    fn base(&self, index: usize) -> Option<Address>
    {
        self.as_slice().base(index)
    }

    fn name(&self, index: usize) -> Option<&Path>
    {
        self.as_slice().name(index)
    }

    fn end(&self, index: usize) -> Option<Address>
    {
        self.as_slice().end(index)
    }
}

/// Group per-segment mappings into one entry per file
///
/// Each input is `(start, end, file_offset, path)`. The base of a file is the
/// start of its mapping at file offset zero; the end is the highest end of any
/// of its mappings. Files never mapped at offset zero are dropped, since
/// their load base is unknown.
pub(crate) fn group_mappings<I>(segments: I) -> Vec<MappedFile>
where
    I: IntoIterator<Item = (u64, u64, u64, PathBuf)>,
{
    let mut files: Vec<MappedFile> = Vec::new();
    let mut pending: Vec<(u64, u64, PathBuf)> = Vec::new();

    for (start, end, offset, path) in segments {
        if offset == 0 && !files.iter().any(|file| file.path == path) {
            files.push(MappedFile {
                path,
                base: Address::from(start),
                end: Address::from(end),
            });
        } else {
            pending.push((start, end, path));
        }
    }

    for (start, end, path) in pending {
        if let Some(file) = files
            .iter_mut()
            .find(|file| file.path == path && file.base.value() <= start)
        {
            file.end = file.end.max(Address::from(end));
        }
    }

    files
}

/// Loaded libraries of a live process, from `/proc/<pid>/maps`
#[derive(Debug, Clone, Default)]
pub struct ProcMaps
{
    files: Vec<MappedFile>,
}

impl ProcMaps
{
    /// Read and parse `/proc/<pid>/maps`.
    pub fn read(pid: ProcessId) -> Result<Self>
    {
        let path = PathBuf::from(format!("/proc/{pid}/maps"));
        let contents = fs::read_to_string(&path).map_err(|err| UnwindError::Open {
            path,
            reason: err.to_string(),
        })?;
        Self::parse(&contents)
    }

    /// Parse the text format of `/proc/<pid>/maps`
    ///
    /// ```text
    /// 7f3a1c000000-7f3a1c028000 r--p 00000000 fd:01 1234   /usr/lib/libc.so.6
    /// ```
    ///
    /// Only file-backed mappings with an absolute path are kept.
    pub fn parse(contents: &str) -> Result<Self>
    {
        let mut segments = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            let mut fields = line.split_whitespace();
            let (Some(range), Some(_perms), Some(offset), Some(_dev), Some(_inode)) =
                (fields.next(), fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let path = fields.collect::<Vec<_>>().join(" ");
            if !path.starts_with('/') {
                continue;
            }

            let malformed = || UnwindError::Format(format!("malformed maps line {}: {line}", line_no + 1));
            let (start, end) = range.split_once('-').ok_or_else(malformed)?;
            let start = u64::from_str_radix(start, 16).map_err(|_| malformed())?;
            let end = u64::from_str_radix(end, 16).map_err(|_| malformed())?;
            let offset = u64::from_str_radix(offset, 16).map_err(|_| malformed())?;
            segments.push((start, end, offset, PathBuf::from(path)));
        }

        Ok(Self {
            files: group_mappings(segments),
        })
    }

    pub fn files(&self) -> &[MappedFile]
    {
        &self.files
    }
}

impl LibraryDirectory for ProcMaps
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
