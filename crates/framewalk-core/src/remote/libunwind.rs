//! # libunwind Backend
//!
//! [`Libunwind`] implements [`UnwindLibrary`] on top of the system libunwind's
//! remote-unwinding API (`libunwind-ptrace` for live threads,
//! `libunwind-coredump` for core files). Linking is set up by the build script
//! when the `libunwind` feature is enabled.
//!
//! ## Per-session accessor tables
//!
//! libunwind reads the first frame's registers through the `access_reg`
//! accessor. Each address space gets its own accessor table: the standard
//! `_UPT_accessors`/`_UCD_accessors` entries are wrapped so that the argument
//! libunwind hands to every accessor is a boxed [`ForwardArg`] owned by that
//! address space. The wrappers forward to the standard entries with the real
//! backing handle, except `access_reg`, which answers from the session's
//! [`RegisterShim`]. Two sessions never share a table or seeded registers.
//!
//! ## Safety Notes
//!
//! Every pointer handed to libunwind (the backing handle, the address space,
//! the forwarding argument and the cursor buffer) is owned by one of the handle
//! types below and outlives every libunwind call that can observe it: the
//! session releases the target, then the address space, then the cursor, and
//! never calls into libunwind after that.
//!
//! ## References
//!
//! - [libunwind-ptrace(3)](https://www.nongnu.org/libunwind/man/libunwind-ptrace(3).html)
//! - [unw_create_addr_space(3)](https://www.nongnu.org/libunwind/man/unw_create_addr_space(3).html)

#![allow(unused_doc_comments)]

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;

use libc::{c_char, c_int, c_void, pid_t, size_t};
use tracing::{debug, trace};

use super::shim::{RegisterShim, UnwindRegister};
use super::status::UnwindStatus;
use super::{TargetKind, UnwindLibrary};
use crate::error::{Result, UnwindError};
use crate::types::{Address, ThreadId};

type UnwWord = u64;
type UnwRegnum = c_int;
type UnwAddrSpace = *mut c_void;

/// Words reserved for `unw_cursor_t`; larger than any architecture needs.
const CURSOR_WORDS: usize = 4096;

#[cfg(target_arch = "x86_64")]
mod regnum
{
    pub const IP: libc::c_int = 16;
    pub const SP: libc::c_int = 7;
    pub const BP: libc::c_int = 6;
}

#[cfg(target_arch = "aarch64")]
mod regnum
{
    pub const IP: libc::c_int = 32;
    pub const SP: libc::c_int = 31;
    pub const BP: libc::c_int = 29;
}

#[repr(C, align(16))]
struct UnwCursor
{
    opaque: [UnwWord; CURSOR_WORDS],
}

/// The accessor entries every libunwind version has, in declaration order
#[repr(C)]
#[derive(Clone, Copy)]
struct Accessors
{
    find_proc_info: Option<unsafe extern "C" fn(UnwAddrSpace, UnwWord, *mut c_void, c_int, *mut c_void) -> c_int>,
    put_unwind_info: Option<unsafe extern "C" fn(UnwAddrSpace, *mut c_void, *mut c_void)>,
    get_dyn_info_list_addr: Option<unsafe extern "C" fn(UnwAddrSpace, *mut UnwWord, *mut c_void) -> c_int>,
    access_mem: Option<unsafe extern "C" fn(UnwAddrSpace, UnwWord, *mut UnwWord, c_int, *mut c_void) -> c_int>,
    access_reg: Option<unsafe extern "C" fn(UnwAddrSpace, UnwRegnum, *mut UnwWord, c_int, *mut c_void) -> c_int>,
    access_fpreg: Option<unsafe extern "C" fn(UnwAddrSpace, UnwRegnum, *mut c_void, c_int, *mut c_void) -> c_int>,
    resume: Option<unsafe extern "C" fn(UnwAddrSpace, *mut c_void, *mut c_void) -> c_int>,
    get_proc_name:
        Option<unsafe extern "C" fn(UnwAddrSpace, UnwWord, *mut c_char, size_t, *mut UnwWord, *mut c_void) -> c_int>,
}

/// Accessor table handed to `unw_create_addr_space`
///
/// Newer libunwind releases append entries; they stay null here.
#[repr(C)]
struct AccessorTable
{
    core: Accessors,
    reserved: [usize; 6],
}

extern "C" {
    /// Standard accessors for ptrace-backed targets.
    static _UPT_accessors: Accessors;
    /// Standard accessors for core-file targets.
    static _UCD_accessors: Accessors;

    /// Create a ptrace backing handle for thread `pid`. Null on failure.
    fn _UPT_create(pid: pid_t) -> *mut c_void;
    fn _UPT_destroy(info: *mut c_void);

    /// Open a core file. Null on failure.
    fn _UCD_create(filename: *const c_char) -> *mut c_void;
    fn _UCD_destroy(info: *mut c_void);
    fn _UCD_get_num_threads(info: *mut c_void) -> c_int;
    fn _UCD_select_thread(info: *mut c_void, index: c_int);
    fn _UCD_get_pid(info: *mut c_void) -> pid_t;
    /// Map `filename` at `vaddr` so unwind info inside it can be found.
    fn _UCD_add_backing_file_at_vaddr(info: *mut c_void, vaddr: UnwWord, filename: *const c_char) -> c_int;

    #[cfg_attr(target_arch = "x86_64", link_name = "_Ux86_64_create_addr_space")]
    #[cfg_attr(target_arch = "aarch64", link_name = "_Uaarch64_create_addr_space")]
    fn unw_create_addr_space(accessors: *mut AccessorTable, byteorder: c_int) -> UnwAddrSpace;

    #[cfg_attr(target_arch = "x86_64", link_name = "_Ux86_64_destroy_addr_space")]
    #[cfg_attr(target_arch = "aarch64", link_name = "_Uaarch64_destroy_addr_space")]
    fn unw_destroy_addr_space(space: UnwAddrSpace);

    #[cfg_attr(target_arch = "x86_64", link_name = "_Ux86_64_init_remote")]
    #[cfg_attr(target_arch = "aarch64", link_name = "_Uaarch64_init_remote")]
    fn unw_init_remote(cursor: *mut UnwCursor, space: UnwAddrSpace, arg: *mut c_void) -> c_int;

    /// `> 0` more frames, `0` outermost frame, `< 0` error.
    #[cfg_attr(target_arch = "x86_64", link_name = "_Ux86_64_step")]
    #[cfg_attr(target_arch = "aarch64", link_name = "_Uaarch64_step")]
    fn unw_step(cursor: *mut UnwCursor) -> c_int;

    #[cfg_attr(target_arch = "x86_64", link_name = "_Ux86_64_get_reg")]
    #[cfg_attr(target_arch = "aarch64", link_name = "_Uaarch64_get_reg")]
    fn unw_get_reg(cursor: *mut UnwCursor, register: UnwRegnum, value: *mut UnwWord) -> c_int;
}

/// Argument libunwind passes to every accessor of one address space
struct ForwardArg
{
    base: Accessors,
    inner: *mut c_void,
    shim: RegisterShim,
}

const EUNSPEC: c_int = -1;

/// # Safety
///
/// `arg` must be the `ForwardArg` registered with `unw_init_remote`.
unsafe fn forward_arg<'a>(arg: *mut c_void) -> &'a ForwardArg
{
    &*arg.cast::<ForwardArg>()
}

unsafe extern "C" fn forward_find_proc_info(
    space: UnwAddrSpace,
    ip: UnwWord,
    info: *mut c_void,
    need_unwind_info: c_int,
    arg: *mut c_void,
) -> c_int
{
    let forward = forward_arg(arg);
    match forward.base.find_proc_info {
        Some(base) => base(space, ip, info, need_unwind_info, forward.inner),
        None => EUNSPEC,
    }
}

unsafe extern "C" fn forward_put_unwind_info(space: UnwAddrSpace, info: *mut c_void, arg: *mut c_void)
{
    let forward = forward_arg(arg);
    if let Some(base) = forward.base.put_unwind_info {
        base(space, info, forward.inner);
    }
}

unsafe extern "C" fn forward_get_dyn_info_list_addr(space: UnwAddrSpace, addr: *mut UnwWord, arg: *mut c_void) -> c_int
{
    let forward = forward_arg(arg);
    match forward.base.get_dyn_info_list_addr {
        Some(base) => base(space, addr, forward.inner),
        None => EUNSPEC,
    }
}

unsafe extern "C" fn forward_access_mem(
    space: UnwAddrSpace,
    addr: UnwWord,
    value: *mut UnwWord,
    write: c_int,
    arg: *mut c_void,
) -> c_int
{
    let forward = forward_arg(arg);
    match forward.base.access_mem {
        Some(base) => base(space, addr, value, write, forward.inner),
        None => EUNSPEC,
    }
}

unsafe extern "C" fn shim_access_reg(
    _space: UnwAddrSpace,
    register: UnwRegnum,
    value: *mut UnwWord,
    write: c_int,
    arg: *mut c_void,
) -> c_int
{
    let forward = forward_arg(arg);
    match forward.shim.access(unwind_register(register), write != 0) {
        Ok(seeded) => {
            *value = seeded;
            0
        }
        Err(err) => err.code(),
    }
}

unsafe extern "C" fn forward_access_fpreg(
    space: UnwAddrSpace,
    register: UnwRegnum,
    value: *mut c_void,
    write: c_int,
    arg: *mut c_void,
) -> c_int
{
    let forward = forward_arg(arg);
    match forward.base.access_fpreg {
        Some(base) => base(space, register, value, write, forward.inner),
        None => EUNSPEC,
    }
}

unsafe extern "C" fn forward_resume(space: UnwAddrSpace, cursor: *mut c_void, arg: *mut c_void) -> c_int
{
    let forward = forward_arg(arg);
    match forward.base.resume {
        Some(base) => base(space, cursor, forward.inner),
        None => EUNSPEC,
    }
}

unsafe extern "C" fn forward_get_proc_name(
    space: UnwAddrSpace,
    addr: UnwWord,
    buf: *mut c_char,
    len: size_t,
    offset: *mut UnwWord,
    arg: *mut c_void,
) -> c_int
{
    let forward = forward_arg(arg);
    match forward.base.get_proc_name {
        Some(base) => base(space, addr, buf, len, offset, forward.inner),
        None => EUNSPEC,
    }
}

fn unwind_register(register: UnwRegnum) -> Option<UnwindRegister>
{
    match register {
        regnum::IP => Some(UnwindRegister::InstructionPointer),
        regnum::SP => Some(UnwindRegister::StackPointer),
        regnum::BP => Some(UnwindRegister::FramePointer),
        _ => None,
    }
}

fn library_register(register: UnwindRegister) -> UnwRegnum
{
    match register {
        UnwindRegister::InstructionPointer => regnum::IP,
        UnwindRegister::StackPointer => regnum::SP,
        UnwindRegister::FramePointer => regnum::BP,
    }
}

fn c_path(path: &Path) -> Option<CString>
{
    CString::new(path.as_os_str().as_bytes()).ok()
}

/// Backing handle: a `_UPT_create` or `_UCD_create` result
pub struct LibunwindTarget
{
    handle: NonNull<c_void>,
}

/// An address space with its own accessor table and forwarding argument
pub struct LibunwindAddressSpace
{
    raw: NonNull<c_void>,
    _accessors: Box<AccessorTable>,
    forward: Box<ForwardArg>,
}

pub struct LibunwindCursor
{
    raw: Box<UnwCursor>,
}

/// The system libunwind
#[derive(Debug, Default, Clone, Copy)]
pub struct Libunwind;

impl UnwindLibrary for Libunwind
{
    type Target = LibunwindTarget;
    type AddressSpace = LibunwindAddressSpace;
    type Cursor = LibunwindCursor;

    fn create_live_target(&mut self, thread: ThreadId) -> Result<LibunwindTarget>
    {
        let pid = pid_t::try_from(thread.raw())
            .map_err(|_| UnwindError::TargetSetup(format!("thread id {thread} does not fit in a pid")))?;
        // SAFETY: `_UPT_create` only records the pid; it does not touch the thread yet.
        let handle = unsafe { _UPT_create(pid) };
        NonNull::new(handle)
            .map(|handle| LibunwindTarget { handle })
            .ok_or_else(|| UnwindError::TargetSetup(format!("could not create ptrace unwind target for thread {thread}")))
    }

    fn create_core_target(&mut self, path: &Path) -> Result<LibunwindTarget>
    {
        let c_path = c_path(path)
            .ok_or_else(|| UnwindError::TargetSetup(format!("core path {} contains a NUL byte", path.display())))?;
        // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
        let handle = unsafe { _UCD_create(c_path.as_ptr()) };
        NonNull::new(handle)
            .map(|handle| LibunwindTarget { handle })
            .ok_or_else(|| UnwindError::TargetSetup(format!("could not open core image {}", path.display())))
    }

    fn core_thread_count(&self, target: &LibunwindTarget) -> usize
    {
        // SAFETY: `target` holds a live `_UCD_create` handle.
        let count = unsafe { _UCD_get_num_threads(target.handle.as_ptr()) };
        usize::try_from(count).unwrap_or(0)
    }

    fn select_core_thread(&mut self, target: &mut LibunwindTarget, index: usize) -> Result<()>
    {
        let index = c_int::try_from(index)
            .map_err(|_| UnwindError::TargetSetup(format!("core thread index {index} out of range")))?;
        // SAFETY: `index` is below `_UCD_get_num_threads` and the handle is live.
        unsafe { _UCD_select_thread(target.handle.as_ptr(), index) };
        Ok(())
    }

    fn core_thread_id(&self, target: &LibunwindTarget) -> Option<ThreadId>
    {
        // SAFETY: `target` holds a live `_UCD_create` handle.
        let pid = unsafe { _UCD_get_pid(target.handle.as_ptr()) };
        u64::try_from(pid).ok().map(ThreadId)
    }

    fn create_address_space(
        &mut self,
        kind: TargetKind,
        target: &mut LibunwindTarget,
        shim: RegisterShim,
    ) -> Result<LibunwindAddressSpace>
    {
        // SAFETY: the standard accessor tables are immutable statics of the linked library.
        let base = unsafe {
            match kind {
                TargetKind::LiveProcess => _UPT_accessors,
                TargetKind::CoreImage => _UCD_accessors,
            }
        };
        let forward = Box::new(ForwardArg {
            base,
            inner: target.handle.as_ptr(),
            shim,
        });
        let mut accessors = Box::new(AccessorTable {
            core: Accessors {
                find_proc_info: Some(forward_find_proc_info),
                put_unwind_info: Some(forward_put_unwind_info),
                get_dyn_info_list_addr: Some(forward_get_dyn_info_list_addr),
                access_mem: Some(forward_access_mem),
                access_reg: Some(shim_access_reg),
                access_fpreg: Some(forward_access_fpreg),
                resume: Some(forward_resume),
                get_proc_name: Some(forward_get_proc_name),
            },
            reserved: [0; 6],
        });

        // SAFETY: libunwind copies the table; byte order 0 selects the host's.
        let raw = unsafe { unw_create_addr_space(&mut *accessors, 0) };
        let raw = NonNull::new(raw)
            .ok_or_else(|| UnwindError::TargetSetup("could not create address space for unwinder".to_string()))?;
        trace!("created {kind} address space");
        Ok(LibunwindAddressSpace {
            raw,
            _accessors: accessors,
            forward,
        })
    }

    fn init_cursor(
        &mut self,
        space: &mut LibunwindAddressSpace,
        _target: &mut LibunwindTarget,
    ) -> std::result::Result<LibunwindCursor, i32>
    {
        let mut raw = Box::new(UnwCursor {
            opaque: [0; CURSOR_WORDS],
        });
        let arg: *mut ForwardArg = &mut *space.forward;
        // SAFETY: the cursor buffer, the address space and the forwarding
        // argument all stay alive until the session releases them.
        let result = unsafe { unw_init_remote(&mut *raw, space.raw.as_ptr(), arg.cast()) };
        if result != 0 {
            return Err(result);
        }
        Ok(LibunwindCursor { raw })
    }

    fn add_backing_file(
        &mut self,
        target: &mut LibunwindTarget,
        base: Address,
        path: &Path,
    ) -> std::result::Result<(), i32>
    {
        let c_path = c_path(path).ok_or(-UnwindStatus::Invalid.code())?;
        // SAFETY: the handle is a live core target and `c_path` is NUL-terminated.
        let result = unsafe { _UCD_add_backing_file_at_vaddr(target.handle.as_ptr(), base.value(), c_path.as_ptr()) };
        if result < 0 {
            debug!("could not add backing file {} at {base}", path.display());
            return Err(result);
        }
        Ok(())
    }

    fn step(&mut self, cursor: &mut LibunwindCursor) -> i32
    {
        // SAFETY: the cursor was initialized by `unw_init_remote`.
        unsafe { unw_step(&mut *cursor.raw) }
    }

    fn read_register(&mut self, cursor: &mut LibunwindCursor, register: UnwindRegister) -> std::result::Result<u64, i32>
    {
        let mut value: UnwWord = 0;
        // SAFETY: the cursor was initialized by `unw_init_remote`.
        let result = unsafe { unw_get_reg(&mut *cursor.raw, library_register(register), &mut value) };
        if result != 0 {
            return Err(result);
        }
        Ok(value)
    }

    fn destroy_target(&mut self, kind: TargetKind, target: LibunwindTarget)
    {
        // SAFETY: each handle is destroyed exactly once, with the destructor matching its constructor.
        unsafe {
            match kind {
                TargetKind::LiveProcess => _UPT_destroy(target.handle.as_ptr()),
                TargetKind::CoreImage => _UCD_destroy(target.handle.as_ptr()),
            }
        }
    }

    fn destroy_address_space(&mut self, space: LibunwindAddressSpace)
    {
        // SAFETY: the address space is destroyed exactly once; the boxed table
        // and forwarding argument are dropped after it.
        unsafe { unw_destroy_addr_space(space.raw.as_ptr()) };
        drop(space);
    }

    fn free_cursor(&mut self, cursor: LibunwindCursor)
    {
        drop(cursor);
    }
}
