//! Tests for reading ELF core images

use std::path::PathBuf;

use framewalk_core::config::UnwindConfig;
use framewalk_core::core_image::CoreImage;
use framewalk_core::error::ErrorKind;
use framewalk_core::library::LibraryDirectory;
use framewalk_core::memory::TargetMemory;
use framewalk_core::remote::{select_thread, CoreThreads};
use framewalk_core::resolver::{CfiFrameResolver, FrameSource};
use framewalk_core::types::{Address, Architecture, ThreadId};

const NT_PRSTATUS: u32 = 1;
const NT_FILE: u32 = 0x4649_4c45;

const STACK: u64 = 0x7ffc_0000_0000;

/// `struct elf_prstatus` with `pr_pid` and the x86_64 ip/sp/bp slots filled in
fn prstatus(pid: u32, ip: u64, sp: u64, bp: u64) -> Vec<u8>
{
    let mut desc = vec![0u8; 112 + 27 * 8];
    desc[32..36].copy_from_slice(&pid.to_le_bytes());
    for (index, value) in [(16usize, ip), (19, sp), (4, bp)] {
        let at = 112 + index * 8;
        desc[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }
    desc
}

fn nt_file(entries: &[(u64, u64, u64, &str)]) -> Vec<u8>
{
    let mut desc = Vec::new();
    desc.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    desc.extend_from_slice(&4096u64.to_le_bytes());
    for (start, end, page_offset, _) in entries {
        desc.extend_from_slice(&start.to_le_bytes());
        desc.extend_from_slice(&end.to_le_bytes());
        desc.extend_from_slice(&page_offset.to_le_bytes());
    }
    for (_, _, _, name) in entries {
        desc.extend_from_slice(name.as_bytes());
        desc.push(0);
    }
    desc
}

fn push_note(out: &mut Vec<u8>, kind: u32, desc: &[u8])
{
    out.extend_from_slice(&5u32.to_le_bytes());
    out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(b"CORE\0\0\0\0");
    out.extend_from_slice(desc);
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

fn push_phdr(out: &mut Vec<u8>, kind: u32, offset: u64, vaddr: u64, size: u64, align: u64)
{
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&4u32.to_le_bytes());
    for value in [offset, vaddr, 0, size, size, align] {
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// An x86_64 core with two threads, two mapped files and one page of stack.
fn synthetic_core(machine: u16) -> Vec<u8>
{
    synthetic_core_with_stack_at(machine, STACK)
}

fn synthetic_core_with_stack_at(machine: u16, stack_vaddr: u64) -> Vec<u8>
{
    let mut notes = Vec::new();
    push_note(&mut notes, NT_PRSTATUS, &prstatus(4242, 0x40_1234, STACK + 0x100, STACK + 0x200));
    push_note(&mut notes, NT_PRSTATUS, &prstatus(4243, 0x7f00_0000_1000, STACK + 0x800, STACK + 0x900));
    push_note(
        &mut notes,
        NT_FILE,
        &nt_file(&[
            (0x40_0000, 0x40_1000, 0, "/usr/bin/app"),
            (0x40_1000, 0x40_3000, 1, "/usr/bin/app"),
            (0x7f00_0000_0000, 0x7f00_0002_0000, 0, "/usr/lib/libc.so.6"),
        ]),
    );

    let mut stack = vec![0u8; 0x1000];
    for (offset, value) in [(0x200usize, STACK + 0x300), (0x208, 0x40_1500), (0x210, STACK + 0x218)] {
        stack[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    let notes_offset = 64 + 2 * 56;
    let load_offset = (notes_offset + notes.len() as u64 + 15) & !15;

    let mut core = Vec::new();
    core.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    core.extend_from_slice(&[0; 8]);
    core.extend_from_slice(&4u16.to_le_bytes()); // ET_CORE
    core.extend_from_slice(&machine.to_le_bytes());
    core.extend_from_slice(&1u32.to_le_bytes());
    core.extend_from_slice(&0u64.to_le_bytes());
    core.extend_from_slice(&64u64.to_le_bytes());
    core.extend_from_slice(&0u64.to_le_bytes());
    core.extend_from_slice(&0u32.to_le_bytes());
    for value in [64u16, 56, 2, 64, 0, 0] {
        core.extend_from_slice(&value.to_le_bytes());
    }

    push_phdr(&mut core, 4, notes_offset, 0, notes.len() as u64, 4); // PT_NOTE
    push_phdr(&mut core, 1, load_offset, stack_vaddr, stack.len() as u64, 0x1000); // PT_LOAD
    core.extend_from_slice(&notes);
    core.resize(load_offset as usize, 0);
    core.extend_from_slice(&stack);
    core
}

#[test]
fn test_threads_in_note_order()
{
    let core = CoreImage::parse(synthetic_core(62)).unwrap();
    assert_eq!(core.architecture(), Architecture::X86_64);

    let threads = core.threads();
    assert_eq!(threads.len(), 2);
    assert_eq!(threads[0].id, ThreadId(4242));
    assert_eq!(threads[0].ip, Address::from(0x40_1234));
    assert_eq!(threads[0].sp, Address::from(STACK + 0x100));
    assert_eq!(threads[0].bp, Address::from(STACK + 0x200));
    assert_eq!(threads[1].id, ThreadId(4243));
    assert_eq!(core.selected().map(|thread| thread.id), Some(ThreadId(4242)));
}

#[test]
fn test_mapped_files_form_library_directory()
{
    let core = CoreImage::parse(synthetic_core(62)).unwrap();
    assert_eq!(core.count(), 2);
    assert_eq!(core.name(0), Some(PathBuf::from("/usr/bin/app").as_path()));
    assert_eq!(core.base(0), Some(Address::from(0x40_0000)));
    assert_eq!(core.end(0), Some(Address::from(0x40_3000)));

    let library = core.find_by_address(Address::from(0x7f00_0000_1000)).unwrap();
    assert_eq!(library.path(), PathBuf::from("/usr/lib/libc.so.6").as_path());
    assert_eq!(library.base(), Address::from(0x7f00_0000_0000));
    assert!(core.find_by_address(Address::from(0x1000)).is_none());
}

#[test]
fn test_memory_reads_from_load_segments()
{
    let core = CoreImage::parse(synthetic_core(62)).unwrap();
    assert_eq!(core.read_u64(Address::from(STACK + 0x208)).unwrap(), 0x40_1500);

    let err = core.read_u64(Address::from(STACK + 0xffc)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Memory);
    assert!(core.read_u64(Address::from(0x1000)).is_err());
}

#[test]
fn test_load_segment_past_address_space_end()
{
    let top = u64::MAX - 0x10;
    let core = CoreImage::parse(synthetic_core_with_stack_at(62, top)).unwrap();

    let err = core.read_u64(Address::from(top)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Memory);
    assert!(core.read_u64(Address::from(u64::MAX - 4)).is_err());
}

#[test]
fn test_select_thread_by_id()
{
    let mut core = CoreImage::parse(synthetic_core(62)).unwrap();
    assert_eq!(select_thread(&mut core, ThreadId(4243)).unwrap(), 1);
    assert_eq!(core.selected_thread_id(), Some(ThreadId(4243)));
    assert_eq!(core.selected().map(|thread| thread.sp), Some(Address::from(STACK + 0x800)));
}

#[test]
fn test_select_missing_thread()
{
    let mut core = CoreImage::parse(synthetic_core(62)).unwrap();
    let err = select_thread(&mut core, ThreadId(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TargetSetup);
    assert!(err.to_string().starts_with("thread not found"));
}

#[test]
fn test_select_out_of_range_index()
{
    let mut core = CoreImage::parse(synthetic_core(62)).unwrap();
    assert!(core.select_thread(2).is_err());
    assert_eq!(core.selected_thread_id(), Some(ThreadId(4242)));
}

#[test]
fn test_rejects_unknown_machine()
{
    // EM_386
    let err = CoreImage::parse(synthetic_core(3)).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Format);
    assert!(err.to_string().contains("machine type"));
}

#[test]
fn test_open_from_file()
{
    let path = std::env::temp_dir().join(format!("framewalk-{}-core", std::process::id()));
    std::fs::write(&path, synthetic_core(62)).unwrap();

    let core = CoreImage::open(&path).unwrap();
    assert_eq!(core.path(), Some(path.as_path()));
    assert_eq!(core.threads().len(), 2);

    let err = CoreImage::open("/nonexistent/core").err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Open);
}

#[test]
fn test_frame_pointer_chain_over_core_memory()
{
    let core = CoreImage::parse(synthetic_core(62)).unwrap();
    let thread = *core.selected().unwrap();
    let resolver = CfiFrameResolver::new(&core, UnwindConfig::default().with_architecture(core.architecture()));

    let frame = resolver.frame_pointer_fallback(thread.bp);
    assert_eq!(frame.source(), FrameSource::FramePointer);
    assert_eq!(frame.bp(), Address::from(STACK + 0x300));
    assert_eq!(frame.ra(), Address::from(0x40_1500));
    assert_eq!(frame.sp(), Address::from(STACK + 0x218));
}
