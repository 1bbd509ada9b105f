//! Tests for single-frame resolution against real CFI

mod common;

use std::fs::File;
use std::sync::Arc;

use common::{write_object, WordMemory, BASE, LEAF, MIDDLE};
use framewalk_core::config::{FallbackPolicy, UnwindConfig};
use framewalk_core::dwarf::CallFrameInfo;
use framewalk_core::error::ErrorKind;
use framewalk_core::library::LibraryImage;
use framewalk_core::resolver::{CfiFrameResolver, FrameSource, UnwindFrame};
use framewalk_core::types::{Address, Architecture};

fn config() -> UnwindConfig
{
    UnwindConfig::default().with_architecture(Architecture::X86_64)
}

fn addr(value: u64) -> Address
{
    Address::from(value)
}

#[test]
fn test_parse_synthetic_object()
{
    let cfi = CallFrameInfo::parse(&common::synthetic_object(true)).unwrap();
    assert!(cfi.has_eh_frame());
    assert!(!cfi.has_debug_frame());
    assert_eq!(cfi.vaddr_base(), 0);
}

#[test]
fn test_object_without_cfi_is_format_error()
{
    let err = CallFrameInfo::parse(&common::synthetic_object(false)).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Format);
}

#[test]
fn test_resolve_frameless_function()
{
    let path = write_object("frameless", true);
    let memory = WordMemory::default().with(0x4000, BASE + MIDDLE + 0x10);
    let resolver = CfiFrameResolver::new(&memory, config());
    let library = LibraryImage::new(addr(BASE), &path);

    let frame = resolver
        .resolve(&library, addr(BASE + LEAF + 0x10), addr(0x5000), addr(0x4000))
        .unwrap();
    assert_eq!(frame.source(), FrameSource::Cfi);
    assert_eq!(frame.bp(), addr(0x5000));
    assert_eq!(frame.sp(), addr(0x4008));
    assert_eq!(frame.ra(), addr(BASE + MIDDLE + 0x10));
}

#[test]
fn test_resolve_frame_pointer_function()
{
    let path = write_object("framed", true);
    let memory = WordMemory::default().with(0x5000, 0x6000).with(0x5008, 0x40_1234);
    let resolver = CfiFrameResolver::new(&memory, config());
    let library = LibraryImage::new(addr(BASE), &path);

    let frame = resolver
        .resolve(&library, addr(BASE + MIDDLE + 0x10), addr(0x5000), addr(0x4008))
        .unwrap();
    assert_eq!(frame, UnwindFrame::new(0x6000u64, 0x5010u64, 0x40_1234u64));
}

#[test]
fn test_resolve_inside_prologue()
{
    // After `push rbp` only: CFA is rsp + 16 and rbp is saved at CFA - 16.
    let path = write_object("prologue", true);
    let memory = WordMemory::default().with(0x3ff8, 0x5000).with(0x4000, 0x40_1000);
    let resolver = CfiFrameResolver::new(&memory, config());
    let library = LibraryImage::new(addr(BASE), &path);

    let frame = resolver
        .resolve(&library, addr(BASE + MIDDLE + 0x2), addr(0x7777), addr(0x3ff8))
        .unwrap();
    assert_eq!(frame, UnwindFrame::new(0x5000u64, 0x4008u64, 0x40_1000u64));
}

#[test]
fn test_resolve_with_open_handle()
{
    let path = write_object("handle", true);
    let handle = Arc::new(File::open(&path).unwrap());
    let memory = WordMemory::default().with(0x4000, 0x40_2000);
    let resolver = CfiFrameResolver::new(&memory, config());
    let library = LibraryImage::with_handle(addr(BASE), &path, handle);

    let frame = resolver
        .resolve(&library, addr(BASE + LEAF), addr(0x5000), addr(0x4000))
        .unwrap();
    assert_eq!(frame.ra(), addr(0x40_2000));
}

#[test]
fn test_uncovered_address_uses_frame_pointer_chain()
{
    let path = write_object("uncovered", true);
    let memory = WordMemory::default()
        .with(0x5000, 0xA)
        .with(0x5008, 0xB)
        .with(0x5010, 0xC);
    let resolver = CfiFrameResolver::new(&memory, config());
    let library = LibraryImage::new(addr(BASE), &path);

    let frame = resolver
        .resolve(&library, addr(BASE + 0x150), addr(0x5000), addr(0x4000))
        .unwrap();
    assert_eq!(frame.source(), FrameSource::FramePointer);
    assert_eq!((frame.bp(), frame.ra(), frame.sp()), (addr(0xA), addr(0xB), addr(0xC)));
}

#[test]
fn test_uncovered_address_without_fallback()
{
    let path = write_object("no-fallback", true);
    let memory = WordMemory::default();
    let resolver = CfiFrameResolver::new(&memory, config().with_fallback(FallbackPolicy::Disabled));
    let library = LibraryImage::new(addr(BASE), &path);

    let err = resolver
        .resolve(&library, addr(BASE + 0x150), addr(0x5000), addr(0x4000))
        .unwrap_err();
    assert_eq!(err.to_string(), "could not find PC in unwind info");
}

#[test]
fn test_missing_library_falls_back()
{
    let memory = WordMemory::default()
        .with(0x5000, 0x6000)
        .with(0x5008, 0x40_1000)
        .with(0x5010, 0x5018);
    let resolver = CfiFrameResolver::new(&memory, config());
    let library = LibraryImage::new(addr(BASE), "/nonexistent/libframewalk-missing.so");

    let frame = resolver
        .resolve(&library, addr(BASE + 0x10), addr(0x5000), addr(0x4000))
        .unwrap();
    assert_eq!(frame.source(), FrameSource::FramePointer);
    assert_eq!(frame.ra(), addr(0x40_1000));
}

#[test]
fn test_missing_library_without_fallback()
{
    let memory = WordMemory::default();
    let resolver = CfiFrameResolver::new(&memory, config().with_fallback(FallbackPolicy::Disabled));
    let library = LibraryImage::new(addr(BASE), "/nonexistent/libframewalk-missing.so");

    let err = resolver
        .resolve(&library, addr(BASE + 0x10), addr(0x5000), addr(0x4000))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Open);
}

#[test]
fn test_fallback_with_unreadable_words()
{
    let memory = WordMemory::default().with(0x5008, 0x40_1000);
    let resolver = CfiFrameResolver::new(&memory, config());

    let frame = resolver.frame_pointer_fallback(addr(0x5000));
    // Caller sp could not be read, so the frame is terminal.
    assert!(frame.is_terminal());
    assert_eq!(frame, UnwindFrame::with_source(0u64, 0u64, 0u64, FrameSource::FramePointer));
}

#[test]
fn test_zero_return_address_is_terminal()
{
    let path = write_object("terminal", true);
    let memory = WordMemory::default().with(0x5000, 0x6000).with(0x5008, 0);
    let resolver = CfiFrameResolver::new(&memory, config());
    let library = LibraryImage::new(addr(BASE), &path);

    let frame = resolver
        .resolve(&library, addr(BASE + MIDDLE + 0x10), addr(0x5000), addr(0x4008))
        .unwrap();
    assert!(frame.is_terminal());
    assert_eq!((frame.bp(), frame.sp(), frame.ra()), (Address::ZERO, Address::ZERO, Address::ZERO));
}

#[test]
fn test_unreadable_saved_register_is_error()
{
    let path = write_object("unreadable", true);
    let memory = WordMemory::default();
    let resolver = CfiFrameResolver::new(&memory, config());
    let library = LibraryImage::new(addr(BASE), &path);

    let err = resolver
        .resolve(&library, addr(BASE + MIDDLE + 0x10), addr(0x5000), addr(0x4008))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Evaluation);
    assert!(err.to_string().starts_with("could not read register value at"));
}

#[test]
fn test_ip_below_base_uses_fallback()
{
    let memory = WordMemory::default().with(0x5000, 1).with(0x5008, 2).with(0x5010, 3);
    let resolver = CfiFrameResolver::new(&memory, config());
    let cfi = CallFrameInfo::parse(&common::synthetic_object(true)).unwrap();

    let frame = resolver
        .resolve_with(Some(&cfi), addr(BASE), addr(BASE - 0x10), addr(0x5000), addr(0x4000))
        .unwrap();
    assert_eq!(frame.source(), FrameSource::FramePointer);
    assert_eq!(frame.ra(), addr(2));
}

#[test]
fn test_frames_are_normalized_on_construction()
{
    let frame = UnwindFrame::with_source(0x5000u64, 0x4000u64, 0u64, FrameSource::FramePointer);
    assert_eq!((frame.bp(), frame.sp(), frame.ra()), (Address::ZERO, Address::ZERO, Address::ZERO));
    assert_eq!(frame.source(), FrameSource::FramePointer);

    let frame = UnwindFrame::new(0x5000u64, 0x4008u64, 0x40_1000u64);
    assert_eq!(
        (frame.bp(), frame.sp(), frame.ra()),
        (Address::from(0x5000), Address::from(0x4008), Address::from(0x40_1000))
    );
    assert!(UnwindFrame::default().is_terminal());
}
