//! Shared fixtures: sparse target memory and a synthetic x86_64 object with
//! hand-written `.eh_frame` CFI.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;

use framewalk_core::error::{Result, UnwindError};
use framewalk_core::library::MappedFile;
use framewalk_core::memory::TargetMemory;
use framewalk_core::types::Address;
use gimli::write::{
    Address as WriteAddress, CallFrameInstruction, CommonInformationEntry, EhFrame, EndianVec, FrameDescriptionEntry,
    FrameTable,
};
use gimli::{Encoding, Format, LittleEndian, X86_64};
use object::write::{Object, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope};

/// Load base used for the synthetic library in every test.
pub const BASE: u64 = 0x7f00_0000_0000;

/// Size of the synthetic `.text` section.
pub const TEXT_SIZE: u64 = 0x200;

/// `framewalk_leaf`: frameless, `[0x00, 0x40)`.
pub const LEAF: u64 = 0x00;

/// `framewalk_middle`: sets up `rbp` after 4 bytes, `[0x40, 0x80)`.
pub const MIDDLE: u64 = 0x40;

/// Sparse word-addressed memory
#[derive(Default)]
pub struct WordMemory(HashMap<u64, u64>);

impl WordMemory
{
    pub fn with(mut self, address: u64, value: u64) -> Self
    {
        self.0.insert(address, value);
        self
    }
}

impl TargetMemory for WordMemory
{
    fn read_memory(&self, address: Address, buf: &mut [u8]) -> Result<()>
    {
        let word = self.0.get(&address.value()).ok_or(UnwindError::MemoryRead {
            address,
            length: buf.len(),
        })?;
        buf.copy_from_slice(&word.to_le_bytes()[..buf.len()]);
        Ok(())
    }
}

/// `.eh_frame` bytes for the two synthetic functions.
fn eh_frame_bytes() -> Vec<u8>
{
    let encoding = Encoding {
        format: Format::Dwarf32,
        version: 1,
        address_size: 8,
    };
    let mut table = FrameTable::default();

    // On entry the return address sits at the top of the stack.
    let mut cie = CommonInformationEntry::new(encoding, 1, -8, X86_64::RA);
    cie.add_instruction(CallFrameInstruction::Cfa(X86_64::RSP, 8));
    cie.add_instruction(CallFrameInstruction::Offset(X86_64::RA, -8));
    let cie = table.add_cie(cie);

    table.add_fde(cie, FrameDescriptionEntry::new(WriteAddress::Constant(LEAF), 0x40));

    // push rbp; mov rbp, rsp
    let mut middle = FrameDescriptionEntry::new(WriteAddress::Constant(MIDDLE), 0x40);
    middle.add_instruction(1, CallFrameInstruction::CfaOffset(16));
    middle.add_instruction(1, CallFrameInstruction::Offset(X86_64::RBP, -16));
    middle.add_instruction(4, CallFrameInstruction::CfaRegister(X86_64::RBP));
    table.add_fde(cie, middle);

    let mut eh_frame = EhFrame(EndianVec::new(LittleEndian));
    table.write_eh_frame(&mut eh_frame).unwrap();
    eh_frame.0.into_vec()
}

fn add_function(object: &mut Object<'_>, section: object::write::SectionId, name: &str, value: u64)
{
    object.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value,
        size: 0x40,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(section),
        flags: SymbolFlags::None,
    });
}

/// Bytes of an x86_64 ELF object with `.text`, `.eh_frame` and two symbols.
pub fn synthetic_object(with_cfi: bool) -> Vec<u8>
{
    let mut object = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = object.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    object.append_section_data(text, &[0x90; TEXT_SIZE as usize], 16);
    add_function(&mut object, text, "framewalk_leaf", LEAF);
    add_function(&mut object, text, "framewalk_middle", MIDDLE);

    if with_cfi {
        let eh_frame = object.add_section(Vec::new(), b".eh_frame".to_vec(), SectionKind::ReadOnlyData);
        object.append_section_data(eh_frame, &eh_frame_bytes(), 8);
    }
    object.write().unwrap()
}

/// Write the synthetic object to a file unique to this test.
pub fn write_object(name: &str, with_cfi: bool) -> PathBuf
{
    let path = std::env::temp_dir().join(format!("framewalk-{}-{name}.o", std::process::id()));
    std::fs::write(&path, synthetic_object(with_cfi)).unwrap();
    path
}

/// Library directory holding just the synthetic object at [`BASE`].
pub fn directory(path: PathBuf) -> Vec<MappedFile>
{
    vec![MappedFile {
        path,
        base: Address::from(BASE),
        end: Address::from(BASE + TEXT_SIZE),
    }]
}
