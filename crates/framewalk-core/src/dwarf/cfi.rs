//! Locating call frame information and lowering it into location programs.
//!
//! [`CallFrameInfo`] holds the CFI sections of one object file. A lookup
//! searches `.eh_frame` first (through the `.eh_frame_hdr` binary-search table
//! when the object has one) and `.debug_frame` second, then turns the unwind
//! row for the address into a [`CfaRecord`].

use std::borrow::Cow;
use std::fs;
use std::os::unix::fs::FileExt;

use gimli::{
    constants, BaseAddresses, CfaRule, DebugFrame, EhFrame, EhFrameHdr, FrameDescriptionEntry, Reader, RegisterRule,
    RunTimeEndian, UnwindContext, UnwindExpression, UnwindSection, UnwindTableRow,
};
use object::{Object, ObjectSection, ObjectSegment};
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::ops::{DwarfLocation, DwarfOp, RegisterLocation};
use crate::error::{Result, UnwindError};
use crate::library::LibraryImage;
use crate::registers::RegisterTable;

struct SectionBlob
{
    data: Vec<u8>,
    address: u64,
}

fn load_section_blob(file: &object::File<'_>, name: &str) -> Result<Option<SectionBlob>>
{
    let Some(section) = file.section_by_name(name) else {
        return Ok(None);
    };
    let data = section
        .uncompressed_data()
        .map_err(|err| UnwindError::Format(format!("failed to read {name}: {err}")))?;
    let data = match data {
        Cow::Borrowed(bytes) => bytes.to_vec(),
        Cow::Owned(vec) => vec,
    };
    Ok(Some(SectionBlob {
        data,
        address: section.address(),
    }))
}

fn map_gimli_error(context: &str, err: gimli::Error) -> UnwindError
{
    UnwindError::Format(format!("{context}: {err}"))
}

/// CFI sections of one object file
pub struct CallFrameInfo
{
    endian: RunTimeEndian,
    address_size: u8,
    /// Link-time address of the first loadable segment.
    vaddr_base: u64,
    text_address: Option<u64>,
    eh_frame: Option<SectionBlob>,
    eh_frame_hdr: Option<SectionBlob>,
    debug_frame: Option<SectionBlob>,
}

impl CallFrameInfo
{
    /// Read the CFI of `image`'s backing object.
    ///
    /// An already-open handle on the image is read in place; otherwise the
    /// path is opened read-only. The file is not kept open.
    pub fn load(image: &LibraryImage) -> Result<Self>
    {
        let open_error = |err: std::io::Error| UnwindError::Open {
            path: image.path().to_path_buf(),
            reason: err.to_string(),
        };
        let bytes = match image.handle() {
            Some(handle) => {
                let length = handle.metadata().map_err(open_error)?.len();
                let length = usize::try_from(length).map_err(|_| UnwindError::Open {
                    path: image.path().to_path_buf(),
                    reason: "file too large".to_string(),
                })?;
                let mut bytes = vec![0u8; length];
                handle.read_exact_at(&mut bytes, 0).map_err(open_error)?;
                bytes
            }
            None => fs::read(image.path()).map_err(open_error)?,
        };
        Self::parse(&bytes).map_err(|err| match err {
            UnwindError::Format(reason) => UnwindError::Format(format!("{}: {reason}", image.path().display())),
            other => other,
        })
    }

    /// Extract the CFI sections from an in-memory object file.
    pub fn parse(bytes: &[u8]) -> Result<Self>
    {
        let file = object::File::parse(bytes).map_err(|err| UnwindError::Format(format!("not an object file: {err}")))?;

        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };
        let address_size = if file.is_64() { 8 } else { 4 };
        let vaddr_base = file.segments().map(|segment| segment.address()).min().unwrap_or(0);
        let text_address = file.section_by_name(".text").map(|section| section.address());

        let eh_frame = load_section_blob(&file, ".eh_frame")?;
        let eh_frame_hdr = load_section_blob(&file, ".eh_frame_hdr")?;
        let debug_frame = load_section_blob(&file, ".debug_frame")?;

        if eh_frame.is_none() && debug_frame.is_none() {
            return Err(UnwindError::Format("no .eh_frame or .debug_frame section".to_string()));
        }

        Ok(Self {
            endian,
            address_size,
            vaddr_base,
            text_address,
            eh_frame,
            eh_frame_hdr,
            debug_frame,
        })
    }

    /// Link-time address that the load base of the image corresponds to.
    ///
    /// Zero for shared objects and position-independent executables.
    pub fn vaddr_base(&self) -> u64
    {
        self.vaddr_base
    }

    pub fn has_eh_frame(&self) -> bool
    {
        self.eh_frame.is_some()
    }

    pub fn has_debug_frame(&self) -> bool
    {
        self.debug_frame.is_some()
    }

    /// CFI record covering the link-time `address`, if any section has one.
    pub fn record_for(&self, address: u64, table: &'static RegisterTable) -> Result<Option<CfaRecord>>
    {
        if let Some(record) = self.eh_frame_record(address, table)? {
            return Ok(Some(record));
        }
        self.debug_frame_record(address, table)
    }

    fn bases(&self, section: &SectionBlob) -> BaseAddresses
    {
        let mut bases = BaseAddresses::default().set_eh_frame(section.address);
        if let Some(text) = self.text_address {
            bases = bases.set_text(text);
        }
        bases
    }

    fn eh_frame_record(&self, address: u64, table: &'static RegisterTable) -> Result<Option<CfaRecord>>
    {
        let Some(blob) = &self.eh_frame else {
            return Ok(None);
        };
        let mut bases = self.bases(blob);
        let mut eh_frame = EhFrame::new(&blob.data, self.endian);
        eh_frame.set_address_size(self.address_size);

        if let Some(hdr) = &self.eh_frame_hdr {
            bases = bases.set_eh_frame_hdr(hdr.address);
            let header = EhFrameHdr::new(&hdr.data, self.endian);
            if let Some(fde) = self.fde_from_hdr(&eh_frame, header, &bases, address)? {
                return record_from_fde(&eh_frame, &bases, &fde, address, table);
            }
        }

        match find_fde(&eh_frame, &bases, address)? {
            Some(fde) => record_from_fde(&eh_frame, &bases, &fde, address, table),
            None => Ok(None),
        }
    }

    fn debug_frame_record(&self, address: u64, table: &'static RegisterTable) -> Result<Option<CfaRecord>>
    {
        let Some(blob) = &self.debug_frame else {
            return Ok(None);
        };
        let bases = self.bases(blob);
        let mut debug_frame = DebugFrame::new(&blob.data, self.endian);
        debug_frame.set_address_size(self.address_size);

        match find_fde(&debug_frame, &bases, address)? {
            Some(fde) => record_from_fde(&debug_frame, &bases, &fde, address, table),
            None => Ok(None),
        }
    }

    /// Use the `.eh_frame_hdr` index to locate the FDE for `address`.
    fn fde_from_hdr<R>(
        &self,
        eh_frame: &EhFrame<R>,
        header: EhFrameHdr<R>,
        bases: &BaseAddresses,
        address: u64,
    ) -> Result<Option<FrameDescriptionEntry<R>>>
    where
        R: Reader<Offset = usize>,
    {
        let parsed = header
            .parse(bases, self.address_size)
            .map_err(|err| map_gimli_error("parsing .eh_frame_hdr", err))?;
        let Some(table) = parsed.table() else {
            return Ok(None);
        };

        let pointer = match table.lookup(address, bases) {
            Ok(pointer) => pointer,
            Err(err) => {
                trace!("no .eh_frame_hdr entry for {address:#x}: {err}");
                return Ok(None);
            }
        };
        let offset = table
            .pointer_to_offset(pointer)
            .map_err(|err| map_gimli_error("resolving FDE pointer", err))?;
        let partial = eh_frame
            .partial_fde_from_offset(bases, offset)
            .map_err(|err| map_gimli_error("loading FDE from .eh_frame_hdr", err))?;
        let fde = partial
            .parse(|section, base_addresses, cie_offset| section.cie_from_offset(base_addresses, cie_offset))
            .map_err(|err| map_gimli_error("parsing frame description entry", err))?;

        Ok(fde.contains(address).then_some(fde))
    }
}

fn find_fde<R, S>(section: &S, bases: &BaseAddresses, address: u64) -> Result<Option<FrameDescriptionEntry<R>>>
where
    R: Reader<Offset = usize>,
    S: UnwindSection<R>,
{
    match section.fde_for_address(bases, address, |section, bases, offset| section.cie_from_offset(bases, offset)) {
        Ok(fde) => Ok(Some(fde)),
        Err(gimli::Error::NoUnwindInfoForAddress) => Ok(None),
        Err(err) => Err(map_gimli_error("searching for frame description entry", err)),
    }
}

fn record_from_fde<R, S>(
    section: &S,
    bases: &BaseAddresses,
    fde: &FrameDescriptionEntry<R>,
    address: u64,
    table: &'static RegisterTable,
) -> Result<Option<CfaRecord>>
where
    R: Reader<Offset = usize>,
    S: UnwindSection<R>,
{
    let mut ctx = UnwindContext::<usize>::new();
    let row = match fde.unwind_info_for_address(section, bases, &mut ctx, address) {
        Ok(row) => row,
        Err(gimli::Error::NoUnwindInfoForAddress) => return Ok(None),
        Err(err) => return Err(map_gimli_error("evaluating unwind row", err)),
    };
    trace!(
        "unwind row {:#x}..{:#x} covers {address:#x}",
        row.start_address(),
        row.end_address()
    );

    let return_address = fde.cie().return_address_register().0;
    CfaRecord::from_row(section, row, return_address, table).map(Some)
}

/// What CFI says about one instruction address
///
/// Registers the row does not mention get the platform ABI default:
/// callee-saved registers keep their value, the stack pointer becomes the
/// CFA, everything else is undefined.
#[derive(Debug, Clone)]
pub struct CfaRecord
{
    table: &'static RegisterTable,
    cfa: DwarfLocation,
    return_address: u16,
    rules: SmallVec<[(u16, RegisterLocation); 8]>,
}

impl CfaRecord
{
    /// Build a record directly from lowered locations.
    pub fn new(table: &'static RegisterTable, cfa: DwarfLocation, return_address: u16) -> Self
    {
        Self {
            table,
            cfa,
            return_address,
            rules: SmallVec::new(),
        }
    }

    /// Set the location of `register`, replacing the ABI default.
    #[must_use]
    pub fn with_register(mut self, register: u16, location: RegisterLocation) -> Self
    {
        self.rules.retain(|(number, _)| *number != register);
        self.rules.push((register, location));
        self
    }

    fn from_row<R, S>(
        section: &S,
        row: &UnwindTableRow<usize>,
        return_address: u16,
        table: &'static RegisterTable,
    ) -> Result<Self>
    where
        R: Reader<Offset = usize>,
        S: UnwindSection<R>,
    {
        let cfa = match row.cfa() {
            CfaRule::RegisterAndOffset { register, offset } => {
                DwarfLocation::from_ops([DwarfOp::bregx(register.0, *offset)])
            }
            CfaRule::Expression(expression) => DwarfLocation::parse(expression_bytes(section, expression)?)?,
        };

        let mut record = Self::new(table, cfa, return_address);
        for (register, rule) in row.registers() {
            let location = lower_rule(section, rule)?;
            record = record.with_register(register.0, location);
        }
        Ok(record)
    }

    /// Location program for the Canonical Frame Address.
    pub fn cfa(&self) -> &DwarfLocation
    {
        &self.cfa
    }

    /// DWARF number of the column holding the return address.
    pub fn return_address_register(&self) -> u16
    {
        self.return_address
    }

    /// How to recover `register` in the caller.
    pub fn register(&self, register: u16) -> RegisterLocation
    {
        self.rules
            .iter()
            .find(|(number, _)| *number == register)
            .map_or_else(|| self.abi_default(register), |(_, location)| location.clone())
    }

    /// Whether the CFI row itself has a rule for `register`.
    pub fn tracks(&self, register: u16) -> bool
    {
        self.rules.iter().any(|(number, _)| *number == register)
    }

    fn abi_default(&self, register: u16) -> RegisterLocation
    {
        if register == self.table.stack_pointer() {
            RegisterLocation::Expression(cfa_value())
        } else if register == self.table.frame_pointer() || self.table.is_callee_saved(register) {
            RegisterLocation::SameValue
        } else {
            RegisterLocation::Undefined
        }
    }
}

fn cfa_value() -> DwarfLocation
{
    DwarfLocation::from_ops([
        DwarfOp::new(constants::DW_OP_call_frame_cfa),
        DwarfOp::new(constants::DW_OP_stack_value),
    ])
}

fn expression_bytes<R, S>(section: &S, expression: &UnwindExpression<usize>) -> Result<R>
where
    R: Reader<Offset = usize>,
    S: UnwindSection<R>,
{
    expression
        .get(section)
        .map(|expression| expression.0)
        .map_err(|err| map_gimli_error("reading CFI expression", err))
}

/// Lower one gimli register rule into a location program rooted at the CFA.
fn lower_rule<R, S>(section: &S, rule: &RegisterRule<usize>) -> Result<RegisterLocation>
where
    R: Reader<Offset = usize>,
    S: UnwindSection<R>,
{
    let cfa = DwarfOp::new(constants::DW_OP_call_frame_cfa);
    let location = match rule {
        RegisterRule::Undefined => return Ok(RegisterLocation::Undefined),
        RegisterRule::SameValue => return Ok(RegisterLocation::SameValue),
        RegisterRule::Offset(offset) => {
            DwarfLocation::from_ops([cfa, DwarfOp::with(constants::DW_OP_plus_uconst, *offset as u64)])
        }
        RegisterRule::ValOffset(0) => cfa_value(),
        RegisterRule::ValOffset(offset) => DwarfLocation::from_ops([
            cfa,
            DwarfOp::with(constants::DW_OP_plus_uconst, *offset as u64),
            DwarfOp::new(constants::DW_OP_stack_value),
        ]),
        RegisterRule::Register(register) => {
            DwarfLocation::from_ops([DwarfOp::with(constants::DW_OP_regx, u64::from(register.0))])
        }
        RegisterRule::Expression(expression) => {
            let mut location = DwarfLocation::from_ops([cfa]);
            for op in DwarfLocation::parse(expression_bytes(section, expression)?)?.ops() {
                location.push(*op);
            }
            location
        }
        RegisterRule::ValExpression(expression) => {
            let mut location = DwarfLocation::from_ops([cfa]);
            for op in DwarfLocation::parse(expression_bytes(section, expression)?)?.ops() {
                location.push(*op);
            }
            location.push(DwarfOp::new(constants::DW_OP_stack_value));
            location
        }
        RegisterRule::Constant(value) => DwarfLocation::from_ops([DwarfOp::with(constants::DW_OP_constu, *value)]),
        other => {
            debug!("register rule {other:?} has no location form");
            DwarfLocation::new()
        }
    };
    Ok(RegisterLocation::Expression(location))
}
