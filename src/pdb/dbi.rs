// Copyright 2017 pdb Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

// DBI = "Debug Information"

//! Rewriting of the DBI stream, its substreams, and the streams it points
//! to: the per-module debug streams, the symbol records stream, and the
//! public symbols stream.

use fallible_iterator::FallibleIterator;
use scroll::{Pread, Pwrite, LE};

use crate::common::{Error, ParseBuffer, RawString, Result};
use crate::guid::normalize_file_name_guid;
use crate::msf::{MemoryStream, MsfFile, MsfStream};
use crate::pe::REPLACEMENT_PDB_AGE;

/// The DBI header signature.
pub const DBI_SIGNATURE: u32 = 0xffff_ffff;

/// The only supported DBI implementation version.
pub const DBI_VERSION_V70: u32 = 19_990_903;

/// Size of the DBI stream header.
pub const DBI_HEADER_SIZE: usize = 64;

const DBI_AGE_OFFSET: usize = 8;

/// True if the image was linked incrementally.
const DBI_FLAG_INCREMENTAL_LINK: u16 = 0x1;

/// Version signatures of the section contribution substream.
pub const SECTION_CONTRIB_V1: u32 = 0xeffe_0000 + 19_970_605;
pub const SECTION_CONTRIB_V2: u32 = 0xeffe_0000 + 20_140_516;

/// Size of one section contribution record.
pub const SECTION_CONTRIBUTION_SIZE: usize = 28;

// The two alignment holes inside a section contribution. Microsoft's
// writer serialises the in-memory struct without zeroing them.
const SC_PADDING1_OFFSET: usize = 2;
const SC_PADDING2_OFFSET: usize = 18;

/// Size of the fixed prefix of a module info entry. The two NUL-terminated
/// names and alignment padding follow.
pub const MODULE_INFO_SIZE: usize = 64;

const MODULE_SC_PADDING1_OFFSET: usize = 4 + SC_PADDING1_OFFSET;
const MODULE_SC_PADDING2_OFFSET: usize = 4 + SC_PADDING2_OFFSET;
const MODULE_OFFSETS_OFFSET: usize = 52;

/// Size of the header of the file info substream.
const FILE_INFO_HEADER_SIZE: usize = 4;

/// The module the linker synthesises for the manifest resource. Its debug
/// stream records the GUID-named temporary file the resource was compiled
/// from.
const LINKER_MANIFEST_MODULE: &[u8] = b"* Linker Generated Manifest RES *";

/// Module debug streams with this leading signature carry C13 line info.
const CV_SIGNATURE_C13: u32 = 4;

/// The CodeView symbol record holding a module's object path.
pub const S_OBJNAME: u16 = 0x1101;

/// Size of the public symbols stream header.
pub const PUBLIC_SYMBOL_HEADER_SIZE: usize = 28;

const PS_PADDING1_OFFSET: usize = 18;
const PS_SECTION_COUNT_OFFSET: usize = 24;

const INCREMENTAL_LINK_WARNING: &str = "Warning: /INCREMENTAL was specified in the linker \
options. Incremental linking is known to not produce reproducible outputs.";

/// The DBI stream header.
///
/// `NewDBIHdr` in Microsoft's code:
/// https://github.com/Microsoft/microsoft-pdb/blob/082c5290e5aff028ae84e43affa8be717aa7af73/PDB/dbi/dbi.h#L124
#[derive(Debug, Copy, Clone)]
pub struct DbiHeader {
    pub signature: u32,
    pub version: u32,
    /// Must match the age in the PDB header stream.
    pub age: u32,
    pub global_symbol_stream: u16,
    pub pdb_dll_version: u16,
    /// The public symbols info stream.
    pub public_symbol_stream: u16,
    pub pdb_dll_build_major: u16,
    /// The stream holding the symbol records.
    pub symbol_records_stream: u16,
    pub pdb_dll_build_minor: u16,
    pub module_info_size: u32,
    pub section_contribution_size: u32,
    pub section_map_size: u32,
    pub file_info_size: u32,
    pub type_server_map_size: u32,
    pub mfc_type_server_index: u32,
    pub debug_header_size: u32,
    pub ec_info_size: u32,
    pub flags: u16,
    pub machine: u16,
    pub reserved: u32,
}

pub fn parse_dbi_header(buf: &mut ParseBuffer<'_>) -> Result<DbiHeader> {
    let header = DbiHeader {
        signature: buf.parse_u32()?,
        version: buf.parse_u32()?,
        age: buf.parse_u32()?,
        global_symbol_stream: buf.parse_u16()?,
        pdb_dll_version: buf.parse_u16()?,
        public_symbol_stream: buf.parse_u16()?,
        pdb_dll_build_major: buf.parse_u16()?,
        symbol_records_stream: buf.parse_u16()?,
        pdb_dll_build_minor: buf.parse_u16()?,
        module_info_size: buf.parse_u32()?,
        section_contribution_size: buf.parse_u32()?,
        section_map_size: buf.parse_u32()?,
        file_info_size: buf.parse_u32()?,
        type_server_map_size: buf.parse_u32()?,
        mfc_type_server_index: buf.parse_u32()?,
        debug_header_size: buf.parse_u32()?,
        ec_info_size: buf.parse_u32()?,
        flags: buf.parse_u16()?,
        machine: buf.parse_u16()?,
        reserved: buf.parse_u32()?,
    };

    if header.signature != DBI_SIGNATURE {
        return Err(Error::InvalidPdb("invalid DBI header signature"));
    }

    if header.version != DBI_VERSION_V70 {
        return Err(Error::InvalidPdb("unsupported DBI stream version"));
    }

    Ok(header)
}

/// A module's first section contribution, embedded in its module info
/// entry. `struct SC` in Microsoft's code.
#[derive(Debug, Copy, Clone)]
pub struct SectionContribution {
    pub section: u16,
    pub padding1: u16,
    pub offset: i32,
    pub size: u32,
    pub characteristics: u32,
    pub module: u16,
    pub padding2: u16,
    pub data_crc: u32,
    pub reloc_crc: u32,
}

fn parse_section_contribution(buf: &mut ParseBuffer<'_>) -> Result<SectionContribution> {
    Ok(SectionContribution {
        section: buf.parse_u16()?,
        padding1: buf.parse_u16()?,
        offset: buf.parse_i32()?,
        size: buf.parse_u32()?,
        characteristics: buf.parse_u32()?,
        module: buf.parse_u16()?,
        padding2: buf.parse_u16()?,
        data_crc: buf.parse_u32()?,
        reloc_crc: buf.parse_u32()?,
    })
}

/// The fixed prefix of a module info entry. `MODI` in Microsoft's code.
#[derive(Debug, Copy, Clone)]
pub struct ModuleInfo {
    pub opened: u32,
    pub section: SectionContribution,
    pub flags: u16,
    /// Stream number of the module's debug info.
    pub stream: u16,
    pub symbols_size: u32,
    pub lines_size: u32,
    pub c13_lines_size: u32,
    pub file_count: u16,
    /// A stale pointer into an array owned by the writer process. It must
    /// be zeroed; the heap address that leaks into it differs from run to
    /// run.
    pub offsets: u32,
    pub source_file_index: u32,
    pub pdb_file_index: u32,
}

fn parse_module_info(buf: &mut ParseBuffer<'_>) -> Result<ModuleInfo> {
    let info = ModuleInfo {
        opened: buf.parse_u32()?,
        section: parse_section_contribution(buf)?,
        flags: buf.parse_u16()?,
        stream: buf.parse_u16()?,
        symbols_size: buf.parse_u32()?,
        lines_size: buf.parse_u32()?,
        c13_lines_size: buf.parse_u32()?,
        file_count: {
            let count = buf.parse_u16()?;
            let _alignment = buf.parse_u16()?;
            count
        },
        offsets: buf.parse_u32()?,
        source_file_index: buf.parse_u32()?,
        pdb_file_index: buf.parse_u32()?,
    };

    Ok(info)
}

/// A module info entry: the fixed struct plus the module and object file
/// names, padded to 4 bytes.
#[derive(Debug)]
pub struct Module<'b> {
    /// Byte offset of this entry within the module info substream.
    pub offset: usize,
    pub info: ModuleInfo,
    pub module_name: RawString<'b>,
    pub object_file_name: RawString<'b>,
}

impl<'b> Module<'b> {
    /// Whether this is the module the linker generates for the manifest
    /// resource.
    fn is_linker_manifest(&self) -> bool {
        self.module_name.as_bytes() == LINKER_MANIFEST_MODULE && self.object_file_name.is_empty()
    }
}

/// Iterates the variable-length entries of the module info substream.
#[derive(Debug)]
pub struct ModuleIter<'b> {
    buf: ParseBuffer<'b>,
}

impl<'b> ModuleIter<'b> {
    pub fn new(substream: &'b [u8]) -> Self {
        ModuleIter {
            buf: ParseBuffer::from(substream),
        }
    }
}

impl<'b> FallibleIterator for ModuleIter<'b> {
    type Item = Module<'b>;
    type Error = Error;

    fn next(&mut self) -> Result<Option<Self::Item>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        if self.buf.len() < MODULE_INFO_SIZE {
            return Err(Error::InvalidPdb("got partial DBI module info"));
        }

        let offset = self.buf.pos();
        let info = parse_module_info(&mut self.buf)?;
        let module_name = self.buf.parse_cstring()?;
        let object_file_name = self.buf.parse_cstring()?;
        self.buf.align(4)?;

        Ok(Some(Module {
            offset,
            info,
            module_name,
            object_file_name,
        }))
    }
}

/// Rewrites the DBI stream: zeroes the struct padding and stale pointers in
/// the module info and section contribution substreams, canonicalises
/// GUID-named files in the file info substream, resets the age, and patches
/// the linker-generated manifest module's debug stream.
///
/// Returns the parsed header; the caller uses its stream numbers to rewrite
/// the symbol streams.
pub fn patch_dbi_stream(msf: &mut MsfFile, stream: &mut MemoryStream) -> Result<DbiHeader> {
    if stream.len() < DBI_HEADER_SIZE {
        return Err(Error::InvalidPdb("DBI stream too short"));
    }

    let header = {
        let mut buf = ParseBuffer::from(stream.data());
        parse_dbi_header(&mut buf)?
    };

    if header.flags & DBI_FLAG_INCREMENTAL_LINK != 0 {
        println!("{}", INCREMENTAL_LINK_WARNING);
    }

    let data = stream.data_mut();

    // This age must match the one in the PDB header stream.
    data.pwrite_with(REPLACEMENT_PDB_AGE, DBI_AGE_OFFSET, LE)?;

    let mut offset = DBI_HEADER_SIZE;

    // The module info substream immediately follows the header.
    let module_info_size = header.module_info_size as usize;
    if offset + module_info_size > data.len() {
        return Err(Error::InvalidPdb("DBI module info size exceeds stream length"));
    }

    let modules = {
        let mut entries = Vec::new();
        let mut iter = ModuleIter::new(&data[offset..offset + module_info_size]);
        while let Some(module) = iter.next()? {
            entries.push((
                offset + module.offset,
                module.info.stream,
                module.is_linker_manifest(),
            ));
        }
        entries
    };

    for &(module_offset, _, _) in &modules {
        data.pwrite_with(0u16, module_offset + MODULE_SC_PADDING1_OFFSET, LE)?;
        data.pwrite_with(0u16, module_offset + MODULE_SC_PADDING2_OFFSET, LE)?;
        data.pwrite_with(0u32, module_offset + MODULE_OFFSETS_OFFSET, LE)?;
    }

    offset += module_info_size;

    // The section contributions follow the module info entries.
    let section_contribution_size = header.section_contribution_size as usize;
    if section_contribution_size > 0 {
        if offset + section_contribution_size > data.len() {
            return Err(Error::InvalidPdb(
                "DBI section contributions size exceeds stream length",
            ));
        }

        if section_contribution_size < 4 {
            return Err(Error::InvalidPdb(
                "got partial section contribution substream",
            ));
        }

        let version: u32 = data.pread_with(offset, LE)?;
        if version != SECTION_CONTRIB_V1 && version != SECTION_CONTRIB_V2 {
            return Err(Error::InvalidPdb(
                "got invalid section contribution substream version",
            ));
        }

        let count = (section_contribution_size - 4) / SECTION_CONTRIBUTION_SIZE;
        let base = offset + 4;

        for i in 0..count {
            let record = base + i * SECTION_CONTRIBUTION_SIZE;
            data.pwrite_with(0u16, record + SC_PADDING1_OFFSET, LE)?;
            data.pwrite_with(0u16, record + SC_PADDING2_OFFSET, LE)?;
        }
    }

    offset += section_contribution_size;

    // The section map carries nothing non-deterministic.
    offset += header.section_map_size as usize;

    // The file info substream lists the source files of every module; the
    // linker's GUID-named temporary files show up in here.
    let file_info_size = header.file_info_size as usize;
    if file_info_size > 0 {
        if offset + file_info_size > data.len() {
            return Err(Error::InvalidPdb("missing file info in DBI stream"));
        }

        patch_file_info(data, offset, file_info_size, modules.len())?;
    }

    // The type server map, EC info, and optional debug header are preserved
    // byte for byte.

    // Patch the GUID in the manifest module's debug stream. It is often the
    // first module, but finding it by name is safer.
    for &(_, module_stream, is_manifest) in &modules {
        if !is_manifest {
            continue;
        }

        if let Some(source) = msf.get_stream(u32::from(module_stream)) {
            let mut module_stream_copy = MemoryStream::from_stream(source)?;
            patch_module_stream(&mut module_stream_copy)?;
            msf.replace_stream(u32::from(module_stream), Some(Box::new(module_stream_copy)));
        }
    }

    Ok(header)
}

/// Canonicalises GUIDs in the file names of the file info substream.
///
/// The substream's own header is skipped; it does not always carry correct
/// counts. The per-module file counts are what determine the number of
/// name offsets.
fn patch_file_info(
    data: &mut [u8],
    offset: usize,
    size: usize,
    module_count: usize,
) -> Result<()> {
    let end = offset + size;
    let mut pos = offset + FILE_INFO_HEADER_SIZE;

    // Skip the file index array; it is not needed here.
    pos += module_count * 2;

    let counts_offset = pos;
    pos += module_count * 2;

    if pos >= end {
        return Err(Error::InvalidPdb("got partial file info in DBI stream"));
    }

    let mut offset_count: usize = 0;
    for i in 0..module_count {
        let count: u16 = data.pread_with(counts_offset + i * 2, LE)?;
        offset_count += count as usize;
    }

    let offsets_offset = pos;
    pos += offset_count * 4;

    if pos >= end {
        return Err(Error::InvalidPdb("got partial file info in DBI stream"));
    }

    let names_offset = pos;

    for i in 0..offset_count {
        let name_offset: u32 = data.pread_with(offsets_offset + i * 4, LE)?;
        let start = names_offset + name_offset as usize;

        if start + 1 > end {
            return Err(Error::InvalidPdb("invalid offset for file info name"));
        }

        let length = match data[start..end].iter().position(|&b| b == 0) {
            Some(length) => length,
            None => {
                return Err(Error::InvalidPdb(
                    "file name exceeds file info section size",
                ))
            }
        };

        normalize_file_name_guid(&mut data[start..start + length]);
    }

    Ok(())
}

/// Canonicalises the GUID in the path of a module debug stream's
/// `S_OBJNAME` record. Streams without C13 debug info or without a leading
/// `S_OBJNAME` are left alone.
pub fn patch_module_stream(stream: &mut MemoryStream) -> Result<()> {
    let data = stream.data_mut();

    if data.len() < 4 {
        return Err(Error::InvalidPdb("got partial module info stream"));
    }

    let module_signature: u32 = data.pread_with(0, LE)?;
    if module_signature != CV_SIGNATURE_C13 {
        return Ok(());
    }

    if data.len() < 8 {
        return Err(Error::InvalidPdb("missing symbol record in module info stream"));
    }

    let record_length: u16 = data.pread_with(4, LE)?;
    let record_kind: u16 = data.pread_with(6, LE)?;

    // Only object name records matter here.
    if record_kind != S_OBJNAME {
        return Ok(());
    }

    if data.len() < 12 || 4 + 2 + record_length as usize > data.len() {
        return Err(Error::InvalidPdb("got partial OBJNAMESYM symbol record"));
    }

    // The signature always seems to be 0.
    let object_signature: u32 = data.pread_with(8, LE)?;
    if object_signature != 0 {
        return Err(Error::InvalidPdb(
            "got invalid OBJNAMESYM symbol record signature",
        ));
    }

    let name_offset = 12;
    let length = match data[name_offset..].iter().position(|&b| b == 0) {
        Some(length) => length,
        None => {
            return Err(Error::InvalidPdb(
                "object path in symbol record is not null-terminated",
            ))
        }
    };

    normalize_file_name_guid(&mut data[name_offset..name_offset + length]);

    Ok(())
}

/// One record of the symbol records stream.
#[derive(Debug, Copy, Clone)]
pub struct SymbolRecord {
    /// Byte offset of the record within the stream.
    pub offset: usize,
    pub kind: u16,
    /// Byte offset of the record's payload.
    pub data_offset: usize,
    pub data_len: usize,
}

/// Iterates the TLV records of the symbol records stream, validating the
/// length and alignment of every record.
#[derive(Debug)]
pub struct SymbolRecordIter<'b> {
    buf: ParseBuffer<'b>,
}

impl<'b> SymbolRecordIter<'b> {
    pub fn new(stream: &'b [u8]) -> Self {
        SymbolRecordIter {
            buf: ParseBuffer::from(stream),
        }
    }
}

impl<'b> FallibleIterator for SymbolRecordIter<'b> {
    type Item = SymbolRecord;
    type Error = Error;

    fn next(&mut self) -> Result<Option<Self::Item>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        if self.buf.len() < 4 {
            return Err(Error::InvalidPdb("got partial symbol record"));
        }

        let offset = self.buf.pos();
        let length = self.buf.parse_u16()?;
        let kind = self.buf.parse_u16()?;

        // The length must cover at least the kind field, and the whole
        // record must be a multiple of 4 bytes.
        if length < 2 || (length as usize + 2) % 4 != 0 {
            return Err(Error::InvalidPdb("invalid symbol record size"));
        }

        let data_len = length as usize - 2;
        if self.buf.len() < data_len {
            return Err(Error::InvalidPdb("symbol record size too large"));
        }
        self.buf.take(data_len)?;

        Ok(Some(SymbolRecord {
            offset,
            kind,
            data_offset: offset + 4,
            data_len,
        }))
    }
}

/// Zeroes the alignment padding at the tail of every symbol record.
///
/// Up to 3 bytes of garbage live between a record's trailing NUL and the
/// next 4-byte boundary.
pub fn patch_symbol_records_stream(stream: &mut MemoryStream) -> Result<()> {
    let records = {
        let mut iter = SymbolRecordIter::new(stream.data());
        let mut records = Vec::new();
        while let Some(record) = iter.next()? {
            records.push(record);
        }
        records
    };

    let data = stream.data_mut();

    for record in records {
        let payload = &mut data[record.data_offset..record.data_offset + record.data_len];

        // Find the trailing NUL within the last padding window; everything
        // after it is padding.
        let mut tail = record.data_len.saturating_sub(3);
        while tail + 1 < record.data_len && payload[tail] != 0 {
            tail += 1;
        }
        while tail < record.data_len {
            payload[tail] = 0;
            tail += 1;
        }
    }

    Ok(())
}

/// Zeroes the two uninitialised fields of the public symbols stream header.
///
/// `padding1` is a struct alignment hole. `section_count` is a field
/// Microsoft's writer forgets to initialise in one of its constructors, so
/// existing tools already cope with it being garbage.
pub fn patch_public_symbols_stream(stream: &mut MemoryStream) -> Result<()> {
    if stream.len() < PUBLIC_SYMBOL_HEADER_SIZE {
        return Err(Error::InvalidPdb("public symbol stream too short"));
    }

    let data = stream.data_mut();
    data.pwrite_with(0u16, PS_PADDING1_OFFSET, LE)?;
    data.pwrite_with(0u32, PS_SECTION_COUNT_OFFSET, LE)?;

    Ok(())
}
