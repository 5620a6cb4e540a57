// Copyright 2017 pdb Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The semantic PDB rewriter.
//!
//! A PDB carries its own crop of non-determinism: the GUID and timestamp in
//! the PDB info stream, struct padding serialised straight from memory,
//! stale allocator pointers, hash-order-dependent string tables, and
//! GUID-named temporary files. Each affected stream is copied into a
//! [`MemoryStream`], rewritten there, and swapped into the [`MsfFile`],
//! which then serialises everything to a temporary sibling file that
//! replaces the original on success. The source PDB is never written to.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use scroll::{Pwrite, LE};

use crate::common::{Error, ParseBuffer, Result};
use crate::msf::{MemoryStream, MsfFile, MsfStream};
use crate::pe::{CodeViewInfo, REPLACEMENT_PDB_AGE};

pub mod dbi;

/// The stream table stream; discarded and rebuilt on every rewrite.
pub const PDB_STREAM_TABLE: u32 = 0;
/// Version information and the link between this PDB and its image.
pub const PDB_HEADER_STREAM: u32 = 1;
/// Type information.
pub const PDB_TPI_STREAM: u32 = 2;
/// Debug information: section contributions and the module list.
pub const PDB_DBI_STREAM: u32 = 3;
/// ID information.
pub const PDB_IPI_STREAM: u32 = 4;

/// The first PDB implementation version with the 7.0 header layout. Older
/// versions, including the deprecated 19990604 vc70 build, are not
/// supported.
pub const PDB_IMPL_VC70: u32 = 20000404;

/// Size of the fixed `PdbStream70` prefix of the PDB header stream.
pub const PDB_STREAM_70_SIZE: usize = 28;

const PDB_TIMESTAMP_OFFSET: usize = 4;
const PDB_AGE_OFFSET: usize = 8;
const PDB_GUID_OFFSET: usize = 12;

/// The fixed prefix of the PDB header stream.
#[derive(Debug, Copy, Clone)]
pub struct PdbStream70 {
    /// Implementation version of the PDB writer.
    pub version: u32,
    /// Timestamp of when the PDB was created.
    pub timestamp: u32,
    /// Number of times this PDB instance has been updated.
    pub age: u32,
    /// The GUID matching the image's CodeView record.
    pub guid: uuid::Uuid,
}

pub fn parse_pdb_stream(buf: &mut ParseBuffer<'_>) -> Result<PdbStream70> {
    Ok(PdbStream70 {
        version: buf.parse_u32()?,
        timestamp: buf.parse_u32()?,
        age: buf.parse_u32()?,
        guid: buf.parse_guid()?,
    })
}

/// Signature at the start of the `/names` string table.
pub const STRING_TABLE_SIGNATURE: u32 = 0xeffe_effe;

/// Size of the fixed `LinkInfo` prefix of the `/LinkInfo` stream.
pub const LINK_INFO_SIZE: usize = 24;

/// The self-describing prefix of the `/LinkInfo` stream, which records the
/// command line used to link the binary.
#[derive(Debug, Copy, Clone)]
pub struct LinkInfo {
    /// Size of the struct plus its trailing strings; anything in the stream
    /// past this is garbage.
    pub size: u32,
    /// Either 1 or 2.
    pub version: u32,
    /// Offset from the base of the struct to the working directory string.
    pub cwd_offset: u32,
    /// Offset from the base of the struct to the command string.
    pub command_offset: u32,
    /// Offset into the command string of the output file.
    pub output_file_offset: u32,
    /// Offset from the base of the struct to the libraries string.
    pub libs_offset: u32,
}

pub fn parse_link_info(buf: &mut ParseBuffer<'_>) -> Result<LinkInfo> {
    Ok(LinkInfo {
        size: buf.parse_u32()?,
        version: buf.parse_u32()?,
        cwd_offset: buf.parse_u32()?,
        command_offset: buf.parse_u32()?,
        output_file_offset: buf.parse_u32()?,
        libs_offset: buf.parse_u32()?,
    })
}

/// The name map of the PDB header stream: stream names to stream indices.
pub type NameMap = BTreeMap<String, u32>;

/// Reads the name map table that follows the fixed header of the PDB header
/// stream.
///
/// The layout comes from Microsoft's `NMTNI::reload`: a string buffer, the
/// element count and capacity of the map, a bitset of present slots, a
/// bitset of deleted slots, and finally the `(string offset, stream index)`
/// pairs.
pub fn read_name_map(buf: &mut ParseBuffer<'_>) -> Result<NameMap> {
    if buf.len() < 4 {
        return Err(Error::InvalidPdb("missing PDB name table strings length"));
    }
    let strings_length = buf.parse_u32()? as usize;

    if buf.len() < strings_length {
        return Err(Error::InvalidPdb("missing PDB name table strings data"));
    }
    let strings = buf.take(strings_length)?;

    if buf.len() < 8 {
        return Err(Error::InvalidPdb("missing PDB stream name map sizes"));
    }
    let elem_count = buf.parse_u32()? as usize;
    let _elem_count_max = buf.parse_u32()?;

    if buf.len() < 4 {
        return Err(Error::InvalidPdb("missing PDB name table 'present' bitset size"));
    }
    let present_size = buf.parse_u32()? as usize;
    if buf.take(present_size * 4).is_err() {
        return Err(Error::InvalidPdb("missing PDB name table 'present' bitset data"));
    }

    if buf.len() < 4 {
        return Err(Error::InvalidPdb("missing PDB name table 'deleted' bitset size"));
    }
    let deleted_size = buf.parse_u32()? as usize;
    if buf.take(deleted_size * 4).is_err() {
        return Err(Error::InvalidPdb("missing PDB name table 'deleted' bitset data"));
    }

    if buf.len() < elem_count * 8 {
        return Err(Error::InvalidPdb("missing PDB name table pairs"));
    }

    let mut table = NameMap::new();
    for _ in 0..elem_count {
        let offset = buf.parse_u32()? as usize;
        let stream = buf.parse_u32()?;

        if offset >= strings_length {
            return Err(Error::InvalidPdb(
                "invalid PDB name table offset into strings buffer",
            ));
        }

        let name = match strings[offset..].iter().position(|&b| b == 0) {
            Some(end) => &strings[offset..offset + end],
            None => {
                return Err(Error::InvalidPdb(
                    "invalid PDB name table offset into strings buffer",
                ))
            }
        };

        table.insert(String::from_utf8_lossy(name).into_owned(), stream);
    }

    Ok(table)
}

/// Rewrites the PDB header stream in place: replaces the timestamp, age,
/// and GUID, after checking that the PDB actually belongs to the image.
///
/// Returns the name map so named streams can be rewritten as well.
fn patch_header_stream(
    stream: &mut MemoryStream,
    cv: Option<&CodeViewInfo>,
    timestamp: u32,
    signature: &[u8; 16],
) -> Result<NameMap> {
    if stream.len() < PDB_STREAM_70_SIZE {
        return Err(Error::InvalidPdb("missing PDB 7.0 header"));
    }

    let header = {
        let mut buf = ParseBuffer::from(stream.data());
        parse_pdb_stream(&mut buf)?
    };

    if header.version < PDB_IMPL_VC70 {
        return Err(Error::InvalidPdb("unsupported PDB implementation version"));
    }

    // Check that this PDB matches what the image expects. Patching an
    // unrelated PDB would break debugging for both files.
    let matches = match cv {
        Some(cv) => cv.age == header.age && cv.guid == header.guid,
        None => false,
    };

    if !matches {
        return Err(Error::InvalidPdb("PE and PDB signatures do not match"));
    }

    let name_map = {
        let mut buf = ParseBuffer::from(&stream.data()[PDB_STREAM_70_SIZE..]);
        read_name_map(&mut buf)?
    };

    let data = stream.data_mut();
    data.pwrite_with(timestamp, PDB_TIMESTAMP_OFFSET, LE)?;
    data.pwrite_with(REPLACEMENT_PDB_AGE, PDB_AGE_OFFSET, LE)?;
    data[PDB_GUID_OFFSET..PDB_GUID_OFFSET + 16].copy_from_slice(signature);

    Ok(name_map)
}

/// Truncates the `/LinkInfo` stream to its self-declared size. The linker
/// writes the stream with a stale tail beyond that size.
fn patch_link_info_stream(stream: &mut MemoryStream) -> Result<()> {
    if stream.is_empty() {
        return Ok(());
    }

    if stream.len() < LINK_INFO_SIZE {
        return Err(Error::InvalidPdb("got partial LinkInfo stream"));
    }

    let link_info = {
        let mut buf = ParseBuffer::from(stream.data());
        parse_link_info(&mut buf)?
    };

    if link_info.size as usize > stream.len() {
        return Err(Error::InvalidPdb("LinkInfo size too large for stream"));
    }

    stream.resize(link_info.size as usize);

    Ok(())
}

/// Rewrites the `/names` string table: sorts the offsets array, whose order
/// leaks the iteration order of a hash table, and canonicalises GUIDs in
/// the strings it points to.
fn patch_names_stream(stream: &mut MemoryStream) -> Result<()> {
    let data = stream.data_mut();

    let (signature, version, strings_size) = {
        if data.len() < 12 {
            return Err(Error::InvalidPdb("missing string table header"));
        }
        let mut buf = ParseBuffer::from(&data[..]);
        (buf.parse_u32()?, buf.parse_u32()?, buf.parse_u32()? as usize)
    };

    if signature != STRING_TABLE_SIGNATURE {
        return Err(Error::InvalidPdb("got invalid string table signature"));
    }

    if version != 1 && version != 2 {
        return Err(Error::InvalidPdb(
            "got invalid or unsupported string table version",
        ));
    }

    let strings_offset = 12;
    if data.len() < strings_offset + strings_size {
        return Err(Error::InvalidPdb("got partial string table data"));
    }

    let count_offset = strings_offset + strings_size;
    if data.len() < count_offset + 4 {
        return Err(Error::InvalidPdb("missing string table offset array length"));
    }

    let offsets_length = {
        let mut buf = ParseBuffer::from(&data[count_offset..]);
        buf.parse_u32()? as usize
    };

    let offsets_offset = count_offset + 4;
    if data.len() < offsets_offset + offsets_length * 4 {
        return Err(Error::InvalidPdb("got partial string table offsets array"));
    }

    let mut offsets = Vec::with_capacity(offsets_length);
    {
        let mut buf = ParseBuffer::from(&data[offsets_offset..]);
        for _ in 0..offsets_length {
            offsets.push(buf.parse_u32()?);
        }
    }

    // Some non-determinism creeps into the order of this array; sorting it
    // is stable across identical inputs and nothing consults the order.
    offsets.sort_unstable();

    for (i, &offset) in offsets.iter().enumerate() {
        data.pwrite_with(offset, offsets_offset + i * 4, LE)?;
    }

    for &offset in &offsets {
        if offset == 0 {
            continue;
        }

        let offset = offset as usize;
        if offset >= strings_size {
            return Err(Error::InvalidPdb("got invalid offset into string table"));
        }

        let start = strings_offset + offset;
        let end = strings_offset + strings_size;
        let length = match data[start..end].iter().position(|&b| b == 0) {
            Some(length) => length,
            None => return Err(Error::InvalidPdb("got invalid offset into string table")),
        };

        crate::guid::normalize_file_name_guid(&mut data[start..start + length]);
    }

    Ok(())
}

/// Rewrites every non-deterministic stream of an open PDB in memory.
pub fn patch_pdb(
    msf: &mut MsfFile,
    cv: Option<&CodeViewInfo>,
    timestamp: u32,
    signature: &[u8; 16],
) -> Result<()> {
    if msf.stream_count() == 0 {
        return Err(Error::InvalidPdb("missing PDB header stream"));
    }

    // The old stream table is dead weight; the writer builds a new one.
    msf.replace_stream(PDB_STREAM_TABLE, None);

    let mut header_stream = match msf.get_stream(PDB_HEADER_STREAM) {
        Some(stream) => MemoryStream::from_stream(stream)?,
        None => return Err(Error::InvalidPdb("missing PDB header stream")),
    };

    let name_map = patch_header_stream(&mut header_stream, cv, timestamp, signature)?;
    msf.replace_stream(PDB_HEADER_STREAM, Some(Box::new(header_stream)));

    let dbi_stream = match msf.get_stream(PDB_DBI_STREAM) {
        Some(stream) => Some(MemoryStream::from_stream(stream)?),
        None => None,
    };

    if let Some(mut dbi_stream) = dbi_stream {
        let dbi_header = dbi::patch_dbi_stream(msf, &mut dbi_stream)?;
        msf.replace_stream(PDB_DBI_STREAM, Some(Box::new(dbi_stream)));

        // The DBI header names the two symbol streams.
        let records_index = u32::from(dbi_header.symbol_records_stream);
        if let Some(stream) = msf.get_stream(records_index) {
            let mut records = MemoryStream::from_stream(stream)?;
            dbi::patch_symbol_records_stream(&mut records)?;
            msf.replace_stream(records_index, Some(Box::new(records)));
        }

        let publics_index = u32::from(dbi_header.public_symbol_stream);
        if let Some(stream) = msf.get_stream(publics_index) {
            let mut publics = MemoryStream::from_stream(stream)?;
            dbi::patch_public_symbols_stream(&mut publics)?;
            msf.replace_stream(publics_index, Some(Box::new(publics)));
        }
    }

    if let Some(&index) = name_map.get("/LinkInfo") {
        let mut link_info = match msf.get_stream(index) {
            Some(stream) => MemoryStream::from_stream(stream)?,
            None => return Err(Error::InvalidPdb("missing '/LinkInfo' stream")),
        };

        patch_link_info_stream(&mut link_info)?;
        msf.replace_stream(index, Some(Box::new(link_info)));
    }

    if let Some(&index) = name_map.get("/names") {
        let mut names = match msf.get_stream(index) {
            Some(stream) => MemoryStream::from_stream(stream)?,
            None => return Err(Error::InvalidPdb("missing '/names' stream")),
        };

        patch_names_stream(&mut names)?;
        msf.replace_stream(index, Some(Box::new(names)));
    }

    Ok(())
}

/// The temporary sibling the rewritten PDB is serialised to before it
/// replaces the original.
fn temp_pdb_path(path: &Path) -> PathBuf {
    let mut buf = OsString::from(path.as_os_str());
    buf.push(".tmp");
    PathBuf::from(buf)
}

fn rewrite_pdb(
    pdb_path: &Path,
    tmp_path: &Path,
    cv: Option<&CodeViewInfo>,
    timestamp: u32,
    signature: &[u8; 16],
) -> Result<()> {
    let source = File::open(pdb_path)?;
    let mut msf = MsfFile::open(source)?;

    // All rewriting happens in memory; nothing is written until the whole
    // PDB has parsed.
    patch_pdb(&mut msf, cv, timestamp, signature)?;

    let mut out = BufWriter::new(File::create(tmp_path)?);
    msf.write(&mut out)?;
    out.flush()?;

    Ok(())
}

/// Rewrites the PDB at `pdb_path`, committing by renaming a temporary
/// sibling over the original. On a dry run the temporary file is written
/// and then deleted.
pub fn patch_pdb_file(
    pdb_path: &Path,
    cv: Option<&CodeViewInfo>,
    timestamp: u32,
    signature: &[u8; 16],
    dry_run: bool,
) -> Result<()> {
    let tmp_path = temp_pdb_path(pdb_path);

    if let Err(e) = rewrite_pdb(pdb_path, &tmp_path, cv, timestamp, signature) {
        // Best effort; the temp file may not exist yet.
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    if dry_run {
        fs::remove_file(&tmp_path)?;
    } else {
        fs::rename(&tmp_path, pdb_path)?;
    }

    Ok(())
}
