// Copyright 2017 pdb Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Parsing of PE/PE+ images and discovery of every non-deterministic byte.
//!
//! The headers are identical for 32- and 64-bit images up to the optional
//! header, whose leading magic decides how the rest is laid out. Parsing
//! never writes; it queues patches into a [`PatchSet`] which the driver
//! applies once everything has validated.

use uuid::Uuid;

use crate::common::{Error, ParseBuffer, Result};
use crate::patch::PatchSet;

/// Replacement for timestamps.
///
/// The timestamp can't just be set to zero as that has a special meaning in
/// the PE file. This is Jan 1, 2010, 0:00:00 GMT; a date too far in the past
/// makes Windows warn about known-incompatible executables.
pub const REPLACEMENT_TIMESTAMP: u32 = 1_262_304_000;

/// Replacement for the PDB age. The linker increments it on every
/// incremental update of the PDB; a full rewrite starts over at 1.
pub const REPLACEMENT_PDB_AGE: u32 = 1;

const IMAGE_DOS_SIGNATURE: u16 = 0x5a4d; // MZ
const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550; // PE\0\0

const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10b;
const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20b;

const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
const IMAGE_DIRECTORY_ENTRY_RESOURCE: usize = 2;
const IMAGE_DIRECTORY_ENTRY_DEBUG: usize = 6;

const IMAGE_DEBUG_TYPE_CODEVIEW: u32 = 2;

/// "RSDS", the CodeView PDB 7.0 record signature.
const CV_INFO_SIGNATURE_PDB70: u32 = 0x5344_5352;

const IMAGE_DOS_HEADER_SIZE: usize = 64;
const IMAGE_FILE_HEADER_SIZE: usize = 20;
const IMAGE_SECTION_HEADER_SIZE: usize = 40;
const IMAGE_DATA_DIRECTORY_SIZE: usize = 8;
const IMAGE_DEBUG_DIRECTORY_SIZE: usize = 28;
const IMAGE_EXPORT_DIRECTORY_SIZE: usize = 40;
const IMAGE_RESOURCE_DIRECTORY_SIZE: usize = 16;
const IMAGE_NUMBEROF_DIRECTORY_ENTRIES: u32 = 16;

/// The fixed-size prefix of `CV_INFO_PDB70`: signature, GUID, and age. The
/// PDB file name follows.
const CV_INFO_PDB70_SIZE: usize = 24;

/// The CodeView record tying the image to its PDB.
///
/// The GUID and age are what the debugger matches against the PDB; the
/// recorded offsets are where the replacement signature and age get written.
#[derive(Debug, Clone)]
pub struct CodeViewInfo {
    /// File offset of the 16-byte signature field.
    pub signature_offset: usize,
    /// The GUID currently embedded in the image.
    pub guid: Uuid,
    /// The age currently embedded in the image.
    pub age: u32,
}

/// One parsed section header; only the fields needed for RVA translation
/// are kept around.
#[derive(Debug, Clone)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
}

fn parse_section_header(buf: &mut ParseBuffer<'_>) -> Result<SectionHeader> {
    let mut name = [0u8; 8];
    name.copy_from_slice(buf.take(8)?);

    let header = SectionHeader {
        name,
        virtual_size: buf.parse_u32()?,
        virtual_address: buf.parse_u32()?,
        size_of_raw_data: buf.parse_u32()?,
        pointer_to_raw_data: buf.parse_u32()?,
    };

    // relocation/line number fields and characteristics
    buf.take(16)?;

    Ok(header)
}

#[derive(Debug, Clone, Copy)]
struct DataDirectory {
    virtual_address: u32,
    size: u32,
}

/// A validated view of a PE/PE+ image.
#[derive(Debug)]
pub struct PeFile {
    file_header_offset: usize,
    magic: u16,
    checksum_offset: usize,
    number_of_rva_and_sizes: u32,
    data_directory_offset: usize,
    sections: Vec<SectionHeader>,
}

impl PeFile {
    /// Parses and validates the image headers.
    pub fn parse(data: &[u8]) -> Result<PeFile> {
        if data.len() < IMAGE_DOS_HEADER_SIZE {
            return Err(Error::InvalidImage("missing DOS header"));
        }

        let mut buf = ParseBuffer::from(data);
        if buf.parse_u16()? != IMAGE_DOS_SIGNATURE {
            return Err(Error::InvalidImage("invalid DOS signature"));
        }

        let e_lfanew = {
            let mut buf = ParseBuffer::from(&data[60..]);
            buf.parse_u32()? as usize
        };

        if e_lfanew + 4 > data.len() {
            return Err(Error::InvalidImage("missing PE signature"));
        }

        let mut buf = ParseBuffer::from(&data[e_lfanew..]);
        if buf.parse_u32()? != IMAGE_NT_SIGNATURE {
            return Err(Error::InvalidImage("invalid PE signature"));
        }

        // IMAGE_FILE_HEADER
        let file_header_offset = e_lfanew + 4;
        if file_header_offset + IMAGE_FILE_HEADER_SIZE > data.len() {
            return Err(Error::InvalidImage("missing IMAGE_FILE_HEADER"));
        }

        let _machine = buf.parse_u16()?;
        let number_of_sections = buf.parse_u16()?;
        let _timestamp = buf.parse_u32()?;
        let _symbol_table = buf.parse_u32()?;
        let _symbol_count = buf.parse_u32()?;
        let size_of_optional_header = buf.parse_u16()? as usize;
        let _characteristics = buf.parse_u16()?;

        // The optional header is either IMAGE_OPTIONAL_HEADER32 or
        // IMAGE_OPTIONAL_HEADER64; the leading magic tells which.
        let optional_header_offset = file_header_offset + IMAGE_FILE_HEADER_SIZE;
        if optional_header_offset + 2 > data.len() {
            return Err(Error::InvalidImage("missing IMAGE_OPTIONAL_HEADER"));
        }

        let magic = {
            let mut buf = ParseBuffer::from(&data[optional_header_offset..]);
            buf.parse_u16()?
        };

        let (rva_count_offset, data_directory_offset) = match magic {
            IMAGE_NT_OPTIONAL_HDR32_MAGIC => (92, 96),
            IMAGE_NT_OPTIONAL_HDR64_MAGIC => (108, 112),
            _ => {
                return Err(Error::InvalidImage(
                    "unsupported IMAGE_NT_HEADERS.OptionalHeader",
                ))
            }
        };

        if optional_header_offset + data_directory_offset > data.len() {
            return Err(Error::InvalidImage("missing IMAGE_OPTIONAL_HEADER"));
        }

        let number_of_rva_and_sizes = {
            let mut buf = ParseBuffer::from(&data[optional_header_offset + rva_count_offset..]);
            buf.parse_u32()?
        };

        let directory_count =
            number_of_rva_and_sizes.min(IMAGE_NUMBEROF_DIRECTORY_ENTRIES) as usize;

        let directories_end = optional_header_offset
            + data_directory_offset
            + directory_count * IMAGE_DATA_DIRECTORY_SIZE;

        if directories_end > data.len() {
            return Err(Error::InvalidImage("missing data directories"));
        }

        if size_of_optional_header
            < data_directory_offset + directory_count * IMAGE_DATA_DIRECTORY_SIZE
        {
            return Err(Error::InvalidImage(
                "IMAGE_FILE_HEADER.SizeOfOptionalHeader is too small",
            ));
        }

        // Section headers follow the optional header. Validate the count
        // against the image size before touching them.
        let sections_offset = optional_header_offset + size_of_optional_header;
        let sections_size = number_of_sections as usize * IMAGE_SECTION_HEADER_SIZE;
        if sections_offset + sections_size > data.len() {
            return Err(Error::InvalidImage("section headers exceed image size"));
        }

        let mut sections = Vec::with_capacity(number_of_sections as usize);
        let mut buf = ParseBuffer::from(&data[sections_offset..sections_offset + sections_size]);
        for _ in 0..number_of_sections {
            sections.push(parse_section_header(&mut buf)?);
        }

        Ok(PeFile {
            file_header_offset,
            magic,
            checksum_offset: optional_header_offset + 64,
            number_of_rva_and_sizes,
            data_directory_offset: optional_header_offset + data_directory_offset,
            sections,
        })
    }

    /// The optional header magic: 0x10b for PE32, 0x20b for PE32+.
    pub fn magic(&self) -> u16 {
        self.magic
    }

    pub fn sections(&self) -> &[SectionHeader] {
        &self.sections
    }

    /// Translates a relative virtual address to a file offset using the
    /// first section whose virtual range contains it.
    pub fn translate(&self, rva: u32) -> Result<usize> {
        for section in &self.sections {
            if rva >= section.virtual_address
                && rva - section.virtual_address < section.virtual_size
            {
                return Ok((rva - section.virtual_address + section.pointer_to_raw_data) as usize);
            }
        }

        Err(Error::InvalidImage("RVA is not contained in any section"))
    }

    fn data_directory(&self, data: &[u8], entry: usize) -> Result<Option<DataDirectory>> {
        if entry as u32 >= self.number_of_rva_and_sizes
            || entry as u32 >= IMAGE_NUMBEROF_DIRECTORY_ENTRIES
        {
            return Ok(None);
        }

        let offset = self.data_directory_offset + entry * IMAGE_DATA_DIRECTORY_SIZE;
        let mut buf = ParseBuffer::from(&data[offset..]);

        Ok(Some(DataDirectory {
            virtual_address: buf.parse_u32()?,
            size: buf.parse_u32()?,
        }))
    }

    /// Locates a data directory's payload in the file, checking that the
    /// declared size covers at least `min_size` bytes. Microsoft may append
    /// fields to these structs, so a larger size is fine.
    fn directory_payload(
        &self,
        data: &[u8],
        entry: usize,
        min_size: usize,
    ) -> Result<Option<usize>> {
        let dir = match self.data_directory(data, entry)? {
            Some(dir) if dir.virtual_address != 0 => dir,
            _ => return Ok(None),
        };

        if (dir.size as usize) < min_size {
            return Err(Error::InvalidImage("IMAGE_DATA_DIRECTORY.Size is invalid"));
        }

        let offset = self.translate(dir.virtual_address)?;
        if offset + dir.size as usize > data.len() {
            return Err(Error::InvalidImage(
                "IMAGE_DATA_DIRECTORY.VirtualAddress is invalid",
            ));
        }

        Ok(Some(offset))
    }

    /// Queues a patch for every non-deterministic field of the image.
    ///
    /// Returns the CodeView record, if the image has one. Its signature
    /// patch is queued with placeholder bytes; the driver fills in the real
    /// signature once it has been computed from the gaps between patches.
    pub fn collect_patches(
        &self,
        data: &[u8],
        patches: &mut PatchSet,
    ) -> Result<Option<CodeViewInfo>> {
        patches.add_u32(
            self.file_header_offset + 4,
            REPLACEMENT_TIMESTAMP,
            "IMAGE_FILE_HEADER.TimeDateStamp",
        );

        // The checksum would be invalidated by the patches anyway. Nothing
        // verifies it for ordinary executables, so it gets the same fixed
        // value as the timestamps.
        patches.add_u32(
            self.checksum_offset,
            REPLACEMENT_TIMESTAMP,
            "OptionalHeader.CheckSum",
        );

        if let Some(offset) = self.directory_payload(
            data,
            IMAGE_DIRECTORY_ENTRY_EXPORT,
            IMAGE_EXPORT_DIRECTORY_SIZE,
        )? {
            patches.add_u32(
                offset + 4,
                REPLACEMENT_TIMESTAMP,
                "IMAGE_EXPORT_DIRECTORY.TimeDateStamp",
            );
        }

        if let Some(offset) = self.directory_payload(
            data,
            IMAGE_DIRECTORY_ENTRY_RESOURCE,
            IMAGE_RESOURCE_DIRECTORY_SIZE,
        )? {
            patches.add_u32(
                offset + 4,
                REPLACEMENT_TIMESTAMP,
                "IMAGE_RESOURCE_DIRECTORY.TimeDateStamp",
            );
        }

        self.collect_debug_directory_patches(data, patches)
    }

    /// There are 0 or more debug directory entries. Every entry's timestamp
    /// needs patching; at most one entry may be a CodeView entry linking the
    /// image to its PDB.
    fn collect_debug_directory_patches(
        &self,
        data: &[u8],
        patches: &mut PatchSet,
    ) -> Result<Option<CodeViewInfo>> {
        let dir = match self.data_directory(data, IMAGE_DIRECTORY_ENTRY_DEBUG)? {
            Some(dir) if dir.virtual_address != 0 => dir,
            _ => return Ok(None),
        };

        let offset = self.translate(dir.virtual_address)?;
        if offset + dir.size as usize > data.len() {
            return Err(Error::InvalidImage(
                "IMAGE_DATA_DIRECTORY.VirtualAddress is invalid",
            ));
        }

        let count = dir.size as usize / IMAGE_DEBUG_DIRECTORY_SIZE;
        let mut cv_info = None;

        for i in 0..count {
            let entry = offset + i * IMAGE_DEBUG_DIRECTORY_SIZE;
            let mut buf = ParseBuffer::from(&data[entry..entry + IMAGE_DEBUG_DIRECTORY_SIZE]);

            let _characteristics = buf.parse_u32()?;
            let timestamp = buf.parse_u32()?;
            let _major = buf.parse_u16()?;
            let _minor = buf.parse_u16()?;
            let entry_type = buf.parse_u32()?;
            let _size_of_data = buf.parse_u32()?;
            let _address_of_raw_data = buf.parse_u32()?;
            let pointer_to_raw_data = buf.parse_u32()? as usize;

            // A timestamp of zero already carries no information.
            if timestamp != 0 {
                patches.add_u32(
                    entry + 4,
                    REPLACEMENT_TIMESTAMP,
                    "IMAGE_DEBUG_DIRECTORY.TimeDateStamp",
                );
            }

            if entry_type != IMAGE_DEBUG_TYPE_CODEVIEW {
                continue;
            }

            if cv_info.is_some() {
                return Err(Error::InvalidImage("found multiple CodeView debug entries"));
            }

            if pointer_to_raw_data + CV_INFO_PDB70_SIZE > data.len() {
                return Err(Error::InvalidImage("invalid CodeView debug entry location"));
            }

            let mut buf = ParseBuffer::from(&data[pointer_to_raw_data..]);
            if buf.parse_u32()? != CV_INFO_SIGNATURE_PDB70 {
                return Err(Error::InvalidImage(
                    "unsupported PDB format, only version 7.0 is supported",
                ));
            }

            let guid = buf.parse_guid()?;
            let age = buf.parse_u32()?;

            let signature_offset = pointer_to_raw_data + 4;

            // Placeholder bytes; the real signature is derived from the
            // image contents after all patch locations are known.
            patches.add(signature_offset, vec![0u8; 16], "PDB Signature");
            patches.add_u32(signature_offset + 16, REPLACEMENT_PDB_AGE, "PDB Age");

            cv_info = Some(CodeViewInfo {
                signature_offset,
                guid,
                age,
            });
        }

        Ok(cv_info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal PE32+ image: DOS header, headers, one section at file
    /// offset 0x200 / RVA 0x1000 holding a debug directory and a CodeView
    /// record.
    fn build_image() -> Vec<u8> {
        let mut data = vec![0u8; 0x400];

        data[0] = b'M';
        data[1] = b'Z';
        data[60..64].copy_from_slice(&0x80u32.to_le_bytes());

        data[0x80..0x84].copy_from_slice(b"PE\0\0");

        // IMAGE_FILE_HEADER at 0x84
        data[0x84..0x86].copy_from_slice(&0x8664u16.to_le_bytes());
        data[0x86..0x88].copy_from_slice(&1u16.to_le_bytes()); // one section
        data[0x88..0x8c].copy_from_slice(&0x5eadbeefu32.to_le_bytes()); // timestamp
        data[0x94..0x96].copy_from_slice(&240u16.to_le_bytes()); // optional header size

        // IMAGE_OPTIONAL_HEADER64 at 0x98
        let opt = 0x98;
        data[opt..opt + 2].copy_from_slice(&0x20bu16.to_le_bytes());
        data[opt + 64..opt + 68].copy_from_slice(&0x12345678u32.to_le_bytes()); // checksum
        data[opt + 108..opt + 112].copy_from_slice(&16u32.to_le_bytes());

        // debug data directory: one entry at RVA 0x1000
        let debug_dir = opt + 112 + 6 * 8;
        data[debug_dir..debug_dir + 4].copy_from_slice(&0x1000u32.to_le_bytes());
        data[debug_dir + 4..debug_dir + 8].copy_from_slice(&28u32.to_le_bytes());

        // section header at 0x98 + 240 = 0x188
        let sect = opt + 240;
        data[sect..sect + 6].copy_from_slice(b".rdata");
        data[sect + 8..sect + 12].copy_from_slice(&0x200u32.to_le_bytes()); // virtual size
        data[sect + 12..sect + 16].copy_from_slice(&0x1000u32.to_le_bytes()); // rva
        data[sect + 16..sect + 20].copy_from_slice(&0x200u32.to_le_bytes()); // raw size
        data[sect + 20..sect + 24].copy_from_slice(&0x200u32.to_le_bytes()); // raw offset

        // debug directory entry at file 0x200
        data[0x204..0x208].copy_from_slice(&0x5eadbeefu32.to_le_bytes()); // timestamp
        data[0x20c..0x210].copy_from_slice(&2u32.to_le_bytes()); // CodeView
        data[0x210..0x214].copy_from_slice(&0x30u32.to_le_bytes()); // size of data
        data[0x218..0x21c].copy_from_slice(&0x230u32.to_le_bytes()); // raw pointer

        // CV_INFO_PDB70 at 0x230
        data[0x230..0x234].copy_from_slice(b"RSDS");
        for (i, byte) in data[0x234..0x244].iter_mut().enumerate() {
            *byte = i as u8 + 1;
        }
        data[0x244..0x248].copy_from_slice(&7u32.to_le_bytes()); // age
        data[0x248..0x256].copy_from_slice(b"synthetic.pdb\0");

        data
    }

    #[test]
    fn test_parse() {
        let data = build_image();
        let pe = PeFile::parse(&data).expect("parse");

        assert_eq!(pe.magic(), 0x20b);
        assert_eq!(pe.sections().len(), 1);
        assert_eq!(pe.translate(0x1000).unwrap(), 0x200);
        assert_eq!(pe.translate(0x1030).unwrap(), 0x230);
        assert!(pe.translate(0x9000).is_err());
    }

    #[test]
    fn test_collect_patches() {
        let data = build_image();
        let pe = PeFile::parse(&data).expect("parse");

        let mut patches = PatchSet::new(data.len());
        let cv = pe
            .collect_patches(&data, &mut patches)
            .expect("collect")
            .expect("CodeView record");

        assert_eq!(cv.signature_offset, 0x234);
        assert_eq!(cv.age, 7);
        assert_eq!(
            cv.guid.to_bytes_le(),
            [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]
        );

        // file header timestamp, checksum, debug timestamp, signature, age
        assert_eq!(patches.len(), 5);
    }

    #[test]
    fn test_rejects_bad_dos_signature() {
        let mut data = build_image();
        data[0] = b'X';
        match PeFile::parse(&data) {
            Err(Error::InvalidImage("invalid DOS signature")) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_pe_signature() {
        let mut data = build_image();
        data[0x80] = b'Q';
        match PeFile::parse(&data) {
            Err(Error::InvalidImage("invalid PE signature")) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_section_table_overflow() {
        let mut data = build_image();
        // claim an absurd section count
        data[0x86..0x88].copy_from_slice(&0x4000u16.to_le_bytes());
        match PeFile::parse(&data) {
            Err(Error::InvalidImage("section headers exceed image size")) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_multiple_codeview_entries() {
        let mut data = build_image();

        // grow the debug directory to two entries, both CodeView
        let opt = 0x98;
        let debug_dir = opt + 112 + 6 * 8;
        data[debug_dir + 4..debug_dir + 8].copy_from_slice(&56u32.to_le_bytes());
        data[0x228..0x22c].copy_from_slice(&2u32.to_le_bytes());
        data[0x234..0x238].copy_from_slice(&0x230u32.to_le_bytes());

        let pe = PeFile::parse(&data).expect("parse");
        let mut patches = PatchSet::new(data.len());
        match pe.collect_patches(&data, &mut patches) {
            Err(Error::InvalidImage("found multiple CodeView debug entries")) => (),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
