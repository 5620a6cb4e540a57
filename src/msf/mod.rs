// Copyright 2017 pdb Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The Multi-Stream File (MSF) container format used by PDBs.
//!
//! At a high level, an MSF implements *streams*: standalone byte sequences
//! embedded in a single file. A stream consists of one or more fixed-size
//! pages which can live anywhere in the file and in any order.
//!
//! The first page is special. It holds the MSF header and the list of pages
//! that in turn address the *stream table* stream. The stream table lists
//! every stream's size followed by every stream's page numbers; since the
//! stream table is itself a stream, reading it takes two levels of
//! indirection through page lists.
//!
//! [`MsfFile::open`] resolves that indirection and materialises one
//! [`FileStream`] per stream. [`MsfFile::write`] serialises the streams back
//! out with a freshly built stream table, header, and free page map.

use std::cell::RefCell;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::common::{Error, Result};

mod stream;
pub use self::stream::{read_to_vec, FileStream, MemoryStream, MsfStream, ReadOnlyStream};

/// Magic version string in the MSF header.
pub const MSF_MAGIC: [u8; 32] = *b"Microsoft C/C++ MSF 7.00\r\n\x1a\x44\x53\x00\x00\x00";

/// Size of the MSF header preceding the root directory: magic, page size,
/// active free page map, page count, and the stream table size and page
/// number index.
pub const MSF_HEADER_SIZE: usize = 52;

/// The page size used when writing an MSF. Reading accepts any power of two.
pub const MSF_PAGE_SIZE: usize = 4096;

/// The number of pages required to hold `length` bytes.
#[inline]
pub fn pages_needed(page_size: usize, length: usize) -> usize {
    (length + page_size - 1) / page_size
}

/// Whether the given page index is reserved for the free page map.
///
/// There are two FPM pages every `page_size` pages, starting at page 1. One
/// FPM of a pair is active; the other exists so that Microsoft's writer can
/// commit updates atomically by flipping the index in the header. A page
/// size of 4096 already gives a single FPM page enough bits for 4096 * 8
/// pages, so most of these pages are dead weight, but the format requires
/// the stride.
#[inline]
fn is_fpm_page(page: usize) -> bool {
    matches!(page & (MSF_PAGE_SIZE - 1), 1 | 2)
}

/// The free page map: one bit per page, set when the page is free.
struct FreePageMap {
    data: Vec<u8>,
}

impl FreePageMap {
    /// Creates a map of `page_count` pages, all initially marked used. Bits
    /// past `page_count` in the last byte read as free.
    fn new(page_count: usize) -> Self {
        let mut data = vec![0u8; (page_count + 7) / 8];

        let spare = data.len() * 8 - page_count;
        if let Some(last) = data.last_mut() {
            *last |= !(0xffu8 >> spare);
        }

        FreePageMap { data }
    }

    fn set_free(&mut self, page: usize) {
        self.data[page / 8] |= 1 << (page % 8);
    }

    #[cfg(test)]
    fn is_free(&self, page: usize) -> bool {
        self.data[page / 8] & (1 << (page % 8)) != 0
    }

    /// Writes the map into its reserved pages: up to one page of bits at
    /// page 1, the next at page 1 + 4096, and so on. The tail of the last
    /// FPM page is filled with 0xff so pages beyond the map read as free.
    /// The second page of each FPM pair is left untouched.
    fn write<W: Write + Seek>(&self, w: &mut W) -> Result<()> {
        let mut page = 1u64;
        let mut data = self.data.as_slice();

        while data.len() >= MSF_PAGE_SIZE {
            w.seek(SeekFrom::Start(page * MSF_PAGE_SIZE as u64))?;
            w.write_all(&data[..MSF_PAGE_SIZE])?;

            data = &data[MSF_PAGE_SIZE..];
            page += MSF_PAGE_SIZE as u64;
        }

        if !data.is_empty() {
            w.seek(SeekFrom::Start(page * MSF_PAGE_SIZE as u64))?;
            w.write_all(data)?;

            let ones = vec![0xffu8; MSF_PAGE_SIZE - data.len()];
            w.write_all(&ones)?;
        }

        Ok(())
    }
}

fn validate_page(page: u32, page_count: u32) -> Result<u32> {
    if page == 0 || page >= page_count {
        Err(Error::InvalidMsf("page number out of range"))
    } else {
        Ok(page)
    }
}

/// An open MSF container: an owned collection of streams keyed by index.
///
/// Index 0 is the old stream table and is discarded when rewriting. Indices
/// 1 through 4 have fixed roles (PDB info, TPI, DBI, IPI); higher indices
/// are referenced by name through the PDB info name map or by stream number
/// fields inside the DBI stream. A `None` slot serialises as an empty
/// stream, preserving the indices of every stream after it.
pub struct MsfFile {
    streams: Vec<Option<Box<dyn MsfStream>>>,
}

impl Default for MsfFile {
    fn default() -> Self {
        MsfFile::new()
    }
}

impl MsfFile {
    /// Creates an empty container.
    pub fn new() -> Self {
        MsfFile {
            streams: Vec::new(),
        }
    }

    /// Opens an MSF container, reconstructing every stream from the stream
    /// table.
    pub fn open<R: Read + Seek + 'static>(mut source: R) -> Result<MsfFile> {
        let file_length = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(0))?;

        let mut header = [0u8; MSF_HEADER_SIZE];
        source.read_exact(&mut header).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::InvalidMsf("missing MSF header")
            } else {
                Error::IoError(e)
            }
        })?;

        if header[..32] != MSF_MAGIC {
            return Err(Error::InvalidMsf("invalid MSF header"));
        }

        let page_size = LittleEndian::read_u32(&header[32..]) as usize;
        let free_page_map = LittleEndian::read_u32(&header[36..]);
        let page_count = LittleEndian::read_u32(&header[40..]);
        let stream_table_size = LittleEndian::read_u32(&header[44..]) as usize;

        if page_size.count_ones() != 1 {
            return Err(Error::InvalidMsf("invalid page size"));
        }

        if free_page_map != 1 && free_page_map != 2 {
            return Err(Error::InvalidMsf("invalid free page map page number"));
        }

        if page_size as u64 * page_count as u64 != file_length {
            return Err(Error::InvalidMsf("invalid MSF file length"));
        }

        // The number of pages required to store the stream table, which is
        // also the number of entries in the stream table's page list.
        let st_pages_count = pages_needed(page_size, stream_table_size);

        // The page numbers holding that page list follow the header and must
        // fit in the remainder of the first page.
        if MSF_HEADER_SIZE + st_pages_count * 4 > page_size {
            return Err(Error::InvalidMsf(
                "stream table page list does not fit in the first page",
            ));
        }

        let mut root_pages = Vec::with_capacity(st_pages_count);
        for _ in 0..pages_needed(page_size, st_pages_count * 4) {
            root_pages.push(validate_page(
                source.read_u32::<LittleEndian>()?,
                page_count,
            )?);
        }

        let source = Rc::new(RefCell::new(source));

        // Read the list of stream table pages through the root directory.
        let mut st_pages_stream = FileStream::new(
            Rc::clone(&source),
            page_size,
            st_pages_count * 4,
            root_pages,
        );
        let st_pages_bytes = read_to_vec(&mut st_pages_stream)?;

        let mut st_pages = Vec::with_capacity(st_pages_count);
        for chunk in st_pages_bytes.chunks_exact(4) {
            st_pages.push(validate_page(LittleEndian::read_u32(chunk), page_count)?);
        }

        // Finally, read the stream table itself.
        let mut st_stream =
            FileStream::new(Rc::clone(&source), page_size, stream_table_size, st_pages);
        let st_bytes = read_to_vec(&mut st_stream)?;

        let table: Vec<u32> = st_bytes.chunks_exact(4).map(LittleEndian::read_u32).collect();

        if table.is_empty() {
            return Err(Error::InvalidMsf("missing stream table"));
        }

        // The table starts with the stream count and each stream's size in
        // bytes. Every stream's page numbers follow, back to back; a
        // stream's share is derived from its size.
        let stream_count = table[0] as usize;

        if 1 + stream_count > table.len() {
            return Err(Error::InvalidMsf("invalid stream count in stream table"));
        }

        let mut streams: Vec<Option<Box<dyn MsfStream>>> = Vec::with_capacity(stream_count);
        let mut pages_index = 1 + stream_count;

        for i in 0..stream_count {
            let mut size = table[1 + i];

            // Microsoft's implementation sometimes records a stream size of
            // -1. The stream cannot be dropped without renumbering every
            // stream after it, so treat it as empty instead.
            if size == u32::MAX {
                size = 0;
            }

            let needed = pages_needed(page_size, size as usize);
            if pages_index + needed > table.len() {
                return Err(Error::InvalidMsf("invalid stream count in stream table"));
            }

            let mut pages = Vec::with_capacity(needed);
            for &page in &table[pages_index..pages_index + needed] {
                pages.push(validate_page(page, page_count)?);
            }
            pages_index += needed;

            streams.push(Some(Box::new(FileStream::new(
                Rc::clone(&source),
                page_size,
                size as usize,
                pages,
            ))));
        }

        Ok(MsfFile { streams })
    }

    /// The number of streams, including empty slots.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Appends a stream, returning its index.
    pub fn add_stream(&mut self, stream: Box<dyn MsfStream>) -> usize {
        self.streams.push(Some(stream));
        self.streams.len() - 1
    }

    /// Returns the stream at `index`, if there is one.
    pub fn get_stream(&mut self, index: u32) -> Option<&mut dyn MsfStream> {
        match self.streams.get_mut(index as usize) {
            Some(Some(stream)) => Some(stream.as_mut()),
            _ => None,
        }
    }

    /// Replaces the stream at `index`. `None` empties the slot while keeping
    /// the indices of all following streams intact.
    ///
    /// The index must refer to an existing slot.
    pub fn replace_stream(&mut self, index: u32, stream: Option<Box<dyn MsfStream>>) {
        self.streams[index as usize] = stream;
    }

    /// Serialises the container.
    ///
    /// The layout is: header page, the two reserved free-page-map pages, one
    /// superfluous blank page, then every stream's data in index order, the
    /// stream table, and the stream table's page list. The header and the
    /// free page map are written last, once the page layout is known.
    pub fn write<W: Write + Seek>(&mut self, w: &mut W) -> Result<()> {
        let blank = [0u8; MSF_PAGE_SIZE];
        let mut page_count: u32 = 0;

        for _ in 0..4 {
            w.write_all(&blank)?;
            page_count += 1;
        }

        // The stream table: stream count, then every stream's size, then
        // every stream's page numbers as they get written below.
        let mut stream_table: Vec<u32> = Vec::new();
        stream_table.push(self.streams.len() as u32);

        for slot in &self.streams {
            stream_table.push(slot.as_ref().map_or(0, |s| s.len() as u32));
        }

        // Stream 0 is the discarded copy of the previous stream table; its
        // pages are marked free below so readers can reuse them.
        let mut stream_zero_start = stream_table.len();
        let mut stream_zero_end = stream_table.len();

        for (i, slot) in self.streams.iter_mut().enumerate() {
            if i == 0 {
                stream_zero_start = stream_table.len();
            }

            if let Some(stream) = slot {
                write_stream(w, stream.as_mut(), &mut stream_table, &mut page_count)?;
            }

            if i == 0 {
                stream_zero_end = stream_table.len();
            }
        }

        // Write the stream table itself as a stream, then its page list as
        // yet another stream. The pages of the latter form the root
        // directory stored right after the header.
        let mut table_bytes = Vec::with_capacity(stream_table.len() * 4);
        for &value in &stream_table {
            table_bytes.write_u32::<LittleEndian>(value)?;
        }

        let mut st_pages: Vec<u32> = Vec::new();
        write_stream(
            w,
            &mut ReadOnlyStream::new(&table_bytes),
            &mut st_pages,
            &mut page_count,
        )?;

        let mut st_pages_bytes = Vec::with_capacity(st_pages.len() * 4);
        for &page in &st_pages {
            st_pages_bytes.write_u32::<LittleEndian>(page)?;
        }

        let mut root_pages: Vec<u32> = Vec::new();
        write_stream(
            w,
            &mut ReadOnlyStream::new(&st_pages_bytes),
            &mut root_pages,
            &mut page_count,
        )?;

        // This could only trip for a ridiculously large PDB or a bug here.
        if root_pages.len() * 4 > MSF_PAGE_SIZE - MSF_HEADER_SIZE {
            return Err(Error::InvalidMsf(
                "root stream table pages are too large to fit in one page",
            ));
        }

        w.seek(SeekFrom::Start(0))?;
        w.write_all(&MSF_MAGIC)?;
        w.write_u32::<LittleEndian>(MSF_PAGE_SIZE as u32)?;
        w.write_u32::<LittleEndian>(1)?;
        w.write_u32::<LittleEndian>(page_count)?;
        w.write_u32::<LittleEndian>((stream_table.len() * 4) as u32)?;
        w.write_i32::<LittleEndian>(0)?;

        for &page in &root_pages {
            w.write_u32::<LittleEndian>(page)?;
        }

        let mut fpm = FreePageMap::new(page_count as usize);

        // The omnipresent superfluous page.
        fpm.set_free(3);

        for &page in &stream_table[stream_zero_start..stream_zero_end] {
            fpm.set_free(page as usize);
        }

        fpm.write(w)?;
        w.flush()?;

        Ok(())
    }
}

impl std::fmt::Debug for MsfFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sizes: Vec<Option<usize>> = self
            .streams
            .iter()
            .map(|s| s.as_ref().map(|s| s.len()))
            .collect();
        f.debug_struct("MsfFile").field("streams", &sizes).finish()
    }
}

/// Writes one stream's contents in page-size chunks, appending the page
/// number of every data page written to `pages`. Page indices reserved for
/// the free page map are skipped over with blank pages, which are not
/// recorded.
fn write_stream<W: Write + Seek>(
    w: &mut W,
    stream: &mut dyn MsfStream,
    pages: &mut Vec<u32>,
    page_count: &mut u32,
) -> Result<()> {
    if stream.is_empty() {
        return Ok(());
    }

    stream.seek(0);

    let mut buf = [0u8; MSF_PAGE_SIZE];

    loop {
        let read = stream.read(&mut buf)?;
        if read == 0 {
            break;
        }

        // Zero-pad the final partial page.
        buf[read..].fill(0);

        if is_fpm_page(*page_count as usize) {
            w.write_all(&[0u8; MSF_PAGE_SIZE])?;
            w.write_all(&[0u8; MSF_PAGE_SIZE])?;
            *page_count += 2;
        }

        w.write_all(&buf)?;
        pages.push(*page_count);
        *page_count += 1;
    }

    Ok(())
}
