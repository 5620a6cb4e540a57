// Copyright 2017 pdb Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The stream abstraction the MSF container is built on.
//!
//! An MSF stream is a logically contiguous byte sequence stored across
//! scattered fixed-size pages. Three implementations exist: [`FileStream`]
//! reads pages lazily from the source file, [`MemoryStream`] owns a growable
//! buffer the PDB rewriter mutates, and [`ReadOnlyStream`] presents a
//! borrowed slice (the MSF writer uses it for the stream table it builds in
//! memory).

use std::cell::RefCell;
use std::cmp;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

use crate::common::{Error, Result};

/// A seekable byte sequence, possibly scattered across pages of the source
/// file.
pub trait MsfStream {
    /// Returns the length of the stream, in bytes.
    fn len(&self) -> usize;

    /// Determines whether this stream is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gets the current position, in bytes, in the stream.
    fn pos(&self) -> usize;

    /// Sets the current position, in bytes, in the stream.
    fn seek(&mut self, pos: usize);

    /// Reads from the current position into `buf`, returning the number of
    /// bytes read. Reads stop at the logical end of the stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes `buf` at the current position, returning the number of bytes
    /// written. Implementations that do not support writing write nothing
    /// and return 0.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
}

/// Reads a stream bytes-exact into a fresh buffer, leaving the stream
/// positioned at its end.
pub fn read_to_vec(stream: &mut dyn MsfStream) -> Result<Vec<u8>> {
    stream.seek(0);

    let mut data = vec![0u8; stream.len()];
    let mut total = 0;

    while total < data.len() {
        let n = stream.read(&mut data[total..])?;
        if n == 0 {
            return Err(Error::UnexpectedEof);
        }
        total += n;
    }

    Ok(data)
}

/// A stream backed by pages of the source file.
///
/// The page list is fixed at construction. Reads seek the shared file handle
/// for every page touched; writes are not supported, the source PDB is never
/// modified in place.
#[derive(Debug)]
pub struct FileStream<R> {
    source: Rc<RefCell<R>>,
    page_size: usize,
    pages: Vec<u32>,
    length: usize,
    pos: usize,
}

impl<R: Read + Seek> FileStream<R> {
    pub fn new(source: Rc<RefCell<R>>, page_size: usize, length: usize, pages: Vec<u32>) -> Self {
        FileStream {
            source,
            page_size,
            pages,
            length,
            pos: 0,
        }
    }

    fn read_from_page(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let mut source = self.source.borrow_mut();
        source.seek(SeekFrom::Start(
            page as u64 * self.page_size as u64 + offset as u64,
        ))?;
        Ok(source.read(buf)?)
    }
}

impl<R: Read + Seek> MsfStream for FileStream<R> {
    fn len(&self) -> usize {
        self.length
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut remaining = cmp::min(buf.len(), self.length.saturating_sub(self.pos));
        let mut total = 0;

        while remaining > 0 {
            let index = self.pos / self.page_size;
            let offset = self.pos % self.page_size;
            let chunk = cmp::min(remaining, self.page_size - offset);

            if index >= self.pages.len() {
                break;
            }

            let page = self.pages[index];
            let read = self.read_from_page(page, offset, &mut buf[total..total + chunk])?;

            total += read;
            self.pos += read;

            if read != chunk {
                break;
            }

            remaining -= chunk;
        }

        Ok(total)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        // The source file is opened read-only; in-place writes are never
        // needed because rewritten streams become MemoryStreams.
        Ok(0)
    }
}

/// A growable in-memory stream. Replacement streams built by the PDB
/// rewriter are of this kind.
#[derive(Debug, Default, Clone)]
pub struct MemoryStream {
    data: Vec<u8>,
    pos: usize,
}

impl MemoryStream {
    pub fn new() -> Self {
        MemoryStream::default()
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        MemoryStream { data, pos: 0 }
    }

    /// Copies the entire contents of `stream` into a new memory stream
    /// positioned at zero. The source stream's position is restored
    /// afterwards.
    pub fn from_stream(stream: &mut dyn MsfStream) -> Result<Self> {
        let pos = stream.pos();
        let data = read_to_vec(stream)?;
        stream.seek(pos);

        Ok(MemoryStream { data, pos: 0 })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Truncates or zero-extends the stream to `length` bytes.
    pub fn resize(&mut self, length: usize) {
        self.data.resize(length, 0);
        self.pos = cmp::min(self.pos, length);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl MsfStream for MemoryStream {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) {
        // Positions past the end are clamped.
        self.pos = cmp::min(self.data.len(), pos);
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos >= self.data.len() {
            return Ok(0);
        }

        let available = cmp::min(self.data.len() - self.pos, buf.len());
        buf[..available].copy_from_slice(&self.data[self.pos..self.pos + available]);
        self.pos += available;

        Ok(available)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let end = self.pos + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }

        self.data[self.pos..end].copy_from_slice(buf);
        self.pos = end;

        Ok(buf.len())
    }
}

/// A read-only stream over a borrowed slice.
#[derive(Debug)]
pub struct ReadOnlyStream<'d> {
    data: &'d [u8],
    pos: usize,
}

impl<'d> ReadOnlyStream<'d> {
    pub fn new(data: &'d [u8]) -> Self {
        ReadOnlyStream { data, pos: 0 }
    }
}

impl<'d> MsfStream for ReadOnlyStream<'d> {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) {
        self.pos = cmp::min(self.data.len(), pos);
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos >= self.data.len() {
            return Ok(0);
        }

        let available = cmp::min(self.data.len() - self.pos, buf.len());
        buf[..available].copy_from_slice(&self.data[self.pos..self.pos + available]);
        self.pos += available;

        Ok(available)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_memory_stream_read_write() {
        let mut stream = MemoryStream::new();
        assert_eq!(stream.write(b"hello").unwrap(), 5);
        assert_eq!(stream.len(), 5);

        stream.seek(0);
        let mut buf = [0u8; 3];
        assert_eq!(stream.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(stream.pos(), 3);

        // writing past the end grows the stream
        stream.seek(4);
        assert_eq!(stream.write(b"o world").unwrap(), 7);
        assert_eq!(stream.len(), 11);

        stream.seek(0);
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).unwrap(), 11);
        assert_eq!(&buf[..11], b"hello world");
    }

    #[test]
    fn test_memory_stream_seek_clamps() {
        let mut stream = MemoryStream::with_data(vec![1, 2, 3]);
        stream.seek(100);
        assert_eq!(stream.pos(), 3);
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_from_stream_restores_position() {
        let mut source = MemoryStream::with_data(vec![9, 8, 7, 6]);
        source.seek(2);

        let copy = MemoryStream::from_stream(&mut source).unwrap();
        assert_eq!(copy.data(), &[9, 8, 7, 6]);
        assert_eq!(copy.pos(), 0);
        assert_eq!(source.pos(), 2);
    }

    #[test]
    fn test_read_only_stream_rejects_writes() {
        let data = [1u8, 2, 3, 4];
        let mut stream = ReadOnlyStream::new(&data);
        assert_eq!(stream.write(b"xx").unwrap(), 0);

        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, data);
    }

    #[test]
    fn test_file_stream_reads_scattered_pages() {
        // two pages of 4 bytes each, used in reverse order
        let raw = vec![
            0xaa, 0xaa, 0xaa, 0xaa, // page 0
            b'w', b'o', b'r', b'l', // page 1
            b'h', b'e', b'l', b'l', // page 2
        ];
        let source = Rc::new(RefCell::new(Cursor::new(raw)));
        let mut stream = FileStream::new(source, 4, 7, vec![2, 1]);

        let mut buf = [0u8; 7];
        assert_eq!(stream.read(&mut buf).unwrap(), 7);
        assert_eq!(&buf, b"hellwor");

        // reads stop at the logical length, not the page boundary
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);

        stream.seek(4);
        assert_eq!(stream.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"wor");
    }
}
