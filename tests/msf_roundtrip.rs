// Copyright 2017 pdb Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Round-trip tests for the MSF container.

mod common;

use std::fs::File;
use std::io::Cursor;

use common::{read_u32, stream_bytes};
use ducible::{MemoryStream, MsfFile, MSF_MAGIC, MSF_PAGE_SIZE};

fn pattern(length: usize, salt: u8) -> Vec<u8> {
    (0..length).map(|i| (i as u8).wrapping_add(salt)).collect()
}

#[test]
fn round_trips_through_a_real_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("container.pdb");

    let streams = vec![
        pattern(40, 1),
        pattern(5000, 2),
        Vec::new(),
        pattern(MSF_PAGE_SIZE, 3),
        pattern(3, 4),
    ];

    let mut msf = MsfFile::new();
    for data in &streams {
        msf.add_stream(Box::new(MemoryStream::with_data(data.clone())));
    }

    let mut file = File::create(&path).unwrap();
    msf.write(&mut file).expect("write");
    drop(file);

    let mut reopened = MsfFile::open(File::open(&path).unwrap()).expect("open");
    assert_eq!(reopened.stream_count(), streams.len());

    for (index, data) in streams.iter().enumerate() {
        assert_eq!(&stream_bytes(&mut reopened, index as u32), data);
    }
}

#[test]
fn header_describes_the_file() {
    let mut msf = MsfFile::new();
    msf.add_stream(Box::new(MemoryStream::with_data(pattern(100, 0))));
    msf.add_stream(Box::new(MemoryStream::with_data(pattern(9000, 1))));

    let mut out = Cursor::new(Vec::new());
    msf.write(&mut out).expect("write");
    let bytes = out.into_inner();

    assert_eq!(&bytes[..32], &MSF_MAGIC[..]);
    assert_eq!(read_u32(&bytes, 32) as usize, MSF_PAGE_SIZE);
    assert_eq!(read_u32(&bytes, 36), 1); // active free page map

    let page_count = read_u32(&bytes, 40) as usize;
    assert_eq!(page_count * MSF_PAGE_SIZE, bytes.len());

    // page 3 is the superfluous blank page
    assert!(bytes[3 * MSF_PAGE_SIZE..4 * MSF_PAGE_SIZE].iter().all(|&b| b == 0));

    // page 3 reads as free in the free page map at page 1
    let fpm = &bytes[MSF_PAGE_SIZE..2 * MSF_PAGE_SIZE];
    assert_eq!(fpm[0] & (1 << 3), 1 << 3);
    // stream 0 holds the discarded previous stream table; its page (the
    // first data page, page 4) reads as free too
    assert_eq!(fpm[0] & (1 << 4), 1 << 4);
    // the header page and stream 1's pages are used
    assert_eq!(fpm[0] & 1, 0);
    assert_eq!(fpm[0] & (1 << 5), 0);
    assert_eq!(fpm[0] & (1 << 6), 0);
    assert_eq!(fpm[0] & (1 << 7), 0);
}

#[test]
fn data_pages_skip_the_free_page_map_slots() {
    // A stream large enough to cross the FPM interval at pages 4097 and
    // 4098. Those two slots must hold blanks, with the stream's data
    // flowing around them.
    let big = pattern(4100 * MSF_PAGE_SIZE, 7);

    let mut msf = MsfFile::new();
    msf.add_stream(Box::new(MemoryStream::new()));
    msf.replace_stream(0, None);
    msf.add_stream(Box::new(MemoryStream::with_data(big.clone())));

    let mut out = Cursor::new(Vec::new());
    msf.write(&mut out).expect("write");
    let bytes = out.into_inner();

    let page = |n: usize| &bytes[n * MSF_PAGE_SIZE..(n + 1) * MSF_PAGE_SIZE];

    // the second FPM slot of the pair is never written
    assert!(page(4098).iter().all(|&b| b == 0));

    let mut reopened = MsfFile::open(Cursor::new(bytes)).expect("open");
    assert_eq!(stream_bytes(&mut reopened, 1), big);
}

#[test]
fn empty_slots_survive_a_round_trip() {
    let mut msf = MsfFile::new();
    msf.add_stream(Box::new(MemoryStream::with_data(pattern(10, 0))));
    msf.add_stream(Box::new(MemoryStream::with_data(pattern(10, 1))));
    msf.replace_stream(1, None);
    msf.add_stream(Box::new(MemoryStream::with_data(pattern(10, 2))));

    let mut out = Cursor::new(Vec::new());
    msf.write(&mut out).expect("write");

    let mut reopened = MsfFile::open(Cursor::new(out.into_inner())).expect("open");
    assert_eq!(reopened.stream_count(), 3);
    assert!(stream_bytes(&mut reopened, 1).is_empty());
    assert_eq!(stream_bytes(&mut reopened, 2), pattern(10, 2));
}

#[test]
fn serialisation_is_deterministic() {
    let build = || {
        let mut msf = MsfFile::new();
        msf.add_stream(Box::new(MemoryStream::with_data(pattern(123, 0))));
        msf.add_stream(Box::new(MemoryStream::with_data(pattern(45678, 1))));
        let mut out = Cursor::new(Vec::new());
        msf.write(&mut out).expect("write");
        out.into_inner()
    };

    assert_eq!(build(), build());
}
