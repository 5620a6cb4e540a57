// Copyright 2017 pdb Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end rewriting of the image alone.

mod common;

use std::fs;
use std::path::PathBuf;

use common::*;
use ducible::{compute_signature, patch_image, Error, PatchSet, PeFile, REPLACEMENT_TIMESTAMP};

fn write_image(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, data).unwrap();
    path
}

#[test]
fn patches_every_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(&dir, "app.exe", &build_image(0x5eadbeef, [7; 16], 3));

    patch_image(&path, None, false).expect("patch");

    let data = fs::read(&path).unwrap();
    assert_eq!(read_u32(&data, 0x88), REPLACEMENT_TIMESTAMP);
    assert_eq!(read_u32(&data, OPT_OFFSET + 64), REPLACEMENT_TIMESTAMP);
    assert_eq!(read_u32(&data, DEBUG_DIR_OFFSET + 4), REPLACEMENT_TIMESTAMP);
    assert_eq!(read_u32(&data, EXPORT_DIR_OFFSET + 4), REPLACEMENT_TIMESTAMP);
    assert_eq!(read_u32(&data, RESOURCE_DIR_OFFSET + 4), REPLACEMENT_TIMESTAMP);

    // the CodeView age is reset
    assert_eq!(read_u32(&data, CV_OFFSET + 20), 1);
}

#[test]
fn image_size_is_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let image = build_image(1, [1; 16], 1);
    let path = write_image(&dir, "app.exe", &image);

    patch_image(&path, None, false).expect("patch");

    assert_eq!(fs::read(&path).unwrap().len(), image.len());
}

#[test]
fn signature_equals_digest_of_unpatched_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(&dir, "app.exe", &build_image(0x12345678, [9; 16], 2));

    patch_image(&path, None, false).expect("patch");

    let data = fs::read(&path).unwrap();

    // Recompute the digest over the patched image. All patched ranges are
    // excluded from the digest, so it must match the embedded signature.
    let pe = PeFile::parse(&data).expect("parse patched image");
    let mut patches = PatchSet::new(data.len());
    pe.collect_patches(&data, &mut patches).expect("collect");
    patches.sort();
    let expected = compute_signature(&data, &patches);

    assert_eq!(&data[CV_OFFSET + 4..CV_OFFSET + 20], &expected);
}

#[test]
fn outputs_are_identical_for_inputs_differing_in_timestamps() {
    let dir = tempfile::tempdir().unwrap();

    // two links of the same inputs: only timestamps, checksum, GUID, and
    // age differ
    let a = write_image(&dir, "a.exe", &build_image(0x11111111, [0x13; 16], 2));
    let b = write_image(&dir, "b.exe", &build_image(0x22222222, [0x31; 16], 9));

    patch_image(&a, None, false).expect("patch a");
    patch_image(&b, None, false).expect("patch b");

    assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
}

#[test]
fn rewriting_twice_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(&dir, "app.exe", &build_image(0x600df00d, [5; 16], 4));

    patch_image(&path, None, false).expect("first run");
    let first = fs::read(&path).unwrap();

    patch_image(&path, None, false).expect("second run");
    assert_eq!(fs::read(&path).unwrap(), first);
}

#[test]
fn dry_run_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let image = build_image(0x5eadbeef, [7; 16], 3);
    let path = write_image(&dir, "app.exe", &image);

    patch_image(&path, None, true).expect("dry run");

    assert_eq!(fs::read(&path).unwrap(), image);
}

#[test]
fn rejects_a_non_pe_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(&dir, "app.exe", b"#!/bin/sh\necho not a PE\n");

    match patch_image(&path, None, false) {
        Err(Error::InvalidImage(_)) => (),
        other => panic!("unexpected: {:?}", other.map(|_| ())),
    }
}

#[test]
fn updates_the_ilk_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let guid = [0x77u8; 16];
    let path = write_image(&dir, "app.exe", &build_image(1, guid, 1));

    let ilk_path = dir.path().join("app.ilk");
    let mut ilk = vec![0u8; 128];
    ilk[40..56].copy_from_slice(&guid);
    fs::write(&ilk_path, &ilk).unwrap();

    patch_image(&path, None, false).expect("patch");

    let image = fs::read(&path).unwrap();
    let new_signature = &image[CV_OFFSET + 4..CV_OFFSET + 20];

    let ilk = fs::read(&ilk_path).unwrap();
    assert_eq!(&ilk[40..56], new_signature);
    assert_ne!(&ilk[40..56], &guid);
}
