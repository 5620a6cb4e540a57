// Copyright 2017 pdb Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Keeps the incremental-link sidecar in sync.
//!
//! The linker records the PDB GUID in the `.ilk` file next to the image.
//! After the signature is replaced in both the image and the PDB, the copy
//! in the sidecar must follow, or the next incremental link fails with a
//! signature mismatch.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use memmap2::MmapMut;

use crate::common::Result;

/// Replaces the old PDB signature in `<image>.ilk` with the new one.
///
/// A missing sidecar is not an error; most images are not linked
/// incrementally. Only the first occurrence of the signature is replaced.
pub fn patch_ilk(
    image_path: &Path,
    old_signature: &[u8; 16],
    new_signature: &[u8; 16],
    dry_run: bool,
) -> Result<()> {
    let ilk_path = image_path.with_extension("ilk");

    let file = match OpenOptions::new().read(true).write(true).open(&ilk_path) {
        Ok(file) => file,
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if file.metadata()?.len() < 16 {
        return Ok(());
    }

    let mut map = unsafe { MmapMut::map_mut(&file)? };

    if let Some(found) = map.windows(16).position(|window| window == old_signature) {
        println!("Replacing old PDB signature in ILK file.");

        if !dry_run {
            map[found..found + 16].copy_from_slice(new_signature);
            map.flush()?;
        }
    }

    Ok(())
}
