// Copyright 2017 pdb Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The top-level rewrite driver.
//!
//! In broad strokes:
//!
//!  1. The image is mapped into memory. Its size never changes, so values
//!     are written straight into the mapping.
//!  2. The PE headers are parsed and every location that needs rewriting is
//!     queued as a patch. Nothing is written yet; a parse failure further
//!     on must not leave a half-patched image behind.
//!  3. A 128-bit digest of the image is computed, skipping the queued patch
//!     ranges. The digest replaces the PDB signature, so identical inputs
//!     produce an identical signature no matter what the linker had put
//!     there.
//!  4. The PDB, if given, is rewritten against that signature, then the
//!     `.ilk` sidecar, and finally the queued patches are applied.

use std::fs::OpenOptions;
use std::path::Path;

use md5::{Digest, Md5};
use memmap2::MmapMut;

use crate::common::Result;
use crate::ilk::patch_ilk;
use crate::patch::PatchSet;
use crate::pdb::patch_pdb_file;
use crate::pe::{PeFile, REPLACEMENT_TIMESTAMP};

/// Computes the 128-bit signature of the image: an MD5 digest over the
/// byte ranges between the (sorted) patches and the tail after the last
/// one.
///
/// Any 128-bit digest would satisfy the format; MD5 is what's used, and
/// cryptographic strength is not required here.
pub fn compute_signature(data: &[u8], patches: &PatchSet) -> [u8; 16] {
    let mut hasher = Md5::new();
    let mut pos = 0;

    for patch in patches.iter() {
        hasher.update(&data[pos..patch.offset()]);
        pos = patch.offset() + patch.len();
    }

    hasher.update(&data[pos..]);
    hasher.finalize().into()
}

/// Rewrites the image at `image_path`, and its PDB if `pdb_path` is given,
/// into bit-reproducible form.
///
/// With `dry_run` everything is parsed and reported but nothing is
/// modified.
pub fn patch_image(image_path: &Path, pdb_path: Option<&Path>, dry_run: bool) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(image_path)?;

    let mut map = unsafe { MmapMut::map_mut(&file)? };

    let pe = PeFile::parse(&map)?;

    let mut patches = PatchSet::new(map.len());
    let cv_info = pe.collect_patches(&map, &mut patches)?;

    patches.sort();

    // The signature has to be computed after the sort and before the
    // patches are applied: the digest covers exactly the bytes outside the
    // patch ranges, in file order.
    let signature = compute_signature(&map, &patches);

    if let Some(ref cv) = cv_info {
        patches.update(cv.signature_offset, &signature);
    }

    if let Some(pdb_path) = pdb_path {
        patch_pdb_file(
            pdb_path,
            cv_info.as_ref(),
            REPLACEMENT_TIMESTAMP,
            &signature,
            dry_run,
        )?;
    }

    // Keep the incremental-link sidecar consistent with the new signature.
    if let Some(ref cv) = cv_info {
        patch_ilk(image_path, &cv.guid.to_bytes_le(), &signature, dry_run)?;
    }

    patches.apply(&mut map, dry_run);

    if !dry_run {
        map.flush()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_skips_patch_ranges() {
        let mut patches = PatchSet::new(32);
        patches.add(8, vec![0; 4], "hole");
        patches.sort();

        let mut a = vec![1u8; 32];
        let mut b = vec![1u8; 32];

        // differing only inside the patch range must not change the digest
        a[9] = 0xaa;
        b[9] = 0xbb;
        assert_eq!(compute_signature(&a, &patches), compute_signature(&b, &patches));

        // differing outside of it must
        b[20] = 0x55;
        assert_ne!(compute_signature(&a, &patches), compute_signature(&b, &patches));
    }

    #[test]
    fn test_signature_of_empty_patch_set_covers_everything() {
        let patches = PatchSet::new(4);
        let signature = compute_signature(&[1, 2, 3, 4], &patches);

        let mut hasher = Md5::new();
        hasher.update([1u8, 2, 3, 4]);
        let expected: [u8; 16] = hasher.finalize().into();

        assert_eq!(signature, expected);
    }
}
