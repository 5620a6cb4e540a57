// Copyright 2017 pdb Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Byte-range rewrites queued against the image.
//!
//! All the patch locations need to be found before parsing finishes. If we
//! patched while parsing, parsing could fail half-way through and leave an
//! inconsistent image behind. Thus, patches accumulate in a [`PatchSet`] and
//! are applied in a single pass after every parse has succeeded.

use std::cmp::Ordering;
use std::slice;

/// A range of bytes to overwrite, together with the replacement bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    offset: usize,
    bytes: Vec<u8>,
    name: &'static str,
}

impl Patch {
    pub fn new(offset: usize, bytes: Vec<u8>, name: &'static str) -> Self {
        Patch {
            offset,
            bytes,
            name,
        }
    }

    /// The file offset this patch overwrites.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The number of bytes this patch overwrites.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// A short human-readable description of the field being patched.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The replacement bytes.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Applies the patch. Bounds have been validated by the parser that queued
    /// this patch. Writes only happen when the target bytes actually differ,
    /// so a second run over an already-patched image is a no-op.
    fn apply(&self, buf: &mut [u8], dry_run: bool) {
        let target = &mut buf[self.offset..self.offset + self.bytes.len()];

        if target == self.bytes.as_slice() {
            return;
        }

        println!(
            "Patching '{}' at offset {:#x} ({} bytes)",
            self.name,
            self.offset,
            self.bytes.len()
        );

        if !dry_run {
            target.copy_from_slice(&self.bytes);
        }
    }
}

impl PartialOrd for Patch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Patch {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.offset, self.bytes.len()).cmp(&(other.offset, other.bytes.len()))
    }
}

/// The ordered set of patches queued against a single image.
///
/// Lifecycle: created after the PE headers validate, extended via [`add`]
/// while parsing, frozen by [`sort`], consumed by [`apply`]. The sorted order
/// is what the signature computation iterates to hash the gaps between
/// patches.
///
/// [`add`]: Self::add
/// [`sort`]: Self::sort
/// [`apply`]: Self::apply
#[derive(Debug)]
pub struct PatchSet {
    image_length: usize,
    patches: Vec<Patch>,
}

impl PatchSet {
    /// Creates an empty patch set for an image of `image_length` bytes.
    pub fn new(image_length: usize) -> Self {
        PatchSet {
            image_length,
            patches: Vec::new(),
        }
    }

    /// Queues a patch overwriting `bytes.len()` bytes at `offset`.
    ///
    /// The caller is responsible for having bounds-checked the range; this is
    /// an internal invariant, not a runtime error.
    pub fn add(&mut self, offset: usize, bytes: Vec<u8>, name: &'static str) {
        debug_assert!(offset + bytes.len() <= self.image_length);
        self.patches.push(Patch::new(offset, bytes, name));
    }

    /// Convenience for the common case of patching a little-endian `u32` field.
    pub fn add_u32(&mut self, offset: usize, value: u32, name: &'static str) {
        self.add(offset, value.to_le_bytes().to_vec(), name);
    }

    /// Replaces the bytes of a previously queued patch at `offset`.
    ///
    /// This exists for the PDB signature: its patch is queued with placeholder
    /// bytes while parsing, the signature is computed from the gaps between
    /// the sorted patches, and only then can the real bytes be filled in.
    pub fn update(&mut self, offset: usize, bytes: &[u8]) {
        for patch in &mut self.patches {
            if patch.offset == offset && patch.bytes.len() == bytes.len() {
                patch.bytes.copy_from_slice(bytes);
                return;
            }
        }

        debug_assert!(false, "no patch queued at offset {:#x}", offset);
    }

    /// Sorts the patches by `(offset, length)`.
    ///
    /// Must be called once all patches have been added and before the image
    /// signature is computed, since the signature hashes the gaps between
    /// patches in file order.
    pub fn sort(&mut self) {
        self.patches.sort();

        if cfg!(debug_assertions) {
            for pair in self.patches.windows(2) {
                debug_assert!(
                    pair[0].offset + pair[0].len() <= pair[1].offset,
                    "overlapping patches '{}' and '{}'",
                    pair[0].name,
                    pair[1].name
                );
            }
        }
    }

    /// Iterates over the patches in their current order.
    pub fn iter(&self) -> slice::Iter<'_, Patch> {
        self.patches.iter()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Applies every patch to `buf`, reporting one line per patch that
    /// changes bytes. With `dry_run` the reporting happens but no bytes are
    /// written.
    pub fn apply(&self, buf: &mut [u8], dry_run: bool) {
        debug_assert_eq!(buf.len(), self.image_length);

        for patch in &self.patches {
            patch.apply(buf, dry_run);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        let a = Patch::new(8, vec![0; 4], "a");
        let b = Patch::new(8, vec![0; 16], "b");
        let c = Patch::new(4, vec![0; 4], "c");

        assert!(c < a);
        assert!(a < b);
        assert!(c < b);
    }

    #[test]
    fn test_sort_is_by_offset_then_length() {
        let mut patches = PatchSet::new(64);
        patches.add(32, vec![0xff; 4], "late");
        patches.add(4, vec![0xff; 4], "early");
        patches.add(16, vec![0xff; 2], "mid");
        patches.sort();

        let offsets: Vec<usize> = patches.iter().map(|p| p.offset()).collect();
        assert_eq!(offsets, vec![4, 16, 32]);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut buf = vec![0u8; 16];
        let mut patches = PatchSet::new(16);
        patches.add(4, vec![1, 2, 3, 4], "field");
        patches.sort();

        patches.apply(&mut buf, false);
        assert_eq!(&buf[4..8], &[1, 2, 3, 4]);

        let snapshot = buf.clone();
        patches.apply(&mut buf, false);
        assert_eq!(buf, snapshot);
    }

    #[test]
    fn test_dry_run_does_not_write() {
        let mut buf = vec![0u8; 16];
        let mut patches = PatchSet::new(16);
        patches.add(0, vec![0xaa; 8], "field");
        patches.sort();

        patches.apply(&mut buf, true);
        assert_eq!(buf, vec![0u8; 16]);
    }

    #[test]
    fn test_update_fills_placeholder() {
        let mut buf = vec![0u8; 32];
        let mut patches = PatchSet::new(32);
        patches.add(8, vec![0; 16], "PDB Signature");
        patches.sort();
        patches.update(8, &[7u8; 16]);

        patches.apply(&mut buf, false);
        assert_eq!(&buf[8..24], &[7u8; 16]);
    }
}
