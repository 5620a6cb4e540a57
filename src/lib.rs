// Copyright 2017 pdb Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `ducible` makes PE/PE+ images and their PDBs bit-reproducible.
//!
//! Linkers embed several sources of non-determinism in their outputs:
//! timestamps, an age counter, a random GUID tying the image to its PDB,
//! uninitialised struct padding, heap addresses serialised by accident, and
//! the names of GUID-named temporary files. Two links of identical inputs
//! therefore differ byte-wise even though they are semantically identical.
//! This crate rewrites both files in place to scrub those differences while
//! preserving every byte a loader or debugger consults.
//!
//! # Example
//!
//! ```no_run
//! # fn main() -> ducible::Result<()> {
//! ducible::patch_image(
//!     std::path::Path::new("app.exe"),
//!     Some(std::path::Path::new("app.pdb")),
//!     /* dry_run */ false,
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! Running the rewrite twice is a no-op: the replacement values are either
//! fixed constants or derived from the (already deterministic) remainder of
//! the image.

// modules
mod common;
mod guid;
mod ilk;
mod image;
mod msf;
mod patch;
mod pdb;
mod pe;

// exports
pub use crate::common::{Error, ParseBuffer, RawString, Result};
pub use crate::ilk::patch_ilk;
pub use crate::image::{compute_signature, patch_image};
pub use crate::msf::{
    read_to_vec, FileStream, MemoryStream, MsfFile, MsfStream, ReadOnlyStream, MSF_MAGIC,
    MSF_PAGE_SIZE,
};
pub use crate::patch::{Patch, PatchSet};
pub use crate::pdb::{patch_pdb_file, NameMap};
pub use crate::pe::{CodeViewInfo, PeFile, REPLACEMENT_PDB_AGE, REPLACEMENT_TIMESTAMP};

// re-export FallibleIterator for convenience
#[doc(no_inline)]
pub use fallible_iterator::FallibleIterator;
