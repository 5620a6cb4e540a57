// Copyright 2017 pdb Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Canonicalisation of GUIDs embedded in file names.
//!
//! The linker writes temporary files whose names contain a freshly generated
//! GUID (for example the linker-generated manifest resource), and those names
//! end up in several PDB streams. Rewriting the GUID text with a fixed value
//! removes the randomness without moving any surrounding bytes.

use std::sync::OnceLock;

use regex::bytes::Regex;

/// The replacement text. It is exactly as long as the text it replaces, so
/// the surrounding string layout is preserved.
const NULL_GUID: &[u8] = b"{00000000-0000-0000-0000-000000000000}";

fn guid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            "\\{[0-9a-fA-F]{8}-\
             [0-9a-fA-F]{4}-\
             [0-9a-fA-F]{4}-\
             [0-9a-fA-F]{4}-\
             [0-9a-fA-F]{12}\\}",
        )
        .expect("the GUID pattern is valid")
    })
}

/// Overwrites the first `{xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx}` substring of
/// `name` with the null GUID. The whole string is searched, not just its
/// head: the GUID usually sits between a directory prefix and a file
/// extension.
pub fn normalize_file_name_guid(name: &mut [u8]) {
    if let Some(found) = guid_pattern().find(name) {
        let (start, end) = (found.start(), found.end());
        name[start..end].copy_from_slice(NULL_GUID);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replaces_guid_in_the_middle() {
        let mut name =
            b"C:\\Temp\\lnk{D98A0A7E-F0D6-4EC6-9D1F-76C9F3D4A2B1}.tmp".to_vec();
        let before = name.len();
        normalize_file_name_guid(&mut name);
        assert_eq!(name.len(), before);
        assert_eq!(
            name,
            b"C:\\Temp\\lnk{00000000-0000-0000-0000-000000000000}.tmp".to_vec()
        );
    }

    #[test]
    fn test_lower_case_hex() {
        let mut name = b"{d98a0a7e-f0d6-4ec6-9d1f-76c9f3d4a2b1}".to_vec();
        normalize_file_name_guid(&mut name);
        assert_eq!(name, NULL_GUID.to_vec());
    }

    #[test]
    fn test_no_guid_is_untouched() {
        let mut name = b"C:\\src\\module.obj".to_vec();
        let before = name.clone();
        normalize_file_name_guid(&mut name);
        assert_eq!(name, before);
    }

    #[test]
    fn test_malformed_guid_is_untouched() {
        // too few digits in the last group
        let mut name = b"{D98A0A7E-F0D6-4EC6-9D1F-76C9F3D4A2B}".to_vec();
        let before = name.clone();
        normalize_file_name_guid(&mut name);
        assert_eq!(name, before);
    }

    #[test]
    fn test_null_guid_is_a_fixed_point() {
        let mut name = b"lnk{00000000-0000-0000-0000-000000000000}.tmp".to_vec();
        let before = name.clone();
        normalize_file_name_guid(&mut name);
        assert_eq!(name, before);
    }
}
