//! Fuzz stored file name parsing.
//!
//! Download paths reach [`StoredName::parse`] verbatim; anything it accepts
//! must render back to the same name and stay inside the upload directory.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tempdrop::files::StoredName;

fuzz_target!(|name: &str| {
    if let Some(parsed) = StoredName::parse(name) {
        assert_eq!(parsed.to_string(), name);
        assert!(!name.contains('/') && !name.contains('\\'));
    }
});
