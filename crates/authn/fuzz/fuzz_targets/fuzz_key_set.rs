//! Fuzz target for key set documents.
//!
//! Deserializes arbitrary bytes as a key-publication document and parses every
//! descriptor. Malformed keys must be skipped, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use stockfolio_authn::key_material::{KeySetDocument, parse_descriptor, parse_key_set};

fuzz_target!(|data: &[u8]| {
    let Ok(document) = serde_json::from_slice::<KeySetDocument>(data) else {
        return;
    };

    let keys = parse_key_set(&document.keys);
    assert!(keys.len() <= document.keys.len());

    for descriptor in &document.keys {
        if let Ok(key) = parse_descriptor(descriptor) {
            assert_eq!(key.kid(), descriptor.kid);
        }
    }
});
