//! Fuzz target for compact token parsing.
//!
//! Feeds arbitrary byte strings as bearer tokens to the structural decoder and
//! the header checks that run before any key lookup. Every result must be
//! either `Ok(...)` or `Err(AuthError)`, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use stockfolio_authn::{
    KeyFamily, decode_token, extract_bearer_token, validate_algorithm, validate_kid,
};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    // The header parser sees raw client input too
    let _ = extract_bearer_token(Some(input));

    let Ok(token) = decode_token(input) else {
        return;
    };

    let _ = validate_algorithm(&token.header.alg, &[KeyFamily::Rsa, KeyFamily::Ec]);
    let _ = validate_algorithm(&token.header.alg, &[KeyFamily::Ec]);
    let _ = validate_kid(&token.header.kid);
});
