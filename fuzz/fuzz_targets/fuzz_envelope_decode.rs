//! Fuzz target for envelope decoding.
//!
//! # Properties Tested
//! - No panics on arbitrary input
//! - Anything that decodes re-encodes and decodes to the same envelope

#![no_main]

use duelsim::protocol::{decode, encode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = decode(data) {
        let text = encode(&envelope).expect("decoded envelopes re-encode");
        let again = decode(text.as_bytes()).expect("encoded envelopes decode");
        assert_eq!(again, envelope);
    }
});
