//! Fuzz target for the endpoint specification parser and pairing rules.
//!
//! Run with: cargo +nightly fuzz run fuzz_address_spec
//!
//! Input is split on the first newline into a listen and a connect spec.
//! Parsing must never panic, must be deterministic, and a parsed unix
//! endpoint must carry exactly one address.

#![no_main]

use libfuzzer_sys::fuzz_target;
use nsrelay_core::{EndpointSpec, PortMapping, Protocol};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let (listen, connect) = text.split_once('\n').unwrap_or((text, text));

    let Ok(l) = EndpointSpec::parse(listen) else {
        return;
    };
    assert_eq!(EndpointSpec::parse(listen).ok(), Some(l.clone()));
    assert!(!l.is_empty());
    if l.protocol == Protocol::Unix {
        assert_eq!(l.len(), 1);
    }

    if let Ok(c) = EndpointSpec::parse(connect) {
        if let Ok(mapping) = PortMapping::new(l, c) {
            for index in 0..mapping.listen().len() {
                let _ = mapping.connect_address(index);
            }
        }
    }
});
