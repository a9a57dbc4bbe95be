//! Fuzz target for the TOML tunables parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_proxy_config
//!
//! Anything `ProxyConfig::parse` accepts must also pass `validate`.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = nsrelay_config::ProxyConfig::parse(s) {
            assert!(config.validate().is_ok());
        }
    }
});
