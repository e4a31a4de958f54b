//! Feeds arbitrary bytes through `AppConfig::parse` looking for panics in the
//! TOML deserialization and validation path.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Only valid UTF-8 can reach the parser; the result itself is irrelevant.
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = rigd_config::AppConfig::parse(text);
    }
});
