//! Fuzz target for the device line-protocol parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_wire_parser
//!
//! Firmware replies arrive as arbitrary bytes off a serial line; the parser
//! must reject garbage without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rigd_core::transport::wire;

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        // Should never panic regardless of input
        let _ = wire::parse_reply(line);
    }
});
