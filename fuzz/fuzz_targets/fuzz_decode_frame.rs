#![no_main]

use libfuzzer_sys::fuzz_target;
use pulsewire_client::codec;

fuzz_target!(|data: &[u8]| {
    // Binary frames: header, metadata length and truncation checks.
    if let Ok(message) = codec::decode_binary(data) {
        // Anything that decodes must survive a re-encode.
        let _ = codec::encode(&message, codec::OutboundEncoding::Binary);
    }

    if let Ok(text) = std::str::from_utf8(data) {
        let _ = codec::decode_text(text);
    }
});
