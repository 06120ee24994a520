//! Fuzz target for Ethernet/IP/UDP frame parsing on the XDP path
//!
//! A parsed frame must describe a payload inside the frame, and a reply
//! header built from it must parse back with the addresses swapped.

#![no_main]

use dnsd_transport::xdp::frame::{parse_frame, write_reply};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(meta) = parse_frame(data) else {
        return;
    };
    assert!(meta.payload.end <= data.len());

    let payload = &data[meta.payload.clone()];
    let hdr = meta.reply_header_len();
    let mut out = vec![0u8; hdr + payload.len()];
    out[hdr..].copy_from_slice(payload);
    if let Ok(len) = write_reply(&meta, &mut out, payload.len()) {
        let back = parse_frame(&out[..len]).unwrap();
        assert_eq!(back.src, meta.dst);
        assert_eq!(back.dst, meta.src);
    }
});
