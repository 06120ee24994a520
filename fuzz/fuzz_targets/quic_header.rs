//! Fuzz target for QUIC invariant header decoding
//!
//! Every decodable header must either be answerable with Version
//! Negotiation or be checked as a possible Initial without panicking.

#![no_main]

use dnsd_transport::quic::{
    SERVER_CID_LEN, accept_initial, decode_version_cid, write_version_negotiation,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(hdr) = decode_version_cid(data, SERVER_CID_LEN) else {
        return;
    };

    if hdr.needs_version_negotiation() {
        let mut out = [0u8; 1024];
        let len = write_version_negotiation(&mut out, &hdr).unwrap();
        let vn = decode_version_cid(&out[..len], 0).unwrap();
        assert_eq!(vn.version, Some(0));
        assert_eq!(vn.dcid, hdr.scid);
    } else {
        let _ = accept_initial(data, &hdr);
    }
});
