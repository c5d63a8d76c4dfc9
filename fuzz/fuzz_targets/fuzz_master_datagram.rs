#![no_main]

use drudgenet::service::master_messages::{decode_datagram, validate_data_header};
use libfuzzer_sys::fuzz_target;

const PROTOCOL_ID: u32 = 0x4452_5547;

fuzz_target!(|data: &[u8]| {
    // Header validation and decoding must agree and never panic
    let valid = validate_data_header(PROTOCOL_ID, data);
    let decoded = decode_datagram(PROTOCOL_ID, data);
    if !valid {
        assert!(decoded.is_err());
    }
});
