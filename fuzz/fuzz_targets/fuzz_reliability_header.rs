#![no_main]

use drudgenet::transport::connection::ReliabilityHeader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok((header, payload)) = ReliabilityHeader::decode(data) {
        let packet = header.encode(payload).expect("re-encode");
        assert_eq!(packet, data);
    }
});
