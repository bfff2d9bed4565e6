#![no_main]

use libfuzzer_sys::fuzz_target;
use qport::MacAddr;

fuzz_target!(|data: &[u8]| {
    let local = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
    let bound = Some("10.0.0.5:9000".parse().unwrap());
    let _ = qport::parse_frame(data, local, bound);
    let _ = qport::parse_frame(data, local, None);
});
