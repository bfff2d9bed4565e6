#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(sga) = qport::decode_frame(data) {
        let _ = qport::encode_frame(&sga);
    }
});
