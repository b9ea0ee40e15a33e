#![no_main]
use libfuzzer_sys::fuzz_target;
use zstorage::{compress, decompress, is_compressed};

fuzz_target!(|data: &[u8]| {
    // Arbitrary stored records must never panic on the way out
    let _ = decompress(data);
    // And anything we'd write must read back as it went in
    if !is_compressed(data) {
        let stored = compress(data).unwrap();
        assert_eq!(decompress(&stored).unwrap(), data);
    }
});
