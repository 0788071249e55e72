#![no_main]

use libfuzzer_sys::fuzz_target;
use pmm_hater::MapArgs;

fuzz_target!(|args: MapArgs| {
    let mut args = args;
    let words = args.metadata_words();
    let mut metadata = vec![0; words];

    let pmm = match args.init(&mut metadata) {
        Ok(p) => p,
        Err(_) => return,
    };

    if let Err(e) = pmm.check_invariants() {
        panic!("\ninvariant violated after init: {e}\nmap: {args:?}");
    }

    assert!(pmm.metadata_words_used() <= words);
});
