#![no_main]

use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pmm_hater::{MapArgs, PmmSubject};

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    map: MapArgs,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let Args { mut map, ops } = args;

    let mut metadata = vec![0; map.metadata_words()];
    let pmm = match map.init(&mut metadata) {
        Ok(p) => p,
        Err(_) => return,
    };

    let initial = pmm.stats();
    let mut eval = Evaluator::new(PmmSubject::new(pmm));

    if let Err(failed) = eval.evaluate(ops) {
        panic!(
            "\nevaluation failed: {:?}\nmap: {map:?}\ncompleted: {:?}\nfailed: {:?}",
            failed.failure, failed.completed, failed.failed_op
        );
    }

    // Every block was handed back, so the counters are as they started.
    assert_eq!(eval.subject().pmm().stats(), initial);
});
