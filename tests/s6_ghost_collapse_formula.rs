//! After `create("x")` and a 3-candidate `propose` (tags "p", "q", "r"),
//! the ledger holds exactly the create entry (step 0) and the propose
//! entry (step 1), so the ledger length at propose time is 1. The chosen
//! index must equal `H mod 3`, where `H` is the engine's FNV-1a-64 mix.

use ghostrt::{Candidate, GhostEngine};

mod common;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(start: u64, bytes: &[u8]) -> u64 {
    let mut acc = start;
    for &byte in bytes {
        acc ^= u64::from(byte);
        acc = acc.wrapping_mul(FNV_PRIME);
    }
    acc
}

fn expected_seed(ledger_len_at_propose: u64, ghost_id: &[u8], step_index: u64, tags: &[&str]) -> u64 {
    let mut acc = FNV_OFFSET_BASIS;
    acc = fnv1a(acc ^ FNV_OFFSET_BASIS, &ledger_len_at_propose.to_le_bytes());
    acc = fnv1a(acc ^ FNV_OFFSET_BASIS, ghost_id);
    acc = fnv1a(acc ^ FNV_OFFSET_BASIS, &step_index.to_le_bytes());
    for tag in tags {
        acc = fnv1a(acc ^ FNV_OFFSET_BASIS, tag.as_bytes());
    }
    acc
}

#[test]
fn s6_ghost_collapse_formula() {
    common::init_tracing();
    let mut engine: GhostEngine<u8> = GhostEngine::new(64, 16);
    let ghost = engine.create("x", None);
    assert_eq!(engine.ledger_len(), 1);

    engine
        .propose(
            &ghost,
            vec![Candidate::new(0, "p"), Candidate::new(1, "q"), Candidate::new(2, "r")],
        )
        .unwrap();
    assert_eq!(engine.ledger_len(), 2);

    let seed = expected_seed(1, b"x", 1, &["p", "q", "r"]);
    let expected_index = (seed % 3) as usize;

    let chosen = engine.collapse(&ghost).unwrap();
    assert_eq!(chosen, expected_index);
}
