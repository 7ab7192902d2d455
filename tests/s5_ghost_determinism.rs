//! Init engine, create ghost `"g-alpha"`, propose two candidates tagged
//! `"A"`/`"B"`, collapse. Running the identical sequence from scratch a
//! second time (simulating a second process) must produce the same chosen
//! index.

use ghostrt::{Candidate, GhostEngine};

mod common;

fn run_once() -> usize {
    let mut engine: GhostEngine<&'static str> = GhostEngine::new(64, 16);
    engine.init();
    let ghost = engine.create("g-alpha", None);
    engine
        .propose(&ghost, vec![Candidate::new("state-a", "A"), Candidate::new("state-b", "B")])
        .unwrap();
    engine.collapse(&ghost).unwrap()
}

#[test]
fn s5_ghost_determinism() {
    common::init_tracing();
    let first_run = run_once();
    let second_run = run_once();
    assert_eq!(first_run, second_run);
    assert!(first_run == 0 || first_run == 1);
}
