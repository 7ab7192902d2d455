//! A thread whose entry returns a value `p`; joining returns `p` exactly
//! once, and a second join fails with the detached-kind error.

use ghostrt::{Error, Thread};

mod common;

#[test]
fn s4_thread_join_return_value() {
    common::init_tracing();
    const P: usize = 0xdead_beef;
    let thread = Thread::spawn(|| P).unwrap();

    let r = thread.join().unwrap();
    assert_eq!(r, P);

    let second_join = thread.join();
    assert_eq!(second_join, Err(Error::Detached));
}
