//! Scenario: one fiber, no protected pages, no fault at all.

mod common;

use std::sync::atomic::{AtomicU8, Ordering};

static WRITTEN: AtomicU8 = AtomicU8::new(0);

fn write_one(_i: usize, args: *mut std::ffi::c_void) {
    WRITTEN.store(args as usize as u8, Ordering::SeqCst);
}

#[test]
fn single_fiber_synchronous() {
    let _g = common::GUARD.lock().unwrap();
    ooc::configure(ooc::Config {
        num_fibers: 1,
        ..Default::default()
    })
    .unwrap();

    ooc::schedule(write_one, 0, 42usize as *mut std::ffi::c_void).unwrap();
    ooc::wait().unwrap();

    assert_eq!(WRITTEN.load(Ordering::SeqCst), 42);
    ooc::finalize().unwrap();
}
