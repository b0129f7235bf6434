//! Scenario: one fiber, a single `PROT_NONE` page backed by a real file,
//! one fault on first touch, resolved through a real `aio_read`.

mod common;

use std::fs::OpenOptions;
use std::io::Write as _;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU8, Ordering};

static OBSERVED: AtomicU8 = AtomicU8::new(0);

fn read_first_byte(_i: usize, args: *mut std::ffi::c_void) {
    let ptr = args as *mut u8;
    let byte = unsafe { std::ptr::read_volatile(ptr) };
    OBSERVED.store(byte, Ordering::SeqCst);
}

#[test]
fn single_fiber_one_fault() {
    let _g = common::GUARD.lock().unwrap();
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

    let path = std::env::temp_dir().join(format!("ooc-test-single-fault-{}", std::process::id()));
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .expect("create backing file");
    file.write_all(&vec![0xABu8; page_size]).expect("write backing file");
    let fd = file.as_raw_fd();

    let mapping = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            page_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(mapping, libc::MAP_FAILED, "mmap failed");

    let region = ooc::memory::register_file_backed_region(mapping as usize, page_size, fd, 0)
        .expect("register region");

    ooc::configure(ooc::Config {
        num_fibers: 1,
        ..Default::default()
    })
    .unwrap();

    ooc::schedule(read_first_byte, 0, mapping as *mut std::ffi::c_void).unwrap();
    ooc::wait().unwrap();

    assert_eq!(OBSERVED.load(Ordering::SeqCst), 0xAB);

    ooc::finalize().unwrap();
    region.unregister().unwrap();
    unsafe {
        libc::munmap(mapping, page_size);
    }
    let _ = std::fs::remove_file(&path);
}
