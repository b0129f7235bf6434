//! Scenario: two fibers, two disjoint `PROT_NONE` pages, both backed by a
//! real file, both faulting before either completes — exercises the
//! idle-list-first / wait-list-scan / `aio_suspend` scheduling policy
//! actually switching between fibers rather than resolving serially.

mod common;

use std::fs::OpenOptions;
use std::io::Write as _;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU8, Ordering};

static OBSERVED: [AtomicU8; 2] = [AtomicU8::new(0), AtomicU8::new(0)];

fn read_first_byte(i: usize, args: *mut std::ffi::c_void) {
    let ptr = args as *mut u8;
    let byte = unsafe { std::ptr::read_volatile(ptr) };
    OBSERVED[i].store(byte, Ordering::SeqCst);
}

#[test]
fn two_fibers_interleaved_faults() {
    let _g = common::GUARD.lock().unwrap();
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

    let path = std::env::temp_dir().join(format!("ooc-test-two-fault-{}", std::process::id()));
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .expect("create backing file");
    let mut content = vec![0u8; 2 * page_size];
    content[0] = 0x11;
    content[page_size] = 0x22;
    file.write_all(&content).expect("write backing file");
    let fd = file.as_raw_fd();

    let mapping = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            2 * page_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(mapping, libc::MAP_FAILED, "mmap failed");

    let p0 = mapping as usize;
    let p1 = mapping as usize + page_size;

    let region0 = ooc::memory::register_file_backed_region(p0, page_size, fd, 0)
        .expect("register region 0");
    let region1 = ooc::memory::register_file_backed_region(p1, page_size, fd, page_size as i64)
        .expect("register region 1");

    ooc::configure(ooc::Config {
        num_fibers: 2,
        ..Default::default()
    })
    .unwrap();

    ooc::schedule(read_first_byte, 0, p0 as *mut std::ffi::c_void).unwrap();
    ooc::schedule(read_first_byte, 1, p1 as *mut std::ffi::c_void).unwrap();
    ooc::wait().unwrap();

    assert_eq!(OBSERVED[0].load(Ordering::SeqCst), 0x11);
    assert_eq!(OBSERVED[1].load(Ordering::SeqCst), 0x22);

    ooc::finalize().unwrap();
    region0.unregister().unwrap();
    region1.unregister().unwrap();
    unsafe {
        libc::munmap(mapping, 2 * page_size);
    }
    let _ = std::fs::remove_file(&path);
}
