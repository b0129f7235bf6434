//! Scenario: one VMA spanning three pages, all backed by the same file,
//! each page's fault asking for a different file offset. Regression for a
//! bug where the fault path read the VMA's raw `Backing::File` offset
//! directly instead of adjusting it by which page within the VMA faulted,
//! which would have re-read page 0's file content into every page.

mod common;

use std::fs::OpenOptions;
use std::io::Write as _;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU8, Ordering};

static OBSERVED: [AtomicU8; 3] = [AtomicU8::new(0), AtomicU8::new(0), AtomicU8::new(0)];

fn read_first_byte(i: usize, args: *mut std::ffi::c_void) {
    let ptr = args as *mut u8;
    let byte = unsafe { std::ptr::read_volatile(ptr) };
    OBSERVED[i].store(byte, Ordering::SeqCst);
}

#[test]
fn multi_page_file_backed_vma() {
    let _g = common::GUARD.lock().unwrap();
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    const NPAGES: usize = 3;

    let path = std::env::temp_dir().join(format!("ooc-test-multi-page-{}", std::process::id()));
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .expect("create backing file");
    let mut content = vec![0u8; NPAGES * page_size];
    content[0] = 0x10;
    content[page_size] = 0x20;
    content[2 * page_size] = 0x30;
    file.write_all(&content).expect("write backing file");
    let fd = file.as_raw_fd();

    let mapping = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            NPAGES * page_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(mapping, libc::MAP_FAILED, "mmap failed");

    let region =
        ooc::memory::register_file_backed_region(mapping as usize, NPAGES * page_size, fd, 0)
            .expect("register region");

    ooc::configure(ooc::Config {
        num_fibers: 1,
        ..Default::default()
    })
    .unwrap();

    for i in 0..NPAGES {
        let page_addr = mapping as usize + i * page_size;
        ooc::schedule(read_first_byte, i, page_addr as *mut std::ffi::c_void).unwrap();
        ooc::wait().unwrap();
    }

    assert_eq!(OBSERVED[0].load(Ordering::SeqCst), 0x10);
    assert_eq!(OBSERVED[1].load(Ordering::SeqCst), 0x20);
    assert_eq!(OBSERVED[2].load(Ordering::SeqCst), 0x30);

    ooc::finalize().unwrap();
    region.unregister().unwrap();
    unsafe {
        libc::munmap(mapping, NPAGES * page_size);
    }
    let _ = std::fs::remove_file(&path);
}
