//! Shared test guard.
//!
//! Every integration test file here installs a process-wide `SIGSEGV`
//! handler and mutates `thread_local!` scheduler state through `ooc`'s
//! lazily-initialized, process-wide-singleton page table and node
//! allocator. `cargo test` runs each test *file* as its own process, but
//! within one file multiple `#[test]` fns still run as threads of the same
//! process by default — so any test that touches the scheduler takes this
//! lock first, the direct analogue of the original's assumption that only
//! one OOC-using thread installs the handler on a given core at a time.
pub static GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
