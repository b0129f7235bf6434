//! Out-of-core execution: a fiber scheduler that overlaps CPU work with
//! page-fault-driven asynchronous I/O.
//!
//! A caller registers memory regions with [`memory::register_region`] or
//! [`memory::register_file_backed_region`], `mprotect`s them to
//! `PROT_NONE`, and then drives work through [`schedule`]: each call either
//! hands an idle fiber a unit of work or lets other fibers make progress
//! while a previous one is blocked on a page fault. [`wait`] drains
//! whatever is still outstanding; [`finalize`] restores the process's
//! original `SIGSEGV` handler.
//!
//! Grounded on the `ooc` C library (`sched.c`, `aio.c`, `sp_tree.c`,
//! `node_alloc.c`): see `DESIGN.md` for the module-by-module mapping and
//! every resolved ambiguity.

pub mod aio;
pub mod config;
pub mod error;
pub mod memory;
mod process;

pub use config::Config;
pub use error::{OocError, Result};
pub use process::{configure, finalize, schedule, wait, KernelFn};
