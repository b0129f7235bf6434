//! Asynchronous I/O façade.
//!
//! Grounded on `aio.c`'s split between a `WITH_NATIVE_AIO` (kernel
//! io_setup/io_submit) path and the default path built on POSIX `<aio.h>`.
//! The original picks between the two at compile time via a preprocessor
//! guard; here the choice is a trait (`AsyncIo`) with one real
//! implementation, [`posix::PosixAio`], which is the variant the original
//! actually compiles by default and the only one this crate ships tests
//! for. Adding a native io_uring backend later is a matter of implementing
//! the trait again, not touching the scheduler.

pub mod posix;

/// An in-flight asynchronous read, opaque to the scheduler beyond polling
/// it for completion.
pub trait AioRequest {
    /// `Ok(())` once complete and successful. `Err` once complete and
    /// failed. Must return `None`-like "still pending" via
    /// [`AsyncIo::poll`] instead of this method.
    fn result(&self) -> std::io::Result<usize>;
}

/// Backend abstraction over a kernel asynchronous I/O facility.
///
/// Mirrors `ooc_aio_setup`/`ooc_aio_destroy`/`ooc_aio_read`/`ooc_aio_write`/
/// `ooc_aio_error`/`ooc_aio_return`/`ooc_aio_cancel`/`ooc_aio_suspend`
/// one-for-one; the original's int-typed returns here become typed
/// results and a real request handle.
pub trait AsyncIo {
    type Request: AioRequest;

    /// Submits an asynchronous read of `count` bytes from `fd` at file
    /// offset `off` into `buf`. `buf` must stay valid and must not move
    /// until the request completes.
    ///
    /// # Safety
    /// `buf` must remain valid for `count` bytes for the lifetime of the
    /// returned request.
    unsafe fn read(
        &self,
        fd: i32,
        buf: *mut u8,
        count: usize,
        off: i64,
    ) -> crate::error::Result<Self::Request>;

    /// Submits an asynchronous write of `count` bytes from `buf` to `fd` at
    /// file offset `off`. `buf` must stay valid and must not move until the
    /// request completes. Mirrors `ooc_aio_write`; unused by the fault path
    /// shipped here (spec §9's "write-side async-I/O flush... is stubbed"),
    /// but part of the façade's contract (spec §4.3) for a caller that wants
    /// to page dirty data back out itself.
    ///
    /// # Safety
    /// `buf` must remain valid for `count` bytes for the lifetime of the
    /// returned request.
    unsafe fn write(
        &self,
        fd: i32,
        buf: *const u8,
        count: usize,
        off: i64,
    ) -> crate::error::Result<Self::Request>;

    /// `Ok(true)` if the request has completed (successfully or not),
    /// `Ok(false)` if still in flight. Mirrors `ooc_aio_error` returning
    /// `EINPROGRESS`.
    fn poll(&self, req: &Self::Request) -> crate::error::Result<bool>;

    /// Best-effort cancellation of an outstanding request. Mirrors
    /// `ooc_aio_cancel`; a request that has already completed or is already
    /// being delivered is not guaranteed to be cancelled.
    fn cancel(&self, req: &Self::Request) -> crate::error::Result<()>;

    /// Blocks until at least one of `reqs` completes, or until `timeout`
    /// elapses if given. Mirrors `ooc_aio_suspend`.
    fn suspend(
        &self,
        reqs: &[&Self::Request],
        timeout: Option<std::time::Duration>,
    ) -> crate::error::Result<()>;
}
