//! POSIX `<aio.h>`-backed implementation of [`AsyncIo`].
//!
//! Direct translation of `aio.c`'s non-`WITH_NATIVE_AIO` branch: `aio_read`
//! submits, `aio_error`/`aio_return` poll and collect, `aio_suspend` blocks
//! a fiber-scheduling thread until something completes. `aio_reqprio` is
//! left at its default of zero, same as the original, so the I/O thread
//! does not steal CPU priority from compute threads.

use std::io;
use std::mem::MaybeUninit;
use std::time::Duration;

use log::trace;

use crate::aio::{AioRequest, AsyncIo};
use crate::error::{OocError, Result};

pub struct PosixAio;

impl PosixAio {
    pub fn new() -> Self {
        PosixAio
    }
}

impl Default for PosixAio {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PosixRequest {
    cb: Box<libc::aiocb>,
}

/// Builds a zeroed `aiocb` with the fields common to both `aio_read` and
/// `aio_write` filled in; `aio_reqprio` is left at its default of zero, as
/// in the original, so the I/O thread does not steal CPU priority from
/// compute threads.
fn new_cb(fd: i32, buf: *mut u8, count: usize, off: i64) -> Box<libc::aiocb> {
    let mut cb: Box<libc::aiocb> = Box::new(unsafe { MaybeUninit::zeroed().assume_init() });
    cb.aio_fildes = fd;
    cb.aio_offset = off as libc::off_t;
    cb.aio_buf = buf as *mut libc::c_void;
    cb.aio_nbytes = count;
    cb.aio_reqprio = 0;
    cb.aio_sigevent.sigev_notify = libc::SIGEV_NONE;
    cb
}

impl AioRequest for PosixRequest {
    fn result(&self) -> io::Result<usize> {
        let ret = unsafe { libc::aio_return(self.cb.as_ref() as *const _ as *mut _) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }
}

impl AsyncIo for PosixAio {
    type Request = PosixRequest;

    unsafe fn read(
        &self,
        fd: i32,
        buf: *mut u8,
        count: usize,
        off: i64,
    ) -> Result<PosixRequest> {
        let mut cb = new_cb(fd, buf, count, off);
        let ret = libc::aio_read(cb.as_mut() as *mut libc::aiocb);
        if ret != 0 {
            return Err(OocError::AioSubmitFailed(errno::errno()));
        }
        trace!("aio_read submitted: fd={fd} off={off} count={count}");
        Ok(PosixRequest { cb })
    }

    unsafe fn write(
        &self,
        fd: i32,
        buf: *const u8,
        count: usize,
        off: i64,
    ) -> Result<PosixRequest> {
        let mut cb = new_cb(fd, buf as *mut u8, count, off);
        let ret = libc::aio_write(cb.as_mut() as *mut libc::aiocb);
        if ret != 0 {
            return Err(OocError::AioSubmitFailed(errno::errno()));
        }
        trace!("aio_write submitted: fd={fd} off={off} count={count}");
        Ok(PosixRequest { cb })
    }

    fn poll(&self, req: &PosixRequest) -> Result<bool> {
        let code = unsafe { libc::aio_error(req.cb.as_ref() as *const libc::aiocb) };
        match code {
            0 => Ok(true),
            libc::EINPROGRESS => Ok(false),
            _ => Ok(true),
        }
    }

    fn cancel(&self, req: &PosixRequest) -> Result<()> {
        let ret = unsafe {
            libc::aio_cancel(req.cb.aio_fildes, req.cb.as_ref() as *const _ as *mut libc::aiocb)
        };
        match ret {
            libc::AIO_CANCELED | libc::AIO_ALLDONE => Ok(()),
            libc::AIO_NOTCANCELED => {
                trace!("aio_cancel: request already in progress, not cancelled");
                Ok(())
            }
            _ => Err(OocError::AioSubmitFailed(errno::errno())),
        }
    }

    fn suspend(&self, reqs: &[&PosixRequest], timeout: Option<Duration>) -> Result<()> {
        let ptrs: Vec<*const libc::aiocb> =
            reqs.iter().map(|r| r.cb.as_ref() as *const _).collect();
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as i64,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);

        let ret = unsafe { libc::aio_suspend(ptrs.as_ptr(), ptrs.len() as libc::c_int, ts_ptr) };
        if ret != 0 {
            return Err(OocError::AioSubmitFailed(errno::errno()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_small_file() {
        let mut tmp = tempfile_like();
        tmp.write_all(b"hello out-of-core").unwrap();

        let backend = PosixAio::new();
        let mut buf = [0u8; 5];
        let req = unsafe {
            backend
                .read(
                    fd_of(&tmp),
                    buf.as_mut_ptr(),
                    buf.len(),
                    0,
                )
                .expect("submit")
        };

        loop {
            if backend.poll(&req).unwrap() {
                break;
            }
            backend.suspend(&[&req], None).unwrap();
        }
        let n = req.result().unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    fn tempfile_like() -> std::fs::File {
        let path = std::env::temp_dir().join(format!("ooc-aio-test-{}", std::process::id()));
        std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)
            .unwrap()
    }

    fn fd_of(f: &std::fs::File) -> i32 {
        use std::os::unix::io::AsRawFd;
        f.as_raw_fd()
    }
}
