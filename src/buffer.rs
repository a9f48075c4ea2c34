//! Fixed, page-aligned buffer pool shared by a target's disk I/O and (if
//! E2E) its transport (§4.5).
//!
//! Buffers are leased and returned but never freed during a pass; ownership
//! is exclusive, enforced by handing out raw pointers only through `lease`,
//! which removes the slot from the free list.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

#[cfg(unix)]
pub fn page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE never fails on a POSIX system.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(windows)]
pub fn page_size() -> usize {
    use std::mem::MaybeUninit;
    use windows_sys::Win32::System::SystemInformation::GetSystemInfo;
    unsafe {
        let mut info = MaybeUninit::zeroed();
        GetSystemInfo(info.as_mut_ptr());
        info.assume_init().dwPageSize as usize
    }
}

#[cfg(not(any(unix, windows)))]
pub fn page_size() -> usize {
    4096
}

struct RawBuffer {
    ptr: *mut u8,
    layout: Layout,
    len: usize,
}

// SAFETY: a `RawBuffer` is only ever accessed by the worker or transport that
// currently holds its lease; the pool enforces exclusivity.
unsafe impl Send for RawBuffer {}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }
}

/// Handle to one leased buffer. Holding this handle is the only way to touch
/// the underlying memory; dropping it without calling [`BufferPool::release`]
/// leaks the slot for the remainder of the pass (the pool does not reclaim on
/// drop, matching the "never freed during a pass" invariant).
#[derive(Debug, Clone, Copy)]
pub struct BufferHandle(pub usize);

pub struct BufferPool {
    buffers: Vec<RawBuffer>,
    free: Mutex<VecDeque<usize>>,
    buffer_size: usize,
    reserved: usize,
}

impl BufferPool {
    /// Allocate `buffer_count` buffers of `buffer_size` bytes, each aligned
    /// to at least the page size plus `reserved` bytes of head-room.
    pub fn new(buffer_count: usize, buffer_size: usize) -> io::Result<Self> {
        let reserved = page_size();
        let alignment = page_size();
        let total = buffer_size
            .checked_add(reserved)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "buffer size overflow"))?;
        let layout = Layout::from_size_align(total, alignment)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut buffers = Vec::with_capacity(buffer_count);
        for _ in 0..buffer_count {
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(io::Error::new(io::ErrorKind::OutOfMemory, "buffer allocation failed"));
            }
            buffers.push(RawBuffer {
                ptr,
                layout,
                len: total,
            });
        }

        let free = (0..buffer_count).collect();
        Ok(BufferPool {
            buffers,
            free: Mutex::new(free),
            buffer_size,
            reserved,
        })
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Lease a free buffer, returning `None` if the pool is exhausted.
    pub fn lease(&self) -> Option<BufferHandle> {
        let mut free = self.free.lock().unwrap();
        free.pop_front().map(BufferHandle)
    }

    /// Lease a free buffer, blocking (busy-polling with a short sleep)
    /// until one becomes available. Used on the worker hot path, where a
    /// target's buffer count can be smaller than its worker count by
    /// design (§4.5), so exhaustion is expected, not an error.
    pub fn lease_blocking(&self) -> BufferHandle {
        loop {
            if let Some(handle) = self.lease() {
                return handle;
            }
            std::thread::sleep(std::time::Duration::from_micros(100));
        }
    }

    /// Return a buffer to the free list so another worker or the transport
    /// may lease it.
    pub fn release(&self, handle: BufferHandle) {
        self.free.lock().unwrap().push_back(handle.0);
    }

    /// Raw mutable access to a leased buffer's data region (excludes the
    /// reserved head-room). Caller must hold the lease.
    ///
    /// # Safety
    /// The caller must not alias this slice with another live borrow of the
    /// same handle; the pool itself does not enforce that beyond lease
    /// bookkeeping.
    pub unsafe fn data_mut(&self, handle: BufferHandle) -> &mut [u8] {
        let buf = &self.buffers[handle.0];
        std::slice::from_raw_parts_mut(buf.ptr, self.buffer_size)
    }

    /// Raw immutable access, see [`Self::data_mut`].
    pub unsafe fn data(&self, handle: BufferHandle) -> &[u8] {
        let buf = &self.buffers[handle.0];
        std::slice::from_raw_parts(buf.ptr, self.buffer_size)
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_and_release_roundtrip() {
        let pool = BufferPool::new(4, 4096).unwrap();
        assert_eq!(pool.free_count(), 4);
        let h = pool.lease().unwrap();
        assert_eq!(pool.free_count(), 3);
        pool.release(h);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let pool = BufferPool::new(1, 4096).unwrap();
        let h = pool.lease().unwrap();
        assert!(pool.lease().is_none());
        pool.release(h);
        assert!(pool.lease().is_some());
    }

    #[test]
    fn lease_blocking_waits_for_a_release() {
        let pool = std::sync::Arc::new(BufferPool::new(1, 4096).unwrap());
        let held = pool.lease().unwrap();

        let waiter_pool = std::sync::Arc::clone(&pool);
        let waiter = std::thread::spawn(move || waiter_pool.lease_blocking());

        std::thread::sleep(std::time::Duration::from_millis(20));
        pool.release(held);
        waiter.join().unwrap();
    }

    #[test]
    fn buffers_are_page_aligned() {
        let pool = BufferPool::new(1, 4096).unwrap();
        let h = pool.lease().unwrap();
        let ptr = unsafe { pool.data(h).as_ptr() };
        assert_eq!(ptr as usize % page_size(), 0);
    }
}
