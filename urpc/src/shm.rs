//! System V shared-memory segment wrapper.
//!
//! The transport uses System V segments rather than `shm_open` files
//! because the segment id is what travels to the child process through the
//! environment, and `shm_nattch` drives the attach rendezvous. A segment
//! marked removed is reaped by the OS once both sides detach, including on
//! abnormal exit.

use std::io;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};

use crate::error::{Error, Result};

/// A mapped System V shared-memory segment.
pub struct SharedSegment {
    segid: i32,
    base: NonNull<u8>,
    size: usize,
    owner: bool,
}

unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create and attach a new segment of `size` bytes under `key`.
    ///
    /// The creating process becomes the owner; the segment is removed on
    /// drop unless [`mark_removed`](Self::mark_removed) already ran.
    pub fn create(key: i32, size: usize) -> Result<Self> {
        let segid = unsafe { libc::shmget(key, size, libc::IPC_CREAT | libc::IPC_EXCL | 0o600) };
        if segid < 0 {
            return Err(Error::last_os());
        }
        let base = match attach_id(segid) {
            Ok(b) => b,
            Err(e) => {
                unsafe { libc::shmctl(segid, libc::IPC_RMID, ptr::null_mut()) };
                return Err(e);
            }
        };
        Ok(SharedSegment {
            segid,
            base,
            size,
            owner: true,
        })
    }

    /// Attach an existing segment by id. The size comes from the segment
    /// itself and must be at least `min_size`.
    pub fn attach(segid: i32, min_size: usize) -> Result<Self> {
        let stat = stat_id(segid)?;
        let size = stat.shm_segsz as usize;
        if size < min_size {
            return Err(Error::SegmentSize {
                have: size,
                need: min_size,
            });
        }
        let base = attach_id(segid)?;
        Ok(SharedSegment {
            segid,
            base,
            size,
            owner: false,
        })
    }

    pub fn segid(&self) -> i32 {
        self.segid
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Current number of attached processes.
    pub fn nattch(&self) -> Result<u64> {
        Ok(stat_id(self.segid)?.shm_nattch as u64)
    }

    /// Mark the segment destroyed so the OS frees it when the last process
    /// detaches. Attached mappings stay valid.
    pub fn mark_removed(&mut self) -> Result<()> {
        if !self.owner {
            return Ok(());
        }
        let rc = unsafe { libc::shmctl(self.segid, libc::IPC_RMID, ptr::null_mut()) };
        if rc < 0 {
            return Err(Error::last_os());
        }
        self.owner = false;
        Ok(())
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.base.as_ptr() as *const libc::c_void);
        }
        if self.owner {
            unsafe { libc::shmctl(self.segid, libc::IPC_RMID, ptr::null_mut()) };
        }
    }
}

fn attach_id(segid: i32) -> Result<NonNull<u8>> {
    let addr = unsafe { libc::shmat(segid, ptr::null(), 0) };
    if addr as isize == -1 {
        return Err(Error::last_os());
    }
    NonNull::new(addr as *mut u8).ok_or_else(|| Error::Os(io::Error::other("shmat returned null")))
}

fn stat_id(segid: i32) -> Result<libc::shmid_ds> {
    let mut ds = MaybeUninit::<libc::shmid_ds>::zeroed();
    let rc = unsafe { libc::shmctl(segid, libc::IPC_STAT, ds.as_mut_ptr()) };
    if rc < 0 {
        return Err(Error::last_os());
    }
    Ok(unsafe { ds.assume_init() })
}
