//! Accelerator data path: the injected DMA capability and the per-direction
//! mirror buffer.
//!
//! The accelerator cannot read the shared data buffer directly at payload
//! granularity; it keeps a process-local mirror of the arena and moves bytes
//! between the two with a synchronous DMA primitive. Payloads of at most
//! [`INLINE_PAYLOAD_MAX`](crate::layout::INLINE_PAYLOAD_MAX) bytes skip the
//! DMA and are copied inline with 8-byte strides. The threshold is an
//! observable part of the protocol.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::layout::{Mailbox, TransferQueue, INLINE_PAYLOAD_MAX, URPC_DATA_BUFF_LEN};

/// Synchronous copy between two device-virtual addresses.
///
/// # Safety
///
/// Implementations dereference the addresses handed to `transfer`; an engine
/// must only be paired with buffers whose device-virtual addresses it
/// understands.
pub unsafe trait DmaEngine: Send + Sync {
    /// Copy `len` bytes from `src_dva` to `dst_dva`. Returns 0 on success,
    /// a device-specific status otherwise.
    fn transfer(&self, dst_dva: u64, src_dva: u64, len: usize) -> i32;
}

/// Engine for in-process use: device-virtual addresses are host pointers.
pub struct MemcpyDma;

unsafe impl DmaEngine for MemcpyDma {
    fn transfer(&self, dst_dva: u64, src_dva: u64, len: usize) -> i32 {
        unsafe {
            std::ptr::copy_nonoverlapping(src_dva as *const u8, dst_dva as *mut u8, len);
        }
        0
    }
}

/// Mirror of one direction's data buffer plus the addresses the DMA engine
/// moves bytes between.
pub(crate) struct Mirror {
    buf: Box<[u8]>,
    mirr_dva: u64,
    shm_dva: u64,
    engine: Arc<dyn DmaEngine>,
}

impl Mirror {
    pub(crate) fn new(shm_dva: u64, engine: Arc<dyn DmaEngine>) -> Self {
        let buf = vec![0u8; URPC_DATA_BUFF_LEN].into_boxed_slice();
        let mirr_dva = buf.as_ptr() as u64;
        Mirror {
            buf,
            mirr_dva,
            shm_dva,
            engine,
        }
    }

    /// Writable view of the mirror at a payload interval (send side).
    pub(crate) fn payload_mut(&mut self, offs: u32, len: u32) -> &mut [u8] {
        &mut self.buf[offs as usize..(offs + len) as usize]
    }

    /// Push a packed payload out to the shared data buffer (send side).
    pub(crate) fn flush_out(&self, m: &Mailbox) -> Result<()> {
        let rc = self.engine.transfer(
            self.shm_dva + m.offs() as u64,
            self.mirr_dva + m.offs() as u64,
            m.len() as usize,
        );
        if rc != 0 {
            return Err(Error::Dma(rc));
        }
        Ok(())
    }

    /// Materialise a received payload in the mirror and return a view of it
    /// (recv side). Short payloads are copied inline with 8-byte strides
    /// straight out of the shared buffer; longer ones go through one
    /// synchronous DMA transfer.
    pub(crate) fn fetch(&mut self, tq: &TransferQueue, m: &Mailbox) -> Result<&[u8]> {
        let offs = m.offs() as usize;
        let len = m.len() as usize;
        debug_assert!(offs % 8 == 0);

        if len <= INLINE_PAYLOAD_MAX {
            let words = len.div_ceil(8);
            let src = tq.data_ptr() as *const u64;
            let dst = self.buf.as_mut_ptr() as *mut u64;
            let woffs = offs / 8;
            for i in 0..words {
                unsafe {
                    let v = std::ptr::read_volatile(src.add(woffs + i));
                    dst.add(woffs + i).write(v);
                }
            }
        } else {
            let rc = self.engine.transfer(
                self.mirr_dva + offs as u64,
                self.shm_dva + offs as u64,
                len,
            );
            if rc != 0 {
                return Err(Error::Dma(rc));
            }
        }
        Ok(&self.buf[offs..offs + len])
    }
}
