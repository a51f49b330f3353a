//! Double-buffered rings.
//!
//! Window layout, all offsets in bytes:
//!
//! ```text
//! 0                   current queue index (i32), padded to 8
//! 8 + k*(8 + Q)       writers of queue k (i32)
//! 12 + k*(8 + Q)      tail of queue k (i32)
//! 16 + k*(8 + Q)      Q bytes of records
//! ```
//!
//! Senders register in `writers` of the current queue before claiming space.
//! The owner swaps the current queue, closes the old one by moving its
//! writer count from 0 to `i32::MIN`, then copies out and resets it. A
//! negative writer count tells a sender to back off and retry.

use super::AmqProtocol;
use crate::comm::ReduceOp;
use crate::error::{DartError, DartResult};
use crate::gptr::GlobalPtr;
use crate::Runtime;

const CURRENT: u64 = 0;
const QUEUES: u64 = 8;
const QUEUE_HEADER: u64 = 8;

#[derive(Debug)]
pub(crate) struct NoLockQueue {
    queue_size: usize,
}

impl NoLockQueue {
    pub(crate) fn new(queue_size: usize) -> NoLockQueue {
        NoLockQueue { queue_size }
    }

    fn base(&self, k: i32) -> u64 {
        QUEUES + k as u64 * (QUEUE_HEADER + self.queue_size as u64)
    }

    fn writers(&self, win: &GlobalPtr, k: i32) -> GlobalPtr {
        *win + self.base(k)
    }

    fn tail(&self, win: &GlobalPtr, k: i32) -> GlobalPtr {
        *win + (self.base(k) + 4)
    }

    fn data(&self, win: &GlobalPtr, k: i32) -> GlobalPtr {
        *win + (self.base(k) + QUEUE_HEADER)
    }

    /// Enter the current queue of `target` as a writer, returning its index.
    fn enter(&self, rt: &Runtime, target: &GlobalPtr) -> DartResult<i32> {
        loop {
            let k = rt.fetch_and_op::<i32>(&(*target + CURRENT), 0, ReduceOp::NoOp)?;
            let writers = self.writers(target, k);
            let prev = rt.fetch_and_op::<i32>(&writers, 1, ReduceOp::Sum)?;
            if prev.wrapping_add(1) >= 0 {
                return Ok(k);
            }
            // being processed
            rt.fetch_and_op::<i32>(&writers, -1, ReduceOp::Sum)?;
            std::thread::yield_now();
        }
    }

    fn leave(&self, rt: &Runtime, target: &GlobalPtr, k: i32) -> DartResult<()> {
        rt.fetch_and_op::<i32>(&self.writers(target, k), -1, ReduceOp::Sum)?;
        Ok(())
    }

    fn drain_queue(&self, rt: &Runtime, own: &GlobalPtr, k: i32, out: &mut Vec<u8>) -> DartResult<()> {
        let writers = self.writers(own, k);
        while rt.compare_and_swap::<i32>(&writers, 0, i32::MIN)? != 0 {
            std::thread::yield_now();
        }
        let tail_ptr = self.tail(own, k);
        let tail = rt.fetch_and_op::<i32>(&tail_ptr, 0, ReduceOp::NoOp)? as usize;
        if tail > 0 {
            let start = out.len();
            out.resize(start + tail, 0);
            rt.get(&self.data(own, k), &mut out[start..])?;
            rt.fetch_and_op::<i32>(&tail_ptr, 0, ReduceOp::Replace)?;
        }
        // keeps the increments of senders that are backing off
        rt.fetch_and_op::<i32>(&writers, i32::MIN, ReduceOp::Sum)?;
        Ok(())
    }
}

impl AmqProtocol for NoLockQueue {
    fn window_len(&self) -> usize {
        (QUEUES as usize) + 2 * (QUEUE_HEADER as usize + self.queue_size)
    }

    fn try_put(&self, rt: &Runtime, target: &GlobalPtr, record: &[u8]) -> DartResult<()> {
        let k = self.enter(rt, target)?;
        let tail_ptr = self.tail(target, k);
        let offset = loop {
            let tail = rt.fetch_and_op::<i32>(&tail_ptr, 0, ReduceOp::NoOp)?;
            if tail as usize + record.len() > self.queue_size {
                self.leave(rt, target, k)?;
                return Err(DartError::Again);
            }
            let new_tail = tail + record.len() as i32;
            if rt.compare_and_swap::<i32>(&tail_ptr, tail, new_tail)? == tail {
                break tail as u64;
            }
        };
        rt.put(&(self.data(target, k) + offset), record)?;
        rt.flush(target)?;
        self.leave(rt, target, k)
    }

    fn drain(&self, rt: &Runtime, own: &GlobalPtr, out: &mut Vec<u8>) -> DartResult<()> {
        let current = rt.fetch_and_op::<i32>(&(*own + CURRENT), 0, ReduceOp::NoOp)?;
        let other = 1 - current;
        // records left in the old queue by senders that entered before the last swap
        if rt.fetch_and_op::<i32>(&self.tail(own, other), 0, ReduceOp::NoOp)? > 0 {
            self.drain_queue(rt, own, other, out)?;
        }
        if rt.fetch_and_op::<i32>(&self.tail(own, current), 0, ReduceOp::NoOp)? > 0 {
            rt.fetch_and_op::<i32>(&(*own + CURRENT), other, ReduceOp::Replace)?;
            self.drain_queue(rt, own, current, out)?;
        }
        Ok(())
    }
}
