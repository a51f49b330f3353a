//! Single ring with atomic reservation.
//!
//! Window layout: `tail` (i64) at 0, `ready` (i64) at 8, records from 16.
//! Senders advance `tail` with compare-and-swap, write their record, then
//! add its length to `ready`. The owner locks the ring by swapping `tail`
//! for `i64::MIN`, waits until `ready` covers the locked tail, copies the
//! records out and reopens the ring at zero.

use super::AmqProtocol;
use crate::comm::ReduceOp;
use crate::error::{DartError, DartResult};
use crate::gptr::GlobalPtr;
use crate::Runtime;

const TAIL: u64 = 0;
const READY: u64 = 8;
const DATA: u64 = 16;

#[derive(Debug)]
pub(crate) struct AtomicQueue {
    queue_size: usize,
}

impl AtomicQueue {
    pub(crate) fn new(queue_size: usize) -> AtomicQueue {
        AtomicQueue { queue_size }
    }
}

impl AmqProtocol for AtomicQueue {
    fn window_len(&self) -> usize {
        DATA as usize + self.queue_size
    }

    fn try_put(&self, rt: &Runtime, target: &GlobalPtr, record: &[u8]) -> DartResult<()> {
        let tail_ptr = *target + TAIL;
        let len = record.len() as i64;
        let offset = loop {
            let tail = rt.fetch_and_op::<i64>(&tail_ptr, 0, ReduceOp::NoOp)?;
            if tail < 0 {
                std::thread::yield_now();
                continue;
            }
            if tail + len > self.queue_size as i64 {
                return Err(DartError::Again);
            }
            if rt.compare_and_swap::<i64>(&tail_ptr, tail, tail + len)? == tail {
                break tail as u64;
            }
        };
        rt.put(&(*target + (DATA + offset)), record)?;
        rt.flush(target)?;
        rt.fetch_and_op::<i64>(&(*target + READY), len, ReduceOp::Sum)?;
        Ok(())
    }

    fn drain(&self, rt: &Runtime, own: &GlobalPtr, out: &mut Vec<u8>) -> DartResult<()> {
        let tail_ptr = *own + TAIL;
        let mut tail = rt.fetch_and_op::<i64>(&tail_ptr, 0, ReduceOp::NoOp)?;
        loop {
            if tail <= 0 {
                return Ok(());
            }
            let prev = rt.compare_and_swap::<i64>(&tail_ptr, tail, i64::MIN)?;
            if prev == tail {
                break;
            }
            tail = prev;
        }
        let ready_ptr = *own + READY;
        while rt.fetch_and_op::<i64>(&ready_ptr, 0, ReduceOp::NoOp)? != tail {
            std::thread::yield_now();
        }
        let start = out.len();
        out.resize(start + tail as usize, 0);
        rt.get(&(*own + DATA), &mut out[start..])?;
        rt.fetch_and_op::<i64>(&ready_ptr, 0, ReduceOp::Replace)?;
        rt.compare_and_swap::<i64>(&tail_ptr, i64::MIN, 0)?;
        Ok(())
    }
}
