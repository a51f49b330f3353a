//! One-sided communication on global pointers.
//!
//! Non-blocking operations are queued per `(window, target unit)` and
//! applied when their target is flushed, when their handle is waited on or
//! tested, or when the handle is dropped. Blocking operations are complete
//! on return.

pub(crate) mod atomic;
pub(crate) mod handle;

pub use atomic::{DartAtomic, ReduceOp};
pub use handle::Handle;

use crate::error::{invalid, DartResult};
use crate::gptr::GlobalPtr;
use crate::segment::{Resolved, WindowId};
use crate::transport::{Transport, TransportRdma};
use crate::Runtime;
use handle::{OpSlot, PendingFn};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Plain data that may be moved as raw bytes by the typed helpers.
///
/// # Safety
/// Every bit pattern of the right size must be a valid value of the type.
pub unsafe trait Plain: Copy + Send + Sync + 'static {}

macro_rules! impl_plain {
    ($($t:ty),*) => { $(unsafe impl Plain for $t {})* };
}
impl_plain!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);
unsafe impl<T: Plain, const N: usize> Plain for [T; N] {}

fn as_bytes<T: Plain>(vals: &[T]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(vals.as_ptr() as *const u8, std::mem::size_of_val(vals)) }
}

fn as_bytes_mut<T: Plain>(vals: &mut [T]) -> &mut [u8] {
    unsafe {
        std::slice::from_raw_parts_mut(vals.as_mut_ptr() as *mut u8, std::mem::size_of_val(vals))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Target {
    window: WindowId,
    unit: usize,
}

impl From<&Resolved> for Target {
    fn from(res: &Resolved) -> Target {
        Target {
            window: res.window,
            unit: res.owner,
        }
    }
}

pub(crate) struct CommEngine {
    transport: Arc<Transport>,
    sharedmem: bool,
    pending: Mutex<HashMap<Target, Vec<Arc<OpSlot>>>>,
    bytes_put: AtomicUsize,
    bytes_got: AtomicUsize,
}

impl std::fmt::Debug for CommEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CommEngine")
            .field("sharedmem", &self.sharedmem)
            .field("pending_targets", &self.pending.lock().len())
            .finish()
    }
}

impl CommEngine {
    pub(crate) fn new(transport: Arc<Transport>, sharedmem: bool) -> CommEngine {
        CommEngine {
            transport,
            sharedmem,
            pending: Mutex::new(HashMap::new()),
            bytes_put: AtomicUsize::new(0),
            bytes_got: AtomicUsize::new(0),
        }
    }

    fn enqueue(&self, target: Target, op: PendingFn) -> Arc<OpSlot> {
        let slot = OpSlot::new(op);
        let mut pending = self.pending.lock();
        let ops = pending.entry(target).or_default();
        // slots completed through their handles are dropped before the queue grows
        if ops.len() == ops.capacity() {
            ops.retain(|op| !op.is_complete());
        }
        ops.push(slot.clone());
        slot
    }

    /// Forget `slot` once its handle completed it.
    fn retire(&self, slot: &Arc<OpSlot>) {
        let mut pending = self.pending.lock();
        pending.retain(|_, ops| {
            if let Some(idx) = ops.iter().position(|op| Arc::ptr_eq(op, slot)) {
                ops.swap_remove(idx);
            }
            !ops.is_empty()
        });
    }

    fn put_op(&self, res: &Resolved, data: Vec<u8>) -> PendingFn {
        let transport = self.transport.clone();
        let (unit, addr) = (res.owner, res.addr());
        Box::new(move || transport.put(unit, &data, addr))
    }

    pub(crate) fn flush_target(&self, target: &Target) {
        let ops = self.pending.lock().remove(target);
        if let Some(ops) = ops {
            tracing::trace!("flushing {} ops to {:?}", ops.len(), target);
            for op in ops {
                op.complete();
            }
        }
    }

    pub(crate) fn flush_all(&self) {
        let all = std::mem::take(&mut *self.pending.lock());
        for (_, ops) in all {
            for op in ops {
                op.complete();
            }
        }
    }

    pub(crate) fn num_pending(&self) -> usize {
        self.pending
            .lock()
            .values()
            .flat_map(|ops| ops.iter())
            .filter(|op| !op.is_complete())
            .count()
    }
}

impl Runtime {
    /// Copy `src` to `gptr`; remote-complete on return.
    pub fn put(&self, gptr: &GlobalPtr, src: &[u8]) -> DartResult<()> {
        let res = self.resolve_range(gptr, src.len())?;
        self.comm.bytes_put.fetch_add(src.len(), Ordering::Relaxed);
        if self.comm.sharedmem {
            self.transport.put(res.owner, src, res.addr());
        } else {
            let slot = self
                .comm
                .enqueue(Target::from(&res), self.comm.put_op(&res, src.to_vec()));
            self.comm.flush_target(&Target::from(&res));
            debug_assert!(slot.is_complete());
        }
        Ok(())
    }

    /// Copy from `gptr` into `dst`; complete on return.
    pub fn get(&self, gptr: &GlobalPtr, dst: &mut [u8]) -> DartResult<()> {
        if self.comm.sharedmem {
            let res = self.resolve_range(gptr, dst.len())?;
            self.comm.bytes_got.fetch_add(dst.len(), Ordering::Relaxed);
            self.transport.get(res.owner, res.addr(), dst);
        } else {
            let mut handle = self.get_nb(gptr, dst)?;
            handle.finish();
        }
        Ok(())
    }

    /// Start a put; `src` is copied, so it may be reused immediately.
    pub fn put_nb(&self, gptr: &GlobalPtr, src: &[u8]) -> DartResult<Handle<'static>> {
        let res = self.resolve_range(gptr, src.len())?;
        self.comm.bytes_put.fetch_add(src.len(), Ordering::Relaxed);
        let op = self.comm.put_op(&res, src.to_vec());
        Ok(Handle::new(self.comm.enqueue(Target::from(&res), op)))
    }

    /// Start a get into `dst`, which stays borrowed until the handle completes.
    pub fn get_nb<'a>(&self, gptr: &GlobalPtr, dst: &'a mut [u8]) -> DartResult<Handle<'a>> {
        let res = self.resolve_range(gptr, dst.len())?;
        self.comm.bytes_got.fetch_add(dst.len(), Ordering::Relaxed);
        let staging = Arc::new(Mutex::new(vec![0u8; dst.len()]));
        let op: PendingFn = {
            let transport = self.comm.transport.clone();
            let staging = staging.clone();
            let (unit, addr) = (res.owner, res.addr());
            Box::new(move || transport.get(unit, addr, &mut staging.lock()))
        };
        let slot = self.comm.enqueue(Target::from(&res), op);
        Ok(Handle::with_dest(slot, dst, staging))
    }

    fn resolve_atomic<T: DartAtomic>(&self, gptr: &GlobalPtr, count: usize) -> DartResult<Resolved> {
        let res = self.resolve_range(gptr, count * std::mem::size_of::<T>())?;
        if !atomic::is_aligned::<T>(res.addr()) {
            return invalid(format!(
                "{} is not aligned for {}",
                gptr,
                std::any::type_name::<T>()
            ));
        }
        Ok(res)
    }

    /// Element-wise atomic reduction of `src` into the values at `gptr`.
    pub fn accumulate<T: DartAtomic>(
        &self,
        gptr: &GlobalPtr,
        src: &[T],
        op: ReduceOp,
    ) -> DartResult<Handle<'static>> {
        let res = self.resolve_atomic::<T>(gptr, src.len())?;
        let vals = src.to_vec();
        let addr = res.addr();
        let pending: PendingFn = Box::new(move || {
            for (i, val) in vals.into_iter().enumerate() {
                unsafe { T::fetch_op(addr + i * std::mem::size_of::<T>(), val, op) };
            }
        });
        Ok(Handle::new(self.comm.enqueue(Target::from(&res), pending)))
    }

    /// Apply `op` with `val` at `gptr`, returning the previous value.
    pub fn fetch_and_op<T: DartAtomic>(&self, gptr: &GlobalPtr, val: T, op: ReduceOp) -> DartResult<T> {
        let res = self.resolve_atomic::<T>(gptr, 1)?;
        Ok(unsafe { T::fetch_op(res.addr(), val, op) })
    }

    /// Atomically replace `expected` by `new` at `gptr`, returning the previous value.
    pub fn compare_and_swap<T: DartAtomic>(&self, gptr: &GlobalPtr, expected: T, new: T) -> DartResult<T> {
        let res = self.resolve_atomic::<T>(gptr, 1)?;
        Ok(unsafe { T::compare_swap(res.addr(), expected, new) })
    }

    /// Complete every outstanding operation on the window and unit of `gptr`.
    pub fn flush(&self, gptr: &GlobalPtr) -> DartResult<()> {
        let res = self.segment_resolve(gptr)?;
        self.comm.flush_target(&Target::from(&res));
        Ok(())
    }

    /// Make the origin buffers of operations targeting `gptr` reusable.
    ///
    /// Origin data is copied when an operation is issued, so this completes
    /// the same set of operations as [Runtime::flush].
    pub fn flush_local(&self, gptr: &GlobalPtr) -> DartResult<()> {
        self.flush(gptr)
    }

    /// Complete every outstanding operation of this unit.
    pub fn flush_all(&self) {
        self.comm.flush_all();
    }

    pub fn wait(&self, mut handle: Handle<'_>) -> DartResult<()> {
        if handle.is_consumed() {
            return invalid("stale handle");
        }
        handle.finish();
        self.comm.retire(handle.slot());
        Ok(())
    }

    /// Completes the operation and consumes the handle, always returning true.
    ///
    /// Queued transfers are not progressed in the background, so testing an
    /// outstanding handle performs its transfer synchronously. This makes
    /// `test` equivalent to [Runtime::wait] on a borrowed handle.
    pub fn test(&self, handle: &mut Handle<'_>) -> DartResult<bool> {
        if handle.is_consumed() {
            return invalid("stale handle");
        }
        handle.finish();
        self.comm.retire(handle.slot());
        Ok(true)
    }

    pub fn wait_all(&self, handles: Vec<Handle<'_>>) -> DartResult<()> {
        let mut result = Ok(());
        for handle in handles {
            if let Err(e) = self.wait(handle) {
                result = Err(e);
            }
        }
        result
    }

    /// Returns true when every handle has completed; consumed handles count as complete.
    pub fn test_all(&self, handles: &mut [Handle<'_>]) -> DartResult<bool> {
        let mut done = true;
        for handle in handles.iter_mut().filter(|h| !h.is_consumed()) {
            done &= self.test(handle)?;
        }
        Ok(done)
    }

    pub fn put_value<T: Plain>(&self, gptr: &GlobalPtr, val: T) -> DartResult<()> {
        self.put(gptr, as_bytes(std::slice::from_ref(&val)))
    }

    pub fn get_value<T: Plain>(&self, gptr: &GlobalPtr) -> DartResult<T> {
        let mut val = MaybeUninit::<T>::zeroed();
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(val.as_mut_ptr() as *mut u8, std::mem::size_of::<T>())
        };
        self.get(gptr, bytes)?;
        Ok(unsafe { val.assume_init() })
    }

    pub fn put_slice<T: Plain>(&self, gptr: &GlobalPtr, src: &[T]) -> DartResult<()> {
        self.put(gptr, as_bytes(src))
    }

    pub fn get_slice<T: Plain>(&self, gptr: &GlobalPtr, dst: &mut [T]) -> DartResult<()> {
        self.get(gptr, as_bytes_mut(dst))
    }

    /// Advisory minimum transfer size for bulk operations.
    pub fn bulk_min_size_bytes(&self) -> usize {
        self.config.bulk_min_size_bytes
    }

    /// Bytes moved by `(put, get)` operations issued by this unit.
    pub fn bytes_transferred(&self) -> (usize, usize) {
        (
            self.comm.bytes_put.load(Ordering::Relaxed),
            self.comm.bytes_got.load(Ordering::Relaxed),
        )
    }

    /// Number of queued non-blocking operations.
    pub fn pending_ops(&self) -> usize {
        self.comm.num_pending()
    }
}
