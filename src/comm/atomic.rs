use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Reduction applied by accumulate and fetch-and-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
    BitAnd,
    BitOr,
    BitXor,
    /// store the operand, returning the previous value
    Replace,
    /// leave the target untouched, returning its value
    NoOp,
}

/// Element types supported by the remote atomics.
///
/// # Safety
/// Implementors must be plain integers with a lock-free atomic counterpart
/// of identical size and alignment.
pub unsafe trait DartAtomic:
    Copy + Send + Sync + PartialEq + std::fmt::Debug + 'static
{
    #[doc(hidden)]
    /// # Safety
    /// `addr` must be valid and aligned for `Self`.
    unsafe fn fetch_op(addr: usize, val: Self, op: ReduceOp) -> Self;
    #[doc(hidden)]
    /// # Safety
    /// `addr` must be valid and aligned for `Self`.
    unsafe fn compare_swap(addr: usize, current: Self, new: Self) -> Self;
}

macro_rules! impl_dart_atomic {
    ($t:ty, $a:ty) => {
        unsafe impl DartAtomic for $t {
            unsafe fn fetch_op(addr: usize, val: $t, op: ReduceOp) -> $t {
                let atomic = &*(addr as *const $a);
                match op {
                    ReduceOp::Sum => atomic.fetch_add(val, Ordering::SeqCst),
                    ReduceOp::Prod => atomic
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                            Some(v.wrapping_mul(val))
                        })
                        .unwrap_or_else(|v| v),
                    ReduceOp::Min => atomic.fetch_min(val, Ordering::SeqCst),
                    ReduceOp::Max => atomic.fetch_max(val, Ordering::SeqCst),
                    ReduceOp::BitAnd => atomic.fetch_and(val, Ordering::SeqCst),
                    ReduceOp::BitOr => atomic.fetch_or(val, Ordering::SeqCst),
                    ReduceOp::BitXor => atomic.fetch_xor(val, Ordering::SeqCst),
                    ReduceOp::Replace => atomic.swap(val, Ordering::SeqCst),
                    ReduceOp::NoOp => atomic.load(Ordering::SeqCst),
                }
            }

            unsafe fn compare_swap(addr: usize, current: $t, new: $t) -> $t {
                let atomic = &*(addr as *const $a);
                match atomic.compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(v) => v,
                    Err(v) => v,
                }
            }
        }
    };
}

impl_dart_atomic!(i32, AtomicI32);
impl_dart_atomic!(i64, AtomicI64);
impl_dart_atomic!(u32, AtomicU32);
impl_dart_atomic!(u64, AtomicU64);

pub(crate) fn is_aligned<T>(addr: usize) -> bool {
    addr % std::mem::align_of::<T>() == 0
}
