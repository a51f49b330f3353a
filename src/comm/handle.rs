use crate::warnings::RuntimeWarning;

use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) type PendingFn = Box<dyn FnOnce() + Send>;

/// One queued one-sided operation; completing it runs the transfer at most once.
pub(crate) struct OpSlot {
    op: Mutex<Option<PendingFn>>,
}

impl OpSlot {
    pub(crate) fn new(op: PendingFn) -> Arc<OpSlot> {
        Arc::new(OpSlot {
            op: Mutex::new(Some(op)),
        })
    }

    pub(crate) fn complete(&self) {
        let mut op = self.op.lock();
        if let Some(f) = op.take() {
            f();
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.op.lock().is_none()
    }
}

/// Tracks one outstanding non-blocking operation.
///
/// A handle is consumed by [Runtime::wait][crate::Runtime::wait] or by a
/// successful [Runtime::test][crate::Runtime::test]; passing a consumed
/// handle again is an invalid argument. Dropping an outstanding handle
/// completes its operation first.
#[must_use = "communication handles should be waited on or tested to completion"]
pub struct Handle<'a> {
    slot: Arc<OpSlot>,
    dest: Option<(&'a mut [u8], Arc<Mutex<Vec<u8>>>)>,
    consumed: bool,
}

impl<'a> std::fmt::Debug for Handle<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("complete", &self.slot.is_complete())
            .field("consumed", &self.consumed)
            .finish()
    }
}

impl<'a> Handle<'a> {
    pub(crate) fn new(slot: Arc<OpSlot>) -> Handle<'a> {
        Handle {
            slot,
            dest: None,
            consumed: false,
        }
    }

    /// A get whose data lands in `staging` and is copied to `dest` on completion.
    pub(crate) fn with_dest(
        slot: Arc<OpSlot>,
        dest: &'a mut [u8],
        staging: Arc<Mutex<Vec<u8>>>,
    ) -> Handle<'a> {
        Handle {
            slot,
            dest: Some((dest, staging)),
            consumed: false,
        }
    }

    pub(crate) fn slot(&self) -> &Arc<OpSlot> {
        &self.slot
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    pub(crate) fn finish(&mut self) {
        self.slot.complete();
        if let Some((dest, staging)) = self.dest.take() {
            dest.copy_from_slice(&staging.lock());
        }
        self.consumed = true;
    }
}

impl<'a> Drop for Handle<'a> {
    fn drop(&mut self) {
        if !self.consumed {
            self.finish();
            RuntimeWarning::DroppedHandle("a communication handle").print();
        }
    }
}
