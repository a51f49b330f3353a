//! The RMA substrate underneath the communication engine.
//!
//! A transport owns the registered memory of one unit, translates the
//! addresses other units publish into this process, performs one-sided
//! copies and provides the handful of collectives the runtime needs during
//! setup (allgather and a dynamic window registry for attached segments).

use crate::error::{DartError, DartResult};
use crate::gptr::{SegmentId, TeamId};

use enum_dispatch::enum_dispatch;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) mod local;
pub(crate) mod shmem;

pub(crate) use local::LocalTransport;
pub(crate) use shmem::{ShmemJob, ShmemTransport};

/// Alignment of every registered slab.
pub(crate) const SLAB_ALIGN: usize = 64;

/// The list of available transports, used to specify how data is moved between units
#[derive(
    serde::Serialize, serde::Deserialize, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy,
)]
pub enum Backend {
    /// A single unit, every collective is trivial
    Local,
    /// Units on one node sharing memory through named shared-memory objects,
    /// hosted by separate processes or by threads of one process
    Shmem,
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Local
    }
}

/// Identifies one instance of a collective.
///
/// `leader` is the global id of the team's first member, which keeps teams
/// that share an id (the results of one split) apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CollKey {
    pub(crate) team: TeamId,
    pub(crate) leader: usize,
    pub(crate) seq: u64,
}

impl CollKey {
    /// Non-zero fingerprint shared by every participant of the collective.
    pub(crate) fn tag(&self) -> u64 {
        let packed = (self.team.0 as u64) << 48
            | (self.leader as u64 & 0xffff) << 32
            | (self.seq & 0xffff_ffff);
        packed.wrapping_add(1).max(1)
    }
}

#[enum_dispatch]
pub(crate) trait TransportInfo {
    fn my_unit(&self) -> usize;
    fn num_units(&self) -> usize;
    fn backend(&self) -> Backend;
}

#[enum_dispatch]
pub(crate) trait TransportMem {
    /// Allocate a zeroed, registered slab of at least `size` bytes.
    fn alloc(&self, size: usize) -> DartResult<usize>;
    fn free(&self, addr: usize) -> DartResult<()>;
    fn occupied(&self) -> usize;
}

#[enum_dispatch]
pub(crate) trait TransportColl {
    /// Gather `data` from every unit in `members` (global ids, in team
    /// order). Every participant receives all contributions in that order.
    fn allgather(&self, key: CollKey, members: &[usize], data: Vec<u8>) -> DartResult<Vec<Vec<u8>>>;
    fn publish(&self, segment: SegmentId, addr: usize, len: usize);
    fn lookup(&self, unit: usize, segment: SegmentId) -> Option<(usize, usize)>;
    fn retract(&self, segment: SegmentId);
}

#[enum_dispatch]
pub(crate) trait TransportRdma {
    /// Copy `src` into registered memory of `unit`; `dst` is already
    /// translated into this process.
    fn put(&self, unit: usize, src: &[u8], dst: usize);
    /// Copy translated registered memory of `unit` at `src` into `dst`.
    fn get(&self, unit: usize, src: usize, dst: &mut [u8]);
    /// Translate an address published by `unit` into this process.
    fn local_addr(&self, unit: usize, addr: usize) -> Option<usize>;
}

#[enum_dispatch(TransportInfo, TransportMem, TransportColl, TransportRdma)]
#[derive(Debug)]
pub(crate) enum Transport {
    LocalTransport,
    ShmemTransport,
}

struct MyPtr {
    ptr: *mut u8,
    layout: std::alloc::Layout,
}
unsafe impl Send for MyPtr {}

/// Registered memory owned by one unit.
pub(crate) struct Slabs {
    allocs: Mutex<HashMap<usize, MyPtr>>,
    occupied: AtomicUsize,
}

impl std::fmt::Debug for Slabs {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Slabs")
            .field("num_allocs", &self.allocs.lock().len())
            .field("occupied", &self.occupied.load(Ordering::Relaxed))
            .finish()
    }
}

impl Slabs {
    pub(crate) fn new() -> Slabs {
        Slabs {
            allocs: Mutex::new(HashMap::new()),
            occupied: AtomicUsize::new(0),
        }
    }

    pub(crate) fn alloc(&self, size: usize) -> DartResult<usize> {
        let layout = std::alloc::Layout::from_size_align(size.max(8), SLAB_ALIGN)
            .map_err(|_| DartError::OutOfMemory(size))?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(DartError::OutOfMemory(size));
        }
        self.occupied.fetch_add(layout.size(), Ordering::Relaxed);
        self.allocs.lock().insert(ptr as usize, MyPtr { ptr, layout });
        Ok(ptr as usize)
    }

    pub(crate) fn free(&self, addr: usize) -> DartResult<()> {
        match self.allocs.lock().remove(&addr) {
            Some(slab) => {
                self.occupied.fetch_sub(slab.layout.size(), Ordering::Relaxed);
                unsafe { std::alloc::dealloc(slab.ptr, slab.layout) };
                Ok(())
            }
            None => Err(DartError::InvalidArgument(format!(
                "no registered memory at {:#x}",
                addr
            ))),
        }
    }

    pub(crate) fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Relaxed)
    }
}

impl Drop for Slabs {
    fn drop(&mut self) {
        for (_, slab) in self.allocs.lock().drain() {
            unsafe { std::alloc::dealloc(slab.ptr, slab.layout) };
        }
    }
}

pub(crate) fn copy_in(src: &[u8], dst: usize) {
    unsafe { std::ptr::copy(src.as_ptr(), dst as *mut u8, src.len()) };
}

pub(crate) fn copy_out(src: usize, dst: &mut [u8]) {
    unsafe { std::ptr::copy(src as *const u8, dst.as_mut_ptr(), dst.len()) };
}
