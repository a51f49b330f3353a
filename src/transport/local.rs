use crate::error::DartResult;
use crate::gptr::SegmentId;
use crate::transport::*;

use parking_lot::RwLock;
use std::collections::HashMap;

/// Transport for a single unit: every collective completes immediately.
#[derive(Debug)]
pub(crate) struct LocalTransport {
    slabs: Slabs,
    attached: RwLock<HashMap<SegmentId, (usize, usize)>>,
}

impl LocalTransport {
    pub(crate) fn new() -> LocalTransport {
        LocalTransport {
            slabs: Slabs::new(),
            attached: RwLock::new(HashMap::new()),
        }
    }
}

impl TransportInfo for LocalTransport {
    fn my_unit(&self) -> usize {
        0
    }
    fn num_units(&self) -> usize {
        1
    }
    fn backend(&self) -> Backend {
        Backend::Local
    }
}

impl TransportMem for LocalTransport {
    fn alloc(&self, size: usize) -> DartResult<usize> {
        self.slabs.alloc(size)
    }
    fn free(&self, addr: usize) -> DartResult<()> {
        self.slabs.free(addr)
    }
    fn occupied(&self) -> usize {
        self.slabs.occupied()
    }
}

impl TransportColl for LocalTransport {
    fn allgather(&self, _key: CollKey, members: &[usize], data: Vec<u8>) -> DartResult<Vec<Vec<u8>>> {
        debug_assert_eq!(members, &[0]);
        Ok(vec![data])
    }
    fn publish(&self, segment: SegmentId, addr: usize, len: usize) {
        self.attached.write().insert(segment, (addr, len));
    }
    fn lookup(&self, unit: usize, segment: SegmentId) -> Option<(usize, usize)> {
        if unit != 0 {
            return None;
        }
        self.attached.read().get(&segment).copied()
    }
    fn retract(&self, segment: SegmentId) {
        self.attached.write().remove(&segment);
    }
}

impl TransportRdma for LocalTransport {
    fn put(&self, unit: usize, src: &[u8], dst: usize) {
        debug_assert_eq!(unit, 0);
        copy_in(src, dst);
    }
    fn get(&self, unit: usize, src: usize, dst: &mut [u8]) {
        debug_assert_eq!(unit, 0);
        copy_out(src, dst);
    }
    fn local_addr(&self, unit: usize, addr: usize) -> Option<usize> {
        (unit == 0).then_some(addr)
    }
}
