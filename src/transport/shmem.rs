//! Units on one node connected through named shared-memory objects.
//!
//! Every unit creates a heap object that holds all of its registered memory
//! and maps the heaps of all other units. A control object created by unit 0
//! carries the bootstrap handshake, one collective slot per unit and the
//! registry of attached segments. Addresses are always published in the
//! owner's address space and translated through the local mapping of the
//! owner's heap before use.

use crate::alloc::BTreeAlloc;
use crate::error::{invalid, DartError, DartResult};
use crate::gptr::SegmentId;
use crate::transport::*;
use crate::warnings::DeadlockTimer;

use parking_lot::Mutex;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::sync::atomic::{AtomicU64, Ordering};

const MAGIC: u64 = 0x4441_5254_5f53_484d;
const WORD: usize = std::mem::size_of::<u64>();
/// Bytes one unit may contribute to a collective.
pub(crate) const COLL_DATA: usize = 240;
const SLOT_BYTES: usize = 2 * WORD + COLL_DATA;
/// Attached segments one unit can publish at a time.
const REGISTRY_ENTRIES: usize = 64;
const ENTRY_BYTES: usize = 3 * WORD;

/// Where a unit sits in a job and how its heap is sized.
#[derive(Debug, Clone)]
pub(crate) struct ShmemJob {
    /// prefix of every shared-memory object of the job
    pub(crate) name: String,
    pub(crate) num_units: usize,
    pub(crate) my_unit: usize,
    pub(crate) heap_size: usize,
    pub(crate) deadlock_timeout: f64,
}

struct Mapping {
    base: *mut u8,
    len: usize,
    _shmem: Shmem,
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn new(shmem: Shmem) -> Mapping {
        Mapping {
            base: shmem.as_ptr(),
            len: shmem.len(),
            _shmem: shmem,
        }
    }

    fn base_addr(&self) -> usize {
        self.base as usize
    }
}

fn shmem_err(id: &str, err: ShmemError) -> DartError {
    DartError::CommunicationFailure(format!("shared memory {}: {:?}", id, err))
}

/// Create `id`, replacing an object left behind by an earlier job.
#[tracing::instrument(level = "debug")]
fn create_mapping(id: &str, size: usize) -> DartResult<Mapping> {
    let shmem = match ShmemConf::new().size(size).os_id(id).create() {
        Ok(shmem) => shmem,
        Err(ShmemError::MappingIdExists) | Err(ShmemError::LinkExists) => {
            tracing::warn!("removing stale shared memory {}", id);
            if let Ok(mut stale) = ShmemConf::new().os_id(id).open() {
                stale.set_owner(true);
            }
            ShmemConf::new()
                .size(size)
                .os_id(id)
                .create()
                .map_err(|e| shmem_err(id, e))?
        }
        Err(e) => return Err(shmem_err(id, e)),
    };
    Ok(Mapping::new(shmem))
}

/// The control object shared by every unit of a job.
///
/// Layout, in 8 byte words: magic, joined count, `(heap base, pid)` per
/// unit, one collective slot per unit `(tag, len, data)`, the ack matrix
/// indexed by `(writer, reader)` and the attached-segment registry.
struct Ctl {
    map: Mapping,
    num_units: usize,
}

impl Ctl {
    fn size(num_units: usize) -> usize {
        2 * WORD
            + num_units * 2 * WORD
            + num_units * SLOT_BYTES
            + num_units * num_units * WORD
            + num_units * REGISTRY_ENTRIES * ENTRY_BYTES
    }

    fn word(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset + WORD <= self.map.len);
        unsafe { &*((self.map.base_addr() + offset) as *const AtomicU64) }
    }

    fn header(&self) -> &AtomicU64 {
        self.word(0)
    }

    fn joined(&self) -> &AtomicU64 {
        self.word(WORD)
    }

    fn heap_base(&self, unit: usize) -> &AtomicU64 {
        self.word(2 * WORD + unit * 2 * WORD)
    }

    fn pid(&self, unit: usize) -> &AtomicU64 {
        self.word(3 * WORD + unit * 2 * WORD)
    }

    fn slot_offset(&self, unit: usize) -> usize {
        2 * WORD + self.num_units * 2 * WORD + unit * SLOT_BYTES
    }

    fn slot_tag(&self, unit: usize) -> &AtomicU64 {
        self.word(self.slot_offset(unit))
    }

    fn slot_len(&self, unit: usize) -> &AtomicU64 {
        self.word(self.slot_offset(unit) + WORD)
    }

    fn slot_data(&self, unit: usize) -> *mut u8 {
        (self.map.base_addr() + self.slot_offset(unit) + 2 * WORD) as *mut u8
    }

    /// Tag of the last contribution of `writer` that `reader` has consumed.
    fn ack(&self, writer: usize, reader: usize) -> &AtomicU64 {
        let acks = self.slot_offset(self.num_units);
        self.word(acks + (writer * self.num_units + reader) * WORD)
    }

    /// `(segment, addr, len)` of registry entry `idx` of `unit`; segment 0 is empty.
    fn entry(&self, unit: usize, idx: usize) -> (&AtomicU64, &AtomicU64, &AtomicU64) {
        let registry = self.slot_offset(self.num_units) + self.num_units * self.num_units * WORD;
        let offset = registry + (unit * REGISTRY_ENTRIES + idx) * ENTRY_BYTES;
        (
            self.word(offset),
            self.word(offset + WORD),
            self.word(offset + 2 * WORD),
        )
    }
}

fn registry_key(segment: SegmentId) -> u64 {
    segment.0 as i64 as u64
}

/// Transport of one unit of a shared-memory job.
pub(crate) struct ShmemTransport {
    my_unit: usize,
    num_units: usize,
    pid: u64,
    ctl: Ctl,
    /// every unit's heap mapped into this process, indexed by unit
    heaps: Vec<Mapping>,
    /// every unit's heap base in its owner's address space
    remote_bases: Vec<usize>,
    heap: BTreeAlloc,
    /// end of the highest block ever handed out; memory above it is still zero
    high_water: Mutex<usize>,
    /// tag and members of this unit's previous collective
    last_coll: Mutex<Option<(u64, Vec<usize>)>>,
    deadlock_timeout: f64,
}

impl std::fmt::Debug for ShmemTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ShmemTransport")
            .field("my_unit", &self.my_unit)
            .field("num_units", &self.num_units)
            .field("heap", &self.heap)
            .finish()
    }
}

impl ShmemTransport {
    /// Join the job described by `job`. Blocks until every unit has joined.
    #[tracing::instrument(level = "debug")]
    pub(crate) fn new(job: &ShmemJob) -> DartResult<ShmemTransport> {
        let (me, n) = (job.my_unit, job.num_units);
        if me >= n {
            return invalid(format!("unit {} out of range for a job of {} units", me, n));
        }
        let mut timer = DeadlockTimer::new("shared memory bootstrap", job.deadlock_timeout);
        let ctl_id = format!("dart_{}_ctl", job.name);
        let ctl_len = Ctl::size(n);
        let ctl = if me == 0 {
            let ctl = Ctl {
                map: create_mapping(&ctl_id, ctl_len)?,
                num_units: n,
            };
            ctl.header().store(MAGIC, Ordering::Release);
            ctl
        } else {
            let map = loop {
                match ShmemConf::new().os_id(&ctl_id).open() {
                    Ok(shmem) if shmem.len() >= ctl_len => break Mapping::new(shmem),
                    // not created or not sized yet
                    _ => {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                        timer.check();
                    }
                }
            };
            let ctl = Ctl { map, num_units: n };
            while ctl.header().load(Ordering::Acquire) != MAGIC {
                std::thread::yield_now();
                timer.check();
            }
            ctl
        };

        let heap_id = |unit: usize| format!("dart_{}_heap_{}", job.name, unit);
        let own = create_mapping(&heap_id(me), job.heap_size)?;
        let pid = std::process::id() as u64;
        ctl.pid(me).store(pid, Ordering::Relaxed);
        ctl.heap_base(me).store(own.base_addr() as u64, Ordering::Release);

        let heap = BTreeAlloc::new(format!("shmem_heap_{}", me), own.base_addr(), own.len);
        let high_water = Mutex::new(own.base_addr());
        let mut own = Some(own);
        let mut heaps = Vec::with_capacity(n);
        let mut remote_bases = Vec::with_capacity(n);
        for unit in 0..n {
            if unit == me {
                if let Some(own) = own.take() {
                    remote_bases.push(own.base_addr());
                    heaps.push(own);
                }
                continue;
            }
            let base = loop {
                let base = ctl.heap_base(unit).load(Ordering::Acquire);
                if base != 0 {
                    break base as usize;
                }
                std::thread::yield_now();
                timer.check();
            };
            let id = heap_id(unit);
            let map = ShmemConf::new()
                .os_id(&id)
                .open()
                .map_err(|e| shmem_err(&id, e))?;
            remote_bases.push(base);
            heaps.push(Mapping::new(map));
        }

        // nobody may unlink an object before every unit has mapped it
        ctl.joined().fetch_add(1, Ordering::AcqRel);
        while (ctl.joined().load(Ordering::Acquire) as usize) < n {
            std::thread::yield_now();
            timer.check();
        }
        tracing::debug!("unit {} joined shared memory job {}", me, job.name);
        Ok(ShmemTransport {
            my_unit: me,
            num_units: n,
            pid,
            ctl,
            heaps,
            remote_bases,
            heap,
            high_water,
            last_coll: Mutex::new(None),
            deadlock_timeout: job.deadlock_timeout,
        })
    }
}

impl TransportInfo for ShmemTransport {
    fn my_unit(&self) -> usize {
        self.my_unit
    }
    fn num_units(&self) -> usize {
        self.num_units
    }
    fn backend(&self) -> Backend {
        Backend::Shmem
    }
}

impl TransportMem for ShmemTransport {
    fn alloc(&self, size: usize) -> DartResult<usize> {
        let size = size.max(1).div_ceil(SLAB_ALIGN) * SLAB_ALIGN;
        let addr = self.heap.try_malloc(size).ok_or(DartError::OutOfMemory(size))?;
        let mut high = self.high_water.lock();
        let dirty_end = (*high).min(addr + size);
        if dirty_end > addr {
            unsafe { std::ptr::write_bytes(addr as *mut u8, 0, dirty_end - addr) };
        }
        *high = (*high).max(addr + size);
        Ok(addr)
    }
    fn free(&self, addr: usize) -> DartResult<()> {
        self.heap.free(addr).map(|_| ())
    }
    fn occupied(&self) -> usize {
        self.heap.occupied()
    }
}

impl TransportColl for ShmemTransport {
    /// A unit's slot is rewritten only after every reader of its previous
    /// contribution has acknowledged it.
    #[tracing::instrument(skip(self, data), level = "debug")]
    fn allgather(&self, key: CollKey, members: &[usize], data: Vec<u8>) -> DartResult<Vec<Vec<u8>>> {
        let me = self.my_unit;
        if !members.contains(&me) {
            return invalid(format!("unit {} is not a participant of {:?}", me, key));
        }
        if members.len() == 1 {
            return Ok(vec![data]);
        }
        if data.len() > COLL_DATA {
            return invalid(format!(
                "collective contribution of {} bytes exceeds {}",
                data.len(),
                COLL_DATA
            ));
        }
        let tag = key.tag();
        let mut timer = DeadlockTimer::new("allgather", self.deadlock_timeout);
        let mut last = self.last_coll.lock();
        if let Some((prev, readers)) = last.take() {
            for reader in readers.into_iter().filter(|r| *r != me) {
                while self.ctl.ack(me, reader).load(Ordering::Acquire) != prev {
                    std::thread::yield_now();
                    timer.check();
                }
            }
        }
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ctl.slot_data(me), data.len()) };
        self.ctl.slot_len(me).store(data.len() as u64, Ordering::Relaxed);
        self.ctl.slot_tag(me).store(tag, Ordering::Release);

        let mut gathered = Vec::with_capacity(members.len());
        for unit in members.iter().copied() {
            if unit == me {
                gathered.push(data.clone());
                continue;
            }
            while self.ctl.slot_tag(unit).load(Ordering::Acquire) != tag {
                std::thread::yield_now();
                timer.check();
            }
            let len = (self.ctl.slot_len(unit).load(Ordering::Relaxed) as usize).min(COLL_DATA);
            let mut buf = vec![0u8; len];
            unsafe { std::ptr::copy_nonoverlapping(self.ctl.slot_data(unit), buf.as_mut_ptr(), len) };
            self.ctl.ack(unit, me).store(tag, Ordering::Release);
            gathered.push(buf);
        }
        *last = Some((tag, members.to_vec()));
        Ok(gathered)
    }

    fn publish(&self, segment: SegmentId, addr: usize, len: usize) {
        let free = (0..REGISTRY_ENTRIES)
            .find(|idx| self.ctl.entry(self.my_unit, *idx).0.load(Ordering::Relaxed) == 0);
        match free {
            Some(idx) => {
                let (seg, a, l) = self.ctl.entry(self.my_unit, idx);
                a.store(addr as u64, Ordering::Relaxed);
                l.store(len as u64, Ordering::Relaxed);
                seg.store(registry_key(segment), Ordering::Release);
            }
            None => tracing::warn!(
                "attached segment registry of unit {} is full, {} is only reachable locally",
                self.my_unit,
                segment
            ),
        }
    }

    fn lookup(&self, unit: usize, segment: SegmentId) -> Option<(usize, usize)> {
        if unit >= self.num_units {
            return None;
        }
        let key = registry_key(segment);
        (0..REGISTRY_ENTRIES).find_map(|idx| {
            let (seg, addr, len) = self.ctl.entry(unit, idx);
            (seg.load(Ordering::Acquire) == key).then(|| {
                (
                    addr.load(Ordering::Relaxed) as usize,
                    len.load(Ordering::Relaxed) as usize,
                )
            })
        })
    }

    fn retract(&self, segment: SegmentId) {
        let key = registry_key(segment);
        for idx in 0..REGISTRY_ENTRIES {
            let (seg, _, _) = self.ctl.entry(self.my_unit, idx);
            if seg.load(Ordering::Relaxed) == key {
                seg.store(0, Ordering::Release);
            }
        }
    }
}

impl TransportRdma for ShmemTransport {
    fn put(&self, unit: usize, src: &[u8], dst: usize) {
        debug_assert!(unit < self.num_units);
        copy_in(src, dst);
    }
    fn get(&self, unit: usize, src: usize, dst: &mut [u8]) {
        debug_assert!(unit < self.num_units);
        copy_out(src, dst);
    }

    /// Heap addresses go through this process's mapping of the owner's heap;
    /// other addresses are only reachable when the owner shares the process.
    fn local_addr(&self, unit: usize, addr: usize) -> Option<usize> {
        if unit == self.my_unit {
            return Some(addr);
        }
        let heap = self.heaps.get(unit)?;
        let remote_base = self.remote_bases[unit];
        if remote_base <= addr && addr < remote_base + heap.len {
            Some(heap.base_addr() + (addr - remote_base))
        } else if self.ctl.pid(unit).load(Ordering::Relaxed) == self.pid {
            Some(addr)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gptr::TeamId;

    fn job(name: &str, num_units: usize, my_unit: usize) -> ShmemJob {
        ShmemJob {
            name: format!("unit_test_{}_{}", std::process::id(), name),
            num_units,
            my_unit,
            heap_size: 1 << 20,
            deadlock_timeout: 0.0,
        }
    }

    fn join_all(name: &str, num_units: usize) -> Vec<ShmemTransport> {
        std::thread::scope(|s| {
            let handles = (0..num_units)
                .map(|unit| s.spawn(move || ShmemTransport::new(&job(name, num_units, unit)).unwrap()))
                .collect::<Vec<_>>();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    fn key(seq: u64) -> CollKey {
        CollKey {
            team: TeamId::ALL,
            leader: 0,
            seq,
        }
    }

    #[test]
    fn allgather_delivers_every_contribution() {
        let transports = join_all("allgather", 4);
        let results = std::thread::scope(|s| {
            let handles = transports
                .iter()
                .enumerate()
                .map(|(unit, t)| {
                    s.spawn(move || {
                        let mut rounds = vec![];
                        for seq in 0..20u64 {
                            let data = vec![unit as u8; unit + seq as usize % 3];
                            rounds.push(t.allgather(key(seq), &[0, 1, 2, 3], data).unwrap());
                        }
                        // a sub-group in reverse order reuses the same slots
                        if unit % 2 == 1 {
                            rounds.push(t.allgather(key(100), &[3, 1], vec![unit as u8]).unwrap());
                        }
                        rounds
                    })
                })
                .collect::<Vec<_>>();
            handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>()
        });
        for (unit, rounds) in results.iter().enumerate() {
            for (seq, round) in rounds.iter().take(20).enumerate() {
                for (idx, data) in round.iter().enumerate() {
                    assert_eq!(data, &vec![idx as u8; idx + seq % 3]);
                }
            }
            if unit % 2 == 1 {
                assert_eq!(rounds[20], vec![vec![3u8], vec![1u8]]);
            }
        }
    }

    #[test]
    fn oversized_contributions_are_rejected() {
        let transports = join_all("oversized", 2);
        assert!(matches!(
            transports[0].allgather(key(1), &[0, 1], vec![0u8; COLL_DATA + 1]),
            Err(DartError::InvalidArgument(_))
        ));
        assert!(matches!(
            transports[0].allgather(key(1), &[1], vec![]),
            Err(DartError::InvalidArgument(_))
        ));
    }

    #[test]
    fn heap_addresses_translate_through_the_local_mapping() {
        let transports = join_all("translate", 2);
        let (t0, t1) = (&transports[0], &transports[1]);
        let addr = t0.alloc(64).unwrap();
        assert_eq!(addr % SLAB_ALIGN, 0);
        let mapped = t1.local_addr(0, addr).unwrap();
        assert_ne!(mapped, addr);
        t1.put(0, &[7u8; 8], mapped);
        let mut buf = [0u8; 8];
        t0.get(0, addr, &mut buf);
        assert_eq!(buf, [7u8; 8]);
        // both units live in this process, so private memory stays reachable
        let private = Box::new(0u64);
        let private_addr = &*private as *const u64 as usize;
        assert_eq!(t1.local_addr(0, private_addr), Some(private_addr));
        assert_eq!(t1.local_addr(5, addr), None);
        t0.free(addr).unwrap();
    }

    #[test]
    fn reused_heap_memory_is_zeroed() {
        let transports = join_all("zeroed", 1);
        let t = &transports[0];
        let addr = t.alloc(128).unwrap();
        t.put(0, &[0xffu8; 128], addr);
        assert_eq!(t.occupied(), 128);
        t.free(addr).unwrap();
        let again = t.alloc(100).unwrap();
        assert_eq!(again, addr);
        let mut buf = [1u8; 128];
        t.get(0, again, &mut buf);
        assert_eq!(buf, [0u8; 128]);
    }

    #[test]
    fn registry_is_keyed_by_unit() {
        let transports = join_all("registry", 2);
        let (t0, t1) = (&transports[0], &transports[1]);
        t0.publish(SegmentId(-2), 0x1000, 64);
        assert_eq!(t1.lookup(0, SegmentId(-2)), Some((0x1000, 64)));
        assert_eq!(t1.lookup(1, SegmentId(-2)), None);
        assert_eq!(t1.lookup(0, SegmentId(-3)), None);
        t0.retract(SegmentId(-2));
        assert_eq!(t1.lookup(0, SegmentId(-2)), None);
    }
}
