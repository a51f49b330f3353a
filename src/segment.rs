//! Segment table and the memory API.
//!
//! Three kinds of segments exist:
//! - the local pool (`SegmentId::LOCAL`), a per-unit heap exchanged at
//!   startup and sub-allocated with [BTreeAlloc];
//! - collective symmetric segments, one registered slab per team member,
//!   identified per team by the smallest free positive id;
//! - attached segments, caller-owned buffers registered by one unit.

use crate::alloc::BTreeAlloc;
use crate::error::{invalid, DartError, DartResult};
use crate::gptr::{GlobalPtr, SegmentId, TeamId};
use crate::team::Team;
use crate::transport::{Transport, TransportColl, TransportMem, TransportRdma};
use crate::Runtime;

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Local,
    Symmetric,
    Attached,
}

#[derive(Debug, Clone)]
pub(crate) struct Segment {
    pub(crate) id: SegmentId,
    pub(crate) kind: SegmentKind,
    pub(crate) len: usize,
    /// base address of every member's slice in this process, indexed by team unit id
    pub(crate) bases: Vec<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct SegmentTable {
    segs: BTreeMap<SegmentId, Segment>,
}

impl SegmentTable {
    pub(crate) fn new() -> SegmentTable {
        SegmentTable::default()
    }

    /// Smallest positive id not in use.
    pub(crate) fn next_collective_id(&self) -> Option<SegmentId> {
        let mut next = 1i16;
        for id in self.segs.keys().filter(|id| id.is_collective()) {
            if id.0 != next {
                break;
            }
            next = next.checked_add(1)?;
        }
        Some(SegmentId(next))
    }

    /// Largest id `<= -2` not in use.
    pub(crate) fn next_attached_id(&self) -> Option<SegmentId> {
        let mut next = -2i16;
        for id in self.segs.keys().rev().filter(|id| id.is_attached()) {
            if id.0 != next {
                break;
            }
            next = next.checked_sub(1)?;
        }
        Some(SegmentId(next))
    }

    pub(crate) fn get(&self, id: SegmentId) -> Option<&Segment> {
        self.segs.get(&id)
    }

    pub(crate) fn insert(&mut self, seg: Segment) {
        self.segs.insert(seg.id, seg);
    }

    pub(crate) fn remove(&mut self, id: SegmentId) -> Option<Segment> {
        self.segs.remove(&id)
    }

    pub(crate) fn ids(&self) -> Vec<SegmentId> {
        self.segs.keys().copied().collect()
    }
}

/// The per-unit heap backing `SegmentId::LOCAL`.
#[derive(Debug)]
pub(crate) struct LocalPool {
    alloc: BTreeAlloc,
    bases: Vec<usize>,
}

impl LocalPool {
    /// Collective over the root team.
    pub(crate) fn new(transport: &Transport, root: &Team, size: usize) -> DartResult<LocalPool> {
        let base = transport.alloc(size)?;
        let gathered = root.allgather(transport, crate::serialize(&(base as u64))?)?;
        let mut bases = Vec::with_capacity(gathered.len());
        for (idx, bytes) in gathered.iter().enumerate() {
            let remote = crate::deserialize::<u64>(bytes)? as usize;
            bases.push(map_base(transport, root.l2g(idx)?, remote)?);
        }
        Ok(LocalPool {
            alloc: BTreeAlloc::new(format!("local_pool_{}", root.my_idx), base, size),
            bases,
        })
    }

    pub(crate) fn release(&self, transport: &Transport) -> DartResult<()> {
        transport.free(self.alloc.start_addr())
    }

    pub(crate) fn occupied(&self) -> usize {
        self.alloc.occupied()
    }
}

/// Translate the base of `unit`'s slice into this process.
fn map_base(transport: &Transport, unit: usize, base: usize) -> DartResult<usize> {
    transport.local_addr(unit, base).ok_or_else(|| {
        DartError::CommunicationFailure(format!(
            "memory at {:#x} of unit {} is not mapped into this process",
            base, unit
        ))
    })
}

/// Where a global pointer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId {
    pub team: TeamId,
    pub segment: SegmentId,
}

/// Result of [Runtime::segment_resolve].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub window: WindowId,
    pub kind: SegmentKind,
    /// base address of the owner's slice of the window, in this process
    pub base: usize,
    /// byte displacement of the pointer within the owner's slice
    pub disp: usize,
    /// global id of the owning unit
    pub owner: usize,
    /// length of the owner's slice in bytes
    pub len: usize,
}

impl Resolved {
    pub fn addr(&self) -> usize {
        self.base + self.disp
    }
}

impl Runtime {
    /// Resolve a global pointer to its window, displacement and owner.
    pub fn segment_resolve(&self, gptr: &GlobalPtr) -> DartResult<Resolved> {
        let window = WindowId {
            team: gptr.team,
            segment: gptr.segment,
        };
        let (kind, base, owner, len) = match gptr.segment {
            SegmentId::NULL => return invalid("null global pointer"),
            SegmentId::LOCAL => {
                let unit = gptr.unit();
                match self.local_pool.bases.get(unit) {
                    Some(base) => (SegmentKind::Local, *base, unit, self.local_pool.alloc.max_size()),
                    None => return invalid(format!("unit {} out of range", unit)),
                }
            }
            id if id.is_collective() => {
                let team = self.teams.get(gptr.team)?;
                let owner = team.l2g(gptr.unit())?;
                let segments = team.segments.read();
                match segments.get(id) {
                    Some(seg) => (seg.kind, seg.bases[gptr.unit()], owner, seg.len),
                    None => return invalid(format!("{} is not allocated on {}", id, gptr.team)),
                }
            }
            id if id.is_attached() => {
                let unit = gptr.unit();
                if unit >= self.num_units {
                    return invalid(format!("unit {} out of range", unit));
                }
                let found = if unit == self.my_unit {
                    self.teams
                        .get(TeamId::ALL)?
                        .segments
                        .read()
                        .get(id)
                        .map(|seg| (seg.bases[0], seg.len))
                } else {
                    match self.transport.lookup(unit, id) {
                        Some((base, len)) => match self.transport.local_addr(unit, base) {
                            Some(base) => Some((base, len)),
                            None => {
                                return invalid(format!(
                                    "{} of unit {} is not reachable from this process",
                                    id, unit
                                ))
                            }
                        },
                        None => None,
                    }
                };
                match found {
                    Some((base, len)) => (SegmentKind::Attached, base, unit, len),
                    None => return invalid(format!("{} is not attached on unit {}", id, unit)),
                }
            }
            id => return invalid(format!("unknown segment {}", id)),
        };
        let disp = gptr.offset as usize;
        if disp > len {
            return invalid(format!("{} is outside its segment of {} bytes", gptr, len));
        }
        Ok(Resolved {
            window,
            kind,
            base,
            disp,
            owner,
            len,
        })
    }

    /// Resolve `gptr` and check that `nbytes` starting there are in bounds.
    pub(crate) fn resolve_range(&self, gptr: &GlobalPtr, nbytes: usize) -> DartResult<Resolved> {
        let res = self.segment_resolve(gptr)?;
        if res.disp + nbytes > res.len {
            return invalid(format!(
                "{} bytes at {} exceed the segment length {}",
                nbytes, gptr, res.len
            ));
        }
        Ok(res)
    }

    /// Global id of the unit owning `gptr`.
    pub fn gptr_owner(&self, gptr: &GlobalPtr) -> DartResult<usize> {
        if gptr.segment.is_collective() {
            self.teams.get(gptr.team)?.l2g(gptr.unit())
        } else if gptr.is_null() {
            invalid("null global pointer")
        } else {
            Ok(gptr.unit())
        }
    }

    /// Native address of `gptr` within this process.
    pub fn gptr_getaddr(&self, gptr: &GlobalPtr) -> DartResult<*mut u8> {
        Ok(self.segment_resolve(gptr)?.addr() as *mut u8)
    }

    /// Rebuild the offset of `gptr` from a native address inside its segment.
    pub fn gptr_setaddr(&self, gptr: &GlobalPtr, addr: *const u8) -> DartResult<GlobalPtr> {
        let res = self.segment_resolve(&gptr.with_offset(0))?;
        let addr = addr as usize;
        if addr < res.base || addr > res.base + res.len {
            return invalid(format!("{:#x} does not point into {}", addr, gptr));
        }
        Ok(gptr.with_offset((addr - res.base) as u64))
    }

    /// Collectively allocate `nbytes` on every member of `team`.
    ///
    /// The returned pointer addresses offset 0 of team unit 0; its `segment`
    /// is the new segment id. Every member must request the same size, a
    /// mismatch panics on all members.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn segment_alloc_sym(&self, team: TeamId, nbytes: usize) -> DartResult<GlobalPtr> {
        let t = self.teams.get(team)?;
        let id = t
            .segments
            .read()
            .next_collective_id()
            .ok_or_else(|| DartError::Other(format!("segment ids exhausted on {}", team)))?;
        let addr = self.transport.alloc(nbytes).unwrap_or(0);
        let gathered = t.allgather(
            &self.transport,
            crate::serialize(&(id.0, nbytes as u64, addr as u64))?,
        )?;
        let mut bases = Vec::with_capacity(gathered.len());
        for (idx, bytes) in gathered.iter().enumerate() {
            let (sid, size, base) = crate::deserialize::<(i16, u64, u64)>(bytes)?;
            if size as usize != nbytes {
                panic!(
                    "segment_alloc_sym on {}: unit {} requested {} bytes but unit {} requested {}",
                    team, t.my_idx, nbytes, idx, size
                );
            }
            if sid != id.0 {
                panic!(
                    "segment_alloc_sym on {}: segment tables diverged (unit {} chose {} and unit {} chose {})",
                    team, t.my_idx, id, idx, sid
                );
            }
            bases.push(base as usize);
        }
        if bases.iter().any(|base| *base == 0) {
            if addr != 0 {
                self.transport.free(addr)?;
            }
            return Err(DartError::OutOfMemory(nbytes));
        }
        for (idx, base) in bases.iter_mut().enumerate() {
            *base = map_base(&self.transport, t.l2g(idx)?, *base)?;
        }
        t.segments.write().insert(Segment {
            id,
            kind: SegmentKind::Symmetric,
            len: nbytes,
            bases,
        });
        self.barrier(team)?;
        tracing::debug!("allocated {} on {} ({} bytes per unit)", id, team, nbytes);
        Ok(GlobalPtr::new(0, id, team, 0))
    }

    /// Allocate `nbytes` from this unit's local pool.
    pub fn segment_alloc_local(&self, nbytes: usize) -> DartResult<GlobalPtr> {
        match self.local_pool.alloc.try_malloc(nbytes) {
            Some(addr) => Ok(GlobalPtr::new(
                self.my_unit,
                SegmentId::LOCAL,
                TeamId::ALL,
                (addr - self.local_pool.alloc.start_addr()) as u64,
            )),
            None => Err(DartError::OutOfMemory(nbytes)),
        }
    }

    /// Register a caller-owned buffer for remote access.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `nbytes` bytes until the
    /// segment is freed, and must not be accessed through Rust references
    /// while remote units may write to it.
    pub unsafe fn segment_attach(&self, ptr: *mut u8, nbytes: usize) -> DartResult<GlobalPtr> {
        if ptr.is_null() {
            return invalid("cannot attach a null buffer");
        }
        let root = self.teams.get(TeamId::ALL)?;
        let mut segments = root.segments.write();
        let id = segments
            .next_attached_id()
            .ok_or_else(|| DartError::Other("attached segment ids exhausted".to_string()))?;
        segments.insert(Segment {
            id,
            kind: SegmentKind::Attached,
            len: nbytes,
            bases: vec![ptr as usize],
        });
        self.transport.publish(id, ptr as usize, nbytes);
        tracing::debug!("attached {} bytes at {:p} as {}", nbytes, ptr, id);
        Ok(GlobalPtr::new(self.my_unit, id, TeamId::ALL, 0))
    }

    /// Release the segment `gptr` points into.
    ///
    /// Collective over the team for symmetric segments, local otherwise.
    /// Freeing a segment that is not live is an invalid argument.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn segment_free(&self, gptr: GlobalPtr) -> DartResult<()> {
        match gptr.segment {
            SegmentId::NULL => invalid("null global pointer"),
            SegmentId::LOCAL => {
                if gptr.unit() != self.my_unit {
                    return invalid(format!("{} belongs to another unit's local pool", gptr));
                }
                self.comm.flush_all();
                self.local_pool
                    .alloc
                    .free(self.local_pool.alloc.start_addr() + gptr.offset as usize)
                    .map(|_| ())
            }
            id if id.is_collective() => {
                let t = self.teams.get(gptr.team)?;
                let local_base = match t.segments.read().get(id) {
                    Some(seg) => seg.bases[t.my_idx],
                    None => return invalid(format!("{} is not allocated on {}", id, gptr.team)),
                };
                self.comm.flush_all();
                self.barrier(gptr.team)?;
                t.segments.write().remove(id);
                self.transport.free(local_base)
            }
            id if id.is_attached() => {
                if gptr.unit() != self.my_unit {
                    return invalid(format!("{} was attached by another unit", gptr));
                }
                let root = self.teams.get(TeamId::ALL)?;
                if root.segments.write().remove(id).is_none() {
                    return invalid(format!("{} is not attached", id));
                }
                self.comm.flush_all();
                self.transport.retract(id);
                Ok(())
            }
            id => invalid(format!("unknown segment {}", id)),
        }
    }

    /// Bytes currently handed out from the local pool.
    pub fn local_pool_occupied(&self) -> usize {
        self.local_pool.occupied()
    }
}
