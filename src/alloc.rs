use indexmap::IndexSet;
use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::error::{DartError, DartResult};

/// Allocation granularity of the local pool.
pub(crate) const POOL_ALIGN: usize = 8;

#[derive(Clone, Debug, Default)]
struct FreeEntries {
    sizes: BTreeMap<usize, IndexSet<usize>>, //<size,<addrs>>
    addrs: BTreeMap<usize, usize>,           //<addr,size>
}

/// Best-fit sub-allocator for the per-unit local pool.
///
/// Free blocks are indexed both by size (to find the smallest fitting block)
/// and by address (to coalesce neighbours on free).
#[derive(Debug)]
pub(crate) struct BTreeAlloc {
    free_entries: Mutex<FreeEntries>,
    allocated_addrs: Mutex<BTreeMap<usize, usize>>, //<addr,size>
    start_addr: usize,
    max_size: usize,
    id: String,
}

impl BTreeAlloc {
    pub(crate) fn new(id: impl Into<String>, start_addr: usize, size: usize) -> BTreeAlloc {
        let mut free_entries = FreeEntries::default();
        if size > 0 {
            let mut temp = IndexSet::new();
            temp.insert(start_addr);
            free_entries.sizes.insert(size, temp);
            free_entries.addrs.insert(start_addr, size);
        }
        BTreeAlloc {
            free_entries: Mutex::new(free_entries),
            allocated_addrs: Mutex::new(BTreeMap::new()),
            start_addr,
            max_size: size,
            id: id.into(),
        }
    }

    pub(crate) fn start_addr(&self) -> usize {
        self.start_addr
    }

    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    pub(crate) fn try_malloc(&self, size: usize) -> Option<usize> {
        let size = size.max(1).div_ceil(POOL_ALIGN) * POOL_ALIGN;
        let mut free_entries = self.free_entries.lock();
        let mut addr: Option<usize> = None;
        let mut remove_size: Option<usize> = None;
        //find smallest free block greater than or equal to size
        if let Some((free_size, addrs)) = free_entries.sizes.range_mut(size..).next() {
            addr = addrs.pop();
            if addrs.is_empty() {
                remove_size = Some(*free_size);
            }
        }
        if let Some(rsize) = remove_size {
            free_entries.sizes.remove(&rsize);
        }
        let a = addr?;
        match free_entries.addrs.remove(&a) {
            Some(fsize) if fsize > size => {
                let remaining = fsize - size;
                let new_addr = a + size;
                free_entries
                    .sizes
                    .entry(remaining)
                    .or_default()
                    .insert(new_addr);
                free_entries.addrs.insert(new_addr, remaining);
            }
            Some(_) => {}
            None => {
                tracing::error!("{} free block {:#x} missing from address index", self.id, a);
                return None;
            }
        }
        drop(free_entries);
        self.allocated_addrs.lock().insert(a, size);
        tracing::trace!("{} malloc {} bytes at {:#x}", self.id, size, a);
        Some(a)
    }

    /// Release the block starting at `addr`, returning its size.
    pub(crate) fn free(&self, addr: usize) -> DartResult<usize> {
        let size = match self.allocated_addrs.lock().remove(&addr) {
            Some(size) => size,
            None => {
                return Err(DartError::InvalidArgument(format!(
                    "{} illegal free, address {:#x} is not currently allocated",
                    self.id, addr
                )))
            }
        };
        let mut temp_addr = addr;
        let mut temp_size = size;
        let mut remove: Vec<(usize, usize)> = vec![];
        let mut free_entries = self.free_entries.lock();
        if let Some((faddr, fsize)) = free_entries.addrs.range(..addr).next_back() {
            if faddr + fsize == addr {
                temp_addr = *faddr;
                temp_size = fsize + size;
                remove.push((*faddr, *fsize));
            }
        }
        if let Some((faddr, fsize)) = free_entries.addrs.range(addr..).next() {
            if temp_addr + temp_size == *faddr {
                temp_size += fsize;
                remove.push((*faddr, *fsize));
            }
        }
        for (raddr, rsize) in remove {
            free_entries.addrs.remove(&raddr);
            let mut remove_size = false;
            if let Some(addrs) = free_entries.sizes.get_mut(&rsize) {
                addrs.remove(&raddr);
                remove_size = addrs.is_empty();
            }
            if remove_size {
                free_entries.sizes.remove(&rsize);
            }
        }
        free_entries.addrs.insert(temp_addr, temp_size);
        free_entries
            .sizes
            .entry(temp_size)
            .or_default()
            .insert(temp_addr);
        tracing::trace!("{} free {} bytes at {:#x}", self.id, size, addr);
        Ok(size)
    }

    /// Size of the live block starting at `addr`.
    pub(crate) fn block_size(&self, addr: usize) -> Option<usize> {
        self.allocated_addrs.lock().get(&addr).copied()
    }

    pub(crate) fn occupied(&self) -> usize {
        self.allocated_addrs.lock().values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_fit_and_split() {
        let alloc = BTreeAlloc::new("best_fit_and_split", 0, 1000);
        assert_eq!(alloc.try_malloc(48), Some(0));
        assert_eq!(alloc.try_malloc(8), Some(48));
        assert_eq!(alloc.try_malloc(600), Some(56));
        assert_eq!(alloc.try_malloc(8), Some(656));
        assert_eq!(alloc.occupied(), 664);
    }

    #[test]
    fn sizes_round_up_to_granularity() {
        let alloc = BTreeAlloc::new("sizes_round_up", 0, 64);
        assert_eq!(alloc.try_malloc(1), Some(0));
        assert_eq!(alloc.try_malloc(0), Some(8));
        assert_eq!(alloc.block_size(0), Some(8));
        assert_eq!(alloc.try_malloc(9), Some(16));
        assert_eq!(alloc.block_size(16), Some(16));
    }

    #[test]
    fn freed_blocks_are_reused_and_coalesced() {
        let alloc = BTreeAlloc::new("coalesce", 0, 1000);
        let a = alloc.try_malloc(48).unwrap();
        let b = alloc.try_malloc(8).unwrap();
        let c = alloc.try_malloc(600).unwrap();
        let d = alloc.try_malloc(8).unwrap();
        alloc.free(a).unwrap();
        assert_eq!(alloc.try_malloc(32), Some(0));
        alloc.free(b).unwrap();
        // 16 bytes left of a's block merge with b's 8
        assert_eq!(alloc.try_malloc(24), Some(32));
        alloc.free(0).unwrap();
        alloc.free(32).unwrap();
        alloc.free(c).unwrap();
        alloc.free(d).unwrap();
        assert_eq!(alloc.occupied(), 0);
        assert_eq!(alloc.try_malloc(1000), Some(0));
    }

    #[test]
    fn exhaustion_returns_none() {
        let alloc = BTreeAlloc::new("exhaustion", 4096, 128);
        assert_eq!(alloc.try_malloc(128), Some(4096));
        assert_eq!(alloc.try_malloc(8), None);
        alloc.free(4096).unwrap();
        assert_eq!(alloc.try_malloc(8), Some(4096));
    }

    #[test]
    fn double_free_is_rejected() {
        let alloc = BTreeAlloc::new("double_free", 0, 256);
        let a = alloc.try_malloc(16).unwrap();
        assert_eq!(alloc.free(a), Ok(16));
        assert!(matches!(alloc.free(a), Err(DartError::InvalidArgument(_))));
        assert!(matches!(alloc.free(200), Err(DartError::InvalidArgument(_))));
    }
}
