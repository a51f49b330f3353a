//! Location-keyed dependency matching.
//!
//! For every global pointer a task has declared an output on, the table
//! keeps the writers in creation order and the readers registered since the
//! last writer. Entries of finished tasks are pruned lazily.

use crate::gptr::GlobalPtr;
use crate::tasking::task::TaskState;
use crate::tasking::DepKind;

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

const NUM_SHARDS: usize = 16;

#[derive(Default)]
struct Entry {
    writers: Vec<Arc<TaskState>>,
    readers: Vec<Arc<TaskState>>,
}

impl Entry {
    fn prune(&mut self) {
        self.writers.retain(|t| !t.is_finished());
        self.readers.retain(|t| !t.is_finished());
    }

    fn latest_writer(&self, phase: u64) -> Option<&Arc<TaskState>> {
        self.writers.iter().rev().find(|t| t.phase <= phase)
    }
}

pub(crate) struct DepTable {
    shards: Vec<Mutex<HashMap<GlobalPtr, Entry>>>,
}

impl std::fmt::Debug for DepTable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DepTable").field("keys", &self.len()).finish()
    }
}

/// Flags do not take part in matching.
fn key(gptr: &GlobalPtr) -> GlobalPtr {
    gptr.with_flags(0)
}

impl DepTable {
    pub(crate) fn new() -> DepTable {
        DepTable {
            shards: (0..NUM_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &GlobalPtr) -> &Mutex<HashMap<GlobalPtr, Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % NUM_SHARDS]
    }

    /// Record `task` accessing `gptr` and return the tasks it must wait for.
    pub(crate) fn register(
        &self,
        kind: DepKind,
        gptr: &GlobalPtr,
        phase: u64,
        task: &Arc<TaskState>,
    ) -> Vec<Arc<TaskState>> {
        let key = key(gptr);
        let mut shard = self.shard(&key).lock();
        let entry = shard.entry(key).or_default();
        entry.prune();
        let mut preds: Vec<Arc<TaskState>> = entry.latest_writer(phase).cloned().into_iter().collect();
        match kind {
            DepKind::In => entry.readers.push(task.clone()),
            DepKind::Out | DepKind::InOut => {
                let (before, after): (Vec<_>, Vec<_>) =
                    entry.readers.drain(..).partition(|r| r.phase <= phase);
                preds.extend(before);
                entry.readers = after;
                entry.writers.push(task.clone());
            }
        }
        preds.retain(|pred| !Arc::ptr_eq(pred, task));
        preds
    }

    /// Latest unfinished writer of `gptr` with a phase not after `phase`.
    pub(crate) fn latest_writer(&self, gptr: &GlobalPtr, phase: u64) -> Option<Arc<TaskState>> {
        let key = key(gptr);
        let mut shard = self.shard(&key).lock();
        let entry = shard.get_mut(&key)?;
        entry.prune();
        entry.latest_writer(phase).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub(crate) fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gptr::{SegmentId, TeamId};
    use crate::tasking::task::TaskArena;
    use crate::tasking::Priority;
    use futures::future::AbortHandle;

    fn new_task(arena: &TaskArena, phase: u64) -> Arc<TaskState> {
        arena.insert_with(|task| {
            let (abort, _) = AbortHandle::new_pair();
            Arc::new(TaskState::new(task, phase, Priority::Low, abort))
        })
    }

    fn loc(offset: u64) -> GlobalPtr {
        GlobalPtr::new(0, SegmentId(1), TeamId::ALL, offset)
    }

    fn same(a: &[Arc<TaskState>], b: &[&Arc<TaskState>]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| Arc::ptr_eq(x, y))
    }

    #[test]
    fn reader_waits_for_writer() {
        let arena = TaskArena::default();
        let table = DepTable::new();
        let w = new_task(&arena, 0);
        let r = new_task(&arena, 0);
        assert!(table.register(DepKind::Out, &loc(0), 0, &w).is_empty());
        assert!(same(&table.register(DepKind::In, &loc(0), 0, &r), &[&w]));
        // other locations are independent
        assert!(table.register(DepKind::In, &loc(8), 0, &r).is_empty());
    }

    #[test]
    fn writer_waits_for_writer_and_readers() {
        let arena = TaskArena::default();
        let table = DepTable::new();
        let w1 = new_task(&arena, 0);
        let r1 = new_task(&arena, 0);
        let r2 = new_task(&arena, 0);
        let w2 = new_task(&arena, 0);
        table.register(DepKind::Out, &loc(0), 0, &w1);
        table.register(DepKind::In, &loc(0), 0, &r1);
        table.register(DepKind::In, &loc(0), 0, &r2);
        assert!(same(&table.register(DepKind::InOut, &loc(0), 0, &w2), &[&w1, &r1, &r2]));
        let r3 = new_task(&arena, 0);
        assert!(same(&table.register(DepKind::In, &loc(0), 0, &r3), &[&w2]));
    }

    #[test]
    fn own_read_is_not_a_predecessor() {
        let arena = TaskArena::default();
        let table = DepTable::new();
        let w = new_task(&arena, 0);
        let t = new_task(&arena, 0);
        table.register(DepKind::Out, &loc(0), 0, &w);
        assert!(same(&table.register(DepKind::In, &loc(0), 0, &t), &[&w]));
        assert!(same(&table.register(DepKind::Out, &loc(0), 0, &t), &[&w]));
        assert!(table.register(DepKind::InOut, &loc(0), 0, &t).is_empty());
    }

    #[test]
    fn phases_limit_matching() {
        let arena = TaskArena::default();
        let table = DepTable::new();
        let w0 = new_task(&arena, 0);
        let w2 = new_task(&arena, 2);
        table.register(DepKind::Out, &loc(0), 0, &w0);
        table.register(DepKind::Out, &loc(0), 2, &w2);
        let r = new_task(&arena, 1);
        assert!(same(&table.register(DepKind::In, &loc(0), 1, &r), &[&w0]));
        assert!(Arc::ptr_eq(&table.latest_writer(&loc(0), 5).unwrap(), &w2));
        assert!(Arc::ptr_eq(&table.latest_writer(&loc(0), 1).unwrap(), &w0));
    }

    #[test]
    fn finished_tasks_are_pruned() {
        let arena = TaskArena::default();
        let table = DepTable::new();
        let w = new_task(&arena, 0);
        table.register(DepKind::Out, &loc(0), 0, &w);
        w.finish();
        assert!(table.latest_writer(&loc(0), 0).is_none());
        let r = new_task(&arena, 0);
        assert!(table.register(DepKind::In, &loc(0), 0, &r).is_empty());
        table.clear();
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn flags_are_ignored() {
        let arena = TaskArena::default();
        let table = DepTable::new();
        let w = new_task(&arena, 0);
        let r = new_task(&arena, 0);
        table.register(DepKind::Out, &loc(0).with_flags(3), 0, &w);
        assert_eq!(table.register(DepKind::In, &loc(0), 0, &r).len(), 1);
    }
}
