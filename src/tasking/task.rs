use crate::tasking::scheduler::TaskRunnable;
use crate::tasking::{Priority, TaskRef};

use futures::future::AbortHandle;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskMeta {
    pub(crate) priority: Priority,
    pub(crate) task: TaskRef,
}

/// Life cycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    Created = 0,
    Runnable = 1,
    Running = 2,
    Finished = 3,
    Canceled = 4,
}

impl From<u8> for TaskStatus {
    fn from(val: u8) -> TaskStatus {
        match val {
            0 => TaskStatus::Created,
            1 => TaskStatus::Runnable,
            2 => TaskStatus::Running,
            3 => TaskStatus::Finished,
            _ => TaskStatus::Canceled,
        }
    }
}

/// Who to notify when a task finishes.
#[derive(Debug)]
pub(crate) enum Successor {
    Local(Arc<TaskState>),
    /// a task on `unit` waiting through a remote dependency
    Remote { unit: usize, task: TaskRef },
}

pub(crate) struct TaskState {
    pub(crate) task: TaskRef,
    pub(crate) phase: u64,
    pub(crate) priority: Priority,
    // starts at one, released once creation has linked every dependency
    outstanding: AtomicUsize,
    // `None` once finished
    successors: Mutex<Option<Vec<Successor>>>,
    runnable: Mutex<Option<TaskRunnable>>,
    abort: AbortHandle,
    status: AtomicU8,
}

impl std::fmt::Debug for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TaskState")
            .field("task", &self.task)
            .field("phase", &self.phase)
            .field("priority", &self.priority)
            .field("outstanding", &self.outstanding.load(Ordering::SeqCst))
            .field("status", &self.status())
            .finish()
    }
}

impl TaskState {
    pub(crate) fn new(task: TaskRef, phase: u64, priority: Priority, abort: AbortHandle) -> TaskState {
        TaskState {
            task,
            phase,
            priority,
            outstanding: AtomicUsize::new(1),
            successors: Mutex::new(Some(Vec::new())),
            runnable: Mutex::new(None),
            abort,
            status: AtomicU8::new(TaskStatus::Created as u8),
        }
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.status.load(Ordering::SeqCst).into()
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub(crate) fn set_runnable(&self, runnable: TaskRunnable) {
        *self.runnable.lock() = Some(runnable);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.successors.lock().is_none()
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Link `succ` to run after this task; false when this task already finished.
    pub(crate) fn add_successor(&self, succ: Successor) -> bool {
        match self.successors.lock().as_mut() {
            Some(successors) => {
                successors.push(succ);
                true
            }
            None => false,
        }
    }

    /// Make `self` wait for `pred`.
    pub(crate) fn depend_on(self: &Arc<Self>, pred: &TaskState) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if !pred.add_successor(Successor::Local(self.clone())) {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Count a dependency that is released by a message from another unit.
    pub(crate) fn depend_on_remote(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one outstanding dependency, scheduling the task on the last one.
    pub(crate) fn release_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(runnable) = self.runnable.lock().take() {
                if self.status() != TaskStatus::Canceled {
                    self.set_status(TaskStatus::Runnable);
                }
                runnable.schedule();
            }
        }
    }

    /// Mark finished and hand back the successors to notify.
    pub(crate) fn finish(&self) -> Vec<Successor> {
        if self.status() != TaskStatus::Canceled {
            self.set_status(TaskStatus::Finished);
        }
        self.successors.lock().take().unwrap_or_default()
    }

    pub(crate) fn abort(&self) {
        self.abort.abort();
    }

    fn take_runnable(&self) -> Option<TaskRunnable> {
        self.runnable.lock().take()
    }
}

struct Slot {
    generation: u32,
    state: Option<Arc<TaskState>>,
}

#[derive(Default)]
struct ArenaInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Live tasks of this unit indexed by [TaskRef].
#[derive(Default)]
pub(crate) struct TaskArena {
    inner: Mutex<ArenaInner>,
}

impl std::fmt::Debug for TaskArena {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TaskArena").field("live", &self.len()).finish()
    }
}

impl TaskArena {
    /// Reserve a slot, building the task with the ref it will be known by.
    pub(crate) fn insert_with(&self, build: impl FnOnce(TaskRef) -> Arc<TaskState>) -> Arc<TaskState> {
        let mut inner = self.inner.lock();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    state: None,
                });
                (inner.slots.len() - 1) as u32
            }
        };
        let slot = &mut inner.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        let state = build(TaskRef {
            index,
            generation: slot.generation,
        });
        slot.state = Some(state.clone());
        state
    }

    pub(crate) fn get(&self, task: TaskRef) -> Option<Arc<TaskState>> {
        let inner = self.inner.lock();
        inner
            .slots
            .get(task.index as usize)
            .filter(|slot| slot.generation == task.generation)
            .and_then(|slot| slot.state.clone())
    }

    pub(crate) fn remove(&self, task: TaskRef) -> Option<Arc<TaskState>> {
        let mut inner = self.inner.lock();
        let state = match inner.slots.get_mut(task.index as usize) {
            Some(slot) if slot.generation == task.generation => slot.state.take(),
            _ => None,
        };
        if state.is_some() {
            inner.free.push(task.index);
        }
        state
    }

    pub(crate) fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.len() - inner.free.len()
    }

    pub(crate) fn abort_all(&self) {
        let live: Vec<_> = {
            let inner = self.inner.lock();
            inner.slots.iter().filter_map(|s| s.state.clone()).collect()
        };
        for state in live {
            state.abort();
        }
    }

    /// Forget every task, dropping the runnables of those never scheduled.
    pub(crate) fn clear(&self) {
        let states: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.free.clear();
            inner.slots.drain(..).filter_map(|s| s.state).collect()
        };
        for state in states {
            drop(state.take_runnable());
        }
    }
}
