//! Tasks with data dependencies on global memory.
//!
//! A task is an async action scheduled on the unit's worker pool once every
//! dependency it declared has been released. Dependencies name global
//! memory locations: a task reading a location runs after the latest
//! earlier writer of that location, a writer runs after the previous writer
//! and every reader in between. Dependencies only match tasks of the same or
//! an earlier phase. Locations owned by other units are matched by their
//! owner through the default active-message queue.

pub(crate) mod deps;
pub(crate) mod remote;
pub(crate) mod scheduler;
pub(crate) mod task;

pub use task::TaskStatus;

use crate::error::{invalid, DartError, DartResult};
use crate::gptr::GlobalPtr;
use crate::warnings::{DeadlockTimer, RuntimeWarning};
use crate::Runtime;
use deps::DepTable;
use remote::{Deferred, RemoteDep};
use scheduler::WorkerPool;
use task::{Successor, TaskArena, TaskMeta, TaskState};

use async_task::{Builder, ScheduleInfo, Task, WithInfo};
use futures::future::{AbortHandle, Abortable};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tracing::{trace_span, Instrument};

/// Scheduling class of a task; high priority tasks are always taken first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Low,
    High,
}

/// Identifies a live task on the unit that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// How a task accesses a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    In,
    Out,
    InOut,
}

/// A dependency of a task about to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    /// Access to the location `gptr`; `phase` defaults to the creation phase.
    Data {
        kind: DepKind,
        gptr: GlobalPtr,
        phase: Option<u64>,
    },
    /// Run after the given task of this unit.
    Direct(TaskRef),
    Ignore,
}

impl Dependency {
    pub fn input(gptr: GlobalPtr) -> Dependency {
        Dependency::Data {
            kind: DepKind::In,
            gptr,
            phase: None,
        }
    }

    pub fn output(gptr: GlobalPtr) -> Dependency {
        Dependency::Data {
            kind: DepKind::Out,
            gptr,
            phase: None,
        }
    }

    pub fn inout(gptr: GlobalPtr) -> Dependency {
        Dependency::Data {
            kind: DepKind::InOut,
            gptr,
            phase: None,
        }
    }

    pub fn direct(task: TaskRef) -> Dependency {
        Dependency::Direct(task)
    }

    pub fn ignore() -> Dependency {
        Dependency::Ignore
    }

    /// Match writers up to `phase` instead of the creation phase.
    pub fn at_phase(self, phase: u64) -> Dependency {
        match self {
            Dependency::Data { kind, gptr, .. } => Dependency::Data {
                kind,
                gptr,
                phase: Some(phase),
            },
            other => other,
        }
    }
}

/// Result of a task created with [Runtime::task_create_handle].
///
/// Resolves to `None` when the task was canceled. Dropping the handle does
/// not cancel the task.
#[must_use = "task handles do nothing unless awaited or passed to task_wait"]
pub struct TaskHandle<T> {
    task: Option<Task<Option<T>, TaskMeta>>,
    task_ref: TaskRef,
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task", &self.task_ref)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T> TaskHandle<T> {
    /// For [Dependency::direct].
    pub fn task_ref(&self) -> TaskRef {
        self.task_ref
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.task.as_mut() {
            Some(task) => match Pin::new(task).poll(cx) {
                Poll::Ready(res) => {
                    self.task = None;
                    Poll::Ready(res)
                }
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Ready(None),
        }
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.detach();
        }
    }
}

/// Passed to every task action.
#[derive(Clone)]
pub struct TaskContext {
    rt: Arc<Runtime>,
    task: TaskRef,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TaskContext").field("task", &self.task).finish()
    }
}

struct YieldNow {
    remaining: usize,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.remaining == 0 {
            Poll::Ready(())
        } else {
            self.remaining -= 1;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

impl TaskContext {
    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub fn task_ref(&self) -> TaskRef {
        self.task
    }

    /// Let the other queued tasks run before continuing.
    pub async fn yield_now(&self) {
        self.yield_for(1).await
    }

    /// Go back to the end of the ready queue `count` times in a row.
    /// `yield_for(0)` returns immediately.
    pub async fn yield_for(&self, count: usize) {
        YieldNow { remaining: count }.await
    }

    pub fn create<F, Fut>(&self, deps: &[Dependency], priority: Priority, action: F) -> DartResult<()>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.rt.task_create(deps, priority, action)
    }

    pub fn create_handle<F, Fut>(
        &self,
        deps: &[Dependency],
        priority: Priority,
        action: F,
    ) -> DartResult<TaskHandle<Fut::Output>>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.rt.task_create_handle(deps, priority, action)
    }

    /// Cancel the tasks of every unit. Never resolves: the calling task is
    /// unwound at this point.
    pub async fn cancel_bcast(&self) {
        if let Err(e) = self.rt.task_cancel_bcast() {
            tracing::error!("cancellation broadcast failed: {}", e);
        }
        futures::future::pending::<()>().await
    }

    /// Cancel the tasks of this unit and wait for every unit to do the
    /// same. Never resolves.
    pub async fn cancel_barrier(&self) {
        if let Err(e) = self.rt.task_cancel_barrier() {
            tracing::error!("cancellation barrier failed: {}", e);
        }
        futures::future::pending::<()>().await
    }
}

/// Marks the task finished when its future completes or is dropped.
struct FinishGuard {
    rt: Weak<Runtime>,
    state: Arc<TaskState>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if let Some(rt) = self.rt.upgrade() {
            rt.task_finished(&self.state);
        }
    }
}

pub(crate) struct TaskRuntime {
    pub(crate) arena: TaskArena,
    pub(crate) deps: DepTable,
    pub(crate) pool: WorkerPool,
    pub(crate) phase: AtomicU64,
    pub(crate) matching_open: AtomicBool,
    pub(crate) deferred: Mutex<Vec<Deferred>>,
    active: AtomicUsize,
    abort: AtomicBool,
}

impl std::fmt::Debug for TaskRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TaskRuntime")
            .field("active", &self.active.load(Ordering::SeqCst))
            .field("phase", &self.phase.load(Ordering::SeqCst))
            .field("arena", &self.arena)
            .field("pool", &self.pool)
            .finish()
    }
}

impl TaskRuntime {
    pub(crate) fn new(num_threads: usize) -> TaskRuntime {
        TaskRuntime {
            arena: TaskArena::default(),
            deps: DepTable::new(),
            pool: WorkerPool::new(num_threads),
            phase: AtomicU64::new(0),
            matching_open: AtomicBool::new(false),
            deferred: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            abort: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Stop every task of this unit at its next cancellation point.
    pub(crate) fn cancel_local(&self) {
        if !self.abort.swap(true, Ordering::SeqCst) {
            tracing::debug!("canceling {} live tasks", self.arena.len());
        }
        self.arena.abort_all();
    }

    fn reset(&self) {
        self.deps.clear();
        self.deferred.lock().clear();
        self.arena.clear();
        self.phase.store(0, Ordering::SeqCst);
        self.matching_open.store(false, Ordering::SeqCst);
        self.abort.store(false, Ordering::SeqCst);
    }
}

impl Runtime {
    /// Create a task that runs `action` once `deps` are satisfied.
    pub fn task_create<F, Fut>(&self, deps: &[Dependency], priority: Priority, action: F) -> DartResult<()>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.task_create_handle(deps, priority, action).map(drop)
    }

    /// [Runtime::task_create] returning a handle to the task's result.
    pub fn task_create_handle<F, Fut>(
        &self,
        deps: &[Dependency],
        priority: Priority,
        action: F,
    ) -> DartResult<TaskHandle<Fut::Output>>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        for dep in deps {
            if let Dependency::Data { gptr, .. } = dep {
                self.gptr_owner(gptr)?;
            }
        }
        let tasking = &self.tasking;
        let phase = tasking.phase.load(Ordering::SeqCst);
        let (abort_handle, abort_reg) = AbortHandle::new_pair();
        let state = tasking
            .arena
            .insert_with(|task| Arc::new(TaskState::new(task, phase, priority, abort_handle)));
        let task_ref = state.task;

        let me = self.me.clone();
        let guard_state = state.clone();
        let fut = async move {
            let _guard = FinishGuard {
                rt: me.clone(),
                state: guard_state.clone(),
            };
            let rt = me.upgrade()?;
            if rt.tasking.is_canceled() || guard_state.status() == TaskStatus::Canceled {
                guard_state.set_status(TaskStatus::Canceled);
                return None;
            }
            guard_state.set_status(TaskStatus::Running);
            let ctx = TaskContext {
                rt: rt.clone(),
                task: task_ref,
            };
            drop(rt);
            match Abortable::new(action(ctx), abort_reg).await {
                Ok(res) => Some(res),
                Err(_) => {
                    guard_state.set_status(TaskStatus::Canceled);
                    None
                }
            }
        }
        .instrument(trace_span!("task", index = task_ref.index));

        let queues = tasking.pool.queues.clone();
        let schedule = move |runnable: scheduler::TaskRunnable, info: ScheduleInfo| {
            queues.push(runnable, info)
        };
        let (runnable, task) = Builder::new()
            .metadata(TaskMeta { priority, task: task_ref })
            .spawn(move |_meta| fut, WithInfo(schedule));
        state.set_runnable(runnable);
        tasking.active.fetch_add(1, Ordering::SeqCst);

        for dep in deps {
            if let Err(e) = self.link_dependency(&state, dep) {
                // the action is skipped, but the task still drains its bookkeeping
                state.set_status(TaskStatus::Canceled);
                task.detach();
                state.release_one();
                return Err(e);
            }
        }
        state.release_one();
        Ok(TaskHandle {
            task: Some(task),
            task_ref,
        })
    }

    fn link_dependency(&self, state: &Arc<TaskState>, dep: &Dependency) -> DartResult<()> {
        match dep {
            Dependency::Ignore => Ok(()),
            Dependency::Direct(pred) => {
                if let Some(pred) = self.tasking.arena.get(*pred) {
                    state.depend_on(&pred);
                }
                Ok(())
            }
            Dependency::Data { kind, gptr, phase } => {
                let phase = phase.unwrap_or(state.phase);
                let owner = self.gptr_owner(gptr)?;
                if owner != self.my_unit {
                    let dep = RemoteDep {
                        gptr: *gptr,
                        phase,
                        task: state.task,
                    };
                    // released by the owner's answer
                    state.depend_on_remote();
                    if let Err(e) = self.send_remote_dep(owner, &dep) {
                        state.release_one();
                        return Err(e);
                    }
                    return Ok(());
                }
                for pred in self.tasking.deps.register(*kind, gptr, phase, state) {
                    state.depend_on(&pred);
                }
                Ok(())
            }
        }
    }

    pub(crate) fn task_finished(&self, state: &Arc<TaskState>) {
        for succ in state.finish() {
            match succ {
                Successor::Local(succ) => succ.release_one(),
                Successor::Remote { unit, task } => {
                    if let Err(e) = self.send_release(unit, task) {
                        tracing::error!("failed to release {:?} on unit {}: {}", task, unit, e);
                    }
                }
            }
        }
        self.tasking.arena.remove(state.task);
        self.tasking.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of created tasks that have not finished.
    pub fn task_num_active(&self) -> usize {
        self.tasking.active.load(Ordering::SeqCst)
    }

    /// Status of a live task of this unit; `None` once it has finished.
    pub fn task_status(&self, task: TaskRef) -> Option<TaskStatus> {
        self.tasking.arena.get(task).map(|state| state.status())
    }

    pub fn task_num_threads(&self) -> usize {
        self.tasking.pool.num_threads()
    }

    pub fn task_phase(&self) -> u64 {
        self.tasking.phase.load(Ordering::SeqCst)
    }

    /// Start a new phase for subsequently created tasks.
    pub fn task_phase_advance(&self) -> DartResult<u64> {
        let phase = self.tasking.phase.fetch_add(1, Ordering::SeqCst) + 1;
        self.match_deferred(false)?;
        Ok(phase)
    }

    /// Execute tasks on the calling thread until the task of `handle` is done.
    pub fn task_wait<T>(&self, mut handle: TaskHandle<T>) -> DartResult<Option<T>> {
        if self.tasking.pool.is_worker_thread() {
            RuntimeWarning::BlockingCall("task_wait", "handle.await").print();
        }
        let mut timer = DeadlockTimer::new("task_wait", self.config.deadlock_timeout);
        while !handle.is_finished() {
            if !self.tasking.pool.run_one() && self.progress() == 0 {
                std::thread::yield_now();
            }
            timer.check();
        }
        Ok(futures::executor::block_on(&mut handle))
    }

    /// Execute every task of this unit and wait until all units have done so.
    ///
    /// Collective over the root team; only the master thread may call it.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn task_complete(&self) -> DartResult<()> {
        if std::thread::current().id() != self.master {
            return invalid("task_complete must be called from the master thread");
        }
        self.drain_tasks()
    }

    pub(crate) fn drain_tasks(&self) -> DartResult<()> {
        self.tasking.matching_open.store(true, Ordering::SeqCst);
        self.match_deferred(true)?;
        let mut timer = DeadlockTimer::new("task_complete", self.config.deadlock_timeout);
        while self.task_num_active() > 0 {
            if !self.tasking.pool.run_one() && self.progress() == 0 {
                std::thread::yield_now();
            }
            timer.check();
        }
        self.default_queue()?.process_blocking()?;
        if self.task_num_active() > 0 {
            return Err(DartError::Other(format!(
                "{} tasks were created while completing",
                self.task_num_active()
            )));
        }
        self.tasking.reset();
        Ok(())
    }

    /// Cancel the tasks of this unit and of every other unit.
    pub fn task_cancel_bcast(&self) -> DartResult<()> {
        self.tasking.cancel_local();
        self.send_cancel_bcast()
    }

    /// Cancel the tasks of this unit, then wait for every unit to cancel.
    pub fn task_cancel_barrier(&self) -> DartResult<()> {
        self.tasking.cancel_local();
        self.barrier(self.team_all())
    }

    pub fn task_should_abort(&self) -> bool {
        self.tasking.is_canceled()
    }
}

#[cfg(test)]
mod tests {
    use super::YieldNow;
    use futures::task::{waker, ArcWake};
    use std::future::Future;
    use std::pin::pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};

    struct CountWakes(AtomicUsize);

    impl ArcWake for CountWakes {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pending_polls(count: usize) -> (usize, usize) {
        let wakes = Arc::new(CountWakes(AtomicUsize::new(0)));
        let waker = waker(wakes.clone());
        let mut cx = Context::from_waker(&waker);
        let mut fut = pin!(YieldNow { remaining: count });
        let mut pending = 0;
        while fut.as_mut().poll(&mut cx) == Poll::Pending {
            pending += 1;
        }
        (pending, wakes.0.load(Ordering::SeqCst))
    }

    #[test]
    fn yielding_defers_the_requested_number_of_times() {
        assert_eq!(pending_polls(0), (0, 0));
        assert_eq!(pending_polls(1), (1, 1));
        assert_eq!(pending_polls(7), (7, 7));
    }
}
