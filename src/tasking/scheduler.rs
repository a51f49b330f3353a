use crate::tasking::task::TaskMeta;
use crate::tasking::Priority;
use crate::Runtime;

use async_task::{Runnable, ScheduleInfo};
use core_affinity::CoreId;
use crossbeam::deque::{Injector, Stealer, Worker};
use parking_lot::{Condvar, Mutex, RwLock};
use rand::rngs::ThreadRng;
use rand::Rng;
use std::panic;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use thread_local::ThreadLocal;

pub(crate) type TaskRunnable = Runnable<TaskMeta>;

const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Run queues shared by the master and the workers of one unit.
pub(crate) struct Queues {
    high: Injector<TaskRunnable>,
    low: Injector<TaskRunnable>,
    local: ThreadLocal<Worker<TaskRunnable>>,
    stealers: RwLock<Vec<Stealer<TaskRunnable>>>,
    sleep: Mutex<()>,
    wake: Condvar,
}

impl std::fmt::Debug for Queues {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Queues")
            .field("high", &self.high.len())
            .field("low", &self.low.len())
            .field("workers", &self.stealers.read().len())
            .finish()
    }
}

impl Queues {
    fn new() -> Queues {
        Queues {
            high: Injector::new(),
            low: Injector::new(),
            local: ThreadLocal::new(),
            stealers: RwLock::new(Vec::new()),
            sleep: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    fn register_worker(&self) {
        self.local.get_or(|| {
            let worker = Worker::new_lifo();
            self.stealers.write().push(worker.stealer());
            worker
        });
    }

    /// Schedule function of every task runnable.
    pub(crate) fn push(&self, runnable: TaskRunnable, info: ScheduleInfo) {
        if runnable.metadata().priority == Priority::High {
            self.high.push(runnable);
        } else if info.woken_while_running {
            // yielded, let the other queued tasks go first
            self.low.push(runnable);
        } else if let Some(worker) = self.local.get() {
            worker.push(runnable);
        } else {
            self.low.push(runnable);
        }
        self.wake.notify_one();
    }

    fn pop(&self, rng: &mut ThreadRng) -> Option<TaskRunnable> {
        if let Some(runnable) = std::iter::repeat_with(|| self.high.steal())
            .find(|s| !s.is_retry())
            .and_then(|s| s.success())
        {
            return Some(runnable);
        }
        if let Some(worker) = self.local.get() {
            if let Some(runnable) = worker.pop() {
                return Some(runnable);
            }
            if let Some(runnable) = std::iter::repeat_with(|| self.low.steal_batch_and_pop(worker))
                .find(|s| !s.is_retry())
                .and_then(|s| s.success())
            {
                return Some(runnable);
            }
        } else if let Some(runnable) = std::iter::repeat_with(|| self.low.steal())
            .find(|s| !s.is_retry())
            .and_then(|s| s.success())
        {
            return Some(runnable);
        }
        let stealers = self.stealers.read();
        if stealers.is_empty() {
            return None;
        }
        let victim = rng.gen_range(0..stealers.len());
        stealers[victim].steal().success()
    }

    fn is_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty() && self.local.get().map_or(true, |w| w.is_empty())
    }
}

/// `T - 1` worker threads; the master thread is the `T`-th executor.
pub(crate) struct WorkerPool {
    pub(crate) queues: Arc<Queues>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    num_threads: usize,
    active_cnt: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_threads", &self.num_threads)
            .field("queues", &self.queues)
            .finish()
    }
}

impl WorkerPool {
    pub(crate) fn new(num_threads: usize) -> WorkerPool {
        WorkerPool {
            queues: Arc::new(Queues::new()),
            threads: Mutex::new(Vec::new()),
            num_threads: std::cmp::max(1, num_threads),
            active_cnt: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Spawn the workers; they poll the default queue of `rt` while idle.
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn start(&self, rt: Weak<Runtime>, my_unit: usize, bind_threads: bool) {
        let core_ids = match core_affinity::get_core_ids() {
            Some(core_ids) if !core_ids.is_empty() => core_ids,
            _ => vec![CoreId { id: 0 }],
        };
        let mut threads = self.threads.lock();
        for i in 0..self.num_threads - 1 {
            let queues = self.queues.clone();
            let active_cnt = self.active_cnt.clone();
            let shutdown = self.shutdown.clone();
            let rt = rt.clone();
            let core = core_ids[(my_unit * self.num_threads + i + 1) % core_ids.len()];
            let builder = thread::Builder::new().name(format!("dart_worker_{}_{}", my_unit, i));
            let spawned = builder.spawn(move || {
                if bind_threads {
                    core_affinity::set_for_current(core);
                }
                queues.register_worker();
                active_cnt.fetch_add(1, Ordering::SeqCst);
                let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
                    worker_loop(&queues, &shutdown, &rt)
                }));
                if let Err(e) = res {
                    tracing::error!("task panicked on worker thread {}: {:?}", i, e);
                    process::exit(1);
                }
                active_cnt.fetch_sub(1, Ordering::SeqCst);
            });
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => tracing::error!("failed to spawn worker thread: {}", e),
            }
        }
        while self.active_cnt.load(Ordering::SeqCst) != threads.len() {
            thread::yield_now();
        }
        tracing::debug!("unit {} started {} worker threads", my_unit, threads.len());
    }

    /// Run one queued task on the calling thread.
    pub(crate) fn run_one(&self) -> bool {
        let mut rng = rand::thread_rng();
        match self.queues.pop(&mut rng) {
            Some(runnable) => {
                runnable.run();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_worker_thread(&self) -> bool {
        self.queues.local.get().is_some()
    }

    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.queues.wake.notify_all();
        let my_id = thread::current().id();
        let mut threads = self.threads.lock();
        while let Some(thread) = threads.pop() {
            if thread.thread().id() != my_id {
                let _res = thread.join();
            }
        }
    }
}

fn worker_loop(queues: &Queues, shutdown: &AtomicBool, rt: &Weak<Runtime>) {
    let mut rng = rand::thread_rng();
    while !shutdown.load(Ordering::SeqCst) || !queues.is_empty() {
        if let Some(runnable) = queues.pop(&mut rng) {
            runnable.run();
            continue;
        }
        let progressed = match rt.upgrade() {
            Some(rt) => rt.progress() > 0,
            None => false,
        };
        if !progressed {
            let mut guard = queues.sleep.lock();
            if queues.is_empty() && !shutdown.load(Ordering::SeqCst) {
                queues.wake.wait_for(&mut guard, IDLE_WAIT);
            }
        }
    }
}
