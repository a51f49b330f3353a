use crate::amq::AmQueue;
use crate::comm::CommEngine;
use crate::env_var::{config, AmqImpl, Config};
use crate::error::{DartError, DartResult};
use crate::gptr::{GlobalPtr, TeamId};
use crate::segment::LocalPool;
use crate::tasking::TaskRuntime;
use crate::team::{Team, TeamRegistry};
use crate::error::invalid;
use crate::transport::{
    Backend, LocalTransport, ShmemJob, ShmemTransport, Transport, TransportInfo, TransportMem,
};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::ThreadId;

/// Thread support level, in increasing order of permissiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ThreadLevel {
    /// only the master thread exists
    Single,
    /// only the master thread calls into the runtime
    Funneled,
    /// any thread, one at a time
    Serialized,
    #[default]
    Multiple,
}

/// The context of one unit: teams, segments, communication, queues and
/// the task runtime.
pub struct Runtime {
    pub(crate) me: Weak<Runtime>,
    pub(crate) my_unit: usize,
    pub(crate) num_units: usize,
    pub(crate) config: Config,
    pub(crate) thread_level: ThreadLevel,
    pub(crate) master: ThreadId,
    pub(crate) transport: Arc<Transport>,
    pub(crate) teams: TeamRegistry,
    pub(crate) local_pool: LocalPool,
    pub(crate) comm: CommEngine,
    pub(crate) default_amq: OnceLock<AmQueue>,
    pub(crate) tasking: TaskRuntime,
    finalized: AtomicBool,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("my_unit", &self.my_unit)
            .field("num_units", &self.num_units)
            .field("backend", &self.transport.backend())
            .field("teams", &self.teams.ids())
            .field("tasking", &self.tasking)
            .finish()
    }
}

impl Runtime {
    #[tracing::instrument(skip_all, level = "debug")]
    fn init(transport: Transport, config: Config, thread_level: ThreadLevel) -> DartResult<Arc<Runtime>> {
        let transport = Arc::new(transport);
        let my_unit = transport.my_unit();
        let num_units = transport.num_units();
        let root = Team::new(&transport, TeamId::ALL, None, (0..num_units).collect(), my_unit)?;
        let local_pool = LocalPool::new(&transport, &root, config.local_heap_size)?;
        let comm = CommEngine::new(transport.clone(), config.sharedmem_enable);
        let tasking = TaskRuntime::new(config.task_num_threads);
        let rt = Arc::new_cyclic(|me| Runtime {
            me: me.clone(),
            my_unit,
            num_units,
            config: config.clone(),
            thread_level,
            master: std::thread::current().id(),
            transport,
            teams: TeamRegistry::new(root),
            local_pool,
            comm,
            default_amq: OnceLock::new(),
            tasking,
            finalized: AtomicBool::new(false),
        });
        let amq = rt.amq_open(config.amq_msg_size, config.amq_msg_count, TeamId::ALL)?;
        if rt.default_amq.set(amq).is_err() {
            return Err(DartError::Other("default queue opened twice".to_string()));
        }
        rt.tasking
            .pool
            .start(Arc::downgrade(&rt), my_unit, config.bind_threads);
        rt.barrier(TeamId::ALL)?;
        tracing::debug!("unit {} of {} initialized", my_unit, num_units);
        Ok(rt)
    }

    pub fn my_unit(&self) -> usize {
        self.my_unit
    }

    pub fn num_units(&self) -> usize {
        self.num_units
    }

    pub fn backend(&self) -> Backend {
        self.transport.backend()
    }

    pub fn thread_level(&self) -> ThreadLevel {
        self.thread_level
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bytes of registered memory held by this unit.
    pub fn registered_bytes(&self) -> usize {
        self.transport.occupied()
    }

    /// Process the default queue if no other thread is doing so.
    pub fn progress(&self) -> usize {
        match self.default_amq.get() {
            Some(amq) => amq.process().unwrap_or_else(|e| {
                tracing::warn!("processing the default queue failed: {}", e);
                0
            }),
            None => 0,
        }
    }

    /// Tear the unit down. Collective over the root team.
    ///
    /// Completes outstanding tasks, stops the worker pool, closes the
    /// default queue, frees every live segment and destroys every team.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn finalize(&self) -> DartResult<()> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.drain_tasks()?;
        self.tasking.pool.shutdown();
        if let Some(amq) = self.default_amq.get() {
            amq.shutdown()?;
        }
        let mut teams = self.teams.ids();
        teams.reverse();
        for team in teams {
            let t = self.teams.get(team)?;
            let ids = t.segments.read().ids();
            for id in ids {
                let unit = if id.is_attached() { self.my_unit } else { 0 };
                tracing::debug!("freeing live segment {} of {} at finalize", id, team);
                self.segment_free(GlobalPtr::new(unit, id, team, 0))?;
            }
            if team != TeamId::ALL {
                self.team_destroy(team)?;
            }
        }
        self.comm.flush_all();
        self.barrier(TeamId::ALL)?;
        self.local_pool.release(&self.transport)?;
        tracing::debug!("unit {} finalized", self.my_unit);
        Ok(())
    }
}

/// Name for a job private to this process.
fn unique_job_name() -> String {
    static JOBS: AtomicUsize = AtomicUsize::new(0);
    format!("p{}_{}", std::process::id(), JOBS.fetch_add(1, Ordering::Relaxed))
}

/// Owns the [Runtime] of one unit; dropping the world finalizes it.
///
/// # Examples
///```no_run
/// use dart::WorldBuilder;
///
/// let world = WorldBuilder::new().build().unwrap();
/// let seg = world.segment_alloc_sym(world.team_all(), 64).unwrap();
/// world.put_value(&seg, 42u64).unwrap();
///```
pub struct World {
    rt: Arc<Runtime>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "World({:?})", self.rt)
    }
}

impl std::ops::Deref for World {
    type Target = Runtime;

    fn deref(&self) -> &Runtime {
        &self.rt
    }
}

impl World {
    /// A shared handle to this unit's runtime, e.g. for threads.
    pub fn runtime(&self) -> Arc<Runtime> {
        self.rt.clone()
    }
}

impl Drop for World {
    #[tracing::instrument(skip_all, level = "debug")]
    fn drop(&mut self) {
        if std::thread::panicking() {
            // the other units may never join a collective
            self.rt.tasking.pool.shutdown();
            return;
        }
        if let Err(e) = self.rt.finalize() {
            tracing::error!("finalize of unit {} failed: {}", self.rt.my_unit, e);
            self.rt.tasking.pool.shutdown();
        }
    }
}

/// An implementation of the Builder design pattern, used to construct a [World].
///
/// Defaults come from the `DART_*` environment, see [Config].
///
/// # Examples
///```no_run
/// use dart::{Backend, WorldBuilder};
///
/// let sums = WorldBuilder::new()
///     .with_backend(Backend::Shmem)
///     .with_threads(2)
///     .launch(4, |world| world.my_unit() * 10);
/// assert_eq!(sums, vec![0, 10, 20, 30]);
///```
#[derive(Debug, Clone)]
pub struct WorldBuilder {
    backend: Backend,
    config: Config,
    thread_level: ThreadLevel,
}

impl Default for WorldBuilder {
    fn default() -> Self {
        WorldBuilder::new()
    }
}

impl WorldBuilder {
    pub fn new() -> WorldBuilder {
        WorldBuilder {
            backend: Backend::default(),
            config: config().clone(),
            thread_level: ThreadLevel::default(),
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> WorldBuilder {
        self.backend = backend;
        self
    }

    /// Task threads per unit, including the master thread.
    pub fn with_threads(mut self, num_threads: usize) -> WorldBuilder {
        self.config.task_num_threads = num_threads;
        self
    }

    pub fn with_amq_impl(mut self, amq_impl: AmqImpl) -> WorldBuilder {
        self.config.amq_impl = amq_impl;
        self
    }

    /// Payload size and number of messages of the default queue.
    pub fn with_amq_size(mut self, msg_size: usize, msg_count: usize) -> WorldBuilder {
        self.config.amq_msg_size = msg_size;
        self.config.amq_msg_count = msg_count;
        self
    }

    pub fn with_sharedmem(mut self, enable: bool) -> WorldBuilder {
        self.config.sharedmem_enable = enable;
        self
    }

    pub fn with_logging(mut self, enable: bool) -> WorldBuilder {
        self.config.enable_logging = enable;
        self
    }

    pub fn with_local_heap_size(mut self, nbytes: usize) -> WorldBuilder {
        self.config.local_heap_size = nbytes;
        self
    }

    pub fn with_deadlock_timeout(mut self, secs: f64) -> WorldBuilder {
        self.config.deadlock_timeout = secs;
        self
    }

    /// Place this process in a shared-memory job of `num_units` units,
    /// overriding `DART_NUM_UNITS`, `DART_UNIT_ID` and `DART_JOB_ID`.
    pub fn with_job(mut self, num_units: usize, unit_id: usize, job_id: usize) -> WorldBuilder {
        self.config.num_units = num_units;
        self.config.unit_id = unit_id;
        self.config.job_id = Some(job_id);
        self
    }

    pub fn with_shmem_heap_size(mut self, nbytes: usize) -> WorldBuilder {
        self.config.shmem_heap_size = nbytes;
        self
    }

    /// Request a thread support level; every level is granted.
    pub fn with_thread_level(mut self, level: ThreadLevel) -> WorldBuilder {
        self.thread_level = level;
        self
    }

    fn init_logging(&self) {
        if self.config.enable_logging {
            let _ = tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_max_level(tracing::Level::TRACE)
                .try_init();
        }
    }

    fn build_on(self, transport: Transport) -> DartResult<World> {
        self.init_logging();
        let rt = Runtime::init(transport, self.config, self.thread_level)?;
        Ok(World { rt })
    }

    fn shmem_job(&self, name: String, num_units: usize, my_unit: usize) -> ShmemJob {
        ShmemJob {
            name,
            num_units,
            my_unit,
            heap_size: self.config.shmem_heap_size,
            deadlock_timeout: self.config.deadlock_timeout,
        }
    }

    /// Build the world of the calling process.
    ///
    /// With [Backend::Shmem] every process of a job calls `build` with the
    /// same `DART_NUM_UNITS` and `DART_JOB_ID` and its own `DART_UNIT_ID`
    /// (or [WorldBuilder::with_job]); the call returns once every unit has
    /// joined. Without a job the process is a job of one unit.
    pub fn build(self) -> DartResult<World> {
        match self.backend {
            Backend::Local => self.build_on(LocalTransport::new().into()),
            Backend::Shmem => {
                let num_units = self.config.num_units.max(1);
                let name = match self.config.job_id {
                    Some(id) => id.to_string(),
                    None if num_units == 1 => unique_job_name(),
                    None => return invalid("DART_JOB_ID must be set for a job of more than one unit"),
                };
                let job = self.shmem_job(name, num_units, self.config.unit_id);
                let transport = ShmemTransport::new(&job)?;
                self.build_on(transport.into())
            }
        }
    }

    /// Run `f` on `num_units` units, each a thread of this process with its
    /// own [World], and collect their results in unit order.
    ///
    /// More than one unit always uses [Backend::Shmem]: every unit maps the
    /// others' memory exactly as separate processes would.
    /// A panic on any unit is re-raised once every unit has returned.
    pub fn launch<F, R>(self, num_units: usize, f: F) -> Vec<R>
    where
        F: Fn(World) -> R + Send + Sync,
        R: Send,
    {
        let num_units = std::cmp::max(1, num_units);
        if num_units == 1 && self.backend == Backend::Local {
            let world = match self.build() {
                Ok(world) => world,
                Err(e) => panic!("failed to build world: {}", e),
            };
            return vec![f(world)];
        }
        let name = unique_job_name();
        let f = &f;
        let results = std::thread::scope(|s| {
            let handles = (0..num_units)
                .map(|unit| {
                    let builder = self.clone();
                    let job = self.shmem_job(name.clone(), num_units, unit);
                    std::thread::Builder::new()
                        .name(format!("dart_unit_{}", unit))
                        .spawn_scoped(s, move || {
                            let world = ShmemTransport::new(&job)
                                .and_then(|transport| builder.build_on(transport.into()));
                            match world {
                                Ok(world) => f(world),
                                Err(e) => panic!("unit {} failed to initialize: {}", unit, e),
                            }
                        })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| match h {
                    Ok(h) => h.join(),
                    Err(e) => Err(Box::new(e) as Box<dyn std::any::Any + Send>),
                })
                .collect::<Vec<_>>()
        });
        let mut out = Vec::with_capacity(num_units);
        for res in results {
            match res {
                Ok(r) => out.push(r),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        out
    }
}
