//! Dependencies on memory owned by other units.
//!
//! A task with a dependency on a remote location sends a registration to the
//! owner over the default queue and counts it as one outstanding
//! dependency. The owner attaches the registration to its latest matching
//! writer and answers with a release once that writer has finished.

use crate::amq::ActionContext;
use crate::error::DartResult;
use crate::gptr::GlobalPtr;
use crate::tasking::task::{Successor, TaskState};
use crate::tasking::TaskRef;
use crate::Runtime;

use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RemoteDep {
    pub(crate) gptr: GlobalPtr,
    pub(crate) phase: u64,
    pub(crate) task: TaskRef,
}

/// A registration waiting for the owner's phase to pass it.
#[derive(Debug, Clone)]
pub(crate) struct Deferred {
    pub(crate) requester: usize,
    pub(crate) dep: RemoteDep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Release {
    task: TaskRef,
}

fn register_remote_dep(ctx: &ActionContext<'_>, payload: &[u8]) {
    let rt = ctx.runtime();
    match crate::deserialize::<RemoteDep>(payload) {
        Ok(dep) => {
            let deferred = Deferred {
                requester: ctx.sender(),
                dep,
            };
            if let Err(e) = rt.defer_or_match(deferred) {
                tracing::error!("failed to match remote dependency: {}", e);
            }
        }
        Err(e) => tracing::error!("malformed remote dependency from {}: {}", ctx.sender(), e),
    }
}
crate::register_action!(register_remote_dep);

fn release_remote_dep(ctx: &ActionContext<'_>, payload: &[u8]) {
    let rt = ctx.runtime();
    match crate::deserialize::<Release>(payload) {
        Ok(release) => match rt.tasking.arena.get(release.task) {
            Some(state) => {
                tracing::trace!("remote release of {:?} from {}", release.task, ctx.sender());
                state.release_one();
            }
            None => tracing::warn!("release from {} for unknown task {:?}", ctx.sender(), release.task),
        },
        Err(e) => tracing::error!("malformed release from {}: {}", ctx.sender(), e),
    }
}
crate::register_action!(release_remote_dep);

fn cancel_remote(ctx: &ActionContext<'_>, _payload: &[u8]) {
    tracing::debug!("cancellation broadcast from unit {}", ctx.sender());
    ctx.runtime().tasking.cancel_local();
}
crate::register_action!(cancel_remote);

impl Runtime {
    /// Ask the owner of `dep.gptr` to release `dep.task` after its writer.
    pub(crate) fn send_remote_dep(&self, owner: usize, dep: &RemoteDep) -> DartResult<()> {
        let token = self.action_id(crate::action_name!(register_remote_dep))?;
        self.default_queue()?.send(owner, token, &crate::serialize(dep)?)
    }

    pub(crate) fn send_release(&self, unit: usize, task: TaskRef) -> DartResult<()> {
        let token = self.action_id(crate::action_name!(release_remote_dep))?;
        self.default_queue()?
            .send(unit, token, &crate::serialize(&Release { task })?)
    }

    pub(crate) fn send_cancel_bcast(&self) -> DartResult<()> {
        let token = self.action_id(crate::action_name!(cancel_remote))?;
        self.default_queue()?.send_bcast(token, &[])
    }

    /// Match `deferred` now if every local writer of its phase has been
    /// created, queue it otherwise.
    pub(crate) fn defer_or_match(&self, deferred: Deferred) -> DartResult<()> {
        {
            let mut pending = self.tasking.deferred.lock();
            if !self.tasking.matching_open.load(Ordering::SeqCst)
                && self.tasking.phase.load(Ordering::SeqCst) <= deferred.dep.phase
            {
                pending.push(deferred);
                return Ok(());
            }
        }
        self.match_remote(deferred)
    }

    /// Match the queued registrations whose phase has been passed, or all of
    /// them when `all` is set.
    pub(crate) fn match_deferred(&self, all: bool) -> DartResult<()> {
        let ready: Vec<Deferred> = {
            let mut pending = self.tasking.deferred.lock();
            let phase = self.tasking.phase.load(Ordering::SeqCst);
            let (ready, waiting) = pending
                .drain(..)
                .partition(|d: &Deferred| all || d.dep.phase < phase);
            *pending = waiting;
            ready
        };
        for deferred in ready {
            self.match_remote(deferred)?;
        }
        Ok(())
    }

    fn match_remote(&self, deferred: Deferred) -> DartResult<()> {
        let Deferred { requester, dep } = deferred;
        let writer: Option<std::sync::Arc<TaskState>> =
            self.tasking.deps.latest_writer(&dep.gptr, dep.phase);
        let linked = writer.map_or(false, |w| {
            w.add_successor(Successor::Remote {
                unit: requester,
                task: dep.task,
            })
        });
        if linked {
            tracing::trace!("unit {} waits on local writer of {}", requester, dep.gptr);
            Ok(())
        } else {
            self.send_release(requester, dep.task)
        }
    }
}
