//! Active-message queues.
//!
//! Each member of a team owns a fixed-size ring inside a symmetric segment.
//! Senders claim space in the target's ring with remote atomics and write
//! `(token, sender, size, payload)` records into it; the owner polls its
//! ring and runs the registered action of every record, in ring order.
//!
//! Actions are plain functions registered with [register_action!]. Tokens
//! are assigned by sorting the registered names, so every unit running the
//! same binary derives the same token for the same action.

pub(crate) mod atomic;
pub(crate) mod nolock;

use crate::env_var::AmqImpl;
use crate::error::{invalid, DartError, DartResult};
use crate::gptr::{GlobalPtr, TeamId};
use crate::warnings::DeadlockTimer;
use crate::Runtime;
use atomic::AtomicQueue;
use nolock::NoLockQueue;

use enum_dispatch::enum_dispatch;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

/// Token identifying a registered action on every unit.
pub type ActionId = u32;

/// Signature of an active-message action.
pub type ActionFn = fn(&ActionContext<'_>, &[u8]);

pub(crate) const ACTION_ID_START: ActionId = 1;

#[doc(hidden)]
pub struct RegisteredAction {
    pub name: &'static str,
    pub exec: ActionFn,
}
crate::inventory::collect!(RegisteredAction);

lazy_static! {
    pub(crate) static ref ACTION_IDS: HashMap<&'static str, ActionId> = {
        let mut actions = vec![];
        for action in crate::inventory::iter::<RegisteredAction> {
            actions.push(action.name);
        }
        actions.sort();
        let mut cnt = ACTION_ID_START;
        let mut temp = HashMap::new();
        let mut duplicates = vec![];
        for action in actions {
            if !temp.contains_key(&action) {
                temp.insert(action, cnt);
                cnt += 1;
            } else {
                duplicates.push(action);
            }
        }
        if !duplicates.is_empty() {
            panic!(
                "duplicate registered actions {:?}, actions must have unique names",
                duplicates
            );
        }
        temp
    };
    pub(crate) static ref ACTION_EXECS: HashMap<ActionId, ActionFn> = {
        let mut temp = HashMap::new();
        for action in crate::inventory::iter::<RegisteredAction> {
            if let Some(id) = ACTION_IDS.get(&action.name) {
                temp.insert(*id, action.exec);
            }
        }
        temp
    };
}

/// Register `fn(&ActionContext, &[u8])` as an active-message action.
///
/// Must be invoked at module level; the action is named
/// `module_path::function`, see [action_name!].
#[macro_export]
macro_rules! register_action {
    ($f:ident) => {
        $crate::inventory::submit! {
            $crate::amq::RegisteredAction {
                name: concat!(module_path!(), "::", stringify!($f)),
                exec: $f,
            }
        }
    };
}

/// Name under which [register_action!] registered `$f` from this module.
#[macro_export]
macro_rules! action_name {
    ($f:ident) => {
        concat!(module_path!(), "::", stringify!($f))
    };
}

/// What an action sees of the unit executing it.
pub struct ActionContext<'a> {
    rt: &'a Runtime,
    team: TeamId,
    sender: usize,
}

impl<'a> ActionContext<'a> {
    pub fn runtime(&self) -> &'a Runtime {
        self.rt
    }

    /// Team-relative id of the sending unit.
    pub fn sender(&self) -> usize {
        self.sender
    }

    pub fn team(&self) -> TeamId {
        self.team
    }
}

pub(crate) const RECORD_HEADER: usize = 16;
pub(crate) const RECORD_ALIGN: usize = 8;

/// Size of the record carrying `payload_len` bytes.
pub fn record_len(payload_len: usize) -> usize {
    RECORD_HEADER + payload_len.div_ceil(RECORD_ALIGN) * RECORD_ALIGN
}

pub(crate) fn encode_record(buf: &mut Vec<u8>, token: ActionId, sender: u32, payload: &[u8]) {
    let start = buf.len();
    buf.extend_from_slice(&token.to_le_bytes());
    buf.extend_from_slice(&sender.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(payload);
    buf.resize(start + record_len(payload.len()), 0);
}

fn read_u32(buf: &[u8], pos: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_le_bytes(raw)
}

/// Iterates the records of a drained queue as `(token, sender, payload)`.
pub(crate) struct Records<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Records<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Records<'a> {
        Records { buf, pos: 0 }
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = (ActionId, u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        assert!(
            self.pos + RECORD_HEADER <= self.buf.len(),
            "truncated active message header at byte {} of {}",
            self.pos,
            self.buf.len()
        );
        let token = read_u32(self.buf, self.pos);
        let sender = read_u32(self.buf, self.pos + 4);
        let size = read_u32(self.buf, self.pos + 8) as usize;
        let payload_start = self.pos + RECORD_HEADER;
        assert!(
            self.pos + record_len(size) <= self.buf.len(),
            "active message of {} bytes at byte {} exceeds the observed tail {}",
            size,
            self.pos,
            self.buf.len()
        );
        self.pos += record_len(size);
        Some((token, sender, &self.buf[payload_start..payload_start + size]))
    }
}

/// The ring protocol of one queue implementation.
#[enum_dispatch]
pub(crate) trait AmqProtocol {
    /// Bytes of the per-unit window.
    fn window_len(&self) -> usize;
    /// Claim room for `record` in the ring at `target` and write it.
    /// Fails with [DartError::Again] without writing when the ring is full.
    fn try_put(&self, rt: &Runtime, target: &GlobalPtr, record: &[u8]) -> DartResult<()>;
    /// Move every record of the ring at `own` into `out` and reset the ring.
    fn drain(&self, rt: &Runtime, own: &GlobalPtr, out: &mut Vec<u8>) -> DartResult<()>;
}

#[enum_dispatch(AmqProtocol)]
#[derive(Debug)]
pub(crate) enum AmqVariant {
    NoLockQueue,
    AtomicQueue,
}

/// A team-wide active-message queue.
pub struct AmQueue {
    rt: Weak<Runtime>,
    team: TeamId,
    my_idx: usize,
    team_size: usize,
    window: GlobalPtr,
    queue_size: usize,
    protocol: AmqVariant,
    processing: Mutex<()>,
    cache: Mutex<BTreeMap<usize, Vec<u8>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for AmQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("AmQueue")
            .field("team", &self.team)
            .field("window", &self.window)
            .field("queue_size", &self.queue_size)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl AmQueue {
    fn runtime(&self) -> DartResult<std::sync::Arc<Runtime>> {
        self.rt
            .upgrade()
            .ok_or_else(|| DartError::CommunicationFailure("runtime has been finalized".to_string()))
    }

    pub fn team(&self) -> TeamId {
        self.team
    }

    /// Capacity of each ring in bytes.
    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    fn check_record(&self, target: usize, payload_len: usize) -> DartResult<usize> {
        if target >= self.team_size {
            return invalid(format!("unit {} is not a member of {}", target, self.team));
        }
        let len = record_len(payload_len);
        if len > self.queue_size {
            return invalid(format!(
                "message of {} bytes exceeds the queue size {}",
                len, self.queue_size
            ));
        }
        Ok(len)
    }

    /// Send one message to team unit `target` unless its ring is full.
    ///
    /// Returns [DartError::Again] when there is not enough room; nothing is
    /// written in that case.
    pub fn try_send(&self, target: usize, token: ActionId, payload: &[u8]) -> DartResult<()> {
        let len = self.check_record(target, payload.len())?;
        let mut record = Vec::with_capacity(len);
        encode_record(&mut record, token, self.my_idx as u32, payload);
        let rt = self.runtime()?;
        self.protocol
            .try_put(&rt, &self.window.with_unit(target), &record)
    }

    fn send_bytes(&self, target: usize, bytes: &[u8]) -> DartResult<()> {
        let rt = self.runtime()?;
        let target_window = self.window.with_unit(target);
        let mut timer = DeadlockTimer::new("active message send", rt.config.deadlock_timeout);
        loop {
            match self.protocol.try_put(&rt, &target_window, bytes) {
                Err(DartError::Again) => {
                    self.process()?;
                    std::thread::yield_now();
                    timer.check();
                }
                res => return res,
            }
        }
    }

    /// Send one message, processing the local ring while the target is full.
    pub fn send(&self, target: usize, token: ActionId, payload: &[u8]) -> DartResult<()> {
        let len = self.check_record(target, payload.len())?;
        let mut record = Vec::with_capacity(len);
        encode_record(&mut record, token, self.my_idx as u32, payload);
        self.send_bytes(target, &record)
    }

    /// [AmQueue::send] to every other member of the team.
    pub fn send_bcast(&self, token: ActionId, payload: &[u8]) -> DartResult<()> {
        for target in (0..self.team_size).filter(|t| *t != self.my_idx) {
            self.send(target, token, payload)?;
        }
        Ok(())
    }

    /// Cache a message locally; messages to the same target are written as
    /// one batch on [AmQueue::flush], on [AmQueue::process_blocking] or once
    /// the cached batch would no longer fit the target's ring.
    pub fn buffered_send(&self, target: usize, token: ActionId, payload: &[u8]) -> DartResult<()> {
        let len = self.check_record(target, payload.len())?;
        let full = {
            let mut cache = self.cache.lock();
            let batch = cache.entry(target).or_default();
            let full = if batch.len() + len > self.queue_size {
                Some(std::mem::take(batch))
            } else {
                None
            };
            encode_record(batch, token, self.my_idx as u32, payload);
            full
        };
        if let Some(batch) = full {
            self.send_bytes(target, &batch)?;
        }
        Ok(())
    }

    /// Write out every cached batch.
    pub fn flush(&self) -> DartResult<()> {
        let batches = std::mem::take(&mut *self.cache.lock());
        for (target, batch) in batches {
            if !batch.is_empty() {
                self.send_bytes(target, &batch)?;
            }
        }
        Ok(())
    }

    fn execute(&self, rt: &Runtime, buf: &[u8]) -> usize {
        let mut cnt = 0;
        for (token, sender, payload) in Records::new(buf) {
            match ACTION_EXECS.get(&token) {
                Some(exec) => {
                    let ctx = ActionContext {
                        rt,
                        team: self.team,
                        sender: sender as usize,
                    };
                    exec(&ctx, payload);
                    cnt += 1;
                }
                None => tracing::warn!(
                    "skipping active message with unknown token {} from unit {}",
                    token,
                    sender
                ),
            }
        }
        cnt
    }

    fn drain_and_execute(&self) -> DartResult<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let rt = self.runtime()?;
        let mut buf = Vec::new();
        self.protocol.drain(&rt, &self.window.with_unit(self.my_idx), &mut buf)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let cnt = self.execute(&rt, &buf);
        tracing::trace!("{} processed {} active messages", self.team, cnt);
        Ok(cnt)
    }

    /// Run the actions currently readable in this unit's ring.
    ///
    /// Returns immediately with 0 when another thread is processing.
    pub fn process(&self) -> DartResult<usize> {
        match self.processing.try_lock() {
            Some(_guard) => self.drain_and_execute(),
            None => Ok(0),
        }
    }

    /// Fence over the team: flush cached batches, process until every member
    /// has entered, then drain once more.
    ///
    /// Must not be called from within an action of this queue.
    pub fn process_blocking(&self) -> DartResult<usize> {
        let rt = self.runtime()?;
        self.flush()?;
        let team = rt.teams.get(self.team)?;
        let epoch = team.barrier.start();
        let mut cnt = 0;
        let mut timer = DeadlockTimer::new("process_blocking", rt.config.deadlock_timeout);
        while !team.barrier.test(epoch) {
            cnt += self.process()?;
            std::thread::yield_now();
            if timer.check() {
                team.barrier.print_bar();
            }
        }
        let _guard = self.processing.lock();
        cnt += self.drain_and_execute()?;
        Ok(cnt)
    }

    /// Collective over the team; releases the rings.
    pub fn close(self) -> DartResult<()> {
        self.shutdown()
    }

    pub(crate) fn shutdown(&self) -> DartResult<()> {
        let rt = self.runtime()?;
        self.process_blocking()?;
        let _guard = self.processing.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        rt.segment_free(self.window)
    }
}

impl Drop for AmQueue {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            tracing::debug!("{:?} dropped without close, its window is released at finalize", self.window);
        }
    }
}

impl Runtime {
    /// Open a queue on `team` holding `count` messages of up to
    /// `msg_size_hint` payload bytes per member. Collective over `team`.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn amq_open(&self, msg_size_hint: usize, count: usize, team: TeamId) -> DartResult<AmQueue> {
        self.amq_open_with(self.config.amq_impl, msg_size_hint, count, team)
    }

    /// [Runtime::amq_open] with an explicit implementation.
    pub fn amq_open_with(
        &self,
        imp: AmqImpl,
        msg_size_hint: usize,
        count: usize,
        team: TeamId,
    ) -> DartResult<AmQueue> {
        if count == 0 {
            return invalid("a queue must hold at least one message");
        }
        let t = self.teams.get(team)?;
        let queue_size = record_len(msg_size_hint) * count;
        let protocol: AmqVariant = match imp {
            AmqImpl::NoLock => NoLockQueue::new(queue_size).into(),
            AmqImpl::Atomic => AtomicQueue::new(queue_size).into(),
        };
        let window = self.segment_alloc_sym(team, protocol.window_len())?;
        Ok(AmQueue {
            rt: self.me.clone(),
            team,
            my_idx: t.my_idx,
            team_size: t.size(),
            window,
            queue_size,
            protocol,
            processing: Mutex::new(()),
            cache: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// The queue on the root team used by the runtime itself.
    pub fn default_queue(&self) -> DartResult<&AmQueue> {
        self.default_amq
            .get()
            .ok_or_else(|| DartError::NotFound("default active-message queue".to_string()))
    }

    /// Token of the action registered under `name`.
    pub fn action_id(&self, name: &str) -> DartResult<ActionId> {
        ACTION_IDS
            .get(name)
            .copied()
            .ok_or_else(|| DartError::NotFound(format!("action {}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_aligned() {
        assert_eq!(record_len(0), 16);
        assert_eq!(record_len(1), 24);
        assert_eq!(record_len(8), 24);
        assert_eq!(record_len(48), 64);
    }

    #[test]
    fn records_decode_in_order() {
        let mut buf = vec![];
        encode_record(&mut buf, 3, 1, b"hello");
        encode_record(&mut buf, 4, 2, &[]);
        encode_record(&mut buf, 5, 0, &[7u8; 17]);
        assert_eq!(buf.len(), record_len(5) + record_len(0) + record_len(17));
        let records = Records::new(&buf).collect::<Vec<_>>();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], (3, 1, &b"hello"[..]));
        assert_eq!(records[1], (4, 2, &[][..]));
        assert_eq!(records[2].0, 5);
        assert_eq!(records[2].2, &[7u8; 17][..]);
    }

    #[test]
    #[should_panic]
    fn truncated_record_panics() {
        let mut buf = vec![];
        encode_record(&mut buf, 3, 1, &[1u8; 32]);
        buf.truncate(24);
        Records::new(&buf).for_each(drop);
    }
}
