//! Team registry: ordered groups of units with local/global translation.

use crate::barrier::Barrier;
use crate::error::{invalid, DartError, DartResult};
use crate::gptr::TeamId;
use crate::segment::SegmentTable;
use crate::transport::{CollKey, Transport, TransportColl};
use crate::warnings::DeadlockTimer;
use crate::Runtime;

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An immutable, ordered group of units.
pub(crate) struct Team {
    pub(crate) id: TeamId,
    pub(crate) parent: Option<TeamId>,
    members: Vec<usize>,
    g2l: HashMap<usize, usize>,
    pub(crate) my_idx: usize,
    pub(crate) segments: RwLock<SegmentTable>,
    coll_seq: AtomicU64,
    pub(crate) barrier: Barrier,
}

impl std::fmt::Debug for Team {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Team")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("members", &self.members)
            .field("my_idx", &self.my_idx)
            .finish()
    }
}

impl Team {
    /// Collective over `members`; the caller must be one of them.
    pub(crate) fn new(
        transport: &Transport,
        id: TeamId,
        parent: Option<TeamId>,
        members: Vec<usize>,
        my_unit: usize,
    ) -> DartResult<Team> {
        let g2l: HashMap<usize, usize> = members
            .iter()
            .enumerate()
            .map(|(idx, unit)| (*unit, idx))
            .collect();
        let my_idx = match g2l.get(&my_unit) {
            Some(idx) => *idx,
            None => return invalid(format!("unit {} is not a member of {}", my_unit, id)),
        };
        let key = CollKey {
            team: id,
            leader: members[0],
            seq: 0,
        };
        let barrier = Barrier::new(transport, key, &members, my_idx)?;
        tracing::debug!("created {} with members {:?} (my idx {})", id, members, my_idx);
        Ok(Team {
            id,
            parent,
            members,
            g2l,
            my_idx,
            segments: RwLock::new(SegmentTable::new()),
            coll_seq: AtomicU64::new(1),
            barrier,
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn members(&self) -> &[usize] {
        &self.members
    }

    pub(crate) fn l2g(&self, idx: usize) -> DartResult<usize> {
        match self.members.get(idx) {
            Some(unit) => Ok(*unit),
            None => invalid(format!(
                "unit {} out of range for {} of size {}",
                idx,
                self.id,
                self.members.len()
            )),
        }
    }

    pub(crate) fn g2l(&self, unit: usize) -> DartResult<usize> {
        match self.g2l.get(&unit) {
            Some(idx) => Ok(*idx),
            None => invalid(format!("unit {} is not a member of {}", unit, self.id)),
        }
    }

    fn next_coll_key(&self) -> CollKey {
        CollKey {
            team: self.id,
            leader: self.members[0],
            seq: self.coll_seq.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Gather one contribution from every member, indexed by team unit id.
    pub(crate) fn allgather(&self, transport: &Transport, data: Vec<u8>) -> DartResult<Vec<Vec<u8>>> {
        let key = self.next_coll_key();
        transport.allgather(key, &self.members, data)
    }
}

/// The teams this unit is a member of.
#[derive(Debug)]
pub(crate) struct TeamRegistry {
    teams: RwLock<HashMap<TeamId, Arc<Team>>>,
    next_id: RwLock<u16>,
}

impl TeamRegistry {
    pub(crate) fn new(root: Team) -> TeamRegistry {
        let mut teams = HashMap::new();
        teams.insert(root.id, Arc::new(root));
        TeamRegistry {
            teams: RwLock::new(teams),
            next_id: RwLock::new(TeamId::ALL.0 + 1),
        }
    }

    pub(crate) fn get(&self, id: TeamId) -> DartResult<Arc<Team>> {
        match self.teams.read().get(&id) {
            Some(team) => Ok(team.clone()),
            None => invalid(format!("{} is not a team of this unit", id)),
        }
    }

    pub(crate) fn ids(&self) -> Vec<TeamId> {
        let mut ids = self.teams.read().keys().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    fn next_id(&self) -> u16 {
        *self.next_id.read()
    }

    fn reserve(&self, id: u16) {
        let mut next = self.next_id.write();
        *next = (*next).max(id + 1);
    }

    fn insert(&self, team: Team) {
        self.teams.write().insert(team.id, Arc::new(team));
    }

    pub(crate) fn remove(&self, id: TeamId) -> Option<Arc<Team>> {
        self.teams.write().remove(&id)
    }
}

impl Runtime {
    /// The root team containing every unit.
    pub fn team_all(&self) -> TeamId {
        TeamId::ALL
    }

    pub fn team_size(&self, team: TeamId) -> DartResult<usize> {
        Ok(self.teams.get(team)?.size())
    }

    /// This unit's id within `team`.
    pub fn team_myid(&self, team: TeamId) -> DartResult<usize> {
        Ok(self.teams.get(team)?.my_idx)
    }

    pub fn team_parent(&self, team: TeamId) -> DartResult<Option<TeamId>> {
        Ok(self.teams.get(team)?.parent)
    }

    /// Translate a team-relative unit id into a global unit id.
    pub fn team_unit_l2g(&self, team: TeamId, unit: usize) -> DartResult<usize> {
        self.teams.get(team)?.l2g(unit)
    }

    /// Translate a global unit id into its id within `team`.
    pub fn team_unit_g2l(&self, team: TeamId, unit: usize) -> DartResult<usize> {
        self.teams.get(team)?.g2l(unit)
    }

    fn agree_on_team_id(&self, ids: impl Iterator<Item = u16>) -> DartResult<TeamId> {
        let id = ids.max().unwrap_or(self.teams.next_id());
        if id == u16::MAX {
            return Err(DartError::Other("team ids exhausted".to_string()));
        }
        self.teams.reserve(id);
        Ok(TeamId(id))
    }

    /// Create a team of `members` (global unit ids, in team order).
    ///
    /// Collective over `parent`: every parent member calls with the same
    /// member list. Units outside `members` receive `None`.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn team_clone(&self, parent: TeamId, members: &[usize]) -> DartResult<Option<TeamId>> {
        let parent_team = self.teams.get(parent)?;
        if members.is_empty() {
            return invalid("a team needs at least one member");
        }
        let mut seen = HashSet::new();
        for unit in members {
            parent_team.g2l(*unit)?;
            if !seen.insert(*unit) {
                return invalid(format!("unit {} listed twice", unit));
            }
        }
        let gathered = parent_team.allgather(&self.transport, crate::serialize(&self.teams.next_id())?)?;
        let ids = gathered
            .iter()
            .map(|bytes| crate::deserialize::<u16>(bytes))
            .collect::<DartResult<Vec<_>>>()?;
        let id = self.agree_on_team_id(ids.into_iter())?;
        if !seen.contains(&self.my_unit) {
            return Ok(None);
        }
        let team = Team::new(&self.transport, id, Some(parent), members.to_vec(), self.my_unit)?;
        self.teams.insert(team);
        Ok(Some(id))
    }

    /// Split `parent` by `color`, ordering each new team by `(key, parent id)`.
    ///
    /// Collective over `parent`. A negative color joins no team and yields `None`.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn team_split(&self, parent: TeamId, color: i64, key: i64) -> DartResult<Option<TeamId>> {
        let parent_team = self.teams.get(parent)?;
        let gathered = parent_team.allgather(
            &self.transport,
            crate::serialize(&(self.teams.next_id(), color, key))?,
        )?;
        let entries = gathered
            .iter()
            .map(|bytes| crate::deserialize::<(u16, i64, i64)>(bytes))
            .collect::<DartResult<Vec<_>>>()?;
        let id = self.agree_on_team_id(entries.iter().map(|(id, _, _)| *id))?;
        if color < 0 {
            return Ok(None);
        }
        let mut group = entries
            .iter()
            .enumerate()
            .filter(|(_, (_, c, _))| *c == color)
            .map(|(idx, (_, _, k))| (*k, idx))
            .collect::<Vec<_>>();
        group.sort();
        let members = group
            .into_iter()
            .map(|(_, idx)| parent_team.l2g(idx))
            .collect::<DartResult<Vec<_>>>()?;
        let team = Team::new(&self.transport, id, Some(parent), members, self.my_unit)?;
        self.teams.insert(team);
        Ok(Some(id))
    }

    /// Collective over `team`; fails while segments of the team are live.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn team_destroy(&self, team: TeamId) -> DartResult<()> {
        if team == TeamId::ALL {
            return invalid("the root team is destroyed by finalize");
        }
        let t = self.teams.get(team)?;
        let live = t.segments.read().ids();
        if !live.is_empty() {
            return invalid(format!("{} still has live segments {:?}", team, live));
        }
        self.barrier(team)?;
        self.teams.remove(team);
        t.barrier.release(&self.transport)
    }

    /// Block until every member of `team` has entered the barrier.
    ///
    /// The default active-message queue is progressed while waiting.
    pub fn barrier(&self, team: TeamId) -> DartResult<()> {
        let t = self.teams.get(team)?;
        let epoch = t.barrier.start();
        let mut timer = DeadlockTimer::new("barrier", self.config.deadlock_timeout);
        while !t.barrier.test(epoch) {
            self.progress();
            std::thread::yield_now();
            if timer.check() {
                t.barrier.print_bar();
            }
        }
        Ok(())
    }
}
