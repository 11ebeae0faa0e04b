//! Session tracking across configurations and quorum progress derivation.
//!
//! The replica manager owns every [`ReplicationSession`] behind an
//! `update_configuration` call. Sessions are keyed by `(ReplicaId,
//! IncarnationId)`: a rebuilt replica with the same id but a fresh
//! incarnation gets a fresh session.
//!
//! # Progress
//!
//! Let the members of a configuration be its replicas plus the primary
//! itself. The `q`-quorum LSN of a member set is the `q`-th highest
//! receive LSN, the highest LSN at least `q` members have reached. The
//! committed LSN is the current configuration's quorum LSN; during a
//! reconfiguration with a previous configuration it is the minimum of the
//! two quorum LSNs, so neither configuration outruns the other. The
//! completed LSN is the minimum applied LSN across every session with
//! established progress.

use std::sync::{Arc, Mutex};

use stratum_types::{IncarnationId, Lsn, ReplicaId, Status};

use crate::session::{ReplicationSession, SessionRole};

// ============================================================================
// Inputs
// ============================================================================

/// One replica as named by an `update_configuration` call.
#[derive(Debug, Clone)]
pub struct ReplicaInformation {
    pub id: ReplicaId,
    pub incarnation_id: IncarnationId,
    pub address: String,

    /// The replica's replication progress as known by the caller;
    /// initializes the session's ack state. `Lsn::INVALID` for a replica
    /// with no progress yet.
    pub current_progress: Lsn,

    /// Lowest LSN from which the replica can catch up.
    pub catch_up_capability: Lsn,

    /// The replica must reach the committed LSN before the
    /// reconfiguration completes.
    pub must_catch_up: bool,
}

/// Result of a progress derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Quorum-committed LSN; `Lsn::INVALID` before the first
    /// configuration.
    pub committed: Lsn,

    /// Minimum applied LSN across the tracked sessions; the tail below
    /// which nothing can be reclaimed.
    pub completed: Lsn,

    pub active: Vec<ReplicaId>,
    pub previous_active: Vec<ReplicaId>,
    pub idle: Vec<ReplicaId>,
}

type SessionFactory =
    Box<dyn Fn(&ReplicaInformation, SessionRole) -> Arc<ReplicationSession> + Send + Sync>;
type LocalProgressFn = Box<dyn Fn() -> Lsn + Send + Sync>;

struct ManagerInner {
    active: Vec<Arc<ReplicationSession>>,
    previous_active: Vec<Arc<ReplicationSession>>,
    idle: Vec<Arc<ReplicationSession>>,
    /// Identities named by the previous configuration. A replica can sit
    /// in both configurations; its session lives in `active`, but it still
    /// counts toward the previous configuration's quorum.
    previous_members: Vec<(ReplicaId, IncarnationId)>,
    current_quorum: u64,
    previous_quorum: u64,
    has_current_config: bool,
    has_previous_config: bool,
}

/// Owns sessions; derives committed/completed LSNs under quorum.
pub struct ReplicaManager {
    session_factory: SessionFactory,
    local_progress: LocalProgressFn,
    inner: Mutex<ManagerInner>,
}

impl ReplicaManager {
    /// `session_factory` builds an opened session for a replica;
    /// `local_progress` reports the primary's own LSN.
    pub fn new(session_factory: SessionFactory, local_progress: LocalProgressFn) -> Self {
        Self {
            session_factory,
            local_progress,
            inner: Mutex::new(ManagerInner {
                active: Vec::new(),
                previous_active: Vec::new(),
                idle: Vec::new(),
                previous_members: Vec::new(),
                current_quorum: 0,
                previous_quorum: 0,
                has_current_config: false,
                has_previous_config: false,
            }),
        }
    }

    /// Registers an idle session for a replica being built.
    pub fn add_idle(&self, info: &ReplicaInformation) -> Result<Arc<ReplicationSession>, Status> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if find_session(&inner.idle, info.id, info.incarnation_id).is_some()
            || find_session(&inner.active, info.id, info.incarnation_id).is_some()
        {
            return Err(Status::SharingViolation);
        }
        let session = (self.session_factory)(info, SessionRole::Idle);
        inner.idle.push(Arc::clone(&session));
        Ok(session)
    }

    /// Removes and returns an idle session (build aborted or finished
    /// without promotion).
    pub fn remove_idle(&self, id: ReplicaId, incarnation: IncarnationId) -> Option<Arc<ReplicationSession>> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        take_session(&mut inner.idle, id, incarnation)
    }

    /// Applies a configuration change.
    ///
    /// Sessions newly named open; idle replicas appearing in the current
    /// set promote in place; sessions named by neither set are returned
    /// for the caller to drain and close. The change is atomic: state is
    /// only swapped after the new lists are fully built.
    pub fn update_configuration(
        &self,
        previous: &[ReplicaInformation],
        previous_quorum: u64,
        current: &[ReplicaInformation],
        current_quorum: u64,
    ) -> Result<Vec<Arc<ReplicationSession>>, Status> {
        for list in [current, previous] {
            for info in list {
                let occurrences = list
                    .iter()
                    .filter(|other| {
                        other.id == info.id && other.incarnation_id == info.incarnation_id
                    })
                    .count();
                if occurrences > 1 {
                    return Err(Status::InvalidState);
                }
            }
        }

        let mut inner = self.inner.lock().expect("lock poisoned");

        // Build the new lists against draining pools of the old ones.
        let mut pool_active = inner.active.clone();
        let mut pool_previous = inner.previous_active.clone();
        let mut pool_idle = inner.idle.clone();

        let mut new_active = Vec::with_capacity(current.len());
        for info in current {
            let session = take_session(&mut pool_active, info.id, info.incarnation_id)
                .or_else(|| take_session(&mut pool_previous, info.id, info.incarnation_id))
                .or_else(|| {
                    let promoted = take_session(&mut pool_idle, info.id, info.incarnation_id);
                    if let Some(session) = &promoted {
                        session.promote_to_active();
                    }
                    promoted
                })
                .unwrap_or_else(|| (self.session_factory)(info, SessionRole::Active));
            session.set_must_catch_up(info.must_catch_up);
            new_active.push(session);
        }

        let mut new_previous = Vec::new();
        for info in previous {
            if current
                .iter()
                .any(|c| c.id == info.id && c.incarnation_id == info.incarnation_id)
            {
                // Lives in both sets; tracked through the active list.
                continue;
            }
            let session = take_session(&mut pool_active, info.id, info.incarnation_id)
                .or_else(|| take_session(&mut pool_previous, info.id, info.incarnation_id))
                .unwrap_or_else(|| (self.session_factory)(info, SessionRole::Active));
            new_previous.push(session);
        }

        // Whatever was not claimed by either set closes. Idle sessions
        // stay unless they were promoted.
        let mut to_close = Vec::new();
        to_close.extend(pool_active);
        to_close.extend(pool_previous);
        for session in &to_close {
            session.mark_for_close();
        }

        inner.active = new_active;
        inner.previous_active = new_previous;
        inner.idle = pool_idle;
        inner.previous_members = previous
            .iter()
            .map(|info| (info.id, info.incarnation_id))
            .collect();
        inner.current_quorum = current_quorum;
        inner.previous_quorum = previous_quorum;
        inner.has_current_config = true;
        inner.has_previous_config = !previous.is_empty();

        tracing::debug!(
            active = inner.active.len(),
            previous = inner.previous_active.len(),
            idle = inner.idle.len(),
            closing = to_close.len(),
            "configuration updated"
        );
        Ok(to_close)
    }

    /// Every session the manager currently tracks.
    pub fn all_sessions(&self) -> Vec<Arc<ReplicationSession>> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner
            .active
            .iter()
            .chain(&inner.previous_active)
            .chain(&inner.idle)
            .cloned()
            .collect()
    }

    /// Sessions that receive replicate traffic: active, catch-up
    /// previous-configuration, and idle sessions being built (a build's
    /// copy covers state below its start LSN; replication covers the
    /// rest live).
    pub fn replication_targets(&self) -> Vec<Arc<ReplicationSession>> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner
            .active
            .iter()
            .chain(&inner.previous_active)
            .chain(&inner.idle)
            .cloned()
            .collect()
    }

    pub fn find(&self, id: ReplicaId, incarnation: IncarnationId) -> Option<Arc<ReplicationSession>> {
        let inner = self.inner.lock().expect("lock poisoned");
        find_session(&inner.active, id, incarnation)
            .or_else(|| find_session(&inner.previous_active, id, incarnation))
            .or_else(|| find_session(&inner.idle, id, incarnation))
    }

    /// Derives progress; `None` when the configured quorum cannot be met
    /// by the member count.
    pub fn try_get_progress(&self) -> Option<ProgressSnapshot> {
        let inner = self.inner.lock().expect("lock poisoned");
        let primary_lsn = (self.local_progress)();

        let committed = if inner.has_current_config {
            let cc_receive: Vec<Lsn> = inner
                .active
                .iter()
                .map(|s| s.replication_progress().0)
                .collect();
            let cc = quorum_lsn(&cc_receive, primary_lsn, inner.current_quorum)?;

            if inner.has_previous_config {
                let pc_receive: Vec<Lsn> = inner
                    .previous_members
                    .iter()
                    .filter_map(|(id, incarnation)| {
                        find_session(&inner.previous_active, *id, *incarnation)
                            .or_else(|| find_session(&inner.active, *id, *incarnation))
                    })
                    .map(|s| s.replication_progress().0)
                    .collect();
                let pc = quorum_lsn(&pc_receive, primary_lsn, inner.previous_quorum)?;
                cc.min(pc)
            } else {
                cc
            }
        } else {
            Lsn::INVALID
        };

        let mut completed: Option<Lsn> = None;
        for session in inner
            .active
            .iter()
            .chain(&inner.previous_active)
            .chain(inner.idle.iter().filter(|s| s.progress_established()))
        {
            let applied = session.replication_progress().1;
            completed = Some(completed.map_or(applied, |c| c.min(applied)));
        }
        // With nothing tracked, the primary's own progress is the floor.
        let completed = completed.unwrap_or(primary_lsn);

        Some(ProgressSnapshot {
            committed,
            completed,
            active: inner.active.iter().map(|s| s.replica_id()).collect(),
            previous_active: inner
                .previous_active
                .iter()
                .map(|s| s.replica_id())
                .collect(),
            idle: inner.idle.iter().map(|s| s.replica_id()).collect(),
        })
    }

    /// Closes every session; returns them for the owner to drain.
    pub fn close_all(&self) -> Vec<Arc<ReplicationSession>> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let mut sessions = Vec::new();
        sessions.append(&mut inner.active);
        sessions.append(&mut inner.previous_active);
        sessions.append(&mut inner.idle);
        inner.has_current_config = false;
        inner.has_previous_config = false;
        sessions
    }
}

// ============================================================================
// Quorum math
// ============================================================================

/// The `q`-th highest LSN among the sessions plus the primary, or `None`
/// when `q` exceeds the member count. `q == 0` derives the majority
/// quorum for the member count.
fn quorum_lsn(session_lsns: &[Lsn], primary: Lsn, configured_quorum: u64) -> Option<Lsn> {
    let mut members: Vec<Lsn> = session_lsns.to_vec();
    members.push(primary);

    let quorum = if configured_quorum == 0 {
        members.len() as u64 / 2 + 1
    } else {
        configured_quorum
    };
    if quorum == 0 || quorum as usize > members.len() {
        return None;
    }

    members.sort_unstable_by(|a, b| b.cmp(a));
    Some(members[quorum as usize - 1])
}

fn find_session(
    sessions: &[Arc<ReplicationSession>],
    id: ReplicaId,
    incarnation: IncarnationId,
) -> Option<Arc<ReplicationSession>> {
    sessions
        .iter()
        .find(|s| s.replica_id() == id && s.incarnation_id() == incarnation)
        .cloned()
}

fn take_session(
    sessions: &mut Vec<Arc<ReplicationSession>>,
    id: ReplicaId,
    incarnation: IncarnationId,
) -> Option<Arc<ReplicationSession>> {
    let index = sessions
        .iter()
        .position(|s| s.replica_id() == id && s.incarnation_id() == incarnation)?;
    Some(sessions.remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_lsn_picks_the_qth_highest() {
        // {2, 3, 3, 4, 6, 10} plus a caught-up primary; quorum 4.
        let lsns: Vec<Lsn> = [2, 3, 3, 4, 6, 10].into_iter().map(Lsn::new).collect();
        assert_eq!(
            quorum_lsn(&lsns, Lsn::new(100), 4),
            Some(Lsn::new(4))
        );
    }

    #[test]
    fn quorum_defaults_to_majority() {
        // One replica + primary: majority of 2 is 2.
        assert_eq!(
            quorum_lsn(&[Lsn::new(2)], Lsn::new(100), 0),
            Some(Lsn::new(2))
        );
        // Two replicas {5, 6} + primary: majority of 3 is 2 -> 6.
        assert_eq!(
            quorum_lsn(&[Lsn::new(5), Lsn::new(6)], Lsn::new(100), 0),
            Some(Lsn::new(6))
        );
        // Three replicas {2, 3, 5} + primary: majority of 4 is 3 -> 3.
        assert_eq!(
            quorum_lsn(
                &[Lsn::new(2), Lsn::new(3), Lsn::new(5)],
                Lsn::new(100),
                0
            ),
            Some(Lsn::new(3))
        );
    }

    #[test]
    fn unachievable_quorum_yields_none() {
        // Five replicas + primary = 6 members; quorum 7 cannot be met.
        let lsns: Vec<Lsn> = [3, 6, 6, 8, 19].into_iter().map(Lsn::new).collect();
        assert_eq!(quorum_lsn(&lsns, Lsn::new(100), 7), None);
        // Empty configuration with forced quorum 2: only the primary.
        assert_eq!(quorum_lsn(&[], Lsn::new(100), 2), None);
    }

    #[test]
    fn forced_quorum_overrides_majority() {
        // {1, 4, 7, 8, 9, 11} + primary, forced quorum 5 -> 7.
        let lsns: Vec<Lsn> = [1, 4, 7, 8, 9, 11].into_iter().map(Lsn::new).collect();
        assert_eq!(quorum_lsn(&lsns, Lsn::new(100), 5), Some(Lsn::new(7)));
    }
}
