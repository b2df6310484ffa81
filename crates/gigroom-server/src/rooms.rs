use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use gigroom_shared::{ConnectionId, JobId};

/// In-memory room membership, keyed by job.
///
/// Rooms exist only while they have members: the first join creates one and
/// the last leave removes it, so an empty room and a room that never existed
/// look the same. Both directions are indexed so that a disconnect does not
/// scan every room.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<JobId, HashSet<ConnectionId>>,
    joined: HashMap<ConnectionId, HashSet<JobId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room. Returns `false` if it was already there.
    pub fn join(&mut self, conn: ConnectionId, job: &JobId) -> bool {
        let added = self.rooms.entry(job.clone()).or_default().insert(conn);
        if added {
            self.joined.entry(conn).or_default().insert(job.clone());
            info!(
                room = %job,
                conn = %conn,
                members = self.member_count(job),
                "Connection joined room"
            );
        }
        added
    }

    /// Remove a connection from every room it joined and return those rooms.
    /// Unknown connections are already absent; nothing happens.
    pub fn leave_all(&mut self, conn: ConnectionId) -> Vec<JobId> {
        let Some(jobs) = self.joined.remove(&conn) else {
            return Vec::new();
        };

        for job in &jobs {
            let now_empty = match self.rooms.get_mut(job) {
                Some(members) => {
                    members.remove(&conn);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.rooms.remove(job);
                debug!(room = %job, "Removed empty room");
            }
        }

        jobs.into_iter().collect()
    }

    pub fn members_of(&self, job: &JobId) -> HashSet<ConnectionId> {
        self.rooms.get(job).cloned().unwrap_or_default()
    }

    pub fn is_member(&self, conn: ConnectionId, job: &JobId) -> bool {
        self.rooms
            .get(job)
            .is_some_and(|members| members.contains(&conn))
    }

    pub fn member_count(&self, job: &JobId) -> usize {
        self.rooms.get(job).map(HashSet::len).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

/// Hands out one turn at a time per room.
///
/// The gateway holds a turn from the moment it persists a message until the
/// broadcast has been queued, so every member sees a room's messages in
/// history order even when several senders race.
#[derive(Debug, Default)]
pub struct RoomSequencer {
    turns: Arc<Mutex<Turns>>,
}

type Turns = HashMap<JobId, Arc<tokio::sync::Mutex<()>>>;

/// Exclusive right to persist-and-broadcast in one room. Released on drop.
pub struct RoomTurn {
    guard: Option<OwnedMutexGuard<()>>,
    job: JobId,
    turns: Arc<Mutex<Turns>>,
}

impl RoomSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enter(&self, job: &JobId) -> RoomTurn {
        let lock = self
            .turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job.clone())
            .or_default()
            .clone();
        RoomTurn {
            guard: Some(lock.lock_owned().await),
            job: job.clone(),
            turns: self.turns.clone(),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for RoomTurn {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut turns = self.turns.lock().unwrap_or_else(PoisonError::into_inner);
        // Waiters hold their own clone; only the map's copy left means idle.
        if turns
            .get(&self.job)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            turns.remove(&self.job);
        }
    }
}
