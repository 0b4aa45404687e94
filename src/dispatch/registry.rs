//! Worker membership
//!
//! Tracks connected workers. Each entry owns a `watch` sender that flips to
//! `true` when the worker leaves, so in-flight dispatches notice departures
//! without polling.
//!
//! Every registration gets a generation number. Removal on behalf of a
//! particular connection or dispatch names the generation it saw, so a
//! worker that reconnected under the same id is left alone.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use super::WorkerLink;

/// Identity of a registered worker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

struct Entry {
    link: Arc<dyn WorkerLink>,
    generation: u64,
    /// Reserved entries hold their id but are not dispatched to yet
    admitted: bool,
    departed: watch::Sender<bool>,
    joined_at: Instant,
}

/// Handle to one registration
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: WorkerId,
    pub generation: u64,
    /// Turns `true` when this registration is removed or replaced
    pub departed: watch::Receiver<bool>,
}

/// One member of a dispatch snapshot
pub struct Participant {
    pub id: WorkerId,
    pub generation: u64,
    pub link: Arc<dyn WorkerLink>,
    /// Becomes `true` (or closes) when the worker leaves
    pub departed: watch::Receiver<bool>,
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

struct Members {
    entries: BTreeMap<WorkerId, Entry>,
    next_generation: u64,
}

impl Members {
    fn insert(&mut self, id: WorkerId, link: Arc<dyn WorkerLink>, admitted: bool) -> Registration {
        self.next_generation += 1;
        let generation = self.next_generation;
        let (departed, rx) = watch::channel(false);

        let previous = self.entries.insert(
            id.clone(),
            Entry {
                link,
                generation,
                admitted,
                departed,
                joined_at: Instant::now(),
            },
        );
        if let Some(old) = previous {
            debug!(worker_id = %id, generation = old.generation, "Replacing existing worker entry");
            old.departed.send_replace(true);
        }

        Registration {
            id,
            generation,
            departed: rx,
        }
    }

    fn admitted(&self) -> impl Iterator<Item = (&WorkerId, &Entry)> {
        self.entries.iter().filter(|(_, e)| e.admitted)
    }
}

/// Thread-safe registry of connected workers
pub struct WorkerRegistry {
    members: RwLock<Members>,
}

impl WorkerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            members: RwLock::new(Members {
                entries: BTreeMap::new(),
                next_generation: 0,
            }),
        }
    }

    /// Add a worker, replacing any previous entry with the same id
    pub fn register(&self, id: WorkerId, link: Arc<dyn WorkerLink>) -> Registration {
        let registration = self.members.write().insert(id, link, true);
        info!(worker_id = %registration.id, workers = self.count(), "Worker registered");
        registration
    }

    /// Reserve a free id derived from `base` without admitting the worker
    ///
    /// `base` is used as is when free, otherwise `base-<tag>` and then
    /// `base-<tag>-2`, `base-<tag>-3` and so on. Choosing the id and
    /// inserting the entry happen under one write lock. The reservation
    /// keeps the id taken but stays out of snapshots until
    /// [`admit`](Self::admit).
    pub fn reserve_unique<L>(
        &self,
        base: &str,
        tag: &str,
        make_link: impl FnOnce(&WorkerId) -> Arc<L>,
    ) -> (Registration, Arc<L>)
    where
        L: WorkerLink + 'static,
    {
        let mut members = self.members.write();

        let mut candidate = WorkerId::new(base);
        let mut attempt = 1;
        while members.entries.contains_key(&candidate) {
            candidate = match attempt {
                1 => WorkerId::new(format!("{}-{}", base, tag)),
                n => WorkerId::new(format!("{}-{}-{}", base, tag, n)),
            };
            attempt += 1;
        }

        let link = make_link(&candidate);
        let registration = members.insert(candidate, link.clone(), false);
        debug!(worker_id = %registration.id, generation = registration.generation, "Worker id reserved");
        (registration, link)
    }

    /// Make a reservation visible to dispatches. Returns false if the
    /// registration has been removed in the meantime.
    pub fn admit(&self, registration: &Registration) -> bool {
        let mut members = self.members.write();
        let admitted = match members.entries.get_mut(&registration.id) {
            Some(entry) if entry.generation == registration.generation => {
                entry.admitted = true;
                true
            }
            _ => false,
        };
        let workers = members.admitted().count();
        drop(members);

        if admitted {
            info!(worker_id = %registration.id, workers, "Worker registered");
        }
        admitted
    }

    /// Remove whatever is registered under `id`. Returns whether anything was.
    pub fn deregister(&self, id: &WorkerId) -> bool {
        let removed = self.members.write().entries.remove(id);
        match removed {
            Some(entry) => {
                Self::announce_removal(id, entry);
                true
            }
            None => false,
        }
    }

    /// Remove `id` only if it is still the registration `generation`
    pub fn deregister_generation(&self, id: &WorkerId, generation: u64) -> bool {
        let removed = {
            let mut members = self.members.write();
            let current = members
                .entries
                .get(id)
                .is_some_and(|entry| entry.generation == generation);
            if current {
                members.entries.remove(id)
            } else {
                None
            }
        };
        match removed {
            Some(entry) => {
                Self::announce_removal(id, entry);
                true
            }
            None => false,
        }
    }

    fn announce_removal(id: &WorkerId, entry: Entry) {
        entry.departed.send_replace(true);
        info!(
            worker_id = %id,
            generation = entry.generation,
            connected_secs = entry.joined_at.elapsed().as_secs(),
            "Worker removed"
        );
    }

    /// Admitted members, in id order
    pub fn snapshot(&self) -> Vec<Participant> {
        self.members
            .read()
            .admitted()
            .map(|(id, entry)| Participant {
                id: id.clone(),
                generation: entry.generation,
                link: Arc::clone(&entry.link),
                departed: entry.departed.subscribe(),
            })
            .collect()
    }

    /// Whether `id` is taken, admitted or only reserved
    pub fn contains(&self, id: &WorkerId) -> bool {
        self.members.read().entries.contains_key(id)
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.members.read().admitted().map(|(id, _)| id.clone()).collect()
    }

    /// Number of admitted workers
    pub fn count(&self) -> usize {
        self.members.read().admitted().count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

/// Resolves once `flag` turns `true` or its sender is gone
pub(crate) async fn signalled(mut flag: watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
