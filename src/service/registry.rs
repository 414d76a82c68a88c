use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::network::Session;

/// The set of live sessions, guarded by a mutex.
///
/// This is the only state mutated from multiple tasks: the accept loop
/// inserts, each multiplexer removes itself on exit, and `Server::stop`
/// force-closes everything. The raw map is never exposed.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    pub(crate) fn insert(&self, session: Arc<Session>) {
        self.sessions.lock().insert(session.id(), session);
    }

    pub(crate) fn remove(&self, id: u64) {
        self.sessions.lock().remove(&id);
    }

    /// Closes every registered session. Close is idempotent and
    /// non-blocking, so holding the lock across the sweep is fine.
    pub(crate) fn close_all(&self) {
        for session in self.sessions.lock().values() {
            session.close();
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }
}
