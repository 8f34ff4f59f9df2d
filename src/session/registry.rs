//! Live session bookkeeping for both transport families.
//!
//! Every critical section here is synchronous; guards are never held across
//! an `.await`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::types::SessionId;

/// Transport family a session was opened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// `GET /sse` + `POST /messages`
    LegacyPush,
    /// `POST /mcp` streamable HTTP
    Bidirectional,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LegacyPush => write!(f, "legacy-push"),
            Self::Bidirectional => write!(f, "bidirectional"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Transport built, protocol handshake not finished
    Pending,
    Active,
    /// Terminal
    Closed,
}

/// The resource a session owns. Released exactly once by [`Session::close`].
pub trait SessionConnection: Send + Sync {
    fn close(&self);
}

/// One-shot shutdown trigger for a running transport task.
#[derive(Debug)]
pub struct ShutdownSignal {
    sender: Mutex<Option<oneshot::Sender<()>>>,
}

impl ShutdownSignal {
    /// Create a signal and the receiver the transport task waits on.
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Fire the signal. Returns `false` if it had already fired.
    pub fn fire(&self) -> bool {
        match lock(&self.sender).take() {
            // The receiver may already be gone; the transport is down either way.
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

impl SessionConnection for ShutdownSignal {
    fn close(&self) {
        self.fire();
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Id already present in one of the transport maps
    DuplicateId(SessionId),
    NotFound(SessionId),
    /// Session reached the terminal state
    Closed(SessionId),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateId(id) => write!(f, "Session {} is already registered", id),
            Self::NotFound(id) => write!(f, "No transport found for sessionId {}", id),
            Self::Closed(id) => write!(f, "Session {} is closed", id),
        }
    }
}

impl std::error::Error for SessionError {}

/// A long-lived connection owned by the registry.
#[derive(Debug)]
pub struct Session<C> {
    id: SessionId,
    kind: TransportKind,
    state: Mutex<SessionState>,
    connection: C,
}

impl<C: SessionConnection> Session<C> {
    pub fn new(id: SessionId, kind: TransportKind, connection: C) -> Self {
        Self {
            id,
            kind,
            state: Mutex::new(SessionState::Pending),
            connection,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    fn activate(&self) -> Result<(), SessionError> {
        let mut state = lock(&self.state);
        match *state {
            SessionState::Closed => Err(SessionError::Closed(self.id.clone())),
            _ => {
                *state = SessionState::Active;
                Ok(())
            }
        }
    }

    /// Move to `Closed` and release the connection.
    ///
    /// Returns `true` only for the call that performed the release; later
    /// calls are no-ops.
    pub fn close(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Closed {
                return false;
            }
            *state = SessionState::Closed;
        }
        self.connection.close();
        true
    }
}

#[derive(Debug)]
struct Maps<C> {
    legacy_push: HashMap<SessionId, Arc<Session<C>>>,
    bidirectional: HashMap<SessionId, Arc<Session<C>>>,
}

impl<C> Maps<C> {
    fn map_mut(&mut self, kind: TransportKind) -> &mut HashMap<SessionId, Arc<Session<C>>> {
        match kind {
            TransportKind::LegacyPush => &mut self.legacy_push,
            TransportKind::Bidirectional => &mut self.bidirectional,
        }
    }

    fn contains(&self, id: &SessionId) -> bool {
        self.legacy_push.contains_key(id) || self.bidirectional.contains_key(id)
    }

    fn get(&self, id: &SessionId) -> Option<&Arc<Session<C>>> {
        self.legacy_push
            .get(id)
            .or_else(|| self.bidirectional.get(id))
    }

    fn remove(&mut self, id: &SessionId) -> Option<Arc<Session<C>>> {
        self.legacy_push
            .remove(id)
            .or_else(|| self.bidirectional.remove(id))
    }
}

/// Tracks live sessions across the legacy-push and bidirectional transports.
///
/// A session id lives in at most one of the two maps. Termination removes it
/// from its map and releases its connection exactly once, however many close
/// or error paths race to do so.
#[derive(Debug)]
pub struct SessionRegistry<C> {
    maps: Mutex<Maps<C>>,
}

impl<C> Default for SessionRegistry<C> {
    fn default() -> Self {
        Self {
            maps: Mutex::new(Maps {
                legacy_push: HashMap::new(),
                bidirectional: HashMap::new(),
            }),
        }
    }
}

impl<C: SessionConnection> SessionRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new pending session.
    pub fn register(
        &self,
        id: SessionId,
        kind: TransportKind,
        connection: C,
    ) -> Result<Arc<Session<C>>, SessionError> {
        let mut maps = lock(&self.maps);
        if maps.contains(&id) {
            return Err(SessionError::DuplicateId(id));
        }

        let session = Arc::new(Session::new(id.clone(), kind, connection));
        maps.map_mut(kind).insert(id.clone(), session.clone());
        debug!(session_id = %id, transport = %kind, "Session registered");
        Ok(session)
    }

    /// Mark a session active once its protocol handshake is done.
    pub fn activate(&self, id: &SessionId) -> Result<(), SessionError> {
        let maps = lock(&self.maps);
        let session = maps
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        session.activate()?;
        info!(session_id = %id, transport = %session.kind(), "Session active");
        Ok(())
    }

    /// Find a session that has not been closed.
    pub fn lookup(&self, id: &SessionId) -> Option<Arc<Session<C>>> {
        lock(&self.maps)
            .get(id)
            .filter(|s| s.state() != SessionState::Closed)
            .cloned()
    }

    /// Remove a session and release its connection.
    ///
    /// Unknown or already-closed ids are a no-op. Returns `true` if this call
    /// released the connection.
    pub fn terminate(&self, id: &SessionId) -> bool {
        let removed = lock(&self.maps).remove(id);
        match removed {
            Some(session) => {
                let released = session.close();
                if released {
                    info!(session_id = %id, transport = %session.kind(), "Session closed");
                }
                released
            }
            None => false,
        }
    }

    /// Close every session on both transports. Returns how many were released.
    pub fn terminate_all(&self) -> usize {
        let drained: Vec<Arc<Session<C>>> = {
            let mut guard = lock(&self.maps);
            let maps = &mut *guard;
            maps.legacy_push
                .drain()
                .chain(maps.bidirectional.drain())
                .map(|(_, session)| session)
                .collect()
        };

        let released = drained.iter().filter(|s| s.close()).count();
        if released > 0 {
            info!("Closed {} session(s)", released);
        }
        released
    }

    /// Number of registered sessions across both transports.
    pub fn count(&self) -> usize {
        let maps = lock(&self.maps);
        maps.legacy_push.len() + maps.bidirectional.len()
    }

    pub fn count_by_kind(&self, kind: TransportKind) -> usize {
        let mut maps = lock(&self.maps);
        maps.map_mut(kind).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug, Default)]
    struct CountingConnection {
        releases: Arc<AtomicUsize>,
    }

    impl CountingConnection {
        fn releases(&self) -> usize {
            self.releases.load(Ordering::SeqCst)
        }
    }

    impl SessionConnection for CountingConnection {
        fn close(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn id(raw: &str) -> SessionId {
        SessionId::new(raw)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = SessionRegistry::new();
        let conn = CountingConnection::default();

        let session = registry
            .register(id("s1"), TransportKind::LegacyPush, conn)
            .unwrap();
        assert_eq!(session.state(), SessionState::Pending);
        assert_eq!(registry.count(), 1);

        registry.activate(&id("s1")).unwrap();
        let found = registry.lookup(&id("s1")).expect("registered");
        assert_eq!(found.state(), SessionState::Active);
        assert_eq!(found.kind(), TransportKind::LegacyPush);
        assert!(registry.lookup(&id("missing")).is_none());
    }

    #[test]
    fn test_id_unique_across_transports() {
        let registry = SessionRegistry::new();
        registry
            .register(id("s1"), TransportKind::LegacyPush, CountingConnection::default())
            .unwrap();

        let err = registry
            .register(id("s1"), TransportKind::Bidirectional, CountingConnection::default())
            .unwrap_err();
        assert_eq!(err, SessionError::DuplicateId(id("s1")));
        assert_eq!(registry.count_by_kind(TransportKind::Bidirectional), 0);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_terminate_twice_releases_once() {
        let registry = SessionRegistry::new();
        let conn = CountingConnection::default();
        registry
            .register(id("s1"), TransportKind::Bidirectional, conn.clone())
            .unwrap();

        assert!(registry.terminate(&id("s1")));
        assert!(!registry.terminate(&id("s1")));
        assert_eq!(conn.releases(), 1);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_close_and_error_paths_release_once() {
        let registry = SessionRegistry::new();
        let conn = CountingConnection::default();
        let session = registry
            .register(id("s1"), TransportKind::LegacyPush, conn.clone())
            .unwrap();
        registry.activate(&id("s1")).unwrap();

        // Error path closes the session directly, then the close path terminates it.
        assert!(session.close());
        assert!(!registry.terminate(&id("s1")));
        assert!(!session.close());

        assert_eq!(conn.releases(), 1);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.lookup(&id("s1")).is_none());
    }

    #[test]
    fn test_concurrent_terminate_releases_once() {
        let registry = Arc::new(SessionRegistry::new());
        let conn = CountingConnection::default();
        registry
            .register(id("s1"), TransportKind::Bidirectional, conn.clone())
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.terminate(&id("s1")))
            })
            .collect();
        let released = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| *r)
            .count();

        assert_eq!(released, 1);
        assert_eq!(conn.releases(), 1);
    }

    #[test]
    fn test_activate_closed_session_fails() {
        let registry = SessionRegistry::new();
        let session = registry
            .register(id("s1"), TransportKind::LegacyPush, CountingConnection::default())
            .unwrap();
        session.close();

        assert_eq!(
            registry.activate(&id("s1")),
            Err(SessionError::Closed(id("s1")))
        );
        assert_eq!(
            registry.activate(&id("nope")),
            Err(SessionError::NotFound(id("nope")))
        );
    }

    #[test]
    fn test_terminate_all() {
        let registry = SessionRegistry::new();
        let conns: Vec<CountingConnection> =
            (0..4).map(|_| CountingConnection::default()).collect();

        for (i, conn) in conns.iter().enumerate() {
            let kind = if i % 2 == 0 {
                TransportKind::LegacyPush
            } else {
                TransportKind::Bidirectional
            };
            registry
                .register(id(&format!("s{}", i)), kind, conn.clone())
                .unwrap();
        }
        // One already closed through its own error path.
        registry.lookup(&id("s0")).unwrap().close();

        assert_eq!(registry.terminate_all(), 3);
        assert_eq!(registry.count(), 0);
        assert!(conns.iter().all(|c| c.releases() == 1));
        assert_eq!(registry.terminate_all(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_signal_fires_once() {
        let (signal, rx) = ShutdownSignal::new();
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(rx.await.is_ok());
    }

    #[test]
    fn test_session_error_display() {
        assert_eq!(
            SessionError::NotFound(id("abc")).to_string(),
            "No transport found for sessionId abc"
        );
    }
}
