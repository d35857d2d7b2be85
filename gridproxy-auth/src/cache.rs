//! Delegation Session Cache
//!
//! Server-side store of delegation sessions, keyed by session identifier and
//! indexed by the identity of the credential each session ends up holding.
//!
//! ```text
//! DelegationSessionCache
//!     └── Mutex<Inner>
//!           ├── sessions:    HashMap<SessionId, Session>
//!           └── by_identity: HashMap<DistinguishedName, Vec<SessionId>>
//!
//! Pending ──activate──> Active ──expiry──> Expired (tombstone)
//!    │                    │
//!    └──────revoke────────┴──────────────> Revoked (tombstone)
//! ```
//!
//! The lock is only held for map updates. Key generation, signing and chain
//! verification happen before [`DelegationSessionCache::insert_pending`] or
//! [`DelegationSessionCache::activate`] are called, and `activate` re-checks
//! that the session is still `Pending` before swapping in the credential.

use crate::config::CacheConfig;
use crate::credential::Credential;
use crate::error::{DelegationError, Result};
use crate::name::DistinguishedName;
use crate::request::CredentialRequest;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque session identifier
pub type SessionId = String;

/// Time source for expiry decisions
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Move forward by `by`
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    /// Jump to `to`
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Request issued, waiting for the signed certificate
    Pending,
    /// Signed proxy stored
    Active,
    /// Lifetime ran out
    Expired,
    /// Cancelled or evicted
    Revoked,
}

impl SessionState {
    /// Expired or Revoked
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Expired | SessionState::Revoked)
    }
}

/// Snapshot of one session, without key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session identifier
    pub session_id: SessionId,

    /// Current state
    pub state: SessionState,

    /// Identity of the stored credential once active
    pub identity: Option<DistinguishedName>,

    /// When the session was created
    pub created_at: DateTime<Utc>,

    /// When the session stops being usable
    pub expires_at: DateTime<Utc>,
}

/// What a sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Pending sessions that timed out
    pub expired_pending: usize,

    /// Active sessions that reached `expires_at`
    pub expired_active: usize,

    /// Terminal entries past their retention
    pub tombstones_dropped: usize,
}

/// Session counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCounts {
    /// Pending sessions
    pub pending: usize,
    /// Active sessions
    pub active: usize,
    /// Expired and revoked entries still retained
    pub tombstones: usize,
}

struct Session {
    state: SessionState,
    request: Option<Arc<CredentialRequest>>,
    credential: Option<Credential>,
    identity: Option<DistinguishedName>,
    created_at: DateTime<Utc>,
    // Insertion order breaks ties between equal `created_at`
    sequence: u64,
    expires_at: DateTime<Utc>,
    // Tombstones only
    retained_until: Option<DateTime<Utc>>,
}

impl Session {
    fn info(&self, id: &str) -> SessionInfo {
        SessionInfo {
            session_id: id.to_string(),
            state: self.state,
            identity: self.identity.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }

    fn bury(&mut self, state: SessionState, until: DateTime<Utc>) {
        self.state = state;
        self.request = None;
        self.credential = None;
        self.retained_until = Some(until);
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    by_identity: HashMap<DistinguishedName, Vec<SessionId>>,
    next_sequence: u64,
}

impl Inner {
    fn unindex(&mut self, id: &str, identity: Option<&DistinguishedName>) {
        let Some(identity) = identity else {
            return;
        };
        if let Some(ids) = self.by_identity.get_mut(identity) {
            ids.retain(|i| i != id);
            if ids.is_empty() {
                self.by_identity.remove(identity);
            }
        }
    }

    fn count(&self, state: SessionState) -> usize {
        self.sessions.values().filter(|s| s.state == state).count()
    }

    /// Turn an active session into a tombstone and drop it from the index
    fn retire(&mut self, id: &str, state: SessionState, until: DateTime<Utc>) {
        let identity = match self.sessions.get_mut(id) {
            Some(session) => {
                let identity = session.identity.clone();
                session.bury(state, until);
                identity
            }
            None => return,
        };
        self.unindex(id, identity.as_ref());
    }

    /// Oldest active session, optionally restricted to one identity
    fn oldest_active(&self, identity: Option<&DistinguishedName>) -> Option<SessionId> {
        let candidates: Box<dyn Iterator<Item = &SessionId> + '_> = match identity {
            Some(identity) => match self.by_identity.get(identity) {
                Some(ids) => Box::new(ids.iter()),
                None => return None,
            },
            None => Box::new(self.sessions.keys()),
        };
        candidates
            .filter_map(|id| self.sessions.get(id).map(|s| (id, s)))
            .filter(|(_, s)| s.state == SessionState::Active)
            .min_by_key(|(_, s)| (s.created_at, s.sequence))
            .map(|(id, _)| id.clone())
    }

    fn purge_expired_pending(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| !(s.state == SessionState::Pending && s.expires_at <= now));
        before - self.sessions.len()
    }
}

/// Shared store of delegation sessions
pub struct DelegationSessionCache {
    inner: Mutex<Inner>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for DelegationSessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegationSessionCache")
            .field("config", &self.config)
            .field("counts", &self.counts())
            .finish()
    }
}

impl DelegationSessionCache {
    /// Cache using the wall clock
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Cache using a custom time source
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
            clock,
        }
    }

    /// Limits in force
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Current time according to the cache clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn chrono(duration: std::time::Duration) -> Duration {
        Duration::from_std(duration).unwrap_or_else(|_| Duration::days(365 * 100))
    }

    fn tombstone_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Self::chrono(self.config.tombstone_retention)
    }

    /// Admit a freshly generated request as a `Pending` session.
    ///
    /// Timed-out pending sessions are purged first; `CapacityExceeded` is
    /// returned only if the pending table is still full afterwards.
    pub fn insert_pending(&self, request: CredentialRequest) -> Result<SessionId> {
        let now = self.clock.now();
        let id = Uuid::new_v4().to_string();
        let mut inner = self.lock();

        if inner.count(SessionState::Pending) >= self.config.max_pending_sessions {
            let purged = inner.purge_expired_pending(now);
            if purged > 0 {
                debug!("Purged {} timed-out pending sessions", purged);
            }
            if inner.count(SessionState::Pending) >= self.config.max_pending_sessions {
                return Err(DelegationError::CapacityExceeded(format!(
                    "{} pending delegation sessions",
                    self.config.max_pending_sessions
                )));
            }
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.sessions.insert(
            id.clone(),
            Session {
                state: SessionState::Pending,
                request: Some(Arc::new(request)),
                credential: None,
                identity: None,
                created_at: now,
                sequence,
                expires_at: now + Self::chrono(self.config.pending_timeout),
                retained_until: None,
            },
        );
        info!("Delegation session {} pending", id);
        Ok(id)
    }

    /// The request of a session that is still `Pending`
    pub fn pending_request(&self, id: &str) -> Result<Arc<CredentialRequest>> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let Some(session) = inner.sessions.get(id) else {
            return Err(DelegationError::UnknownSession(id.to_string()));
        };
        if session.state != SessionState::Pending {
            return Err(DelegationError::UnknownSession(format!(
                "{} is {:?}, not pending",
                id, session.state
            )));
        }
        if session.expires_at <= now {
            inner.sessions.remove(id);
            warn!("Delegation session {} timed out before completion", id);
            return Err(DelegationError::UnknownSession(format!("{} timed out", id)));
        }
        session
            .request
            .clone()
            .ok_or_else(|| DelegationError::Internal(format!("pending session {} has no request", id)))
    }

    /// Store the verified credential and move the session to `Active`.
    ///
    /// Evicts the oldest active sessions of the same identity, and then of
    /// the whole cache, when the configured bounds are exceeded.
    pub fn activate(&self, id: &str, credential: Credential) -> Result<SessionInfo> {
        let now = self.clock.now();
        let identity = credential.identity_name();
        let not_after = credential.end_time();
        let mut inner = self.lock();

        let info = {
            let Some(session) = inner.sessions.get_mut(id) else {
                return Err(DelegationError::UnknownSession(id.to_string()));
            };
            if session.state != SessionState::Pending {
                return Err(DelegationError::UnknownSession(format!(
                    "{} is {:?}, not pending",
                    id, session.state
                )));
            }
            if session.expires_at <= now {
                inner.sessions.remove(id);
                return Err(DelegationError::UnknownSession(format!("{} timed out", id)));
            }

            let lifetime_end =
                session.created_at + Self::chrono(self.config.max_credential_lifetime);
            session.state = SessionState::Active;
            session.request = None;
            session.credential = Some(credential);
            session.identity = Some(identity.clone());
            session.expires_at = not_after.min(lifetime_end);
            session.info(id)
        };

        inner
            .by_identity
            .entry(identity.clone())
            .or_default()
            .push(id.to_string());
        info!(
            "Delegation session {} active for {} until {}",
            id, identity, info.expires_at
        );

        let until = self.tombstone_until(now);
        let per_identity = self.config.max_credentials_per_identity;
        while inner.by_identity.get(&identity).map_or(0, Vec::len) > per_identity {
            let Some(victim) = inner.oldest_active(Some(&identity)) else {
                break;
            };
            warn!("Evicting delegation session {} of {}", victim, identity);
            inner.retire(&victim, SessionState::Revoked, until);
        }
        if let Some(global) = self.config.max_active_sessions {
            while inner.count(SessionState::Active) > global {
                let Some(victim) = inner.oldest_active(None) else {
                    break;
                };
                warn!("Evicting delegation session {} (global bound {})", victim, global);
                inner.retire(&victim, SessionState::Revoked, until);
            }
        }

        Ok(info)
    }

    /// Credential of an active session, by exact identifier
    pub fn get_by_id(&self, id: &str) -> Result<Credential> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let Some(session) = inner.sessions.get(id) else {
            return Err(DelegationError::UnknownSession(id.to_string()));
        };
        match session.state {
            SessionState::Active if session.expires_at > now => session
                .credential
                .clone()
                .ok_or_else(|| DelegationError::Internal(format!("active session {} has no credential", id))),
            SessionState::Active => {
                let expired_at = session.expires_at;
                inner.retire(id, SessionState::Expired, self.tombstone_until(now));
                warn!("Delegation session {} expired at {}", id, expired_at);
                Err(DelegationError::CredentialExpired(format!(
                    "session {} expired at {}",
                    id, expired_at
                )))
            }
            SessionState::Expired => Err(DelegationError::CredentialExpired(format!(
                "session {} expired at {}",
                id, session.expires_at
            ))),
            SessionState::Pending | SessionState::Revoked => Err(DelegationError::UnknownSession(
                format!("{} is {:?}", id, session.state),
            )),
        }
    }

    /// Active, unexpired credentials of `identity`, most recent first
    pub fn get_by_identity(&self, identity: &DistinguishedName) -> Vec<Credential> {
        let now = self.clock.now();
        let until = self.tombstone_until(now);
        let mut inner = self.lock();
        let ids = inner.by_identity.get(identity).cloned().unwrap_or_default();

        let mut live = Vec::new();
        for id in ids {
            let Some(session) = inner.sessions.get(&id) else {
                continue;
            };
            if session.expires_at <= now {
                warn!("Delegation session {} expired at {}", id, session.expires_at);
                inner.retire(&id, SessionState::Expired, until);
                continue;
            }
            if let Some(credential) = &session.credential {
                live.push(((session.created_at, session.sequence), credential.clone()));
            }
        }
        live.sort_by(|a, b| b.0.cmp(&a.0));
        live.into_iter().map(|(_, credential)| credential).collect()
    }

    /// Snapshot of a session
    pub fn session_info(&self, id: &str) -> Option<SessionInfo> {
        self.lock().sessions.get(id).map(|s| s.info(id))
    }

    /// State of a session, if the cache still knows it
    pub fn session_state(&self, id: &str) -> Option<SessionState> {
        self.lock().sessions.get(id).map(|s| s.state)
    }

    /// Forget a session entirely, whatever its state
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.lock();
        match inner.sessions.remove(id) {
            Some(session) => {
                inner.unindex(id, session.identity.as_ref());
                debug!("Removed delegation session {}", id);
                true
            }
            None => false,
        }
    }

    /// Revoke a pending or active session
    pub fn revoke(&self, id: &str) -> Result<()> {
        let now = self.clock.now();
        let until = self.tombstone_until(now);
        let mut inner = self.lock();
        match inner.sessions.get(id).map(|s| s.state) {
            Some(SessionState::Pending) | Some(SessionState::Active) => {
                inner.retire(id, SessionState::Revoked, until);
                info!("Revoked delegation session {}", id);
                Ok(())
            }
            Some(state) => Err(DelegationError::UnknownSession(format!(
                "{} is already {:?}",
                id, state
            ))),
            None => Err(DelegationError::UnknownSession(id.to_string())),
        }
    }

    /// Expire what is due and drop tombstones past retention
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let until = self.tombstone_until(now);
        let mut inner = self.lock();
        let mut report = SweepReport::default();

        let due: Vec<(SessionId, SessionState)> = inner
            .sessions
            .iter()
            .filter(|(_, s)| !s.state.is_terminal() && s.expires_at <= now)
            .map(|(id, s)| (id.clone(), s.state))
            .collect();
        for (id, state) in due {
            if state == SessionState::Pending {
                inner.sessions.remove(&id);
                report.expired_pending += 1;
            } else {
                inner.retire(&id, SessionState::Expired, until);
                report.expired_active += 1;
            }
        }

        let before = inner.sessions.len();
        inner
            .sessions
            .retain(|_, s| s.retained_until.map_or(true, |t| t > now));
        report.tombstones_dropped = before - inner.sessions.len();

        if report != SweepReport::default() {
            info!(
                "Session sweep: {} pending timed out, {} active expired, {} tombstones dropped",
                report.expired_pending, report.expired_active, report.tombstones_dropped
            );
        }
        report
    }

    /// Number of sessions per state
    pub fn counts(&self) -> CacheCounts {
        let inner = self.lock();
        CacheCounts {
            pending: inner.count(SessionState::Pending),
            active: inner.count(SessionState::Active),
            tombstones: inner.sessions.values().filter(|s| s.state.is_terminal()).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::CertificateAuthority;
    use crate::config::KeyConfig;
    use crate::request::{DelegationConstraints, RequestParams};
    use crate::verification::TrustStore;

    struct Fixture {
        ca: CertificateAuthority,
        user: Credential,
        keys: KeyConfig,
    }

    impl Fixture {
        fn new(cn: &str) -> Self {
            let ca = CertificateAuthority::self_signed(
                &"/O=Grid/CN=Test CA".parse().unwrap(),
                Duration::days(2),
                1024,
            )
            .unwrap();
            let user = ca
                .issue_end_entity(&format!("/O=Grid/CN={}", cn).parse().unwrap(), Duration::days(1), 1024)
                .unwrap();
            let keys = KeyConfig {
                default_bits: 1024,
                ..KeyConfig::default()
            };
            Self { ca, user, keys }
        }

        fn trust(&self) -> TrustStore {
            self.ca.trust_store()
        }

        fn request(&self) -> CredentialRequest {
            CredentialRequest::generate(&RequestParams::default(), &self.keys).unwrap()
        }

        fn sign(&self, request: &CredentialRequest) -> String {
            let cert = self
                .user
                .sign_request(request.request(), &DelegationConstraints::default())
                .unwrap();
            format!("{}{}", cert, self.user.certificate_chain_pem().unwrap())
        }

        /// Full Init/Update round trip against `cache`
        fn delegate(&self, cache: &DelegationSessionCache) -> SessionId {
            let id = cache.insert_pending(self.request()).unwrap();
            let request = cache.pending_request(&id).unwrap();
            let credential = request.complete(self.sign(&request).as_bytes(), &self.trust()).unwrap();
            cache.activate(&id, credential).unwrap();
            id
        }
    }

    fn config() -> CacheConfig {
        CacheConfig {
            max_credentials_per_identity: 2,
            ..CacheConfig::default()
        }
    }

    fn manual_cache(config: CacheConfig) -> (DelegationSessionCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (DelegationSessionCache::with_clock(config, clock.clone()), clock)
    }

    #[test]
    fn test_pending_to_active() {
        let fixture = Fixture::new("Alice");
        let cache = DelegationSessionCache::new(config());
        let id = fixture.delegate(&cache);

        assert_eq!(cache.session_state(&id), Some(SessionState::Active));
        let credential = cache.get_by_id(&id).unwrap();
        assert_eq!(credential.identity_name().to_string(), "/O=Grid/CN=Alice");
        assert!(credential.has_private_key());
        assert_eq!(cache.counts().active, 1);
    }

    #[test]
    fn test_second_update_is_unknown_session() {
        let fixture = Fixture::new("Alice");
        let cache = DelegationSessionCache::new(config());
        let id = fixture.delegate(&cache);

        assert!(matches!(
            cache.pending_request(&id),
            Err(DelegationError::UnknownSession(_))
        ));
        let again = cache.get_by_id(&id).unwrap();
        assert!(matches!(
            cache.activate(&id, again),
            Err(DelegationError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_unknown_session() {
        let cache = DelegationSessionCache::new(config());
        assert!(matches!(
            cache.pending_request("no-such-session"),
            Err(DelegationError::UnknownSession(_))
        ));
        assert!(matches!(
            cache.get_by_id("no-such-session"),
            Err(DelegationError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_key_mismatch_leaves_session_pending() {
        let fixture = Fixture::new("Alice");
        let cache = DelegationSessionCache::new(config());
        let id = cache.insert_pending(fixture.request()).unwrap();

        // Signed for some other key
        let other = fixture.request();
        let bundle = fixture.sign(&other);
        let request = cache.pending_request(&id).unwrap();
        assert!(matches!(
            request.complete(bundle.as_bytes(), &fixture.trust()),
            Err(DelegationError::KeyMismatch)
        ));
        assert_eq!(cache.session_state(&id), Some(SessionState::Pending));

        // The right bundle still completes it
        let credential = request
            .complete(fixture.sign(&request).as_bytes(), &fixture.trust())
            .unwrap();
        cache.activate(&id, credential).unwrap();
        assert_eq!(cache.session_state(&id), Some(SessionState::Active));
    }

    #[test]
    fn test_per_identity_bound_evicts_oldest() {
        let fixture = Fixture::new("Alice");
        let (cache, clock) = manual_cache(config());

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(fixture.delegate(&cache));
            clock.advance(Duration::seconds(1));
        }

        let identity = fixture.user.identity_name();
        let retained = cache.get_by_identity(&identity);
        assert_eq!(retained.len(), 2);
        assert_eq!(cache.session_state(&ids[0]), Some(SessionState::Revoked));
        assert!(matches!(
            cache.get_by_id(&ids[0]),
            Err(DelegationError::UnknownSession(_))
        ));

        // Most recent first
        assert_eq!(
            retained[0].certificate(),
            cache.get_by_id(&ids[2]).unwrap().certificate()
        );
        assert_eq!(
            retained[1].certificate(),
            cache.get_by_id(&ids[1]).unwrap().certificate()
        );
    }

    #[test]
    fn test_other_identities_unaffected_by_eviction() {
        let alice = Fixture::new("Alice");
        let bob = Fixture::new("Bob");
        let cache = DelegationSessionCache::new(config());

        let bob_id = bob.delegate(&cache);
        for _ in 0..3 {
            alice.delegate(&cache);
        }
        assert_eq!(cache.session_state(&bob_id), Some(SessionState::Active));
        assert_eq!(cache.get_by_identity(&bob.user.identity_name()).len(), 1);
        assert_eq!(cache.get_by_identity(&alice.user.identity_name()).len(), 2);
    }

    #[test]
    fn test_global_bound() {
        let alice = Fixture::new("Alice");
        let bob = Fixture::new("Bob");
        let (cache, clock) = manual_cache(CacheConfig {
            max_active_sessions: Some(1),
            ..config()
        });

        let first = alice.delegate(&cache);
        clock.advance(Duration::seconds(1));
        let second = bob.delegate(&cache);

        assert_eq!(cache.session_state(&first), Some(SessionState::Revoked));
        assert_eq!(cache.session_state(&second), Some(SessionState::Active));
        assert_eq!(cache.counts().active, 1);
    }

    #[test]
    fn test_expired_session_lookups() {
        let fixture = Fixture::new("Alice");
        let (cache, clock) = manual_cache(CacheConfig {
            max_credential_lifetime: std::time::Duration::from_secs(60),
            ..config()
        });
        let id = fixture.delegate(&cache);
        let info = cache.session_info(&id).unwrap();
        assert!(info.expires_at <= info.created_at + Duration::seconds(60));

        clock.advance(Duration::seconds(61));
        assert!(cache.get_by_identity(&fixture.user.identity_name()).is_empty());
        assert!(matches!(
            cache.get_by_id(&id),
            Err(DelegationError::CredentialExpired(_))
        ));
        assert_eq!(cache.session_state(&id), Some(SessionState::Expired));
    }

    #[test]
    fn test_pending_timeout() {
        let fixture = Fixture::new("Alice");
        let (cache, clock) = manual_cache(config());
        let id = cache.insert_pending(fixture.request()).unwrap();

        clock.advance(Duration::minutes(6));
        assert!(matches!(
            cache.pending_request(&id),
            Err(DelegationError::UnknownSession(_))
        ));
        assert_eq!(cache.session_state(&id), None);
    }

    #[test]
    fn test_capacity_exceeded_after_purge() {
        let fixture = Fixture::new("Alice");
        let (cache, clock) = manual_cache(CacheConfig {
            max_pending_sessions: 1,
            ..config()
        });
        cache.insert_pending(fixture.request()).unwrap();
        assert!(matches!(
            cache.insert_pending(fixture.request()),
            Err(DelegationError::CapacityExceeded(_))
        ));

        // Once the first one times out there is room again
        clock.advance(Duration::minutes(6));
        cache.insert_pending(fixture.request()).unwrap();
        assert_eq!(cache.counts().pending, 1);
    }

    #[test]
    fn test_revoke_and_remove() {
        let fixture = Fixture::new("Alice");
        let cache = DelegationSessionCache::new(config());
        let active = fixture.delegate(&cache);
        let pending = cache.insert_pending(fixture.request()).unwrap();

        cache.revoke(&active).unwrap();
        assert!(matches!(
            cache.get_by_id(&active),
            Err(DelegationError::UnknownSession(_))
        ));
        assert!(cache.get_by_identity(&fixture.user.identity_name()).is_empty());
        assert!(cache.revoke(&active).is_err());

        assert!(cache.remove(&pending));
        assert!(!cache.remove(&pending));
        assert!(matches!(
            cache.pending_request(&pending),
            Err(DelegationError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_sweep() {
        let fixture = Fixture::new("Alice");
        let (cache, clock) = manual_cache(CacheConfig {
            max_credential_lifetime: std::time::Duration::from_secs(600),
            tombstone_retention: std::time::Duration::from_secs(60),
            ..config()
        });
        let active = fixture.delegate(&cache);
        cache.insert_pending(fixture.request()).unwrap();

        clock.advance(Duration::minutes(11));
        let report = cache.sweep();
        assert_eq!(report.expired_pending, 1);
        assert_eq!(report.expired_active, 1);
        assert_eq!(report.tombstones_dropped, 0);
        assert!(matches!(
            cache.get_by_id(&active),
            Err(DelegationError::CredentialExpired(_))
        ));

        clock.advance(Duration::minutes(2));
        assert_eq!(cache.sweep().tombstones_dropped, 1);
        assert_eq!(cache.counts(), CacheCounts::default());
        assert!(matches!(
            cache.get_by_id(&active),
            Err(DelegationError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_concurrent_activation_single_winner() {
        let fixture = Fixture::new("Alice");
        let cache = Arc::new(DelegationSessionCache::new(config()));
        let id = cache.insert_pending(fixture.request()).unwrap();
        let request = cache.pending_request(&id).unwrap();
        let credential = request
            .complete(fixture.sign(&request).as_bytes(), &fixture.trust())
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let id = id.clone();
                let credential = credential.clone();
                std::thread::spawn(move || cache.activate(&id, credential).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }
}
