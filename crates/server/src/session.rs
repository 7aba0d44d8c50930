//! Stable client identity across transport reconnects.
//!
//! A session holds the client's preferred stream settings and (weakly) the
//! browser it last used. Sessions never own browsers — the socket does — so
//! deleting a session never tears a stream down.
//!
//! The id map and the token index live behind a single lock and are mutated
//! together; the index can never dangle.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub token: String,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub settings: SessionSettings,
    pub metadata: HashMap<String, serde_json::Value>,
    /// Weak reference: lookup only, never ownership.
    pub browser_id: Option<Uuid>,
    pub ip_address: String,
    pub user_agent: String,
}

/// Client preferences carried across reconnects. `None` means "use the
/// server defaults".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSettings {
    pub fps: Option<u32>,
    pub quality: Option<u32>,
    pub adaptive: Option<bool>,
    pub resolution: Option<(u32, u32)>,
}

pub struct SessionStore {
    inner: RwLock<Inner>,
    timeout: Duration,
}

struct Inner {
    by_id: HashMap<Uuid, Session>,
    by_token: HashMap<String, Uuid>,
}

impl SessionStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                by_token: HashMap::new(),
            }),
            timeout,
        }
    }

    /// Resolve a presented token to its live session, or mint a fresh one.
    /// Refreshes activity and the caller's address/agent when they changed.
    pub async fn get_or_create(
        &self,
        token: Option<&str>,
        ip_address: &str,
        user_agent: &str,
    ) -> Session {
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        if let Some(token) = token
            && let Some(&id) = inner.by_token.get(token)
        {
            let expired = inner
                .by_id
                .get(&id)
                .is_none_or(|s| now.duration_since(s.last_activity) > self.timeout);
            if expired {
                inner.remove(id);
            } else if let Some(session) = inner.by_id.get_mut(&id) {
                session.last_activity = now;
                if session.ip_address != ip_address {
                    session.ip_address = ip_address.to_string();
                }
                if session.user_agent != user_agent {
                    session.user_agent = user_agent.to_string();
                }
                return session.clone();
            }
        }

        let session = Session {
            id: Uuid::new_v4(),
            token: generate_token(),
            created_at: now,
            last_activity: now,
            settings: SessionSettings::default(),
            metadata: HashMap::new(),
            browser_id: None,
            ip_address: ip_address.to_string(),
            user_agent: user_agent.to_string(),
        };
        inner.by_token.insert(session.token.clone(), session.id);
        inner.by_id.insert(session.id, session.clone());
        tracing::info!(session_id = %session.id, %ip_address, "Session created");
        session
    }

    pub async fn get(&self, id: Uuid) -> Option<Session> {
        self.inner.read().await.by_id.get(&id).cloned()
    }

    /// Token-based lookup with expiry enforcement: an expired session is
    /// deleted and reported as absent.
    pub async fn validate(&self, token: &str) -> Option<Session> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let id = *inner.by_token.get(token)?;
        let expired = inner
            .by_id
            .get(&id)
            .is_none_or(|s| now.duration_since(s.last_activity) > self.timeout);
        if expired {
            inner.remove(id);
            tracing::debug!(session_id = %id, "Session expired on validate");
            return None;
        }
        inner.by_id.get(&id).cloned()
    }

    pub async fn touch(&self, id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.by_id.get_mut(&id) {
            session.last_activity = Instant::now();
        }
    }

    pub async fn update_settings(&self, id: Uuid, settings: SessionSettings) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.by_id.get_mut(&id) {
            session.settings = settings;
            session.last_activity = Instant::now();
        }
    }

    pub async fn set_browser_id(&self, id: Uuid, browser_id: Option<Uuid>) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.by_id.get_mut(&id) {
            session.browser_id = browser_id;
        }
    }

    pub async fn delete(&self, id: Uuid) -> bool {
        self.inner.write().await.remove(id)
    }

    pub async fn all(&self) -> Vec<Session> {
        self.inner.read().await.by_id.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    /// Drop every session idle past the timeout. Returns how many were
    /// removed.
    pub async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let expired: Vec<Uuid> = inner
            .by_id
            .values()
            .filter(|s| now.duration_since(s.last_activity) > self.timeout)
            .map(|s| s.id)
            .collect();
        for id in &expired {
            inner.remove(*id);
            tracing::info!(session_id = %id, "Reaped expired session");
        }
        expired.len()
    }

    #[cfg(test)]
    async fn token_index_is_consistent(&self) -> bool {
        let inner = self.inner.read().await;
        inner.by_id.len() == inner.by_token.len()
            && inner
                .by_id
                .values()
                .all(|s| inner.by_token.get(&s.token) == Some(&s.id))
    }
}

impl Inner {
    /// Remove a session and its token entry together.
    fn remove(&mut self, id: Uuid) -> bool {
        match self.by_id.remove(&id) {
            Some(session) => {
                self.by_token.remove(&session.token);
                true
            }
            None => false,
        }
    }
}

/// 64 lowercase hex chars from 32 random bytes.
fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    let mut token = String::with_capacity(64);
    for b in bytes {
        write!(token, "{b:02x}").expect("writing to a String cannot fail");
    }
    token
}
