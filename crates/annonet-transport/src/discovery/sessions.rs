//! Registry of servers seen via announcements, keyed by announced IP.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;

/// A discovered server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub ip: String,
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    info: SessionInfo,
    last_seen: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<DashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an announcement. The first announcement for an IP wins; later
    /// ones only refresh its last-seen time. Returns true if the session is
    /// new.
    pub fn observe(&self, info: SessionInfo) -> bool {
        let now = Instant::now();
        match self.inner.entry(info.ip.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                e.get_mut().last_seen = now;
                false
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(SessionEntry { info, last_seen: now });
                true
            }
        }
    }

    pub fn get(&self, ip: &str) -> Option<SessionInfo> {
        self.inner.get(ip).map(|e| e.info.clone())
    }

    /// Sessions ordered by IP.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.inner.iter().map(|e| e.info.clone()).collect();
        sessions.sort_by(|a, b| a.ip.cmp(&b.ip));
        sessions
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drop sessions not seen within `ttl`. Returns how many were removed.
    pub fn expire(&self, ttl: Duration) -> usize {
        let before = self.inner.len();
        self.inner.retain(|ip, entry| {
            let keep = entry.last_seen.elapsed() < ttl;
            if !keep {
                tracing::info!(%ip, name = %entry.info.name, "session expired");
            }
            keep
        });
        before.saturating_sub(self.inner.len())
    }
}

/// Periodically expire stale sessions, calling `on_expired` with the number
/// removed whenever any were.
pub async fn expiry_loop(
    registry: SessionRegistry,
    ttl: Duration,
    on_expired: impl Fn(usize) + Send + 'static,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval((ttl / 2).max(Duration::from_millis(100)));
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {
                let removed = registry.expire(ttl);
                if removed > 0 {
                    on_expired(removed);
                }
            }
        }
    }
}
