//! Bounded pool of browser instances.
//!
//! Each instance is a dedicated headless browser owned by exactly one socket.
//! The pool enforces `max_browsers` by evicting the least-recently-used
//! instance, reaps instances idle past a threshold, and executes input
//! actions against a named instance. Errors are returned as values; nothing
//! here panics into a caller's frame loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use periscope_protocol::InputAction;

use crate::driver::{BrowserDriver, PageHandle, SnapshotOptions};

pub struct BrowserPool<D: BrowserDriver> {
    driver: D,
    instances: RwLock<HashMap<Uuid, ManagedInstance<D::Page>>>,
    max_browsers: usize,
}

struct ManagedInstance<P> {
    /// None while the launch is in flight. The reserved slot counts against
    /// capacity so two concurrent creates cannot both pass the check.
    page: Option<Arc<P>>,
    viewport: (u32, u32),
    current_url: String,
    last_activity: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("browser {0} not found")]
    NotFound(Uuid),
    #[error("browser pool at capacity ({0}) with no evictable instance")]
    Capacity(usize),
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("screenshot capture failed: {0}")]
    Capture(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("action '{verb}' failed: {message}")]
    Action { verb: &'static str, message: String },
}

impl<D: BrowserDriver> BrowserPool<D> {
    pub fn new(driver: D, max_browsers: usize) -> Self {
        Self {
            driver,
            instances: RwLock::new(HashMap::new()),
            max_browsers,
        }
    }

    /// Launch a new instance, evicting the least-recently-used one first if
    /// the pool is full. Returns the new instance's id.
    pub async fn create(&self, url: &str, width: u32, height: u32) -> Result<Uuid, PoolError> {
        let url = normalize_url(url);
        let id = Uuid::new_v4();

        // Victim selection and slot reservation happen under one write lock
        // so concurrent creates can neither exceed capacity nor pick the
        // same victim.
        let evicted = {
            let mut instances = self.instances.write().await;
            let mut evicted = None;
            if instances.len() >= self.max_browsers {
                let victim = instances
                    .iter()
                    .filter(|(_, m)| m.page.is_some())
                    .min_by_key(|(vid, m)| (m.last_activity, **vid))
                    .map(|(vid, _)| *vid);
                match victim {
                    Some(vid) => evicted = instances.remove(&vid).map(|m| (vid, m)),
                    None => return Err(PoolError::Capacity(self.max_browsers)),
                }
            }
            instances.insert(
                id,
                ManagedInstance {
                    page: None,
                    viewport: (width, height),
                    current_url: url.clone(),
                    last_activity: Instant::now(),
                },
            );
            evicted
        };

        if let Some((victim_id, managed)) = evicted {
            tracing::info!(%victim_id, "Evicting least-recently-used browser");
            if let Some(page) = managed.page {
                page.close().await;
            }
        }

        // Launch outside the lock; it can take seconds.
        match self.driver.open(&url, width, height).await {
            Ok(page) => {
                let mut instances = self.instances.write().await;
                match instances.get_mut(&id) {
                    Some(managed) => {
                        managed.page = Some(Arc::new(page));
                        managed.last_activity = Instant::now();
                    }
                    None => {
                        // The reservation vanished (pool shutdown) — don't
                        // leak the freshly launched browser.
                        drop(instances);
                        page.close().await;
                        return Err(PoolError::NotFound(id));
                    }
                }
                tracing::info!(%id, %url, width, height, "Browser instance created");
                Ok(id)
            }
            Err(e) => {
                self.instances.write().await.remove(&id);
                Err(PoolError::Launch(e.to_string()))
            }
        }
    }

    /// Close and remove an instance. Returns false when the id is unknown,
    /// which makes concurrent close/reap/evict safe: only one caller gets
    /// the instance out of the map.
    pub async fn close(&self, id: Uuid) -> bool {
        let managed = self.instances.write().await.remove(&id);
        match managed {
            Some(managed) => {
                if let Some(page) = managed.page {
                    page.close().await;
                }
                tracing::info!(%id, "Browser instance closed");
                true
            }
            None => false,
        }
    }

    /// Rasterise an instance's viewport.
    pub async fn snapshot(&self, id: Uuid, opts: SnapshotOptions) -> Result<Vec<u8>, PoolError> {
        let page = self.page(id).await?;
        let bytes = page
            .screenshot(opts)
            .await
            .map_err(|e| PoolError::Capture(e.to_string()))?;
        self.touch(id).await;
        Ok(bytes)
    }

    /// Navigate an instance, waiting for document-ready only. Returns the
    /// URL the page actually landed on.
    pub async fn navigate(&self, id: Uuid, url: &str) -> Result<String, PoolError> {
        let url = normalize_url(url);
        let page = self.page(id).await?;
        page.goto(&url)
            .await
            .map_err(|e| PoolError::Navigation(e.to_string()))?;
        // Redirects may land elsewhere; prefer what the page reports.
        let landed = page.current_url().await.unwrap_or_else(|_| url.clone());

        let mut instances = self.instances.write().await;
        if let Some(managed) = instances.get_mut(&id) {
            managed.current_url = landed.clone();
            managed.last_activity = Instant::now();
        }
        Ok(landed)
    }

    /// Replay one input action into an instance.
    pub async fn execute(&self, id: Uuid, action: &InputAction) -> Result<(), PoolError> {
        let page = self.page(id).await?;
        page.input(action).await.map_err(|e| PoolError::Action {
            verb: action.verb(),
            message: e.to_string(),
        })?;
        self.touch(id).await;
        Ok(())
    }

    /// Change an instance's viewport.
    pub async fn resize(&self, id: Uuid, width: u32, height: u32) -> Result<(), PoolError> {
        let page = self.page(id).await?;
        page.set_viewport(width, height)
            .await
            .map_err(|e| PoolError::Action {
                verb: "resize",
                message: e.to_string(),
            })?;

        let mut instances = self.instances.write().await;
        if let Some(managed) = instances.get_mut(&id) {
            managed.viewport = (width, height);
            managed.last_activity = Instant::now();
        }
        Ok(())
    }

    /// Last navigation target recorded for an instance.
    pub async fn current_url(&self, id: Uuid) -> Result<String, PoolError> {
        let instances = self.instances.read().await;
        instances
            .get(&id)
            .map(|m| m.current_url.clone())
            .ok_or(PoolError::NotFound(id))
    }

    pub async fn list(&self) -> Vec<Uuid> {
        self.instances.read().await.keys().copied().collect()
    }

    pub async fn count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Close every instance idle longer than `timeout`. Returns how many
    /// were reaped. Safe against concurrent close: the removal under the
    /// write lock is the single point of ownership transfer.
    pub async fn reap_idle(&self, timeout: Duration) -> usize {
        let stale: Vec<Uuid> = {
            let now = Instant::now();
            let instances = self.instances.read().await;
            instances
                .iter()
                .filter(|(_, m)| m.page.is_some() && now.duration_since(m.last_activity) > timeout)
                .map(|(id, _)| *id)
                .collect()
        };

        let mut reaped = 0;
        for id in stale {
            // Re-check under the write lock; the instance may have been
            // touched or closed since the scan.
            let managed = {
                let mut instances = self.instances.write().await;
                match instances.get(&id) {
                    Some(m) if Instant::now().duration_since(m.last_activity) > timeout => {
                        instances.remove(&id)
                    }
                    _ => None,
                }
            };
            if let Some(managed) = managed {
                tracing::info!(%id, "Reaping idle browser (idle > {}s)", timeout.as_secs());
                if let Some(page) = managed.page {
                    page.close().await;
                }
                reaped += 1;
            }
        }
        reaped
    }

    /// Close everything; used on graceful shutdown.
    pub async fn shutdown(&self) {
        let all: Vec<Uuid> = self.list().await;
        for id in all {
            self.close(id).await;
        }
        tracing::info!("Browser pool shut down");
    }

    async fn page(&self, id: Uuid) -> Result<Arc<D::Page>, PoolError> {
        let instances = self.instances.read().await;
        instances
            .get(&id)
            .and_then(|m| m.page.clone())
            .ok_or(PoolError::NotFound(id))
    }

    async fn touch(&self, id: Uuid) {
        let mut instances = self.instances.write().await;
        if let Some(managed) = instances.get_mut(&id) {
            managed.last_activity = Instant::now();
        }
    }
}

/// Prepend `https://` when the target has no scheme. Bare hostnames are what
/// clients type; anything already carrying a scheme passes through.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return "about:blank".to_string();
    }
    if trimmed.contains("://") || trimmed.starts_with("about:") || trimmed.starts_with("data:") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}
