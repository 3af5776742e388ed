//! Device registry — live socket sessions and device records.
//!
//! Two maps, both keyed by device id:
//!
//! - **Sessions** — live `device_id → socket handle` entries, populated when
//!   a device's WebSocket registers and cleared on disconnect. The broker
//!   and the MCP manager treat this map as read-only; only the socket layer
//!   and the stale sweep mutate it.
//! - **Records** — device identity and the optional PIN digest. Records
//!   outlive connections: a device keeps its PIN across reconnects.
//!
//! Duplicate registration for the same device id evicts the old session
//! (the stale handler is signalled through its `watch` channel) and replaces
//! it, so a device that reconnects after a network blip does not fight its
//! own ghost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn};

use crate::auth;
use crate::error::ApiError;

/// Validate device id format: alphanumeric, dash, underscore, dot, 1-64 chars.
#[must_use]
pub fn is_valid_device_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// A live device socket session.
pub struct DeviceSession {
    pub device_id: String,
    /// Send JSON payloads to the device over its socket.
    pub sender: mpsc::Sender<Value>,
    pub connected_since: Instant,
    /// Last heartbeat as ms since registry epoch (lock-free).
    pub last_heartbeat_ms: Arc<AtomicU64>,
    /// Signal the socket handler to shut down on duplicate registration.
    pub shutdown_tx: watch::Sender<bool>,
}

/// Persistent-ish device identity: survives disconnects for the process
/// lifetime. Identity minting and durable storage belong to the external
/// registry collaborator; this is its in-process interface.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub device_id: String,
    pub pin_hash: Option<[u8; 32]>,
    pub first_seen: u64,
    pub last_connected: Option<u64>,
    pub last_synced: Option<u64>,
}

/// Connection summary for the status endpoint.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub connected_secs: u64,
    pub last_heartbeat_ago_ms: u64,
}

/// Shared registry handle.
#[derive(Clone)]
pub struct DeviceRegistry {
    sessions: Arc<RwLock<HashMap<String, DeviceSession>>>,
    records: Arc<RwLock<HashMap<String, DeviceRecord>>>,
    /// Process epoch for lock-free heartbeat timestamps.
    epoch: Instant,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            records: Arc::new(RwLock::new(HashMap::new())),
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since the registry epoch.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Register a device socket, evicting any stale session for the same id.
    ///
    /// Returns the receiver the socket handler must watch for eviction.
    pub async fn register(
        &self,
        device_id: &str,
        sender: mpsc::Sender<Value>,
    ) -> watch::Receiver<bool> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = DeviceSession {
            device_id: device_id.to_string(),
            sender,
            connected_since: Instant::now(),
            last_heartbeat_ms: Arc::new(AtomicU64::new(self.now_ms())),
            shutdown_tx,
        };

        {
            let mut sessions = self.sessions.write().await;
            if let Some(old) = sessions.get(device_id) {
                warn!(
                    device_id = %device_id,
                    "Device re-registering while stale connection exists, evicting old"
                );
                let _ = old.shutdown_tx.send(true);
            }
            sessions.insert(device_id.to_string(), session);
        }

        let now = unix_now();
        let mut records = self.records.write().await;
        let record = records
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceRecord {
                device_id: device_id.to_string(),
                pin_hash: None,
                first_seen: now,
                last_connected: None,
                last_synced: None,
            });
        record.last_connected = Some(now);
        info!(device_id = %device_id, "Device registered");
        shutdown_rx
    }

    /// Remove a session, but only if `sender` still identifies it — a handler
    /// that was replaced by a fresh registration must not tear down its
    /// successor.
    pub async fn unregister(&self, device_id: &str, sender: &mpsc::Sender<Value>) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(device_id)
            .is_some_and(|s| s.sender.same_channel(sender))
        {
            sessions.remove(device_id);
            info!(device_id = %device_id, "Device disconnected");
            return true;
        }
        false
    }

    /// Whether a device currently has a live socket.
    pub async fn is_connected(&self, device_id: &str) -> bool {
        self.sessions.read().await.contains_key(device_id)
    }

    /// The socket sender for a device, if connected.
    pub async fn sender(&self, device_id: &str) -> Option<mpsc::Sender<Value>> {
        self.sessions
            .read()
            .await
            .get(device_id)
            .map(|s| s.sender.clone())
    }

    /// Ids of all connected devices.
    pub async fn connected_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Number of connected devices.
    pub async fn connected_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Record a heartbeat for a device (lock-free timestamp store).
    pub async fn heartbeat(&self, device_id: &str) {
        let now_ms = self.now_ms();
        if let Some(session) = self.sessions.read().await.get(device_id) {
            session.last_heartbeat_ms.store(now_ms, Ordering::Relaxed);
        }
    }

    /// Connection details for the status endpoint.
    pub async fn session_info(&self, device_id: &str) -> Option<SessionInfo> {
        let now_ms = self.now_ms();
        self.sessions.read().await.get(device_id).map(|s| {
            let last_hb = s.last_heartbeat_ms.load(Ordering::Relaxed);
            SessionInfo {
                connected_secs: s.connected_since.elapsed().as_secs(),
                last_heartbeat_ago_ms: now_ms.saturating_sub(last_hb),
            }
        })
    }

    /// Evict devices whose heartbeat is older than `timeout_secs`. Returns
    /// the evicted ids so the caller can drain their pending requests.
    ///
    /// Single write-lock pass with atomic heartbeat reads to avoid TOCTOU
    /// races (a device could heartbeat between a read-lock check and a
    /// write-lock eviction).
    pub async fn sweep_stale(&self, timeout_secs: u64) -> Vec<String> {
        let timeout_ms = timeout_secs * 1000;
        let now_ms = self.now_ms();

        let mut sessions = self.sessions.write().await;
        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| {
                now_ms.saturating_sub(s.last_heartbeat_ms.load(Ordering::Relaxed)) > timeout_ms
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(session) = sessions.remove(id) {
                let _ = session.shutdown_tx.send(true);
                warn!(device_id = %id, "Evicted device (heartbeat timeout)");
            }
        }
        stale
    }

    // ─── PIN credential store ────────────────────────────────────────────────

    /// Verify the `Authorization` header against the device's PIN.
    ///
    /// A device with no PIN set accepts unauthenticated requests; a device
    /// with a PIN rejects missing or mismatched credentials.
    pub async fn verify_pin(
        &self,
        device_id: &str,
        auth_header: Option<&str>,
    ) -> Result<(), ApiError> {
        let records = self.records.read().await;
        let Some(expected) = records.get(device_id).and_then(|r| r.pin_hash) else {
            return Ok(());
        };
        let Some(provided) = auth::bearer_token(auth_header) else {
            return Err(ApiError::AuthenticationFailed);
        };
        let provided_hash = auth::pin_digest(provided);
        if auth::constant_time_eq(&expected, &provided_hash) {
            Ok(())
        } else {
            Err(ApiError::AuthenticationFailed)
        }
    }

    /// Whether a device currently has a PIN set.
    pub async fn pin_enabled(&self, device_id: &str) -> bool {
        self.records
            .read()
            .await
            .get(device_id)
            .is_some_and(|r| r.pin_hash.is_some())
    }

    /// Set or replace a device's PIN. Creates the record if the device has
    /// never connected.
    pub async fn set_pin(&self, device_id: &str, pin: &str) -> Result<(), ApiError> {
        if !auth::is_valid_pin(pin) {
            return Err(ApiError::Validation(
                "PIN must be exactly 6 digits".to_string(),
            ));
        }
        let mut records = self.records.write().await;
        let now = unix_now();
        let record = records
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceRecord {
                device_id: device_id.to_string(),
                pin_hash: None,
                first_seen: now,
                last_connected: None,
                last_synced: None,
            });
        record.pin_hash = Some(auth::pin_digest(pin));
        info!(device_id = %device_id, "PIN enabled");
        Ok(())
    }

    /// Remove a device's PIN.
    pub async fn clear_pin(&self, device_id: &str) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(device_id) {
            record.pin_hash = None;
            info!(device_id = %device_id, "PIN disabled");
        }
    }

    /// A copy of the device's record, if one exists.
    pub async fn record(&self, device_id: &str) -> Option<DeviceRecord> {
        self.records.read().await.get(device_id).cloned()
    }

    /// Mark the device synced now and return the updated record.
    pub async fn mark_synced(&self, device_id: &str) -> DeviceRecord {
        let mut records = self.records.write().await;
        let now = unix_now();
        let record = records
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceRecord {
                device_id: device_id.to_string(),
                pin_hash: None,
                first_seen: now,
                last_connected: None,
                last_synced: None,
            });
        record.last_synced = Some(now);
        record.clone()
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::Sender<Value>, mpsc::Receiver<Value>) {
        mpsc::channel(8)
    }

    #[test]
    fn device_id_format() {
        assert!(is_valid_device_id("dev1"));
        assert!(is_valid_device_id("AB-12_c.d"));
        assert!(!is_valid_device_id(""));
        assert!(!is_valid_device_id("has space"));
        assert!(!is_valid_device_id(&"x".repeat(65)));
    }

    #[tokio::test]
    async fn register_and_unregister() {
        let registry = DeviceRegistry::new();
        let (tx, _rx) = channel();
        let _shutdown = registry.register("dev1", tx.clone()).await;
        assert!(registry.is_connected("dev1").await);
        assert!(registry.sender("dev1").await.is_some());

        assert!(registry.unregister("dev1", &tx).await);
        assert!(!registry.is_connected("dev1").await);
    }

    #[tokio::test]
    async fn duplicate_registration_evicts_old_session() {
        let registry = DeviceRegistry::new();
        let (tx1, _rx1) = channel();
        let mut shutdown1 = registry.register("dev1", tx1.clone()).await;
        let (tx2, _rx2) = channel();
        let _shutdown2 = registry.register("dev1", tx2.clone()).await;

        // Old handler was told to shut down
        shutdown1.changed().await.unwrap();
        assert!(*shutdown1.borrow());

        // Old handler's unregister must not remove the new session
        assert!(!registry.unregister("dev1", &tx1).await);
        assert!(registry.is_connected("dev1").await);
    }

    #[tokio::test]
    async fn pin_gate_null_pin_accepts_everything() {
        let registry = DeviceRegistry::new();
        assert!(registry.verify_pin("dev1", None).await.is_ok());
        assert!(registry
            .verify_pin("dev1", Some("Bearer 999999"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn pin_gate_set_pin_requires_exact_bearer() {
        let registry = DeviceRegistry::new();
        registry.set_pin("dev1", "123456").await.unwrap();

        assert!(matches!(
            registry.verify_pin("dev1", None).await,
            Err(ApiError::AuthenticationFailed)
        ));
        assert!(matches!(
            registry.verify_pin("dev1", Some("Bearer 000000")).await,
            Err(ApiError::AuthenticationFailed)
        ));
        assert!(matches!(
            registry.verify_pin("dev1", Some("Basic 123456")).await,
            Err(ApiError::AuthenticationFailed)
        ));
        assert!(registry
            .verify_pin("dev1", Some("Bearer 123456"))
            .await
            .is_ok());

        registry.clear_pin("dev1").await;
        assert!(registry.verify_pin("dev1", None).await.is_ok());
    }

    #[tokio::test]
    async fn set_pin_rejects_malformed() {
        let registry = DeviceRegistry::new();
        assert!(registry.set_pin("dev1", "12345").await.is_err());
        assert!(registry.set_pin("dev1", "abcdef").await.is_err());
        assert!(!registry.pin_enabled("dev1").await);
    }

    #[tokio::test]
    async fn sweep_evicts_only_silent_devices() {
        // Back-date the epoch so heartbeat ages are deterministic without sleeps.
        let registry = DeviceRegistry {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            records: Arc::new(RwLock::new(HashMap::new())),
            epoch: Instant::now() - std::time::Duration::from_secs(300),
        };
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let mut shutdown_quiet = registry.register("quiet", tx1).await;
        let _s2 = registry.register("chatty", tx2).await;

        // "quiet" last heartbeated at epoch (300s ago); "chatty" is fresh.
        {
            let sessions = registry.sessions.read().await;
            sessions
                .get("quiet")
                .unwrap()
                .last_heartbeat_ms
                .store(0, Ordering::Relaxed);
        }

        let evicted = registry.sweep_stale(90).await;
        assert_eq!(evicted, vec!["quiet".to_string()]);
        assert!(!registry.is_connected("quiet").await);
        assert!(registry.is_connected("chatty").await);
        shutdown_quiet.changed().await.unwrap();
        assert!(*shutdown_quiet.borrow());
    }
}
