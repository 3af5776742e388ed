//! Request/response correlation broker.
//!
//! Every HTTP request that needs a device round trip goes through three
//! phases owned by this module:
//!
//! 1. **Admission** — the device must be connected and must not already have
//!    a request of the same kind in flight (single-flight per device, per
//!    kind). Admission failures are synchronous and never dispatch anything.
//! 2. **Dispatch** — the serialized command is emitted on the device socket.
//!    A dispatch failure rolls the admission back and reports
//!    `ServiceUnavailable`.
//! 3. **Resolution** — the socket layer routes a correlated device reply
//!    back through [`Broker::resolve`], which wakes the waiting handler via
//!    a oneshot. If no reply arrives, the handler's timeout elapses and
//!    [`Broker::expire`] removes the entry.
//!
//! The pending table and the single-flight index live behind one mutex so
//! "check pending, then insert" is atomic. Removal from the table decides
//! every race: a reply for an id that is no longer present (timed out,
//! already resolved, or claimed by the wrong device) is silently discarded,
//! and a timeout for an id that was just resolved is a no-op.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::protocol::DeviceReply;
use crate::registry::DeviceRegistry;

/// The two command kinds a device can execute. Single-flight admission is
/// tracked per kind, so one chat and one speech request may be outstanding
/// for the same device simultaneously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Chat,
    Speech,
}

impl RequestKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Speech => "speech",
        }
    }
}

/// A request admitted but not yet resolved. The `device_id` field is the
/// request→device mapping used to reject replies from non-owning devices;
/// it lives and dies atomically with the table entry.
struct PendingEntry {
    device_id: String,
    kind: RequestKind,
    reply_tx: oneshot::Sender<DeviceReply>,
    created_at: Instant,
}

#[derive(Default)]
struct PendingTable {
    /// `request_id → entry`.
    entries: HashMap<String, PendingEntry>,
    /// `device_id → kinds currently outstanding` (single-flight index).
    inflight: HashMap<String, HashSet<RequestKind>>,
}

impl PendingTable {
    /// Remove an entry and its single-flight mark together.
    fn remove(&mut self, request_id: &str) -> Option<PendingEntry> {
        let entry = self.entries.remove(request_id)?;
        if let Some(kinds) = self.inflight.get_mut(&entry.device_id) {
            kinds.remove(&entry.kind);
            if kinds.is_empty() {
                self.inflight.remove(&entry.device_id);
            }
        }
        Some(entry)
    }
}

/// A successfully admitted request: the id to put on the wire and the
/// receiver the handler awaits (wrapped in its timeout).
#[derive(Debug)]
pub struct Admitted {
    pub request_id: String,
    pub reply_rx: oneshot::Receiver<DeviceReply>,
}

/// Shared broker handle.
#[derive(Clone)]
pub struct Broker {
    registry: DeviceRegistry,
    table: Arc<Mutex<PendingTable>>,
}

impl Broker {
    #[must_use]
    pub fn new(registry: DeviceRegistry) -> Self {
        Self {
            registry,
            table: Arc::new(Mutex::new(PendingTable::default())),
        }
    }

    /// Admission control: device connected, single-flight slot free.
    ///
    /// On success the entry is inserted and the generated request id
    /// returned; nothing has been dispatched yet.
    pub async fn admit(&self, device_id: &str, kind: RequestKind) -> Result<Admitted, ApiError> {
        if !self.registry.is_connected(device_id).await {
            return Err(ApiError::DeviceUnavailable(device_id.to_string()));
        }

        let mut table = self.table.lock().await;
        let kinds = table.inflight.entry(device_id.to_string()).or_default();
        if kinds.contains(&kind) {
            debug!(device_id = %device_id, kind = kind.as_str(), "Admission rejected: busy");
            return Err(ApiError::DeviceBusy);
        }
        kinds.insert(kind);

        let request_id = uuid::Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        table.entries.insert(
            request_id.clone(),
            PendingEntry {
                device_id: device_id.to_string(),
                kind,
                reply_tx,
                created_at: Instant::now(),
            },
        );
        debug!(device_id = %device_id, request_id = %request_id, kind = kind.as_str(), "Admitted");
        Ok(Admitted {
            request_id,
            reply_rx,
        })
    }

    /// Emit a command on the device socket. Fire-and-forget: the effect is
    /// observed only through the correlated reply or the timeout. A send
    /// failure rolls back the admission.
    pub async fn dispatch(
        &self,
        request_id: &str,
        device_id: &str,
        command: Value,
    ) -> Result<(), ApiError> {
        let Some(sender) = self.registry.sender(device_id).await else {
            self.table.lock().await.remove(request_id);
            return Err(ApiError::ServiceUnavailable(format!(
                "Device '{device_id}' disconnected before dispatch"
            )));
        };
        if sender.send(command).await.is_err() {
            self.table.lock().await.remove(request_id);
            return Err(ApiError::ServiceUnavailable(format!(
                "Failed to send command to device '{device_id}'"
            )));
        }
        Ok(())
    }

    /// Apply a correlated device reply.
    ///
    /// The reply is discarded unless the entry exists and was dispatched to
    /// the device the reply arrived from — this rejects spoofed and
    /// duplicate replies and tolerates the race between timeout fallback and
    /// a late real reply.
    pub async fn resolve(&self, device_id: &str, request_id: &str, reply: DeviceReply) {
        let entry = {
            let mut table = self.table.lock().await;
            match table.entries.get(request_id) {
                Some(e) if e.device_id == device_id => table.remove(request_id),
                Some(e) => {
                    warn!(
                        request_id = %request_id,
                        claimed_by = %device_id,
                        owner = %e.device_id,
                        "Reply from non-owning device discarded"
                    );
                    return;
                }
                None => {
                    debug!(
                        device_id = %device_id,
                        request_id = %request_id,
                        "Reply for timed-out or unknown request (dropped)"
                    );
                    return;
                }
            }
        };
        if let Some(entry) = entry {
            let elapsed_ms = entry.created_at.elapsed().as_millis() as u64;
            debug!(
                device_id = %device_id,
                request_id = %request_id,
                kind = entry.kind.as_str(),
                elapsed_ms,
                "Resolved"
            );
            // Receiver may already be gone if the timeout raced us — no-op.
            let _ = entry.reply_tx.send(reply);
        }
    }

    /// Timeout path: remove the entry if it is still pending. Returns `true`
    /// when this call actually removed it (i.e. the timeout won the race).
    pub async fn expire(&self, request_id: &str) -> bool {
        let removed = self.table.lock().await.remove(request_id);
        if let Some(entry) = removed {
            info!(
                device_id = %entry.device_id,
                request_id = %request_id,
                kind = entry.kind.as_str(),
                "Request timed out"
            );
            true
        } else {
            false
        }
    }

    /// Drain every pending request for a device that just disconnected,
    /// waking each waiter immediately instead of letting it run out its
    /// timeout.
    pub async fn fail_device(&self, device_id: &str) {
        let drained: Vec<PendingEntry> = {
            let mut table = self.table.lock().await;
            let ids: Vec<String> = table
                .entries
                .iter()
                .filter(|(_, e)| e.device_id == device_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };
        if !drained.is_empty() {
            info!(
                device_id = %device_id,
                count = drained.len(),
                "Drained pending requests: device disconnected"
            );
        }
        for entry in drained {
            let _ = entry.reply_tx.send(DeviceReply::Disconnected);
        }
    }

    /// Kinds currently outstanding for a device (status endpoint).
    pub async fn inflight_kinds(&self, device_id: &str) -> Vec<RequestKind> {
        self.table
            .lock()
            .await
            .inflight
            .get(device_id)
            .map(|kinds| kinds.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Total pending requests across all devices.
    pub async fn pending_count(&self) -> usize {
        self.table.lock().await.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn connected_registry(device_id: &str) -> (DeviceRegistry, mpsc::Receiver<Value>) {
        let registry = DeviceRegistry::new();
        let (tx, rx) = mpsc::channel(8);
        let _shutdown = registry.register(device_id, tx).await;
        (registry, rx)
    }

    #[tokio::test]
    async fn admit_rejects_disconnected_device() {
        let broker = Broker::new(DeviceRegistry::new());
        let err = broker.admit("ghost", RequestKind::Chat).await.unwrap_err();
        assert!(matches!(err, ApiError::DeviceUnavailable(_)));
        assert_eq!(broker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn single_flight_per_device_per_kind() {
        let (registry, _rx) = connected_registry("dev1").await;
        let broker = Broker::new(registry);

        let first = broker.admit("dev1", RequestKind::Chat).await.unwrap();
        // Second chat is rejected while the first is outstanding
        assert!(matches!(
            broker.admit("dev1", RequestKind::Chat).await,
            Err(ApiError::DeviceBusy)
        ));
        // A speech request is a different slot
        let speech = broker.admit("dev1", RequestKind::Speech).await.unwrap();

        // Resolving the chat frees its slot
        broker
            .resolve(
                "dev1",
                &first.request_id,
                DeviceReply::Chat {
                    text: "ok".into(),
                    model: None,
                },
            )
            .await;
        assert!(broker.admit("dev1", RequestKind::Chat).await.is_ok());
        drop(speech);
    }

    #[tokio::test]
    async fn single_flight_does_not_cross_devices() {
        let registry = DeviceRegistry::new();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        let _s1 = registry.register("a", tx1).await;
        let _s2 = registry.register("b", tx2).await;
        let broker = Broker::new(registry);

        let _a = broker.admit("a", RequestKind::Chat).await.unwrap();
        assert!(broker.admit("b", RequestKind::Chat).await.is_ok());
    }

    #[tokio::test]
    async fn resolve_routes_reply_to_waiter() {
        let (registry, mut device_rx) = connected_registry("dev1").await;
        let broker = Broker::new(registry);

        let admitted = broker.admit("dev1", RequestKind::Chat).await.unwrap();
        broker
            .dispatch(
                &admitted.request_id,
                "dev1",
                serde_json::json!({"type": "chat_completion"}),
            )
            .await
            .unwrap();
        // Command reached the device socket channel
        assert!(device_rx.recv().await.is_some());

        broker
            .resolve(
                "dev1",
                &admitted.request_id,
                DeviceReply::Chat {
                    text: "hello".into(),
                    model: Some("m".into()),
                },
            )
            .await;
        match admitted.reply_rx.await.unwrap() {
            DeviceReply::Chat { text, .. } => assert_eq!(text, "hello"),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reply_from_non_owning_device_is_discarded() {
        let registry = DeviceRegistry::new();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        let _s1 = registry.register("a", tx1).await;
        let _s2 = registry.register("b", tx2).await;
        let broker = Broker::new(registry);

        let mut admitted = broker.admit("a", RequestKind::Chat).await.unwrap();
        broker
            .resolve(
                "b",
                &admitted.request_id,
                DeviceReply::Chat {
                    text: "spoofed".into(),
                    model: None,
                },
            )
            .await;

        // Original request is still pending and unresolved
        assert!(admitted.reply_rx.try_recv().is_err());
        assert_eq!(broker.pending_count().await, 1);
        assert!(matches!(
            broker.admit("a", RequestKind::Chat).await,
            Err(ApiError::DeviceBusy)
        ));
    }

    #[tokio::test]
    async fn expire_wins_race_and_late_reply_is_noop() {
        let (registry, _rx) = connected_registry("dev1").await;
        let broker = Broker::new(registry);

        let admitted = broker.admit("dev1", RequestKind::Chat).await.unwrap();
        assert!(broker.expire(&admitted.request_id).await);
        // Second expiry is a no-op
        assert!(!broker.expire(&admitted.request_id).await);
        // A late reply after expiry is silently discarded
        broker
            .resolve(
                "dev1",
                &admitted.request_id,
                DeviceReply::Chat {
                    text: "late".into(),
                    model: None,
                },
            )
            .await;
        assert_eq!(broker.pending_count().await, 0);
        // Slot was freed exactly once
        assert!(broker.admit("dev1", RequestKind::Chat).await.is_ok());
    }

    #[tokio::test]
    async fn dispatch_failure_rolls_back_admission() {
        let registry = DeviceRegistry::new();
        let (tx, rx) = mpsc::channel(8);
        let _shutdown = registry.register("dev1", tx.clone()).await;
        let broker = Broker::new(registry.clone());

        let admitted = broker.admit("dev1", RequestKind::Chat).await.unwrap();
        // Close the device's receive side: the session entry still exists,
        // so dispatch reaches the send and the send fails.
        drop(rx);
        drop(tx);

        let err = broker
            .dispatch(&admitted.request_id, "dev1", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::ServiceUnavailable(_)));
        assert_eq!(broker.pending_count().await, 0);
        assert!(broker.inflight_kinds("dev1").await.is_empty());
    }

    #[tokio::test]
    async fn fail_device_drains_and_wakes_waiters() {
        let (registry, _rx) = connected_registry("dev1").await;
        let broker = Broker::new(registry);

        let chat = broker.admit("dev1", RequestKind::Chat).await.unwrap();
        let speech = broker.admit("dev1", RequestKind::Speech).await.unwrap();

        broker.fail_device("dev1").await;
        assert!(matches!(
            chat.reply_rx.await.unwrap(),
            DeviceReply::Disconnected
        ));
        assert!(matches!(
            speech.reply_rx.await.unwrap(),
            DeviceReply::Disconnected
        ));
        assert_eq!(broker.pending_count().await, 0);
    }
}
