//! Room-based fan-out
//!
//! Each viewer owns a bounded queue. Broadcasting uses `try_send`, so a slow
//! viewer loses messages instead of stalling the broadcaster or its peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::types::{HubEvent, ViewerInfo};

/// Default per-viewer queue depth
pub const DEFAULT_VIEWER_QUEUE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Hub is shut down")]
    ShutDown,

    #[error("Viewer not found: {0}")]
    NotFound(String),

    #[error("Viewer queue full: {0}")]
    QueueFull(String),

    #[error("Viewer disconnected: {0}")]
    Closed(String),
}

struct ViewerSlot {
    info: ViewerInfo,
    tx: mpsc::Sender<Arc<HubEvent>>,
    closed: CancellationToken,
}

/// Receiving side handed to the transport layer for one viewer
pub struct ViewerConnection {
    pub info: ViewerInfo,
    pub room: String,
    events: mpsc::Receiver<Arc<HubEvent>>,
    closed: CancellationToken,
}

impl ViewerConnection {
    /// Next event, or `None` once the viewer left or the hub shut down
    pub async fn recv(&mut self) -> Option<Arc<HubEvent>> {
        tokio::select! {
            biased;
            event = self.events.recv() => event,
            _ = self.closed.cancelled() => None,
        }
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<Arc<HubEvent>> {
        self.events.try_recv().ok()
    }

    /// Fires when the hub drops this viewer
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Multi-room broadcast hub
pub struct BroadcastHub {
    /// room -> client_id -> viewer
    rooms: RwLock<HashMap<String, HashMap<String, ViewerSlot>>>,
    queue_capacity: usize,
    shut_down: AtomicBool,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_VIEWER_QUEUE)
    }
}

impl BroadcastHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Add a viewer to `room`, creating the room if needed
    ///
    /// Everyone already in the room gets a `user_joined` notice.
    pub fn join(&self, room: &str, info: ViewerInfo) -> Result<ViewerConnection, HubError> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let closed = CancellationToken::new();

        {
            let mut rooms = self.rooms.write();
            // Checked under the lock so a concurrent shutdown cannot miss us
            if self.shut_down.load(Ordering::SeqCst) {
                return Err(HubError::ShutDown);
            }
            rooms.entry(room.to_string()).or_default().insert(
                info.client_id.clone(),
                ViewerSlot {
                    info: info.clone(),
                    tx,
                    closed: closed.clone(),
                },
            );
        }

        info!(
            "Viewer {} ({}) joined room {}",
            info.username, info.client_id, room
        );
        self.broadcast_except(room, HubEvent::user_joined(&info), Some(&info.client_id));

        Ok(ViewerConnection {
            info,
            room: room.to_string(),
            events: rx,
            closed,
        })
    }

    /// Remove a viewer. Returns false if it was not in the room.
    pub fn leave(&self, room: &str, client_id: &str) -> bool {
        let (slot, room_empty) = {
            let mut rooms = self.rooms.write();
            let Some(viewers) = rooms.get_mut(room) else {
                return false;
            };
            let Some(slot) = viewers.remove(client_id) else {
                return false;
            };
            let empty = viewers.is_empty();
            if empty {
                rooms.remove(room);
            }
            (slot, empty)
        };

        slot.closed.cancel();
        info!(
            "Viewer {} ({}) left room {}",
            slot.info.username, slot.info.client_id, room
        );

        if room_empty {
            debug!("Room {} is empty, removed", room);
        } else {
            self.broadcast_except(room, HubEvent::user_left(&slot.info), None);
        }
        true
    }

    /// Deliver to every viewer in `room`. Returns how many accepted the event.
    pub fn broadcast_to_room(&self, room: &str, event: HubEvent) -> usize {
        self.broadcast_except(room, event, None)
    }

    /// Deliver to every viewer in `room` except `exclude`
    pub fn broadcast_except(&self, room: &str, event: HubEvent, exclude: Option<&str>) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut gone = Vec::new();

        {
            let rooms = self.rooms.read();
            let Some(viewers) = rooms.get(room) else {
                return 0;
            };

            for (client_id, slot) in viewers {
                if exclude == Some(client_id.as_str()) {
                    continue;
                }
                match slot.tx.try_send(Arc::clone(&event)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        debug!(
                            "Queue full for viewer {} in room {}, dropping {:?}",
                            client_id, room, event.kind
                        );
                    }
                    Err(TrySendError::Closed(_)) => gone.push(client_id.clone()),
                }
            }
        }

        // Receivers dropped without calling leave
        for client_id in gone {
            self.leave(room, &client_id);
        }

        delivered
    }

    /// Direct message to one viewer
    pub fn send_to_viewer(
        &self,
        room: &str,
        client_id: &str,
        event: HubEvent,
    ) -> Result<(), HubError> {
        let rooms = self.rooms.read();
        let slot = rooms
            .get(room)
            .and_then(|viewers| viewers.get(client_id))
            .ok_or_else(|| HubError::NotFound(client_id.to_string()))?;

        slot.tx.try_send(Arc::new(event)).map_err(|e| match e {
            TrySendError::Full(_) => HubError::QueueFull(client_id.to_string()),
            TrySendError::Closed(_) => HubError::Closed(client_id.to_string()),
        })
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.read().get(room).map_or(0, |v| v.len())
    }

    pub fn room_viewers(&self, room: &str) -> Vec<ViewerInfo> {
        self.rooms
            .read()
            .get(room)
            .map(|viewers| viewers.values().map(|s| s.info.clone()).collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Close every viewer and clear all rooms. Irreversible.
    pub fn shutdown(&self) {
        let rooms = {
            let mut rooms = self.rooms.write();
            self.shut_down.store(true, Ordering::SeqCst);
            std::mem::take(&mut *rooms)
        };

        let mut closed = 0;
        for (_, viewers) in rooms {
            for (_, slot) in viewers {
                slot.closed.cancel();
                closed += 1;
            }
        }
        info!("Broadcast hub shut down, closed {} viewers", closed);
    }
}
