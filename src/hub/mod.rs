//! Broadcast hub - fan-out of console events to viewers
//!
//! Viewers join named rooms (one per console, `console:<server_id>`) and
//! receive `HubEvent`s through their own bounded queue. Delivery is
//! best-effort: a viewer that cannot keep up loses messages, nobody waits.

mod room;
mod types;

pub use room::{BroadcastHub, HubError, ViewerConnection, DEFAULT_VIEWER_QUEUE};
pub use types::{EventKind, HubEvent, ViewerInfo};

/// Room name used for a server's console
pub fn console_room(server_id: &str) -> String {
    format!("console:{}", server_id)
}
