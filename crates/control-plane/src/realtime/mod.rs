//! Realtime namespaces, rooms and per-connection event streams.

pub mod hub;

pub use hub::{EventSender, HubError, RealtimeEvent, RealtimeHub, JOIN_ROOM_ERROR};
