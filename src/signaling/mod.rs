//! Signaling Module - WebSocket Verbindung zum Chat-Server
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Server:
//! - WebSocket-Verbindung aufbauen, halten und trennen
//! - Envelopes serialisieren und senden
//! - Eingehende Nachrichten parsen und an Subscriber verteilen
//!

mod client;
mod messages;

pub use client::{
    ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState, EnvelopeSink,
    EventReceiver,
};
pub use messages::*;
