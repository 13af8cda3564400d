//! buttoncast - debounced GPIO push-button to WebSocket broadcaster.
//!
//! A single button on a Raspberry Pi pin is polled, debounced and turned into
//! `DOWN` messages for every connected WebSocket client. A client can send
//! `EXIT` to stop the kiosk browser and the server.

pub mod button;
pub mod config;
pub mod process;
pub mod server;
pub mod supervisor;
