//! simbridge - remote control plane for iOS simulators.
//!
//! A long-lived host process that creates and drives simulator sessions on a
//! macOS machine and exposes them to remote clients:
//!
//! - REST surface for session/app/media/file/recording management
//! - WebSocket endpoints for control input, frame-push video, ultra-low-latency
//!   video, WebRTC signaling, screenshot pull, and log streaming
//! - Durable session store that survives restarts and recovers simulators
//!   booted outside the server
//!
//! Architecture: `session::SessionManager` owns session identity and the
//! persistent store; `resources::ResourceManager` owns per-device capture
//! services; `connections::ConnectionManager` authorizes and tracks every
//! transport connection; `driver::HostDriver` is the only component that talks
//! to the host's simulator tooling. All of them are constructed explicitly in
//! `main` and shared through `api::AppState`.

pub mod api;
pub mod capture;
pub mod config;
pub mod connections;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod recording;
pub mod resources;
pub mod session;
pub mod store;
