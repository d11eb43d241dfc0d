//! Agentrix server: Axum HTTP + WebSocket surface over the core engine.

mod web_server;

pub use web_server::{router, run_web_server, AppState};
