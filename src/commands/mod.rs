/// Commands module
/// Tauri IPC handlers exposing the terminal engine to a webview host
/// Commands act as the boundary between the frontend and the coordinator

pub mod terminal;

pub use terminal::{init, EVENT_NAME};
