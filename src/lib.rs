/// Sidebar terminal engine
/// Multi-tab PTY terminals for an AI coding sidebar, with live tracking of
/// whether the Claude Code CLI runs in each tab and whether it is busy
///
/// Module structure:
/// - models: Shared data types crossing the host boundary
/// - services: PTY sessions, process inspection, output classification, coordination
/// - commands: Tauri IPC handlers (behind the `tauri` feature)

pub mod config;
pub mod error;
pub mod models;
pub mod services;

#[cfg(feature = "tauri")]
pub mod commands;

pub use config::TerminalConfig;
pub use error::{Result, TerminalError};
pub use models::{AgentState, HostEvent, SessionId, TabId, TabInfo};
pub use services::{
    ChannelSink, Coordinator, HostSink, OsProcessLister, PtyRegistry, Shortcut, TerminalHandle, TerminalService,
};

use std::sync::Arc;

/// Wire the OS-backed engine together. The returned service must be spawned
/// on a Tokio runtime; the handle drives it.
pub fn start<H: HostSink>(
    config: TerminalConfig,
    host: H,
) -> (TerminalService<PtyRegistry, OsProcessLister, H>, TerminalHandle) {
    let registry = Arc::new(PtyRegistry::new(config.shell_path.clone(), config.cols, config.rows));
    let coordinator = Coordinator::new(config, registry, OsProcessLister, host);
    TerminalService::new(coordinator)
}
