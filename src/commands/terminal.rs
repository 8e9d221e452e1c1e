/// Terminal Commands
/// Tauri plugin wrapping the terminal service. Invoked from the frontend as
/// `plugin:terminal|<command>`; every host notification arrives on
/// `terminal-event`.

use crate::config::TerminalConfig;
use crate::models::{HostEvent, TabId, TabInfo};
use crate::services::{HostSink, Shortcut, TerminalHandle};
use std::path::PathBuf;
use tauri::plugin::{Builder, TauriPlugin};
use tauri::{AppHandle, Emitter, Manager, RunEvent, Runtime, State};

pub const EVENT_NAME: &str = "terminal-event";

/// Forwards engine events to every webview
struct WebviewSink<R: Runtime> {
    app: AppHandle<R>,
}

impl<R: Runtime> HostSink for WebviewSink<R> {
    fn emit(&self, event: HostEvent) {
        if let Err(e) = self.app.emit(EVENT_NAME, event) {
            log::debug!("failed to emit terminal event: {e}");
        }
    }
}

pub fn init<R: Runtime>(config: TerminalConfig) -> TauriPlugin<R> {
    Builder::new("terminal")
        .invoke_handler(tauri::generate_handler![
            create_tab,
            activate_tab,
            write,
            resize,
            clear,
            kill_tab,
            reconnect,
            send_command,
            send_shortcut,
            set_agent_state,
            set_visible,
            list_tabs
        ])
        .setup(move |app, _api| {
            let (service, handle) = crate::start(config, WebviewSink { app: app.clone() });
            tauri::async_runtime::spawn(service.run());
            app.manage(handle);
            log::info!("terminal plugin ready");
            Ok(())
        })
        .on_event(|app, event| {
            if let RunEvent::Exit = event {
                if let Some(handle) = app.try_state::<TerminalHandle>() {
                    let _ = handle.shutdown();
                }
            }
        })
        .build()
}

/// Open a new tab, optionally bound to a file and a working directory
#[tauri::command]
async fn create_tab(
    handle: State<'_, TerminalHandle>,
    file_path: Option<String>,
    cwd: Option<String>,
) -> Result<TabId, String> {
    Ok(handle.create_tab(file_path, cwd.map(PathBuf::from)).await?)
}

#[tauri::command]
async fn activate_tab(handle: State<'_, TerminalHandle>, tab_id: TabId) -> Result<(), String> {
    Ok(handle.activate_tab(tab_id).await?)
}

/// Keystrokes from the terminal view
#[tauri::command]
fn write(handle: State<'_, TerminalHandle>, tab_id: TabId, data: String) -> Result<(), String> {
    Ok(handle.input(tab_id, data.into_bytes())?)
}

#[tauri::command]
fn resize(handle: State<'_, TerminalHandle>, cols: u16, rows: u16) -> Result<(), String> {
    Ok(handle.resize(cols, rows)?)
}

#[tauri::command]
async fn clear(handle: State<'_, TerminalHandle>, tab_id: TabId) -> Result<(), String> {
    Ok(handle.clear(tab_id).await?)
}

#[tauri::command]
async fn kill_tab(handle: State<'_, TerminalHandle>, tab_id: TabId) -> Result<(), String> {
    Ok(handle.kill_tab(tab_id).await?)
}

#[tauri::command]
async fn reconnect(handle: State<'_, TerminalHandle>, tab_id: TabId) -> Result<(), String> {
    Ok(handle.reconnect(tab_id).await?)
}

/// Send a command to the active tab; a newline is appended unless told otherwise
#[tauri::command]
async fn send_command(
    handle: State<'_, TerminalHandle>,
    text: String,
    add_newline: Option<bool>,
    file_path: Option<String>,
    category: Option<String>,
) -> Result<(), String> {
    Ok(handle
        .send_command(text, add_newline.unwrap_or(true), file_path, category)
        .await?)
}

#[tauri::command]
async fn send_shortcut(handle: State<'_, TerminalHandle>, shortcut: Shortcut) -> Result<(), String> {
    Ok(handle.send_shortcut(shortcut).await?)
}

#[tauri::command]
async fn set_agent_state(handle: State<'_, TerminalHandle>, tab_id: TabId, running: bool) -> Result<(), String> {
    Ok(handle.set_agent_state(tab_id, running).await?)
}

#[tauri::command]
fn set_visible(handle: State<'_, TerminalHandle>, visible: bool) -> Result<(), String> {
    Ok(handle.set_visible(visible)?)
}

#[tauri::command]
async fn list_tabs(handle: State<'_, TerminalHandle>) -> Result<Vec<TabInfo>, String> {
    Ok(handle.list_tabs().await?)
}
