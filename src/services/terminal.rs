/// Terminal service
/// Runs the coordinator on a single task. Host commands, PTY events, the poll
/// interval and per-tab deadlines are multiplexed with `tokio::select!`, so
/// no coordinator state is ever shared across threads.

use crate::error::{Result, TerminalError};
use crate::models::{TabId, TabInfo};
use crate::services::coordinator::Coordinator;
use crate::services::dispatch::Shortcut;
use crate::services::events::HostSink;
use crate::services::process_tree::ProcessLister;
use crate::services::pty::SessionBackend;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests accepted by the service
#[derive(Debug)]
pub enum TerminalCommand {
    CreateTab {
        file_path: Option<String>,
        cwd: Option<PathBuf>,
        reply: Reply<TabId>,
    },
    ActivateTab {
        tab_id: TabId,
        reply: Reply<()>,
    },
    Input {
        tab_id: TabId,
        data: Vec<u8>,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Clear {
        tab_id: TabId,
        reply: Reply<()>,
    },
    Kill {
        tab_id: TabId,
        reply: Reply<()>,
    },
    Reconnect {
        tab_id: TabId,
        reply: Reply<()>,
    },
    SendCommand {
        text: String,
        add_newline: bool,
        file_path: Option<String>,
        category: Option<String>,
        reply: Reply<()>,
    },
    Shortcut {
        shortcut: Shortcut,
        reply: Reply<()>,
    },
    SetAgentState {
        tab_id: TabId,
        running: bool,
        reply: Reply<()>,
    },
    SetVisible {
        visible: bool,
    },
    ListTabs {
        reply: Reply<Vec<TabInfo>>,
    },
    Shutdown,
}

/// Cloneable front door to a running `TerminalService`
#[derive(Debug, Clone)]
pub struct TerminalHandle {
    tx: mpsc::UnboundedSender<TerminalCommand>,
}

impl TerminalHandle {
    fn send(&self, command: TerminalCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| TerminalError::ServiceStopped)
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> TerminalCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| TerminalError::ServiceStopped)?
    }

    pub async fn create_tab(&self, file_path: Option<String>, cwd: Option<PathBuf>) -> Result<TabId> {
        self.request(|reply| TerminalCommand::CreateTab { file_path, cwd, reply })
            .await
    }

    pub async fn activate_tab(&self, tab_id: TabId) -> Result<()> {
        self.request(|reply| TerminalCommand::ActivateTab { tab_id, reply })
            .await
    }

    /// Keystrokes are fire-and-forget
    pub fn input(&self, tab_id: TabId, data: Vec<u8>) -> Result<()> {
        self.send(TerminalCommand::Input { tab_id, data })
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.send(TerminalCommand::Resize { cols, rows })
    }

    pub async fn clear(&self, tab_id: TabId) -> Result<()> {
        self.request(|reply| TerminalCommand::Clear { tab_id, reply }).await
    }

    pub async fn kill_tab(&self, tab_id: TabId) -> Result<()> {
        self.request(|reply| TerminalCommand::Kill { tab_id, reply }).await
    }

    pub async fn reconnect(&self, tab_id: TabId) -> Result<()> {
        self.request(|reply| TerminalCommand::Reconnect { tab_id, reply })
            .await
    }

    pub async fn send_command(
        &self,
        text: String,
        add_newline: bool,
        file_path: Option<String>,
        category: Option<String>,
    ) -> Result<()> {
        self.request(|reply| TerminalCommand::SendCommand {
            text,
            add_newline,
            file_path,
            category,
            reply,
        })
        .await
    }

    pub async fn send_shortcut(&self, shortcut: Shortcut) -> Result<()> {
        self.request(|reply| TerminalCommand::Shortcut { shortcut, reply })
            .await
    }

    pub async fn set_agent_state(&self, tab_id: TabId, running: bool) -> Result<()> {
        self.request(|reply| TerminalCommand::SetAgentState { tab_id, running, reply })
            .await
    }

    pub fn set_visible(&self, visible: bool) -> Result<()> {
        self.send(TerminalCommand::SetVisible { visible })
    }

    pub async fn list_tabs(&self) -> Result<Vec<TabInfo>> {
        self.request(|reply| TerminalCommand::ListTabs { reply }).await
    }

    /// Stop the service; every session is killed on the way out
    pub fn shutdown(&self) -> Result<()> {
        self.send(TerminalCommand::Shutdown)
    }
}

pub struct TerminalService<B, L, H> {
    coordinator: Coordinator<B, L, H>,
    commands: mpsc::UnboundedReceiver<TerminalCommand>,
}

impl<B, L, H> TerminalService<B, L, H>
where
    B: SessionBackend,
    L: ProcessLister,
    H: HostSink,
{
    pub fn new(coordinator: Coordinator<B, L, H>) -> (Self, TerminalHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        (Self { coordinator, commands }, TerminalHandle { tx })
    }

    /// Drive the coordinator until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        log::info!("terminal service started");
        loop {
            let deadline = self.coordinator.next_deadline();
            let coordinator = &mut self.coordinator;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(TerminalCommand::Shutdown) | None => break,
                    Some(command) => handle_command(coordinator, command),
                },
                Some(event) = coordinator.events.recv() => {
                    coordinator.handle_session_event(event, Instant::now());
                }
                _ = coordinator.poll.tick() => {
                    coordinator.poll_sweep().await;
                }
                _ = sleep_until(deadline) => {
                    coordinator.fire_due(Instant::now());
                }
            }
        }
        self.coordinator.shutdown();
        log::info!("terminal service stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn handle_command<B, L, H>(coordinator: &mut Coordinator<B, L, H>, command: TerminalCommand)
where
    B: SessionBackend,
    L: ProcessLister,
    H: HostSink,
{
    // A dropped reply receiver only means the caller stopped waiting
    match command {
        TerminalCommand::CreateTab { file_path, cwd, reply } => {
            let _ = reply.send(coordinator.create_tab(file_path, cwd));
        }
        TerminalCommand::ActivateTab { tab_id, reply } => {
            let _ = reply.send(coordinator.activate_tab(tab_id));
        }
        TerminalCommand::Input { tab_id, data } => {
            if let Err(e) = coordinator.send_input(tab_id, &data) {
                log::debug!("input dropped: {e}");
            }
        }
        TerminalCommand::Resize { cols, rows } => coordinator.resize(cols, rows),
        TerminalCommand::Clear { tab_id, reply } => {
            let _ = reply.send(coordinator.clear(tab_id));
        }
        TerminalCommand::Kill { tab_id, reply } => {
            let _ = reply.send(coordinator.kill_tab(tab_id));
        }
        TerminalCommand::Reconnect { tab_id, reply } => {
            let _ = reply.send(coordinator.reconnect(tab_id));
        }
        TerminalCommand::SendCommand {
            text,
            add_newline,
            file_path,
            category,
            reply,
        } => {
            let _ = reply.send(coordinator.send_command(&text, add_newline, file_path, category));
        }
        TerminalCommand::Shortcut { shortcut, reply } => {
            let _ = reply.send(coordinator.send_shortcut(shortcut));
        }
        TerminalCommand::SetAgentState { tab_id, running, reply } => {
            let _ = reply.send(coordinator.set_agent_state(tab_id, running));
        }
        TerminalCommand::SetVisible { visible } => coordinator.set_visible(visible),
        TerminalCommand::ListTabs { reply } => {
            let _ = reply.send(Ok(coordinator.list_tabs()));
        }
        TerminalCommand::Shutdown => coordinator.shutdown(),
    }
}
