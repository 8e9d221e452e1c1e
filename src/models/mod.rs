/// Models module
/// Shared data types between the terminal engine and the host UI
/// Everything crossing the host boundary is serializable for IPC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a UI-facing terminal tab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u32);

/// Identifier of one PTY session; a tab gets a fresh one on every reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u32);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab-{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pty-{}", self.0)
    }
}

/// A freshly spawned PTY session as reported by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedSession {
    pub id: SessionId,
    /// OS pid of the process the PTY runs (the login shell)
    pub pid: Option<u32>,
    /// Basename of the shell executable, used as the default tab name
    pub shell_name: String,
}

/// Termination record of a PTY session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExit {
    pub session_id: SessionId,
    pub exit_code: Option<u32>,
    pub signal: Option<String>,
}

/// Result of inspecting the process tree under a session's root pid
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessTreeInfo {
    pub is_target_agent_running: bool,
    pub foreground_process: Option<String>,
}

/// Agent activity of a tab. `Processing` implies the agent is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentState {
    Idle,
    Running,
    Processing,
}

impl AgentState {
    pub fn from_flags(running: bool, processing: bool) -> Self {
        match (running, processing) {
            (false, _) => AgentState::Idle,
            (true, false) => AgentState::Running,
            (true, true) => AgentState::Processing,
        }
    }

    pub fn is_running(self) -> bool {
        !matches!(self, AgentState::Idle)
    }

    pub fn is_processing(self) -> bool {
        matches!(self, AgentState::Processing)
    }
}

/// Snapshot of a tab as the host renders it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub id: TabId,
    pub name: String,
    pub is_target_agent_running: bool,
    pub is_processing: bool,
    pub is_closed: bool,
    pub is_active: bool,
    pub file_path: Option<String>,
    pub last_command_category: Option<String>,
}

/// Outbound notifications for the host UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostEvent {
    #[serde(rename_all = "camelCase")]
    TabCreated { tab: TabInfo },
    #[serde(rename_all = "camelCase")]
    TabActivated { tab_id: TabId },
    #[serde(rename_all = "camelCase")]
    TabClosed { tab_id: TabId },
    #[serde(rename_all = "camelCase")]
    TabRenamed { tab_id: TabId, name: String },
    #[serde(rename_all = "camelCase")]
    Output { tab_id: TabId, data: String },
    #[serde(rename_all = "camelCase")]
    AgentStateChanged {
        tab_id: TabId,
        is_target_agent_running: bool,
        is_processing: bool,
    },
    #[serde(rename_all = "camelCase")]
    SessionClosed {
        tab_id: TabId,
        exit_code: Option<u32>,
        signal: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SessionReconnected { tab_id: TabId },
    #[serde(rename_all = "camelCase")]
    Cleared { tab_id: TabId },
    #[serde(rename_all = "camelCase")]
    Error {
        tab_id: Option<TabId>,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_state_never_processing_without_running() {
        assert_eq!(AgentState::from_flags(false, true), AgentState::Idle);
        assert_eq!(AgentState::from_flags(true, true), AgentState::Processing);
        assert!(AgentState::Processing.is_running());
        assert!(!AgentState::Running.is_processing());
    }

    #[test]
    fn host_events_serialize_with_camel_case_tags() {
        let event = HostEvent::AgentStateChanged {
            tab_id: TabId(3),
            is_target_agent_running: true,
            is_processing: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agentStateChanged");
        assert_eq!(json["tabId"], 3);
        assert_eq!(json["isTargetAgentRunning"], true);
    }
}
