/// In-memory doubles for the PTY backend, the process lister and the host,
/// shared by the coordinator and service tests.

use crate::error::{Result, TerminalError};
use crate::models::{HostEvent, SessionExit, SessionId, SpawnedSession};
use crate::services::events::{HostSink, Listeners, Subscription};
use crate::services::process_tree::{ProcessEntry, ProcessLister, ProcessSnapshot};
use crate::services::pty::{ExitListener, OutputListener, SessionBackend};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct FakeState {
    next_id: u32,
    live: HashMap<SessionId, Listeners<OutputListener>>,
    writes: Vec<(SessionId, Vec<u8>)>,
    resizes: Vec<(SessionId, u16, u16)>,
    killed: Vec<SessionId>,
    unavailable: bool,
}

/// Session backend that never touches an OS pty
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    exits: Listeners<ExitListener>,
}

impl FakeBackend {
    pub fn pid_of(id: SessionId) -> u32 {
        1000 + id.0
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub fn emit_output(&self, id: SessionId, data: &[u8]) {
        let listeners = self
            .state
            .lock()
            .live
            .get(&id)
            .map(Listeners::snapshot)
            .unwrap_or_default();
        for listener in listeners {
            listener(data);
        }
    }

    /// Terminate a session as if the shell exited on its own
    pub fn exit(&self, id: SessionId, exit_code: u32) {
        if self.state.lock().live.remove(&id).is_none() {
            return;
        }
        let exit = SessionExit {
            session_id: id,
            exit_code: Some(exit_code),
            signal: None,
        };
        for listener in self.exits.snapshot() {
            listener(&exit);
        }
    }

    pub fn writes(&self, id: SessionId) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(session, _)| *session == id)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn resizes(&self) -> Vec<(SessionId, u16, u16)> {
        self.state.lock().resizes.clone()
    }

    pub fn killed(&self) -> Vec<SessionId> {
        self.state.lock().killed.clone()
    }
}

impl SessionBackend for FakeBackend {
    fn create_session(&self, _cwd: Option<&Path>) -> Result<SpawnedSession> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(TerminalError::PtyUnavailable("no pty in this environment".to_string()));
        }
        state.next_id += 1;
        let id = SessionId(state.next_id);
        state.live.insert(id, Listeners::new());
        Ok(SpawnedSession {
            id,
            pid: Some(Self::pid_of(id)),
            shell_name: "bash".to_string(),
        })
    }

    fn write(&self, id: SessionId, data: &[u8]) {
        let mut state = self.state.lock();
        if state.live.contains_key(&id) {
            state.writes.push((id, data.to_vec()));
        }
    }

    fn resize(&self, id: SessionId, cols: u16, rows: u16) {
        let mut state = self.state.lock();
        if state.live.contains_key(&id) {
            state.resizes.push((id, cols, rows));
        }
    }

    fn kill_session(&self, id: SessionId) {
        let mut state = self.state.lock();
        if let Some(listeners) = state.live.remove(&id) {
            listeners.clear();
            state.killed.push(id);
        }
    }

    fn on_output(&self, id: SessionId, listener: Arc<OutputListener>) -> Option<Subscription> {
        self.state.lock().live.get(&id).map(|l| l.subscribe(listener))
    }

    fn on_session_exit(&self, listener: Arc<ExitListener>) -> Subscription {
        self.exits.subscribe(listener)
    }
}

/// Programmable process table; `None` makes the next listings fail
#[derive(Clone)]
pub struct FakeLister {
    entries: Arc<Mutex<Option<Vec<ProcessEntry>>>>,
    calls: Arc<AtomicUsize>,
}

impl FakeLister {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Some(Vec::new()))),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set(&self, entries: Vec<ProcessEntry>) {
        *self.entries.lock() = Some(entries);
    }

    pub fn fail(&self) {
        *self.entries.lock() = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProcessLister for FakeLister {
    async fn list(&self) -> Result<ProcessSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let entries = self.entries.lock().clone();
        entries
            .map(ProcessSnapshot::from_entries)
            .ok_or_else(|| TerminalError::ProcessList("listing tool missing".to_string()))
    }
}

pub fn entry(pid: u32, ppid: u32, command: &str) -> ProcessEntry {
    ProcessEntry {
        pid,
        ppid,
        command: command.to_string(),
    }
}

/// Host sink that records everything it is given
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<HostEvent>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<HostEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl HostSink for RecordingSink {
    fn emit(&self, event: HostEvent) {
        self.events.lock().push(event);
    }
}
