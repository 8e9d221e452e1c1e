/// Tab/Session Coordinator
/// Owns the ordered tab list, routes host commands to PTY sessions and keeps
/// each tab's agent state (idle, running, processing) current from three
/// signals: dispatched commands, the output stream and the process-tree poll.
///
/// All state lives on one task; PTY threads only push `SessionEvent`s into
/// the coordinator's channel.

use crate::config::TerminalConfig;
use crate::error::{Result, TerminalError};
use crate::models::{HostEvent, ProcessTreeInfo, SessionExit, SessionId, SpawnedSession, TabId, TabInfo};
use crate::services::dispatch::{self, DispatchPlan, Shortcut, SUBMIT};
use crate::services::events::{HostSink, Subscription};
use crate::services::output_classifier::{self, LineTail, PatternDetector, PatternVerdict, Utf8Stream};
use crate::services::poll::PollTimer;
use crate::services::process_tree::{Inspector, ProcessLister};
use crate::services::pty::{OutputListener, SessionBackend};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// What PTY threads report back
#[derive(Debug)]
pub enum SessionEvent {
    Output { session_id: SessionId, data: Vec<u8> },
    Exited(SessionExit),
}

struct Tab {
    id: TabId,
    /// `None` once the session exited; the tab is then closed but reconnectable
    session: Option<SessionId>,
    root_pid: Option<u32>,
    shell_name: String,
    name: String,
    cwd: Option<PathBuf>,
    agent_running: bool,
    processing: bool,
    file_path: Option<String>,
    last_category: Option<String>,
    /// A launch or banner detection outranks a poll that misses the agent until then
    trusted_until: Option<Instant>,
    output_subscription: Option<Subscription>,
}

impl Tab {
    fn is_closed(&self) -> bool {
        self.session.is_none()
    }

    fn info(&self, active: Option<TabId>) -> TabInfo {
        TabInfo {
            id: self.id,
            name: self.name.clone(),
            is_target_agent_running: self.agent_running,
            is_processing: self.processing,
            is_closed: self.is_closed(),
            is_active: active == Some(self.id),
            file_path: self.file_path.clone(),
            last_command_category: self.last_category.clone(),
        }
    }
}

// A bracketed paste waiting for its carriage return. Writes that arrive in
// the meantime queue up behind the terminator.
struct PendingSubmit {
    due: Instant,
    held: Vec<Vec<u8>>,
}

/// Per-tab output bookkeeping; exists exactly while the tab's session is live
#[derive(Default)]
struct OutputMonitor {
    decoder: Utf8Stream,
    tail: LineTail,
    last_meaningful_output: Option<Instant>,
    idle_deadline: Option<Instant>,
    pending_submit: Option<PendingSubmit>,
}

/// Set both flags and notify the host when anything changed.
/// Processing is forced off whenever the agent is not running.
fn apply_agent_state<H: HostSink>(tab: &mut Tab, host: &H, running: bool, processing: bool) {
    let processing = running && processing;
    if tab.agent_running == running && tab.processing == processing {
        return;
    }
    tab.agent_running = running;
    tab.processing = processing;
    if !running {
        tab.trusted_until = None;
    }
    host.emit(HostEvent::AgentStateChanged {
        tab_id: tab.id,
        is_target_agent_running: running,
        is_processing: processing,
    });
}

pub struct Coordinator<B, L, H> {
    config: TerminalConfig,
    backend: Arc<B>,
    inspector: Inspector<L>,
    host: H,
    detector: PatternDetector,
    tabs: Vec<Tab>,
    monitors: HashMap<TabId, OutputMonitor>,
    active: Option<TabId>,
    next_tab_id: u32,
    size: (u16, u16),
    visible: bool,
    /// Set once pty support failed to load; later spawns fail quietly
    pty_unavailable: Option<String>,
    pub(crate) poll: PollTimer,
    pub(crate) events: mpsc::UnboundedReceiver<SessionEvent>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    _exit_subscription: Subscription,
}

impl<B, L, H> Coordinator<B, L, H>
where
    B: SessionBackend,
    L: ProcessLister,
    H: HostSink,
{
    /// Must be constructed and driven inside a Tokio runtime
    pub fn new(config: TerminalConfig, backend: Arc<B>, lister: L, host: H) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();

        let exit_tx = events_tx.clone();
        let exit_subscription = backend.on_session_exit(Arc::new(move |exit: &SessionExit| {
            let _ = exit_tx.send(SessionEvent::Exited(exit.clone()));
        }));

        Self {
            inspector: Inspector::new(lister, config.agent_signature.clone()),
            detector: PatternDetector::new(&config.agent_signature),
            size: (config.cols.max(1), config.rows.max(1)),
            config,
            backend,
            host,
            tabs: Vec::new(),
            monitors: HashMap::new(),
            active: None,
            next_tab_id: 1,
            visible: true,
            pty_unavailable: None,
            poll: PollTimer::new(),
            events,
            events_tx,
            _exit_subscription: exit_subscription,
        }
    }

    pub fn active_tab(&self) -> Option<TabId> {
        self.active
    }

    pub fn poll_timer(&self) -> &PollTimer {
        &self.poll
    }

    pub fn list_tabs(&self) -> Vec<TabInfo> {
        self.tabs.iter().map(|tab| tab.info(self.active)).collect()
    }

    pub fn tab(&self, id: TabId) -> Option<TabInfo> {
        self.tabs.iter().find(|tab| tab.id == id).map(|tab| tab.info(self.active))
    }

    /// Live PTY session behind a tab
    pub fn session_of(&self, id: TabId) -> Option<SessionId> {
        self.tabs.iter().find(|tab| tab.id == id).and_then(|tab| tab.session)
    }

    /// When the tab last produced output that was not redraw noise
    pub fn last_meaningful_output(&self, id: TabId) -> Option<Instant> {
        self.monitors.get(&id).and_then(|monitor| monitor.last_meaningful_output)
    }

    fn position(&self, id: TabId) -> Result<usize> {
        self.tabs
            .iter()
            .position(|tab| tab.id == id)
            .ok_or(TerminalError::UnknownTab(id))
    }

    fn live_position_of(&self, session_id: SessionId) -> Option<usize> {
        self.tabs.iter().position(|tab| tab.session == Some(session_id))
    }

    fn active_live_position(&self) -> Result<usize> {
        let index = self
            .active
            .and_then(|id| self.tabs.iter().position(|tab| tab.id == id))
            .ok_or(TerminalError::NoActiveSession)?;
        if self.tabs[index].is_closed() {
            return Err(TerminalError::NoActiveSession);
        }
        Ok(index)
    }

    fn notify(&self, tab_id: Option<TabId>, err: &TerminalError) {
        log::warn!("{err}");
        self.host.emit(HostEvent::Error {
            tab_id,
            message: err.to_string(),
        });
    }

    // ---- Tab lifecycle ----

    pub fn create_tab(&mut self, file_path: Option<String>, cwd: Option<PathBuf>) -> Result<TabId> {
        if self.tabs.len() >= self.config.max_tabs {
            let err = TerminalError::TabLimit {
                max: self.config.max_tabs,
            };
            self.notify(None, &err);
            return Err(err);
        }

        let spawned = self.spawn_session(None, cwd.as_deref())?;
        let id = TabId(self.next_tab_id);
        self.next_tab_id += 1;

        self.tabs.push(Tab {
            id,
            session: None,
            root_pid: None,
            shell_name: spawned.shell_name.clone(),
            name: spawned.shell_name.clone(),
            cwd,
            agent_running: false,
            processing: false,
            file_path,
            last_category: None,
            trusted_until: None,
            output_subscription: None,
        });
        let index = self.tabs.len() - 1;
        self.attach_session(index, spawned);

        self.host.emit(HostEvent::TabCreated {
            tab: self.tabs[index].info(self.active),
        });
        if self.active.is_none() {
            self.set_active(id);
        }
        self.ensure_polling();

        log::info!("created {id} ({} open)", self.tabs.len());
        Ok(id)
    }

    fn spawn_session(&mut self, tab_id: Option<TabId>, cwd: Option<&Path>) -> Result<SpawnedSession> {
        if let Some(reason) = &self.pty_unavailable {
            return Err(TerminalError::PtyUnavailable(reason.clone()));
        }
        self.backend.create_session(cwd).map_err(|err| {
            if let TerminalError::PtyUnavailable(reason) = &err {
                self.pty_unavailable = Some(reason.clone());
            }
            self.notify(tab_id, &err);
            err
        })
    }

    /// Wire a fresh session into the tab at `index` and reset its agent state
    fn attach_session(&mut self, index: usize, spawned: SpawnedSession) {
        let tx = self.events_tx.clone();
        let session_id = spawned.id;
        let forward: Arc<OutputListener> = Arc::new(move |data: &[u8]| {
            let _ = tx.send(SessionEvent::Output {
                session_id,
                data: data.to_vec(),
            });
        });
        let subscription = self.backend.on_output(session_id, forward);
        let (cols, rows) = self.size;
        self.backend.resize(session_id, cols, rows);

        let tab = &mut self.tabs[index];
        tab.session = Some(session_id);
        tab.root_pid = spawned.pid;
        tab.shell_name = spawned.shell_name;
        tab.name = tab.shell_name.clone();
        tab.agent_running = false;
        tab.processing = false;
        tab.trusted_until = None;
        tab.output_subscription = subscription;
        self.monitors.insert(tab.id, OutputMonitor::default());
    }

    fn set_active(&mut self, id: TabId) {
        self.active = Some(id);
        self.host.emit(HostEvent::TabActivated { tab_id: id });
    }

    pub fn activate_tab(&mut self, id: TabId) -> Result<()> {
        self.position(id)?;
        self.set_active(id);
        Ok(())
    }

    /// Close a tab for good, killing its session. The active tab hands over to
    /// its left neighbour (or the last tab); closing the only tab opens a fresh one.
    pub fn kill_tab(&mut self, id: TabId) -> Result<()> {
        let index = self.position(id)?;
        let mut tab = self.tabs.remove(index);
        self.monitors.remove(&id);
        drop(tab.output_subscription.take());
        if let Some(session) = tab.session.take() {
            self.backend.kill_session(session);
        }
        self.host.emit(HostEvent::TabClosed { tab_id: id });
        log::info!("closed {id}");

        if self.tabs.is_empty() {
            self.active = None;
            self.poll.stop();
            if let Err(e) = self.create_tab(None, None) {
                log::warn!("could not open a replacement tab: {e}");
            }
            return Ok(());
        }

        if self.active == Some(id) {
            let next = if index > 0 {
                self.tabs[index - 1].id
            } else {
                self.tabs[self.tabs.len() - 1].id
            };
            self.set_active(next);
        }
        self.retune_polling();
        Ok(())
    }

    /// Start a new session for a tab whose session exited
    pub fn reconnect(&mut self, id: TabId) -> Result<()> {
        let index = self.position(id)?;
        if !self.tabs[index].is_closed() {
            return Err(TerminalError::NotReconnectable(id));
        }

        let cwd = self.tabs[index].cwd.clone();
        let previous_name = self.tabs[index].name.clone();
        let spawned = self.spawn_session(Some(id), cwd.as_deref())?;
        self.attach_session(index, spawned);

        self.host.emit(HostEvent::SessionReconnected { tab_id: id });
        let name = self.tabs[index].name.clone();
        if name != previous_name {
            self.host.emit(HostEvent::TabRenamed { tab_id: id, name });
        }
        self.ensure_polling();
        log::info!("reconnected {id}");
        Ok(())
    }

    // ---- Input and dispatch ----

    /// Raw keystrokes from the host terminal view
    pub fn send_input(&mut self, id: TabId, data: &[u8]) -> Result<()> {
        let index = self.position(id)?;
        self.write_to_tab(index, data);
        Ok(())
    }

    fn write_to_tab(&mut self, index: usize, data: &[u8]) {
        let tab = &self.tabs[index];
        let Some(session) = tab.session else {
            log::debug!("dropping input for closed {}", tab.id);
            return;
        };
        if let Some(pending) = self
            .monitors
            .get_mut(&tab.id)
            .and_then(|monitor| monitor.pending_submit.as_mut())
        {
            pending.held.push(data.to_vec());
            return;
        }
        self.backend.write(session, data);
    }

    /// Send a command to the active tab following the dispatch policy
    pub fn send_command(
        &mut self,
        text: &str,
        add_newline: bool,
        file_path: Option<String>,
        category: Option<String>,
    ) -> Result<()> {
        let index = match self.active_live_position() {
            Ok(index) => index,
            Err(err) => {
                self.notify(self.active, &err);
                return Err(err);
            }
        };
        let now = Instant::now();
        // An earlier paste gets its terminator before anything new goes out
        self.flush_pending_submit(index);

        let tab = &mut self.tabs[index];
        let Some(session) = tab.session else {
            return Err(TerminalError::NoActiveSession);
        };
        if file_path.is_some() {
            tab.file_path = file_path;
        }
        tab.last_category = category;

        let launching = !tab.agent_running && dispatch::is_agent_launch(text, &self.config.agent_launch_prefixes);
        let plan = dispatch::plan(text, add_newline, tab.agent_running, self.config.paste_submit_delay());
        self.backend.write(session, plan.payload());

        let monitor = self.monitors.entry(tab.id).or_default();
        if let DispatchPlan::BracketPaste { submit_after, .. } = plan {
            monitor.pending_submit = Some(PendingSubmit {
                due: now + submit_after,
                held: Vec::new(),
            });
        }

        if launching {
            log::info!("{} launching agent: {text}", tab.id);
            monitor.tail.clear();
            monitor.idle_deadline = Some(now + self.config.quiet_window());
            tab.trusted_until = Some(now + self.config.launch_grace());
            apply_agent_state(tab, &self.host, true, true);
            self.retune_polling();
        }
        Ok(())
    }

    pub fn send_shortcut(&mut self, shortcut: Shortcut) -> Result<()> {
        if shortcut.is_raw() {
            let index = self.active_live_position()?;
            self.write_to_tab(index, shortcut.text().as_bytes());
            return Ok(());
        }
        self.send_command(shortcut.text(), true, None, Some(shortcut.category().to_string()))
    }

    fn flush_pending_submit(&mut self, index: usize) {
        let tab = &self.tabs[index];
        let Some(pending) = self
            .monitors
            .get_mut(&tab.id)
            .and_then(|monitor| monitor.pending_submit.take())
        else {
            return;
        };
        if let Some(session) = tab.session {
            self.backend.write(session, SUBMIT);
            for data in &pending.held {
                self.backend.write(session, data);
            }
        }
    }

    // ---- Host-driven state ----

    /// Explicit override from the host. Clearing `running` clears `processing` too.
    pub fn set_agent_state(&mut self, id: TabId, running: bool) -> Result<()> {
        let index = self.position(id)?;
        let now = Instant::now();
        let tab = &mut self.tabs[index];
        if running {
            if !tab.agent_running {
                // A prompt left over from the idle shell must not end the agent
                if let Some(monitor) = self.monitors.get_mut(&id) {
                    monitor.tail.clear();
                }
            }
            tab.trusted_until = Some(now + self.config.launch_grace());
            let processing = tab.processing;
            apply_agent_state(tab, &self.host, true, processing);
        } else {
            if let Some(monitor) = self.monitors.get_mut(&id) {
                monitor.idle_deadline = None;
            }
            apply_agent_state(tab, &self.host, false, false);
        }
        self.retune_polling();
        Ok(())
    }

    /// Propagate the host view size to every live session
    pub fn resize(&mut self, cols: u16, rows: u16) {
        let (cols, rows) = (cols.max(1), rows.max(1));
        self.size = (cols, rows);
        for session in self.tabs.iter().filter_map(|tab| tab.session) {
            self.backend.resize(session, cols, rows);
        }
    }

    /// Ask the host to clear a tab's scrollback
    pub fn clear(&mut self, id: TabId) -> Result<()> {
        self.position(id)?;
        self.host.emit(HostEvent::Cleared { tab_id: id });
        Ok(())
    }

    /// Polling only runs while the host view is visible
    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
        if visible {
            self.ensure_polling();
        } else {
            self.poll.stop();
        }
    }

    // ---- Session events ----

    pub fn handle_session_event(&mut self, event: SessionEvent, now: Instant) {
        match event {
            SessionEvent::Output { session_id, data } => self.handle_output(session_id, &data, now),
            SessionEvent::Exited(exit) => self.handle_exit(exit),
        }
    }

    /// Process everything the PTY threads queued so far
    pub fn drain_session_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_session_event(event, Instant::now());
        }
    }

    fn handle_output(&mut self, session_id: SessionId, data: &[u8], now: Instant) {
        let Some(index) = self.live_position_of(session_id) else {
            log::trace!("output from retired {session_id} ignored");
            return;
        };
        let tab = &mut self.tabs[index];
        let Some(monitor) = self.monitors.get_mut(&tab.id) else {
            return;
        };

        let text = monitor.decoder.decode(data);
        if text.is_empty() {
            return;
        }
        let clean = output_classifier::strip_control_sequences(&text);
        self.host.emit(HostEvent::Output { tab_id: tab.id, data: text });
        monitor.tail.push(&clean);

        let quiet = self.config.quiet_window();
        let mut cadence_may_change = false;
        match self.detector.detect(&clean, tab.agent_running, &monitor.tail) {
            Some(PatternVerdict::AgentStarted) => {
                log::info!("{} agent banner seen", tab.id);
                monitor.tail.clear();
                monitor.last_meaningful_output = Some(now);
                monitor.idle_deadline = Some(now + quiet);
                tab.trusted_until = Some(now + self.config.launch_grace());
                apply_agent_state(tab, &self.host, true, true);
                cadence_may_change = true;
            }
            Some(PatternVerdict::ShellReturned) => {
                log::info!("{} shell prompt is back", tab.id);
                monitor.tail.clear();
                monitor.idle_deadline = None;
                apply_agent_state(tab, &self.host, false, false);
                cadence_may_change = true;
            }
            None if tab.agent_running && !output_classifier::is_noise(&clean) => {
                monitor.last_meaningful_output = Some(now);
                monitor.idle_deadline = Some(now + quiet);
                apply_agent_state(tab, &self.host, true, true);
            }
            None => {}
        }

        if cadence_may_change {
            self.retune_polling();
        }
    }

    fn handle_exit(&mut self, exit: SessionExit) {
        let Some(index) = self.live_position_of(exit.session_id) else {
            log::debug!("exit of retired {} ignored", exit.session_id);
            return;
        };
        let tab = &mut self.tabs[index];
        let tab_id = tab.id;

        if let Some(mut monitor) = self.monitors.remove(&tab_id) {
            let rest = monitor.decoder.finish();
            if !rest.is_empty() {
                self.host.emit(HostEvent::Output { tab_id, data: rest });
            }
        }
        drop(tab.output_subscription.take());
        tab.session = None;
        tab.root_pid = None;
        apply_agent_state(tab, &self.host, false, false);

        log::info!(
            "{tab_id} session {} ended (code {:?}, signal {:?})",
            exit.session_id,
            exit.exit_code,
            exit.signal
        );
        self.host.emit(HostEvent::SessionClosed {
            tab_id,
            exit_code: exit.exit_code,
            signal: exit.signal,
        });
        self.retune_polling();
    }

    // ---- Timers ----

    /// Earliest pending submit or quiet-window deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.monitors
            .values()
            .flat_map(|monitor| {
                [
                    monitor.pending_submit.as_ref().map(|p| p.due),
                    monitor.idle_deadline,
                ]
            })
            .flatten()
            .min()
    }

    pub fn fire_due(&mut self, now: Instant) {
        for tab in self.tabs.iter_mut() {
            let Some(monitor) = self.monitors.get_mut(&tab.id) else {
                continue;
            };

            if monitor.pending_submit.as_ref().is_some_and(|p| p.due <= now) {
                if let (Some(pending), Some(session)) = (monitor.pending_submit.take(), tab.session) {
                    self.backend.write(session, SUBMIT);
                    for data in &pending.held {
                        self.backend.write(session, data);
                    }
                }
            }

            if monitor.idle_deadline.is_some_and(|deadline| deadline <= now) {
                monitor.idle_deadline = None;
                if tab.processing {
                    let running = tab.agent_running;
                    log::debug!("{} quiet, no longer processing", tab.id);
                    apply_agent_state(tab, &self.host, running, false);
                }
            }
        }
    }

    // ---- Process-tree polling ----

    fn cadence(&self) -> std::time::Duration {
        if self.tabs.iter().any(|tab| tab.agent_running) {
            self.config.fast_poll()
        } else {
            self.config.slow_poll()
        }
    }

    fn ensure_polling(&mut self) {
        if self.visible && !self.tabs.is_empty() {
            let period = self.cadence();
            self.poll.start(period);
        }
    }

    fn retune_polling(&mut self) {
        let period = self.cadence();
        self.poll.retune(period);
    }

    /// One listing shared by every live tab, then a cadence check
    pub async fn poll_sweep(&mut self) {
        let targets: Vec<(TabId, u32)> = self
            .tabs
            .iter()
            .filter(|tab| !tab.is_closed())
            .filter_map(|tab| Some((tab.id, tab.root_pid?)))
            .collect();

        if !targets.is_empty() {
            let Some(snapshot) = self.inspector.snapshot().await else {
                return;
            };
            let now = Instant::now();
            for (tab_id, root_pid) in targets {
                let info = snapshot.inspect(root_pid, self.inspector.signature());
                self.apply_tree_info(tab_id, root_pid, info, now);
            }
        }
        self.retune_polling();
    }

    fn apply_tree_info(
        &mut self,
        tab_id: TabId,
        root_pid: u32,
        info: ProcessTreeInfo,
        now: Instant,
    ) {
        let Some(tab) = self
            .tabs
            .iter_mut()
            .find(|tab| tab.id == tab_id && !tab.is_closed() && tab.root_pid == Some(root_pid))
        else {
            return;
        };
        let monitor = self.monitors.get_mut(&tab_id);

        if info.is_target_agent_running && !tab.agent_running {
            log::info!("{tab_id} agent found in process tree");
            if let Some(monitor) = monitor {
                monitor.tail.clear();
            }
            apply_agent_state(tab, &self.host, true, false);
        } else if !info.is_target_agent_running && tab.agent_running {
            let trusted = tab.trusted_until.is_some_and(|until| now < until);
            if !trusted {
                log::info!("{tab_id} agent gone from process tree");
                if let Some(monitor) = monitor {
                    monitor.idle_deadline = None;
                }
                apply_agent_state(tab, &self.host, false, false);
            }
        }

        let name = info.foreground_process.unwrap_or_else(|| tab.shell_name.clone());
        if name != tab.name {
            tab.name = name.clone();
            self.host.emit(HostEvent::TabRenamed { tab_id, name });
        }
    }

    /// Kill every session and forget all tabs
    pub fn shutdown(&mut self) {
        self.poll.stop();
        for mut tab in self.tabs.drain(..) {
            drop(tab.output_subscription.take());
            if let Some(session) = tab.session.take() {
                self.backend.kill_session(session);
            }
        }
        self.monitors.clear();
        self.active = None;
    }
}
