/// PTY Session Registry
/// Owns the OS pseudo-terminal processes: spawn, write, resize, kill, and fan-out
/// of raw output and exit notifications to subscribers.

use crate::error::{Result, TerminalError};
use crate::models::{SessionExit, SessionId, SpawnedSession};
use crate::services::events::{Listeners, Subscription};
use crate::services::output_classifier::process_name;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::Duration;

pub type OutputListener = dyn Fn(&[u8]) + Send + Sync;
pub type ExitListener = dyn Fn(&SessionExit) + Send + Sync;

#[cfg(unix)]
const FALLBACK_SHELLS: &[&str] = &["/bin/bash", "/bin/sh"];
#[cfg(windows)]
const FALLBACK_SHELLS: &[&str] = &["powershell.exe", "cmd.exe"];

// How long the exit path waits for the reader to drain trailing output
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
// Output kept for a session nobody has subscribed to yet
const OUTPUT_BACKLOG_LIMIT: usize = 64 * 1024;
#[cfg(unix)]
const KILL_ESCALATION_DELAY: Duration = Duration::from_millis(100);

/// Everything the coordinator needs from a session registry
pub trait SessionBackend: Send + Sync + 'static {
    /// Spawn a login shell, optionally in `cwd`
    fn create_session(&self, cwd: Option<&Path>) -> Result<SpawnedSession>;
    /// Write to a session; silently ignored once it has exited
    fn write(&self, id: SessionId, data: &[u8]);
    /// Resize a session; identical consecutive sizes reach the OS once
    fn resize(&self, id: SessionId, cols: u16, rows: u16);
    /// Terminate a session; idempotent
    fn kill_session(&self, id: SessionId);
    /// Raw output of one session, in emission order. `None` if it is gone.
    fn on_output(&self, id: SessionId, listener: Arc<OutputListener>) -> Option<Subscription>;
    /// Called once per session termination, after the session left the registry
    fn on_session_exit(&self, listener: Arc<ExitListener>) -> Subscription;
}

struct PtySession {
    master: Box<dyn MasterPty + Send>,
    input: mpsc::Sender<Vec<u8>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    size: (u16, u16),
    output: SessionOutput,
}

/// Output fan-out of one session. Chunks read before the first subscriber
/// arrives are kept and replayed to it, so a fast shell's first prompt survives.
#[derive(Clone)]
struct SessionOutput {
    listeners: Listeners<OutputListener>,
    // `None` once someone has subscribed
    backlog: Arc<Mutex<Option<Vec<u8>>>>,
}

impl SessionOutput {
    fn new() -> Self {
        Self {
            listeners: Listeners::new(),
            backlog: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    fn deliver(&self, data: &[u8]) {
        {
            let mut backlog = self.backlog.lock();
            if let Some(pending) = backlog.as_mut() {
                pending.extend_from_slice(data);
                if pending.len() > OUTPUT_BACKLOG_LIMIT {
                    let excess = pending.len() - OUTPUT_BACKLOG_LIMIT;
                    pending.drain(..excess);
                }
                return;
            }
        }
        for listener in self.listeners.snapshot() {
            listener(data);
        }
    }

    fn subscribe(&self, listener: Arc<OutputListener>) -> Subscription {
        // Replay under the lock so no later chunk overtakes the backlog
        let mut backlog = self.backlog.lock();
        let subscription = self.listeners.subscribe(Arc::clone(&listener));
        if let Some(pending) = backlog.take() {
            if !pending.is_empty() {
                listener(&pending);
            }
        }
        subscription
    }

    fn close(&self) {
        *self.backlog.lock() = None;
        self.listeners.clear();
    }
}

struct RegistryInner {
    sessions: Mutex<HashMap<SessionId, PtySession>>,
    exit_listeners: Listeners<ExitListener>,
    next_id: AtomicU32,
}

/// Registry of live PTY sessions
pub struct PtyRegistry {
    inner: Arc<RegistryInner>,
    shell_path: Option<String>,
    initial_size: (u16, u16),
}

impl PtyRegistry {
    pub fn new(shell_path: Option<String>, cols: u16, rows: u16) -> Self {
        PtyRegistry {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                exit_listeners: Listeners::new(),
                next_id: AtomicU32::new(1),
            }),
            shell_path,
            initial_size: (cols.max(1), rows.max(1)),
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.inner.sessions.lock().contains_key(&id)
    }

    /// Kill every session - used during shutdown
    pub fn close_all(&self) {
        let ids: Vec<SessionId> = self.inner.sessions.lock().keys().copied().collect();
        for id in ids {
            self.kill_session(id);
        }
    }
}

impl SessionBackend for PtyRegistry {
    fn create_session(&self, cwd: Option<&Path>) -> Result<SpawnedSession> {
        let shell = resolve_shell(self.shell_path.as_deref())?;
        let (cols, rows) = self.initial_size;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::PtyUnavailable(e.to_string()))?;

        let cmd = build_shell_command(&shell, cwd);
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::Spawn(format!("{shell}: {e}")))?;
        // The child holds its own copy; keeping ours would hide EOF from the reader
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TerminalError::Spawn(format!("clone reader failed: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TerminalError::Spawn(format!("take writer failed: {e}")))?;

        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let output = SessionOutput::new();

        self.inner.sessions.lock().insert(
            id,
            PtySession {
                master: pair.master,
                input: spawn_writer_thread(id, writer),
                killer,
                pid,
                size: (cols, rows),
                output: output.clone(),
            },
        );

        let (drained_tx, drained_rx) = mpsc::channel();
        spawn_reader_thread(id, reader, output, drained_tx);
        spawn_exit_watcher(id, child, Arc::downgrade(&self.inner), drained_rx);

        log::info!("spawned {shell} as {id} (pid {pid:?})");

        Ok(SpawnedSession {
            id,
            pid,
            shell_name: process_name(&shell).to_string(),
        })
    }

    fn write(&self, id: SessionId, data: &[u8]) {
        let sessions = self.inner.sessions.lock();
        let Some(session) = sessions.get(&id) else {
            return;
        };
        if session.input.send(data.to_vec()).is_err() {
            log::debug!("writer for {id} is gone");
        }
    }

    fn resize(&self, id: SessionId, cols: u16, rows: u16) {
        let mut sessions = self.inner.sessions.lock();
        let Some(session) = sessions.get_mut(&id) else {
            return;
        };
        let master = &session.master;
        apply_resize(&mut session.size, cols, rows, |size| master.resize(size));
    }

    fn kill_session(&self, id: SessionId) {
        let Some(session) = self.inner.sessions.lock().remove(&id) else {
            return;
        };
        // Nobody may observe output of a killed session
        session.output.close();
        terminate(session.pid, session.killer);
        log::info!("killed {id}");
    }

    fn on_output(&self, id: SessionId, listener: Arc<OutputListener>) -> Option<Subscription> {
        let sessions = self.inner.sessions.lock();
        sessions.get(&id).map(|s| s.output.subscribe(listener))
    }

    fn on_session_exit(&self, listener: Arc<ExitListener>) -> Subscription {
        self.inner.exit_listeners.subscribe(listener)
    }
}

impl Drop for PtyRegistry {
    fn drop(&mut self) {
        // Clean up all PTYs when the registry is dropped
        self.close_all();
    }
}

/// Resize through `resize` only when the size actually changes. Returns
/// whether the underlying resize was attempted.
fn apply_resize<E: std::fmt::Display>(
    current: &mut (u16, u16),
    cols: u16,
    rows: u16,
    resize: impl FnOnce(PtySize) -> std::result::Result<(), E>,
) -> bool {
    if *current == (cols, rows) {
        return false;
    }
    let result = resize(PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    });
    match result {
        Ok(()) => *current = (cols, rows),
        Err(e) => log::debug!("resize to {cols}x{rows} failed: {e}"),
    }
    true
}

/// Blocking writes happen here, off the caller's thread. The thread ends when
/// the session is dropped from the registry.
fn spawn_writer_thread(id: SessionId, mut writer: Box<dyn Write + Send>) -> mpsc::Sender<Vec<u8>> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    thread::spawn(move || {
        for data in rx {
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                log::debug!("write to {id} failed: {e}");
                break;
            }
        }
    });
    tx
}

fn spawn_reader_thread(id: SessionId, mut reader: Box<dyn Read + Send>, output: SessionOutput, drained: mpsc::Sender<()>) {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => output.deliver(&buf[..n]),
                Err(e) => {
                    log::debug!("reader for {id} stopped: {e}");
                    break;
                }
            }
        }
        let _ = drained.send(());
    });
}

fn spawn_exit_watcher(
    id: SessionId,
    mut child: Box<dyn Child + Send + Sync>,
    registry: Weak<RegistryInner>,
    drained: mpsc::Receiver<()>,
) {
    thread::spawn(move || {
        let status = child.wait();
        // Let trailing output reach subscribers before the exit does
        let _ = drained.recv_timeout(READER_DRAIN_TIMEOUT);

        let exit = match status {
            Ok(status) => SessionExit {
                session_id: id,
                exit_code: Some(status.exit_code()),
                signal: exit_signal(&status),
            },
            Err(e) => {
                log::debug!("wait on {id} failed: {e}");
                SessionExit {
                    session_id: id,
                    exit_code: None,
                    signal: None,
                }
            }
        };

        let Some(registry) = registry.upgrade() else {
            return;
        };
        registry.sessions.lock().remove(&id);
        log::info!("{id} exited with {:?} {:?}", exit.exit_code, exit.signal);

        for listener in registry.exit_listeners.snapshot() {
            listener(&exit);
        }
    });
}

/// Name of the signal that ended the process. `ExitStatus` keeps it private
/// and only exposes it through `Display`.
fn exit_signal(status: &ExitStatus) -> Option<String> {
    if status.success() {
        return None;
    }
    status
        .to_string()
        .strip_prefix("Terminated by ")
        .map(str::to_string)
}

#[cfg(unix)]
fn terminate(pid: Option<u32>, mut killer: Box<dyn ChildKiller + Send + Sync>) {
    let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        let _ = killer.kill();
        return;
    };
    // Signal the whole process group (shell + everything it started, like Claude)
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }
    thread::spawn(move || {
        thread::sleep(KILL_ESCALATION_DELAY);
        unsafe {
            if libc::kill(-pgid, 0) == 0 {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    });
}

#[cfg(not(unix))]
fn terminate(_pid: Option<u32>, mut killer: Box<dyn ChildKiller + Send + Sync>) {
    let _ = killer.kill();
}

/// First usable shell of: configured path, environment default, platform fallback
pub fn resolve_shell(configured: Option<&str>) -> Result<String> {
    let env_default = default_shell_from_env();
    let candidates = configured
        .map(str::to_string)
        .into_iter()
        .chain(env_default)
        .chain(FALLBACK_SHELLS.iter().map(|s| s.to_string()));

    let mut tried = Vec::new();
    for candidate in candidates {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            continue;
        }
        if let Some(shell) = usable_shell(candidate) {
            return Ok(shell);
        }
        tried.push(candidate.to_string());
    }
    Err(TerminalError::NoShell { tried })
}

fn default_shell_from_env() -> Option<String> {
    #[cfg(windows)]
    let var = "COMSPEC";
    #[cfg(not(windows))]
    let var = "SHELL";
    std::env::var(var).ok().filter(|s| !s.trim().is_empty())
}

fn usable_shell(candidate: &str) -> Option<String> {
    let path = Path::new(candidate);
    if path.is_absolute() {
        return path.is_file().then(|| candidate.to_string());
    }
    which::which(candidate)
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

/// Variables forced onto every session: a colour-capable terminal type, and a
/// UTF-8 locale unless the user already chose one
pub fn session_env(lookup: impl Fn(&str) -> Option<String>) -> Vec<(&'static str, String)> {
    let mut env = vec![
        ("TERM", "xterm-256color".to_string()),
        ("COLORTERM", "truecolor".to_string()),
    ];
    let has_locale = ["LC_ALL", "LC_CTYPE", "LANG"]
        .iter()
        .any(|key| lookup(key).is_some_and(|v| !v.trim().is_empty()));
    if !has_locale {
        env.push(("LANG", "en_US.UTF-8".to_string()));
    }
    env
}

fn build_shell_command(shell: &str, cwd: Option<&Path>) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(shell);
    // Login shell flag is Unix-only
    #[cfg(unix)]
    cmd.arg("-l");

    for (key, value) in session_env(|key| std::env::var(key).ok()) {
        cmd.env(key, value);
    }

    let home = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    let dir = cwd.filter(|p| p.is_dir()).map(Path::to_path_buf).or_else(|| {
        std::env::var_os(home)
            .map(PathBuf::from)
            .filter(|p| p.is_dir())
    });
    if let Some(dir) = dir {
        cmd.cwd(dir);
    }
    cmd
}
