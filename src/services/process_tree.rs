/// Process Tree Inspector
/// Takes one listing of the OS process table and answers, for a session's root
/// pid, whether the agent runs somewhere below it and which descendant is in
/// the foreground. One listing serves every tab of a poll sweep.

use crate::error::{Result, TerminalError};
use crate::models::ProcessTreeInfo;
use crate::services::output_classifier::{matches_signature, process_name};
use std::collections::HashMap;
use std::future::Future;
use tokio::process::Command;

/// One row of the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub command: String,
}

/// Point-in-time `pid -> (ppid, command)` table plus a child adjacency map.
/// Children keep the order of the listing.
#[derive(Debug, Default)]
pub struct ProcessSnapshot {
    processes: HashMap<u32, ProcessEntry>,
    children: HashMap<u32, Vec<u32>>,
}

impl ProcessSnapshot {
    pub fn from_entries(entries: impl IntoIterator<Item = ProcessEntry>) -> Self {
        let mut snapshot = Self::default();
        for entry in entries {
            // pid 0 lists itself as its own parent on some systems
            if entry.pid != entry.ppid {
                snapshot.children.entry(entry.ppid).or_default().push(entry.pid);
            }
            snapshot.processes.insert(entry.pid, entry);
        }
        snapshot
    }

    /// Parse `ps -A -o pid=,ppid=,command=` output
    pub fn parse_ps(output: &str) -> Self {
        Self::from_entries(output.lines().filter_map(parse_ps_line))
    }

    /// Parse `wmic process get Name,ParentProcessId,ProcessId /format:csv` output
    pub fn parse_wmic_csv(output: &str) -> Self {
        Self::from_entries(output.lines().filter_map(parse_wmic_line))
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn children(&self, pid: u32) -> &[u32] {
        self.children.get(&pid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn command(&self, pid: u32) -> Option<&str> {
        self.processes.get(&pid).map(|p| p.command.as_str())
    }

    fn name(&self, pid: u32) -> &str {
        self.command(pid).map(process_name).unwrap_or("")
    }

    /// Every process below `root`, depth first.
    /// OS parent links form a forest, so the walk needs no visited set.
    pub fn descendants(&self, root: u32) -> Vec<u32> {
        let mut out = Vec::new();
        self.collect_descendants(root, &mut out);
        out
    }

    fn collect_descendants(&self, pid: u32, out: &mut Vec<u32>) {
        for &child in self.children(pid) {
            out.push(child);
            self.collect_descendants(child, out);
        }
    }

    /// Agent presence and foreground process below a session's root pid.
    ///
    /// The foreground name comes from a fixed three-level descent starting at
    /// the first direct child (the shell): shell -> first child -> its first
    /// child. It is tuned for ordinary job control and can misname deeper
    /// nestings such as tmux inside tmux.
    pub fn inspect(&self, root_pid: u32, signature: &str) -> ProcessTreeInfo {
        let Some(&shell) = self.children(root_pid).first() else {
            return ProcessTreeInfo::default();
        };

        let is_target_agent_running = self
            .descendants(root_pid)
            .into_iter()
            .filter_map(|pid| self.command(pid))
            .any(|command| matches_signature(command, signature));

        let shell_name = self.name(shell);
        let foreground = match self.children(shell).first() {
            None => shell_name.to_string(),
            Some(&second) => {
                let second_name = self.name(second);
                match self.children(second).first() {
                    Some(&third) => {
                        let third_name = self.name(third);
                        if third_name != second_name {
                            format!("{second_name}({third_name})")
                        } else {
                            second_name.to_string()
                        }
                    }
                    None if matches_signature(second_name, signature) => {
                        format!("{shell_name}({second_name})")
                    }
                    None => second_name.to_string(),
                }
            }
        };

        ProcessTreeInfo {
            is_target_agent_running,
            foreground_process: Some(foreground),
        }
    }
}

fn parse_ps_line(line: &str) -> Option<ProcessEntry> {
    let line = line.trim();
    let (pid, rest) = line.split_once(char::is_whitespace)?;
    let rest = rest.trim_start();
    let (ppid, command) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    Some(ProcessEntry {
        pid: pid.parse().ok()?,
        ppid: ppid.parse().ok()?,
        command: command.trim().to_string(),
    })
}

fn parse_wmic_line(line: &str) -> Option<ProcessEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with("Node,") {
        return None;
    }
    // Node,Name,ParentProcessId,ProcessId
    let mut fields = line.rsplitn(3, ',');
    let pid = fields.next()?.trim().parse().ok()?;
    let ppid = fields.next()?.trim().parse().ok()?;
    let head = fields.next()?;
    let name = head.split_once(',').map(|(_, name)| name).unwrap_or(head);
    Some(ProcessEntry {
        pid,
        ppid,
        command: name.trim().to_string(),
    })
}

/// Source of process table listings
pub trait ProcessLister: Send + Sync + 'static {
    fn list(&self) -> impl Future<Output = Result<ProcessSnapshot>> + Send;
}

/// Lists processes with the platform's process-listing tool
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessLister;

impl ProcessLister for OsProcessLister {
    async fn list(&self) -> Result<ProcessSnapshot> {
        #[cfg(windows)]
        let mut cmd = {
            let mut cmd = Command::new("wmic");
            cmd.args(["process", "get", "Name,ParentProcessId,ProcessId", "/format:csv"]);
            cmd
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut cmd = Command::new("ps");
            cmd.args(["-A", "-o", "pid=,ppid=,command="]);
            cmd
        };

        let output = cmd
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TerminalError::ProcessList(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(TerminalError::ProcessList(if stderr.is_empty() {
                format!("listing exited with {}", output.status)
            } else {
                stderr
            }));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        #[cfg(windows)]
        let snapshot = ProcessSnapshot::parse_wmic_csv(&stdout);
        #[cfg(not(windows))]
        let snapshot = ProcessSnapshot::parse_ps(&stdout);
        Ok(snapshot)
    }
}

/// Process-tree queries for sessions, backed by one listing per call
pub struct Inspector<L> {
    lister: L,
    signature: String,
}

impl<L: ProcessLister> Inspector<L> {
    pub fn new(lister: L, signature: impl Into<String>) -> Self {
        Self {
            lister,
            signature: signature.into(),
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// One listing, or `None` when the listing failed (no information this tick)
    pub async fn snapshot(&self) -> Option<ProcessSnapshot> {
        match self.lister.list().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                log::debug!("process listing unavailable: {e}");
                None
            }
        }
    }

    /// Inspect a single session root; a failed listing reads as "nothing running"
    pub async fn get_process_tree(&self, root_pid: u32) -> ProcessTreeInfo {
        self.snapshot()
            .await
            .map(|snapshot| snapshot.inspect(root_pid, &self.signature))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pid: u32, ppid: u32, command: &str) -> ProcessEntry {
        ProcessEntry {
            pid,
            ppid,
            command: command.to_string(),
        }
    }

    #[test]
    fn no_children_means_nothing_known() {
        let snapshot = ProcessSnapshot::from_entries([entry(100, 1, "/bin/zsh -l")]);
        assert_eq!(snapshot.inspect(100, "claude"), ProcessTreeInfo::default());
    }

    #[test]
    fn shell_alone_reports_shell_name() {
        let snapshot = ProcessSnapshot::from_entries([
            entry(100, 1, "login"),
            entry(101, 100, "/bin/zsh -l"),
        ]);
        let info = snapshot.inspect(100, "claude");
        assert!(!info.is_target_agent_running);
        assert_eq!(info.foreground_process.as_deref(), Some("zsh"));
    }

    #[test]
    fn agent_under_shell_is_nested_with_shell_name() {
        let snapshot = ProcessSnapshot::from_entries([
            entry(101, 100, "/bin/zsh -l"),
            entry(102, 101, "claude --continue"),
        ]);
        let info = snapshot.inspect(100, "claude");
        assert!(info.is_target_agent_running);
        assert_eq!(info.foreground_process.as_deref(), Some("zsh(claude)"));
    }

    #[test]
    fn ordinary_child_is_reported_alone() {
        let snapshot = ProcessSnapshot::from_entries([
            entry(101, 100, "/bin/bash"),
            entry(102, 101, "/usr/bin/vim notes.md"),
        ]);
        let info = snapshot.inspect(100, "claude");
        assert_eq!(info.foreground_process.as_deref(), Some("vim"));
    }

    #[test]
    fn third_level_is_combined_with_second() {
        let snapshot = ProcessSnapshot::from_entries([
            entry(101, 100, "/bin/zsh"),
            entry(102, 101, "node /usr/local/bin/claude"),
            entry(103, 102, "git status"),
            entry(104, 103, "less"),
        ]);
        let info = snapshot.inspect(100, "claude");
        assert!(info.is_target_agent_running);
        assert_eq!(info.foreground_process.as_deref(), Some("node(git)"));
    }

    #[test]
    fn equal_names_are_not_repeated() {
        let snapshot = ProcessSnapshot::from_entries([
            entry(101, 100, "/bin/zsh"),
            entry(102, 101, "node server.js"),
            entry(103, 102, "node worker.js"),
        ]);
        let info = snapshot.inspect(100, "claude");
        assert!(!info.is_target_agent_running);
        assert_eq!(info.foreground_process.as_deref(), Some("node"));
    }

    #[test]
    fn deep_descendant_still_counts_as_running() {
        let snapshot = ProcessSnapshot::from_entries([
            entry(101, 100, "/bin/zsh"),
            entry(102, 101, "tmux"),
            entry(103, 102, "/bin/zsh"),
            entry(104, 103, "Claude"),
            entry(200, 1, "claude"),
        ]);
        assert!(snapshot.inspect(100, "claude").is_target_agent_running);
        assert_eq!(snapshot.descendants(100), vec![101, 102, 103, 104]);
    }

    #[test]
    fn first_child_follows_listing_order() {
        let snapshot = ProcessSnapshot::from_entries([
            entry(101, 100, "/bin/zsh"),
            entry(105, 101, "sleep 100"),
            entry(102, 101, "claude"),
        ]);
        let info = snapshot.inspect(100, "claude");
        assert!(info.is_target_agent_running);
        assert_eq!(info.foreground_process.as_deref(), Some("sleep"));
    }

    #[test]
    fn parses_ps_columns() {
        let output = "    1     0 /sbin/init splash\n  812     1 /bin/zsh -l\n  900   812 claude\nbogus line\n";
        let snapshot = ProcessSnapshot::parse_ps(output);
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.command(812), Some("/bin/zsh -l"));
        assert_eq!(snapshot.children(812), &[900]);
    }

    #[test]
    fn parses_wmic_csv() {
        let output = "\r\nNode,Name,ParentProcessId,ProcessId\r\nBOX,cmd.exe,4000,4100\r\nBOX,claude.exe,4100,4200\r\n";
        let snapshot = ProcessSnapshot::parse_wmic_csv(output);
        assert_eq!(snapshot.len(), 2);
        let info = snapshot.inspect(4000, "claude");
        assert!(info.is_target_agent_running);
        assert_eq!(info.foreground_process.as_deref(), Some("cmd.exe(claude.exe)"));
    }

    struct FailingLister;

    impl ProcessLister for FailingLister {
        async fn list(&self) -> Result<ProcessSnapshot> {
            Err(TerminalError::ProcessList("no matching rows".to_string()))
        }
    }

    #[tokio::test]
    async fn failed_listing_is_a_soft_signal() {
        let inspector = Inspector::new(FailingLister, "claude");
        assert_eq!(inspector.get_process_tree(42).await, ProcessTreeInfo::default());
        assert!(inspector.snapshot().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn os_listing_contains_current_process() {
        let snapshot = OsProcessLister.list().await.unwrap();
        assert!(snapshot.command(std::process::id()).is_some());
    }
}
