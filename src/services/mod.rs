/// Services module
/// Terminal engine: PTY sessions, process-tree inspection, output
/// classification, command dispatch and the coordinator tying them together

pub mod coordinator;
pub mod dispatch;
pub mod events;
pub mod output_classifier;
pub mod poll;
pub mod process_tree;
pub mod pty;
pub mod terminal;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{Coordinator, SessionEvent};
pub use dispatch::Shortcut;
pub use events::{ChannelSink, HostSink, Subscription};
pub use process_tree::{Inspector, OsProcessLister, ProcessLister};
pub use pty::{PtyRegistry, SessionBackend};
pub use terminal::{TerminalCommand, TerminalHandle, TerminalService};
