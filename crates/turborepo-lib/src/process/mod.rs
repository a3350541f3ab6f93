//! Process supervision. Every child the runner spawns is registered here so
//! that shutdown (a signal, or the first failure in strict mode) can
//! interrupt, wait out the grace period, and kill survivors.

mod child;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::future::join_all;
use tracing::debug;

pub use child::{Child, ChildExit, Command, ShutdownStyle};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct ProcessManagerInner {
    is_closing: bool,
    children: Vec<Child>,
}

/// Tracks live children and owns the shutdown sequence. Cheap to clone;
/// clones share state.
#[derive(Debug, Clone)]
pub struct ProcessManager {
    state: Arc<Mutex<ProcessManagerInner>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProcessManagerInner {
                is_closing: false,
                children: Vec::new(),
            })),
        }
    }

    /// Spawns a child with the graceful shutdown contract. Returns `None`
    /// when the manager is already shutting down, so late-scheduled tasks
    /// don't leak processes past the shutdown sequence.
    pub fn spawn(
        &self,
        command: Command,
        grace_period: Duration,
    ) -> Option<std::io::Result<Child>> {
        let mut state = self.state.lock().expect("process manager lock poisoned");
        if state.is_closing {
            return None;
        }
        let child = Child::spawn(command, ShutdownStyle::Graceful(grace_period));
        if let Ok(child) = &child {
            state.children.push(child.clone());
        }
        Some(child)
    }

    /// Interrupt every live child, give it the grace period, kill whatever
    /// remains. New spawns are refused from the moment this is called.
    pub async fn stop(&self) {
        let children = {
            let mut state = self.state.lock().expect("process manager lock poisoned");
            state.is_closing = true;
            state.children.drain(..).collect::<Vec<_>>()
        };

        let results = join_all(children.into_iter().map(|mut child| async move {
            let exit = child.stop().await;
            debug!("child {} stopped with {:?}", child.label(), exit);
        }))
        .await;
        drop(results);
    }

    /// Waits for all children to exit naturally, without signaling them.
    pub async fn wait(&self) {
        let children = {
            let mut state = self.state.lock().expect("process manager lock poisoned");
            state.is_closing = true;
            state.children.drain(..).collect::<Vec<_>>()
        };

        join_all(children.into_iter().map(|mut child| async move {
            child.wait().await;
        }))
        .await;
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;

    fn shell_command(script: &str, cwd: &turbopath::AbsoluteSystemPath) -> Command {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), std::env::var("PATH").unwrap_or_default());
        Command::shell(script, cwd.to_owned(), env, script.to_string())
    }

    #[tokio::test]
    async fn test_wait_collects_children() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let manager = ProcessManager::new();
        let mut child = manager
            .spawn(shell_command("exit 0", &cwd), Duration::from_secs(1))
            .unwrap()
            .unwrap();
        manager.wait().await;
        assert_eq!(child.wait().await, Some(ChildExit::Finished(Some(0))));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_stop_terminates_long_running_children() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let manager = ProcessManager::new();
        manager
            .spawn(shell_command("sleep 60", &cwd), Duration::from_millis(200))
            .unwrap()
            .unwrap();

        let start = std::time::Instant::now();
        manager.stop().await;
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_no_spawns_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let manager = ProcessManager::new();
        manager.stop().await;
        assert!(manager
            .spawn(shell_command("exit 0", &cwd), Duration::from_secs(1))
            .is_none());
    }
}
