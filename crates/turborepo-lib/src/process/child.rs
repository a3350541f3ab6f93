//! A spawned task process. The child is owned by a monitor task that is the
//! only thing allowed to wait on it; everyone else watches an exit channel
//! and sends stop/kill commands through a command channel, so shutdown
//! cannot race with reaping.

use std::{
    collections::BTreeMap,
    io,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::AsyncReadExt,
    join,
    process::Command as TokioCommand,
    sync::{mpsc, watch, Mutex},
};
use tracing::debug;
use turbopath::AbsoluteSystemPathBuf;

/// A platform-independent description of what to spawn. Tasks are run
/// through a shell so script strings behave the way package managers run
/// them.
#[derive(Debug, Clone)]
pub struct Command {
    program: String,
    args: Vec<String>,
    cwd: AbsoluteSystemPathBuf,
    env: BTreeMap<String, String>,
    label: String,
}

impl Command {
    /// A shell invocation of `script` inside `cwd`.
    pub fn shell(
        script: impl Into<String>,
        cwd: AbsoluteSystemPathBuf,
        env: BTreeMap<String, String>,
        label: impl Into<String>,
    ) -> Self {
        let script = script.into();
        #[cfg(windows)]
        let (program, args) = ("cmd".to_string(), vec!["/C".to_string(), script]);
        #[cfg(not(windows))]
        let (program, args) = ("sh".to_string(), vec!["-c".to_string(), script]);
        Self {
            program,
            args,
            cwd,
            env,
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// How the child left us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Finished(Option<i32>),
    /// Killed by the shutdown path.
    Killed,
    /// Exited due to a signal it received from elsewhere.
    KilledExternal,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub enum ShutdownStyle {
    /// SIGINT, then SIGKILL after the grace period.
    Graceful(Duration),
    Kill,
}

#[derive(Debug)]
enum ChildCommand {
    Stop,
    Kill,
}

/// Handle to a spawned process.
#[derive(Debug, Clone)]
pub struct Child {
    pid: Option<u32>,
    command_tx: mpsc::Sender<ChildCommand>,
    exit_rx: watch::Receiver<Option<ChildExit>>,
    stdout: Arc<Mutex<Option<tokio::process::ChildStdout>>>,
    stderr: Arc<Mutex<Option<tokio::process::ChildStderr>>>,
    label: String,
}

impl Child {
    pub fn spawn(command: Command, shutdown_style: ShutdownStyle) -> io::Result<Child> {
        let Command {
            program,
            args,
            cwd,
            env,
            label,
        } = command;

        let mut cmd = TokioCommand::new(program);
        cmd.args(args)
            .current_dir(cwd.as_std_path())
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            // children get their own process group so a ctrl-c aimed at us
            // doesn't reach them twice
            cmd.process_group(0);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (command_tx, mut command_rx) = mpsc::channel(2);
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let exit = monitor(child, &mut command_rx, shutdown_style, pid).await;
            let _ = exit_tx.send(Some(exit));
        });

        Ok(Child {
            pid,
            command_tx,
            exit_rx,
            stdout: Arc::new(Mutex::new(stdout)),
            stderr: Arc::new(Mutex::new(stderr)),
            label,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Waits for the child to reach a terminal state.
    pub async fn wait(&mut self) -> Option<ChildExit> {
        let mut exit_rx = self.exit_rx.clone();
        loop {
            if let Some(exit) = *exit_rx.borrow() {
                return Some(exit);
            }
            if exit_rx.changed().await.is_err() {
                return *exit_rx.borrow();
            }
        }
    }

    /// Triggers the graceful shutdown path and waits for the result.
    pub async fn stop(&mut self) -> Option<ChildExit> {
        // an error here means the monitor already exited, wait picks it up
        let _ = self.command_tx.send(ChildCommand::Stop).await;
        self.wait().await
    }

    pub async fn kill(&mut self) -> Option<ChildExit> {
        let _ = self.command_tx.send(ChildCommand::Kill).await;
        self.wait().await
    }

    /// Streams the child's interleaved stdout/stderr into `writer` until the
    /// process exits. The writer sees output in the order the runtime reads
    /// it; per-stream ordering is preserved.
    pub async fn wait_with_piped_outputs<W: io::Write>(
        &mut self,
        writer: W,
    ) -> Result<Option<ChildExit>, io::Error> {
        let writer = std::sync::Mutex::new(writer);
        let stdout = self.stdout.lock().await.take();
        let stderr = self.stderr.lock().await.take();

        let drain = |reader: Option<Box<dyn tokio::io::AsyncRead + Unpin + Send>>| {
            let writer = &writer;
            async move {
                let Some(mut reader) = reader else {
                    return Ok::<(), io::Error>(());
                };
                let mut buffer = [0u8; 4096];
                loop {
                    let n = reader.read(&mut buffer).await?;
                    if n == 0 {
                        break;
                    }
                    writer
                        .lock()
                        .expect("output writer poisoned")
                        .write_all(&buffer[..n])?;
                }
                Ok(())
            }
        };

        let stdout_reader: Option<Box<dyn tokio::io::AsyncRead + Unpin + Send>> =
            stdout.map(|s| Box::new(s) as _);
        let stderr_reader: Option<Box<dyn tokio::io::AsyncRead + Unpin + Send>> =
            stderr.map(|s| Box::new(s) as _);

        let (stdout_result, stderr_result, exit) = join!(
            drain(stdout_reader),
            drain(stderr_reader),
            self.wait(),
        );
        stdout_result?;
        stderr_result?;

        Ok(exit)
    }
}

fn natural_exit(status: std::io::Result<std::process::ExitStatus>) -> ChildExit {
    match status {
        Ok(status) => match status.code() {
            Some(code) => ChildExit::Finished(Some(code)),
            // no exit code means a signal took it down
            None => ChildExit::KilledExternal,
        },
        Err(_) => ChildExit::Failed,
    }
}

/// Owns the child for its whole life. Waiting and command handling are
/// raced with `future::select` so the wait future's borrow provably ends
/// (by dropping it) before a shutdown command touches the child.
async fn monitor(
    mut child: tokio::process::Child,
    command_rx: &mut mpsc::Receiver<ChildCommand>,
    shutdown_style: ShutdownStyle,
    pid: Option<u32>,
) -> ChildExit {
    use futures::future::{self, Either};

    let wait = Box::pin(child.wait());
    let command = Box::pin(command_rx.recv());
    match future::select(wait, command).await {
        Either::Left((status, _)) => natural_exit(status),
        Either::Right((command, wait)) => {
            drop(wait);
            match command {
                Some(ChildCommand::Stop) => match shutdown_style {
                    ShutdownStyle::Graceful(grace) => {
                        send_interrupt(pid);
                        match tokio::time::timeout(grace, child.wait()).await {
                            Ok(Ok(status)) => match status.code() {
                                Some(code) => ChildExit::Finished(Some(code)),
                                None => ChildExit::Killed,
                            },
                            Ok(Err(_)) => ChildExit::Failed,
                            Err(_) => {
                                debug!("child survived the grace period, killing");
                                let _ = child.kill().await;
                                ChildExit::Killed
                            }
                        }
                    }
                    ShutdownStyle::Kill => {
                        let _ = child.kill().await;
                        ChildExit::Killed
                    }
                },
                Some(ChildCommand::Kill) => {
                    let _ = child.kill().await;
                    ChildExit::Killed
                }
                // all handles dropped; wait for the natural exit
                None => natural_exit(child.wait().await),
            }
        }
    }
}

#[cfg(unix)]
fn send_interrupt(pid: Option<u32>) {
    if let Some(pid) = pid {
        // the whole process group gets the interrupt
        unsafe {
            libc::kill(-(pid as i32), libc::SIGINT);
        }
    }
}

#[cfg(windows)]
fn send_interrupt(_pid: Option<u32>) {
    // there is no SIGINT equivalent worth sending here; the grace period
    // simply delays the kill
}

#[cfg(test)]
mod test {
    use super::*;

    fn shell(script: &str, cwd: &turbopath::AbsoluteSystemPath) -> Command {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), std::env::var("PATH").unwrap_or_default());
        Command::shell(script, cwd.to_owned(), env, "test")
    }

    #[tokio::test]
    async fn test_successful_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let mut child = Child::spawn(
            shell("exit 0", &cwd),
            ShutdownStyle::Graceful(Duration::from_secs(1)),
        )
        .unwrap();
        assert_eq!(child.wait().await, Some(ChildExit::Finished(Some(0))));
    }

    #[tokio::test]
    async fn test_failing_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let mut child = Child::spawn(
            shell("exit 3", &cwd),
            ShutdownStyle::Graceful(Duration::from_secs(1)),
        )
        .unwrap();
        assert_eq!(child.wait().await, Some(ChildExit::Finished(Some(3))));
    }

    #[tokio::test]
    async fn test_output_capture() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let mut child = Child::spawn(
            shell("echo hello && echo oops >&2", &cwd),
            ShutdownStyle::Graceful(Duration::from_secs(1)),
        )
        .unwrap();
        let mut output = Vec::new();
        let exit = child.wait_with_piped_outputs(&mut output).await.unwrap();
        assert_eq!(exit, Some(ChildExit::Finished(Some(0))));
        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("hello"), "{output}");
        assert!(output.contains("oops"), "{output}");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_graceful_stop_interrupts() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let mut child = Child::spawn(
            shell("sleep 30", &cwd),
            ShutdownStyle::Graceful(Duration::from_secs(5)),
        )
        .unwrap();
        let exit = child.stop().await;
        // sh exits on SIGINT without a code, or is killed after the grace
        assert!(
            matches!(exit, Some(ChildExit::Killed) | Some(ChildExit::Finished(_))),
            "{exit:?}"
        );
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_kill_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let mut child = Child::spawn(
            shell("sleep 30", &cwd),
            ShutdownStyle::Graceful(Duration::from_secs(5)),
        )
        .unwrap();
        let start = std::time::Instant::now();
        let exit = child.kill().await;
        assert_eq!(exit, Some(ChildExit::Killed));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
