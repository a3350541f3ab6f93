//! Task execution. The engine walks the graph and hands ready tasks to the
//! visitor; the visitor consults the cache, spawns children, captures their
//! output, stores results, and reports task events to the run tracker.

use std::{
    io::Write,
    sync::{Arc, Mutex},
};

use futures::{stream::FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use turbopath::AbsoluteSystemPathBuf;

use crate::{
    cli::{EnvMode, LogPrefix},
    engine::{Engine, Message, StopExecution},
    opts::{ResolvedLogOrder, RunOpts},
    process::{ChildExit, Command, ProcessManager, DEFAULT_GRACE_PERIOD},
    run::{
        cache::RunCache,
        summary::{RunTracker, TaskCacheSummary},
    },
    task_hash::TaskHasher,
    task_id::TaskId,
    turbo_json::OutputLogsMode,
};
use turborepo_repository::package_graph::PackageGraph;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find package {package_name} for task {task_id}")]
    MissingPackage {
        package_name: String,
        task_id: TaskId<'static>,
    },
    #[error("missing task definition for {0}")]
    MissingDefinition(TaskId<'static>),
    #[error(transparent)]
    Env(#[from] crate::task_hash::Error),
    #[error("unable to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A task that exited non-zero, for the final report.
#[derive(Debug, Clone)]
pub struct TaskError {
    pub task_id: TaskId<'static>,
    pub exit_code: Option<i32>,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{} exited ({code})", self.task_id),
            None => write!(f, "{} was terminated", self.task_id),
        }
    }
}

pub struct Visitor<'a> {
    repo_root: &'a AbsoluteSystemPathBuf,
    package_graph: &'a PackageGraph,
    engine: Arc<Engine>,
    run_cache: Arc<RunCache>,
    run_tracker: &'a RunTracker,
    task_hasher: &'a TaskHasher<'a>,
    run_opts: &'a RunOpts,
    env_mode: EnvMode,
    global_env: Vec<String>,
    global_pass_through_env: Option<Vec<String>>,
    manager: ProcessManager,
    errors: Arc<Mutex<Vec<TaskError>>>,
}

impl<'a> Visitor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo_root: &'a AbsoluteSystemPathBuf,
        package_graph: &'a PackageGraph,
        engine: Arc<Engine>,
        run_cache: Arc<RunCache>,
        run_tracker: &'a RunTracker,
        task_hasher: &'a TaskHasher<'a>,
        run_opts: &'a RunOpts,
        env_mode: EnvMode,
        global_env: Vec<String>,
        global_pass_through_env: Option<Vec<String>>,
        manager: ProcessManager,
    ) -> Self {
        Self {
            repo_root,
            package_graph,
            engine,
            run_cache,
            run_tracker,
            task_hasher,
            run_opts,
            env_mode,
            global_env,
            global_pass_through_env,
            manager,
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn errors(&self) -> Vec<TaskError> {
        self.errors.lock().expect("task error lock poisoned").clone()
    }

    /// Consumes ready tasks from the engine until the walk completes. Tasks
    /// execute concurrently, so the stream and the in-flight futures are
    /// polled together; the walker itself blocks on our done callbacks.
    pub async fn visit(
        &self,
        mut node_stream: mpsc::Receiver<Message<TaskId<'static>, Result<(), StopExecution>>>,
    ) -> Result<(), Error> {
        let mut task_futures = FuturesUnordered::new();
        let mut stream_open = true;

        loop {
            tokio::select! {
                message = node_stream.recv(), if stream_open => {
                    match message {
                        Some(Message { info: task_id, callback }) => {
                            task_futures.push(self.execute_task(task_id, callback));
                        }
                        None => stream_open = false,
                    }
                }
                result = task_futures.next(), if !task_futures.is_empty() => {
                    if let Some(result) = result {
                        result?;
                    }
                }
                else => break,
            }
        }

        Ok(())
    }

    async fn execute_task(
        &self,
        task_id: TaskId<'static>,
        callback: tokio::sync::oneshot::Sender<Result<(), StopExecution>>,
    ) -> Result<(), Error> {
        let task_definition = self
            .engine
            .task_definition(&task_id)
            .ok_or_else(|| Error::MissingDefinition(task_id.clone()))?;
        let package_name = task_id.to_workspace_name();
        let package_info = self
            .package_graph
            .package_info(&package_name)
            .ok_or_else(|| Error::MissingPackage {
                package_name: package_name.to_string(),
                task_id: task_id.clone(),
            })?;

        let hash = self
            .task_hasher
            .task_hash_tracker()
            .hash(&task_id)
            .expect("every task is hashed before execution");

        let mut task_cache = self.run_cache.task_cache(
            task_definition,
            package_info.package_path(),
            &task_id,
            &hash,
        );

        let mut output = self.task_output(&task_id);
        let tracker = self.run_tracker.task_tracker(task_id.clone()).start().await;

        // Cache probe (restore_outputs itself honors --force).
        match task_cache.restore_outputs(&mut output).await {
            Ok(Some(cache_hit)) => {
                let execution = tracker.cached().await;
                self.task_hasher
                    .task_hash_tracker()
                    .track_expanded_outputs(task_id.clone(), task_cache.expanded_outputs().to_vec());
                self.add_task_summary(
                    &task_id,
                    &hash,
                    TaskCacheSummary::from_hit(Some(cache_hit)),
                    Some(execution),
                    task_cache.expanded_outputs().to_vec(),
                );
                output.finish()?;
                callback.send(Ok(())).ok();
                return Ok(());
            }
            Ok(None) => {}
            Err(err) => {
                // cache read problems are misses
                debug!("cache restore failed for {task_id}: {err}");
            }
        }

        let Some(command) = package_info.package_json.command(task_id.task()) else {
            // Nothing to run; counts as an immediate success with no outputs.
            let execution = tracker.build_succeeded(0).await;
            self.add_task_summary(
                &task_id,
                &hash,
                TaskCacheSummary::default(),
                Some(execution),
                Vec::new(),
            );
            output.finish()?;
            callback.send(Ok(())).ok();
            return Ok(());
        };

        let package_dir = self.repo_root.resolve(package_info.package_path());
        let execution_env = self.task_hasher.execution_env(
            self.env_mode,
            task_definition,
            &self.global_env,
            self.global_pass_through_env.as_deref(),
            &hash,
        )?;

        let child_command = Command::shell(
            command,
            package_dir,
            execution_env.into_inner().into_iter().collect(),
            task_id.to_string(),
        );

        let Some(child) = self.manager.spawn(child_command, DEFAULT_GRACE_PERIOD) else {
            // Shutdown already started; this task never ran.
            let execution = tracker.cancel();
            self.add_task_summary(
                &task_id,
                &hash,
                TaskCacheSummary::default(),
                Some(execution),
                Vec::new(),
            );
            output.finish()?;
            callback.send(Err(StopExecution)).ok();
            return Ok(());
        };
        let mut child = child.map_err(Error::Spawn)?;

        // Everything the child prints goes to the log file; the console copy
        // depends on the task's output mode.
        let log_path = task_cache.log_file_path().clone();
        log_path.ensure_dir()?;
        let log_file = log_path.open_with_options({
            let mut options = std::fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            options
        })?;
        let console_suppressed = matches!(
            task_cache.output_logs(),
            OutputLogsMode::None | OutputLogsMode::HashOnly | OutputLogsMode::ErrorsOnly
        );

        let exit = {
            let mut tee = TeeWriter::new(log_file, &mut output, console_suppressed);
            child.wait_with_piped_outputs(&mut tee).await?
        };

        match exit {
            Some(ChildExit::Finished(Some(0))) => {
                let execution = tracker.build_succeeded(0).await;
                let duration = execution.duration_ms();
                if let Err(err) = task_cache.save_outputs(duration).await {
                    // never fails the task
                    warn!("failed to cache outputs for {task_id}: {err}");
                }
                self.task_hasher
                    .task_hash_tracker()
                    .track_expanded_outputs(task_id.clone(), task_cache.expanded_outputs().to_vec());
                self.add_task_summary(
                    &task_id,
                    &hash,
                    TaskCacheSummary::default(),
                    Some(execution),
                    task_cache.expanded_outputs().to_vec(),
                );
                output.finish()?;
                callback.send(Ok(())).ok();
            }
            Some(ChildExit::Finished(exit_code)) => {
                let exit_code = exit_code.unwrap_or(1);
                error!("{task_id} exited ({exit_code})");
                let execution = tracker
                    .build_failed(Some(exit_code), format!("command exited ({exit_code})"))
                    .await;
                task_cache.on_error(&mut output).ok();
                self.add_task_summary(
                    &task_id,
                    &hash,
                    TaskCacheSummary::default(),
                    Some(execution),
                    Vec::new(),
                );
                output.finish()?;
                self.errors
                    .lock()
                    .expect("task error lock poisoned")
                    .push(TaskError {
                        task_id: task_id.clone(),
                        exit_code: Some(exit_code),
                    });

                if self.run_opts.continue_on_error {
                    callback.send(Ok(())).ok();
                } else {
                    // strict mode: first failure stops scheduling and tears
                    // down live children
                    self.manager.stop().await;
                    callback.send(Err(StopExecution)).ok();
                }
            }
            Some(ChildExit::Killed) | Some(ChildExit::KilledExternal) | Some(ChildExit::Failed)
            | None => {
                let execution = tracker.cancel();
                self.add_task_summary(
                    &task_id,
                    &hash,
                    TaskCacheSummary::default(),
                    Some(execution),
                    Vec::new(),
                );
                output.finish()?;
                self.errors
                    .lock()
                    .expect("task error lock poisoned")
                    .push(TaskError {
                        task_id: task_id.clone(),
                        exit_code: None,
                    });
                callback.send(Err(StopExecution)).ok();
            }
        }

        Ok(())
    }

    fn task_output(&self, task_id: &TaskId<'static>) -> TaskOutput {
        let prefix = match self.run_opts.log_prefix {
            LogPrefix::None => String::new(),
            LogPrefix::Auto | LogPrefix::Task => format!("{task_id}: "),
        };
        match self.run_opts.log_order {
            ResolvedLogOrder::Stream => TaskOutput::streamed(prefix),
            ResolvedLogOrder::Grouped => TaskOutput::grouped(prefix),
        }
    }

    fn add_task_summary(
        &self,
        task_id: &TaskId<'static>,
        hash: &str,
        cache_state: TaskCacheSummary,
        execution: Option<crate::run::summary::TaskExecutionSummary>,
        expanded_outputs: Vec<turbopath::AnchoredSystemPathBuf>,
    ) {
        let mut summary = crate::run::task_summary(
            task_id,
            hash,
            &self.engine,
            self.package_graph,
            self.task_hasher,
        );
        summary.cache_state = cache_state;
        summary.execution = execution;
        summary.expanded_outputs = expanded_outputs;
        self.run_tracker.add_task_summary(summary);
    }
}

/// Task output plumbing: lines are prefixed with the task id and either
/// streamed to the terminal as they arrive or buffered and emitted as one
/// contiguous block when the task finishes.
pub struct TaskOutput {
    prefix: String,
    buffer: Option<Vec<u8>>,
    line_start: bool,
}

impl TaskOutput {
    fn streamed(prefix: String) -> Self {
        Self {
            prefix,
            buffer: None,
            line_start: true,
        }
    }

    fn grouped(prefix: String) -> Self {
        Self {
            prefix,
            buffer: Some(Vec::new()),
            line_start: true,
        }
    }

    fn write_prefixed(&mut self, buf: &[u8]) -> std::io::Result<()> {
        let mut rendered = Vec::with_capacity(buf.len());
        for &byte in buf {
            if self.line_start && !self.prefix.is_empty() {
                rendered.extend_from_slice(self.prefix.as_bytes());
            }
            self.line_start = byte == b'\n';
            rendered.push(byte);
        }
        match &mut self.buffer {
            Some(buffer) => buffer.extend_from_slice(&rendered),
            None => {
                let stdout = std::io::stdout();
                let mut handle = stdout.lock();
                handle.write_all(&rendered)?;
                handle.flush()?;
            }
        }
        Ok(())
    }

    /// Emits buffered output as one block. A no-op when streaming.
    fn finish(&mut self) -> std::io::Result<()> {
        if let Some(buffer) = self.buffer.take() {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            handle.write_all(&buffer)?;
            handle.flush()?;
        }
        Ok(())
    }
}

impl Write for TaskOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_prefixed(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Copies child output to the log file and, unless suppressed, to the
/// console writer.
struct TeeWriter<'a, F: Write> {
    log_file: F,
    console: &'a mut TaskOutput,
    console_suppressed: bool,
}

impl<'a, F: Write> TeeWriter<'a, F> {
    fn new(log_file: F, console: &'a mut TaskOutput, console_suppressed: bool) -> Self {
        Self {
            log_file,
            console,
            console_suppressed,
        }
    }
}

impl<F: Write> Write for TeeWriter<'_, F> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.log_file.write_all(buf)?;
        if !self.console_suppressed {
            self.console.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.log_file.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_prefixed_streaming_marks_each_line() {
        let mut output = TaskOutput::grouped("web#build: ".to_string());
        output.write_all(b"line one\nline two\n").unwrap();
        let buffer = output.buffer.clone().unwrap();
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "web#build: line one\nweb#build: line two\n"
        );
    }

    #[test]
    fn test_prefix_handles_partial_lines() {
        let mut output = TaskOutput::grouped("t: ".to_string());
        output.write_all(b"start").unwrap();
        output.write_all(b" end\n").unwrap();
        let buffer = output.buffer.clone().unwrap();
        assert_eq!(String::from_utf8(buffer).unwrap(), "t: start end\n");
    }

    #[test]
    fn test_tee_writer_suppression() {
        let mut console = TaskOutput::grouped(String::new());
        let mut log = Vec::new();
        {
            let mut tee = TeeWriter::new(&mut log, &mut console, true);
            tee.write_all(b"secret build output\n").unwrap();
        }
        assert_eq!(log, b"secret build output\n");
        assert!(console.buffer.clone().unwrap().is_empty());
    }
}
