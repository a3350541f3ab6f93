use chrono::{DateTime, Local};
use serde::{ser::SerializeStruct, Serialize, Serializer};
use tokio::sync::mpsc;

use crate::task_id::TaskId;

fn serialize_datetime<S: Serializer>(
    date_time: &DateTime<Local>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(date_time.timestamp_millis())
}

fn serialize_optional_datetime<S: Serializer>(
    date_time: &Option<DateTime<Local>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(date_time.map(|dt| dt.timestamp_millis()).unwrap_or_default())
}

/// Aggregated run counts, collected from per-task trackers through a
/// channel so tasks never contend on a lock. The receiving side folds
/// events into counts on its own task.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTracker {
    #[serde(skip)]
    state_thread: tokio::task::JoinHandle<SummaryState>,
    #[serde(skip)]
    sender: mpsc::Sender<Event>,
    command: String,
    #[serde(serialize_with = "serialize_datetime")]
    pub(crate) start_time: DateTime<Local>,
    #[serde(serialize_with = "serialize_optional_datetime")]
    pub(crate) end_time: Option<DateTime<Local>>,
}

/// The final states of all task executions.
#[derive(Debug, Default, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryState {
    pub attempted: usize,
    pub failed: usize,
    pub cached: usize,
    pub success: usize,
}

impl SummaryState {
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Building => self.attempted += 1,
            Event::BuildFailed => self.failed += 1,
            Event::Cached => self.cached += 1,
            Event::Built => self.success += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Building,
    BuildFailed,
    Cached,
    Built,
}

/// Per-task event reporter handed to the visitor.
pub struct Tracker<T> {
    sender: mpsc::Sender<Event>,
    started_at: T,
    #[allow(dead_code)]
    task_id: TaskId<'static>,
}

/// How a task's execution ended.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ExecutionState {
    Canceled,
    #[serde(rename_all = "camelCase")]
    Built { exit_code: i32 },
    Cached,
    #[serde(rename_all = "camelCase")]
    BuildFailed { exit_code: Option<i32>, err: String },
}

#[derive(Debug, Clone)]
pub struct TaskExecutionSummary {
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub state: ExecutionState,
}

impl Serialize for TaskExecutionSummary {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("TaskExecutionSummary", 3)?;
        state.serialize_field("startedAt", &self.started_at.timestamp_millis())?;
        state.serialize_field("endedAt", &self.ended_at.timestamp_millis())?;
        state.serialize_field("state", &self.state)?;
        state.end()
    }
}

impl TaskExecutionSummary {
    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            ExecutionState::Built { exit_code } => Some(exit_code),
            ExecutionState::BuildFailed { exit_code, .. } => exit_code,
            _ => None,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.ended_at
            .signed_duration_since(self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

impl ExecutionTracker {
    pub fn new(command: String, started_at: DateTime<Local>) -> Self {
        // Messages are a byte; a deep buffer keeps trackers from ever
        // waiting on the state task.
        let (sender, mut receiver) = mpsc::channel(128);
        let state_thread = tokio::spawn(async move {
            let mut state = SummaryState::default();
            while let Some(event) = receiver.recv().await {
                state.handle_event(event);
            }
            state
        });

        Self {
            state_thread,
            sender,
            command,
            start_time: started_at,
            end_time: None,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn tracker(&self, task_id: TaskId<'static>) -> Tracker<()> {
        Tracker {
            sender: self.sender.clone(),
            task_id,
            started_at: (),
        }
    }

    /// Closes the channel and collects the final counts.
    pub async fn finish(self) -> Result<SummaryState, tokio::task::JoinError> {
        let Self {
            state_thread,
            sender,
            ..
        } = self;
        // Dropping the sender closes the channel once in-flight trackers
        // finish.
        drop(sender);
        state_thread.await
    }
}

impl Tracker<()> {
    pub async fn start(self) -> Tracker<DateTime<Local>> {
        let Tracker {
            sender, task_id, ..
        } = self;
        let started_at = Local::now();
        sender
            .send(Event::Building)
            .await
            .expect("execution summary state thread finished early");
        Tracker {
            sender,
            started_at,
            task_id,
        }
    }
}

impl Tracker<DateTime<Local>> {
    pub fn cancel(self) -> TaskExecutionSummary {
        TaskExecutionSummary {
            started_at: self.started_at,
            ended_at: Local::now(),
            state: ExecutionState::Canceled,
        }
    }

    pub async fn cached(self) -> TaskExecutionSummary {
        let Self {
            sender, started_at, ..
        } = self;
        sender
            .send(Event::Cached)
            .await
            .expect("execution summary state thread finished early");
        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::Cached,
        }
    }

    pub async fn build_succeeded(self, exit_code: i32) -> TaskExecutionSummary {
        let Self {
            sender, started_at, ..
        } = self;
        sender
            .send(Event::Built)
            .await
            .expect("execution summary state thread finished early");
        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::Built { exit_code },
        }
    }

    pub async fn build_failed(
        self,
        exit_code: Option<i32>,
        error: impl std::fmt::Display,
    ) -> TaskExecutionSummary {
        let Self {
            sender, started_at, ..
        } = self;
        sender
            .send(Event::BuildFailed)
            .await
            .expect("execution summary state thread finished early");
        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::BuildFailed {
                exit_code,
                err: error.to_string(),
            },
        }
    }
}
