use std::sync::{Arc, Mutex};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::debug;
use turborepo_graph_utils::Walker;

use super::{Engine, TaskNode};
use crate::task_id::TaskId;

/// A unit of work handed to the visitor, with a callback for the result.
pub struct Message<T, U> {
    pub info: T,
    pub callback: oneshot::Sender<U>,
}

impl<T, U> Message<T, U> {
    pub fn new(info: T) -> (Self, oneshot::Receiver<U>) {
        let (callback, receiver) = oneshot::channel();
        (Self { info, callback }, receiver)
    }
}

type VisitorData = TaskId<'static>;
type VisitorResult = Result<(), StopExecution>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    parallel: bool,
    concurrency: usize,
}

impl ExecutionOptions {
    pub fn new(parallel: bool, concurrency: usize) -> Self {
        Self {
            parallel,
            concurrency,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Semaphore closed before all tasks finished")]
    Semaphore(#[from] tokio::sync::AcquireError),
    #[error("Engine visitor closed channel before walk finished")]
    Visitor,
}

impl From<mpsc::error::SendError<Message<VisitorData, VisitorResult>>> for ExecuteError {
    fn from(_: mpsc::error::SendError<Message<VisitorData, VisitorResult>>) -> Self {
        ExecuteError::Visitor
    }
}

/// The sentinel a visitor returns to stop scheduling further tasks. Tasks
/// already running are unaffected.
#[derive(Debug, Clone, Copy)]
pub struct StopExecution;

impl Engine {
    /// Walks the task graph in dependency order, sending each ready task to
    /// the visitor and gating starts on the concurrency semaphore (ignored
    /// with `--parallel`). A task's predecessors are strictly complete
    /// before the task is sent; siblings are unordered.
    pub async fn execute(
        self: Arc<Self>,
        options: ExecutionOptions,
        visitor: mpsc::Sender<Message<VisitorData, VisitorResult>>,
    ) -> Result<(), ExecuteError> {
        let ExecutionOptions {
            parallel,
            concurrency,
        } = options;
        let sema = Arc::new(Semaphore::new(concurrency));
        let mut tasks: FuturesUnordered<tokio::task::JoinHandle<Result<(), ExecuteError>>> =
            FuturesUnordered::new();

        let (walker, mut nodes) = Walker::new(&self.task_graph).walk();
        let walker = Arc::new(Mutex::new(walker));

        while let Some((node_id, done)) = nodes.recv().await {
            let visitor = visitor.clone();
            let sema = sema.clone();
            let walker = walker.clone();
            let this = self.clone();

            tasks.push(tokio::spawn(async move {
                let TaskNode::Task(task_id) = this
                    .task_graph
                    .node_weight(node_id)
                    .expect("node id must be present")
                else {
                    // the root node has no work attached
                    if done.send(()).is_err() {
                        debug!("walk done callback receiver dropped before signal");
                    }
                    return Ok(());
                };

                // With --parallel the graph is walked without a budget.
                let _permit = match parallel {
                    false => Some(
                        sema.acquire()
                            .await
                            .expect("semaphore is open while tasks are pending"),
                    ),
                    true => None,
                };

                let (message, result) = Message::new(task_id.clone());
                visitor.send(message).await?;

                let stop = matches!(
                    result.await.unwrap_or_else(|_| {
                        // A dropped callback counts as completion.
                        debug!("visitor dropped callback without sending a result");
                        Ok(())
                    }),
                    Err(StopExecution)
                );

                if stop {
                    if walker
                        .lock()
                        .expect("walker lock poisoned")
                        .cancel()
                        .is_err()
                    {
                        debug!("unable to cancel graph walk");
                    }
                }
                if done.send(()).is_err() {
                    debug!("walk done callback receiver dropped before signal");
                }
                Ok(())
            }));
        }

        while let Some(res) = tasks.next().await {
            res.expect("task join failed")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{engine::Building, task_graph::TaskDefinition};

    fn three_task_engine() -> Engine {
        // c depends on b depends on a
        let mut engine: Engine<Building> = Engine::new();
        let a = TaskId::new("pkg", "a").into_owned();
        let b = TaskId::new("pkg", "b").into_owned();
        let c = TaskId::new("pkg", "c").into_owned();
        let a_index = engine.get_index(&a);
        let b_index = engine.get_index(&b);
        let c_index = engine.get_index(&c);
        engine.add_edge(b_index, a_index);
        engine.add_edge(c_index, b_index);
        engine.connect_to_root(&a);
        for task in [a, b, c] {
            engine.add_definition(task, TaskDefinition::default());
        }
        engine.seal()
    }

    #[tokio::test]
    async fn test_execution_order_respects_dependencies() {
        let engine = Arc::new(three_task_engine());
        let (tx, mut rx) = mpsc::channel(1);

        let execute = tokio::spawn(engine.execute(ExecutionOptions::new(false, 2), tx));

        let mut visited = Vec::new();
        while let Some(Message { info, callback }) = rx.recv().await {
            visited.push(info.to_string());
            callback.send(Ok(())).unwrap();
        }
        execute.await.unwrap().unwrap();

        assert_eq!(visited, vec!["pkg#a", "pkg#b", "pkg#c"]);
    }

    #[tokio::test]
    async fn test_stop_execution_halts_scheduling() {
        let engine = Arc::new(three_task_engine());
        let (tx, mut rx) = mpsc::channel(1);

        let execute = tokio::spawn(engine.execute(ExecutionOptions::new(false, 2), tx));

        let seen = AtomicUsize::new(0);
        while let Some(Message { info: _, callback }) = rx.recv().await {
            seen.fetch_add(1, Ordering::SeqCst);
            // fail the first task
            callback.send(Err(StopExecution)).unwrap();
        }
        execute.await.unwrap().unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
