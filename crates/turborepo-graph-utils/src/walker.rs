use std::{collections::HashMap, hash::Hash};

use futures::{future::join_all, stream::FuturesUnordered, StreamExt};
use petgraph::{
    visit::{IntoNeighborsDirected, IntoNodeIdentifiers},
    Direction,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::log::trace;

/// Emits graph nodes once all of their dependencies (outgoing neighbors) have
/// been marked done. The graph must not be modified once a walker exists.
///
/// Each node gets a broadcast channel that fires when it finishes; a node's
/// task waits on the channels of its dependencies, then sends the node to the
/// caller along with a oneshot the caller uses to mark it done.
pub struct Walker<N, S> {
    marker: std::marker::PhantomData<S>,
    cancel: watch::Sender<bool>,
    node_events: Option<mpsc::Receiver<WalkMessage<N>>>,
    join_handles: FuturesUnordered<JoinHandle<()>>,
}

pub struct Start;
pub struct Walking;

pub type WalkMessage<N> = (N, oneshot::Sender<()>);

// petgraph node ids are Copy + Eq integers, so these bounds cost nothing.
impl<N: Eq + Hash + Copy + Send + 'static> Walker<N, Start> {
    pub fn new<G: IntoNodeIdentifiers<NodeId = N> + IntoNeighborsDirected>(graph: G) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        let mut txs = HashMap::new();
        let mut rxs = HashMap::new();
        for node in graph.node_identifiers() {
            // a node finishes at most once
            let (tx, rx) = broadcast::channel::<()>(1);
            txs.insert(node, tx);
            rxs.insert(node, rx);
        }
        // At most txs.len() nodes will ever be emitted, so sends never block.
        // The channel capacity must be at least 1.
        let (node_tx, node_rx) = mpsc::channel(std::cmp::max(txs.len(), 1));
        let join_handles = FuturesUnordered::new();

        for node in graph.node_identifiers() {
            let tx = txs.remove(&node).expect("every node got a sender");
            let mut cancel_rx = cancel_rx.clone();
            let node_tx = node_tx.clone();
            let mut deps_rx = graph
                .neighbors_directed(node, Direction::Outgoing)
                .map(|dep| {
                    rxs.get(&dep)
                        .expect("graph must contain all neighbor nodes")
                        .resubscribe()
                })
                .collect::<Vec<_>>();

            join_handles.push(tokio::spawn(async move {
                let deps_fut = join_all(deps_rx.iter_mut().map(|rx| rx.recv()));

                tokio::select! {
                    // Prefer cancellation over emitting one more node when
                    // both are ready.
                    biased;
                    _ = cancel_rx.changed() => {
                        // Either cancel() was called or the sender dropped;
                        // both mean stop.
                    }
                    results = deps_fut => {
                        for res in results {
                            match res {
                                Ok(()) => (),
                                // A dependency channel closed without a
                                // finish signal. Can happen when a cancel
                                // races with dependency completion; treat it
                                // as a cancel.
                                Err(broadcast::error::RecvError::Closed) => return,
                                Err(broadcast::error::RecvError::Lagged(x)) => {
                                    // The message is the unit type so
                                    // proceeding is safe, but a node
                                    // finishing twice is unexpected.
                                    debug_assert!(false, "node finished {x} extra times");
                                    trace!("node finished {x} extra times");
                                }
                            }
                        }

                        let (callback_tx, callback_rx) = oneshot::channel::<()>();
                        if node_tx.send((node, callback_tx)).await.is_err() {
                            // Receiver dropped without cancelling; nothing
                            // can mark this node done, behave as cancelled.
                            trace!("walk receiver dropped before walk finished");
                            return;
                        }
                        if callback_rx.await.is_err() {
                            // Caller dropped the done callback; assume the
                            // node finished.
                            trace!("done callback dropped without signal");
                        }
                        // A send error just means no node depends on this one.
                        tx.send(()).ok();
                    }
                }
            }));
        }

        debug_assert!(txs.is_empty(), "all senders moved into node tasks");

        Self {
            marker: std::marker::PhantomData,
            cancel,
            node_events: Some(node_rx),
            join_handles,
        }
    }

    /// Starts the walk. The returned receiver emits nodes as they become
    /// ready; the caller must fire each node's oneshot to mark it done.
    pub fn walk(self) -> (Walker<N, Walking>, mpsc::Receiver<WalkMessage<N>>) {
        let Self {
            cancel,
            mut node_events,
            join_handles,
            ..
        } = self;
        let node_events = node_events.take().expect("walker can only walk once");
        (
            Walker {
                marker: std::marker::PhantomData,
                cancel,
                node_events: None,
                join_handles,
            },
            node_events,
        )
    }
}

impl<N> Walker<N, Walking> {
    /// Stops emitting new nodes. Nodes already queued are still delivered.
    pub fn cancel(&mut self) -> Result<(), watch::error::SendError<bool>> {
        self.cancel.send(true)
    }

    /// Waits for all node tasks to wind down. Used after a cancel to ensure
    /// nothing is left running.
    pub async fn wait(self) -> Result<(), tokio::task::JoinError> {
        let Self {
            mut join_handles, ..
        } = self;
        while let Some(result) = join_handles.next().await {
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use petgraph::Graph;

    use super::*;

    #[tokio::test]
    async fn test_dependencies_emitted_first() {
        // a -> b -> c
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let walker = Walker::new(&g);
        let mut visited = Vec::new();
        let (walker, mut node_emitter) = walker.walk();
        while let Some((index, done)) = node_emitter.recv().await {
            visited.push(index);
            done.send(()).unwrap();
        }
        walker.wait().await.unwrap();
        assert_eq!(visited, vec![c, b, a]);
    }

    #[tokio::test]
    async fn test_cancel_stops_scheduling() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let walker = Walker::new(&g);
        let mut visited = Vec::new();
        let (mut walker, mut node_emitter) = walker.walk();
        while let Some((index, done)) = node_emitter.recv().await {
            walker.cancel().unwrap();
            visited.push(index);
            done.send(()).unwrap();
        }
        assert_eq!(visited, vec![c]);
        walker.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_siblings_do_not_block_each_other() {
        // a depends on b and d; b depends on c; d depends on e.
        // e is held back until b completes: d must still only start after e.
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        let e = g.add_node("e");
        g.add_edge(a, b, ());
        g.add_edge(a, d, ());
        g.add_edge(b, c, ());
        g.add_edge(d, e, ());

        let walker = Walker::new(&g);
        let visited = Arc::new(Mutex::new(Vec::new()));
        let (walker, mut node_emitter) = walker.walk();
        let (b_done, is_b_done) = oneshot::channel::<()>();
        let mut b_done = Some(b_done);
        let mut is_b_done = Some(is_b_done);
        while let Some((index, done)) = node_emitter.recv().await {
            if index == e {
                let is_b_done = is_b_done.take().unwrap();
                let visited = visited.clone();
                tokio::spawn(async move {
                    is_b_done.await.unwrap();
                    visited.lock().unwrap().push(index);
                    done.send(()).unwrap();
                });
            } else if index == b {
                visited.lock().unwrap().push(index);
                done.send(()).unwrap();
                b_done.take().unwrap().send(()).unwrap();
            } else {
                visited.lock().unwrap().push(index);
                done.send(()).unwrap();
            }
        }
        walker.wait().await.unwrap();
        assert_eq!(visited.lock().unwrap().as_slice(), &[c, b, e, d, a]);
    }
}
