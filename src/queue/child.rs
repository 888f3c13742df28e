//! Child queue workers.
//!
//! A child queue owns no connection. It drains the Lead queue's work channel
//! and executes each request by borrowing the Lead's connection under the
//! connection mutex - one in-flight native operation per connection, always.
//! Children retire themselves after sitting idle and are re-spawned by the
//! Lead when load returns.

use crate::engine::{ConnectionHandle, Engine};
use crate::models::{QueryRequest, QueryResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// One queued unit of work plus its reply slot.
pub(crate) struct WorkItem {
    pub request: QueryRequest,
    pub reply: oneshot::Sender<QueryResult>,
}

/// A spawned child worker.
pub struct ChildQueue {
    name: String,
    task: JoinHandle<()>,
}

impl ChildQueue {
    /// Spawn a worker draining `work` and executing against the shared
    /// connection.
    pub(crate) fn spawn(
        name: String,
        engine: Arc<dyn Engine>,
        connection: Arc<Mutex<Option<ConnectionHandle>>>,
        work: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
        idle_timeout: Duration,
    ) -> Self {
        let worker_name = name.clone();
        let task = tokio::spawn(async move {
            debug!(child = %worker_name, "Child queue started");
            loop {
                // Hold the receiver lock only while waiting for the next
                // item; execution happens outside it so siblings can pick
                // up work as soon as it arrives.
                let item = {
                    let mut rx = work.lock().await;
                    match tokio::time::timeout(idle_timeout, rx.recv()).await {
                        Ok(Some(item)) => item,
                        // Channel closed: the Lead is shutting down
                        Ok(None) => break,
                        // Idle: retire; the Lead re-spawns on demand
                        Err(_) => break,
                    }
                };
                trace!(
                    child = %worker_name,
                    query_id = %item.request.query_id,
                    "Executing request"
                );
                let result = {
                    let mut guard = connection.lock().await;
                    match guard.as_mut() {
                        Some(handle) if handle.is_connected() => {
                            execute_item(engine.as_ref(), handle, &item.request).await
                        }
                        _ => QueryResult::failure("database is not connected", 0),
                    }
                };
                // Caller may have given up (timeout); that is not our problem
                let _ = item.reply.send(result);
            }
            debug!(child = %worker_name, "Child queue retired");
        });
        Self { name, task }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker has exited (idle retirement or shutdown).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Abort the worker outright. Used only on queue shutdown.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Run one request, honoring its prepared flag and isolation level. A
/// request carrying an isolation level runs inside its own transaction:
/// commit on success, rollback on failure.
async fn execute_item(
    engine: &dyn Engine,
    handle: &mut ConnectionHandle,
    request: &QueryRequest,
) -> QueryResult {
    let Some(isolation) = request.isolation else {
        return run_request(engine, handle, request).await;
    };
    if handle.in_transaction() {
        return QueryResult::failure("a transaction is already active on this connection", 0);
    }
    if let Err(e) = engine.begin_transaction(handle, isolation).await {
        return QueryResult::failure(e.to_string(), 0);
    }
    let result = run_request(engine, handle, request).await;
    if result.success {
        if let Err(e) = engine.commit_transaction(handle).await {
            return QueryResult::failure(e.to_string(), result.execution_time_ms);
        }
    } else if let Err(e) = engine.rollback_transaction(handle).await {
        debug!(error = %e, "Rollback after failed request also failed");
    }
    result
}

async fn run_request(
    engine: &dyn Engine,
    handle: &mut ConnectionHandle,
    request: &QueryRequest,
) -> QueryResult {
    if request.use_prepared {
        engine.execute_prepared(handle, request).await
    } else {
        engine.execute_query(handle, request).await
    }
}

impl std::fmt::Debug for ChildQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildQueue")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}
