//! Worker lifecycle manager: at most one worker process per client, with
//! output captured into the log store and fanned out to observers.

pub mod hub;
pub mod model;
pub mod process;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use hub::{BroadcastHub, Observer};
pub use model::{ClientId, LastLog, LogEntry, StatusRecord, WsMessage};
pub use process::{WorkerCommand, exit_message};

use crate::error::{DatabaseError, ManagerError};
use crate::store::{ClientRecord, Database};

/// How long output still in flight may delay the exit line once the worker
/// process itself is gone.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// A live worker process owned by the manager.
struct WorkerHandle {
    /// Distinguishes this process from later workers for the same client.
    instance: Uuid,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    /// Consumed by `stop` to ask the supervisor to terminate the process.
    terminate: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct ManagerState {
    workers: HashMap<ClientId, WorkerHandle>,
    last_logs: HashMap<ClientId, LastLog>,
}

impl ManagerState {
    fn status(&self, client_id: ClientId) -> StatusRecord {
        StatusRecord {
            running: self.workers.contains_key(&client_id),
            last_log: self.last_logs.get(&client_id).cloned(),
        }
    }
}

struct Inner {
    store: Arc<dyn Database>,
    hub: Arc<BroadcastHub>,
    command: WorkerCommand,
    state: Mutex<ManagerState>,
}

/// Supervises worker processes. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WorkerManager {
    inner: Arc<Inner>,
}

impl WorkerManager {
    pub fn new(store: Arc<dyn Database>, hub: Arc<BroadcastHub>, command: WorkerCommand) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                hub,
                command,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.inner.hub
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.inner.store
    }

    /// Whether a worker handle currently exists for the client.
    pub async fn is_running(&self, client_id: ClientId) -> bool {
        self.inner.state.lock().await.workers.contains_key(&client_id)
    }

    pub async fn status(&self, client_id: ClientId) -> StatusRecord {
        self.inner.state.lock().await.status(client_id)
    }

    /// Status of every stored client plus any client seen in this lifetime.
    pub async fn all_statuses(&self) -> Result<BTreeMap<ClientId, StatusRecord>, DatabaseError> {
        let ids = self.inner.store.list_client_ids().await?;
        let state = self.inner.state.lock().await;
        Ok(snapshot(&state, ids))
    }

    /// Register an observer. Its first message is the snapshot, taken under
    /// the state lock so no event can slip in between.
    pub async fn connect_observer(&self) -> Result<Observer, DatabaseError> {
        let ids = self.inner.store.list_client_ids().await?;
        let state = self.inner.state.lock().await;
        let observer = self.inner.hub.connect(snapshot(&state, ids)).await;
        drop(state);
        Ok(observer)
    }

    pub async fn disconnect_observer(&self, observer_id: Uuid) -> bool {
        self.inner.hub.disconnect(observer_id).await
    }

    /// Look up a client in the record store and start its worker.
    pub async fn start_client(&self, client_id: ClientId) -> Result<(), ManagerError> {
        let client = self
            .inner
            .store
            .get_client(client_id)
            .await?
            .ok_or(ManagerError::ClientNotFound(client_id))?;
        self.start(&client).await
    }

    /// Spawn a worker for the client. Returns once the process exists; does
    /// not wait for it to make progress.
    pub async fn start(&self, client: &ClientRecord) -> Result<(), ManagerError> {
        let client_id = client.id;
        let mut state = self.inner.state.lock().await;

        if state.workers.contains_key(&client_id) {
            return Err(ManagerError::AlreadyRunning(client_id));
        }

        let mut child = match self.inner.command.build(client).spawn() {
            Ok(child) => child,
            Err(e) => {
                drop(state);
                error!(client_id = %client_id, error = %e, "Failed to spawn worker");
                self.record_log(client_id, format!("Process error: {e}"))
                    .await;
                return Err(ManagerError::SpawnFailure {
                    client_id,
                    reason: e.to_string(),
                });
            }
        };

        // Take the pipes before anything else runs; nothing written is lost.
        let output = process::capture_output(&mut child);
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let instance = Uuid::new_v4();
        let pid = child.id();

        state.workers.insert(
            client_id,
            WorkerHandle {
                instance,
                pid,
                started_at: Utc::now(),
                terminate: Some(terminate_tx),
            },
        );
        info!(client_id = %client_id, pid = ?pid, "Worker started");

        // Still under the lock: a racing `stop` cannot log ahead of this.
        let entry = self.persist(LogEntry::new(client_id, "Bot started")).await;
        self.publish(&mut state, &entry).await;
        drop(state);

        tokio::spawn(supervise(
            self.clone(),
            client_id,
            instance,
            child,
            output,
            terminate_rx,
        ));

        Ok(())
    }

    /// Request graceful termination and forget the handle immediately.
    pub async fn stop(&self, client_id: ClientId) -> Result<(), ManagerError> {
        let handle = {
            let mut state = self.inner.state.lock().await;
            state
                .workers
                .remove(&client_id)
                .ok_or(ManagerError::NotRunning(client_id))?
        };

        let WorkerHandle {
            pid,
            started_at,
            terminate,
            ..
        } = handle;

        if let Some(tx) = terminate {
            if tx.send(()).is_err() {
                debug!(client_id = %client_id, "Worker supervisor already finished");
            }
        }

        let uptime = Utc::now() - started_at;
        info!(
            client_id = %client_id,
            pid = ?pid,
            uptime_secs = uptime.num_seconds(),
            "Worker stopped"
        );
        self.record_log(client_id, "Bot stopped by user").await;
        Ok(())
    }

    /// Stop every running worker, logging individual failures.
    pub async fn stop_all(&self) {
        let ids: Vec<ClientId> = {
            let state = self.inner.state.lock().await;
            state.workers.keys().copied().collect()
        };

        if !ids.is_empty() {
            info!(count = ids.len(), "Stopping all workers");
        }

        for client_id in ids {
            if let Err(e) = self.stop(client_id).await {
                warn!(client_id = %client_id, error = %e, "Error stopping worker");
            }
        }
    }

    /// Drop the remembered last log of a client with no live worker, so a
    /// deleted client leaves later snapshots.
    pub async fn forget(&self, client_id: ClientId) {
        let mut state = self.inner.state.lock().await;
        if !state.workers.contains_key(&client_id) {
            state.last_logs.remove(&client_id);
        }
    }

    /// Ids of clients with a live worker handle.
    pub async fn running_clients(&self) -> Vec<ClientId> {
        let state = self.inner.state.lock().await;
        let mut ids: Vec<ClientId> = state.workers.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Logs for a client, newest first.
    pub async fn recent_logs(
        &self,
        client_id: ClientId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LogEntry>, DatabaseError> {
        self.inner.store.recent_logs(client_id, limit, offset).await
    }

    /// Persist a log line, update the last-log field, then broadcast the log
    /// event followed by the status event it produced.
    pub async fn record_log(&self, client_id: ClientId, message: impl Into<String>) -> LogEntry {
        let entry = self.persist(LogEntry::new(client_id, message)).await;

        let mut state = self.inner.state.lock().await;
        self.publish(&mut state, &entry).await;
        drop(state);

        entry
    }

    async fn persist(&self, mut entry: LogEntry) -> LogEntry {
        match self.inner.store.append_log(&entry).await {
            Ok(id) => entry.id = Some(id),
            Err(e) => {
                error!(client_id = %entry.client_id, error = %e, "Failed to persist log entry");
            }
        }
        entry
    }

    /// Update the last-log field and broadcast. Callers hold the state lock.
    async fn publish(&self, state: &mut ManagerState, entry: &LogEntry) {
        let client_id = entry.client_id;

        // Entries are stamped before the lock is taken, so an older one can
        // arrive second; it must not replace a newer last log.
        let newer = state
            .last_logs
            .get(&client_id)
            .is_none_or(|last| last.timestamp <= entry.timestamp);
        if newer {
            state.last_logs.insert(client_id, entry.last_log());
        }
        let status = state.status(client_id);

        self.inner
            .hub
            .broadcast(&WsMessage::Log {
                client_id,
                data: entry.clone(),
            })
            .await;
        self.inner
            .hub
            .broadcast(&WsMessage::Status {
                client_id,
                data: status,
            })
            .await;
    }

    /// Drop the handle if it still belongs to `instance`, then announce the
    /// resulting status.
    async fn reap(&self, client_id: ClientId, instance: Uuid) {
        let mut state = self.inner.state.lock().await;

        let owned = state
            .workers
            .get(&client_id)
            .is_some_and(|h| h.instance == instance);
        if owned {
            state.workers.remove(&client_id);
        }

        let status = state.status(client_id);
        self.inner
            .hub
            .broadcast(&WsMessage::Status {
                client_id,
                data: status,
            })
            .await;
    }
}

fn snapshot(state: &ManagerState, ids: Vec<ClientId>) -> BTreeMap<ClientId, StatusRecord> {
    ids.into_iter()
        .chain(state.last_logs.keys().copied())
        .chain(state.workers.keys().copied())
        .map(|id| (id, state.status(id)))
        .collect()
}

/// Forward a worker's output into the log pipeline until it exits.
///
/// One task per worker, so lines for a client are recorded in the order
/// they were read, and the exit line always comes last. Exit is detected
/// from the process itself; a descendant that inherited the pipes only gets
/// [`OUTPUT_DRAIN_GRACE`] to flush before the exit is recorded.
async fn supervise(
    manager: WorkerManager,
    client_id: ClientId,
    instance: Uuid,
    mut child: Child,
    mut output: mpsc::UnboundedReceiver<process::WorkerOutput>,
    mut terminate_rx: oneshot::Receiver<()>,
) {
    let mut terminate_seen = false;
    let mut output_open = true;

    let exited = loop {
        let requested = tokio::select! {
            status = child.wait() => break status,
            event = output.recv(), if output_open => {
                match event {
                    Some(event) => {
                        manager.record_log(client_id, event.log_message()).await;
                    }
                    None => output_open = false,
                }
                continue;
            }
            requested = &mut terminate_rx, if !terminate_seen => requested,
        };
        terminate_seen = true;
        if requested.is_ok() {
            terminate(&manager, client_id, &mut child).await;
        }
    };

    if output_open {
        let deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_GRACE;
        loop {
            match tokio::time::timeout_at(deadline, output.recv()).await {
                Ok(Some(event)) => {
                    manager.record_log(client_id, event.log_message()).await;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(client_id = %client_id, "Worker output still open after exit");
                    break;
                }
            }
        }
    }

    match exited {
        Ok(status) => {
            info!(client_id = %client_id, status = %status, "Worker exited");
            manager.record_log(client_id, exit_message(&status)).await;
            manager.reap(client_id, instance).await;
        }
        Err(e) => {
            // The handle stays; only an exit or an explicit stop removes it.
            error!(client_id = %client_id, error = %e, "Failed to wait on worker");
            manager
                .record_log(client_id, format!("Process error: {e}"))
                .await;
        }
    }
}

async fn terminate(manager: &WorkerManager, client_id: ClientId, child: &mut Child) {
    if let Err(e) = process::request_termination(child) {
        warn!(client_id = %client_id, error = %e, "Failed to signal worker");
        manager
            .record_log(client_id, format!("Process error: {e}"))
            .await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use chrono::NaiveDate;
    use secrecy::SecretString;
    use tokio::time::timeout;

    use super::*;
    use crate::store::LibSqlBackend;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn manager_with_script(script: &str) -> WorkerManager {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let command = WorkerCommand::new("sh").with_args(["-c", script, "slot-worker"]);
        WorkerManager::new(store, Arc::new(BroadcastHub::new()), command)
    }

    fn client(id: i64) -> ClientRecord {
        ClientRecord {
            id: ClientId(id),
            name: format!("Client {id}"),
            email: "client@example.com".into(),
            password: SecretString::from("secret"),
            country_code: "en-ca".into(),
            schedule_id: "123".into(),
            facility_id: "94".into(),
            current_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            target_date: None,
            min_date: None,
            refresh_delay: 3,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Receive until a message matches, failing the test on timeout.
    async fn wait_for(observer: &mut Observer, pred: impl Fn(&WsMessage) -> bool) -> WsMessage {
        timeout(TEST_TIMEOUT, async {
            loop {
                let msg = observer.recv().await.expect("observer dropped");
                if pred(&msg) {
                    return msg;
                }
            }
        })
        .await
        .expect("timed out waiting for message")
    }

    fn is_log(msg: &WsMessage, text: &str) -> bool {
        matches!(msg, WsMessage::Log { data, .. } if data.message.contains(text))
    }

    fn is_stopped(msg: &WsMessage) -> bool {
        matches!(msg, WsMessage::Status { data, .. } if !data.running)
    }

    #[tokio::test]
    async fn start_then_stop_flips_running_immediately() {
        let manager = manager_with_script("echo 'Checking availability...'; exec sleep 30").await;
        let mut observer = manager.connect_observer().await.unwrap();
        let id = ClientId(42);

        manager.start(&client(42)).await.unwrap();
        assert!(manager.is_running(id).await);

        wait_for(&mut observer, |m| is_log(m, "Checking availability...")).await;
        let status = manager.status(id).await;
        assert!(status.running);
        assert_eq!(
            status.last_log.unwrap().message,
            "Checking availability..."
        );

        manager.stop(id).await.unwrap();
        assert!(!manager.is_running(id).await);
        assert_eq!(
            manager.status(id).await.last_log.unwrap().message,
            "Bot stopped by user"
        );
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let manager = manager_with_script("exec sleep 30").await;

        manager.start(&client(7)).await.unwrap();
        let err = manager.start(&client(7)).await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyRunning(ClientId(7))));
        assert_eq!(manager.running_clients().await, vec![ClientId(7)]);

        manager.stop_all().await;
        assert!(manager.running_clients().await.is_empty());
    }

    #[tokio::test]
    async fn stop_without_worker_fails() {
        let manager = manager_with_script("exit 0").await;
        let err = manager.stop(ClientId(3)).await.unwrap_err();
        assert!(matches!(err, ManagerError::NotRunning(ClientId(3))));
        assert!(manager.status(ClientId(3)).await.last_log.is_none());
    }

    #[tokio::test]
    async fn nonzero_exit_is_logged_and_reaped() {
        let manager = manager_with_script("exit 1").await;
        let mut observer = manager.connect_observer().await.unwrap();

        manager.start(&client(5)).await.unwrap();
        wait_for(&mut observer, is_stopped).await;

        let status = manager.status(ClientId(5)).await;
        assert!(!status.running);
        assert!(status.last_log.unwrap().message.contains("exited with code 1"));
    }

    #[tokio::test]
    async fn exit_is_reported_while_descendant_holds_output() {
        // The backgrounded sleep inherits stdout and stderr and outlives the shell.
        let manager = manager_with_script("sleep 3 & exit 1").await;
        let mut observer = manager.connect_observer().await.unwrap();

        manager.start(&client(5)).await.unwrap();
        timeout(Duration::from_secs(2), async {
            loop {
                if is_stopped(&observer.recv().await.expect("observer dropped")) {
                    break;
                }
            }
        })
        .await
        .expect("exit not reported while output was still open");

        let status = manager.status(ClientId(5)).await;
        assert!(!status.running);
        assert_eq!(status.last_log.unwrap().message, "Bot exited with code 1");
    }

    #[tokio::test]
    async fn stop_racing_start_is_logged_after_it() {
        let manager = manager_with_script("exec sleep 30").await;
        let mut observer = manager.connect_observer().await.unwrap();
        let id = ClientId(13);
        let record = client(13);

        let (started, stopped) = tokio::join!(manager.start(&record), async {
            tokio::task::yield_now().await;
            manager.stop(id).await
        });
        started.unwrap();
        if stopped.is_err() {
            manager.stop(id).await.unwrap();
        }

        let first = wait_for(&mut observer, |m| matches!(m, WsMessage::Log { .. })).await;
        assert!(is_log(&first, "Bot started"));
        wait_for(&mut observer, |m| is_log(m, "Bot stopped by user")).await;
        wait_for(&mut observer, |m| is_log(m, "Bot terminated by signal 15")).await;
        wait_for(&mut observer, is_stopped).await;

        let logs = manager.recent_logs(id, 10, 0).await.unwrap();
        let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages.last(), Some(&"Bot started"));
        assert_eq!(
            manager.status(id).await.last_log.unwrap().message,
            messages[0]
        );
    }

    #[tokio::test]
    async fn older_entry_does_not_replace_newer_last_log() {
        let manager = manager_with_script("exit 0").await;
        let id = ClientId(8);
        let older = LogEntry::new(id, "Bot stopped by user");
        let newer = LogEntry::new(id, "Bot terminated by signal 15");

        let mut state = manager.inner.state.lock().await;
        manager.publish(&mut state, &newer).await;
        manager.publish(&mut state, &older).await;
        drop(state);

        let last = manager.status(id).await.last_log.unwrap();
        assert_eq!(last.message, "Bot terminated by signal 15");
    }

    #[tokio::test]
    async fn output_then_exit_is_observed_in_order() {
        let manager = manager_with_script("echo 'Checking availability...'; exit 0").await;
        let mut observer = manager.connect_observer().await.unwrap();
        assert!(matches!(
            observer.recv().await,
            Some(WsMessage::InitialStatus { .. })
        ));

        manager.start(&client(9)).await.unwrap();

        wait_for(&mut observer, |m| is_log(m, "Checking availability...")).await;
        match observer.recv().await {
            Some(WsMessage::Status { data, .. }) => {
                assert_eq!(data.last_log.unwrap().message, "Checking availability...");
            }
            other => panic!("Expected Status, got {other:?}"),
        }
        wait_for(&mut observer, |m| is_log(m, "Bot completed successfully")).await;
        wait_for(&mut observer, is_stopped).await;

        let logs = manager.recent_logs(ClientId(9), 10, 0).await.unwrap();
        let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "Bot completed successfully",
                "Checking availability...",
                "Bot started"
            ]
        );
    }

    #[tokio::test]
    async fn stderr_lines_are_marked_as_errors() {
        let manager = manager_with_script("echo 'session expired' 1>&2; exit 2").await;
        let mut observer = manager.connect_observer().await.unwrap();

        manager.start(&client(11)).await.unwrap();
        wait_for(&mut observer, |m| is_log(m, "ERROR: session expired")).await;
        wait_for(&mut observer, is_stopped).await;
    }

    #[tokio::test]
    async fn spawn_failure_registers_no_handle() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let command = WorkerCommand::new("/nonexistent/slot-worker");
        let manager = WorkerManager::new(store, Arc::new(BroadcastHub::new()), command);

        let err = manager.start(&client(1)).await.unwrap_err();
        assert!(matches!(err, ManagerError::SpawnFailure { .. }));
        assert!(!manager.is_running(ClientId(1)).await);

        let status = manager.status(ClientId(1)).await;
        assert!(status.last_log.unwrap().message.starts_with("Process error:"));
    }

    #[tokio::test]
    async fn late_exit_does_not_unregister_restarted_worker() {
        let script = "trap 'echo terminating; exit 3' TERM; echo ready; \
                      while true; do sleep 0.1; done";
        let manager = manager_with_script(script).await;
        let mut observer = manager.connect_observer().await.unwrap();
        let id = ClientId(21);

        manager.start(&client(21)).await.unwrap();
        wait_for(&mut observer, |m| is_log(m, "ready")).await;

        manager.stop(id).await.unwrap();
        manager.start(&client(21)).await.unwrap();

        wait_for(&mut observer, |m| is_log(m, "Bot exited with code 3")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.is_running(id).await);

        manager.stop_all().await;
        assert!(!manager.is_running(id).await);
    }

    #[tokio::test]
    async fn snapshot_includes_stored_and_seen_clients() {
        let manager = manager_with_script("exec sleep 30").await;
        let stored = manager
            .store()
            .insert_client(&crate::store::NewClient {
                name: "Stored".into(),
                email: "s@example.com".into(),
                password: SecretString::from("pw"),
                country_code: "en-ca".into(),
                schedule_id: "1".into(),
                facility_id: "2".into(),
                current_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                target_date: None,
                min_date: None,
                refresh_delay: 3,
            })
            .await
            .unwrap();

        manager.start(&client(77)).await.unwrap();

        let statuses = manager.all_statuses().await.unwrap();
        assert!(!statuses[&stored.id].running);
        assert!(statuses[&stored.id].last_log.is_none());
        assert!(statuses[&ClientId(77)].running);

        let mut observer = manager.connect_observer().await.unwrap();
        match observer.recv().await {
            Some(WsMessage::InitialStatus { data }) => assert_eq!(data, statuses),
            other => panic!("Expected InitialStatus, got {other:?}"),
        }

        manager.stop_all().await;
    }
}
