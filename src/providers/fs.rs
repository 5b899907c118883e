use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    next_seq, stamp_events, InstanceState, Provider, ProviderError, TerminalOutcome, WorkflowInstance,
};
use crate::{Event, EventKind};

const HISTORY_FILE: &str = "history.jsonl";
const RECORD_FILE: &str = "instance.json";

/// Filesystem-backed provider.
///
/// Layout: `<root>/<instance>/history.jsonl` holds one line per append, each a
/// JSON array of the events written together, and
/// `<root>/<instance>/instance.json` holds the status record. A batch is
/// visible only once its whole line, newline included, is on disk; a trailing
/// line without its newline is a torn write and is discarded with every event
/// in it (and truncated away before the next append). Status
/// records are replaced through a temp file and rename. If a crash lands
/// between a terminal history append and the record update, the record is
/// repaired from history on the next read.
///
/// All operations take one store-wide lock.
pub struct FsProvider {
    root: PathBuf,
    guard: Mutex<()>,
}

struct HistoryFile {
    events: Vec<Event>,
    valid_len: u64,
    torn: bool,
}

fn io_error(operation: &str, path: &Path, e: std::io::Error) -> ProviderError {
    ProviderError::retryable(operation, format!("{}: {e}", path.display()))
}

impl FsProvider {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, ProviderError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| io_error("open", &root, e))?;
        Ok(Self {
            root,
            guard: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn instance_dir(&self, operation: &str, instance: &str) -> Result<PathBuf, ProviderError> {
        let unsafe_name = instance.is_empty()
            || instance.starts_with('.')
            || instance.contains(['/', '\\', '\0']);
        if unsafe_name {
            return Err(ProviderError::permanent(
                operation,
                format!("instance id {instance:?} is not a valid directory name"),
            ));
        }
        Ok(self.root.join(instance))
    }

    async fn read_history_file(operation: &str, path: &Path) -> Result<Option<HistoryFile>, ProviderError> {
        let data = match fs::read_to_string(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(operation, path, e)),
        };
        let mut events = Vec::new();
        let mut valid_len = 0u64;
        let mut torn = false;
        for (idx, line) in data.split_inclusive('\n').enumerate() {
            if !line.ends_with('\n') {
                warn!(path = %path.display(), line = idx, "discarding torn trailing history line");
                torn = true;
                break;
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                let batch = serde_json::from_str::<Vec<Event>>(trimmed).map_err(|e| {
                    ProviderError::permanent(
                        operation,
                        format!("corrupt history line {idx} in {}: {e}", path.display()),
                    )
                })?;
                events.extend(batch);
            }
            valid_len += line.len() as u64;
        }
        Ok(Some(HistoryFile {
            events,
            valid_len,
            torn,
        }))
    }

    /// Write `events` as a single line so the batch lands whole or not at all.
    async fn append_batch(operation: &str, path: &Path, events: &[Event]) -> Result<(), ProviderError> {
        let mut buf = serde_json::to_string(events)
            .map_err(|e| ProviderError::permanent(operation, format!("serialize events: {e}")))?;
        buf.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| io_error(operation, path, e))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| io_error(operation, path, e))?;
        file.sync_data().await.map_err(|e| io_error(operation, path, e))?;
        Ok(())
    }

    async fn truncate_to(operation: &str, path: &Path, len: u64) -> Result<(), ProviderError> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| io_error(operation, path, e))?;
        file.set_len(len).await.map_err(|e| io_error(operation, path, e))?;
        file.sync_all().await.map_err(|e| io_error(operation, path, e))
    }

    async fn write_record(operation: &str, dir: &Path, record: &WorkflowInstance) -> Result<(), ProviderError> {
        let path = dir.join(RECORD_FILE);
        let tmp = dir.join(format!("{RECORD_FILE}.tmp"));
        let data = serde_json::to_vec_pretty(record)
            .map_err(|e| ProviderError::permanent(operation, format!("serialize record: {e}")))?;
        let mut file = fs::File::create(&tmp).await.map_err(|e| io_error(operation, &tmp, e))?;
        file.write_all(&data).await.map_err(|e| io_error(operation, &tmp, e))?;
        file.sync_all().await.map_err(|e| io_error(operation, &tmp, e))?;
        fs::rename(&tmp, &path).await.map_err(|e| io_error(operation, &path, e))
    }

    async fn read_record(operation: &str, dir: &Path) -> Result<Option<WorkflowInstance>, ProviderError> {
        let path = dir.join(RECORD_FILE);
        match fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data).map(Some).map_err(|e| {
                ProviderError::permanent(operation, format!("corrupt record {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(operation, &path, e)),
        }
    }

    /// Load record and history, repairing whatever a crash left half-done.
    async fn load(
        &self,
        operation: &str,
        instance: &str,
    ) -> Result<Option<(WorkflowInstance, HistoryFile)>, ProviderError> {
        let dir = self.instance_dir(operation, instance)?;
        let history_path = dir.join(HISTORY_FILE);
        let Some(history) = Self::read_history_file(operation, &history_path).await? else {
            return Ok(None);
        };
        let mut record = match Self::read_record(operation, &dir).await? {
            Some(r) => r,
            None => match history.events.first().map(|e| &e.kind) {
                Some(EventKind::OrchestratorStarted { name, input }) => {
                    debug!(instance, "rebuilding missing instance record from history");
                    let mut r = WorkflowInstance::new_running(instance, name, input);
                    r.created_at_ms = history.events[0].timestamp_ms;
                    Self::write_record(operation, &dir, &r).await?;
                    r
                }
                _ => return Ok(None),
            },
        };
        if record.state == InstanceState::Running {
            if let Some(outcome) = history.events.last().and_then(|e| TerminalOutcome::from_event(&e.kind)) {
                warn!(instance, state = %outcome.state(), "repairing instance record from terminal history event");
                record.apply_terminal(&outcome);
                Self::write_record(operation, &dir, &record).await?;
            }
        }
        Ok(Some((record, history)))
    }

    async fn append_checked(
        &self,
        operation: &str,
        instance: &str,
        expected_next_seq: u64,
        events: Vec<EventKind>,
    ) -> Result<(PathBuf, WorkflowInstance, Vec<Event>), ProviderError> {
        let (record, history) = self
            .load(operation, instance)
            .await?
            .ok_or_else(|| ProviderError::unknown_instance(operation, instance))?;
        if record.state.is_terminal() {
            return Err(ProviderError::invalid_transition(operation, instance, record.state));
        }
        let actual = next_seq(&history.events);
        if actual != expected_next_seq {
            return Err(ProviderError::sequence_conflict(operation, instance, expected_next_seq, actual));
        }
        let dir = self.instance_dir(operation, instance)?;
        let history_path = dir.join(HISTORY_FILE);
        if history.torn {
            Self::truncate_to(operation, &history_path, history.valid_len).await?;
        }
        let stamped = stamp_events(actual, events);
        Self::append_batch(operation, &history_path, &stamped).await?;
        Ok((dir, record, stamped))
    }
}

#[async_trait::async_trait]
impl Provider for FsProvider {
    fn name(&self) -> &str {
        "fs"
    }

    async fn create_instance(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
    ) -> Result<WorkflowInstance, ProviderError> {
        let _g = self.guard.lock().await;
        let dir = self.instance_dir("create_instance", instance)?;
        match fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if self.load("create_instance", instance).await?.is_some() {
                    return Err(ProviderError::duplicate_instance("create_instance", instance));
                }
                // Leftover from a create that crashed before its first event.
                debug!(instance, "reclaiming empty instance directory");
                let _ = fs::remove_file(dir.join(HISTORY_FILE)).await;
            }
            Err(e) => return Err(io_error("create_instance", &dir, e)),
        }
        let record = WorkflowInstance::new_running(instance, orchestration, input);
        let started = Event::new(
            0,
            EventKind::OrchestratorStarted {
                name: orchestration.to_string(),
                input: input.to_string(),
            },
        );
        Self::append_batch("create_instance", &dir.join(HISTORY_FILE), &[started]).await?;
        Self::write_record("create_instance", &dir, &record).await?;
        Ok(record)
    }

    async fn append(
        &self,
        instance: &str,
        expected_next_seq: u64,
        events: Vec<EventKind>,
    ) -> Result<Vec<Event>, ProviderError> {
        let _g = self.guard.lock().await;
        let (_, _, stamped) = self.append_checked("append", instance, expected_next_seq, events).await?;
        Ok(stamped)
    }

    async fn commit_terminal(
        &self,
        instance: &str,
        expected_next_seq: u64,
        events: Vec<EventKind>,
        outcome: TerminalOutcome,
    ) -> Result<Vec<Event>, ProviderError> {
        let _g = self.guard.lock().await;
        let (dir, mut record, stamped) = self
            .append_checked("commit_terminal", instance, expected_next_seq, events)
            .await?;
        record.apply_terminal(&outcome);
        Self::write_record("commit_terminal", &dir, &record).await?;
        Ok(stamped)
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let _g = self.guard.lock().await;
        let (_, history) = self
            .load("read", instance)
            .await?
            .ok_or_else(|| ProviderError::unknown_instance("read", instance))?;
        Ok(history.events)
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<WorkflowInstance>, ProviderError> {
        let _g = self.guard.lock().await;
        Ok(self.load("get_instance", instance).await?.map(|(record, _)| record))
    }

    async fn request_cancellation(&self, instance: &str, reason: &str) -> Result<(), ProviderError> {
        let _g = self.guard.lock().await;
        let (mut record, _) = self
            .load("request_cancellation", instance)
            .await?
            .ok_or_else(|| ProviderError::unknown_instance("request_cancellation", instance))?;
        if record.state != InstanceState::Running {
            return Ok(());
        }
        record.cancel_requested = Some(reason.to_string());
        record.updated_at_ms = crate::now_ms();
        let dir = self.instance_dir("request_cancellation", instance)?;
        Self::write_record("request_cancellation", &dir, &record).await
    }

    async fn list_instances(&self, state: Option<InstanceState>) -> Result<Vec<String>, ProviderError> {
        let _g = self.guard.lock().await;
        let mut rd = fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error("list_instances", &self.root, e))?;
        let mut records = Vec::new();
        while let Some(ent) = rd
            .next_entry()
            .await
            .map_err(|e| io_error("list_instances", &self.root, e))?
        {
            let Some(name) = ent.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') || !ent.path().is_dir() {
                continue;
            }
            if let Some((record, _)) = self.load("list_instances", &name).await? {
                if state.map_or(true, |s| record.state == s) {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(records.into_iter().map(|r| r.instance_id).collect())
    }
}
