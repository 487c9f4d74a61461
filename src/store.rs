//! Task store - the persistence boundary
//!
//! The supervisor only needs get/list/update; insert and delete exist for
//! the CLI and tests. [`JsonFileStore`] keeps every task in one JSON file
//! that is rewritten atomically on each change.

use crate::core::{Task, TaskId, TaskState, TaskUpdate};
use crate::error::StoreError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tempfile::NamedTempFile;

/// Required persistence operations
pub trait TaskStore: Send + Sync {
    fn get_task(&self, id: TaskId) -> Result<Task, StoreError>;

    /// Up to `limit` tasks, newest first
    fn list_tasks(&self, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// Apply `update`; `false` when the row is missing or the write failed
    fn update_task(&self, id: TaskId, update: &TaskUpdate) -> bool;

    /// Append a task at the back of the queue
    fn insert_task(&self, task: NewTask) -> Result<Task, StoreError>;

    fn delete_task(&self, id: TaskId) -> Result<bool, StoreError>;
}

/// Fields supplied when submitting work
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub task_type: u32,
    pub creator: String,
    pub params: serde_json::Value,
    pub eta_seconds: Option<u64>,
    pub worker: Option<String>,
}

/// Serialized form shared by both stores
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskTable {
    #[serde(default)]
    pub next_id: TaskId,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl TaskTable {
    fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        self.tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn list(&self, limit: usize) -> Vec<Task> {
        let mut tasks = self.tasks.clone();
        tasks.sort_by(|a, b| b.id.cmp(&a.id));
        tasks.truncate(limit);
        tasks
    }

    fn update(&mut self, id: TaskId, update: &TaskUpdate) -> bool {
        match self.tasks.iter_mut().find(|t| t.id == id) {
            Some(task) => {
                update.apply(task);
                true
            }
            None => false,
        }
    }

    /// Position just behind the deepest waiting task
    fn tail_position(&self) -> u32 {
        self.tasks
            .iter()
            .filter_map(|t| match t.state() {
                TaskState::Waiting { position } => Some(position),
                _ => None,
            })
            .max()
            .map_or(1, |deepest| deepest.saturating_add(1))
    }

    fn insert(&mut self, new: NewTask) -> Task {
        let id = self
            .next_id
            .max(self.tasks.iter().map(|t| t.id).max().unwrap_or(0))
            + 1;
        let now = Utc::now();
        let task = Task {
            id,
            task_type: new.task_type,
            status: TaskState::Waiting {
                position: self.tail_position(),
            }
            .encode(),
            process_id: None,
            created_at: now,
            updated_at: now,
            eta_seconds: new.eta_seconds,
            message: String::new(),
            creator: new.creator,
            params: new.params,
            worker: new.worker,
            output: String::new(),
        };
        self.next_id = id;
        self.tasks.push(task.clone());
        task
    }

    fn delete(&mut self, id: TaskId) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|t| t.id != id);
        self.tasks.len() != before
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: Mutex<TaskTable>,
    fail_writes: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a row wholesale, as an external writer would
    pub fn put(&self, task: Task) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.next_id = table.next_id.max(task.id);
        match table.tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task,
            None => table.tasks.push(task),
        }
    }

    /// Make every following update report failure
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap_or_else(PoisonError::into_inner) = fail;
    }
}

impl TaskStore for MemoryStore {
    fn get_task(&self, id: TaskId) -> Result<Task, StoreError> {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
    }

    fn list_tasks(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .list(limit))
    }

    fn update_task(&self, id: TaskId, update: &TaskUpdate) -> bool {
        if *self.fail_writes.lock().unwrap_or_else(PoisonError::into_inner) {
            return false;
        }
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update(id, update)
    }

    fn insert_task(&self, task: NewTask) -> Result<Task, StoreError> {
        Ok(self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task))
    }

    fn delete_task(&self, id: TaskId) -> Result<bool, StoreError> {
        Ok(self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .delete(id))
    }
}

/// Store backed by a single JSON file.
///
/// Every access holds an advisory `flock` on a sidecar `<store>.lock` file,
/// shared for reads and exclusive for read-modify-write cycles, so the
/// supervisor and CLI processes can use the same file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
    }

    /// Block until the store lock is held; released on drop
    fn lock(&self, arg: FlockArg) -> Result<Flock<File>, StoreError> {
        fs::create_dir_all(self.dir()).map_err(|e| self.io_error(e))?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| self.io_error(e))?;
        Flock::lock(file, arg).map_err(|(_, errno)| self.io_error(io::Error::from(errno)))
    }

    fn load(&self) -> Result<TaskTable, StoreError> {
        if !self.path.exists() {
            return Ok(TaskTable::default());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        if content.trim().is_empty() {
            return Ok(TaskTable::default());
        }
        serde_json::from_str(&content).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, table: &TaskTable) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(table).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })?;
        let mut tmp = NamedTempFile::new_in(self.dir()).map_err(|e| self.io_error(e))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| self.io_error(e))?;
        tmp.persist(&self.path)
            .map_err(|e| self.io_error(e.error))?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(TaskTable) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let _lock = self.lock(FlockArg::LockShared)?;
        f(self.load()?)
    }

    fn modify<T>(&self, f: impl FnOnce(&mut TaskTable) -> T) -> Result<T, StoreError> {
        let _lock = self.lock(FlockArg::LockExclusive)?;
        let mut table = self.load()?;
        let out = f(&mut table);
        self.save(&table)?;
        Ok(out)
    }
}

impl TaskStore for JsonFileStore {
    fn get_task(&self, id: TaskId) -> Result<Task, StoreError> {
        self.read(|table| table.get(id))
    }

    fn list_tasks(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        self.read(|table| Ok(table.list(limit)))
    }

    fn update_task(&self, id: TaskId, update: &TaskUpdate) -> bool {
        match self.modify(|table| table.update(id, update)) {
            Ok(updated) => updated,
            Err(e) => {
                log::warn!("Failed to update task {} in {}: {}", id, self.path.display(), e);
                false
            }
        }
    }

    fn insert_task(&self, task: NewTask) -> Result<Task, StoreError> {
        self.modify(|table| table.insert(task))
    }

    fn delete_task(&self, id: TaskId) -> Result<bool, StoreError> {
        self.modify(|table| table.delete(id))
    }
}
