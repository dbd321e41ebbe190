//! Task-level bookkeeping around pipeline runs.
//!
//! [`Scheduler`] is the invocation boundary: it marks a task `processing`,
//! runs the [`Pipeline`], then records `completed` with the totals or
//! `failed` with the error message. A system-wide admission gate bounds how
//! many documents run at once, independently of each run's page gate.

use crate::broadcast::ProgressHub;
use crate::convert::Pipeline;
use crate::error::Pdf2MdError;
use crate::output::{ConversionOutput, TokenUsage};
use crate::progress::{ProgressCallback, ProgressEvent};
use crate::regenerate::{self, RegenerationOutcome};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Metadata for one document task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub document: PathBuf,
    pub status: TaskStatus,
    pub total_pages: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub result_path: Option<PathBuf>,
    pub error_message: Option<String>,
}

impl TaskRecord {
    pub fn usage(&self) -> TokenUsage {
        TokenUsage::new(self.input_tokens, self.output_tokens)
    }
}

/// In-memory task metadata store.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<String, TaskRecord>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending task for `document` and return its id.
    pub fn create(&self, document: impl Into<PathBuf>) -> String {
        let id = format!("task_{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let record = TaskRecord {
            id: id.clone(),
            document: document.into(),
            status: TaskStatus::Pending,
            total_pages: 0,
            input_tokens: 0,
            output_tokens: 0,
            result_path: None,
            error_message: None,
        };
        self.lock().insert(id.clone(), record);
        id
    }

    pub fn get(&self, id: &str) -> Option<TaskRecord> {
        self.lock().get(id).cloned()
    }

    /// All tasks, ordered by id.
    pub fn list(&self) -> Vec<TaskRecord> {
        let mut all: Vec<TaskRecord> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn update<F>(&self, id: &str, f: F) -> Result<(), Pdf2MdError>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut tasks = self.lock();
        let record = tasks
            .get_mut(id)
            .ok_or_else(|| Pdf2MdError::UnknownTask(id.to_string()))?;
        f(record);
        Ok(())
    }

    pub fn mark_processing(&self, id: &str) -> Result<(), Pdf2MdError> {
        self.update(id, |r| {
            r.status = TaskStatus::Processing;
            r.error_message = None;
        })
    }

    pub fn mark_completed(&self, id: &str, output: &ConversionOutput) -> Result<(), Pdf2MdError> {
        self.update(id, |r| {
            r.status = TaskStatus::Completed;
            r.total_pages = output.stats.total_pages;
            r.input_tokens = output.stats.total_input_tokens;
            r.output_tokens = output.stats.total_output_tokens;
            r.result_path = Some(output.merged_path.clone());
        })
    }

    pub fn mark_failed(&self, id: &str, message: impl Into<String>) -> Result<(), Pdf2MdError> {
        let message = message.into();
        self.update(id, |r| {
            r.status = TaskStatus::Failed;
            r.error_message = Some(message);
        })
    }

    /// Add a token delta to the task's totals.
    pub fn add_tokens(&self, id: &str, delta: TokenUsage) -> Result<(), Pdf2MdError> {
        self.update(id, |r| {
            r.input_tokens += delta.input_tokens;
            r.output_tokens += delta.output_tokens;
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TaskRecord>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs documents and regenerations against a shared registry and hub.
#[derive(Clone)]
pub struct Scheduler {
    registry: Arc<TaskRegistry>,
    pipeline: Arc<Pipeline>,
    hub: ProgressHub,
    gate: Arc<Semaphore>,
}

impl Scheduler {
    /// Scheduler running at most `pipeline.config().max_tasks` documents at once.
    pub fn new(pipeline: Arc<Pipeline>, hub: ProgressHub) -> Self {
        let max_tasks = pipeline.config().max_tasks.max(1);
        Self {
            registry: Arc::new(TaskRegistry::new()),
            pipeline,
            hub,
            gate: Arc::new(Semaphore::new(max_tasks)),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &ProgressHub {
        &self.hub
    }

    /// Run task `task_id` to completion, recording the outcome.
    pub async fn process_document(&self, task_id: &str) -> Result<ConversionOutput, Pdf2MdError> {
        let record = self
            .registry
            .get(task_id)
            .ok_or_else(|| Pdf2MdError::UnknownTask(task_id.to_string()))?;

        // The gate lives as long as the scheduler and is never closed.
        let _permit = self.gate.acquire().await.ok();
        self.registry.mark_processing(task_id)?;

        let progress: ProgressCallback = Arc::new(self.hub.clone());
        let concurrency = self.pipeline.config().concurrency;
        match self
            .pipeline
            .run(task_id, &record.document, concurrency, progress)
            .await
        {
            Ok(output) => {
                self.registry.mark_completed(task_id, &output)?;
                info!("Task {}: completed", task_id);
                Ok(output)
            }
            Err(e) => {
                error!("Task {}: failed: {}", task_id, e);
                self.registry.mark_failed(task_id, e.to_string())?;
                self.hub
                    .broadcast(task_id, ProgressEvent::failed(task_id, 0, 0));
                Err(e)
            }
        }
    }

    /// Register `document` and start processing it in the background.
    pub fn submit(
        &self,
        document: impl AsRef<Path>,
    ) -> (String, JoinHandle<Result<ConversionOutput, Pdf2MdError>>) {
        let task_id = self.registry.create(document.as_ref());
        let this = self.clone();
        let id = task_id.clone();
        let handle = tokio::spawn(async move { this.process_document(&id).await });
        (task_id, handle)
    }

    /// Regenerate one page of a task's document and add the tokens spent to
    /// the task's totals.
    pub async fn regenerate_page(
        &self,
        task_id: &str,
        page_num: usize,
        image_path: &Path,
    ) -> Result<RegenerationOutcome, Pdf2MdError> {
        let record = self
            .registry
            .get(task_id)
            .ok_or_else(|| Pdf2MdError::UnknownTask(task_id.to_string()))?;

        let client = self.pipeline.client();
        let outcome =
            regenerate::regenerate_page(client, &record.document, page_num, image_path).await?;
        self.registry.add_tokens(task_id, outcome.usage)?;
        Ok(outcome)
    }

    /// Fire-and-forget variant of [`Scheduler::regenerate_page`].
    pub fn spawn_regeneration(
        &self,
        task_id: impl Into<String>,
        page_num: usize,
        image_path: impl Into<PathBuf>,
    ) -> JoinHandle<Result<RegenerationOutcome, Pdf2MdError>> {
        let this = self.clone();
        let task_id = task_id.into();
        let image_path = image_path.into();
        tokio::spawn(async move {
            let result = this.regenerate_page(&task_id, page_num, &image_path).await;
            if let Err(ref e) = result {
                error!("Task {}: {}", task_id, e);
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::ConversionStats;

    #[test]
    fn lifecycle_updates_record() {
        let reg = TaskRegistry::new();
        let id = reg.create("/docs/a.pdf");
        assert_eq!(reg.get(&id).unwrap().status, TaskStatus::Pending);

        reg.mark_processing(&id).unwrap();
        assert_eq!(reg.get(&id).unwrap().status, TaskStatus::Processing);

        let output = ConversionOutput {
            markdown: String::new(),
            merged_path: PathBuf::from("/docs/a.md"),
            pages: vec![],
            stats: ConversionStats {
                total_pages: 3,
                total_input_tokens: 30,
                total_output_tokens: 15,
                ..Default::default()
            },
        };
        reg.mark_completed(&id, &output).unwrap();
        let r = reg.get(&id).unwrap();
        assert_eq!(r.status, TaskStatus::Completed);
        assert_eq!(r.total_pages, 3);
        assert_eq!(r.result_path, Some(PathBuf::from("/docs/a.md")));
    }

    #[test]
    fn token_updates_are_additive() {
        let reg = TaskRegistry::new();
        let id = reg.create("/docs/a.pdf");
        reg.add_tokens(&id, TokenUsage::new(30, 15)).unwrap();
        reg.add_tokens(&id, TokenUsage::new(10, 5)).unwrap();
        assert_eq!(reg.get(&id).unwrap().usage(), TokenUsage::new(40, 20));
    }

    #[test]
    fn unknown_task_is_an_error() {
        let reg = TaskRegistry::new();
        let err = reg.mark_failed("task_99", "x").unwrap_err();
        assert!(matches!(err, Pdf2MdError::UnknownTask(_)));
    }

    #[test]
    fn ids_are_unique() {
        let reg = TaskRegistry::new();
        let a = reg.create("a.pdf");
        let b = reg.create("b.pdf");
        assert_ne!(a, b);
        assert_eq!(reg.list().len(), 2);
    }
}
