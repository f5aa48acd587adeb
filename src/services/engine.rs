use crate::core::state::{JobMode, RenderProgress, RosterEntry, TrainingJob};
use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// One text detection from the OCR side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub text: String,
    pub confidence: f32,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub is_stable: bool,
}

/// Best script line for a detected text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptMatch {
    pub dialogue_id: String,
    pub script_index: usize,
    pub similarity: f32,
}

/// Events on the training-job progress stream. `QueueEmpty` is the terminal
/// signal the pipeline chains on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Queued(TrainingJob),
    Progress(TrainingJob),
    Done { job_id: String },
    Failed { job_id: String, message: String },
    QueueEmpty,
}

#[async_trait]
pub trait DetectionSource: Send + Sync {
    /// Single-shot capture of whatever is currently on screen.
    async fn capture(&self) -> Result<Option<Detection>>;
    /// Push stream of detections for a monitoring session.
    async fn subscribe(&self) -> Result<BoxStream<'static, Detection>>;
}

#[async_trait]
pub trait ScriptMatcher: Send + Sync {
    async fn find_match(&self, episode_id: &str, text: &str) -> Result<Option<ScriptMatch>>;
}

#[async_trait]
pub trait VoiceEngine: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>>;
    /// Fresh per-character catalog; eligibility flags reflect completed
    /// stages, so callers re-fetch at stage boundaries.
    async fn character_catalog(&self) -> Result<Vec<RosterEntry>>;
    /// Submits one batch; the backend queues one job per character and
    /// runs at most one at a time.
    async fn submit_batch(&self, char_ids: &[String], mode: JobMode) -> Result<String>;
    async fn subscribe_jobs(&self) -> Result<BoxStream<'static, JobEvent>>;
    async fn cancel_job(&self, job_id: &str) -> Result<()>;
}

#[async_trait]
pub trait RenderService: Send + Sync {
    async fn start(&self, episode_ids: &[String]) -> Result<()>;
    async fn cancel(&self) -> Result<()>;
    async fn status(&self, episode_id: &str) -> Result<RenderProgress>;
    async fn delete(&self, episode_id: &str) -> Result<()>;
    async fn subscribe(&self) -> Result<BoxStream<'static, RenderProgress>>;
    /// Pre-rendered artifact for one script line.
    async fn fetch_artifact(&self, episode_id: &str, script_index: usize) -> Result<Vec<u8>>;
}

/// Single audio output. Starting a playback releases whatever played
/// before it.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, audio: Vec<u8>, volume: f32) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// Handle for a spawned stream-consumer task. Cancelling (or dropping)
/// aborts the task, which closes its stream and timers with it.
pub struct Subscription {
    handle: tokio::task::JoinHandle<()>,
}

impl Subscription {
    pub fn new(handle: tokio::task::JoinHandle<()>) -> Self {
        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
