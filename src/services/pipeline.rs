use crate::core::prefs::{PrefStore, Preferences};
use crate::core::state::{JobMode, JobStatus, RosterEntry, Stage, StageSelection, TrainingJob, VoiceSelection};
use crate::services::engine::{JobEvent, RenderService, Subscription, VoiceEngine};
use anyhow::{bail, Result};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Point-in-time view of the training pipeline for display.
#[derive(Debug, Clone, Default)]
pub struct TrainingSnapshot {
    pub active: bool,
    pub current_job: Option<TrainingJob>,
    pub queue: Vec<TrainingJob>,
    pub pending_chain: Option<Stage>,
}

#[derive(Default)]
struct PipelineState {
    active: bool,
    current_job: Option<TrainingJob>,
    queue: VecDeque<TrainingJob>,
    pending_chain: Option<Stage>,
    selection: StageSelection,
    group: Vec<String>,
    episodes: Vec<String>,
    subscription: Option<Subscription>,
}

/// Runs a user-selected subset of {prepare, finetune, render} for a group
/// of characters and episodes, chaining stages as the backend's job queue
/// empties. The backend runs one job at a time; this mirrors its current
/// job and queue for display.
pub struct BatchPipeline {
    engine: Arc<dyn VoiceEngine>,
    renders: Arc<dyn RenderService>,
    prefs: Arc<PrefStore>,
    inner: Mutex<PipelineState>,
}

impl BatchPipeline {
    pub fn new(
        engine: Arc<dyn VoiceEngine>,
        renders: Arc<dyn RenderService>,
        prefs: Arc<PrefStore>,
    ) -> Self {
        Self {
            engine,
            renders,
            prefs,
            inner: Mutex::new(PipelineState::default()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().active
    }

    pub fn snapshot(&self) -> TrainingSnapshot {
        let state = self.inner.lock().unwrap();
        TrainingSnapshot {
            active: state.active,
            current_job: state.current_job.clone(),
            queue: state.queue.iter().cloned().collect(),
            pending_chain: state.pending_chain,
        }
    }

    /// Kicks off the selected stages for a character group and episode set.
    /// Returns once the first stage with work has been submitted (or, when
    /// no training stage has work, once the render has started).
    pub async fn start(
        self: Arc<Self>,
        selection: StageSelection,
        group: Vec<String>,
        episodes: Vec<String>,
    ) -> Result<()> {
        if selection.is_empty() {
            bail!("No pipeline stage selected");
        }
        {
            let mut state = self.inner.lock().unwrap();
            if state.active {
                bail!("A batch is already running");
            }
            // Reserve the slot before the first await; a concurrent start
            // must fail here, not after both have submitted.
            state.active = true;
            state.selection = selection;
            state.group = group;
            state.episodes = episodes;
            state.current_job = None;
            state.queue.clear();
            state.pending_chain = None;
        }

        let result = self.clone().run_stages(selection).await;
        if result.is_err() {
            self.inner.lock().unwrap().active = false;
        }
        result
    }

    async fn run_stages(self: Arc<Self>, selection: StageSelection) -> Result<()> {
        if selection.prepare {
            let catalog = self.engine.character_catalog().await?;
            let prefs = self.prefs.snapshot();
            let group = self.inner.lock().unwrap().group.clone();
            let targets = prepare_targets(&catalog, &group, &prefs);
            if !targets.is_empty() {
                info!("Submitting prepare batch for {} characters", targets.len());
                self.engine.submit_batch(&targets, JobMode::Prepare).await?;
                {
                    let mut state = self.inner.lock().unwrap();
                    state.pending_chain = if selection.finetune {
                        Some(Stage::Finetune)
                    } else if selection.render {
                        Some(Stage::Render)
                    } else {
                        None
                    };
                }
                self.ensure_subscribed().await?;
                return Ok(());
            }
            debug!("Prepare stage has no eligible characters, cascading");
        }

        self.launch(Stage::Finetune).await
    }

    /// Starts `stage`, cascading to the next one whenever the target set
    /// resolves empty. Targets are recomputed here because the stage that
    /// just finished changes eligibility. Boxed: the job-stream task
    /// re-enters `launch` when the chain advances, so the future type is
    /// recursive.
    fn launch(self: Arc<Self>, stage: Stage) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let (selection, group, episodes) = {
                let state = self.inner.lock().unwrap();
                (state.selection, state.group.clone(), state.episodes.clone())
            };
            let mut stage = stage;
            loop {
                match stage {
                    Stage::Prepare | Stage::Finetune => {
                        if stage == Stage::Finetune && selection.finetune {
                            let catalog = self.engine.character_catalog().await?;
                            let prefs = self.prefs.snapshot();
                            let targets = finetune_targets(&catalog, &group, &prefs);
                            if !targets.is_empty() {
                                info!(
                                    "Submitting finetune batch for {} characters",
                                    targets.len()
                                );
                                self.engine.submit_batch(&targets, JobMode::Finetune).await?;
                                {
                                    let mut state = self.inner.lock().unwrap();
                                    state.pending_chain =
                                        selection.render.then_some(Stage::Render);
                                }
                                self.ensure_subscribed().await?;
                                return Ok(());
                            }
                            debug!("Finetune stage has no eligible characters, cascading");
                        }
                        stage = Stage::Render;
                    }
                    Stage::Render => {
                        let mut started = false;
                        if selection.render && !episodes.is_empty() {
                            info!("Starting bulk render for {} episodes", episodes.len());
                            self.renders.start(&episodes).await?;
                            started = true;
                        }
                        let mut state = self.inner.lock().unwrap();
                        state.active = false;
                        state.pending_chain = None;
                        if !started {
                            debug!("Pipeline finished with no render stage");
                        }
                        return Ok(());
                    }
                }
            }
        })
    }

    async fn ensure_subscribed(self: Arc<Self>) -> Result<()> {
        {
            let state = self.inner.lock().unwrap();
            if state
                .subscription
                .as_ref()
                .is_some_and(|s| s.is_active())
            {
                return Ok(());
            }
        }
        let mut stream = self.engine.subscribe_jobs().await?;
        let weak = Arc::downgrade(&self);
        let task = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let Some(pipeline) = weak.upgrade() else { break };
                pipeline.handle_job_event(event).await;
            }
        });
        self.inner.lock().unwrap().subscription = Some(Subscription::new(task));
        Ok(())
    }

    async fn handle_job_event(self: Arc<Self>, event: JobEvent) {
        match event {
            JobEvent::Queued(job) => {
                let mut state = self.inner.lock().unwrap();
                // The backend runs one job at a time; the first queued job
                // is the current one.
                if state.current_job.is_none() {
                    state.current_job = Some(job);
                } else {
                    state.queue.push_back(job);
                }
            }
            JobEvent::Progress(job) => {
                let mut state = self.inner.lock().unwrap();
                if state
                    .current_job
                    .as_ref()
                    .is_some_and(|c| c.job_id == job.job_id)
                {
                    state.current_job = Some(job);
                } else if let Some(queued) =
                    state.queue.iter_mut().find(|q| q.job_id == job.job_id)
                {
                    *queued = job;
                }
            }
            JobEvent::Done { job_id } => {
                let mut state = self.inner.lock().unwrap();
                if state
                    .current_job
                    .as_ref()
                    .is_some_and(|c| c.job_id == job_id)
                {
                    state.current_job = state.queue.pop_front();
                } else {
                    state.queue.retain(|q| q.job_id != job_id);
                }
            }
            JobEvent::Failed { job_id, message } => {
                error!("Training job {} failed: {}", job_id, message);
                let mut state = self.inner.lock().unwrap();
                if let Some(current) = state.current_job.as_mut() {
                    if current.job_id == job_id {
                        current.status = JobStatus::Failed;
                        current.message = message;
                    }
                }
                // A failed stage never chains into the next one.
                state.pending_chain = None;
            }
            JobEvent::QueueEmpty => {
                let next = {
                    let mut state = self.inner.lock().unwrap();
                    state.queue.clear();
                    state.pending_chain.take()
                };
                match next {
                    Some(stage) => {
                        if let Err(e) = self.clone().launch(stage).await {
                            error!("Failed to chain into {:?}: {:#}", stage, e);
                            let mut state = self.inner.lock().unwrap();
                            state.active = false;
                        }
                    }
                    None => {
                        self.inner.lock().unwrap().active = false;
                    }
                }
            }
        }
    }

    /// Halts the chain and requests a best-effort server-side cancel of the
    /// in-flight job. Partial progress stays visible.
    pub async fn cancel(&self) -> Result<()> {
        let job_id = {
            let mut state = self.inner.lock().unwrap();
            state.pending_chain = None;
            state.active = false;
            state.queue.clear();
            if let Some(subscription) = state.subscription.take() {
                subscription.cancel();
            }
            state.current_job.as_mut().map(|job| {
                job.status = JobStatus::Cancelled;
                job.job_id.clone()
            })
        };
        if let Some(job_id) = job_id {
            if let Err(e) = self.engine.cancel_job(&job_id).await {
                warn!("Best-effort cancel of job {} failed: {:#}", job_id, e);
            }
        }
        Ok(())
    }
}

/// Candidate characters for a training stage: the selected group plus
/// every character reachable through a manual voice mapping or the
/// narrator binding.
fn candidate_ids(group: &[String], prefs: &Preferences) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mapped = prefs.voice_mappings.values().filter_map(|v| match v {
        VoiceSelection::Voice(id) => Some(id.clone()),
        _ => None,
    });
    for id in group.iter().cloned().chain(mapped).chain(prefs.narrator_voice.clone()) {
        if seen.insert(id.clone()) {
            out.push(id);
        }
    }
    out
}

/// Characters with source audio but no prepared model yet.
pub fn prepare_targets(
    catalog: &[RosterEntry],
    group: &[String],
    prefs: &Preferences,
) -> Vec<String> {
    candidate_ids(group, prefs)
        .into_iter()
        .filter(|id| {
            catalog
                .iter()
                .find(|e| &e.char_id == id)
                .is_some_and(|e| e.has_source_audio && !e.has_model)
        })
        .collect()
}

/// Characters prepared but not yet fine-tuned.
pub fn finetune_targets(
    catalog: &[RosterEntry],
    group: &[String],
    prefs: &Preferences,
) -> Vec<String> {
    candidate_ids(group, prefs)
        .into_iter()
        .filter(|id| {
            catalog
                .iter()
                .find(|e| &e.char_id == id)
                .is_some_and(|e| e.has_model && !e.has_finetuned)
        })
        .collect()
}
