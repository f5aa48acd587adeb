use crate::core::config::Config;
use crate::core::io::Storage;
use crate::core::prefs::PrefStore;
use crate::core::state::{
    CacheStatus, DialogueEntry, RosterEntry, SpeakerKey, StageSelection, VoiceSelection,
};
use crate::services::cache::{normalize_episode_id, CacheTracker};
use crate::services::engine::{
    AudioSink, DetectionSource, RenderService, ScriptMatcher, Subscription, VoiceEngine,
};
use crate::services::monitor::{MatchSnapshot, ScriptMonitor};
use crate::services::pipeline::{BatchPipeline, TrainingSnapshot};
use crate::services::playback::{PlayOutcome, PlaybackController};
use crate::services::resolver::resolve_voice;
use anyhow::{bail, Result};
use futures_util::StreamExt;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

/// The application-facing context for one dubbing workspace. Owns the
/// preference store, the character roster, the loaded script, the cache
/// tracker and the playback/pipeline/monitor components; every snapshot
/// read is synchronous over in-memory state.
pub struct DubbingSession {
    prefs: Arc<PrefStore>,
    detections: Arc<dyn DetectionSource>,
    matcher: Arc<dyn ScriptMatcher>,
    engine: Arc<dyn VoiceEngine>,
    renders: Arc<dyn RenderService>,
    playback: Arc<PlaybackController>,
    pipeline: Arc<BatchPipeline>,
    cache: Arc<Mutex<CacheTracker>>,
    roster: Arc<Mutex<Vec<RosterEntry>>>,
    script: Mutex<Arc<Vec<DialogueEntry>>>,
    episode_id: Mutex<String>,
    male_markers: Vec<String>,
    debounce: Duration,
    monitor: Mutex<Option<ScriptMonitor>>,
    _render_watch: Subscription,
}

impl DubbingSession {
    /// Builds the session: loads preferences (merging server mappings,
    /// server wins), fetches the character roster, and subscribes to the
    /// render progress stream so the cache sets stay persistent.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        config: &Config,
        storage: Arc<dyn Storage>,
        detections: Arc<dyn DetectionSource>,
        matcher: Arc<dyn ScriptMatcher>,
        engine: Arc<dyn VoiceEngine>,
        renders: Arc<dyn RenderService>,
        sink: Arc<dyn AudioSink>,
        server_mappings: Option<HashMap<SpeakerKey, VoiceSelection>>,
    ) -> Result<Arc<Self>> {
        let prefs = Arc::new(
            PrefStore::load(storage, &config.prefs_path, server_mappings).await?,
        );
        let roster = Arc::new(Mutex::new(engine.character_catalog().await?));
        info!("Loaded {} roster characters", roster.lock().unwrap().len());

        let cache = Arc::new(Mutex::new(CacheTracker::from_prefs(&prefs.snapshot())));
        let playback = Arc::new(PlaybackController::new(
            engine.clone(),
            renders.clone(),
            sink,
            prefs.clone(),
            cache.clone(),
            roster.clone(),
            config.male_markers.clone(),
            Duration::from_millis(config.min_play_interval_ms),
        ));
        let pipeline = Arc::new(BatchPipeline::new(
            engine.clone(),
            renders.clone(),
            prefs.clone(),
        ));
        let render_watch =
            Self::watch_renders(renders.clone(), cache.clone(), prefs.clone()).await?;

        Ok(Arc::new(Self {
            prefs,
            detections,
            matcher,
            engine,
            renders,
            playback,
            pipeline,
            cache,
            roster,
            script: Mutex::new(Arc::new(Vec::new())),
            episode_id: Mutex::new(String::new()),
            male_markers: config.male_markers.clone(),
            debounce: Duration::from_millis(config.debounce_ms),
            monitor: Mutex::new(None),
            _render_watch: render_watch,
        }))
    }

    /// Folds render progress into the tracker and persists set transitions
    /// so cache status survives restarts.
    async fn watch_renders(
        renders: Arc<dyn RenderService>,
        cache: Arc<Mutex<CacheTracker>>,
        prefs: Arc<PrefStore>,
    ) -> Result<Subscription> {
        let mut stream = renders.subscribe().await?;
        let task = tokio::spawn(async move {
            while let Some(progress) = stream.next().await {
                let id = normalize_episode_id(&progress.episode_id);
                let finished = progress.total > 0 && progress.completed >= progress.total;
                let begun = progress.completed > 0;
                let status = cache.lock().unwrap().on_render_event(progress);
                debug!("Render progress for {}: {:?}", id, status);
                if finished {
                    prefs.mark_episode_completed(&id).await;
                } else if begun {
                    prefs.mark_episode_partial(&id).await;
                }
            }
        });
        Ok(Subscription::new(task))
    }

    pub fn prefs(&self) -> &Arc<PrefStore> {
        &self.prefs
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.roster.lock().unwrap().clone()
    }

    pub async fn refresh_roster(&self) -> Result<()> {
        let fresh = self.engine.character_catalog().await?;
        *self.roster.lock().unwrap() = fresh;
        Ok(())
    }

    /// Loads an episode script. Ends any running monitor: its matches would
    /// refer to the previous script.
    pub fn load_script(&self, episode_id: &str, script: Vec<DialogueEntry>) {
        self.stop_monitoring();
        *self.script.lock().unwrap() = Arc::new(script);
        *self.episode_id.lock().unwrap() = episode_id.to_string();
        self.playback.set_episode(episode_id);
    }

    /// Voice a given speaker would get right now, per current preferences
    /// and roster.
    pub fn resolved_voice(
        &self,
        speaker_key: Option<&SpeakerKey>,
        display_name: Option<&str>,
    ) -> Option<String> {
        let prefs = self.prefs.snapshot();
        let roster = self.roster.lock().unwrap().clone();
        resolve_voice(&prefs, &roster, &self.male_markers, speaker_key, display_name)
    }

    pub async fn start_monitoring(&self) -> Result<()> {
        if self.is_monitoring() {
            bail!("A monitoring session is already running");
        }
        let script = self.script.lock().unwrap().clone();
        if script.is_empty() {
            bail!("No script loaded");
        }
        let episode_id = self.episode_id.lock().unwrap().clone();
        let stream = self.detections.subscribe().await?;
        let monitor = ScriptMonitor::start(
            stream,
            self.matcher.clone(),
            self.playback.clone(),
            self.prefs.clone(),
            script,
            episode_id,
            self.debounce,
        );
        *self.monitor.lock().unwrap() = Some(monitor);
        Ok(())
    }

    pub fn stop_monitoring(&self) {
        if let Some(monitor) = self.monitor.lock().unwrap().take() {
            monitor.stop();
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|m| m.is_active())
    }

    pub fn match_snapshot(&self) -> MatchSnapshot {
        self.monitor
            .lock()
            .unwrap()
            .as_ref()
            .map(|m| m.snapshot())
            .unwrap_or_default()
    }

    pub fn set_dubbing(&self, enabled: bool) {
        self.playback.set_dubbing(enabled);
    }

    pub async fn play_line(&self, dialogue: &DialogueEntry) -> Result<PlayOutcome> {
        self.playback.play(dialogue).await
    }

    pub async fn stop_playback(&self) -> Result<()> {
        self.playback.stop().await
    }

    pub fn current_dialogue(&self) -> Option<String> {
        self.playback.current_id()
    }

    pub fn last_played(&self) -> Option<String> {
        self.playback.last_played_id()
    }

    pub async fn start_batch(
        &self,
        selection: StageSelection,
        group: Vec<String>,
        episodes: Vec<String>,
    ) -> Result<()> {
        self.pipeline.clone().start(selection, group, episodes).await
    }

    pub async fn cancel_batch(&self) -> Result<()> {
        self.pipeline.cancel().await
    }

    pub fn training_snapshot(&self) -> TrainingSnapshot {
        self.pipeline.snapshot()
    }

    pub fn cache_status(&self, episode_id: &str) -> CacheStatus {
        self.cache.lock().unwrap().status(episode_id)
    }

    /// Deletes an episode's render on the backend and forgets it locally.
    pub async fn delete_render(&self, episode_id: &str) -> Result<()> {
        self.renders.delete(episode_id).await?;
        self.cache.lock().unwrap().forget(episode_id);
        self.prefs
            .forget_episode(&normalize_episode_id(episode_id))
            .await;
        Ok(())
    }
}
