use crate::core::prefs::PrefStore;
use crate::core::state::{CacheStatus, DialogueEntry, RosterEntry};
use crate::services::cache::CacheTracker;
use crate::services::engine::{AudioSink, RenderService, VoiceEngine};
use crate::services::resolver::resolve_voice;
use crate::utils::debounce::Cooldown;
use anyhow::Result;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

/// Why a `play` call did or did not start audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Started,
    /// Rejected by the reentrancy flag: another start is mid-lookup.
    Busy,
    /// Same dialogue id is already playing.
    AlreadyPlaying,
    /// Within the minimum interval since the last attempted start.
    Throttled,
    /// Voice resolution returned no identity.
    Unresolved,
    /// A bulk render owns the synthesis engine and has not reached this
    /// script index yet.
    RenderHoldsEngine,
    /// No usable artifact and on-demand synthesis is not allowed in the
    /// current mode.
    PrerenderRequired,
}

#[derive(Default)]
struct PlayState {
    starting: bool,
    current_id: Option<String>,
    last_played_id: Option<String>,
}

/// Clears the reentrancy flag once the lookup/synthesis phase resolves,
/// including on early error returns.
struct StartingGuard<'a>(&'a Mutex<PlayState>);

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().unwrap().starting = false;
    }
}

pub struct PlaybackController {
    engine: Arc<dyn VoiceEngine>,
    renders: Arc<dyn RenderService>,
    sink: Arc<dyn AudioSink>,
    prefs: Arc<PrefStore>,
    cache: Arc<Mutex<CacheTracker>>,
    roster: Arc<Mutex<Vec<RosterEntry>>>,
    male_markers: Vec<String>,
    episode_id: Mutex<String>,
    dubbing: AtomicBool,
    state: Mutex<PlayState>,
    cooldown: Mutex<Cooldown>,
}

impl PlaybackController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<dyn VoiceEngine>,
        renders: Arc<dyn RenderService>,
        sink: Arc<dyn AudioSink>,
        prefs: Arc<PrefStore>,
        cache: Arc<Mutex<CacheTracker>>,
        roster: Arc<Mutex<Vec<RosterEntry>>>,
        male_markers: Vec<String>,
        min_play_interval: Duration,
    ) -> Self {
        Self {
            engine,
            renders,
            sink,
            prefs,
            cache,
            roster,
            male_markers,
            episode_id: Mutex::new(String::new()),
            dubbing: AtomicBool::new(false),
            state: Mutex::new(PlayState::default()),
            cooldown: Mutex::new(Cooldown::new(min_play_interval)),
        }
    }

    pub fn set_episode(&self, episode_id: &str) {
        *self.episode_id.lock().unwrap() = episode_id.to_string();
    }

    /// Live-dubbing mode forbids on-demand synthesis fallbacks.
    pub fn set_dubbing(&self, enabled: bool) {
        self.dubbing.store(enabled, Ordering::SeqCst);
    }

    pub fn is_dubbing(&self) -> bool {
        self.dubbing.load(Ordering::SeqCst)
    }

    pub fn last_played_id(&self) -> Option<String> {
        self.state.lock().unwrap().last_played_id.clone()
    }

    pub fn current_id(&self) -> Option<String> {
        self.state.lock().unwrap().current_id.clone()
    }

    /// Starts playback for one dialogue line, preferring a pre-rendered
    /// artifact and falling back to on-demand synthesis where the current
    /// mode allows it. At most one start proceeds per trigger burst.
    pub async fn play(&self, dialogue: &DialogueEntry) -> Result<PlayOutcome> {
        {
            let mut state = self.state.lock().unwrap();
            if state.starting {
                debug!("play({}) rejected: start in progress", dialogue.id);
                return Ok(PlayOutcome::Busy);
            }
            if state.current_id.as_deref() == Some(dialogue.id.as_str()) {
                return Ok(PlayOutcome::AlreadyPlaying);
            }
            if !self.cooldown.lock().unwrap().try_pass() {
                debug!("play({}) rejected: within minimum interval", dialogue.id);
                return Ok(PlayOutcome::Throttled);
            }
            state.starting = true;
        }
        let starting = StartingGuard(&self.state);

        let prefs = self.prefs.snapshot();
        let roster = self.roster.lock().unwrap().clone();
        let Some(voice) = resolve_voice(
            &prefs,
            &roster,
            &self.male_markers,
            dialogue.speaker_key.as_ref(),
            dialogue.speaker_name.as_deref(),
        ) else {
            warn!("No voice resolved for dialogue {}", dialogue.id);
            return Ok(PlayOutcome::Unresolved);
        };

        let episode_id = self.episode_id.lock().unwrap().clone();
        let (cache_status, render_active) = {
            let cache = self.cache.lock().unwrap();
            if cache.live_render(&episode_id).is_some()
                && !cache.covers_index(&episode_id, dialogue.script_index)
            {
                warn!(
                    "Bulk render owns the engine and has not reached line {} of {}; skipping",
                    dialogue.script_index, episode_id
                );
                return Ok(PlayOutcome::RenderHoldsEngine);
            }
            (cache.status(&episode_id), cache.render_active())
        };
        let synthesis_allowed = !self.is_dubbing() && !render_active;

        let audio = if cache_status != CacheStatus::None {
            match self
                .renders
                .fetch_artifact(&episode_id, dialogue.script_index)
                .await
            {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    if !synthesis_allowed {
                        warn!(
                            "Artifact load failed for {} line {}: {:#}; pre-render required",
                            episode_id, dialogue.script_index, e
                        );
                        return Ok(PlayOutcome::PrerenderRequired);
                    }
                    debug!(
                        "Artifact load failed for {} line {}, synthesizing: {:#}",
                        episode_id, dialogue.script_index, e
                    );
                    None
                }
            }
        } else if !synthesis_allowed {
            warn!(
                "No cached artifact for {} line {}; pre-render required",
                episode_id, dialogue.script_index
            );
            return Ok(PlayOutcome::PrerenderRequired);
        } else {
            None
        };

        let audio = match audio {
            Some(bytes) => bytes,
            None => self.engine.synthesize(&dialogue.text, &voice).await?,
        };
        // The lookup/synthesis phase is over; later calls may race the
        // actual sink start and supersede it.
        drop(starting);

        self.sink.play(audio, prefs.volume).await?;
        let mut state = self.state.lock().unwrap();
        state.current_id = Some(dialogue.id.clone());
        state.last_played_id = Some(dialogue.id.clone());
        Ok(PlayOutcome::Started)
    }

    pub async fn stop(&self) -> Result<()> {
        self.sink.stop().await?;
        self.state.lock().unwrap().current_id = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::core::state::{JobMode, RenderProgress, RenderStatus, SpeakerKey, VoiceSelection};
    use crate::services::engine::JobEvent;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use futures_util::stream::BoxStream;
    use tokio::time::advance;

    struct MockEngine {
        synth_calls: Mutex<Vec<String>>,
    }

    impl MockEngine {
        fn new() -> Self {
            Self {
                synth_calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VoiceEngine for MockEngine {
        async fn synthesize(&self, text: &str, _voice_id: &str) -> Result<Vec<u8>> {
            self.synth_calls.lock().unwrap().push(text.to_string());
            Ok(vec![1, 2, 3])
        }
        async fn character_catalog(&self) -> Result<Vec<RosterEntry>> {
            Ok(vec![])
        }
        async fn submit_batch(&self, _char_ids: &[String], _mode: JobMode) -> Result<String> {
            Ok("job".to_string())
        }
        async fn subscribe_jobs(&self) -> Result<BoxStream<'static, JobEvent>> {
            Ok(Box::pin(futures_util::stream::empty()))
        }
        async fn cancel_job(&self, _job_id: &str) -> Result<()> {
            Ok(())
        }
    }

    struct MockRenders {
        has_artifact: bool,
    }

    #[async_trait]
    impl RenderService for MockRenders {
        async fn start(&self, _episode_ids: &[String]) -> Result<()> {
            Ok(())
        }
        async fn cancel(&self) -> Result<()> {
            Ok(())
        }
        async fn status(&self, episode_id: &str) -> Result<RenderProgress> {
            Ok(RenderProgress {
                episode_id: episode_id.to_string(),
                status: RenderStatus::NotStarted,
                completed: 0,
                total: 0,
            })
        }
        async fn delete(&self, _episode_id: &str) -> Result<()> {
            Ok(())
        }
        async fn subscribe(&self) -> Result<BoxStream<'static, RenderProgress>> {
            Ok(Box::pin(futures_util::stream::empty()))
        }
        async fn fetch_artifact(&self, _episode_id: &str, _script_index: usize) -> Result<Vec<u8>> {
            if self.has_artifact {
                Ok(vec![9, 9, 9])
            } else {
                Err(anyhow!("artifact missing"))
            }
        }
    }

    struct CountingSink {
        plays: Mutex<usize>,
        stops: Mutex<usize>,
    }

    impl CountingSink {
        fn new() -> Self {
            Self {
                plays: Mutex::new(0),
                stops: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl AudioSink for CountingSink {
        async fn play(&self, _audio: Vec<u8>, _volume: f32) -> Result<()> {
            *self.plays.lock().unwrap() += 1;
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            *self.stops.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn dialogue(id: &str, index: usize) -> DialogueEntry {
        DialogueEntry {
            id: id.to_string(),
            speaker_key: Some(SpeakerKey::stable("c1")),
            speaker_name: Some("Alice".to_string()),
            text: "Hello".to_string(),
            script_index: index,
        }
    }

    struct Fixture {
        ctrl: Arc<PlaybackController>,
        engine: Arc<MockEngine>,
        sink: Arc<CountingSink>,
        _dir: tempfile::TempDir,
    }

    async fn controller(has_artifact: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let prefs_path = dir.path().join("prefs.json");
        let prefs = Arc::new(
            PrefStore::load(Arc::new(NativeStorage::new()), prefs_path.to_str().unwrap(), None)
                .await
                .unwrap(),
        );
        prefs
            .set_mapping(SpeakerKey::stable("c1"), VoiceSelection::Voice("v1".into()))
            .await;
        let engine = Arc::new(MockEngine::new());
        let sink = Arc::new(CountingSink::new());
        let ctrl = Arc::new(PlaybackController::new(
            engine.clone(),
            Arc::new(MockRenders { has_artifact }),
            sink.clone(),
            prefs,
            Arc::new(Mutex::new(CacheTracker::default())),
            Arc::new(Mutex::new(Vec::new())),
            crate::core::config::Config::default().male_markers,
            Duration::from_millis(500),
        ));
        ctrl.set_episode("ep1");
        Fixture {
            ctrl,
            engine,
            sink,
            _dir: dir,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_calls_starts_exactly_once() -> Result<()> {
        let f = controller(false).await;
        let d = dialogue("d1", 0);

        assert_eq!(f.ctrl.play(&d).await?, PlayOutcome::Started);
        advance(Duration::from_millis(100)).await;
        assert_eq!(f.ctrl.play(&d).await?, PlayOutcome::AlreadyPlaying);
        assert_eq!(*f.sink.plays.lock().unwrap(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn different_dialogue_within_interval_is_throttled() -> Result<()> {
        let f = controller(false).await;
        assert_eq!(f.ctrl.play(&dialogue("d1", 0)).await?, PlayOutcome::Started);
        advance(Duration::from_millis(100)).await;
        assert_eq!(f.ctrl.play(&dialogue("d2", 1)).await?, PlayOutcome::Throttled);

        advance(Duration::from_millis(500)).await;
        assert_eq!(f.ctrl.play(&dialogue("d2", 1)).await?, PlayOutcome::Started);
        assert_eq!(*f.sink.plays.lock().unwrap(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn unresolved_speaker_refuses_playback() -> Result<()> {
        let f = controller(false).await;
        let d = DialogueEntry {
            speaker_key: Some(SpeakerKey::stable("nobody")),
            speaker_name: None,
            ..dialogue("d1", 0)
        };
        assert_eq!(f.ctrl.play(&d).await?, PlayOutcome::Unresolved);
        assert!(f.engine.synth_calls.lock().unwrap().is_empty());
        assert_eq!(*f.sink.plays.lock().unwrap(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn render_in_progress_blocks_uncovered_index() -> Result<()> {
        let f = controller(true).await;
        f.ctrl.cache.lock().unwrap().on_render_event(RenderProgress {
            episode_id: "ep1".to_string(),
            status: RenderStatus::Rendering,
            completed: 3,
            total: 10,
        });

        assert_eq!(
            f.ctrl.play(&dialogue("d8", 8)).await?,
            PlayOutcome::RenderHoldsEngine
        );
        assert!(f.engine.synth_calls.lock().unwrap().is_empty());

        // A line the render already produced plays from the artifact cache.
        advance(Duration::from_millis(600)).await;
        assert_eq!(f.ctrl.play(&dialogue("d1", 1)).await?, PlayOutcome::Started);
        assert!(f.engine.synth_calls.lock().unwrap().is_empty());
        assert_eq!(*f.sink.plays.lock().unwrap(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn artifact_failure_dichotomy() -> Result<()> {
        // Outside dubbing mode a missing artifact falls back to synthesis.
        let f = controller(false).await;
        f.ctrl.cache.lock().unwrap().on_render_event(RenderProgress {
            episode_id: "ep1".to_string(),
            status: RenderStatus::Completed,
            completed: 10,
            total: 10,
        });
        f.ctrl.cache.lock().unwrap().clear_live();
        assert_eq!(f.ctrl.play(&dialogue("d1", 1)).await?, PlayOutcome::Started);
        assert_eq!(f.engine.synth_calls.lock().unwrap().len(), 1);

        // In dubbing mode the same situation surfaces a pre-render warning.
        let f = controller(false).await;
        f.ctrl.cache.lock().unwrap().on_render_event(RenderProgress {
            episode_id: "ep1".to_string(),
            status: RenderStatus::Completed,
            completed: 10,
            total: 10,
        });
        f.ctrl.cache.lock().unwrap().clear_live();
        f.ctrl.set_dubbing(true);
        assert_eq!(
            f.ctrl.play(&dialogue("d1", 1)).await?,
            PlayOutcome::PrerenderRequired
        );
        assert!(f.engine.synth_calls.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn uncached_line_synthesizes_only_outside_dubbing() -> Result<()> {
        let f = controller(false).await;
        assert_eq!(f.ctrl.play(&dialogue("d1", 0)).await?, PlayOutcome::Started);
        assert_eq!(f.engine.synth_calls.lock().unwrap().len(), 1);

        let f = controller(false).await;
        f.ctrl.set_dubbing(true);
        assert_eq!(
            f.ctrl.play(&dialogue("d1", 0)).await?,
            PlayOutcome::PrerenderRequired
        );
        assert!(f.engine.synth_calls.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn stop_clears_current_dialogue() -> Result<()> {
        let f = controller(true).await;
        f.ctrl.cache.lock().unwrap().on_render_event(RenderProgress {
            episode_id: "ep1".to_string(),
            status: RenderStatus::Completed,
            completed: 2,
            total: 2,
        });
        f.ctrl.cache.lock().unwrap().clear_live();
        f.ctrl.play(&dialogue("d1", 0)).await?;
        assert_eq!(f.ctrl.current_id().as_deref(), Some("d1"));

        f.ctrl.stop().await?;
        assert_eq!(f.ctrl.current_id(), None);
        assert_eq!(f.ctrl.last_played_id().as_deref(), Some("d1"));
        assert_eq!(*f.sink.stops.lock().unwrap(), 1);
        Ok(())
    }
}
