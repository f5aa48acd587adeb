use crate::core::prefs::PrefStore;
use crate::core::state::DialogueEntry;
use crate::services::engine::{Detection, ScriptMatch, ScriptMatcher, Subscription};
use crate::services::playback::PlaybackController;
use crate::utils::debounce::{wait_until, DebounceGate};
use anyhow::Result;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Duration;

/// Current match state, readable at any time during a session.
#[derive(Debug, Clone, Default)]
pub struct MatchSnapshot {
    pub dialogue_id: Option<String>,
    pub script_index: Option<usize>,
    pub matched_text: Option<String>,
    pub similarity: Option<f32>,
}

/// One monitoring session over a detection stream. Detections are
/// deduplicated against the last matched text, debounced so only the last
/// of a burst fires, and matched with at most one request in flight.
pub struct ScriptMonitor {
    shared: Arc<Mutex<MatchSnapshot>>,
    subscription: Subscription,
}

impl ScriptMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        detections: BoxStream<'static, Detection>,
        matcher: Arc<dyn ScriptMatcher>,
        playback: Arc<PlaybackController>,
        prefs: Arc<PrefStore>,
        script: Arc<Vec<DialogueEntry>>,
        episode_id: String,
        debounce: Duration,
    ) -> Self {
        let shared = Arc::new(Mutex::new(MatchSnapshot::default()));
        let task = tokio::spawn(run_session(
            detections,
            matcher,
            playback,
            prefs,
            script,
            episode_id,
            debounce,
            shared.clone(),
        ));
        Self {
            shared,
            subscription: Subscription::new(task),
        }
    }

    pub fn snapshot(&self) -> MatchSnapshot {
        self.shared.lock().unwrap().clone()
    }

    /// Ends the session: the stream and the debounce timer are dropped with
    /// the task, so no callback fires afterwards.
    pub fn stop(&self) {
        self.subscription.cancel();
    }

    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    mut detections: BoxStream<'static, Detection>,
    matcher: Arc<dyn ScriptMatcher>,
    playback: Arc<PlaybackController>,
    prefs: Arc<PrefStore>,
    script: Arc<Vec<DialogueEntry>>,
    episode_id: String,
    debounce: Duration,
    shared: Arc<Mutex<MatchSnapshot>>,
) {
    let mut gate = DebounceGate::new(debounce);
    let mut pending: Option<String> = None;
    // Held locally so dropping the session task aborts the lookup with it.
    let mut match_task: Option<Subscription> = None;
    let mut last_matched_text: Option<String> = None;
    let (result_tx, mut result_rx) =
        mpsc::channel::<(String, Result<Option<ScriptMatch>>)>(1);

    loop {
        tokio::select! {
            detection = detections.next() => {
                let Some(detection) = detection else { break };
                if detection.text.trim().is_empty() {
                    continue;
                }
                // Identical to the last matched text: the screen is stable,
                // nothing to do.
                if last_matched_text.as_deref() == Some(detection.text.as_str()) {
                    continue;
                }
                pending = Some(detection.text);
                gate.reset();
            }
            _ = wait_until(gate.deadline()), if gate.is_armed() => {
                gate.cancel();
                let Some(text) = pending.take() else { continue };
                if match_task.is_some() {
                    // Never queue behind an outstanding request; a stale
                    // result arriving out of order is worse than a miss.
                    debug!("Match request outstanding, dropping detection");
                    continue;
                }
                let matcher = matcher.clone();
                let tx = result_tx.clone();
                let episode_id = episode_id.clone();
                match_task = Some(Subscription::new(tokio::spawn(async move {
                    let result = matcher.find_match(&episode_id, &text).await;
                    let _ = tx.send((text, result)).await;
                })));
            }
            Some((text, result)) = result_rx.recv() => {
                match_task = None;
                match result {
                    Ok(Some(matched)) => {
                        last_matched_text = Some(text.clone());
                        let previous_id = {
                            let mut snap = shared.lock().unwrap();
                            let previous = snap.dialogue_id.clone();
                            snap.dialogue_id = Some(matched.dialogue_id.clone());
                            snap.script_index = Some(matched.script_index);
                            snap.matched_text = Some(text);
                            snap.similarity = Some(matched.similarity);
                            previous
                        };
                        maybe_auto_play(&playback, &prefs, &script, &matched, previous_id).await;
                    }
                    // Transient OCR noise: keep the previous matched state.
                    Ok(None) => debug!("No script match for detection"),
                    Err(e) => debug!("Matcher error absorbed: {:#}", e),
                }
            }
        }
    }
}

async fn maybe_auto_play(
    playback: &PlaybackController,
    prefs: &PrefStore,
    script: &[DialogueEntry],
    matched: &ScriptMatch,
    previous_id: Option<String>,
) {
    if !prefs.snapshot().auto_play {
        return;
    }
    if previous_id.as_deref() == Some(matched.dialogue_id.as_str()) {
        return;
    }
    if playback.last_played_id().as_deref() == Some(matched.dialogue_id.as_str()) {
        return;
    }
    let Some(entry) = script.iter().find(|e| e.id == matched.dialogue_id) else {
        warn!("Matched dialogue {} not in loaded script", matched.dialogue_id);
        return;
    };
    // The newest match always preempts whatever is playing.
    if let Err(e) = playback.stop().await {
        warn!("Failed to stop current playback: {:#}", e);
    }
    match playback.play(entry).await {
        Ok(outcome) => debug!("Auto-play {} -> {:?}", entry.id, outcome),
        Err(e) => warn!("Auto-play failed for {}: {:#}", entry.id, e),
    }
}
