use crate::core::prefs::Preferences;
use crate::core::state::{CacheStatus, RenderProgress, RenderStatus};
use std::collections::HashSet;

/// Episode ids double as cache keys; path separators would silently split
/// the keyspace, so every consumer normalizes through here.
pub fn normalize_episode_id(id: &str) -> String {
    id.replace(['/', '\\'], "_")
}

/// Derives per-episode cache status from the persisted id sets and the
/// latest live render event. Classification is recomputed on every query,
/// never stored.
#[derive(Debug, Default)]
pub struct CacheTracker {
    completed: HashSet<String>,
    partial: HashSet<String>,
    live: Option<RenderProgress>,
}

impl CacheTracker {
    pub fn from_prefs(prefs: &Preferences) -> Self {
        Self {
            completed: prefs.cached_episodes.clone(),
            partial: prefs.partial_episodes.clone(),
            live: None,
        }
    }

    /// Folds one render-progress event into the tracked state. Returns the
    /// resulting status so callers can persist set transitions.
    pub fn on_render_event(&mut self, event: RenderProgress) -> CacheStatus {
        let id = normalize_episode_id(&event.episode_id);
        if event.completed >= event.total && event.total > 0 {
            self.partial.remove(&id);
            self.completed.insert(id.clone());
        } else if event.completed > 0 && !self.completed.contains(&id) {
            self.partial.insert(id.clone());
        }
        self.live = Some(event);
        self.status(&id)
    }

    pub fn clear_live(&mut self) {
        self.live = None;
    }

    pub fn forget(&mut self, episode_id: &str) {
        let id = normalize_episode_id(episode_id);
        self.completed.remove(&id);
        self.partial.remove(&id);
        if self.live_for(&id).is_some() {
            self.live = None;
        }
    }

    pub fn status(&self, episode_id: &str) -> CacheStatus {
        let id = normalize_episode_id(episode_id);
        if let Some(live) = self.live_for(&id) {
            if live.status == RenderStatus::Rendering {
                return CacheStatus::Rendering;
            }
            if live.total > 0 && live.completed == live.total {
                return CacheStatus::Completed;
            }
            if live.completed > 0 {
                return CacheStatus::Partial;
            }
        }
        if self.completed.contains(&id) {
            CacheStatus::Completed
        } else if self.partial.contains(&id) {
            CacheStatus::Partial
        } else {
            CacheStatus::None
        }
    }

    /// Whether any bulk render is currently running, for any episode.
    pub fn render_active(&self) -> bool {
        self.live
            .as_ref()
            .is_some_and(|p| p.status == RenderStatus::Rendering)
    }

    /// Live render in progress for this episode, if any.
    pub fn live_render(&self, episode_id: &str) -> Option<&RenderProgress> {
        let id = normalize_episode_id(episode_id);
        self.live_for(&id)
            .filter(|p| p.status == RenderStatus::Rendering)
    }

    /// Whether an in-progress render has already produced this script
    /// index. Renders proceed in script order.
    pub fn covers_index(&self, episode_id: &str, script_index: usize) -> bool {
        match self.live_render(episode_id) {
            Some(progress) => script_index < progress.completed,
            None => false,
        }
    }

    fn live_for(&self, normalized_id: &str) -> Option<&RenderProgress> {
        self.live
            .as_ref()
            .filter(|p| normalize_episode_id(&p.episode_id) == normalized_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(ep: &str, status: RenderStatus, completed: usize, total: usize) -> RenderProgress {
        RenderProgress {
            episode_id: ep.to_string(),
            status,
            completed,
            total,
        }
    }

    #[test]
    fn classification_rows() {
        let mut tracker = CacheTracker::default();

        tracker.on_render_event(progress("ep1", RenderStatus::Rendering, 5, 10));
        assert_eq!(tracker.status("ep1"), CacheStatus::Rendering);

        tracker.on_render_event(progress("ep1", RenderStatus::NotStarted, 5, 10));
        assert_eq!(tracker.status("ep1"), CacheStatus::Partial);

        tracker.on_render_event(progress("ep1", RenderStatus::Completed, 10, 10));
        assert_eq!(tracker.status("ep1"), CacheStatus::Completed);
    }

    #[test]
    fn falls_back_to_persisted_sets() {
        let mut prefs = Preferences::default();
        prefs.cached_episodes.insert("ep_done".to_string());
        prefs.partial_episodes.insert("ep_half".to_string());
        let tracker = CacheTracker::from_prefs(&prefs);

        assert_eq!(tracker.status("ep_done"), CacheStatus::Completed);
        assert_eq!(tracker.status("ep_half"), CacheStatus::Partial);
        assert_eq!(tracker.status("ep_other"), CacheStatus::None);
    }

    #[test]
    fn episode_ids_are_normalized() {
        let mut tracker = CacheTracker::default();
        tracker.on_render_event(progress("story/ch01", RenderStatus::Rendering, 2, 10));
        assert_eq!(tracker.status("story\\ch01"), CacheStatus::Rendering);
        assert_eq!(tracker.status("story_ch01"), CacheStatus::Rendering);
    }

    #[test]
    fn live_event_for_other_episode_is_ignored() {
        let mut prefs = Preferences::default();
        prefs.cached_episodes.insert("ep_done".to_string());
        let mut tracker = CacheTracker::from_prefs(&prefs);
        tracker.on_render_event(progress("ep_other", RenderStatus::Rendering, 1, 10));
        assert_eq!(tracker.status("ep_done"), CacheStatus::Completed);
    }

    #[test]
    fn index_coverage_tracks_live_render() {
        let mut tracker = CacheTracker::default();
        tracker.on_render_event(progress("ep1", RenderStatus::Rendering, 5, 10));
        assert!(tracker.covers_index("ep1", 4));
        assert!(!tracker.covers_index("ep1", 5));
        assert!(!tracker.covers_index("ep2", 0));
    }

    #[test]
    fn completion_moves_partial_to_completed() {
        let mut tracker = CacheTracker::default();
        tracker.on_render_event(progress("ep1", RenderStatus::Rendering, 3, 10));
        tracker.on_render_event(progress("ep1", RenderStatus::Completed, 10, 10));
        tracker.clear_live();
        assert_eq!(tracker.status("ep1"), CacheStatus::Completed);
    }
}
