use crate::core::io::Storage;
use crate::core::state::{SpeakerKey, VoiceSelection};
use anyhow::Result;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Everything the user can change, persisted as one JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub voice_mappings: HashMap<SpeakerKey, VoiceSelection>,
    #[serde(default)]
    pub female_pool: Vec<String>,
    #[serde(default)]
    pub male_pool: Vec<String>,
    /// Deprecated single pool, read for backward compatibility only.
    #[serde(default)]
    pub legacy_pool: Vec<String>,
    #[serde(default)]
    pub narrator_voice: Option<String>,
    #[serde(default)]
    pub unknown_speaker_voice: Option<String>,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default)]
    pub auto_play: bool,
    /// Normalized ids of fully pre-rendered episodes.
    #[serde(default)]
    pub cached_episodes: HashSet<String>,
    /// Normalized ids of episodes with a partial render on disk.
    #[serde(default)]
    pub partial_episodes: HashSet<String>,
}

fn default_volume() -> f32 {
    1.0
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            voice_mappings: HashMap::new(),
            female_pool: Vec::new(),
            male_pool: Vec::new(),
            legacy_pool: Vec::new(),
            narrator_voice: None,
            unknown_speaker_voice: None,
            volume: default_volume(),
            auto_play: false,
            cached_episodes: HashSet::new(),
            partial_episodes: HashSet::new(),
        }
    }
}

/// Write-through preference store. Reads are in-memory snapshots; every
/// mutation persists the whole document. A failed write keeps the
/// in-memory state and is retried implicitly by the next write.
pub struct PrefStore {
    storage: Arc<dyn Storage>,
    path: String,
    state: Mutex<Preferences>,
}

impl PrefStore {
    /// Loads persisted preferences and merges server-supplied mappings,
    /// server taking precedence on conflict.
    pub async fn load(
        storage: Arc<dyn Storage>,
        path: &str,
        server_mappings: Option<HashMap<SpeakerKey, VoiceSelection>>,
    ) -> Result<Self> {
        let mut prefs = if storage.exists(path).await? {
            let bytes = storage.read(path).await?;
            serde_json::from_slice(&bytes)?
        } else {
            Preferences::default()
        };

        if let Some(server) = server_mappings {
            let before = prefs.voice_mappings.len();
            for (key, value) in server {
                prefs.voice_mappings.insert(key, value);
            }
            info!(
                "Merged server voice mappings ({} local, {} after merge)",
                before,
                prefs.voice_mappings.len()
            );
        }

        let store = Self {
            storage,
            path: path.to_string(),
            state: Mutex::new(prefs),
        };
        store.persist().await;
        Ok(store)
    }

    /// Consistent copy of the current preferences.
    pub fn snapshot(&self) -> Preferences {
        self.state.lock().unwrap().clone()
    }

    /// Applies a mutation and writes through. Write failures are logged and
    /// the in-memory state is kept so the user's choice is never lost.
    pub async fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut Preferences),
    {
        {
            let mut state = self.state.lock().unwrap();
            mutate(&mut state);
        }
        self.persist().await;
    }

    async fn persist(&self) {
        let snapshot = self.snapshot();
        let result = async {
            let content = serde_json::to_vec_pretty(&snapshot)?;
            self.storage.write(&self.path, &content).await
        }
        .await;
        if let Err(e) = result {
            error!("Failed to persist preferences to {}: {:#}", self.path, e);
        }
    }

    pub async fn set_mapping(&self, key: SpeakerKey, value: VoiceSelection) {
        self.update(|p| {
            p.voice_mappings.insert(key, value);
        })
        .await;
    }

    pub async fn clear_mapping(&self, key: &SpeakerKey) {
        self.update(|p| {
            p.voice_mappings.remove(key);
        })
        .await;
    }

    pub async fn set_female_pool(&self, pool: Vec<String>) {
        self.update(|p| p.female_pool = pool).await;
    }

    pub async fn set_male_pool(&self, pool: Vec<String>) {
        self.update(|p| p.male_pool = pool).await;
    }

    pub async fn set_narrator_voice(&self, voice: Option<String>) {
        self.update(|p| p.narrator_voice = voice).await;
    }

    pub async fn set_unknown_speaker_voice(&self, voice: Option<String>) {
        self.update(|p| p.unknown_speaker_voice = voice).await;
    }

    pub async fn set_volume(&self, volume: f32) {
        self.update(|p| p.volume = volume.clamp(0.0, 1.0)).await;
    }

    pub async fn set_auto_play(&self, enabled: bool) {
        self.update(|p| p.auto_play = enabled).await;
    }

    pub async fn mark_episode_completed(&self, normalized_id: &str) {
        self.update(|p| {
            p.partial_episodes.remove(normalized_id);
            p.cached_episodes.insert(normalized_id.to_string());
        })
        .await;
    }

    pub async fn mark_episode_partial(&self, normalized_id: &str) {
        self.update(|p| {
            if !p.cached_episodes.contains(normalized_id) {
                p.partial_episodes.insert(normalized_id.to_string());
            }
        })
        .await;
    }

    pub async fn forget_episode(&self, normalized_id: &str) {
        self.update(|p| {
            p.cached_episodes.remove(normalized_id);
            p.partial_episodes.remove(normalized_id);
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use anyhow::anyhow;
    use async_trait::async_trait;

    #[tokio::test]
    async fn survives_restart() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("prefs.json");
        let path = path.to_str().unwrap();
        let storage = Arc::new(NativeStorage::new());

        let store = PrefStore::load(storage.clone(), path, None).await?;
        store
            .set_mapping(SpeakerKey::stable("c1"), VoiceSelection::Voice("v1".into()))
            .await;
        store.set_volume(0.5).await;
        drop(store);

        let store = PrefStore::load(storage, path, None).await?;
        let prefs = store.snapshot();
        assert_eq!(
            prefs.voice_mappings[&SpeakerKey::stable("c1")],
            VoiceSelection::Voice("v1".into())
        );
        assert_eq!(prefs.volume, 0.5);
        Ok(())
    }

    #[tokio::test]
    async fn server_mappings_take_precedence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("prefs.json");
        let path = path.to_str().unwrap();
        let storage = Arc::new(NativeStorage::new());

        let store = PrefStore::load(storage.clone(), path, None).await?;
        store
            .set_mapping(SpeakerKey::stable("c1"), VoiceSelection::Voice("local".into()))
            .await;
        store
            .set_mapping(SpeakerKey::stable("c2"), VoiceSelection::AutoMale)
            .await;
        drop(store);

        let mut server = HashMap::new();
        server.insert(
            SpeakerKey::stable("c1"),
            VoiceSelection::Voice("server".into()),
        );
        let store = PrefStore::load(storage, path, Some(server)).await?;
        let prefs = store.snapshot();
        assert_eq!(
            prefs.voice_mappings[&SpeakerKey::stable("c1")],
            VoiceSelection::Voice("server".into())
        );
        // Local-only entries survive the merge.
        assert_eq!(
            prefs.voice_mappings[&SpeakerKey::stable("c2")],
            VoiceSelection::AutoMale
        );
        Ok(())
    }

    struct FailingStorage;

    #[async_trait]
    impl Storage for FailingStorage {
        async fn read(&self, _path: &str) -> Result<Vec<u8>> {
            Err(anyhow!("read failed"))
        }
        async fn write(&self, _path: &str, _content: &[u8]) -> Result<()> {
            Err(anyhow!("disk full"))
        }
        async fn delete(&self, _path: &str) -> Result<()> {
            Ok(())
        }
        async fn exists(&self, _path: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn failed_write_keeps_memory_state() -> Result<()> {
        let store = PrefStore::load(Arc::new(FailingStorage), "prefs.json", None).await?;
        store
            .set_mapping(SpeakerKey::from_name("Foo"), VoiceSelection::AutoFemale)
            .await;
        let prefs = store.snapshot();
        assert_eq!(
            prefs.voice_mappings[&SpeakerKey::from_name("Foo")],
            VoiceSelection::AutoFemale
        );
        Ok(())
    }
}
