use serde::{Deserialize, Serialize};

/// Sentinel mapping values understood by the server: the speaker is not
/// bound to a concrete voice but to a pool, picked deterministically at
/// resolution time.
pub const AUTO_FEMALE: &str = "auto-female";
pub const AUTO_MALE: &str = "auto-male";

const NAME_PREFIX: &str = "name:";

/// Stable identity of a speaker. Either a catalog character id, or a
/// display-name-derived alias (`"name:" + name`) for speakers the script
/// names but the catalog does not know.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpeakerKey(String);

impl SpeakerKey {
    pub fn stable(char_id: &str) -> Self {
        Self(char_id.to_string())
    }

    pub fn from_name(name: &str) -> Self {
        Self(format!("{NAME_PREFIX}{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Display name for alias keys, `None` for catalog keys.
    pub fn alias_name(&self) -> Option<&str> {
        self.0.strip_prefix(NAME_PREFIX)
    }
}

/// A speaker's assigned voice: a concrete voice id, or one of the pool
/// sentinels. Persisted and sent over the wire as a bare string, so the
/// mapping table stays compatible with the server's format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VoiceSelection {
    Voice(String),
    AutoFemale,
    AutoMale,
}

impl From<String> for VoiceSelection {
    fn from(value: String) -> Self {
        match value.as_str() {
            AUTO_FEMALE => Self::AutoFemale,
            AUTO_MALE => Self::AutoMale,
            _ => Self::Voice(value),
        }
    }
}

impl From<VoiceSelection> for String {
    fn from(value: VoiceSelection) -> Self {
        match value {
            VoiceSelection::Voice(id) => id,
            VoiceSelection::AutoFemale => AUTO_FEMALE.to_string(),
            VoiceSelection::AutoMale => AUTO_MALE.to_string(),
        }
    }
}

/// One immutable line of an episode script. `speaker_key == None` means
/// narration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueEntry {
    pub id: String,
    pub speaker_key: Option<SpeakerKey>,
    pub speaker_name: Option<String>,
    pub text: String,
    pub script_index: usize,
}

/// One row of the per-character catalog. The eligibility flags reflect
/// which training stages have completed for the character.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RosterEntry {
    pub char_id: String,
    pub name: String,
    #[serde(default)]
    pub own_voice: Option<String>,
    #[serde(default)]
    pub has_voice_assets: bool,
    #[serde(default)]
    pub has_model: bool,
    #[serde(default)]
    pub has_finetuned: bool,
    #[serde(default)]
    pub has_source_audio: bool,
}

impl RosterEntry {
    /// Voice identity the character speaks with when no manual mapping
    /// applies: its dedicated generated voice if one exists, otherwise the
    /// character id itself.
    pub fn voice_identity(&self) -> String {
        self.own_voice.clone().unwrap_or_else(|| self.char_id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Prepare,
    Finetune,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

/// One backend training job, as mirrored from the progress stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    pub job_id: String,
    pub char_id: String,
    pub mode: JobMode,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: f32,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStatus {
    NotStarted,
    Rendering,
    Completed,
}

/// Progress of a bulk render for one episode. `completed` counts script
/// lines with a finished artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderProgress {
    pub episode_id: String,
    pub status: RenderStatus,
    #[serde(default)]
    pub completed: usize,
    #[serde(default)]
    pub total: usize,
}

/// Derived cache classification for an episode; never stored, always
/// recomputed from live progress plus the persisted id sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    None,
    Partial,
    Completed,
    Rendering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prepare,
    Finetune,
    Render,
}

/// Which pipeline stages the user asked for.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageSelection {
    pub prepare: bool,
    pub finetune: bool,
    pub render: bool,
}

impl StageSelection {
    pub fn is_empty(&self) -> bool {
        !self.prepare && !self.finetune && !self.render
    }
}
