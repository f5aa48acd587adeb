use anyhow::Result;
use std::sync::Arc;
use vndub::core::config::Config;
use vndub::core::io::NativeStorage;
use vndub::core::prefs::PrefStore;
use vndub::services::engine::VoiceEngine;
use vndub::services::remote::RemoteEngine;
use vndub::services::resolver::resolve_voice;
use vndub::core::state::SpeakerKey;

/// Diagnostic entry point: connects to the backend and reports what voice
/// every catalog character would resolve to under the current preferences.
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' is valid.");
            return Err(e);
        }
    };

    let storage = Arc::new(NativeStorage::new());
    let prefs = PrefStore::load(storage, &config.prefs_path, None).await?;
    let engine = RemoteEngine::new(&config.base_url)?;

    let roster = engine.character_catalog().await?;
    let snapshot = prefs.snapshot();
    println!("Backend: {}", config.base_url);
    println!("Characters: {}", roster.len());
    for entry in &roster {
        let key = SpeakerKey::stable(&entry.char_id);
        let voice = resolve_voice(
            &snapshot,
            &roster,
            &config.male_markers,
            Some(&key),
            Some(&entry.name),
        );
        println!(
            "  {} ({}) -> {}",
            entry.name,
            entry.char_id,
            voice.as_deref().unwrap_or("<unresolved>")
        );
    }
    let narrator = resolve_voice(&snapshot, &roster, &config.male_markers, None, None);
    println!("Narration -> {}", narrator.as_deref().unwrap_or("<unresolved>"));

    if !snapshot.cached_episodes.is_empty() {
        println!("Fully rendered episodes: {}", snapshot.cached_episodes.len());
    }
    if !snapshot.partial_episodes.is_empty() {
        println!("Partially rendered episodes: {}", snapshot.partial_episodes.len());
    }
    Ok(())
}
