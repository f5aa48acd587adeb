use crate::core::prefs::Preferences;
use crate::core::state::{RosterEntry, SpeakerKey, VoiceSelection};
use crate::utils::hash::pick_from_pool;

/// Maps a dialogue's speaker to a concrete voice identity. Pure and
/// deterministic for a given preference snapshot and roster; shared by the
/// live playback path and the bulk-render submission path so the two never
/// disagree on an assignment.
///
/// `None` means unresolved: no playback is possible for this line.
pub fn resolve_voice(
    prefs: &Preferences,
    roster: &[RosterEntry],
    male_markers: &[String],
    speaker_key: Option<&SpeakerKey>,
    display_name: Option<&str>,
) -> Option<String> {
    let key = match speaker_key {
        Some(key) => key,
        None => return resolve_narrator(prefs),
    };

    let name = display_name
        .or_else(|| key.alias_name())
        .or_else(|| roster_entry(roster, key).map(|e| e.name.as_str()));

    // Placeholder names ("???") always route to the dedicated voice,
    // overriding any stale manual mapping for the same key.
    if let Some(unknown) = &prefs.unknown_speaker_voice {
        if name.is_some_and(is_placeholder_name) {
            return Some(unknown.clone());
        }
    }

    if let Some(selection) = lookup_mapping(prefs, roster, key) {
        return match selection {
            VoiceSelection::Voice(id) => Some(id),
            VoiceSelection::AutoFemale => {
                pick_from_pool(&prefs.female_pool, key.as_str()).map(str::to_string)
            }
            VoiceSelection::AutoMale => {
                pick_from_pool(&prefs.male_pool, key.as_str()).map(str::to_string)
            }
        };
    }

    if let Some(entry) = roster_entry(roster, key) {
        if entry.has_voice_assets {
            return Some(entry.voice_identity());
        }
        if entry.has_model {
            return Some(entry.voice_identity());
        }
    }

    if name.is_some_and(|n| is_male_name(n, male_markers)) && !prefs.male_pool.is_empty() {
        return pick_from_pool(&prefs.male_pool, key.as_str()).map(str::to_string);
    }
    if !prefs.female_pool.is_empty() {
        return pick_from_pool(&prefs.female_pool, key.as_str()).map(str::to_string);
    }

    pick_from_pool(&prefs.legacy_pool, key.as_str()).map(str::to_string)
}

fn resolve_narrator(prefs: &Preferences) -> Option<String> {
    prefs
        .narrator_voice
        .clone()
        .or_else(|| prefs.female_pool.first().cloned())
        .or_else(|| prefs.legacy_pool.first().cloned())
}

/// Direct mapping lookup, with alias inheritance: a `name:` key without its
/// own entry borrows the mapping of a roster character showing the same
/// display name.
fn lookup_mapping(
    prefs: &Preferences,
    roster: &[RosterEntry],
    key: &SpeakerKey,
) -> Option<VoiceSelection> {
    if let Some(selection) = prefs.voice_mappings.get(key) {
        return Some(selection.clone());
    }
    let alias = key.alias_name()?;
    roster
        .iter()
        .filter(|e| e.name == alias)
        .find_map(|e| prefs.voice_mappings.get(&SpeakerKey::stable(&e.char_id)))
        .cloned()
}

fn roster_entry<'a>(roster: &'a [RosterEntry], key: &SpeakerKey) -> Option<&'a RosterEntry> {
    match key.alias_name() {
        Some(alias) => roster.iter().find(|e| e.name == alias),
        None => roster.iter().find(|e| e.char_id == key.as_str()),
    }
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c == '?' || c == '？')
}

fn is_male_name(name: &str, markers: &[String]) -> bool {
    let lower = name.to_lowercase();
    markers.iter().any(|m| lower.contains(&m.to_lowercase()))
}
