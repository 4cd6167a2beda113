//! PLS (`audio/x-scpls`) parsing.

use std::collections::BTreeMap;

use tracing::{info, warn};
use url::Url;

use super::m3u8::resolve;
use super::playlist::{Playlist, PlaylistEntry};
use crate::error::PlaylistError;

#[derive(Default)]
struct Slot {
    file: Option<String>,
    length_s: Option<i64>,
    title: Option<String>,
}

/// Parse a PLS body. Entries come out in `File<n>` order; `Length<n>=-1`
/// marks an endless stream and leaves the duration unknown.
pub fn parse(body: &str, base: &Url) -> Result<Playlist, PlaylistError> {
    let mut slots: BTreeMap<u32, Slot> = BTreeMap::new();
    let mut declared = None;

    for (idx, raw) in body.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty()
            || line.starts_with(';')
            || line.starts_with('#')
            || line.eq_ignore_ascii_case("[playlist]")
        {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(PlaylistError::Malformed {
                line: idx + 1,
                reason: format!("expected key=value, got '{line}'"),
            });
        };
        let key = key.trim();
        let value = value.trim();

        if key.eq_ignore_ascii_case("NumberOfEntries") {
            declared = value.parse::<usize>().ok();
        } else if key.eq_ignore_ascii_case("Version") {
            continue;
        } else if let Some((field, n)) = split_indexed(key) {
            let slot = slots.entry(n).or_default();
            match field {
                "file" => slot.file = Some(value.to_string()),
                "length" => slot.length_s = value.parse().ok(),
                "title" => slot.title = Some(value.to_string()),
                _ => {}
            }
        }
    }

    let mut playlist = Playlist::new(base.clone());
    for (n, slot) in slots {
        let Some(file) = slot.file else {
            warn!(entry = n, "pls entry without File line");
            continue;
        };
        playlist.push(PlaylistEntry {
            uri: resolve(base, &file)?,
            played: false,
            duration_ms: slot
                .length_s
                .and_then(|s| u64::try_from(s).ok())
                .and_then(|s| s.checked_mul(1000)),
            discontinuity: false,
            title: slot.title,
        });
    }
    playlist.set_complete(true);

    if let Some(declared) = declared.filter(|d| *d != playlist.len()) {
        warn!(declared, parsed = playlist.len(), "pls NumberOfEntries mismatch");
    }
    if playlist.is_empty() {
        return Err(PlaylistError::Empty);
    }
    info!(source = %base, entries = playlist.len(), "pls parsed");
    Ok(playlist)
}

/// `File3` -> `("file", 3)`.
fn split_indexed(key: &str) -> Option<(&'static str, u32)> {
    let digits = key.find(|c: char| c.is_ascii_digit())?;
    let (name, index) = key.split_at(digits);
    let index = index.parse().ok()?;
    let field = match name.to_ascii_lowercase().as_str() {
        "file" => "file",
        "length" => "length",
        "title" => "title",
        _ => return None,
    };
    Some((field, index))
}
