//! HLS (`#EXTM3U`) and plain URL-per-line m3u parsing.
//!
//! In an extended playlist only URIs introduced by `#EXTINF` or
//! `#EXT-X-STREAM-INF` become entries. Without the `#EXTM3U` header every
//! non-comment line is an entry and the list is treated as finite.

use tracing::{debug, info};
use url::Url;

use super::playlist::{Playlist, PlaylistEntry};
use crate::error::PlaylistError;

/// Body budget when the server sends no `Content-Length`.
pub const DEFAULT_PLAYLIST_LEN: usize = 16 * 1024;

const EXTM3U: &str = "#EXTM3U";
const EXTINF: &str = "#EXTINF:";
const STREAM_INF: &str = "#EXT-X-STREAM-INF";
const ENDLIST: &str = "#EXT-X-ENDLIST";
const TARGET_DURATION: &str = "#EXT-X-TARGETDURATION:";
const MEDIA_SEQUENCE: &str = "#EXT-X-MEDIA-SEQUENCE:";
const DISCONTINUITY: &str = "#EXT-X-DISCONTINUITY";

/// `true` if `body` starts with the extended-m3u header.
pub fn is_extended(body: &str) -> bool {
    first_line(body).is_some_and(|l| l.starts_with(EXTM3U))
}

fn first_line(body: &str) -> Option<&str> {
    body.lines()
        .map(|l| l.trim_start_matches('\u{feff}').trim())
        .find(|l| !l.is_empty())
}

pub fn parse(body: &str, base: &Url) -> Result<Playlist, PlaylistError> {
    if first_line(body).is_none() {
        return Err(PlaylistError::Empty);
    }
    let playlist = if is_extended(body) {
        parse_extended(body, base)?
    } else {
        parse_plain(body, base)?
    };
    if playlist.is_empty() {
        return Err(PlaylistError::Empty);
    }
    info!(
        source = %base,
        entries = playlist.len(),
        complete = playlist.is_complete(),
        "m3u8 parsed"
    );
    Ok(playlist)
}

pub(crate) fn resolve(base: &Url, uri: &str) -> Result<Url, PlaylistError> {
    base.join(uri).map_err(|e| PlaylistError::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Default)]
struct Pending {
    expect_uri: bool,
    duration_ms: Option<u64>,
    title: Option<String>,
    discontinuity: bool,
}

fn parse_extended(body: &str, base: &Url) -> Result<Playlist, PlaylistError> {
    let mut playlist = Playlist::new(base.clone());
    let mut pending = Pending::default();
    let mut saw_variant = false;

    for (idx, raw) in body.lines().enumerate() {
        let line = raw.trim();
        let line_no = idx + 1;
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix(EXTINF) {
            let (duration, title) = rest.split_once(',').unwrap_or((rest, ""));
            let secs: f64 = duration.trim().parse().map_err(|_| PlaylistError::Malformed {
                line: line_no,
                reason: format!("bad #EXTINF duration '{duration}'"),
            })?;
            pending.expect_uri = true;
            pending.duration_ms = Some((secs.max(0.0) * 1000.0) as u64);
            let title = title.trim();
            pending.title = (!title.is_empty()).then(|| title.to_string());
        } else if line.starts_with(STREAM_INF) {
            pending.expect_uri = true;
            saw_variant = true;
        } else if line.starts_with(ENDLIST) {
            playlist.set_complete(true);
            break;
        } else if let Some(rest) = line.strip_prefix(TARGET_DURATION) {
            if let Ok(secs) = rest.trim().parse() {
                playlist.set_target_duration_s(secs);
            }
        } else if let Some(rest) = line.strip_prefix(MEDIA_SEQUENCE) {
            if let Ok(seq) = rest.trim().parse() {
                playlist.set_media_sequence(seq);
            }
        } else if line.starts_with(DISCONTINUITY) {
            pending.discontinuity = true;
        } else if line.starts_with('#') {
            // #EXTM3U, #EXT-X-VERSION and tags we do not act on.
        } else if pending.expect_uri {
            let p = std::mem::take(&mut pending);
            playlist.push(PlaylistEntry {
                uri: resolve(base, line)?,
                played: false,
                duration_ms: p.duration_ms,
                discontinuity: p.discontinuity,
                title: p.title,
            });
        } else {
            debug!(line = line_no, "uri without #EXTINF ignored");
        }
    }

    // A variant list never grows; only media lists can be live.
    if saw_variant {
        playlist.set_complete(true);
    }
    Ok(playlist)
}

fn parse_plain(body: &str, base: &Url) -> Result<Playlist, PlaylistError> {
    let mut playlist = Playlist::new(base.clone());
    for line in body.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        playlist.push(PlaylistEntry::new(resolve(base, line)?));
    }
    playlist.set_complete(true);
    Ok(playlist)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://cdn.example/radio/live/index.m3u8").unwrap()
    }

    #[test]
    fn media_playlist_with_durations_and_endlist() {
        let body = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n\
                    #EXT-X-MEDIA-SEQUENCE:42\n#EXTINF:9.5,\nseg42.ts\n\
                    #EXT-X-DISCONTINUITY\n#EXTINF:10,Ad\n/ads/seg1.ts\n#EXT-X-ENDLIST\n";
        let p = parse(body, &base()).unwrap();
        assert!(p.is_complete());
        assert_eq!(p.target_duration_s(), Some(10));
        assert_eq!(p.media_sequence(), Some(42));

        let entries: Vec<_> = p.entries().cloned().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].uri.as_str(), "https://cdn.example/radio/live/seg42.ts");
        assert_eq!(entries[0].duration_ms, Some(9_500));
        assert!(!entries[0].discontinuity);
        assert_eq!(entries[1].uri.as_str(), "https://cdn.example/ads/seg1.ts");
        assert!(entries[1].discontinuity);
        assert_eq!(entries[1].title.as_deref(), Some("Ad"));
    }

    #[test]
    fn live_playlist_is_not_complete() {
        let body = "#EXTM3U\r\n#EXTINF:6,\r\na.aac\r\n#EXTINF:6,\r\nb.aac\r\n";
        let p = parse(body, &base()).unwrap();
        assert!(!p.is_complete());
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn variant_playlist_resolves_stream_uris() {
        let body = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=64000\nlow/index.m3u8\n\
                    #EXT-X-STREAM-INF:BANDWIDTH=128000\nhttps://other.example/hi.m3u8\n";
        let p = parse(body, &base()).unwrap();
        let uris: Vec<_> = p.entries().map(|e| e.uri.to_string()).collect();
        assert_eq!(
            uris,
            [
                "https://cdn.example/radio/live/low/index.m3u8",
                "https://other.example/hi.m3u8"
            ]
        );
        assert!(p.is_complete());
    }

    #[test]
    fn untagged_uris_in_extended_list_are_skipped() {
        let body = "#EXTM3U\nstray.ts\n#EXTINF:4,\nreal.ts\n";
        let p = parse(body, &base()).unwrap();
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn plain_list_takes_every_uri() {
        let body = "# comment\nhttp://a.example/1.mp3\n\nhttp://a.example/2.mp3\n";
        let p = parse(body, &base()).unwrap();
        assert_eq!(p.len(), 2);
        assert!(p.is_complete());
    }

    #[test]
    fn bad_extinf_reports_line() {
        let err = parse("#EXTM3U\n#EXTINF:abc,\nx.ts\n", &base()).unwrap_err();
        assert!(matches!(err, PlaylistError::Malformed { line: 2, .. }));
    }

    #[test]
    fn empty_bodies_are_rejected() {
        assert!(matches!(parse("  \n\n", &base()), Err(PlaylistError::Empty)));
        assert!(matches!(parse("#EXTM3U\n", &base()), Err(PlaylistError::Empty)));
    }
}
