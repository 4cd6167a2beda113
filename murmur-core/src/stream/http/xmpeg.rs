//! Legacy `x-mpegurl` redirect lists: a short body of newline-separated
//! stream URLs, no tags.

use tracing::info;
use url::Url;

use super::m3u8::resolve;
use super::playlist::{Playlist, PlaylistEntry};
use crate::error::PlaylistError;

/// Largest redirect-list body accepted.
pub const MAX_XMPEG_BODY: usize = 4 * 1024;

pub fn parse(body: &[u8], base: &Url) -> Result<Playlist, PlaylistError> {
    if body.len() > MAX_XMPEG_BODY {
        return Err(PlaylistError::TooLarge {
            limit: MAX_XMPEG_BODY,
        });
    }
    let text = std::str::from_utf8(body).map_err(|_| PlaylistError::Encoding)?;

    let mut playlist = Playlist::new(base.clone());
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        playlist.push(PlaylistEntry::new(resolve(base, line)?));
    }
    if playlist.is_empty() {
        return Err(PlaylistError::Empty);
    }
    playlist.set_complete(true);
    info!(source = %base, links = playlist.len(), "x-mpegurl list parsed");
    Ok(playlist)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://radio.example/tune.m3u").unwrap()
    }

    #[test]
    fn one_url_per_line() {
        let p = parse(b"http://a.example/1\r\nhttp://b.example/2\n", &base()).unwrap();
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn oversized_body_is_rejected() {
        let body = vec![b'a'; MAX_XMPEG_BODY + 1];
        assert!(matches!(
            parse(&body, &base()),
            Err(PlaylistError::TooLarge { limit: MAX_XMPEG_BODY })
        ));
    }

    #[test]
    fn non_utf8_is_rejected() {
        assert!(matches!(
            parse(&[0xff, 0xfe, b'\n'], &base()),
            Err(PlaylistError::Encoding)
        ));
    }
}
