use serde::{Deserialize, Serialize};
use url::Url;

/// What a response body holds, judged from its `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentKind {
    Mp3,
    Aac,
    AppleM3u8,
    LegacyM3u8,
    Pls,
    Unknown,
}

const MP3_TYPES: &[&str] = &["audio/mpeg", "audio/mp3", "mp3"];
const AAC_TYPES: &[&str] = &[
    "audio/mp4",
    "video/mp4",
    "video/mp2t",
    "audio/aac",
    "audio/aacp",
    "audio/x-aac",
    "audio/x-hx-aac-adts",
];

impl ContentKind {
    /// Classify a response. Parameters after `;` and letter case are ignored.
    /// Opaque octet streams are guessed from the URL path.
    pub fn classify(content_type: Option<&str>, url: &Url) -> Self {
        let Some(raw) = content_type else {
            return ContentKind::Unknown;
        };
        let mime = raw
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match mime.as_str() {
            "audio/x-mpegurl" | "application/x-mpegurl" => ContentKind::LegacyM3u8,
            "application/vnd.apple.mpegurl" => ContentKind::AppleM3u8,
            "audio/x-scpls" => ContentKind::Pls,
            "binary/octet-stream" | "application/octet-stream" => {
                if url.path().to_ascii_lowercase().ends_with(".aac") {
                    ContentKind::Aac
                } else {
                    ContentKind::Mp3
                }
            }
            m if MP3_TYPES.contains(&m) => ContentKind::Mp3,
            m if AAC_TYPES.contains(&m) => ContentKind::Aac,
            _ => ContentKind::Unknown,
        }
    }

    pub fn is_playlist(self) -> bool {
        matches!(
            self,
            ContentKind::AppleM3u8 | ContentKind::LegacyM3u8 | ContentKind::Pls
        )
    }

    pub fn is_media(self) -> bool {
        matches!(self, ContentKind::Mp3 | ContentKind::Aac)
    }

    /// Name carried in `CustomData::content_type`.
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Mp3 => "mp3",
            ContentKind::Aac => "aac",
            ContentKind::AppleM3u8 => "appleM3u8",
            ContentKind::LegacyM3u8 => "legacyM3u8",
            ContentKind::Pls => "pls",
            ContentKind::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(ct: &str, url: &str) -> ContentKind {
        ContentKind::classify(Some(ct), &Url::parse(url).unwrap())
    }

    #[test]
    fn playlist_types_ignore_parameters_and_case() {
        let u = "http://radio.example/live";
        assert_eq!(kind("audio/x-mpegurl; charset=utf-8", u), ContentKind::LegacyM3u8);
        assert_eq!(kind("Application/X-MpegURL", u), ContentKind::LegacyM3u8);
        assert_eq!(kind("application/vnd.apple.mpegurl", u), ContentKind::AppleM3u8);
        assert_eq!(kind("audio/x-scpls", u), ContentKind::Pls);
    }

    #[test]
    fn media_families() {
        let u = "http://cdn.example/a";
        assert_eq!(kind("audio/mpeg", u), ContentKind::Mp3);
        assert_eq!(kind("mp3", u), ContentKind::Mp3);
        assert_eq!(kind("video/MP2T", u), ContentKind::Aac);
        assert_eq!(kind("audio/x-hx-aac-adts", u), ContentKind::Aac);
        assert_eq!(kind("text/html", u), ContentKind::Unknown);
    }

    #[test]
    fn octet_stream_guesses_from_path() {
        assert_eq!(
            kind("binary/octet-stream", "http://cdn.example/song.AAC?sig=1"),
            ContentKind::Aac
        );
        assert_eq!(
            kind("application/octet-stream", "http://cdn.example/song.bin"),
            ContentKind::Mp3
        );
    }

    #[test]
    fn missing_header_is_unknown() {
        let url = Url::parse("http://cdn.example/").unwrap();
        assert_eq!(ContentKind::classify(None, &url), ContentKind::Unknown);
        assert!(!ContentKind::Unknown.is_playlist());
        assert!(ContentKind::Pls.is_playlist());
    }
}
