//! M3U8 playlist parsing and synthesis
//!
//! The relay consumes upstream playlists (master and media) and serves a
//! rewritten local media playlist whose segment URLs point back at the
//! relay. Only the HLS v3 tag set is involved; parsing is line-oriented.

use url::Url;

use crate::error::{RelayError, Result};

use super::ring::Segment;

/// One variant stream advertised by a master playlist.
#[derive(Debug, Clone)]
pub struct Variant {
    /// URI as written in the playlist (possibly relative)
    pub uri: String,
    /// BANDWIDTH attribute, 0 when absent
    pub bandwidth: u64,
    /// The raw `#EXT-X-STREAM-INF` attribute line, used for preference
    /// matching against resolution/codec/name strings
    pub attributes: String,
}

/// One media-playlist entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaEntry {
    /// URI as written in the playlist (possibly relative)
    pub uri: String,
    /// EXTINF duration in seconds
    pub duration: f64,
    /// Whether `#EXT-X-DISCONTINUITY` preceded this entry
    pub discontinuity: bool,
}

/// Parsed upstream media playlist.
#[derive(Debug, Clone, Default)]
pub struct MediaPlaylist {
    pub target_duration: Option<f64>,
    pub media_sequence: Option<u64>,
    pub entries: Vec<MediaEntry>,
}

/// Whether a playlist body is a master playlist.
pub fn is_master(text: &str) -> bool {
    text.lines()
        .any(|l| l.trim_start().starts_with("#EXT-X-STREAM-INF"))
}

/// Parse the variant list out of a master playlist.
pub fn parse_master(text: &str) -> Vec<Variant> {
    let mut variants = Vec::new();
    let mut pending: Option<String> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            pending = Some(attrs.to_string());
        } else if !line.starts_with('#') {
            if let Some(attributes) = pending.take() {
                let bandwidth = attribute_value(&attributes, "BANDWIDTH")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                variants.push(Variant {
                    uri: line.to_string(),
                    bandwidth,
                    attributes,
                });
            }
        }
    }

    variants
}

/// Pick a variant: any whose attributes or URI case-insensitively contain
/// the preference string wins; otherwise the highest bandwidth.
pub fn select_variant<'a>(
    variants: &'a [Variant],
    preference: Option<&str>,
) -> Option<&'a Variant> {
    if let Some(pref) = preference.filter(|p| !p.is_empty()) {
        let pref = pref.to_ascii_lowercase();
        if let Some(found) = variants.iter().find(|v| {
            v.attributes.to_ascii_lowercase().contains(&pref)
                || v.uri.to_ascii_lowercase().contains(&pref)
        }) {
            return Some(found);
        }
    }
    variants.iter().max_by_key(|v| v.bandwidth)
}

/// Parse a media playlist body.
pub fn parse_media(text: &str) -> MediaPlaylist {
    let mut playlist = MediaPlaylist::default();
    let mut pending_duration: Option<f64> = None;
    let mut pending_discontinuity = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(v) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            playlist.target_duration = v.trim().parse().ok();
        } else if let Some(v) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            playlist.media_sequence = v.trim().parse().ok();
        } else if line.starts_with("#EXT-X-DISCONTINUITY") {
            // Covers both DISCONTINUITY and DISCONTINUITY-SEQUENCE; only the
            // per-segment marker matters for the next entry
            if !line.starts_with("#EXT-X-DISCONTINUITY-SEQUENCE") {
                pending_discontinuity = true;
            }
        } else if let Some(v) = line.strip_prefix("#EXTINF:") {
            let duration = v.split(',').next().and_then(|d| d.trim().parse().ok());
            pending_duration = duration;
        } else if !line.starts_with('#') {
            playlist.entries.push(MediaEntry {
                uri: line.to_string(),
                duration: pending_duration.take().unwrap_or(0.0),
                discontinuity: std::mem::take(&mut pending_discontinuity),
            });
        }
    }

    playlist
}

/// Resolve a playlist URI against the URL it was served from.
pub fn resolve(base: &Url, uri: &str) -> Result<Url> {
    if let Ok(absolute) = Url::parse(uri) {
        return Ok(absolute);
    }
    base.join(uri).map_err(RelayError::from)
}

/// Render the local media playlist for the current window.
///
/// `base_path` is the URL prefix the segment names are appended to, without
/// a trailing slash (e.g. `/live/hls/room1/viewer-1`).
pub fn render_local(
    segments: &[Segment],
    seq_start: u64,
    target_duration: f64,
    sticky_discontinuity: bool,
    base_path: &str,
) -> String {
    if segments.is_empty() {
        // A valid but minimal playlist keeps players from erroring out
        return "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:0\n"
            .to_string();
    }

    let mut out = String::with_capacity(256 + segments.len() * 64);
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");
    out.push_str(&format!(
        "#EXT-X-TARGETDURATION:{}\n",
        (target_duration + 0.5) as u64
    ));
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{seq_start}\n"));
    if sticky_discontinuity {
        out.push_str("#EXT-X-DISCONTINUITY-SEQUENCE:1\n");
    }

    for segment in segments {
        if segment.discontinuity {
            out.push_str("#EXT-X-DISCONTINUITY\n");
        }
        out.push_str(&format!("#EXTINF:{:.3},\n", segment.duration));
        out.push_str(&format!("{base_path}/{}\n", segment.local_name));
    }

    out
}

fn attribute_value<'a>(attributes: &'a str, name: &str) -> Option<&'a str> {
    for pair in attributes.split(',') {
        let mut kv = pair.splitn(2, '=');
        if kv.next()?.trim() == name {
            return kv.next().map(|v| v.trim().trim_matches('"'));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Instant;

    const MASTER: &str = "\
#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720
hd720/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080
hd1080/index.m3u8
";

    const MEDIA: &str = "\
#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:100
#EXTINF:5.800,
seg/100.ts
#EXTINF:6.000,
seg/101.ts
#EXT-X-DISCONTINUITY
#EXTINF:4.200,
seg/102.ts
";

    fn seg(seq: u64, duration: f64, discontinuity: bool) -> Segment {
        Segment {
            seq,
            uri: format!("http://up.example/seg/{seq}.ts"),
            local_name: format!("{seq}.ts"),
            data: Bytes::new(),
            duration,
            discontinuity,
            fetched_at: Instant::now(),
        }
    }

    #[test]
    fn test_is_master() {
        assert!(is_master(MASTER));
        assert!(!is_master(MEDIA));
    }

    #[test]
    fn test_parse_master() {
        let variants = parse_master(MASTER);
        assert_eq!(variants.len(), 3);
        assert_eq!(variants[0].uri, "low/index.m3u8");
        assert_eq!(variants[0].bandwidth, 800_000);
        assert_eq!(variants[2].bandwidth, 5_000_000);
    }

    #[test]
    fn test_select_variant_by_preference() {
        let variants = parse_master(MASTER);

        let chosen = select_variant(&variants, Some("720")).unwrap();
        assert_eq!(chosen.uri, "hd720/index.m3u8");

        // Preference matches the resolution attribute case-insensitively
        let chosen = select_variant(&variants, Some("1280X720")).unwrap();
        assert_eq!(chosen.uri, "hd720/index.m3u8");
    }

    #[test]
    fn test_select_variant_falls_back_to_bandwidth() {
        let variants = parse_master(MASTER);

        let chosen = select_variant(&variants, Some("4k")).unwrap();
        assert_eq!(chosen.uri, "hd1080/index.m3u8");

        let chosen = select_variant(&variants, None).unwrap();
        assert_eq!(chosen.uri, "hd1080/index.m3u8");
    }

    #[test]
    fn test_select_variant_empty() {
        assert!(select_variant(&[], Some("720")).is_none());
    }

    #[test]
    fn test_parse_media() {
        let playlist = parse_media(MEDIA);
        assert_eq!(playlist.target_duration, Some(6.0));
        assert_eq!(playlist.media_sequence, Some(100));
        assert_eq!(playlist.entries.len(), 3);

        assert_eq!(playlist.entries[0].uri, "seg/100.ts");
        assert!((playlist.entries[0].duration - 5.8).abs() < 1e-9);
        assert!(!playlist.entries[0].discontinuity);

        assert!(playlist.entries[2].discontinuity);
        assert!((playlist.entries[2].duration - 4.2).abs() < 1e-9);
    }

    #[test]
    fn test_parse_media_without_sequence() {
        let body = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\na.ts\n";
        let playlist = parse_media(body);
        assert_eq!(playlist.media_sequence, None);
        assert_eq!(playlist.entries.len(), 1);
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let base = Url::parse("http://up.example/live/index.m3u8").unwrap();

        let rel = resolve(&base, "seg/100.ts").unwrap();
        assert_eq!(rel.as_str(), "http://up.example/live/seg/100.ts");

        let abs = resolve(&base, "http://cdn.example/seg/100.ts").unwrap();
        assert_eq!(abs.as_str(), "http://cdn.example/seg/100.ts");
    }

    #[test]
    fn test_render_local_window() {
        let segments = vec![
            seg(102, 5.8, false),
            seg(103, 6.0, false),
            seg(104, 4.2, false),
        ];
        let playlist = render_local(&segments, 102, 5.8, false, "/live/hls/room1/c1");

        let expected = "\
#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:102
#EXTINF:5.800,
/live/hls/room1/c1/102.ts
#EXTINF:6.000,
/live/hls/room1/c1/103.ts
#EXTINF:4.200,
/live/hls/room1/c1/104.ts
";
        assert_eq!(playlist, expected);
    }

    #[test]
    fn test_render_local_discontinuity() {
        let segments = vec![seg(10, 6.0, false), seg(11, 6.0, true)];
        let playlist = render_local(&segments, 10, 6.0, true, "/live/hls/r/c");

        assert!(playlist.contains("#EXT-X-DISCONTINUITY-SEQUENCE:1\n"));
        assert!(playlist.contains("#EXT-X-DISCONTINUITY\n#EXTINF:6.000,\n/live/hls/r/c/11.ts\n"));
    }

    #[test]
    fn test_render_local_empty() {
        let playlist = render_local(&[], 0, 0.0, false, "/live/hls/r/c");
        assert_eq!(
            playlist,
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:0\n"
        );
    }

    #[test]
    fn test_attribute_value() {
        let attrs = r#"BANDWIDTH=2500000,RESOLUTION=1280x720,CODECS="avc1.4d401f,mp4a.40.2""#;
        assert_eq!(attribute_value(attrs, "BANDWIDTH"), Some("2500000"));
        assert_eq!(attribute_value(attrs, "RESOLUTION"), Some("1280x720"));
        assert_eq!(attribute_value(attrs, "MISSING"), None);
    }
}
