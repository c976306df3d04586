// src/ingest/normalize.rs
//! Pure transformation from vendor alerts to [`NormalizedAlert`].

use once_cell::sync::OnceCell;
use regex::Regex;

use crate::ingest::types::{AlertLocation, NormalizedAlert, RawAlert};

const METERS_PER_MILE: f64 = 1_609.344;
const MAX_TEXT_CHARS: usize = 4_000;

/// Normalize text: decode entities, strip tags, collapse whitespace, cap length.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[a-z][^>]*>").expect("tag regex"));
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Collapse whitespace
    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("ws regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 4) Length cap
    if out.chars().count() > MAX_TEXT_CHARS {
        out = out.chars().take(MAX_TEXT_CHARS).collect();
    }
    out
}

fn non_empty(s: &str) -> Option<String> {
    let t = normalize_text(s);
    (!t.is_empty()).then_some(t)
}

fn names<'a>(it: impl Iterator<Item = &'a str>) -> Vec<String> {
    it.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn location(raw: &RawAlert) -> Option<AlertLocation> {
    let loc = raw.estimated_event_location.as_ref()?;
    let (lat, lng) = match loc.coordinates.as_slice() {
        [lat, lng, ..] if lat.is_finite() && lng.is_finite() => (*lat, *lng),
        _ => return None,
    };
    Some(AlertLocation {
        address: normalize_text(&loc.name),
        latitude: lat,
        longitude: lng,
        confidence_radius_meters: loc
            .probability_radius
            .filter(|r| r.is_finite() && *r >= 0.0)
            .map(|miles| miles * METERS_PER_MILE),
    })
}

fn sub_headline(raw: &RawAlert) -> Option<String> {
    let sh = raw.sub_headline.as_ref()?;
    match (non_empty(&sh.title), non_empty(&sh.content)) {
        (Some(t), Some(c)) => Some(format!("{t}: {c}")),
        (Some(t), None) => Some(t),
        (None, Some(c)) => Some(c),
        (None, None) => None,
    }
}

/// Build the vendor-neutral record for one raw alert.
pub fn normalize_alert(backend_name: &str, raw: &RawAlert) -> NormalizedAlert {
    let post = raw.public_post.as_ref();
    NormalizedAlert {
        backend_name: backend_name.to_string(),
        alert_id: raw.alert_id.trim().to_string(),
        headline: normalize_text(&raw.headline),
        alert_type: raw
            .alert_type
            .as_ref()
            .map(|t| t.name.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "Alert".to_string()),
        event_time: raw.event_time(),
        location: location(raw),
        sub_headline: sub_headline(raw),
        topics: names(raw.topics.iter().map(|t| t.name.as_str())),
        alert_lists: names(raw.lists.iter().map(|l| l.name.as_str())),
        linked_alerts: names(raw.linked_alerts.iter().map(|l| l.parent_alert_id.as_str())),
        source_text: post.and_then(|p| non_empty(&p.text)),
        translated_text: post.and_then(|p| non_empty(&p.translated_text)),
        public_source_url: post
            .map(|p| p.link.trim().to_string())
            .filter(|s| !s.is_empty()),
        media_urls: post
            .map(|p| names(p.media.iter().map(|m| m.url.as_str())))
            .unwrap_or_default(),
        alert_url: raw
            .first_alert_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    }
}
