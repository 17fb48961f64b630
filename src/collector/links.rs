//! Link post-processing: scheme gating, exact-text dedup, config-name
//! canonicalization for the per-panel disable filters, and the optional
//! usage-ratio suffix appended to config names.

use std::collections::HashSet;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::panels::has_allowed_scheme;

/// Schemes whose display name can carry the ratio suffix. Trojan links are
/// excluded: several client apps mangle rewritten trojan fragments.
const RATIO_NAME_SCHEMES: [&str; 3] = ["vless://", "vmess://", "ss://"];

static USAGE_ANNOTATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*\d+(?:\.\d+)?\s*[KMGT]?B/\d+(?:\.\d+)?\s*[KMGT]?B")
        .unwrap()
});
static OWNER_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\u{1F464}.*").unwrap());
static TAG_PARENTHETICAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\([a-zA-Z0-9_-]{3,}\)").unwrap());
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Decode a possibly-unpadded base64 payload, standard or url-safe
/// alphabet, into lossy UTF-8 text.
pub fn b64_decode_lenient(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut padded = trimmed.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    let bytes = STANDARD
        .decode(padded.as_bytes())
        .or_else(|_| URL_SAFE.decode(padded.as_bytes()))
        .ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Normalize a config display name so the same upstream config matches the
/// disable filter across subscribers: per-user usage annotations, owner
/// suffixes and short identifier parentheticals vary per link, the rest of
/// the name does not.
pub fn canonicalize_name(name: &str) -> String {
    let decoded = urlencoding::decode(name)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| name.to_string());
    let nm = decoded.trim();
    let nm = USAGE_ANNOTATION.replace_all(nm, "");
    let nm = OWNER_SUFFIX.replace_all(&nm, "");
    let nm = TAG_PARENTHETICAL.replace_all(&nm, "");
    let nm = WHITESPACE_RUN.replace_all(&nm, " ");
    let nm = nm.trim();
    nm.chars().take(255).collect()
}

/// Canonicalized display name of a link, taken from its URI fragment.
/// Links without a fragment have no name.
pub fn extract_name(link: &str) -> String {
    match link.find('#') {
        Some(i) => canonicalize_name(&link[i + 1..]),
        None => String::new(),
    }
}

/// Trim stray quoting, drop lines outside the allowed schemes and collapse
/// exact duplicates, keeping first-seen order.
pub fn filter_dedupe<I, S>(links: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for link in links {
        let trimmed = link
            .as_ref()
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        if !has_allowed_scheme(&trimmed) {
            continue;
        }
        if seen.insert(trimmed.clone()) {
            out.push(trimmed);
        }
    }
    out
}

/// Remove links whose canonicalized name or 1-based position the panel
/// owner has disabled. Ordinals index the list left over after the name
/// filter has run.
pub fn apply_disabled_filters(
    links: Vec<String>,
    disabled_names: &HashSet<String>,
    disabled_ordinals: &HashSet<usize>,
) -> Vec<String> {
    let links: Vec<String> = if disabled_names.is_empty() {
        links
    } else {
        links
            .into_iter()
            .filter(|l| !disabled_names.contains(&extract_name(l)))
            .collect()
    };
    if disabled_ordinals.is_empty() {
        return links;
    }
    links
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| !disabled_ordinals.contains(&(idx + 1)))
        .map(|(_, l)| l)
        .collect()
}

fn format_ratio(ratio: f64) -> String {
    format!("{ratio}X")
}

/// Append the panel's usage ratio to a link's display name so subscribers
/// can see that traffic on this config counts multiplied. Ratio 1.0 and
/// schemes outside [`RATIO_NAME_SCHEMES`] pass through untouched, as does
/// anything that fails to parse.
pub fn maybe_append_ratio_to_name(link: &str, ratio: f64, enabled: bool) -> String {
    if !enabled || (ratio - 1.0).abs() <= 1e-9 {
        return link.to_string();
    }
    let lower = link.to_ascii_lowercase();
    if !RATIO_NAME_SCHEMES.iter().any(|s| lower.starts_with(s)) {
        return link.to_string();
    }
    let ratio_text = format_ratio(ratio);

    if lower.starts_with("vmess://") {
        return append_ratio_vmess(link, &ratio_text).unwrap_or_else(|| link.to_string());
    }

    let Some(i) = link.find('#') else {
        return link.to_string();
    };
    let Ok(name) = urlencoding::decode(&link[i + 1..]) else {
        return link.to_string();
    };
    if name.trim_end().ends_with(&ratio_text) {
        return link.to_string();
    }
    let renamed = format!("{name} {ratio_text}");
    format!("{}{}", &link[..=i], urlencoding::encode(&renamed))
}

/// Vmess links carry their name inside a base64 JSON envelope under "ps".
/// The rewrite preserves the original alphabet and padding style.
fn append_ratio_vmess(link: &str, ratio_text: &str) -> Option<String> {
    let b64 = &link["vmess://".len()..];
    if b64.is_empty() {
        return None;
    }
    let is_urlsafe = b64.contains('-') || b64.contains('_');
    let mut padded = b64.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    let raw = if is_urlsafe {
        URL_SAFE.decode(padded.as_bytes()).ok()?
    } else {
        STANDARD.decode(padded.as_bytes()).ok()?
    };
    let mut obj: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    let ps = obj.get("ps")?.as_str()?;
    if ps.trim_end().ends_with(ratio_text) {
        return Some(link.to_string());
    }
    let renamed = format!("{ps} {ratio_text}");
    obj["ps"] = serde_json::Value::String(renamed);
    let new_raw = serde_json::to_string(&obj).ok()?;
    let mut new_b64 = if is_urlsafe {
        URL_SAFE.encode(new_raw.as_bytes())
    } else {
        STANDARD.encode(new_raw.as_bytes())
    };
    if !b64.contains('=') {
        new_b64 = new_b64.trim_end_matches('=').to_string();
    }
    Some(format!("vmess://{new_b64}"))
}
