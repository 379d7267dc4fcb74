// src/registry.rs
//
// The URL registry: parses the URL list file into monitored rooms, keeps the
// on-disk file canonical, and feeds the supervisor pool a stream of
// add/comment/remove events.
//
// ─ Line grammar ─────────────────────────────────────────────────────────────
//
//   [quality,] url [, label]
//
//   * separator is `,` or the fullwidth `，`
//   * a leading `#` pauses the entry in place (still listed, never recorded)
//   * lines shorter than 20 characters are ignored as noise
//   * quality tokens: 原畫 藍光 超清 高清 標清 流暢 (simplified and English
//     aliases accepted); a missing or unknown quality means Original
//
// The registry re-scans the file every tick, diffs against the live set, and
// rewrites the file at most once per scan: unknown hosts get commented out,
// duplicate canonical URLs lose their later lines, and resolved anchor names
// are appended as `,主播: <name>` labels.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ConfigStore, Quality};
use crate::platform::{self, Region, CUSTOM_TAG};

/// Lines shorter than this are treated as noise, not entries.
const MIN_ENTRY_CHARS: usize = 20;

/// Default cadence of the rescan loop.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(3);

// ─── Room ───────────────────────────────────────────────────────────────────

/// One monitored room, as published to its supervisor.
///
/// Shared read-only after publication; all mutation goes through the registry
/// and surfaces as a remove + add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    /// Canonical URL — the unique key.
    pub url: String,
    pub quality: Quality,
    /// User-supplied display name overriding the resolved anchor.
    pub alias: Option<String>,
    pub platform_tag: String,
    pub platform_display: String,
    pub overseas: bool,
}

impl Room {
    pub fn host(&self) -> &str {
        self.url
            .split("://")
            .nth(1)
            .unwrap_or(&self.url)
            .split('/')
            .next()
            .unwrap_or("")
    }
}

// ─── Parsing ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntry {
    /// `None` when the line did not carry an explicit quality field.
    pub quality: Option<Quality>,
    pub url: String,
    /// Raw trailing text after the URL, commas preserved.
    pub label: Option<String>,
}

/// Split one non-comment line into quality / url / label.
///
/// Returns `None` when no field looks like a URL.
pub fn parse_entry(line: &str) -> Option<ParsedEntry> {
    let fields: Vec<&str> = line.split([',', '，']).map(str::trim).collect();
    let url_pos = fields.iter().position(|f| f.contains("://"))?;
    let quality = if url_pos > 0 {
        Quality::parse(fields[0])
    } else {
        None
    };
    let label = if url_pos + 1 < fields.len() {
        let rest = fields[url_pos + 1..].join(",");
        (!rest.is_empty()).then_some(rest)
    } else {
        None
    };
    Some(ParsedEntry {
        quality,
        url: fields[url_pos].to_string(),
        label,
    })
}

/// Strip the auto-appended `主播:` marker off a label to get the alias.
fn alias_from_label(label: &str) -> Option<String> {
    let stripped = label
        .trim()
        .strip_prefix("主播:")
        .or_else(|| label.trim().strip_prefix("主播："))
        .unwrap_or(label.trim());
    let stripped = stripped.trim();
    (!stripped.is_empty()).then(|| stripped.to_string())
}

// ─── Canonicalization ───────────────────────────────────────────────────────

/// Host-specific URL rewriting that produces the stable unique key.
///
/// Idempotent: applying it twice yields the same string.
pub fn canonicalize(raw: &str) -> String {
    let parsed = match Url::parse(raw) {
        Ok(u) => u,
        Err(_) => return raw.trim_end_matches('/').to_string(),
    };
    let host = parsed.host_str().unwrap_or("");

    // The shopee country domains all point at the same room namespace.
    if host.contains("shopee.") {
        let path = parsed.path().trim_end_matches('/');
        return format!("https://shopee{path}");
    }

    // xiaohongshu room URLs are only stable through their host_id parameter.
    if host.contains("xiaohongshu.com") || host.contains("xhslink.com") {
        let mut out = format!(
            "{}://{}{}",
            parsed.scheme(),
            host,
            parsed.path().trim_end_matches('/')
        );
        if let Some(host_id) = parsed
            .query_pairs()
            .find(|(k, _)| k == "host_id")
            .map(|(_, v)| v.into_owned())
        {
            out.push_str(&format!("?host_id={host_id}"));
        }
        return out;
    }

    let strip = platform::lookup(host)
        .map(|p| platform::QUERY_STRIP_TAGS.contains(&p.tag))
        .unwrap_or(false);
    if strip {
        format!(
            "{}://{}{}",
            parsed.scheme(),
            host,
            parsed.path().trim_end_matches('/')
        )
    } else {
        raw.trim_end_matches('/').to_string()
    }
}

/// Classify a canonical URL into a room, or `None` for unknown hosts.
fn room_for(url: &str, quality: Quality, alias: Option<String>) -> Option<Room> {
    let host = Url::parse(url).ok()?.host_str()?.to_string();
    if let Some(p) = platform::lookup(&host) {
        return Some(Room {
            url: url.to_string(),
            quality,
            alias,
            platform_tag: p.tag.to_string(),
            platform_display: p.display.to_string(),
            overseas: p.region == Region::Overseas,
        });
    }
    if platform::is_raw_media_url(url) {
        return Some(Room {
            url: url.to_string(),
            quality,
            alias,
            platform_tag: CUSTOM_TAG.to_string(),
            platform_display: CUSTOM_TAG.to_string(),
            overseas: false,
        });
    }
    None
}

/// Whether a changed line requires restarting the room's supervisor.
///
/// Quality is baked into the running probe loop; a label/alias append (the
/// registry's own doing, mid-recording) is not worth interrupting a session.
fn needs_restart(previous: &Room, current: &Room) -> bool {
    previous.quality != current.quality
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// Change notification to the supervisor pool (single subscriber).
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(Room),
    /// Line deleted from the file.
    Removed { url: String },
    /// Line still present but now `#`-paused.
    Commented { url: String },
}

pub struct UrlRegistry {
    store: Arc<ConfigStore>,
    active: std::sync::Mutex<HashMap<String, Room>>,
}

impl UrlRegistry {
    pub fn new(store: Arc<ConfigStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            active: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn monitored_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// One full pass: read, repair, diff, rewrite-once, emit events.
    pub async fn scan(&self) -> std::io::Result<Vec<RegistryEvent>> {
        let lines = self.store.read_url_lines().await?;
        let mut kept: Vec<String> = Vec::with_capacity(lines.len());
        let mut modified = false;
        let mut next: HashMap<String, Room> = HashMap::new();
        let mut commented: HashSet<String> = HashSet::new();
        let mut seen: HashSet<String> = HashSet::new();

        for line in lines {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                kept.push(line);
                continue;
            }
            if let Some(inner) = trimmed.strip_prefix('#') {
                if let Some(entry) = parse_entry(inner) {
                    commented.insert(canonicalize(&entry.url));
                }
                kept.push(line);
                continue;
            }
            if trimmed.chars().count() < MIN_ENTRY_CHARS {
                kept.push(line);
                continue;
            }
            let Some(entry) = parse_entry(trimmed) else {
                warn!(line = trimmed, "no URL found in entry, ignoring");
                kept.push(line);
                continue;
            };

            let canonical = canonicalize(&entry.url);
            let quality = entry.quality.unwrap_or(Quality::Original);
            let alias = entry.label.as_deref().and_then(alias_from_label);

            let Some(room) = room_for(&canonical, quality, alias) else {
                warn!(url = %entry.url, "unknown host, commenting the line out");
                kept.push(format!("#{trimmed}"));
                modified = true;
                continue;
            };

            if !seen.insert(canonical.clone()) {
                info!(url = %canonical, "duplicate entry removed");
                modified = true;
                continue;
            }

            // Persist canonicalization: rewrite the URL field in place.
            if entry.url != canonical {
                let mut rebuilt = String::new();
                if entry.quality.is_some() {
                    rebuilt.push_str(quality.label());
                    rebuilt.push(',');
                }
                rebuilt.push_str(&canonical);
                if let Some(label) = &entry.label {
                    rebuilt.push(',');
                    rebuilt.push_str(label);
                }
                kept.push(rebuilt);
                modified = true;
            } else {
                kept.push(line);
            }
            next.insert(canonical, room);
        }

        if modified {
            self.store.write_url_lines(&kept).await?;
        }

        // Diff against the previous scan.
        let mut events = Vec::new();
        {
            let mut active = self.active.lock().unwrap();
            for (url, room) in &next {
                match active.get(url) {
                    None => events.push(RegistryEvent::Added(room.clone())),
                    Some(previous) if needs_restart(previous, room) => {
                        // An in-place edit the running supervisor cannot
                        // absorb: bounce it.
                        events.push(RegistryEvent::Removed { url: url.clone() });
                        events.push(RegistryEvent::Added(room.clone()));
                    }
                    Some(_) => {}
                }
            }
            for url in active.keys() {
                if !next.contains_key(url) {
                    if commented.contains(url) {
                        events.push(RegistryEvent::Commented { url: url.clone() });
                    } else {
                        events.push(RegistryEvent::Removed { url: url.clone() });
                    }
                }
            }
            *active = next;
        }
        Ok(events)
    }

    /// Pause a room in place by prefixing its line with `#`.  Used when no
    /// resolver claims a host the platform table let through.
    pub async fn comment_out(&self, canonical_url: &str) -> std::io::Result<()> {
        let lines = self.store.read_url_lines().await?;
        let target = lines
            .iter()
            .find(|l| !l.trim_start().starts_with('#') && l.contains(canonical_url));
        if let Some(old) = target {
            warn!(url = %canonical_url, "room commented out");
            self.store
                .replace_line(old, &format!("#{old}"), None)
                .await?;
        }
        Ok(())
    }

    /// One-time label append after the first successful probe:
    /// `…,主播: <anchor>`.  Leaves lines that already carry a label alone.
    pub async fn append_anchor(&self, canonical_url: &str, anchor: &str) -> std::io::Result<()> {
        let lines = self.store.read_url_lines().await?;
        let target = lines.iter().find(|l| {
            !l.trim_start().starts_with('#')
                && l.contains(canonical_url)
                && !l.contains("主播:")
                && !l.contains("主播：")
        });
        if let Some(old) = target {
            debug!(url = %canonical_url, anchor, "anchor label appended");
            self.store
                .replace_line(old, &format!("{old},主播: {anchor}"), None)
                .await?;
        }
        Ok(())
    }
}

/// Re-scan on a fixed cadence, pushing events at the supervisor pool.
pub fn spawn_scanner(
    registry: Arc<UrlRegistry>,
    tx: mpsc::UnboundedSender<RegistryEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match registry.scan().await {
                Ok(events) => {
                    for e in events {
                        if tx.send(e).is_err() {
                            return; // pool gone, nothing left to notify
                        }
                    }
                }
                Err(e) => warn!(error = %e, "URL list scan failed"),
            }
        }
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────
