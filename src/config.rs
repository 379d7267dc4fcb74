// src/config.rs
//
// Configuration for the recorder.
//
// Two files live next to the binary:
//
//   config.ini — sectioned key/value settings.  Missing sections and keys are
//                created with documented defaults on first read, so a fresh
//                install produces a fully commented-in file.
//   URL_config.ini — one monitored room per line (see registry.rs for the
//                line grammar).  UTF-8 with BOM; `#` pauses an entry in place.
//
// All writes to either file go through one process-wide async mutex, and a
// background worker snapshots both files to `backup/` whenever their content
// fingerprint changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::platform;

const BOM: &str = "\u{feff}";
const BACKUP_INTERVAL: Duration = Duration::from_secs(600);
const BACKUPS_PER_FILE: usize = 6;

// ─── Container ──────────────────────────────────────────────────────────────

/// Output container chosen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Ts,
    Mkv,
    Flv,
    Mp4,
    Mp3,
    M4a,
}

impl Container {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ts" => Some(Self::Ts),
            "mkv" => Some(Self::Mkv),
            "flv" => Some(Self::Flv),
            "mp4" => Some(Self::Mp4),
            "mp3" => Some(Self::Mp3),
            "m4a" => Some(Self::M4a),
            _ => None,
        }
    }

    pub fn ext(&self) -> &'static str {
        match self {
            Self::Ts => "ts",
            Self::Mkv => "mkv",
            Self::Flv => "flv",
            Self::Mp4 => "mp4",
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
        }
    }

    /// MP3/M4A capture only the audio streams.
    pub fn is_audio_only(&self) -> bool {
        matches!(self, Self::Mp3 | Self::M4a)
    }
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ts => "TS",
            Self::Mkv => "MKV",
            Self::Flv => "FLV",
            Self::Mp4 => "MP4",
            Self::Mp3 => "MP3",
            Self::M4a => "M4A",
        })
    }
}

// ─── Quality ────────────────────────────────────────────────────────────────

/// Requested stream quality, from best to worst.
///
/// The on-disk tokens are the traditional-Chinese labels the URL list uses;
/// English names are accepted as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Quality {
    Original,
    Bluray,
    Uhd,
    Hd,
    Sd,
    Ld,
}

impl Quality {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "原畫" | "原画" => Some(Self::Original),
            "藍光" | "蓝光" => Some(Self::Bluray),
            "超清" => Some(Self::Uhd),
            "高清" => Some(Self::Hd),
            "標清" | "标清" => Some(Self::Sd),
            "流暢" | "流畅" => Some(Self::Ld),
            other => match other.to_ascii_lowercase().as_str() {
                "original" => Some(Self::Original),
                "bluray" => Some(Self::Bluray),
                "uhd" => Some(Self::Uhd),
                "hd" => Some(Self::Hd),
                "sd" => Some(Self::Sd),
                "ld" => Some(Self::Ld),
                _ => None,
            },
        }
    }

    /// Label shown in the status line and written back to config.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Original => "原畫",
            Self::Bluray => "藍光",
            Self::Uhd => "超清",
            Self::Hd => "高清",
            Self::Sd => "標清",
            Self::Ld => "流暢",
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ─── Settings ───────────────────────────────────────────────────────────────

/// Immutable snapshot of everything under `[RecordingSettings]` and
/// `[PushSettings]`.  Built once at startup and passed by `Arc` into each
/// component; nothing mutates it afterwards.
#[derive(Debug, Clone)]
pub struct Settings {
    pub save_root: PathBuf,
    pub folder_by_author: bool,
    pub folder_by_time: bool,
    pub folder_by_title: bool,
    pub title_in_filename: bool,
    pub strip_emoji: bool,
    pub container: Container,
    pub quality: Quality,
    pub preset_threads: usize,
    pub loop_seconds: u64,
    pub segment_record: bool,
    pub segment_seconds: u64,
    pub convert_to_mp4: bool,
    pub reencode_h264: bool,
    pub delete_origin_file: bool,
    pub disk_space_floor_gb: f64,
    pub proxy_address: Option<String>,
    pub proxy_platforms: Vec<String>,
    pub extra_proxy_platforms: Vec<String>,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub push_channels: Vec<String>,
    pub push_template: Option<String>,
    pub push_offline: bool,
    pub push_only: bool,
    pub push_check_seconds: u64,
    pub webhook_url: Option<String>,
    pub bark_url: Option<String>,
    pub email_webhook: Option<String>,
    pub email_to: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            save_root: default_save_root(""),
            folder_by_author: true,
            folder_by_time: false,
            folder_by_title: false,
            title_in_filename: false,
            strip_emoji: true,
            container: Container::Ts,
            quality: Quality::Original,
            preset_threads: 3,
            loop_seconds: 120,
            segment_record: false,
            segment_seconds: 1800,
            convert_to_mp4: false,
            reencode_h264: false,
            delete_origin_file: false,
            disk_space_floor_gb: 1.0,
            proxy_address: None,
            proxy_platforms: platform::DEFAULT_PROXY_TAGS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            extra_proxy_platforms: Vec::new(),
            ffmpeg_path: "ffmpeg".into(),
            ffprobe_path: "ffprobe".into(),
            push_channels: Vec::new(),
            push_template: None,
            push_offline: true,
            push_only: false,
            push_check_seconds: 1800,
            webhook_url: None,
            bark_url: None,
            email_webhook: None,
            email_to: None,
        }
    }
}

/// Directory the binary runs from; config and downloads live next to it.
pub fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Empty `save_path` falls back to `downloads/` next to the binary.
fn default_save_root(configured: &str) -> PathBuf {
    if !configured.trim().is_empty() {
        return PathBuf::from(configured.trim());
    }
    exe_dir().join("downloads")
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" | "是" => Some(true),
        "false" | "0" | "no" | "off" | "否" => Some(false),
        _ => None,
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split([',', '，'])
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

impl Settings {
    /// Read every recognized key, writing defaults back for missing ones.
    pub async fn load(store: &ConfigStore) -> Self {
        const REC: &str = "RecordingSettings";
        const PUSH: &str = "PushSettings";
        let d = Settings::default();

        let get_bool = |raw: String, dflt: bool| parse_bool(&raw).unwrap_or(dflt);

        let save_path = store.get(REC, "save_path", "").await;
        let folder_by_author =
            get_bool(store.get(REC, "folder_by_author", "true").await, true);
        let folder_by_time =
            get_bool(store.get(REC, "folder_by_time", "false").await, false);
        let folder_by_title =
            get_bool(store.get(REC, "folder_by_title", "false").await, false);
        let title_in_filename =
            get_bool(store.get(REC, "title_in_filename", "false").await, false);
        let strip_emoji = get_bool(store.get(REC, "strip_emoji", "true").await, true);
        let container = Container::parse(&store.get(REC, "video_format", "TS").await)
            .unwrap_or(Container::Ts);
        let quality = Quality::parse(&store.get(REC, "video_quality", "原畫").await)
            .unwrap_or(Quality::Original);
        let preset_threads = store
            .get(REC, "max_request_threads", "3")
            .await
            .trim()
            .parse()
            .unwrap_or(d.preset_threads)
            .max(1);
        let loop_seconds = store
            .get(REC, "loop_seconds", "120")
            .await
            .trim()
            .parse()
            .unwrap_or(d.loop_seconds);
        let segment_record =
            get_bool(store.get(REC, "segment_record", "false").await, false);
        let segment_seconds = store
            .get(REC, "segment_seconds", "1800")
            .await
            .trim()
            .parse()
            .unwrap_or(d.segment_seconds)
            .max(1);
        let convert_to_mp4 =
            get_bool(store.get(REC, "convert_to_mp4", "false").await, false);
        let reencode_h264 =
            get_bool(store.get(REC, "reencode_h264", "false").await, false);
        let delete_origin_file =
            get_bool(store.get(REC, "delete_origin_file", "false").await, false);
        let disk_space_floor_gb = store
            .get(REC, "disk_space_floor_gb", "1.0")
            .await
            .trim()
            .parse()
            .unwrap_or(d.disk_space_floor_gb);
        let proxy_address = {
            let v = store.get(REC, "proxy_address", "").await;
            let v = v.trim().to_string();
            (!v.is_empty()).then_some(v)
        };
        let default_proxy = platform::DEFAULT_PROXY_TAGS.join(",");
        let proxy_platforms =
            split_list(&store.get(REC, "proxy_platforms", &default_proxy).await);
        let extra_proxy_platforms =
            split_list(&store.get(REC, "extra_proxy_platforms", "").await);
        let ffmpeg_path = store.get(REC, "ffmpeg_path", "ffmpeg").await;
        let ffprobe_path = store.get(REC, "ffprobe_path", "ffprobe").await;

        let push_channels = split_list(&store.get(PUSH, "push_channels", "").await);
        let push_template = {
            let v = store.get(PUSH, "push_template", "").await;
            (!v.trim().is_empty()).then(|| v.trim().to_string())
        };
        let push_offline = get_bool(store.get(PUSH, "push_offline", "true").await, true);
        let push_only = get_bool(store.get(PUSH, "push_only", "false").await, false);
        let push_check_seconds = store
            .get(PUSH, "push_check_seconds", "1800")
            .await
            .trim()
            .parse()
            .unwrap_or(d.push_check_seconds);
        let opt = |v: String| {
            let v = v.trim().to_string();
            (!v.is_empty()).then_some(v)
        };
        let webhook_url = opt(store.get(PUSH, "webhook_url", "").await);
        let bark_url = opt(store.get(PUSH, "bark_url", "").await);
        let email_webhook = opt(store.get(PUSH, "email_webhook", "").await);
        let email_to = opt(store.get(PUSH, "email_to", "").await);

        // Credential sections exist even when empty so users can find them.
        store.ensure_section("Cookie").await;
        store.ensure_section("Authorization").await;
        store.ensure_section("Credentials").await;

        let settings = Settings {
            save_root: default_save_root(&save_path),
            folder_by_author,
            folder_by_time,
            folder_by_title,
            title_in_filename,
            strip_emoji,
            container,
            quality,
            preset_threads,
            loop_seconds,
            segment_record,
            segment_seconds,
            convert_to_mp4,
            reencode_h264,
            delete_origin_file,
            disk_space_floor_gb,
            proxy_address,
            proxy_platforms,
            extra_proxy_platforms,
            ffmpeg_path,
            ffprobe_path,
            push_channels,
            push_template,
            push_offline,
            push_only,
            push_check_seconds,
            webhook_url,
            bark_url,
            email_webhook,
            email_to,
        };
        settings.log_summary();
        settings
    }

    /// Whether probes/recordings for this platform tag go through the proxy.
    pub fn proxy_applies(&self, tag: &str) -> bool {
        self.proxy_address.is_some()
            && (self.proxy_platforms.iter().any(|t| t == tag)
                || self.extra_proxy_platforms.iter().any(|t| t == tag))
    }

    fn log_summary(&self) {
        info!("──── recorder configuration ────");
        info!("  save_root          : {}", self.save_root.display());
        info!("  container          : {}", self.container);
        info!("  quality            : {}", self.quality);
        info!("  concurrency preset : {}", self.preset_threads);
        info!("  loop_seconds       : {}", self.loop_seconds);
        info!(
            "  segmentation       : {}",
            if self.segment_record {
                format!("on ({} s)", self.segment_seconds)
            } else {
                "off".to_string()
            }
        );
        info!(
            "  proxy              : {}",
            self.proxy_address.as_deref().unwrap_or("off")
        );
        info!(
            "  push channels      : {}",
            if self.push_channels.is_empty() {
                "none".to_string()
            } else {
                self.push_channels.join(",")
            }
        );
        info!("────────────────────────────────");
    }
}

// ─── ConfigStore ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

/// Read/write access to the two on-disk files.
///
/// The in-memory INI model is authoritative between saves; `get` repairs
/// missing keys by writing the default back, and a failed write still leaves
/// the value available in memory.
pub struct ConfigStore {
    config_path: PathBuf,
    url_path: PathBuf,
    backup_dir: PathBuf,
    /// The process-wide file-update lock: every mutation of either file
    /// happens inside it.
    lock: tokio::sync::Mutex<()>,
    sections: std::sync::Mutex<Vec<Section>>,
}

impl ConfigStore {
    pub async fn open(config_path: PathBuf, url_path: PathBuf) -> std::io::Result<Arc<Self>> {
        let backup_dir = config_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("backup");
        let store = Arc::new(Self {
            config_path,
            url_path,
            backup_dir,
            lock: tokio::sync::Mutex::new(()),
            sections: std::sync::Mutex::new(Vec::new()),
        });
        store.load().await?;
        Ok(store)
    }

    /// (Re)parse the config file.  A missing file starts empty and will be
    /// created on the first `get`.
    pub async fn load(&self) -> std::io::Result<()> {
        let text = match tokio::fs::read_to_string(&self.config_path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        let mut sections: Vec<Section> = Vec::new();
        for raw in text.trim_start_matches(BOM).lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                sections.push(Section {
                    name: name.trim().to_string(),
                    entries: Vec::new(),
                });
            } else if let Some((k, v)) = line.split_once('=') {
                match sections.last_mut() {
                    Some(s) => s
                        .entries
                        .push((k.trim().to_string(), v.trim().to_string())),
                    None => warn!(line = raw, "config entry before any [section], ignored"),
                }
            } else {
                warn!(line = raw, "unparseable config line, ignored");
            }
        }
        *self.sections.lock().unwrap() = sections;
        Ok(())
    }

    fn render(&self) -> String {
        let sections = self.sections.lock().unwrap();
        let mut out = String::new();
        for s in sections.iter() {
            out.push_str(&format!("[{}]\n", s.name));
            for (k, v) in &s.entries {
                out.push_str(&format!("{k} = {v}\n"));
            }
            out.push('\n');
        }
        out
    }

    /// Persist the in-memory model.  Failures are logged, not propagated:
    /// callers keep working off memory.
    pub async fn save(&self) {
        let _guard = self.lock.lock().await;
        let rendered = self.render();
        if let Err(e) = tokio::fs::write(&self.config_path, rendered).await {
            warn!(path = %self.config_path.display(), error = %e, "config save failed");
        }
    }

    /// Look a value up, creating the section/key with `default` when absent.
    pub async fn get(&self, section: &str, key: &str, default: &str) -> String {
        let (value, created) = {
            let mut sections = self.sections.lock().unwrap();
            let sec = match sections.iter_mut().find(|s| s.name == section) {
                Some(s) => s,
                None => {
                    sections.push(Section {
                        name: section.to_string(),
                        entries: Vec::new(),
                    });
                    sections.last_mut().unwrap()
                }
            };
            match sec.entries.iter().find(|(k, _)| k == key) {
                Some((_, v)) => (v.clone(), false),
                None => {
                    sec.entries.push((key.to_string(), default.to_string()));
                    (default.to_string(), true)
                }
            }
        };
        if created {
            self.save().await;
        }
        value
    }

    /// Insert or overwrite a value, then persist.
    pub async fn set(&self, section: &str, key: &str, value: &str) {
        {
            let mut sections = self.sections.lock().unwrap();
            let sec = match sections.iter_mut().find(|s| s.name == section) {
                Some(s) => s,
                None => {
                    sections.push(Section {
                        name: section.to_string(),
                        entries: Vec::new(),
                    });
                    sections.last_mut().unwrap()
                }
            };
            match sec.entries.iter_mut().find(|(k, _)| k == key) {
                Some(entry) => entry.1 = value.to_string(),
                None => sec.entries.push((key.to_string(), value.to_string())),
            }
        }
        self.save().await;
    }

    pub async fn ensure_section(&self, section: &str) {
        let created = {
            let mut sections = self.sections.lock().unwrap();
            if sections.iter().any(|s| s.name == section) {
                false
            } else {
                sections.push(Section {
                    name: section.to_string(),
                    entries: Vec::new(),
                });
                true
            }
        };
        if created {
            self.save().await;
        }
    }

    /// Every key/value pair of a section (credential sections for resolvers).
    pub fn section_entries(&self, section: &str) -> HashMap<String, String> {
        let sections = self.sections.lock().unwrap();
        sections
            .iter()
            .find(|s| s.name == section)
            .map(|s| s.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ── URL list ────────────────────────────────────────────────────────

    /// All lines of the URL list, BOM stripped.  A missing file reads empty.
    pub async fn read_url_lines(&self) -> std::io::Result<Vec<String>> {
        match tokio::fs::read_to_string(&self.url_path).await {
            Ok(t) => Ok(t
                .trim_start_matches(BOM)
                .lines()
                .map(|l| l.to_string())
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Rewrite the whole URL list (BOM restored) under the file lock.
    pub async fn write_url_lines(&self, lines: &[String]) -> std::io::Result<()> {
        let _guard = self.lock.lock().await;
        let mut text = String::from(BOM);
        text.push_str(&lines.join("\n"));
        if !lines.is_empty() {
            text.push('\n');
        }
        tokio::fs::write(&self.url_path, text).await
    }

    /// Replace a line in the URL list.
    ///
    /// With `prefix` set, the first line *starting with* it is replaced;
    /// otherwise the first line exactly equal to `old`.  The file is re-read
    /// inside the lock so concurrent edits are never clobbered, and nothing
    /// is appended when no line matches.
    pub async fn replace_line(
        &self,
        old: &str,
        new: &str,
        prefix: Option<&str>,
    ) -> std::io::Result<bool> {
        let mut lines = self.read_url_lines().await?;
        let hit = lines.iter_mut().find(|l| match prefix {
            Some(p) => l.starts_with(p),
            None => l.as_str() == old,
        });
        match hit {
            Some(line) => {
                if line.as_str() == new {
                    return Ok(false);
                }
                *line = new.to_string();
                self.write_url_lines(&lines).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete the first (or all) lines containing `pattern`.
    #[allow(dead_code)]
    pub async fn delete_line(&self, pattern: &str, all: bool) -> std::io::Result<usize> {
        let lines = self.read_url_lines().await?;
        let mut kept = Vec::with_capacity(lines.len());
        let mut removed = 0usize;
        for line in lines {
            if line.contains(pattern) && (all || removed == 0) {
                removed += 1;
                continue;
            }
            kept.push(line);
        }
        if removed > 0 {
            self.write_url_lines(&kept).await?;
        }
        Ok(removed)
    }
}

// ─── Backup worker ──────────────────────────────────────────────────────────

fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

async fn backup_one(
    path: &Path,
    backup_dir: &Path,
    last: &mut HashMap<PathBuf, String>,
) -> std::io::Result<()> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let fp = fingerprint(&bytes);
    if last.get(path).map(String::as_str) == Some(fp.as_str()) {
        return Ok(());
    }
    last.insert(path.to_path_buf(), fp);

    tokio::fs::create_dir_all(backup_dir).await?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("config");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("ini");
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let dest = backup_dir.join(format!("{stem}_{stamp}.{ext}"));
    tokio::fs::write(&dest, &bytes).await?;
    debug!(dest = %dest.display(), "config backup written");

    // Prune oldest beyond the cap (names sort chronologically).
    let mut mine: Vec<PathBuf> = Vec::new();
    let mut dirents = tokio::fs::read_dir(backup_dir).await?;
    while let Some(entry) = dirents.next_entry().await? {
        let name = entry.file_name();
        if name
            .to_str()
            .is_some_and(|n| n.starts_with(&format!("{stem}_")))
        {
            mine.push(entry.path());
        }
    }
    mine.sort();
    while mine.len() > BACKUPS_PER_FILE {
        let victim = mine.remove(0);
        if let Err(e) = tokio::fs::remove_file(&victim).await {
            warn!(path = %victim.display(), error = %e, "backup prune failed");
        }
    }
    Ok(())
}

/// Every 10 minutes, snapshot whichever of the two files changed since the
/// last look.
pub fn spawn_backup_worker(store: Arc<ConfigStore>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last: HashMap<PathBuf, String> = HashMap::new();
        let mut ticker = tokio::time::interval(BACKUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for path in [store.config_path.clone(), store.url_path.clone()] {
                if let Err(e) = backup_one(&path, &store.backup_dir, &mut last).await {
                    warn!(path = %path.display(), error = %e, "backup failed");
                }
            }
        }
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────
