// src/supervisor.rs
//
// Per-room supervision.
//
// ─ Architecture ─────────────────────────────────────────────────────────────
//
//   registry events ──> SupervisorPool (map<canonical URL, room task>)
//                            │ Added      → spawn run_room
//                            │ Commented  → cancel token (graceful stop)
//                            └ Removed    → cancel token
//
//   run_room, forever:
//     Probing      acquire governor permit → resolve → release permit
//     WaitingLive  offline edge? emit WentOffline; sleep; re-probe
//     Recording    reserve names → supervise the muxer (no permit held)
//     PostProcess  convert / post-hoc segment per config
//                  back off (jittered loop seconds, +60 s under error surge,
//                  one-shot 30 s after a <60 s session) and go again
//
// Every recoverable error is absorbed at the loop boundary; a room task only
// ends when its token fires (comment-out, removal, or shutdown).
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigStore, Container, Settings};
use crate::error::ErrorKind;
use crate::events::{EventBus, EventType, RoomEvent};
use crate::governor::Governor;
use crate::naming;
use crate::platform::{self, HeaderHint};
use crate::recorder::{self, RecordPlan, RecordTarget, STOP_GRACE};
use crate::registry::{RegistryEvent, Room, UrlRegistry};
use crate::resolver::{Resolution, ResolverRouter};
use crate::status::StatusBoard;

/// One-shot re-probe delay after a session shorter than a minute, to catch a
/// stuttering anchor coming right back.
const SHORT_SESSION_REPROBE: Duration = Duration::from_secs(30);
/// Sessions below this count as stutters.
const SHORT_SESSION: Duration = Duration::from_secs(60);
/// Extra sleep when the governor window reports an error surge.
const PENALTY_SLEEP: Duration = Duration::from_secs(60);

// ─── Shared context ─────────────────────────────────────────────────────────

pub struct SupervisorContext {
    pub settings: Arc<Settings>,
    pub store: Arc<ConfigStore>,
    pub registry: Arc<UrlRegistry>,
    pub router: Arc<ResolverRouter>,
    pub governor: Arc<Governor>,
    pub bus: EventBus,
    pub board: Arc<StatusBoard>,
}

// ─── Live edge tracking ─────────────────────────────────────────────────────

/// Guards the once-per-session notification contract: a `WentLive` is
/// followed by at most one `WentOffline` before the next `WentLive`, and a
/// `WentOffline` never fires without a prior `WentLive`.
#[derive(Debug, Default)]
struct LiveEdge {
    notified: bool,
}

impl LiveEdge {
    /// Returns true when a `WentLive` should be emitted.
    fn on_live(&mut self) -> bool {
        !std::mem::replace(&mut self.notified, true)
    }

    /// Returns true when a `WentOffline` should be emitted.
    fn on_offline(&mut self) -> bool {
        std::mem::replace(&mut self.notified, false)
    }
}

// ─── Back-off ───────────────────────────────────────────────────────────────

/// `loop_seconds ± uniform(−5, +5)`, clamped at zero, plus the surge penalty.
fn backoff_delay(loop_seconds: u64, penalty: bool) -> Duration {
    let jitter: i64 = rand::thread_rng().gen_range(-5..=5);
    let base = (loop_seconds as i64 + jitter).max(0) as u64;
    let mut delay = Duration::from_secs(base);
    if penalty {
        delay += PENALTY_SLEEP;
    }
    delay
}

/// Cancellable sleep; returns true when the token fired.
async fn idle(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

// ─── Output layout ──────────────────────────────────────────────────────────

/// `<root>/<platform>[/<anchor>][/<date>][/<title|date_title>]`.
fn output_dir(
    settings: &Settings,
    platform_display: &str,
    anchor: &str,
    title: Option<&str>,
    date: NaiveDate,
) -> PathBuf {
    let mut dir = settings.save_root.join(platform_display);
    if settings.folder_by_author {
        dir = dir.join(anchor);
    }
    if settings.folder_by_time {
        dir = dir.join(naming::date_dir(date));
    }
    if settings.folder_by_title {
        if let Some(title) = title {
            let cleaned = naming::clean_component(title, settings.strip_emoji);
            let segment = if settings.folder_by_time {
                cleaned
            } else {
                format!("{}_{}", naming::date_dir(date), cleaned)
            };
            dir = dir.join(segment);
        }
    }
    dir
}

/// `[title ]<anchor> <YYYYMMDD>`.
fn base_name(settings: &Settings, anchor: &str, title: Option<&str>, date: NaiveDate) -> String {
    let base = naming::file_base(anchor, date);
    match title {
        Some(title) if settings.title_in_filename => {
            format!(
                "{} {}",
                naming::clean_component(title, settings.strip_emoji),
                base
            )
        }
        _ => base,
    }
}

fn header_pairs(room: &Room) -> Vec<(String, String)> {
    match platform::by_tag(&room.platform_tag).map(|p| p.header) {
        Some(HeaderHint::Origin(origin)) => vec![("origin".into(), origin.into())],
        Some(HeaderHint::Referer(referer)) => vec![("referer".into(), referer.into())],
        _ => Vec::new(),
    }
}

// ─── Disk floor ─────────────────────────────────────────────────────────────

/// Free space at `path` in GiB; `None` when the platform offers no probe.
#[cfg(unix)]
pub fn free_space_gb(path: &std::path::Path) -> Option<f64> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    (rc == 0).then(|| (stat.f_bavail as f64 * stat.f_frsize as f64) / f64::from(1 << 30))
}

#[cfg(not(unix))]
pub fn free_space_gb(_path: &std::path::Path) -> Option<f64> {
    None
}

fn below_disk_floor(settings: &Settings) -> bool {
    let probe_at = if settings.save_root.exists() {
        settings.save_root.clone()
    } else {
        std::path::PathBuf::from(".")
    };
    match free_space_gb(&probe_at) {
        Some(free) => free < settings.disk_space_floor_gb,
        None => false,
    }
}

// ─── Room task ──────────────────────────────────────────────────────────────

async fn run_room(room: Room, ctx: Arc<SupervisorContext>, cancel: CancellationToken) {
    info!(room = %room.url, platform = %room.platform_tag, "supervisor started");
    let mut edge = LiveEdge::default();
    let mut anchor_labeled = room.alias.is_some();
    let mut short_session = false;

    loop {
        // ── Probing ─────────────────────────────────────────────────────
        let resolution = {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = ctx.governor.acquire() => permit,
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    drop(permit);
                    break;
                }
                result = ctx.router.resolve(&room) => result,
            };
            drop(permit);
            result
        };

        let resolution = match resolution {
            Ok(resolution) => resolution,
            Err(e) => {
                if e.kind == ErrorKind::UnknownHost {
                    // Registry-level filtering let it through, so no resolver
                    // is registered for this platform: park the line.
                    error!(room = %room.url, "{e}");
                    if let Err(io) = ctx.registry.comment_out(&room.url).await {
                        warn!(room = %room.url, error = %io, "comment-out failed");
                    }
                    break;
                }
                debug!(room = %room.url, error = %e, "probe failed");
                if e.kind.counts_toward_governor() {
                    ctx.governor.record_error();
                    ctx.board.error_recorded();
                }
                if idle(&cancel, backoff_delay(ctx.settings.loop_seconds, ctx.governor.penalty_active())).await {
                    break;
                }
                continue;
            }
        };

        let anchor_raw = room
            .alias
            .clone()
            .unwrap_or_else(|| resolution.anchor_name.clone());

        // ── WaitingLive ─────────────────────────────────────────────────
        if !resolution.is_live {
            if edge.on_offline() {
                ctx.bus.emit(RoomEvent::new(
                    EventType::WentOffline,
                    &room.url,
                    &room.platform_display,
                    &anchor_raw,
                    resolution.title.clone(),
                ));
            }
            let delay = if short_session {
                short_session = false;
                SHORT_SESSION_REPROBE
            } else {
                backoff_delay(ctx.settings.loop_seconds, ctx.governor.penalty_active())
            };
            if idle(&cancel, delay).await {
                break;
            }
            continue;
        }

        // ── Live ────────────────────────────────────────────────────────
        if !anchor_labeled {
            if let Err(e) = ctx.registry.append_anchor(&room.url, &anchor_raw).await {
                warn!(room = %room.url, error = %e, "anchor label append failed");
            }
            anchor_labeled = true;
        }
        if edge.on_live() {
            info!(room = %room.url, anchor = %anchor_raw, "went live");
            ctx.bus.emit(RoomEvent::new(
                EventType::WentLive,
                &room.url,
                &room.platform_display,
                &anchor_raw,
                resolution.title.clone(),
            ));
        }

        if ctx.settings.push_only {
            if idle(&cancel, Duration::from_secs(ctx.settings.push_check_seconds)).await {
                break;
            }
            continue;
        }

        if below_disk_floor(&ctx.settings) {
            warn!(room = %room.url, "below the disk-space floor, not starting a recording");
            if idle(&cancel, backoff_delay(ctx.settings.loop_seconds, false)).await {
                break;
            }
            continue;
        }

        // ── Recording ───────────────────────────────────────────────────
        let outcome = record_session(&room, &ctx, &resolution, &anchor_raw, &cancel).await;
        match outcome {
            Ok(elapsed) => {
                short_session = elapsed < SHORT_SESSION;
            }
            Err(e) => {
                warn!(room = %room.url, error = %e, "recording failed");
                if e.kind.counts_toward_governor() {
                    ctx.governor.record_error();
                    ctx.board.error_recorded();
                }
            }
        }
        if cancel.is_cancelled() {
            break;
        }
        let delay = if short_session {
            // The flag survives to the next probe only when the session was
            // cut short; consume it after one fast re-probe.
            SHORT_SESSION_REPROBE
        } else {
            backoff_delay(ctx.settings.loop_seconds, ctx.governor.penalty_active())
        };
        if idle(&cancel, delay).await {
            break;
        }
    }
    info!(room = %room.url, "supervisor stopped");
}

/// One recording plus its post-processing.  Returns on-air time.
async fn record_session(
    room: &Room,
    ctx: &Arc<SupervisorContext>,
    resolution: &Resolution,
    anchor_raw: &str,
    cancel: &CancellationToken,
) -> Result<Duration, crate::error::ProbeError> {
    let settings = &ctx.settings;
    let media_url = resolution
        .media_url
        .clone()
        .ok_or_else(|| crate::error::ProbeError::parse("live resolution carried no media URL"))?;

    let anchor = naming::clean_component(anchor_raw, settings.strip_emoji);
    let date = naming::recording_date(chrono::Local::now());
    let dir = output_dir(
        settings,
        &room.platform_display,
        &anchor,
        resolution.title.as_deref(),
        date,
    );
    tokio::fs::create_dir_all(&dir).await?;
    let base = base_name(settings, &anchor, resolution.title.as_deref(), date);

    let use_flv = settings.container == Container::Flv
        || resolution.preferred_container == Some(Container::Flv);

    ctx.board
        .recording_started(&room.url, &anchor, room.quality);
    ctx.bus.emit(RoomEvent::new(
        EventType::RecordingStarted,
        &room.url,
        &room.platform_display,
        anchor_raw,
        resolution.title.clone(),
    ));

    let headers = header_pairs(room);
    let proxy = ctx.router.proxy_for(room);

    let result = if use_flv {
        let path = naming::reserve(&dir, &base, "flv")?;
        recorder::record_flv(&media_url, &headers, proxy.as_deref(), &path, cancel).await
    } else {
        let target = if settings.segment_record {
            let (template, start_index) =
                naming::reserve_segment(&dir, &base, settings.container.ext())?;
            RecordTarget::Segmented {
                template: dir.join(template),
                start_index,
                seconds: settings.segment_seconds,
            }
        } else {
            RecordTarget::Whole(naming::reserve(&dir, &base, settings.container.ext())?)
        };
        let plan = RecordPlan {
            media_url,
            container: settings.container,
            overseas: room.overseas,
            headers,
            proxy,
            reencode_h264: settings.reencode_h264,
            target,
        };
        recorder::record(&settings.ffmpeg_path, &plan, cancel, STOP_GRACE).await
    };

    ctx.board.recording_finished(&room.url);
    ctx.bus.emit(RoomEvent::new(
        EventType::RecordingFinished,
        &room.url,
        &room.platform_display,
        anchor_raw,
        resolution.title.clone(),
    ));

    let outcome = result?;

    // ── PostProcessing ──────────────────────────────────────────────────
    // The native segment muxer already split TS/MP4/MKV live; a stopped FLV
    // pull is the one case that still needs post-hoc slicing.
    if !cancel.is_cancelled() {
        if use_flv && settings.segment_record {
            if let Err(e) = crate::postprocess::segment(
                &settings.ffmpeg_path,
                &settings.ffprobe_path,
                &outcome.output,
                settings.segment_seconds,
                settings.delete_origin_file,
            )
            .await
            {
                warn!(room = %room.url, error = %e, "post-hoc segmentation failed");
            }
        } else if settings.convert_to_mp4
            && !settings.segment_record
            && !matches!(settings.container, Container::Mp4 | Container::M4a)
        {
            // Normalize into the MP4 family: video containers become MP4,
            // audio recordings become M4A.
            let target = if settings.container.is_audio_only() {
                crate::postprocess::ConvertTarget::M4a
            } else {
                crate::postprocess::ConvertTarget::Mp4
            };
            if let Err(e) = crate::postprocess::convert(
                &settings.ffmpeg_path,
                &outcome.output,
                target,
                settings.reencode_h264,
                settings.delete_origin_file,
            )
            .await
            {
                warn!(room = %room.url, error = %e, "conversion failed");
            }
        } else if settings.container == Container::Mp4 && !settings.segment_record {
            // faststart was deferred at record time.
            if let Err(e) =
                crate::postprocess::apply_faststart(&settings.ffmpeg_path, &outcome.output).await
            {
                warn!(room = %room.url, error = %e, "faststart pass failed");
            }
        }
    }

    Ok(outcome.elapsed)
}

// ─── Pool ───────────────────────────────────────────────────────────────────

struct RoomHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Owns one task per active room, keyed by canonical URL.
pub struct SupervisorPool {
    ctx: Arc<SupervisorContext>,
    shutdown: CancellationToken,
    rooms: HashMap<String, RoomHandle>,
}

impl SupervisorPool {
    pub fn new(ctx: Arc<SupervisorContext>, shutdown: CancellationToken) -> Self {
        Self {
            ctx,
            shutdown,
            rooms: HashMap::new(),
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub(crate) fn apply(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Added(room) => {
                if self.rooms.contains_key(&room.url) {
                    return;
                }
                let cancel = self.shutdown.child_token();
                let task = tokio::spawn(run_room(
                    room.clone(),
                    self.ctx.clone(),
                    cancel.clone(),
                ));
                self.rooms.insert(room.url, RoomHandle { cancel, task });
                debug!(rooms = self.room_count(), "supervisor added");
            }
            RegistryEvent::Commented { url } | RegistryEvent::Removed { url } => {
                if let Some(handle) = self.rooms.remove(&url) {
                    info!(room = %url, "stopping supervisor");
                    handle.cancel.cancel();
                    // The task drains on its own; keep shutdown honest by
                    // letting it finish in the background.
                    tokio::spawn(async move {
                        let _ = handle.task.await;
                    });
                }
            }
        }
    }

    /// Drive the pool off registry events until shutdown, then drain.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RegistryEvent>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.apply(event),
                    None => break,
                },
            }
        }
        // Graceful drain: every room token is a child of the shutdown token,
        // so recorders are already stopping; wait them out.
        let tasks: Vec<_> = self.rooms.drain().map(|(_, h)| h.task).collect();
        info!(rooms = tasks.len(), "waiting for room supervisors to stop");
        for task in tasks {
            if tokio::time::timeout(STOP_GRACE + Duration::from_secs(5), task)
                .await
                .is_err()
            {
                warn!("a room supervisor outlived the grace period");
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Quality;
    use crate::resolver::{ResolveContext, StreamResolver};
    use futures::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[test]
    fn live_edge_contract() {
        let mut edge = LiveEdge::default();
        // Never offline before live.
        assert!(!edge.on_offline());
        assert!(edge.on_live());
        // A second live probe does not re-notify.
        assert!(!edge.on_live());
        // One offline edge, exactly once.
        assert!(edge.on_offline());
        assert!(!edge.on_offline());
        // The next session notifies again.
        assert!(edge.on_live());
    }

    #[test]
    fn backoff_bounds() {
        for _ in 0..200 {
            let d = backoff_delay(120, false).as_secs();
            assert!((115..=125).contains(&d), "delay {d} out of range");
        }
        for _ in 0..200 {
            let d = backoff_delay(120, true).as_secs();
            assert!((175..=185).contains(&d), "penalty delay {d} out of range");
        }
        // Small loop values clamp at zero instead of underflowing.
        for _ in 0..50 {
            let d = backoff_delay(2, false).as_secs();
            assert!(d <= 7);
        }
    }

    #[test]
    fn output_dir_layout() {
        let mut settings = Settings::default();
        settings.save_root = PathBuf::from("/downloads");
        settings.folder_by_time = true;
        let date = NaiveDate::from_ymd_opt(2025, 3, 18).unwrap();

        // Author + date (the common layout).
        let dir = output_dir(&settings, "douyin", "Alice_Bob", None, date);
        assert_eq!(dir, PathBuf::from("/downloads/douyin/Alice_Bob/2025-03-18"));

        // Author off.
        settings.folder_by_author = false;
        let dir = output_dir(&settings, "douyin", "Alice_Bob", None, date);
        assert_eq!(dir, PathBuf::from("/downloads/douyin/2025-03-18"));

        // Title dir, with the date folded in when no date dir exists.
        settings.folder_by_author = true;
        settings.folder_by_time = false;
        settings.folder_by_title = true;
        let dir = output_dir(&settings, "douyin", "Alice_Bob", Some("歌回"), date);
        assert_eq!(
            dir,
            PathBuf::from("/downloads/douyin/Alice_Bob/2025-03-18_歌回")
        );

        settings.folder_by_time = true;
        let dir = output_dir(&settings, "douyin", "Alice_Bob", Some("歌回"), date);
        assert_eq!(
            dir,
            PathBuf::from("/downloads/douyin/Alice_Bob/2025-03-18/歌回")
        );
    }

    #[test]
    fn base_name_title_prefix() {
        let mut settings = Settings::default();
        let date = NaiveDate::from_ymd_opt(2025, 3, 18).unwrap();
        assert_eq!(
            base_name(&settings, "Alice_Bob", Some("歌回"), date),
            "Alice_Bob 20250318"
        );
        settings.title_in_filename = true;
        assert_eq!(
            base_name(&settings, "Alice_Bob", Some("歌回"), date),
            "歌回 Alice_Bob 20250318"
        );
    }

    #[test]
    fn platform_headers() {
        let soop = Room {
            url: "https://play.sooplive.co.kr/x".into(),
            quality: Quality::Original,
            alias: None,
            platform_tag: "soop".into(),
            platform_display: "soop".into(),
            overseas: true,
        };
        let headers = header_pairs(&soop);
        assert_eq!(headers[0].0, "origin");
        assert!(headers[0].1.contains("sooplive"));
    }

    // ── State machine, driven end to end with a scripted resolver ───────

    /// Pops one scripted liveness answer per probe; empty script = offline.
    struct ScriptedResolver {
        script: Mutex<VecDeque<bool>>,
    }

    impl StreamResolver for ScriptedResolver {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn resolve<'a>(
            &'a self,
            _cx: &'a ResolveContext<'a>,
        ) -> BoxFuture<'a, Result<Resolution, crate::error::ProbeError>> {
            Box::pin(async move {
                let live = self.script.lock().unwrap().pop_front().unwrap_or(false);
                if live {
                    Ok(Resolution::live("Alice", "https://cdn/x.m3u8"))
                } else {
                    Ok(Resolution::offline("Alice"))
                }
            })
        }
    }

    async fn context_with_script(
        dir: &std::path::Path,
        script: Vec<bool>,
        mut settings: Settings,
    ) -> Arc<SupervisorContext> {
        settings.push_only = true; // probe-only: no muxer in unit tests
        settings.push_check_seconds = 1;
        let settings = Arc::new(settings);
        let store = ConfigStore::open(dir.join("config.ini"), dir.join("URL_config.ini"))
            .await
            .unwrap();
        let registry = UrlRegistry::new(store.clone());
        let mut router = ResolverRouter::new(settings.clone(), store.clone());
        router.register(
            |_: &Room| true,
            Arc::new(ScriptedResolver {
                script: Mutex::new(script.into_iter().collect()),
            }),
        );
        Arc::new(SupervisorContext {
            settings,
            store,
            registry,
            router: Arc::new(router),
            governor: Governor::new(3),
            bus: EventBus::new(),
            board: StatusBoard::new(),
        })
    }

    fn test_room() -> Room {
        Room {
            url: "https://live.douyin.com/123456".into(),
            quality: Quality::Original,
            alias: None,
            platform_tag: "douyin".into(),
            platform_display: "douyin".into(),
            overseas: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn live_offline_edges_notify_once() {
        let dir = tempfile::tempdir().unwrap();
        let ctx =
            context_with_script(dir.path(), vec![false, true, true, false, true], Settings::default())
                .await;
        let mut rx = ctx.bus.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_room(test_room(), ctx.clone(), cancel.clone()));

        let mut edges = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(600), rx.recv())
                .await
                .expect("expected another edge event")
                .unwrap();
            edges.push(event.event_type);
        }
        assert_eq!(
            edges,
            vec![EventType::WentLive, EventType::WentOffline, EventType::WentLive]
        );

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn offline_probes_stay_silent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with_script(dir.path(), vec![false, false, false], Settings::default())
            .await;
        let mut rx = ctx.bus.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_room(test_room(), ctx.clone(), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(600)).await;
        cancel.cancel();
        let _ = task.await;
        assert!(rx.try_recv().is_err(), "no events expected while offline");
    }

    #[tokio::test(start_paused = true)]
    async fn first_live_probe_appends_anchor_label() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with_script(dir.path(), vec![true], Settings::default()).await;
        ctx.store
            .write_url_lines(&["原畫,https://live.douyin.com/123456".to_string()])
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_room(test_room(), ctx.clone(), cancel.clone()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        let _ = task.await;

        let lines = ctx.store.read_url_lines().await.unwrap();
        assert_eq!(
            lines,
            vec!["原畫,https://live.douyin.com/123456,主播: Alice".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pool_spawns_and_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with_script(dir.path(), vec![], Settings::default()).await;
        let shutdown = CancellationToken::new();
        let mut pool = SupervisorPool::new(ctx, shutdown.clone());

        pool.apply(RegistryEvent::Added(test_room()));
        assert_eq!(pool.room_count(), 1);
        // Adding the same canonical URL twice is a no-op.
        pool.apply(RegistryEvent::Added(test_room()));
        assert_eq!(pool.room_count(), 1);

        pool.apply(RegistryEvent::Commented {
            url: "https://live.douyin.com/123456".into(),
        });
        assert_eq!(pool.room_count(), 0);
        shutdown.cancel();
    }
}
