// src/recorder.rs
//
// Recorder process supervision.
//
// ─ Architecture ─────────────────────────────────────────────────────────────
//
//   RecordPlan ──build_ffmpeg_args()──> argv
//                                        │ spawn (stdin piped, stderr piped)
//                                        ▼
//   supervise() ── select! ── child exits        → classify by exit status
//                          └─ cancel requested   → quit signal, grace, kill
//
//   stderr is drained by its own task (a blocked pipe must never stall the
//   muxer) and scanned for corruption markers.
//
// The stop contract: on unix the child gets SIGINT (ffmpeg finalizes the
// container and exits); on windows a literal `q` is written to its stdin.
// Either way we wait out a bounded grace period before killing.  A stop we
// asked for is always classified clean, whatever the exit status says.
//
// FLV rooms bypass ffmpeg entirely: the pre-signed URL is pulled by the
// built-in HTTP fetcher and streamed straight to disk.
//
// ────────────────────────────────────────────────────────────────────────────

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Container;
use crate::error::ProbeError;
use crate::resolver::USER_AGENT;

/// How long a stopped muxer gets to finalize the container before SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

// ─── Plan ───────────────────────────────────────────────────────────────────

/// Where the muxer writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordTarget {
    Whole(PathBuf),
    Segmented {
        /// `…/base-%d.ext`, as produced by `naming::reserve_segment`.
        template: PathBuf,
        start_index: u32,
        seconds: u64,
    },
}

impl RecordTarget {
    /// The path reported in logs and status (the template for segments).
    pub fn display_path(&self) -> &Path {
        match self {
            Self::Whole(p) => p,
            Self::Segmented { template, .. } => template,
        }
    }
}

/// Everything needed to start one muxer run.
#[derive(Debug, Clone)]
pub struct RecordPlan {
    pub media_url: String,
    pub container: Container,
    pub overseas: bool,
    /// Header injection some CDNs require (`origin:`, `referer:`).
    pub headers: Vec<(String, String)>,
    pub proxy: Option<String>,
    pub reencode_h264: bool,
    pub target: RecordTarget,
}

/// What a finished (or stopped) run looked like.
#[derive(Debug)]
pub struct RecordOutcome {
    pub clean: bool,
    pub exit_code: Option<i32>,
    pub output: PathBuf,
    pub elapsed: Duration,
    pub corrupt_packets: u64,
}

// ─── argv ───────────────────────────────────────────────────────────────────

/// Build the full ffmpeg argv for a plan.
///
/// Overseas hosts get roomier timeouts, probe sizes, and buffers; everything
/// else is invariant.
pub fn build_ffmpeg_args(plan: &RecordPlan) -> Vec<String> {
    let (rw_timeout, analyzeduration, probesize, bufsize) = if plan.overseas {
        ("50000000", "40000000", "20000000", "15000k")
    } else {
        ("15000000", "20000000", "10000000", "8000k")
    };

    let mut args: Vec<String> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "warning".into(),
        "-user_agent".into(),
        USER_AGENT.into(),
    ];

    if !plan.headers.is_empty() {
        let joined: String = plan
            .headers
            .iter()
            .map(|(k, v)| format!("{k}: {v}\r\n"))
            .collect();
        args.push("-headers".into());
        args.push(joined);
    }
    if let Some(proxy) = &plan.proxy {
        args.push("-http_proxy".into());
        args.push(proxy.clone());
    }

    args.extend(
        [
            "-rw_timeout",
            rw_timeout,
            "-analyzeduration",
            analyzeduration,
            "-probesize",
            probesize,
            "-thread_queue_size",
            "1024",
            "-fflags",
            "+discardcorrupt",
            "-err_detect",
            "ignore_err",
            "-correct_ts_overflow",
            "1",
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    if plan.media_url.starts_with("http") {
        args.extend(
            [
                "-reconnect_streamed",
                "1",
                "-reconnect_at_eof",
                "1",
                "-reconnect_delay_max",
                "30",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
    }

    args.push("-i".into());
    args.push(plan.media_url.clone());

    args.extend(
        [
            "-bufsize",
            bufsize,
            "-sn",
            "-dn",
            "-max_muxing_queue_size",
            "1024",
            "-avoid_negative_ts",
            "make_zero",
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    // Stream selection and codecs.
    if plan.container.is_audio_only() {
        args.push("-map".into());
        args.push("0:a".into());
        match plan.container {
            Container::Mp3 => {
                args.extend(["-c:a", "libmp3lame", "-b:a", "320k"].iter().map(|s| s.to_string()));
            }
            Container::M4a => {
                args.extend(["-c:a", "aac", "-b:a", "320k"].iter().map(|s| s.to_string()));
            }
            _ => unreachable!(),
        }
    } else {
        args.push("-map".into());
        args.push("0".into());
        let vcodec = if plan.reencode_h264
            && matches!(plan.container, Container::Mp4 | Container::Mkv)
        {
            "libx264"
        } else {
            "copy"
        };
        args.push("-c:v".into());
        args.push(vcodec.into());
        args.push("-c:a".into());
        args.push("copy".into());
    }

    let mux_format = match plan.container {
        Container::Ts => "mpegts",
        Container::Mp4 => "mp4",
        Container::Mkv => "matroska",
        Container::Mp3 => "mp3",
        Container::M4a => "ipod",
        Container::Flv => unreachable!("FLV is pulled by the HTTP fetcher"),
    };

    match &plan.target {
        RecordTarget::Whole(path) => {
            // MP4 faststart happens in post-processing; writing the moov up
            // front would mean buffering the whole session.
            args.push("-f".into());
            args.push(mux_format.into());
            args.push(path.to_string_lossy().into_owned());
        }
        RecordTarget::Segmented {
            template,
            start_index,
            seconds,
        } => {
            args.push("-f".into());
            args.push("segment".into());
            args.push("-segment_time".into());
            args.push(seconds.to_string());
            args.push("-segment_start_number".into());
            args.push(start_index.to_string());
            args.push("-segment_format".into());
            args.push(mux_format.into());
            if plan.container == Container::Mp4 {
                // A fragmented moov is the only way an interrupted segment
                // stays playable.
                args.push("-segment_format_options".into());
                args.push("movflags=+frag_keyframe+empty_moov".into());
            }
            args.push("-reset_timestamps".into());
            args.push("1".into());
            args.push(template.to_string_lossy().into_owned());
        }
    }

    args
}

// ─── Supervision ────────────────────────────────────────────────────────────

#[cfg(unix)]
async fn send_quit(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: pid came from a child we own and is still reaped by us.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGINT);
        }
    }
}

#[cfg(not(unix))]
async fn send_quit(child: &mut Child) {
    // ffmpeg treats `q` on stdin as a graceful stop request.
    if let Some(stdin) = child.stdin.as_mut() {
        let _ = stdin.write_all(b"q").await;
        let _ = stdin.flush().await;
    }
}

/// Wait for the child, honoring a cancellation request with a bounded grace
/// window.  Returns `(stop_requested, status)`.
pub(crate) async fn supervise(
    mut child: Child,
    cancel: &CancellationToken,
    grace: Duration,
) -> std::io::Result<(bool, ExitStatus)> {
    // The wait future's borrow must end before the stop path touches the
    // child again, hence the marker-value select.
    let natural = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };
    match natural {
        Some(status) => Ok((false, status?)),
        None => {
            send_quit(&mut child).await;
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => Ok((true, status?)),
                Err(_) => {
                    warn!("muxer ignored the stop request for {grace:?}, killing");
                    child.start_kill()?;
                    Ok((true, child.wait().await?))
                }
            }
        }
    }
}

/// Run one muxer process to completion (or cancellation).
///
/// The partial output file is always left on disk; classification only
/// decides what the supervisor does next.
pub async fn record(
    ffmpeg_bin: &str,
    plan: &RecordPlan,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<RecordOutcome, ProbeError> {
    let args = build_ffmpeg_args(plan);
    debug!(bin = ffmpeg_bin, ?args, "starting muxer");

    let mut child = Command::new(ffmpeg_bin)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ProbeError::network(format!("failed to spawn muxer: {e}")))?;

    let corrupt = Arc::new(AtomicU64::new(0));
    if let Some(stderr) = child.stderr.take() {
        let corrupt = corrupt.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.to_ascii_lowercase().contains("corrupt") {
                    corrupt.fetch_add(1, Ordering::Relaxed);
                }
                debug!(target: "muxer", "{line}");
            }
        });
    }

    let started = Instant::now();
    let (stop_requested, status) = supervise(child, cancel, grace)
        .await
        .map_err(|e| ProbeError::network(format!("muxer supervision failed: {e}")))?;

    let outcome = RecordOutcome {
        clean: stop_requested || status.success(),
        exit_code: status.code(),
        output: plan.target.display_path().to_path_buf(),
        elapsed: started.elapsed(),
        corrupt_packets: corrupt.load(Ordering::Relaxed),
    };
    if outcome.clean {
        info!(
            output = %outcome.output.display(),
            elapsed_secs = outcome.elapsed.as_secs(),
            corrupt = outcome.corrupt_packets,
            "muxer finished"
        );
        Ok(outcome)
    } else {
        Err(ProbeError::recorder_exit(outcome.exit_code))
    }
}

// ─── FLV fetcher ────────────────────────────────────────────────────────────

/// Pull a pre-signed FLV URL straight to `out_path`.
///
/// Cancellation closes the file after the current chunk, which leaves a
/// playable (if truncated) FLV on disk.
pub async fn record_flv(
    media_url: &str,
    headers: &[(String, String)],
    proxy: Option<&str>,
    out_path: &Path,
    cancel: &CancellationToken,
) -> Result<RecordOutcome, ProbeError> {
    let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
    if let Some(proxy) = proxy {
        builder = builder
            .proxy(reqwest::Proxy::all(proxy).map_err(|e| ProbeError::proxy_required(e.to_string()))?);
    }
    let client = builder.build().map_err(ProbeError::from)?;

    let mut request = client.get(media_url);
    for (k, v) in headers {
        request = request.header(k.as_str(), v.as_str());
    }
    let response = request.send().await.map_err(ProbeError::from)?;
    if !response.status().is_success() {
        return Err(ProbeError::network(format!(
            "FLV fetch got HTTP {}",
            response.status()
        )));
    }

    let mut file = tokio::fs::File::create(out_path)
        .await
        .map_err(ProbeError::from)?;
    let mut stream = response.bytes_stream();
    let started = Instant::now();
    let mut stopped = false;

    // Batch small chunks for fewer syscalls.
    let mut write_buf = BytesMut::with_capacity(65536);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                stopped = true;
                break;
            }
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    write_buf.put_slice(&bytes);
                    if write_buf.len() >= 32768 {
                        file.write_all(&write_buf).await.map_err(ProbeError::from)?;
                        write_buf.clear();
                    }
                }
                Some(Err(e)) => {
                    // The CDN dropping us mid-stream usually just means the
                    // broadcast ended.
                    debug!(error = %e, "FLV stream ended with error");
                    break;
                }
                None => break,
            },
        }
    }
    if !write_buf.is_empty() {
        file.write_all(&write_buf).await.map_err(ProbeError::from)?;
    }
    file.flush().await.map_err(ProbeError::from)?;

    info!(
        output = %out_path.display(),
        stopped_by_request = stopped,
        "FLV fetch finished"
    );
    Ok(RecordOutcome {
        clean: true,
        exit_code: Some(0),
        output: out_path.to_path_buf(),
        elapsed: started.elapsed(),
        corrupt_packets: 0,
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_plan(overseas: bool) -> RecordPlan {
        RecordPlan {
            media_url: "https://cdn.example.com/live.m3u8".into(),
            container: Container::Ts,
            overseas,
            headers: Vec::new(),
            proxy: None,
            reencode_h264: false,
            target: RecordTarget::Whole(PathBuf::from("/tmp/out/Alice 20250318.ts")),
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn ts_whole_args() {
        let args = build_ffmpeg_args(&ts_plan(false));
        assert!(has_pair(&args, "-f", "mpegts"));
        assert!(has_pair(&args, "-c:v", "copy"));
        assert!(has_pair(&args, "-c:a", "copy"));
        assert!(has_pair(&args, "-rw_timeout", "15000000"));
        assert!(has_pair(&args, "-avoid_negative_ts", "make_zero"));
        assert!(has_pair(&args, "-fflags", "+discardcorrupt"));
        assert!(has_pair(&args, "-err_detect", "ignore_err"));
        assert_eq!(args.last().unwrap(), "/tmp/out/Alice 20250318.ts");
    }

    #[test]
    fn overseas_widens_timeouts() {
        let args = build_ffmpeg_args(&ts_plan(true));
        assert!(has_pair(&args, "-rw_timeout", "50000000"));
        assert!(has_pair(&args, "-probesize", "20000000"));
        assert!(has_pair(&args, "-bufsize", "15000k"));
    }

    #[test]
    fn segmented_ts_args() {
        let mut plan = ts_plan(false);
        plan.target = RecordTarget::Segmented {
            template: PathBuf::from("/tmp/out/Alice 20250318-%d.ts"),
            start_index: 3,
            seconds: 1800,
        };
        let args = build_ffmpeg_args(&plan);
        assert!(has_pair(&args, "-f", "segment"));
        assert!(has_pair(&args, "-segment_time", "1800"));
        assert!(has_pair(&args, "-segment_start_number", "3"));
        assert!(has_pair(&args, "-segment_format", "mpegts"));
        assert!(has_pair(&args, "-reset_timestamps", "1"));
        assert_eq!(args.last().unwrap(), "/tmp/out/Alice 20250318-%d.ts");
    }

    #[test]
    fn mp4_whole_defers_faststart() {
        let mut plan = ts_plan(false);
        plan.container = Container::Mp4;
        plan.target = RecordTarget::Whole(PathBuf::from("/tmp/out/a.mp4"));
        let args = build_ffmpeg_args(&plan);
        assert!(has_pair(&args, "-f", "mp4"));
        assert!(!args.iter().any(|a| a.contains("faststart")));
        assert!(!args.iter().any(|a| a.contains("frag_keyframe")));
    }

    #[test]
    fn mp4_segmented_uses_fragmented_moov() {
        let mut plan = ts_plan(false);
        plan.container = Container::Mp4;
        plan.target = RecordTarget::Segmented {
            template: PathBuf::from("/tmp/out/a-%d.mp4"),
            start_index: 1,
            seconds: 600,
        };
        let args = build_ffmpeg_args(&plan);
        assert!(has_pair(&args, "-segment_format", "mp4"));
        assert!(args
            .iter()
            .any(|a| a.contains("frag_keyframe") && a.contains("empty_moov")));
    }

    #[test]
    fn reencode_switches_video_codec() {
        let mut plan = ts_plan(false);
        plan.container = Container::Mkv;
        plan.reencode_h264 = true;
        plan.target = RecordTarget::Whole(PathBuf::from("/tmp/out/a.mkv"));
        let args = build_ffmpeg_args(&plan);
        assert!(has_pair(&args, "-c:v", "libx264"));
        assert!(has_pair(&args, "-f", "matroska"));
        // TS never re-encodes regardless of the flag.
        let mut ts = ts_plan(false);
        ts.reencode_h264 = true;
        assert!(has_pair(&build_ffmpeg_args(&ts), "-c:v", "copy"));
    }

    #[test]
    fn audio_containers_map_audio_only() {
        let mut plan = ts_plan(false);
        plan.container = Container::Mp3;
        plan.target = RecordTarget::Whole(PathBuf::from("/tmp/out/a.mp3"));
        let args = build_ffmpeg_args(&plan);
        assert!(has_pair(&args, "-map", "0:a"));
        assert!(has_pair(&args, "-c:a", "libmp3lame"));
        assert!(has_pair(&args, "-b:a", "320k"));

        plan.container = Container::M4a;
        plan.target = RecordTarget::Whole(PathBuf::from("/tmp/out/a.m4a"));
        let args = build_ffmpeg_args(&plan);
        assert!(has_pair(&args, "-c:a", "aac"));
        assert!(has_pair(&args, "-f", "ipod"));
    }

    #[test]
    fn headers_and_proxy_injected() {
        let mut plan = ts_plan(true);
        plan.headers = vec![("origin".into(), "https://play.sooplive.co.kr".into())];
        plan.proxy = Some("http://127.0.0.1:7890".into());
        let args = build_ffmpeg_args(&plan);
        let header_idx = args.iter().position(|a| a == "-headers").unwrap();
        assert_eq!(args[header_idx + 1], "origin: https://play.sooplive.co.kr\r\n");
        assert!(has_pair(&args, "-http_proxy", "http://127.0.0.1:7890"));
    }

    #[test]
    fn reconnect_only_for_http_inputs() {
        let args = build_ffmpeg_args(&ts_plan(false));
        assert!(has_pair(&args, "-reconnect_at_eof", "1"));

        let mut rtmp = ts_plan(false);
        rtmp.media_url = "rtmp://cdn.example.com/live/x".into();
        let args = build_ffmpeg_args(&rtmp);
        assert!(!args.iter().any(|a| a == "-reconnect_at_eof"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn graceful_stop_within_grace() {
        // Stand-in child that would outlive the test unless stopped.
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel2.cancel();
        });

        let started = Instant::now();
        let (stop_requested, status) = supervise(child, &cancel, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(stop_requested);
        assert!(started.elapsed() < Duration::from_secs(5));
        // SIGINT kills `sleep` without a status code; a requested stop is
        // clean either way.
        assert!(stop_requested || status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn natural_exit_is_not_stop_requested() {
        let child = Command::new("true")
            .stdin(Stdio::piped())
            .spawn()
            .unwrap();
        let cancel = CancellationToken::new();
        let (stop_requested, status) = supervise(child, &cancel, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!stop_requested);
        assert!(status.success());
    }
}
