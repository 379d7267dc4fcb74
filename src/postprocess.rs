// src/postprocess.rs
//
// Post-recording container work: conversion to MP4/M4A (with faststart) and
// post-hoc time-slicing of a finished file.  Live segmentation uses the
// muxer's native segment format (recorder.rs); the re-invocation approach
// here only ever runs against a file that is already closed.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ProbeError;
use crate::naming;

// ─── Helpers ────────────────────────────────────────────────────────────────

async fn run_tool(bin: &str, args: &[String]) -> Result<String, ProbeError> {
    debug!(bin, ?args, "running media tool");
    let output = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::network(format!("failed to run {bin}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::parse(format!(
            "{bin} exited with {:?}: {}",
            output.status.code(),
            stderr.trim().chars().take(300).collect::<String>()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn delete_if(flag: bool, path: &Path) {
    if flag {
        match std::fs::remove_file(path) {
            Ok(()) => info!(path = %path.display(), "source file deleted"),
            Err(e) => warn!(path = %path.display(), error = %e, "source delete failed"),
        }
    }
}

// ─── Duration probe ─────────────────────────────────────────────────────────

pub(crate) fn parse_duration(stdout: &str) -> Result<f64, ProbeError> {
    stdout
        .trim()
        .parse::<f64>()
        .map_err(|_| ProbeError::parse(format!("unparseable ffprobe duration: {stdout:?}")))
}

/// Container duration in seconds, via ffprobe.
pub async fn probe_duration(ffprobe_bin: &str, path: &Path) -> Result<f64, ProbeError> {
    let args: Vec<String> = vec![
        "-v".into(),
        "error".into(),
        "-show_entries".into(),
        "format=duration".into(),
        "-of".into(),
        "default=noprint_wrappers=1:nokey=1".into(),
        path.to_string_lossy().into_owned(),
    ];
    let stdout = run_tool(ffprobe_bin, &args).await?;
    parse_duration(&stdout)
}

// ─── Conversion ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertTarget {
    Mp4,
    M4a,
}

impl ConvertTarget {
    fn ext(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::M4a => "m4a",
        }
    }
}

pub(crate) fn build_convert_args(
    src: &Path,
    dst: &Path,
    target: ConvertTarget,
    reencode_h264: bool,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        src.to_string_lossy().into_owned(),
    ];
    match target {
        ConvertTarget::Mp4 => {
            if reencode_h264 {
                args.extend(["-c:v", "libx264", "-c:a", "aac"].iter().map(|s| s.to_string()));
            } else {
                args.extend(["-c:v", "copy", "-c:a", "copy"].iter().map(|s| s.to_string()));
            }
        }
        ConvertTarget::M4a => {
            args.extend(
                ["-vn", "-c:a", "aac", "-b:a", "320k"].iter().map(|s| s.to_string()),
            );
        }
    }
    args.extend(["-movflags", "+faststart"].iter().map(|s| s.to_string()));
    args.push(dst.to_string_lossy().into_owned());
    args
}

/// Convert a finished recording to MP4 or M4A.
///
/// The destination name is reserved next to the source, so a re-run never
/// clobbers an earlier conversion.  The source survives unless the user asked
/// for it to be deleted.
pub async fn convert(
    ffmpeg_bin: &str,
    src: &Path,
    target: ConvertTarget,
    reencode_h264: bool,
    delete_source: bool,
) -> Result<PathBuf, ProbeError> {
    let dir = src.parent().unwrap_or_else(|| Path::new("."));
    let stem = src
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| ProbeError::parse("source has no usable file stem"))?;
    let dst = naming::reserve(dir, stem, target.ext()).map_err(ProbeError::from)?;

    let args = build_convert_args(src, &dst, target, reencode_h264);
    run_tool(ffmpeg_bin, &args).await?;
    info!(src = %src.display(), dst = %dst.display(), "conversion finished");

    delete_if(delete_source, src);
    Ok(dst)
}

/// Rewrite an MP4 in place with the moov atom up front.
pub async fn apply_faststart(ffmpeg_bin: &str, path: &Path) -> Result<(), ProbeError> {
    let tmp = path.with_extension("faststart.tmp.mp4");
    let args: Vec<String> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        path.to_string_lossy().into_owned(),
        "-c".into(),
        "copy".into(),
        "-movflags".into(),
        "+faststart".into(),
        tmp.to_string_lossy().into_owned(),
    ];
    run_tool(ffmpeg_bin, &args).await?;
    tokio::fs::rename(&tmp, path).await.map_err(ProbeError::from)?;
    Ok(())
}

// ─── Post-hoc segmentation ──────────────────────────────────────────────────

/// `⌈duration / seconds⌉`, with at least one slice for any positive duration.
pub(crate) fn slice_count(duration: f64, seconds: u64) -> u32 {
    if duration <= 0.0 {
        return 0;
    }
    (duration / seconds as f64).ceil() as u32
}

/// Reserve `count` output names in order.  Numbering survives collisions with
/// whatever already sits in the directory.
pub(crate) fn plan_segment_outputs(
    dir: &Path,
    stem: &str,
    ext: &str,
    count: u32,
) -> std::io::Result<Vec<PathBuf>> {
    (0..count).map(|_| naming::reserve(dir, stem, ext)).collect()
}

pub(crate) fn build_slice_args(src: &Path, dst: &Path, start: u64, seconds: u64) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-ss".into(),
        start.to_string(),
        "-i".into(),
        src.to_string_lossy().into_owned(),
        "-t".into(),
        seconds.to_string(),
        "-c".into(),
        "copy".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
    ];
    args.push(dst.to_string_lossy().into_owned());
    args
}

/// Slice a finished file into `seconds`-long pieces.
///
/// Slice `i` covers `[i*seconds, (i+1)*seconds)`; only the last may be
/// shorter.  MP4 slices get a follow-up faststart pass.
pub async fn segment(
    ffmpeg_bin: &str,
    ffprobe_bin: &str,
    src: &Path,
    seconds: u64,
    delete_source: bool,
) -> Result<Vec<PathBuf>, ProbeError> {
    let duration = probe_duration(ffprobe_bin, src).await?;
    let count = slice_count(duration, seconds);
    if count <= 1 {
        debug!(src = %src.display(), duration, "shorter than one segment, leaving as is");
        return Ok(vec![src.to_path_buf()]);
    }

    let dir = src.parent().unwrap_or_else(|| Path::new("."));
    let stem = src
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| ProbeError::parse("source has no usable file stem"))?;
    let ext = src
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("ts")
        .to_string();
    let is_mp4 = ext.eq_ignore_ascii_case("mp4");

    let outputs = plan_segment_outputs(dir, stem, &ext, count).map_err(ProbeError::from)?;
    for (i, dst) in outputs.iter().enumerate() {
        let args = build_slice_args(src, dst, i as u64 * seconds, seconds);
        run_tool(ffmpeg_bin, &args).await?;
        if is_mp4 {
            apply_faststart(ffmpeg_bin, dst).await?;
        }
    }
    info!(
        src = %src.display(),
        slices = outputs.len(),
        seconds,
        "post-hoc segmentation finished"
    );

    delete_if(delete_source, src);
    Ok(outputs)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
