// src/naming.rs
//
// Deterministic file naming for recordings.
//
//   base      = "<cleaned anchor> <YYYYMMDD>"        (late-night rollback)
//   whole     = base.ext, or base-1.ext, base-2.ext … on collision
//   segments  = base-%d.ext with the start index past any existing file
//
// Reservation claims the name by atomically creating a zero-byte stub
// (`create_new`), so two racing recorders can never be handed the same path;
// losing the race just moves on to the next index.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Local, NaiveDate, Timelike};

/// Characters that must never reach the filesystem, including the fullwidth
/// twins CJK titles are full of.
const FORBIDDEN: &[char] = &[
    '/', '\\', ':', '*', '?', '"', '<', '>', '|', '&', '#', '.', ',', '，', '~', '!', ' ',
    '／', '＼', '：', '＊', '？', '＂', '＜', '＞', '｜', '＆', '＃', '。', '、', '！', '～',
    '\u{3000}',
];

/// Substituted when cleaning leaves nothing behind.
const EMPTY_PLACEHOLDER: &str = "live";

// ─── Cleaning ───────────────────────────────────────────────────────────────

fn is_emoji(c: char) -> bool {
    matches!(u32::from(c),
        0x1F000..=0x1FAFF      // pictographs, symbols, flags
        | 0x2600..=0x27BF      // misc symbols, dingbats
        | 0x2B00..=0x2BFF
        | 0xFE00..=0xFE0F      // variation selectors
        | 0x200D               // zero-width joiner
    )
}

/// Sanitize one path component (anchor name or title).
///
/// Forbidden characters become `_`, runs of `_` collapse to one, and leading /
/// trailing `_` are trimmed.  Fullwidth parentheses become ASCII so titles
/// like `（彈幕）` stay readable.
pub fn clean_component(raw: &str, strip_emoji: bool) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = false;
    for c in raw.chars() {
        let mapped = match c {
            '（' => Some('('),
            '）' => Some(')'),
            c if FORBIDDEN.contains(&c) => None,
            c if strip_emoji && is_emoji(c) => continue,
            c => Some(c),
        };
        match mapped {
            Some(c) => {
                out.push(c);
                last_underscore = false;
            }
            None => {
                if !last_underscore {
                    out.push('_');
                    last_underscore = true;
                }
            }
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        EMPTY_PLACEHOLDER.to_string()
    } else {
        trimmed.to_string()
    }
}

// ─── Dates ──────────────────────────────────────────────────────────────────

/// The date a recording belongs to.
///
/// Sessions that start before 06:00 local time keep the previous day's date,
/// so a stream running past midnight does not split its files across two
/// names.
pub fn recording_date(now: DateTime<Local>) -> NaiveDate {
    if now.hour() < 6 {
        now.date_naive() - Duration::days(1)
    } else {
        now.date_naive()
    }
}

/// `"<anchor> <YYYYMMDD>"`, the base every output file name starts from.
pub fn file_base(anchor: &str, date: NaiveDate) -> String {
    format!("{} {}", anchor, date.format("%Y%m%d"))
}

/// Directory component for date-grouped output (`2025-03-18`).
pub fn date_dir(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

// ─── Reservation ────────────────────────────────────────────────────────────

fn candidate(base: &str, k: u32, ext: &str) -> String {
    if k == 0 {
        format!("{base}.{ext}")
    } else {
        format!("{base}-{k}.{ext}")
    }
}

/// Reserve a unique output path in `dir`.
///
/// Returns `base.ext` when free, otherwise the smallest `base-k.ext` (k ≥ 1)
/// that is free.  The name is claimed by creating a zero-byte stub with
/// `create_new`, so a concurrent reservation for the same base observes the
/// claim and retries with the next index.  The muxer later overwrites the
/// stub.
pub fn reserve(dir: &Path, base: &str, ext: &str) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let mut k = 0u32;
    loop {
        let path = dir.join(candidate(base, k, ext));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => k += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Pick the start index for a segmented recording.
///
/// Returns `(template, start_index)` where `template` is `base-%d.ext` (the
/// pattern handed to the segment muxer) and `start_index` is the smallest
/// k ≥ 1 such that `base-k.ext` does not exist, so a restarted session keeps
/// counting where the previous one stopped.
pub fn reserve_segment(dir: &Path, base: &str, ext: &str) -> io::Result<(String, u32)> {
    std::fs::create_dir_all(dir)?;
    let mut k = 1u32;
    while dir.join(format!("{base}-{k}.{ext}")).exists() {
        k += 1;
    }
    Ok((format!("{base}-%d.{ext}"), k))
}

// ─── Tests ──────────────────────────────────────────────────────────────────
