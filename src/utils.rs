//! Recording directory and file-name helpers

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};
use tracing::{debug, info, warn};

use crate::error::Result;

const FILE_PREFIX: &str = "screen_recording_";
const FILE_EXTENSION: &str = "mp4";

/// Where recordings land when the config does not say otherwise.
pub fn default_recordings_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("screencast"))
        .unwrap_or_else(|| PathBuf::from("recordings"))
}

/// `screen_recording_YYYY_MM_DD__hh_mm_ss_zzz.mp4`
pub fn recording_file_name<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{FILE_PREFIX}{}.{FILE_EXTENSION}",
        at.format("%Y_%m_%d__%H_%M_%S_%3f")
    )
}

/// Path for a recording started now.
pub fn new_recording_path(dir: &Path) -> PathBuf {
    dir.join(recording_file_name(&chrono::Local::now()))
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        fs::create_dir_all(dir)?;
        info!(dir = %dir.display(), "created recordings directory");
    }
    Ok(())
}

pub fn is_recording_file(path: &Path) -> bool {
    let name_matches = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(FILE_PREFIX));
    let extension_matches = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == FILE_EXTENSION);
    name_matches && extension_matches
}

/// Delete every recording in `dir`, leaving other files alone. Returns how
/// many were removed.
pub fn clean_recordings(dir: &Path) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() || !is_recording_file(&path) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed recording");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), "failed to remove recording: {}", e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("screencast-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn file_name_carries_millisecond_timestamp() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_milli_opt(7, 5, 2, 42)
            .unwrap()
            .and_local_timezone(Utc)
            .unwrap();
        assert_eq!(
            recording_file_name(&at),
            "screen_recording_2024_03_09__07_05_02_042.mp4"
        );
    }

    #[test]
    fn cleaning_only_touches_recordings() {
        let dir = scratch_dir("clean");
        fs::write(dir.join("screen_recording_2024_01_01__00_00_00_000.mp4"), b"x").unwrap();
        fs::write(dir.join("screen_recording_2024_01_01__00_00_01_000.mp4"), b"x").unwrap();
        fs::write(dir.join("notes.txt"), b"keep").unwrap();
        fs::write(dir.join("holiday.mp4"), b"keep").unwrap();

        assert_eq!(clean_recordings(&dir).unwrap(), 2);
        assert!(dir.join("notes.txt").exists());
        assert!(dir.join("holiday.mp4").exists());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_dir_has_nothing_to_clean() {
        let dir = std::env::temp_dir().join("screencast-does-not-exist-4d2a");
        assert_eq!(clean_recordings(&dir).unwrap(), 0);
    }
}
