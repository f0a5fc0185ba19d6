use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::error::{PandaError, Result};
use crate::web::Download;

/// 258 characters according to Windows MAX_PATH for files inside a drive root.
const MAX_PATH_LENGTH: usize = 258;
/// File systems commonly allow up to 255 byte file names.
const MAX_FILENAME_LENGTH: usize = 255;
/// Overhead of the temporary ".tmp" extension.
const TMP_OVERHEAD: usize = 4;
/// Overhead of duplicate suffixes up to " (99)".
const DUPLICATE_OVERHEAD: usize = 5;

const MAX_FILENAME_UNIQUE_UTF8_BYTES: usize = MAX_FILENAME_LENGTH - TMP_OVERHEAD;
const MAX_FILENAME_UNIQUE_UTF16_BYTES: usize = MAX_FILENAME_LENGTH - TMP_OVERHEAD * 2;
const MAX_FILENAME_NON_UNIQUE_UTF8_BYTES: usize =
    MAX_FILENAME_UNIQUE_UTF8_BYTES - DUPLICATE_OVERHEAD;
const MAX_FILENAME_NON_UNIQUE_UTF16_BYTES: usize =
    MAX_FILENAME_UNIQUE_UTF16_BYTES - DUPLICATE_OVERHEAD * 2;

/// Creates the directory if at least its parent already exists.
pub fn init_dir(dir: &Path) -> Result<()> {
    let parent_exists = dir
        .parent()
        .map(|parent| parent.as_os_str().is_empty() || parent.is_dir())
        .unwrap_or(false);
    if !parent_exists {
        return Err(PandaError::failed(format!(
            "parent of the directory \"{}\" does not exist",
            dir.display()
        )));
    }

    fs::create_dir_all(dir)
        .map_err(|e| PandaError::failed(format!("could not create directory: {e}")))
}

/// Saves a file through the given writer while making sure a valid prior
/// version survives any failure.
///
/// The writer targets `<filename>.tmp`; an existing file is moved aside to
/// `<filename>.bak` before the temporary file takes its place, and the backup
/// is removed again on success. Any failure deletes the temporary file and
/// leaves the backup (or the untouched original) behind.
pub fn save<F>(dir: &Path, filename: &str, writer: F) -> Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let temp_file = dir.join(format!("{filename}.tmp"));

    debug!("Writing to temporary file \"{}\"...", temp_file.display());
    if let Err(e) = writer(&temp_file) {
        remove_temp_file(&temp_file)?;
        return Err(PandaError::failed(format!("could not save file: {e}")));
    }

    commit(dir, filename)
}

/// Streams a download to disk through the same temporary-file commit path as
/// [`save`]. Returns the number of bytes written.
pub async fn save_download(dir: &Path, filename: &str, download: Download) -> Result<u64> {
    let temp_file = dir.join(format!("{filename}.tmp"));

    debug!("Writing to temporary file \"{}\"...", temp_file.display());
    let written = async {
        let mut file = tokio::fs::File::create(&temp_file).await?;
        download.persist_to(&mut file).await
    }
    .await;

    match written {
        Ok(written) => {
            commit(dir, filename)?;
            Ok(written)
        }
        Err(e) => {
            remove_temp_file(&temp_file)?;
            Err(e)
        }
    }
}

/// Promotes `<filename>.tmp` to `<filename>`, backing up and cleaning up an
/// existing file along the way.
fn commit(dir: &Path, filename: &str) -> Result<()> {
    let file = dir.join(filename);
    let temp_file = dir.join(format!("{filename}.tmp"));
    let backup_file = dir.join(format!("{filename}.bak"));

    let renamed = (|| -> io::Result<()> {
        if file.exists() {
            debug!(
                "Creating backup of existing file \"{}\" as \"{}\"...",
                file.display(),
                backup_file.display()
            );
            fs::rename(&file, &backup_file)?;
        }

        debug!(
            "Removing temporary file extension from \"{}\" into \"{}\"...",
            temp_file.display(),
            file.display()
        );
        fs::rename(&temp_file, &file)
    })();

    if let Err(e) = renamed {
        remove_temp_file(&temp_file)?;
        return Err(PandaError::failed(format!("could not save file: {e}")));
    }

    if backup_file.exists() {
        debug!("Removing backup file \"{}\"...", backup_file.display());
        if let Err(e) = fs::remove_file(&backup_file) {
            warn!("Removing backup file failed. Manual clean-up required: {e}");
        }
    }

    Ok(())
}

fn remove_temp_file(temp_file: &Path) -> Result<()> {
    if let Err(e) = fs::remove_file(temp_file) {
        if e.kind() != io::ErrorKind::NotFound {
            return Err(PandaError::failed(format!(
                "could not delete temporary file: {e}"
            )));
        }
    }

    Ok(())
}

/// Sanitizes a filename derived from server input so it can be stored on any
/// of the supported file systems, resolving collisions within `dir`.
pub fn sanitize_filename(dir: &Path, filename: &str, unique: bool) -> Result<String> {
    trace!("Sanitizing the filename \"{}\"...", filename);

    let mut sanitized = legalize_filename(filename);
    if sanitized != filename {
        debug!("Legalized filename to \"{}\".", sanitized);
    }

    let truncated = truncate_filename(dir, &sanitized, unique)?;
    if truncated != sanitized {
        sanitized = truncated;
        debug!("Truncated filename to \"{}\".", sanitized);
    }

    let decollided = decollide_filename(dir, &sanitized, unique)?;
    if decollided != sanitized {
        sanitized = decollided;
        debug!("Removed filename collisions to \"{}\".", sanitized);
    }

    Ok(sanitized)
}

/// Replaces characters many file systems refuse with their full-width
/// equivalents and strips control characters.
fn legalize_filename(filename: &str) -> String {
    filename
        .chars()
        .filter_map(|c| match c {
            '\\' => Some('＼'),
            '/' => Some('／'),
            '|' => Some('｜'),
            ':' => Some('：'),
            '?' => Some('？'),
            '*' => Some('＊'),
            '"' => Some('＂'),
            '<' => Some('＜'),
            '>' => Some('＞'),
            '\u{0}'..='\u{1f}' | '\u{7f}' => None,
            other => Some(other),
        })
        .collect()
}

fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(index) => filename.split_at(index),
        None => (filename, ""),
    }
}

/// Truncates the base name so both the absolute path and the filename itself
/// fit the file system limits, accounting for the worst-case suffixes.
fn truncate_filename(dir: &Path, filename: &str, unique: bool) -> Result<String> {
    let (base_name, dotted_extension) = split_extension(filename);

    let mut max_suffix = String::new();
    if !unique {
        max_suffix.push_str(" (99)");
    }
    max_suffix.push_str(dotted_extension);
    max_suffix.push_str(".tmp");

    let file = dir.join(format!("{base_name}{max_suffix}"));
    let absolute = std::path::absolute(&file).unwrap_or(file);
    let path_length = absolute.to_string_lossy().encode_utf16().count();
    let mut truncated_for_path = base_name.to_string();
    if path_length > MAX_PATH_LENGTH {
        let excessive = path_length - MAX_PATH_LENGTH;
        let base_length = base_name.chars().count();
        if excessive >= base_length {
            return Err(PandaError::failed(
                "cannot truncate file name enough to fulfil limits",
            ));
        }
        truncated_for_path = base_name.chars().take(base_length - excessive).collect();
    }

    let max_utf8 = if unique {
        MAX_FILENAME_UNIQUE_UTF8_BYTES
    } else {
        MAX_FILENAME_NON_UNIQUE_UTF8_BYTES
    };
    let truncated_utf8 = truncate_base_name(base_name, &max_suffix, max_utf8, utf8_len)?;

    let max_utf16 = if unique {
        MAX_FILENAME_UNIQUE_UTF16_BYTES
    } else {
        MAX_FILENAME_NON_UNIQUE_UTF16_BYTES
    };
    let truncated_utf16 = truncate_base_name(base_name, &max_suffix, max_utf16, utf16_len)?;

    let min_base = [truncated_for_path, truncated_utf8, truncated_utf16]
        .into_iter()
        .min_by_key(|s| s.encode_utf16().count())
        .unwrap_or_default();

    Ok(format!("{min_base}{dotted_extension}").trim().to_string())
}

fn utf8_len(c: char) -> usize {
    c.len_utf8()
}

fn utf16_len(c: char) -> usize {
    c.len_utf16() * 2
}

/// Truncates the base name to fit the given byte budget under the given
/// encoding, leaving room for the suffix.
fn truncate_base_name(
    base_name: &str,
    suffix: &str,
    byte_count: usize,
    encoded_len: fn(char) -> usize,
) -> Result<String> {
    let suffix_bytes: usize = suffix.chars().map(encoded_len).sum();
    let budget = byte_count.checked_sub(suffix_bytes).filter(|b| *b > 0);
    let Some(budget) = budget else {
        return Err(PandaError::failed(
            "cannot truncate file name enough to fulfil limits",
        ));
    };

    let mut used = 0;
    let mut result = String::new();
    for c in base_name.chars() {
        let len = encoded_len(c);
        if used + len > budget {
            break;
        }
        used += len;
        result.push(c);
    }

    Ok(result)
}

/// Resolves case-insensitive collisions: unique filenames replace the
/// existing file, non-unique ones get a ` (2)` … ` (99)` suffix.
fn decollide_filename(dir: &Path, filename: &str, unique: bool) -> Result<String> {
    let (base_name, dotted_extension) = split_extension(filename);

    let max_suffix = if unique { 1 } else { 99 };
    for i in 1..=max_suffix {
        let candidate = if i > 1 {
            format!("{base_name} ({i}){dotted_extension}")
        } else {
            filename.to_string()
        };

        let existing = list_files_lowercase(dir)?;
        if let Some(existing_file) = existing.get(&candidate.to_lowercase()) {
            if unique {
                fs::remove_file(existing_file).map_err(|e| {
                    PandaError::failed(format!("could not delete file colliding by filename: {e}"))
                })?;
            } else if i == max_suffix {
                return Err(PandaError::failed("non-colliding filenames exhausted"));
            } else {
                continue;
            }
        }

        return Ok(candidate);
    }

    Err(PandaError::failed(
        "unexpected state while looking for non-colliding filename",
    ))
}

fn list_files_lowercase(dir: &Path) -> Result<HashMap<String, PathBuf>> {
    let mut result = HashMap::new();
    if !dir.is_dir() {
        return Ok(result);
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        result.insert(
            entry.file_name().to_string_lossy().to_lowercase(),
            entry.path(),
        );
    }

    Ok(result)
}

/// Sums the size of all regular files below the given directory.
pub fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

/// Formats a byte count with a human-readable unit.
pub fn format_byte_count(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let bytes_f = bytes as f64;
    if bytes_f >= GB {
        format!("{:.2} GB", bytes_f / GB)
    } else if bytes_f >= MB {
        format!("{:.2} MB", bytes_f / MB)
    } else if bytes_f >= KB {
        format!("{:.2} KB", bytes_f / KB)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_replaces_content_and_leaves_no_temp() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("file.txt"), "old").unwrap();

        save(dir.path(), "file.txt", |path| fs::write(path, "new")).unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("file.txt")).unwrap(), "new");
        assert!(!dir.path().join("file.txt.tmp").exists());
        assert!(!dir.path().join("file.txt.bak").exists());
    }

    #[test]
    fn failing_writer_preserves_the_previous_version() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("file.txt"), "old").unwrap();

        let result = save(dir.path(), "file.txt", |path| {
            fs::write(path, "partial")?;
            Err(io::Error::other("writer exploded"))
        });

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(dir.path().join("file.txt")).unwrap(), "old");
        assert!(!dir.path().join("file.txt.tmp").exists());
    }

    #[test]
    fn save_creates_new_files() {
        let dir = tempdir().unwrap();
        save(dir.path(), "fresh.txt", |path| fs::write(path, "data")).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("fresh.txt")).unwrap(), "data");
    }

    #[test]
    fn illegal_characters_become_full_width() {
        let dir = tempdir().unwrap();
        let sanitized = sanitize_filename(dir.path(), "a/b\\c:d*e?f\"g<h>i|j.txt", true).unwrap();
        assert_eq!(sanitized, "a／b＼c：d＊e？f＂g＜h＞i｜j.txt");
    }

    #[test]
    fn control_characters_are_stripped() {
        let dir = tempdir().unwrap();
        let sanitized = sanitize_filename(dir.path(), "a\u{0}b\u{1f}c\u{7f}d.txt", true).unwrap();
        assert_eq!(sanitized, "abcd.txt");
    }

    #[test]
    fn sanitization_is_idempotent() {
        let dir = tempdir().unwrap();
        let input = format!("long {} na/me\u{3042}.zip", "x".repeat(300));
        let once = sanitize_filename(dir.path(), &input, true).unwrap();
        let twice = sanitize_filename(dir.path(), &once, true).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn long_names_are_truncated_preserving_the_extension() {
        let dir = tempdir().unwrap();
        let input = format!("{}.txt", "a".repeat(300));

        let unique = sanitize_filename(dir.path(), &input, true).unwrap();
        // UTF-16 is the binding constraint for ASCII: (247 - 16) / 2 chars
        assert_eq!(unique, format!("{}.txt", "a".repeat(115)));

        let non_unique = sanitize_filename(dir.path(), &input, false).unwrap();
        // the worst-case suffix grows by " (99)": (237 - 26) / 2 chars
        assert_eq!(non_unique, format!("{}.txt", "a".repeat(105)));
    }

    #[test]
    fn unique_collisions_replace_the_existing_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("File.zip"), "old").unwrap();

        let sanitized = sanitize_filename(dir.path(), "file.zip", true).unwrap();
        assert_eq!(sanitized, "file.zip");
        // the case-insensitively colliding file is gone
        assert!(!dir.path().join("File.zip").exists());
    }

    #[test]
    fn non_unique_collisions_get_a_numbered_suffix() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("file.torrent"), "one").unwrap();
        fs::write(dir.path().join("file (2).torrent"), "two").unwrap();

        let sanitized = sanitize_filename(dir.path(), "file.torrent", false).unwrap();
        assert_eq!(sanitized, "file (3).torrent");
        assert!(dir.path().join("file.torrent").exists());
    }

    #[test]
    fn byte_counts_format_with_units() {
        assert_eq!(format_byte_count(512), "512 B");
        assert_eq!(format_byte_count(2048), "2.00 KB");
        assert_eq!(format_byte_count(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn init_dir_requires_an_existing_parent() {
        let dir = tempdir().unwrap();
        assert!(init_dir(&dir.path().join("child")).is_ok());
        assert!(init_dir(&dir.path().join("missing").join("child")).is_err());
    }
}
