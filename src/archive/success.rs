use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::archive::fsutil;
use crate::error::{PandaError, Result};

const SUCCESS_FILENAME_PREFIX: &str = "success-";
const SUCCESS_FILENAME_SUFFIX: &str = ".txt";
const LINE_ENDING: &str = "\r\n";

/// An id set remembering insertion order, so a rewritten ledger keeps the
/// order ids were originally recorded in.
#[derive(Debug, Default)]
struct IdSet {
    order: Vec<u64>,
    set: HashSet<u64>,
}

impl IdSet {
    fn insert(&mut self, id: u64) {
        if self.set.insert(id) {
            self.order.push(id);
        }
    }

    fn remove(&mut self, id: u64) -> bool {
        if self.set.remove(&id) {
            self.order.retain(|existing| *existing != id);
            return true;
        }
        false
    }

    fn contains(&self, id: u64) -> bool {
        self.set.contains(&id)
    }
}

/// The per-user ledger of successfully archived gallery ids, shared with
/// peer users through a common directory.
///
/// Only this user's files are ever written; peers' ledgers are re-read when
/// their modification time moves past the last rescan.
pub struct SuccessLedger {
    success_dir: PathBuf,
    success_file: PathBuf,
    success_temp_file: PathBuf,
    ids: HashMap<PathBuf, IdSet>,
    updated_at: SystemTime,
}

impl SuccessLedger {
    pub fn new(success_dir: &Path, member_id: &str) -> Self {
        let success_file = success_dir.join(format!(
            "{SUCCESS_FILENAME_PREFIX}{member_id}{SUCCESS_FILENAME_SUFFIX}"
        ));
        let success_temp_file = success_dir.join(format!(
            "{SUCCESS_FILENAME_PREFIX}{member_id}-temp{SUCCESS_FILENAME_SUFFIX}"
        ));

        SuccessLedger {
            success_dir: success_dir.to_path_buf(),
            success_file,
            success_temp_file,
            ids: HashMap::new(),
            updated_at: SystemTime::UNIX_EPOCH,
        }
    }

    /// Loads all success files in the directory, deleting a temporary ledger
    /// left behind by a previous run first.
    pub fn init(&mut self) -> Result<()> {
        self.ids.clear();
        self.updated_at = SystemTime::now();

        self.delete_temp_file()?;

        for file in self.success_files() {
            self.load_file(&file)?;
        }

        Ok(())
    }

    /// Deletes the temporary success file if it exists.
    pub fn delete_temp_file(&self) -> Result<()> {
        debug!("Cleaning up possibly remaining temporary success file...");
        if let Err(e) = fs::remove_file(&self.success_temp_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(PandaError::failed(format!(
                    "could not delete temporary success file: {e}"
                )));
            }
        }

        Ok(())
    }

    /// Reloads peer ledgers whose modification time is newer than the last
    /// rescan. The timestamp is captured before scanning so a concurrent
    /// write can never be missed.
    pub fn update(&mut self) -> Result<()> {
        let now = SystemTime::now();

        for file in self.success_files() {
            if file == self.success_file || file == self.success_temp_file {
                continue;
            }
            let modified = fs::metadata(&file).and_then(|m| m.modified());
            match modified {
                Ok(modified) if modified > self.updated_at => {
                    trace!("Success file \"{}\" was updated, reloading.", file.display());
                    self.load_file(&file)?;
                }
                _ => {}
            }
        }

        self.updated_at = now;
        Ok(())
    }

    /// Checks whether any known ledger, own or peer, contains the id.
    pub fn is_in(&self, id: u64) -> bool {
        self.ids.values().any(|ids| ids.contains(id))
    }

    /// Appends the id to the temporary ledger marking it as in progress.
    pub fn add_temp(&self, id: u64) -> Result<()> {
        debug!("Adding gallery ID \"{}\" to temporary success file...", id);
        append_id(&self.success_temp_file, id).map_err(|e| {
            PandaError::failed(format!("could not add gallery ID to temporary success file: {e}"))
        })
    }

    /// Appends the id to this user's final ledger.
    pub fn add(&mut self, id: u64) -> Result<()> {
        debug!("Adding gallery ID \"{}\" to success file...", id);
        append_id(&self.success_file, id)
            .map_err(|e| PandaError::failed(format!("could not add gallery ID to success file: {e}")))?;
        self.ids.entry(self.success_file.clone()).or_default().insert(id);

        Ok(())
    }

    /// Removes the id from this user's ledger, rewriting it transactionally
    /// while preserving the order of the surviving ids.
    pub fn remove(&mut self, id: u64) -> Result<()> {
        let Some(own) = self.ids.get_mut(&self.success_file) else {
            return Ok(());
        };
        if !own.remove(id) {
            return Ok(());
        }

        debug!("Removing gallery ID \"{}\" from success file...", id);
        let lines: Vec<String> = own.order.iter().map(|id| format!("{id}{LINE_ENDING}")).collect();
        let filename = self
            .success_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PandaError::failed("invalid success file path"))?;

        fsutil::save(&self.success_dir, &filename, |path| {
            let mut file = fs::File::create(path)?;
            for line in &lines {
                file.write_all(line.as_bytes())?;
            }
            Ok(())
        })
    }

    /// The number of distinct ids across all known ledgers. Used as the
    /// community-wide total for progress reporting.
    pub fn total_ids(&self) -> usize {
        let mut all: HashSet<u64> = HashSet::new();
        for ids in self.ids.values() {
            all.extend(&ids.set);
        }
        all.len()
    }

    fn success_files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.success_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| is_success_file(path))
            .collect()
    }

    fn load_file(&mut self, file: &Path) -> Result<()> {
        debug!("Loading success file: {}", file.display());

        let content = fs::read_to_string(file)
            .map_err(|e| PandaError::failed(format!("failed reading success file: {e}")))?;

        let mut ids = IdSet::default();
        for line in content.lines() {
            let line = line.trim_end_matches('\r').trim();
            if line.is_empty() {
                continue;
            }
            let id: u64 = line
                .parse()
                .map_err(|_| PandaError::parse(format!("invalid gallery ID: \"{line}\"")))?;
            ids.insert(id);
        }
        self.ids.insert(file.to_path_buf(), ids);

        Ok(())
    }
}

fn is_success_file(path: &Path) -> bool {
    path.file_name()
        .map(|name| {
            let name = name.to_string_lossy();
            name.starts_with(SUCCESS_FILENAME_PREFIX) && name.ends_with(SUCCESS_FILENAME_SUFFIX)
        })
        .unwrap_or(false)
}

fn append_id(file: &Path, id: u64) -> std::io::Result<()> {
    let mut handle = OpenOptions::new().create(true).append(true).open(file)?;
    handle.write_all(format!("{id}{LINE_ENDING}").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_loads_own_and_peer_ledgers() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("success-1.txt"), "100\r\n101\r\n").unwrap();
        fs::write(dir.path().join("success-2.txt"), "200\r\n").unwrap();
        fs::write(dir.path().join("unrelated.txt"), "999\r\n").unwrap();

        let mut ledger = SuccessLedger::new(dir.path(), "1");
        ledger.init().unwrap();

        assert!(ledger.is_in(100));
        assert!(ledger.is_in(200));
        assert!(!ledger.is_in(999));
        assert_eq!(ledger.total_ids(), 3);
    }

    #[test]
    fn init_removes_a_leftover_temp_ledger() {
        let dir = tempdir().unwrap();
        let temp = dir.path().join("success-1-temp.txt");
        fs::write(&temp, "100\r\n").unwrap();

        let mut ledger = SuccessLedger::new(dir.path(), "1");
        ledger.init().unwrap();

        assert!(!temp.exists());
    }

    #[test]
    fn added_ids_land_in_the_final_ledger() {
        let dir = tempdir().unwrap();
        let mut ledger = SuccessLedger::new(dir.path(), "1");
        ledger.init().unwrap();

        ledger.add_temp(100).unwrap();
        ledger.add(100).unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("success-1.txt")).unwrap(),
            "100\r\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("success-1-temp.txt")).unwrap(),
            "100\r\n"
        );
        assert!(ledger.is_in(100));
    }

    #[test]
    fn remove_rewrites_preserving_order() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("success-1.txt"), "300\r\n100\r\n200\r\n").unwrap();

        let mut ledger = SuccessLedger::new(dir.path(), "1");
        ledger.init().unwrap();
        ledger.remove(100).unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("success-1.txt")).unwrap(),
            "300\r\n200\r\n"
        );
        assert!(!ledger.is_in(100));
    }

    #[test]
    fn update_picks_up_new_peer_writes() {
        let dir = tempdir().unwrap();
        let mut ledger = SuccessLedger::new(dir.path(), "1");
        ledger.init().unwrap();
        assert!(!ledger.is_in(500));

        // a peer finishes a gallery mid-run; give the mtime room to move
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(dir.path().join("success-2.txt"), "500\r\n").unwrap();
        ledger.update().unwrap();

        assert!(ledger.is_in(500));
    }

    #[test]
    fn invalid_ledger_lines_fail_loading() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("success-1.txt"), "abc\r\n").unwrap();

        let mut ledger = SuccessLedger::new(dir.path(), "1");
        assert!(ledger.init().is_err());
    }
}
