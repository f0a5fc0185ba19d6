use std::path::Path;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

use crate::archive::elements::{ElementArchiver, METADATA_FILENAME};
use crate::archive::success::SuccessLedger;
use crate::archive::{self, RETRY_DELAY};
use crate::error::{PandaError, Result};
use crate::model::{json_u64, Gallery, MetadataState};
use crate::progress::ProgressRecorder;
use crate::settings::Settings;
use crate::web::WebClient;

/// Consecutive gallery failures tolerated before the run aborts.
const MAX_FAILURE_COUNT: usize = 3;

/// The update mode: walks the writable archive root and refreshes every
/// archived gallery according to its update threshold.
pub struct UpdateMode {
    settings: Rc<Settings>,
    #[allow(dead_code)]
    client: Rc<WebClient>,
    archivers: Vec<Box<dyn ElementArchiver>>,
    ledger: SuccessLedger,
}

impl UpdateMode {
    pub fn new(
        settings: Rc<Settings>,
        client: Rc<WebClient>,
        archivers: Vec<Box<dyn ElementArchiver>>,
    ) -> Self {
        let ledger = SuccessLedger::new(settings.success_dir(), settings.member_id());
        UpdateMode {
            settings,
            client,
            archivers,
            ledger,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Activating update mode.");

        archive::init_base_dirs(&self.settings)?;
        self.ledger.init()?;
        let mut progress = ProgressRecorder::new();

        let mut failure_count = 0;
        for entry in WalkDir::new(self.settings.writable_archive_dir()) {
            let entry = entry.map_err(|e| {
                PandaError::failed(format!("could not traverse the given archive directory: {e}"))
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }

            trace!("Processing directory \"{}\"...", entry.path().display());
            let Some(mut gallery) = self.parse_gallery(entry.path())? else {
                debug!(
                    "Directory does not appear to contain a gallery: \"{}\"",
                    entry.path().display()
                );
                continue;
            };

            info!(
                "Processing gallery with ID \"{}\" and token \"{}\" in directory: \"{}\".{}",
                gallery.id(),
                gallery.token(),
                gallery.dir().display(),
                progress.to_progress_string(self.ledger.total_ids())
            );
            match self.process(&mut gallery).await {
                Ok(()) => failure_count = 0,
                Err(e) => {
                    warn!("Failed processing gallery: {e}");
                    failure_count += 1;
                    if failure_count > MAX_FAILURE_COUNT {
                        return Err(PandaError::failed(format!(
                            "encountered more than {MAX_FAILURE_COUNT} failures successively, aborting"
                        )));
                    }
                    warn!("Waiting 10 seconds before continuing...");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
            progress.save_milestone();
        }

        self.ledger.delete_temp_file()
    }

    /// Runs every element archiver, finishing the gallery even when single
    /// elements keep failing, and reports the first failure afterwards.
    async fn process(&mut self, gallery: &mut Gallery) -> Result<()> {
        if !self.ledger.is_in(gallery.id()) {
            self.ledger.add_temp(gallery.id())?;
        }

        let mut last_error = None;
        for archiver in &self.archivers {
            if let Err(e) = archive::process_element_with_retries(archiver.as_ref(), gallery).await
            {
                last_error = Some(e);
            }
        }
        if let Some(e) = last_error {
            return Err(PandaError::failed(format!(
                "gallery processing finished with at least one failure: {e}"
            )));
        }

        if !self.ledger.is_in(gallery.id()) {
            // a peer might have finished this gallery in the meantime
            self.ledger.update()?;
            if !self.ledger.is_in(gallery.id()) {
                self.ledger.add(gallery.id())?;
            }
        }

        Ok(())
    }

    /// Builds a gallery from the metadata file of an archived directory,
    /// precomputing the update threshold from its posted time.
    fn parse_gallery(&self, directory: &Path) -> Result<Option<Gallery>> {
        let metadata_file = directory.join(METADATA_FILENAME);
        if !metadata_file.is_file() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&metadata_file)?;
        let metadata: Value = serde_json::from_str(&content)
            .map_err(|e| PandaError::parse(format!("unexpected JSON: {e}")))?;
        let metadata = metadata
            .as_object()
            .ok_or_else(|| PandaError::parse("metadata file is not a JSON object"))?
            .clone();

        let id = metadata
            .get("gid")
            .and_then(json_u64)
            .ok_or_else(|| PandaError::parse("metadata is missing the gallery ID"))?;
        let token = metadata
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| PandaError::parse("metadata is missing the gallery token"))?
            .to_string();
        let posted = metadata
            .get("posted")
            .and_then(json_u64)
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
            .ok_or_else(|| PandaError::parse("metadata is missing the posted time"))?;

        let mut gallery = Gallery::new(id, token, directory.to_path_buf());
        gallery.set_metadata(metadata, MetadataState::Disk);

        let threshold = self
            .settings
            .update_interval()
            .update_threshold(posted, Utc::now());
        trace!(
            "As the gallery was posted on {} the update threshold is: {}.",
            posted,
            threshold
        );
        gallery.set_update_threshold(threshold);

        Ok(Some(gallery))
    }
}
