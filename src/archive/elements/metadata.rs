use std::rc::Rc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::archive::elements::{self, ElementArchiver, METADATA_FILENAME};
use crate::archive::fsutil;
use crate::error::{PandaError, Result};
use crate::model::{Gallery, MetadataState};
use crate::settings::{Element, Settings};
use crate::web::WebClient;

/// Loads gallery metadata on demand and keeps track of how fresh the copy a
/// gallery holds is. Shared by every archiver that needs API data.
pub struct MetadataService {
    settings: Rc<Settings>,
    client: Rc<WebClient>,
}

impl MetadataService {
    pub fn new(settings: Rc<Settings>, client: Rc<WebClient>) -> Self {
        MetadataService { settings, client }
    }

    /// Makes sure some metadata is held, fetching it online if none is.
    pub async fn ensure_loaded(&self, gallery: &mut Gallery) -> Result<()> {
        if !gallery.is_metadata_loaded() {
            self.load_online(gallery).await?;
        }

        Ok(())
    }

    /// Makes sure the held metadata is recent enough for freshness-sensitive
    /// decisions, preferring the on-disk copy when it is new enough.
    pub async fn ensure_loaded_up_to_date(&self, gallery: &mut Gallery) -> Result<()> {
        if !gallery.is_metadata_loaded() && !self.load_from_disk(gallery)? {
            self.load_online(gallery).await?;
            return Ok(());
        }

        if gallery.metadata_state() == Some(MetadataState::Disk) {
            if elements::is_file_stale(&self.settings, gallery, METADATA_FILENAME) {
                self.load_online(gallery).await?;
            } else {
                gallery.set_metadata_state(MetadataState::DiskUpToDate);
            }
        }

        Ok(())
    }

    /// Makes sure the metadata was fetched during this run.
    pub async fn ensure_loaded_online(&self, gallery: &mut Gallery) -> Result<()> {
        if gallery.metadata_state() != Some(MetadataState::Online) {
            self.load_online(gallery).await?;
        }

        Ok(())
    }

    async fn load_online(&self, gallery: &mut Gallery) -> Result<()> {
        info!("Loading metadata...");

        let gdata = self
            .client
            .load_metadata(&[(gallery.id(), gallery.token())])
            .await?;

        let metadata = gdata
            .get("gmetadata")
            .and_then(Value::as_array)
            .filter(|entries| entries.len() == 1)
            .and_then(|entries| entries[0].as_object())
            .ok_or_else(|| PandaError::parse("unexpected metadata response"))?;

        gallery.set_metadata(metadata.clone(), MetadataState::Online);

        Ok(())
    }

    fn load_from_disk(&self, gallery: &mut Gallery) -> Result<bool> {
        let file = gallery.dir().join(METADATA_FILENAME);
        if !file.is_file() {
            return Ok(false);
        }

        let content = std::fs::read_to_string(&file)?;
        let metadata: Value = serde_json::from_str(&content)?;
        let metadata = metadata
            .as_object()
            .ok_or_else(|| PandaError::parse("metadata file is not a JSON object"))?;
        gallery.set_metadata(metadata.clone(), MetadataState::Disk);

        Ok(true)
    }
}

/// Archives the gdata API response as `api-metadata.json`.
pub struct MetadataArchiver {
    settings: Rc<Settings>,
    service: Rc<MetadataService>,
}

impl MetadataArchiver {
    pub fn new(settings: Rc<Settings>, service: Rc<MetadataService>) -> Self {
        MetadataArchiver { settings, service }
    }

    fn is_required(&self, gallery: &Gallery) -> bool {
        if !self.settings.is_active(Element::Metadata) {
            return false;
        }

        !gallery.dir().join(METADATA_FILENAME).is_file()
            || elements::is_file_stale(&self.settings, gallery, METADATA_FILENAME)
    }

    async fn save(&self, gallery: &mut Gallery) -> Result<()> {
        self.service.ensure_loaded_up_to_date(gallery).await?;

        let metadata = gallery
            .metadata()
            .ok_or_else(|| PandaError::parse("metadata went missing after loading"))?;
        let title = metadata.get("title").and_then(Value::as_str).unwrap_or_default();
        if title.is_empty() {
            return Err(PandaError::parse("metadata is missing a title"));
        }

        info!("Saving metadata...");
        fsutil::init_dir(gallery.dir())?;
        let content = serde_json::to_string_pretty(metadata)?;
        fsutil::save(gallery.dir(), METADATA_FILENAME, |path| {
            std::fs::write(path, &content)
        })
    }
}

#[async_trait(?Send)]
impl ElementArchiver for MetadataArchiver {
    fn name(&self) -> &'static str {
        "metadata"
    }

    async fn process(&self, gallery: &mut Gallery) -> Result<()> {
        if self.is_required(gallery) {
            self.save(gallery).await
        } else {
            debug!("Metadata does not need to be archived.");
            Ok(())
        }
    }
}
