use std::rc::Rc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::archive::elements::{ElementArchiver, MetadataService, THUMBNAIL_FILENAME};
use crate::archive::fsutil;
use crate::error::{PandaError, Result};
use crate::model::Gallery;
use crate::settings::{Element, Settings};
use crate::web::WebClient;

static THUMBNAIL_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_l\.jpg$").expect("static regex"));

/// Archives a high-quality thumbnail as `thumbnail.jpg`.
///
/// Deliberately ignores the unavailability sentinel: thumbnails remain
/// valuable even for galleries that disappeared.
pub struct ThumbnailArchiver {
    settings: Rc<Settings>,
    client: Rc<WebClient>,
    metadata: Rc<MetadataService>,
}

impl ThumbnailArchiver {
    pub fn new(
        settings: Rc<Settings>,
        client: Rc<WebClient>,
        metadata: Rc<MetadataService>,
    ) -> Self {
        ThumbnailArchiver {
            settings,
            client,
            metadata,
        }
    }

    fn is_required(&self, gallery: &Gallery) -> bool {
        self.settings.is_active(Element::Thumbnail)
            && !gallery.dir().join(THUMBNAIL_FILENAME).is_file()
    }

    async fn save(&self, gallery: &mut Gallery) -> Result<()> {
        self.metadata.ensure_loaded(gallery).await?;

        let thumb = gallery
            .metadata()
            .and_then(|m| m.get("thumb"))
            .and_then(Value::as_str)
            .ok_or_else(|| PandaError::parse("metadata is missing the thumbnail URL"))?;

        let url = THUMBNAIL_SUFFIX.replace(thumb, "_300.jpg");
        if url == thumb {
            return Err(PandaError::failed(
                "failed creating HQ thumbnail URL, the format might have changed",
            ));
        }

        info!("Saving thumbnail...");
        let download = self.client.download_file(Url::parse(&url)?).await?;
        if download.mime() != Some("image/jpeg") {
            return Err(PandaError::failed(format!(
                "expected a JPEG thumbnail but received {:?}",
                download.mime()
            )));
        }

        fsutil::init_dir(gallery.dir())?;
        fsutil::save_download(gallery.dir(), THUMBNAIL_FILENAME, download).await?;

        Ok(())
    }
}

#[async_trait(?Send)]
impl ElementArchiver for ThumbnailArchiver {
    fn name(&self) -> &'static str {
        "thumbnail"
    }

    async fn process(&self, gallery: &mut Gallery) -> Result<()> {
        if self.is_required(gallery) {
            self.save(gallery).await
        } else {
            debug!("Thumbnail does not need to be archived.");
            Ok(())
        }
    }
}
