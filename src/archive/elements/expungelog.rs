use std::rc::Rc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::archive::elements::{self, ElementArchiver, MetadataService, EXPUNGELOG_FILENAME};
use crate::archive::fsutil;
use crate::error::{PandaError, Result};
use crate::model::Gallery;
use crate::settings::{Element, Settings};
use crate::web::WebClient;

/// Archives the expunge log of expunged galleries as `expungelog.html`.
pub struct ExpungeLogArchiver {
    settings: Rc<Settings>,
    client: Rc<WebClient>,
    metadata: Rc<MetadataService>,
}

impl ExpungeLogArchiver {
    pub fn new(
        settings: Rc<Settings>,
        client: Rc<WebClient>,
        metadata: Rc<MetadataService>,
    ) -> Self {
        ExpungeLogArchiver {
            settings,
            client,
            metadata,
        }
    }

    async fn is_required(&self, gallery: &mut Gallery) -> Result<bool> {
        if !self.settings.is_active(Element::Expungelog) || !self.settings.is_active(Element::Page) {
            return Ok(false);
        }

        gallery.ensure_files_loaded()?;
        if elements::is_unavailable(gallery) || gallery.contains_file(EXPUNGELOG_FILENAME) {
            return Ok(false);
        }

        // only expunged galleries have a log, which requires fresh metadata
        self.metadata.ensure_loaded_up_to_date(gallery).await?;
        Ok(gallery.is_expunged())
    }

    async fn save(&self, gallery: &mut Gallery) -> Result<()> {
        info!("Saving expunge log...");

        let page = self
            .client
            .load_expunge_log_page(gallery.id(), gallery.token())
            .await?;

        let verification = elements::selector("#form_expunge_vote");
        if page.doc.select(&verification).next().is_none() {
            if elements::process_unavailability(gallery, &page)? {
                return Ok(());
            }
            return Err(PandaError::parse(
                "could not verify the gallery expunge log got loaded correctly",
            ));
        }

        fsutil::init_dir(gallery.dir())?;
        let html = page.doc.root_element().html();
        fsutil::save(gallery.dir(), EXPUNGELOG_FILENAME, |path| {
            std::fs::write(path, &html)
        })
    }
}

#[async_trait(?Send)]
impl ElementArchiver for ExpungeLogArchiver {
    fn name(&self) -> &'static str {
        "expungelog"
    }

    async fn process(&self, gallery: &mut Gallery) -> Result<()> {
        if self.is_required(gallery).await? {
            self.save(gallery).await
        } else {
            debug!("Expunge log does not need to be archived.");
            Ok(())
        }
    }
}
