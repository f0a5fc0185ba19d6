use std::rc::Rc;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::ElementRef;
use tracing::{debug, info, warn};
use url::Url;

use crate::archive::elements::{self, ElementArchiver};
use crate::archive::success::SuccessLedger;
use crate::archive::{self, RETRY_DELAY};
use crate::error::{PandaError, Result};
use crate::model::Gallery;
use crate::settings::Settings;
use crate::web::{Page, WebClient};

static GALLERY_LINK_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/g/(\d+)/([0-9a-f]+)/").expect("static regex"));

/// The download mode: crawls the configured search result page by page and
/// archives every gallery not yet recorded in a success file.
pub struct DownloadMode {
    settings: Rc<Settings>,
    client: Rc<WebClient>,
    archivers: Vec<Box<dyn ElementArchiver>>,
    ledger: SuccessLedger,
}

impl DownloadMode {
    pub fn new(
        settings: Rc<Settings>,
        client: Rc<WebClient>,
        archivers: Vec<Box<dyn ElementArchiver>>,
    ) -> Self {
        let ledger = SuccessLedger::new(settings.success_dir(), settings.member_id());
        DownloadMode {
            settings,
            client,
            archivers,
            ledger,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Activating download mode.");

        archive::init_base_dirs(&self.settings)?;
        self.ledger.init()?;

        let mut page_url = Some(self.settings.url().clone());
        while let Some(url) = page_url.take() {
            let page = self.load_search_result_page(&url).await?;

            let galleries = self.parse_galleries(&page)?;
            if galleries.is_empty() {
                info!("No galleries found.");
                break;
            }

            let mut any_gallery_processed = false;
            for mut gallery in galleries {
                if self.ledger.is_in(gallery.id()) {
                    info!(
                        "Gallery with ID \"{}\" and token \"{}\" exists in a success file. Assuming it is archived and skipping...",
                        gallery.id(),
                        gallery.token()
                    );
                } else {
                    self.process(&mut gallery).await?;
                    any_gallery_processed = true;
                }
            }

            if !any_gallery_processed && self.settings.catchup() {
                info!("Skipping further pages as all galleries on the current page had already been archived.");
                break;
            }

            page_url = parse_next_page_url(&page)?;
        }

        self.ledger.delete_temp_file()
    }

    /// Loads a search result page, retrying transient failures.
    async fn load_search_result_page(&self, url: &Url) -> Result<Page> {
        let mut remaining_tries = 3;
        loop {
            debug!("Loading search result: {url}");
            let result: Result<Page> = async {
                let page = self.client.load_document(url.clone()).await?;
                verify_search_result_page(&page)?;
                Ok(page)
            }
            .await;

            match result {
                Ok(page) => return Ok(page),
                Err(e) => {
                    remaining_tries -= 1;
                    warn!("Loading search result page failed, {remaining_tries} tries remain: {e}");
                    if remaining_tries == 0 {
                        return Err(e);
                    }
                    warn!("Waiting 10 seconds before retrying...");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    /// Runs every element archiver over the gallery, bracketing the work with
    /// the temporary and final success-file entries.
    async fn process(&mut self, gallery: &mut Gallery) -> Result<()> {
        info!(
            "Processing gallery with ID \"{}\" and token \"{}\"",
            gallery.id(),
            gallery.token()
        );

        self.ledger.add_temp(gallery.id())?;
        for archiver in &self.archivers {
            archive::process_element_with_retries(archiver.as_ref(), gallery).await?;
        }
        self.ledger.add(gallery.id())?;

        self.ledger.update()
    }

    fn parse_galleries(&self, page: &Page) -> Result<Vec<Gallery>> {
        let row_selector = elements::selector("table.gltc tr > td.gl1c");
        let link_selector = elements::selector(".glname > a");

        let mut galleries = Vec::new();
        for cell in page.doc.select(&row_selector) {
            let row = cell
                .parent()
                .and_then(ElementRef::wrap)
                .ok_or_else(|| PandaError::parse("could not find gallery element"))?;
            let link = row.select(&link_selector).next().ok_or_else(|| {
                PandaError::parse("could not find element to extract gallery ID from")
            })?;
            let href = link.value().attr("href").unwrap_or_default();

            let captures = GALLERY_LINK_PATTERN
                .captures(href)
                .ok_or_else(|| PandaError::parse("could not find gallery ID or token in URL"))?;
            let id: u64 = captures[1]
                .parse()
                .map_err(|_| PandaError::parse("could not parse gallery ID"))?;
            let token = captures[2].to_string();

            let dir = self.settings.writable_archive_dir().join(id.to_string());
            galleries.push(Gallery::new(id, token, dir));
        }

        Ok(galleries)
    }
}

fn verify_search_result_page(page: &Page) -> Result<()> {
    let verification = elements::selector("#searchbox");
    if page.doc.select(&verification).next().is_none() {
        return Err(PandaError::parse(
            "could not verify the search result page got loaded correctly",
        ));
    }

    Ok(())
}

fn parse_next_page_url(page: &Page) -> Result<Option<Url>> {
    let next_selector = elements::selector(".ptds + td:not(.ptdd) > a, a#unext");
    let Some(anchor) = page.doc.select(&next_selector).next() else {
        return Ok(None);
    };
    let Some(href) = anchor.value().attr("href") else {
        return Ok(None);
    };

    Ok(Some(page.resolve(href)?))
}
