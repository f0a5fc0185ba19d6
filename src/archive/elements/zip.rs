use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use crate::archive::elements::{self, ElementArchiver, MetadataService};
use crate::archive::fsutil;
use crate::error::{PandaError, Result};
use crate::model::Gallery;
use crate::settings::{Element, Settings};
use crate::web::{Page, WebClient};

const ZIP_EXTENSION: &str = ".zip";
const ZIP_MIME_TYPE: &str = "application/zip";
/// The preparation page is polled at most this many times before giving up.
const PREPARATION_RETRIES: usize = 30;

static SET_TIMEOUT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"setTimeout\([^,)]*,\s*(\d+)\)").expect("static regex"));

/// Archives the full gallery ZIP through the paid archiver endpoint.
pub struct ZipArchiver {
    settings: Rc<Settings>,
    client: Rc<WebClient>,
    metadata: Rc<MetadataService>,
}

impl ZipArchiver {
    pub fn new(
        settings: Rc<Settings>,
        client: Rc<WebClient>,
        metadata: Rc<MetadataService>,
    ) -> Self {
        ZipArchiver {
            settings,
            client,
            metadata,
        }
    }

    fn is_required(&self, gallery: &mut Gallery) -> Result<bool> {
        if !self.settings.is_active(Element::Zip) {
            return Ok(false);
        }

        gallery.ensure_files_loaded()?;
        Ok(!elements::is_unavailable(gallery)
            && !gallery
                .files()
                .iter()
                .any(|file| file.to_string_lossy().ends_with(ZIP_EXTENSION)))
    }

    async fn save(&self, gallery: &mut Gallery) -> Result<()> {
        // the archiver key may rotate, so always work with fresh metadata
        self.metadata.ensure_loaded_online(gallery).await?;
        let archiver_key = gallery
            .metadata()
            .and_then(|m| m.get("archiver_key"))
            .and_then(Value::as_str)
            .ok_or_else(|| PandaError::parse("metadata is missing the archiver key"))?
            .to_string();

        let Some(download_url) = self.load_archive_url(gallery, &archiver_key).await? else {
            // the preparation page turned out to be the unavailability notice
            return Ok(());
        };

        let download = self.client.download_file(download_url).await?;
        if download.mime() != Some(ZIP_MIME_TYPE) {
            return Err(PandaError::failed(format!(
                "expected a ZIP archive but received {:?}",
                download.mime()
            )));
        }

        fsutil::init_dir(gallery.dir())?;
        let filename = fsutil::sanitize_filename(gallery.dir(), download.name(), true)?;
        fsutil::save_download(gallery.dir(), &filename, download).await?;

        Ok(())
    }

    /// Drives the archiver preparation state machine until the server hands
    /// out the direct download URL. `Ok(None)` means the gallery went
    /// unavailable instead.
    async fn load_archive_url(
        &self,
        gallery: &mut Gallery,
        archiver_key: &str,
    ) -> Result<Option<url::Url>> {
        debug!("Generating ZIP URL...");

        let mut url = self.client.base_url().join("archiver.php")?;
        url.query_pairs_mut()
            .append_pair("gid", &gallery.id().to_string())
            .append_pair("token", gallery.token())
            .append_pair("or", archiver_key);
        let mut page = self.client.load_archive_preparation_page(url).await?;

        let download_selector = elements::selector("#db a");
        let continue_selector = elements::selector("#continue a");
        for _ in 0..PREPARATION_RETRIES {
            if let Some(anchor) = page.doc.select(&download_selector).next() {
                let href = anchor
                    .value()
                    .attr("href")
                    .ok_or_else(|| PandaError::parse("download link has no href"))?;
                return Ok(Some(page.resolve(href)?));
            }

            let Some(anchor) = page.doc.select(&continue_selector).next() else {
                if elements::process_unavailability(gallery, &page)? {
                    return Ok(None);
                }
                return Err(PandaError::parse("unexpected archive preparation page"));
            };
            let href = anchor
                .value()
                .attr("href")
                .ok_or_else(|| PandaError::parse("continue link has no href"))?;
            let next_url = page.resolve(href)?;

            let delay = parse_preparation_delay(&page)?;
            debug!("Archive not ready yet. Waiting for {:?}...", delay);
            tokio::time::sleep(delay).await;

            page = self.client.load_document(next_url).await?;
        }

        Err(PandaError::failed(
            "could not retrieve prepared file on download server",
        ))
    }
}

/// Extracts the wait the preparation page requests through its
/// `setTimeout(…, N)` script.
fn parse_preparation_delay(page: &Page) -> Result<Duration> {
    let script_selector = elements::selector("script");
    page.doc
        .select(&script_selector)
        .find_map(|script| {
            SET_TIMEOUT_PATTERN
                .captures(&script.inner_html())
                .and_then(|captures| captures[1].parse::<u64>().ok())
        })
        .map(Duration::from_millis)
        .ok_or_else(|| PandaError::parse("could not find preparation delay"))
}

#[async_trait(?Send)]
impl ElementArchiver for ZipArchiver {
    fn name(&self) -> &'static str {
        "zip"
    }

    async fn process(&self, gallery: &mut Gallery) -> Result<()> {
        if self.is_required(gallery)? {
            info!("Saving ZIP...");
            self.save(gallery).await
        } else {
            debug!("ZIP does not need to be archived.");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::elements::testing::{fake_client, test_settings};
    use crate::model::MetadataState;
    use crate::web::transport::fake::{CannedResponse, FakeTransport};
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::time::Instant;

    fn archiver_metadata() -> serde_json::Map<String, Value> {
        json!({"title": "t", "archiver_key": "key123"})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn continue_page() -> CannedResponse {
        CannedResponse::html(
            "<html><body><div id=\"continue\"><a href=\"https://host.example/prep/next\">c</a></div>\
             <script>setTimeout(go, 2500)</script></body></html>",
        )
    }

    fn ready_page() -> CannedResponse {
        CannedResponse::html(
            "<html><body><div id=\"db\"><a href=\"https://host.example/dl/file.zip\">d</a></div></body></html>",
        )
    }

    fn archiver_for(dir: &std::path::Path, transport: Rc<FakeTransport>) -> ZipArchiver {
        let settings = test_settings("download", dir, &[]);
        let client = fake_client(transport);
        let metadata = Rc::new(MetadataService::new(settings.clone(), client.clone()));
        ZipArchiver::new(settings, client, metadata)
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn preparation_is_polled_until_the_download_appears() {
        let dir = tempdir().unwrap();
        let transport = Rc::new(FakeTransport::new());
        transport.push("archiver.php", continue_page());
        transport.push("prep/next", continue_page());
        transport.push("prep/next", continue_page());
        transport.push("prep/next", ready_page());
        transport.push(
            "dl/file.zip",
            CannedResponse::file(ZIP_MIME_TYPE, b"PK\x03\x04")
                .with_disposition("attachment; filename=\"file.zip\""),
        );

        let archiver = archiver_for(dir.path(), transport.clone());
        let mut gallery = Gallery::new(100, "aaaaaaaaaa", dir.path().join("100"));
        gallery.set_metadata(archiver_metadata(), MetadataState::Online);

        let start = Instant::now();
        archiver.process(&mut gallery).await.unwrap();

        // three sleeps of 2500 ms, four preparation fetches, one download
        assert_eq!(Instant::now() - start, Duration::from_millis(7500));
        let urls = transport.request_urls();
        assert_eq!(urls.len(), 5);
        assert!(urls[0].contains("archiver.php"));
        assert!(urls[0].contains("gid=100"));
        assert!(urls[0].contains("or=key123"));
        assert!(urls[4].ends_with("dl/file.zip"));
        assert!(dir.path().join("100").join("file.zip").exists());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn exhausted_preparation_retries_fail() {
        let dir = tempdir().unwrap();
        let transport = Rc::new(FakeTransport::new());
        transport.push("archiver.php", continue_page());
        transport.always("prep/next", continue_page());

        let archiver = archiver_for(dir.path(), transport);
        let mut gallery = Gallery::new(100, "aaaaaaaaaa", dir.path().join("100"));
        gallery.set_metadata(archiver_metadata(), MetadataState::Online);

        assert!(archiver.process(&mut gallery).await.is_err());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn an_existing_zip_satisfies_the_archiver() {
        let dir = tempdir().unwrap();
        let gallery_dir = dir.path().join("100");
        std::fs::create_dir_all(&gallery_dir).unwrap();
        std::fs::write(gallery_dir.join("existing.zip"), b"PK").unwrap();

        let transport = Rc::new(FakeTransport::new());
        let archiver = archiver_for(dir.path(), transport.clone());
        let mut gallery = Gallery::new(100, "aaaaaaaaaa", gallery_dir);

        archiver.process(&mut gallery).await.unwrap();
        assert!(transport.requests().is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn non_zip_downloads_fail() {
        let dir = tempdir().unwrap();
        let transport = Rc::new(FakeTransport::new());
        transport.push("archiver.php", ready_page());
        transport.push("dl/file.zip", CannedResponse::html("<html>denied</html>"));

        let archiver = archiver_for(dir.path(), transport);
        let mut gallery = Gallery::new(100, "aaaaaaaaaa", dir.path().join("100"));
        gallery.set_metadata(archiver_metadata(), MetadataState::Online);

        assert!(archiver.process(&mut gallery).await.is_err());
    }
}
