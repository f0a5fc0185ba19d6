use std::path::Path;
use std::rc::Rc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, trace};
use url::Url;

use crate::archive::elements::{self, ElementArchiver, MetadataService};
use crate::archive::fsutil;
use crate::error::{PandaError, Result};
use crate::model::{ApiTorrent, Gallery};
use crate::settings::{Element, Settings};
use crate::web::WebClient;

const TORRENT_EXTENSION: &str = ".torrent";
const TORRENT_MIME_TYPE: &str = "application/x-bittorrent";

static PERSONALIZED_URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"document\.location='(.+?)'").expect("static regex"));

/// Archives every torrent the API knows for a gallery, reconciling the files
/// already on disk against the API listing.
pub struct TorrentArchiver {
    settings: Rc<Settings>,
    client: Rc<WebClient>,
    metadata: Rc<MetadataService>,
}

impl TorrentArchiver {
    pub fn new(
        settings: Rc<Settings>,
        client: Rc<WebClient>,
        metadata: Rc<MetadataService>,
    ) -> Self {
        TorrentArchiver {
            settings,
            client,
            metadata,
        }
    }

    /// Matches existing torrent files against the API listing. A file is kept
    /// when some API torrent has exactly its size and was added before the
    /// file was written; every unmatched file is deleted. Returns the API
    /// torrents that remain to be downloaded.
    fn reconcile_files(
        &self,
        gallery: &Gallery,
        mut api_torrents: Vec<ApiTorrent>,
    ) -> Result<Vec<ApiTorrent>> {
        for file in gallery.files() {
            if !file.to_string_lossy().ends_with(TORRENT_EXTENSION) {
                continue;
            }

            let matched = find_matching_torrent(file, &api_torrents)?;
            match matched {
                Some(index) => {
                    trace!("Skipping archived torrent found on API: \"{}\"", file.display());
                    api_torrents.remove(index);
                }
                None => {
                    debug!(
                        "Deleting archived torrent not found on API: \"{}\"",
                        file.display()
                    );
                    std::fs::remove_file(file)
                        .map_err(|e| PandaError::failed(format!("could not delete file: {e}")))?;
                }
            }
        }

        Ok(api_torrents)
    }

    async fn save(&self, gallery: &mut Gallery, api_torrents: Vec<ApiTorrent>) -> Result<()> {
        info!("Saving torrents...");

        let page = self
            .client
            .load_torrent_page(gallery.id(), gallery.token())
            .await?;
        let verification = elements::selector("#torrentinfo");
        if page.doc.select(&verification).next().is_none() {
            if elements::process_unavailability(gallery, &page)? {
                return Ok(());
            }
            return Err(PandaError::parse(
                "could not verify the torrent page got loaded correctly",
            ));
        }

        let anchor_selector = elements::selector("#torrentinfo form a[href*=\".torrent\"]");
        let anchors: Vec<_> = page.doc.select(&anchor_selector).collect();
        let first_onclick = anchors
            .first()
            .and_then(|anchor| anchor.value().attr("onclick"))
            .map(str::to_string);

        let urls: Vec<Url> = anchors
            .iter()
            .filter_map(|anchor| anchor.value().attr("href"))
            .filter(|href| api_torrents.iter().any(|torrent| href.contains(torrent.hash())))
            .map(|href| page.resolve(href))
            .collect::<Result<_>>()?;

        for url in urls {
            fsutil::init_dir(gallery.dir())?;
            self.try_download(gallery, url, first_onclick.as_deref()).await?;
        }

        Ok(())
    }

    /// Tries to download a torrent file, refreshing tracker cookies through
    /// the personalized URL when the server hands out HTML instead.
    async fn try_download(
        &self,
        gallery: &Gallery,
        url: Url,
        first_onclick: Option<&str>,
    ) -> Result<()> {
        if self.download(gallery, url.clone(), true).await? {
            return Ok(());
        }

        debug!("Did not receive a torrent file, tracker cookies might be missing. Trying to obtain them...");
        let onclick = first_onclick
            .ok_or_else(|| PandaError::parse("could not find personalized torrent URL"))?;
        let personalized = PERSONALIZED_URL_PATTERN
            .captures(onclick)
            .map(|captures| captures[1].to_string())
            .ok_or_else(|| PandaError::parse("could not find personalized torrent URL"))?;

        debug!("Fetching personalized torrent file to obtain cookies.");
        let cookie_fetch = self.client.download_file(Url::parse(&personalized)?).await?;
        cookie_fetch.discard().await;

        // dummy query parameter in case the previous failure got cached
        let mut retry_url = url;
        match retry_url.query() {
            Some(_) => {
                retry_url.query_pairs_mut().append_pair("cache", "bypass");
            }
            None => retry_url.set_query(Some("cache=bypass")),
        }
        self.download(gallery, retry_url, false).await?;

        Ok(())
    }

    /// Downloads a single torrent. A non-torrent response is tolerated only
    /// when `fail_acceptable` is set; the caller then retries with fresh
    /// cookies.
    async fn download(&self, gallery: &Gallery, url: Url, fail_acceptable: bool) -> Result<bool> {
        debug!("Saving torrent from URL: {url}");
        let download = self.client.download_file(url).await?;

        if download.mime() != Some(TORRENT_MIME_TYPE) {
            if fail_acceptable {
                download.discard().await;
                return Ok(false);
            }
            return Err(PandaError::failed("could not load torrent file"));
        }

        let filename = fsutil::sanitize_filename(gallery.dir(), download.name(), false)?;
        fsutil::save_download(gallery.dir(), &filename, download).await?;

        Ok(true)
    }
}

fn find_matching_torrent(file: &Path, api_torrents: &[ApiTorrent]) -> Result<Option<usize>> {
    let metadata = file
        .metadata()
        .map_err(|e| PandaError::failed(format!("could not read file attributes: {e}")))?;
    let size = metadata.len();
    let modified: DateTime<Utc> = metadata
        .modified()
        .map_err(|e| PandaError::failed(format!("could not read file attributes: {e}")))?
        .into();

    Ok(api_torrents
        .iter()
        .position(|torrent| torrent.tsize() == size && modified > torrent.added()))
}

#[async_trait(?Send)]
impl ElementArchiver for TorrentArchiver {
    fn name(&self) -> &'static str {
        "torrent"
    }

    async fn process(&self, gallery: &mut Gallery) -> Result<()> {
        if !self.settings.is_active(Element::Torrent) {
            debug!("Torrents do not need to be archived.");
            return Ok(());
        }

        gallery.ensure_files_loaded()?;
        if elements::is_unavailable(gallery) {
            debug!("Torrents do not need to be archived.");
            return Ok(());
        }

        self.metadata.ensure_loaded_up_to_date(gallery).await?;
        let metadata = gallery
            .metadata()
            .ok_or_else(|| PandaError::parse("metadata went missing after loading"))?;
        let api_torrents = ApiTorrent::parse_all(metadata)?;

        let remaining = self.reconcile_files(gallery, api_torrents)?;
        if remaining.is_empty() {
            debug!("Torrents do not need to be archived.");
            return Ok(());
        }

        self.save(gallery, remaining).await
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

    fn torrent_metadata(torrents: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        json!({"title": "t", "torrents": torrents})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn torrent_page(anchors: &str) -> CannedResponse {
        CannedResponse::html(&format!(
            "<html><body><div id=\"torrentinfo\"><form>{anchors}</form></div></body></html>"
        ))
    }

    fn archiver_for(dir: &std::path::Path, transport: Rc<FakeTransport>) -> TorrentArchiver {
        let settings = test_settings("download", dir, &[]);
        let client = fake_client(transport);
        let metadata = Rc::new(MetadataService::new(settings.clone(), client.clone()));
        TorrentArchiver::new(settings, client, metadata)
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn disk_torrents_are_reconciled_against_the_api() {
        let dir = tempdir().unwrap();
        let gallery_dir = dir.path().join("100");
        std::fs::create_dir_all(&gallery_dir).unwrap();
        // matches the first API entry by size, written after it was added
        std::fs::write(gallery_dir.join("keep.torrent"), vec![0u8; 10]).unwrap();
        // size matches no API entry
        std::fs::write(gallery_dir.join("stale.torrent"), vec![0u8; 20]).unwrap();

        let transport = Rc::new(FakeTransport::new());
        transport.push(
            "gallerytorrents.php",
            torrent_page(
                "<a href=\"https://host.example/dl/hash222.torrent\">two</a>\
                 <a href=\"https://host.example/dl/hash333.torrent\">three</a>",
            ),
        );
        transport.always(
            ".torrent",
            CannedResponse::file(TORRENT_MIME_TYPE, b"d8:announce0:e")
                .with_disposition("attachment; filename=\"new.torrent\""),
        );

        let archiver = archiver_for(dir.path(), transport.clone());
        let mut gallery = Gallery::new(100, "aaaaaaaaaa", gallery_dir.clone());
        gallery.set_metadata(
            torrent_metadata(json!([
                {"hash": "hash111", "tsize": "10", "added": "1000000000"},
                {"hash": "hash222", "tsize": "21", "added": "1000000000"},
                {"hash": "hash333", "tsize": "30", "added": "1000000000"},
            ])),
            MetadataState::Online,
        );

        archiver.process(&mut gallery).await.unwrap();

        assert!(gallery_dir.join("keep.torrent").exists());
        assert!(!gallery_dir.join("stale.torrent").exists());
        // the two unmatched API torrents got downloaded
        assert!(gallery_dir.join("new.torrent").exists());
        assert!(gallery_dir.join("new (2).torrent").exists());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn fully_matched_listings_make_no_requests() {
        let dir = tempdir().unwrap();
        let gallery_dir = dir.path().join("100");
        std::fs::create_dir_all(&gallery_dir).unwrap();
        std::fs::write(gallery_dir.join("keep.torrent"), vec![0u8; 10]).unwrap();

        let transport = Rc::new(FakeTransport::new());
        let archiver = archiver_for(dir.path(), transport.clone());
        let mut gallery = Gallery::new(100, "aaaaaaaaaa", gallery_dir);
        gallery.set_metadata(
            torrent_metadata(json!([
                {"hash": "hash111", "tsize": "10", "added": "1000000000"},
            ])),
            MetadataState::Online,
        );

        archiver.process(&mut gallery).await.unwrap();
        assert!(transport.requests().is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn html_responses_trigger_a_cookie_refresh_and_retry() {
        let dir = tempdir().unwrap();
        let transport = Rc::new(FakeTransport::new());
        transport.push(
            "gallerytorrents.php",
            torrent_page(
                "<a href=\"https://host.example/dl/hash111.torrent\" \
                 onclick=\"document.location='https://host.example/personal/hash111.x'; return false\">t</a>",
            ),
        );
        // the plain URL first serves HTML, the cache-bypassed retry succeeds
        transport.push(
            "dl/hash111.torrent",
            CannedResponse::file("text/html", b"<html>login</html>"),
        );
        transport.push("personal/hash111.x", CannedResponse::file("text/html", b""));
        transport.push(
            "dl/hash111.torrent?cache=bypass",
            CannedResponse::file(TORRENT_MIME_TYPE, b"d8:announce0:e")
                .with_disposition("attachment; filename=\"g.torrent\""),
        );

        let archiver = archiver_for(dir.path(), transport.clone());
        let mut gallery = Gallery::new(100, "aaaaaaaaaa", dir.path().join("100"));
        gallery.set_metadata(
            torrent_metadata(json!([
                {"hash": "hash111", "tsize": "10", "added": "1000000000"},
            ])),
            MetadataState::Online,
        );

        archiver.process(&mut gallery).await.unwrap();

        let urls = transport.request_urls();
        assert_eq!(urls.len(), 4);
        assert!(urls[0].contains("gallerytorrents.php"));
        assert!(urls[1].ends_with("dl/hash111.torrent"));
        assert!(urls[2].contains("personal/hash111.x"));
        assert!(urls[3].ends_with("dl/hash111.torrent?cache=bypass"));
        assert!(dir.path().join("100").join("g.torrent").exists());
    }
}
