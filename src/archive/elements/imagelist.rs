use std::rc::Rc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use crate::archive::elements::{self, ElementArchiver, IMAGELIST_FILENAME, MPV_FILENAME};
use crate::archive::fsutil;
use crate::error::{PandaError, Result};
use crate::model::Gallery;
use crate::settings::{Element, Settings};
use crate::web::WebClient;

static IMAGELIST_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"var imagelist = (.+?);").expect("static regex"));

/// Archives the multi-page-viewer image list as `imagelist.json`.
pub struct ImageListArchiver {
    settings: Rc<Settings>,
    client: Rc<WebClient>,
}

impl ImageListArchiver {
    pub fn new(settings: Rc<Settings>, client: Rc<WebClient>) -> Self {
        ImageListArchiver { settings, client }
    }

    fn is_required(&self, gallery: &mut Gallery) -> Result<bool> {
        if !self.settings.is_active(Element::Imagelist) {
            return Ok(false);
        }

        gallery.ensure_files_loaded()?;
        // an archived mpv.html is the older site variant of the same artifact
        Ok(!elements::is_unavailable(gallery)
            && !gallery.contains_file(IMAGELIST_FILENAME)
            && !gallery.contains_file(MPV_FILENAME))
    }

    async fn save(&self, gallery: &mut Gallery) -> Result<()> {
        info!("Saving image list...");

        let page = self
            .client
            .load_mpv_page(gallery.id(), gallery.token())
            .await?;

        let verification = elements::selector("#pane_outer");
        if page.doc.select(&verification).next().is_none() {
            if elements::process_unavailability(gallery, &page)? {
                return Ok(());
            }
            return Err(PandaError::parse(
                "could not verify the gallery MPV page got loaded correctly",
            ));
        }

        let script_selector = elements::selector("script");
        let image_list = page
            .doc
            .select(&script_selector)
            .find_map(|script| {
                IMAGELIST_PATTERN
                    .captures(&script.inner_html())
                    .map(|captures| captures[1].to_string())
            })
            .ok_or_else(|| PandaError::parse("could not find MPV image list"))?;

        let image_list: Value = serde_json::from_str(&image_list)
            .map_err(|e| PandaError::parse(format!("invalid image list JSON: {e}")))?;
        if !image_list.is_array() {
            return Err(PandaError::parse("image list is not a JSON array"));
        }

        fsutil::init_dir(gallery.dir())?;
        let content = serde_json::to_string_pretty(&image_list)?;
        fsutil::save(gallery.dir(), IMAGELIST_FILENAME, |path| {
            std::fs::write(path, &content)
        })
    }
}

#[async_trait(?Send)]
impl ElementArchiver for ImageListArchiver {
    fn name(&self) -> &'static str {
        "imagelist"
    }

    async fn process(&self, gallery: &mut Gallery) -> Result<()> {
        if self.is_required(gallery)? {
            self.save(gallery).await
        } else {
            debug!("Image list does not need to be archived.");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::elements::testing::{fake_client, test_settings};
    use crate::web::transport::fake::{CannedResponse, FakeTransport};
    use tempfile::tempdir;

    fn mpv_page(script: &str) -> CannedResponse {
        CannedResponse::html(&format!(
            "<html><body><div id=\"pane_outer\"></div><script>{script}</script></body></html>"
        ))
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn image_lists_are_extracted_from_the_mpv_script() {
        let dir = tempdir().unwrap();
        let transport = Rc::new(FakeTransport::new());
        transport.push(
            "/mpv/100/aaaaaaaaaa",
            mpv_page("var gid = 100; var imagelist = [{\"n\":\"001.jpg\"}];"),
        );
        let settings = test_settings("download", dir.path(), &[]);
        let archiver = ImageListArchiver::new(settings, fake_client(transport));
        let mut gallery = Gallery::new(100, "aaaaaaaaaa", dir.path().join("100"));

        archiver.process(&mut gallery).await.unwrap();

        let written =
            std::fs::read_to_string(dir.path().join("100").join(IMAGELIST_FILENAME)).unwrap();
        assert!(written.contains("001.jpg"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn empty_image_lists_are_valid() {
        let dir = tempdir().unwrap();
        let transport = Rc::new(FakeTransport::new());
        transport.push("/mpv/100/", mpv_page("var imagelist = [];"));
        let settings = test_settings("download", dir.path(), &[]);
        let archiver = ImageListArchiver::new(settings, fake_client(transport));
        let mut gallery = Gallery::new(100, "aaaaaaaaaa", dir.path().join("100"));

        archiver.process(&mut gallery).await.unwrap();
        assert!(dir.path().join("100").join(IMAGELIST_FILENAME).exists());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn pages_without_the_pane_fail() {
        let dir = tempdir().unwrap();
        let transport = Rc::new(FakeTransport::new());
        transport.push("/mpv/100/", CannedResponse::html("<html><body></body></html>"));
        let settings = test_settings("download", dir.path(), &[]);
        let archiver = ImageListArchiver::new(settings, fake_client(transport));
        let mut gallery = Gallery::new(100, "aaaaaaaaaa", dir.path().join("100"));

        assert!(archiver.process(&mut gallery).await.is_err());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn an_archived_mpv_page_counts_as_present() {
        let dir = tempdir().unwrap();
        let gallery_dir = dir.path().join("100");
        std::fs::create_dir_all(&gallery_dir).unwrap();
        std::fs::write(gallery_dir.join(MPV_FILENAME), "<html></html>").unwrap();

        let transport = Rc::new(FakeTransport::new());
        let settings = test_settings("download", dir.path(), &[]);
        let archiver = ImageListArchiver::new(settings, fake_client(transport.clone()));
        let mut gallery = Gallery::new(100, "aaaaaaaaaa", gallery_dir);

        archiver.process(&mut gallery).await.unwrap();
        assert!(transport.requests().is_empty());
    }
}
