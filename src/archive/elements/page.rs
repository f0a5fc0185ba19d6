use std::rc::Rc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::archive::elements::{self, ElementArchiver, PAGE_FILENAME};
use crate::archive::fsutil;
use crate::error::{PandaError, Result};
use crate::model::Gallery;
use crate::settings::{Element, Settings};
use crate::web::WebClient;

/// Archives the initial gallery HTML page as `page.html`.
pub struct PageArchiver {
    settings: Rc<Settings>,
    client: Rc<WebClient>,
}

impl PageArchiver {
    pub fn new(settings: Rc<Settings>, client: Rc<WebClient>) -> Self {
        PageArchiver { settings, client }
    }

    fn is_required(&self, gallery: &mut Gallery) -> Result<bool> {
        if !self.settings.is_active(Element::Page) {
            return Ok(false);
        }

        gallery.ensure_files_loaded()?;
        if elements::is_unavailable(gallery) {
            return Ok(false);
        }

        Ok(!gallery.dir().join(PAGE_FILENAME).is_file()
            || elements::is_file_stale(&self.settings, gallery, PAGE_FILENAME))
    }

    async fn save(&self, gallery: &mut Gallery) -> Result<()> {
        info!("Saving HTML...");

        let page = self.client.load_page(gallery.id(), gallery.token()).await?;
        let verification = elements::selector("#rating_label");
        if page.doc.select(&verification).next().is_none() {
            if elements::process_unavailability(gallery, &page)? {
                return Ok(());
            }
            return Err(PandaError::parse(
                "could not verify the gallery page got loaded correctly",
            ));
        }

        fsutil::init_dir(gallery.dir())?;
        let html = page.doc.root_element().html();
        fsutil::save(gallery.dir(), PAGE_FILENAME, |path| std::fs::write(path, &html))
    }
}

#[async_trait(?Send)]
impl ElementArchiver for PageArchiver {
    fn name(&self) -> &'static str {
        "page"
    }

    async fn process(&self, gallery: &mut Gallery) -> Result<()> {
        if self.is_required(gallery)? {
            self.save(gallery).await
        } else {
            debug!("Page does not need to be archived.");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::elements::testing::{fake_client, test_settings};
    use crate::archive::elements::UNAVAILABLE_FILENAME;
    use crate::web::transport::fake::{CannedResponse, FakeTransport};
    use tempfile::tempdir;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn pages_are_fetched_and_written() {
        let dir = tempdir().unwrap();
        let transport = Rc::new(FakeTransport::new());
        transport.push(
            "/g/100/aaaaaaaaaa",
            CannedResponse::html("<html><body><div id=\"rating_label\">Rating</div></body></html>"),
        );
        let settings = test_settings("download", dir.path(), &[]);
        let archiver = PageArchiver::new(settings, fake_client(transport));
        let mut gallery = Gallery::new(100, "aaaaaaaaaa", dir.path().join("100"));

        archiver.process(&mut gallery).await.unwrap();

        let html = std::fs::read_to_string(dir.path().join("100").join(PAGE_FILENAME)).unwrap();
        assert!(html.contains("rating_label"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn unavailable_galleries_get_the_sentinel_file() {
        let dir = tempdir().unwrap();
        let transport = Rc::new(FakeTransport::new());
        transport.push(
            "/g/100/aaaaaaaaaa",
            CannedResponse::html(
                "<html><head><title>Gallery Not Available - E</title></head>\
                 <body><div class=\"d\"><p>Copyright</p></div></body></html>",
            )
            .with_status(404),
        );
        let settings = test_settings("download", dir.path(), &[]);
        let archiver = PageArchiver::new(settings, fake_client(transport));
        let mut gallery = Gallery::new(100, "aaaaaaaaaa", dir.path().join("100"));

        archiver.process(&mut gallery).await.unwrap();

        let reason =
            std::fs::read_to_string(dir.path().join("100").join(UNAVAILABLE_FILENAME)).unwrap();
        assert_eq!(reason, "Copyright");
        assert!(!dir.path().join("100").join(PAGE_FILENAME).exists());
        // later elements observe the sentinel through the snapshot
        assert!(elements::is_unavailable(&gallery));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn unverifiable_pages_fail() {
        let dir = tempdir().unwrap();
        let transport = Rc::new(FakeTransport::new());
        transport.push(
            "/g/100/aaaaaaaaaa",
            CannedResponse::html("<html><body>maintenance</body></html>"),
        );
        let settings = test_settings("download", dir.path(), &[]);
        let archiver = PageArchiver::new(settings, fake_client(transport));
        let mut gallery = Gallery::new(100, "aaaaaaaaaa", dir.path().join("100"));

        assert!(archiver.process(&mut gallery).await.is_err());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn existing_pages_are_kept_outside_update_mode() {
        let dir = tempdir().unwrap();
        let gallery_dir = dir.path().join("100");
        std::fs::create_dir_all(&gallery_dir).unwrap();
        std::fs::write(gallery_dir.join(PAGE_FILENAME), "<html></html>").unwrap();

        let transport = Rc::new(FakeTransport::new());
        let settings = test_settings("download", dir.path(), &[]);
        let archiver = PageArchiver::new(settings, fake_client(transport.clone()));
        let mut gallery = Gallery::new(100, "aaaaaaaaaa", gallery_dir);

        archiver.process(&mut gallery).await.unwrap();
        assert!(transport.requests().is_empty());
    }
}
