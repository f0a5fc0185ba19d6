use std::rc::Rc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Selector};
use tracing::warn;

use crate::archive::fsutil;
use crate::error::Result;
use crate::model::Gallery;
use crate::settings::{OperationMode, Settings};
use crate::web::{Page, WebClient};

pub mod expungelog;
pub mod imagelist;
pub mod metadata;
pub mod page;
pub mod thumbnail;
pub mod torrent;
pub mod zip;

pub use metadata::MetadataService;

pub const METADATA_FILENAME: &str = "api-metadata.json";
pub const PAGE_FILENAME: &str = "page.html";
pub const IMAGELIST_FILENAME: &str = "imagelist.json";
pub const MPV_FILENAME: &str = "mpv.html";
pub const EXPUNGELOG_FILENAME: &str = "expungelog.html";
pub const THUMBNAIL_FILENAME: &str = "thumbnail.jpg";
pub const UNAVAILABLE_FILENAME: &str = "unavailable.txt";

/// One archiver per artifact kind. Implementations decide for themselves
/// whether the gallery needs them and do nothing otherwise.
#[async_trait(?Send)]
pub trait ElementArchiver {
    fn name(&self) -> &'static str;

    async fn process(&self, gallery: &mut Gallery) -> Result<()>;
}

/// Builds all element archivers in their processing order. The order is
/// load-bearing: metadata first so later elements can reuse it, the ZIP last
/// as the most expensive artifact.
pub fn build_registry(
    settings: Rc<Settings>,
    client: Rc<WebClient>,
) -> Vec<Box<dyn ElementArchiver>> {
    let metadata = Rc::new(MetadataService::new(settings.clone(), client.clone()));

    vec![
        Box::new(metadata::MetadataArchiver::new(
            settings.clone(),
            metadata.clone(),
        )),
        Box::new(page::PageArchiver::new(settings.clone(), client.clone())),
        Box::new(imagelist::ImageListArchiver::new(
            settings.clone(),
            client.clone(),
        )),
        Box::new(expungelog::ExpungeLogArchiver::new(
            settings.clone(),
            client.clone(),
            metadata.clone(),
        )),
        Box::new(thumbnail::ThumbnailArchiver::new(
            settings.clone(),
            client.clone(),
            metadata.clone(),
        )),
        Box::new(torrent::TorrentArchiver::new(
            settings.clone(),
            client.clone(),
            metadata.clone(),
        )),
        Box::new(zip::ZipArchiver::new(settings, client, metadata)),
    ]
}

/// Parses a CSS selector that is known to be valid at compile time.
pub(crate) fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Checks whether the document is the "Gallery Not Available" landing page
/// and, if so, marks the gallery as unavailable on disk.
pub(crate) fn process_unavailability(gallery: &mut Gallery, page: &Page) -> Result<bool> {
    let title_selector = selector("title");
    let title: String = page
        .doc
        .select(&title_selector)
        .flat_map(|t| t.text())
        .collect();
    if !title.contains("Gallery Not Available") {
        return Ok(false);
    }

    let reason_selector = selector(".d > p:first-child");
    let Some(message) = page.doc.select(&reason_selector).next() else {
        return Ok(false);
    };
    mark_as_unavailable(gallery, &element_text(message))?;

    Ok(true)
}

/// Records the reason a gallery is gone so later runs and later elements do
/// not keep asking the server about it.
pub(crate) fn mark_as_unavailable(gallery: &mut Gallery, reason: &str) -> Result<()> {
    warn!("Marking the gallery as no longer available according to: {reason}");

    fsutil::init_dir(gallery.dir())?;
    let reason = reason.to_string();
    fsutil::save(gallery.dir(), UNAVAILABLE_FILENAME, |path| {
        std::fs::write(path, &reason)
    })?;

    gallery.record_file(gallery.dir().join(UNAVAILABLE_FILENAME));

    Ok(())
}

pub(crate) fn is_unavailable(gallery: &Gallery) -> bool {
    gallery.contains_file(UNAVAILABLE_FILENAME)
}

/// The UPDATE-mode staleness predicate: a file counts as stale when it is
/// older than the gallery's update threshold. Presence alone satisfies the
/// other modes.
pub(crate) fn is_file_stale(settings: &Settings, gallery: &Gallery, filename: &str) -> bool {
    if settings.mode() != OperationMode::Update {
        return false;
    }
    let Some(threshold) = gallery.update_threshold() else {
        return false;
    };

    let modified = gallery
        .dir()
        .join(filename)
        .metadata()
        .and_then(|m| m.modified());
    match modified {
        Ok(modified) => DateTime::<Utc>::from(modified) < threshold,
        Err(_) => false,
    }
}
