use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::ElementRef;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive::elements::{self, EXPUNGELOG_FILENAME, PAGE_FILENAME};
use crate::archive::success::SuccessLedger;
use crate::archive::{self, fsutil};
use crate::error::{PandaError, Result};
use crate::settings::Settings;
use crate::web::{Page, WebClient};

static REPORT_LINK_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/g/(\d+)/(\S{10})/").expect("static regex"));
static CONFLICT_LINK_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"']+?/g/(\d+)/"#).expect("static regex"));

/// Everything pass 1 learns about the archived galleries.
#[derive(Default)]
struct ScanData {
    /// Gallery id to the directories that may be removed for it. Every
    /// scanned gallery has an entry; only directories under the writable
    /// root are listed.
    removable_dirs: HashMap<u64, HashSet<PathBuf>>,
    /// Galleries some other gallery names as its parent.
    parent_ids: HashSet<u64>,
    /// Child gallery id to the galleries naming it as a child.
    child_to_parent_ids: HashMap<u64, HashSet<u64>>,
    /// Gallery id to the galleries its expunge log conflicts with.
    conflict_ids: HashMap<u64, HashSet<u64>>,
}

/// The cleanup mode: scans all archive directories for superseded galleries
/// and removes their directories from the writable root.
pub struct CleanupMode {
    settings: Rc<Settings>,
    client: Rc<WebClient>,
    ledger: SuccessLedger,
}

impl CleanupMode {
    pub fn new(settings: Rc<Settings>, client: Rc<WebClient>) -> Self {
        let ledger = SuccessLedger::new(settings.success_dir(), settings.member_id());
        CleanupMode {
            settings,
            client,
            ledger,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Activating cleanup mode.");

        archive::init_base_dirs(&self.settings)?;
        self.ledger.init()?;

        let mut data = ScanData::default();
        for archive_directory in self.settings.archive_dirs() {
            debug!("Looking through directory \"{}\"...", archive_directory.display());
            for entry in WalkDir::new(archive_directory) {
                let entry = entry.map_err(|e| {
                    PandaError::failed(format!(
                        "could not traverse the given archive directory: {e}"
                    ))
                })?;
                if entry.file_type().is_dir() {
                    self.scan_directory(entry.path(), &mut data)?;
                }
            }
        }

        self.evict(data)
    }

    /// Pass 1: memorizes the gallery relationships recorded in an archived
    /// directory, if it holds one.
    fn scan_directory(&self, directory: &Path, data: &mut ScanData) -> Result<()> {
        let page_file = directory.join(PAGE_FILENAME);
        if !page_file.is_file() {
            debug!(
                "Directory does not appear to contain a gallery: \"{}\"",
                directory.display()
            );
            return Ok(());
        }

        info!("Processing gallery in directory: \"{}\"", directory.display());
        let page = match self.client.load_document_file(&page_file) {
            Ok(page) => page,
            Err(e) => {
                warn!("Failed reading file, it will be skipped: {e}");
                return Ok(());
            }
        };

        let id = self.memorize_gallery_id(directory, data, &page)?;
        memorize_parent_id(data, &page)?;
        memorize_child_ids(id, data, &page)?;
        self.memorize_conflict_ids(directory, id, data)?;

        Ok(())
    }

    /// Records the gallery id found in the page's report link, marking the
    /// directory as removable only when it lives under the writable root.
    fn memorize_gallery_id(
        &self,
        directory: &Path,
        data: &mut ScanData,
        page: &Page,
    ) -> Result<u64> {
        let report_selector = elements::selector("#gd5 > .g3 > a");
        let report = page
            .doc
            .select(&report_selector)
            .next()
            .ok_or_else(|| PandaError::parse("could not find report element"))?;
        let id = parse_gallery_id(report.value().attr("href").unwrap_or_default())?;

        let directories = data.removable_dirs.entry(id).or_default();
        if directory.starts_with(self.settings.writable_archive_dir()) {
            debug!("Memorizing gallery ID {id} with the directory as possibly removable.");
            directories.insert(directory.to_path_buf());
        } else {
            debug!("Memorizing gallery ID {id} with the directory as not removable.");
        }

        Ok(id)
    }

    /// Reads the expunge log, if any, and records which other galleries this
    /// one conflicts with. Administrative expunges carry no conflicts.
    fn memorize_conflict_ids(&self, directory: &Path, id: u64, data: &mut ScanData) -> Result<()> {
        let expunge_log_file = directory.join(EXPUNGELOG_FILENAME);
        if !expunge_log_file.is_file() {
            return Ok(());
        }

        debug!("Processing gallery expunge log...");
        let log = match self.client.load_document_file(&expunge_log_file) {
            Ok(log) => log,
            Err(e) => {
                warn!("Failed reading file, it will be skipped: {e}");
                return Ok(());
            }
        };

        let outer_selector = elements::selector(".exp_outer");
        let administrative = log
            .doc
            .select(&outer_selector)
            .any(|outer| elements::element_text(outer).contains("administratively expunged"));
        if administrative {
            return Ok(());
        }

        let table_selector = elements::selector(".exp_table");
        let Some(table) = log.doc.select(&table_selector).next() else {
            warn!("Expunge log carries no expunge table, it will be skipped.");
            return Ok(());
        };

        for captures in CONFLICT_LINK_PATTERN.captures_iter(&table.inner_html()) {
            let conflicting_id: u64 = captures[1]
                .parse()
                .map_err(|_| PandaError::parse("could not parse gallery ID"))?;
            // a log may mention its own gallery inside descriptions
            if conflicting_id != id {
                debug!("Memorizing conflicting gallery ID {conflicting_id}...");
                data.conflict_ids.entry(id).or_default().insert(conflicting_id);
            }
        }

        Ok(())
    }

    /// Pass 2: removes every gallery that is superseded by a child, named as
    /// a parent, or lost an expunge conflict against a known gallery.
    fn evict(&mut self, mut data: ScanData) -> Result<()> {
        info!("Running cleaning process...");

        let mut known_ids: Vec<u64> = data.removable_dirs.keys().copied().collect();
        known_ids.sort_unstable();

        let mut total_bytes_saved = 0u64;
        for id in known_ids {
            debug!("Processing gallery ID {id}...");

            let mut outdated_ids = HashSet::new();
            if data.parent_ids.remove(&id) {
                debug!("Gallery was marked as parent of another gallery and will be removed.");
                outdated_ids.insert(id);
            }

            if let Some(parents) = data.child_to_parent_ids.remove(&id) {
                debug!("Gallery IDs {parents:?} were marked as parents of this gallery and will be removed.");
                outdated_ids.extend(parents);
            }

            if let Some(conflicts) = data.conflict_ids.remove(&id) {
                if let Some(conflicting_id) = conflicts
                    .iter()
                    .find(|conflict| data.removable_dirs.contains_key(conflict))
                {
                    debug!(
                        "Gallery was marked as conflicting with at least gallery ID {conflicting_id} and will be removed."
                    );
                    outdated_ids.insert(id);
                }
            }

            for outdated_id in outdated_ids {
                if let Some(directories) = data.removable_dirs.get_mut(&outdated_id) {
                    for directory in std::mem::take(directories) {
                        let bytes_saved = fsutil::dir_size(&directory);
                        std::fs::remove_dir_all(&directory).map_err(|e| {
                            PandaError::failed(format!("failed removing directory: {e}"))
                        })?;
                        total_bytes_saved += bytes_saved;

                        info!(
                            "Saved {} by removing: {}",
                            fsutil::format_byte_count(bytes_saved),
                            directory.display()
                        );
                    }
                }

                self.ledger.remove(outdated_id)?;
            }
        }

        info!("Cleaned up {}.", fsutil::format_byte_count(total_bytes_saved));
        Ok(())
    }
}

fn parse_gallery_id(href: &str) -> Result<u64> {
    let captures = REPORT_LINK_PATTERN
        .captures(href)
        .ok_or_else(|| PandaError::parse("could not find gallery ID or token in URL"))?;
    captures[1]
        .parse()
        .map_err(|_| PandaError::parse("could not parse gallery ID"))
}

/// Records the id in the `Parent:` row of the gallery description table.
fn memorize_parent_id(data: &mut ScanData, page: &Page) -> Result<()> {
    let header_selector = elements::selector(".gdt1");
    let header = page
        .doc
        .select(&header_selector)
        .find(|header| elements::element_text(*header).contains("Parent:"))
        .ok_or_else(|| PandaError::parse("parent header element not found"))?;

    let row = header
        .parent()
        .and_then(ElementRef::wrap)
        .ok_or_else(|| PandaError::parse("parent header element has no row"))?;
    let value_selector = elements::selector(".gdt2 > a");
    if let Some(parent) = row.select(&value_selector).next() {
        let parent_id: u64 = elements::element_text(parent)
            .parse()
            .map_err(|_| PandaError::parse("could not parse gallery ID"))?;
        debug!("Memorizing parent gallery ID {parent_id}...");
        data.parent_ids.insert(parent_id);
    }

    Ok(())
}

/// Records which galleries this page names as its newer versions.
fn memorize_child_ids(id: u64, data: &mut ScanData, page: &Page) -> Result<()> {
    let child_selector = elements::selector("#gnd > a");
    for child in page.doc.select(&child_selector) {
        let child_id = parse_gallery_id(child.value().attr("href").unwrap_or_default())?;
        debug!("Memorizing child gallery ID {child_id}...");
        data.child_to_parent_ids.entry(child_id).or_default().insert(id);
    }

    Ok(())
}
