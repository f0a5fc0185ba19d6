use std::time::Duration;

use tracing::{trace, warn};

use crate::error::Result;
use crate::model::Gallery;
use crate::settings::Settings;

pub mod cleanup;
pub mod download;
pub mod elements;
pub mod fsutil;
pub mod success;
pub mod update;

pub use cleanup::CleanupMode;
pub use download::DownloadMode;
pub use update::UpdateMode;

use elements::ElementArchiver;

/// Element archival failures are retried this often before giving up.
const MAX_ELEMENT_TRIES: u32 = 3;
/// The wait between retries.
const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Creates the success and writable archive directories, requiring their
/// parents to exist already so a typo does not silently create a fresh tree.
pub(crate) fn init_base_dirs(settings: &Settings) -> Result<()> {
    trace!("Making sure success and archive directories exist...");
    fsutil::init_dir(settings.success_dir())?;
    fsutil::init_dir(settings.writable_archive_dir())
}

/// Runs a single element archiver with the shared retry protocol.
pub(crate) async fn process_element_with_retries(
    archiver: &dyn ElementArchiver,
    gallery: &mut Gallery,
) -> Result<()> {
    let mut remaining_tries = MAX_ELEMENT_TRIES;
    loop {
        match archiver.process(gallery).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                remaining_tries -= 1;
                warn!(
                    "Archiving element \"{}\" failed, {} tries remain: {}",
                    archiver.name(),
                    remaining_tries,
                    e
                );
                if remaining_tries == 0 {
                    return Err(e);
                }
                warn!("Waiting 10 seconds before retrying...");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}
