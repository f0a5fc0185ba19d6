use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use scraper::Html;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, trace};
use url::Url;

use crate::error::{PandaError, Result};
use crate::settings::Settings;
use crate::web::response;
use crate::web::transport::{
    ReqwestTransport, RequestBody, ResponseBody, Transport, WebRequest, WebResponse,
};

/// The API refuses gdata queries for more galleries than this at once.
const MAX_METADATA_PAIRS: usize = 25;

/// Body of a gdata API call.
#[derive(Serialize)]
struct ApiRequest {
    method: &'static str,
    gidlist: Vec<(u64, String)>,
    namespace: u32,
}

/// A fetched and parsed HTML page together with its final URL, which serves
/// as the base for resolving relative links found on it.
pub struct Page {
    pub doc: Html,
    pub url: Url,
}

impl Page {
    /// Resolves a possibly relative href against the page it was found on.
    pub fn resolve(&self, href: &str) -> Result<Url> {
        Ok(self.url.join(href)?)
    }
}

/// Releasing the guard marks the end of the request, which is the reference
/// point the next request's delay is measured from. Dropped on every exit
/// path, success or failure, after the body has been consumed.
struct GateGuard(OwnedMutexGuard<Instant>);

impl Drop for GateGuard {
    fn drop(&mut self) {
        *self.0 = Instant::now();
    }
}

/// A file download in flight. The body has not been consumed yet; the request
/// gate stays closed until this is persisted or discarded.
pub struct Download {
    name: String,
    mime: Option<String>,
    body: ResponseBody,
    _gate: GateGuard,
}

impl Download {
    /// The filename inferred from the response headers or URL.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bare MIME type of the response.
    pub fn mime(&self) -> Option<&str> {
        self.mime.as_deref()
    }

    /// Streams the body into the given file.
    pub async fn persist_to(self, file: &mut tokio::fs::File) -> Result<u64> {
        self.body.write_to(file).await
    }

    /// Consumes the body without storing it. Used when a request is made for
    /// its side effects only, such as picking up tracker cookies.
    pub async fn discard(self) {
        let _ = self.body.bytes().await;
    }
}

/// The rate-limited web client.
///
/// All requests of the process go through a single gate: only one request is
/// ever in flight and consecutive requests are separated by the configured
/// delay, measured from the end of the previous request.
pub struct WebClient {
    transport: Box<dyn Transport>,
    base_url: Url,
    request_delay: Duration,
    gate: Arc<Mutex<Instant>>,
}

impl WebClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(Self::with_transport(
            Box::new(ReqwestTransport::new(settings)?),
            settings.base_url().clone(),
            settings.request_delay(),
        ))
    }

    pub fn with_transport(
        transport: Box<dyn Transport>,
        base_url: Url,
        request_delay: Duration,
    ) -> Self {
        WebClient {
            transport,
            base_url,
            request_delay,
            gate: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Queries the gdata API for the metadata of up to 25 galleries.
    pub async fn load_metadata(&self, id_token_pairs: &[(u64, &str)]) -> Result<Value> {
        if id_token_pairs.len() > MAX_METADATA_PAIRS {
            return Err(PandaError::failed(format!(
                "API does not allow to query more than {MAX_METADATA_PAIRS} galleries at once"
            )));
        }

        let body = ApiRequest {
            method: "gdata",
            gidlist: id_token_pairs
                .iter()
                .map(|(id, token)| (*id, token.to_string()))
                .collect(),
            namespace: 1,
        };
        let request = WebRequest::post(
            self.base_url.join("api.php")?,
            RequestBody::Json(serde_json::to_value(&body)?),
        );

        let (result, gate) = self.fetch(request).await;
        let response = result?;
        check_status(&response, false)?;
        let bytes = response.body.bytes().await?;
        drop(gate);

        let value: Value = serde_json::from_slice(&bytes)?;
        if !value.is_object() {
            return Err(PandaError::parse("metadata response is not a JSON object"));
        }

        Ok(value)
    }

    /// Loads a gallery page. 404 responses still parse; the caller inspects
    /// the document for the unavailability notice.
    pub async fn load_page(&self, id: u64, token: &str) -> Result<Page> {
        let url = self.base_url.join(&format!("g/{id}/{token}"))?;
        self.fetch_document(WebRequest::get(url), true).await
    }

    /// Loads a gallery's multi-page-viewer page.
    pub async fn load_mpv_page(&self, id: u64, token: &str) -> Result<Page> {
        let url = self.base_url.join(&format!("mpv/{id}/{token}"))?;
        self.fetch_document(WebRequest::get(url), true).await
    }

    /// Loads the torrent listing page of a gallery.
    pub async fn load_torrent_page(&self, id: u64, token: &str) -> Result<Page> {
        let mut url = self.base_url.join("gallerytorrents.php")?;
        url.query_pairs_mut()
            .append_pair("gid", &id.to_string())
            .append_pair("t", token);
        self.fetch_document(WebRequest::get(url), true).await
    }

    /// Loads the expunge log of a gallery.
    pub async fn load_expunge_log_page(&self, id: u64, token: &str) -> Result<Page> {
        let mut url = self.base_url.join(&format!("g/{id}/{token}"))?;
        url.set_query(Some("act=expunge"));
        self.fetch_document(WebRequest::get(url), true).await
    }

    /// Requests preparation of the original archive on the site-provided
    /// archiver URL.
    pub async fn load_archive_preparation_page(&self, archiver_url: Url) -> Result<Page> {
        let body = RequestBody::Form(vec![
            ("dltype", "org".to_string()),
            ("dlcheck", "Download Original Archive".to_string()),
        ]);
        self.fetch_document(WebRequest::post(archiver_url, body), true)
            .await
    }

    /// Loads an arbitrary URL as an HTML document. Requires a 200 response.
    pub async fn load_document(&self, url: Url) -> Result<Page> {
        self.fetch_document(WebRequest::get(url), false).await
    }

    /// Parses a local HTML file, using the configured base URL as the
    /// document base for relative links.
    pub fn load_document_file(&self, path: &Path) -> Result<Page> {
        let bytes = std::fs::read(path)
            .map_err(|e| PandaError::failed(format!("failed reading \"{}\": {e}", path.display())))?;
        let html = Html::parse_document(&String::from_utf8_lossy(&bytes));

        Ok(Page {
            doc: html,
            url: self.base_url.clone(),
        })
    }

    /// Starts downloading a file. The returned handle carries the inferred
    /// filename and MIME type; the body is consumed by the caller.
    pub async fn download_file(&self, url: Url) -> Result<Download> {
        let (result, gate) = self.fetch(WebRequest::get(url)).await;
        let response = result?;
        check_status(&response, false)?;

        let name = response::infer_filename(
            response.content_disposition.as_deref(),
            &response.final_url,
        );
        let mime = response::mime_type(response.content_type.as_deref());
        trace!("Using filename \"{}\" with MIME type {:?}.", name, mime);

        Ok(Download {
            name,
            mime,
            body: response.body,
            _gate: gate,
        })
    }

    /// Waits for the request gate and executes the request. The returned
    /// guard keeps the gate closed; dropping it records the request end.
    async fn fetch(&self, request: WebRequest) -> (Result<WebResponse>, GateGuard) {
        let guard = self.gate.clone().lock_owned().await;
        let until = *guard + self.request_delay;
        let now = Instant::now();
        if until > now {
            debug!("Waiting for {:?} to honor the request delay...", until - now);
        }
        tokio::time::sleep_until(until).await;

        trace!("Executing request for {}", request.url);
        let result = self.transport.execute(request).await;

        (result, GateGuard(guard))
    }

    async fn fetch_document(&self, request: WebRequest, allow_not_found: bool) -> Result<Page> {
        let (result, gate) = self.fetch(request).await;
        let response = result?;
        check_status(&response, allow_not_found)?;

        let url = response.final_url.clone();
        let bytes = response.body.bytes().await?;
        drop(gate);

        let doc = Html::parse_document(&String::from_utf8_lossy(&bytes));
        Ok(Page { doc, url })
    }
}

fn check_status(response: &WebResponse, allow_not_found: bool) -> Result<()> {
    match response.status {
        200 => Ok(()),
        404 if allow_not_found => Ok(()),
        status => Err(PandaError::failed(format!(
            "expected HTTP response code 200 but received {status}"
        ))),
    }
}
