use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::error::Result;
use crate::settings::Settings;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Form(Vec<(&'static str, String)>),
}

/// A single outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct WebRequest {
    pub method: Method,
    pub url: Url,
    pub body: Option<RequestBody>,
}

impl WebRequest {
    pub fn get(url: Url) -> Self {
        WebRequest {
            method: Method::Get,
            url,
            body: None,
        }
    }

    pub fn post(url: Url, body: RequestBody) -> Self {
        WebRequest {
            method: Method::Post,
            url,
            body: Some(body),
        }
    }
}

/// A response as seen by the web client: status, the final URL after
/// redirects, the headers relevant for archival and the body.
pub struct WebResponse {
    pub status: u16,
    pub final_url: Url,
    /// Raw `Content-Type` header value.
    pub content_type: Option<String>,
    /// Raw `Content-Disposition` header bytes. Kept as bytes since the
    /// server encodes UTF-8 filenames through an ISO-8859-1 header.
    pub content_disposition: Option<Vec<u8>>,
    pub body: ResponseBody,
}

/// A response body that is either buffered (fakes, small responses) or
/// streamed straight from the wire (downloads).
pub enum ResponseBody {
    Buffered(Vec<u8>),
    Streaming(reqwest::Response),
}

impl ResponseBody {
    /// Collects the whole body into memory.
    pub async fn bytes(self) -> Result<Vec<u8>> {
        match self {
            ResponseBody::Buffered(bytes) => Ok(bytes),
            ResponseBody::Streaming(response) => Ok(response.bytes().await?.to_vec()),
        }
    }

    /// Streams the body into the given file without buffering it whole.
    pub async fn write_to(self, file: &mut tokio::fs::File) -> Result<u64> {
        let mut written = 0u64;
        match self {
            ResponseBody::Buffered(bytes) => {
                file.write_all(&bytes).await?;
                written = bytes.len() as u64;
            }
            ResponseBody::Streaming(response) => {
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
            }
        }
        file.flush().await?;

        Ok(written)
    }
}

/// The HTTP seam of the web client. Production uses reqwest; tests inject a
/// fake that serves canned responses and records request times.
#[async_trait(?Send)]
pub trait Transport {
    async fn execute(&self, request: WebRequest) -> Result<WebResponse>;
}

/// The reqwest-backed transport carrying the cookie jar and, when configured,
/// the SOCKS5 proxy.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(settings: &Settings) -> Result<Self> {
        let jar = Arc::new(reqwest::cookie::Jar::default());
        if let Some(host) = settings.base_url().host_str() {
            for (name, value) in settings.cookies() {
                jar.add_cookie_str(
                    &format!("{name}={value}; Domain={host}"),
                    settings.base_url(),
                );
            }
        }

        let mut builder = reqwest::Client::builder()
            .cookie_provider(jar)
            .connect_timeout(DEFAULT_TIMEOUT)
            .read_timeout(DEFAULT_TIMEOUT)
            .gzip(true);

        if let Some(proxy) = settings.proxy() {
            // socks5h passes hostnames to the proxy unresolved, so DNS
            // happens on the far side of the tunnel
            builder = builder.proxy(reqwest::Proxy::all(format!("socks5h://{proxy}"))?);
        }

        Ok(ReqwestTransport {
            client: builder.build()?,
        })
    }
}

#[async_trait(?Send)]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: WebRequest) -> Result<WebResponse> {
        let mut builder = match request.method {
            Method::Get => self.client.get(request.url),
            Method::Post => self.client.post(request.url),
        };
        match request.body {
            Some(RequestBody::Json(value)) => builder = builder.json(&value),
            Some(RequestBody::Form(pairs)) => builder = builder.form(&pairs),
            None => {}
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let content_disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .map(|v| v.as_bytes().to_vec());

        Ok(WebResponse {
            status,
            final_url,
            content_type,
            content_disposition,
            body: ResponseBody::Streaming(response),
        })
    }
}
