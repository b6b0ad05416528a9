use std::time::Duration;

use futures_util::{StreamExt, stream};
use log::{debug, info, warn};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::engine::state::Stage;
use crate::error::{OtaError, Result};
use crate::settings::{AutotuneSettings, SystemInfo};
use crate::transfer::{TransferEvent, TransportFailure};

pub const DEFAULT_DEVICE_URL: &str = "http://192.168.4.1";
pub const DEFAULT_RELAY_PREFIX: &str = "https://corsproxy.io/?url=";

const UPLOAD_CHUNK: usize = 16 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pushes update binaries to the device.
pub trait DeviceTransport {
    /// Start uploading `payload` for `stage`. The returned channel yields
    /// progress and ends with exactly one terminal event.
    fn upload(&self, stage: Stage, payload: Vec<u8>) -> mpsc::UnboundedReceiver<TransferEvent>;
}

/// Downloads release binaries.
pub trait AssetFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, String>;
}

/// How asset URLs are reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchStrategy {
    Direct,
    /// Prepend `prefix` to the asset URL, e.g. a CORS relay.
    Relayed { prefix: String },
}

impl FetchStrategy {
    pub fn from_relay(relay: Option<&str>) -> Self {
        match relay.map(str::trim).filter(|prefix| !prefix.is_empty()) {
            Some(prefix) => FetchStrategy::Relayed {
                prefix: prefix.to_owned(),
            },
            None => FetchStrategy::Direct,
        }
    }

    pub fn resolve(&self, url: &str) -> String {
        match self {
            FetchStrategy::Direct => url.to_owned(),
            FetchStrategy::Relayed { prefix } => format!("{prefix}{url}"),
        }
    }
}

#[derive(Clone)]
pub struct HttpAssetFetcher {
    client: Client,
    strategy: FetchStrategy,
}

impl HttpAssetFetcher {
    pub fn new(strategy: FetchStrategy) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                warn!("asset fetcher: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self { client, strategy }
    }
}

impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, String> {
        let url = self.strategy.resolve(url);
        debug!("asset fetcher: GET {url}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("download request failed: {e}"))?
            .error_for_status()
            .map_err(|e| format!("download status error: {e}"))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| format!("download read error: {e}"))?;
        info!("asset fetcher: received {} bytes", bytes.len());
        Ok(bytes.to_vec())
    }
}

/// Client for the device's local HTTP API.
#[derive(Clone)]
pub struct DeviceClient {
    client: Client,
    upload_client: Client,
    base_url: String,
}

impl DeviceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                warn!("device client: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        // Flashing can outlast any sensible request timeout.
        let upload_client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                warn!("device client: falling back to default upload client ({err})");
                Client::new()
            });
        Self {
            client,
            upload_client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn system_info(&self) -> Result<SystemInfo> {
        self.get_json("/api/system/info").await
    }

    pub async fn update_system(&self, settings: &Map<String, Value>) -> Result<()> {
        self.patch_json("/api/system", settings).await
    }

    pub async fn autotune(&self) -> Result<AutotuneSettings> {
        self.get_json("/api/system/autotune").await
    }

    pub async fn update_autotune(&self, settings: &AutotuneSettings) -> Result<()> {
        self.patch_json("/api/system/autotune", settings).await
    }

    pub async fn restart(&self) -> Result<()> {
        let url = self.url("/api/system/restart");
        info!("device: POST {url}");
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| OtaError::Device(format!("restart request failed: {e}")))?;
        check_status(response).await.map(|_| ())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        debug!("device: GET {url}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OtaError::Device(format!("GET {path} failed: {e}")))?;
        check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| OtaError::Device(format!("GET {path} returned invalid JSON: {e}")))
    }

    async fn patch_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let url = self.url(path);
        info!("device: PATCH {url}");
        let response = self
            .client
            .patch(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| OtaError::Device(format!("PATCH {path} failed: {e}")))?;
        check_status(response).await.map(|_| ())
    }
}

impl DeviceTransport for DeviceClient {
    fn upload(&self, stage: Stage, payload: Vec<u8>) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let url = self.url(stage.endpoint());
        let client = self.upload_client.clone();

        tokio::spawn(async move {
            let total = payload.len() as u64;
            info!("device: uploading {total} bytes of {stage} to {url}");
            let chunks: Vec<Vec<u8>> = payload.chunks(UPLOAD_CHUNK).map(<[u8]>::to_vec).collect();
            drop(payload);

            let progress = tx.clone();
            let mut sent: u64 = 0;
            let body = stream::iter(chunks).map(move |chunk| {
                sent += chunk.len() as u64;
                let _ = progress.send(TransferEvent::Progress {
                    sent,
                    total: Some(total),
                });
                Ok::<_, std::io::Error>(chunk)
            });

            let result = client
                .post(&url)
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_LENGTH, total)
                .body(Body::wrap_stream(body))
                .send()
                .await;

            let event = match result {
                Ok(response) => {
                    let status = response.status();
                    debug!("device: {stage} upload answered {status}");
                    TransferEvent::Response {
                        ok: status.is_success(),
                        status_text: status
                            .canonical_reason()
                            .map(str::to_owned)
                            .unwrap_or_else(|| status.as_str().to_owned()),
                    }
                }
                Err(err) => {
                    warn!("device: {stage} upload failed: {err}");
                    TransferEvent::TransportError(TransportFailure::from_transport(err.to_string()))
                }
            };
            let _ = tx.send(event);
        });

        rx
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = body.trim();
    Err(OtaError::Device(if detail.is_empty() {
        format!("device returned status: {status}")
    } else {
        format!("device returned status: {status} ({detail})")
    }))
}
