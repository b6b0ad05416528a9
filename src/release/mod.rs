use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{OtaError, Result};

pub const DEFAULT_RELEASE_FEED: &str = "https://api.github.com/repos/skot/ESP-Miner/releases";
pub const FIRMWARE_ASSET: &str = "esp-miner.bin";
pub const WEB_ASSET: &str = "www.bin";

const USER_AGENT: &str = "axe-console";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Asset {
    pub name: String,
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
    #[serde(default)]
    pub size: u64,
    /// `sha256:<hex>` when the feed publishes one.
    #[serde(default)]
    pub digest: Option<String>,
}

/// Both binaries an automatic update needs, resolved from one release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateAssets {
    pub firmware: Asset,
    pub web: Asset,
}

/// Source of published releases, newest first.
pub trait ReleaseFeed {
    async fn fetch_releases(&self) -> Result<Vec<Release>>;
}

#[derive(Clone)]
pub struct GithubReleaseFeed {
    client: Client,
    url: String,
}

impl GithubReleaseFeed {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|err| {
                warn!("release feed: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self {
            client,
            url: url.into(),
        }
    }
}

impl ReleaseFeed for GithubReleaseFeed {
    async fn fetch_releases(&self) -> Result<Vec<Release>> {
        debug!("release feed: GET {}", self.url);
        let response = self
            .client
            .get(&self.url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|err| OtaError::FeedFetch(format!("request failed: {err}")))?;

        if !response.status().is_success() {
            return Err(OtaError::FeedFetch(format!(
                "feed returned status: {}",
                response.status()
            )));
        }

        let releases: Vec<Release> = response
            .json()
            .await
            .map_err(|err| OtaError::FeedFetch(format!("failed to parse releases: {err}")))?;
        info!("release feed: {} releases listed", releases.len());
        Ok(releases)
    }
}

/// Fetch the feed once and keep its first entry.
pub async fn latest_release<F: ReleaseFeed>(feed: &F) -> Result<Release> {
    feed.fetch_releases()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| OtaError::FeedFetch("feed returned no releases".into()))
}

/// Find the asset called exactly `name`. The first one wins if the feed lists
/// the name more than once.
pub fn select_asset<'a>(assets: &'a [Asset], name: &str) -> Result<&'a Asset> {
    let mut matches = assets.iter().filter(|asset| asset.name == name);
    let first = matches
        .next()
        .ok_or_else(|| OtaError::MissingAsset(name.to_owned()))?;
    let extra = matches.count();
    if extra > 0 {
        warn!(
            "release feed lists {} assets named {name}; using the first",
            extra + 1
        );
    }
    Ok(first)
}

/// Resolve the firmware and web-asset binaries. Either one missing fails the
/// whole lookup.
pub fn resolve_update_assets(release: &Release) -> Result<UpdateAssets> {
    let firmware = select_asset(&release.assets, FIRMWARE_ASSET)?.clone();
    let web = select_asset(&release.assets, WEB_ASSET)?.clone();
    Ok(UpdateAssets { firmware, web })
}

/// Reject a download whose length differs from the size the feed advertised.
/// A size of 0 means the feed did not say.
pub fn verify_size(asset: &Asset, bytes: &[u8]) -> Result<()> {
    let received = bytes.len() as u64;
    if asset.size == 0 || asset.size == received {
        return Ok(());
    }
    Err(OtaError::AssetDownload {
        asset: asset.name.clone(),
        reason: format!("expected {} bytes, received {received}", asset.size),
    })
}

/// Check downloaded bytes against the asset's published `sha256:` digest.
/// Assets without a digest, or with another algorithm, pass unchecked.
pub fn verify_digest(asset: &Asset, bytes: &[u8]) -> Result<()> {
    let Some(expected) = asset
        .digest
        .as_deref()
        .map(str::trim)
        .and_then(|digest| digest.strip_prefix("sha256:"))
    else {
        debug!("release asset {} has no sha256 digest", asset.name);
        return Ok(());
    };

    let actual = format!("{:x}", Sha256::digest(bytes));
    if actual != expected.to_lowercase() {
        return Err(OtaError::DigestMismatch {
            asset: asset.name.clone(),
            expected: expected.to_owned(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(name: &str) -> Asset {
        Asset {
            name: name.into(),
            download_url: format!("https://example.invalid/{name}"),
            ..Asset::default()
        }
    }

    #[test]
    fn parses_github_release_payload() {
        let body = r#"[{
            "tag_name": "v2.5.0",
            "name": "v2.5.0",
            "html_url": "https://github.com/skot/ESP-Miner/releases/tag/v2.5.0",
            "published_at": "2024-11-02T10:00:00Z",
            "prerelease": false,
            "assets": [
                {"name": "esp-miner.bin", "browser_download_url": "https://x/esp-miner.bin", "size": 1024},
                {"name": "www.bin", "browser_download_url": "https://x/www.bin", "digest": "sha256:00"}
            ]
        }]"#;
        let releases: Vec<Release> = serde_json::from_str(body).unwrap();
        assert_eq!(releases.len(), 1);
        let release = &releases[0];
        assert_eq!(release.tag_name, "v2.5.0");
        assert!(release.published_at.is_some());
        assert_eq!(release.assets[0].size, 1024);
        assert_eq!(release.assets[1].digest.as_deref(), Some("sha256:00"));
    }

    #[test]
    fn selects_exact_case_sensitive_name() {
        let assets = vec![asset("ESP-MINER.BIN"), asset("esp-miner.bin")];
        let found = select_asset(&assets, FIRMWARE_ASSET).unwrap();
        assert_eq!(found.download_url, "https://example.invalid/esp-miner.bin");
        assert_eq!(
            select_asset(&assets, "esp-miner"),
            Err(OtaError::MissingAsset("esp-miner".into()))
        );
    }

    #[test]
    fn first_duplicate_wins() {
        let mut second = asset("www.bin");
        second.download_url = "https://example.invalid/second".into();
        let assets = vec![asset("www.bin"), second];
        let found = select_asset(&assets, WEB_ASSET).unwrap();
        assert_eq!(found.download_url, "https://example.invalid/www.bin");
    }

    #[test]
    fn resolution_requires_both_binaries() {
        let release = Release {
            tag_name: "v2.5.0".into(),
            assets: vec![asset(WEB_ASSET)],
            ..Release::default()
        };
        assert_eq!(
            resolve_update_assets(&release),
            Err(OtaError::MissingAsset(FIRMWARE_ASSET.into()))
        );

        let release = Release {
            assets: vec![asset(FIRMWARE_ASSET)],
            ..release
        };
        assert_eq!(
            resolve_update_assets(&release),
            Err(OtaError::MissingAsset(WEB_ASSET.into()))
        );
    }

    #[test]
    fn truncated_download_is_rejected() {
        let mut firmware = asset(FIRMWARE_ASSET);
        assert!(verify_size(&firmware, b"anything").is_ok());
        firmware.size = 8;
        assert!(verify_size(&firmware, b"12345678").is_ok());
        assert_eq!(
            verify_size(&firmware, b"1234"),
            Err(OtaError::AssetDownload {
                asset: FIRMWARE_ASSET.into(),
                reason: "expected 8 bytes, received 4".into(),
            })
        );
    }

    #[test]
    fn verifies_sha256_digest_when_present() {
        let mut www = asset(WEB_ASSET);
        assert!(verify_digest(&www, b"abc").is_ok());

        www.digest = Some(
            "sha256:BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD".into(),
        );
        assert!(verify_digest(&www, b"abc").is_ok());
        assert!(matches!(
            verify_digest(&www, b"abd"),
            Err(OtaError::DigestMismatch { .. })
        ));
    }
}
