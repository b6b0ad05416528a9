use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::error::{OtaError, Result};
use crate::release::Release;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    UpToDate {
        device_version: String,
        latest_version: String,
    },
    UpdateAvailable {
        device_version: String,
        latest_version: String,
        url: String,
        published: Option<DateTime<Utc>>,
    },
}

impl UpdateStatus {
    /// Decide whether `release` is newer than what the device is running.
    ///
    /// # Errors
    /// Returns `MalformedVersion` if either version has a segment without digits.
    pub fn evaluate(release: &Release, device_version: &str) -> Result<Self> {
        let device_version = device_version.trim().to_owned();
        let latest_version = release.tag_name.clone();
        if is_update_available(&device_version, &release.tag_name)? {
            Ok(UpdateStatus::UpdateAvailable {
                device_version,
                latest_version,
                url: release.html_url.clone(),
                published: release.published_at,
            })
        } else {
            Ok(UpdateStatus::UpToDate {
                device_version,
                latest_version,
            })
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, UpdateStatus::UpdateAvailable { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionComparison {
    Greater,
    Equal,
    Less,
}

/// True when the release tag (leading `v` allowed) is strictly newer than the
/// device version.
pub fn is_update_available(device_version: &str, release_tag: &str) -> Result<bool> {
    let candidate = normalize_version(release_tag);
    Ok(compare_versions(candidate, device_version.trim())? == VersionComparison::Greater)
}

/// Strip surrounding whitespace and a single leading `v` from a release tag.
pub fn normalize_version(tag: &str) -> &str {
    let tag = tag.trim();
    tag.strip_prefix(['v', 'V']).unwrap_or(tag)
}

/// Compare a candidate version against the current one, segment by segment.
///
/// Segments the current version lacks count as 0. When every candidate
/// segment matches, a current version with more segments wins: `1.2` vs
/// `1.2.0` is `Less`, while `1.2.0` vs `1.2` is `Equal`.
pub fn compare_versions(candidate: &str, current: &str) -> Result<VersionComparison> {
    let x = parse_version_parts(candidate)?;
    let y = parse_version_parts(current)?;

    for (i, a) in x.iter().enumerate() {
        let b = y.get(i).copied().unwrap_or(0);
        match a.cmp(&b) {
            Ordering::Greater => return Ok(VersionComparison::Greater),
            Ordering::Less => return Ok(VersionComparison::Less),
            Ordering::Equal => {}
        }
    }

    if y.len() > x.len() {
        Ok(VersionComparison::Less)
    } else {
        Ok(VersionComparison::Equal)
    }
}

/// Parse version string into parts (e.g., "2.4.9" -> [2, 4, 9]).
///
/// Each segment contributes its leading decimal digits, so a build suffix such
/// as `9-dirty` reads as 9. A segment that does not start with a digit is
/// rejected.
fn parse_version_parts(version: &str) -> Result<Vec<u64>> {
    version
        .split('.')
        .map(|segment| {
            let digits_end = segment
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(segment.len());
            segment[..digits_end]
                .parse::<u64>()
                .map_err(|_| OtaError::MalformedVersion {
                    version: version.to_owned(),
                    segment: segment.to_owned(),
                })
        })
        .collect()
}
