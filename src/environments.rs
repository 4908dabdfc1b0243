//! Remote environment list: which browser/version/platform combinations a
//! provider offers, plus version-alias resolution against that list.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::ProviderCredentials;
use crate::error::{HubError, Result};

/// One browser environment offered by a provider, normalized from the
/// provider-specific JSON shape. Serializable so callers can report the
/// offered environments without reassembling the provider payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BrowserEnvironment {
    pub browser_name: String,
    pub version: String,
    pub platform: String,
    /// The raw provider record, kept for capability passthrough.
    pub descriptor: Value,
}

/// Fetch and normalize the provider's environment list. Providers disagree
/// on field names, so several spellings are accepted per field.
pub async fn fetch_environments(
    url: &str,
    credentials: &ProviderCredentials,
    client: &reqwest::Client,
) -> Result<Vec<BrowserEnvironment>> {
    debug!("Fetching environment list from {}", url);
    let response = client
        .get(url)
        .basic_auth(&credentials.username, Some(&credentials.access_key))
        .send()
        .await?;
    let status = response.status();
    if status.as_u16() >= 400 {
        return Err(HubError::Download(format!(
            "environment list request to {url} failed with status {status}"
        )));
    }
    let body: Value = response.json().await?;
    let Some(records) = body.as_array() else {
        return Err(HubError::Download(format!(
            "environment list from {url} is not a JSON array"
        )));
    };
    Ok(records.iter().map(normalize_record).collect())
}

fn normalize_record(record: &Value) -> BrowserEnvironment {
    BrowserEnvironment {
        browser_name: string_field(record, &["browserName", "browser", "api_name"]),
        version: string_field(record, &["version", "browser_version", "short_version"]),
        platform: string_field(record, &["platform", "os", "osVersion"]),
        descriptor: record.clone(),
    }
}

fn string_field(record: &Value, names: &[&str]) -> String {
    for name in names {
        match &record[*name] {
            Value::String(s) => return s.clone(),
            Value::Number(n) => return n.to_string(),
            _ => {}
        }
    }
    String::new()
}

/// Resolve a version alias against the versions a provider offers.
///
/// Supported forms: a literal version present in the list, `latest`,
/// `previous` (one behind latest), `latest-N`, and an inclusive range
/// `A..B` which resolves to the newest offered version inside it.
pub fn resolve_version_alias(alias: &str, versions: &[String]) -> Result<String> {
    if versions.is_empty() {
        return Err(HubError::Config(format!(
            "cannot resolve version '{alias}': provider offers no versions"
        )));
    }
    let mut sorted: Vec<&String> = versions.iter().collect();
    sorted.sort_by(|a, b| compare_versions(a, b));

    if let Some((low, high)) = alias.split_once("..") {
        return sorted
            .iter()
            .rev()
            .find(|v| {
                compare_versions(v, low) != std::cmp::Ordering::Less
                    && compare_versions(v, high) != std::cmp::Ordering::Greater
            })
            .map(|v| (*v).clone())
            .ok_or_else(|| {
                HubError::Config(format!("no offered version inside range {low}..{high}"))
            });
    }

    let back = match alias {
        "latest" => 0,
        "previous" => 1,
        _ => {
            if versions.iter().any(|v| v == alias) {
                return Ok(alias.to_string());
            }
            match alias.strip_prefix("latest-").map(str::parse::<usize>) {
                Some(Ok(n)) => n,
                _ => {
                    return Err(HubError::Config(format!(
                        "version '{alias}' is neither offered nor a recognized alias"
                    )));
                }
            }
        }
    };

    sorted
        .iter()
        .rev()
        .nth(back)
        .map(|v| (*v).clone())
        .ok_or_else(|| {
            HubError::Config(format!(
                "alias '{alias}' reaches back past the {} offered versions",
                versions.len()
            ))
        })
}

/// Dotted versions compare segment by segment, numerically where both
/// segments parse ("10.1" > "9.2"), lexically otherwise ("beta" vs "dev").
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(m), Ok(n)) => m.cmp(&n),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
