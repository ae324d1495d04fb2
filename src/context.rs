// Best-effort contextual headers (device, locale, location)

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::auth::SessionHooks;

pub const DEVICE_ID_HEADER: &str = "X-Device-Id";
pub const LOCALE_HEADER: &str = "Accept-Language";
pub const LOCATION_HEADER: &str = "X-Location";

/// A single optional header attached to outgoing requests
#[async_trait]
pub trait HeaderSource: Send + Sync {
    /// Short name used in logs and failure notifications
    fn name(&self) -> &'static str;

    async fn header(&self) -> Result<(String, String)>;
}

/// Collect headers from every source concurrently
///
/// A failing source is logged and reported to `hooks`; the remaining
/// headers are still returned.
pub async fn collect_headers(
    sources: &[Box<dyn HeaderSource>],
    hooks: &dyn SessionHooks,
) -> Vec<(String, String)> {
    let results = join_all(sources.iter().map(|source| source.header())).await;

    sources
        .iter()
        .zip(results)
        .filter_map(|(source, result)| match result {
            Ok(header) => Some(header),
            Err(e) => {
                tracing::warn!(source = source.name(), error = %e, "Skipping context header");
                hooks.on_enrichment_failed(source.name(), &e);
                None
            }
        })
        .collect()
}

/// Stable device identifier derived from the host name
pub struct DeviceIdSource;

#[async_trait]
impl HeaderSource for DeviceIdSource {
    fn name(&self) -> &'static str {
        "device_id"
    }

    async fn header(&self) -> Result<(String, String)> {
        let hostname = hostname::get()
            .context("Failed to read host name")?
            .into_string()
            .map_err(|_| anyhow::anyhow!("Host name is not valid UTF-8"))?;

        Ok((DEVICE_ID_HEADER.to_string(), device_fingerprint(&hostname)))
    }
}

fn device_fingerprint(hostname: &str) -> String {
    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Preferred locale, from configuration or the `LANG` environment variable
pub struct LocaleSource {
    configured: Option<String>,
}

impl LocaleSource {
    pub fn new(configured: Option<String>) -> Self {
        Self { configured }
    }
}

#[async_trait]
impl HeaderSource for LocaleSource {
    fn name(&self) -> &'static str {
        "locale"
    }

    async fn header(&self) -> Result<(String, String)> {
        let raw = match &self.configured {
            Some(locale) => locale.clone(),
            None => std::env::var("LANG").context("No locale configured and LANG is unset")?,
        };
        let locale = normalize_locale(&raw)
            .with_context(|| format!("Unusable locale: {:?}", raw))?;
        Ok((LOCALE_HEADER.to_string(), locale))
    }
}

/// Turn POSIX locale strings like `en_US.UTF-8` into `en-US`
fn normalize_locale(raw: &str) -> Option<String> {
    let base = raw.split(['.', '@']).next()?.trim();
    if base.is_empty() || base == "C" || base == "POSIX" {
        return None;
    }
    Some(base.replace('_', "-"))
}

/// Coarse location as configured for the device
pub struct LocationSource {
    location: Option<(f64, f64)>,
}

impl LocationSource {
    pub fn new(location: Option<(f64, f64)>) -> Self {
        Self { location }
    }
}

#[async_trait]
impl HeaderSource for LocationSource {
    fn name(&self) -> &'static str {
        "location"
    }

    async fn header(&self) -> Result<(String, String)> {
        let (lat, lon) = self.location.context("Location unavailable")?;
        Ok((LOCATION_HEADER.to_string(), format!("{:.3},{:.3}", lat, lon)))
    }
}

/// Parse a `lat,lon` pair
pub fn parse_location(s: &str) -> Result<(f64, f64)> {
    let (lat, lon) = s
        .split_once(',')
        .with_context(|| format!("Location must be `lat,lon`: {}", s))?;
    let lat: f64 = lat.trim().parse().context("Invalid latitude")?;
    let lon: f64 = lon.trim().parse().context("Invalid longitude")?;

    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        anyhow::bail!("Location out of range: {}", s);
    }
    Ok((lat, lon))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHooks {
        failures: Mutex<Vec<String>>,
    }

    impl SessionHooks for RecordingHooks {
        fn on_auth_expired(&self) {}

        fn on_enrichment_failed(&self, source: &str, _error: &anyhow::Error) {
            self.failures.lock().unwrap().push(source.to_string());
        }
    }

    #[test]
    fn test_normalize_locale() {
        assert_eq!(normalize_locale("en_US.UTF-8").as_deref(), Some("en-US"));
        assert_eq!(normalize_locale("fr_FR@euro").as_deref(), Some("fr-FR"));
        assert_eq!(normalize_locale("de").as_deref(), Some("de"));
        assert_eq!(normalize_locale("C.UTF-8"), None);
        assert_eq!(normalize_locale("POSIX"), None);
        assert_eq!(normalize_locale(""), None);
    }

    #[test]
    fn test_parse_location() {
        assert_eq!(parse_location("40.7128, -74.0060").unwrap(), (40.7128, -74.006));
        assert!(parse_location("91,0").is_err());
        assert!(parse_location("40.7").is_err());
        assert!(parse_location("north,west").is_err());
    }

    #[test]
    fn test_device_fingerprint_is_stable() {
        assert_eq!(device_fingerprint("unit-7"), device_fingerprint("unit-7"));
        assert_ne!(device_fingerprint("unit-7"), device_fingerprint("unit-8"));
    }

    #[tokio::test]
    async fn test_failing_sources_are_skipped_and_reported() {
        let sources: Vec<Box<dyn HeaderSource>> = vec![
            Box::new(LocaleSource::new(Some("es_MX.UTF-8".to_string()))),
            Box::new(LocationSource::new(None)),
            Box::new(LocationSource::new(Some((19.4326, -99.1332)))),
        ];
        let hooks = RecordingHooks::default();

        let headers = collect_headers(&sources, &hooks).await;

        assert_eq!(
            headers,
            vec![
                (LOCALE_HEADER.to_string(), "es-MX".to_string()),
                (LOCATION_HEADER.to_string(), "19.433,-99.133".to_string()),
            ]
        );
        assert_eq!(*hooks.failures.lock().unwrap(), vec!["location".to_string()]);
    }
}
