use crate::error::CaptureError;
use std::time::Duration;
use url::Url;

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

/// Parses `url` and accepts only absolute http(s) URLs.
pub fn validate_url(url: &str) -> Result<Url, CaptureError> {
    let parsed =
        Url::parse(url).map_err(|e| CaptureError::Validation(format!("invalid URL '{url}': {e}")))?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(CaptureError::Validation(format!(
            "unsupported scheme '{other}' in '{url}'"
        ))),
    }
}

/// Returns the throttling key for a URL: lower-cased host without a leading `www.`.
pub fn extract_domain(url: &str) -> Option<String> {
    Url::parse(url).ok().and_then(|u| u.host_str().map(normalize_host))
}

pub fn normalize_host(host: &str) -> String {
    let host = host.trim_end_matches('.').to_lowercase();
    match host.strip_prefix("www.") {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => host,
    }
}

pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
