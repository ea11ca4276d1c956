use url::Url;

use crate::error::ApiError;

/// Normalize a user-supplied server address to a base URL.
///
/// Normalization rules:
/// 1) surrounding whitespace is trimmed
/// 2) the address must be an absolute `http` or `https` URL
/// 3) trailing slashes are removed so endpoint paths can be appended directly
pub fn normalize_base_url(input: &str) -> Result<String, ApiError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ApiError::InvalidBaseUrl("address is empty".to_string()));
    }

    let parsed = Url::parse(trimmed)
        .map_err(|error| ApiError::InvalidBaseUrl(format!("{trimmed}: {error}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::InvalidBaseUrl(format!(
            "{trimmed}: unsupported scheme '{}'",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none() {
        return Err(ApiError::InvalidBaseUrl(format!("{trimmed}: missing host")));
    }

    Ok(trimmed.trim_end_matches('/').to_string())
}
