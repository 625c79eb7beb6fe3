//! Input validation for the gatekeeper
//!
//! Provides validation functions to prevent:
//! - Malformed slugs and identifiers reaching the directory
//! - Oversized search queries and batches reaching the search backend
//! - Out-of-range numeric parameters

use crate::{GatekeeperError, Result};

/// Maximum length for tenant ids and other opaque identifiers
pub const MAX_IDENTIFIER_LEN: usize = 100;

/// Maximum length for tenant slugs
pub const MAX_SLUG_LEN: usize = 63;

/// Maximum length for display names (tenants, API keys)
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length of a search query after trimming
pub const MAX_QUERY_LEN: usize = 500;

/// Maximum number of queries in one batch request
pub const MAX_BATCH_SIZE: usize = 100;

/// Largest `top_k` a caller may request
pub const MAX_TOP_K: u32 = 100;

/// `top_k` used when the request omits it
pub const DEFAULT_TOP_K: u32 = 10;

/// Validate an opaque identifier (tenant id, key id, event id)
///
/// Requirements:
/// - Not empty
/// - <= 100 characters
/// - Alphanumeric, underscore, hyphen only
pub fn validate_identifier(value: &str, kind: &str) -> Result<()> {
    if value.is_empty() {
        return Err(GatekeeperError::ValidationError(format!(
            "{} cannot be empty",
            kind
        )));
    }

    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(GatekeeperError::ValidationError(format!(
            "{} too long: {} > {} characters",
            kind,
            value.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(GatekeeperError::ValidationError(format!(
            "{} contains invalid characters (allowed: alphanumeric, _, -)",
            kind
        )));
    }

    Ok(())
}

/// Validate a tenant slug
///
/// Requirements:
/// - 3..=63 characters
/// - Lowercase ASCII letters, digits, hyphen
/// - Cannot start or end with hyphen
pub fn validate_slug(slug: &str) -> Result<()> {
    if slug.len() < 3 || slug.len() > MAX_SLUG_LEN {
        return Err(GatekeeperError::ValidationError(format!(
            "Slug must be between 3 and {} characters",
            MAX_SLUG_LEN
        )));
    }

    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(GatekeeperError::ValidationError(
            "Slug contains invalid characters (allowed: a-z, 0-9, -)".to_string(),
        ));
    }

    if slug.starts_with('-') || slug.ends_with('-') {
        return Err(GatekeeperError::ValidationError(
            "Slug cannot start or end with hyphen".to_string(),
        ));
    }

    Ok(())
}

/// Validate a display name
pub fn validate_name(name: &str, kind: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(GatekeeperError::ValidationError(format!(
            "{} cannot be empty",
            kind
        )));
    }

    if trimmed.len() > MAX_NAME_LEN {
        return Err(GatekeeperError::ValidationError(format!(
            "{} too long: {} > {} characters",
            kind,
            trimmed.len(),
            MAX_NAME_LEN
        )));
    }

    if trimmed.chars().any(char::is_control) {
        return Err(GatekeeperError::ValidationError(format!(
            "{} contains control characters",
            kind
        )));
    }

    Ok(())
}

/// Validate search query text
///
/// Length is measured after trimming, in characters.
pub fn validate_query(query: &str) -> Result<()> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(GatekeeperError::ValidationError(
            "Query cannot be empty".to_string(),
        ));
    }

    let len = trimmed.chars().count();
    if len > MAX_QUERY_LEN {
        return Err(GatekeeperError::ValidationError(format!(
            "Query too long: {} > {} characters",
            len, MAX_QUERY_LEN
        )));
    }

    Ok(())
}

/// Validate the number of results requested
pub fn validate_top_k(top_k: u32) -> Result<()> {
    if top_k == 0 || top_k > MAX_TOP_K {
        return Err(GatekeeperError::ValidationError(format!(
            "top_k must be between 1 and {}",
            MAX_TOP_K
        )));
    }
    Ok(())
}

/// Validate every query in a batch and the batch size
pub fn validate_batch(queries: &[String]) -> Result<()> {
    if queries.is_empty() {
        return Err(GatekeeperError::ValidationError(
            "Batch must contain at least one query".to_string(),
        ));
    }

    if queries.len() > MAX_BATCH_SIZE {
        return Err(GatekeeperError::ValidationError(format!(
            "Batch too large: {} > {} queries",
            queries.len(),
            MAX_BATCH_SIZE
        )));
    }

    queries.iter().try_for_each(|q| validate_query(q))
}

/// Validate a per-key rate limit override
pub fn validate_rate_limit_override(limit: Option<u32>) -> Result<()> {
    if limit == Some(0) {
        return Err(GatekeeperError::ValidationError(
            "Rate limit override must be positive".to_string(),
        ));
    }
    Ok(())
}
