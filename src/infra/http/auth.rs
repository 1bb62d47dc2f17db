use axum::http::{HeaderMap, header};
use subtle::ConstantTimeEq;

const API_KEY_HEADER: &str = "x-api-key";
const BEARER_PREFIX: &str = "Bearer ";

/// Accept the request when no key is configured, or when either `X-API-Key`
/// or an `Authorization: Bearer` token matches the configured key.
pub(crate) fn authorize(api_key: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = api_key else {
        return true;
    };

    let presented_key = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if presented_key.is_some_and(|key| secret_matches(expected, key)) {
        return true;
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix(BEARER_PREFIX))
        .is_some_and(|token| secret_matches(expected, token.trim()))
}

fn secret_matches(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// `text/plain` with any parameters, compared case-insensitively.
pub(crate) fn is_plain_text(headers: &HeaderMap) -> bool {
    let Some(value) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let media_type = value.split(';').next().unwrap_or_default().trim();
    media_type.eq_ignore_ascii_case("text/plain")
}
