//! Peer authentication.
//!
//! Peer librarians call us with the bearer token recorded on their row in
//! the librarians table (a per-pair shared secret). Ingest endpoints carry
//! no peer identity; user authentication sits in front of this server.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use archivist_catalog::Catalog;
use archivist_catalog::models::LibrarianRow;
use archivist_core::Checksum;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

/// Extract the bearer token from the request headers.
fn bearer_token(headers: &HeaderMap) -> ApiResult<&str> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| ApiError::Unauthorized("missing Authorization header".to_string()))?
        .to_str()
        .map_err(|_| ApiError::Unauthorized("malformed Authorization header".to_string()))?;
    value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthorized("expected Bearer authorization".to_string()))
}

/// Compare tokens by digest so length and content leak nothing useful.
fn tokens_match(a: &str, b: &str) -> bool {
    Checksum::compute(a.as_bytes()) == Checksum::compute(b.as_bytes())
}

/// Resolve the calling librarian from its bearer token.
pub async fn authenticate_librarian(
    state: &AppState,
    headers: &HeaderMap,
) -> ApiResult<LibrarianRow> {
    let token = bearer_token(headers)?;

    let librarians = state.catalog.list_librarians().await?;
    librarians
        .into_iter()
        .filter(|l| l.name != state.name())
        .find(|l| tokens_match(&l.auth_token, token))
        .ok_or_else(|| ApiError::Unauthorized("unknown peer token".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());

        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(bearer_token(&headers).is_err());

        headers.insert(AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "secret");
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("secret", "secret"));
        assert!(!tokens_match("secret", "Secret"));
        assert!(!tokens_match("secret", "secret "));
    }
}
