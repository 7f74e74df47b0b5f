//! Built-in responses.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Router;

pub const NOT_FOUND_BODY: &str = "404 page not found\n";

pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, NOT_FOUND_BODY)
}

/// Handler answering 404 to every request. Entry points start with it and
/// fall back to it when no HTTP router targets them.
pub fn not_found_router() -> Router {
    Router::new().fallback(not_found)
}
