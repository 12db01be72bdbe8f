use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};

use docsmith_core::{ConversionRequest, Route};

use crate::error::ApiError;
use crate::state::AppState;

/// Bare, lowercased media type of a `Content-Type` value.
fn media_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Whether an `Accept` header admits `produced` (e.g. `text/html`).
/// A missing or empty header admits everything; `q=0` excludes a range.
pub fn accepts(accept: Option<&str>, produced: &str) -> bool {
    let Some(accept) = accept.filter(|a| !a.trim().is_empty()) else {
        return true;
    };
    let (kind, _) = produced.split_once('/').unwrap_or((produced, ""));

    accept.split(',').any(|range| {
        let mut parts = range.split(';');
        let media = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let refused = parts.any(|p| {
            p.trim()
                .strip_prefix("q=")
                .and_then(|q| q.trim().parse::<f32>().ok())
                .is_some_and(|q| q <= 0.0)
        });
        if refused {
            return false;
        }
        media == "*/*" || media == produced || media == format!("{kind}/*")
    })
}

fn check_request(
    route: Route,
    headers: &HeaderMap,
    params: &BTreeMap<String, String>,
    body: &Bytes,
) -> Result<(), ApiError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(media_type)
        .unwrap_or_default();
    if !route
        .accepted_content_types()
        .contains(&content_type.as_str())
    {
        return Err(ApiError::unsupported_media_type(format!(
            "Unsupported Media Type: {}",
            if content_type.is_empty() {
                "none"
            } else {
                content_type.as_str()
            }
        )));
    }

    if body.is_empty() {
        return Err(ApiError::unsupported_media_type("request body is empty"));
    }
    if !route.matches_magic(body) {
        return Err(ApiError::unsupported_media_type(format!(
            "payload is not a valid {} document",
            route.input_extension()
        )));
    }

    let accept = headers.get(ACCEPT).and_then(|v| v.to_str().ok());
    let produced = route.response_type(params);
    if !accepts(accept, produced) {
        return Err(ApiError::not_acceptable(format!(
            "this request produces {produced}"
        )));
    }
    Ok(())
}

/// Shared handler of every conversion route.
///
/// If the client disconnects, axum drops this future; the pipeline's
/// artifact scope then cleans up from its `Drop`.
pub async fn convert(
    route: Route,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<BTreeMap<String, String>>, QueryRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = query?;
    let body = body?;
    check_request(route, &headers, &params, &body)?;

    let request = ConversionRequest {
        payload: body.to_vec(),
        params,
    };
    let result = state.converter.convert(route, &request).await?;

    Ok(([(CONTENT_TYPE, result.content_type)], result.body).into_response())
}
