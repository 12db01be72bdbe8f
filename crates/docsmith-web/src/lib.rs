//! HTTP surface of docsmith: one POST route per conversion plus a
//! healthcheck, wrapped in auth, CORS, security headers and tracing.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, header};
use axum::middleware;
use axum::routing::{get, post};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use docsmith_core::{Converter, Route, Settings};

pub mod auth;
pub mod error;
pub mod handlers;
pub mod models;
pub mod state;

use state::AppState;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT]);
    if origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }
    let list: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(list))
}

/// Build the application router from resolved settings.
pub fn app(settings: &Settings) -> Router {
    let state = Arc::new(AppState {
        converter: Converter::new(settings.converter.clone()),
        bearer_tokens: settings.bearer_tokens.clone(),
    });

    let mut conversions = Router::new();
    for route in Route::ALL {
        conversions = conversions.route(
            route.path(),
            post(
                move |state: State<Arc<AppState>>,
                      headers: HeaderMap,
                      query: Result<Query<BTreeMap<String, String>>, QueryRejection>,
                      body: Result<Bytes, BytesRejection>| {
                    handlers::convert::convert(route, state, headers, query, body)
                },
            ),
        );
    }
    let conversions = conversions.route_layer(middleware::from_fn_with_state(
        state.clone(),
        auth::require_bearer,
    ));

    Router::new()
        .route("/admin/healthcheck", get(handlers::health::healthcheck))
        .merge(conversions)
        .fallback(handlers::health::not_found)
        .layer(DefaultBodyLimit::max(settings.body_limit_bytes))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store, max-age=0, must-revalidate"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("SAMEORIGIN"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(cors_layer(&settings.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
