//! JSON HTTP API and orchestration for the fragment engine.
//!
//! [`FragmentService`] runs the update, read, delete, copy and move flows over
//! any [`service::Backend`]; [`router`] exposes them over axum.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod service;

pub use error::Error;
pub use service::{FragmentService, Geographies, UpdateSummary};

use std::{path::PathBuf, sync::Arc};

use axum::{
  Router,
  routing::{delete, get, post},
};
use serde::Deserialize;
use tessera_overlay::ResolverConfig;
use tower_http::trace::TraceLayer;

use handlers::{collections, sketches};
use service::Backend;

// ─── Configuration ────────────────────────────────────────────────────────────

/// Runtime server configuration, deserialised from `tessera.toml` and
/// `TESSERA_*` environment variables.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
  pub host:               String,
  pub port:               u16,
  pub store_path:         PathBuf,
  /// Wall-clock budget for a single overlap resolution.
  pub resolve_timeout_ms: u64,
  pub resolver:           ResolverConfig,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      host:               "127.0.0.1".to_string(),
      port:               8080,
      store_path:         PathBuf::from("tessera.db"),
      resolve_timeout_ms: 30_000,
      resolver:           ResolverConfig::default(),
    }
  }
}

// ─── Application state ────────────────────────────────────────────────────────

/// Shared state threaded through all axum handlers.
pub struct AppState<S> {
  pub service: Arc<FragmentService<S>>,
  pub config:  Arc<ServerConfig>,
}

impl<S> Clone for AppState<S> {
  fn clone(&self) -> Self {
    Self { service: self.service.clone(), config: self.config.clone() }
  }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// Build the axum [`Router`] for the fragment API.
pub fn router<S: Backend>(state: AppState<S>) -> Router {
  Router::new()
    .route("/sketches",                       post(sketches::register::<S>))
    .route("/sketches/{id}",                  delete(sketches::remove::<S>))
    .route(
      "/sketches/{id}/fragments",
      get(sketches::fragments::<S>).put(sketches::update::<S>),
    )
    .route("/sketches/{id}/copy",             post(sketches::copy::<S>))
    .route("/sketches/{id}/move",             post(sketches::move_to::<S>))
    .route("/collections/{id}/fragments",     get(collections::fragments::<S>))
    .route("/collections/{id}/copy",          post(collections::copy::<S>))
    .route("/collections/{id}/overlapping",   post(collections::overlapping::<S>))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use axum::{
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
  };
  use serde_json::{Value, json};
  use tessera_overlay::OverlapResolver;
  use tessera_store_sqlite::SqliteStore;
  use tower::ServiceExt as _;

  use super::*;
  use crate::auth::USER_HEADER;

  const OWNER: &str = "10";

  async fn make_state() -> AppState<SqliteStore> {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let config = ServerConfig { store_path: PathBuf::from(":memory:"), ..ServerConfig::default() };
    let service = FragmentService::new(
      Arc::new(store),
      OverlapResolver::new(config.resolver.clone()),
      Duration::from_millis(config.resolve_timeout_ms),
    );
    AppState { service: Arc::new(service), config: Arc::new(config) }
  }

  async fn send(
    state:  &AppState<SqliteStore>,
    method: &str,
    uri:    &str,
    user:   Option<&str>,
    body:   Option<Value>,
  ) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
      builder = builder.header(USER_HEADER, user);
    }
    let body = match body {
      Some(v) => {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(v.to_string())
      }
      None => Body::empty(),
    };
    router(state.clone()).oneshot(builder.body(body).unwrap()).await.unwrap()
  }

  async fn json_body(resp: Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
  }

  fn rect(x0: f64, x1: f64) -> Value {
    json!({ "Polygon": {
      "exterior": [
        { "x": x0, "y": 0.0 }, { "x": x1, "y": 0.0 },
        { "x": x1, "y": 0.001 }, { "x": x0, "y": 0.001 }, { "x": x0, "y": 0.0 }
      ],
      "interiors": []
    }})
  }

  async fn register(state: &AppState<SqliteStore>, id: i64) {
    let body = json!({ "sketchId": id, "projectId": 100, "collectionId": 7 });
    let resp = send(state, "POST", "/sketches", Some(OWNER), Some(body)).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
  }

  async fn put_geometry(state: &AppState<SqliteStore>, id: i64, geometry: Value) -> Response {
    let body = json!({ "geometry": geometry, "geographyIds": [1] });
    send(state, "PUT", &format!("/sketches/{id}/fragments"), Some(OWNER), Some(body)).await
  }

  // ── Auth ────────────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn missing_user_header_is_401() {
    let state = make_state().await;
    let resp = send(&state, "GET", "/collections/7/fragments", None, None).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(resp).await;
    assert!(body["error"].as_str().unwrap().contains(USER_HEADER));
  }

  // ── Sketch fragments ───────────────────────────────────────────────────────

  #[tokio::test]
  async fn update_then_read_fragments() {
    let state = make_state().await;
    register(&state, 1).await;

    let resp = put_geometry(&state, 1, rect(0.0, 0.003)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let summary = json_body(resp).await;
    assert_eq!(summary["sketchId"], 1);
    assert_eq!(summary["fragments"].as_array().unwrap().len(), 1);

    let resp = send(&state, "GET", "/sketches/1/fragments", Some(OWNER), None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let fragments = json_body(resp).await;
    assert_eq!(fragments[0]["hash"], summary["fragments"][0]["hash"]);
    assert_eq!(fragments[0]["geographyIds"], json!([1]));
    assert_eq!(fragments[0]["hash"].as_str().unwrap().len(), 64);
  }

  #[tokio::test]
  async fn overlapping_sketches_through_the_api() {
    let state = make_state().await;
    register(&state, 1).await;
    register(&state, 2).await;
    put_geometry(&state, 1, rect(0.0, 0.003)).await;
    put_geometry(&state, 2, rect(0.002, 0.005)).await;

    let resp = send(&state, "GET", "/collections/7/fragments", Some(OWNER), None).await;
    let fragments = json_body(resp).await;
    let fragments = fragments.as_array().unwrap();
    assert_eq!(fragments.len(), 3);
    assert_eq!(fragments.iter().filter(|f| f["sketchIds"] == json!([1, 2])).count(), 1);

    let body = json!({
      "envelopes": [{ "minX": 0.002, "minY": 0.0, "maxX": 0.005, "maxY": 0.001 }],
      "exclude": 2
    });
    let resp =
      send(&state, "POST", "/collections/7/overlapping", Some(OWNER), Some(body)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let candidates = json_body(resp).await;
    assert_eq!(candidates.as_array().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn explicit_fragment_inputs_are_accepted() {
    let state = make_state().await;
    register(&state, 1).await;
    let body = json!({ "fragments": [{ "geometry": rect(0.0, 0.003), "geographyIds": [3, 1] }] });
    let resp = send(&state, "PUT", "/sketches/1/fragments", Some(OWNER), Some(body)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let summary = json_body(resp).await;
    assert_eq!(summary["fragments"][0]["geographyIds"], json!([1, 3]));
  }

  #[tokio::test]
  async fn clipping_geographies_through_the_api() {
    let state = make_state().await;
    register(&state, 1).await;
    let east = json!([{ "exterior": [
      { "x": 0.001, "y": -1.0 }, { "x": 1.0, "y": -1.0 },
      { "x": 1.0, "y": 1.0 }, { "x": 0.001, "y": 1.0 }, { "x": 0.001, "y": -1.0 }
    ], "interiors": [] }]);
    let body = json!({
      "geometry": rect(0.0, 0.002),
      "geographies": [{ "id": 2, "layers": [{ "op": "INTERSECT", "shape": east }] }]
    });
    let resp = send(&state, "PUT", "/sketches/1/fragments", Some(OWNER), Some(body)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let summary = json_body(resp).await;
    assert_eq!(summary["fragments"].as_array().unwrap().len(), 1);
    assert_eq!(summary["fragments"][0]["geographyIds"], json!([2]));
  }

  #[tokio::test]
  async fn ambiguous_update_body_is_400() {
    let state = make_state().await;
    register(&state, 1).await;

    let resp = send(&state, "PUT", "/sketches/1/fragments", Some(OWNER), Some(json!({}))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body = json!({ "geometry": rect(0.0, 0.003), "geographyIds": [1], "geographies": [] });
    let resp = send(&state, "PUT", "/sketches/1/fragments", Some(OWNER), Some(body)).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
  }

  // ── Error mapping ──────────────────────────────────────────────────────────

  #[tokio::test]
  async fn antimeridian_jump_is_422() {
    let state = make_state().await;
    register(&state, 1).await;
    let jump = json!({ "Polygon": {
      "exterior": [
        { "x": 179.9, "y": 0.0 }, { "x": -179.8, "y": 0.0 },
        { "x": -179.8, "y": 1.0 }, { "x": 179.9, "y": 1.0 }, { "x": 179.9, "y": 0.0 }
      ],
      "interiors": []
    }});
    let resp = put_geometry(&state, 1, jump).await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(resp).await;
    assert!(body["error"].as_str().unwrap().contains("antimeridian"));
  }

  #[tokio::test]
  async fn non_owner_is_403_and_unknown_sketch_is_404() {
    let state = make_state().await;
    register(&state, 1).await;

    let body = json!({ "geometry": rect(0.0, 0.003), "geographyIds": [] });
    let resp = send(&state, "PUT", "/sketches/1/fragments", Some("11"), Some(body)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = send(&state, "GET", "/sketches/99/fragments", Some(OWNER), None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
  }

  // ── Delete / copy / move ───────────────────────────────────────────────────

  #[tokio::test]
  async fn delete_copy_and_move() {
    let state = make_state().await;
    register(&state, 1).await;
    put_geometry(&state, 1, rect(0.0, 0.003)).await;

    let body = json!({ "copyId": 5, "collectionId": 8 });
    let resp = send(&state, "POST", "/sketches/1/copy", Some(OWNER), Some(body)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await.as_array().unwrap().len(), 1);

    let resp =
      send(&state, "POST", "/sketches/5/move", Some(OWNER), Some(json!({ "collectionId": null })))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = send(&state, "GET", "/collections/8/fragments", Some(OWNER), None).await;
    assert!(json_body(resp).await.as_array().unwrap().is_empty());

    // The copy still holds the fragment, so nothing is collected.
    let resp = send(&state, "DELETE", "/sketches/1", Some(OWNER), None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["collected"], 0);

    let resp = send(&state, "DELETE", "/sketches/5", Some(OWNER), None).await;
    assert_eq!(json_body(resp).await["collected"], 1);
  }

  #[tokio::test]
  async fn copy_collection_maps_every_sketch() {
    let state = make_state().await;
    register(&state, 1).await;
    register(&state, 2).await;
    put_geometry(&state, 1, rect(0.0, 0.003)).await;
    put_geometry(&state, 2, rect(0.002, 0.005)).await;

    let body = json!({ "targetCollectionId": 8, "sketchIds": { "1": 11, "2": 12 } });
    let resp = send(&state, "POST", "/collections/7/copy", Some(OWNER), Some(body)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let copies = json_body(resp).await;
    assert_eq!(copies[0]["sketchId"], 11);
    assert_eq!(copies[1]["collectionId"], 8);

    let resp = send(&state, "GET", "/collections/8/fragments", Some(OWNER), None).await;
    assert_eq!(json_body(resp).await.as_array().unwrap().len(), 3);
  }
}
