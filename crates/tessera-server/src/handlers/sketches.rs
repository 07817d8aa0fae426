//! Handlers for `/sketches` endpoints.
//!
//! | Method   | Path | Notes |
//! |----------|------|-------|
//! | `POST`   | `/sketches` | Body: `{"sketchId":1,"projectId":2,"collectionId":3}` |
//! | `GET`    | `/sketches/{id}/fragments` | 404 if the sketch is unknown |
//! | `PUT`    | `/sketches/{id}/fragments` | Geometry with tags or clipping geographies, or explicit fragments |
//! | `DELETE` | `/sketches/{id}` | Returns the number of fragments collected |
//! | `POST`   | `/sketches/{id}/copy` | Body: `{"copyId":9,"collectionId":3}` |
//! | `POST`   | `/sketches/{id}/move` | Body: `{"collectionId":4}` or `null` to leave |

use axum::{
  Json,
  extract::{Path, State},
  http::StatusCode,
  response::IntoResponse,
};
use geo_types::Geometry;
use serde::{Deserialize, Serialize};
use tessera_core::{
  fragment::{Fragment, FragmentInput},
  sketch::{CollectionId, GeographyId, ProjectId, SketchId},
};
use tessera_overlay::GeographySettings;

use crate::{
  AppState,
  auth::Caller,
  error::{Error, Result},
  service::{Backend, Geographies, UpdateSummary},
};

// ─── Register ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
  pub sketch_id:     SketchId,
  pub project_id:    ProjectId,
  #[serde(default)]
  pub collection_id: Option<CollectionId>,
}

/// `POST /sketches`
pub async fn register<S: Backend>(
  State(state): State<AppState<S>>,
  Caller(caller): Caller,
  Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse> {
  let sketch = state
    .service
    .register_sketch(caller, body.sketch_id, body.project_id, body.collection_id)
    .await?;
  Ok((StatusCode::CREATED, Json(sketch)))
}

// ─── Fragments ────────────────────────────────────────────────────────────────

/// `GET /sketches/{id}/fragments`
pub async fn fragments<S: Backend>(
  State(state): State<AppState<S>>,
  Caller(_): Caller,
  Path(id): Path<SketchId>,
) -> Result<Json<Vec<Fragment>>> {
  Ok(Json(state.service.fragments_for_sketch(id).await?))
}

/// Either a sketch geometry (tagged with `geographyIds`, or clipped to
/// `geographies`) or a list of already-split `fragments`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBody {
  pub geometry:      Option<Geometry<f64>>,
  pub geography_ids: Option<Vec<GeographyId>>,
  pub geographies:   Option<Vec<GeographySettings>>,
  pub fragments:     Option<Vec<FragmentInput>>,
}

/// `PUT /sketches/{id}/fragments`
pub async fn update<S: Backend>(
  State(state): State<AppState<S>>,
  Caller(caller): Caller,
  Path(id): Path<SketchId>,
  Json(body): Json<UpdateBody>,
) -> Result<Json<UpdateSummary>> {
  let summary = match body {
    UpdateBody { geometry: Some(geometry), geography_ids, geographies, fragments: None } => {
      let geographies = match (geography_ids, geographies) {
        (Some(_), Some(_)) => {
          return Err(Error::BadRequest(
            "geographyIds and geographies are mutually exclusive".to_string(),
          ));
        }
        (_, Some(settings)) => Geographies::Clip(settings),
        (ids, None) => Geographies::Tags(ids.unwrap_or_default()),
      };
      state.service.update_sketch(id, caller, geometry, geographies).await?
    }
    UpdateBody { geometry: None, geography_ids: None, geographies: None, fragments: Some(inputs) } => {
      let inputs =
        inputs.into_iter().map(|i| FragmentInput::new(i.geometry, i.geography_ids)).collect();
      state.service.update_sketch_fragments(id, caller, inputs).await?
    }
    _ => {
      return Err(Error::BadRequest(
        "expected either a geometry or a list of fragments".to_string(),
      ));
    }
  };
  Ok(Json(summary))
}

// ─── Delete ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Removed {
  pub sketch_id: SketchId,
  pub collected: usize,
}

/// `DELETE /sketches/{id}`
pub async fn remove<S: Backend>(
  State(state): State<AppState<S>>,
  Caller(caller): Caller,
  Path(id): Path<SketchId>,
) -> Result<Json<Removed>> {
  let collected = state.service.delete_sketch(id, caller).await?;
  Ok(Json(Removed { sketch_id: id, collected }))
}

// ─── Copy / move ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyBody {
  pub copy_id:       SketchId,
  #[serde(default)]
  pub collection_id: Option<CollectionId>,
}

/// `POST /sketches/{id}/copy`
pub async fn copy<S: Backend>(
  State(state): State<AppState<S>>,
  Caller(caller): Caller,
  Path(id): Path<SketchId>,
  Json(body): Json<CopyBody>,
) -> Result<Json<Vec<Fragment>>> {
  Ok(Json(state.service.copy_sketch(id, body.copy_id, body.collection_id, caller).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveBody {
  pub collection_id: Option<CollectionId>,
}

/// `POST /sketches/{id}/move`
pub async fn move_to<S: Backend>(
  State(state): State<AppState<S>>,
  Caller(caller): Caller,
  Path(id): Path<SketchId>,
  Json(body): Json<MoveBody>,
) -> Result<Json<UpdateSummary>> {
  Ok(Json(state.service.move_sketch(id, caller, body.collection_id).await?))
}
