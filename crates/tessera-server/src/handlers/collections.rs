//! Handlers for `/collections` endpoints.

use std::collections::BTreeMap;

use axum::{
  Json,
  extract::{Path, State},
};
use serde::Deserialize;
use tessera_core::{
  envelope::Envelope,
  fragment::AttributedFragment,
  sketch::{CollectionId, Sketch, SketchId},
};

use crate::{AppState, auth::Caller, error::Result, service::Backend};

/// `GET /collections/{id}/fragments`
pub async fn fragments<S: Backend>(
  State(state): State<AppState<S>>,
  Caller(_): Caller,
  Path(id): Path<CollectionId>,
) -> Result<Json<Vec<AttributedFragment>>> {
  Ok(Json(state.service.fragments_for_collection(id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyBody {
  pub target_collection_id: CollectionId,
  /// Source sketch id to the id its copy should get.
  pub sketch_ids:           BTreeMap<SketchId, SketchId>,
}

/// `POST /collections/{id}/copy`
pub async fn copy<S: Backend>(
  State(state): State<AppState<S>>,
  Caller(caller): Caller,
  Path(id): Path<CollectionId>,
  Json(body): Json<CopyBody>,
) -> Result<Json<Vec<Sketch>>> {
  let copies = state
    .service
    .copy_collection(id, body.target_collection_id, body.sketch_ids, caller)
    .await?;
  Ok(Json(copies))
}

#[derive(Debug, Deserialize)]
pub struct OverlapBody {
  pub envelopes: Vec<Envelope>,
  #[serde(default)]
  pub exclude:   Option<SketchId>,
}

/// `POST /collections/{id}/overlapping`
pub async fn overlapping<S: Backend>(
  State(state): State<AppState<S>>,
  Caller(_): Caller,
  Path(id): Path<CollectionId>,
  Json(body): Json<OverlapBody>,
) -> Result<Json<Vec<AttributedFragment>>> {
  Ok(Json(state.service.overlapping_fragments(id, body.envelopes, body.exclude).await?))
}
