//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are RFC 3339 strings. Geometry is the `geo-types` serde JSON of
//! the canonical form. Id lists coming out of `GROUP_CONCAT` are
//! comma-separated integers; per-sketch tag lists are `sketch:ids` pairs
//! joined with `;`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use geo_types::Geometry;
use tessera_core::{
  envelope::{Envelope, envelopes_of},
  fragment::{AttributedFragment, Fragment, FragmentHash, FragmentInput, normalize_ids},
  hash::{canonical_geometry, compute_hash, verify_hash},
  sketch::{GeographyId, SketchId},
};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Geometry ────────────────────────────────────────────────────────────────

pub fn encode_geometry(g: &Geometry<f64>) -> Result<String> { Ok(serde_json::to_string(g)?) }

pub fn decode_geometry(s: &str) -> Result<Geometry<f64>> { Ok(serde_json::from_str(s)?) }

// ─── Id lists ────────────────────────────────────────────────────────────────

/// Parse a `GROUP_CONCAT` id list. `NULL` (no rows) is the empty list.
pub fn decode_id_list(csv: Option<&str>) -> Result<Vec<i64>> {
  let Some(csv) = csv else {
    return Ok(Vec::new());
  };
  let ids = csv
    .split(',')
    .filter(|s| !s.is_empty())
    .map(|s| {
      s.trim()
        .parse::<i64>()
        .map_err(|e| Error::Decode(format!("id list {csv:?}: {e}")))
    })
    .collect::<Result<Vec<_>>>()?;
  Ok(normalize_ids(ids))
}

pub fn encode_id_list(ids: &[i64]) -> String {
  normalize_ids(ids.iter().copied())
    .iter()
    .map(i64::to_string)
    .collect::<Vec<_>>()
    .join(",")
}

/// Parse `sketch:ids;sketch:ids` as built by [`CONTRIBUTIONS_COLUMN`].
pub fn decode_contributions(list: Option<&str>) -> Result<BTreeMap<SketchId, Vec<GeographyId>>> {
  let mut out = BTreeMap::new();
  for pair in list.unwrap_or_default().split(';').filter(|s| !s.is_empty()) {
    let (sketch, ids) = pair
      .split_once(':')
      .ok_or_else(|| Error::Decode(format!("contribution {pair:?} has no ':'")))?;
    let sketch = sketch
      .trim()
      .parse::<SketchId>()
      .map_err(|e| Error::Decode(format!("contribution {pair:?}: {e}")))?;
    out.insert(sketch, decode_id_list(Some(ids))?);
  }
  Ok(out)
}

// ─── Fragment (write side) ───────────────────────────────────────────────────

/// A fragment validated, hashed and encoded for insertion. Built outside the
/// database thread so no geometry work happens inside a transaction.
#[derive(Debug, Clone)]
pub struct EncodedFragment {
  pub hash:          String,
  pub geometry:      String,
  pub envelope:      Envelope,
  pub geography_ids: Vec<i64>,
  pub created_at:    String,
}

impl EncodedFragment {
  pub fn build(input: &FragmentInput, now: DateTime<Utc>) -> Result<Self> {
    let geography_ids = normalize_ids(input.geography_ids.iter().copied());
    let hash = compute_hash(&input.geometry, &geography_ids)?;
    let canonical = canonical_geometry(&input.geometry)?;
    let envelope = envelopes_of(&canonical)?
      .into_iter()
      .reduce(|a, b| a.union(&b))
      .ok_or_else(|| tessera_core::Error::invalid("empty geometry"))?;

    Ok(Self {
      hash: hash.as_str().to_owned(),
      geometry: encode_geometry(&canonical)?,
      envelope,
      geography_ids,
      created_at: encode_dt(now),
    })
  }
}

// ─── Fragment (read side) ────────────────────────────────────────────────────

/// Column list matching [`RawFragment`]; `f` aliases `fragments`.
pub const FRAGMENT_COLUMNS: &str = "
  f.hash, f.geometry, f.min_x, f.min_y, f.max_x, f.max_y, f.created_at,
  (SELECT GROUP_CONCAT(g.geography_id) FROM fragment_geographies g WHERE g.fragment_hash = f.hash)";

/// Per-sketch tag lists of an aggregate over `sketch_fragments sf`.
pub const CONTRIBUTIONS_COLUMN: &str = "GROUP_CONCAT(sf.sketch_id || ':' || sf.geography_ids, ';')";

/// Raw strings read directly from a `fragments` row before decoding.
pub struct RawFragment {
  pub hash:          String,
  pub geometry:      String,
  pub min_x:         f64,
  pub min_y:         f64,
  pub max_x:         f64,
  pub max_y:         f64,
  pub created_at:    String,
  pub geography_ids: Option<String>,
}

impl RawFragment {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      hash:          row.get(0)?,
      geometry:      row.get(1)?,
      min_x:         row.get(2)?,
      min_y:         row.get(3)?,
      max_x:         row.get(4)?,
      max_y:         row.get(5)?,
      created_at:    row.get(6)?,
      geography_ids: row.get(7)?,
    })
  }

  /// Decode the row, rejecting it if its geometry and tags no longer hash to
  /// the stored key.
  pub fn into_fragment(self) -> Result<Fragment> {
    let fragment = Fragment {
      hash:          FragmentHash::from_stored(self.hash),
      geometry:      decode_geometry(&self.geometry)?,
      envelope:      Envelope::new(self.min_x, self.min_y, self.max_x, self.max_y),
      geography_ids: decode_id_list(self.geography_ids.as_deref())?,
      created_at:    decode_dt(&self.created_at)?,
    };
    if !verify_hash(&fragment.hash, &fragment.geometry, &fragment.geography_ids)? {
      return Err(Error::Decode(format!(
        "fragment {} does not match its content hash",
        fragment.hash
      )));
    }
    Ok(fragment)
  }
}

/// A fragment row plus the `GROUP_CONCAT`s of the sketches referencing it
/// and of their own tags.
pub struct RawAttributed {
  pub fragment:      RawFragment,
  pub sketch_ids:    Option<String>,
  pub contributions: Option<String>,
}

impl RawAttributed {
  /// Reads [`FRAGMENT_COLUMNS`], a sketch id list column, then
  /// [`CONTRIBUTIONS_COLUMN`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      fragment:      RawFragment::from_row(row)?,
      sketch_ids:    row.get(8)?,
      contributions: row.get(9)?,
    })
  }

  pub fn into_attributed(self) -> Result<AttributedFragment> {
    Ok(AttributedFragment {
      sketch_ids:    decode_id_list(self.sketch_ids.as_deref())?,
      contributions: decode_contributions(self.contributions.as_deref())?,
      fragment:      self.fragment.into_fragment()?,
    })
  }
}
