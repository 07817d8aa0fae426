//! [`SqliteStore`]: the SQLite implementation of [`FragmentStore`] and
//! [`Authorizer`].

use std::{
  collections::{BTreeMap, BTreeSet},
  path::Path,
};

use chrono::Utc;
use rusqlite::{ErrorCode, OptionalExtension as _};
use tracing::debug;

use tessera_core::{
  auth::Authorizer,
  envelope::Envelope,
  fragment::{AttributedFragment, Fragment, FragmentHash, FragmentInput, SketchFragments},
  sketch::{CollectionId, Sketch, SketchId, UserId},
  store::{CommitOutcome, FragmentStore},
};

use crate::{
  Error, Result,
  encode::{
    CONTRIBUTIONS_COLUMN, EncodedFragment, FRAGMENT_COLUMNS, RawAttributed, RawFragment,
    decode_id_list, encode_dt, encode_id_list,
  },
  schema::{MIGRATE_V1, SCHEMA},
};

/// How many times a contended fragment insert is retried before giving up
/// with `ConcurrentCreateConflict`.
const CREATE_ATTEMPTS: usize = 3;

// ─── Store ───────────────────────────────────────────────────────────────────

/// A fragment store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        conn.execute_batch(SCHEMA)?;
        if version == 1 {
          conn.execute_batch(MIGRATE_V1)?;
          debug!("migrated store schema from version 1");
        }
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Delete every fragment no sketch references. Commits already collect
  /// what they orphan; this catches rows left by a bare
  /// [`FragmentStore::get_or_create_fragment`].
  pub async fn sweep_orphans(&self) -> Result<usize> {
    let swept = self
      .conn
      .call(|conn| {
        Ok(conn.execute(
          "DELETE FROM fragments
           WHERE NOT EXISTS (SELECT 1 FROM sketch_fragments sf WHERE sf.fragment_hash = fragments.hash)",
          [],
        )?)
      })
      .await?;
    if swept > 0 {
      debug!(swept, "swept unreferenced fragments");
    }
    Ok(swept)
  }

  /// Total number of fragment rows.
  pub async fn fragment_count(&self) -> Result<usize> {
    let n: i64 = self
      .conn
      .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM fragments", [], |r| r.get(0))?))
      .await?;
    Ok(n as usize)
  }
}

// ─── Statement helpers ───────────────────────────────────────────────────────
//
// Plain functions over a borrowed connection so they can run inside any
// transaction opened by a `call` closure.

fn sketch_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sketch> {
  Ok(Sketch {
    sketch_id:     row.get(0)?,
    owner_id:      row.get(1)?,
    project_id:    row.get(2)?,
    collection_id: row.get(3)?,
  })
}

fn find_sketch(conn: &rusqlite::Connection, id: SketchId) -> rusqlite::Result<Option<Sketch>> {
  conn
    .query_row(
      "SELECT sketch_id, owner_id, project_id, collection_id FROM sketches WHERE sketch_id = ?1",
      rusqlite::params![id],
      sketch_from_row,
    )
    .optional()
}

fn sketch_exists(conn: &rusqlite::Connection, id: SketchId) -> rusqlite::Result<bool> {
  Ok(find_sketch(conn, id)?.is_some())
}

fn fragment_exists(conn: &rusqlite::Connection, hash: &str) -> rusqlite::Result<bool> {
  Ok(
    conn
      .query_row("SELECT 1 FROM fragments WHERE hash = ?1", rusqlite::params![hash], |_| Ok(()))
      .optional()?
      .is_some(),
  )
}

fn find_fragment(conn: &rusqlite::Connection, hash: &str) -> rusqlite::Result<Option<RawFragment>> {
  conn
    .query_row(
      &format!("SELECT {FRAGMENT_COLUMNS} FROM fragments f WHERE f.hash = ?1"),
      rusqlite::params![hash],
      RawFragment::from_row,
    )
    .optional()
}

/// Insert unless a row with this hash already exists. Returns whether a row
/// was written.
fn insert_fragment(conn: &rusqlite::Connection, enc: &EncodedFragment) -> rusqlite::Result<bool> {
  let written = conn.execute(
    "INSERT INTO fragments (hash, geometry, min_x, min_y, max_x, max_y, created_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
     ON CONFLICT(hash) DO NOTHING",
    rusqlite::params![
      enc.hash,
      enc.geometry,
      enc.envelope.min_x,
      enc.envelope.min_y,
      enc.envelope.max_x,
      enc.envelope.max_y,
      enc.created_at,
    ],
  )?;
  if written == 0 {
    return Ok(false);
  }
  let mut stmt = conn
    .prepare_cached("INSERT INTO fragment_geographies (fragment_hash, geography_id) VALUES (?1, ?2)")?;
  for id in &enc.geography_ids {
    stmt.execute(rusqlite::params![enc.hash, id])?;
  }
  Ok(true)
}

/// A sketch's associations: fragment hash to the tags the sketch contributes.
fn sketch_associations(
  conn: &rusqlite::Connection,
  id: SketchId,
) -> rusqlite::Result<BTreeMap<String, String>> {
  let mut stmt = conn
    .prepare_cached("SELECT fragment_hash, geography_ids FROM sketch_fragments WHERE sketch_id = ?1")?;
  stmt
    .query_map(rusqlite::params![id], |r| Ok((r.get(0)?, r.get(1)?)))?
    .collect()
}

/// The full tag list of a stored fragment, comma-separated.
fn fragment_tags(conn: &rusqlite::Connection, hash: &str) -> rusqlite::Result<String> {
  conn.query_row(
    "SELECT COALESCE(GROUP_CONCAT(geography_id), '') FROM fragment_geographies WHERE fragment_hash = ?1",
    rusqlite::params![hash],
    |r| r.get(0),
  )
}

/// Delete those of `hashes` that no association references any more.
fn collect_orphans<'a>(
  conn: &rusqlite::Connection,
  hashes: impl IntoIterator<Item = &'a String>,
) -> rusqlite::Result<usize> {
  let mut stmt = conn.prepare_cached(
    "DELETE FROM fragments
     WHERE hash = ?1
       AND NOT EXISTS (SELECT 1 FROM sketch_fragments WHERE fragment_hash = ?1)",
  )?;
  let mut collected = 0;
  for hash in hashes {
    collected += stmt.execute(rusqlite::params![hash])?;
  }
  Ok(collected)
}

fn is_contention(e: &tokio_rusqlite::Error) -> bool {
  matches!(
    e,
    tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(f, _))
      if matches!(
        f.code,
        ErrorCode::ConstraintViolation | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
      )
  )
}

/// Aggregating select over fragments referenced by sketches of one
/// collection (`?1`). Callers append extra `AND` conditions, then the
/// `GROUP BY`.
fn collection_select() -> String {
  format!(
    "SELECT {FRAGMENT_COLUMNS}, GROUP_CONCAT(DISTINCT sf.sketch_id), {CONTRIBUTIONS_COLUMN}
     FROM fragments f
     JOIN sketch_fragments sf ON sf.fragment_hash = f.hash
     JOIN sketches s          ON s.sketch_id      = sf.sketch_id
     WHERE s.collection_id = ?1"
  )
}

struct PlannedChange {
  sketch_id: SketchId,
  /// Each new fragment with the sketch's own tags, encoded.
  fragments: Vec<(EncodedFragment, String)>,
  retain:    Vec<String>,
}

// ─── FragmentStore impl ──────────────────────────────────────────────────────

impl FragmentStore for SqliteStore {
  type Error = Error;

  // ── Sketches ──────────────────────────────────────────────────────────────

  async fn put_sketch(&self, sketch: Sketch) -> Result<Sketch> {
    let at_str = encode_dt(Utc::now());

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO sketches (sketch_id, owner_id, project_id, collection_id, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(sketch_id) DO UPDATE SET
             owner_id      = excluded.owner_id,
             project_id    = excluded.project_id,
             collection_id = excluded.collection_id",
          rusqlite::params![
            sketch.sketch_id,
            sketch.owner_id,
            sketch.project_id,
            sketch.collection_id,
            at_str,
          ],
        )?;
        Ok(())
      })
      .await?;

    Ok(sketch)
  }

  async fn get_sketch(&self, sketch_id: SketchId) -> Result<Option<Sketch>> {
    Ok(self.conn.call(move |conn| Ok(find_sketch(conn, sketch_id)?)).await?)
  }

  async fn list_collection_sketches(&self, collection_id: CollectionId) -> Result<Vec<Sketch>> {
    let sketches = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT sketch_id, owner_id, project_id, collection_id
           FROM sketches WHERE collection_id = ?1 ORDER BY sketch_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![collection_id], sketch_from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(sketches)
  }

  async fn set_sketch_collection(
    &self,
    sketch_id: SketchId,
    collection_id: Option<CollectionId>,
  ) -> Result<()> {
    let updated = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE sketches SET collection_id = ?2 WHERE sketch_id = ?1",
          rusqlite::params![sketch_id, collection_id],
        )?)
      })
      .await?;

    if updated == 0 {
      return Err(tessera_core::Error::SketchNotFound(sketch_id).into());
    }
    Ok(())
  }

  // ── Fragment writes ───────────────────────────────────────────────────────

  async fn get_or_create_fragment(&self, input: FragmentInput) -> Result<Fragment> {
    let enc = EncodedFragment::build(&input, Utc::now())?;

    for attempt in 1..=CREATE_ATTEMPTS {
      let attempt_enc = enc.clone();
      let result = self
        .conn
        .call(move |conn| {
          let tx = conn.transaction()?;
          insert_fragment(&tx, &attempt_enc)?;
          let raw = find_fragment(&tx, &attempt_enc.hash)?;
          tx.commit()?;
          Ok(raw)
        })
        .await;

      match result {
        Ok(Some(raw)) => return raw.into_fragment(),
        Ok(None) => debug!(attempt, hash = %enc.hash, "fragment vanished after insert; retrying"),
        Err(e) if is_contention(&e) => {
          debug!(attempt, hash = %enc.hash, "fragment insert contended; retrying")
        }
        Err(e) => return Err(e.into()),
      }
    }

    Err(tessera_core::Error::ConcurrentCreateConflict(enc.hash).into())
  }

  async fn replace_sketch_fragments(
    &self,
    sketch_id: SketchId,
    hashes: Vec<FragmentHash>,
  ) -> Result<CommitOutcome> {
    self
      .commit_sketch_fragments(vec![SketchFragments::new(sketch_id, Vec::new()).retaining(hashes)])
      .await
  }

  async fn commit_sketch_fragments(&self, changes: Vec<SketchFragments>) -> Result<CommitOutcome> {
    let now = Utc::now();
    let plan = changes
      .into_iter()
      .map(|change| {
        Ok(PlannedChange {
          sketch_id: change.sketch_id,
          fragments: change
            .pieces
            .iter()
            .map(|piece| {
              let enc = EncodedFragment::build(&piece.input, now)?;
              Ok((enc, encode_id_list(&piece.own_geography_ids)))
            })
            .collect::<Result<Vec<_>>>()?,
          retain:    change.retain.iter().map(|h| h.as_str().to_owned()).collect(),
        })
      })
      .collect::<Result<Vec<_>>>()?;

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut outcome = CommitOutcome::default();
        let mut released = BTreeSet::new();

        for change in &plan {
          if !sketch_exists(&tx, change.sketch_id)? {
            return Ok(Err(Error::Core(tessera_core::Error::SketchNotFound(change.sketch_id))));
          }
          let prior = sketch_associations(&tx, change.sketch_id)?;
          let mut next: BTreeMap<String, String> = BTreeMap::new();
          for (enc, own) in &change.fragments {
            if insert_fragment(&tx, enc)? {
              outcome.created += 1;
            }
            next.insert(enc.hash.clone(), own.clone());
          }
          // Retained hashes keep the tags the sketch already contributed.
          for hash in &change.retain {
            if !fragment_exists(&tx, hash)? {
              return Ok(Err(Error::FragmentNotFound(hash.clone())));
            }
            if !next.contains_key(hash) {
              let own = match prior.get(hash) {
                Some(own) => own.clone(),
                None => fragment_tags(&tx, hash)?,
              };
              next.insert(hash.clone(), own);
            }
          }
          released.extend(prior.into_keys().filter(|h| !next.contains_key(h)));

          tx.execute(
            "DELETE FROM sketch_fragments WHERE sketch_id = ?1",
            rusqlite::params![change.sketch_id],
          )?;
          {
            let mut stmt = tx.prepare_cached(
              "INSERT INTO sketch_fragments (sketch_id, fragment_hash, geography_ids)
               VALUES (?1, ?2, ?3)",
            )?;
            for (hash, own) in &next {
              stmt.execute(rusqlite::params![change.sketch_id, hash, own])?;
            }
          }
          outcome
            .fragments
            .insert(change.sketch_id, next.into_keys().map(FragmentHash::from_stored).collect());
        }

        outcome.collected = collect_orphans(&tx, &released)?;
        tx.commit()?;
        Ok(Ok(outcome))
      })
      .await??;

    debug!(
      sketches = outcome.fragments.len(),
      created = outcome.created,
      collected = outcome.collected,
      "committed sketch fragments"
    );
    Ok(outcome)
  }

  async fn delete_sketch(&self, sketch_id: SketchId) -> Result<usize> {
    let collected = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if !sketch_exists(&tx, sketch_id)? {
          return Ok(Err(Error::Core(tessera_core::Error::SketchNotFound(sketch_id))));
        }
        let prior = sketch_associations(&tx, sketch_id)?;
        tx.execute("DELETE FROM sketch_fragments WHERE sketch_id = ?1", rusqlite::params![sketch_id])?;
        tx.execute("DELETE FROM sketches WHERE sketch_id = ?1", rusqlite::params![sketch_id])?;
        let collected = collect_orphans(&tx, prior.keys())?;
        tx.commit()?;
        Ok(Ok(collected))
      })
      .await??;

    debug!(sketch_id, collected, "deleted sketch");
    Ok(collected)
  }

  async fn copy_sketch_fragments(&self, from: SketchId, to: SketchId) -> Result<usize> {
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        for id in [from, to] {
          if !sketch_exists(&tx, id)? {
            return Ok(Err(Error::Core(tessera_core::Error::SketchNotFound(id))));
          }
        }
        let prior = sketch_associations(&tx, to)?;
        tx.execute("DELETE FROM sketch_fragments WHERE sketch_id = ?1", rusqlite::params![to])?;
        let copied = tx.execute(
          "INSERT INTO sketch_fragments (sketch_id, fragment_hash, geography_ids)
           SELECT ?2, fragment_hash, geography_ids FROM sketch_fragments WHERE sketch_id = ?1",
          rusqlite::params![from, to],
        )?;
        collect_orphans(&tx, prior.keys())?;
        tx.commit()?;
        Ok(Ok(copied))
      })
      .await?
  }

  // ── Fragment reads ────────────────────────────────────────────────────────

  async fn get_fragment(&self, hash: FragmentHash) -> Result<Option<Fragment>> {
    let raw = self
      .conn
      .call(move |conn| Ok(find_fragment(conn, hash.as_str())?))
      .await?;
    raw.map(RawFragment::into_fragment).transpose()
  }

  async fn fragments_of_sketch(&self, sketch_id: SketchId) -> Result<Vec<Fragment>> {
    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {FRAGMENT_COLUMNS}
           FROM fragments f
           JOIN sketch_fragments sf ON sf.fragment_hash = f.hash
           WHERE sf.sketch_id = ?1
           ORDER BY f.hash"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![sketch_id], RawFragment::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawFragment::into_fragment).collect()
  }

  async fn contributions_of_sketch(&self, sketch_id: SketchId) -> Result<Vec<FragmentInput>> {
    let rows = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {FRAGMENT_COLUMNS}, sf.geography_ids
           FROM fragments f
           JOIN sketch_fragments sf ON sf.fragment_hash = f.hash
           WHERE sf.sketch_id = ?1
           ORDER BY f.hash"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![sketch_id], |row| {
            Ok((RawFragment::from_row(row)?, row.get::<_, String>(8)?))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    rows
      .into_iter()
      .map(|(raw, own)| -> Result<FragmentInput> {
        let fragment = raw.into_fragment()?;
        Ok(FragmentInput::new(fragment.geometry, decode_id_list(Some(&own))?))
      })
      .collect()
  }

  async fn fragments_for_collection(
    &self,
    collection_id: CollectionId,
  ) -> Result<Vec<AttributedFragment>> {
    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt =
          conn.prepare(&format!("{} GROUP BY f.hash ORDER BY f.hash", collection_select()))?;
        let rows = stmt
          .query_map(rusqlite::params![collection_id], RawAttributed::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawAttributed::into_attributed).collect()
  }

  async fn overlapping_fragments(
    &self,
    collection_id: CollectionId,
    envelopes: Vec<Envelope>,
    exclude: Option<SketchId>,
  ) -> Result<Vec<AttributedFragment>> {
    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "{}
             AND f.max_x >= ?2 AND f.min_x <= ?3
             AND f.max_y >= ?4 AND f.min_y <= ?5
           GROUP BY f.hash
           HAVING SUM(sf.sketch_id IS NOT ?6) > 0",
          collection_select()
        ))?;

        // A fragment can match several envelopes; keep one row per hash.
        let mut by_hash = BTreeMap::new();
        for env in &envelopes {
          let rows = stmt
            .query_map(
              rusqlite::params![collection_id, env.min_x, env.max_x, env.min_y, env.max_y, exclude],
              RawAttributed::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
          for row in rows {
            by_hash.entry(row.fragment.hash.clone()).or_insert(row);
          }
        }
        Ok(by_hash.into_values().collect::<Vec<_>>())
      })
      .await?;

    raws.into_iter().map(RawAttributed::into_attributed).collect()
  }
}

// ─── Authorizer impl ─────────────────────────────────────────────────────────

impl Authorizer for SqliteStore {
  type Error = Error;

  async fn assert_owner(&self, sketch_id: SketchId, caller_id: UserId) -> Result<()> {
    let sketch = self
      .get_sketch(sketch_id)
      .await?
      .ok_or(tessera_core::Error::SketchNotFound(sketch_id))?;

    if sketch.owner_id != caller_id {
      return Err(tessera_core::Error::PermissionDenied { sketch_id, caller_id }.into());
    }
    Ok(())
  }

  async fn assert_same_project(&self, a: SketchId, b: SketchId) -> Result<()> {
    let first = self.get_sketch(a).await?.ok_or(tessera_core::Error::SketchNotFound(a))?;
    let second = self.get_sketch(b).await?.ok_or(tessera_core::Error::SketchNotFound(b))?;

    if first.project_id != second.project_id {
      return Err(tessera_core::Error::CrossProject(a, b).into());
    }
    Ok(())
  }
}
