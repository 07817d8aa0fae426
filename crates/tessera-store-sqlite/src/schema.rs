//! SQL schema for the Tessera SQLite store.
//!
//! Executed once at connection startup. Upgrades from older files are gated
//! on `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE ... IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS sketches (
    sketch_id     INTEGER PRIMARY KEY,
    owner_id      INTEGER NOT NULL,
    project_id    INTEGER NOT NULL,
    collection_id INTEGER,           -- NULL when not in a collection
    created_at    TEXT NOT NULL
);

-- Content-addressed and immutable. A row is deleted only when the last
-- association referencing it goes away.
CREATE TABLE IF NOT EXISTS fragments (
    hash        TEXT PRIMARY KEY,    -- hex SHA-256 of canonical geometry + geography ids
    geometry    TEXT NOT NULL,       -- canonical geometry as JSON
    min_x       REAL NOT NULL,
    min_y       REAL NOT NULL,
    max_x       REAL NOT NULL,
    max_y       REAL NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fragment_geographies (
    fragment_hash TEXT NOT NULL REFERENCES fragments(hash) ON DELETE CASCADE,
    geography_id  INTEGER NOT NULL,
    PRIMARY KEY (fragment_hash, geography_id)
);

-- geography_ids: comma-separated tags the sketch itself contributes to the
-- fragment; a subset of the fragment's own tags.
CREATE TABLE IF NOT EXISTS sketch_fragments (
    sketch_id     INTEGER NOT NULL REFERENCES sketches(sketch_id) ON DELETE CASCADE,
    fragment_hash TEXT NOT NULL REFERENCES fragments(hash),
    geography_ids TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (sketch_id, fragment_hash)
);

CREATE INDEX IF NOT EXISTS sketches_collection_idx      ON sketches(collection_id);
CREATE INDEX IF NOT EXISTS sketch_fragments_hash_idx    ON sketch_fragments(fragment_hash);
CREATE INDEX IF NOT EXISTS fragments_envelope_idx       ON fragments(min_x, max_x, min_y, max_y);
CREATE INDEX IF NOT EXISTS fragment_geographies_geo_idx ON fragment_geographies(geography_id);

PRAGMA user_version = 2;
";

/// Version 1 files lack the per-association tag column. Existing
/// associations are backfilled with the fragment's full tag set.
pub const MIGRATE_V1: &str = "
ALTER TABLE sketch_fragments ADD COLUMN geography_ids TEXT NOT NULL DEFAULT '';
UPDATE sketch_fragments SET geography_ids = COALESCE(
    (SELECT GROUP_CONCAT(g.geography_id) FROM fragment_geographies g
     WHERE g.fragment_hash = sketch_fragments.fragment_hash),
    '');
";
