//! Storage trait for build state files.
//!
//! Guarantees any implementation must uphold:
//! - `candidates(tag)` only returns files whose bucket tag matches `tag`
//!   case-insensitively, and does not need to load other tags.
//! - A record that cannot be decoded surfaces as an `Err` item in the list,
//!   never as a failure of the whole lookup, so callers can downgrade it to
//!   a cache miss.
//! - `write` is write-once per bucket id: an existing record is left intact.

use crate::error::StateResult;
use crate::schema::BuildStateFile;

/// A per-tag lookup result: each entry is a decoded file or its decode error.
pub type Candidates = Vec<StateResult<BuildStateFile>>;

/// Persistent store of [`BuildStateFile`]s keyed by bucket tag and id.
pub trait StateStore: Send + Sync {
    /// All stored records for `tag`.
    fn candidates(&self, tag: &str) -> StateResult<Candidates>;

    /// Persist `file`, returning its location.
    fn write(&self, file: &BuildStateFile) -> StateResult<String>;

    /// Tags with at least one stored record.
    fn list_tags(&self) -> StateResult<Vec<String>>;

    /// Remove every record for `tag`, returning how many were removed.
    fn remove_tag(&self, tag: &str) -> StateResult<usize>;
}
