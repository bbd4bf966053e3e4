//! Strata State - build state persistence (Layer 0)
//!
//! Bucket ids, per-project output snapshots and the state files that let a
//! later build skip modules whose content has not changed.

pub mod error;
pub mod fakes;
pub mod fs;
pub mod schema;
pub mod store;

pub use error::{StateError, StateResult};
pub use fakes::MemoryStateStore;
pub use fs::FsStateStore;
pub use schema::{
    decode_state_file, encode_state_file, normalize_key, BucketId, BuildStateFile,
    ProjectOutputSnapshot, STATE_FORMAT_VERSION,
};
pub use store::{Candidates, StateStore};
