#![warn(missing_docs)]

//! filebase: named file handles with advisory locking, stale-handle
//! recovery and owned memory-mapped views.
//!
//! A [`FileHandle`] owns one descriptor for a path. It can take shared or
//! exclusive `flock(2)` locks with a bounded retry budget, notices when the
//! path was deleted and recreated underneath it and reopens before locking,
//! and hands out [`MappedView`]s that the caller owns outright.

pub mod config;
pub mod error;
pub mod handle;
pub mod identity;
pub mod lock;
pub mod map;
pub mod mode;
pub mod stats;

pub use config::{HandleConfig, LockOptions, DEFAULT_CREATE_MODE, DEFAULT_MAX_RETRY, DEFAULT_RETRY_INTERVAL_MICROS};
pub use error::{FileError, FileErrorKind, FileResult};
pub use handle::FileHandle;
pub use identity::FileIdentity;
pub use lock::{RecordingSleeper, Sleeper, ThreadSleeper};
pub use map::MappedView;
pub use mode::{LockMode, OpenFlags, OpenMode, RawOpenFlags};
pub use stats::HandleStats;
