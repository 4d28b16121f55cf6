//! The Abstract DB contract (§4.B): the narrow interface the core consumes
//! from whatever storage engine backs it. Storage engines themselves are
//! out of scope; [`hash::HashDb`] is the one concrete, in-memory
//! implementation this crate ships so the rest of the system has something
//! real to run against.

pub mod hash;
pub mod lock;
pub mod logged;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::DbError;

/// Which permissions the database was opened with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbMode {
    ReadWrite,
    ReadOnly,
}

/// A merge function for [`AbstractDb::put_proc`]: given the existing value
/// (if any) and the caller's `val`, returns the new value to store, or
/// `None` to veto the write.
pub type MergeFn<'a> = &'a (dyn Fn(Option<&[u8]>, &[u8]) -> Option<Vec<u8>> + Send + Sync);

/// The operation set the core calls through; any storage engine honoring
/// this contract can back the server. Semantics follow §4.B.
#[async_trait]
pub trait AbstractDb: Send + Sync {
    /// Unconditionally stores `val` at `key`.
    async fn put(&self, key: &[u8], val: &[u8]) -> Result<(), DbError>;

    /// Stores `val` at `key` only if `key` is absent. Returns `false`
    /// (not an error) on conflict.
    async fn put_keep(&self, key: &[u8], val: &[u8]) -> Result<bool, DbError>;

    /// Appends `val` to the existing value at `key` (or stores it as the
    /// value if `key` is absent).
    async fn put_cat(&self, key: &[u8], val: &[u8]) -> Result<(), DbError>;

    /// Atomically replaces the value at `key` with `merge(old, val)`.
    /// Returns `false` if `merge` vetoes the write.
    async fn put_proc(&self, key: &[u8], val: &[u8], merge: MergeFn<'_>) -> Result<bool, DbError>;

    /// Removes `key`. Returns `false` (not an error) if it was absent.
    async fn out(&self, key: &[u8]) -> Result<bool, DbError>;

    /// Fetches the value at `key`, if present.
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, DbError>;

    /// Size of the value at `key`, or `-1` if absent.
    async fn vsiz(&self, key: &[u8]) -> Result<i64, DbError>;

    /// (Re)starts a full-table iteration, snapshotting the current key set.
    async fn iter_init(&self) -> Result<(), DbError>;

    /// Advances the iterator started by `iter_init`, returning the next
    /// key, or `None` once exhausted.
    async fn iter_next(&self) -> Result<Option<Bytes>, DbError>;

    /// Keys with the given prefix, in no particular order, capped at `max`
    /// (if given).
    async fn fwm_keys(&self, prefix: &[u8], max: Option<usize>) -> Result<Vec<Bytes>, DbError>;

    /// Adds `delta` to the integer at `key` (treated as `0` if absent),
    /// returning the new value.
    async fn add_int(&self, key: &[u8], delta: i32) -> Result<i32, DbError>;

    /// Adds `delta` to the double at `key` (treated as `0.0` if absent),
    /// returning the new value.
    async fn add_double(&self, key: &[u8], delta: f64) -> Result<f64, DbError>;

    /// Forces any buffered state to durable storage.
    async fn sync(&self) -> Result<(), DbError>;

    /// Engine-specific tuning; `params` is an opaque, engine-defined string.
    async fn optimize(&self, params: &str) -> Result<(), DbError>;

    /// Removes every record.
    async fn vanish(&self) -> Result<(), DbError>;

    /// Copies the database to `path`.
    async fn copy(&self, path: &str) -> Result<(), DbError>;

    /// Number of records.
    async fn rnum(&self) -> Result<u64, DbError>;

    /// Approximate size in bytes.
    async fn size(&self) -> Result<u64, DbError>;

    /// The DB spec string the database was opened with.
    fn path(&self) -> String;

    /// Read/write mode.
    fn mode(&self) -> DbMode;

    /// The extension hook: engine-specific operations (list manipulation,
    /// table search, index management, ...) addressed by name.
    async fn misc(&self, name: &str, args: &[Bytes]) -> Result<Option<Vec<Bytes>>, DbError>;
}
