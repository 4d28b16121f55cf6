//! [`HashDb`]: an in-memory `AbstractDb` implementation backed by a
//! `HashMap`. It exists so the rest of the crate — dispatcher, protocol
//! handlers, replication — has a real, runnable storage engine to sit on
//! top of; persistent tree/hash/table file formats are out of scope.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use tt_wire::ints::{pack_double, unpack_double};

use super::{AbstractDb, DbMode, MergeFn};
use crate::error::DbError;

/// `getlist`/`putlist` batch a run of single-key ops under one `misc` call;
/// callers pass keys (and, for `putlist`, values) as alternating entries in
/// `args`.
const MISC_GETLIST: &str = "getlist";
const MISC_PUTLIST: &str = "putlist";
const MISC_OUTLIST: &str = "outlist";

struct Inner {
    map: HashMap<Bytes, Bytes>,
    /// Snapshot cursor for `iter_init`/`iter_next`: a FIFO of keys taken at
    /// `iter_init` time, so mutations during iteration can't corrupt it or
    /// cause it to loop.
    cursor: Option<VecDeque<Bytes>>,
}

pub struct HashDb {
    path: String,
    mode: DbMode,
    inner: RwLock<Inner>,
}

impl HashDb {
    pub fn new(path: impl Into<String>, mode: DbMode) -> Self {
        Self {
            path: path.into(),
            mode,
            inner: RwLock::new(Inner {
                map: HashMap::new(),
                cursor: None,
            }),
        }
    }
}

#[async_trait]
impl AbstractDb for HashDb {
    async fn put(&self, key: &[u8], val: &[u8]) -> Result<(), DbError> {
        let mut inner = self.inner.write();
        inner.map.insert(Bytes::copy_from_slice(key), Bytes::copy_from_slice(val));
        Ok(())
    }

    async fn put_keep(&self, key: &[u8], val: &[u8]) -> Result<bool, DbError> {
        let mut inner = self.inner.write();
        if inner.map.contains_key(key) {
            return Ok(false);
        }
        inner.map.insert(Bytes::copy_from_slice(key), Bytes::copy_from_slice(val));
        Ok(true)
    }

    async fn put_cat(&self, key: &[u8], val: &[u8]) -> Result<(), DbError> {
        let mut inner = self.inner.write();
        let next = match inner.map.get(key) {
            Some(existing) => {
                let mut buf = Vec::with_capacity(existing.len() + val.len());
                buf.extend_from_slice(existing);
                buf.extend_from_slice(val);
                Bytes::from(buf)
            }
            None => Bytes::copy_from_slice(val),
        };
        inner.map.insert(Bytes::copy_from_slice(key), next);
        Ok(())
    }

    async fn put_proc(&self, key: &[u8], val: &[u8], merge: MergeFn<'_>) -> Result<bool, DbError> {
        let mut inner = self.inner.write();
        let existing = inner.map.get(key).cloned();
        match merge(existing.as_deref(), val) {
            Some(next) => {
                inner.map.insert(Bytes::copy_from_slice(key), Bytes::from(next));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn out(&self, key: &[u8]) -> Result<bool, DbError> {
        let mut inner = self.inner.write();
        Ok(inner.map.remove(key).is_some())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, DbError> {
        Ok(self.inner.read().map.get(key).cloned())
    }

    async fn vsiz(&self, key: &[u8]) -> Result<i64, DbError> {
        Ok(self.inner.read().map.get(key).map(|v| v.len() as i64).unwrap_or(-1))
    }

    async fn iter_init(&self) -> Result<(), DbError> {
        let mut inner = self.inner.write();
        inner.cursor = Some(inner.map.keys().cloned().collect());
        Ok(())
    }

    async fn iter_next(&self) -> Result<Option<Bytes>, DbError> {
        let mut inner = self.inner.write();
        match inner.cursor.as_mut() {
            Some(cursor) => Ok(cursor.pop_front()),
            None => Ok(None),
        }
    }

    async fn fwm_keys(&self, prefix: &[u8], max: Option<usize>) -> Result<Vec<Bytes>, DbError> {
        let inner = self.inner.read();
        let mut out: Vec<Bytes> = inner
            .map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        out.sort();
        if let Some(max) = max {
            out.truncate(max);
        }
        Ok(out)
    }

    async fn add_int(&self, key: &[u8], delta: i32) -> Result<i32, DbError> {
        let mut inner = self.inner.write();
        let existing = inner.map.get(key).cloned();
        let base: i32 = match &existing {
            Some(v) if v.len() == 4 => i32::from_be_bytes(v[..4].try_into().unwrap()),
            Some(_) => return Err(DbError::NotInteger),
            None => 0,
        };
        let next = base.wrapping_add(delta);
        inner.map.insert(Bytes::copy_from_slice(key), Bytes::copy_from_slice(&next.to_be_bytes()));
        Ok(next)
    }

    async fn add_double(&self, key: &[u8], delta: f64) -> Result<f64, DbError> {
        let mut inner = self.inner.write();
        let existing = inner.map.get(key).cloned();
        let base: f64 = match &existing {
            Some(v) if v.len() == 16 => {
                let integral = i64::from_be_bytes(v[0..8].try_into().unwrap());
                let fractional = i64::from_be_bytes(v[8..16].try_into().unwrap());
                unpack_double(integral, fractional)
            }
            Some(_) => return Err(DbError::NotDouble),
            None => 0.0,
        };
        let next = base + delta;
        let (integral, fractional) = pack_double(next);
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&integral.to_be_bytes());
        buf.extend_from_slice(&fractional.to_be_bytes());
        inner.map.insert(Bytes::copy_from_slice(key), Bytes::from(buf));
        Ok(next)
    }

    async fn sync(&self) -> Result<(), DbError> {
        // Nothing buffered: every write already landed in `map`.
        Ok(())
    }

    async fn optimize(&self, _params: &str) -> Result<(), DbError> {
        Ok(())
    }

    async fn vanish(&self) -> Result<(), DbError> {
        let mut inner = self.inner.write();
        inner.map.clear();
        inner.cursor = None;
        Ok(())
    }

    async fn copy(&self, _path: &str) -> Result<(), DbError> {
        // An in-memory table has nothing on disk to snapshot; accepted as a
        // no-op so callers that exercise `copy` as a liveness check don't fail.
        Ok(())
    }

    async fn rnum(&self) -> Result<u64, DbError> {
        Ok(self.inner.read().map.len() as u64)
    }

    async fn size(&self) -> Result<u64, DbError> {
        let inner = self.inner.read();
        let bytes: usize = inner.map.iter().map(|(k, v)| k.len() + v.len()).sum();
        Ok(bytes as u64)
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn mode(&self) -> DbMode {
        self.mode
    }

    async fn misc(&self, name: &str, args: &[Bytes]) -> Result<Option<Vec<Bytes>>, DbError> {
        match name {
            MISC_GETLIST => {
                let mut out = Vec::with_capacity(args.len());
                let inner = self.inner.read();
                for key in args {
                    if let Some(val) = inner.map.get(key.as_ref()) {
                        out.push(key.clone());
                        out.push(val.clone());
                    }
                }
                Ok(Some(out))
            }
            MISC_PUTLIST => {
                if args.len() % 2 != 0 {
                    return Err(DbError::UnsupportedMisc {
                        name: name.to_string(),
                    });
                }
                let mut inner = self.inner.write();
                for pair in args.chunks_exact(2) {
                    inner.map.insert(pair[0].clone(), pair[1].clone());
                }
                Ok(Some(Vec::new()))
            }
            MISC_OUTLIST => {
                let mut inner = self.inner.write();
                for key in args {
                    inner.map.remove(key.as_ref());
                }
                Ok(Some(Vec::new()))
            }
            other => Err(DbError::UnsupportedMisc {
                name: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> HashDb {
        HashDb::new("*", DbMode::ReadWrite)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let db = db();
        db.put(b"k", b"v").await.unwrap();
        assert_eq!(db.get(b"k").await.unwrap().as_deref(), Some(&b"v"[..]));
        assert_eq!(db.vsiz(b"k").await.unwrap(), 1);
        assert_eq!(db.vsiz(b"missing").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn put_keep_refuses_to_overwrite() {
        let db = db();
        assert!(db.put_keep(b"k", b"1").await.unwrap());
        assert!(!db.put_keep(b"k", b"2").await.unwrap());
        assert_eq!(db.get(b"k").await.unwrap().as_deref(), Some(&b"1"[..]));
    }

    #[tokio::test]
    async fn put_cat_appends() {
        let db = db();
        db.put_cat(b"k", b"foo").await.unwrap();
        db.put_cat(b"k", b"bar").await.unwrap();
        assert_eq!(db.get(b"k").await.unwrap().as_deref(), Some(&b"foobar"[..]));
    }

    #[tokio::test]
    async fn add_int_accumulates_and_rejects_non_integer_values() {
        let db = db();
        assert_eq!(db.add_int(b"n", 5).await.unwrap(), 5);
        assert_eq!(db.add_int(b"n", -2).await.unwrap(), 3);
        db.put(b"s", b"not an int").await.unwrap();
        assert!(db.add_int(b"s", 1).await.is_err());
    }

    #[tokio::test]
    async fn iteration_snapshots_keys_at_init_time() {
        let db = db();
        db.put(b"a", b"1").await.unwrap();
        db.put(b"b", b"2").await.unwrap();
        db.iter_init().await.unwrap();
        db.put(b"c", b"3").await.unwrap();
        let mut seen = Vec::new();
        while let Some(k) = db.iter_next().await.unwrap() {
            seen.push(k);
        }
        seen.sort();
        assert_eq!(seen, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    #[tokio::test]
    async fn fwm_keys_filters_and_caps() {
        let db = db();
        db.put(b"user:1", b"x").await.unwrap();
        db.put(b"user:2", b"x").await.unwrap();
        db.put(b"group:1", b"x").await.unwrap();
        let all = db.fwm_keys(b"user:", None).await.unwrap();
        assert_eq!(all.len(), 2);
        let capped = db.fwm_keys(b"user:", Some(1)).await.unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn misc_getlist_putlist_round_trip() {
        let db = db();
        db.misc(
            MISC_PUTLIST,
            &[Bytes::from_static(b"a"), Bytes::from_static(b"1"), Bytes::from_static(b"b"), Bytes::from_static(b"2")],
        )
        .await
        .unwrap();
        let got = db
            .misc(MISC_GETLIST, &[Bytes::from_static(b"a"), Bytes::from_static(b"b")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, vec![Bytes::from_static(b"a"), Bytes::from_static(b"1"), Bytes::from_static(b"b"), Bytes::from_static(b"2")]);
    }

    #[tokio::test]
    async fn vanish_clears_everything() {
        let db = db();
        db.put(b"a", b"1").await.unwrap();
        db.vanish().await.unwrap();
        assert_eq!(db.rnum().await.unwrap(), 0);
    }
}
