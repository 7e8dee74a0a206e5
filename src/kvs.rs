//! Key-value set façade
//!
//! Thin pass-through over the driver's KV operations. Batches carry a
//! per-pair status array: the op-level result is negative only when the
//! whole request could not be processed (unknown set, unsupported driver),
//! while individual lookups report `NotFound`, exhausted iterations report
//! `EndOfIteration`, and so on, per entry.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::{Error, ErrorKind};
use crate::op::{Op, OpCode, OpOutput, OpSubject, PostProc, Progress};
use crate::{Mio, Result};

pub const KVS_ID_LEN: usize = 16;

/// Key-value set identifier: 16 bytes, two big-endian u64 words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KvsId([u8; KVS_ID_LEN]);

impl KvsId {
    pub const fn from_hi_lo(hi: u64, lo: u64) -> KvsId {
        let h = hi.to_be_bytes();
        let l = lo.to_be_bytes();
        let mut bytes = [0u8; KVS_ID_LEN];
        let mut i = 0;
        while i < 8 {
            bytes[i] = h[i];
            bytes[i + 8] = l[i];
            i += 1;
        }
        KvsId(bytes)
    }

    pub fn hi_lo(&self) -> (u64, u64) {
        let hi = u64::from_be_bytes(self.0[..8].try_into().expect("8 bytes"));
        let lo = u64::from_be_bytes(self.0[8..].try_into().expect("8 bytes"));
        (hi, lo)
    }

    pub fn as_bytes(&self) -> &[u8; KVS_ID_LEN] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<KvsId> {
        let arr: [u8; KVS_ID_LEN] = bytes
            .try_into()
            .map_err(|_| Error::invalid("kvs id must be 16 bytes"))?;
        Ok(KvsId(arr))
    }
}

impl fmt::Display for KvsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (hi, lo) = self.hi_lo();
        write!(f, "{:x}:{:x}", hi, lo)
    }
}

/// Reserved set holding encoded object attributes, keyed by object id.
pub const OBJ_MD_KVS_ID: KvsId = KvsId::from_hi_lo(0, 0x10);

/// Reserved set holding composite extent catalogs.
pub const COMP_EXTENT_KVS_ID: KvsId = KvsId::from_hi_lo(0, 0x11);

/// Per-pair status: `Ok(())` or the error kind for that entry.
pub type PairRc = std::result::Result<(), ErrorKind>;

/// One key-value record. Keys and values are free-form byte strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub val: Vec<u8>,
}

impl KvPair {
    pub fn new(key: impl Into<Vec<u8>>, val: impl Into<Vec<u8>>) -> KvPair {
        KvPair { key: key.into(), val: val.into() }
    }

    /// A key-only pair, for GET/DEL/NEXT requests.
    pub fn key_only(key: impl Into<Vec<u8>>) -> KvPair {
        KvPair { key: key.into(), val: Vec::new() }
    }
}

/// A batch of pairs travelling through one KV op, with per-pair statuses.
#[derive(Debug, Default)]
pub struct KvsBatch {
    pub pairs: Vec<KvPair>,
    pub rcs: Vec<PairRc>,
}

impl KvsBatch {
    pub fn new(pairs: Vec<KvPair>) -> KvsBatch {
        let rcs = vec![Ok(()); pairs.len()];
        KvsBatch { pairs, rcs }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Post-processor moving the finished batch into the op output.
pub(crate) fn batch_output_post(batch: Arc<Mutex<KvsBatch>>) -> PostProc {
    Box::new(move |op: &mut Op| {
        let mut guard = batch.lock().expect("kvs batch poisoned");
        let taken = KvsBatch {
            pairs: std::mem::take(&mut guard.pairs),
            rcs: std::mem::take(&mut guard.rcs),
        };
        drop(guard);
        op.output = OpOutput::Kvs(taken);
        Ok(Progress::Final)
    })
}

impl Mio {
    fn kvs_op(&self, opcode: OpCode, kvs_id: &KvsId) -> Op {
        self.new_op(opcode, OpSubject::Kvs(*kvs_id))
    }

    /// Create a key-value set.
    pub fn kvs_create_set(&self, kvs_id: &KvsId) -> Result<Op> {
        let mut op = self.kvs_op(OpCode::KvsCreateSet, kvs_id);
        self.driver().kvs_create_set(kvs_id, &mut op, None)?;
        Ok(op)
    }

    /// Destroy a key-value set and everything in it.
    pub fn kvs_del_set(&self, kvs_id: &KvsId) -> Result<Op> {
        let mut op = self.kvs_op(OpCode::KvsDeleteSet, kvs_id);
        self.driver().kvs_del_set(kvs_id, &mut op, None)?;
        Ok(op)
    }

    /// Look up the values for the batch keys. The completed op's KV output
    /// holds the filled pairs and per-pair statuses.
    pub fn kvs_get(&self, kvs_id: &KvsId, pairs: Vec<KvPair>) -> Result<Op> {
        if pairs.is_empty() {
            return Err(Error::invalid("at least one key must be given"));
        }
        let batch = Arc::new(Mutex::new(KvsBatch::new(pairs)));
        let mut op = self.kvs_op(OpCode::KvsGet, kvs_id);
        let post = batch_output_post(batch.clone());
        self.driver().kvs_get(kvs_id, batch, &mut op, Some(post))?;
        Ok(op)
    }

    /// Insert or overwrite the batch pairs.
    pub fn kvs_put(&self, kvs_id: &KvsId, pairs: Vec<KvPair>) -> Result<Op> {
        if pairs.is_empty() {
            return Err(Error::invalid("at least one pair must be given"));
        }
        let batch = Arc::new(Mutex::new(KvsBatch::new(pairs)));
        let mut op = self.kvs_op(OpCode::KvsPut, kvs_id);
        let post = batch_output_post(batch.clone());
        self.driver().kvs_put(kvs_id, batch, &mut op, Some(post))?;
        Ok(op)
    }

    /// Delete the records named by the batch keys.
    pub fn kvs_del(&self, kvs_id: &KvsId, pairs: Vec<KvPair>) -> Result<Op> {
        if pairs.is_empty() {
            return Err(Error::invalid("at least one key must be given"));
        }
        let batch = Arc::new(Mutex::new(KvsBatch::new(pairs)));
        let mut op = self.kvs_op(OpCode::KvsDel, kvs_id);
        let post = batch_output_post(batch.clone());
        self.driver().kvs_del(kvs_id, batch, &mut op, Some(post))?;
        Ok(op)
    }

    /// Fetch up to `nr_pairs` records in key order, starting at `start_key`
    /// (the smallest key when `None`). With `exclude_start_key`, iteration
    /// begins right after the starting key. Slots past the end of the set
    /// come back with `EndOfIteration`.
    pub fn kvs_next(
        &self,
        kvs_id: &KvsId,
        start_key: Option<Vec<u8>>,
        nr_pairs: usize,
        exclude_start_key: bool,
    ) -> Result<Op> {
        if nr_pairs == 0 {
            return Err(Error::invalid("at least one pair must be requested"));
        }
        let mut pairs = vec![KvPair::default(); nr_pairs];
        if let Some(key) = start_key {
            pairs[0].key = key;
        }
        let batch = Arc::new(Mutex::new(KvsBatch::new(pairs)));
        let mut op = self.kvs_op(OpCode::KvsNext, kvs_id);
        let post = batch_output_post(batch.clone());
        self.driver()
            .kvs_next(kvs_id, batch, exclude_start_key, &mut op, Some(post))?;
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::op::OpState;

    fn kv(i: u32) -> KvPair {
        KvPair::new(format!("k{}", i).into_bytes(), format!("v{}", i).into_bytes())
    }

    fn test_mio() -> Mio {
        Mio::init(Config::mem_test_config()).unwrap()
    }

    #[test]
    fn test_kvs_id_words() {
        let id = KvsId::from_hi_lo(0x0102030405060708, 0x1112131415161718);
        assert_eq!(id.hi_lo(), (0x0102030405060708, 0x1112131415161718));
        assert_eq!(id.as_bytes()[0], 0x01);
        assert_eq!(id.as_bytes()[8], 0x11);
        assert_eq!(KvsId::from_bytes(id.as_bytes()).unwrap(), id);
        assert!(KvsId::from_bytes(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_put_get_roundtrip() {
        let mio = test_mio();
        let id = KvsId::from_hi_lo(1, 1);
        mio.kvs_create_set(&id).unwrap().wait(None).unwrap();

        let mut op = mio.kvs_put(&id, vec![kv(0), kv(1)]).unwrap();
        op.wait(None).unwrap();
        let out = op.take_kvs_output().unwrap();
        assert!(out.rcs.iter().all(|rc| rc.is_ok()));

        let mut op = mio
            .kvs_get(&id, vec![KvPair::key_only(b"k1".to_vec()),
                               KvPair::key_only(b"k9".to_vec())])
            .unwrap();
        op.wait(None).unwrap();
        let out = op.take_kvs_output().unwrap();
        assert_eq!(out.pairs[0].val, b"v1");
        assert_eq!(out.rcs[0], Ok(()));
        assert_eq!(out.rcs[1], Err(ErrorKind::NotFound));
    }

    #[test]
    fn test_del_reports_per_pair_status() {
        let mio = test_mio();
        let id = KvsId::from_hi_lo(1, 2);
        mio.kvs_create_set(&id).unwrap().wait(None).unwrap();
        mio.kvs_put(&id, vec![kv(0)]).unwrap().wait(None).unwrap();

        let mut op = mio
            .kvs_del(&id, vec![KvPair::key_only(b"k0".to_vec()),
                               KvPair::key_only(b"k5".to_vec())])
            .unwrap();
        op.wait(None).unwrap();
        let out = op.take_kvs_output().unwrap();
        assert_eq!(out.rcs[0], Ok(()));
        assert_eq!(out.rcs[1], Err(ErrorKind::NotFound));

        // k0 is really gone
        let mut op = mio
            .kvs_get(&id, vec![KvPair::key_only(b"k0".to_vec())])
            .unwrap();
        op.wait(None).unwrap();
        let out = op.take_kvs_output().unwrap();
        assert_eq!(out.rcs[0], Err(ErrorKind::NotFound));
    }

    #[test]
    fn test_next_with_eof() {
        let mio = test_mio();
        let id = KvsId::from_hi_lo(1, 3);
        mio.kvs_create_set(&id).unwrap().wait(None).unwrap();
        // k0..k4, inserted out of order
        let pairs = vec![kv(3), kv(0), kv(4), kv(2), kv(1)];
        mio.kvs_put(&id, pairs).unwrap().wait(None).unwrap();

        let mut op = mio
            .kvs_next(&id, Some(b"k3".to_vec()), 5, true)
            .unwrap();
        op.wait(None).unwrap();
        assert_eq!(op.state(), OpState::Completed);
        let out = op.take_kvs_output().unwrap();
        assert_eq!(out.pairs[0].key, b"k4");
        assert_eq!(out.pairs[0].val, b"v4");
        assert_eq!(out.rcs[0], Ok(()));
        for rc in &out.rcs[1..] {
            assert_eq!(*rc, Err(ErrorKind::EndOfIteration));
        }
    }

    #[test]
    fn test_next_from_start_inclusive() {
        let mio = test_mio();
        let id = KvsId::from_hi_lo(1, 4);
        mio.kvs_create_set(&id).unwrap().wait(None).unwrap();
        mio.kvs_put(&id, vec![kv(0), kv(1), kv(2)]).unwrap().wait(None).unwrap();

        let mut op = mio.kvs_next(&id, None, 2, false).unwrap();
        op.wait(None).unwrap();
        let out = op.take_kvs_output().unwrap();
        assert_eq!(out.pairs[0].key, b"k0");
        assert_eq!(out.pairs[1].key, b"k1");
        assert!(out.rcs.iter().all(|rc| rc.is_ok()));
    }

    #[test]
    fn test_ops_on_missing_set_fail() {
        let mio = test_mio();
        let id = KvsId::from_hi_lo(9, 9);
        let mut op = mio
            .kvs_get(&id, vec![KvPair::key_only(b"k".to_vec())])
            .unwrap();
        let err = op.wait(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(op.state(), OpState::Failed);
    }

    #[test]
    fn test_create_existing_set_fails() {
        let mio = test_mio();
        let id = KvsId::from_hi_lo(2, 1);
        mio.kvs_create_set(&id).unwrap().wait(None).unwrap();
        let err = mio.kvs_create_set(&id).unwrap().wait(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_del_set_removes_contents() {
        let mio = test_mio();
        let id = KvsId::from_hi_lo(2, 2);
        mio.kvs_create_set(&id).unwrap().wait(None).unwrap();
        mio.kvs_put(&id, vec![kv(1)]).unwrap().wait(None).unwrap();
        mio.kvs_del_set(&id).unwrap().wait(None).unwrap();

        let err = mio
            .kvs_get(&id, vec![KvPair::key_only(b"k1".to_vec())])
            .unwrap()
            .wait(None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
