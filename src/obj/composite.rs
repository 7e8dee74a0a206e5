//! Composite objects
//!
//! A composite object dispatches its byte addresses to priority-ordered
//! sub-objects, its *layers*. The layer list (the layout) lives with the
//! backend; each layer additionally owns an extent catalog describing which
//! byte ranges it covers. Extents are rows of the reserved extent KV set,
//! keyed by the 16-byte layer id followed by the big-endian extent offset —
//! big-endian so that key order is offset order and `get_extents` is a
//! plain KV iteration.
//!
//! The multi-step layer operations (delete is a fetch-mutate-store chain)
//! do not roll back on a mid-chain failure: completed steps stay applied
//! and the op reports the error.

use std::fmt;

use crate::error::Error;
use crate::kvs::KvPair;
use crate::op::{Op, OpCode, OpSubject};
use crate::util::wire;
use crate::{Mio, Result};

use super::{Obj, ObjId, OBJ_ID_LEN};

/// One layer of a composite object. Lower priority values take precedence;
/// layer lists are kept sorted with the highest-precedence layer first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompObjLayer {
    pub priority: i32,
    pub oid: ObjId,
}

/// One extent of a layer's catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjExtent {
    pub off: u64,
    pub len: u64,
}

impl fmt::Display for ObjExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.off, self.off + self.len)
    }
}

/// Extent catalog key: layer id bytes followed by the big-endian offset.
pub(crate) fn extent_key(layer_id: &ObjId, off: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(OBJ_ID_LEN + 8);
    key.extend_from_slice(layer_id.as_bytes());
    wire::put_u64_be(&mut key, off);
    key
}

/// Extent catalog value: the little-endian length.
pub(crate) fn extent_val(len: u64) -> Vec<u8> {
    let mut val = Vec::with_capacity(8);
    wire::put_u64_le(&mut val, len);
    val
}

/// Decode one extent catalog row; `None` when the pair is not an extent
/// row (wrong key or value shape).
pub(crate) fn extent_from_pair(pair: &KvPair) -> Option<(ObjId, ObjExtent)> {
    if pair.key.len() != OBJ_ID_LEN + 8 || pair.val.len() != 8 {
        return None;
    }
    let layer = ObjId::from_bytes(&pair.key[..OBJ_ID_LEN]).ok()?;
    let mut cur = &pair.key[OBJ_ID_LEN..];
    let off = wire::get_u64_be(&mut cur).ok()?;
    let mut cur = pair.val.as_slice();
    let len = wire::get_u64_le(&mut cur).ok()?;
    Some((layer, ObjExtent { off, len }))
}

impl Mio {
    /// Turn the opened object into a composite object by attaching an
    /// empty layout. Prior layouts are replaced.
    pub fn composite_obj_create(&self, obj: &Obj) -> Result<Op> {
        let mut op = obj.inner.new_op(OpCode::CompObjCreate);
        self.driver().comp_obj_create(&obj.inner, &mut op, None)?;
        Ok(op)
    }

    /// Delete a composite object: its layout, the extent catalogs of its
    /// layers, and the object itself.
    pub fn composite_obj_delete(&self, oid: &ObjId) -> Result<Op> {
        let mut op = self.new_op(OpCode::CompObjDelete, OpSubject::Obj(*oid));
        self.driver().comp_obj_delete(oid, &mut op, None)?;
        Ok(op)
    }
}

impl Obj {
    /// Add layers to this composite object. Layers replacing an existing
    /// sub-object id take over its priority slot.
    pub fn add_layers(&self, layers: Vec<CompObjLayer>) -> Result<Op> {
        if layers.is_empty() {
            return Err(Error::invalid("no layers to add"));
        }
        let mut op = self.inner.new_op(OpCode::CompObjAddLayers);
        self.inner
            .driver
            .comp_obj_add_layers(&self.inner, layers, &mut op, None)?;
        Ok(op)
    }

    /// Delete layers by sub-object id. The extents of a deleted layer are
    /// removed with it.
    pub fn del_layers(&self, layers: Vec<CompObjLayer>) -> Result<Op> {
        if layers.is_empty() {
            return Err(Error::invalid("no layers to delete"));
        }
        let mut op = self.inner.new_op(OpCode::CompObjDelLayers);
        self.inner
            .driver
            .comp_obj_del_layers(&self.inner, layers, &mut op, None)?;
        Ok(op)
    }

    /// List the layers, highest precedence first. The completed op carries
    /// the layer list in its output.
    pub fn list_layers(&self) -> Result<Op> {
        let mut op = self.inner.new_op(OpCode::CompObjListLayers);
        self.inner
            .driver
            .comp_obj_list_layers(&self.inner, &mut op, None)?;
        Ok(op)
    }

    /// Record extents of `layer_id` in its catalog.
    pub fn add_extents(&self, layer_id: &ObjId, exts: &[ObjExtent]) -> Result<Op> {
        if exts.is_empty() {
            return Err(Error::invalid("no extents to add"));
        }
        let mut op = self.inner.new_op(OpCode::CompObjAddExtents);
        self.inner.driver.comp_obj_add_extents(
            &self.inner,
            layer_id,
            exts.to_vec(),
            &mut op,
            None,
        )?;
        Ok(op)
    }

    /// Remove extents of `layer_id` from its catalog.
    pub fn del_extents(&self, layer_id: &ObjId, exts: &[ObjExtent]) -> Result<Op> {
        if exts.is_empty() {
            return Err(Error::invalid("no extents to delete"));
        }
        let mut op = self.inner.new_op(OpCode::CompObjDelExtents);
        self.inner.driver.comp_obj_del_extents(
            &self.inner,
            layer_id,
            exts.to_vec(),
            &mut op,
            None,
        )?;
        Ok(op)
    }

    /// Query up to `nr_exts` extents of `layer_id` whose offsets are at or
    /// after `offset`. The completed op carries the extents in its output.
    pub fn get_extents(
        &self,
        layer_id: &ObjId,
        offset: u64,
        nr_exts: usize,
    ) -> Result<Op> {
        let mut op = self.inner.new_op(OpCode::CompObjGetExtents);
        self.inner.driver.comp_obj_get_extents(
            &self.inner,
            layer_id,
            offset,
            nr_exts,
            &mut op,
            None,
        )?;
        Ok(op)
    }
}
