//! Hint subsystem
//!
//! Hints are small key/value annotations attached to an object or to the
//! whole system. They are kept in a [`HintMap`], a fixed-capacity map from
//! `i32` key to `u64` value. There are usually only a handful of hints per
//! object, so the map is a flat array scanned linearly; insertion preserves
//! first-seen order and re-setting a key overwrites in place.
//!
//! Two kinds of hints exist:
//! * session hints, which live only while an object is open, and
//! * persistent hints, which are stored in the object's attribute record and
//!   restored on the next open.
//!
//! The kind is an attribute of the hint key (see [`hint_type`]), consulted
//! when attributes are persisted.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// Capacity of a per-object hint map.
pub const OBJ_HINT_CAPACITY: usize = 32;

/// Sentinel value meaning "hint present but carries no value".
pub const HINT_VALUE_NULL: u64 = 0;

/// What a hint applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintScope {
    Obj,
    Kvset,
    Sys,
}

/// Lifetime class of a hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintType {
    Session,
    Persistent,
}

/// Hints understood for individual objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ObjHintKey {
    /// Expected lifetime of the object (persistent).
    Lifetime = 0,
    /// Preferred pool tier for placement (session only).
    Where = 1,
    /// Access-frequency estimate driving tier selection (persistent).
    HotIndex = 2,
}

impl ObjHintKey {
    pub fn from_i32(key: i32) -> Option<ObjHintKey> {
        match key {
            0 => Some(ObjHintKey::Lifetime),
            1 => Some(ObjHintKey::Where),
            2 => Some(ObjHintKey::HotIndex),
            _ => None,
        }
    }
}

/// System-wide hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum SysHintKey {
    HotObjThreshold = 0,
    ColdObjThreshold = 1,
}

impl SysHintKey {
    pub fn from_i32(key: i32) -> Option<SysHintKey> {
        match key {
            0 => Some(SysHintKey::HotObjThreshold),
            1 => Some(SysHintKey::ColdObjThreshold),
            _ => None,
        }
    }
}

/// Lifetime class of a `(scope, key)` pair.
pub fn hint_type(scope: HintScope, key: i32) -> Result<HintType> {
    match scope {
        HintScope::Obj => match ObjHintKey::from_i32(key) {
            Some(ObjHintKey::Lifetime) => Ok(HintType::Persistent),
            Some(ObjHintKey::Where) => Ok(HintType::Session),
            Some(ObjHintKey::HotIndex) => Ok(HintType::Persistent),
            None => Err(Error::invalid(format!("unknown object hint key {}", key))),
        },
        HintScope::Sys => match SysHintKey::from_i32(key) {
            Some(_) => Ok(HintType::Session),
            None => Err(Error::invalid(format!("unknown system hint key {}", key))),
        },
        HintScope::Kvset => {
            Err(Error::invalid("key-value set hints are not defined"))
        }
    }
}

/// Human-readable name of a `(scope, key)` pair.
pub fn hint_name(scope: HintScope, key: i32) -> Result<&'static str> {
    match scope {
        HintScope::Obj => match ObjHintKey::from_i32(key) {
            Some(ObjHintKey::Lifetime) => Ok("MIO_HINT_OBJ_LIFETIME"),
            Some(ObjHintKey::Where) => Ok("MIO_HINT_OBJ_WHERE"),
            Some(ObjHintKey::HotIndex) => Ok("MIO_HINT_OBJ_HOT_INDEX"),
            None => Err(Error::invalid(format!("unknown object hint key {}", key))),
        },
        HintScope::Sys => match SysHintKey::from_i32(key) {
            Some(SysHintKey::HotObjThreshold) => Ok("MIO_HINT_HOT_OBJ_THRESHOLD"),
            Some(SysHintKey::ColdObjThreshold) => Ok("MIO_HINT_COLD_OBJ_THRESHOLD"),
            None => Err(Error::invalid(format!("unknown system hint key {}", key))),
        },
        HintScope::Kvset => {
            Err(Error::invalid("key-value set hints are not defined"))
        }
    }
}

/// Fixed-capacity ordered map from hint key to value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintMap {
    capacity: usize,
    entries: Vec<(i32, u64)>,
}

impl HintMap {
    pub fn new(capacity: usize) -> HintMap {
        HintMap { capacity, entries: Vec::new() }
    }

    /// Map with the standard per-object capacity.
    pub fn for_obj() -> HintMap {
        HintMap::new(OBJ_HINT_CAPACITY)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries currently set.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set `key` to `value`, overwriting in place if already present.
    /// Fails with `InvalidArgument` when the map is full.
    pub fn set(&mut self, key: i32, value: u64) -> Result<()> {
        for entry in self.entries.iter_mut() {
            if entry.0 == key {
                entry.1 = value;
                return Ok(());
            }
        }
        if self.entries.len() == self.capacity {
            return Err(Error::invalid("hint map is full"));
        }
        self.entries.push((key, value));
        Ok(())
    }

    pub fn get(&self, key: i32) -> Option<u64> {
        self.entries.iter().find(|e| e.0 == key).map(|e| e.1)
    }

    /// Whether `key` is present with a non-null value.
    pub fn is_set(&self, key: i32) -> bool {
        matches!(self.get(key), Some(v) if v != HINT_VALUE_NULL)
    }

    /// Merge all entries of `from` into this map. The capacity is checked
    /// up front so a failing copy leaves the map untouched.
    pub fn copy_from(&mut self, from: &HintMap) -> Result<()> {
        let nr_new = from
            .entries
            .iter()
            .filter(|(k, _)| self.get(*k).is_none())
            .count();
        if self.entries.len() + nr_new > self.capacity {
            return Err(Error::too_big("hint map overflow on copy"));
        }
        for &(key, value) in &from.entries {
            // Cannot fail: capacity checked above.
            let _ = self.set(key, value);
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, u64)> + '_ {
        self.entries.iter().copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for HintMap {
    fn default() -> Self {
        HintMap::for_obj()
    }
}

/// Subset of `hints` containing only the persistent object hints.
/// This is the pure filter used whenever attributes are persisted.
pub fn persistent_hints(hints: &HintMap) -> HintMap {
    let mut phints = HintMap::new(hints.capacity());
    for (key, value) in hints.iter() {
        if hint_type(HintScope::Obj, key) == Ok(HintType::Persistent) {
            // Same capacity as the source, cannot overflow.
            let _ = phints.set(key, value);
        }
    }
    phints
}

/// Default hotness thresholds used when the system hints are unset.
pub const DEFAULT_HOT_OBJ_THRESHOLD: u64 = 128;
pub const DEFAULT_COLD_OBJ_THRESHOLD: u64 = 16;

/// Map an object hotness to a pool index.
///
/// Pools are ordered hottest first; index 0 is the hottest tier and
/// `nr_pools - 1` the coldest. Hotness above the hot threshold selects the
/// hottest pool, below the cold threshold the coldest; the warm range in
/// between is divided into equal intervals, one per middle pool.
pub fn hotness_to_pool_idx(nr_pools: usize, sys_hints: &HintMap, hotness: u64) -> usize {
    assert!(nr_pools >= 1);

    let hot_thld = sys_hints
        .get(SysHintKey::HotObjThreshold as i32)
        .unwrap_or(DEFAULT_HOT_OBJ_THRESHOLD);
    let cold_thld = sys_hints
        .get(SysHintKey::ColdObjThreshold as i32)
        .unwrap_or(DEFAULT_COLD_OBJ_THRESHOLD);

    let cold_pool_idx = nr_pools - 1;
    if hotness > hot_thld {
        log::debug!("hotness {} -> hot pool 0", hotness);
        return 0;
    }
    if hotness < cold_thld {
        log::debug!("hotness {} -> cold pool {}", hotness, cold_pool_idx);
        return cold_pool_idx;
    }

    let warm_pool_idx = if nr_pools <= 2 {
        cold_pool_idx as i64
    } else {
        let interval =
            ((hot_thld - cold_thld) / (nr_pools as u64 - 2)).max(1);
        cold_pool_idx as i64 - ((hotness - cold_thld) / interval) as i64 - 1
    };
    let idx = warm_pool_idx.clamp(0, cold_pool_idx as i64) as usize;
    log::debug!("hotness {} -> warm pool {}", hotness, idx);
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_preserves_first_seen_order() {
        let mut map = HintMap::new(4);
        map.set(2, 20).unwrap();
        map.set(0, 1).unwrap();
        map.set(1, 10).unwrap();
        map.set(2, 21).unwrap(); // overwrite in place

        let entries: Vec<_> = map.iter().collect();
        assert_eq!(entries, vec![(2, 21), (0, 1), (1, 10)]);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_set_full_map_fails() {
        let mut map = HintMap::new(2);
        map.set(0, 1).unwrap();
        map.set(1, 2).unwrap();
        assert!(map.set(2, 3).is_err());
        // overwriting an existing key still works
        map.set(1, 5).unwrap();
        assert_eq!(map.get(1), Some(5));
    }

    #[test]
    fn test_copy_from_checks_capacity_up_front() {
        let mut to = HintMap::new(2);
        to.set(0, 1).unwrap();

        let mut from = HintMap::new(4);
        from.set(1, 10).unwrap();
        from.set(2, 20).unwrap();

        let err = to.copy_from(&from).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TooBig);
        // failed copy leaves the destination unchanged
        assert_eq!(to.len(), 1);

        let mut from_small = HintMap::new(4);
        from_small.set(0, 7).unwrap();
        from_small.set(1, 8).unwrap();
        to.copy_from(&from_small).unwrap();
        assert_eq!(to.get(0), Some(7));
        assert_eq!(to.get(1), Some(8));
    }

    #[test]
    fn test_is_set_ignores_null_value() {
        let mut map = HintMap::for_obj();
        map.set(0, HINT_VALUE_NULL).unwrap();
        map.set(1, 3).unwrap();
        assert!(!map.is_set(0));
        assert!(map.is_set(1));
        assert!(!map.is_set(9));
    }

    #[test]
    fn test_hint_tables() {
        assert_eq!(hint_type(HintScope::Obj, ObjHintKey::Lifetime as i32).unwrap(),
                   HintType::Persistent);
        assert_eq!(hint_type(HintScope::Obj, ObjHintKey::Where as i32).unwrap(),
                   HintType::Session);
        assert_eq!(hint_type(HintScope::Obj, ObjHintKey::HotIndex as i32).unwrap(),
                   HintType::Persistent);
        assert_eq!(hint_type(HintScope::Sys, SysHintKey::HotObjThreshold as i32).unwrap(),
                   HintType::Session);
        assert!(hint_type(HintScope::Obj, 99).is_err());
        assert_eq!(hint_name(HintScope::Obj, 1).unwrap(), "MIO_HINT_OBJ_WHERE");
    }

    #[test]
    fn test_persistent_filter() {
        let mut hints = HintMap::for_obj();
        hints.set(ObjHintKey::Lifetime as i32, 100).unwrap();
        hints.set(ObjHintKey::Where as i32, 0x101).unwrap();
        hints.set(ObjHintKey::HotIndex as i32, 7).unwrap();

        let phints = persistent_hints(&hints);
        let entries: Vec<_> = phints.iter().collect();
        assert_eq!(entries, vec![
            (ObjHintKey::Lifetime as i32, 100),
            (ObjHintKey::HotIndex as i32, 7),
        ]);
    }

    #[test]
    fn test_hotness_three_pools() {
        // Scenario: thresholds hot=128 cold=16, pools [hot, warm, cold].
        let sys = HintMap::for_obj();
        assert_eq!(hotness_to_pool_idx(3, &sys, 200), 0);
        assert_eq!(hotness_to_pool_idx(3, &sys, 10), 2);
        // interval = (128 - 16) / 1 = 112; 72 lands in the single warm slot
        assert_eq!(hotness_to_pool_idx(3, &sys, 72), 1);
    }

    #[test]
    fn test_hotness_boundaries_and_small_catalogs() {
        let sys = HintMap::for_obj();
        // hotness == hot threshold maps into the warm range, hottest slot
        assert_eq!(hotness_to_pool_idx(3, &sys, 128), 0);
        assert_eq!(hotness_to_pool_idx(3, &sys, 16), 1);
        // one or two pools: warm range collapses onto the coldest pool
        assert_eq!(hotness_to_pool_idx(1, &sys, 72), 0);
        assert_eq!(hotness_to_pool_idx(2, &sys, 72), 1);
        assert_eq!(hotness_to_pool_idx(2, &sys, 1000), 0);
    }

    #[test]
    fn test_hotness_respects_sys_hints() {
        let mut sys = HintMap::for_obj();
        sys.set(SysHintKey::HotObjThreshold as i32, 1000).unwrap();
        sys.set(SysHintKey::ColdObjThreshold as i32, 500).unwrap();
        assert_eq!(hotness_to_pool_idx(3, &sys, 600), 1);
        assert_eq!(hotness_to_pool_idx(3, &sys, 499), 2);
        assert_eq!(hotness_to_pool_idx(3, &sys, 1001), 0);
    }
}
