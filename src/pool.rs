//! Pool catalog
//!
//! A pool is one storage tier of the backend: a fixed device geometry with
//! preferred IO sizes derived from it. The process-wide [`Pools`] registry is
//! built once at [`crate::Mio::init`] from the configured catalog, with the
//! driver filling in the performance parameters, and is immutable afterwards;
//! pool indices handed out by the registry stay valid for the process
//! lifetime.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::PoolConfig;
use crate::error::Error;
use crate::Result;

pub const POOL_MAX_NAME_LEN: usize = 32;
pub const POOL_MAX_NR_OPT_BLKSIZES: usize = 16;

/// Well-known tier pool ids (low word; high word zero), usable as `Where`
/// hint values.
pub const POOL_GOLD: u64 = 0x100;
pub const POOL_SILVER: u64 = 0x101;
pub const POOL_BRONZE: u64 = 0x102;

/// Pool identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolId {
    pub hi: u64,
    pub lo: u64,
}

impl PoolId {
    pub fn new(hi: u64, lo: u64) -> PoolId {
        PoolId { hi, lo }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.hi, self.lo)
    }
}

/// Media class of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    Nvm,
    Ssd,
    #[default]
    Hdd,
}

/// Descriptor of one pool.
#[derive(Debug, Clone)]
pub struct Pool {
    pub name: String,
    pub id: PoolId,
    pub pool_type: PoolType,
    /// Raw capacity of the tier, not kept current.
    pub capacity: u64,
    /// Optimised data buffer alignment; also the backend page size for
    /// objects placed in this pool.
    pub opt_alignment: usize,
    /// Preferred block sizes in decreasing order of performance.
    pub opt_blksizes: Vec<u64>,
    /// Upper bound on the bytes one backend RW op may carry.
    pub max_per_op: u64,
}

/// Derive the per-op IO bound and the optimal block sizes from an erasure
/// geometry of `unit`-sized data units, N data + K parity units per group
/// and P devices. The bound is `unit * 2 * P * N / (N + 2K)` rounded up to
/// the group size; block sizes are the multiples of the rounded increment
/// below the bound.
pub(crate) fn derive_opt_blksizes(
    unit: u64,
    n_data: u64,
    n_parity: u64,
    n_devices: u64,
) -> (Vec<u64>, u64) {
    let grp_size = unit * n_data;
    let mut max_blksize =
        unit * 2 * n_devices * n_data / (n_data + 2 * n_parity);
    max_blksize = max_blksize.div_ceil(grp_size) * grp_size;

    let nr = (max_blksize / grp_size).min(POOL_MAX_NR_OPT_BLKSIZES as u64).max(1);
    let incr = (max_blksize / nr).div_ceil(grp_size) * grp_size;

    let mut blksizes = Vec::new();
    let mut blksize = incr;
    while blksize < max_blksize {
        blksizes.push(blksize);
        blksize += incr;
    }
    (blksizes, max_blksize)
}

/// The immutable pool registry.
#[derive(Debug)]
pub struct Pools {
    pools: Vec<Pool>,
    default_idx: usize,
}

impl Pools {
    /// Build the registry from configured pools already filled in by the
    /// driver (see [`crate::driver::Driver::pool_get`]).
    pub(crate) fn new(pools: Vec<Pool>, default_name: Option<&str>) -> Result<Pools> {
        if pools.is_empty() {
            return Err(Error::invalid("pool registry cannot be empty"));
        }
        let default_idx = match default_name {
            Some(name) => pools
                .iter()
                .position(|p| p.name == name)
                .ok_or_else(|| {
                    Error::invalid(format!("default pool '{}' not found", name))
                })?,
            None => 0,
        };
        Ok(Pools { pools, default_idx })
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pool> {
        self.pools.iter()
    }

    pub fn by_idx(&self, idx: usize) -> Option<&Pool> {
        self.pools.get(idx)
    }

    pub fn by_id(&self, id: &PoolId) -> Option<&Pool> {
        self.pools.iter().find(|p| &p.id == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Pool> {
        self.pools.iter().find(|p| p.name == name)
    }

    pub fn index_of(&self, id: &PoolId) -> Option<usize> {
        self.pools.iter().position(|p| &p.id == id)
    }

    pub fn default_idx(&self) -> usize {
        self.default_idx
    }

    pub fn default_pool(&self) -> &Pool {
        &self.pools[self.default_idx]
    }
}

/// Skeleton pool from configuration, before the driver fills in the
/// performance parameters.
pub(crate) fn pool_from_config(config: &PoolConfig) -> Pool {
    Pool {
        name: config.name.clone(),
        id: config.id(),
        pool_type: config.pool_type,
        capacity: config.capacity,
        opt_alignment: 0,
        opt_blksizes: Vec::new(),
        max_per_op: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_simple_geometry() {
        // unit 4K, N=1, K=0, P=4: bound = 4K * 2 * 4 = 32K, group 4K.
        let (blksizes, max) = derive_opt_blksizes(4096, 1, 0, 4);
        assert_eq!(max, 32768);
        assert_eq!(blksizes, vec![4096, 8192, 12288, 16384, 20480, 24576, 28672]);
        assert!(blksizes.len() <= POOL_MAX_NR_OPT_BLKSIZES);
    }

    #[test]
    fn test_derive_parity_geometry_rounds_to_group() {
        // unit 4K, N=2, K=1, P=8: raw bound = 4K*2*8*2/(2+2) = 32K,
        // group 8K, already aligned.
        let (blksizes, max) = derive_opt_blksizes(4096, 2, 1, 8);
        assert_eq!(max % (4096 * 2), 0);
        assert_eq!(max, 32768);
        assert!(blksizes.iter().all(|b| b % (4096 * 2) == 0));
        assert!(blksizes.iter().all(|&b| b < max));
    }

    #[test]
    fn test_derive_wide_pool_caps_blksize_count() {
        let (blksizes, max) = derive_opt_blksizes(4096, 1, 0, 64);
        assert_eq!(max, 4096 * 128);
        assert!(blksizes.len() <= POOL_MAX_NR_OPT_BLKSIZES);
        assert!(!blksizes.is_empty());
    }

    fn test_pool(name: &str, lo: u64) -> Pool {
        Pool {
            name: name.to_string(),
            id: PoolId::new(0, lo),
            pool_type: PoolType::Ssd,
            capacity: 0,
            opt_alignment: 4096,
            opt_blksizes: vec![4096],
            max_per_op: 32768,
        }
    }

    #[test]
    fn test_registry_lookup_and_default() {
        let pools = Pools::new(
            vec![test_pool("gold", POOL_GOLD), test_pool("silver", POOL_SILVER)],
            Some("silver"),
        )
        .unwrap();
        assert_eq!(pools.len(), 2);
        assert_eq!(pools.default_idx(), 1);
        assert_eq!(pools.default_pool().name, "silver");
        assert_eq!(pools.index_of(&PoolId::new(0, POOL_GOLD)), Some(0));
        assert!(pools.by_id(&PoolId::new(1, 1)).is_none());
        assert_eq!(pools.by_name("gold").unwrap().id.lo, POOL_GOLD);
    }

    #[test]
    fn test_registry_unknown_default_fails() {
        let err = Pools::new(vec![test_pool("gold", POOL_GOLD)], Some("zinc"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }
}
