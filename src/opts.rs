use std::path::PathBuf;
use std::sync::Arc;

pub type Opts = Arc<OptsRaw>;

/// Durability policy for WAL appends.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyncMode {
    /// Never fsync from the append path; only on rotation and close.
    None,
    /// Fsync once the bytes accumulated since the last sync reach
    /// `wal_sync_bytes`.
    Batch,
    /// Fsync after every append.
    Immediate,
}

pub struct OptsRaw {
    pub wal_dir: PathBuf,
    pub sst_dir: PathBuf,
    /// Memtable size that triggers rotation.
    pub memtable_size: u64,
    /// Bound on the immutable-memtable pool.
    pub max_memtables: usize,
    /// Soft cap on total memtables, enforced by the outer layers.
    pub memtable_pool_cap: usize,
    pub wal_sync_mode: SyncMode,
    pub wal_sync_bytes: u64,
    /// Segment size that triggers WAL rotation; segments below it may be
    /// reopened for appending at startup.
    pub wal_max_size: u64,
    /// Gate for incompatible on-disk upgrades.
    pub manifest_version: u32,
    pub block_size: usize,
    pub block_restart_interval: usize,
    /// Zero disables the bloom filter on newly written tables.
    pub bloom_bits_per_key: usize,
}

pub const CURRENT_MANIFEST_VERSION: u32 = 1;

impl Default for OptsRaw {
    fn default() -> Self {
        OptsRaw {
            wal_dir: PathBuf::from("wal"),
            sst_dir: PathBuf::from("sst"),
            memtable_size: 64 * 1024 * 1024,
            max_memtables: 4,
            memtable_pool_cap: 8,
            wal_sync_mode: SyncMode::Batch,
            wal_sync_bytes: 1024 * 1024,
            wal_max_size: 64 * 1024 * 1024,
            manifest_version: CURRENT_MANIFEST_VERSION,
            block_size: 16 * 1024,
            block_restart_interval: 16,
            bloom_bits_per_key: 10,
        }
    }
}

impl OptsRaw {
    /// Options rooted under a single data directory, the common layout.
    pub fn with_base_dir(base: impl Into<PathBuf>) -> OptsRaw {
        let base = base.into();
        OptsRaw {
            wal_dir: base.join("wal"),
            sst_dir: base.join("sst"),
            ..OptsRaw::default()
        }
    }

    pub fn get_block_size(&self) -> usize {
        if self.block_size == 0 {
            16 * 1024
        } else {
            self.block_size
        }
    }

    pub fn get_block_restart_interval(&self) -> usize {
        if self.block_restart_interval == 0 {
            16
        } else {
            self.block_restart_interval
        }
    }
}

pub fn default_opts() -> Opts {
    Arc::new(OptsRaw::default())
}
