use crate::memtable::MemTable;
use crate::opts::Opts;
use crate::wal;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::info;

/// Bounds applied while rebuilding memtables from the WAL.
#[derive(Clone, Debug)]
pub struct RecoveryOptions {
    /// Entries with a sequence above this are ignored.
    pub max_sequence: u64,
    /// Hard limit on the number of memtables recovery may materialize.
    pub max_memtables: usize,
    /// Size at which the table being filled is frozen and a new one begun.
    pub memtable_size: u64,
}

impl RecoveryOptions {
    pub fn from_opts(opts: &Opts) -> RecoveryOptions {
        RecoveryOptions {
            max_sequence: u64::MAX,
            max_memtables: opts.max_memtables,
            memtable_size: opts.memtable_size,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecoveryStats {
    pub segments_replayed: usize,
    pub entries_applied: usize,
    pub entries_skipped: usize,
    pub corrupt_records: usize,
}

/// Rebuilds the memtable list from the WAL directory.
///
/// Segments replay oldest-first. When the table being filled reaches
/// `memtable_size` it is frozen and a fresh one started; exceeding
/// `max_memtables` fails recovery. Returns the tables (all but the last
/// frozen), the highest sequence number seen, and replay statistics. The
/// caller resumes the WAL at `max_seq + 1`.
pub fn recover_from_wal(
    opts: &Opts,
    ropts: &RecoveryOptions,
) -> Result<(Vec<Arc<MemTable>>, u64, RecoveryStats)> {
    let mut tables = vec![Arc::new(MemTable::new())];
    let mut max_seq = 0u64;
    let mut applied = 0usize;
    let mut skipped = 0usize;

    let replay = wal::replay_wal_dir(&opts.wal_dir, |entry| {
        if entry.seq > ropts.max_sequence {
            skipped += 1;
            return Ok(());
        }
        max_seq = max_seq.max(entry.seq);

        let needs_fresh_table = {
            let current = tables.last().expect("table list is never empty");
            current.approximate_size() >= ropts.memtable_size
        };
        if needs_fresh_table {
            // Freezing the current table puts `tables.len()` tables in the
            // immutable pool; fail only when that would exceed the cap.
            if tables.len() > ropts.max_memtables {
                return Err(Error::Recovery(format!(
                    "maximum number of memtables ({}) exceeded",
                    ropts.max_memtables
                )));
            }
            tables.last().expect("table list is never empty").set_immutable();
            tables.push(Arc::new(MemTable::new()));
        }

        tables
            .last()
            .expect("table list is never empty")
            .apply_wal_entry(entry);
        applied += 1;
        Ok(())
    })?;

    let stats = RecoveryStats {
        segments_replayed: replay.segments_replayed,
        entries_applied: applied,
        entries_skipped: skipped,
        corrupt_records: replay.corrupt_records,
    };
    info!(
        segments = stats.segments_replayed,
        entries = stats.entries_applied,
        skipped = stats.entries_skipped,
        corrupt = stats.corrupt_records,
        max_seq,
        "WAL recovery complete"
    );
    Ok((tables, max_seq, stats))
}
