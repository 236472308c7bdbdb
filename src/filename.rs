use crate::Result;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// The file kinds living under the engine's data directories.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FileType {
    /// WAL segment, named by its creation time in nanoseconds. The 20-digit
    /// zero-padded form makes lexicographic order equal chronological order.
    Wal(u64),
    /// SSTable, named by a monotonically increasing id.
    Table(u64),
    Lock,
}

pub(crate) fn wal_filename(dir: &Path, timestamp_ns: u64) -> PathBuf {
    dir.join(format!("{:020}.wal", timestamp_ns))
}

pub(crate) fn table_filename(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:010}.sst", id))
}

pub(crate) fn lock_filename(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

pub(crate) fn parse_filename(path: &Path) -> Option<FileType> {
    let name = path.file_name()?.to_str()?;
    if name == "LOCK" {
        return Some(FileType::Lock);
    }
    let (stem, ext) = name.rsplit_once('.')?;
    let num = stem.parse::<u64>().ok()?;
    match ext {
        "wal" => Some(FileType::Wal(num)),
        "sst" => Some(FileType::Table(num)),
        _ => None,
    }
}

pub(crate) fn now_unix_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// WAL segments in `dir`, oldest first. A missing directory is treated as
/// empty so recovery on a fresh database is a no-op.
pub(crate) fn sorted_wal_files(dir: &Path) -> Result<Vec<PathBuf>> {
    sorted_files_of(dir, |t| matches!(t, FileType::Wal(_)))
}

/// SSTables in `dir`, oldest first (ascending id).
pub(crate) fn sorted_table_files(dir: &Path) -> Result<Vec<PathBuf>> {
    sorted_files_of(dir, |t| matches!(t, FileType::Table(_)))
}

fn sorted_files_of(dir: &Path, keep: impl Fn(&FileType) -> bool) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(t) = parse_filename(&path) {
            if keep(&t) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_wal_name_roundtrip() {
        let p = wal_filename(Path::new("/data/wal"), 1_700_000_000_123_456_789);
        assert_eq!(
            p,
            PathBuf::from("/data/wal/01700000000123456789.wal")
        );
        assert_eq!(
            parse_filename(&p),
            Some(FileType::Wal(1_700_000_000_123_456_789))
        );
    }

    #[test]
    fn test_table_name_roundtrip() {
        let p = table_filename(Path::new("/data/sst"), 42);
        assert_eq!(p, PathBuf::from("/data/sst/0000000042.sst"));
        assert_eq!(parse_filename(&p), Some(FileType::Table(42)));
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        assert_eq!(parse_filename(Path::new("/d/CURRENT")), None);
        assert_eq!(parse_filename(Path::new("/d/000001.tmp")), None);
        assert_eq!(parse_filename(Path::new("/d/abc.wal")), None);
        assert_eq!(parse_filename(Path::new("/d/LOCK")), Some(FileType::Lock));
    }

    #[test]
    fn test_listing_sorts_chronologically() {
        let dir = tempfile::tempdir().unwrap();
        for ts in [30u64, 10, 20] {
            std::fs::write(wal_filename(dir.path(), ts), b"x").unwrap();
        }
        std::fs::write(dir.path().join("stray.txt"), b"x").unwrap();
        let files = sorted_wal_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| parse_filename(p).unwrap())
            .collect();
        assert_eq!(
            names,
            vec![FileType::Wal(10), FileType::Wal(20), FileType::Wal(30)]
        );
    }

    #[test]
    fn test_missing_dir_is_empty() {
        assert!(sorted_wal_files(Path::new("/nonexistent/strata-test")).unwrap().is_empty());
    }
}
