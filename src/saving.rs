use bincode::{deserialize_from, serialize_into};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

use crate::error::AppError;
use crate::store::Database;

/// File name of the snapshot inside the data directory
pub const SNAPSHOT_FILE: &str = "reportdesk.bin.gz";

/// Write the database to `path` as gzip-compressed bincode.
///
/// The snapshot is written to a temporary file in the same directory and
/// renamed over the old one, so a crash mid-write leaves the previous
/// snapshot intact.
pub fn save_database(db: &Database, path: &Path) -> Result<(), AppError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = NamedTempFile::new_in(dir)?;

    {
        let encoder = GzEncoder::new(tmp.as_file(), Compression::default());
        let mut writer = BufWriter::new(encoder);
        serialize_into(&mut writer, db)?;
        let encoder = writer
            .into_inner()
            .map_err(|e| AppError::Io(e.into_error()))?;
        let mut file = encoder.finish()?;
        file.flush()?;
    }
    tmp.as_file().sync_all()?;

    tmp.persist(path).map_err(|e| AppError::Io(e.error))?;
    Ok(())
}

/// Read a snapshot written by [`save_database`].
pub fn load_database(path: &Path) -> Result<Database, AppError> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(file);
    let mut reader = BufReader::new(decoder);

    let db: Database = deserialize_from(&mut reader)?;
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewUser;
    use chrono::Utc;

    #[test]
    fn snapshot_survives_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE);

        let mut db = Database::default();
        let user = db
            .create_user(
                NewUser {
                    username: "alice".to_string(),
                    email: "alice@example.com".to_string(),
                    full_name: "Alice".to_string(),
                    password_hash: "hash".to_string(),
                    role: Default::default(),
                },
                Utc::now(),
            )
            .unwrap();
        let report = db.create_report(user.id, "Weekly", "All good @alice", Utc::now());

        save_database(&db, &path).unwrap();
        let loaded = load_database(&path).unwrap();

        assert_eq!(loaded.user(user.id).unwrap().username, "alice");
        assert_eq!(loaded.report(report.id).unwrap().title, "Weekly");
        println!("✓ Snapshot reloaded with users and reports intact");
    }

    #[test]
    fn garbage_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE);
        std::fs::write(&path, b"not a snapshot").unwrap();

        assert!(load_database(&path).is_err());
    }
}
