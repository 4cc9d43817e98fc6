//! Schema migrations for the state document.
//!
//! Documents are migrated at open time, one version step at a time. A
//! document whose version has no registered migrator cannot be opened.

use super::{Data, Result, StoreError};

/// Version written by this build of the daemon.
pub const CURRENT_DATA_VERSION: u32 = 5;

type Migrator = fn(&mut Data) -> Result<()>;

/// Migrator for each starting version. Versions below 3 predate the artifact
/// index and cannot be migrated in place.
fn migrator_for(version: u32) -> Option<Migrator> {
    match version {
        3 => Some(reject_pre_index),
        4 => Some(strip_legacy_endpoints),
        _ => None,
    }
}

fn reject_pre_index(d: &mut Data) -> Result<()> {
    Err(StoreError::MigrationFailed {
        from: d.version,
        reason: "document predates the artifact index; delete the state file and reinstall"
            .to_string(),
    })
}

fn strip_legacy_endpoints(d: &mut Data) -> Result<()> {
    // Version 4 documents carried per-network endpoint addresses that are
    // now derived from the container engine at runtime. Serde already drops
    // the unknown fields; only the version bump remains.
    let _ = d;
    Ok(())
}

/// Migrate `data` in place up to [`CURRENT_DATA_VERSION`].
pub fn run(data: &mut Data) -> Result<()> {
    if data.version > CURRENT_DATA_VERSION {
        return Err(StoreError::SchemaAhead {
            found: data.version,
            supported: CURRENT_DATA_VERSION,
        });
    }
    while data.version < CURRENT_DATA_VERSION {
        let step = migrator_for(data.version).ok_or(StoreError::NoMigrator(data.version))?;
        step(data)?;
        data.version += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_version_is_a_no_op() {
        let mut data = Data::default();
        run(&mut data).unwrap();
        assert_eq!(data.version, CURRENT_DATA_VERSION);
    }

    #[test]
    fn version_four_migrates_forward() {
        let mut data = Data {
            version: 4,
            ..Data::default()
        };
        run(&mut data).unwrap();
        assert_eq!(data.version, CURRENT_DATA_VERSION);
    }

    #[test]
    fn unknown_version_has_no_migrator() {
        let mut data = Data {
            version: 1,
            ..Data::default()
        };
        assert!(matches!(run(&mut data), Err(StoreError::NoMigrator(1))));
    }
}
