//! Engine session over the JSON state file

use anyhow::{Context as _, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hms_billing::{BillingConfig, BillingPlatform, InMemoryBillingStore, RandomIds, StoreSnapshot, SystemClock};

/// Loaded state plus an exclusive lock on it.
///
/// The lock is taken before the state is read and released when the session
/// drops, so concurrent invocations serialize their read-modify-write cycles.
pub struct Session {
    pub platform: BillingPlatform,
    store: Arc<InMemoryBillingStore>,
    path: PathBuf,
    _lock: File,
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Block until this process owns the state file
fn acquire_lock(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let lock_path = lock_path(path);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("opening lock {}", lock_path.display()))?;
    if file.try_lock_exclusive().is_err() {
        tracing::info!(path = %path.display(), "state file busy, waiting for lock");
        file.lock_exclusive()
            .with_context(|| format!("locking {}", lock_path.display()))?;
    }
    Ok(file)
}

impl Session {
    /// Lock and load the state file (a missing file is an empty store)
    pub fn open(path: &Path, config: BillingConfig) -> Result<Self> {
        let lock = acquire_lock(path)?;
        let store = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("reading state {}", path.display()))?;
            let snapshot: StoreSnapshot = serde_json::from_str(&content)
                .with_context(|| format!("parsing state {}", path.display()))?;
            let store = InMemoryBillingStore::from_snapshot(snapshot)
                .with_context(|| format!("loading state {}", path.display()))?;
            Arc::new(store)
        } else {
            tracing::debug!(path = %path.display(), "no state file, starting empty");
            Arc::new(InMemoryBillingStore::new())
        };

        let platform = BillingPlatform::new(store.clone(), Arc::new(SystemClock), Arc::new(RandomIds), config)?;
        Ok(Self { platform, store, path: path.to_path_buf(), _lock: lock })
    }

    /// Write the state back through a temp file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&self.store.snapshot())?)?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("writing state {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hms_billing::{BillingStore, Tenant};
    use uuid::Uuid;

    #[test]
    fn test_state_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("hms-billing-{}", Uuid::new_v4()));
        let path = dir.join("state.json");

        let session = Session::open(&path, BillingConfig::default()).unwrap();
        let tenant = session.platform.catalog
            .register_tenant(Tenant { id: Uuid::new_v4(), name: "Lakeside".into() })
            .unwrap();
        session.save().unwrap();
        drop(session);

        let reopened = Session::open(&path, BillingConfig::default()).unwrap();
        assert!(reopened.platform.store().get_tenant(&tenant.id).unwrap().is_some());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_sessions_serialize_writes() {
        let dir = std::env::temp_dir().join(format!("hms-billing-{}", Uuid::new_v4()));
        let path = dir.join("state.json");
        Session::open(&path, BillingConfig::default()).unwrap().save().unwrap();

        // every writer re-reads under the lock, so no registration is lost
        std::thread::scope(|s| {
            for i in 0..4 {
                let path = &path;
                s.spawn(move || {
                    let session = Session::open(path, BillingConfig::default()).unwrap();
                    session.platform.catalog
                        .register_tenant(Tenant { id: Uuid::new_v4(), name: format!("Clinic {}", i) })
                        .unwrap();
                    session.save().unwrap();
                });
            }
        });

        let session = Session::open(&path, BillingConfig::default()).unwrap();
        assert_eq!(session.store.snapshot().tenants.len(), 4);
        drop(session);
        fs::remove_dir_all(dir).unwrap();
    }
}
