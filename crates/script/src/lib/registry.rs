use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan::{ComponentId, InitArg};
use crate::utils;

/// Total order over component progress. `is_satisfied` compares with `>=`, so
/// the variants must stay declared from least to most progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Failed,
    Pending,
    Deployed,
    Linked,
    Verified,
}

/// Which confirmation a pending transaction reference belongs to, so a resumed
/// run knows where to pick the deployment back up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxPhase {
    Implementation,
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTx {
    pub phase: TxPhase,
    pub tx_hash: B256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub component: ComponentId,
    pub network: String,
    pub status: Status,
    pub proxy: Option<Address>,
    pub implementation: Option<Address>,
    pub admin: Option<Address>,
    /// Initializer arguments actually used, placeholders already resolved.
    pub init_args: Vec<InitArg>,
    /// Submitted-but-unconfirmed transaction; a later run polls this instead
    /// of resubmitting.
    pub pending_tx: Option<PendingTx>,
    pub updated_at: i64,
}

impl DeploymentRecord {
    pub fn new(component: &str, network: &str, init_args: Vec<InitArg>) -> Self {
        Self {
            component: component.to_owned(),
            network: network.to_owned(),
            status: Status::Pending,
            proxy: None,
            implementation: None,
            admin: None,
            init_args,
            pending_tx: None,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub link: String,
    pub status: Status,
    pub desired: Address,
    pub tx_hash: Option<B256>,
    pub updated_at: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    network: String,
    components: BTreeMap<ComponentId, DeploymentRecord>,
    links: BTreeMap<String, LinkRecord>,
    /// Superseded records, oldest first. Appended on every overwrite, never
    /// truncated, so past deployments stay auditable.
    history: Vec<DeploymentRecord>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read or write deployment ledger: {0}")]
    Storage(#[from] utils::Error),

    #[error("Another run holds the deployment lock for {network} at {path:?}")]
    LockHeld { network: String, path: PathBuf },

    #[error("Failed to acquire deployment lock at {path:?}: {source}")]
    LockIo {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Durable record of what has been deployed on one network. Single source of
/// truth for "has this already happened": the engine consults it before every
/// side-effecting call.
pub struct AddressRegistry {
    path: PathBuf,
    file: RegistryFile,
}

impl AddressRegistry {
    pub fn open(deployments_dir: &Path, network: &str) -> Result<Self, Error> {
        let path = deployments_dir.join(format!("{network}.json"));
        let file = if path.exists() {
            utils::read_json(&path)?
        } else {
            RegistryFile {
                network: network.to_owned(),
                ..Default::default()
            }
        };
        Ok(Self { path, file })
    }

    pub fn network(&self) -> &str {
        &self.file.network
    }

    pub fn lookup(&self, component: &str) -> Option<&DeploymentRecord> {
        self.file.components.get(component)
    }

    pub fn is_satisfied(&self, component: &str, desired: Status) -> bool {
        self.lookup(component)
            .map(|record| record.status >= desired)
            .unwrap_or(false)
    }

    /// Replaces the current record for the component, pushing the superseded
    /// one onto the history, and persists immediately.
    pub fn record(&mut self, mut record: DeploymentRecord) -> Result<(), Error> {
        record.updated_at = chrono::Utc::now().timestamp();
        if let Some(previous) = self.file.components.insert(record.component.clone(), record) {
            self.file.history.push(previous);
        }
        self.persist()
    }

    pub fn lookup_link(&self, link_id: &str) -> Option<&LinkRecord> {
        self.file.links.get(link_id)
    }

    pub fn is_link_satisfied(&self, link_id: &str, desired: Status) -> bool {
        self.lookup_link(link_id)
            .map(|record| record.status >= desired)
            .unwrap_or(false)
    }

    pub fn record_link(&mut self, link_id: &str, mut record: LinkRecord) -> Result<(), Error> {
        record.updated_at = chrono::Utc::now().timestamp();
        self.file.links.insert(link_id.to_owned(), record);
        self.persist()
    }

    pub fn history(&self) -> &[DeploymentRecord] {
        &self.file.history
    }

    fn persist(&self) -> Result<(), Error> {
        utils::write_json(&self.path, &self.file)?;
        Ok(())
    }
}

/// Run-level mutual exclusion, one lock file per network. Held for the whole
/// run; released on drop. Two concurrent runs against the same network must
/// not race on the same records, while independent networks share no state.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(deployments_dir: &Path, network: &str) -> Result<Self, Error> {
        let path = deployments_dir.join(format!("{network}.lock"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| Error::LockIo {
                path: path.clone(),
                source,
            })?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(Error::LockHeld {
                network: network.to_owned(),
                path,
            }),
            Err(source) => Err(Error::LockIo { path, source }),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove deployment lock {:?}: {err:?}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use std::sync::atomic::{AtomicU32, Ordering};

    static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    fn temp_deployments_dir() -> PathBuf {
        let seq = DIR_SEQ.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "easyswap-registry-test-{}-{seq}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("Should create temp dir");
        dir
    }

    #[test]
    fn status_total_order() {
        assert!(Status::Failed < Status::Pending);
        assert!(Status::Pending < Status::Deployed);
        assert!(Status::Deployed < Status::Linked);
        assert!(Status::Linked < Status::Verified);
    }

    #[test]
    fn is_satisfied_uses_minimum_status() {
        let dir = temp_deployments_dir();
        let mut registry = AddressRegistry::open(&dir, "testnet").expect("Should open");

        assert!(!registry.is_satisfied("vault", Status::Deployed));

        let mut record = DeploymentRecord::new("vault", "testnet", vec![]);
        record.status = Status::Linked;
        registry.record(record).expect("Should record");

        assert!(registry.is_satisfied("vault", Status::Deployed));
        assert!(registry.is_satisfied("vault", Status::Linked));
        assert!(!registry.is_satisfied("vault", Status::Verified));
    }

    #[test]
    fn records_survive_reopen_and_history_is_appended() {
        let dir = temp_deployments_dir();
        let proxy = address!("38FfF9035b68452507566612445BFf218e83D2d1");

        {
            let mut registry = AddressRegistry::open(&dir, "testnet").expect("Should open");
            let mut record = DeploymentRecord::new("vault", "testnet", vec![]);
            record.status = Status::Deployed;
            record.proxy = Some(proxy);
            registry.record(record.clone()).expect("Should record");

            record.status = Status::Verified;
            registry.record(record).expect("Should record");
        }

        let registry = AddressRegistry::open(&dir, "testnet").expect("Should reopen");
        let current = registry.lookup("vault").expect("Should be present");
        assert_eq!(current.status, Status::Verified);
        assert_eq!(current.proxy, Some(proxy));

        // First write has been superseded, not lost.
        assert_eq!(registry.history().len(), 1);
        assert_eq!(registry.history()[0].status, Status::Deployed);
    }

    #[test]
    fn networks_do_not_share_records() {
        let dir = temp_deployments_dir();

        let mut sepolia = AddressRegistry::open(&dir, "sepolia").expect("Should open");
        let mut record = DeploymentRecord::new("vault", "sepolia", vec![]);
        record.status = Status::Verified;
        sepolia.record(record).expect("Should record");

        let mainnet = AddressRegistry::open(&dir, "mainnet").expect("Should open");
        assert!(mainnet.lookup("vault").is_none());
    }

    #[test]
    fn run_lock_is_exclusive_per_network() {
        let dir = temp_deployments_dir();

        let lock = RunLock::acquire(&dir, "testnet").expect("Should acquire");
        let second = RunLock::acquire(&dir, "testnet");
        assert!(matches!(second, Err(Error::LockHeld { .. })));

        // Other networks are unaffected.
        let _other = RunLock::acquire(&dir, "othernet").expect("Should acquire");

        drop(lock);
        let _reacquired = RunLock::acquire(&dir, "testnet").expect("Should acquire after release");
    }
}
