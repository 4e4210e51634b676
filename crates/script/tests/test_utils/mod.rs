#![allow(dead_code)]
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{keccak256, Address, B256};

use easyswap_deploy_scripts::artifacts::ArtifactStore;
use easyswap_deploy_scripts::engine::{ExecutionEngine, RunReport};
use easyswap_deploy_scripts::eth_client::{abi, BackendError, ExecutionBackend, StateQuery, TxPayload, TxReceipt};
use easyswap_deploy_scripts::linker::Linker;
use easyswap_deploy_scripts::plan::{self, build_plan};
use easyswap_deploy_scripts::registry::AddressRegistry;
use easyswap_deploy_scripts::scripts::prelude::DeploySettings;
use easyswap_deploy_scripts::{consts::erc1967, deployer::ProxyDeployer};

pub const NETWORK: &str = "testnet";
pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(5);

pub const SIGNER: Address = Address::new([0x11; 20]);

// Fake creation bytecode; distinct prefixes let the mock (and assertions) tell
// the artifacts apart.
pub const VAULT_CODE: &[u8] = &[0x60, 0x80, 0x60, 0x40, 0xaa, 0x01];
pub const ORDER_BOOK_CODE: &[u8] = &[0x60, 0x80, 0x60, 0x40, 0xaa, 0x02];
pub const PROXY_CODE: &[u8] = &[0x60, 0x80, 0x60, 0x40, 0xbb, 0x01];

#[derive(Debug, Clone, Default)]
struct ContractState {
    /// Raw storage, keyed by slot. Holds the ERC-1967 words for proxies.
    storage: HashMap<B256, [u8; 32]>,
    /// View-call results, keyed by 4-byte selector.
    views: HashMap<[u8; 4], [u8; 32]>,
}

/// Effect a transaction will have once "mined". Computed at submission,
/// applied when the receipt is first delivered, so unconfirmed transactions
/// stay invisible to reads the way they would on a real chain.
#[derive(Debug, Clone)]
enum TxEffect {
    /// Plain contract creation.
    Create { address: Address },
    /// Proxy creation: instantiate at `address`, point the ERC-1967 slots at
    /// the decoded implementation and a freshly allocated admin.
    CreateProxy {
        address: Address,
        implementation: Address,
        admin: Address,
    },
    /// Setter call: store the address argument under the paired getter.
    Set {
        to: Address,
        getter: [u8; 4],
        value: Address,
    },
}

#[derive(Debug, Clone)]
struct MockTx {
    effect: TxEffect,
    applied: bool,
    /// Mines with `success == false`; the effect never applies.
    mined_revert: bool,
}

#[derive(Debug, Default)]
struct MockState {
    next_address: u64,
    contracts: HashMap<Address, ContractState>,
    txs: HashMap<B256, MockTx>,
    /// Every payload ever submitted, in order.
    submissions: Vec<TxPayload>,
    reads: usize,
    /// Payload substrings whose submissions revert at preflight.
    revert_markers: Vec<Vec<u8>>,
    /// Payload substrings whose transactions are accepted but mine reverted.
    mine_revert_markers: Vec<Vec<u8>>,
    /// Payload substrings whose receipts never arrive (until released).
    hold_markers: Vec<Vec<u8>>,
    held: HashSet<B256>,
    /// set selector -> paired getter selector.
    setters: HashMap<[u8; 4], [u8; 4]>,
}

impl MockState {
    fn allocate_address(&mut self) -> Address {
        self.next_address += 1;
        let mut bytes = [0u8; 20];
        bytes[12..20].copy_from_slice(&self.next_address.to_be_bytes());
        Address::new(bytes)
    }
}

/// In-memory stand-in for an execution layer node. Transactions take effect
/// when their receipt is first delivered; holds and reverts are injected per
/// payload marker to exercise the resume and failure paths.
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        let backend = Self {
            state: Mutex::new(MockState::default()),
        };
        backend.register_setter("setOrderBook(address)", "orderBook()");
        backend
    }

    pub fn register_setter(&self, set_signature: &str, get_signature: &str) {
        let mut state = self.state.lock().expect("mock state lock");
        state
            .setters
            .insert(abi::selector(set_signature), abi::selector(get_signature));
    }

    /// Submissions whose payload contains `marker` revert at preflight.
    pub fn revert_matching(&self, marker: &[u8]) {
        let mut state = self.state.lock().expect("mock state lock");
        state.revert_markers.push(marker.to_vec());
    }

    pub fn clear_reverts(&self) {
        let mut state = self.state.lock().expect("mock state lock");
        state.revert_markers.clear();
    }

    /// Submissions whose payload contains `marker` are accepted but mine with
    /// a failed receipt, the way an on-chain revert looks after inclusion.
    pub fn mine_revert_matching(&self, marker: &[u8]) {
        let mut state = self.state.lock().expect("mock state lock");
        state.mine_revert_markers.push(marker.to_vec());
    }

    pub fn clear_mined_reverts(&self) {
        let mut state = self.state.lock().expect("mock state lock");
        state.mine_revert_markers.clear();
    }

    /// Receipts for submissions whose payload contains `marker` never arrive,
    /// so waiting on them times out.
    pub fn hold_matching(&self, marker: &[u8]) {
        let mut state = self.state.lock().expect("mock state lock");
        state.hold_markers.push(marker.to_vec());
    }

    /// Held transactions become confirmable; new submissions are not held.
    pub fn release_all(&self) {
        let mut state = self.state.lock().expect("mock state lock");
        state.hold_markers.clear();
        state.held.clear();
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().expect("mock state lock").submissions.len()
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().expect("mock state lock").reads
    }

    /// How many creation payloads were submitted whose code contains `marker`.
    pub fn creations_matching(&self, marker: &[u8]) -> usize {
        let state = self.state.lock().expect("mock state lock");
        state
            .submissions
            .iter()
            .filter(|payload| payload.to.is_none() && contains(&payload.data, marker))
            .count()
    }

    /// Directly sets what a view call on `contract` returns, bypassing any
    /// transaction. For staging pre-existing chain state.
    pub fn set_view_result(&self, contract: Address, get_signature: &str, value: Address) {
        let mut state = self.state.lock().expect("mock state lock");
        let views = &mut state.contracts.entry(contract).or_default().views;
        views.insert(abi::selector(get_signature), address_word(value));
    }

    fn effect_for(state: &mut MockState, payload: &TxPayload) -> Result<TxEffect, BackendError> {
        match payload.to {
            None => {
                let address = state.allocate_address();
                if payload.data.starts_with(PROXY_CODE) {
                    let tail = &payload.data[PROXY_CODE.len()..];
                    let constructor = DynSolType::Tuple(vec![
                        DynSolType::Address,
                        DynSolType::Address,
                        DynSolType::Bytes,
                    ]);
                    let decoded = constructor
                        .abi_decode_params(tail)
                        .map_err(|err| BackendError::Reverted(format!("bad proxy constructor args: {err}")))?;
                    let implementation = match decoded {
                        DynSolValue::Tuple(values) => match values.first() {
                            Some(DynSolValue::Address(implementation)) => *implementation,
                            _ => return Err(BackendError::Reverted("bad proxy constructor args".to_owned())),
                        },
                        _ => return Err(BackendError::Reverted("bad proxy constructor args".to_owned())),
                    };
                    let admin = state.allocate_address();
                    Ok(TxEffect::CreateProxy {
                        address,
                        implementation,
                        admin,
                    })
                } else {
                    Ok(TxEffect::Create { address })
                }
            }
            Some(to) => {
                if payload.data.len() < 4 {
                    return Err(BackendError::Reverted("calldata too short".to_owned()));
                }
                let selector = [payload.data[0], payload.data[1], payload.data[2], payload.data[3]];
                let getter = state
                    .setters
                    .get(&selector)
                    .copied()
                    .ok_or_else(|| BackendError::Reverted(format!("unknown selector {}", hex::encode(selector))))?;
                let value = abi::decode_address_word(&payload.data[4..])
                    .ok_or_else(|| BackendError::Reverted("malformed setter argument".to_owned()))?;
                Ok(TxEffect::Set { to, getter, value })
            }
        }
    }

    fn apply(state: &mut MockState, effect: &TxEffect) {
        match effect {
            TxEffect::Create { address } => {
                state.contracts.entry(*address).or_default();
            }
            TxEffect::CreateProxy {
                address,
                implementation,
                admin,
            } => {
                let contract = state.contracts.entry(*address).or_default();
                contract
                    .storage
                    .insert(B256::from(erc1967::IMPLEMENTATION_SLOT), address_word(*implementation));
                contract
                    .storage
                    .insert(B256::from(erc1967::ADMIN_SLOT), address_word(*admin));
            }
            TxEffect::Set { to, getter, value } => {
                let contract = state.contracts.entry(*to).or_default();
                contract.views.insert(*getter, address_word(*value));
            }
        }
    }
}

impl ExecutionBackend for MockBackend {
    fn signer_address(&self) -> Address {
        SIGNER
    }

    async fn submit(&self, payload: &TxPayload) -> Result<B256, BackendError> {
        let mut state = self.state.lock().expect("mock state lock");
        state.submissions.push(payload.clone());

        if state.revert_markers.iter().any(|marker| contains(&payload.data, marker)) {
            return Err(BackendError::Reverted("execution reverted: injected".to_owned()));
        }

        let effect = Self::effect_for(&mut state, payload)?;
        let tx_hash = keccak256(
            [
                state.submissions.len().to_be_bytes().as_slice(),
                payload.data.as_slice(),
            ]
            .concat(),
        );
        let mined_revert = state
            .mine_revert_markers
            .iter()
            .any(|marker| contains(&payload.data, marker));
        state.txs.insert(
            tx_hash,
            MockTx {
                effect,
                applied: false,
                mined_revert,
            },
        );
        if state.hold_markers.iter().any(|marker| contains(&payload.data, marker)) {
            state.held.insert(tx_hash);
        }
        Ok(tx_hash)
    }

    async fn wait_for_confirmation(&self, tx_hash: B256, timeout: Duration) -> Result<TxReceipt, BackendError> {
        let mut state = self.state.lock().expect("mock state lock");
        if state.held.contains(&tx_hash) {
            return Err(BackendError::ConfirmationTimeout { tx_hash, timeout });
        }
        let tx = state
            .txs
            .get(&tx_hash)
            .cloned()
            .ok_or_else(|| BackendError::Rpc(format!("unknown transaction {tx_hash}")))?;
        if tx.mined_revert {
            return Ok(TxReceipt {
                tx_hash,
                success: false,
                contract_address: None,
                block_number: Some(1),
            });
        }
        if !tx.applied {
            Self::apply(&mut state, &tx.effect);
            if let Some(entry) = state.txs.get_mut(&tx_hash) {
                entry.applied = true;
            }
        }
        let contract_address = match tx.effect {
            TxEffect::Create { address } | TxEffect::CreateProxy { address, .. } => Some(address),
            TxEffect::Set { .. } => None,
        };
        Ok(TxReceipt {
            tx_hash,
            success: true,
            contract_address,
            block_number: Some(1),
        })
    }

    async fn read_state(&self, address: Address, query: &StateQuery) -> Result<Vec<u8>, BackendError> {
        let mut state = self.state.lock().expect("mock state lock");
        state.reads += 1;
        let contract = state.contracts.get(&address);
        match query {
            StateQuery::Call { data } => {
                if data.len() < 4 {
                    return Err(BackendError::Rpc("calldata too short".to_owned()));
                }
                let selector = [data[0], data[1], data[2], data[3]];
                let word = contract
                    .and_then(|c| c.views.get(&selector))
                    .copied()
                    .unwrap_or([0u8; 32]);
                Ok(word.to_vec())
            }
            StateQuery::StorageSlot(slot) => {
                let word = contract
                    .and_then(|c| c.storage.get(slot))
                    .copied()
                    .unwrap_or([0u8; 32]);
                Ok(word.to_vec())
            }
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

fn address_word(address: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..32].copy_from_slice(address.as_slice());
    word
}

static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

fn temp_dir(label: &str) -> PathBuf {
    let seq = DIR_SEQ.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("easyswap-{label}-{}-{seq}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("Should create temp dir");
    dir
}

fn write_artifact(dir: &Path, name: &str, bytecode: &[u8]) {
    let content = format!(
        r#"{{"contractName": "{name}", "abi": [], "bytecode": "0x{}"}}"#,
        hex::encode(bytecode)
    );
    std::fs::write(dir.join(format!("{name}.json")), content).expect("Should write artifact");
}

/// A full deployment setup against the mock backend: fake artifacts on disk,
/// an empty per-network ledger, and an engine factory so tests can run the
/// same deployment repeatedly.
pub struct TestEnvironment {
    pub backend: Arc<MockBackend>,
    pub artifacts_dir: PathBuf,
    pub deployments_dir: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let artifacts_dir = temp_dir("artifacts");
        write_artifact(&artifacts_dir, "EasySwapVault", VAULT_CODE);
        write_artifact(&artifacts_dir, "EasySwapOrderBook", ORDER_BOOK_CODE);
        write_artifact(&artifacts_dir, "TransparentUpgradeableProxy", PROXY_CODE);

        Self {
            backend: Arc::new(MockBackend::new()),
            artifacts_dir,
            deployments_dir: temp_dir("deployments"),
        }
    }

    pub fn open_registry(&self) -> AddressRegistry {
        AddressRegistry::open(&self.deployments_dir, NETWORK).expect("Should open registry")
    }

    pub fn settings(&self) -> DeploySettings {
        DeploySettings {
            protocol_share_bps: 200,
            eip712_name: "EasySwapOrderBook".to_owned(),
            eip712_version: "1".to_owned(),
            artifacts_dir: self.artifacts_dir.clone(),
            deployments_dir: self.deployments_dir.clone(),
            confirmation_timeout: CONFIRMATION_TIMEOUT,
        }
    }

    /// One full engine pass, the way `scripts::deploy::run` drives it.
    pub async fn run(&self) -> RunReport {
        let components = plan::easyswap_components(200, "EasySwapOrderBook", "1");
        let execution_plan = build_plan(components).expect("Should build plan");
        let registry = self.open_registry();
        let deployer = ProxyDeployer::new(
            self.backend.clone(),
            ArtifactStore::new(&self.artifacts_dir),
            CONFIRMATION_TIMEOUT,
        );
        let linker = Linker::new(self.backend.clone(), CONFIRMATION_TIMEOUT);
        let engine = ExecutionEngine::new(
            execution_plan,
            NETWORK.to_owned(),
            registry,
            deployer,
            linker,
            self.backend.clone(),
        );
        engine.run().await.expect("Run should not abort")
    }
}
