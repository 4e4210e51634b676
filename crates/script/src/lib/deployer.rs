use std::sync::Arc;
use std::time::Duration;

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, B256, U256};
use thiserror::Error;

use crate::artifacts::{self, ArtifactStore};
use crate::eth_client::{abi, BackendError, ExecutionBackend, StateQuery, TxPayload, TxReceipt};
use crate::plan::{ComponentSpec, InitArg};
use crate::registry::{AddressRegistry, DeploymentRecord, PendingTx, Status, TxPhase};

/// OpenZeppelin transparent proxy; its constructor takes
/// `(address logic, address initialOwner, bytes initData)` and spawns the
/// ProxyAdmin that ends up in the ERC-1967 admin slot.
const PROXY_ARTIFACT: &str = "TransparentUpgradeableProxy";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Initializer for {component} still references {placeholder}; arguments were not resolved in dependency order")]
    UnresolvedArgument {
        component: String,
        placeholder: String,
    },

    #[error("Backend rejected transaction for {component}: {reason}")]
    SubmissionRejected { component: String, reason: String },

    #[error("Transaction {tx_hash} for {component} not confirmed in time; will poll on the next run")]
    ConfirmationTimeout { component: String, tx_hash: B256 },

    #[error("Execution reverted for {component}: {reason}")]
    ExecutionReverted { component: String, reason: String },

    #[error("Creation receipt for {component} (tx {tx_hash}) carries no contract address")]
    MissingContractAddress { component: String, tx_hash: B256 },

    #[error(transparent)]
    Artifact(#[from] artifacts::Error),

    #[error(transparent)]
    Registry(#[from] crate::registry::Error),

    #[error("Backend failure for {component}: {reason}")]
    Backend { component: String, reason: String },
}

fn map_backend(component: &str, err: BackendError) -> Error {
    match err {
        BackendError::Rejected(reason) => Error::SubmissionRejected {
            component: component.to_owned(),
            reason,
        },
        BackendError::Reverted(reason) => Error::ExecutionReverted {
            component: component.to_owned(),
            reason,
        },
        BackendError::ConfirmationTimeout { tx_hash, .. } => Error::ConfirmationTimeout {
            component: component.to_owned(),
            tx_hash,
        },
        BackendError::Rpc(reason) => Error::Backend {
            component: component.to_owned(),
            reason,
        },
    }
}

pub fn to_dyn_values(component: &str, args: &[InitArg]) -> Result<Vec<DynSolValue>, Error> {
    args.iter()
        .map(|arg| match arg {
            InitArg::Uint { value, bits } => Ok(DynSolValue::Uint(U256::from(*value), *bits)),
            InitArg::Address(address) => Ok(DynSolValue::Address(*address)),
            InitArg::Str(value) => Ok(DynSolValue::String(value.clone())),
            InitArg::DependencyProxy(dependency) => Err(Error::UnresolvedArgument {
                component: component.to_owned(),
                placeholder: dependency.clone(),
            }),
        })
        .collect()
}

/// Deploys one upgradeable component: implementation creation, then a
/// transparent proxy wrapping it with the initializer call, then the admin
/// address read back from the proxy. Each confirmed step lands in the
/// registry before the next begins, so an interrupted run resumes from the
/// last confirmed step and a timed-out transaction is polled, not resent.
pub struct ProxyDeployer<B> {
    backend: Arc<B>,
    artifacts: ArtifactStore,
    confirmation_timeout: Duration,
}

impl<B: ExecutionBackend> ProxyDeployer<B> {
    pub fn new(backend: Arc<B>, artifacts: ArtifactStore, confirmation_timeout: Duration) -> Self {
        Self {
            backend,
            artifacts,
            confirmation_timeout,
        }
    }

    pub async fn deploy(
        &self,
        spec: &ComponentSpec,
        record: &mut DeploymentRecord,
        registry: &mut AddressRegistry,
    ) -> Result<(), Error> {
        // Arguments must arrive fully resolved; a surviving placeholder means
        // the plan or engine got the ordering wrong.
        let init_values = to_dyn_values(&spec.id, &record.init_args)?;

        if let Some(pending) = record.pending_tx {
            self.settle_pending(spec, pending, record, registry).await?;
        }

        if record.implementation.is_none() {
            let code = self.artifacts.creation_code(&spec.artifact)?;
            tracing::info!(
                component = %spec.id,
                artifact = spec.artifact,
                "Deploying implementation ({} bytes of creation code)",
                code.len()
            );
            let receipt = self
                .submit_and_confirm(spec, TxPayload::create(code), TxPhase::Implementation, record, registry)
                .await?;
            record.implementation = Some(Self::created_address(&spec.id, &receipt)?);
            record.pending_tx = None;
            registry.record(record.clone())?;
            tracing::info!(
                component = %spec.id,
                "Implementation at {}",
                hex::encode(record.implementation.expect("just set"))
            );
        }

        if record.proxy.is_none() {
            let implementation = record
                .implementation
                .expect("implementation confirmed before proxy phase");
            let init_data = abi::encode_call(&spec.init_signature, &init_values);
            let mut creation = self.artifacts.creation_code(PROXY_ARTIFACT)?;
            creation.extend(abi::encode_args(&[
                DynSolValue::Address(implementation),
                DynSolValue::Address(self.backend.signer_address()),
                DynSolValue::Bytes(init_data),
            ]));

            tracing::info!(component = %spec.id, "Deploying proxy");
            let receipt = self
                .submit_and_confirm(spec, TxPayload::create(creation), TxPhase::Proxy, record, registry)
                .await?;
            record.proxy = Some(Self::created_address(&spec.id, &receipt)?);
            record.pending_tx = None;
            registry.record(record.clone())?;
            tracing::info!(
                component = %spec.id,
                "Proxy at {}",
                hex::encode(record.proxy.expect("just set"))
            );
        }

        if record.admin.is_none() {
            let proxy = record.proxy.expect("proxy confirmed before admin phase");
            let word = self
                .backend
                .read_state(proxy, &StateQuery::admin_slot())
                .await
                .map_err(|err| map_backend(&spec.id, err))?;
            record.admin = abi::decode_address_word(&word);
            tracing::info!(
                component = %spec.id,
                "Proxy admin at {}",
                record.admin.map(hex::encode).unwrap_or_default()
            );
        }

        record.status = Status::Deployed;
        registry.record(record.clone())?;
        Ok(())
    }

    /// Polls a transaction left over from an earlier run. Resubmitting would
    /// double-deploy, so the stored reference always wins.
    async fn settle_pending(
        &self,
        spec: &ComponentSpec,
        pending: PendingTx,
        record: &mut DeploymentRecord,
        registry: &mut AddressRegistry,
    ) -> Result<(), Error> {
        tracing::info!(
            component = %spec.id,
            "Polling previously submitted transaction {} ({:?} phase)",
            pending.tx_hash,
            pending.phase
        );
        let receipt = self
            .backend
            .wait_for_confirmation(pending.tx_hash, self.confirmation_timeout)
            .await
            .map_err(|err| map_backend(&spec.id, err))?;
        if !receipt.success {
            // Reverted means settled: the reference must not survive, or the
            // next run would re-poll a permanently failed transaction instead
            // of resubmitting.
            record.pending_tx = None;
            registry.record(record.clone())?;
            return Err(Error::ExecutionReverted {
                component: spec.id.clone(),
                reason: format!("transaction {} reverted on-chain", receipt.tx_hash),
            });
        }

        let address = Self::created_address(&spec.id, &receipt)?;
        match pending.phase {
            TxPhase::Implementation => record.implementation = Some(address),
            TxPhase::Proxy => record.proxy = Some(address),
        }
        record.pending_tx = None;
        registry.record(record.clone())?;
        Ok(())
    }

    async fn submit_and_confirm(
        &self,
        spec: &ComponentSpec,
        payload: TxPayload,
        phase: TxPhase,
        record: &mut DeploymentRecord,
        registry: &mut AddressRegistry,
    ) -> Result<TxReceipt, Error> {
        let tx_hash = self
            .backend
            .submit(&payload)
            .await
            .map_err(|err| map_backend(&spec.id, err))?;

        // The reference goes to the ledger before we wait, so an interrupt or
        // timeout leaves a record the next run can poll.
        record.pending_tx = Some(PendingTx { phase, tx_hash });
        registry.record(record.clone())?;

        let receipt = self
            .backend
            .wait_for_confirmation(tx_hash, self.confirmation_timeout)
            .await
            .map_err(|err| map_backend(&spec.id, err))?;
        if !receipt.success {
            // Settled on-chain; a retry must resubmit, not re-poll.
            record.pending_tx = None;
            registry.record(record.clone())?;
            return Err(Error::ExecutionReverted {
                component: spec.id.clone(),
                reason: format!("transaction {tx_hash} reverted on-chain"),
            });
        }
        Ok(receipt)
    }

    fn created_address(component: &str, receipt: &TxReceipt) -> Result<Address, Error> {
        receipt
            .contract_address
            .ok_or_else(|| Error::MissingContractAddress {
                component: component.to_owned(),
                tx_hash: receipt.tx_hash,
            })
    }
}
