use std::sync::Arc;
use std::time::Duration;

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, B256};
use thiserror::Error;

use crate::eth_client::{abi, BackendError, ExecutionBackend, StateQuery, TxPayload};
use crate::plan::ComponentId;

/// One resolved cross-wiring call: write `desired` into the `source`
/// component's contract and confirm it via `get_method`.
#[derive(Debug, Clone)]
pub struct LinkAction {
    pub id: String,
    pub source: ComponentId,
    pub source_proxy: Address,
    pub target: ComponentId,
    pub desired: Address,
    pub set_method: String,
    pub get_method: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Live state already matched; no transaction submitted.
    AlreadyLinked,
    Linked { tx_hash: B256 },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Backend rejected link {link}: {reason}")]
    SubmissionRejected { link: String, reason: String },

    #[error("Link {link} transaction {tx_hash} not confirmed in time; will poll on the next run")]
    ConfirmationTimeout { link: String, tx_hash: B256 },

    #[error("Link {link} reverted: {reason}")]
    ExecutionReverted { link: String, reason: String },

    #[error("Link {link} read-back mismatch: expected {expected}, found {actual}")]
    VerificationFailed {
        link: String,
        expected: Address,
        actual: Address,
    },

    #[error("Link {link} getter returned an unexpected value ({length} bytes)")]
    MalformedReadback { link: String, length: usize },

    #[error("Backend failure for link {link}: {reason}")]
    Backend { link: String, reason: String },
}

fn map_backend(link: &str, err: BackendError) -> Error {
    match err {
        BackendError::Rejected(reason) => Error::SubmissionRejected {
            link: link.to_owned(),
            reason,
        },
        BackendError::Reverted(reason) => Error::ExecutionReverted {
            link: link.to_owned(),
            reason,
        },
        BackendError::ConfirmationTimeout { tx_hash, .. } => Error::ConfirmationTimeout {
            link: link.to_owned(),
            tx_hash,
        },
        BackendError::Rpc(reason) => Error::Backend {
            link: link.to_owned(),
            reason,
        },
    }
}

/// Issues post-deployment cross-reference calls. Idempotent: the live value is
/// read before submitting, and the write is only trusted after a read-back
/// matches. A read-back mismatch is fatal, never a warning.
pub struct Linker<B> {
    backend: Arc<B>,
    confirmation_timeout: Duration,
}

impl<B: ExecutionBackend> Linker<B> {
    pub fn new(backend: Arc<B>, confirmation_timeout: Duration) -> Self {
        Self {
            backend,
            confirmation_timeout,
        }
    }

    /// `prior_tx` is a submission reference from an earlier timed-out run;
    /// when present it is polled instead of submitting a fresh transaction.
    pub async fn link(&self, action: &LinkAction, prior_tx: Option<B256>) -> Result<LinkOutcome, Error> {
        let current = self.read_current(action).await?;
        if current == action.desired {
            tracing::info!(
                link = %action.id,
                "Cross-reference already set to {}, nothing to submit",
                action.desired
            );
            return Ok(LinkOutcome::AlreadyLinked);
        }

        let tx_hash = match prior_tx {
            Some(tx_hash) => {
                tracing::info!(link = %action.id, "Polling previously submitted link transaction {tx_hash}");
                tx_hash
            }
            None => {
                let calldata = abi::encode_call(&action.set_method, &[DynSolValue::Address(action.desired)]);
                tracing::info!(
                    link = %action.id,
                    "Linking {} -> {}: calling {} with {}",
                    action.source,
                    action.target,
                    action.set_method,
                    action.desired
                );
                self.backend
                    .submit(&TxPayload::call(action.source_proxy, calldata))
                    .await
                    .map_err(|err| map_backend(&action.id, err))?
            }
        };

        let receipt = self
            .backend
            .wait_for_confirmation(tx_hash, self.confirmation_timeout)
            .await
            .map_err(|err| map_backend(&action.id, err))?;
        if !receipt.success {
            return Err(Error::ExecutionReverted {
                link: action.id.clone(),
                reason: format!("transaction {tx_hash} reverted on-chain"),
            });
        }

        // The write only counts once the chain agrees it took effect.
        let after = self.read_current(action).await?;
        if after != action.desired {
            return Err(Error::VerificationFailed {
                link: action.id.clone(),
                expected: action.desired,
                actual: after,
            });
        }

        tracing::info!(link = %action.id, "Linked and read back successfully (tx {tx_hash})");
        Ok(LinkOutcome::Linked { tx_hash })
    }

    pub async fn read_current(&self, action: &LinkAction) -> Result<Address, Error> {
        let word = self
            .backend
            .read_state(action.source_proxy, &StateQuery::view(&action.get_method))
            .await
            .map_err(|err| map_backend(&action.id, err))?;
        abi::decode_address_word(&word).ok_or(Error::MalformedReadback {
            link: action.id.clone(),
            length: word.len(),
        })
    }
}
