use std::sync::Arc;
use std::time::Duration;

use alloy::network::{Ethereum, EthereumWallet, TransactionBuilder};
use alloy::providers::fillers::RecommendedFillers;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::reqwest::Url;
use alloy_primitives::{Address, Bytes, B256, U256};
use thiserror::Error;

use crate::consts::erc1967;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// ABI plumbing shared by the deployer, the linker and the tests: selectors
/// from canonical signatures, call encoding over dynamically-typed values.
pub mod abi {
    use alloy_dyn_abi::DynSolValue;
    use alloy_primitives::keccak256;

    pub fn selector(signature: &str) -> [u8; 4] {
        let hash = keccak256(signature.as_bytes());
        [hash[0], hash[1], hash[2], hash[3]]
    }

    pub fn encode_call(signature: &str, args: &[DynSolValue]) -> Vec<u8> {
        let mut out = selector(signature).to_vec();
        out.extend(DynSolValue::Tuple(args.to_vec()).abi_encode_params());
        out
    }

    pub fn encode_args(args: &[DynSolValue]) -> Vec<u8> {
        DynSolValue::Tuple(args.to_vec()).abi_encode_params()
    }

    /// Last 20 bytes of a 32-byte ABI word.
    pub fn decode_address_word(word: &[u8]) -> Option<alloy_primitives::Address> {
        if word.len() < 32 {
            return None;
        }
        Some(alloy_primitives::Address::from_slice(&word[12..32]))
    }
}

/// One transaction to submit: a contract creation (`to: None`, `data` is the
/// creation code) or a call to an existing contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPayload {
    pub to: Option<Address>,
    pub data: Vec<u8>,
}

impl TxPayload {
    pub fn create(data: Vec<u8>) -> Self {
        Self { to: None, data }
    }

    pub fn call(to: Address, data: Vec<u8>) -> Self {
        Self { to: Some(to), data }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub success: bool,
    pub contract_address: Option<Address>,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateQuery {
    /// `eth_call` with the given calldata.
    Call { data: Vec<u8> },
    /// Raw storage read, e.g. the ERC-1967 slots.
    StorageSlot(B256),
}

impl StateQuery {
    pub fn view(signature: &str) -> Self {
        Self::Call {
            data: abi::selector(signature).to_vec(),
        }
    }

    pub fn implementation_slot() -> Self {
        Self::StorageSlot(B256::from(erc1967::IMPLEMENTATION_SLOT))
    }

    pub fn admin_slot() -> Self {
        Self::StorageSlot(B256::from(erc1967::ADMIN_SLOT))
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend rejected transaction: {0}")]
    Rejected(String),

    #[error("Execution reverted: {0}")]
    Reverted(String),

    #[error("Transaction {tx_hash} not confirmed within {timeout:?}")]
    ConfirmationTimeout { tx_hash: B256, timeout: Duration },

    #[error("RPC failure: {0}")]
    Rpc(String),
}

/// Sole collaborator for on-chain effects. Everything the orchestrator does on
/// the network, it does through these four calls, which keeps the engine
/// testable against an in-memory implementation.
pub trait ExecutionBackend {
    /// The primary transaction signer; becomes the proxies' initial owner.
    fn signer_address(&self) -> Address;

    /// Submits a transaction, returning its hash without waiting for
    /// inclusion. Rejections and preflight reverts surface here.
    fn submit(&self, payload: &TxPayload) -> impl std::future::Future<Output = Result<B256, BackendError>> + Send;

    /// Blocks until the transaction is included or the timeout elapses. A
    /// reverted-on-chain transaction is a receipt with `success == false`,
    /// not an error, so callers decide how to record it.
    fn wait_for_confirmation(
        &self,
        tx_hash: B256,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<TxReceipt, BackendError>> + Send;

    fn read_state(
        &self,
        address: Address,
        query: &StateQuery,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, BackendError>> + Send;
}

fn classify_rpc_error(err: alloy::transports::RpcError<alloy::transports::TransportErrorKind>) -> BackendError {
    if let alloy::transports::RpcError::ErrorResp(ref error_payload) = err {
        let message = error_payload.message.to_string();
        if message.contains("execution reverted") || error_payload.as_revert_data().is_some() {
            return BackendError::Reverted(message);
        }
        return BackendError::Rejected(message);
    }
    BackendError::Rpc(format!("{err:?}"))
}

/// `ExecutionBackend` over a JSON-RPC execution layer node.
pub struct AlloyBackend<P>
where
    P: Provider<Ethereum> + Clone,
{
    provider: Arc<P>,
    signer: Address,
}

impl<P> AlloyBackend<P>
where
    P: Provider<Ethereum> + Clone,
{
    pub fn new(provider: Arc<P>, signer: Address) -> Self {
        Self { provider, signer }
    }

    fn to_request(payload: &TxPayload) -> TransactionRequest {
        let data = Bytes::from(payload.data.clone());
        match payload.to {
            Some(to) => TransactionRequest::default().with_to(to).with_input(data),
            None => TransactionRequest::default().with_deploy_code(data),
        }
    }
}

impl<P> ExecutionBackend for AlloyBackend<P>
where
    P: Provider<Ethereum> + Clone + Send + Sync,
{
    fn signer_address(&self) -> Address {
        self.signer
    }

    async fn submit(&self, payload: &TxPayload) -> Result<B256, BackendError> {
        let request = Self::to_request(payload);

        // Preflight mirrors what goes on-chain; a revert here carries the
        // reason string a mined-then-reverted transaction would not.
        if let Err(err) = self.provider.call(request.clone()).await {
            let classified = classify_rpc_error(err);
            tracing::error!("Preflight call failed: {classified}");
            return Err(classified);
        }

        let pending = self
            .provider
            .send_transaction(request)
            .await
            .map_err(|err| classify_rpc_error(err))
            .inspect(|val| tracing::debug!("Submitted transaction {}", val.tx_hash()))
            .inspect_err(|err| tracing::error!("Failed to submit transaction {err:?}"))?;

        Ok(*pending.tx_hash())
    }

    async fn wait_for_confirmation(&self, tx_hash: B256, timeout: Duration) -> Result<TxReceipt, BackendError> {
        let poll = async {
            loop {
                let maybe_receipt = self
                    .provider
                    .get_transaction_receipt(tx_hash)
                    .await
                    .map_err(classify_rpc_error)?;
                if let Some(receipt) = maybe_receipt {
                    return Ok::<_, BackendError>(TxReceipt {
                        tx_hash,
                        success: receipt.status(),
                        contract_address: receipt.contract_address,
                        block_number: receipt.block_number,
                    });
                }
                tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_elapsed) => Err(BackendError::ConfirmationTimeout { tx_hash, timeout }),
        }
    }

    async fn read_state(&self, address: Address, query: &StateQuery) -> Result<Vec<u8>, BackendError> {
        match query {
            StateQuery::Call { data } => {
                let request = TransactionRequest::default()
                    .with_to(address)
                    .with_input(Bytes::from(data.clone()));
                let bytes = self.provider.call(request).await.map_err(classify_rpc_error)?;
                Ok(bytes.to_vec())
            }
            StateQuery::StorageSlot(slot) => {
                let value = self
                    .provider
                    .get_storage_at(address, U256::from_be_bytes(slot.0))
                    .await
                    .map_err(classify_rpc_error)?;
                Ok(value.to_be_bytes::<32>().to_vec())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Failed to convert string to hex")]
    FromHexError,
    #[error("Failed to parse private key")]
    ParsePrivateKeyError,
    #[error("Failed to deserialize private key")]
    DeserializePrivateKeyError,
}

pub type DefaultProvider = alloy::providers::fillers::FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::fillers::JoinFill<
            alloy::providers::Identity,
            <Ethereum as RecommendedFillers>::RecommendedFillers,
        >,
        alloy::providers::fillers::WalletFiller<EthereumWallet>,
    >,
    alloy::providers::RootProvider,
>;

pub type EthBackend = AlloyBackend<DefaultProvider>;

pub struct ProviderFactory {}
impl ProviderFactory {
    fn decode_key(private_key_raw: &str) -> Result<k256::SecretKey, ProviderError> {
        let key_str = private_key_raw
            .split("0x")
            .last()
            .ok_or(ProviderError::ParsePrivateKeyError)?
            .trim();
        let key_hex = hex::decode(key_str).map_err(|_e| ProviderError::FromHexError)?;
        let key = k256::SecretKey::from_bytes((&key_hex[..]).into())
            .map_err(|_e| ProviderError::DeserializePrivateKeyError)?;
        Ok(key)
    }

    /// Builds a wallet-backed provider and reports the signer address it will
    /// send from.
    pub fn create_provider(key: k256::SecretKey, endpoint: Url) -> (DefaultProvider, Address) {
        let signer: PrivateKeySigner = PrivateKeySigner::from(key);
        let signer_address = signer.address();
        let wallet: EthereumWallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new().wallet(wallet).on_http(endpoint);
        (provider, signer_address)
    }

    pub fn create_provider_decode_key(
        key_str: &str,
        endpoint: Url,
    ) -> Result<(DefaultProvider, Address), ProviderError> {
        let key = Self::decode_key(key_str)?;
        Ok(Self::create_provider(key, endpoint))
    }
}
