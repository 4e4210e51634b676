use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use alloy::transports::http::reqwest::Url;
use thiserror::Error;

use crate::consts::{self, NetworkInfo, WrappedNetwork};
use crate::eth_client::{self, EthBackend, ProviderFactory};

pub mod env_vars {
    use std::env;
    use std::fmt::Debug;

    #[derive(Clone)]
    pub struct EnvVarValue<TVal> {
        pub name: &'static str,
        pub sensitive: bool,
        pub value: TVal,
    }

    impl<TVal: Debug> Debug for EnvVarValue<TVal> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let value_print = if self.sensitive {
                "***".to_string()
            } else {
                format!("{:?}", self.value)
            };
            f.debug_struct("EnvVarValue")
                .field("name", &self.name)
                .field("value", &value_print)
                .finish()
        }
    }

    #[derive(Debug, Clone)]
    pub struct EnvVars {
        pub execution_layer_rpc: EnvVarValue<String>,
        /// Comma-separated signing keys; the first is the primary transaction
        /// signer, the rest are accepted but unused.
        pub private_keys: EnvVarValue<String>,
    }

    impl EnvVars {
        fn required(key: &'static str, sensitive: bool) -> EnvVarValue<String> {
            let value = env::var(key).unwrap_or_else(|e| panic!("Failed to read env var {key}: {e:?}"));
            EnvVarValue {
                name: key,
                sensitive,
                value,
            }
        }

        pub fn init_from_env() -> Self {
            Self {
                execution_layer_rpc: Self::required("EXECUTION_LAYER_RPC", true),
                private_keys: Self::required("PRIVATE_KEYS", true),
            }
        }
    }
}

pub const PROTOCOL_SHARE_DENOMINATOR: u16 = 10000;

/// Everything the deploy run needs besides credentials. Validated before any
/// network call: a bad fee or an empty EIP-712 domain aborts with nothing
/// submitted and nothing persisted.
#[derive(Debug, Clone)]
pub struct DeploySettings {
    /// Protocol fee share in basis points, e.g. 200 = 2%.
    pub protocol_share_bps: u16,
    /// EIP-712 signing domain of the order book, used off-chain by takers.
    pub eip712_name: String,
    pub eip712_version: String,
    pub artifacts_dir: PathBuf,
    pub deployments_dir: PathBuf,
    pub confirmation_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Protocol share {0} out of range [0, {PROTOCOL_SHARE_DENOMINATOR})")]
    ProtocolShareOutOfRange(u16),

    #[error("EIP-712 domain name must not be empty")]
    EmptyEip712Name,

    #[error("EIP-712 domain version must not be empty")]
    EmptyEip712Version,
}

impl DeploySettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol_share_bps >= PROTOCOL_SHARE_DENOMINATOR {
            return Err(ConfigError::ProtocolShareOutOfRange(self.protocol_share_bps));
        }
        if self.eip712_name.trim().is_empty() {
            return Err(ConfigError::EmptyEip712Name);
        }
        if self.eip712_version.trim().is_empty() {
            return Err(ConfigError::EmptyEip712Version);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to parse network: {0}")]
    FailedToParseNetwork(#[from] consts::NetworkParseError),

    #[error("Failed to parse URL {0}")]
    FailedToParseUrl(String),

    #[error("No signing key configured")]
    NoSigningKey,

    #[error("Failed to decode signing key: {0}")]
    FailedToDecodeKey(#[from] eth_client::ProviderError),
}

pub struct ScriptRuntime {
    pub network: WrappedNetwork,
    pub backend: Arc<EthBackend>,
    pub settings: DeploySettings,
}

impl ScriptRuntime {
    pub fn init(network_str: &str, settings: DeploySettings, env_vars: &env_vars::EnvVars) -> Result<Self, Error> {
        let network: WrappedNetwork = network_str.parse()?;

        let endpoint: Url = env_vars
            .execution_layer_rpc
            .value
            .parse()
            .map_err(|_e| Error::FailedToParseUrl(env_vars.execution_layer_rpc.name.to_owned()))?;

        let primary_key = env_vars
            .private_keys
            .value
            .split(',')
            .map(str::trim)
            .find(|key| !key.is_empty())
            .ok_or(Error::NoSigningKey)?;

        let (provider, signer_address) = ProviderFactory::create_provider_decode_key(primary_key, endpoint)?;
        let backend = Arc::new(EthBackend::new(Arc::new(provider), signer_address));

        tracing::info!(
            network = %network.as_str(),
            chain_id = network.get_config().chain_id,
            signer = %signer_address,
            "Initialized deploy runtime"
        );

        Ok(Self {
            network,
            backend,
            settings,
        })
    }

    pub fn network(&self) -> &impl NetworkInfo {
        &self.network
    }
}
