use std::str::FromStr;

use thiserror::Error;

/// Well-known ERC-1967 proxy storage slots. The proxy records its current
/// implementation and admin at these locations regardless of the logic
/// contract's own storage layout.
pub mod erc1967 {
    use hex_literal::hex;

    // bytes32(uint256(keccak256("eip1967.proxy.implementation")) - 1)
    pub const IMPLEMENTATION_SLOT: [u8; 32] =
        hex!("360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");
    // bytes32(uint256(keccak256("eip1967.proxy.admin")) - 1)
    pub const ADMIN_SLOT: [u8; 32] =
        hex!("b53127684a568b3173ae13b9f8a6016e243e63b6e8ee1178d6a717850b5d6103");
}

pub struct NetworkConfig {
    pub chain_id: u64,
}

pub trait NetworkInfo {
    fn as_str(&self) -> String;
    fn get_config(&self) -> NetworkConfig;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Sepolia,
    Holesky,
}

impl NetworkInfo for Network {
    fn as_str(&self) -> String {
        let val = match self {
            Self::Mainnet => "mainnet",
            Self::Sepolia => "sepolia",
            Self::Holesky => "holesky",
        };
        val.to_owned()
    }

    fn get_config(&self) -> NetworkConfig {
        match self {
            Self::Mainnet => NetworkConfig { chain_id: 1 },
            Self::Sepolia => NetworkConfig { chain_id: 11155111 },
            Self::Holesky => NetworkConfig { chain_id: 17000 },
        }
    }
}

/// Deployment target: either a public network, or a local anvil fork of one.
/// Anvil forks keep the fork's deployment ledger separate from the real
/// network's (`anvil-sepolia` vs `sepolia`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrappedNetwork {
    Anvil(Network),
    Id(Network),
}

impl NetworkInfo for WrappedNetwork {
    fn as_str(&self) -> String {
        match self {
            Self::Anvil(fork) => format!("anvil-{}", fork.as_str()),
            Self::Id(network) => network.as_str(),
        }
    }

    fn get_config(&self) -> NetworkConfig {
        match self {
            Self::Id(network) => network.get_config(),
            Self::Anvil(fork) => {
                let mut fork_config = fork.get_config();
                fork_config.chain_id = 31337;
                fork_config
            }
        }
    }
}

#[derive(Debug, Error)]
#[error("Unknown network {0}")]
pub struct NetworkParseError(String);

impl FromStr for WrappedNetwork {
    type Err = NetworkParseError;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        let (is_anvil, base_network) = match val.strip_prefix("anvil-") {
            Some(fork) => (true, fork),
            None => (false, val),
        };

        let network = match base_network {
            "mainnet" => Network::Mainnet,
            "sepolia" => Network::Sepolia,
            "holesky" => Network::Holesky,
            _ => return Err(NetworkParseError(val.to_owned())),
        };

        if is_anvil {
            Ok(WrappedNetwork::Anvil(network))
        } else {
            Ok(WrappedNetwork::Id(network))
        }
    }
}
