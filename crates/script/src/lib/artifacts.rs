use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::utils;

/// The slice of a hardhat build artifact this tool needs: the contract name
/// and the creation bytecode. Everything else in the artifact is ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractArtifact {
    pub contract_name: String,
    pub bytecode: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read artifact {artifact} from {path:?}: {source}")]
    Read {
        artifact: String,
        path: PathBuf,
        source: utils::Error,
    },

    #[error("Artifact {artifact} carries no creation bytecode (abstract contract or interface?)")]
    MissingBytecode { artifact: String },

    #[error("Artifact {artifact} bytecode is not valid hex: {source}")]
    InvalidHex {
        artifact: String,
        source: hex::FromHexError,
    },
}

/// Reads creation bytecode from compiled-contract artifacts in a directory
/// (`<dir>/<name>.json`, hardhat layout).
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    pub fn creation_code(&self, artifact: &str) -> Result<Vec<u8>, Error> {
        let path = self.dir.join(format!("{artifact}.json"));
        let parsed: ContractArtifact = utils::read_json(&path).map_err(|source| Error::Read {
            artifact: artifact.to_owned(),
            path: path.clone(),
            source,
        })?;

        let stripped = parsed.bytecode.trim_start_matches("0x");
        if stripped.is_empty() {
            return Err(Error::MissingBytecode {
                artifact: artifact.to_owned(),
            });
        }
        hex::decode(stripped).map_err(|source| Error::InvalidHex {
            artifact: artifact.to_owned(),
            source,
        })
    }
}
