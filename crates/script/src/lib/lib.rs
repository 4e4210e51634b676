pub mod artifacts;
pub mod consts;
pub mod deployer;
pub mod engine;
pub mod eth_client;
pub mod linker;
pub mod plan;
pub mod registry;
pub mod scripts;
pub mod tracing;
pub mod utils;
