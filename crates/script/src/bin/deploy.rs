use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use easyswap_deploy_scripts::scripts;
use easyswap_deploy_scripts::scripts::prelude::{env_vars::EnvVars, DeploySettings, ScriptRuntime};
use easyswap_deploy_scripts::tracing as tracing_config;
use easyswap_deploy_scripts::utils::read_env;

// cargo run --bin deploy --release -- --network sepolia
//
// Re-running the same command resumes: the per-network ledger under
// --deployments-dir decides what is still left to do.

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct DeployArgs {
    /// Target network: mainnet, sepolia, holesky, or anvil-<fork-url>.
    #[clap(long, env = "EVM_CHAIN")]
    network: String,

    /// Protocol fee share in basis points (200 = 2%).
    #[clap(long, env = "PROTOCOL_SHARE_BPS", default_value = "200")]
    protocol_share_bps: u16,

    #[clap(long, env = "EIP712_NAME", default_value = "EasySwapOrderBook")]
    eip712_name: String,

    #[clap(long, env = "EIP712_VERSION", default_value = "1")]
    eip712_version: String,

    /// Directory with compiled contract artifacts (hardhat layout).
    #[clap(long, env = "ARTIFACTS_DIR", default_value = "artifacts")]
    artifacts_dir: PathBuf,

    /// Per-network deployment ledgers live here.
    #[clap(long, env = "DEPLOYMENTS_DIR", default_value = "deployments")]
    deployments_dir: PathBuf,

    /// How long to wait for a transaction receipt before giving up.
    #[clap(long, default_value = "120")]
    confirmation_timeout_secs: u64,

    /// Validate the configuration and print the plan without deploying.
    #[clap(long, required = false, default_value = "false")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_config::setup_logger(
        tracing_config::LoggingConfig::default()
            .use_format(read_env("LOG_FORMAT", tracing_config::LogFormat::Plain)),
    );

    let args = DeployArgs::parse();
    tracing::debug!("Args: {:?}", args);

    let settings = DeploySettings {
        protocol_share_bps: args.protocol_share_bps,
        eip712_name: args.eip712_name,
        eip712_version: args.eip712_version,
        artifacts_dir: args.artifacts_dir,
        deployments_dir: args.deployments_dir,
        confirmation_timeout: Duration::from_secs(args.confirmation_timeout_secs),
    };

    let env_vars = EnvVars::init_from_env();
    let script_runtime = ScriptRuntime::init(&args.network, settings, &env_vars)?;

    let flags = scripts::deploy::Flags { dry_run: args.dry_run };

    let report = scripts::deploy::run(&script_runtime, &flags).await?;
    if args.dry_run {
        tracing::info!("Dry run finished, nothing was deployed");
    } else {
        tracing::info!(
            "Deployment complete, {} component(s) verified",
            report.outcomes.len()
        );
    }
    Ok(())
}
