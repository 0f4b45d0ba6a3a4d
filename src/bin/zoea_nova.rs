//! Binary entry point: parse arguments, load configuration, wire the
//! store/provider registry/tool proxy/event bus into a [`Commander`], and
//! either run a one-shot subcommand or drop into the interactive loop.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use zoea_nova::cli::{self, Cli, Commands};
use zoea_nova::commander::Commander;
use zoea_nova::config::Config;
use zoea_nova::event_bus::EventBus;
use zoea_nova::provider::{HttpProvider, ProviderRegistry};
use zoea_nova::store::Store;
use zoea_nova::tool_proxy::{JsonRpcToolClient, OfflineUpstreamClient, ToolProxy, UpstreamClient};

const STORE_PATH: &str = "zoea.sqlite";

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    cli::init_logging(args.verbose, args.debug, args.log_file.as_ref());

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("zoea-nova: {}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load(&args.config)?;
    config.apply_env_overrides();
    config
        .validate()
        .map_err(|errors| format!("invalid configuration: {} error(s): {:?}", errors.len(), errors))?;

    let store = Store::open(STORE_PATH)?;

    let mut providers = ProviderRegistry::new();
    for (name, provider_config) in &config.providers {
        let provider = Arc::new(HttpProvider::new(name.clone(), provider_config));
        providers.register(name.clone(), provider, provider_config);
    }
    let providers = Arc::new(providers);

    let upstream: Arc<dyn UpstreamClient> = if args.offline {
        log::info!("running offline: upstream tool calls are stubbed");
        Arc::new(OfflineUpstreamClient::new())
    } else {
        Arc::new(JsonRpcToolClient::new(config.upstream.tool_server_url.clone()))
    };
    let tool_proxy = Arc::new(ToolProxy::new(Some(upstream)).with_account_store(store.clone()));

    let event_bus = EventBus::new();
    let commander = Commander::from_config(&config, store, providers, tool_proxy, event_bus);

    match args.command {
        None | Some(Commands::Run) => {
            cli::interactive_loop(&commander).await;
            Ok(())
        }
        Some(command) => {
            let output = cli::run_command(&commander, command).await?;
            if !output.is_empty() {
                println!("{}", output);
            }
            Ok(())
        }
    }
}
