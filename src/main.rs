use anyhow::Result;
use clap::Parser;

use shellfence::cli::{self, Cli, Commands};
use shellfence::config::{Config, LoggingConfig};
use shellfence::sandbox::{APPLY_HELPER_NAME, apply_main};

fn main() -> Result<()> {
    // argv[0] dispatch: if started as "shellfence-apply", install the filter
    // and exec the target immediately, before Tokio, Clap, or any other
    // initialization.
    #[cfg(unix)]
    if let Some(arg0) = std::env::args_os().next()
        && arg0.to_string_lossy().ends_with(APPLY_HELPER_NAME)
    {
        apply_main();
    }

    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

fn init_logging(verbose: bool, logging: Option<&LoggingConfig>) {
    let default_level = match (verbose, logging) {
        (true, _) => "debug",
        (false, Some(logging)) => logging.level.as_str(),
        (false, None) => "info",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // stdout carries command output (`wrap`, `run`); logs go to stderr.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.is_some_and(|l| l.json) {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn async_main(cli: Cli) -> Result<()> {
    // `config` and `paths` must work before a config file exists.
    let config = match cli.command {
        Commands::Config(_) | Commands::Paths => None,
        _ => Some(Config::load()?),
    };
    init_logging(cli.verbose, config.as_ref().map(|c| &c.logging));
    let config = config.unwrap_or_default();

    match cli.command {
        Commands::Status => cli::sandbox::run_status(&config).await,
        Commands::Wrap(args) => cli::sandbox::run_wrap(&config, args).await,
        Commands::Run(args) => cli::sandbox::run_command(&config, args).await,
        Commands::Test => cli::sandbox::run_test(&config).await,
        Commands::Violations(args) => cli::sandbox::run_violations(&config, args).await,
        Commands::Config(args) => cli::config::run(args).await,
        Commands::Paths => cli::paths::run(),
    }
}
