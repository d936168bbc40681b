//! rootsmith - builds verified Alpine + k3s root filesystem templates.
//!
//! Pipeline: fetch the Alpine minirootfs and the k3s binary into a
//! content-addressed cache, assemble and harden a root filesystem, then
//! package it with a manifest and checksums and validate the result.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

use commands::build::BuildRequest;
use rootsmith::error::{exit_code, exit_code_of};
use rootsmith::CancelToken;

#[derive(Parser)]
#[command(name = "rootsmith")]
#[command(about = "Alpine + k3s root filesystem template builder")]
#[command(
    after_help = "QUICK START:\n  rootsmith preflight          Check the host\n  rootsmith build --package    Build and package a template\n  rootsmith validate FILE      Check an artifact"
)]
struct Cli {
    /// Build configuration (YAML or JSON)
    #[arg(short, long, global = true, default_value = "rootsmith.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the root filesystem
    Build {
        /// Package the result after a successful build
        #[arg(long)]
        package: bool,

        /// Package, then validate the artifact
        #[arg(long)]
        validate: bool,

        /// Include the functional (boot) check when validating
        #[arg(long, requires = "validate")]
        functional: bool,
    },

    /// Package an existing build root
    Package {
        /// Build root to package (default: build.build_root from the config)
        #[arg(long)]
        build_root: Option<PathBuf>,
    },

    /// Validate a packaged artifact
    Validate {
        artifact: PathBuf,

        /// Boot k3s inside the template and wait for a Ready node
        #[arg(long)]
        functional: bool,

        /// Fail instead of skipping when the host cannot run the functional check
        #[arg(long)]
        require_functional: bool,

        /// Functional check timeout in seconds
        #[arg(short, long, default_value = "180")]
        timeout: u64,
    },

    /// Manage the image cache
    Cache {
        #[command(subcommand)]
        what: CacheCommand,
    },

    /// Run preflight checks against this host
    Preflight {
        /// Fail if any checks fail
        #[arg(long)]
        strict: bool,
    },

    /// Show the resolved configuration
    Show,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Remove old entries, then oldest-first until under the size limit
    Evict {
        #[arg(long)]
        max_age_days: Option<u64>,

        #[arg(long)]
        max_size_mb: Option<u64>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load .env before overrides are collected
    dotenvy::dotenv().ok();
    init_tracing();

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted; cancelling after the current stage...");
            on_signal.cancel();
        }
    });

    let config = cli.config;
    let result = tokio::task::spawn_blocking(move || match cli.command {
        Commands::Build {
            package,
            validate,
            functional,
        } => commands::cmd_build(
            BuildRequest {
                config_path: &config,
                package,
                validate,
                functional,
            },
            cancel,
        ),
        Commands::Package { build_root } => commands::cmd_package(&config, build_root.as_deref()),
        Commands::Validate {
            artifact,
            functional,
            require_functional,
            timeout,
        } => commands::cmd_validate(&artifact, functional, require_functional, timeout),
        Commands::Cache {
            what: CacheCommand::Evict {
                max_age_days,
                max_size_mb,
            },
        } => commands::cmd_cache_evict(&config, max_age_days, max_size_mb),
        Commands::Preflight { strict } => commands::cmd_preflight(&config, strict),
        Commands::Show => commands::cmd_show_config(&config),
    })
    .await;

    match result {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            error!("{:#}", err);
            let code = exit_code_of(&*err);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
        Err(join) => {
            error!("build task aborted: {}", join);
            ExitCode::from(exit_code::FAILURE as u8)
        }
    }
}
