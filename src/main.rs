//! Portolan - declarative network interface orchestrator
//!
//! Applies a JSON description of Linux network interfaces (physical links,
//! bridges, VLANs and WireGuard tunnels) in dependency order, with policy
//! routing tables, firewall rules and rollback on failure.

mod api;
mod cli;
mod error;
mod firewall;
mod manager;
mod manifest;
mod namespace;
mod netconfig;
mod plugin;
mod routing;
mod shell;
mod store;

use cli::{Cli, Commands};
use error::{Error, ErrorDescriptor, Result};
use manager::ConfigManager;
use netconfig::NetworkConfiguration;
use plugin::PluginContext;
use shell::SystemRunner;

use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Exit code when a configuration was rejected
const EXIT_REJECTED: i32 = 2;
/// Exit code when nothing has been applied yet
const EXIT_NO_ACTIVE: i32 = 4;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "portolan=debug" } else { "portolan=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn read_candidate(path: &Path) -> Result<NetworkConfiguration> {
    let content = std::fs::read_to_string(path)?;
    Ok(NetworkConfiguration::from_json(&content)?)
}

fn print_errors(errors: &[ErrorDescriptor], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&api::SetConfigResponse { errors: errors.to_vec() })?);
        return Ok(());
    }
    for e in errors {
        let location = match (&e.interface, &e.field) {
            (Some(intf), Some(field)) => format!("{}.{}: ", intf, field),
            (Some(intf), None) => format!("{}: ", intf),
            (None, Some(field)) => format!("{}: ", field),
            (None, None) => String::new(),
        };
        eprintln!("  {}{}", location, e.message);
    }
    Ok(())
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    if let Commands::Completion { shell } = cli.command {
        Cli::generate_completion(shell);
        return Ok(());
    }

    init_tracing(cli.verbose);

    if cli.command.mutates_kernel() && !nix::unistd::geteuid().is_root() {
        return Err(Error::environment("all", "applying a configuration requires root privileges"));
    }

    let settings = manifest::load_or_default(&cli.config)?;
    let runner = Arc::new(SystemRunner::new(&settings.throttle));
    let ctx = PluginContext::new(runner, settings);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    rt.block_on(async {
        match cli.command {
            Commands::Check { file } => {
                let candidate = read_candidate(&file)?;
                let manager = ConfigManager::new(ctx);
                let errors = manager.validate_config(&candidate);
                if errors.is_empty() {
                    println!("Configuration is valid ({} interfaces)", candidate.interfaces.len());
                } else {
                    eprintln!("Configuration is invalid:");
                    print_errors(&errors, false)?;
                    std::process::exit(EXIT_REJECTED);
                }
            }

            Commands::Plan { file, json } => {
                let candidate = read_candidate(&file)?;
                let manager = ConfigManager::open(ctx).await?;
                let errors = manager.validate_config(&candidate);
                if !errors.is_empty() {
                    print_errors(&errors, json)?;
                    std::process::exit(EXIT_REJECTED);
                }

                let steps = manager.plan(&candidate).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&steps)?);
                } else if steps.is_empty() {
                    println!("Nothing to do");
                } else {
                    for step in &steps {
                        println!("{:<8} {}", step.operation, step.interface);
                    }
                }
            }

            Commands::Apply { file, json } => {
                let candidate = read_candidate(&file)?;
                let manager = ConfigManager::open(ctx).await?;
                let response = api::set_config(&manager, candidate).await;
                tracing::debug!(outcome = ?manager.last_outcome(), "Apply pass finished");
                if response.is_ok() {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&response)?);
                    } else {
                        println!("Configuration applied");
                    }
                } else {
                    if !json {
                        eprintln!("Configuration rejected:");
                    }
                    print_errors(&response.errors, json)?;
                    std::process::exit(EXIT_REJECTED);
                }
            }

            Commands::Active => {
                let manager = ConfigManager::open(ctx).await?;
                match api::get_active(&manager).await {
                    Some(active) => println!("{}", serde_json::to_string_pretty(&active)?),
                    None => {
                        eprintln!("No active configuration");
                        std::process::exit(EXIT_NO_ACTIVE);
                    }
                }
            }

            Commands::State { json } => {
                let manager = ConfigManager::open(ctx).await?;
                let states = manager.interface_states().await;
                if json {
                    println!("{}", serde_json::to_string_pretty(&states)?);
                } else {
                    println!("{:<16} {:<10} {:<8} {:<8} {:<19} {:<6} NAMESPACE", "NAME", "KIND", "ENABLED", "STATE", "MAC", "MTU");
                    for s in &states {
                        println!(
                            "{:<16} {:<10} {:<8} {:<8} {:<19} {:<6} {}",
                            s.name,
                            s.kind,
                            s.enabled,
                            s.operstate.as_deref().unwrap_or(if s.present { "unknown" } else { "absent" }),
                            s.mac.as_deref().unwrap_or("-"),
                            s.mtu.map(|m| m.to_string()).unwrap_or_else(|| "-".into()),
                            s.namespace.as_deref().unwrap_or("-"),
                        );
                    }
                }
            }

            Commands::Completion { .. } => unreachable!(),
        }
        Ok::<(), Error>(())
    })
}
