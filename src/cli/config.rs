use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::config::{Config, LIST_KEYS};
use crate::paths::Paths;
use crate::sandbox::policy::{ProcessDefaults, build_runtime_config};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show config.toml, or the policy a manager would build from it
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,

        /// Print the effective sandbox policy (built-in defaults merged in)
        #[arg(long)]
        effective: bool,
    },

    /// Get a value (e.g. sandbox.level, sandbox.network.mode,
    /// sandbox.network.allowed_hosts)
    Get { key: String },

    /// Set a scalar value (e.g. sandbox.network.mode deny-list)
    Set { key: String, value: String },

    /// Add a path or host pattern to a list
    /// (e.g. sandbox.filesystem.allow_write ~/src)
    Add { key: String, value: String },

    /// Remove a path or host pattern from a list
    Remove { key: String, value: String },

    /// Show config file path
    Path,

    /// Write the default config.toml
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format, effective } => {
            if effective {
                show_effective()
            } else {
                show_config(&format)
            }
        }
        ConfigCommands::Get { key } => get_config(&key),
        ConfigCommands::Set { key, value } => set_config(&key, &value),
        ConfigCommands::Add { key, value } => edit_list(&key, &value, true),
        ConfigCommands::Remove { key, value } => edit_list(&key, &value, false),
        ConfigCommands::Path => show_path(),
        ConfigCommands::Init { force } => init_config(force),
    }
}

fn show_config(format: &str) -> Result<()> {
    let config = Config::load()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        _ => println!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

fn show_effective() -> Result<()> {
    let config = Config::load()?;
    let defaults = ProcessDefaults::detect(&config.paths.protected_dirs());
    let policy = build_runtime_config(&config.sandbox.to_options(), &defaults)?;

    fn section(title: &str, paths: &[PathBuf]) {
        println!("{}:", title);
        if paths.is_empty() {
            println!("  (none)");
        }
        for path in paths {
            println!("  {}", path.display());
        }
    }

    let fs = &policy.filesystem;
    section("allow_write", &fs.allow_write);
    section("allow_read", &fs.allow_read);
    section("deny_write", &fs.deny_write);
    section("deny_read", &fs.deny_read);

    let net = &policy.network;
    println!("network: {}", serde_json::to_value(net.mode)?.as_str().unwrap_or_default());
    println!("  allowed: {}", net.allowed_hosts.join(", "));
    println!("  denied: {}", net.denied_hosts.join(", "));
    println!("  ask timeout: {}ms", net.ask_timeout.as_millis());

    Ok(())
}

fn get_config(key: &str) -> Result<()> {
    let config = Config::load()?;
    println!("{}", config.get_value(key)?);
    Ok(())
}

fn set_config(key: &str, value: &str) -> Result<()> {
    if LIST_KEYS.contains(&key) {
        anyhow::bail!("{} is a list; use `shellfence config add|remove`", key);
    }
    let mut config = Config::load()?;
    config.set_value(key, value)?;
    config.save()?;
    println!("Set {} = {}", key, value);
    Ok(())
}

fn edit_list(key: &str, value: &str, add: bool) -> Result<()> {
    let mut config = Config::load()?;
    let changed = if add {
        config.add_entry(key, value)?
    } else {
        config.remove_entry(key, value)?
    };

    match (changed, add) {
        (true, true) => println!("Added {} to {}", value, key),
        (true, false) => println!("Removed {} from {}", value, key),
        (false, true) => println!("{} already contains {}", key, value),
        (false, false) => println!("{} does not contain {}", key, value),
    }
    if changed {
        config.save()?;
    }
    Ok(())
}

fn show_path() -> Result<()> {
    println!("{}", Config::config_path()?.display());
    Ok(())
}

fn init_config(force: bool) -> Result<()> {
    let mut config = Config::default();
    config.paths = Paths::resolve()?;
    let path = config.paths.config_file();

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    config.save_with_template()?;
    println!("Wrote {}", path.display());
    Ok(())
}
