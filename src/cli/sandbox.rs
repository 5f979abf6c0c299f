use anyhow::Result;
use clap::Args;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::Config;
use crate::sandbox::violations::read_log;
use crate::sandbox::{
    AskHandle, ChannelAskCallback, CommandOutput, ManagerSettings, NetworkMode, NetworkOptions,
    PendingDecision, PlatformInfo, SandboxLevel, SandboxManager, ViolationKind, run_wrapped,
};

#[derive(Args)]
pub struct WrapArgs {
    /// Command to wrap, as one argument
    pub command: String,

    /// Directory made writable for this command only
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Task id the command is attributed to
    #[arg(long, default_value = "cli")]
    pub task: String,
}

#[derive(Args)]
pub struct RunArgs {
    /// Command to run, as one argument
    pub command: String,

    /// Working directory (default: current directory); writable for this command
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Task id the command is attributed to
    #[arg(long, default_value = "cli")]
    pub task: String,

    /// Timeout in seconds (default: sandbox.timeout_secs)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Deny hosts outside the allow-list instead of prompting
    #[arg(long)]
    pub no_ask: bool,
}

#[derive(Args)]
pub struct ViolationsArgs {
    /// Only show entries for this task
    #[arg(long)]
    pub task: Option<String>,

    /// Only show the most recent N entries
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,

    /// Print JSON lines
    #[arg(long)]
    pub json: bool,
}

fn build_manager(config: &Config) -> Result<SandboxManager> {
    Ok(SandboxManager::new(ManagerSettings::from_config(config))?)
}

fn absolute(dir: &Path) -> Result<PathBuf> {
    if dir.is_absolute() {
        Ok(dir.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(dir))
    }
}

pub async fn run_status(config: &Config) -> Result<()> {
    let info = PlatformInfo::detect();
    let caps = &info.capabilities;
    let sandbox = &config.sandbox;

    println!("Platform:    {}", info.platform);
    println!();
    println!("Sandbox Capabilities:");
    for line in caps.status_lines() {
        println!("{}", line);
    }
    println!();

    let effective = if info.is_supported() {
        caps.effective_level(&sandbox.level)
    } else {
        SandboxLevel::None
    };
    println!("Configuration:");
    println!("  Enabled:     {}", sandbox.enabled);
    println!("  Level:       {} (config: {})", effective, sandbox.level);
    println!("  Shell:       {}", sandbox.shell);
    println!("  Timeout:     {}s", sandbox.timeout_secs);
    println!("  Network:     {}", config.get_value("sandbox.network.mode")?);
    if !sandbox.network.allowed_hosts.is_empty() {
        println!("  Allowed:     {}", sandbox.network.allowed_hosts.join(", "));
    }
    if !sandbox.network.denied_hosts.is_empty() {
        println!("  Denied:      {}", sandbox.network.denied_hosts.join(", "));
    }
    if !sandbox.filesystem.allow_write.is_empty() {
        println!("  Extra write: {:?}", sandbox.filesystem.allow_write);
    }
    if !sandbox.filesystem.allow_read.is_empty() {
        println!("  Read roots:  {:?}", sandbox.filesystem.allow_read);
    }

    let filters_dir = config.paths.filters_dir();
    let cached = std::fs::read_dir(&filters_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                .count()
        })
        .unwrap_or(0);
    println!();
    println!("State:");
    println!("  Filters:     {} in {}", cached, filters_dir.display());
    if sandbox.violations.persist {
        let logged = read_log(&config.paths.violation_log())?.len();
        println!("  Violations:  {} logged", logged);
    }

    Ok(())
}

pub async fn run_wrap(config: &Config, args: WrapArgs) -> Result<()> {
    if !config.sandbox.enabled {
        println!("{}", args.command);
        return Ok(());
    }

    let manager = build_manager(config)?;
    if !manager.initialize(config.sandbox.to_options()).await {
        eprintln!("shellfence: sandboxing unavailable; printing the command unchanged");
    }

    let cwd = args.cwd.as_deref().map(absolute).transpose()?;
    let wrapped = manager.wrap_command(&args.task, &args.command, cwd.as_deref());
    if manager.proxy_port().is_some() {
        eprintln!(
            "shellfence: the network proxy exits with this process, so outbound \
             connections from this command will fail; use `shellfence run` for network access"
        );
    }
    println!("{}", wrapped);

    manager.shutdown().await;
    Ok(())
}

/// Answer host prompts from the terminal.
async fn prompt_loop(mut rx: mpsc::Receiver<PendingDecision>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(pending) = rx.recv().await {
        eprint!(
            "shellfence: allow network access to {}:{}? [y/N] ",
            pending.request.host, pending.request.port
        );
        let allow = match lines.next_line().await {
            Ok(Some(answer)) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            _ => false,
        };
        pending.respond(allow);
    }
}

pub async fn run_command(config: &Config, args: RunArgs) -> Result<()> {
    let cwd = match args.cwd.as_deref() {
        Some(dir) => absolute(dir)?,
        None => std::env::current_dir()?,
    };

    let manager = build_manager(config)?;
    let mut options = config.sandbox.to_options();
    if !args.no_ask && std::io::stdin().is_terminal() {
        let (callback, rx) = ChannelAskCallback::new(8);
        options.ask_callback = Some(AskHandle::new(callback));
        tokio::spawn(prompt_loop(rx));
    }

    if !config.sandbox.enabled || !manager.initialize(options).await {
        warn!("Sandboxing inactive; running command unrestricted");
    }

    let wrapped = manager.wrap_command(&args.task, &args.command, Some(&cwd));
    let timeout = Duration::from_secs(args.timeout.unwrap_or(config.sandbox.timeout_secs));
    let output = run_wrapped(&wrapped, Some(&cwd), timeout).await?;

    print!("{}", output.stdout);
    eprint!("{}", output.stderr);

    if !output.success() {
        manager.record_command_failure(&args.task, &args.command, &output.stderr);
    }
    let violations = manager.violations().list(Some(&args.task));
    if !violations.is_empty() {
        eprintln!("shellfence: {} violation(s):", violations.len());
        for entry in &violations {
            eprintln!("  {:<8} {}", entry.kind.as_str(), entry.resource);
        }
    }

    manager.cleanup_after_task(&args.task);
    manager.shutdown().await;

    // The prompt task may be parked on a blocking stdin read; exit directly.
    let code = if output.timed_out {
        eprintln!("shellfence: {}", output.stderr);
        124
    } else {
        output.exit_code.unwrap_or(1)
    };
    std::process::exit(code);
}

pub async fn run_violations(config: &Config, args: ViolationsArgs) -> Result<()> {
    let path = config.paths.violation_log();
    let mut entries = read_log(&path)?;
    if let Some(task) = &args.task {
        entries.retain(|e| e.task_id.as_deref() == Some(task.as_str()));
    }
    if let Some(limit) = args.limit {
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
    }

    if entries.is_empty() {
        if !args.json {
            println!("No violations recorded in {}", path.display());
        }
        return Ok(());
    }

    for entry in &entries {
        if args.json {
            println!("{}", serde_json::to_string(entry)?);
        } else {
            println!(
                "{}  {:<8} {:<12} {}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.kind.as_str(),
                entry.task_id.as_deref().unwrap_or("-"),
                entry.resource
            );
        }
    }

    Ok(())
}

enum Outcome {
    Pass(String),
    Fail(String),
    Skip(String),
}

fn expect_denied(output: &CommandOutput) -> Outcome {
    if output.exit_code == Some(127) {
        Outcome::Skip("command not installed".to_string())
    } else if output.success() {
        Outcome::Fail("command succeeded, expected denial".to_string())
    } else {
        Outcome::Pass("denied".to_string())
    }
}

fn expect_success(output: &CommandOutput, needle: &str) -> Outcome {
    if output.success() && output.stdout.contains(needle) {
        Outcome::Pass("ok".to_string())
    } else {
        Outcome::Fail(format!(
            "exit={:?}, stderr={}",
            output.exit_code,
            output.stderr.trim().chars().take(100).collect::<String>()
        ))
    }
}

pub async fn run_test(config: &Config) -> Result<()> {
    let manager = build_manager(config)?;

    if !config.sandbox.enabled || manager.level() == SandboxLevel::None {
        println!("Sandbox is disabled or no kernel support available.");
        println!("Skipping enforcement tests.");
        return Ok(());
    }

    // Deterministic network rules: nothing allowed, nobody asked.
    let mut options = config.sandbox.to_options();
    options.network = NetworkOptions {
        mode: Some(NetworkMode::AllowList),
        ..Default::default()
    };
    if !manager.initialize(options).await {
        println!("Sandbox could not be initialized; rerun with --verbose for details.");
        return Ok(());
    }

    let workdir = std::env::temp_dir().join(format!(
        "shellfence-smoke-{}",
        uuid::Uuid::new_v4().simple()
    ));
    std::fs::create_dir_all(&workdir)?;
    let dir: &Path = &workdir;
    let protected = config.paths.filters_dir().join("smoke-test");
    let task = "smoke-test";
    let timeout = Duration::from_secs(15);

    println!("Running sandbox smoke tests...");
    println!("  Level:   {}", manager.level());
    println!("  Workdir: {}", dir.display());
    println!();

    let run = |command: &str| {
        let wrapped = manager.wrap_command(task, command, Some(dir));
        async move { run_wrapped(&wrapped, Some(dir), timeout).await }
    };

    let mut results: Vec<(&str, Outcome)> = Vec::new();

    let out = run("echo hello").await?;
    results.push(("Echo command succeeds", expect_success(&out, "hello")));

    let out = run("touch ok && ls ok").await?;
    results.push(("Write in working dir", expect_success(&out, "ok")));

    let out = run("touch /shellfence-smoke-deny").await?;
    results.push(("Write outside allowed paths", expect_denied(&out)));

    let out = run(&format!("touch {}", shell_words::quote(&protected.to_string_lossy()))).await?;
    results.push(("Write to shellfence state", expect_denied(&out)));

    let out = run("ls ~/.ssh/").await?;
    let outcome = if out.stderr.contains("No such file") {
        Outcome::Skip("no ~/.ssh".to_string())
    } else {
        expect_denied(&out)
    };
    results.push(("Read ~/.ssh", outcome));

    let out = run("curl -s -o /dev/null --max-time 5 https://example.com").await?;
    let recorded = manager
        .violations()
        .list(Some(task))
        .iter()
        .any(|e| e.kind == ViolationKind::Network && e.resource == "example.com");
    let outcome = match expect_denied(&out) {
        Outcome::Pass(_) if recorded => Outcome::Pass("blocked by proxy, violation recorded".to_string()),
        Outcome::Pass(_) => Outcome::Fail("denied, but no violation recorded".to_string()),
        other => other,
    };
    results.push(("Unlisted host via proxy", outcome));

    let outcome = if manager.level() < SandboxLevel::Full {
        Outcome::Skip(format!("level {} does not pin outbound TCP", manager.level()))
    } else {
        let out = run("curl -s -o /dev/null --noproxy '*' --max-time 5 https://example.com").await?;
        expect_denied(&out)
    };
    results.push(("Direct connection bypassing proxy", outcome));

    let start = Instant::now();
    let wrapped = manager.wrap_command(task, "sleep 30", Some(dir));
    let out = run_wrapped(&wrapped, Some(dir), Duration::from_secs(2)).await?;
    let outcome = if out.timed_out {
        Outcome::Pass(format!("killed after {:.1}s", start.elapsed().as_secs_f64()))
    } else {
        Outcome::Fail("command was not killed".to_string())
    };
    results.push(("Timeout enforcement", outcome));

    manager.cleanup_after_task(task);
    manager.cleanup_filters();
    manager.shutdown().await;
    if let Err(e) = std::fs::remove_dir_all(&workdir) {
        warn!("Failed to remove {}: {}", workdir.display(), e);
    }

    let total = results.len();
    let mut failed = 0;
    for (i, (name, outcome)) in results.iter().enumerate() {
        let label = format!("[{}/{}] {}:", i + 1, total, name);
        match outcome {
            Outcome::Pass(msg) => println!("  {:<42} {}", label, msg),
            Outcome::Skip(msg) => println!("  {:<42} skipped ({})", label, msg),
            Outcome::Fail(msg) => {
                failed += 1;
                println!("  {:<42} FAIL ({})", label, msg);
            }
        }
    }

    println!();
    if failed == 0 {
        println!("All {} tests passed.", total);
    } else {
        println!("{} passed, {} failed.", total - failed, failed);
    }

    Ok(())
}
