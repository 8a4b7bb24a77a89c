//! Binix Launcher
//!
//! Runs a launcher session against the simulated binder: spawns workers,
//! then crashes them one at a time so queued spawns drain into the freed slots.
//!
//! Usage: `binix-launcher [--config <file>] [--spawn <n>] [--capacity <n>]`

use std::env;
use std::process;
use std::sync::mpsc;
use std::time::Duration;

use binix_launcher::utils::ConfigError;
use binix_launcher::{
    AllocatorKey, LaunchedProcess, LauncherConfig, LauncherThread, NAME, SpawnRequest, VERSION,
};

const OUTCOME_TIMEOUT: Duration = Duration::from_secs(2);
const USAGE: &str = "usage: binix-launcher [--config <file>] [--spawn <n>] [--capacity <n>]";

#[derive(Debug, Default)]
struct CliArgs {
    config: Option<String>,
    spawn: usize,
    capacity: Option<usize>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CliArgs, String> {
    let mut cli = CliArgs {
        spawn: 4,
        ..CliArgs::default()
    };
    while let Some(arg) = args.next() {
        let mut value = |name: &str| args.next().ok_or_else(|| format!("{} needs a value", name));
        match arg.as_str() {
            "--config" => cli.config = Some(value("--config")?),
            "--spawn" => {
                let raw = value("--spawn")?;
                cli.spawn = raw.parse().map_err(|_| format!("invalid --spawn: {}", raw))?;
            }
            "--capacity" => {
                let raw = value("--capacity")?;
                cli.capacity =
                    Some(raw.parse().map_err(|_| format!("invalid --capacity: {}", raw))?);
            }
            "-h" | "--help" => {
                return Err(USAGE.to_string());
            }
            other => return Err(format!("unknown argument: {}", other)),
        }
    }
    Ok(cli)
}

fn load_config(cli: &CliArgs) -> Result<LauncherConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => LauncherConfig::from_file(path)?,
        None => LauncherConfig::default(),
    };
    config.apply_env(|key| env::var(key).ok())?;
    if let Some(capacity) = cli.capacity {
        config.sandboxed_capacity = capacity;
        config.validate()?;
    }
    Ok(config)
}

fn main() {
    env_logger::init();

    let cli = match parse_args(env::args().skip(1)) {
        Ok(cli) => cli,
        Err(message) => {
            eprintln!("{}", message);
            process::exit(2);
        }
    };
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run_session(config, cli.spawn) {
        eprintln!("❌ Launcher session failed: {}", e);
        process::exit(1);
    }
}

fn run_session(config: LauncherConfig, spawn: usize) -> Result<(), Box<dyn std::error::Error>> {
    println!("🚀 {} v{}", NAME, VERSION);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let key = AllocatorKey::sandboxed(config.host_package.clone());
    let capacity = config.capacity_for(&key.package_name, true);
    let (launcher, device) = LauncherThread::simulated(config)?;
    println!("✅ Launcher thread started ({} sandboxed slots)", capacity);

    let (tx, outcomes) = mpsc::channel::<binix_launcher::Result<LaunchedProcess>>();
    for n in 0..spawn {
        let tx = tx.clone();
        let request = SpawnRequest::new(key.clone())
            .with_args(["binix-worker", "--type=renderer"])
            .with_child_process_id(n as i32)
            .with_callback(move |outcome| {
                let _ = tx.send(outcome);
            });
        launcher.run_blocking(move |l| l.launch(request))??;
    }

    let pending = {
        let key = key.clone();
        launcher.run_blocking(move |l| l.pending_spawns_count(&key))?
    };
    println!("📦 Submitted {} spawns, {} waiting for a slot", spawn, pending);

    let mut running = Vec::new();
    let mut launched = 0;
    for _ in 0..spawn.min(capacity) {
        running.push(receive(&outcomes)?);
        launched += 1;
    }

    // Each crash frees a slot for the oldest waiting spawn.
    while launched < spawn {
        let victim = running.remove(0);
        println!("💥 Crashing pid {} on {}", victim.pid, victim.connection);
        device.crash_pid(victim.pid);
        running.push(receive(&outcomes)?);
        launched += 1;
    }

    let connected = launcher.run_blocking(|l| l.connected_services_count())?;
    let terminated = launcher.run_blocking(|l| l.terminated_connections().count())?;
    println!(
        "📊 {} workers launched, {} alive, {} terminated",
        launched, connected, terminated
    );

    launcher.shutdown();
    println!("👋 Launcher stopped");
    Ok(())
}

fn receive(
    outcomes: &mpsc::Receiver<binix_launcher::Result<LaunchedProcess>>,
) -> Result<LaunchedProcess, Box<dyn std::error::Error>> {
    let launched = outcomes.recv_timeout(OUTCOME_TIMEOUT)??;
    println!(
        "   • slot {} -> pid {}",
        launched.service_number(),
        launched.pid
    );
    Ok(launched)
}
