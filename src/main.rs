//! CLI entry point: parses arguments, wires up logging, and dispatches to
//! the library's sync/command/server flows.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::LevelFilter;
use tokio::net::TcpStream;

use bo::cli::{Cli, Command, ConfigAction, RemoteAction};
use bo::config::{BoConfig, WorkdirConfig, WorkspaceConfig};
use bo::inventory::{FileEntryUpdate, Inventory, SyncState};
use bo::{scanner, Acceptor, ClientSession};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("[ERROR] (1) {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Config { action } => config_command(action),
        Command::Sync { server } => sync_command(server.as_deref()).await,
        Command::Remote { action } => match action {
            RemoteAction::Run { argv } => remote_run(&argv).await,
        },
        Command::Server { port } => server_command(port).await,
        Command::Alias(args) => alias_command(args).await,
    }
}

fn current_workdir_key() -> Result<String> {
    let cwd = std::env::current_dir().context("reading current directory")?;
    Ok(cwd.to_string_lossy().to_string())
}

fn config_command(action: ConfigAction) -> Result<()> {
    let mut cfg = BoConfig::load()?;
    let workdir = current_workdir_key()?;

    match action {
        ConfigAction::Init { host, port, target_dir } => {
            let cache_path = cfg
                .cache_path_for(&workdir, &target_dir, &host)?
                .to_string_lossy()
                .to_string();
            let entry = cfg.workdirs.entry(workdir.clone()).or_default();
            entry.servers.insert(
                host.clone(),
                WorkspaceConfig {
                    host,
                    port,
                    target_dir,
                    cache_path,
                },
            );
            cfg.save()?;
            println!("configured workdir {workdir}");
        }
        ConfigAction::Deinit => {
            cfg.workdirs.remove(&workdir);
            cfg.save()?;
            println!("removed workdir {workdir}");
        }
        ConfigAction::Command { name, argv } => {
            let entry = cfg.workdirs.entry(workdir).or_insert_with(WorkdirConfig::default);
            entry.commands.insert(name, argv);
            cfg.save()?;
        }
        ConfigAction::RemoveCommand { name } => {
            if let Some(entry) = cfg.workdirs.get_mut(&workdir) {
                entry.commands.remove(&name);
                cfg.save()?;
            }
        }
        ConfigAction::Ls => {
            for (workdir, wc) in &cfg.workdirs {
                println!("{workdir}");
                for (host, server) in &wc.servers {
                    println!("  server {host}: {}:{} -> {}", server.host, server.port, server.target_dir);
                }
                for (name, argv) in &wc.commands {
                    println!("  command {name}: {}", argv.join(" "));
                }
            }
        }
        ConfigAction::Path => {
            println!("{}", bo::config::config_file_path()?.display());
        }
    }
    Ok(())
}

fn resolve_server<'a>(wc: &'a WorkdirConfig, server: Option<&str>) -> Result<&'a WorkspaceConfig> {
    match server {
        Some(name) => wc
            .servers
            .get(name)
            .ok_or_else(|| anyhow!("no server named '{name}' configured for this workdir")),
        None => wc
            .servers
            .values()
            .next()
            .ok_or_else(|| anyhow!("no server configured for this workdir")),
    }
}

async fn sync_command(server: Option<&str>) -> Result<()> {
    let cfg = BoConfig::load()?;
    let cwd = std::env::current_dir().context("reading current directory")?;
    let (_, wc) = cfg
        .find_workdir(&cwd)
        .ok_or_else(|| anyhow!("{} is not a configured workdir; run 'bo config init' first", cwd.display()))?;
    let server_cfg = resolve_server(wc, server)?;

    let cache_path = Path::new(&server_cfg.cache_path);
    let mut inventory = Inventory::load(cache_path)?;
    let changed = scanner::rescan(&cwd, &mut inventory)?;
    log::info!("rescan classified {changed} path(s)");
    inventory.save(cache_path)?;

    let pending = inventory.pending_entries();
    let stream = TcpStream::connect((server_cfg.host.as_str(), server_cfg.port))
        .await
        .with_context(|| format!("connecting to {}:{}", server_cfg.host, server_cfg.port))?;
    let (r, w) = stream.into_split();
    let mut client = ClientSession::new(r, w);
    let report = client
        .sync(&server_cfg.target_dir, 65536, &pending, &cwd)
        .await?;

    for path in report.deleted.iter().chain(report.updated.iter()) {
        inventory.update(path, FileEntryUpdate::required_sync(SyncState::None))?;
    }
    inventory.save(cache_path)?;

    println!(
        "synced: {} deleted, {} updated",
        report.deleted.len(),
        report.updated.len()
    );
    Ok(())
}

async fn run_remote(target_dir: &str, sub_dir: &str, host: &str, port: u16, argv: &[String]) -> Result<()> {
    if argv.is_empty() {
        bail!("no command given");
    }
    let stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connecting to {host}:{port}"))?;
    let (r, w) = stream.into_split();
    let mut client = ClientSession::new(r, w);
    let code = client
        .run_command(target_dir, sub_dir, argv, |line| println!("{line}"))
        .await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn remote_run(argv: &[String]) -> Result<()> {
    let cfg = BoConfig::load()?;
    let cwd = std::env::current_dir().context("reading current directory")?;
    let (_, wc) = cfg
        .find_workdir(&cwd)
        .ok_or_else(|| anyhow!("{} is not a configured workdir; run 'bo config init' first", cwd.display()))?;
    let server_cfg = resolve_server(wc, None)?;
    run_remote(&server_cfg.target_dir, "", &server_cfg.host, server_cfg.port, argv).await
}

async fn alias_command(args: Vec<String>) -> Result<()> {
    let name = args.first().ok_or_else(|| anyhow!("missing command name"))?;
    let cfg = BoConfig::load()?;
    let cwd = std::env::current_dir().context("reading current directory")?;
    let (_, wc) = cfg
        .find_workdir(&cwd)
        .ok_or_else(|| anyhow!("{} is not a configured workdir; run 'bo config init' first", cwd.display()))?;
    let argv = wc
        .commands
        .get(name)
        .ok_or_else(|| anyhow!("'{name}' is not a known command or alias"))?;
    let server_cfg = resolve_server(wc, None)?;
    run_remote(&server_cfg.target_dir, "", &server_cfg.host, server_cfg.port, argv).await
}

async fn server_command(port: u16) -> Result<()> {
    let bind_addr = format!("0.0.0.0:{port}");
    let acceptor = Acceptor::bind(&bind_addr).await?;
    acceptor.serve().await
}
