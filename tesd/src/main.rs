use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use tesd::config::Config;
use tesd::coordinator;
use tesd::daemon::{self, ReadySignal};
use tesd::hdf5::{Converter, ExternalConverter, NullConverter};
use tesd::ifring::{RingBackend, Rings};
use tesd::task::{
    avgtr::AvgTrTask, capture::CaptureTask, coinc::CoincTask, coinccount::CoincCountTask,
    hist::HistTask, info::InfoTask, jitter::JitterTask, TaskLogic, TaskSet,
};

#[cfg(target_os = "linux")]
const DEFAULT_IFNAME: &str = "netmap:eth0";
#[cfg(not(target_os = "linux"))]
const DEFAULT_IFNAME: &str = "netmap:igb0";

/// Acquisition server for the TES readout electronics chain.
#[derive(Parser, Debug)]
#[command(name = "tesd", version)]
struct Cli {
    /// Task configuration directory; empty disables saving config.
    #[arg(short = 'c', long, default_value = "/var/lib/tesd/config/")]
    confdir: String,

    /// Write the daemon pid to this file; empty disables.
    #[arg(short = 'p', long, default_value = "/var/run/tesd.pid")]
    pidfile: String,

    /// Read packets from this interface.
    #[arg(short = 'i', long, default_value = DEFAULT_IFNAME)]
    interface: String,

    /// Run in the foreground.
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Log statistics every that many seconds; 0 disables. Defaults to
    /// 1 in the foreground and 0 as a daemon.
    #[arg(short = 'U', long)]
    stats_period: Option<u64>,

    /// Drop privileges to this uid after opening the interface.
    #[arg(short = 'u', long, default_value_t = 0)]
    setuid: u32,

    /// Drop privileges to this gid after opening the interface.
    #[arg(short = 'g', long, default_value_t = 0)]
    setgid: u32,

    /// Print debugging messages.
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn init_logging(cli: &Cli, cfg: &Config) {
    let default_filter = if cli.verbose { "debug" } else { "info" };
    let env = env_logger::Env::default().default_filter_or(default_filter);
    let mut builder = env_logger::Builder::from_env(env);
    if !cli.foreground {
        // stdio points at /dev/null once daemonized
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.logging.file)
        {
            Ok(f) => {
                builder.target(env_logger::Target::Pipe(Box::new(f)));
            }
            Err(e) => eprintln!("cannot open log file {}: {e}", cfg.logging.file.display()),
        }
    }
    builder.init();
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let ready = if cli.foreground {
        None
    } else {
        let pidfile =
            if cli.pidfile.is_empty() { None } else { Some(PathBuf::from(&cli.pidfile)) };
        match daemon::daemonize(pidfile.as_deref(), daemon::DEFAULT_TIMEOUT) {
            Ok(sig) => Some(sig),
            Err(e) => {
                eprintln!("cannot daemonize: {e}");
                return std::process::ExitCode::FAILURE;
            }
        }
    };

    let confdir =
        if cli.confdir.is_empty() { None } else { Some(PathBuf::from(&cli.confdir)) };
    let cfg = Config::load(confdir.as_deref());
    init_logging(&cli, &cfg);

    match run(&cli, cfg, confdir, ready) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn run(
    cli: &Cli,
    cfg: Config,
    confdir: Option<PathBuf>,
    ready: Option<ReadySignal>,
) -> anyhow::Result<()> {
    let stats_period = cli
        .stats_period
        .unwrap_or(if cli.foreground { 1 } else { 0 });

    #[cfg(target_os = "linux")]
    {
        use tesd::ifring::netmap::{prepare_if, NetmapBackend};

        let backend = NetmapBackend::open(&cli.interface)
            .with_context(|| format!("cannot open interface {}", cli.interface))?;
        prepare_if(&cli.interface)
            .with_context(|| format!("cannot bring up interface {}", cli.interface))?;

        daemon::drop_privileges(cli.setuid, cli.setgid)
            .context("cannot drop privileges")?;

        // created after the privilege drop so the daemon owns them
        if let Some(dir) = &confdir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
        }
        std::fs::create_dir_all(&cfg.capture.data_root)
            .with_context(|| format!("cannot create {}", cfg.capture.data_root.display()))?;

        serve(backend, cfg, confdir, stats_period, ready)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (cfg, confdir, stats_period, ready);
        anyhow::bail!("no ring backend for this platform")
    }
}

fn task_list(cfg: &Config, confdir: Option<&Path>) -> Vec<Box<dyn TaskLogic>> {
    let converter: Arc<dyn Converter> = if cfg.capture.hdf5_converter.as_os_str().is_empty() {
        Arc::new(NullConverter)
    } else {
        Arc::new(ExternalConverter::new(cfg.capture.hdf5_converter.clone()))
    };
    vec![
        Box::new(CaptureTask::new(
            cfg.capture.data_root.clone(),
            cfg.capture.single_file,
            cfg.capture.drop_bad_frames,
            cfg.mca.size_mode(),
            converter,
        )),
        Box::new(HistTask::new(cfg.mca.size_mode())),
        Box::new(InfoTask::new()),
        Box::new(AvgTrTask::new()),
        Box::new(JitterTask::new(confdir.map(Path::to_path_buf))),
        Box::new(CoincTask::new(confdir.map(Path::to_path_buf))),
        Box::new(CoincCountTask::new()),
    ]
}

fn serve<B: RingBackend>(
    backend: B,
    cfg: Config,
    confdir: Option<PathBuf>,
    stats_period: u64,
    ready: Option<ReadySignal>,
) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot build the coordinator runtime")?;

    rt.block_on(async {
        let rings = Arc::new(Rings::new(backend));
        let logics = task_list(&cfg, confdir.as_deref());
        let (tasks, monitor) = TaskSet::start(&rings, logics, cfg.mca.size_mode()).await?;

        if let Some(ready) = ready {
            ready.ok();
        }

        let shutdown = async {
            let mut sigterm = tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            )
            .ok();
            tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("interrupted"),
                _ = async {
                    match sigterm.as_mut() {
                        Some(s) => { s.recv().await; }
                        None => std::future::pending().await,
                    }
                } => log::info!("terminated"),
            }
        };

        coordinator::run(
            rings,
            tasks,
            monitor,
            std::time::Duration::from_secs(stats_period),
            shutdown,
        )
        .await
    })
}
