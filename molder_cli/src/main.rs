mod cli;
mod jsonl;
mod rt;
mod run;

use clap::Parser;
use cli::{Cli, Commands, FILE_GUARD};
use eyre::WrapErr;
use std::fs;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

fn init_logging(json: bool, level: &str, logging: &molder_config::Logging) {
    let level = logging.level.as_deref().unwrap_or(level);
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let console = if json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    let file_layer = logging.file.as_deref().map(|path| {
        let p = std::path::Path::new(path);
        let dir = p.parent().unwrap_or_else(|| std::path::Path::new("."));
        let name = p.file_name().unwrap_or_else(|| std::ffi::OsStr::new("molder.log"));
        let appender = match logging.rotation.as_deref() {
            Some("daily") => tracing_appender::rolling::daily(dir, name),
            Some("hourly") => tracing_appender::rolling::hourly(dir, name),
            _ => tracing_appender::rolling::never(dir, name),
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        fmt::layer().json().with_writer(writer).with_ansi(false).boxed()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();
}

fn load_config(args: &Cli) -> eyre::Result<molder_config::Config> {
    let mut cfg = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .wrap_err_with(|| format!("reading config {}", path.display()))?;
            molder_config::load_toml(&text)
                .wrap_err_with(|| format!("parsing config {}", path.display()))?
        }
        None => molder_config::Config::default(),
    };
    if let Some(path) = &args.spec_limits {
        let text = fs::read_to_string(path)
            .wrap_err_with(|| format!("reading spec limits {}", path.display()))?;
        let limits = molder_config::load_spec_limits(&text)?;
        cfg.spc.limits.extend(limits);
    }
    molder_config::validate(&cfg)?;
    Ok(cfg)
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let args = Cli::parse();
    let cfg = load_config(&args)?;
    init_logging(args.json, &args.log_level, &cfg.logging);

    match args.cmd {
        Commands::Run {
            cycles,
            direct,
            cold_start,
            cycle_log,
            no_advisor,
            rt,
            rt_prio,
            rt_lock,
            rt_cpu,
        } => {
            let report = run::run_production(
                &cfg,
                run::RunOpts {
                    cycles,
                    direct,
                    cold_start,
                    cycle_log,
                    no_advisor,
                    rt,
                    rt_prio,
                    rt_lock,
                    rt_cpu,
                },
            )?;
            if args.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "completed": report.completed,
                        "rejected": report.rejected,
                        "faults": report.faults,
                    })
                );
            } else {
                println!(
                    "completed {} cycle(s), {} rejected, {} fault(s)",
                    report.completed, report.rejected, report.faults
                );
            }
        }
        Commands::CheckConfig => {
            if args.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "ok": true,
                        "velocity_stages": cfg.process.velocity_stages.len(),
                        "pack_stages": cfg.process.pack_stages.len(),
                        "spc_window": cfg.spc.window,
                        "spc_metrics_with_limits": cfg.spc.limits.len(),
                    })
                );
            } else {
                println!(
                    "config ok: {} velocity stage(s), {} pack stage(s), spc window {}",
                    cfg.process.velocity_stages.len(),
                    cfg.process.pack_stages.len(),
                    cfg.spc.window
                );
            }
        }
        Commands::SelfCheck => {
            run::self_check()?;
            println!("self-check ok");
        }
    }
    Ok(())
}
