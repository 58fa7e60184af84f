use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use eventd_core::engine::{Engine, EngineConfig};
use eventd_core::state_store::StateStore;
use eventd_core::PluginCollection;

mod config;
mod http_source;
mod logging;
mod plugin_loader;
mod process;

use config::Config;
use http_source::HttpEventSource;
use logging::DaemonLogger;
use plugin_loader::WasmPluginLoader;
use process::ProcessSupervisor;

/// Polls a project-tracking service's append-only event log and dispatches each new
/// event to hot-reloadable WASM plugins, in strict log order, with durable
/// checkpointing and per-plugin crash isolation.
#[derive(Parser)]
#[command(name = "eventd")]
struct Cli {
    /// Path to the INI configuration file (defaults to EVENTD_CONFIG_PATH or
    /// /etc/eventd.conf).
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    verb: Verb,
}

#[derive(Subcommand)]
enum Verb {
    /// Daemonize (double-fork into the background) and start the dispatch loop.
    Start,
    /// Stop a running daemon by reading its pid file.
    Stop,
    /// Stop, then start again.
    Restart,
    /// Run the dispatch loop in the foreground, without daemonizing.
    Foreground,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = config::resolve_config_path(cli.config);

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("eventd: {e:#}");
            return ExitCode::from(2);
        }
    };

    let result = match cli.verb {
        Verb::Start => run_start(&config),
        Verb::Stop => run_stop(&config),
        Verb::Restart => run_stop(&config).and_then(|()| run_start(&config)),
        Verb::Foreground => run_foreground(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("eventd: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_start(config: &Config) -> Result<()> {
    let supervisor = ProcessSupervisor::new(config.daemon.pid_file.clone());
    supervisor.ensure_not_already_running()?;
    supervisor.daemonize()?;
    supervisor.install_signal_handlers()?;
    run_loop(config, &supervisor)
}

fn run_foreground(config: &Config) -> Result<()> {
    let supervisor = ProcessSupervisor::new(config.daemon.pid_file.clone());
    supervisor.ensure_not_already_running()?;
    supervisor.write_pid_file_foreground()?;
    supervisor.install_signal_handlers()?;
    run_loop(config, &supervisor)
}

fn run_stop(config: &Config) -> Result<()> {
    let supervisor = ProcessSupervisor::new(config.daemon.pid_file.clone());
    supervisor.stop_running()
}

/// Shared body of `start` and `foreground`: initialize logging, build the engine
/// from configuration, bootstrap, and run until `should_continue` goes false.
/// Errors in this setup phase are fatal and are reported at CRITICAL (with email
/// delivery) before the pid file is cleaned up, matching the loop-setup failure
/// contract in the component design.
fn run_loop(config: &Config, supervisor: &ProcessSupervisor) -> Result<()> {
    let init_result = (|| -> Result<()> {
        DaemonLogger::init(&config.daemon, Some(&config.emails))?;

        let entity_source: Arc<dyn http_source::EntityLookup> = Arc::new(HttpEventSource::new(&config.source));
        let mut loader = WasmPluginLoader::new(entity_source);

        let collections: Vec<PluginCollection> =
            config.plugins.paths.iter().cloned().map(PluginCollection::new).collect();

        let engine_config = EngineConfig {
            max_conn_retries: config.daemon.max_conn_retries,
            conn_retry_sleep: config.daemon.conn_retry_sleep,
            fetch_interval: config.daemon.fetch_interval,
            use_session_uuid: config.source.use_session_uuid,
        };

        let state_store = StateStore::new(&config.daemon.event_id_file);
        let source = Box::new(HttpEventSource::new(&config.source));
        let mut engine = Engine::new(collections, source, state_store, engine_config);

        let should_continue = || supervisor.should_continue();
        engine.bootstrap(&mut loader, &should_continue)?;
        engine.run(&mut loader, &should_continue);
        Ok(())
    })();

    if let Err(e) = &init_result {
        eventd_core::critical!(target: "engine", "fatal error during daemon startup: {e:#}");
    }
    supervisor.cleanup();
    init_result
}
