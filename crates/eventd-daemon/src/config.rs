use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use ini::Ini;

/// `[daemon]` section: process and log plumbing.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub pid_file: PathBuf,
    pub event_id_file: PathBuf,
    pub log_file: PathBuf,
    pub log_path: Option<PathBuf>,
    /// `false` = single root log file, `true` = one log file per plugin.
    pub log_mode_per_plugin: bool,
    pub logging: log::LevelFilter,
    pub max_conn_retries: u32,
    pub conn_retry_sleep: Duration,
    pub fetch_interval: Duration,
}

/// `[shotgun]` section: the event source's connection parameters.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub server: String,
    pub name: String,
    pub key: String,
    pub use_session_uuid: bool,
}

/// `[plugins]` section.
#[derive(Clone, Debug)]
pub struct PluginsConfig {
    pub paths: Vec<PathBuf>,
}

/// `[emails]` section.
#[derive(Clone, Debug)]
pub struct EmailsConfig {
    pub server: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub source: SourceConfig,
    pub plugins: PluginsConfig,
    pub emails: EmailsConfig,
}

/// Resolves the configuration file location: an explicit `--config` flag wins,
/// then the `EVENTD_CONFIG_PATH` environment variable, falling back to the
/// compile-time default path `/etc/eventd.conf`.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Ok(path) = std::env::var("EVENTD_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    PathBuf::from("/etc/eventd.conf")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let ini = Ini::load_from_file(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;

        let daemon = section(&ini, "daemon")?;
        let shotgun = section(&ini, "shotgun")?;
        let plugins = section(&ini, "plugins")?;
        let emails = section(&ini, "emails")?;

        Ok(Config {
            daemon: DaemonConfig {
                pid_file: PathBuf::from(required(daemon, "pidFile")?),
                event_id_file: PathBuf::from(required(daemon, "eventIdFile")?),
                log_file: PathBuf::from(required(daemon, "logFile")?),
                log_path: optional(daemon, "logPath").map(PathBuf::from),
                log_mode_per_plugin: optional(daemon, "logMode").map(|v| v == "1").unwrap_or(false),
                logging: optional(daemon, "logging")
                    .map(|v| level_from_int(&v))
                    .transpose()?
                    .unwrap_or(log::LevelFilter::Info),
                max_conn_retries: optional(daemon, "max_conn_retries")
                    .map(|v| v.parse())
                    .transpose()
                    .context("max_conn_retries must be an integer")?
                    .unwrap_or(3),
                conn_retry_sleep: Duration::from_secs(
                    optional(daemon, "conn_retry_sleep")
                        .map(|v| v.parse())
                        .transpose()
                        .context("conn_retry_sleep must be an integer number of seconds")?
                        .unwrap_or(60),
                ),
                fetch_interval: Duration::from_secs(
                    optional(daemon, "fetch_interval")
                        .map(|v| v.parse())
                        .transpose()
                        .context("fetch_interval must be an integer number of seconds")?
                        .unwrap_or(1),
                ),
            },
            source: SourceConfig {
                server: required(shotgun, "server")?,
                name: required(shotgun, "name")?,
                key: required(shotgun, "key")?,
                use_session_uuid: optional(shotgun, "use_session_uuid").map(|v| parse_bool(&v)).unwrap_or(false),
            },
            plugins: PluginsConfig {
                paths: required(plugins, "paths")?.split(',').map(|s| PathBuf::from(s.trim())).collect(),
            },
            emails: EmailsConfig {
                server: required(emails, "server")?,
                from: required(emails, "from")?,
                to: required(emails, "to")?.split(',').map(|s| s.trim().to_owned()).collect(),
                subject: required(emails, "subject")?,
                username: optional(emails, "username"),
                password: optional(emails, "password"),
            },
        })
    }
}

type SectionRef<'a> = &'a ini::Properties;

fn section<'a>(ini: &'a Ini, name: &str) -> Result<SectionRef<'a>> {
    ini.section(Some(name))
        .with_context(|| format!("configuration file is missing the [{name}] section"))
}

fn required(section: SectionRef<'_>, key: &str) -> Result<String> {
    section
        .get(key)
        .map(str::to_owned)
        .with_context(|| format!("configuration is missing required key \"{key}\""))
}

fn optional(section: SectionRef<'_>, key: &str) -> Option<String> {
    section.get(key).map(str::to_owned)
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn level_from_int(value: &str) -> Result<log::LevelFilter> {
    // Mirrors the Python `logging` module's integer levels, coarsened to `log`'s
    // five-level scheme.
    let level: i32 = value.parse().context("logging level must be an integer")?;
    Ok(match level {
        l if l >= 50 => log::LevelFilter::Error,
        l if l >= 40 => log::LevelFilter::Error,
        l if l >= 30 => log::LevelFilter::Warn,
        l if l >= 20 => log::LevelFilter::Info,
        l if l >= 10 => log::LevelFilter::Debug,
        l if l > 0 => log::LevelFilter::Trace,
        0 => log::LevelFilter::Off,
        _ => bail!("logging level must be non-negative"),
    })
}
