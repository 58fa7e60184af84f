use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use eventd_core::severity::is_critical_target;
use jiff::Zoned;
use lettre::message::Message;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::config::{DaemonConfig, EmailsConfig};

/// Combines a daily-rotating file sink with an SMTP sink gated at ERROR and above,
/// mirroring the source's `logging.handlers.TimedRotatingFileHandler` +
/// `CustomSMTPHandler` pair. Installed once as the process-wide `log::Log`
/// implementor; there is no per-plugin logger object, only per-target routing,
/// matching the "no global mutable singleton, explicit registry" redesign note —
/// the registry here is just the `target:` string every call site already carries.
pub struct DaemonLogger {
    level: LevelFilter,
    file: Mutex<RotatingFile>,
    mailer: Option<EmailSink>,
    /// When `logMode = 1`, plugin-namespaced records are routed to their own
    /// rotating file under `log_dir` instead of the root log, lazily opened on
    /// first use. `None` when `logMode = 0` (single root log for everything).
    per_plugin: Option<PerPluginFiles>,
}

struct PerPluginFiles {
    dir: PathBuf,
    files: Mutex<HashMap<String, RotatingFile>>,
}

/// Targets in this crate are one of: the literal `"engine"`, a bare plugin name
/// (`Plugin`/`PluginCollection` emit `target: &plugin_name`), or a callback logger
/// name `plugin.<pluginName>.<callbackName>` (from a callback-failure CRITICAL log).
/// Returns the owning plugin name for the latter two, `None` for `"engine"`.
fn plugin_name_from_target(target: &str) -> Option<&str> {
    if target == "engine" {
        return None;
    }
    match target.strip_prefix("plugin.") {
        Some(rest) => rest.split('.').next(),
        None => Some(target),
    }
}

struct RotatingFile {
    path: PathBuf,
    backlog: usize,
    day: u64,
    handle: File,
}

struct EmailSink {
    transport: SmtpTransport,
    from: String,
    to: Vec<String>,
    subject_prefix: String,
}

impl DaemonLogger {
    pub fn init(daemon: &DaemonConfig, emails: Option<&EmailsConfig>) -> anyhow::Result<()> {
        let log_path = daemon.log_path.as_deref().map(|base| base.join(&daemon.log_file)).unwrap_or_else(|| daemon.log_file.clone());
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = RotatingFile::open(log_path, 10)?;

        let mailer = emails.map(EmailSink::new).transpose()?;

        let per_plugin = if daemon.log_mode_per_plugin {
            let dir = daemon.log_path.clone().unwrap_or_else(|| {
                log_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."))
            });
            fs::create_dir_all(&dir)?;
            Some(PerPluginFiles { dir, files: Mutex::new(HashMap::new()) })
        } else {
            None
        };

        let logger = DaemonLogger { level: daemon.logging, file: Mutex::new(file), mailer, per_plugin };
        log::set_max_level(logger.level);
        log::set_boxed_logger(Box::new(logger)).map_err(|e| anyhow::anyhow!("logger already installed: {e}"))?;
        Ok(())
    }
}

impl RotatingFile {
    fn open(path: PathBuf, backlog: usize) -> anyhow::Result<Self> {
        let handle = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, backlog, day: current_day(), handle })
    }

    fn write_line(&mut self, line: &str) {
        let today = current_day();
        if today != self.day {
            self.rotate();
            self.day = today;
        }
        let _ = writeln!(self.handle, "{line}");
    }

    /// Renames `log` -> `log.1` -> `log.2` ... dropping anything past the backlog,
    /// then reopens a fresh file at the base path. Best-effort: a failure here is not
    /// allowed to bring down logging itself.
    fn rotate(&mut self) {
        for generation in (1..self.backlog).rev() {
            let from = numbered(&self.path, generation);
            let to = numbered(&self.path, generation + 1);
            let _ = fs::rename(&from, &to);
        }
        let _ = fs::rename(&self.path, numbered(&self.path, 1));
        if let Ok(handle) = OpenOptions::new().create(true).append(true).open(&self.path) {
            self.handle = handle;
        }
    }
}

fn numbered(path: &Path, generation: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

fn current_day() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() / 86_400).unwrap_or(0)
}

impl EmailSink {
    fn new(config: &EmailsConfig) -> anyhow::Result<Self> {
        let mut builder = SmtpTransport::relay(&config.server)?;
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        Ok(Self {
            transport: builder.build(),
            from: config.from.clone(),
            to: config.to.clone(),
            subject_prefix: config.subject.clone(),
        })
    }

    fn send(&self, severity: &str, body: &str) {
        for recipient in &self.to {
            let message = Message::builder()
                .from(self.from.parse().expect("configured from-address must be valid"))
                .to(recipient.parse().expect("configured recipient must be valid"))
                .subject(format!("{severity} - {}", self.subject_prefix))
                .body(body.to_owned());
            let Ok(message) = message else { continue };
            if let Err(e) = self.transport.send(&message) {
                eprintln!("eventd: failed to send alert email to {recipient}: {e}");
            }
        }
    }
}

impl Log for DaemonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let target = record.target();
        let critical = is_critical_target(target);
        let base_target = target.strip_suffix(eventd_core::severity::CRITICAL_SUFFIX).unwrap_or(target);

        let line = format!(
            "{} {} {} {}:{} - {}",
            Zoned::now(),
            record.level(),
            base_target,
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args(),
        );
        let routed_to_plugin = self.per_plugin.as_ref().is_some_and(|per_plugin| {
            let Some(plugin_name) = plugin_name_from_target(base_target) else { return false };
            let Ok(mut files) = per_plugin.files.lock() else { return false };
            if !files.contains_key(plugin_name) {
                match RotatingFile::open(per_plugin.dir.join(format!("{plugin_name}.log")), 10) {
                    Ok(file) => {
                        files.insert(plugin_name.to_owned(), file);
                    }
                    Err(_) => return false,
                }
            }
            files.get_mut(plugin_name).unwrap().write_line(&line);
            true
        });
        if !routed_to_plugin {
            if let Ok(mut file) = self.file.lock() {
                file.write_line(&line);
            }
        }

        if record.level() == Level::Error {
            if let Some(mailer) = &self.mailer {
                let severity = if critical { "CRITICAL" } else { "ERROR" };
                mailer.send(severity, &line);
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.handle.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_target_has_no_owning_plugin() {
        assert_eq!(plugin_name_from_target("engine"), None);
    }

    #[test]
    fn bare_plugin_target_is_its_own_name() {
        assert_eq!(plugin_name_from_target("calculateCutDuration"), Some("calculateCutDuration"));
    }

    #[test]
    fn callback_logger_target_resolves_to_its_plugin() {
        assert_eq!(plugin_name_from_target("plugin.calculateCutDuration.onShotChange"), Some("calculateCutDuration"));
    }
}

