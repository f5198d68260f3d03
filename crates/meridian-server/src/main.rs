//! Headless replication server.
//!
//! Loads `server.ron` (creating it on first run), applies CLI overrides,
//! ticks the server at `world.tick_rate`, autosaves when configured, and on
//! Ctrl-C disconnects everybody and writes the save. Edits to `server.ron`
//! while running are reported and take effect on the next start.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use meridian_config::{CliArgs, Config};
use meridian_replication::{PrefabRegistry, ReplicationError, Server};
use tokio::time::MissedTickBehavior;

fn config_dir(args: &CliArgs) -> PathBuf {
    args.config
        .clone()
        .or_else(Config::default_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Interval between ticks; a rate of 0 is treated as 1 Hz.
fn tick_period(tick_rate: u32) -> Duration {
    Duration::from_secs(1) / tick_rate.max(1)
}

fn autosave_period(config: &Config) -> Option<Duration> {
    (config.world.autosave_secs > 0).then(|| Duration::from_secs(config.world.autosave_secs))
}

const CONFIG_POLL: Duration = Duration::from_secs(5);

/// Last `server.ron` contents seen on disk, before CLI overrides.
struct ConfigWatch {
    dir: PathBuf,
    on_disk: Config,
}

impl ConfigWatch {
    fn new(dir: &Path, on_disk: Config) -> Self {
        Self {
            dir: dir.to_path_buf(),
            on_disk,
        }
    }

    /// Re-read the file; `true` the first time a given edit is seen.
    fn poll(&mut self) -> bool {
        match self.on_disk.reload(&self.dir) {
            Ok(Some(changed)) => {
                tracing::warn!(
                    dir = %self.dir.display(),
                    "server.ron changed, restart to apply"
                );
                self.on_disk = changed;
                true
            }
            Ok(None) => false,
            Err(err) => {
                tracing::debug!(%err, "config not re-read");
                false
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    let dir = config_dir(&args);
    let (mut config, config_error) = match Config::load_or_create(&dir) {
        Ok(config) => (config, None),
        Err(err) => (Config::default(), Some(err)),
    };
    let watch = config_error
        .is_none()
        .then(|| ConfigWatch::new(&dir, config.clone()));
    config.apply_cli_overrides(&args);

    meridian_log::init_logging(Some(&dir.join("logs")), cfg!(debug_assertions), Some(&config));
    if let Some(err) = config_error {
        tracing::warn!(dir = %dir.display(), %err, "config unreadable, using defaults");
    }

    let mut server = match Server::start(&config, PrefabRegistry::new()) {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(%err, "server failed to start");
            return ExitCode::FAILURE;
        }
    };

    match run(&mut server, &config, watch).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, kind = ?err.kind(), "server aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    server: &mut Server,
    config: &Config,
    mut watch: Option<ConfigWatch>,
) -> Result<(), ReplicationError> {
    let mut ticks = tokio::time::interval(tick_period(config.world.tick_rate));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut config_polls = tokio::time::interval(CONFIG_POLL);
    config_polls.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let autosave = autosave_period(config);
    let mut last_save = Instant::now();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(err) = result {
                    tracing::warn!(%err, "ctrl-c handler failed, stopping");
                }
                break;
            }
            _ = ticks.tick() => {
                server.update()?;
                if let Some(every) = autosave
                    && last_save.elapsed() >= every
                {
                    match server.save() {
                        Ok(records) => tracing::debug!(records, "autosaved"),
                        Err(err) => tracing::warn!(%err, "autosave failed"),
                    }
                    last_save = Instant::now();
                }
            }
            _ = config_polls.tick(), if watch.is_some() => {
                if let Some(watch) = watch.as_mut() {
                    watch.poll();
                }
            }
        }
    }

    tracing::info!("{}", server.info());
    server.stop()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_period() {
        assert_eq!(tick_period(50), Duration::from_millis(20));
        assert_eq!(tick_period(0), Duration::from_secs(1));
    }

    #[test]
    fn test_autosave_disabled_by_zero() {
        let mut config = Config::default();
        assert_eq!(autosave_period(&config), None);
        config.world.autosave_secs = 300;
        assert_eq!(autosave_period(&config), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_config_watch_reports_each_edit_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        let mut watch = ConfigWatch::new(dir.path(), config.clone());
        assert!(!watch.poll());

        let mut edited = config;
        edited.world.tick_rate = 60;
        edited.save(dir.path()).unwrap();
        assert!(watch.poll());
        assert!(!watch.poll());
        assert_eq!(watch.on_disk.world.tick_rate, 60);
    }

    #[test]
    fn test_config_watch_survives_a_removed_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        let mut watch = ConfigWatch::new(dir.path(), config);
        std::fs::remove_file(dir.path().join(meridian_config::CONFIG_FILE)).unwrap();
        assert!(!watch.poll());
    }

    #[test]
    fn test_explicit_config_dir_wins() {
        let args = CliArgs::parse_from(["meridian-server", "--config", "/srv/meridian"]);
        assert_eq!(config_dir(&args), PathBuf::from("/srv/meridian"));
    }
}
