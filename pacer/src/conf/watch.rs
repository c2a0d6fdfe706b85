use super::{Acl, Config};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The settings that take effect without a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotSettings {
    pub acl: Acl,
    pub max_concurrency: u64,
}

impl From<&Config> for HotSettings {
    fn from(config: &Config) -> Self {
        Self {
            acl: config.acl.clone(),
            max_concurrency: config.controller.max_concurrency,
        }
    }
}

/// Periodically re-reads the configuration sources and publishes hot settings when they change.
#[derive(Debug)]
pub struct ConfigWatcher {
    path_override: Option<String>,
    interval: Duration,
    sender: watch::Sender<HotSettings>,
}

impl ConfigWatcher {
    pub fn new(
        config: &Config,
        path_override: Option<String>,
    ) -> (Self, watch::Receiver<HotSettings>) {
        let (sender, receiver) = watch::channel(HotSettings::from(config));

        let watcher = Self {
            path_override,
            interval: Duration::from_secs(config.general.config_watch_interval.max(1)),
            sender,
        };

        (watcher, receiver)
    }

    #[cfg(test)]
    fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs until `cancel` fires. `started` is signalled once the loop is running so callers can wait for the
    /// watcher before depending on its channel.
    pub async fn run(self, started: oneshot::Sender<()>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // The first tick completes immediately and the current settings are already published.
        ticker.tick().await;

        if started.send(()).is_err() {
            debug!("nobody is waiting for the config watcher to start");
        }

        info!(interval_secs = self.interval.as_secs(), "config watcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("config watcher stopped");
                    return;
                }
                _ = ticker.tick() => self.reload().await,
            }
        }
    }

    async fn reload(&self) {
        let path_override = self.path_override.clone();

        let parsed =
            match tokio::task::spawn_blocking(move || Config::parse(path_override.as_deref()))
                .await
            {
                Ok(parsed) => parsed,
                Err(e) => {
                    error!(error = %e, "config reload task failed");
                    return;
                }
            };

        let config = match parsed {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "could not re-read configuration; keeping current settings");
                return;
            }
        };

        let settings = HotSettings::from(&config);

        if let Err(e) = regex::Regex::new(&settings.acl.ok_to_test_regex) {
            warn!(error = %e, regex = settings.acl.ok_to_test_regex,
                "ignoring configuration change with invalid ok-to-test regex");
            return;
        }

        let changed = self.sender.send_if_modified(|current| {
            if *current == settings {
                return false;
            }

            *current = settings.clone();
            true
        });

        if changed {
            info!(max_concurrency = settings.max_concurrency,
                owners_file = settings.acl.owners_file,
                membership_error_policy = %settings.acl.membership_error_policy,
                "hot settings changed");
        }
    }
}
