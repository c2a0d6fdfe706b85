pub mod watch;

use crate::acl::MembershipErrorPolicy;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use rust_embed::RustEmbed;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};

#[derive(RustEmbed)]
#[folder = "src/conf/defaults/"]
struct EmbeddedConfigFS;

const DEFAULT_CONFIG_FILE: &str = "pacer.toml";

/// Searched when the user does not pass a config path.
const DEFAULT_CONFIG_PATHS: &[&str] = &["/etc/pacer/pacer.toml"];

const ENV_PREFIX: &str = "PACER_";

#[derive(Deserialize, Serialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub general: General,
    pub controller: Controller,
    pub store: Store,
    pub provider: Provider,
    pub acl: Acl,
}

#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Deserialize, Serialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct General {
    /// Turns on human readable log output and extra debug logging. Usually turned on along side
    /// log_level=debug.
    pub dev_mode: bool,
    pub log_level: String,
    pub log_format: LogFormat,

    /// In seconds.
    pub config_watch_interval: u64,
}

#[derive(Deserialize, Serialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Controller {
    pub workers: usize,

    /// Global ceiling on running executions per repository. 0 disables it.
    pub max_concurrency: u64,

    /// In seconds.
    pub resync_interval: u64,

    /// In milliseconds.
    pub max_backoff: u64,

    pub conflict_retries: u32,
}

impl Controller {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff)
    }

    pub fn retry_config(&self) -> crate::store::RetryConfig {
        crate::store::RetryConfig {
            max_retries: self.conflict_retries,
            ..Default::default()
        }
    }
}

#[derive(Deserialize, Serialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Store {
    pub engine: crate::store::Engine,
    pub sqlite: Option<crate::store::sqlite::Config>,
}

#[derive(Deserialize, Serialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub kind: crate::provider::Kind,

    /// Defaults to the public API of the chosen provider.
    pub api_url: Option<String>,
    pub token: String,

    /// Request timeout in seconds.
    pub timeout: u64,
}

/// Authorization settings. All of these can change while the controller runs.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    pub ok_to_test_regex: String,
    pub owners_file: String,
    pub membership_error_policy: MembershipErrorPolicy,
}

impl Default for Acl {
    fn default() -> Self {
        Self {
            ok_to_test_regex: crate::acl::DEFAULT_OK_TO_TEST_REGEX.into(),
            owners_file: crate::acl::DEFAULT_OWNERS_FILE.into(),
            membership_error_policy: MembershipErrorPolicy::default(),
        }
    }
}

/// Returns the embedded default configuration file.
fn default_config() -> Result<String, figment::Error> {
    let file = EmbeddedConfigFS::get(DEFAULT_CONFIG_FILE)
        .ok_or_else(|| figment::Error::from(format!("embedded {DEFAULT_CONFIG_FILE} is missing")))?;

    String::from_utf8(file.data.into_owned())
        .map_err(|e| figment::Error::from(format!("embedded {DEFAULT_CONFIG_FILE} is not utf-8; {e}")))
}

impl Config {
    /// Layers the configuration sources. Later sources win: embedded defaults, then the config file (the
    /// override if given, otherwise the default search paths), then `PACER_` environment variables where `__`
    /// separates nesting levels (`PACER_CONTROLLER__WORKERS=8`).
    pub fn figment(path_override: Option<&str>) -> Result<Figment, figment::Error> {
        let mut figment = Figment::new().merge(Toml::string(&default_config()?));

        match path_override {
            Some(path) => figment = figment.merge(Toml::file(path)),
            None => {
                for path in DEFAULT_CONFIG_PATHS {
                    figment = figment.merge(Toml::file(path));
                }
            }
        }

        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn parse(path_override: Option<&str>) -> Result<Self, figment::Error> {
        Self::figment(path_override)?.extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    #[test]
    /// The embedded defaults parse on their own and describe a working setup.
    fn parse_default_config() {
        Jail::expect_with(|_jail| {
            let config = Config::parse(Some("does-not-exist.toml"))?;

            assert_eq!(
                config.general,
                General {
                    dev_mode: true,
                    log_level: "info".into(),
                    log_format: LogFormat::Pretty,
                    config_watch_interval: 30,
                }
            );
            assert_eq!(config.controller.workers, 4);
            assert_eq!(config.controller.max_concurrency, 0);
            assert_eq!(config.store.engine, crate::store::Engine::Sqlite);
            assert_eq!(config.provider.kind, crate::provider::Kind::None);
            assert_eq!(config.acl.owners_file, "OWNERS");
            assert_eq!(
                config.acl.membership_error_policy,
                MembershipErrorPolicy::FallThrough
            );
            assert_eq!(
                config.acl.ok_to_test_regex,
                r"(?i)(^|\n)/ok-to-test(\r?\n|$)"
            );

            Ok(())
        });
    }

    #[test]
    /// Files override defaults and environment variables override files.
    fn layering_order() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "pacer.toml",
                r#"
                [controller]
                workers = 8
                max_concurrency = 3

                [provider]
                kind = "gitlab"
                "#,
            )?;
            jail.set_env("PACER_CONTROLLER__WORKERS", "16");
            jail.set_env("PACER_ACL__MEMBERSHIP_ERROR_POLICY", "propagate");

            let config = Config::parse(Some("pacer.toml"))?;

            assert_eq!(config.controller.workers, 16);
            assert_eq!(config.controller.max_concurrency, 3);
            assert_eq!(config.controller.resync_interval, 300);
            assert_eq!(config.provider.kind, crate::provider::Kind::Gitlab);
            assert_eq!(
                config.acl.membership_error_policy,
                MembershipErrorPolicy::Propagate
            );

            Ok(())
        });
    }
}
