//! Command line and environment configuration for the namewatch daemon.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::context::WatchSettings;
use crate::profile::GroupId;
use crate::storage::{db_path, resolve_data_dir};

pub(crate) const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Watches chat group members for profile changes and reports them to an
/// admin.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug, Default)]
#[command(name = "namewatch", version, about)]
pub struct Cli {
    /// SQLite database file [env: NAMEWATCH_DB] [default: $NAMEWATCH_HOME/namewatch.db]
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Chat id that receives notifications and may run admin commands [env: NAMEWATCH_ADMIN_ID]
    #[arg(long, short = 'a')]
    pub admin_id: Option<i64>,

    /// Base URL of the platform bridge [env: NAMEWATCH_PLATFORM_URL]
    #[arg(long, short = 'p')]
    pub platform_url: Option<String>,

    /// Bearer token for the platform bridge [env: NAMEWATCH_PLATFORM_TOKEN]
    #[arg(long)]
    pub platform_token: Option<String>,

    /// Admin HTTP bind address [env: NAMEWATCH_BIND] [default: 127.0.0.1:8080]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Seconds between scheduled scans [env: NAMEWATCH_SCAN_INTERVAL] [default: 60]
    #[arg(long)]
    pub scan_interval_secs: Option<u64>,

    /// Initial groups, comma separated `id[:title]` [env: NAMEWATCH_GROUPS]
    #[arg(long, short = 'g')]
    pub groups: Option<String>,

    /// Missed scans before a membership is marked inactive [env: NAMEWATCH_MISS_THRESHOLD] [default: 3]
    #[arg(long)]
    pub miss_threshold: Option<u32>,

    /// Failed scans before a group is dropped or reported [env: NAMEWATCH_FAILURE_THRESHOLD] [default: 3]
    #[arg(long)]
    pub failure_threshold: Option<u32>,

    /// Groups fetched concurrently [env: NAMEWATCH_FETCH_CONCURRENCY] [default: 4]
    #[arg(long)]
    pub fetch_concurrency: Option<usize>,

    /// Messages allowed per rate window [env: NAMEWATCH_RATE_MESSAGES] [default: 20]
    #[arg(long)]
    pub rate_messages: Option<u32>,

    /// Rate window in seconds [env: NAMEWATCH_RATE_WINDOW] [default: 60]
    #[arg(long)]
    pub rate_window_secs: Option<u64>,

    /// Outbound queue capacity [env: NAMEWATCH_QUEUE_CAPACITY] [default: 256]
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// First retry delay in milliseconds [env: NAMEWATCH_BACKOFF_BASE_MS] [default: 1000]
    #[arg(long)]
    pub backoff_base_ms: Option<u64>,

    /// Longest retry delay in seconds [env: NAMEWATCH_BACKOFF_MAX] [default: 300]
    #[arg(long)]
    pub backoff_max_secs: Option<u64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// An initial group from `--groups`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSeed {
    pub group_id: GroupId,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub admin_id: i64,
    pub platform_url: String,
    pub platform_token: Option<String>,
    pub bind_addr: String,
    pub groups: Vec<GroupSeed>,
    pub settings: WatchSettings,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Result<Self, ConfigError> {
        Self::resolve(cli, |key| std::env::var(key).ok())
    }

    /// Resolve with an explicit environment lookup.
    pub fn resolve(cli: Cli, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let db_path = cli
            .db_path
            .or_else(|| env("NAMEWATCH_DB").map(PathBuf::from))
            .unwrap_or_else(|| match env("NAMEWATCH_HOME") {
                Some(home) => db_path(&PathBuf::from(home)),
                None => db_path(&resolve_data_dir()),
            });

        let admin_id = match cli.admin_id {
            Some(id) => id,
            None => parsed(&env, "NAMEWATCH_ADMIN_ID")?.ok_or(ConfigError::Missing("admin_id"))?,
        };

        let platform_url = cli
            .platform_url
            .or_else(|| env("NAMEWATCH_PLATFORM_URL"))
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::Missing("platform_url"))?;

        let platform_token = cli
            .platform_token
            .or_else(|| env("NAMEWATCH_PLATFORM_TOKEN"))
            .filter(|t| !t.is_empty());

        let bind_addr = cli
            .bind
            .or_else(|| env("NAMEWATCH_BIND"))
            .unwrap_or_else(|| DEFAULT_BIND.to_string());

        let groups = match cli.groups.or_else(|| env("NAMEWATCH_GROUPS")) {
            Some(list) => parse_groups(&list)?,
            None => Vec::new(),
        };

        let mut settings = WatchSettings::new(admin_id);
        if let Some(secs) = pick(cli.scan_interval_secs, &env, "NAMEWATCH_SCAN_INTERVAL")? {
            settings.scan_interval = Duration::from_secs(secs);
        }
        if let Some(n) = pick(cli.miss_threshold, &env, "NAMEWATCH_MISS_THRESHOLD")? {
            settings.scanner.miss_threshold = n;
        }
        if let Some(n) = pick(cli.failure_threshold, &env, "NAMEWATCH_FAILURE_THRESHOLD")? {
            settings.registry.failure_threshold = n;
        }
        if let Some(n) = pick(cli.fetch_concurrency, &env, "NAMEWATCH_FETCH_CONCURRENCY")? {
            settings.scanner.fetch_concurrency = n;
        }
        if let Some(n) = pick(cli.rate_messages, &env, "NAMEWATCH_RATE_MESSAGES")? {
            settings.notifier.rate_messages = n;
        }
        if let Some(secs) = pick(cli.rate_window_secs, &env, "NAMEWATCH_RATE_WINDOW")? {
            settings.notifier.rate_window = Duration::from_secs(secs);
        }
        if let Some(n) = pick(cli.queue_capacity, &env, "NAMEWATCH_QUEUE_CAPACITY")? {
            settings.notifier.queue_capacity = n;
        }
        if let Some(ms) = pick(cli.backoff_base_ms, &env, "NAMEWATCH_BACKOFF_BASE_MS")? {
            settings.notifier.backoff_base = Duration::from_millis(ms);
            settings.scanner.backoff_base = Duration::from_millis(ms);
        }
        if let Some(secs) = pick(cli.backoff_max_secs, &env, "NAMEWATCH_BACKOFF_MAX")? {
            settings.notifier.backoff_max = Duration::from_secs(secs);
            settings.scanner.backoff_max = Duration::from_secs(secs);
        }

        Ok(Self {
            db_path,
            admin_id,
            platform_url,
            platform_token,
            bind_addr,
            groups,
            settings,
        })
    }
}

fn parsed<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                name: key,
                value: raw,
            }),
    }
}

fn pick<T: FromStr>(
    cli: Option<T>,
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match cli {
        Some(value) => Ok(Some(value)),
        None => parsed(env, key),
    }
}

/// Parse `-100123:Main chat,-100456` into group seeds.
pub fn parse_groups(list: &str) -> Result<Vec<GroupSeed>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (id, title) = match item.split_once(':') {
                Some((id, title)) => (id.trim(), title.trim()),
                None => (item, ""),
            };
            let group_id = id.parse().map_err(|_| ConfigError::Invalid {
                name: "groups",
                value: item.to_string(),
            })?;
            Ok(GroupSeed {
                group_id,
                title: title.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn cli_takes_precedence_over_env() {
        let cli = Cli {
            admin_id: Some(1),
            platform_url: Some("http://cli".into()),
            scan_interval_secs: Some(30),
            ..Cli::default()
        };
        let env = env_of(&[
            ("NAMEWATCH_ADMIN_ID", "2"),
            ("NAMEWATCH_PLATFORM_URL", "http://env"),
            ("NAMEWATCH_SCAN_INTERVAL", "90"),
            ("NAMEWATCH_RATE_MESSAGES", "5"),
            ("NAMEWATCH_HOME", "/tmp/nw"),
            ("NAMEWATCH_BACKOFF_BASE_MS", "250"),
            ("NAMEWATCH_BACKOFF_MAX", "45"),
        ]);
        let config = Config::resolve(cli, env).unwrap();
        assert_eq!(config.admin_id, 1);
        assert_eq!(config.platform_url, "http://cli");
        assert_eq!(config.settings.scan_interval, Duration::from_secs(30));
        assert_eq!(config.settings.notifier.rate_messages, 5);
        assert_eq!(config.settings.notifier.admin_id, 1);
        assert_eq!(config.settings.scanner.backoff_base, Duration::from_millis(250));
        assert_eq!(config.settings.scanner.backoff_max, Duration::from_secs(45));
        assert_eq!(config.settings.notifier.backoff_max, Duration::from_secs(45));
        assert_eq!(config.db_path, PathBuf::from("/tmp/nw/namewatch.db"));
        assert_eq!(config.bind_addr, DEFAULT_BIND);
    }

    #[test]
    fn defaults_apply() {
        let env = env_of(&[
            ("NAMEWATCH_ADMIN_ID", "7"),
            ("NAMEWATCH_PLATFORM_URL", "http://bridge"),
        ]);
        let config = Config::resolve(Cli::default(), env).unwrap();
        assert_eq!(config.settings.scan_interval, Duration::from_secs(60));
        assert_eq!(config.settings.scanner.miss_threshold, 3);
        assert_eq!(config.settings.registry.failure_threshold, 3);
        assert_eq!(config.settings.notifier.queue_capacity, 256);
        assert!(config.groups.is_empty());
        assert!(config.platform_token.is_none());
    }

    #[test]
    fn missing_and_invalid_values_are_reported() {
        let err = Config::resolve(Cli::default(), env_of(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("admin_id"));

        let env = env_of(&[
            ("NAMEWATCH_ADMIN_ID", "7"),
            ("NAMEWATCH_PLATFORM_URL", "http://bridge"),
            ("NAMEWATCH_SCAN_INTERVAL", "soon"),
        ]);
        assert!(matches!(
            Config::resolve(Cli::default(), env),
            Err(ConfigError::Invalid { name: "NAMEWATCH_SCAN_INTERVAL", .. })
        ));
    }

    #[test]
    fn group_list_parses_ids_and_titles() {
        let groups = parse_groups("-100:Main chat, -200 ,").unwrap();
        assert_eq!(
            groups,
            vec![
                GroupSeed {
                    group_id: -100,
                    title: "Main chat".into()
                },
                GroupSeed {
                    group_id: -200,
                    title: String::new()
                },
            ]
        );
        assert!(parse_groups("abc").is_err());
    }
}
