use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::schedule::Schedule;

/// Complete application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// Node-specific settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub id: String,
    /// Post-workload settling delay before the lease is released.
    #[serde(default = "default_grace_period", deserialize_with = "duration::required")]
    pub grace_period: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            grace_period: default_grace_period(),
        }
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_address")]
    pub address: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            address: default_redis_address(),
            password: String::new(),
            db: 0,
            key_prefix: default_key_prefix(),
        }
    }
}

impl RedisConfig {
    /// Connection URL for the redis client.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.address, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.address, self.db)
        }
    }
}

/// A scheduled job. Immutable after load.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub command: String,
    #[serde(default, deserialize_with = "duration::optional")]
    pub timeout: Option<Duration>,
    #[serde(default, deserialize_with = "duration::optional")]
    pub lock_ttl: Option<Duration>,
    #[serde(default)]
    pub work_dir: Option<String>,
    /// Overlaid on the process environment; overrides win on collision.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub on_success: Option<String>,
    #[serde(default)]
    pub on_failure: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl JobConfig {
    /// Whether the job should be scheduled. Defaults to true when unset.
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_redis_address() -> String {
    "localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "cronlock:".to_string()
}

impl Config {
    /// Load a configuration file. YAML and TOML are supported, chosen by
    /// file extension. `${VAR}` and `${VAR:-default}` references are
    /// expanded before validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let mut config: Config = match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?,
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?,
            other => {
                return Err(Error::Config(format!("unsupported config format: {other:?}")));
            }
        };

        config.expand_env();
        config.validate()?;
        Ok(config)
    }

    fn expand_env(&mut self) {
        self.node.id = expand_env(&self.node.id);
        self.redis.address = expand_env(&self.redis.address);
        self.redis.password = expand_env(&self.redis.password);
        self.redis.key_prefix = expand_env(&self.redis.key_prefix);

        for job in &mut self.jobs {
            job.name = expand_env(&job.name);
            job.command = expand_env(&job.command);
            job.work_dir = job.work_dir.as_deref().map(expand_env);
            job.on_success = job.on_success.as_deref().map(expand_env);
            job.on_failure = job.on_failure.as_deref().map(expand_env);
            for value in job.env.values_mut() {
                *value = expand_env(value);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.redis.address.is_empty() {
            return Err(Error::Config("redis.address is required".to_string()));
        }
        if !(0..=15).contains(&self.redis.db) {
            return Err(Error::Config(format!(
                "redis.db must be between 0 and 15, got {}",
                self.redis.db
            )));
        }

        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (i, job) in self.jobs.iter().enumerate() {
            if job.name.is_empty() {
                return Err(Error::Config(format!("jobs[{i}].name is required")));
            }
            if let Some(prev) = seen.insert(&job.name, i) {
                return Err(Error::Config(format!(
                    "jobs[{i}].name {:?} is a duplicate of jobs[{prev}]",
                    job.name
                )));
            }
            if job.schedule.is_empty() {
                return Err(Error::Config(format!("jobs[{i}].schedule is required")));
            }
            Schedule::parse(&job.schedule)
                .map_err(|e| Error::Config(format!("jobs[{i}].schedule: {e}")))?;
            if job.command.is_empty() {
                return Err(Error::Config(format!("jobs[{i}].command is required")));
            }
        }

        Ok(())
    }
}

/// Expand `${NAME}` and `${NAME:-default}` references. `${NAME:-default}`
/// substitutes the default when the variable is unset or empty. Anything
/// else is left verbatim so shell fragments like `$HOME` pass through.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let reference = &after[..end];
                match reference.split_once(":-") {
                    Some((name, default)) => match std::env::var(name) {
                        Ok(value) if !value.is_empty() => out.push_str(&value),
                        _ => out.push_str(default),
                    },
                    None => out.push_str(&std::env::var(reference).unwrap_or_default()),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Serde helpers for duration fields, accepting either an integer number of
/// seconds or a string of `h`/`m`/`s` parts (`"90s"`, `"1h30m"`).
mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    fn convert<E: serde::de::Error>(raw: Raw) -> Result<Duration, E> {
        match raw {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => crate::schedule::parse_duration(&text).map_err(E::custom),
        }
    }

    pub fn required<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        convert(Raw::deserialize(deserializer)?)
    }

    pub fn optional<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<Raw>::deserialize(deserializer)?
            .map(convert)
            .transpose()
    }
}
