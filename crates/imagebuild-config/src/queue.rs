//! Queue backing and supervisor configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// Overrides `queue.storage-root` and selects the embedded backing.
pub const STORAGE_ROOT_ENV: &str = "IMAGEBUILD_STORAGE_ROOT";
/// Overrides `queue.database-url` and selects the relational backing.
pub const DATABASE_URL_ENV: &str = "IMAGEBUILD_DATABASE_URL";

const DEFAULT_FILE_MODE: u32 = 0o600;

/// Where jobs are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backing {
    /// One JSON document per job under `storage_root`, created with
    /// permission bits `file_mode`.
    Embedded { storage_root: PathBuf, file_mode: u32 },
    /// PostgreSQL at `database_url`.
    Relational { database_url: String },
}

/// Tunables of the heartbeat supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Deliveries silent for longer than this are reclaimed.
    pub heartbeat_timeout: Duration,
    /// Workers not seen for longer than this are pruned.
    pub worker_timeout: Duration,
    /// Pause between supervisor passes.
    pub interval: Duration,
    /// Retry budget passed to `requeue_or_finish` for reclaimed jobs.
    pub max_retries: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(120),
            worker_timeout: Duration::from_secs(3600),
            interval: Duration::from_secs(30),
            max_retries: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub queue: Backing,
    pub supervisor: SupervisorConfig,
}

/// `queue` block fields before environment overrides.
#[derive(Debug, Default)]
struct QueueFields {
    storage_root: Option<PathBuf>,
    database_url: Option<String>,
    file_mode: Option<u32>,
}

/// Read a configuration file and apply environment overrides.
pub fn load_config(path: &Path) -> ConfigResult<Config> {
    let text = std::fs::read_to_string(path)?;
    parse_config(&text, |name| std::env::var(name).ok())
}

/// Parse configuration from KDL text. `env` looks up override variables.
///
/// Passing an empty document configures everything from the environment.
pub fn parse_config<F>(kdl: &str, env: F) -> ConfigResult<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let doc: KdlDocument = kdl.parse()?;

    let mut queue = None;
    let mut supervisor = None;
    for node in doc.nodes() {
        match node.name().value() {
            "queue" => {
                if queue.is_some() {
                    return Err(ConfigError::Duplicate("queue".to_string()));
                }
                queue = Some(parse_queue(node)?);
            }
            "supervisor" => {
                if supervisor.is_some() {
                    return Err(ConfigError::Duplicate("supervisor".to_string()));
                }
                supervisor = Some(parse_supervisor(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    let mut fields = queue.unwrap_or_default();
    apply_env(&mut fields, env)?;

    Ok(Config {
        queue: resolve_backing(fields)?,
        supervisor: supervisor.unwrap_or_default(),
    })
}

fn parse_queue(node: &KdlNode) -> ConfigResult<QueueFields> {
    let mut fields = QueueFields::default();
    let Some(children) = node.children() else {
        return Ok(fields);
    };

    for child in children.nodes() {
        match child.name().value() {
            "storage-root" => {
                let root = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("queue.storage-root".to_string()))?;
                fields.storage_root = Some(PathBuf::from(root));
            }
            "database-url" => {
                let url = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("queue.database-url".to_string()))?;
                fields.database_url = Some(url);
            }
            "file-mode" => {
                let mode = get_first_integer_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("queue.file-mode".to_string()))?;
                fields.file_mode = Some(file_mode(mode)?);
            }
            _ => {}
        }
    }
    Ok(fields)
}

fn parse_supervisor(node: &KdlNode) -> ConfigResult<SupervisorConfig> {
    let mut config = SupervisorConfig::default();
    let Some(children) = node.children() else {
        return Ok(config);
    };

    for child in children.nodes() {
        let field = child.name().value();
        match field {
            "heartbeat-timeout-secs" => config.heartbeat_timeout = seconds(child, field)?,
            "worker-timeout-secs" => config.worker_timeout = seconds(child, field)?,
            "interval-secs" => {
                config.interval = seconds(child, field)?;
                if config.interval.is_zero() {
                    return Err(invalid(field, "must be greater than zero"));
                }
            }
            "max-retries" => config.max_retries = non_negative(child, field)?,
            _ => {}
        }
    }
    Ok(config)
}

fn apply_env<F>(fields: &mut QueueFields, env: F) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    let storage_root = env(STORAGE_ROOT_ENV).filter(|v| !v.is_empty());
    let database_url = env(DATABASE_URL_ENV).filter(|v| !v.is_empty());

    match (storage_root, database_url) {
        (Some(_), Some(_)) => Err(ConfigError::InvalidValue {
            field: "environment".to_string(),
            message: format!("only one of {STORAGE_ROOT_ENV} and {DATABASE_URL_ENV} may be set"),
        }),
        (Some(root), None) => {
            fields.storage_root = Some(PathBuf::from(root));
            fields.database_url = None;
            Ok(())
        }
        (None, Some(url)) => {
            fields.database_url = Some(url);
            fields.storage_root = None;
            Ok(())
        }
        (None, None) => Ok(()),
    }
}

fn resolve_backing(fields: QueueFields) -> ConfigResult<Backing> {
    match (fields.storage_root, fields.database_url) {
        (Some(storage_root), None) => Ok(Backing::Embedded {
            storage_root,
            file_mode: fields.file_mode.unwrap_or(DEFAULT_FILE_MODE),
        }),
        (None, Some(database_url)) => Ok(Backing::Relational { database_url }),
        (Some(_), Some(_)) => Err(invalid(
            "queue",
            "storage-root and database-url are mutually exclusive",
        )),
        (None, None) => Err(ConfigError::MissingField(
            "queue.storage-root or queue.database-url".to_string(),
        )),
    }
}

fn file_mode(mode: i128) -> ConfigResult<u32> {
    u32::try_from(mode)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| invalid("queue.file-mode", "not a permission mode"))
}

fn seconds(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    Ok(Duration::from_secs(non_negative(node, field)?))
}

fn non_negative(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = get_first_integer_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("supervisor.{field}")))?;
    u64::try_from(value).map_err(|_| invalid(field, "must be a non-negative integer"))
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_integer_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_of(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_parse_embedded_backing() {
        let kdl = r#"
            queue {
                storage-root "/var/lib/imagebuild/jobs"
                file-mode 0o640
            }
        "#;

        let config = parse_config(kdl, no_env).unwrap();
        assert_eq!(
            config.queue,
            Backing::Embedded {
                storage_root: PathBuf::from("/var/lib/imagebuild/jobs"),
                file_mode: 0o640,
            }
        );
        assert_eq!(config.supervisor, SupervisorConfig::default());
    }

    #[test]
    fn test_file_mode_defaults_to_owner_only() {
        let config = parse_config(r#"queue { storage-root "/tmp/jobs"; }"#, no_env).unwrap();
        assert!(matches!(
            config.queue,
            Backing::Embedded { file_mode: 0o600, .. }
        ));
    }

    #[test]
    fn test_parse_relational_backing_and_supervisor() {
        let kdl = r#"
            queue {
                database-url "postgres://imagebuild@localhost/imagebuild"
            }
            supervisor {
                heartbeat-timeout-secs 60
                worker-timeout-secs 600
                interval-secs 5
                max-retries 2
            }
        "#;

        let config = parse_config(kdl, no_env).unwrap();
        assert_eq!(
            config.queue,
            Backing::Relational {
                database_url: "postgres://imagebuild@localhost/imagebuild".to_string()
            }
        );
        assert_eq!(config.supervisor.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(config.supervisor.worker_timeout, Duration::from_secs(600));
        assert_eq!(config.supervisor.interval, Duration::from_secs(5));
        assert_eq!(config.supervisor.max_retries, 2);
    }

    #[test]
    fn test_backing_is_required() {
        let err = parse_config("", no_env).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn test_backings_are_exclusive() {
        let kdl = r#"
            queue {
                storage-root "/tmp/jobs"
                database-url "postgres://localhost/imagebuild"
            }
        "#;
        let err = parse_config(kdl, no_env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_environment_overrides_file() {
        let kdl = r#"queue { storage-root "/tmp/jobs"; }"#;
        let config = parse_config(
            kdl,
            env_of(&[(DATABASE_URL_ENV, "postgres://override/imagebuild")]),
        )
        .unwrap();
        assert_eq!(
            config.queue,
            Backing::Relational {
                database_url: "postgres://override/imagebuild".to_string()
            }
        );

        let config = parse_config("", env_of(&[(STORAGE_ROOT_ENV, "/srv/jobs")])).unwrap();
        assert_eq!(
            config.queue,
            Backing::Embedded {
                storage_root: PathBuf::from("/srv/jobs"),
                file_mode: 0o600,
            }
        );
    }

    #[test]
    fn test_conflicting_environment_is_rejected() {
        let env = env_of(&[
            (STORAGE_ROOT_ENV, "/srv/jobs"),
            (DATABASE_URL_ENV, "postgres://localhost/imagebuild"),
        ]);
        assert!(parse_config("", env).is_err());
    }

    #[test]
    fn test_invalid_values() {
        let kdl = r#"queue { storage-root "/tmp/jobs"; file-mode 70000; }"#;
        assert!(matches!(
            parse_config(kdl, no_env),
            Err(ConfigError::InvalidValue { .. })
        ));

        let kdl = r#"
            queue { storage-root "/tmp/jobs"; }
            supervisor { interval-secs 0; }
        "#;
        assert!(matches!(
            parse_config(kdl, no_env),
            Err(ConfigError::InvalidValue { .. })
        ));

        let kdl = r#"
            queue { storage-root "/tmp/jobs"; }
            supervisor { max-retries -1; }
        "#;
        assert!(matches!(
            parse_config(kdl, no_env),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_duplicate_blocks_are_rejected() {
        let kdl = r#"
            queue { storage-root "/a"; }
            queue { storage-root "/b"; }
        "#;
        assert!(matches!(
            parse_config(kdl, no_env),
            Err(ConfigError::Duplicate(_))
        ));
    }

    #[test]
    fn test_load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imagebuild.kdl");
        std::fs::write(&path, r#"queue { storage-root "/tmp/jobs"; }"#).unwrap();

        // Only meaningful when the override variables are unset.
        if std::env::var(STORAGE_ROOT_ENV).is_err() && std::env::var(DATABASE_URL_ENV).is_err() {
            let config = load_config(&path).unwrap();
            assert!(matches!(config.queue, Backing::Embedded { .. }));
        }

        assert!(matches!(
            load_config(&dir.path().join("missing.kdl")),
            Err(ConfigError::Io(_))
        ));
    }
}
