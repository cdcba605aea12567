//! Project configuration (`rr.yaml`) loading and batch resolution.
//!
//! The file declares three tables: `tasks` (what can run), `hosts` (where it
//! can run, in priority order), and `settings` (how a run behaves), plus
//! tuning sections for the transport, the mirror, and the lock. The
//! resolver flattens task dependencies into the flat batch the scheduler
//! consumes.

use std::collections::{BTreeMap, BTreeSet};
use std::hash::{DefaultHasher, Hash, Hasher};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;

use crate::lock::LockSettings;
use crate::mirror::MirrorSettings;
use crate::output::OutputMode;
use crate::shell::SshSettings;
use crate::task::{Task, TaskId};

/// File name looked up in the project root when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "rr.yaml";

/// One entry of the task table.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    /// Command passed to the remote shell.
    pub cmd: String,
    /// Environment exported before the command runs.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working subdirectory below the host's base directory.
    #[serde(default)]
    pub dir: Option<String>,
    /// Tasks scheduled ahead of this one.
    #[serde(default)]
    pub deps: Vec<Dep>,
}

/// A dependency declaration: either one task name or a group whose members
/// carry no ordering among themselves.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum Dep {
    /// A single prerequisite task.
    Single(String),
    /// A group of prerequisites free to run side by side.
    Parallel {
        /// Member task names.
        parallel: Vec<String>,
    },
}

impl Dep {
    fn names(&self) -> &[String] {
        match self {
            Self::Single(name) => std::slice::from_ref(name),
            Self::Parallel { parallel } => parallel,
        }
    }
}

/// One entry of the host table.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Name the host is referred to by.
    pub name: String,
    /// SSH destinations tried in order; the first reachable one wins.
    pub targets: Vec<String>,
    /// Remote base directory receiving the mirrored project.
    pub dir: String,
    /// Port applied to every target; `None` keeps the client default.
    #[serde(default)]
    pub port: Option<u16>,
    /// Shell fragments run once per connection before any task.
    #[serde(default)]
    pub setup: Vec<String>,
}

impl HostConfig {
    /// True when every configured target points back at this machine, in
    /// which case the mirror step is skipped.
    #[must_use]
    pub fn is_loopback(&self) -> bool {
        !self.targets.is_empty()
            && self.targets.iter().all(|target| {
                let host = target.rsplit('@').next().unwrap_or(target);
                matches!(host, "localhost" | "127.0.0.1" | "::1")
            })
    }
}

/// Per-run behaviour knobs.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RunSettings {
    /// Upper bound on concurrent host workers; `0` means one per host.
    pub max_parallel: usize,
    /// Stop dispatching after the first failure.
    pub fail_fast: bool,
    /// Per-task timeout in seconds; `0` disables the limit.
    pub timeout_secs: u64,
    /// How task lifecycles are rendered.
    pub output: OutputMode,
    /// Whether to persist per-task logs and a summary after the run.
    pub save_logs: bool,
    /// Directory receiving saved run logs.
    pub log_dir: Utf8PathBuf,
    /// Number of saved runs kept by the retention sweep.
    pub keep_runs: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_parallel: 0,
            fail_fast: false,
            timeout_secs: 0,
            output: OutputMode::Progress,
            save_logs: false,
            log_dir: Utf8PathBuf::from(".rr/logs"),
            keep_runs: 10,
        }
    }
}

/// Root of the project configuration file.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Task table, keyed by task name.
    pub tasks: BTreeMap<String, TaskSpec>,
    /// Host table in priority order.
    pub hosts: Vec<HostConfig>,
    /// Per-run behaviour.
    pub settings: RunSettings,
    /// Transport tuning.
    pub ssh: SshSettings,
    /// Mirror tuning.
    pub mirror: MirrorSettings,
    /// Lock tuning.
    pub lock: LockSettings,
}

/// Errors raised while loading or resolving configuration.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("no configuration found at {path}; create one or pass --config")]
    NotFound {
        /// Path that was probed.
        path: Utf8PathBuf,
    },
    /// The file exists but could not be read.
    #[error("could not read {path}: {message}")]
    Io {
        /// Path that failed to read.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// The YAML failed to parse or validate structurally.
    #[error("configuration parsing failed: {message}")]
    Parse {
        /// Parser diagnostic.
        message: String,
    },
    /// A requested or referenced task is not declared.
    #[error("unknown task: {name}")]
    UnknownTask {
        /// Name that failed to resolve.
        name: String,
    },
    /// A requested host is not declared.
    #[error("unknown host: {name}")]
    UnknownHost {
        /// Name that failed to resolve.
        name: String,
    },
    /// Task dependencies form a cycle.
    #[error("dependency cycle involving task {name}")]
    DependencyCycle {
        /// Task detected on the cycle.
        name: String,
    },
    /// A structurally valid file carries an unusable value.
    #[error("invalid configuration: {message}")]
    Invalid {
        /// What is unusable and where.
        message: String,
    },
}

impl Config {
    /// Loads and validates the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] / [`ConfigError::Io`] for file
    /// access problems, [`ConfigError::Parse`] for YAML problems, and
    /// [`ConfigError::Invalid`] for structurally valid but unusable values.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|err| ConfigError::Parse {
            message: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut host_names = BTreeSet::new();
        for host in &self.hosts {
            if host.name.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    message: String::from("host entries need a non-empty name"),
                });
            }
            if host.targets.is_empty() {
                return Err(ConfigError::Invalid {
                    message: format!("host {} declares no targets", host.name),
                });
            }
            if host.dir.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    message: format!("host {} declares no remote directory", host.name),
                });
            }
            if !host_names.insert(host.name.as_str()) {
                return Err(ConfigError::Invalid {
                    message: format!("host {} is declared twice", host.name),
                });
            }
        }
        for (name, spec) in &self.tasks {
            if spec.cmd.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    message: format!("task {name} has an empty command"),
                });
            }
            for dep in &spec.deps {
                for dep_name in dep.names() {
                    if !self.tasks.contains_key(dep_name) {
                        return Err(ConfigError::UnknownTask {
                            name: dep_name.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Looks a host up by name.
    #[must_use]
    pub fn host(&self, name: &str) -> Option<&HostConfig> {
        self.hosts.iter().find(|host| host.name == name)
    }

    /// Returns the hosts a run should use, preserving priority order.
    ///
    /// With `names` given, that order wins; otherwise the file order does.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownHost`] for names not in the table.
    pub fn select_hosts(&self, names: Option<&[String]>) -> Result<Vec<HostConfig>, ConfigError> {
        match names {
            None => Ok(self.hosts.clone()),
            Some(requested) => requested
                .iter()
                .map(|name| {
                    self.host(name)
                        .cloned()
                        .ok_or_else(|| ConfigError::UnknownHost { name: name.clone() })
                })
                .collect(),
        }
    }

    /// Resolves requested task names into a flat batch, expanding
    /// dependencies depth-first ahead of each requester and deduplicating
    /// by task name. An empty request selects every declared task.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownTask`] for names not in the table and
    /// [`ConfigError::DependencyCycle`] when `deps` loop.
    pub fn resolve_batch(&self, names: &[String]) -> Result<Vec<Task>, ConfigError> {
        let requested: Vec<&str> = if names.is_empty() {
            self.tasks.keys().map(String::as_str).collect()
        } else {
            names.iter().map(String::as_str).collect()
        };

        let mut ordered = Vec::new();
        let mut scheduled = BTreeSet::new();
        let mut in_progress = Vec::new();
        for name in requested {
            self.expand(name, &mut ordered, &mut scheduled, &mut in_progress)?;
        }

        Ok(ordered
            .into_iter()
            .filter_map(|name| {
                // Resolution deduplicates, so indices from this path are
                // always 0; programmatic batches may still carry duplicates.
                let spec = self.tasks.get(&name)?;
                let mut task = Task::new(TaskId::new(name, 0), spec.cmd.clone());
                task.env = spec.env.clone();
                task.workdir = spec.dir.clone();
                Some(task)
            })
            .collect())
    }

    fn expand(
        &self,
        name: &str,
        ordered: &mut Vec<String>,
        scheduled: &mut BTreeSet<String>,
        in_progress: &mut Vec<String>,
    ) -> Result<(), ConfigError> {
        if scheduled.contains(name) {
            return Ok(());
        }
        if in_progress.iter().any(|pending| pending == name) {
            return Err(ConfigError::DependencyCycle {
                name: name.to_owned(),
            });
        }
        let spec = self
            .tasks
            .get(name)
            .ok_or_else(|| ConfigError::UnknownTask {
                name: name.to_owned(),
            })?;

        in_progress.push(name.to_owned());
        for dep in &spec.deps {
            for dep_name in dep.names() {
                self.expand(dep_name, ordered, scheduled, in_progress)?;
            }
        }
        in_progress.pop();

        scheduled.insert(name.to_owned());
        ordered.push(name.to_owned());
        Ok(())
    }
}

/// Derives the opaque identifier scoping the distributed lock: the
/// sanitised project directory name plus a short hash of its absolute path,
/// so equally named checkouts do not contend.
#[must_use]
pub fn project_fingerprint(root: &Utf8Path) -> String {
    let base: String = root
        .file_name()
        .unwrap_or("project")
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '-'
            }
        })
        .collect();
    let mut hasher = DefaultHasher::new();
    root.as_str().hash(&mut hasher);
    let short = hasher.finish() & 0xffff_ffff;
    format!("{base}-{short:08x}")
}

#[cfg(test)]
mod tests;
