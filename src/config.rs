//! Configuration - YAML file with defaults for every field

use crate::core::{StallPolicy, SupervisorConfig, Task, TaskId};
use crate::error::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Placeholders a command template may use
pub const PLACEHOLDERS: &[&str] = &["module", "id", "type", "config", "store"];

/// Exit code the supervisor records for tasks it killed itself
pub const EXIT_KILLED_BY_SUPERVISOR: i32 = -9;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: PathBuf,
    pub log_dir: PathBuf,
    pub task_limit: usize,
    pub reconcile_interval_ms: u64,
    pub admission_interval_ms: u64,
    pub stall_timeout_secs: u64,
    pub admission: AdmissionConfig,
    pub supervisor: SupervisorConfig,
    pub command_template: String,
    /// Task type -> module command
    pub modules: BTreeMap<u32, String>,
    /// Exit code -> message, on top of the built-in table
    pub exit_messages: BTreeMap<i32, String>,
    /// Where the config was read from; filled in by [`Config::load`]
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: PathBuf::from("tasks.json"),
            log_dir: PathBuf::from(".process_log"),
            task_limit: 100,
            reconcile_interval_ms: 1000,
            admission_interval_ms: 5000,
            stall_timeout_secs: 20,
            admission: AdmissionConfig::default(),
            supervisor: SupervisorConfig::default(),
            command_template: "{module} --task-id {id} --config-file {config}".to_string(),
            modules: BTreeMap::new(),
            exit_messages: BTreeMap::new(),
            source: None,
        }
    }
}

/// Host load limits for dispatching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub cpu_limit_percent: f32,
    pub ram_limit_percent: f32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            cpu_limit_percent: 60.0,
            ram_limit_percent: 60.0,
        }
    }
}

impl Config {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.source = Some(path.to_path_buf());
        config.validate()?;
        Ok(config)
    }

    /// Find the config file when none was given.
    /// Priority:
    /// 1. ./taskherd.yml
    /// 2. <user config dir>/taskherd/config.yml
    pub fn discover() -> Result<PathBuf, ConfigError> {
        let local = PathBuf::from("taskherd.yml");
        if local.exists() {
            return Ok(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("taskherd").join("config.yml"))
            .filter(|p| p.exists())
            .ok_or(ConfigError::NotFound)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.modules.is_empty() {
            return Err(ConfigError::NoModules);
        }
        for (task_type, module) in &self.modules {
            let words = shell_words::split(module).map_err(|source| ConfigError::ModuleSyntax {
                task_type: *task_type,
                source,
            })?;
            if words.is_empty() {
                return Err(ConfigError::EmptyModule(*task_type));
            }
        }
        CommandTemplate::parse(&self.command_template)?;
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(1))
    }

    pub fn admission_interval(&self) -> Duration {
        Duration::from_millis(self.admission_interval_ms.max(1))
    }

    pub fn stall_policy(&self) -> StallPolicy {
        StallPolicy {
            reconcile_interval: self.reconcile_interval(),
            timeout: Duration::from_secs(self.stall_timeout_secs),
        }
    }

    /// Path of the per-task process log
    pub fn log_path(&self, task_id: TaskId) -> PathBuf {
        self.log_dir.join(format!("{}.log", task_id))
    }

    pub fn exit_messages(&self) -> ExitMessages {
        ExitMessages::with_overrides(self.exit_messages.clone())
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([A-Za-z_]+)\}").expect("static pattern"))
}

/// Launch command template, e.g. `{module} --task-id {id}`
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTemplate {
    template: String,
    modules: BTreeMap<u32, String>,
    config_path: String,
    store_path: String,
}

impl CommandTemplate {
    /// Check placeholders without building a template
    pub fn parse(template: &str) -> Result<(), ConfigError> {
        let mut has_module = false;
        for caps in placeholder_pattern().captures_iter(template) {
            let name = &caps[1];
            if !PLACEHOLDERS.contains(&name) {
                return Err(ConfigError::UnknownPlaceholder(name.to_string()));
            }
            has_module |= name == "module";
        }
        if !has_module {
            return Err(ConfigError::MissingModulePlaceholder);
        }
        shell_words::split(template).map_err(ConfigError::TemplateSyntax)?;
        Ok(())
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::parse(&config.command_template)?;
        Ok(Self {
            template: config.command_template.clone(),
            modules: config.modules.clone(),
            config_path: config
                .source
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            store_path: config.store.display().to_string(),
        })
    }

    /// Full launch command for a task. Paths are shell-quoted; the module
    /// command is inserted as written.
    pub fn render(&self, task: &Task) -> Result<String, ConfigError> {
        let module = self
            .modules
            .get(&task.task_type)
            .ok_or(ConfigError::UnknownTaskType(task.task_type))?;

        let rendered = placeholder_pattern().replace_all(&self.template, |caps: &regex::Captures| {
            match &caps[1] {
                "module" => module.clone(),
                "id" => task.id.to_string(),
                "type" => task.task_type.to_string(),
                "config" => shell_words::quote(&self.config_path).into_owned(),
                "store" => shell_words::quote(&self.store_path).into_owned(),
                other => format!("{{{}}}", other),
            }
        });
        Ok(rendered.trim().to_string())
    }
}

/// Human-readable outcomes for process exit codes
#[derive(Debug, Clone, PartialEq)]
pub struct ExitMessages {
    overrides: BTreeMap<i32, String>,
}

impl Default for ExitMessages {
    fn default() -> Self {
        Self::with_overrides(BTreeMap::new())
    }
}

impl ExitMessages {
    pub fn with_overrides(overrides: BTreeMap<i32, String>) -> Self {
        Self { overrides }
    }

    pub fn message(&self, exit_code: i32) -> String {
        if let Some(msg) = self.overrides.get(&exit_code) {
            return msg.clone();
        }
        let builtin = match exit_code {
            0 => "Task finished successfully",
            EXIT_KILLED_BY_SUPERVISOR => "Process killed by supervisor",
            126 => "Command found but not executable",
            127 => "Command not found",
            130 => "Process interrupted (SIGINT)",
            137 => "Process killed (SIGKILL)",
            143 => "Process terminated (SIGTERM)",
            code => return format!("Unknown error with code {}", code),
        };
        builtin.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn task(id: u64, task_type: u32) -> Task {
        let now = Utc::now();
        Task {
            id,
            task_type,
            status: -1,
            process_id: None,
            created_at: now,
            updated_at: now,
            eta_seconds: None,
            message: String::new(),
            creator: String::new(),
            params: serde_json::Value::Null,
            worker: None,
            output: String::new(),
        }
    }

    #[test]
    fn test_load_with_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("taskherd.yml");
        std::fs::write(
            &path,
            "store: /var/lib/taskherd/tasks.json\nmodules:\n  3: python3 match/main.py\nadmission:\n  cpu_limit_percent: 75\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.store, PathBuf::from("/var/lib/taskherd/tasks.json"));
        assert_eq!(config.modules[&3], "python3 match/main.py");
        assert_eq!(config.admission.cpu_limit_percent, 75.0);
        assert_eq!(config.admission.ram_limit_percent, 60.0);
        assert_eq!(config.supervisor.window_size, 60);
        assert_eq!(config.task_limit, 100);
        assert_eq!(config.source.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_missing_modules_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("c.yml");
        std::fs::write(&path, "task_limit: 5\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::NoModules)));
    }

    #[test]
    fn test_unreadable_and_invalid_files() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.yml");
        assert!(matches!(Config::load(&missing), Err(ConfigError::Read { .. })));

        let bad = temp_dir.path().join("bad.yml");
        std::fs::write(&bad, "modules: [unterminated").unwrap();
        assert!(matches!(Config::load(&bad), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_template_placeholders_checked() {
        assert!(CommandTemplate::parse("{module} --id {id} --store {store}").is_ok());
        assert!(matches!(
            CommandTemplate::parse("run --id {id}"),
            Err(ConfigError::MissingModulePlaceholder)
        ));
        assert!(matches!(
            CommandTemplate::parse("{module} {priority}"),
            Err(ConfigError::UnknownPlaceholder(p)) if p == "priority"
        ));
    }

    #[test]
    fn test_render_substitutes_task_fields() {
        let mut config = Config::default();
        config.modules.insert(2, "python3 detect.py".to_string());
        config.source = Some(PathBuf::from("/etc/taskherd.yml"));

        let template = CommandTemplate::from_config(&config).unwrap();
        let command = template.render(&task(41, 2)).unwrap();

        assert_eq!(
            command,
            "python3 detect.py --task-id 41 --config-file /etc/taskherd.yml"
        );
        assert!(matches!(
            template.render(&task(42, 9)),
            Err(ConfigError::UnknownTaskType(9))
        ));
    }

    #[test]
    fn test_render_quotes_paths_with_spaces() {
        let mut config = Config {
            command_template: "{module} --config {config} --db {store}".to_string(),
            store: PathBuf::from("/srv/task data/tasks.json"),
            ..Config::default()
        };
        config.modules.insert(1, "python3 -m 'my tool'".to_string());
        config.source = Some(PathBuf::from("/etc/task herd.yml"));

        let command = CommandTemplate::from_config(&config)
            .unwrap()
            .render(&task(5, 1))
            .unwrap();

        assert_eq!(
            shell_words::split(&command).unwrap(),
            vec![
                "python3",
                "-m",
                "my tool",
                "--config",
                "/etc/task herd.yml",
                "--db",
                "/srv/task data/tasks.json",
            ]
        );
    }

    #[test]
    fn test_unbalanced_quotes_rejected() {
        assert!(matches!(
            CommandTemplate::parse("{module} --name 'half"),
            Err(ConfigError::TemplateSyntax(_))
        ));

        let mut config = Config::default();
        config.modules.insert(4, "python3 'broken.py".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ModuleSyntax { task_type: 4, .. })
        ));
    }

    #[test]
    fn test_exit_messages() {
        let mut overrides = BTreeMap::new();
        overrides.insert(3, "Input file not found".to_string());
        let messages = ExitMessages::with_overrides(overrides);

        assert_eq!(messages.message(3), "Input file not found");
        assert_eq!(messages.message(127), "Command not found");
        assert!(messages.message(7).contains('7'));
        assert_eq!(messages.message(7), "Unknown error with code 7");
    }
}
