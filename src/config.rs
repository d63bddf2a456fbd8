use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Name of the optional project configuration file.
pub const CONFIG_FILE: &str = "tree-transpile.toml";

/// Extensions compiled when none are configured.
pub const DEFAULT_EXTENSIONS: &[&str] = &[".js", ".jsx", ".es6", ".es"];

/// How source maps produced by the compiler are persisted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceMapMode {
    /// No source maps.
    #[default]
    Off,
    /// The compiler embeds the map in the generated code.
    Inline,
    /// The map is written next to the output as `<dest>.map`.
    File,
}

impl SourceMapMode {
    /// Value handed to the compiler as its `sourceMaps` option.
    pub fn as_option(self) -> Value {
        match self {
            Self::Off => Value::Bool(false),
            Self::Inline => Value::String("inline".to_string()),
            Self::File => Value::Bool(true),
        }
    }
}

/// External compiler program and its fixed arguments.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct CompilerCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Timing knobs for watch mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchSettings {
    /// Quiet period with no further writes before a change is dispatched.
    pub stability_threshold: Duration,
    /// Interval used by the polling backend.
    pub poll_interval: Duration,
    /// Use the polling backend instead of native notifications.
    pub poll: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            stability_threshold: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            poll: false,
        }
    }
}

/// Resolved build configuration.
///
/// Constructed once at startup and only ever borrowed afterwards.
#[derive(Clone, Debug)]
pub struct BuildConfig {
    pub out_dir: PathBuf,
    /// Compilable extensions, each with a leading dot.
    pub extensions: Vec<String>,
    /// Extension given to compiled outputs, with a leading dot.
    pub out_file_extension: String,
    pub keep_file_extension: bool,
    pub source_maps: SourceMapMode,
    pub copy_files: bool,
    pub include_dotfiles: bool,
    pub skip_initial_build: bool,
    pub delete_dir_on_start: bool,
    pub watch: bool,
    /// Glob patterns excluded from directory walks and watch events.
    pub ignore: Vec<String>,
    pub compiler: Option<CompilerCommand>,
    /// Extra options merged into every compile call; these win over derived ones.
    pub compiler_options: Map<String, Value>,
    pub watch_settings: WatchSettings,
}

impl BuildConfig {
    /// A configuration with every option at its default.
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            out_file_extension: ".js".to_string(),
            keep_file_extension: false,
            source_maps: SourceMapMode::Off,
            copy_files: false,
            include_dotfiles: false,
            skip_initial_build: false,
            delete_dir_on_start: false,
            watch: false,
            ignore: Vec::new(),
            compiler: None,
            compiler_options: Map::new(),
            watch_settings: WatchSettings::default(),
        }
    }

    /// Returns true if `name`'s final extension is in the compilable set.
    pub fn is_compilable(&self, name: &Path) -> bool {
        match name.extension().and_then(|e| e.to_str()) {
            Some(ext) => self
                .extensions
                .iter()
                .any(|allowed| allowed.strip_prefix('.') == Some(ext)),
            None => false,
        }
    }
}

/// Normalise an extension to carry exactly one leading dot.
pub fn normalize_extension(ext: &str) -> String {
    format!(".{}", ext.trim().trim_start_matches('.'))
}

/// Contents of `tree-transpile.toml`. Every field is optional; command line flags win.
#[derive(Debug, Deserialize, Default)]
pub struct FileConfig {
    pub out_dir: Option<PathBuf>,
    pub extensions: Option<Vec<String>>,
    pub out_file_extension: Option<String>,
    pub keep_file_extension: Option<bool>,
    pub source_maps: Option<SourceMapMode>,
    pub copy_files: Option<bool>,
    pub include_dotfiles: Option<bool>,
    pub skip_initial_build: Option<bool>,
    pub delete_dir_on_start: Option<bool>,
    pub watch: Option<bool>,
    pub ignore: Option<Vec<String>>,
    pub compiler: Option<CompilerCommand>,
    /// Arbitrary compiler options, converted to JSON before use.
    pub compiler_options: Option<toml::Table>,
    pub watcher: Option<WatchFileConfig>,
}

/// `[watcher]` table of the config file.
#[derive(Debug, Deserialize, Default)]
pub struct WatchFileConfig {
    pub stability_threshold_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub poll: Option<bool>,
}

impl FileConfig {
    /// Load configuration from `tree-transpile.toml` in the given directory.
    ///
    /// Returns a default (empty) configuration if the file does not exist or cannot be parsed.
    pub fn load(dir: &Path) -> Self {
        let config_path = dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Self::default();
        }

        match Self::load_from(&config_path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("failed to load {CONFIG_FILE}: {err:#}. Using defaults.");
                Self::default()
            }
        }
    }

    /// Load configuration from an explicit path. Unlike [`FileConfig::load`], failures are errors.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str::<Self>(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Compiler options from the file, as a JSON object.
    pub fn compiler_options_json(&self) -> anyhow::Result<Map<String, Value>> {
        let Some(table) = &self.compiler_options else {
            return Ok(Map::new());
        };
        match serde_json::to_value(table).context("invalid compiler_options table")? {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }
}
