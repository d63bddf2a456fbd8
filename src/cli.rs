use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;

use crate::config::{
    BuildConfig, CompilerCommand, FileConfig, SourceMapMode, WatchSettings, normalize_extension,
};

/// Compile a directory tree of sources into a mirrored output tree.
///
/// Each compilable file is handed to the configured compiler and written under the
/// output directory with its extension replaced; other files can be copied verbatim.
/// With --watch, files are rebuilt one at a time as they change.
#[derive(Parser, Debug)]
#[command(name = "tree-transpile", version, about, long_about = None)]
pub struct Cli {
    /// Input directories or files.
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output directory.
    #[arg(short = 'd', long)]
    pub out_dir: Option<PathBuf>,

    /// Compilable extensions (comma-separated, e.g. ".ts,.tsx").
    #[arg(short = 'x', long, value_delimiter = ',')]
    pub extensions: Vec<String>,

    /// Extension for compiled outputs (default ".js").
    #[arg(long)]
    pub out_file_extension: Option<String>,

    /// Keep the original extension on compiled outputs.
    #[arg(long)]
    pub keep_file_extension: bool,

    /// Source map mode.
    #[arg(short = 's', long, value_enum)]
    pub source_maps: Option<SourceMapMode>,

    /// Copy files that are not compilable.
    #[arg(short = 'D', long)]
    pub copy_files: bool,

    /// Include dotfiles and dot-directories.
    #[arg(long)]
    pub include_dotfiles: bool,

    /// Do not build before starting to watch.
    #[arg(long)]
    pub skip_initial_build: bool,

    /// Remove the output directory before the initial build.
    #[arg(long)]
    pub delete_dir_on_start: bool,

    /// Rebuild files as they change.
    #[arg(short, long)]
    pub watch: bool,

    /// Use filesystem polling instead of native notifications.
    #[arg(long)]
    pub poll: bool,

    /// Quiet period in milliseconds before a changed file is rebuilt.
    #[arg(long, value_name = "MS")]
    pub stability_threshold: Option<u64>,

    /// Polling interval in milliseconds (with --poll).
    #[arg(long, value_name = "MS")]
    pub poll_interval: Option<u64>,

    /// Glob patterns to leave out (comma-separated or repeated).
    #[arg(long, value_delimiter = ',')]
    pub ignore: Vec<String>,

    /// External compiler program. Without one, sources are emitted unchanged.
    #[arg(long)]
    pub compiler: Option<String>,

    /// Argument passed to the compiler program (repeatable).
    #[arg(long = "compiler-arg", allow_hyphen_values = true)]
    pub compiler_args: Vec<String>,

    /// Extra compiler option as KEY=VALUE; VALUE is parsed as JSON, else taken as a string.
    #[arg(short = 'O', long = "compiler-option", value_parser = parse_key_value)]
    pub compiler_options: Vec<(String, Value)>,

    /// Configuration file (default: ./tree-transpile.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the build summary as JSON.
    #[arg(long)]
    pub json: bool,

    /// Log every file, including skipped and copied ones.
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors.
    #[arg(short, long)]
    pub quiet: bool,
}

impl Cli {
    /// Load the config file layer and overlay the command line on top of it.
    pub fn load_config(&self) -> anyhow::Result<BuildConfig> {
        let file = match &self.config {
            Some(path) => FileConfig::load_from(path)?,
            None => FileConfig::load(&std::env::current_dir().context("no current directory")?),
        };
        self.resolve(file)
    }

    /// Merge `file` with the command line. Command line values win.
    pub fn resolve(&self, file: FileConfig) -> anyhow::Result<BuildConfig> {
        let out_dir = self
            .out_dir
            .clone()
            .or_else(|| file.out_dir.clone())
            .context("an output directory is required (--out-dir or out_dir in the config file)")?;

        let mut config = BuildConfig::new(out_dir);

        let extensions = if !self.extensions.is_empty() {
            Some(self.extensions.clone())
        } else {
            file.extensions.clone()
        };
        if let Some(exts) = extensions {
            config.extensions = exts
                .iter()
                .filter(|e| !e.trim().is_empty())
                .map(|e| normalize_extension(e))
                .collect();
        }

        if let Some(ext) = self.out_file_extension.clone().or(file.out_file_extension.clone()) {
            config.out_file_extension = normalize_extension(&ext);
        }
        config.keep_file_extension =
            self.keep_file_extension || file.keep_file_extension.unwrap_or(false);
        config.source_maps = self.source_maps.or(file.source_maps).unwrap_or_default();
        config.copy_files = self.copy_files || file.copy_files.unwrap_or(false);
        config.include_dotfiles = self.include_dotfiles || file.include_dotfiles.unwrap_or(false);
        config.skip_initial_build =
            self.skip_initial_build || file.skip_initial_build.unwrap_or(false);
        config.delete_dir_on_start =
            self.delete_dir_on_start || file.delete_dir_on_start.unwrap_or(false);
        config.watch = self.watch || file.watch.unwrap_or(false);

        config.ignore = file.ignore.clone().unwrap_or_default();
        config.ignore.extend(self.ignore.iter().cloned());

        config.compiler = match &self.compiler {
            Some(program) => Some(CompilerCommand {
                program: program.clone(),
                args: self.compiler_args.clone(),
            }),
            None => file.compiler.clone(),
        };

        config.compiler_options = file.compiler_options_json()?;
        for (key, value) in &self.compiler_options {
            config.compiler_options.insert(key.clone(), value.clone());
        }

        let watch_file = file.watcher.unwrap_or_default();
        let defaults = WatchSettings::default();
        config.watch_settings = WatchSettings {
            stability_threshold: self
                .stability_threshold
                .or(watch_file.stability_threshold_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.stability_threshold),
            poll_interval: self
                .poll_interval
                .or(watch_file.poll_interval_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            poll: self.poll || watch_file.poll.unwrap_or(false),
        };

        Ok(config)
    }

    /// Default log filter for the chosen verbosity.
    pub fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty option name in `{s}`"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
