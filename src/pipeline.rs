use std::ffi::OsString;
use std::fs::{self, Permissions};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;

use crate::compiler::{Compiler, add_source_mapping_url};
use crate::config::{BuildConfig, SourceMapMode};
use crate::output::BuildStats;
use crate::paths::{copy_destination, resolve_target};
use crate::walker::{IgnorePolicy, walk_sources};
use crate::writer;

/// What happened to one artifact written by the pipeline.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub destination: PathBuf,
    /// Path of the `.map` file, when one was written.
    pub map_file: Option<PathBuf>,
    /// Permissions copied from the source onto every artifact.
    pub permissions: Permissions,
}

/// Result of processing a single source file.
#[derive(Debug, Clone)]
pub enum FileOutcome {
    /// Nothing was written: not compilable with copying disabled, or the compiler
    /// returned no code.
    Skipped,
    /// The file was copied verbatim.
    Copied(WriteOutcome),
    /// The file was compiled and written.
    Written(WriteOutcome),
}

/// Per-file build logic shared by the initial build and watch-mode rebuilds.
///
/// Errors are always returned to the caller; deciding whether they are fatal is
/// the caller's job.
pub struct BuildPipeline<'a, C> {
    config: &'a BuildConfig,
    compiler: C,
}

impl<'a, C: Compiler> BuildPipeline<'a, C> {
    pub fn new(config: &'a BuildConfig, compiler: C) -> Self {
        Self { config, compiler }
    }

    pub fn config(&self) -> &'a BuildConfig {
        self.config
    }

    /// Compile or copy one file found under a walk root.
    pub fn process_file(&self, source: &Path, relative: &Path) -> anyhow::Result<FileOutcome> {
        if self.config.is_compilable(relative) {
            return self.compile_file(source, relative);
        }
        if !self.config.copy_files {
            tracing::debug!("skipping {} (not compilable)", source.display());
            return Ok(FileOutcome::Skipped);
        }
        self.copy_file(source, relative)
    }

    /// Compile one file if its extension is compilable. Never copies.
    pub fn compile_file(&self, source: &Path, relative: &Path) -> anyhow::Result<FileOutcome> {
        if !self.config.is_compilable(relative) {
            tracing::debug!("skipping {} (not compilable)", source.display());
            return Ok(FileOutcome::Skipped);
        }

        let target = resolve_target(source, relative, self.config);
        let text = fs::read_to_string(source)
            .with_context(|| format!("failed to read {}", source.display()))?;

        let output = self
            .compiler
            .compile(&text, &target.options)
            .with_context(|| format!("failed to compile {}", source.display()))?;

        let Some((mut code, map)) = output.and_then(|o| o.code.map(|code| (code, o.map))) else {
            tracing::debug!("compiler produced no output for {}", source.display());
            return Ok(FileOutcome::Skipped);
        };

        let destination = target.destination;
        let mut pending_map = None;

        if let (SourceMapMode::File, Some(map)) = (self.config.source_maps, map) {
            let map_path = map_path_for(&destination);
            let map_name = map_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            code = add_source_mapping_url(&code, &map_name);

            let serialized = serde_json::to_string(&map)
                .with_context(|| format!("failed to serialize source map for {}", source.display()))?;
            pending_map = Some((map_path, serialized));
        }

        // A map is only written once its code file is in place.
        let permissions = writer::write_text(source, &destination, &code)?;
        let map_file = match pending_map {
            Some((map_path, serialized)) => {
                writer::write_text(source, &map_path, &serialized)?;
                Some(map_path)
            }
            None => None,
        };
        tracing::info!("{} -> {}", source.display(), destination.display());

        Ok(FileOutcome::Written(WriteOutcome {
            destination,
            map_file,
            permissions,
        }))
    }

    fn copy_file(&self, source: &Path, relative: &Path) -> anyhow::Result<FileOutcome> {
        let destination = copy_destination(relative, self.config);
        let permissions = writer::copy_raw(source, &destination)?;
        tracing::debug!(
            "copied {} -> {} (mode {:o})",
            source.display(),
            destination.display(),
            writer::mode_bits(&permissions)
        );

        Ok(FileOutcome::Copied(WriteOutcome {
            destination,
            map_file: None,
            permissions,
        }))
    }

    /// Build one input path: a directory is walked, a regular file is compiled on its
    /// own, and a missing path is ignored.
    pub fn build_input(
        &self,
        input: &Path,
        policy: &IgnorePolicy,
        stats: &mut BuildStats,
    ) -> anyhow::Result<()> {
        let metadata = match fs::metadata(input) {
            Ok(m) => m,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("input {} does not exist, skipping", input.display());
                return Ok(());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to stat {}", input.display()));
            }
        };

        if metadata.is_dir() {
            for entry in walk_sources(input, policy) {
                let outcome = self.process_file(&entry.source, &entry.relative)?;
                stats.record(&outcome);
            }
        } else {
            let outcome = self.compile_file(input, input)?;
            stats.record(&outcome);
        }
        Ok(())
    }

    /// Run the initial build over every input, in order, stopping at the first error.
    ///
    /// Artifacts written before the failure are left in place.
    pub fn build_all(&self, inputs: &[PathBuf], policy: &IgnorePolicy) -> anyhow::Result<BuildStats> {
        let start = Instant::now();
        if self.config.delete_dir_on_start {
            remove_out_dir(&self.config.out_dir)?;
        }

        let mut stats = BuildStats::default();
        for input in inputs {
            self.build_input(input, policy, &mut stats)?;
        }
        stats.elapsed_secs = start.elapsed().as_secs_f64();
        Ok(stats)
    }
}

/// `<destination>.map`
pub fn map_path_for(destination: &Path) -> PathBuf {
    let mut path: OsString = destination.as_os_str().to_owned();
    path.push(".map");
    PathBuf::from(path)
}

fn remove_out_dir(out_dir: &Path) -> anyhow::Result<()> {
    match fs::remove_dir_all(out_dir) {
        Ok(()) => {
            tracing::debug!("removed {}", out_dir.display());
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", out_dir.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileOutput, PassthroughCompiler};
    use crate::paths::CompileOptions;
    use serde_json::{Value, json};
    use std::cell::{Cell, RefCell};
    use tempfile::TempDir;

    /// Test double: upper-cases the source and optionally returns a map.
    #[derive(Default)]
    struct FakeCompiler {
        map: Option<Value>,
        calls: Cell<usize>,
        seen_options: RefCell<Vec<CompileOptions>>,
    }

    impl Compiler for FakeCompiler {
        fn compile(&self, source: &str, options: &CompileOptions) -> anyhow::Result<Option<CompileOutput>> {
            self.calls.set(self.calls.get() + 1);
            self.seen_options.borrow_mut().push(options.clone());
            Ok(Some(CompileOutput {
                code: Some(source.to_uppercase()),
                map: self.map.clone(),
            }))
        }
    }

    struct FixedCompiler(Option<CompileOutput>);

    impl Compiler for FixedCompiler {
        fn compile(&self, _: &str, _: &CompileOptions) -> anyhow::Result<Option<CompileOutput>> {
            Ok(self.0.clone())
        }
    }

    struct FailingCompiler;

    impl Compiler for FailingCompiler {
        fn compile(&self, _: &str, _: &CompileOptions) -> anyhow::Result<Option<CompileOutput>> {
            anyhow::bail!("SyntaxError: unexpected token")
        }
    }

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            fs::create_dir_all(dir.path().join("src")).unwrap();
            Self { dir }
        }

        fn src(&self) -> PathBuf {
            self.dir.path().join("src")
        }

        fn lib(&self) -> PathBuf {
            self.dir.path().join("lib")
        }

        fn write(&self, relative: &str, contents: &[u8]) -> PathBuf {
            let path = self.src().join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, contents).unwrap();
            path
        }

        fn config(&self) -> BuildConfig {
            let mut config = BuildConfig::new(self.lib());
            config.extensions = vec![".box".to_string()];
            config
        }
    }

    fn build(config: &BuildConfig, compiler: impl Compiler, inputs: &[PathBuf]) -> anyhow::Result<BuildStats> {
        let policy = IgnorePolicy::from_config(config).unwrap();
        BuildPipeline::new(config, compiler).build_all(inputs, &policy)
    }

    #[test]
    fn test_compiles_and_copies_mirrored_tree() {
        let fx = Fixture::new();
        fx.write("a.box", b"hello");
        let png: Vec<u8> = vec![0x89, b'P', b'N', b'G', 0, 1, 2, 255];
        fx.write("logo.png", &png);

        let mut config = fx.config();
        config.copy_files = true;
        let stats = build(&config, FakeCompiler::default(), &[fx.src()]).unwrap();

        assert_eq!(fs::read_to_string(fx.lib().join("a.js")).unwrap(), "HELLO");
        assert_eq!(fs::read(fx.lib().join("logo.png")).unwrap(), png);
        assert!(!fx.lib().join("a.box").exists());
        assert_eq!(stats.compiled, 1);
        assert_eq!(stats.copied, 1);
        assert_eq!(stats.skipped, 0);
    }

    #[test]
    fn test_non_compilable_without_copy_writes_nothing() {
        let fx = Fixture::new();
        fx.write("logo.png", b"png");
        fx.write("notes.txt", b"txt");

        let stats = build(&fx.config(), FakeCompiler::default(), &[fx.src()]).unwrap();
        assert!(!fx.lib().exists());
        assert_eq!(stats.skipped, 2);
    }

    #[test]
    fn test_nested_destination_mirrors_relative_path() {
        let fx = Fixture::new();
        fx.write("deep/er/c.box", b"c");

        build(&fx.config(), FakeCompiler::default(), &[fx.src()]).unwrap();
        assert!(fx.lib().join("deep/er/c.js").is_file());
    }

    #[test]
    fn test_source_map_file_mode_writes_map_and_reference() {
        let fx = Fixture::new();
        fx.write("a.box", b"x");

        let mut config = fx.config();
        config.source_maps = SourceMapMode::File;
        let compiler = FixedCompiler(Some(CompileOutput {
            code: Some("x".to_string()),
            map: Some(json!({"version": 3})),
        }));
        build(&config, compiler, &[fx.src()]).unwrap();

        let code = fs::read_to_string(fx.lib().join("a.js")).unwrap();
        assert_eq!(code, "x\n//# sourceMappingURL=a.js.map");
        assert_eq!(code.matches("sourceMappingURL").count(), 1);

        let map: Value =
            serde_json::from_str(&fs::read_to_string(fx.lib().join("a.js.map")).unwrap()).unwrap();
        assert_eq!(map, json!({"version": 3}));
    }

    #[test]
    fn test_failed_code_write_leaves_no_map_behind() {
        let fx = Fixture::new();
        fx.write("a.box", b"x");
        // A directory in the way makes the code write fail.
        fs::create_dir_all(fx.lib().join("a.js")).unwrap();

        let mut config = fx.config();
        config.source_maps = SourceMapMode::File;
        let compiler = FixedCompiler(Some(CompileOutput {
            code: Some("x".to_string()),
            map: Some(json!({"version": 3})),
        }));
        assert!(build(&config, compiler, &[fx.src()]).is_err());
        assert!(!fx.lib().join("a.js.map").exists());
    }

    #[test]
    fn test_no_map_file_in_inline_or_off_mode() {
        for mode in [SourceMapMode::Inline, SourceMapMode::Off] {
            let fx = Fixture::new();
            fx.write("a.box", b"x");

            let mut config = fx.config();
            config.source_maps = mode;
            let compiler = FakeCompiler {
                map: Some(json!({"version": 3})),
                ..Default::default()
            };
            build(&config, compiler, &[fx.src()]).unwrap();

            assert!(!fx.lib().join("a.js.map").exists(), "{mode:?} wrote a map file");
            let code = fs::read_to_string(fx.lib().join("a.js")).unwrap();
            assert!(!code.contains("sourceMappingURL"));
        }
    }

    #[test]
    fn test_file_mode_without_map_data_writes_no_map() {
        let fx = Fixture::new();
        fx.write("a.box", b"x");

        let mut config = fx.config();
        config.source_maps = SourceMapMode::File;
        build(&config, FakeCompiler::default(), &[fx.src()]).unwrap();

        assert!(!fx.lib().join("a.js.map").exists());
        assert_eq!(fs::read_to_string(fx.lib().join("a.js")).unwrap(), "X");
    }

    #[test]
    fn test_compiler_without_code_is_skipped() {
        for output in [None, Some(CompileOutput::default())] {
            let fx = Fixture::new();
            fx.write("a.box", b"x");

            let mut config = fx.config();
            config.copy_files = true;
            let stats = build(&config, FixedCompiler(output), &[fx.src()]).unwrap();

            assert!(!fx.lib().join("a.js").exists());
            assert!(!fx.lib().join("a.box").exists());
            assert_eq!(stats.skipped, 1);
        }
    }

    #[test]
    fn test_compile_options_passed_to_compiler() {
        let fx = Fixture::new();
        fx.write("sub/a.box", b"x");

        let mut config = fx.config();
        config.compiler_options.insert("minify".into(), json!(true));
        let compiler = FakeCompiler::default();
        let policy = IgnorePolicy::from_config(&config).unwrap();
        let pipeline = BuildPipeline::new(&config, &compiler);
        pipeline.build_all(&[fx.src()], &policy).unwrap();

        let seen = compiler.seen_options.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["sourceFileName"], json!("../../src/sub/a.box"));
        assert_eq!(seen[0]["sourceMapTarget"], json!("a.js"));
        assert_eq!(seen[0]["minify"], json!(true));
    }

    #[test]
    fn test_missing_input_is_noop() {
        let fx = Fixture::new();
        let stats = build(
            &fx.config(),
            FakeCompiler::default(),
            &[fx.dir.path().join("does-not-exist")],
        )
        .unwrap();
        assert_eq!(stats.compiled + stats.copied + stats.skipped, 0);
        assert!(!fx.lib().exists());
    }

    #[test]
    fn test_single_file_input_compiles_and_never_copies() {
        let fx = Fixture::new();
        let file = fx.write("a.box", b"x");
        let png = fx.write("logo.png", b"png");

        let mut config = fx.config();
        config.copy_files = true;
        let stats = build(&config, FakeCompiler::default(), &[file.clone(), png]).unwrap();

        let expected = crate::paths::compiled_destination(&file, &config);
        assert!(expected.starts_with(fx.lib()));
        assert!(expected.is_file());
        assert_eq!(stats.compiled, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_compile_failure_aborts_batch() {
        let fx = Fixture::new();
        fx.write("a.box", b"x");
        let other = fx.dir.path().join("other");
        fs::create_dir_all(&other).unwrap();
        fs::write(other.join("b.box"), "y").unwrap();

        let err = build(&fx.config(), FailingCompiler, &[fx.src(), other]).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("failed to compile"));
        assert!(message.contains("SyntaxError"));
        assert!(!fx.lib().join("b.js").exists());
    }

    #[test]
    fn test_earlier_writes_survive_a_later_failure() {
        let fx = Fixture::new();
        fx.write("a.box", b"x");
        let broken = fx.dir.path().join("broken.box");
        fs::write(&broken, [0xff, 0xfe, 0xfd]).unwrap();

        let config = fx.config();
        let result = build(&config, FakeCompiler::default(), &[fx.src(), broken]);
        assert!(result.is_err(), "non-UTF-8 source should fail to read");
        assert!(fx.lib().join("a.js").is_file());
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let fx = Fixture::new();
        fx.write("a.box", b"hello");
        fx.write("b/c.box", b"world");
        fx.write("logo.png", b"png");

        let mut config = fx.config();
        config.copy_files = true;
        config.source_maps = SourceMapMode::File;
        let with_map = || FakeCompiler {
            map: Some(json!({"version": 3, "mappings": "AAAA"})),
            ..Default::default()
        };

        let outputs = ["a.js", "a.js.map", "b/c.js", "logo.png"];
        let snapshot = || -> Vec<Vec<u8>> {
            outputs
                .iter()
                .map(|p| fs::read(fx.lib().join(p)).unwrap())
                .collect()
        };

        build(&config, with_map(), &[fx.src()]).unwrap();
        let first = snapshot();
        build(&config, with_map(), &[fx.src()]).unwrap();
        let second = snapshot();
        assert_eq!(first, second);
    }

    #[test]
    fn test_delete_dir_on_start_clears_stale_outputs() {
        let fx = Fixture::new();
        fx.write("a.box", b"x");
        fs::create_dir_all(fx.lib()).unwrap();
        fs::write(fx.lib().join("stale.js"), "old").unwrap();

        let mut config = fx.config();
        config.delete_dir_on_start = true;
        build(&config, PassthroughCompiler, &[fx.src()]).unwrap();

        assert!(!fx.lib().join("stale.js").exists());
        assert!(fx.lib().join("a.js").is_file());
    }

    #[test]
    fn test_process_file_reports_outcomes() {
        let fx = Fixture::new();
        let a = fx.write("a.box", b"x");
        let png = fx.write("logo.png", b"png");

        let mut config = fx.config();
        config.copy_files = true;
        config.source_maps = SourceMapMode::File;
        let compiler = FakeCompiler {
            map: Some(json!({"version": 3})),
            ..Default::default()
        };
        let pipeline = BuildPipeline::new(&config, &compiler);

        match pipeline.process_file(&a, Path::new("a.box")).unwrap() {
            FileOutcome::Written(outcome) => {
                assert_eq!(outcome.destination, fx.lib().join("a.js"));
                assert_eq!(outcome.map_file, Some(fx.lib().join("a.js.map")));
            }
            other => panic!("expected Written, got {other:?}"),
        }
        match pipeline.process_file(&png, Path::new("logo.png")).unwrap() {
            FileOutcome::Copied(outcome) => {
                assert_eq!(outcome.destination, fx.lib().join("logo.png"));
                assert!(outcome.map_file.is_none());
            }
            other => panic!("expected Copied, got {other:?}"),
        }
        assert_eq!(compiler.calls.get(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_artifacts_carry_source_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let fx = Fixture::new();
        let a = fx.write("a.box", b"x");
        let png = fx.write("logo.png", b"png");
        fs::set_permissions(&a, Permissions::from_mode(0o750)).unwrap();
        fs::set_permissions(&png, Permissions::from_mode(0o640)).unwrap();

        let mut config = fx.config();
        config.copy_files = true;
        config.source_maps = SourceMapMode::File;
        let compiler = FakeCompiler {
            map: Some(json!({"version": 3})),
            ..Default::default()
        };
        build(&config, compiler, &[fx.src()]).unwrap();

        let mode = |p: &str| fs::metadata(fx.lib().join(p)).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode("a.js"), 0o750);
        assert_eq!(mode("a.js.map"), 0o750);
        assert_eq!(mode("logo.png"), 0o640);
    }

    #[test]
    fn test_map_path_for() {
        assert_eq!(map_path_for(Path::new("lib/a.js")), PathBuf::from("lib/a.js.map"));
    }
}
