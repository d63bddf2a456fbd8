pub mod cli;
pub mod compiler;
pub mod config;
pub mod output;
pub mod paths;
pub mod pipeline;
pub mod walker;
pub mod watcher;
pub mod writer;

use anyhow::Result;

use compiler::{CommandCompiler, Compiler, PassthroughCompiler};
use config::BuildConfig;
use pipeline::BuildPipeline;
use walker::IgnorePolicy;
use watcher::{DebouncedNotifier, WatchCoordinator};

/// Pick the compiler collaborator for `config`.
pub fn compiler_for(config: &BuildConfig) -> Box<dyn Compiler> {
    match &config.compiler {
        Some(command) => Box::new(CommandCompiler::new(command.clone())),
        None => {
            tracing::debug!("no compiler configured, emitting sources unchanged");
            Box::new(PassthroughCompiler)
        }
    }
}

/// Run the initial build (unless skipped) and then, if requested, watch forever.
///
/// Initial-build errors are returned. Watch-mode rebuild errors are logged and the
/// watch continues.
pub fn run(config: &BuildConfig, inputs: &[std::path::PathBuf], json: bool) -> Result<()> {
    let policy = IgnorePolicy::from_config(config)?;
    let pipeline = BuildPipeline::new(config, compiler_for(config));

    if !config.skip_initial_build {
        let stats = pipeline.build_all(inputs, &policy)?;
        output::print_summary(&stats, json);
    }

    if config.watch {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            let coordinator =
                WatchCoordinator::arm(&pipeline, policy, inputs, &DebouncedNotifier)?;
            coordinator.run().await;
            Ok::<(), anyhow::Error>(())
        })?;
    }

    Ok(())
}
