use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CompilerCommand;
use crate::paths::CompileOptions;

/// Output of a single compile call.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompileOutput {
    /// Generated code. `None` means there is nothing to write.
    #[serde(default)]
    pub code: Option<String>,
    /// Source map structure, if the compiler produced one.
    #[serde(default)]
    pub map: Option<Value>,
}

/// The language transformation collaborator.
///
/// Returning `Ok(None)` (or an output without code) is a valid "no artifact" result,
/// used when the compiler filters a file out. Errors are compile failures.
pub trait Compiler {
    fn compile(&self, source: &str, options: &CompileOptions) -> anyhow::Result<Option<CompileOutput>>;
}

impl<C: Compiler + ?Sized> Compiler for &C {
    fn compile(&self, source: &str, options: &CompileOptions) -> anyhow::Result<Option<CompileOutput>> {
        (**self).compile(source, options)
    }
}

impl<C: Compiler + ?Sized> Compiler for Box<C> {
    fn compile(&self, source: &str, options: &CompileOptions) -> anyhow::Result<Option<CompileOutput>> {
        (**self).compile(source, options)
    }
}

/// Emits the source unchanged and never produces a map.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCompiler;

impl Compiler for PassthroughCompiler {
    fn compile(&self, source: &str, _options: &CompileOptions) -> anyhow::Result<Option<CompileOutput>> {
        Ok(Some(CompileOutput {
            code: Some(source.to_string()),
            map: None,
        }))
    }
}

/// Request written to an external compiler's stdin.
#[derive(Serialize)]
struct CompileRequest<'a> {
    code: &'a str,
    options: &'a CompileOptions,
}

/// Runs an external program once per file.
///
/// The program receives `{"code": ..., "options": {...}}` on stdin and answers on
/// stdout with `null`, `{}` or `{"code": ..., "map": ...}`.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    command: CompilerCommand,
}

impl CommandCompiler {
    pub fn new(command: CompilerCommand) -> Self {
        Self { command }
    }
}

impl Compiler for CommandCompiler {
    fn compile(&self, source: &str, options: &CompileOptions) -> anyhow::Result<Option<CompileOutput>> {
        let program = &self.command.program;
        let request = serde_json::to_vec(&CompileRequest {
            code: source,
            options,
        })?;

        let mut child = Command::new(program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start compiler `{program}`"))?;

        // Feed stdin from a separate thread so a chatty compiler cannot deadlock on a full stdout pipe.
        let mut stdin = child.stdin.take().context("compiler stdin unavailable")?;
        let feeder = std::thread::spawn(move || stdin.write_all(&request));

        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for compiler `{program}`"))?;
        match feeder.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(err)) => {
                return Err(err).with_context(|| format!("failed to write to compiler `{program}`"));
            }
            Err(_) => bail!("compiler input thread panicked"),
        }

        if !output.status.success() {
            bail!(
                "compiler `{program}` exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_response(&output.stdout)
            .with_context(|| format!("compiler `{program}` returned an invalid response"))
    }
}

/// Parse a compiler response. Empty output and `null` both mean "no artifact".
fn parse_response(stdout: &[u8]) -> anyhow::Result<Option<CompileOutput>> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let output: Option<CompileOutput> = serde_json::from_slice(stdout)?;
    Ok(output)
}

/// Append a trailing `//# sourceMappingURL=` comment pointing at `map_location`.
pub fn add_source_mapping_url(code: &str, map_location: &str) -> String {
    format!("{code}\n//# sourceMappingURL={map_location}")
}
