use serde::Serialize;

use crate::pipeline::FileOutcome;

/// Aggregate statistics produced by a build run.
#[derive(Debug, Default, Serialize)]
pub struct BuildStats {
    /// Files compiled and written.
    pub compiled: usize,
    /// Files copied verbatim.
    pub copied: usize,
    /// Files that produced no artifact.
    pub skipped: usize,
    /// Source map files written next to compiled outputs.
    pub source_maps: usize,
    /// Wall-clock time for the build in seconds.
    pub elapsed_secs: f64,
}

impl BuildStats {
    pub fn record(&mut self, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::Skipped => self.skipped += 1,
            FileOutcome::Copied(_) => self.copied += 1,
            FileOutcome::Written(w) => {
                self.compiled += 1;
                if w.map_file.is_some() {
                    self.source_maps += 1;
                }
            }
        }
    }
}

/// Print a summary of the build.
///
/// - `json = true`: emit a pretty-printed JSON object to stdout.
/// - `json = false`: emit a one-line human-readable summary to stdout.
pub fn print_summary(stats: &BuildStats, json: bool) {
    if json {
        match serde_json::to_string_pretty(stats) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("error serialising stats: {}", e),
        }
        return;
    }

    let noun = if stats.compiled == 1 { "file" } else { "files" };
    println!(
        "Successfully compiled {} {} in {:.2}s",
        stats.compiled, noun, stats.elapsed_secs
    );
    if stats.copied > 0 {
        println!("  copied {} other file(s)", stats.copied);
    }
}
