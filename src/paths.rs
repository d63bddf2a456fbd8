use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value};

use crate::config::BuildConfig;

/// Options object handed to the compiler for one file.
pub type CompileOptions = Map<String, Value>;

/// Where a compilable file goes and what the compiler needs to know about it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub destination: PathBuf,
    pub options: CompileOptions,
}

/// Resolve the output path and compile options for a compilable source.
///
/// `relative` is the name under the walk root; `source` is the real file it came from.
pub fn resolve_target(source: &Path, relative: &Path, config: &BuildConfig) -> ResolvedTarget {
    let destination = compiled_destination(relative, config);
    let options = compile_options(source, &destination, config);
    ResolvedTarget {
        destination,
        options,
    }
}

/// Output path for a compiled file: the relative name with its final extension
/// replaced by the configured output extension, under the output root.
pub fn compiled_destination(relative: &Path, config: &BuildConfig) -> PathBuf {
    let mut relative = contained_relative(relative);
    if !config.keep_file_extension {
        relative.set_extension(config.out_file_extension.trim_start_matches('.'));
    }
    config.out_dir.join(relative)
}

/// Output path for a verbatim copy: the relative name untouched, under the output root.
pub fn copy_destination(relative: &Path, config: &BuildConfig) -> PathBuf {
    config.out_dir.join(contained_relative(relative))
}

/// Reduce a relative name to its normal components so that joining it onto the
/// output root can never leave that root.
pub fn contained_relative(relative: &Path) -> PathBuf {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

/// Derived compiler options, overlaid with the caller's `compiler_options`.
pub fn compile_options(source: &Path, destination: &Path, config: &BuildConfig) -> CompileOptions {
    let dest_dir = destination.parent().unwrap_or(Path::new(""));
    let source_file_name = to_slash(&relative_path(dest_dir, source));
    let source_map_target = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut options = Map::new();
    options.insert("filename".into(), Value::String(to_slash(source)));
    options.insert("sourceFileName".into(), Value::String(source_file_name));
    options.insert("sourceMapTarget".into(), Value::String(source_map_target));
    options.insert("sourceMaps".into(), config.source_maps.as_option());

    for (key, value) in &config.compiler_options {
        options.insert(key.clone(), value.clone());
    }
    options
}

/// Lexical path from directory `from` to `to`.
///
/// When only one side is absolute the other is anchored at the current directory.
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let (from, to) = if from.is_absolute() == to.is_absolute() {
        (normalize(from), normalize(to))
    } else {
        (normalize(&absolute(from)), normalize(&absolute(to)))
    };

    let from_parts: Vec<Component<'_>> = from.components().collect();
    let to_parts: Vec<Component<'_>> = to.components().collect();
    let common = from_parts
        .iter()
        .zip(&to_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..from_parts.len() {
        out.push("..");
    }
    for part in &to_parts[common..] {
        out.push(part.as_os_str());
    }
    out
}

/// Render a path with forward slashes regardless of host conventions.
pub fn to_slash(path: &Path) -> String {
    let mut out = String::new();
    for (i, component) in path.components().enumerate() {
        match component {
            Component::RootDir => {
                out.push('/');
                continue;
            }
            Component::Prefix(prefix) => {
                out.push_str(&prefix.as_os_str().to_string_lossy());
                continue;
            }
            _ => {}
        }
        if i > 0 && !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}

/// Drop `.` segments and fold `..` into the preceding normal segment.
fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    parts.iter().map(|c| c.as_os_str()).collect()
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Absolute, lexically normalised form of `path`, used to compare locations.
pub(crate) fn absolute_normalized(path: &Path) -> PathBuf {
    normalize(&absolute(path))
}
