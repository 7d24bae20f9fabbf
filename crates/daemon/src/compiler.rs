// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! Command-line handling around the real compiler: cache-key rendering,
//! argv assembly, deps parsing, preprocessing, and toolchain resolution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::VersionConfig;
use crate::process::{ProcessRunner, ProcessSpec};
use crate::proto::{Flags, Status, StatusCode};

/// Preprocessing that takes longer than this is hung, not slow.
const PREPROCESS_TIMEOUT: Duration = Duration::from_secs(10);

/// The cache-key text of a command line: `other`, the language, and the
/// compile-only flags, space-separated. This exact string is hashed.
pub fn cache_command_line(flags: &Flags) -> String {
    let mut text = flags.other.join(" ");
    if let Some(language) = &flags.language {
        text.push_str(" -x ");
        text.push_str(language);
    }
    if !flags.cc_only.is_empty() {
        text.push(' ');
        text.push_str(&flags.cc_only.join(" "));
    }
    text
}

/// The direct-tier variant additionally keys on the non-cached flags and
/// the implicit include of the input's directory, since header resolution
/// depends on both.
pub fn direct_command_line(flags: &Flags, current_dir: &Path) -> String {
    let mut text = flags.other.join(" ");
    if let Some(language) = &flags.language {
        text.push_str(" -x ");
        text.push_str(language);
    }
    if !flags.non_cached.is_empty() {
        text.push(' ');
        text.push_str(&flags.non_cached.join(" "));
    }
    if !flags.cc_only.is_empty() {
        text.push(' ');
        text.push_str(&flags.cc_only.join(" "));
    }

    // The compiler implicitly appends the input's directory as an include
    // path, so the key must too.
    let input = flags.input.as_deref().unwrap_or("");
    let input_dir = Path::new(input).parent().unwrap_or(Path::new(""));
    let input_dir = if Path::new(input).is_absolute() {
        input_dir.to_path_buf()
    } else {
        current_dir.join(input_dir)
    };
    text.push_str(" -I");
    text.push_str(&input_dir.to_string_lossy());

    text
}

/// Argv of a preprocessor-only run: compile-only flags stripped, output on
/// stdout, inputs retained.
pub fn preprocess_args(flags: &Flags) -> Vec<String> {
    let mut args = flags.other.clone();
    args.push("-E".to_string());
    if let Some(language) = &flags.language {
        args.push("-x".to_string());
        args.push(language.clone());
    }
    args.push("-o".to_string());
    args.push("-".to_string());
    if let Some(input) = &flags.input {
        args.push(input.clone());
    }
    args
}

/// Argv of a real compile. `other` always renders first ("-cc1" lives
/// there).
pub fn compile_args(flags: &Flags) -> Vec<String> {
    let mut args = flags.other.clone();
    args.push(flags.action.clone());
    args.extend(flags.non_cached.iter().cloned());
    args.extend(flags.non_direct.iter().cloned());
    if let Some(compiler) = &flags.compiler {
        for plugin in &compiler.plugins {
            if let Some(path) = &plugin.path {
                args.push("-load".to_string());
                args.push(path.clone());
            }
        }
    }
    if let Some(deps_file) = &flags.deps_file {
        args.push("-dependency-file".to_string());
        args.push(deps_file.clone());
    }
    if let Some(language) = &flags.language {
        args.push("-x".to_string());
        args.push(language.clone());
    }
    if let Some(output) = &flags.output {
        args.push("-o".to_string());
        args.push(output.clone());
    }
    if let Some(input) = &flags.input {
        args.push(input.clone());
    }
    args
}

/// A subprocess spec for a real compile in `current_dir` as `uid`.
pub fn compile_spec(flags: &Flags, current_dir: &Path, uid: Option<u32>) -> Option<ProcessSpec> {
    let program = flags.compiler.as_ref()?.path.clone()?;
    Some(ProcessSpec {
        program: PathBuf::from(program),
        args: compile_args(flags),
        cwd: current_dir.to_path_buf(),
        uid,
        stdin: None,
        timeout: None,
    })
}

/// Run the preprocessor and capture the handled source from its stdout.
/// `None` covers both a missing toolchain and a failed run; the caller
/// routes the task to the full compiler for a proper diagnostic.
pub fn preprocess(
    runner: &dyn ProcessRunner,
    flags: &Flags,
    current_dir: &Path,
) -> Option<Vec<u8>> {
    let program = flags.compiler.as_ref()?.path.as_deref()?;
    let spec = ProcessSpec {
        program: PathBuf::from(program),
        args: preprocess_args(flags),
        cwd: current_dir.to_path_buf(),
        uid: None,
        stdin: None,
        timeout: Some(PREPROCESS_TIMEOUT),
    };
    match runner.run(&spec) {
        Ok(output) if output.success => Some(output.stdout),
        Ok(output) => {
            tracing::debug!(
                "preprocessing failed for {:?}: {}",
                flags.input,
                String::from_utf8_lossy(&output.stderr)
            );
            None
        }
        Err(e) => {
            tracing::debug!("failed to run preprocessor: {}", e);
            None
        }
    }
}

/// Extract header paths from a Makefile-rule deps fragment, resolving
/// relative ones against `base`.
pub fn parse_deps(deps: &[u8], base: &Path) -> Option<Vec<PathBuf>> {
    let text = std::str::from_utf8(deps).ok()?;
    let joined = text.replace("\\\n", "");
    let first_line = joined.lines().next()?;
    let (_target, files) = first_line.split_once(':')?;

    Some(
        files
            .split_whitespace()
            .map(|file| {
                let path = Path::new(file);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    base.join(path)
                }
            })
            .collect(),
    )
}

/// Absorbers compile already-preprocessed source; tell the compiler so.
pub fn remap_preprocessed_language(flags: &mut Flags) {
    let Some(language) = &flags.language else {
        return;
    };
    let remapped = match language.as_str() {
        "c" => "cpp-output",
        "c++" => "c++-cpp-output",
        "objective-c++" => "objective-c++-cpp-output",
        _ => return,
    };
    flags.language = Some(remapped.to_string());
}

/// Resolve a path in `flags`/`message` terms: absolute stays, relative
/// joins the task's working directory.
pub fn resolve_path(path: &str, current_dir: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        Path::new(current_dir).join(path)
    }
}

/// Configured toolchains, looked up by the version line clients send.
pub struct CompilerRegistry {
    compilers: HashMap<String, PathBuf>,
    plugins: HashMap<String, HashMap<String, PathBuf>>,
}

impl CompilerRegistry {
    pub fn new(versions: &[VersionConfig]) -> Self {
        let mut compilers = HashMap::new();
        let mut plugins: HashMap<String, HashMap<String, PathBuf>> = HashMap::new();
        for version in versions {
            compilers.insert(version.version.clone(), version.path.clone());
            let map = plugins.entry(version.version.clone()).or_default();
            for plugin in &version.plugins {
                map.insert(plugin.name.clone(), plugin.path.clone());
            }
        }
        CompilerRegistry { compilers, plugins }
    }

    /// Fill in the compiler path and plugin paths for the requested
    /// version. Fields already carrying a path are left alone.
    pub fn setup(&self, flags: &mut Flags) -> Result<(), Status> {
        let Some(compiler) = flags.compiler.as_mut() else {
            return Err(Status::new(StatusCode::NoVersion, "no compiler requested"));
        };

        if compiler.path.is_none() {
            let Some(path) = self.compilers.get(&compiler.version) else {
                return Err(Status::new(
                    StatusCode::NoVersion,
                    format!("compiler not found: {}", compiler.version),
                ));
            };
            compiler.path = Some(path.to_string_lossy().into_owned());
        }

        let known_plugins = self.plugins.get(&compiler.version);
        for plugin in &mut compiler.plugins {
            if plugin.path.is_some() {
                continue;
            }
            let resolved = known_plugins.and_then(|map| map.get(&plugin.name));
            let Some(path) = resolved else {
                return Err(Status::new(
                    StatusCode::NoVersion,
                    format!(
                        "plugin {} not found: {}",
                        plugin.name, compiler.version
                    ),
                ));
            };
            plugin.path = Some(path.to_string_lossy().into_owned());
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "compiler_tests.rs"]
mod tests;
