//! `grep` and `glob` tool logic.

use crate::error::{EngineError, EngineResult};
use crate::output::cap_tail;
use crate::transport::Transport;
use std::time::Duration;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const OUTPUT_CAP_BYTES: usize = 30_000;
const GLOB_ENTRY_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    Content,
    FilesWithMatches,
    Count,
}

impl Default for OutputMode {
    fn default() -> Self {
        Self::Content
    }
}

#[derive(Debug, Clone, Default)]
pub struct GrepOptions {
    pub glob: Option<String>,
    pub output_mode: OutputMode,
    pub before_context: Option<u32>,
    pub after_context: Option<u32>,
    pub context: Option<u32>,
    pub line_numbers: bool,
    pub case_insensitive: bool,
    pub head_limit: Option<usize>,
}

fn validate_options(opts: &GrepOptions) -> EngineResult<()> {
    let has_context = opts.before_context.is_some() || opts.after_context.is_some() || opts.context.is_some();
    if has_context && opts.output_mode != OutputMode::Content {
        return Err(EngineError::validation(
            "context flags (-A/-B/-C) are only valid with output_mode \"content\"",
        ));
    }
    if opts.line_numbers && opts.output_mode == OutputMode::Count {
        return Err(EngineError::validation(
            "-n is not meaningful with output_mode \"count\"",
        ));
    }
    Ok(())
}

/// Translate the agent's option shape into flags for whichever tool is
/// available, preferring a ripgrep-style tool.
fn build_command(pattern: &str, path: &str, opts: &GrepOptions, use_ripgrep: bool) -> String {
    let quoted_pattern = shell_escape::escape(pattern.into());
    let quoted_path = shell_escape::escape(path.into());

    let mut flags = Vec::new();
    if opts.case_insensitive {
        flags.push("-i".to_string());
    }
    match opts.output_mode {
        OutputMode::FilesWithMatches => flags.push(if use_ripgrep { "-l".to_string() } else { "-rl".to_string() }),
        OutputMode::Count => flags.push(if use_ripgrep { "-c".to_string() } else { "-rc".to_string() }),
        OutputMode::Content => {
            if !use_ripgrep {
                flags.push("-r".to_string());
            }
            if opts.line_numbers {
                flags.push("-n".to_string());
            }
            if let Some(c) = opts.context {
                flags.push(format!("-C{c}"));
            } else {
                if let Some(b) = opts.before_context {
                    flags.push(format!("-B{b}"));
                }
                if let Some(a) = opts.after_context {
                    flags.push(format!("-A{a}"));
                }
            }
        }
    }
    if let Some(glob) = &opts.glob {
        if use_ripgrep {
            flags.push(format!("--glob {}", shell_escape::escape(glob.into())));
        } else {
            flags.push(format!("--include {}", shell_escape::escape(glob.into())));
        }
    }

    let tool = if use_ripgrep { "rg" } else { "grep" };
    let mut command = format!("{tool} {} {quoted_pattern} {quoted_path}", flags.join(" "));
    if let Some(head) = opts.head_limit {
        command.push_str(&format!(" | head -n {head}"));
    }
    command
}

/// Run `pattern` against `path`, returning the rendered text result. Exit
/// code 1 means "no matches" and is folded into an empty success, never an
/// error.
pub async fn grep(
    transport: &dyn Transport,
    pattern: &str,
    path: &str,
    opts: &GrepOptions,
) -> EngineResult<String> {
    validate_options(opts)?;

    let use_ripgrep = transport.has_ripgrep().await;
    let command = build_command(pattern, path, opts, use_ripgrep);
    let result = transport.exec_one_shot(&command, Some(SEARCH_TIMEOUT)).await;

    if result.timed_out {
        return Err(EngineError::transport("grep timed out"));
    }
    // Exit code 1 from grep/rg means "no matches"; anything else nonzero
    // (e.g. 2, a usage or I/O error) is a genuine failure.
    if result.exit_code == 1 {
        return Ok(String::new());
    }
    if result.exit_code != 0 {
        return Err(EngineError::transport(format!(
            "search command failed (exit {}): {}",
            result.exit_code,
            String::from_utf8_lossy(&result.stderr)
        )));
    }

    let (stdout, _truncated) = cap_tail(&result.stdout, OUTPUT_CAP_BYTES);
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}

/// Enumerate files under `base_path` matching `pattern`, newest first.
pub async fn glob(
    transport: &dyn Transport,
    base_path: &str,
    pattern: &str,
    include_hidden: bool,
) -> EngineResult<String> {
    if !base_path.starts_with('/') {
        return Err(EngineError::validation(format!(
            "base_path must be absolute: {base_path}"
        )));
    }

    let quoted_base = shell_escape::escape(base_path.into());
    // Newline-delimited `mtime path` pairs, sorted by mtime descending via an
    // explicit epoch-seconds key so we don't depend on GNU vs BSD
    // `find -newer` semantics. A path containing a literal newline byte
    // desyncs the per-line split below; accepted limitation.
    let command = format!(
        "find {quoted_base} -type f -printf '%T@ %p\\n' 2>/dev/null | sort -rn"
    );
    let result = transport.exec_one_shot(&command, Some(SEARCH_TIMEOUT)).await;
    if result.exit_code != 0 && result.stdout.is_empty() {
        return Err(EngineError::transport(format!(
            "glob search failed: {}",
            String::from_utf8_lossy(&result.stderr)
        )));
    }

    let glob_pattern = globset::Glob::new(pattern)
        .map_err(|e| EngineError::validation(format!("invalid glob pattern: {e}")))?
        .compile_matcher();

    let stdout = String::from_utf8_lossy(&result.stdout);
    let mut matches: Vec<String> = Vec::new();
    for line in stdout.lines() {
        let Some((_mtime, full_path)) = line.split_once(' ') else {
            continue;
        };
        let Some(relative) = full_path.strip_prefix(base_path) else {
            continue;
        };
        let relative = relative.trim_start_matches('/');

        if !include_hidden && relative.split('/').any(|c| c.starts_with('.')) {
            continue;
        }
        if !glob_pattern.is_match(relative) {
            continue;
        }
        matches.push(full_path.to_string());
    }

    let truncated = matches.len() > GLOB_ENTRY_CAP;
    matches.truncate(GLOB_ENTRY_CAP);

    let mut out = matches.join("\n");
    if truncated {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("... [truncated at {GLOB_ENTRY_CAP} entries] ...\n"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local::LocalTransport;
    use tempfile::tempdir;

    #[test]
    fn context_flags_with_files_with_matches_rejected() {
        let opts = GrepOptions {
            context: Some(3),
            output_mode: OutputMode::FilesWithMatches,
            ..Default::default()
        };
        assert!(validate_options(&opts).is_err());
    }

    #[tokio::test]
    async fn grep_exit_code_one_is_empty_success() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "nothing interesting\n").unwrap();
        let transport = LocalTransport::new();
        let opts = GrepOptions::default();
        let out = grep(&transport, "needle", dir.path().to_str().unwrap(), &opts)
            .await
            .unwrap();
        assert_eq!(out, "");
    }

    #[tokio::test]
    async fn grep_finds_match_with_line_number() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha\nneedle here\nbeta\n").unwrap();
        let transport = LocalTransport::new();
        let opts = GrepOptions {
            line_numbers: true,
            ..Default::default()
        };
        let out = grep(&transport, "needle", dir.path().to_str().unwrap(), &opts)
            .await
            .unwrap();
        assert!(out.contains("needle here"));
    }

    #[tokio::test]
    async fn glob_excludes_hidden_entries_by_default() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".hidden")).unwrap();
        std::fs::write(dir.path().join(".hidden/secret.ts"), "x").unwrap();
        std::fs::write(dir.path().join("visible.ts"), "x").unwrap();
        let transport = LocalTransport::new();
        let out = glob(&transport, dir.path().to_str().unwrap(), "*.ts", false)
            .await
            .unwrap();
        assert!(out.contains("visible.ts"));
        assert!(!out.contains("secret.ts"));
    }

    #[tokio::test]
    async fn glob_rejects_relative_base_path() {
        let transport = LocalTransport::new();
        assert!(glob(&transport, "relative", "*.ts", false).await.is_err());
    }
}
