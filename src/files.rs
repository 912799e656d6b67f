//! `read`, `write`, and `edit` tool logic.

use crate::error::{EngineError, EngineResult};
use crate::transport::Transport;

pub const DEFAULT_READ_LIMIT: usize = 2000;
pub const MAX_READ_LIMIT: usize = 2000;
const MAX_LINE_CHARS: usize = 2000;

fn require_absolute(path: &str) -> EngineResult<()> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(EngineError::validation(format!(
            "path must be absolute: {path}"
        )))
    }
}

/// Refuse content that looks binary: invalid UTF-8, or a NUL byte in the
/// first KiB.
fn reject_if_binary(bytes: &[u8]) -> EngineResult<&str> {
    let probe_len = bytes.len().min(1024);
    if bytes[..probe_len].contains(&0) {
        return Err(EngineError::validation("file appears to be binary"));
    }
    std::str::from_utf8(bytes).map_err(|_| EngineError::validation("file appears to be binary"))
}

/// Read `file_path` as UTF-8 lines, windowed by `offset`/`limit`, rendered
/// with a `cat -n`-style gutter.
pub async fn read(
    transport: &dyn Transport,
    file_path: &str,
    offset: Option<usize>,
    limit: Option<usize>,
) -> EngineResult<String> {
    require_absolute(file_path)?;
    let offset = offset.unwrap_or(1).max(1);
    let limit = limit.unwrap_or(DEFAULT_READ_LIMIT).min(MAX_READ_LIMIT);

    let bytes = transport.read_file(file_path).await?;
    let text = reject_if_binary(&bytes)?;

    let mut out = String::new();
    for (line_no, line) in text.lines().enumerate().skip(offset - 1).take(limit) {
        let rendered = if line.chars().count() > MAX_LINE_CHARS {
            let truncated: String = line.chars().take(MAX_LINE_CHARS).collect();
            format!("{truncated}... [line truncated]")
        } else {
            line.to_string()
        };
        out.push_str(&format!("{:>6}\t{}\n", line_no + 1, rendered));
    }
    Ok(out)
}

/// Overwrite `file_path` verbatim, creating missing parent directories.
pub async fn write(transport: &dyn Transport, file_path: &str, content: &str) -> EngineResult<String> {
    require_absolute(file_path)?;
    transport.write_file(file_path, content.as_bytes()).await?;
    Ok(format!(
        "wrote {} bytes to {file_path}",
        content.as_bytes().len()
    ))
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EditResult {
    pub replacements: usize,
    pub diff_context: String,
}

/// Exact, literal find-and-replace with single-match safety.
pub async fn edit(
    transport: &dyn Transport,
    file_path: &str,
    old_string: &str,
    new_string: &str,
    replace_all: bool,
) -> EngineResult<EditResult> {
    require_absolute(file_path)?;
    if old_string == new_string {
        return Err(EngineError::validation(
            "old_string and new_string must differ",
        ));
    }

    let bytes = transport.read_file(file_path).await?;
    let text = reject_if_binary(&bytes)?.to_string();

    let match_count = text.matches(old_string).count();
    if match_count == 0 {
        return Err(EngineError::validation("no matches"));
    }
    if !replace_all && match_count > 1 {
        return Err(EngineError::validation(
            "multiple matches; disambiguate or set replace_all",
        ));
    }

    let first_site = text.find(old_string).expect("match_count > 0");
    let new_text = if replace_all {
        text.replace(old_string, new_string)
    } else {
        let mut new_text = String::with_capacity(text.len());
        new_text.push_str(&text[..first_site]);
        new_text.push_str(new_string);
        new_text.push_str(&text[first_site + old_string.len()..]);
        new_text
    };

    transport
        .write_file(file_path, new_text.as_bytes())
        .await?;

    let diff_context = context_around(&new_text, first_site.min(new_text.len()));

    Ok(EditResult {
        replacements: if replace_all { match_count } else { 1 },
        diff_context,
    })
}

/// A handful of lines of `text` around byte offset `site`, for the agent to
/// eyeball the result of an edit.
fn context_around(text: &str, site: usize) -> String {
    const CONTEXT_LINES: usize = 3;
    let line_of_site = text[..site].matches('\n').count();
    text.lines()
        .enumerate()
        .skip(line_of_site.saturating_sub(CONTEXT_LINES))
        .take(CONTEXT_LINES * 2 + 1)
        .map(|(n, l)| format!("{:>6}\t{}", n + 1, l))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local::LocalTransport;
    use tempfile::NamedTempFile;

    fn path_of(file: &NamedTempFile) -> String {
        file.path().to_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn read_numbers_lines_from_offset() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "one\ntwo\nthree\n").unwrap();
        let transport = LocalTransport::new();
        let out = read(&transport, &path_of(&file), Some(2), None).await.unwrap();
        assert_eq!(out, "     2\ttwo\n     3\tthree\n");
    }

    #[tokio::test]
    async fn read_rejects_relative_path() {
        let transport = LocalTransport::new();
        assert!(read(&transport, "relative.txt", None, None).await.is_err());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let file = NamedTempFile::new().unwrap();
        let transport = LocalTransport::new();
        write(&transport, &path_of(&file), "hello\n").await.unwrap();
        let out = read(&transport, &path_of(&file), None, None).await.unwrap();
        assert_eq!(out, "     1\thello\n");
    }

    #[tokio::test]
    async fn edit_single_match_default_succeeds() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "foo bar\n").unwrap();
        let transport = LocalTransport::new();
        let result = edit(&transport, &path_of(&file), "foo", "baz", false)
            .await
            .unwrap();
        assert_eq!(result.replacements, 1);
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, "baz bar\n");
    }

    #[tokio::test]
    async fn edit_multiple_matches_without_replace_all_errors() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "foo foo\n").unwrap();
        let transport = LocalTransport::new();
        let err = edit(&transport, &path_of(&file), "foo", "bar", false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, "foo foo\n", "file must be unchanged on rejection");
    }

    #[tokio::test]
    async fn edit_replace_all_replaces_every_occurrence() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "foo foo\n").unwrap();
        let transport = LocalTransport::new();
        let result = edit(&transport, &path_of(&file), "foo", "bar", true)
            .await
            .unwrap();
        assert_eq!(result.replacements, 2);
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, "bar bar\n");
    }

    #[tokio::test]
    async fn edit_is_idempotent_only_once() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "foo bar\n").unwrap();
        let transport = LocalTransport::new();
        edit(&transport, &path_of(&file), "foo", "baz", false)
            .await
            .unwrap();
        let second = edit(&transport, &path_of(&file), "foo", "baz", false).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn edit_rejects_noop() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "foo bar\n").unwrap();
        let transport = LocalTransport::new();
        let err = edit(&transport, &path_of(&file), "foo", "foo", false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
