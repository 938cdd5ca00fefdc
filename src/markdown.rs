//! Content loader: enumerates post source files and splits front matter
//! from body (§4.B).

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use comrak::Options;
use serde::Deserialize;
use walkdir::WalkDir;

use crate::error::BuildError;
use crate::site::{MetaValue, Post, PostMeta};

const FRONT_MATTER_DELIMITER: &str = "---";

/// Front matter as written by a post author: every field optional, since
/// a missing title or timestamp is valid (§4.B) regardless of whether any
/// other front-matter field is present.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawFrontMatter {
    title: Option<String>,
    date: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    slug: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    extra: std::collections::BTreeMap<String, MetaValue>,
}

/// Enumerate Markdown source files under `content_dir`, in lexicographic
/// order. Parallel work over the result is the caller's concern; the
/// enumeration itself is always sequential and sorted so downstream
/// ordering stays deterministic regardless of filesystem traversal order.
///
/// # Errors
///
/// Returns [`BuildError::Io`] if `content_dir` cannot be walked.
pub fn enumerate(content_dir: &Path) -> Result<Vec<PathBuf>, BuildError> {
    let mut paths: Vec<PathBuf> = WalkDir::new(content_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("md") || ext.eq_ignore_ascii_case("markdown"))
        })
        .map(|entry| entry.into_path())
        .collect();
    paths.sort();
    Ok(paths)
}

/// Parse one source file into a [`Post`] with raw (un-rendered) body.
///
/// Front matter is recognised by a leading `---` line terminated by a
/// matching `---` line; its absence is valid. A missing title defaults to
/// the file stem; a missing timestamp defaults to the file's mtime (the
/// hermetic runner normalises this to the fixed build epoch downstream).
///
/// # Errors
///
/// Returns [`BuildError::Content`] on a malformed front-matter block or a
/// non-UTF-8 body, and [`BuildError::Io`] on a filesystem failure.
pub fn parse(path: &Path) -> Result<Post, BuildError> {
    let bytes = fs::read(path).map_err(|e| BuildError::io(path, e))?;
    let text = String::from_utf8(bytes).map_err(|_| BuildError::Content {
        path: path.to_path_buf(),
        reason: "body is not valid UTF-8".to_string(),
    })?;

    let (front_matter, body) = split_front_matter(&text).map_err(|reason| BuildError::Content {
        path: path.to_path_buf(),
        reason,
    })?;

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("untitled")
        .to_string();

    let raw: RawFrontMatter = match front_matter {
        Some(text) => serde_yaml::from_str(text).map_err(|e| BuildError::Content {
            path: path.to_path_buf(),
            reason: format!("invalid front matter: {e}"),
        })?,
        None => RawFrontMatter::default(),
    };

    let meta = PostMeta {
        title: raw.title.filter(|t| !t.is_empty()).unwrap_or_else(|| stem.clone()),
        date: raw.date.unwrap_or_else(|| fallback_date(path)),
        tags: raw.tags,
        slug: raw.slug,
        draft: raw.draft,
        extra: raw.extra,
    };

    let slug = if meta.slug.is_empty() {
        derive_slug(&meta.title, path)
    } else {
        derive_slug(&meta.slug, path)
    };

    Ok(Post {
        meta,
        slug,
        raw_body: body.as_bytes().to_vec(),
        rendered_body: Vec::new(),
        content_hash: None,
        source: path.to_path_buf(),
    })
}

fn fallback_date(path: &Path) -> DateTime<Utc> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).single().unwrap_or_default())
}

fn split_front_matter(text: &str) -> Result<(Option<&str>, &str), String> {
    let Some(rest) = text.strip_prefix(FRONT_MATTER_DELIMITER) else {
        return Ok((None, text));
    };
    let Some(after_newline) = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n")) else {
        return Ok((None, text));
    };
    let Some(end) = after_newline.find("\n---") else {
        return Err("front matter opened with '---' but no closing delimiter found".to_string());
    };
    let front_matter = &after_newline[..end];
    let after_delim = &after_newline[end + 4..];
    let body = after_delim
        .strip_prefix('\n')
        .or_else(|| after_delim.strip_prefix("\r\n"))
        .unwrap_or(after_delim);
    Ok((Some(front_matter), body))
}

/// Derive a URL-safe slug: ASCII-lowercase, runs of non-alphanumeric
/// characters collapsed to a single hyphen, leading/trailing hyphens
/// stripped. Falls back to the file stem when the input collapses to
/// nothing (e.g. an all-punctuation title).
#[must_use]
pub fn derive_slug(input: &str, path: &Path) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut last_was_hyphen = false;
    for ch in input.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() {
            slug.push(lower);
            last_was_hyphen = false;
        } else if !last_was_hyphen && !slug.is_empty() {
            slug.push('-');
            last_was_hyphen = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        return derive_slug(
            path.file_stem().and_then(|s| s.to_str()).unwrap_or("post"),
            path,
        );
    }
    slug
}

/// Configuration for the built-in Markdown-to-HTML content plugin.
#[derive(Debug, Clone, Copy)]
pub struct MarkdownOptions {
    /// Enable GFM autolinking of bare URLs. Recorded in build-info (§9
    /// Open Questions).
    pub autolink: bool,
}

impl Default for MarkdownOptions {
    fn default() -> Self {
        Self { autolink: true }
    }
}

/// Render a Markdown body to HTML via `comrak`.
#[must_use]
pub fn render_markdown(markdown: &str, opts: MarkdownOptions) -> String {
    let mut options = Options::default();
    options.extension.autolink = opts.autolink;
    options.extension.table = true;
    options.extension.strikethrough = true;
    options.extension.tasklist = true;
    options.extension.footnotes = true;
    options.render.unsafe_ = false;
    comrak::markdown_to_html(markdown, &options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_lowercases_and_hyphenates() {
        let path = Path::new("ignored.md");
        assert_eq!(derive_slug("Hello, World!", path), "hello-world");
        assert_eq!(derive_slug("  leading/trailing -- hyphens  ", path), "leading-trailing-hyphens");
    }

    #[test]
    fn slug_falls_back_to_stem_when_empty() {
        let path = Path::new("my-post.md");
        assert_eq!(derive_slug("!!!", path), "my-post");
    }

    #[test]
    fn front_matter_absent_is_valid() {
        let (fm, body) = split_front_matter("# Hello\n\nBody text.\n").unwrap();
        assert!(fm.is_none());
        assert_eq!(body, "# Hello\n\nBody text.\n");
    }

    #[test]
    fn front_matter_present_splits_correctly() {
        let text = "---\ntitle: Hi\n---\n# Body\n";
        let (fm, body) = split_front_matter(text).unwrap();
        assert_eq!(fm, Some("title: Hi"));
        assert_eq!(body, "# Body\n");
    }

    #[test]
    fn unterminated_front_matter_errors() {
        let text = "---\ntitle: Hi\n# Body\n";
        assert!(split_front_matter(text).is_err());
    }

    #[test]
    fn markdown_renders_safely() {
        let html = render_markdown("# Hello", MarkdownOptions::default());
        assert!(html.starts_with("<h1>Hello</h1>"));
    }

    #[test]
    fn markdown_does_not_allow_raw_html_passthrough() {
        let html = render_markdown("<script>alert(1)</script>", MarkdownOptions::default());
        assert!(!html.contains("<script>"));
    }
}

#[cfg(test)]
mod slug_properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// A slug derived from arbitrary text is either empty-input-fallback
        /// or composed entirely of lowercase ASCII alphanumerics and single
        /// hyphens, with no leading/trailing/doubled hyphen (§4.B).
        #[test]
        fn derive_slug_is_always_url_safe(input in ".{0,200}") {
            let path = Path::new("fallback.md");
            let slug = derive_slug(&input, path);
            prop_assert!(!slug.is_empty());
            prop_assert!(!slug.starts_with('-') && !slug.ends_with('-'));
            prop_assert!(!slug.contains("--"));
            prop_assert!(slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        }

        /// Deriving a slug from an already-derived slug is a no-op: the
        /// function is idempotent once its output is fed back in.
        #[test]
        fn derive_slug_is_idempotent(input in ".{0,200}") {
            let path = Path::new("fallback.md");
            let once = derive_slug(&input, path);
            let twice = derive_slug(&once, path);
            prop_assert_eq!(once, twice);
        }
    }
}
