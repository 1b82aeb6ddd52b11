//! Serialized patch bodies and patch names.
//!
//! A stored patch looks like the output of `git format-patch`, with a marker
//! header identifying it as ours:
//!
//! ```text
//! From <sha> Mon Sep 17 00:00:00 2001
//! Date: <rfc 2822 date>
//! Subject: [PATCH] <subject>
//! From: patchkeeper <patchkeeper@localhost>
//! X-Patchkeeper: generated
//!
//! <commit message>
//!
//! diff --git a/... b/...
//! ```

use chrono::{DateTime, Utc};
use regex_lite::Regex;

use crate::errors::PatchError;

/// Header line marking a body as produced by patchkeeper.
pub const PATCH_MARKER: &str = "X-Patchkeeper: generated";

/// Synthetic author written into every body.
pub const PATCH_AUTHOR: &str = "From: patchkeeper <patchkeeper@localhost>";

/// Message used when a body carries neither a message nor a subject.
pub const FALLBACK_MESSAGE: &str = "apply patch";

const DIFF_HEADER: &str = "diff --git ";
const SUBJECT_PREFIX: &str = "Subject:";
const MAX_SLUG_LEN: usize = 52;

/// A parsed patch body: what to commit and what to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchBody {
    pub message: String,
    pub diff: String,
}

impl PatchBody {
    /// Parse a stored body. `name` is only used for error reporting.
    ///
    /// The diff is everything from the first `diff --git` line on, kept byte
    /// for byte so `\r\n` endings inside hunks survive.
    pub fn parse(name: &str, content: &str) -> Result<Self, PatchError> {
        let mut offset = 0;
        let mut header_end = None;
        let mut diff_start = None;
        for line in content.split_inclusive('\n') {
            let text = line.trim_end_matches(['\r', '\n']);
            if text.starts_with(DIFF_HEADER) {
                diff_start = Some(offset);
                break;
            }
            if header_end.is_none() && text.trim().is_empty() {
                header_end = Some(offset);
            }
            offset += line.len();
        }

        let diff_start = diff_start.ok_or_else(|| PatchError::MalformedPatch {
            name: name.to_string(),
            detail: "no `diff --git` line found".into(),
        })?;

        // The header block ends at the first blank line; everything between it
        // and the diff is the commit message.
        let header_end = header_end.unwrap_or(diff_start);

        let subject = content[..header_end].lines().find_map(|line| {
            line.strip_prefix(SUBJECT_PREFIX)
                .map(|s| strip_patch_tag(s.trim()).to_string())
        });

        let body: Vec<&str> = content[header_end..diff_start]
            .lines()
            .skip_while(|line| line.trim().is_empty())
            .collect();
        let body_text = body.join("\n").trim_end().to_string();

        let message = if !body_text.is_empty() {
            body_text
        } else {
            match subject {
                Some(s) if !s.is_empty() => s,
                _ => FALLBACK_MESSAGE.to_string(),
            }
        };

        let mut diff = content[diff_start..].to_string();
        if !diff.ends_with('\n') {
            diff.push('\n');
        }

        Ok(Self { message, diff })
    }

    /// Render a body for a commit. `message` is the full commit message; its
    /// first line becomes the subject.
    pub fn render(commit_sha: &str, date: DateTime<Utc>, message: &str, diff: &str) -> String {
        let message = message.trim();
        let subject = message.lines().next().unwrap_or(FALLBACK_MESSAGE);
        let mut out = String::new();
        out.push_str(&format!("From {} Mon Sep 17 00:00:00 2001\n", commit_sha));
        out.push_str(&format!("Date: {}\n", date.to_rfc2822()));
        out.push_str(&format!("{} [PATCH] {}\n", SUBJECT_PREFIX, subject));
        out.push_str(PATCH_AUTHOR);
        out.push('\n');
        out.push_str(PATCH_MARKER);
        out.push_str("\n\n");
        if !message.is_empty() {
            out.push_str(message);
            out.push_str("\n\n");
        }
        out.push_str(diff);
        if !diff.ends_with('\n') {
            out.push('\n');
        }
        out
    }
}

/// Whether a stored body carries the patchkeeper marker header.
pub fn is_generated(content: &str) -> bool {
    content
        .lines()
        .take_while(|line| !line.trim().is_empty())
        .any(|line| line.trim() == PATCH_MARKER)
}

/// Commit id on the leading `From <sha>` line, if present.
pub fn source_commit(content: &str) -> Option<&str> {
    content
        .lines()
        .next()?
        .strip_prefix("From ")?
        .split_whitespace()
        .next()
}

fn strip_patch_tag(subject: &str) -> &str {
    match subject.strip_prefix('[') {
        Some(rest) => match rest.find(']') {
            Some(end) if rest[..end].starts_with("PATCH") => rest[end + 1..].trim_start(),
            _ => subject,
        },
        None => subject,
    }
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// Leading numeric prefix of a patch name (`0003-fix` → 3).
pub fn number_prefix(name: &str) -> Option<u32> {
    let re = Regex::new(r"^(\d+)").ok()?;
    re.captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Lowercase, dash-separated slug of a commit subject.
pub fn slugify(subject: &str) -> String {
    let mut slug = String::with_capacity(subject.len());
    let mut pending_dash = false;
    for ch in subject.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "patch".to_string()
    } else {
        slug
    }
}

/// Compose a patch name from its number and subject.
pub fn patch_name(number: u32, subject: &str) -> String {
    format!("{:04}-{}", number, slugify(subject))
}

/// Check that `name` can live in the patch namespace.
pub fn validate_name(name: &str) -> Result<(), PatchError> {
    let invalid = |detail: &str| {
        Err(PatchError::InvalidName {
            name: name.to_string(),
            detail: detail.to_string(),
        })
    };
    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.contains('/') {
        return invalid("name must not contain '/'");
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return invalid("name must not contain whitespace");
    }
    if name.starts_with('.') || name.starts_with('-') {
        return invalid("name must not start with '.' or '-'");
    }
    if !git2::Reference::is_valid_name(&format!("refs/patches/{}", name)) {
        return invalid("not a valid git reference component");
    }
    Ok(())
}
