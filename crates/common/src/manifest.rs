// Large-object manifest: one `<relative path>:oid sha256:<hex>` entry per line.
//
// Objects live in the source store sharded by hash as
// `<prefix>/<h[0..2]>/<h[2..4]>/<h[4..]>` and are copied to
// `<repo prefix>/<relative path>` in the destination.

use thiserror::Error;

const OID_SEPARATOR: &str = ":oid sha256:";
/// Two shard levels of two hex chars each, plus at least one remaining char.
const MIN_OID_LEN: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("line {line}: missing `{OID_SEPARATOR}` separator")]
    MissingSeparator { line: usize },

    #[error("line {line}: empty object path")]
    EmptyPath { line: usize },

    #[error("line {line}: object path contains traversal component: {path}")]
    Traversal { line: usize, path: String },

    #[error("line {line}: invalid sha256 oid `{oid}`")]
    InvalidOid { line: usize, oid: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Path of the pointer file relative to the repository root.
    pub path: String,
    /// Lowercase hex content hash.
    pub oid: String,
}

impl ManifestEntry {
    /// Key of the object in the sharded source store.
    pub fn source_key(&self, lfs_prefix: &str) -> String {
        let oid = self.oid.as_str();
        join_key(&[lfs_prefix, &oid[..2], &oid[2..4], &oid[4..]])
    }

    /// Key of the object under the repository's destination prefix.
    pub fn destination_key(&self, repo_prefix: &str) -> String {
        join_key(&[repo_prefix, &self.path])
    }
}

/// Parse a whole manifest. Blank lines are skipped; the first malformed line
/// fails the parse.
pub fn parse_manifest(text: &str) -> Result<Vec<ManifestEntry>, ManifestError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| parse_line(idx + 1, line))
        .collect()
}

fn parse_line(line_no: usize, line: &str) -> Result<ManifestEntry, ManifestError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (path, oid) = line
        .split_once(OID_SEPARATOR)
        .ok_or(ManifestError::MissingSeparator { line: line_no })?;

    if path.is_empty() {
        return Err(ManifestError::EmptyPath { line: line_no });
    }
    if path.split('/').any(|component| component == "..") {
        return Err(ManifestError::Traversal { line: line_no, path: path.to_string() });
    }

    let oid = oid.trim();
    if oid.len() < MIN_OID_LEN || !oid.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ManifestError::InvalidOid { line: line_no, oid: oid.to_string() });
    }

    Ok(ManifestEntry { path: path.to_string(), oid: oid.to_ascii_lowercase() })
}

/// Join object-store key segments with `/`, dropping empty segments and
/// redundant slashes at segment boundaries.
pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim_matches('/'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
