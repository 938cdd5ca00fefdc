//! Integrity engine (§4.F): manifest generation, signing, and
//! verification.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{BuildError, IntegrityError};

const STREAM_CHUNK: usize = 64 * 1024;
/// Literal marker written when no signing identity is configured — explicit,
/// never an absent/null field (§4.F).
pub const UNSIGNED_MARKER: &str = "unsigned";

/// Relative path of the manifest itself, excluded from `Manifest::build`'s
/// walk: the manifest cannot list its own digest before it is written, and
/// must not be re-included once it is, or a build and its own verify-mode
/// run would disagree (§8: "Verify mode over a freshly built output
/// directory reports zero mismatches").
pub const MANIFEST_FILENAME: &str = "manifest.sha256";
/// Relative path of the signature envelope, excluded from the walk for the
/// same reason as [`MANIFEST_FILENAME`].
pub const SIGNATURE_FILENAME: &str = "manifest.sig.json";

/// One manifest line: a file's relative POSIX path and its hex SHA-256.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Relative path, POSIX separators.
    pub path: String,
    /// Lowercase hex SHA-256 digest.
    pub digest: String,
}

/// The full ordered manifest.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    /// Entries, sorted lexicographically by path.
    pub entries: Vec<ManifestEntry>,
}

/// Stream-hash a file without buffering it fully in memory (required for
/// the 31 MB streaming-hash property in §8).
///
/// # Errors
///
/// Returns [`BuildError::Io`] on a read failure.
pub fn hash_file(path: &Path) -> Result<String, BuildError> {
    let mut file = File::open(path).map_err(|e| BuildError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; STREAM_CHUNK];
    loop {
        let read = file.read(&mut buf).map_err(|e| BuildError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

impl Manifest {
    /// Walk `output_dir`, hash every file except the manifest and
    /// signature envelope themselves, and sort the result lexicographically
    /// by relative path.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Io`] if traversal or hashing fails.
    pub fn build(output_dir: &Path) -> Result<Self, BuildError> {
        let paths: Vec<PathBuf> = WalkDir::new(output_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .collect();

        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            let relative = path
                .strip_prefix(output_dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");
            if relative == MANIFEST_FILENAME || relative == SIGNATURE_FILENAME {
                continue;
            }
            let digest = hash_file(&path)?;
            entries.push(ManifestEntry { path: relative, digest });
        }
        // Sort by the rendered POSIX path string, not by `PathBuf`'s
        // component-wise ordering: the two diverge whenever a directory
        // separator and a `-` (or any byte below `/` = 0x2F) compete at the
        // same position, e.g. "post-1.html" vs "post/1.html" (§6, §8:
        // "Manifest lines are strictly sorted").
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Self { entries })
    }

    /// Render to the line format `<64 hex><space><space><path><LF>`,
    /// lexicographically sorted by path, trailing newline required.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.digest);
            out.push_str("  ");
            out.push_str(&entry.path);
            out.push('\n');
        }
        out
    }

    /// Parse a manifest text back into entries.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Configuration`] on a malformed line.
    pub fn parse(text: &str) -> Result<Self, BuildError> {
        let mut entries = Vec::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let Some((digest, path)) = line.split_once("  ") else {
                return Err(BuildError::Configuration(format!(
                    "malformed manifest line: {line}"
                )));
            };
            entries.push(ManifestEntry {
                path: path.to_string(),
                digest: digest.to_string(),
            });
        }
        Ok(Self { entries })
    }

    /// Write the manifest to `manifest.sha256` inside `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Io`] on a filesystem failure.
    pub fn write(&self, output_dir: &Path) -> Result<(), BuildError> {
        let path = output_dir.join(MANIFEST_FILENAME);
        std::fs::write(&path, self.render()).map_err(|e| BuildError::io(&path, e))
    }

    /// Recompute every digest under `output_dir` and compare against this
    /// manifest. Missing, extra, and mismatched files are distinct error
    /// kinds.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Integrity`] describing the first category of
    /// divergence found (missing files take priority, then extra, then
    /// mismatch), and [`BuildError::Io`] on a traversal failure.
    pub fn verify(&self, output_dir: &Path) -> Result<VerifyReport, BuildError> {
        let actual = Self::build(output_dir)?;
        let expected_map: std::collections::BTreeMap<&str, &str> = self
            .entries
            .iter()
            .map(|e| (e.path.as_str(), e.digest.as_str()))
            .collect();
        let actual_map: std::collections::BTreeMap<&str, &str> = actual
            .entries
            .iter()
            .map(|e| (e.path.as_str(), e.digest.as_str()))
            .collect();

        let missing: Vec<String> = expected_map
            .keys()
            .filter(|p| !actual_map.contains_key(*p))
            .map(|p| (*p).to_string())
            .collect();
        let extra: Vec<String> = actual_map
            .keys()
            .filter(|p| !expected_map.contains_key(*p))
            .map(|p| (*p).to_string())
            .collect();
        let mismatched: Vec<String> = expected_map
            .iter()
            .filter_map(|(path, digest)| {
                actual_map
                    .get(path)
                    .filter(|actual_digest| *actual_digest != digest)
                    .map(|_| (*path).to_string())
            })
            .collect();

        let report = VerifyReport { missing, extra, mismatched };

        if !report.missing.is_empty() {
            return Err(IntegrityError::Missing(report.missing.len()).into());
        }
        if !report.extra.is_empty() {
            return Err(IntegrityError::Extra(report.extra.len()).into());
        }
        if !report.mismatched.is_empty() {
            return Err(IntegrityError::Mismatch(report.mismatched.len()).into());
        }
        Ok(report)
    }
}

/// Structured result of a verify-mode run (read-only, returned even on
/// failure paths that the caller chooses to inspect rather than propagate).
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    /// Paths present in the manifest but absent from the output tree.
    pub missing: Vec<String>,
    /// Paths present in the output tree but absent from the manifest.
    pub extra: Vec<String>,
    /// Paths present in both with differing digests.
    pub mismatched: Vec<String>,
}

/// Companion metadata plus a detached signature over the serialised
/// manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    /// Envelope schema version.
    pub manifest_version: String,
    /// Creation timestamp, fixed to the build epoch.
    pub created_at: DateTime<Utc>,
    /// Source commit identifier.
    pub source_commit: String,
    /// Hex-encoded detached signature over the manifest bytes, or the
    /// literal [`UNSIGNED_MARKER`] when no signing identity is configured.
    pub signature: String,
}

impl SignatureEnvelope {
    /// Build an unsigned envelope.
    #[must_use]
    pub fn unsigned(created_at: DateTime<Utc>, source_commit: String) -> Self {
        Self {
            manifest_version: "1".to_string(),
            created_at,
            source_commit,
            signature: UNSIGNED_MARKER.to_string(),
        }
    }

    /// Build a signed envelope over `manifest_bytes` using `signing_key`.
    #[must_use]
    pub fn signed(
        created_at: DateTime<Utc>,
        source_commit: String,
        signing_key: &SigningKey,
        manifest_bytes: &[u8],
    ) -> Self {
        let signature: DalekSignature = signing_key.sign(manifest_bytes);
        Self {
            manifest_version: "1".to_string(),
            created_at,
            source_commit,
            signature: hex::encode(signature.to_bytes()),
        }
    }

    /// Verify this envelope's signature over `manifest_bytes` with the
    /// given public key. Returns `Ok(false)` (not an error) when the
    /// envelope is explicitly unsigned.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Configuration`] if the signature field is
    /// present but not valid hex/signature bytes.
    pub fn verify(&self, verifying_key: &VerifyingKey, manifest_bytes: &[u8]) -> Result<bool, BuildError> {
        if self.signature == UNSIGNED_MARKER {
            return Ok(false);
        }
        let raw = hex::decode(&self.signature)
            .map_err(|e| BuildError::Configuration(format!("invalid signature hex: {e}")))?;
        let bytes: [u8; 64] = raw
            .try_into()
            .map_err(|_| BuildError::Configuration("signature must be 64 bytes".to_string()))?;
        let signature = DalekSignature::from_bytes(&bytes);
        Ok(verifying_key.verify_strict(manifest_bytes, &signature).is_ok())
    }

    /// Write the envelope as `manifest.sig.json` inside `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Io`] on a filesystem failure.
    pub fn write(&self, output_dir: &Path) -> Result<(), BuildError> {
        let path = output_dir.join(SIGNATURE_FILENAME);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BuildError::Configuration(format!("failed to serialise signature envelope: {e}")))?;
        let mut file = File::create(&path).map_err(|e| BuildError::io(&path, e))?;
        file.write_all(json.as_bytes()).map_err(|e| BuildError::io(&path, e))
    }
}


#[cfg(test)]
mod manifest_properties {
    use super::*;
    use proptest::collection::hash_set;
    use proptest::prelude::*;

    proptest! {
        /// Regardless of which distinct file names exist on disk, the built
        /// manifest's lines are strictly sorted by path and each path
        /// appears exactly once (§8).
        #[test]
        fn manifest_is_sorted_with_unique_paths(
            names in hash_set("[a-z][a-z0-9]{0,12}\\.html", 1..20)
        ) {
            let dir = tempfile::tempdir().unwrap();
            for name in &names {
                std::fs::write(dir.path().join(name), b"content").unwrap();
            }
            let manifest = Manifest::build(dir.path()).unwrap();

            let paths: Vec<&str> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
            let mut sorted = paths.clone();
            sorted.sort_unstable();
            prop_assert_eq!(&paths, &sorted);

            let unique: std::collections::HashSet<&str> = paths.iter().copied().collect();
            prop_assert_eq!(unique.len(), paths.len());
            prop_assert_eq!(paths.len(), names.len());
        }

        /// Parsing a manifest's own rendering recovers the same entries.
        #[test]
        fn render_then_parse_round_trips(
            names in hash_set("[a-z][a-z0-9]{0,12}\\.html", 1..10)
        ) {
            let mut entries: Vec<ManifestEntry> = names
                .into_iter()
                .map(|name| ManifestEntry { path: name, digest: "0".repeat(64) })
                .collect();
            entries.sort_by(|a, b| a.path.cmp(&b.path));
            let manifest = Manifest { entries: entries.clone() };

            let parsed = Manifest::parse(&manifest.render()).unwrap();
            prop_assert_eq!(parsed.entries, entries);
        }
    }
}
