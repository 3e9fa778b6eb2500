//! Artifact storage layout and path containment.
//!
//! Artifacts live on the filesystem under configured roots: worker logs at
//! `<root>/<run_id>/...`, merge-gate check logs at
//! `<root>/<run_id>/merge-gate/...`. Database rows point at them by URI; the
//! content endpoint only serves URIs that resolve inside a configured root.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Layout helper rooted at the configured artifact directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ArtifactStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<run_id>/`, created on demand.
    pub fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        let dir = self.root.join(run_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create artifact dir {}", dir.display()))?;
        Ok(dir)
    }

    /// `<root>/<run_id>/merge-gate/`, created on demand.
    pub fn merge_gate_dir(&self, run_id: &str) -> Result<PathBuf> {
        let dir = self.root.join(run_id).join("merge-gate");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create artifact dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Path of the agent's combined output log.
    pub fn codex_stdout_path(&self, run_id: &str) -> Result<PathBuf> {
        Ok(self.run_dir(run_id)?.join("codex.stdout.log"))
    }

    /// Path of a validation check's log.
    pub fn check_log_path(&self, run_id: &str, check_name: &str) -> Result<PathBuf> {
        Ok(self.run_dir(run_id)?.join(format!("{check_name}.log")))
    }

    /// Path of a publish step's log.
    pub fn publish_log_path(&self, run_id: &str, step: &str) -> Result<PathBuf> {
        Ok(self.run_dir(run_id)?.join(format!("publish-{step}.log")))
    }

    /// Path of a merge-gate check's log.
    pub fn merge_gate_log_path(&self, run_id: &str, check_name: &str) -> Result<PathBuf> {
        Ok(self.merge_gate_dir(run_id)?.join(format!("{check_name}.log")))
    }
}

/// Resolve an artifact URI to a filesystem path. Accepts absolute paths and
/// `file://` URIs; anything else is unsupported.
pub fn artifact_path_from_uri(uri: &str) -> Option<PathBuf> {
    let value = uri.trim();
    if value.is_empty() {
        return None;
    }
    if let Some(rest) = value.strip_prefix("file://") {
        if rest.is_empty() {
            return None;
        }
        return Some(PathBuf::from(rest));
    }
    if value.starts_with('/') {
        return Some(PathBuf::from(value));
    }
    None
}

/// True when `path` resolves under any of the given roots. Non-existent
/// paths or roots never match.
pub fn is_within_roots(path: &Path, roots: &[PathBuf]) -> bool {
    let Ok(resolved) = path.canonicalize() else {
        return false;
    };
    roots.iter().any(|root| {
        root.canonicalize()
            .map(|root| resolved == root || resolved.starts_with(&root))
            .unwrap_or(false)
    })
}

/// MIME type guess from the file extension, `text/plain` fallback.
pub fn guess_mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("json") => "application/json",
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("pdf") => "application/pdf",
        _ => "text/plain",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_resolution_accepts_absolute_and_file_uris() {
        assert_eq!(
            artifact_path_from_uri("/var/log/x.log"),
            Some(PathBuf::from("/var/log/x.log"))
        );
        assert_eq!(
            artifact_path_from_uri("file:///var/log/x.log"),
            Some(PathBuf::from("/var/log/x.log"))
        );
        assert_eq!(artifact_path_from_uri("relative/path.log"), None);
        assert_eq!(artifact_path_from_uri("   "), None);
        assert_eq!(artifact_path_from_uri("file://"), None);
    }

    #[test]
    fn containment_rejects_paths_outside_roots() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let inside_file = root.path().join("r-1").join("codex.stdout.log");
        std::fs::create_dir_all(inside_file.parent().unwrap()).unwrap();
        std::fs::write(&inside_file, "log").unwrap();
        let outside_file = outside.path().join("secret.log");
        std::fs::write(&outside_file, "secret").unwrap();

        let roots = vec![root.path().to_path_buf()];
        assert!(is_within_roots(&inside_file, &roots));
        assert!(!is_within_roots(&outside_file, &roots));
        assert!(!is_within_roots(Path::new("/definitely/missing"), &roots));
    }

    #[test]
    fn store_layout_matches_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let stdout = store.codex_stdout_path("r-1").unwrap();
        assert!(stdout.ends_with("r-1/codex.stdout.log"));
        let gate = store.merge_gate_log_path("r-1", "lint").unwrap();
        assert!(gate.ends_with("r-1/merge-gate/lint.log"));
        assert!(gate.parent().unwrap().is_dir());
    }

    #[test]
    fn mime_guessing_defaults_to_text() {
        assert_eq!(guess_mime_type(Path::new("a.json")), "application/json");
        assert_eq!(guess_mime_type(Path::new("a.log")), "text/plain");
        assert_eq!(guess_mime_type(Path::new("noext")), "text/plain");
    }
}
