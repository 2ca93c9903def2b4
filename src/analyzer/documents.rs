//! Document parsing capability: turns a subject's downloaded tender
//! documents into the raw text every later phase works from.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::json;
use tracing::{debug, warn};

use super::{Analyzer, AnalyzerError, PhaseInput, PhaseOutput};

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "html", "htm", "json"];

/// Everything but `[A-Za-z0-9_-]` is escaped, including `.` and `%`, so the
/// encoding is injective and never yields `.` or `..`.
const SUBJECT_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// Reads `<root>/<subject>/*` text documents.
pub struct DocumentAnalyzer {
    root: PathBuf,
}

impl DocumentAnalyzer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding a subject's documents: the percent-encoded subject
    /// directly under the root. `None` for an empty subject.
    pub fn subject_dir(&self, subject: &str) -> Option<PathBuf> {
        if subject.is_empty() {
            return None;
        }
        let name = utf8_percent_encode(subject, SUBJECT_ESCAPE).to_string();
        Some(self.root.join(name))
    }
}

#[async_trait]
impl Analyzer for DocumentAnalyzer {
    async fn analyze(
        &self,
        input: &PhaseInput,
        _deadline: Duration,
    ) -> Result<PhaseOutput, AnalyzerError> {
        let dir = self
            .subject_dir(&input.subject)
            .ok_or_else(|| AnalyzerError::FatalInput("empty subject".to_string()))?;
        let paths = list_documents(&dir).await?;
        if paths.is_empty() {
            return Err(AnalyzerError::FatalInput(format!(
                "no documents found in {}",
                dir.display()
            )));
        }

        let mut documents = Vec::new();
        let mut text = String::new();
        let mut unreadable = 0usize;
        for path in &paths {
            match tokio::fs::read_to_string(path).await {
                Ok(content) if !content.trim().is_empty() => {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    documents.push(json!({ "name": name, "chars": content.len() }));
                    if !text.is_empty() {
                        text.push_str("\n\n");
                    }
                    text.push_str(content.trim());
                }
                Ok(_) => unreadable += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable document");
                    unreadable += 1;
                }
            }
        }

        if text.is_empty() {
            return Err(AnalyzerError::FatalInput(format!(
                "documents in {} contain no text",
                dir.display()
            )));
        }

        debug!(
            subject = %input.subject,
            documents = documents.len(),
            unreadable,
            "documents parsed"
        );
        let confidence = documents.len() as f64 / paths.len() as f64;
        Ok(PhaseOutput::new(
            json!({ "documents": documents, "text": text }),
            confidence,
        ))
    }
}

async fn list_documents(dir: &Path) -> Result<Vec<PathBuf>, AnalyzerError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AnalyzerError::Transient(format!("read {}: {e}", dir.display()))),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| AnalyzerError::Transient(format!("read {}: {e}", dir.display())))?
    {
        let path = entry.path();
        let is_text = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| TEXT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if is_text {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use std::collections::BTreeMap;

    fn input(subject: &str) -> PhaseInput {
        PhaseInput {
            subject: subject.to_string(),
            phase: Phase::ParseDocuments,
            prior: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn missing_directory_is_fatal_input() {
        let root = tempfile::tempdir().unwrap();
        let analyzer = DocumentAnalyzer::new(root.path());
        let err = analyzer
            .analyze(&input("T-404"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::FatalInput(_)));
    }

    #[tokio::test]
    async fn concatenates_text_documents() {
        let root = tempfile::tempdir().unwrap();
        let analyzer = DocumentAnalyzer::new(root.path());
        let dir = analyzer.subject_dir("https://tenders.example/t/42").unwrap();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.txt"), "Scope: resurfacing").unwrap();
        std::fs::write(dir.join("b.md"), "EMD: 2 lakh").unwrap();
        std::fs::write(dir.join("drawing.dwg"), "binary").unwrap();

        let out = analyzer
            .analyze(&input("https://tenders.example/t/42"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out.confidence, 1.0);
        assert_eq!(out.output["documents"].as_array().unwrap().len(), 2);
        assert_eq!(out.output["text"], "Scope: resurfacing\n\nEMD: 2 lakh");
    }

    #[test]
    fn subject_dirs_stay_under_the_root_and_never_collide() {
        let analyzer = DocumentAnalyzer::new("/srv/documents");
        for subject in ["..", ".", "../etc", "a/../../b", "a/b", "a_b", "a%2Fb"] {
            let dir = analyzer.subject_dir(subject).unwrap();
            assert_eq!(dir.parent(), Some(Path::new("/srv/documents")), "{subject}");
            let name = dir.file_name().unwrap().to_str().unwrap();
            assert!(name != "." && name != "..", "{subject}");
        }
        assert_ne!(analyzer.subject_dir("a/b"), analyzer.subject_dir("a_b"));
        assert_ne!(analyzer.subject_dir("a/b"), analyzer.subject_dir("a%2Fb"));
        assert_eq!(analyzer.subject_dir(""), None);
    }

    #[tokio::test]
    async fn dot_dot_subject_does_not_read_the_parent_directory() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("documents");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(parent.path().join("secrets.json"), r#"{"db_password":"x"}"#).unwrap();
        std::fs::write(root.join("stray.txt"), "root level file").unwrap();

        let analyzer = DocumentAnalyzer::new(&root);
        for subject in ["..", "."] {
            let err = analyzer
                .analyze(&input(subject), Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(matches!(err, AnalyzerError::FatalInput(_)), "{subject}");
        }
    }
}
