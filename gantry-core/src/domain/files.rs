//! Output file descriptors

use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

/// Where an output file ends up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Returned in the output sandbox and downloaded into the job workspace
    Sandbox,
    /// Uploaded by the job to grid storage; only its locations come back
    Remote,
}

/// A declared output file
///
/// Patterns may contain shell wildcards, in which case every concrete file
/// found for the pattern becomes a subfile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFile {
    pub pattern: String,
    pub kind: FileKind,
    #[serde(default)]
    pub lfn: Option<String>,
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub subfiles: Vec<OutputFile>,
}

impl OutputFile {
    pub fn new(pattern: impl Into<String>, kind: FileKind) -> Self {
        Self {
            pattern: pattern.into(),
            kind,
            lfn: None,
            guid: None,
            locations: Vec::new(),
            failure_reason: None,
            subfiles: Vec::new(),
        }
    }

    pub fn sandbox(pattern: impl Into<String>) -> Self {
        Self::new(pattern, FileKind::Sandbox)
    }

    pub fn remote(pattern: impl Into<String>) -> Self {
        Self::new(pattern, FileKind::Remote)
    }

    pub fn has_wildcard(&self) -> bool {
        self.pattern.contains(['*', '?', '['])
    }

    /// A copy with the declaration only, dropping anything resolved so far
    pub fn declaration(&self) -> Self {
        Self::new(self.pattern.clone(), self.kind)
    }

    /// Records a concrete file found for this declaration
    pub fn resolve(
        &mut self,
        name: &str,
        lfn: Option<String>,
        locations: Vec<String>,
        guid: Option<String>,
    ) {
        if self.has_wildcard() {
            if let Some(existing) = self.subfiles.iter_mut().find(|f| f.pattern == name) {
                existing.lfn = lfn;
                existing.locations = locations;
                existing.guid = guid;
                return;
            }
            let mut subfile = OutputFile::new(name, self.kind);
            subfile.lfn = lfn;
            subfile.locations = locations;
            subfile.guid = guid;
            self.subfiles.push(subfile);
        } else {
            self.lfn = lfn;
            self.locations = locations;
            self.guid = guid;
        }
    }

    pub fn is_matched(&self) -> bool {
        self.lfn.is_some() || !self.locations.is_empty() || !self.subfiles.is_empty()
    }

    /// Policy checks run before submission
    pub fn validate(&self) -> Result<(), String> {
        if self.pattern.trim().is_empty() {
            return Err("output file pattern is empty".to_string());
        }
        let path = Path::new(&self.pattern);
        if path.is_absolute() {
            return Err(format!("output file '{}' must be relative", self.pattern));
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(format!(
                "output file '{}' must not leave the job directory",
                self.pattern
            ));
        }
        if self.kind == FileKind::Remote && self.pattern.contains('/') {
            return Err(format!(
                "remote output file '{}' must be a plain file name",
                self.pattern
            ));
        }
        Ok(())
    }

    /// Failure reasons of this file and all of its subfiles
    pub fn failures(&self) -> Vec<String> {
        let mut reasons: Vec<String> = self
            .failure_reason
            .iter()
            .map(|reason| format!("{}: {}", self.pattern, reason))
            .collect();
        for subfile in &self.subfiles {
            reasons.extend(subfile.failures());
        }
        reasons
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_resolution_creates_subfiles() {
        let mut file = OutputFile::remote("*.root");
        file.resolve("a.root", Some("/lfn/a.root".into()), vec!["CERN-DST".into()], None);
        file.resolve("b.root", Some("/lfn/b.root".into()), vec![], None);
        file.resolve("a.root", Some("/lfn/a2.root".into()), vec![], None);

        assert_eq!(file.subfiles.len(), 2);
        assert_eq!(file.subfiles[0].lfn.as_deref(), Some("/lfn/a2.root"));
        assert!(file.lfn.is_none());
        assert!(file.is_matched());
    }

    #[test]
    fn test_plain_resolution_sets_fields() {
        let mut file = OutputFile::remote("hist.root");
        assert!(!file.is_matched());
        file.resolve("hist.root", Some("/lfn/hist.root".into()), vec!["RAL".into()], Some("g1".into()));
        assert_eq!(file.guid.as_deref(), Some("g1"));
        assert!(file.is_matched());
    }

    #[test]
    fn test_validate_rejects_escaping_paths() {
        assert!(OutputFile::sandbox("out/log.txt").validate().is_ok());
        assert!(OutputFile::sandbox("").validate().is_err());
        assert!(OutputFile::sandbox("/etc/passwd").validate().is_err());
        assert!(OutputFile::sandbox("../x").validate().is_err());
        assert!(OutputFile::remote("dir/x.root").validate().is_err());
    }

    #[test]
    fn test_failures_are_collected_recursively() {
        let mut file = OutputFile::remote("*.root");
        file.resolve("a.root", None, vec![], None);
        file.subfiles[0].failure_reason = Some("upload failed".into());
        assert_eq!(file.failures(), vec!["a.root: upload failed".to_string()]);
    }
}
