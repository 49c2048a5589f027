//! Copying the package into the host's load directory.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::archive;
use crate::core::Hash32;
use crate::error::StagingError;
use crate::package::PackageArtifact;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Copied(Utf8PathBuf),
    UpToDate(Utf8PathBuf),
}

/// Places packages into a directory owned by the host. Only the package file
/// itself is ever written there; nothing is listed or removed.
#[derive(Debug, Clone)]
pub struct Stager {
    dir: Utf8PathBuf,
    always: bool,
}

impl Stager {
    pub fn new(dir: impl Into<Utf8PathBuf>, always: bool) -> Self {
        Self {
            dir: dir.into(),
            always,
        }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Destination of `artifact`, named like the artifact itself.
    pub fn target(&self, artifact: &Utf8Path) -> Utf8PathBuf {
        match artifact.file_name() {
            Some(name) => self.dir.join(name),
            None => self.dir.join(artifact),
        }
    }

    /// Whether the file at the target already has the artifact's content.
    /// Sizes are compared first, hashes only when they match.
    pub fn is_up_to_date(&self, artifact: &Utf8Path) -> Result<bool, StagingError> {
        let source = fs::metadata(artifact)
            .map_err(|_| StagingError::MissingArtifact(artifact.to_owned()))?;

        if self.always {
            return Ok(false);
        }

        let target = self.target(artifact);
        let Ok(staged) = fs::metadata(&target) else {
            return Ok(false);
        };
        if !staged.is_file() || staged.len() != source.len() {
            return Ok(false);
        }

        let hash = |path: &Utf8Path| {
            Hash32::hash_file(path).map_err(|source| StagingError::Fingerprint {
                path: path.to_owned(),
                source,
            })
        };

        Ok(hash(artifact)? == hash(&target)?)
    }

    pub fn stage(&self, artifact: &PackageArtifact) -> Result<StageOutcome, StagingError> {
        let target = self.target(&artifact.path);

        if self.is_up_to_date(&artifact.path)? {
            tracing::debug!(path = %target, "Deployment is up to date");
            return Ok(StageOutcome::UpToDate(target));
        }

        tracing::info!("Deploying: {} -> {}", artifact.path, target);

        fs::create_dir_all(&self.dir).map_err(|source| StagingError::NotWritable {
            path: self.dir.clone(),
            source,
        })?;

        // The host may poll the directory, so the jar only appears complete.
        let temp = archive::staging_path(&target);
        let result = fs::copy(&artifact.path, &temp)
            .and_then(|_| fs::rename(&temp, &target))
            .map_err(|source| StagingError::NotWritable {
                path: target.clone(),
                source,
            });

        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result?;

        Ok(StageOutcome::Copied(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TempDir;

    fn artifact(dir: &Utf8Path, content: &[u8]) -> PackageArtifact {
        let path = dir.join("build/libs/demo-1.0.jar");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();

        PackageArtifact {
            path,
            classifier: String::new(),
            inputs: Hash32::default(),
            content: Hash32::hash(content),
        }
    }

    #[test]
    fn test_second_stage_is_up_to_date() {
        let dir = TempDir::new("stage-twice");
        let artifact = artifact(dir.path(), b"package");
        let stager = Stager::new(dir.path().join("server/mods"), false);

        let target = dir.path().join("server/mods/demo-1.0.jar");
        assert_eq!(stager.stage(&artifact).unwrap(), StageOutcome::Copied(target.clone()));
        assert_eq!(stager.stage(&artifact).unwrap(), StageOutcome::UpToDate(target.clone()));
        assert_eq!(fs::read(&target).unwrap(), b"package");
    }

    #[test]
    fn test_changed_content_is_copied() {
        let dir = TempDir::new("stage-changed");
        let mods = dir.path().join("mods");
        fs::create_dir_all(&mods).unwrap();
        fs::write(mods.join("demo-1.0.jar"), b"pAckage").unwrap();
        fs::write(mods.join("other.jar"), b"keep").unwrap();

        let artifact = artifact(dir.path(), b"package");
        let stager = Stager::new(&mods, false);

        assert!(matches!(stager.stage(&artifact).unwrap(), StageOutcome::Copied(_)));
        assert_eq!(fs::read(mods.join("demo-1.0.jar")).unwrap(), b"package");
        assert_eq!(fs::read(mods.join("other.jar")).unwrap(), b"keep");
    }

    #[test]
    fn test_copy_leaves_no_partial_file() {
        let dir = TempDir::new("stage-atomic");
        let mods = dir.path().join("mods");
        let artifact = artifact(dir.path(), b"package");
        let stager = Stager::new(&mods, false);

        stager.stage(&artifact).unwrap();

        let names: Vec<String> = fs::read_dir(&mods)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, ["demo-1.0.jar"]);
    }

    #[test]
    fn test_failed_rename_keeps_previous_target() {
        let dir = TempDir::new("stage-rename");
        let mods = dir.path().join("mods");
        // A non-empty directory where the jar should go.
        fs::create_dir_all(mods.join("demo-1.0.jar/inner")).unwrap();
        let artifact = artifact(dir.path(), b"package");
        let stager = Stager::new(&mods, false);

        assert!(matches!(
            stager.stage(&artifact),
            Err(StagingError::NotWritable { .. })
        ));
        assert!(mods.join("demo-1.0.jar/inner").is_dir());
        assert!(!archive::staging_path(&mods.join("demo-1.0.jar")).exists());
    }

    #[test]
    fn test_always_copies() {
        let dir = TempDir::new("stage-always");
        let artifact = artifact(dir.path(), b"package");
        let stager = Stager::new(dir.path().join("mods"), true);

        stager.stage(&artifact).unwrap();
        assert!(matches!(stager.stage(&artifact).unwrap(), StageOutcome::Copied(_)));
    }

    #[test]
    fn test_unwritable_destination() {
        let dir = TempDir::new("stage-unwritable");
        let artifact = artifact(dir.path(), b"package");
        // A regular file where the directory should be.
        fs::write(dir.path().join("mods"), b"").unwrap();
        let stager = Stager::new(dir.path().join("mods"), false);

        match stager.stage(&artifact).unwrap_err() {
            StagingError::NotWritable { path, .. } => assert_eq!(path, dir.path().join("mods")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_artifact() {
        let dir = TempDir::new("stage-missing");
        let stager = Stager::new(dir.path().join("mods"), false);
        let artifact = PackageArtifact {
            path: dir.path().join("nope.jar"),
            classifier: String::new(),
            inputs: Hash32::default(),
            content: Hash32::default(),
        };

        assert!(matches!(
            stager.stage(&artifact),
            Err(StagingError::MissingArtifact(_))
        ));
    }
}
