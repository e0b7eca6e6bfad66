//! Artifact import stages
//!
//! An import copies files out of another (artifact) image into the image
//! being built. Imports are attached to a lifecycle anchor; the stage graph
//! asks for the import stage of each anchor and gets nothing back when no
//! import targets it.

use crate::error::{StrataError, StrataResult};
use crate::stage::image::StageImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Mount point of artifact exports inside the build container
const IMPORT_MOUNT_ROOT: &str = "/.strata/import";

/// User stage an import is ordered against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Install,
    Setup,
}

/// Point in the stage chain where imports are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportAnchor {
    Before(Stage),
    After(Stage),
}

impl ImportAnchor {
    /// Name of the import stage generated for this anchor
    pub fn stage_name(&self) -> &'static str {
        match self {
            Self::Before(Stage::Install) => "before_install_artifact",
            Self::After(Stage::Install) => "after_install_artifact",
            Self::Before(Stage::Setup) => "before_setup_artifact",
            Self::After(Stage::Setup) => "after_setup_artifact",
        }
    }
}

impl fmt::Display for ImportAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stage_name())
    }
}

/// Files to copy from an artifact image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactImport {
    pub image_name: String,
    /// Directory in the artifact image
    pub add: String,
    /// Destination directory in the image being built
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Stage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl ArtifactImport {
    pub fn new(image_name: impl Into<String>, add: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            image_name: image_name.into(),
            add: add.into(),
            to: to.into(),
            before: None,
            after: None,
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            owner: None,
            group: None,
        }
    }

    pub fn before(mut self, stage: Stage) -> Self {
        self.before = Some(stage);
        self
    }

    pub fn after(mut self, stage: Stage) -> Self {
        self.after = Some(stage);
        self
    }

    pub fn is_attached_to(&self, anchor: ImportAnchor) -> bool {
        match anchor {
            ImportAnchor::Before(stage) => self.before == Some(stage),
            ImportAnchor::After(stage) => self.after == Some(stage),
        }
    }

    fn mount_point(&self) -> String {
        let digest = hex::encode(Sha256::digest(self.image_name.as_bytes()));
        format!("{}/{}", IMPORT_MOUNT_ROOT, &digest[..12])
    }

    /// Shell commands copying the import from its mount into place
    fn copy_commands(&self) -> Vec<String> {
        let source = format!(
            "{}/{}",
            self.mount_point(),
            self.add.trim_start_matches('/')
        );
        let mut pack = format!("tar -C {} -cf -", shell_quote(&source));
        for exclude in &self.exclude_paths {
            pack.push_str(&format!(" --exclude={}", shell_quote(exclude)));
        }
        if self.include_paths.is_empty() {
            pack.push_str(" .");
        } else {
            for include in &self.include_paths {
                pack.push(' ');
                pack.push_str(&shell_quote(include));
            }
        }

        let to = shell_quote(&self.to);
        let mut commands = vec![
            format!("mkdir -p {}", to),
            format!("{} | tar -C {} -xf -", pack, to),
        ];
        let owner = match (&self.owner, &self.group) {
            (Some(owner), Some(group)) => Some(format!("{}:{}", owner, group)),
            (Some(owner), None) => Some(owner.clone()),
            (None, Some(group)) => Some(format!(":{}", group)),
            (None, None) => None,
        };
        if let Some(owner) = owner {
            commands.push(format!("chown -R {} {}", shell_quote(&owner), to));
        }
        commands
    }
}

/// Stage copying every import attached to one anchor
#[derive(Debug, Clone)]
pub struct ArtifactImportStage {
    anchor: ImportAnchor,
    imports: Vec<ArtifactImport>,
}

/// Import stage for `anchor`, or `None` when no import targets it
pub fn generate_artifact_import_stage(
    imports: &[ArtifactImport],
    anchor: ImportAnchor,
) -> Option<ArtifactImportStage> {
    let imports: Vec<ArtifactImport> = imports
        .iter()
        .filter(|import| import.is_attached_to(anchor))
        .cloned()
        .collect();

    if imports.is_empty() {
        return None;
    }

    Some(ArtifactImportStage { anchor, imports })
}

impl ArtifactImportStage {
    pub fn name(&self) -> &'static str {
        self.anchor.stage_name()
    }

    pub fn anchor(&self) -> ImportAnchor {
        self.anchor
    }

    /// Imports in declaration order
    pub fn imports(&self) -> &[ArtifactImport] {
        &self.imports
    }

    /// Digest over the imports and the ids of their source images
    ///
    /// `source_ids` maps artifact image names to built image ids; a
    /// missing source means the artifact has not been built yet.
    pub fn dependencies_checksum(&self, source_ids: &BTreeMap<String, String>) -> StrataResult<String> {
        let mut hasher = Sha256::new();
        for import in &self.imports {
            let id = source_ids
                .get(&import.image_name)
                .ok_or_else(|| StrataError::NotBuilt(import.image_name.clone()))?;
            let include = import.include_paths.join(",");
            let exclude = import.exclude_paths.join(",");
            let fields = [
                import.image_name.as_str(),
                id.as_str(),
                import.add.as_str(),
                import.to.as_str(),
                include.as_str(),
                exclude.as_str(),
                import.owner.as_deref().unwrap_or(""),
                import.group.as_deref().unwrap_or(""),
            ];
            for field in fields {
                hasher.update(field.as_bytes());
                hasher.update([0]);
            }
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Set up `image`'s build container to copy the imports
    ///
    /// `exports` maps artifact image names to host directories holding
    /// the exported artifact filesystems; each is mounted read-only.
    pub fn prepare_image(
        &self,
        image: &mut StageImage,
        exports: &BTreeMap<String, PathBuf>,
    ) -> StrataResult<()> {
        let container = image.container_mut();
        let mut mounted = Vec::new();
        for import in &self.imports {
            let export = exports
                .get(&import.image_name)
                .ok_or_else(|| StrataError::NotBuilt(import.image_name.clone()))?;
            let mount = import.mount_point();
            if !mounted.contains(&mount) {
                container.add_volume(format!("{}:{}:ro", export.display(), mount));
                mounted.push(mount);
            }
            for command in import.copy_commands() {
                container.add_service_command(command);
            }
        }
        Ok(())
    }
}

fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=@%+,".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::LockConfig;
    use crate::container::fake::FakeRuntime;
    use crate::lock::LockManager;
    use crate::stage::image::StageSettings;
    use std::sync::Arc;

    fn imports() -> Vec<ArtifactImport> {
        vec![
            ArtifactImport::new("assets", "/build/dist", "/app/public").after(Stage::Install),
            ArtifactImport::new("tools", "/usr/local/bin", "/usr/local/bin").before(Stage::Setup),
            ArtifactImport::new("libs", "/out", "/app/lib").after(Stage::Install),
        ]
    }

    fn ids() -> BTreeMap<String, String> {
        [("assets", "sha256:a"), ("tools", "sha256:t"), ("libs", "sha256:l")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn stage_contains_only_matching_imports() {
        let stage =
            generate_artifact_import_stage(&imports(), ImportAnchor::After(Stage::Install)).unwrap();
        assert_eq!(stage.name(), "after_install_artifact");
        let names: Vec<&str> = stage.imports().iter().map(|i| i.image_name.as_str()).collect();
        assert_eq!(names, vec!["assets", "libs"]);
    }

    #[test]
    fn no_stage_without_matching_imports() {
        assert!(generate_artifact_import_stage(&imports(), ImportAnchor::Before(Stage::Install)).is_none());
        assert!(generate_artifact_import_stage(&[], ImportAnchor::After(Stage::Setup)).is_none());
    }

    #[test]
    fn anchor_names() {
        assert_eq!(ImportAnchor::Before(Stage::Install).to_string(), "before_install_artifact");
        assert_eq!(ImportAnchor::After(Stage::Setup).stage_name(), "after_setup_artifact");
    }

    #[test]
    fn checksum_follows_source_ids() {
        let stage =
            generate_artifact_import_stage(&imports(), ImportAnchor::After(Stage::Install)).unwrap();
        let first = stage.dependencies_checksum(&ids()).unwrap();
        assert_eq!(first, stage.dependencies_checksum(&ids()).unwrap());

        let mut rebuilt = ids();
        rebuilt.insert("libs".to_string(), "sha256:l2".to_string());
        assert_ne!(first, stage.dependencies_checksum(&rebuilt).unwrap());

        // Not part of this stage
        let mut unrelated = ids();
        unrelated.insert("tools".to_string(), "sha256:t2".to_string());
        assert_eq!(first, stage.dependencies_checksum(&unrelated).unwrap());
    }

    #[test]
    fn checksum_requires_built_sources() {
        let stage =
            generate_artifact_import_stage(&imports(), ImportAnchor::Before(Stage::Setup)).unwrap();
        let err = stage.dependencies_checksum(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, StrataError::NotBuilt(name) if name == "tools"));
    }

    #[test]
    fn copy_commands_honor_filters_and_owner() {
        let mut import = ArtifactImport::new("assets", "/build/dist", "/app/public");
        import.include_paths = vec!["css".to_string(), "js".to_string()];
        import.exclude_paths = vec!["*.map".to_string()];
        import.owner = Some("app".to_string());
        import.group = Some("app".to_string());

        let commands = import.copy_commands();
        assert_eq!(commands[0], "mkdir -p /app/public");
        assert!(commands[1].contains("/build/dist -cf - --exclude='*.map' css js | tar -C /app/public -xf -"));
        assert_eq!(commands[2], "chown -R app:app /app/public");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/app"), "/app");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn prepare_image_mounts_exports_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let locks = Arc::new(LockManager::new(dir.path(), &LockConfig::default()));
        let mut image = StageImage::new(
            "app/after_install_artifact",
            Some("sha256:base".to_string()),
            Arc::new(FakeRuntime::new()),
            locks,
            StageSettings::default(),
        );
        let mut list = imports();
        list.push(ArtifactImport::new("assets", "/build/fonts", "/app/fonts").after(Stage::Install));
        let stage = generate_artifact_import_stage(&list, ImportAnchor::After(Stage::Install)).unwrap();
        let exports: BTreeMap<String, PathBuf> = [("assets", "/exports/assets"), ("libs", "/exports/libs")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), PathBuf::from(v)))
            .collect();

        stage.prepare_image(&mut image, &exports).unwrap();

        let spec = image.container().run_spec("/bin/sh").unwrap();
        assert_eq!(spec.volumes.len(), 2);
        assert!(spec.volumes[0].starts_with("/exports/assets:/.strata/import/"));
        assert!(spec.volumes[0].ends_with(":ro"));
        assert_eq!(image.container().all_run_commands().len(), 6);
    }
}
