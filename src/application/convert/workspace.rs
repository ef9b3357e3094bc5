use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Component, Path, PathBuf},
};

use tempfile::TempDir;
use tracing::debug;
use uuid::Uuid;

use super::ConvertError;

const WORKSPACE_PREFIX: &str = "folio_";
const WORKSPACE_RANDOM_LEN: usize = 10;
const OUTPUT_DIR: &str = "output";
const MAX_COMPONENT_BYTES: usize = 255;

/// Ephemeral per-conversion directory.
///
/// The directory and everything under it is removed when the value is
/// dropped, on every exit path including cancellation of the owning future.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    root: PathBuf,
    input: PathBuf,
    output: PathBuf,
}

impl Workspace {
    /// Create `folio_<random>` under `temp_root` with an empty `output/`
    /// directory. The output file itself is never pre-created.
    pub fn create(temp_root: &Path) -> Result<Self, ConvertError> {
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .rand_bytes(WORKSPACE_RANDOM_LEN)
            .tempdir_in(temp_root)
            .map_err(|err| {
                ConvertError::workspace(
                    format!("failed to create workspace under `{}`", temp_root.display()),
                    err,
                )
            })?;

        let root = dir
            .path()
            .canonicalize()
            .map_err(|err| ConvertError::workspace("failed to resolve workspace root", err))?;

        let output_dir = root.join(OUTPUT_DIR);
        fs::create_dir(&output_dir)
            .map_err(|err| ConvertError::workspace("failed to create output directory", err))?;

        let input = root.join(format!("{}.md", Uuid::new_v4().simple()));
        let output = output_dir.join(format!("{}.pdf", Uuid::new_v4().simple()));

        Ok(Self {
            dir,
            root,
            input,
            output,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_path(&self) -> &Path {
        &self.input
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    /// Resolve a caller-supplied relative path to a location strictly inside
    /// the workspace root. The check is lexical and happens before any write.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, ConvertError> {
        let traversal = || ConvertError::PathTraversal(relative.to_string());

        let candidate = Path::new(relative);
        if relative.is_empty() || candidate.is_absolute() {
            return Err(traversal());
        }

        let mut resolved = self.root.clone();
        for component in candidate.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !resolved.pop() {
                        return Err(traversal());
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(traversal()),
            }
        }

        if resolved == self.root || !resolved.starts_with(&self.root) {
            return Err(traversal());
        }
        Ok(resolved)
    }

    pub async fn write_input(&self, document: &[u8]) -> Result<(), ConvertError> {
        tokio::fs::write(&self.input, document)
            .await
            .map_err(|err| ConvertError::workspace("failed to write input document", err))
    }

    /// Materialize resources inside the workspace. The whole map is checked
    /// first so a rejected request leaves no resource behind.
    pub async fn write_resources(
        &self,
        resources: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), ConvertError> {
        let resolved = self.plan_resources(resources)?;

        for (path, content) in resolved {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|err| {
                    ConvertError::workspace(
                        format!("failed to create directory `{}`", parent.display()),
                        err,
                    )
                })?;
            }
            tokio::fs::write(&path, content).await.map_err(|err| {
                ConvertError::workspace(
                    format!("failed to write resource `{}`", path.display()),
                    err,
                )
            })?;
            debug!(
                target = "folio::convert::workspace",
                path = %path.display(),
                bytes = content.len(),
                "Created resource file"
            );
        }
        Ok(())
    }

    /// Resolve every resource name and reject maps the filesystem could not
    /// honour: reserved workspace entries, names that are both a file and a
    /// parent directory, duplicates after normalization, NUL bytes and
    /// over-long components.
    fn plan_resources<'a>(
        &self,
        resources: &'a BTreeMap<String, Vec<u8>>,
    ) -> Result<Vec<(PathBuf, &'a Vec<u8>)>, ConvertError> {
        let output_dir = self.root.join(OUTPUT_DIR);
        let mut planned = Vec::with_capacity(resources.len());
        let mut seen = BTreeSet::new();

        for (name, content) in resources {
            if name.contains('\0') {
                return Err(ConvertError::validation(format!(
                    "resource name {name:?} contains a NUL byte"
                )));
            }
            let path = self.resolve(name)?;
            if path.starts_with(&output_dir) || path.starts_with(&self.input) {
                return Err(ConvertError::PathTraversal(name.clone()));
            }
            if path
                .components()
                .any(|component| component.as_os_str().len() > MAX_COMPONENT_BYTES)
            {
                return Err(ConvertError::validation(format!(
                    "resource name {name:?} has a component longer than {MAX_COMPONENT_BYTES} bytes"
                )));
            }
            if !seen.insert(path.clone()) {
                return Err(ConvertError::validation(format!(
                    "resource name {name:?} duplicates another resource"
                )));
            }
            planned.push((path, content));
        }

        for (path, _) in &planned {
            let clash = path
                .ancestors()
                .skip(1)
                .take_while(|ancestor| *ancestor != self.root)
                .find(|ancestor| seen.contains(*ancestor));
            if let Some(parent) = clash {
                return Err(ConvertError::validation(format!(
                    "resource `{}` is also used as a directory",
                    parent.strip_prefix(&self.root).unwrap_or(parent).display()
                )));
            }
        }

        Ok(planned)
    }

    pub async fn read_output(&self) -> Result<Vec<u8>, ConvertError> {
        tokio::fs::read(&self.output)
            .await
            .map_err(|err| ConvertError::workspace("failed to read output file", err))
    }

    /// Remove the workspace now instead of on drop, surfacing removal errors.
    pub fn close(self) -> std::io::Result<()> {
        self.dir.close()
    }
}
