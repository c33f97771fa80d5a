//! Finding archives in the watch directory and unpacking them.

use std::{fs, io};

use zip::ZipArchive;

use crate::{config::PipelineConfig, errors::PipelineError, prelude::*};

/// An archive waiting in the watch directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveRef {
    /// The archive's file name, used as its key in the status file.
    pub name: String,
    /// Full path to the archive.
    pub path: PathBuf,
}

impl ArchiveRef {
    /// The file name without its extension. Used to name workspaces and
    /// output directories.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }
}

/// A page image found inside an extracted archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageImage {
    /// Absolute path inside the scratch workspace.
    pub path: PathBuf,
    /// Path relative to the workspace root.
    pub relative_path: PathBuf,
}

impl PageImage {
    /// Just the file name, for status records.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.relative_path.display().to_string())
    }
}

/// Discovers and extracts archives.
#[derive(Clone, Debug)]
pub struct ArchiveIntake {
    config: PipelineConfig,
}

impl ArchiveIntake {
    /// Create a new intake using the directories in `config`.
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Create the watch directory and scratch root if they don't exist yet.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.config.watch_dir, &self.config.scratch_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {:?}", dir))?;
        }
        Ok(())
    }

    /// List the archives waiting in the watch directory, sorted by name.
    #[instrument(level = "debug", skip_all, fields(watch_dir = %self.config.watch_dir.display()))]
    pub fn discover(&self) -> Result<Vec<ArchiveRef>> {
        let watch_dir = &self.config.watch_dir;
        let mut archives = vec![];
        let entries = fs::read_dir(watch_dir)
            .with_context(|| format!("Failed to read watch directory {:?}", watch_dir))?;
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("Failed to read entry in watch directory {:?}", watch_dir)
            })?;
            let path = entry.path();
            if !path.is_file() || !self.config.is_archive_path(&path) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            archives.push(ArchiveRef { name, path });
        }
        archives.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(count = archives.len(), "Discovered archives");
        Ok(archives)
    }

    /// Unpack `archive` into a fresh scratch workspace.
    ///
    /// If extraction fails, the partially-filled workspace is removed before
    /// we return.
    #[instrument(level = "debug", skip_all, fields(archive = %archive.name))]
    pub fn extract(&self, archive: &ArchiveRef) -> Result<ScratchWorkspace, PipelineError> {
        let workspace_path = self.config.scratch_dir.join(archive.stem());
        let workspace = ScratchWorkspace::create(workspace_path)?;

        let file = fs::File::open(&archive.path)
            .map_err(|err| PipelineError::archive(&archive.path, err))?;
        let mut zip = ZipArchive::new(io::BufReader::new(file))
            .map_err(|err| PipelineError::archive(&archive.path, err))?;
        zip.extract(workspace.path())
            .map_err(|err| PipelineError::archive(&archive.path, err))?;
        debug!(
            entries = zip.len(),
            workspace = %workspace.path().display(),
            "Extracted archive"
        );
        Ok(workspace)
    }

    /// Find every page image in `workspace`, sorted by relative path.
    #[instrument(level = "debug", skip_all, fields(workspace = %workspace.path().display()))]
    pub fn page_images(
        &self,
        workspace: &ScratchWorkspace,
    ) -> Result<Vec<PageImage>, PipelineError> {
        let mut images = vec![];
        collect_page_images(&self.config, workspace.path(), workspace.path(), &mut images)?;
        images.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(images)
    }
}

/// Recursive helper for [`ArchiveIntake::page_images`].
fn collect_page_images(
    config: &PipelineConfig,
    root: &Path,
    dir: &Path,
    images: &mut Vec<PageImage>,
) -> Result<(), PipelineError> {
    let entries = fs::read_dir(dir).map_err(|err| PipelineError::io(dir, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| PipelineError::io(dir, err))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|err| PipelineError::io(&path, err))?;
        if file_type.is_dir() {
            collect_page_images(config, root, &path, images)?;
        } else if file_type.is_file() && config.is_page_image_path(&path) {
            let relative_path = path.strip_prefix(root).unwrap_or(&path).to_owned();
            images.push(PageImage {
                path,
                relative_path,
            });
        }
    }
    Ok(())
}

/// A scratch directory owned by one processing attempt.
///
/// Call [`ScratchWorkspace::close`] to delete it and see any error. If the
/// workspace is dropped without being closed, it is deleted anyway and any
/// error is logged.
#[derive(Debug)]
pub struct ScratchWorkspace {
    path: Option<PathBuf>,
}

impl ScratchWorkspace {
    /// Create an empty workspace at `path`, removing anything a previous
    /// (crashed) attempt left behind.
    pub fn create(path: PathBuf) -> Result<Self, PipelineError> {
        if path.exists() {
            warn!(workspace = %path.display(), "Removing stale scratch workspace");
            fs::remove_dir_all(&path).map_err(|err| PipelineError::io(&path, err))?;
        }
        fs::create_dir_all(&path).map_err(|err| PipelineError::io(&path, err))?;
        Ok(Self { path: Some(path) })
    }

    /// The workspace directory.
    pub fn path(&self) -> &Path {
        self.path
            .as_deref()
            .expect("workspace path is only taken by close or drop")
    }

    /// Delete the workspace recursively.
    pub fn close(mut self) -> io::Result<()> {
        match self.path.take() {
            Some(path) => remove_workspace(&path),
            None => Ok(()),
        }
    }
}

impl Drop for ScratchWorkspace {
    fn drop(&mut self) {
        if let Some(path) = self.path.take()
            && let Err(err) = remove_workspace(&path)
        {
            error!(
                workspace = %path.display(),
                "failed to delete scratch workspace: {}",
                err
            );
        }
    }
}

/// Remove a workspace directory, treating "already gone" as success.
fn remove_workspace(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}
