//! The batch orchestrator.
//!
//! Each archive moves through a small state machine:
//!
//! ```text
//! Pending -> Extracting -> ProcessingImages -> Succeeded -> CleanedUp
//!                 |                |
//!                 +----------------+--------> Failed ----> CleanedUp
//! ```
//!
//! Archives are processed one at a time, and pages within an archive one at a
//! time. The first page that fails stops work on its archive, but the batch
//! always moves on to the next archive. The status file is loaded once at the
//! start of the batch and saved once at the end.

use std::{collections::HashMap, fmt, fs, io, sync::Arc};

use chrono::{Local, NaiveDate};

use crate::{
    async_utils::run_blocking,
    config::PipelineConfig,
    errors::PipelineError,
    hasher::hash_file,
    intake::{ArchiveIntake, ArchiveRef, PageImage, ScratchWorkspace},
    ocr::{OcrEngine, ocr_engine_for_config},
    pdf::synthesize,
    raster::write_png_preview,
    prelude::*,
    status::{ArchiveStatus, StatusRecord, StatusStore},
    ui::{ProgressConfig, Ui},
};

/// Name of the per-archive audit file in the output directory.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Where an archive is in its processing attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveState {
    Pending,
    Extracting,
    ProcessingImages,
    Succeeded,
    Failed,
    CleanedUp,
}

impl ArchiveState {
    /// Is `next` a legal successor of this state?
    pub fn can_become(self, next: ArchiveState) -> bool {
        use ArchiveState::*;
        matches!(
            (self, next),
            (Pending, Extracting)
                | (Extracting, ProcessingImages)
                | (Extracting, Failed)
                | (ProcessingImages, Succeeded)
                | (ProcessingImages, Failed)
                | (Succeeded, CleanedUp)
                | (Failed, CleanedUp)
        )
    }
}

impl fmt::Display for ArchiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks the state of one archive, refusing illegal transitions.
struct ArchiveTracker<'a> {
    archive: &'a str,
    state: ArchiveState,
}

impl<'a> ArchiveTracker<'a> {
    fn new(archive: &'a str) -> Self {
        Self {
            archive,
            state: ArchiveState::Pending,
        }
    }

    fn advance(&mut self, next: ArchiveState) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(anyhow!(
                "archive {:?} cannot go from {} to {}",
                self.archive,
                self.state,
                next
            ));
        }
        debug!(archive = %self.archive, from = %self.state, to = %next, "Archive state changed");
        self.state = next;
        Ok(())
    }
}

/// Audit information about one synthesized page.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PageRecord {
    /// Path of the image inside the archive.
    pub file: PathBuf,
    /// SHA-256 of the image.
    pub sha256: String,
    /// Where we wrote the PDF.
    pub output: PathBuf,
    /// Where we wrote the PNG copy, if we made one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<PathBuf>,
    /// How many text spans the PDF contains.
    pub text_spans: usize,
}

/// The result of processing one page.
#[derive(Debug)]
pub enum PageOutcome {
    /// The page was OCRed and written out.
    Synthesized(PageRecord),
    /// The page failed, which stops work on this archive.
    Failed(PipelineError),
}

/// What happened to the pages of one archive.
#[derive(Debug, Default)]
struct PagesOutcome {
    pages: Vec<PageRecord>,
    failure: Option<(PageImage, PipelineError)>,
}

/// The audit manifest written next to each archive's PDFs.
#[derive(Debug, Serialize)]
struct Manifest<'a> {
    archive: &'a str,
    status: ArchiveStatus,
    pages: &'a [PageRecord],
}

/// Counts for one batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Archives we tried to process.
    pub attempted: usize,
    /// Archives where every page was synthesized.
    pub succeeded: usize,
    /// Archives that failed.
    pub failed: usize,
}

impl BatchSummary {
    fn record(&mut self, status: ArchiveStatus) {
        self.attempted += 1;
        match status {
            ArchiveStatus::Succeeded => self.succeeded += 1,
            ArchiveStatus::Failed => self.failed += 1,
        }
    }

    /// The fraction of attempted archives that failed.
    pub fn failure_rate(&self) -> f32 {
        if self.attempted == 0 {
            0.0
        } else {
            self.failed as f32 / self.attempted as f32
        }
    }

    /// Fail if more than `allowed_failure_rate` of the archives failed.
    pub fn check_failure_rate(&self, allowed_failure_rate: f32) -> Result<()> {
        let failure_rate = self.failure_rate();
        if failure_rate > allowed_failure_rate {
            Err(anyhow!(
                "{}/{} ({:.2}%) of archives failed, but only {:.2}% were allowed",
                self.failed,
                self.attempted,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ))
        } else {
            Ok(())
        }
    }
}

/// Runs batches over the watch directory.
pub struct Pipeline {
    config: PipelineConfig,
    ui: Ui,
    intake: ArchiveIntake,
    store: StatusStore,
    engine: Option<Arc<dyn OcrEngine>>,
    /// Local date the batch started, for date-partitioned output.
    batch_date: NaiveDate,
}

impl Pipeline {
    /// Create a pipeline. Nothing touches the disk until [`Self::run`].
    pub fn new(config: PipelineConfig, ui: Ui) -> Self {
        Self {
            intake: ArchiveIntake::new(config.clone()),
            store: StatusStore::new(config.status_file.clone()),
            config,
            ui,
            engine: None,
            batch_date: Local::now().date_naive(),
        }
    }

    /// Use `engine` instead of the one named in the configuration.
    #[cfg(test)]
    pub fn with_engine(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Pretend the batch started on `date`.
    #[cfg(test)]
    pub fn with_batch_date(mut self, date: NaiveDate) -> Self {
        self.batch_date = date;
        self
    }

    /// Process every archive in the watch directory.
    ///
    /// Per-archive failures end up in the status file. Only problems that stop
    /// us from recording results (like an unreadable status file) are
    /// returned as errors.
    #[instrument(level = "debug", skip_all, fields(watch_dir = %self.config.watch_dir.display()))]
    pub async fn run(&self) -> Result<BatchSummary> {
        let mut records = self.store.load()?;
        self.intake.ensure_dirs()?;

        let archives = self.intake.discover()?;
        let mut summary = BatchSummary::default();
        if archives.is_empty() {
            info!("No archives waiting");
            return Ok(summary);
        }

        // Only acquire the engine once we know there's work to do.
        let engine = match &self.engine {
            Some(engine) => engine.clone(),
            None => ocr_engine_for_config(&self.config.ocr).await?,
        };
        info!(
            archives = archives.len(),
            engine = engine.name(),
            "Starting batch"
        );

        let pb = self.ui.new_progress_bar(
            &ProgressConfig {
                emoji: "🗜️",
                msg: "Processing archives",
                done_msg: "Processed archives",
            },
            archives.len() as u64,
        );
        // Archives whose names differ only in the extension would share a
        // workspace and output directory. The first one (by name) wins.
        let mut claimed_stems = HashMap::<String, String>::new();
        for archive in archives {
            let record = match claimed_stems.get(&archive.stem()) {
                Some(owner) => self.reject_archive(&archive, owner)?,
                None => {
                    claimed_stems.insert(archive.stem(), archive.name.clone());
                    self.process_archive(engine.as_ref(), &archive).await?
                }
            };
            match record.status {
                ArchiveStatus::Succeeded => {
                    info!(archive = %archive.name, "{}", record.message)
                }
                ArchiveStatus::Failed => warn!(
                    archive = %archive.name,
                    filename = record.filename.as_deref().unwrap_or_default(),
                    "{}",
                    record.message
                ),
            }
            summary.record(record.status);
            records.insert(archive.name.clone(), record);
            pb.inc(1);
        }
        pb.finish_using_style();

        self.store.save(&records)?;
        info!(
            status_file = %self.store.path().display(),
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Saved status"
        );
        Ok(summary)
    }

    /// Fail `archive` without touching it, because `owner` already uses its
    /// workspace and output directory.
    fn reject_archive(&self, archive: &ArchiveRef, owner: &str) -> Result<StatusRecord> {
        let mut tracker = ArchiveTracker::new(&archive.name);
        tracker.advance(ArchiveState::Extracting)?;
        let err = PipelineError::archive(
            &archive.path,
            format!(
                "output directory {:?} is already used by {}",
                self.archive_output_dir(archive),
                owner
            ),
        );
        tracker.advance(ArchiveState::Failed)?;
        tracker.advance(ArchiveState::CleanedUp)?;
        Ok(StatusRecord::failed(err.to_string(), archive.name.clone()))
    }

    /// Run one archive through the state machine and return its record.
    #[instrument(level = "debug", skip_all, fields(archive = %archive.name))]
    async fn process_archive(
        &self,
        engine: &dyn OcrEngine,
        archive: &ArchiveRef,
    ) -> Result<StatusRecord> {
        let mut tracker = ArchiveTracker::new(&archive.name);
        tracker.advance(ArchiveState::Extracting)?;

        // Outputs from an earlier attempt must not look like this attempt's.
        let intake = self.intake.clone();
        let archive_owned = archive.clone();
        let output_dir = self.archive_output_dir(archive);
        let extracted = blocking_step(
            move || {
                clear_output_dir(&output_dir)?;
                intake.extract(&archive_owned)
            },
            |msg| PipelineError::archive(&archive.path, msg),
        )
        .await;
        let workspace = match extracted {
            Ok(workspace) => workspace,
            Err(err) => {
                // `extract` has already removed the partial workspace.
                tracker.advance(ArchiveState::Failed)?;
                tracker.advance(ArchiveState::CleanedUp)?;
                return Ok(StatusRecord::failed(err.to_string(), archive.name.clone()));
            }
        };

        tracker.advance(ArchiveState::ProcessingImages)?;
        let outcome = self.process_pages(engine, archive, &workspace).await;

        let workspace_path = workspace.path().to_owned();
        if let Err(err) = workspace.close() {
            error!(
                workspace = %workspace_path.display(),
                "failed to delete scratch workspace: {}",
                err
            );
        }

        let (status, pages, record) = match outcome {
            Ok(PagesOutcome {
                pages,
                failure: None,
            }) => {
                tracker.advance(ArchiveState::Succeeded)?;
                let message = format!("processed {} page image(s)", pages.len());
                (ArchiveStatus::Succeeded, pages, StatusRecord::succeeded(message))
            }
            Ok(PagesOutcome {
                pages,
                failure: Some((image, err)),
            }) => {
                tracker.advance(ArchiveState::Failed)?;
                debug!(kind = err.kind(), image = %image.relative_path.display(), "Page failed");
                let record = StatusRecord::failed(err.to_string(), image.file_name());
                (ArchiveStatus::Failed, pages, record)
            }
            Err(err) => {
                tracker.advance(ArchiveState::Failed)?;
                let record = StatusRecord::failed(err.to_string(), archive.name.clone());
                (ArchiveStatus::Failed, vec![], record)
            }
        };
        self.write_manifest(archive, status, &pages);
        tracker.advance(ArchiveState::CleanedUp)?;
        Ok(record)
    }

    /// Process each page image in `workspace`, stopping at the first failure.
    ///
    /// Returns an error only if we can't list the pages at all.
    async fn process_pages(
        &self,
        engine: &dyn OcrEngine,
        archive: &ArchiveRef,
        workspace: &ScratchWorkspace,
    ) -> Result<PagesOutcome, PipelineError> {
        let images = self.intake.page_images(workspace)?;
        if images.is_empty() {
            warn!(archive = %archive.name, "Archive contains no page images");
        }

        let pb = self.ui.new_progress_bar(
            &ProgressConfig {
                emoji: "📄",
                msg: &archive.name,
                done_msg: &archive.name,
            },
            images.len() as u64,
        );
        let mut outcome = PagesOutcome::default();
        let mut digests = HashMap::<String, PathBuf>::new();
        // Output path -> the image that claimed it.
        let mut claimed_outputs = HashMap::<PathBuf, PathBuf>::new();
        for image in images {
            let output = self.output_path(archive, &image);
            if let Some(owner) = claimed_outputs.get(&output) {
                let err = PipelineError::io(
                    &image.path,
                    io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!(
                            "output {:?} is already used by {:?}",
                            output,
                            owner.display()
                        ),
                    ),
                );
                outcome.failure = Some((image, err));
                break;
            }
            claimed_outputs.insert(output.clone(), image.relative_path.clone());

            match self.process_page(engine, &image, output).await {
                PageOutcome::Synthesized(page) => {
                    if let Some(first) = digests.get(&page.sha256) {
                        warn!(
                            archive = %archive.name,
                            image = %page.file.display(),
                            duplicate_of = %first.display(),
                            "Duplicate page content"
                        );
                    } else {
                        digests.insert(page.sha256.clone(), page.file.clone());
                    }
                    outcome.pages.push(page);
                    pb.inc(1);
                }
                PageOutcome::Failed(err) => {
                    outcome.failure = Some((image, err));
                    break;
                }
            }
        }
        pb.finish_and_clear();
        Ok(outcome)
    }

    /// Hash, OCR and synthesize one page, writing the PDF to `output`.
    #[instrument(level = "debug", skip_all, fields(image = %image.relative_path.display()))]
    async fn process_page(
        &self,
        engine: &dyn OcrEngine,
        image: &PageImage,
        output: PathBuf,
    ) -> PageOutcome {
        let path = image.path.clone();
        let sha256 = match blocking_step(
            move || hash_file(&path),
            |msg| PipelineError::io(&image.path, io::Error::other(msg)),
        )
        .await
        {
            Ok(digest) => digest,
            Err(err) => return PageOutcome::Failed(err),
        };

        let ocr = match engine.recognize(&image.path).await {
            Ok(ocr) => ocr,
            Err(err) => return PageOutcome::Failed(err),
        };
        if ocr.is_empty() {
            debug!("No text found");
        }

        let image_path = image.path.clone();
        let output_path = output.clone();
        let fallback_dpi = self.config.fallback_dpi;
        let report = match blocking_step(
            move || synthesize(&image_path, &ocr, &output_path, fallback_dpi),
            |msg| PipelineError::image(&image.path, msg),
        )
        .await
        {
            Ok(report) => report,
            Err(err) => return PageOutcome::Failed(err),
        };
        debug!(
            page_width = report.page_width,
            page_height = report.page_height,
            scale = report.scale,
            "Synthesized page"
        );

        let preview = if self.config.png_previews {
            let image_path = image.path.clone();
            let preview_path = output.with_extension("png");
            let written = preview_path.clone();
            if let Err(err) = blocking_step(
                move || write_png_preview(&image_path, &preview_path),
                |msg| PipelineError::image(&image.path, msg),
            )
            .await
            {
                return PageOutcome::Failed(err);
            }
            Some(written)
        } else {
            None
        };

        PageOutcome::Synthesized(PageRecord {
            file: image.relative_path.clone(),
            sha256,
            output,
            preview,
            text_spans: report.text_spans,
        })
    }

    /// The directory holding one archive's outputs.
    fn archive_output_dir(&self, archive: &ArchiveRef) -> PathBuf {
        let mut dir = self.config.output_dir.clone();
        if self.config.date_partitioned_output {
            for part in ["%Y", "%m", "%d"] {
                dir.push(self.batch_date.format(part).to_string());
            }
        }
        dir.join(archive.stem())
    }

    /// Where the PDF for `image` goes.
    fn output_path(&self, archive: &ArchiveRef, image: &PageImage) -> PathBuf {
        self.archive_output_dir(archive)
            .join(&image.relative_path)
            .with_extension("pdf")
    }

    /// Write the audit manifest, replacing any earlier one. Failure here is
    /// logged, not fatal.
    fn write_manifest(&self, archive: &ArchiveRef, status: ArchiveStatus, pages: &[PageRecord]) {
        let dir = self.archive_output_dir(archive);
        let path = dir.join(MANIFEST_FILE_NAME);
        let manifest = Manifest {
            archive: &archive.name,
            status,
            pages,
        };
        let result = serde_json::to_vec_pretty(&manifest)
            .context("failed to serialize manifest")
            .and_then(|json| {
                fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create {:?}", dir))?;
                fs::write(&path, json)
                    .with_context(|| format!("failed to write {:?}", path))
            });
        if let Err(err) = result {
            warn!(archive = %archive.name, "could not write manifest: {:#}", err);
        }
    }
}

/// Run a per-archive step on a blocking thread. If it panics, the panic
/// becomes an error for this archive built by `on_panic`.
async fn blocking_step<F, T>(
    f: F,
    on_panic: impl FnOnce(String) -> PipelineError,
) -> Result<T, PipelineError>
where
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
    T: Send + 'static,
{
    match run_blocking(f).await {
        Ok(result) => result,
        Err(err) => {
            error!("{:#}", err);
            Err(on_panic(format!("{:#}", err)))
        }
    }
}

/// Remove an archive's output directory from an earlier attempt.
fn clear_output_dir(dir: &Path) -> Result<(), PipelineError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {
            debug!(output_dir = %dir.display(), "Removed earlier outputs");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PipelineError::io(dir, err)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        intake::tests::write_zip,
        ocr::{OcrResultSet, Point, TextRegion},
        raster::tests::write_gray_tiff,
        status::StatusMap,
    };

    /// An engine that finds "Hello" on every page, except one page which
    /// fails, and one page whose region is only two points.
    #[derive(Default)]
    struct ScriptedEngine {
        fail_on: Option<String>,
        bad_geometry_on: Option<String>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedEngine {
        fn failing_on(file_name: &str) -> Self {
            Self {
                fail_on: Some(file_name.to_owned()),
                ..Self::default()
            }
        }

        fn bad_geometry_on(file_name: &str) -> Self {
            Self {
                bad_geometry_on: Some(file_name.to_owned()),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock poisoned").clone()
        }
    }

    #[async_trait]
    impl OcrEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn recognize(&self, image_path: &Path) -> Result<OcrResultSet, PipelineError> {
            let name = image_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.calls.lock().expect("lock poisoned").push(name.clone());
            if self.fail_on.as_deref() == Some(name.as_str()) {
                return Err(PipelineError::ocr(image_path, "engine crashed"));
            }
            if self.bad_geometry_on.as_deref() == Some(name.as_str()) {
                return Ok(OcrResultSet {
                    regions: vec![TextRegion {
                        text: "Hello".to_owned(),
                        polygon: vec![Point::new(10.0, 10.0), Point::new(60.0, 30.0)],
                    }],
                });
            }
            Ok(OcrResultSet {
                regions: vec![TextRegion::from_box("Hello", 10.0, 10.0, 60.0, 30.0)],
            })
        }
    }

    /// A temporary directory laid out like a deployment.
    struct Fixture {
        dir: tempfile::TempDir,
        config: PipelineConfig,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let dir = tempfile::TempDir::new()?;
            let root = dir.path();
            let config = PipelineConfig {
                watch_dir: root.join("images"),
                scratch_dir: root.join("temp"),
                output_dir: root.join("output"),
                status_file: root.join("status.yaml"),
                ..PipelineConfig::default()
            };
            fs::create_dir_all(&config.watch_dir)?;
            Ok(Self { dir, config })
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.dir.path().join(rel)
        }

        /// Write a TIFF into memory, and return its bytes.
        fn tiff_bytes(&self, width: u32, height: u32) -> Result<Vec<u8>> {
            let path = self.path("scratch-page.tif");
            write_gray_tiff(&path, width, height, None)?;
            let bytes = fs::read(&path)?;
            fs::remove_file(&path)?;
            Ok(bytes)
        }

        /// Add an archive holding `pages` blank TIFFs named `page1.tif` etc.
        fn add_archive(&self, name: &str, pages: usize) -> Result<()> {
            let mut files = vec![];
            for i in 1..=pages {
                // Vary the size so the pages hash differently.
                files.push((format!("page{}.tif", i), self.tiff_bytes(80 + i as u32, 40)?));
            }
            self.add_archive_files(name, &files)
        }

        /// Add an archive holding exactly `files` (name, contents).
        fn add_archive_files(&self, name: &str, files: &[(String, Vec<u8>)]) -> Result<()> {
            let files = files
                .iter()
                .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
                .collect::<Vec<_>>();
            write_zip(&self.config.watch_dir.join(name), &files)
        }

        fn manifest(&self, rel: &str) -> Result<serde_json::Value> {
            Ok(serde_json::from_slice(&fs::read(self.path(rel))?)?)
        }

        fn pipeline(&self, engine: Arc<dyn OcrEngine>) -> Pipeline {
            Pipeline::new(self.config.clone(), Ui::init_for_tests()).with_engine(engine)
        }

        fn status(&self) -> Result<StatusMap> {
            StatusStore::new(&self.config.status_file).load()
        }
    }

    #[test]
    fn state_machine_allows_only_documented_transitions() {
        use ArchiveState::*;
        assert!(Pending.can_become(Extracting));
        assert!(Extracting.can_become(Failed));
        assert!(ProcessingImages.can_become(Succeeded));
        assert!(Failed.can_become(CleanedUp));
        assert!(!Pending.can_become(ProcessingImages));
        assert!(!Extracting.can_become(Succeeded));
        assert!(!Succeeded.can_become(Failed));
        assert!(!CleanedUp.can_become(Pending));

        let mut tracker = ArchiveTracker::new("batch1.zip");
        assert!(tracker.advance(ArchiveState::Succeeded).is_err());
        assert_eq!(tracker.state, ArchiveState::Pending);
    }

    #[test]
    fn failure_rate_is_checked() {
        let summary = BatchSummary {
            attempted: 4,
            succeeded: 3,
            failed: 1,
        };
        assert_eq!(summary.failure_rate(), 0.25);
        assert!(summary.check_failure_rate(0.25).is_ok());
        assert!(summary.check_failure_rate(0.1).is_err());
        assert!(BatchSummary::default().check_failure_rate(0.0).is_ok());
    }

    #[tokio::test]
    async fn empty_watch_directory_does_nothing() -> Result<()> {
        let mut fixture = Fixture::new()?;
        // Acquiring this engine would fail, so this also shows we never try.
        fixture.config.ocr.engine = "no-such-engine".to_owned();
        let pipeline = Pipeline::new(fixture.config.clone(), Ui::init_for_tests());

        let summary = pipeline.run().await?;
        assert_eq!(summary, BatchSummary::default());
        assert!(!fixture.config.status_file.exists());
        assert!(fixture.path("temp").is_dir());
        assert_eq!(fs::read_dir(fixture.path("temp"))?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn blank_page_archive_succeeds() -> Result<()> {
        let mut fixture = Fixture::new()?;
        fixture.config.ocr.engine = "none".to_owned();
        fixture.add_archive("batch1.zip", 1)?;
        let pipeline = Pipeline::new(fixture.config.clone(), Ui::init_for_tests());

        let summary = pipeline.run().await?;
        assert_eq!(summary.succeeded, 1);

        let status = fixture.status()?;
        let record = &status["batch1.zip"];
        assert_eq!(record.status, ArchiveStatus::Succeeded);
        assert_eq!(record.message, "processed 1 page image(s)");
        assert_eq!(record.filename, None);
        assert!(fixture.path("output/batch1/page1.pdf").is_file());
        assert!(!fixture.path("temp/batch1").exists());

        let manifest: serde_json::Value =
            serde_json::from_slice(&fs::read(fixture.path("output/batch1/manifest.json"))?)?;
        assert_eq!(manifest["pages"][0]["file"], "page1.tif");
        assert_eq!(manifest["pages"][0]["text_spans"], 0);
        assert_eq!(manifest["pages"][0]["sha256"].as_str().map(str::len), Some(64));
        Ok(())
    }

    #[tokio::test]
    async fn all_pages_are_synthesized_with_text() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.add_archive("batch1.zip", 3)?;
        let engine = Arc::new(ScriptedEngine::default());

        fixture.pipeline(engine.clone()).run().await?;
        assert_eq!(engine.calls(), vec!["page1.tif", "page2.tif", "page3.tif"]);
        assert_eq!(fixture.status()?["batch1.zip"].message, "processed 3 page image(s)");
        for i in 1..=3 {
            assert!(fixture.path(&format!("output/batch1/page{}.pdf", i)).is_file());
        }
        Ok(())
    }

    #[tokio::test]
    async fn first_page_failure_stops_the_archive() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.add_archive("batch1.zip", 4)?;
        let engine = Arc::new(ScriptedEngine::failing_on("page3.tif"));

        let summary = fixture.pipeline(engine.clone()).run().await?;
        assert_eq!(summary.failed, 1);
        assert_eq!(engine.calls(), vec!["page1.tif", "page2.tif", "page3.tif"]);

        let status = fixture.status()?;
        let record = &status["batch1.zip"];
        assert_eq!(record.status, ArchiveStatus::Failed);
        assert_eq!(record.filename.as_deref(), Some("page3.tif"));
        assert!(record.message.contains("engine crashed"));

        assert!(fixture.path("output/batch1/page1.pdf").is_file());
        assert!(fixture.path("output/batch1/page2.pdf").is_file());
        assert!(!fixture.path("output/batch1/page3.pdf").exists());
        assert!(!fixture.path("output/batch1/page4.pdf").exists());
        assert!(!fixture.path("temp/batch1").exists());
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_archive_fails_without_stopping_the_batch() -> Result<()> {
        let fixture = Fixture::new()?;
        fs::write(fixture.config.watch_dir.join("a-broken.zip"), b"not a zip")?;
        fixture.add_archive("b-good.zip", 1)?;
        let engine = Arc::new(ScriptedEngine::default());

        let summary = fixture.pipeline(engine).run().await?;
        assert_eq!(
            summary,
            BatchSummary {
                attempted: 2,
                succeeded: 1,
                failed: 1,
            }
        );

        let status = fixture.status()?;
        assert_eq!(status.len(), 2);
        let broken = &status["a-broken.zip"];
        assert_eq!(broken.status, ArchiveStatus::Failed);
        assert_eq!(broken.filename.as_deref(), Some("a-broken.zip"));
        assert!(!fixture.path("temp/a-broken").exists());
        assert_eq!(status["b-good.zip"].status, ArchiveStatus::Succeeded);
        Ok(())
    }

    #[tokio::test]
    async fn existing_records_are_kept_or_overwritten() -> Result<()> {
        let fixture = Fixture::new()?;
        let store = StatusStore::new(&fixture.config.status_file);
        let mut before = StatusMap::new();
        before.insert(
            "old.zip".to_owned(),
            StatusRecord::succeeded("processed 9 page image(s)"),
        );
        before.insert(
            "batch1.zip".to_owned(),
            StatusRecord::failed("engine crashed", "page1.tif"),
        );
        store.save(&before)?;
        fixture.add_archive("batch1.zip", 1)?;

        fixture
            .pipeline(Arc::new(ScriptedEngine::default()))
            .run()
            .await?;
        let after = store.load()?;
        assert_eq!(after.len(), 2);
        assert_eq!(after["old.zip"], before["old.zip"]);
        assert_eq!(after["batch1.zip"].status, ArchiveStatus::Succeeded);
        assert_eq!(after["batch1.zip"].filename, None);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_engine_is_fatal_when_there_is_work() -> Result<()> {
        let mut fixture = Fixture::new()?;
        fixture.config.ocr.engine = "no-such-engine".to_owned();
        fixture.add_archive("batch1.zip", 1)?;
        let pipeline = Pipeline::new(fixture.config.clone(), Ui::init_for_tests());

        assert!(pipeline.run().await.is_err());
        assert!(!fixture.config.status_file.exists());
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_status_file_is_fatal() -> Result<()> {
        let fixture = Fixture::new()?;
        fs::write(&fixture.config.status_file, "processed_files: [oops\n")?;
        fixture.add_archive("batch1.zip", 1)?;
        let engine = Arc::new(ScriptedEngine::default());

        assert!(fixture.pipeline(engine.clone()).run().await.is_err());
        assert!(engine.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn synthesis_failure_stops_the_archive() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.add_archive("batch1.zip", 4)?;
        let engine = Arc::new(ScriptedEngine::bad_geometry_on("page2.tif"));

        fixture.pipeline(engine.clone()).run().await?;
        assert_eq!(engine.calls(), vec!["page1.tif", "page2.tif"]);

        let record = &fixture.status()?["batch1.zip"];
        assert_eq!(record.status, ArchiveStatus::Failed);
        assert_eq!(record.filename.as_deref(), Some("page2.tif"));
        assert!(record.message.contains("bad OCR geometry"));
        assert!(fixture.path("output/batch1/page1.pdf").is_file());
        assert!(!fixture.path("output/batch1/page2.pdf").exists());
        assert!(!fixture.path("output/batch1/page3.pdf").exists());
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_page_image_stops_the_archive() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.add_archive_files(
            "batch1.zip",
            &[
                ("page1.tif".to_owned(), fixture.tiff_bytes(50, 40)?),
                ("page2.tif".to_owned(), b"II*\0garbage".to_vec()),
                ("page3.tif".to_owned(), fixture.tiff_bytes(60, 40)?),
            ],
        )?;
        let engine = Arc::new(ScriptedEngine::default());

        fixture.pipeline(engine.clone()).run().await?;
        assert_eq!(engine.calls(), vec!["page1.tif", "page2.tif"]);

        let record = &fixture.status()?["batch1.zip"];
        assert_eq!(record.status, ArchiveStatus::Failed);
        assert_eq!(record.filename.as_deref(), Some("page2.tif"));
        assert!(record.message.contains("cannot read image"));
        assert!(fixture.path("output/batch1/page1.pdf").is_file());
        assert!(!fixture.path("output/batch1/page3.pdf").exists());
        Ok(())
    }

    #[tokio::test]
    async fn rerun_replaces_earlier_outputs_and_manifest() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.add_archive("batch1.zip", 2)?;
        fixture
            .pipeline(Arc::new(ScriptedEngine::default()))
            .run()
            .await?;
        assert!(fixture.path("output/batch1/page2.pdf").is_file());

        fixture
            .pipeline(Arc::new(ScriptedEngine::failing_on("page1.tif")))
            .run()
            .await?;
        assert_eq!(fixture.status()?["batch1.zip"].status, ArchiveStatus::Failed);
        assert!(!fixture.path("output/batch1/page1.pdf").exists());
        assert!(!fixture.path("output/batch1/page2.pdf").exists());

        let manifest = fixture.manifest("output/batch1/manifest.json")?;
        assert_eq!(manifest["status"], "failed");
        assert_eq!(manifest["pages"].as_array().map(Vec::len), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn pages_that_would_share_an_output_fail_the_archive() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.add_archive_files(
            "batch1.zip",
            &[
                ("page1.tif".to_owned(), fixture.tiff_bytes(20, 20)?),
                ("page1.TIF".to_owned(), fixture.tiff_bytes(30, 20)?),
            ],
        )?;
        let engine = Arc::new(ScriptedEngine::default());

        fixture.pipeline(engine.clone()).run().await?;
        // "page1.TIF" sorts first and claims page1.pdf.
        assert_eq!(engine.calls(), vec!["page1.TIF"]);
        let record = &fixture.status()?["batch1.zip"];
        assert_eq!(record.status, ArchiveStatus::Failed);
        assert_eq!(record.filename.as_deref(), Some("page1.tif"));
        assert!(record.message.contains("already used"));
        Ok(())
    }

    #[tokio::test]
    async fn archives_that_would_share_an_output_directory() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.add_archive("a.ZIP", 1)?;
        fixture.add_archive("a.zip", 1)?;
        let engine = Arc::new(ScriptedEngine::default());

        let summary = fixture.pipeline(engine.clone()).run().await?;
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(engine.calls(), vec!["page1.tif"]);

        let status = fixture.status()?;
        assert_eq!(status["a.ZIP"].status, ArchiveStatus::Succeeded);
        let rejected = &status["a.zip"];
        assert_eq!(rejected.status, ArchiveStatus::Failed);
        assert_eq!(rejected.filename.as_deref(), Some("a.zip"));
        assert!(rejected.message.contains("already used by a.ZIP"));
        assert!(fixture.path("output/a/page1.pdf").is_file());
        Ok(())
    }

    #[tokio::test]
    async fn panicking_step_fails_only_its_page() {
        let err = blocking_step(
            || -> Result<(), PipelineError> { panic!("decoder exploded") },
            |msg| PipelineError::image(Path::new("page1.tif"), msg),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::Image { .. }));
    }

    #[tokio::test]
    async fn previews_and_dated_output_layout() -> Result<()> {
        let mut fixture = Fixture::new()?;
        fixture.config.png_previews = true;
        fixture.config.date_partitioned_output = true;
        fixture.add_archive("batch1.zip", 1)?;
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).expect("valid date");

        fixture
            .pipeline(Arc::new(ScriptedEngine::default()))
            .with_batch_date(date)
            .run()
            .await?;
        assert!(fixture.path("output/2024/03/07/batch1/page1.pdf").is_file());
        assert!(fixture.path("output/2024/03/07/batch1/page1.png").is_file());

        let manifest = fixture.manifest("output/2024/03/07/batch1/manifest.json")?;
        let preview = manifest["pages"][0]["preview"].as_str().unwrap_or_default();
        assert!(preview.ends_with("page1.png"));
        Ok(())
    }
}
