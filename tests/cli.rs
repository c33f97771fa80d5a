//! CLI test cases.
//!
//! Each test runs the binary inside its own temporary directory, relying on
//! the default relative paths (`images`, `temp`, `output`, `status.yaml`).
//! We use the `none` OCR engine so that tests don't need tesseract.

use std::{fs, io::Write as _, path::Path, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tiff::encoder::{TiffEncoder, colortype};
use zip::write::SimpleFileOptions;

/// Create a new `Command` with our binary, running in `dir`.
fn cmd(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("scan-ingest").unwrap();
    cmd.current_dir(dir);
    cmd
}

/// A blank white grayscale TIFF.
fn blank_tiff(width: u32, height: u32) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    let mut encoder = TiffEncoder::new(&mut buf).unwrap();
    encoder
        .write_image::<colortype::Gray8>(width, height, &vec![255; (width * height) as usize])
        .unwrap();
    buf.into_inner()
}

/// Write a zip archive containing `files` (name, contents).
fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut zip = zip::ZipWriter::new(fs::File::create(path).unwrap());
    for (name, contents) in files {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(contents).unwrap();
    }
    zip.finish().unwrap();
}

#[test]
fn test_help() {
    let dir = tempfile::TempDir::new().unwrap();
    cmd(dir.path()).arg("--help").assert().success();
}

#[test]
fn test_version() {
    let dir = tempfile::TempDir::new().unwrap();
    cmd(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("scan-ingest"));
}

#[test]
fn test_run_with_empty_watch_dir() {
    let dir = tempfile::TempDir::new().unwrap();
    // No archives, so the default tesseract engine is never needed.
    cmd(dir.path()).args(["run", "--no-progress"]).assert().success();
    assert!(dir.path().join("images").is_dir());
    assert!(dir.path().join("temp").is_dir());
    assert!(!dir.path().join("status.yaml").exists());
}

#[test]
fn test_run_blank_page_archive() {
    let dir = tempfile::TempDir::new().unwrap();
    let page = blank_tiff(120, 80);
    write_zip(
        &dir.path().join("images/batch1.zip"),
        &[("page1.tif", page.as_slice())],
    );

    cmd(dir.path())
        .args(["run", "--no-progress", "--engine", "none"])
        .assert()
        .success();

    assert!(dir.path().join("output/batch1/page1.pdf").is_file());
    assert!(dir.path().join("output/batch1/manifest.json").is_file());
    assert!(!dir.path().join("temp/batch1").exists());
    let status = fs::read_to_string(dir.path().join("status.yaml")).unwrap();
    assert!(status.starts_with("processed_files:"));
    assert!(status.contains("batch1.zip:"));
    assert!(status.contains("status: succeeded"));

    cmd(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("batch1.zip\tsucceeded\t-\t"))
        .stdout(predicate::str::contains("processed 1 page image(s)"));
}

#[test]
fn test_failed_archives_and_failure_rate() {
    let dir = tempfile::TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("images")).unwrap();
    fs::write(dir.path().join("images/broken.zip"), b"not a zip").unwrap();
    let page = blank_tiff(40, 40);
    write_zip(
        &dir.path().join("images/good.zip"),
        &[("scans/page1.TIF", page.as_slice())],
    );

    // Half the archives fail, which is too many.
    cmd(dir.path())
        .args(["run", "--no-progress", "--engine", "none"])
        .args(["--allowed-failure-rate", "0.1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("archives failed"));

    // The status was still recorded.
    assert!(dir.path().join("output/good/scans/page1.pdf").is_file());
    assert!(!dir.path().join("temp/broken").exists());
    cmd(dir.path())
        .args(["status", "--failed"])
        .assert()
        .success()
        .stdout(predicate::str::contains("broken.zip\tfailed\tbroken.zip\t"))
        .stdout(predicate::str::contains("good.zip").not());
}

#[test]
fn test_dotenv_sets_log_filter() {
    let dir = tempfile::TempDir::new().unwrap();
    fs::write(dir.path().join(".env"), "RUST_LOG=debug\n").unwrap();
    cmd(dir.path())
        .env_remove("RUST_LOG")
        .args(["run", "--no-progress"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Discovered archives"));
}

#[test]
fn test_png_previews_and_dated_output() {
    let dir = tempfile::TempDir::new().unwrap();
    let page = blank_tiff(50, 30);
    write_zip(
        &dir.path().join("images/batch1.zip"),
        &[("page1.tif", page.as_slice())],
    );

    cmd(dir.path())
        .args(["run", "--no-progress", "--engine", "none"])
        .args(["--png-previews", "--date-partitioned-output"])
        .assert()
        .success();

    let pdfs = find_files(&dir.path().join("output"), "pdf");
    let pngs = find_files(&dir.path().join("output"), "png");
    assert_eq!(pdfs.len(), 1);
    assert_eq!(pngs.len(), 1);
    // output/YYYY/MM/DD/batch1/page1.pdf
    let relative = pdfs[0].strip_prefix(dir.path().join("output")).unwrap();
    assert_eq!(relative.components().count(), 5);
    assert!(relative.ends_with("batch1/page1.pdf"));
}

/// Recursively find files with extension `ext` under `dir`.
fn find_files(dir: &Path, ext: &str) -> Vec<std::path::PathBuf> {
    let mut found = vec![];
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            found.extend(find_files(&path, ext));
        } else if path.extension().is_some_and(|e| e == ext) {
            found.push(path);
        }
    }
    found
}

#[test]
fn test_status_without_status_file() {
    let dir = tempfile::TempDir::new().unwrap();
    cmd(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_config_file_and_unknown_engine() {
    let dir = tempfile::TempDir::new().unwrap();
    fs::write(
        dir.path().join("pipeline.toml"),
        "watch_dir = \"incoming\"\n\n[ocr]\nengine = \"no-such-engine\"\n",
    )
    .unwrap();
    write_zip(
        &dir.path().join("incoming/batch1.zip"),
        &[("page1.tif", blank_tiff(10, 10).as_slice())],
    );

    cmd(dir.path())
        .args(["run", "--no-progress", "--config", "pipeline.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown OCR engine"));
    assert!(!dir.path().join("status.yaml").exists());
}

#[test]
fn test_schema() {
    let dir = tempfile::TempDir::new().unwrap();
    cmd(dir.path())
        .args(["schema", "StatusFile"])
        .assert()
        .success()
        .stdout(predicate::str::contains("processed_files"));
    cmd(dir.path())
        .args(["schema", "PipelineConfig"])
        .assert()
        .success()
        .stdout(predicate::str::contains("watch_dir"));
}
