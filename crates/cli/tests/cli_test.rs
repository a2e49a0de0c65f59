//! Basic CLI integration tests.

#![allow(deprecated)] // Command::cargo_bin deprecated for custom build-dir; still works for default

use assert_cmd::Command;
use std::path::Path;

/// `folio` with config and library directories confined to `root`.
fn folio(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("folio").unwrap();
    cmd.env("XDG_CONFIG_HOME", root.join("config"))
        .env("READER_LIBRARY_DIR", root.join("cache"))
        .env("READER_UPLOAD_DIR", root.join("uploads"))
        .env_remove("RUST_LOG");
    cmd
}

fn stdout_json(out: &assert_cmd::assert::Assert) -> serde_json::Value {
    let stdout = std::str::from_utf8(&out.get_output().stdout).unwrap();
    serde_json::from_str(stdout).expect("--json should output valid JSON")
}

fn write_upload(root: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let uploads = root.join("uploads");
    std::fs::create_dir_all(&uploads).unwrap();
    let path = uploads.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

const STORY: &str = "Chapter 1\nThe road.\n\nChapter 2\nThe river.\n\nChapter 3\nThe sea.\n";

#[test]
fn help_prints_and_exits_success() {
    Command::cargo_bin("folio")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn config_show_json_valid() {
    let dir = tempfile::tempdir().unwrap();
    let out = folio(dir.path())
        .args(["config", "show", "--json"])
        .assert()
        .success();
    let cfg = stdout_json(&out);
    assert_eq!(
        cfg["library"]["cache_root"].as_str().map(Path::new),
        Some(dir.path().join("cache").as_path())
    );
    assert!(cfg["segmenter"]["strategies"].is_array());
}

#[test]
fn config_set_rejects_unknown_strategy() {
    let dir = tempfile::tempdir().unwrap();
    folio(dir.path())
        .args(["config", "set", "segmenter.strategies", "headings,tea-leaves"])
        .assert()
        .failure();
    folio(dir.path())
        .args(["config", "set", "segmenter.strategies", "patterns,headings"])
        .assert()
        .success();
    let out = folio(dir.path())
        .args(["config", "show", "--json"])
        .assert()
        .success();
    assert_eq!(
        stdout_json(&out)["segmenter"]["strategies"],
        serde_json::json!(["patterns", "headings"])
    );
}

#[test]
fn ingest_nonexistent_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = folio(dir.path())
        .args(["ingest", "/nonexistent/file.epub"])
        .assert()
        .failure();
    let stderr = std::str::from_utf8(&out.get_output().stderr).unwrap();
    assert!(stderr.contains("no longer available"), "{stderr}");
}

#[test]
fn ingest_then_list_and_read() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_upload(dir.path(), "voyage.txt", STORY);

    folio(dir.path())
        .args(["ingest", source.to_str().unwrap()])
        .assert()
        .success();

    let out = folio(dir.path()).args(["list", "--json"]).assert().success();
    let books = stdout_json(&out);
    assert_eq!(books.as_array().map(Vec::len), Some(1));
    assert_eq!(books[0]["id"], "voyage_data");
    assert_eq!(books[0]["chapter_count"], 3);

    let out = folio(dir.path())
        .args(["toc", "voyage", "--json"])
        .assert()
        .success();
    let toc = stdout_json(&out);
    assert_eq!(toc[2]["title"], "Chapter 3");

    let out = folio(dir.path())
        .args(["chapter", "voyage", "1"])
        .assert()
        .success();
    let stdout = std::str::from_utf8(&out.get_output().stdout).unwrap();
    assert!(stdout.contains("The river."), "{stdout}");

    folio(dir.path())
        .args(["chapter", "voyage", "9"])
        .assert()
        .failure();
}

#[test]
fn ingest_pending_picks_up_uploads() {
    let dir = tempfile::tempdir().unwrap();
    write_upload(dir.path(), "a.txt", STORY);
    write_upload(dir.path(), "b.txt", STORY);

    let out = folio(dir.path())
        .args(["ingest", "--pending", "--json"])
        .assert()
        .success();
    assert_eq!(stdout_json(&out).as_array().map(Vec::len), Some(2));

    let out = folio(dir.path())
        .args(["ingest", "--pending", "--json"])
        .assert()
        .success();
    assert_eq!(stdout_json(&out), serde_json::json!([]));
}

#[test]
fn remove_deletes_cache() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_upload(dir.path(), "voyage.txt", STORY);
    folio(dir.path())
        .args(["ingest", source.to_str().unwrap()])
        .assert()
        .success();

    folio(dir.path()).args(["remove", "voyage"]).assert().success();
    assert!(!dir.path().join("cache").join("voyage_data").exists());
    folio(dir.path()).args(["remove", "voyage"]).assert().failure();
}
