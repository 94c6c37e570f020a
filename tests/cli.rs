//! Command-line tests that run the `docchat` binary against a temporary library.
//!
//! No Ollama instance is needed: the backend URL points at a closed port, so
//! anything that needs embeddings fails fast and is recorded.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docchat_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("docchat");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("library")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/docchat.sqlite"

[ollama]
url = "http://127.0.0.1:9"
timeout_secs = 2

[embedding]
timeout_secs = 2
max_retries = 0

[chunking]
chunk_size = 512
chunk_overlap = 10

[images]
dir = "{root}/images"
script = "{root}/no-such-script.py"

[ingest]
documents_dir = "{root}/library"
"#,
        root = root.display()
    );

    let config_path = root.join("config").join("docchat.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docchat(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docchat_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docchat binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

/// A one-chapter EPUB.
fn minimal_epub(text: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        let options = zip::write::SimpleFileOptions::default();

        zip.start_file("mimetype", options).unwrap();
        zip.write_all(b"application/epub+zip").unwrap();

        zip.start_file("META-INF/container.xml", options).unwrap();
        zip.write_all(
            br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#,
        )
        .unwrap();

        zip.start_file("OEBPS/content.opf", options).unwrap();
        zip.write_all(
            br#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <manifest>
    <item id="c1" href="chapter.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine><itemref idref="c1"/></spine>
</package>"#,
        )
        .unwrap();

        zip.start_file("OEBPS/chapter.xhtml", options).unwrap();
        let xhtml = format!(
            "<?xml version=\"1.0\"?><html xmlns=\"http://www.w3.org/1999/xhtml\"><body><p>{}</p></body></html>",
            text
        );
        zip.write_all(xhtml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docchat(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("docchat.sqlite").exists());

    // Idempotent
    let (_, stderr, success) = run_docchat(&config_path, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_docs_list_empty() {
    let (_tmp, config_path) = setup_test_env();
    run_docchat(&config_path, &["init"]);

    let (stdout, stderr, success) = run_docchat(&config_path, &["docs", "list"]);
    assert!(success, "docs list failed: {}", stderr);
    assert!(stdout.contains("No documents."));
}

#[test]
fn test_stats_on_empty_library() {
    let (_tmp, config_path) = setup_test_env();
    run_docchat(&config_path, &["init"]);

    let (stdout, stderr, success) = run_docchat(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Documents:"));
    assert!(stdout.contains("0 (0 processed, 0 failed, 0 pending)"));
}

#[test]
fn test_ingest_without_backend_records_failure() {
    let (tmp, config_path) = setup_test_env();
    fs::write(
        tmp.path().join("library").join("spiders.epub"),
        minimal_epub("Orb weavers build spiral webs at dusk."),
    )
    .unwrap();
    fs::write(tmp.path().join("library").join("notes.md"), "ignored").unwrap();

    let (stdout, _stderr, success) = run_docchat(&config_path, &["ingest", "--progress", "off"]);
    assert!(!success, "ingest should fail when nothing was ingested");
    assert!(stdout.contains("failed: 1"), "stdout: {}", stdout);

    let (stdout, stderr, success) = run_docchat(&config_path, &["docs", "list"]);
    assert!(success, "docs list failed: {}", stderr);
    assert!(stdout.contains("spiders.epub"));
    assert!(stdout.contains("failed"));
    assert!(stdout.contains("error:"));
    assert!(!stdout.contains("notes.md"));

    let (stdout, _, success) = run_docchat(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("1 (0 processed, 1 failed, 0 pending)"));
}

#[test]
fn test_docs_show_unknown_id_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_docchat(&config_path, &["init"]);

    let (_, stderr, success) = run_docchat(&config_path, &["docs", "show", "no-such-id"]);
    assert!(!success);
    assert!(stderr.contains("document not found"));
}

#[test]
fn test_docs_delete_unknown_id_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_docchat(&config_path, &["init"]);

    let (_, _, success) = run_docchat(&config_path, &["docs", "delete", "no-such-id"]);
    assert!(!success);
}

#[test]
fn test_invalid_progress_mode_rejected() {
    let (tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_docchat(
        &config_path,
        &[
            "ingest",
            tmp.path().join("library").to_str().unwrap(),
            "--progress",
            "loud",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("invalid --progress value"));
}

#[test]
fn test_missing_explicit_config_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("absent.toml");

    let (_, stderr, success) = run_docchat(&missing, &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_reprocess_flags_conflict() {
    let (_tmp, config_path) = setup_test_env();
    let (_, _, success) = run_docchat(&config_path, &["reprocess", "--all", "--failed"]);
    assert!(!success);
}
