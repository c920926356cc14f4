use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ragnetic_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ragnetic"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("nested")).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    ).unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    ).unwrap();
    fs::write(
        files_dir.join("nested").join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    ).unwrap();
    fs::write(files_dir.join("image.png"), [0x89, b'P', b'N', b'G']).unwrap();

    let config_content = format!(
        r#"[chunking]
max_chunk_chars = 100
overlap_chars = 20
min_chunk_chars = 40

[retrieval]
top_k = 3

[embedding]
provider = "hashing"
dims = 64

[index]
backend = "memory"

[storage]
root = "{}/data/objects"

[worker]
concurrency = 2
max_attempts = 1
"#,
        root.display()
    );

    let config_path = config_dir.join("ragnetic.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ragnetic(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ragnetic_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ragnetic binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn json_lines(stdout: &str) -> Vec<serde_json::Value> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test]
fn test_chunk_prints_json_lines() {
    let (tmp, config) = setup_test_env();
    let file = tmp.path().join("files/alpha.md");
    let (stdout, stderr, ok) = run_ragnetic(&config, &["chunk", file.to_str().unwrap()]);
    assert!(ok, "chunk failed: {}", stderr);

    let chunks = json_lines(&stdout);
    assert!(chunks.len() >= 2);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk["metadata"]["chunk_index"], i);
        assert_eq!(chunk["metadata"]["chunk_count"], chunks.len());
        assert_eq!(chunk["metadata"]["source"], "alpha.md");
        assert_eq!(chunk["metadata"]["format"], "md");
        assert!(chunk["start_char"].as_u64().unwrap() <= chunk["end_char"].as_u64().unwrap());
    }
}

#[test]
fn test_chunk_flags_override_config() {
    let (tmp, config) = setup_test_env();
    let file = tmp.path().join("files/alpha.md");
    let (stdout, _, ok) = run_ragnetic(
        &config,
        &["chunk", file.to_str().unwrap(), "--max", "1000", "--min", "500"],
    );
    assert!(ok);
    assert_eq!(json_lines(&stdout).len(), 1);
}

#[test]
fn test_chunk_is_deterministic() {
    let (tmp, config) = setup_test_env();
    let file = tmp.path().join("files/nested/gamma.txt");
    let (first, _, _) = run_ragnetic(&config, &["chunk", file.to_str().unwrap()]);
    let (second, _, _) = run_ragnetic(&config, &["chunk", file.to_str().unwrap()]);
    assert_eq!(first, second);
}

#[test]
fn test_chunk_rejects_zero_max() {
    let (tmp, config) = setup_test_env();
    let file = tmp.path().join("files/alpha.md");
    let (_, stderr, ok) = run_ragnetic(&config, &["chunk", file.to_str().unwrap(), "--max", "0"]);
    assert!(!ok);
    assert!(stderr.contains("invalid chunk parameters"), "stderr: {}", stderr);
}

#[test]
fn test_chunk_unsupported_file_errors() {
    let (tmp, config) = setup_test_env();
    let file = tmp.path().join("files/image.png");
    let (_, stderr, ok) = run_ragnetic(&config, &["chunk", file.to_str().unwrap()]);
    assert!(!ok);
    assert!(stderr.contains("unsupported file type"), "stderr: {}", stderr);
}

#[test]
fn test_ingest_directory() {
    let (tmp, config) = setup_test_env();
    let files = tmp.path().join("files");
    let (stdout, stderr, ok) = run_ragnetic(&config, &["ingest", files.to_str().unwrap(), "--kb", "1"]);
    assert!(ok, "ingest failed: {}", stderr);

    let lines: Vec<&str> = stdout.lines().filter(|l| l.starts_with("doc ")).collect();
    assert_eq!(lines.len(), 3, "stdout: {}", stdout);
    assert!(lines.iter().all(|l| l.contains("indexed")));
    assert!(stdout.contains("gamma.txt"));
    assert!(!stdout.contains("image.png"));

    // Raw uploads land under the configured storage root.
    let uploads = tmp.path().join("data/objects/uploads");
    assert_eq!(fs::read_dir(uploads).unwrap().count(), 3);
}

#[test]
fn test_ingest_json_reports_and_dedup() {
    let (tmp, config) = setup_test_env();
    let files = tmp.path().join("files");
    fs::copy(files.join("alpha.md"), files.join("alpha-copy.md")).unwrap();

    let (stdout, stderr, ok) = run_ragnetic(
        &config,
        &["ingest", files.to_str().unwrap(), "--kb", "1", "--json"],
    );
    assert!(ok, "ingest failed: {}", stderr);

    let events = json_lines(&stdout);
    let duplicates: Vec<_> = events.iter().filter(|e| e["status"] == "duplicate").collect();
    let indexed: Vec<_> = events.iter().filter(|e| e["status"] == "indexed").collect();
    assert_eq!(duplicates.len(), 1);
    assert_eq!(indexed.len(), 3);
    assert!(indexed.iter().all(|e| e["chunks_indexed"].as_u64().unwrap() >= 1));
}

#[test]
fn test_ingest_then_query() {
    let (tmp, config) = setup_test_env();
    let files = tmp.path().join("files");
    let (stdout, stderr, ok) = run_ragnetic(
        &config,
        &[
            "ingest",
            files.to_str().unwrap(),
            "--kb",
            "1",
            "--query",
            "kubernetes docker deployment",
        ],
    );
    assert!(ok, "ingest failed: {}", stderr);
    assert!(stdout.contains("1. ["), "stdout: {}", stdout);
    let first_result = stdout.lines().find(|l| l.starts_with("1. [")).unwrap();
    assert!(first_result.contains("gamma.txt"), "stdout: {}", stdout);
}

#[test]
fn test_ingest_query_json_respects_top_k() {
    let (tmp, config) = setup_test_env();
    let files = tmp.path().join("files");
    let (stdout, _, ok) = run_ragnetic(
        &config,
        &["ingest", files.to_str().unwrap(), "--kb", "1", "--query", "document", "--json"],
    );
    assert!(ok);
    // Reports are JSON lines; the result list is the trailing pretty-printed array.
    let start = stdout.find("[\n").unwrap();
    let results: Vec<serde_json::Value> = serde_json::from_str(&stdout[start..]).unwrap();
    assert!(results.len() <= 3);
    let scores: Vec<f64> = results.iter().map(|r| r["score"].as_f64().unwrap()).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn test_ingest_missing_path_errors() {
    let (tmp, config) = setup_test_env();
    let missing = tmp.path().join("nope");
    let (_, stderr, ok) = run_ragnetic(&config, &["ingest", missing.to_str().unwrap(), "--kb", "1"]);
    assert!(!ok);
    assert!(stderr.contains("no supported files"), "stderr: {}", stderr);
}

#[test]
fn test_search_fresh_memory_index_is_empty() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_ragnetic(&config, &["search", "--kb", "1", "rust"]);
    assert!(ok, "search failed: {}", stderr);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_search_disabled_embeddings_errors() {
    let (_tmp, config) = setup_test_env();
    let content = fs::read_to_string(&config)
        .unwrap()
        .replace("provider = \"hashing\"", "provider = \"disabled\"");
    fs::write(&config, content).unwrap();

    let (_, stderr, ok) = run_ragnetic(&config, &["search", "--kb", "1", "rust"]);
    assert!(!ok);
    assert!(stderr.contains("retrieval backend unavailable"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_config_errors() {
    let (_tmp, config) = setup_test_env();
    fs::write(&config, "[index]\nbackend = \"elastic\"\n").unwrap();
    let (_, stderr, ok) = run_ragnetic(&config, &["search", "--kb", "1", "rust"]);
    assert!(!ok);
    assert!(stderr.contains("Unknown index backend"), "stderr: {}", stderr);
}

#[test]
fn test_missing_config_uses_defaults() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("note.txt");
    fs::write(&file, "A short note.").unwrap();
    let (stdout, stderr, ok) = run_ragnetic(
        &tmp.path().join("absent.toml"),
        &["chunk", file.to_str().unwrap()],
    );
    assert!(ok, "chunk failed: {}", stderr);
    assert_eq!(json_lines(&stdout).len(), 1);
}

#[test]
fn test_completions() {
    let output = Command::new(ragnetic_binary())
        .args(["completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("ragnetic"));
}
