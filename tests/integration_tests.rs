//! Command-line tests for the `keytrim` binary

mod support;

use std::fs;

use assert_cmd::Command;
use keytrim::mp4::Movie;
use predicates::prelude::*;
use tempfile::TempDir;

use support::{scenario_tracks, write_mp4};

fn keytrim(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("keytrim").unwrap();
    cmd.current_dir(dir.path())
        .env("RUST_LOG", "warn")
        .env_remove("KEYTRIM_LOG_LEVEL")
        .env_remove("KEYTRIM_RETAIN_AUDIO")
        .env_remove("KEYTRIM_RETAIN_VIDEO");
    cmd
}

fn fixture(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("input.mp4");
    write_mp4(&path, &scenario_tracks());
    path
}

#[test]
fn test_trim_writes_output_and_prints_path() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir);
    let output = dir.path().join("clip.mp4");

    keytrim(&dir)
        .args(["trim", "-i"])
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .args(["-s", "1.0", "-e", "00:03.000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("clip.mp4"));

    let movie = Movie::open(&output).unwrap();
    assert_eq!(movie.duration_ms(), 4000);
    assert_eq!(movie.tracks.len(), 2);
}

#[test]
fn test_trim_full_range_copies_bytes() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir);
    let output = dir.path().join("copy.mp4");

    keytrim(&dir)
        .args(["trim", "-i"])
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .args(["-s", "0", "-e", "12000ms"])
        .assert()
        .success();

    assert_eq!(fs::read(&output).unwrap(), fs::read(&input).unwrap());
}

#[test]
fn test_trim_rejects_bad_start_time() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir);

    keytrim(&dir)
        .args(["trim", "-i"])
        .arg(&input)
        .args(["-o", "out.mp4", "-s", "soon", "-e", "2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid start time"));
    assert!(!dir.path().join("out.mp4").exists());
}

#[test]
fn test_trim_rejects_inverted_range() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir);

    keytrim(&dir)
        .args(["trim", "-i"])
        .arg(&input)
        .args(["-o", "out.mp4", "-s", "5", "-e", "2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid trim range"));
}

#[test]
fn test_trim_missing_input_fails() {
    let dir = TempDir::new().unwrap();

    keytrim(&dir)
        .args(["trim", "-i", "missing.mp4", "-o", "out.mp4", "-s", "0", "-e", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing.mp4"));
}

#[test]
fn test_inspect_json() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir);

    let output = keytrim(&dir)
        .args(["inspect", "--json", "-i"])
        .arg(&input)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(report["duration_ms"], 12_000);
    let tracks = report["tracks"].as_array().unwrap();
    assert_eq!(tracks.len(), 2);
    assert_eq!(tracks[0]["media_type"], "video");
    assert_eq!(tracks[0]["sync_samples"], 3);
    assert_eq!(tracks[1]["media_type"], "audio");
    assert_eq!(tracks[1]["sample_count"], 120);
}

#[test]
fn test_inspect_human_readable() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir);

    keytrim(&dir)
        .args(["inspect", "-i"])
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("Media Information"))
        .stdout(predicate::str::contains("video [vide]"));
}

#[test]
fn test_invalid_config_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir);
    fs::write(dir.path().join("keytrim.toml"), "[keytrim]\nworker_threads = 0\n").unwrap();

    keytrim(&dir)
        .args(["inspect", "-i"])
        .arg(&input)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn test_both_streams_dropped_is_rejected() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir);

    keytrim(&dir)
        .args(["trim", "--no-audio", "--no-video", "-o", "out.mp4", "-s", "0", "-e", "1", "-i"])
        .arg(&input)
        .assert()
        .failure()
        .stderr(predicate::str::contains("retain_audio"));
}
