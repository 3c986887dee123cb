//! Integration tests for the `calogan` binary.
//!
//! These tests cover:
//! - Argument parsing and configuration precedence
//! - Dataset errors surfacing with context
//! - Single- and multi-worker training runs on a tiny dataset

use assert_cmd::Command;
use ndarray::{Array1, Array3};
use ndarray_npy::NpzWriter;
use predicates::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn calogan() -> Command {
    Command::cargo_bin("calogan").unwrap()
}

fn write_class(path: &Path, events: usize, offset: f32) {
    let pixel = |i: usize, r: usize, c: usize| 1000.0 * (((i + r + c) % 3) as f32 + offset);
    let mut npz = NpzWriter::new(File::create(path).unwrap());
    npz.add_array("layer_0", &Array3::from_shape_fn((events, 2, 8), |(i, r, c)| pixel(i, r, c))).unwrap();
    npz.add_array("layer_1", &Array3::from_shape_fn((events, 4, 4), |(i, r, c)| pixel(i, r, c))).unwrap();
    npz.add_array("layer_2", &Array3::from_shape_fn((events, 4, 2), |(i, r, c)| pixel(i, r, c))).unwrap();
    npz.add_array("energy", &Array1::from_shape_fn(events, |i| 10.0 + i as f32)).unwrap();
    npz.finish().unwrap();
}

/// Two particle classes of four events each, plus a small-model config file.
fn fixture(temp: &TempDir) -> (PathBuf, PathBuf) {
    write_class(&temp.path().join("eplus.npz"), 4, 0.0);
    write_class(&temp.path().join("gamma.npz"), 4, 0.5);
    let manifest = temp.path().join("particles.yaml");
    std::fs::write(&manifest, "eplus: eplus.npz\ngamma: gamma.npz\n").unwrap();
    let config = temp.path().join("calogan.toml");
    std::fs::write(&config, "[model]\nhidden_size = 16\nfeature_size = 4\nmbd_features = 3\nmbd_vspace = 3\n").unwrap();
    (manifest, config)
}

fn small_run(temp: &TempDir) -> Command {
    let (manifest, config) = fixture(temp);
    let mut cmd = calogan();
    cmd.arg("--config")
        .arg(config)
        .args(["--nb-epochs", "1", "--batch-size", "4", "--latent-size", "8", "--log-level", "warn"])
        .arg("--checkpoint-dir")
        .arg(temp.path())
        .arg(manifest);
    cmd
}

#[test]
fn test_help_lists_training_flags() {
    calogan()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--nb-epochs"))
        .stdout(predicate::str::contains("--load-model"))
        .stdout(predicate::str::contains("--process0"))
        .stdout(predicate::str::contains("--workers"));
}

#[test]
fn test_dataset_is_required() {
    calogan().assert().failure().stderr(predicate::str::contains("DATASET"));
}

#[test]
fn test_print_config_applies_overrides() {
    let temp = TempDir::new().unwrap();
    let (manifest, config) = fixture(&temp);
    calogan()
        .arg("--config")
        .arg(config)
        .args(["--batch-size", "64", "--last-activation", "leakyrelu", "--no-delete", "--print-config"])
        .arg(manifest)
        .assert()
        .success()
        .stdout(predicate::str::contains("batch_size = 64"))
        .stdout(predicate::str::contains("hidden_size = 16"))
        .stdout(predicate::str::contains("last_activation = \"leakyrelu\""))
        .stdout(predicate::str::contains("retain_after_load = true"));
}

#[test]
fn test_invalid_averaging_coeff_fails() {
    calogan()
        .args(["--weights-averaging-coeff", "2.0", "--print-config", "particles.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid training configuration"));
}

#[test]
fn test_missing_dataset_reports_path() {
    let temp = TempDir::new().unwrap();
    calogan()
        .arg(temp.path().join("absent.yaml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load dataset"));
}

#[test]
fn test_single_worker_run_writes_checkpoints() {
    let temp = TempDir::new().unwrap();
    small_run(&temp)
        .arg("--save-model")
        .assert()
        .success()
        .stdout(predicate::str::contains("Training complete"));

    for name in [
        "params_generator_epoch_0000_000.weights",
        "params_discriminator_epoch_0000_000.weights",
        "params_combined_epoch_0000_000.optimizer",
        "training_manifest_000.json",
    ] {
        assert!(temp.path().join(name).exists(), "{name} missing");
    }
}

#[test]
fn test_two_workers_report_json_manifests() {
    let temp = TempDir::new().unwrap();
    let output = small_run(&temp).args(["--workers", "2", "--json"]).assert().success().get_output().stdout.clone();

    let manifests: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let manifests = manifests.as_array().unwrap();
    assert_eq!(manifests.len(), 2);
    assert_eq!(manifests[1]["rank"], 1);
    assert_eq!(manifests[0]["world_size"], 2);
    assert!(temp.path().join("params_generator_epoch_0000_001.weights").exists());
}
