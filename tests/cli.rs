use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const CONFIG: &str = r#"
[runner]
filter_patch_versions = true
shoot_prefix = "it-"

[[flavors]]
provider = "aws"
kubernetes = { pattern = "*" }
description = "nightly"

[[flavors.workers]]
[[flavors.workers.workerPools]]
name = "wp1"
machine = { type = "m5.large", image = { name = "gardenlinux" } }

[[extended_flavors]]
provider = "gcp"
cloudprofile = "gcp-profile"
projectName = "it"
region = "europe-west1"
secretBinding = "sb"
kubernetes = { versions = [{ version = "1.15.2" }] }

[catalogs.aws]
kubernetes = [{ version = "1.14.3" }, { version = "1.14.4" }, { version = "1.15.0" }]

[catalogs.aws.machine_images]
gardenlinux = [
    { version = "3.4.0", architectures = ["amd64"] },
    { version = "3.5.0", architectures = ["arm64"] },
]

[catalogs.gcp-profile]
kubernetes = [{ version = "1.15.2" }]
"#;

fn write_config(extra: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("testmatrix.toml");
    std::fs::write(&path, format!("{extra}\n{CONFIG}")).unwrap();
    (dir, path)
}

fn testmatrix(config: &PathBuf) -> Command {
    let mut cmd = Command::cargo_bin("testmatrix").unwrap();
    cmd.arg("--config").arg(config);
    cmd
}

#[test]
fn test_validate_valid_config() {
    let (_dir, path) = write_config("");
    testmatrix(&path)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Extended flavors: 1"));
}

#[test]
fn test_validate_reports_every_violation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("testmatrix.toml");
    std::fs::write(
        &path,
        r#"
        [[flavors]]
        kubernetes = { pattern = "latest" }

        [[flavors]]
        provider = "aws"
        kubernetes = { pattern = "latest" }
        [[flavors.workers]]
        [[flavors.workers.workerPools]]
        name = "wp1"
        machine = { type = "m5.large", image = { name = "gardenlinux" }, architecture = "s390x" }
        "#,
    )
    .unwrap();

    testmatrix(&path)
        .arg("validate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("flavors[0].provider"))
        .stderr(predicate::str::contains(
            "flavors[1].workers[0].workerPools[0].machine.architecture",
        ));
}

#[test]
fn test_validate_missing_file() {
    testmatrix(&PathBuf::from("/nonexistent/testmatrix.toml"))
        .arg("validate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_expand_text() {
    let (_dir, path) = write_config("");
    testmatrix(&path)
        .arg("expand")
        .assert()
        .success()
        .stdout(predicate::str::contains("Expanded 2 instances"))
        .stdout(predicate::str::contains("aws/1.14.4/gardenlinux/nightly"))
        .stdout(predicate::str::contains("gardenlinux:3.4.0 (amd64)"))
        .stdout(predicate::str::contains("[it-"));
}

#[test]
fn test_expand_json() {
    let (_dir, path) = write_config("");
    let output = testmatrix(&path)
        .args(["expand", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let instances = value["flavors"]["instances"].as_array().unwrap();
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[1]["kubernetesVersion"]["version"], "1.15.0");
    assert_eq!(
        value["flavors"]["usedKubernetesVersions"]["aws"]
            .as_array()
            .unwrap()
            .len(),
        2
    );

    let extended = &value["extendedFlavors"]["instances"][0]["extended"];
    assert_eq!(extended["namespace"], "garden-it");
}

#[test]
fn test_expand_unsatisfiable_pattern() {
    let (_dir, path) = write_config("");
    let config = std::fs::read_to_string(&path)
        .unwrap()
        .replace(r#"pattern = "*""#, r#"pattern = "~1.20""#);
    std::fs::write(&path, config).unwrap();

    testmatrix(&path)
        .arg("expand")
        .assert()
        .failure()
        .stderr(predicate::str::contains("flavors[0].kubernetes"));
}

#[test]
fn test_expand_reports_base_and_extended_violations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("testmatrix.toml");
    std::fs::write(
        &path,
        r#"
        [[flavors]]
        kubernetes = { pattern = "latest" }

        [[extended_flavors]]
        provider = "gcp"
        cloudprofile = "gcp-profile"
        projectName = "it"
        secretBinding = "sb"
        kubernetes = { pattern = "latest" }
        "#,
    )
    .unwrap();

    testmatrix(&path)
        .arg("expand")
        .assert()
        .failure()
        .stderr(predicate::str::contains("flavors[0].provider"))
        .stderr(predicate::str::contains("extendedFlavors[0].region"));
}

#[test]
fn test_run_requires_command() {
    let (_dir, path) = write_config("");
    testmatrix(&path)
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No command configured"));
}

#[cfg(unix)]
#[test]
fn test_run_all_succeed() {
    let (_dir, path) = write_config("");
    testmatrix(&path)
        .args(["run", "--command", "true"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("All testruns succeeded!"));
}

#[cfg(unix)]
#[test]
fn test_run_failures_exhaust_retries() {
    let (_dir, path) = write_config("");
    testmatrix(&path)
        .args(["run", "--command", "false", "--flake-attempts", "1"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Some testruns failed."))
        .stdout(predicate::str::contains("(attempt 1)"));
}

#[cfg(unix)]
#[test]
fn test_run_flaky_exit_code() {
    // Fails unless the testrun is a retry of a previous attempt.
    let (_dir, path) = write_config(
        r#"
        [executor]
        backoff_bucket = 1
        "#,
    );
    let script = r#"sh -c 'case "$TESTMATRIX_TESTRUN" in *previous-attempt*) exit 0 ;; *) exit 1 ;; esac'"#;
    testmatrix(&path)
        .args(["run", "--flake-attempts", "2", "--command", script])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("Flaky:"));
}
