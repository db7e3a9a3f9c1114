//! Command-line behaviour of the `sstress` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn sstress(log_dir: &TempDir) -> Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("sstress");
    cmd.env_remove("SSTRESS_SIMULATE")
        .env_remove("SSTRESS_BUDGET")
        .arg("--log-dir")
        .arg(log_dir.path())
        .arg("--timeout_ms")
        .arg("50");
    cmd
}

#[test]
fn successful_run_reports_and_exits_zero() {
    let dir = TempDir::new().unwrap();
    sstress(&dir)
        .args(["--simulate", "succeed", "--budget", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("good: 2 / 2 budget, pass limit 2"))
        .stdout(predicate::str::contains("Completed: OK (seen expected 0)"));
    assert!(dir.path().join("ctx0.log").exists());
}

#[test]
fn missed_pass_limit_exits_one() {
    let dir = TempDir::new().unwrap();
    sstress(&dir)
        .args(["--simulate", "timeout", "--budget", "3", "--pass-limit", "1"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("good: 0 / 3 budget, pass limit 1"))
        .stdout(predicate::str::contains("Completed: failed: exit 1, expected 0"));
}

#[test]
fn expected_failure_counts_as_success() {
    let dir = TempDir::new().unwrap();
    sstress(&dir)
        .args(["--simulate", "nack", "--expected-exit", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Completed: OK (seen expected 1)"));
}

#[test]
fn conflicting_fault_switches_are_a_configuration_error() {
    let dir = TempDir::new().unwrap();
    sstress(&dir)
        .args(["--simulate", "succeed", "--force-portal", "--force-no-internet"])
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("mutually exclusive"));
    assert!(!dir.path().join("ctx0.log").exists());
}

#[test]
fn concurrency_out_of_range_is_rejected() {
    let dir = TempDir::new().unwrap();
    sstress(&dir).args(["-c", "101"]).assert().code(2);
}

#[test]
fn unreadable_policy_is_a_configuration_error() {
    let dir = TempDir::new().unwrap();
    sstress(&dir)
        .args(["--simulate", "succeed", "--policy"])
        .arg(dir.path().join("missing.json"))
        .assert()
        .code(2);
}

#[test]
fn hanging_transport_exits_through_the_watchdog() {
    let dir = TempDir::new().unwrap();
    sstress(&dir)
        .args([
            "--simulate",
            "hang",
            "--budget",
            "2",
            "--watchdog-grace-ms",
            "20",
        ])
        .assert()
        .code(124)
        .stdout(predicate::str::contains("Completed").not());
}

#[test]
fn captive_portal_simulation_spends_the_budget_and_fails() {
    let dir = TempDir::new().unwrap();
    sstress(&dir)
        .args(["--simulate", "succeed", "--force-portal", "--budget", "2"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("good: 0 / 2 budget"))
        .stdout(predicate::str::contains("Completed: failed: exit 1, expected 0"));
}

#[test]
fn process_fanout_gives_each_instance_its_own_log() {
    let dir = TempDir::new().unwrap();
    sstress(&dir)
        .args(["--simulate", "succeed", "-c", "4"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ctx0: Completed: OK"));
    for k in 0..4 {
        assert!(
            dir.path().join(format!("ctx{k}.log")).exists(),
            "ctx{k}.log missing"
        );
    }
}

#[test]
fn thread_fanout_reports_every_instance() {
    let dir = TempDir::new().unwrap();
    sstress(&dir)
        .args(["--simulate", "succeed", "-c", "3", "--fanout", "thread"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ctx0: Completed: OK"))
        .stdout(predicate::str::contains("ctx2: Completed: OK"));
}
