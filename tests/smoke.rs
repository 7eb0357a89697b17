//! Smoke tests -- verify the binary runs and the CLI surface is wired.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("cxmedic")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "Detection and root cause analysis",
        ));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("cxmedic")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("cxmedic"));
}

#[test]
fn test_detect_subcommand_exists() {
    Command::cargo_bin("cxmedic")
        .unwrap()
        .args(["detect", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--all-metrics"));
}

#[test]
fn test_rca_subcommand_exists() {
    Command::cargo_bin("cxmedic")
        .unwrap()
        .args(["rca", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--incident"));
}

#[test]
fn test_incidents_list_subcommand_exists() {
    Command::cargo_bin("cxmedic")
        .unwrap()
        .args(["incidents", "list", "--help"])
        .assert()
        .success();
}

#[test]
fn test_unknown_metric_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cx.db");
    Command::cargo_bin("cxmedic")
        .unwrap()
        .args(["detect", "--metric", "vibes", "--db"])
        .arg(&db)
        .assert()
        .failure()
        .stderr(predicates::str::contains("unknown metric"));
}

#[test]
fn test_detect_requires_a_metric() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cx.db");
    Command::cargo_bin("cxmedic")
        .unwrap()
        .args(["detect", "--db"])
        .arg(&db)
        .assert()
        .failure()
        .stderr(predicates::str::contains("--all-metrics"));
}

#[test]
fn test_ingest_reports_count() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cx.db");
    let jsonl = dir.path().join("orders.jsonl");

    let line = |id: &str| {
        format!(
            r#"{{"order_id":"{id}","placed_at":"2025-06-01T12:00:00Z","store_id":"store_1","category":"grocery","region":"SF","time_of_day":"lunch","basket_size":"medium","basket_value":42.0,"distance_miles":2.5,"merchant_prep_secs":600.0,"courier_wait_secs":300.0,"promised_at":"2025-06-01T12:30:00Z","delivered_at":"2025-06-01T12:30:00Z","items":8,"rating":5}}"#
        )
    };
    std::fs::write(&jsonl, format!("{}\n{}\n", line("o_1"), line("o_2"))).unwrap();

    Command::cargo_bin("cxmedic")
        .unwrap()
        .arg("ingest")
        .arg("--orders")
        .arg(&jsonl)
        .arg("--db")
        .arg(&db)
        .assert()
        .success()
        .stdout(predicates::str::contains("Ingested 2 orders"));
}

#[test]
fn test_ingest_rejects_malformed_lines() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cx.db");
    let jsonl = dir.path().join("orders.jsonl");
    std::fs::write(&jsonl, "not json\n").unwrap();

    Command::cargo_bin("cxmedic")
        .unwrap()
        .arg("ingest")
        .arg("--orders")
        .arg(&jsonl)
        .arg("--db")
        .arg(&db)
        .assert()
        .failure()
        .stderr(predicates::str::contains("malformed order record"));
}
