//! Runs the `hits` binary against simulated devices

use std::process::{Command, Output};

fn hits(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_hits"))
        .arg("--simulate")
        .args(args)
        .env("RUST_LOG", "info")
        .output()
        .expect("failed to run hits")
}

#[test]
fn test_reports_every_transfer_in_order() {
    let output = hits(&["--dtod=1,0", "--htod=2", "--iter=3", "--size=4096"]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Completed."));
    let results: Vec<&str> = stdout
        .lines()
        .filter(|line| line.starts_with("Transfer "))
        .collect();
    assert_eq!(results.len(), 2);
    assert!(results[0]
        .starts_with("Transfer 0 - P2P transfers from Device 0 (0x10) to Device 1 (0x20): "));
    assert!(results[1]
        .starts_with("Transfer 1 - Direct transfers (Host to Device) with Device 2 (0x30): "));
    assert!(results[1].ends_with(" seconds)"));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Launching Host to Device transfers with Device 2 (0x30)"));
    assert!(stderr.contains("Host buffer allocated on NUMA node 0"));
}

#[test]
fn test_no_transfer_exits_with_failure() {
    let output = hits(&["--iter=3"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_malformed_peer_pair_exits_with_failure() {
    let output = hits(&["--dtod=1,2,3"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_oversized_transfer_exits_with_failure() {
    let output = hits(&["--htod=0", "--size=1073741825"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_unknown_device_exits_with_failure() {
    let output = hits(&["--dtoh=8", "--size=1024"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(!String::from_utf8_lossy(&output.stdout).contains("Completed."));
}

#[test]
fn test_json_report() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("hits.json");

    let output = hits(&[
        "--dtoh=5",
        "--iter=2",
        "--size=2048",
        "--disable-pinned-memory",
        "--json",
        path.to_str().unwrap(),
    ]);
    assert!(output.status.success());

    let contents = std::fs::read_to_string(&path).unwrap();
    let report: serde_json::Value = serde_json::from_str(&contents).unwrap();
    assert_eq!(report["runtime"], "mock");
    assert_eq!(report["policy"]["pinned"], false);
    assert_eq!(report["channels"][0]["numa_node"], 1);
    assert_eq!(report["channels"][0]["measurement"]["bytes_total"], 4096);
}
