use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

const HEADER: [&str; 5] = ["command", "trip", "actor", "amount", "detail"];

#[test]
fn test_malformed_csv_handling() {
    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("robustness_test.csv");
    let mut wtr = csv::Writer::from_path(&output_path).unwrap();
    wtr.write_record(HEADER).unwrap();

    wtr.write_record(["create_ride", "t1", "alice", "1000", ""]).unwrap();
    // Unknown command
    wtr.write_record(["teleport", "t1", "bob", "", ""]).unwrap();
    // Amount is not a number
    wtr.write_record(["propose", "t1", "bob", "lots", ""]).unwrap();
    wtr.write_record(["assign", "t1", "bob", "", ""]).unwrap();
    wtr.write_record(["approve", "t1", "bob", "1000", ""]).unwrap();
    wtr.flush().unwrap();
    drop(wtr);

    let mut cmd = Command::new(cargo_bin!("tripflow"));
    cmd.arg(&output_path);

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Error reading command"))
        .stdout(predicate::str::contains(
            "t1,shared_ride,approved,approved,unbilled,1000",
        ));
}

#[test]
fn test_rejected_operations_do_not_stop_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("rules_test.csv");
    let mut wtr = csv::Writer::from_path(&output_path).unwrap();
    wtr.write_record(HEADER).unwrap();

    wtr.write_record(["create_ride", "t1", "alice", "1000", ""]).unwrap();
    // Unknown trip label
    wtr.write_record(["assign", "ghost", "bob", "", ""]).unwrap();
    wtr.write_record(["assign", "t1", "bob", "", ""]).unwrap();
    // The requester cannot drive
    wtr.write_record(["inbound", "t1", "alice", "", ""]).unwrap();
    // Approval at a price nobody offered
    wtr.write_record(["approve", "t1", "bob", "999", ""]).unwrap();
    // Payout with no balance
    wtr.write_record(["payout", "", "bob", "50", "+255700000002"]).unwrap();
    wtr.write_record(["approve", "t1", "bob", "1000", ""]).unwrap();
    wtr.write_record(["inbound", "t1", "bob", "", ""]).unwrap();
    wtr.flush().unwrap();
    drop(wtr);

    let mut cmd = Command::new(cargo_bin!("tripflow"));
    cmd.arg(&output_path);

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Error processing command: trip label not found: ghost"))
        .stderr(predicate::str::contains("alice may not"))
        .stderr(predicate::str::contains("insufficient funds"))
        .stdout(predicate::str::contains(
            "t1,shared_ride,inbound,approved,unbilled,1000",
        ));
}
