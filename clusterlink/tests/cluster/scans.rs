//! Table scans: batch assembly, fetching, stopping and failures.

use clusterlink::{ErrorCode, NodeId, ScanOptions, ScanStatus, ScanStep, SignalKind};

use super::{ACCOUNTS, account_rows, start};

fn options() -> ScanOptions {
    ScanOptions::default()
        .with_parallelism(2)
        .with_batch_rows(2)
}

#[test]
fn test_scan_delivers_every_row() {
    let h = start();
    h.fake.load_table(ACCOUNTS, account_rows(10));
    let session = h.context.session().expect("session");
    let tx = session.start_transaction_on(NodeId(1)).expect("start");

    let cursor = tx.scan_table("accounts", options()).expect("define scan");
    assert_eq!(cursor.status().expect("status"), ScanStatus::Idle);
    cursor.execute().expect("execute scan");

    let mut rows = Vec::new();
    loop {
        match cursor.next_scan_result(true).expect("next row") {
            ScanStep::Row(row) => rows.push(row),
            ScanStep::Finished => break,
            ScanStep::NeedFetch => panic!("fetch was allowed"),
        }
    }
    rows.sort();
    assert_eq!(rows, account_rows(10));
    assert_eq!(cursor.rows_fetched().expect("fetched"), 10);
    assert_eq!(cursor.rows_delivered().expect("delivered"), 10);
    assert_eq!(cursor.status().expect("status"), ScanStatus::Finished);
    // 4 + 4 + 2 rows
    assert_eq!(h.fake.count(SignalKind::ScanNextReq), 2);

    cursor.close().expect("close scan");
    assert_eq!(h.fake.stops(), 0);
}

#[test]
fn test_exhausted_batch_needs_fetch() {
    let h = start();
    h.fake.load_table(ACCOUNTS, account_rows(6));
    let session = h.context.session().expect("session");
    let tx = session.start_transaction_on(NodeId(2)).expect("start");
    let cursor = tx.scan_table("accounts", options()).expect("define scan");
    cursor.execute().expect("execute scan");

    for _ in 0..4 {
        assert!(matches!(
            cursor.next_scan_result(false).expect("row"),
            ScanStep::Row(_)
        ));
    }
    assert_eq!(
        cursor.next_scan_result(false).expect("step"),
        ScanStep::NeedFetch
    );
    assert_eq!(h.fake.count(SignalKind::ScanNextReq), 0);

    let mut remaining = 0;
    while let ScanStep::Row(_) = cursor.next_scan_result(true).expect("step") {
        remaining += 1;
    }
    assert_eq!(remaining, 2);
    assert_eq!(h.fake.count(SignalKind::ScanNextReq), 1);
}

#[test]
fn test_duplicate_confirmation_is_ignored() {
    let h = start();
    h.fake.duplicate_scan_conf();
    h.fake.load_table(ACCOUNTS, account_rows(5));
    let session = h.context.session().expect("session");
    let tx = session.start_transaction().expect("start");
    let cursor = tx.scan_table("accounts", options()).expect("define scan");
    cursor.execute().expect("execute scan");

    let mut rows = 0;
    while let ScanStep::Row(_) = cursor.next_scan_result(true).expect("step") {
        rows += 1;
    }
    assert_eq!(rows, 5);
    assert!(!tx.error().expect("error").is_set());
}

#[test]
fn test_empty_table_finishes_immediately() {
    let h = start();
    let session = h.context.session().expect("session");
    let tx = session.start_transaction().expect("start");
    let cursor = tx.scan_table("accounts", options()).expect("define scan");
    cursor.execute().expect("execute scan");

    assert_eq!(
        cursor.next_scan_result(true).expect("step"),
        ScanStep::Finished
    );
    assert_eq!(cursor.rows_fetched().expect("fetched"), 0);
}

#[test]
fn test_close_stops_open_scan() {
    let h = start();
    h.fake.load_table(ACCOUNTS, account_rows(20));
    let session = h.context.session().expect("session");
    let tx = session.start_transaction_on(NodeId(1)).expect("start");
    let cursor = tx.scan_table("accounts", options()).expect("define scan");
    cursor.execute().expect("execute scan");

    assert!(matches!(
        cursor.next_scan_result(true).expect("row"),
        ScanStep::Row(_)
    ));
    cursor.close().expect("close scan");
    assert_eq!(h.fake.stops(), 1);
}

#[test]
fn test_node_failure_mid_scan() {
    let h = start();
    h.fake.load_table(ACCOUNTS, account_rows(10));
    let session = h.context.session().expect("session");
    let tx = session.start_transaction_on(NodeId(1)).expect("start");
    let cursor = tx.scan_table("accounts", options()).expect("define scan");
    cursor.execute().expect("execute scan");

    assert!(matches!(
        cursor.next_scan_result(true).expect("row"),
        ScanStep::Row(_)
    ));
    h.context.report_node_failure(NodeId(1));

    let err = cursor
        .next_scan_result(true)
        .expect_err("scan should fail");
    assert_eq!(err.code(), ErrorCode::NODE_FAILURE);
    assert_eq!(cursor.status().expect("status"), ScanStatus::Error);
    assert_eq!(tx.error().expect("error").code(), ErrorCode::NODE_FAILURE);
    assert_eq!(h.context.metrics().node_failures, 1);

    cursor.close().expect("close scan");
    assert_eq!(h.fake.stops(), 0);
}

#[test]
fn test_second_execute_is_rejected() {
    let h = start();
    let session = h.context.session().expect("session");
    let tx = session.start_transaction_on(NodeId(1)).expect("start");
    let cursor = tx.scan_table("accounts", options()).expect("define scan");
    cursor.execute().expect("execute scan");

    let err = cursor.execute().expect_err("second start");
    assert_eq!(err.code(), ErrorCode::INVALID_SCAN_USAGE);
}
