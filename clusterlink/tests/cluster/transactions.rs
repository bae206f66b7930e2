//! Key transactions: seize, execute, commit, rollback, release.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use clusterlink::{
    AbortOption, ClientConfig, CommitState, CompletionState, ErrorCode, ExecType, NodeId,
    OperationStatus, SignalKind, TransactionOutcome,
};

use super::fake::KEY_REJECTED;
use super::{NODES, start, start_with};

#[test]
fn test_simple_commit() {
    let h = start();
    let session = h.context.session().expect("session");
    let tx = session.start_transaction_on(NodeId(1)).expect("start");

    let handle = tx.insert("accounts", vec![42], vec![1, 2]).expect("insert");
    tx.execute(ExecType::Commit, AbortOption::AbortOnError)
        .expect("commit");

    assert_eq!(tx.commit_state().expect("state"), CommitState::Committed);
    assert_eq!(
        tx.completion_state().expect("state"),
        CompletionState::CompletedSuccess
    );
    let op = tx.operation_result(handle).expect("operation");
    assert_eq!(op.status(), OperationStatus::Completed);
    assert!(!op.error().is_set());
    assert_eq!(h.fake.count_on(NodeId(1), SignalKind::TcKeyReq), 1);
    assert_eq!(h.fake.count(SignalKind::TcCommitReq), 0);

    tx.close().expect("close");
    assert_eq!(h.fake.count(SignalKind::TcReleaseReq), 0);
}

#[test]
fn test_zero_operation_commit_is_local() {
    let h = start();
    let session = h.context.session().expect("session");
    let tx = session.start_transaction_on(NodeId(2)).expect("start");

    tx.execute(ExecType::Commit, AbortOption::AbortOnError)
        .expect("commit");

    assert_eq!(tx.commit_state().expect("state"), CommitState::Committed);
    assert_eq!(h.fake.count(SignalKind::TcKeyReq), 0);
    assert_eq!(h.fake.count(SignalKind::TcCommitReq), 0);
}

#[test]
fn test_read_then_commit() {
    let h = start();
    let session = h.context.session().expect("session");
    let tx = session.start_transaction().expect("start");

    let handle = tx.read("accounts", vec![5], vec![0, 1, 2]).expect("read");
    tx.execute(ExecType::NoCommit, AbortOption::AbortOnError)
        .expect("execute");
    assert_eq!(tx.commit_state().expect("state"), CommitState::Started);
    let op = tx.operation_result(handle).expect("operation");
    assert_eq!(op.data(), &[500, 501, 502]);

    tx.execute(ExecType::Commit, AbortOption::AbortOnError)
        .expect("commit");
    assert_eq!(tx.commit_state().expect("state"), CommitState::Committed);
    assert_eq!(h.fake.count(SignalKind::TcCommitReq), 1);
}

#[test]
fn test_rejected_key_rolls_back_on_close() {
    let h = start();
    h.fake.reject_key(13);
    let session = h.context.session().expect("session");
    let tx = session.start_transaction_on(NodeId(1)).expect("start");

    tx.update("accounts", vec![13], vec![9]).expect("update");
    let err = tx
        .execute(ExecType::NoCommit, AbortOption::AbortOnError)
        .expect_err("rejected key fails the execute");
    assert_eq!(err.code(), KEY_REJECTED);
    assert_eq!(tx.commit_state().expect("state"), CommitState::NeedAbort);
    assert_eq!(tx.error().expect("error").code(), KEY_REJECTED);

    tx.close().expect("close");
    assert_eq!(h.fake.count(SignalKind::TcRollbackReq), 1);
    assert_eq!(h.fake.count(SignalKind::TcReleaseReq), 0);
}

#[test]
fn test_unknown_table_is_recorded() {
    let h = start();
    let session = h.context.session().expect("session");
    let tx = session.start_transaction().expect("start");

    let err = tx
        .insert("missing", vec![1], vec![])
        .expect_err("unknown table");
    assert_eq!(err.code(), ErrorCode::UNKNOWN_TABLE);
    assert_eq!(tx.error().expect("error").code(), ErrorCode::UNKNOWN_TABLE);
}

#[test]
fn test_timeout_leaves_terminal_state() {
    let h = start_with(
        ClientConfig::local_network().with_response_timeout(Duration::from_millis(30), 2),
    );
    let session = h.context.session().expect("session");
    let tx = session.start_transaction_on(NodeId(1)).expect("start");
    h.fake.silence(NodeId(1));

    tx.insert("accounts", vec![1], vec![1]).expect("insert");
    let err = tx
        .execute(ExecType::Commit, AbortOption::AbortOnError)
        .expect_err("silent node");

    assert_eq!(err.code(), ErrorCode::RESPONSE_TIMEOUT);
    assert_eq!(tx.commit_state().expect("state"), CommitState::Aborted);
    assert_eq!(
        tx.completion_state().expect("state"),
        CompletionState::CompletedFailure
    );
    assert!(tx.release_on_close().expect("flag"));
    assert_eq!(session.in_flight().expect("in flight"), 0);

    tx.close().expect("close");
    assert_eq!(h.fake.count(SignalKind::TcReleaseReq), 1);
}

#[test]
fn test_async_execute_runs_callbacks_from_poll() {
    let h = start();
    let session = h.context.session().expect("session");
    let outcomes: Arc<Mutex<Vec<TransactionOutcome>>> = Arc::new(Mutex::new(Vec::new()));

    let transactions: Vec<_> = (0..3)
        .map(|i| {
            let tx = session.start_transaction().expect("start");
            tx.insert("accounts", vec![i], vec![i]).expect("insert");
            tx
        })
        .collect();
    for tx in &transactions {
        let outcomes = Arc::clone(&outcomes);
        session
            .execute_async(
                tx,
                ExecType::Commit,
                AbortOption::AbortOnError,
                Box::new(move |outcome| outcomes.lock().push(outcome.clone())),
            )
            .expect("execute async");
    }

    let mut ran = 0;
    for _ in 0..10 {
        ran += session.poll(3 - ran, Duration::from_millis(500)).expect("poll");
        if ran == 3 {
            break;
        }
    }
    assert_eq!(ran, 3);

    let outcomes = outcomes.lock();
    assert_eq!(outcomes.len(), 3);
    for outcome in outcomes.iter() {
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.commit_state, CommitState::Committed);
        assert_eq!(outcome.completion_state, CompletionState::CompletedSuccess);
    }
    assert_eq!(session.in_flight().expect("in flight"), 0);
}

#[test]
fn test_batched_prepare_sends_together() {
    let h = start();
    let session = h.context.session().expect("session");
    let first = session.start_transaction_on(NodeId(1)).expect("start");
    let second = session.start_transaction_on(NodeId(2)).expect("start");
    let count = Arc::new(Mutex::new(0));

    for tx in [&first, &second] {
        tx.write("accounts", vec![3], vec![4]).expect("write");
        let count = Arc::clone(&count);
        tx.execute_async_prepare(
            ExecType::Commit,
            AbortOption::AbortOnError,
            Box::new(move |_| *count.lock() += 1),
        )
        .expect("prepare");
    }
    assert_eq!(h.fake.count(SignalKind::TcKeyReq), 0);

    assert_eq!(session.send_prepared().expect("send"), 2);
    let ran = session.poll(2, Duration::from_secs(2)).expect("poll");
    assert_eq!(ran, 2);
    assert_eq!(*count.lock(), 2);
    assert_eq!(h.fake.count_on(NodeId(1), SignalKind::TcKeyReq), 1);
    assert_eq!(h.fake.count_on(NodeId(2), SignalKind::TcKeyReq), 1);
}

#[test]
fn test_prepare_twice_is_rejected() {
    let h = start();
    let session = h.context.session().expect("session");
    let tx = session.start_transaction().expect("start");
    tx.insert("accounts", vec![1], vec![]).expect("insert");

    tx.execute_async_prepare(ExecType::Commit, AbortOption::AbortOnError, Box::new(|_| {}))
        .expect("prepare");
    let err = tx
        .execute_async_prepare(ExecType::Commit, AbortOption::AbortOnError, Box::new(|_| {}))
        .expect_err("already prepared");
    assert_eq!(err.code(), ErrorCode::INVALID_STATE);

    session.send_prepared().expect("send");
    assert_eq!(session.poll(1, Duration::from_secs(2)).expect("poll"), 1);
    assert_eq!(h.fake.count(SignalKind::TcKeyReq), 1);
}

#[test]
fn test_pooled_record_is_reused() {
    let h = start();
    let session = h.context.session().expect("session");

    let first = session.start_transaction_on(NodeId(1)).expect("start");
    first.insert("accounts", vec![1], vec![]).expect("insert");
    first
        .execute(ExecType::Commit, AbortOption::AbortOnError)
        .expect("commit");
    let first_id = first.transaction_id().expect("id");
    first.close().expect("close");

    let second = session.start_transaction_on(NodeId(1)).expect("start");
    assert_eq!(h.fake.count(SignalKind::TcSeizeReq), 1);
    assert_ne!(second.transaction_id().expect("id"), first_id);
    assert_eq!(
        second.commit_state().expect("state"),
        CommitState::NotStarted
    );
    drop(second);

    session.close().expect("close session");
    assert_eq!(h.fake.count(SignalKind::TcReleaseReq), 1);
}

#[test]
fn test_seize_refused_tries_another_node() {
    let h = start();
    h.fake.refuse_seize(NodeId(1), ErrorCode::NODE_FAILURE);
    let session = h.context.session().expect("session");

    for _ in 0..2 {
        let tx = session.start_transaction().expect("start");
        assert_eq!(tx.node().expect("node"), Some(NodeId(2)));
    }
}

#[test]
fn test_refused_seize_frees_the_record() {
    let mut config = ClientConfig::local_network();
    config.transaction_pool_size = 1;
    let h = start_with(config);
    h.fake.refuse_seize(NodeId(1), ErrorCode::NODE_FAILURE);
    let session = h.context.session().expect("session");

    let err = session
        .start_transaction_on(NodeId(1))
        .expect_err("seize refused");
    assert_eq!(err.code(), ErrorCode::NODE_FAILURE);
    assert_eq!(session.in_flight().expect("in flight"), 0);

    let tx = session.start_transaction_on(NodeId(2)).expect("start");
    assert_eq!(tx.node().expect("node"), Some(NodeId(2)));
}

#[test]
fn test_dead_node_is_never_picked() {
    let h = start();
    h.nodes.set_dead(NodeId(2));
    let session = h.context.session().expect("session");
    for _ in 0..3 {
        let tx = session.start_transaction().expect("start");
        assert_eq!(tx.node().expect("node"), Some(NodeId(1)));
    }
    assert_eq!(h.fake.count_on(NodeId(2), SignalKind::TcSeizeReq), 0);
}

#[test]
fn test_sends_never_overlap() {
    let h = start();
    thread::scope(|scope| {
        for worker in 0..4u32 {
            let context = &h.context;
            scope.spawn(move || {
                let session = context.session().expect("session");
                for i in 0..10 {
                    let tx = session.start_transaction().expect("start");
                    tx.insert("accounts", vec![worker * 100 + i], vec![i])
                        .expect("insert");
                    tx.execute(ExecType::Commit, AbortOption::AbortOnError)
                        .expect("commit");
                }
            });
        }
    });

    assert_eq!(h.fake.overlapping_sends(), 0);
    assert_eq!(h.fake.count(SignalKind::TcKeyReq), 40);
    let metrics = h.context.metrics();
    assert_eq!(metrics.send_failures, 0);
    assert!(metrics.signals_sent >= 40);
    assert_eq!(
        NODES
            .iter()
            .map(|node| h.fake.count_on(*node, SignalKind::TcKeyReq))
            .sum::<usize>(),
        40
    );
}
