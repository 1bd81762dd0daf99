//! Integration tests for single-statement execution on self-acquired connections.

mod common;

use common::setup;
use db_pool_executor::error::DbError;
use db_pool_executor::models::{ExecResult, InsertOutcome, QueryParam, Row, UpdateOutcome};
use serde_json::json;

fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn test_select_returns_rows_unmodified() {
    let (driver, _manager, executor) = setup();
    let rows = vec![
        row(json!({"id": 1, "name": "Ada", "tags": ["a", "b"]})),
        row(json!({"id": 2, "name": null, "tags": []})),
    ];
    let expected = rows.clone();
    driver.script(|s| s.rows = rows);

    let result = executor
        .select(
            "SELECT id, name, tags FROM users WHERE id IN (?, ?)",
            &[QueryParam::from(1), QueryParam::from(2)],
            None,
            false,
        )
        .await
        .unwrap();

    assert_eq!(result, expected);
    assert_eq!(driver.acquisitions(), 1);
    assert_eq!(driver.releases(), 1);
}

#[tokio::test]
async fn test_insert_returns_only_id_by_default() {
    let (driver, _manager, executor) = setup();
    driver.script(|s| {
        s.exec_result = Some(ExecResult {
            insert_id: Some(42),
            affected_rows: 1,
        })
    });

    let outcome = executor
        .insert(
            "INSERT INTO users (name) VALUES (?)",
            &[QueryParam::from("Ada")],
            None,
            false,
            false,
        )
        .await
        .unwrap();

    assert_eq!(outcome, InsertOutcome::Id(Some(42)));
    assert_eq!(outcome.insert_id(), Some(42));
    assert_eq!(outcome.affected_rows(), None);
}

#[tokio::test]
async fn test_insert_with_affected_rows() {
    let (_driver, _manager, executor) = setup();

    let outcome = executor
        .insert(
            "INSERT INTO users (name) VALUES (?)",
            &[QueryParam::from("Ada")],
            None,
            false,
            true,
        )
        .await
        .unwrap();

    assert_eq!(
        outcome,
        InsertOutcome::WithAffectedRows {
            insert_id: Some(42),
            affected_rows: Some(1),
        }
    );
    assert_eq!(
        serde_json::to_value(outcome).unwrap(),
        json!({"insert_id": 42, "affected_rows": 1})
    );
}

#[tokio::test]
async fn test_insert_without_result_metadata() {
    let (driver, _manager, executor) = setup();
    driver.script(|s| s.exec_result = None);

    let outcome = executor
        .insert("INSERT INTO audit VALUES ()", &[], None, false, true)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        InsertOutcome::WithAffectedRows {
            insert_id: None,
            affected_rows: None,
        }
    );
}

#[tokio::test]
async fn test_update_payload_only_when_requested() {
    let (driver, _manager, executor) = setup();
    driver.script(|s| {
        s.exec_result = Some(ExecResult {
            insert_id: None,
            affected_rows: 3,
        })
    });
    let sql = "UPDATE users SET active = ? WHERE team = ?";
    let params = [QueryParam::from(false), QueryParam::from("ops")];

    let silent = executor.update(sql, &params, None, false, false).await.unwrap();
    let counted = executor.update(sql, &params, None, false, true).await.unwrap();

    assert_eq!(silent, UpdateOutcome::Done);
    assert_eq!(counted, UpdateOutcome::AffectedRows(Some(3)));
    assert_eq!(driver.releases(), 2);
}

#[tokio::test]
async fn test_failed_statements_still_release() {
    let (driver, _manager, executor) = setup();
    driver.script(|s| s.fail_sql_containing = Some("broken".into()));

    let select = executor.select("SELECT broken", &[], None, false).await;
    let insert = executor
        .insert("INSERT broken", &[], None, false, false)
        .await;
    let update = executor
        .update("UPDATE broken", &[], None, false, true)
        .await;

    for result in [select.map(|_| ()), insert.map(|_| ()), update.map(|_| ())] {
        assert!(matches!(result, Err(DbError::Query { .. })));
    }
    assert_eq!(driver.acquisitions(), 3);
    assert_eq!(driver.releases(), 3);
    // No transaction, no rollback
    assert_eq!(driver.rollbacks(), 0);
}

#[tokio::test]
async fn test_query_error_carries_code_and_sql() {
    let (driver, _manager, executor) = setup();
    driver.script(|s| s.fail_sql_containing = Some("FORM".into()));

    let err = executor
        .select("SELECT * FORM users", &[], None, false)
        .await
        .unwrap_err();

    match &err {
        DbError::Query { code, sql, .. } => {
            assert_eq!(code.as_deref(), Some("1064"));
            assert_eq!(sql, "SELECT * FORM users");
        }
        other => panic!("expected query error, got {other:?}"),
    }
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_acquisition_failure_is_reported_without_running_statement() {
    let (driver, _manager, executor) = setup();
    driver.script(|s| s.acquire_returns_nothing = true);

    let err = executor
        .select("SELECT 1", &[], None, false)
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::ConnectionUnavailable));
    assert!(driver.executed().is_empty());
}

#[tokio::test]
async fn test_trans_without_connection_is_rejected() {
    let (driver, _manager, executor) = setup();

    let err = executor
        .insert("INSERT INTO t VALUES (?)", &[QueryParam::from(1)], None, true, false)
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::InvalidInput { .. }));
    assert_eq!(driver.acquisitions(), 0);
    assert!(driver.executed().is_empty());
}

#[tokio::test]
async fn test_supplied_connection_is_not_released() {
    let (driver, _manager, executor) = setup();
    let mut conn = executor.get_connection().await.unwrap();

    executor
        .select("SELECT 1", &[], Some(&mut conn), false)
        .await
        .unwrap();
    executor
        .update("UPDATE t SET x = 1", &[], Some(&mut conn), false, false)
        .await
        .unwrap();

    assert_eq!(driver.acquisitions(), 1);
    assert_eq!(driver.releases(), 0);

    executor.release(conn).await;
    assert_eq!(driver.releases(), 1);
}

#[tokio::test]
async fn test_failure_on_supplied_connection_without_trans_skips_rollback() {
    let (driver, _manager, executor) = setup();
    driver.script(|s| s.fail_sql_containing = Some("boom".into()));
    let mut conn = executor.get_connection().await.unwrap();

    let result = executor
        .update("UPDATE boom", &[], Some(&mut conn), false, false)
        .await;

    assert!(matches!(result, Err(DbError::Query { .. })));
    assert_eq!(driver.rollbacks(), 0);
    assert_eq!(driver.releases(), 0);
    executor.release(conn).await;
}
