// Oracle Execution Plans
// Actual-statistics plan with an estimated-plan fallback

use crate::db::statement::{insert_hint, is_read_only};
use crate::db::traits::DatabaseError;

pub const ACTUAL_PLAN_TYPE: &str = "DISPLAY_CURSOR (ALLSTATS LAST)";
pub const ESTIMATED_PLAN_TYPE: &str = "EXPLAIN PLAN (estimated)";

const GATHER_STATS_HINT: &str = "/*+ GATHER_PLAN_STATISTICS */";
const DISPLAY_CURSOR_SQL: &str =
    "SELECT plan_table_output FROM TABLE(DBMS_XPLAN.DISPLAY_CURSOR(NULL, NULL, 'ALLSTATS LAST'))";

/// The pieces of an Oracle session the plan logic needs.
/// Both calls must run on the same physical connection.
pub trait PlanSession {
    /// Run a statement, fetching and discarding any rows
    fn run(&mut self, sql: &str) -> Result<(), String>;

    /// Run a DBMS_XPLAN query and return its text lines
    fn plan_lines(&mut self, sql: &str) -> Result<Vec<String>, String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanOutcome {
    pub lines: Vec<String>,
    pub plan_type: &'static str,
    pub note: Option<String>,
}

/// Fetch a plan for `sql`, preferring runtime statistics.
///
/// Read-only statements are executed once with the statistics hint and the
/// last cursor is displayed. Anything else, or a failed first attempt, falls
/// back to `EXPLAIN PLAN`. Fails only when both attempts fail.
pub fn explain_with_fallback<S: PlanSession>(
    session: &mut S,
    sql: &str,
    statement_id: &str,
) -> Result<PlanOutcome, DatabaseError> {
    let sql = sql.trim().trim_end_matches(';').trim_end();

    let actual_failure = if is_read_only(sql) {
        match actual_plan(session, sql) {
            Ok(lines) => {
                return Ok(PlanOutcome {
                    lines,
                    plan_type: ACTUAL_PLAN_TYPE,
                    note: None,
                })
            }
            Err(e) => Some(e),
        }
    } else {
        None
    };

    match estimated_plan(session, sql, statement_id) {
        Ok(lines) => {
            let note = match &actual_failure {
                Some(cause) => format!(
                    "Runtime statistics unavailable ({}); showing the optimizer estimate",
                    cause
                ),
                None => "Statement was not executed because it may modify data; showing the optimizer estimate".to_string(),
            };
            Ok(PlanOutcome {
                lines,
                plan_type: ESTIMATED_PLAN_TYPE,
                note: Some(note),
            })
        }
        Err(estimate_failure) => Err(DatabaseError::PlanError(match actual_failure {
            Some(cause) => format!(
                "DISPLAY_CURSOR failed: {}; EXPLAIN PLAN failed: {}",
                cause, estimate_failure
            ),
            None => format!("EXPLAIN PLAN failed: {}", estimate_failure),
        })),
    }
}

fn actual_plan<S: PlanSession>(session: &mut S, sql: &str) -> Result<Vec<String>, String> {
    session.run(&insert_hint(sql, GATHER_STATS_HINT))?;
    let lines = session.plan_lines(DISPLAY_CURSOR_SQL)?;

    // DISPLAY_CURSOR reports a missing cursor as plan text rather than an error
    let missing = lines.is_empty()
        || lines
            .iter()
            .any(|line| line.contains("cannot be found") || line.contains("could not be found"));
    if missing {
        return Err("cursor for the executed statement was not found".to_string());
    }
    Ok(lines)
}

fn estimated_plan<S: PlanSession>(
    session: &mut S,
    sql: &str,
    statement_id: &str,
) -> Result<Vec<String>, String> {
    session.run(&format!(
        "EXPLAIN PLAN SET STATEMENT_ID = '{}' FOR {}",
        statement_id, sql
    ))?;
    let lines = session.plan_lines(&format!(
        "SELECT plan_table_output FROM TABLE(DBMS_XPLAN.DISPLAY('PLAN_TABLE', '{}', 'TYPICAL'))",
        statement_id
    ))?;

    if let Err(e) = session.run(&format!(
        "DELETE FROM plan_table WHERE statement_id = '{}'",
        statement_id
    )) {
        tracing::warn!(statement_id = %statement_id, "Could not clear plan table rows: {}", e);
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records statements and fails the ones matching a marker
    #[derive(Default)]
    struct FakeSession {
        executed: Vec<String>,
        fail_run_containing: Vec<&'static str>,
        fail_lines_containing: Vec<&'static str>,
        cursor_lines: Vec<String>,
    }

    impl PlanSession for FakeSession {
        fn run(&mut self, sql: &str) -> Result<(), String> {
            self.executed.push(sql.to_string());
            match self.fail_run_containing.iter().find(|m| sql.contains(**m)) {
                Some(m) => Err(format!("ORA-00900: invalid SQL statement ({})", m)),
                None => Ok(()),
            }
        }

        fn plan_lines(&mut self, sql: &str) -> Result<Vec<String>, String> {
            if self.fail_lines_containing.iter().any(|m| sql.contains(m)) {
                return Err("ORA-00942: table or view does not exist".to_string());
            }
            if sql.contains("DISPLAY_CURSOR") {
                Ok(self.cursor_lines.clone())
            } else {
                Ok(vec!["Plan hash value: 1".to_string(), "| 0 | SELECT STATEMENT |".to_string()])
            }
        }
    }

    #[test]
    fn test_read_only_query_uses_runtime_statistics() {
        let mut session = FakeSession {
            cursor_lines: vec!["SQL_ID  abc".to_string(), "| 0 | SELECT STATEMENT |".to_string()],
            ..Default::default()
        };
        let outcome = explain_with_fallback(&mut session, "SELECT * FROM emp;", "stmt1").unwrap();

        assert_eq!(outcome.plan_type, ACTUAL_PLAN_TYPE);
        assert!(outcome.note.is_none());
        assert_eq!(session.executed[0], "SELECT /*+ GATHER_PLAN_STATISTICS */ * FROM emp");
    }

    #[test]
    fn test_ddl_goes_straight_to_estimate() {
        let mut session = FakeSession::default();
        let outcome =
            explain_with_fallback(&mut session, "CREATE TABLE t AS SELECT * FROM emp", "stmt2").unwrap();

        assert_eq!(outcome.plan_type, ESTIMATED_PLAN_TYPE);
        assert!(outcome.note.unwrap().contains("not executed"));
        assert!(session.executed[0].starts_with("EXPLAIN PLAN SET STATEMENT_ID = 'stmt2' FOR CREATE TABLE"));
        assert!(!session.executed.iter().any(|s| s.contains("GATHER_PLAN_STATISTICS")));
        assert!(session.executed.last().unwrap().starts_with("DELETE FROM plan_table"));
    }

    #[test]
    fn test_missing_cursor_falls_back() {
        let mut session = FakeSession {
            cursor_lines: vec!["SQL_ID: abc, child number: 0 cannot be found".to_string()],
            ..Default::default()
        };
        let outcome = explain_with_fallback(&mut session, "SELECT 1 FROM dual", "stmt3").unwrap();
        assert_eq!(outcome.plan_type, ESTIMATED_PLAN_TYPE);
        assert!(outcome.note.unwrap().contains("Runtime statistics unavailable"));
    }

    #[test]
    fn test_both_tiers_failing_reports_both_causes() {
        let mut session = FakeSession {
            fail_run_containing: vec!["GATHER_PLAN_STATISTICS"],
            fail_lines_containing: vec!["DBMS_XPLAN.DISPLAY("],
            ..Default::default()
        };
        match explain_with_fallback(&mut session, "SELECT * FROM missing", "stmt4") {
            Err(DatabaseError::PlanError(msg)) => {
                assert!(msg.contains("DISPLAY_CURSOR failed"));
                assert!(msg.contains("EXPLAIN PLAN failed"));
                assert!(msg.contains("ORA-00942"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
