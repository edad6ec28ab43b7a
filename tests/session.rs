//! Session-level behaviour: cancellation, re-parsing, host failures

mod common;

use common::*;
use rustql_sp::ast::{BinaryOp, Block, Expr, HandlerDecl, Param, ParamMode, SqlStatement, StatementKind, Stmt};
use rustql_sp::condition::{ConditionValue, HandlerKind};
use rustql_sp::{Error, ErrorCode, Value};

fn dml(text: &str) -> SqlStatement {
    SqlStatement::new(text, StatementKind::Dml)
}

fn spin_forever() -> rustql_sp::ast::RoutineSource {
    procedure(
        "spin",
        vec![],
        Stmt::Block(Block {
            handlers: vec![
                HandlerDecl {
                    kind: HandlerKind::Continue,
                    conditions: vec![ConditionValue::Exception],
                    body: Box::new(Stmt::set_user("handled", Expr::lit(1))),
                },
                HandlerDecl {
                    kind: HandlerKind::Continue,
                    conditions: vec![ConditionValue::ErrorNumber(ErrorCode::Interrupted.number())],
                    body: Box::new(Stmt::set_user("handled", Expr::lit(2))),
                },
            ],
            body: vec![Stmt::Loop {
                label: None,
                body: vec![Stmt::Sql(dml("UPDATE t SET a = a + 1"))],
            }],
            ..Block::default()
        }),
    )
}

#[test]
fn test_kill_interrupts_running_call() {
    let mut host = MockHost::new();
    host.define(spin_forever());
    host.define(procedure("p", vec![], Stmt::Sql(dml("UPDATE t SET a = 0"))));
    let mut s = session(host, 0);
    let flag = s.kill_handle();
    s.host_mut().kill_after = Some((3, flag));

    let err = s.call_procedure(&name("spin"), &[]).unwrap_err();
    assert_eq!(err.code, ErrorCode::Interrupted);
    assert_eq!(s.user_var("handled"), None);
    assert_eq!(s.host().executed.len(), 3);
    assert_eq!(s.call_depth(), 0);
    assert_eq!(s.state().database.as_deref(), Some(DB));

    // Still killed: the next call stops before its first instruction
    assert!(s.is_killed());
    s.host_mut().kill_after = None;
    assert_eq!(
        s.call_procedure(&name("p"), &[]).unwrap_err().code,
        ErrorCode::Interrupted
    );
    assert_eq!(s.host().executed.len(), 3);

    s.reset_kill();
    s.call_procedure(&name("p"), &[]).unwrap();
    assert_eq!(s.host().executed.len(), 4);
}

#[test]
fn test_stale_statement_is_reparsed_once() {
    let mut host = MockHost::new();
    let text = "UPDATE t SET a = ?";
    host.stale_once.insert(text.to_string());
    host.define(procedure(
        "p",
        vec![Param::new("x", ParamMode::In, int())],
        Stmt::Sql(dml(text).with_params(vec![Expr::var("x")])),
    ));
    let mut s = session(host, 0);

    s.call_procedure(&name("p"), &[Expr::lit(4)]).unwrap();
    assert_eq!(s.host().reparsed, vec![text.to_string()]);
    assert_eq!(s.host().executed.len(), 1);
    assert_eq!(s.host().executed[0].params, vec![Value::Int(4)]);

    // The cached routine is unchanged; the next run does not re-parse
    s.call_procedure(&name("p"), &[Expr::lit(5)]).unwrap();
    assert_eq!(s.host().reparsed.len(), 1);
}

#[test]
fn test_stale_cursor_query_is_reparsed() {
    let mut host = MockHost::new();
    let query = "SELECT a FROM t";
    host.stale_once.insert(query.to_string());
    host.table(query, vec![vec![Value::Int(9)]]);
    host.define(procedure(
        "p",
        vec![],
        Stmt::Block(Block {
            vars: vec![rustql_sp::ast::VarDecl {
                names: vec!["v".into()],
                field: int(),
                default: None,
            }],
            cursors: vec![rustql_sp::ast::CursorDecl {
                name: "c".into(),
                query: SqlStatement::query(query),
            }],
            body: vec![
                Stmt::Open("c".into()),
                Stmt::Fetch {
                    cursor: "c".into(),
                    into: vec!["v".into()],
                },
                Stmt::set_user("v", Expr::var("v")),
            ],
            ..Block::default()
        }),
    ));
    let mut s = session(host, 0);

    s.call_procedure(&name("p"), &[]).unwrap();
    assert_eq!(s.host().reparsed, vec![query.to_string()]);
    assert_eq!(s.user_var("v"), Some(&Value::Int(9)));
}

#[test]
fn test_statement_error_reaches_handlers() {
    let mut host = MockHost::new();
    let failing = "DELETE FROM locked";
    host.failures.insert(
        failing.to_string(),
        Error::with_message(ErrorCode::Statement, "table is locked"),
    );
    host.define(procedure("bare", vec![], Stmt::Sql(dml(failing))));
    host.define(procedure(
        "guarded",
        vec![],
        Stmt::Block(Block {
            handlers: vec![HandlerDecl {
                kind: HandlerKind::Exit,
                conditions: vec![ConditionValue::Exception],
                body: Box::new(Stmt::set_user("failed", Expr::lit(1))),
            }],
            body: vec![Stmt::Sql(dml(failing)), Stmt::set_user("after", Expr::lit(1))],
            ..Block::default()
        }),
    ));
    let mut s = session(host, 0);

    let err = s.call_procedure(&name("bare"), &[]).unwrap_err();
    assert_eq!(err.code, ErrorCode::Statement);
    assert_eq!(err.message, "table is locked");

    s.call_procedure(&name("guarded"), &[]).unwrap();
    assert_eq!(s.user_var("failed"), Some(&Value::Int(1)));
    assert_eq!(s.user_var("after"), None);
}

#[test]
fn test_non_strict_division_warns() {
    let mut host = MockHost::new();
    let source = procedure(
        "p",
        vec![],
        Stmt::Block(Block {
            body: vec![
                Stmt::set_user("r", Expr::binary(BinaryOp::Div, Expr::lit(1), Expr::lit(0))),
                Stmt::set_user("after", Expr::lit(1)),
            ],
            ..Block::default()
        }),
    );
    let def = rustql_sp::RoutineDefinition::new(source.name.clone(), rustql_sp::RoutineKind::Procedure, "SET @r = 1 / 0")
        .with_sql_mode(rustql_sp::SqlMode::empty());
    host.define_with(def, source);
    let mut s = session(host, 0);

    s.call_procedure(&name("p"), &[]).unwrap();
    assert_eq!(s.user_var("r"), Some(&Value::Null));
    assert_eq!(s.user_var("after"), Some(&Value::Int(1)));
    assert_eq!(s.warnings().len(), 1);
    assert_eq!(s.warnings()[0].code, ErrorCode::DivisionByZero);
}

#[test]
fn test_user_variables_ignore_case() {
    let mut s = session(MockHost::new(), 0);
    s.set_user_var("Total", 3);
    assert_eq!(s.user_var("TOTAL"), Some(&Value::Int(3)));
    assert_eq!(s.user_var("missing"), None);
}
