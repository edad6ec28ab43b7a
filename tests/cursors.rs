//! Cursor lifecycle inside routines

mod common;

use common::*;
use rustql_sp::ast::{BinaryOp, Block, CursorDecl, Expr, HandlerDecl, Param, ParamMode, SqlStatement, Stmt, VarDecl};
use rustql_sp::condition::{ConditionValue, HandlerKind};
use rustql_sp::{ErrorCode, Value};

fn var(name: &str, default: Option<i64>) -> VarDecl {
    VarDecl {
        names: vec![name.to_string()],
        field: int(),
        default: default.map(|v| Expr::lit(v)),
    }
}

fn cursor(name: &str, query: &str) -> CursorDecl {
    CursorDecl {
        name: name.to_string(),
        query: SqlStatement::query(query),
    }
}

fn fetch(into: &[&str]) -> Stmt {
    Stmt::Fetch {
        cursor: "c".into(),
        into: into.iter().map(|v| v.to_string()).collect(),
    }
}

fn rows(values: &[i64]) -> Vec<Vec<Value>> {
    values.iter().map(|v| vec![Value::Int(*v)]).collect()
}

#[test]
fn test_fetch_loop_until_not_found() {
    let mut host = MockHost::new();
    host.table("SELECT a FROM t", rows(&[1, 2, 3]));
    host.define(procedure(
        "sum_rows",
        vec![],
        Stmt::Block(Block {
            vars: vec![var("done", Some(0)), var("v", None), var("total", Some(0))],
            cursors: vec![cursor("c", "SELECT a FROM t")],
            handlers: vec![HandlerDecl {
                kind: HandlerKind::Continue,
                conditions: vec![ConditionValue::NotFound],
                body: Box::new(Stmt::set("done", Expr::lit(1))),
            }],
            body: vec![
                Stmt::Open("c".into()),
                Stmt::Loop {
                    label: Some("l".into()),
                    body: vec![
                        fetch(&["v"]),
                        Stmt::If {
                            branches: vec![(
                                Expr::binary(BinaryOp::Eq, Expr::var("done"), Expr::lit(1)),
                                vec![Stmt::Leave("l".into())],
                            )],
                            else_body: None,
                        },
                        Stmt::set("total", Expr::binary(BinaryOp::Add, Expr::var("total"), Expr::var("v"))),
                    ],
                },
                Stmt::Close("c".into()),
                Stmt::set_user("total", Expr::var("total")),
                Stmt::set_user("last", Expr::var("v")),
            ],
            ..Block::default()
        }),
    ));
    let mut s = session(host, 0);

    s.call_procedure(&name("sum_rows"), &[]).unwrap();
    assert_eq!(s.user_var("total"), Some(&Value::Int(6)));
    assert_eq!(s.user_var("last"), Some(&Value::Int(3)));
    assert_eq!(s.host().texts(), vec!["SELECT a FROM t"]);
}

#[test]
fn test_fetch_past_end_without_handler() {
    let mut host = MockHost::new();
    host.table("SELECT a FROM t", rows(&[7]));
    host.define(procedure(
        "p",
        vec![],
        Stmt::Block(Block {
            vars: vec![var("v", None)],
            cursors: vec![cursor("c", "SELECT a FROM t")],
            body: vec![
                Stmt::Open("c".into()),
                fetch(&["v"]),
                Stmt::set_user("first", Expr::var("v")),
                fetch(&["v"]),
                Stmt::set_user("second", Expr::lit(1)),
            ],
            ..Block::default()
        }),
    ));
    let mut s = session(host, 0);

    let err = s.call_procedure(&name("p"), &[]).unwrap_err();
    assert_eq!(err.code, ErrorCode::NoData);
    assert_eq!(err.sqlstate, "02000");
    assert_eq!(s.user_var("first"), Some(&Value::Int(7)));
    assert_eq!(s.user_var("second"), None);
}

#[test]
fn test_cursor_state_errors() {
    let mut host = MockHost::new();
    let body = |stmts: Vec<Stmt>| {
        Stmt::Block(Block {
            vars: vec![var("v", None)],
            cursors: vec![cursor("c", "SELECT a FROM t")],
            body: stmts,
            ..Block::default()
        })
    };
    host.define(procedure(
        "open_twice",
        vec![],
        body(vec![Stmt::Open("c".into()), Stmt::Open("c".into())]),
    ));
    host.define(procedure("close_unopened", vec![], body(vec![Stmt::Close("c".into())])));
    host.define(procedure("fetch_unopened", vec![], body(vec![fetch(&["v"])])));
    host.table("SELECT a FROM t", vec![vec![Value::Int(1), Value::Int(2)]]);
    host.define(procedure(
        "fetch_wrong_width",
        vec![],
        body(vec![Stmt::Open("c".into()), fetch(&["v"])]),
    ));
    let mut s = session(host, 0);

    let err = s.call_procedure(&name("open_twice"), &[]).unwrap_err();
    assert_eq!(err.code, ErrorCode::CursorAlreadyOpen);
    assert_eq!(err.sqlstate, "24000");
    let err = s.call_procedure(&name("close_unopened"), &[]).unwrap_err();
    assert_eq!(err.code, ErrorCode::CursorNotOpen);
    let err = s.call_procedure(&name("fetch_unopened"), &[]).unwrap_err();
    assert_eq!(err.code, ErrorCode::NoData);
    let err = s.call_procedure(&name("fetch_wrong_width"), &[]).unwrap_err();
    assert_eq!(err.code, ErrorCode::FetchArity);
}

#[test]
fn test_cursor_query_binds_variables() {
    let mut host = MockHost::new();
    let query = "SELECT a FROM t WHERE b < ?";
    host.table(query, rows(&[4]));
    host.define(procedure(
        "p",
        vec![Param::new("lim", ParamMode::In, int())],
        Stmt::Block(Block {
            vars: vec![var("v", None)],
            cursors: vec![CursorDecl {
                name: "c".into(),
                query: SqlStatement::query(query).with_params(vec![Expr::var("lim")]),
            }],
            body: vec![Stmt::Open("c".into()), fetch(&["v"]), Stmt::set_user("v", Expr::var("v"))],
            ..Block::default()
        }),
    ));
    let mut s = session(host, 0);

    s.call_procedure(&name("p"), &[Expr::lit(10)]).unwrap();
    assert_eq!(s.host().executed[0].params, vec![Value::Int(10)]);
    assert_eq!(s.user_var("v"), Some(&Value::Int(4)));
}

#[test]
fn test_cursor_reopened_after_close() {
    let mut host = MockHost::new();
    host.table("SELECT a FROM t", rows(&[5]));
    host.define(procedure(
        "p",
        vec![],
        Stmt::Block(Block {
            vars: vec![var("v", None), var("sum", Some(0))],
            cursors: vec![cursor("c", "SELECT a FROM t")],
            body: vec![
                Stmt::Open("c".into()),
                fetch(&["v"]),
                Stmt::Close("c".into()),
                Stmt::set("sum", Expr::var("v")),
                Stmt::Open("c".into()),
                fetch(&["v"]),
                Stmt::Close("c".into()),
                Stmt::set_user("sum", Expr::binary(BinaryOp::Add, Expr::var("sum"), Expr::var("v"))),
            ],
            ..Block::default()
        }),
    ));
    let mut s = session(host, 0);

    s.call_procedure(&name("p"), &[]).unwrap();
    assert_eq!(s.user_var("sum"), Some(&Value::Int(10)));
    assert_eq!(s.host().executed.len(), 2);
}

#[test]
fn test_handler_cursor_with_nested_cursor_open() {
    let mut host = MockHost::new();
    host.table("SELECT handler_row", rows(&[99]));
    host.table("SELECT inner_row", rows(&[1]));
    let handler_body = Stmt::Block(Block {
        cursors: vec![cursor("hc", "SELECT handler_row")],
        body: vec![
            Stmt::Open("hc".into()),
            Stmt::Fetch {
                cursor: "hc".into(),
                into: vec!["v".into()],
            },
            Stmt::set_user("got", Expr::var("v")),
            Stmt::Close("hc".into()),
        ],
        ..Block::default()
    });
    host.define(procedure(
        "p",
        vec![],
        Stmt::Block(Block {
            vars: vec![var("v", None)],
            handlers: vec![HandlerDecl {
                kind: HandlerKind::Continue,
                conditions: vec![ConditionValue::Exception],
                body: Box::new(handler_body),
            }],
            body: vec![Stmt::Block(Block {
                cursors: vec![cursor("c", "SELECT inner_row")],
                body: vec![
                    Stmt::Open("c".into()),
                    Stmt::Signal {
                        condition: ConditionValue::SqlState("45000".into()),
                        message: None,
                    },
                    fetch(&["v"]),
                    Stmt::set_user("inner", Expr::var("v")),
                ],
                ..Block::default()
            })],
            ..Block::default()
        }),
    ));
    let mut s = session(host, 0);

    s.call_procedure(&name("p"), &[]).unwrap();
    assert_eq!(s.user_var("got"), Some(&Value::Int(99)));
    // The nested block's cursor is untouched by the handler
    assert_eq!(s.user_var("inner"), Some(&Value::Int(1)));
    assert_eq!(s.host().texts(), vec!["SELECT inner_row", "SELECT handler_row"]);
}
