use classic_ado::{Engine, ObjectRef, RequestContext, Variant};
use std::sync::Arc;
use tempfile::TempDir;

fn obj(value: Variant) -> ObjectRef {
    match value {
        Variant::Object(obj) => obj,
        other => panic!("expected object, got {other:?}"),
    }
}

fn open_db(ctx: &RequestContext) -> ObjectRef {
    let db = ctx.create_object("G3DB").unwrap();
    let opened = db
        .call("Open", &[Variant::from("sqlite"), Variant::from("shop.db")])
        .unwrap();
    assert_eq!(opened, Variant::Bool(true), "{:?}", db.get("LastError"));
    db
}

fn count_orders(engine: &Arc<Engine>, root: &TempDir) -> i64 {
    let ctx = RequestContext::with_root(engine.clone(), root.path());
    let db = open_db(&ctx);
    let row = obj(db
        .call("QueryRow", &[Variant::from("SELECT COUNT(*) AS n FROM orders")])
        .unwrap());
    row.call_default(&[Variant::from("n")]).unwrap().to_int()
}

fn setup() -> (Arc<Engine>, TempDir) {
    let engine = Arc::new(Engine::default());
    let root = tempfile::tempdir().unwrap();
    let ctx = RequestContext::with_root(engine.clone(), root.path());
    let db = open_db(&ctx);
    db.call("Exec", &[Variant::from("CREATE TABLE orders (id INTEGER PRIMARY KEY, item TEXT)")])
        .unwrap();
    (engine, root)
}

#[test]
fn test_relative_paths_resolve_against_request_root() {
    let (_engine, root) = setup();
    assert!(root.path().join("shop.db").exists());
}

#[test]
fn test_uncommitted_transaction_rolls_back_at_teardown() {
    let (engine, root) = setup();
    {
        let ctx = RequestContext::with_root(engine.clone(), root.path());
        let db = open_db(&ctx);
        let tx = obj(db.call("Begin", &[]).unwrap());
        tx.call("Exec", &[Variant::from("INSERT INTO orders (item) VALUES (?)"), "lamp".into()])
            .unwrap();
        assert!(ctx.teardown() >= 2);
        assert_eq!(tx.get("Closed"), Variant::Bool(true));
        assert_eq!(tx.get("Committed"), Variant::Bool(false));
    }
    assert_eq!(count_orders(&engine, &root), 0);
}

#[test]
fn test_committed_transaction_is_visible() {
    let (engine, root) = setup();
    {
        let ctx = RequestContext::with_root(engine.clone(), root.path());
        let db = open_db(&ctx);
        let tx = obj(db.call("BeginTrans", &[]).unwrap());
        tx.call("Exec", &[Variant::from("INSERT INTO orders (item) VALUES ('desk')")])
            .unwrap();
        assert_eq!(tx.call("Commit", &[]).unwrap(), Variant::Bool(true));
        assert_eq!(tx.call("Commit", &[]).unwrap(), Variant::Bool(false));
    }
    assert_eq!(count_orders(&engine, &root), 1);
}

#[test]
fn test_connection_transaction_rolls_back_on_close() {
    let (engine, root) = setup();
    {
        let ctx = RequestContext::with_root(engine.clone(), root.path());
        let conn = ctx.create_object("ADODB.Connection").unwrap();
        conn.call("Open", &[Variant::from("embedded:shop.db")]).unwrap();
        assert_eq!(conn.get("State"), Variant::Int(1));
        conn.call("BeginTrans", &[]).unwrap();
        conn.call("Execute", &[Variant::from("INSERT INTO orders (item) VALUES ('chair')")])
            .unwrap();
    }
    assert_eq!(count_orders(&engine, &root), 0);
}

#[test]
fn test_teardown_drains_once() {
    let engine = Arc::new(Engine::default());
    let ctx = RequestContext::new(engine);
    let conn = ctx.create_object("ADODB.Connection").unwrap();
    conn.call("Open", &[Variant::from("embedded::memory:")]).unwrap();
    let rs = obj(conn.call("Execute", &[Variant::from("SELECT 1 AS one")]).unwrap());
    let db = ctx.create_object("G3DB").unwrap();

    assert_eq!(ctx.resources().len(), 3);
    assert_eq!(ctx.teardown(), 3);
    assert_eq!(ctx.teardown(), 0);
    assert_eq!(conn.get("State"), Variant::Int(0));
    assert_eq!(rs.get("State"), Variant::Int(0));
    assert_eq!(db.get("IsOpen"), Variant::Bool(false));
}

#[test]
fn test_prepared_statement_survives_repeated_close() {
    let engine = Arc::new(Engine::default());
    let ctx = RequestContext::new(engine);
    let db = ctx.create_object("G3DB").unwrap();
    db.call("Open", &[Variant::from("sqlite"), Variant::from(":memory:")])
        .unwrap();
    let stmt = obj(db.call("PrepareContext", &[Variant::Int(3), Variant::from("SELECT ? AS v")]).unwrap());
    let row = obj(stmt.call("QueryRow", &[Variant::from("x")]).unwrap());
    assert_eq!(row.call_default(&[Variant::from("v")]).unwrap(), Variant::from("x"));

    stmt.call("Close", &[]).unwrap();
    stmt.call("Close", &[]).unwrap();
    ctx.teardown();
    assert_eq!(stmt.get("Closed"), Variant::Bool(true));
}

const DEFERRED_FK: [&str; 3] = [
    "PRAGMA foreign_keys = ON",
    "CREATE TABLE parent (id INTEGER PRIMARY KEY)",
    "CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER \
     REFERENCES parent(id) DEFERRABLE INITIALLY DEFERRED)",
];

#[test]
fn test_refused_commit_ends_the_transaction() {
    let root = tempfile::tempdir().unwrap();
    let ctx = RequestContext::with_root(Arc::new(Engine::default()), root.path());
    let db = open_db(&ctx);
    for sql in DEFERRED_FK {
        db.call("Exec", &[Variant::from(sql)]).unwrap();
    }

    let tx = obj(db.call("Begin", &[]).unwrap());
    tx.call("Exec", &[Variant::from("INSERT INTO child (parent_id) VALUES (99)")])
        .unwrap();
    assert_eq!(tx.call("Commit", &[]).unwrap(), Variant::Bool(false));
    assert_eq!(tx.get("Closed"), Variant::Bool(true));
    assert_eq!(tx.get("Committed"), Variant::Bool(false));
    assert!(!db.get("LastError").to_string().is_empty());

    let next = obj(db.call("Begin", &[]).unwrap());
    let row = obj(next
        .call("QueryRow", &[Variant::from("SELECT COUNT(*) AS n FROM child")])
        .unwrap());
    assert_eq!(row.call_default(&[Variant::from("n")]).unwrap(), Variant::Int(0));
    assert_eq!(next.call("Commit", &[]).unwrap(), Variant::Bool(true));
}

#[test]
fn test_refused_commit_trans_ends_the_transaction() {
    let ctx = RequestContext::new(Arc::new(Engine::default()));
    let conn = ctx.create_object("ADODB.Connection").unwrap();
    conn.call("Open", &[Variant::from("embedded::memory:")]).unwrap();
    for sql in DEFERRED_FK {
        conn.call("Execute", &[Variant::from(sql)]).unwrap();
    }
    let errors = obj(conn.get("Errors"));

    conn.call("BeginTrans", &[]).unwrap();
    conn.call("Execute", &[Variant::from("INSERT INTO child (parent_id) VALUES (99)")])
        .unwrap();
    conn.call("CommitTrans", &[]).unwrap();
    assert_eq!(errors.get("Count"), Variant::Int(1));

    assert_eq!(conn.call("BeginTrans", &[]).unwrap(), Variant::Int(1));
    assert_eq!(errors.get("Count"), Variant::Int(1));
    conn.call("Execute", &[Variant::from("INSERT INTO parent (id) VALUES (1)")])
        .unwrap();
    conn.call("CommitTrans", &[]).unwrap();
    assert_eq!(errors.get("Count"), Variant::Int(0));

    let rs = obj(conn
        .call(
            "Execute",
            &[Variant::from(
                "SELECT (SELECT COUNT(*) FROM parent) AS parents, \
                 (SELECT COUNT(*) FROM child) AS children",
            )],
        )
        .unwrap());
    assert_eq!(rs.call_default(&[Variant::from("parents")]).unwrap(), Variant::Int(1));
    assert_eq!(rs.call_default(&[Variant::from("children")]).unwrap(), Variant::Int(0));
}
