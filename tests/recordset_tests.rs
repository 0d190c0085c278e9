use classic_ado::{ArrayRef, Engine, ObjectRef, RequestContext, Variant};
use insta::assert_snapshot;
use std::sync::Arc;

fn request() -> RequestContext {
    RequestContext::new(Arc::new(Engine::default()))
}

fn obj(value: Variant) -> ObjectRef {
    match value {
        Variant::Object(obj) => obj,
        other => panic!("expected object, got {other:?}"),
    }
}

fn sql(text: &str) -> Variant {
    Variant::from(text)
}

/// In-memory connection with `people(id, name, age)` holding the given rows
fn people(ctx: &RequestContext, rows: &[(&str, i64)]) -> ObjectRef {
    let conn = ctx.create_object("ADODB.Connection").unwrap();
    conn.call("Open", &[sql("embedded::memory:")]).unwrap();
    assert_eq!(conn.get("State"), Variant::Int(1));
    conn.call(
        "Execute",
        &[sql("CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")],
    )
    .unwrap();
    for (name, age) in rows {
        let params = ArrayRef::from_values(vec![Variant::from(*name), Variant::Int(*age)]);
        conn.call(
            "Execute",
            &[sql("INSERT INTO people (name, age) VALUES (?, ?)"), Variant::Array(params)],
        )
        .unwrap();
    }
    conn
}

fn open_recordset(ctx: &RequestContext, conn: &ObjectRef, source: &str) -> ObjectRef {
    let rs = ctx.create_object("ADODB.Recordset").unwrap();
    rs.call("Open", &[sql(source), Variant::Object(conn.clone())])
        .unwrap();
    assert_eq!(rs.get("State"), Variant::Int(1));
    rs
}

/// Visits every row from the current position, collecting one column
fn visit(rs: &ObjectRef, column: &str) -> Vec<String> {
    let mut seen = Vec::new();
    while !rs.get("EOF").to_bool() {
        seen.push(rs.call_default(&[sql(column)]).unwrap().to_string());
        rs.call("MoveNext", &[]).unwrap();
    }
    seen
}

fn ages() -> Vec<(&'static str, i64)> {
    vec![("ann", 10), ("bob", 40), ("cid", 25)]
}

#[test]
fn test_empty_result() {
    let ctx = request();
    let conn = people(&ctx, &[]);
    let rs = open_recordset(&ctx, &conn, "SELECT * FROM people");
    assert_eq!(rs.get("EOF"), Variant::Bool(true));
    assert_eq!(rs.get("BOF"), Variant::Bool(true));
    assert_eq!(rs.get("RecordCount"), Variant::Int(0));
    assert_eq!(rs.call_default(&[sql("name")]).unwrap(), Variant::Empty);
}

#[test]
fn test_sequential_navigation() {
    let ctx = request();
    let conn = people(&ctx, &ages());
    let rs = open_recordset(&ctx, &conn, "SELECT * FROM people ORDER BY id");

    rs.call("MoveFirst", &[]).unwrap();
    let mut visited = Vec::new();
    for _ in 0..3 {
        assert_eq!(rs.get("EOF"), Variant::Bool(false));
        visited.push(rs.call("Item", &[sql("name")]).unwrap().to_string());
        rs.call("MoveNext", &[]).unwrap();
    }
    assert_eq!(visited, vec!["ann", "bob", "cid"]);
    assert_eq!(rs.get("EOF"), Variant::Bool(true));
    assert_eq!(rs.get("BOF"), Variant::Bool(false));

    rs.call("MoveNext", &[]).unwrap();
    assert_eq!(rs.get("EOF"), Variant::Bool(true));
    rs.call("MovePrevious", &[]).unwrap();
    assert_eq!(rs.call_default(&[sql("NAME")]).unwrap(), Variant::from("cid"));
}

#[test]
fn test_filter_and_clear_keeps_buffer_order() {
    let ctx = request();
    let conn = people(&ctx, &ages());
    let rs = open_recordset(&ctx, &conn, "SELECT * FROM people ORDER BY id");

    rs.set("Filter", "age > 20").unwrap();
    assert_eq!(rs.get("RecordCount"), Variant::Int(2));
    assert_snapshot!(visit(&rs, "age").join(","), @"40,25");

    rs.set("Filter", "").unwrap();
    assert_eq!(rs.get("RecordCount"), Variant::Int(3));
    assert_snapshot!(visit(&rs, "age").join(","), @"10,40,25");

    rs.set("Filter", "name LIKE '%o%'").unwrap();
    assert_eq!(rs.get("RecordCount"), Variant::Int(1));
    rs.set("Filter", 0).unwrap();
    assert_eq!(rs.get("RecordCount"), Variant::Int(3));
}

#[test]
fn test_sort_descending() {
    let ctx = request();
    let conn = people(&ctx, &ages());
    let rs = open_recordset(&ctx, &conn, "SELECT * FROM people");

    rs.set("Sort", "age DESC").unwrap();
    assert_eq!(rs.get("Sort"), Variant::from("age DESC"));
    assert_snapshot!(visit(&rs, "age").join(","), @"40,25,10");

    rs.set("Filter", "age < 30").unwrap();
    assert_snapshot!(visit(&rs, "name").join(","), @"cid,ann");
}

#[test]
fn test_pagination() {
    let ctx = request();
    let rows = [("a", 1), ("b", 2), ("c", 3), ("d", 4), ("e", 5)];
    let conn = people(&ctx, &rows);
    let rs = open_recordset(&ctx, &conn, "SELECT * FROM people ORDER BY id");

    rs.set("PageSize", 2).unwrap();
    assert_eq!(rs.get("PageCount"), Variant::Int(3));
    rs.set("AbsolutePage", 2).unwrap();
    assert_eq!(rs.get("AbsolutePosition"), Variant::Int(3));
    assert_eq!(rs.get("AbsolutePage"), Variant::Int(2));
    assert_eq!(rs.call_default(&[sql("name")]).unwrap(), Variant::from("c"));

    rs.set("AbsolutePage", 7).unwrap();
    assert_eq!(rs.get("EOF"), Variant::Bool(true));
}

#[test]
fn test_pagination_with_largest_page_size() {
    let ctx = request();
    let conn = people(&ctx, &ages());
    let rs = open_recordset(&ctx, &conn, "SELECT * FROM people ORDER BY id");

    rs.set("PageSize", i64::MAX).unwrap();
    assert_eq!(rs.get("PageCount"), Variant::Int(1));
    assert_eq!(rs.get("AbsolutePage"), Variant::Int(1));
    rs.set("AbsolutePage", i64::MAX).unwrap();
    assert_eq!(rs.get("EOF"), Variant::Bool(true));
}

#[test]
fn test_find() {
    let ctx = request();
    let conn = people(&ctx, &ages());
    let rs = open_recordset(&ctx, &conn, "SELECT * FROM people ORDER BY id");

    rs.call("Find", &[sql("name = 'CID'")]).unwrap();
    assert_eq!(rs.call_default(&[sql("age")]).unwrap(), Variant::Int(25));
    rs.call("Find", &[sql("name = 'nobody'")]).unwrap();
    assert_eq!(rs.get("EOF"), Variant::Bool(true));
}

#[test]
fn test_get_rows() {
    let ctx = request();
    let conn = people(&ctx, &ages());
    let rs = open_recordset(&ctx, &conn, "SELECT name, age FROM people ORDER BY id");

    let Variant::Array(rows) = rs.call("GetRows", &[]).unwrap() else {
        panic!("expected array");
    };
    assert_eq!(rows.get_at(&[0, 1]), Some(Variant::from("bob")));
    assert_eq!(rows.get_at(&[1, 2]), Some(Variant::Int(25)));
    assert_eq!(rs.get("EOF"), Variant::Bool(true));
}

#[test]
fn test_insert_round_trip_is_written_through() {
    let ctx = request();
    let conn = people(&ctx, &ages());
    let rs = open_recordset(&ctx, &conn, "SELECT * FROM people");

    rs.call("AddNew", &[]).unwrap();
    rs.set("name", "dee").unwrap();
    let age = obj(rs.call("Fields", &[sql("age")]).unwrap());
    age.set("Value", 31).unwrap();
    rs.call("Update", &[]).unwrap();

    assert_eq!(rs.get("RecordCount"), Variant::Int(4));
    assert_eq!(rs.call_default(&[sql("name")]).unwrap(), Variant::from("dee"));
    assert_eq!(rs.call_default(&[sql("age")]).unwrap(), Variant::Int(31));
    assert_eq!(rs.call_default(&[sql("id")]).unwrap(), Variant::Int(4));

    let check = obj(conn
        .call("Execute", &[sql("SELECT age FROM people WHERE name = 'dee'")])
        .unwrap());
    assert_eq!(check.call_default(&[sql("age")]).unwrap(), Variant::Int(31));
}

#[test]
fn test_update_and_delete_are_written_through() {
    let ctx = request();
    let conn = people(&ctx, &ages());
    let rs = open_recordset(&ctx, &conn, "SELECT * FROM people ORDER BY id");

    rs.call("MoveNext", &[]).unwrap();
    rs.call("Update", &[sql("age"), Variant::Int(41)]).unwrap();
    rs.call("MoveNext", &[]).unwrap();
    rs.call("Delete", &[]).unwrap();
    assert_eq!(rs.get("RecordCount"), Variant::Int(2));

    let Variant::Object(errors) = conn.get("Errors") else {
        panic!("expected Errors object");
    };
    assert_eq!(errors.get("Count"), Variant::Int(0));

    let check = obj(conn
        .call("Execute", &[sql("SELECT name, age FROM people ORDER BY id")])
        .unwrap());
    let mut rows = Vec::new();
    while !check.get("EOF").to_bool() {
        rows.push(format!(
            "{}={}",
            check.call_default(&[sql("name")]).unwrap(),
            check.call_default(&[sql("age")]).unwrap()
        ));
        check.call("MoveNext", &[]).unwrap();
    }
    assert_snapshot!(rows.join(" "), @"ann=10 bob=41");
}

#[test]
fn test_write_through_without_id_touches_only_the_current_row() {
    let ctx = request();
    let conn = ctx.create_object("ADODB.Connection").unwrap();
    conn.call("Open", &[sql("embedded::memory:")]).unwrap();
    conn.call("Execute", &[sql("CREATE TABLE scores (name TEXT, age INTEGER)")])
        .unwrap();
    conn.call(
        "Execute",
        &[sql("INSERT INTO scores VALUES ('ann', 10), ('bob', 40), ('cid', 25), ('dee', 30)")],
    )
    .unwrap();

    let rs = open_recordset(
        &ctx,
        &conn,
        "SELECT name, age FROM scores WHERE age > 20 ORDER BY age",
    );
    assert_eq!(rs.call_default(&[sql("name")]).unwrap(), Variant::from("cid"));
    rs.call("Delete", &[]).unwrap();
    rs.call("MoveFirst", &[]).unwrap();
    assert_eq!(rs.call_default(&[sql("name")]).unwrap(), Variant::from("dee"));
    rs.call("Update", &[sql("age"), Variant::Int(31)]).unwrap();

    let check = obj(conn
        .call("Execute", &[sql("SELECT name, age FROM scores ORDER BY name")])
        .unwrap());
    let mut rows = Vec::new();
    while !check.get("EOF").to_bool() {
        rows.push(format!(
            "{}={}",
            check.call_default(&[sql("name")]).unwrap(),
            check.call_default(&[sql("age")]).unwrap()
        ));
        check.call("MoveNext", &[]).unwrap();
    }
    assert_snapshot!(rows.join(" "), @"ann=10 bob=40 dee=31");
}

#[test]
fn test_cancel_update_restores_row() {
    let ctx = request();
    let conn = people(&ctx, &ages());
    let rs = open_recordset(&ctx, &conn, "SELECT * FROM people ORDER BY id");

    rs.set("name", "changed").unwrap();
    assert_eq!(rs.get("EditMode"), Variant::Int(1));
    rs.call("CancelUpdate", &[]).unwrap();
    assert_eq!(rs.call_default(&[sql("name")]).unwrap(), Variant::from("ann"));
}

#[test]
fn test_fields_follow_the_cursor() {
    let ctx = request();
    let conn = people(&ctx, &ages());
    let rs = open_recordset(&ctx, &conn, "SELECT name, age FROM people ORDER BY id");

    let fields = obj(rs.get("Fields"));
    assert_eq!(fields.get("Count"), Variant::Int(2));
    let name = obj(fields.call_default(&[Variant::Int(0)]).unwrap());
    assert_eq!(name.get("Name"), Variant::from("name"));
    assert_eq!(name.get("Value"), Variant::from("ann"));

    rs.call("MoveLast", &[]).unwrap();
    assert_eq!(name.get("Value"), Variant::from("cid"));
}

#[test]
fn test_dispatch_is_case_insensitive() {
    let ctx = request();
    let conn = people(&ctx, &ages());
    let rs = open_recordset(&ctx, &conn, "select * from people");

    assert_eq!(rs.get("eof"), rs.get("EOF"));
    assert_eq!(rs.get("RecordCount"), rs.get("recordcount"));
    rs.call("MOVELAST", &[]).unwrap();
    assert_eq!(rs.call_default(&[sql("Name")]).unwrap(), Variant::from("cid"));
    assert_eq!(rs.get("NoSuchProperty"), Variant::Empty);
    assert_eq!(rs.call("NoSuchMethod", &[]).unwrap(), Variant::Empty);
}

#[test]
fn test_supports() {
    let ctx = request();
    let rs = ctx.create_object("ADODB.Recordset").unwrap();
    let supports = |option: i64| rs.call("Supports", &[Variant::Int(option)]).unwrap();
    assert_eq!(supports(0x0100_0400), Variant::Bool(true));
    assert_eq!(supports(0x0001_0000), Variant::Bool(false));
}

#[test]
fn test_open_with_descriptor_string() {
    let ctx = request();
    let rs = ctx.create_object("ADODB.Recordset").unwrap();
    rs.call("Open", &[sql("SELECT 1 AS one"), sql("embedded::memory:")])
        .unwrap();
    assert_eq!(rs.call_default(&[sql("one")]).unwrap(), Variant::Int(1));
    let conn = obj(rs.get("ActiveConnection"));
    assert_eq!(conn.get("State"), Variant::Int(1));

    rs.call("Close", &[]).unwrap();
    assert_eq!(rs.get("State"), Variant::Int(0));
    assert_eq!(conn.get("State"), Variant::Int(0));
}

#[test]
fn test_multi_dimensional_array_inner_mutation() {
    let arr = ArrayRef::dims(&[1, 3]);
    assert!(arr.set_at(&[0, 2], "hello".into()));
    assert!(arr.set_at(&[1, 3], "world".into()));
    assert_eq!(arr.get_at(&[0, 2]), Some(Variant::from("hello")));
    assert_eq!(arr.get_at(&[1, 3]), Some(Variant::from("world")));
    assert_eq!(arr.bounds(1), Some((0, 3)));
}
