use anyhow::{bail, Context};
use clap::Parser;
use classic_ado::ado::Recordset;
use classic_ado::{DataAccessConfig, Dispatch, Engine, Member, ObjectRef, RequestContext, Variant};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

#[derive(Parser)]
#[command(name = "adosh")]
#[command(about = "Run SQL through an ADO connection", long_about = None)]
struct Cli {
    /// Connection string, e.g. `embedded:shop.db` or `Driver={MySQL};Server=...`
    #[arg(name = "DESCRIPTOR")]
    descriptor: String,

    /// Run one statement and exit
    #[arg(short = 'e', long)]
    execute: Option<String>,

    /// Print rows as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let engine = Engine::new(DataAccessConfig::from_env());
    let ctx = RequestContext::new(engine);
    let conn = ctx
        .create_object("ADODB.Connection")
        .context("connection class is not registered")?;
    conn.call("Open", &[Variant::from(cli.descriptor.as_str())])?;
    if conn.get("State").to_int() != 1 {
        print_errors(&conn);
        bail!("could not open {}", cli.descriptor);
    }

    match cli.execute {
        Some(sql) => run_statement(&conn, &sql, cli.json)?,
        None => run_repl(&conn, cli.json)?,
    }

    conn.call("Close", &[])?;
    Ok(())
}

fn run_repl(conn: &ObjectRef, json: bool) -> anyhow::Result<()> {
    let mut rl = DefaultEditor::new()?;
    println!("Type 'exit' or 'quit' to quit");

    loop {
        match rl.readline("ado> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "exit" || line == "quit" {
                    break;
                }
                rl.add_history_entry(line)?;
                if let Err(e) = run_statement(conn, line, json) {
                    println!("Error: {e}");
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
    Ok(())
}

fn run_statement(conn: &ObjectRef, sql: &str, json: bool) -> anyhow::Result<()> {
    let result = conn.call("Execute", &[Variant::from(sql)])?;
    print_errors(conn);
    match result {
        Variant::Object(rs) => {
            let rs = rs
                .downcast::<Recordset>()
                .context("Execute returned a non-recordset object")?;
            print_recordset(&rs, json)?;
        }
        Variant::Int(n) => println!("{n} row(s) affected"),
        _ => {}
    }
    Ok(())
}

fn print_recordset(rs: &Recordset, json: bool) -> anyhow::Result<()> {
    let columns = rs.fields().names();
    let mut rows = Vec::new();
    while !rs.eof() {
        rows.push(rs.fields().values());
        rs.call_method(&Member::new("MoveNext"), &[])?;
    }

    if json {
        let objects: Vec<serde_json::Map<String, serde_json::Value>> = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .cloned()
                    .zip(row.iter().map(|v| serde_json::to_value(v).unwrap_or_default()))
                    .collect()
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&objects)?);
        return Ok(());
    }

    println!("{}", columns.join("\t"));
    for row in &rows {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        println!("{}", cells.join("\t"));
    }
    println!("({} row(s))", rows.len());
    Ok(())
}

fn print_errors(conn: &ObjectRef) {
    let Variant::Object(errors) = conn.get("Errors") else {
        return;
    };
    for error in errors.enumerate().unwrap_or_default() {
        if let Variant::Object(error) = error {
            println!("Error: {} ({})", error.get("Description"), error.get("Source"));
        }
    }
}
