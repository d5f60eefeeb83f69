use std::path::PathBuf;

use clap::{Parser, Subcommand};
use quarry_audit::{verify_log, AuditSink, PgAuditLog};
use quarry_core::{assemble, AuditSettings, Settings};
use quarry_policy::{PolicyEngine, Verdict};
use quarry_store::Database;
use quarry_types::QueryResponse;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quarry", about = "Ask your database questions in plain language")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a question: generate SQL, validate it, run it read-only.
    Ask {
        question: String,
        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run a SQL string through the admission checks without executing it.
    Validate { sql: String },
    /// Print the schema description handed to the model.
    Catalog,
    /// List accessible tables.
    Tables,
    /// Check database connectivity.
    Check,
    Audit {
        #[command(subcommand)]
        action: AuditCommand,
    },
}

#[derive(Subcommand)]
enum AuditCommand {
    Tail {
        #[arg(long, default_value_t = 10)]
        lines: usize,
    },
    /// Verify the hash chain of a JSON-lines audit file.
    Verify {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Create the `query_logs` table if missing.
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    match cli.command {
        Command::Ask { question, json } => {
            let assembly = assemble(&settings).await?;
            let response = assembly.assistant.ask(&question).await;
            assembly.database.close().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_response(&response);
            }
        }
        Command::Validate { sql } => match PolicyEngine::new(settings.policy.clone()).validate(&sql) {
            Verdict::Accepted(sql) => println!("accepted:\n{sql}"),
            Verdict::Rejected(reason) => {
                println!("rejected: {reason}");
                std::process::exit(1);
            }
        },
        Command::Catalog => {
            let assembly = assemble(&settings).await?;
            let description = assembly.assistant.describe_schema().await;
            assembly.database.close().await;
            println!("{}", description?.text);
        }
        Command::Tables => {
            let assembly = assemble(&settings).await?;
            let tables = assembly.assistant.catalog().table_names().await;
            assembly.database.close().await;
            for table in tables? {
                println!("{table}");
            }
        }
        Command::Check => {
            let database = Database::connect(&settings.database, settings.policy.statement_timeout).await?;
            database.ping().await?;
            database.close().await;
            println!("database ok");
        }
        Command::Audit { action } => match action {
            AuditCommand::Tail { lines } => {
                let sink = settings.audit_sink()?;
                for entry in sink.recent(lines).await? {
                    println!("{}", serde_json::to_string(&entry)?);
                }
            }
            AuditCommand::Verify { path } => {
                let path = match (path, &settings.audit) {
                    (Some(p), _) => p,
                    (None, AuditSettings::Jsonl(p)) => p.clone(),
                    (None, _) => PathBuf::from("./query_audit.jsonl"),
                };
                let count = verify_log(&path)?;
                println!("audit log ok ({count} records)");
            }
            AuditCommand::Init => {
                PgAuditLog::new(settings.database.connect_options()?)
                    .ensure_table()
                    .await?;
                println!("query_logs ready");
            }
        },
    }

    Ok(())
}

fn print_response(response: &QueryResponse) {
    if let Some(sql) = response.validated_sql.as_ref().or(response.generated_sql.as_ref()) {
        println!("SQL:\n{sql}\n");
    }
    if !response.success {
        println!("{}", response.error.as_deref().unwrap_or("Query failed."));
        return;
    }
    println!("{}", response.columns.join("\t"));
    for row in &response.rows {
        let cells: Vec<String> = row
            .iter()
            .map(|(_, v)| match serde_json::to_value(v) {
                Ok(serde_json::Value::String(s)) => s,
                Ok(other) => other.to_string(),
                Err(_) => String::new(),
            })
            .collect();
        println!("{}", cells.join("\t"));
    }
    println!(
        "\n{} row(s) in {:.2} ms",
        response.row_count,
        response.execution_time_ms.unwrap_or_default()
    );
}
