use clap::{Parser, Subcommand};
use serde_json::Value;
use statebridge::{sdk, BackendKind, Context, DeleteRequest, Query, SetRequest};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "data")]
    data_dir: String,

    #[arg(short, long, env = "STATEBRIDGE_BACKEND", default_value = "wide-column")]
    backend: BackendKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    Get { key: String },
    Set {
        key: String,
        value: String,
        #[arg(long)]
        etag: Option<String>,
    },
    Del {
        key: String,
        #[arg(long)]
        etag: Option<String>,
    },
    BulkGet { keys: Vec<String> },
    /// Runs a query document (JSON) against the store.
    Query { document: String },
    Features,
    Ping,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let store = sdk::new(cli.backend, &cli.data_dir).await?;
    let ctx = Context::background();

    match cli.command {
        Commands::Get { key } => match store.get(&ctx, &key).await? {
            Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
            None => println!("(not found)"),
        },
        Commands::Set { key, value, etag } => {
            let value: Value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            store.set(&ctx, SetRequest { key, value, etag }).await?;
            println!("OK");
        }
        Commands::Del { key, etag } => {
            store.delete(&ctx, DeleteRequest { key, etag }).await?;
            println!("OK");
        }
        Commands::BulkGet { keys } => {
            let items = store.bulk_get(&ctx, keys).await?;
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        Commands::Query { document } => {
            let query: Query = serde_json::from_str(&document)?;
            let res = store.query(&ctx, query).await?;
            println!("{}", serde_json::to_string_pretty(&res)?);
        }
        Commands::Features => {
            let features = store.features().await?;
            println!("{}", serde_json::to_string_pretty(&features.names())?);
        }
        Commands::Ping => {
            store.ping(&ctx).await?;
            println!("PONG");
        }
    }

    Ok(())
}
