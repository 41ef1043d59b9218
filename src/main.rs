//! conduit - manage database connections and run SQL against them.

mod cli;
mod output;

use std::future::Future;
use std::sync::Arc;

use cli::{Cli, Command};
use db_conduit::config::{Config, ConnectionSpec};
use db_conduit::connection::{ConnectionRecord, ConnectionRegistry};
use db_conduit::db::{DriverFactory, MockDriverFactory, PostgresDriverFactory, QueryResult};
use db_conduit::error::{ConduitError, Result};
use db_conduit::logging;
use db_conduit::persistence::{
    MemoryMetadataStore, MemorySecretStore, MetadataStore, SecretStorage, SecretStore, StateDb,
};
use db_conduit::query::{HistoryFilter, QueryExecutor, QueryHistory};
use output::{Output, OutputFormat};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    if cli.log_file {
        logging::init_file_logging();
    } else {
        logging::init_stderr_logging();
    }

    if let Err(e) = run(cli).await {
        error!("{}: {}", e.category(), e);
        std::process::exit(1);
    }
}

/// Everything a command needs, built once per invocation.
struct Session {
    registry: Arc<ConnectionRegistry>,
    executor: QueryExecutor,
    history: Arc<QueryHistory>,
    state_db: Option<Arc<StateDb>>,
    output: Output,
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let config = Config::load_from_file(&config_path)?;

    let session = open_session(&cli, &config).await?;
    let result = dispatch(&session, cli.command).await;

    session.registry.shutdown().await;
    if let Some(db) = &session.state_db {
        db.close().await;
    }

    result
}

async fn open_session(cli: &Cli, config: &Config) -> Result<Session> {
    let factory: Arc<dyn DriverFactory>;
    let metadata: Arc<dyn MetadataStore>;
    let secrets: Arc<dyn SecretStore>;
    let mut state_db = None;

    if cli.mock_db {
        info!("Using mock database with in-memory stores");
        factory = Arc::new(MockDriverFactory::new());
        metadata = Arc::new(MemoryMetadataStore::new());
        secrets = Arc::new(MemorySecretStore::new());
    } else {
        let db = match &cli.state_db {
            Some(path) => StateDb::open(path).await?,
            None => StateDb::open_default().await?,
        };
        debug!("State database at {}", db.path().display());
        let db = Arc::new(db);

        let keyring = SecretStorage::new();
        if !keyring.is_secure() {
            warn!("OS keyring unavailable; connections with passwords cannot be saved");
        }

        factory = Arc::new(PostgresDriverFactory::new());
        metadata = db.clone();
        secrets = Arc::new(keyring);
        state_db = Some(db);
    }

    let history = Arc::new(QueryHistory::new(
        metadata.clone(),
        config.execution.max_query_history_size,
    ));
    let registry = Arc::new(
        ConnectionRegistry::open(factory, metadata, secrets, &config.execution)
            .await?
            .with_history(history.clone()),
    );

    if cli.mock_db {
        seed_mock_connection(&registry).await?;
    }

    let executor = QueryExecutor::new(registry.clone(), &config.execution)
        .with_history(history.clone());

    Ok(Session {
        registry,
        executor,
        history,
        state_db,
        output: Output::new(OutputFormat::from_json_flag(cli.json)),
    })
}

/// The mock stores start empty on every run, so add an active connection
/// for query commands to land on.
async fn seed_mock_connection(registry: &ConnectionRegistry) -> Result<()> {
    let record = registry
        .add_connection(ConnectionSpec {
            name: "mock".to_string(),
            host: "mock".to_string(),
            port: db_conduit::config::DEFAULT_PORT,
            user: "mock".to_string(),
            password: None,
            default_schema: None,
        })
        .await?;
    registry.set_active_connection(&record.id).await
}

async fn dispatch(session: &Session, command: Command) -> Result<()> {
    let registry = &session.registry;
    let output = &session.output;

    match command {
        Command::Add {
            name,
            target,
            activate,
        } => {
            let spec = target.to_spec(&name)?;
            let record = registry.add_connection(spec).await?;
            if activate {
                registry.set_active_connection(&record.id).await?;
            }
            println!("{}", output.connection(&record, "Added connection"));
        }
        Command::Update {
            connection,
            name,
            target,
        } => {
            let record = resolve(registry, &connection).await?;
            let spec = target.to_updated_spec(&record, name.as_deref())?;
            let updated = registry.update_connection(&record.id, spec).await?;
            println!("{}", output.connection(&updated, "Updated connection"));
        }
        Command::Rename {
            connection,
            new_name,
        } => {
            let record = resolve(registry, &connection).await?;
            let renamed = registry.rename_connection(&record.id, &new_name).await?;
            println!("{}", output.connection(&renamed, "Renamed connection"));
        }
        Command::Remove { connection } => {
            let record = resolve(registry, &connection).await?;
            registry.remove_connection(&record.id).await?;
            println!(
                "{}",
                output.message(&format!("Removed connection '{}'", record.name))
            );
        }
        Command::Use { connection } => {
            let record = resolve(registry, &connection).await?;
            registry.set_active_connection(&record.id).await?;
            println!(
                "{}",
                output.message(&format!("Active connection is now '{}'", record.name))
            );
        }
        Command::List => {
            let records = registry.connections().await;
            let active = registry.active_connection_id().await;
            println!("{}", output.connections(&records, active.as_deref()));
        }
        Command::Query { sql } => {
            let result =
                with_interrupts(&session.executor, session.executor.execute(&sql, None)).await?;
            println!("{}", output.query_result(&result));
        }
        Command::Fetch { sql, limit } => {
            let result = with_interrupts(
                &session.executor,
                session.executor.execute_and_fetch(&sql, limit),
            )
            .await?;
            println!("{}", output.query_result(&result));
        }
        Command::History { limit, search, all } => {
            let connection_id = if all {
                None
            } else {
                registry.active_connection_id().await
            };
            let entries = session
                .history
                .list(&HistoryFilter {
                    connection_id,
                    text_search: search,
                    limit: Some(limit),
                })
                .await?;
            println!("{}", output.history(&entries));
        }
    }

    Ok(())
}

/// Finds a saved connection by id or name.
async fn resolve(registry: &ConnectionRegistry, id_or_name: &str) -> Result<ConnectionRecord> {
    registry
        .find_connection(id_or_name)
        .await
        .ok_or_else(|| ConduitError::unknown_connection(id_or_name))
}

/// Drives a query while watching for Ctrl-C and the advisory timeout.
///
/// Either one cancels the in-flight call; the query future is then awaited
/// so it can observe the token and report the cancellation.
async fn with_interrupts(
    executor: &QueryExecutor,
    query: impl Future<Output = Result<QueryResult>>,
) -> Result<QueryResult> {
    tokio::pin!(query);

    // The first poll of `query` registers its token, so poll it first.
    tokio::select! {
        biased;
        result = &mut query => return result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; cancelling query");
        }
        _ = tokio::time::sleep(executor.query_timeout()) => {
            warn!(
                "Query exceeded {}s; cancelling",
                executor.query_timeout().as_secs()
            );
        }
    }

    executor.cancel_current_query();
    query.await
}
