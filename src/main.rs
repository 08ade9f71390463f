//! DB Pool Probe - Main entry point.
//!
//! Builds a connection manager from a database URL (plus optional read replicas),
//! checks connections out concurrently, runs a transaction/savepoint smoke check
//! and prints the resulting pool statistics.

use db_pool_core::config::Config;
use db_pool_core::db::{ConnectionManager, PoolStats, SqlxAdapter};
use db_pool_core::models::{AcquireOptions, TransactionOptions};
use db_pool_core::{DbError, DbResult};
use futures_util::future::try_join_all;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

/// Check out `concurrency` connections at once, ping each, then hand them back.
async fn probe_connections(
    manager: &ConnectionManager<SqlxAdapter>,
    concurrency: usize,
) -> DbResult<()> {
    let acquisitions = (0..concurrency).map(|i| {
        let options = if i % 2 == 0 {
            AcquireOptions::read()
        } else {
            AcquireOptions::write()
        };
        manager.get_connection(options)
    });
    let connections = try_join_all(acquisitions).await?;

    for connection in &connections {
        manager.execute(connection, "SELECT 1").await?;
        info!(
            connection_id = connection.id(),
            role = %connection.role(),
            db_target = %connection.target(),
            "Connection checked out"
        );
    }

    for connection in &connections {
        manager.release_connection(connection).await?;
    }
    Ok(())
}

/// BEGIN, SAVEPOINT, RELEASE and COMMIT on one connection.
async fn probe_transaction(manager: &ConnectionManager<SqlxAdapter>) -> DbResult<()> {
    manager
        .run_in_transaction(TransactionOptions::default(), |transaction| async move {
            transaction.execute("SELECT 1").await?;

            let savepoint = transaction.savepoint(TransactionOptions::default()).await?;
            savepoint.execute("SELECT 1").await?;
            savepoint.commit().await?;

            info!(
                transaction_id = %transaction.id(),
                savepoint = %savepoint.name(),
                "Transaction smoke check passed"
            );
            Ok::<(), DbError>(())
        })
        .await
}

fn print_stats(stats: &[PoolStats], json: bool) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }

    for pool in stats {
        println!(
            "{:<8} size={} available={} using={} waiting={} max={} created={} destroyed={} timed_out={}",
            pool.role,
            pool.size,
            pool.available,
            pool.using,
            pool.waiting,
            pool.max,
            pool.created,
            pool.destroyed,
            pool.timed_out
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    let options = config.manager_options()?;
    info!(
        dialect = %options.dialect(),
        db_target = %options.connection.display_target(),
        read_replicas = options.read_targets().len(),
        "Starting DB Pool Probe v{}",
        env!("CARGO_PKG_VERSION")
    );

    let adapter = SqlxAdapter::new(options.dialect())?;
    let manager = ConnectionManager::new(adapter, options)?;

    let probes = async {
        probe_connections(&manager, config.concurrency.max(1)).await?;
        if !config.skip_transaction {
            probe_transaction(&manager).await?;
        }
        Ok::<(), DbError>(())
    };
    let result: DbResult<()> = tokio::select! {
        result = probes => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, closing connection pools");
            manager.close().await;
            return Ok(());
        }
    };

    if let Some(version) = manager.database_version() {
        info!(version = %version, "Server version");
    }
    print_stats(&manager.stats(), config.json)?;
    manager.close().await;

    if let Err(e) = result {
        error!(error = %e, suggestion = e.suggestion().unwrap_or(""), "Probe failed");
        return Err(e.into());
    }

    info!("Probe complete");
    Ok(())
}
