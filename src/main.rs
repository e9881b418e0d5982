use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use autograder::aggregator::Aggregator;
use autograder::config::{CliArgs, Config};
use autograder::database::{self as db, SqliteStore};
use autograder::evaluator::Evaluator;
use autograder::executor::Executor;
use autograder::sandbox::{SandboxAdapter, create_sandbox_runtime};
use autograder::scheduler::Scheduler;
use autograder::store::{ResultStore, SubmissionSource};
use autograder::web_server::build_server;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        sandbox: sandbox_config,
        pools: pool_configs,
        aggregator: aggregator_config,
        scheduler: scheduler_config,
    } = cli.to_config().context("Failed to load configuration")?;

    let db_path = db::get_db_path()?;
    if cli.flush_data {
        db::remove_db(&db_path);
    }
    let db_pool = db::init_db(&db_path)
        .await
        .context("Failed to initialize database")?;
    let store = Arc::new(SqliteStore::new(db_pool));

    let runtime = create_sandbox_runtime(&sandbox_config)?;
    let adapter = Arc::new(SandboxAdapter::new(runtime, &sandbox_config));
    match adapter.sweep_stale().await {
        Ok(0) => {}
        Ok(n) => log::warn!("Cleaned up {n} sandbox(es) left over by a previous run"),
        Err(e) => log::error!("Failed to sweep stale sandboxes: {e}"),
    }

    let executor = Arc::new(Executor::new(adapter.clone(), &sandbox_config));
    let evaluator = Arc::new(Evaluator::new(executor));
    let results: Arc<dyn ResultStore> = store.clone();
    let aggregator = Arc::new(Aggregator::new(results.clone(), &aggregator_config));
    let source: Arc<dyn SubmissionSource> = store;
    let shutdown_token = CancellationToken::new();

    let scheduler = Scheduler::new(
        &pool_configs,
        &scheduler_config,
        source,
        aggregator,
        evaluator,
        adapter.clone(),
        shutdown_token.clone(),
    );
    log::info!(
        "Sandbox backend {}, pools: {}",
        adapter.runtime_name(),
        scheduler.pool_names().join(", ")
    );

    // ======= PREPARATION END, EXECUTION START =======

    let mut workers = JoinSet::new();
    scheduler.spawn_workers(&mut workers);

    let server = build_server(server_config, scheduler, results).context("Failed to build server")?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Stop accepting requests
    server_handle.stop(true).await;

    // 2. Cancel running gradings and stop the workers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 3. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Worker finished with error: {e:?}"),
            Err(e) if e.is_panic() => log::error!("Worker handle panicked: {:?}", e),
            Err(e) => log::error!("Worker handle finished with error: {:?}", e),
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}
