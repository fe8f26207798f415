use std::{process, sync::Arc};

use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use vellum::{
    application::error::AppError,
    cache::{CacheConfig, EntityType, OperationKind},
    config,
    content::DirectusClient,
    infra::{
        cache::ContentCache,
        error::InfraError,
        http::{self, OpsState},
        telemetry,
    },
};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Query(args) => run_query(settings, args).await,
        config::Command::Warm(_) => run_warm(settings).await,
    }
}

fn build_cache(settings: &config::Settings) -> Result<Arc<ContentCache>, AppError> {
    let source = DirectusClient::new(&settings.content)?;
    let cache_config = CacheConfig::from(&settings.cache);
    Ok(Arc::new(ContentCache::in_process(
        &cache_config,
        Arc::new(source),
    )))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache = build_cache(&settings)?;

    let report = cache.manager().warm_critical_caches().await;
    if !report.failed.is_empty() {
        warn!(failed = ?report.failed, "startup warm incomplete");
    }

    let router = http::build_router(OpsState::new(cache));
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;
    info!(addr = %settings.server.addr, "listening");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    tokio::select! {
        joined = &mut server => return server_outcome(joined),
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(InfraError::from)?;
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(());
    match tokio::time::timeout(settings.server.graceful_shutdown, server).await {
        Ok(joined) => server_outcome(joined),
        Err(_) => {
            warn!(
                timeout_secs = settings.server.graceful_shutdown.as_secs(),
                "graceful shutdown timed out"
            );
            Ok(())
        }
    }
}

fn server_outcome(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(result) => result.map_err(|err| AppError::from(InfraError::from(err))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

async fn run_query(settings: config::Settings, args: config::QueryArgs) -> Result<(), AppError> {
    let entity: EntityType = args
        .entity
        .parse()
        .map_err(|err| AppError::validation(format!("entity: {err}")))?;
    let kind: OperationKind = args
        .kind
        .parse()
        .map_err(|err| AppError::validation(format!("kind: {err}")))?;
    let query_args: Value = serde_json::from_str(&args.args)
        .map_err(|err| AppError::validation(format!("--args is not valid JSON: {err}")))?;

    let cache = build_cache(&settings)?;
    let result = cache.cached_query(entity, kind, query_args).await?;

    print_json(&result)
}

async fn run_warm(settings: config::Settings) -> Result<(), AppError> {
    let cache = build_cache(&settings)?;
    let report = cache.manager().warm_critical_caches().await;
    let stats = cache.manager().get_cache_stats();

    print_json(&json!({ "report": report, "stats": stats }))?;

    if report.failed.is_empty() {
        Ok(())
    } else {
        Err(AppError::unexpected(format!(
            "failed to warm: {}",
            report.failed.join(", ")
        )))
    }
}

fn print_json(value: &Value) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render JSON: {err}")))?;
    println!("{rendered}");
    Ok(())
}
