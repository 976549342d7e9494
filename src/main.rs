use std::{sync::Arc, time::Duration};

use anyhow::Context;
use http::HeaderValue;
use tokio::{
    signal,
    sync::{mpsc, watch},
};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use checkout_engine as api;
use api::integrations::{PaymentGateway, RazorpayClient, ShiprocketClient};
use api::services::expiry_sweeper::ExpirySweeper;
use api::services::shipments::ShipmentDispatcher;

const SHIPMENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);
    api::handlers::health::init_start_time();

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(api::events::EventSender::new(event_tx));
    let events_task = tokio::spawn(api::events::process_events(event_rx));

    // External collaborators
    let gateway: Arc<dyn PaymentGateway> = Arc::new(
        RazorpayClient::new(&cfg.razorpay).context("failed to build payment gateway client")?,
    );
    if cfg.razorpay.webhook_secret.is_none() {
        warn!("Razorpay webhook secret not configured; webhook signatures are not verified");
    }

    let (shipments, shipment_worker) = if cfg.shiprocket.is_configured() {
        let tokens = Arc::new(api::cache::TokenCache::new(cfg.shiprocket.token_ttl()));
        let carrier = ShiprocketClient::new(&cfg.shiprocket, tokens)
            .context("failed to build carrier client")?;
        let (dispatcher, handle) = ShipmentDispatcher::spawn(
            Arc::new(carrier),
            db_arc.clone(),
            event_sender.clone(),
            cfg.shiprocket.queue_capacity,
        );
        (dispatcher, Some(handle))
    } else {
        info!("Shiprocket credentials not configured; shipment dispatch disabled");
        (ShipmentDispatcher::disabled(), None)
    };

    // Aggregate app services used by HTTP handlers
    let services = api::handlers::AppServices::new(
        db_arc.clone(),
        event_sender.clone(),
        gateway,
        shipments,
        cfg.checkout.clone(),
    );

    // Background expiry sweeper
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = ExpirySweeper::new(
        db_arc.clone(),
        services.checkout.clone(),
        cfg.checkout.clone(),
    )
    .spawn(shutdown_rx);

    let app_state = api::AppState {
        db: db_arc.clone(),
        config: cfg.clone(),
        services,
    };

    // Build CORS layer from config
    let origins: Vec<HeaderValue> = cfg
        .cors_origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    let cors_layer = if !origins.is_empty() {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if cfg.is_development() {
        info!("Using permissive CORS in development");
        CorsLayer::permissive()
    } else {
        warn!("No CORS origins configured; cross-origin requests will be rejected");
        CorsLayer::new()
    };

    let app = api::app_router(app_state)
        .layer(TraceLayer::new_for_http().make_span_with(api::middleware_helpers::RequestSpanMaker))
        .layer(TimeoutLayer::new(cfg.request_timeout()))
        .layer(cors_layer)
        // Ensure every request carries a request id for traceability
        .layer(axum::middleware::from_fn(
            api::middleware_helpers::request_id_middleware,
        ));

    // Bind and serve
    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("checkout-engine listening on http://{}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped; draining background tasks");
    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        error!(error = %e, "Expiry sweeper task failed");
    }
    // The worker exits once the router, and with it every dispatcher handle, is dropped.
    if let Some(worker) = shipment_worker {
        if tokio::time::timeout(SHIPMENT_DRAIN_TIMEOUT, worker).await.is_err() {
            warn!("Shipment worker did not drain in time");
        }
    }
    events_task.abort();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
