pub use controller::*;
use tracing_subscriber::{EnvFilter, Registry, prelude::*};

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, Responder, get, middleware,
    web::Data,
};
use controller::config::OperatorConfig;

#[get("/metrics")]
async fn metrics(c: Data<Manager>, _req: HttpRequest) -> impl Responder {
    match c.metrics() {
        Ok(metrics) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(metrics),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<Manager>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing layers
    #[cfg(feature = "telemetry")]
    let telemetry = tracing_opentelemetry::layer().with_tracer(telemetry::init_tracer()?);
    let logger = tracing_subscriber::fmt::layer();
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| Error::Other(format!("invalid log filter: {e}")))?;

    // Decide on layers
    #[cfg(feature = "telemetry")]
    let collector = Registry::default().with(telemetry).with(logger).with(env_filter);
    #[cfg(not(feature = "telemetry"))]
    let collector = Registry::default().with(logger).with(env_filter);

    // Initialize tracing
    tracing::subscriber::set_global_default(collector)
        .map_err(|e| Error::Other(format!("tracing setup failed: {e}")))?;

    let config = OperatorConfig::from_env();
    tracing::info!("Starting with {config:?}");
    // Start kubernetes controller
    let (manager, controller) = Manager::new(config).await?;

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(manager.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind("0.0.0.0:9000")
    .map_err(|e| Error::Other(format!("Can not bind to 0.0.0.0:9000: {e}")))?
    .shutdown_timeout(5);

    tokio::select! {
        _ = controller => tracing::warn!("MqttCluster controller exited"),
        _ = server.run() => tracing::info!("actix exited"),
    }
    Ok(())
}
