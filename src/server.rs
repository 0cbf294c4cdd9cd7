//! # Server Configuration
//!
//! Router assembly, OpenAPI document and the serving loop with graceful
//! shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::handlers::{self, branches, sinks, sources, stream};
use crate::kv::{KvError, KvStore};
use crate::repositories::DefinitionRepository;
use crate::sink::{PipelineOpener, PipelineRegistry, Router as SinkRouter};
use crate::source::Dispatcher;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub clock: Arc<dyn Clock>,
    pub repository: Arc<DefinitionRepository>,
    pub dispatcher: Arc<Dispatcher>,
    /// Sink types accepted by the definition API
    pub pipelines: Arc<PipelineRegistry>,
}

impl AppState {
    /// Starts the sink router and the source dispatcher over `kv` with the
    /// built-in sink types.
    pub async fn start(config: Arc<AppConfig>, kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Result<Self, KvError> {
        let pipelines = PipelineRegistry::with_builtins(&config.file_sink_dir);
        Self::start_with_pipelines(config, kv, clock, pipelines).await
    }

    pub async fn start_with_pipelines(
        config: Arc<AppConfig>,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        pipelines: PipelineRegistry,
    ) -> Result<Self, KvError> {
        let pipelines = Arc::new(pipelines);
        let opener: Arc<dyn PipelineOpener> = Arc::clone(&pipelines) as Arc<dyn PipelineOpener>;
        let router = SinkRouter::start(Arc::clone(&kv), opener, Arc::clone(&clock)).await?;
        let dispatcher = Dispatcher::start(Arc::clone(&kv), router).await?;
        let repository = Arc::new(DefinitionRepository::new(
            kv,
            &config.limits,
            config.kv.max_atomic_attempts,
        ));

        Ok(Self {
            config,
            clock,
            repository,
            dispatcher,
            pipelines,
        })
    }

    /// Stops accepting records, drains in-flight dispatches and closes all
    /// sink pipelines.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        self.dispatcher.router().shutdown().await;
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let stream_routes = Router::new()
        .route(
            "/stream/{projectId}/{sourceId}/{secret}",
            post(stream::stream_post).options(stream::stream_options),
        )
        .layer(DefaultBodyLimit::max(state.config.max_body_size))
        .layer(CorsLayer::permissive());

    let source = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}";
    let sink = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/sinks/{sinkId}";
    let definition_routes = Router::new()
        .route(
            "/v1/projects/{projectId}/branches",
            get(branches::list_branches).post(branches::create_branch),
        )
        .route("/v1/projects/{projectId}/branches/default", get(branches::get_default_branch))
        .route(
            "/v1/projects/{projectId}/branches/{branchId}",
            get(branches::get_branch).delete(branches::delete_branch),
        )
        .route("/v1/projects/{projectId}/branches/{branchId}/undelete", post(branches::undelete_branch))
        .route(
            "/v1/projects/{projectId}/branches/{branchId}/versions",
            get(branches::list_branch_versions),
        )
        .route(
            "/v1/projects/{projectId}/branches/{branchId}/versions/{number}",
            get(branches::get_branch_version),
        )
        .route(
            "/v1/projects/{projectId}/branches/{branchId}/versions/{number}/rollback",
            post(branches::rollback_branch),
        )
        .route(
            "/v1/projects/{projectId}/branches/{branchId}/sources",
            get(sources::list_sources).post(sources::create_source),
        )
        .route(
            source,
            get(sources::get_source)
                .patch(sources::update_source)
                .delete(sources::delete_source),
        )
        .route(&format!("{source}/undelete"), post(sources::undelete_source))
        .route(&format!("{source}/enable"), post(sources::enable_source))
        .route(&format!("{source}/disable"), post(sources::disable_source))
        .route(&format!("{source}/versions"), get(sources::list_source_versions))
        .route(&format!("{source}/versions/{{number}}"), get(sources::get_source_version))
        .route(&format!("{source}/versions/{{number}}/rollback"), post(sources::rollback_source))
        .route(&format!("{source}/sinks"), get(sinks::list_sinks).post(sinks::create_sink))
        .route(
            sink,
            get(sinks::get_sink).patch(sinks::update_sink).delete(sinks::delete_sink),
        )
        .route(&format!("{sink}/undelete"), post(sinks::undelete_sink))
        .route(&format!("{sink}/enable"), post(sinks::enable_sink))
        .route(&format!("{sink}/disable"), post(sinks::disable_sink))
        .route(&format!("{sink}/versions"), get(sinks::list_sink_versions))
        .route(&format!("{sink}/versions/{{number}}"), get(sinks::get_sink_version))
        .route(&format!("{sink}/versions/{{number}}/rollback"), post(sinks::rollback_sink))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/health-check", get(handlers::health_check))
        .merge(stream_routes)
        .merge(definition_routes)
        .fallback(handlers::route_not_found)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
}

/// Serves the app until `shutdown` resolves, then drains in-flight requests
/// for at most the configured shutdown timeout.
pub async fn run_server<F>(state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let config = Arc::clone(&state.config);
    let addr = config.bind_addr().context("Invalid server address")?;
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    tracing::info!(%addr, profile = %config.profile, "server listening");

    let (drain_tx, drain_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown.await;
            let _ = drain_tx.send(());
        });
    let mut server = tokio::spawn(async move { server.await });

    // Bounded drain: the timeout starts when shutdown is requested.
    tokio::select! {
        joined = &mut server => return joined.context("server task failed")?.context("server error"),
        _ = drain_rx => {}
    }
    match tokio::time::timeout(config.shutdown_timeout(), &mut server).await {
        Ok(joined) => joined.context("server task failed")?.context("server error"),
        Err(_) => {
            server.abort();
            anyhow::bail!(
                "graceful shutdown did not finish within {}s",
                config.shutdown_timeout().as_secs()
            )
        }
    }
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::root,
        handlers::health_check,
        stream::stream_options,
        stream::stream_post,
        branches::list_branches,
        branches::create_branch,
        branches::get_default_branch,
        branches::get_branch,
        branches::delete_branch,
        branches::undelete_branch,
        branches::list_branch_versions,
        branches::get_branch_version,
        branches::rollback_branch,
        sources::list_sources,
        sources::create_source,
        sources::get_source,
        sources::update_source,
        sources::delete_source,
        sources::undelete_source,
        sources::enable_source,
        sources::disable_source,
        sources::list_source_versions,
        sources::get_source_version,
        sources::rollback_source,
        sinks::list_sinks,
        sinks::create_sink,
        sinks::get_sink,
        sinks::update_sink,
        sinks::delete_sink,
        sinks::undelete_sink,
        sinks::enable_sink,
        sinks::disable_sink,
        sinks::list_sink_versions,
        sinks::get_sink_version,
        sinks::rollback_sink,
    ),
    components(
        schemas(
            handlers::ServiceInfo,
            crate::error::ApiError,
            crate::sink::SourcesResult,
            crate::sink::SourceResult,
            crate::sink::SinkResult,
            crate::definition::Branch,
            crate::definition::Source,
            crate::definition::Sink,
            handlers::types::CreateBranchRequest,
            handlers::types::CreateSourceRequest,
            handlers::types::UpdateSourceRequest,
            handlers::types::CreateSinkRequest,
            handlers::types::UpdateSinkRequest,
            handlers::types::DisableRequest,
        )
    ),
    modifiers(&SecurityAddon),
    info(
        title = "Stream Ingest API",
        description = "HTTP event ingestion with branch, source and sink definitions",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
