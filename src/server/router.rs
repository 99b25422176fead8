use std::sync::Arc;

use axum::Router;
use axum::http::{Method, header};
use axum::routing::{get, post};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use super::ApiError;
use super::handlers;
use crate::config::{ApiVariant, ServerConfig};
use crate::manager::GenerationManager;
use crate::pipeline::GenerationParams;
use crate::storage::{IMAGES_ROUTE, ImageStore};

/// What the generation routes need: the worker and the output directory.
#[derive(Clone)]
pub struct Backend {
    pub manager: GenerationManager,
    pub store: ImageStore,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Sampling settings applied to every request; only the prompts vary.
    pub defaults: GenerationParams,
    pub backend: Option<Backend>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            defaults: GenerationParams::default(),
            backend: None,
        }
    }

    pub fn with_defaults(mut self, defaults: GenerationParams) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub(crate) fn backend(&self) -> Result<&Backend, ApiError> {
        self.backend
            .as_ref()
            .ok_or_else(|| ApiError::internal("image generation backend is not configured"))
    }

    pub(crate) fn params_for(&self, prompt: String, negative_prompt: Option<String>) -> GenerationParams {
        GenerationParams {
            prompt,
            negative_prompt,
            ..self.defaults.clone()
        }
    }
}

pub struct RouterBuilder {
    state: Option<AppState>,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self { state: None }
    }

    pub fn with_state(mut self, state: AppState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn build(self) -> crate::Result<Router> {
        let state = self
            .state
            .ok_or_else(|| crate::Error::Config("state must be set".to_string()))?;
        state.config.validate()?;

        let cors_layer = match &state.config.allowed_origins {
            Some(origins) => {
                let parsed: Result<Vec<_>, _> = origins.iter().map(|o| o.parse()).collect();
                let origins = parsed.map_err(|_| {
                    crate::Error::Config(format!("invalid allowed origin in {origins:?}"))
                })?;
                CorsLayer::new()
                    .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                    .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::CACHE_CONTROL])
                    .allow_origin(AllowOrigin::list(origins))
            }
            // Any origin, credentials allowed.
            None => CorsLayer::very_permissive(),
        };

        let router = Router::new()
            .route("/favicon.ico", get(handlers::favicon))
            .route("/health", get(handlers::health));

        let router = match state.config.variant {
            ApiVariant::Old => {
                router.route("/api/recognize", post(handlers::recognize_strict))
            }
            ApiVariant::New => {
                let images_dir = state
                    .backend
                    .as_ref()
                    .map(|backend| backend.store.dir().to_path_buf())
                    .ok_or_else(|| {
                        crate::Error::Config(
                            "the image generation API needs a generation backend".to_string(),
                        )
                    })?;
                router
                    .route("/api/recognize", post(handlers::recognize))
                    .route("/api/generate", post(handlers::generate))
                    .route("/api/generate-stream", get(handlers::generate_stream))
                    .nest_service(IMAGES_ROUTE, ServeDir::new(images_dir))
            }
        };

        tracing::info!(variant = ?state.config.variant, "router built");
        Ok(router
            .layer(cors_layer)
            .layer(TraceLayer::new_for_http())
            .with_state(state))
    }
}
