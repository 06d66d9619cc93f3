use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;
use wheel_core::{GameError, Segment, Wheel};

pub mod config;
pub mod rest;
pub mod spinner;
pub mod store;

use config::{Config, StoreConfig};
use rest::RestStore;
use spinner::{ClientView, Spinner, SpinnerError, DEFAULT_REVEAL_DELAY};
use store::{MemoryStore, SessionStore};

#[derive(Clone)]
pub struct AppState {
    clients: Arc<RwLock<HashMap<String, Arc<Spinner>>>>,
    store: Arc<dyn SessionStore>,
    wheel: Wheel,
    reveal_delay: Duration,
    seed: Option<u64>,
    opened: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            store,
            wheel: Wheel::default(),
            reveal_delay: DEFAULT_REVEAL_DELAY,
            seed: None,
            opened: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn from_config(config: &Config, store: Arc<dyn SessionStore>) -> Self {
        let mut state = Self::new(store)
            .with_wheel(config.wheel.clone())
            .with_reveal_delay(config.reveal_delay);
        state.seed = config.spin_seed;
        state
    }

    pub fn with_wheel(mut self, wheel: Wheel) -> Self {
        self.wheel = wheel;
        self
    }

    pub fn with_reveal_delay(mut self, delay: Duration) -> Self {
        self.reveal_delay = delay;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn next_rng(&self) -> ChaCha8Rng {
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed.wrapping_add(n)),
            None => ChaCha8Rng::from_entropy(),
        }
    }

    async fn client(&self, id: &str) -> Option<Arc<Spinner>> {
        let spinner = self.clients.read().await.get(id).cloned()?;
        spinner.touch();
        Some(spinner)
    }

    /// Drops clients untouched for `max_idle`. Queued saves still drain.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut clients = self.clients.write().await;
        let before = clients.len();
        clients.retain(|_, spinner| spinner.idle_for() < max_idle);
        before - clients.len()
    }

    pub fn spawn_sweeper(&self, max_idle: Duration) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval((max_idle / 4).max(Duration::from_secs(1)));
            loop {
                ticker.tick().await;
                let evicted = state.evict_idle(max_idle).await;
                if evicted > 0 {
                    debug!(evicted, "idle clients dropped");
                }
            }
        })
    }
}

pub async fn open_store(config: &StoreConfig) -> Arc<dyn SessionStore> {
    match config {
        StoreConfig::Memory {
            persist_path: Some(path),
        } => {
            info!(path = %path.display(), "using file-backed session store");
            Arc::new(MemoryStore::with_persistence(path.clone()).await)
        }
        StoreConfig::Memory { persist_path: None } => {
            info!("using in-memory session store");
            Arc::new(MemoryStore::default())
        }
        StoreConfig::Rest {
            url,
            api_key,
            table,
        } => {
            info!(%url, %table, "using remote session store");
            Arc::new(RestStore::new(url.clone(), api_key.clone(), table.clone()))
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/wheel", get(get_wheel))
        .route("/client", post(open_client))
        .route("/client/:id", get(get_client).delete(close_client))
        .route("/client/:id/email", post(submit_email))
        .route("/client/:id/spin", post(spin))
        .route("/client/:id/reset", post(reset))
        .route("/client/:id/change-user", post(change_user))
        .with_state(state)
}

#[derive(Serialize)]
struct WheelView {
    segments: Vec<Segment>,
    total: usize,
}

#[derive(Serialize)]
struct OpenClientResponse {
    client_id: String,
}

#[derive(Serialize)]
struct ClientResponse {
    id: String,
    #[serde(flatten)]
    view: ClientView,
}

#[derive(Deserialize)]
struct EmailRequest {
    email: String,
}

fn error_response(err: SpinnerError) -> Response {
    let status = match &err {
        SpinnerError::Game(GameError::InvalidEmail) => StatusCode::BAD_REQUEST,
        SpinnerError::Game(_) => StatusCode::CONFLICT,
        SpinnerError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        SpinnerError::Interrupted(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

fn unknown_client() -> Response {
    (StatusCode::NOT_FOUND, "client not found").into_response()
}

fn client_response(id: String, result: Result<ClientView, SpinnerError>) -> Response {
    match result {
        Ok(view) => (StatusCode::OK, Json(ClientResponse { id, view })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_wheel(State(state): State<AppState>) -> impl IntoResponse {
    Json(WheelView {
        segments: state.wheel.segments().to_vec(),
        total: state.wheel.len(),
    })
}

async fn open_client(State(state): State<AppState>) -> impl IntoResponse {
    let client_id = Uuid::new_v4().to_string();
    let spinner = Spinner::new(
        state.store.clone(),
        state.wheel.clone(),
        state.next_rng(),
        state.reveal_delay,
    );
    state
        .clients
        .write()
        .await
        .insert(client_id.clone(), Arc::new(spinner));

    (StatusCode::CREATED, Json(OpenClientResponse { client_id }))
}

async fn get_client(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(spinner) = state.client(&id).await else {
        return unknown_client();
    };
    let view = spinner.view().await;
    client_response(id, Ok(view))
}

async fn close_client(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(spinner) = state.clients.write().await.remove(&id) else {
        return unknown_client();
    };
    spinner.flush().await;
    StatusCode::NO_CONTENT.into_response()
}

async fn submit_email(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<EmailRequest>,
) -> Response {
    let Some(spinner) = state.client(&id).await else {
        return unknown_client();
    };
    let result = spinner.submit_email(&payload.email).await;
    client_response(id, result)
}

async fn spin(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(spinner) = state.client(&id).await else {
        return unknown_client();
    };
    match spinner.spin().await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn reset(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(spinner) = state.client(&id).await else {
        return unknown_client();
    };
    let result = spinner.reset().await;
    client_response(id, result)
}

async fn change_user(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(spinner) = state.client(&id).await else {
        return unknown_client();
    };
    let result = spinner.change_user().await;
    client_response(id, result)
}
