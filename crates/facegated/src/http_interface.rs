use crate::api_error::ApiError;
use crate::config::Config;
use crate::engine::{EngineHandle, RegistrationImage};
use crate::rate_limiter::{Attempt, RateLimiter};
use crate::reference::{validate_url, StoredReference};
use crate::store::{AccountStore, NewAccount};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use facegate_core::{MatchVerdict, BURST_SIZE};
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: EngineHandle,
    pub store: AccountStore,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl AppState {
    pub fn new(config: Config, engine: EngineHandle, store: AccountStore) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            store,
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new())),
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + Duration::from_secs(self.config.verify_timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterPayload {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub encoded_facial_image: Option<String>,
    #[serde(default)]
    pub facial_image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyPayload {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub frames: Vec<String>,
}

/// Returned on successful verification.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccountProfile {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
            Method::PATCH,
        ])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .route("/register", post(handle_register))
        .route("/verify", post(handle_verify))
        .route("/status", get(handle_status))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn handle_register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterPayload>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) =
        payload.map_err(|_| ApiError::BadRequest("Invalid request payload".into()))?;

    if payload.email.is_empty() || payload.first_name.is_empty() || payload.last_name.is_empty() {
        return Err(ApiError::BadRequest("All fields are required".into()));
    }
    // exactly one of the two image fields
    let encoded = non_empty(payload.encoded_facial_image);
    let image = match (encoded, non_empty(payload.facial_image_url)) {
        (Some(encoded), None) => {
            RegistrationImage::Bytes(decode_jpeg(&encoded, "Invalid Base64 string")?)
        }
        (None, Some(url)) => {
            validate_url(&url, state.config.allow_private_fetch).map_err(|e| {
                tracing::debug!(error = %e, "registration URL refused");
                ApiError::BadRequest("Invalid facial image URL".into())
            })?;
            RegistrationImage::Url(url)
        }
        _ => return Err(ApiError::BadRequest("All fields are required".into())),
    };

    let reference = match image {
        RegistrationImage::Url(url) => {
            // only checks that the image has a face; the URL itself is stored
            state
                .engine
                .describe(RegistrationImage::Url(url.clone()), state.deadline())
                .await?;
            StoredReference::Url(url)
        }
        bytes @ RegistrationImage::Bytes(_) => {
            StoredReference::Descriptor(state.engine.describe(bytes, state.deadline()).await?)
        }
    };

    let account = NewAccount {
        email: payload.email,
        first_name: payload.first_name,
        last_name: payload.last_name,
    };
    let id = state.store.insert(account, &reference).await?;
    tracing::info!(account = %id, kind = reference.kind(), "account registered");

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Registration successful!" })),
    ))
}

async fn handle_verify(
    State(state): State<AppState>,
    payload: Result<Json<VerifyPayload>, JsonRejection>,
) -> Result<Json<AccountProfile>, ApiError> {
    let Json(payload) =
        payload.map_err(|_| ApiError::BadRequest("Invalid request payload".into()))?;
    if payload.email.is_empty() || payload.frames.len() != BURST_SIZE {
        return Err(ApiError::BadRequest("Request fields invalid".into()));
    }

    // held until the verdict is known; dropping it early releases the slot
    let attempt =
        Attempt::begin(&state.rate_limiter, &payload.email).map_err(ApiError::RateLimited)?;

    let Some(account) = state.store.get_by_email(&payload.email).await? else {
        return Err(ApiError::UnknownAccount);
    };

    let frames = payload
        .frames
        .iter()
        .enumerate()
        .map(|(i, frame)| decode_jpeg(frame, &format!("Invalid base64 string for frame {}", i + 1)))
        .collect::<Result<Vec<_>, _>>()?;

    let report = state
        .engine
        .verify(frames, account.reference, state.deadline())
        .await?;

    match report.verdict {
        MatchVerdict::Accepted => {
            attempt.accepted();
            tracing::info!(
                account = %account.id,
                distance = ?report.reference_distance,
                "verification accepted"
            );
            Ok(Json(AccountProfile {
                id: account.id,
                email: account.email,
                first_name: account.first_name,
                last_name: account.last_name,
            }))
        }
        MatchVerdict::FailedNoFace => {
            tracing::info!(account = %account.id, "verification failed: no face in burst");
            Err(ApiError::NoFace)
        }
        verdict => {
            attempt.rejected();
            tracing::info!(account = %account.id, ?verdict, "verification rejected");
            Err(ApiError::InvalidCredentials)
        }
    }
}

async fn handle_status(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let accounts = state.store.count_all().await?;
    let policy = state.engine.policy();
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "accounts": accounts,
        "burst_size": BURST_SIZE,
        "identity_threshold": policy.identity_threshold,
        "motion_upper_bound": policy.motion_upper_bound,
        "shift_lower_bound": policy.shift_lower_bound,
    })))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Decode a base64 image and require JPEG content.
fn decode_jpeg(encoded: &str, decode_message: &str) -> Result<Vec<u8>, ApiError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|_| ApiError::BadRequest(decode_message.to_string()))?;
    match image::guess_format(&bytes) {
        Ok(ImageFormat::Jpeg) => Ok(bytes),
        _ => Err(ApiError::BadRequest("Unsupported image format".into())),
    }
}
