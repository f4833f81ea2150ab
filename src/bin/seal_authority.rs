use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use sticker_swap::{
    config::AppConfig,
    error::ExchangeError,
    seal::{LocalSigningAuthority, SignSealRequest, SignSealResponse, SigningAuthority},
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "seal-authority")]
#[command(about = "Signing authority issuing seals for sticker copies")]
struct Args {
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long, env = "ISSUER_PRIVATE_KEY_HEX", hide_env_values = true)]
    private_key_hex: Option<String>,

    /// Print a fresh key pair and exit
    #[arg(long)]
    generate_key: bool,
}

#[derive(Clone)]
struct AppState {
    authority: Arc<LocalSigningAuthority>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.generate_key {
        let authority = LocalSigningAuthority::generate();
        println!("ISSUER_PRIVATE_KEY_HEX={}", authority.secret_hex());
        println!("Issuer DID: {}", authority.did());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => AppConfig::load_with_env_overrides(path)?,
        None => {
            let mut config = AppConfig::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Some(port) = args.port {
        config.authority.port = port;
    }
    if let Some(key) = args.private_key_hex {
        config.authority.private_key_hex = Some(key);
    }
    config.validate()?;
    config.logging.install();

    let authority = LocalSigningAuthority::from_hex(config.authority.private_key_hex.as_deref())?;
    info!(issuer = authority.did(), "Seal authority ready");

    let app_state = AppState {
        authority: Arc::new(authority),
    };

    let app = Router::new()
        .route("/sign-seal", post(sign_seal))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let address = config.get_authority_address();
    let listener = TcpListener::bind(&address).await?;
    info!(%address, "Seal authority listening");

    axum::serve(listener, app).await?;

    Ok(())
}

fn reject(status: StatusCode, message: String) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message })))
}

async fn sign_seal(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> Result<Json<SignSealResponse>, (StatusCode, Json<Value>)> {
    let request: SignSealRequest = serde_json::from_value(request)
        .map_err(|e| reject(StatusCode::BAD_REQUEST, format!("Missing userDid or payload: {}", e)))?;

    match state.authority.sign(&request.user_did, &request.payload.info).await {
        Ok(envelope) => Ok(Json(SignSealResponse {
            signed_payload: envelope.signed_payload,
            signature: envelope.signature,
            issuer_did: state.authority.did().to_string(),
        })),
        Err(ExchangeError::Validation(message)) => Err(reject(StatusCode::BAD_REQUEST, message)),
        Err(e) => {
            error!("Failed to sign seal: {}", e);
            Err(reject(StatusCode::INTERNAL_SERVER_ERROR, "Signing failed".to_string()))
        }
    }
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "seal-authority",
        "issuer": state.authority.did(),
        "timestamp": chrono::Utc::now()
    }))
}
