mod auth;
mod resource;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Longest access token lifetime we'll accept, one day
const MAX_TOKEN_LIFETIME_SECS: u64 = 24 * 60 * 60;

#[derive(Parser, Debug)]
#[command(name = "clubhouse")]
#[command(about = "oauth2 client-credentials authorization server and the resource server it protects")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue access tokens and publish signing keys
    AuthServer(AuthServerArgs),
    /// Serve lessons to callers holding a valid token
    ResourceServer(ResourceServerArgs),
}

#[derive(Args, Debug)]
struct AuthServerArgs {
    /// Host to bind to
    #[arg(long, env = "AUTH_HOST", default_value = "localhost")]
    host: String,

    /// Port to bind to
    #[arg(short, long, env = "AUTH_PORT", default_value = "9000")]
    port: u16,

    /// Public issuer URL, goes in the `iss` claim and the metadata document.
    /// If not set, defaults to http://HOST:PORT
    #[arg(long, env = "ISSUER_URL")]
    issuer_url: Option<String>,

    /// Client ID to register
    #[arg(long, env = "OAUTH_CLIENT_ID")]
    client_id: Option<String>,

    /// Client secret for that client, hashed at startup and then forgotten
    #[arg(long, env = "OAUTH_CLIENT_SECRET")]
    client_secret: Option<String>,

    /// Scopes the client may ask for
    #[arg(long, env = "OAUTH_CLIENT_SCOPES", value_delimiter = ',', default_value = "read")]
    client_scopes: Vec<String>,

    /// How the client must present its secret
    #[arg(long, env = "OAUTH_CLIENT_AUTH_METHOD", default_value = "client_secret_basic")]
    client_auth_method: auth::AuthMethod,

    /// JSON file with more clients, loaded alongside the one above
    #[arg(long, env = "OAUTH_CLIENTS_FILE")]
    clients_file: Option<PathBuf>,

    /// Access token lifetime in seconds
    #[arg(long, env = "OAUTH_TOKEN_LIFETIME", default_value = "300")]
    token_lifetime: u64,

    /// Rotate the signing key this often, in seconds (0 = never)
    #[arg(long, env = "OAUTH_KEY_ROTATION_INTERVAL", default_value = "0")]
    key_rotation_interval: u64,

    /// Seconds a rotated-out key keeps verifying tokens
    #[arg(long, env = "OAUTH_KEY_GRACE_PERIOD", default_value = "300")]
    key_grace_period: u64,

    /// Argon2 memory cost in KiB
    #[arg(long, env = "SECRET_HASH_MEMORY_KIB", default_value = "19456")]
    hash_memory_kib: u32,

    /// Argon2 iterations
    #[arg(long, env = "SECRET_HASH_ITERATIONS", default_value = "2")]
    hash_iterations: u32,
}

#[derive(Args, Debug)]
struct ResourceServerArgs {
    /// Host to bind to
    #[arg(long, env = "RESOURCE_HOST", default_value = "localhost")]
    host: String,

    /// Port to bind to
    #[arg(short, long, env = "RESOURCE_PORT", default_value = "8090")]
    port: u16,

    /// Issuer we trust, must match the `iss` claim exactly
    #[arg(long, env = "AUTHORIZATION_SERVER_URL", default_value = "http://localhost:9000")]
    authorization_server: String,

    /// Where to fetch the issuer's keys. Defaults to <issuer>/oauth2/jwks
    #[arg(long, env = "JWKS_URI")]
    jwks_uri: Option<String>,

    /// Seconds between background JWKS refreshes, keep this under the issuer's grace period
    #[arg(
        long,
        env = "JWKS_REFRESH_INTERVAL",
        default_value = "60",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    jwks_refresh_interval: u64,

    /// Seconds to wait on a JWKS fetch
    #[arg(long, env = "JWKS_FETCH_TIMEOUT", default_value = "5")]
    jwks_fetch_timeout: u64,

    /// Public base URL for the resource metadata (e.g., https://lessons.example.com)
    /// If not set, defaults to http://HOST:PORT
    #[arg(long, env = "PUBLIC_URL")]
    public_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // grant decisions go to the "audit" target, keep it on by default
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clubhouse=info,audit=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Command::AuthServer(args) => run_auth_server(args).await,
        Command::ResourceServer(args) => run_resource_server(args).await,
    }
}

fn base_url(public_url: Option<&str>, host: &str, port: u16) -> String {
    public_url
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|| format!("http://{}:{}", host, port))
}

fn auth_config(args: &AuthServerArgs) -> Result<auth::AuthConfig> {
    let mut clients = Vec::new();

    if let Some(client_id) = &args.client_id {
        let client_secret = args
            .client_secret
            .clone()
            .ok_or_else(|| anyhow::anyhow!("OAUTH_CLIENT_SECRET required with OAUTH_CLIENT_ID"))?;

        clients.push(auth::ClientConfig {
            client_id: client_id.clone(),
            client_secret: Some(client_secret),
            client_secret_hash: None,
            auth_method: args.client_auth_method,
            grant_types: vec![auth::GrantType::ClientCredentials],
            scopes: args.client_scopes.clone(),
        });
    }

    if let Some(path) = &args.clients_file {
        let from_file = auth::load_clients_file(path)?;
        tracing::info!("Loaded {} clients from {}", from_file.len(), path.display());
        clients.extend(from_file);
    }

    if clients.is_empty() {
        bail!("no clients registered, set OAUTH_CLIENT_ID/OAUTH_CLIENT_SECRET or OAUTH_CLIENTS_FILE");
    }
    if args.token_lifetime == 0 {
        bail!("OAUTH_TOKEN_LIFETIME must be greater than zero");
    }
    if args.token_lifetime > MAX_TOKEN_LIFETIME_SECS {
        bail!(
            "OAUTH_TOKEN_LIFETIME must be at most {}s, got {}s",
            MAX_TOKEN_LIFETIME_SECS,
            args.token_lifetime
        );
    }
    if args.key_grace_period < args.token_lifetime {
        tracing::warn!(
            "Key grace period ({}s) is shorter than token lifetime ({}s), \
             tokens signed just before a rotation will stop verifying early",
            args.key_grace_period,
            args.token_lifetime
        );
    }

    Ok(auth::AuthConfig {
        issuer: base_url(args.issuer_url.as_deref(), &args.host, args.port),
        clients,
        token_lifetime: Duration::from_secs(args.token_lifetime),
        key_grace_period: Duration::from_secs(args.key_grace_period),
        hash_params: auth::HashParams {
            memory_kib: args.hash_memory_kib,
            iterations: args.hash_iterations,
        },
    })
}

async fn run_auth_server(args: AuthServerArgs) -> Result<()> {
    // we pass this to TcpListener::bind() which accepts ToSocketAddrs,
    // so hostnames like "localhost" get resolved properly (unlike SocketAddr::parse)
    let bind_addr = format!("{}:{}", args.host, args.port);

    let config = auth_config(&args)?;
    let oauth_service = Arc::new(auth::OAuthService::new(config)?);
    let issuer = oauth_service.issuer().to_string();

    tracing::info!("Authorization server listening on {}", bind_addr);
    tracing::info!("Issuer: {}", issuer);
    tracing::info!("Token endpoint: {}/oauth2/token", issuer);
    tracing::info!("JWKS endpoint: {}/oauth2/jwks", issuer);
    tracing::info!(
        "Authorization server metadata: {}/.well-known/oauth-authorization-server",
        issuer
    );

    if args.key_rotation_interval > 0 {
        tracing::info!(
            "Rotating signing key every {}s, grace period {}s",
            args.key_rotation_interval,
            args.key_grace_period
        );
        oauth_service
            .clone()
            .spawn_key_rotation(Duration::from_secs(args.key_rotation_interval));
    }

    let oauth_state = auth::OAuthAppState { oauth_service };

    // Stricter rate limiting on anything that takes a client secret: 5 requests per second, burst of 10
    // SmartIpKeyExtractor checks x-forwarded-for and friends before falling back to peer ip,
    // so this works both behind a proxy and when running locally
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(SmartIpKeyExtractor)
            .per_second(5)
            .burst_size(10)
            .finish()
            .context("failed to build rate limiter config")?,
    );
    let governor_limiter = governor_conf.limiter().clone();
    let rate_limit_layer = GovernorLayer::new(governor_conf);

    // Start background task to clean up rate limiter state
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            governor_limiter.retain_recent();
        }
    });

    let app = auth::discovery_routes(oauth_state.clone())
        .merge(auth::token_routes(oauth_state).layer(rate_limit_layer))
        .layer(TraceLayer::new_for_http());

    serve(&bind_addr, app).await
}

async fn run_resource_server(args: ResourceServerArgs) -> Result<()> {
    let bind_addr = format!("{}:{}", args.host, args.port);
    let base_url = base_url(args.public_url.as_deref(), &args.host, args.port);
    let issuer = args.authorization_server.trim_end_matches('/').to_string();
    let jwks_uri = args
        .jwks_uri
        .clone()
        .unwrap_or_else(|| format!("{}/oauth2/jwks", issuer));

    tracing::info!("Resource server listening on {}", bind_addr);
    tracing::info!("Trusting issuer {} (keys from {})", issuer, jwks_uri);
    tracing::info!("Lessons endpoint: {}/lessons", base_url);

    let jwks = Arc::new(
        auth::JwksCache::new(jwks_uri, Duration::from_secs(args.jwks_fetch_timeout))
            .context("failed to build JWKS client")?,
    );

    // the issuer may well start after us, so a failed first fetch isn't fatal.
    // until some fetch succeeds every token is rejected
    match jwks.refresh().await {
        Ok(count) => tracing::info!("Loaded {} verification keys", count),
        Err(e) => tracing::warn!(
            "Initial JWKS fetch from {} failed, rejecting tokens until it succeeds: {}",
            jwks.jwks_uri(),
            e
        ),
    }
    jwks.clone()
        .spawn_refresh(Duration::from_secs(args.jwks_refresh_interval));

    let validator = Arc::new(auth::JwtTokenValidator::new(jwks, &issuer));

    // Rate limiting: 10 requests per second per IP, burst of 30
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(SmartIpKeyExtractor)
            .per_second(10)
            .burst_size(30)
            .finish()
            .context("failed to build rate limiter config")?,
    );
    let governor_limiter = governor_conf.limiter().clone();
    let rate_limit_layer = GovernorLayer::new(governor_conf);

    // Start background task to clean up rate limiter state
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            governor_limiter.retain_recent();
        }
    });

    let app = resource::router(validator, base_url, issuer)
        .layer(rate_limit_layer)
        .layer(TraceLayer::new_for_http());

    serve(&bind_addr, app).await
}

async fn serve(bind_addr: &str, app: axum::Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    tracing::info!("Server ready on {}", bind_addr);

    // into_make_service_with_connect_info gives us the peer ip for rate limiting fallback
    // (SmartIpKeyExtractor checks headers first, but falls back to this if no proxy headers)
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
