use std::{collections::HashSet, env, net::SocketAddr, path::PathBuf};

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use imagine_studio_server::{build_router, config::Config, db, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let loaded_env_files = load_env_files()?;
    init_tracing();
    if loaded_env_files.is_empty() {
        tracing::warn!("No .env or .env.local file found. Using process environment only.");
    } else {
        let files = loaded_env_files
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(files = %files, "Loaded environment files");
    }

    let config = Config::from_env()?;

    if config.stripe_secret_key.is_none() {
        if Config::is_production() {
            return Err(anyhow::anyhow!(
                "STRIPE_SECRET_KEY environment variable is not set"
            ));
        }

        tracing::warn!(
            "STRIPE_SECRET_KEY is not set. Stripe functionality will not work until it is provided."
        );
    }
    if config.backend_admin_key.is_none() {
        tracing::warn!(
            "BACKEND_ADMIN_KEY is not set. Backend accounts, API keys and credit mirroring are disabled."
        );
    }

    let pool = db::init(&config.database_path).with_context(|| {
        format!(
            "failed to open database at {}",
            config.database_path.display()
        )
    })?;
    let store = db::Store::new(pool);
    let state = AppState::from_config(config.clone(), store)?;

    match state.backend.health().await {
        Ok(()) => {
            tracing::info!(backend_url = %state.backend.base_url(), "Backend connectivity check passed");
        }
        Err(error) => {
            tracing::error!(
                error = ?error,
                backend_url = %state.backend.base_url(),
                "Backend connectivity check failed. Generation requests will fail until it is reachable."
            );
        }
    }

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    if let Some((cert_path, key_path)) = valid_tls_paths(&config) {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("failed to load TLS certificate/key")?;

        tracing::info!(
            port = config.port,
            "TLS configuration loaded. Running in HTTPS mode."
        );

        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("HTTPS server failed")?;
    } else {
        tracing::info!(port = config.port, "Running in HTTP mode.");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind TCP listener")?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("HTTP server failed")?;
    }

    Ok(())
}

/// Both TLS files must be configured and present, otherwise the server falls
/// back to plain HTTP.
fn valid_tls_paths(config: &Config) -> Option<(PathBuf, PathBuf)> {
    let (cert_path, key_path) = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert_path), Some(key_path)) => (cert_path.clone(), key_path.clone()),
        (None, None) => return None,
        (cert_path, key_path) => {
            tracing::error!(
                cert = ?cert_path,
                key = ?key_path,
                "TLS_CERT_PATH and TLS_KEY_PATH must be set together. Proceeding without TLS."
            );
            return None;
        }
    };

    let mut missing = false;
    for (label, path) in [("certificate", &cert_path), ("key", &key_path)] {
        if !path.is_file() {
            tracing::error!(path = %path.display(), "TLS {label} file not found");
            missing = true;
        }
    }
    if missing {
        tracing::error!("Proceeding without TLS.");
        return None;
    }
    Some((cert_path, key_path))
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_env_files() -> anyhow::Result<Vec<PathBuf>> {
    let mut roots = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(executable_path) = env::current_exe() {
        if let Some(executable_dir) = executable_path.parent() {
            roots.push(executable_dir.to_path_buf());
        }
    }
    roots.push(PathBuf::from(env!("CARGO_MANIFEST_DIR")));

    let mut seen_roots = HashSet::new();
    let mut loaded = Vec::new();

    for root in roots {
        let key = root.to_string_lossy().to_string();
        if !seen_roots.insert(key) {
            continue;
        }

        for filename in [".env", ".env.local"] {
            let path = root.join(filename);
            if path.is_file() {
                dotenvy::from_path(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                loaded.push(path);
            }
        }
    }

    if loaded.is_empty() {
        if let Ok(path) = dotenvy::dotenv() {
            loaded.push(path);
        }
    }

    Ok(loaded)
}
