use std::{sync::Arc, time::Duration};

use crate::{
    auth::AuthService, backend::BackendClient, config::Config, db::Store, plans::PriceMap,
    rate_limit::InMemoryRateLimiter, square::SquareWebhooks, stripe_api::StripeApi,
};

const API_RATE_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub auth: AuthService,
    pub backend: BackendClient,
    pub stripe: StripeApi,
    pub square: SquareWebhooks,
    pub price_map: PriceMap,
    pub api_limiter: Arc<InMemoryRateLimiter>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Store,
        auth: AuthService,
        backend: BackendClient,
        stripe: StripeApi,
    ) -> Self {
        let price_map = PriceMap::from_config(&config);
        let square = SquareWebhooks::new(
            config.square_webhook_signature_key.clone(),
            config.square_webhook_url.clone(),
        );
        Self {
            api_limiter: Arc::new(InMemoryRateLimiter::new(
                API_RATE_WINDOW,
                config.api_rate_limit_per_window,
            )),
            config: Arc::new(config),
            store,
            auth,
            backend,
            stripe,
            square,
            price_map,
        }
    }

    /// Wires every client from configuration alone.
    pub fn from_config(config: Config, store: Store) -> anyhow::Result<Self> {
        let auth = AuthService::new(&config.auth_jwt_secret)?;
        let backend = BackendClient::new(config.backend_url.clone(), config.backend_admin_key.clone())?;
        let stripe = StripeApi::new(
            config.stripe_secret_key.clone(),
            config.stripe_webhook_secret.clone(),
            config.stripe_api_base.clone(),
        )?;
        Ok(Self::new(config, store, auth, backend, stripe))
    }
}
