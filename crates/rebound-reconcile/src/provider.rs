//! Provider clients used to reprocess failed webhooks.
//!
//! A [`WebhookProvider`] confirms that an event still exists upstream and
//! then hands it to a [`WebhookHandler`], the domain side effect that the
//! original delivery failed to complete. Providers are looked up by the
//! row's `provider` column through a [`ProviderRegistry`].

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use rebound_core::{Clock, RealClock, WebhookEvent};
use rebound_resilience::{
    with_timeout, Backoff, CircuitBreaker, CircuitBreakerError, CircuitBreakerOptions,
    GuardError, RetryExecutor, RetryOptions,
};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ProviderError;

/// Reprocesses webhooks for one upstream provider.
#[async_trait]
pub trait WebhookProvider: Send + Sync + fmt::Debug {
    /// Registry key, matched against `WebhookEvent::provider`.
    fn name(&self) -> &str;

    /// Validates `event` upstream and runs its side effect.
    async fn reprocess(&self, event: &WebhookEvent) -> Result<(), ProviderError>;
}

/// Domain side effect applied to a validated webhook.
///
/// Must be idempotent: a run that crashes after the side effect but before
/// the outcome is recorded will apply it again on the next run.
#[async_trait]
pub trait WebhookHandler: Send + Sync + fmt::Debug {
    /// Applies the side effect for `event`, given the upstream copy.
    async fn handle(&self, event: &WebhookEvent, upstream: &Value) -> Result<(), ProviderError>;
}

/// Handler that only logs the validated event.
#[derive(Debug, Default)]
pub struct LoggingHandler;

#[async_trait]
impl WebhookHandler for LoggingHandler {
    async fn handle(&self, event: &WebhookEvent, upstream: &Value) -> Result<(), ProviderError> {
        let upstream_type =
            upstream.get("type").and_then(serde_json::Value::as_str).unwrap_or("unknown");
        info!(
            webhook_id = %event.id,
            provider = %event.provider,
            event_id = %event.event_id,
            event_type = %event.event_type,
            upstream_type,
            "webhook reprocessed"
        );
        Ok(())
    }
}

/// Providers keyed by name.
#[derive(Debug, Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn WebhookProvider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` under its own name, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn WebhookProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, provider: Arc<dyn WebhookProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Looks up a provider.
    pub fn get(&self, name: &str) -> Option<Arc<dyn WebhookProvider>> {
        self.providers.get(name).cloned()
    }

    /// Registered provider names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Whether no provider is registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Stripe client settings.
#[derive(Clone)]
pub struct StripeConfig {
    /// API base URL, without trailing slash.
    pub api_base: String,
    /// Secret key sent as a bearer token.
    pub api_key: String,
    /// Budget for each individual lookup.
    pub request_timeout: Duration,
    /// Lookup attempts per reprocessing.
    pub max_attempts: u32,
    /// Delay schedule between lookup attempts.
    pub backoff: Backoff,
    /// Breaker guarding the Stripe API.
    pub circuit_breaker: CircuitBreakerOptions,
}

impl StripeConfig {
    /// Production defaults for `api_key`.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_base: "https://api.stripe.com".to_string(),
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(10),
            max_attempts: 3,
            backoff: Backoff::default(),
            circuit_breaker: CircuitBreakerOptions::default(),
        }
    }
}

impl fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripeConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &"***")
            .field("request_timeout", &self.request_timeout)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("circuit_breaker", &self.circuit_breaker)
            .finish()
    }
}

type LookupError = CircuitBreakerError<GuardError<ProviderError>>;

/// Stripe provider: looks the event up with `GET /v1/events/{id}`.
///
/// Each lookup attempt is bounded by `request_timeout`, routed through a
/// breaker named `stripe`, and retried on transient failures. A missing or
/// mismatched event is an answer about that event only and does not count
/// against the breaker.
pub struct StripeProvider {
    client: reqwest::Client,
    config: StripeConfig,
    breaker: CircuitBreaker,
    retry: RetryExecutor,
    retry_options: RetryOptions<LookupError>,
    handler: Arc<dyn WebhookHandler>,
}

impl StripeProvider {
    /// Provider name used in the registry and on rows.
    pub const NAME: &'static str = "stripe";

    /// Creates the provider on the real clock.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Network` if the HTTP client cannot be built.
    pub fn new(
        config: StripeConfig,
        handler: Arc<dyn WebhookHandler>,
    ) -> Result<Self, ProviderError> {
        Self::with_clock(config, handler, RealClock::shared())
    }

    /// Creates the provider with breaker and retry timing on `clock`.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Network` if the HTTP client cannot be built.
    pub fn with_clock(
        config: StripeConfig,
        handler: Arc<dyn WebhookHandler>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rebound/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Network {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        let breaker =
            CircuitBreaker::with_clock(Self::NAME, config.circuit_breaker.clone(), clock.clone());
        let retry_options =
            RetryOptions::new().max_attempts(config.max_attempts).backoff(config.backoff);

        Ok(Self {
            client,
            config,
            breaker,
            retry: RetryExecutor::new(clock),
            retry_options,
            handler,
        })
    }

    /// The breaker guarding the Stripe API.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Fetches the upstream copy of `event_id` with breaker, retry and
    /// timeout applied.
    ///
    /// # Errors
    ///
    /// Returns the flattened provider error of the final failure.
    pub async fn retrieve_event(&self, event_id: &str) -> Result<Value, ProviderError> {
        let result = self
            .retry
            .run(
                || {
                    self.breaker.execute(move || async move {
                        let lookup = with_timeout(
                            self.fetch_once(event_id),
                            self.config.request_timeout,
                            Some("stripe event lookup timed out"),
                        )
                        .await;
                        match lookup {
                            Err(GuardError::Inner(error)) if error.is_event_verdict() => {
                                Ok(Err(error))
                            },
                            other => other.map(Ok),
                        }
                    })
                },
                &self.retry_options,
            )
            .await?;

        let body = result.value?;
        debug!(event_id, attempts = result.attempts, "stripe event retrieved");
        Ok(body)
    }

    async fn fetch_once(&self, event_id: &str) -> Result<Value, ProviderError> {
        let url = format!("{}/v1/events/{}", self.config.api_base.trim_end_matches('/'), event_id);

        let response = self.client.get(&url).bearer_auth(&self.config.api_key).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound { event_id: event_id.to_string() });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::http(status.as_u16(), body));
        }

        let body: Value = response.json().await.map_err(|e| ProviderError::InvalidResponse {
            message: format!("event body is not JSON: {e}"),
        })?;

        match body.get("id").and_then(Value::as_str) {
            Some(id) if id == event_id => Ok(body),
            Some(other) => Err(ProviderError::InvalidResponse {
                message: format!("asked for {event_id}, received {other}"),
            }),
            None => {
                Err(ProviderError::InvalidResponse { message: "event body has no id".to_string() })
            },
        }
    }
}

impl fmt::Debug for StripeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripeProvider")
            .field("api_base", &self.config.api_base)
            .field("breaker", &self.breaker)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl WebhookProvider for StripeProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn reprocess(&self, event: &WebhookEvent) -> Result<(), ProviderError> {
        let upstream = self.retrieve_event(&event.event_id).await?;
        self.handler.handle(event, &upstream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Named(&'static str);

    #[async_trait]
    impl WebhookProvider for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn reprocess(&self, _event: &WebhookEvent) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    #[test]
    fn registry_keys_by_provider_name() {
        let registry =
            ProviderRegistry::new().with(Arc::new(Named("stripe"))).with(Arc::new(Named("adyen")));

        assert_eq!(registry.names(), vec!["adyen", "stripe"]);
        assert!(registry.get("stripe").is_some());
        assert!(registry.get("paypal").is_none());
    }

    #[test]
    fn api_key_is_not_debug_printed() {
        let provider =
            StripeProvider::new(StripeConfig::new("sk_test_secret"), Arc::new(LoggingHandler))
                .unwrap();

        let rendered = format!("{provider:?} {:?}", StripeConfig::new("sk_test_secret"));
        assert!(!rendered.contains("sk_test_secret"));
        assert_eq!(provider.name(), "stripe");
    }
}
