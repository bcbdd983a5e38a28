//! NATS connection manager with reconnect/backoff and optional auth/encryption.
//!
//! Wraps `async-nats` to provide a resilient connection layer. Security mode
//! support is flexible: none, user/password, token, nkey, tls, and creds-file
//! modes are all optional runtime choices. Connection events reported by
//! `async-nats` are folded into [`ConnectionState`] transitions which election
//! participants and watches subscribe to.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_nats::ConnectOptions;
use async_nats::jetstream;
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, error, info, warn};

use config::NatsConfig;
use config::wire::NatsSecurityMode;

use crate::coordinator::ConnectionState;
use crate::error::{CoordinationError, CoordinationResult};

/// Default connection timeout if not configured.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default request timeout if not configured.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// Base delay for retrying initial NATS connections.
const CONNECT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for retry backoff during initial NATS connect.
const MAX_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);

const STATE_EVENT_CAPACITY: usize = 64;

/// Publishes connection state transitions, deduplicated.
#[derive(Debug)]
struct StateTracker {
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionState>,
    connected_once: AtomicBool,
}

impl StateTracker {
    fn new() -> Self {
        // a client that never connected has no session, same as a lost one
        let (state, _) = watch::channel(ConnectionState::Lost);
        let (events, _) = broadcast::channel(STATE_EVENT_CAPACITY);
        Self {
            state,
            events,
            connected_once: AtomicBool::new(false),
        }
    }

    fn publish(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(state = %next, "NATS connection state changed");
            // no receivers just means nobody is listening yet
            let _ = self.events.send(next);
        }
    }

    fn on_connected(&self) {
        if self.state.borrow().is_connected() {
            return;
        }
        if self.connected_once.swap(true, Ordering::SeqCst) {
            self.publish(ConnectionState::Reconnected);
        } else {
            self.publish(ConnectionState::Connected);
        }
    }

    fn on_event(&self, event: async_nats::Event) {
        match event {
            async_nats::Event::Connected => self.on_connected(),
            async_nats::Event::Disconnected => self.publish(ConnectionState::Suspended),
            async_nats::Event::Closed => self.publish(ConnectionState::Lost),
            other => debug!(event = ?other, "NATS client event"),
        }
    }
}

/// NATS connection manager for the values and election buckets.
///
/// Provides:
/// - Connection bootstrap from `NatsConfig`
/// - Automatic reconnection (handled by async-nats internally)
/// - Optional security mode configuration
/// - Connection state transitions as a watch channel and an event stream
/// - Timeout helper that maps errors to typed `CoordinationError`
#[derive(Clone)]
pub struct NatsClient {
    nats_client: Arc<RwLock<Option<async_nats::Client>>>,
    tracker: Arc<StateTracker>,
    config: Arc<NatsConfig>,
    request_timeout: Duration,
}

impl NatsClient {
    /// Create a new client from nats configuration, without connecting yet.
    ///
    /// Call [`NatsClient::connect`] to establish the NATS connection.
    pub fn new(config: NatsConfig) -> Self {
        let request_timeout = config.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        Self {
            nats_client: Arc::new(RwLock::new(None)),
            tracker: Arc::new(StateTracker::new()),
            config: Arc::new(config),
            request_timeout,
        }
    }

    /// Build connect options from the nats config, applying the selected security mode.
    async fn build_connect_options(config: &NatsConfig) -> CoordinationResult<ConnectOptions> {
        let mut opts = ConnectOptions::new();

        match &config.security_mode {
            NatsSecurityMode::None => {}
            NatsSecurityMode::UserPassword => {
                let user = config.username.as_deref().ok_or_else(|| {
                    CoordinationError::Config(
                        "user_password security mode requires 'username'".into(),
                    )
                })?;
                let pass = config.password.as_deref().ok_or_else(|| {
                    CoordinationError::Config(
                        "user_password security mode requires 'password'".into(),
                    )
                })?;
                opts = opts.user_and_password(user.into(), pass.into());
            }
            NatsSecurityMode::Token => {
                let token = config.token.as_deref().ok_or_else(|| {
                    CoordinationError::Config("token security mode requires 'token'".into())
                })?;
                opts = opts.token(token.into());
            }
            NatsSecurityMode::Nkey => {
                let seed_path = config.nkey_seed_path.as_ref().ok_or_else(|| {
                    CoordinationError::Config("nkey security mode requires 'nkey_seed_path'".into())
                })?;
                let seed = std::fs::read_to_string(seed_path).map_err(|e| {
                    CoordinationError::Config(format!(
                        "failed to read nkey seed file '{}': {e}",
                        seed_path.display()
                    ))
                })?;
                opts = opts.nkey(seed.trim().to_string());
            }
            NatsSecurityMode::Tls => {
                let cert_path = config.tls_cert_path.as_ref().ok_or_else(|| {
                    CoordinationError::Config("tls security mode requires 'tls_cert_path'".into())
                })?;
                let key_path = config.tls_key_path.as_ref().ok_or_else(|| {
                    CoordinationError::Config("tls security mode requires 'tls_key_path'".into())
                })?;
                opts = opts.add_client_certificate(cert_path.clone(), key_path.clone());
                if let Some(ca_path) = &config.tls_ca_path {
                    opts = opts.add_root_certificates(ca_path.clone());
                }
                opts = opts.require_tls(true);
            }
            NatsSecurityMode::CredsFile => {
                let creds_path = config.creds_file_path.as_ref().ok_or_else(|| {
                    CoordinationError::Config(
                        "creds_file security mode requires 'creds_file_path'".into(),
                    )
                })?;
                opts = opts.credentials_file(creds_path).await.map_err(|e| {
                    CoordinationError::Config(format!(
                        "failed to load credentials file '{}': {e}",
                        creds_path.display()
                    ))
                })?;
            }
        }

        // server-side TLS verification in non-TLS auth modes
        if config.security_mode != NatsSecurityMode::Tls
            && let Some(ca_path) = &config.tls_ca_path
        {
            opts = opts.add_root_certificates(ca_path.clone());
            opts = opts.require_tls(true);
        }

        let connect_timeout = config.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        // no retry_on_initial_connect: `connect` must only return once a
        // session exists, failed attempts go through the backoff loop
        opts = opts.connection_timeout(connect_timeout);

        Ok(opts)
    }

    /// Establish the NATS connection.
    ///
    /// Uses the configured server URLs and security mode. Each attempt
    /// completes the handshake before returning, so on success the client
    /// reports [`ConnectionState::Connected`]; later transitions come from
    /// async-nats connection events.
    pub async fn connect(&self) -> CoordinationResult<()> {
        if self.nats_client.read().await.is_some() {
            debug!("NATS client already connected, skipping connect");
            return Ok(());
        }

        let config = &self.config;
        info!(
            servers = ?config.servers,
            security_mode = ?config.security_mode,
            connect_retry_max = config.connect_retry_max,
            "connecting to NATS"
        );

        let total_attempts = config.connect_retry_max.saturating_add(1);
        for attempt in 0..total_attempts {
            let tracker = Arc::clone(&self.tracker);
            let opts = Self::build_connect_options(config)
                .await?
                .event_callback(move |event| {
                    let tracker = Arc::clone(&tracker);
                    async move { tracker.on_event(event) }
                });

            match opts.connect(config.servers.clone()).await {
                Ok(client) => {
                    *self.nats_client.write().await = Some(client);
                    self.tracker.on_connected();
                    info!(
                        attempt = attempt + 1,
                        total_attempts, "NATS connection established"
                    );
                    return Ok(());
                }
                Err(err) => {
                    let attempt_num = attempt + 1;
                    if attempt_num >= total_attempts {
                        error!(
                            attempts = total_attempts,
                            error = %err,
                            "NATS connection failed after all retry attempts"
                        );
                        return Err(CoordinationError::Transport(format!(
                            "NATS connection failed after {total_attempts} attempt(s): {err}"
                        )));
                    }

                    let delay = CONNECT_RETRY_BASE_DELAY
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(MAX_CONNECT_RETRY_DELAY);
                    warn!(
                        attempt = attempt_num,
                        total_attempts,
                        retry_in_ms = delay.as_millis(),
                        error = %err,
                        "NATS connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(CoordinationError::Config(
            "connect_retry_max allows no connection attempt".into(),
        ))
    }

    /// Returns the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.tracker.state.borrow()
    }

    /// Returns true if the client is currently connected.
    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Latest connection state, for waiting on a particular state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.tracker.state.subscribe()
    }

    /// Every connection state transition from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.tracker.events.subscribe()
    }

    /// Returns the configured request timeout.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn values_bucket(&self) -> &str {
        &self.config.values_bucket
    }

    pub fn election_bucket(&self) -> &str {
        &self.config.election_bucket
    }

    /// Await `fut` bounded by the request timeout, mapping its error to a
    /// transport error.
    pub async fn timed<T, E, F>(&self, what: &str, fut: F) -> CoordinationResult<T>
    where
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| {
                CoordinationError::Timeout(format!(
                    "{what} timed out after {:?}",
                    self.request_timeout
                ))
            })?
            .map_err(|e| CoordinationError::Transport(format!("{what} failed: {e}")))
    }

    /// Run a startup write-path selftest against the values KV bucket.
    ///
    /// This verifies that JetStream KV is reachable for write/read/delete
    /// operations before the process reports healthy.
    pub async fn startup_write_selftest(&self) -> CoordinationResult<()> {
        let bucket = self.values_bucket().to_owned();
        let store = self
            .get_or_create_kv_bucket(&bucket, 1, Duration::ZERO)
            .await?;

        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let probe_key = format!("startup/selftest/{nonce}");
        let probe_value = format!("kvbind-startup-selftest-{nonce}");

        self.timed(
            &format!("selftest put of '{probe_key}'"),
            store.put(&probe_key, probe_value.clone().into_bytes().into()),
        )
        .await?;

        let stored = self
            .timed(
                &format!("selftest get of '{probe_key}'"),
                store.get(probe_key.clone()),
            )
            .await?;

        let Some(stored) = stored else {
            return Err(CoordinationError::Transport(format!(
                "nats write selftest get returned no value for key '{probe_key}'"
            )));
        };

        if stored.as_ref() != probe_value.as_bytes() {
            return Err(CoordinationError::Transport(format!(
                "nats write selftest value mismatch for key '{probe_key}'"
            )));
        }

        self.timed(
            &format!("selftest delete of '{probe_key}'"),
            store.purge(&probe_key),
        )
        .await?;

        info!(bucket, key = %probe_key, "nats startup write selftest passed");
        Ok(())
    }

    /// Build a JetStream context for the active NATS connection.
    pub async fn jetstream_context(&self) -> CoordinationResult<jetstream::Context> {
        let client = self.nats_client().await?;
        Ok(jetstream::new(client))
    }

    /// Get an existing KV bucket or create it if missing. A zero `max_age`
    /// keeps entries forever.
    pub async fn get_or_create_kv_bucket(
        &self,
        bucket: &str,
        history: i64,
        max_age: Duration,
    ) -> CoordinationResult<jetstream::kv::Store> {
        let js = self.jetstream_context().await?;
        match js.get_key_value(bucket.to_string()).await {
            Ok(store) => Ok(store),
            Err(get_err) => {
                debug!(bucket, error = %get_err, "creating missing JetStream KV bucket");
                js.create_key_value(jetstream::kv::Config {
                    bucket: bucket.to_string(),
                    history,
                    max_age,
                    ..Default::default()
                })
                .await
                .map_err(|create_err| {
                    CoordinationError::Transport(format!(
                        "failed to create JetStream KV bucket '{bucket}': {create_err} (get error: {get_err})"
                    ))
                })
            }
        }
    }

    /// Get a reference to the underlying async-nats client.
    /// Returns an error if not connected.
    async fn nats_client(&self) -> CoordinationResult<async_nats::Client> {
        self.nats_client
            .read()
            .await
            .clone()
            .ok_or_else(|| CoordinationError::NotConnected("NATS client not connected".into()))
    }

    /// Shut down the client. The session is gone afterwards, which is
    /// reported as [`ConnectionState::Lost`].
    pub async fn disconnect(&self) {
        self.nats_client.write().await.take();
        self.tracker.publish(ConnectionState::Lost);
        info!("NATS client disconnected");
    }
}

impl std::fmt::Debug for NatsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsClient")
            .field("servers", &self.config.servers)
            .field("state", &self.connection_state())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::wire::{DEFAULT_ELECTION_BUCKET, DEFAULT_VALUES_BUCKET};

    fn test_config() -> NatsConfig {
        NatsConfig {
            servers: vec!["nats://127.0.0.1:4222".into()],
            values_bucket: DEFAULT_VALUES_BUCKET.into(),
            election_bucket: DEFAULT_ELECTION_BUCKET.into(),
            security_mode: NatsSecurityMode::None,
            username: None,
            password: None,
            token: None,
            nkey_seed_path: None,
            tls_cert_path: None,
            tls_key_path: None,
            tls_ca_path: None,
            creds_file_path: None,
            connect_timeout: Some(Duration::from_secs(2)),
            connect_retry_max: 2,
            request_timeout: Some(Duration::from_millis(500)),
        }
    }

    #[tokio::test]
    async fn test_build_connect_options_none() {
        let config = test_config();
        let opts = NatsClient::build_connect_options(&config).await;
        assert!(opts.is_ok());
    }

    #[tokio::test]
    async fn test_build_connect_options_user_password() {
        let mut config = test_config();
        config.security_mode = NatsSecurityMode::UserPassword;
        config.username = Some("user".into());
        config.password = Some("pass".into());
        let opts = NatsClient::build_connect_options(&config).await;
        assert!(opts.is_ok());
    }

    #[tokio::test]
    async fn test_build_connect_options_user_password_missing_username() {
        let mut config = test_config();
        config.security_mode = NatsSecurityMode::UserPassword;
        config.password = Some("pass".into());
        let result = NatsClient::build_connect_options(&config).await;
        assert!(matches!(result, Err(CoordinationError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_connect_options_token_missing() {
        let mut config = test_config();
        config.security_mode = NatsSecurityMode::Token;
        let result = NatsClient::build_connect_options(&config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_build_connect_options_nkey_missing_path() {
        let mut config = test_config();
        config.security_mode = NatsSecurityMode::Nkey;
        let result = NatsClient::build_connect_options(&config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_build_connect_options_tls_missing_key() {
        let mut config = test_config();
        config.security_mode = NatsSecurityMode::Tls;
        config.tls_cert_path = Some("/tmp/cert.pem".into());
        let result = NatsClient::build_connect_options(&config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_build_connect_options_creds_missing_path() {
        let mut config = test_config();
        config.security_mode = NatsSecurityMode::CredsFile;
        let result = NatsClient::build_connect_options(&config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = NatsClient::new(test_config());
        assert_eq!(client.connection_state(), ConnectionState::Lost);
        assert!(!client.is_connected());
        assert!(matches!(
            client.jetstream_context().await,
            Err(CoordinationError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_options_block_on_initial_connect() {
        let opts = NatsClient::build_connect_options(&test_config())
            .await
            .unwrap();
        let dbg = format!("{opts:?}");
        assert!(
            dbg.contains("\"retry_on_initial_connect\": false"),
            "connect options: {dbg}"
        );
    }

    #[tokio::test]
    async fn test_connect_unreachable_stays_lost() {
        let mut config = test_config();
        config.servers = vec!["nats://127.0.0.1:1".into()];
        config.connect_retry_max = 0;
        config.connect_timeout = Some(Duration::from_millis(200));
        let client = NatsClient::new(config);
        let mut events = client.subscribe_events();

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, CoordinationError::Transport(_)));
        assert_eq!(client.connection_state(), ConnectionState::Lost);
        assert!(!client.is_connected());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let tracker = StateTracker::new();
        let mut events = tracker.events.subscribe();

        tracker.on_event(async_nats::Event::Connected);
        tracker.on_event(async_nats::Event::Connected);
        tracker.on_event(async_nats::Event::Disconnected);
        tracker.on_event(async_nats::Event::Connected);
        tracker.on_event(async_nats::Event::Closed);

        let mut seen = Vec::new();
        while let Ok(state) = events.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connected,
                ConnectionState::Suspended,
                ConnectionState::Reconnected,
                ConnectionState::Lost,
            ]
        );
        assert_eq!(*tracker.state.borrow(), ConnectionState::Lost);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let client = NatsClient::new(test_config());
        client.disconnect().await;
        assert_eq!(client.connection_state(), ConnectionState::Lost);
    }

    #[tokio::test]
    async fn test_timed_maps_errors() {
        let client = NatsClient::new(test_config());
        let err = client
            .timed("probe", async { Err::<(), _>("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Transport(msg) if msg.contains("boom")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_times_out() {
        let client = NatsClient::new(test_config());
        let err = client
            .timed("probe", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_request_timeout_default() {
        let mut config = test_config();
        config.request_timeout = None;
        let client = NatsClient::new(config);
        assert_eq!(client.request_timeout(), DEFAULT_REQUEST_TIMEOUT);
    }
}
