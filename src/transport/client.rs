//! Outbound connection to one `Host`, with bounded automatic reconnection.

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::io::{split, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::codec::WireCodec;
use super::framing::{read_frame, write_frame};
use super::messages::{AuthFrame, Frame, TransportMessage};
use super::subscribers::{HandlerRegistry, Subscription};
use super::{
    read_auth_frame, write_auth_frame, BoxedStream, ConnectionId, InboundMessage, TransportError,
};
use crate::auth::{AuthManager, VerifiedPeer};
use crate::config::{ConfigError, MeshSecurityConfig, TlsMode, TransportOptions};
use crate::host::Host;
use crate::identity::{PeerIdentity, Signer};
use crate::keystore::Keystore;
use crate::tls::TlsManager;

/// Observable lifecycle of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting {
        attempt: u32,
    },
    Authenticating,
    Connected {
        authenticated: bool,
        encrypted: bool,
        server_fingerprint: Option<String>,
    },
    /// Automatic reconnection stopped at the attempt cap. Stays until the
    /// next explicit `connect()`.
    ReconnectExhausted {
        attempts: u32,
    },
}

#[derive(Clone)]
struct ClientSettings {
    host: Host,
    config: Arc<MeshSecurityConfig>,
    options: TransportOptions,
    identity: Option<Arc<PeerIdentity>>,
    keystore: Option<Arc<Keystore>>,
}

struct ActiveConnection {
    id: ConnectionId,
    writer: Arc<Mutex<WriteHalf<BoxedStream>>>,
    codec: Arc<WireCodec>,
    reader: JoinHandle<()>,
}

struct ClientInner {
    settings: ClientSettings,
    auth: Option<AuthManager>,
    tls: Option<Arc<ClientConfig>>,
    connection: Mutex<Option<ActiveConnection>>,
    state: watch::Sender<ConnectionState>,
    handlers: HandlerRegistry,
    attempts: AtomicU32,
    /// Set by `disconnect()`; suppresses reconnection
    closing: AtomicBool,
    reconnect_task: StdMutex<Option<JoinHandle<()>>>,
}

/// Client side of the secure transport.
pub struct SecureTransportClient {
    inner: Arc<ClientInner>,
}

impl SecureTransportClient {
    /// `identity` may only be `None` when the config does not require
    /// authentication.
    pub fn new(
        host: Host,
        config: Arc<MeshSecurityConfig>,
        identity: Option<Arc<PeerIdentity>>,
    ) -> Result<Self, TransportError> {
        let settings = ClientSettings {
            host,
            config,
            options: TransportOptions::default(),
            identity,
            keystore: None,
        };
        Self::from_settings(settings, HandlerRegistry::new())
    }

    /// Subscriptions taken before this call keep receiving.
    pub fn with_options(self, options: TransportOptions) -> Result<Self, TransportError> {
        let mut settings = self.inner.settings.clone();
        settings.options = options;
        Self::from_settings(settings, self.inner.handlers.clone())
    }

    /// Refuse servers whose fingerprint this keystore has revoked.
    pub fn with_keystore(self, keystore: Arc<Keystore>) -> Result<Self, TransportError> {
        let mut settings = self.inner.settings.clone();
        settings.keystore = Some(keystore);
        Self::from_settings(settings, self.inner.handlers.clone())
    }

    fn from_settings(
        settings: ClientSettings,
        handlers: HandlerRegistry,
    ) -> Result<Self, TransportError> {
        settings.config.validate()?;
        settings.options.validate()?;
        if settings.config.require_auth() && settings.identity.is_none() {
            return Err(ConfigError::MissingIdentity.into());
        }

        let auth = settings.identity.as_ref().map(|identity| {
            let manager = AuthManager::new(Arc::clone(identity), &settings.options);
            match &settings.keystore {
                Some(keystore) => manager.with_keystore(Arc::clone(keystore)),
                None => manager,
            }
        });
        let tls = match settings.config.tls() {
            TlsMode::None => None,
            TlsMode::SelfSigned | TlsMode::Custom => Some(TlsManager::client_config()?),
        };
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            inner: Arc::new(ClientInner {
                settings,
                auth,
                tls,
                connection: Mutex::new(None),
                state,
                handlers,
                attempts: AtomicU32::new(0),
                closing: AtomicBool::new(false),
                reconnect_task: StdMutex::new(None),
            }),
        })
    }

    pub fn host(&self) -> &Host {
        &self.inner.settings.host
    }

    /// Connect once. Resolves after the handshake completes (or fails) when
    /// authentication is required.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        self.inner.closing.store(false, Ordering::SeqCst);
        self.inner.cancel_reconnect();
        self.inner.establish().await
    }

    /// Connect, retrying transient failures up to `max_reconnect_attempts`
    /// attempts in total. A rejected handshake is not retried.
    pub async fn connect_with_retry(&self) -> Result<(), TransportError> {
        let options = &self.inner.settings.options;
        let max = options.max_reconnect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max {
            if attempt > 1 {
                sleep(options.reconnect_delay(attempt - 1)).await;
                if self.inner.closing.load(Ordering::SeqCst) {
                    return Err(TransportError::NotConnected);
                }
            }
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) => {
                    warn!(host = %self.host().id, attempt, error = %e, "Connection attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        self.inner
            .set_state(ConnectionState::ReconnectExhausted { attempts: max });
        Err(TransportError::ReconnectExhausted {
            attempts: max,
            last_error,
        })
    }

    /// Send one application message. Returns its id.
    pub async fn send(&self, mut message: TransportMessage) -> Result<String, TransportError> {
        if message.is_reserved() {
            return Err(TransportError::ReservedType(message.kind));
        }

        let (id, writer, codec) = {
            let slot = self.inner.connection.lock().await;
            let active = slot.as_ref().ok_or(TransportError::NotConnected)?;
            (active.id, Arc::clone(&active.writer), Arc::clone(&active.codec))
        };
        if self.inner.settings.config.require_auth() && !codec.is_authenticated() {
            return Err(TransportError::NotAuthenticated);
        }

        message.fill_defaults();
        if message.from.is_empty() {
            if let Some(identity) = &self.inner.settings.identity {
                message.from = identity.fingerprint().to_string();
            }
        }
        let message_id = message.id.clone();
        let bytes = codec.encode(message)?.encode()?;

        let mut writer = writer.lock().await;
        write_frame(&mut *writer, &bytes).await?;
        debug!(connection = %id, message_id = %message_id, "Sent message");
        Ok(message_id)
    }

    /// Subscribe to inbound messages.
    pub fn on_message(&self) -> Subscription {
        self.inner.handlers.subscribe()
    }

    /// Cancel any pending reconnect, close the socket and drop the session.
    pub async fn disconnect(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.cancel_reconnect();

        let active = self.inner.connection.lock().await.take();
        if let Some(active) = active {
            active.reader.abort();
            let mut writer = active.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!(connection = %active.id, error = %e, "Shutdown after disconnect failed");
            }
            info!(connection = %active.id, host = %self.host().id, "Disconnected");
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            *self.inner.state.borrow(),
            ConnectionState::Connected { .. }
        )
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(
            *self.inner.state.borrow(),
            ConnectionState::Connected {
                authenticated: true,
                ..
            }
        )
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(
            *self.inner.state.borrow(),
            ConnectionState::Connected {
                encrypted: true,
                ..
            }
        )
    }

    pub fn server_fingerprint(&self) -> Option<String> {
        match &*self.inner.state.borrow() {
            ConnectionState::Connected {
                server_fingerprint, ..
            } => server_fingerprint.clone(),
            _ => None,
        }
    }

    /// Connection attempts made so far, including reconnects.
    pub fn connection_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

impl Drop for SecureTransportClient {
    fn drop(&mut self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.cancel_reconnect();
        if let Ok(mut slot) = self.inner.connection.try_lock() {
            if let Some(active) = slot.take() {
                active.reader.abort();
            }
        }
    }
}

impl ClientInner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn cancel_reconnect(&self) {
        let task = self
            .reconnect_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<(), TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ConnectionState::Connecting { attempt });

        let result = self.open().await;
        if let Err(e) = &result {
            debug!(host = %self.settings.host.id, attempt, error = %e, "Connect failed");
            self.set_state(ConnectionState::Disconnected);
        }
        result
    }

    async fn open(self: &Arc<Self>) -> Result<(), TransportError> {
        let host = &self.settings.host;
        let options = &self.settings.options;
        let addr = host.socket_addr_string();

        let tcp = timeout(options.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout("connect"))??;
        tcp.set_nodelay(true)?;

        let stream: BoxedStream = match &self.tls {
            Some(config) => {
                let name = ServerName::try_from(host.server_name())
                    .map_err(|_| TransportError::InvalidServerName(host.server_name()))?;
                let connector = TlsConnector::from(Arc::clone(config));
                let tls = timeout(options.connect_timeout, connector.connect(name, tcp))
                    .await
                    .map_err(|_| TransportError::Timeout("TLS handshake"))??;
                Box::new(tls)
            }
            None => Box::new(tcp),
        };
        let (mut reader, mut writer) = split(stream);

        let mut codec = WireCodec::new(self.settings.identity.clone(), &self.settings.config);
        if self.settings.config.require_auth() {
            let auth = self
                .auth
                .as_ref()
                .ok_or(TransportError::Config(ConfigError::MissingIdentity))?;
            self.set_state(ConnectionState::Authenticating);
            let server = timeout(
                options.handshake_timeout,
                client_handshake(auth, &mut reader, &mut writer),
            )
            .await
            .map_err(|_| TransportError::Timeout("handshake"))??;
            codec.establish(server)?;
        }

        let id = ConnectionId::next();
        let codec = Arc::new(codec);
        let writer = Arc::new(Mutex::new(writer));

        let mut slot = self.connection.lock().await;
        if self.closing.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let reader = tokio::spawn(Arc::clone(self).read_loop(id, reader, Arc::clone(&codec)));
        *slot = Some(ActiveConnection {
            id,
            writer,
            codec: Arc::clone(&codec),
            reader,
        });

        let server_fingerprint = codec.peer().map(|peer| peer.fingerprint.clone());
        info!(
            connection = %id,
            host = %host.id,
            addr = %addr,
            authenticated = codec.is_authenticated(),
            encrypted = codec.is_encrypted(),
            server = server_fingerprint.as_deref().unwrap_or("-"),
            "Connected"
        );
        self.set_state(ConnectionState::Connected {
            authenticated: codec.is_authenticated(),
            encrypted: codec.is_encrypted(),
            server_fingerprint,
        });
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        id: ConnectionId,
        mut reader: ReadHalf<BoxedStream>,
        codec: Arc<WireCodec>,
    ) {
        loop {
            let bytes = match read_frame(&mut reader).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    debug!(connection = %id, "Server closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(connection = %id, error = %e, "Connection read failed");
                    break;
                }
            };

            let frame = match Frame::decode(&bytes) {
                Ok(frame) => frame,
                Err(e) if !e.is_fatal() => {
                    warn!(connection = %id, error = %e, "Dropping malformed frame");
                    continue;
                }
                Err(e) => {
                    warn!(connection = %id, error = %e, "Unreadable frame, closing");
                    break;
                }
            };
            match codec.decode(frame) {
                Ok((message, sender_fingerprint)) => {
                    self.handlers.dispatch(InboundMessage {
                        message,
                        connection: id,
                        sender_fingerprint,
                    });
                }
                Err(reason) => {
                    debug!(connection = %id, %reason, "Dropping inbound envelope");
                }
            }
        }

        self.connection_lost(id).await;
    }

    async fn connection_lost(self: &Arc<Self>, id: ConnectionId) {
        {
            let mut slot = self.connection.lock().await;
            match slot.as_ref() {
                Some(active) if active.id == id => {
                    slot.take();
                }
                _ => return,
            }
        }

        if self.closing.load(Ordering::SeqCst) || !self.settings.options.reconnect {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        info!(connection = %id, host = %self.settings.host.id, "Connection lost, reconnecting");
        let task = tokio::spawn(Self::reconnect_loop(Arc::clone(self)));
        *self
            .reconnect_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    // Boxed: this future is spawned from the read loop, which establish() itself spawns.
    fn reconnect_loop(inner: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let max = inner.settings.options.max_reconnect_attempts;
            for attempt in 1..=max {
                let delay = inner.settings.options.reconnect_delay(attempt);
                debug!(attempt, ?delay, "Waiting before reconnect");
                sleep(delay).await;
                if inner.closing.load(Ordering::SeqCst) {
                    return;
                }

                match inner.establish().await {
                    Ok(()) => {
                        info!(attempt, host = %inner.settings.host.id, "Reconnected");
                        return;
                    }
                    Err(e) if e.is_permanent() => {
                        warn!(error = %e, "Reconnect rejected, giving up");
                        inner.set_state(ConnectionState::Disconnected);
                        return;
                    }
                    Err(e) => debug!(attempt, error = %e, "Reconnect attempt failed"),
                }
            }

            warn!(attempts = max, host = %inner.settings.host.id, "Reconnect attempts exhausted");
            inner.set_state(ConnectionState::ReconnectExhausted { attempts: max });
        })
    }
}

async fn client_handshake(
    auth: &AuthManager,
    reader: &mut ReadHalf<BoxedStream>,
    writer: &mut WriteHalf<BoxedStream>,
) -> Result<VerifiedPeer, TransportError> {
    let challenge = match read_auth_frame(reader).await? {
        AuthFrame::Challenge(challenge) => challenge,
        AuthFrame::Failed { error } => return Err(TransportError::AuthRejected(error)),
        other => {
            return Err(TransportError::Handshake(format!(
                "expected auth:challenge, got {}",
                other.type_name()
            )))
        }
    };

    let response = auth.respond_to_challenge(&challenge)?;
    write_auth_frame(writer, AuthFrame::Response(response)).await?;

    match read_auth_frame(reader).await? {
        AuthFrame::Success {
            server_fingerprint,
            server_public_key,
            proof,
        } => Ok(auth.verify_server(&challenge, &server_public_key, &server_fingerprint, &proof)?),
        AuthFrame::Failed { error } => Err(TransportError::AuthRejected(error)),
        other => Err(TransportError::Handshake(format!(
            "expected auth:success, got {}",
            other.type_name()
        ))),
    }
}
