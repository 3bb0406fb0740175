//! Listening side: accepts sockets, runs one handshake per socket and keeps
//! the registry of authenticated peers.

use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::{split, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::codec::WireCodec;
use super::framing::{read_frame, write_frame};
use super::messages::{AuthFrame, Frame, TransportMessage};
use super::subscribers::{HandlerRegistry, Subscription};
use super::{
    read_auth_frame, write_auth_frame, BoxedStream, ConnectionId, InboundMessage, TransportError,
};
use crate::auth::{AuthChallenge, AuthError, AuthManager, VerifiedPeer};
use crate::config::{ConfigError, MeshSecurityConfig, TlsMode, TransportOptions};
use crate::identity::{PeerIdentity, PeerPublicKey, Signer};
use crate::keystore::Keystore;
use crate::tls::TlsManager;
use crate::utils::now_millis;

/// Host id used for the certificate when the server has no identity.
const ANONYMOUS_HOST_ID: &str = "mesh-node";

/// One accepted, registered connection.
struct AuthenticatedClient {
    id: ConnectionId,
    remote_addr: SocketAddr,
    fingerprint: Option<String>,
    public_key: Option<PeerPublicKey>,
    codec: WireCodec,
    writer: Mutex<WriteHalf<BoxedStream>>,
    connected_at: u64,
}

impl AuthenticatedClient {
    async fn send(&self, message: TransportMessage) -> Result<(), TransportError> {
        let bytes = self.codec.encode(message)?.encode()?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &bytes).await?;
        Ok(())
    }
}

/// Public view of a registered client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub connection: u64,
    pub remote_addr: SocketAddr,
    pub fingerprint: Option<String>,
    pub public_key: Option<String>,
    pub encrypted: bool,
    pub connected_at: u64,
}

#[derive(Clone)]
struct ServerSettings {
    bind_addr: IpAddr,
    port: u16,
    config: Arc<MeshSecurityConfig>,
    options: TransportOptions,
    identity: Option<Arc<PeerIdentity>>,
    keystore: Option<Arc<Keystore>>,
    tls_manager: Option<TlsManager>,
}

type Registry = Arc<RwLock<HashMap<ConnectionId, Arc<AuthenticatedClient>>>>;

/// Everything a connection task needs.
struct ServerContext {
    settings: ServerSettings,
    auth: Option<AuthManager>,
    acceptor: Option<TlsAcceptor>,
    clients: Registry,
    tasks: Arc<StdMutex<HashMap<ConnectionId, JoinHandle<()>>>>,
    handlers: HandlerRegistry,
    stopping: Arc<AtomicBool>,
}

/// Server side of the secure transport.
pub struct SecureTransportServer {
    settings: ServerSettings,
    clients: Registry,
    tasks: Arc<StdMutex<HashMap<ConnectionId, JoinHandle<()>>>>,
    handlers: HandlerRegistry,
    stopping: Arc<AtomicBool>,
    listener: Mutex<Option<(SocketAddr, JoinHandle<()>)>>,
}

impl SecureTransportServer {
    /// `port` 0 picks a free port; see [`local_addr`](Self::local_addr).
    pub fn new(
        port: u16,
        config: Arc<MeshSecurityConfig>,
        identity: Option<Arc<PeerIdentity>>,
    ) -> Result<Self, TransportError> {
        Self::from_settings(ServerSettings {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            config,
            options: TransportOptions::default(),
            identity,
            keystore: None,
            tls_manager: None,
        })
    }

    pub fn with_options(self, options: TransportOptions) -> Result<Self, TransportError> {
        let mut settings = self.settings.clone();
        settings.options = options;
        let mut server = Self::from_settings(settings)?;
        server.handlers = self.handlers.clone();
        Ok(server)
    }

    /// Reject clients revoked in this keystore. Self-signed certificates are
    /// also kept under `<keystore>/tls` unless a TLS manager is given.
    pub fn with_keystore(mut self, keystore: Arc<Keystore>) -> Self {
        self.settings.keystore = Some(keystore);
        self
    }

    pub fn with_tls_manager(mut self, manager: TlsManager) -> Self {
        self.settings.tls_manager = Some(manager);
        self
    }

    pub fn with_bind_address(mut self, addr: IpAddr) -> Self {
        self.settings.bind_addr = addr;
        self
    }

    fn from_settings(settings: ServerSettings) -> Result<Self, TransportError> {
        settings.config.validate()?;
        settings.options.validate()?;
        if settings.config.require_auth() && settings.identity.is_none() {
            return Err(ConfigError::MissingIdentity.into());
        }

        Ok(Self {
            settings,
            clients: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(StdMutex::new(HashMap::new())),
            handlers: HandlerRegistry::new(),
            stopping: Arc::new(AtomicBool::new(false)),
            listener: Mutex::new(None),
        })
    }

    /// Bind and start accepting.
    pub async fn start(&self) -> Result<SocketAddr, TransportError> {
        let mut listener_slot = self.listener.lock().await;
        if listener_slot.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let acceptor = self.tls_acceptor()?;
        let auth = self.settings.identity.as_ref().map(|identity| {
            let manager = AuthManager::new(Arc::clone(identity), &self.settings.options);
            match &self.settings.keystore {
                Some(keystore) => manager.with_keystore(Arc::clone(keystore)),
                None => manager,
            }
        });

        let listener =
            TcpListener::bind(SocketAddr::new(self.settings.bind_addr, self.settings.port)).await?;
        let local_addr = listener.local_addr()?;
        self.stopping.store(false, Ordering::SeqCst);

        let ctx = Arc::new(ServerContext {
            settings: self.settings.clone(),
            auth,
            acceptor,
            clients: Arc::clone(&self.clients),
            tasks: Arc::clone(&self.tasks),
            handlers: self.handlers.clone(),
            stopping: Arc::clone(&self.stopping),
        });

        let handle = tokio::spawn(accept_loop(ctx, listener));
        *listener_slot = Some((local_addr, handle));

        info!(
            addr = %local_addr,
            tls = ?self.settings.config.tls(),
            require_auth = self.settings.config.require_auth(),
            encryption = %self.settings.config.encryption(),
            "Listening"
        );
        Ok(local_addr)
    }

    fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, TransportError> {
        let transport = &self.settings.config.transport;
        let manager = match (&self.settings.tls_manager, &self.settings.keystore) {
            (Some(manager), _) => manager.clone(),
            (None, Some(keystore)) => TlsManager::new(keystore.dir().join("tls")),
            (None, None) => TlsManager::new(std::env::temp_dir().join("secure-mesh-tls")),
        };

        let info = match (transport.tls, &transport.cert_path, &transport.key_path) {
            (TlsMode::None, _, _) => return Ok(None),
            (TlsMode::Custom, Some(cert), Some(key)) => manager.load_custom(cert, key)?,
            (TlsMode::Custom, _, _) => return Err(ConfigError::MissingCustomCertificate.into()),
            (TlsMode::SelfSigned, _, _) => {
                let host_id = self
                    .settings
                    .identity
                    .as_ref()
                    .map(|identity| identity.fingerprint().to_string())
                    .unwrap_or_else(|| ANONYMOUS_HOST_ID.to_string());
                manager.load_or_create_certificate(&host_id, &host_id)?
            }
        };
        Ok(Some(TlsAcceptor::from(manager.server_config(&info)?)))
    }

    /// Address actually bound, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(|(addr, _)| *addr)
    }

    pub fn on_message(&self) -> Subscription {
        self.handlers.subscribe()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn clients(&self) -> Vec<PeerSummary> {
        let clients = self.clients.read().await;
        let mut summaries: Vec<PeerSummary> = clients
            .values()
            .map(|client| PeerSummary {
                connection: client.id.as_u64(),
                remote_addr: client.remote_addr,
                fingerprint: client.fingerprint.clone(),
                public_key: client.public_key.map(|key| key.to_hex()),
                encrypted: client.codec.is_encrypted(),
                connected_at: client.connected_at,
            })
            .collect();
        summaries.sort_by_key(|summary| summary.connection);
        summaries
    }

    /// Send to one connection. `Ok(false)` if it is unknown or the write failed.
    pub async fn send_to(
        &self,
        connection: ConnectionId,
        mut message: TransportMessage,
    ) -> Result<bool, TransportError> {
        if message.is_reserved() {
            return Err(TransportError::ReservedType(message.kind));
        }
        let Some(client) = self.clients.read().await.get(&connection).cloned() else {
            return Ok(false);
        };

        self.stamp(&mut message);
        match client.send(message).await {
            Ok(()) => Ok(true),
            Err(TransportError::Io(e)) | Err(TransportError::Frame(super::FrameError::Io(e))) => {
                debug!(connection = %connection, error = %e, "Unicast write failed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Send to every registered client, each in its own wire form. Returns
    /// the number of successful deliveries.
    pub async fn broadcast(&self, mut message: TransportMessage) -> Result<usize, TransportError> {
        if message.is_reserved() {
            return Err(TransportError::ReservedType(message.kind));
        }
        self.stamp(&mut message);

        let clients: Vec<Arc<AuthenticatedClient>> =
            self.clients.read().await.values().cloned().collect();
        let mut delivered = 0;
        for client in clients {
            match client.send(message.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(connection = %client.id, error = %e, "Broadcast delivery failed"),
            }
        }
        Ok(delivered)
    }

    fn stamp(&self, message: &mut TransportMessage) {
        message.fill_defaults();
        if message.from.is_empty() {
            if let Some(identity) = &self.settings.identity {
                message.from = identity.fingerprint().to_string();
            }
        }
    }

    /// Close every client socket, clear the registry, then stop listening.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);

        let clients: Vec<Arc<AuthenticatedClient>> =
            self.clients.write().await.drain().map(|(_, c)| c).collect();
        for client in &clients {
            let mut writer = client.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!(connection = %client.id, error = %e, "Shutdown on stop failed");
            }
        }

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in tasks {
            task.abort();
        }

        if let Some((addr, handle)) = self.listener.lock().await.take() {
            handle.abort();
            info!(addr = %addr, closed = clients.len(), "Stopped listening");
        }
    }
}

impl Drop for SecureTransportServer {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.listener.try_lock() {
            if let Some((_, handle)) = slot.take() {
                handle.abort();
            }
        }
        for (_, task) in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            task.abort();
        }
    }
}

async fn accept_loop(ctx: Arc<ServerContext>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if ctx.stopping.load(Ordering::SeqCst) {
                    break;
                }
                let id = ConnectionId::next();
                debug!(connection = %id, peer = %addr, "Accepted connection");

                let task = tokio::spawn(handle_connection(Arc::clone(&ctx), id, stream, addr));
                let mut tasks = ctx.tasks.lock().unwrap_or_else(PoisonError::into_inner);
                tasks.retain(|_, task| !task.is_finished());
                tasks.insert(id, task);
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
            }
        }
    }
}

async fn handle_connection(
    ctx: Arc<ServerContext>,
    id: ConnectionId,
    tcp: TcpStream,
    addr: SocketAddr,
) {
    if let Err(e) = serve_connection(&ctx, id, tcp, addr).await {
        info!(connection = %id, peer = %addr, error = %e, "Connection closed");
    }

    if ctx.clients.write().await.remove(&id).is_some() {
        debug!(connection = %id, "Deregistered client");
    }
    ctx.tasks
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
}

async fn serve_connection(
    ctx: &Arc<ServerContext>,
    id: ConnectionId,
    tcp: TcpStream,
    addr: SocketAddr,
) -> Result<(), TransportError> {
    tcp.set_nodelay(true)?;
    let options = &ctx.settings.options;

    let stream: BoxedStream = match &ctx.acceptor {
        Some(acceptor) => {
            let tls = timeout(options.handshake_timeout, acceptor.accept(tcp))
                .await
                .map_err(|_| TransportError::Timeout("TLS accept"))??;
            Box::new(tls)
        }
        None => Box::new(tcp),
    };
    let (mut reader, mut writer) = split(stream);

    let mut codec = WireCodec::new(ctx.settings.identity.clone(), &ctx.settings.config);
    let mut issued = None;
    if ctx.settings.config.require_auth() {
        let auth = ctx
            .auth
            .as_ref()
            .ok_or(TransportError::Config(ConfigError::MissingIdentity))?;

        match server_handshake(auth, options.handshake_timeout, &mut reader, &mut writer).await {
            Ok((peer, challenge)) => {
                codec.establish(peer)?;
                issued = Some(challenge);
            }
            Err(e) => {
                warn!(connection = %id, peer = %addr, error = %e, "Authentication failed");
                let failed = AuthFrame::Failed {
                    error: e.to_string(),
                };
                if write_auth_frame(&mut writer, failed).await.is_ok() {
                    if let Err(e) = writer.shutdown().await {
                        debug!(connection = %id, error = %e, "Shutdown after auth:failed failed");
                    }
                }
                return Err(e);
            }
        }
    }

    let peer = codec.peer().cloned();
    let client = Arc::new(AuthenticatedClient {
        id,
        remote_addr: addr,
        fingerprint: peer.as_ref().map(|p| p.fingerprint.clone()),
        public_key: peer.as_ref().map(|p| p.public_key),
        codec,
        writer: Mutex::new(writer),
        connected_at: now_millis(),
    });

    // Registered before success is announced, so a client whose connect()
    // has resolved is already visible to broadcast(). The writer stays locked
    // until auth:success is flushed so no envelope can overtake it.
    {
        let mut writer = client.writer.lock().await;
        {
            let mut clients = ctx.clients.write().await;
            if ctx.stopping.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            clients.insert(id, Arc::clone(&client));
        }

        if let (Some(auth), Some(challenge), Some(peer)) = (&ctx.auth, &issued, &peer) {
            let identity = auth.identity();
            let success = AuthFrame::Success {
                server_fingerprint: identity.fingerprint().to_string(),
                server_public_key: identity.public_key_hex(),
                proof: auth.prove_identity(challenge, &peer.fingerprint),
            };
            write_auth_frame(&mut *writer, success).await?;
        }
    }

    info!(
        connection = %id,
        peer = %addr,
        fingerprint = client.fingerprint.as_deref().unwrap_or("-"),
        encrypted = client.codec.is_encrypted(),
        "Client registered"
    );

    read_loop(ctx, &client, reader).await
}

async fn server_handshake(
    auth: &AuthManager,
    limit: Duration,
    reader: &mut ReadHalf<BoxedStream>,
    writer: &mut WriteHalf<BoxedStream>,
) -> Result<(VerifiedPeer, AuthChallenge), TransportError> {
    let mut handshake = auth.begin();
    let challenge = handshake
        .challenge()
        .cloned()
        .ok_or(TransportError::Auth(AuthError::AlreadyCompleted))?;

    let exchange = async {
        write_auth_frame(&mut *writer, AuthFrame::Challenge(challenge.clone())).await?;
        read_auth_frame(&mut *reader).await
    };
    let outcome = timeout(limit, exchange).await;
    let failure = match outcome {
        Ok(Ok(AuthFrame::Response(response))) => {
            let peer = handshake.complete(&response)?;
            return Ok((peer, challenge));
        }
        Ok(Ok(other)) => TransportError::Handshake(format!(
            "expected auth:response, got {}",
            other.type_name()
        )),
        Ok(Err(e)) => e,
        Err(_) => TransportError::Timeout("handshake"),
    };

    handshake.reject(AuthError::Abandoned(failure.to_string()));
    debug!(state = ?handshake.state(), "Server handshake abandoned");
    Err(failure)
}

async fn read_loop(
    ctx: &Arc<ServerContext>,
    client: &AuthenticatedClient,
    mut reader: ReadHalf<BoxedStream>,
) -> Result<(), TransportError> {
    loop {
        let Some(bytes) = read_frame(&mut reader).await? else {
            debug!(connection = %client.id, "Client closed the connection");
            return Ok(());
        };

        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) if !e.is_fatal() => {
                warn!(connection = %client.id, error = %e, "Dropping malformed frame");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        match client.codec.decode(frame) {
            Ok((message, sender_fingerprint)) => {
                ctx.handlers.dispatch(InboundMessage {
                    message,
                    connection: client.id,
                    sender_fingerprint,
                });
            }
            Err(reason) => {
                debug!(connection = %client.id, %reason, "Dropping inbound envelope");
            }
        }
    }
}
