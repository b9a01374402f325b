//! The encrypted RPC connection core
//!
//! One [`Connection`] per transport, shared by server and peer endpoints:
//! a string-keyed handler registry, an outbound request map correlated by
//! sender-monotonic ids, the hybrid encryption pipeline with its per-
//! connection key caches, and a reader task that dispatches inbound
//! envelopes sequentially. A server-side owner may install a [`Router`]
//! to divert envelopes addressed to other peers before local dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use concord_crypto::{seal, ContentKey, Fingerprint, KeyPair, PublicIdentity, SealedPayload};
use concord_protocol::codec::EnvelopeCodec;
use concord_protocol::{Body, Content, Envelope, PeerId, ProtocolError, Target};
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::cache::KeyCaches;
use crate::error::ConnectionError;
use crate::transport::Transport;
use crate::Result;

/// Default deadline for outbound requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection lifecycle states
///
/// `Disposing` covers the teardown window: pending requests are being
/// failed and the transport closed; no new sends are admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Constructing,
    Ready,
    Disposing,
    Disposed,
}

type RequestHandler = Arc<
    dyn Fn(Option<PeerId>, Vec<u8>) -> BoxFuture<'static, std::result::Result<Vec<u8>, String>>
        + Send
        + Sync,
>;
type EventHandler = Arc<dyn Fn(Option<PeerId>, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Hook for diverting inbound envelopes before local dispatch
///
/// The relay server installs one per peer connection: envelopes addressed
/// to other peers are forwarded and consumed (`None`); envelopes for the
/// server come back (`Some`) and dispatch locally.
pub trait Router: Send + Sync + 'static {
    /// Route one decoded envelope
    fn route(&self, envelope: Envelope) -> BoxFuture<'static, Option<Envelope>>;
}

struct RosterEntry {
    identity: PublicIdentity,
    fingerprint: Fingerprint,
}

struct Shared {
    keypair: KeyPair,
    request_timeout: Duration,
    next_id: AtomicU64,
    disposed: AtomicBool,
    content_key: Mutex<ContentKey>,
    caches: Mutex<KeyCaches>,
    roster: Mutex<HashMap<PeerId, RosterEntry>>,
    server_identity: Mutex<Option<PublicIdentity>>,
    local_id: Mutex<Option<PeerId>>,
    request_handlers: Mutex<HashMap<String, RequestHandler>>,
    notification_handlers: Mutex<HashMap<String, EventHandler>>,
    broadcast_handlers: Mutex<HashMap<String, EventHandler>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<std::result::Result<Vec<u8>, ConnectionError>>>>,
    reader: Mutex<Option<mpsc::Receiver<Bytes>>>,
    writer: Mutex<Option<mpsc::Sender<Bytes>>>,
    router: Mutex<Option<Arc<dyn Router>>>,
    lifecycle_tx: watch::Sender<Lifecycle>,
    lifecycle_rx: watch::Receiver<Lifecycle>,
    disconnect_tx: broadcast::Sender<()>,
    error_tx: broadcast::Sender<String>,
    seal_ops: AtomicU64,
}

/// Handle to one live connection
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Attach the connection core to a transport
    ///
    /// The reader does not run until [`Connection::start`] is called, so
    /// the owner can register its handlers without racing inbound frames.
    pub fn attach(keypair: KeyPair, transport: Transport) -> Self {
        Self::attach_with_timeout(keypair, transport, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Attach with a custom request deadline
    pub fn attach_with_timeout(
        keypair: KeyPair,
        transport: Transport,
        request_timeout: Duration,
    ) -> Self {
        let (writer, inbound) = transport.split();
        let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Constructing);
        let (disconnect_tx, _) = broadcast::channel(16);
        let (error_tx, _) = broadcast::channel(16);

        let shared = Arc::new(Shared {
            keypair,
            request_timeout,
            next_id: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            content_key: Mutex::new(ContentKey::generate()),
            caches: Mutex::new(KeyCaches::new()),
            roster: Mutex::new(HashMap::new()),
            server_identity: Mutex::new(None),
            local_id: Mutex::new(None),
            request_handlers: Mutex::new(HashMap::new()),
            notification_handlers: Mutex::new(HashMap::new()),
            broadcast_handlers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            reader: Mutex::new(Some(inbound)),
            writer: Mutex::new(Some(writer)),
            router: Mutex::new(None),
            lifecycle_tx,
            lifecycle_rx,
            disconnect_tx,
            error_tx,
            seal_ops: AtomicU64::new(0),
        });

        Self { shared }
    }

    /// Start draining the transport; idempotent
    pub fn start(&self) {
        let inbound = self.shared.reader.lock().unwrap().take();
        if let Some(inbound) = inbound {
            tokio::spawn(read_loop(Arc::clone(&self.shared), inbound));
        }
    }

    /// Our public identity
    pub fn public_identity(&self) -> PublicIdentity {
        self.shared.keypair.public()
    }

    /// Our identity fingerprint
    pub fn fingerprint(&self) -> Fingerprint {
        self.shared.keypair.fingerprint()
    }

    /// The server-assigned peer id, once known
    pub fn local_id(&self) -> Option<PeerId> {
        self.shared.local_id.lock().unwrap().clone()
    }

    /// Record the server-assigned peer id
    pub fn set_local_id(&self, id: PeerId) {
        *self.shared.local_id.lock().unwrap() = Some(id);
    }

    /// Record the relay server's identity for sealing server-bound traffic
    pub fn set_server_identity(&self, identity: PublicIdentity) {
        *self.shared.server_identity.lock().unwrap() = Some(identity);
    }

    /// The relay server's identity, once known
    pub fn server_identity(&self) -> Option<PublicIdentity> {
        self.shared.server_identity.lock().unwrap().clone()
    }

    /// Add a peer to the known roster; drops both key caches
    pub fn add_peer(&self, id: PeerId, identity: PublicIdentity) {
        let fingerprint = identity.fingerprint();
        self.shared.roster.lock().unwrap().insert(
            id,
            RosterEntry {
                identity,
                fingerprint,
            },
        );
        self.shared.caches.lock().unwrap().clear();
    }

    /// Remove a peer from the roster; drops both key caches
    pub fn remove_peer(&self, id: &PeerId) {
        self.shared.roster.lock().unwrap().remove(id);
        self.shared.caches.lock().unwrap().clear();
    }

    /// Number of peers currently known
    pub fn known_peers(&self) -> usize {
        self.shared.roster.lock().unwrap().len()
    }

    /// Asymmetric seal operations performed so far (cache misses)
    pub fn seal_operations(&self) -> u64 {
        self.shared.seal_ops.load(Ordering::Relaxed)
    }

    /// Install the relay router hook
    pub fn set_router(&self, router: Arc<dyn Router>) {
        *self.shared.router.lock().unwrap() = Some(router);
    }

    /// Release the ready barrier; idempotent, ignored after disposal
    pub fn mark_ready(&self) {
        self.shared.lifecycle_tx.send_if_modified(|state| {
            if *state == Lifecycle::Constructing {
                *state = Lifecycle::Ready;
                true
            } else {
                false
            }
        });
    }

    /// Whether the handshake has completed
    pub fn is_ready(&self) -> bool {
        *self.shared.lifecycle_rx.borrow() == Lifecycle::Ready
    }

    /// Whether the connection has been disposed
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Register the request handler for `method`; replaces any previous one
    pub fn on_request<P, R, F, Fut>(&self, method: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(Option<PeerId>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, String>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: RequestHandler = Arc::new(move |origin, payload| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let params: P = postcard::from_bytes(&payload)
                    .map_err(|e| format!("invalid parameters: {e}"))?;
                let result = handler(origin, params).await?;
                postcard::to_stdvec(&result).map_err(|e| format!("serialize response: {e}"))
            })
        });
        self.shared
            .request_handlers
            .lock()
            .unwrap()
            .insert(method.to_string(), erased);
    }

    /// Register the notification handler for `method`
    pub fn on_notification<P, F, Fut>(&self, method: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(Option<PeerId>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let erased = erase_event_handler(method, handler);
        self.shared
            .notification_handlers
            .lock()
            .unwrap()
            .insert(method.to_string(), erased);
    }

    /// Register the broadcast handler for `method`
    pub fn on_broadcast<P, F, Fut>(&self, method: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(Option<PeerId>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let erased = erase_event_handler(method, handler);
        self.shared
            .broadcast_handlers
            .lock()
            .unwrap()
            .insert(method.to_string(), erased);
    }

    /// Send an encrypted request and await its correlated response
    pub async fn send_request<P, R>(&self, method: &str, target: Target, params: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let timeout = self.shared.request_timeout;
        self.send_request_with_timeout(method, target, params, timeout)
            .await
    }

    /// Send an encrypted request with an explicit deadline
    pub async fn send_request_with_timeout<P, R>(
        &self,
        method: &str,
        target: Target,
        params: &P,
        timeout: Duration,
    ) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.wait_ready().await?;
        let recipient = self.resolve_recipient(&target)?;
        let content = Content::new(method, params)?;
        let body = Body::Sealed(seal_content(&self.shared, &content, &[recipient])?);
        let (id, rx) = self.register_request();
        let envelope = Envelope::Request {
            id,
            origin: self.local_id(),
            target,
            body,
        };
        if let Err(e) = write_envelope(&self.shared, envelope).await {
            self.shared.pending.lock().unwrap().remove(&id);
            return Err(e);
        }
        self.await_response(id, rx, timeout).await
    }

    /// Send a cleartext request to the server; handshake use only
    pub async fn send_clear_request<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let content = Content::new(method, params)?;
        let (id, rx) = self.register_request();
        let envelope = Envelope::Request {
            id,
            origin: None,
            target: Target::Server,
            body: Body::Clear(content),
        };
        if let Err(e) = write_envelope(&self.shared, envelope).await {
            self.shared.pending.lock().unwrap().remove(&id);
            return Err(e);
        }
        self.await_response(id, rx, self.shared.request_timeout)
            .await
    }

    /// Send an encrypted fire-and-forget notification
    pub async fn send_notification<P: Serialize>(
        &self,
        method: &str,
        target: Target,
        params: &P,
    ) -> Result<()> {
        self.wait_ready().await?;
        let recipient = self.resolve_recipient(&target)?;
        let content = Content::new(method, params)?;
        let body = Body::Sealed(seal_content(&self.shared, &content, &[recipient])?);
        write_envelope(
            &self.shared,
            Envelope::Notification {
                origin: self.local_id(),
                target,
                body,
            },
        )
        .await
    }

    /// Send a cleartext notification; handshake use only
    pub async fn send_clear_notification<P: Serialize>(
        &self,
        method: &str,
        target: Target,
        params: &P,
    ) -> Result<()> {
        let content = Content::new(method, params)?;
        write_envelope(
            &self.shared,
            Envelope::Notification {
                origin: None,
                target,
                body: Body::Clear(content),
            },
        )
        .await
    }

    /// Broadcast to every known peer; silently skipped on an empty roster
    pub async fn send_broadcast<P: Serialize>(&self, method: &str, params: &P) -> Result<()> {
        self.wait_ready().await?;
        let recipients: Vec<(Fingerprint, PublicIdentity)> = {
            let roster = self.shared.roster.lock().unwrap();
            roster
                .values()
                .map(|e| (e.fingerprint, e.identity.clone()))
                .collect()
        };
        if recipients.is_empty() {
            // An asymmetric seal needs at least one recipient
            debug!("skipping broadcast of {method}: no known peers");
            return Ok(());
        }
        let content = Content::new(method, params)?;
        let body = Body::Sealed(seal_content(&self.shared, &content, &recipients)?);
        write_envelope(
            &self.shared,
            Envelope::Broadcast {
                origin: self.local_id(),
                body,
            },
        )
        .await
    }

    /// Send an encrypted out-of-band error report
    pub async fn send_error(&self, target: Target, message: &str) -> Result<()> {
        let recipient = self.resolve_recipient(&target)?;
        let content = Content::new("", &message)?;
        let body = Body::Sealed(seal_content(&self.shared, &content, &[recipient])?);
        write_envelope(
            &self.shared,
            Envelope::Error {
                origin: self.local_id(),
                body,
            },
        )
        .await
    }

    /// Send a cleartext error report; handshake use only
    pub async fn send_clear_error(&self, message: &str) -> Result<()> {
        let content = Content::new("", &message)?;
        write_envelope(
            &self.shared,
            Envelope::Error {
                origin: None,
                body: Body::Clear(content),
            },
        )
        .await
    }

    /// Write an envelope verbatim; the relay's ciphertext forwarding path
    pub async fn forward(&self, envelope: Envelope) -> Result<()> {
        write_envelope(&self.shared, envelope).await
    }

    /// Subscribe to the disconnect event
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.shared.disconnect_tx.subscribe()
    }

    /// Subscribe to connection and remote error reports
    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.shared.error_tx.subscribe()
    }

    /// Tear the connection down; idempotent
    ///
    /// Fails every pending request with `Disconnected`, clears handlers,
    /// closes the transport, and fires the disconnect event.
    pub fn dispose(&self) {
        dispose_inner(&self.shared);
    }

    async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.shared.lifecycle_rx.clone();
        let state = rx
            .wait_for(|s| *s != Lifecycle::Constructing)
            .await
            .map_err(|_| ConnectionError::Disconnected)?;
        if *state == Lifecycle::Ready {
            Ok(())
        } else {
            Err(ConnectionError::Disconnected)
        }
    }

    fn register_request(
        &self,
    ) -> (
        u64,
        oneshot::Receiver<std::result::Result<Vec<u8>, ConnectionError>>,
    ) {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    async fn await_response<R: DeserializeOwned>(
        &self,
        id: u64,
        rx: oneshot::Receiver<std::result::Result<Vec<u8>, ConnectionError>>,
        timeout: Duration,
    ) -> Result<R> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(payload))) => postcard::from_bytes(&payload)
                .map_err(|e| ConnectionError::Protocol(ProtocolError::Payload(e.to_string()))),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(ConnectionError::Disconnected),
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&id);
                Err(ConnectionError::Timeout)
            }
        }
    }

    fn resolve_recipient(&self, target: &Target) -> Result<(Fingerprint, PublicIdentity)> {
        match target {
            Target::Server => {
                let identity = self
                    .shared
                    .server_identity
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| {
                        ConnectionError::Handshake("server identity not yet known".into())
                    })?;
                Ok((identity.fingerprint(), identity))
            }
            Target::Peer(id) => {
                let roster = self.shared.roster.lock().unwrap();
                let entry = roster
                    .get(id)
                    .ok_or_else(|| ConnectionError::UnknownPeer(id.clone()))?;
                Ok((entry.fingerprint, entry.identity.clone()))
            }
            Target::All => Err(ConnectionError::Handshake(
                "unicast target cannot be the whole room".into(),
            )),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_id", &self.local_id())
            .field("ready", &self.is_ready())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn erase_event_handler<P, F, Fut>(method: &str, handler: F) -> EventHandler
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(Option<PeerId>, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let method = method.to_string();
    let handler = Arc::new(handler);
    Arc::new(move |origin, payload| {
        let handler = Arc::clone(&handler);
        let method = method.clone();
        Box::pin(async move {
            match postcard::from_bytes::<P>(&payload) {
                Ok(params) => handler(origin, params).await,
                Err(e) => warn!("dropping {method}: invalid parameters: {e}"),
            }
        })
    })
}

async fn read_loop(shared: Arc<Shared>, mut inbound: mpsc::Receiver<Bytes>) {
    let mut codec = EnvelopeCodec::new();
    let mut buf = BytesMut::new();

    while let Some(chunk) = inbound.recv().await {
        buf.extend_from_slice(&chunk);
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(envelope)) => {
                    let router = shared.router.lock().unwrap().clone();
                    let envelope = match router {
                        Some(router) => router.route(envelope).await,
                        None => Some(envelope),
                    };
                    if let Some(envelope) = envelope {
                        dispatch(&shared, envelope).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Framing errors are structural: close the connection
                    warn!("closing connection on framing error: {e}");
                    let _ = shared.error_tx.send(e.to_string());
                    dispose_inner(&shared);
                    return;
                }
            }
        }
    }

    debug!("transport closed");
    dispose_inner(&shared);
}

async fn dispatch(shared: &Arc<Shared>, envelope: Envelope) {
    match envelope {
        Envelope::Response {
            id, origin, body, ..
        } => {
            let outcome = open_body(shared, origin.as_ref(), body);
            let waiter = shared.pending.lock().unwrap().remove(&id);
            let Some(waiter) = waiter else {
                debug!("dropping response for unknown request id {id}");
                return;
            };
            match outcome {
                Ok(content) => {
                    let _ = waiter.send(Ok(content.payload));
                }
                Err(e) => {
                    warn!("failing request {id}: {e}");
                    let _ = waiter.send(Err(e));
                }
            }
        }
        Envelope::ResponseError {
            id, origin, body, ..
        } => {
            let outcome = open_body(shared, origin.as_ref(), body);
            let waiter = shared.pending.lock().unwrap().remove(&id);
            let Some(waiter) = waiter else {
                debug!("dropping error response for unknown request id {id}");
                return;
            };
            let result = match outcome {
                Ok(content) => match content.parse::<String>() {
                    Ok(message) => Err(ConnectionError::Remote(message)),
                    Err(e) => Err(ConnectionError::Protocol(e)),
                },
                Err(e) => Err(e),
            };
            let _ = waiter.send(result);
        }
        Envelope::Request {
            id, origin, body, ..
        } => {
            let was_clear = matches!(body, Body::Clear(_));
            let content = match open_body(shared, origin.as_ref(), body) {
                Ok(content) => content,
                Err(e) => {
                    warn!("dropping undecryptable request {id}: {e}");
                    return;
                }
            };
            let handler = shared
                .request_handlers
                .lock()
                .unwrap()
                .get(&content.method)
                .cloned();
            let Some(handler) = handler else {
                // No reply on the wire for unknown methods; the caller's
                // timeout is the only bound.
                debug!("no handler registered for request method {}", content.method);
                return;
            };
            // Sealed requests wait out the ready barrier; cleartext ones
            // are the handshake itself and run before it releases.
            if !was_clear && wait_ready_shared(shared).await.is_err() {
                return;
            }
            let result = handler(origin.clone(), content.payload).await;
            let reply = build_reply(shared, id, origin, was_clear, result);
            match reply {
                Ok(envelope) => {
                    if let Err(e) = write_envelope(shared, envelope).await {
                        debug!("response write skipped: {e}");
                    }
                }
                Err(e) => warn!("could not build response for request {id}: {e}"),
            }
        }
        Envelope::Notification { origin, body, .. } => {
            run_event_handler(shared, &shared.notification_handlers, origin, body).await;
        }
        Envelope::Broadcast { origin, body } => {
            run_event_handler(shared, &shared.broadcast_handlers, origin, body).await;
        }
        Envelope::Error { origin, body } => match open_body(shared, origin.as_ref(), body) {
            Ok(content) => match content.parse::<String>() {
                Ok(message) => {
                    warn!("peer error: {message}");
                    let _ = shared.error_tx.send(message);
                }
                Err(e) => warn!("dropping unparseable error envelope: {e}"),
            },
            Err(e) => warn!("dropping undecryptable error envelope: {e}"),
        },
    }
}

async fn run_event_handler(
    shared: &Arc<Shared>,
    registry: &Mutex<HashMap<String, EventHandler>>,
    origin: Option<PeerId>,
    body: Body,
) {
    let content = match open_body(shared, origin.as_ref(), body) {
        Ok(content) => content,
        Err(e) => {
            warn!("dropping undecryptable message: {e}");
            return;
        }
    };
    let handler = registry.lock().unwrap().get(&content.method).cloned();
    match handler {
        Some(handler) => handler(origin, content.payload).await,
        None => debug!("no handler registered for method {}", content.method),
    }
}

fn build_reply(
    shared: &Arc<Shared>,
    id: u64,
    origin: Option<PeerId>,
    clear: bool,
    result: std::result::Result<Vec<u8>, String>,
) -> Result<Envelope> {
    let target = origin
        .clone()
        .map(Target::Peer)
        .unwrap_or(Target::Server);
    let local = shared.local_id.lock().unwrap().clone();

    let (content, is_error) = match result {
        Ok(payload) => (
            Content {
                method: String::new(),
                payload,
            },
            false,
        ),
        Err(message) => (Content::new("", &message)?, true),
    };

    let body = if clear {
        Body::Clear(content)
    } else {
        let recipient = resolve_reply_recipient(shared, origin.as_ref())?;
        Body::Sealed(seal_content(shared, &content, &[recipient])?)
    };

    Ok(if is_error {
        Envelope::ResponseError {
            id,
            origin: local,
            target,
            body,
        }
    } else {
        Envelope::Response {
            id,
            origin: local,
            target,
            body,
        }
    })
}

fn resolve_reply_recipient(
    shared: &Arc<Shared>,
    origin: Option<&PeerId>,
) -> Result<(Fingerprint, PublicIdentity)> {
    match origin {
        Some(id) => {
            let roster = shared.roster.lock().unwrap();
            let entry = roster
                .get(id)
                .ok_or_else(|| ConnectionError::UnknownPeer(id.clone()))?;
            Ok((entry.fingerprint, entry.identity.clone()))
        }
        None => {
            let identity = shared
                .server_identity
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ConnectionError::Handshake("server identity not yet known".into()))?;
            Ok((identity.fingerprint(), identity))
        }
    }
}

/// Decrypt (or admit, for handshake cleartext) one inbound body
fn open_body(
    shared: &Arc<Shared>,
    origin: Option<&PeerId>,
    body: Body,
) -> Result<Content> {
    match body {
        Body::Clear(content) => {
            if *shared.lifecycle_rx.borrow() == Lifecycle::Ready {
                return Err(ConnectionError::Protocol(ProtocolError::MalformedFrame(
                    "cleartext body after handshake".into(),
                )));
            }
            Ok(content)
        }
        Body::Sealed(payload) => {
            let sender = resolve_sender(shared, origin);
            let bytes = match &sender {
                Some((fingerprint, identity)) => {
                    payload.verify_origin(identity)?;
                    let cached = shared
                        .caches
                        .lock()
                        .unwrap()
                        .unwrapped_key(fingerprint)
                        .map(|k| *k.as_bytes());
                    match cached {
                        Some(key) => payload.open_with_key(&key)?,
                        None => {
                            let (bytes, key) = payload.open(&shared.keypair)?;
                            let known = shared.roster.lock().unwrap().len();
                            shared.caches.lock().unwrap().store_unwrapped_key(
                                *fingerprint,
                                ContentKey::from_bytes(key, 0),
                                known,
                            );
                            bytes
                        }
                    }
                }
                None => {
                    // Sender not in the roster (e.g. a join racing the
                    // roster update): open without origin verification.
                    debug!("sealed message from unknown sender; skipping origin check");
                    payload.open(&shared.keypair)?.0
                }
            };
            Ok(Content::from_bytes(&bytes)?)
        }
    }
}

fn resolve_sender(
    shared: &Arc<Shared>,
    origin: Option<&PeerId>,
) -> Option<(Fingerprint, PublicIdentity)> {
    match origin {
        Some(id) => shared
            .roster
            .lock()
            .unwrap()
            .get(id)
            .map(|e| (e.fingerprint, e.identity.clone())),
        None => shared
            .server_identity
            .lock()
            .unwrap()
            .clone()
            .map(|identity| (identity.fingerprint(), identity)),
    }
}

/// Seal content for a recipient set, going through the encryption cache
fn seal_content(
    shared: &Arc<Shared>,
    content: &Content,
    recipients: &[(Fingerprint, PublicIdentity)],
) -> Result<SealedPayload> {
    let bytes = content.to_bytes()?;
    let (key, generation) = {
        let key = shared.content_key.lock().unwrap();
        (key.clone(), key.generation())
    };
    let known = shared.roster.lock().unwrap().len();

    let mut keys = Vec::with_capacity(recipients.len());
    {
        let mut caches = shared.caches.lock().unwrap();
        for (fingerprint, identity) in recipients {
            if let Some(sealed) = caches.sealed_copy(fingerprint, generation) {
                keys.push(sealed);
            } else {
                let sealed = seal::seal_key(&key, identity)?;
                shared.seal_ops.fetch_add(1, Ordering::Relaxed);
                caches.store_sealed_copy(*fingerprint, generation, sealed.clone(), known);
                keys.push(sealed);
            }
        }
    }

    Ok(SealedPayload::encrypt(&bytes, &key, &shared.keypair, keys)?)
}

async fn write_envelope(shared: &Arc<Shared>, envelope: Envelope) -> Result<()> {
    let frame = {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(envelope, &mut buf)?;
        buf.freeze()
    };
    let writer = shared.writer.lock().unwrap().clone();
    let Some(writer) = writer else {
        return Err(ConnectionError::Disconnected);
    };
    writer
        .send(frame)
        .await
        .map_err(|_| ConnectionError::Disconnected)
}

async fn wait_ready_shared(shared: &Arc<Shared>) -> Result<()> {
    let mut rx = shared.lifecycle_rx.clone();
    let state = rx
        .wait_for(|s| *s != Lifecycle::Constructing)
        .await
        .map_err(|_| ConnectionError::Disconnected)?;
    if *state == Lifecycle::Ready {
        Ok(())
    } else {
        Err(ConnectionError::Disconnected)
    }
}

fn dispose_inner(shared: &Arc<Shared>) {
    if shared.disposed.swap(true, Ordering::AcqRel) {
        return;
    }
    shared.lifecycle_tx.send_replace(Lifecycle::Disposing);

    let pending: Vec<_> = {
        let mut map = shared.pending.lock().unwrap();
        map.drain().collect()
    };
    for (_, waiter) in pending {
        let _ = waiter.send(Err(ConnectionError::Disconnected));
    }

    shared.request_handlers.lock().unwrap().clear();
    shared.notification_handlers.lock().unwrap().clear();
    shared.broadcast_handlers.lock().unwrap().clear();
    *shared.reader.lock().unwrap() = None;
    *shared.writer.lock().unwrap() = None;
    *shared.router.lock().unwrap() = None;

    shared.lifecycle_tx.send_replace(Lifecycle::Disposed);
    let _ = shared.disconnect_tx.send(());
    debug!("connection disposed");
}
