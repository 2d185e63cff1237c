//! Plugs services into the protocol.
//!
//! [`Endpoint`] is the responder side: it accepts inbound sessions on a
//! route, instantiates a fresh [`Service`] per session, and binds both
//! directions through the codec boundary. [`Initiate`] is the initiator
//! side: it allocates a session nonce, drives the handshake, and hands
//! the service handle back to the caller.
//!
//! The codec boundary lives in [`service_flows`]: pull encodes outbound
//! values (`None` terminates), push decodes inbound payloads (decode
//! errors are swallowed and the frame dropped), validates, and delivers
//! into the service's external queue. A failed delivery report
//! (`Delivery::Failed`) is dropped silently.

use crate::codec::Codec;
use crate::config::ProtocolConfig;
use crate::protocol::counter::NonceCounter;
use crate::protocol::flow::{Delivery, Pull, Push};
use crate::protocol::session::{self, SessionId};
use crate::service::Service;
use crate::socket::VirtualSocket;
use crate::task::Task;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builds the per-session service instance.
pub type ServiceFactory<I, E> = Box<dyn Fn() -> Service<I, E> + Send + Sync>;

/// Invoked once per responder session with the service handle and the
/// session task, so the application can serve it.
pub type SessionHook<I, E> = Box<dyn Fn(Arc<Service<I, E>>, Task) + Send + Sync>;

/// Map a service through the codec boundary into protocol callbacks.
pub fn service_flows<I, E>(
    service: Arc<Service<I, E>>,
    encode: Arc<dyn Codec<I>>,
    decode: Arc<dyn Codec<E>>,
) -> (Pull, Push)
where
    I: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let pull_service = service.clone();
    let pull: Pull = Box::new(move || {
        let service = pull_service.clone();
        let encode = encode.clone();
        Box::pin(async move {
            match service.internal().await {
                Some(value) => match encode.encode(&value) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        warn!(error = %e, "encode failed, terminating outbound stream");
                        None
                    }
                },
                None => None,
            }
        })
    });

    let push: Push = Box::new(move |delivery| {
        let service = service.clone();
        let decode = decode.clone();
        Box::pin(async move {
            match delivery {
                Delivery::Failed(reason) => {
                    debug!(reason = %reason, "inbound stream failed, delivery dropped");
                    true
                }
                Delivery::Payload(bytes) => match decode.decode(&bytes) {
                    Err(e) => {
                        // Decode failures are suppressed; the frame is
                        // consumed and dropped.
                        warn!(error = %e, "decode failed, frame dropped");
                        true
                    }
                    Ok(value) => {
                        if !service.validate(&value) {
                            debug!("validation rejected inbound value");
                            true
                        } else {
                            service.external(value)
                        }
                    }
                },
            }
        })
    });

    (pull, push)
}

/// Tie a service's lifetime to its owning session task.
fn own_service<I, E>(service: Arc<Service<I, E>>, owner: &Task)
where
    I: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let owner = owner.clone();
    tokio::spawn(async move {
        owner.cancelled().await;
        service.close();
    });
}

/// Responder side of one route: accepts sessions and serves them.
pub struct Endpoint<I, E> {
    key: u16,
    config: ProtocolConfig,
    encode: Arc<dyn Codec<I>>,
    decode: Arc<dyn Codec<E>>,
    factory: ServiceFactory<I, E>,
    hook: SessionHook<I, E>,
}

impl<I, E> Endpoint<I, E>
where
    I: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new(
        key: u16,
        config: ProtocolConfig,
        encode: Arc<dyn Codec<I>>,
        decode: Arc<dyn Codec<E>>,
        factory: ServiceFactory<I, E>,
        hook: SessionHook<I, E>,
    ) -> Self {
        Self {
            key,
            config,
            encode,
            decode,
            factory,
            hook,
        }
    }

    /// Accept inbound sessions on `socket` until it closes.
    ///
    /// The accept loop runs under a root task wired to the socket's
    /// closed signal; every session derives from it.
    pub async fn start(&self, socket: VirtualSocket) {
        let root = Task::new();
        {
            let root = root.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                socket.closed().await;
                root.cancel("socket closed");
            });
        }
        info!(key = self.key, "endpoint accepting sessions");

        session::channel(
            socket,
            self.key,
            root,
            self.config.ack_deadline,
            self.config.client_silent_deadline,
            |session_task| {
                let service = Arc::new((self.factory)());
                own_service(service.clone(), &session_task);
                (self.hook)(service.clone(), session_task);
                service_flows(service, self.encode.clone(), self.decode.clone())
            },
        )
        .await;
        debug!(key = self.key, "endpoint stopped");
    }
}

/// Initiator side of one route: opens sessions.
pub struct Initiate<I, E> {
    key: u16,
    config: ProtocolConfig,
    encode: Arc<dyn Codec<I>>,
    decode: Arc<dyn Codec<E>>,
    factory: ServiceFactory<I, E>,
    nonces: NonceCounter,
}

impl<I, E> Initiate<I, E>
where
    I: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new(
        key: u16,
        config: ProtocolConfig,
        encode: Arc<dyn Codec<I>>,
        decode: Arc<dyn Codec<E>>,
        factory: ServiceFactory<I, E>,
    ) -> Self {
        Self {
            key,
            config,
            encode,
            decode,
            factory,
            nonces: NonceCounter::new(),
        }
    }

    /// Open a session against the peer's endpoint for this route.
    ///
    /// The session runs under a subtask of `task`; the returned service
    /// handle is the caller's way in (`load_internal`) and out
    /// (`take_external`). The handle's queues drop when the session
    /// resolves.
    pub fn start(&self, task: &Task, socket: &VirtualSocket) -> Arc<Service<I, E>> {
        self.start_session(task, socket).0
    }

    /// Like [`Initiate::start`], additionally exposing the session task
    /// so callers can observe the resolution reason.
    pub fn start_session(&self, task: &Task, socket: &VirtualSocket) -> (Arc<Service<I, E>>, Task) {
        let service = Arc::new((self.factory)());
        let session_task = task.subtask();
        own_service(service.clone(), &session_task);

        let (pull, push) = service_flows(service.clone(), self.encode.clone(), self.decode.clone());
        let id = SessionId {
            key: self.key,
            nonce: self.nonces.claim(),
        };
        debug!(key = id.key, nonce = id.nonce, "initiating session");

        let session_socket = socket.multiplex();
        let ack_deadline = self.config.ack_deadline;
        let silent_deadline = self.config.server_silent_deadline;
        tokio::spawn(session::connect(
            session_socket,
            id,
            session_task.clone(),
            ack_deadline,
            silent_deadline,
            pull,
            push,
        ));

        (service, session_task)
    }
}
