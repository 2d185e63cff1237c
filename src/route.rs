//! # Typed Route Surface
//!
//! Routes give the protocol its application shape. A [`Router`] issues
//! each route a stable 16-bit key and records which side it is bound
//! on; binding a route produces either a typed caller (initiator side)
//! or registers a responder driver started by [`Router::start`].
//!
//! Five interaction shapes exist, each a thin layer over the service
//! queue pair:
//!
//! | shape   | initiator               | responder                  |
//! |---------|-------------------------|----------------------------|
//! | unary   | [`UnaryCaller::call`]   | [`Router::recv_unary`]     |
//! | channel | [`ChannelCaller::open`] | [`Router::recv_channel`]   |
//! | stream  | [`StreamCaller::open`]  | [`Router::recv_stream`]    |
//! | listen  | [`ListenCaller::listen`]| [`Router::recv_listen`]    |
//! | duplex  | [`DuplexCaller::open`]  | [`Router::recv_duplex`]    |
//!
//! The router enforces the binding rules: keys are unique, a route
//! object binds exactly once, routes cannot cross routers, and every
//! issued route must be bound before `start`.

use crate::codec;
use crate::config::ProtocolConfig;
use crate::endpoint::{Endpoint, Initiate, SessionHook};
use crate::error::{CallError, RouteError};
use crate::service::Service;
use crate::socket::VirtualSocket;
use crate::task::Task;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

static NEXT_ROUTER_ID: AtomicU64 = AtomicU64::new(1);

/// Bound for values carried over the typed surface.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> Payload for T {}

struct RouteCore {
    key: u16,
    router: u64,
    bound: AtomicBool,
    config: Mutex<Option<ProtocolConfig>>,
}

/// A registered route: a stable key plus its binding state.
#[derive(Clone)]
pub struct Route {
    core: Arc<RouteCore>,
}

impl Route {
    /// The stable 16-bit key issued at registration time.
    pub fn key(&self) -> u16 {
        self.core.key
    }

    /// Attach a per-route configuration override, consulted at bind
    /// time in place of the router default.
    pub fn set_config(&self, config: ProtocolConfig) {
        *self.core.config.lock() = Some(config);
    }
}

/// Connection state shared with typed callers once the router starts.
struct Link {
    socket: VirtualSocket,
    task: Task,
}

type SharedLink = Arc<OnceLock<Link>>;

#[async_trait]
trait BoundRoute: Send + Sync {
    /// Drive the responder side of one route over the connection.
    async fn run(&self, socket: VirtualSocket);
}

struct EndpointDriver<I, E> {
    endpoint: Endpoint<I, E>,
}

#[async_trait]
impl<I, E> BoundRoute for EndpointDriver<I, E>
where
    I: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    async fn run(&self, socket: VirtualSocket) {
        self.endpoint.start(socket).await;
    }
}

/// Issues route keys and assembles one side of a connection.
pub struct Router {
    id: u64,
    default_config: ProtocolConfig,
    next_key: u16,
    keys: HashSet<u16>,
    issued: Vec<Arc<RouteCore>>,
    drivers: Vec<Box<dyn BoundRoute>>,
    links: Vec<SharedLink>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::with_config(ProtocolConfig::default())
    }

    pub fn with_config(default_config: ProtocolConfig) -> Self {
        Self {
            id: NEXT_ROUTER_ID.fetch_add(1, Ordering::Relaxed),
            default_config,
            next_key: 0,
            keys: HashSet::new(),
            issued: Vec::new(),
            drivers: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Register a route under the next free key.
    pub fn route(&mut self) -> Route {
        while self.keys.contains(&self.next_key) {
            self.next_key = self.next_key.wrapping_add(1);
        }
        let key = self.next_key;
        self.next_key = self.next_key.wrapping_add(1);
        self.register(key)
    }

    /// Register a route under an explicit key.
    pub fn route_at(&mut self, key: u16) -> Result<Route, RouteError> {
        if self.keys.contains(&key) {
            return Err(RouteError::DuplicateKey(key));
        }
        Ok(self.register(key))
    }

    fn register(&mut self, key: u16) -> Route {
        self.keys.insert(key);
        let core = Arc::new(RouteCore {
            key,
            router: self.id,
            bound: AtomicBool::new(false),
            config: Mutex::new(None),
        });
        self.issued.push(core.clone());
        Route { core }
    }

    /// Claim a route for binding, enforcing identity and single-bind.
    fn claim(&self, route: &Route) -> Result<ProtocolConfig, RouteError> {
        if route.core.router != self.id {
            return Err(RouteError::ForeignRoute(route.core.key));
        }
        if route.core.bound.swap(true, Ordering::AcqRel) {
            return Err(RouteError::AlreadyBound(route.core.key));
        }
        let config = route
            .core
            .config
            .lock()
            .clone()
            .unwrap_or_else(|| self.default_config.clone());
        Ok(config)
    }

    fn share_link(&mut self) -> SharedLink {
        let link: SharedLink = Arc::new(OnceLock::new());
        self.links.push(link.clone());
        link
    }

    /// Attach every binding to the connection socket.
    ///
    /// Fails unless each issued route carries a binding. Responder
    /// drivers are spawned; typed callers become usable. The returned
    /// handle owns the connection's root task.
    pub fn start(self, socket: VirtualSocket) -> Result<RouterHandle, RouteError> {
        for core in &self.issued {
            if !core.bound.load(Ordering::Acquire) {
                return Err(RouteError::Unbound(core.key));
            }
        }

        let root = Task::new();
        {
            let root = root.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                socket.closed().await;
                root.cancel("socket closed");
            });
        }

        for link in &self.links {
            let _ = link.set(Link {
                socket: socket.clone(),
                task: root.clone(),
            });
        }

        info!(routes = self.issued.len(), drivers = self.drivers.len(), "router started");
        for driver in self.drivers {
            let socket = socket.clone();
            tokio::spawn(async move { driver.run(socket).await });
        }

        Ok(RouterHandle { task: root })
    }

    // ----- initiator bindings -------------------------------------------------

    /// Bind the initiator side of a unary route.
    pub fn send_unary<Req, Resp>(
        &mut self,
        route: &Route,
    ) -> Result<UnaryCaller<Req, Resp>, RouteError>
    where
        Req: Payload,
        Resp: Payload,
    {
        let config = self.claim(route)?;
        let kind = config.codec;
        let initiate = Initiate::new(
            route.key(),
            config,
            codec::select::<Req>(kind),
            codec::select::<Resp>(kind),
            Box::new(Service::once),
        );
        Ok(UnaryCaller {
            initiate,
            link: self.share_link(),
        })
    }

    /// Bind the initiator side of a send-channel route: sequenced
    /// request/reply pairs with `capacity` buffered in each direction.
    pub fn send_channel<Req, Resp>(
        &mut self,
        route: &Route,
        capacity: usize,
    ) -> Result<ChannelCaller<Req, Resp>, RouteError>
    where
        Req: Payload,
        Resp: Payload,
    {
        let config = self.claim(route)?;
        let kind = config.codec;
        let initiate = Initiate::new(
            route.key(),
            config,
            codec::select::<Req>(kind),
            codec::select::<Resp>(kind),
            Box::new(move || Service::many(capacity, capacity)),
        );
        Ok(ChannelCaller {
            initiate,
            link: self.share_link(),
        })
    }

    /// Bind the initiator side of a one-way stream route. There are no
    /// replies, so the session ignores inbound silence.
    pub fn send_stream<T>(
        &mut self,
        route: &Route,
        capacity: usize,
    ) -> Result<StreamCaller<T>, RouteError>
    where
        T: Payload,
    {
        let config = self.claim(route)?;
        let kind = config.codec;
        // Nothing ever arrives; a silence deadline would kill healthy
        // sessions.
        let config = config.with_server_silent_deadline(std::time::Duration::MAX);
        let initiate = Initiate::new(
            route.key(),
            config,
            codec::select::<T>(kind),
            codec::select::<()>(kind),
            Box::new(move || Service::many(capacity, 0)),
        );
        Ok(StreamCaller {
            initiate,
            link: self.share_link(),
        })
    }

    /// Bind the initiator side of a listen route: one request, a stream
    /// of replies buffered up to `buffer`.
    pub fn send_listen<Req, T>(
        &mut self,
        route: &Route,
        buffer: usize,
    ) -> Result<ListenCaller<Req, T>, RouteError>
    where
        Req: Payload,
        T: Payload,
    {
        let config = self.claim(route)?;
        let kind = config.codec;
        let initiate = Initiate::new(
            route.key(),
            config,
            codec::select::<Req>(kind),
            codec::select::<T>(kind),
            Box::new(move || Service::many(1, buffer)),
        );
        Ok(ListenCaller {
            initiate,
            link: self.share_link(),
        })
    }

    /// Bind the initiator side of a duplex route: independent streams
    /// with their own capacities.
    pub fn send_duplex<Out, In>(
        &mut self,
        route: &Route,
        send_capacity: usize,
        recv_capacity: usize,
    ) -> Result<DuplexCaller<Out, In>, RouteError>
    where
        Out: Payload,
        In: Payload,
    {
        let config = self.claim(route)?;
        let kind = config.codec;
        let initiate = Initiate::new(
            route.key(),
            config,
            codec::select::<Out>(kind),
            codec::select::<In>(kind),
            Box::new(move || Service::many(send_capacity, recv_capacity)),
        );
        Ok(DuplexCaller {
            initiate,
            link: self.share_link(),
        })
    }

    // ----- responder bindings -------------------------------------------------

    /// Bind the responder side of a unary route.
    pub fn recv_unary<Req, Resp, H, Fut>(
        &mut self,
        route: &Route,
        handler: H,
    ) -> Result<(), RouteError>
    where
        Req: Payload,
        Resp: Payload,
        H: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Resp> + Send + 'static,
    {
        let config = self.claim(route)?;
        let kind = config.codec;
        let handler = Arc::new(handler);
        let hook: SessionHook<Resp, Req> = Box::new(move |service, _task| {
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Some(request) = service.take_external().await {
                    let reply = handler(request).await;
                    if !service.load_internal(Some(reply)) {
                        warn!("unary reply could not be loaded");
                    }
                }
            });
        });
        let endpoint = Endpoint::new(
            route.key(),
            config,
            codec::select::<Resp>(kind),
            codec::select::<Req>(kind),
            Box::new(Service::once),
            hook,
        );
        self.drivers.push(Box::new(EndpointDriver { endpoint }));
        Ok(())
    }

    /// Bind the responder side of a channel route: each input yields
    /// exactly one output, in series.
    pub fn recv_channel<Req, Resp, H, Fut>(
        &mut self,
        route: &Route,
        capacity: usize,
        handler: H,
    ) -> Result<(), RouteError>
    where
        Req: Payload,
        Resp: Payload,
        H: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Resp> + Send + 'static,
    {
        let config = self.claim(route)?;
        let kind = config.codec;
        let handler = Arc::new(handler);
        let hook: SessionHook<Resp, Req> = Box::new(move |service, _task| {
            let handler = handler.clone();
            tokio::spawn(async move {
                while let Some(request) = service.take_external().await {
                    let reply = handler(request).await;
                    if !service.load_internal(Some(reply)) {
                        warn!("channel reply dropped, output queue unavailable");
                        break;
                    }
                }
            });
        });
        let endpoint = Endpoint::new(
            route.key(),
            config,
            codec::select::<Resp>(kind),
            codec::select::<Req>(kind),
            Box::new(move || Service::many(capacity, capacity)),
            hook,
        );
        self.drivers.push(Box::new(EndpointDriver { endpoint }));
        Ok(())
    }

    /// Bind the responder side of a one-way stream route.
    pub fn recv_stream<T, H, Fut>(
        &mut self,
        route: &Route,
        capacity: usize,
        handler: H,
    ) -> Result<(), RouteError>
    where
        T: Payload,
        H: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let config = self.claim(route)?;
        let kind = config.codec;
        let handler = Arc::new(handler);
        let hook: SessionHook<(), T> = Box::new(move |service, _task| {
            let handler = handler.clone();
            tokio::spawn(async move {
                while let Some(item) = service.take_external().await {
                    handler(item).await;
                }
            });
        });
        let endpoint = Endpoint::new(
            route.key(),
            config,
            codec::select::<()>(kind),
            codec::select::<T>(kind),
            // The reply direction never carries anything.
            Box::new(move || Service::many(0, capacity)),
            hook,
        );
        self.drivers.push(Box::new(EndpointDriver { endpoint }));
        Ok(())
    }

    /// Bind the responder side of a listen route. The handler receives
    /// the single request and a producer for the reply stream; the
    /// stream ends when the handler returns.
    pub fn recv_listen<Req, T, H, Fut>(
        &mut self,
        route: &Route,
        buffer: usize,
        handler: H,
    ) -> Result<(), RouteError>
    where
        Req: Payload,
        T: Payload,
        H: Fn(Req, ListenProducer<T, Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let config = self.claim(route)?;
        let kind = config.codec;
        let handler = Arc::new(handler);
        let hook: SessionHook<T, Req> = Box::new(move |service, _task| {
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Some(request) = service.take_external().await {
                    let producer = ListenProducer {
                        service: service.clone(),
                    };
                    handler(request, producer).await;
                    service.load_internal(None);
                }
            });
        });
        let endpoint = Endpoint::new(
            route.key(),
            config,
            codec::select::<T>(kind),
            codec::select::<Req>(kind),
            // One slot for the request, `buffer` for the outputs.
            Box::new(move || Service::many(buffer, 1)),
            hook,
        );
        self.drivers.push(Box::new(EndpointDriver { endpoint }));
        Ok(())
    }

    /// Bind the responder side of a duplex route. The handler owns the
    /// session's send/recv pair for its whole lifetime.
    pub fn recv_duplex<Out, In, H, Fut>(
        &mut self,
        route: &Route,
        send_capacity: usize,
        recv_capacity: usize,
        handler: H,
    ) -> Result<(), RouteError>
    where
        Out: Payload,
        In: Payload,
        H: Fn(DuplexHandle<Out, In>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let config = self.claim(route)?;
        let kind = config.codec;
        let handler = Arc::new(handler);
        let hook: SessionHook<Out, In> = Box::new(move |service, task| {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler(DuplexHandle { service, task }).await;
            });
        });
        let endpoint = Endpoint::new(
            route.key(),
            config,
            codec::select::<Out>(kind),
            codec::select::<In>(kind),
            Box::new(move || Service::many(send_capacity, recv_capacity)),
            hook,
        );
        self.drivers.push(Box::new(EndpointDriver { endpoint }));
        Ok(())
    }
}

/// Connection handle returned by [`Router::start`].
pub struct RouterHandle {
    task: Task,
}

impl RouterHandle {
    /// The connection's root task; every session derives from it.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Cancel the root task, tearing down every session.
    pub fn shutdown(&self, reason: &str) {
        self.task.cancel(reason);
    }
}

fn link_of(link: &SharedLink) -> Result<&Link, RouteError> {
    link.get().ok_or(RouteError::NotStarted)
}

// ----- unary ----------------------------------------------------------------

/// Initiator handle for a unary route.
pub struct UnaryCaller<Req, Resp> {
    initiate: Initiate<Req, Resp>,
    link: SharedLink,
}

impl<Req: Payload, Resp: Payload> UnaryCaller<Req, Resp> {
    /// Open a session, send one request, await the one reply.
    pub async fn call(&self, request: Req) -> Result<Resp, CallError> {
        let link = link_of(&self.link)?;
        let (service, session) = self.initiate.start_session(&link.task, &link.socket);
        if !service.load_internal(Some(request)) {
            return Err(CallError::SendFailed);
        }
        match service.take_external().await {
            Some(reply) => Ok(reply),
            None => Err(CallError::SessionFailed(
                session
                    .is_cancelled()
                    .unwrap_or_else(|| "session closed before reply".to_string()),
            )),
        }
    }
}

// ----- channel --------------------------------------------------------------

/// Initiator handle for a send-channel route.
pub struct ChannelCaller<Req, Resp> {
    initiate: Initiate<Req, Resp>,
    link: SharedLink,
}

impl<Req: Payload, Resp: Payload> ChannelCaller<Req, Resp> {
    /// Open a sequenced request/reply session.
    pub fn open(&self) -> Result<ChannelSession<Req, Resp>, CallError> {
        let link = link_of(&self.link)?;
        let (service, task) = self.initiate.start_session(&link.task, &link.socket);
        Ok(ChannelSession { service, task })
    }
}

/// One live send-channel session.
pub struct ChannelSession<Req, Resp> {
    service: Arc<Service<Req, Resp>>,
    task: Task,
}

impl<Req: Payload, Resp: Payload> ChannelSession<Req, Resp> {
    /// Queue the next request. Fails when the send buffer is full.
    pub fn send(&self, request: Req) -> Result<(), CallError> {
        if self.service.load_internal(Some(request)) {
            Ok(())
        } else {
            Err(CallError::SendFailed)
        }
    }

    /// Await the next reply; `None` once the session is over.
    pub async fn recv(&self) -> Option<Resp> {
        self.service.take_external().await
    }

    /// End the session from this side. Take any outstanding replies
    /// first; teardown drops what is still in flight.
    pub fn close(&self) {
        self.service.load_internal(None);
    }

    /// The session's resolution reason, once resolved.
    pub fn reason(&self) -> Option<String> {
        self.task.is_cancelled()
    }
}

// ----- stream ---------------------------------------------------------------

/// Initiator handle for a one-way stream route.
pub struct StreamCaller<T> {
    initiate: Initiate<T, ()>,
    link: SharedLink,
}

impl<T: Payload> StreamCaller<T> {
    /// Open a one-way stream session.
    pub fn open(&self) -> Result<StreamSession<T>, CallError> {
        let link = link_of(&self.link)?;
        let (service, task) = self.initiate.start_session(&link.task, &link.socket);
        Ok(StreamSession { service, task })
    }
}

/// One live one-way stream session.
pub struct StreamSession<T> {
    service: Arc<Service<T, ()>>,
    task: Task,
}

impl<T: Payload> StreamSession<T> {
    /// Queue the next item. Fails when the send buffer is full.
    pub fn send(&self, item: T) -> Result<(), CallError> {
        if self.service.load_internal(Some(item)) {
            Ok(())
        } else {
            Err(CallError::SendFailed)
        }
    }

    /// End the stream; the peer observes an orderly teardown.
    pub fn finish(&self) {
        self.service.load_internal(None);
    }

    pub fn reason(&self) -> Option<String> {
        self.task.is_cancelled()
    }
}

// ----- listen ---------------------------------------------------------------

/// Initiator handle for a listen route.
pub struct ListenCaller<Req, T> {
    initiate: Initiate<Req, T>,
    link: SharedLink,
}

impl<Req: Payload, T: Payload> ListenCaller<Req, T> {
    /// Send the single request and start receiving the reply stream.
    pub fn listen(&self, request: Req) -> Result<ListenSession<Req, T>, CallError> {
        let link = link_of(&self.link)?;
        let (service, task) = self.initiate.start_session(&link.task, &link.socket);
        if !service.load_internal(Some(request)) {
            return Err(CallError::SendFailed);
        }
        Ok(ListenSession { service, task })
    }
}

/// One live listen session.
pub struct ListenSession<Req, T> {
    service: Arc<Service<Req, T>>,
    task: Task,
}

impl<Req: Payload, T: Payload> ListenSession<Req, T> {
    /// Await the next streamed reply; `None` once the session is over.
    pub async fn next(&self) -> Option<T> {
        self.service.take_external().await
    }

    /// Stop listening and end the session from this side.
    pub fn close(&self) {
        self.service.load_internal(None);
    }

    pub fn reason(&self) -> Option<String> {
        self.task.is_cancelled()
    }
}

/// Reply-stream producer handed to a listen responder.
pub struct ListenProducer<T, Req> {
    service: Arc<Service<T, Req>>,
}

impl<T: Payload, Req: Payload> ListenProducer<T, Req> {
    /// Queue the next output; `false` when the reply buffer is full.
    pub fn send(&self, item: T) -> bool {
        self.service.load_internal(Some(item))
    }
}

// ----- duplex ---------------------------------------------------------------

/// Initiator handle for a duplex route.
pub struct DuplexCaller<Out, In> {
    initiate: Initiate<Out, In>,
    link: SharedLink,
}

impl<Out: Payload, In: Payload> DuplexCaller<Out, In> {
    /// Open an independent bidirectional session.
    pub fn open(&self) -> Result<DuplexHandle<Out, In>, CallError> {
        let link = link_of(&self.link)?;
        let (service, task) = self.initiate.start_session(&link.task, &link.socket);
        Ok(DuplexHandle { service, task })
    }
}

/// One side of a live duplex session; also handed to duplex responders.
pub struct DuplexHandle<Out, In> {
    service: Arc<Service<Out, In>>,
    task: Task,
}

impl<Out: Payload, In: Payload> DuplexHandle<Out, In> {
    /// Queue an outbound item. Fails when the send buffer is full.
    pub fn send(&self, item: Out) -> Result<(), CallError> {
        if self.service.load_internal(Some(item)) {
            Ok(())
        } else {
            Err(CallError::SendFailed)
        }
    }

    /// Await the next inbound item; `None` once the session is over.
    pub async fn recv(&self) -> Option<In> {
        self.service.take_external().await
    }

    /// End the outbound direction; an initiator ending its stream tears
    /// the session down.
    pub fn finish(&self) {
        self.service.load_internal(None);
    }

    pub fn reason(&self) -> Option<String> {
        self.task.is_cancelled()
    }
}
