// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use log::*;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::buffer::MutableBuffer;
use crate::endpoint::{Endpoint, EndpointSet};
use crate::execution::{self, RequestStatus};
use crate::exposed_memory::{AccessMode, ExposedMemory};
use crate::handle::RpcHandle;
use crate::options::EngineOptions;
use crate::registry::{self, RequestType};
use crate::request::Request;
use crate::transport::Transport;
use crate::{Error, Result};

#[derive(Default)]
struct Stats {
    posts: AtomicU64,
    responses: AtomicU64,
    bulk_transfers: AtomicU64,
}

pub(crate) struct EngineInner {
    class: Arc<na::Class>,
    context: Arc<na::Context>,
    transport: Transport,
    listen: bool,
    self_address: Option<na::Addr>,
    shutdown: Arc<AtomicBool>,
    runner: Mutex<Option<thread::JoinHandle<()>>>,
    addr_cache: Mutex<HashMap<String, na::Addr>>,
    opts: EngineOptions,
    parent_pid: Option<u32>,
    stats: Stats,
}

/// The asynchronous engine: binds a transport, owns the native class and
/// context plus the progress thread, and provides the public RPC surface.
///
/// Cheap to clone; clones share one engine. Teardown runs when the last
/// clone drops.
#[derive(Clone)]
pub struct AsyncEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl AsyncEngine {
    /// Initialize the engine on `transport`. An empty `bind_address` with
    /// `listen` unset creates a client-only engine.
    pub fn new(
        transport: Transport,
        opts: EngineOptions,
        bind_address: &str,
        listen: bool,
    ) -> Result<AsyncEngine> {
        let info = na::InitInfo {
            auto_sm: opts.use_auto_sm,
            stats: opts.print_stats,
            no_block_progress: opts.force_no_block_progress,
            #[cfg(feature = "margo-compat")]
            input_offset: crate::margo::BREADCRUMB_SIZE,
            #[cfg(not(feature = "margo-compat"))]
            input_offset: 0,
        };

        let uri = format!("{}{}", transport.uri_prefix(), bind_address);

        debug!("initializing native transport layer (address: {uri})");

        let class = match na::Class::init(&uri, listen, info) {
            Ok(class) => class,
            Err(na::Error::Unsupported(t)) => return Err(Error::UnsupportedTransport(t)),
            Err(e) => return Err(Error::Native(e)),
        };

        let context = Arc::new(na::Context::new(Arc::clone(&class)).map_err(Error::Native)?);

        let self_address = if listen {
            let addr = context.addr_self().map_err(Error::Native)?;
            debug!("self address: {addr}");
            Some(addr)
        } else {
            None
        };

        let engine = AsyncEngine {
            inner: Arc::new(EngineInner {
                class,
                context,
                transport,
                listen,
                self_address,
                shutdown: Arc::new(AtomicBool::new(false)),
                runner: Mutex::new(None),
                addr_cache: Mutex::new(HashMap::new()),
                opts,
                parent_pid: opts.process_may_fork.then(std::process::id),
                stats: Stats::default(),
            }),
        };

        debug!("registering request types");
        engine.register_request_types();

        Ok(engine)
    }

    /// Register every request type found in the process-wide registry with
    /// the native layer, wiring up dispatch stubs in listen mode and
    /// disabling responses for one-way types.
    fn register_request_types(&self) {
        for descriptor in registry::snapshot() {
            trace!(
                "registered: id={}, native_id={}, name={}",
                descriptor.id,
                descriptor.native_id,
                descriptor.name
            );

            let dispatcher: Option<na::RpcCallback> = if self.inner.listen {
                let weak = Arc::downgrade(&self.inner);
                let descriptor = Arc::clone(&descriptor);

                Some(Arc::new(move |handle: na::Handle| {
                    let Some(inner) = weak.upgrade() else { return };
                    let engine = AsyncEngine { inner };
                    (descriptor.dispatch)(&engine, handle);
                }))
            } else {
                None
            };

            self.inner
                .class
                .register_rpc(descriptor.native_id, dispatcher);

            if !descriptor.requires_response {
                if let Err(e) = self.inner.class.disable_response(descriptor.native_id, true) {
                    error!(
                        "failed to disable response for request [{}]: {e}",
                        descriptor.name
                    );
                }
            }
        }
    }

    /// The textual address this engine listens on.
    pub fn self_address(&self) -> Result<String> {
        match &self.inner.self_address {
            Some(addr) => Ok(addr.uri().to_string()),
            None => Err(Error::Native(na::Error::Protocol(
                "engine is not listening",
            ))),
        }
    }

    /// Spawn the progress thread.
    pub fn run(&self) {
        debug!("starting asynchronous engine");

        let context = Arc::clone(&self.inner.context);
        let shutdown = Arc::clone(&self.inner.shutdown);

        let handle = thread::Builder::new()
            .name("hermes-progress".to_string())
            .spawn(move || progress_thread(context, shutdown));

        match handle {
            Ok(handle) => *self.inner.runner.lock().unwrap() = Some(handle),
            Err(e) => error!("failed to spawn progress thread: {e}"),
        }
    }

    /// Resolve a textual address into an endpoint.
    ///
    /// Addresses without a `scheme://` prefix get the engine's default
    /// prefix prepended; a prefix that does not match the engine's
    /// transport is an error (the verbs RX-manager form counts as
    /// matching verbs). Results are cached for the engine's lifetime.
    pub fn lookup(&self, addr: &str) -> Result<Endpoint> {
        debug!("looking up endpoint \"{addr}\"");

        let transport_address = match addr.rfind("://") {
            Some(pos) => {
                let scheme = &addr[..pos];

                if !self.inner.transport.matches_scheme(scheme) {
                    return Err(Error::TransportMismatch {
                        found: scheme.to_string(),
                        expected: self.inner.transport.scheme().to_string(),
                    });
                }

                addr.to_string()
            }
            None => {
                warn!(
                    "address \"{addr}\" does not include a transport prefix, \
                     defaulting to {}",
                    self.inner.transport.lookup_prefix()
                );
                format!("{}{addr}", self.inner.transport.lookup_prefix())
            }
        };

        {
            let cache = self.inner.addr_cache.lock().unwrap();

            if let Some(hit) = cache.get(&transport_address) {
                debug!("endpoint \"{addr}\" cached");
                return Ok(Endpoint::new(hit.clone()));
            }
        }

        let slot: Arc<Mutex<Option<na::Result<na::Addr>>>> = Arc::new(Mutex::new(None));
        let cb_slot = Arc::clone(&slot);

        self.inner
            .context
            .addr_lookup(
                &transport_address,
                Box::new(move |result| {
                    *cb_slot.lock().unwrap() = Some(result);
                }),
            )
            .map_err(Error::Native)?;

        self.wait_on(&slot)?;

        let result = slot.lock().unwrap().take();

        let address = match result {
            Some(Ok(address)) => address,
            Some(Err(e)) => {
                debug!("lookup request failed");
                return Err(Error::Native(e));
            }
            None => return Err(Error::InconsistentState),
        };

        debug!("lookup request succeeded [addr: {address}]");

        self.inner
            .addr_cache
            .lock()
            .unwrap()
            .insert(transport_address, address.clone());

        Ok(Endpoint::new(address))
    }

    /// Look up several addresses, deduplicated. Serial: each lookup
    /// completes before the next is posted.
    pub fn lookup_all<I, S>(&self, addrs: I) -> Result<EndpointSet>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let unique: BTreeSet<String> = addrs.into_iter().map(Into::into).collect();

        let mut endpoints = EndpointSet::new();

        for addr in unique {
            endpoints.push(self.lookup(&addr)?);
        }

        Ok(endpoints)
    }

    /// Block the calling thread driving trigger/progress until the lookup
    /// callback fires. Safe alongside the progress thread: whichever drains
    /// the completion first settles the slot.
    fn wait_on<T>(&self, slot: &Arc<Mutex<Option<T>>>) -> Result<()> {
        let context = &self.inner.context;

        loop {
            loop {
                let n = context.trigger(1).map_err(Error::Native)?;

                if n == 0 || slot.lock().unwrap().is_some() {
                    break;
                }
            }

            if slot.lock().unwrap().is_some() {
                return Ok(());
            }

            match context.progress(100) {
                Ok(()) | Err(na::Error::Timeout) => {}
                Err(e) => {
                    warn!("unexpected return code from progress: {e}");
                    return Err(Error::Native(e));
                }
            }
        }
    }

    /// Register `buffers` as one bulk unit for one-sided transfers.
    pub fn expose(&self, buffers: &[MutableBuffer], mode: AccessMode) -> Result<ExposedMemory> {
        ExposedMemory::expose(&self.inner.class, buffers, mode)
    }

    /// Store `handler` in `R`'s descriptor. Fails if `R` was never
    /// registered. The handler runs on the progress thread with the engine
    /// passed in, so it can respond and start bulk transfers.
    pub fn register_handler<R, F>(&self, handler: F) -> Result<()>
    where
        R: RequestType,
        F: Fn(&AsyncEngine, Request<R>) + Send + Sync + 'static,
    {
        registry::set_handler::<R>(Box::new(handler))
    }

    /// Post `R` to a single target. Returns immediately; the outcome is
    /// observed through the returned handle.
    pub fn post<R: RequestType>(
        &self,
        target: &Endpoint,
        input: R::Input,
    ) -> Result<RpcHandle<R>> {
        registry::find(R::ID).ok_or(Error::UnknownRequestType(R::ID))?;

        trace!("posting RPC [{}] to endpoint {target}", R::NAME);

        let handle = RpcHandle::<R>::new(
            &self.inner.context,
            vec![target.address().clone()],
            vec![input],
            self.inner.opts.rpc_timeout,
            self.inner.opts.rpc_retries,
        )?;

        self.inner.stats.posts.fetch_add(1, Ordering::Relaxed);

        let ctx = &handle.ctxs[0];

        if let Err(e) = execution::submit(ctx) {
            ctx.status.store(RequestStatus::Failed);
            ctx.promise
                .set_error(Error::RequestFailed(e.to_string()));
            return Err(Error::Native(e));
        }

        Ok(handle)
    }

    /// Post `R` to every endpoint in `targets`. A submission failure
    /// part-way cancels the already-submitted requests and fails with the
    /// native error; the partially-failed handle remains drainable.
    pub fn broadcast<R>(&self, targets: &EndpointSet, input: R::Input) -> Result<RpcHandle<R>>
    where
        R: RequestType,
        R::Input: Clone,
    {
        registry::find(R::ID).ok_or(Error::UnknownRequestType(R::ID))?;

        trace!("posting RPC [{}] to {} endpoints", R::NAME, targets.len());

        let addrs: Vec<na::Addr> = targets.iter().map(|t| t.address().clone()).collect();
        let inputs: Vec<R::Input> = targets.iter().map(|_| input.clone()).collect();

        let handle = RpcHandle::<R>::new(
            &self.inner.context,
            addrs,
            inputs,
            self.inner.opts.rpc_timeout,
            self.inner.opts.rpc_retries,
        )?;

        for (i, ctx) in handle.ctxs.iter().enumerate() {
            let Err(e) = execution::submit(ctx) else {
                self.inner.stats.posts.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            ctx.status.store(RequestStatus::Failed);
            ctx.promise
                .set_error(Error::RequestFailed(e.to_string()));

            // cancel everything submitted so far; their futures resolve
            // through the completion callback
            for prev in &handle.ctxs[..i] {
                prev.status.store(RequestStatus::Cancelled);

                let guard = prev.handle.lock().unwrap();
                if let Some(h) = guard.as_ref() {
                    if let Err(e) = h.cancel() {
                        warn!("failed to cancel RPC: {e}");
                    }
                }
            }

            return Err(Error::Native(e));
        }

        Ok(handle)
    }

    /// Pull the origin's exposed memory into `local`. The transfer covers
    /// `origin.size()` bytes; completion invokes `callback` exactly once on
    /// the progress thread with the request moved back in, so the handler
    /// can still respond. On transfer failure the request is dropped, which
    /// releases its native handle.
    pub fn async_pull<R, F>(
        &self,
        origin: &ExposedMemory,
        local: &ExposedMemory,
        req: Request<R>,
        callback: F,
    ) -> Result<()>
    where
        R: RequestType,
        F: FnOnce(&AsyncEngine, Request<R>) + Send + 'static,
    {
        self.transfer(na::BulkOp::Pull, origin, local, req, callback)
    }

    /// Push `local` into the origin's exposed memory. Same contract as
    /// [`AsyncEngine::async_pull`].
    pub fn async_push<R, F>(
        &self,
        local: &ExposedMemory,
        origin: &ExposedMemory,
        req: Request<R>,
        callback: F,
    ) -> Result<()>
    where
        R: RequestType,
        F: FnOnce(&AsyncEngine, Request<R>) + Send + 'static,
    {
        self.transfer(na::BulkOp::Push, origin, local, req, callback)
    }

    fn transfer<R, F>(
        &self,
        op: na::BulkOp,
        origin: &ExposedMemory,
        local: &ExposedMemory,
        req: Request<R>,
        callback: F,
    ) -> Result<()>
    where
        R: RequestType,
        F: FnOnce(&AsyncEngine, Request<R>) + Send + 'static,
    {
        let origin_bulk = origin.to_native_bulk();
        let local_bulk = local.to_native_bulk();
        let size = origin_bulk.size();

        let handle = Arc::clone(req.native_handle()?);
        let weak = Arc::downgrade(&self.inner);

        let completion: na::BulkCallback = Box::new(move |ret| {
            if ret != na::ReturnCode::Success {
                // the request drops here, releasing the native handle
                debug!("bulk transfer failed: {ret}");
                return;
            }

            let Some(inner) = weak.upgrade() else { return };
            let engine = AsyncEngine { inner };
            callback(&engine, req);
        });

        self.inner
            .context
            .bulk_transfer(&handle, op, &origin_bulk, &local_bulk, size, completion)
            .map_err(Error::Native)?;

        self.inner.stats.bulk_transfers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Serialize `output` and post a best-effort response for `req`.
    /// Failures surface here, not at the origin.
    pub fn respond<R: RequestType>(&self, req: Request<R>, output: R::Output) -> Result<()> {
        let mut buf = Vec::new();
        R::encode_output(&output, &mut buf)?;

        req.native_handle()?.respond(&buf).map_err(Error::Native)?;

        self.inner.stats.responses.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Install a formatter for native-layer log lines.
    pub fn set_native_log_function(&self, f: na::LogFunction) {
        na::set_log_function(f);
    }
}

/// Dedicated thread that drives native progress: drain ready completions,
/// then block in progress for up to 100 ms, until shutdown.
fn progress_thread(context: Arc<na::Context>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Acquire) {
        loop {
            match context.trigger(1) {
                Ok(0) => break,
                Ok(_) => {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(e) => {
                    error!("unexpected return code from trigger: {e}");
                    return;
                }
            }
        }

        if shutdown.load(Ordering::Acquire) {
            break;
        }

        match context.progress(100) {
            Ok(()) | Err(na::Error::Timeout) => {}
            Err(e) => {
                error!("unexpected return code from progress: {e}");
                return;
            }
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        debug!("destroying asynchronous engine");

        self.shutdown.store(true, Ordering::Release);

        if let Some(runner) = self.runner.lock().unwrap().take() {
            debug!("  stopping progress thread");
            if runner.join().is_err() {
                // can't propagate from drop
                error!("progress thread panicked");
            }
        }

        debug!("  cleaning address cache");
        self.addr_cache.lock().unwrap().clear();

        // release the self address before the native context goes away
        self.self_address = None;

        if self.opts.print_stats {
            info!(
                "engine statistics: {} posts, {} responses, {} bulk transfers",
                self.stats.posts.load(Ordering::Relaxed),
                self.stats.responses.load(Ordering::Relaxed),
                self.stats.bulk_transfers.load(Ordering::Relaxed),
            );
        }

        // A forked child must leave the native layer alone; the parent
        // still owns the listening socket and its path.
        if let Some(parent) = self.parent_pid {
            if parent != std::process::id() {
                debug!("  forked child: leaking native resources");
                self.class.leak_resources();
            }
        }
    }
}
