// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use log::*;

use std::collections::HashMap;
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::bulk::LocalBulk;
use crate::sock::Listener;
use crate::{channel_log, Error, Result, RpcCallback};

/// Options for [`Class::init`], mirroring the subset of native init options
/// the engine exposes.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitInfo {
    /// Accelerate same-node traffic over the shared-memory fabric. This
    /// build has no separate same-node path, so the flag is accepted and
    /// recorded only.
    pub auto_sm: bool,

    /// Emit usage statistics on teardown.
    pub stats: bool,

    /// Never block inside progress; poll with a zero timeout instead.
    pub no_block_progress: bool,

    /// Number of leading payload bytes reserved for the caller on every
    /// forwarded request. The same reservation must be configured on both
    /// sides of a connection.
    pub input_offset: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Fabric {
    Tcp,
    Sm,
}

#[derive(Clone)]
pub(crate) struct RegisteredRpc {
    pub(crate) dispatcher: Option<RpcCallback>,
    pub(crate) response_disabled: bool,
}

/// A bound transport instance: the RPC table, the exposed-bulk table, and
/// (in listen mode) the listening socket a [`crate::Context`] will drive.
pub struct Class {
    pub(crate) fabric: Fabric,
    info: InitInfo,
    listen_uri: Option<String>,
    listener: Mutex<Option<Listener>>,
    rpcs: Mutex<HashMap<u64, RegisteredRpc>>,
    bulks: Mutex<HashMap<u64, Weak<LocalBulk>>>,
    next_bulk_id: AtomicU64,
    sm_path: Option<PathBuf>,
    skip_cleanup: AtomicBool,
}

impl Class {
    /// Initialize the transport layer for `uri` (`scheme://body`). With
    /// `listen` set, binds the listening socket; for `ofi+tcp` an empty body
    /// binds an ephemeral loopback port, for `na+sm` the body is the socket
    /// path and is mandatory.
    pub fn init(uri: &str, listen: bool, info: InitInfo) -> Result<Arc<Class>> {
        let Some(pos) = uri.find("://") else {
            return Err(Error::InvalidAddress(uri.to_string()));
        };

        let scheme = &uri[..pos];
        let body = &uri[pos + 3..];

        let fabric = match scheme {
            "ofi+tcp" => Fabric::Tcp,
            "na+sm" => Fabric::Sm,
            other => return Err(Error::Unsupported(other.to_string())),
        };

        if info.auto_sm {
            debug!("auto_sm requested; this build has no separate same-node path");
        }

        let mut listen_uri = None;
        let mut listener = None;
        let mut sm_path = None;

        if listen {
            match fabric {
                Fabric::Tcp => {
                    let bind_to = if body.is_empty() { "127.0.0.1:0" } else { body };
                    let l = TcpListener::bind(bind_to)?;
                    l.set_nonblocking(true)?;
                    listen_uri = Some(format!("ofi+tcp://{}", l.local_addr()?));
                    listener = Some(Listener::Tcp(l));
                }
                Fabric::Sm => {
                    if body.is_empty() {
                        return Err(Error::InvalidAddress(
                            "na+sm requires a socket path".to_string(),
                        ));
                    }
                    let l = UnixListener::bind(body)?;
                    l.set_nonblocking(true)?;
                    listen_uri = Some(format!("na+sm://{body}"));
                    sm_path = Some(PathBuf::from(body));
                    listener = Some(Listener::Unix(l));
                }
            }
        }

        channel_log(format_args!(
            "transport layer initialized (uri: {uri}, listen: {listen})"
        ));

        Ok(Arc::new(Class {
            fabric,
            info,
            listen_uri,
            listener: Mutex::new(listener),
            rpcs: Mutex::new(HashMap::new()),
            bulks: Mutex::new(HashMap::new()),
            next_bulk_id: AtomicU64::new(1),
            sm_path,
            skip_cleanup: AtomicBool::new(false),
        }))
    }

    /// Register `id` in the RPC table. The dispatcher is invoked (through
    /// trigger) for every inbound request with this id; passing `None`
    /// registers the id for origin-side use only.
    pub fn register_rpc(&self, id: u64, dispatcher: Option<RpcCallback>) {
        let mut rpcs = self.rpcs.lock().unwrap();
        let entry = rpcs.entry(id).or_insert(RegisteredRpc {
            dispatcher: None,
            response_disabled: false,
        });
        entry.dispatcher = dispatcher;
    }

    /// Mark `id` as not producing responses: forwards complete as soon as
    /// the request is on the wire and respond() is rejected on the target.
    pub fn disable_response(&self, id: u64, disable: bool) -> Result<()> {
        let mut rpcs = self.rpcs.lock().unwrap();
        match rpcs.get_mut(&id) {
            Some(entry) => {
                entry.response_disabled = disable;
                Ok(())
            }
            None => Err(Error::Protocol("request id is not registered")),
        }
    }

    pub(crate) fn response_disabled(&self, id: u64) -> bool {
        self.rpcs
            .lock()
            .unwrap()
            .get(&id)
            .map(|e| e.response_disabled)
            .unwrap_or(false)
    }

    pub(crate) fn find_rpc(&self, id: u64) -> Option<RegisteredRpc> {
        self.rpcs.lock().unwrap().get(&id).cloned()
    }

    /// The textual address this class listens on. Fails for client-only
    /// classes.
    pub fn self_address(&self) -> Result<String> {
        self.listen_uri
            .clone()
            .ok_or(Error::Protocol("class is not listening"))
    }

    pub(crate) fn no_block_progress(&self) -> bool {
        self.info.no_block_progress
    }

    pub(crate) fn take_listener(&self) -> Option<Listener> {
        self.listener.lock().unwrap().take()
    }

    pub(crate) fn alloc_bulk_id(&self) -> u64 {
        self.next_bulk_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert_bulk(&self, id: u64, bulk: Weak<LocalBulk>) {
        self.bulks.lock().unwrap().insert(id, bulk);
    }

    pub(crate) fn remove_bulk(&self, id: u64) {
        self.bulks.lock().unwrap().remove(&id);
    }

    pub(crate) fn find_bulk(&self, id: u64) -> Option<Arc<LocalBulk>> {
        self.bulks.lock().unwrap().get(&id).and_then(Weak::upgrade)
    }

    /// Leave every OS resource behind on drop. Called in the child of a
    /// fork so that the child cannot tear down state the parent still uses.
    pub fn leak_resources(&self) {
        self.skip_cleanup.store(true, Ordering::Relaxed);
    }
}

impl Drop for Class {
    fn drop(&mut self) {
        if self.skip_cleanup.load(Ordering::Relaxed) {
            return;
        }

        if let Some(path) = &self.sm_path {
            if let Err(e) = std::fs::remove_file(path) {
                // can't propagate from drop
                warn!("failed to remove sm socket {}: {e}", path.display());
            }
        }

        channel_log(format_args!("transport layer finalized"));
    }
}
