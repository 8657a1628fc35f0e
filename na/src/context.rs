// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use log::*;

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use crate::bulk::Bulk;
use crate::class::{Class, Fabric};
use crate::handle::Handle;
use crate::sock::{Listener, Sock};
use crate::wire::{self, Frame};
use crate::{
    Addr, BulkCallback, Error, ForwardCallback, LookupCallback, Result, ReturnCode, RpcCallback,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Direction of a bulk transfer, from the target's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOp {
    /// Read from the origin's exposed memory into local memory.
    Pull,

    /// Write local memory into the origin's exposed memory.
    Push,
}

pub(crate) type ConnId = u64;

pub(crate) struct Conn {
    sock: Sock,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    peer: String,
}

pub(crate) enum Pending {
    Forward {
        conn: ConnId,
        cb: ForwardCallback,
    },
    Bulk {
        conn: ConnId,
        op: BulkOp,
        local: Bulk,
        cb: BulkCallback,
    },
}

impl Pending {
    fn conn(&self) -> ConnId {
        match self {
            Self::Forward { conn, .. } => *conn,
            Self::Bulk { conn, .. } => *conn,
        }
    }
}

pub(crate) enum Completion {
    Forward {
        cb: ForwardCallback,
        ret: ReturnCode,
        output: Option<Vec<u8>>,
    },
    Dispatch {
        cb: RpcCallback,
        handle: Handle,
    },
    Lookup {
        cb: LookupCallback,
        result: Result<Addr>,
    },
    Bulk {
        cb: BulkCallback,
        ret: ReturnCode,
    },
}

pub(crate) struct State {
    conns: HashMap<ConnId, Conn>,
    next_conn_id: ConnId,
    next_cookie: u64,
    pub(crate) pending: HashMap<u64, Pending>,
    pub(crate) completions: VecDeque<Completion>,
}

/// Context state shared with handles and addresses.
pub(crate) struct Shared {
    pub(crate) class: Arc<Class>,
    pub(crate) state: Mutex<State>,
    listener: Option<Listener>,
    wake_rx: OwnedFd,
    wake_tx: OwnedFd,
}

/// The progress context: connection table, pending operations, and the
/// completion queue drained by [`Context::trigger`].
pub struct Context {
    shared: Arc<Shared>,
}

impl Context {
    pub fn new(class: Arc<Class>) -> Result<Context> {
        // Self-notification channel so that submissions from user threads
        // interrupt a blocked poll.
        let (wake_rx, wake_tx) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .map_err(|e| Error::Io(e.into()))?;

        let listener = class.take_listener();

        Ok(Context {
            shared: Arc::new(Shared {
                class,
                state: Mutex::new(State {
                    conns: HashMap::new(),
                    next_conn_id: 1,
                    next_cookie: 1,
                    pending: HashMap::new(),
                    completions: VecDeque::new(),
                }),
                listener,
                wake_rx,
                wake_tx,
            }),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Advance in-flight operations: accept connections, read and decode
    /// inbound frames, serve bulk reads/writes, and flush queued writes.
    /// Blocks for at most `timeout_ms`. Returns [`Error::Timeout`] when
    /// nothing became ready, which callers treat as benign.
    pub fn progress(&self, timeout_ms: u32) -> Result<()> {
        let shared = &self.shared;

        // fd snapshot taken under the lock; the poll itself runs without it
        // so user threads can keep submitting.
        let mut entries: Vec<(Option<ConnId>, RawFd, bool)> = Vec::new();
        {
            let st = shared.state.lock().unwrap();

            if !st.completions.is_empty() {
                return Ok(());
            }

            entries.push((None, shared.wake_rx.as_raw_fd(), false));
            if let Some(l) = &shared.listener {
                entries.push((None, l.as_raw_fd(), false));
            }
            for (id, conn) in &st.conns {
                entries.push((Some(*id), conn.sock.as_raw_fd(), !conn.outbuf.is_empty()));
            }
        }

        let timeout = if shared.class.no_block_progress() {
            0
        } else {
            timeout_ms as libc::c_int
        };

        let mut pollfds: Vec<libc::pollfd> = entries
            .iter()
            .map(|(_, fd, want_out)| libc::pollfd {
                fd: *fd,
                events: libc::POLLIN | if *want_out { libc::POLLOUT } else { 0 },
                revents: 0,
            })
            .collect();

        // SAFETY: pollfds is a valid array of pollfd for the duration of the
        // call. A connection fd closed concurrently (deferred closes go
        // through the command path below, but the race is still possible)
        // surfaces as POLLNVAL on that entry and is handled like a hangup.
        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout,
            )
        };

        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Err(Error::Timeout);
            }
            return Err(Error::Io(err));
        }

        if rc == 0 {
            return Err(Error::Timeout);
        }

        let mut st = shared.state.lock().unwrap();

        // Drain wakeup bytes.
        if pollfds[0].revents & libc::POLLIN != 0 {
            let mut scratch = [0u8; 64];
            while nix::unistd::read(&shared.wake_rx, &mut scratch).is_ok_and(|n| n > 0) {}
        }

        // Accept new connections.
        if let Some(l) = &shared.listener {
            let lfd = l.as_raw_fd();
            let ready = pollfds
                .iter()
                .any(|p| p.fd == lfd && p.revents & libc::POLLIN != 0);
            if ready {
                loop {
                    match l.accept() {
                        Ok((sock, peer)) => {
                            let id = st.next_conn_id;
                            st.next_conn_id += 1;
                            trace!("accepted connection from {peer} (conn {id})");
                            st.conns.insert(
                                id,
                                Conn {
                                    sock,
                                    inbuf: Vec::new(),
                                    outbuf: Vec::new(),
                                    peer,
                                },
                            );
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!("error accepting connection: {e}");
                            break;
                        }
                    }
                }
            }
        }

        let mut frames: Vec<(ConnId, Frame)> = Vec::new();
        let mut dead: Vec<ConnId> = Vec::new();

        for (i, (conn_id, _, _)) in entries.iter().enumerate() {
            let Some(conn_id) = conn_id else { continue };
            let revents = pollfds[i].revents;
            let Some(conn) = st.conns.get_mut(conn_id) else {
                continue;
            };

            if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                dead.push(*conn_id);
                continue;
            }

            if revents & libc::POLLIN != 0 {
                if let Err(e) = read_into(conn) {
                    trace!("connection to {} closed: {e}", conn.peer);
                    dead.push(*conn_id);
                    continue;
                }

                loop {
                    match wire::try_take_frame(&mut conn.inbuf) {
                        Ok(Some(frame)) => frames.push((*conn_id, frame)),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("dropping connection to {}: {e}", conn.peer);
                            dead.push(*conn_id);
                            break;
                        }
                    }
                }
            }

            if revents & libc::POLLOUT != 0 {
                if let Err(e) = try_flush(conn) {
                    trace!("connection to {} closed on write: {e}", conn.peer);
                    dead.push(*conn_id);
                }
            }
        }

        for (conn_id, frame) in frames {
            Shared::handle_frame(shared, &mut st, conn_id, frame);
        }

        for conn_id in dead {
            Shared::close_conn_locked(&mut st, conn_id);
        }

        Ok(())
    }

    /// Run up to `max` ready completion callbacks. Callbacks execute with no
    /// internal lock held, so they may submit further operations.
    pub fn trigger(&self, max: u32) -> Result<u32> {
        let mut count = 0;

        while count < max {
            let item = self.shared.state.lock().unwrap().completions.pop_front();

            let Some(item) = item else { break };

            match item {
                Completion::Forward { cb, ret, output } => cb(ret, output),
                Completion::Dispatch { cb, handle } => cb(handle),
                Completion::Lookup { cb, result } => cb(result),
                Completion::Bulk { cb, ret } => cb(ret),
            }

            count += 1;
        }

        Ok(count)
    }

    /// Resolve `name` and deliver the resulting address through the
    /// completion queue. Connection establishment is the synchronous part;
    /// the caller observes the result only via trigger.
    pub fn addr_lookup(&self, name: &str, cb: LookupCallback) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let result = connect(&shared, name);

        let mut st = shared.state.lock().unwrap();
        let result = result.map(|sock| {
            let id = st.next_conn_id;
            st.next_conn_id += 1;
            st.conns.insert(
                id,
                Conn {
                    sock,
                    inbuf: Vec::new(),
                    outbuf: Vec::new(),
                    peer: name.to_string(),
                },
            );
            Addr::connected(name.to_string(), id, Arc::downgrade(&shared))
        });

        st.completions.push_back(Completion::Lookup { cb, result });
        drop(st);

        shared.wake();
        Ok(())
    }

    /// The textual address this context's class listens on.
    pub fn addr_self(&self) -> Result<Addr> {
        Ok(Addr::unconnected(self.shared.class.self_address()?))
    }

    /// Start a bulk transfer against the origin of `handle`'s request. The
    /// origin descriptor must have arrived over the wire; `local` must be
    /// locally registered, writable for pulls and readable for pushes.
    /// `cb` runs exactly once, from trigger, with the transfer result.
    pub fn bulk_transfer(
        &self,
        handle: &Handle,
        op: BulkOp,
        origin: &Bulk,
        local: &Bulk,
        size: u64,
        cb: BulkCallback,
    ) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidBulk("transfer size is zero"));
        }

        let Some(origin_id) = origin.origin_id() else {
            return Err(Error::InvalidBulk("origin descriptor is not remote"));
        };

        if origin.size() < size {
            return Err(Error::InvalidBulk("transfer exceeds origin descriptor"));
        }

        let Some(local_bulk) = local.local() else {
            return Err(Error::InvalidBulk("local descriptor is not local"));
        };

        if local_bulk.size < size {
            return Err(Error::InvalidBulk("transfer exceeds local memory"));
        }

        match op {
            BulkOp::Pull => {
                if !local_bulk.flags.writable() {
                    return Err(Error::InvalidBulk("local memory is not writable"));
                }
            }
            BulkOp::Push => {
                if !local_bulk.flags.readable() {
                    return Err(Error::InvalidBulk("local memory is not readable"));
                }
            }
        }

        let conn = handle.conn_id().ok_or(Error::Disconnected)?;

        let frame_data = match op {
            BulkOp::Pull => None,
            BulkOp::Push => Some(
                local_bulk
                    .read_region(0, size)
                    .ok_or(Error::InvalidBulk("local read out of range"))?,
            ),
        };

        let mut st = self.shared.state.lock().unwrap();

        if !st.conns.contains_key(&conn) {
            return Err(Error::Disconnected);
        }

        let cookie = st.next_cookie;
        st.next_cookie += 1;

        let frame = match op {
            BulkOp::Pull => Frame::BulkGet {
                cookie,
                bulk_id: origin_id,
                offset: 0,
                len: size,
            },
            BulkOp::Push => Frame::BulkPut {
                cookie,
                bulk_id: origin_id,
                offset: 0,
                data: frame_data.unwrap(),
            },
        };

        self.shared.queue_frame_locked(&mut st, conn, frame)?;
        st.pending.insert(
            cookie,
            Pending::Bulk {
                conn,
                op,
                local: local.clone(),
                cb,
            },
        );

        drop(st);
        self.shared.wake();
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Queued dispatch completions hold handles that point back at the
        // shared state; clear everything so the reference cycle cannot
        // outlive the context.
        let mut st = self.shared.state.lock().unwrap();
        st.completions.clear();
        st.pending.clear();
        st.conns.clear();
    }
}

impl Shared {
    pub(crate) fn wake(&self) {
        // A full buffer already guarantees the poller will wake.
        let _ = nix::unistd::write(&self.wake_tx, &[1u8]);
    }

    /// Append a frame to a connection's write queue and flush what the
    /// socket will take right now.
    pub(crate) fn queue_frame_locked(
        &self,
        st: &mut State,
        conn_id: ConnId,
        frame: Frame,
    ) -> Result<()> {
        let Some(conn) = st.conns.get_mut(&conn_id) else {
            return Err(Error::Disconnected);
        };

        conn.outbuf.extend_from_slice(&frame.serialize_alloc());

        if let Err(e) = try_flush(conn) {
            trace!("connection to {} closed on write: {e}", conn.peer);
            Self::close_conn_locked(st, conn_id);
            return Err(Error::Disconnected);
        }

        Ok(())
    }

    /// Allocate a cookie and submit a request frame; registers the pending
    /// forward when a response is expected, otherwise completes immediately.
    pub(crate) fn submit_forward(
        &self,
        conn: ConnId,
        rpc_id: u64,
        expect_response: bool,
        payload: &[u8],
        cb: ForwardCallback,
    ) -> Result<u64> {
        let mut st = self.state.lock().unwrap();

        if !st.conns.contains_key(&conn) {
            return Err(Error::Disconnected);
        }

        let cookie = st.next_cookie;
        st.next_cookie += 1;

        let frame = Frame::Request {
            id: rpc_id,
            cookie,
            expect_response,
            payload: payload.to_vec(),
        };

        self.queue_frame_locked(&mut st, conn, frame)?;

        if expect_response {
            st.pending.insert(cookie, Pending::Forward { conn, cb });
        } else {
            st.completions.push_back(Completion::Forward {
                cb,
                ret: ReturnCode::Success,
                output: None,
            });
        }

        drop(st);
        self.wake();
        Ok(cookie)
    }

    /// Cancel the pending forward registered under `cookie`, if any. The
    /// callback completes with [`ReturnCode::Canceled`] through trigger.
    pub(crate) fn cancel_forward(&self, cookie: u64) {
        let mut st = self.state.lock().unwrap();

        if let Some(Pending::Forward { cb, .. }) = st.pending.remove(&cookie) {
            st.completions.push_back(Completion::Forward {
                cb,
                ret: ReturnCode::Canceled,
                output: None,
            });
            drop(st);
            self.wake();
        }
    }

    /// Drop the pending forward registered under `cookie` without invoking
    /// its callback. Used when the owning handle goes away.
    pub(crate) fn forget_forward(&self, cookie: u64) {
        let mut st = self.state.lock().unwrap();
        st.pending.remove(&cookie);
    }

    pub(crate) fn respond(&self, conn: ConnId, cookie: u64, payload: &[u8]) -> Result<()> {
        let mut st = self.state.lock().unwrap();

        let frame = Frame::Response {
            cookie,
            status: wire::STATUS_OK,
            payload: payload.to_vec(),
        };

        self.queue_frame_locked(&mut st, conn, frame)?;
        drop(st);
        self.wake();
        Ok(())
    }

    pub(crate) fn close_conn(shared: &Arc<Shared>, conn_id: ConnId) {
        let mut st = shared.state.lock().unwrap();
        Shared::close_conn_locked(&mut st, conn_id);
        drop(st);
        shared.wake();
    }

    fn close_conn_locked(st: &mut State, conn_id: ConnId) {
        if st.conns.remove(&conn_id).is_none() {
            return;
        }

        // Every operation waiting on this connection completes with an
        // error through the normal trigger path.
        let cookies: Vec<u64> = st
            .pending
            .iter()
            .filter(|(_, p)| p.conn() == conn_id)
            .map(|(c, _)| *c)
            .collect();

        for cookie in cookies {
            match st.pending.remove(&cookie) {
                Some(Pending::Forward { cb, .. }) => {
                    st.completions.push_back(Completion::Forward {
                        cb,
                        ret: ReturnCode::Disconnected,
                        output: None,
                    });
                }
                Some(Pending::Bulk { cb, .. }) => {
                    st.completions.push_back(Completion::Bulk {
                        cb,
                        ret: ReturnCode::Disconnected,
                    });
                }
                None => {}
            }
        }
    }

    fn handle_frame(shared: &Arc<Shared>, st: &mut State, conn_id: ConnId, frame: Frame) {
        match frame {
            Frame::Request {
                id,
                cookie,
                expect_response,
                payload,
            } => {
                let rpc = shared.class.find_rpc(id);

                let Some(rpc) = rpc else {
                    debug!("request for unknown id {id}");
                    if expect_response {
                        let _ = shared.queue_frame_locked(
                            st,
                            conn_id,
                            Frame::Response {
                                cookie,
                                status: wire::STATUS_NO_MATCH,
                                payload: Vec::new(),
                            },
                        );
                    }
                    return;
                };

                let Some(dispatcher) = rpc.dispatcher else {
                    debug!("request for id {id} but no dispatcher registered");
                    if expect_response {
                        let _ = shared.queue_frame_locked(
                            st,
                            conn_id,
                            Frame::Response {
                                cookie,
                                status: wire::STATUS_NO_MATCH,
                                payload: Vec::new(),
                            },
                        );
                    }
                    return;
                };

                let handle = Handle::target(
                    Arc::clone(shared),
                    conn_id,
                    cookie,
                    expect_response && !rpc.response_disabled,
                    payload,
                );

                st.completions.push_back(Completion::Dispatch {
                    cb: dispatcher,
                    handle,
                });
            }

            Frame::Response {
                cookie,
                status,
                payload,
            } => match st.pending.remove(&cookie) {
                Some(Pending::Forward { cb, .. }) => {
                    let ret = wire::status_to_return_code(status);
                    let output = (ret == ReturnCode::Success).then_some(payload);
                    st.completions.push_back(Completion::Forward {
                        cb,
                        ret,
                        output,
                    });
                }
                Some(other) => {
                    // Put it back; a response cookie must match a forward.
                    warn!("response cookie {cookie} matches a non-forward operation");
                    st.pending.insert(cookie, other);
                }
                // A response racing a local cancel is expected.
                None => trace!("response for unknown cookie {cookie}"),
            },

            Frame::BulkGet {
                cookie,
                bulk_id,
                offset,
                len,
            } => {
                let (status, data) = match shared.class.find_bulk(bulk_id) {
                    Some(local) if !local.flags.readable() => (wire::STATUS_ACCESS, Vec::new()),
                    Some(local) => match local.read_region(offset, len) {
                        Some(data) => (wire::STATUS_OK, data),
                        None => (wire::STATUS_BAD_BULK, Vec::new()),
                    },
                    None => (wire::STATUS_BAD_BULK, Vec::new()),
                };

                let _ = shared.queue_frame_locked(
                    st,
                    conn_id,
                    Frame::BulkData {
                        cookie,
                        status,
                        data,
                    },
                );
            }

            Frame::BulkData {
                cookie,
                status,
                data,
            } => match st.pending.remove(&cookie) {
                Some(Pending::Bulk {
                    op: BulkOp::Pull,
                    local,
                    cb,
                    ..
                }) => {
                    let ret = match wire::status_to_return_code(status) {
                        ReturnCode::Success => match local.local() {
                            Some(l) if l.write_region(0, &data) => ReturnCode::Success,
                            _ => ReturnCode::Protocol,
                        },
                        err => err,
                    };
                    st.completions.push_back(Completion::Bulk { cb, ret });
                }
                Some(other) => {
                    warn!("bulk data cookie {cookie} matches a non-pull operation");
                    st.pending.insert(cookie, other);
                }
                None => trace!("bulk data for unknown cookie {cookie}"),
            },

            Frame::BulkPut {
                cookie,
                bulk_id,
                offset,
                data,
            } => {
                let status = match shared.class.find_bulk(bulk_id) {
                    Some(local) if !local.flags.writable() => wire::STATUS_ACCESS,
                    Some(local) if local.write_region(offset, &data) => wire::STATUS_OK,
                    Some(_) => wire::STATUS_BAD_BULK,
                    None => wire::STATUS_BAD_BULK,
                };

                let _ = shared.queue_frame_locked(st, conn_id, Frame::BulkAck { cookie, status });
            }

            Frame::BulkAck { cookie, status } => match st.pending.remove(&cookie) {
                Some(Pending::Bulk {
                    op: BulkOp::Push,
                    cb,
                    ..
                }) => {
                    st.completions.push_back(Completion::Bulk {
                        cb,
                        ret: wire::status_to_return_code(status),
                    });
                }
                Some(other) => {
                    warn!("bulk ack cookie {cookie} matches a non-push operation");
                    st.pending.insert(cookie, other);
                }
                None => trace!("bulk ack for unknown cookie {cookie}"),
            },
        }
    }
}

fn read_into(conn: &mut Conn) -> std::io::Result<()> {
    let mut chunk = [0u8; 16 * 1024];

    loop {
        match conn.sock.read(&mut chunk) {
            Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => conn.inbuf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn try_flush(conn: &mut Conn) -> std::io::Result<()> {
    while !conn.outbuf.is_empty() {
        match conn.sock.write(&conn.outbuf) {
            Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                conn.outbuf.drain(..n);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Establish the connection behind an address lookup. Resolution and connect
/// are synchronous; errors are reported through the lookup completion.
fn connect(shared: &Arc<Shared>, name: &str) -> Result<Sock> {
    let Some(pos) = name.find("://") else {
        return Err(Error::InvalidAddress(name.to_string()));
    };

    let scheme = &name[..pos];
    let body = &name[pos + 3..];

    match (scheme, shared.class.fabric) {
        ("ofi+tcp", Fabric::Tcp) => {
            use std::net::ToSocketAddrs;

            let addr = body
                .to_socket_addrs()
                .map_err(|_| Error::InvalidAddress(name.to_string()))?
                .next()
                .ok_or_else(|| Error::InvalidAddress(name.to_string()))?;

            let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
            stream.set_nodelay(true)?;
            stream.set_nonblocking(true)?;
            Ok(Sock::Tcp(stream))
        }
        ("na+sm", Fabric::Sm) => {
            let stream = UnixStream::connect(body)?;
            stream.set_nonblocking(true)?;
            Ok(Sock::Unix(stream))
        }
        (other, _) => Err(Error::Unsupported(other.to_string())),
    }
}
