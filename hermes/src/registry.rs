// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use log::*;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use crate::engine::AsyncEngine;
use crate::request::Request;
use crate::{Error, Result};

/// A strongly-typed request/response pair.
///
/// Implementations are unit types carrying the request's identity and its
/// codec: the numeric id (which doubles as the native id), the display name,
/// whether the target produces a response, and total conversion functions
/// between the user-facing input/output records and their wire form.
pub trait RequestType: Sized + Send + 'static {
    /// Public identifier, unique within a process.
    const ID: u16;

    /// Display name, used in log lines and errors.
    const NAME: &'static str;

    /// Whether the target serializes a reply and the origin awaits one.
    const REQUIRES_RESPONSE: bool;

    type Input: Send + Sync + 'static;
    type Output: Send + 'static;

    fn encode_input(input: &Self::Input, buf: &mut Vec<u8>) -> Result<()>;
    fn decode_input(input: &mut &[u8]) -> Result<Self::Input>;
    fn encode_output(output: &Self::Output, buf: &mut Vec<u8>) -> Result<()>;
    fn decode_output(input: &mut &[u8]) -> Result<Self::Output>;
}

/// The id under which a request type is registered with the native layer.
pub(crate) fn native_id<R: RequestType>() -> u64 {
    #[cfg(feature = "margo-compat")]
    {
        crate::margo::mux_id(R::ID, crate::margo::DEFAULT_PROVIDER_ID)
    }
    #[cfg(not(feature = "margo-compat"))]
    {
        R::ID as u64
    }
}

pub(crate) type HandlerFn<R> = Box<dyn Fn(&AsyncEngine, Request<R>) + Send + Sync>;

/// Process-wide descriptor for one request type: identity, dispatcher stub
/// and the user-handler slot filled in by `register_handler`.
pub(crate) struct RequestDescriptor {
    pub(crate) id: u16,
    pub(crate) native_id: u64,
    pub(crate) name: &'static str,
    pub(crate) requires_response: bool,
    type_id: TypeId,
    pub(crate) dispatch: fn(&AsyncEngine, na::Handle),
    handler: RwLock<Option<Box<dyn Any + Send + Sync>>>,
}

fn registry() -> &'static Mutex<HashMap<u16, Arc<RequestDescriptor>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u16, Arc<RequestDescriptor>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Add `R` to the process-wide request registry. Registering the same type
/// twice is idempotent; registering a different type (or different
/// metadata) under an id already taken fails.
pub fn register_request_type<R: RequestType>() -> Result<()> {
    let mut map = registry().lock().unwrap();

    if let Some(existing) = map.get(&R::ID) {
        let identical = existing.type_id == TypeId::of::<R>()
            && existing.name == R::NAME
            && existing.requires_response == R::REQUIRES_RESPONSE;

        if identical {
            return Ok(());
        }

        return Err(Error::ConflictingRequestType(R::ID));
    }

    debug!("adding request type (id={}, name={})", R::ID, R::NAME);

    map.insert(
        R::ID,
        Arc::new(RequestDescriptor {
            id: R::ID,
            native_id: native_id::<R>(),
            name: R::NAME,
            requires_response: R::REQUIRES_RESPONSE,
            type_id: TypeId::of::<R>(),
            dispatch: dispatch_stub::<R>,
            handler: RwLock::new(None),
        }),
    );

    Ok(())
}

pub(crate) fn find(id: u16) -> Option<Arc<RequestDescriptor>> {
    registry().lock().unwrap().get(&id).cloned()
}

pub(crate) fn snapshot() -> Vec<Arc<RequestDescriptor>> {
    registry().lock().unwrap().values().cloned().collect()
}

/// Store the user handler in `R`'s descriptor.
pub(crate) fn set_handler<R: RequestType>(handler: HandlerFn<R>) -> Result<()> {
    let Some(descriptor) = find(R::ID) else {
        return Err(Error::UnknownRequestType(R::ID));
    };

    if descriptor.type_id != TypeId::of::<R>() {
        return Err(Error::ConflictingRequestType(R::ID));
    }

    debug!("setting user handler for requests of type [{}]", R::NAME);

    *descriptor.handler.write().unwrap() = Some(Box::new(handler));
    Ok(())
}

/// Invoked (monomorphized per request type) by the native layer on the
/// progress thread when a request for `R` arrives: decode the input, build
/// the target-side request and hand it to the user handler.
fn dispatch_stub<R: RequestType>(engine: &AsyncEngine, handle: na::Handle) {
    let Some(descriptor) = find(R::ID) else {
        error!("request descriptor for [{}] disappeared", R::NAME);
        return;
    };

    let req = match Request::<R>::from_native(handle) {
        Ok(req) => req,
        Err(e) => {
            error!("failed to decode input for request [{}]: {e}", R::NAME);
            return;
        }
    };

    let guard = descriptor.handler.read().unwrap();

    match guard.as_ref().and_then(|h| h.downcast_ref::<HandlerFn<R>>()) {
        Some(handler) => handler(engine, req),
        // the request drops here, releasing the native handle
        None => error!("user handler for request [{}] not set", R::NAME),
    }
}
