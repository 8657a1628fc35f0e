// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Message framing.
//!
//! Every message on a connection is a 4-byte record mark (payload length with
//! the high bit set) followed by the encoded message body.

use crate::codec::*;
use crate::{Error, ReturnCode};

/// Reject frames larger than this; protects against a corrupted record mark
/// causing an enormous allocation.
const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// High bit of a record mark, set on every frame this implementation
/// produces. Messages are never split across fragments.
const LAST_FRAGMENT: u32 = 1 << 31;

pub(crate) const STATUS_OK: u32 = 0;
pub(crate) const STATUS_NO_MATCH: u32 = 1;
pub(crate) const STATUS_ACCESS: u32 = 2;
pub(crate) const STATUS_BAD_BULK: u32 = 3;

pub(crate) fn status_to_return_code(status: u32) -> ReturnCode {
    match status {
        STATUS_OK => ReturnCode::Success,
        STATUS_NO_MATCH => ReturnCode::NoMatch,
        STATUS_ACCESS => ReturnCode::Access,
        STATUS_BAD_BULK => ReturnCode::BadBulk,
        _ => ReturnCode::Protocol,
    }
}

const TAG_REQUEST: u32 = 1;
const TAG_RESPONSE: u32 = 2;
const TAG_BULK_GET: u32 = 3;
const TAG_BULK_DATA: u32 = 4;
const TAG_BULK_PUT: u32 = 5;
const TAG_BULK_ACK: u32 = 6;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    /// A forwarded request.
    Request {
        id: u64,
        cookie: u64,
        expect_response: bool,
        payload: Vec<u8>,
    },

    /// The response to a request, matched by cookie.
    Response {
        cookie: u64,
        status: u32,
        payload: Vec<u8>,
    },

    /// Ask the peer to read `len` bytes out of its bulk descriptor
    /// `bulk_id` starting at `offset` (a pull, from the target's view).
    BulkGet {
        cookie: u64,
        bulk_id: u64,
        offset: u64,
        len: u64,
    },

    /// The data answering a BulkGet.
    BulkData {
        cookie: u64,
        status: u32,
        data: Vec<u8>,
    },

    /// Write `data` into the peer's bulk descriptor `bulk_id` at `offset`
    /// (a push, from the target's view).
    BulkPut {
        cookie: u64,
        bulk_id: u64,
        offset: u64,
        data: Vec<u8>,
    },

    /// Acknowledges a BulkPut.
    BulkAck { cookie: u64, status: u32 },
}

impl Frame {
    /// Encode the frame, record mark included. The body is encoded first
    /// and the mark derived from its final length, so no patching ever
    /// happens after the fact.
    pub(crate) fn serialize_alloc(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        match self {
            Frame::Request {
                id,
                cookie,
                expect_response,
                payload,
            } => {
                put_u32(&mut buf, TAG_REQUEST);
                put_u64(&mut buf, *id);
                put_u64(&mut buf, *cookie);
                put_bool(&mut buf, *expect_response);
                put_bytes(&mut buf, payload);
            }
            Frame::Response {
                cookie,
                status,
                payload,
            } => {
                put_u32(&mut buf, TAG_RESPONSE);
                put_u64(&mut buf, *cookie);
                put_u32(&mut buf, *status);
                put_bytes(&mut buf, payload);
            }
            Frame::BulkGet {
                cookie,
                bulk_id,
                offset,
                len,
            } => {
                put_u32(&mut buf, TAG_BULK_GET);
                put_u64(&mut buf, *cookie);
                put_u64(&mut buf, *bulk_id);
                put_u64(&mut buf, *offset);
                put_u64(&mut buf, *len);
            }
            Frame::BulkData {
                cookie,
                status,
                data,
            } => {
                put_u32(&mut buf, TAG_BULK_DATA);
                put_u64(&mut buf, *cookie);
                put_u32(&mut buf, *status);
                put_bytes(&mut buf, data);
            }
            Frame::BulkPut {
                cookie,
                bulk_id,
                offset,
                data,
            } => {
                put_u32(&mut buf, TAG_BULK_PUT);
                put_u64(&mut buf, *cookie);
                put_u64(&mut buf, *bulk_id);
                put_u64(&mut buf, *offset);
                put_bytes(&mut buf, data);
            }
            Frame::BulkAck { cookie, status } => {
                put_u32(&mut buf, TAG_BULK_ACK);
                put_u64(&mut buf, *cookie);
                put_u32(&mut buf, *status);
            }
        }

        // the receive side enforces the same cap
        assert!(buf.len() as u64 <= MAX_FRAME_SIZE as u64, "frame body too large");

        let mark = LAST_FRAGMENT | buf.len() as u32;

        let mut framed = Vec::with_capacity(4 + buf.len());
        framed.extend_from_slice(&mark.to_be_bytes());
        framed.append(&mut buf);
        framed
    }

    fn deserialize(mut body: &[u8]) -> Result<Frame, Error> {
        let input = &mut body;

        let mut tag = 0u32;
        get_u32(&mut tag, input)?;

        let frame = match tag {
            TAG_REQUEST => {
                let mut id = 0u64;
                let mut cookie = 0u64;
                let mut expect_response = false;
                let mut payload = Vec::new();
                get_u64(&mut id, input)?;
                get_u64(&mut cookie, input)?;
                get_bool(&mut expect_response, input)?;
                get_bytes(&mut payload, input)?;
                Frame::Request {
                    id,
                    cookie,
                    expect_response,
                    payload,
                }
            }
            TAG_RESPONSE => {
                let mut cookie = 0u64;
                let mut status = 0u32;
                let mut payload = Vec::new();
                get_u64(&mut cookie, input)?;
                get_u32(&mut status, input)?;
                get_bytes(&mut payload, input)?;
                Frame::Response {
                    cookie,
                    status,
                    payload,
                }
            }
            TAG_BULK_GET => {
                let mut cookie = 0u64;
                let mut bulk_id = 0u64;
                let mut offset = 0u64;
                let mut len = 0u64;
                get_u64(&mut cookie, input)?;
                get_u64(&mut bulk_id, input)?;
                get_u64(&mut offset, input)?;
                get_u64(&mut len, input)?;
                Frame::BulkGet {
                    cookie,
                    bulk_id,
                    offset,
                    len,
                }
            }
            TAG_BULK_DATA => {
                let mut cookie = 0u64;
                let mut status = 0u32;
                let mut data = Vec::new();
                get_u64(&mut cookie, input)?;
                get_u32(&mut status, input)?;
                get_bytes(&mut data, input)?;
                Frame::BulkData {
                    cookie,
                    status,
                    data,
                }
            }
            TAG_BULK_PUT => {
                let mut cookie = 0u64;
                let mut bulk_id = 0u64;
                let mut offset = 0u64;
                let mut data = Vec::new();
                get_u64(&mut cookie, input)?;
                get_u64(&mut bulk_id, input)?;
                get_u64(&mut offset, input)?;
                get_bytes(&mut data, input)?;
                Frame::BulkPut {
                    cookie,
                    bulk_id,
                    offset,
                    data,
                }
            }
            TAG_BULK_ACK => {
                let mut cookie = 0u64;
                let mut status = 0u32;
                get_u64(&mut cookie, input)?;
                get_u32(&mut status, input)?;
                Frame::BulkAck { cookie, status }
            }
            _ => return Err(Error::Protocol("unknown frame tag")),
        };

        Ok(frame)
    }
}

/// Recover the body length from a record mark. Every frame carries the
/// last-fragment bit; a clear bit means the peer splits messages into
/// fragments, which this implementation does not speak. A length above the
/// cap is treated as a corrupted mark rather than honored.
fn frame_len(mark: u32) -> Result<usize, Error> {
    if mark & LAST_FRAGMENT == 0 {
        return Err(Error::Protocol("fragmented message"));
    }

    let len = mark & !LAST_FRAGMENT;

    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol("frame exceeds maximum size"));
    }

    Ok(len as usize)
}

/// Try to extract one complete frame from the front of a connection's read
/// buffer. Returns `Ok(None)` if the buffer does not yet hold a full frame.
pub(crate) fn try_take_frame(inbuf: &mut Vec<u8>) -> Result<Option<Frame>, Error> {
    if inbuf.len() < 4 {
        return Ok(None);
    }

    let mark = u32::from_be_bytes(inbuf[..4].try_into().unwrap());
    let len = frame_len(mark)?;

    if inbuf.len() < 4 + len {
        return Ok(None);
    }

    let frame = Frame::deserialize(&inbuf[4..4 + len])?;
    inbuf.drain(..4 + len);

    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let mut bytes = frame.serialize_alloc();
        let taken = try_take_frame(&mut bytes).unwrap().unwrap();
        assert_eq!(frame, taken);
        assert!(bytes.is_empty());
    }

    #[test]
    fn frame_roundtrips() {
        roundtrip(Frame::Request {
            id: 42,
            cookie: 7,
            expect_response: true,
            payload: b"hello".to_vec(),
        });
        roundtrip(Frame::Response {
            cookie: 7,
            status: STATUS_OK,
            payload: vec![0, 0, 0, 36],
        });
        roundtrip(Frame::BulkGet {
            cookie: 9,
            bulk_id: 3,
            offset: 0,
            len: 44,
        });
        roundtrip(Frame::BulkData {
            cookie: 9,
            status: STATUS_OK,
            data: vec![1, 2, 3],
        });
        roundtrip(Frame::BulkPut {
            cookie: 10,
            bulk_id: 4,
            offset: 16,
            data: vec![9; 33],
        });
        roundtrip(Frame::BulkAck {
            cookie: 10,
            status: STATUS_ACCESS,
        });
    }

    #[test]
    fn incomplete_frames_wait_for_more_data() {
        let full = Frame::Request {
            id: 1,
            cookie: 2,
            expect_response: false,
            payload: vec![5; 64],
        }
        .serialize_alloc();

        let mut partial = full[..full.len() - 1].to_vec();
        assert!(try_take_frame(&mut partial).unwrap().is_none());

        partial.push(full[full.len() - 1]);
        assert!(try_take_frame(&mut partial).unwrap().is_some());
    }

    #[test]
    fn fragment_bit_is_rejected() {
        let mut buf = vec![0, 0, 0, 8, 1, 2, 3, 4, 5, 6, 7, 8];
        assert!(try_take_frame(&mut buf).is_err());
    }
}
