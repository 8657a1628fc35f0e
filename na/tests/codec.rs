// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use na::codec::*;

#[test]
fn scalar_roundtrip() {
    let mut buf = Vec::new();
    put_u32(&mut buf, 0xdead_beef);
    put_i32(&mut buf, -36);
    put_u64(&mut buf, u64::MAX - 1);
    put_bool(&mut buf, true);

    let mut input = buf.as_slice();

    let mut a = 0u32;
    get_u32(&mut a, &mut input).unwrap();
    assert_eq!(a, 0xdead_beef);

    let mut b = 0i32;
    get_i32(&mut b, &mut input).unwrap();
    assert_eq!(b, -36);

    let mut c = 0u64;
    get_u64(&mut c, &mut input).unwrap();
    assert_eq!(c, u64::MAX - 1);

    let mut d = false;
    get_bool(&mut d, &mut input).unwrap();
    assert!(d);

    assert!(input.is_empty());
}

#[test]
fn string_is_padded_to_four_bytes() {
    let mut buf = Vec::new();
    put_str(&mut buf, "Hello world!!!");

    // 4 bytes of length plus 14 bytes of data padded up to 16.
    assert_eq!(buf.len(), 4 + 16);

    let mut input = buf.as_slice();
    let mut out = String::new();
    get_string(&mut out, &mut input).unwrap();
    assert_eq!(out, "Hello world!!!");
    assert!(input.is_empty());
}

#[test]
fn bytes_roundtrip_through_adjacent_fields() {
    let mut buf = Vec::new();
    put_bytes(&mut buf, &[1, 2, 3, 4, 5]);
    put_u32(&mut buf, 7);

    let mut input = buf.as_slice();
    let mut out = Vec::new();
    get_bytes(&mut out, &mut input).unwrap();
    assert_eq!(out, vec![1, 2, 3, 4, 5]);

    let mut tail = 0u32;
    get_u32(&mut tail, &mut input).unwrap();
    assert_eq!(tail, 7);
}

#[test]
fn truncated_input_is_an_error() {
    let mut buf = Vec::new();
    put_str(&mut buf, "truncate me");
    buf.truncate(buf.len() - 2);

    let mut input = buf.as_slice();
    let mut out = String::new();
    assert!(get_string(&mut out, &mut input).is_err());

    let mut short = &[0u8, 1][..];
    let mut val = 0u32;
    assert!(get_u32(&mut val, &mut short).is_err());
}

#[test]
fn bool_rejects_other_values() {
    let mut buf = Vec::new();
    put_u32(&mut buf, 2);

    let mut input = buf.as_slice();
    let mut val = false;
    assert!(get_bool(&mut val, &mut input).is_err());
}
