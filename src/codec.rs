//! AMQP 0-9-1 binary encoding and decoding.
//!
//! This module provides the frame engine and field-type grammar for the
//! mock broker: an `Encoder`/`Decoder` pair wrapping `bytes::BytesMut` with
//! one method per grammar character (`b o B l L f s S F A T`), a frame
//! reader implementing the NEED_MORE/INVALID/parsed contract of the spec,
//! the content-header property codec, and one builder function per
//! server-sent method.
//!
//! # Overview
//!
//! - **Encoder** / **Decoder**: low-level field-type grammar primitives.
//! - **read_frame**: pulls one complete frame out of a byte buffer, or
//!   reports that more bytes are needed, or that the input is malformed.
//! - **decode_*** / **encode_*** free functions: one per AMQP method this
//!   broker understands, built on top of the grammar primitives.
//!
//! # Examples
//!
//! ## Field-type round trip
//!
//! ```rust
//! use mock_amqp_broker::codec::{Encoder, Decoder};
//!
//! let mut enc = Encoder::new();
//! enc.encode_bit(true);
//! enc.encode_bit(false);
//! enc.encode_bit(true);
//! enc.encode_shortstr("hi").unwrap();
//! let bytes = enc.finish();
//!
//! let mut dec = Decoder::new(bytes);
//! assert_eq!(dec.decode_bit().unwrap(), true);
//! assert_eq!(dec.decode_bit().unwrap(), false);
//! assert_eq!(dec.decode_bit().unwrap(), true);
//! assert_eq!(dec.decode_shortstr().unwrap(), "hi");
//! ```

use crate::error::{AmqpError, AmqpResult};
use crate::types::{
    class_id, method_id, BasicProperties, FieldTable, FieldValue, FrameType, FRAME_END,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const FRAME_HEADER_SIZE: usize = 7;

/// A fully parsed frame: type, channel, and raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub channel: u16,
    pub payload: Vec<u8>,
}

/// Outcome of trying to pull one frame out of a buffer.
pub enum FrameRead {
    /// A complete frame was found; holds the frame and the number of bytes consumed.
    Parsed(Frame, usize),
    /// Not enough bytes buffered yet.
    NeedMore,
}

/// Read one frame from the front of `buf`.
///
/// Returns `FrameRead::NeedMore` without consuming anything if `buf` does
/// not yet hold a complete frame. Returns `Err` if the frame-end sentinel is
/// wrong or the frame type tag is unrecognized, both close the connection
/// at the call site.
pub fn read_frame(buf: &[u8]) -> AmqpResult<FrameRead> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(FrameRead::NeedMore);
    }

    let frame_type_byte = buf[0];
    let channel = u16::from_be_bytes([buf[1], buf[2]]);
    let size = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]) as usize;

    let total_len = FRAME_HEADER_SIZE + size + 1;
    if buf.len() < total_len {
        return Ok(FrameRead::NeedMore);
    }

    if buf[total_len - 1] != FRAME_END {
        return Err(AmqpError::frame(format!(
            "invalid frame end marker: {:#x}",
            buf[total_len - 1]
        )));
    }

    let frame_type = FrameType::from_u8(frame_type_byte)
        .ok_or_else(|| AmqpError::frame(format!("unknown frame type {}", frame_type_byte)))?;

    let payload = buf[FRAME_HEADER_SIZE..total_len - 1].to_vec();

    Ok(FrameRead::Parsed(
        Frame {
            frame_type,
            channel,
            payload,
        },
        total_len,
    ))
}

/// Wrap `payload` in the fixed frame envelope: type, channel, size, payload, 0xCE.
fn envelope(frame_type: FrameType, channel: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len() + 1);
    out.put_u8(frame_type as u8);
    out.put_u16(channel);
    out.put_u32(payload.len() as u32);
    out.extend_from_slice(payload);
    out.put_u8(FRAME_END);
    out.to_vec()
}

fn method_payload(class: u16, method: u16, args: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(4 + args.len());
    out.put_u16(class);
    out.put_u16(method);
    out.extend_from_slice(args);
    out.to_vec()
}

/// Encoder for the field-type grammar, writing into a `BytesMut`.
///
/// `b` (bit) values are buffered LSB-first and flushed as soon as any
/// non-bit field is encoded, matching the spec's bit-packing rule.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
    bit_accum: u8,
    bit_count: u8,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Encoder {
            buf: BytesMut::with_capacity(capacity),
            bit_accum: 0,
            bit_count: 0,
        }
    }

    /// Flush any buffered bits into a single octet. Called automatically
    /// before any non-`b` encode so a run of bits always shares one byte.
    pub fn flush_bits(&mut self) {
        if self.bit_count > 0 {
            self.buf.put_u8(self.bit_accum);
            self.bit_accum = 0;
            self.bit_count = 0;
        }
    }

    pub fn encode_bit(&mut self, value: bool) {
        if value {
            self.bit_accum |= 1 << self.bit_count;
        }
        self.bit_count += 1;
        if self.bit_count == 8 {
            self.flush_bits();
        }
    }

    pub fn encode_octet(&mut self, value: u8) {
        self.flush_bits();
        self.buf.put_u8(value);
    }

    pub fn encode_short(&mut self, value: u16) {
        self.flush_bits();
        self.buf.put_u16(value);
    }

    pub fn encode_long(&mut self, value: u32) {
        self.flush_bits();
        self.buf.put_u32(value);
    }

    pub fn encode_longlong(&mut self, value: u64) {
        self.flush_bits();
        self.buf.put_u64(value);
    }

    pub fn encode_float(&mut self, value: f32) {
        self.flush_bits();
        self.buf.put_f32(value);
    }

    pub fn encode_shortstr(&mut self, value: &str) -> AmqpResult<()> {
        self.flush_bits();
        if value.len() > u8::MAX as usize {
            return Err(AmqpError::frame("shortstr longer than 255 bytes"));
        }
        self.buf.put_u8(value.len() as u8);
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    pub fn encode_longstr(&mut self, value: &[u8]) {
        self.flush_bits();
        self.buf.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    pub fn encode_timestamp(&mut self, value: u64) {
        self.flush_bits();
        self.buf.put_u64(value);
    }

    pub fn encode_field_value(&mut self, value: &FieldValue) {
        self.flush_bits();
        match value {
            FieldValue::LongString(s) => {
                self.buf.put_u8(b'S');
                self.encode_longstr(s.as_bytes());
            }
            FieldValue::ShortInt(v) => {
                self.buf.put_u8(b's');
                self.buf.put_i16(*v);
            }
            FieldValue::Boolean(v) => {
                self.buf.put_u8(b't');
                self.buf.put_u8(*v as u8);
            }
            FieldValue::ShortShortInt(v) => {
                self.buf.put_u8(b'b');
                self.buf.put_i8(*v);
            }
            FieldValue::ShortShortUint(v) => {
                self.buf.put_u8(b'B');
                self.buf.put_u8(*v);
            }
            FieldValue::ShortUint(v) => {
                self.buf.put_u8(b'u');
                self.buf.put_u16(*v);
            }
            FieldValue::LongInt(v) => {
                self.buf.put_u8(b'I');
                self.buf.put_i32(*v);
            }
            FieldValue::LongUint(v) => {
                self.buf.put_u8(b'i');
                self.buf.put_u32(*v);
            }
            FieldValue::LongLongInt(v) => {
                self.buf.put_u8(b'l');
                self.buf.put_i64(*v);
            }
            FieldValue::LongLongUint(v) => {
                self.buf.put_u8(b'L');
                self.buf.put_u64(*v);
            }
            FieldValue::Float(v) => {
                self.buf.put_u8(b'f');
                self.buf.put_f32(*v);
            }
            FieldValue::Double(v) => {
                self.buf.put_u8(b'd');
                self.buf.put_f64(*v);
            }
            FieldValue::Decimal { scale, value } => {
                self.buf.put_u8(b'D');
                self.buf.put_u8(*scale);
                self.buf.put_u32(*value);
            }
            FieldValue::FieldTable(table) => {
                self.buf.put_u8(b'F');
                self.encode_field_table(table);
            }
            FieldValue::FieldArray(array) => {
                self.buf.put_u8(b'A');
                self.encode_field_array(array);
            }
            FieldValue::Timestamp(v) => {
                self.buf.put_u8(b'T');
                self.buf.put_u64(*v);
            }
            FieldValue::Void => {
                self.buf.put_u8(b'V');
            }
            FieldValue::Binary(bytes) => {
                self.buf.put_u8(b'x');
                self.buf.put_u32(bytes.len() as u32);
                self.buf.extend_from_slice(bytes);
            }
        }
    }

    pub fn encode_field_table(&mut self, table: &FieldTable) {
        self.flush_bits();
        let mut inner = Encoder::new();
        for (key, value) in table {
            // shortstr keys are always well-formed here: callers only ever
            // build tables from our own strings.
            inner.encode_shortstr(key).expect("field table key too long");
            inner.encode_field_value(value);
        }
        let bytes = inner.finish();
        self.buf.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(&bytes);
    }

    pub fn encode_field_array(&mut self, array: &[FieldValue]) {
        self.flush_bits();
        let mut inner = Encoder::new();
        for value in array {
            inner.encode_field_value(value);
        }
        let bytes = inner.finish();
        self.buf.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(&bytes);
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.flush_bits();
        self.buf.to_vec()
    }
}

/// Decoder for the field-type grammar, reading from a `Bytes` cursor.
pub struct Decoder {
    buf: Bytes,
    bit_accum: u8,
    bit_count: u8,
}

impl Decoder {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Decoder {
            buf: data.into(),
            bit_accum: 0,
            bit_count: 0,
        }
    }

    fn flush_bits(&mut self) {
        self.bit_count = 0;
    }

    fn require(&self, n: usize) -> AmqpResult<()> {
        if self.buf.remaining() < n {
            return Err(AmqpError::frame("unexpected end of field data"));
        }
        Ok(())
    }

    pub fn decode_bit(&mut self) -> AmqpResult<bool> {
        if self.bit_count == 0 {
            self.require(1)?;
            self.bit_accum = self.buf.get_u8();
            self.bit_count = 8;
        }
        let value = (self.bit_accum & 1) != 0;
        self.bit_accum >>= 1;
        self.bit_count -= 1;
        Ok(value)
    }

    pub fn decode_octet(&mut self) -> AmqpResult<u8> {
        self.flush_bits();
        self.require(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn decode_short(&mut self) -> AmqpResult<u16> {
        self.flush_bits();
        self.require(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn decode_long(&mut self) -> AmqpResult<u32> {
        self.flush_bits();
        self.require(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn decode_longlong(&mut self) -> AmqpResult<u64> {
        self.flush_bits();
        self.require(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn decode_float(&mut self) -> AmqpResult<f32> {
        self.flush_bits();
        self.require(4)?;
        Ok(self.buf.get_f32())
    }

    pub fn decode_shortstr(&mut self) -> AmqpResult<String> {
        self.flush_bits();
        self.require(1)?;
        let len = self.buf.get_u8() as usize;
        self.require(len)?;
        let bytes = self.buf.copy_to_bytes(len);
        String::from_utf8(bytes.to_vec())
            .map_err(|_| AmqpError::frame("shortstr is not valid utf-8"))
    }

    /// Longstr bytes, returned raw (not UTF-8 validated). SASL response
    /// bytes must survive as raw bytes to avoid corrupting binary
    /// passwords, and the grammar itself only mandates UTF-8 for shortstr.
    pub fn decode_longstr(&mut self) -> AmqpResult<Vec<u8>> {
        self.flush_bits();
        self.require(4)?;
        let len = self.buf.get_u32() as usize;
        self.require(len)?;
        Ok(self.buf.copy_to_bytes(len).to_vec())
    }

    pub fn decode_timestamp(&mut self) -> AmqpResult<u64> {
        self.decode_longlong()
    }

    pub fn decode_field_value(&mut self) -> AmqpResult<FieldValue> {
        self.flush_bits();
        self.require(1)?;
        let tag = self.buf.get_u8();
        match tag {
            b'S' => {
                let bytes = self.decode_longstr()?;
                match String::from_utf8(bytes) {
                    Ok(s) => Ok(FieldValue::LongString(s)),
                    Err(e) => Ok(FieldValue::Binary(e.into_bytes())),
                }
            }
            // RabbitMQ deviation: 's' decodes as a signed 16-bit int,
            // not a short string, even though the rest of AMQP 0-9-1 doesn't
            // use 's' this way. Decode-only: we never emit this tag.
            b's' => Ok(FieldValue::ShortInt(self.decode_field_i16()?)),
            b't' => Ok(FieldValue::Boolean(self.decode_octet()? != 0)),
            b'b' => Ok(FieldValue::ShortShortInt(self.decode_octet()? as i8)),
            b'B' => Ok(FieldValue::ShortShortUint(self.decode_octet()?)),
            b'u' => Ok(FieldValue::ShortUint(self.decode_short()?)),
            b'I' => Ok(FieldValue::LongInt(self.decode_long()? as i32)),
            b'i' => Ok(FieldValue::LongUint(self.decode_long()?)),
            b'l' => Ok(FieldValue::LongLongInt(self.decode_longlong()? as i64)),
            b'L' => Ok(FieldValue::LongLongUint(self.decode_longlong()?)),
            b'f' => Ok(FieldValue::Float(self.decode_float()?)),
            b'd' => {
                self.require(8)?;
                Ok(FieldValue::Double(self.buf.get_f64()))
            }
            b'D' => {
                let scale = self.decode_octet()?;
                let value = self.decode_long()?;
                Ok(FieldValue::Decimal { scale, value })
            }
            b'F' => Ok(FieldValue::FieldTable(self.decode_field_table()?)),
            b'A' => Ok(FieldValue::FieldArray(self.decode_field_array()?)),
            b'T' => Ok(FieldValue::Timestamp(self.decode_timestamp()?)),
            b'V' => Ok(FieldValue::Void),
            b'x' => {
                self.require(4)?;
                let len = self.buf.get_u32() as usize;
                self.require(len)?;
                Ok(FieldValue::Binary(self.buf.copy_to_bytes(len).to_vec()))
            }
            other => Err(AmqpError::invalid_field(other, 0)),
        }
    }

    fn decode_field_i16(&mut self) -> AmqpResult<i16> {
        self.require(2)?;
        Ok(self.buf.get_i16())
    }

    pub fn decode_field_table(&mut self) -> AmqpResult<FieldTable> {
        self.flush_bits();
        self.require(4)?;
        let len = self.buf.get_u32() as usize;
        self.require(len)?;
        let slice = self.buf.copy_to_bytes(len);
        let mut inner = Decoder::new(slice);
        let mut table = Vec::new();
        while inner.buf.has_remaining() {
            let key = inner.decode_shortstr()?;
            let value = inner.decode_field_value()?;
            table.push((key, value));
        }
        Ok(table)
    }

    pub fn decode_field_array(&mut self) -> AmqpResult<Vec<FieldValue>> {
        self.flush_bits();
        self.require(4)?;
        let len = self.buf.get_u32() as usize;
        self.require(len)?;
        let slice = self.buf.copy_to_bytes(len);
        let mut inner = Decoder::new(slice);
        let mut array = Vec::new();
        while inner.buf.has_remaining() {
            array.push(inner.decode_field_value()?);
        }
        Ok(array)
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}

// ---------------------------------------------------------------------
// Content header: class/weight/body-size/property bitfield.
// ---------------------------------------------------------------------

const PROP_CONTENT_TYPE: u16 = 1 << 15;
const PROP_CONTENT_ENCODING: u16 = 1 << 14;
const PROP_APPLICATION_HEADERS: u16 = 1 << 13;
const PROP_DELIVERY_MODE: u16 = 1 << 12;
const PROP_PRIORITY: u16 = 1 << 11;
const PROP_CORRELATION_ID: u16 = 1 << 10;
const PROP_REPLY_TO: u16 = 1 << 9;
const PROP_EXPIRATION: u16 = 1 << 8;
const PROP_MESSAGE_ID: u16 = 1 << 7;
const PROP_TIMESTAMP: u16 = 1 << 6;
const PROP_TYPE: u16 = 1 << 5;
const PROP_USER_ID: u16 = 1 << 4;
const PROP_APP_ID: u16 = 1 << 3;
const PROP_CLUSTER_ID: u16 = 1 << 2;

/// Decode a content-header frame payload into `(class_id, body_size, properties)`.
pub fn decode_content_header(payload: &[u8]) -> AmqpResult<(u16, u64, BasicProperties)> {
    let mut dec = Decoder::new(payload.to_vec());
    let class = dec.decode_short()?;
    let _weight = dec.decode_short()?;
    let body_size = dec.decode_longlong()?;
    let flags = dec.decode_short()?;

    let mut props = BasicProperties::default();
    if flags & PROP_CONTENT_TYPE != 0 {
        props.content_type = Some(dec.decode_shortstr()?);
    }
    if flags & PROP_CONTENT_ENCODING != 0 {
        props.content_encoding = Some(dec.decode_shortstr()?);
    }
    if flags & PROP_APPLICATION_HEADERS != 0 {
        props.application_headers = Some(dec.decode_field_table()?);
    }
    if flags & PROP_DELIVERY_MODE != 0 {
        props.delivery_mode = Some(dec.decode_octet()?);
    }
    if flags & PROP_PRIORITY != 0 {
        props.priority = Some(dec.decode_octet()?);
    }
    if flags & PROP_CORRELATION_ID != 0 {
        props.correlation_id = Some(dec.decode_shortstr()?);
    }
    if flags & PROP_REPLY_TO != 0 {
        props.reply_to = Some(dec.decode_shortstr()?);
    }
    if flags & PROP_EXPIRATION != 0 {
        props.expiration = Some(dec.decode_shortstr()?);
    }
    if flags & PROP_MESSAGE_ID != 0 {
        props.message_id = Some(dec.decode_shortstr()?);
    }
    if flags & PROP_TIMESTAMP != 0 {
        props.timestamp = Some(dec.decode_timestamp()?);
    }
    if flags & PROP_TYPE != 0 {
        props.kind = Some(dec.decode_shortstr()?);
    }
    if flags & PROP_USER_ID != 0 {
        props.user_id = Some(dec.decode_shortstr()?);
    }
    if flags & PROP_APP_ID != 0 {
        props.app_id = Some(dec.decode_shortstr()?);
    }
    if flags & PROP_CLUSTER_ID != 0 {
        props.cluster_id = Some(dec.decode_shortstr()?);
    }

    Ok((class, body_size, props))
}

fn property_flags(props: &BasicProperties) -> u16 {
    let mut flags = 0u16;
    if props.content_type.is_some() {
        flags |= PROP_CONTENT_TYPE;
    }
    if props.content_encoding.is_some() {
        flags |= PROP_CONTENT_ENCODING;
    }
    if props.application_headers.is_some() {
        flags |= PROP_APPLICATION_HEADERS;
    }
    if props.delivery_mode.is_some() {
        flags |= PROP_DELIVERY_MODE;
    }
    if props.priority.is_some() {
        flags |= PROP_PRIORITY;
    }
    if props.correlation_id.is_some() {
        flags |= PROP_CORRELATION_ID;
    }
    if props.reply_to.is_some() {
        flags |= PROP_REPLY_TO;
    }
    if props.expiration.is_some() {
        flags |= PROP_EXPIRATION;
    }
    if props.message_id.is_some() {
        flags |= PROP_MESSAGE_ID;
    }
    if props.timestamp.is_some() {
        flags |= PROP_TIMESTAMP;
    }
    if props.kind.is_some() {
        flags |= PROP_TYPE;
    }
    if props.user_id.is_some() {
        flags |= PROP_USER_ID;
    }
    if props.app_id.is_some() {
        flags |= PROP_APP_ID;
    }
    if props.cluster_id.is_some() {
        flags |= PROP_CLUSTER_ID;
    }
    flags
}

/// Build a content-header frame for `class_id`/`body_size`/`props`.
pub fn encode_content_header(
    channel: u16,
    class: u16,
    body_size: u64,
    props: &BasicProperties,
) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.encode_short(class);
    enc.encode_short(0); // weight, always 0
    enc.encode_longlong(body_size);
    enc.encode_short(property_flags(props));

    if let Some(v) = &props.content_type {
        enc.encode_shortstr(v).expect("content_type too long");
    }
    if let Some(v) = &props.content_encoding {
        enc.encode_shortstr(v).expect("content_encoding too long");
    }
    if let Some(v) = &props.application_headers {
        enc.encode_field_table(v);
    }
    if let Some(v) = props.delivery_mode {
        enc.encode_octet(v);
    }
    if let Some(v) = props.priority {
        enc.encode_octet(v);
    }
    if let Some(v) = &props.correlation_id {
        enc.encode_shortstr(v).expect("correlation_id too long");
    }
    if let Some(v) = &props.reply_to {
        enc.encode_shortstr(v).expect("reply_to too long");
    }
    if let Some(v) = &props.expiration {
        enc.encode_shortstr(v).expect("expiration too long");
    }
    if let Some(v) = &props.message_id {
        enc.encode_shortstr(v).expect("message_id too long");
    }
    if let Some(v) = props.timestamp {
        enc.encode_timestamp(v);
    }
    if let Some(v) = &props.kind {
        enc.encode_shortstr(v).expect("type too long");
    }
    if let Some(v) = &props.user_id {
        enc.encode_shortstr(v).expect("user_id too long");
    }
    if let Some(v) = &props.app_id {
        enc.encode_shortstr(v).expect("app_id too long");
    }
    if let Some(v) = &props.cluster_id {
        enc.encode_shortstr(v).expect("cluster_id too long");
    }

    envelope(FrameType::Header, channel, &enc.finish())
}

/// Build a content-body frame carrying raw message bytes.
pub fn encode_content_body(channel: u16, body: &[u8]) -> Vec<u8> {
    envelope(FrameType::Body, channel, body)
}

/// The single heartbeat frame (empty payload), echoed back to the client as-is.
pub fn encode_heartbeat() -> Vec<u8> {
    envelope(FrameType::Heartbeat, 0, &[])
}

// ---------------------------------------------------------------------
// Outgoing method builders, one per server-sent method.
// ---------------------------------------------------------------------

fn rabbitmq_style_peer_properties() -> FieldTable {
    vec![
        (
            "product".to_string(),
            FieldValue::LongString("mock-amqp-broker".to_string()),
        ),
        (
            "version".to_string(),
            FieldValue::LongString(env!("CARGO_PKG_VERSION").to_string()),
        ),
        (
            "information".to_string(),
            FieldValue::LongString("test double, not a real broker".to_string()),
        ),
    ]
}

pub fn encode_connection_start(channel: u16) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.encode_octet(0); // version-major
    enc.encode_octet(9); // version-minor
    enc.encode_field_table(&rabbitmq_style_peer_properties());
    enc.encode_longstr(b"PLAIN AMQPLAIN");
    enc.encode_longstr(b"en_US");
    let args = enc.finish();
    envelope(
        FrameType::Method,
        channel,
        &method_payload(class_id::CONNECTION, method_id::CONNECTION_START, &args),
    )
}

pub fn encode_connection_tune(channel: u16) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.encode_short(0); // channel-max
    enc.encode_long(131072); // frame-max
    enc.encode_short(10); // heartbeat
    let args = enc.finish();
    envelope(
        FrameType::Method,
        channel,
        &method_payload(class_id::CONNECTION, method_id::CONNECTION_TUNE, &args),
    )
}

pub fn encode_connection_open_ok(channel: u16) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.encode_shortstr("").expect("empty string always fits");
    let args = enc.finish();
    envelope(
        FrameType::Method,
        channel,
        &method_payload(class_id::CONNECTION, method_id::CONNECTION_OPEN_OK, &args),
    )
}

pub fn encode_connection_close_ok(channel: u16) -> Vec<u8> {
    envelope(
        FrameType::Method,
        channel,
        &method_payload(class_id::CONNECTION, method_id::CONNECTION_CLOSE_OK, &[]),
    )
}

pub fn encode_channel_open_ok(channel: u16) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.encode_longstr(b"");
    let args = enc.finish();
    envelope(
        FrameType::Method,
        channel,
        &method_payload(class_id::CHANNEL, method_id::CHANNEL_OPEN_OK, &args),
    )
}

pub fn encode_channel_close_ok(channel: u16) -> Vec<u8> {
    envelope(
        FrameType::Method,
        channel,
        &method_payload(class_id::CHANNEL, method_id::CHANNEL_CLOSE_OK, &[]),
    )
}

pub fn encode_exchange_declare_ok(channel: u16) -> Vec<u8> {
    envelope(
        FrameType::Method,
        channel,
        &method_payload(class_id::EXCHANGE, method_id::EXCHANGE_DECLARE_OK, &[]),
    )
}

pub fn encode_queue_declare_ok(
    channel: u16,
    queue_name: &str,
    message_count: u32,
    consumer_count: u32,
) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.encode_shortstr(queue_name).expect("queue name too long");
    enc.encode_long(message_count);
    enc.encode_long(consumer_count);
    let args = enc.finish();
    envelope(
        FrameType::Method,
        channel,
        &method_payload(class_id::QUEUE, method_id::QUEUE_DECLARE_OK, &args),
    )
}

pub fn encode_queue_bind_ok(channel: u16) -> Vec<u8> {
    envelope(
        FrameType::Method,
        channel,
        &method_payload(class_id::QUEUE, method_id::QUEUE_BIND_OK, &[]),
    )
}

pub fn encode_basic_qos_ok(channel: u16) -> Vec<u8> {
    envelope(
        FrameType::Method,
        channel,
        &method_payload(class_id::BASIC, method_id::BASIC_QOS_OK, &[]),
    )
}

pub fn encode_basic_consume_ok(channel: u16, consumer_tag: &str) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.encode_shortstr(consumer_tag).expect("consumer tag too long");
    let args = enc.finish();
    envelope(
        FrameType::Method,
        channel,
        &method_payload(class_id::BASIC, method_id::BASIC_CONSUME_OK, &args),
    )
}

pub fn encode_basic_cancel_ok(channel: u16, consumer_tag: &str) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.encode_shortstr(consumer_tag).expect("consumer tag too long");
    let args = enc.finish();
    envelope(
        FrameType::Method,
        channel,
        &method_payload(class_id::BASIC, method_id::BASIC_CANCEL_OK, &args),
    )
}

pub fn encode_basic_deliver(
    channel: u16,
    consumer_tag: &str,
    delivery_tag: u64,
    redelivered: bool,
    exchange: &str,
    routing_key: &str,
) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.encode_shortstr(consumer_tag).expect("consumer tag too long");
    enc.encode_longlong(delivery_tag);
    enc.encode_bit(redelivered);
    enc.encode_shortstr(exchange).expect("exchange name too long");
    enc.encode_shortstr(routing_key).expect("routing key too long");
    let args = enc.finish();
    envelope(
        FrameType::Method,
        channel,
        &method_payload(class_id::BASIC, method_id::BASIC_DELIVER, &args),
    )
}

// ---------------------------------------------------------------------
// Incoming method argument decoders, one per recognized method.
// ---------------------------------------------------------------------

/// Decoded `connection.start-ok` arguments.
pub struct StartOkArgs {
    pub mechanism: String,
    /// Raw SASL response bytes, not UTF-8 validated.
    pub response: Vec<u8>,
}

pub fn decode_start_ok(payload: &[u8]) -> AmqpResult<StartOkArgs> {
    let mut dec = Decoder::new(payload.to_vec());
    let _client_properties = dec.decode_field_table()?;
    let mechanism = dec.decode_shortstr()?;
    let response = dec.decode_longstr()?;
    let _locale = dec.decode_shortstr()?;
    Ok(StartOkArgs { mechanism, response })
}

pub struct ExchangeDeclareArgs {
    pub exchange: String,
    pub exchange_type: String,
}

pub fn decode_exchange_declare(payload: &[u8]) -> AmqpResult<ExchangeDeclareArgs> {
    let mut dec = Decoder::new(payload.to_vec());
    let _reserved = dec.decode_short()?;
    let exchange = dec.decode_shortstr()?;
    let exchange_type = dec.decode_shortstr()?;
    Ok(ExchangeDeclareArgs {
        exchange,
        exchange_type,
    })
}

pub struct QueueDeclareArgs {
    pub queue: String,
}

pub fn decode_queue_declare(payload: &[u8]) -> AmqpResult<QueueDeclareArgs> {
    let mut dec = Decoder::new(payload.to_vec());
    let _reserved = dec.decode_short()?;
    let queue = dec.decode_shortstr()?;
    Ok(QueueDeclareArgs { queue })
}

pub struct QueueBindArgs {
    pub queue: String,
    pub exchange: String,
}

pub fn decode_queue_bind(payload: &[u8]) -> AmqpResult<QueueBindArgs> {
    let mut dec = Decoder::new(payload.to_vec());
    let _reserved = dec.decode_short()?;
    let queue = dec.decode_shortstr()?;
    let exchange = dec.decode_shortstr()?;
    let _routing_key = dec.decode_shortstr()?;
    Ok(QueueBindArgs { queue, exchange })
}

pub struct BasicConsumeArgs {
    pub queue: String,
    pub consumer_tag: String,
}

pub fn decode_basic_consume(payload: &[u8]) -> AmqpResult<BasicConsumeArgs> {
    let mut dec = Decoder::new(payload.to_vec());
    let _reserved = dec.decode_short()?;
    let queue = dec.decode_shortstr()?;
    let consumer_tag = dec.decode_shortstr()?;
    Ok(BasicConsumeArgs { queue, consumer_tag })
}

pub struct BasicPublishArgs {
    pub exchange: String,
    pub routing_key: String,
}

pub fn decode_basic_publish(payload: &[u8]) -> AmqpResult<BasicPublishArgs> {
    let mut dec = Decoder::new(payload.to_vec());
    let _reserved = dec.decode_short()?;
    let exchange = dec.decode_shortstr()?;
    let routing_key = dec.decode_shortstr()?;
    Ok(BasicPublishArgs {
        exchange,
        routing_key,
    })
}

pub struct BasicAckArgs {
    pub delivery_tag: u64,
}

pub fn decode_basic_ack(payload: &[u8]) -> AmqpResult<BasicAckArgs> {
    let mut dec = Decoder::new(payload.to_vec());
    let delivery_tag = dec.decode_longlong()?;
    Ok(BasicAckArgs { delivery_tag })
}

pub struct BasicNackArgs {
    pub delivery_tag: u64,
    pub requeue: bool,
}

pub fn decode_basic_nack(payload: &[u8]) -> AmqpResult<BasicNackArgs> {
    let mut dec = Decoder::new(payload.to_vec());
    let delivery_tag = dec.decode_longlong()?;
    let _multiple = dec.decode_bit()?;
    let requeue = dec.decode_bit()?;
    Ok(BasicNackArgs {
        delivery_tag,
        requeue,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(frame_type: u8, channel: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(frame_type);
        buf.extend_from_slice(&channel.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        buf.push(FRAME_END);
        buf
    }

    #[test]
    fn read_frame_reports_need_more_on_short_header() {
        let buf = [1u8, 0, 0];
        match read_frame(&buf).unwrap() {
            FrameRead::NeedMore => {}
            _ => panic!("expected NeedMore"),
        }
    }

    #[test]
    fn read_frame_reports_need_more_on_partial_payload() {
        let full = frame_bytes(1, 0, b"hello");
        match read_frame(&full[..full.len() - 3]).unwrap() {
            FrameRead::NeedMore => {}
            _ => panic!("expected NeedMore"),
        }
    }

    #[test]
    fn read_frame_parses_complete_frame() {
        let full = frame_bytes(1, 7, b"payload");
        match read_frame(&full).unwrap() {
            FrameRead::Parsed(frame, consumed) => {
                assert_eq!(frame.frame_type, FrameType::Method);
                assert_eq!(frame.channel, 7);
                assert_eq!(frame.payload, b"payload");
                assert_eq!(consumed, full.len());
            }
            FrameRead::NeedMore => panic!("expected Parsed"),
        }
    }

    #[test]
    fn read_frame_rejects_bad_end_marker() {
        let mut full = frame_bytes(1, 0, b"x");
        let last = full.len() - 1;
        full[last] = 0x00;
        assert!(read_frame(&full).is_err());
    }

    #[test]
    fn read_frame_rejects_unknown_frame_type() {
        let full = frame_bytes(99, 0, b"");
        assert!(read_frame(&full).is_err());
    }

    #[test]
    fn encoder_decoder_round_trip_primitives() {
        let mut enc = Encoder::new();
        enc.encode_octet(42);
        enc.encode_short(1000);
        enc.encode_long(100_000);
        enc.encode_longlong(10_000_000_000);
        enc.encode_float(3.5);
        enc.encode_shortstr("hi").unwrap();
        enc.encode_longstr(b"a longer string");
        let bytes = enc.finish();

        let mut dec = Decoder::new(bytes);
        assert_eq!(dec.decode_octet().unwrap(), 42);
        assert_eq!(dec.decode_short().unwrap(), 1000);
        assert_eq!(dec.decode_long().unwrap(), 100_000);
        assert_eq!(dec.decode_longlong().unwrap(), 10_000_000_000);
        assert_eq!(dec.decode_float().unwrap(), 3.5);
        assert_eq!(dec.decode_shortstr().unwrap(), "hi");
        assert_eq!(dec.decode_longstr().unwrap(), b"a longer string");
    }

    #[test]
    fn bits_are_packed_lsb_first_and_share_a_byte() {
        let mut enc = Encoder::new();
        enc.encode_bit(true);
        enc.encode_bit(false);
        enc.encode_bit(true);
        let bytes = enc.finish();
        assert_eq!(bytes, vec![0b0000_0101]);

        let mut dec = Decoder::new(bytes);
        assert_eq!(dec.decode_bit().unwrap(), true);
        assert_eq!(dec.decode_bit().unwrap(), false);
        assert_eq!(dec.decode_bit().unwrap(), true);
    }

    #[test]
    fn non_bit_field_flushes_accumulated_bits() {
        let mut enc = Encoder::new();
        enc.encode_bit(true);
        enc.encode_octet(0xAB);
        let bytes = enc.finish();
        // one flushed bit-byte (0b1) then the octet
        assert_eq!(bytes, vec![0b0000_0001, 0xAB]);
    }

    #[test]
    fn field_table_round_trips_through_encode_decode() {
        let table: FieldTable = vec![
            ("LOGIN".to_string(), FieldValue::LongString("guest".to_string())),
            ("enabled".to_string(), FieldValue::Boolean(true)),
            ("count".to_string(), FieldValue::LongInt(-7)),
        ];
        let mut enc = Encoder::new();
        enc.encode_field_table(&table);
        let bytes = enc.finish();

        let mut dec = Decoder::new(bytes);
        let decoded = dec.decode_field_table().unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn rabbitmq_s_tag_decodes_as_signed_short_int_not_string() {
        // Hand-build a field-table entry with the RabbitMQ 's' tag to prove
        // the decode-only deviation: 's' means signed 16-bit int here, never
        // a short string.
        let mut inner = BytesMut::new();
        inner.put_u8(5);
        inner.extend_from_slice(b"count");
        inner.put_u8(b's');
        inner.put_i16(-42);
        let mut table_bytes = BytesMut::new();
        table_bytes.put_u32(inner.len() as u32);
        table_bytes.extend_from_slice(&inner);

        let mut dec = Decoder::new(table_bytes.to_vec());
        let table = dec.decode_field_table().unwrap();
        assert_eq!(table[0].0, "count");
        assert_eq!(table[0].1, FieldValue::ShortInt(-42));
    }

    #[test]
    fn content_header_round_trips_properties() {
        let props = BasicProperties {
            content_type: Some("text/plain".to_string()),
            delivery_mode: Some(2),
            message_id: Some("msg-1".to_string()),
            ..Default::default()
        };
        let frame = encode_content_header(1, class_id::BASIC, 5, &props);
        match read_frame(&frame).unwrap() {
            FrameRead::Parsed(parsed, _) => {
                assert_eq!(parsed.frame_type, FrameType::Header);
                let (class, body_size, decoded) = decode_content_header(&parsed.payload).unwrap();
                assert_eq!(class, class_id::BASIC);
                assert_eq!(body_size, 5);
                assert_eq!(decoded.content_type, props.content_type);
                assert_eq!(decoded.delivery_mode, props.delivery_mode);
                assert_eq!(decoded.message_id, props.message_id);
            }
            FrameRead::NeedMore => panic!("expected full frame"),
        }
    }

    #[test]
    fn start_ok_decodes_plain_credentials_as_raw_bytes() {
        let mut enc = Encoder::new();
        enc.encode_field_table(&[]);
        enc.encode_shortstr("PLAIN").unwrap();
        enc.encode_longstr(b"\x00guest\x00guest");
        enc.encode_shortstr("en_US").unwrap();
        let args = decode_start_ok(&enc.finish()).unwrap();
        assert_eq!(args.mechanism, "PLAIN");
        assert_eq!(args.response, b"\x00guest\x00guest");
    }

    #[test]
    fn basic_publish_decodes_exchange_and_routing_key() {
        let mut enc = Encoder::new();
        enc.encode_short(0);
        enc.encode_shortstr("ex").unwrap();
        enc.encode_shortstr("rk").unwrap();
        enc.encode_bit(false);
        enc.encode_bit(false);
        let args = decode_basic_publish(&enc.finish()).unwrap();
        assert_eq!(args.exchange, "ex");
        assert_eq!(args.routing_key, "rk");
    }

    #[test]
    fn basic_nack_decodes_requeue_flag() {
        let mut enc = Encoder::new();
        enc.encode_longlong(99);
        enc.encode_bit(false);
        enc.encode_bit(true);
        let args = decode_basic_nack(&enc.finish()).unwrap();
        assert_eq!(args.delivery_tag, 99);
        assert!(args.requeue);
    }

    #[test]
    fn heartbeat_frame_has_empty_payload_and_correct_type() {
        let frame = encode_heartbeat();
        match read_frame(&frame).unwrap() {
            FrameRead::Parsed(parsed, _) => {
                assert_eq!(parsed.frame_type, FrameType::Heartbeat);
                assert!(parsed.payload.is_empty());
            }
            FrameRead::NeedMore => panic!("expected full frame"),
        }
    }
}
