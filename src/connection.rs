//! Per-TCP-connection AMQP 0-9-1 state machine.
//!
//! One `Connection` owns one accepted socket. It reads bytes into a buffer,
//! pulls frames out with [`codec::read_frame`] until the codec reports
//! `NeedMore`, dispatches each frame against the connection/channel state
//! machine, and writes replies out through a small writer task so that a
//! registered consumer can push a delivery onto the same socket without
//! fighting the read loop for the write half.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::broker::{BrokerState, MessageSink};
use crate::codec::{
    decode_basic_ack, decode_basic_consume, decode_basic_nack, decode_basic_publish,
    decode_content_header, decode_exchange_declare, decode_queue_bind, decode_queue_declare,
    decode_start_ok, encode_basic_cancel_ok, encode_basic_consume_ok, encode_basic_deliver,
    encode_basic_qos_ok, encode_channel_close_ok, encode_channel_open_ok, encode_connection_close_ok,
    encode_connection_open_ok, encode_connection_start, encode_connection_tune,
    encode_content_body, encode_content_header, encode_exchange_declare_ok, encode_heartbeat,
    encode_queue_bind_ok, encode_queue_declare_ok, read_frame, Decoder, Frame, FrameRead,
};
use crate::error::{AmqpError, AmqpResult};
use crate::types::{class_id, field_table_get, incoming, BasicProperties, FrameType, PROTOCOL_HEADER};

/// Connection-level handshake states, applying to frames on channel 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    WaitingStartOk,
    WaitingTuneOk,
    WaitingOpen,
    Opened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    WaitingOpen,
    Opened,
    WaitingHeader,
    WaitingBody,
}

struct PendingMessage {
    properties: BasicProperties,
    body_size: u64,
    body_accum: Vec<u8>,
}

struct CurrentPublish {
    exchange: String,
    routing_key: String,
    pending_message: Option<PendingMessage>,
}

struct Channel {
    state: ChannelState,
    current_publish: Option<CurrentPublish>,
}

impl Channel {
    fn new() -> Self {
        Channel {
            state: ChannelState::WaitingOpen,
            current_publish: None,
        }
    }
}

/// Implements [`MessageSink`] over a channel into this connection's writer
/// task, so the broker can push a delivery without ever holding a raw
/// connection reference.
struct ConnectionSink {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl MessageSink for ConnectionSink {
    fn push(
        &self,
        channel: u16,
        consumer_tag: &str,
        delivery_tag: u32,
        exchange: &str,
        routing_key: &str,
        properties: &BasicProperties,
        body: &[u8],
    ) {
        let _ = self.outbound.send(encode_basic_deliver(
            channel,
            consumer_tag,
            delivery_tag as u64,
            false,
            exchange,
            routing_key,
        ));
        let _ = self.outbound.send(encode_content_header(
            channel,
            class_id::BASIC,
            body.len() as u64,
            properties,
        ));
        if !body.is_empty() {
            let _ = self.outbound.send(encode_content_body(channel, body));
        }
    }

    fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Splits the accepted socket, spawns its writer task, and drives the AMQP
/// state machine to completion. Returns once the socket closes (either end).
pub async fn serve(stream: TcpStream, broker: BrokerState) -> AmqpResult<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let (outbound, inbound) = mpsc::unbounded_channel();
    tokio::spawn(run_writer(writer, inbound));

    let conn = Connection {
        reader,
        outbound: outbound.clone(),
        sink: Arc::new(ConnectionSink { outbound }),
        buffer: Vec::new(),
        state: ConnectionState::WaitingStartOk,
        channels: HashMap::new(),
        broker,
        peer,
    };
    conn.run().await
}

async fn run_writer(mut writer: OwnedWriteHalf, mut inbound: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = inbound.recv().await {
        if writer.write_all(&bytes).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

struct Connection {
    reader: tokio::net::tcp::OwnedReadHalf,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    sink: Arc<ConnectionSink>,
    buffer: Vec<u8>,
    state: ConnectionState,
    channels: HashMap<u16, Channel>,
    broker: BrokerState,
    peer: Option<SocketAddr>,
}

fn extract_method(payload: &[u8]) -> AmqpResult<(u32, &[u8])> {
    if payload.len() < 4 {
        return Err(AmqpError::frame("method frame shorter than the class/method header"));
    }
    let class = u16::from_be_bytes([payload[0], payload[1]]);
    let method = u16::from_be_bytes([payload[2], payload[3]]);
    Ok((crate::types::method_key(class, method), &payload[4..]))
}

/// Splits a SASL response into `(username, password)` per mechanism.
/// Decoded as raw bytes, not UTF-8, so a binary password survives the round
/// trip.
fn parse_credentials(mechanism: &str, response: &[u8]) -> AmqpResult<(String, Vec<u8>)> {
    match mechanism {
        "PLAIN" => {
            let parts: Vec<&[u8]> = response.splitn(3, |b| *b == 0).collect();
            if parts.len() != 3 {
                return Err(AmqpError::handshake("malformed PLAIN response"));
            }
            Ok((String::from_utf8_lossy(parts[1]).into_owned(), parts[2].to_vec()))
        }
        "AMQPLAIN" => {
            let mut dec = Decoder::new(response.to_vec());
            let table = dec.decode_field_table()?;
            let login = field_table_get(&table, "LOGIN")
                .and_then(|v| v.as_str())
                .ok_or_else(|| AmqpError::handshake("AMQPLAIN response missing LOGIN"))?
                .to_string();
            let password = field_table_get(&table, "PASSWORD")
                .and_then(|v| v.as_str())
                .ok_or_else(|| AmqpError::handshake("AMQPLAIN response missing PASSWORD"))?
                .as_bytes()
                .to_vec();
            Ok((login, password))
        }
        other => Err(AmqpError::handshake(format!("unsupported SASL mechanism {other}"))),
    }
}

impl Connection {
    fn send(&self, frame: Vec<u8>) {
        let _ = self.outbound.send(frame);
    }

    async fn run(mut self) -> AmqpResult<()> {
        if !self.read_protocol_header().await? {
            return Ok(());
        }
        loop {
            loop {
                match read_frame(&self.buffer)? {
                    FrameRead::Parsed(frame, used) => {
                        self.buffer.drain(..used);
                        if !self.dispatch(frame).await? {
                            return Ok(());
                        }
                    }
                    FrameRead::NeedMore => break,
                }
            }
            let mut chunk = [0u8; 8192];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                log::debug!("peer {:?} closed the connection", self.peer);
                return Ok(());
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    async fn read_protocol_header(&mut self) -> AmqpResult<bool> {
        while self.buffer.len() < PROTOCOL_HEADER.len() {
            let mut chunk = [0u8; 256];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(false);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
        let header: Vec<u8> = self.buffer.drain(..PROTOCOL_HEADER.len()).collect();
        if header != PROTOCOL_HEADER {
            log::warn!("peer {:?} sent an unrecognized protocol header", self.peer);
            return Ok(false);
        }
        self.send(encode_connection_start(0));
        self.state = ConnectionState::WaitingStartOk;
        Ok(true)
    }

    /// Dispatches one parsed frame. Returns `Ok(true)` to keep reading,
    /// `Ok(false)` to close the connection cleanly, and propagates a codec
    /// or decode error (also a close, just an abnormal one).
    async fn dispatch(&mut self, frame: Frame) -> AmqpResult<bool> {
        if frame.channel == 0 {
            self.dispatch_connection(frame)
        } else {
            self.dispatch_channel(frame.channel, frame)
        }
    }

    fn dispatch_connection(&mut self, frame: Frame) -> AmqpResult<bool> {
        if matches!(frame.frame_type, FrameType::Heartbeat) {
            self.send(encode_heartbeat());
            return Ok(true);
        }
        if !matches!(frame.frame_type, FrameType::Method) {
            return Ok(false);
        }
        let (method, rest) = extract_method(&frame.payload)?;
        match self.state {
            ConnectionState::WaitingStartOk => {
                if method != incoming::CONNECTION_START_OK {
                    return Ok(false);
                }
                let args = decode_start_ok(rest)?;
                let (username, password) = parse_credentials(&args.mechanism, &args.response)?;
                if !self.broker.check_credentials(&username, &password) {
                    log::info!("rejecting credentials for user {username:?}");
                    return Ok(false);
                }
                self.send(encode_connection_tune(0));
                self.state = ConnectionState::WaitingTuneOk;
            }
            ConnectionState::WaitingTuneOk => {
                if method != incoming::CONNECTION_TUNE_OK {
                    return Ok(false);
                }
                self.state = ConnectionState::WaitingOpen;
            }
            ConnectionState::WaitingOpen => {
                if method != incoming::CONNECTION_OPEN {
                    return Ok(false);
                }
                self.send(encode_connection_open_ok(0));
                self.state = ConnectionState::Opened;
            }
            ConnectionState::Opened => {
                if method != incoming::CONNECTION_CLOSE {
                    return Ok(false);
                }
                self.send(encode_connection_close_ok(0));
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn dispatch_channel(&mut self, channel_num: u16, frame: Frame) -> AmqpResult<bool> {
        match frame.frame_type {
            FrameType::Method => self.dispatch_channel_method(channel_num, &frame.payload),
            FrameType::Header => self.dispatch_channel_header(channel_num, &frame.payload),
            FrameType::Body => self.dispatch_channel_body(channel_num, &frame.payload),
            FrameType::Heartbeat => {
                self.send(encode_heartbeat());
                Ok(true)
            }
        }
    }

    fn dispatch_channel_method(&mut self, channel_num: u16, payload: &[u8]) -> AmqpResult<bool> {
        let (method, rest) = extract_method(payload)?;

        // channel.close is accepted regardless of the channel's own state
        // and, matching source behaviour verbatim, takes the whole TCP
        // connection down rather than just the one channel.
        if method == incoming::CHANNEL_CLOSE {
            self.channels.remove(&channel_num);
            self.send(encode_channel_close_ok(channel_num));
            return Ok(false);
        }

        let state = self
            .channels
            .entry(channel_num)
            .or_insert_with(Channel::new)
            .state;

        match state {
            ChannelState::WaitingOpen => {
                if method != incoming::CHANNEL_OPEN {
                    return Ok(false);
                }
                self.channels.get_mut(&channel_num).unwrap().state = ChannelState::Opened;
                self.send(encode_channel_open_ok(channel_num));
                Ok(true)
            }
            ChannelState::Opened => self.dispatch_opened_method(channel_num, method, rest),
            ChannelState::WaitingHeader | ChannelState::WaitingBody => Ok(false),
        }
    }

    fn dispatch_opened_method(&mut self, channel_num: u16, method: u32, rest: &[u8]) -> AmqpResult<bool> {
        match method {
            incoming::EXCHANGE_DECLARE => {
                let args = decode_exchange_declare(rest)?;
                // On conflict, close and do not reply.
                if !self.broker.declare_exchange(&args.exchange, &args.exchange_type) {
                    return Ok(false);
                }
                self.send(encode_exchange_declare_ok(channel_num));
            }
            incoming::QUEUE_DECLARE => {
                let args = decode_queue_declare(rest)?;
                self.broker.declare_queue(&args.queue);
                // message_count/consumer_count always report zero.
                self.send(encode_queue_declare_ok(channel_num, &args.queue, 0, 0));
            }
            incoming::QUEUE_BIND => {
                let args = decode_queue_bind(rest)?;
                if !self.broker.bind_queue(&args.queue, &args.exchange) {
                    return Ok(false);
                }
                self.send(encode_queue_bind_ok(channel_num));
            }
            incoming::BASIC_QOS => {
                self.send(encode_basic_qos_ok(channel_num));
            }
            incoming::BASIC_PUBLISH => {
                let args = decode_basic_publish(rest)?;
                if !self.broker.exchange_exists(&args.exchange) {
                    return Ok(false);
                }
                let channel = self.channels.get_mut(&channel_num).unwrap();
                channel.current_publish = Some(CurrentPublish {
                    exchange: args.exchange,
                    routing_key: args.routing_key,
                    pending_message: None,
                });
                channel.state = ChannelState::WaitingHeader;
            }
            incoming::BASIC_CONSUME => {
                let args = decode_basic_consume(rest)?;
                if !self
                    .broker
                    .register_consumer(self.sink.clone(), &args.consumer_tag, &args.queue, channel_num)
                {
                    return Ok(false);
                }
                self.send(encode_basic_consume_ok(channel_num, &args.consumer_tag));
            }
            incoming::BASIC_ACK => {
                let args = decode_basic_ack(rest)?;
                self.broker.message_ack(args.delivery_tag as u32);
            }
            incoming::BASIC_NACK => {
                let args = decode_basic_nack(rest)?;
                self.broker.message_nack(args.delivery_tag as u32, args.requeue);
            }
            incoming::BASIC_CANCEL => {
                let mut dec = Decoder::new(rest.to_vec());
                let consumer_tag = dec.decode_shortstr()?;
                self.send(encode_basic_cancel_ok(channel_num, &consumer_tag));
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn dispatch_channel_header(&mut self, channel_num: u16, payload: &[u8]) -> AmqpResult<bool> {
        let Some(channel) = self.channels.get_mut(&channel_num) else {
            return Ok(false);
        };
        if channel.state != ChannelState::WaitingHeader {
            return Ok(false);
        }
        let (_class, body_size, properties) = decode_content_header(payload)?;
        if body_size == 0 {
            let publish = channel.current_publish.take().unwrap();
            channel.state = ChannelState::Opened;
            self.broker.store_message(&publish.exchange, properties, Vec::new());
        } else {
            let publish = channel.current_publish.as_mut().unwrap();
            publish.pending_message = Some(PendingMessage {
                properties,
                body_size,
                body_accum: Vec::new(),
            });
            channel.state = ChannelState::WaitingBody;
        }
        Ok(true)
    }

    fn dispatch_channel_body(&mut self, channel_num: u16, payload: &[u8]) -> AmqpResult<bool> {
        let Some(channel) = self.channels.get_mut(&channel_num) else {
            return Ok(false);
        };
        if channel.state != ChannelState::WaitingBody {
            return Ok(false);
        }
        {
            let pending = channel
                .current_publish
                .as_mut()
                .unwrap()
                .pending_message
                .as_mut()
                .unwrap();
            pending.body_accum.extend_from_slice(payload);
        }
        let complete = {
            let pending = &channel.current_publish.as_ref().unwrap().pending_message.as_ref().unwrap();
            pending.body_accum.len() as u64 == pending.body_size
        };
        if complete {
            let publish = channel.current_publish.take().unwrap();
            let pending = publish.pending_message.unwrap();
            channel.state = ChannelState::Opened;
            self.broker
                .store_message(&publish.exchange, pending.properties, pending.body_accum);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_credentials_splits_plain_response() {
        let response = b"\0guest\0guest";
        let (user, pass) = parse_credentials("PLAIN", response).unwrap();
        assert_eq!(user, "guest");
        assert_eq!(pass, b"guest");
    }

    #[test]
    fn parse_credentials_plain_rejects_malformed_response() {
        assert!(parse_credentials("PLAIN", b"nonul").is_err());
    }

    #[test]
    fn parse_credentials_amqplain_decodes_field_table() {
        use crate::codec::Encoder;
        use crate::types::FieldValue;

        let mut enc = Encoder::new();
        enc.encode_field_table(&vec![
            ("LOGIN".to_string(), FieldValue::LongString("guest".to_string())),
            ("PASSWORD".to_string(), FieldValue::LongString("secret".to_string())),
        ]);
        let response = enc.finish();
        let (user, pass) = parse_credentials("AMQPLAIN", &response).unwrap();
        assert_eq!(user, "guest");
        assert_eq!(pass, b"secret");
    }

    #[test]
    fn parse_credentials_rejects_unknown_mechanism() {
        assert!(parse_credentials("GSSAPI", b"").is_err());
    }

    #[test]
    fn extract_method_reads_class_and_method_id() {
        let payload = [0x00, 0x0A, 0x00, 0x0B, 0xFF];
        let (method, rest) = extract_method(&payload).unwrap();
        assert_eq!(method, incoming::CONNECTION_START_OK);
        assert_eq!(rest, &[0xFF]);
    }

    #[test]
    fn extract_method_rejects_short_payload() {
        assert!(extract_method(&[0x00, 0x0A]).is_err());
    }
}
