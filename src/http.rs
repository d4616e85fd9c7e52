//! HTTP/1.1 control/introspection plane.
//!
//! One request per connection, `Connection: close` on every response. There
//! is no `hyper`/`axum`/`tiny_http` anywhere in the example pack this crate
//! was grounded on, so the parser here is hand-rolled: read until the
//! blank-line header terminator, pull `Content-Length` bytes of body, match
//! the request line against the fixed route table, write a response with
//! the fixed header set. The non-standard `MOCK_FLUSH` verb is matched the
//! same way any other method would be, nothing about this parser is
//! verb-aware beyond string comparison.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::broker::BrokerState;
use crate::error::{AmqpError, AmqpResult};
use crate::types::{BasicProperties, FieldTable, FieldValue};

struct Request {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

struct Response {
    status: u16,
    content_type: Option<&'static str>,
    body: Vec<u8>,
}

impl Response {
    fn status(code: u16) -> Self {
        Response {
            status: code,
            content_type: None,
            body: Vec::new(),
        }
    }

    fn json(code: u16, value: Value) -> Self {
        Response {
            status: code,
            content_type: Some("application/json"),
            body: serde_json::to_vec(&value).unwrap_or_default(),
        }
    }
}

/// Reads one request, dispatches it, and writes one response. Any error
/// anywhere in that path is swallowed into a 500; the HTTP plane never
/// propagates a parse failure back up to the accept loop.
pub async fn serve(mut stream: TcpStream, broker: BrokerState) -> AmqpResult<()> {
    let response = match read_request(&mut stream).await {
        Ok(request) => match handle_request(&broker, &request).await {
            Ok(response) => response,
            Err(err) => {
                log::warn!("http handler error: {err}");
                internal_server_error()
            }
        },
        Err(err) => {
            log::warn!("failed to read http request: {err}");
            internal_server_error()
        }
    };
    write_response(&mut stream, response).await
}

fn internal_server_error() -> Response {
    Response {
        status: 500,
        content_type: None,
        body: b"internal server error\n".to_vec(),
    }
}

async fn read_request(stream: &mut TcpStream) -> AmqpResult<Request> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(AmqpError::http("connection closed before headers completed"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > 64 * 1024 {
            return Err(AmqpError::http("request headers too large"));
        }
    };

    let header_text = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| AmqpError::http("missing request line"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| AmqpError::http("missing HTTP method"))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| AmqpError::http("missing request path"))?
        .to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Request {
        method,
        path,
        headers,
        body,
    })
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn segments(path: &str) -> Vec<&str> {
    let path = path.split('?').next().unwrap_or(path);
    path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect()
}

async fn handle_request(broker: &BrokerState, req: &Request) -> AmqpResult<Response> {
    // Non-standard reset verb, matched before route dispatch since it
    // applies regardless of path.
    if req.method == "MOCK_FLUSH" {
        broker.reset();
        return Ok(Response::status(204));
    }

    let segs = segments(&req.path);
    let segs: Vec<&str> = segs;

    match (req.method.as_str(), segs.as_slice()) {
        ("GET", []) => Ok(Response::json(200, broker.to_json())),

        ("GET", ["authentification-done-with-success-on", user]) => {
            match broker.wait_authentication_performed_on(user).await {
                Ok(true) => Ok(Response::status(204)),
                Ok(false) => Ok(Response::status(403)),
                Err(_) => Ok(Response::status(504)),
            }
        }

        ("GET", ["messages-acknowledged", tag]) => {
            let tag = parse_tag(tag)?;
            Ok(wait_response(broker.wait_message_acknowledged(tag).await))
        }
        ("GET", ["messages-not-acknowledged", tag]) => {
            let tag = parse_tag(tag)?;
            Ok(wait_response(broker.wait_message_not_acknowledged(tag).await))
        }
        ("GET", ["messages-requeued", tag]) => {
            let tag = parse_tag(tag)?;
            Ok(wait_response(broker.wait_message_requeued(tag).await))
        }

        ("GET", ["messages-in-queue", name]) => match broker.get_messages_of_queue(name) {
            Some(messages) => Ok(Response::json(200, json!(messages))),
            None => Ok(Response::status(404)),
        },
        ("GET", ["messages-in-exchange", name]) => match broker.get_messages_of_exchange(name) {
            Some(messages) => Ok(Response::json(200, json!(messages))),
            None => Ok(Response::status(404)),
        },

        ("GET", ["queue-bound-to-exchange", queue, exchange]) => {
            Ok(wait_response(broker.wait_queue_bound(queue, exchange).await))
        }

        ("POST", ["add-message-on", exchange]) => {
            let (properties, body) = parse_publish_body(req)?;
            match broker.publish_message(exchange, properties, body) {
                Some(tag) => Ok(Response::json(200, json!({ "delivery_tag": tag }))),
                None => Ok(Response::status(404)),
            }
        }
        ("POST", ["add-message-in-queue", queue]) => {
            let (properties, body) = parse_publish_body(req)?;
            match broker.publish_message_in_queue(queue, properties, body) {
                Some(tag) => Ok(Response::json(200, json!({ "delivery_tag": tag }))),
                None => Ok(Response::status(404)),
            }
        }

        ("POST", ["create-exchange", name, exchange_type]) => {
            broker.declare_exchange(name, exchange_type);
            Ok(Response::status(200))
        }
        ("POST", ["create-queue", name]) => {
            broker.declare_queue(name);
            Ok(Response::status(200))
        }

        ("DELETE", ["messages-in-queue", name]) => {
            if broker.delete_messages_of_queue(name) {
                Ok(Response::status(204))
            } else {
                Ok(Response::status(404))
            }
        }
        ("DELETE", ["messages-in-exchange", name]) => {
            if broker.delete_messages_of_exchange(name) {
                Ok(Response::status(204))
            } else {
                Ok(Response::status(404))
            }
        }

        _ => Ok(Response::status(404)),
    }
}

fn parse_tag(raw: &str) -> AmqpResult<u32> {
    raw.parse::<u32>()
        .map_err(|_| AmqpError::http(format!("invalid delivery tag {raw:?}")))
}

fn wait_response(result: AmqpResult<()>) -> Response {
    match result {
        Ok(()) => Response::status(204),
        Err(_) => Response::status(504),
    }
}

/// Builds the `BasicProperties` + raw body a POST publish route hands to
/// the broker, per the two content-type shapes this route accepts.
fn parse_publish_body(req: &Request) -> AmqpResult<(BasicProperties, Vec<u8>)> {
    let is_binary = req
        .headers
        .get("content-type")
        .map(|v| v.eq_ignore_ascii_case("application/octet-stream"))
        .unwrap_or(false);

    if is_binary {
        let mut table: FieldTable = Vec::new();
        for (key, value) in &req.headers {
            if let Some(name) = key.strip_prefix("amqp_header_") {
                table.push((name.to_string(), FieldValue::LongString(value.clone())));
            }
        }
        let mut properties = BasicProperties::default();
        if !table.is_empty() {
            properties.application_headers = Some(table);
        }
        Ok((properties, req.body.clone()))
    } else {
        let parsed: Value = serde_json::from_slice(&req.body)?;
        let obj = parsed
            .as_object()
            .ok_or_else(|| AmqpError::http("expected a JSON object body"))?;
        let properties = match obj.get("headers").and_then(|h| h.as_object()) {
            Some(headers) => properties_from_json(headers),
            None => BasicProperties::default(),
        };
        let body = match obj.get("body") {
            Some(Value::String(s)) => s.clone().into_bytes(),
            Some(other) => other.to_string().into_bytes(),
            None => Vec::new(),
        };
        Ok((properties, body))
    }
}

/// Interprets a JSON `headers` object as the basic-properties map: known
/// property names are lifted into their typed field, everything else ends
/// up in `application_headers`.
fn properties_from_json(headers: &serde_json::Map<String, Value>) -> BasicProperties {
    let mut properties = BasicProperties::default();
    let mut extra: FieldTable = Vec::new();
    for (key, value) in headers {
        match key.as_str() {
            "content_type" => properties.content_type = value.as_str().map(str::to_string),
            "content_encoding" => properties.content_encoding = value.as_str().map(str::to_string),
            "delivery_mode" => properties.delivery_mode = value.as_u64().map(|n| n as u8),
            "priority" => properties.priority = value.as_u64().map(|n| n as u8),
            "correlation_id" => properties.correlation_id = value.as_str().map(str::to_string),
            "reply_to" => properties.reply_to = value.as_str().map(str::to_string),
            "expiration" => properties.expiration = value.as_str().map(str::to_string),
            "message_id" => properties.message_id = value.as_str().map(str::to_string),
            "timestamp" => properties.timestamp = value.as_u64(),
            "type" => properties.kind = value.as_str().map(str::to_string),
            "user_id" => properties.user_id = value.as_str().map(str::to_string),
            "app_id" => properties.app_id = value.as_str().map(str::to_string),
            "cluster_id" => properties.cluster_id = value.as_str().map(str::to_string),
            "application_headers" => {
                if let Value::Object(nested) = value {
                    extra.extend(nested.iter().map(|(k, v)| (k.clone(), json_to_field_value(v))));
                }
            }
            other => extra.push((other.to_string(), json_to_field_value(value))),
        }
    }
    if !extra.is_empty() {
        properties.application_headers = Some(extra);
    }
    properties
}

fn json_to_field_value(value: &Value) -> FieldValue {
    match value {
        Value::String(s) => FieldValue::LongString(s.clone()),
        Value::Bool(b) => FieldValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                FieldValue::LongLongInt(i)
            } else if let Some(f) = n.as_f64() {
                FieldValue::Double(f)
            } else {
                FieldValue::Void
            }
        }
        _ => FieldValue::Void,
    }
}

async fn write_response(stream: &mut TcpStream, response: Response) -> AmqpResult<()> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nDate: {}\r\nServer: whatever\r\nConnection: close\r\n",
        response.status,
        status_reason(response.status),
        http_date_now(),
    );
    if let Some(content_type) = response.content_type {
        head.push_str(&format!("Content-Type: {content_type}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", response.body.len()));

    stream.write_all(head.as_bytes()).await?;
    if !response.body.is_empty() {
        stream.write_all(&response.body).await?;
    }
    let _ = stream.shutdown().await;
    Ok(())
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// RFC 7231 `Date` header value for the current instant. No crate in the
/// example pack offers an HTTP date formatter (the same gap that rules out
/// `hyper`/`httpdate`), so this hand-rolls civil-calendar conversion with
/// Howard Hinnant's `civil_from_days` algorithm rather than pulling in a
/// dependency with no analogue anywhere in the pack.
fn http_date_now() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_http_date(secs)
}

fn format_http_date(secs: u64) -> String {
    const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    let days = (secs / 86_400) as i64;
    let time_of_day = secs % 86_400;
    let (hour, minute, second) = (time_of_day / 3600, (time_of_day / 60) % 60, time_of_day % 60);
    let weekday = WEEKDAYS[((days + 4).rem_euclid(7)) as usize]; // 1970-01-01 was a Thursday

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { y + 1 } else { y };

    format!(
        "{weekday}, {day:02} {} {year} {hour:02}:{minute:02}:{second:02} GMT",
        MONTHS[(month - 1) as usize]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_splits_and_drops_empties() {
        assert_eq!(segments("/messages-in-queue/q1"), vec!["messages-in-queue", "q1"]);
        assert_eq!(segments("/"), Vec::<&str>::new());
        assert_eq!(
            segments("/queue-bound-to-exchange/q/ex"),
            vec!["queue-bound-to-exchange", "q", "ex"]
        );
    }

    #[test]
    fn json_to_field_value_maps_primitive_kinds() {
        assert_eq!(json_to_field_value(&json!("hi")), FieldValue::LongString("hi".into()));
        assert_eq!(json_to_field_value(&json!(true)), FieldValue::Boolean(true));
        assert_eq!(json_to_field_value(&json!(42)), FieldValue::LongLongInt(42));
    }

    #[test]
    fn properties_from_json_splits_known_and_unknown_keys() {
        let headers = json!({
            "content_type": "text/plain",
            "x-custom": "abc",
        });
        let props = properties_from_json(headers.as_object().unwrap());
        assert_eq!(props.content_type.as_deref(), Some("text/plain"));
        let extra = props.application_headers.unwrap();
        assert_eq!(extra[0].0, "x-custom");
    }

    #[test]
    fn format_http_date_matches_a_known_instant() {
        // 2021-01-01T00:00:00Z
        assert_eq!(format_http_date(1_609_459_200), "Fri, 01 Jan 2021 00:00:00 GMT");
    }

    #[test]
    fn parse_tag_rejects_non_numeric_input() {
        assert!(parse_tag("not-a-number").is_err());
        assert_eq!(parse_tag("42").unwrap(), 42);
    }
}
