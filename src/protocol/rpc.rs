//! Line framing for the control socket.
//!
//! Requests and replies are JSON-RPC 2.0 objects, one per line. A line the
//! daemon cannot turn into a [`Request`] is answered with an error reply
//! rather than dropping the connection, so a client can keep using it.

use std::io::{self, BufRead, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::messages::{Request, Response, RpcError};

pub const JSONRPC_VERSION: &str = "2.0";

/// A request as sent by the CLI.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(flatten)]
    pub request: Request,
    pub id: Value,
}

impl RpcRequest {
    pub fn new(request: Request, id: impl Into<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            request,
            id: id.into(),
        }
    }
}

/// A reply carrying either `result` or `error`.
///
/// `stop` answers with `"result": null`, which deserializes as no result
/// and no error and is read back as [`Response::Ok`].
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcReply {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Response>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcReply {
    pub fn success(result: Response, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(error: RpcError, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn into_result(self) -> Result<Response, RpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Response::Ok(())),
        }
    }
}

/// A line that was read but is not a usable request. `id` is echoed back
/// when it could be recovered, `null` otherwise.
#[derive(Debug)]
pub struct RejectedRequest {
    pub id: Value,
    pub error: RpcError,
}

impl RejectedRequest {
    pub fn into_reply(self) -> RpcReply {
        RpcReply::failure(self.error, self.id)
    }
}

/// Serialize `msg` and write it as one line.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> io::Result<()> {
    let mut line = serde_json::to_vec(msg).map_err(io::Error::from)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()
}

/// Next line, or `None` at end of stream.
fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

/// Read the next request.
///
/// `Ok(None)` at end of stream. A malformed request is returned as
/// `Ok(Some(Err(_)))` with the JSON-RPC error to answer it with; only
/// transport failures are `Err`.
pub fn read_request<R: BufRead>(
    reader: &mut R,
) -> io::Result<Option<Result<RpcRequest, RejectedRequest>>> {
    let Some(line) = read_line(reader)? else {
        return Ok(None);
    };
    Ok(Some(parse_request(&line)))
}

fn parse_request(line: &str) -> Result<RpcRequest, RejectedRequest> {
    let value: Value = serde_json::from_str(line).map_err(|e| RejectedRequest {
        id: Value::Null,
        error: RpcError::parse_error(e.to_string()),
    })?;

    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let reject = |error| RejectedRequest {
        id: id.clone(),
        error,
    };

    if value.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(reject(RpcError::invalid_request("expected \"jsonrpc\": \"2.0\"")));
    }
    let method = match value.get("method").and_then(Value::as_str) {
        Some(method) => method.to_string(),
        None => return Err(reject(RpcError::invalid_request("missing method"))),
    };
    if !Request::METHODS.contains(&method.as_str()) {
        return Err(reject(RpcError::method_not_found(&method)));
    }

    serde_json::from_value(value)
        .map_err(|e| reject(RpcError::invalid_params(format!("{}: {}", method, e))))
}

/// Read the reply to a request. End of stream is `UnexpectedEof`.
pub fn read_reply<R: BufRead>(reader: &mut R) -> io::Result<RpcReply> {
    let line = read_line(reader)?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::UnexpectedEof, "daemon closed the connection")
    })?;
    parse_line(&line)
}

fn parse_line<T: DeserializeOwned>(line: &str) -> io::Result<T> {
    serde_json::from_str(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use super::super::messages::{INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR};
    use super::super::messages::VersionResult;

    fn lines(input: &str) -> Cursor<Vec<u8>> {
        Cursor::new(input.as_bytes().to_vec())
    }

    fn rejected(input: &str) -> RejectedRequest {
        match read_request(&mut lines(input)).unwrap() {
            Some(Err(rejected)) => rejected,
            Some(Ok(req)) => panic!("expected rejection, parsed {:?}", req.request),
            None => panic!("expected rejection, got end of stream"),
        }
    }

    #[test]
    fn request_serializes_flat() {
        let req = RpcRequest::new(Request::History { limit: 20 }, 1);
        let json = serde_json::to_string(&req).unwrap();

        assert!(json.contains(r#""jsonrpc":"2.0""#));
        assert!(json.contains(r#""method":"history""#));
        assert!(json.contains(r#""params":{"limit":20}"#));
        assert!(json.contains(r#""id":1"#));
    }

    #[test]
    fn written_request_reads_back() {
        let original = RpcRequest::new(
            Request::Content {
                locale: Some("pt-BR".parse().unwrap()),
            },
            "req-42",
        );

        let mut buffer = Vec::new();
        write_message(&mut buffer, &original).unwrap();
        assert_eq!(buffer.last(), Some(&b'\n'));

        let parsed = read_request(&mut Cursor::new(buffer)).unwrap().unwrap().unwrap();
        assert_eq!(parsed.id, "req-42");
        match parsed.request {
            Request::Content { locale } => assert_eq!(locale.unwrap().as_str(), "pt-BR"),
            other => panic!("Expected Content request, got {:?}", other),
        }
    }

    #[test]
    fn several_requests_share_a_stream() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &RpcRequest::new(Request::Status, 1)).unwrap();
        buffer.extend_from_slice(b"not json\n");
        write_message(&mut buffer, &RpcRequest::new(Request::Sync, 3)).unwrap();

        let mut cursor = Cursor::new(buffer);
        let first = read_request(&mut cursor).unwrap().unwrap().unwrap();
        assert!(matches!(first.request, Request::Status));

        let garbage = read_request(&mut cursor).unwrap().unwrap().unwrap_err();
        assert_eq!(garbage.error.code, PARSE_ERROR);

        let third = read_request(&mut cursor).unwrap().unwrap().unwrap();
        assert_eq!(third.id, 3);
        assert!(matches!(third.request, Request::Sync));

        assert!(read_request(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn malformed_json_is_a_parse_error_without_id() {
        let rejected = rejected("{\"jsonrpc\":\"2.0\",\n");
        assert_eq!(rejected.error.code, PARSE_ERROR);
        assert_eq!(rejected.id, Value::Null);
    }

    #[test]
    fn unknown_method_keeps_the_id() {
        let rejected = rejected(r#"{"jsonrpc":"2.0","method":"reboot","id":7}"#);
        assert_eq!(rejected.error.code, METHOD_NOT_FOUND);
        assert_eq!(rejected.id, 7);
    }

    #[test]
    fn wrong_version_and_missing_method_are_invalid_requests() {
        let rejected_version = rejected(r#"{"jsonrpc":"1.0","method":"status","id":1}"#);
        assert_eq!(rejected_version.error.code, INVALID_REQUEST);

        let rejected_method = rejected(r#"{"jsonrpc":"2.0","id":2}"#);
        assert_eq!(rejected_method.error.code, INVALID_REQUEST);
        assert_eq!(rejected_method.id, 2);
    }

    #[test]
    fn bad_params_are_invalid_params() {
        let bad_locale = rejected(
            r#"{"jsonrpc":"2.0","method":"content","params":{"locale":"../etc"},"id":4}"#,
        );
        assert_eq!(bad_locale.error.code, INVALID_PARAMS);
        assert!(bad_locale.error.message.starts_with("content:"));

        let missing_limit = rejected(r#"{"jsonrpc":"2.0","method":"history","params":{},"id":5}"#);
        assert_eq!(missing_limit.error.code, INVALID_PARAMS);
    }

    #[test]
    fn success_reply_reads_back() {
        let reply = RpcReply::success(
            Response::Version(VersionResult {
                version: "0.1.0".to_string(),
                pid: 4321,
            }),
            Value::from(5),
        );

        let mut buffer = Vec::new();
        write_message(&mut buffer, &reply).unwrap();
        let json = String::from_utf8(buffer.clone()).unwrap();
        assert!(!json.contains(r#""error""#));

        let parsed = read_reply(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(parsed.id, 5);
        match parsed.into_result() {
            Ok(Response::Version(version)) => assert_eq!(version.pid, 4321),
            other => panic!("Expected Version response, got {:?}", other),
        }
    }

    #[test]
    fn error_reply_reads_back() {
        let reply = RpcReply::failure(RpcError::not_found("sync history is disabled"), 9.into());

        let mut buffer = Vec::new();
        write_message(&mut buffer, &reply).unwrap();
        let json = String::from_utf8(buffer.clone()).unwrap();
        assert!(json.contains(r#""code":-1"#));
        assert!(!json.contains(r#""result""#));

        let error = read_reply(&mut Cursor::new(buffer)).unwrap().into_result().unwrap_err();
        assert_eq!(error, RpcError::not_found("sync history is disabled"));
    }

    #[test]
    fn null_result_is_ok() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &RpcReply::success(Response::Ok(()), 1.into())).unwrap();
        assert!(String::from_utf8_lossy(&buffer).contains(r#""result":null"#));

        let reply = read_reply(&mut Cursor::new(buffer)).unwrap();
        assert!(matches!(reply.into_result(), Ok(Response::Ok(()))));
    }

    #[test]
    fn reply_at_end_of_stream_is_unexpected_eof() {
        let err = read_reply(&mut lines("")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let err = read_reply(&mut lines("[1, 2]\n")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
