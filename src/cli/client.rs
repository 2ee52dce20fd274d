use std::io::{BufReader, BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::protocol::{
    ContentResult, HistoryResult, InvalidateResult, Request, Response, RpcError, RpcRequest,
    StatusResult, VersionResult, read_reply, socket_path, write_message,
};
use crate::sync::SyncResult;
use crate::types::Locale;

/// Client for communicating with the daemon
pub struct Client {
    reader: BufReader<UnixStream>,
    writer: BufWriter<UnixStream>,
    next_id: u64,
}

#[derive(Debug)]
pub enum ClientError {
    /// Could not connect to daemon
    NotRunning,
    /// IO error
    Io(std::io::Error),
    /// RPC error from daemon
    Rpc(RpcError),
    /// Invalid response
    InvalidResponse(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::NotRunning => write!(f, "daemon is not running"),
            ClientError::Io(e) => write!(f, "IO error: {}", e),
            ClientError::Rpc(e) => write!(f, "RPC error: {} (code {})", e.message, e.code),
            ClientError::InvalidResponse(s) => write!(f, "invalid response: {}", s),
        }
    }
}

impl std::error::Error for ClientError {}

fn is_not_running_io_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::NotFound
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    ) || matches!(
        err.raw_os_error(),
        Some(libc::ECONNREFUSED)
            | Some(libc::ENOENT)
            | Some(libc::ECONNABORTED)
            | Some(libc::ECONNRESET)
            | Some(libc::EPIPE)
            | Some(libc::ENOTCONN)
    )
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        if is_not_running_io_error(&e) {
            ClientError::NotRunning
        } else {
            ClientError::Io(e)
        }
    }
}

fn unexpected(response: Response) -> ClientError {
    ClientError::InvalidResponse(format!("{:?}", response))
}

impl Client {
    /// Connect to the daemon
    pub fn connect() -> Result<Self, ClientError> {
        Self::connect_to(&socket_path())
    }

    pub fn connect_to(path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path)?;

        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);

        Ok(Self {
            reader,
            writer,
            next_id: 1,
        })
    }

    /// Send a request and wait for response
    pub fn call(&mut self, request: Request) -> Result<Response, ClientError> {
        let id = self.next_id;
        self.next_id += 1;

        let rpc_request = RpcRequest::new(request, id);
        write_message(&mut self.writer, &rpc_request)?;
        self.writer.flush()?;

        let reply = read_reply(&mut self.reader)?;
        if reply.id != id {
            return Err(ClientError::InvalidResponse(format!(
                "reply id {} does not match request id {}",
                reply.id, id
            )));
        }
        reply.into_result().map_err(ClientError::Rpc)
    }

    pub fn status(&mut self) -> Result<StatusResult, ClientError> {
        match self.call(Request::Status)? {
            Response::Status(s) => Ok(*s),
            other => Err(unexpected(other)),
        }
    }

    /// Force a sync. Returns once the sync has finished, or immediately
    /// with `already_in_progress` if one is running.
    pub fn sync(&mut self) -> Result<SyncResult, ClientError> {
        match self.call(Request::Sync)? {
            Response::Sync(s) => Ok(s),
            other => Err(unexpected(other)),
        }
    }

    pub fn invalidate(&mut self, locale: Option<Locale>) -> Result<InvalidateResult, ClientError> {
        match self.call(Request::Invalidate { locale })? {
            Response::Invalidate(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    pub fn content(&mut self, locale: Option<Locale>) -> Result<ContentResult, ClientError> {
        match self.call(Request::Content { locale })? {
            Response::Content(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    pub fn history(&mut self, limit: usize) -> Result<HistoryResult, ClientError> {
        match self.call(Request::History { limit })? {
            Response::History(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    pub fn version(&mut self) -> Result<VersionResult, ClientError> {
        match self.call(Request::Version)? {
            Response::Version(v) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    /// Convenience: stop daemon
    pub fn stop(&mut self) -> Result<(), ClientError> {
        match self.call(Request::Stop)? {
            Response::Ok(()) => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Client, ClientError};

    #[test]
    fn maps_broken_pipe_to_not_running() {
        let err = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert!(matches!(ClientError::from(err), ClientError::NotRunning));
    }

    #[test]
    fn keeps_unrelated_io_errors_as_io() {
        let err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(ClientError::from(err), ClientError::Io(_)));
    }

    #[test]
    fn missing_socket_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let result = Client::connect_to(&dir.path().join("absent.sock"));
        assert!(matches!(result, Err(ClientError::NotRunning)));
    }

    #[test]
    fn rpc_errors_display_code() {
        let err = ClientError::Rpc(crate::protocol::RpcError::not_found("history is disabled"));
        assert_eq!(err.to_string(), "RPC error: history is disabled (code -1)");
    }
}
