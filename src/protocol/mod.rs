//! JSON-RPC 2.0 protocol spoken over the daemon's Unix socket, one JSON
//! object per line.

mod messages;
mod rpc;

use std::path::PathBuf;

pub use messages::{
    ContentResult, HistoryResult, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    InvalidateResult, METHOD_NOT_FOUND, NOT_FOUND, PARSE_ERROR, Request, Response, RpcError,
    StatusResult, VersionResult,
};
pub use rpc::{
    JSONRPC_VERSION, RejectedRequest, RpcReply, RpcRequest, read_reply, read_request,
    write_message,
};

/// Get the socket path for the daemon.
///
/// Uses `$XDG_RUNTIME_DIR/contentsync.sock` on Linux.
/// Falls back to `/tmp/contentsync-$UID.sock`.
pub fn socket_path() -> PathBuf {
    if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("contentsync.sock");
    }

    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/contentsync-{}.sock", uid))
}
