//! Wire protocol for bux host↔guest communication.
//!
//! Messages are serialized with [`postcard`] and framed with a 4-byte
//! big-endian length prefix, suitable for any reliable byte stream
//! (vsock, Unix socket, TCP).

mod codec;
mod message;

pub use codec::{
    recv, recv_download, recv_upload, recv_upload_to_writer, send, send_download,
    send_download_from_reader, send_upload,
};
pub use message::{
    AGENT_PORT, ControlReq, ControlResp, Download, ErrorCode, ErrorInfo, ExecIn, ExecOut,
    ExecStart, Hello, HelloAck, MAX_UPLOAD_BYTES, PROTOCOL_VERSION, ProcessSpec, STREAM_CHUNK_SIZE,
    SetupOp, SetupResp, TtyConfig, Upload, UploadResult,
};
