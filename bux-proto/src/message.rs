//! Protocol message types for bux host↔guest communication.
//!
//! Each operation uses a **dedicated connection** (per-operation model):
//!
//! 1. Host opens a new vsock/Unix socket connection.
//! 2. Host sends a [`Hello`] identifying the operation type.
//! 3. Guest replies with [`HelloAck`].
//! 4. Both sides exchange operation-specific messages until completion.
//! 5. Connection closes when the operation completes.
//!
//! This eliminates multiplexing and allows concurrent operations without
//! contention.

use serde::{Deserialize, Serialize};

/// Wire protocol version. Bumped on every incompatible change.
pub const PROTOCOL_VERSION: u32 = 5;

/// Default chunk size for streaming transfers (1 MiB).
pub const STREAM_CHUNK_SIZE: usize = 1 << 20;

/// Maximum total upload size accepted by the guest agent (512 MiB).
pub const MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;

/// Default vsock port for the bux guest agent.
pub const AGENT_PORT: u32 = 1024;

/// First message on every new connection — identifies the operation type.
#[derive(Debug, Serialize, Deserialize)]
pub enum Hello {
    /// Open a control channel (ping, shutdown, quiesce, thaw).
    Control {
        /// Protocol version offered by the host.
        version: u32,
    },
    /// Execute a command on this connection.
    Exec(ExecStart),
    /// Read a single file from the guest (guest streams [`Download`] back).
    FileRead {
        /// Absolute path inside the guest.
        path: String,
    },
    /// Write a single file to the guest (host streams [`Upload`] in).
    FileWrite {
        /// Absolute path inside the guest.
        path: String,
        /// Unix permission mode (e.g. `0o644`).
        mode: u32,
    },
    /// Upload a tar archive and extract it at `dest`.
    CopyIn {
        /// Destination directory inside the guest.
        dest: String,
    },
    /// Download a path from the guest as a tar archive.
    CopyOut {
        /// Path inside the guest to archive.
        path: String,
        /// Follow symlinks when archiving (default: `false`).
        follow_symlinks: bool,
    },
    /// Run a single setup/admin operation and report the result.
    Setup(SetupOp),
    /// Registers a persistent process without starting it. Returns a stable
    /// id the caller uses for every later call against the same process,
    /// independent of which connection issues them.
    CreateProcess(ProcessSpec),
    /// Starts a previously created process and returns its pid.
    StartProcess {
        /// Id returned in [`HelloAck::ProcessCreated`].
        id: String,
    },
    /// Attaches to a started process's stdio on its own connection.
    ///
    /// This is the closest equivalent this transport has to a dedicated
    /// stdio port per stream: every [`ExecIn`]/[`ExecOut`] frame exchanged
    /// here behaves exactly as on a [`Hello::Exec`] connection, except the
    /// process itself survives this connection closing, and a later
    /// `WaitProcess` still observes its exit even if nothing ever attaches.
    AttachStdio {
        /// Process id.
        id: String,
    },
    /// Delivers a signal to a started process.
    SignalProcess {
        /// Process id.
        id: String,
        /// Signal number.
        signal: i32,
    },
    /// Resizes a started terminal process's window. Fails `unsupported` if
    /// the process was not created with a PTY.
    ResizeProcess {
        /// Process id.
        id: String,
        /// New terminal dimensions.
        tty: TtyConfig,
    },
    /// Closes a started process's stdin (sends EOF to the child).
    CloseProcessStdin {
        /// Process id.
        id: String,
    },
    /// Blocks until a started process exits, bounded by `timeout_ms`
    /// (`0` = wait indefinitely).
    WaitProcess {
        /// Process id.
        id: String,
        /// Wall-clock timeout in milliseconds (`0` = no timeout).
        timeout_ms: u64,
    },
    /// Releases a process's guest-side resources. A still-running process
    /// is force-killed first.
    DeleteProcess {
        /// Process id.
        id: String,
    },
}

/// Host → guest setup/admin operation, sent inside [`Hello::Setup`].
///
/// Covers the mounts, directories, and network configuration a container
/// needs between `create` and `start` — everything short of running the
/// container's own command. Network operations shell out to `ip(8)` inside
/// the guest rather than speaking netlink directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SetupOp {
    /// Mounts procfs, sysfs, and devpts. Idempotent — a second call is a no-op.
    StandardSetup,
    /// Mounts a filesystem.
    Mount {
        /// Mount source (device path, or a pseudo-fs name like `"proc"`).
        source: String,
        /// Mount point, created if missing.
        target: String,
        /// Filesystem type (e.g. `"ext4"`, `"proc"`, `"devpts"`).
        fstype: String,
        /// Raw `mount(2)` flags bitmask.
        flags: u64,
        /// Filesystem-specific mount data (the `data` argument to `mount(2)`).
        data: Option<String>,
    },
    /// Unmounts a filesystem.
    Umount {
        /// Mount point to unmount.
        path: String,
        /// Raw `umount2(2)` flags (e.g. `MNT_DETACH`).
        flags: i32,
    },
    /// Creates a directory.
    Mkdir {
        /// Directory path.
        path: String,
        /// Create parent directories as needed (like `mkdir -p`).
        all: bool,
        /// Unix permission mode.
        mode: u32,
    },
    /// Brings a network interface up, optionally setting its MTU.
    LinkUp {
        /// Interface name.
        name: String,
        /// MTU in bytes, if overriding the default.
        mtu: Option<u32>,
    },
    /// Brings a network interface down.
    LinkDown {
        /// Interface name.
        name: String,
    },
    /// Adds an address to an interface.
    AddressAdd {
        /// Interface name.
        name: String,
        /// Address in CIDR notation (e.g. `"10.0.2.2/24"`).
        cidr: String,
    },
    /// Adds a default route.
    RouteAddDefault {
        /// Gateway address.
        via: String,
    },
    /// Writes `/etc/resolv.conf` under `root_path`.
    ConfigureDns {
        /// Nameserver addresses, in order.
        nameservers: Vec<String>,
        /// Search domains.
        search: Vec<String>,
        /// Root directory to write under (container rootfs).
        root_path: String,
    },
    /// Writes `/etc/hosts` under `root_path`.
    ConfigureHosts {
        /// `(ip, hostname)` pairs, in order.
        entries: Vec<(String, String)>,
        /// Root directory to write under (container rootfs).
        root_path: String,
    },
    /// Reports traffic counters for an interface.
    InterfaceStatistics {
        /// Interface name.
        name: String,
    },
    /// Creates the container's cgroup v2 directory, enables every available
    /// controller on it, and writes the given resource limits. Issued once
    /// per VM boot, right after `StandardSetup` — this is the host's only
    /// channel for configuring guest-side resource limits, since the VM
    /// boots through libkrun's internal init rather than a kernel command
    /// line this agent could parse from `/proc/cmdline`.
    CgroupLimits {
        /// Memory ceiling in bytes (`memory.max`).
        mem_max: Option<u64>,
        /// CFS quota in microseconds, paired with `cpu_period_us` (`cpu.max`).
        cpu_quota_us: Option<u64>,
        /// CFS period in microseconds (`cpu.max`).
        cpu_period_us: Option<u64>,
        /// Max number of tasks/processes (`pids.max`).
        pids_max: Option<u32>,
    },
}

/// Guest → host reply to a [`SetupOp`].
#[derive(Debug, Serialize, Deserialize)]
pub enum SetupResp {
    /// Operation succeeded with no data to report.
    Ok,
    /// Reply to [`SetupOp::InterfaceStatistics`].
    Statistics {
        /// Bytes received.
        rx_bytes: u64,
        /// Bytes transmitted.
        tx_bytes: u64,
        /// Packets received.
        rx_packets: u64,
        /// Packets transmitted.
        tx_packets: u64,
    },
    /// Operation failed.
    Error(ErrorInfo),
}

/// Guest's acknowledgment after receiving [`Hello`].
#[derive(Debug, Serialize, Deserialize)]
pub enum HelloAck {
    /// Control channel accepted.
    Control {
        /// Protocol version supported by the guest agent.
        version: u32,
    },
    /// Exec process spawned successfully.
    ExecStarted {
        /// Unique execution identifier assigned by the guest.
        exec_id: String,
        /// Child process ID inside the guest.
        pid: i32,
    },
    /// File/copy operation ready to proceed.
    Ready,
    /// Reply to [`Hello::CreateProcess`].
    ProcessCreated {
        /// Stable id for this process's later calls.
        id: String,
    },
    /// Reply to [`Hello::StartProcess`].
    ProcessStarted {
        /// Child process ID inside the guest.
        pid: i32,
    },
    /// Reply to [`Hello::SignalProcess`], [`Hello::ResizeProcess`],
    /// [`Hello::CloseProcessStdin`], and [`Hello::DeleteProcess`].
    ProcessAck,
    /// Reply to [`Hello::WaitProcess`].
    ProcessExited {
        /// Exit code (`0` = success, `-1` if killed by signal).
        code: i32,
        /// Signal that killed the process, if any.
        signal: Option<i32>,
        /// Wall-clock milliseconds from start to exit.
        duration_ms: u64,
    },
    /// Operation rejected.
    Error(ErrorInfo),
}

/// Host → guest on a control connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ControlReq {
    /// Health check.
    Ping,
    /// Graceful shutdown of the guest agent.
    Shutdown,
    /// Freeze all writable filesystems (`FIFREEZE`).
    Quiesce,
    /// Thaw previously frozen filesystems (`FITHAW`).
    Thaw,
}

/// Guest → host on a control connection.
#[derive(Debug, Serialize, Deserialize)]
pub enum ControlResp {
    /// Reply to [`ControlReq::Ping`].
    Pong {
        /// Guest agent version string.
        version: String,
        /// Milliseconds since the agent started.
        uptime_ms: u64,
    },
    /// Shutdown acknowledged — agent will exit imminently.
    ShutdownOk,
    /// Reply to [`ControlReq::Quiesce`]: number of filesystems frozen.
    QuiesceOk {
        /// Number of filesystems frozen.
        frozen_count: u32,
    },
    /// Reply to [`ControlReq::Thaw`]: number of filesystems thawed.
    ThawOk {
        /// Number of filesystems thawed.
        thawed_count: u32,
    },
    /// Control request failed.
    Error(ErrorInfo),
}

/// OCI-shaped process spec: args, env, cwd, user, and terminal flag.
///
/// Sent inside [`Hello::Exec`] for a one-shot command, or inside
/// [`Hello::CreateProcess`] to register a process the Process Supervisor
/// controls across its own lifetime. Same shape either way — only the
/// surrounding protocol differs in whether the process outlives one
/// connection.
pub type ProcessSpec = ExecStart;

/// Command execution parameters, sent inside [`Hello::Exec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecStart {
    /// Executable path or name.
    pub cmd: String,
    /// Command-line arguments (excluding argv\[0\]).
    pub args: Vec<String>,
    /// Environment variables in `KEY=VALUE` format.
    pub env: Vec<String>,
    /// Working directory inside the guest.
    pub cwd: Option<String>,
    /// Override UID for this execution.
    pub uid: Option<u32>,
    /// Override GID for this execution.
    pub gid: Option<u32>,
    /// Whether the host will send stdin data.
    pub stdin: bool,
    /// PTY configuration for interactive sessions.
    pub tty: Option<TtyConfig>,
    /// Kill the process after this many milliseconds (`0` = no timeout).
    pub timeout_ms: u64,
}

impl ExecStart {
    /// Creates a minimal exec request for the given command.
    #[must_use]
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            uid: None,
            gid: None,
            stdin: false,
            tty: None,
            timeout_ms: 0,
        }
    }

    /// Sets the command-line arguments.
    #[must_use]
    pub fn args(mut self, args: impl Into<Vec<String>>) -> Self {
        self.args = args.into();
        self
    }

    /// Sets the environment variables.
    #[must_use]
    pub fn env(mut self, env: impl Into<Vec<String>>) -> Self {
        self.env = env.into();
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Sets the UID and GID for execution.
    #[must_use]
    pub const fn user(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// Enables stdin piping from the host.
    #[must_use]
    pub const fn with_stdin(mut self) -> Self {
        self.stdin = true;
        self
    }

    /// Configures a PTY for interactive sessions.
    #[must_use]
    pub const fn tty(mut self, rows: u16, cols: u16) -> Self {
        self.tty = Some(TtyConfig {
            rows,
            cols,
            x_pixels: 0,
            y_pixels: 0,
        });
        self
    }

    /// Sets execution timeout in milliseconds.
    #[must_use]
    pub const fn timeout(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }
}

/// PTY dimensions for interactive terminal sessions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TtyConfig {
    /// Terminal height in rows.
    pub rows: u16,
    /// Terminal width in columns.
    pub cols: u16,
    /// Pixel width (optional, `0` if unknown).
    pub x_pixels: u16,
    /// Pixel height (optional, `0` if unknown).
    pub y_pixels: u16,
}

/// Host → guest messages on an exec connection (after [`HelloAck::ExecStarted`]).
#[derive(Debug, Serialize, Deserialize)]
pub enum ExecIn {
    /// Raw stdin data for the child process.
    Stdin(Vec<u8>),
    /// Close stdin (sends EOF to the child).
    StdinClose,
    /// Deliver a POSIX signal to the child.
    Signal(i32),
    /// Resize the PTY window.
    ResizeTty(TtyConfig),
}

/// Guest → host messages on an exec connection (after [`HelloAck::ExecStarted`]).
#[derive(Debug, Serialize, Deserialize)]
pub enum ExecOut {
    /// A chunk of stdout data.
    Stdout(Vec<u8>),
    /// A chunk of stderr data (empty in TTY mode — merged into stdout).
    Stderr(Vec<u8>),
    /// Process exited. Terminal message on the connection.
    Exit {
        /// Exit code (`0` = success).
        code: i32,
        /// Signal that killed the process, if any (e.g. `SIGKILL = 9`).
        signal: Option<i32>,
        /// `true` if `timeout_ms` fired and the agent killed the process.
        timed_out: bool,
        /// Wall-clock milliseconds from spawn to exit.
        duration_ms: u64,
        /// Diagnostic message when the process died unexpectedly.
        error_message: String,
    },
    /// Fatal error during execution (e.g. I/O failure on pipes).
    Error(ErrorInfo),
}

/// Host → guest data chunk for upload streams ([`Hello::FileWrite`], [`Hello::CopyIn`]).
#[derive(Debug, Serialize, Deserialize)]
pub enum Upload {
    /// A data chunk.
    Chunk(Vec<u8>),
    /// End of the upload stream.
    Done,
}

/// Guest → host reply after an upload completes.
#[derive(Debug, Serialize, Deserialize)]
pub enum UploadResult {
    /// Upload succeeded.
    Ok,
    /// Upload failed.
    Error(ErrorInfo),
}

/// Guest → host data chunk for download streams ([`Hello::FileRead`], [`Hello::CopyOut`]).
#[derive(Debug, Serialize, Deserialize)]
pub enum Download {
    /// A data chunk.
    Chunk(Vec<u8>),
    /// End of the download stream.
    Done,
    /// Error reading the requested path.
    Error(ErrorInfo),
}

/// Structured error with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable error classification.
    pub code: ErrorCode,
    /// Human-readable error description.
    pub message: String,
}

impl ErrorInfo {
    /// Creates a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Creates an invalid-request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Creates a permission-denied error.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    /// Creates a version-mismatch error.
    pub fn version_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::VersionMismatch, message)
    }

    /// Creates an unsupported-operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unsupported, message)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Protocol version mismatch.
    VersionMismatch,
    /// Invalid request or argument.
    InvalidRequest,
    /// Resource not found.
    NotFound,
    /// Permission denied.
    PermissionDenied,
    /// Operation timed out.
    Timeout,
    /// Upload size limit exceeded.
    LimitExceeded,
    /// Internal guest agent error.
    Internal,
    /// This guest agent does not implement the requested operation.
    Unsupported,
}
