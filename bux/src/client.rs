//! Async host-side client for communicating with a bux guest agent.
//!
//! Connects via the Unix socket that libkrun maps from a vsock port. Every
//! operation dials a **fresh connection** and exchanges a [`Hello`]/
//! [`HelloAck`] handshake before proceeding, per the per-operation wire
//! model — there is no persistent multiplexed connection to manage.

#[cfg(unix)]
/// Platform-specific implementation (Unix only).
mod inner {
    use std::io;
    use std::path::{Path, PathBuf};

    use bux_proto::{
        ControlReq, ControlResp, ErrorInfo, ExecIn, ExecOut, ExecStart, Hello, HelloAck,
        PROTOCOL_VERSION, ProcessSpec, STREAM_CHUNK_SIZE, SetupOp, SetupResp, TtyConfig,
        UploadResult,
    };
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    /// Event emitted during streaming command execution.
    #[non_exhaustive]
    #[derive(Debug)]
    pub enum ExecEvent {
        /// Process spawned with the given PID.
        Started {
            /// Child process ID inside the guest.
            pid: i32,
        },
        /// A chunk of stdout data.
        Stdout(Vec<u8>),
        /// A chunk of stderr data.
        Stderr(Vec<u8>),
    }

    /// Output captured from a command executed inside the guest.
    #[non_exhaustive]
    #[derive(Debug)]
    pub struct ExecOutput {
        /// Child process ID inside the guest.
        pub pid: i32,
        /// Stdout bytes.
        pub stdout: Vec<u8>,
        /// Stderr bytes.
        pub stderr: Vec<u8>,
        /// Process exit code (`-1` if killed by signal).
        pub code: i32,
    }

    /// Terminal exit status of a process tracked by the Process Supervisor.
    #[non_exhaustive]
    #[derive(Debug, Clone, Copy)]
    pub struct ExitStatus {
        /// Exit code (`0` on success).
        pub code: i32,
        /// Signal that killed the process, if any.
        pub signal: Option<i32>,
        /// Wall-clock milliseconds from start to exit.
        pub duration_ms: u64,
    }

    /// Traffic counters for a guest network interface.
    #[non_exhaustive]
    #[derive(Debug, Clone, Copy)]
    pub struct InterfaceStats {
        /// Bytes received.
        pub rx_bytes: u64,
        /// Bytes transmitted.
        pub tx_bytes: u64,
        /// Packets received.
        pub rx_packets: u64,
        /// Packets transmitted.
        pub tx_packets: u64,
    }

    /// Converts a guest-reported [`ErrorInfo`] into an [`io::Error`].
    fn io_err(e: ErrorInfo) -> io::Error {
        io::Error::other(e)
    }

    /// Dials a new connection to the guest agent, one per operation.
    ///
    /// Holds only the socket path: each call opens and tears down its own
    /// connection, matching the per-operation wire model.
    #[derive(Debug, Clone)]
    pub struct Client {
        /// Unix socket path mapped from the guest's vsock listener.
        socket_path: PathBuf,
    }

    impl Client {
        /// Records the guest agent's Unix socket path.
        ///
        /// This does not dial yet — the socket must already be connectable,
        /// so callers typically probe with [`Client::handshake`] afterward.
        pub async fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
            let socket_path = path.as_ref().to_path_buf();
            // Probe immediately so callers see connection failures up front.
            let _ = UnixStream::connect(&socket_path).await?;
            Ok(Self { socket_path })
        }

        /// Opens a fresh connection to the guest agent.
        async fn dial(&self) -> io::Result<UnixStream> {
            UnixStream::connect(&self.socket_path).await
        }

        /// Performs a version handshake with the guest agent.
        pub async fn handshake(&self) -> io::Result<()> {
            let mut stream = self.dial().await?;
            bux_proto::send(
                &mut stream,
                &Hello::Control {
                    version: PROTOCOL_VERSION,
                },
            )
            .await?;
            match bux_proto::recv::<HelloAck>(&mut stream).await? {
                HelloAck::Control { version } if version == PROTOCOL_VERSION => Ok(()),
                HelloAck::Control { version } => Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("protocol version mismatch: host={PROTOCOL_VERSION}, guest={version}"),
                )),
                HelloAck::Error(e) => Err(io_err(e)),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "expected HelloAck::Control",
                )),
            }
        }

        /// Opens a control connection and exchanges one request/response.
        async fn control(&self, req: ControlReq) -> io::Result<ControlResp> {
            let mut stream = self.dial().await?;
            bux_proto::send(
                &mut stream,
                &Hello::Control {
                    version: PROTOCOL_VERSION,
                },
            )
            .await?;
            match bux_proto::recv::<HelloAck>(&mut stream).await? {
                HelloAck::Control { .. } => {}
                HelloAck::Error(e) => return Err(io_err(e)),
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "expected HelloAck::Control",
                    ));
                }
            }
            bux_proto::send(&mut stream, &req).await?;
            bux_proto::recv(&mut stream).await
        }

        /// Health check. Returns the guest agent's version and uptime.
        pub async fn ping(&self) -> io::Result<(String, u64)> {
            match self.control(ControlReq::Ping).await? {
                ControlResp::Pong { version, uptime_ms } => Ok((version, uptime_ms)),
                ControlResp::Error(e) => Err(io_err(e)),
                _ => Err(io::Error::new(io::ErrorKind::InvalidData, "expected Pong")),
            }
        }

        /// Requests graceful shutdown of the guest agent.
        pub async fn shutdown(&self) -> io::Result<()> {
            match self.control(ControlReq::Shutdown).await? {
                ControlResp::ShutdownOk => Ok(()),
                ControlResp::Error(e) => Err(io_err(e)),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "expected ShutdownOk",
                )),
            }
        }

        /// Freezes all writable guest filesystems. Returns the frozen count.
        pub async fn quiesce(&self) -> io::Result<u32> {
            match self.control(ControlReq::Quiesce).await? {
                ControlResp::QuiesceOk { frozen_count } => Ok(frozen_count),
                ControlResp::Error(e) => Err(io_err(e)),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "expected QuiesceOk",
                )),
            }
        }

        /// Thaws previously frozen guest filesystems. Returns the thawed count.
        pub async fn thaw(&self) -> io::Result<u32> {
            match self.control(ControlReq::Thaw).await? {
                ControlResp::ThawOk { thawed_count } => Ok(thawed_count),
                ControlResp::Error(e) => Err(io_err(e)),
                _ => Err(io::Error::new(io::ErrorKind::InvalidData, "expected ThawOk")),
            }
        }

        /// Executes a command, streaming output via callback. Returns exit code.
        ///
        /// The callback receives [`ExecEvent::Started`] first with the child PID,
        /// then zero or more [`ExecEvent::Stdout`]/[`ExecEvent::Stderr`] chunks.
        pub async fn exec_stream(
            &self,
            req: ExecStart,
            mut on: impl FnMut(ExecEvent),
        ) -> io::Result<i32> {
            let mut stream = self.dial().await?;
            bux_proto::send(&mut stream, &Hello::Exec(req)).await?;
            match bux_proto::recv::<HelloAck>(&mut stream).await? {
                HelloAck::ExecStarted { pid, .. } => on(ExecEvent::Started { pid }),
                HelloAck::Error(e) => return Err(io_err(e)),
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "expected HelloAck::ExecStarted",
                    ));
                }
            }
            loop {
                match bux_proto::recv::<ExecOut>(&mut stream).await? {
                    ExecOut::Stdout(d) => on(ExecEvent::Stdout(d)),
                    ExecOut::Stderr(d) => on(ExecEvent::Stderr(d)),
                    ExecOut::Exit { code, .. } => return Ok(code),
                    ExecOut::Error(e) => return Err(io_err(e)),
                }
            }
        }

        /// Executes a command and collects all output.
        pub async fn exec(&self, req: ExecStart) -> io::Result<ExecOutput> {
            let mut pid = 0i32;
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let code = self
                .exec_stream(req, |event| match event {
                    ExecEvent::Started { pid: p } => pid = p,
                    ExecEvent::Stdout(d) => stdout.extend(d),
                    ExecEvent::Stderr(d) => stderr.extend(d),
                })
                .await?;
            Ok(ExecOutput {
                pid,
                stdout,
                stderr,
                code,
            })
        }

        /// Executes a command with stdin data piped to the process.
        ///
        /// Splits the stream internally so stdin writes and stdout/stderr
        /// reads proceed concurrently (avoids deadlock on large payloads).
        pub async fn exec_with_stdin(
            &self,
            mut req: ExecStart,
            stdin_data: &[u8],
            mut on: impl FnMut(ExecEvent),
        ) -> io::Result<i32> {
            req.stdin = true;
            let mut stream = self.dial().await?;
            bux_proto::send(&mut stream, &Hello::Exec(req)).await?;

            match bux_proto::recv::<HelloAck>(&mut stream).await? {
                HelloAck::ExecStarted { pid, .. } => on(ExecEvent::Started { pid }),
                HelloAck::Error(e) => return Err(io_err(e)),
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "expected HelloAck::ExecStarted",
                    ));
                }
            }

            // Split for concurrent read/write to prevent deadlock.
            let (mut r, mut w) = tokio::io::split(&mut stream);

            let stdin_buf = stdin_data.to_vec();
            let write_stdin = async {
                let _ = bux_proto::send(&mut w, &ExecIn::Stdin(stdin_buf)).await;
                let _ = bux_proto::send(&mut w, &ExecIn::StdinClose).await;
                let _ = w.flush().await;
            };

            let read_output = async {
                loop {
                    match bux_proto::recv::<ExecOut>(&mut r).await? {
                        ExecOut::Stdout(d) => on(ExecEvent::Stdout(d)),
                        ExecOut::Stderr(d) => on(ExecEvent::Stderr(d)),
                        ExecOut::Exit { code, .. } => return io::Result::Ok(code),
                        ExecOut::Error(e) => return Err(io_err(e)),
                    }
                }
            };

            let ((), code) = tokio::join!(write_stdin, read_output);
            code
        }

        /// Registers a process without starting it. Returns a stable id for
        /// use by every later Process Supervisor call against it, from any
        /// connection.
        pub async fn create_process(&self, spec: ProcessSpec) -> io::Result<String> {
            let mut stream = self.dial().await?;
            bux_proto::send(&mut stream, &Hello::CreateProcess(spec)).await?;
            match bux_proto::recv::<HelloAck>(&mut stream).await? {
                HelloAck::ProcessCreated { id } => Ok(id),
                HelloAck::Error(e) => Err(io_err(e)),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "expected HelloAck::ProcessCreated",
                )),
            }
        }

        /// Starts a previously created process. Returns its guest pid.
        pub async fn start_process(&self, id: &str) -> io::Result<i32> {
            let mut stream = self.dial().await?;
            bux_proto::send(
                &mut stream,
                &Hello::StartProcess { id: id.to_owned() },
            )
            .await?;
            match bux_proto::recv::<HelloAck>(&mut stream).await? {
                HelloAck::ProcessStarted { pid } => Ok(pid),
                HelloAck::Error(e) => Err(io_err(e)),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "expected HelloAck::ProcessStarted",
                )),
            }
        }

        /// Attaches to a started process's stdio on its own connection,
        /// writing `stdin_data` (if any) and streaming output via callback
        /// until the connection closes or the process exits.
        ///
        /// Unlike [`Client::exec_stream`], closing this connection does not
        /// kill the process — it keeps running, attachable again later or
        /// collected with [`Client::wait_process`]. Concurrent processes can
        /// each hold their own attach connection; [`Client::signal_process`]
        /// and [`Client::resize_process`] work from any connection, since
        /// they address the process by id rather than by this one.
        pub async fn attach_stdio(
            &self,
            id: &str,
            stdin_data: Option<&[u8]>,
            mut on: impl FnMut(ExecEvent),
        ) -> io::Result<()> {
            let mut stream = self.dial().await?;
            bux_proto::send(&mut stream, &Hello::AttachStdio { id: id.to_owned() }).await?;
            match bux_proto::recv::<HelloAck>(&mut stream).await? {
                HelloAck::Ready => {}
                HelloAck::Error(e) => return Err(io_err(e)),
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "expected HelloAck::Ready",
                    ));
                }
            }

            let (mut r, mut w) = tokio::io::split(&mut stream);

            let write_stdin = async {
                if let Some(data) = stdin_data {
                    let _ = bux_proto::send(&mut w, &ExecIn::Stdin(data.to_vec())).await;
                    let _ = bux_proto::send(&mut w, &ExecIn::StdinClose).await;
                    let _ = w.flush().await;
                }
            };

            let read_output = async {
                loop {
                    match bux_proto::recv::<ExecOut>(&mut r).await? {
                        ExecOut::Stdout(d) => on(ExecEvent::Stdout(d)),
                        ExecOut::Stderr(d) => on(ExecEvent::Stderr(d)),
                        ExecOut::Exit { .. } => return io::Result::Ok(()),
                        ExecOut::Error(e) => return Err(io_err(e)),
                    }
                }
            };

            let ((), result) = tokio::join!(write_stdin, read_output);
            result
        }

        /// Delivers a signal to a started process.
        pub async fn signal_process(&self, id: &str, signal: i32) -> io::Result<()> {
            let mut stream = self.dial().await?;
            bux_proto::send(
                &mut stream,
                &Hello::SignalProcess {
                    id: id.to_owned(),
                    signal,
                },
            )
            .await?;
            self.expect_process_ack(&mut stream).await
        }

        /// Resizes a started terminal process's window.
        pub async fn resize_process(&self, id: &str, tty: TtyConfig) -> io::Result<()> {
            let mut stream = self.dial().await?;
            bux_proto::send(
                &mut stream,
                &Hello::ResizeProcess {
                    id: id.to_owned(),
                    tty,
                },
            )
            .await?;
            self.expect_process_ack(&mut stream).await
        }

        /// Closes a started process's stdin (sends EOF to the child).
        pub async fn close_process_stdin(&self, id: &str) -> io::Result<()> {
            let mut stream = self.dial().await?;
            bux_proto::send(
                &mut stream,
                &Hello::CloseProcessStdin { id: id.to_owned() },
            )
            .await?;
            self.expect_process_ack(&mut stream).await
        }

        /// Blocks until a process exits, bounded by `timeout_ms` (`0` = wait
        /// indefinitely).
        pub async fn wait_process(&self, id: &str, timeout_ms: u64) -> io::Result<ExitStatus> {
            let mut stream = self.dial().await?;
            bux_proto::send(
                &mut stream,
                &Hello::WaitProcess {
                    id: id.to_owned(),
                    timeout_ms,
                },
            )
            .await?;
            match bux_proto::recv::<HelloAck>(&mut stream).await? {
                HelloAck::ProcessExited {
                    code,
                    signal,
                    duration_ms,
                } => Ok(ExitStatus {
                    code,
                    signal,
                    duration_ms,
                }),
                HelloAck::Error(e) => Err(io_err(e)),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "expected HelloAck::ProcessExited",
                )),
            }
        }

        /// Releases a process's guest-side resources, force-killing it first
        /// if still running.
        pub async fn delete_process(&self, id: &str) -> io::Result<()> {
            let mut stream = self.dial().await?;
            bux_proto::send(
                &mut stream,
                &Hello::DeleteProcess { id: id.to_owned() },
            )
            .await?;
            self.expect_process_ack(&mut stream).await
        }

        /// Consumes the [`HelloAck::ProcessAck`] common to several Process
        /// Supervisor calls.
        async fn expect_process_ack(&self, stream: &mut UnixStream) -> io::Result<()> {
            match bux_proto::recv::<HelloAck>(stream).await? {
                HelloAck::ProcessAck => Ok(()),
                HelloAck::Error(e) => Err(io_err(e)),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "expected HelloAck::ProcessAck",
                )),
            }
        }

        /// Reads a file from the guest filesystem.
        pub async fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
            let mut stream = self.dial().await?;
            bux_proto::send(
                &mut stream,
                &Hello::FileRead {
                    path: path.to_owned(),
                },
            )
            .await?;
            self.expect_ready(&mut stream).await?;
            bux_proto::recv_download(&mut stream).await
        }

        /// Writes a file to the guest filesystem.
        pub async fn write_file(&self, path: &str, data: &[u8], mode: u32) -> io::Result<()> {
            let mut stream = self.dial().await?;
            bux_proto::send(
                &mut stream,
                &Hello::FileWrite {
                    path: path.to_owned(),
                    mode,
                },
            )
            .await?;
            self.expect_ready(&mut stream).await?;
            bux_proto::send_upload(&mut stream, data, STREAM_CHUNK_SIZE).await?;
            match bux_proto::recv::<UploadResult>(&mut stream).await? {
                UploadResult::Ok => Ok(()),
                UploadResult::Error(e) => Err(io_err(e)),
            }
        }

        /// Copies a tar archive into the guest, unpacking at `dest`.
        pub async fn copy_in(&self, dest: &str, tar_data: &[u8]) -> io::Result<()> {
            let mut stream = self.dial().await?;
            bux_proto::send(
                &mut stream,
                &Hello::CopyIn {
                    dest: dest.to_owned(),
                },
            )
            .await?;
            self.expect_ready(&mut stream).await?;
            bux_proto::send_upload(&mut stream, tar_data, STREAM_CHUNK_SIZE).await?;
            match bux_proto::recv::<UploadResult>(&mut stream).await? {
                UploadResult::Ok => Ok(()),
                UploadResult::Error(e) => Err(io_err(e)),
            }
        }

        /// Copies a path from the guest as a tar archive.
        pub async fn copy_out(&self, path: &str) -> io::Result<Vec<u8>> {
            let mut stream = self.dial().await?;
            bux_proto::send(
                &mut stream,
                &Hello::CopyOut {
                    path: path.to_owned(),
                    follow_symlinks: false,
                },
            )
            .await?;
            self.expect_ready(&mut stream).await?;
            bux_proto::recv_download(&mut stream).await
        }

        /// Runs a single setup/admin operation inside the guest.
        async fn setup(&self, op: SetupOp) -> io::Result<SetupResp> {
            let mut stream = self.dial().await?;
            bux_proto::send(&mut stream, &Hello::Setup(op)).await?;
            bux_proto::recv(&mut stream).await
        }

        /// Expects [`SetupResp::Ok`], mapping anything else to an error.
        fn expect_setup_ok(resp: SetupResp) -> io::Result<()> {
            match resp {
                SetupResp::Ok => Ok(()),
                SetupResp::Error(e) => Err(io_err(e)),
                SetupResp::Statistics { .. } => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "expected SetupResp::Ok",
                )),
            }
        }

        /// Mounts procfs, sysfs, and devpts inside the guest. Idempotent.
        pub async fn standard_setup(&self) -> io::Result<()> {
            let resp = self.setup(SetupOp::StandardSetup).await?;
            Self::expect_setup_ok(resp)
        }

        /// Mounts a filesystem inside the guest.
        pub async fn mount(
            &self,
            source: &str,
            target: &str,
            fstype: &str,
            flags: u64,
            data: Option<&str>,
        ) -> io::Result<()> {
            let resp = self
                .setup(SetupOp::Mount {
                    source: source.to_owned(),
                    target: target.to_owned(),
                    fstype: fstype.to_owned(),
                    flags,
                    data: data.map(str::to_owned),
                })
                .await?;
            Self::expect_setup_ok(resp)
        }

        /// Unmounts a filesystem inside the guest.
        pub async fn umount(&self, path: &str, flags: i32) -> io::Result<()> {
            let resp = self
                .setup(SetupOp::Umount {
                    path: path.to_owned(),
                    flags,
                })
                .await?;
            Self::expect_setup_ok(resp)
        }

        /// Creates a directory inside the guest.
        pub async fn mkdir(&self, path: &str, all: bool, mode: u32) -> io::Result<()> {
            let resp = self
                .setup(SetupOp::Mkdir {
                    path: path.to_owned(),
                    all,
                    mode,
                })
                .await?;
            Self::expect_setup_ok(resp)
        }

        /// Creates the container's cgroup, enables every available controller,
        /// and applies resource limits inside the guest.
        pub async fn apply_cgroup_limits(
            &self,
            mem_max: Option<u64>,
            cpu_quota_us: Option<u64>,
            cpu_period_us: Option<u64>,
            pids_max: Option<u32>,
        ) -> io::Result<()> {
            let resp = self
                .setup(SetupOp::CgroupLimits {
                    mem_max,
                    cpu_quota_us,
                    cpu_period_us,
                    pids_max,
                })
                .await?;
            Self::expect_setup_ok(resp)
        }

        /// Brings a network interface up inside the guest, optionally setting its MTU.
        pub async fn link_up(&self, name: &str, mtu: Option<u32>) -> io::Result<()> {
            let resp = self
                .setup(SetupOp::LinkUp {
                    name: name.to_owned(),
                    mtu,
                })
                .await?;
            Self::expect_setup_ok(resp)
        }

        /// Brings a network interface down inside the guest.
        pub async fn link_down(&self, name: &str) -> io::Result<()> {
            let resp = self
                .setup(SetupOp::LinkDown {
                    name: name.to_owned(),
                })
                .await?;
            Self::expect_setup_ok(resp)
        }

        /// Adds an address (CIDR notation) to an interface inside the guest.
        pub async fn address_add(&self, name: &str, cidr: &str) -> io::Result<()> {
            let resp = self
                .setup(SetupOp::AddressAdd {
                    name: name.to_owned(),
                    cidr: cidr.to_owned(),
                })
                .await?;
            Self::expect_setup_ok(resp)
        }

        /// Adds a default route inside the guest.
        pub async fn route_add_default(&self, via: &str) -> io::Result<()> {
            let resp = self
                .setup(SetupOp::RouteAddDefault { via: via.to_owned() })
                .await?;
            Self::expect_setup_ok(resp)
        }

        /// Writes `/etc/resolv.conf` under `root_path` inside the guest.
        pub async fn configure_dns(
            &self,
            nameservers: &[String],
            search: &[String],
            root_path: &str,
        ) -> io::Result<()> {
            let resp = self
                .setup(SetupOp::ConfigureDns {
                    nameservers: nameservers.to_vec(),
                    search: search.to_vec(),
                    root_path: root_path.to_owned(),
                })
                .await?;
            Self::expect_setup_ok(resp)
        }

        /// Writes `/etc/hosts` under `root_path` inside the guest.
        pub async fn configure_hosts(
            &self,
            entries: &[(String, String)],
            root_path: &str,
        ) -> io::Result<()> {
            let resp = self
                .setup(SetupOp::ConfigureHosts {
                    entries: entries.to_vec(),
                    root_path: root_path.to_owned(),
                })
                .await?;
            Self::expect_setup_ok(resp)
        }

        /// Reports traffic counters for a guest network interface.
        pub async fn interface_statistics(&self, name: &str) -> io::Result<InterfaceStats> {
            let resp = self
                .setup(SetupOp::InterfaceStatistics {
                    name: name.to_owned(),
                })
                .await?;
            match resp {
                SetupResp::Statistics {
                    rx_bytes,
                    tx_bytes,
                    rx_packets,
                    tx_packets,
                } => Ok(InterfaceStats {
                    rx_bytes,
                    tx_bytes,
                    rx_packets,
                    tx_packets,
                }),
                SetupResp::Error(e) => Err(io_err(e)),
                SetupResp::Ok => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "expected SetupResp::Statistics",
                )),
            }
        }

        /// Consumes the [`HelloAck`] that must precede a file/copy transfer.
        async fn expect_ready(&self, stream: &mut UnixStream) -> io::Result<()> {
            match bux_proto::recv::<HelloAck>(stream).await? {
                HelloAck::Ready => Ok(()),
                HelloAck::Error(e) => Err(io_err(e)),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "expected HelloAck::Ready",
                )),
            }
        }
    }
}

#[cfg(unix)]
pub use inner::{Client, ExecEvent, ExecOutput, ExitStatus, InterfaceStats};
