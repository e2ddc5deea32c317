//! Command execution with PTY support and timeout management.
//!
//! Every exec runs isolated: its own PID/mount/UTS/cgroup namespace, pivoted
//! into the container rootfs. See [`isolate`] for the double-fork mechanics.

pub(crate) mod isolate;
pub(crate) mod pty;

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use bux_proto::{ErrorCode, ErrorInfo, ExecIn, ExecOut, ExecStart, HelloAck};
use nix::unistd::pipe;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Monotonic counter for generating unique execution IDs.
static EXEC_SEQ: AtomicU64 = AtomicU64::new(1);

/// Handles an exec connection: spawns a child, multiplexes I/O until exit.
pub async fn handle(
    r: &mut (impl AsyncRead + Unpin),
    w: &mut (impl AsyncWrite + Unpin),
    req: ExecStart,
) -> io::Result<()> {
    let exec_id = format!("exec-{}", EXEC_SEQ.fetch_add(1, Ordering::Relaxed));
    let spawn_t0 = Instant::now();

    if req.tty.is_some() {
        handle_pty(r, w, req, &exec_id, spawn_t0).await
    } else {
        handle_pipe(r, w, req, &exec_id, spawn_t0).await
    }
}

/// Pipe-mode execution: stdout and stderr are separate streams.
async fn handle_pipe(
    r: &mut (impl AsyncRead + Unpin),
    w: &mut (impl AsyncWrite + Unpin),
    req: ExecStart,
    exec_id: &str,
    spawn_t0: Instant,
) -> io::Result<()> {
    let target = match build_target(&req) {
        Ok(t) => t,
        Err(e) => {
            let err = ErrorInfo::new(ErrorCode::Internal, e.to_string());
            bux_proto::send(w, &HelloAck::Error(err)).await?;
            return w.flush().await;
        }
    };

    let (stdout_rd, stdout_wr) = pipe().map_err(io::Error::other)?;
    let (stderr_rd, stderr_wr) = pipe().map_err(io::Error::other)?;
    let (stdin_rd_for_child, stdin_wr_owned) = if req.stdin {
        let (rd, wr) = pipe().map_err(io::Error::other)?;
        (Some(rd), Some(wr))
    } else {
        (None, None)
    };

    let wire_stdio = move || -> io::Result<()> {
        dup2_onto(&stdout_wr, libc::STDOUT_FILENO)?;
        dup2_onto(&stderr_wr, libc::STDERR_FILENO)?;
        if let Some(ref rd) = stdin_rd_for_child {
            dup2_onto(rd, libc::STDIN_FILENO)?;
        }
        Ok(())
    };

    let spawned =
        tokio::task::spawn_blocking(move || isolate::spawn_isolated(target, wire_stdio))
            .await
            .map_err(io::Error::other)?;

    let child = match spawned {
        Ok(c) => c,
        Err(e) => {
            let err = ErrorInfo::new(ErrorCode::Internal, e.to_string());
            bux_proto::send(w, &HelloAck::Error(err)).await?;
            return w.flush().await;
        }
    };
    let pid = child.pid;
    crate::cgroup::add_current_process(pid);
    let mut child_stdin =
        stdin_wr_owned.map(|fd| tokio::fs::File::from_std(std::fs::File::from(fd)));

    bux_proto::send(
        w,
        &HelloAck::ExecStarted {
            exec_id: exec_id.to_owned(),
            pid,
        },
    )
    .await?;
    w.flush().await?;

    // Set up timeout watcher.
    let timed_out = Arc::new(AtomicBool::new(false));
    if req.timeout_ms > 0 {
        let flag = Arc::clone(&timed_out);
        let timeout = std::time::Duration::from_millis(req.timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            flag.store(true, Ordering::SeqCst);
            unsafe { libc::kill(pid, libc::SIGKILL) };
        });
    }

    let mut stdout = tokio::fs::File::from_std(std::fs::File::from(stdout_rd));
    let mut stderr = tokio::fs::File::from_std(std::fs::File::from(stderr_rd));
    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut stdout_buf = [0u8; 4096];
    let mut stderr_buf = [0u8; 4096];

    loop {
        // Exit the I/O loop once both output streams are done.
        if stdout_done && stderr_done {
            break;
        }

        tokio::select! {
            host_msg = bux_proto::recv::<ExecIn>(r) => {
                match host_msg {
                    Ok(ExecIn::Stdin(data)) => {
                        if let Some(ref mut stdin) = child_stdin {
                            let _ = stdin.write_all(&data).await;
                        }
                    }
                    Ok(ExecIn::StdinClose) => {
                        child_stdin = None;
                    }
                    Ok(ExecIn::Signal(sig)) => {
                        let _ = unsafe { libc::kill(pid, sig) };
                    }
                    Ok(ExecIn::ResizeTty(_)) => {}
                    Err(_) => {
                        // Host disconnected — kill child and collect exit status.
                        let _ = unsafe { libc::kill(pid, libc::SIGKILL) };
                        break;
                    }
                }
            }
            n = stdout.read(&mut stdout_buf), if !stdout_done => {
                match n {
                    Ok(0) | Err(_) => stdout_done = true,
                    Ok(len) => {
                        bux_proto::send(w, &ExecOut::Stdout(stdout_buf[..len].to_vec())).await?;
                    }
                }
            }
            n = stderr.read(&mut stderr_buf), if !stderr_done => {
                match n {
                    Ok(0) | Err(_) => stderr_done = true,
                    Ok(len) => {
                        bux_proto::send(w, &ExecOut::Stderr(stderr_buf[..len].to_vec())).await?;
                    }
                }
            }
        }
    }

    drop(child_stdin);
    send_exit(w, child.reaper, spawn_t0, &timed_out).await
}

/// PTY-mode execution: stdout and stderr are merged into a single PTY stream.
async fn handle_pty(
    r: &mut (impl AsyncRead + Unpin),
    w: &mut (impl AsyncWrite + Unpin),
    req: ExecStart,
    exec_id: &str,
    spawn_t0: Instant,
) -> io::Result<()> {
    let spawn_result = pty::spawn(&req);
    let mut pty_handle = match spawn_result {
        Ok(h) => h,
        Err(e) => {
            let err = ErrorInfo::new(ErrorCode::Internal, e.to_string());
            bux_proto::send(w, &HelloAck::Error(err)).await?;
            return w.flush().await;
        }
    };

    let pid = pty_handle.pid;
    crate::cgroup::add_current_process(pid);
    bux_proto::send(
        w,
        &HelloAck::ExecStarted {
            exec_id: exec_id.to_owned(),
            pid,
        },
    )
    .await?;
    w.flush().await?;

    // Set up timeout watcher.
    let timed_out = Arc::new(AtomicBool::new(false));
    if req.timeout_ms > 0 {
        let flag = Arc::clone(&timed_out);
        let timeout = std::time::Duration::from_millis(req.timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            flag.store(true, Ordering::SeqCst);
            unsafe { libc::kill(pid, libc::SIGKILL) };
        });
    }

    let mut pty_buf = [0u8; 4096];

    loop {
        tokio::select! {
            host_msg = bux_proto::recv::<ExecIn>(r) => {
                match host_msg {
                    Ok(ExecIn::Stdin(data)) => {
                        let _ = pty_handle.master_write.write_all(&data).await;
                    }
                    Ok(ExecIn::StdinClose) => {
                        // PTY doesn't have a separate stdin EOF concept.
                    }
                    Ok(ExecIn::Signal(sig)) => {
                        let _ = unsafe { libc::kill(pid, sig) };
                    }
                    Ok(ExecIn::ResizeTty(config)) => {
                        pty_handle.resize(&config);
                    }
                    Err(_) => {
                        let _ = unsafe { libc::kill(pid, libc::SIGKILL) };
                        break;
                    }
                }
            }
            n = pty_handle.master_read.read(&mut pty_buf) => {
                match n {
                    Ok(0) | Err(_) => break,
                    Ok(len) => {
                        bux_proto::send(w, &ExecOut::Stdout(pty_buf[..len].to_vec())).await?;
                    }
                }
            }
        }
    }

    send_exit(w, pty_handle.reaper, spawn_t0, &timed_out).await
}

/// Waits on the reaper and sends `ExecOut::Exit`.
///
/// The reaper is the agent's only real child; it mirrors the isolated
/// process's exit status (see [`isolate`]), so waiting on it yields the same
/// code/signal the exec'd process itself exited with.
async fn send_exit(
    w: &mut (impl AsyncWrite + Unpin),
    reaper: nix::unistd::Pid,
    spawn_t0: Instant,
    timed_out: &AtomicBool,
) -> io::Result<()> {
    use nix::sys::wait::{WaitStatus, waitpid};

    let wait_result = tokio::task::spawn_blocking(move || waitpid(reaper, None))
        .await
        .map_err(io::Error::other)?;

    let (code, signal) = match wait_result {
        Ok(WaitStatus::Exited(_, c)) => (c, None),
        Ok(WaitStatus::Signaled(_, sig, _)) => (0, Some(sig as i32)),
        // ECHILD: already reaped (SIG_IGN on SIGCHLD).
        Err(nix::errno::Errno::ECHILD) => (0, None),
        Ok(_) | Err(_) => (-1, None),
    };

    #[allow(clippy::cast_possible_truncation)]
    let duration_ms = spawn_t0.elapsed().as_millis() as u64;

    bux_proto::send(
        w,
        &ExecOut::Exit {
            code,
            signal,
            timed_out: timed_out.load(Ordering::SeqCst),
            duration_ms,
            error_message: String::new(),
        },
    )
    .await
}

/// Builds the isolated-exec target from a wire `ExecStart` request.
pub(crate) fn build_target(req: &ExecStart) -> io::Result<isolate::ExecTarget> {
    let program = to_cstring(&req.cmd)?;
    let mut argv = Vec::with_capacity(req.args.len() + 1);
    argv.push(program.clone());
    for arg in &req.args {
        argv.push(to_cstring(arg)?);
    }

    let env = req
        .env
        .iter()
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

    let cwd = req.cwd.as_deref().map(to_cstring).transpose()?;

    Ok(isolate::ExecTarget {
        program,
        argv,
        env,
        cwd,
        uid: req.uid,
        gid: req.gid,
    })
}

/// Converts a `&str` to a `CString`, mapping embedded NULs to an `io::Error`.
fn to_cstring(s: &str) -> io::Result<CString> {
    CString::new(s).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Dups `fd` onto `target`, retrying on `EINTR`.
pub(crate) fn dup2_onto(fd: &OwnedFd, target: std::os::raw::c_int) -> io::Result<()> {
    loop {
        let ret = unsafe { libc::dup2(fd.as_raw_fd(), target) };
        if ret >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
