//! Persistent per-process registry: the guest half of the Process Supervisor.
//!
//! A plain [`crate::exec`] connection ties a spawned process's lifetime to
//! one connection: the caller that issued `Hello::Exec` is the only one who
//! can signal, resize, or collect the exit of that process, and only while
//! its connection stays open. Here, `create`/`start` hand back a stable id
//! that survives the connection: `signal`/`resize`/`closeStdin`/`wait`/
//! `delete` can each arrive later, on their own connection, looked up by
//! that id. Stdio itself attaches on its own connection too
//! ([`Hello::AttachStdio`]) — the closest this transport gets to a
//! dedicated port per stream, since the underlying vsock ports are bound
//! once at VM boot rather than grown per process.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use bux_proto::{ErrorCode, ErrorInfo, ExecIn, ExecOut, HelloAck, ProcessSpec, TtyConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};

use crate::exec::{build_target, isolate, pty};

static PROCESSES: OnceLock<Mutex<HashMap<String, Entry>>> = OnceLock::new();
static PROC_SEQ: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Mutex<HashMap<String, Entry>> {
    PROCESSES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Exit status recorded once a process's reaper has been waited on.
#[derive(Debug, Clone, Copy)]
pub struct ExitInfo {
    pub code: i32,
    pub signal: Option<i32>,
    pub duration_ms: u64,
}

/// Control messages forwarded into a process's pump task.
enum Ctl {
    Stdin(Vec<u8>),
    StdinClose,
    Resize(TtyConfig),
}

/// A process that has been created but not yet started.
struct Pending {
    spec: ProcessSpec,
}

/// A process whose pump task is running.
struct Started {
    pid: i32,
    is_tty: bool,
    ctl_tx: mpsc::UnboundedSender<Ctl>,
    stdout_tx: broadcast::Sender<Vec<u8>>,
    stderr_tx: broadcast::Sender<Vec<u8>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

enum Entry {
    Pending(Pending),
    Started(Started),
}

fn not_found(id: &str) -> ErrorInfo {
    ErrorInfo::not_found(format!("no such process: {id}"))
}

fn invalid_state(id: &str, op: &str) -> ErrorInfo {
    ErrorInfo::invalid_request(format!("cannot {op} process {id} in its current state"))
}

/// Registers a process without starting it. Returns its id.
pub fn create(spec: ProcessSpec) -> String {
    let id = format!("proc-{}", PROC_SEQ.fetch_add(1, Ordering::Relaxed));
    registry()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .insert(id.clone(), Entry::Pending(Pending { spec }));
    id
}

/// Starts a previously created process. Returns its pid.
pub async fn start(id: &str) -> Result<i32, ErrorInfo> {
    let spec = {
        let mut reg = registry().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match reg.remove(id) {
            Some(Entry::Pending(p)) => p.spec,
            Some(other) => {
                reg.insert(id.to_owned(), other);
                return Err(invalid_state(id, "start"));
            }
            None => return Err(not_found(id)),
        }
    };

    let spawn_t0 = Instant::now();
    let id_owned = id.to_owned();

    let started = if spec.tty.is_some() {
        spawn_tty(&spec, spawn_t0).await
    } else {
        spawn_pipes(&spec, spawn_t0).await
    };

    let started = match started {
        Ok(s) => s,
        Err(e) => return Err(ErrorInfo::internal(e.to_string())),
    };

    let pid = started.pid;
    crate::cgroup::add_current_process(pid);
    registry()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .insert(id_owned, Entry::Started(started));
    Ok(pid)
}

/// Spawns a non-terminal process and launches its pump task.
async fn spawn_pipes(spec: &ProcessSpec, spawn_t0: Instant) -> io::Result<Started> {
    use nix::unistd::pipe;

    let target = build_target(spec)?;

    let (stdout_rd, stdout_wr) = pipe().map_err(io::Error::other)?;
    let (stderr_rd, stderr_wr) = pipe().map_err(io::Error::other)?;
    let (stdin_rd_for_child, stdin_wr_owned) = if spec.stdin {
        let (rd, wr) = pipe().map_err(io::Error::other)?;
        (Some(rd), Some(wr))
    } else {
        (None, None)
    };

    let wire_stdio = move || -> io::Result<()> {
        crate::exec::dup2_onto(&stdout_wr, libc::STDOUT_FILENO)?;
        crate::exec::dup2_onto(&stderr_wr, libc::STDERR_FILENO)?;
        if let Some(ref rd) = stdin_rd_for_child {
            crate::exec::dup2_onto(rd, libc::STDIN_FILENO)?;
        }
        Ok(())
    };

    let child = tokio::task::spawn_blocking(move || isolate::spawn_isolated(target, wire_stdio))
        .await
        .map_err(io::Error::other)??;

    let pid = child.pid;
    let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel::<Ctl>();
    let (stdout_tx, _) = broadcast::channel(256);
    let (stderr_tx, _) = broadcast::channel(256);
    let (exit_tx, exit_rx) = watch::channel(None);

    let stdout_tx_task = stdout_tx.clone();
    let stderr_tx_task = stderr_tx.clone();
    let reaper = child.reaper;

    tokio::spawn(async move {
        let mut stdout = tokio::fs::File::from_std(std::fs::File::from(stdout_rd));
        let mut stderr = tokio::fs::File::from_std(std::fs::File::from(stderr_rd));
        let mut child_stdin =
            stdin_wr_owned.map(|fd| tokio::fs::File::from_std(std::fs::File::from(fd)));
        let mut stdout_done = false;
        let mut stderr_done = false;
        let mut stdout_buf = [0u8; 4096];
        let mut stderr_buf = [0u8; 4096];

        loop {
            if stdout_done && stderr_done {
                break;
            }
            tokio::select! {
                ctl = ctl_rx.recv() => {
                    match ctl {
                        Some(Ctl::Stdin(data)) => {
                            if let Some(ref mut stdin) = child_stdin {
                                let _ = stdin.write_all(&data).await;
                            }
                        }
                        Some(Ctl::StdinClose) => child_stdin = None,
                        Some(Ctl::Resize(_)) | None => {}
                    }
                }
                n = stdout.read(&mut stdout_buf), if !stdout_done => {
                    match n {
                        Ok(0) | Err(_) => stdout_done = true,
                        Ok(len) => { let _ = stdout_tx_task.send(stdout_buf[..len].to_vec()); }
                    }
                }
                n = stderr.read(&mut stderr_buf), if !stderr_done => {
                    match n {
                        Ok(0) | Err(_) => stderr_done = true,
                        Ok(len) => { let _ = stderr_tx_task.send(stderr_buf[..len].to_vec()); }
                    }
                }
            }
        }

        let info = reap(reaper, spawn_t0).await;
        let _ = exit_tx.send(Some(info));
    });

    Ok(Started {
        pid,
        is_tty: false,
        ctl_tx,
        stdout_tx,
        stderr_tx,
        exit_rx,
    })
}

/// Spawns a terminal process and launches its pump task.
async fn spawn_tty(spec: &ProcessSpec, spawn_t0: Instant) -> io::Result<Started> {
    let pty_handle = tokio::task::spawn_blocking({
        let spec = spec.clone();
        move || pty::spawn(&spec)
    })
    .await
    .map_err(io::Error::other)??;

    let pid = pty_handle.pid;
    let reaper = pty_handle.reaper;
    let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel::<Ctl>();
    let (stdout_tx, _) = broadcast::channel(256);
    let (stderr_tx, _) = broadcast::channel(1);
    let (exit_tx, exit_rx) = watch::channel(None);
    let stdout_tx_task = stdout_tx.clone();

    tokio::spawn(async move {
        let mut pty_handle = pty_handle;
        let mut pty_buf = [0u8; 4096];

        loop {
            tokio::select! {
                ctl = ctl_rx.recv() => {
                    match ctl {
                        Some(Ctl::Stdin(data)) => {
                            let _ = pty_handle.master_write.write_all(&data).await;
                        }
                        Some(Ctl::Resize(cfg)) => pty_handle.resize(&cfg),
                        Some(Ctl::StdinClose) | None => {}
                    }
                }
                n = pty_handle.master_read.read(&mut pty_buf) => {
                    match n {
                        Ok(0) | Err(_) => break,
                        Ok(len) => { let _ = stdout_tx_task.send(pty_buf[..len].to_vec()); }
                    }
                }
            }
        }

        let info = reap(reaper, spawn_t0).await;
        let _ = exit_tx.send(Some(info));
    });

    Ok(Started {
        pid,
        is_tty: true,
        ctl_tx,
        stdout_tx,
        stderr_tx,
        exit_rx,
    })
}

/// Waits on the reaper and builds the corresponding [`ExitInfo`].
async fn reap(reaper: nix::unistd::Pid, spawn_t0: Instant) -> ExitInfo {
    use nix::sys::wait::{WaitStatus, waitpid};

    let wait_result = tokio::task::spawn_blocking(move || waitpid(reaper, None)).await;

    let (code, signal) = match wait_result {
        Ok(Ok(WaitStatus::Exited(_, c))) => (c, None),
        Ok(Ok(WaitStatus::Signaled(_, sig, _))) => (0, Some(sig as i32)),
        Ok(Err(nix::errno::Errno::ECHILD)) => (0, None),
        _ => (-1, None),
    };

    #[allow(clippy::cast_possible_truncation)]
    let duration_ms = spawn_t0.elapsed().as_millis() as u64;

    ExitInfo {
        code,
        signal,
        duration_ms,
    }
}

/// Serves an [`Hello::AttachStdio`] connection: forwards `ExecIn` frames in,
/// streams `ExecOut` frames out, until the process exits or the connection
/// drops.
pub async fn attach_stdio(
    r: &mut (impl AsyncRead + Unpin),
    w: &mut (impl AsyncWrite + Unpin),
    id: &str,
) -> io::Result<()> {
    let (ctl_tx, mut stdout_rx, mut stderr_rx, mut exit_rx) = {
        let reg = registry().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match reg.get(id) {
            Some(Entry::Started(s)) => (
                s.ctl_tx.clone(),
                s.stdout_tx.subscribe(),
                s.stderr_tx.subscribe(),
                s.exit_rx.clone(),
            ),
            _ => {
                let err = ErrorInfo::not_found(format!("no running process: {id}"));
                bux_proto::send(w, &HelloAck::Error(err)).await?;
                return w.flush().await;
            }
        }
    };

    bux_proto::send(w, &HelloAck::Ready).await?;
    w.flush().await?;

    loop {
        if let Some(info) = *exit_rx.borrow() {
            return bux_proto::send(
                w,
                &ExecOut::Exit {
                    code: info.code,
                    signal: info.signal,
                    timed_out: false,
                    duration_ms: info.duration_ms,
                    error_message: String::new(),
                },
            )
            .await;
        }

        tokio::select! {
            host_msg = bux_proto::recv::<ExecIn>(r) => {
                match host_msg {
                    Ok(ExecIn::Stdin(data)) => { let _ = ctl_tx.send(Ctl::Stdin(data)); }
                    Ok(ExecIn::StdinClose) => { let _ = ctl_tx.send(Ctl::StdinClose); }
                    Ok(ExecIn::Signal(sig)) => { let _ = signal(id, sig); }
                    Ok(ExecIn::ResizeTty(cfg)) => { let _ = ctl_tx.send(Ctl::Resize(cfg)); }
                    Err(_) => return Ok(()),
                }
            }
            chunk = stdout_rx.recv() => {
                if let Ok(data) = chunk {
                    bux_proto::send(w, &ExecOut::Stdout(data)).await?;
                }
            }
            chunk = stderr_rx.recv() => {
                if let Ok(data) = chunk {
                    bux_proto::send(w, &ExecOut::Stderr(data)).await?;
                }
            }
            changed = exit_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Delivers a signal to a started process's real pid.
pub fn signal(id: &str, sig: i32) -> Result<(), ErrorInfo> {
    let reg = registry().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    match reg.get(id) {
        Some(Entry::Started(s)) => {
            if unsafe { libc::kill(s.pid, sig) } == 0 {
                Ok(())
            } else {
                Err(ErrorInfo::internal(io::Error::last_os_error().to_string()))
            }
        }
        Some(Entry::Pending(_)) => Err(invalid_state(id, "signal")),
        None => Err(not_found(id)),
    }
}

/// Resizes a started terminal process's window.
pub fn resize(id: &str, tty: TtyConfig) -> Result<(), ErrorInfo> {
    let reg = registry().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    match reg.get(id) {
        Some(Entry::Started(s)) if s.is_tty => {
            let _ = s.ctl_tx.send(Ctl::Resize(tty));
            Ok(())
        }
        Some(Entry::Started(_)) => Err(ErrorInfo::unsupported("process has no terminal")),
        Some(Entry::Pending(_)) => Err(invalid_state(id, "resize")),
        None => Err(not_found(id)),
    }
}

/// Closes a started process's stdin.
pub fn close_stdin(id: &str) -> Result<(), ErrorInfo> {
    let reg = registry().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    match reg.get(id) {
        Some(Entry::Started(s)) => {
            let _ = s.ctl_tx.send(Ctl::StdinClose);
            Ok(())
        }
        Some(Entry::Pending(_)) => Err(invalid_state(id, "closeStdin")),
        None => Err(not_found(id)),
    }
}

/// Blocks until the process exits or `timeout_ms` elapses (`0` = forever).
pub async fn wait(id: &str, timeout_ms: u64) -> Result<ExitInfo, ErrorInfo> {
    let mut exit_rx = {
        let reg = registry().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match reg.get(id) {
            Some(Entry::Started(s)) => s.exit_rx.clone(),
            Some(Entry::Pending(_)) => return Err(invalid_state(id, "wait")),
            None => return Err(not_found(id)),
        }
    };

    if let Some(info) = *exit_rx.borrow() {
        return Ok(info);
    }

    let wait_fut = exit_rx.wait_for(Option::is_some);
    let result = if timeout_ms == 0 {
        wait_fut.await.ok().and_then(|g| *g)
    } else {
        tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), wait_fut)
            .await
            .ok()
            .and_then(Result::ok)
            .and_then(|g| *g)
    };

    result.ok_or_else(|| ErrorInfo::new(ErrorCode::Timeout, format!("wait timed out for {id}")))
}

/// Releases a process's resources, force-killing it first if still running.
pub fn delete(id: &str) -> Result<(), ErrorInfo> {
    let mut reg = registry().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    match reg.remove(id) {
        Some(Entry::Started(s)) => {
            if s.exit_rx.borrow().is_none() {
                unsafe { libc::kill(s.pid, libc::SIGKILL) };
            }
            Ok(())
        }
        Some(Entry::Pending(_)) | None => Ok(()),
    }
}
