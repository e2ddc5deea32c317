//! PTY-based process spawning and window resize.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};

use bux_proto::{ExecStart, TtyConfig};
use nix::pty::{OpenptyResult, Winsize, openpty};
use nix::unistd::dup;

use super::isolate;

/// Handle to a process spawned with a PTY.
pub struct PtyHandle {
    /// Real PID of the exec'd process, as seen from the agent's own PID
    /// namespace.
    pub pid: i32,
    /// The agent's actual child; `waitpid` this one to collect the exit
    /// status the reaper mirrors from the isolated process.
    pub reaper: nix::unistd::Pid,
    /// Async reader for the PTY master (child's stdout+stderr merged).
    pub master_read: tokio::fs::File,
    /// Async writer for the PTY master (child's stdin).
    pub master_write: tokio::fs::File,
    /// Raw fd of the PTY master, kept alive for `TIOCSWINSZ`.
    master_fd: OwnedFd,
}

impl PtyHandle {
    /// Resize the PTY window via `TIOCSWINSZ` ioctl.
    pub fn resize(&self, config: &TtyConfig) {
        let winsize = Winsize {
            ws_row: config.rows,
            ws_col: config.cols,
            ws_xpixel: config.x_pixels,
            ws_ypixel: config.y_pixels,
        };
        unsafe {
            libc::ioctl(
                self.master_fd.as_raw_fd(),
                libc::TIOCSWINSZ,
                std::ptr::from_ref(&winsize),
            );
        }
    }
}

/// Spawns an isolated process with a PTY.
///
/// The grandchild gets a new session (`setsid`) and the PTY slave becomes
/// its controlling terminal (`TIOCSCTTY`) before the namespace pivot. In PTY
/// mode, stdout and stderr are merged into a single stream through the PTY
/// master.
pub fn spawn(req: &ExecStart) -> io::Result<PtyHandle> {
    let Some(tty) = req.tty.as_ref() else {
        return Err(io::Error::other("tty config required for PTY spawn"));
    };

    let target = super::build_target(req)?;

    let winsize = Winsize {
        ws_row: tty.rows,
        ws_col: tty.cols,
        ws_xpixel: tty.x_pixels,
        ws_ypixel: tty.y_pixels,
    };

    let OpenptyResult { master, slave } =
        openpty(Some(&winsize), None).map_err(|e| io::Error::other(format!("openpty: {e}")))?;

    let wire_stdio = move || -> io::Result<()> {
        let slave_fd = slave.as_raw_fd();
        super::dup2_onto(&slave, libc::STDIN_FILENO)?;
        super::dup2_onto(&slave, libc::STDOUT_FILENO)?;
        super::dup2_onto(&slave, libc::STDERR_FILENO)?;
        nix::unistd::setsid().map_err(|e| io::Error::other(format!("setsid: {e}")))?;
        if unsafe { libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    };

    let child = isolate::spawn_isolated(target, wire_stdio)?;

    // Create separate read/write handles from the master fd. The parent's
    // own copy of `slave` was dropped inside `spawn_isolated` once the
    // wire_stdio closure went out of scope on the fork's parent branch.
    let read_fd = dup_fd(&master, "master_read")?;
    let write_fd = dup_fd(&master, "master_write")?;

    let master_read =
        tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(read_fd.into_raw_fd()) });
    let master_write =
        tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(write_fd.into_raw_fd()) });

    Ok(PtyHandle {
        pid: child.pid,
        reaper: child.reaper,
        master_read,
        master_write,
        master_fd: master,
    })
}

/// Duplicates an `OwnedFd` with a descriptive error context.
fn dup_fd(fd: &OwnedFd, label: &str) -> io::Result<OwnedFd> {
    dup(fd).map_err(|e| io::Error::other(format!("dup {label}: {e}")))
}
