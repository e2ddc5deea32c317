//! Per-exec namespace isolation: PID/mount/UTS/cgroup unshare plus a
//! `pivot_root` into the container's mounted rootfs.
//!
//! Every exec connection — not just the container's first command — gets
//! its own namespace setup. The guest agent process itself never leaves its
//! original namespaces; only the forked exec target (and a short-lived
//! reaper beneath it) do.
//!
//! A double fork is unavoidable here: `unshare(CLONE_NEWPID)` only changes
//! which namespace *future* children are born into, not the caller's own
//! PID. The first fork (the reaper) unshares and immediately forks again;
//! that second fork's child is PID 1 of the new namespace and is the one
//! that pivots and execs. Two pipes carry the handshake back to the caller:
//! `AckPid` reports the grandchild's real PID once the reaper's second fork
//! returns, and `AckConsole` reports once the grandchild has wired its
//! stdio and is about to pivot and exec.

use std::ffi::CString;
use std::io;
use std::os::fd::OwnedFd;

use nix::sched::{CloneFlags, unshare};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, chdir, execvp, fork, pipe, pivot_root, read, write};

/// Mount point where the container's ext4 rootfs disk is mounted before any
/// exec runs (see `setup::mount`, issued once per VM during boot setup).
pub const CONTAINER_ROOT: &str = "/mnt/rootfs";

/// Namespaces unshared for every exec: a fresh PID tree, mount table, UTS
/// identity, and cgroup view.
const ISOLATE_FLAGS: CloneFlags = CloneFlags::CLONE_NEWPID
    .union(CloneFlags::CLONE_NEWNS)
    .union(CloneFlags::CLONE_NEWUTS)
    .union(CloneFlags::CLONE_NEWCGROUP);

/// The program to run in the isolated grandchild, post-pivot.
pub struct ExecTarget {
    /// Executable path or name (subject to `PATH` search by `execvp`).
    pub program: CString,
    /// `argv`, including `argv[0]`.
    pub argv: Vec<CString>,
    /// `KEY=VALUE` environment entries, applied before `execvp`.
    pub env: Vec<(String, String)>,
    /// Working directory, resolved inside the pivoted rootfs.
    pub cwd: Option<CString>,
    /// UID to switch to before exec (applied after GID).
    pub uid: Option<u32>,
    /// GID to switch to before exec.
    pub gid: Option<u32>,
}

/// The two PIDs that matter after [`spawn_isolated`] returns.
#[derive(Debug, Clone, Copy)]
pub struct IsolatedChild {
    /// Real PID of the exec'd process, as seen from the caller's own PID
    /// namespace. Use this for `kill`/signal delivery and for reporting.
    pub pid: i32,
    /// The reaper — the caller's actual direct child. Only this one can be
    /// `waitpid`'d by the caller; it mirrors the exec'd process's exit
    /// status once that process (its own child, one namespace deeper) exits.
    pub reaper: Pid,
}

/// Forks twice, isolates the innermost process into its own namespaces,
/// pivots it into [`CONTAINER_ROOT`], then execs `target`.
///
/// `wire_stdio` runs in the grandchild immediately after the fork, before
/// any namespace or mount change, so it can freely dup fds inherited from
/// the caller (pipe ends or a PTY slave) onto 0/1/2.
///
/// Blocks on both handshake pipes before returning; call from a
/// `spawn_blocking` context.
pub fn spawn_isolated(
    target: ExecTarget,
    wire_stdio: impl FnOnce() -> io::Result<()>,
) -> io::Result<IsolatedChild> {
    let (pid_rd, pid_wr) = pipe().map_err(from_errno)?;
    let (console_rd, console_wr) = pipe().map_err(from_errno)?;

    // SAFETY: the forked reaper and grandchild only call async-signal-safe
    // nix/libc functions before either exec-ing or exiting the process.
    match unsafe { fork() }.map_err(from_errno)? {
        ForkResult::Parent { child: reaper } => {
            drop(pid_wr);
            drop(console_wr);
            let pid = read_i32(&pid_rd)?;
            let _ = read_u8(&console_rd);
            Ok(IsolatedChild { pid, reaper })
        }
        ForkResult::Child => {
            drop(pid_rd);
            drop(console_rd);
            reaper_main(pid_wr, console_wr, target, wire_stdio)
        }
    }
}

/// Runs in the reaper (first fork's child): unshares namespaces, forks
/// again, reports the grandchild's PID over `pid_wr`, then waits for it and
/// exits mirroring its exit status. Never returns.
fn reaper_main(
    pid_wr: OwnedFd,
    console_wr: OwnedFd,
    target: ExecTarget,
    wire_stdio: impl FnOnce() -> io::Result<()>,
) -> ! {
    if let Err(e) = unshare(ISOLATE_FLAGS) {
        let _ = write(&pid_wr, &(-(e as i32)).to_ne_bytes());
        std::process::exit(1);
    }

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            let _ = write(&pid_wr, &child.as_raw().to_ne_bytes());
            drop(pid_wr);
            drop(console_wr);
            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, code)) => std::process::exit(code),
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    // Re-raise so the reaper's own exit status reflects the
                    // signal, the same way a shell reports a killed child.
                    unsafe { libc::raise(sig as i32) };
                    std::process::exit(128 + sig as i32)
                }
                _ => std::process::exit(1),
            }
        }
        Ok(ForkResult::Child) => {
            drop(pid_wr);
            grandchild_main(console_wr, target, wire_stdio)
        }
        Err(_) => std::process::exit(1),
    }
}

/// Runs in the grandchild: wires stdio, pivots into the container rootfs,
/// drops privilege, and execs. Never returns.
fn grandchild_main(
    console_wr: OwnedFd,
    target: ExecTarget,
    wire_stdio: impl FnOnce() -> io::Result<()>,
) -> ! {
    if wire_stdio().is_err() {
        std::process::exit(126);
    }
    let _ = write(&console_wr, &[1u8]);
    drop(console_wr);

    if pivot_into(CONTAINER_ROOT).is_err() {
        std::process::exit(126);
    }

    // GID before UID — setuid would drop the privilege needed to change GID.
    if let Some(gid) = target.gid {
        unsafe {
            if libc::setgid(gid) != 0 {
                std::process::exit(126);
            }
        }
    }
    if let Some(uid) = target.uid {
        unsafe {
            if libc::setuid(uid) != 0 {
                std::process::exit(126);
            }
        }
    }

    for (k, v) in &target.env {
        unsafe { std::env::set_var(k, v) };
    }
    if let Some(ref cwd) = target.cwd {
        let _ = chdir(cwd.as_c_str());
    }

    let _ = execvp(&target.program, &target.argv);
    std::process::exit(127)
}

/// Makes `new_root` the process's filesystem root via the self-pivot trick:
/// bind-mount it onto itself, `pivot_root(".", ".")`, then detach the old
/// root now stacked on top. Re-mounts `/proc` afterward, since the new PID
/// namespace needs its own view rather than the one the old root carried.
fn pivot_into(new_root: &str) -> io::Result<()> {
    mount_raw(None, "/", None, libc::MS_REC | libc::MS_PRIVATE, None)?;
    mount_raw(
        Some(new_root),
        new_root,
        None,
        libc::MS_BIND | libc::MS_REC,
        None,
    )?;
    chdir(new_root).map_err(from_errno)?;
    pivot_root(".", ".").map_err(from_errno)?;
    umount_raw(".")?;
    chdir("/").map_err(from_errno)?;
    let _ = std::fs::create_dir_all("/proc");
    mount_raw(Some("proc"), "/proc", Some("proc"), 0, None)?;
    Ok(())
}

fn mount_raw(
    source: Option<&str>,
    target: &str,
    fstype: Option<&str>,
    flags: libc::c_ulong,
    data: Option<&str>,
) -> io::Result<()> {
    let c_source = source.map(CString::new).transpose().map_err(invalid_arg)?;
    let c_target = CString::new(target).map_err(invalid_arg)?;
    let c_fstype = fstype.map(CString::new).transpose().map_err(invalid_arg)?;
    let c_data = data.map(CString::new).transpose().map_err(invalid_arg)?;

    let ret = unsafe {
        libc::mount(
            c_source.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            c_target.as_ptr(),
            c_fstype.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            flags,
            c_data
                .as_ref()
                .map_or(std::ptr::null(), |s| s.as_ptr().cast()),
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn umount_raw(path: &str) -> io::Result<()> {
    let c_path = CString::new(path).map_err(invalid_arg)?;
    let ret = unsafe { libc::umount2(c_path.as_ptr(), libc::MNT_DETACH) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn invalid_arg(e: std::ffi::NulError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e)
}

fn from_errno(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn read_i32(fd: &OwnedFd) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    read_exact(fd, &mut buf)?;
    let value = i32::from_ne_bytes(buf);
    if value < 0 {
        Err(io::Error::from_raw_os_error(-value))
    } else {
        Ok(value)
    }
}

fn read_u8(fd: &OwnedFd) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    read_exact(fd, &mut buf)?;
    Ok(buf[0])
}

fn read_exact(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match read(fd, &mut buf[done..]) {
            Ok(0) => return Err(io::Error::other("exec isolation pipe closed before ack")),
            Ok(n) => done += n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(from_errno(e)),
        }
    }
    Ok(())
}
