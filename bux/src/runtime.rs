//! VM lifecycle management: spawn, list, stop, kill, remove.
//!
//! The [`Runtime`] manages VM state in a SQLite database and provides
//! methods to spawn VMs in child processes via `fork(2)` + `krun_start_enter`.
//!
//! # Platform
//!
//! This module is only available on Unix (Linux / macOS).

#![allow(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use std::{fs, io};

use bux_proto::{AGENT_PORT, ExecStart};
use tokio::sync::OnceCell;

use crate::Result;
use crate::client::{Client, ExecEvent, ExecOutput, ExitStatus, InterfaceStats};
use crate::disk::DiskManager;
use crate::state::{self, StateDb, Status, VmState};
use crate::vm::VmBuilder;

/// Path of the guest agent binary inside the container root filesystem.
///
/// Every VM boots this binary as PID 1 — it is libkrun's `exec` target, not
/// the user's command. The user's command is issued afterwards through an
/// [`ExecStart`] request over the vsock connection this same binary serves.
const GUEST_AGENT_PATH: &str = "/sbin/bux-guest";

/// Mount point inside the guest where the `"rootfs"` block device (an
/// OCI-pulled ext4 image, attached via `VmBuilder::disk`) is mounted before
/// any exec runs. Every exec pivots into this directory — see the guest
/// agent's namespace isolation module for the other half of this contract.
const CONTAINER_ROOT: &str = "/mnt/rootfs";

/// Guest device path of the `"rootfs"` block device. `VmBuilder::build`
/// attaches disks in the order they were added, and `bux-cli`'s `run`
/// command always attaches `"rootfs"` first — before the optional `"vdb"`
/// data disk — so it is always the first virtio-blk device the guest
/// kernel enumerates.
const ROOTFS_DEVICE: &str = "/dev/vda";

/// Manages the lifecycle of bux micro-VMs.
///
/// State is stored in `{data_dir}/bux.db` (SQLite).
#[derive(Debug)]
pub struct Runtime {
    /// SQLite state database.
    db: Arc<StateDb>,
    /// Directory for Unix sockets (`{data_dir}/socks/`).
    socks_dir: PathBuf,
    /// Disk image manager.
    disk: DiskManager,
}

impl Runtime {
    /// Opens (or creates) the runtime data directory and database.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let base = data_dir.as_ref();
        fs::create_dir_all(base)?;

        let socks_dir = base.join("socks");
        fs::create_dir_all(&socks_dir)?;

        let db_path = base.join("bux.db");
        let db = StateDb::open(db_path)?;
        let disk = DiskManager::open(base)?;

        #[allow(clippy::arc_with_non_send_sync)]
        // StateDb uses rusqlite::Connection (not Sync), but Arc is needed for VmHandle sharing within a single-threaded tokio runtime.
        Ok(Self {
            db: Arc::new(db),
            socks_dir,
            disk,
        })
    }

    /// Returns a reference to the disk image manager.
    pub const fn disk(&self) -> &DiskManager {
        &self.disk
    }

    /// Spawns a VM in a child process and returns a handle.
    ///
    /// # Safety
    ///
    /// Uses `fork(2)`. Must be called before spawning other threads, or
    /// from a single-threaded context.
    pub async fn spawn(
        &self,
        builder: VmBuilder,
        image: Option<String>,
        name: Option<String>,
        auto_remove: bool,
        data_disk_base: Option<&Path>,
    ) -> Result<VmHandle> {
        // Validate name uniqueness via DB index.
        if let Some(ref n) = name
            && self.db.get_by_name(n)?.is_some()
        {
            return Err(crate::Error::Ambiguous(format!(
                "a VM named '{n}' already exists"
            )));
        }

        let id = state::gen_id();
        let socket = self.socks_dir.join(format!("{id}.sock"));

        // Extract config before consuming the builder.
        let mut config = builder.to_config();
        config.auto_remove = auto_remove;

        // The VM's PID 1 is always the guest agent; the caller's exec, if
        // any, is ignored here and instead issued as an RPC once the agent
        // is reachable. Add a vsock port so the agent is reachable via the
        // host-side Unix socket libkrun maps it to.
        let socket_str = socket.to_string_lossy().into_owned();
        let mut configured = builder
            .exec(GUEST_AGENT_PATH, &[])
            .vsock_port(AGENT_PORT, &socket_str, true);

        // Optional data disk: a per-VM QCOW2 overlay backed by a shared,
        // digest-keyed base image. Each VM writes into its own overlay —
        // the base is never opened for writing, so it can be shared safely
        // across concurrently running VMs.
        if let Some(base) = data_disk_base {
            let overlay = self.disk.create_overlay(base, &id)?;
            configured = configured.disk(
                "vdb",
                overlay.to_string_lossy().into_owned(),
                crate::sys::DiskFormat::Qcow2,
                false,
            );
        }

        // Fork: child becomes the VM, parent manages state.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(io::Error::last_os_error().into()),
            0 => {
                // Child — build and start the VM (never returns on success).
                match configured.build().and_then(super::vm::Vm::start) {
                    Ok(()) => unreachable!(),
                    #[allow(clippy::print_stderr)] // Only way to report errors in forked child.
                    Err(e) => {
                        eprintln!("[bux] child VM start failed: {e}");
                        unsafe { libc::_exit(1) }
                    }
                }
            }
            child_pid => {
                let vm_state = VmState {
                    id,
                    name,
                    pid: child_pid,
                    image,
                    socket,
                    status: Status::Creating,
                    config,
                    created_at: SystemTime::now(),
                };
                self.db.insert(&vm_state)?;

                let mut handle = VmHandle::new(vm_state, Arc::clone(&self.db), self.disk.clone());

                // Best-effort readiness wait; flip to Running once the guest
                // agent answers, otherwise leave it Creating for `bux ps` to
                // surface as still booting.
                if handle.wait_ready(Duration::from_secs(5)).await.is_ok() {
                    // Mount procfs/sysfs/devpts before anything else touches
                    // the rootfs. Best-effort: a VM that boots but can't run
                    // this is still worth surfacing as Running so `bux ps`
                    // and `bux logs` remain usable.
                    if let Err(e) = handle.standard_setup().await {
                        eprintln!("[bux] standard setup failed for {}: {e}", handle.state.id);
                    }
                    // cpu.max quota derived from vcpus at the standard 100ms CFS
                    // period: cpus=2 → "200000 100000", i.e. full use of 2 cores.
                    let cpu_period_us = 100_000u64;
                    let cpu_quota_us = u64::from(handle.state.config.vcpus) * cpu_period_us;
                    let mem_max = u64::from(handle.state.config.ram_mib) * 1024 * 1024;
                    if let Err(e) = handle
                        .apply_cgroup_limits(
                            Some(mem_max),
                            Some(cpu_quota_us),
                            Some(cpu_period_us),
                            None,
                        )
                        .await
                    {
                        eprintln!("[bux] cgroup setup failed for {}: {e}", handle.state.id);
                    }
                    if handle.state.config.rootfs_is_block_device
                        && let Err(e) = handle
                            .mount(ROOTFS_DEVICE, CONTAINER_ROOT, "ext4", 0, None)
                            .await
                    {
                        eprintln!("[bux] rootfs mount failed for {}: {e}", handle.state.id);
                    }
                    handle.state.status = Status::Running;
                    self.db.update_status(&handle.state.id, Status::Running)?;
                }

                Ok(handle)
            }
        }
    }

    /// Lists all known VMs, reconciling liveness and auto-removing stopped VMs.
    pub fn list(&self) -> Result<Vec<VmState>> {
        let vms = self.db.list()?;
        let mut keep = Vec::with_capacity(vms.len());

        for mut vm in vms {
            // Reconcile: mark dead processes as stopped.
            if vm.status == Status::Running && !is_pid_alive(vm.pid) {
                vm.status = Status::Stopped;
                let _ = self.db.update_status(&vm.id, Status::Stopped);
            }

            // Auto-remove stopped VMs with auto_remove flag.
            if vm.status == Status::Stopped && vm.config.auto_remove {
                let _ = fs::remove_file(&vm.socket);
                let _ = self.db.delete(&vm.id);
                continue;
            }

            keep.push(vm);
        }
        Ok(keep)
    }

    /// Retrieves a handle by name or ID prefix.
    pub fn get(&self, id_or_name: &str) -> Result<VmHandle> {
        // Try name lookup first (O(1) via UNIQUE index).
        let mut state = if let Some(s) = self.db.get_by_name(id_or_name)? {
            s
        } else {
            self.db.get_by_id_prefix(id_or_name)?
        };

        // Reconcile liveness.
        if state.status == Status::Running && !is_pid_alive(state.pid) {
            state.status = Status::Stopped;
            let _ = self.db.update_status(&state.id, Status::Stopped);
        }

        Ok(VmHandle::new(
            state,
            Arc::clone(&self.db),
            self.disk.clone(),
        ))
    }

    /// Renames a VM.
    pub fn rename(&self, id_or_name: &str, new_name: &str) -> Result<()> {
        let handle = self.get(id_or_name)?;
        if let Some(existing) = self.db.get_by_name(new_name)?
            && existing.id != handle.state().id
        {
            return Err(crate::Error::Ambiguous(format!(
                "a VM named '{new_name}' already exists"
            )));
        }
        self.db.update_name(&handle.state().id, Some(new_name))?;
        Ok(())
    }

    /// Removes a stopped VM's state and socket.
    pub fn remove(&self, id_or_name: &str) -> Result<()> {
        let handle = self.get(id_or_name)?;
        let state = handle.state();

        if state.status == Status::Running && is_pid_alive(state.pid) {
            return Err(crate::Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("VM {} is still running; stop it first", state.id),
            )));
        }

        let _ = fs::remove_file(&state.socket);
        let _ = self.disk.remove_vm_disk(&state.id);
        self.db.delete(&state.id)?;
        Ok(())
    }
}

/// Handle to a single managed VM with lazy persistent connection.
#[derive(Debug)]
pub struct VmHandle {
    /// Cached state snapshot.
    state: VmState,
    /// Shared database reference for status updates.
    db: Arc<StateDb>,
    /// Disk image manager for auto-remove cleanup.
    disk: DiskManager,
    /// Lazy persistent client connection.
    client: OnceCell<Client>,
}

impl VmHandle {
    /// Creates a new handle from a state snapshot, shared database, and disk manager.
    fn new(state: VmState, db: Arc<StateDb>, disk: DiskManager) -> Self {
        Self {
            state,
            db,
            disk,
            client: OnceCell::new(),
        }
    }

    /// Returns the current state snapshot.
    pub const fn state(&self) -> &VmState {
        &self.state
    }

    /// Lazily connects to the guest agent (reuses across calls).
    async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                Client::connect(&self.state.socket)
                    .await
                    .map_err(crate::Error::from)
            })
            .await
    }

    /// Executes a command, streaming output via callback. Returns exit code.
    pub async fn exec_stream(&self, req: ExecStart, on: impl FnMut(ExecEvent)) -> Result<i32> {
        Ok(self.client().await?.exec_stream(req, on).await?)
    }

    /// Executes a command and collects all output.
    pub async fn exec(&self, req: ExecStart) -> Result<ExecOutput> {
        Ok(self.client().await?.exec(req).await?)
    }

    /// Registers a process without starting it. Returns a stable id usable
    /// from any later call, independent of this call's connection.
    pub async fn create_process(&self, spec: ExecStart) -> Result<String> {
        Ok(self.client().await?.create_process(spec).await?)
    }

    /// Starts a previously created process. Returns its guest pid.
    pub async fn start_process(&self, id: &str) -> Result<i32> {
        Ok(self.client().await?.start_process(id).await?)
    }

    /// Attaches to a started process's stdio, streaming output via callback
    /// until the connection closes or the process exits.
    pub async fn attach_stdio(
        &self,
        id: &str,
        stdin_data: Option<&[u8]>,
        on: impl FnMut(ExecEvent),
    ) -> Result<()> {
        Ok(self.client().await?.attach_stdio(id, stdin_data, on).await?)
    }

    /// Delivers a signal to a started process.
    pub async fn signal_process(&self, id: &str, signal: i32) -> Result<()> {
        Ok(self.client().await?.signal_process(id, signal).await?)
    }

    /// Resizes a started terminal process's window.
    pub async fn resize_process(&self, id: &str, tty: bux_proto::TtyConfig) -> Result<()> {
        Ok(self.client().await?.resize_process(id, tty).await?)
    }

    /// Closes a started process's stdin (sends EOF to the child).
    pub async fn close_process_stdin(&self, id: &str) -> Result<()> {
        Ok(self.client().await?.close_process_stdin(id).await?)
    }

    /// Blocks until a process exits, bounded by `timeout_ms` (`0` = wait
    /// indefinitely).
    pub async fn wait_process(&self, id: &str, timeout_ms: u64) -> Result<ExitStatus> {
        Ok(self.client().await?.wait_process(id, timeout_ms).await?)
    }

    /// Releases a process's guest-side resources, force-killing it first if
    /// still running.
    pub async fn delete_process(&self, id: &str) -> Result<()> {
        Ok(self.client().await?.delete_process(id).await?)
    }

    /// Graceful shutdown with default 10 s timeout.
    pub async fn stop(&mut self) -> Result<()> {
        self.stop_timeout(Duration::from_secs(10)).await
    }

    /// Graceful shutdown: sends `Shutdown` request, waits up to `timeout`,
    /// then falls back to `SIGKILL`.
    pub async fn stop_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Ok(c) = self.client().await {
            let _ = c.shutdown().await;
        }

        let result = tokio::time::timeout(timeout, async {
            while is_pid_alive(self.state.pid) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        if result.is_ok() {
            return self.mark_stopped();
        }
        self.kill()
    }

    /// Sends `SIGKILL` to the VM process.
    pub fn kill(&mut self) -> Result<()> {
        unsafe {
            libc::kill(self.state.pid, libc::SIGKILL);
        }
        self.mark_stopped()
    }

    /// Returns `true` if the VM process is still alive.
    pub fn is_alive(&self) -> bool {
        is_pid_alive(self.state.pid)
    }

    /// Sends a POSIX signal to the VM process.
    pub fn signal(&self, sig: i32) -> Result<()> {
        let ret = unsafe { libc::kill(self.state.pid, sig) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error().into())
        }
    }

    /// Pauses the VM: `started → pausing → paused`.
    ///
    /// libkrun has no vCPU-pause primitive of its own, so this stops the
    /// whole VM process with `SIGSTOP` — the same coarse-grained mechanism
    /// Linux container runtimes use for `pause`, and correct here since each
    /// VM hosts exactly one container. The guest's virtual time and every
    /// in-flight syscall freeze along with it; `resume()` undoes this with
    /// `SIGCONT`.
    pub async fn pause(&mut self) -> Result<()> {
        if self.state.status != Status::Running {
            return Err(invalid_transition(self.state.status, "pause"));
        }
        self.set_status(Status::Pausing)?;
        self.signal(libc::SIGSTOP)?;
        self.set_status(Status::Paused)?;
        Ok(())
    }

    /// Resumes a paused VM: `paused → resuming → started`.
    pub async fn resume(&mut self) -> Result<()> {
        if self.state.status != Status::Paused {
            return Err(invalid_transition(self.state.status, "resume"));
        }
        self.set_status(Status::Resuming)?;
        self.signal(libc::SIGCONT)?;
        self.set_status(Status::Running)?;
        Ok(())
    }

    /// Updates both the cached snapshot and the persisted status.
    fn set_status(&mut self, status: Status) -> Result<()> {
        self.state.status = status;
        self.db.update_status(&self.state.id, status)
    }

    /// Waits for the VM process to exit. Returns the exit status.
    pub async fn wait(&mut self) -> Result<()> {
        while is_pid_alive(self.state.pid) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.mark_stopped()
    }

    /// Executes a command with stdin data piped to the process.
    pub async fn exec_with_stdin(
        &self,
        req: ExecStart,
        stdin_data: &[u8],
        on: impl FnMut(ExecEvent),
    ) -> Result<i32> {
        Ok(self
            .client()
            .await?
            .exec_with_stdin(req, stdin_data, on)
            .await?)
    }

    /// Reads a file from the guest filesystem.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        Ok(self.client().await?.read_file(path).await?)
    }

    /// Writes a file to the guest filesystem.
    pub async fn write_file(&self, path: &str, data: &[u8], mode: u32) -> Result<()> {
        Ok(self.client().await?.write_file(path, data, mode).await?)
    }

    /// Copies a tar archive into the guest, unpacking at `dest`.
    pub async fn copy_in(&self, dest: &str, tar_data: &[u8]) -> Result<()> {
        Ok(self.client().await?.copy_in(dest, tar_data).await?)
    }

    /// Copies a path from the guest as a tar archive.
    pub async fn copy_out(&self, path: &str) -> Result<Vec<u8>> {
        Ok(self.client().await?.copy_out(path).await?)
    }

    /// Performs a version handshake with the guest agent.
    pub async fn handshake(&self) -> Result<()> {
        Ok(self.client().await?.handshake().await?)
    }

    /// Mounts procfs, sysfs, and devpts inside the guest. Idempotent.
    pub async fn standard_setup(&self) -> Result<()> {
        Ok(self.client().await?.standard_setup().await?)
    }

    /// Mounts a filesystem inside the guest.
    pub async fn mount(
        &self,
        source: &str,
        target: &str,
        fstype: &str,
        flags: u64,
        data: Option<&str>,
    ) -> Result<()> {
        Ok(self
            .client()
            .await?
            .mount(source, target, fstype, flags, data)
            .await?)
    }

    /// Unmounts a filesystem inside the guest.
    pub async fn umount(&self, path: &str, flags: i32) -> Result<()> {
        Ok(self.client().await?.umount(path, flags).await?)
    }

    /// Creates the container's cgroup and applies resource limits inside the guest.
    pub async fn apply_cgroup_limits(
        &self,
        mem_max: Option<u64>,
        cpu_quota_us: Option<u64>,
        cpu_period_us: Option<u64>,
        pids_max: Option<u32>,
    ) -> Result<()> {
        Ok(self
            .client()
            .await?
            .apply_cgroup_limits(mem_max, cpu_quota_us, cpu_period_us, pids_max)
            .await?)
    }

    /// Creates a directory inside the guest.
    pub async fn mkdir(&self, path: &str, all: bool, mode: u32) -> Result<()> {
        Ok(self.client().await?.mkdir(path, all, mode).await?)
    }

    /// Brings a network interface up inside the guest, optionally setting its MTU.
    pub async fn link_up(&self, name: &str, mtu: Option<u32>) -> Result<()> {
        Ok(self.client().await?.link_up(name, mtu).await?)
    }

    /// Brings a network interface down inside the guest.
    pub async fn link_down(&self, name: &str) -> Result<()> {
        Ok(self.client().await?.link_down(name).await?)
    }

    /// Adds an address (CIDR notation) to a guest network interface.
    pub async fn address_add(&self, name: &str, cidr: &str) -> Result<()> {
        Ok(self.client().await?.address_add(name, cidr).await?)
    }

    /// Adds a default route inside the guest.
    pub async fn route_add_default(&self, via: &str) -> Result<()> {
        Ok(self.client().await?.route_add_default(via).await?)
    }

    /// Writes `/etc/resolv.conf` under `root_path` inside the guest.
    pub async fn configure_dns(
        &self,
        nameservers: &[String],
        search: &[String],
        root_path: &str,
    ) -> Result<()> {
        Ok(self
            .client()
            .await?
            .configure_dns(nameservers, search, root_path)
            .await?)
    }

    /// Writes `/etc/hosts` under `root_path` inside the guest.
    pub async fn configure_hosts(&self, entries: &[(String, String)], root_path: &str) -> Result<()> {
        Ok(self
            .client()
            .await?
            .configure_hosts(entries, root_path)
            .await?)
    }

    /// Reports traffic counters for a guest network interface.
    pub async fn interface_statistics(&self, name: &str) -> Result<InterfaceStats> {
        Ok(self.client().await?.interface_statistics(name).await?)
    }

    /// Waits for the guest agent to become reachable via a single
    /// connect + handshake probe per attempt.
    async fn wait_ready(&self, timeout: Duration) -> io::Result<()> {
        tokio::time::timeout(timeout, async {
            loop {
                if let Ok(c) = Client::connect(&self.state.socket).await {
                    if c.handshake().await.is_ok() {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "guest agent did not become ready"))
    }

    /// Updates status to Stopped and persists. If `auto_remove` is set,
    /// deletes the VM record, socket, and disk image.
    fn mark_stopped(&mut self) -> Result<()> {
        self.state.status = Status::Stopped;

        if self.state.config.auto_remove {
            let _ = fs::remove_file(&self.state.socket);
            let _ = self.disk.remove_vm_disk(&self.state.id);
            self.db.delete(&self.state.id)?;
        } else {
            self.db.update_status(&self.state.id, Status::Stopped)?;
        }
        Ok(())
    }
}

/// Checks if a process is alive via `kill(pid, 0)`.
fn is_pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Builds the `InvalidInput` error for an illegal lifecycle transition.
fn invalid_transition(from: Status, op: &str) -> crate::Error {
    crate::Error::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("cannot {op} a VM in state {from:?}"),
    ))
}
