//! `bux run` — create and run a command in a new micro-VM.
//!
//! Follows the Docker CLI convention: `bux run [OPTIONS] IMAGE [COMMAND] [ARG...]`

use anyhow::{Context, Result};
use bux::{ExecStart, LogLevel, Vm};

/// Arguments for `bux run`.
///
/// Usage: `bux run [OPTIONS] IMAGE [COMMAND] [ARG...]`
#[derive(clap::Args)]
#[command(trailing_var_arg = true)]
pub struct RunArgs {
    /// OCI image reference (e.g., ubuntu:latest). Conflicts with --root.
    #[arg(conflicts_with = "root", required_unless_present = "root")]
    image: Option<String>,

    /// Explicit root filesystem directory path.
    #[arg(long, conflicts_with = "image")]
    root: Option<String>,

    /// Attach an additional ext4 data disk, built from the resolved rootfs
    /// via a shared base image and a per-VM QCOW2 overlay.
    #[arg(long)]
    disk: bool,

    /// Assign a name to the VM.
    #[arg(long)]
    name: Option<String>,

    /// Run in background and print VM ID.
    #[arg(short = 'd', long)]
    detach: bool,

    /// Automatically remove the VM when it stops.
    #[arg(long)]
    rm: bool,

    /// Number of virtual CPUs.
    #[arg(long, default_value_t = 1)]
    cpus: u8,

    /// Memory in MiB.
    #[arg(long, short = 'm', default_value_t = 512)]
    memory: u32,

    /// Working directory inside the VM.
    #[arg(short = 'w', long)]
    workdir: Option<String>,

    /// Bind mount a volume (format: hostPath:guestPath[:ro]).
    #[arg(short = 'v', long = "volume")]
    volume: Vec<String>,

    /// Set environment variables.
    #[arg(short = 'e', long = "env")]
    env: Vec<String>,

    /// Read environment variables from a file.
    #[arg(long)]
    env_file: Vec<String>,

    /// User inside the VM (format: uid[:gid]).
    #[arg(short = 'u', long = "user")]
    user: Option<String>,

    /// Allocate a pseudo-TTY.
    #[arg(short = 't', long)]
    tty: bool,

    /// Override the default ENTRYPOINT of the image.
    #[arg(long)]
    entrypoint: Option<String>,

    /// Enable nested virtualization (macOS only).
    #[arg(long)]
    nested_virt: bool,

    /// libkrun log level.
    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    /// Command and arguments to run inside the VM.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl RunArgs {
    pub async fn run(self) -> Result<()> {
        let (rootfs, oci_cfg) = self.resolve_rootfs().await?;
        let rootfs_is_image = std::path::Path::new(&rootfs).is_file();

        let image = self.image.clone();
        let name = self.name;
        let detach = self.detach;
        let auto_remove = self.rm;

        let mut b = Vm::builder()
            .vcpus(self.cpus)
            .ram_mib(self.memory)
            .log_level(self.log_level);

        // `--root <dir>` shares a host directory directly as the guest root
        // via virtiofs. An OCI-pulled rootfs is a pre-built ext4 image
        // instead — attach it as a block device; the guest agent mounts and
        // pivots into it after boot (see `setup::mount`).
        b = if rootfs_is_image {
            b.disk("rootfs", rootfs.as_str(), bux::DiskFormat::Raw, false)
        } else {
            b.root(rootfs.as_str())
        };

        // Optional data disk: a shared ext4 base image built from the rootfs.
        // The per-VM QCOW2 overlay over it is created by `Runtime::spawn`
        // once the VM's id is known, so only the base path is resolved here.
        let data_disk_base = if self.disk {
            Some(create_disk_from_rootfs(&rootfs)?)
        } else {
            None
        };

        // Working directory: CLI flag > OCI config > none.
        let workdir = self
            .workdir
            .clone()
            .or_else(|| oci_cfg.as_ref()?.working_dir.clone())
            .filter(|w| !w.is_empty());
        if let Some(ref wd) = workdir {
            b = b.workdir(wd.as_str());
        }

        // Command: --entrypoint override > CLI args > OCI ENTRYPOINT+CMD.
        // This is not wired to the VM's exec — PID 1 is always the guest
        // agent — but is issued as an RPC once the agent answers.
        let cmd = if let Some(ep) = self.entrypoint {
            let mut parts = vec![ep];
            parts.extend(self.command);
            parts
        } else if self.command.is_empty() {
            oci_cfg.as_ref().map(|c| c.command()).unwrap_or_default()
        } else {
            self.command
        };

        // Environment: OCI defaults + --env-file + CLI -e overrides.
        let mut env_file_vars = Vec::new();
        for path in &self.env_file {
            env_file_vars.extend(crate::vm::read_env_file(path)?);
        }
        let merged_env: Vec<String> = oci_cfg
            .as_ref()
            .and_then(|c| c.env.clone())
            .unwrap_or_default()
            .into_iter()
            .chain(env_file_vars)
            .chain(self.env)
            .collect();
        if !merged_env.is_empty() {
            let refs: Vec<&str> = merged_env.iter().map(String::as_str).collect();
            b = b.env(&refs);
        }

        // Volumes: -v hostPath:guestPath[:ro]  →  auto-generate virtiofs tag.
        for (idx, spec) in self.volume.iter().enumerate() {
            let (host, _guest, _ro) = parse_volume(spec)?;
            let tag = format!("vol{idx}");
            b = b.virtiofs(tag, host);
        }

        // User: --user uid[:gid]
        let user = self.user.as_deref().map(parse_user).transpose()?;
        if let Some((uid, gid)) = user {
            b = b.uid(uid);
            if let Some(g) = gid {
                b = b.gid(g);
            }
        }

        if self.nested_virt {
            b = b.nested_virt(true);
        }

        let exec_req = if cmd.is_empty() {
            None
        } else {
            let (prog, args) = cmd.split_first().expect("checked non-empty above");
            let mut req = ExecStart::new(prog.clone()).args(args.to_vec());
            if !merged_env.is_empty() {
                req = req.env(merged_env);
            }
            if let Some(ref wd) = workdir {
                req = req.cwd(wd.as_str());
            }
            if let Some((uid, gid)) = user {
                req = req.user(uid, gid.unwrap_or(uid));
            }
            if self.tty {
                req = req.tty(24, 80);
            }
            Some(req)
        };

        spawn_vm(b, image, name, detach, auto_remove, data_disk_base, exec_req).await
    }

    /// Resolves rootfs path and optional OCI config.
    async fn resolve_rootfs(&self) -> Result<(String, Option<bux_oci::ImageConfig>)> {
        match (&self.image, &self.root) {
            (Some(img), None) => {
                let oci = bux_oci::Oci::open()?;
                let r = oci.ensure(img, |msg| eprintln!("{msg}")).await?;
                Ok((r.rootfs.to_string_lossy().into_owned(), r.config))
            }
            (None, Some(root)) => Ok((root.clone(), None)),
            _ => unreachable!("clap validation"),
        }
    }
}

/// Parses Docker-style volume spec: `hostPath:guestPath[:ro]`.
fn parse_volume(spec: &str) -> Result<(String, String, bool)> {
    let parts: Vec<&str> = spec.splitn(3, ':').collect();
    match parts.as_slice() {
        [host, guest] => Ok((host.to_string(), guest.to_string(), false)),
        [host, guest, opts] => {
            let ro = opts.split(',').any(|o| o.eq_ignore_ascii_case("ro"));
            Ok((host.to_string(), guest.to_string(), ro))
        }
        _ => anyhow::bail!("invalid volume spec {spec:?}; use hostPath:guestPath[:ro]"),
    }
}

/// Parses `uid[:gid]` user spec.
pub fn parse_user(spec: &str) -> Result<(u32, Option<u32>)> {
    if let Some((u, g)) = spec.split_once(':') {
        let uid = u.parse().context("invalid UID")?;
        let gid = g.parse().context("invalid GID")?;
        Ok((uid, Some(gid)))
    } else {
        let uid = spec.parse().context("invalid UID")?;
        Ok((uid, None))
    }
}

/// Creates (or reuses) a shared ext4 base image from an OCI rootfs directory.
///
/// Returns the base image path. Each VM that uses it gets its own QCOW2
/// overlay, created by `Runtime::spawn` once the VM's id is known.
#[cfg(unix)]
fn create_disk_from_rootfs(rootfs: &str) -> Result<std::path::PathBuf> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let data_dir = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("no platform data directory"))?
        .join("bux");
    let dm = bux::DiskManager::open(&data_dir)?;

    let mut h = DefaultHasher::new();
    rootfs.hash(&mut h);
    let digest = format!("{:016x}", h.finish());

    Ok(dm.create_base(std::path::Path::new(rootfs), &digest)?)
}

#[cfg(not(unix))]
fn create_disk_from_rootfs(_rootfs: &str) -> Result<std::path::PathBuf> {
    anyhow::bail!("Disk image creation requires Linux or macOS")
}

#[cfg(unix)]
async fn spawn_vm(
    builder: bux::VmBuilder,
    image: Option<String>,
    name: Option<String>,
    detach: bool,
    auto_remove: bool,
    data_disk_base: Option<std::path::PathBuf>,
    exec_req: Option<bux::ExecStart>,
) -> Result<()> {
    let rt = crate::vm::open_runtime()?;
    let mut handle = rt
        .spawn(
            builder,
            image,
            name,
            auto_remove,
            data_disk_base.as_deref(),
        )
        .await?;

    let id = &handle.state().id;
    if detach {
        println!("{}", handle.state().name.as_deref().unwrap_or(id));
        if let Some(req) = exec_req {
            run_main_process(&handle, req, false).await?;
        }
        return Ok(());
    }

    eprintln!("{id}");
    if let Some(req) = exec_req {
        let code = run_main_process(&handle, req, true).await?;
        if auto_remove {
            handle.stop().await?;
        }
        if code != 0 {
            std::process::exit(code);
        }
    } else {
        handle.wait().await?;
    }
    Ok(())
}

/// Runs the container's main process through the Process Supervisor model:
/// register it, start it, attach its stdio, then collect its exit status.
/// Registering it independently of the attach connection means the process
/// keeps running (and stays waitable) even if the attach connection drops.
#[cfg(unix)]
async fn run_main_process(
    handle: &bux::VmHandle,
    req: bux::ExecStart,
    relay_output: bool,
) -> Result<i32> {
    use std::io::Write;

    let id = handle.create_process(req).await?;
    handle.start_process(&id).await?;

    handle
        .attach_stdio(&id, None, |event| {
            if !relay_output {
                return;
            }
            match event {
                bux::ExecEvent::Stdout(d) => {
                    let _ = std::io::stdout().write_all(&d);
                }
                bux::ExecEvent::Stderr(d) => {
                    let _ = std::io::stderr().write_all(&d);
                }
                bux::ExecEvent::Started { .. } => {}
            }
        })
        .await?;

    let status = handle.wait_process(&id, 0).await?;
    handle.delete_process(&id).await?;
    Ok(status.code)
}

#[cfg(not(unix))]
#[allow(clippy::unused_async)]
async fn spawn_vm(
    _builder: bux::VmBuilder,
    _image: Option<String>,
    _name: Option<String>,
    _detach: bool,
    _auto_remove: bool,
    _data_disk_base: Option<std::path::PathBuf>,
    _exec_req: Option<bux::ExecStart>,
) -> Result<()> {
    anyhow::bail!("VM execution requires Linux or macOS")
}
