//! Raw FFI bindings to `libkrun`.
//!
//! This crate exposes the subset of the `krun_*` C ABI that the container
//! lifecycle core needs to boot a per-container micro-VM: vCPU/RAM
//! configuration, kernel + initramfs boot, block/virtiofs mounts, vsock port
//! forwarding, and process takeover via `krun_start_enter`.
//!
//! Every function here is a direct `extern "C"` declaration — no safety
//! invariants are enforced at this layer. The `bux` crate's `sys` module is
//! the only caller and confines all `unsafe` blocks to itself; see its
//! module documentation.
//!
//! libkrun's device surface (GPU, audio, display, input, confidential
//! computing backends) is intentionally not bound here: the hypervisor
//! abstraction is out of scope for this workspace beyond the VM capability
//! it must present to the container lifecycle (create/start/stop/pause/
//! resume, vsock transport, block + share mounts).

#![allow(non_camel_case_types)]

use std::ffi::c_char;

/// Root filesystem / disk image format passed to [`krun_add_disk2`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DiskFormat {
    /// Raw block image (used for the ext4 images this workspace builds).
    Raw = 0,
    /// QCOW2 image.
    Qcow2 = 1,
}

/// Kernel image format passed to [`krun_set_kernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum KernelFormat {
    /// Raw/uncompressed Linux kernel image.
    Raw = 0,
    /// ELF kernel image.
    Elf = 1,
    /// PE/EFI kernel image.
    Pe = 2,
}

/// Build-time feature flags queryable via [`krun_check_feature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Feature {
    /// virtio-net device support.
    Net = 1 << 0,
    /// virtio-blk device support.
    Blk = 1 << 1,
    /// virtio-gpu device support.
    Gpu = 1 << 2,
    /// virtio-snd device support.
    Snd = 1 << 3,
    /// virtio-input device support.
    Input = 1 << 4,
    /// EFI firmware boot support.
    Efi = 1 << 5,
    /// Trusted execution environment support.
    Tee = 1 << 6,
    /// AMD SEV confidential-VM support.
    AmdSev = 1 << 7,
    /// Intel TDX confidential-VM support.
    IntelTdx = 1 << 8,
    /// AWS Nitro enclave support.
    AwsNitro = 1 << 9,
    /// Extended virgl resource-map protocol version 2.
    VirglResourceMap2 = 1 << 10,
}

unsafe extern "C" {
    /// Creates a new VM configuration context. Returns a context ID ≥ 0 or a negative errno.
    pub fn krun_create_ctx() -> i32;
    /// Frees a configuration context previously returned by [`krun_create_ctx`].
    pub fn krun_free_ctx(ctx: u32) -> i32;
    /// Sets the process-global log level (not per-context).
    pub fn krun_set_log_level(level: u32) -> i32;
    /// Sets the vCPU count and RAM size (MiB) for a context.
    pub fn krun_set_vm_config(ctx: u32, num_vcpus: u8, ram_mib: u32) -> i32;
    /// Sets a directory as the VM's root filesystem.
    pub fn krun_set_root(ctx: u32, root_path: *const c_char) -> i32;
    /// Sets the initial working directory inside the VM.
    pub fn krun_set_workdir(ctx: u32, workdir_path: *const c_char) -> i32;
    /// Sets the executable, argv, and optional envp for direct-exec boot mode.
    pub fn krun_set_exec(
        ctx: u32,
        exec_path: *const c_char,
        argv: *const *const c_char,
        envp: *const *const c_char,
    ) -> i32;
    /// Sets environment variables without an associated executable.
    pub fn krun_set_env(ctx: u32, envp: *const *const c_char) -> i32;
    /// Adds a virtio-fs shared directory identified by `tag`.
    pub fn krun_add_virtiofs(ctx: u32, tag: *const c_char, path: *const c_char) -> i32;
    /// Adds a block device backed by a disk image of the given format.
    pub fn krun_add_disk2(
        ctx: u32,
        block_id: *const c_char,
        path: *const c_char,
        format: u32,
        read_only: bool,
    ) -> i32;
    /// Sets the kernel image, optional initramfs, and command line for kernel-boot mode.
    pub fn krun_set_kernel(
        ctx: u32,
        kernel_path: *const c_char,
        kernel_format: u32,
        initramfs_path: *const c_char,
        cmdline: *const c_char,
    ) -> i32;
    /// Maps a guest vsock port to a host Unix socket path.
    ///
    /// When `listen` is `true` the guest listens and the host dials in; when
    /// `false` the host listens on the Unix socket and the guest dials out.
    pub fn krun_add_vsock_port2(ctx: u32, port: u32, path: *const c_char, listen: bool) -> i32;
    /// Sets the UID the VM process assumes before starting.
    pub fn krun_setuid(ctx: u32, uid: u32) -> i32;
    /// Sets the GID the VM process assumes before starting.
    pub fn krun_setgid(ctx: u32, gid: u32) -> i32;
    /// Starts the microVM, taking over the current process.
    ///
    /// On success this call never returns; the process is replaced by the VM
    /// monitor and `exit()`s when the guest shuts down.
    pub fn krun_start_enter(ctx: u32) -> i32;
    /// Returns the maximum vCPU count supported by the host hypervisor.
    pub fn krun_get_max_vcpus() -> i32;
    /// Returns `1` if nested virtualization is supported, `0` if not, or a negative errno.
    pub fn krun_check_nested_virt() -> i32;
    /// Enables or disables nested virtualization for a context (macOS only).
    pub fn krun_set_nested_virt(ctx: u32, enabled: bool) -> i32;
    /// Returns a bitmask of [`Feature`] flags the linked `libkrun` build supports.
    pub fn krun_check_feature(feature: u32) -> i32;
}
