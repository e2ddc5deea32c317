//! bux-guest — the guest agent that runs as PID 1 inside a container's
//! micro-VM.
//!
//! Boots the guest filesystem into a usable state, then listens on a vsock
//! port for host-issued operations (exec, file transfer, control, setup).
//! Cgroup v2 resource limits arrive as a [`bux_proto::SetupOp::CgroupLimits`]
//! setup call rather than at boot — this VM's init is libkrun's own, not a
//! kernel this agent could pass a custom command line to.

mod cgroup;
mod control;
mod exec;
mod files;
mod mounts;
mod process;
mod server;
mod setup;

fn main() {
    // PID 1 should never crash the VM on a panic — log and keep serving.
    if let Err(e) = run() {
        eprintln!("[bux-guest] fatal: {e}");
        std::process::exit(1);
    }
}

fn run() -> std::io::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(server::run())
}
