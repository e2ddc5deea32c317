//! Host-issued setup operations: mounts, directories, network, DNS/hosts.
//!
//! Network configuration shells out to `ip(8)` rather than speaking netlink
//! directly — the guest rootfs already carries busybox/iproute2, and this
//! keeps the agent free of a netlink dependency for what is, per container,
//! a handful of one-shot calls.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use bux_proto::{ErrorCode, ErrorInfo, SetupOp, SetupResp};
use tokio::io::AsyncWrite;
use tokio::process::Command;

use crate::cgroup::{self, Resources};
use crate::mounts;

/// Runs one [`SetupOp`] and sends back the single [`SetupResp`] reply.
pub async fn handle(w: &mut (impl AsyncWrite + Unpin), op: SetupOp) -> std::io::Result<()> {
    let resp = execute(op).await;
    bux_proto::send(w, &resp).await?;
    tokio::io::AsyncWriteExt::flush(w).await
}

async fn execute(op: SetupOp) -> SetupResp {
    match op {
        SetupOp::StandardSetup => standard_setup(),
        SetupOp::Mount {
            source,
            target,
            fstype,
            flags,
            data,
        } => mount(&source, &target, &fstype, flags, data.as_deref()),
        SetupOp::Umount { path, flags } => umount(&path, flags),
        SetupOp::Mkdir { path, all, mode } => mkdir(&path, all, mode),
        SetupOp::LinkUp { name, mtu } => link_up(&name, mtu).await,
        SetupOp::LinkDown { name } => ip_ok(&["link", "set", &name, "down"]).await,
        SetupOp::AddressAdd { name, cidr } => ip_ok(&["addr", "add", &cidr, "dev", &name]).await,
        SetupOp::RouteAddDefault { via } => {
            ip_ok(&["route", "add", "default", "via", &via]).await
        }
        SetupOp::ConfigureDns {
            nameservers,
            search,
            root_path,
        } => configure_dns(&nameservers, &search, &root_path),
        SetupOp::ConfigureHosts { entries, root_path } => configure_hosts(&entries, &root_path),
        SetupOp::InterfaceStatistics { name } => interface_statistics(&name),
        SetupOp::CgroupLimits {
            mem_max,
            cpu_quota_us,
            cpu_period_us,
            pids_max,
        } => cgroup_limits(mem_max, cpu_quota_us, cpu_period_us, pids_max),
    }
}

fn cgroup_limits(
    mem_max: Option<u64>,
    cpu_quota_us: Option<u64>,
    cpu_period_us: Option<u64>,
    pids_max: Option<u32>,
) -> SetupResp {
    let resources = Resources {
        mem_max,
        cpu_quota_us,
        cpu_period_us,
        pids_max,
    };
    match cgroup::setup_container(&resources) {
        Ok(()) => SetupResp::Ok,
        Err(e) => io_error(e),
    }
}

/// Mounts procfs, sysfs, and devpts if not already present. Idempotent.
fn standard_setup() -> SetupResp {
    let targets: &[(&str, &str, &str)] = &[
        ("proc", "/proc", "proc"),
        ("sysfs", "/sys", "sysfs"),
        ("devpts", "/dev/pts", "devpts"),
    ];
    for (fstype, target, mount_fstype) in targets {
        if mounts::is_mounted(target, mount_fstype) {
            continue;
        }
        if let Err(e) = fs::create_dir_all(target) {
            return io_error(e);
        }
        if let SetupResp::Error(e) = mount(fstype, target, fstype, 0, None) {
            return SetupResp::Error(e);
        }
    }
    SetupResp::Ok
}

fn mount(source: &str, target: &str, fstype: &str, flags: u64, data: Option<&str>) -> SetupResp {
    if let Some(parent) = Path::new(target).parent()
        && let Err(e) = fs::create_dir_all(parent)
    {
        return io_error(e);
    }
    let _ = fs::create_dir_all(target);

    let Ok(c_source) = std::ffi::CString::new(source) else {
        return invalid("source contains a NUL byte");
    };
    let Ok(c_target) = std::ffi::CString::new(target) else {
        return invalid("target contains a NUL byte");
    };
    let Ok(c_fstype) = std::ffi::CString::new(fstype) else {
        return invalid("fstype contains a NUL byte");
    };
    let c_data = data.map(std::ffi::CString::new).transpose();
    let Ok(c_data) = c_data else {
        return invalid("data contains a NUL byte");
    };

    let ret = unsafe {
        libc::mount(
            c_source.as_ptr(),
            c_target.as_ptr(),
            c_fstype.as_ptr(),
            flags as libc::c_ulong,
            c_data.as_ref().map_or(std::ptr::null(), |d| d.as_ptr().cast()),
        )
    };
    if ret == 0 {
        SetupResp::Ok
    } else {
        io_error(std::io::Error::last_os_error())
    }
}

fn umount(path: &str, flags: i32) -> SetupResp {
    let Ok(c_path) = std::ffi::CString::new(path) else {
        return invalid("path contains a NUL byte");
    };
    let ret = unsafe { libc::umount2(c_path.as_ptr(), flags) };
    if ret == 0 {
        SetupResp::Ok
    } else {
        io_error(std::io::Error::last_os_error())
    }
}

fn mkdir(path: &str, all: bool, mode: u32) -> SetupResp {
    let result = if all {
        fs::create_dir_all(path)
    } else {
        fs::create_dir(path)
    };
    if let Err(e) = result {
        return io_error(e);
    }
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        return io_error(e);
    }
    SetupResp::Ok
}

async fn link_up(name: &str, mtu: Option<u32>) -> SetupResp {
    if let Some(mtu) = mtu {
        let resp = ip_ok(&["link", "set", name, "mtu", &mtu.to_string()]).await;
        if matches!(resp, SetupResp::Error(_)) {
            return resp;
        }
    }
    ip_ok(&["link", "set", name, "up"]).await
}

/// Runs `ip <args>` and maps a non-zero exit to an error.
async fn ip_ok(args: &[&str]) -> SetupResp {
    match Command::new("ip").args(args).output().await {
        Ok(out) if out.status.success() => SetupResp::Ok,
        Ok(out) => SetupResp::Error(ErrorInfo::new(
            ErrorCode::Internal,
            format!(
                "ip {args:?} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        )),
        Err(e) => io_error(e),
    }
}

fn configure_dns(nameservers: &[String], search: &[String], root_path: &str) -> SetupResp {
    let mut contents = String::new();
    for ns in nameservers {
        contents.push_str("nameserver ");
        contents.push_str(ns);
        contents.push('\n');
    }
    if !search.is_empty() {
        contents.push_str("search ");
        contents.push_str(&search.join(" "));
        contents.push('\n');
    }
    write_rooted(root_path, "etc/resolv.conf", &contents)
}

fn configure_hosts(entries: &[(String, String)], root_path: &str) -> SetupResp {
    let mut contents = String::from("127.0.0.1\tlocalhost\n::1\tlocalhost\n");
    for (ip, host) in entries {
        contents.push_str(ip);
        contents.push('\t');
        contents.push_str(host);
        contents.push('\n');
    }
    write_rooted(root_path, "etc/hosts", &contents)
}

fn write_rooted(root_path: &str, rel_path: &str, contents: &str) -> SetupResp {
    let path = Path::new(root_path).join(rel_path);
    if let Some(parent) = path.parent()
        && let Err(e) = fs::create_dir_all(parent)
    {
        return io_error(e);
    }
    match fs::write(&path, contents) {
        Ok(()) => SetupResp::Ok,
        Err(e) => io_error(e),
    }
}

fn interface_statistics(name: &str) -> SetupResp {
    let base = format!("/sys/class/net/{name}/statistics");
    let read = |file: &str| -> Option<u64> {
        fs::read_to_string(format!("{base}/{file}"))
            .ok()?
            .trim()
            .parse()
            .ok()
    };
    match (
        read("rx_bytes"),
        read("tx_bytes"),
        read("rx_packets"),
        read("tx_packets"),
    ) {
        (Some(rx_bytes), Some(tx_bytes), Some(rx_packets), Some(tx_packets)) => {
            SetupResp::Statistics {
                rx_bytes,
                tx_bytes,
                rx_packets,
                tx_packets,
            }
        }
        _ => SetupResp::Error(ErrorInfo::unsupported(format!(
            "no statistics for interface {name}"
        ))),
    }
}

fn io_error(e: std::io::Error) -> SetupResp {
    let code = match e.kind() {
        std::io::ErrorKind::NotFound => ErrorCode::NotFound,
        std::io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
        _ => ErrorCode::Internal,
    };
    SetupResp::Error(ErrorInfo::new(code, e.to_string()))
}

fn invalid(message: &str) -> SetupResp {
    SetupResp::Error(ErrorInfo::new(ErrorCode::InvalidRequest, message))
}
