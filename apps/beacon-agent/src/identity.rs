//! Host facts reported to the controller.

use std::path::Path;

use beacon_wire::{BasicIdentity, SystemInfo};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

pub trait IdentitySource: Send + Sync {
    fn basic(&self) -> BasicIdentity;

    fn full(&self) -> SystemInfo;
}

/// Identity read from the running host.
///
/// The cheap, stable facts are gathered once at construction; memory is read
/// again on every [`IdentitySource::full`] call.
#[derive(Debug, Clone)]
pub struct HostIdentity {
    basic: BasicIdentity,
    os_version: String,
    cpu: String,
    logical_cores: u32,
}

impl HostIdentity {
    pub fn detect() -> Self {
        Self::with_fingerprint(None)
    }

    /// Like [`HostIdentity::detect`], but reports `fingerprint` when given.
    pub fn with_fingerprint(fingerprint: Option<String>) -> Self {
        let hostname = hostname();
        let os = std::env::consts::OS.to_string();
        let fingerprint = fingerprint
            .filter(|fp| !fp.trim().is_empty())
            .or_else(machine_id)
            .unwrap_or_else(|| derived_fingerprint(&hostname, &os));
        let basic = BasicIdentity {
            fingerprint,
            hostname,
            os,
            username: username(),
            administrator: is_administrator(),
            language: std::env::var("LANG").unwrap_or_default(),
            started_at: OffsetDateTime::now_utc(),
        };
        Self {
            basic,
            os_version: os_version(),
            cpu: cpu_model(),
            logical_cores: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(0),
        }
    }
}

impl IdentitySource for HostIdentity {
    fn basic(&self) -> BasicIdentity {
        self.basic.clone()
    }

    fn full(&self) -> SystemInfo {
        SystemInfo {
            identity: self.basic(),
            os_version: self.os_version.clone(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu: self.cpu.clone(),
            logical_cores: self.logical_cores,
            memory_mib: memory_mib(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn read_trimmed(path: impl AsRef<Path>) -> Option<String> {
    let value = std::fs::read_to_string(path).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn machine_id() -> Option<String> {
    MACHINE_ID_PATHS.iter().find_map(read_trimmed)
}

fn derived_fingerprint(hostname: &str, os: &str) -> String {
    let digest = Sha256::digest(format!("{hostname}\0{os}").as_bytes());
    format!("{digest:x}")
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .or_else(|| read_trimmed("/etc/hostname"))
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_default()
}

fn username() -> String {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|name| !name.is_empty()))
        .unwrap_or_default()
}

#[cfg(unix)]
fn is_administrator() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_administrator() -> bool {
    false
}

fn os_version() -> String {
    std::fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|release| parse_os_release(&release))
        .unwrap_or_default()
}

fn parse_os_release(release: &str) -> Option<String> {
    let field = |key: &str| {
        release.lines().find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
                .map(|value| value.trim_matches('"').to_string())
        })
    };
    field("PRETTY_NAME").or_else(|| field("VERSION_ID"))
}

fn cpu_model() -> String {
    std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|info| parse_cpu_model(&info))
        .unwrap_or_default()
}

fn parse_cpu_model(cpuinfo: &str) -> Option<String> {
    cpuinfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "model name").then(|| value.trim().to_string())
    })
}

fn memory_mib() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|info| parse_mem_total_mib(&info))
        .unwrap_or(0)
}

fn parse_mem_total_mib(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|line| line.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib / 1024)
}
