//! OCI bundle assembly for service instances.
//!
//! A bundle directory holds `config.json`, an empty `rootfs/` mount point,
//! host FS whiteouts and mount points for the stacked overlay. The guest
//! rootfs is described as an overlay mount of the service rootfs, its
//! layers and the whiteouts directory, so everything under `/` that is not
//! an explicit host bind is masked from the guest.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Host;
use crate::error::{Error, Result};
use crate::image;
use crate::resourcemanager::NodeConfig;
use crate::storage::{InstanceEntry, NetworkLease, ServiceEntry};

const OCI_VERSION: &str = "1.0.2";
const SERVICE_CONFIG_FILE: &str = "config.json";
const SERVICE_ROOTFS_DIR: &str = "rootfs";
const WHITEOUTS_DIR: &str = "whiteouts";

/// Image-provided process configuration shipped inside the service bundle,
/// including the Aos extensions for requested devices and resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceImageConfig {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub hostname: Option<String>,
    pub devices: Vec<String>,
    pub resources: Vec<String>,
}

// OCI runtime spec subset written to the bundle.

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub oci_version: String,
    pub process: Process,
    pub root: Root,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub mounts: Vec<Mount>,
    pub linux: Linux,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub terminal: bool,
    pub user: User,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub additional_gids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Root {
    pub path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub devices: Vec<LinuxDevice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<LinuxResources>,
    pub namespaces: Vec<Namespace>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxDevice {
    pub path: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub major: u64,
    pub minor: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<LinuxMemory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<LinuxCpu>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinuxMemory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinuxCpu {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

const CPU_PERIOD_US: u64 = 100_000;

/// Everything needed to materialise one instance bundle.
pub struct BundleParams<'a> {
    pub runtime_dir: &'a Path,
    pub instance: &'a InstanceEntry,
    pub service: &'a ServiceEntry,
    pub service_config: &'a ServiceImageConfig,
    pub layer_paths: Vec<String>,
    pub lease: Option<&'a NetworkLease>,
    pub host_binds: &'a [String],
    pub hosts: &'a [Host],
    pub node_config: &'a NodeConfig,
    pub env_overrides: Vec<String>,
}

/// Loads the image-provided service config from an installed service dir.
pub async fn load_service_config(service_path: &str) -> Result<ServiceImageConfig> {
    let path = Path::new(service_path).join(SERVICE_CONFIG_FILE);

    match tokio::fs::read_to_string(&path).await {
        Ok(text) => serde_json::from_str(&text)
            .map_err(|err| Error::Validation(format!("invalid service config: {err}"))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Ok(ServiceImageConfig::default())
        }
        Err(err) => Err(err.into()),
    }
}

/// Creates the bundle directory for an instance and writes `config.json`.
/// Returns the bundle path.
pub async fn assemble_bundle(params: BundleParams<'_>) -> Result<PathBuf> {
    let instance_id = params.instance.ident.instance_id();
    let bundle_dir = params.runtime_dir.join(&instance_id);

    debug!(instance_id = %instance_id, bundle = %bundle_dir.display(), "assembling bundle");

    tokio::fs::create_dir_all(bundle_dir.join(SERVICE_ROOTFS_DIR)).await?;

    let whiteouts_dir = bundle_dir.join(WHITEOUTS_DIR);
    create_host_fs_whiteouts(&whiteouts_dir, params.host_binds).await?;

    let spec = build_runtime_spec(&params, &whiteouts_dir)?;

    tokio::fs::write(
        bundle_dir.join("config.json"),
        serde_json::to_vec_pretty(&spec)?,
    )
    .await?;

    write_hosts_file(&bundle_dir, &params).await?;

    Ok(bundle_dir)
}

pub async fn remove_bundle(runtime_dir: &Path, instance_id: &str) -> Result<()> {
    match tokio::fs::remove_dir_all(runtime_dir.join(instance_id)).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

fn build_runtime_spec(params: &BundleParams<'_>, whiteouts_dir: &Path) -> Result<RuntimeSpec> {
    let instance = params.instance;
    let config = params.service_config;

    let mut args = config.entrypoint.clone();
    args.extend(config.cmd.iter().cloned());
    if args.is_empty() {
        return Err(Error::Validation(format!(
            "service {} defines no entrypoint",
            params.service.service_id
        )));
    }

    let mut env = config.env.clone();
    env.extend(params.env_overrides.iter().cloned());

    for resource in &config.resources {
        let info = params
            .node_config
            .resources
            .iter()
            .find(|r| r.name == *resource)
            .ok_or_else(|| Error::NotFound(format!("resource {resource}")))?;

        env.extend(info.env.iter().cloned());
    }

    let mut devices = Vec::new();

    for device in &config.devices {
        let info = params
            .node_config
            .devices
            .iter()
            .find(|d| d.name == *device)
            .ok_or_else(|| Error::NotFound(format!("device {device}")))?;

        for host_path in &info.host_devices {
            devices.push(populate_host_device(Path::new(host_path), instance.uid, params.service.gid)?);
        }
    }

    let additional_gids = resolve_group_gids(config, params.node_config)?;

    // Guest rootfs, top to bottom: service rootfs, layers, host whiteouts,
    // host root. The whiteouts mask every host path that is not an explicit
    // bind.
    let mut lower_dirs = vec![Path::new(&params.service.local_path)
        .join(SERVICE_ROOTFS_DIR)
        .display()
        .to_string()];
    lower_dirs.extend(params.layer_paths.iter().rev().cloned());
    lower_dirs.push(whiteouts_dir.display().to_string());
    lower_dirs.push("/".to_string());

    let mut mounts = vec![Mount {
        destination: "/".to_string(),
        mount_type: "overlay".to_string(),
        source: "overlay".to_string(),
        options: vec![
            format!("lowerdir={}", lower_dirs.join(":")),
            "nosuid".to_string(),
            "nodev".to_string(),
        ],
    }];

    if !instance.storage_path.is_empty() {
        mounts.push(Mount {
            destination: "/storage".to_string(),
            mount_type: "bind".to_string(),
            source: instance.storage_path.clone(),
            options: vec!["bind".to_string(), "rw".to_string()],
        });
    }

    if !instance.state_path.is_empty() {
        mounts.push(Mount {
            destination: "/state".to_string(),
            mount_type: "bind".to_string(),
            source: instance.state_path.clone(),
            options: vec!["bind".to_string(), "rw".to_string()],
        });
    }

    for bind in params.host_binds {
        let path = format!("/{}", bind.trim_start_matches('/'));

        mounts.push(Mount {
            destination: path.clone(),
            mount_type: "bind".to_string(),
            source: path,
            options: vec!["bind".to_string(), "ro".to_string()],
        });
    }

    for resource in &config.resources {
        if let Some(info) = params
            .node_config
            .resources
            .iter()
            .find(|r| r.name == *resource)
        {
            for mount in &info.mounts {
                mounts.push(Mount {
                    destination: mount.destination.clone(),
                    mount_type: mount.mount_type.clone(),
                    source: mount.source.clone(),
                    options: mount.options.clone(),
                });
            }
        }
    }

    let mut namespaces = vec![
        Namespace {
            ns_type: "pid".to_string(),
            path: None,
        },
        Namespace {
            ns_type: "mount".to_string(),
            path: None,
        },
        Namespace {
            ns_type: "ipc".to_string(),
            path: None,
        },
        Namespace {
            ns_type: "uts".to_string(),
            path: None,
        },
    ];

    if let Some(lease) = params.lease {
        namespaces.push(Namespace {
            ns_type: "network".to_string(),
            path: Some(crate::network::netns_path(&lease.instance_id)),
        });
    }

    let quotas = &params.node_config.quotas;
    let resources = if quotas.ram.is_some() || quotas.cpu_percent.is_some() {
        Some(LinuxResources {
            memory: quotas.ram.map(|limit| LinuxMemory { limit: Some(limit) }),
            cpu: quotas.cpu_percent.map(|percent| LinuxCpu {
                quota: Some((CPU_PERIOD_US as f64 * percent / 100.0) as i64),
                period: Some(CPU_PERIOD_US),
            }),
        })
    } else {
        None
    };

    Ok(RuntimeSpec {
        oci_version: OCI_VERSION.to_string(),
        process: Process {
            terminal: false,
            user: User {
                uid: instance.uid,
                gid: params.service.gid,
                additional_gids,
            },
            args,
            env,
            cwd: if config.working_dir.is_empty() {
                "/".to_string()
            } else {
                config.working_dir.clone()
            },
        },
        root: Root {
            path: SERVICE_ROOTFS_DIR.to_string(),
            readonly: false,
        },
        hostname: config
            .hostname
            .clone()
            .or_else(|| Some(params.instance.ident.instance_id())),
        mounts,
        linux: Linux {
            devices,
            resources,
            namespaces,
        },
    })
}

/// Creates whiteout nodes for every top-level host path that is not an
/// explicit host bind, masking it from the guest overlay.
pub async fn create_host_fs_whiteouts(whiteouts_dir: &Path, host_binds: &[String]) -> Result<()> {
    tokio::fs::create_dir_all(whiteouts_dir).await?;

    let mut entries = tokio::fs::read_dir("/").await?;

    while let Some(entry) = entries.next_entry().await? {
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };

        if host_binds.iter().any(|bind| bind.trim_start_matches('/') == name) {
            continue;
        }

        let node = whiteouts_dir.join(&name);

        if !node.exists() {
            image::make_whiteout_node(&node, 0, 0)?;
        }
    }

    Ok(())
}

/// Resolves a host device path (following symlinks) into an OCI device
/// record.
pub fn populate_host_device(path: &Path, uid: u32, gid: u32) -> Result<LinuxDevice> {
    use nix::sys::stat::{major, minor, stat, SFlag};

    let resolved = std::fs::canonicalize(path)?;
    let info = stat(&resolved)?;

    let mode = SFlag::from_bits_truncate(info.st_mode);
    let device_type = if mode.contains(SFlag::S_IFBLK) {
        "b"
    } else if mode.contains(SFlag::S_IFCHR) {
        "c"
    } else {
        return Err(Error::InvalidArgument(format!(
            "{} is not a device node",
            resolved.display()
        )));
    };

    Ok(LinuxDevice {
        path: resolved.display().to_string(),
        device_type: device_type.to_string(),
        major: major(info.st_rdev),
        minor: minor(info.st_rdev),
        file_mode: Some(info.st_mode & 0o7777),
        uid,
        gid,
    })
}

/// Prepares a writable instance directory owned by the service user.
pub async fn prepare_instance_dir(path: &str, uid: u32, gid: u32) -> Result<()> {
    use nix::unistd::{chown, Gid, Uid};

    if path.is_empty() {
        return Ok(());
    }

    tokio::fs::create_dir_all(path).await?;
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))?;

    Ok(())
}

fn resolve_group_gids(config: &ServiceImageConfig, node_config: &NodeConfig) -> Result<Vec<u32>> {
    let mut gids = Vec::new();

    for device in &config.devices {
        let Some(info) = node_config.devices.iter().find(|d| d.name == *device) else {
            continue;
        };

        for group in &info.groups {
            if let Some(gid) = gid_by_name(group)? {
                if !gids.contains(&gid) {
                    gids.push(gid);
                }
            }
        }
    }

    Ok(gids)
}

/// Returns the GID for a group name, or None when the group is unknown.
pub fn gid_by_name(name: &str) -> Result<Option<u32>> {
    let group = nix::unistd::Group::from_name(name)
        .map_err(|err| Error::Failed(format!("group lookup failed: {err}")))?;

    Ok(group.map(|g| g.gid.as_raw()))
}

async fn write_hosts_file(bundle_dir: &Path, params: &BundleParams<'_>) -> Result<()> {
    let mut content = String::from("127.0.0.1\tlocalhost\n");

    if let Some(lease) = params.lease {
        content.push_str(&format!(
            "{}\t{}\n",
            lease.ip,
            params.instance.ident.instance_id()
        ));
    }

    for host in params.hosts {
        content.push_str(&format!("{}\t{}\n", host.ip, host.hostname));
    }

    tokio::fs::write(bundle_dir.join("hosts"), content).await?;

    Ok(())
}
