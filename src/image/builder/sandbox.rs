// file: src/image/builder/sandbox.rs
// version: 1.0.0
// guid: 8f3a1c5e-6d2b-4e90-a7c4-2b1d0e9f8a7c

//! Rootless OCI container for installer and filesystem commands
//!
//! Commands run through `crun` in fresh user, mount and pid namespaces.
//! The container root is a minimal bundle; `/usr` and a few files come
//! from the host, work directories are bind mounted in.

use crate::error::CloudImagesError;
use crate::utils::system::{current_gid, current_uid, run_checked, CommandOutput, CommandRunner, CommandSpec};
use crate::Result;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const SUBUID_FILE: &str = "/etc/subuid";
pub const SUBGID_FILE: &str = "/etc/subgid";

/// Capabilities granted inside the container
pub const CAPABILITIES: [&str; 9] = [
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FOWNER",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SYS_ADMIN",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
];

const TMPFS_MOUNTS: [&str; 4] = ["/target", "/run", "/tmp", "/var/run"];
const HOST_MOUNTS: [&str; 3] = ["/etc/resolv.conf", "/etc/ssl/certs", "/usr"];
const USRMERGE_LINKS: [&str; 4] = ["bin", "lib", "lib64", "sbin"];

/// One entry of `uidMappings` / `gidMappings`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdMapping {
    #[serde(rename = "containerID")]
    pub container_id: u32,
    #[serde(rename = "hostID")]
    pub host_id: u32,
    pub size: u32,
}

/// Subordinate id range of `user` (or of `id`) from a subuid/subgid file
pub fn parse_subid(content: &str, user: Option<&str>, id: u32) -> Result<(u32, u32)> {
    let id = id.to_string();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        let [owner, start, count] = fields[..] else {
            continue;
        };
        if owner != id && Some(owner) != user {
            continue;
        }
        let parse = |v: &str| {
            v.parse::<u32>()
                .map_err(|_| CloudImagesError::config(format!("Invalid subordinate id entry: {}", line)))
        };
        return Ok((parse(start)?, parse(count)?));
    }
    Err(CloudImagesError::precondition(format!(
        "No subordinate id range for {}",
        user.unwrap_or(&id)
    )))
}

/// Container root maps to `host_id`, container ids from 1 onwards to the
/// subordinate range
pub fn id_mappings(host_id: u32, subordinate: (u32, u32)) -> Vec<IdMapping> {
    vec![
        IdMapping {
            container_id: 0,
            host_id,
            size: 1,
        },
        IdMapping {
            container_id: 1,
            host_id: subordinate.0,
            size: subordinate.1,
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub destination: String,
    pub writable: bool,
}

impl BindMount {
    fn to_json(&self) -> Value {
        let mut options = vec!["rbind", "nodev", "nosuid"];
        if !self.writable {
            options.push("ro");
        }
        json!({
            "destination": self.destination,
            "type": "bind",
            "source": self.source,
            "options": options,
        })
    }
}

pub struct Sandbox {
    runner: Arc<dyn CommandRunner>,
    uid_mappings: Vec<IdMapping>,
    gid_mappings: Vec<IdMapping>,
    mounts: Vec<BindMount>,
    env: Vec<(String, String)>,
}

impl Sandbox {
    /// Sandbox for the invoking user, id ranges from /etc/subuid and /etc/subgid
    pub fn for_current_user(runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let user = std::env::var("USER").ok();
        let (uid, gid) = (current_uid(), current_gid());
        let read = |path: &str| {
            fs::read_to_string(path)
                .map_err(|e| CloudImagesError::precondition(format!("Failed to read {}: {}", path, e)))
        };
        let subuid = parse_subid(&read(SUBUID_FILE)?, user.as_deref(), uid)?;
        let subgid = parse_subid(&read(SUBGID_FILE)?, user.as_deref(), uid)?;
        Ok(Self::with_mappings(
            runner,
            id_mappings(uid, subuid),
            id_mappings(gid, subgid),
        ))
    }

    pub fn with_mappings(
        runner: Arc<dyn CommandRunner>,
        uid_mappings: Vec<IdMapping>,
        gid_mappings: Vec<IdMapping>,
    ) -> Self {
        let mounts = HOST_MOUNTS
            .iter()
            .map(|path| BindMount {
                source: PathBuf::from(path),
                destination: path.to_string(),
                writable: false,
            })
            .collect();
        Self {
            runner,
            uid_mappings,
            gid_mappings,
            mounts,
            env: vec![(
                "PATH".to_string(),
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin".to_string(),
            )],
        }
    }

    /// Bind `source` at `destination`, read-only unless `writable`
    pub fn bind(mut self, source: impl Into<PathBuf>, destination: impl Into<String>, writable: bool) -> Self {
        self.mounts.push(BindMount {
            source: source.into(),
            destination: destination.into(),
            writable,
        });
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn mounts(&self) -> &[BindMount] {
        &self.mounts
    }

    /// OCI runtime configuration running `args`
    pub fn config(&self, args: &[String]) -> Value {
        let mut mounts = vec![
            json!({"destination": "/proc", "type": "proc", "source": "proc"}),
            json!({
                "destination": "/dev",
                "type": "tmpfs",
                "source": "tmpfs",
                "options": ["nosuid", "strictatime", "mode=755", "size=65536k"],
            }),
            json!({
                "destination": "/dev/pts",
                "type": "devpts",
                "source": "devpts",
                "options": ["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
            }),
            json!({
                "destination": "/sys",
                "type": "bind",
                "source": "/sys",
                "options": ["rbind", "nodev", "nosuid", "noexec", "ro"],
            }),
        ];
        mounts.extend(TMPFS_MOUNTS.iter().map(|dest| {
            json!({
                "destination": dest,
                "type": "tmpfs",
                "source": "tmpfs",
                "options": ["nodev", "nosuid", "mode=755"],
            })
        }));
        mounts.extend(self.mounts.iter().map(BindMount::to_json));

        let env: Vec<String> = self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        json!({
            "ociVersion": "1.0.0",
            "process": {
                "terminal": false,
                "user": {"uid": 0, "gid": 0},
                "args": args,
                "env": env,
                "cwd": "/",
                "capabilities": {
                    "bounding": CAPABILITIES,
                    "inheritable": CAPABILITIES,
                },
                "noNewPrivileges": false,
            },
            "root": {"path": "rootfs", "readonly": false},
            "hostname": "sandbox",
            "mounts": mounts,
            "linux": {
                "uidMappings": self.uid_mappings,
                "gidMappings": self.gid_mappings,
                "namespaces": [
                    {"type": "user"},
                    {"type": "mount"},
                    {"type": "pid"},
                ],
            },
        })
    }

    /// Write `config.json` and a minimal usrmerged rootfs into `bundle`
    pub fn prepare_bundle(&self, bundle: &Path, args: &[String]) -> Result<()> {
        let rootfs = bundle.join("rootfs");
        for dir in ["dev", "etc", "proc", "sys", "usr", "run", "tmp", "target", "var/run"] {
            fs::create_dir_all(rootfs.join(dir))?;
        }
        for link in USRMERGE_LINKS {
            symlink(format!("usr/{}", link), rootfs.join(link))?;
        }
        // Targets for the host file mounts
        fs::write(rootfs.join("etc/resolv.conf"), b"")?;
        fs::create_dir_all(rootfs.join("etc/ssl/certs"))?;
        for mount in &self.mounts {
            let target = rootfs.join(mount.destination.trim_start_matches('/'));
            if mount.source.is_dir() {
                fs::create_dir_all(&target)?;
            } else if !target.exists() {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, b"")?;
            }
        }

        let config = serde_json::to_vec_pretty(&self.config(args))?;
        fs::write(bundle.join("config.json"), config)?;
        Ok(())
    }

    /// Run a shell script inside a fresh container
    pub async fn run_script(&self, script: &str) -> Result<CommandOutput> {
        self.run(&["/bin/sh".to_string(), "-euc".to_string(), script.to_string()])
            .await
    }

    /// Run `args` inside a fresh container
    pub async fn run(&self, args: &[String]) -> Result<CommandOutput> {
        let bundle = tempfile::Builder::new().prefix("dci-sandbox-").tempdir()?;
        self.prepare_bundle(bundle.path(), args)?;

        let id = format!("dci-{}", uuid::Uuid::new_v4().simple());
        info!("Running {} in sandbox {}", args.first().map(String::as_str).unwrap_or(""), id);
        debug!("Sandbox bundle at {}", bundle.path().display());

        let command = CommandSpec::new("crun").args([
            "run".to_string(),
            "--bundle".to_string(),
            bundle.path().display().to_string(),
            id,
        ]);
        run_checked(self.runner.as_ref(), &command).await
    }
}
