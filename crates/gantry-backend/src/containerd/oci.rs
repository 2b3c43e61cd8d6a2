//! Runtime spec synthesis for containerd tasks.
//!
//! The spec is plain JSON wrapped in a protobuf Any; the runc shim parses
//! it on the other side. Base values come from the image config, step
//! attributes override them.

use serde_json::{json, Value};

use super::image::ImageConfig;
use gantry_core::Step;

const RUNTIME_SPEC_ANY: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";

pub fn spec_any(spec: &Value) -> prost_types::Any {
    prost_types::Any {
        type_url: RUNTIME_SPEC_ANY.to_string(),
        value: serde_json::to_vec(spec).expect("runtime spec serializes"),
    }
}

/// Process args: the step's joined command line, else the image entrypoint.
fn process_args(step: &Step, image: &ImageConfig) -> Vec<String> {
    if let Some(line) = step.shell_line() {
        return vec!["/bin/sh".to_string(), "-c".to_string(), line];
    }
    let mut args: Vec<String> = image.entrypoint.clone().unwrap_or_default();
    args.extend(image.cmd.clone().unwrap_or_default());
    if args.is_empty() {
        args.push("/bin/sh".to_string());
    }
    args
}

/// `uid[:gid]`, numeric. Anything else falls back to root, matching what
/// the shim would do without a user database in the rootfs.
fn process_user(step: &Step, image: &ImageConfig) -> (u32, u32) {
    let requested = step.user.as_deref().or(image.user.as_deref()).unwrap_or("");
    let mut parts = requested.splitn(2, ':');
    let uid = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let gid = parts.next().and_then(|p| p.parse().ok()).unwrap_or(uid);
    (uid, gid)
}

fn default_mounts() -> Vec<Value> {
    vec![
        json!({"destination": "/proc", "type": "proc", "source": "proc"}),
        json!({
            "destination": "/dev", "type": "tmpfs", "source": "tmpfs",
            "options": ["nosuid", "strictatime", "mode=755", "size=65536k"]
        }),
        json!({
            "destination": "/dev/pts", "type": "devpts", "source": "devpts",
            "options": ["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"]
        }),
        json!({
            "destination": "/dev/shm", "type": "tmpfs", "source": "shm",
            "options": ["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]
        }),
        json!({
            "destination": "/dev/mqueue", "type": "mqueue", "source": "mqueue",
            "options": ["nosuid", "noexec", "nodev"]
        }),
        json!({
            "destination": "/sys", "type": "sysfs", "source": "sysfs",
            "options": ["nosuid", "noexec", "nodev", "ro"]
        }),
        json!({
            "destination": "/sys/fs/cgroup", "type": "cgroup", "source": "cgroup",
            "options": ["nosuid", "noexec", "nodev", "relatime", "ro"]
        }),
    ]
}

/// Build the OCI runtime spec for a step container.
pub fn build_spec(step: &Step, image: &ImageConfig, hostname: &str) -> Value {
    let mut env: Vec<String> = image.env.clone().unwrap_or_default();
    if !env.iter().any(|e| e.starts_with("PATH=")) {
        env.push("PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string());
    }
    // Step environment appended last so it wins over image defaults.
    env.extend(step.environment.iter().map(|(k, v)| format!("{k}={v}")));

    let cwd = step
        .working_directory
        .clone()
        .or_else(|| image.working_dir.clone())
        .filter(|dir| !dir.is_empty())
        .unwrap_or_else(|| "/".to_string());

    let (uid, gid) = process_user(step, image);

    let mut mounts = default_mounts();
    for volume in &step.volumes {
        let mut options = vec!["rbind".to_string()];
        if volume.read_only {
            options.push("ro".to_string());
        }
        mounts.push(json!({
            "destination": volume.container_path,
            "type": "bind",
            "source": volume.host_path,
            "options": options,
        }));
    }

    json!({
        "ociVersion": "1.1.0",
        "process": {
            "terminal": false,
            "user": {"uid": uid, "gid": gid},
            "args": process_args(step, image),
            "env": env,
            "cwd": cwd,
            "noNewPrivileges": !step.privileged,
        },
        "root": {"path": "rootfs"},
        "hostname": hostname,
        "mounts": mounts,
        "linux": {
            "namespaces": [
                {"type": "pid"},
                {"type": "ipc"},
                {"type": "uts"},
                {"type": "mount"},
                {"type": "network"}
            ],
            "maskedPaths": [
                "/proc/acpi", "/proc/kcore", "/proc/keys", "/sys/firmware"
            ],
            "readonlyPaths": [
                "/proc/bus", "/proc/fs", "/proc/irq", "/proc/sys", "/proc/sysrq-trigger"
            ]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::step::Volume;

    fn image() -> ImageConfig {
        ImageConfig {
            env: Some(vec!["PATH=/bin".into(), "FOO=image".into()]),
            entrypoint: Some(vec!["/entry".into()]),
            cmd: Some(vec!["serve".into()]),
            working_dir: Some("/srv".into()),
            user: Some("1000".into()),
        }
    }

    #[test]
    fn commands_override_entrypoint() {
        let step = Step::new("s1", "build", "busybox")
            .with_commands(vec!["echo hi".into(), "false".into()]);
        let spec = build_spec(&step, &image(), "t1-s1");
        assert_eq!(
            spec["process"]["args"],
            json!(["/bin/sh", "-c", "echo hi && false"])
        );
    }

    #[test]
    fn entrypoint_used_when_no_commands() {
        let step = Step::new("s1", "svc", "busybox");
        let spec = build_spec(&step, &image(), "t1-s1");
        assert_eq!(spec["process"]["args"], json!(["/entry", "serve"]));
    }

    #[test]
    fn step_environment_wins_over_image() {
        let mut step = Step::new("s1", "build", "busybox");
        step.environment.insert("FOO".into(), "step".into());
        let spec = build_spec(&step, &image(), "t1-s1");
        let env: Vec<&str> = spec["process"]["env"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        let image_pos = env.iter().position(|e| *e == "FOO=image").unwrap();
        let step_pos = env.iter().position(|e| *e == "FOO=step").unwrap();
        assert!(step_pos > image_pos);
    }

    #[test]
    fn working_directory_and_user_fallbacks() {
        let step = Step::new("s1", "build", "busybox");
        let spec = build_spec(&step, &image(), "t1-s1");
        assert_eq!(spec["process"]["cwd"], "/srv");
        assert_eq!(spec["process"]["user"]["uid"], 1000);
        assert_eq!(spec["process"]["user"]["gid"], 1000);

        let spec = build_spec(&step, &ImageConfig::default(), "t1-s1");
        assert_eq!(spec["process"]["cwd"], "/");
        assert_eq!(spec["process"]["user"]["uid"], 0);
    }

    #[test]
    fn volumes_become_bind_mounts() {
        let mut step = Step::new("s1", "build", "busybox");
        step.volumes.push(Volume {
            host_path: "/data".into(),
            container_path: "/workspace".into(),
            read_only: true,
        });
        let spec = build_spec(&step, &ImageConfig::default(), "t1-s1");
        let mount = spec["mounts"]
            .as_array()
            .unwrap()
            .iter()
            .find(|m| m["destination"] == "/workspace")
            .unwrap();
        assert_eq!(mount["type"], "bind");
        assert_eq!(mount["options"], json!(["rbind", "ro"]));
    }

    #[test]
    fn spec_wraps_into_any() {
        let step = Step::new("s1", "build", "busybox");
        let spec = build_spec(&step, &ImageConfig::default(), "t1-s1");
        let any = spec_any(&spec);
        assert_eq!(any.type_url, RUNTIME_SPEC_ANY);
        assert!(!any.value.is_empty());
    }
}
