use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A project directory plus a private directory for sockets and PID files.
struct Project {
    dir: TempDir,
}

impl Project {
    fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
        std::fs::write(dir.path().join("app").join("prewarm.toml"), "latency_ms = 50\n").unwrap();
        std::fs::write(dir.path().join("app").join("Cargo.toml"), "[package]\n").unwrap();
        std::fs::write(dir.path().join("app").join("Cargo.lock"), "version = 3\n").unwrap();
        Self { dir }
    }

    fn root(&self) -> std::path::PathBuf {
        self.dir.path().join("app")
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_prewarm"));
        cmd.arg("--project")
            .arg(self.root())
            .args(args)
            .env("PREWARM_TMP_PATH", self.dir.path().join("tmp"))
            .env("NO_COLOR", "1")
            .env_remove("RUST_LOG")
            .stdin(Stdio::null());
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.command(args).output().expect("Failed to run prewarm")
    }

    fn spawn_server(&self) -> Child {
        self.command(&["server", "--no-session-group"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to start server")
    }

    fn wait_for_status(&self, needle: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let output = self.run(&["status"]);
            if String::from_utf8_lossy(&output.stdout).contains(needle) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "status never reported {needle:?}"
            );
            sleep(Duration::from_millis(50));
        }
    }
}

fn tmp_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

#[test]
fn test_status_without_daemon() {
    let project = Project::new();
    let output = project.run(&["status"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("not running"), "unexpected output: {stdout}");
}

#[test]
fn test_stop_without_daemon() {
    let project = Project::new();
    let output = project.run(&["stop"]);

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No daemon is running"));
}

#[test]
fn test_run_without_daemon_and_no_boot() {
    let project = Project::new();
    let output = project.run(&["run", "--no-boot", "help"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("No daemon is running"));
}

#[test]
fn test_server_lifecycle() {
    let project = Project::new();
    let mut server = project.spawn_server();
    project.wait_for_status("PID:");

    // A second server for the same project refuses to start
    let second = project.run(&["server", "--no-session-group"]);
    assert_eq!(second.status.code(), Some(1));

    // Commands the daemon does not know are rejected without a status
    let unknown = project.run(&["run", "--no-boot", "frobnicate"]);
    assert_eq!(unknown.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&unknown.stderr).contains("Unknown command"));

    let stop = project.run(&["stop"]);
    assert!(stop.status.success());
    assert!(String::from_utf8_lossy(&stop.stdout).contains("Stopped daemon"));

    let status = server.wait().expect("server should exit");
    assert!(status.success());
    project.wait_for_status("not running");
    assert!(tmp_is_empty(&project.dir.path().join("tmp")));
}

#[test]
fn test_manifest_change_retires_server() {
    let project = Project::new();
    let mut server = project.spawn_server();
    project.wait_for_status("PID:");

    let manifest = std::fs::File::options()
        .write(true)
        .open(project.root().join("Cargo.toml"))
        .unwrap();
    manifest
        .set_modified(std::time::SystemTime::now() + Duration::from_secs(60))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while server.try_wait().unwrap().is_none() {
        assert!(Instant::now() < deadline, "stale server kept running");
        sleep(Duration::from_millis(50));
    }
    assert!(tmp_is_empty(&project.dir.path().join("tmp")));
}
