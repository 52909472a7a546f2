#![cfg(target_os = "linux")]

use hyper::Uri;
use imagens::supervisor::health::HealthProbe;
use std::{
    net::{SocketAddr, TcpStream},
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tempfile::TempDir;
use tokio::{
    process::{Child, Command},
    time::{Instant, sleep, timeout},
};

struct Running {
    child: Child,
    proxy_port: u16,
    backend_port: u16,
    _dir: TempDir,
}

impl Running {
    fn pid(&self) -> i32 {
        self.child.id().unwrap() as i32
    }

    async fn exit_status(&mut self) -> ExitStatus {
        timeout(Duration::from_secs(60), self.child.wait())
            .await
            .expect("supervisor did not exit")
            .unwrap()
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn accepts_connections(port: u16) -> bool {
    TcpStream::connect_timeout(&SocketAddr::from(([127, 0, 0, 1], port)), Duration::from_millis(200)).is_ok()
}

/// Launch `imagens supervise` on free ports and wait until the proxy
/// answers `/health` end to end.
async fn start_supervisor() -> Running {
    let dir = TempDir::new().unwrap();
    let static_root = dir.path().join("static");
    std::fs::create_dir_all(&static_root).unwrap();
    std::fs::write(static_root.join("index.html"), "<!doctype html>").unwrap();

    let proxy_port = free_port();
    let backend_port = free_port();
    let child = Command::new(env!("CARGO_BIN_EXE_imagens"))
        .arg("supervise")
        .arg("--data-dir")
        .arg(dir.path().join("data"))
        .arg("--static-root")
        .arg(&static_root)
        .args(["--proxy-port", &proxy_port.to_string()])
        .args(["--backend-port", &backend_port.to_string()])
        .args(["--grace-secs", "2"])
        .env("RUST_LOG", "warn")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let mut running = Running {
        child,
        proxy_port,
        backend_port,
        _dir: dir,
    };

    let url: Uri = format!("http://127.0.0.1:{}/health", proxy_port).parse().unwrap();
    let health = HealthProbe::new(url, Duration::from_secs(1));
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if health.check().await {
            return running;
        }
        if let Ok(Some(status)) = running.child.try_wait() {
            panic!("supervisor exited during startup: {}", status);
        }
        assert!(Instant::now() < deadline, "proxy never became healthy");
        sleep(Duration::from_millis(200)).await;
    }
}

/// Direct children of `parent`, read from `/proc`.
fn children_of(parent: i32) -> Vec<(i32, Vec<String>)> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir("/proc").unwrap().flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        // Fields after the parenthesised command name: state, ppid, ...
        let Some(rest) = stat.rfind(')').map(|at| &stat[at + 1..]) else {
            continue;
        };
        let ppid = rest.split_whitespace().nth(1).and_then(|p| p.parse::<i32>().ok());
        if ppid != Some(parent) {
            continue;
        }
        let args = std::fs::read(Path::new("/proc").join(pid.to_string()).join("cmdline"))
            .unwrap_or_default()
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();
        found.push((pid, args));
    }
    found
}

fn is_alive(pid: i32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .map(|stat| {
            // Zombies still have a /proc entry.
            stat.rfind(')')
                .and_then(|at| stat[at + 1..].split_whitespace().next().map(|s| s != "Z"))
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

#[tokio::test]
async fn sigterm_stops_both_children_and_exits_cleanly() {
    let mut running = start_supervisor().await;
    let children: Vec<i32> = children_of(running.pid()).into_iter().map(|(pid, _)| pid).collect();
    assert_eq!(children.len(), 2, "expected proxy and backend children");

    assert_eq!(unsafe { libc::kill(running.pid(), libc::SIGTERM) }, 0);
    let status = running.exit_status().await;
    assert!(status.success(), "supervisor exited with {}", status);

    for pid in children {
        assert!(!is_alive(pid), "child {} survived shutdown", pid);
    }
    assert!(!accepts_connections(running.proxy_port));
    assert!(!accepts_connections(running.backend_port));
}

#[tokio::test]
async fn losing_the_backend_fails_the_supervisor() {
    let mut running = start_supervisor().await;
    let (backend, _) = children_of(running.pid())
        .into_iter()
        .find(|(_, args)| args.iter().any(|arg| arg == "serve"))
        .expect("backend child not found");

    assert_eq!(unsafe { libc::kill(backend, libc::SIGKILL) }, 0);
    let status = running.exit_status().await;
    assert!(!status.success(), "supervisor should fail after losing a child");
    assert!(!accepts_connections(running.proxy_port));
}
