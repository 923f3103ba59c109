#![cfg(not(windows))]

//! Fixture lifecycle against stub cluster programs.
//!
//! The init stub materializes a supervisor config and a first node log, the
//! supervisor stub records its pid and waits for SIGTERM, and an in-process
//! responder answers `/status` queries on the first validator's RPC port.

use std::cell::Cell;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use chainbed::{
    with_cluster, Cluster, FixtureError, FixtureOptions, ProgramBackend, StatusSource,
    WorkDirFactory, SUPERVISOR_CONFIG,
};

const INIT_STUB: &str = r#"#!/bin/sh
# stand-in for the cluster init program
while [ $# -gt 0 ]; do
    case "$1" in
        --data) data="$2"; shift 2 ;;
        --config) config="$2"; shift 2 ;;
        --base_port) base_port="$2"; shift 2 ;;
        *) shift ;;
    esac
done

cat > "$data/tasks.ini" <<'INI'
[supervisord]
nodaemon=true

[program:node0]
command = /usr/local/bin/chain-maind start --home %(here)s/node0
autostart = true

[program:node1]
command = chain-maind start --home %(here)s/node1
autostart = true
INI

echo "node started" > "$data/node0.log"
"#;

const SUPERVISOR_STUB: &str = r#"#!/bin/sh
# stand-in for supervisord; records its pid and exits cleanly on SIGTERM
while [ $# -gt 0 ]; do
    case "$1" in
        -c) ini="$2"; shift 2 ;;
        *) shift ;;
    esac
done

echo $$ > "$(dirname "$ini")/supervisor.pid"

trap 'exit 0' TERM
while true; do
    sleep 0.2
done
"#;

fn write_stub(dir: &Path, name: &str, content: &str) -> Result<PathBuf> {
    let path = dir.join(name);

    std::fs::write(&path, content)?;

    let mut perms = std::fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms)?;

    Ok(path)
}

/// Answers every connection on the rigged RPC port with a canned `/status`
/// payload reporting height 1.
struct StatusResponder {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StatusResponder {
    fn spawn(listener: TcpListener) -> Result<Self> {
        listener.set_nonblocking(true)?;

        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let handle = std::thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => answer_status(stream),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(20));
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for StatusResponder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn answer_status(mut stream: TcpStream) {
    // port probes connect without sending anything, so never block on the
    // request bytes
    let _ = stream.set_read_timeout(Some(Duration::from_millis(200)));
    let mut request = [0u8; 1024];
    let _ = stream.read(&mut request);

    let body = r#"{"jsonrpc":"2.0","id":-1,"result":{"sync_info":{"latest_block_height":"1","latest_block_time":"2023-06-01T12:00:00Z"}}}"#;
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );

    let _ = stream.write_all(response.as_bytes());
}

struct TestRig {
    _stub_dir: tempfile::TempDir,
    _responder: StatusResponder,
    backend: ProgramBackend,
    config_path: PathBuf,
}

/// Reserve an RPC port with a live responder and point a topology file at
/// the matching base port.
fn setup_rig() -> Result<TestRig> {
    let stub_dir = tempfile::tempdir()?;

    let init = write_stub(stub_dir.path(), "cluster-init", INIT_STUB)?;
    let supervisor = write_stub(stub_dir.path(), "supervisor", SUPERVISOR_STUB)?;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let rpc_port = listener.local_addr()?.port();
    let base_port = rpc_port - 7;

    let config_path = stub_dir.path().join("cluster.yaml");
    std::fs::write(
        &config_path,
        format!("chain_id: chainbed-1\nvalidators:\n  - base_port: {base_port}\n"),
    )?;

    let responder = StatusResponder::spawn(listener)?;

    let backend = ProgramBackend::new()
        .with_init_program(init.to_string_lossy())
        .with_supervisor_program(supervisor.to_string_lossy());

    Ok(TestRig {
        _stub_dir: stub_dir,
        _responder: responder,
        backend,
        config_path,
    })
}

fn quiet_options(rig: &TestRig) -> FixtureOptions {
    FixtureOptions::new()
        .quiet(true)
        .coverage(false)
        .backend(rig.backend.clone())
}

fn read_supervisor_pid(data: &Path) -> Result<i32> {
    let path = data.join("supervisor.pid");
    let start = Instant::now();

    while start.elapsed() < Duration::from_secs(5) {
        if let Ok(raw) = std::fs::read_to_string(&path) {
            if let Ok(pid) = raw.trim().parse() {
                return Ok(pid);
            }
        }

        std::thread::sleep(Duration::from_millis(50));
    }

    bail!("supervisor stub never wrote its pid file");
}

fn process_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[test]
fn quiet_cluster_boots_and_tears_down_without_coverage() -> Result<()> {
    let rig = setup_rig()?;
    let workdir = WorkDirFactory::new()?;

    let cluster = Cluster::bootstrap(&rig.config_path, 26650, &workdir, quiet_options(&rig))?;

    let handle = cluster.handle();
    assert_eq!(handle.chain_id(), "chainbed-1");
    assert!(handle.data_dir().starts_with(workdir.root()));
    assert!(handle.data_dir().ends_with("chainbed-1"));

    let tasks = std::fs::read_to_string(handle.data_dir().join(SUPERVISOR_CONFIG))?;
    assert!(tasks.contains("command = /usr/local/bin/chain-maind start"));
    assert!(!tasks.contains("chain-maind-inst"));

    let client = handle.rpc_client(0).context("first validator client")?;
    assert_eq!(client.status()?.sync_info.latest_block_height, 1);

    let pid = read_supervisor_pid(handle.data_dir())?;
    assert!(process_alive(pid));

    let data_dir = handle.data_dir().to_path_buf();
    let profile = cluster.shutdown()?;

    assert_eq!(profile, None);
    assert!(!process_alive(pid));
    assert!(!data_dir.join("coverage.txt").exists());

    Ok(())
}

#[test]
fn tailed_cluster_boots_and_tears_down_cleanly() -> Result<()> {
    let rig = setup_rig()?;
    let workdir = WorkDirFactory::new()?;

    // default options keep the log tailer running
    let options = FixtureOptions::new()
        .coverage(false)
        .backend(rig.backend.clone());

    let cluster = Cluster::bootstrap(&rig.config_path, 26650, &workdir, options)?;

    let data_dir = cluster.handle().data_dir().to_path_buf();
    let pid = read_supervisor_pid(&data_dir)?;

    // give the tailer appended log output to drain while the cluster runs
    let mut log = std::fs::OpenOptions::new()
        .append(true)
        .open(data_dir.join("node0.log"))?;
    writeln!(log, "executed block height=1")?;
    std::thread::sleep(Duration::from_millis(600));

    cluster.shutdown()?;

    assert!(!process_alive(pid));

    Ok(())
}

#[test]
fn coverage_rewrites_the_first_command_and_collects_the_profile() -> Result<()> {
    let rig = setup_rig()?;
    let workdir = WorkDirFactory::new()?;
    let out = tempfile::tempdir()?;

    let min_uptime = Duration::from_secs(3);

    let options = FixtureOptions::new()
        .quiet(true)
        .coverage(true)
        .coverage_min_uptime(min_uptime)
        .coverage_output_dir(out.path())
        .backend(rig.backend.clone());

    let started = Instant::now();
    let cluster = Cluster::bootstrap(&rig.config_path, 26650, &workdir, options)?;

    let tasks = std::fs::read_to_string(cluster.handle().data_dir().join(SUPERVISOR_CONFIG))?;
    assert!(tasks.contains(
        "command = chain-maind-inst -test.coverprofile=%(here)s/coverage.txt start --home %(here)s/node0"
    ));
    assert!(tasks.contains("command = chain-maind start --home %(here)s/node1"));

    // the instrumented node would write this while shutting down
    std::fs::write(
        cluster.handle().data_dir().join("coverage.txt"),
        "mode: set\n",
    )?;

    let profile = cluster.shutdown()?.context("coverage profile path")?;

    // teardown must stretch short-lived clusters out to the minimum uptime
    assert!(started.elapsed() >= min_uptime);

    assert_eq!(profile.parent(), Some(out.path()));
    let name = profile.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("coverage.") && name.ends_with(".txt"));
    assert_eq!(std::fs::read_to_string(&profile)?, "mode: set\n");

    Ok(())
}

#[test]
fn dropping_the_guard_still_tears_the_cluster_down() -> Result<()> {
    let rig = setup_rig()?;
    let workdir = WorkDirFactory::new()?;

    let cluster = Cluster::bootstrap(&rig.config_path, 26650, &workdir, quiet_options(&rig))?;
    let pid = read_supervisor_pid(cluster.handle().data_dir())?;

    drop(cluster);

    assert!(!process_alive(pid));

    Ok(())
}

#[test]
fn with_cluster_hands_back_the_body_value_after_teardown() -> Result<()> {
    let rig = setup_rig()?;
    let workdir = WorkDirFactory::new()?;

    let pid = Cell::new(0);

    let outcome: Result<(), String> = with_cluster(
        &rig.config_path,
        26650,
        &workdir,
        quiet_options(&rig),
        |handle| {
            pid.set(read_supervisor_pid(handle.data_dir()).expect("pid file"));
            Err("deliberate failure".to_string())
        },
    )?;

    assert_eq!(outcome, Err("deliberate failure".to_string()));
    assert!(!process_alive(pid.get()));

    Ok(())
}

#[test]
fn post_init_runs_before_any_node_starts() -> Result<()> {
    let rig = setup_rig()?;
    let workdir = WorkDirFactory::new()?;

    let options = quiet_options(&rig).post_init(|config, data| {
        assert_eq!(config.chain_id, "chainbed-1");
        assert!(!data.join("supervisor.pid").exists());

        std::fs::write(data.join("post-init.marker"), "ok")?;

        Ok(())
    });

    let cluster = Cluster::bootstrap(&rig.config_path, 26650, &workdir, options)?;

    assert!(cluster
        .handle()
        .data_dir()
        .join("post-init.marker")
        .exists());

    cluster.shutdown()?;

    Ok(())
}

#[test]
fn post_init_errors_abort_the_bootstrap() -> Result<()> {
    let rig = setup_rig()?;
    let workdir = WorkDirFactory::new()?;

    let options = quiet_options(&rig).post_init(|_, _| Err("broken hook".into()));

    let err = Cluster::bootstrap(&rig.config_path, 26650, &workdir, options).unwrap_err();

    assert!(matches!(err, FixtureError::PostInit(_)));

    Ok(())
}

#[test]
fn missing_init_program_fails_the_bootstrap() -> Result<()> {
    let rig = setup_rig()?;
    let workdir = WorkDirFactory::new()?;

    let options = FixtureOptions::new()
        .quiet(true)
        .coverage(false)
        .backend(ProgramBackend::new().with_init_program("/nonexistent/cluster-init"));

    let err = Cluster::bootstrap(&rig.config_path, 26650, &workdir, options).unwrap_err();

    assert!(matches!(err, FixtureError::Supervisor(_)));

    Ok(())
}
