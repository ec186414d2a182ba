use digitme_protocol::{RemoteRequest, RemoteResponse, SaveReply, PROTOCOL_VERSION};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, sleep};
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind free port");
    listener.local_addr().expect("free port addr").port()
}

fn write_config(dir: &Path, flush_interval_secs: u64) -> PathBuf {
    let path = dir.join("config.toml");
    std::fs::write(
        &path,
        format!(
            "[remote]\nconnect_timeout_secs = 1\n\n[relay]\nflush_interval_secs = {}\n",
            flush_interval_secs
        ),
    )
    .expect("Failed to write config");
    path
}

fn spawn_daemon(home: &Path, buffer_dir: &Path, editor_port: u16, remote_port: u16) -> DaemonGuard {
    spawn_daemon_with_flush(home, buffer_dir, editor_port, remote_port, 1)
}

fn spawn_daemon_with_flush(
    home: &Path,
    buffer_dir: &Path,
    editor_port: u16,
    remote_port: u16,
    flush_interval_secs: u64,
) -> DaemonGuard {
    let config = write_config(home, flush_interval_secs);
    let child = Command::new(env!("CARGO_BIN_EXE_digitme-daemon"))
        .env("HOME", home)
        .env_remove("DIGITME_HOST")
        .env_remove("DIGITME_PORT")
        .args(["--host", "127.0.0.1"])
        .args(["--port", &remote_port.to_string()])
        .args(["--editor-port", &editor_port.to_string()])
        .arg("--buffer-dir")
        .arg(buffer_dir)
        .arg("--config")
        .arg(config)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn digitme-daemon");
    DaemonGuard { child }
}

fn connect_editor(port: u16, timeout: Duration) -> TcpStream {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .expect("set read timeout");
            return stream;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for editor listener on port {}", port);
}

fn send(stream: &mut TcpStream, message: Value) {
    let mut line = serde_json::to_string(&message).expect("Failed to serialize message");
    line.push('\n');
    stream.write_all(line.as_bytes()).expect("Failed to write message");
}

/// Reads lines until the reply for `index` arrives; pushes may interleave.
fn read_reply(reader: &mut BufReader<TcpStream>, index: u64) -> Value {
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).expect("Failed to read reply");
        assert!(read > 0, "editor connection closed");
        let value: Value = serde_json::from_str(&line).expect("Failed to parse reply JSON");
        if value[0] == json!(index) {
            return value[1].clone();
        }
    }
}

fn buffer_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
                .filter(|name| {
                    name.ends_with("_tmp")
                        || name.ends_with("_tmp_sessions")
                        || name.ends_with("_tomato")
                })
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(50));
    }
    false
}

fn session_events(stream: &mut TcpStream, filename: &str) {
    send(
        stream,
        json!([0, {"event": "bufEnter", "ts": 0, "data": {"filename": filename, "filetype": "python"}}]),
    );
    send(stream, json!([0, {"event": "ping", "ts": 10}]));
    send(stream, json!([0, {"event": "ping", "ts": 20}]));
    send(stream, json!([0, {"event": "bufLeave", "ts": 30}]));
}

#[test]
fn offline_daemon_buffers_flushed_sessions() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let buffer_dir = home.path().join("buffer");
    let editor_port = free_port();
    let _guard = spawn_daemon(home.path(), &buffer_dir, editor_port, free_port());

    let mut stream = connect_editor(editor_port, Duration::from_secs(5));
    session_events(&mut stream, "a.py");

    assert!(
        wait_until(Duration::from_secs(5), || !buffer_entries(&buffer_dir).is_empty()),
        "no buffer entry was written"
    );
    let name = buffer_entries(&buffer_dir).remove(0);
    assert!(name.ends_with("_tmp"), "unexpected entry {}", name);

    let content = std::fs::read_to_string(buffer_dir.join(&name)).expect("read entry");
    let payload: Value = serde_json::from_str(&content).expect("entry JSON");
    assert_eq!(
        payload["history"],
        json!([{
            "filename": "a.py",
            "filetype": "python",
            "project": "na",
            "start": 0,
            "end": 30,
            "lastTick": 20,
            "ticks": 2
        }])
    );
    assert_eq!(payload["tomatos"], json!([]));
}

#[test]
fn timer_controls_are_answered_over_tcp() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let buffer_dir = home.path().join("buffer");
    let editor_port = free_port();
    let _guard = spawn_daemon(home.path(), &buffer_dir, editor_port, free_port());

    let mut stream = connect_editor(editor_port, Duration::from_secs(5));
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

    send(&mut stream, json!([1, {"event": "timerPause", "ts": 0}]));
    assert_eq!(read_reply(&mut reader, 1), json!({"ok": 1, "err": "not_running"}));

    send(&mut stream, json!([2, {"event": "tomatoStart", "ts": 0}]));
    assert_eq!(read_reply(&mut reader, 2), json!({"ok": 0}));

    send(&mut stream, json!([3, {"event": "timerQuery", "ts": 0}]));
    let snapshot = read_reply(&mut reader, 3);
    assert_eq!(snapshot["state"], "running");
    assert!(snapshot["tEnd"].as_i64().is_some());

    send(&mut stream, json!([4, {"event": "timerStart", "ts": 0}]));
    assert_eq!(
        read_reply(&mut reader, 4),
        json!({"ok": 1, "err": "already_running"})
    );
}

#[test]
fn malformed_editor_lines_do_not_break_the_connection() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let buffer_dir = home.path().join("buffer");
    let editor_port = free_port();
    let _guard = spawn_daemon(home.path(), &buffer_dir, editor_port, free_port());

    let mut stream = connect_editor(editor_port, Duration::from_secs(5));
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

    for _ in 0..20 {
        stream.write_all(b"{not json\n").expect("write garbage");
        send(&mut stream, json!([9, {"event": "bogus", "ts": 0}]));
        send(&mut stream, json!([9, {"event": "ping"}]));
    }
    stream.write_all(b"\n").expect("write blank line");

    send(&mut stream, json!([10, {"event": "timerQuery", "ts": 0}]));
    assert_eq!(read_reply(&mut reader, 10)["state"], "idle");
}

#[cfg(unix)]
#[test]
fn sigterm_persists_unflushed_history() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let buffer_dir = home.path().join("buffer");
    let editor_port = free_port();
    let mut guard =
        spawn_daemon_with_flush(home.path(), &buffer_dir, editor_port, free_port(), 3600);

    let mut stream = connect_editor(editor_port, Duration::from_secs(5));
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
    session_events(&mut stream, "late.py");
    // A reply proves the events ahead of it reached the runtime.
    send(&mut stream, json!([1, {"event": "timerQuery", "ts": 40}]));
    read_reply(&mut reader, 1);
    assert!(buffer_entries(&buffer_dir).is_empty());

    let status = Command::new("kill")
        .args(["-TERM", &guard.child.id().to_string()])
        .status()
        .expect("Failed to send SIGTERM");
    assert!(status.success());
    let exit = guard.child.wait().expect("daemon exit");
    assert!(exit.success());

    let entries = buffer_entries(&buffer_dir);
    assert_eq!(entries.len(), 1);
    let content = std::fs::read_to_string(buffer_dir.join(&entries[0])).expect("read entry");
    let payload: Value = serde_json::from_str(&content).expect("entry JSON");
    assert_eq!(payload["history"][0]["filename"], "late.py");
}

/// Accepts one connection and acknowledges every save, forwarding requests.
fn spawn_fake_remote(listener: TcpListener, requests: mpsc::Sender<RemoteRequest>) {
    thread::spawn(move || {
        let Ok((stream, _)) = listener.accept() else {
            return;
        };
        let mut writer = stream.try_clone().expect("clone remote stream");
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else {
                break;
            };
            let request: RemoteRequest = serde_json::from_str(&line).expect("remote request");
            let response = match &request {
                RemoteRequest::Hello { .. } => RemoteResponse::Welcome {
                    protocol_version: PROTOCOL_VERSION,
                },
                _ => RemoteResponse::Saved(SaveReply::accepted()),
            };
            let mut out = serde_json::to_string(&response).expect("remote response");
            out.push('\n');
            if writer.write_all(out.as_bytes()).is_err() {
                break;
            }
            if requests.send(request).is_err() {
                break;
            }
        }
    });
}

fn session_record(filename: &str, start: i64) -> Value {
    json!({
        "filename": filename,
        "filetype": "rust",
        "project": "digitme",
        "start": start,
        "end": start + 30,
        "lastTick": start + 20,
        "ticks": 2
    })
}

#[test]
fn buffered_entries_are_replayed_once_remote_is_live() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let buffer_dir = home.path().join("buffer");
    std::fs::create_dir_all(&buffer_dir).expect("create buffer dir");

    std::fs::write(
        buffer_dir.join("100_tmp"),
        json!({"ts": 100, "history": [session_record("first.rs", 0)], "tomatos": []}).to_string(),
    )
    .expect("write combined entry");
    std::fs::write(
        buffer_dir.join("200_tmp_sessions.replaying"),
        json!([session_record("second.rs", 100)]).to_string(),
    )
    .expect("write claimed entry");

    let remote = TcpListener::bind("127.0.0.1:0").expect("bind fake remote");
    let remote_port = remote.local_addr().expect("remote addr").port();
    let (request_tx, request_rx) = mpsc::channel();
    spawn_fake_remote(remote, request_tx);

    let editor_port = free_port();
    let _guard = spawn_daemon(home.path(), &buffer_dir, editor_port, remote_port);

    let hello = request_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("hello");
    assert!(matches!(hello, RemoteRequest::Hello { .. }));

    let mut replayed = Vec::new();
    for _ in 0..2 {
        match request_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("save request")
        {
            RemoteRequest::SaveSessions { records } => {
                replayed.extend(records.into_iter().map(|record| record.filename))
            }
            other => panic!("unexpected request {:?}", other),
        }
    }
    assert_eq!(replayed, vec!["first.rs", "second.rs"]);

    assert!(
        wait_until(Duration::from_secs(5), || buffer_entries(&buffer_dir).is_empty()),
        "replayed entries were not deleted"
    );
}
