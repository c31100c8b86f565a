use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

struct StationProcess {
    child: Child,
    addr: String,
}

impl StationProcess {
    fn start(extra: &[&str]) -> Self {
        let bin_path = env!("CARGO_BIN_EXE_screw-station");

        let listener = TcpListener::bind("127.0.0.1:0")
            .expect("Failed to bind ephemeral port for integration test");
        let addr = listener
            .local_addr()
            .expect("Failed to resolve bound address");
        let bind_addr = format!("127.0.0.1:{}", addr.port());
        drop(listener);

        let child = Command::new(bin_path)
            .args(["--sim", "--bind", &bind_addr])
            .args(extra)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to start station");

        // Loop until port is open (up to 5s)
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if TcpStream::connect(&bind_addr).is_ok() {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }

        Self {
            child,
            addr: bind_addr,
        }
    }

    fn connect(&self) -> Client {
        let stream = TcpStream::connect(&self.addr).expect("Failed to connect to station");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Client {
            reader: BufReader::new(stream.try_clone().unwrap()),
            stream,
        }
    }
}

impl Drop for StationProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    fn ask(&mut self, request: Value) -> Value {
        writeln!(self.stream, "{}", request).unwrap();
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        serde_json::from_str(&line).unwrap_or_else(|e| panic!("bad reply {line:?}: {e}"))
    }
}

#[test]
fn status_and_manual_relay_when_idle() {
    let station = StationProcess::start(&[]);
    let mut client = station.connect();

    let hello = client.ask(serde_json::json!({
        "type": "hello",
        "protocol_version": { "major": 1, "minor": 0 },
        "client_id": "integration"
    }));
    assert_eq!(hello["type"], "ack");

    let status = client.ask(serde_json::json!({ "type": "status" }));
    assert_eq!(status["type"], "status");
    assert_eq!(status["status"], "idle");
    assert_eq!(status["cycle_running"], false);
    assert_eq!(status["sensors"]["cyl_top"], true);

    let on = client.ask(serde_json::json!({
        "type": "relay", "name": "cyl_up", "action": "on"
    }));
    assert_eq!(on["type"], "ack");

    // Interlocked partner pre-empts the first relay.
    let down = client.ask(serde_json::json!({
        "type": "relay", "name": "cyl_down", "action": "on"
    }));
    assert_eq!(down["type"], "ack");
    let status = client.ask(serde_json::json!({ "type": "status" }));
    assert_eq!(status["relays"]["cyl_up"], false);
    assert_eq!(status["relays"]["cyl_down"], true);

    let unknown = client.ask(serde_json::json!({
        "type": "relay", "name": "nope", "action": "pulse", "ms": 10
    }));
    assert_eq!(unknown["code"], "unknown_channel");
}

#[test]
fn manual_commands_are_busy_while_cycle_runs() {
    let station = StationProcess::start(&[]);
    let mut client = station.connect();

    let started = client.ask(serde_json::json!({ "type": "start" }));
    assert_eq!(started["status"], "running");
    let again = client.ask(serde_json::json!({ "type": "start" }));
    assert_eq!(again["status"], "running");

    let busy = client.ask(serde_json::json!({
        "type": "relay", "name": "feeder", "action": "pulse"
    }));
    assert_eq!(busy["type"], "error");
    assert_eq!(busy["code"], "busy");

    let stopped = client.ask(serde_json::json!({ "type": "stop" }));
    assert_eq!(stopped["status"], "stopped");

    let status = client.ask(serde_json::json!({ "type": "status" }));
    assert_eq!(status["runs_started"], 1);
    let relays = status["relays"].as_object().unwrap();
    assert!(relays.values().all(|on| on.as_bool() == Some(false)), "{relays:?}");
}

#[test]
fn simulated_torque_controller_answers() {
    let station = StationProcess::start(&[]);
    let mut client = station.connect();

    let torque = client.ask(serde_json::json!({ "type": "torque_status" }));
    assert_eq!(torque["type"], "torque");
    assert_eq!(torque["data"]["mode"], 1);
}

#[test]
#[cfg(unix)]
fn sigterm_runs_orderly_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let audit_arg = audit_path.to_string_lossy().into_owned();
    let mut station = StationProcess::start(&[
        "--autostart",
        "--sim-pedal-ms",
        "300",
        "--audit-log",
        &audit_arg,
    ]);
    thread::sleep(Duration::from_millis(700));

    let pid = station.child.id().to_string();
    let sent = Command::new("kill")
        .args(["-TERM", &pid])
        .status()
        .expect("Failed to run kill");
    assert!(sent.success());

    let deadline = Instant::now() + Duration::from_secs(5);
    let status = loop {
        if let Some(status) = station.child.try_wait().unwrap() {
            break status;
        }
        assert!(Instant::now() < deadline, "station ignored SIGTERM");
        thread::sleep(Duration::from_millis(20));
    };
    assert!(status.success(), "{status:?}");

    let audit = std::fs::read_to_string(&audit_path).unwrap();
    let entries: Vec<Value> = audit
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let cycle_end = entries
        .iter()
        .find(|e| e["event_type"] == "cycle_ended")
        .expect("no cycle_ended entry");
    assert_eq!(cycle_end["details"]["kind"], "stopped");
    let last = entries.last().unwrap();
    assert_eq!(last["event_type"], "system_shutdown");
    assert_eq!(last["details"]["reason"], "signal");
}
