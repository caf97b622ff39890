//! End-to-end session tests against a real listener.
//!
//! Each test boots the broker on an ephemeral port with `sh`-based
//! compiler profiles, speaks the wire protocol over a plain TCP
//! socket, and asserts on the exact outbound frame sequence.
//!
//! Test command: `cargo test -p corral-daemon --test session_flow`

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use corral_core::config::{BrokerConfig, CompilerProfile, JailProfile, SystemConfig};
use corral_core::protocol::{Frame, FrameCodec, encode_frame_into};
use corral_daemon::server::Broker;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

fn profile(name: &str, compile: &[&str], run: &[&str], jail: &str) -> CompilerProfile {
    CompilerProfile {
        name: name.to_string(),
        version_command: Vec::new(),
        compile_command: argv(compile),
        run_command: argv(run),
        output_file: "prog.cc".to_string(),
        switches: Vec::new(),
        jail: jail.to_string(),
        displayable: true,
    }
}

fn jail(program_duration: Duration, kill_wait: Duration, warn: u64, kill: u64) -> JailProfile {
    JailProfile {
        jail_command: Vec::new(),
        compile_time_limit: Duration::from_secs(10),
        program_duration,
        kill_wait,
        output_limit_warn: warn,
        output_limit_kill: kill,
    }
}

/// A running broker plus the scratch directories backing it.
struct TestBroker {
    addr: SocketAddr,
    _base: tempfile::TempDir,
}

async fn start_broker(max_connections: usize) -> TestBroker {
    let base = tempfile::tempdir().unwrap();

    let mut jails = HashMap::new();
    jails.insert(
        "default".to_string(),
        jail(Duration::from_secs(10), Duration::from_secs(5), 1 << 20, 1 << 21),
    );
    jails.insert(
        "quick".to_string(),
        jail(Duration::from_millis(300), Duration::from_millis(300), 1 << 20, 1 << 21),
    );
    jails.insert(
        "tight".to_string(),
        jail(Duration::from_secs(10), Duration::from_secs(5), 4 * 1024, 16 * 1024),
    );

    let mut noop = profile("noop", &["true"], &["true"], "default");
    noop.version_command = argv(&["sh", "-c", "echo 1.0.0"]);

    let mut hidden = profile("hidden", &["true"], &["true"], "default");
    hidden.displayable = false;
    hidden.version_command = argv(&["sh", "-c", "echo 9.9"]);

    let mut broken_version = profile("broken-version", &["true"], &["true"], "default");
    broken_version.version_command = argv(&["false"]);

    let config = BrokerConfig {
        system: SystemConfig {
            listen_port: 0,
            max_connections,
            basedir: base.path().join("run"),
            storedir: base.path().join("store"),
        },
        compilers: vec![
            noop,
            hidden,
            broken_version,
            profile("staged", &["test", "-f", "store/prog.cc"], &["true"], "default"),
            profile(
                "cc-fail",
                &["sh", "-c", "echo nope >&2; exit 4"],
                &["sh", "-c", "echo must-not-run"],
                "default",
            ),
            profile("cat", &["true"], &["sh", "-c", "cat"], "default"),
            profile("spin", &["true"], &["sleep", "30"], "quick"),
            profile(
                "flood",
                &["true"],
                &["sh", "-c", "trap '' XFSZ; while :; do echo 0123456789abcdef; done"],
                "tight",
            ),
            profile("slow", &["true"], &["sleep", "0.5"], "default"),
        ],
        switches: HashMap::new(),
        jails,
    };
    config.validate().unwrap();

    let broker = Broker::bind(Arc::new(config)).await.unwrap();
    let addr = broker.local_addr().unwrap();
    tokio::spawn(broker.run());

    TestBroker { addr, _base: base }
}

async fn send_frames(stream: &mut TcpStream, frames: &[(&str, &[u8])]) {
    let mut wire = Vec::new();
    for (command, payload) in frames {
        encode_frame_into(&mut wire, command, payload);
    }
    stream.write_all(&wire).await.unwrap();
}

/// Reads outbound frames until the server closes the connection.
async fn read_to_eof(stream: &mut TcpStream) -> Vec<Frame> {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    let mut frames = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
    }
    frames
}

fn commands(frames: &[Frame]) -> Vec<String> {
    frames
        .iter()
        .map(|f| {
            if f.command == "Control" {
                format!("Control:{}", String::from_utf8_lossy(&f.payload))
            } else {
                f.command.clone()
            }
        })
        .collect()
}

fn payload_of<'a>(frames: &'a [Frame], command: &str) -> Vec<u8> {
    frames
        .iter()
        .filter(|f| f.command == command)
        .flat_map(|f| f.payload.to_vec())
        .collect::<Vec<u8>>()
}

async fn run_session(addr: SocketAddr, frames: &[(&str, &[u8])]) -> Vec<Frame> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_frames(&mut stream, frames).await;
    read_to_eof(&mut stream).await
}

#[tokio::test]
async fn hello_world_exits_zero() {
    let broker = start_broker(4).await;
    let frames = run_session(
        broker.addr,
        &[
            ("SourceFileName", b"a.cpp"),
            ("Source", b"int main(){return 0;}"),
            ("Control", b"compiler=noop"),
            ("Control", b"run"),
        ],
    )
    .await;

    assert_eq!(
        commands(&frames),
        ["Control:Start", "ExitCode", "Control:Finish"]
    );
    assert_eq!(frames[1].payload.as_ref(), b"0");
}

#[tokio::test]
async fn unnamed_source_is_staged_under_the_output_file() {
    let broker = start_broker(4).await;
    // No SourceFileName at all: the bytes land under the compiler's
    // output_file, which the compile command checks for.
    let frames = run_session(
        broker.addr,
        &[
            ("Source", b"int main(){}"),
            ("Control", b"compiler=staged"),
            ("Control", b"run"),
        ],
    )
    .await;

    assert_eq!(
        commands(&frames),
        ["Control:Start", "ExitCode", "Control:Finish"]
    );
    assert_eq!(frames[1].payload.as_ref(), b"0");
}

#[tokio::test]
async fn compile_error_skips_the_run_phase() {
    let broker = start_broker(4).await;
    let frames = run_session(
        broker.addr,
        &[
            ("Source", b"int main(){X;}"),
            ("Control", b"compiler=cc-fail"),
            ("Control", b"run"),
        ],
    )
    .await;

    let cmds = commands(&frames);
    assert_eq!(cmds.first().map(String::as_str), Some("Control:Start"));
    assert_eq!(cmds.last().map(String::as_str), Some("Control:Finish"));
    assert!(!cmds.contains(&"StdOut".to_string()));

    assert_eq!(payload_of(&frames, "CompilerMessageE"), b"nope\n");
    assert_eq!(payload_of(&frames, "ExitCode"), b"4");
}

#[tokio::test]
async fn stdin_is_piped_to_the_run_phase() {
    let broker = start_broker(4).await;
    let frames = run_session(
        broker.addr,
        &[
            ("Source", b"unused"),
            ("StdIn", b"hel"),
            ("StdIn", b"lo"),
            ("Control", b"compiler=cat"),
            ("Control", b"run"),
        ],
    )
    .await;

    assert_eq!(payload_of(&frames, "StdOut"), b"hello");
    assert_eq!(payload_of(&frames, "ExitCode"), b"0");
}

#[tokio::test]
async fn runaway_program_is_signalled_within_the_limits() {
    let broker = start_broker(4).await;
    let started = Instant::now();
    let frames = run_session(
        broker.addr,
        &[
            ("Source", b"int main(){for(;;);}"),
            ("Control", b"compiler=spin"),
            ("Control", b"run"),
        ],
    )
    .await;
    let elapsed = started.elapsed();

    let cmds = commands(&frames);
    assert_eq!(cmds.last().map(String::as_str), Some("Control:Finish"));
    let signal = payload_of(&frames, "Signal");
    assert!(
        signal == b"XCPU" || signal == b"KILL",
        "unexpected signal {signal:?}"
    );
    assert!(elapsed >= Duration::from_millis(300), "finished in {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");
}

#[tokio::test]
async fn output_flood_is_killed_and_bounded() {
    let broker = start_broker(4).await;
    let frames = run_session(
        broker.addr,
        &[
            ("Source", b"spam"),
            ("Control", b"compiler=flood"),
            ("Control", b"run"),
        ],
    )
    .await;

    assert_eq!(payload_of(&frames, "Signal"), b"KILL");
    let forwarded = payload_of(&frames, "StdOut").len();
    // Hard limit plus pipe buffering and in-flight chunks.
    assert!(forwarded <= 16 * 1024 + 256 * 1024, "forwarded {forwarded}");
}

#[tokio::test]
async fn version_lists_displayable_working_compilers() {
    let broker = start_broker(4).await;
    let frames = run_session(broker.addr, &[("Version", b"")]).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].command, "VersionResult");

    let listed: serde_json::Value = serde_json::from_slice(&frames[0].payload).unwrap();
    let names: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["name"].as_str().unwrap())
        .collect();
    // "hidden" is not displayable, "broken-version" exits non-zero,
    // and the rest carry no version command.
    assert_eq!(names, ["noop"]);
    assert_eq!(listed[0]["version"], "1.0.0");
}

#[tokio::test]
async fn unknown_compiler_closes_without_frames() {
    let broker = start_broker(4).await;
    let frames = run_session(
        broker.addr,
        &[
            ("Source", b"x"),
            ("Control", b"compiler=no-such-compiler"),
            ("Control", b"run"),
        ],
    )
    .await;
    assert!(frames.is_empty(), "got {:?}", commands(&frames));
}

#[tokio::test]
async fn traversing_source_name_closes_without_frames() {
    let broker = start_broker(4).await;
    let frames = run_session(
        broker.addr,
        &[
            ("SourceFileName", b"../../../evil.cc"),
            ("Source", b"x"),
            ("Control", b"compiler=noop"),
            ("Control", b"run"),
        ],
    )
    .await;
    assert!(frames.is_empty(), "got {:?}", commands(&frames));
}

#[tokio::test]
async fn admission_cap_delays_the_second_session() {
    let broker = start_broker(1).await;
    let addr = broker.addr;

    let first = tokio::spawn(async move {
        run_session(
            addr,
            &[
                ("Source", b"x"),
                ("Control", b"compiler=slow"),
                ("Control", b"run"),
            ],
        )
        .await
    });

    // Give the first session time to take the only permit.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let second = run_session(
        addr,
        &[
            ("Source", b"x"),
            ("Control", b"compiler=noop"),
            ("Control", b"run"),
        ],
    )
    .await;
    let waited = started.elapsed();

    let first = first.await.unwrap();
    assert_eq!(payload_of(&first, "ExitCode"), b"0");
    assert_eq!(payload_of(&second, "ExitCode"), b"0");
    // The second session cannot start until the first one's ~500ms run
    // releases the permit.
    assert!(waited >= Duration::from_millis(300), "waited only {waited:?}");
}

#[tokio::test]
async fn frames_split_across_writes_still_parse() {
    let broker = start_broker(4).await;
    let mut stream = TcpStream::connect(broker.addr).await.unwrap();

    let mut wire = Vec::new();
    encode_frame_into(&mut wire, "Source", b"int main(){return 0;}");
    encode_frame_into(&mut wire, "Control", b"compiler=noop");
    encode_frame_into(&mut wire, "Control", b"run");

    for byte in wire {
        stream.write_all(&[byte]).await.unwrap();
        stream.flush().await.unwrap();
    }

    let frames = read_to_eof(&mut stream).await;
    assert_eq!(
        commands(&frames),
        ["Control:Start", "ExitCode", "Control:Finish"]
    );
}
