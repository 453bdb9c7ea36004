//! End-to-end scenarios against the request-servicing core, driven at
//! the `Connection` level (no `ConnectionPool`/`ppoll` involved, since
//! that wait has no timeout and would make a hung test un-killable;
//! instead the test drives `Connection::tick` directly in a bounded
//! loop, which is exactly what one pool iteration does).

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use twopence_core::codec::{self, CommandRequest, FileXferRequest, PacketType};
use twopence_core::connection::{Connection, ListenerConnection};
use twopence_core::transport::{UnixSocketListener, UnixTransport};
use twopence_core::userdb::SystemUserDb;

const HWM: usize = 256 * 1024;
const DEFAULT_TIMEOUT_SECS: u32 = 60;
const BUDGET: Duration = Duration::from_secs(5);

fn socket_path(tag: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("twopence-scenario-{tag}-{}.sock", std::process::id()));
    p
}

/// The user running the test process, resolved the same way
/// `twopenced` resolves any other user — no fake table, this is the
/// real `SystemUserDb`.
fn current_user_name() -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::current())
        .expect("getpwuid on the running uid should not error")
        .expect("the running uid must resolve to a passwd entry")
        .name
}

/// Accept one connection, driving both the listener and the fresh
/// connection's `tick` until something is accepted or the deadline
/// passes.
fn accept_connection(listener: &mut ListenerConnection<UnixSocketListener>, deadline: Instant) -> Connection<UnixTransport> {
    loop {
        if let Some(conn) = listener.tick(HWM, DEFAULT_TIMEOUT_SECS).unwrap() {
            return conn;
        }
        assert!(Instant::now() < deadline, "server never accepted the connection");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Read every wire frame the peer has sent so far that is available
/// without blocking, parsing each into `(kind, tid, cid, payload)`.
fn drain_client(client: &mut UnixStream) -> Vec<(PacketType, u16, u16, Vec<u8>)> {
    let mut raw = Vec::new();
    let mut scratch = [0u8; 4096];
    loop {
        match client.read(&mut scratch) {
            Ok(0) => break,
            Ok(n) => raw.extend_from_slice(&scratch[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }

    let mut out = Vec::new();
    let mut rest = &raw[..];
    while rest.len() >= codec::HEADER_LEN {
        let kind_byte = rest[0];
        let tid = u16::from_be_bytes([rest[1], rest[2]]);
        let cid = u16::from_be_bytes([rest[3], rest[4]]);
        let length = u16::from_be_bytes([rest[5], rest[6]]) as usize;
        if rest.len() < codec::HEADER_LEN + length {
            break;
        }
        let payload = rest[codec::HEADER_LEN..codec::HEADER_LEN + length].to_vec();
        let kind = match kind_byte {
            b'M' => PacketType::Major,
            b'm' => PacketType::Minor,
            b'D' => PacketType::Data,
            b'E' => PacketType::Eof,
            b'T' => PacketType::Timeout,
            other => panic!("unexpected packet type byte in server reply: {other}"),
        };
        out.push((kind, tid, cid, payload));
        rest = &rest[codec::HEADER_LEN + length..];
    }
    out
}

fn status_of(payload: &[u8]) -> i32 {
    i32::from_be_bytes(payload.try_into().expect("status payload is 4 bytes"))
}

/// Run `tick` repeatedly until `pred` holds over everything read so
/// far, or the deadline passes.
fn pump_until(
    conn: &mut Connection<UnixTransport>,
    client: &mut UnixStream,
    db: &SystemUserDb,
    mut pred: impl FnMut(&[(PacketType, u16, u16, Vec<u8>)]) -> bool,
) -> Vec<(PacketType, u16, u16, Vec<u8>)> {
    let deadline = Instant::now() + BUDGET;
    let mut seen = Vec::new();
    loop {
        conn.tick(db).unwrap();
        seen.extend(drain_client(client));
        if pred(&seen) {
            return seen;
        }
        assert!(Instant::now() < deadline, "scenario did not complete in time; saw: {seen:?}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn scenario_run_echo() {
    let path = socket_path("echo");
    let mut listener = ListenerConnection::new(UnixSocketListener::bind(&path).unwrap());
    let mut client = UnixStream::connect(&path).unwrap();
    client.set_nonblocking(true).unwrap();

    let deadline = Instant::now() + BUDGET;
    let mut conn = accept_connection(&mut listener, deadline);

    let req = CommandRequest {
        user: current_user_name(),
        command: "echo hi".into(),
        env: vec![],
        timeout_secs: 5,
        request_tty: false,
    };
    let wire = codec::build(PacketType::Command, 0, 0, &codec::build_command(&req).unwrap()).unwrap();
    client.write_all(&wire).unwrap();

    let db = SystemUserDb;
    let seen = pump_until(&mut conn, &mut client, &db, |seen| {
        seen.iter().any(|(k, ..)| *k == PacketType::Minor)
    });

    let major = seen.iter().find(|(k, ..)| *k == PacketType::Major).unwrap();
    assert_eq!(status_of(&major.3), 0);

    let stdout_data: Vec<u8> = seen
        .iter()
        .filter(|(k, _, cid, _)| *k == PacketType::Data && *cid == codec::CID_STDOUT)
        .flat_map(|(_, _, _, p)| p.clone())
        .collect();
    assert_eq!(stdout_data, b"hi\n");

    let minor = seen.iter().find(|(k, ..)| *k == PacketType::Minor).unwrap();
    assert_eq!(status_of(&minor.3), 0);

    assert!(seen
        .iter()
        .any(|(k, _, cid, _)| *k == PacketType::Eof && *cid == codec::CID_STDOUT));
    assert!(seen
        .iter()
        .any(|(k, _, cid, _)| *k == PacketType::Eof && *cid == codec::CID_STDERR));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn scenario_nonzero_exit() {
    let path = socket_path("exit7");
    let mut listener = ListenerConnection::new(UnixSocketListener::bind(&path).unwrap());
    let mut client = UnixStream::connect(&path).unwrap();
    client.set_nonblocking(true).unwrap();

    let deadline = Instant::now() + BUDGET;
    let mut conn = accept_connection(&mut listener, deadline);

    let req = CommandRequest {
        user: current_user_name(),
        command: "exit 7".into(),
        env: vec![],
        timeout_secs: 5,
        request_tty: false,
    };
    let wire = codec::build(PacketType::Command, 0, 0, &codec::build_command(&req).unwrap()).unwrap();
    client.write_all(&wire).unwrap();

    let db = SystemUserDb;
    let seen = pump_until(&mut conn, &mut client, &db, |seen| {
        seen.iter().any(|(k, ..)| *k == PacketType::Minor)
    });

    let minor = seen.iter().find(|(k, ..)| *k == PacketType::Minor).unwrap();
    assert_eq!(status_of(&minor.3), 7);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn scenario_unknown_user_fails_before_any_channel() {
    let path = socket_path("unknown-user");
    let mut listener = ListenerConnection::new(UnixSocketListener::bind(&path).unwrap());
    let mut client = UnixStream::connect(&path).unwrap();
    client.set_nonblocking(true).unwrap();

    let deadline = Instant::now() + BUDGET;
    let mut conn = accept_connection(&mut listener, deadline);

    let req = CommandRequest {
        user: "nobody-such-user-exists".into(),
        command: "echo hi".into(),
        env: vec![],
        timeout_secs: 5,
        request_tty: false,
    };
    let wire = codec::build(PacketType::Command, 0, 0, &codec::build_command(&req).unwrap()).unwrap();
    client.write_all(&wire).unwrap();

    let db = SystemUserDb;
    let seen = pump_until(&mut conn, &mut client, &db, |seen| !seen.is_empty());

    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, PacketType::Major);
    assert_eq!(status_of(&seen[0].3), libc::ENOENT);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn scenario_inject_then_extract_round_trips_bytes() {
    let path = socket_path("inject-extract");
    let mut listener = ListenerConnection::new(UnixSocketListener::bind(&path).unwrap());
    let user = current_user_name();
    let home = std::env::temp_dir().join(format!("twopence-inject-extract-{}", std::process::id()));
    std::fs::create_dir_all(&home).unwrap();

    // INJECT: push "hello world" into a file under `home`.
    {
        let mut client = UnixStream::connect(&path).unwrap();
        client.set_nonblocking(true).unwrap();
        let deadline = Instant::now() + BUDGET;
        let mut conn = accept_connection(&mut listener, deadline);

        let xfer = FileXferRequest {
            user: user.clone(),
            path: home.join("payload.txt").to_str().unwrap().to_owned(),
            mode: 0o644,
        };
        let wire = codec::build(PacketType::Inject, 0, 0, &codec::build_file_xfer(&xfer).unwrap()).unwrap();
        client.write_all(&wire).unwrap();

        let db = SystemUserDb;
        let seen = pump_until(&mut conn, &mut client, &db, |seen| {
            seen.iter().any(|(k, ..)| *k == PacketType::Major)
        });
        let major = seen.iter().find(|(k, ..)| *k == PacketType::Major).unwrap();
        assert_eq!(status_of(&major.3), 0, "inject should be accepted");
        let tid = major.1;

        let data = codec::build(PacketType::Data, tid, codec::CID_FILE, b"hello world").unwrap();
        let eof = codec::build(PacketType::Eof, tid, codec::CID_FILE, &[]).unwrap();
        client.write_all(&data).unwrap();
        client.write_all(&eof).unwrap();

        pump_until(&mut conn, &mut client, &db, |seen| {
            seen.iter().any(|(k, ..)| *k == PacketType::Minor)
        });
    }

    assert_eq!(std::fs::read(home.join("payload.txt")).unwrap(), b"hello world");

    // EXTRACT: pull it back and confirm it round-trips.
    {
        let mut client = UnixStream::connect(&path).unwrap();
        client.set_nonblocking(true).unwrap();
        let deadline = Instant::now() + BUDGET;
        let mut conn = accept_connection(&mut listener, deadline);

        let xfer = FileXferRequest {
            user,
            path: home.join("payload.txt").to_str().unwrap().to_owned(),
            mode: 0,
        };
        let wire = codec::build(PacketType::Extract, 0, 0, &codec::build_file_xfer(&xfer).unwrap()).unwrap();
        client.write_all(&wire).unwrap();

        let db = SystemUserDb;
        let seen = pump_until(&mut conn, &mut client, &db, |seen| {
            seen.iter().any(|(k, ..)| *k == PacketType::Minor)
        });

        let received: Vec<u8> = seen
            .iter()
            .filter(|(k, _, cid, _)| *k == PacketType::Data && *cid == codec::CID_FILE)
            .flat_map(|(_, _, _, p)| p.clone())
            .collect();
        assert_eq!(received, b"hello world");
    }

    let _ = std::fs::remove_dir_all(&home);
    let _ = std::fs::remove_file(&path);
}
