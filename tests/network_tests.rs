//! End-to-end tests over real TCP connections: client verbs, protocol
//! errors, and role enforcement.

use repkv::thread_pool::{SharedQueueThreadPool, ThreadPool};
use repkv::{Client, Config, Role, Server, Store};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> Config {
    Config::builder()
        .data_dir(dir.path())
        .checkpoint_interval_secs(3600)
        .compaction_enabled(false)
        .build()
}

/// grab an ephemeral port the server can then bind
fn free_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// spin up a server on a fresh port, returning its address and a handle to
/// the shared store
fn start_server(dir: &TempDir, role: Role) -> (SocketAddr, Store) {
    let addr = free_port();
    let store = Store::open(test_config(dir), role).unwrap();
    let server_store = store.clone();
    thread::spawn(move || {
        let pool = SharedQueueThreadPool::new(4).unwrap();
        let server = Server::new(server_store, pool);
        server.run(addr).unwrap();
    });
    wait_until_ready(addr);
    (addr, store)
}

fn wait_until_ready(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("server at {} never became reachable", addr);
}

/// send one raw request line and return the raw response line
fn raw_request(addr: SocketAddr, line: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(line).unwrap();
    stream.write_all(b"\n").unwrap();
    let mut response = Vec::new();
    BufReader::new(&stream)
        .read_until(b'\n', &mut response)
        .unwrap();
    while response.last() == Some(&b'\n') || response.last() == Some(&b'\r') {
        response.pop();
    }
    response
}

#[test]
fn put_get_delete_over_the_wire() {
    let dir = TempDir::new().unwrap();
    let (addr, _store) = start_server(&dir, Role::Master);
    let mut client = Client::connect(addr).unwrap();

    client.put(b"alpha", b"1").unwrap();
    assert_eq!(client.read(b"alpha").unwrap(), Some(b"1".to_vec()));

    assert!(client.delete(b"alpha").unwrap());
    assert_eq!(client.read(b"alpha").unwrap(), None);
    assert!(!client.delete(b"alpha").unwrap());
}

#[test]
fn values_with_whitespace_and_pipes_survive_the_wire() {
    let dir = TempDir::new().unwrap();
    let (addr, _store) = start_server(&dir, Role::Master);
    let mut client = Client::connect(addr).unwrap();

    let key = b"key with spaces".to_vec();
    let value = b"line one\nline two\ttabbed | piped \\ backslashed".to_vec();
    client.put(&key, &value).unwrap();
    assert_eq!(client.read(&key).unwrap(), Some(value));
}

#[test]
fn batchput_and_range_over_the_wire() {
    let dir = TempDir::new().unwrap();
    let (addr, _store) = start_server(&dir, Role::Master);
    let mut client = Client::connect(addr).unwrap();

    client
        .batch_put(
            &[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()],
            &[b"1".to_vec(), b"2 with space".to_vec(), b"3".to_vec()],
        )
        .unwrap();

    let pairs = client.read_range(b"a", b"b").unwrap();
    assert_eq!(
        pairs,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2 with space".to_vec()),
        ]
    );

    // no key in range
    assert!(client.read_range(b"x", b"z").unwrap().is_empty());
}

#[test]
fn many_requests_on_one_connection() {
    let dir = TempDir::new().unwrap();
    let (addr, _store) = start_server(&dir, Role::Master);
    let mut client = Client::connect(addr).unwrap();

    for i in 0..100 {
        client
            .put(format!("k{}", i).as_bytes(), format!("v{}", i).as_bytes())
            .unwrap();
    }
    for i in 0..100 {
        assert_eq!(
            client.read(format!("k{}", i).as_bytes()).unwrap(),
            Some(format!("v{}", i).into_bytes())
        );
    }
}

#[test]
fn unknown_command_is_a_protocol_error() {
    let dir = TempDir::new().unwrap();
    let (addr, _store) = start_server(&dir, Role::Master);
    let response = raw_request(addr, b"FROB key");
    assert!(response.starts_with(b"ERROR"), "got {:?}", response);
}

#[test]
fn malformed_arguments_are_protocol_errors() {
    let dir = TempDir::new().unwrap();
    let (addr, _store) = start_server(&dir, Role::Master);
    assert!(raw_request(addr, b"PUT").starts_with(b"ERROR"));
    assert!(raw_request(addr, b"READRANGE onlyone").starts_with(b"ERROR"));
    assert!(raw_request(addr, b"BATCHPUT a||b 1").starts_with(b"ERROR"));
}

#[test]
fn master_rejects_replicate_commands() {
    let dir = TempDir::new().unwrap();
    let (addr, _store) = start_server(&dir, Role::Master);
    let response = raw_request(addr, b"REPLICATE PUT k v");
    assert!(response.starts_with(b"ERROR"), "got {:?}", response);
}

#[test]
fn replica_rejects_client_mutations_but_serves_reads() {
    let dir = TempDir::new().unwrap();
    let (addr, _store) = start_server(&dir, Role::Replica);

    // client writes are refused
    assert!(raw_request(addr, b"PUT k v").starts_with(b"ERROR"));
    assert!(raw_request(addr, b"DELETE k").starts_with(b"ERROR"));
    assert!(raw_request(addr, b"BATCHPUT a 1").starts_with(b"ERROR"));

    // the replication channel is not
    assert_eq!(raw_request(addr, b"REPLICATE PUT k v"), b"OK".to_vec());

    let mut client = Client::connect(addr).unwrap();
    assert_eq!(client.read(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn replicated_batch_and_delete_apply_on_replica() {
    let dir = TempDir::new().unwrap();
    let (addr, store) = start_server(&dir, Role::Replica);

    assert_eq!(
        raw_request(addr, b"REPLICATE BATCHPUT a||b 1||2"),
        b"OK".to_vec()
    );
    assert_eq!(raw_request(addr, b"REPLICATE DELETE a"), b"OK".to_vec());
    // deleting what is already gone still acknowledges
    assert_eq!(raw_request(addr, b"REPLICATE DELETE a"), b"OK".to_vec());

    assert_eq!(store.read(b"a").unwrap(), None);
    assert_eq!(store.read(b"b").unwrap(), Some(b"2".to_vec()));
}
