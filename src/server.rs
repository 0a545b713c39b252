use crate::protocol::{self, Request};
use crate::store::{Role, Store};
use crate::thread_pool::ThreadPool;
use crate::Result;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, error, info};

/// A TCP socket server implementation over the key value store.
/// It listens for incoming newline-delimited requests, parses each one, and
/// processes it on a thread from the pool.
///
/// Each handler thread receives a clone of the [`Store`], which all share one
/// engine.
///
/// The server enforces the node's role: client mutations are rejected on a
/// replica, and `REPLICATE *` commands are rejected on a master.
///
/// # Example
/// Create and run a server listening on "127.0.0.1:4000" with 4 threads on a
/// shared-queue pool:
/// ```no_run
/// use repkv::{Config, Role, Server, Store};
/// use repkv::thread_pool::{SharedQueueThreadPool, ThreadPool};
/// # fn main() -> repkv::Result<()> {
/// let store = Store::open(Config::default(), Role::Master)?;
/// let pool = SharedQueueThreadPool::new(4)?;
/// let server = Server::new(store, pool);
/// server.run("127.0.0.1:4000")?;
/// # Ok(())
/// # }
/// ```
///
/// [`Store`]: ./struct.Store.html
pub struct Server<P: ThreadPool> {
    /// the store handling every request
    store: Store,
    /// a pool of threads that will perform work using a handle to the store
    pool: P,
}

impl<P: ThreadPool> Server<P> {
    /// Create a new `Server` over the given [`Store`] and [`ThreadPool`].
    ///
    /// [`Store`]: ./struct.Store.html
    /// [`ThreadPool`]: ./thread_pool/trait.ThreadPool.html
    pub fn new(store: Store, pool: P) -> Self {
        Server { store, pool }
    }

    /// starts a server listening on the given address.
    /// Each connection that comes in gets serviced on its own thread from the
    /// pool.
    ///
    /// # Errors
    /// returns [`KvError`] if the listener could not be bound
    ///
    /// [`KvError`]: ./enum.KvError.html
    pub fn run<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        info!(addr = %listener.local_addr()?, role = ?self.store.role(), "listening");
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let store = self.store.clone();
                    self.pool.spawn(move || {
                        if let Err(e) = serve(store, stream) {
                            error!("Error on serving client: {}", e);
                        }
                    });
                }
                Err(e) => error!("Connection failed: {}", e),
            }
        }
        Ok(())
    }
}

/// Reads newline-delimited requests off the given `tcp` stream, executes each
/// against the store, and writes one response back per request.
fn serve(store: Store, tcp: TcpStream) -> Result<()> {
    let peer_addr = tcp.peer_addr()?;
    let mut reader = BufReader::new(tcp.try_clone()?);
    let mut writer = BufWriter::new(tcp);
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.is_empty() {
            continue;
        }

        let response = process(&store, &line);
        writer.write_all(&response)?;
        writer.flush()?;
        debug!(peer = %peer_addr, "request served");
    }
    Ok(())
}

/// parse and execute one request line, producing the full response bytes
fn process(store: &Store, line: &[u8]) -> Vec<u8> {
    let request = match protocol::parse_request(line) {
        Ok(request) => request,
        Err(err) => return protocol::format_error(&err.to_string()),
    };
    let is_replica = store.role() == Role::Replica;

    match request {
        Request::Put { key, value } => {
            if is_replica {
                return protocol::format_error("store is a read-only replica");
            }
            respond_mutation(store.put(&key, &value))
        }
        Request::BatchPut { keys, values } => {
            if is_replica {
                return protocol::format_error("store is a read-only replica");
            }
            respond_mutation(store.batch_put(&keys, &values))
        }
        Request::Read { key } => match store.read(&key) {
            Ok(Some(value)) => protocol::format_value(&value),
            Ok(None) => protocol::format_not_found(),
            Err(err) => protocol::format_error(&err.to_string()),
        },
        Request::ReadRange { start, end } => match store.read_range(&start, &end) {
            Ok(pairs) => {
                if pairs.is_empty() {
                    protocol::format_not_found()
                } else {
                    let mut pairs: Vec<_> = pairs.into_iter().collect();
                    protocol::format_range(&mut pairs)
                }
            }
            Err(err) => protocol::format_error(&err.to_string()),
        },
        Request::Delete { key } => {
            if is_replica {
                return protocol::format_error("store is a read-only replica");
            }
            match store.delete(&key) {
                Ok(true) => protocol::format_ok(),
                Ok(false) => protocol::format_not_found(),
                Err(err) => protocol::format_error(&err.to_string()),
            }
        }
        Request::ReplicatePut { key, value } => {
            if !is_replica {
                return protocol::format_error("REPLICATE commands only accepted on replica nodes");
            }
            respond_mutation(store.put(&key, &value))
        }
        Request::ReplicateBatchPut { keys, values } => {
            if !is_replica {
                return protocol::format_error("REPLICATE commands only accepted on replica nodes");
            }
            respond_mutation(store.batch_put(&keys, &values))
        }
        Request::ReplicateDelete { key } => {
            if !is_replica {
                return protocol::format_error("REPLICATE commands only accepted on replica nodes");
            }
            // deleting an already-absent key leaves the replica in the state
            // the master asked for, so it still acknowledges
            match store.delete(&key) {
                Ok(_) => protocol::format_ok(),
                Err(err) => protocol::format_error(&err.to_string()),
            }
        }
    }
}

fn respond_mutation(result: Result<()>) -> Vec<u8> {
    match result {
        Ok(()) => protocol::format_ok(),
        Err(err) => protocol::format_error(&err.to_string()),
    }
}
