//! this binary starts the repkv server
//! to see the list of commands, type: `repkv-server --help`

use clap::{arg_enum, crate_version, value_t, App, Arg};
use repkv::thread_pool::{NaiveThreadPool, RayonThreadPool, SharedQueueThreadPool, ThreadPool};
use repkv::{Config, KvError, ReplicationMode, Result, Role, Server, Store};
use std::fs;
use std::net::SocketAddr;
use std::process::exit;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

arg_enum! {
    #[allow(non_camel_case_types)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    enum Pool {
        shared,
        naive,
        rayon
    }
}

const DEFAULT_POOL_THREADS: u32 = 8;
const DEFAULT_POOL: Pool = Pool::shared;

/// [`Opt`] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    addr: SocketAddr,
    role: Role,
    pool: Pool,
    config: Config,
}

fn main() {
    // set up a tracing subscriber to log to STDERR
    subscriber_config();

    // parse command line args
    let matches = App::new("repkv-server")
        .version(crate_version!())
        .about("a durable, replicated, multi-threaded key-value store")
        .arg(
            Arg::with_name("addr")
                .long("addr")
                .value_name("IP_ADDR:PORT")
                .help("sets the IP_ADDR:PORT that the server listens on"),
        )
        .arg(
            Arg::with_name("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("directory holding the WAL, data file, and index snapshot"),
        )
        .arg(
            Arg::with_name("replica")
                .long("replica")
                .help("run as a read-only replica accepting only REPLICATE commands"),
        )
        .arg(
            Arg::with_name("replicate-to")
                .long("replicate-to")
                .value_name("HOST:PORT")
                .multiple(true)
                .use_delimiter(true)
                .help("replica addresses this master forwards mutations to"),
        )
        .arg(
            Arg::with_name("mode")
                .long("mode")
                .value_name("MODE")
                .possible_values(&["async", "sync"])
                .help("replication mode"),
        )
        .arg(
            Arg::with_name("pool")
                .long("pool")
                .value_name("POOL_NAME")
                .help("thread pool servicing connections: 'shared', 'naive', or 'rayon'")
                .default_value("shared"),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .help("JSON config file; command line flags override its values"),
        )
        .get_matches();

    let opt = match build_opt(&matches) {
        Ok(opt) => opt,
        Err(err) => {
            eprintln!("{:?}", err);
            exit(1);
        }
    };

    // start the server
    if let Err(e) = run(opt) {
        eprintln!("{:?}", e);
        exit(1);
    }
}

/// merges the config file (if any) with command line overrides
fn build_opt(matches: &clap::ArgMatches) -> Result<Opt> {
    let mut config = match matches.value_of("config") {
        Some(path) => Config::from_json(&fs::read_to_string(path)?)?,
        None => Config::default(),
    };

    if let Some(addr) = matches.value_of("addr") {
        config.listen_addr = addr.to_string();
    }
    if let Some(dir) = matches.value_of("data-dir") {
        config.data_dir = dir.into();
    }
    if let Some(addrs) = matches.values_of("replicate-to") {
        config.replication.addresses = addrs.map(String::from).collect();
        config.replication.enabled = true;
    }
    if let Some(mode) = matches.value_of("mode") {
        config.replication.mode = match mode {
            "sync" => ReplicationMode::Sync,
            _ => ReplicationMode::Async,
        };
    }

    let addr: SocketAddr = config.listen_addr.parse().map_err(|_| {
        KvError::Parsing(format!(
            "could not parse {} into an IP address and port",
            config.listen_addr
        ))
    })?;
    let role = if matches.is_present("replica") {
        Role::Replica
    } else {
        Role::Master
    };
    let pool = value_t!(matches, "pool", Pool).ok().unwrap_or(DEFAULT_POOL);

    Ok(Opt {
        addr,
        role,
        pool,
        config,
    })
}

fn run(opt: Opt) -> Result<()> {
    info!("repkv-server {}", env!("CARGO_PKG_VERSION"));
    info!("role: {:?}", opt.role);
    info!("thread pool: {}", opt.pool);
    info!("listening on {}", opt.addr);

    let store = Store::open(opt.config, opt.role)?;
    match opt.pool {
        Pool::shared => run_with_pool(store, SharedQueueThreadPool::new(DEFAULT_POOL_THREADS)?, opt.addr),
        Pool::naive => run_with_pool(store, NaiveThreadPool::new(DEFAULT_POOL_THREADS)?, opt.addr),
        Pool::rayon => run_with_pool(store, RayonThreadPool::new(DEFAULT_POOL_THREADS)?, opt.addr),
    }
}

fn run_with_pool<P: ThreadPool>(store: Store, pool: P, addr: SocketAddr) -> Result<()> {
    Server::new(store, pool).run(addr)
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        // all spans/events with a level higher than TRACE (e.g, debug, info, warn, etc.)
        // will be written to stdout.
        .with_max_level(Level::INFO)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        // completes the builder.
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
