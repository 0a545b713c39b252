//! The repkv-client executable supports the following command line arguments:
//!
//! `repkv-client put <KEY> <VALUE> [--addr IP-PORT]`
//!
//!     Store the value under the key.
//!
//! `repkv-client get <KEY> [--addr IP-PORT]`
//!
//!     Print the value of a given key, or "Key not found".
//!
//! `repkv-client rm <KEY> [--addr IP-PORT]`
//!
//!     Remove a given key. A missing key is reported as an error.
//!
//! `repkv-client batchput <KEYS> <VALUES> [--addr IP-PORT]`
//!
//!     Store several pairs at once; KEYS and VALUES are comma-separated
//!     lists of the same length.
//!
//! `repkv-client range <START> <END> [--addr IP-PORT]`
//!
//!     Print every pair whose key lies in the closed interval [START, END],
//!     one "key: value" line per pair.
//!
//! `--addr` accepts an IP address, either v4 or v6, and a port number, with
//! the format IP:PORT. If `--addr` is not specified then connect on
//! 127.0.0.1:4000.

use clap::{crate_version, App, Arg, ArgMatches, SubCommand};
use repkv::{Client, KvError, Result};
use std::net::SocketAddr;
use std::process::exit;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const DEFAULT_ADDRESS: &str = "127.0.0.1:4000";

/// the request to run against the server
#[derive(Debug)]
enum Cmd {
    Put { key: Vec<u8>, value: Vec<u8> },
    Get { key: Vec<u8> },
    Remove { key: Vec<u8> },
    BatchPut { keys: Vec<Vec<u8>>, values: Vec<Vec<u8>> },
    Range { start: Vec<u8>, end: Vec<u8> },
}

/// [`Opt`] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    /// the server's ip:port
    addr: SocketAddr,
    cmd: Cmd,
}

fn main() {
    // configure a subscriber that will log messages to STDERR
    subscriber_config();

    let matches = App::new("repkv-client")
        .version(crate_version!())
        .about("command line client for the repkv server")
        .subcommands(vec![
            SubCommand::with_name("put")
                .about("Store the value under the key")
                .arg(Arg::with_name("KEY").required(true).index(1))
                .arg(Arg::with_name("VALUE").required(true).index(2)),
            SubCommand::with_name("get")
                .about("Print the value stored under the key")
                .arg(Arg::with_name("KEY").required(true).index(1)),
            SubCommand::with_name("rm")
                .about("Removes a given key")
                .arg(Arg::with_name("KEY").required(true).index(1)),
            SubCommand::with_name("batchput")
                .about("Store several comma-separated pairs at once")
                .arg(Arg::with_name("KEYS").required(true).index(1))
                .arg(Arg::with_name("VALUES").required(true).index(2)),
            SubCommand::with_name("range")
                .about("Print every pair with a key in [START, END]")
                .arg(Arg::with_name("START").required(true).index(1))
                .arg(Arg::with_name("END").required(true).index(2)),
        ])
        .arg(
            Arg::with_name("addr")
                .long("addr")
                .value_name("IP_ADDR:PORT")
                .help("sets the IP_ADDR:PORT of the server to connect to")
                .default_value(DEFAULT_ADDRESS),
        )
        .get_matches();

    let result = parse_options(matches).and_then(run);
    if let Err(e) = result {
        eprintln!("{:?}", e);
        exit(1);
    }
}

/// runs the specified command against the server at `opt.addr`
fn run(opt: Opt) -> Result<()> {
    let mut client = Client::connect(opt.addr)?;
    match opt.cmd {
        Cmd::Put { key, value } => {
            client.put(&key, &value)?;
        }
        Cmd::Get { key } => {
            if let Some(value) = client.read(&key)? {
                println!("{}", String::from_utf8_lossy(&value));
            } else {
                println!("Key not found");
            }
        }
        Cmd::Remove { key } => {
            if !client.delete(&key)? {
                return Err(KvError::KeyNotFound);
            }
        }
        Cmd::BatchPut { keys, values } => {
            client.batch_put(&keys, &values)?;
        }
        Cmd::Range { start, end } => {
            for (key, value) in client.read_range(&start, &end)? {
                println!(
                    "{}: {}",
                    String::from_utf8_lossy(&key),
                    String::from_utf8_lossy(&value)
                );
            }
        }
    }
    Ok(())
}

/// parses the matches from the command line into an [`Opt`] struct
fn parse_options(matches: ArgMatches) -> Result<Opt> {
    let addr = matches.value_of("addr").unwrap();
    let addr: SocketAddr = addr.parse().map_err(|_| {
        KvError::Parsing(format!("could not parse {} into an IP address and port", addr))
    })?;

    let cmd = match matches.subcommand() {
        ("put", Some(args)) => Cmd::Put {
            key: arg_bytes(args, "KEY"),
            value: arg_bytes(args, "VALUE"),
        },
        ("get", Some(args)) => Cmd::Get {
            key: arg_bytes(args, "KEY"),
        },
        ("rm", Some(args)) => Cmd::Remove {
            key: arg_bytes(args, "KEY"),
        },
        ("batchput", Some(args)) => {
            let keys = split_list(args, "KEYS");
            let values = split_list(args, "VALUES");
            if keys.len() != values.len() {
                return Err(KvError::Parsing(
                    "KEYS and VALUES must have the same number of items".to_string(),
                ));
            }
            Cmd::BatchPut { keys, values }
        }
        ("range", Some(args)) => Cmd::Range {
            start: arg_bytes(args, "START"),
            end: arg_bytes(args, "END"),
        },
        _ => {
            return Err(KvError::Parsing(
                "a subcommand is required; see --help".to_string(),
            ))
        }
    };

    Ok(Opt { addr, cmd })
}

fn arg_bytes(args: &ArgMatches, name: &str) -> Vec<u8> {
    args.value_of(name).unwrap().as_bytes().to_vec()
}

fn split_list(args: &ArgMatches, name: &str) -> Vec<Vec<u8>> {
    args.value_of(name)
        .unwrap()
        .split(',')
        .map(|item| item.as_bytes().to_vec())
        .collect()
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        // completes the builder.
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
