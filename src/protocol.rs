//! The line-oriented wire protocol shared by clients, the server, and the
//! replication channel.
//!
//! Requests are newline-delimited with space-separated tokens:
//!
//! ```text
//! PUT <key> <value>
//! BATCHPUT <k1||k2||...> <v1||v2||...>
//! READ <key>
//! READRANGE <start> <end>
//! DELETE <key>
//! REPLICATE PUT|BATCHPUT|DELETE ...
//! ```
//!
//! Keys and values are arbitrary bytes, so every token is escaped such that
//! it never contains a raw backslash, newline, carriage return, tab, space,
//! or pipe. The escape map is `\\`, `\n`, `\r`, `\t`, `\s` (space), and `\p`
//! (pipe); unescaping is the exact inverse, which makes the round trip
//! byte-exact. Batch items are joined with `||`, which escaped tokens cannot
//! contain.
//!
//! Single-line responses are `OK`, `NOT_FOUND`, `ERROR: <msg>`, or an escaped
//! value. A successful `READRANGE` instead returns one `<key>: <value>` line
//! per pair (keys sorted bytewise) terminated by a blank line.

use crate::error::{KvError, Result};

/// separator between items of a `BATCHPUT` argument
pub const BATCH_SEPARATOR: &[u8] = b"||";

/// the `OK` response line
pub const RESP_OK: &[u8] = b"OK";
/// the `NOT_FOUND` response line
pub const RESP_NOT_FOUND: &[u8] = b"NOT_FOUND";

/// A parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// store one key/value pair
    Put {
        /// the key
        key: Vec<u8>,
        /// the value
        value: Vec<u8>,
    },
    /// store several pairs atomically
    BatchPut {
        /// the keys
        keys: Vec<Vec<u8>>,
        /// the values, one per key
        values: Vec<Vec<u8>>,
    },
    /// fetch the value for one key
    Read {
        /// the key
        key: Vec<u8>,
    },
    /// fetch every pair whose key lies in `[start, end]`
    ReadRange {
        /// inclusive lower bound
        start: Vec<u8>,
        /// inclusive upper bound
        end: Vec<u8>,
    },
    /// remove one key
    Delete {
        /// the key
        key: Vec<u8>,
    },
    /// master-to-replica put
    ReplicatePut {
        /// the key
        key: Vec<u8>,
        /// the value
        value: Vec<u8>,
    },
    /// master-to-replica batch put
    ReplicateBatchPut {
        /// the keys
        keys: Vec<Vec<u8>>,
        /// the values, one per key
        values: Vec<Vec<u8>>,
    },
    /// master-to-replica delete
    ReplicateDelete {
        /// the key
        key: Vec<u8>,
    },
}

/// escape a raw byte string into a single protocol token
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        match byte {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b' ' => out.extend_from_slice(b"\\s"),
            b'|' => out.extend_from_slice(b"\\p"),
            _ => out.push(byte),
        }
    }
    out
}

/// invert [`escape`]; errors on a dangling or unknown escape sequence
pub fn unescape(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&byte) = iter.next() {
        if byte != b'\\' {
            out.push(byte);
            continue;
        }
        match iter.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b's') => out.push(b' '),
            Some(b'p') => out.push(b'|'),
            Some(&other) => {
                return Err(KvError::Protocol(format!(
                    "unknown escape sequence \\{}",
                    other as char
                )))
            }
            None => return Err(KvError::Protocol("dangling escape at end of token".into())),
        }
    }
    Ok(out)
}

/// join escaped items with the batch separator
pub fn join_batch<I: IntoIterator<Item = Vec<u8>>>(items: I) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(BATCH_SEPARATOR);
        }
        out.extend_from_slice(&item);
    }
    out
}

/// split a batch token on the separator and unescape each item
fn split_batch(token: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut items = Vec::new();
    let mut rest = token;
    loop {
        match find_separator(rest) {
            Some(pos) => {
                items.push(unescape(&rest[..pos])?);
                rest = &rest[pos + BATCH_SEPARATOR.len()..];
            }
            None => {
                items.push(unescape(rest)?);
                return Ok(items);
            }
        }
    }
}

fn find_separator(buf: &[u8]) -> Option<usize> {
    buf.windows(BATCH_SEPARATOR.len())
        .position(|window| window == BATCH_SEPARATOR)
}

/// split a line into at most `max` space-separated tokens. Like a
/// maxsplit-style split, the remainder after the last consumed separator is
/// kept even when it is empty, so `"PUT k "` yields an empty value token.
fn tokens(line: &[u8], max: usize) -> Vec<&[u8]> {
    let mut parts = Vec::new();
    let mut rest = line;
    while parts.len() + 1 < max {
        match rest.iter().position(|&b| b == b' ') {
            Some(pos) => {
                parts.push(&rest[..pos]);
                rest = &rest[pos + 1..];
            }
            None => {
                parts.push(rest);
                return parts;
            }
        }
    }
    parts.push(rest);
    parts
}

/// unescape a key token, rejecting the empty key
fn parse_key(token: &[u8]) -> Result<Vec<u8>> {
    let key = unescape(token)?;
    if key.is_empty() {
        return Err(KvError::Protocol("empty key".into()));
    }
    Ok(key)
}

/// parse one request line (without its trailing newline)
pub fn parse_request(line: &[u8]) -> Result<Request> {
    let parts = tokens(line, 3);
    let command = String::from_utf8_lossy(parts[0]).to_uppercase();

    match command.as_str() {
        "PUT" => {
            // a two-token PUT stores the empty value
            if parts.len() < 2 {
                return Err(KvError::Protocol("PUT requires key".into()));
            }
            let key = parse_key(parts[1])?;
            let value = if parts.len() == 3 {
                unescape(parts[2])?
            } else {
                Vec::new()
            };
            Ok(Request::Put { key, value })
        }
        "BATCHPUT" => {
            if parts.len() != 3 {
                return Err(KvError::Protocol("BATCHPUT requires keys and values".into()));
            }
            let (keys, values) = parse_batch_args(parts[1], parts[2])?;
            Ok(Request::BatchPut { keys, values })
        }
        "READ" => {
            if parts.len() != 2 {
                return Err(KvError::Protocol("READ requires key".into()));
            }
            Ok(Request::Read {
                key: parse_key(parts[1])?,
            })
        }
        "READRANGE" => {
            if parts.len() != 3 {
                return Err(KvError::Protocol("READRANGE requires start_key and end_key".into()));
            }
            Ok(Request::ReadRange {
                start: unescape(parts[1])?,
                end: unescape(parts[2])?,
            })
        }
        "DELETE" => {
            if parts.len() != 2 {
                return Err(KvError::Protocol("DELETE requires key".into()));
            }
            Ok(Request::Delete {
                key: parse_key(parts[1])?,
            })
        }
        "REPLICATE" => {
            if parts.len() < 2 {
                return Err(KvError::Protocol("REPLICATE requires subcommand".into()));
            }
            parse_replicate(parts[1], if parts.len() == 3 { parts[2] } else { b"" })
        }
        _ => Err(KvError::Protocol(format!("unknown command: {}", command))),
    }
}

/// parse the tail of a `REPLICATE <sub> ...` line
fn parse_replicate(sub: &[u8], rest: &[u8]) -> Result<Request> {
    let sub = String::from_utf8_lossy(sub).to_uppercase();
    let parts = tokens(rest, 2);

    match sub.as_str() {
        "PUT" => {
            if rest.is_empty() {
                return Err(KvError::Protocol("REPLICATE PUT requires key and value".into()));
            }
            let key = parse_key(parts[0])?;
            let value = if parts.len() == 2 {
                unescape(parts[1])?
            } else {
                Vec::new()
            };
            Ok(Request::ReplicatePut { key, value })
        }
        "BATCHPUT" => {
            if parts.len() != 2 {
                return Err(KvError::Protocol(
                    "REPLICATE BATCHPUT requires keys and values".into(),
                ));
            }
            let (keys, values) = parse_batch_args(parts[0], parts[1])?;
            Ok(Request::ReplicateBatchPut { keys, values })
        }
        "DELETE" => {
            if rest.is_empty() || parts.len() != 1 {
                return Err(KvError::Protocol("REPLICATE DELETE requires key".into()));
            }
            Ok(Request::ReplicateDelete {
                key: parse_key(parts[0])?,
            })
        }
        _ => Err(KvError::Protocol(format!(
            "unknown REPLICATE subcommand: {}",
            sub
        ))),
    }
}

/// split and unescape the two `BATCHPUT` argument tokens
fn parse_batch_args(keys_token: &[u8], values_token: &[u8]) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
    let keys = split_batch(keys_token)?;
    let values = split_batch(values_token)?;
    if keys.len() != values.len() {
        return Err(KvError::Protocol("keys and values count mismatch".into()));
    }
    if keys.iter().any(|key| key.is_empty()) {
        return Err(KvError::Protocol("empty key".into()));
    }
    Ok((keys, values))
}

// ---------------------------------------------------------------------------
// request encoding (client and replicator side)
// ---------------------------------------------------------------------------

/// encode a `PUT` request line, newline included
pub fn encode_put(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut line = b"PUT ".to_vec();
    line.extend_from_slice(&escape(key));
    line.push(b' ');
    line.extend_from_slice(&escape(value));
    line.push(b'\n');
    line
}

/// encode a `BATCHPUT` request line, newline included
pub fn encode_batch_put(keys: &[Vec<u8>], values: &[Vec<u8>]) -> Vec<u8> {
    let mut line = b"BATCHPUT ".to_vec();
    line.extend_from_slice(&join_batch(keys.iter().map(|key| escape(key))));
    line.push(b' ');
    line.extend_from_slice(&join_batch(values.iter().map(|value| escape(value))));
    line.push(b'\n');
    line
}

/// encode a `READ` request line, newline included
pub fn encode_read(key: &[u8]) -> Vec<u8> {
    let mut line = b"READ ".to_vec();
    line.extend_from_slice(&escape(key));
    line.push(b'\n');
    line
}

/// encode a `READRANGE` request line, newline included
pub fn encode_read_range(start: &[u8], end: &[u8]) -> Vec<u8> {
    let mut line = b"READRANGE ".to_vec();
    line.extend_from_slice(&escape(start));
    line.push(b' ');
    line.extend_from_slice(&escape(end));
    line.push(b'\n');
    line
}

/// encode a `DELETE` request line, newline included
pub fn encode_delete(key: &[u8]) -> Vec<u8> {
    let mut line = b"DELETE ".to_vec();
    line.extend_from_slice(&escape(key));
    line.push(b'\n');
    line
}

/// prefix a request line with the replication marker
pub fn encode_replicate(request_line: &[u8]) -> Vec<u8> {
    let mut line = b"REPLICATE ".to_vec();
    line.extend_from_slice(request_line);
    line
}

// ---------------------------------------------------------------------------
// response encoding (server side)
// ---------------------------------------------------------------------------

/// the `OK` response, newline included
pub fn format_ok() -> Vec<u8> {
    let mut out = RESP_OK.to_vec();
    out.push(b'\n');
    out
}

/// the `NOT_FOUND` response, newline included
pub fn format_not_found() -> Vec<u8> {
    let mut out = RESP_NOT_FOUND.to_vec();
    out.push(b'\n');
    out
}

/// an escaped value response, newline included
pub fn format_value(value: &[u8]) -> Vec<u8> {
    let mut out = escape(value);
    out.push(b'\n');
    out
}

/// an `ERROR: <msg>` response, newline included
pub fn format_error(message: &str) -> Vec<u8> {
    // keep the message itself single-line
    let flat = message.replace('\n', " ");
    format!("ERROR: {}\n", flat).into_bytes()
}

/// a `READRANGE` result: one `<key>: <value>` line per pair, keys sorted
/// bytewise, terminated by a blank line
pub fn format_range(pairs: &mut Vec<(Vec<u8>, Vec<u8>)>) -> Vec<u8> {
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    let mut out = Vec::new();
    for (key, value) in pairs.iter() {
        out.extend_from_slice(&escape(key));
        out.extend_from_slice(b": ");
        out.extend_from_slice(&escape(value));
        out.push(b'\n');
    }
    out.push(b'\n');
    out
}

/// split a `<key>: <value>` range line into its escaped halves
pub fn split_range_line(line: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let pos = line
        .windows(2)
        .position(|window| window == b": ")
        .ok_or_else(|| KvError::Protocol("malformed range line".into()))?;
    Ok((unescape(&line[..pos])?, unescape(&line[pos + 2..])?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trips_arbitrary_bytes() {
        let nasty = b"a b\tc\nd\re|f\\g\x00h".to_vec();
        let escaped = escape(&nasty);
        assert!(!escaped.contains(&b' '));
        assert!(!escaped.contains(&b'\n'));
        assert!(!escaped.contains(&b'|'));
        assert_eq!(unescape(&escaped).unwrap(), nasty);
    }

    #[test]
    fn unescape_rejects_bad_sequences() {
        assert!(unescape(b"abc\\").is_err());
        assert!(unescape(b"ab\\q").is_err());
    }

    #[test]
    fn parse_put() {
        let req = parse_request(b"PUT alpha 1").unwrap();
        assert_eq!(
            req,
            Request::Put {
                key: b"alpha".to_vec(),
                value: b"1".to_vec()
            }
        );
    }

    #[test]
    fn parse_put_without_value_stores_empty() {
        let req = parse_request(b"PUT alpha").unwrap();
        assert_eq!(
            req,
            Request::Put {
                key: b"alpha".to_vec(),
                value: Vec::new()
            }
        );
    }

    #[test]
    fn parse_rejects_empty_key() {
        assert!(parse_request(b"READ \\s").is_ok()); // a key of one space is fine
        assert!(parse_request(b"PUT").is_err());
        assert!(parse_request(b"DELETE ").is_err());
    }

    #[test]
    fn parse_batchput() {
        let req = parse_request(b"BATCHPUT a||b||c 1||2||3").unwrap();
        match req {
            Request::BatchPut { keys, values } => {
                assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
                assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn parse_batchput_count_mismatch() {
        assert!(parse_request(b"BATCHPUT a||b 1").is_err());
    }

    #[test]
    fn parse_replicate_commands() {
        assert_eq!(
            parse_request(b"REPLICATE PUT k v").unwrap(),
            Request::ReplicatePut {
                key: b"k".to_vec(),
                value: b"v".to_vec()
            }
        );
        assert_eq!(
            parse_request(b"REPLICATE DELETE k").unwrap(),
            Request::ReplicateDelete { key: b"k".to_vec() }
        );
        assert!(parse_request(b"REPLICATE NOPE k").is_err());
    }

    #[test]
    fn parse_unknown_command() {
        assert!(parse_request(b"FROB k").is_err());
    }

    #[test]
    fn encoded_requests_parse_back() {
        let key = b"key with spaces".to_vec();
        let value = b"value|with\npipes".to_vec();

        let line = encode_put(&key, &value);
        let req = parse_request(&line[..line.len() - 1]).unwrap();
        assert_eq!(
            req,
            Request::Put {
                key: key.clone(),
                value: value.clone()
            }
        );

        let line = encode_replicate(&encode_delete(&key));
        let req = parse_request(&line[..line.len() - 1]).unwrap();
        assert_eq!(req, Request::ReplicateDelete { key });
    }

    #[test]
    fn range_lines_round_trip() {
        let mut pairs = vec![
            (b"b".to_vec(), b"2 two".to_vec()),
            (b"a".to_vec(), b"1".to_vec()),
        ];
        let block = format_range(&mut pairs);
        let mut lines = block.split(|&b| b == b'\n');

        let (key, value) = split_range_line(lines.next().unwrap()).unwrap();
        assert_eq!(key, b"a");
        assert_eq!(value, b"1");

        let (key, value) = split_range_line(lines.next().unwrap()).unwrap();
        assert_eq!(key, b"b");
        assert_eq!(value, b"2 two");

        // terminating blank line
        assert_eq!(lines.next().unwrap(), b"");
    }
}
