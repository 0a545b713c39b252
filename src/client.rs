use crate::error::{KvError, Result};
use crate::protocol;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};

/// `Client` contains the functionality for communicating with a [`Server`]
/// over the line-oriented wire protocol.
///
/// [`Server`]: ./struct.Server.html
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Client {
    /// creates a client and establishes a socket connection to the server at the given `addr`
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let tcp_reader = TcpStream::connect(addr)?;
        let tcp_writer = tcp_reader.try_clone()?;

        Ok(Client {
            reader: BufReader::new(tcp_reader),
            writer: BufWriter::new(tcp_writer),
        })
    }

    /// stores the given `key` and `value` on the server
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.send(&protocol::encode_put(key, value))?;
        self.expect_ok()
    }

    /// stores several pairs atomically; `keys` and `values` must be the same length
    pub fn batch_put(&mut self, keys: &[Vec<u8>], values: &[Vec<u8>]) -> Result<()> {
        self.send(&protocol::encode_batch_put(keys, values))?;
        self.expect_ok()
    }

    /// gets the value of the specified `key` from the server.
    /// ## Returns
    /// `Ok(Some(value))` if the value was found for the key.
    /// `Ok(None)` if there is no value associated with the key
    pub fn read(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.send(&protocol::encode_read(key))?;
        let line = self.recv_line()?;
        if line == protocol::RESP_NOT_FOUND {
            return Ok(None);
        }
        if let Some(message) = error_message(&line) {
            return Err(KvError::StringErr(message));
        }
        Ok(Some(protocol::unescape(&line)?))
    }

    /// gets every pair whose key lies in the closed interval `[start, end]`,
    /// sorted by key. An empty result means no key was in range.
    pub fn read_range(&mut self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.send(&protocol::encode_read_range(start, end))?;
        let first = self.recv_line()?;
        if first == protocol::RESP_NOT_FOUND {
            return Ok(Vec::new());
        }
        if let Some(message) = error_message(&first) {
            return Err(KvError::StringErr(message));
        }

        let mut pairs = vec![protocol::split_range_line(&first)?];
        loop {
            let line = self.recv_line()?;
            if line.is_empty() {
                // the blank line ends the range block
                return Ok(pairs);
            }
            pairs.push(protocol::split_range_line(&line)?);
        }
    }

    /// removes a key and its associated value from the store.
    /// # Returns
    /// `Ok(true)` if the key was removed, `Ok(false)` if it did not exist
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.send(&protocol::encode_delete(key))?;
        let line = self.recv_line()?;
        if line == protocol::RESP_OK {
            return Ok(true);
        }
        if line == protocol::RESP_NOT_FOUND {
            return Ok(false);
        }
        match error_message(&line) {
            Some(message) => Err(KvError::StringErr(message)),
            None => Err(KvError::Protocol(format!(
                "unexpected response: {}",
                String::from_utf8_lossy(&line)
            ))),
        }
    }

    fn send(&mut self, line: &[u8]) -> Result<()> {
        self.writer.write_all(line)?;
        self.writer.flush()?;
        Ok(())
    }

    /// read one response line, with the trailing newline stripped
    fn recv_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        if self.reader.read_until(b'\n', &mut line)? == 0 {
            return Err(KvError::Protocol("server closed the connection".to_string()));
        }
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }

    fn expect_ok(&mut self) -> Result<()> {
        let line = self.recv_line()?;
        if line == protocol::RESP_OK {
            return Ok(());
        }
        match error_message(&line) {
            Some(message) => Err(KvError::StringErr(message)),
            None => Err(KvError::Protocol(format!(
                "unexpected response: {}",
                String::from_utf8_lossy(&line)
            ))),
        }
    }
}

/// extract the message from an `ERROR: ...` response line
fn error_message(line: &[u8]) -> Option<String> {
    if line.starts_with(b"ERROR") {
        let message = line.strip_prefix(b"ERROR: ".as_ref()).unwrap_or(line);
        Some(String::from_utf8_lossy(message).into_owned())
    } else {
        None
    }
}
