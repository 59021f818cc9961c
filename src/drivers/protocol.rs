use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, warn};
use ndarray::Array3;

use crate::config::ServerConfig;
use crate::drivers::{ChannelMask, FaError};

/// Nominal sample rate of the FA stream, used when the server cannot tell us.
pub const NOMINAL_SAMPLE_FREQUENCY: f64 = 10072.0;
/// Upper bound on a single receive.
const RECV_SIZE: usize = 65536;
/// Each channel contributes one X and one Y `i32` per sample.
pub const BYTES_PER_CHANNEL_SAMPLE: usize = 8;

/// Raw socket to the FA server with byte exact framed reads.
///
/// The server delivers data in arbitrarily sized chunks, so every read goes
/// through the `pending` accumulator and never assumes one receive yields one
/// record.
pub struct Connection {
    stream: TcpStream,
    pending: Vec<u8>,
    peer: String,
}

impl Connection {
    pub fn connect(server: &ServerConfig) -> Result<Self, FaError> {
        let address = server.address();
        let connect_err = |source| FaError::Connect {
            address: address.clone(),
            source,
        };
        let addrs: Vec<_> = address.to_socket_addrs().map_err(connect_err)?.collect();
        let mut last_err = std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "host name resolved to no addresses",
        );
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, server.connect_timeout()) {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(connect_err)?;
                    debug!("connected to {address} ({addr})");
                    return Ok(Self {
                        stream,
                        pending: Vec::new(),
                        peer: address.clone(),
                    });
                }
                Err(err) => last_err = err,
            }
        }
        Err(connect_err(last_err))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn send_command(&mut self, command: &str) -> Result<(), FaError> {
        debug!("-> {}", command.trim_end());
        self.stream.write_all(command.as_bytes())?;
        Ok(())
    }

    /// Waits until the socket has data and appends at most `RECV_SIZE` bytes
    /// to the pending buffer. Returns the number of bytes received; zero means
    /// the peer closed the connection.
    fn recv(&mut self) -> Result<usize, FaError> {
        let mut chunk = [0u8; RECV_SIZE];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Returns exactly `n_bytes`, keeping any surplus for the next call.
    pub fn read_block(&mut self, n_bytes: usize) -> Result<Vec<u8>, FaError> {
        while self.pending.len() < n_bytes {
            if self.recv()? == 0 {
                return Err(FaError::EndOfStream);
            }
        }
        let rest = self.pending.split_off(n_bytes);
        Ok(std::mem::replace(&mut self.pending, rest))
    }

    /// Reads up to and including the next newline, returning the line without
    /// its terminator. A close before the newline returns what was received,
    /// or `EndOfStream` if nothing was.
    pub fn read_line(&mut self) -> Result<String, FaError> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.pending[scanned..].iter().position(|&b| b == b'\n') {
                let end = scanned + pos;
                let rest = self.pending.split_off(end + 1);
                let mut line = std::mem::replace(&mut self.pending, rest);
                line.truncate(end);
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            scanned = self.pending.len();
            if self.recv()? == 0 {
                if self.pending.is_empty() {
                    return Err(FaError::EndOfStream);
                }
                let line = std::mem::take(&mut self.pending);
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
        }
    }

    /// Handle that can shut the socket down from another thread, unblocking
    /// a pending receive.
    pub fn shutdown_handle(&self) -> Result<TcpStream, FaError> {
        Ok(self.stream.try_clone()?)
    }

    /// Bounds every later receive; `None` blocks indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), FaError> {
        Ok(self.stream.set_read_timeout(timeout)?)
    }

    pub fn shutdown(&self) {
        // Already closed by the peer is fine.
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Sends `CF` and parses the reply as the sample frequency in Hz.
    pub fn query_frequency(&mut self) -> Result<f64, FaError> {
        self.send_command("CF\n")?;
        let line = self.read_line()?;
        line.trim()
            .parse::<f64>()
            .map_err(|_| FaError::Protocol(format!("bad frequency reply {line:?}")))
    }
}

/// Live data subscription to a set of channels.
pub struct Subscription {
    connection: Connection,
    mask: ChannelMask,
    count: usize,
}

impl Subscription {
    /// Connects and sends `SR<mask>`. When `expect_ack` is set the server
    /// answers with a status byte: zero accepts, anything else starts an
    /// error line.
    pub fn open(server: &ServerConfig, mask: ChannelMask) -> Result<Self, FaError> {
        if mask.is_empty() {
            return Err(FaError::InvalidMask("no channels selected".into()));
        }
        let mut connection = Connection::connect(server)?;
        connection.send_command(&format!("SR{}\n", mask.to_wire()))?;
        if server.expect_ack {
            let status = connection.read_block(1)?;
            if status[0] != 0 {
                let rest = connection.read_line().unwrap_or_default();
                let mut message = String::from_utf8_lossy(&status).into_owned();
                message.push_str(&rest);
                return Err(FaError::Subscribe(message.trim().to_owned()));
            }
        }
        debug!("subscribed to {:?} on {}", mask, connection.peer());
        Ok(Self {
            count: mask.count(),
            connection,
            mask,
        })
    }

    pub fn mask(&self) -> &ChannelMask {
        &self.mask
    }

    pub fn channel_count(&self) -> usize {
        self.count
    }

    pub fn shutdown_handle(&self) -> Result<TcpStream, FaError> {
        self.connection.shutdown_handle()
    }

    /// Reads `samples` records as a `samples x channels x 2` array of raw
    /// X/Y positions.
    pub fn read(&mut self, samples: usize) -> Result<Array3<i32>, FaError> {
        read_samples(&mut self.connection, samples, self.count)
    }

    pub fn close(self) {
        self.connection.shutdown();
    }
}

/// Reads `n` samples of `channel_count` channels in native byte order.
pub fn read_samples(
    connection: &mut Connection,
    n: usize,
    channel_count: usize,
) -> Result<Array3<i32>, FaError> {
    let raw = connection.read_block(BYTES_PER_CHANNEL_SAMPLE * n * channel_count)?;
    let values: Vec<i32> = raw
        .chunks_exact(4)
        .map(|word| i32::from_ne_bytes([word[0], word[1], word[2], word[3]]))
        .collect();
    Array3::from_shape_vec((n, channel_count, 2), values)
        .map_err(|err| FaError::Protocol(err.to_string()))
}

/// Asks the server for its sample frequency. A server that does not answer
/// within the connect timeout fails the query.
pub fn query_frequency(server: &ServerConfig) -> Result<f64, FaError> {
    let mut connection = Connection::connect(server)?;
    connection.set_read_timeout(Some(server.connect_timeout()))?;
    let frequency = connection.query_frequency();
    connection.shutdown();
    frequency
}

/// Sample frequency from the server, or `fallback` if the query fails for
/// any reason.
pub fn sample_frequency(server: &ServerConfig, fallback: f64) -> f64 {
    match query_frequency(server) {
        Ok(f_s) if f_s.is_finite() && f_s > 0.0 => f_s,
        Ok(f_s) => {
            warn!("server reported unusable frequency {f_s}; using {fallback} Hz");
            fallback
        }
        Err(err) => {
            warn!("frequency query failed ({err}); using {fallback} Hz");
            fallback
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::BufRead;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Instant;

    /// Spawns a one-shot server that hands the accepted socket to `serve`.
    pub(crate) fn mock_server<F>(serve: F) -> ServerConfig
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                serve(stream);
            }
        });
        ServerConfig {
            host: "127.0.0.1".into(),
            port,
            ..ServerConfig::default()
        }
    }

    pub(crate) fn read_request(stream: &TcpStream) -> String {
        let mut line = String::new();
        std::io::BufReader::new(stream).read_line(&mut line).unwrap();
        line
    }

    fn sample_bytes(samples: &[(i32, i32)]) -> Vec<u8> {
        samples
            .iter()
            .flat_map(|(x, y)| x.to_ne_bytes().into_iter().chain(y.to_ne_bytes()))
            .collect()
    }

    #[test]
    fn reassembles_blocks_from_small_chunks() {
        let payload = sample_bytes(&[(1, -1), (2, -2), (3, -3), (4, -4), (5, -5)]);
        let server = mock_server(move |mut stream| {
            let request = read_request(&stream);
            assert_eq!(request, format!("SR{}\n", ChannelMask::single(3).to_wire()));
            stream.write_all(&[0]).unwrap();
            for chunk in payload.chunks(3) {
                stream.write_all(chunk).unwrap();
                stream.flush().unwrap();
            }
        });
        let mut sub = Subscription::open(&server, ChannelMask::single(3)).unwrap();
        let first = sub.read(2).unwrap();
        assert_eq!(first.shape(), &[2, 1, 2]);
        assert_eq!(first[[1, 0, 0]], 2);
        assert_eq!(first[[1, 0, 1]], -2);
        let second = sub.read(3).unwrap();
        assert_eq!(second[[0, 0, 0]], 3);
        assert_eq!(second[[2, 0, 1]], -5);
        assert!(matches!(sub.read(1), Err(FaError::EndOfStream)));
    }

    #[test]
    fn subscription_error_carries_server_message() {
        let server = mock_server(|mut stream| {
            read_request(&stream);
            stream.write_all(b"Xno such channel\n").unwrap();
        });
        match Subscription::open(&server, ChannelMask::single(7)) {
            Err(FaError::Subscribe(message)) => assert_eq!(message, "Xno such channel"),
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[test]
    fn data_without_ack_when_disabled() {
        let mut server = mock_server(|mut stream| {
            read_request(&stream);
            stream.write_all(&sample_bytes(&[(0, 9)])).unwrap();
        });
        server.expect_ack = false;
        let mut sub = Subscription::open(&server, ChannelMask::single(1)).unwrap();
        assert_eq!(sub.read(1).unwrap()[[0, 0, 1]], 9);
    }

    #[test]
    fn frequency_query_parses_reply() {
        let server = mock_server(|mut stream| {
            assert_eq!(read_request(&stream), "CF\n");
            stream.write_all(b"10074.5\n").unwrap();
        });
        assert_eq!(query_frequency(&server).unwrap(), 10074.5);
    }

    #[test]
    fn frequency_falls_back_on_garbage() {
        let server = mock_server(|mut stream| {
            read_request(&stream);
            stream.write_all(b"Unknown command 'C'\n").unwrap();
        });
        assert_eq!(sample_frequency(&server, 1234.0), 1234.0);
    }

    #[test]
    fn silent_server_times_out_to_fallback() {
        let server = mock_server(|stream| {
            assert_eq!(read_request(&stream), "CF\n");
            thread::sleep(Duration::from_secs(5));
            drop(stream);
        });
        let server = ServerConfig {
            connect_timeout_ms: 200,
            ..server
        };
        let started = Instant::now();
        assert_eq!(sample_frequency(&server, 1234.0), 1234.0);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn connect_refused_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let server = ServerConfig {
            host: "127.0.0.1".into(),
            port,
            ..ServerConfig::default()
        };
        assert!(matches!(
            Subscription::open(&server, ChannelMask::single(0)),
            Err(FaError::Connect { .. })
        ));
        assert_eq!(
            sample_frequency(&server, NOMINAL_SAMPLE_FREQUENCY),
            NOMINAL_SAMPLE_FREQUENCY
        );
    }
}
