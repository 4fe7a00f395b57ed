//! HTTP-over-Unix-socket proxy server.
//!
//! One thread accepts connections; each connection is handled on its own
//! thread. A connection carries exactly one HTTP request: it is classified,
//! then either answered with 403 or forwarded verbatim over a fresh
//! connection to the daemon socket. A 101 response switches the handler
//! into a raw bidirectional copy until both directions reach EOF.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use crate::policy;

/// Poll interval of the non-blocking accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(10);
/// How long `stop` waits for in-flight connections to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout while parsing request/response heads.
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval of the hijacked copy loops (cancellation granularity).
const TUNNEL_POLL: Duration = Duration::from_millis(500);
/// Upper bound on a request or response head.
const MAX_HEAD_BYTES: usize = 64 * 1024;

static EXEC_WARNING: Once = Once::new();

#[derive(Debug, Clone)]
pub struct DockerProxyConfig {
    /// Socket the proxy listens on (inside the sandbox home).
    pub listen_path: PathBuf,
    /// Host Docker daemon socket requests are forwarded to.
    pub daemon_socket: PathBuf,
}

/// Filtering proxy between the sandbox and the host Docker daemon.
pub struct DockerProxy {
    config: DockerProxyConfig,
    listener: Option<UnixListener>,
    running: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    accept_handle: Option<thread::JoinHandle<()>>,
}

impl DockerProxy {
    /// Bind the listening socket. A stale socket file from a previous run
    /// is removed first.
    pub fn bind(config: DockerProxyConfig) -> io::Result<Self> {
        if config.listen_path.exists() {
            fs::remove_file(&config.listen_path)?;
        }
        let listener = UnixListener::bind(&config.listen_path)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            config,
            listener: Some(listener),
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            accept_handle: None,
        })
    }

    pub fn listen_path(&self) -> &Path {
        &self.config.listen_path
    }

    /// Start the accept loop on a background thread. Blocks only until the
    /// thread is spawned; the socket is already connectable after `bind`.
    pub fn start(&mut self) -> io::Result<()> {
        EXEC_WARNING.call_once(|| {
            eprintln!(
                "warning: docker proxying grants the sandbox exec/attach into any existing \
                 container, which is equivalent to the host user's privileges in the docker group"
            );
        });

        let listener = self.listener.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "docker proxy already started")
        })?;
        self.running.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let in_flight = Arc::clone(&self.in_flight);
        let daemon_socket = self.config.daemon_socket.clone();

        self.accept_handle = Some(thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let daemon_socket = daemon_socket.clone();
                        let running = Arc::clone(&running);
                        let guard = ConnGuard::enter(&in_flight);
                        thread::spawn(move || {
                            let _guard = guard;
                            if let Err(e) = handle_connection(stream, &daemon_socket, &running) {
                                tracing::warn!("docker proxy: connection error: {e}");
                            }
                        });
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) => {
                        tracing::error!("docker proxy: accept error: {e}");
                    }
                }
            }
        }));
        Ok(())
    }

    /// Stop the accept loop and wait up to the drain deadline for in-flight
    /// connections. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "docker proxy: {} connection(s) still draining after {:?}",
                    self.in_flight.load(Ordering::SeqCst),
                    DRAIN_TIMEOUT
                );
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        let _ = fs::remove_file(&self.config.listen_path);
    }
}

impl Drop for DockerProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

/// RAII in-flight connection counter.
struct ConnGuard(Arc<AtomicUsize>);

impl ConnGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Parsed HTTP head: request line or status line plus raw header block.
struct Head {
    /// Bytes of the full head including the terminating blank line.
    raw_len: usize,
    line: String,
    content_length: Option<u64>,
    chunked: bool,
}

fn handle_connection(
    mut client: UnixStream,
    daemon_socket: &Path,
    running: &Arc<AtomicBool>,
) -> io::Result<()> {
    client.set_read_timeout(Some(HEAD_READ_TIMEOUT))?;

    let mut client_buf = Vec::new();
    let head = match read_head(&mut client, &mut client_buf) {
        Ok(head) => head,
        Err(e) => {
            let _ = write_simple(&mut client, 400, "Bad Request", "malformed request\n");
            return Err(e);
        }
    };

    let mut parts = head.line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(m), Some(p)) => (m.to_string(), p.to_string()),
        _ => {
            return write_simple(&mut client, 400, "Bad Request", "malformed request line\n");
        }
    };

    if let Some(reason) = policy::deny_reason(&method, &path) {
        tracing::info!("docker proxy: denied {method} {path}");
        return write_simple(&mut client, 403, "Forbidden", &reason);
    }
    tracing::debug!("docker proxy: forwarding {method} {path}");

    let mut daemon = UnixStream::connect(daemon_socket)?;
    daemon.set_read_timeout(Some(HEAD_READ_TIMEOUT))?;

    // Forward the request verbatim: head first, then the body through its
    // framing. Body bytes that arrived buffered together with the head are
    // drained through the same reader so each byte is written exactly once.
    let client_rest = client_buf.split_off(head.raw_len);
    daemon.write_all(&client_buf)?;
    let framing = request_framing(&head);
    let mut body = PrefixedReader::new(client_rest, &mut client);
    relay_body(&mut body, &mut daemon, framing)?;
    // Anything the client sent past the request body (bytes written ahead
    // of a protocol upgrade) belongs to the daemon as well.
    let leftover = body.into_remainder();
    if !leftover.is_empty() {
        daemon.write_all(&leftover)?;
    }
    daemon.flush()?;

    // Read the daemon's response head.
    let mut daemon_buf = Vec::new();
    let response = read_head(&mut daemon, &mut daemon_buf)?;
    let status = response
        .line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);
    let daemon_rest = daemon_buf.split_off(response.raw_len);

    if status == 101 {
        // Hijacked upgrade: hand the response head to the client, flush any
        // bytes the daemon already sent past the head, then go full duplex.
        client.write_all(&daemon_buf)?;
        client.write_all(&daemon_rest)?;
        client.flush()?;
        return tunnel(client, daemon, running);
    }

    client.write_all(&daemon_buf)?;
    let framing = response_framing(&method, status, &response);
    let mut body = PrefixedReader::new(daemon_rest, &mut daemon);
    relay_body(&mut body, &mut client, framing)?;
    client.flush()?;
    Ok(())
}

/// Read from `stream` into `buf` until the head terminator is present.
fn read_head(stream: &mut UnixStream, buf: &mut Vec<u8>) -> io::Result<Head> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find_head_end(buf) {
            return parse_head(buf, end);
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "HTTP head exceeds 64 KiB",
            ));
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF before end of HTTP head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_head(buf: &[u8], raw_len: usize) -> io::Result<Head> {
    let text = std::str::from_utf8(&buf[..raw_len])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 HTTP head"))?;
    let mut lines = text.split("\r\n");
    let line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty HTTP head"))?
        .to_string();

    let mut content_length = None;
    let mut chunked = false;
    for header in lines {
        let Some((name, value)) = header.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse::<u64>().ok();
        } else if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            chunked = true;
        }
    }

    Ok(Head {
        raw_len,
        line,
        content_length,
        chunked,
    })
}

/// Body framing after the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    None,
    Length(u64),
    Chunked,
    Eof,
}

fn request_framing(head: &Head) -> Framing {
    if head.chunked {
        Framing::Chunked
    } else {
        match head.content_length {
            Some(len) => Framing::Length(len),
            None => Framing::None,
        }
    }
}

fn response_framing(method: &str, status: u16, head: &Head) -> Framing {
    if method == "HEAD" || status == 204 || status == 304 {
        return Framing::None;
    }
    if head.chunked {
        return Framing::Chunked;
    }
    match head.content_length {
        Some(len) => Framing::Length(len),
        None => Framing::Eof,
    }
}

/// Copy a message body from `reader` to `writer` according to its framing.
fn relay_body(reader: &mut impl Read, writer: &mut impl Write, framing: Framing) -> io::Result<()> {
    match framing {
        Framing::None => Ok(()),
        Framing::Length(remaining) => copy_exact(reader, writer, remaining),
        Framing::Eof => {
            io::copy(reader, writer)?;
            Ok(())
        }
        Framing::Chunked => relay_chunked(reader, writer),
    }
}

fn copy_exact(reader: &mut impl Read, writer: &mut impl Write, mut remaining: u64) -> io::Result<()> {
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF inside message body",
            ));
        }
        writer.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Relay a chunked body without re-encoding: chunk-size lines and payloads
/// are copied through until the terminating zero chunk and trailer.
fn relay_chunked(reader: &mut impl Read, writer: &mut impl Write) -> io::Result<()> {
    loop {
        let line = read_crlf_line(reader)?;
        writer.write_all(&line)?;
        let size_text = std::str::from_utf8(&line)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad chunk size"))?;
        let size_text = size_text.trim_end();
        let size_text = size_text.split(';').next().unwrap_or(size_text);
        let size = u64::from_str_radix(size_text.trim(), 16)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad chunk size"))?;
        if size == 0 {
            // Trailer section: copy lines through until the blank one.
            loop {
                let trailer = read_crlf_line(reader)?;
                writer.write_all(&trailer)?;
                if trailer == b"\r\n" {
                    return Ok(());
                }
            }
        }
        // Chunk payload plus its trailing CRLF.
        copy_exact(reader, writer, size + 2)?;
    }
}

fn read_crlf_line(reader: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut line = Vec::with_capacity(16);
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF inside chunked body",
            ));
        }
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return Ok(line);
        }
        if line.len() > 1024 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "chunk line too long"));
        }
    }
}

/// A reader that first drains a byte prefix, then the underlying stream.
struct PrefixedReader<'a, R: Read> {
    prefix: Vec<u8>,
    pos: usize,
    inner: &'a mut R,
}

impl<'a, R: Read> PrefixedReader<'a, R> {
    fn new(prefix: Vec<u8>, inner: &'a mut R) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }

    /// Unconsumed prefix bytes, if the framing finished before draining them.
    fn into_remainder(self) -> Vec<u8> {
        self.prefix[self.pos..].to_vec()
    }
}

impl<R: Read> Read for PrefixedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.prefix.len() {
            let n = (self.prefix.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.prefix[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        self.inner.read(buf)
    }
}

/// Bidirectional raw copy after a 101 upgrade.
///
/// Two threads, one per direction; each half-closes the opposite side on
/// EOF and both are joined before the handler returns. Resets and writes
/// to already-closed sockets are expected here and not errors.
fn tunnel(client: UnixStream, daemon: UnixStream, running: &Arc<AtomicBool>) -> io::Result<()> {
    let c2d = spawn_copy(client.try_clone()?, daemon.try_clone()?, Arc::clone(running));
    let d2c = spawn_copy(daemon, client, Arc::clone(running));
    let _ = c2d.join();
    let _ = d2c.join();
    Ok(())
}

fn spawn_copy(
    mut from: UnixStream,
    mut to: UnixStream,
    running: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let _ = from.set_read_timeout(Some(TUNNEL_POLL));
        let mut buf = [0u8; 32 * 1024];
        loop {
            match from.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if to.write_all(&buf[..n]).is_err() || to.flush().is_err() {
                        break;
                    }
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(ref e) if is_disconnect(e) => break,
                Err(_) => break,
            }
        }
        let _ = to.shutdown(std::net::Shutdown::Write);
    })
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

fn write_simple(stream: &mut UnixStream, code: u16, status: &str, body: &str) -> io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 {code} {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )?;
    stream.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal in-process stand-in for the Docker daemon.
    fn spawn_fake_daemon(socket: PathBuf) {
        let listener = UnixListener::bind(&socket).unwrap();
        thread::spawn(move || {
            while let Ok((mut stream, _)) = listener.accept() {
                thread::spawn(move || {
                    let mut buf = Vec::new();
                    let head = read_head(&mut stream, &mut buf).unwrap();
                    let line = head.line.clone();

                    if line.starts_with("GET /_ping") {
                        stream
                            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK")
                            .unwrap();
                    } else if line.starts_with("GET /events") {
                        stream
                            .write_all(
                                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
                            )
                            .unwrap();
                    } else if line.contains("/start") {
                        // Upgrade, send early bytes, then echo until EOF.
                        stream
                            .write_all(
                                b"HTTP/1.1 101 UPGRADED\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\ndaemon-first",
                            )
                            .unwrap();
                        // Anything buffered past the request head reached us
                        // before the upgrade response; echo it first.
                        let extra = buf.split_off(head.raw_len);
                        if !extra.is_empty() {
                            stream.write_all(&extra).unwrap();
                        }
                        let mut chunk = [0u8; 1024];
                        loop {
                            match stream.read(&mut chunk) {
                                Ok(0) | Err(_) => break,
                                Ok(n) => stream.write_all(&chunk[..n]).unwrap(),
                            }
                        }
                    } else {
                        stream
                            .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n")
                            .unwrap();
                    }
                });
            }
        });
    }

    fn start_proxy(dir: &Path) -> DockerProxy {
        let daemon_socket = dir.join("daemon.sock");
        spawn_fake_daemon(daemon_socket.clone());
        let mut proxy = DockerProxy::bind(DockerProxyConfig {
            listen_path: dir.join("docker.sock"),
            daemon_socket,
        })
        .unwrap();
        proxy.start().unwrap();
        proxy
    }

    fn read_to_end(stream: &mut UnixStream) -> Vec<u8> {
        let mut out = Vec::new();
        let _ = stream.read_to_end(&mut out);
        out
    }

    #[test]
    fn allowed_request_round_trips() {
        let tmp = tempfile::TempDir::new().unwrap();
        let proxy = start_proxy(tmp.path());

        let mut client = UnixStream::connect(proxy.listen_path()).unwrap();
        client
            .write_all(b"GET /_ping HTTP/1.1\r\nHost: docker\r\n\r\n")
            .unwrap();
        let response = read_to_end(&mut client);
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK"), "got: {text}");
        assert!(text.ends_with("OK"));
    }

    #[test]
    fn chunked_response_is_relayed_to_completion() {
        let tmp = tempfile::TempDir::new().unwrap();
        let proxy = start_proxy(tmp.path());

        let mut client = UnixStream::connect(proxy.listen_path()).unwrap();
        client
            .write_all(b"GET /events HTTP/1.1\r\nHost: docker\r\n\r\n")
            .unwrap();
        let text = String::from_utf8(read_to_end(&mut client)).unwrap();
        assert!(text.contains("hello"));
        assert!(text.ends_with("0\r\n\r\n"));
    }

    #[test]
    fn write_operations_get_403() {
        let tmp = tempfile::TempDir::new().unwrap();
        let proxy = start_proxy(tmp.path());

        let mut client = UnixStream::connect(proxy.listen_path()).unwrap();
        client
            .write_all(b"POST /containers/create HTTP/1.1\r\nHost: docker\r\nContent-Length: 2\r\n\r\n{}")
            .unwrap();
        let text = String::from_utf8(read_to_end(&mut client)).unwrap();
        assert!(text.starts_with("HTTP/1.1 403 Forbidden"), "got: {text}");
        assert!(text.ends_with(
            "docker proxy: POST /containers/create blocked (write operations not allowed)\n"
        ));
    }

    #[test]
    fn hijack_is_full_duplex() {
        let tmp = tempfile::TempDir::new().unwrap();
        let proxy = start_proxy(tmp.path());

        let mut client = UnixStream::connect(proxy.listen_path()).unwrap();
        // Body bytes ride along with the request head, before the 101
        // arrives; they must still reach the daemon.
        client
            .write_all(
                b"POST /v1.44/exec/abc123/start HTTP/1.1\r\nHost: docker\r\nUpgrade: tcp\r\nConnection: Upgrade\r\n\r\npre-upgrade",
            )
            .unwrap();

        let mut head = Vec::new();
        let response = read_head(&mut client, &mut head).unwrap();
        assert!(response.line.contains("101"));

        // daemon-first arrives without the client sending anything more.
        let mut received = head.split_off(response.raw_len);
        let mut chunk = [0u8; 1024];
        let expect = b"daemon-firstpre-upgrade";
        while received.len() < expect.len() {
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0, "EOF before upgrade data arrived");
            received.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(&received, expect);

        // Client -> daemon -> echo -> client after the upgrade.
        client.write_all(b"interactive").unwrap();
        let mut echoed = Vec::new();
        while echoed.len() < b"interactive".len() {
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0);
            echoed.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(&echoed, b"interactive");

        // Half-close propagates and the proxy tears the tunnel down.
        client.shutdown(std::net::Shutdown::Write).unwrap();
        assert_eq!(read_to_end(&mut client).len(), 0);
    }

    #[test]
    fn stop_is_idempotent_and_removes_socket() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut proxy = start_proxy(tmp.path());
        let path = proxy.listen_path().to_path_buf();
        proxy.stop();
        proxy.stop();
        assert!(!path.exists());
    }
}
