//! Per-socket connection state and the HTTP header reader that runs
//! on top of it. One connection is driven by exactly one thread at a
//! time: either the caller's (foreground) or a dedicated worker
//! (background).

use std::env;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::common::Fault;
use crate::constants::BUFFER_SIZE;
use crate::socket::{Socket, WaitResult};

const CR: u8 = b'\r';
const LF: u8 = b'\n';

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnMode {
    /// The caller's thread runs the whole job inside `process`.
    Foreground,
    /// `process` hands the connection to a worker thread.
    Background,
}

/// Read-only configuration captured into each connection when it is
/// created.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Deadline for reads and for assembling one header field.
    pub timeout: Duration,
    /// Dump bytes read/written to stderr.
    pub trace: bool,
}

impl ServerConfig {
    pub fn new() -> ServerConfig {
        ServerConfig {
            timeout: DEFAULT_TIMEOUT,
            trace: false,
        }
    }

    /// Like `new`, with tracing enabled when `ABYSS_TRACE_CONN` is
    /// set to a non-empty value.
    pub fn from_env() -> ServerConfig {
        let trace = env::var_os("ABYSS_TRACE_CONN").map_or(false, |v| !v.is_empty());
        ServerConfig {
            timeout: DEFAULT_TIMEOUT,
            trace,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig::new()
    }
}

pub type ConnJob<S> = Box<dyn FnOnce(&mut Conn<S>) + Send>;

pub struct Conn<S: Socket> {
    socket: S,
    peer_ip: IpAddr,
    buffer: Box<[u8; BUFFER_SIZE]>,
    buffersize: usize,
    bufferpos: usize,
    inbytes: u64,
    outbytes: u64,
    timeout: Duration,
    trace: bool,
    mode: ConnMode,
    finished: Arc<AtomicBool>,
    job: Option<ConnJob<S>>,
    done: Option<ConnJob<S>>,
}

/// Live handle to a processed connection: observe `finished`, join
/// the worker, request cancellation.
pub struct ConnHandle {
    finished: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ConnHandle {
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Joins the worker, if any, then drops the handle.
    pub fn wait_and_release(self) {
        if let Some(worker) = self.worker {
            let _ = worker.join();
        }
    }

    /// Cooperative termination request: marks the connection finished.
    /// The job is expected to poll [`Conn::is_finished`] at its
    /// blocking points and wind down.
    pub fn kill(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

impl<S: Socket> Conn<S> {
    /** Builds a connection over an accepted socket. The peer address
     * must be resolvable; otherwise no connection is created.
     */
    pub fn create(
        socket: S,
        job: ConnJob<S>,
        done: ConnJob<S>,
        mode: ConnMode,
        config: &ServerConfig,
    ) -> Result<Conn<S>, Fault> {
        let peer = socket
            .peer_name()
            .map_err(|e| Fault::network_error(format!("failed to get peer name from socket: {}", e)))?;
        debug!("new {:?} connection from {}", mode, peer);

        Ok(Conn {
            socket,
            peer_ip: peer.ip(),
            buffer: Box::new([0u8; BUFFER_SIZE]),
            buffersize: 0,
            bufferpos: 0,
            inbytes: 0,
            outbytes: 0,
            timeout: config.timeout,
            trace: config.trace,
            mode,
            finished: Arc::new(AtomicBool::new(false)),
            job: Some(job),
            done: Some(done),
        })
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_ip
    }

    pub fn inbytes(&self) -> u64 {
        self.inbytes
    }

    pub fn outbytes(&self) -> u64 {
        self.outbytes
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /** Compacts unconsumed bytes to the front of the buffer and
     * resets the byte counters, ready for the next transaction.
     */
    pub fn read_init(&mut self) {
        if self.buffersize > self.bufferpos {
            self.buffer.copy_within(self.bufferpos..self.buffersize, 0);
            self.buffersize -= self.bufferpos;
        } else {
            self.buffersize = 0;
        }
        self.bufferpos = 0;
        self.inbytes = 0;
        self.outbytes = 0;
    }

    /** Reads some bytes from the socket into the buffer, waiting at
     * most `timeout` for them. One successful socket read returns;
     * the buffer state is untouched on failure.
     */
    pub fn read(&mut self, timeout: Duration) -> Result<(), Fault> {
        let deadline = Instant::now() + timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Fault::timeout(format!(
                    "no data arrived within {:?}",
                    timeout
                )));
            }

            match self.socket.wait(true, false, deadline - now) {
                WaitResult::Ready => {}
                WaitResult::Timeout => {
                    return Err(Fault::timeout(format!(
                        "no data arrived within {:?}",
                        timeout
                    )))
                }
                WaitResult::Error => {
                    return Err(self.fail_network("wait on socket failed".to_owned()))
                }
            }

            let available = self.socket.available_read_bytes() as usize;
            if available == 0 {
                return Err(self.fail_network("connection closed by peer".to_owned()));
            }

            let space = BUFFER_SIZE - self.buffersize;
            if space <= 1 {
                return Err(Fault::limit_exceeded("connection buffer is full"));
            }

            let want = available.min(space - 1);
            let got = match self
                .socket
                .read(&mut self.buffer[self.buffersize..self.buffersize + want])
            {
                Ok(got) => got,
                Err(e) => return Err(self.fail_network(format!("socket read failed: {}", e))),
            };

            if got > 0 {
                if self.trace {
                    trace_buffer(
                        "READ FROM SOCKET",
                        &self.buffer[self.buffersize..self.buffersize + got],
                    );
                }
                self.inbytes += got as u64;
                self.buffersize += got;
                self.buffer[self.buffersize] = 0;
                return Ok(());
            }
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), Fault> {
        let result = self.socket.write(data);
        if self.trace {
            let label = if result.is_err() {
                "FAILED TO WRITE TO SOCKET"
            } else {
                "WROTE TO SOCKET"
            };
            trace_buffer(label, data);
        }
        match result {
            Ok(()) => {
                self.outbytes += data.len() as u64;
                Ok(())
            }
            Err(e) => Err(self.fail_network(format!("socket write failed: {}", e))),
        }
    }

    /// A network failure is terminal for the connection.
    fn fail_network(&self, message: String) -> Fault {
        self.finished.store(true, Ordering::Release);
        Fault::network_error(message)
    }

    /** Copies the file range `start..=last` to the connection in
     * chunks, metered to roughly `rate` bytes per second when `rate`
     * is nonzero. Succeeds only if the whole range was written.
     */
    pub fn write_from_file(
        &mut self,
        file: &mut File,
        start: u64,
        last: u64,
        scratch: &mut [u8],
        rate: u32,
    ) -> Result<(), Fault> {
        if scratch.is_empty() {
            return Err(Fault::internal("scratch buffer is empty"));
        }
        let (chunk, pause) = if rate > 0 {
            (
                scratch.len().min(rate as usize),
                Duration::from_millis(1000 * scratch.len() as u64 / rate as u64),
            )
        } else {
            (scratch.len(), Duration::ZERO)
        };

        file.seek(SeekFrom::Start(start))
            .map_err(|e| Fault::internal(format!("file seek failed: {}", e)))?;

        let total = last - start + 1;
        let mut written: u64 = 0;

        while written < total {
            let want = (total - written).min(chunk as u64) as usize;
            let got = file
                .read(&mut scratch[..want])
                .map_err(|e| Fault::internal(format!("file read failed: {}", e)))?;
            if got == 0 {
                break;
            }
            self.write(&scratch[..got])?;
            written += got as u64;

            if !pause.is_zero() {
                thread::sleep(pause);
            }
        }

        if written >= total {
            Ok(())
        } else {
            Err(Fault::internal(format!(
                "file ended after {} of {} bytes",
                written, total
            )))
        }
    }

    /** Reads one HTTP header field, merging folded continuation
     * lines: the line terminator of a fold is dropped and the
     * continuation's leading whitespace kept. Tolerates LF and CRLF.
     *
     * The end-of-headers empty line comes back as `""`. The returned
     * view lives in the connection buffer and is gone at the next
     * buffer operation.
     */
    pub fn read_header(&mut self) -> Result<&str, Fault> {
        let deadline = Instant::now() + self.timeout;
        let header_start = self.bufferpos;
        let mut line_start = header_start;
        let mut scan = header_start;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Fault::timeout("no complete header within the timeout"));
            }

            if scan >= self.buffersize {
                self.read(deadline - now)?;
            }

            let lf = match self.buffer[scan..self.buffersize]
                .iter()
                .position(|&b| b == LF)
            {
                Some(off) => scan + off,
                None => {
                    // partial line; everything scanned, need more
                    scan = self.buffersize;
                    continue;
                }
            };

            let empty_line =
                lf == line_start || (lf == line_start + 1 && self.buffer[line_start] == CR);
            if empty_line {
                // end-of-headers marker
                self.bufferpos = lf + 1;
                return Ok("");
            }

            if lf + 1 >= self.buffersize {
                // the byte after the terminator decides whether this
                // line continues; not there yet
                let now = Instant::now();
                if now >= deadline {
                    return Err(Fault::timeout("no complete header within the timeout"));
                }
                self.read(deadline - now)?;
                continue;
            }

            let next = self.buffer[lf + 1];
            if next == b' ' || next == b'\t' {
                // folded continuation: delete the CR?LF terminator so
                // the continuation joins this line
                let term = if lf > header_start && self.buffer[lf - 1] == CR {
                    lf - 1
                } else {
                    lf
                };
                self.buffer.copy_within(lf + 1..self.buffersize, term);
                self.buffersize -= lf + 1 - term;
                self.buffer[self.buffersize] = 0;
                line_start = term;
                scan = term;
            } else {
                // complete header; cut the terminator off
                let end = if lf > header_start && self.buffer[lf - 1] == CR {
                    lf - 1
                } else {
                    lf
                };
                self.bufferpos = lf + 1;
                return std::str::from_utf8(&self.buffer[header_start..end])
                    .map_err(|_| Fault::parse_error("header is not valid UTF-8"));
            }
        }
    }

    fn run_job(&mut self) {
        if let Some(job) = self.job.take() {
            job(self);
        }
        self.finished.store(true, Ordering::Release);
        if let Some(done) = self.done.take() {
            done(self);
        }
        debug!(
            "connection from {} finished ({} bytes in, {} bytes out)",
            self.peer_ip, self.inbytes, self.outbytes
        );
    }
}

impl<S: Socket + Send + 'static> Conn<S> {
    /** Runs the connection's job. Foreground mode runs it on the
     * calling thread; background mode on a fresh worker. Either way
     * `done` runs exactly once, after the job returns.
     */
    pub fn process(mut self) -> Result<ConnHandle, Fault> {
        let finished = self.finished.clone();
        match self.mode {
            ConnMode::Foreground => {
                self.run_job();
                Ok(ConnHandle {
                    finished,
                    worker: None,
                })
            }
            ConnMode::Background => {
                let worker = thread::Builder::new()
                    .name(format!("conn-{}", self.peer_ip))
                    .spawn(move || self.run_job())
                    .map_err(|e| {
                        Fault::internal(format!(
                            "unable to create thread to process connection: {}",
                            e
                        ))
                    })?;
                Ok(ConnHandle {
                    finished,
                    worker: Some(worker),
                })
            }
        }
    }
}

fn trace_buffer(label: &str, data: &[u8]) {
    let non_printable = data
        .iter()
        .filter(|&&b| !(b.is_ascii_graphic() || b == b' ') && b != LF && b != CR)
        .count();
    if non_printable > 0 {
        eprintln!("{} contains {} nonprintable characters.", label, non_printable);
    }
    eprintln!("{}:", label);
    eprintln!("{}", String::from_utf8_lossy(data));
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::{self, Write as _};
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::common::FaultKind;

    struct ScriptedSocket {
        chunks: VecDeque<Vec<u8>>,
        written: Vec<u8>,
        ready_when_empty: bool,
        peer_fails: bool,
    }

    impl ScriptedSocket {
        fn new(chunks: Vec<&[u8]>) -> ScriptedSocket {
            ScriptedSocket {
                chunks: chunks.into_iter().map(|c| c.to_vec()).collect(),
                written: vec![],
                ready_when_empty: false,
                peer_fails: false,
            }
        }
    }

    impl Socket for ScriptedSocket {
        fn wait(&mut self, _for_read: bool, _for_write: bool, _timeout: Duration) -> WaitResult {
            if self.chunks.is_empty() && !self.ready_when_empty {
                WaitResult::Timeout
            } else {
                WaitResult::Ready
            }
        }

        fn available_read_bytes(&mut self) -> u32 {
            self.chunks.front().map_or(0, |c| c.len() as u32)
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut chunk = self.chunks.pop_front().unwrap_or_default();
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.chunks.push_front(chunk.split_off(n));
            }
            Ok(n)
        }

        fn write(&mut self, data: &[u8]) -> io::Result<()> {
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn peer_name(&self) -> io::Result<SocketAddr> {
            if self.peer_fails {
                Err(io::Error::new(io::ErrorKind::NotConnected, "no peer"))
            } else {
                Ok("127.0.0.1:8080".parse().unwrap())
            }
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            timeout: Duration::from_millis(200),
            trace: false,
        }
    }

    fn conn_with(chunks: Vec<&[u8]>) -> Conn<ScriptedSocket> {
        Conn::create(
            ScriptedSocket::new(chunks),
            Box::new(|_| {}),
            Box::new(|_| {}),
            ConnMode::Foreground,
            &test_config(),
        )
        .unwrap()
    }

    #[test]
    fn create_fails_without_peer_name() {
        let mut socket = ScriptedSocket::new(vec![]);
        socket.peer_fails = true;
        let fault = Conn::create(
            socket,
            Box::new(|_| {}),
            Box::new(|_| {}),
            ConnMode::Foreground,
            &test_config(),
        )
        .err()
        .unwrap();
        assert_eq!(fault.kind(), FaultKind::NetworkError);
    }

    #[test]
    fn header_folding_joins_continuation_lines() {
        let mut conn = conn_with(vec![b"X-A: one\r\n two\r\n\tthree\r\nX-B: done\r\n\r\n"]);

        assert_eq!(conn.read_header().unwrap(), "X-A: one two\tthree");
        assert_eq!(conn.read_header().unwrap(), "X-B: done");
        assert_eq!(conn.read_header().unwrap(), "");
    }

    #[test]
    fn header_tolerates_bare_lf_lines() {
        let mut conn = conn_with(vec![b"X-A: one\n two\nX-B: done\n\n"]);

        assert_eq!(conn.read_header().unwrap(), "X-A: one two");
        assert_eq!(conn.read_header().unwrap(), "X-B: done");
        assert_eq!(conn.read_header().unwrap(), "");
    }

    #[test]
    fn header_spanning_several_reads() {
        let mut conn = conn_with(vec![
            b"X-Long: spans",
            b" packets\r\nX",
            b"-Next: ok\r\n\r\n",
        ]);

        assert_eq!(conn.read_header().unwrap(), "X-Long: spans packets");
        assert_eq!(conn.read_header().unwrap(), "X-Next: ok");
        assert_eq!(conn.read_header().unwrap(), "");
    }

    #[test]
    fn header_waits_for_the_byte_after_the_terminator() {
        let mut conn = conn_with(vec![b"A: 1\r\n", b"B: 2\r\n\r\n"]);

        assert_eq!(conn.read_header().unwrap(), "A: 1");
        assert_eq!(conn.read_header().unwrap(), "B: 2");
        assert_eq!(conn.read_header().unwrap(), "");
    }

    #[test]
    fn header_read_times_out_cleanly() {
        let mut conn = conn_with(vec![b"X-A: never finishe"]);
        let fault = conn.read_header().unwrap_err();
        assert_eq!(fault.kind(), FaultKind::Timeout);
    }

    #[test]
    fn read_deadline_leaves_buffer_untouched() {
        let mut conn = conn_with(vec![]);
        let fault = conn.read(Duration::from_millis(30)).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::Timeout);
        assert_eq!(conn.buffersize, 0);
        assert_eq!(conn.bufferpos, 0);
        assert_eq!(conn.inbytes, 0);
    }

    #[test]
    fn read_reports_peer_shutdown() {
        let mut conn = conn_with(vec![]);
        conn.socket.ready_when_empty = true;
        let fault = conn.read(Duration::from_millis(30)).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::NetworkError);
        // a network failure is terminal, a timeout is not
        assert!(conn.is_finished());
    }

    #[test]
    fn read_keeps_the_sentinel_and_buffer_bound() {
        let big = vec![b'a'; BUFFER_SIZE + 1000];
        let mut conn = conn_with(vec![&big[..]]);

        conn.read(Duration::from_millis(30)).unwrap();
        assert_eq!(conn.buffersize, BUFFER_SIZE - 1);
        assert_eq!(conn.buffer[conn.buffersize], 0);
        assert!(conn.buffersize < BUFFER_SIZE);
        assert_eq!(conn.inbytes, (BUFFER_SIZE - 1) as u64);

        // no room left for another byte
        let fault = conn.read(Duration::from_millis(30)).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::LimitExceeded);
    }

    #[test]
    fn read_init_compacts_unconsumed_bytes() {
        let mut conn = conn_with(vec![b"abcdef"]);
        conn.read(Duration::from_millis(30)).unwrap();
        conn.bufferpos = 3;

        conn.read_init();

        assert_eq!(conn.bufferpos, 0);
        assert_eq!(conn.buffersize, 3);
        assert_eq!(&conn.buffer[..3], b"def");
        assert_eq!(conn.inbytes, 0);
        assert_eq!(conn.outbytes, 0);
    }

    #[test]
    fn write_counts_outbound_bytes() {
        let mut conn = conn_with(vec![]);
        conn.write(b"HTTP/1.1 200 OK\r\n").unwrap();
        conn.write(b"\r\n").unwrap();
        assert_eq!(conn.outbytes, 19);
        assert_eq!(&conn.socket.written[..15], b"HTTP/1.1 200 OK");
    }

    #[test]
    fn write_from_file_covers_exactly_the_range() {
        let path = env::temp_dir().join(format!("xmlrpc-conn-{}.bin", std::process::id()));
        let payload: Vec<u8> = (0u8..=99).collect();
        std::fs::File::create(&path)
            .and_then(|mut f| f.write_all(&payload))
            .unwrap();

        let mut conn = conn_with(vec![]);
        let mut scratch = [0u8; 8];
        let mut file = File::open(&path).unwrap();

        conn.write_from_file(&mut file, 10, 29, &mut scratch, 0)
            .unwrap();
        assert_eq!(conn.socket.written, (10u8..=29).collect::<Vec<u8>>());
        assert_eq!(conn.outbytes, 20);

        // a range past the end of the file cannot be satisfied
        let fault = conn
            .write_from_file(&mut file, 90, 120, &mut scratch, 0)
            .unwrap_err();
        assert_eq!(fault.kind(), FaultKind::Internal);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn foreground_runs_done_once_after_job() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (job_events, done_events) = (events.clone(), events.clone());

        let conn = Conn::create(
            ScriptedSocket::new(vec![]),
            Box::new(move |_| job_events.lock().unwrap().push("job")),
            Box::new(move |_| done_events.lock().unwrap().push("done")),
            ConnMode::Foreground,
            &test_config(),
        )
        .unwrap();

        let handle = conn.process().unwrap();
        assert!(handle.is_finished());
        handle.wait_and_release();
        assert_eq!(*events.lock().unwrap(), vec!["job", "done"]);
    }

    #[test]
    fn background_runs_done_once_after_job() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (job_events, done_events) = (events.clone(), events.clone());

        let conn = Conn::create(
            ScriptedSocket::new(vec![b"ping\r\n\r\n"]),
            Box::new(move |conn: &mut Conn<ScriptedSocket>| {
                let header = conn.read_header().unwrap().to_owned();
                job_events.lock().unwrap().push(format!("job:{}", header));
            }),
            Box::new(move |_| done_events.lock().unwrap().push("done".to_owned())),
            ConnMode::Background,
            &test_config(),
        )
        .unwrap();

        let handle = conn.process().unwrap();
        handle.wait_and_release();
        assert_eq!(*events.lock().unwrap(), vec!["job:ping", "done"]);
    }

    #[test]
    fn kill_stops_a_polling_worker() {
        let conn = Conn::create(
            ScriptedSocket::new(vec![]),
            Box::new(|conn: &mut Conn<ScriptedSocket>| {
                while !conn.is_finished() {
                    thread::sleep(Duration::from_millis(1));
                }
            }),
            Box::new(|_| {}),
            ConnMode::Background,
            &test_config(),
        )
        .unwrap();

        let handle = conn.process().unwrap();
        handle.kill();
        handle.wait_and_release();
    }
}
