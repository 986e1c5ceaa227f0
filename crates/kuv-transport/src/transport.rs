//! Transport facade
//!
//! Owns the transport threads and the listeners for one endpoint.
//!
//! With one thread a plain [`Listener`] accepts and handles everything.
//! With `n > 1` threads, thread 0 runs the [`ListenerPrimary`] (public
//! endpoint plus internal pipe) and threads `1..n` run a
//! [`ListenerSecondary`] each. All of them share one pipe path and one
//! random handshake generated per bind. The handshake is drawn separately
//! from the pipe name, so listing the pipe's directory does not reveal it.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cfg_if::cfg_if;
use kuv_core::constants::HANDSHAKE_LEN;
use kuv_core::{Result, UvError};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::handler::ConnectionHandler;
use crate::listener::Listener;
use crate::listener_primary::{DispatchSnapshot, ListenerPrimary};
use crate::listener_secondary::ListenerSecondary;
use crate::options::{ListenOptions, TransportOptions};
use crate::thread::{ThreadStop, TransportThread};

cfg_if! {
    if #[cfg(windows)] {
        const PIPE_PREFIX: &str = r"\\.\pipe\kestrel_";
    } else {
        const PIPE_PREFIX: &str = "/tmp/kestrel_";
    }
}

/// Internal pipe path for one bind
pub fn pipe_path(id: &Uuid) -> PathBuf {
    PathBuf::from(format!("{PIPE_PREFIX}{id}"))
}

enum Binding {
    Single(Listener),
    Multi {
        primary: ListenerPrimary,
        secondaries: Vec<ListenerSecondary>,
    },
}

pub struct Transport {
    options: Arc<TransportOptions>,
    listen: Arc<ListenOptions>,
    handler: Arc<dyn ConnectionHandler>,
    threads: Vec<Arc<TransportThread>>,
    binding: Option<Binding>,
    local_addr: Option<SocketAddr>,
}

impl Transport {
    pub fn new<H: ConnectionHandler>(
        listen: ListenOptions,
        options: TransportOptions,
        handler: H,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options: Arc::new(options),
            listen: Arc::new(listen),
            handler: Arc::new(handler),
            threads: Vec::new(),
            binding: None,
            local_addr: None,
        })
    }

    /// Start the threads (first bind only) and the listeners.
    ///
    /// Returns the bound address; useful when the endpoint asked for port 0.
    pub fn bind(&mut self) -> Result<SocketAddr> {
        if self.binding.is_some() {
            return Err(UvError::InvalidConfig("transport is already bound"));
        }
        if self.threads.is_empty() {
            self.start_threads()?;
        }

        let bound = if self.threads.len() == 1 {
            self.bind_single()
        } else {
            self.bind_multi()
        };
        match bound {
            Ok((binding, addr)) => {
                self.binding = Some(binding);
                self.local_addr = Some(addr);
                info!(%addr, threads = self.threads.len(), "transport bound");
                Ok(addr)
            }
            Err(err) => {
                error!(endpoint = %self.listen.endpoint(), error = %err, "failed to bind transport");
                self.stop_threads();
                Err(err)
            }
        }
    }

    fn start_threads(&mut self) -> Result<()> {
        for index in 0..self.options.thread_count {
            let thread = Arc::new(TransportThread::new(index));
            if let Err(err) = thread.start() {
                self.stop_threads();
                return Err(err);
            }
            self.threads.push(thread);
        }
        Ok(())
    }

    fn bind_single(&self) -> Result<(Binding, SocketAddr)> {
        let mut listener = Listener::new(self.options.clone(), self.handler.clone());
        let addr = listener.start(self.listen.clone(), self.threads[0].clone())?;
        Ok((Binding::Single(listener), addr))
    }

    fn bind_multi(&self) -> Result<(Binding, SocketAddr)> {
        let path = pipe_path(&Uuid::new_v4());
        let secret = Uuid::new_v4();
        let handshake: &[u8; HANDSHAKE_LEN] = secret.as_bytes();

        let mut primary = ListenerPrimary::new(self.options.clone(), self.handler.clone());
        let addr = primary.start(&path, handshake, self.listen.clone(), self.threads[0].clone())?;

        let mut secondaries = Vec::with_capacity(self.threads.len() - 1);
        for thread in &self.threads[1..] {
            let mut secondary = ListenerSecondary::new(self.options.clone(), self.handler.clone());
            match secondary.start(&path, handshake, self.listen.clone(), thread.clone()) {
                Ok(()) => secondaries.push(secondary),
                // the primary keeps serving with the secondaries it has
                Err(err) => error!(thread = thread.name(), error = %err, "secondary listener failed to start"),
            }
        }
        debug!(path = %path.display(), secondaries = secondaries.len(), "listeners started");
        Ok((
            Binding::Multi {
                primary,
                secondaries,
            },
            addr,
        ))
    }

    /// Stop accepting. Threads stay up and open connections keep running.
    pub fn unbind(&mut self) -> Result<()> {
        self.local_addr = None;
        match self.binding.take() {
            None => Ok(()),
            Some(Binding::Single(mut listener)) => listener.dispose(),
            Some(Binding::Multi {
                mut primary,
                mut secondaries,
            }) => {
                for secondary in &mut secondaries {
                    if let Err(err) = secondary.dispose() {
                        debug!(error = %err, "secondary listener already gone");
                    }
                }
                primary.dispose()
            }
        }
    }

    /// Unbind, then stop every thread in parallel
    pub fn stop(&mut self) -> Vec<ThreadStop> {
        if let Err(err) = self.unbind() {
            debug!(error = %err, "unbind during stop failed");
        }
        self.stop_threads()
    }

    fn stop_threads(&mut self) -> Vec<ThreadStop> {
        let timeout = self.options.shutdown_timeout;
        let threads: Vec<_> = self.threads.drain(..).collect();
        std::thread::scope(|scope| {
            let stops: Vec<_> = threads
                .iter()
                .map(|thread| scope.spawn(move || thread.stop(timeout)))
                .collect();
            stops
                .into_iter()
                .map(|stop| stop.join().unwrap_or(ThreadStop::TimedOut))
                .collect()
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn threads(&self) -> &[Arc<TransportThread>] {
        &self.threads
    }

    /// Internal pipe path of the current multi-thread binding
    pub fn pipe_path(&self) -> Option<&Path> {
        match &self.binding {
            Some(Binding::Multi { primary, .. }) => primary.pipe_path(),
            _ => None,
        }
    }

    /// Round-robin state of the current multi-thread binding
    pub fn dispatch_snapshot(&self) -> Option<DispatchSnapshot> {
        match &self.binding {
            Some(Binding::Multi { primary, .. }) => Some(primary.dispatch_snapshot()),
            _ => None,
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if self.binding.is_some() || !self.threads.is_empty() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::{self, BufRead, BufReader, Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use crate::handler::{ConnectionAdapter, ConnectionContext, LoggingAdapter};

    fn local() -> ListenOptions {
        ListenOptions::new("127.0.0.1:0".parse().unwrap())
    }

    fn options(threads: usize) -> TransportOptions {
        TransportOptions::new()
            .thread_count(threads)
            .shutdown_timeout(Duration::from_secs(2))
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn thread_name_handler(ctx: &mut ConnectionContext) -> io::Result<()> {
        let name = ctx.thread_name().to_string();
        ctx.output().write_all(name.as_bytes())
    }

    fn served_by(addr: SocketAddr) -> String {
        let mut client = connect(addr);
        let mut name = String::new();
        client.read_to_string(&mut name).unwrap();
        name
    }

    /// Minimal HTTP/1.0 body echo
    fn http_echo(ctx: &mut ConnectionContext, bodies: &mpsc::Sender<Vec<u8>>) -> io::Result<()> {
        let (input, output) = ctx.streams();
        let mut reader = BufReader::new(input);
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 || line == "\r\n" {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body)?;
        output.write_all(&body)?;
        let _ = bodies.send(body);
        Ok(())
    }

    #[test]
    fn test_http_body_is_echoed() {
        let (tx, rx) = mpsc::channel();
        let mut transport = Transport::new(
            local().with_adapter(LoggingAdapter),
            options(1),
            move |ctx: &mut ConnectionContext| http_echo(ctx, &tx),
        )
        .unwrap();
        let addr = transport.bind().unwrap();

        let mut client = connect(addr);
        client
            .write_all(b"POST / HTTP/1.0\r\nContent-Length: 11\r\n\r\nHello World")
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert_eq!(response, b"Hello World");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            b"Hello World"
        );

        assert_eq!(transport.stop(), vec![ThreadStop::Graceful]);
    }

    #[test]
    fn test_round_robin_across_two_threads() {
        let mut transport = Transport::new(local(), options(2), thread_name_handler).unwrap();
        let addr = transport.bind().unwrap();
        assert_eq!(transport.dispatch_snapshot().unwrap().secondary_count(), 1);

        let names: Vec<String> = (0..6).map(|_| served_by(addr)).collect();
        assert_eq!(names[0], "kuv-thread-0");
        for pair in names.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
        let distinct: HashSet<_> = names.iter().collect();
        assert_eq!(distinct.len(), 2);

        transport.stop();
        assert!(transport.threads().is_empty());
    }

    #[test]
    fn test_stray_pipe_clients_are_ignored() {
        let mut transport = Transport::new(local(), options(2), thread_name_handler).unwrap();
        let addr = transport.bind().unwrap();
        let path = transport.pipe_path().unwrap().to_path_buf();

        // wrong handshake: closed by the primary
        let mut stray = UnixStream::connect(&path).unwrap();
        stray
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stray.write_all(&[0xAA; 16]).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(stray.read(&mut buf), Ok(0) | Err(_)));

        // silent client: never admitted
        let _silent = UnixStream::connect(&path).unwrap();

        assert_eq!(transport.dispatch_snapshot().unwrap().secondary_count(), 1);
        let names: HashSet<String> = (0..4).map(|_| served_by(addr)).collect();
        let expected: HashSet<String> =
            ["kuv-thread-0".to_string(), "kuv-thread-1".to_string()].into();
        assert_eq!(names, expected);

        transport.stop();
        assert!(!path.exists());
    }

    #[test]
    fn test_pipe_name_does_not_reveal_handshake() {
        let mut transport = Transport::new(local(), options(2), thread_name_handler).unwrap();
        let addr = transport.bind().unwrap();
        let path = transport.pipe_path().unwrap().to_path_buf();
        let name = path.file_name().unwrap().to_str().unwrap();
        let guessed = Uuid::parse_str(name.trim_start_matches("kestrel_")).unwrap();

        let mut guesser = UnixStream::connect(&path).unwrap();
        guesser
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        guesser.write_all(guessed.as_bytes()).unwrap();
        let mut ack = [0u8; HANDSHAKE_LEN];
        assert!(matches!(guesser.read(&mut ack), Ok(0) | Err(_)));

        assert_eq!(transport.dispatch_snapshot().unwrap().secondary_count(), 1);
        let names: HashSet<String> = (0..4).map(|_| served_by(addr)).collect();
        let expected: HashSet<String> =
            ["kuv-thread-0".to_string(), "kuv-thread-1".to_string()].into();
        assert_eq!(names, expected);
        transport.stop();
    }

    #[test]
    fn test_cancelled_output_is_cut_short() {
        const TOTAL: usize = 32 * 1024 * 1024;
        let (tx, rx) = mpsc::channel();
        let mut transport = Transport::new(
            local(),
            options(1).output_water_marks(2 * TOTAL, TOTAL),
            move |ctx: &mut ConnectionContext| -> io::Result<()> {
                ctx.output().write_all(&vec![b'x'; TOTAL])?;
                ctx.cancel_output();
                let late = ctx.output().write_all(b"late").map_err(|e| e.kind());
                let _ = tx.send((ctx.closed(), late));
                Ok(())
            },
        )
        .unwrap();
        let addr = transport.bind().unwrap();

        // not reading yet: most of the output is still queued when cancelled
        let mut client = connect(addr);
        let (closed, late) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(late, Err(io::ErrorKind::ConnectionReset));
        assert_eq!(
            closed.wait_timeout(Duration::from_secs(5)),
            Some(Err(UvError::ConnectionAborted("output cancelled".into())))
        );

        let mut got = Vec::new();
        match client.read_to_end(&mut got) {
            Ok(_) => assert!(got.len() < TOTAL),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }
        transport.stop();
    }

    #[test]
    fn test_graceful_stop_without_connections() {
        let mut transport = Transport::new(local(), options(2), thread_name_handler).unwrap();
        transport.bind().unwrap();
        transport.unbind().unwrap();
        let started = Instant::now();
        assert_eq!(
            transport.stop(),
            vec![ThreadStop::Graceful, ThreadStop::Graceful]
        );
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_stop_forces_stuck_connection_closed() {
        let (tx, rx) = mpsc::channel();
        let mut transport = Transport::new(
            local(),
            options(1).shutdown_timeout(Duration::from_millis(100)),
            move |ctx: &mut ConnectionContext| -> io::Result<()> {
                let _ = tx.send(ctx.closed());
                // blocks until the transport gives up on the connection
                let mut buf = [0u8; 16];
                let read = ctx.input().read(&mut buf);
                assert!(read.is_err());
                Ok(())
            },
        )
        .unwrap();
        let addr = transport.bind().unwrap();

        let _client = connect(addr);
        let closed = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let started = Instant::now();
        assert_eq!(transport.stop(), vec![ThreadStop::Rude]);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            closed.wait_timeout(Duration::from_secs(1)),
            Some(Err(UvError::ConnectionAborted(_)))
        ));
    }

    #[test]
    fn test_large_upload_survives_backpressure() {
        const TOTAL: usize = 4 * 1024 * 1024;
        let mut transport = Transport::new(
            local(),
            options(1).input_water_marks(16 * 1024, 4 * 1024),
            |ctx: &mut ConnectionContext| -> io::Result<()> {
                let mut total = 0usize;
                let mut buf = [0u8; 1000];
                loop {
                    let n = ctx.input().read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    total += n;
                }
                ctx.output().write_all(total.to_string().as_bytes())
            },
        )
        .unwrap();
        let addr = transport.bind().unwrap();

        let mut client = connect(addr);
        let chunk = vec![7u8; 64 * 1024];
        for _ in 0..TOTAL / chunk.len() {
            client.write_all(&chunk).unwrap();
        }
        client.shutdown(Shutdown::Write).unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert_eq!(reply, TOTAL.to_string());

        transport.stop();
    }

    #[test]
    fn test_handler_abort_resets_peer() {
        let (tx, rx) = mpsc::channel();
        let mut transport = Transport::new(
            local(),
            options(1),
            move |ctx: &mut ConnectionContext| -> io::Result<()> {
                ctx.output().write_all(b"partial")?;
                let _ = tx.send(ctx.closed());
                ctx.abort("bye");
                Ok(())
            },
        )
        .unwrap();
        let addr = transport.bind().unwrap();

        let _client = connect(addr);
        let closed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            closed.wait_timeout(Duration::from_secs(5)),
            Some(Err(UvError::ConnectionAborted("bye".into())))
        );
        transport.stop();
    }

    struct Prefix(&'static str);

    impl ConnectionAdapter for Prefix {
        fn name(&self) -> &str {
            self.0
        }

        fn on_connection(&self, mut ctx: ConnectionContext) -> io::Result<ConnectionContext> {
            ctx.output().write_all(self.0.as_bytes())?;
            Ok(ctx)
        }
    }

    #[test]
    fn test_adapters_run_in_order() {
        let listen = local().with_adapter(Prefix("a")).with_adapter(Prefix("b"));
        let mut transport = Transport::new(listen, options(1), |ctx: &mut ConnectionContext| -> io::Result<()> {
            ctx.output().write_all(b"!")
        })
        .unwrap();
        let addr = transport.bind().unwrap();

        let mut client = connect(addr);
        let mut got = String::new();
        client.read_to_string(&mut got).unwrap();
        assert_eq!(got, "ab!");
        transport.stop();
    }

    #[test]
    fn test_rebind_reuses_threads() {
        let mut transport = Transport::new(local(), options(2), thread_name_handler).unwrap();
        transport.bind().unwrap();
        assert!(transport.bind().is_err());
        transport.unbind().unwrap();
        assert_eq!(transport.local_addr(), None);
        assert_eq!(transport.threads().len(), 2);

        let second = transport.bind().unwrap();
        assert_eq!(transport.local_addr(), Some(second));
        assert_ne!(transport.pipe_path(), None);
        assert!(!served_by(second).is_empty());
        transport.stop();
    }

    #[test]
    fn test_address_in_use_fails_bind_and_stops_threads() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let mut transport =
            Transport::new(ListenOptions::new(addr), options(2), thread_name_handler).unwrap();
        assert_eq!(transport.bind(), Err(UvError::AddressInUse(addr)));
        assert!(transport.threads().is_empty());
    }

    #[test]
    fn test_invalid_options_rejected() {
        assert!(Transport::new(local(), options(0), thread_name_handler).is_err());
    }

    #[test]
    #[cfg(unix)]
    fn test_pipe_path_format() {
        let id = Uuid::nil();
        assert_eq!(
            pipe_path(&id),
            PathBuf::from("/tmp/kestrel_00000000-0000-0000-0000-000000000000")
        );
    }
}
