// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! Stream-socket plumbing: framed connections, listeners, and the remote
//! balancer.
//!
//! Connections are synchronous at heart; the async variants run the same
//! operation on a shared dispatch pool and hand the outcome to a callback.
//! A callback returning false closes the connection.

pub mod balancer;
pub mod frame;

use std::io::{BufReader, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::Error;
use crate::pool::TaskRunner;
use crate::proto::{Status, StatusCode, Universal};
use frame::FrameError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Where a peer lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndPoint {
    Unix(PathBuf),
    Tcp(String, u16),
}

impl std::fmt::Display for EndPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndPoint::Unix(path) => write!(f, "unix:{}", path.display()),
            EndPoint::Tcp(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Socket deadlines, applied through socket options before the connection
/// is handed to the caller.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
    pub send: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: Duration::from_secs(5),
            read: Duration::from_secs(60),
            send: Duration::from_secs(10),
        }
    }
}

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    fn try_clone(&self) -> std::io::Result<Stream> {
        match self {
            Stream::Unix(s) => s.try_clone().map(Stream::Unix),
            Stream::Tcp(s) => s.try_clone().map(Stream::Tcp),
        }
    }

    fn set_timeouts(&self, timeouts: &Timeouts) -> std::io::Result<()> {
        match self {
            Stream::Unix(s) => {
                s.set_read_timeout(Some(timeouts.read))?;
                s.set_write_timeout(Some(timeouts.send))
            }
            Stream::Tcp(s) => {
                s.set_read_timeout(Some(timeouts.read))?;
                s.set_write_timeout(Some(timeouts.send))
            }
        }
    }

    fn shutdown(&self) {
        match self {
            Stream::Unix(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
            Stream::Tcp(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Unix(s) => s.flush(),
            Stream::Tcp(s) => s.flush(),
        }
    }
}

fn status_of(error: FrameError) -> Status {
    match error {
        FrameError::BadMessage(message) => Status::new(StatusCode::BadMessage, message),
        FrameError::Network(message) => Status::new(StatusCode::Network, message),
    }
}

/// One framed request/response channel over an established socket.
pub struct Connection {
    reader: Mutex<BufReader<Stream>>,
    writer: Mutex<Stream>,
    closed: AtomicBool,
}

impl Connection {
    fn from_stream(stream: Stream, timeouts: &Timeouts) -> std::io::Result<Connection> {
        stream.set_timeouts(timeouts)?;
        let writer = stream.try_clone()?;
        Ok(Connection {
            reader: Mutex::new(BufReader::new(stream)),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        })
    }

    pub fn from_unix(stream: UnixStream, timeouts: &Timeouts) -> std::io::Result<Connection> {
        Connection::from_stream(Stream::Unix(stream), timeouts)
    }

    pub fn from_tcp(stream: TcpStream, timeouts: &Timeouts) -> std::io::Result<Connection> {
        Connection::from_stream(Stream::Tcp(stream), timeouts)
    }

    /// Dial a peer, honoring the connect timeout for TCP endpoints.
    pub fn connect(endpoint: &EndPoint, timeouts: &Timeouts) -> std::io::Result<Connection> {
        match endpoint {
            EndPoint::Unix(path) => {
                Connection::from_unix(UnixStream::connect(path)?, timeouts)
            }
            EndPoint::Tcp(host, port) => {
                let mut last_error =
                    std::io::Error::new(std::io::ErrorKind::NotFound, "address did not resolve");
                for addr in (host.as_str(), *port).to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, timeouts.connect) {
                        Ok(stream) => return Connection::from_tcp(stream, timeouts),
                        Err(e) => last_error = e,
                    }
                }
                Err(last_error)
            }
        }
    }

    /// Block up to the read timeout for exactly one framed message.
    pub fn read(&self) -> Result<Universal, Status> {
        if self.is_closed() {
            return Err(Status::new(
                StatusCode::Inconsequent,
                "read on a closed connection",
            ));
        }
        let mut reader = lock(&self.reader);
        frame::read_from(&mut *reader).map_err(|e| {
            let status = status_of(e);
            drop(reader);
            self.close();
            status
        })
    }

    /// Serialize, frame, write, flush.
    pub fn send(&self, message: &Universal) -> Result<(), Status> {
        if self.is_closed() {
            return Err(Status::new(
                StatusCode::Inconsequent,
                "send on a closed connection",
            ));
        }
        let bytes = frame::encode(message).map_err(status_of)?;
        let mut writer = lock(&self.writer);
        writer
            .write_all(&bytes)
            .and_then(|()| writer.flush())
            .map_err(|e| {
                drop(writer);
                self.close();
                Status::new(StatusCode::Network, format!("failed to send message: {}", e))
            })
    }

    /// Reply with a bare status and close.
    pub fn send_status(&self, status: Status) {
        if let Err(e) = self.send(&Universal::from_status(status)) {
            tracing::debug!("failed to report status: {}", e.description);
        }
        self.close();
    }

    /// Run a read on the dispatch pool; the callback fires with the
    /// outcome and closes the connection by returning false.
    pub fn read_async<F>(self: Arc<Self>, runner: &TaskRunner, callback: F) -> bool
    where
        F: FnOnce(&Arc<Connection>, Result<Universal, Status>) -> bool + Send + 'static,
    {
        runner.spawn(move || {
            let result = self.read();
            if !callback(&self, result) {
                self.close();
            }
        })
    }

    /// Run a send on the dispatch pool; same callback contract as reads.
    pub fn send_async<F>(self: Arc<Self>, runner: &TaskRunner, message: Universal, callback: F) -> bool
    where
        F: FnOnce(&Arc<Connection>, Result<(), Status>) -> bool + Send + 'static,
    {
        runner.spawn(move || {
            let result = self.send(&message);
            if !callback(&self, result) {
                self.close();
            }
        })
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            lock(&self.writer).shutdown();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Handles one incoming message; return false to close the connection.
pub type MessageHandler = dyn Fn(&Arc<Connection>, Result<Universal, Status>) -> bool + Send + Sync;

enum Acceptor {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// Accept loop feeding incoming connections to a message handler via the
/// dispatch pool.
pub struct Listener {
    endpoint: EndPoint,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    pub fn bind(
        endpoint: EndPoint,
        timeouts: Timeouts,
        runner: Arc<TaskRunner>,
        handler: Arc<MessageHandler>,
    ) -> crate::error::Result<Listener> {
        let acceptor = match &endpoint {
            EndPoint::Unix(path) => {
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                Acceptor::Unix(UnixListener::bind(path).map_err(Error::Network)?)
            }
            EndPoint::Tcp(host, port) => Acceptor::Tcp(
                TcpListener::bind((host.as_str(), *port)).map_err(Error::Network)?,
            ),
        };

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            let builder = std::thread::Builder::new().name("listener".to_string());
            builder
                .spawn(move || accept_loop(acceptor, &stop, timeouts, &runner, &handler))
                .map_err(Error::Network)?
        };

        tracing::info!("listening on {}", endpoint);
        Ok(Listener {
            endpoint,
            stop,
            thread: Some(thread),
        })
    }

    /// Stop accepting and join the accept thread.
    pub fn stop(&mut self) {
        if self.thread.is_none() {
            return;
        }
        self.stop.store(true, Ordering::Release);
        // Poke the blocked accept with a throwaway connection.
        match &self.endpoint {
            EndPoint::Unix(path) => {
                let _ = UnixStream::connect(path);
            }
            EndPoint::Tcp(host, port) => {
                let host = if host == "0.0.0.0" { "127.0.0.1" } else { host };
                let _ = TcpStream::connect((host, *port));
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if let EndPoint::Unix(path) = &self.endpoint {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    acceptor: Acceptor,
    stop: &AtomicBool,
    timeouts: Timeouts,
    runner: &Arc<TaskRunner>,
    handler: &Arc<MessageHandler>,
) {
    loop {
        let connection = match &acceptor {
            Acceptor::Unix(listener) => listener
                .accept()
                .and_then(|(stream, _)| Connection::from_unix(stream, &timeouts)),
            Acceptor::Tcp(listener) => listener
                .accept()
                .and_then(|(stream, _)| Connection::from_tcp(stream, &timeouts)),
        };
        if stop.load(Ordering::Acquire) {
            return;
        }
        let connection = match connection {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                tracing::warn!("failed to accept connection: {}", e);
                continue;
            }
        };

        let handler = Arc::clone(handler);
        connection.read_async(runner, move |connection, result| {
            handler(connection, result)
        });
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
