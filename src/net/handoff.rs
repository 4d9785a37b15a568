//! Listener handoff supervisor.
//!
//! Owns the accepting sockets of this process generation and hands them to
//! a successor generation without closing them.
//!
//! # States
//! ```text
//! Starting → Listening → UpgradeRequested ─────┐
//!                  └───→ TerminationRequested ─┴→ Draining → Exited
//! ```
//!
//! # Handoff
//! 1. `trigger_handoff` spawns the configured program with the readiness
//!    pipe on fd 3 and every listener on fd 4.. (see `inherit.rs`)
//! 2. the successor calls `listen` for the same addresses and gets the
//!    inherited sockets back instead of binding
//! 3. the successor calls `signal_ready`, writing one byte to fd 3
//! 4. this generation sees the byte, `await_exit` resolves with `Upgraded`
//!    and the caller drains
//!
//! A successor that exits, closes the pipe, or misses `ready_timeout` is
//! killed and this generation keeps serving.

use std::ffi::OsString;
use std::fmt;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::time;
use uuid::Uuid;

use super::inherit::{
    encode_listeners, parse_fd, parse_listeners, InheritedFd, FIRST_LISTEN_FD, LISTEN_FDS_ENV, READY_FD,
    READY_FD_ENV,
};
use crate::observability::metrics;

/// Source descriptors are moved above this number before `dup2` so they
/// cannot collide with the fixed target numbers.
const MIN_SOURCE_FD: RawFd = 64;

const LISTEN_BACKLOG: i32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Listening,
    UpgradeRequested,
    TerminationRequested,
    Draining,
    Exited,
}

/// Why this generation should wind down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// An external termination signal arrived.
    Terminated(String),
    /// A successor signalled readiness and now accepts connections.
    Upgraded { successor_pid: u32 },
    /// The serving layer failed.
    Fatal(String),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Terminated(signal) => write!(f, "terminated by {signal}"),
            ExitReason::Upgraded { successor_pid } => write!(f, "upgraded to pid {successor_pid}"),
            ExitReason::Fatal(reason) => write!(f, "fatal: {reason}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("readiness was already signalled")]
    AlreadyReady,

    #[error("an upgrade is already in progress")]
    UpgradeInProgress,

    #[error("this generation has not signalled readiness yet")]
    NotReady,

    #[error("supervisor is not listening (state {0:?})")]
    NotListening(SupervisorState),

    #[error("failed to spawn successor: {0}")]
    Spawn(#[source] io::Error),

    #[error("successor failed before signalling readiness: {0}")]
    SuccessorFailed(String),

    #[error("successor did not signal readiness within {0:?}")]
    ReadyTimeout(Duration),

    #[error("invalid inherited descriptors: {0}")]
    InvalidInheritance(String),

    #[error("unsupported network `{0}`")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A listening socket owned by this generation.
#[derive(Debug)]
pub struct ListenerHandle {
    pub listener: TcpListener,
    pub address: SocketAddr,
    pub generation: Uuid,
    /// Received from a predecessor rather than freshly bound.
    pub inherited: bool,
}

#[derive(Debug, Clone)]
pub struct UpgraderOptions {
    /// Program started as successor.
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// How long a successor may take to signal readiness.
    pub ready_timeout: Duration,
    /// Written on `signal_ready`, removed on `stop`.
    pub pid_file: Option<PathBuf>,
}

impl UpgraderOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            ready_timeout: Duration::from_secs(60),
            pid_file: None,
        }
    }

    /// Re-execute the running binary with its current arguments.
    pub fn current_process() -> io::Result<Self> {
        let mut options = Self::new(std::env::current_exe()?);
        options.args = std::env::args_os().skip(1).collect();
        Ok(options)
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_pid_file(mut self, path: Option<PathBuf>) -> Self {
        self.pid_file = path;
        self
    }
}

struct Passable {
    network: String,
    address: String,
    fd: OwnedFd,
}

struct Inner {
    options: UpgraderOptions,
    generation: Uuid,
    /// Received from the predecessor, not yet claimed by `listen`.
    inherited: Mutex<Vec<Passable>>,
    /// Duplicates of every active listener, handed to a successor.
    owned: Mutex<Vec<Passable>>,
    ready_pipe: Mutex<Option<OwnedFd>>,
    ready: AtomicBool,
    upgrading: AtomicBool,
    state: watch::Sender<SupervisorState>,
    exit: watch::Sender<Option<ExitReason>>,
}

/// Handle to the listener handoff supervisor of this generation.
#[derive(Clone)]
pub struct Upgrader {
    inner: Arc<Inner>,
}

impl Upgrader {
    /// Build a supervisor, adopting descriptors described by the environment.
    pub fn from_env(options: UpgraderOptions) -> Result<Self, HandoffError> {
        let listen_fds = std::env::var(LISTEN_FDS_ENV).ok();
        let ready_fd = std::env::var(READY_FD_ENV).ok();
        Self::with_inheritance(options, listen_fds.as_deref(), ready_fd.as_deref())
    }

    /// Build a supervisor from explicit protocol values.
    ///
    /// Every listed descriptor becomes owned by the supervisor.
    pub fn with_inheritance(
        options: UpgraderOptions,
        listen_fds: Option<&str>,
        ready_fd: Option<&str>,
    ) -> Result<Self, HandoffError> {
        let mut inherited: Vec<Passable> = Vec::new();
        for entry in listen_fds.map(parse_listeners).transpose()?.unwrap_or_default() {
            if inherited.iter().any(|p| p.fd.as_raw_fd() == entry.fd) {
                return Err(HandoffError::InvalidInheritance(format!("descriptor {} listed twice", entry.fd)));
            }
            inherited.push(Passable {
                fd: adopt(entry.fd)?,
                network: entry.network,
                address: entry.address,
            });
        }
        let ready_pipe = ready_fd.map(|raw| parse_fd(raw).and_then(adopt)).transpose()?;

        let generation = Uuid::new_v4();
        if !inherited.is_empty() || ready_pipe.is_some() {
            tracing::info!(
                generation = %generation,
                listeners = inherited.len(),
                "Started as successor generation"
            );
        }

        let (state, _) = watch::channel(SupervisorState::Starting);
        let (exit, _) = watch::channel(None);
        Ok(Self {
            inner: Arc::new(Inner {
                options,
                generation,
                inherited: Mutex::new(inherited),
                owned: Mutex::new(Vec::new()),
                ready_pipe: Mutex::new(ready_pipe),
                ready: AtomicBool::new(false),
                upgrading: AtomicBool::new(false),
                state,
                exit,
            }),
        })
    }

    pub fn generation(&self) -> Uuid {
        self.inner.generation
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        Option::clone(&self.inner.exit.borrow())
    }

    /// Return the inherited socket for `address` if the predecessor passed
    /// one, else bind a fresh one.
    pub fn listen(&self, network: &str, address: &str) -> Result<ListenerHandle, HandoffError> {
        if network != "tcp" {
            return Err(HandoffError::Unsupported(network.to_string()));
        }
        let state = self.state();
        if !matches!(state, SupervisorState::Starting | SupervisorState::Listening) {
            return Err(HandoffError::NotListening(state));
        }

        let claimed = {
            let mut inherited = lock(&self.inner.inherited);
            inherited
                .iter()
                .position(|p| p.network == network && p.address == address)
                .map(|index| inherited.swap_remove(index))
        };
        let (listener, inherited) = match claimed {
            Some(passable) => (TcpListener::from(passable.fd), true),
            None => (bind_fresh(address)?, false),
        };
        listener.set_nonblocking(true)?;
        let bound = listener.local_addr()?;

        lock(&self.inner.owned).push(Passable {
            network: network.to_string(),
            address: address.to_string(),
            fd: OwnedFd::from(listener.try_clone()?),
        });
        self.inner.state.send_if_modified(|state| {
            let starting = *state == SupervisorState::Starting;
            if starting {
                *state = SupervisorState::Listening;
            }
            starting
        });

        tracing::info!(
            generation = %self.inner.generation,
            address = %bound,
            inherited,
            "Listener acquired"
        );

        Ok(ListenerHandle {
            listener,
            address: bound,
            generation: self.inner.generation,
            inherited,
        })
    }

    /// Tell the predecessor (if any) that this generation is serving.
    pub fn signal_ready(&self) -> Result<(), HandoffError> {
        let state = self.state();
        if state != SupervisorState::Listening {
            return Err(HandoffError::NotListening(state));
        }
        if self.inner.ready.swap(true, Ordering::AcqRel) {
            return Err(HandoffError::AlreadyReady);
        }

        let unclaimed: Vec<Passable> = lock(&self.inner.inherited).drain(..).collect();
        for passable in unclaimed {
            tracing::warn!(
                generation = %self.inner.generation,
                network = %passable.network,
                address = %passable.address,
                "Closing inherited listener that was never claimed"
            );
        }

        if let Some(path) = &self.inner.options.pid_file {
            write_pid_file(path)?;
        }
        if let Some(fd) = lock(&self.inner.ready_pipe).take() {
            std::fs::File::from(fd).write_all(b"r")?;
            tracing::info!(generation = %self.inner.generation, "Readiness sent to predecessor");
        }

        tracing::info!(
            generation = %self.inner.generation,
            pid = std::process::id(),
            "Generation ready"
        );
        Ok(())
    }

    /// Spawn a successor and pass it every listener.
    ///
    /// This generation keeps serving; the returned handle resolves once the
    /// successor is ready or has failed.
    pub fn trigger_handoff(&self) -> Result<Successor, HandoffError> {
        let state = self.state();
        if state != SupervisorState::Listening {
            return Err(HandoffError::NotListening(state));
        }
        if !self.inner.ready.load(Ordering::Acquire) {
            return Err(HandoffError::NotReady);
        }
        if self.inner.upgrading.swap(true, Ordering::AcqRel) {
            return Err(HandoffError::UpgradeInProgress);
        }

        self.spawn_successor().inspect_err(|error| {
            self.inner.upgrading.store(false, Ordering::Release);
            metrics::record_handoff("failed");
            tracing::error!(error = %error, "Failed to start successor generation");
        })
    }

    fn spawn_successor(&self) -> Result<Successor, HandoffError> {
        let options = &self.inner.options;
        let (read_end, write_end) = create_pipe()?;

        let mut sources = vec![(dup_above(&write_end)?, READY_FD)];
        drop(write_end);
        let mut described = Vec::new();
        for (index, passable) in lock(&self.inner.owned).iter().enumerate() {
            let target = FIRST_LISTEN_FD + index as RawFd;
            sources.push((dup_above(&passable.fd)?, target));
            described.push(InheritedFd {
                network: passable.network.clone(),
                address: passable.address.clone(),
                fd: target,
            });
        }
        let pairs: Vec<(RawFd, RawFd)> = sources.iter().map(|(fd, target)| (fd.as_raw_fd(), *target)).collect();

        let mut command = Command::new(&options.program);
        command
            .args(&options.args)
            .env(READY_FD_ENV, READY_FD.to_string())
            .env(LISTEN_FDS_ENV, encode_listeners(&described))
            .kill_on_drop(false);
        // SAFETY: the hook runs between fork and exec and only calls dup2 on
        // descriptors that stay open until spawn returns.
        unsafe {
            command.pre_exec(move || {
                for &(source, target) in &pairs {
                    if libc::dup2(source, target) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(HandoffError::Spawn)?;
        drop(sources);
        let pid = child.id().unwrap_or_default();
        let receiver = pipe::Receiver::from_owned_fd(read_end)?;

        tracing::info!(
            generation = %self.inner.generation,
            successor_pid = pid,
            program = %options.program.display(),
            listeners = described.len(),
            "Successor generation spawned"
        );

        let (tx, rx) = oneshot::channel();
        let upgrader = self.clone();
        let ready_timeout = options.ready_timeout;
        tokio::spawn(async move {
            let outcome = upgrader.await_successor(child, receiver, pid, ready_timeout).await;
            let _ = tx.send(outcome);
        });

        Ok(Successor { pid, outcome: rx })
    }

    async fn await_successor(
        &self,
        mut child: Child,
        mut receiver: pipe::Receiver,
        pid: u32,
        ready_timeout: Duration,
    ) -> Result<(), HandoffError> {
        let mut byte = [0u8; 1];
        let outcome = match time::timeout(ready_timeout, receiver.read(&mut byte)).await {
            Ok(Ok(1)) => Ok(()),
            Ok(Ok(_)) => Err(HandoffError::SuccessorFailed(describe_exit(&mut child).await)),
            Ok(Err(error)) => Err(HandoffError::Io(error)),
            Err(_) => Err(HandoffError::ReadyTimeout(ready_timeout)),
        };

        match &outcome {
            Ok(()) => {
                self.inner.state.send_if_modified(|state| {
                    let listening = *state == SupervisorState::Listening;
                    if listening {
                        *state = SupervisorState::UpgradeRequested;
                    }
                    listening
                });
                self.set_exit(ExitReason::Upgraded { successor_pid: pid });
                metrics::record_handoff("succeeded");
                tracing::info!(successor_pid = pid, "Successor ready, handing over");
            }
            Err(error) => {
                if child.start_kill().is_ok() {
                    let _ = child.wait().await;
                }
                self.inner.upgrading.store(false, Ordering::Release);
                metrics::record_handoff("failed");
                tracing::warn!(successor_pid = pid, error = %error, "Upgrade failed, continuing to serve");
            }
        }
        outcome
    }

    /// Ask this generation to wind down after a termination signal.
    pub fn request_termination(&self, signal: &str) {
        self.inner.state.send_if_modified(|state| {
            let active = matches!(*state, SupervisorState::Starting | SupervisorState::Listening);
            if active {
                *state = SupervisorState::TerminationRequested;
            }
            active
        });
        self.set_exit(ExitReason::Terminated(signal.to_string()));
    }

    /// Record an unrecoverable serving error.
    pub fn report_fatal(&self, reason: impl Into<String>) {
        self.set_exit(ExitReason::Fatal(reason.into()));
    }

    /// Wait for the first exit reason: termination, upgrade or fatal error.
    pub async fn await_exit(&self) -> ExitReason {
        let mut exit = self.inner.exit.subscribe();
        let reason = match exit.wait_for(Option::is_some).await {
            Ok(reason) => Option::clone(&reason)
                .unwrap_or_else(|| ExitReason::Fatal("exit reason missing".to_string())),
            Err(_) => ExitReason::Fatal("supervisor dropped".to_string()),
        };
        reason
    }

    /// Stop accepting on behalf of this generation.
    pub fn begin_drain(&self) {
        self.inner.state.send_if_modified(|state| {
            let changed = !matches!(*state, SupervisorState::Draining | SupervisorState::Exited);
            if changed {
                *state = SupervisorState::Draining;
            }
            changed
        });
    }

    /// Release every descriptor still held and remove the pid file.
    pub fn stop(&self) {
        let released = {
            let mut owned = lock(&self.inner.owned);
            let count = owned.len();
            owned.clear();
            count
        };
        lock(&self.inner.inherited).clear();
        lock(&self.inner.ready_pipe).take();

        if let Some(path) = &self.inner.options.pid_file {
            remove_pid_file(path);
        }
        self.inner.state.send_replace(SupervisorState::Exited);
        tracing::info!(generation = %self.inner.generation, released, "Listener released");
    }

    fn set_exit(&self, reason: ExitReason) {
        let mut accepted = None;
        self.inner.exit.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            accepted = Some(reason.to_string());
            *slot = Some(reason);
            true
        });
        if let Some(reason) = accepted {
            tracing::info!(generation = %self.inner.generation, reason = %reason, "Exit requested");
        }
    }
}

/// A successor generation that was spawned but may not be ready yet.
#[derive(Debug)]
pub struct Successor {
    pid: u32,
    outcome: oneshot::Receiver<Result<(), HandoffError>>,
}

impl Successor {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Resolve once the successor signalled readiness or failed.
    pub async fn ready(self) -> Result<(), HandoffError> {
        self.outcome
            .await
            .unwrap_or_else(|_| Err(HandoffError::SuccessorFailed("supervisor went away".to_string())))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn bind_fresh(address: &str) -> Result<TcpListener, HandoffError> {
    let bind_error = |source: io::Error| HandoffError::Bind {
        address: address.to_string(),
        source,
    };
    let addr: SocketAddr = address
        .parse()
        .map_err(|e| bind_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.bind(&addr.into()).map_err(bind_error)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_error)?;
    Ok(socket.into())
}

/// Take ownership of a descriptor passed by the predecessor.
fn adopt(fd: RawFd) -> Result<OwnedFd, HandoffError> {
    // SAFETY: F_GETFD only inspects the descriptor table.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(HandoffError::InvalidInheritance(format!("descriptor {fd} is not open")));
    }
    // SAFETY: as above; keeps the descriptor out of unrelated children.
    unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    // SAFETY: the predecessor handed this descriptor to this process only
    // and nothing else here has wrapped it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn create_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    // SAFETY: fds is a valid buffer of two descriptors.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe returned two fresh descriptors owned by nobody else.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [&read, &write] {
        // SAFETY: fd is open for the duration of the call.
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok((read, write))
}

fn dup_above(fd: &OwnedFd) -> io::Result<OwnedFd> {
    // SAFETY: F_DUPFD_CLOEXEC returns a new descriptor or -1.
    let duplicate = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, MIN_SOURCE_FD) };
    if duplicate < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: duplicate is a fresh descriptor owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(duplicate) })
}

async fn describe_exit(child: &mut Child) -> String {
    match time::timeout(Duration::from_secs(1), child.wait()).await {
        Ok(Ok(status)) => format!("exited with {status}"),
        Ok(Err(error)) => format!("wait failed: {error}"),
        Err(_) => "closed the readiness pipe without signalling".to_string(),
    }
}

fn write_pid_file(path: &Path) -> io::Result<()> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    std::fs::write(&staging, format!("{}\n", std::process::id()))?;
    std::fs::rename(&staging, path)
}

fn remove_pid_file(path: &Path) {
    let ours = std::fs::read_to_string(path)
        .map(|content| content.trim() == std::process::id().to_string())
        .unwrap_or(false);
    if ours {
        if let Err(error) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %error, "Failed to remove pid file");
        }
    }
}
