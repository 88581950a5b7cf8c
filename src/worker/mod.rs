use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;

use crate::auth;
use crate::config::{BrokerUri, ConfigError, WorkerConfig};
use crate::connection::{Connection, ConnectionError};
use crate::job::{ConnectOptions, Handshake, Job, PROTOCOL_VERSION};
use crate::logging::{Logger, LoggerConfig};
use crate::pool::{TaskFault, TaskHandle, TaskOutcome, WorkerPool};
use crate::registry::{Handler, TaskRegistry};

pub const IDLE_SLEEP: Duration = Duration::from_millis(250);
pub const DRAIN_WAIT: Duration = Duration::from_secs(1);
pub const FORCED_DISCONNECT_WAIT_SECS: u64 = 30;
pub const TERMINATE_DISCONNECT_WAIT_SECS: u64 = 25;
pub const INTERRUPT_DISCONNECT_WAIT_SECS: u64 = 15;

const INTERRUPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum WorkerError {
    Config(ConfigError),
    Connection(ConnectionError),
    Serialization(serde_json::Error),
    UnsupportedProtocolVersion { actual: i64 },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(source) => write!(f, "worker configuration error: {source}"),
            Self::Connection(source) => write!(f, "{source}"),
            Self::Serialization(source) => write!(f, "document decode/encode error: {source}"),
            Self::UnsupportedProtocolVersion { actual } => {
                write!(f, "unsupported broker protocol version {actual}, expected {PROTOCOL_VERSION}")
            }
        }
    }
}

impl std::error::Error for WorkerError {}

/// A dispatched, not-yet-acknowledged job/handler pairing. Owned exclusively
/// by the engine's control thread; the pool thread reaches it only through
/// the task handle's result cell.
#[derive(Debug)]
struct PendingExecution {
    job: Job,
    handle: TaskHandle,
}

#[derive(Debug, PartialEq, Eq)]
enum TickStatus {
    Ran,
    Interrupted,
}

#[derive(Debug, Deserialize)]
struct BeatReply {
    #[serde(default)]
    state: Option<String>,
}

/// The run-loop state machine. One control thread owns the connection, the
/// pending set and all engine flags; handler executions run on pool threads
/// and report back only through their handles.
///
/// The producer-side `submit` shares the connection with the run loop and
/// must not be called from another thread while `run` is active.
pub struct Worker {
    connection: Connection,
    registry: TaskRegistry,
    pool: WorkerPool,
    pending: Vec<PendingExecution>,
    logger: Logger,
    worker_id: String,
    concurrency: usize,
    heartbeat_interval: Duration,
    queues: Vec<String>,
    password: Option<String>,
    labels: Vec<String>,
    last_heartbeat: Instant,
    quiet: bool,
    disconnecting: bool,
    disconnect_after: Option<Instant>,
    interrupt: Option<Arc<AtomicBool>>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Result<Self, WorkerError> {
        config.validate().map_err(WorkerError::Config)?;
        let uri = BrokerUri::resolve(config.uri.as_deref()).map_err(WorkerError::Config)?;
        let logger = Logger::new(LoggerConfig {
            min_level: config.log_level(),
        });

        Ok(Self {
            connection: Connection::new(uri, logger.clone()),
            registry: TaskRegistry::new(),
            pool: WorkerPool::new(),
            pending: Vec::new(),
            logger,
            worker_id: config.worker_id.clone(),
            concurrency: config.concurrency,
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            queues: config.effective_queues(),
            password: config.password.clone(),
            labels: config.labels.clone(),
            last_heartbeat: Instant::now(),
            quiet: false,
            disconnecting: false,
            disconnect_after: None,
            interrupt: None,
        })
    }

    /// Wires an externally-owned interruption flag (see `ShutdownHooks`).
    /// The flag is one-shot: it is cleared when the run loop observes it.
    pub fn set_interrupt_flag(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = Some(flag);
    }

    pub fn register(&mut self, job_type: impl Into<String>, handler: Handler) {
        let job_type = job_type.into();
        self.logger
            .debug(Some("worker"), &format!("Registered task for '{job_type}'"));
        self.registry.register(job_type, handler);
    }

    pub fn deregister(&mut self, job_type: &str) {
        self.logger
            .debug(Some("worker"), &format!("Deregistered tasks for '{job_type}'"));
        self.registry.deregister(job_type);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Producer path: pushes one job for later execution, connecting first if
    /// needed.
    pub fn submit(&mut self, job: &Job) -> Result<(), WorkerError> {
        if !self.connection.is_connected() {
            self.connect()?;
        }
        let doc = serde_json::to_string(job).map_err(WorkerError::Serialization)?;
        self.connection
            .send(&format!("PUSH {doc}"))
            .map_err(WorkerError::Connection)?;
        Ok(())
    }

    /// Fetch/dispatch/report loop. Returns once the connection is closed,
    /// after a forced disconnect of anything still outstanding.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        if !self.connection.is_connected() {
            self.connect()?;
        }

        // The first deadline is seeded one interval ahead, so the first BEAT
        // goes out roughly two intervals after run() starts.
        self.last_heartbeat = Instant::now() + self.heartbeat_interval;

        self.logger.info(
            Some("worker"),
            &format!(
                "Worker {} running with concurrency {} on queues {:?}",
                self.worker_id, self.concurrency, self.queues
            ),
        );

        loop {
            match self.tick()? {
                TickStatus::Interrupted => {
                    if self.disconnecting {
                        break;
                    }
                    self.logger.warn(
                        Some("worker"),
                        "Interrupted: waiting up to 15 seconds for handlers to finish current jobs",
                    );
                    self.disconnect(false, INTERRUPT_DISCONNECT_WAIT_SECS)?;
                }
                TickStatus::Ran => {
                    if !self.connection.is_connected() {
                        break;
                    }
                }
            }
        }

        if self.connection.is_connected() {
            self.logger
                .warn(Some("worker"), "Forcing worker shutdown");
            self.disconnect(true, FORCED_DISCONNECT_WAIT_SECS)?;
        }

        self.pool.shutdown();
        Ok(())
    }

    /// Graceful (`force = false`) stops fetching and lets subsequent ticks
    /// drain the pending set until empty or until the deadline escalates.
    /// Forced settles every outstanding execution (ack if done, cancel and
    /// fail otherwise) and closes the connection unconditionally, even when a
    /// notification send fails.
    pub fn disconnect(&mut self, force: bool, wait_seconds: u64) -> Result<(), WorkerError> {
        self.logger.debug(
            Some("worker"),
            &format!("Disconnecting force={force}, wait={wait_seconds}s"),
        );

        self.quiet = true;
        self.disconnecting = true;
        self.disconnect_after = Some(Instant::now() + Duration::from_secs(wait_seconds));

        if force {
            let settled = self.settle_outstanding();
            self.connection.close();
            settled?;
        }

        Ok(())
    }

    fn tick(&mut self) -> Result<TickStatus, WorkerError> {
        if !self.pending.is_empty() {
            self.drain_pending()?;
        }

        if self.heartbeat_due() {
            self.heartbeat()?;
        }

        if self.should_fetch() {
            self.fetch()?;
            return Ok(TickStatus::Ran);
        }

        if self.disconnecting {
            if self.pending.is_empty() {
                self.connection.close();
                return Ok(TickStatus::Ran);
            }
            if let Some(deadline) = self.disconnect_after {
                if Instant::now() > deadline {
                    self.logger.warn(
                        Some("worker"),
                        "Disconnect deadline passed, escalating to forced shutdown",
                    );
                    self.disconnect(true, FORCED_DISCONNECT_WAIT_SECS)?;
                    return Ok(TickStatus::Ran);
                }
            }
        }

        self.idle_sleep()
    }

    fn drain_pending(&mut self) -> Result<(), WorkerError> {
        let mut index = 0;
        while index < self.pending.len() {
            if !self.pending[index].handle.is_done() {
                index += 1;
                continue;
            }

            let execution = self.pending.remove(index);
            match execution.handle.await_outcome(DRAIN_WAIT) {
                TaskOutcome::Success => self.ack(&execution.job)?,
                TaskOutcome::Fault(fault) => {
                    self.logger.warn(
                        Some("worker"),
                        &format!("Job {} failed: {}", execution.job.jid, fault.message),
                    );
                    self.fail(&execution.job, Some(&fault))?;
                }
                TaskOutcome::Cancelled => self.fail(&execution.job, None)?,
                TaskOutcome::TimedOut => {
                    let fault = TaskFault {
                        errtype: "CompletionTimeout".to_owned(),
                        message: "timed out collecting the result of a finished unit".to_owned(),
                        backtrace: Vec::new(),
                    };
                    self.fail(&execution.job, Some(&fault))?;
                }
            }
        }
        Ok(())
    }

    fn heartbeat_due(&self) -> bool {
        Instant::now() > self.last_heartbeat + self.heartbeat_interval
    }

    fn heartbeat(&mut self) -> Result<(), WorkerError> {
        self.logger.debug(
            Some("worker"),
            &format!("Sending heartbeat for worker {}", self.worker_id),
        );

        let payload = json!({ "wid": self.worker_id }).to_string();
        let reply = self
            .connection
            .send(&format!("BEAT {payload}"))
            .map_err(WorkerError::Connection)?;

        if let Some(text) = reply {
            if text != "OK" {
                let status: BeatReply =
                    serde_json::from_str(&text).map_err(WorkerError::Serialization)?;
                match status.state.as_deref() {
                    Some("quiet") => {
                        if !self.quiet {
                            self.logger.warn(
                                Some("worker"),
                                "Broker quieted this worker, no more jobs will be fetched",
                            );
                        }
                        self.quiet = true;
                    }
                    Some("terminate") => {
                        if !self.disconnecting {
                            self.logger.warn(
                                Some("worker"),
                                "Broker asked this worker to shut down, draining for up to 25 seconds",
                            );
                        }
                        self.disconnect(false, TERMINATE_DISCONNECT_WAIT_SECS)?;
                    }
                    _ => {}
                }
            }
        }

        self.last_heartbeat = Instant::now();
        Ok(())
    }

    /// Admission control: one fetch at most, and only while the pending set
    /// leaves room under the configured concurrency.
    fn should_fetch(&self) -> bool {
        !self.disconnecting && !self.quiet && self.pending.len() < self.concurrency
    }

    fn fetch(&mut self) -> Result<(), WorkerError> {
        let reply = self
            .connection
            .send(&format!("FETCH {}", self.queues.join(" ")))
            .map_err(WorkerError::Connection)?;

        if let Some(doc) = reply {
            let job: Job = serde_json::from_str(&doc).map_err(WorkerError::Serialization)?;
            self.dispatch(job);
        }
        Ok(())
    }

    // Every matching task gets its own pending execution; duplicate
    // registrations for a job type therefore report the same jid more than
    // once.
    fn dispatch(&mut self, job: Job) {
        for task in self.registry.resolve(&job) {
            self.logger.debug(
                Some("worker"),
                &format!("Dispatching job {} to a handler for '{}'", job.jid, task.job_type),
            );
            let handle = self.pool.submit(job.clone(), task.handler);
            self.pending.push(PendingExecution {
                job: job.clone(),
                handle,
            });
        }
    }

    fn ack(&mut self, job: &Job) -> Result<(), WorkerError> {
        let payload = json!({ "jid": job.jid }).to_string();
        self.connection
            .send(&format!("ACK {payload}"))
            .map_err(WorkerError::Connection)?;
        Ok(())
    }

    fn fail(&mut self, job: &Job, fault: Option<&TaskFault>) -> Result<(), WorkerError> {
        let payload = match fault {
            Some(fault) => json!({
                "jid": job.jid,
                "errtype": fault.errtype,
                "message": fault.message,
                "backtrace": fault.backtrace,
            }),
            None => json!({ "jid": job.jid }),
        }
        .to_string();

        self.connection
            .send(&format!("FAIL {payload}"))
            .map_err(WorkerError::Connection)?;
        Ok(())
    }

    fn settle_outstanding(&mut self) -> Result<(), WorkerError> {
        let pending = std::mem::take(&mut self.pending);
        for execution in pending {
            if execution.handle.is_done() {
                self.ack(&execution.job)?;
            } else {
                execution.handle.cancel();
                self.fail(&execution.job, None)?;
            }
        }
        Ok(())
    }

    fn connect(&mut self) -> Result<(), WorkerError> {
        let greeting = self.connection.handshake().map_err(WorkerError::Connection)?;
        let handshake: Handshake =
            serde_json::from_str(&greeting).map_err(WorkerError::Serialization)?;

        if handshake.version != PROTOCOL_VERSION {
            self.connection.close();
            return Err(WorkerError::UnsupportedProtocolVersion {
                actual: handshake.version,
            });
        }

        let mut hello = ConnectOptions::new(&self.worker_id);
        if !self.labels.is_empty() {
            hello.labels = Some(self.labels.clone());
        }
        if let (Some(nonce), Some(password)) =
            (handshake.nonce.as_deref(), self.password.as_deref())
        {
            hello.password_hash = Some(auth::hashed_password(
                password,
                nonce,
                handshake.iterations.unwrap_or(1),
            ));
        }

        let doc = serde_json::to_string(&hello).map_err(WorkerError::Serialization)?;
        self.connection.connect(&doc).map_err(WorkerError::Connection)?;
        self.logger.info(Some("worker"), "Connected to broker");
        Ok(())
    }

    fn idle_sleep(&self) -> Result<TickStatus, WorkerError> {
        let deadline = Instant::now() + IDLE_SLEEP;
        loop {
            if let Some(flag) = &self.interrupt {
                if flag.swap(false, Ordering::SeqCst) {
                    return Ok(TickStatus::Interrupted);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(TickStatus::Ran);
            }
            thread::sleep(INTERRUPT_POLL.min(deadline - now));
        }
    }
}
