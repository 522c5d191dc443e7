//! Multi in-flight command engine.
//!
//! A receiver task owns the transport. Callers hand it [`SendJob`]s over an
//! mpsc channel; it writes them, registers the pending record, and matches
//! every incoming reply against the pending table by identifier. Replies
//! without a callback land in the completed table where a blocked caller
//! picks them up.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{
    AutonomousCallback, Dispatcher, ReplyCallback, SessionEvent, SessionOptions, SessionRecorder,
    authorize, deauthorize,
};
use crate::codec::{Category, Codec, Response};
use crate::config;
use crate::error::ProtocolError;
use crate::transport::{Credentials, Framing, TranscriptLog, Transport};

type Identifier = Option<String>;

struct PendingRecord {
    command: String,
    /// `None` for a blocked caller waiting on the completed table.
    callback: Option<ReplyCallback>,
    deadline: Instant,
}

/// A write request for the receiver task.
struct SendJob {
    data: Vec<u8>,
    identifier: Identifier,
    pending: PendingRecord,
    responder: oneshot::Sender<Result<(), ProtocolError>>,
}

#[derive(Default)]
struct Tables {
    pending: HashMap<Identifier, PendingRecord>,
    completed: HashMap<Identifier, Response>,
    /// Identifiers whose deadline passed, with the time they expired. Late
    /// replies for them are dropped.
    expired: HashMap<Identifier, Instant>,
    /// Set once the receiver hit a fatal error.
    failure: Option<String>,
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    completed_signal: Notify,
    wake: Notify,
    stopping: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, worker: JoinHandle<()>) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.retain(|handle| !handle.is_finished());
        workers.push(worker);
    }

    fn take_workers(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Session with any number of commands in flight.
///
/// Every method takes `&self`, so the session can be shared behind an `Arc`
/// between tasks. Replies are delivered either to a callback registered with
/// [`callback_command`](Self::callback_command) or to a caller blocked in
/// [`command`](Self::command).
pub struct AsyncSession<T: Transport + 'static, C: Codec + 'static> {
    idle: Mutex<Option<T>>,
    target: String,
    codec: Arc<C>,
    dispatcher: Dispatcher,
    log: TranscriptLog,
    options: RwLock<SessionOptions>,
    credentials: Mutex<Credentials>,
    shared: Arc<Shared>,
    outgoing: Mutex<Option<mpsc::Sender<SendJob>>>,
    receiver: Mutex<Option<JoinHandle<T>>>,
}

impl<T: Transport + 'static, C: Codec + 'static> AsyncSession<T, C> {
    pub fn new(mut transport: T, codec: C) -> Self {
        let log = TranscriptLog::default();
        transport.attach_log(log.clone());
        Self {
            target: transport.target(),
            idle: Mutex::new(Some(transport)),
            codec: Arc::new(codec),
            dispatcher: Dispatcher::default(),
            log,
            options: RwLock::new(SessionOptions::default()),
            credentials: Mutex::new(Credentials::default()),
            shared: Arc::new(Shared::default()),
            outgoing: Mutex::new(None),
            receiver: Mutex::new(None),
        }
    }

    pub fn with_options(self, options: SessionOptions) -> Self {
        *self.options.write().unwrap_or_else(PoisonError::into_inner) = options;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    fn options(&self) -> SessionOptions {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn default_timeout(&self) -> Duration {
        self.options().timeout()
    }

    /// Zero falls back to the built-in default.
    pub fn set_default_timeout(&self, timeout: Duration) {
        self.options
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .timeout_ms = timeout.as_millis() as u64;
    }

    /// Takes effect at the next [`start`](Self::start).
    pub fn set_threaded_callbacks(&self, threaded: bool) {
        self.options
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .threaded_callbacks = threaded;
    }

    pub fn set_prompt(&self, prompt: &str) -> Result<(), ProtocolError> {
        self.codec.set_prompt(prompt)
    }

    pub fn set_log_file(&self, path: impl AsRef<Path>) -> Result<(), ProtocolError> {
        self.log.open(path)
    }

    pub fn set_recorder(&self, recorder: SessionRecorder) {
        self.dispatcher.set_recorder(Some(recorder));
    }

    pub fn recorder(&self) -> Option<SessionRecorder> {
        self.dispatcher.recorder()
    }

    /// Installs the handler for one category of autonomous messages, or the
    /// catch-all handler when `category` is `None`.
    pub fn set_autonomous_callback<F>(&self, category: Option<Category>, callback: F)
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        let callback: AutonomousCallback = Arc::new(callback);
        self.dispatcher.set_handler(category, callback);
    }

    pub fn is_running(&self) -> bool {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Number of commands still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.shared.tables().pending.len()
    }

    /// Connects and logs in, then hands the transport to a new receiver
    /// task.
    pub async fn start(&self, credentials: Credentials) -> Result<(), ProtocolError> {
        let mut transport = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                ProtocolError::Network(format!("session to {} is already running", self.target))
            })?;

        let options = self.options();
        match self.open(&mut transport, &credentials, options.timeout()).await {
            Ok(()) => {}
            Err(err) => {
                *self.idle.lock().unwrap_or_else(PoisonError::into_inner) = Some(transport);
                return Err(err);
            }
        }

        *self.shared.tables() = Tables::default();
        self.shared.stopping.store(false, Ordering::SeqCst);
        *self.credentials.lock().unwrap_or_else(PoisonError::into_inner) = credentials;

        let (sender, jobs) = mpsc::channel::<SendJob>(64);
        let receiver = Receiver {
            transport,
            codec: Arc::clone(&self.codec),
            dispatcher: self.dispatcher.clone(),
            shared: Arc::clone(&self.shared),
            jobs,
            threaded: options.threaded_callbacks,
            slice: config::receive_slice(options.timeout()),
            retention: config::EXPIRED_RETENTION,
        };
        *self.outgoing.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
        *self.receiver.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(tokio::spawn(receiver.run()));

        self.dispatcher.record(SessionEvent::ConnectionEstablished {
            target: self.target.clone(),
        });
        info!("Receiver for {} started", self.target);
        Ok(())
    }

    async fn open(
        &self,
        transport: &mut T,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        let prompt = self.codec.prompt_pattern();
        transport.prepare(&self.codec.framing(), prompt.as_ref());
        transport.connect(credentials).await?;
        let logged_in = async {
            transport.login(credentials, prompt.as_ref(), timeout).await?;
            authorize(
                &mut *transport,
                self.codec.as_ref(),
                &self.dispatcher,
                credentials,
                timeout,
            )
            .await
        }
        .await;
        if logged_in.is_err()
            && let Err(err) = transport.disconnect().await
        {
            debug!("Ignoring disconnect failure after login error: {err}");
        }
        logged_in
    }

    /// Signals the receiver, waits a bounded time for it and any callback
    /// workers, then logs out and disconnects.
    ///
    /// A receiver that does not exit in time is reported as a `Worker` error
    /// and left running; it still ends once its pending callbacks expire.
    /// Replies nobody consumed are logged and reported the same way.
    pub async fn stop(&self) -> Result<(), ProtocolError> {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handle = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            self.log.close();
            return Ok(());
        };

        let timeout = self.default_timeout();
        let join_limit = timeout.mul_f64(config::JOIN_MARGIN);
        let mut transport = match tokio::time::timeout(join_limit, handle).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(err)) => {
                self.log.close();
                return Err(ProtocolError::Worker(format!(
                    "receiver for {} failed: {err}",
                    self.target
                )));
            }
            Err(_) => {
                self.log.close();
                return Err(ProtocolError::Worker(format!(
                    "receiver for {} did not exit within {join_limit:?}",
                    self.target
                )));
            }
        };

        let mut problems = Vec::new();
        for worker in self.shared.take_workers() {
            match tokio::time::timeout(join_limit, worker).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => problems.push(format!("callback worker failed: {err}")),
                Err(_) => problems.push(format!("callback worker still running after {join_limit:?}")),
            }
        }
        {
            let tables = self.shared.tables();
            for (identifier, response) in &tables.completed {
                error!(
                    "Unprocessed response for identifier {identifier:?}: {:?}",
                    response.lines()
                );
                problems.push(format!("unprocessed response for identifier {identifier:?}"));
            }
            for (identifier, record) in &tables.pending {
                error!(
                    "Unprocessed command {:?} with identifier {identifier:?}",
                    record.command
                );
                problems.push(format!("no reply for identifier {identifier:?}"));
            }
        }

        let credentials = self
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut result = Ok(());
        if transport.is_connected() {
            if let Err(err) = deauthorize(
                &mut transport,
                self.codec.as_ref(),
                &self.dispatcher,
                &credentials,
                timeout,
            )
            .await
            {
                warn!("Logout from {} failed: {err}", self.target);
                result = Err(err);
            }
            if let Err(err) = transport.disconnect().await {
                result = Err(err);
            }
        }
        self.log.close();
        *self.idle.lock().unwrap_or_else(PoisonError::into_inner) = Some(transport);
        self.dispatcher.record(SessionEvent::ConnectionClosed {
            reason: "stopped".to_string(),
        });
        info!("Receiver for {} stopped", self.target);

        if !problems.is_empty() {
            return Err(ProtocolError::Worker(problems.join("; ")));
        }
        result
    }

    /// Sends `command`, waits for its reply and returns the result lines of
    /// a successful reply.
    pub async fn command(&self, command: &str) -> Result<Vec<String>, ProtocolError> {
        self.command_with_timeout(command, self.default_timeout())
            .await
    }

    pub async fn command_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, ProtocolError> {
        let response = self.request_with_timeout(command, timeout).await?;
        self.codec.check_status(&response.status, command)?;
        Ok(response.into_lines())
    }

    pub async fn request(&self, command: &str) -> Result<Response, ProtocolError> {
        self.request_with_timeout(command, self.default_timeout())
            .await
    }

    /// Returns the reply whatever its status.
    pub async fn request_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<Response, ProtocolError> {
        let timeout = config::effective_timeout(timeout);
        let deadline = Instant::now() + timeout;
        let identifier = self.submit(command, None, deadline).await?;
        let response = self.wait_for(&identifier, deadline).await?;
        self.dispatcher.record_output(command, &response);
        Ok(response)
    }

    /// Sends `command` and returns once it is written. The callback later
    /// receives the reply whatever its status, or a `TimeOut` once the
    /// deadline passes, or a `Network` error if the session breaks first.
    ///
    /// If the command cannot be sent the error is returned here and the
    /// callback is dropped without being called.
    pub async fn callback_command<F>(&self, command: &str, callback: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(Result<Response, ProtocolError>) + Send + 'static,
    {
        self.callback_command_with_timeout(command, callback, self.default_timeout())
            .await
    }

    pub async fn callback_command_with_timeout<F>(
        &self,
        command: &str,
        callback: F,
        timeout: Duration,
    ) -> Result<(), ProtocolError>
    where
        F: FnOnce(Result<Response, ProtocolError>) + Send + 'static,
    {
        let deadline = Instant::now() + config::effective_timeout(timeout);
        self.submit(command, Some(Box::new(callback)), deadline)
            .await
            .map(|_| ())
    }

    async fn submit(
        &self,
        command: &str,
        callback: Option<ReplyCallback>,
        deadline: Instant,
    ) -> Result<Identifier, ProtocolError> {
        let sender = self
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                ProtocolError::Network(format!("session to {} is not running", self.target))
            })?;
        let failure = self.shared.tables().failure.clone();
        if let Some(reason) = failure {
            return Err(ProtocolError::Network(reason));
        }

        let encoded = self.codec.encode(command)?;
        let (responder, response) = oneshot::channel();
        let job = SendJob {
            data: encoded.wire,
            identifier: encoded.identifier.clone(),
            pending: PendingRecord {
                command: command.to_string(),
                callback,
                deadline,
            },
            responder,
        };
        let stopped =
            || ProtocolError::Network(format!("receiver for {} has stopped", self.target));
        sender.send(job).await.map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())??;
        Ok(encoded.identifier)
    }

    async fn wait_for(
        &self,
        identifier: &Identifier,
        deadline: Instant,
    ) -> Result<Response, ProtocolError> {
        let poll_interval = self.options().poll_interval();
        loop {
            let notified = self.shared.completed_signal.notified();
            {
                let mut tables = self.shared.tables();
                if let Some(response) = tables.completed.remove(identifier) {
                    return Ok(response);
                }
                if let Some(reason) = &tables.failure {
                    return Err(ProtocolError::Network(reason.clone()));
                }
                if Instant::now() >= deadline {
                    tables.pending.remove(identifier);
                    tables.expired.insert(identifier.clone(), Instant::now());
                    return Err(ProtocolError::TimeOut(format!(
                        "no reply with identifier {identifier:?} from {}",
                        self.target
                    )));
                }
            }
            let slice = deadline
                .saturating_duration_since(Instant::now())
                .min(poll_interval);
            let _ = tokio::time::timeout(slice, notified).await;
        }
    }
}

impl<T: Transport + 'static, C: Codec + 'static> Drop for AsyncSession<T, C> {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }
}

/// State owned by the receiver task.
struct Receiver<T, C> {
    transport: T,
    codec: Arc<C>,
    dispatcher: Dispatcher,
    shared: Arc<Shared>,
    jobs: mpsc::Receiver<SendJob>,
    threaded: bool,
    slice: Duration,
    retention: Duration,
}

impl<T: Transport, C: Codec> Receiver<T, C> {
    /// Runs until stop is signalled and no pending record remains, or until
    /// a fatal error. Gives the transport back.
    async fn run(mut self) -> T {
        let framing: Framing = self.codec.framing();
        let target = self.transport.target();
        let mut jobs_open = true;
        debug!("Receiver for {target} running");
        loop {
            if self.shared.stopping.load(Ordering::SeqCst) && self.shared.tables().pending.is_empty()
            {
                break;
            }
            let outcome = tokio::select! {
                job = self.jobs.recv(), if jobs_open => match job {
                    Some(job) => self.send(job).await,
                    None => {
                        jobs_open = false;
                        Ok(())
                    }
                },
                chunk = self.transport.receive(&framing, self.slice) => match chunk {
                    Ok(chunk) => self.process(&chunk),
                    Err(err) if err.is_timeout() => Ok(()),
                    Err(err) => Err(err),
                },
                _ = self.shared.wake.notified() => Ok(()),
            };
            if let Err(err) = outcome {
                if err.is_session_fatal() {
                    self.fail(&target, err);
                    break;
                }
                warn!("Receiver for {target}: {err}");
            }
            self.sweep();
        }
        debug!("Receiver for {target} exiting");
        self.transport
    }

    /// Writes one job. The pending record is registered before any further
    /// input is read, so a fast reply always finds it.
    async fn send(&mut self, job: SendJob) -> Result<(), ProtocolError> {
        let SendJob {
            data,
            identifier,
            pending,
            responder,
        } = job;
        if self.shared.tables().pending.contains_key(&identifier) {
            let _ = responder.send(Err(ProtocolError::InvalidCommand(format!(
                "identifier {identifier:?} is already pending"
            ))));
            return Ok(());
        }
        match self.transport.send(&data).await {
            Ok(()) => {
                {
                    let mut tables = self.shared.tables();
                    tables.expired.remove(&identifier);
                    tables.pending.insert(identifier, pending);
                }
                let _ = responder.send(Ok(()));
                Ok(())
            }
            Err(err) => {
                let fatal = err
                    .is_session_fatal()
                    .then(|| ProtocolError::Network(err.to_string()));
                let _ = responder.send(Err(err));
                fatal.map_or(Ok(()), Err)
            }
        }
    }

    fn process(&mut self, chunk: &[u8]) -> Result<(), ProtocolError> {
        self.dispatcher.record_raw(chunk);
        let response = match self.codec.decode(chunk) {
            Ok(response) => response,
            Err(ProtocolError::Parsing(reason)) => {
                warn!("Skipping undecodable message: {reason}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if let Some(category) = self
            .codec
            .classify(response.identifier.as_deref(), &response.status)?
        {
            if let Some(worker) = self.dispatcher.autonomous(category, response, self.threaded) {
                self.shared.track(worker);
            }
            return Ok(());
        }

        let identifier = response.identifier.clone();
        let mut tables = self.shared.tables();
        let record = tables.pending.remove(&identifier);
        match record {
            Some(PendingRecord {
                command,
                callback: Some(callback),
                ..
            }) => {
                drop(tables);
                self.dispatcher.record_output(&command, &response);
                self.complete(callback, Ok(response));
                return Ok(());
            }
            Some(_) => {}
            None => {
                if tables.expired.remove(&identifier).is_some() {
                    warn!("Dropping late reply for expired identifier {identifier:?}");
                    return Ok(());
                }
            }
        }
        if tables.completed.contains_key(&identifier) {
            return Err(ProtocolError::DuplicateCompletion(format!("{identifier:?}")));
        }
        debug!("Storing reply for identifier {identifier:?}");
        tables.completed.insert(identifier, response);
        drop(tables);
        self.shared.completed_signal.notify_waiters();
        Ok(())
    }

    fn complete(&self, callback: ReplyCallback, result: Result<Response, ProtocolError>) {
        if self.threaded {
            self.shared
                .track(tokio::task::spawn_blocking(move || callback(result)));
        } else {
            callback(result);
        }
    }

    /// Fails callbacks whose deadline passed. Blocked callers time out by
    /// themselves; their records are only marked expired. Expired
    /// identifiers older than the retention period are forgotten.
    fn sweep(&mut self) {
        let now = Instant::now();
        let expired: Vec<(Identifier, PendingRecord)> = {
            let mut tables = self.shared.tables();
            let retention = self.retention;
            tables
                .expired
                .retain(|_, since| now.saturating_duration_since(*since) < retention);
            let identifiers: Vec<Identifier> = tables
                .pending
                .iter()
                .filter(|(_, record)| record.deadline <= now)
                .map(|(identifier, _)| identifier.clone())
                .collect();
            identifiers
                .into_iter()
                .filter_map(|identifier| {
                    tables.expired.insert(identifier.clone(), now);
                    let record = tables.pending.remove(&identifier)?;
                    Some((identifier, record))
                })
                .collect()
        };
        for (identifier, record) in expired {
            let Some(callback) = record.callback else {
                continue;
            };
            warn!(
                "Callback for {:?} with identifier {identifier:?} expired",
                record.command
            );
            self.dispatcher.record(SessionEvent::CallbackExpired {
                identifier: identifier.clone(),
            });
            self.complete(
                callback,
                Err(ProtocolError::TimeOut(format!(
                    "no reply to {:?} with identifier {identifier:?}",
                    record.command
                ))),
            );
        }
    }

    /// Ends the session: every pending callback gets a network error and
    /// blocked callers are woken.
    fn fail(&mut self, target: &str, err: ProtocolError) {
        error!("Receiver for {target} failed: {err}");
        let reason = format!("session to {target} failed: {err}");
        let pending: Vec<(Identifier, PendingRecord)> = {
            let mut tables = self.shared.tables();
            tables.failure = Some(reason.clone());
            tables.pending.drain().collect()
        };
        self.shared.completed_signal.notify_waiters();
        for (_, record) in pending {
            if let Some(callback) = record.callback {
                self.complete(callback, Err(ProtocolError::Network(reason.clone())));
            }
        }
        self.dispatcher
            .record(SessionEvent::ConnectionClosed { reason });
    }
}
