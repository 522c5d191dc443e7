//! Call/response engines on top of a [`Transport`] and a [`Codec`].
//!
//! - [`SyncSession`] sends one command and reads until the matching reply
//!   arrives, dispatching autonomous messages on the way.
//! - [`AsyncSession`] runs a receiver task that demultiplexes replies by
//!   identifier, so that many commands can be in flight at once.
//!
//! Both record to an optional [`SessionRecorder`] and mirror traffic to an
//! optional transcript log.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::{Category, Codec, Response};
use crate::config::{DEFAULT_TIMEOUT, POLL_INTERVAL};
use crate::error::ProtocolError;
use crate::transport::Transport;

pub mod concurrent;
pub mod recording;
pub mod sync;

pub use crate::transport::Credentials;
pub use concurrent::AsyncSession;
pub use recording::{
    NormalizeOptions, RecordedOutput, SessionEvent, SessionRecordEntry, SessionRecordLevel,
    SessionRecorder, SessionReplayer,
};
pub use sync::SyncSession;

/// Receives the reply to one command, or the reason it never came.
pub type ReplyCallback = Box<dyn FnOnce(Result<Response, ProtocolError>) + Send + 'static>;

/// Receives autonomous messages.
pub type AutonomousCallback = Arc<dyn Fn(&Response) + Send + Sync + 'static>;

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SessionOptions {
    /// Per-command timeout in milliseconds. Zero means the default.
    pub timeout_ms: u64,
    /// How often a blocked caller re-checks for its reply.
    pub poll_interval_ms: u64,
    /// Run callbacks on the blocking pool instead of the receiver task.
    pub threaded_callbacks: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
            threaded_callbacks: false,
        }
    }
}

impl SessionOptions {
    pub fn timeout(&self) -> Duration {
        crate::config::effective_timeout(Duration::from_millis(self.timeout_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        if self.poll_interval_ms == 0 {
            POLL_INTERVAL
        } else {
            Duration::from_millis(self.poll_interval_ms)
        }
    }
}

/// Autonomous message handlers and the recorder, shared between callers and
/// the receiver task.
#[derive(Clone, Default)]
pub(crate) struct Dispatcher {
    handlers: Arc<RwLock<HashMap<Option<Category>, AutonomousCallback>>>,
    recorder: Arc<RwLock<Option<SessionRecorder>>>,
}

impl Dispatcher {
    /// `None` installs the catch-all handler.
    pub(crate) fn set_handler(&self, category: Option<Category>, callback: AutonomousCallback) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(category, callback);
    }

    pub(crate) fn set_recorder(&self, recorder: Option<SessionRecorder>) {
        *self.recorder.write().unwrap_or_else(PoisonError::into_inner) = recorder;
    }

    pub(crate) fn recorder(&self) -> Option<SessionRecorder> {
        self.recorder
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn record(&self, event: SessionEvent) {
        if let Some(recorder) = self.recorder() {
            recorder.record_event(event);
        }
    }

    pub(crate) fn record_raw(&self, chunk: &[u8]) {
        if let Some(recorder) = self.recorder() {
            recorder.record_raw_chunk(chunk);
        }
    }

    pub(crate) fn record_output(&self, command: &str, response: &Response) {
        if let Some(recorder) = self.recorder() {
            recorder.record_output(command, response);
        }
    }

    fn handler_for(&self, category: Category) -> Option<AutonomousCallback> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers
            .get(&Some(category))
            .or_else(|| handlers.get(&None))
            .cloned()
    }

    /// Hands an autonomous message to the handler for its category, else to
    /// the catch-all handler. Returns the worker handle when the handler
    /// runs on the blocking pool.
    pub(crate) fn autonomous(
        &self,
        category: Category,
        response: Response,
        threaded: bool,
    ) -> Option<JoinHandle<()>> {
        if let Some(recorder) = self.recorder() {
            recorder.record_autonomous(category, &response);
        }
        let Some(handler) = self.handler_for(category) else {
            warn!(
                "Unhandled {category} message with identifier {:?}: {:?}",
                response.identifier,
                response.lines()
            );
            return None;
        };
        info!(
            "Dispatching {category} message with identifier {:?}",
            response.identifier
        );
        if threaded {
            Some(tokio::task::spawn_blocking(move || handler(&response)))
        } else {
            handler(&response);
            None
        }
    }
}

/// Sends one command and waits for the reply carrying its identifier.
///
/// Autonomous messages are dispatched as they arrive. Messages for other
/// identifiers are logged and skipped. Undecodable messages are skipped;
/// framing failures end the exchange.
pub(crate) async fn exchange<T, C>(
    transport: &mut T,
    codec: &C,
    dispatcher: &Dispatcher,
    command: &str,
    timeout: Duration,
) -> Result<Response, ProtocolError>
where
    T: Transport + ?Sized,
    C: Codec + ?Sized,
{
    let encoded = codec.encode(command)?;
    transport.send(&encoded.wire).await?;

    let framing = codec.framing();
    let deadline = Instant::now() + timeout;
    let mut skipped = 0usize;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProtocolError::TimeOut(format!(
                "no reply with identifier {:?} from {} after {timeout:?} ({skipped} other messages skipped)",
                encoded.identifier,
                transport.target()
            )));
        }
        let chunk = transport.receive(&framing, remaining).await?;
        dispatcher.record_raw(&chunk);
        let response = match codec.decode(&chunk) {
            Ok(response) => response,
            Err(ProtocolError::Parsing(reason)) => {
                warn!("Skipping undecodable message from {}: {reason}", transport.target());
                continue;
            }
            Err(err) => return Err(err),
        };
        if let Some(category) = codec.classify(response.identifier.as_deref(), &response.status)? {
            dispatcher.autonomous(category, response, false);
            continue;
        }
        if response.identifier == encoded.identifier {
            debug!(
                "Got reply for identifier {:?} with {} lines",
                response.identifier,
                response.lines().len()
            );
            return Ok(response);
        }
        skipped += 1;
        error!(
            "Skipping regular message with identifier {:?}, waiting for {:?}",
            response.identifier, encoded.identifier
        );
    }
}

/// Runs the language-level login, if the codec has one. A rejected login
/// is a network error.
pub(crate) async fn authorize<T, C>(
    transport: &mut T,
    codec: &C,
    dispatcher: &Dispatcher,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<(), ProtocolError>
where
    T: Transport + ?Sized,
    C: Codec + ?Sized,
{
    let Some(command) = codec.authorize_command(credentials) else {
        return Ok(());
    };
    let response = exchange(transport, codec, dispatcher, &command, timeout).await?;
    codec
        .check_status(&response.status, "authorize")
        .map_err(|err| match err {
            ProtocolError::CommandFailed { .. } => ProtocolError::Network(format!(
                "Password failed when connecting to {}@{}",
                credentials.username,
                transport.target()
            )),
            other => other,
        })
}

/// Runs the language-level logout. The reply is not checked beyond its
/// framing, and a malformed reply is ignored.
pub(crate) async fn deauthorize<T, C>(
    transport: &mut T,
    codec: &C,
    dispatcher: &Dispatcher,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<(), ProtocolError>
where
    T: Transport + ?Sized,
    C: Codec + ?Sized,
{
    let Some(command) = codec.deauthorize_command(credentials) else {
        return Ok(());
    };
    match exchange(transport, codec, dispatcher, &command, timeout).await {
        Ok(_) => Ok(()),
        Err(ProtocolError::MalformedIo(reason)) => {
            debug!("Ignoring malformed logout reply: {reason}");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Payload, Status};
    use std::sync::Mutex;

    fn message(identifier: &str) -> Response {
        Response {
            identifier: Some(identifier.to_string()),
            payload: Payload::Lines(vec!["ALM".to_string()]),
            status: Status::Flag(true),
        }
    }

    #[test]
    fn options_fall_back_to_defaults() {
        let options: SessionOptions =
            serde_json::from_str(r#"{"timeout_ms":0,"threaded_callbacks":true}"#).expect("parse");
        assert_eq!(options.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(options.poll_interval(), POLL_INTERVAL);
        assert!(options.threaded_callbacks);
    }

    #[test]
    fn specific_handler_wins_over_catch_all() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::default();
        let critical = Arc::clone(&seen);
        dispatcher.set_handler(
            Some(Category::Critical),
            Arc::new(move |response: &Response| {
                critical
                    .lock()
                    .expect("lock")
                    .push(format!("critical {:?}", response.identifier));
            }),
        );
        let any = Arc::clone(&seen);
        dispatcher.set_handler(
            None,
            Arc::new(move |response: &Response| {
                any.lock()
                    .expect("lock")
                    .push(format!("any {:?}", response.identifier));
            }),
        );

        dispatcher.autonomous(Category::Critical, message("1"), false);
        dispatcher.autonomous(Category::Minor, message("2"), false);

        let seen = seen.lock().expect("lock");
        assert_eq!(*seen, ["critical Some(\"1\")", "any Some(\"2\")"]);
    }

    #[test]
    fn unhandled_messages_are_still_recorded() {
        let dispatcher = Dispatcher::default();
        let recorder = SessionRecorder::default();
        dispatcher.set_recorder(Some(recorder.clone()));
        assert!(dispatcher.autonomous(Category::Auto, message("9"), false).is_none());
        let entries = recorder.entries();
        assert_eq!(entries.len(), 1);
        assert!(matches!(
            entries[0].event,
            SessionEvent::Autonomous {
                category: Category::Auto,
                ..
            }
        ));
    }
}
