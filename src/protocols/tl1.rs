//! TL1 sessions.

use std::path::PathBuf;
use std::time::Duration;

use crate::codec::Tl1Codec;
use crate::session::{AsyncSession, SyncSession};
use crate::transport::{EchoMode, ReplayDialect, ReplayTransport, StreamLink, Terminal};

pub use crate::config::TL1_PORT;

/// How long to drop terminal setup noise after connecting.
const SETTLE: Duration = Duration::from_millis(10);

/// Echoed bytes checked when the element echoes commands.
const ECHO_PREFIX: usize = 5;

pub type Tl1Terminal = Terminal<StreamLink>;
pub type SyncTl1Session = SyncSession<Tl1Terminal, Tl1Codec>;
pub type AsyncTl1Session = AsyncSession<Tl1Terminal, Tl1Codec>;
pub type Tl1ReplaySession = SyncSession<ReplayTransport, Tl1Codec>;
pub type AsyncTl1ReplaySession = AsyncSession<ReplayTransport, Tl1Codec>;

/// Terminal for a TL1 element. With `echo`, the element is expected to
/// echo the start of every command.
pub fn terminal(link: StreamLink, echo: bool) -> Tl1Terminal {
    let echo = if echo {
        EchoMode::Prefix(ECHO_PREFIX)
    } else {
        EchoMode::Off
    };
    Terminal::new(link).with_settle(SETTLE).with_echo(echo)
}

/// TL1 over TCP. `echo` is the per-element echo toggle of [`terminal`].
pub fn sync_tl1(host: impl Into<String>, port: u16, echo: bool) -> SyncTl1Session {
    SyncSession::new(terminal(StreamLink::tcp(host, port), echo), Tl1Codec::new())
}

pub fn async_tl1(host: impl Into<String>, port: u16, echo: bool) -> AsyncTl1Session {
    AsyncSession::new(terminal(StreamLink::tcp(host, port), echo), Tl1Codec::new())
}

/// Answers commands from a recorded TL1 transcript. Ctags and passwords
/// are ignored when matching commands.
pub fn tl1_replay(path: impl Into<PathBuf>) -> Tl1ReplaySession {
    SyncSession::new(
        ReplayTransport::open(path, ReplayDialect::tl1()),
        Tl1Codec::replay(),
    )
}

pub fn async_tl1_replay(path: impl Into<PathBuf>) -> AsyncTl1ReplaySession {
    AsyncSession::new(
        ReplayTransport::open(path, ReplayDialect::tl1()),
        Tl1Codec::replay(),
    )
}
