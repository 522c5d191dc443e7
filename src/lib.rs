//! # rnetpoll - polling engine for network devices and routing daemons
//!
//! `rnetpoll` turns a byte- or frame-oriented device session into a call and
//! response interface with support for unsolicited notifications. It speaks
//! TL1 to transport network elements, drives CLI screens over SSH or telnet,
//! and pulls link state databases from OSPF API daemons. Every live source
//! can be swapped for a recorded transcript or byte capture.
//!
//! ## Layers
//!
//! - [`transport`]: moves bytes and cuts the stream into messages
//!   (TCP, SSH shell, spawned `telnet`, transcript replay, byte dump).
//! - [`codec`]: turns commands into bytes and messages back into
//!   [`codec::Response`]s, assigning correlation identifiers where the
//!   language has them.
//! - [`session`]: the correlation engines. [`session::SyncSession`] keeps one
//!   command in flight; [`session::AsyncSession`] runs a receiver task and
//!   matches replies to commands by identifier.
//! - [`protocols`]: ready-made combinations of the above.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rnetpoll::protocols::tl1;
//! use rnetpoll::session::Credentials;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = tl1::async_tl1("ne1.example.net", tl1::TL1_PORT, false);
//!     session.set_autonomous_callback(None, |alarm| {
//!         println!("alarm: {:?}", alarm.lines());
//!     });
//!     session.start(Credentials::new("admin", Some("secret"))).await?;
//!
//!     session
//!         .callback_command("RTRV-ALM-ALL:::ctag;", |reply| match reply {
//!             Ok(reply) => println!("{} alarms", reply.lines().len()),
//!             Err(err) => eprintln!("no alarms: {err}"),
//!         })
//!         .await?;
//!     let equipment = session.command("RTRV-EQPT::ALL:ctag;").await?;
//!     println!("{equipment:?}");
//!
//!     session.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Offline sources
//!
//! ```rust,no_run
//! use rnetpoll::protocols::{OspfFetcher, tl1};
//! use rnetpoll::session::Credentials;
//!
//! # async fn run() -> Result<(), rnetpoll::error::ProtocolError> {
//! let mut session = tl1::tl1_replay("ne1.log");
//! session.start(Credentials::default()).await?;
//! let header = session.command("RTRV-HDR:::ctag;").await?;
//!
//! let mut fetcher = OspfFetcher::dump("ospfdump.bin");
//! let frames = fetcher.fetch_frames().await?;
//! # drop((header, frames));
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod protocols;
pub mod registry;
pub mod session;
pub mod transport;

pub use codec::{Category, Codec, Response, Status};
pub use error::ProtocolError;
pub use registry::SourceRegistry;
pub use session::{AsyncSession, Credentials, SessionOptions, SyncSession};
pub use transport::Transport;
