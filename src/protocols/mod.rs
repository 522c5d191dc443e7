//! Ready-made sessions: a transport and a codec for each kind of source.
//!
//! - [`tl1`]: TL1 over TCP, or replayed from a transcript.
//! - [`cli`]: CLI screens over SSH, telnet, or a transcript.
//! - [`ospf`]: LSDB dumps from an OSPF API daemon or a byte capture.

pub mod cli;
pub mod ospf;
pub mod tl1;

pub use ospf::{OspfFetcher, RendezvousLink, write_dump};
