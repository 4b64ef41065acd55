//! The bench gossip protocol.
//!
//! Session framing with a running HMAC-SHA-256 hash ([`session`]) and the
//! length-prefixed wire codec for job lists and result batches ([`wire`]).
//!
//! Protocol outline (server left, client right, big-endian integers):
//!
//! ```text
//! S: <greet "bench-gossip-0\n"> <s-challenge>
//! C: <client id> <node id> <c-challenge> <sig over ids + s-challenge>
//! S: <last seen>                          <sig over it + c-challenge>
//! C: <result batch>                       <sig over it + s-challenge>
//! S: <job list>                           <sig over it + c-challenge>
//! C: <0x00>                               <sig over it + s-challenge>
//! ```
//!
//! One hash instance covers both directions, so each side must verify the
//! incoming signature before writing its own reply:
//! read, `check_sig`, write, `send_sig`.

use std::time::Duration;

pub mod session;
pub mod wire;

pub use session::{Session, SessionError};
pub use wire::JobSpec;

/// Greeting line the server opens every connection with.
pub const GREET: &[u8] = b"bench-gossip-0\n";

/// HMAC key, signature, and challenge size (SHA-256 digest size).
pub const KEY_SIZE: usize = 32;

/// Client/node port. 0x626e is "bn", for benchnet.
pub const CLIENT_PORT: u16 = 25198;

/// Management port ("bm"), loopback only.
pub const MGMT_PORT: u16 = 25197;

/// Whole-session inactivity deadline.
pub const SESSION_DEADLINE: Duration = Duration::from_secs(600);

/// Upper bound on one encoded frame (job list or result batch).
pub const MAX_FRAME: usize = 16 << 20;
