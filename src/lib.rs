//! VLESS protocol core with XTLS-Rprx-Vision flow control: header
//! codec, user validation, the Vision padded-frame state machine, the
//! bidirectional pump, and the XUDP packet codec. Concrete transports
//! (TCP/TLS/REALITY acceptance, routing rules, config file watching)
//! live above this crate; see [`transport`] for the seams they plug
//! into and [`session`] for the drivers that wire them together.

pub mod buffers;
pub mod config;
pub mod error;
pub mod protocol;
pub mod pump;
pub mod session;
pub mod transport;
pub mod user;
pub mod utils;
pub mod vision;
pub mod xudp;
