//! A fast event-driven TCP/UDP server library for Rust, built directly on
//! the kernel's readiness notification (epoll on Linux, kqueue on the BSDs
//! and macOS).
//!
//! An application supplies a small callback set through the [`Events`]
//! trait; the library drives one or more single-threaded event loops that
//! accept connections, read and write non-blocking sockets, and serialize
//! every callback for a connection on its owning loop thread. Arbitrary
//! threads talk to a connection through its cloneable [`Conn`] handle.
//!
//! ## Usage
//!
//! First, add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! hive = "0.4"
//! ```
//!
//! # Example
//!
//! An echo server on two loops, with a ten second idle timeout:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use hive::{serve, Action, Config, Conn, Events, RingBuffer};
//!
//! struct Echo;
//!
//! impl Events for Echo {
//!     type Context = ();
//!
//!     fn data(&self, _conn: &Conn<()>, input: &mut RingBuffer) -> (Vec<u8>, Action) {
//!         let (head, tail) = input.peek_all();
//!         let mut out = head.to_vec();
//!         out.extend_from_slice(tail);
//!         input.retrieve_all();
//!         (out, Action::None)
//!     }
//! }
//!
//! let config = Config {
//!     num_loops: 2,
//!     wait_timeout: Some(Duration::from_secs(10)),
//!     ..Config::default()
//! };
//!
//! serve(Echo, config, &["tcp://:5007"]).unwrap();
//! ```

mod addr;
mod conn;
mod events;
mod evloop;
mod listener;
mod note;
mod server;
mod sys;

pub mod queue;
pub mod ringbuffer;
pub mod timingwheel;

pub use addr::Addr;

pub use conn::Conn;

pub use events::{Action, Events, LoadBalance, Opts, ServerInfo};

pub use ringbuffer::RingBuffer;

pub use server::{serve, Config, DEFAULT_HIGH_WATER};

pub use timingwheel::{Timer, TimingWheel};
