#![forbid(unsafe_code)]
//! Asynchronous 9P2000 client and server library for Rust.
//!
//! This crate provides a tokio-based implementation of the plain 9P2000
//! protocol as used by Plan 9 and by window-manager style services built
//! on synthetic filesystems. It covers both sides of a connection: a
//! multiplexing [`client::Client`] for talking to a 9P server, and a
//! [`srv::Filesystem`] callback surface for being one.
//!
//! # Client
//!
//! A client mounts a server by dial string and issues file operations
//! against the remote namespace. Any number of tasks may share one mount;
//! requests are tagged and multiplexed over the single connection.
//!
//! ```no_run
//! use ninep::client::Client;
//!
//! #[tokio::main]
//! async fn main() -> ninep::Result<()> {
//!     let client = Client::mount("tcp!127.0.0.1!564", "").await?;
//!     let mut f = client.open("event", ninep::om::READ).await?;
//!
//!     let mut buf = vec![0; 128];
//!     let n = client.read(&mut f, &mut buf).await?;
//!     println!("{}", String::from_utf8_lossy(&buf[..n]));
//!
//!     client.clunk(f).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Server
//!
//! A server implements [`srv::Filesystem`] and announces on an address.
//! Each decoded request is forwarded to the method of the same name; the
//! dispatch loop owns fid bookkeeping, version negotiation, and flush
//! handling.
//!
//! ```no_run
//! use ninep::{srv::{Filesystem, FId, serve}, FCall, QId, QIdType, Result};
//! use async_trait::async_trait;
//!
//! #[derive(Clone)]
//! struct HelloFs;
//!
//! #[async_trait]
//! impl Filesystem for HelloFs {
//!     type FId = ();
//!
//!     async fn rattach(
//!         &self,
//!         _fid: &FId<Self::FId>,
//!         _afid: Option<&FId<Self::FId>>,
//!         _uname: &str,
//!         _aname: &str,
//!     ) -> Result<FCall> {
//!         Ok(FCall::RAttach {
//!             qid: QId { typ: QIdType::DIR, version: 0, path: 0 },
//!         })
//!     }
//!
//!     // Implement the operations your tree supports...
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     serve(HelloFs, "unix!/tmp/hello.sock").await
//! }
//! ```
//!
//! # Addresses
//!
//! Dial strings use the Plan 9 form: `tcp!host!port` or `unix!path`. The
//! canonical per-user namespace directory (`$NAMESPACE`, or
//! `/tmp/ns.$USER.$DISPLAY`) is exposed through [`utils::namespace`] and
//! [`client::Client::nsmount`].

pub mod client;
pub mod error;
pub mod fcall;
pub mod serialize;
pub mod srv;
pub mod srv_util;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
