//! `kbusd`: a kernel-resident-style inter-process message bus, implemented
//! entirely in user space as a library plus a small broker binary
//! (`src/bin/kbusd.rs`).
//!
//! The object hierarchy mirrors the design this crate is modeled on:
//! [`subsystem::Subsystem`] owns exactly one root [`domain::Domain`], a
//! domain owns any number of [`bus::Bus`]es and sub-domains, a bus owns a
//! default [`endpoint::Endpoint`] plus any custom ones, and an endpoint owns
//! the [`connection::Connection`]s opened through it. Downward edges in
//! that chain are owning `Arc`s; upward edges are non-owning `Weak`s, so a
//! disconnected ancestor never keeps its descendants alive and a descendant
//! never panics on a stale upward reference -- it just observes
//! [`error::BusError::Disconnected`].

pub mod bloom;
pub mod bus;
pub mod connection;
pub mod control;
pub mod domain;
pub mod endpoint;
pub mod error;
pub mod memfd;
pub mod name_registry;
pub mod policy;
pub mod pool;
pub mod router;
pub mod session;
pub mod subsystem;
pub mod tracing_subscriber;
pub mod wire;
