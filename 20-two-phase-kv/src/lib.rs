//! Replicated key-value store kept consistent with two-phase commit.
//!
//! Every replica holds a full copy of the data. Writes go through a
//! [`coordinator::Coordinator`] that asks all replicas to prepare and commits
//! only when every one of them voted yes; a single rejection or an unreachable
//! replica aborts the write everywhere. Reads are answered by the first
//! replica without a transaction.
//!
//! # Architecture
//!
//! - Replicas run as separate processes, each behind a [`rpc::ReplicaServer`]
//!   speaking newline-delimited JSON.
//! - A gateway ([`gateway::TcpGateway`] or [`gateway::UdpGateway`]) accepts a
//!   one-line text protocol from clients and hands each request to a bounded
//!   [`pool::WorkerPool`].
//! - The [`router::RequestRouter`] turns a parsed request into a transaction
//!   or a primary read and renders the response line.
//!
//! # Modules
//!
//! - [`store`]: one replica's map plus its single staged proposal
//! - [`replica`]: the [`replica::ReplicaHandle`] seam, in-process or over TCP
//! - [`cluster`]: the fixed replica set a coordinator addresses
//! - [`coordinator`]: the two-phase commit protocol
//! - [`protocol`]: the client line protocol
//! - [`client`]: one-shot requests, pre-population and a mixed workload

pub mod cli;
pub mod client;
pub mod cluster;
pub mod command;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod replica;
pub mod router;
pub mod rpc;
pub mod sequencer;
pub mod store;
