//! # gristmill
//!
//! A distributed MapReduce batch engine. A Raft-replicated coordinator
//! owns job, task, and worker state; a leader-side scheduler assigns work
//! over heartbeats and survives worker loss at any stage; reducers
//! checkpoint durable progress so a replacement picks up mid-partition
//! instead of starting over.
//!
//! ## Modules
//!
//! - `api` - RPC wire types for the worker, client, and peer surfaces
//! - `checkpoint` - reducer checkpoint objects: write, validate, collect
//! - `cli` - clap command surface and exit-code contract
//! - `client` - leader-following HTTP client with hint chasing
//! - `config` - cluster configuration and protocol timing knobs
//! - `consensus` - openraft integration: storage, transport, propose
//! - `coordinator` - replicated state machine, scheduler, RPC server
//! - `mapreduce` - user-function traits, shard codec, k-way merge
//! - `model` - replicated entities: jobs, tasks, workers, checkpoints
//! - `storage` - object-store contract and filesystem backend
//! - `worker` - single-slot executor and heartbeat loop

pub mod api;
pub mod checkpoint;
pub mod cli;
pub mod client;
pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod error;
pub mod mapreduce;
pub mod model;
pub mod storage;
pub mod worker;

pub mod testing;
