//! # timesift
//!
//! Multi-process forensic artefact extraction and analysis engine. A
//! foreman process enumerates source roots, dispatches one task per work
//! item to a monitored pool of worker processes over loopback queues, and
//! merges the task stores the workers publish into a single append-only
//! session store. A second phase streams the merged artifacts through
//! analysis plugins running in their own workers.

pub mod cli;
pub mod config;
pub mod engine;
pub mod logging;
pub mod process;
pub mod queue;
pub mod rpc;
pub mod storage;
pub mod util;
pub mod worker;
