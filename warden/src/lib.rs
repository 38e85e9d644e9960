// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Process lifecycle and fault management for a long running, multi-platform application.
//!
//! The crate is split into four independent parts:
//! * [`process`]: spawn a child process and talk to it over a pair of pipes.
//! * [`fault`]: intercept OS fault notifications (signals on POSIX, structured exceptions and
//!   console control events on Windows) and turn them into an escalating shutdown.
//! * [`report`]: build and write the post-mortem crash report.
//! * [`instance`]: make sure only one instance of the application runs per machine.
//!
//! A host wires them together once at startup:
//!
//! ```no_run
//! use std::sync::mpsc;
//! use warden::fault::{Collaborators, FaultHandler, ShutdownRequest};
//! use warden::instance::{AcquireOutcome, InstanceGuard};
//! use warden::shared::configuration::FaultHandlerConfig;
//! use warden::shared::log_ring::LogRing;
//!
//! # fn main() -> anyhow::Result<()> {
//! let ring = LogRing::default();
//! warden::shared::logging::init_logging(Some(&ring))?;
//!
//! let AcquireOutcome::Acquired(guard) = InstanceGuard::acquire("my-game")? else {
//!     return Ok(());
//! };
//!
//! let (tx, shutdown_requests) = mpsc::channel::<ShutdownRequest>();
//! let mut config = FaultHandlerConfig::default();
//! config.apply_env_overrides()?;
//! let handler = FaultHandler::install(
//!     config,
//!     Collaborators::new(tx)
//!         .with_log_ring(ring)
//!         .with_instance_lock(guard.termination_handle()),
//! )?;
//!
//! // ... run the application, polling `shutdown_requests` from the event loop ...
//! # drop(shutdown_requests);
//!
//! drop(guard);
//! handler.teardown()?;
//! # Ok(())
//! # }
//! ```

pub mod fault;
pub mod instance;
pub mod process;
pub mod report;
pub mod shared;
