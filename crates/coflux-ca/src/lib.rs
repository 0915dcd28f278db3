//! Channel Access client for the coflux cooperative runtime.
//!
//! This crate wraps an asynchronous, callback-driven native Channel
//! Access library into a synchronous-looking cooperative API:

#![warn(missing_docs)]
//!
//! - **Channel cache**: one connection state machine per PV, shared by
//!   every operation that names it
//! - **`caget` / `caput`**: one-shot reads and writes with completion
//!   callbacks, deadlines and parallel multi-PV forms
//! - **`camonitor`**: long-lived subscriptions with optional update
//!   coalescing and disconnect notification
//! - **`connect` / `cainfo`**: connection management and introspection
//!
//! The native library is abstracted behind the [`ChannelAccess`] trait
//! (see [`provider`]); its completion callbacks may arrive on any thread
//! and are marshalled onto the scheduler before touching client state.
//!
//! # Example
//!
//! ```no_run
//! use coflux_ca::{CaClient, GetOptions, PutOptions};
//! use coflux_core::Scheduler;
//! use std::sync::Arc;
//!
//! # fn provider() -> Arc<dyn coflux_ca::ChannelAccess> { unimplemented!() }
//! let scheduler = Scheduler::new()?;
//! scheduler.run(async {
//!     let client = CaClient::new(provider()).unwrap();
//!     client
//!         .caput("SR21C:MOTOR1.VAL", 1.25, PutOptions { wait: true, ..Default::default() })
//!         .await
//!         .unwrap();
//!     let value = client.caget("SR21C:MOTOR1.RBV", GetOptions::default()).await.unwrap();
//!     println!("readback: {:?}", value.as_f64());
//! });
//! # Ok::<(), coflux_core::CoreError>(())
//! ```

mod channel;
mod client;
pub mod dbr;
mod error;
pub mod provider;
mod subscription;

#[cfg(test)]
mod mock;

pub use client::{
    CaClient, CaInfo, Count, DEFAULT_TIMEOUT, GetOptions, MonitorOptions, PutOptions,
};
pub use dbr::{
    Alarm, ArrayData, BasicType, CaValue, CtrlInfo, DbrCode, Format, MAX_ENUM_STRING_SIZE,
    MAX_STRING_SIZE, PutValue, Timestamp,
};
pub use error::{CaError, CaResult};
pub use provider::{
    CaStatus, ChannelAccess, ChannelHandle, ChannelState, ConnectOp, DataUpdate, EventMask,
    MonitorHandle,
};
pub use subscription::{MonitorValueCallback, Subscription};
