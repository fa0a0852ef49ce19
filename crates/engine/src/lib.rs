//! The backup engine: resolves who this device is, then reconciles every kind
//! of local record with the device's partition of the remote store.
//!
//! ```no_run
//! # async fn run(config: supabazarr_config::Config) -> supabazarr_engine::error::Result<()> {
//! use tokio_util::sync::CancellationToken;
//!
//! let engine = supabazarr_engine::Engine::from_config(&config)?;
//! let report = engine.run_once(&CancellationToken::new()).await?;
//! println!("{}", report.status);
//! # Ok(())
//! # }
//! ```

pub mod error;
mod identity;
mod reconcile;
mod redact;
mod run;
mod status;

pub use crate::identity::{DeviceIdentity, IdentityResolver};
pub use crate::reconcile::{ReconcileResult, Reconciler, table};
pub use crate::run::{Engine, EngineOptions, KindOutcome, KindReport, RunReport, derive_status};
pub use crate::status::{RunState, StatusReader, StatusSnapshot};
pub use supabazarr_remote::models::RunStatus;
