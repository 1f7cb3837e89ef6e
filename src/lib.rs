//! Core library for the detector run control.
//!
//! The run control brings the components of a DAQ deployment up, configures them,
//! starts and stops runs and tears everything down again, in the order the FSM rules
//! of the deployment prescribe. Components form a tree; every category aggregates the
//! states of its children, and composite commands are issued on the root and waited
//! for until the whole tree converged.
//!
//! - [`tree`]: the control tree and its state checkers
//! - [`executor`]: composite commands (INITIALISE, START, ...)
//! - [`control`]: the operator surface, [`control::RunControl`]
//! - [`monitor`]: the control loop publishing state deltas and driving notifications
//! - [`sequencer`]: automated run sequences

pub mod clock;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod error_recovery;
pub mod executor;
pub mod health;
pub mod interlock;
pub mod messages;
pub mod monitor;
pub mod process;
pub mod registrar;
pub mod run_info;
pub mod sequencer;
pub mod state;
pub mod tree;

pub use control::RunControl;
pub use error::{AppResult, RunControlError};
