//! Model-railway track network and train speed control.
//!
//! The crate models a layout as a graph of nodes, edges and track
//! segments, tracks trains as scopes of coupled vehicles bracketed by
//! block points, and runs a per-train control loop that keeps every train
//! inside its admissible speed. Layout hardware is reached through the
//! [`hardware::ControlUnit`] trait; [`hardware::MockControlUnit`] serves
//! tests and dry runs.

pub mod hardware;
pub mod model;
pub mod store;
