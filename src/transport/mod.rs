//! Socket substrate: framed control sockets and raw measurement channels.
//!
//! Control traffic (dispatch, RPC) and measurement traffic never share a
//! connection.

pub mod control;
pub mod measurement;
pub mod wire;

pub use control::{
    connect_control, open_control_listener, serve_control, ControlSocket, Incoming, Router,
};
pub use measurement::{MeasurementChannel, MeasurementListener};
