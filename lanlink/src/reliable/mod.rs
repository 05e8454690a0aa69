//! Reliability building blocks: fragment reassembly and the outbound
//! send window.

pub mod reassembly;
pub mod send_window;

pub use reassembly::ReassemblyTable;
pub use send_window::SendWindow;
