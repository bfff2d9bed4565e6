// I/O backends: readiness notification plus the shipped transport
// implementations.

pub mod host;
pub mod loopback;
pub mod poll;
