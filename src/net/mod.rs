//! Socket front-ends built on the engine's handler registration.

mod connect;
mod listen;

pub use listen::ListenHandler;
