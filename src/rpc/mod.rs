pub mod dispatch;
pub mod envelope;
pub mod invocation;
pub mod opcode;
pub mod proxy;
