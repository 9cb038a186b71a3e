pub mod runtime;
pub mod session;
pub mod x11;
