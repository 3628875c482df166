//! The individual device services.
//!
//! A service is something that has one/more command-buffer opcodes associated
//! with it. The top-level device code in `lib.rs` takes care of register/BAR
//! routing in one central location, so the only thing a service needs to
//! expose is a service-specific "handler" function.

pub mod nvram;
