//! Device access.
//!
//! Only the serial port survives this early in boot; it backs the logger
//! and the `serial_print!` family of macros.

pub mod serial;
