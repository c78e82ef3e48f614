//! In-process cluster tests.
//!
//! Every test starts real nodes bound to loopback ports chosen by the OS and
//! talks to them through the public cache API.

pub(crate) mod utils;
