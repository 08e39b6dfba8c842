//! Transport adapters with a listener: HTTP and the interactive shell.
//!
//! The DNS adapters live under [`crate::dns`]; everything here shares the
//! same contract with the core — build a unified request, hand it to the
//! façade, frame whatever streams back.

pub mod http;
pub mod shell;
