//! Inbound listener

pub mod listener;
