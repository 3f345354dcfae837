//! Reactive event bus integration tests.
#![cfg(feature = "in-memory")]

mod support;
mod register;
mod reply;
