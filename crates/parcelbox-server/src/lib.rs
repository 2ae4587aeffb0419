//! # parcelbox-server
//!
//! HTTP server library for the parcelbox smart parcel box.
//!
//! This library provides the API handlers and state management for parcelbox.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
