//! Gatekeeper - Admission Control Engine
//!
//! This crate decides whether a request identified by an opaque key may
//! proceed under a token bucket style limit. One [`ratelimit::LimiterStore`]
//! contract is offered by two interchangeable backends: an in-process store
//! with background eviction, and a Redis store whose decisions run as atomic
//! Lua scripts shared by every process using the same server.

pub mod config;
pub mod error;
pub mod ratelimit;
