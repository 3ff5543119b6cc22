//! Photohunt - choreography fabric
//!
//! Keeps the independently owned user, target and tag stores eventually
//! consistent by exchanging JSON facts over a message broker. No service
//! writes another service's store; every cross-service mutation travels as
//! a fact through a point-to-point queue or the `tags` direct exchange.

pub mod bus;
pub mod config;
pub mod model;
pub mod runtime;
pub mod scoring;
pub mod services;
pub mod storage;
pub mod topology;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;
