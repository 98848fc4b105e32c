//! Charade: a programmable, multi-protocol service virtualization server.
//!
//! A REST control plane (default port 2525) manages *imposters* - virtual
//! endpoints bound to a port and protocol (HTTP, HTTPS, TCP, SMTP) - whose
//! behavior is an ordered list of stubs: predicates gating which stub
//! matches, responses that are literal, proxied, scripted or faulty, and a
//! behavior pipeline that decorates whatever was selected.

pub mod admin_api;
pub mod behaviors;
pub mod imposter;
pub mod model;
pub mod predicate;
pub mod protocols;
pub mod proxy;
pub mod repository;
pub mod scripting;
