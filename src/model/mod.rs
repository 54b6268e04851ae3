//! Data models for the relay
//!
//! Session state, candidates, RTP packets and the tracks packets travel on.

pub mod candidate;
pub mod event;
pub mod rtp;
pub mod session;
pub mod tracks;
