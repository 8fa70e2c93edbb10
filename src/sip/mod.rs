pub mod client;
pub mod codec;
pub mod digest;
pub mod transport;

#[cfg(test)]
mod model;

pub use client::{RegistrationState, SipClient};
pub use codec::SipMessage;
pub use digest::DigestChallenge;
