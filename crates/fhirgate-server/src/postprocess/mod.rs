//! Post-processors that run over the backend response.

mod participant;

pub use participant::ParticipantFilter;
