//! Text and framing protocols around the media path.
//!
//! | Protocol | Module | Reference |
//! |----------|--------|-----------|
//! | Session Description Protocol | [`sdp`] | RFC 4566 / RFC 8866 |
//! | Relay framing | [`relay`] | `01 02 03 04` magic + LE length |

pub mod relay;
pub mod sdp;

pub use sdp::SessionDescription;
