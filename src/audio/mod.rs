//! Audio capture, framing, replay, and playback.

pub mod aligner;
pub mod capture;
pub mod frame;
pub mod pcm;
pub mod playback;
pub mod replay;
