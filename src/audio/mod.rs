//! Local audio endpoints: capture, playback, and the PCM plumbing between
//! device rates and the 16 kHz mono format the collaborators expect.

pub mod input;
pub mod output;
pub mod resample;
pub mod wav;

pub use input::{AudioInput, CpalInput, FrameStream};
pub use output::{AudioOutput, PlaybackController, RodioOutput};
