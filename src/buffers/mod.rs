//! Lock-free SPSC ring buffer + bounded drop-oldest frame buffer.

mod frame;
mod ring;

pub use frame::{decode_stored_frame, encode_stored_frame, FrameBuffer, FrameDescriptor};
pub use ring::RingBuffer;

/// Audio sample ring buffer: samples are floats in [-1.0, 1.0].
pub type AudioRingBuffer = RingBuffer<f32>;

/// Default audio batch ring capacity: 32-64 slots' worth of samples.
pub const AUDIO_RING_CAPACITY: usize = 48 * crate::packet::AUDIO_SAMPLES_PER_PACKET;

/// Default video frame buffer depth: 3-8 slots.
pub const VIDEO_FRAME_BUFFER_CAPACITY: usize = 4;
