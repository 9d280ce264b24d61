//! Lock-free SPSC ring buffer between the capture callback and the
//! classification worker.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides a wait-free `push_slice`
//! safe to call from the real-time audio callback.

pub mod frame;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, held by the audio callback or the WAV replay thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the classification worker.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Buffer capacity: 2^19 = 524 288 mono samples ≈ 10.9 s at 48 kHz.
///
/// Only a couple of analysis windows are ever needed; the rest is headroom for
/// a slow first inference while the model warms its caches.
pub const RING_CAPACITY: usize = 1 << 19;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    create_audio_ring_with_capacity(RING_CAPACITY)
}

/// Same as [`create_audio_ring`] with an explicit capacity (tests, replay).
pub fn create_audio_ring_with_capacity(capacity: usize) -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(capacity.max(1)).split()
}
