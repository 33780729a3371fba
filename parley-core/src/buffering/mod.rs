//! Lock-free SPSC ring buffer for microphone samples.
//!
//! The cpal input callback owns the producer and pushes mono f32 frames with
//! `push_slice` (wait-free, no allocation). The frame loop owns the consumer
//! and drains whatever arrived since the previous display-rate tick.

pub mod chunk;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, held by the device callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the frame loop.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// 2^17 = 131 072 samples ≈ 2.7 s at 48 kHz.
///
/// The frame loop drains every ~16 ms, so this only fills if the loop stalls.
pub const RING_CAPACITY: usize = 1 << 17;

/// Create a matched producer/consumer pair backed by a heap-allocated ring.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

/// Drain everything currently queued in `consumer` into `out`.
///
/// Returns the number of samples appended. `scratch` is reused between calls
/// so the steady state does not allocate.
pub fn drain_into(consumer: &mut AudioConsumer, scratch: &mut [f32], out: &mut Vec<f32>) -> usize {
    let mut total = 0;
    loop {
        let n = consumer.pop_slice(scratch);
        if n == 0 {
            break;
        }
        out.extend_from_slice(&scratch[..n]);
        total += n;
    }
    total
}
