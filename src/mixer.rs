//! N-to-1 audio mixer with ducking, a noise gate, a one-pole high-pass, a
//! sidechained compressor, and a soft-clip saturator. One `Mixer` instance
//! exists per listener; source add/remove is serialized by a reader-writer
//! lock, and the per-frame mix path holds only the read half.

use crate::buffers::AudioRingBuffer;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Lock-free f32 cell for per-source envelope/filter state that must
/// survive across mix calls without requiring a mutable borrow of `Mixer`
/// (a bit-packed atomic float, the usual way to make an `f32` shareable
/// across threads without a mutex).
struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn new(v: f32) -> Self {
        Self(AtomicU32::new(v.to_bits()))
    }
    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
    fn store(&self, v: f32) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }
}

struct Slot {
    client_id: u32,
    ring: Arc<AudioRingBuffer>,
    active: bool,
    hp_prev_in: AtomicF32,
    hp_prev_out: AtomicF32,
    gate_envelope: AtomicF32,
    gate_open: std::sync::atomic::AtomicBool,
    duck_envelope: AtomicF32,
    duck_gain: AtomicF32,
}

struct MixerInner {
    slots: Vec<Slot>,
    index: HashMap<u32, usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct MixerParams {
    pub sample_rate: f32,
    pub frame_size: usize,
    pub highpass_cutoff_hz: f32,
    pub gate_threshold_db: f32,
    pub gate_attack_ms: f32,
    pub gate_release_ms: f32,
    pub leader_margin_db: f32,
    pub duck_atten_db: f32,
    pub duck_attack_ms: f32,
    pub duck_release_ms: f32,
    pub base_gain: f32,
    pub crowd_alpha: f32,
    pub compressor_threshold_db: f32,
    pub compressor_ratio: f32,
    pub compressor_knee_db: f32,
    pub compressor_attack_ms: f32,
    pub compressor_release_ms: f32,
    pub compressor_makeup_db: f32,
}

impl Default for MixerParams {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            frame_size: 256,
            highpass_cutoff_hz: 80.0,
            gate_threshold_db: -45.0,
            gate_attack_ms: 5.0,
            gate_release_ms: 150.0,
            leader_margin_db: 12.0,
            duck_atten_db: 10.0,
            duck_attack_ms: 15.0,
            duck_release_ms: 250.0,
            base_gain: 1.0,
            crowd_alpha: 0.5,
            compressor_threshold_db: -12.0,
            compressor_ratio: 3.0,
            compressor_knee_db: 6.0,
            compressor_attack_ms: 10.0,
            compressor_release_ms: 100.0,
            compressor_makeup_db: 3.0,
        }
    }
}

fn db_to_lin(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

fn lin_to_db(lin: f32) -> f32 {
    20.0 * lin.max(1e-9).log10()
}

/// Exponential smoothing coefficient for a time constant in milliseconds at
/// `sample_rate`, applied once per frame. Coefficients derive from
/// attack/release milliseconds and the sample rate.
fn smoothing_coeff(time_ms: f32, sample_rate: f32, frame_size: usize) -> f32 {
    if time_ms <= 0.0 {
        return 0.0;
    }
    let frame_duration_ms = 1000.0 * frame_size as f32 / sample_rate;
    (-frame_duration_ms / time_ms).exp()
}

pub struct Mixer {
    inner: RwLock<MixerInner>,
}

impl Mixer {
    pub fn new() -> Self {
        Self { inner: RwLock::new(MixerInner { slots: Vec::new(), index: HashMap::new() }) }
    }

    pub fn add_source(&self, client_id: u32, ring: Arc<AudioRingBuffer>) {
        let mut guard = self.inner.write();
        let slot = Slot {
            client_id,
            ring,
            active: true,
            hp_prev_in: AtomicF32::new(0.0),
            hp_prev_out: AtomicF32::new(0.0),
            gate_envelope: AtomicF32::new(0.0),
            gate_open: std::sync::atomic::AtomicBool::new(false),
            duck_envelope: AtomicF32::new(0.0),
            duck_gain: AtomicF32::new(1.0),
        };
        let idx = guard.slots.len();
        guard.slots.push(slot);
        guard.index.insert(client_id, idx);
    }

    /// Marks the source inactive. The ring buffer itself is destroyed by
    /// the owning session, never here.
    pub fn remove_source(&self, client_id: u32) {
        let mut guard = self.inner.write();
        if let Some(&idx) = guard.index.get(&client_id) {
            guard.slots[idx].active = false;
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().slots.iter().filter(|s| s.active).count()
    }

    /// Mixes one frame of `params.frame_size` samples for `listener_id`,
    /// excluding that listener's own source if it has one.
    pub fn mix_frame_excluding(&self, listener_id: u32, params: &MixerParams) -> Vec<f32> {
        let guard = self.inner.read();
        let frame_size = params.frame_size;
        let mut output = vec![0f32; frame_size];

        let active_slots: Vec<&Slot> =
            guard.slots.iter().filter(|s| s.active && s.client_id != listener_id).collect();
        if active_slots.is_empty() {
            return output;
        }

        let hp_coeff = {
            // One-pole high-pass: y[n] = a*(y[n-1] + x[n] - x[n-1]).
            let rc = 1.0 / (2.0 * std::f32::consts::PI * params.highpass_cutoff_hz);
            let dt = 1.0 / params.sample_rate;
            rc / (rc + dt)
        };
        let gate_attack = smoothing_coeff(params.gate_attack_ms, params.sample_rate, 1);
        let gate_release = smoothing_coeff(params.gate_release_ms, params.sample_rate, 1);
        let duck_attack = smoothing_coeff(params.duck_attack_ms, params.sample_rate, frame_size);
        let duck_release = smoothing_coeff(params.duck_release_ms, params.sample_rate, frame_size);
        let gate_threshold_lin = db_to_lin(params.gate_threshold_db);

        let mut source_buffers: Vec<Vec<f32>> = Vec::with_capacity(active_slots.len());
        let mut source_envelopes: Vec<f32> = Vec::with_capacity(active_slots.len());

        for slot in &active_slots {
            let mut buf = vec![0f32; frame_size];
            let read = slot.ring.read_samples(&mut buf);
            for sample in buf.iter_mut().skip(read) {
                *sample = 0.0;
            }

            let mut prev_in = slot.hp_prev_in.load();
            let mut prev_out = slot.hp_prev_out.load();
            let mut gate_env = slot.gate_envelope.load();
            let mut peak = 0f32;
            for sample in buf.iter_mut() {
                let x = *sample;
                let y = hp_coeff * (prev_out + x - prev_in);
                prev_in = x;
                prev_out = y;
                *sample = y;
                peak = peak.max(y.abs());
            }
            slot.hp_prev_in.store(prev_in);
            slot.hp_prev_out.store(prev_out);

            let target = if peak > gate_threshold_lin { 1.0 } else { 0.0 };
            let coeff = if target > gate_env { gate_attack } else { gate_release };
            gate_env = target + coeff * (gate_env - target);
            slot.gate_envelope.store(gate_env);
            if gate_env < 0.5 {
                for sample in buf.iter_mut() {
                    *sample = 0.0;
                }
            }

            source_envelopes.push(peak);
            source_buffers.push(buf);
        }

        let leader_db = source_envelopes.iter().copied().fold(0f32, f32::max);
        let leader_db = lin_to_db(leader_db);

        for (i, slot) in active_slots.iter().enumerate() {
            let source_db = lin_to_db(source_envelopes[i]);
            let should_duck = leader_db - source_db > params.leader_margin_db;
            let target_gain = if should_duck { db_to_lin(-params.duck_atten_db) } else { 1.0 };
            let prev_gain = slot.duck_gain.load();
            let coeff = if target_gain < prev_gain { duck_attack } else { duck_release };
            let gain = target_gain + coeff * (prev_gain - target_gain);
            slot.duck_gain.store(gain);

            for (out_sample, src_sample) in output.iter_mut().zip(source_buffers[i].iter()) {
                *out_sample += src_sample * gain;
            }
        }

        let active = active_slots.len().max(1) as f32;
        let crowd_gain = params.base_gain / active.powf(params.crowd_alpha);
        for sample in output.iter_mut() {
            *sample *= crowd_gain;
        }

        compress_in_place(&mut output, params);
        for sample in output.iter_mut() {
            *sample = soft_clip(*sample);
        }

        output
    }
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new()
    }
}

/// Sidechained feed-forward compressor with a soft knee, applied per
/// sample using the frame's own running envelope.
fn compress_in_place(buf: &mut [f32], params: &MixerParams) {
    let threshold_db = params.compressor_threshold_db;
    let knee = params.compressor_knee_db.max(0.001);
    let ratio = params.compressor_ratio.max(1.0);
    let makeup = db_to_lin(params.compressor_makeup_db);
    let mut envelope_db = threshold_db;
    let attack = smoothing_coeff(params.compressor_attack_ms, params.sample_rate, 1);
    let release = smoothing_coeff(params.compressor_release_ms, params.sample_rate, 1);

    for sample in buf.iter_mut() {
        let input_db = lin_to_db(sample.abs());
        let coeff = if input_db > envelope_db { attack } else { release };
        envelope_db = input_db + coeff * (envelope_db - input_db);

        let over = envelope_db - threshold_db;
        let gain_reduction_db = if over <= -knee / 2.0 {
            0.0
        } else if over >= knee / 2.0 {
            over * (1.0 / ratio - 1.0)
        } else {
            // Soft-knee quadratic interpolation region.
            let x = over + knee / 2.0;
            (1.0 / ratio - 1.0) * x * x / (2.0 * knee)
        };
        *sample *= db_to_lin(gain_reduction_db) * makeup;
    }
}

/// `tanh`-based soft-clip saturator.
fn soft_clip(sample: f32) -> f32 {
    sample.tanh()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::AUDIO_RING_CAPACITY;

    #[test]
    fn mixer_exclusion_is_exactly_zero_when_others_are_silent() {
        // I-MIXER-EXCLUSION: listener L mixing {A,B,L,C} with A,B,C silent
        // yields exactly zero regardless of L's own input.
        let mixer = Mixer::new();
        let listener_ring = Arc::new(AudioRingBuffer::new(AUDIO_RING_CAPACITY));
        listener_ring.write_samples(&[1.0; 256]);
        mixer.add_source(100, listener_ring);

        for id in [1u32, 2, 3] {
            let ring = Arc::new(AudioRingBuffer::new(AUDIO_RING_CAPACITY));
            ring.write_samples(&[0.0; 256]);
            mixer.add_source(id, ring);
        }

        let params = MixerParams { frame_size: 256, ..Default::default() };
        let mixed = mixer.mix_frame_excluding(100, &params);
        assert!(mixed.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn inactive_source_is_excluded_from_the_mix() {
        let mixer = Mixer::new();
        let ring = Arc::new(AudioRingBuffer::new(AUDIO_RING_CAPACITY));
        ring.write_samples(&[0.8; 256]);
        mixer.add_source(1, ring);
        mixer.remove_source(1);

        let params = MixerParams { frame_size: 256, ..Default::default() };
        let mixed = mixer.mix_frame_excluding(999, &params);
        assert!(mixed.iter().all(|&s| s == 0.0));
        assert_eq!(mixer.active_count(), 0);
    }

    #[test]
    fn louder_source_ducks_the_quieter_one_over_several_frames() {
        let mixer = Mixer::new();
        let loud = Arc::new(AudioRingBuffer::new(AUDIO_RING_CAPACITY));
        let quiet = Arc::new(AudioRingBuffer::new(AUDIO_RING_CAPACITY));
        mixer.add_source(1, loud.clone());
        mixer.add_source(2, quiet.clone());

        let params = MixerParams { frame_size: 256, ..Default::default() };
        let mut last_quiet_gain = 1.0f32;
        for _ in 0..20 {
            loud.write_samples(&[0.9; 256]);
            quiet.write_samples(&[0.1; 256]);
            let _ = mixer.mix_frame_excluding(999, &params);
            let guard = mixer.inner.read();
            last_quiet_gain = guard.index.get(&2).map(|&i| guard.slots[i].duck_gain.load()).unwrap();
        }
        assert!(last_quiet_gain < 1.0, "quieter source should have been ducked");
    }

    #[test]
    fn soft_clip_never_exceeds_unit_amplitude() {
        for x in [0.0f32, 0.5, 1.0, 5.0, -5.0, 100.0] {
            let y = soft_clip(x);
            assert!(y.abs() <= 1.0);
        }
    }
}
