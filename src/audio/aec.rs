//! Echo cancellation seam.
//!
//! The microphone array delivers interleaved frames with the speaker
//! loopback on a reference channel. An [`EchoCanceller`] turns one such frame
//! into one mono frame of the same sample count.
//!
//! ```text
//! arecord (10ch × 256) → [EchoCanceller] → mono 256 → re-chunk 320 → VAD
//! ```
//!
//! Two implementations ship: [`PassthroughCanceller`], which selects a single
//! channel, and `NativeCanceller` (feature `luxaudio`), which binds the
//! vendor DSP library.

use crate::error::{AssistantError, Result};

/// Output of one echo-cancellation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanFrame {
    /// Mono samples, one per capture frame position.
    pub samples: Vec<i16>,
    /// Direction-of-arrival estimate in degrees (0 when unknown).
    pub direction: i32,
}

/// Turns one interleaved multi-channel frame into one mono frame.
pub trait EchoCanceller: Send {
    /// Process one frame of `frame_size() * channels()` interleaved samples.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::AecNotReady`] when the underlying resource is
    /// not initialised, and [`AssistantError::Aec`] on a malformed frame.
    fn process(&mut self, interleaved: &[i16]) -> Result<CleanFrame>;

    /// Samples per channel in one input frame.
    fn frame_size(&self) -> usize;

    /// Interleaved channel count of one input frame.
    fn channels(&self) -> usize;
}

/// Copy one channel out of an interleaved frame.
pub fn extract_channel(interleaved: &[i16], channels: usize, channel: usize) -> Vec<i16> {
    if channels == 0 || channel >= channels {
        return Vec::new();
    }
    interleaved
        .iter()
        .skip(channel)
        .step_by(channels)
        .copied()
        .collect()
}

/// Selects a fixed channel from the raw frame. Never reports not-ready.
///
/// Also serves as the per-cycle fallback when a native canceller fails.
#[derive(Debug, Clone)]
pub struct PassthroughCanceller {
    frame_size: usize,
    channels: usize,
    channel: usize,
}

impl PassthroughCanceller {
    /// Create a passthrough over `channels`-wide frames, emitting `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if `channel` is not below `channels`.
    pub fn new(frame_size: usize, channels: usize, channel: usize) -> Result<Self> {
        if channels == 0 || channel >= channels {
            return Err(AssistantError::Aec(format!(
                "reference channel {channel} out of range for {channels} channels"
            )));
        }
        Ok(Self {
            frame_size,
            channels,
            channel,
        })
    }
}

impl EchoCanceller for PassthroughCanceller {
    fn process(&mut self, interleaved: &[i16]) -> Result<CleanFrame> {
        if interleaved.len() != self.frame_size * self.channels {
            return Err(AssistantError::Aec(format!(
                "expected {} samples, got {}",
                self.frame_size * self.channels,
                interleaved.len()
            )));
        }
        Ok(CleanFrame {
            samples: extract_channel(interleaved, self.channels, self.channel),
            direction: 0,
        })
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn channels(&self) -> usize {
        self.channels
    }
}

#[cfg(feature = "luxaudio")]
pub use native::NativeCanceller;

#[cfg(feature = "luxaudio")]
mod native {
    //! Binding to `libluxaudio`. The library keeps its state in the global
    //! `adsp_srv`; only one instance may exist per process.

    use std::ffi::{c_float, c_int, c_uint, c_void};

    use super::{CleanFrame, EchoCanceller};
    use crate::error::{AssistantError, Result};

    /// Microphone channels consumed by the algorithm.
    const MIC_CHANNELS: usize = 8;
    /// Reference (loopback) channels consumed by the algorithm.
    const REF_CHANNELS: usize = 1;

    #[repr(C)]
    struct DiosSsp {
        ptr_algo: *mut c_void,
        ptr_mic_buf: *mut c_float,
        cfg_mic_num: c_float,
        cfg_ref_num: c_float,
        frame_size: c_int,
        frame_counter: c_uint,
        frame_time_age: f64,
    }

    unsafe extern "C" {
        static mut adsp_srv: *mut DiosSsp;
        fn luxnj_algo_init(mic_num: c_int, ref_num: c_int, frm_len: c_int) -> *mut c_void;
        fn luxnj_algo_process(ptr: *mut c_void, input: *mut c_float, doa: *mut c_int) -> c_int;
    }

    /// Vendor echo canceller over 8 mic + 1 reference channels.
    #[derive(Debug)]
    pub struct NativeCanceller {
        frame_size: usize,
        channels: usize,
        planar: Vec<f32>,
    }

    impl NativeCanceller {
        /// Initialise the vendor library.
        ///
        /// # Errors
        ///
        /// Returns an error if the frame shape cannot feed the algorithm or
        /// the library fails to initialise.
        pub fn new(frame_size: usize, channels: usize) -> Result<Self> {
            if channels < MIC_CHANNELS + REF_CHANNELS {
                return Err(AssistantError::Aec(format!(
                    "native AEC needs at least {} channels, got {channels}",
                    MIC_CHANNELS + REF_CHANNELS
                )));
            }
            let frm_len = c_int::try_from(frame_size)
                .map_err(|_| AssistantError::Aec(format!("frame size {frame_size} too large")))?;
            // SAFETY: plain C initialiser taking integers; it populates `adsp_srv`.
            let handle =
                unsafe { luxnj_algo_init(MIC_CHANNELS as c_int, REF_CHANNELS as c_int, frm_len) };
            if handle.is_null() {
                return Err(AssistantError::Aec("luxnj_algo_init returned null".into()));
            }
            Ok(Self {
                frame_size,
                channels,
                planar: vec![0.0; frame_size * (MIC_CHANNELS + REF_CHANNELS)],
            })
        }
    }

    impl EchoCanceller for NativeCanceller {
        fn process(&mut self, interleaved: &[i16]) -> Result<CleanFrame> {
            let n = self.frame_size;
            if interleaved.len() != n * self.channels {
                return Err(AssistantError::Aec(format!(
                    "expected {} samples, got {}",
                    n * self.channels,
                    interleaved.len()
                )));
            }

            // SAFETY: reading the pointer value of the library's global; no
            // reference to the static is formed.
            let srv = unsafe { *(&raw const adsp_srv) };
            if srv.is_null() {
                return Err(AssistantError::AecNotReady);
            }
            // SAFETY: `srv` is non-null and owned by the library for the
            // process lifetime.
            let algo = unsafe { (*srv).ptr_algo };
            if algo.is_null() {
                return Err(AssistantError::AecNotReady);
            }

            // Interleaved int16 → planar float, mics first then the reference.
            for (i, frame) in interleaved.chunks_exact(self.channels).enumerate() {
                for ch in 0..MIC_CHANNELS + REF_CHANNELS {
                    self.planar[ch * n + i] = f32::from(frame[ch]);
                }
            }

            let mut doa: c_int = 0;
            // SAFETY: `planar` holds (mic + ref) × frame_size floats as the
            // algorithm was initialised for; it is processed in place.
            unsafe { luxnj_algo_process(algo, self.planar.as_mut_ptr(), &mut doa) };

            let samples = self.planar[..n]
                .iter()
                .map(|&s| s.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16)
                .collect();
            Ok(CleanFrame {
                samples,
                direction: doa,
            })
        }

        fn frame_size(&self) -> usize {
            self.frame_size
        }

        fn channels(&self) -> usize {
            self.channels
        }
    }
}

/// Build the configured echo canceller.
///
/// With the `luxaudio` feature the vendor library is required and an
/// initialisation failure is returned to the caller. Without it the
/// reference-channel passthrough is used.
///
/// # Errors
///
/// Returns an error if the canceller cannot be initialised.
pub fn create_canceller(config: &crate::config::CaptureConfig) -> Result<Box<dyn EchoCanceller>> {
    #[cfg(feature = "luxaudio")]
    {
        let native = NativeCanceller::new(config.period_size, usize::from(config.channels))?;
        tracing::info!("native echo canceller initialised");
        Ok(Box::new(native))
    }
    #[cfg(not(feature = "luxaudio"))]
    {
        tracing::info!(
            channel = config.reference_channel,
            "echo canceller unavailable, using channel passthrough"
        );
        Ok(Box::new(PassthroughCanceller::new(
            config.period_size,
            usize::from(config.channels),
            usize::from(config.reference_channel),
        )?))
    }
}
