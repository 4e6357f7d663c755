use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};
use thiserror::Error;
use tracing::{info, warn};

use crate::media::CaptureSwitch;
use crate::session::SessionHandle;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no input device available")]
    NoDevice,
    #[error("input device configuration: {0}")]
    Config(#[from] cpal::DefaultStreamConfigError),
    #[error("building input stream: {0}")]
    Build(#[from] cpal::BuildStreamError),
    #[error("starting input stream: {0}")]
    Play(#[from] cpal::PlayStreamError),
    #[error("unsupported sample format: {0:?}")]
    UnsupportedFormat(SampleFormat),
}

/// Default microphone, downmixed to mono and reported to the session in fixed windows.
///
/// The windows drive speaking detection only. Encoded audio for peers is
/// written to [`crate::webrtc::WebRtcPeerFactory::audio_track`] by the encoder
/// that owns it. Once `switch` is stopped no further window is reported and
/// the stream is paused on drop.
pub struct AudioCapture {
    input_stream: cpal::Stream,
    switch: CaptureSwitch,
}

impl AudioCapture {
    pub fn start(
        handle: SessionHandle,
        window: Duration,
        switch: CaptureSwitch,
    ) -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let input_device = host.default_input_device().ok_or(CaptureError::NoDevice)?;

        let config = input_device.default_input_config()?;
        info!(?config, "input config");

        let sample_format = config.sample_format();
        let stream_config: cpal::StreamConfig = config.into();
        let input_stream = match sample_format {
            SampleFormat::F32 => Self::build_input_stream::<f32>(&input_device, &stream_config, handle, window, switch.clone())?,
            SampleFormat::I16 => Self::build_input_stream::<i16>(&input_device, &stream_config, handle, window, switch.clone())?,
            SampleFormat::U16 => Self::build_input_stream::<u16>(&input_device, &stream_config, handle, window, switch.clone())?,
            other => return Err(CaptureError::UnsupportedFormat(other)),
        };

        input_stream.play()?;

        Ok(Self {
            input_stream,
            switch,
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.switch.is_stopped()
    }

    fn build_input_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        handle: SessionHandle,
        window: Duration,
        switch: CaptureSwitch,
    ) -> Result<cpal::Stream, CaptureError>
    where
        T: SizedSample + Send + 'static,
        f32: FromSample<T>,
    {
        let channels = usize::from(config.channels.max(1));
        let window_len = ((config.sample_rate.0 as f64 * window.as_secs_f64()) as usize).max(1);
        let mut pending: Vec<f32> = Vec::with_capacity(window_len);

        let err_fn = |err| warn!("an error occurred on the input audio stream: {}", err);

        let stream = device.build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if switch.is_stopped() {
                    pending.clear();
                    return;
                }
                for frame in data.chunks(channels) {
                    let sum: f32 = frame.iter().map(|s| f32::from_sample_(*s)).sum();
                    pending.push(sum / frame.len() as f32);
                    if pending.len() >= window_len {
                        let window = std::mem::replace(&mut pending, Vec::with_capacity(window_len));
                        // The session is gone once this fails; the stream dies with its owner.
                        let _ = handle.report_audio(window);
                    }
                }
            },
            err_fn,
            None,
        )?;

        Ok(stream)
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        if let Err(e) = self.input_stream.pause() {
            warn!("failed to pause input stream: {}", e);
        }
    }
}
