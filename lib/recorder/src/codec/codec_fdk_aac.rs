use super::{AudioCodec, AudioCodecConfig, Codec, CodecOutput};
use crate::{RecorderError, Result};
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use fdk_aac::enc::{
    AudioObjectType::Mpeg4LowComplexity, BitRate, ChannelMode, Encoder, EncoderParams, Transport,
};
use mp4m::{AudioFormat, SampleInfo, TrackFormat};
use std::{
    thread::{self, JoinHandle},
    time::Duration,
};

const VALID_SAMPLE_RATES: [u32; 12] = [
    8000, 11025, 12000, 16000, 22050, 24000, 32000, 44100, 48000, 64000, 88200, 96000,
];

/// AAC-LC encoder producing raw access units for an MP4 audio track.
pub struct FdkAacCodec {
    config: Option<AudioCodecConfig>,
    input: Option<Sender<(Vec<f32>, u64)>>,
    outputs: Option<Receiver<Result<CodecOutput>>>,
    worker: Option<JoinHandle<()>>,
}

impl FdkAacCodec {
    pub fn new() -> Self {
        Self {
            config: None,
            input: None,
            outputs: None,
            worker: None,
        }
    }

    pub fn valid_sample_rates() -> &'static [u32] {
        &VALID_SAMPLE_RATES
    }
}

impl Default for FdkAacCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioCodec for FdkAacCodec {
    fn configure(&mut self, config: &AudioCodecConfig) -> Result<()> {
        if !VALID_SAMPLE_RATES.contains(&config.sample_rate) {
            return Err(RecorderError::EncoderInitError(format!(
                "Invalid sample rate: {}",
                config.sample_rate
            )));
        }

        if !(1..=2).contains(&config.channels) {
            return Err(RecorderError::EncoderInitError(format!(
                "Invalid channel count: {}",
                config.channels
            )));
        }

        self.config = Some(*config);
        Ok(())
    }

    fn queue_input(&mut self, pcm: &[f32], pts_us: u64) -> Result<()> {
        let Some(input) = self.input.as_ref() else {
            return Err(RecorderError::InvalidState("aac codec not started".to_string()));
        };

        input
            .send((pcm.to_vec(), pts_us))
            .map_err(|_| RecorderError::Codec("aac codec thread exited".to_string()))
    }
}

impl Codec for FdkAacCodec {
    fn start(&mut self) -> Result<()> {
        let Some(config) = self.config else {
            return Err(RecorderError::InvalidState("aac codec not configured".to_string()));
        };

        let (input, input_receiver) = unbounded();
        let (output_sender, outputs) = unbounded();
        let (ready_sender, ready) = bounded(1);

        let handle = thread::Builder::new()
            .name("fdk-aac-codec".to_string())
            .spawn(move || match AacWorker::new(config) {
                Ok(worker) => {
                    _ = ready_sender.send(Ok(()));
                    worker.run(input_receiver, output_sender);
                }
                Err(e) => {
                    _ = ready_sender.send(Err(e));
                }
            })?;

        match ready.recv() {
            Ok(Ok(_)) => (),
            Ok(Err(e)) => {
                _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                return Err(RecorderError::EncoderInitError(
                    "aac worker exited".to_string(),
                ));
            }
        }

        self.input = Some(input);
        self.outputs = Some(outputs);
        self.worker = Some(handle);
        Ok(())
    }

    fn signal_end_of_input(&mut self) -> Result<()> {
        self.input.take();
        Ok(())
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<Option<CodecOutput>> {
        let Some(outputs) = self.outputs.as_ref() else {
            return Ok(None);
        };

        match outputs.recv_timeout(timeout) {
            Ok(output) => output.map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Ok(Some(CodecOutput::EndOfStream)),
        }
    }

    fn release(&mut self) {
        self.input.take();
        self.outputs.take();

        if let Some(handle) = self.worker.take()
            && handle.join().is_err()
        {
            log::warn!("aac codec thread panicked");
        }
    }
}

impl Drop for FdkAacCodec {
    fn drop(&mut self) {
        self.release();
    }
}

struct AacWorker {
    config: AudioCodecConfig,
    encoder: Encoder,
    /// Interleaved samples per encoder call.
    frame_samples: usize,
    buffer: Vec<i16>,
    first_pts_us: Option<u64>,
    frames_out: u64,
}

impl AacWorker {
    fn new(config: AudioCodecConfig) -> Result<Self> {
        let channels = match config.channels {
            1 => ChannelMode::Mono,
            _ => ChannelMode::Stereo,
        };

        let params = EncoderParams {
            bit_rate: BitRate::Cbr(config.bitrate),
            sample_rate: config.sample_rate,
            channels,
            audio_object_type: Mpeg4LowComplexity,
            transport: Transport::Raw,
        };

        let encoder =
            Encoder::new(params).map_err(|e| RecorderError::EncoderInitError(e.to_string()))?;

        let frame_length = match encoder.info() {
            Ok(info) => {
                log::info!(
                    "AAC encoder initialized: {} channels, sample_rate={}, frameLength={}",
                    info.inputChannels,
                    config.sample_rate,
                    info.frameLength
                );
                info.frameLength as usize
            }
            Err(_) => 1024,
        };

        Ok(Self {
            config,
            encoder,
            frame_samples: frame_length * config.channels as usize,
            buffer: vec![],
            first_pts_us: None,
            frames_out: 0,
        })
    }

    fn run(mut self, input: Receiver<(Vec<f32>, u64)>, outputs: Sender<Result<CodecOutput>>) {
        let format = TrackFormat::Audio(AudioFormat {
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            bitrate: self.config.bitrate,
        });
        if outputs.send(Ok(CodecOutput::FormatChanged(format))).is_err() {
            return;
        }

        while let Ok((pcm, pts_us)) = input.recv() {
            self.first_pts_us.get_or_insert(pts_us);
            self.buffer.extend(
                pcm.iter()
                    .map(|&sample| (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16),
            );

            if !self.encode_ready(&outputs, false) {
                return;
            }
        }

        // pad the tail to a whole frame
        if !self.buffer.is_empty() {
            self.buffer.resize(self.frame_samples, 0);
            self.encode_ready(&outputs, true);
        }

        _ = outputs.send(Ok(CodecOutput::EndOfStream));
        log::debug!("aac codec drained, {} frames", self.frames_out);
    }

    fn encode_ready(&mut self, outputs: &Sender<Result<CodecOutput>>, last: bool) -> bool {
        while self.buffer.len() >= self.frame_samples || (last && !self.buffer.is_empty()) {
            let take = self.frame_samples.min(self.buffer.len());
            let frame: Vec<i16> = self.buffer.drain(..take).collect();

            let mut output = vec![0u8; frame.len() * 4];
            let info = match self.encoder.encode(&frame, &mut output) {
                Ok(info) => info,
                Err(e) => {
                    _ = outputs.send(Err(RecorderError::Codec(e.to_string())));
                    return false;
                }
            };

            if info.output_size == 0 {
                continue;
            }
            output.truncate(info.output_size);

            let frame_len = (self.frame_samples / self.config.channels as usize) as u64;
            let pts_us = self.first_pts_us.unwrap_or_default()
                + self.frames_out * frame_len * 1_000_000 / self.config.sample_rate as u64;
            self.frames_out += 1;

            let sample = CodecOutput::Sample {
                data: output,
                info: SampleInfo::new(pts_us, true),
            };
            if outputs.send(Ok(sample)).is_err() {
                return false;
            }
        }

        true
    }
}
