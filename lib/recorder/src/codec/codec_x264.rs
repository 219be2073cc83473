use super::{Codec, CodecOutput, InputFrame, InputSurface, VideoCodec, VideoCodecConfig};
use crate::{RecorderError, Result};
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use gpu_surface::{NativeWindow, RgbaImage};
use mp4m::{SampleInfo, TrackFormat, VideoFormat};
use std::{
    collections::VecDeque,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};
use x264::{Colorspace, Encoder, Image, Plane, Preset, Setup, Tune};
use yuv::{
    YuvChromaSubsampling, YuvConversionMode, YuvPlanarImageMut, YuvRange, YuvStandardMatrix,
    rgba_to_yuv420,
};

const INPUT_QUEUE_SIZE: usize = 4;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_IDR: u8 = 5;

/// Software H.264 encoder. The x264 handle lives on a thread of its own
/// that pulls frames from the [`InputSurface`].
pub struct X264Codec {
    config: Option<VideoCodecConfig>,
    frames: Option<Receiver<InputFrame>>,
    surface: Option<Arc<InputSurface>>,
    end_of_input: Option<Sender<()>>,
    outputs: Option<Receiver<Result<CodecOutput>>>,
    worker: Option<JoinHandle<()>>,
}

impl X264Codec {
    pub fn new() -> Self {
        Self {
            config: None,
            frames: None,
            surface: None,
            end_of_input: None,
            outputs: None,
            worker: None,
        }
    }
}

impl Default for X264Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoCodec for X264Codec {
    fn configure(&mut self, config: &VideoCodecConfig) -> Result<Arc<dyn NativeWindow>> {
        if config.width == 0 || config.height == 0 || config.fps == 0 {
            return Err(RecorderError::EncoderInitError(format!(
                "x264 rejects {}x{}@{}",
                config.width, config.height, config.fps
            )));
        }

        let (surface, frames) = InputSurface::new(config.width, config.height, INPUT_QUEUE_SIZE);
        self.config = Some(*config);
        self.frames = Some(frames);
        self.surface = Some(surface.clone());
        Ok(surface)
    }
}

impl Codec for X264Codec {
    fn start(&mut self) -> Result<()> {
        let (Some(config), Some(frames)) = (self.config, self.frames.take()) else {
            return Err(RecorderError::InvalidState("x264 codec not configured".to_string()));
        };

        let (end_of_input, eos_receiver) = bounded(1);
        let (output_sender, outputs) = unbounded();
        let (ready_sender, ready) = bounded(1);

        let handle = thread::Builder::new()
            .name("x264-codec".to_string())
            .spawn(move || {
                let mut worker = match X264Worker::new(config) {
                    Ok(worker) => {
                        _ = ready_sender.send(Ok(()));
                        worker
                    }
                    Err(e) => {
                        _ = ready_sender.send(Err(e));
                        return;
                    }
                };
                worker.run(frames, eos_receiver, output_sender);
            })?;

        match ready.recv() {
            Ok(Ok(_)) => (),
            Ok(Err(e)) => {
                _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                return Err(RecorderError::EncoderInitError(
                    "x264 worker exited".to_string(),
                ));
            }
        }

        self.end_of_input = Some(end_of_input);
        self.outputs = Some(outputs);
        self.worker = Some(handle);
        Ok(())
    }

    fn signal_end_of_input(&mut self) -> Result<()> {
        if let Some(surface) = self.surface.as_ref() {
            surface.invalidate();
        }

        if let Some(sender) = self.end_of_input.take() {
            _ = sender.send(());
        }
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
        if let Some(surface) = self.surface.take() {
            surface.invalidate();
        }
        self.end_of_input.take();
        self.outputs.take();
        self.frames.take();

        if let Some(handle) = self.worker.take()
            && handle.join().is_err()
        {
            log::warn!("x264 codec thread panicked");
        }
    }
}

impl Drop for X264Codec {
    fn drop(&mut self) {
        self.release();
    }
}

struct X264Worker {
    encoder: Option<Encoder>,
    frame_index: i64,
    width: u32,
    height: u32,
    pending_pts: VecDeque<u64>,
    format: Option<TrackFormat>,
}

impl X264Worker {
    fn new(config: VideoCodecConfig) -> Result<Self> {
        let mut encoder = Setup::preset(Preset::Superfast, Tune::None, true, true)
            .max_keyframe_interval((config.fps * config.key_frame_interval.max(1)) as i32)
            .fps(config.fps, 1)
            .scenecut_threshold(0)
            .annexb(false)
            .baseline()
            .build(Colorspace::I420, config.width as i32, config.height as i32)
            .map_err(|e| {
                RecorderError::EncoderInitError(format!("Failed to create x264 encoder: {e:?}"))
            })?;

        log::info!(
            "x264 encoder {}x{}@{} target bitrate {}",
            config.width,
            config.height,
            config.fps,
            config.bitrate
        );

        let headers = encoder
            .headers()
            .map_err(|e| {
                RecorderError::EncoderInitError(format!("Failed to get encoder headers: {e:?}"))
            })?
            .entirety()
            .to_vec();

        let (sps, pps) = parameter_sets(&headers).ok_or_else(|| {
            RecorderError::EncoderInitError("x264 headers carry no SPS/PPS".to_string())
        })?;

        Ok(Self {
            encoder: Some(encoder),
            frame_index: 0,
            width: config.width,
            height: config.height,
            pending_pts: VecDeque::new(),
            format: Some(TrackFormat::Video(VideoFormat {
                width: config.width,
                height: config.height,
                sps,
                pps,
            })),
        })
    }

    fn run(
        &mut self,
        frames: Receiver<InputFrame>,
        end_of_input: Receiver<()>,
        outputs: Sender<Result<CodecOutput>>,
    ) {
        if let Some(format) = self.format.take()
            && outputs.send(Ok(CodecOutput::FormatChanged(format))).is_err()
        {
            return;
        }

        loop {
            crossbeam::channel::select! {
                recv(frames) -> frame => match frame {
                    Ok(frame) => {
                        if !self.encode(frame, &outputs) {
                            return;
                        }
                    }
                    Err(_) => break,
                },
                recv(end_of_input) -> _ => break,
            }
        }

        // frames presented before end of input still belong to the stream
        while let Ok(frame) = frames.try_recv() {
            if !self.encode(frame, &outputs) {
                return;
            }
        }

        self.flush(&outputs);
        _ = outputs.send(Ok(CodecOutput::EndOfStream));
        log::debug!("x264 codec drained");
    }

    fn encode(&mut self, frame: InputFrame, outputs: &Sender<Result<CodecOutput>>) -> bool {
        let result = self.encode_image(&frame.image, frame.pts_us);
        match result {
            Ok(Some(output)) => outputs.send(Ok(output)).is_ok(),
            Ok(None) => true,
            Err(e) => {
                _ = outputs.send(Err(e));
                false
            }
        }
    }

    fn encode_image(&mut self, image: &RgbaImage, pts_us: u64) -> Result<Option<CodecOutput>> {
        let image = if image.dimensions() == (self.width, self.height) {
            std::borrow::Cow::Borrowed(image)
        } else {
            std::borrow::Cow::Owned(image::imageops::resize(
                image,
                self.width,
                self.height,
                image::imageops::FilterType::Triangle,
            ))
        };

        let i420 = rgba_to_i420(image.as_raw(), self.width, self.height)?;
        let frame_size = (self.width * self.height) as usize;
        let planes = [
            Plane {
                stride: self.width as i32,
                data: &i420[..frame_size],
            },
            Plane {
                stride: self.width as i32 / 2,
                data: &i420[frame_size..frame_size + frame_size / 4],
            },
            Plane {
                stride: self.width as i32 / 2,
                data: &i420[frame_size + frame_size / 4..],
            },
        ];
        let picture = Image::new(
            Colorspace::I420,
            self.width as i32,
            self.height as i32,
            &planes,
        );

        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| RecorderError::InvalidState("x264 encoder flushed".to_string()))?;

        self.pending_pts.push_back(pts_us);
        let (data, _) = encoder
            .encode(self.frame_index, picture)
            .map_err(|e| RecorderError::Codec(format!("x264 encoding failed: {e:?}")))?;
        self.frame_index += 1;

        Ok(self.sample(data.entirety().to_vec()))
    }

    fn sample(&mut self, data: Vec<u8>) -> Option<CodecOutput> {
        if data.is_empty() {
            return None;
        }

        // baseline without lookahead keeps output in input order
        let pts_us = self.pending_pts.pop_front().unwrap_or_default();
        let is_sync = nal_units(&data).any(|nal| nal.first().map(|b| b & 0x1f) == Some(NAL_IDR));
        Some(CodecOutput::Sample {
            data,
            info: SampleInfo::new(pts_us, is_sync),
        })
    }

    fn flush(&mut self, outputs: &Sender<Result<CodecOutput>>) {
        let Some(encoder) = self.encoder.take() else {
            return;
        };

        let mut items = encoder.flush();
        while let Some(result) = items.next() {
            match result {
                Ok((data, _)) => {
                    if let Some(output) = self.sample(data.entirety().to_vec()) {
                        _ = outputs.send(Ok(output));
                    }
                }
                Err(e) => {
                    log::warn!("Failed to flush encoder frame: {e:?}");
                    break;
                }
            }
        }
    }
}

fn rgba_to_i420(rgba: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let mut planar = YuvPlanarImageMut::<u8>::alloc(width, height, YuvChromaSubsampling::Yuv420);

    rgba_to_yuv420(
        &mut planar,
        rgba,
        width * 4,
        YuvRange::Limited,
        YuvStandardMatrix::Bt601,
        YuvConversionMode::Balanced,
    )
    .map_err(|e| RecorderError::Codec(format!("RGBA to YUV conversion failed: {e:?}")))?;

    let mut data = Vec::with_capacity((width * height * 3 / 2) as usize);
    data.extend_from_slice(planar.y_plane.borrow());
    data.extend_from_slice(planar.u_plane.borrow());
    data.extend_from_slice(planar.v_plane.borrow());
    Ok(data)
}

/// Iterates the NAL units of a 4-byte length-prefixed stream.
fn nal_units(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = data;
    std::iter::from_fn(move || {
        if rest.len() < 4 {
            return None;
        }

        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let end = (4 + len).min(rest.len());
        let nal = &rest[4..end];
        rest = &rest[end..];
        Some(nal)
    })
}

fn parameter_sets(headers: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut sps = None;
    let mut pps = None;

    for nal in nal_units(headers) {
        match nal.first().map(|b| b & 0x1f) {
            Some(NAL_SPS) if sps.is_none() => sps = Some(nal.to_vec()),
            Some(NAL_PPS) if pps.is_none() => pps = Some(nal.to_vec()),
            _ => (),
        }
    }

    Some((sps?, pps?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_sets() {
        let mut headers = vec![];
        for nal in [&[0x67u8, 0x42, 0x00, 0x1f][..], &[0x68, 0xce, 0x3c, 0x80], &[0x06, 0x05]] {
            headers.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            headers.extend_from_slice(nal);
        }

        let (sps, pps) = parameter_sets(&headers).unwrap();
        assert_eq!(sps, vec![0x67, 0x42, 0x00, 0x1f]);
        assert_eq!(pps, vec![0x68, 0xce, 0x3c, 0x80]);
        assert!(parameter_sets(&headers[..8]).is_none());
    }
}
