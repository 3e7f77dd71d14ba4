use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{MediaAccessError, MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind};

/// Device backend whose tracks are fed by the application.
///
/// Each opened stream carries `TrackLocalStaticSample` tracks (Opus audio,
/// VP8 video); whatever owns the real microphone/camera pipeline writes
/// encoded samples into [`MediaTrack::source`]. The constraints are exposed
/// on the stream so the pipeline can configure its capture accordingly.
#[derive(Debug, Clone)]
pub struct SampleTrackDevices {
    camera_available: bool,
}

impl SampleTrackDevices {
    pub fn new() -> Self {
        Self {
            camera_available: true,
        }
    }

    /// Backend for hosts without a camera; video calls fail with
    /// `DeviceNotFound(Video)`.
    pub fn audio_only() -> Self {
        Self {
            camera_available: false,
        }
    }
}

impl Default for SampleTrackDevices {
    fn default() -> Self {
        Self::new()
    }
}

fn random_id(prefix: &str) -> String {
    format!("{prefix}-{:016x}", rand::random::<u64>())
}

#[async_trait]
impl MediaDevices for SampleTrackDevices {
    async fn open(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaAccessError> {
        if constraints.wants_video() && !self.camera_available {
            return Err(MediaAccessError::DeviceNotFound(TrackKind::Video));
        }

        let stream_id = random_id("stream");
        let mut tracks = Vec::with_capacity(2);

        let audio_id = random_id("audio");
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            audio_id.clone(),
            stream_id.clone(),
        ));
        tracks.push(MediaTrack::new(audio_id, TrackKind::Audio).with_source(audio));

        if let Some(video) = constraints.video {
            let video_id = random_id("video");
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                video_id.clone(),
                stream_id.clone(),
            ));
            debug!(
                "Video track {} targets {}x{}@{}fps",
                video_id, video.width, video.height, video.frame_rate
            );
            tracks.push(MediaTrack::new(video_id, TrackKind::Video).with_source(track));
        }

        Ok(MediaStream::new(stream_id, tracks, *constraints))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::media::{AudioConstraints, VideoConstraints};
    use peercall_core::CallType;

    #[tokio::test]
    async fn test_video_stream_has_camera_track_with_source() {
        let c = MediaConstraints::for_call(
            CallType::Video,
            AudioConstraints::default(),
            VideoConstraints::default(),
        );
        let stream = SampleTrackDevices::new().open(&c).await.unwrap();
        assert!(stream.has_kind(TrackKind::Audio));
        assert!(stream.has_kind(TrackKind::Video));
        assert!(stream.tracks().iter().all(|t| t.source().is_some()));
    }

    #[tokio::test]
    async fn test_audio_only_host_rejects_video() {
        let c = MediaConstraints::for_call(
            CallType::Video,
            AudioConstraints::default(),
            VideoConstraints::default(),
        );
        let err = SampleTrackDevices::audio_only().open(&c).await.unwrap_err();
        assert_eq!(err, MediaAccessError::DeviceNotFound(TrackKind::Video));
    }
}
