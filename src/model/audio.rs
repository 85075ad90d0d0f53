use std::sync::Arc;
use tracing::debug;

use super::cache::digest_parts;
use super::errors::Result;
use super::input::{AudioCodec, AudioSegment};
use super::mos::{bounded_score, mos_from_r};
use super::window::{MeasurementWindow, Sample};

/// 音频按每秒 100 个采样推入测量窗口
pub const AUDIO_SAMPLE_RATE: f64 = 100.0;

/// 码率超出该区间（kbit/s）时截断到边界
pub const AUDIO_BITRATE_RANGE_KBPS: (f64, f64) = (8.0, 1536.0);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioPayload {
    pub codec: AudioCodec,
    pub bitrate: f64,
}

/// (a1, a2, a3) 编码失真系数
fn coefficients(codec: AudioCodec) -> (f64, f64, f64) {
    match codec {
        AudioCodec::Mp2 => (100.0, -0.02, 15.48),
        AudioCodec::Ac3 => (100.0, -0.03, 15.70),
        AudioCodec::AacLc => (100.0, -0.05, 14.60),
        AudioCodec::HeAac => (100.0, -0.11, 20.06),
    }
}

/// 单个编码配置的音频 MOS，随码率单调不减
pub fn audio_score(codec: AudioCodec, bitrate_kbps: f64) -> f64 {
    let (min, max) = AUDIO_BITRATE_RANGE_KBPS;
    let bitrate = bitrate_kbps.clamp(min, max);
    let (a1, a2, a3) = coefficients(codec);
    let q_cod = a1 * (a2 * bitrate).exp() + a3;
    mos_from_r(100.0 - q_cod)
}

/// 音频质量模型 (O.21)
#[derive(Debug, Default)]
pub struct AudioQualityModel;

impl AudioQualityModel {
    pub fn new() -> Self {
        Self
    }

    /// 逐秒音频分数
    pub fn calculate(&self, segments: &[AudioSegment]) -> Result<Vec<f64>> {
        let mut window = MeasurementWindow::new();
        let mut scores = Vec::new();
        let frame_duration = 1.0 / AUDIO_SAMPLE_RATE;
        let mut dts = 0.0;

        for segment in segments {
            let representation: Arc<str> = Arc::from(segment.representation_key());
            let payload = AudioPayload {
                codec: segment.codec,
                bitrate: segment.bitrate,
            };
            let digest = digest_parts(&[
                segment.codec.as_str().as_bytes(),
                &segment.bitrate.to_le_bytes(),
            ]);

            let num_samples = (segment.duration * AUDIO_SAMPLE_RATE) as usize;
            for _ in 0..num_samples {
                let sample = Sample::new(dts, frame_duration, Arc::clone(&representation), payload, digest);
                if let Some(position) = window.add_frame(sample)? {
                    scores.push(Self::score_position(&mut window, position)?);
                }
                dts += frame_duration;
            }
        }

        window.finish();
        while let Some(position) = window.next_flush_position() {
            scores.push(Self::score_position(&mut window, position)?);
        }

        debug!(
            segments = segments.len(),
            seconds = scores.len(),
            representations = window.state().epoch + 1,
            cache = ?window.cache_stats(),
            "音频分数计算完成"
        );
        Ok(scores)
    }

    /// 同一表示层内音频分数只取决于编码器和码率，只需窗口的第一个元素
    fn score_position(window: &mut MeasurementWindow<AudioPayload>, position: u32) -> Result<f64> {
        window.score_at(position, true, |chunk| {
            let first = &chunk[0].payload;
            bounded_score("O21", audio_score(first.codec, first.bitrate))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(codec: AudioCodec, bitrate: f64, start: f64, duration: f64) -> AudioSegment {
        AudioSegment {
            codec,
            bitrate,
            start,
            duration,
            representation: None,
        }
    }

    #[test]
    fn test_reference_scores() {
        let cases = [
            (AudioCodec::AacLc, 128.0, 4.553814018489559),
            (AudioCodec::AacLc, 96.0, 4.530628420914144),
            (AudioCodec::HeAac, 64.0, 4.347891417694797),
            (AudioCodec::Mp2, 192.0, 4.448667003889891),
            (AudioCodec::Ac3, 256.0, 4.519010132617288),
        ];
        for (codec, bitrate, expected) in cases {
            let score = audio_score(codec, bitrate);
            assert!(
                (score - expected).abs() < 1e-9,
                "{codec:?}@{bitrate}: {score} != {expected}"
            );
        }
    }

    #[test]
    fn test_monotonic_in_bitrate() {
        for codec in [AudioCodec::Mp2, AudioCodec::Ac3, AudioCodec::AacLc, AudioCodec::HeAac] {
            let mut previous = 0.0;
            // 低码率段 R 为负，逐 0.5 kbps 检查
            let low = (0..=120).map(|k| 4.0 + k as f64 * 0.5);
            let high = (9..=80).map(|k| k as f64 * 8.0);
            for bitrate in low.chain(high) {
                let score = audio_score(codec, bitrate);
                assert!(score >= previous - 1e-12, "{codec:?} drops at {bitrate}");
                assert!((1.0..=5.0).contains(&score));
                previous = score;
            }
        }
    }

    #[test]
    fn test_bitrate_is_clamped() {
        assert_eq!(
            audio_score(AudioCodec::AacLc, 0.5),
            audio_score(AudioCodec::AacLc, AUDIO_BITRATE_RANGE_KBPS.0)
        );
        assert_eq!(
            audio_score(AudioCodec::AacLc, 10_000.0),
            audio_score(AudioCodec::AacLc, AUDIO_BITRATE_RANGE_KBPS.1)
        );
    }

    #[test]
    fn test_series_follows_segments() {
        let model = AudioQualityModel::new();
        let segments = vec![
            segment(AudioCodec::AacLc, 32.0, 0.0, 15.0),
            segment(AudioCodec::AacLc, 128.0, 15.0, 15.0),
        ];
        let scores = model.calculate(&segments).unwrap();

        assert_eq!(scores.len(), 30);
        let low = audio_score(AudioCodec::AacLc, 32.0);
        let high = audio_score(AudioCodec::AacLc, 128.0);
        // 边界那一秒取决于采样时间戳的累计误差
        assert!(scores[..14].iter().all(|&s| s == low));
        assert!(scores[15..].iter().all(|&s| s == high));
    }

    #[test]
    fn test_empty_segments_produce_no_scores() {
        let model = AudioQualityModel::new();
        assert!(model.calculate(&[]).unwrap().is_empty());
    }
}
