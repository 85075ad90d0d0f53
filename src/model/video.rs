// ----------------------------------------------------------------
// 项目: P.1203 视听质量评估 (p1203-rs)
// 模块: model/video.rs
// 描述: 视频质量模型 (O.22)。
//      编码失真按模式选择公式族：
//        模式 0: 元数据（码率/分辨率/帧率）
//        模式 1: 帧头（帧类型与帧大小）
//        模式 2: 部分帧带 QP
//        模式 3: 全部帧带 QP
//      放大失真、帧率失真与失真整合由各模式共用。
// ----------------------------------------------------------------

use std::sync::Arc;
use tracing::{debug, info};

use super::cache::digest_parts;
use super::config::ModePolicy;
use super::errors::{P1203Error, Result, WarningCode, Warnings};
use super::input::{FrameType, Mode, Resolution, VideoCodec, VideoSegment};
use super::mos::{bounded_score, constrain, ensure_finite, mean, mos_from_r, r_from_mos, sigmoid};
use super::window::{MeasurementWindow, Sample};

// 编码失真映射 mos_cod = q1 + q2 * exp(q3 * quant)
const Q1: f64 = 4.66;
const Q2: f64 = -0.07;
const Q3: f64 = 4.06;

const MODE0_QUANT: [f64; 4] = [11.9983519, -2.99991847, 41.2475074001, 0.13183165961];
const MODE1_QUANT: [f64; 4] = [5.00011566, -1.19630824, 41.3585049, 0.0];

// 模式 1 复杂度修正的 S 型曲线参数
const COMPLEXITY: [f64; 4] = [-0.91562479, 0.0, -3.28579526, 20.4098663];

const UPSCALING: (f64, f64) = (72.61, 0.32);
const FRAME_RATE: (f64, f64, f64) = (30.98, 1.29, 64.65);

/// 低于该帧率才计算帧率失真
const FRAME_RATE_THRESHOLD: f64 = 24.0;

/// 非标准编码器的三次修正系数 (a, b, c, d)
const H265_CORRECTION: [f64; 4] = [-0.05196039, 0.39430046, 0.17486221, 0.50008018];
const VP9_CORRECTION: [f64; 4] = [-0.04129014, 0.30953836, 0.32314399, 0.5284358];

/// 手持设备补偿 htv1 + htv2*x + htv3*x^2 + htv4*x^3
const HANDHELD: [f64; 4] = [-0.60293, 2.12382, -0.36936, 0.03409];

/// 帧大小补偿（字节）：首秒内的帧含有 SPS/PPS
const FIRST_SECOND_OVERHEAD: f64 = 800.0;
const INTRA_OVERHEAD: f64 = 55.0;
const INTER_OVERHEAD: f64 = 11.0;

/// QP 归一化上限
const MAX_QP: f64 = 51.0;

#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub frame_type: FrameType,
    pub size: f64,
    pub qp_values: Vec<f64>,
}

/// 推入测量窗口的视频帧内容
#[derive(Debug, Clone, PartialEq)]
pub struct VideoPayload {
    pub codec: VideoCodec,
    pub bitrate: f64,
    pub coding_pixels: f64,
    pub display_pixels: f64,
    pub fps: f64,
    /// 模式 0 的合成帧没有帧级信息
    pub frame: Option<FrameInfo>,
}

impl VideoPayload {
    fn frame(&self) -> Result<&FrameInfo> {
        self.frame
            .as_ref()
            .ok_or_else(|| P1203Error::InvalidFrame("窗口中的帧缺少帧级信息".to_string()))
    }
}

type VideoSample = Sample<VideoPayload>;

// ================================================================
// 共用失真项
// ================================================================

pub fn degradation_due_to_upscaling(coding_pixels: f64, display_pixels: f64) -> f64 {
    let (u1, u2) = UPSCALING;
    let scale_factor = (display_pixels / coding_pixels).max(1.0);
    constrain(u1 * (u2 * (scale_factor - 1.0) + 1.0).log10(), 0.0, 100.0)
}

pub fn degradation_due_to_frame_rate(deg_cod: f64, deg_scal: f64, fps: f64) -> f64 {
    let (t1, t2, t3) = FRAME_RATE;
    let deg = if fps < FRAME_RATE_THRESHOLD {
        (100.0 - deg_cod - deg_scal) * (t1 - t2 * fps) / (t3 + fps)
    } else {
        0.0
    };
    constrain(deg, 0.0, 100.0)
}

/// 由编码质量与显示条件得到最终视频 MOS
pub fn integrate_degradations(mos_cod: f64, coding_pixels: f64, display_pixels: f64, fps: f64) -> f64 {
    let deg_cod = constrain(100.0 - r_from_mos(mos_cod), 0.0, 100.0);
    let deg_scal = degradation_due_to_upscaling(coding_pixels, display_pixels);
    let deg_frame_rate = degradation_due_to_frame_rate(deg_cod, deg_scal, fps);
    let deg_all = constrain(deg_cod + deg_scal + deg_frame_rate, 0.0, 100.0);
    mos_from_r(100.0 - deg_all)
}

fn quant_from_bitrate(coeffs: [f64; 4], bitrate: f64, coding_pixels: f64, fps: f64) -> f64 {
    let [a1, a2, a3, a4] = coeffs;
    a1 + a2 * (a3 + bitrate.ln() + (bitrate * bitrate / (coding_pixels * fps) + a4).ln()).ln()
}

fn mos_from_quant(quant: f64) -> f64 {
    constrain(Q1 + Q2 * (Q3 * quant).exp(), 1.0, 5.0)
}

/// 扣除封装开销后的帧大小
pub fn compensated_size(frame_type: FrameType, size: f64, dts: f64) -> f64 {
    let size = size.trunc();
    let compensated = if dts.trunc() == 0.0 {
        size - FIRST_SECOND_OVERHEAD
    } else if frame_type.is_intra() {
        size - INTRA_OVERHEAD
    } else {
        size - INTER_OVERHEAD
    };
    compensated.max(0.0)
}

fn correction(coeffs: [f64; 4], x: f64) -> f64 {
    let [a, b, c, d] = coeffs;
    constrain(a * x * x * x + b * x * x + c * x + d, 1.0, 5.0)
}

/// 非标准编码器的分数映射
pub fn non_standard_correction(codec: VideoCodec, score: f64) -> f64 {
    match codec {
        VideoCodec::H264 => score,
        VideoCodec::H265 => correction(H265_CORRECTION, score),
        VideoCodec::Vp9 => correction(VP9_CORRECTION, score),
    }
}

/// 手持/移动设备上的 O.22 补偿
pub fn handheld_compensation(score: f64) -> f64 {
    let [h1, h2, h3, h4] = HANDHELD;
    constrain(h1 + h2 * score + h3 * score * score + h4 * score * score * score, 1.0, 5.0)
}

// ================================================================
// 各模式公式
// ================================================================

/// 一个模式的编码质量公式：由同一表示层的连续帧得到 mos_cod
pub trait QualityFormula: Send + Sync {
    fn mode(&self) -> Mode;

    fn coding_quality(&self, chunk: &[VideoSample]) -> Result<f64>;
}

#[derive(Debug, Default)]
pub struct MetadataFormula;

impl QualityFormula for MetadataFormula {
    fn mode(&self) -> Mode {
        Mode::Metadata
    }

    fn coding_quality(&self, chunk: &[VideoSample]) -> Result<f64> {
        let bitrates: Vec<f64> = chunk.iter().map(|s| s.payload.bitrate).collect();
        let bitrate = mean(&bitrates).ok_or(P1203Error::NonFiniteScore("O22"))?;
        let first = &chunk[0].payload;
        let quant = quant_from_bitrate(MODE0_QUANT, bitrate, first.coding_pixels, first.fps);
        ensure_finite("O22", mos_from_quant(quant))
    }
}

#[derive(Debug, Default)]
pub struct FrameHeaderFormula;

impl FrameHeaderFormula {
    /// I 帧与非 I 帧平均大小之比；任一类为空时为 0
    fn iframe_ratio(sizes: &[(FrameType, f64)]) -> f64 {
        let intra: Vec<f64> = sizes.iter().filter(|(t, _)| t.is_intra()).map(|(_, s)| *s).collect();
        let inter: Vec<f64> = sizes.iter().filter(|(t, _)| !t.is_intra()).map(|(_, s)| *s).collect();
        match (mean(&intra), mean(&inter)) {
            (Some(i), Some(n)) => i / n,
            _ => 0.0,
        }
    }
}

impl QualityFormula for FrameHeaderFormula {
    fn mode(&self) -> Mode {
        Mode::FrameHeaders
    }

    fn coding_quality(&self, chunk: &[VideoSample]) -> Result<f64> {
        let mut sizes = Vec::with_capacity(chunk.len());
        for sample in chunk {
            let frame = sample.payload.frame()?;
            sizes.push((
                frame.frame_type,
                compensated_size(frame.frame_type, frame.size, sample.dts),
            ));
        }

        let duration: f64 = chunk.iter().map(|s| s.duration).sum();
        let total_bytes: f64 = sizes.iter().map(|(_, s)| s).sum();
        let bitrate = total_bytes * 8.0 / duration / 1000.0;

        let first = &chunk[0].payload;
        let quant = quant_from_bitrate(MODE1_QUANT, bitrate, first.coding_pixels, first.fps);
        let [c0, c1, c2, c3] = COMPLEXITY;
        let complexity = sigmoid(c0, c1, c2, c3, Self::iframe_ratio(&sizes));
        ensure_finite("O22", mos_from_quant(quant) + complexity)
    }
}

#[derive(Debug, Default)]
pub struct BitstreamFormula {
    /// 为真时只使用带 QP 的帧（模式 2）
    pub sampled: bool,
}

impl BitstreamFormula {
    /// P/B 帧的 QP 序列；I 帧前最后一个 P/B 值替换为其前一个值，只有一个时丢弃
    pub fn qp_pb_values<'a>(frames: impl Iterator<Item = &'a FrameInfo>) -> Result<(Vec<f64>, Vec<f64>)> {
        let mut qppb: Vec<f64> = Vec::new();
        let mut all = Vec::new();
        for frame in frames {
            all.extend_from_slice(&frame.qp_values);
            match frame.frame_type {
                FrameType::P | FrameType::B => qppb.extend_from_slice(&frame.qp_values),
                FrameType::I => match qppb.len() {
                    0 => {}
                    1 => qppb.clear(),
                    n => qppb[n - 1] = qppb[n - 2],
                },
                FrameType::NonI => {
                    return Err(P1203Error::InvalidFrame(
                        "比特流模式下帧类型必须为 I/P/B".to_string(),
                    ))
                }
            }
        }
        Ok((qppb, all))
    }
}

impl QualityFormula for BitstreamFormula {
    fn mode(&self) -> Mode {
        if self.sampled {
            Mode::BitstreamSampled
        } else {
            Mode::BitstreamFull
        }
    }

    fn coding_quality(&self, chunk: &[VideoSample]) -> Result<f64> {
        let mut frames = Vec::with_capacity(chunk.len());
        for sample in chunk {
            let frame = sample.payload.frame()?;
            if frame.qp_values.is_empty() {
                if self.sampled {
                    continue;
                }
                return Err(P1203Error::InvalidFrame(format!(
                    "dts={:.3} 的帧没有 QP 值",
                    sample.dts
                )));
            }
            frames.push(frame);
        }

        let (qppb, all) = Self::qp_pb_values(frames.into_iter())?;
        // 窗口内没有可用的 P/B 帧 QP 时退回全部 QP 的均值
        let avg_qp = mean(&qppb)
            .or_else(|| mean(&all))
            .ok_or(P1203Error::NonFiniteScore("O22"))?;
        ensure_finite("O22", mos_from_quant(avg_qp / MAX_QP))
    }
}

pub fn formula_for(mode: Mode) -> Box<dyn QualityFormula> {
    match mode {
        Mode::Metadata => Box::new(MetadataFormula),
        Mode::FrameHeaders => Box::new(FrameHeaderFormula),
        Mode::BitstreamSampled => Box::new(BitstreamFormula { sampled: true }),
        Mode::BitstreamFull => Box::new(BitstreamFormula { sampled: false }),
    }
}

// ================================================================
// 模型
// ================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct VideoOutput {
    pub mode: Mode,
    pub scores: Vec<f64>,
}

/// 视频质量模型 (O.22)
#[derive(Debug, Clone)]
pub struct VideoQualityModel {
    display_size: Resolution,
    policy: ModePolicy,
}

impl VideoQualityModel {
    pub fn new(display_size: Resolution, policy: ModePolicy) -> Self {
        Self {
            display_size,
            policy,
        }
    }

    /// 确定整条流的评估模式
    pub fn determine_mode(&self, segments: &[VideoSegment], warnings: &mut Warnings) -> Result<Mode> {
        let capability = segments
            .iter()
            .map(|s| s.detail.capability())
            .min()
            .unwrap_or(Mode::Metadata);

        let non_standard = segments.iter().find(|s| !s.codec.is_standard()).map(|s| s.codec);
        if let Some(codec) = non_standard {
            warnings.push(
                WarningCode::NonStandardCodec,
                format!("使用了非标准编码器 {}，O.22 结果不符合标准", codec.as_str()),
            );
        }

        match self.policy {
            ModePolicy::Forced(mode) => {
                if mode > capability {
                    return Err(P1203Error::InputValidation(format!(
                        "指定模式 {} 高于输入支持的模式 {}",
                        mode.as_u8(),
                        capability.as_u8()
                    )));
                }
                if mode != Mode::Metadata && non_standard.is_some() {
                    return Err(P1203Error::UnsupportedCodec(
                        "非标准编码器只能在模式 0 下评估".to_string(),
                    ));
                }
                Ok(mode)
            }
            ModePolicy::LowestCommon => {
                if non_standard.is_some() && capability != Mode::Metadata {
                    info!(capability = capability.as_u8(), "非标准编码器，降级到模式 0");
                    return Ok(Mode::Metadata);
                }
                Ok(capability)
            }
        }
    }

    pub fn calculate(&self, segments: &[VideoSegment], warnings: &mut Warnings) -> Result<VideoOutput> {
        let mode = self.determine_mode(segments, warnings)?;
        let formula = formula_for(mode);
        debug!(mode = formula.mode().as_u8(), segments = segments.len(), "视频评估模式");

        let mut window = MeasurementWindow::new();
        let mut scores = Vec::new();
        let mut dts = 0.0;

        for segment in segments {
            let representation: Arc<str> = Arc::from(segment.representation_key());
            let display = segment.display_size.unwrap_or(self.display_size);
            let frame_duration = 1.0 / segment.fps;

            let base = VideoPayload {
                codec: segment.codec,
                bitrate: segment.bitrate,
                coding_pixels: segment.resolution.pixels(),
                display_pixels: display.pixels(),
                fps: segment.fps,
                frame: None,
            };

            let frames = match (mode, segment.detail.frames()) {
                (Mode::Metadata, _) | (_, None) => None,
                (_, Some(frames)) => Some(frames),
            };

            let count = match frames {
                Some(frames) => frames.len(),
                None => (segment.duration * segment.fps) as usize,
            };

            for index in 0..count {
                let payload = match frames {
                    Some(frames) => VideoPayload {
                        frame: Some(FrameInfo {
                            frame_type: frames[index].frame_type,
                            size: frames[index].size,
                            qp_values: frames[index].qp_values.clone(),
                        }),
                        ..base.clone()
                    },
                    None => base.clone(),
                };
                let digest = payload_digest(&payload, dts);
                let sample = Sample::new(dts, frame_duration, Arc::clone(&representation), payload, digest);
                if let Some(position) = window.add_frame(sample)? {
                    scores.push(Self::score_position(&mut window, formula.as_ref(), position)?);
                }
                dts += frame_duration;
            }
        }

        window.finish();
        while let Some(position) = window.next_flush_position() {
            scores.push(Self::score_position(&mut window, formula.as_ref(), position)?);
        }

        debug!(
            seconds = scores.len(),
            representations = window.state().epoch + 1,
            cache = ?window.cache_stats(),
            "视频分数计算完成"
        );
        Ok(VideoOutput { mode, scores })
    }

    fn score_position(
        window: &mut MeasurementWindow<VideoPayload>,
        formula: &dyn QualityFormula,
        position: u32,
    ) -> Result<f64> {
        window.score_at(position, false, |chunk| {
            let first = &chunk[0].payload;
            if chunk.iter().any(|s| s.payload.codec != first.codec) {
                return Err(P1203Error::InputValidation(
                    "测量窗口内检测到编码器切换".to_string(),
                ));
            }
            let mos_cod = formula.coding_quality(chunk)?;
            let score = integrate_degradations(mos_cod, first.coding_pixels, first.display_pixels, first.fps);
            bounded_score("O22", non_standard_correction(first.codec, score))
        })
    }
}

/// 帧内容摘要；首秒标志会影响帧大小补偿，需一并计入
fn payload_digest(payload: &VideoPayload, dts: f64) -> [u8; 32] {
    let mut frame_bytes = Vec::new();
    if let Some(frame) = &payload.frame {
        frame_bytes.push(frame.frame_type.tag());
        frame_bytes.push(u8::from(dts.trunc() == 0.0));
        frame_bytes.extend_from_slice(&frame.size.to_le_bytes());
        for qp in &frame.qp_values {
            frame_bytes.extend_from_slice(&qp.to_le_bytes());
        }
    }
    digest_parts(&[
        payload.codec.as_str().as_bytes(),
        &payload.bitrate.to_le_bytes(),
        &payload.coding_pixels.to_le_bytes(),
        &payload.display_pixels.to_le_bytes(),
        &payload.fps.to_le_bytes(),
        &frame_bytes,
    ])
}
