// ----------------------------------------------------------------
// 项目: P.1203 视听质量评估 (p1203-rs)
// 模块: model/input.rs
// 描述: 输入报告的数据结构与校验。
//      原始 JSON 先反序列化为 Raw* 结构体，再一次性转换成强类型的
//      片段/帧描述；之后的模型代码只面对封闭的枚举，不再检查可选字段。
// ----------------------------------------------------------------

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::errors::{P1203Error, Result, WarningCode, Warnings};
use super::mos::round_to;

/// 相邻片段首尾时间比较前保留的小数位
const CONTINUITY_DECIMALS: i32 = 2;

/// 超过该间隙（秒）的片段不连续视为输入错误，以内只记告警
pub const CONTINUITY_TOLERANCE_S: f64 = 0.5;

/// 未指定显示分辨率时的默认值
pub const DEFAULT_DISPLAY_SIZE: Resolution = Resolution {
    width: 1920,
    height: 1080,
};

lazy_static! {
    static ref RESOLUTION_REGEX: Regex = Regex::new(r"^\s*(\d+)\s*[xX]\s*(\d+)\s*$").unwrap();
    static ref LINE_CONTINUATION_REGEX: Regex = Regex::new(r"\\\n").unwrap();
    static ref LINE_COMMENT_REGEX: Regex = Regex::new(r#"(?m)(^|\s)//[^"\n]*$"#).unwrap();
}

// ================================================================
// 原始 JSON 结构 (Raw Input Schema)
// ================================================================

/// 流标识，既可能是数字也可能是字符串
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamId {
    Number(i64),
    Text(String),
}

impl Default for StreamId {
    fn default() -> Self {
        StreamId::Number(-1)
    }
}

/// 一份完整的输入报告
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InputReport {
    #[serde(rename = "I11")]
    pub audio: Option<RawStream<RawAudioSegment>>,

    #[serde(rename = "I13")]
    pub video: Option<RawStream<RawVideoSegment>>,

    #[serde(rename = "I23")]
    pub stalling: Option<RawStalling>,

    #[serde(rename = "IGen", default)]
    pub generic: RawGeneric,

    /// 直接给出的音频分数，替代 I11
    #[serde(rename = "O21")]
    pub o21: Option<Vec<f64>>,

    /// 直接给出的视频分数，替代 I13
    #[serde(rename = "O22")]
    pub o22: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStream<S> {
    #[serde(rename = "streamId")]
    pub stream_id: Option<StreamId>,
    pub segments: Option<Vec<S>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAudioSegment {
    pub bitrate: f64,
    pub codec: String,
    pub duration: f64,
    pub start: f64,
    pub representation: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawVideoSegment {
    pub bitrate: f64,
    pub codec: String,
    pub duration: f64,
    pub start: f64,
    pub fps: f64,
    pub resolution: String,
    #[serde(rename = "displaySize")]
    pub display_size: Option<String>,
    pub representation: Option<Value>,
    pub frames: Option<Vec<RawFrame>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    #[serde(rename = "frameType")]
    pub frame_type: Option<String>,
    #[serde(rename = "frameSize")]
    pub frame_size: Option<f64>,
    #[serde(rename = "qpValues")]
    pub qp_values: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStalling {
    /// [[位置, 时长], ...]，位置为媒体时间（秒）
    pub stalling: Option<Vec<(f64, f64)>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawGeneric {
    pub device: Option<String>,
    #[serde(rename = "displaySize")]
    pub display_size: Option<String>,
}

impl InputReport {
    /// 解析 JSON 文本，允许 `//` 行注释
    pub fn from_json_str(text: &str) -> Result<Self> {
        let without_continuations = LINE_CONTINUATION_REGEX.replace_all(text, "");
        let cleaned = LINE_COMMENT_REGEX.replace_all(&without_continuations, "$1");
        serde_json::from_str(&cleaned)
            .map_err(|e| P1203Error::InputValidation(format!("JSON 解析失败: {e}")))
    }
}

// ================================================================
// 强类型描述 (Typed Descriptions)
// ================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioCodec {
    Mp2,
    Ac3,
    AacLc,
    HeAac,
}

impl AudioCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioCodec::Mp2 => "mp2",
            AudioCodec::Ac3 => "ac3",
            AudioCodec::AacLc => "aaclc",
            AudioCodec::HeAac => "heaac",
        }
    }
}

impl FromStr for AudioCodec {
    type Err = P1203Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp2" => Ok(AudioCodec::Mp2),
            "ac3" => Ok(AudioCodec::Ac3),
            "aaclc" | "aac" => Ok(AudioCodec::AacLc),
            "heaac" => Ok(AudioCodec::HeAac),
            _ => Err(P1203Error::UnsupportedCodec(format!(
                "音频编码器 {s}，可选: mp2/ac3/aaclc/heaac"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
}

impl VideoCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Vp9 => "vp9",
        }
    }

    /// 标准模型只针对 H.264 训练
    pub fn is_standard(self) -> bool {
        self == VideoCodec::H264
    }
}

impl FromStr for VideoCodec {
    type Err = P1203Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "h264" => Ok(VideoCodec::H264),
            "h265" | "hevc" => Ok(VideoCodec::H265),
            "vp9" => Ok(VideoCodec::Vp9),
            _ => Err(P1203Error::UnsupportedCodec(format!(
                "视频编码器 {s}，可选: h264/h265/hevc/vp9"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn pixels(self) -> f64 {
        self.width as f64 * self.height as f64
    }
}

impl FromStr for Resolution {
    type Err = P1203Error;

    fn from_str(s: &str) -> Result<Self> {
        let caps = RESOLUTION_REGEX
            .captures(s)
            .ok_or_else(|| P1203Error::InputValidation(format!("分辨率格式错误: {s}")))?;
        let width: u32 = caps[1]
            .parse()
            .map_err(|_| P1203Error::InputValidation(format!("分辨率宽度非法: {s}")))?;
        let height: u32 = caps[2]
            .parse()
            .map_err(|_| P1203Error::InputValidation(format!("分辨率高度非法: {s}")))?;
        if width == 0 || height == 0 {
            return Err(P1203Error::InputValidation(format!("分辨率不能为零: {s}")));
        }
        Ok(Resolution { width, height })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    I,
    P,
    B,
    /// 只知道不是 I 帧（例如 "Non-I"）
    NonI,
}

impl FrameType {
    fn parse(s: &str) -> Self {
        match s.trim() {
            "I" => FrameType::I,
            "P" => FrameType::P,
            "B" => FrameType::B,
            _ => FrameType::NonI,
        }
    }

    pub fn is_intra(self) -> bool {
        self == FrameType::I
    }

    pub fn tag(self) -> u8 {
        match self {
            FrameType::I => b'I',
            FrameType::P => b'P',
            FrameType::B => b'B',
            FrameType::NonI => b'N',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_type: FrameType,
    /// 字节数
    pub size: f64,
    /// 宏块 QP；为空表示该帧没有比特流细节
    pub qp_values: Vec<f64>,
}

impl Frame {
    pub fn has_qp(&self) -> bool {
        !self.qp_values.is_empty()
    }
}

/// 评估模式 0-3，对应可用的输入细节层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Mode {
    Metadata = 0,
    FrameHeaders = 1,
    BitstreamSampled = 2,
    BitstreamFull = 3,
}

impl Mode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Mode::Metadata),
            1 => Ok(Mode::FrameHeaders),
            2 => Ok(Mode::BitstreamSampled),
            3 => Ok(Mode::BitstreamFull),
            _ => Err(P1203Error::InputValidation(format!(
                "模式必须为 0-3，实际为 {value}"
            ))),
        }
    }
}

/// 片段细节层级，解析时确定一次
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentDetail {
    MetadataOnly,
    FrameHeaders(Vec<Frame>),
    /// 只有部分帧带 QP
    BitstreamSampled(Vec<Frame>),
    /// 每一帧都带 QP
    BitstreamFull(Vec<Frame>),
}

impl SegmentDetail {
    fn from_frames(frames: Vec<Frame>) -> Self {
        let with_qp = frames.iter().filter(|f| f.has_qp()).count();
        if with_qp == 0 {
            SegmentDetail::FrameHeaders(frames)
        } else if with_qp == frames.len() {
            SegmentDetail::BitstreamFull(frames)
        } else {
            SegmentDetail::BitstreamSampled(frames)
        }
    }

    pub fn capability(&self) -> Mode {
        match self {
            SegmentDetail::MetadataOnly => Mode::Metadata,
            SegmentDetail::FrameHeaders(_) => Mode::FrameHeaders,
            SegmentDetail::BitstreamSampled(_) => Mode::BitstreamSampled,
            SegmentDetail::BitstreamFull(_) => Mode::BitstreamFull,
        }
    }

    pub fn frames(&self) -> Option<&[Frame]> {
        match self {
            SegmentDetail::MetadataOnly => None,
            SegmentDetail::FrameHeaders(frames)
            | SegmentDetail::BitstreamSampled(frames)
            | SegmentDetail::BitstreamFull(frames) => Some(frames),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub codec: AudioCodec,
    /// kbit/s
    pub bitrate: f64,
    pub start: f64,
    pub duration: f64,
    pub representation: Option<String>,
}

impl AudioSegment {
    /// 表示层标识：显式 ID，否则由 (码率, 编码器) 组成
    pub fn representation_key(&self) -> String {
        match &self.representation {
            Some(id) => format!("id:{id}"),
            None => format!("{}|{}", self.bitrate, self.codec.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoSegment {
    pub codec: VideoCodec,
    /// kbit/s
    pub bitrate: f64,
    pub start: f64,
    pub duration: f64,
    pub fps: f64,
    pub resolution: Resolution,
    /// 片段级显示分辨率，优先于会话级设置
    pub display_size: Option<Resolution>,
    pub representation: Option<String>,
    pub detail: SegmentDetail,
}

impl VideoSegment {
    /// 表示层标识：显式 ID，否则由 (码率, 分辨率, 帧率, 编码器, 显示分辨率) 组成
    pub fn representation_key(&self) -> String {
        match &self.representation {
            Some(id) => format!("id:{id}"),
            None => {
                let display = self
                    .display_size
                    .map(|d| d.to_string())
                    .unwrap_or_default();
                format!(
                    "{}|{}|{}|{}|{}",
                    self.bitrate,
                    self.resolution,
                    self.fps,
                    self.codec.as_str(),
                    display
                )
            }
        }
    }

    fn encoding_tuple(&self) -> String {
        format!("{}|{}|{}", self.bitrate, self.resolution, self.fps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StallingEvent {
    /// 媒体时间（秒）
    pub start: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Pc,
    Tv,
    Mobile,
    Handheld,
}

impl Device {
    pub fn is_handheld(self) -> bool {
        matches!(self, Device::Mobile | Device::Handheld)
    }
}

impl FromStr for Device {
    type Err = P1203Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pc" => Ok(Device::Pc),
            "tv" => Ok(Device::Tv),
            "mobile" => Ok(Device::Mobile),
            "handheld" => Ok(Device::Handheld),
            _ => Err(P1203Error::InputValidation(format!(
                "不支持的设备类型: {s}，可选: pc/tv/mobile/handheld"
            ))),
        }
    }
}

/// 音频来源：片段描述或现成的 O.21
#[derive(Debug, Clone, PartialEq)]
pub enum AudioSource {
    Segments(Vec<AudioSegment>),
    Scores(Vec<f64>),
    Absent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VideoSource {
    Segments(Vec<VideoSegment>),
    Scores(Vec<f64>),
    Absent,
}

/// 校验后的单个评估输入
#[derive(Debug, Clone)]
pub struct EvaluationInput {
    pub stream_id: StreamId,
    pub audio: AudioSource,
    pub video: VideoSource,
    pub stalling: Vec<StallingEvent>,
    pub device: Device,
    pub display_size: Resolution,
}

impl EvaluationInput {
    pub fn from_report(report: &InputReport, warnings: &mut Warnings) -> Result<Self> {
        let audio = match (&report.audio, &report.o21) {
            (Some(stream), _) => {
                let raw = stream.segments.as_deref().unwrap_or_default();
                if stream.segments.is_none() {
                    warnings.push(WarningCode::MissingMetadata, "I11 中没有音频片段");
                }
                let segments = raw
                    .iter()
                    .map(convert_audio_segment)
                    .collect::<Result<Vec<_>>>()?;
                check_continuity(
                    "音频",
                    segments.iter().map(|s| (s.start, s.duration)),
                    warnings,
                )?;
                AudioSource::Segments(segments)
            }
            (None, Some(scores)) => AudioSource::Scores(scores.clone()),
            (None, None) => AudioSource::Absent,
        };

        let video = match (&report.video, &report.o22) {
            (Some(stream), _) => {
                let raw = stream.segments.as_deref().ok_or_else(|| {
                    P1203Error::InputValidation("I13 中没有定义视频片段".to_string())
                })?;
                let segments = raw
                    .iter()
                    .enumerate()
                    .map(|(index, s)| convert_video_segment(index, s, warnings))
                    .collect::<Result<Vec<_>>>()?;
                check_continuity(
                    "视频",
                    segments.iter().map(|s| (s.start, s.duration)),
                    warnings,
                )?;
                check_representation_ambiguity(&segments, warnings);
                VideoSource::Segments(segments)
            }
            (None, Some(scores)) => VideoSource::Scores(scores.clone()),
            (None, None) => VideoSource::Absent,
        };

        let stream_id = report
            .video
            .as_ref()
            .and_then(|v| v.stream_id.clone())
            .or_else(|| report.audio.as_ref().and_then(|a| a.stream_id.clone()))
            .unwrap_or_default();

        let device = match &report.generic.device {
            Some(device) => device.parse()?,
            None => Device::Pc,
        };

        let display_size = match &report.generic.display_size {
            Some(size) => size.parse()?,
            None => DEFAULT_DISPLAY_SIZE,
        };

        let stalling = report
            .stalling
            .as_ref()
            .and_then(|s| s.stalling.as_ref())
            .map(|events| {
                events
                    .iter()
                    .map(|&(start, duration)| StallingEvent { start, duration })
                    .collect()
            })
            .unwrap_or_default();

        Ok(EvaluationInput {
            stream_id,
            audio,
            video,
            stalling,
            device,
            display_size,
        })
    }
}

fn representation_id(value: &Option<Value>) -> Option<String> {
    value.as_ref().and_then(|v| match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    })
}

fn check_positive(field: &str, value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(P1203Error::InputValidation(format!(
            "{field} 必须为正数，实际为 {value}"
        )))
    }
}

fn check_start(value: f64) -> Result<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(P1203Error::InputValidation(format!(
            "片段起始时间非法: {value}"
        )))
    }
}

fn convert_audio_segment(raw: &RawAudioSegment) -> Result<AudioSegment> {
    Ok(AudioSegment {
        codec: raw.codec.parse()?,
        bitrate: check_positive("bitrate", raw.bitrate)?,
        start: check_start(raw.start)?,
        duration: check_positive("duration", raw.duration)?,
        representation: representation_id(&raw.representation),
    })
}

fn convert_video_segment(
    index: usize,
    raw: &RawVideoSegment,
    warnings: &mut Warnings,
) -> Result<VideoSegment> {
    let fps = check_positive("fps", raw.fps)?;
    let duration = check_positive("duration", raw.duration)?;

    let detail = match &raw.frames {
        None => SegmentDetail::MetadataOnly,
        Some(frames) if frames.is_empty() => SegmentDetail::MetadataOnly,
        Some(frames) => {
            let frames = frames
                .iter()
                .enumerate()
                .map(|(i, f)| convert_frame(index, i, f))
                .collect::<Result<Vec<_>>>()?;
            let expected = (duration * fps) as usize;
            if frames.len() != expected {
                warnings.push(
                    WarningCode::FrameCountMismatch,
                    format!(
                        "视频片段 {index} 给出 {} 帧，按时长与帧率应为 {expected} 帧",
                        frames.len()
                    ),
                );
            }
            SegmentDetail::from_frames(frames)
        }
    };

    Ok(VideoSegment {
        codec: raw.codec.parse()?,
        bitrate: check_positive("bitrate", raw.bitrate)?,
        start: check_start(raw.start)?,
        duration,
        fps,
        resolution: raw.resolution.parse()?,
        display_size: raw
            .display_size
            .as_deref()
            .map(Resolution::from_str)
            .transpose()?,
        representation: representation_id(&raw.representation),
        detail,
    })
}

fn convert_frame(segment: usize, index: usize, raw: &RawFrame) -> Result<Frame> {
    let (Some(frame_type), Some(size)) = (&raw.frame_type, raw.frame_size) else {
        return Err(P1203Error::InvalidFrame(format!(
            "片段 {segment} 第 {index} 帧至少需要 frameType 与 frameSize"
        )));
    };
    if !size.is_finite() || size < 0.0 {
        return Err(P1203Error::InvalidFrame(format!(
            "片段 {segment} 第 {index} 帧大小非法: {size}"
        )));
    }
    let qp_values = raw.qp_values.clone().unwrap_or_default();
    if qp_values.iter().any(|qp| !qp.is_finite()) {
        return Err(P1203Error::InvalidFrame(format!(
            "片段 {segment} 第 {index} 帧含有非法 QP 值"
        )));
    }
    Ok(Frame {
        frame_type: FrameType::parse(frame_type),
        size,
        qp_values,
    })
}

/// 检查片段首尾相接。舍入后的小误差忽略，较小间隙记告警，过大间隙或回退视为错误。
fn check_continuity(
    stream: &str,
    spans: impl Iterator<Item = (f64, f64)>,
    warnings: &mut Warnings,
) -> Result<()> {
    let mut previous_end: Option<f64> = None;
    for (index, (start, duration)) in spans.enumerate() {
        if let Some(end) = previous_end {
            let end = round_to(end, CONTINUITY_DECIMALS);
            let this_start = round_to(start, CONTINUITY_DECIMALS);
            let gap = this_start - end;
            if gap.abs() > CONTINUITY_TOLERANCE_S {
                return Err(P1203Error::InputValidation(format!(
                    "{stream}片段 {index} 起始于 {this_start}，但上一片段结束于 {end}"
                )));
            }
            if gap != 0.0 {
                warnings.push(
                    WarningCode::SegmentGap,
                    format!("{stream}片段 {index} 起始于 {this_start}，但上一片段结束于 {end}"),
                );
            }
        }
        previous_end = Some(start + duration);
    }
    Ok(())
}

/// 同一编码参数却有不同表示层 ID，或同一 ID 对应不同编码参数
fn check_representation_ambiguity(segments: &[VideoSegment], warnings: &mut Warnings) {
    let mut ids_by_tuple: HashMap<String, Option<&str>> = HashMap::new();
    let mut tuples_by_id: HashMap<&str, String> = HashMap::new();

    for segment in segments {
        let tuple = segment.encoding_tuple();
        let id = segment.representation.as_deref();

        if let Some(seen) = ids_by_tuple.get(&tuple) {
            if *seen != id {
                warnings.push(
                    WarningCode::RepresentationAmbiguity,
                    format!("编码参数 {tuple} 对应多个表示层 ID: {seen:?} / {id:?}"),
                );
            }
        } else {
            ids_by_tuple.insert(tuple.clone(), id);
        }

        if let Some(id) = id {
            match tuples_by_id.get(id) {
                Some(seen) if *seen != tuple => warnings.push(
                    WarningCode::RepresentationAmbiguity,
                    format!("表示层 {id} 对应多组编码参数: {seen} / {tuple}"),
                ),
                Some(_) => {}
                None => {
                    tuples_by_id.insert(id, tuple);
                }
            }
        }
    }
}
