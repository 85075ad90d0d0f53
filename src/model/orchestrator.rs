// ----------------------------------------------------------------
// 项目: P.1203 视听质量评估 (p1203-rs)
// 模块: model/orchestrator.rs
// 描述: 批量评估调度。
//      每个输入是一个独立任务，在固定大小的线程池中运行；
//      单个输入失败只记录为错误条目，结果按提交顺序返回。
// ----------------------------------------------------------------

use indicatif::ProgressBar;
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use super::audio::AudioQualityModel;
use super::config::{EvaluationConfig, Restriction};
use super::errors::{P1203Error, Result, Warnings};
use super::input::{AudioSource, EvaluationInput, InputReport, StreamId, VideoSource};
use super::integration::IntegrationModel;
use super::mos::bounded_score;
use super::video::{VideoOutput, VideoQualityModel};

/// 一个待评估的输入
#[derive(Debug, Clone)]
pub enum BatchInput {
    Path(PathBuf),
    Document { id: String, report: InputReport },
}

impl BatchInput {
    pub fn id(&self) -> String {
        match self {
            BatchInput::Path(path) => path.display().to_string(),
            BatchInput::Document { id, .. } => id.clone(),
        }
    }

    fn load(&self) -> Result<InputReport> {
        match self {
            BatchInput::Path(path) => load_report(path),
            BatchInput::Document { report, .. } => Ok(report.clone()),
        }
    }
}

pub fn load_report(path: &Path) -> Result<InputReport> {
    let text = fs::read_to_string(path)?;
    InputReport::from_json_str(&text)
}

/// 单个输入的最终报告，创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    #[serde(rename = "streamId")]
    stream_id: StreamId,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<u8>,
    #[serde(rename = "O23")]
    o23: f64,
    #[serde(rename = "O34")]
    o34: Vec<f64>,
    #[serde(rename = "O35")]
    o35: f64,
    #[serde(rename = "O46")]
    o46: f64,
    #[serde(rename = "O21", skip_serializing_if = "Option::is_none")]
    o21: Option<Vec<f64>>,
    #[serde(rename = "O22", skip_serializing_if = "Option::is_none")]
    o22: Option<Vec<f64>>,
    warnings: Vec<String>,
}

impl QualityReport {
    pub fn mode(&self) -> Option<u8> {
        self.mode
    }

    pub fn o23(&self) -> f64 {
        self.o23
    }

    pub fn o34(&self) -> &[f64] {
        &self.o34
    }

    pub fn o35(&self) -> f64 {
        self.o35
    }

    pub fn o46(&self) -> f64 {
        self.o46
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// 按限制选项输出的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Evaluation {
    Full(QualityReport),
    AudioOnly {
        #[serde(rename = "streamId")]
        stream_id: StreamId,
        #[serde(rename = "O21")]
        o21: Vec<f64>,
    },
    VideoOnly {
        #[serde(rename = "streamId")]
        stream_id: StreamId,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<u8>,
        #[serde(rename = "O22")]
        o22: Vec<f64>,
    },
}

impl Evaluation {
    pub fn mode(&self) -> Option<u8> {
        match self {
            Evaluation::Full(report) => report.mode,
            Evaluation::AudioOnly { .. } => None,
            Evaluation::VideoOnly { mode, .. } => *mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEntry {
    pub error: String,
    pub kind: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outcome {
    Evaluated(Evaluation),
    Failed(ErrorEntry),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub id: String,
    pub outcome: Outcome,
}

impl BatchEntry {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Failed(_))
    }
}

pub struct Orchestrator {
    config: EvaluationConfig,
}

impl Orchestrator {
    pub fn new(config: EvaluationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// 在线程池中评估全部输入，返回顺序与输入顺序一致
    pub fn run(&self, inputs: &[BatchInput], progress: Option<&ProgressBar>) -> Result<Vec<BatchEntry>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
            .map_err(|e| P1203Error::WorkerPool(e.to_string()))?;

        info!(inputs = inputs.len(), workers = self.config.workers, "开始批量评估");

        let entries: Vec<BatchEntry> = pool.install(|| {
            inputs
                .par_iter()
                .map(|input| {
                    let entry = self.run_one(input);
                    if let Some(bar) = progress {
                        bar.set_message(entry.id.clone());
                        bar.inc(1);
                    }
                    entry
                })
                .collect()
        });

        let failed = entries.iter().filter(|e| e.is_error()).count();
        info!(total = entries.len(), failed, "批量评估完成");
        Ok(entries)
    }

    fn run_one(&self, input: &BatchInput) -> BatchEntry {
        let id = input.id();
        let outcome = match input.load().and_then(|report| self.evaluate(&report)) {
            Ok(evaluation) => Outcome::Evaluated(evaluation),
            Err(e) => {
                error!(input = %id, kind = e.kind(), "{}", e);
                Outcome::Failed(ErrorEntry {
                    error: e.to_string(),
                    kind: e.kind(),
                })
            }
        };
        BatchEntry { id, outcome }
    }

    /// 单个输入的完整流程：Pa / Pv → Pq
    pub fn evaluate(&self, report: &InputReport) -> Result<Evaluation> {
        let mut warnings = Warnings::new();
        let input = EvaluationInput::from_report(report, &mut warnings)?;

        match self.config.restriction {
            Restriction::AudioOnly => {
                let o21 = self.audio_scores(&input)?;
                if o21.is_empty() {
                    return Err(P1203Error::MissingScores("输入中没有音频 (I11 或 O21)".to_string()));
                }
                Ok(Evaluation::AudioOnly {
                    stream_id: input.stream_id,
                    o21,
                })
            }
            Restriction::VideoOnly => {
                let video = self.video_scores(&input, &mut warnings)?;
                Ok(Evaluation::VideoOnly {
                    stream_id: input.stream_id,
                    mode: video.mode,
                    o22: video.scores,
                })
            }
            Restriction::Both => {
                // 音频与视频之间没有数据依赖
                let mut video_warnings = Warnings::new();
                let (audio, video) = rayon::join(
                    || self.audio_scores(&input),
                    || self.video_scores(&input, &mut video_warnings),
                );
                let (o21, video) = (audio?, video?);
                warnings.merge(video_warnings);

                let model = IntegrationModel::new(input.device, self.config.amendments, self.config.forest.clone());
                let output = model.calculate(&o21, &video.scores, &input.stalling, &mut warnings)?;
                debug!(stream = ?input.stream_id, o46 = output.o46, "单个输入评估完成");

                let (o21, o22) = if self.config.print_intermediate {
                    (Some(o21), Some(video.scores))
                } else {
                    (None, None)
                };
                Ok(Evaluation::Full(QualityReport {
                    stream_id: input.stream_id,
                    mode: video.mode,
                    o23: output.o23,
                    o34: output.o34,
                    o35: output.o35,
                    o46: output.o46,
                    o21,
                    o22,
                    warnings: warnings.into_codes(),
                }))
            }
        }
    }

    fn audio_scores(&self, input: &EvaluationInput) -> Result<Vec<f64>> {
        match &input.audio {
            AudioSource::Segments(segments) => AudioQualityModel::new().calculate(segments),
            AudioSource::Scores(scores) => passthrough("O21", scores),
            AudioSource::Absent => Ok(Vec::new()),
        }
    }

    fn video_scores(&self, input: &EvaluationInput, warnings: &mut Warnings) -> Result<ScoredVideo> {
        match &input.video {
            VideoSource::Segments(segments) => {
                let model = VideoQualityModel::new(input.display_size, self.config.mode_policy);
                let VideoOutput { mode, scores } = model.calculate(segments, warnings)?;
                Ok(ScoredVideo {
                    mode: Some(mode.as_u8()),
                    scores,
                })
            }
            VideoSource::Scores(scores) => Ok(ScoredVideo {
                mode: None,
                scores: passthrough("O22", scores)?,
            }),
            VideoSource::Absent => Err(P1203Error::MissingScores(
                "输入中没有视频 (I13 或 O22)".to_string(),
            )),
        }
    }
}

struct ScoredVideo {
    mode: Option<u8>,
    scores: Vec<f64>,
}

/// 直接给出的分数同样需要是有限值并落在 [1, 5]
fn passthrough(label: &'static str, scores: &[f64]) -> Result<Vec<f64>> {
    scores.iter().map(|&s| bounded_score(label, s)).collect()
}
