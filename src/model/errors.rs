// ----------------------------------------------------------------
// 项目: P.1203 视听质量评估 (p1203-rs)
// 模块: model/errors.rs
// 描述: 模型层错误分类与非致命告警码。
//      致命错误只终止当前输入的计算，告警码随报告一起输出。
// ----------------------------------------------------------------

use thiserror::Error;
use tracing::warn;

/// 模型层统一错误类型
#[derive(Error, Debug)]
pub enum P1203Error {
    /// 输入缺少必需字段、片段列表格式错误或时间戳非单调
    #[error("[E_INPUT] 输入校验失败: {0}")]
    InputValidation(String),

    /// 编码器不在支持的枚举集合内
    #[error("[E_CODEC] 不支持的编码器: {0}")]
    UnsupportedCodec(String),

    /// 帧描述缺失或非法（帧类型、QP 值）
    #[error("[E_FRAME] 帧数据非法: {0}")]
    InvalidFrame(String),

    /// 数值计算产生 NaN/Inf
    #[error("[E_NON_FINITE] {0} 计算结果不是有限数值")]
    NonFiniteScore(&'static str),

    /// 缺少集成阶段所需的 O.21/O.22 分数
    #[error("[E_MISSING_SCORES] {0}")]
    MissingScores(String),

    /// 随机森林决策树文件无法加载或结构损坏
    #[error("[E_TREE_MODEL] {0}")]
    TreeModel(String),

    /// 线程池构建失败
    #[error("[E_WORKER_POOL] 无法创建工作线程池: {0}")]
    WorkerPool(String),

    #[error("[E_IO] {0}")]
    Io(#[from] std::io::Error),
}

impl P1203Error {
    /// 报告中使用的错误类别名
    pub fn kind(&self) -> &'static str {
        match self {
            P1203Error::InputValidation(_) => "InputValidationError",
            P1203Error::UnsupportedCodec(_) => "UnsupportedCodecError",
            P1203Error::InvalidFrame(_) => "InvalidFrameError",
            P1203Error::NonFiniteScore(_) => "NonFiniteScoreError",
            P1203Error::MissingScores(_) => "MissingScoresError",
            P1203Error::TreeModel(_) => "TreeModelError",
            P1203Error::WorkerPool(_) => "WorkerPoolError",
            P1203Error::Io(_) => "IoError",
        }
    }
}

pub type Result<T> = std::result::Result<T, P1203Error>;

/// 非致命告警码
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WarningCode {
    RepresentationAmbiguity,
    StallingRange,
    StallingZeroDuration,
    InitialLoading,
    SegmentGap,
    FrameCountMismatch,
    NonStandardCodec,
    MissingAudio,
    MissingMetadata,
}

impl WarningCode {
    pub fn as_str(self) -> &'static str {
        match self {
            WarningCode::RepresentationAmbiguity => "W_REPRESENTATION_AMBIGUITY",
            WarningCode::StallingRange => "W_STALLING_RANGE",
            WarningCode::StallingZeroDuration => "W_STALLING_ZERO_DURATION",
            WarningCode::InitialLoading => "W_INITIAL_LOADING",
            WarningCode::SegmentGap => "W_SEGMENT_GAP",
            WarningCode::FrameCountMismatch => "W_FRAME_COUNT_MISMATCH",
            WarningCode::NonStandardCodec => "W_NON_STANDARD_CODEC",
            WarningCode::MissingAudio => "W_MISSING_AUDIO",
            WarningCode::MissingMetadata => "W_MISSING_METADATA",
        }
    }
}

/// 单个输入在计算过程中累积的告警。
///
/// 每条告警同时写入 tracing 日志；最终报告只保留去重后的告警码。
#[derive(Debug, Default, Clone)]
pub struct Warnings {
    codes: Vec<WarningCode>,
}

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, code: WarningCode, message: impl AsRef<str>) {
        warn!(code = code.as_str(), "{}", message.as_ref());
        self.codes.push(code);
    }

    #[cfg(test)]
    pub fn contains(&self, code: WarningCode) -> bool {
        self.codes.contains(&code)
    }

    pub fn merge(&mut self, other: Warnings) {
        self.codes.extend(other.codes);
    }

    pub fn into_codes(mut self) -> Vec<String> {
        self.codes.sort();
        self.codes.dedup();
        self.codes.iter().map(|c| c.as_str().to_string()).collect()
    }
}
