use std::sync::Arc;

use super::errors::{P1203Error, Result};
use super::forest::RandomForest;
use super::input::Mode;

/// 默认工作线程数
pub const DEFAULT_WORKERS: usize = 4;

/// 整条视频流的评估模式如何确定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModePolicy {
    /// 所有片段共同支持的最低模式
    #[default]
    LowestCommon,
    /// 指定模式；输入细节不足时报错
    Forced(Mode),
}

/// 可选的修正计算路径
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Amendments {
    /// 缺少音频时 O.34 直接取 O.22
    pub audiovisual: bool,
    /// 起播缓冲不计入卡顿次数与间隔
    pub stalling: bool,
    /// 简化的 O.46 线性映射，不使用随机森林
    pub app_2: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Restriction {
    #[default]
    Both,
    AudioOnly,
    VideoOnly,
}

#[derive(Debug, Clone)]
pub struct EvaluationConfig {
    pub mode_policy: ModePolicy,
    pub amendments: Amendments,
    pub restriction: Restriction,
    /// 报告中附带 O.21 / O.22
    pub print_intermediate: bool,
    pub workers: usize,
    pub forest: Option<Arc<RandomForest>>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            mode_policy: ModePolicy::default(),
            amendments: Amendments::default(),
            restriction: Restriction::default(),
            print_intermediate: false,
            workers: DEFAULT_WORKERS,
            forest: None,
        }
    }
}

impl EvaluationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(P1203Error::WorkerPool(
                "工作线程数必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}
