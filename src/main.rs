// ================================================================
// 项目: P.1203 视听质量评估 (p1203-rs)
// 文件: src/main.rs
// 描述: 命令行入口，负责参数解析、输入收集、批量评估和报告输出
//
// 功能概述:
// - 接受 JSON 输入文件、目录（递归查找 *.json）或标准输入
// - 在固定大小的线程池中逐输入评估 Pa / Pv / Pq
// - JSON 报告写到 stdout 或原子写入指定文件，日志与进度写到 stderr
// ================================================================

mod model;

use crate::model::{
    config::{Amendments, EvaluationConfig, ModePolicy, Restriction, DEFAULT_WORKERS},
    forest::RandomForest,
    input::{InputReport, Mode},
    orchestrator::{BatchInput, Orchestrator},
    report::ReportGenerator,
};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// 输入文件扩展名
const INPUT_EXTENSION: &str = "json";

/// 从标准输入读取的输入路径写法
const STDIN_PATH: &str = "-";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "ITU-T P.1203 流媒体会话视听质量评估工具",
    long_about = "读取描述音视频片段与卡顿事件的 JSON 输入，按 P.1203 模型计算每秒质量分数 (O.34)、会话分数 (O.35) 与最终分数 (O.46)。JSON 报告输出到标准输出，日志输出到标准错误。"
)]
struct Cli {
    /// 输入 JSON 文件或目录，"-" 表示标准输入
    #[arg(value_name = "INPUT", required = true)]
    inputs: Vec<PathBuf>,

    /// 强制使用指定评估模式 (0-3)，默认取所有片段共同支持的最低模式
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=3))]
    mode: Option<u8>,

    /// 只计算音频质量 (O.21)
    #[arg(long, conflicts_with = "only_pv")]
    only_pa: bool,

    /// 只计算视频质量 (O.22)
    #[arg(long)]
    only_pv: bool,

    /// 在报告中附带 O.21 / O.22
    #[arg(long)]
    print_intermediate: bool,

    /// 工作线程数
    #[arg(short = 'j', long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// 没有音频时直接使用视频分数作为 O.34
    #[arg(long = "amendment-1-audiovisual")]
    amendment_audiovisual: bool,

    /// 起播缓冲按三分之一计入卡顿特征
    #[arg(long = "amendment-1-stalling")]
    amendment_stalling: bool,

    /// 使用线性简化的 O.46
    #[arg(long = "amendment-1-app-2")]
    amendment_app_2: bool,

    /// 随机森林决策树目录 (tree*.csv)
    #[arg(long, value_name = "DIR")]
    trees: Option<PathBuf>,

    /// JSON 报告输出文件（原子写入）
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// CSV 摘要输出文件
    #[arg(long, value_name = "FILE")]
    summary_csv: Option<PathBuf>,

    /// 输出调试日志
    #[arg(long, conflicts_with = "quiet")]
    debug: bool,

    /// 只输出错误日志，不显示进度与摘要
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        }
    }

    fn restriction(&self) -> Restriction {
        if self.only_pa {
            Restriction::AudioOnly
        } else if self.only_pv {
            Restriction::VideoOnly
        } else {
            Restriction::Both
        }
    }

    fn to_config(&self) -> Result<EvaluationConfig> {
        let mode_policy = match self.mode {
            Some(value) => ModePolicy::Forced(Mode::from_u8(value)?),
            None => ModePolicy::LowestCommon,
        };

        let forest = match &self.trees {
            Some(dir) => Some(Arc::new(
                RandomForest::load_dir(dir)
                    .with_context(|| format!("无法加载决策树目录: {}", dir.display()))?,
            )),
            None => None,
        };

        Ok(EvaluationConfig {
            mode_policy,
            amendments: Amendments {
                audiovisual: self.amendment_audiovisual,
                stalling: self.amendment_stalling,
                app_2: self.amendment_app_2,
            },
            restriction: self.restriction(),
            print_intermediate: self.print_intermediate,
            workers: self.workers,
            forest,
        })
    }
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// 展开目录并保持参数顺序；目录内按路径排序
fn collect_inputs(paths: &[PathBuf]) -> Result<Vec<BatchInput>> {
    let mut inputs = Vec::new();
    for path in paths {
        if path.as_os_str() == STDIN_PATH {
            inputs.push(read_document("stdin", io::stdin().lock())?);
        } else if path.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(path)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|p| is_input_file(p))
                .collect();
            found.sort();
            debug!(dir = %path.display(), files = found.len(), "目录扫描完成");
            inputs.extend(found.into_iter().map(BatchInput::Path));
        } else if path.exists() {
            inputs.push(BatchInput::Path(path.clone()));
        } else {
            return Err(anyhow!("输入路径不存在: \"{}\"", path.display()));
        }
    }
    Ok(inputs)
}

/// 读取整个 JSON 文档；解析失败属于命令行层错误
fn read_document<R: Read>(id: &str, mut reader: R) -> Result<BatchInput> {
    let mut text = String::new();
    reader
        .read_to_string(&mut text)
        .with_context(|| format!("无法读取输入: {id}"))?;
    let report = InputReport::from_json_str(&text).with_context(|| format!("无法解析输入 JSON: {id}"))?;
    Ok(BatchInput::Document {
        id: id.to_string(),
        report,
    })
}

fn is_input_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(INPUT_EXTENSION))
}

fn progress_bar(total: usize) -> Result<ProgressBar> {
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) - {msg}")
            .context("进度条模板无效")?
            .progress_chars("#>- "),
    );
    Ok(bar)
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let config = cli.to_config()?;
    let orchestrator = Orchestrator::new(config)?;

    let inputs = collect_inputs(&cli.inputs)?;
    if inputs.is_empty() {
        return Err(anyhow!("没有找到任何 *.json 输入文件"));
    }
    info!(inputs = inputs.len(), "开始评估");

    let bar = if inputs.len() > 1 && !cli.quiet {
        Some(progress_bar(inputs.len())?)
    } else {
        None
    };
    let entries = orchestrator.run(&inputs, bar.as_ref())?;
    if let Some(bar) = &bar {
        bar.finish_with_message("评估完成。");
    }

    let generator = ReportGenerator::new();
    match &cli.output {
        Some(path) => generator.write_json(&entries, path)?,
        None => println!("{}", generator.to_json(&entries)?),
    }
    if let Some(path) = &cli.summary_csv {
        generator.generate_csv_summary(&entries, path)?;
    }
    if !cli.quiet && entries.len() > 1 {
        generator.display_summary(&entries);
    }

    if entries.iter().any(|e| e.is_error()) {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_level());
    run(&cli)
}
