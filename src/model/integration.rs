// ----------------------------------------------------------------
// 项目: P.1203 视听质量评估 (p1203-rs)
// 模块: model/integration.rs
// 描述: 集成模型。
//      O.21 + O.22 → 逐秒视听质量 O.34 → 时间池化 O.35；
//      卡顿事件 → O.23；最终分数 O.46 = 0.75 * MOS + 0.25 * RF。
// ----------------------------------------------------------------

use std::sync::Arc;
use tracing::debug;

use super::config::Amendments;
use super::errors::{P1203Error, Result, WarningCode, Warnings};
use super::forest::{RandomForest, FEATURE_COUNT};
use super::input::{Device, StallingEvent};
use super::mos::{bounded_score, constrain, exponential, percentile, round_to, SCORE_MAX, SCORE_MIN};
use super::video::handheld_compensation;

/// 缺少音频时假定的 O.21
const ASSUMED_AUDIO_SCORE: f64 = 5.0;

// O.34 = av1 + av2*a + av3*v + av4*a*v
const AV: [f64; 4] = [-0.00069084, 0.15374283, 0.97153861, 0.02461776];

// 池化权重 w1 = t1 + t2*exp((t/N)/t3)，w2 = t4 - t5*O34
const T: [f64; 5] = [
    0.00666620027943848,
    0.0000404018840273729,
    0.156497800436237,
    0.143179744942738,
    0.0238641564518876,
];

// 负偏差
const NEG_BIAS_HALF_LIFE: (f64, f64) = (1.87403625, 7.85416481);
const NEG_BIAS_SCALE: f64 = 0.01853820;
const NEG_BIAS_PERCENTILE: f64 = 10.0;

// 卡顿影响
const STALL_WEIGHT: (f64, f64) = (0.48412879, 10.0);
const S: [f64; 3] = [9.35158684, 0.91890815, 11.0567558];

// 振荡与适应补偿
const OSC: (f64, f64) = (0.67756080, -8.05533303);
const OSC_MAX: f64 = 1.5;
const ADAPT: (f64, f64) = (0.17332553, -0.01035647);
const ADAPT_MAX: f64 = 0.5;
const STEADY_RATIO_LIMIT: f64 = 0.25;
const OSC_LONGEST_LIMIT: f64 = 30.0;

const QUALITY_CHANGE_THRESHOLD: f64 = 0.2;
const MA_ORDER: usize = 5;
const QC_STEP: usize = 3;

/// 简化 O.46 线性映射
const APP2_O46: (f64, f64) = (0.02833052, 0.98117059);

const MOS_WEIGHT: f64 = 0.75;
const RF_WEIGHT: f64 = 0.25;

/// 起播缓冲在随机森林特征中按三分之一计入
const INITIAL_LOADING_FACTOR: f64 = 3.0;

const SCORE_DECIMALS: i32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationOutput {
    pub o23: f64,
    pub o34: Vec<f64>,
    pub o35: f64,
    pub o46: f64,
}

/// 视频质量变化特征
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityChangeFeatures {
    pub spread: f64,
    pub change_rate: f64,
    /// 质量方向不变的最长时段（秒）
    pub longest_period: f64,
    pub direction_changes: usize,
}

impl QualityChangeFeatures {
    pub fn from_scores(o22: &[f64]) -> Self {
        let duration = o22.len();
        let (min, max) = o22
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let spread = if duration == 0 { 0.0 } else { max - min };

        let changes = o22
            .windows(2)
            .filter(|w| (w[1] - w[0]).abs() > QUALITY_CHANGE_THRESHOLD)
            .count();
        let change_rate = if duration == 0 {
            0.0
        } else {
            changes as f64 / duration as f64
        };

        let qc = direction_changes(&moving_average(o22));
        let longest_period = longest_constant_period(&qc) as f64 * QC_STEP as f64;

        let mut runs = 0;
        let mut previous = 0;
        for &v in qc.iter().filter(|&&v| v != 0) {
            if v != previous {
                runs += 1;
                previous = v;
            }
        }

        Self {
            spread,
            change_rate,
            longest_period,
            direction_changes: runs,
        }
    }
}

/// 5 点滑动平均，两端各用首尾值填充 4 个点；输出长度为 n + 4
pub fn moving_average(values: &[f64]) -> Vec<f64> {
    let (Some(&first), Some(&last)) = (values.first(), values.last()) else {
        return Vec::new();
    };
    let pad = MA_ORDER - 1;
    let mut padded = Vec::with_capacity(values.len() + 2 * pad);
    padded.extend(std::iter::repeat(first).take(pad));
    padded.extend_from_slice(values);
    padded.extend(std::iter::repeat(last).take(pad));

    padded
        .windows(MA_ORDER)
        .map(|w| w.iter().sum::<f64>() / MA_ORDER as f64)
        .collect()
}

/// 每 3 秒比较一次平滑后的质量：上升超过阈值为 1，落在开区间 (-0.2, 0.2) 内为 0，
/// 其余为 -1（差值恰好等于 ±0.2 都记为 -1）
pub fn direction_changes(ma: &[f64]) -> Vec<i8> {
    ma.iter()
        .step_by(QC_STEP)
        .zip(ma.iter().skip(QC_STEP).step_by(QC_STEP))
        .map(|(current, next)| {
            let diff = next - current;
            if diff > QUALITY_CHANGE_THRESHOLD {
                1
            } else if diff > -QUALITY_CHANGE_THRESHOLD && diff < QUALITY_CHANGE_THRESHOLD {
                0
            } else {
                -1
            }
        })
        .collect()
}

/// 方向变化之间最长的间隔（以 QC 采样点计）
fn longest_constant_period(qc: &[i8]) -> usize {
    let mut marks: Vec<(usize, i8)> = Vec::new();
    for (index, &value) in qc.iter().enumerate() {
        if value != 0 && marks.last().map_or(true, |&(_, v)| v != value) {
            marks.push((index, value));
        }
    }
    if marks.is_empty() {
        return qc.len();
    }
    marks.insert(0, (0, 0));
    marks.push((qc.len(), 0));
    marks.windows(2).map(|w| w[1].0 - w[0].0).max().unwrap_or(0)
}

/// 按秒分摊的卡顿统计
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StallingStats {
    pub count: usize,
    /// 越靠近结尾权重越高的总卡顿时长
    pub weighted_length: f64,
    pub average_interval: f64,
}

/// 卡顿事件预处理：负位置截断到 0；最早事件不在 0 时整体前移到 0；
/// 再丢弃零时长与越界事件，按位置排序。
/// 位置 0 处的零时长事件只用来固定起点，不参与计算。
pub fn filter_stalling(events: &[StallingEvent], duration: usize, warnings: &mut Warnings) -> Vec<StallingEvent> {
    let media_end = duration as f64;

    let mut positioned = Vec::with_capacity(events.len());
    for event in events {
        if !event.start.is_finite() {
            warnings.push(
                WarningCode::StallingRange,
                format!("忽略位置 {} 处的卡顿事件，位置不是有限数值", event.start),
            );
            continue;
        }
        let start = if event.start < 0.0 {
            warnings.push(
                WarningCode::StallingRange,
                format!("卡顿事件位置 {} 为负，截断到 0", event.start),
            );
            0.0
        } else {
            event.start
        };
        positioned.push(StallingEvent {
            start,
            duration: event.duration,
        });
    }
    positioned.sort_by(|a, b| a.start.total_cmp(&b.start));

    let offset = positioned.first().map_or(0.0, |e| e.start);
    if offset > 0.0 {
        warnings.push(
            WarningCode::StallingRange,
            format!("首个卡顿事件位于 {offset}，所有卡顿位置前移 {offset} 秒"),
        );
    }

    let mut kept = Vec::with_capacity(positioned.len());
    for event in positioned {
        let start = event.start - offset;
        if !event.duration.is_finite() || event.duration <= 0.0 {
            warnings.push(
                WarningCode::StallingZeroDuration,
                format!("忽略位置 {start} 处时长为 {} 的卡顿事件", event.duration),
            );
            continue;
        }
        if start > media_end {
            warnings.push(
                WarningCode::StallingRange,
                format!("忽略位置 {start} 处的卡顿事件，超出媒体范围 (0, {media_end})"),
            );
            continue;
        }
        if start == 0.0 {
            warnings.push(WarningCode::InitialLoading, "位置 0 处的卡顿事件视为起播缓冲");
        }
        kept.push(StallingEvent {
            start,
            duration: event.duration,
        });
    }
    kept
}

pub fn stalling_stats(events: &[StallingEvent], duration: usize, amendments: Amendments) -> StallingStats {
    let n = duration as f64;
    let (c7, c8) = STALL_WEIGHT;
    let weight = |start: f64| exponential(1.0, c7, 0.0, c8, n - start);

    let (initial, rest): (Vec<_>, Vec<_>) = if amendments.stalling {
        events.iter().partition(|e| e.start == 0.0)
    } else {
        (Vec::new(), events.iter().collect())
    };

    let weighted_length = rest.iter().map(|e| e.duration * weight(e.start)).sum::<f64>()
        + initial
            .iter()
            .map(|e| e.duration / INITIAL_LOADING_FACTOR * weight(e.start))
            .sum::<f64>();

    let average_interval = if rest.len() > 1 {
        rest.windows(2).map(|w| w[1].start - w[0].start).sum::<f64>() / (rest.len() - 1) as f64
    } else {
        0.0
    };

    StallingStats {
        count: rest.len(),
        weighted_length,
        average_interval,
    }
}

fn stalling_impact(count: f64, length: f64, interval: f64, duration: f64) -> f64 {
    let [s1, s2, s3] = S;
    (-count / s1).exp() * (-length / duration / s2).exp() * (-interval / duration / s3).exp()
}

/// 随机森林特征中的分段平均 MOS
pub fn scale_moses(sec_mos: &[f64], num_splits: usize) -> Vec<f64> {
    let split = sec_mos.len() as f64 / num_splits as f64;
    let mut samples = Vec::with_capacity(num_splits);
    let mut previous_mos = 0.0;
    let mut previous_time = 0.0;

    for &mos in sec_mos {
        if previous_time + 1.0 >= split {
            samples.push((previous_time * previous_mos + (split - previous_time) * mos) / split);
            previous_mos = mos;
            previous_time = previous_time + 1.0 - split;
        } else {
            previous_mos = (previous_mos * previous_time + mos) / (previous_time + 1.0);
            previous_time += 1.0;
        }
    }
    samples.resize(num_splits, previous_mos);
    samples
}

/// 14 维随机森林特征
pub fn forest_features(o21: &[f64], o22: &[f64], stalling: &[StallingEvent], duration: usize) -> [f64; FEATURE_COUNT] {
    let n = duration as f64;
    let initial = stalling
        .first()
        .filter(|e| e.start == 0.0)
        .map_or(0.0, |e| e.duration);

    let rebuffering: Vec<&StallingEvent> = stalling.iter().filter(|e| e.start != 0.0).collect();
    let mut stats = match rebuffering.last() {
        None => [0.0, 0.0, 0.0, 0.0, n],
        Some(last) => {
            let count = rebuffering.len() as f64;
            let length: f64 = rebuffering.iter().map(|e| e.duration).sum();
            [count, length, count / n, length / n, n - last.start]
        }
    };
    stats[1] += initial / INITIAL_LOADING_FACTOR;
    stats[3] += initial / n / INITIAL_LOADING_FACTOR;

    let video: Vec<f64> = o22.iter().map(|&v| round_to(v, SCORE_DECIMALS)).collect();
    let audio: Vec<f64> = o21.iter().map(|&v| round_to(v, SCORE_DECIMALS)).collect();
    let video_samples = scale_moses(&video, 3);
    let audio_samples = scale_moses(&audio, 2);
    let percentiles = [1.0, 5.0, 10.0].map(|p| percentile(&video, p).unwrap_or(SCORE_MIN));

    let mut features = [0.0; FEATURE_COUNT];
    features[..5].copy_from_slice(&stats);
    features[5..8].copy_from_slice(&video_samples);
    features[8..11].copy_from_slice(&percentiles);
    features[11..13].copy_from_slice(&audio_samples);
    features[13] = n;
    features
}

/// 集成模型
#[derive(Debug, Clone)]
pub struct IntegrationModel {
    device: Device,
    amendments: Amendments,
    forest: Option<Arc<RandomForest>>,
}

impl IntegrationModel {
    pub fn new(device: Device, amendments: Amendments, forest: Option<Arc<RandomForest>>) -> Self {
        Self {
            device,
            amendments,
            forest,
        }
    }

    pub fn calculate(
        &self,
        o21: &[f64],
        o22: &[f64],
        stalling: &[StallingEvent],
        warnings: &mut Warnings,
    ) -> Result<IntegrationOutput> {
        if o22.is_empty() {
            return Err(P1203Error::MissingScores(
                "O.22 为空，没有视频时无法计算集成模型".to_string(),
            ));
        }

        let video: Vec<f64> = if self.device.is_handheld() {
            o22.iter().map(|&v| handheld_compensation(v)).collect()
        } else {
            o22.to_vec()
        };

        let has_audio = !o21.is_empty();
        let duration = if has_audio { o21.len().min(video.len()) } else { video.len() };
        let audio: Vec<f64> = if has_audio {
            o21[..duration].to_vec()
        } else {
            warnings.push(WarningCode::MissingAudio, "没有 O.21 分数，假定音频质量恒定为最高");
            vec![ASSUMED_AUDIO_SCORE; duration]
        };
        let video = &video[..duration];
        let n = duration as f64;

        let stalling = filter_stalling(stalling, duration, warnings);
        let stats = stalling_stats(&stalling, duration, self.amendments);
        let impact = stalling_impact(stats.count as f64, stats.weighted_length, stats.average_interval, n);
        let o23 = bounded_score("O23", 1.0 + 4.0 * impact)?;

        // 逐秒视听质量
        let [av1, av2, av3, av4] = AV;
        let o34: Vec<f64> = if !has_audio && self.amendments.audiovisual {
            video.iter().map(|&v| constrain(v, SCORE_MIN, SCORE_MAX)).collect()
        } else {
            audio
                .iter()
                .zip(video)
                .map(|(&a, &v)| constrain(av1 + av2 * a + av3 * v + av4 * a * v, SCORE_MIN, SCORE_MAX))
                .collect()
        };

        // 时间池化
        let [t1, t2, t3, t4, t5] = T;
        let (mut numerator, mut denominator) = (0.0, 0.0);
        for (t, &score) in o34.iter().enumerate() {
            let w1 = t1 + t2 * ((t as f64 / n) / t3).exp();
            let w2 = t4 - t5 * score;
            numerator += w1 * w2 * score;
            denominator += w1 * w2;
        }
        let baseline = numerator / denominator;

        let (c1, c2) = NEG_BIAS_HALF_LIFE;
        let diffs: Vec<f64> = o34
            .iter()
            .enumerate()
            .map(|(i, &score)| (score - baseline) * exponential(1.0, c1, 0.0, c2, n - i as f64 - 1.0))
            .collect();
        let neg_percentile = percentile(&diffs, NEG_BIAS_PERCENTILE).unwrap_or(0.0);
        let negative_bias = (-neg_percentile).max(0.0) * NEG_BIAS_SCALE;

        let features = QualityChangeFeatures::from_scores(video);
        let steady_ratio = features.longest_period / n;

        let mut oscillation = 0.0;
        if steady_ratio < STEADY_RATIO_LIMIT && features.longest_period < OSC_LONGEST_LIMIT {
            let (comp1, comp2) = OSC;
            let q_diff = (1.0 + (features.spread + 0.001).log10()).max(0.0);
            oscillation = constrain(
                q_diff * (comp1 * features.direction_changes as f64 + comp2).exp(),
                0.0,
                OSC_MAX,
            );
        }

        let mut adaptation = 0.0;
        if steady_ratio < STEADY_RATIO_LIMIT {
            let (comp3, comp4) = ADAPT;
            adaptation = constrain(comp3 * features.spread * features.change_rate + comp4, 0.0, ADAPT_MAX);
        }

        let o35_raw = baseline - negative_bias - oscillation - adaptation;
        let mos = 1.0 + (o35_raw - 1.0) * impact;
        let mos_clamped = bounded_score("MOS", mos)?;

        let o46 = if self.amendments.app_2 {
            let (a, b) = APP2_O46;
            a + b * mos_clamped
        } else {
            let rf = match &self.forest {
                Some(forest) => forest.predict(&forest_features(&audio, video, &stalling, duration))?,
                None => mos_clamped,
            };
            MOS_WEIGHT * mos_clamped + RF_WEIGHT * rf
        };

        debug!(
            duration,
            stalls = stats.count,
            baseline,
            negative_bias,
            oscillation,
            adaptation,
            "集成模型中间量"
        );

        Ok(IntegrationOutput {
            o23,
            o34: local_stalling_penalty(&o34, &stalling, n)?,
            o35: bounded_score("O35", o35_raw)?,
            o46: bounded_score("O46", o46)?,
        })
    }
}

/// 报告中的 O.34 按所在秒内发生的卡顿再做一次衰减；池化使用未衰减的序列
fn local_stalling_penalty(o34: &[f64], stalling: &[StallingEvent], duration: f64) -> Result<Vec<f64>> {
    let last = o34.len().saturating_sub(1);
    let mut per_second = vec![(0usize, 0.0f64); o34.len()];
    for event in stalling {
        let second = (event.start.floor() as usize).min(last);
        per_second[second].0 += 1;
        per_second[second].1 += event.duration;
    }

    o34.iter()
        .zip(&per_second)
        .map(|(&score, &(count, length))| {
            let impact = stalling_impact(count as f64, length, 0.0, duration);
            bounded_score("O34", 1.0 + (score - 1.0) * impact)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLAT_VIDEO: f64 = 3.6483510306472993;

    fn pc_model() -> IntegrationModel {
        IntegrationModel::new(Device::Pc, Amendments::default(), None)
    }

    fn stall(start: f64, duration: f64) -> StallingEvent {
        StallingEvent { start, duration }
    }

    #[test]
    fn test_video_only_reference_session() {
        let mut warnings = Warnings::new();
        let output = pc_model()
            .calculate(&[], &[FLAT_VIDEO; 30], &[], &mut warnings)
            .unwrap();

        assert!(warnings.contains(WarningCode::MissingAudio));
        assert_eq!(output.o34.len(), 30);
        for score in &output.o34 {
            assert!((score - 4.761608349448284).abs() < 1e-9);
        }
        assert!((output.o35 - 4.761608349448285).abs() < 1e-6);
        assert!((output.o46 - 4.761608349448285).abs() < 1e-6);
        assert_eq!(output.o23, 5.0);
    }

    #[test]
    fn test_single_stall_lowers_o23() {
        let o21 = [4.530628420914144; 60];
        let o22 = [4.0; 60];
        let model = pc_model();

        let mut warnings = Warnings::new();
        let clean = model.calculate(&o21, &o22, &[], &mut warnings).unwrap();
        // 位置 0 的零时长事件固定起点，避免整体前移
        let stalled = model
            .calculate(&o21, &o22, &[stall(0.0, 0.0), stall(10.0, 2.0)], &mut warnings)
            .unwrap();

        assert_eq!(clean.o23, 5.0);
        assert!((stalled.o23 - 4.52970433658424).abs() < 1e-9);
        assert!(stalled.o46 < clean.o46);
        assert!(stalled.o34[10] < clean.o34[10]);
        assert_eq!(stalled.o34[11], clean.o34[11]);
    }

    #[test]
    fn test_zero_duration_stall_has_no_effect() {
        let o22 = [3.5; 40];
        let model = pc_model();
        let mut warnings = Warnings::new();

        let base = model.calculate(&[], &o22, &[stall(5.0, 1.0)], &mut warnings).unwrap();
        let with_zero = model
            .calculate(&[], &o22, &[stall(5.0, 1.0), stall(20.0, 0.0)], &mut warnings)
            .unwrap();

        assert_eq!(base, with_zero);
        assert!(warnings.contains(WarningCode::StallingZeroDuration));
    }

    #[test]
    fn test_stalling_filter_rules() {
        let mut warnings = Warnings::new();
        let events = [stall(50.0, 1.0), stall(-2.0, 1.0), stall(12.0, 3.0), stall(5.0, 1.0)];
        let kept = filter_stalling(&events, 30, &mut warnings);

        assert_eq!(kept, vec![stall(0.0, 1.0), stall(5.0, 1.0), stall(12.0, 3.0)]);
        assert!(warnings.contains(WarningCode::StallingRange));
        assert!(warnings.contains(WarningCode::InitialLoading));
    }

    #[test]
    fn test_first_stall_is_shifted_to_start() {
        let mut warnings = Warnings::new();
        let kept = filter_stalling(&[stall(12.0, 1.0), stall(5.0, 1.5)], 30, &mut warnings);
        assert_eq!(kept, vec![stall(0.0, 1.5), stall(7.0, 1.0)]);
        assert!(warnings.contains(WarningCode::StallingRange));
        assert!(warnings.contains(WarningCode::InitialLoading));

        let mut warnings = Warnings::new();
        let anchored = filter_stalling(&[stall(0.0, 0.0), stall(5.0, 1.5)], 30, &mut warnings);
        assert_eq!(anchored, vec![stall(5.0, 1.5)]);
        assert!(!warnings.contains(WarningCode::InitialLoading));
    }

    #[test]
    fn test_late_first_stall_counts_as_initial_loading() {
        let o22 = [3.5; 30];
        let model = IntegrationModel::new(
            Device::Pc,
            Amendments {
                stalling: true,
                ..Amendments::default()
            },
            None,
        );
        let mut warnings = Warnings::new();
        let late = model.calculate(&[], &o22, &[stall(5.0, 1.5)], &mut warnings).unwrap();
        let initial = model.calculate(&[], &o22, &[stall(0.0, 1.5)], &mut warnings).unwrap();
        assert_eq!(late, initial);
    }

    #[test]
    fn test_stalling_amendment_discounts_initial_loading() {
        let events = [stall(0.0, 3.0), stall(10.0, 1.0), stall(20.0, 1.0)];
        let plain = stalling_stats(&events, 30, Amendments::default());
        let amended = stalling_stats(
            &events,
            30,
            Amendments {
                stalling: true,
                ..Amendments::default()
            },
        );

        assert_eq!(plain.count, 3);
        assert_eq!(amended.count, 2);
        assert_eq!(amended.average_interval, 10.0);
        assert!(amended.weighted_length < plain.weighted_length);
    }

    #[test]
    fn test_pooling_is_order_sensitive() {
        let rising: Vec<f64> = (0..30).map(|i| 2.0 + i as f64 * 0.1).collect();
        let falling: Vec<f64> = rising.iter().rev().copied().collect();
        let model = pc_model();
        let mut warnings = Warnings::new();

        let up = model.calculate(&[], &rising, &[], &mut warnings).unwrap();
        let down = model.calculate(&[], &falling, &[], &mut warnings).unwrap();
        assert!(up.o35 > down.o35);
    }

    #[test]
    fn test_scores_stay_in_range() {
        let o21 = [1.0, 5.0, 1.0, 5.0, 1.0, 5.0, 1.0, 5.0, 1.0, 5.0];
        let o22 = [5.0, 1.0, 5.0, 1.0, 5.0, 1.0, 5.0, 1.0, 5.0, 1.0];
        let model = IntegrationModel::new(Device::Mobile, Amendments::default(), None);
        let mut warnings = Warnings::new();
        let output = model
            .calculate(&o21, &o22, &[stall(0.0, 30.0), stall(3.0, 100.0)], &mut warnings)
            .unwrap();

        for value in output.o34.iter().chain([output.o23, output.o35, output.o46].iter()) {
            assert!((SCORE_MIN..=SCORE_MAX).contains(value), "{value} out of range");
        }
    }

    #[test]
    fn test_missing_video_is_error() {
        let mut warnings = Warnings::new();
        let err = pc_model().calculate(&[4.0; 10], &[], &[], &mut warnings).unwrap_err();
        assert!(matches!(err, P1203Error::MissingScores(_)));
    }

    #[test]
    fn test_audiovisual_amendment_uses_video_directly() {
        let model = IntegrationModel::new(
            Device::Pc,
            Amendments {
                audiovisual: true,
                ..Amendments::default()
            },
            None,
        );
        let mut warnings = Warnings::new();
        let output = model.calculate(&[], &[3.0; 20], &[], &mut warnings).unwrap();
        assert!(output.o34.iter().all(|&v| v == 3.0));
    }

    #[test]
    fn test_app2_amendment_is_linear() {
        let model = IntegrationModel::new(
            Device::Pc,
            Amendments {
                app_2: true,
                ..Amendments::default()
            },
            None,
        );
        let mut warnings = Warnings::new();
        let output = model.calculate(&[], &[FLAT_VIDEO; 30], &[], &mut warnings).unwrap();
        let expected = 0.02833052 + 0.98117059 * 4.761608349448285;
        assert!((output.o46 - expected).abs() < 1e-6);
    }

    #[test]
    fn test_forest_term_blends_into_o46() {
        use crate::model::forest::DecisionTree;

        // 特征 0（中途卡顿次数）< 0.5 时输出 3.0，否则 1.0
        let stump = DecisionTree::from_reader("0,0,0.5,1,2\n1,-1,3.0,-1,-1\n2,-1,1.0,-1,-1\n".as_bytes(), "stump")
            .unwrap();
        let forest = Arc::new(RandomForest::new(vec![stump]).unwrap());
        let with_forest = IntegrationModel::new(Device::Pc, Amendments::default(), Some(forest));
        let without = pc_model();

        let o22 = [FLAT_VIDEO; 30];
        let stalls = [stall(0.0, 0.0), stall(10.0, 2.0)];
        for (events, rf) in [(&[][..], 3.0), (&stalls[..], 1.0)] {
            let mut warnings = Warnings::new();
            let base = without.calculate(&[], &o22, events, &mut warnings).unwrap();
            let blended = with_forest.calculate(&[], &o22, events, &mut warnings).unwrap();

            // 无森林时 O.46 即截断后的 MOS
            let expected = 0.75 * base.o46 + 0.25 * rf;
            assert!((blended.o46 - expected).abs() < 1e-9, "{} != {expected}", blended.o46);
            assert_eq!(blended.o23, base.o23);
        }
    }

    #[test]
    fn test_quality_change_features() {
        let flat = QualityChangeFeatures::from_scores(&[3.0; 30]);
        assert_eq!(flat.spread, 0.0);
        assert_eq!(flat.change_rate, 0.0);
        assert_eq!(flat.direction_changes, 0);

        let mut switching = vec![2.0; 10];
        switching.extend(vec![4.0; 10]);
        switching.extend(vec![2.0; 10]);
        let features = QualityChangeFeatures::from_scores(&switching);
        assert_eq!(features.spread, 2.0);
        assert!((features.change_rate - 2.0 / 30.0).abs() < 1e-12);
        assert_eq!(features.direction_changes, 2);
    }

    #[test]
    fn test_direction_change_threshold_edges() {
        // 只比较第 0 与第 3 个点
        assert_eq!(direction_changes(&[0.0, 9.0, 9.0, 0.3]), vec![1]);
        assert_eq!(direction_changes(&[0.0, 9.0, 9.0, 0.1]), vec![0]);
        assert_eq!(direction_changes(&[0.1, 9.0, 9.0, 0.0]), vec![0]);
        assert_eq!(direction_changes(&[0.0, 9.0, 9.0, 0.2]), vec![-1]);
        assert_eq!(direction_changes(&[0.2, 9.0, 9.0, 0.0]), vec![-1]);
        assert_eq!(direction_changes(&[0.3, 9.0, 9.0, 0.0]), vec![-1]);
    }

    #[test]
    fn test_moving_average_shape() {
        let ma = moving_average(&[1.0, 2.0, 3.0]);
        assert_eq!(ma.len(), 7);
        assert!((ma[0] - 1.0).abs() < 1e-12);
        assert!((ma[6] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_scale_moses() {
        assert_eq!(scale_moses(&[1.0, 2.0, 3.0], 3), vec![1.0, 2.0, 3.0]);
        let halves = scale_moses(&[2.0, 2.0, 4.0, 4.0], 2);
        assert_eq!(halves, vec![2.0, 4.0]);
        assert_eq!(scale_moses(&[3.0], 3).len(), 3);
    }

    #[test]
    fn test_forest_features_layout() {
        let o22 = [3.0; 30];
        let o21 = [4.0; 30];
        let events = [stall(0.0, 3.0), stall(10.0, 2.0)];
        let features = forest_features(&o21, &o22, &events, 30);

        assert_eq!(features[0], 1.0);
        assert_eq!(features[1], 3.0);
        assert_eq!(features[4], 20.0);
        assert_eq!(&features[5..11], &[3.0; 6]);
        assert_eq!(&features[11..13], &[4.0; 2]);
        assert_eq!(features[13], 30.0);
    }
}
