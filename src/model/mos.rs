use lazy_static::lazy_static;

use super::errors::{P1203Error, Result};

pub const MOS_MAX: f64 = 4.9;
pub const MOS_MIN: f64 = 1.05;

/// 所有对外输出分数的取值范围
pub const SCORE_MIN: f64 = 1.0;
pub const SCORE_MAX: f64 = 5.0;

lazy_static! {
    /// R→MOS 曲线的采样表 (MOS, R)，用于反向插值。
    /// R = 0 之后直接从 3.25 开始，因为曲线在 [0, 3.25) 区间内不单调。
    static ref R_FROM_MOS_TABLE: Vec<(f64, f64)> = {
        let mut table = vec![(MOS_MIN, 0.0)];
        let mut step = 13;
        while step <= 400 {
            let r = step as f64 * 0.25;
            table.push((mos_from_r_unclamped(r), r));
            step += 1;
        }
        table
    };
}

fn mos_from_r_unclamped(q: f64) -> f64 {
    MOS_MIN + (MOS_MAX - MOS_MIN) * q / 100.0 + q * (q - 60.0) * (100.0 - q) * 0.000007
}

/// 将 0-100 的 R 值映射为 MOS，范围外的 R 先截断
pub fn mos_from_r(q: f64) -> f64 {
    mos_from_r_unclamped(constrain(q, 0.0, 100.0)).clamp(MOS_MIN, MOS_MAX)
}

/// [`mos_from_r`] 的反函数，采样表上分段线性插值
pub fn r_from_mos(mos: f64) -> f64 {
    let mos = mos.clamp(MOS_MIN, MOS_MAX);
    let table = &*R_FROM_MOS_TABLE;

    let upper = table.partition_point(|&(key, _)| key < mos);
    if upper == 0 {
        return table[0].1;
    }
    if upper >= table.len() {
        return table[table.len() - 1].1;
    }

    let (k1, v1) = table[upper];
    if k1 == mos {
        return v1;
    }
    let (k0, v0) = table[upper - 1];
    v0 + (v1 - v0) * (mos - k0) / (k1 - k0)
}

pub fn constrain(x: f64, min: f64, max: f64) -> f64 {
    x.min(max).max(min)
}

/// 两端饱和的 S 型曲线
pub fn sigmoid(min_y: f64, max_y: f64, sat_bottom: f64, sat_top: f64, x: f64) -> f64 {
    let scaled_x = 10.0 / (sat_top - sat_bottom);
    let middle_x = (sat_bottom + sat_top) / 2.0;
    min_y + (max_y - min_y) / (1.0 + (-scaled_x * (x - middle_x)).exp())
}

/// 指数衰减曲线：x = c 时取 a，x 增大时趋近 b，d 为半衰点
pub fn exponential(a: f64, b: f64, c: f64, d: f64, x: f64) -> f64 {
    b + (a - b) * (-(x - c) * 0.5_f64.ln() / (-(d - c))).exp()
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// 线性插值百分位数（与常见数值库默认行为一致）
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (sorted.len() - 1) as f64 * pct / 100.0;
    let lower = rank.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64))
}

/// 按小数位四舍五入
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

pub fn ensure_finite(label: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(P1203Error::NonFiniteScore(label))
    }
}

/// 校验并截断到 [1, 5]
pub fn bounded_score(label: &'static str, value: f64) -> Result<f64> {
    ensure_finite(label, value).map(|v| constrain(v, SCORE_MIN, SCORE_MAX))
}
