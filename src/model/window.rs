// ----------------------------------------------------------------
// 项目: P.1203 视听质量评估 (p1203-rs)
// 模块: model/window.rs
// 描述: 滑动测量窗口。
//      帧/采样按解码顺序推入，窗口最多容纳 20 秒内容；
//      每跨过一个整秒边界输出一个分数位置，流结束时补齐剩余位置。
//      表示层切换会开启新的 epoch，窗口计算不会跨越 epoch 边界。
// ----------------------------------------------------------------

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use super::cache::{CacheStats, WindowCache, WindowElement};
use super::errors::{P1203Error, Result};
use super::mos::round_to;

/// 窗口容纳的最长媒体时长（秒）
pub const WINDOW_LENGTH_S: f64 = 20.0;

/// 位置 t 的分数使用以 t 为中心的半窗
const HALF_WINDOW_S: u32 = 10;

/// 累计时长比较前保留的小数位
const EMIT_DECIMALS: i32 = 5;

/// 小数部分超过该值时，流结束位置向上取整
const FINAL_CEIL_THRESHOLD: f64 = 0.99;

/// 推入窗口的一个帧或采样
#[derive(Debug, Clone)]
pub struct Sample<P> {
    /// 解码时间戳（秒）
    pub dts: f64,
    pub duration: f64,
    pub representation: Arc<str>,
    pub payload: P,
    digest: [u8; 32],
    epoch: u64,
}

impl<P> Sample<P> {
    /// `digest` 需覆盖所有影响分数的内容
    pub fn new(dts: f64, duration: f64, representation: Arc<str>, payload: P, digest: [u8; 32]) -> Self {
        Self {
            dts,
            duration,
            representation,
            payload,
            digest,
            epoch: 0,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl<P> WindowElement for Sample<P> {
    fn identity(&self) -> &[u8; 32] {
        &self.digest
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    /// 刚创建或刚因表示层切换而清空
    Empty,
    /// 当前表示层内容不足一个完整窗口
    Filling,
    Steady,
}

/// 单条流独占的可变状态
#[derive(Debug, Clone, Default)]
pub struct MeasurementWindowState {
    /// 窗口内样本的总时长
    pub window_duration: f64,
    /// 已推入的全部样本时长
    pub stream_duration: f64,
    /// 最近一次输出的位置，0 表示尚未输出
    pub last_emitted: u32,
    pub last_identity: Option<Arc<str>>,
    pub epoch: u64,
    /// 当前 epoch 内累计的时长
    pub run_duration: f64,
    pub finished: bool,
    pub final_position: u32,
}

#[derive(Debug)]
pub struct MeasurementWindow<P> {
    frames: VecDeque<Sample<P>>,
    state: MeasurementWindowState,
    cache: WindowCache<f64>,
}

impl<P> Default for MeasurementWindow<P> {
    fn default() -> Self {
        Self {
            frames: VecDeque::new(),
            state: MeasurementWindowState::default(),
            cache: WindowCache::new(),
        }
    }
}

impl<P> MeasurementWindow<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &MeasurementWindowState {
        &self.state
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn phase(&self) -> WindowPhase {
        if self.state.run_duration <= 0.0 {
            WindowPhase::Empty
        } else if self.state.run_duration < WINDOW_LENGTH_S {
            WindowPhase::Filling
        } else {
            WindowPhase::Steady
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// 推入一个样本。若本次推入跨过了输出边界，返回需要计算分数的位置。
    pub fn add_frame(&mut self, mut sample: Sample<P>) -> Result<Option<u32>> {
        if self.state.finished {
            return Err(P1203Error::InputValidation(
                "测量窗口已结束，不能再推入样本".to_string(),
            ));
        }
        if !sample.duration.is_finite() || sample.duration <= 0.0 {
            return Err(P1203Error::InvalidFrame(format!(
                "dts={} 的样本时长非法: {}",
                sample.dts, sample.duration
            )));
        }

        let switched = self
            .state
            .last_identity
            .as_ref()
            .is_some_and(|last| *last != sample.representation);
        if switched {
            self.flush();
        }
        self.state.last_identity = Some(Arc::clone(&sample.representation));

        while !self.frames.is_empty()
            && self.state.window_duration + sample.duration > WINDOW_LENGTH_S
        {
            if let Some(removed) = self.frames.pop_front() {
                self.state.window_duration -= removed.duration;
            }
        }

        sample.epoch = self.state.epoch;
        self.state.window_duration += sample.duration;
        self.state.stream_duration += sample.duration;
        self.state.run_duration += sample.duration;
        self.frames.push_back(sample);

        let next = self.state.last_emitted + 1;
        if self.should_emit(next) {
            self.state.last_emitted = next;
            return Ok(Some(next));
        }
        Ok(None)
    }

    /// 表示层切换：开启新 epoch，之前的样本不再参与新表示层的窗口
    fn flush(&mut self) {
        let previous = self.phase();
        self.state.epoch += 1;
        self.state.run_duration = 0.0;
        debug!(
            epoch = self.state.epoch,
            previous = ?previous,
            at = self.state.stream_duration,
            "表示层切换，测量窗口重置"
        );
    }

    /// 位置 `position` 的分数现在是否可以输出。
    ///
    /// 第一个分数要等累计 11 秒之后才输出（t = 1 使用 [0, 11] 的内容）。
    pub fn should_emit(&self, position: u32) -> bool {
        if position != self.state.last_emitted + 1 {
            return false;
        }
        if self.state.last_emitted == 0
            && round_to(self.state.stream_duration, EMIT_DECIMALS) < (HALF_WINDOW_S + 1) as f64
        {
            return false;
        }
        self.state.stream_duration - HALF_WINDOW_S as f64 >= position as f64
    }

    /// 标记流结束并计算最后一个输出位置
    pub fn finish(&mut self) {
        if self.state.finished {
            return;
        }
        let total = self.state.stream_duration;
        let mut final_position = total.floor();
        if total - final_position > FINAL_CEIL_THRESHOLD {
            final_position = total.ceil();
        }
        self.state.finished = true;
        self.state.final_position = final_position as u32;
        debug!(
            total,
            final_position = self.state.final_position,
            frames = self.len(),
            phase = ?self.phase(),
            "测量窗口结束"
        );
    }

    /// 流结束后依次取出剩余的输出位置，同时把窗口前端推进到 t - 10
    pub fn next_flush_position(&mut self) -> Option<u32> {
        if !self.state.finished {
            return None;
        }
        let next = self.state.last_emitted + 1;
        if next > self.state.final_position {
            return None;
        }

        let lower = next as f64 - HALF_WINDOW_S as f64;
        while self.frames.len() > 1
            && self
                .frames
                .front()
                .is_some_and(|f| round_to(f.dts, EMIT_DECIMALS) < lower)
        {
            if let Some(removed) = self.frames.pop_front() {
                self.state.window_duration -= removed.duration;
            }
        }

        self.state.last_emitted = next;
        Some(next)
    }

    /// 位置 `position` 对应的窗口：锚点为 dts < t 的最后一个样本，
    /// 窗口为锚点所在 epoch 的连续样本。
    pub fn current_window(&mut self, position: u32, partial: bool) -> &[Sample<P>] {
        let history = self.frames.make_contiguous();
        window_for(history, position, partial)
    }

    /// 读穿透计算位置 `position` 的分数
    pub fn score_at<F>(&mut self, position: u32, partial: bool, compute: F) -> Result<f64>
    where
        F: FnOnce(&[Sample<P>]) -> Result<f64>,
    {
        if self.is_empty() {
            return Err(P1203Error::InputValidation(format!(
                "位置 {position} 没有可用的窗口内容"
            )));
        }
        // 窗口借用自 self，计算期间把缓存临时取出
        let mut cache = std::mem::take(&mut self.cache);
        let result = {
            let window = self.current_window(position, partial);
            cache.get_or_compute(window, partial, compute)
        };
        self.cache = cache;
        result
    }
}

fn window_for<P>(history: &[Sample<P>], position: u32, partial: bool) -> &[Sample<P>] {
    if history.is_empty() {
        return &[];
    }
    let target = position as f64;
    let anchor = history.iter().rposition(|s| s.dts < target).unwrap_or(0);

    if partial {
        return WindowCache::<f64>::get_window(history, anchor, 1, true);
    }

    let epoch = history[anchor].epoch();
    let start = history[..anchor]
        .iter()
        .rposition(|s| s.epoch() != epoch)
        .map_or(0, |i| i + 1);
    let end = history[anchor..]
        .iter()
        .position(|s| s.epoch() != epoch)
        .map_or(history.len() - 1, |i| anchor + i - 1);

    WindowCache::<f64>::get_window(history, end, end + 1 - start, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::cache::digest_parts;

    fn feed(window: &mut MeasurementWindow<()>, rep: &str, count: usize, duration: f64, dts: &mut f64) -> Vec<u32> {
        let rep: Arc<str> = Arc::from(rep);
        let digest = digest_parts(&[rep.as_bytes()]);
        let mut emitted = Vec::new();
        for _ in 0..count {
            let sample = Sample::new(*dts, duration, Arc::clone(&rep), (), digest);
            if let Some(t) = window.add_frame(sample).expect("add_frame failed") {
                emitted.push(t);
            }
            *dts += duration;
        }
        emitted
    }

    fn drain(window: &mut MeasurementWindow<()>) -> Vec<u32> {
        window.finish();
        std::iter::from_fn(|| window.next_flush_position()).collect()
    }

    #[test]
    fn test_emits_one_position_per_second() {
        let mut window = MeasurementWindow::new();
        let mut dts = 0.0;
        let mut positions = feed(&mut window, "a", 720, 1.0 / 24.0, &mut dts);
        assert_eq!(positions.first(), Some(&1));
        positions.extend(drain(&mut window));
        assert_eq!(positions, (1..=30).collect::<Vec<_>>());
    }

    #[test]
    fn test_short_stream_only_flushes() {
        let mut window = MeasurementWindow::new();
        let mut dts = 0.0;
        assert!(feed(&mut window, "a", 500, 0.01, &mut dts).is_empty());
        assert_eq!(drain(&mut window), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_audio_rate_sum_rounds_up() {
        let mut window = MeasurementWindow::new();
        let mut dts = 0.0;
        let mut positions = feed(&mut window, "a", 6000, 0.01, &mut dts);
        positions.extend(drain(&mut window));
        assert_eq!(positions.len(), 60);
    }

    #[test]
    fn test_window_never_exceeds_length() {
        let mut window = MeasurementWindow::new();
        let mut dts = 0.0;
        feed(&mut window, "a", 60, 1.0, &mut dts);
        assert!(window.state().window_duration <= WINDOW_LENGTH_S + 1e-9);
        assert_eq!(window.len(), 20);
        assert_eq!(window.phase(), WindowPhase::Steady);
    }

    #[test]
    fn test_phase_transitions_on_switch() {
        let mut window = MeasurementWindow::new();
        assert_eq!(window.phase(), WindowPhase::Empty);
        let mut dts = 0.0;
        feed(&mut window, "a", 5, 1.0, &mut dts);
        assert_eq!(window.phase(), WindowPhase::Filling);
        feed(&mut window, "a", 20, 1.0, &mut dts);
        assert_eq!(window.phase(), WindowPhase::Steady);
        feed(&mut window, "b", 1, 1.0, &mut dts);
        assert_eq!(window.phase(), WindowPhase::Filling);
        assert_eq!(window.state().epoch, 1);
    }

    #[test]
    fn test_window_does_not_span_representation_switch() {
        let mut window = MeasurementWindow::new();
        let mut dts = 0.0;
        feed(&mut window, "a", 10, 1.0, &mut dts);
        feed(&mut window, "b", 10, 1.0, &mut dts);

        let early = window.current_window(5, false);
        assert_eq!(early.len(), 10);
        assert!(early.iter().all(|s| &*s.representation == "a"));

        let late = window.current_window(15, false);
        assert_eq!(late.len(), 10);
        assert!(late.iter().all(|s| &*s.representation == "b"));

        let single = window.current_window(15, true);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].dts, 14.0);
    }

    #[test]
    fn test_switch_back_is_still_a_new_epoch() {
        let mut window = MeasurementWindow::new();
        let mut dts = 0.0;
        feed(&mut window, "a", 5, 1.0, &mut dts);
        feed(&mut window, "b", 5, 1.0, &mut dts);
        feed(&mut window, "a", 5, 1.0, &mut dts);

        assert_eq!(window.current_window(3, false).len(), 5);
        assert_eq!(window.current_window(13, false).len(), 5);
        assert_eq!(window.state().epoch, 2);
    }

    #[test]
    fn test_identical_windows_are_cached() {
        let mut window = MeasurementWindow::new();
        let mut dts = 0.0;
        let mut positions = feed(&mut window, "a", 60, 1.0, &mut dts);
        positions.extend(drain(&mut window));
        assert_eq!(positions.len(), 60);

        let mut computed = 0;
        for t in 1..=3 {
            window
                .score_at(t, false, |w| {
                    computed += 1;
                    Ok(w.len() as f64)
                })
                .unwrap();
        }
        assert_eq!(computed, 1);
        assert_eq!(window.cache_stats().hits, 2);
    }

    #[test]
    fn test_score_sees_current_window() {
        let mut window = MeasurementWindow::<()>::new();
        assert!(window.score_at(1, false, |_| Ok(1.0)).is_err());

        let mut dts = 0.0;
        feed(&mut window, "a", 10, 1.0, &mut dts);
        feed(&mut window, "b", 6, 1.0, &mut dts);

        let expected = window.current_window(12, false).len();
        let seen = window.score_at(12, false, |w| Ok(w.len() as f64)).unwrap();
        assert_eq!(expected, 6);
        assert_eq!(seen, expected as f64);
        // 计算后缓存仍保留在窗口中
        assert_eq!(window.cache_stats().entries, 1);
    }

    #[test]
    fn test_rejects_invalid_samples() {
        let mut window = MeasurementWindow::<()>::new();
        let rep: Arc<str> = Arc::from("a");
        let zero = Sample::new(0.0, 0.0, Arc::clone(&rep), (), [0; 32]);
        assert!(window.add_frame(zero).is_err());

        window.finish();
        let late = Sample::new(0.0, 1.0, rep, (), [0; 32]);
        assert!(window.add_frame(late).is_err());
    }
}
