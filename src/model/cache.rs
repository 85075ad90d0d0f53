use sha2::{Digest, Sha256};
use std::collections::HashMap;

use super::errors::Result;

/// 可以参与窗口指纹计算的元素。
///
/// `identity` 是元素内容的 32 字节摘要，在元素进入测量窗口时计算一次。
pub trait WindowElement {
    fn identity(&self) -> &[u8; 32];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// 以窗口内容指纹为键的读穿透缓存。
///
/// 生命周期限定在一次流计算之内，不在工作线程之间共享。
#[derive(Debug)]
pub struct WindowCache<V> {
    entries: HashMap<String, V>,
    hits: u64,
    misses: u64,
}

impl<V> Default for WindowCache<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }
}

impl<V: Clone> WindowCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取 `history` 中以 `end_index`（含）结尾的最后 `length` 个元素。
    ///
    /// 流开头历史不足时返回较短的切片；`partial` 时只返回 `end_index` 处的单个元素。
    pub fn get_window<T>(history: &[T], end_index: usize, length: usize, partial: bool) -> &[T] {
        if history.is_empty() || length == 0 || end_index >= history.len() {
            return &[];
        }
        if partial {
            return &history[end_index..=end_index];
        }
        let start = (end_index + 1).saturating_sub(length);
        &history[start..=end_index]
    }

    /// 窗口指纹：按顺序拼接各元素摘要后再做一次 SHA-256
    pub fn fingerprint<T: WindowElement>(window: &[T], partial: bool) -> String {
        let mut hasher = Sha256::new();
        hasher.update([partial as u8]);
        hasher.update((window.len() as u64).to_le_bytes());
        for element in window {
            hasher.update(element.identity());
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn lookup(&mut self, key: &str) -> Option<V> {
        let value = self.entries.get(key).cloned();
        if value.is_some() {
            self.hits += 1;
        }
        value
    }

    pub fn upsert(&mut self, key: String, value: V) {
        self.entries.insert(key, value);
    }

    /// 命中则直接返回缓存值，否则调用 `compute` 计算并写入
    pub fn get_or_compute<T, F>(&mut self, window: &[T], partial: bool, compute: F) -> Result<V>
    where
        T: WindowElement,
        F: FnOnce(&[T]) -> Result<V>,
    {
        let key = Self::fingerprint(window, partial);
        if let Some(value) = self.lookup(&key) {
            return Ok(value);
        }

        self.misses += 1;
        let value = compute(window)?;
        self.upsert(key, value.clone());
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }
}

/// 常用的元素摘要辅助函数
pub fn digest_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::errors::P1203Error;

    struct Item([u8; 32]);

    impl WindowElement for Item {
        fn identity(&self) -> &[u8; 32] {
            &self.0
        }
    }

    fn item(tag: &str) -> Item {
        Item(digest_parts(&[tag.as_bytes()]))
    }

    #[test]
    fn test_get_window_bounds() {
        let history = [1, 2, 3, 4, 5];
        assert_eq!(WindowCache::<f64>::get_window(&history, 4, 3, false), &[3, 4, 5]);
        assert_eq!(WindowCache::<f64>::get_window(&history, 1, 3, false), &[1, 2]);
        assert_eq!(WindowCache::<f64>::get_window(&history, 2, 3, true), &[3]);
        assert!(WindowCache::<f64>::get_window(&history, 9, 3, false).is_empty());
        assert!(WindowCache::<f64>::get_window::<i32>(&[], 0, 3, false).is_empty());
    }

    #[test]
    fn test_identical_windows_hit_same_entry() {
        let mut cache = WindowCache::<f64>::new();
        let first = [item("a"), item("b")];
        let second = [item("a"), item("b")];

        let v1 = cache.get_or_compute(&first, false, |w| Ok(w.len() as f64)).unwrap();
        let v2 = cache
            .get_or_compute(&second, false, |_| panic!("should be cached"))
            .unwrap();

        assert_eq!(v1, v2);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1, entries: 1 });
    }

    #[test]
    fn test_order_and_partial_change_fingerprint() {
        let ab = [item("a"), item("b")];
        let ba = [item("b"), item("a")];
        assert_ne!(
            WindowCache::<f64>::fingerprint(&ab, false),
            WindowCache::<f64>::fingerprint(&ba, false)
        );
        assert_ne!(
            WindowCache::<f64>::fingerprint(&ab, false),
            WindowCache::<f64>::fingerprint(&ab, true)
        );
    }

    #[test]
    fn test_failed_compute_is_not_cached() {
        let mut cache = WindowCache::<f64>::new();
        let window = [item("x")];
        let err = cache.get_or_compute(&window, false, |_| Err(P1203Error::NonFiniteScore("O22")));
        assert!(err.is_err());
        assert_eq!(cache.stats().entries, 0);

        let ok = cache.get_or_compute(&window, false, |_| Ok(3.0)).unwrap();
        assert_eq!(ok, 3.0);
    }
}
