use anyhow::{Context, Result};
use csv::WriterBuilder;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;

use super::orchestrator::{BatchEntry, Evaluation, Outcome, QualityReport};
use super::safe_io;

#[derive(Debug, Default)]
pub struct ReportGenerator;

impl ReportGenerator {
    pub fn new() -> Self {
        Self
    }

    /// 按输入顺序组装 输入标识 → 报告/错误 的映射
    pub fn to_value(&self, entries: &[BatchEntry]) -> Result<Value> {
        let mut map = Map::with_capacity(entries.len());
        for entry in entries {
            let value = serde_json::to_value(&entry.outcome)
                .with_context(|| format!("序列化报告失败: {}", entry.id))?;
            let key = unique_key(&map, &entry.id);
            map.insert(key, value);
        }
        Ok(Value::Object(map))
    }

    pub fn to_json(&self, entries: &[BatchEntry]) -> Result<String> {
        let value = self.to_value(entries)?;
        serde_json::to_string_pretty(&value).context("序列化JSON报告失败")
    }

    pub fn write_json<P: AsRef<Path>>(&self, entries: &[BatchEntry], output_path: P) -> Result<()> {
        let mut content = self.to_json(entries)?;
        content.push('\n');
        safe_io::atomic_write_string(output_path.as_ref(), &content)?;
        eprintln!("✅ JSON报告已保存到: {}", output_path.as_ref().display());
        Ok(())
    }

    pub fn generate_csv_summary<P: AsRef<Path>>(&self, entries: &[BatchEntry], output_path: P) -> Result<()> {
        let mut buffer: Vec<u8> = Vec::new();
        {
            let mut writer = WriterBuilder::new().has_headers(true).from_writer(&mut buffer);

            for entry in entries {
                writer
                    .serialize(CsvRecord::from_entry(entry))
                    .context("写入CSV记录失败")?;
            }

            writer.flush().context("刷新CSV缓冲失败")?;
        }

        safe_io::atomic_write_bytes(output_path.as_ref(), &buffer)?;
        eprintln!("✅ CSV摘要已保存到: {}", output_path.as_ref().display());
        Ok(())
    }

    /// 终端摘要，写到 stderr，stdout 只留给 JSON
    pub fn display_summary(&self, entries: &[BatchEntry]) {
        if entries.is_empty() {
            eprintln!("没有可显示的评估结果。");
            return;
        }

        eprintln!("\n--- 📊 质量评估摘要 ---");
        self.display_status(entries);
        self.display_statistics(entries);
        self.display_failures(entries);
    }

    fn display_status(&self, entries: &[BatchEntry]) {
        let failed = entries.iter().filter(|e| e.is_error()).count();
        let succeeded = entries.len() - failed;

        eprintln!("\n📈 评估状态:");
        eprintln!(" - 成功: {succeeded} 个输入");
        eprintln!(" - 失败: {failed} 个输入");
    }

    fn display_statistics(&self, entries: &[BatchEntry]) {
        let reports: Vec<&QualityReport> = entries
            .iter()
            .filter_map(|entry| match &entry.outcome {
                Outcome::Evaluated(Evaluation::Full(report)) => Some(report),
                _ => None,
            })
            .collect();

        if reports.is_empty() {
            return;
        }

        let scores: Vec<f64> = reports.iter().map(|r| r.o46()).collect();
        let avg = scores.iter().sum::<f64>() / scores.len() as f64;
        let max = scores.iter().copied().fold(f64::MIN, f64::max);
        let min = scores.iter().copied().fold(f64::MAX, f64::min);
        let avg_o23 = reports.iter().map(|r| r.o23()).sum::<f64>() / reports.len() as f64;
        let worst_second = reports
            .iter()
            .flat_map(|r| r.o34().iter().copied())
            .fold(f64::MAX, f64::min);
        let with_warnings = reports.iter().filter(|r| !r.warnings().is_empty()).count();

        eprintln!("\n📊 O.46 统计:");
        eprintln!(" - 完整报告数: {}", scores.len());
        eprintln!(" - 平均分数: {avg:.3}");
        eprintln!(" - 最高分数: {max:.3}");
        eprintln!(" - 最低分数: {min:.3}");
        eprintln!(" - 平均卡顿分数 (O.23): {avg_o23:.3}");
        if worst_second < f64::MAX {
            eprintln!(" - 最低单秒分数 (O.34): {worst_second:.3}");
        }
        eprintln!(" - 带警告的报告数: {with_warnings}");
    }

    fn display_failures(&self, entries: &[BatchEntry]) {
        let failures: Vec<_> = entries
            .iter()
            .filter_map(|entry| match &entry.outcome {
                Outcome::Failed(error) => Some((entry, error)),
                Outcome::Evaluated(_) => None,
            })
            .collect();

        if failures.is_empty() {
            return;
        }

        eprintln!("\n❌ 失败的输入:");
        for (entry, error) in failures {
            eprintln!(
                " - {} [{}] {}",
                sanitize_for_terminal(&entry.id),
                error.kind,
                sanitize_for_terminal(&error.error)
            );
        }
    }
}

/// 重复的输入标识追加 #2、#3 …
fn unique_key(map: &Map<String, Value>, id: &str) -> String {
    if !map.contains_key(id) {
        return id.to_string();
    }
    (2..)
        .map(|n| format!("{id}#{n}"))
        .find(|key| !map.contains_key(key))
        .unwrap_or_else(|| id.to_string())
}

#[derive(Debug, Serialize)]
struct CsvRecord {
    id: String,
    status: &'static str,
    mode: Option<u8>,
    #[serde(rename = "O35")]
    o35: Option<f64>,
    #[serde(rename = "O46")]
    o46: Option<f64>,
    error: String,
}

impl CsvRecord {
    fn from_entry(entry: &BatchEntry) -> Self {
        let (status, mode, o35, o46, error) = match &entry.outcome {
            Outcome::Evaluated(Evaluation::Full(report)) => {
                ("ok", report.mode(), Some(report.o35()), Some(report.o46()), String::new())
            }
            Outcome::Evaluated(evaluation) => ("ok", evaluation.mode(), None, None, String::new()),
            Outcome::Failed(failure) => ("error", None, None, None, failure.error.clone()),
        };
        Self {
            id: entry.id.clone(),
            status,
            mode,
            o35,
            o46,
            error,
        }
    }
}

fn sanitize_for_terminal(input: &str) -> String {
    input
        .chars()
        .filter(|ch| {
            let c = *ch as u32;
            c == 0x09 || c == 0x20 || (0x21..=0x7e).contains(&c) || c >= 0xa0
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::EvaluationConfig;
    use crate::model::input::InputReport;
    use crate::model::orchestrator::{BatchInput, ErrorEntry, Orchestrator};
    use tempfile::NamedTempFile;

    fn sample_entries() -> Vec<BatchEntry> {
        let report = InputReport::from_json_str(
            r#"{"I13": {"streamId": 3, "segments": [{"bitrate": 800, "codec": "h264", "duration": 12,
                "fps": 30, "resolution": "1280x720", "start": 0}]}}"#,
        )
        .unwrap();
        let inputs = vec![
            BatchInput::Document {
                id: "session.json".to_string(),
                report: report.clone(),
            },
            BatchInput::Document {
                id: "session.json".to_string(),
                report,
            },
        ];
        let mut entries = Orchestrator::new(EvaluationConfig::default())
            .unwrap()
            .run(&inputs, None)
            .unwrap();
        entries.push(BatchEntry {
            id: "broken.json".to_string(),
            outcome: Outcome::Failed(ErrorEntry {
                error: "[E_INPUT] 输入校验失败: bad\x1b[31m".to_string(),
                kind: "InputValidationError",
            }),
        });
        entries
    }

    #[test]
    fn test_json_keeps_order_and_suffixes_duplicates() {
        let generator = ReportGenerator::new();
        let value = generator.to_value(&sample_entries()).unwrap();
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["session.json", "session.json#2", "broken.json"]);
        assert_eq!(value["session.json"]["streamId"], 3);
        assert_eq!(value["broken.json"]["kind"], "InputValidationError");
    }

    #[test]
    fn test_generate_csv_summary() {
        let generator = ReportGenerator::new();
        let temp_file = NamedTempFile::new().expect("failed to create temp file");

        generator
            .generate_csv_summary(&sample_entries(), temp_file.path())
            .expect("csv failed");

        let content = std::fs::read_to_string(temp_file.path()).expect("failed to read csv");
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("id,status,mode,O35,O46,error"));
        assert!(lines.next().unwrap_or_default().starts_with("session.json,ok,0,"));
        assert!(content.contains("broken.json,error,,,,"));
    }

    #[test]
    fn test_write_json() {
        let generator = ReportGenerator::new();
        let temp_file = NamedTempFile::new().expect("failed to create temp file");
        generator.write_json(&sample_entries(), temp_file.path()).expect("json failed");

        let content = std::fs::read_to_string(temp_file.path()).expect("failed to read json");
        let value: Value = serde_json::from_str(&content).unwrap();
        assert!(value["session.json"]["O46"].is_number());
    }

    #[test]
    fn test_sanitize_for_terminal() {
        assert_eq!(sanitize_for_terminal("a\x1b[31mb\n"), "a[31mb");
        assert_eq!(sanitize_for_terminal("会话 1"), "会话 1");
    }

    #[test]
    fn test_display_summary() {
        let generator = ReportGenerator::new();
        generator.display_summary(&sample_entries());
        generator.display_summary(&[]);
    }
}
