// ----------------------------------------------------------------
// 项目: P.1203 视听质量评估 (p1203-rs)
// 模块: model/forest.rs
// 描述: 随机森林决策树集合。
//      每棵树是一个 tree*.csv 文件，每行: 节点ID, 特征下标, 阈值, 左子节点, 右子节点。
//      特征下标为 -1 表示叶子节点，其阈值即为输出值。
// ----------------------------------------------------------------

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::errors::{P1203Error, Result};

/// 集成阶段使用的特征数量
pub const FEATURE_COUNT: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq)]
struct TreeNode {
    feature: i64,
    threshold: f64,
    left: usize,
    right: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionTree {
    nodes: Vec<TreeNode>,
}

impl DecisionTree {
    pub fn from_reader<R: std::io::Read>(reader: R, name: &str) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut nodes = Vec::new();
        for (line, record) in csv_reader.records().enumerate() {
            let record = record.map_err(|e| tree_error(name, line, &e.to_string()))?;
            if record.len() < 5 {
                return Err(tree_error(name, line, "列数不足 5"));
            }
            let field = |i: usize| -> Result<f64> {
                record[i]
                    .parse::<f64>()
                    .map_err(|e| tree_error(name, line, &e.to_string()))
            };
            let feature = field(1)? as i64;
            let threshold = field(2)?;
            let (left, right) = (field(3)?, field(4)?);
            if feature != -1 && (left < 0.0 || right < 0.0) {
                return Err(tree_error(name, line, "子节点下标为负"));
            }
            nodes.push(TreeNode {
                feature,
                threshold,
                left: left.max(0.0) as usize,
                right: right.max(0.0) as usize,
            });
        }

        let tree = DecisionTree { nodes };
        tree.check_structure(name)?;
        Ok(tree)
    }

    fn check_structure(&self, name: &str) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(P1203Error::TreeModel(format!("{name}: 空决策树")));
        }
        for (index, node) in self.nodes.iter().enumerate() {
            if node.feature == -1 {
                continue;
            }
            if node.feature < 0 || node.feature as usize >= FEATURE_COUNT {
                return Err(tree_error(name, index, "特征下标越界"));
            }
            if node.left >= self.nodes.len() || node.right >= self.nodes.len() {
                return Err(tree_error(name, index, "子节点下标越界"));
            }
        }
        Ok(())
    }

    /// 从根节点走到叶子；步数超过节点数说明树中有环
    pub fn predict(&self, features: &[f64; FEATURE_COUNT]) -> Result<f64> {
        let mut index = 0;
        for _ in 0..=self.nodes.len() {
            let node = &self.nodes[index];
            if node.feature == -1 {
                return Ok(node.threshold);
            }
            index = if features[node.feature as usize] < node.threshold {
                node.left
            } else {
                node.right
            };
        }
        Err(P1203Error::TreeModel("决策树中存在环".to_string()))
    }
}

fn tree_error(name: &str, line: usize, message: &str) -> P1203Error {
    P1203Error::TreeModel(format!("{name} 第 {} 行: {message}", line + 1))
}

/// 只读共享的决策树集合
#[derive(Debug, Clone, PartialEq)]
pub struct RandomForest {
    trees: Vec<DecisionTree>,
}

impl RandomForest {
    pub fn new(trees: Vec<DecisionTree>) -> Result<Self> {
        if trees.is_empty() {
            return Err(P1203Error::TreeModel("随机森林中没有决策树".to_string()));
        }
        Ok(Self { trees })
    }

    /// 加载目录下所有 tree*.csv，按文件名排序
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path.file_name().and_then(|n| n.to_str()).is_some_and(|name| {
                        name.starts_with("tree") && name.to_ascii_lowercase().ends_with(".csv")
                    })
            })
            .collect();
        paths.sort();

        let mut trees = Vec::with_capacity(paths.len());
        for path in &paths {
            let name = path.display().to_string();
            let file = fs::File::open(path)?;
            trees.push(DecisionTree::from_reader(file, &name)?);
            debug!(tree = %name, "决策树已加载");
        }

        let forest = Self::new(trees).map_err(|_| {
            P1203Error::TreeModel(format!("目录中没有 tree*.csv: {}", dir.display()))
        })?;
        info!(trees = forest.tree_count(), dir = %dir.display(), "随机森林加载完成");
        Ok(forest)
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// 所有树输出的平均值
    pub fn predict(&self, features: &[f64; FEATURE_COUNT]) -> Result<f64> {
        let mut sum = 0.0;
        for tree in &self.trees {
            sum += tree.predict(features)?;
        }
        Ok(sum / self.trees.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // 特征 0 < 1.5 时输出 2.0，否则 4.0
    const STUMP: &str = "0,0,1.5,1,2\n1,-1,2.0,-1,-1\n2,-1,4.0,-1,-1\n";

    #[test]
    fn test_tree_prediction() {
        let tree = DecisionTree::from_reader(STUMP.as_bytes(), "stump").unwrap();
        let mut features = [0.0; FEATURE_COUNT];
        assert_eq!(tree.predict(&features).unwrap(), 2.0);
        features[0] = 3.0;
        assert_eq!(tree.predict(&features).unwrap(), 4.0);
    }

    #[test]
    fn test_cycle_is_detected() {
        let tree = DecisionTree::from_reader("0,0,1.0,0,0\n".as_bytes(), "loop").unwrap();
        let features = [0.0; FEATURE_COUNT];
        assert!(matches!(tree.predict(&features), Err(P1203Error::TreeModel(_))));
    }

    #[test]
    fn test_malformed_tree_is_rejected() {
        assert!(DecisionTree::from_reader("0,0,1.5\n".as_bytes(), "short").is_err());
        assert!(DecisionTree::from_reader("0,20,1.5,0,0\n".as_bytes(), "feature").is_err());
        assert!(DecisionTree::from_reader("0,0,1.5,1,9\n1,-1,1,-1,-1\n".as_bytes(), "child").is_err());
    }

    #[test]
    fn test_load_dir_averages_trees() {
        let dir = tempfile::tempdir().expect("tempdir");
        for (name, value) in [("tree1.csv", "2.0"), ("tree2.csv", "3.0")] {
            let mut file = fs::File::create(dir.path().join(name)).unwrap();
            writeln!(file, "0,-1,{value},-1,-1").unwrap();
        }
        fs::write(dir.path().join("notes.csv"), "garbage").unwrap();

        let forest = RandomForest::load_dir(dir.path()).expect("load failed");
        assert_eq!(forest.tree_count(), 2);
        assert_eq!(forest.predict(&[0.0; FEATURE_COUNT]).unwrap(), 2.5);
    }

    #[test]
    fn test_empty_dir_is_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(RandomForest::load_dir(dir.path()).is_err());
    }
}
