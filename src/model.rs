//! Trained classifier artifact: loading, validation, and inference.
//!
//! The artifact is a JSON export of a scikit-learn style tree ensemble, optionally preceded by a
//! standard scaler. Anything that can answer `predict` / `predict_proba` over 30-column rows can
//! stand in for it through [`Classifier`].

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use serde::Deserialize;
use tracing::{info, warn};

use crate::classify::Label;
use crate::features::FEATURE_LEN;

/// One 30-column input row.
pub type Row = [f32; FEATURE_LEN];

/// Inference seam between the adapter and a concrete model.
///
/// Implementations must be deterministic and side-effect free; a single instance is shared by
/// every request.
pub trait Classifier: Send + Sync {
    /// Class labels, in the column order used by [`Classifier::predict_proba`].
    fn classes(&self) -> &[usize];

    /// Discrete class label per row.
    fn predict(&self, rows: &[Row]) -> Result<Vec<usize>>;

    /// Class probability distribution per row.
    fn predict_proba(&self, rows: &[Row]) -> Result<Vec<Vec<f64>>>;
}

/// Which discrete class means which [`Label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelMap {
    pub counterfeit: usize,
    pub genuine: usize,
}

impl Default for LabelMap {
    fn default() -> Self {
        Self {
            counterfeit: 0,
            genuine: 1,
        }
    }
}

impl LabelMap {
    pub fn label_for(&self, class: usize) -> Option<Label> {
        if class == self.counterfeit {
            Some(Label::Counterfeit)
        } else if class == self.genuine {
            Some(Label::Genuine)
        } else {
            None
        }
    }

    /// Derive a map from training-time class names, if they name both labels.
    pub fn from_class_names(classes: &[usize], names: &[String]) -> Option<Self> {
        let mut counterfeit = None;
        let mut genuine = None;
        for (&class, name) in classes.iter().zip(names) {
            match name.trim().to_ascii_lowercase().as_str() {
                "fake" | "counterfeit" => counterfeit = Some(class),
                "real" | "genuine" => genuine = Some(class),
                _ => {}
            }
        }
        Some(Self {
            counterfeit: counterfeit?,
            genuine: genuine?,
        })
    }

    /// Pick the effective map for a model and check it against the model's classes.
    pub fn resolve(
        explicit: Option<LabelMap>,
        classes: &[usize],
        class_names: Option<&[String]>,
    ) -> Result<Self> {
        let derived = class_names.and_then(|names| Self::from_class_names(classes, names));

        let map = match (explicit, derived) {
            (Some(explicit), Some(derived)) if explicit != derived => bail!(
                "configured label map {explicit} contradicts model class names ({derived})"
            ),
            (Some(map), _) | (None, Some(map)) => map,
            (None, None) => Self::default(),
        };

        ensure!(
            map.counterfeit != map.genuine,
            "label map assigns both labels to class {}",
            map.genuine
        );
        for class in [map.counterfeit, map.genuine] {
            ensure!(
                classes.contains(&class),
                "label map refers to class {class}, model classes are {classes:?}"
            );
        }
        Ok(map)
    }
}

impl fmt::Display for LabelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "counterfeit={}, genuine={}",
            self.counterfeit, self.genuine
        )
    }
}

#[derive(Debug, Deserialize)]
struct ForestArtifact {
    n_features: usize,
    classes: Vec<usize>,
    #[serde(default)]
    class_names: Option<Vec<String>>,
    #[serde(default)]
    scaler: Option<Scaler>,
    trees: Vec<Tree>,
}

#[derive(Debug, Deserialize)]
struct Scaler {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

#[derive(Debug, Deserialize)]
struct Node {
    // Raw scikit-learn exports mark leaves with -2.
    #[serde(default)]
    feature: Option<i64>,
    #[serde(default)]
    threshold: f64,
    #[serde(default = "no_child")]
    left: i64,
    #[serde(default = "no_child")]
    right: i64,
    value: Vec<f64>,
}

fn no_child() -> i64 {
    -1
}

impl Node {
    fn split(&self) -> Option<(usize, usize, usize)> {
        let feature = usize::try_from(self.feature?).ok()?;
        let left = usize::try_from(self.left).ok()?;
        let right = usize::try_from(self.right).ok()?;
        Some((feature, left, right))
    }
}

/// A validated tree ensemble. Probabilities are the mean of each tree's normalized leaf counts.
#[derive(Debug)]
pub struct ForestModel {
    classes: Vec<usize>,
    class_names: Option<Vec<String>>,
    scaler: Option<Scaler>,
    trees: Vec<Tree>,
}

impl ForestModel {
    pub fn load(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open model {}", path.display()))?;
        let artifact: ForestArtifact = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse model {}", path.display()))?;
        Self::from_artifact(artifact).with_context(|| format!("invalid model {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let artifact: ForestArtifact = serde_json::from_str(json).context("failed to parse model")?;
        Self::from_artifact(artifact)
    }

    pub fn class_names(&self) -> Option<&[String]> {
        self.class_names.as_deref()
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    fn from_artifact(artifact: ForestArtifact) -> Result<Self> {
        ensure!(
            artifact.n_features == FEATURE_LEN,
            "model expects {} features, extractor produces {FEATURE_LEN}",
            artifact.n_features
        );

        let n_classes = artifact.classes.len();
        ensure!(n_classes >= 2, "model needs at least two classes");
        let mut sorted = artifact.classes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        ensure!(sorted.len() == n_classes, "duplicate class labels");

        if let Some(names) = &artifact.class_names {
            ensure!(
                names.len() == n_classes,
                "{} class names for {n_classes} classes",
                names.len()
            );
        }

        if let Some(scaler) = &artifact.scaler {
            ensure!(
                scaler.mean.len() == FEATURE_LEN && scaler.scale.len() == FEATURE_LEN,
                "scaler must have {FEATURE_LEN} means and scales"
            );
            ensure!(
                scaler.mean.iter().all(|m| m.is_finite()),
                "scaler mean is not finite"
            );
            ensure!(
                scaler.scale.iter().all(|s| s.is_finite() && *s != 0.0),
                "scaler scale must be finite and non-zero"
            );
        }

        ensure!(!artifact.trees.is_empty(), "model has no trees");
        for (t, tree) in artifact.trees.iter().enumerate() {
            validate_tree(tree, n_classes).with_context(|| format!("tree {t}"))?;
        }

        Ok(Self {
            classes: artifact.classes,
            class_names: artifact.class_names,
            scaler: artifact.scaler,
            trees: artifact.trees,
        })
    }

    fn prepare(&self, row: &Row) -> Result<[f32; FEATURE_LEN]> {
        let mut out = *row;
        if let Some(scaler) = &self.scaler {
            for (i, v) in out.iter_mut().enumerate() {
                *v = ((f64::from(*v) - scaler.mean[i]) / scaler.scale[i]) as f32;
            }
        }
        if out.iter().any(|v| !v.is_finite()) {
            bail!("input row is not finite");
        }
        Ok(out)
    }

    fn row_proba(&self, row: &Row) -> Result<Vec<f64>> {
        let x = self.prepare(row)?;
        let mut acc = vec![0.0f64; self.classes.len()];
        for tree in &self.trees {
            let leaf = walk(tree, &x);
            let total: f64 = leaf.value.iter().sum();
            for (a, v) in acc.iter_mut().zip(&leaf.value) {
                *a += v / total;
            }
        }
        let n = self.trees.len() as f64;
        acc.iter_mut().for_each(|a| *a /= n);
        Ok(acc)
    }
}

impl Classifier for ForestModel {
    fn classes(&self) -> &[usize] {
        &self.classes
    }

    fn predict(&self, rows: &[Row]) -> Result<Vec<usize>> {
        rows.iter()
            .map(|row| {
                let proba = self.row_proba(row)?;
                Ok(self.classes[argmax(&proba)])
            })
            .collect()
    }

    fn predict_proba(&self, rows: &[Row]) -> Result<Vec<Vec<f64>>> {
        rows.iter().map(|row| self.row_proba(row)).collect()
    }
}

fn validate_tree(tree: &Tree, n_classes: usize) -> Result<()> {
    ensure!(!tree.nodes.is_empty(), "tree has no nodes");
    for (idx, node) in tree.nodes.iter().enumerate() {
        match node.split() {
            Some((feature, left, right)) => {
                ensure!(feature < FEATURE_LEN, "node {idx} splits on feature {feature}");
                ensure!(
                    node.threshold.is_finite(),
                    "node {idx} has a non-finite threshold"
                );
                // Children always follow their parent, which also rules out cycles.
                for child in [left, right] {
                    ensure!(
                        child > idx && child < tree.nodes.len(),
                        "node {idx} has out-of-range child {child}"
                    );
                }
            }
            None => {
                ensure!(
                    node.value.len() == n_classes,
                    "leaf {idx} has {} values for {n_classes} classes",
                    node.value.len()
                );
                ensure!(
                    node.value.iter().all(|v| v.is_finite() && *v >= 0.0),
                    "leaf {idx} has invalid counts"
                );
                ensure!(
                    node.value.iter().sum::<f64>() > 0.0,
                    "leaf {idx} is empty"
                );
            }
        }
    }
    Ok(())
}

fn walk<'a>(tree: &'a Tree, x: &[f32; FEATURE_LEN]) -> &'a Node {
    let mut idx = 0;
    loop {
        let node = &tree.nodes[idx];
        match node.split() {
            Some((feature, left, right)) => {
                idx = if f64::from(x[feature]) <= node.threshold {
                    left
                } else {
                    right
                };
            }
            None => return node,
        }
    }
}

/// Index of the largest value; the first wins on ties.
pub(crate) fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// The process-wide model slot. Never mutated after construction.
#[derive(Clone)]
pub enum ModelHandle {
    Loaded {
        classifier: Arc<dyn Classifier>,
        label_map: LabelMap,
        source: PathBuf,
    },
    Unavailable {
        reason: String,
    },
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loaded {
                label_map, source, ..
            } => f
                .debug_struct("Loaded")
                .field("label_map", label_map)
                .field("source", source)
                .finish_non_exhaustive(),
            Self::Unavailable { reason } => f
                .debug_struct("Unavailable")
                .field("reason", reason)
                .finish(),
        }
    }
}

impl ModelHandle {
    /// Try each candidate in order and keep the first model that loads.
    pub fn load_first(paths: &[PathBuf], label_map: Option<LabelMap>) -> Self {
        let mut reasons = Vec::new();

        for path in paths {
            if !path.is_file() {
                reasons.push(format!("{}: not found", path.display()));
                continue;
            }

            let model = match ForestModel::load(path) {
                Ok(model) => model,
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(path = %path.display(), error = %reason, "model candidate rejected");
                    reasons.push(reason);
                    continue;
                }
            };

            return match LabelMap::resolve(label_map, model.classes(), model.class_names()) {
                Ok(label_map) => {
                    info!(
                        path = %path.display(),
                        trees = model.n_trees(),
                        %label_map,
                        "model loaded"
                    );
                    Self::Loaded {
                        classifier: Arc::new(model),
                        label_map,
                        source: path.clone(),
                    }
                }
                Err(err) => {
                    let reason = format!("{}: {err:#}", path.display());
                    warn!(error = %reason, "model label mapping rejected");
                    Self::Unavailable { reason }
                }
            };
        }

        let reason = if reasons.is_empty() {
            "no model paths configured".to_owned()
        } else {
            reasons.join("; ")
        };
        warn!(error = %reason, "running without a model");
        Self::Unavailable { reason }
    }

    /// Wrap an already-built classifier, validating the label map against its classes.
    pub fn from_classifier(
        classifier: Arc<dyn Classifier>,
        label_map: Option<LabelMap>,
        source: impl Into<PathBuf>,
    ) -> Self {
        match LabelMap::resolve(label_map, classifier.classes(), None) {
            Ok(label_map) => Self::Loaded {
                classifier,
                label_map,
                source: source.into(),
            },
            Err(err) => Self::Unavailable {
                reason: format!("{err:#}"),
            },
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Loaded { .. })
    }

    pub(crate) fn loaded(&self) -> crate::Result<(&dyn Classifier, LabelMap)> {
        match self {
            Self::Loaded {
                classifier,
                label_map,
                ..
            } => Ok((classifier.as_ref(), *label_map)),
            Self::Unavailable { reason } => Err(crate::Error::ModelUnavailable(reason.clone())),
        }
    }
}

pub(crate) fn inference_error(err: anyhow::Error) -> crate::Error {
    crate::Error::internal(format!("model inference failed: {err:#}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// One stump on `zcr_mean` (column 26): low ZCR → class 0, high → class 1.
    pub(crate) const STUMP_JSON: &str = r#"{
        "n_features": 30,
        "classes": [0, 1],
        "trees": [
            { "nodes": [
                { "feature": 26, "threshold": 0.1, "left": 1, "right": 2, "value": [5, 5] },
                { "feature": null, "value": [9, 1] },
                { "feature": null, "value": [2, 8] }
            ] },
            { "nodes": [
                { "value": [3, 1] }
            ] }
        ]
    }"#;

    fn row_with_zcr(zcr: f32) -> Row {
        let mut row = [0.0; FEATURE_LEN];
        row[26] = zcr;
        row
    }

    #[test]
    fn stump_probabilities_average_trees() -> anyhow::Result<()> {
        let model = ForestModel::from_json(STUMP_JSON)?;
        let proba = model.predict_proba(&[row_with_zcr(0.0), row_with_zcr(0.5)])?;

        assert!((proba[0][0] - (0.9 + 0.75) / 2.0).abs() < 1e-12);
        assert!((proba[1][1] - (0.8 + 0.25) / 2.0).abs() < 1e-12);
        assert_eq!(model.predict(&[row_with_zcr(0.0), row_with_zcr(0.5)])?, vec![0, 1]);
        Ok(())
    }

    #[test]
    fn threshold_is_inclusive_on_the_left() -> anyhow::Result<()> {
        // 0.125 is exact in f32, so a row equal to the threshold compares equal after widening.
        let json = STUMP_JSON.replace("\"threshold\": 0.1", "\"threshold\": 0.125");
        let model = ForestModel::from_json(&json)?;

        let at = model.predict_proba(&[row_with_zcr(0.125)])?;
        let below = model.predict_proba(&[row_with_zcr(0.0)])?;
        let above = model.predict_proba(&[row_with_zcr(0.126)])?;
        assert_eq!(at, below);
        assert_ne!(at, above);
        assert_eq!(model.predict(&[row_with_zcr(0.125)])?, vec![0]);
        Ok(())
    }

    #[test]
    fn accepts_raw_sklearn_leaf_markers() -> anyhow::Result<()> {
        let json = r#"{
            "n_features": 30,
            "classes": [0, 1],
            "trees": [
                { "nodes": [
                    { "feature": 26, "threshold": 0.5, "left": 1, "right": 2, "value": [4, 4] },
                    { "feature": -2, "threshold": -2.0, "left": -1, "right": -1, "value": [3, 1] },
                    { "feature": -2, "threshold": -2.0, "left": -1, "right": -1, "value": [1, 3] }
                ] }
            ]
        }"#;
        let model = ForestModel::from_json(json)?;
        assert_eq!(model.predict(&[row_with_zcr(0.0), row_with_zcr(0.9)])?, vec![0, 1]);
        Ok(())
    }

    #[test]
    fn scaler_is_applied_before_the_trees() -> anyhow::Result<()> {
        let mut artifact: serde_json::Value = serde_json::from_str(STUMP_JSON)?;
        let mut mean = vec![0.0; FEATURE_LEN];
        mean[26] = 1.0;
        artifact["scaler"] = serde_json::json!({ "mean": mean, "scale": vec![1.0; FEATURE_LEN] });
        let model = ForestModel::from_json(&artifact.to_string())?;

        // 0.5 - 1.0 = -0.5, which now falls on the left.
        assert_eq!(model.predict(&[row_with_zcr(0.5)])?, vec![0]);
        Ok(())
    }

    #[test]
    fn rejects_wrong_feature_count() {
        let json = STUMP_JSON.replace("\"n_features\": 30", "\"n_features\": 26");
        let err = ForestModel::from_json(&json).unwrap_err();
        assert!(format!("{err:#}").contains("26 features"));
    }

    #[test]
    fn rejects_out_of_range_children() {
        let json = STUMP_JSON.replace("\"right\": 2", "\"right\": 7");
        assert!(ForestModel::from_json(&json).is_err());
    }

    #[test]
    fn rejects_backward_children() {
        let json = STUMP_JSON.replace("\"left\": 1", "\"left\": 0");
        assert!(ForestModel::from_json(&json).is_err());
    }

    #[test]
    fn rejects_leaf_with_wrong_arity() {
        let json = STUMP_JSON.replace("[9, 1]", "[9, 1, 0]");
        assert!(ForestModel::from_json(&json).is_err());
    }

    #[test]
    fn argmax_prefers_first_on_ties() {
        assert_eq!(argmax(&[0.5, 0.5]), 0);
        assert_eq!(argmax(&[0.2, 0.8]), 1);
    }

    #[test]
    fn label_map_from_class_names() {
        let names = vec!["real".to_owned(), "FAKE".to_owned()];
        let map = LabelMap::from_class_names(&[0, 1], &names).expect("both names present");
        assert_eq!(
            map,
            LabelMap {
                counterfeit: 1,
                genuine: 0
            }
        );
        assert!(LabelMap::from_class_names(&[0, 1], &["a".to_owned(), "b".to_owned()]).is_none());
    }

    #[test]
    fn explicit_map_contradicting_names_is_rejected() {
        let names = vec!["fake".to_owned(), "real".to_owned()];
        let inverted = LabelMap {
            counterfeit: 1,
            genuine: 0,
        };
        assert!(LabelMap::resolve(Some(inverted), &[0, 1], Some(names.as_slice())).is_err());
        assert!(LabelMap::resolve(Some(LabelMap::default()), &[0, 1], Some(names.as_slice())).is_ok());
    }

    #[test]
    fn label_map_must_match_model_classes() {
        let map = LabelMap {
            counterfeit: 0,
            genuine: 2,
        };
        assert!(LabelMap::resolve(Some(map), &[0, 1], None).is_err());
    }

    #[test]
    fn load_first_skips_missing_and_broken_candidates() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json")?;
        let good = dir.path().join("good.json");
        std::fs::write(&good, STUMP_JSON)?;

        let handle = ModelHandle::load_first(
            &[dir.path().join("missing.json"), broken, good.clone()],
            None,
        );
        match handle {
            ModelHandle::Loaded {
                source, label_map, ..
            } => {
                assert_eq!(source, good);
                assert_eq!(label_map, LabelMap::default());
            }
            other => panic!("expected a loaded model, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn load_first_reports_every_reason_when_nothing_loads() {
        let handle = ModelHandle::load_first(
            &[PathBuf::from("/definitely/not/here.json")],
            None,
        );
        match handle {
            ModelHandle::Unavailable { reason } => assert!(reason.contains("not found")),
            other => panic!("expected unavailable, got {other:?}"),
        }
    }
}
