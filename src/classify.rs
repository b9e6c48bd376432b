use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::features::FeatureVector;
use crate::model::{ModelHandle, argmax, inference_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Genuine,
    Counterfeit,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Genuine => "genuine",
            Self::Counterfeit => "counterfeit",
        })
    }
}

/// Outcome of one classification. `confidence` is a percentage in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub label: Label,
    pub confidence: f64,
}

/// Runs one feature vector through the model.
///
/// Fails with [`Error::ModelUnavailable`] before touching the vector when the model did not load.
pub fn classify(model: &ModelHandle, features: &FeatureVector) -> Result<ClassificationResult> {
    let (classifier, label_map) = model.loaded()?;

    let rows = [*features.as_array()];
    let predicted = classifier
        .predict(&rows)
        .map_err(inference_error)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::internal("model returned no prediction"))?;
    let proba = classifier
        .predict_proba(&rows)
        .map_err(inference_error)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::internal("model returned no probabilities"))?;

    if proba.is_empty() || proba.iter().any(|p| !p.is_finite()) {
        return Err(Error::internal(format!(
            "model returned an unusable distribution: {proba:?}"
        )));
    }

    let label = label_map
        .label_for(predicted)
        .ok_or_else(|| Error::internal(format!("model predicted unmapped class {predicted}")))?;

    let top = proba[argmax(&proba)];
    let confidence = (top * 100.0).clamp(0.0, 100.0);

    debug!(class = predicted, %label, confidence, "classified");
    Ok(ClassificationResult { label, confidence })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::features::FEATURE_LEN;
    use crate::model::{Classifier, ForestModel, LabelMap, Row};
    use crate::model::tests::STUMP_JSON;

    fn features_with_zcr(zcr: f32) -> FeatureVector {
        let mut values = [0.0f32; FEATURE_LEN];
        values[26] = zcr;
        FeatureVector::try_from(&values[..]).expect("30 values")
    }

    fn stump(label_map: Option<LabelMap>) -> ModelHandle {
        let model = ForestModel::from_json(STUMP_JSON).expect("valid model");
        ModelHandle::from_classifier(Arc::new(model), label_map, "stump.json")
    }

    #[test]
    fn maps_class_zero_to_counterfeit_by_default() -> anyhow::Result<()> {
        let result = classify(&stump(None), &features_with_zcr(0.0))?;
        assert_eq!(result.label, Label::Counterfeit);
        assert!((result.confidence - 82.5).abs() < 1e-9);

        let result = classify(&stump(None), &features_with_zcr(0.9))?;
        assert_eq!(result.label, Label::Genuine);
        assert!((result.confidence - 52.5).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn configured_map_inverts_labels() -> anyhow::Result<()> {
        let inverted = LabelMap {
            counterfeit: 1,
            genuine: 0,
        };
        let result = classify(&stump(Some(inverted)), &features_with_zcr(0.0))?;
        assert_eq!(result.label, Label::Genuine);
        Ok(())
    }

    #[test]
    fn unavailable_model_fails_fast() {
        let model = ModelHandle::Unavailable {
            reason: "missing".into(),
        };
        let err = classify(&model, &features_with_zcr(0.0)).unwrap_err();
        assert!(matches!(err, Error::ModelUnavailable(_)));
    }

    struct Broken;

    impl Classifier for Broken {
        fn classes(&self) -> &[usize] {
            &[0, 1]
        }

        fn predict(&self, _rows: &[Row]) -> anyhow::Result<Vec<usize>> {
            Ok(vec![1])
        }

        fn predict_proba(&self, _rows: &[Row]) -> anyhow::Result<Vec<Vec<f64>>> {
            anyhow::bail!("backend exploded")
        }
    }

    #[test]
    fn inference_failure_is_an_internal_fault() {
        let model = ModelHandle::from_classifier(Arc::new(Broken), None, PathBuf::from("broken"));
        let err = classify(&model, &features_with_zcr(0.0)).unwrap_err();
        assert_eq!(err.kind(), "internal_fault");
    }

    #[test]
    fn label_serializes_lowercase() -> anyhow::Result<()> {
        let result = ClassificationResult {
            label: Label::Genuine,
            confidence: 91.0,
        };
        assert_eq!(
            serde_json::to_string(&result)?,
            r#"{"label":"genuine","confidence":91.0}"#
        );
        Ok(())
    }
}
