//! Dataset and prediction file loading.
//!
//! Both accept a JSON array or JSONL (one object per line). Predictions also
//! accept a JSON object keyed by instance id.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use crate::domain::errors::{HarnessError, HarnessResult};
use crate::domain::models::{Prediction, TaskInstance};

/// Resolve the file holding `split` of a dataset.
///
/// A directory is expected to contain `<split>.jsonl` or `<split>.json`; a
/// file path is used as-is.
pub fn resolve_dataset_path(dataset: &Path, split: &str) -> HarnessResult<PathBuf> {
    if dataset.is_file() {
        return Ok(dataset.to_path_buf());
    }
    if dataset.is_dir() {
        for ext in ["jsonl", "json"] {
            let candidate = dataset.join(format!("{split}.{ext}"));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        return Err(HarnessError::Dataset(format!(
            "no {split}.jsonl or {split}.json in {}",
            dataset.display()
        )));
    }
    Err(HarnessError::Dataset(format!(
        "dataset not found: {}",
        dataset.display()
    )))
}

fn read_text(path: &Path) -> HarnessResult<String> {
    std::fs::read_to_string(path)
        .map_err(|e| HarnessError::Dataset(format!("failed to read {}: {e}", path.display())))
}

fn parse_records<T: DeserializeOwned>(path: &Path, text: &str) -> HarnessResult<Vec<T>> {
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(text)
            .map_err(|e| HarnessError::Dataset(format!("{}: {e}", path.display())));
    }

    let mut records = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|e| {
            HarnessError::Dataset(format!("{}:{}: {e}", path.display(), idx + 1))
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Load every task instance of `split`.
///
/// Duplicate instance ids make the dataset unusable and are rejected.
pub fn load_dataset(dataset: &Path, split: &str) -> HarnessResult<Vec<TaskInstance>> {
    let path = resolve_dataset_path(dataset, split)?;
    let instances: Vec<TaskInstance> = parse_records(&path, &read_text(&path)?)?;

    let mut seen = HashSet::new();
    for instance in &instances {
        if !seen.insert(instance.instance_id.as_str()) {
            return Err(HarnessError::Dataset(format!(
                "duplicate instance id {} in {}",
                instance.instance_id,
                path.display()
            )));
        }
    }

    info!(path = %path.display(), count = instances.len(), "loaded dataset");
    Ok(instances)
}

/// Load predictions in file order. Duplicates are kept here and resolved by
/// the selector.
pub fn load_predictions(path: &Path) -> HarnessResult<Vec<Prediction>> {
    let text = read_text(path)?;

    // `{"<instance_id>": {...}, ...}` as written by some inference scripts.
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text) {
        if !map.contains_key("instance_id") {
            debug!(path = %path.display(), "predictions keyed by instance id");
            return map
                .into_iter()
                .map(|(id, mut value)| {
                    // The key names the instance; an embedded id must agree with it.
                    if let Value::Object(fields) = &mut value {
                        fields
                            .entry("instance_id")
                            .or_insert_with(|| Value::String(id.clone()));
                    }
                    let prediction: Prediction = serde_json::from_value(value)
                        .map_err(|e| HarnessError::Dataset(format!("{}: {id}: {e}", path.display())))?;
                    if prediction.instance_id != id {
                        return Err(HarnessError::Dataset(format!(
                            "{}: key {id} holds a prediction for {}",
                            path.display(),
                            prediction.instance_id
                        )));
                    }
                    Ok(prediction)
                })
                .collect();
        }
    }

    let predictions: Vec<Prediction> = parse_records(path, &text)?;
    info!(path = %path.display(), count = predictions.len(), "loaded predictions");
    Ok(predictions)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROW_A: &str = r#"{"instance_id": "a-1", "repo": "o/r", "base_commit": "abc"}"#;
    const ROW_B: &str = r#"{"instance_id": "b-2", "repo": "o/r", "base_commit": "def"}"#;

    #[test]
    fn test_jsonl_and_array_datasets() {
        let dir = tempfile::tempdir().unwrap();
        let jsonl = dir.path().join("lite.jsonl");
        std::fs::write(&jsonl, format!("{ROW_A}\n\n{ROW_B}\n")).unwrap();
        let array = dir.path().join("lite.json");
        std::fs::write(&array, format!("[{ROW_A}, {ROW_B}]")).unwrap();

        assert_eq!(load_dataset(&jsonl, "test").unwrap().len(), 2);
        assert_eq!(load_dataset(&array, "test").unwrap().len(), 2);
    }

    #[test]
    fn test_split_resolves_inside_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dev.jsonl"), ROW_A).unwrap();

        let instances = load_dataset(dir.path(), "dev").unwrap();
        assert_eq!(instances[0].instance_id, "a-1");
        assert!(matches!(
            load_dataset(dir.path(), "test"),
            Err(HarnessError::Dataset(_))
        ));
    }

    #[test]
    fn test_bad_line_reports_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.jsonl");
        std::fs::write(&path, format!("{ROW_A}\n{{oops\n")).unwrap();

        let err = load_dataset(&path, "test").unwrap_err().to_string();
        assert!(err.contains("d.jsonl:2"), "{err}");
    }

    #[test]
    fn test_duplicate_dataset_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.jsonl");
        std::fs::write(&path, format!("{ROW_A}\n{ROW_A}\n")).unwrap();
        assert!(load_dataset(&path, "test").is_err());
    }

    #[test]
    fn test_prediction_formats() {
        let dir = tempfile::tempdir().unwrap();

        let jsonl = dir.path().join("p.jsonl");
        std::fs::write(
            &jsonl,
            "{\"instance_id\": \"a-1\", \"model_patch\": \"diff\"}\n{\"instance_id\": \"b-2\"}\n",
        )
        .unwrap();
        assert_eq!(load_predictions(&jsonl).unwrap().len(), 2);

        let keyed = dir.path().join("p.json");
        std::fs::write(
            &keyed,
            r#"{"a-1": {"instance_id": "a-1", "model_patch": "diff", "model_name_or_path": "m"}}"#,
        )
        .unwrap();
        let preds = load_predictions(&keyed).unwrap();
        assert_eq!(preds.len(), 1);
        assert_eq!(preds[0].model_name_or_path, "m");

        let unnamed = dir.path().join("unnamed.json");
        std::fs::write(&unnamed, r#"{"b-2": {"model_patch": "diff"}, "c-3": {"model_patch": ""}}"#).unwrap();
        let mut ids: Vec<_> = load_predictions(&unnamed)
            .unwrap()
            .into_iter()
            .map(|p| p.instance_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["b-2".to_string(), "c-3".to_string()]);

        let single = dir.path().join("one.jsonl");
        std::fs::write(&single, r#"{"instance_id": "a-1", "model_patch": ""}"#).unwrap();
        assert_eq!(load_predictions(&single).unwrap()[0].instance_id, "a-1");
    }

    #[test]
    fn test_keyed_prediction_must_match_its_key() {
        let dir = tempfile::tempdir().unwrap();
        let keyed = dir.path().join("p.json");
        std::fs::write(&keyed, r#"{"a-1": {"instance_id": "b-2", "model_patch": "diff"}}"#).unwrap();

        let err = load_predictions(&keyed).unwrap_err();
        assert!(matches!(err, HarnessError::Dataset(_)));
        assert!(err.to_string().contains("b-2"));
    }
}
