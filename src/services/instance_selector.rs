//! Instance selection: which dataset instances a run must evaluate.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::domain::errors::SelectionError;
use crate::domain::models::{Prediction, TaskInstance};
use crate::domain::ports::is_valid_key;

/// Predictions keyed by instance id.
///
/// When the same instance id appears more than once, the first occurrence
/// wins and later ones are recorded in `duplicates`.
#[derive(Debug, Clone, Default)]
pub struct PredictionSet {
    by_id: HashMap<String, Prediction>,
    duplicates: Vec<String>,
}

impl PredictionSet {
    pub fn from_predictions(predictions: impl IntoIterator<Item = Prediction>) -> Self {
        let mut set = Self::default();
        for prediction in predictions {
            if set.by_id.contains_key(&prediction.instance_id) {
                warn!(
                    instance_id = %prediction.instance_id,
                    model = %prediction.model_name_or_path,
                    "duplicate prediction ignored, keeping the first occurrence"
                );
                set.duplicates.push(prediction.instance_id);
            } else {
                set.by_id.insert(prediction.instance_id.clone(), prediction);
            }
        }
        set
    }

    pub fn get(&self, instance_id: &str) -> Option<&Prediction> {
        self.by_id.get(instance_id)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.by_id.contains_key(instance_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Instance ids that appeared more than once, in input order.
    pub fn duplicates(&self) -> &[String] {
        &self.duplicates
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.by_id.keys()
    }
}

/// Outcome of selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Instance ids to evaluate, in dataset order.
    pub selected: Vec<String>,
    /// Requested ids that will not be evaluated, with the reason.
    pub rejected: Vec<SelectionError>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }
}

/// Choose the instances to evaluate.
///
/// With an allowlist: `allowlist ∩ dataset`, each id also needing a
/// prediction. Without: every dataset instance that has a prediction.
/// Problems are reported per id in [`Selection::rejected`]; nothing here
/// aborts the run.
pub fn select_instances(
    dataset: &[TaskInstance],
    predictions: &PredictionSet,
    allowlist: Option<&[String]>,
) -> Selection {
    let dataset_ids: HashSet<&str> = dataset.iter().map(|i| i.instance_id.as_str()).collect();
    let mut rejected = Vec::new();

    let wanted: HashSet<&str> = match allowlist {
        Some(ids) => {
            let mut wanted = HashSet::new();
            for id in ids {
                if !wanted.insert(id.as_str()) {
                    continue;
                }
                if !dataset_ids.contains(id.as_str()) {
                    rejected.push(SelectionError::NotInDataset(id.clone()));
                } else if !predictions.contains(id) {
                    rejected.push(SelectionError::NoPrediction(id.clone()));
                }
            }
            wanted
        }
        None => {
            let mut unknown: Vec<&String> = predictions
                .ids()
                .filter(|id| !dataset_ids.contains(id.as_str()))
                .collect();
            unknown.sort();
            rejected.extend(
                unknown
                    .into_iter()
                    .map(|id| SelectionError::UnknownPrediction(id.clone())),
            );
            predictions.ids().map(String::as_str).collect()
        }
    };

    let mut seen = HashSet::new();
    let mut selected = Vec::new();
    for instance in dataset {
        let id = instance.instance_id.as_str();
        if !wanted.contains(id) || !predictions.contains(id) || !seen.insert(id) {
            continue;
        }
        if is_valid_key(id) {
            selected.push(id.to_string());
        } else {
            rejected.push(SelectionError::InvalidId(id.to_string()));
        }
    }

    Selection { selected, rejected }
}
