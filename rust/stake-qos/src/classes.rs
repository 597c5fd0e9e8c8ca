//! Class Table
//!
//! The working list of traffic classes: staked classes ordered by descending
//! threshold, the unstaked class last. Built once at startup.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::error::{QosError, Result};
use crate::types::{TrafficClass, UNSTAKED_THRESHOLD};

/// Ordered, immutable set of traffic classes
#[derive(Debug, Clone)]
pub struct ClassTable {
    /// Highest threshold first, unstaked class last
    classes: Vec<TrafficClass>,
}

impl ClassTable {
    /// Append the unstaked class and sort by descending threshold.
    ///
    /// The sort is stable: classes sharing a threshold keep their
    /// configuration order, so the first-listed one wins placement.
    pub fn build(staked: Vec<TrafficClass>, unstaked: TrafficClass) -> Result<Self> {
        let mut names = HashSet::new();
        for class in staked.iter().chain(std::iter::once(&unstaked)) {
            if class.name.trim().is_empty() {
                return Err(QosError::config("traffic class with empty name"));
            }
            if !names.insert(class.name.clone()) {
                return Err(QosError::config(format!(
                    "traffic class {:?} defined twice",
                    class.name
                )));
            }
        }

        if let Some(class) = staked
            .iter()
            .find(|c| c.is_unstaked() || c.threshold.is_nan())
        {
            return Err(QosError::config(format!(
                "staked class {:?} has threshold {}, only the unstaked class may sit at {}",
                class.name, class.threshold, UNSTAKED_THRESHOLD
            )));
        }

        let mut classes = staked;
        classes.push(TrafficClass {
            threshold: UNSTAKED_THRESHOLD,
            ..unstaked
        });
        classes.sort_by(|a, b| {
            b.threshold
                .partial_cmp(&a.threshold)
                .unwrap_or(Ordering::Equal)
        });

        Ok(Self { classes })
    }

    /// All classes, highest threshold first
    pub fn classes(&self) -> &[TrafficClass] {
        &self.classes
    }

    /// The sentinel class for peers without stake
    pub fn unstaked(&self) -> &TrafficClass {
        // build() always appends it and it sorts last
        &self.classes[self.classes.len() - 1]
    }

    /// Highest class whose threshold is strictly below `fraction`
    pub fn class_for(&self, fraction: f64) -> &TrafficClass {
        self.classes
            .iter()
            .find(|c| c.threshold < fraction)
            .unwrap_or_else(|| self.unstaked())
    }

    /// Position in table order; 0 is the highest class
    pub fn rank(&self, name: &str) -> Option<usize> {
        self.classes.iter().position(|c| c.name == name)
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&TrafficClass> {
        self.classes.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ClassTable {
        ClassTable::build(
            vec![
                TrafficClass::new("B", 0.01, 2),
                TrafficClass::new("A", 0.05, 1),
            ],
            TrafficClass::new("unstaked", 0.9, 9),
        )
        .unwrap()
    }

    #[test]
    fn test_sorted_descending_with_unstaked_last() {
        let table = table();
        let names: Vec<_> = table.names().collect();
        assert_eq!(names, vec!["A", "B", "unstaked"]);
        assert_eq!(table.unstaked().threshold, UNSTAKED_THRESHOLD);
        assert_eq!(table.unstaked().fwmark, 9);
        assert_eq!(table.rank("A"), Some(0));
        assert_eq!(table.rank("unstaked"), Some(2));
        assert_eq!(table.rank("missing"), None);
    }

    #[test]
    fn test_ties_keep_configuration_order() {
        let table = ClassTable::build(
            vec![
                TrafficClass::new("first", 0.02, 1),
                TrafficClass::new("second", 0.02, 2),
                TrafficClass::new("top", 0.10, 3),
            ],
            TrafficClass::new("u", 0.0, 0),
        )
        .unwrap();
        let names: Vec<_> = table.names().collect();
        assert_eq!(names, vec!["top", "first", "second", "u"]);
        assert_eq!(table.class_for(0.03).name, "first");
    }

    #[test]
    fn test_class_for_threshold_is_exclusive() {
        let table = table();
        assert_eq!(table.class_for(0.07).name, "A");
        assert_eq!(table.class_for(0.05).name, "B");
        assert_eq!(table.class_for(0.01).name, "unstaked");
        assert_eq!(table.class_for(0.0).name, "unstaked");
        assert_eq!(table.class_for(f64::NAN).name, "unstaked");
    }

    #[test]
    fn test_rejects_empty_or_duplicate_names() {
        assert!(ClassTable::build(
            vec![TrafficClass::new("", 0.1, 1)],
            TrafficClass::new("u", 0.0, 0)
        )
        .is_err());

        assert!(ClassTable::build(
            vec![TrafficClass::new("u", 0.1, 1)],
            TrafficClass::new("u", 0.0, 0)
        )
        .is_err());
    }

    #[test]
    fn test_single_sentinel() {
        let result = ClassTable::build(
            vec![TrafficClass::new("fake", UNSTAKED_THRESHOLD, 1)],
            TrafficClass::new("u", 0.0, 0),
        );
        assert!(matches!(result, Err(QosError::Config(_))));
    }

    #[test]
    fn test_only_unstaked() {
        let table = ClassTable::build(vec![], TrafficClass::new("u", 0.0, 0)).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.class_for(0.5).name, "u");
        assert_eq!(table.get("u").map(|c| c.fwmark), Some(0));
    }
}
