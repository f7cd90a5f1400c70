//! Mapping from catalog records to store upserts.

use std::collections::HashMap;

use planets_core::{PlanetFields, SourceRecord, UpsertOp};

/// Write plan for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub ops: Vec<UpsertOp>,
    /// Records dropped for lacking a name.
    pub skipped: usize,
    /// Records folded into an earlier op with the same name.
    pub superseded: usize,
}

/// Pure, stateless mapping; never emits deletes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler;

impl Reconciler {
    pub fn new() -> Self {
        Self
    }

    /// One upsert per distinct name. For repeated names the last record's
    /// fields win while the op keeps the position of the first occurrence.
    pub fn to_write_ops(&self, records: Vec<SourceRecord>) -> Reconciliation {
        let mut plan = Reconciliation {
            ops: Vec::with_capacity(records.len()),
            ..Default::default()
        };
        let mut positions: HashMap<String, usize> = HashMap::with_capacity(records.len());

        for record in records {
            if record.name.trim().is_empty() {
                plan.skipped += 1;
                continue;
            }
            let fields = Self::map_fields(&record);
            match positions.get(&record.name) {
                Some(&pos) => {
                    plan.ops[pos].fields = fields;
                    plan.superseded += 1;
                }
                None => {
                    positions.insert(record.name.clone(), plan.ops.len());
                    plan.ops.push(UpsertOp {
                        name: record.name,
                        fields,
                    });
                }
            }
        }
        plan
    }

    pub fn map_fields(record: &SourceRecord) -> PlanetFields {
        PlanetFields {
            climate: record.climate.clone(),
            terrain: record.terrain.clone(),
            reference_count: u32::try_from(record.works.len()).unwrap_or(u32::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str, works: usize) -> SourceRecord {
        SourceRecord {
            name: name.to_string(),
            climate: "temperate".to_string(),
            terrain: "grasslands".to_string(),
            works: (1..=works).map(|i| i.to_string()).collect(),
        }
    }

    #[test]
    fn tatooine_maps_to_expected_upsert() {
        let plan = Reconciler::new().to_write_ops(vec![SourceRecord {
            name: "Tatooine".into(),
            climate: "arid".into(),
            terrain: "desert".into(),
            works: vec!["1".into(), "2".into()],
        }]);
        assert_eq!(
            plan.ops,
            vec![UpsertOp {
                name: "Tatooine".into(),
                fields: PlanetFields {
                    climate: "arid".into(),
                    terrain: "desert".into(),
                    reference_count: 2,
                },
            }]
        );
        assert_eq!(plan.skipped, 0);
    }

    #[test]
    fn empty_input_produces_no_ops() {
        let plan = Reconciler::new().to_write_ops(Vec::new());
        assert_eq!(plan, Reconciliation::default());
    }

    #[test]
    fn one_op_per_distinct_name_with_reference_counts() {
        for size in [1usize, 2, 7, 40] {
            let records = (0..size)
                .map(|i| source(&format!("planet-{i}"), i % 5))
                .collect::<Vec<_>>();
            let plan = Reconciler::new().to_write_ops(records.clone());
            assert_eq!(plan.ops.len(), size);
            for (op, record) in plan.ops.iter().zip(&records) {
                assert_eq!(op.name, record.name);
                assert_eq!(op.fields.reference_count as usize, record.works.len());
            }
        }
    }

    #[test]
    fn nameless_records_are_skipped_and_counted() {
        let records = vec![source("Hoth", 1), source("", 3), source("Endor", 1), source("   ", 0)];
        let input_len = records.len();
        let plan = Reconciler::new().to_write_ops(records);
        assert_eq!(plan.skipped, 2);
        assert_eq!(plan.ops.len(), input_len - plan.skipped);
        assert!(plan.ops.iter().all(|op| !op.name.trim().is_empty()));
    }

    #[test]
    fn duplicate_names_collapse_last_write_wins() {
        let mut later = source("Naboo", 4);
        later.climate = "humid".into();
        let plan = Reconciler::new().to_write_ops(vec![source("Naboo", 1), source("Kamino", 1), later]);

        assert_eq!(plan.ops.len(), 2);
        assert_eq!(plan.superseded, 1);
        assert_eq!(plan.ops[0].name, "Naboo");
        assert_eq!(plan.ops[0].fields.climate, "humid");
        assert_eq!(plan.ops[0].fields.reference_count, 4);
    }

    #[test]
    fn names_are_case_sensitive_keys() {
        let plan = Reconciler::new().to_write_ops(vec![source("Kamino", 1), source("kamino", 1)]);
        assert_eq!(plan.ops.len(), 2);
        assert_eq!(plan.superseded, 0);
    }
}
