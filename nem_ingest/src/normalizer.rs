use crate::catalog::{MissingPolicy, SeriesKind, SeriesSpec};
use crate::error::Result;
use crate::known_entities::KnownEntitySet;
use crate::models::{Record, TableTag};
use crate::parser::ParsedTable;
use crate::schema::SchemaRegistry;
use chrono::NaiveDateTime;
use log::{debug, info};

const TIMESTAMP_FORMATS: [&str; 3] = ["%Y/%m/%d %H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M"];

/// Solar units below this availability are treated as dark (MW)
const SOLAR_NIGHT_THRESHOLD: f64 = 1.0;

pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim().trim_matches('"');
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
}

fn parse_number(text: &str, policy: MissingPolicy) -> Option<f64> {
    match text.trim().trim_matches('"').parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => match policy {
            MissingPolicy::Zero => Some(0.0),
            MissingPolicy::Missing => None,
        },
    }
}

/// Curtailed MW for one semi-scheduled unit interval
pub fn curtailment(duid: &str, availability: f64, total_cleared: f64, semi_dispatch_cap: f64) -> f64 {
    if semi_dispatch_cap != 1.0 {
        return 0.0;
    }
    let upper = duid.to_ascii_uppercase();
    let is_solar = upper.contains("SF") || upper.contains("SOLAR");
    if is_solar && availability <= SOLAR_NIGHT_THRESHOLD {
        return 0.0;
    }
    (availability - total_cleared).max(0.0)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub records: Vec<Record>,
    /// Entity keys seen for the first time, each reported once
    pub discovered: Vec<String>,
    /// Rows dropped by filters or unparsable timestamps
    pub skipped: usize,
}

/// Maps parsed table rows onto a series' canonical columns
pub struct Normalizer<'a> {
    spec: &'a SeriesSpec,
    registry: &'a SchemaRegistry,
}

impl<'a> Normalizer<'a> {
    pub fn new(spec: &'a SeriesSpec, registry: &'a SchemaRegistry) -> Self {
        Self { spec, registry }
    }

    /// Type and filter rows; new keys are recorded in `entities` when the series tracks them
    pub fn normalize(
        &self,
        tag: &TableTag,
        table: &ParsedTable,
        entities: Option<&mut KnownEntitySet>,
    ) -> Result<NormalizedBatch> {
        let kind = self.spec.kind;
        let columns = self.spec.value_columns();
        let mut batch = NormalizedBatch::default();

        for block in &table.blocks {
            let map = self.registry.resolve(tag, &block.header)?;
            debug!("{}: {} rows as layout {}", self.spec.name, block.rows.len(), map.variant);

            for row in &block.rows {
                if !map.accepts(row) {
                    batch.skipped += 1;
                    continue;
                }
                let key = row.get(map.key).map(|k| k.trim().trim_matches('"')).unwrap_or("");
                if !kind.accepts_key(key) {
                    batch.skipped += 1;
                    continue;
                }
                let timestamp = match row.get(map.timestamp).and_then(|t| parse_timestamp(t)) {
                    Some(ts) => ts,
                    None => {
                        batch.skipped += 1;
                        continue;
                    }
                };

                let mut values: Vec<Option<f64>> = columns
                    .iter()
                    .zip(&map.values)
                    .map(|(column, index)| {
                        let policy = kind.missing_policy(column);
                        match index.and_then(|i| row.get(i)) {
                            Some(text) => parse_number(text, policy),
                            None => parse_number("", policy),
                        }
                    })
                    .collect();

                match kind {
                    SeriesKind::Curtailment => {
                        let field = |i: usize| values.get(i).copied().flatten().unwrap_or(0.0);
                        let value = curtailment(key, field(0), field(1), field(2));
                        if let Some(slot) = values.get_mut(3) {
                            *slot = Some(value);
                        }
                    }
                    SeriesKind::DistributedSolar => {
                        if !matches!(values.first(), Some(Some(p)) if *p >= 0.0) {
                            batch.skipped += 1;
                            continue;
                        }
                    }
                    _ => {}
                }

                batch.records.push(Record::new(timestamp, key, values));
            }
        }

        if let Some(registry) = entities.filter(|_| kind.has_entity_registry()) {
            batch.discovered = registry.observe(batch.records.iter().map(|r| r.key.as_str()));
            if !batch.discovered.is_empty() {
                info!(
                    "🆕 {}: {} new entit{} discovered: {}",
                    self.spec.name,
                    batch.discovered.len(),
                    if batch.discovered.len() == 1 { "y" } else { "ies" },
                    batch.discovered.join(", ")
                );
            }
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::parser::TableParser;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 10, 9).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    fn normalize(series: &str, tag: TableTag, payload: &str, entities: Option<&mut KnownEntitySet>) -> NormalizedBatch {
        let catalog = Catalog::nem();
        let registry = SchemaRegistry::nem();
        let spec = catalog.get(series).unwrap();
        let parsed = TableParser::parse(payload, &tag);
        Normalizer::new(spec, &registry).normalize(&tag, &parsed, entities).unwrap()
    }

    #[test]
    fn test_price_rows_filtered_by_intervention_and_region() {
        let payload = "\
I,DISPATCH,PRICE,5,SETTLEMENTDATE,RUNNO,REGIONID,DISPATCHINTERVAL,INTERVENTION,RRP
D,DISPATCH,PRICE,5,\"2025/10/09 10:05:00\",1,NSW1,1,0,87.5
D,DISPATCH,PRICE,5,\"2025/10/09 10:05:00\",1,NSW1,1,1,99.0
D,DISPATCH,PRICE,5,\"2025/10/09 10:05:00\",1,SNOWY1,1,0,10
D,DISPATCH,PRICE,5,\"2025/10/09 10:05:00\",1,VIC1,1,0,
";
        let batch = normalize("prices5", TableTag::new("DISPATCH", "PRICE"), payload, None);
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0], Record::new(ts(10, 5), "NSW1", vec![Some(87.5)]));
        // empty price stays missing
        assert_eq!(batch.records[1].values, vec![None]);
        assert_eq!(batch.skipped, 2);
    }

    #[test]
    fn test_legacy_interconnector_limits_zero_filled() {
        let payload = "\
I,DISPATCH,INTERCONNECTORRES,1,SETTLEMENTDATE,RUNNO,INTERCONNECTORID,METEREDMWFLOW,MWFLOW
D,DISPATCH,INTERCONNECTORRES,1,2010/01/01 00:05:00,1,V-SA,-120.5,abc
";
        let batch = normalize("transmission5", TableTag::new("DISPATCH", "INTERCONNECTORRES"), payload, None);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].values, vec![Some(-120.5), Some(0.0), Some(0.0), Some(0.0)]);
    }

    #[test]
    fn test_curtailment_rule() {
        assert_eq!(curtailment("COOPGWF1", 100.0, 60.0, 1.0), 40.0);
        assert_eq!(curtailment("COOPGWF1", 100.0, 60.0, 0.0), 0.0);
        assert_eq!(curtailment("BROKENSF1", 0.5, 0.0, 1.0), 0.0);
        assert_eq!(curtailment("BROKENSF1", 50.0, 70.0, 1.0), 0.0);

        let payload = "\
I,DISPATCH,UNIT_SOLUTION,4,SETTLEMENTDATE,RUNNO,DUID,INTERVENTION,TOTALCLEARED,AVAILABILITY,SEMIDISPATCHCAP
D,DISPATCH,UNIT_SOLUTION,4,\"2025/10/09 10:05:00\",1,COOPGWF1,0,60,100,1
D,DISPATCH,UNIT_SOLUTION,4,\"2025/10/09 10:05:00\",1,ER01,0,600,700,0
";
        let batch = normalize("curtailment5", TableTag::new("DISPATCH", "UNIT_SOLUTION"), payload, None);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(
            batch.records[0].values,
            vec![Some(100.0), Some(60.0), Some(1.0), Some(40.0)]
        );
    }

    #[test]
    fn test_negative_rooftop_power_dropped() {
        let payload = "\
I,ROOFTOP,ACTUAL,2,INTERVAL_DATETIME,REGIONID,POWER,QI,TYPE
D,ROOFTOP,ACTUAL,2,\"2025/10/09 10:30:00\",NSW1,1500.2,1,MEASUREMENT
D,ROOFTOP,ACTUAL,2,\"2025/10/09 10:30:00\",QLD1,-1,1,MEASUREMENT
D,ROOFTOP,ACTUAL,2,\"2025/10/09 10:30:00\",SA1,,1,MEASUREMENT
";
        let batch = normalize("rooftop30", TableTag::new("ROOFTOP", "ACTUAL"), payload, None);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].key, "NSW1");
        assert_eq!(batch.skipped, 2);
    }

    #[test]
    fn test_new_units_discovered_once() {
        let dir = TempDir::new().unwrap();
        let mut entities = KnownEntitySet::load(dir.path().join("known.txt")).unwrap();
        entities.observe(["ER01"]);

        let payload = "\
I,DISPATCH,UNIT_SCADA,1,SETTLEMENTDATE,DUID,SCADAVALUE
D,DISPATCH,UNIT_SCADA,1,\"2025/10/09 10:05:00\",ER01,700
D,DISPATCH,UNIT_SCADA,1,\"2025/10/09 10:05:00\",NEWBESS1,-20
D,DISPATCH,UNIT_SCADA,1,\"2025/10/09 10:10:00\",NEWBESS1,-25
";
        let tag = TableTag::new("DISPATCH", "UNIT_SCADA");
        let batch = normalize("scada5", tag.clone(), payload, Some(&mut entities));
        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.discovered, vec!["NEWBESS1"]);

        let again = normalize("scada5", tag, payload, Some(&mut entities));
        assert!(again.discovered.is_empty());
    }

    #[test]
    fn test_timestamp_formats() {
        assert_eq!(parse_timestamp("\"2025/10/09 10:05:00\""), Some(ts(10, 5)));
        assert_eq!(parse_timestamp("2025-10-09 10:05:00"), Some(ts(10, 5)));
        assert_eq!(parse_timestamp("09/10/2025"), None);
    }
}
