//! Closed set of known table layouts.
//!
//! AEMO has changed column order and presence several times. A header row is matched
//! against the variants registered for its table tag; the most specific variant whose
//! signature columns are all present wins.

use crate::error::{IngestError, Result};
use crate::models::TableTag;

/// One observed layout of one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaVariant {
    pub name: &'static str,
    pub category: &'static str,
    pub table: &'static str,
    /// Header columns that must all be present for this variant to apply
    pub signature: &'static [&'static str],
    pub timestamp: &'static str,
    pub key: &'static str,
    /// Source column per canonical value column; `None` when this layout lacks it
    pub values: &'static [Option<&'static str>],
    /// Keep only rows whose column equals the value, when that column is present
    pub filter: Option<(&'static str, &'static str)>,
}

/// Header positions resolved for one variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    pub variant: &'static str,
    pub timestamp: usize,
    pub key: usize,
    pub values: Vec<Option<usize>>,
    pub filter: Option<(usize, &'static str)>,
}

impl ColumnMap {
    /// Whether a data row passes the variant's row filter
    pub fn accepts(&self, row: &[String]) -> bool {
        match self.filter {
            Some((index, expected)) => row
                .get(index)
                .map(|v| v.trim() == expected)
                .unwrap_or(false),
            None => true,
        }
    }
}

const VARIANTS: &[SchemaVariant] = &[
    SchemaVariant {
        name: "dispatch-price",
        category: "DISPATCH",
        table: "PRICE",
        signature: &["SETTLEMENTDATE", "REGIONID", "RRP", "INTERVENTION"],
        timestamp: "SETTLEMENTDATE",
        key: "REGIONID",
        values: &[Some("RRP")],
        filter: Some(("INTERVENTION", "0")),
    },
    SchemaVariant {
        name: "dispatch-price-legacy",
        category: "DISPATCH",
        table: "PRICE",
        signature: &["SETTLEMENTDATE", "REGIONID", "RRP"],
        timestamp: "SETTLEMENTDATE",
        key: "REGIONID",
        values: &[Some("RRP")],
        filter: None,
    },
    SchemaVariant {
        name: "dispatch-unit-scada",
        category: "DISPATCH",
        table: "UNIT_SCADA",
        signature: &["SETTLEMENTDATE", "DUID", "SCADAVALUE"],
        timestamp: "SETTLEMENTDATE",
        key: "DUID",
        values: &[Some("SCADAVALUE")],
        filter: None,
    },
    SchemaVariant {
        name: "dispatch-interconnectorres",
        category: "DISPATCH",
        table: "INTERCONNECTORRES",
        signature: &[
            "SETTLEMENTDATE",
            "INTERCONNECTORID",
            "METEREDMWFLOW",
            "MWFLOW",
            "EXPORTLIMIT",
            "IMPORTLIMIT",
            "INTERVENTION",
        ],
        timestamp: "SETTLEMENTDATE",
        key: "INTERCONNECTORID",
        values: &[
            Some("METEREDMWFLOW"),
            Some("MWFLOW"),
            Some("EXPORTLIMIT"),
            Some("IMPORTLIMIT"),
        ],
        filter: Some(("INTERVENTION", "0")),
    },
    // pre-2011 files carry flows only
    SchemaVariant {
        name: "dispatch-interconnectorres-legacy",
        category: "DISPATCH",
        table: "INTERCONNECTORRES",
        signature: &["SETTLEMENTDATE", "INTERCONNECTORID", "METEREDMWFLOW", "MWFLOW"],
        timestamp: "SETTLEMENTDATE",
        key: "INTERCONNECTORID",
        values: &[Some("METEREDMWFLOW"), Some("MWFLOW"), None, None],
        filter: None,
    },
    SchemaVariant {
        name: "dispatch-unit-solution",
        category: "DISPATCH",
        table: "UNIT_SOLUTION",
        signature: &["SETTLEMENTDATE", "DUID", "AVAILABILITY", "TOTALCLEARED", "SEMIDISPATCHCAP"],
        timestamp: "SETTLEMENTDATE",
        key: "DUID",
        values: &[Some("AVAILABILITY"), Some("TOTALCLEARED"), Some("SEMIDISPATCHCAP"), None],
        filter: Some(("INTERVENTION", "0")),
    },
    SchemaVariant {
        name: "dispatch-unit-solution-legacy",
        category: "DISPATCH",
        table: "UNIT_SOLUTION",
        signature: &["SETTLEMENTDATE", "DUID", "AVAILABILITY", "TOTALCLEARED"],
        timestamp: "SETTLEMENTDATE",
        key: "DUID",
        values: &[Some("AVAILABILITY"), Some("TOTALCLEARED"), None, None],
        filter: Some(("INTERVENTION", "0")),
    },
    SchemaVariant {
        name: "rooftop-actual",
        category: "ROOFTOP",
        table: "ACTUAL",
        signature: &["INTERVAL_DATETIME", "REGIONID", "POWER"],
        timestamp: "INTERVAL_DATETIME",
        key: "REGIONID",
        values: &[Some("POWER")],
        filter: None,
    },
];

/// Maps `(category, table, header signature)` to a canonical column layout
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    variants: &'static [SchemaVariant],
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::nem()
    }
}

impl SchemaRegistry {
    pub fn nem() -> Self {
        Self { variants: VARIANTS }
    }

    pub fn variants_for<'a>(&'a self, tag: &'a TableTag) -> impl Iterator<Item = &'static SchemaVariant> + 'a {
        self.variants
            .iter()
            .filter(move |v| tag.matches(v.category, v.table))
    }

    /// Pick the variant for a header row and resolve column positions
    pub fn resolve(&self, tag: &TableTag, header: &[String]) -> Result<ColumnMap> {
        let position = |name: &str| header.iter().position(|h| h.trim().eq_ignore_ascii_case(name));

        let variant = self
            .variants_for(tag)
            .filter(|v| v.signature.iter().all(|c| position(c).is_some()))
            .max_by_key(|v| v.signature.len())
            .ok_or_else(|| IngestError::FormatUnrecognized {
                context: tag.to_string(),
                detail: format!("no known layout matches header [{}]", header.join(",")),
            })?;

        // signature guarantees timestamp and key are present
        let timestamp = position(variant.timestamp).ok_or_else(|| missing(tag, variant.timestamp))?;
        let key = position(variant.key).ok_or_else(|| missing(tag, variant.key))?;

        Ok(ColumnMap {
            variant: variant.name,
            timestamp,
            key,
            values: variant
                .values
                .iter()
                .map(|column| column.and_then(|c| position(c)))
                .collect(),
            filter: variant
                .filter
                .and_then(|(column, expected)| position(column).map(|i| (i, expected))),
        })
    }
}

fn missing(tag: &TableTag, column: &str) -> IngestError {
    IngestError::FormatUnrecognized {
        context: tag.to_string(),
        detail: format!("column {} missing", column),
    }
}
