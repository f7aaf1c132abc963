use crate::error::IngestError;
use crate::models::TableTag;
use log::{debug, warn};

/// Rows of one target table sharing the same header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBlock {
    /// Report version from the header row (column 4)
    pub version: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// All blocks for a target tag found in one payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedTable {
    pub blocks: Vec<TableBlock>,
    /// Data rows skipped because their width disagreed with the header
    pub mismatches: usize,
}

impl ParsedTable {
    pub fn row_count(&self) -> usize {
        self.blocks.iter().map(|b| b.rows.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }
}

/// Reader for AEMO MMS-format CSV: `C` comment, `I` header, `D` data rows
pub struct TableParser;

impl TableParser {
    /// Collect data rows for `target`, each paired with its most recent matching header.
    ///
    /// Fields after the four marker columns are kept; rows whose width differs from the
    /// header are logged as schema mismatches and skipped.
    pub fn parse(payload: &str, target: &TableTag) -> ParsedTable {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(payload.as_bytes());

        let mut parsed = ParsedTable::default();
        let mut current: Option<TableBlock> = None;

        for result in reader.records() {
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    warn!("{}: unreadable row skipped: {}", target, e);
                    continue;
                }
            };
            let line = record.position().map(|p| p.line()).unwrap_or(0);

            let marker = record.get(0).unwrap_or("").trim();
            let category = record.get(1).unwrap_or("");
            let table = record.get(2).unwrap_or("");

            match marker {
                "I" if target.matches(category, table) => {
                    if let Some(block) = current.take() {
                        parsed.blocks.push(block);
                    }
                    current = Some(TableBlock {
                        version: record.get(3).unwrap_or("").trim().to_string(),
                        header: record.iter().skip(4).map(|f| f.trim().to_string()).collect(),
                        rows: Vec::new(),
                    });
                }
                "D" if target.matches(category, table) => {
                    let fields: Vec<String> = record.iter().skip(4).map(|f| f.to_string()).collect();
                    match current.as_mut() {
                        Some(block) if block.header.len() == fields.len() => block.rows.push(fields),
                        Some(block) => {
                            let e = IngestError::SchemaMismatch {
                                table: target.to_string(),
                                line,
                                expected: block.header.len(),
                                found: fields.len(),
                            };
                            warn!("{}", e);
                            parsed.mismatches += 1;
                        }
                        None => {
                            warn!("{}: data row at line {} precedes any header", target, line);
                            parsed.mismatches += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(block) = current.take() {
            parsed.blocks.push(block);
        }
        parsed.blocks.retain(|b| !b.rows.is_empty());

        debug!(
            "{}: parsed {} row(s) in {} block(s), {} mismatch(es)",
            target,
            parsed.row_count(),
            parsed.blocks.len(),
            parsed.mismatches
        );
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = "\
C,NEMP.WORLD,DISPATCHIS,AEMO,PUBLIC,2025/10/09,10:00:15,0000000484092400,DISPATCHIS,0000000484092400
I,DISPATCH,CASE_SOLUTION,2,SETTLEMENTDATE,RUNNO,INTERVENTION
D,DISPATCH,CASE_SOLUTION,2,\"2025/10/09 10:05:00\",1,0
I,DISPATCH,PRICE,5,SETTLEMENTDATE,RUNNO,REGIONID,DISPATCHINTERVAL,INTERVENTION,RRP
D,DISPATCH,PRICE,5,\"2025/10/09 10:05:00\",1,NSW1,20251009122,0,87.5
D,DISPATCH,PRICE,5,\"2025/10/09 10:05:00\",1,QLD1,20251009122,0,64.1
D,DISPATCH,PRICE,5,\"2025/10/09 10:05:00\",1,SA1,20251009122,0
I,DISPATCH,INTERCONNECTORRES,3,SETTLEMENTDATE,RUNNO,INTERCONNECTORID,METEREDMWFLOW
D,DISPATCH,INTERCONNECTORRES,3,\"2025/10/09 10:05:00\",1,N-Q-MNSP1,12.5
D,DISPATCH,PRICE,5,\"2025/10/09 10:05:00\",1,VIC1,20251009122,0,55
C,\"END OF REPORT\",11
";

    #[test]
    fn test_selects_target_rows_across_interleaved_tables() {
        let parsed = TableParser::parse(PAYLOAD, &TableTag::new("DISPATCH", "PRICE"));
        assert_eq!(parsed.blocks.len(), 1);
        let block = &parsed.blocks[0];
        assert_eq!(block.version, "5");
        assert_eq!(block.header[2], "REGIONID");
        assert_eq!(block.rows.len(), 3);
        assert_eq!(block.rows[0][0], "2025/10/09 10:05:00");
        assert_eq!(block.rows[2][2], "VIC1");
    }

    #[test]
    fn test_short_row_is_a_mismatch_not_an_abort() {
        let parsed = TableParser::parse(PAYLOAD, &TableTag::new("DISPATCH", "PRICE"));
        assert_eq!(parsed.mismatches, 1);
        assert_eq!(parsed.row_count(), 3);
    }

    #[test]
    fn test_second_header_starts_new_block() {
        let payload = "\
I,ROOFTOP,ACTUAL,2,INTERVAL_DATETIME,REGIONID,POWER
D,ROOFTOP,ACTUAL,2,\"2025/10/09 10:30:00\",NSW1,1500.2
I,ROOFTOP,ACTUAL,3,INTERVAL_DATETIME,REGIONID,POWER,QI
D,ROOFTOP,ACTUAL,3,\"2025/10/09 11:00:00\",NSW1,1600,1
";
        let parsed = TableParser::parse(payload, &TableTag::new("rooftop", "actual"));
        assert_eq!(parsed.blocks.len(), 2);
        assert_eq!(parsed.blocks[1].header.len(), 4);
        assert_eq!(parsed.mismatches, 0);
    }

    #[test]
    fn test_absent_table_yields_nothing() {
        let parsed = TableParser::parse(PAYLOAD, &TableTag::new("DISPATCH", "UNIT_SCADA"));
        assert!(parsed.is_empty());
    }
}
