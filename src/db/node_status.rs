//! Parsing of `cockroach node status --decommission --format=csv` output.
//!
//! The CSV layout is part of cockroach's CLI contract:
//! column 0 is the node id, column 1 the advertised address, column 8
//! `is_live`, column 9 `replicas`, and column 10 `is_decommissioning`.

use crate::controller::{Error, Result};

const COL_ID: usize = 0;
const COL_ADDRESS: usize = 1;
const COL_IS_LIVE: usize = 8;
const COL_REPLICAS: usize = 9;
const COL_IS_DECOMMISSIONING: usize = 10;

/// Decommission-relevant state of one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeDrainStatus {
    pub node_id: u64,
    pub address: String,
    pub is_live: bool,
    pub replicas: u64,
    pub is_decommissioning: bool,
}

impl NodeDrainStatus {
    /// A node is fully drained once it holds no replicas.
    pub fn drained(&self) -> bool {
        self.replicas == 0
    }
}

fn parse_record(record: &csv::StringRecord) -> Result<NodeDrainStatus> {
    let field = |idx: usize| -> Result<&str> {
        record
            .get(idx)
            .ok_or_else(|| Error::Transient(format!("node status CSV missing column {idx}")))
    };

    Ok(NodeDrainStatus {
        node_id: field(COL_ID)?
            .trim()
            .parse()
            .map_err(|e| Error::Transient(format!("bad node id in CSV: {e}")))?,
        address: field(COL_ADDRESS)?.trim().to_string(),
        is_live: field(COL_IS_LIVE)?.trim() == "true",
        replicas: field(COL_REPLICAS)?
            .trim()
            .parse()
            .map_err(|e| Error::Transient(format!("bad replica count in CSV: {e}")))?,
        is_decommissioning: field(COL_IS_DECOMMISSIONING)?.trim() == "true",
    })
}

/// Parse all rows of the node status CSV.
pub fn parse_node_statuses(csv_text: &str) -> Result<Vec<NodeDrainStatus>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(csv_text.as_bytes());

    let mut out = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| Error::Transient(format!("failed to parse node status CSV: {e}")))?;
        if record.len() <= COL_IS_DECOMMISSIONING {
            continue;
        }
        out.push(parse_record(&record)?);
    }
    Ok(out)
}

/// Find the node whose advertised address contains the given host fragment
/// (`<pod>.<statefulset>.<namespace>`).
pub fn find_node_by_host<'a>(
    statuses: &'a [NodeDrainStatus],
    host_fragment: &str,
) -> Option<&'a NodeDrainStatus> {
    statuses.iter().find(|s| s.address.contains(host_fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "id,address,sql_address,build,started_at,updated_at,locality,is_available,is_live,replicas,is_decommissioning,membership,is_draining";

    fn csv_with_rows(rows: &[&str]) -> String {
        let mut text = HEADER.to_string();
        for row in rows {
            text.push('\n');
            text.push_str(row);
        }
        text
    }

    #[test]
    fn test_parse_node_statuses() {
        let text = csv_with_rows(&[
            "1,crdb-0.crdb.default:26258,crdb-0.crdb.default:26257,v24.2.2,2024,2024,,true,true,12,false,active,false",
            "2,crdb-1.crdb.default:26258,crdb-1.crdb.default:26257,v24.2.2,2024,2024,,true,true,3,true,decommissioning,false",
        ]);

        let statuses = parse_node_statuses(&text).expect("parse");
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].node_id, 1);
        assert_eq!(statuses[0].replicas, 12);
        assert!(statuses[0].is_live);
        assert!(!statuses[0].is_decommissioning);

        assert_eq!(statuses[1].node_id, 2);
        assert!(statuses[1].is_decommissioning);
        assert!(!statuses[1].drained());
    }

    #[test]
    fn test_drained_when_no_replicas() {
        let text = csv_with_rows(&[
            "3,crdb-2.crdb.default:26258,crdb-2.crdb.default:26257,v24.2.2,2024,2024,,false,false,0,true,decommissioned,true",
        ]);
        let statuses = parse_node_statuses(&text).expect("parse");
        assert!(statuses[0].drained());
    }

    #[test]
    fn test_find_node_by_host() {
        let text = csv_with_rows(&[
            "1,crdb-0.crdb.default:26258,x,v,2024,2024,,true,true,5,false,active,false",
            "2,crdb-1.crdb.default:26258,x,v,2024,2024,,true,true,5,false,active,false",
        ]);
        let statuses = parse_node_statuses(&text).expect("parse");

        let found = find_node_by_host(&statuses, "crdb-1.crdb.default").expect("node");
        assert_eq!(found.node_id, 2);
        assert!(find_node_by_host(&statuses, "crdb-9.crdb.default").is_none());
    }

    #[test]
    fn test_malformed_csv_is_transient() {
        let text = csv_with_rows(&[
            "oops,addr,x,v,2024,2024,,true,true,5,false,active,false",
        ]);
        let err = parse_node_statuses(&text).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_empty_output() {
        let statuses = parse_node_statuses(HEADER).expect("parse");
        assert!(statuses.is_empty());
    }
}
