//! GraphML and PROV-JSON exports of an [`AggregationDag`]

use super::AggregationDag;
use rce_common::time::to_iso;
use serde_json::{json, Map, Value};
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

const PROV_NAMESPACE: &str = "http://www.w3.org/ns/prov#";
const RCE_NAMESPACE: &str = "urn:rce:aggregation#";

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// GraphML document (nodes carry level, score, quality; edges carry operation, weight)
pub fn to_graphml(dag: &AggregationDag) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<graphml xmlns=\"http://graphml.graphdrawing.org/xmlns\">\n");
    for (id, target, name, kind) in [
        ("d0", "node", "level", "string"),
        ("d1", "node", "score", "double"),
        ("d2", "node", "quality", "string"),
        ("d3", "node", "timestamp", "string"),
        ("d4", "edge", "operation", "string"),
        ("d5", "edge", "weight", "double"),
        ("d6", "edge", "timestamp", "string"),
    ] {
        let _ = writeln!(
            xml,
            "  <key id=\"{}\" for=\"{}\" attr.name=\"{}\" attr.type=\"{}\"/>",
            id, target, name, kind
        );
    }
    xml.push_str("  <graph edgedefault=\"directed\">\n");

    for node in dag.nodes() {
        let _ = writeln!(xml, "    <node id=\"{}\">", escape_xml(node.node_id()));
        let _ = writeln!(xml, "      <data key=\"d0\">{}</data>", node.level());
        let _ = writeln!(xml, "      <data key=\"d1\">{}</data>", node.score());
        let _ = writeln!(xml, "      <data key=\"d2\">{}</data>", escape_xml(node.quality_level()));
        let _ = writeln!(xml, "      <data key=\"d3\">{}</data>", to_iso(&node.timestamp()));
        xml.push_str("    </node>\n");
    }

    for edge in dag.edges() {
        let _ = writeln!(
            xml,
            "    <edge source=\"{}\" target=\"{}\">",
            escape_xml(&edge.source_id),
            escape_xml(&edge.target_id)
        );
        let _ = writeln!(xml, "      <data key=\"d4\">{}</data>", escape_xml(&edge.operation));
        let _ = writeln!(xml, "      <data key=\"d5\">{}</data>", edge.weight);
        let _ = writeln!(xml, "      <data key=\"d6\">{}</data>", to_iso(&edge.timestamp));
        xml.push_str("    </edge>\n");
    }

    xml.push_str("  </graph>\n</graphml>\n");
    xml
}

/// W3C PROV-JSON: nodes are entities, each edge is an `agg_{i}` activity
pub fn to_prov_json(dag: &AggregationDag) -> Value {
    let mut entity = Map::new();
    for node in dag.nodes() {
        entity.insert(
            node.node_id().to_string(),
            json!({
                "prov:type": "rce:ScoreEntity",
                "rce:level": node.level(),
                "rce:score": node.score(),
                "rce:quality": node.quality_level(),
                "rce:hash": node.compute_hash(),
                "prov:generatedAtTime": to_iso(&node.timestamp()),
            }),
        );
    }

    let mut activity = Map::new();
    let mut generated: Map<String, Value> = Map::new();
    let mut used: Map<String, Value> = Map::new();
    for (i, edge) in dag.edges().iter().enumerate() {
        let activity_id = format!("agg_{}", i);
        activity.insert(
            activity_id.clone(),
            json!({
                "prov:type": format!("rce:{}", edge.operation),
                "rce:weight": edge.weight,
                "prov:startedAtTime": to_iso(&edge.timestamp),
            }),
        );
        push_to(&mut generated, &edge.target_id, json!(activity_id));
        push_to(&mut used, &activity_id, json!(edge.source_id));
    }

    json!({
        "prefix": {"prov": PROV_NAMESPACE, "rce": RCE_NAMESPACE},
        "entity": entity,
        "activity": activity,
        "wasGeneratedBy": generated,
        "used": used,
    })
}

fn push_to(map: &mut Map<String, Value>, key: &str, value: Value) {
    match map.get_mut(key) {
        Some(Value::Array(items)) => items.push(value),
        _ => {
            map.insert(key.to_string(), Value::Array(vec![value]));
        }
    }
}

pub async fn export_graphml(dag: &AggregationDag, path: &Path) -> std::io::Result<()> {
    tokio::fs::write(path, to_graphml(dag)).await?;
    info!(
        path = %path.display(),
        nodes = dag.node_count(),
        edges = dag.edge_count(),
        "Exported aggregation DAG to GraphML"
    );
    Ok(())
}

pub async fn export_prov_json(dag: &AggregationDag, path: &Path) -> std::io::Result<()> {
    let text = serde_json::to_string_pretty(&to_prov_json(dag))?;
    tokio::fs::write(path, text).await?;
    info!(path = %path.display(), "Exported PROV-JSON");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provenance::{NodeLevel, ProvenanceNode};

    fn dag() -> AggregationDag {
        let mut dag = AggregationDag::new();
        dag.add_node(ProvenanceNode::new("Q1", NodeLevel::Micro, 0.8, "BUENO")).unwrap();
        dag.add_node(ProvenanceNode::new("Q<2>", NodeLevel::Micro, 0.6, "ACEPTABLE")).unwrap();
        dag.add_node(ProvenanceNode::new("DIM01", NodeLevel::Dimension, 0.7, "BUENO")).unwrap();
        dag.add_aggregation_edge(&["Q1", "Q<2>"], "DIM01", "weighted_average", &[0.5, 0.5], None)
            .unwrap();
        dag
    }

    #[test]
    fn test_graphml_structure() {
        let xml = to_graphml(&dag());
        assert!(xml.starts_with("<?xml"));
        assert_eq!(xml.matches("<node ").count(), 3);
        assert_eq!(xml.matches("<edge ").count(), 2);
        assert!(xml.contains("Q&lt;2&gt;"));
        assert!(!xml.contains("Q<2>"));
    }

    #[test]
    fn test_prov_json_structure() {
        let prov = to_prov_json(&dag());
        assert_eq!(prov["entity"].as_object().unwrap().len(), 3);
        assert_eq!(prov["activity"]["agg_0"]["prov:type"], "rce:weighted_average");
        assert_eq!(prov["wasGeneratedBy"]["DIM01"], json!(["agg_0", "agg_1"]));
        assert_eq!(prov["used"]["agg_1"], json!(["Q<2>"]));
        assert_eq!(prov["prefix"]["prov"], PROV_NAMESPACE);
    }

    #[tokio::test]
    async fn test_export_files() {
        let dir = tempfile::tempdir().unwrap();
        let dag = dag();
        let graphml = dir.path().join("dag.graphml");
        let prov = dir.path().join("prov.json");
        export_graphml(&dag, &graphml).await.unwrap();
        export_prov_json(&dag, &prov).await.unwrap();

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&prov).unwrap()).unwrap();
        assert_eq!(parsed["activity"].as_object().unwrap().len(), 2);
        assert!(std::fs::read_to_string(&graphml).unwrap().contains("graphml"));
    }
}
